use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Logical ids naming the boundary that normalized an error.
pub const ID_CLIENT_CALL: &str = "client.call";
pub const ID_CLIENT_SELECTOR: &str = "client.selector";
pub const ID_CLIENT_TRANSPORT: &str = "client.transport";
pub const ID_CLIENT_BREAKER: &str = "client.breaker";
pub const ID_CLIENT_CODEC: &str = "client.codec";
pub const ID_SERVER_HANDLER: &str = "server.handler";

/// Classification of an [`Error`], derived from its code and id.
#[derive(Debug, Copy, Clone, Display, PartialEq, Eq, Hash, EnumIter, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum ErrorKind {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    Timeout,
    Conflict,
    InternalServerError,
    BadGateway,
    ServiceUnavailable,
    ClientTransport,
    Other,
}

/// The structured error every call boundary normalizes to.
///
/// It travels verbatim in error frames, so a callee's error reaches the caller
/// with its original id and code.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{id}: {detail} ({code} {status})")]
pub struct Error {
    pub id: String,
    pub code: u16,
    pub detail: String,
    pub status: String,
}

impl Error {
    pub fn new(id: impl Into<String>, detail: impl Into<String>, code: u16) -> Self {
        Error {
            id: id.into(),
            code,
            detail: detail.into(),
            status: status_text(code).to_owned(),
        }
    }

    pub fn bad_request(id: impl Into<String>, detail: impl Into<String>) -> Self {
        Error::new(id, detail, 400)
    }

    pub fn unauthorized(id: impl Into<String>, detail: impl Into<String>) -> Self {
        Error::new(id, detail, 401)
    }

    pub fn forbidden(id: impl Into<String>, detail: impl Into<String>) -> Self {
        Error::new(id, detail, 403)
    }

    pub fn not_found(id: impl Into<String>, detail: impl Into<String>) -> Self {
        Error::new(id, detail, 404)
    }

    pub fn timeout(id: impl Into<String>, detail: impl Into<String>) -> Self {
        Error::new(id, detail, 408)
    }

    pub fn conflict(id: impl Into<String>, detail: impl Into<String>) -> Self {
        Error::new(id, detail, 409)
    }

    pub fn internal_server_error(id: impl Into<String>, detail: impl Into<String>) -> Self {
        Error::new(id, detail, 500)
    }

    pub fn bad_gateway(id: impl Into<String>, detail: impl Into<String>) -> Self {
        Error::new(id, detail, 502)
    }

    pub fn service_unavailable(id: impl Into<String>, detail: impl Into<String>) -> Self {
        Error::new(id, detail, 503)
    }

    /// Low-level dial or IO failure; reported as a 500 so retry policies treat it as transient.
    pub fn client_transport(detail: impl Into<String>) -> Self {
        Error::new(ID_CLIENT_TRANSPORT, detail, 500)
    }

    pub fn kind(&self) -> ErrorKind {
        if self.id == ID_CLIENT_TRANSPORT {
            return ErrorKind::ClientTransport;
        }
        match self.code {
            400 => ErrorKind::BadRequest,
            401 => ErrorKind::Unauthorized,
            403 => ErrorKind::Forbidden,
            404 => ErrorKind::NotFound,
            408 => ErrorKind::Timeout,
            409 => ErrorKind::Conflict,
            500 => ErrorKind::InternalServerError,
            502 => ErrorKind::BadGateway,
            503 => ErrorKind::ServiceUnavailable,
            _ => ErrorKind::Other,
        }
    }

    pub fn is_server_error(&self) -> bool {
        self.code >= 500
    }

    /// Re-labels the error with the id of the boundary that normalized it.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // a struct of strings and an integer always serializes
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Parses an error frame body. Bodies that are not a structured error are
    /// kept as the detail of an internal error.
    pub fn parse(data: &[u8]) -> Error {
        match serde_json::from_slice::<Error>(data) {
            Ok(mut err) => {
                if err.status.is_empty() {
                    err.status = status_text(err.code).to_owned();
                }
                err
            }
            Err(_) => Error::internal_server_error(
                ID_CLIENT_CALL,
                String::from_utf8_lossy(data).into_owned(),
            ),
        }
    }
}

pub fn status_text(code: u16) -> &'static str {
    match code {
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        408 => "Request Timeout",
        409 => "Conflict",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "",
    }
}
