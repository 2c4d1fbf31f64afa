use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use qstring::QString;

use micro_protocol::{
    ContentType, Error, Message, MessageType, MicroParam, Protocols, Result, HEADER_ENDPOINT,
    HEADER_ID, HEADER_SERVICE, ID_CLIENT_CALL,
};
use micro_registry::Version;

/// One call to a service endpoint.
///
/// The body is kept unencoded and serialized with the negotiated content type
/// on every attempt.
#[derive(Debug, Clone)]
pub struct Request {
    service: String,
    endpoint: String,
    method: String,
    version: Option<Version>,
    protocols: Protocols,
    primary_key: Option<String>,
    header: HashMap<String, String>,
    query: Vec<(String, String)>,
    body: Arc<dyn MicroParam>,
}

impl Request {
    pub fn new(
        service: impl Into<String>,
        endpoint: impl Into<String>,
        body: impl MicroParam + 'static,
    ) -> Self {
        let endpoint = endpoint.into();
        Request {
            service: service.into(),
            method: endpoint.clone(),
            endpoint,
            version: None,
            protocols: Protocols::default(),
            primary_key: None,
            header: HashMap::new(),
            query: Vec::new(),
            body: Arc::new(body),
        }
    }

    /// Sets the negotiated codecs from header tokens. Aliases are normalized;
    /// an empty `accept` means the same codec as `content_type`.
    pub fn with_content_type(mut self, content_type: &str, accept: &str) -> Result<Self> {
        let content_type = ContentType::parse(content_type)?;
        let accept = if accept.is_empty() {
            content_type
        } else {
            ContentType::parse(accept)?
        };
        self.protocols = Protocols::new(content_type, accept);
        Ok(self)
    }

    pub fn with_protocols(mut self, protocols: Protocols) -> Self {
        self.protocols = protocols;
        self
    }

    /// Restricts selection to services of the same major version and to nodes
    /// whose bounds admit `version`.
    pub fn with_version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn with_primary_key(mut self, key: impl Into<String>) -> Self {
        self.primary_key = Some(key.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.header.insert(key.into(), value.into());
        self
    }

    /// Appends the pairs of a raw query string such as `a=1&b=2&a=3`.
    pub fn with_query(mut self, raw: &str) -> Self {
        let qs = QString::from(raw);
        self.query.extend(qs.into_pairs());
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn version(&self) -> Option<&Version> {
        self.version.as_ref()
    }

    pub fn protocols(&self) -> Protocols {
        self.protocols
    }

    pub fn content_type(&self) -> ContentType {
        self.protocols.content_type
    }

    pub fn accept(&self) -> ContentType {
        self.protocols.accept
    }

    pub fn primary_key(&self) -> Option<&str> {
        self.primary_key.as_deref()
    }

    pub fn header(&self) -> &HashMap<String, String> {
        &self.header
    }

    pub fn query(&self) -> &[(String, String)] {
        &self.query
    }

    pub fn body(&self) -> &dyn MicroParam {
        self.body.as_ref()
    }

    /// The body serialized with the request content type.
    pub fn encode_body(&self) -> Result<Vec<u8>> {
        self.body.into_bytes(self.protocols.content_type)
    }
}

/// The raw reply of a successful call.
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub header: HashMap<String, String>,
    pub body: Bytes,
}

impl Response {
    pub(crate) fn from_message(msg: Message) -> Result<Self> {
        match msg.kind {
            MessageType::Response => Ok(Response {
                header: msg.header,
                body: msg.body,
            }),
            MessageType::Error => Err(Error::parse(&msg.body)),
            _ => Err(unexpected_frame(&msg)),
        }
    }

    pub fn get_header(&self, key: &str) -> Option<&str> {
        self.header.get(key).map(String::as_str)
    }

    pub fn service(&self) -> Option<&str> {
        self.get_header(HEADER_SERVICE)
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.get_header(HEADER_ENDPOINT)
    }

    /// The sequence id the reply answers.
    pub fn id(&self) -> Option<u64> {
        self.get_header(HEADER_ID).and_then(|v| v.parse().ok())
    }

    pub fn decode(&self, ct: ContentType, rsp: &mut dyn MicroParam) -> Result<()> {
        rsp.from_slice(ct, &self.body)
    }
}

/// Error for a reply that is neither a response nor an error frame.
pub(crate) fn unexpected_frame(msg: &Message) -> Error {
    Error::internal_server_error(ID_CLIENT_CALL, format!("unexpected {} frame", msg.kind))
}
