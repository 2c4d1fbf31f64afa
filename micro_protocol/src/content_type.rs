use std::str::FromStr;

use strum_macros::{AsRefStr, Display, EnumIter, EnumString};

use crate::{Error, Result, ID_CLIENT_CODEC};

/// Canonical codec tokens. Aliases are accepted when parsing and normalized
/// to the canonical form when displayed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Display, AsRefStr, EnumIter, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum ContentType {
    #[strum(to_string = "application/grpc+json", serialize = "application/json")]
    Json,
    #[strum(
        to_string = "application/grpc+proto",
        serialize = "application/protobuf",
        serialize = "application/grpc"
    )]
    Proto,
    #[strum(
        to_string = "application/grpc+bytes",
        serialize = "application/octet-stream"
    )]
    Bytes,
    #[strum(to_string = "application/grpc+msgpack", serialize = "application/msgpack")]
    MsgPack,
}

impl Default for ContentType {
    fn default() -> Self {
        ContentType::Json
    }
}

impl ContentType {
    /// Parses a header value, ignoring parameters such as `; charset=utf-8`.
    pub fn parse(s: &str) -> Result<ContentType> {
        let token = s.split(';').next().unwrap_or_default().trim();
        ContentType::from_str(token).map_err(|_| {
            Error::bad_request(ID_CLIENT_CODEC, format!("unsupported content type {:?}", s))
        })
    }

    /// Normalizes an alias to its canonical token. Unknown tokens pass through.
    pub fn normalize(s: &str) -> String {
        match ContentType::parse(s) {
            Ok(ct) => ct.to_string(),
            Err(_) => s.to_owned(),
        }
    }
}

/// Two tokens match when they resolve to the same canonical form.
pub fn content_type_matches(a: &str, b: &str) -> bool {
    match (ContentType::parse(a), ContentType::parse(b)) {
        (Ok(x), Ok(y)) => x == y,
        _ => a == b,
    }
}

/// The negotiated (content-type, accept) pair of one request.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct Protocols {
    pub content_type: ContentType,
    pub accept: ContentType,
}

impl Protocols {
    pub fn new(content_type: ContentType, accept: ContentType) -> Self {
        Protocols {
            content_type,
            accept,
        }
    }

    /// Same codec for both directions.
    pub fn symmetric(content_type: ContentType) -> Self {
        Protocols::new(content_type, content_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn aliases_normalize() {
        assert_eq!(ContentType::Json, ContentType::parse("application/json").unwrap());
        assert_eq!(
            ContentType::Proto,
            ContentType::parse("application/protobuf").unwrap()
        );
        assert_eq!(
            ContentType::Bytes,
            ContentType::parse("application/octet-stream").unwrap()
        );
        assert_eq!(
            ContentType::Json,
            ContentType::parse("Application/JSON; charset=utf-8").unwrap()
        );
        assert_eq!(
            "application/grpc+json",
            ContentType::normalize("application/json")
        );
        assert_eq!("text/plain", ContentType::normalize("text/plain"));
    }

    #[test]
    fn unknown_is_bad_request() {
        let err = ContentType::parse("text/html").unwrap_err();
        assert_eq!(400, err.code);
    }

    #[test]
    fn matching_is_reflexive_and_symmetric() {
        let tokens = [
            "application/grpc+json",
            "application/json",
            "application/grpc+proto",
            "application/protobuf",
            "application/grpc+bytes",
            "application/octet-stream",
            "application/grpc+msgpack",
            "text/plain",
        ];
        for a in tokens.iter() {
            assert!(content_type_matches(a, a), "{} should match itself", a);
            for b in tokens.iter() {
                assert_eq!(content_type_matches(a, b), content_type_matches(b, a));
            }
        }
        assert!(content_type_matches("application/json", "application/grpc+json"));
        assert!(!content_type_matches("application/json", "application/grpc+proto"));
    }

    #[test]
    fn canonical_tokens_roundtrip() {
        for ct in ContentType::iter() {
            assert_eq!(ct, ContentType::parse(&ct.to_string()).unwrap());
        }
    }
}
