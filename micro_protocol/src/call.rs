use std::fmt::Debug;

use bytes::{Bytes, BytesMut};
use serde::{de::DeserializeOwned, Serialize};

use crate::{ContentType, Error, Result, ID_CLIENT_CODEC};

/// A value that can travel as a request or response body.
///
/// Implemented by `#[derive(MicroParam)]` for serde types and by the raw byte
/// containers, which pass bodies through untouched whatever the codec.
pub trait MicroParam: Debug + Send + Sync {
    fn into_bytes(&self, ct: ContentType) -> Result<Vec<u8>>;
    fn from_slice(&mut self, ct: ContentType, data: &[u8]) -> Result<()>;
}

impl MicroParam for BytesMut {
    fn into_bytes(&self, _: ContentType) -> Result<Vec<u8>> {
        Ok(self.to_vec())
    }
    fn from_slice(&mut self, _: ContentType, data: &[u8]) -> Result<()> {
        self.clear();
        self.extend_from_slice(data);
        Ok(())
    }
}

impl MicroParam for Bytes {
    fn into_bytes(&self, _: ContentType) -> Result<Vec<u8>> {
        Ok(self.to_vec())
    }
    fn from_slice(&mut self, _: ContentType, data: &[u8]) -> Result<()> {
        *self = Bytes::copy_from_slice(data);
        Ok(())
    }
}

impl MicroParam for Vec<u8> {
    fn into_bytes(&self, _: ContentType) -> Result<Vec<u8>> {
        Ok(self.clone())
    }
    fn from_slice(&mut self, _: ContentType, data: &[u8]) -> Result<()> {
        self.clear();
        self.extend_from_slice(data);
        Ok(())
    }
}

impl MicroParam for serde_json::Value {
    fn into_bytes(&self, ct: ContentType) -> Result<Vec<u8>> {
        encode_serde(self, ct)
    }
    fn from_slice(&mut self, ct: ContentType, data: &[u8]) -> Result<()> {
        *self = decode_serde(ct, data)?;
        Ok(())
    }
}

/// Encodes a serde value with the codec named by `ct`.
pub fn encode_serde<T: Serialize + ?Sized>(value: &T, ct: ContentType) -> Result<Vec<u8>> {
    match ct {
        ContentType::Json => serde_json::to_vec(value)
            .map_err(|err| Error::bad_request(ID_CLIENT_CODEC, err.to_string())),
        ContentType::MsgPack => rmp_serde::to_vec_named(value)
            .map_err(|err| Error::bad_request(ID_CLIENT_CODEC, err.to_string())),
        other => Err(unsupported(other)),
    }
}

/// Decodes a serde value with the codec named by `ct`.
pub fn decode_serde<T: DeserializeOwned>(ct: ContentType, data: &[u8]) -> Result<T> {
    match ct {
        ContentType::Json => serde_json::from_slice(data)
            .map_err(|err| Error::bad_request(ID_CLIENT_CODEC, err.to_string())),
        ContentType::MsgPack => rmp_serde::from_slice(data)
            .map_err(|err| Error::bad_request(ID_CLIENT_CODEC, err.to_string())),
        other => Err(unsupported(other)),
    }
}

fn unsupported(ct: ContentType) -> Error {
    Error::bad_request(
        ID_CLIENT_CODEC,
        format!("codec {} is not available for serde types", ct),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn raw_bodies_ignore_codec() {
        let body = BytesMut::from(&b"raw"[..]);
        assert_eq!(b"raw".to_vec(), body.into_bytes(ContentType::Proto).unwrap());

        let mut out = Vec::new();
        out.from_slice(ContentType::Json, b"{not json").unwrap();
        assert_eq!(b"{not json".to_vec(), out);
    }

    #[test]
    fn json_value_through_msgpack() {
        let value = json!({"ok": true, "n": 3});
        let data = value.into_bytes(ContentType::MsgPack).unwrap();
        let mut back = serde_json::Value::Null;
        back.from_slice(ContentType::MsgPack, &data).unwrap();
        assert_eq!(value, back);
    }

    #[test]
    fn decode_failure_is_bad_request() {
        let mut value = serde_json::Value::Null;
        let err = value.from_slice(ContentType::Json, b"{").unwrap_err();
        assert_eq!(400, err.code);

        let err = json!(1).into_bytes(ContentType::Proto).unwrap_err();
        assert_eq!(400, err.code);
    }
}
