use std::collections::HashMap;
use std::io::{Read, Write};

use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;
use enum_primitive_derive::Primitive;
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use num_traits::{FromPrimitive, ToPrimitive};
use strum_macros::{Display, EnumIter, EnumString};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Error, Result};

const MAGIC_NUMBER: u8 = 0x4d;
const VERSION: u8 = 1;
const PREFIX_LEN: usize = 8;

/// Frames larger than this are rejected before any allocation.
pub const MAX_FRAME_LEN: usize = 64 << 20;

pub const HEADER_CONTENT_TYPE: &str = "Content-Type";
pub const HEADER_ACCEPT: &str = "Accept";
pub const HEADER_HOST: &str = "Host";
pub const HEADER_PRIMARY_KEY: &str = "Micro-Primary-Key";
pub const HEADER_SERVICE: &str = "Micro-Service";
pub const HEADER_METHOD: &str = "Micro-Method";
pub const HEADER_ENDPOINT: &str = "Micro-Endpoint";
pub const HEADER_ID: &str = "Micro-ID";
pub const HEADER_TIMEOUT: &str = "Timeout";
pub const HEADER_AUTHORIZATION: &str = "Authorization";
pub const HEADER_STREAM: &str = "Micro-Stream";

#[derive(Debug, Copy, Clone, Display, PartialEq, Eq, EnumIter, EnumString, Primitive)]
pub enum MessageType {
    Request = 0,
    Response = 1,
    Error = 2,
    EndOfStream = 3,
}

#[derive(Debug, Copy, Clone, Display, PartialEq, Eq, EnumIter, EnumString, Primitive)]
pub enum CompressType {
    CompressNone = 0,
    Gzip = 1,
}

/// One frame on the synchronous transport: a header map, a query multimap
/// and an opaque body.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub kind: MessageType,
    pub compress: CompressType,
    pub header: HashMap<String, String>,
    pub query: Vec<(String, String)>,
    pub body: Bytes,
}

impl Default for Message {
    fn default() -> Self {
        Message::new(MessageType::Request)
    }
}

impl Message {
    /// Creates a new `Message`
    pub fn new(kind: MessageType) -> Message {
        Message {
            kind,
            compress: CompressType::CompressNone,
            header: HashMap::new(),
            query: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// An error frame carrying `err` as its body.
    pub fn error(err: &Error) -> Message {
        let mut msg = Message::new(MessageType::Error);
        msg.body = Bytes::from(err.to_bytes());
        msg
    }

    pub fn get_header(&self, key: &str) -> Option<&str> {
        self.header.get(key).map(String::as_str)
    }

    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.header.insert(key.into(), value.into());
    }

    /// The structured error of an error frame.
    pub fn as_error(&self) -> Option<Error> {
        match self.kind {
            MessageType::Error => Some(Error::parse(&self.body)),
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = match self.compress {
            CompressType::CompressNone => self.body.to_vec(),
            CompressType::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(&self.body).map_err(protocol_error)?;
                encoder.finish().map_err(protocol_error)?
            }
        };

        let mut payload = Vec::with_capacity(64 + body.len());
        write_len(&mut payload, self.header.len());
        // sorted so equal messages encode to equal bytes
        let mut header: Vec<_> = self.header.iter().collect();
        header.sort();
        for (k, v) in header {
            write_str(&mut payload, k);
            write_str(&mut payload, v);
        }
        write_len(&mut payload, self.query.len());
        for (k, v) in &self.query {
            write_str(&mut payload, k);
            write_str(&mut payload, v);
        }
        write_len(&mut payload, body.len());
        payload.extend_from_slice(&body);

        if payload.len() > MAX_FRAME_LEN {
            return Err(protocol_error(format!(
                "frame of {} bytes exceeds limit",
                payload.len()
            )));
        }

        let mut data = Vec::with_capacity(PREFIX_LEN + payload.len());
        data.push(MAGIC_NUMBER);
        data.push(VERSION);
        data.push(self.kind.to_u8().unwrap_or_default());
        data.push(self.compress.to_u8().unwrap_or_default());
        write_len(&mut data, payload.len());
        data.extend_from_slice(&payload);
        Ok(data)
    }

    /// Decodes one complete frame.
    pub fn decode(data: &[u8]) -> Result<Message> {
        if data.len() < PREFIX_LEN {
            return Err(protocol_error("short frame"));
        }
        let (kind, compress, len) = parse_prefix(&data[..PREFIX_LEN])?;
        if data.len() != PREFIX_LEN + len {
            return Err(protocol_error("frame length mismatch"));
        }
        Message::parse(kind, compress, &data[PREFIX_LEN..])
    }

    /// Reads one frame from `r`.
    pub async fn read_from<R>(r: &mut R) -> std::io::Result<Message>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut prefix = [0u8; PREFIX_LEN];
        r.read_exact(&mut prefix).await?;
        let (kind, compress, len) = parse_prefix(&prefix).map_err(into_io)?;
        let mut buf = vec![0u8; len];
        r.read_exact(&mut buf).await?;
        Message::parse(kind, compress, &buf).map_err(into_io)
    }

    /// Writes this frame to `w` and flushes it.
    pub async fn write_to<W>(&self, w: &mut W) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let data = self.encode().map_err(into_io)?;
        w.write_all(&data).await?;
        w.flush().await
    }

    fn parse(kind: MessageType, compress: CompressType, buf: &[u8]) -> Result<Message> {
        let mut cursor = Cursor { buf, pos: 0 };

        let mut header = HashMap::new();
        let count = cursor.read_len()?;
        for _ in 0..count {
            let k = cursor.read_str()?;
            let v = cursor.read_str()?;
            header.insert(k, v);
        }

        let count = cursor.read_len()?;
        let mut query = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            let k = cursor.read_str()?;
            let v = cursor.read_str()?;
            query.push((k, v));
        }

        let len = cursor.read_len()?;
        let raw = cursor.read_bytes(len)?;
        let body = match compress {
            CompressType::CompressNone => Bytes::copy_from_slice(raw),
            CompressType::Gzip => {
                let mut out = Vec::new();
                GzDecoder::new(raw)
                    .read_to_end(&mut out)
                    .map_err(protocol_error)?;
                Bytes::from(out)
            }
        };

        Ok(Message {
            kind,
            compress,
            header,
            query,
            body,
        })
    }
}

fn parse_prefix(prefix: &[u8]) -> Result<(MessageType, CompressType, usize)> {
    if prefix[0] != MAGIC_NUMBER {
        return Err(protocol_error(format!("bad magic number {:#x}", prefix[0])));
    }
    if prefix[1] != VERSION {
        return Err(protocol_error(format!("unsupported version {}", prefix[1])));
    }
    let kind = MessageType::from_u8(prefix[2])
        .ok_or_else(|| protocol_error(format!("unknown message type {}", prefix[2])))?;
    let compress = CompressType::from_u8(prefix[3])
        .ok_or_else(|| protocol_error(format!("unknown compress type {}", prefix[3])))?;
    let len = BigEndian::read_u32(&prefix[4..8]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(protocol_error(format!("frame of {} bytes exceeds limit", len)));
    }
    Ok((kind, compress, len))
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| protocol_error("truncated frame"))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn read_len(&mut self) -> Result<usize> {
        let b = self.read_bytes(4)?;
        Ok(BigEndian::read_u32(b) as usize)
    }

    fn read_str(&mut self) -> Result<String> {
        let len = self.read_len()?;
        let b = self.read_bytes(len)?;
        std::str::from_utf8(b)
            .map(str::to_owned)
            .map_err(protocol_error)
    }
}

fn write_len(buf: &mut Vec<u8>, len: usize) {
    let mut b = [0u8; 4];
    BigEndian::write_u32(&mut b, len as u32);
    buf.extend_from_slice(&b);
}

fn write_str(buf: &mut Vec<u8>, s: &str) {
    write_len(buf, s.len());
    buf.extend_from_slice(s.as_bytes());
}

fn protocol_error<E: ToString>(err: E) -> Error {
    Error::client_transport(format!("protocol: {}", err.to_string()))
}

fn into_io(err: Error) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, err)
}
