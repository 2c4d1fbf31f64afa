use std::io;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use micro_protocol::{Error, Message};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("malformed address {0:?}")]
    BadAddress(String),

    #[error("dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("dial {0}: timed out")]
    DialTimeout(String),

    #[error("transport io: {0}")]
    Io(#[from] io::Error),

    #[error("connection closed")]
    Closed,
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::BadAddress(_) => {
                Error::bad_request(micro_protocol::ID_CLIENT_TRANSPORT, err.to_string())
            }
            _ => Error::client_transport(err.to_string()),
        }
    }
}

/// Dials connections carrying [`Message`] frames.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn dial(
        &self,
        addr: &str,
        timeout: Duration,
    ) -> Result<Box<dyn TransportClient>, TransportError>;

    fn name(&self) -> &str;
}

/// One dialed connection.
#[async_trait]
pub trait TransportClient: Send {
    async fn send(&mut self, msg: &Message) -> Result<(), TransportError>;

    async fn recv(&mut self) -> Result<Message, TransportError>;

    /// Completes the current exchange so the connection can idle in a pool.
    /// Buffered writes are flushed. The write side is not half-closed, so
    /// the connection can carry the next exchange.
    async fn quiesce(&mut self) -> Result<(), TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;

    fn remote(&self) -> &str;
}

/// Checks `addr` is a `host:port` pair.
pub fn check_address(addr: &str) -> Result<(), TransportError> {
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(()),
        _ => Err(TransportError::BadAddress(addr.to_owned())),
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        TcpTransport
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn dial(
        &self,
        addr: &str,
        timeout: Duration,
    ) -> Result<Box<dyn TransportClient>, TransportError> {
        check_address(addr)?;
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(TransportError::Dial {
                    addr: addr.to_owned(),
                    source,
                })
            }
            Err(_) => return Err(TransportError::DialTimeout(addr.to_owned())),
        };
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Box::new(TcpClient {
            addr: addr.to_owned(),
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
            closed: false,
        }))
    }

    fn name(&self) -> &str {
        "tcp"
    }
}

struct TcpClient {
    addr: String,
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
    closed: bool,
}

#[async_trait]
impl TransportClient for TcpClient {
    async fn send(&mut self, msg: &Message) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        msg.write_to(&mut self.writer).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Message, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        match Message::read_from(&mut self.reader).await {
            Ok(msg) => Ok(msg),
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Err(TransportError::Closed),
            Err(err) => Err(err.into()),
        }
    }

    // flush only; a half-close would end the connection for the next caller
    async fn quiesce(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.writer.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.writer.shutdown().await?;
        Ok(())
    }

    fn remote(&self) -> &str {
        &self.addr
    }
}
