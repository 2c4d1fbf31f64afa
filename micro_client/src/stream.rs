use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use tracing::debug;

use micro_protocol::{
    Error, Message, MessageType, MicroParam, Protocols, Result, HEADER_ID, ID_CLIENT_CALL,
};

use crate::request::unexpected_frame;
use crate::{CallScope, TransportClient};

/// A bidirectional exchange on a dedicated connection.
///
/// Every message sent carries the headers of the opening request. Closing
/// sends an end-of-stream frame and drops the connection. A failed or timed
/// out send or receive leaves the framing unknown, so it drops the
/// connection too and the stream stays closed.
pub struct Stream {
    id: u64,
    protocols: Protocols,
    header: HashMap<String, String>,
    scope: CallScope,
    timeout: Option<Duration>,
    client: Option<Box<dyn TransportClient>>,
    last: HashMap<String, String>,
    eos: bool,
}

impl Stream {
    pub(crate) fn new(
        id: u64,
        protocols: Protocols,
        header: HashMap<String, String>,
        scope: CallScope,
        timeout: Option<Duration>,
        client: Box<dyn TransportClient>,
    ) -> Self {
        Stream {
            id,
            protocols,
            header,
            scope,
            timeout,
            client: Some(client),
            last: HashMap::new(),
            eos: false,
        }
    }

    /// Sequence id of the opening request.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Header of the last message received.
    pub fn header(&self) -> &HashMap<String, String> {
        &self.last
    }

    pub fn is_closed(&self) -> bool {
        self.client.is_none()
    }

    fn closed() -> Error {
        Error::client_transport("stream closed")
    }

    pub async fn send(&mut self, body: &dyn MicroParam) -> Result<()> {
        let mut msg = Message::new(MessageType::Request);
        msg.header = self.header.clone();
        msg.body = Bytes::from(body.into_bytes(self.protocols.content_type)?);
        let client = self.client.as_mut().ok_or_else(Stream::closed)?;
        let res = self
            .scope
            .run(ID_CLIENT_CALL, async move {
                client.send(&msg).await.map_err(Error::from)
            })
            .await;
        if res.is_err() {
            self.abort().await;
        }
        res
    }

    /// Receives the next message into `rsp`. Returns `false` once the peer
    /// ended the stream.
    pub async fn recv(&mut self, rsp: &mut dyn MicroParam) -> Result<bool> {
        if self.eos {
            return Ok(false);
        }
        let msg = match self.recv_frame().await {
            Ok(msg) => msg,
            Err(err) => {
                self.abort().await;
                return Err(err);
            }
        };
        match msg.kind {
            MessageType::Response => {
                rsp.from_slice(self.protocols.accept, &msg.body)?;
                self.last = msg.header;
                Ok(true)
            }
            MessageType::EndOfStream => {
                self.eos = true;
                self.last = msg.header;
                Ok(false)
            }
            MessageType::Error => Err(Error::parse(&msg.body)),
            _ => Err(unexpected_frame(&msg)),
        }
    }

    async fn recv_frame(&mut self) -> Result<Message> {
        let client = self.client.as_mut().ok_or_else(Stream::closed)?;
        let fut = self.scope.run(ID_CLIENT_CALL, async move {
            client.recv().await.map_err(Error::from)
        });
        match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, fut)
                .await
                .map_err(|_| Error::timeout(ID_CLIENT_CALL, "stream receive timed out"))?,
            None => fut.await,
        }
    }

    /// Drops the connection without the end-of-stream handshake.
    async fn abort(&mut self) {
        if let Some(mut client) = self.client.take() {
            if let Err(err) = client.close().await {
                debug!(stream = self.id, error = %err, "close after failure");
            }
            debug!(stream = self.id, "stream aborted");
        }
    }

    /// Ends the stream. Closing twice is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        let mut client = match self.client.take() {
            Some(client) => client,
            None => return Ok(()),
        };
        let mut eos = Message::new(MessageType::EndOfStream);
        eos.set_header(HEADER_ID, self.id.to_string());
        let sent = client.send(&eos).await;
        let closed = client.close().await;
        debug!(stream = self.id, "stream closed");
        sent.and(closed).map_err(Error::from)
    }
}
