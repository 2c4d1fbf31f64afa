use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

use micro_protocol::{Error, Message};

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("broker closed")]
    Closed,

    #[error("broker transport: {0}")]
    Transport(String),
}

impl From<BrokerError> for Error {
    fn from(err: BrokerError) -> Self {
        Error::internal_server_error(micro_protocol::ID_CLIENT_CALL, err.to_string())
    }
}

/// Asynchronous delivery of messages by topic.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, topic: &str, msg: Message) -> Result<(), BrokerError>;

    async fn subscribe(&self, topic: &str) -> Result<broadcast::Receiver<Message>, BrokerError>;

    fn name(&self) -> &str;
}

/// The topic events for a service are published on. A pinned node gets its
/// own topic; otherwise the service major names it.
pub fn topic(service: &str, major: u32, node: Option<&str>) -> String {
    match node {
        Some(node) => format!("{}.node-{}.endpoints", service, node),
        None => format!("{}.v{}.endpoints", service, major),
    }
}

const DEFAULT_CAPACITY: usize = 256;

/// In-process broker. Messages published with no subscriber are dropped.
pub struct MemoryBroker {
    capacity: usize,
    topics: Mutex<HashMap<String, broadcast::Sender<Message>>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        MemoryBroker::new(DEFAULT_CAPACITY)
    }
}

impl MemoryBroker {
    pub fn new(capacity: usize) -> Self {
        MemoryBroker {
            capacity,
            topics: Mutex::new(HashMap::new()),
        }
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Message> {
        let mut topics = self
            .topics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        topics
            .entry(topic.to_owned())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, topic: &str, msg: Message) -> Result<(), BrokerError> {
        if self.sender(topic).send(msg).is_err() {
            debug!(topic = %topic, "no subscribers, message dropped");
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<broadcast::Receiver<Message>, BrokerError> {
        Ok(self.sender(topic).subscribe())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
