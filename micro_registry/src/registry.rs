use std::time::Duration;

use async_trait::async_trait;
use strum_macros::{Display, EnumString};

use crate::{Result, Service};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Action {
    Create,
    Update,
    Delete,
}

/// One change observed by a [`Watcher`]. For deletes, `service` holds the
/// record as it was before removal.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub action: Action,
    pub service: Service,
}

#[derive(Debug, Clone, Default)]
pub struct RegisterOpt {
    /// Lease attached to each node record; `None` registers without expiry.
    pub ttl: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct WatchOpt {
    /// Restrict events to one service name.
    pub service: Option<String>,
}

/// Read-through view over a discovery backend.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Idempotent per (service, node): unchanged records only refresh their lease.
    async fn register(&self, service: &Service, opt: RegisterOpt) -> Result<()>;
    async fn deregister(&self, service: &Service) -> Result<()>;
    /// One [`Service`] per distinct version, nodes aggregated across records.
    async fn get_service(&self, name: &str) -> Result<Vec<Service>>;
    /// Sorted by name, merged by (name, version).
    async fn list_services(&self) -> Result<Vec<Service>>;
    async fn watch(&self, opt: WatchOpt) -> Result<Box<dyn Watcher>>;
    fn name(&self) -> &str;
}

/// A blocking iterator over registry changes, ending with
/// [`RegistryError::WatcherStopped`](crate::RegistryError::WatcherStopped) once stopped.
#[async_trait]
pub trait Watcher: Send {
    async fn next(&mut self) -> Result<Event>;
    fn stop(&self);
}
