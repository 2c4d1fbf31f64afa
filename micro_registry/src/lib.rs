//! Service discovery: the registry data model, a KV-backed registry and the
//! TTL cache the client resolves services through.

pub mod cache;
pub mod error;
pub mod kv;
pub mod kv_registry;
pub mod registry;
pub mod service;
pub mod util;
pub mod version;

pub use cache::*;
pub use error::*;
pub use kv::*;
pub use kv_registry::*;
pub use registry::*;
pub use service::*;
pub use version::*;
