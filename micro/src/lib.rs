//! A client-side RPC engine for microservices: registry-backed discovery,
//! node selection, pooled transports, retries and circuit breaking, plus a
//! run loop for the modules of a process.

pub mod cmd;
pub mod logger;

pub use micro_client as client;
pub use micro_protocol as protocol;
pub use micro_registry as registry;
pub use micro_server as server;

pub use micro_client::{new_client, CallOpt, CallScope, Client, ClientExt, Opt, Request, Response};
pub use micro_derive::*;
pub use micro_protocol::*;

pub use cmd::{Module, Runner};
