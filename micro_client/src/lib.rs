//! Client side of the micro RPC engine.
//!
//! A [`Client`] resolves a service through a [`Selector`], sends the request
//! to one of its nodes over a pooled [`Transport`] connection and retries
//! failed attempts under the call's deadline.

pub mod breaker;
pub mod broker;
pub mod config;
pub mod context;
pub mod filter;
pub mod options;
pub mod pool;
pub mod request;
pub mod retry;
pub mod rpc_client;
pub mod selector;
pub mod stream;
pub mod transport;
pub mod wrapper;

pub use breaker::*;
pub use broker::*;
pub use config::*;
pub use context::*;
pub use filter::*;
pub use options::*;
pub use pool::*;
pub use request::*;
pub use retry::*;
pub use rpc_client::*;
pub use selector::*;
pub use stream::*;
pub use transport::*;
pub use wrapper::*;

use std::sync::Arc;

use async_trait::async_trait;
use micro_protocol::{MicroParam, Result};

#[async_trait]
pub trait Client: Send + Sync {
    fn opt(&self) -> &Opt;

    /// Calls `req` and decodes the reply body into `rsp` with the accepted
    /// codec.
    async fn call(
        &self,
        scope: &CallScope,
        req: &Request,
        rsp: &mut dyn MicroParam,
        opt: CallOpt,
    ) -> Result<Response>;

    /// Opens a stream on a dedicated connection, sending the request body as
    /// the first message.
    async fn stream(&self, scope: &CallScope, req: &Request, opt: CallOpt) -> Result<Stream>;

    /// Hands the request to the broker when one is configured, otherwise
    /// makes a regular call and drops the reply.
    async fn publish(&self, scope: &CallScope, req: &Request, opt: CallOpt) -> Result<()>;
}

#[async_trait]
pub trait ClientExt: Client {
    /// Calls `req` and returns the decoded reply.
    async fn request<T>(&self, scope: &CallScope, req: &Request, opt: CallOpt) -> Result<T>
    where
        T: MicroParam + Default + 'static,
    {
        let mut rsp = T::default();
        self.call(scope, req, &mut rsp, opt).await?;
        Ok(rsp)
    }
}

impl<C: Client + ?Sized> ClientExt for C {}

/// An [`RpcClient`] over `opt` behind the client wrappers of `opt`.
pub fn new_client(opt: Opt) -> Arc<dyn Client> {
    let wrappers = opt.wrappers.clone();
    wrap_client(Arc::new(RpcClient::new(opt)), &wrappers)
}
