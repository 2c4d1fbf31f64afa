//! Fixtures shared by the integration tests: an in-memory registry, real TCP
//! servers registered in it and a client resolving through it.

use std::sync::Arc;

use micro::client::{no_backoff, Opt, RpcClient};
use micro::registry::{Endpoint, KvRegistry, MemoryStore, RegisterOpt, Registry};
use micro::server::{Server, ServerOpt};
use micro::Request;
use serde_json::Value;

pub const JSON: &str = "application/grpc+json";

pub fn registry() -> Arc<KvRegistry<MemoryStore>> {
    Arc::new(KvRegistry::new(Arc::new(MemoryStore::new())))
}

pub fn login_endpoint(codec: &str) -> Endpoint {
    Endpoint::new("Login").with_codecs(codec, codec)
}

/// Starts a server for `name` at `version` on a free local port, lets
/// `setup` install its handlers and registers it.
pub async fn serve(
    registry: &dyn Registry,
    name: &str,
    version: &str,
    node_id: &str,
    setup: impl FnOnce(&mut Server),
) -> Server {
    let mut server = Server::new(ServerOpt::new(name, version).with_node_id(node_id));
    setup(&mut server);
    server.start().await.expect("server starts");
    server
        .register(registry, RegisterOpt::default())
        .await
        .expect("server registers");
    server
}

/// A client over the default TCP transport without backoff between
/// attempts.
pub fn client(registry: Arc<dyn Registry>) -> RpcClient {
    let mut opt = Opt::new(registry);
    opt.backoff = no_backoff();
    RpcClient::new(opt)
}

pub fn login(user: &str) -> Request {
    Request::new("auth", "Login", serde_json::json!({ "user": user }))
        .with_content_type(JSON, JSON)
        .expect("known codec")
}

pub fn body(value: &Value, key: &str) -> String {
    value[key].as_str().unwrap_or_default().to_owned()
}
