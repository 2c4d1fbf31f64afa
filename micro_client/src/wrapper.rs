use std::sync::Arc;

use futures::future::BoxFuture;

use micro_protocol::{Message, Result};
use micro_registry::Node;

use crate::{CallScope, Client};

/// The per-attempt call: sends a prepared message to a resolved node and
/// returns the reply frame.
pub type CallFunc = Arc<dyn Fn(CallScope, Node, Message) -> BoxFuture<'static, Result<Message>> + Send + Sync>;

/// Middleware around [`CallFunc`].
pub type CallWrapper = Arc<dyn Fn(CallFunc) -> CallFunc + Send + Sync>;

/// Middleware around a whole [`Client`].
pub type ClientWrapper = Arc<dyn Fn(Arc<dyn Client>) -> Arc<dyn Client> + Send + Sync>;

/// Wraps `inner` so that the last wrapper registered runs first.
pub fn wrap_call(inner: CallFunc, wrappers: &[CallWrapper]) -> CallFunc {
    wrappers.iter().fold(inner, |f, w| w(f))
}

/// Wraps `client` so that the last wrapper registered runs first.
pub fn wrap_client(client: Arc<dyn Client>, wrappers: &[ClientWrapper]) -> Arc<dyn Client> {
    wrappers.iter().fold(client, |c, w| w(c))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use micro_protocol::MessageType;
    use std::sync::Mutex;

    fn tracing_wrapper(name: &'static str, log: Arc<Mutex<Vec<&'static str>>>) -> CallWrapper {
        Arc::new(move |next: CallFunc| {
            let log = log.clone();
            let wrapped: CallFunc = Arc::new(move |scope, node, msg| {
                log.lock().unwrap().push(name);
                next(scope, node, msg)
            });
            wrapped
        })
    }

    #[tokio::test]
    async fn last_registered_runs_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let inner: CallFunc = {
            let log = log.clone();
            Arc::new(move |_, _, _| {
                log.lock().unwrap().push("inner");
                async { Ok(Message::new(MessageType::Response)) }.boxed()
            })
        };
        let call = wrap_call(
            inner,
            &[
                tracing_wrapper("first", log.clone()),
                tracing_wrapper("second", log.clone()),
            ],
        );
        call(
            CallScope::new(),
            Node::new("n", "1.0.0", "h:1"),
            Message::new(MessageType::Request),
        )
        .await
        .unwrap();
        assert_eq!(vec!["second", "first", "inner"], *log.lock().unwrap());
    }
}
