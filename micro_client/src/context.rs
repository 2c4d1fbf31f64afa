use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use opentelemetry::propagation::{Extractor, Injector};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use micro_protocol::{Error, Result};

/// Everything a call carries across component boundaries: cancellation, an
/// optional deadline, propagated metadata and the trace context.
///
/// Scopes form a tree. A child shares cancellation with its parent and may
/// only shorten the deadline; cancelling a child leaves the parent running.
#[derive(Clone, Debug)]
pub struct CallScope {
    token: CancellationToken,
    deadline: Option<Instant>,
    metadata: HashMap<String, String>,
    trace: opentelemetry::Context,
}

impl Default for CallScope {
    fn default() -> Self {
        CallScope::new()
    }
}

impl CallScope {
    /// A root scope without deadline.
    pub fn new() -> Self {
        CallScope {
            token: CancellationToken::new(),
            deadline: None,
            metadata: HashMap::new(),
            trace: opentelemetry::Context::new(),
        }
    }

    /// A root scope cancelled together with `token`.
    pub fn with_token(token: CancellationToken) -> Self {
        CallScope {
            token,
            ..CallScope::new()
        }
    }

    pub fn child(&self) -> CallScope {
        CallScope {
            token: self.token.child_token(),
            deadline: self.deadline,
            metadata: self.metadata.clone(),
            trace: self.trace.clone(),
        }
    }

    /// A child whose deadline is at most `timeout` from now.
    pub fn with_timeout(&self, timeout: Duration) -> CallScope {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(&self, at: Instant) -> CallScope {
        let mut child = self.child();
        child.deadline = Some(match self.deadline {
            Some(current) if current < at => current,
            _ => at,
        });
        child
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_trace(mut self, cx: opentelemetry::Context) -> Self {
        self.trace = cx;
        self
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    pub fn trace_context(&self) -> &opentelemetry::Context {
        &self.trace
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; zero once it passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn is_done(&self) -> bool {
        self.token.is_cancelled() || matches!(self.remaining(), Some(d) if d.is_zero())
    }

    /// Resolves once the scope is cancelled or its deadline passes.
    pub async fn done(&self) {
        match self.deadline {
            Some(at) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep_until(at) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }

    /// The error reported by work interrupted by this scope.
    pub fn err(&self, id: &str) -> Error {
        if self.token.is_cancelled() {
            Error::timeout(id, "context canceled")
        } else {
            Error::timeout(id, "context deadline exceeded")
        }
    }

    /// Runs `fut` unless the scope ends first.
    pub async fn run<T, F>(&self, id: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            res = fut => res,
            _ = self.done() => Err(self.err(id)),
        }
    }

    pub async fn sleep(&self, id: &str, delay: Duration) -> Result<()> {
        self.run(id, async {
            tokio::time::sleep(delay).await;
            Ok(())
        })
        .await
    }
}

/// Writes propagated trace fields into a message header.
pub struct HeaderInjector<'a>(pub &'a mut HashMap<String, String>);

impl<'a> Injector for HeaderInjector<'a> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key.to_owned(), value);
    }
}

/// Reads propagated trace fields from a message header.
pub struct HeaderExtractor<'a>(pub &'a HashMap<String, String>);

impl<'a> Extractor for HeaderExtractor<'a> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use micro_protocol::ErrorKind;

    #[tokio::test(start_paused = true)]
    async fn child_deadline_only_shrinks() {
        let parent = CallScope::new().with_timeout(Duration::from_secs(5));
        let child = parent.with_timeout(Duration::from_secs(10));
        assert_eq!(parent.deadline(), child.deadline());
        let shorter = parent.with_timeout(Duration::from_secs(1));
        assert!(shorter.deadline() < parent.deadline());
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_at_deadline() {
        let scope = CallScope::new().with_timeout(Duration::from_secs(1));
        let err = scope
            .run("client.call", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        assert_eq!(ErrorKind::Timeout, err.kind());
        assert!(scope.is_done());
        assert_eq!(Some(Duration::ZERO), scope.remaining());
    }

    #[tokio::test]
    async fn cancel_propagates_down_only() {
        let parent = CallScope::new();
        let child = parent.child();
        child.cancel();
        assert!(child.is_done());
        assert!(!parent.is_done());

        let child = parent.child();
        parent.cancel();
        child.done().await;
        assert_eq!("context canceled", child.err("x").detail);
    }

    #[test]
    fn metadata_follows_children() {
        let scope = CallScope::new().with_metadata("User", "alice");
        assert_eq!(Some("alice"), scope.child().metadata().get("User").map(String::as_str));
    }
}
