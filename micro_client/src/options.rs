use std::sync::Arc;
use std::time::Duration;

use opentelemetry::propagation::TextMapPropagator;
use opentelemetry_sdk::propagation::TraceContextPropagator;

use micro_registry::{Cache, CacheOpt, Registry};

use crate::{
    exponential_backoff, retry_on_error, BackoffFn, Broker, CallWrapper, ClientWrapper, Filter,
    RegistrySelector, RetryFn, Selector, Strategy, TcpTransport, Transport, DEFAULT_POOL_SIZE,
    DEFAULT_POOL_TTL,
};

pub const DEFAULT_RETRIES: u32 = 5;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CONN_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

pub type Propagator = Arc<dyn TextMapPropagator + Send + Sync>;

/// Client-wide options.
#[derive(Clone)]
pub struct Opt {
    /// Attempts after the first one.
    pub retries: u32,
    /// Budget of a whole call, retries included.
    pub request_timeout: Duration,
    /// Budget of every receive on a stream; `None` waits as long as the scope.
    pub stream_timeout: Option<Duration>,
    pub dial_timeout: Duration,
    /// Budget of one attempt's exchange on its connection.
    pub conn_timeout: Duration,
    pub backoff: BackoffFn,
    pub retry: RetryFn,
    /// Filters applied after the standard one, in order.
    pub filters: Vec<Filter>,
    pub call_wrappers: Vec<CallWrapper>,
    pub wrappers: Vec<ClientWrapper>,
    pub pool_size: usize,
    pub pool_ttl: Duration,
    pub registry: Arc<dyn Registry>,
    pub selector: Arc<dyn Selector>,
    pub transport: Arc<dyn Transport>,
    pub broker: Option<Arc<dyn Broker>>,
    /// Sent as a bearer `Authorization` header when set.
    pub service_token: Option<String>,
    /// Destroy connections after every call instead of pooling them.
    pub conn_close: bool,
    /// Pin calls to the node with this id.
    pub node: Option<String>,
    pub allow_internal: bool,
    pub propagator: Propagator,
}

impl Opt {
    /// Defaults over `registry`: a shared-hash selector behind a one minute
    /// cache, TCP transport, no broker.
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        let selector = default_selector(registry.clone(), Strategy::SharedHash);
        Opt {
            retries: DEFAULT_RETRIES,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            stream_timeout: None,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            conn_timeout: DEFAULT_CONN_TIMEOUT,
            backoff: exponential_backoff(),
            retry: retry_on_error(),
            filters: Vec::new(),
            call_wrappers: Vec::new(),
            wrappers: Vec::new(),
            pool_size: DEFAULT_POOL_SIZE,
            pool_ttl: DEFAULT_POOL_TTL,
            registry,
            selector,
            transport: Arc::new(TcpTransport::new()),
            broker: None,
            service_token: None,
            conn_close: false,
            node: None,
            allow_internal: false,
            propagator: Arc::new(TraceContextPropagator::new()),
        }
    }

    pub fn with_selector(mut self, selector: Arc<dyn Selector>) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_call_wrapper(mut self, wrapper: CallWrapper) -> Self {
        self.call_wrappers.push(wrapper);
        self
    }

    pub fn with_wrapper(mut self, wrapper: ClientWrapper) -> Self {
        self.wrappers.push(wrapper);
        self
    }

    /// Merges per-call overrides into the settings of one call.
    pub fn resolve(&self, call: CallOpt) -> CallSettings {
        let mut filters = self.filters.clone();
        filters.extend(call.filters);
        let mut call_wrappers = self.call_wrappers.clone();
        call_wrappers.extend(call.call_wrappers);
        CallSettings {
            retries: call.retries.unwrap_or(self.retries),
            request_timeout: call.request_timeout.unwrap_or(self.request_timeout),
            stream_timeout: call.stream_timeout.or(self.stream_timeout),
            dial_timeout: call.dial_timeout.unwrap_or(self.dial_timeout),
            conn_timeout: call.conn_timeout.unwrap_or(self.conn_timeout),
            backoff: call.backoff.unwrap_or_else(|| self.backoff.clone()),
            retry: call.retry.unwrap_or_else(|| self.retry.clone()),
            filters,
            call_wrappers,
            keys: call.keys,
            service_token: call.service_token.or_else(|| self.service_token.clone()),
            conn_close: call.conn_close.unwrap_or(self.conn_close),
            node: call.node.or_else(|| self.node.clone()),
            allow_internal: call.allow_internal.unwrap_or(self.allow_internal),
        }
    }
}

/// A selector of `strategy` over a default cache of `registry`.
pub fn default_selector(registry: Arc<dyn Registry>, strategy: Strategy) -> Arc<dyn Selector> {
    let cache: Arc<dyn Registry> = Arc::new(Cache::new(registry, CacheOpt::default()));
    Arc::new(RegistrySelector::new(cache, strategy))
}

/// Per-call overrides of [`Opt`]. Filters and call wrappers add to the
/// client's own.
#[derive(Clone, Default)]
pub struct CallOpt {
    pub retries: Option<u32>,
    pub request_timeout: Option<Duration>,
    pub stream_timeout: Option<Duration>,
    pub dial_timeout: Option<Duration>,
    pub conn_timeout: Option<Duration>,
    pub backoff: Option<BackoffFn>,
    pub retry: Option<RetryFn>,
    pub filters: Vec<Filter>,
    pub call_wrappers: Vec<CallWrapper>,
    /// Affinity keys for the shared-hash strategy.
    pub keys: Vec<String>,
    pub service_token: Option<String>,
    pub conn_close: Option<bool>,
    pub node: Option<String>,
    pub allow_internal: Option<bool>,
}

/// The options of one call after merging.
#[derive(Clone)]
pub struct CallSettings {
    pub retries: u32,
    pub request_timeout: Duration,
    pub stream_timeout: Option<Duration>,
    pub dial_timeout: Duration,
    pub conn_timeout: Duration,
    pub backoff: BackoffFn,
    pub retry: RetryFn,
    pub filters: Vec<Filter>,
    pub call_wrappers: Vec<CallWrapper>,
    pub keys: Vec<String>,
    pub service_token: Option<String>,
    pub conn_close: bool,
    pub node: Option<String>,
    pub allow_internal: bool,
}
