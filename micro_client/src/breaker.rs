use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};
use tokio::time::Instant;
use tracing::{info, warn};

use micro_protocol::{Error, MicroParam, Result, ID_CLIENT_BREAKER};

use crate::{CallOpt, CallScope, Client, ClientWrapper, Opt, Request, Response, Stream};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Display, EnumIter, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Granularity of breaker state.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Display, EnumIter, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BreakerScope {
    Service,
    Endpoint,
}

#[derive(Debug, Clone)]
pub struct BreakerSettings {
    /// Consecutive failures that open a closed breaker.
    pub failure_threshold: u32,
    /// How long an open breaker rejects before admitting trial calls.
    pub open_timeout: Duration,
    /// Trial calls admitted while half-open.
    pub half_open_max_requests: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        BreakerSettings {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(60),
            half_open_max_requests: 1,
        }
    }
}

struct BreakerInner {
    state: BreakerState,
    failures: u32,
    opened_at: Instant,
    trials: u32,
}

/// A two-step circuit breaker: [`allow`](Self::allow) before the guarded
/// call, [`record`](Self::record) with its outcome after.
pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: BreakerSettings) -> Self {
        CircuitBreaker {
            name: name.into(),
            settings,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failures: 0,
                opened_at: Instant::now(),
                trials: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> BreakerState {
        let inner = self.lock();
        if inner.state == BreakerState::Open
            && inner.opened_at.elapsed() >= self.settings.open_timeout
        {
            return BreakerState::HalfOpen;
        }
        inner.state
    }

    pub fn allow(&self) -> Result<()> {
        self.admit().map(|_| ())
    }

    /// Like [`allow`](Self::allow), but the admission is held by the returned
    /// guard. A guard dropped without [`BreakerGuard::record`] gives its
    /// half-open slot back, so a cancelled call cannot wedge the breaker.
    pub fn guard(&self) -> Result<BreakerGuard<'_>> {
        let trial = self.admit()?;
        Ok(BreakerGuard {
            breaker: self,
            trial,
            settled: false,
        })
    }

    /// Returns whether the admitted call holds a half-open slot.
    fn admit(&self) -> Result<bool> {
        let mut inner = self.lock();
        if inner.state == BreakerState::Open {
            if inner.opened_at.elapsed() < self.settings.open_timeout {
                return Err(self.rejected());
            }
            info!(breaker = %self.name, "circuit half-open");
            inner.state = BreakerState::HalfOpen;
            inner.trials = 0;
        }
        if inner.state == BreakerState::HalfOpen {
            if inner.trials >= self.settings.half_open_max_requests {
                return Err(self.rejected());
            }
            inner.trials += 1;
            return Ok(true);
        }
        Ok(false)
    }

    fn release(&self) {
        let mut inner = self.lock();
        if inner.state == BreakerState::HalfOpen {
            inner.trials = inner.trials.saturating_sub(1);
            info!(breaker = %self.name, "half-open call abandoned");
        }
    }

    pub fn record(&self, success: bool) {
        let mut inner = self.lock();
        match (inner.state, success) {
            (BreakerState::Closed, true) => inner.failures = 0,
            (BreakerState::Closed, false) => {
                inner.failures += 1;
                if inner.failures >= self.settings.failure_threshold {
                    warn!(breaker = %self.name, failures = inner.failures, "circuit open");
                    inner.state = BreakerState::Open;
                    inner.opened_at = Instant::now();
                }
            }
            (BreakerState::HalfOpen, true) => {
                info!(breaker = %self.name, "circuit closed");
                inner.state = BreakerState::Closed;
                inner.failures = 0;
            }
            (BreakerState::HalfOpen, false) => {
                warn!(breaker = %self.name, "trial call failed, circuit open");
                inner.state = BreakerState::Open;
                inner.opened_at = Instant::now();
            }
            (BreakerState::Open, _) => {}
        }
    }

    fn rejected(&self) -> Error {
        Error::bad_gateway(ID_CLIENT_BREAKER, format!("circuit {} is open", self.name))
    }
}

/// One admitted call. See [`CircuitBreaker::guard`].
#[must_use]
pub struct BreakerGuard<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl BreakerGuard<'_> {
    pub fn record(mut self, success: bool) {
        self.settled = true;
        self.breaker.record(success);
    }
}

impl Drop for BreakerGuard<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.release();
        }
    }
}

/// Guards the calls of another client with one breaker per scope key.
pub struct BreakerClient {
    inner: Arc<dyn Client>,
    settings: BreakerSettings,
    scope: BreakerScope,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerClient {
    pub fn new(inner: Arc<dyn Client>, settings: BreakerSettings, scope: BreakerScope) -> Self {
        BreakerClient {
            inner,
            settings,
            scope,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn breaker(&self, req: &Request) -> Arc<CircuitBreaker> {
        let key = match self.scope {
            BreakerScope::Service => req.service().to_owned(),
            BreakerScope::Endpoint => format!("{}.{}", req.service(), req.endpoint()),
        };
        let mut breakers = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        breakers
            .entry(key)
            .or_insert_with_key(|key| Arc::new(CircuitBreaker::new(key.clone(), self.settings.clone())))
            .clone()
    }
}

#[async_trait]
impl Client for BreakerClient {
    fn opt(&self) -> &Opt {
        self.inner.opt()
    }

    async fn call(
        &self,
        scope: &CallScope,
        req: &Request,
        rsp: &mut dyn MicroParam,
        opt: CallOpt,
    ) -> Result<Response> {
        let breaker = self.breaker(req);
        let guard = breaker.guard()?;
        let res = self.inner.call(scope, req, rsp, opt).await;
        guard.record(!matches!(&res, Err(err) if err.is_server_error()));
        res
    }

    async fn stream(&self, scope: &CallScope, req: &Request, opt: CallOpt) -> Result<Stream> {
        self.inner.stream(scope, req, opt).await
    }

    async fn publish(&self, scope: &CallScope, req: &Request, opt: CallOpt) -> Result<()> {
        self.inner.publish(scope, req, opt).await
    }
}

pub fn breaker_wrapper(settings: BreakerSettings, scope: BreakerScope) -> ClientWrapper {
    Arc::new(move |inner: Arc<dyn Client>| {
        let client: Arc<dyn Client> = Arc::new(BreakerClient::new(inner, settings.clone(), scope));
        client
    })
}
