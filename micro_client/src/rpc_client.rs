use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use tokio::sync::Mutex;
use tracing::{field, info_span, warn, Instrument};

use micro_protocol::{
    Error, Message, MessageType, MicroParam, Result, HEADER_ACCEPT, HEADER_AUTHORIZATION,
    HEADER_CONTENT_TYPE, HEADER_ENDPOINT, HEADER_HOST, HEADER_ID, HEADER_METHOD,
    HEADER_PRIMARY_KEY, HEADER_SERVICE, HEADER_STREAM, HEADER_TIMEOUT, ID_CLIENT_CALL,
};
use micro_registry::Node;

use crate::request::unexpected_frame;
use crate::{
    standard_filter, topic, wrap_call, CallFunc, CallOpt, CallScope, CallSettings, Client,
    HeaderInjector, NodeIter, Opt, Pool, Request, Response, SelectOpt, Selector, SelectorError,
    Stream,
};

/// The call engine: selection, retries, pooling and the wire exchange.
pub struct RpcClient {
    opt: Opt,
    pool: Arc<Pool>,
    seq: Arc<AtomicU64>,
}

enum Outcome {
    Done(Message),
    /// Failed before reaching a node; never retried.
    Terminal(Error),
    Failed(Error),
}

/// What one attempt needs, shared by every attempt of a call.
struct Attempt {
    scope: CallScope,
    req: Arc<Request>,
    settings: Arc<CallSettings>,
    selector: Arc<dyn Selector>,
    select_opt: SelectOpt,
    iter: Arc<Mutex<NodeIter>>,
    call: CallFunc,
    seq: Arc<AtomicU64>,
    opt: Arc<OptHandles>,
}

/// The parts of [`Opt`] attempts reach for.
struct OptHandles {
    transport: String,
    propagator: crate::Propagator,
}

impl Attempt {
    async fn next_node(&self) -> Result<Node> {
        let mut iter = self.iter.lock().await;
        match iter.next_node() {
            Ok(node) => Ok(node),
            Err(SelectorError::NoneAvailable(_)) => {
                // the iterator ran dry on a retry, start over with a fresh view
                *iter = self
                    .selector
                    .select(self.req.service(), self.select_opt.clone())
                    .await?;
                Ok(iter.next_node()?)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn run(self, attempt: u32) -> Outcome {
        let delay = (self.settings.backoff)(&self.scope, &self.req, attempt);
        if !delay.is_zero() {
            if let Err(err) = self.scope.sleep(ID_CLIENT_CALL, delay).await {
                return Outcome::Terminal(err);
            }
        }
        let node = match self.next_node().await {
            Ok(node) => node,
            Err(err) => return Outcome::Terminal(err),
        };
        let id = self.seq.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
        let msg = match build_message(
            &self.scope,
            &self.req,
            &self.settings,
            &node,
            id,
            &self.opt.propagator,
        ) {
            Ok(msg) => msg,
            Err(err) => return Outcome::Terminal(err),
        };

        let span = info_span!(
            "client.call",
            transport = %self.opt.transport,
            service = %self.req.service(),
            endpoint = %self.req.endpoint(),
            node = %node.id,
            attempt,
            timeout_ms = self.scope.remaining().map(|d| d.as_millis() as u64),
            error = field::Empty,
            otel.status_code = field::Empty,
        );
        let res = AssertUnwindSafe((self.call)(self.scope.clone(), node.clone(), msg))
            .catch_unwind()
            .instrument(span.clone())
            .await
            .unwrap_or_else(|_| {
                Err(Error::internal_server_error(
                    ID_CLIENT_CALL,
                    "panic recovered during call",
                ))
            });
        self.selector
            .mark(self.req.service(), &node, res.as_ref().err());
        match res {
            Ok(msg) => Outcome::Done(msg),
            Err(err) => {
                span.record("error", field::display(&err));
                span.record("otel.status_code", "ERROR");
                Outcome::Failed(err)
            }
        }
    }
}

/// Whole seconds left in the scope, rounded up.
fn timeout_header(scope: &CallScope, settings: &CallSettings) -> String {
    let remaining = scope.remaining().unwrap_or(settings.request_timeout);
    let secs = (remaining.as_millis() + 999) / 1000;
    secs.to_string()
}

fn build_message(
    scope: &CallScope,
    req: &Request,
    settings: &CallSettings,
    node: &Node,
    id: u64,
    propagator: &crate::Propagator,
) -> Result<Message> {
    let mut msg = Message::new(MessageType::Request);
    for (k, v) in scope.metadata().iter().chain(req.header().iter()) {
        msg.set_header(k.clone(), v.clone());
    }
    msg.set_header(HEADER_CONTENT_TYPE, req.content_type().to_string());
    msg.set_header(HEADER_ACCEPT, req.accept().to_string());
    msg.set_header(HEADER_HOST, node.address.clone());
    msg.set_header(HEADER_PRIMARY_KEY, req.primary_key().unwrap_or_default());
    msg.set_header(HEADER_SERVICE, req.service());
    msg.set_header(HEADER_METHOD, req.method());
    msg.set_header(HEADER_ENDPOINT, req.endpoint());
    msg.set_header(HEADER_ID, id.to_string());
    msg.set_header(HEADER_TIMEOUT, timeout_header(scope, settings));
    if let Some(token) = &settings.service_token {
        msg.set_header(HEADER_AUTHORIZATION, format!("Bearer {}", token));
    }
    propagator.inject_context(scope.trace_context(), &mut HeaderInjector(&mut msg.header));
    msg.query = req.query().to_vec();
    msg.body = Bytes::from(req.encode_body()?);
    Ok(msg)
}

/// The innermost call: one exchange on a pooled connection.
fn transport_call(pool: Arc<Pool>, settings: Arc<CallSettings>) -> CallFunc {
    Arc::new(move |scope: CallScope, node: Node, msg: Message| {
        let pool = pool.clone();
        let settings = settings.clone();
        async move {
            let mut conn = pool
                .get(&node.address, settings.dial_timeout)
                .await
                .map_err(Error::from)?;
            let conn_timeout = settings.conn_timeout;
            let exchange = async {
                conn.client().send(&msg).await?;
                conn.client().recv().await
            };
            let res = tokio::select! {
                res = AssertUnwindSafe(tokio::time::timeout(conn_timeout, exchange)).catch_unwind() => match res {
                    Ok(Ok(Ok(reply))) => Ok(reply),
                    Ok(Ok(Err(err))) => Err(Error::internal_server_error(ID_CLIENT_CALL, err.to_string())),
                    Ok(Err(_)) => Err(Error::client_transport(format!(
                        "no reply from {} within {:?}",
                        node.address, conn_timeout
                    ))),
                    Err(_) => Err(Error::internal_server_error(ID_CLIENT_CALL, "panic recovered during exchange")),
                },
                _ = scope.done() => Err(scope.err(ID_CLIENT_CALL)),
            };

            if settings.conn_close {
                pool.destroy(conn).await;
            } else if let Err(err) = pool.release(conn, res.as_ref().err()).await {
                warn!(node = %node.id, error = %err, "failed to release connection");
            }

            let reply = res?;
            match reply.kind {
                MessageType::Response => Ok(reply),
                MessageType::Error => Err(Error::parse(&reply.body)),
                _ => Err(unexpected_frame(&reply)),
            }
        }
        .boxed()
    })
}

impl RpcClient {
    pub fn new(opt: Opt) -> Self {
        let pool = Arc::new(Pool::new(
            opt.transport.clone(),
            opt.pool_size,
            opt.pool_ttl,
        ));
        RpcClient {
            opt,
            pool,
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    /// The last sequence id issued.
    pub fn sequence(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    fn next_id(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst).wrapping_add(1)
    }

    fn select_opt(&self, req: &Request, settings: &CallSettings) -> SelectOpt {
        let mut filters = vec![standard_filter(
            req,
            settings.allow_internal,
            settings.node.as_deref(),
        )];
        filters.extend(settings.filters.iter().cloned());
        SelectOpt {
            filters,
            keys: settings.keys.clone(),
        }
    }

    async fn select(&self, scope: &CallScope, req: &Request, opt: &SelectOpt) -> Result<NodeIter> {
        scope
            .run(ID_CLIENT_CALL, async {
                self.opt
                    .selector
                    .select(req.service(), opt.clone())
                    .await
                    .map_err(Error::from)
            })
            .await
    }

    fn handles(&self) -> Arc<OptHandles> {
        Arc::new(OptHandles {
            transport: self.opt.transport.name().to_owned(),
            propagator: self.opt.propagator.clone(),
        })
    }

    async fn open_stream(
        &self,
        scope: &CallScope,
        open: &CallScope,
        req: &Request,
        settings: &CallSettings,
    ) -> Result<Stream> {
        let select_opt = self.select_opt(req, settings);
        let mut iter = self.select(open, req, &select_opt).await?;
        let mut attempt = 0;
        loop {
            let delay = (settings.backoff)(open, req, attempt);
            if !delay.is_zero() {
                open.sleep(ID_CLIENT_CALL, delay).await?;
            }
            let node = match iter.next_node() {
                Ok(node) => node,
                Err(SelectorError::NoneAvailable(_)) => {
                    iter = self.select(open, req, &select_opt).await?;
                    iter.next_node()?
                }
                Err(err) => return Err(err.into()),
            };

            let id = self.next_id();
            let mut msg = build_message(open, req, settings, &node, id, &self.opt.propagator)?;
            msg.set_header(HEADER_STREAM, "true");
            let header: std::collections::HashMap<String, String> = msg
                .header
                .iter()
                .filter(|(k, _)| k.as_str() != HEADER_TIMEOUT)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();

            let res = self.send_opening(open, &node, msg, settings).await;
            self.opt.selector.mark(req.service(), &node, res.as_ref().err());
            let err = match res {
                Ok(client) => {
                    return Ok(Stream::new(
                        id,
                        req.protocols(),
                        header,
                        scope.clone(),
                        settings.stream_timeout,
                        client,
                    ))
                }
                Err(err) => err,
            };
            if open.is_done() {
                return Err(err);
            }
            if !(settings.retry)(open, req, attempt, &err)? {
                return Err(err);
            }
            attempt += 1;
            if attempt > settings.retries {
                return Err(err);
            }
            warn!(service = %req.service(), attempt, error = %err, "retrying stream");
        }
    }

    /// Dials `node` and sends the opening message from a worker, raced against
    /// the opening scope.
    async fn send_opening(
        &self,
        open: &CallScope,
        node: &Node,
        msg: Message,
        settings: &CallSettings,
    ) -> Result<Box<dyn crate::TransportClient>> {
        let transport = self.opt.transport.clone();
        let addr = node.address.clone();
        let dial_timeout = settings.dial_timeout;
        let mut worker = tokio::spawn(async move {
            let mut client = transport.dial(&addr, dial_timeout).await?;
            if let Err(err) = client.send(&msg).await {
                let _ = client.close().await;
                return Err(err);
            }
            Ok::<_, crate::TransportError>(client)
        });
        tokio::select! {
            res = &mut worker => match res {
                Ok(res) => res.map_err(Error::from),
                Err(_) => Err(Error::internal_server_error(ID_CLIENT_CALL, "stream worker failed")),
            },
            _ = open.done() => {
                worker.abort();
                Err(open.err(ID_CLIENT_CALL))
            }
        }
    }
}

#[async_trait]
impl Client for RpcClient {
    fn opt(&self) -> &Opt {
        &self.opt
    }

    async fn call(
        &self,
        scope: &CallScope,
        req: &Request,
        rsp: &mut dyn MicroParam,
        opt: CallOpt,
    ) -> Result<Response> {
        let settings = Arc::new(self.opt.resolve(opt));
        let scope = scope.with_timeout(settings.request_timeout);
        let select_opt = self.select_opt(req, &settings);
        let iter = self.select(&scope, req, &select_opt).await?;

        let req = Arc::new(req.clone());
        let iter = Arc::new(Mutex::new(iter));
        let call = wrap_call(
            transport_call(self.pool.clone(), settings.clone()),
            &settings.call_wrappers,
        );
        let handles = self.handles();

        let mut attempt = 0;
        loop {
            let worker = Attempt {
                scope: scope.child(),
                req: req.clone(),
                settings: settings.clone(),
                selector: self.opt.selector.clone(),
                select_opt: select_opt.clone(),
                iter: iter.clone(),
                call: call.clone(),
                seq: self.seq.clone(),
                opt: handles.clone(),
            };
            let mut handle = tokio::spawn(worker.run(attempt));
            let outcome = tokio::select! {
                res = &mut handle => res.unwrap_or_else(|_| {
                    Outcome::Failed(Error::internal_server_error(ID_CLIENT_CALL, "call worker failed"))
                }),
                _ = scope.done() => {
                    let err = scope.err(ID_CLIENT_CALL);
                    // the orphaned attempt observes this and gives its connection back
                    scope.cancel();
                    return Err(err);
                }
            };

            let err = match outcome {
                Outcome::Done(msg) => {
                    let response = Response::from_message(msg)?;
                    response.decode(req.accept(), rsp)?;
                    return Ok(response);
                }
                Outcome::Terminal(err) => return Err(err),
                Outcome::Failed(err) => err,
            };
            if !(settings.retry)(&scope, &req, attempt, &err)? {
                return Err(err);
            }
            attempt += 1;
            if attempt > settings.retries {
                return Err(err);
            }
            warn!(service = %req.service(), endpoint = %req.endpoint(), attempt, error = %err, "retrying call");
        }
    }

    async fn stream(&self, scope: &CallScope, req: &Request, opt: CallOpt) -> Result<Stream> {
        let settings = self.opt.resolve(opt);
        let stream_scope = scope.child();
        let open = stream_scope.with_timeout(settings.request_timeout);
        self.open_stream(&stream_scope, &open, req, &settings).await
    }

    async fn publish(&self, scope: &CallScope, req: &Request, opt: CallOpt) -> Result<()> {
        let broker = match &self.opt.broker {
            Some(broker) => broker.clone(),
            None => {
                let mut discard = Vec::new();
                return self.call(scope, req, &mut discard, opt).await.map(|_| ());
            }
        };
        let settings = self.opt.resolve(opt);
        let major = req.version().map_or(1, |v| v.major);
        let topic = topic(req.service(), major, settings.node.as_deref());

        let mut msg = Message::new(MessageType::Request);
        for (k, v) in scope.metadata().iter().chain(req.header().iter()) {
            msg.set_header(k.clone(), v.clone());
        }
        msg.set_header(HEADER_CONTENT_TYPE, req.content_type().to_string());
        msg.set_header(HEADER_SERVICE, req.service());
        msg.set_header(HEADER_ENDPOINT, req.endpoint());
        msg.set_header(HEADER_ID, self.next_id().to_string());
        self.opt
            .propagator
            .inject_context(scope.trace_context(), &mut HeaderInjector(&mut msg.header));
        msg.body = Bytes::from(req.encode_body()?);

        scope
            .run(ID_CLIENT_CALL, async {
                broker.publish(&topic, msg).await.map_err(Error::from)
            })
            .await
    }
}
