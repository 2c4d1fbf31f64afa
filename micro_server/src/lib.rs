//! A small handler server speaking the micro frame protocol over TCP.
//!
//! Frames are dispatched by their `Micro-Endpoint` header. Requests on one
//! connection are answered in order, so a connection that opened a stream
//! keeps receiving replies until either side sends an end-of-stream frame.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use rand::Rng;
use tokio::io::{BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use micro_protocol::{
    ContentType, Error, Message, MessageType, MicroParam, Result, HEADER_ACCEPT,
    HEADER_CONTENT_TYPE, HEADER_ENDPOINT, HEADER_ID, HEADER_SERVICE, HEADER_TIMEOUT,
    ID_SERVER_HANDLER,
};
use micro_registry::{Endpoint, Node, RegisterOpt, Registry, RegistryError, Service};

/// An inbound call as a handler sees it.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub header: HashMap<String, String>,
    pub query: Vec<(String, String)>,
    pub body: Bytes,
    pub content_type: ContentType,
    pub accept: ContentType,
}

impl Inbound {
    pub fn get_header(&self, key: &str) -> Option<&str> {
        self.header.get(key).map(String::as_str)
    }

    /// Decodes the body into `T` with the request codec.
    pub fn decode<T: MicroParam + Default>(&self) -> Result<T> {
        let mut value = T::default();
        value
            .from_slice(self.content_type, &self.body)
            .map_err(|err| Error::bad_request(ID_SERVER_HANDLER, err.detail))?;
        Ok(value)
    }
}

/// Answers a call with the encoded reply body.
pub type Handler = Arc<dyn Fn(Inbound) -> BoxFuture<'static, Result<Vec<u8>>> + Send + Sync>;

struct Registered {
    endpoint: Endpoint,
    handler: Handler,
}

#[derive(Debug, Clone)]
pub struct ServerOpt {
    pub name: String,
    /// Precise version of this instance, e.g. `"1.2.0"`.
    pub version: String,
    /// Address to listen on. Port 0 picks a free one.
    pub address: String,
    /// Defaults to `<name>-<random hex>`.
    pub node_id: Option<String>,
    pub metadata: HashMap<String, String>,
}

impl ServerOpt {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        ServerOpt {
            name: name.into(),
            version: version.into(),
            address: "127.0.0.1:0".to_owned(),
            node_id: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn with_node_id(mut self, id: impl Into<String>) -> Self {
        self.node_id = Some(id.into());
        self
    }
}

pub struct Server {
    opt: ServerOpt,
    node_id: String,
    handlers: HashMap<String, Registered>,
    addr: Option<SocketAddr>,
    stop: CancellationToken,
}

impl Server {
    pub fn new(opt: ServerOpt) -> Self {
        let node_id = opt.node_id.clone().unwrap_or_else(|| {
            let suffix: u32 = rand::thread_rng().gen();
            format!("{}-{:08x}", opt.name, suffix)
        });
        Server {
            opt,
            node_id,
            handlers: HashMap::new(),
            addr: None,
            stop: CancellationToken::new(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// The bound address once started.
    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    /// Registers a raw handler for `endpoint`, replacing any previous one.
    pub fn handle(&mut self, endpoint: Endpoint, handler: Handler) {
        self.handlers
            .insert(endpoint.name.clone(), Registered { endpoint, handler });
    }

    /// Registers a typed handler: the body is decoded into `Req` with the
    /// request's content type and the reply encoded with its accept type.
    pub fn handle_fn<Req, Rsp, F, Fut>(&mut self, endpoint: Endpoint, f: F)
    where
        Req: MicroParam + Default + 'static,
        Rsp: MicroParam + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Rsp>> + Send + 'static,
    {
        let f = Arc::new(f);
        let handler: Handler = Arc::new(move |inbound: Inbound| {
            let f = f.clone();
            async move {
                let req: Req = inbound.decode()?;
                let rsp = f(req).await?;
                rsp.into_bytes(inbound.accept)
            }
            .boxed()
        });
        self.handle(endpoint, handler);
    }

    /// Binds the listener and serves in the background until [`Server::stop`].
    pub async fn start(&mut self) -> io::Result<SocketAddr> {
        let listener = TcpListener::bind(&self.opt.address).await?;
        let addr = listener.local_addr()?;
        self.addr = Some(addr);

        let handlers: Arc<HashMap<String, Handler>> = Arc::new(
            self.handlers
                .iter()
                .map(|(name, r)| (name.clone(), r.handler.clone()))
                .collect(),
        );
        let stop = self.stop.clone();
        info!(service = %self.opt.name, %addr, "server listening");
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    res = listener.accept() => match res {
                        Ok((stream, peer)) => {
                            debug!(%peer, "accepted connection");
                            tokio::spawn(serve_conn(stream, handlers.clone(), stop.child_token()));
                        }
                        Err(err) => warn!(error = %err, "accept failed"),
                    },
                    _ = stop.cancelled() => break,
                }
            }
            info!(%addr, "server stopped");
        });
        Ok(addr)
    }

    /// Stops accepting and drops every open connection.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// The registry record for this instance. Empty until started.
    pub fn service(&self) -> Service {
        let major = self
            .opt
            .version
            .split('.')
            .next()
            .unwrap_or_default()
            .to_owned();
        let mut node = Node::new(
            self.node_id.clone(),
            self.opt.version.clone(),
            self.addr.map(|a| a.to_string()).unwrap_or_default(),
        );
        node.metadata = self.opt.metadata.clone();

        let mut endpoints: Vec<Endpoint> =
            self.handlers.values().map(|r| r.endpoint.clone()).collect();
        endpoints.sort_by(|a, b| a.name.cmp(&b.name));
        let mut svc = Service::new(self.opt.name.clone(), major).with_node(node);
        svc.endpoints = endpoints;
        svc
    }

    pub async fn register(
        &self,
        registry: &dyn Registry,
        opt: RegisterOpt,
    ) -> std::result::Result<(), RegistryError> {
        if self.addr.is_none() {
            return Err(RegistryError::Invalid("server not started".to_owned()));
        }
        registry.register(&self.service(), opt).await?;
        info!(service = %self.opt.name, node = %self.node_id, registry = registry.name(), "registered");
        Ok(())
    }

    pub async fn deregister(&self, registry: &dyn Registry) -> std::result::Result<(), RegistryError> {
        registry.deregister(&self.service()).await?;
        info!(service = %self.opt.name, node = %self.node_id, "deregistered");
        Ok(())
    }
}

async fn serve_conn(
    stream: TcpStream,
    handlers: Arc<HashMap<String, Handler>>,
    stop: CancellationToken,
) {
    let _ = stream.set_nodelay(true);
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut writer = BufWriter::new(writer);
    loop {
        let msg = tokio::select! {
            res = Message::read_from(&mut reader) => match res {
                Ok(msg) => msg,
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return,
                Err(err) => {
                    warn!(error = %err, "dropping connection on bad frame");
                    return;
                }
            },
            _ = stop.cancelled() => return,
        };

        let (reply, last) = match msg.kind {
            MessageType::Request => (dispatch(&handlers, msg).await, false),
            MessageType::EndOfStream => {
                let mut eos = Message::new(MessageType::EndOfStream);
                if let Some(id) = msg.get_header(HEADER_ID) {
                    eos.set_header(HEADER_ID, id);
                }
                (eos, true)
            }
            kind => {
                let err = Error::bad_request(ID_SERVER_HANDLER, format!("unexpected {} frame", kind));
                (Message::error(&err), false)
            }
        };
        if let Err(err) = reply.write_to(&mut writer).await {
            debug!(error = %err, "peer went away");
            return;
        }
        if last {
            return;
        }
    }
}

/// Runs the handler for one request frame and builds the reply frame.
async fn dispatch(handlers: &HashMap<String, Handler>, msg: Message) -> Message {
    let mut reply = match run_handler(handlers, &msg).await {
        Ok((body, accept)) => {
            let mut reply = Message::new(MessageType::Response);
            reply.set_header(HEADER_CONTENT_TYPE, accept.to_string());
            reply.body = Bytes::from(body);
            reply
        }
        Err(err) => Message::error(&err),
    };
    for key in [HEADER_SERVICE, HEADER_ENDPOINT, HEADER_ID] {
        if let Some(v) = msg.get_header(key) {
            reply.set_header(key, v);
        }
    }
    reply
}

async fn run_handler(
    handlers: &HashMap<String, Handler>,
    msg: &Message,
) -> Result<(Vec<u8>, ContentType)> {
    let endpoint = msg.get_header(HEADER_ENDPOINT).unwrap_or_default();
    let handler = handlers.get(endpoint).ok_or_else(|| {
        Error::not_found(ID_SERVER_HANDLER, format!("unknown endpoint {:?}", endpoint))
    })?;
    let codec = |key: &str| match msg.get_header(key) {
        Some(token) if !token.is_empty() => ContentType::parse(token)
            .map_err(|_| Error::bad_request(ID_SERVER_HANDLER, format!("unsupported codec {:?}", token))),
        _ => Ok(ContentType::default()),
    };
    let content_type = codec(HEADER_CONTENT_TYPE)?;
    let accept = match msg.get_header(HEADER_ACCEPT) {
        Some(token) if !token.is_empty() => codec(HEADER_ACCEPT)?,
        _ => content_type,
    };
    let inbound = Inbound {
        header: msg.header.clone(),
        query: msg.query.clone(),
        body: msg.body.clone(),
        content_type,
        accept,
    };

    let call = AssertUnwindSafe(handler(inbound)).catch_unwind();
    let res = match deadline(msg) {
        Some(limit) => match tokio::time::timeout(limit, call).await {
            Ok(res) => res,
            Err(_) => {
                return Err(Error::timeout(
                    ID_SERVER_HANDLER,
                    format!("{} did not finish within {:?}", endpoint, limit),
                ))
            }
        },
        None => call.await,
    };
    match res {
        Ok(body) => Ok((body?, accept)),
        Err(_) => {
            warn!(endpoint, "handler panicked");
            Err(Error::internal_server_error(ID_SERVER_HANDLER, "panic recovered in handler"))
        }
    }
}

/// The handler budget carried by the `Timeout` header, in whole seconds.
fn deadline(msg: &Message) -> Option<Duration> {
    msg.get_header(HEADER_TIMEOUT)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
}
