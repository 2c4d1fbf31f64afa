use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use micro_protocol::Error;

use crate::{Transport, TransportClient, TransportError};

pub const DEFAULT_POOL_SIZE: usize = 100;
pub const DEFAULT_POOL_TTL: Duration = Duration::from_secs(60);

/// A connection checked out of a [`Pool`]. It goes back through
/// [`Pool::release`], never on its own.
pub struct PoolConn {
    id: String,
    created: Instant,
    addr: String,
    client: Box<dyn TransportClient>,
}

impl PoolConn {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn client(&mut self) -> &mut dyn TransportClient {
        self.client.as_mut()
    }
}

fn conn_id() -> String {
    let bytes: [u8; 8] = rand::thread_rng().gen();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Idle connections by address, reused most-recently-released first.
pub struct Pool {
    size: usize,
    ttl: Duration,
    transport: Arc<dyn Transport>,
    conns: Mutex<HashMap<String, Vec<PoolConn>>>,
    // connections dialed and not yet destroyed, idle or checked out
    open: AtomicUsize,
}

impl Pool {
    pub fn new(transport: Arc<dyn Transport>, size: usize, ttl: Duration) -> Self {
        Pool {
            size,
            ttl,
            transport,
            conns: Mutex::new(HashMap::new()),
            open: AtomicUsize::new(0),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub async fn get(&self, addr: &str, dial_timeout: Duration) -> Result<PoolConn, TransportError> {
        loop {
            let conn = {
                let mut conns = self.conns.lock().await;
                conns.get_mut(addr).and_then(Vec::pop)
            };
            match conn {
                Some(conn) if conn.created.elapsed() > self.ttl => {
                    debug!(addr = %addr, conn = %conn.id, "pooled connection expired");
                    self.destroy(conn).await;
                }
                Some(conn) => return Ok(conn),
                None => break,
            }
        }

        let client = self.transport.dial(addr, dial_timeout).await?;
        self.open.fetch_add(1, Ordering::SeqCst);
        let conn = PoolConn {
            id: conn_id(),
            created: Instant::now(),
            addr: addr.to_owned(),
            client,
        };
        debug!(addr = %addr, conn = %conn.id, "dialed new connection");
        Ok(conn)
    }

    /// Returns `conn` to the pool, or destroys it when the exchange failed or
    /// the pool for its address is full.
    pub async fn release(&self, mut conn: PoolConn, err: Option<&Error>) -> Result<(), TransportError> {
        if err.is_some() {
            return self.close_conn(conn).await;
        }
        if self.idle(&conn.addr).await >= self.size {
            return self.close_conn(conn).await;
        }
        if let Err(err) = conn.client.quiesce().await {
            self.destroy(conn).await;
            return Err(err);
        }

        let mut conns = self.conns.lock().await;
        let idle = conns.entry(conn.addr.clone()).or_default();
        if idle.len() >= self.size {
            drop(conns);
            return self.close_conn(conn).await;
        }
        idle.push(conn);
        Ok(())
    }

    /// Destroys a connection that must not be reused.
    pub async fn destroy(&self, conn: PoolConn) {
        if let Err(err) = self.close_conn(conn).await {
            debug!(error = %err, "closing connection failed");
        }
    }

    async fn close_conn(&self, mut conn: PoolConn) -> Result<(), TransportError> {
        self.open.fetch_sub(1, Ordering::SeqCst);
        conn.client.close().await
    }

    /// Destroys every idle connection.
    pub async fn close(&self) {
        let drained: Vec<PoolConn> = {
            let mut conns = self.conns.lock().await;
            conns.drain().flat_map(|(_, v)| v).collect()
        };
        for conn in drained {
            if let Err(err) = self.close_conn(conn).await {
                warn!(error = %err, "closing pooled connection failed");
            }
        }
    }

    /// Idle connections pooled for `addr`.
    pub async fn idle(&self, addr: &str) -> usize {
        self.conns.lock().await.get(addr).map_or(0, Vec::len)
    }

    /// Connections alive, idle or in use.
    pub fn open(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }
}
