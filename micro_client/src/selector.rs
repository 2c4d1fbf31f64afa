use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strum_macros::{Display, EnumIter, EnumString};
use thiserror::Error;
use tracing::debug;

use micro_protocol::{Error, ID_CLIENT_SELECTOR};
use micro_registry::{Node, Registry, RegistryError, Service};

/// Narrows the candidate services of one call.
pub type Filter = Arc<dyn Fn(Vec<Service>) -> micro_protocol::Result<Vec<Service>> + Send + Sync>;

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Display, EnumIter, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// A uniformly random node on every pick.
    Random,
    /// Nodes in turn, one counter per selector.
    RoundRobin,
    /// Nodes by descending hash score of the selection keys, each visited once.
    SharedHash,
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy::SharedHash
    }
}

#[derive(Error, Debug)]
pub enum SelectorError {
    #[error("service {0} not found")]
    NotFound(String),

    #[error("none available for service {0}")]
    NoneAvailable(String),

    #[error(transparent)]
    Filter(Error),

    #[error("registry: {0}")]
    Registry(#[from] RegistryError),
}

impl From<SelectorError> for Error {
    fn from(err: SelectorError) -> Self {
        match err {
            SelectorError::Filter(err) => err.with_id(ID_CLIENT_SELECTOR),
            err => Error::service_unavailable(ID_CLIENT_SELECTOR, err.to_string()),
        }
    }
}

#[derive(Clone, Default)]
pub struct SelectOpt {
    pub filters: Vec<Filter>,
    /// Affinity seed of the shared-hash strategy.
    pub keys: Vec<String>,
}

#[async_trait]
pub trait Selector: Send + Sync {
    async fn select(&self, service: &str, opt: SelectOpt) -> Result<NodeIter, SelectorError>;

    /// Reports the outcome of a call to `node`.
    fn mark(&self, service: &str, node: &Node, err: Option<&Error>);

    fn reset(&self, service: &str);

    fn strategy(&self) -> Strategy;
}

enum Order {
    Random(Arc<Mutex<StdRng>>),
    RoundRobin(Arc<AtomicUsize>),
    SharedHash(Vec<Option<u64>>),
}

/// The candidate nodes of one call in strategy order.
pub struct NodeIter {
    service: String,
    nodes: Vec<Node>,
    order: Order,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl NodeIter {
    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The next node to try. Random and round-robin never run dry; shared-hash
    /// visits every node once.
    pub fn next_node(&mut self) -> Result<Node, SelectorError> {
        if self.nodes.is_empty() {
            return Err(SelectorError::NoneAvailable(self.service.clone()));
        }
        let idx = match &mut self.order {
            Order::Random(rng) => lock(rng).gen_range(0..self.nodes.len()),
            Order::RoundRobin(counter) => counter.fetch_add(1, Ordering::SeqCst) % self.nodes.len(),
            Order::SharedHash(scores) => {
                let mut best: Option<(usize, u64)> = None;
                for (i, score) in scores.iter().enumerate() {
                    if let Some(score) = *score {
                        if best.map_or(true, |(_, b)| score > b) {
                            best = Some((i, score));
                        }
                    }
                }
                match best {
                    Some((i, _)) => {
                        scores[i] = None;
                        i
                    }
                    None => return Err(SelectorError::NoneAvailable(self.service.clone())),
                }
            }
        };
        Ok(self.nodes[idx].clone())
    }
}

/// Score of `node_id` under `keys`: the first eight bytes of
/// SHA-256(keys..., node_id), stable across processes.
pub fn hash_score(keys: &[String], node_id: &str) -> u64 {
    let mut hasher = Sha256::new();
    for key in keys {
        hasher.update(key.as_bytes());
        hasher.update([0u8]);
    }
    hasher.update(node_id.as_bytes());
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

/// Selects over the services of a [`Registry`], normally a cache.
pub struct RegistrySelector {
    registry: Arc<dyn Registry>,
    strategy: Strategy,
    counter: Arc<AtomicUsize>,
    rng: Arc<Mutex<StdRng>>,
    // failures per service and node since the last reset
    tallies: Mutex<HashMap<String, HashMap<String, u64>>>,
}

impl RegistrySelector {
    pub fn new(registry: Arc<dyn Registry>, strategy: Strategy) -> Self {
        RegistrySelector {
            registry,
            strategy,
            counter: Arc::new(AtomicUsize::new(0)),
            rng: Arc::new(Mutex::new(StdRng::from_entropy())),
            tallies: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    /// Failures recorded for `node` of `service`.
    pub fn failures(&self, service: &str, node: &str) -> u64 {
        lock(&self.tallies)
            .get(service)
            .and_then(|t| t.get(node))
            .copied()
            .unwrap_or(0)
    }

    /// Forgets the tallies of nodes that left `service`.
    fn prune(&self, service: &str, services: &[Service]) {
        let mut tallies = lock(&self.tallies);
        let Some(nodes) = tallies.get_mut(service) else {
            return;
        };
        nodes.retain(|id, _| services.iter().any(|s| s.nodes.iter().any(|n| &n.id == id)));
        if nodes.is_empty() {
            tallies.remove(service);
        }
    }
}

#[async_trait]
impl Selector for RegistrySelector {
    async fn select(&self, service: &str, opt: SelectOpt) -> Result<NodeIter, SelectorError> {
        let mut services = match self.registry.get_service(service).await {
            Ok(services) => services,
            Err(RegistryError::NotFound) => {
                self.reset(service);
                return Err(SelectorError::NotFound(service.to_owned()));
            }
            Err(err) => return Err(err.into()),
        };
        self.prune(service, &services);
        if services.is_empty() {
            return Err(SelectorError::NotFound(service.to_owned()));
        }
        for filter in &opt.filters {
            services = filter(services).map_err(SelectorError::Filter)?;
        }

        let nodes: Vec<Node> = services.into_iter().flat_map(|s| s.nodes).collect();
        if nodes.is_empty() {
            return Err(SelectorError::NoneAvailable(service.to_owned()));
        }
        debug!(service = %service, nodes = nodes.len(), strategy = %self.strategy, "selected");

        let order = match self.strategy {
            Strategy::Random => Order::Random(self.rng.clone()),
            Strategy::RoundRobin => Order::RoundRobin(self.counter.clone()),
            Strategy::SharedHash => Order::SharedHash(
                nodes
                    .iter()
                    .map(|n| Some(hash_score(&opt.keys, &n.id)))
                    .collect(),
            ),
        };
        Ok(NodeIter {
            service: service.to_owned(),
            nodes,
            order,
        })
    }

    fn mark(&self, service: &str, node: &Node, err: Option<&Error>) {
        if let Some(err) = err {
            let mut tallies = lock(&self.tallies);
            let count = tallies
                .entry(service.to_owned())
                .or_default()
                .entry(node.id.clone())
                .or_insert(0);
            *count += 1;
            debug!(service = %service, node = %node.id, failures = *count, error = %err, "call failed");
        }
    }

    fn reset(&self, service: &str) {
        lock(&self.tallies).remove(service);
    }

    fn strategy(&self) -> Strategy {
        self.strategy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use micro_registry::{KvRegistry, MemoryStore, RegisterOpt};
    use std::collections::HashSet;

    async fn registry(ids: &[&str]) -> Arc<dyn Registry> {
        let registry = KvRegistry::new(Arc::new(MemoryStore::new()));
        for (i, id) in ids.iter().enumerate() {
            let svc = Service::new("auth", "1").with_node(Node::new(
                *id,
                "1.0.0",
                format!("127.0.0.1:{}", 7000 + i),
            ));
            registry.register(&svc, RegisterOpt::default()).await.unwrap();
        }
        Arc::new(registry)
    }

    #[tokio::test]
    async fn shared_hash_visits_each_node_once() {
        let selector = RegistrySelector::new(registry(&["a", "b", "c", "d"]).await, Strategy::SharedHash);
        let opt = SelectOpt {
            keys: vec!["user-42".to_owned()],
            ..Default::default()
        };
        let mut iter = selector.select("auth", opt.clone()).await.unwrap();
        let mut seen = Vec::new();
        while let Ok(node) = iter.next_node() {
            seen.push(node.id);
        }
        assert_eq!(4, seen.len());
        assert_eq!(4, seen.iter().collect::<HashSet<_>>().len());

        // same keys, same order
        let mut again = selector.select("auth", opt).await.unwrap();
        assert_eq!(seen[0], again.next_node().unwrap().id);
        assert!(matches!(
            iter.next_node(),
            Err(SelectorError::NoneAvailable(_))
        ));
    }

    #[tokio::test]
    async fn round_robin_is_even() {
        let selector = RegistrySelector::new(registry(&["a", "b", "c"]).await, Strategy::RoundRobin);
        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..10 {
            let mut iter = selector.select("auth", SelectOpt::default()).await.unwrap();
            *counts.entry(iter.next_node().unwrap().id).or_default() += 1;
        }
        assert_eq!(3, counts.len());
        assert!(counts.values().all(|&n| n == 3 || n == 4));
    }

    #[tokio::test]
    async fn random_stays_within_nodes() {
        let selector = RegistrySelector::new(registry(&["a", "b"]).await, Strategy::Random);
        let mut iter = selector.select("auth", SelectOpt::default()).await.unwrap();
        for _ in 0..20 {
            let id = iter.next_node().unwrap().id;
            assert!(id == "a" || id == "b");
        }
    }

    #[tokio::test]
    async fn missing_service_and_empty_filters() {
        let selector = RegistrySelector::new(registry(&["a"]).await, Strategy::SharedHash);
        let err: Error = selector
            .select("billing", SelectOpt::default())
            .await
            .err()
            .unwrap()
            .into();
        assert_eq!(503, err.code);
        assert_eq!(ID_CLIENT_SELECTOR, err.id);

        let drop_all: Filter = Arc::new(|_| Ok(Vec::new()));
        let err = selector
            .select(
                "auth",
                SelectOpt {
                    filters: vec![drop_all],
                    ..Default::default()
                },
            )
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SelectorError::NoneAvailable(_)));

        let reject: Filter = Arc::new(|_| Err(Error::forbidden("filter", "nope")));
        let err: Error = selector
            .select(
                "auth",
                SelectOpt {
                    filters: vec![reject],
                    ..Default::default()
                },
            )
            .await
            .err()
            .unwrap()
            .into();
        assert_eq!(403, err.code);
        assert_eq!(ID_CLIENT_SELECTOR, err.id);
    }

    #[tokio::test]
    async fn mark_and_reset_tallies() {
        let selector = RegistrySelector::new(registry(&["a"]).await, Strategy::SharedHash);
        let node = Node::new("a", "1.0.0", "127.0.0.1:7000");
        let err = Error::internal_server_error("x", "boom");
        selector.mark("auth", &node, Some(&err));
        selector.mark("auth", &node, Some(&err));
        selector.mark("auth", &node, None);
        assert_eq!(2, selector.failures("auth", "a"));
        selector.reset("auth");
        assert_eq!(0, selector.failures("auth", "a"));
    }

    #[tokio::test]
    async fn tallies_follow_registry_nodes() {
        let registry = registry(&["a", "b"]).await;
        let selector = RegistrySelector::new(registry.clone(), Strategy::RoundRobin);
        let err = Error::internal_server_error(micro_protocol::ID_CLIENT_CALL, "down");
        for id in ["a", "b"] {
            let node = Node::new(id, "1.0.0", "127.0.0.1:7000");
            selector.mark("auth", &node, Some(&err));
        }
        assert_eq!(1, selector.failures("auth", "a"));

        let gone = Service::new("auth", "1").with_node(Node::new("a", "1.0.0", "127.0.0.1:7000"));
        registry.deregister(&gone).await.unwrap();
        selector.select("auth", SelectOpt::default()).await.unwrap();
        assert_eq!(0, selector.failures("auth", "a"));
        assert_eq!(1, selector.failures("auth", "b"));

        let last = Service::new("auth", "1").with_node(Node::new("b", "1.0.0", "127.0.0.1:7001"));
        registry.deregister(&last).await.unwrap();
        assert!(selector.select("auth", SelectOpt::default()).await.is_err());
        assert!(lock(&selector.tallies).is_empty());
    }
}
