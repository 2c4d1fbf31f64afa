use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::util::merge;
use crate::{
    Action, Event, KvEvent, KvEventKind, KvStore, KvWatch, Node, RegisterOpt, Registry,
    RegistryError, Result, Service, WatchOpt, Watcher,
};

pub const DEFAULT_PREFIX: &str = "/micro/registry/";

const REGISTER_ATTEMPTS: u32 = 3;
const REGISTER_BACKOFF: Duration = Duration::from_millis(100);

/// A [`Registry`] persisting one JSON record per node under
/// `<prefix><service>/<node>`.
pub struct KvRegistry<S: KvStore> {
    store: Arc<S>,
    prefix: String,
    // content hash of every record written by this registry, by key
    registered: Mutex<HashMap<String, [u8; 32]>>,
}

impl<S: KvStore> KvRegistry<S> {
    pub fn new(store: Arc<S>) -> Self {
        KvRegistry::with_prefix(store, DEFAULT_PREFIX)
    }

    pub fn with_prefix(store: Arc<S>, prefix: impl Into<String>) -> Self {
        let mut prefix = prefix.into();
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        KvRegistry {
            store,
            prefix,
            registered: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    fn service_prefix(&self, name: &str) -> String {
        format!("{}{}/", self.prefix, encode(name))
    }

    fn node_key(&self, name: &str, node_id: &str) -> String {
        format!("{}{}/{}", self.prefix, encode(name), encode(node_id))
    }

    async fn put_with_retry(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.store.put(key, value.to_vec(), ttl).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_transient() && attempt + 1 < REGISTER_ATTEMPTS => {
                    let delay = REGISTER_BACKOFF * 2u32.pow(attempt);
                    warn!(key = %key, attempt, error = %err, "registration failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn encode(s: &str) -> String {
    s.replace('/', "-")
}

fn decode(kv_value: &[u8]) -> Result<Service> {
    Ok(serde_json::from_slice(kv_value)?)
}

#[async_trait]
impl<S: KvStore> Registry for KvRegistry<S> {
    async fn register(&self, service: &Service, opt: RegisterOpt) -> Result<()> {
        if service.name.is_empty() {
            return Err(RegistryError::Invalid("service name is empty".to_owned()));
        }
        if service.nodes.is_empty() {
            return Err(RegistryError::Invalid(format!(
                "service {} has no nodes",
                service.name
            )));
        }

        for node in &service.nodes {
            let record = Service {
                nodes: vec![node.clone()],
                ..service.clone()
            };
            let value = serde_json::to_vec(&record)?;
            let hash: [u8; 32] = Sha256::digest(&value).into();
            let key = self.node_key(&service.name, &node.id);

            let unchanged = self.registered.lock().await.get(&key) == Some(&hash);
            if unchanged {
                match opt.ttl {
                    Some(ttl) => {
                        if self.store.keep_alive(&key, ttl).await? {
                            debug!(key = %key, "lease renewed");
                            continue;
                        }
                    }
                    None => continue,
                }
            }

            self.put_with_retry(&key, &value, opt.ttl).await?;
            debug!(key = %key, "registered node");
            self.registered.lock().await.insert(key, hash);
        }
        Ok(())
    }

    async fn deregister(&self, service: &Service) -> Result<()> {
        let mut first_err = None;
        for node in &service.nodes {
            let key = self.node_key(&service.name, &node.id);
            match self.store.delete(&key).await {
                Ok(()) => {
                    self.registered.lock().await.remove(&key);
                }
                Err(err) => {
                    warn!(key = %key, error = %err, "deregistration failed");
                    first_err.get_or_insert(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn get_service(&self, name: &str) -> Result<Vec<Service>> {
        let kvs = self.store.get_prefix(&self.service_prefix(name)).await?;
        let mut records = Vec::with_capacity(kvs.len());
        for kv in kvs {
            let record = decode(&kv.value)?;
            if record.name == name {
                records.push(record);
            }
        }
        if records.is_empty() {
            return Err(RegistryError::NotFound);
        }
        let mut services = merge(&[], &records);
        services.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(services)
    }

    async fn list_services(&self) -> Result<Vec<Service>> {
        let kvs = self.store.get_prefix(&self.prefix).await?;
        let mut records = Vec::with_capacity(kvs.len());
        for kv in kvs {
            records.push(decode(&kv.value)?);
        }
        let mut services = merge(&[], &records);
        services.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.version.cmp(&b.version)));
        Ok(services)
    }

    async fn watch(&self, opt: WatchOpt) -> Result<Box<dyn Watcher>> {
        let prefix = match &opt.service {
            Some(name) => self.service_prefix(name),
            None => self.prefix.clone(),
        };
        let inner = self.store.watch_prefix(&prefix).await?;
        Ok(Box::new(KvWatcher {
            inner,
            prefix: self.prefix.clone(),
            service: opt.service,
        }))
    }

    fn name(&self) -> &str {
        "kv"
    }
}

struct KvWatcher {
    inner: Box<dyn KvWatch>,
    prefix: String,
    service: Option<String>,
}

impl KvWatcher {
    fn to_event(&self, ev: KvEvent) -> Result<Event> {
        match ev.kind {
            KvEventKind::Put => Ok(Event {
                action: if ev.prev_value.is_some() {
                    Action::Update
                } else {
                    Action::Create
                },
                service: decode(&ev.value)?,
            }),
            KvEventKind::Delete => {
                let service = match ev.prev_value {
                    Some(prev) => decode(&prev)?,
                    None => self.from_key(&ev.key)?,
                };
                Ok(Event {
                    action: Action::Delete,
                    service,
                })
            }
        }
    }

    // best effort when the backend does not report the deleted value. Key
    // segments are hyphen-encoded, so the name is only exact when it matches
    // the watched service.
    fn from_key(&self, key: &str) -> Result<Service> {
        let rest = key.strip_prefix(&self.prefix).unwrap_or(key);
        let (segment, id) = rest
            .split_once('/')
            .ok_or_else(|| RegistryError::Invalid(format!("unexpected registry key {}", key)))?;
        let name = match &self.service {
            Some(name) if encode(name) == segment => name.clone(),
            _ => segment.to_owned(),
        };
        Ok(Service {
            name,
            nodes: vec![Node {
                id: id.to_owned(),
                ..Default::default()
            }],
            ..Default::default()
        })
    }
}

#[async_trait]
impl Watcher for KvWatcher {
    async fn next(&mut self) -> Result<Event> {
        loop {
            let ev = self.inner.next().await?;
            let event = self.to_event(ev)?;
            if let Some(name) = &self.service {
                if &event.service.name != name {
                    continue;
                }
            }
            return Ok(event);
        }
    }

    fn stop(&self) {
        self.inner.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Endpoint, KeyValue, MemoryStore};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn auth(id: &str, version: &str, addr: &str) -> Service {
        Service::new("auth", version)
            .with_endpoint(Endpoint::new("Login"))
            .with_node(Node::new(id, format!("{}.0.0", version), addr))
    }

    #[tokio::test]
    async fn register_and_get() {
        let store = Arc::new(MemoryStore::new());
        let registry = KvRegistry::new(store.clone());
        registry
            .register(&auth("a1", "1", "127.0.0.1:1"), RegisterOpt::default())
            .await
            .unwrap();
        registry
            .register(&auth("a2", "1", "127.0.0.1:2"), RegisterOpt::default())
            .await
            .unwrap();
        registry
            .register(&auth("b1", "2", "127.0.0.1:3"), RegisterOpt::default())
            .await
            .unwrap();

        let kvs = store.get_prefix("/micro/registry/auth/").await.unwrap();
        assert_eq!(3, kvs.len());
        assert_eq!("/micro/registry/auth/a1", kvs[0].key);

        let services = registry.get_service("auth").await.unwrap();
        assert_eq!(2, services.len());
        assert_eq!("1", services[0].version);
        assert_eq!(2, services[0].nodes.len());
        assert_eq!("2", services[1].version);
        assert_eq!(1, services[1].nodes.len());
    }

    #[tokio::test]
    async fn missing_service_is_not_found() {
        let registry = KvRegistry::new(Arc::new(MemoryStore::new()));
        assert!(matches!(
            registry.get_service("nope").await,
            Err(RegistryError::NotFound)
        ));
    }

    #[tokio::test]
    async fn slashes_in_names_become_hyphens() {
        let store = Arc::new(MemoryStore::new());
        let registry = KvRegistry::new(store.clone());
        let svc = Service::new("org/auth", "1").with_node(Node::new("n/1", "1.0.0", "h:1"));
        registry.register(&svc, RegisterOpt::default()).await.unwrap();
        let kvs = store.get_prefix("/micro/registry/").await.unwrap();
        assert_eq!("/micro/registry/org-auth/n-1", kvs[0].key);
        assert_eq!(1, registry.get_service("org/auth").await.unwrap().len());
    }

    #[tokio::test]
    async fn list_is_sorted_and_merged() {
        let registry = KvRegistry::new(Arc::new(MemoryStore::new()));
        for svc in [
            Service::new("zeta", "1").with_node(Node::new("z1", "1.0.0", "h:1")),
            Service::new("alpha", "1").with_node(Node::new("a1", "1.0.0", "h:2")),
            Service::new("alpha", "1").with_node(Node::new("a2", "1.0.0", "h:3")),
        ] {
            registry.register(&svc, RegisterOpt::default()).await.unwrap();
        }
        let services = registry.list_services().await.unwrap();
        let names: Vec<_> = services.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(vec!["alpha", "zeta"], names);
        assert_eq!(2, services[0].nodes.len());
    }

    #[tokio::test]
    async fn reject_invalid_registrations() {
        let registry = KvRegistry::new(Arc::new(MemoryStore::new()));
        let err = registry
            .register(&Service::new("", "1"), RegisterOpt::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Invalid(_)));
        let err = registry
            .register(&Service::new("svc", "1"), RegisterOpt::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Invalid(_)));
    }

    /// Counts writes and fails the first `fail_puts` of them.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        puts: AtomicUsize,
        keep_alives: AtomicUsize,
        fail_puts: usize,
        fail_deletes: bool,
    }

    #[async_trait]
    impl KvStore for FlakyStore {
        async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
            self.inner.get_prefix(prefix).await
        }
        async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
            let n = self.puts.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_puts {
                return Err(RegistryError::Transport("connection reset".to_owned()));
            }
            self.inner.put(key, value, ttl).await
        }
        async fn keep_alive(&self, key: &str, ttl: Duration) -> Result<bool> {
            self.keep_alives.fetch_add(1, Ordering::SeqCst);
            self.inner.keep_alive(key, ttl).await
        }
        async fn delete(&self, key: &str) -> Result<()> {
            if self.fail_deletes {
                return Err(RegistryError::Timeout);
            }
            self.inner.delete(key).await
        }
        async fn watch_prefix(&self, prefix: &str) -> Result<Box<dyn KvWatch>> {
            self.inner.watch_prefix(prefix).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn register_retries_transient_errors() {
        let store = Arc::new(FlakyStore {
            fail_puts: 2,
            ..Default::default()
        });
        let registry = KvRegistry::new(store.clone());
        registry
            .register(&auth("a1", "1", "h:1"), RegisterOpt::default())
            .await
            .unwrap();
        assert_eq!(3, store.puts.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn register_gives_up_after_three_attempts() {
        let store = Arc::new(FlakyStore {
            fail_puts: 5,
            ..Default::default()
        });
        let registry = KvRegistry::new(store.clone());
        let err = registry
            .register(&auth("a1", "1", "h:1"), RegisterOpt::default())
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(3, store.puts.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn unchanged_record_refreshes_lease() {
        let store = Arc::new(FlakyStore::default());
        let registry = KvRegistry::new(store.clone());
        let opt = RegisterOpt {
            ttl: Some(Duration::from_secs(30)),
        };
        let svc = auth("a1", "1", "h:1");
        registry.register(&svc, opt.clone()).await.unwrap();
        registry.register(&svc, opt.clone()).await.unwrap();
        assert_eq!(1, store.puts.load(Ordering::SeqCst));
        assert_eq!(1, store.keep_alives.load(Ordering::SeqCst));

        let moved = auth("a1", "1", "h:2");
        registry.register(&moved, opt).await.unwrap();
        assert_eq!(2, store.puts.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn deregister_surfaces_failure() {
        let store = Arc::new(FlakyStore {
            fail_deletes: true,
            ..Default::default()
        });
        let registry = KvRegistry::new(store);
        let svc = auth("a1", "1", "h:1");
        registry.register(&svc, RegisterOpt::default()).await.unwrap();
        assert!(matches!(
            registry.deregister(&svc).await,
            Err(RegistryError::Timeout)
        ));
    }

    #[tokio::test]
    async fn watch_maps_actions() {
        let registry = KvRegistry::new(Arc::new(MemoryStore::new()));
        let mut watcher = registry
            .watch(WatchOpt {
                service: Some("auth".to_owned()),
            })
            .await
            .unwrap();

        let v1 = auth("a1", "1", "h:1");
        registry.register(&v1, RegisterOpt::default()).await.unwrap();
        registry
            .register(
                &Service::new("other", "1").with_node(Node::new("o", "1.0.0", "h:9")),
                RegisterOpt::default(),
            )
            .await
            .unwrap();
        registry
            .register(&auth("a1", "1", "h:2"), RegisterOpt::default())
            .await
            .unwrap();
        registry.deregister(&v1).await.unwrap();

        let ev = watcher.next().await.unwrap();
        assert_eq!(Action::Create, ev.action);
        assert_eq!(v1, ev.service);
        let ev = watcher.next().await.unwrap();
        assert_eq!(Action::Update, ev.action);
        assert_eq!("h:2", ev.service.nodes[0].address);
        let ev = watcher.next().await.unwrap();
        assert_eq!(Action::Delete, ev.action);
        assert_eq!("a1", ev.service.nodes[0].id);

        watcher.stop();
        assert!(matches!(
            watcher.next().await,
            Err(RegistryError::WatcherStopped)
        ));
    }

    struct Replay(std::collections::VecDeque<KvEvent>);

    #[async_trait]
    impl KvWatch for Replay {
        async fn next(&mut self) -> Result<KvEvent> {
            self.0.pop_front().ok_or(RegistryError::WatcherStopped)
        }

        fn stop(&self) {}
    }

    #[tokio::test]
    async fn delete_without_prev_value_keeps_slashed_name() {
        let delete = KvEvent {
            kind: KvEventKind::Delete,
            key: "/micro/registry/org-auth/n1".to_owned(),
            value: Vec::new(),
            prev_value: None,
        };
        let mut watcher = KvWatcher {
            inner: Box::new(Replay(vec![delete].into())),
            prefix: DEFAULT_PREFIX.to_owned(),
            service: Some("org/auth".to_owned()),
        };
        let ev = watcher.next().await.unwrap();
        assert_eq!(Action::Delete, ev.action);
        assert_eq!("org/auth", ev.service.name);
        assert_eq!("n1", ev.service.nodes[0].id);
        assert!(watcher.next().await.is_err());
    }
}
