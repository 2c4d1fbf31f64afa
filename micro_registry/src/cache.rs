use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::util::{merge, remove};
use crate::{
    Action, Event, RegisterOpt, Registry, RegistryError, Result, Service, WatchOpt, Watcher,
};

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct CacheOpt {
    pub ttl: Duration,
}

impl Default for CacheOpt {
    fn default() -> Self {
        CacheOpt {
            ttl: DEFAULT_CACHE_TTL,
        }
    }
}

struct Entry {
    services: Vec<Service>,
    fetched: Instant,
    // millis since the cache epoch; bumped by readers under the read lock
    last_read: AtomicU64,
    // set when the watcher died, the entry must be re-fetched before use
    stale: bool,
    watch: Option<CancellationToken>,
}

struct Inner {
    ttl: Duration,
    epoch: Instant,
    entries: RwLock<HashMap<String, Entry>>,
    stop: CancellationToken,
}

impl Inner {
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn idle(&self, entry: &Entry, now_ms: u64) -> bool {
        now_ms.saturating_sub(entry.last_read.load(Ordering::Relaxed)) >= self.ttl.as_millis() as u64
    }

    fn evict_idle_locked(&self, entries: &mut HashMap<String, Entry>) {
        let now_ms = self.now_ms();
        entries.retain(|name, entry| {
            if !self.idle(entry, now_ms) {
                return true;
            }
            debug!(service = %name, "evicting idle cache entry");
            if let Some(token) = &entry.watch {
                token.cancel();
            }
            false
        });
    }

    async fn apply(&self, name: &str, event: Event) {
        let mut entries = self.entries.write().await;
        let entry = match entries.get_mut(name) {
            Some(entry) => entry,
            None => return,
        };
        let services = match event.action {
            Action::Create | Action::Update => merge(&entry.services, &[event.service]),
            Action::Delete => remove(&entry.services, &[event.service]),
        };
        if services.is_empty() {
            if let Some(token) = &entry.watch {
                token.cancel();
            }
            entries.remove(name);
            debug!(service = %name, "cache entry emptied by watch");
            return;
        }
        entry.services = services;
        entry.fetched = Instant::now();
        self.evict_idle_locked(&mut entries);
    }

    async fn mark_stale(&self, name: &str) {
        if let Some(entry) = self.entries.write().await.get_mut(name) {
            entry.stale = true;
            entry.watch = None;
        }
    }
}

/// Read-through TTL cache in front of another [`Registry`].
///
/// The first lookup of a name goes to the registry and starts a watcher that
/// keeps the entry current. An expired entry is refreshed on read and, should
/// the refresh fail with a transient error, served as is. A refresh answered
/// with not-found drops the entry. An entry whose watcher died is never served
/// without a successful refresh. Writes and watches are passed through.
pub struct Cache {
    registry: Arc<dyn Registry>,
    inner: Arc<Inner>,
}

impl Cache {
    pub fn new(registry: Arc<dyn Registry>, opt: CacheOpt) -> Self {
        Cache {
            registry,
            inner: Arc::new(Inner {
                ttl: opt.ttl,
                epoch: Instant::now(),
                entries: RwLock::new(HashMap::new()),
                stop: CancellationToken::new(),
            }),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    /// Stops every watcher. Lookups keep working but go to the registry once
    /// their entry expires.
    pub fn stop(&self) {
        self.inner.stop.cancel();
    }

    /// Drops the entries nobody read for a full TTL.
    pub async fn evict_idle(&self) {
        let mut entries = self.inner.entries.write().await;
        self.inner.evict_idle_locked(&mut entries);
    }

    fn spawn_watcher(&self, name: String) -> CancellationToken {
        let token = self.inner.stop.child_token();
        let registry = self.registry.clone();
        let inner = self.inner.clone();
        let cancelled = token.clone();
        tokio::spawn(async move {
            let watch = WatchOpt {
                service: Some(name.clone()),
            };
            let mut watcher = match registry.watch(watch).await {
                Ok(w) => w,
                Err(err) => {
                    warn!(service = %name, error = %err, "failed to start cache watcher");
                    inner.mark_stale(&name).await;
                    return;
                }
            };
            loop {
                let next = tokio::select! {
                    _ = cancelled.cancelled() => None,
                    next = watcher.next() => Some(next),
                };
                match next {
                    None => {
                        watcher.stop();
                        return;
                    }
                    Some(Ok(event)) => inner.apply(&name, event).await,
                    Some(Err(err)) => {
                        warn!(service = %name, error = %err, "cache watcher lost");
                        inner.mark_stale(&name).await;
                        return;
                    }
                }
            }
        });
        token
    }

    async fn drop_entry(&self, name: &str) {
        if let Some(entry) = self.inner.entries.write().await.remove(name) {
            if let Some(token) = entry.watch {
                token.cancel();
            }
            debug!(service = %name, "registry no longer knows service, dropping cache entry");
        }
    }

    async fn lookup(&self, name: &str) -> Result<Vec<Service>> {
        let fallback = {
            let entries = self.inner.entries.read().await;
            match entries.get(name) {
                Some(entry) => {
                    entry.last_read.store(self.inner.now_ms(), Ordering::Relaxed);
                    if !entry.stale {
                        if entry.fetched.elapsed() < self.inner.ttl {
                            return Ok(entry.services.clone());
                        }
                        Some(entry.services.clone())
                    } else {
                        None
                    }
                }
                None => None,
            }
        };

        let services = match self.registry.get_service(name).await {
            Ok(services) => services,
            Err(RegistryError::NotFound) => {
                self.drop_entry(name).await;
                return Err(RegistryError::NotFound);
            }
            Err(err) => {
                return match fallback {
                    Some(services) if err.is_transient() && !services.is_empty() => {
                        warn!(service = %name, error = %err, "registry refresh failed, serving expired entry");
                        Ok(services)
                    }
                    _ => Err(err),
                };
            }
        };

        let mut entries = self.inner.entries.write().await;
        self.inner.evict_idle_locked(&mut entries);
        let now_ms = self.inner.now_ms();
        let watching = entries
            .get(name)
            .and_then(|e| e.watch.as_ref())
            .map_or(false, |t| !t.is_cancelled());
        let watch = if watching {
            entries.get_mut(name).and_then(|e| e.watch.take())
        } else {
            Some(self.spawn_watcher(name.to_owned()))
        };
        entries.insert(
            name.to_owned(),
            Entry {
                services: services.clone(),
                fetched: Instant::now(),
                last_read: AtomicU64::new(now_ms),
                stale: false,
                watch,
            },
        );
        Ok(services)
    }
}

#[async_trait]
impl Registry for Cache {
    async fn register(&self, service: &Service, opt: RegisterOpt) -> Result<()> {
        self.registry.register(service, opt).await
    }

    async fn deregister(&self, service: &Service) -> Result<()> {
        self.registry.deregister(service).await
    }

    async fn get_service(&self, name: &str) -> Result<Vec<Service>> {
        self.lookup(name).await
    }

    async fn list_services(&self) -> Result<Vec<Service>> {
        self.registry.list_services().await
    }

    async fn watch(&self, opt: WatchOpt) -> Result<Box<dyn Watcher>> {
        self.registry.watch(opt).await
    }

    fn name(&self) -> &str {
        "cache"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Node;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct TestRegistry {
        services: Mutex<Vec<Service>>,
        gets: AtomicUsize,
        fail: AtomicBool,
        watchers: Mutex<Vec<mpsc::UnboundedSender<Result<Event>>>>,
        stopped: Arc<AtomicUsize>,
    }

    impl TestRegistry {
        fn with(services: Vec<Service>) -> Arc<Self> {
            let r = TestRegistry::default();
            *r.services.lock().unwrap() = services;
            Arc::new(r)
        }

        fn gets(&self) -> usize {
            self.gets.load(Ordering::SeqCst)
        }

        fn send(&self, ev: Result<Event>) {
            for tx in self.watchers.lock().unwrap().iter() {
                let _ = tx.send(match &ev {
                    Ok(e) => Ok(e.clone()),
                    Err(_) => Err(RegistryError::Transport("watch broken".to_owned())),
                });
            }
        }
    }

    struct ChanWatcher {
        rx: mpsc::UnboundedReceiver<Result<Event>>,
        stop: CancellationToken,
        stopped: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Watcher for ChanWatcher {
        async fn next(&mut self) -> Result<Event> {
            tokio::select! {
                _ = self.stop.cancelled() => Err(RegistryError::WatcherStopped),
                ev = self.rx.recv() => ev.unwrap_or(Err(RegistryError::WatcherStopped)),
            }
        }

        fn stop(&self) {
            self.stopped.fetch_add(1, Ordering::SeqCst);
            self.stop.cancel();
        }
    }

    #[async_trait]
    impl Registry for TestRegistry {
        async fn register(&self, _: &Service, _: RegisterOpt) -> Result<()> {
            Ok(())
        }
        async fn deregister(&self, _: &Service) -> Result<()> {
            Ok(())
        }
        async fn get_service(&self, name: &str) -> Result<Vec<Service>> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(RegistryError::Timeout);
            }
            let found: Vec<_> = self
                .services
                .lock()
                .unwrap()
                .iter()
                .filter(|s| s.name == name)
                .cloned()
                .collect();
            if found.is_empty() {
                Err(RegistryError::NotFound)
            } else {
                Ok(found)
            }
        }
        async fn list_services(&self) -> Result<Vec<Service>> {
            Ok(self.services.lock().unwrap().clone())
        }
        async fn watch(&self, _: WatchOpt) -> Result<Box<dyn Watcher>> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.watchers.lock().unwrap().push(tx);
            Ok(Box::new(ChanWatcher {
                rx,
                stop: CancellationToken::new(),
                stopped: self.stopped.clone(),
            }))
        }
        fn name(&self) -> &str {
            "test"
        }
    }

    fn auth(ids: &[&str]) -> Service {
        let mut svc = Service::new("auth", "1");
        for id in ids {
            svc = svc.with_node(Node::new(*id, "1.0.0", "127.0.0.1:1"));
        }
        svc
    }

    async fn wait_for(cond: impl Fn() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    async fn node_count(cache: &Cache) -> Option<usize> {
        let entries = cache.inner.entries.read().await;
        entries
            .get("auth")
            .map(|e| e.services.iter().map(|s| s.nodes.len()).sum())
    }

    #[tokio::test]
    async fn hit_within_ttl() {
        let registry = TestRegistry::with(vec![auth(&["a1"])]);
        let cache = Cache::new(registry.clone(), CacheOpt::default());
        assert_eq!(1, cache.get_service("auth").await.unwrap().len());
        assert_eq!(1, cache.get_service("auth").await.unwrap().len());
        assert_eq!(1, registry.gets());
        cache.stop();
    }

    #[tokio::test]
    async fn cold_miss_surfaces_registry_error() {
        let registry = TestRegistry::with(vec![]);
        let cache = Cache::new(registry.clone(), CacheOpt::default());
        assert!(matches!(
            cache.get_service("auth").await,
            Err(RegistryError::NotFound)
        ));
        registry.fail.store(true, Ordering::SeqCst);
        assert!(matches!(
            cache.get_service("auth").await,
            Err(RegistryError::Timeout)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entry_is_refreshed_or_served_on_error() {
        let registry = TestRegistry::with(vec![auth(&["a1"])]);
        let cache = Cache::new(
            registry.clone(),
            CacheOpt {
                ttl: Duration::from_secs(10),
            },
        );
        cache.get_service("auth").await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        cache.get_service("auth").await.unwrap();
        assert_eq!(1, registry.gets());

        tokio::time::advance(Duration::from_secs(6)).await;
        cache.get_service("auth").await.unwrap();
        assert_eq!(2, registry.gets());

        tokio::time::advance(Duration::from_secs(11)).await;
        registry.fail.store(true, Ordering::SeqCst);
        let services = cache.get_service("auth").await.unwrap();
        assert_eq!("a1", services[0].nodes[0].id);
        assert_eq!(3, registry.gets());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entry_is_dropped_when_service_is_gone() {
        let registry = TestRegistry::with(vec![auth(&["a1"])]);
        let cache = Cache::new(
            registry.clone(),
            CacheOpt {
                ttl: Duration::from_secs(10),
            },
        );
        cache.get_service("auth").await.unwrap();
        wait_for(|| !registry.watchers.lock().unwrap().is_empty()).await;

        // the delete event never reaches the watcher
        registry.services.lock().unwrap().clear();
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(matches!(
            cache.get_service("auth").await,
            Err(RegistryError::NotFound)
        ));
        assert_eq!(None, node_count(&cache).await);
        wait_for(|| registry.stopped.load(Ordering::SeqCst) == 1).await;

        assert!(matches!(
            cache.get_service("auth").await,
            Err(RegistryError::NotFound)
        ));
        assert_eq!(3, registry.gets());
    }

    #[tokio::test]
    async fn watch_events_rewrite_entry() {
        let registry = TestRegistry::with(vec![auth(&["a1"])]);
        let cache = Cache::new(registry.clone(), CacheOpt::default());
        cache.get_service("auth").await.unwrap();
        wait_for(|| !registry.watchers.lock().unwrap().is_empty()).await;

        registry.send(Ok(Event {
            action: Action::Create,
            service: auth(&["a2"]),
        }));
        for _ in 0..200 {
            if node_count(&cache).await == Some(2) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(2, cache.get_service("auth").await.unwrap()[0].nodes.len());

        registry.send(Ok(Event {
            action: Action::Delete,
            service: auth(&["a1", "a2"]),
        }));
        for _ in 0..200 {
            if node_count(&cache).await.is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(None, node_count(&cache).await);
        wait_for(|| registry.stopped.load(Ordering::SeqCst) == 1).await;

        cache.get_service("auth").await.unwrap();
        assert_eq!(2, registry.gets());
    }

    #[tokio::test]
    async fn lost_watcher_forces_refetch() {
        let registry = TestRegistry::with(vec![auth(&["a1"])]);
        let cache = Cache::new(registry.clone(), CacheOpt::default());
        cache.get_service("auth").await.unwrap();
        wait_for(|| !registry.watchers.lock().unwrap().is_empty()).await;

        registry.send(Err(RegistryError::Transport(String::new())));
        for _ in 0..200 {
            if cache.inner.entries.read().await.get("auth").map(|e| e.stale) == Some(true) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        registry.fail.store(true, Ordering::SeqCst);
        assert!(matches!(
            cache.get_service("auth").await,
            Err(RegistryError::Timeout)
        ));

        registry.fail.store(false, Ordering::SeqCst);
        cache.get_service("auth").await.unwrap();
        assert_eq!(3, registry.gets());
        wait_for(|| registry.watchers.lock().unwrap().len() == 2).await;
        cache.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn idle_entries_are_evicted() {
        let registry = TestRegistry::with(vec![auth(&["a1"])]);
        let cache = Cache::new(
            registry.clone(),
            CacheOpt {
                ttl: Duration::from_secs(10),
            },
        );
        cache.get_service("auth").await.unwrap();
        wait_for(|| !registry.watchers.lock().unwrap().is_empty()).await;

        tokio::time::advance(Duration::from_secs(10)).await;
        cache.evict_idle().await;
        assert_eq!(None, node_count(&cache).await);
        wait_for(|| registry.stopped.load(Ordering::SeqCst) == 1).await;
    }

    #[tokio::test]
    async fn stop_cancels_watchers() {
        let registry = TestRegistry::with(vec![auth(&["a1"])]);
        let cache = Cache::new(registry.clone(), CacheOpt::default());
        cache.get_service("auth").await.unwrap();
        wait_for(|| !registry.watchers.lock().unwrap().is_empty()).await;
        cache.stop();
        wait_for(|| registry.stopped.load(Ordering::SeqCst) == 1).await;
    }
}
