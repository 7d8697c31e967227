//! Cache behavior: expiry clocks, miss coalescing, offline fallback.

use async_trait::async_trait;
use bulwark_envelope::{Algorithm, SecretKey};
use bulwark_keystore::{
    CacheExpiry, Identity, KeyCache, KeyRecord, KeyStore, MemStore, NameIter, StoreError,
    StoreState, StoreStatus,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Wraps a real store, counting `get` calls and faking reachability.
struct ProbeStore {
    inner: MemStore,
    gets: AtomicUsize,
    reachable: AtomicBool,
    get_delay: Duration,
}

impl ProbeStore {
    fn new() -> Self {
        Self {
            inner: MemStore::new(),
            gets: AtomicUsize::new(0),
            reachable: AtomicBool::new(true),
            get_delay: Duration::ZERO,
        }
    }

    fn with_get_delay(mut self, delay: Duration) -> Self {
        self.get_delay = delay;
        self
    }

    fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    fn set_reachable(&self, up: bool) {
        self.reachable.store(up, Ordering::SeqCst);
    }
}

#[async_trait]
impl KeyStore for ProbeStore {
    async fn status(&self) -> StoreStatus {
        let state = if self.reachable.load(Ordering::SeqCst) {
            StoreState::Available
        } else {
            StoreState::Unreachable
        };
        StoreStatus {
            state,
            latency: Duration::ZERO,
        }
    }

    async fn create(&self, name: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.inner.create(name, value).await
    }

    async fn get(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if !self.get_delay.is_zero() {
            tokio::time::sleep(self.get_delay).await;
        }
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(StoreError::Unreachable("probe store is down".into()));
        }
        self.inner.get(name).await
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.inner.delete(name).await
    }

    async fn list(&self) -> Result<NameIter, StoreError> {
        self.inner.list().await
    }
}

async fn seed(store: &ProbeStore, name: &str) -> SecretKey {
    let key = SecretKey::generate(Algorithm::native()).unwrap();
    let record = KeyRecord::new(&key, Identity::new("seed").unwrap());
    store.create(name, record.to_vec()).await.unwrap();
    key
}

fn expiry(any: u64, unused: u64, offline: u64) -> CacheExpiry {
    CacheExpiry {
        any: Duration::from_secs(any),
        unused: Duration::from_secs(unused),
        offline: Duration::from_secs(offline),
    }
}

#[tokio::test]
async fn hit_after_miss_uses_cache() {
    let probe = Arc::new(ProbeStore::new());
    let key = seed(&probe, "k").await;
    let store: Arc<dyn KeyStore> = probe.clone();
    let cache = KeyCache::new(CacheExpiry::default());

    let first = cache.get(&store, "k").await.unwrap();
    let second = cache.get(&store, "k").await.unwrap();
    assert_eq!(first.as_bytes(), key.as_bytes());
    assert_eq!(second.as_bytes(), key.as_bytes());
    assert_eq!(probe.get_count(), 1);
}

#[tokio::test]
async fn missing_key_error_is_shared_not_cached() {
    let probe = Arc::new(ProbeStore::new());
    let store: Arc<dyn KeyStore> = probe.clone();
    let cache = KeyCache::new(CacheExpiry::default());

    assert!(matches!(
        cache.get(&store, "ghost").await,
        Err(StoreError::NotFound(_))
    ));
    assert!(cache.is_empty());

    // A later get retries the backend rather than caching the failure.
    cache.get(&store, "ghost").await.unwrap_err();
    assert_eq!(probe.get_count(), 2);
}

#[tokio::test]
async fn concurrent_misses_coalesce_to_one_fetch() {
    let probe = Arc::new(ProbeStore::new().with_get_delay(Duration::from_millis(50)));
    seed(&probe, "k2").await;
    let store: Arc<dyn KeyStore> = probe.clone();
    let cache = Arc::new(KeyCache::new(CacheExpiry::default()));

    let mut tasks = Vec::new();
    for _ in 0..100 {
        let cache = cache.clone();
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            cache.get(&store, "k2").await.map(|k| *k.as_bytes())
        }));
    }

    let mut results = Vec::new();
    for task in tasks {
        results.push(task.await.unwrap().unwrap());
    }
    assert!(results.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(probe.get_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn idle_entries_expire() {
    let probe = Arc::new(ProbeStore::new());
    seed(&probe, "k").await;
    let store: Arc<dyn KeyStore> = probe.clone();
    let cache = KeyCache::new(expiry(300, 30, 0));

    cache.get(&store, "k").await.unwrap();
    tokio::time::advance(Duration::from_secs(31)).await;
    cache.get(&store, "k").await.unwrap();
    assert_eq!(probe.get_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn access_resets_the_idle_clock() {
    let probe = Arc::new(ProbeStore::new());
    seed(&probe, "k").await;
    let store: Arc<dyn KeyStore> = probe.clone();
    let cache = KeyCache::new(expiry(300, 30, 0));

    cache.get(&store, "k").await.unwrap();
    for _ in 0..10 {
        tokio::time::advance(Duration::from_secs(20)).await;
        cache.get(&store, "k").await.unwrap();
    }
    assert_eq!(probe.get_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn hard_ttl_bounds_staleness_even_when_busy() {
    let probe = Arc::new(ProbeStore::new());
    seed(&probe, "k").await;
    let store: Arc<dyn KeyStore> = probe.clone();
    let cache = KeyCache::new(expiry(300, 30, 0));

    cache.get(&store, "k").await.unwrap();
    // Keep the entry busy past the hard TTL.
    for _ in 0..15 {
        tokio::time::advance(Duration::from_secs(25)).await;
        cache.get(&store, "k").await.unwrap();
    }
    assert!(probe.get_count() >= 2);
}

#[tokio::test(start_paused = true)]
async fn stale_entry_serves_while_backend_down() {
    let probe = Arc::new(ProbeStore::new());
    let key = seed(&probe, "k").await;
    let store: Arc<dyn KeyStore> = probe.clone();
    let cache = KeyCache::new(expiry(300, 600, 600));

    cache.get(&store, "k").await.unwrap();
    probe.set_reachable(false);

    // Two minutes past the hard TTL, backend unreachable: offline tier.
    tokio::time::advance(Duration::from_secs(300 + 120)).await;
    let served = cache.get(&store, "k").await.unwrap();
    assert_eq!(served.as_bytes(), key.as_bytes());
    assert_eq!(probe.get_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn offline_tier_expires_too() {
    let probe = Arc::new(ProbeStore::new());
    seed(&probe, "k").await;
    let store: Arc<dyn KeyStore> = probe.clone();
    let cache = KeyCache::new(expiry(300, 600, 600));

    cache.get(&store, "k").await.unwrap();
    probe.set_reachable(false);

    tokio::time::advance(Duration::from_secs(300 + 601)).await;
    assert!(matches!(
        cache.get(&store, "k").await,
        Err(StoreError::Unreachable(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn stale_entry_refetches_while_backend_up() {
    let probe = Arc::new(ProbeStore::new());
    seed(&probe, "k").await;
    let store: Arc<dyn KeyStore> = probe.clone();
    let cache = KeyCache::new(expiry(300, 600, 600));

    cache.get(&store, "k").await.unwrap();
    tokio::time::advance(Duration::from_secs(301)).await;
    cache.get(&store, "k").await.unwrap();
    assert_eq!(probe.get_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn disabled_offline_tier_never_serves_stale() {
    let probe = Arc::new(ProbeStore::new());
    seed(&probe, "k").await;
    let store: Arc<dyn KeyStore> = probe.clone();
    let cache = KeyCache::new(expiry(300, 600, 0));

    cache.get(&store, "k").await.unwrap();
    probe.set_reachable(false);
    tokio::time::advance(Duration::from_secs(301)).await;
    assert!(cache.get(&store, "k").await.is_err());
}

#[tokio::test]
async fn evict_is_immediate() {
    let probe = Arc::new(ProbeStore::new());
    seed(&probe, "k").await;
    let store: Arc<dyn KeyStore> = probe.clone();
    let cache = KeyCache::new(CacheExpiry::default());

    cache.get(&store, "k").await.unwrap();
    assert_eq!(cache.len(), 1);
    cache.evict("k");
    assert!(cache.is_empty());

    // Next lookup goes back to the backend.
    cache.get(&store, "k").await.unwrap();
    assert_eq!(probe.get_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn sweeper_removes_idle_entries() {
    let probe = Arc::new(ProbeStore::new());
    seed(&probe, "k").await;
    let store: Arc<dyn KeyStore> = probe.clone();
    let cache = KeyCache::new(expiry(300, 30, 0));

    cache.get(&store, "k").await.unwrap();
    tokio::time::advance(Duration::from_secs(31)).await;
    cache.sweep(&store).await;
    assert!(cache.is_empty());
}

#[tokio::test(start_paused = true)]
async fn sweeper_keeps_offline_entries_while_down() {
    let probe = Arc::new(ProbeStore::new());
    seed(&probe, "k").await;
    let store: Arc<dyn KeyStore> = probe.clone();
    let cache = KeyCache::new(expiry(300, 600, 600));

    cache.get(&store, "k").await.unwrap();
    probe.set_reachable(false);
    tokio::time::advance(Duration::from_secs(350)).await;
    cache.sweep(&store).await;
    assert_eq!(cache.len(), 1);

    // Backend healthy again: the stale entry goes.
    probe.set_reachable(true);
    cache.sweep(&store).await;
    assert!(cache.is_empty());
}
