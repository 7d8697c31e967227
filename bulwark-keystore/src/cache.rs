//! Dual-expiry plaintext key cache with single-flight misses and an
//! optional offline tier.
//!
//! Entry lifecycle:
//!
//! ```text
//!   [fresh] --any expires--> [stale]
//!   [fresh] --access--> [fresh]            (resets idle clock)
//!   [fresh] --unused expires--> [evicted]
//!   [stale] --offline > 0, backend unreachable--> [offline]
//!   [stale] --otherwise--> [evicted]
//!   [offline] --offline expires or backend healthy--> [evicted]
//! ```

use bulwark_envelope::SecretKey;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::Instant;

use crate::error::StoreError;
use crate::record::KeyRecord;
use crate::store::KeyStore;

// ---------------------------------------------------------------------------
// Expiry configuration
// ---------------------------------------------------------------------------

/// The three cache clocks.
#[derive(Clone, Copy, Debug)]
pub struct CacheExpiry {
    /// Hard TTL: entries are evicted this long after insertion.
    pub any: Duration,
    /// Idle TTL: entries not accessed within this interval are evicted.
    pub unused: Duration,
    /// Offline tier: after the hard TTL, entries stay usable for this long
    /// while the backend is unreachable. Zero disables the tier.
    pub offline: Duration,
}

impl Default for CacheExpiry {
    fn default() -> Self {
        Self {
            any: Duration::from_secs(5 * 60),
            unused: Duration::from_secs(30),
            offline: Duration::ZERO,
        }
    }
}

impl CacheExpiry {
    /// The sweeper period: half the shorter of the two TTLs.
    pub fn sweep_interval(&self) -> Duration {
        (self.any.min(self.unused) / 2).max(Duration::from_secs(1))
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

struct Entry {
    key: SecretKey,
    inserted: Instant,
    last_used: Mutex<Instant>,
}

impl Entry {
    fn new(key: SecretKey) -> Self {
        let now = Instant::now();
        Self {
            key,
            inserted: now,
            last_used: Mutex::new(now),
        }
    }
}

/// A per-name admission token: concurrent misses on the same name share one
/// cell, so the backend sees a single fetch and every waiter receives the
/// same outcome.
type Flight = Arc<OnceCell<Result<SecretKey, StoreError>>>;

/// The plaintext key cache sitting between the enclave and its backend.
pub struct KeyCache {
    expiry: CacheExpiry,
    entries: DashMap<String, Arc<Entry>>,
    flights: Mutex<HashMap<String, Flight>>,
}

impl KeyCache {
    pub fn new(expiry: CacheExpiry) -> Self {
        Self {
            expiry,
            entries: DashMap::new(),
            flights: Mutex::new(HashMap::new()),
        }
    }

    pub fn expiry(&self) -> CacheExpiry {
        self.expiry
    }

    /// Fetch the key named `name`, from cache if possible, otherwise from
    /// `store` with miss coalescing.
    pub async fn get(
        &self,
        store: &Arc<dyn KeyStore>,
        name: &str,
    ) -> Result<SecretKey, StoreError> {
        if let Some(key) = self.lookup(store, name).await {
            return Ok(key);
        }

        let flight = {
            let mut flights = self.flights.lock();
            flights
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let result = flight
            .get_or_init(|| async {
                let blob = store.get(name).await?;
                KeyRecord::from_slice(&blob)?.key()
            })
            .await
            .clone();

        // Whoever returns first retires the flight; a successful fetch
        // becomes a fresh entry unless the name was evicted meanwhile
        // (a concurrent delete must win).
        let mut flights = self.flights.lock();
        if flights.get(name).is_some_and(|f| Arc::ptr_eq(f, &flight)) {
            flights.remove(name);
            if let Ok(ref key) = result {
                self.entries
                    .insert(name.to_string(), Arc::new(Entry::new(key.clone())));
            }
        }
        drop(flights);

        result
    }

    /// Cache-only lookup honoring the entry lifecycle. Touches the idle
    /// clock on a hit.
    async fn lookup(&self, store: &Arc<dyn KeyStore>, name: &str) -> Option<SecretKey> {
        let entry = self.entries.get(name).map(|r| r.value().clone())?;
        let now = Instant::now();
        let age = now.duration_since(entry.inserted);

        if age < self.expiry.any {
            let mut last_used = entry.last_used.lock();
            if now.duration_since(*last_used) >= self.expiry.unused {
                drop(last_used);
                self.remove_exact(name, &entry);
                return None;
            }
            *last_used = now;
            return Some(entry.key.clone());
        }

        // Stale: usable only through the offline tier.
        if !self.expiry.offline.is_zero()
            && age < self.expiry.any + self.expiry.offline
            && !store.status().await.is_reachable()
        {
            *entry.last_used.lock() = now;
            return Some(entry.key.clone());
        }

        self.remove_exact(name, &entry);
        None
    }

    /// Drop the entry and abandon any in-flight fetch for `name`. A fetch
    /// completing afterwards will not re-insert.
    pub fn evict(&self, name: &str) {
        self.entries.remove(name);
        self.flights.lock().remove(name);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// One sweep pass. Probes backend health at most once, before touching
    /// any entry, so no lock is ever held across I/O.
    pub async fn sweep(&self, store: &Arc<dyn KeyStore>) {
        let offline = !self.expiry.offline.is_zero();
        let reachable = if offline {
            store.status().await.is_reachable()
        } else {
            true
        };

        let now = Instant::now();
        self.entries.retain(|_, entry| {
            let age = now.duration_since(entry.inserted);
            if age >= self.expiry.any {
                offline && !reachable && age < self.expiry.any + self.expiry.offline
            } else {
                now.duration_since(*entry.last_used.lock()) < self.expiry.unused
            }
        });
    }

    /// Start the periodic sweeper. The caller owns the handle and aborts it
    /// on shutdown.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        store: Arc<dyn KeyStore>,
    ) -> tokio::task::JoinHandle<()> {
        let cache = self;
        let period = cache.expiry.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                cache.sweep(&store).await;
            }
        })
    }

    /// Remove `name` only if it still holds this exact entry, so a freshly
    /// re-inserted key is never clobbered.
    fn remove_exact(&self, name: &str, entry: &Arc<Entry>) {
        self.entries
            .remove_if(name, |_, current| Arc::ptr_eq(current, entry));
    }
}

impl std::fmt::Debug for KeyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyCache")
            .field("entries", &self.entries.len())
            .field("expiry", &self.expiry)
            .finish()
    }
}
