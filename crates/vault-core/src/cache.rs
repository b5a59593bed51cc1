//! Result cache for expensive read paths
//!
//! Entries are keyed by [`CacheKey`], which can only be built from a
//! [`SessionInfo`], so the principal component always belongs to the session
//! asking. Eviction combines TTL (checked when an entry is read or when room is
//! needed) and LRU (when an insert finds the cache full).
//!
//! Fills race with invalidations: a reader computes a value from storage while
//! a writer commits and invalidates. To keep such a value out of the cache the
//! reader takes a [`FillTicket`] before going to storage, and `insert` refuses
//! the value if the principal was invalidated since.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::principal::PrincipalId;
use crate::secret::fold_case;
use crate::session::SessionInfo;

/// Cached read operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheOperation {
    ListSecrets,
    SearchSecrets,
}

/// One canonicalized operation parameter
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheParam {
    Text(String),
}

/// Structured cache key: principal, operation, parameters
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    principal_id: PrincipalId,
    operation: CacheOperation,
    params: Vec<CacheParam>,
}

impl CacheKey {
    pub fn new(session: &SessionInfo, operation: CacheOperation, params: Vec<CacheParam>) -> Self {
        Self {
            principal_id: session.principal_id(),
            operation,
            params,
        }
    }

    pub fn list(session: &SessionInfo) -> Self {
        Self::new(session, CacheOperation::ListSecrets, Vec::new())
    }

    /// Search key with the query trimmed and case-folded the way search
    /// matches. A blank query is the same listing as [`CacheKey::list`].
    pub fn search(session: &SessionInfo, query: &str) -> Self {
        let query = fold_case(query.trim());
        if query.is_empty() {
            return Self::list(session);
        }
        Self::new(
            session,
            CacheOperation::SearchSecrets,
            vec![CacheParam::Text(query)],
        )
    }

    pub fn principal_id(&self) -> PrincipalId {
        self.principal_id
    }

    pub fn operation(&self) -> CacheOperation {
        self.operation
    }

    pub fn params(&self) -> &[CacheParam] {
        &self.params
    }
}

/// Cache sizing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    /// Maximum number of entries; 0 disables caching
    pub capacity: usize,
    /// Maximum age of an entry
    #[serde(rename = "ttlSecs", with = "duration_secs")]
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            ttl: Duration::from_secs(300),
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Proof of the cache state a fill was computed against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillTicket {
    principal_id: PrincipalId,
    epoch: u64,
    generation: u64,
}

/// Counter snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Entries removed to make room
    pub evictions: u64,
    /// Entries removed because their TTL passed
    pub expirations: u64,
    /// Entries removed by invalidation
    pub invalidations: u64,
    /// Fills refused because of an invalidation after the ticket was taken
    pub rejected_fills: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    invalidations: AtomicU64,
    rejected_fills: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }
}

struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    /// Logical clock tick of the last read or write
    last_used: AtomicU64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.inserted_at) >= ttl
    }
}

struct CacheState<V> {
    entries: HashMap<CacheKey, CacheEntry<V>>,
    generations: HashMap<PrincipalId, u64>,
    /// Bumped by `clear`, which invalidates every principal at once
    epoch: u64,
}

impl<V> Default for CacheState<V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            generations: HashMap::new(),
            epoch: 0,
        }
    }
}

impl<V> CacheState<V> {
    fn generation(&self, principal_id: PrincipalId) -> u64 {
        self.generations.get(&principal_id).copied().unwrap_or(0)
    }
}

/// TTL + LRU cache scoped per principal
pub struct ResultCache<V> {
    config: CacheConfig,
    state: RwLock<CacheState<V>>,
    clock: AtomicU64,
    counters: Counters,
}

impl<V: Clone + Send + Sync> ResultCache<V> {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            state: RwLock::new(CacheState::default()),
            clock: AtomicU64::new(0),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> CacheConfig {
        self.config
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Look up a key. Readers share the lock; only an expired hit upgrades to
    /// the write lock to remove the entry.
    pub async fn get(&self, key: &CacheKey) -> Option<V> {
        let now = Instant::now();
        {
            let state = self.state.read().await;
            match state.entries.get(key) {
                None => {
                    Counters::bump(&self.counters.misses, 1);
                    return None;
                }
                Some(entry) if !entry.is_expired(now, self.config.ttl) => {
                    entry.last_used.store(self.tick(), Ordering::Relaxed);
                    Counters::bump(&self.counters.hits, 1);
                    return Some(entry.value.clone());
                }
                Some(_) => {}
            }
        }

        let mut state = self.state.write().await;
        let still_expired = state
            .entries
            .get(key)
            .is_some_and(|entry| entry.is_expired(now, self.config.ttl));
        if still_expired {
            state.entries.remove(key);
            Counters::bump(&self.counters.expirations, 1);
            trace!("Expired cache entry for principal {}", key.principal_id);
        }
        Counters::bump(&self.counters.misses, 1);
        None
    }

    /// Take a ticket before computing a value for `key` from storage
    pub async fn ticket(&self, key: &CacheKey) -> FillTicket {
        let state = self.state.read().await;
        FillTicket {
            principal_id: key.principal_id,
            epoch: state.epoch,
            generation: state.generation(key.principal_id),
        }
    }

    /// Store a value computed under `ticket`. Returns false when the value was
    /// not stored: caching disabled, or the principal was invalidated after
    /// the ticket was taken.
    pub async fn insert(&self, ticket: FillTicket, key: CacheKey, value: V) -> bool {
        if self.config.capacity == 0 {
            return false;
        }

        let mut state = self.state.write().await;
        if ticket.principal_id != key.principal_id
            || ticket.epoch != state.epoch
            || ticket.generation != state.generation(key.principal_id)
        {
            Counters::bump(&self.counters.rejected_fills, 1);
            debug!(
                "Refused stale cache fill for principal {}",
                key.principal_id
            );
            return false;
        }

        if !state.entries.contains_key(&key) && state.entries.len() >= self.config.capacity {
            self.make_room(&mut state);
        }

        let entry = CacheEntry {
            value,
            inserted_at: Instant::now(),
            last_used: AtomicU64::new(self.tick()),
        };
        state.entries.insert(key, entry);
        true
    }

    /// Drop expired entries, then the least recently used one if still full
    fn make_room(&self, state: &mut CacheState<V>) {
        let now = Instant::now();
        let ttl = self.config.ttl;
        let before = state.entries.len();
        state.entries.retain(|_, entry| !entry.is_expired(now, ttl));
        let expired = (before - state.entries.len()) as u64;
        Counters::bump(&self.counters.expirations, expired);

        if state.entries.len() < self.config.capacity {
            return;
        }

        let victim = state
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_used.load(Ordering::Relaxed))
            .map(|(key, _)| key.clone());

        if let Some(key) = victim {
            state.entries.remove(&key);
            Counters::bump(&self.counters.evictions, 1);
            trace!("Evicted LRU cache entry for principal {}", key.principal_id);
        }
    }

    /// Remove every entry of a principal and refuse fills ticketed before now
    pub async fn invalidate_principal(&self, principal_id: PrincipalId) -> usize {
        let mut state = self.state.write().await;
        *state.generations.entry(principal_id).or_insert(0) += 1;

        let before = state.entries.len();
        state.entries.retain(|key, _| key.principal_id != principal_id);
        let removed = before - state.entries.len();

        Counters::bump(&self.counters.invalidations, removed as u64);
        debug!(
            "Invalidated {} cache entries for principal {}",
            removed, principal_id
        );
        removed
    }

    /// Remove everything
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        state.epoch += 1;
        let removed = state.entries.len() as u64;
        state.entries.clear();
        Counters::bump(&self.counters.invalidations, removed);
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn stats(&self) -> CacheStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        CacheStats {
            hits: load(&self.counters.hits),
            misses: load(&self.counters.misses),
            evictions: load(&self.counters.evictions),
            expirations: load(&self.counters.expirations),
            invalidations: load(&self.counters.invalidations),
            rejected_fills: load(&self.counters.rejected_fills),
        }
    }
}
