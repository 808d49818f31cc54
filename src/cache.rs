//! Single-flight memoizing cache over asynchronous lookups
//!
//! Settled values live in a bounded `moka` cache with least-recently-used
//! eviction and per-entry lifetimes. Populations in progress live in a separate
//! table of shared futures, so at most one population runs per key and it is
//! never evicted.
use futures::future::{BoxFuture, FutureExt, Shared};
use log::{debug, warn};
use moka::notification::RemovalCause;
use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use moka::Expiry;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::CacheConfig;
use crate::error::StoreError;

/// Error produced by a populate step
pub trait PopulateError: Clone + Send + Sync + 'static {
    /// Transient faults get one transparent retry inside the same population
    fn is_transient(&self) -> bool;

    /// Error handed to waiters when the population task itself died
    fn interrupted(reason: String) -> Self;
}

impl PopulateError for StoreError {
    fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }

    fn interrupted(reason: String) -> Self {
        StoreError::Backend(reason)
    }
}

/// How a lookup was answered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Served from a fresh entry
    Hit,
    /// This caller started the population
    Miss,
    /// This caller joined a population already in flight
    Coalesced,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::Coalesced => "COALESCED",
        }
    }

    /// True when no populate call was issued on behalf of this caller
    pub fn is_cached(&self) -> bool {
        !matches!(self, CacheStatus::Miss)
    }
}

/// Result of [`LookupCache::get`]; `value` is `None` when the record does not exist
#[derive(Debug, Clone)]
pub struct Lookup<V> {
    pub value: Option<V>,
    pub status: CacheStatus,
}

/// Lifetimes and capacity of one cache
#[derive(Debug, Clone)]
pub struct CachePolicy {
    /// Lifetime of a found value
    pub ttl: Duration,
    /// Lifetime of a "does not exist" answer
    pub negative_ttl: Duration,
    /// Maximum number of settled entries
    pub max_entries: usize,
}

impl CachePolicy {
    pub fn from_config(config: &CacheConfig, ttl: Duration) -> Self {
        Self {
            ttl,
            negative_ttl: config.negative_ttl,
            max_entries: config.max_entries,
        }
    }

    fn lifetime<V>(&self, value: &Option<V>) -> Duration {
        if value.is_some() {
            self.ttl
        } else {
            self.negative_ttl
        }
    }
}

/// Cache statistics (for monitoring)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub coalesced: u64,
    pub loads: u64,
    pub errors: u64,
    pub evictions: u64,
    pub entries: u64,
    pub in_flight: usize,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    loads: AtomicU64,
    errors: AtomicU64,
    evictions: AtomicU64,
}

type Outcome<V, E> = Result<Option<V>, E>;
type Flight<V, E> = Shared<BoxFuture<'static, Outcome<V, E>>>;

/// Settled lookup; `expires_at` is checked on read against the runtime clock
#[derive(Clone)]
struct Entry<V> {
    value: Option<V>,
    expires_at: Instant,
}

impl<V> Entry<V> {
    fn is_fresh(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Lets moka reclaim found and absent entries after their own lifetimes
struct EntryExpiry(CachePolicy);

impl<V> Expiry<String, Entry<V>> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        entry: &Entry<V>,
        _created_at: std::time::Instant,
    ) -> Option<Duration> {
        Some(self.0.lifetime(&entry.value))
    }

    fn expire_after_update(
        &self,
        _key: &String,
        entry: &Entry<V>,
        _updated_at: std::time::Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(self.0.lifetime(&entry.value))
    }
}

struct InFlight<V, E> {
    id: u64,
    flight: Flight<V, E>,
}

struct Flights<V, E> {
    table: HashMap<String, InFlight<V, E>>,
    next_id: u64,
}

/// Store the outcome of flight `id` unless it was invalidated meanwhile.
///
/// Runs under the flight lock so `invalidate` and the re-check in `get`
/// observe the flight and its entry atomically.
fn settle<V, E>(
    flights: &Mutex<Flights<V, E>>,
    entries: &Cache<String, Entry<V>>,
    key: &str,
    id: u64,
    outcome: &Outcome<V, E>,
    policy: &CachePolicy,
) where
    V: Clone + Send + Sync + 'static,
{
    let mut flights = flights.lock();
    match flights.table.get(key) {
        Some(in_flight) if in_flight.id == id => {
            flights.table.remove(key);
        }
        _ => return,
    }

    let Ok(value) = outcome else {
        return;
    };
    let ttl = policy.lifetime(value);
    if ttl.is_zero() || policy.max_entries == 0 {
        return;
    }
    entries.insert(
        key.to_string(),
        Entry {
            value: value.clone(),
            expires_at: Instant::now() + ttl,
        },
    );
}

/// Memoizing cache keyed by string with single-flight population
pub struct LookupCache<V, E = StoreError> {
    name: &'static str,
    policy: CachePolicy,
    entries: Cache<String, Entry<V>>,
    flights: Arc<Mutex<Flights<V, E>>>,
    counters: Arc<Counters>,
}

impl<V, E> LookupCache<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: PopulateError,
{
    pub fn new(name: &'static str, policy: CachePolicy) -> Self {
        let counters = Arc::new(Counters::default());
        let evicted = Arc::clone(&counters);
        let entries = Cache::builder()
            .max_capacity(policy.max_entries as u64)
            .eviction_policy(EvictionPolicy::lru())
            .expire_after(EntryExpiry(policy.clone()))
            .eviction_listener(move |_key, _entry, cause| {
                if matches!(cause, RemovalCause::Size) {
                    evicted.evictions.fetch_add(1, Ordering::Relaxed);
                }
            })
            .build();

        Self {
            name,
            policy,
            entries,
            flights: Arc::new(Mutex::new(Flights {
                table: HashMap::new(),
                next_id: 0,
            })),
            counters,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Return the cached value for `key`, populating it at most once.
    ///
    /// Concurrent callers for a missing key share one `populate` invocation and
    /// its outcome. Errors reach every waiter and are never stored. The
    /// population runs on its own task and is cached even if every caller
    /// stops waiting.
    pub async fn get<F, Fut>(&self, key: &str, populate: F) -> Result<Lookup<V>, E>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome<V, E>> + Send + 'static,
    {
        let now = Instant::now();
        if let Some(value) = self.fresh(key, now) {
            return Ok(value);
        }

        let (flight, status) = {
            let mut flights = self.flights.lock();
            // A population may have settled since the unlocked read
            if let Some(value) = self.fresh(key, now) {
                return Ok(value);
            }
            match flights.table.get(key) {
                Some(in_flight) => {
                    self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                    (in_flight.flight.clone(), CacheStatus::Coalesced)
                }
                None => {
                    self.counters.misses.fetch_add(1, Ordering::Relaxed);
                    (self.start_flight(&mut flights, key, populate), CacheStatus::Miss)
                }
            }
        };

        let value = flight.await?;
        Ok(Lookup { value, status })
    }

    /// A fresh settled entry, counted as a hit
    fn fresh(&self, key: &str, now: Instant) -> Option<Lookup<V>> {
        let entry = self.entries.get(key).filter(|entry| entry.is_fresh(now))?;
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        Some(Lookup {
            value: entry.value,
            status: CacheStatus::Hit,
        })
    }

    fn start_flight<F, Fut>(
        &self,
        flights: &mut Flights<V, E>,
        key: &str,
        populate: F,
    ) -> Flight<V, E>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome<V, E>> + Send + 'static,
    {
        flights.next_id += 1;
        let id = flights.next_id;
        let name = self.name;
        let owned_key = key.to_string();

        let task = {
            let shared = Arc::clone(&self.flights);
            let entries = self.entries.clone();
            let counters = Arc::clone(&self.counters);
            let policy = self.policy.clone();
            let key = owned_key.clone();
            tokio::spawn(async move {
                counters.loads.fetch_add(1, Ordering::Relaxed);
                let mut outcome = populate().await;
                if matches!(&outcome, Err(err) if err.is_transient()) {
                    debug!("[{}] transient fault populating '{}', retrying once", name, key);
                    counters.loads.fetch_add(1, Ordering::Relaxed);
                    outcome = populate().await;
                }
                if outcome.is_err() {
                    counters.errors.fetch_add(1, Ordering::Relaxed);
                }
                settle(&shared, &entries, &key, id, &outcome, &policy);
                outcome
            })
        };

        let shared = Arc::clone(&self.flights);
        let flight = async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(join_error) => {
                    warn!("[{}] population of '{}' died: {}", name, owned_key, join_error);
                    let mut flights = shared.lock();
                    if flights.table.get(&owned_key).is_some_and(|f| f.id == id) {
                        flights.table.remove(&owned_key);
                    }
                    Err(E::interrupted(format!("population task failed: {}", join_error)))
                }
            }
        }
        .boxed()
        .shared();

        flights.table.insert(
            key.to_string(),
            InFlight {
                id,
                flight: flight.clone(),
            },
        );
        flight
    }

    /// Drop the entry for `key` now; a population in flight is not stored
    pub fn invalidate(&self, key: &str) {
        let mut flights = self.flights.lock();
        self.entries.invalidate(key);
        flights.table.remove(key);
    }

    /// Number of settled entries, after pending evictions are applied
    pub fn len(&self) -> u64 {
        self.entries.run_pending_tasks();
        self.entries.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.len();
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            coalesced: self.counters.coalesced.load(Ordering::Relaxed),
            loads: self.counters.loads.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            entries,
            in_flight: self.flights.lock().table.len(),
        }
    }
}
