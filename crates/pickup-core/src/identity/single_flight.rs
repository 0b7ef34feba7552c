//! Single-flight TTL cache for argument-free async lookups.
//!
//! A `SingleFlightCache` serves one value produced by an injected async
//! lookup. Fresh values are returned without suspending; concurrent misses
//! share a single outstanding lookup; failed lookups are cached as a
//! negative sentinel for a shorter TTL and never surface as errors.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::time::Instant;
use tracing::{debug, warn};

/// The wrapped lookup. Called once per flight.
pub type Lookup<V> = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<V>> + Send + Sync>;

type Outcome<V> = Shared<BoxFuture<'static, V>>;

/// How long successful and failed lookups stay fresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlPolicy {
    pub success: Duration,
    pub failure: Duration,
}

impl TtlPolicy {
    pub const fn new(success: Duration, failure: Duration) -> Self {
        Self { success, failure }
    }
}

/// Where a cache currently sits in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// Never fetched, or invalidated.
    Empty,
    /// A lookup is outstanding and nothing fresh is cached.
    Fetching,
    /// Holding a value from a successful lookup.
    Fresh,
    /// Holding the negative sentinel from a failed lookup.
    NegativeFresh,
    /// Holding an expired value.
    Stale,
}

impl fmt::Display for CacheState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CacheState::Empty => "empty",
            CacheState::Fetching => "fetching",
            CacheState::Fresh => "fresh",
            CacheState::NegativeFresh => "negative",
            CacheState::Stale => "stale",
        };
        f.write_str(label)
    }
}

/// Point-in-time view of a cache, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStatus {
    pub name: &'static str,
    pub state: CacheState,
    /// Time left before the cached value goes stale, if one is fresh.
    pub expires_in: Option<Duration>,
    /// Lookups started since the cache was created.
    pub lookups: u64,
}

impl CacheStatus {
    pub fn display(&self) -> String {
        match self.expires_in {
            Some(left) => format!("{} (expires in {}s)", self.state, left.as_secs()),
            None => self.state.to_string(),
        }
    }
}

struct Flight<V> {
    id: u64,
    outcome: Outcome<V>,
}

struct State<V> {
    value: Option<V>,
    expires_at: Instant,
    negative: bool,
    in_flight: Option<Flight<V>>,
    next_flight: u64,
    lookups: u64,
}

impl<V> State<V> {
    fn new() -> Self {
        Self {
            value: None,
            expires_at: Instant::now(),
            negative: false,
            in_flight: None,
            next_flight: 0,
            lookups: 0,
        }
    }

    fn fresh(&self, now: Instant) -> Option<&V> {
        self.value.as_ref().filter(|_| now < self.expires_at)
    }
}

fn lock<V>(state: &Mutex<State<V>>) -> MutexGuard<'_, State<V>> {
    // Never held across an await. Every field is written in one step, so a
    // poisoned guard still holds consistent state.
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Memoizing guard around one async lookup.
pub struct SingleFlightCache<V> {
    name: &'static str,
    ttl: TtlPolicy,
    negative: V,
    lookup: Lookup<V>,
    state: Arc<Mutex<State<V>>>,
}

impl<V> SingleFlightCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create a cache named `name` (used in logs) that returns `negative`
    /// whenever `lookup` fails.
    pub fn new<F, Fut>(name: &'static str, ttl: TtlPolicy, negative: V, lookup: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        Self {
            name,
            ttl,
            negative,
            lookup: Arc::new(move || lookup().boxed()),
            state: Arc::new(Mutex::new(State::new())),
        }
    }

    pub fn ttl(&self) -> TtlPolicy {
        self.ttl
    }

    /// Return the cached value, or resolve it through the lookup.
    ///
    /// A fresh value is returned on the first poll. Otherwise the caller
    /// joins the outstanding lookup, starting one if there is none. Lookup
    /// failures resolve to the negative sentinel.
    pub async fn get_or_fetch(&self) -> V {
        let outcome = {
            let mut state = lock(&self.state);
            if let Some(value) = state.fresh(Instant::now()) {
                return value.clone();
            }
            let joined = state
                .in_flight
                .as_ref()
                .map(|flight| (flight.id, flight.outcome.clone()));
            match joined {
                Some((id, outcome)) => {
                    debug!(cache = self.name, flight = id, "Joining in-flight lookup");
                    outcome
                }
                None => self.start_flight(&mut state),
            }
        };
        outcome.await
    }

    /// Return the cached value if it is fresh. Never starts a lookup.
    pub fn peek(&self) -> Option<V> {
        lock(&self.state).fresh(Instant::now()).cloned()
    }

    /// Drop the cached value so the next `get_or_fetch` starts a new lookup.
    ///
    /// An outstanding lookup is detached, not aborted: it still runs to
    /// completion and writes its result when it settles.
    pub fn invalidate(&self) {
        let mut state = lock(&self.state);
        state.value = None;
        state.negative = false;
        state.expires_at = Instant::now();
        if let Some(flight) = state.in_flight.take() {
            debug!(cache = self.name, flight = flight.id, "Detached in-flight lookup on invalidate");
        }
        debug!(cache = self.name, "Cache invalidated");
    }

    pub fn status(&self) -> CacheStatus {
        let state = lock(&self.state);
        let now = Instant::now();
        let fresh = state.fresh(now).is_some();
        let cache_state = if fresh && state.negative {
            CacheState::NegativeFresh
        } else if fresh {
            CacheState::Fresh
        } else if state.in_flight.is_some() {
            CacheState::Fetching
        } else if state.value.is_some() {
            CacheState::Stale
        } else {
            CacheState::Empty
        };
        CacheStatus {
            name: self.name,
            state: cache_state,
            expires_in: fresh.then(|| state.expires_at.saturating_duration_since(now)),
            lookups: state.lookups,
        }
    }

    /// Spawn the lookup and record it as the in-flight operation.
    ///
    /// The lookup is built and run on its own task so it settles even if
    /// every waiter goes away, and so a panic while building it is caught
    /// like any other. The task writes the cache before the shared outcome
    /// resolves.
    fn start_flight(&self, state: &mut State<V>) -> Outcome<V> {
        let id = state.next_flight;
        state.next_flight += 1;
        state.lookups += 1;
        debug!(cache = self.name, flight = id, "Starting lookup");

        let lookup = Arc::clone(&self.lookup);
        let shared = Arc::clone(&self.state);
        let name = self.name;
        let ttl = self.ttl;
        let negative = self.negative.clone();

        let task = tokio::spawn(async move {
            let run = async move { lookup().await };
            let (value, failed) = match AssertUnwindSafe(run).catch_unwind().await {
                Ok(Ok(value)) => (value, false),
                Ok(Err(e)) => {
                    warn!(cache = name, flight = id, error = %e, "Lookup failed, caching negative result");
                    (negative, true)
                }
                Err(_) => {
                    warn!(cache = name, flight = id, "Lookup panicked, caching negative result");
                    (negative, true)
                }
            };
            settle(&shared, id, value.clone(), failed, &ttl);
            value
        });

        let negative = self.negative.clone();
        let outcome = async move {
            match task.await {
                Ok(value) => value,
                Err(e) => {
                    // Only reachable when the runtime shuts down under us.
                    warn!(cache = name, flight = id, error = %e, "Lookup task did not complete");
                    negative
                }
            }
        }
        .boxed()
        .shared();

        state.in_flight = Some(Flight {
            id,
            outcome: outcome.clone(),
        });
        outcome
    }
}

/// Write a flight's result into the cache and release the in-flight slot
/// if it still belongs to that flight.
fn settle<V>(state: &Mutex<State<V>>, id: u64, value: V, failed: bool, ttl: &TtlPolicy) {
    let mut state = lock(state);
    let ttl = if failed { ttl.failure } else { ttl.success };
    state.value = Some(value);
    state.negative = failed;
    state.expires_at = Instant::now() + ttl;
    if state.in_flight.as_ref().map(|f| f.id) == Some(id) {
        state.in_flight = None;
    }
}

impl<V> fmt::Debug for SingleFlightCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleFlightCache")
            .field("name", &self.name)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::future::join_all;
    use tokio::sync::Notify;
    use tokio::time::{advance, sleep};

    const TTL: TtlPolicy = TtlPolicy::new(Duration::from_secs(30), Duration::from_secs(5));

    /// Cache whose lookup counts calls and returns whatever `respond` yields.
    fn counting_cache<F>(calls: Arc<AtomicUsize>, respond: F) -> SingleFlightCache<Option<String>>
    where
        F: Fn(usize) -> anyhow::Result<Option<String>> + Send + Sync + 'static,
    {
        let respond = Arc::new(respond);
        SingleFlightCache::new("test", TTL, None, move || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            let respond = Arc::clone(&respond);
            async move { respond(n) }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_lookup() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let cache = SingleFlightCache::new("test", TTL, None, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async {
                sleep(Duration::from_millis(100)).await;
                Ok::<_, anyhow::Error>(Some("p1".to_string()))
            }
        });

        let results = join_all((0..16).map(|_| cache.get_or_fetch())).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| r.as_deref() == Some("p1")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let cache = SingleFlightCache::new("test", TTL, false, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async {
                sleep(Duration::from_millis(50)).await;
                Err::<bool, _>(anyhow::anyhow!("connection reset"))
            }
        });

        let results = join_all((0..8).map(|_| cache.get_or_fetch())).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| !*r));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_ttl_freshness() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = counting_cache(Arc::clone(&calls), |n| Ok(Some(format!("p{}", n))));

        assert_eq!(cache.get_or_fetch().await.as_deref(), Some("p1"));

        advance(Duration::from_secs(10)).await;
        assert_eq!(cache.get_or_fetch().await.as_deref(), Some("p1"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        advance(Duration::from_secs(19)).await;
        assert_eq!(cache.get_or_fetch().await.as_deref(), Some("p1"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get_or_fetch().await.as_deref(), Some("p2"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_negative_cached_for_short_ttl() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = counting_cache(Arc::clone(&calls), |_| {
            Err(anyhow::anyhow!("network error"))
        });

        assert_eq!(cache.get_or_fetch().await, None);
        assert_eq!(cache.status().state, CacheState::NegativeFresh);

        advance(Duration::from_secs(3)).await;
        assert_eq!(cache.get_or_fetch().await, None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        advance(Duration::from_secs(3)).await;
        assert_eq!(cache.get_or_fetch().await, None);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_failure_ttl() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = counting_cache(Arc::clone(&calls), |n| {
            if n == 1 {
                Err(anyhow::anyhow!("503 from backend"))
            } else {
                Ok(Some("p1".to_string()))
            }
        });

        assert_eq!(cache.get_or_fetch().await, None);
        advance(Duration::from_secs(6)).await;
        assert_eq!(cache.get_or_fetch().await.as_deref(), Some("p1"));
        assert_eq!(cache.status().state, CacheState::Fresh);

        // Recovered values get the long TTL
        advance(Duration::from_secs(20)).await;
        assert_eq!(cache.get_or_fetch().await.as_deref(), Some("p1"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_forces_new_lookup() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = counting_cache(Arc::clone(&calls), |n| Ok(Some(format!("p{}", n))));

        assert_eq!(cache.get_or_fetch().await.as_deref(), Some("p1"));
        cache.invalidate();
        assert_eq!(cache.status().state, CacheState::Empty);
        assert_eq!(cache.peek(), None);

        assert_eq!(cache.get_or_fetch().await.as_deref(), Some("p2"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_during_flight_starts_new_lookup() {
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());
        let counter = Arc::clone(&calls);
        let first_gate = Arc::clone(&gate);
        let cache = SingleFlightCache::new("test", TTL, None, move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            let gate = Arc::clone(&first_gate);
            async move {
                if n == 1 {
                    gate.notified().await;
                }
                Ok::<_, anyhow::Error>(Some(format!("p{}", n)))
            }
        });

        let mut waiter = Box::pin(cache.get_or_fetch());
        assert!(futures::poll!(&mut waiter).is_pending());
        assert_eq!(cache.status().state, CacheState::Fetching);
        // Let the first lookup start and park on the gate
        tokio::task::yield_now().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        cache.invalidate();
        assert_eq!(cache.get_or_fetch().await.as_deref(), Some("p2"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // The detached flight still completes for its own waiter and writes
        // its result when it lands.
        gate.notify_one();
        assert_eq!(waiter.await.as_deref(), Some("p1"));
        assert_eq!(cache.peek(), Some(Some("p1".to_string())));
        assert_eq!(cache.status().state, CacheState::Fresh);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_lookup_resolves_negative() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let cache = SingleFlightCache::new("test", TTL, false, move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n == 1 {
                    panic!("lookup blew up");
                }
                Ok::<_, anyhow::Error>(true)
            }
        });

        assert!(!cache.get_or_fetch().await);
        assert_eq!(cache.status().state, CacheState::NegativeFresh);

        advance(Duration::from_secs(6)).await;
        assert!(cache.get_or_fetch().await);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_panicking_before_its_future_resolves_negative() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let cache = SingleFlightCache::new("test", TTL, None, move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if n == 1 {
                panic!("could not build request");
            }
            async move { Ok::<_, anyhow::Error>(Some(format!("p{}", n))) }
        });

        assert_eq!(cache.get_or_fetch().await, None);
        let status = cache.status();
        assert_eq!(status.state, CacheState::NegativeFresh);
        assert_eq!(status.lookups, 1);

        advance(Duration::from_secs(6)).await;
        assert_eq!(cache.get_or_fetch().await.as_deref(), Some("p2"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_multi_thread_stampede_shares_one_lookup() {
        for _ in 0..50 {
            let calls = Arc::new(AtomicUsize::new(0));
            let counter = Arc::clone(&calls);
            let cache = Arc::new(SingleFlightCache::new("test", TTL, None, move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async {
                    sleep(Duration::from_millis(5)).await;
                    Ok::<_, anyhow::Error>(Some(7u32))
                }
            }));

            let callers: Vec<_> = (0..64)
                .map(|_| {
                    let cache = Arc::clone(&cache);
                    tokio::spawn(async move { cache.get_or_fetch().await })
                })
                .collect();
            for caller in callers {
                assert_eq!(caller.await.unwrap(), Some(7));
            }

            assert_eq!(calls.load(Ordering::SeqCst), 1);
            assert_eq!(cache.status().state, CacheState::Fresh);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_callers_do_not_cancel_lookup() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let cache = SingleFlightCache::new("test", TTL, None, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async {
                sleep(Duration::from_millis(200)).await;
                Ok::<_, anyhow::Error>(Some("p1".to_string()))
            }
        });

        let abandoned = tokio::time::timeout(Duration::from_millis(10), cache.get_or_fetch()).await;
        assert!(abandoned.is_err());

        sleep(Duration::from_millis(500)).await;
        assert_eq!(cache.peek(), Some(Some("p1".to_string())));
        assert_eq!(cache.get_or_fetch().await.as_deref(), Some("p1"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_walks_state_machine() {
        let cache = counting_cache(Arc::new(AtomicUsize::new(0)), |_| Ok(Some("p1".to_string())));
        assert_eq!(cache.status().state, CacheState::Empty);
        assert_eq!(cache.status().lookups, 0);

        cache.get_or_fetch().await;
        let status = cache.status();
        assert_eq!(status.state, CacheState::Fresh);
        assert_eq!(status.expires_in, Some(Duration::from_secs(30)));
        assert_eq!(status.lookups, 1);
        assert_eq!(status.display(), "fresh (expires in 30s)");

        advance(Duration::from_secs(31)).await;
        let status = cache.status();
        assert_eq!(status.state, CacheState::Stale);
        assert_eq!(status.expires_in, None);
        assert_eq!(cache.peek(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_peek_never_starts_lookup() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = counting_cache(Arc::clone(&calls), |_| Ok(Some("p1".to_string())));

        assert_eq!(cache.peek(), None);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        cache.get_or_fetch().await;
        assert_eq!(cache.peek(), Some(Some("p1".to_string())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cache_state_display() {
        assert_eq!(CacheState::Empty.to_string(), "empty");
        assert_eq!(CacheState::NegativeFresh.to_string(), "negative");
        let status = CacheStatus {
            name: "auth_user",
            state: CacheState::Fetching,
            expires_in: None,
            lookups: 3,
        };
        assert_eq!(status.display(), "fetching");
    }
}
