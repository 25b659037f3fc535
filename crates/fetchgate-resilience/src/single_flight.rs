//! In-flight request deduplication.
//!
//! The first caller for a key becomes the leader: its fetch future is spawned
//! on the runtime and published as a [`Shared`] handle. Later callers for the
//! same key join that handle instead of starting their own fetch. Every caller
//! awaits independently, so a caller that gives up (timeout, drop) never
//! cancels the fetch the others are waiting on.
//!
//! The in-flight record is removed by the fetch task itself when it finishes,
//! whether it succeeded, failed or panicked.

use fetchgate_core::GatewayError;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt as _;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

type SharedFetch<V> = Shared<BoxFuture<'static, Result<V, GatewayError>>>;

/// How a caller took part in a flight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlightRole {
    /// Started the fetch
    Leader,
    /// Joined a fetch that was already running
    Joiner,
}

impl FlightRole {
    /// Label used in logs and metrics
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Leader => "leader",
            Self::Joiner => "joiner",
        }
    }
}

struct InFlight<V> {
    shared: SharedFetch<V>,
    waiters: Arc<AtomicUsize>,
    generation: u64,
}

struct FlightTable<K, V> {
    flights: HashMap<K, InFlight<V>>,
    next_generation: u64,
}

/// Removes the in-flight record when the fetch task ends, including by panic
struct FlightCleanup<K: Eq + Hash, V> {
    table: Arc<Mutex<FlightTable<K, V>>>,
    key: K,
    generation: u64,
}

impl<K: Eq + Hash, V> Drop for FlightCleanup<K, V> {
    fn drop(&mut self) {
        let mut table = self.table.lock();
        if table
            .flights
            .get(&self.key)
            .is_some_and(|flight| flight.generation == self.generation)
        {
            table.flights.remove(&self.key);
        }
    }
}

/// A caller's handle on a flight.
///
/// Counts as a waiter until it is awaited to completion or dropped.
#[must_use = "a flight handle does nothing unless awaited"]
pub struct FlightHandle<V: Clone> {
    shared: SharedFetch<V>,
    waiters: Arc<AtomicUsize>,
    role: FlightRole,
}

impl<V: Clone> FlightHandle<V> {
    fn new(shared: SharedFetch<V>, waiters: Arc<AtomicUsize>, role: FlightRole) -> Self {
        waiters.fetch_add(1, Ordering::SeqCst);
        Self { shared, waiters, role }
    }

    /// Role of the caller holding this handle
    #[must_use]
    pub fn role(&self) -> FlightRole {
        self.role
    }

    /// Wait for the flight's outcome
    ///
    /// # Errors
    /// Returns the fetch's error, shared by every waiter, or
    /// `GatewayError::InternalInvariant` if the fetch task panicked
    pub async fn wait(self) -> Result<V, GatewayError> {
        self.shared.clone().await
    }
}

impl<V: Clone> Drop for FlightHandle<V> {
    fn drop(&mut self) {
        self.waiters.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Single-flight coordinator keyed by `K`
pub struct SingleFlight<K: Eq + Hash, V> {
    table: Arc<Mutex<FlightTable<K, V>>>,
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            table: Arc::new(Mutex::new(FlightTable {
                flights: HashMap::new(),
                next_generation: 0,
            })),
        }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Display + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create an empty coordinator
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the flight for `key`, or start one with `fetch` if none is running.
    ///
    /// `fetch` is only invoked when the caller becomes the leader. The fetch
    /// runs on a spawned task, so this must be called within a tokio runtime.
    pub fn join_or_lead<F, Fut>(&self, key: K, fetch: F) -> FlightHandle<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, GatewayError>> + Send + 'static,
    {
        let mut table = self.table.lock();

        if let Some(flight) = table.flights.get(&key) {
            debug!(key = %key, "Joining in-flight fetch");
            return FlightHandle::new(
                flight.shared.clone(),
                Arc::clone(&flight.waiters),
                FlightRole::Joiner,
            );
        }

        let generation = table.next_generation;
        table.next_generation += 1;

        let cleanup = FlightCleanup {
            table: Arc::clone(&self.table),
            key: key.clone(),
            generation,
        };
        let future = fetch();
        let task = tokio::spawn(async move {
            let _cleanup = cleanup;
            future.await
        });

        let task_key = key.to_string();
        let shared = async move {
            match task.await {
                Ok(result) => result,
                Err(join_error) => {
                    error!(key = %task_key, error = %join_error, "Single-flight fetch task failed");
                    Err(GatewayError::internal_invariant(format!(
                        "fetch task for {task_key} did not complete: {join_error}"
                    )))
                }
            }
        }
        .boxed()
        .shared();

        let waiters = Arc::new(AtomicUsize::new(0));
        table.flights.insert(
            key.clone(),
            InFlight {
                shared: shared.clone(),
                waiters: Arc::clone(&waiters),
                generation,
            },
        );
        debug!(key = %key, "Leading new fetch");

        FlightHandle::new(shared, waiters, FlightRole::Leader)
    }

    /// Join or lead the flight for `key` and wait for its outcome
    ///
    /// # Errors
    /// Returns the shared fetch error
    pub async fn fetch_or_join<F, Fut>(&self, key: K, fetch: F) -> (Result<V, GatewayError>, FlightRole)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, GatewayError>> + Send + 'static,
    {
        let handle = self.join_or_lead(key, fetch);
        let role = handle.role();
        (handle.wait().await, role)
    }

    /// Callers currently waiting on the flight for `key`
    #[must_use]
    pub fn waiters(&self, key: &K) -> usize {
        self.table
            .lock()
            .flights
            .get(key)
            .map_or(0, |flight| flight.waiters.load(Ordering::SeqCst))
    }

    /// Whether a fetch for `key` is outstanding
    #[must_use]
    pub fn is_in_flight(&self, key: &K) -> bool {
        self.table.lock().flights.contains_key(key)
    }

    /// Number of outstanding fetches
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.table.lock().flights.len()
    }
}
