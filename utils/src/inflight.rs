//! Join concurrent identical operations onto one execution.
//!
//! Starting an analyzer or a project daemon is expensive and must happen at
//! most once per key. Callers that arrive while an operation is running
//! await the same outcome instead of starting a second one.
//!
//! The work runs on its own task, so a caller that gives up (times out, is
//! dropped) does not cancel it for the others. The entry is removed when the
//! work finishes, whatever its outcome, so the next call starts fresh.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};

/// The shared task panicked or its runtime shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aborted;

impl fmt::Display for Aborted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("in-flight operation aborted")
    }
}

impl std::error::Error for Aborted {}

type SharedOutcome<V> = Shared<BoxFuture<'static, Result<V, Aborted>>>;

struct Entry<V> {
    id: u64,
    future: SharedOutcome<V>,
}

struct State<K, V> {
    next_id: u64,
    entries: HashMap<K, Entry<V>>,
}

pub struct InFlight<K, V> {
    state: Arc<Mutex<State<K, V>>>,
}

impl<K, V> Default for InFlight<K, V> {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                next_id: 0,
                entries: HashMap::new(),
            })),
        }
    }
}

impl<K, V> Clone for InFlight<K, V> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

fn lock<K, V>(state: &Mutex<State<K, V>>) -> MutexGuard<'_, State<K, V>> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<K, V> InFlight<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Await the running operation for `key`, or start one with `make`.
    ///
    /// `make` is only called when no operation for `key` is in flight.
    pub async fn run<F, Fut>(&self, key: K, make: F) -> Result<V, Aborted>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let future = {
            let mut state = lock(&self.state);
            if let Some(entry) = state.entries.get(&key) {
                entry.future.clone()
            } else {
                state.next_id += 1;
                let id = state.next_id;
                let work = make();
                let registry = Arc::clone(&self.state);
                let task_key = key.clone();
                let handle = tokio::spawn(async move {
                    let value = work.await;
                    let mut state = lock(&registry);
                    if state.entries.get(&task_key).is_some_and(|e| e.id == id) {
                        state.entries.remove(&task_key);
                    }
                    value
                });
                let future = handle.map(|joined| joined.map_err(|_| Aborted)).boxed().shared();
                state.entries.insert(
                    key,
                    Entry {
                        id,
                        future: future.clone(),
                    },
                );
                future
            }
        };
        future.await
    }

    #[must_use]
    pub fn is_running(&self, key: &K) -> bool {
        lock(&self.state).entries.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.state).entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
