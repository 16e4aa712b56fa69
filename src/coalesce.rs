//! Single-flight gate over cache fills.
//!
//! Concurrent loads of the same key share one execution and its outcome. The load runs on its own task, so a caller
//! which stops waiting doesn't abort it. Once finished, a successful outcome stays in the gate for the grace window and
//! keeps answering late callers; then the key is forgotten. A failure is forgotten right away, and so is any key whose
//! cached value gets invalidated, see [`Coalescer::forget`].

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::future::Shared;
use futures::FutureExt;
use parking_lot::Mutex;
use tracing::trace;

use crate::error::Error;
use crate::error::Result;

type SharedLoad<V> = Shared<BoxFuture<'static, Result<V, Arc<Error>>>>;

// Every load gets its own generation so that the cleanup of a forgotten load never removes its successor.
struct Flight<V> {
    generation: u64,
    load:       SharedLoad<V>,
}

type Flights<K, V> = Arc<Mutex<HashMap<K, Flight<V>>>>;

fn land<K: Hash + Eq, V>(inflight: &Flights<K, V>, key: &K, generation: u64) {
    let mut inflight = inflight.lock();
    if inflight.get(key).is_some_and(|flight| flight.generation == generation) {
        inflight.remove(key);
    }
}

pub struct Coalescer<K, V> {
    inflight:    Flights<K, V>,
    generations: AtomicU64,
    grace:       Duration,
}

impl<K, V> Coalescer<K, V>
where
    K: Hash + Eq + Clone + std::fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(grace: Duration) -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
            generations: AtomicU64::new(0),
            grace,
        }
    }

    /// Run `loader` for `key` unless a load of the same key is in flight or within its grace window, in which case its
    /// outcome is returned instead. `loader` is only invoked by the caller that starts a new load.
    pub async fn load<F, Fut>(&self, key: K, loader: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let shared = {
            let mut inflight = self.inflight.lock();
            match inflight.get(&key) {
                Some(flight) => {
                    trace!("joining in-flight load of {key:?}");
                    flight.load.clone()
                }
                None => {
                    let generation = self.generations.fetch_add(1, Ordering::Relaxed);
                    let load = self.start(key.clone(), generation, loader());
                    inflight.insert(
                        key,
                        Flight {
                            generation,
                            load: load.clone(),
                        },
                    );
                    load
                }
            }
        };

        shared.await.map_err(Error::Coalesced)
    }

    fn start<Fut>(&self, key: K, generation: u64, load: Fut) -> SharedLoad<V>
    where
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let inflight = Arc::clone(&self.inflight);
        let grace = self.grace;
        let forget_key = key.clone();

        let handle = tokio::spawn(async move {
            let outcome = load.await.map_err(Arc::new);
            if outcome.is_err() {
                // Waiters already joined share the failure; the next caller tries again.
                land(&inflight, &forget_key, generation);
            }
            else {
                tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    land(&inflight, &forget_key, generation);
                });
            }
            outcome
        });

        let inflight = Arc::clone(&self.inflight);
        async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(err) => {
                    // The load task died before scheduling its own cleanup.
                    land(&inflight, &key, generation);
                    Err(Arc::new(Error::Task(err)))
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Drop whatever is kept for `key`, so the next caller starts a fresh load. Callers already waiting on a load in
    /// flight still get its outcome.
    pub fn forget(&self, key: &K) {
        if self.inflight.lock().remove(key).is_some() {
            trace!("forgot load of {key:?}");
        }
    }

    /// Number of keys currently in flight or within their grace window.
    pub fn pending(&self) -> usize {
        self.inflight.lock().len()
    }
}

impl<K, V> std::fmt::Debug for Coalescer<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coalescer").field("grace", &self.grace).finish()
    }
}
