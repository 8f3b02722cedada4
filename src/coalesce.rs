//! Single-flight request coalescing.
//!
//! [`Coalescer::run`] guarantees that for any key at most one piece of work
//! is in flight inside this process.  Callers that arrive while it runs
//! attach to the same shared future and receive a clone of its outcome.
//!
//! The work is spawned onto the runtime rather than polled by the first
//! caller, so dropping a caller never cancels a fetch that other callers (or
//! the cache) are waiting on.  The spawned task removes its own map entry
//! before publishing the outcome, so no entry outlives its settlement and the
//! next call after completion always starts fresh.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, error};

use crate::error::{Error, Result};

type Pending<T> = Shared<BoxFuture<'static, Result<T>>>;

pub struct Coalescer<T: Clone + Send + Sync + 'static> {
    pending: Arc<Mutex<HashMap<String, Pending<T>>>>,
}

impl<T: Clone + Send + Sync + 'static> Default for Coalescer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> Coalescer<T> {
    pub fn new() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run `work` for `key`, or join the run already in flight for it.
    ///
    /// `work` is only constructed into a task when this caller is the first
    /// for the key; otherwise it is dropped unpolled.
    pub async fn run<F, Fut>(&self, key: &str, work: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let shared = {
            let mut pending = lock(&self.pending);
            match pending.get(key) {
                Some(existing) => {
                    debug!(key, "joining in-flight fetch");
                    existing.clone()
                }
                None => {
                    let shared = self.spawn(key.to_string(), work());
                    pending.insert(key.to_string(), shared.clone());
                    shared
                }
            }
        };
        shared.await
    }

    /// Number of keys with a fetch in flight.
    #[cfg(test)]
    pub fn in_flight(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Whether `key` currently has a fetch in flight.
    pub fn is_pending(&self, key: &str) -> bool {
        lock(&self.pending).contains_key(key)
    }

    // Called with the map lock held.  The spawned task needs the same lock to
    // deregister, so it cannot remove the entry before it has been inserted.
    fn spawn<Fut>(&self, key: String, work: Fut) -> Pending<T>
    where
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let deregister = Deregister {
            pending: Arc::clone(&self.pending),
            key: key.clone(),
        };
        let handle = tokio::spawn(async move {
            let outcome = work.await;
            drop(deregister);
            outcome
        });

        async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(join_err) => {
                    error!(%key, error = %join_err, "coalesced fetch task failed");
                    Err(Error::remote(
                        &key,
                        None,
                        format!("fetch task aborted: {join_err}"),
                    ))
                }
            }
        }
        .boxed()
        .shared()
    }
}

/// Removes a key from the pending map when dropped, including when the work
/// panics and the task unwinds.
struct Deregister<T: Clone + Send + Sync + 'static> {
    pending: Arc<Mutex<HashMap<String, Pending<T>>>>,
    key: String,
}

impl<T: Clone + Send + Sync + 'static> Drop for Deregister<T> {
    fn drop(&mut self) {
        lock(&self.pending).remove(&self.key);
    }
}

/// Lock the pending map, recovering from poisoning.  The map is only ever
/// mutated by single `insert`/`remove` calls, so a poisoned guard still
/// holds a consistent map.
fn lock<T>(map: &Mutex<T>) -> MutexGuard<'_, T> {
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
