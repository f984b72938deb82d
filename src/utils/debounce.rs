//! Keyed trailing-edge debouncer for async operations
//!
//! A burst of calls sharing a key collapses into exactly one execution of
//! the most recent call's operation, and every caller in the burst
//! receives that single result.

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

type SharedResult<T> = Result<T, String>;

struct PendingCall<T> {
    /// Operation from the latest call; earlier operations in the burst
    /// are dropped unexecuted.
    op: BoxFuture<'static, anyhow::Result<T>>,
    deadline: Instant,
    waiters: Vec<oneshot::Sender<SharedResult<T>>>,
}

/// Trailing-edge debouncer keyed by string.
///
/// Constructed explicitly and shared via `Arc`; dropping every clone (or
/// calling [`Debouncer::cancel_all`]) deterministically fails pending
/// waiters instead of leaving timers behind.
pub struct Debouncer<T> {
    calls: Arc<Mutex<HashMap<String, PendingCall<T>>>>,
}

impl<T> Clone for Debouncer<T> {
    fn clone(&self) -> Self {
        Self {
            calls: Arc::clone(&self.calls),
        }
    }
}

impl<T> Default for Debouncer<T>
where
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Debouncer<T>
where
    T: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Schedule `op` under `key`, postponing execution until `delay` has
    /// elapsed without another call for the same key. Returns the shared
    /// result of the single trailing execution.
    pub async fn debounce<F, Fut>(&self, key: &str, delay: Duration, op: F) -> anyhow::Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let deadline = Instant::now() + delay;
        let spawn_timer = {
            let mut calls = self.calls.lock().unwrap();
            match calls.get_mut(key) {
                Some(pending) => {
                    // Later call wins: replace the operation, push the
                    // window out, keep every waiter.
                    pending.op = Box::pin(op());
                    pending.deadline = deadline;
                    pending.waiters.push(tx);
                    false
                }
                None => {
                    calls.insert(
                        key.to_string(),
                        PendingCall {
                            op: Box::pin(op()),
                            deadline,
                            waiters: vec![tx],
                        },
                    );
                    true
                }
            }
        };

        if spawn_timer {
            let calls = Arc::clone(&self.calls);
            let key = key.to_string();
            tokio::spawn(async move {
                Self::run_after_quiet_period(calls, key).await;
            });
        }

        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(msg)) => Err(anyhow::anyhow!(msg)),
            Err(_) => Err(anyhow::anyhow!("debounced operation was cancelled")),
        }
    }

    /// Sleep until the key's deadline stops moving, then execute the
    /// latest operation and fan the result out to all waiters.
    async fn run_after_quiet_period(calls: Arc<Mutex<HashMap<String, PendingCall<T>>>>, key: String) {
        let taken = loop {
            let deadline = match calls.lock().unwrap().get(&key) {
                Some(pending) => pending.deadline,
                None => return, // cancelled
            };
            tokio::time::sleep_until(deadline).await;

            let mut guard = calls.lock().unwrap();
            match guard.get(&key) {
                Some(pending) if pending.deadline <= Instant::now() => {
                    break guard.remove(&key);
                }
                Some(_) => continue, // a newer call pushed the deadline out
                None => return,
            }
        };

        let Some(pending) = taken else { return };
        debug!(
            "debounce window for {:?} closed, executing with {} waiter(s)",
            key,
            pending.waiters.len()
        );

        let result: SharedResult<T> = pending.op.await.map_err(|e| format!("{:#}", e));
        for waiter in pending.waiters {
            let _ = waiter.send(result.clone());
        }
    }

    /// Drop every pending call; their waiters resolve with a cancellation
    /// error and no operation runs.
    pub fn cancel_all(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Number of keys with a pending (not yet executed) call.
    pub fn pending_keys(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}
