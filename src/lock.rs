//! Named operation lock serializing structural mutations.
//!
//! Each lock id has at most one holder and a FIFO queue of waiters. Release
//! hands ownership directly to the next waiter that is still listening, so
//! the lock is never observably free while someone is queued. Guards carry
//! a token; a guard invalidated by [`OperationLock::force_release`] does not
//! release a later holder when dropped.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::Serialize;
use tokio::sync::oneshot;

use kbase_core::error::KbError;

/// Lock id used by rebuild and the other structural mutations.
pub const GLOBAL_LOCK: &str = "global";

enum Grant {
    Acquired,
    Released,
}

struct Holder {
    op: String,
    token: u64,
    since: Instant,
}

struct Waiter {
    op: String,
    token: u64,
    tx: oneshot::Sender<Grant>,
}

#[derive(Default)]
struct LockState {
    holder: Option<Holder>,
    waiters: VecDeque<Waiter>,
}

/// Snapshot of a held lock.
#[derive(Debug, Clone, Serialize)]
pub struct HolderInfo {
    pub lock_id: String,
    pub op: String,
    pub held_ms: u128,
    pub waiting: usize,
}

/// A set of named FIFO locks. Cloning shares the same locks.
#[derive(Clone, Default)]
pub struct OperationLock {
    inner: Arc<Mutex<HashMap<String, LockState>>>,
    tokens: Arc<AtomicU64>,
}

/// Held lock; released on drop.
#[must_use = "the lock is released when the guard is dropped"]
pub struct LockGuard {
    lock: OperationLock,
    lock_id: String,
    token: u64,
}

impl LockGuard {
    pub fn lock_id(&self) -> &str {
        &self.lock_id
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.lock.release(&self.lock_id, self.token);
    }
}

/// A queued wait. Dropped before completing, it leaves the queue or passes
/// on a grant that was sent but never received.
struct PendingWait<'a> {
    lock: &'a OperationLock,
    lock_id: &'a str,
    token: u64,
    armed: bool,
}

impl PendingWait<'_> {
    fn complete(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingWait<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.lock.abandon(self.lock_id, self.token);
        }
    }
}

impl OperationLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, HashMap<String, LockState>> {
        // A panic while holding this mutex cannot leave the map inconsistent.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn guard(&self, lock_id: &str, token: u64) -> LockGuard {
        LockGuard {
            lock: self.clone(),
            lock_id: lock_id.to_string(),
            token,
        }
    }

    /// Acquire `lock_id` for `op`, waiting in FIFO order up to `max_wait`.
    ///
    /// Fails with [`KbError::LockTimeout`] when the wait expires and with
    /// [`KbError::LockReleased`] when the lock is force-released while
    /// waiting.
    pub async fn acquire(&self, op: &str, lock_id: &str, max_wait: Duration) -> Result<LockGuard> {
        let token = self.tokens.fetch_add(1, Ordering::Relaxed) + 1;
        let rx = {
            let mut map = self.state();
            let state = map.entry(lock_id.to_string()).or_default();
            if state.holder.is_none() {
                state.holder = Some(Holder {
                    op: op.to_string(),
                    token,
                    since: Instant::now(),
                });
                tracing::debug!(op, lock_id, "lock acquired");
                return Ok(self.guard(lock_id, token));
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter {
                op: op.to_string(),
                token,
                tx,
            });
            tracing::debug!(
                op,
                lock_id,
                position = state.waiters.len(),
                "waiting for lock"
            );
            rx
        };

        let pending = PendingWait {
            lock: self,
            lock_id,
            token,
            armed: true,
        };
        let started = Instant::now();
        match tokio::time::timeout(max_wait, rx).await {
            Ok(Ok(Grant::Acquired)) => {
                pending.complete();
                tracing::debug!(op, lock_id, waited_ms = started.elapsed().as_millis() as u64, "lock acquired");
                Ok(self.guard(lock_id, token))
            }
            Ok(Ok(Grant::Released)) | Ok(Err(_)) => {
                pending.complete();
                Err(KbError::LockReleased {
                    op: op.to_string(),
                    lock_id: lock_id.to_string(),
                }
                .into())
            }
            Err(_) => {
                // Ownership may have been handed over just as the wait expired.
                if self.holds(lock_id, token) {
                    pending.complete();
                    return Ok(self.guard(lock_id, token));
                }
                drop(pending);
                Err(KbError::LockTimeout {
                    op: op.to_string(),
                    lock_id: lock_id.to_string(),
                    waited: max_wait,
                }
                .into())
            }
        }
    }

    /// Acquire without waiting; `None` if held.
    pub fn try_acquire(&self, op: &str, lock_id: &str) -> Option<LockGuard> {
        let token = self.tokens.fetch_add(1, Ordering::Relaxed) + 1;
        let mut map = self.state();
        let state = map.entry(lock_id.to_string()).or_default();
        if state.holder.is_some() {
            return None;
        }
        state.holder = Some(Holder {
            op: op.to_string(),
            token,
            since: Instant::now(),
        });
        drop(map);
        Some(self.guard(lock_id, token))
    }

    fn holds(&self, lock_id: &str, token: u64) -> bool {
        self.state()
            .get(lock_id)
            .and_then(|s| s.holder.as_ref())
            .is_some_and(|h| h.token == token)
    }

    /// Undo a wait whose caller went away.
    fn abandon(&self, lock_id: &str, token: u64) {
        {
            let mut map = self.state();
            let Some(state) = map.get_mut(lock_id) else {
                return;
            };
            if state.holder.as_ref().map(|h| h.token) != Some(token) {
                state.waiters.retain(|w| w.token != token);
                return;
            }
        }
        tracing::debug!(lock_id, "passing on a grant nobody received");
        self.release(lock_id, token);
    }

    fn release(&self, lock_id: &str, token: u64) {
        let mut map = self.state();
        let Some(state) = map.get_mut(lock_id) else {
            return;
        };
        if state.holder.as_ref().map(|h| h.token) != Some(token) {
            return;
        }
        while let Some(next) = state.waiters.pop_front() {
            state.holder = Some(Holder {
                op: next.op,
                token: next.token,
                since: Instant::now(),
            });
            if next.tx.send(Grant::Acquired).is_ok() {
                return;
            }
        }
        state.holder = None;
        map.remove(lock_id);
    }

    /// Clear the holder and reject every queued waiter. Returns whether the
    /// lock was held.
    pub fn force_release(&self, lock_id: &str) -> bool {
        let mut map = self.state();
        let Some(mut state) = map.remove(lock_id) else {
            return false;
        };
        let held = state.holder.take();
        let rejected = state.waiters.len();
        for w in state.waiters.drain(..) {
            let _ = w.tx.send(Grant::Released);
        }
        if let Some(h) = &held {
            tracing::warn!(lock_id, op = %h.op, rejected, "lock force-released");
        }
        held.is_some()
    }

    pub fn is_locked(&self, lock_id: &str) -> bool {
        self.state()
            .get(lock_id)
            .is_some_and(|s| s.holder.is_some())
    }

    pub fn holders(&self) -> Vec<HolderInfo> {
        let map = self.state();
        let mut out: Vec<HolderInfo> = map
            .iter()
            .filter_map(|(id, s)| {
                s.holder.as_ref().map(|h| HolderInfo {
                    lock_id: id.clone(),
                    op: h.op.clone(),
                    held_ms: h.since.elapsed().as_millis(),
                    waiting: s.waiters.len(),
                })
            })
            .collect();
        out.sort_by(|a, b| a.lock_id.cmp(&b.lock_id));
        out
    }
}
