//! Hybrid expiration scheduler
//!
//! Fires a callback for each (guild, member) key at or after its deadline,
//! exactly once, with explicit cancel-before-fire. Entries due within
//! [`NEAR_HORIZON`] are armed as in-process tokio timers; entries further
//! out sit in a min-heap that a promotion loop re-examines every
//! [`PROMOTE_INTERVAL`], moving entries into the timer tier as they cross
//! the horizon. This keeps long punishments out of the timer wheel while
//! near-term expirations still land within a few seconds of their deadline.
//!
//! The scheduler holds no authoritative state: a callback that reports
//! failure is not retried here, the lifecycle manager re-derives deadlines
//! from the persisted store.

use crate::punishment::record::PunishKey;
use chrono::{DateTime, Utc};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use tokio::task::AbortHandle;
use tokio::time::{Duration, Instant, interval, sleep_until};
use tracing::{debug, warn};

/// Deadlines at or below this distance are armed as immediate timers
pub const NEAR_HORIZON: Duration = Duration::from_secs(30);
/// How often the far queue is re-examined for promotion
pub const PROMOTE_INTERVAL: Duration = Duration::from_secs(5);

/// Future returned by the expiration callback; the boolean signals success
pub type ExpireFuture = Pin<Box<dyn Future<Output = bool> + Send>>;
/// Callback invoked when an entry fires
pub type ExpireCallback = Arc<dyn Fn(PunishKey) -> ExpireFuture + Send + Sync>;

/// Convert an absolute wall-clock expiry into a monotonic deadline,
/// given the caller's notion of the current wall-clock time. Expiries
/// already in the past map to "now".
#[must_use]
pub fn deadline_from_until(until: DateTime<Utc>, now: DateTime<Utc>) -> Instant {
    let millis = (until - now).num_milliseconds().max(0) as u64;
    Instant::now() + Duration::from_millis(millis)
}

struct HeapEntry {
    deadline: Instant,
    generation: u64,
    key: PunishKey,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.generation == other.generation
    }
}

impl Eq for HeapEntry {}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.generation.cmp(&other.generation))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Pending {
    deadline: Instant,
    generation: u64,
    // Present once the entry is armed as an immediate timer
    timer: Option<AbortHandle>,
}

#[derive(Default)]
struct Inner {
    heap: BinaryHeap<Reverse<HeapEntry>>,
    pending: HashMap<PunishKey, Pending>,
    next_generation: u64,
}

/// Two-tier deferred execution queue keyed by (guild, member)
pub struct ExpirationScheduler {
    inner: Mutex<Inner>,
    callback: OnceLock<ExpireCallback>,
}

impl Default for ExpirationScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpirationScheduler {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            callback: OnceLock::new(),
        }
    }

    /// Register the expiration callback. Must happen before any entry can
    /// fire; a fire without a callback is dropped with a warning.
    pub fn set_callback(&self, callback: ExpireCallback) {
        if self.callback.set(callback).is_err() {
            warn!("Expiration callback was already set, ignoring replacement");
        }
    }

    /// Start the periodic promotion loop. Call only after startup
    /// reconciliation has re-armed everything from the store.
    pub fn start(self: &Arc<Self>) {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(PROMOTE_INTERVAL);
            loop {
                ticker.tick().await;
                scheduler.promote_due();
            }
        });
    }

    /// Register `key` to fire at `deadline`. Returns false without
    /// touching anything if the key already has a pending entry.
    pub fn schedule(self: &Arc<Self>, deadline: Instant, key: PunishKey) -> bool {
        let mut inner = self.lock();
        if inner.pending.contains_key(&key) {
            debug!(%key, "Duplicate schedule suppressed");
            return false;
        }

        inner.next_generation += 1;
        let generation = inner.next_generation;

        if deadline <= Instant::now() + NEAR_HORIZON {
            let timer = self.arm_timer(key, deadline, generation);
            inner.pending.insert(
                key,
                Pending {
                    deadline,
                    generation,
                    timer: Some(timer),
                },
            );
        } else {
            inner.heap.push(Reverse(HeapEntry {
                deadline,
                generation,
                key,
            }));
            inner.pending.insert(
                key,
                Pending {
                    deadline,
                    generation,
                    timer: None,
                },
            );
        }
        true
    }

    /// Cancel-then-schedule; the new deadline always wins.
    pub fn rearm(self: &Arc<Self>, deadline: Instant, key: PunishKey) {
        self.cancel(key);
        self.schedule(deadline, key);
    }

    /// Remove a pending entry wherever it lives. If this returns true the
    /// callback is guaranteed not to fire for the cancelled entry.
    pub fn cancel(&self, key: PunishKey) -> bool {
        let mut inner = self.lock();
        match inner.pending.remove(&key) {
            Some(pending) => {
                if let Some(timer) = pending.timer {
                    timer.abort();
                }
                // A matching heap entry, if any, is dropped lazily when
                // its generation no longer matches.
                true
            }
            None => false,
        }
    }

    /// Whether `key` currently has a pending entry
    #[must_use]
    pub fn is_scheduled(&self, key: PunishKey) -> bool {
        self.lock().pending.contains_key(&key)
    }

    /// Whether the pending entry for `key` is armed as an immediate timer
    /// (as opposed to waiting in the far queue)
    #[must_use]
    pub fn is_armed(&self, key: PunishKey) -> Option<bool> {
        self.lock()
            .pending
            .get(&key)
            .map(|pending| pending.timer.is_some())
    }

    /// Number of pending entries across both tiers
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Move far-queue entries that crossed the horizon into the timer tier
    fn promote_due(self: &Arc<Self>) {
        let cutoff = Instant::now() + NEAR_HORIZON;
        let mut inner = self.lock();

        while let Some(Reverse(head)) = inner.heap.peek() {
            if head.deadline > cutoff {
                break;
            }
            let Some(Reverse(entry)) = inner.heap.pop() else {
                break;
            };
            let live = inner
                .pending
                .get(&entry.key)
                .is_some_and(|p| p.generation == entry.generation && p.timer.is_none());
            if !live {
                // Cancelled or re-armed since it was queued
                continue;
            }
            let timer = self.arm_timer(entry.key, entry.deadline, entry.generation);
            if let Some(pending) = inner.pending.get_mut(&entry.key) {
                pending.timer = Some(timer);
            }
        }
    }

    fn arm_timer(self: &Arc<Self>, key: PunishKey, deadline: Instant, generation: u64) -> AbortHandle {
        let scheduler = Arc::clone(self);
        let task = tokio::spawn(async move {
            sleep_until(deadline).await;
            scheduler.fire(key, generation).await;
        });
        task.abort_handle()
    }

    async fn fire(self: Arc<Self>, key: PunishKey, generation: u64) {
        // Consume the entry under the lock; a cancel that got here first
        // wins and the callback never runs.
        let live = {
            let mut inner = self.lock();
            match inner.pending.get(&key) {
                Some(pending) if pending.generation == generation => {
                    inner.pending.remove(&key);
                    true
                }
                _ => false,
            }
        };
        if !live {
            debug!(%key, "Timer lost the race to a cancel, not firing");
            return;
        }

        let Some(callback) = self.callback.get() else {
            warn!(%key, "Entry fired before a callback was registered, dropping");
            return;
        };

        // Each fire runs in its own task, so a panicking callback cannot
        // take the promotion loop down with it.
        if !callback(key).await {
            warn!(
                %key,
                "Expiration callback reported failure, re-arm is left to the lifecycle manager"
            );
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
