//! # Priority Mutex
//!
//! Mutual exclusion biased toward one class of acquirers. Advances take the
//! lock as *high*, inspects as *low*; any pending high acquisition is
//! admitted before any low acquisition that is merely waiting. A plain
//! `RwLock` cannot express this: both classes need exclusive access (each
//! forks the live machine), and one class must preempt the other.
//!
//! ## Algorithm
//!
//! A `tokio::sync::Mutex`, an atomic counter of pending high acquirers and
//! a `Notify` for parked low acquirers.
//!
//! - High: `counter++`, lock, `counter--`.
//! - Low: lock; while `counter != 0`, register on the `Notify`, release and
//!   wait, then retry.
//! - Releasing a guard notifies all parked low acquirers; they re-test the
//!   counter.
//!
//! Low acquirers starve exactly while a high acquirer is pending, which is
//! the intended behavior. FIFO order among same-priority waiters is not
//! guaranteed. The primitive cannot fail and has no poisoning.
//!
//! ## Cancellation
//!
//! Dropping a pending `acquire_high` future must still decrement the
//! counter, and if the counter reaches zero it must wake parked low
//! acquirers, otherwise they could sleep through the moment the lock became
//! available to them. Both are handled by a drop guard around the lock wait.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex, MutexGuard, Notify};

/// Single-holder lock with two acquisition priorities.
pub struct PriorityMutex<T> {
    inner: Mutex<T>,
    pending_high: AtomicUsize,
    low_waiters: Notify,
}

impl<T> PriorityMutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
            pending_high: AtomicUsize::new(0),
            low_waiters: Notify::new(),
        }
    }

    /// Acquires the lock with high priority.
    ///
    /// Waits only for the current holder and previously admitted high
    /// acquirers, never for parked low acquirers.
    pub async fn acquire_high(&self) -> PriorityGuard<'_, T> {
        let pending = PendingHigh::register(self);
        let inner = self.inner.lock().await;
        drop(pending);
        PriorityGuard { inner, mutex: self }
    }

    /// Acquires the lock with low priority.
    ///
    /// Completes only when the lock is free and no high acquisition is
    /// pending; re-parks whenever it briefly wins the lock while one is.
    pub async fn acquire_low(&self) -> PriorityGuard<'_, T> {
        loop {
            let inner = self.inner.lock().await;
            if self.pending_high.load(Ordering::SeqCst) == 0 {
                return PriorityGuard { inner, mutex: self };
            }

            // Register interest before releasing the lock so a release that
            // races this re-park cannot be missed.
            let notified = self.low_waiters.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            drop(inner);
            notified.await;
        }
    }

    /// Number of high acquisitions currently waiting for the lock.
    pub fn pending_high(&self) -> usize {
        self.pending_high.load(Ordering::SeqCst)
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for PriorityMutex<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityMutex")
            .field("pending_high", &self.pending_high())
            .finish_non_exhaustive()
    }
}

/// Marks one pending high acquisition for the duration of the lock wait.
struct PendingHigh<'a, T> {
    mutex: &'a PriorityMutex<T>,
}

impl<'a, T> PendingHigh<'a, T> {
    fn register(mutex: &'a PriorityMutex<T>) -> Self {
        mutex.pending_high.fetch_add(1, Ordering::SeqCst);
        Self { mutex }
    }
}

impl<T> Drop for PendingHigh<'_, T> {
    fn drop(&mut self) {
        // Runs on grant and on cancellation alike; the last pending high
        // to leave wakes the parked low acquirers.
        if self.mutex.pending_high.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.mutex.low_waiters.notify_waiters();
        }
    }
}

/// Exclusive guard returned by both acquire paths.
pub struct PriorityGuard<'a, T> {
    inner: MutexGuard<'a, T>,
    mutex: &'a PriorityMutex<T>,
}

impl<T> Deref for PriorityGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> DerefMut for PriorityGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

impl<T> Drop for PriorityGuard<'_, T> {
    fn drop(&mut self) {
        // Wake parked low acquirers; the lock itself is released right
        // after this body when `inner` drops, and woken waiters re-test
        // the counter anyway.
        self.mutex.low_waiters.notify_waiters();
    }
}

// ════════════════════════════════════════════════════════════════════════════
// UNIT TESTS
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    // ─────────────────────────────────────────────────────────────────
    // A. Basic acquisition
    // ─────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn uncontended_low_acquires_immediately() {
        let mutex = PriorityMutex::new(41);
        let mut guard = timeout(Duration::from_secs(1), mutex.acquire_low())
            .await
            .unwrap();
        *guard += 1;
        drop(guard);
        assert_eq!(*mutex.acquire_high().await, 42);
    }

    #[tokio::test]
    async fn guards_are_mutually_exclusive() {
        let mutex = Arc::new(PriorityMutex::new(()));
        let guard = mutex.acquire_high().await;

        let contender = {
            let mutex = mutex.clone();
            tokio::spawn(async move {
                let _guard = mutex.acquire_high().await;
            })
        };
        sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        drop(guard);
        timeout(Duration::from_secs(1), contender)
            .await
            .unwrap()
            .unwrap();
    }

    // ─────────────────────────────────────────────────────────────────
    // B. Priority
    // ─────────────────────────────────────────────────────────────────

    /// A low acquirer that parked first must still lose to a high acquirer
    /// that arrived while the lock was held.
    #[tokio::test]
    async fn pending_high_preempts_waiting_low() {
        let mutex = Arc::new(PriorityMutex::new(Vec::<&str>::new()));
        let guard = mutex.acquire_high().await;

        let low = {
            let mutex = mutex.clone();
            tokio::spawn(async move {
                mutex.acquire_low().await.push("low");
            })
        };
        sleep(Duration::from_millis(50)).await;

        let high = {
            let mutex = mutex.clone();
            tokio::spawn(async move {
                mutex.acquire_high().await.push("high");
            })
        };
        sleep(Duration::from_millis(50)).await;

        drop(guard);
        timeout(Duration::from_secs(1), async {
            high.await.unwrap();
            low.await.unwrap();
        })
        .await
        .unwrap();

        assert_eq!(*mutex.acquire_high().await, ["high", "low"]);
    }

    /// With several of each parked, every high completes before any low.
    #[tokio::test]
    async fn all_highs_admitted_before_any_low() {
        let mutex = Arc::new(PriorityMutex::new(Vec::<String>::new()));
        let guard = mutex.acquire_high().await;

        let mut tasks = Vec::new();
        for i in 0..3 {
            let mutex = mutex.clone();
            tasks.push(tokio::spawn(async move {
                mutex.acquire_low().await.push(format!("low{i}"));
            }));
            sleep(Duration::from_millis(20)).await;
        }
        for i in 0..2 {
            let mutex = mutex.clone();
            tasks.push(tokio::spawn(async move {
                mutex.acquire_high().await.push(format!("high{i}"));
            }));
            sleep(Duration::from_millis(20)).await;
        }

        drop(guard);
        for task in tasks {
            timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        }

        let order = mutex.acquire_high().await;
        let first_low = order.iter().position(|e| e.starts_with("low")).unwrap();
        assert!(
            order[..first_low].iter().all(|e| e.starts_with("high")),
            "lows admitted before highs drained: {:?}",
            *order
        );
        assert_eq!(order.len(), 5);
    }

    // ─────────────────────────────────────────────────────────────────
    // C. Cancellation
    // ─────────────────────────────────────────────────────────────────

    /// Aborting a pending high acquisition must not wedge parked lows.
    #[tokio::test]
    async fn cancelled_high_releases_low_waiters() {
        let mutex = Arc::new(PriorityMutex::new(()));
        let guard = mutex.acquire_high().await;

        let low = {
            let mutex = mutex.clone();
            tokio::spawn(async move {
                let _guard = mutex.acquire_low().await;
            })
        };
        sleep(Duration::from_millis(50)).await;

        let high = {
            let mutex = mutex.clone();
            tokio::spawn(async move {
                let _guard = mutex.acquire_high().await;
                sleep(Duration::from_secs(30)).await;
            })
        };
        sleep(Duration::from_millis(50)).await;

        high.abort();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(mutex.pending_high(), 0);

        drop(guard);
        timeout(Duration::from_secs(1), low).await.unwrap().unwrap();
    }
}
