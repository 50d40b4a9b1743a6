//! Priority lock that serializes access to the device.
//!
//! The controller handles one HTTP request at a time, and every caller
//! (discovery, the poller, transitions, user commands) wants to talk to it.
//! [`PriorityChannel`] admits exactly one holder and queues the rest in a
//! min-heap keyed on `(priority, sequence)`:
//!
//! - lower priority values are served first
//! - equal priorities are served in arrival order
//! - a free channel admits any priority immediately
//!
//! | Constant | Value | Used by |
//! |----------|-------|---------|
//! | [`PRIORITY_EXPEDITED`] | `-1` | user commands, transitions |
//! | [`PRIORITY_BACKGROUND`] | `0` | discovery, polling |
//!
//! ```rust
//! use rs_megad::priority::{PriorityChannel, PRIORITY_BACKGROUND};
//!
//! # let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
//! # rt.block_on(async {
//! let channel = PriorityChannel::new();
//! let permit = channel.acquire(PRIORITY_BACKGROUND).await;
//! assert!(channel.is_locked());
//! permit.release();
//! assert!(!channel.is_locked());
//! # });
//! ```
//!
//! # Cancellation
//!
//! Dropping an `acquire` future removes the waiter. If the lock had already
//! been handed to it, the lock moves on to the next waiter instead of leaking.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

use crate::error::{Error, Result};

/// Priority of background work (discovery, polling).
pub const PRIORITY_BACKGROUND: i32 = 0;

/// Priority of user-triggered commands. Served before background work.
pub const PRIORITY_EXPEDITED: i32 = -1;

/// A queued acquirer.
pub(crate) struct Waiter {
    priority: i32,
    sequence: u64,
    completion: oneshot::Sender<()>,
}

impl Waiter {
    fn key(&self) -> Reverse<(i32, u64)> {
        Reverse((self.priority, self.sequence))
    }
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

#[derive(Default)]
struct State {
    locked: bool,
    waiters: BinaryHeap<Waiter>,
    next_sequence: u64,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes the lock if free, otherwise queues a waiter.
    fn admit(&self, priority: i32) -> Option<oneshot::Receiver<()>> {
        let mut state = self.state();
        if !state.locked {
            state.locked = true;
            return None;
        }

        let (tx, rx) = oneshot::channel();
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.waiters.push(Waiter {
            priority,
            sequence,
            completion: tx,
        });
        Some(rx)
    }

    /// Hands the lock to the best live waiter, or frees it.
    fn unlock(&self) -> Result<()> {
        let mut state = self.state();
        if !state.locked {
            return Err(Error::ChannelNotHeld);
        }
        while let Some(waiter) = state.waiters.pop() {
            if waiter.completion.send(()).is_ok() {
                tracing::trace!(
                    priority = waiter.priority,
                    sequence = waiter.sequence,
                    "channel handed over"
                );
                return Ok(());
            }
        }
        state.locked = false;
        Ok(())
    }
}

/// Single-holder async lock with priority ordering.
///
/// Cloning is cheap; clones share the same lock.
#[derive(Clone, Default)]
pub struct PriorityChannel {
    inner: Arc<Inner>,
}

impl PriorityChannel {
    /// Creates a free channel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until the channel is granted at `priority`.
    ///
    /// The returned permit releases the channel when dropped.
    pub async fn acquire(&self, priority: i32) -> ChannelPermit {
        loop {
            let Some(rx) = self.inner.admit(priority) else {
                return self.permit();
            };

            let mut pending = PendingGrant {
                inner: &self.inner,
                rx,
                armed: true,
            };
            let granted = (&mut pending.rx).await.is_ok();
            pending.armed = false;
            if granted {
                return self.permit();
            }
            // Sender vanished without a grant; queue again.
        }
    }

    /// Returns true while somebody holds the channel.
    pub fn is_locked(&self) -> bool {
        self.inner.state().locked
    }

    /// Number of live waiters.
    pub fn queued(&self) -> usize {
        self.inner
            .state()
            .waiters
            .iter()
            .filter(|w| !w.completion.is_closed())
            .count()
    }

    fn permit(&self) -> ChannelPermit {
        ChannelPermit {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl core::fmt::Debug for PriorityChannel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PriorityChannel")
            .field("locked", &self.is_locked())
            .field("queued", &self.queued())
            .finish()
    }
}

/// Waiter side of an in-flight `acquire`, cleaned up if the future is dropped.
struct PendingGrant<'a> {
    inner: &'a Inner,
    rx: oneshot::Receiver<()>,
    armed: bool,
}

impl Drop for PendingGrant<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.rx.close();
        if self.rx.try_recv().is_ok() {
            // Granted between the last poll and the drop: pass it on.
            if let Err(e) = self.inner.unlock() {
                tracing::error!(error = %e, "failed to pass on abandoned grant");
            }
        }
    }
}

/// Exclusive right to talk to the device. Releases on drop.
#[must_use = "the channel is released as soon as the permit is dropped"]
pub struct ChannelPermit {
    inner: Arc<Inner>,
}

impl ChannelPermit {
    /// Releases the channel now.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for ChannelPermit {
    fn drop(&mut self) {
        if let Err(e) = self.inner.unlock() {
            tracing::error!(error = %e, "priority channel invariant broken");
        }
    }
}

impl core::fmt::Debug for ChannelPermit {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ChannelPermit").finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    async fn wait_queued(channel: &PriorityChannel, n: usize) {
        while channel.queued() < n {
            tokio::task::yield_now().await;
        }
    }

    fn spawn_recorder(
        channel: &PriorityChannel,
        priority: i32,
        label: &'static str,
        log: &Arc<StdMutex<Vec<&'static str>>>,
    ) -> tokio::task::JoinHandle<()> {
        let channel = channel.clone();
        let log = Arc::clone(log);
        tokio::spawn(async move {
            let permit = channel.acquire(priority).await;
            log.lock().unwrap().push(label);
            permit.release();
        })
    }

    #[tokio::test]
    async fn free_channel_admits_immediately() {
        let channel = PriorityChannel::new();
        assert!(!channel.is_locked());

        let permit = channel.acquire(5).await;
        assert!(channel.is_locked());
        assert_eq!(channel.queued(), 0);

        drop(permit);
        assert!(!channel.is_locked());
    }

    #[tokio::test]
    async fn expedited_jumps_background_queue() {
        let channel = PriorityChannel::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        let holder = channel.acquire(PRIORITY_BACKGROUND).await;

        let a = spawn_recorder(&channel, PRIORITY_BACKGROUND, "bg1", &log);
        wait_queued(&channel, 1).await;
        let b = spawn_recorder(&channel, PRIORITY_EXPEDITED, "user", &log);
        wait_queued(&channel, 2).await;
        let c = spawn_recorder(&channel, PRIORITY_BACKGROUND, "bg2", &log);
        wait_queued(&channel, 3).await;

        holder.release();
        for task in [a, b, c] {
            task.await.unwrap();
        }

        assert_eq!(*log.lock().unwrap(), vec!["user", "bg1", "bg2"]);
        assert!(!channel.is_locked());
    }

    #[tokio::test]
    async fn equal_priority_is_fifo() {
        let channel = PriorityChannel::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        let holder = channel.acquire(0).await;

        let labels = ["first", "second", "third", "fourth"];
        let mut tasks = Vec::new();
        for (i, label) in labels.into_iter().enumerate() {
            tasks.push(spawn_recorder(&channel, 3, label, &log));
            wait_queued(&channel, i + 1).await;
        }

        drop(holder);
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*log.lock().unwrap(), labels.to_vec());
    }

    #[tokio::test]
    async fn cancelled_waiter_is_skipped() {
        let channel = PriorityChannel::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        let holder = channel.acquire(0).await;

        let doomed = spawn_recorder(&channel, PRIORITY_EXPEDITED, "doomed", &log);
        wait_queued(&channel, 1).await;
        let survivor = spawn_recorder(&channel, PRIORITY_BACKGROUND, "survivor", &log);
        wait_queued(&channel, 2).await;

        doomed.abort();
        assert!(doomed.await.unwrap_err().is_cancelled());
        assert_eq!(channel.queued(), 1);

        drop(holder);
        survivor.await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["survivor"]);
        assert!(!channel.is_locked());
    }

    #[tokio::test]
    async fn grant_to_dropped_waiter_moves_on() {
        let channel = PriorityChannel::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        let holder = channel.acquire(0).await;

        let granted_then_gone = spawn_recorder(&channel, PRIORITY_EXPEDITED, "gone", &log);
        wait_queued(&channel, 1).await;
        let next = spawn_recorder(&channel, PRIORITY_BACKGROUND, "next", &log);
        wait_queued(&channel, 2).await;

        // Hands the lock to the expedited waiter before it gets to run.
        drop(holder);
        granted_then_gone.abort();

        tokio::time::timeout(Duration::from_secs(1), next)
            .await
            .expect("lock was leaked")
            .unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["next"]);
        assert!(!channel.is_locked());
    }

    #[tokio::test]
    async fn unlocking_free_channel_reports_error() {
        let channel = PriorityChannel::new();
        assert!(matches!(
            channel.inner.unlock(),
            Err(Error::ChannelNotHeld)
        ));
    }

    #[tokio::test]
    async fn clones_share_the_lock() {
        let channel = PriorityChannel::new();
        let other = channel.clone();
        let _permit = channel.acquire(0).await;
        assert!(other.is_locked());
    }

    #[test]
    fn waiter_ordering_is_min_first() {
        let mut heap = BinaryHeap::new();
        for (priority, sequence) in [(0, 0), (-1, 1), (0, 2), (-1, 3)] {
            let (tx, _rx) = oneshot::channel();
            heap.push(Waiter {
                priority,
                sequence,
                completion: tx,
            });
        }
        let order: Vec<_> = std::iter::from_fn(|| heap.pop())
            .map(|w| (w.priority, w.sequence))
            .collect();
        assert_eq!(order, vec![(-1, 1), (-1, 3), (0, 0), (0, 2)]);
    }
}
