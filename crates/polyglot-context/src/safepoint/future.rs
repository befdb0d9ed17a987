//! Completion handles for submitted thread-local actions

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct FutureInner {
    /// Threads that still have to perform (or skip) the action
    remaining: usize,
    cancelled: bool,
    /// Threads expected at the barrier of a synchronous action
    parties: usize,
    arrived: usize,
}

#[derive(Debug)]
struct FutureState {
    inner: Mutex<FutureInner>,
    changed: Condvar,
}

/// Awaitable, cancellable handle of a thread-local action
///
/// Completes once every targeted thread performed the action, skipped it,
/// or was disposed. Recurring actions only complete when cancelled.
#[derive(Debug, Clone)]
pub struct ActionFuture {
    state: Arc<FutureState>,
}

impl ActionFuture {
    pub(crate) fn new(targets: usize, parties: usize) -> Self {
        Self {
            state: Arc::new(FutureState {
                inner: Mutex::new(FutureInner {
                    remaining: targets,
                    cancelled: false,
                    parties,
                    arrived: 0,
                }),
                changed: Condvar::new(),
            }),
        }
    }

    /// A future that is already complete
    pub fn completed() -> Self {
        Self::new(0, 0)
    }

    /// Every targeted thread is done, or the future was cancelled
    pub fn is_done(&self) -> bool {
        let inner = self.state.inner.lock();
        inner.remaining == 0 || inner.cancelled
    }

    /// Whether `cancel` was called
    pub fn is_cancelled(&self) -> bool {
        self.state.inner.lock().cancelled
    }

    /// Cancel the action on threads that have not performed it yet
    ///
    /// Returns false if the action had already completed.
    pub fn cancel(&self) -> bool {
        let mut inner = self.state.inner.lock();
        if inner.cancelled || inner.remaining == 0 {
            return false;
        }
        inner.cancelled = true;
        self.state.changed.notify_all();
        true
    }

    /// Block until done
    pub fn wait(&self) {
        let mut inner = self.state.inner.lock();
        while inner.remaining > 0 && !inner.cancelled {
            self.state.changed.wait(&mut inner);
        }
    }

    /// Block until done or the timeout elapses; returns whether it is done
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.wait_until(Instant::now() + timeout)
    }

    /// Block until done or the deadline passes; returns whether it is done
    pub fn wait_until(&self, deadline: Instant) -> bool {
        let mut inner = self.state.inner.lock();
        while inner.remaining > 0 && !inner.cancelled {
            if self.state.changed.wait_until(&mut inner, deadline).timed_out() {
                return inner.remaining == 0 || inner.cancelled;
            }
        }
        true
    }

    /// One targeted thread finished with the action
    pub(crate) fn complete_part(&self) {
        let mut inner = self.state.inner.lock();
        inner.remaining = inner.remaining.saturating_sub(1);
        if inner.remaining == 0 {
            self.state.changed.notify_all();
        }
    }

    /// Arrive at the barrier of a synchronous action and wait for the others
    pub(crate) fn arrive_and_wait(&self) {
        let mut inner = self.state.inner.lock();
        inner.arrived += 1;
        self.state.changed.notify_all();
        while inner.arrived < inner.parties && !inner.cancelled {
            self.state.changed.wait(&mut inner);
        }
    }

    /// A party will not arrive at the barrier any more
    pub(crate) fn leave_barrier(&self) {
        let mut inner = self.state.inner.lock();
        inner.parties = inner.parties.saturating_sub(1);
        self.state.changed.notify_all();
    }
}

/// Union of action futures across a context subtree
#[derive(Debug, Clone, Default)]
pub struct CombinedFuture {
    futures: Vec<ActionFuture>,
}

impl CombinedFuture {
    /// Create an empty combined future
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a future
    pub fn push(&mut self, future: ActionFuture) {
        self.futures.push(future);
    }

    /// Add all futures of another combined future
    pub fn extend(&mut self, other: CombinedFuture) {
        self.futures.extend(other.futures);
    }

    /// Number of futures
    pub fn len(&self) -> usize {
        self.futures.len()
    }

    /// Whether no future was collected
    pub fn is_empty(&self) -> bool {
        self.futures.is_empty()
    }

    /// All futures are done
    pub fn is_done(&self) -> bool {
        self.futures.iter().all(ActionFuture::is_done)
    }

    /// Cancel all futures
    pub fn cancel(&self) {
        for future in &self.futures {
            future.cancel();
        }
    }

    /// Wait for all futures; `None` waits forever
    ///
    /// Returns whether all futures completed before the deadline.
    pub fn wait_until(&self, deadline: Option<Instant>) -> bool {
        for future in &self.futures {
            match deadline {
                Some(deadline) => {
                    if !future.wait_until(deadline) {
                        return false;
                    }
                }
                None => future.wait(),
            }
        }
        true
    }
}

impl FromIterator<ActionFuture> for CombinedFuture {
    fn from_iter<I: IntoIterator<Item = ActionFuture>>(iter: I) -> Self {
        Self {
            futures: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_completed_future() {
        let future = ActionFuture::completed();
        assert!(future.is_done());
        assert!(!future.cancel());
        future.wait();
    }

    #[test]
    fn test_parts_complete_future() {
        let future = ActionFuture::new(2, 0);
        assert!(!future.is_done());
        future.complete_part();
        assert!(!future.wait_timeout(Duration::from_millis(10)));
        future.complete_part();
        assert!(future.is_done());
        assert!(future.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_cancel_wakes_waiters() {
        let future = ActionFuture::new(1, 0);
        let waiter = {
            let future = future.clone();
            thread::spawn(move || future.wait())
        };
        assert!(future.cancel());
        waiter.join().unwrap();
        assert!(future.is_cancelled());
        assert!(future.is_done());
    }

    #[test]
    fn test_barrier_releases_when_party_leaves() {
        let future = ActionFuture::new(2, 2);
        let arriving = {
            let future = future.clone();
            thread::spawn(move || future.arrive_and_wait())
        };
        thread::sleep(Duration::from_millis(20));
        future.leave_barrier();
        arriving.join().unwrap();
    }

    #[test]
    fn test_combined_future_deadline() {
        let done = ActionFuture::completed();
        let pending = ActionFuture::new(1, 0);
        let combined: CombinedFuture = vec![done, pending.clone()].into_iter().collect();
        assert_eq!(combined.len(), 2);
        assert!(!combined.wait_until(Some(Instant::now() + Duration::from_millis(10))));
        pending.complete_part();
        assert!(combined.wait_until(None));
        assert!(combined.is_done());
    }
}
