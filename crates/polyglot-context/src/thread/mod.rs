//! Per-thread execution info and the thread-local side of entering
//!
//! Threads are identified by a [`ThreadKey`] handed out once per OS thread.
//! Contexts never hold a thread alive: they keep a [`ThreadInfo`] keyed by
//! the thread's key plus an unpark handle, and every thread that entered a
//! context carries a thread-local guard which tells those contexts when the
//! thread terminates so they can prune their registry.

mod registry;

pub(crate) use registry::{ThreadRecord, ThreadRegistry};

use crate::context::{ContextId, ContextInner};
use rustc_hash::FxHashMap;
use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::Thread;

/// Stable identifier of an OS thread
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadKey(u64);

static NEXT_THREAD_KEY: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static KEY: Cell<u64> = const { Cell::new(0) };
    static LOCAL: LocalThread = LocalThread::default();
}

impl ThreadKey {
    /// Key of the calling thread
    pub fn current() -> Self {
        KEY.with(|key| {
            if key.get() == 0 {
                key.set(NEXT_THREAD_KEY.fetch_add(1, Ordering::Relaxed));
            }
            ThreadKey(key.get())
        })
    }

    /// Get the numeric key value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// One thread's relationship to one context
///
/// The counters are atomics so the single-threaded fast path can update them
/// without taking the context monitor. Everything else about the thread
/// lives in the registry's [`ThreadRecord`] and is guarded by the monitor.
#[derive(Debug)]
pub(crate) struct ThreadInfo {
    key: ThreadKey,
    /// Unpark handle; does not keep the thread alive
    thread: Thread,
    entered: AtomicUsize,
    /// Mailbox non-empty
    pending: AtomicBool,
    /// Platform-interrupt analogue, consumed by interruptible waits
    interrupted: AtomicBool,
    /// Observed a cancel or exit and left
    cancelled: AtomicBool,
    side_effects_allowed: AtomicBool,
    disposed: AtomicBool,
}

impl ThreadInfo {
    pub(crate) fn for_current_thread() -> Self {
        Self {
            key: ThreadKey::current(),
            thread: std::thread::current(),
            entered: AtomicUsize::new(0),
            pending: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            side_effects_allowed: AtomicBool::new(true),
            disposed: AtomicBool::new(false),
        }
    }

    pub(crate) fn key(&self) -> ThreadKey {
        self.key
    }

    pub(crate) fn thread_name(&self) -> String {
        self.thread
            .name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("thread-{}", self.key.as_u64()))
    }

    pub(crate) fn entered_count(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }

    pub(crate) fn is_active(&self) -> bool {
        self.entered_count() > 0
    }

    /// Increment the entered count, returning the new value
    pub(crate) fn enter(&self) -> usize {
        self.entered.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Decrement the entered count, returning the new value
    ///
    /// Saturates at zero: leaving a thread that is not entered is a no-op.
    pub(crate) fn leave(&self) -> usize {
        let mut current = self.entered.load(Ordering::SeqCst);
        loop {
            if current == 0 {
                return 0;
            }
            match self.entered.compare_exchange_weak(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return current - 1,
                Err(actual) => current = actual,
            }
        }
    }

    /// Replace the entered count, returning the previous one
    pub(crate) fn swap_entered(&self, count: usize) -> usize {
        self.entered.swap(count, Ordering::SeqCst)
    }

    pub(crate) fn has_pending_actions(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    pub(crate) fn set_pending_actions(&self, pending: bool) {
        self.pending.store(pending, Ordering::Release);
    }

    /// Raise the interrupt flag and wake the thread if it is parked
    pub(crate) fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        self.thread.unpark();
    }

    /// Clear the interrupt flag, returning whether it was set
    pub(crate) fn clear_interrupted(&self) -> bool {
        self.interrupted.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn unpark(&self) {
        self.thread.unpark();
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn set_cancelled(&self, cancelled: bool) {
        self.cancelled.store(cancelled, Ordering::Release);
    }

    pub(crate) fn side_effects_allowed(&self) -> bool {
        self.side_effects_allowed.load(Ordering::Acquire)
    }

    pub(crate) fn set_side_effects_allowed(&self, allowed: bool) -> bool {
        self.side_effects_allowed.swap(allowed, Ordering::AcqRel)
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_disposed(&self) {
        self.disposed.store(true, Ordering::Release);
    }
}

/// Thread-local state of the calling thread
#[derive(Default)]
struct LocalThread {
    /// Contexts entered on this thread, innermost last
    stack: RefCell<Vec<Arc<ContextInner>>>,
    /// This thread's info per context, for the lock-free fast path
    infos: RefCell<FxHashMap<ContextId, Arc<ThreadInfo>>>,
    /// Contexts to notify when this thread terminates
    watched: RefCell<FxHashMap<ContextId, Weak<ContextInner>>>,
}

impl Drop for LocalThread {
    fn drop(&mut self) {
        let key = ThreadKey::current();
        self.stack.get_mut().clear();
        self.infos.get_mut().clear();
        for (_, context) in self.watched.get_mut().drain() {
            if let Some(context) = context.upgrade() {
                context.on_thread_terminated(key);
            }
        }
    }
}

/// Push a context onto the calling thread's current-context stack
pub(crate) fn push_context(context: Arc<ContextInner>) {
    let _ = LOCAL.try_with(|local| local.stack.borrow_mut().push(context));
}

/// Pop the innermost occurrence of a context from the stack
pub(crate) fn pop_context(id: ContextId) -> bool {
    LOCAL
        .try_with(|local| {
            let mut stack = local.stack.borrow_mut();
            match stack.iter().rposition(|c| c.id() == id) {
                Some(index) => {
                    stack.remove(index);
                    true
                }
                None => false,
            }
        })
        .unwrap_or(false)
}

/// Innermost entered context of the calling thread
pub(crate) fn current_context() -> Option<Arc<ContextInner>> {
    LOCAL
        .try_with(|local| local.stack.borrow().last().cloned())
        .ok()
        .flatten()
}

/// All contexts entered on the calling thread, innermost last
pub(crate) fn entered_contexts() -> Vec<Arc<ContextInner>> {
    LOCAL
        .try_with(|local| local.stack.borrow().clone())
        .unwrap_or_default()
}

pub(crate) fn cached_info(id: ContextId) -> Option<Arc<ThreadInfo>> {
    LOCAL
        .try_with(|local| local.infos.borrow().get(&id).cloned())
        .ok()
        .flatten()
}

/// Remember this thread's info for a context and watch for termination
pub(crate) fn register_info(context: &Arc<ContextInner>, info: Arc<ThreadInfo>) {
    let _ = LOCAL.try_with(|local| {
        let mut infos = local.infos.borrow_mut();
        infos.retain(|_, cached| !cached.is_disposed());
        infos.insert(context.id(), info);
        let mut watched = local.watched.borrow_mut();
        watched.retain(|_, weak| weak.strong_count() > 0);
        watched.insert(context.id(), Arc::downgrade(context));
    });
}

pub(crate) fn forget_info(id: ContextId) {
    let _ = LOCAL.try_with(|local| {
        local.infos.borrow_mut().remove(&id);
        local.watched.borrow_mut().remove(&id);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_keys_are_stable_and_unique() {
        let here = ThreadKey::current();
        assert_eq!(here, ThreadKey::current());

        let other = std::thread::spawn(ThreadKey::current).join().unwrap();
        assert_ne!(here, other);
    }

    #[test]
    fn test_entered_count_never_negative() {
        let info = ThreadInfo::for_current_thread();
        assert_eq!(info.leave(), 0);
        assert_eq!(info.enter(), 1);
        assert_eq!(info.enter(), 2);
        assert_eq!(info.leave(), 1);
        assert_eq!(info.leave(), 0);
        assert_eq!(info.leave(), 0);
        assert!(!info.is_active());
    }

    #[test]
    fn test_interrupt_flag() {
        let info = ThreadInfo::for_current_thread();
        assert!(!info.clear_interrupted());
        info.interrupt();
        assert!(info.clear_interrupted());
        assert!(!info.clear_interrupted());
    }

    #[test]
    fn test_side_effects_toggle() {
        let info = ThreadInfo::for_current_thread();
        assert!(info.set_side_effects_allowed(false));
        assert!(!info.side_effects_allowed());
        assert!(!info.set_side_effects_allowed(true));
    }
}
