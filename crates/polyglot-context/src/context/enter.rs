//! Entering and leaving threads
//!
//! ## Fast path
//!
//! While one thread uses a context in the DEFAULT state its key is cached
//! in `cached_thread`; that thread then enters and leaves with two atomic
//! operations and no locking. Everything else takes the slow path under
//! the monitor, which may register the thread, switch the context to
//! multi-threaded mode, and initialize the thread in every language.

use super::{Context, ContextInner, ContextState, Interrupter};
use crate::thread::{self, ThreadInfo, ThreadKey, ThreadRecord};
use crate::{PolyglotError, PolyglotResult};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Longest single park of `sleep_interruptibly` between polls
const SLEEP_SLICE: Duration = Duration::from_millis(10);

/// Proof that the calling thread entered a context
///
/// Leaves the context when dropped unless it was consumed by
/// [`Context::leave_if_needed`]. A guard from `enter_if_needed` on an
/// already entered thread leaves nothing.
#[must_use = "the context is left when the guard is dropped"]
pub struct EnterGuard<'a> {
    context: &'a Context,
    entered: bool,
}

impl EnterGuard<'_> {
    /// Whether this guard performed an enter
    pub fn entered(&self) -> bool {
        self.entered
    }
}

impl Drop for EnterGuard<'_> {
    fn drop(&mut self) {
        if self.entered {
            self.entered = false;
            if let Err(e) = self.context.leave() {
                tracing::trace!(
                    context = self.context.id().as_u64(),
                    error = %e,
                    "leave on guard drop failed"
                );
            }
        }
    }
}

impl ContextInner {
    /// Lock-free enter for the cached thread
    fn try_fast_enter(&self, key: ThreadKey) -> Option<Arc<ThreadInfo>> {
        if self.cached_thread.load(Ordering::SeqCst) != key.as_u64() {
            return None;
        }
        let info = thread::cached_info(self.id)?;
        if info.is_disposed() {
            return None;
        }
        let entered = info.enter();
        if self.cached_thread.load(Ordering::SeqCst) == key.as_u64()
            && self.state.load() == ContextState::Default
            && !info.has_pending_actions()
        {
            return Some(info);
        }
        // Lost against a closer or submitter; undo and take the slow path.
        if info.leave() == 0 && entered == 1 {
            self.actions.thread_deactivated(key);
            self.notify_waiters();
        }
        None
    }

    /// Whether the calling thread may enter in the current state
    fn check_enter_allowed(&self, core: &super::ContextCore, key: ThreadKey) -> PolyglotResult<()> {
        let state = core.machine.state();
        let closing_thread = core.machine.closing_thread == Some(key);
        if state.is_closed() || (core.disposing && !closing_thread) {
            return Err(PolyglotError::illegal_state("The Context is already closed."));
        }
        if closing_thread {
            return Ok(());
        }
        if state.is_invalid() {
            return Err(self.invalid_error(core));
        }
        if state.is_interrupting() {
            return Err(PolyglotError::Interrupted);
        }
        Ok(())
    }

    /// Fail if an ancestor was cancelled or exited
    ///
    /// Must be called without the monitor held: ancestors are locked
    /// before descendants.
    fn check_ancestors_valid(&self) -> PolyglotResult<()> {
        let mut cursor = self.parent();
        while let Some(parent) = cursor {
            if parent.state.load().is_invalid() {
                let parent_core = parent.core.lock();
                return Err(parent.invalid_error(&parent_core));
            }
            cursor = parent.parent();
        }
        Ok(())
    }
}

impl Context {
    /// Enter the context on the calling thread
    ///
    /// Enters nest: the thread stays active until it called `leave` as
    /// many times as `enter`. Pending thread-local actions are performed
    /// before returning.
    pub fn enter(&self) -> PolyglotResult<()> {
        self.enter_info().map(|_| ())
    }

    pub(crate) fn enter_info(&self) -> PolyglotResult<Arc<ThreadInfo>> {
        let key = ThreadKey::current();
        if let Some(info) = self.inner.try_fast_enter(key) {
            thread::push_context(self.inner.clone());
            return Ok(info);
        }
        self.enter_slow(key)
    }

    #[cold]
    fn enter_slow(&self, key: ThreadKey) -> PolyglotResult<Arc<ThreadInfo>> {
        let inner = &self.inner;
        let mut started = false;
        let mut multi_threaded = false;
        if inner.core.lock().machine.closing_thread != Some(key) {
            inner.check_ancestors_valid()?;
        }
        let info = {
            let mut core = inner.core.lock();
            inner.check_enter_allowed(&core, key)?;

            let info = match core.threads.get(key) {
                Some(record) => record.info.clone(),
                None => {
                    if core.machine.closing_thread.is_some_and(|closing| closing != key) {
                        return Err(PolyglotError::illegal_state(
                            "Can not create new threads in closing context.",
                        ));
                    }
                    let single = core.threads.is_single_threaded() && !core.threads.is_active();
                    self.check_thread_access(key, single)?;
                    let info = Arc::new(ThreadInfo::for_current_thread());
                    let mut record = ThreadRecord::new(info.clone(), inner.languages.len());
                    record.locals.resize(inner.engine.thread_local_count(), None);
                    core.threads.insert(record);
                    started = true;
                    info
                }
            };

            inner.revoke_fast_path();
            if core.threads.is_single_threaded() && core.threads.has_active_other(key) {
                let denied = if inner.options.allow_multi_threading {
                    self.check_all_thread_accesses(&core, key)
                } else {
                    Err(PolyglotError::illegal_state(format!(
                        concat!(
                            "Multi threaded access requested by thread {} ",
                            "but is not allowed for this context.",
                        ),
                        info.thread_name()
                    )))
                };
                if let Err(e) = denied {
                    if started {
                        core.threads.remove(key);
                    }
                    return Err(e);
                }
                core.threads.set_multi_threaded();
                multi_threaded = true;
                tracing::debug!(
                    context = self.id().as_u64(),
                    thread = key.as_u64(),
                    "context became multi-threaded"
                );
            }

            info.enter();
            if core.threads.is_single_threaded()
                && core.machine.state() == ContextState::Default
                && core.machine.closing_thread.is_none()
            {
                inner.cached_thread.store(key.as_u64(), Ordering::SeqCst);
            }
            thread::register_info(inner, info.clone());
            info
        };
        thread::push_context(inner.clone());
        tracing::trace!(
            context = self.id().as_u64(),
            thread = key.as_u64(),
            started,
            "slow path enter"
        );

        let result = (|| {
            if multi_threaded {
                self.initialize_multi_threading()?;
            }
            if started {
                if let Some(listener) = inner.engine.listener() {
                    listener.on_thread_started(self, key);
                }
                self.initialize_thread_languages(key)?;
            }
            self.poll_info(&info)
        })();
        match result {
            Ok(()) => Ok(info),
            Err(e) => {
                self.leave_info(&info, key);
                Err(e)
            }
        }
    }

    /// Leave the context on the calling thread
    ///
    /// Leaving a closed context only pops it from the thread's context stack.
    pub fn leave(&self) -> PolyglotResult<()> {
        let key = ThreadKey::current();
        let inner = &self.inner;
        if inner.cached_thread.load(Ordering::SeqCst) == key.as_u64() {
            if let Some(info) = thread::cached_info(inner.id) {
                if info.is_active() {
                    let remaining = info.leave();
                    thread::pop_context(inner.id);
                    let cached = inner.cached_thread.load(Ordering::SeqCst);
                    if remaining == 0 && cached != key.as_u64() {
                        self.after_deactivation(&info, key);
                    }
                    return Ok(());
                }
            }
        }
        self.leave_slow(key)
    }

    #[cold]
    fn leave_slow(&self, key: ThreadKey) -> PolyglotResult<()> {
        let info = {
            let core = self.inner.core.lock();
            core.threads.get(key).map(|record| record.info.clone())
        };
        match info {
            Some(info) if info.is_active() => {
                self.leave_info(&info, key);
                Ok(())
            }
            _ => {
                let popped = thread::pop_context(self.inner.id);
                if popped || self.state().is_closed() {
                    Ok(())
                } else {
                    Err(PolyglotError::illegal_state(
                        "The context is not entered on the current thread.",
                    ))
                }
            }
        }
    }

    fn leave_info(&self, info: &ThreadInfo, key: ThreadKey) {
        let remaining = info.leave();
        thread::pop_context(self.inner.id);
        if remaining == 0 {
            self.after_deactivation(info, key);
        }
        tracing::trace!(
            context = self.id().as_u64(),
            thread = key.as_u64(),
            remaining,
            "slow path leave"
        );
    }

    /// Bookkeeping once a thread's entered count dropped to zero
    fn after_deactivation(&self, info: &ThreadInfo, key: ThreadKey) {
        let inner = &self.inner;
        {
            let _core = inner.core.lock();
            let state = inner.state.load();
            if state.is_invalid() {
                info.set_cancelled(true);
                info.clear_interrupted();
            } else if state.is_interrupting() {
                info.clear_interrupted();
            }
            inner.actions.thread_deactivated(key);
        }
        inner.changed.notify_all();
    }

    /// Enter unless this context is already the innermost on this thread
    pub fn enter_if_needed(&self) -> PolyglotResult<EnterGuard<'_>> {
        let entered = self.is_current_on_thread();
        if !entered {
            self.enter()?;
        }
        Ok(EnterGuard {
            context: self,
            entered: !entered,
        })
    }

    /// Consume a guard from [`Context::enter_if_needed`]
    pub fn leave_if_needed(&self, mut guard: EnterGuard<'_>) -> PolyglotResult<()> {
        if guard.entered {
            guard.entered = false;
            return self.leave();
        }
        Ok(())
    }

    /// Enter and return a guard that leaves on drop
    pub fn enter_scope(&self) -> PolyglotResult<EnterGuard<'_>> {
        self.enter()?;
        Ok(EnterGuard {
            context: self,
            entered: true,
        })
    }

    fn is_current_on_thread(&self) -> bool {
        thread::current_context().is_some_and(|current| Arc::ptr_eq(&current, &self.inner))
            && thread::cached_info(self.inner.id).is_some_and(|info| info.is_active())
    }

    /// Innermost context entered on the calling thread
    pub fn current() -> Option<Context> {
        thread::current_context().map(Context::from_inner)
    }

    /// Whether the calling thread is entered in this context
    pub fn is_entered(&self) -> bool {
        thread::cached_info(self.inner.id)
            .is_some_and(|info| info.is_active() && !info.is_disposed())
    }

    /// Whether the calling thread is entered here or in a descendant
    pub(crate) fn is_entered_in_subtree(&self) -> bool {
        thread::entered_contexts().iter().any(|entered| {
            let mut cursor = Some(entered.clone());
            while let Some(context) = cursor {
                if Arc::ptr_eq(&context, &self.inner) {
                    return true;
                }
                cursor = context.parent();
            }
            false
        })
    }

    /// Embedder-managed enter, paired with [`Context::explicit_leave`]
    pub fn explicit_enter(&self) -> PolyglotResult<()> {
        let info = self.enter_info()?;
        let key = info.key();
        let mut core = self.inner.core.lock();
        if let Some(record) = core.threads.get_mut(key) {
            record.explicit_stack.push(info.entered_count());
        }
        Ok(())
    }

    /// Leave an explicit enter
    pub fn explicit_leave(&self) -> PolyglotResult<()> {
        let key = ThreadKey::current();
        let popped = {
            let mut core = self.inner.core.lock();
            core.threads
                .get_mut(key)
                .and_then(|record| record.explicit_stack.pop())
                .is_some()
        };
        if !popped {
            if self.is_closed() {
                thread::pop_context(self.inner.id);
                return Ok(());
            }
            return Err(PolyglotError::illegal_state(concat!(
                "The context is not entered explicitly. ",
                "A context can only be left if it was previously entered.",
            )));
        }
        self.leave()
    }

    /// Run `operation` with the calling thread temporarily not entered
    ///
    /// Used for blocking waits: other threads do not count the caller as
    /// active while `operation` runs, and `interrupter` is how cancel and
    /// interrupt wake it. The thread is entered again afterwards, even if
    /// `operation` panics, and pending actions are performed.
    pub fn leave_and_enter<R>(
        &self,
        interrupter: Option<Arc<dyn Interrupter>>,
        operation: impl FnOnce() -> R,
    ) -> PolyglotResult<R> {
        let key = ThreadKey::current();
        let inner = &self.inner;
        let (info, saved) = {
            let mut core = inner.core.lock();
            let Some(record) = core.threads.get_mut(key).filter(|r| r.info.is_active()) else {
                return Err(PolyglotError::illegal_state(
                    "The context is not entered on the current thread.",
                ));
            };
            record.interrupter = interrupter;
            let info = record.info.clone();
            inner.revoke_fast_path();
            let saved = info.swap_entered(0);
            inner.actions.thread_deactivated(key);
            inner.changed.notify_all();
            (info, saved)
        };

        struct Reenter<'a> {
            context: &'a Context,
            info: &'a ThreadInfo,
            saved: usize,
        }
        impl Drop for Reenter<'_> {
            fn drop(&mut self) {
                let inner = &self.context.inner;
                let mut core = inner.core.lock();
                if let Some(record) = core.threads.get_mut(self.info.key()) {
                    record.interrupter = None;
                }
                self.info.swap_entered(self.saved);
            }
        }

        let value = {
            let _reenter = Reenter {
                context: self,
                info: &info,
                saved,
            };
            operation()
        };
        info.clear_interrupted();
        self.check_invalid()?;
        self.poll_info(&info)?;
        Ok(value)
    }

    /// Perform pending thread-local actions of the calling thread
    pub fn poll(&self) -> PolyglotResult<()> {
        match thread::cached_info(self.inner.id) {
            Some(info) => self.poll_info(&info),
            None => Ok(()),
        }
    }

    #[inline]
    fn poll_info(&self, info: &ThreadInfo) -> PolyglotResult<()> {
        if !info.has_pending_actions() || !info.is_active() {
            return Ok(());
        }
        self.process_actions(info)
    }

    #[cold]
    fn process_actions(&self, info: &ThreadInfo) -> PolyglotResult<()> {
        self.inner.actions.process(info, self)
    }

    /// Sleep while polling for thread-local actions
    ///
    /// Returns early with the error of an action, e.g. when the context is
    /// cancelled or interrupted meanwhile.
    pub fn sleep_interruptibly(&self, duration: Duration) -> PolyglotResult<()> {
        let deadline = Instant::now() + duration;
        loop {
            self.poll()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::park_timeout((deadline - now).min(SLEEP_SLICE));
        }
    }

    /// Allow or defer side-effecting actions on the calling thread
    ///
    /// Returns the previous setting.
    pub fn set_allow_side_effects(&self, allowed: bool) -> PolyglotResult<bool> {
        let info = thread::cached_info(self.inner.id)
            .filter(|info| info.is_active())
            .ok_or_else(|| {
                PolyglotError::illegal_state("The context is not entered on the current thread.")
            })?;
        Ok(info.set_side_effects_allowed(allowed))
    }

    /// A registered OS thread terminated
    pub(crate) fn thread_terminated(&self, key: ThreadKey) {
        let inner = &self.inner;
        let record = {
            let mut core = inner.core.lock();
            if core.machine.state().is_closed() {
                return;
            }
            if core.machine.closing_thread.is_some() {
                // The closer disposes the record; it only must not wait for it.
                if let Some(record) = core.threads.get(key) {
                    record.info.swap_entered(0);
                    inner.actions.thread_deactivated(key);
                }
                drop(core);
                inner.changed.notify_all();
                return;
            }
            let record = core.threads.remove(key);
            if let Some(record) = &record {
                record.info.swap_entered(0);
                record.info.mark_disposed();
                inner.actions.thread_deactivated(key);
            }
            record
        };
        let Some(record) = record else {
            return;
        };
        inner.actions.discard_thread(&record.info);
        for e in self.dispose_thread_languages(&record.initialized_languages, key) {
            tracing::warn!(
                context = self.id().as_u64(),
                thread = key.as_u64(),
                error = %e,
                "dispose_thread failed for terminated thread"
            );
        }
        if let Some(listener) = inner.engine.listener() {
            listener.on_thread_finished(self, key);
        }
        inner.notify_waiters();
        tracing::trace!(
            context = self.id().as_u64(),
            thread = key.as_u64(),
            cancelled = record.info.is_cancelled(),
            "disposed terminated thread"
        );
    }
}
