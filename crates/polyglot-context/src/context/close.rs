//! Closing a context
//!
//! A close runs in these phases, all on the thread holding the exclusive
//! closing role:
//!
//! 1. Acquire the role (waiting for a concurrent closer to finish)
//! 2. Forced close only: wait for all other threads to leave
//! 3. Enter the closing state and close the children
//! 4. Soft close only: run the natural exit notifications
//! 5. Finalize every language until no new finalization work appears
//! 6. Dispose threads and languages in reverse initialization order
//! 7. Enter the closed state, clear locals and threads, fire hooks
//!
//! A soft close that fails in phases 3 to 5 rolls back to the state it
//! started from. A forced close never rolls back: failures are collected
//! and reported after the context reached its closed state.

use super::{Context, ContextCore, ContextState};
use crate::language::ExitMode;
use crate::safepoint::CombinedFuture;
use crate::thread::{self, ThreadKey};
use crate::{PolyglotError, PolyglotResult};
use parking_lot::MutexGuard;
use std::time::Instant;

/// Failures collected while closing
struct CloseErrors {
    forced: bool,
    failures: Vec<PolyglotError>,
}

impl CloseErrors {
    /// Returns the error back if the close must roll back
    fn absorb(&mut self, context: &Context, error: PolyglotError) -> PolyglotResult<()> {
        if !self.forced && context.state().is_invalid() {
            self.forced = true;
        }
        if !self.forced {
            return Err(error);
        }
        if error.is_control_flow() {
            tracing::warn!(
                context = context.id().as_u64(),
                error = %error,
                "ignored signal raised during forced close"
            );
        } else {
            tracing::error!(
                context = context.id().as_u64(),
                error = %error,
                "error during forced close"
            );
            self.failures.push(error);
        }
        Ok(())
    }

    fn into_result(self) -> PolyglotResult<()> {
        if self.failures.is_empty() {
            return Ok(());
        }
        let error = self.failures.into_iter().fold(
            PolyglotError::internal("Closing the context failed."),
            PolyglotError::with_suppressed,
        );
        Err(error)
    }
}

impl Context {
    /// Close the context
    ///
    /// Fails with an illegal state error if another thread is still
    /// executing, unless `cancel_if_executing` is set, in which case the
    /// context is cancelled first. Closing a closed context does nothing.
    pub fn close(&self, cancel_if_executing: bool) -> PolyglotResult<()> {
        if cancel_if_executing {
            return self.cancel_impl(false, None);
        }
        if self.close_impl(false, None)? {
            Ok(())
        } else {
            Err(PolyglotError::illegal_state(concat!(
                "The context is currently executing on another thread. ",
                "Set cancelIfExecuting to true to stop the execution on this thread.",
            )))
        }
    }

    /// Close, returning false if a soft close found other active threads
    ///
    /// `pending` are the futures of the cancel or exit actions that drive
    /// a forced close; while they are outstanding the closer waits on them
    /// instead of the monitor.
    pub(crate) fn close_impl(
        &self,
        force: bool,
        pending: Option<&CombinedFuture>,
    ) -> PolyglotResult<bool> {
        let key = ThreadKey::current();
        let inner = &self.inner;
        {
            let mut core = inner.core.lock();
            loop {
                let state = core.machine.state();
                if state.is_closed() {
                    return Ok(true);
                }
                match core.machine.closing_thread {
                    Some(closing) if closing == key => return Ok(true),
                    Some(_) => {
                        inner.changed.wait(&mut core);
                        continue;
                    }
                    None => {}
                }
                if core
                    .threads
                    .get(key)
                    .is_some_and(|record| !record.explicit_stack.is_empty())
                {
                    return Err(PolyglotError::illegal_state(concat!(
                        "The context is explicitly entered on the current thread. ",
                        "Call leave() before closing the context to resolve this.",
                    )));
                }
                inner.revoke_fast_path();
                if !force && !state.is_invalid() {
                    if state.is_pending_exit() {
                        return Err(PolyglotError::illegal_state(concat!(
                            "The context is exiting. It is closed by the exiting thread ",
                            "once the exit notifications finished.",
                        )));
                    }
                    if self.subtree_has_active_other(&core, key) {
                        return Ok(false);
                    }
                }
                core.machine.closing_thread = Some(key);
                inner.changed.notify_all();
                break;
            }
        }
        tracing::debug!(context = self.id().as_u64(), force, "closing context");

        let mut errors = CloseErrors {
            forced: force || self.state().is_invalid(),
            failures: Vec::new(),
        };
        if errors.forced {
            self.wait_for_other_threads(key, pending);
        }
        if let Err(e) = self.enter_closing_state() {
            self.release_closing_role();
            return Err(e);
        }

        let guard = match self.enter_if_needed() {
            Ok(guard) => Some(guard),
            Err(e) => {
                if let Err(e) = errors.absorb(self, e) {
                    self.rollback_close();
                    return Err(e);
                }
                None
            }
        };

        let finalized = (|| {
            let children = inner.core.lock().children.clone();
            for child in children {
                let child = Context::from_inner(child);
                match child.close_impl(errors.forced, None) {
                    Ok(true) => {}
                    Ok(false) => errors.absorb(
                        self,
                        PolyglotError::illegal_state(
                            "An inner context is currently executing on another thread.",
                        ),
                    )?,
                    Err(e) => errors.absorb(self, e)?,
                }
            }
            if !errors.forced {
                if let Err(e) = self.notify_exit(ExitMode::Natural, 0) {
                    errors.absorb(self, e)?;
                }
            }
            self.enter_finalizing_state()?;
            self.finalize_languages(&mut |e| errors.absorb(self, e))
        })();
        if let Err(e) = finalized {
            drop(guard);
            self.rollback_close();
            tracing::debug!(context = self.id().as_u64(), error = %e, "soft close rolled back");
            return Err(e);
        }

        // Disposal commits the close.
        errors.forced = true;
        self.dispose_all(&mut errors);
        drop(guard);
        self.finish_close(key, &mut errors);
        errors.into_result().map(|()| true)
    }

    /// Wait until every other thread left, re-sending interrupts
    fn wait_for_other_threads(&self, key: ThreadKey, pending: Option<&CombinedFuture>) {
        let inner = &self.inner;
        let interval = inner.engine.options().cancel_resubmit_interval;
        let mut core = inner.core.lock();
        loop {
            inner.revoke_fast_path();
            if !core.threads.has_active_other(key) {
                return;
            }
            for record in core.threads.records() {
                let other = record.info.key() != key;
                if other && (record.info.is_active() || record.interrupter.is_some()) {
                    record.interrupt();
                }
            }
            tracing::trace!(
                context = self.id().as_u64(),
                active = ?core.threads.active_keys(),
                "waiting for threads to leave"
            );
            match pending.filter(|futures| !futures.is_done()) {
                Some(futures) => {
                    let deadline = Instant::now() + interval;
                    MutexGuard::unlocked(&mut core, || {
                        futures.wait_until(Some(deadline));
                    });
                }
                None => {
                    inner.changed.wait_for(&mut core, interval);
                }
            }
        }
    }

    fn enter_closing_state(&self) -> PolyglotResult<()> {
        let inner = &self.inner;
        let mut core = inner.core.lock();
        while core.machine.state().is_pending_exit() {
            inner.changed.wait(&mut core);
        }
        let state = core.machine.state();
        if state.is_closing() && state.is_invalid() {
            // Left behind by a close that failed to roll back.
            return Ok(());
        }
        let target = state.closing_variant().ok_or_else(|| {
            PolyglotError::internal(format!("cannot close a context in state {}", state))
        })?;
        inner.set_state(&mut core, target)?;
        Ok(())
    }

    fn enter_finalizing_state(&self) -> PolyglotResult<()> {
        let inner = &self.inner;
        let mut core = inner.core.lock();
        let state = core.machine.state();
        let target = state.finalizing_variant();
        if target != state {
            inner.set_state(&mut core, target)?;
        }
        Ok(())
    }

    fn release_closing_role(&self) {
        let mut core = self.inner.core.lock();
        core.machine.closing_thread = None;
        self.inner.changed.notify_all();
    }

    /// Revert a failed soft close to the state it started from
    fn rollback_close(&self) {
        let inner = &self.inner;
        let mut core = inner.core.lock();
        let state = core.machine.state();
        if let Some(target) = state.rollback_variant() {
            if let Err(e) = inner.set_state(&mut core, target) {
                tracing::error!(
                    context = self.id().as_u64(),
                    error = %e,
                    "failed to roll back close"
                );
            }
        }
        core.machine.closing_thread = None;
        inner.changed.notify_all();
    }

    fn dispose_all(&self, errors: &mut CloseErrors) {
        let threads: Vec<(ThreadKey, Vec<bool>)> = {
            let mut core = self.inner.core.lock();
            core.disposing = true;
            core.threads
                .records()
                .map(|record| (record.info.key(), record.initialized_languages.clone()))
                .collect()
        };
        for (thread, initialized) in threads {
            for e in self.dispose_thread_languages(&initialized, thread) {
                errors.failures.push(e);
            }
        }
        if let Err(e) = self.dispose_languages(&mut |e| errors.absorb(self, e)) {
            errors.failures.push(e);
        }
    }

    fn finish_close(&self, key: ThreadKey, errors: &mut CloseErrors) {
        let inner = &self.inner;
        let (closed, records, exit_code) = {
            let mut core: MutexGuard<'_, ContextCore> = inner.core.lock();
            while core.machine.state().is_pending_exit() {
                inner.changed.wait(&mut core);
            }
            let state = core.machine.state();
            let closed = match state.closed_variant() {
                Some(target) => match inner.set_state(&mut core, target) {
                    Ok(_) => target,
                    Err(e) => {
                        errors.failures.push(e);
                        state
                    }
                },
                None => {
                    errors.failures.push(PolyglotError::internal(format!(
                        "no closed state for {}",
                        state
                    )));
                    state
                }
            };
            core.locals.clear();
            let records = core.threads.drain();
            for record in &records {
                record.info.mark_disposed();
            }
            core.machine.closing_thread = None;
            core.disposing = false;
            inner.revoke_fast_path();
            inner.changed.notify_all();
            (closed, records, core.exit_code)
        };

        for record in &records {
            inner.actions.discard_thread(&record.info);
        }
        thread::forget_info(inner.id);

        let options = &inner.options;
        match closed {
            ContextState::ClosedCancelled => {
                if let Some(hook) = &options.on_cancelled {
                    hook(self);
                }
            }
            ContextState::ClosedExited => {
                if let Some(hook) = &options.on_exited {
                    hook(self, exit_code.unwrap_or(0));
                }
            }
            _ => {}
        }
        if let Some(hook) = &options.on_closed {
            hook(self);
        }
        if let Some(listener) = inner.engine.listener() {
            for record in &records {
                listener.on_thread_finished(self, record.info.key());
            }
            listener.on_context_closed(self);
        }

        match inner.parent() {
            Some(parent) => Context::from_inner(parent).remove_child(inner.id),
            None => inner.engine.unregister(inner.id),
        }
        tracing::debug!(
            context = self.id().as_u64(),
            state = %closed,
            thread = key.as_u64(),
            "closed context"
        );
    }
}
