//! Cancel, exit and interrupt
//!
//! All three set the state of the whole subtree first, then queue a
//! signal action for every active thread and wake it. Cancel and exit are
//! finished by a forced close; interrupt only waits for the threads to
//! leave and then reverts the state.

use super::Context;
use crate::language::ExitMode;
use crate::safepoint::{self, ActionConfig, ActionFuture, ThreadLocalAction};
use crate::thread::ThreadKey;
use crate::{PolyglotError, PolyglotResult};
use std::sync::Arc;
use std::time::{Duration, Instant};

impl Context {
    /// Cancel the context and close it
    ///
    /// Every active thread observes [`PolyglotError::Cancelled`] at its
    /// next poll. Called from a thread entered in this context or one of
    /// its descendants the close is handed to a cleanup thread; otherwise
    /// it blocks until the context is closed.
    pub fn cancel(&self) -> PolyglotResult<()> {
        self.cancel_impl(false, None)
    }

    /// Cancel with a message, optionally reporting an exceeded resource limit
    pub fn cancel_with_message(
        &self,
        resource_limit: bool,
        message: impl Into<String>,
    ) -> PolyglotResult<()> {
        self.cancel_impl(resource_limit, Some(message.into()))
    }

    pub(crate) fn cancel_impl(
        &self,
        resource_limit: bool,
        message: Option<String>,
    ) -> PolyglotResult<()> {
        if self.is_closed() {
            return Ok(());
        }
        let futures = self.set_cancelling(resource_limit, message.as_deref());
        tracing::debug!(
            context = self.id().as_u64(),
            resource_limit,
            pending = futures.len(),
            "cancelling context"
        );

        if self.is_entered_in_subtree() {
            let context = self.clone();
            let name = self.inner.engine.options().cleanup_thread_name.clone();
            std::thread::Builder::new()
                .name(name)
                .spawn(move || {
                    if let Err(e) = context.close_impl(true, Some(&futures)) {
                        tracing::error!(
                            context = context.id().as_u64(),
                            error = %e,
                            "close after cancel failed"
                        );
                    }
                })
                .map_err(|e| {
                    PolyglotError::internal(format!("failed to spawn cleanup thread: {}", e))
                })?;
            return Ok(());
        }
        self.close_impl(true, Some(&futures)).map(|_| ())
    }

    /// Exit the context with `code`
    ///
    /// Languages are notified with [`ExitMode::Hard`] first, then every
    /// thread observes [`PolyglotError::Exited`] and the context is closed.
    /// A second exit while the notifications run escalates immediately.
    /// Returns the exit signal when the caller is entered, so that it
    /// unwinds its own guest code too.
    pub fn exit(&self, code: i32) -> PolyglotResult<()> {
        self.exit_impl(code, None)
    }

    /// Exit with a custom message instead of the default one
    pub fn exit_with_message(&self, code: i32, message: impl Into<String>) -> PolyglotResult<()> {
        self.exit_impl(code, Some(message.into()))
    }

    fn exit_impl(&self, code: i32, message: Option<String>) -> PolyglotResult<()> {
        let inner = &self.inner;
        let entered = self.is_entered_in_subtree();
        let escalate = {
            let mut core = inner.core.lock();
            let state = core.machine.state();
            if state.is_closed() {
                return Ok(());
            }
            if state.is_invalid() {
                return Err(inner.invalid_error(&core));
            }
            if state.is_pending_exit() {
                true
            } else {
                core.exit_code = Some(code);
                core.invalid_message = Some(
                    message.unwrap_or_else(|| format!("Exit was called with exit code {}.", code)),
                );
                inner.set_state(&mut core, state.pending_exit_variant())?;
                false
            }
        };

        let (code, message) = {
            let core = inner.core.lock();
            (core.exit_code.unwrap_or(code), core.invalid_message.clone())
        };
        if escalate {
            tracing::debug!(context = self.id().as_u64(), code, "exit requested again, escalating");
            self.set_exiting(code, message.as_deref())?;
            return if entered {
                Err(PolyglotError::Exited { code, message })
            } else {
                Ok(())
            };
        }

        match self.enter_if_needed() {
            Ok(guard) => {
                if let Err(e) = self.notify_exit(ExitMode::Hard, code) {
                    tracing::warn!(
                        context = self.id().as_u64(),
                        error = %e,
                        "exit notification failed"
                    );
                }
                drop(guard);
            }
            Err(e) => {
                tracing::warn!(
                    context = self.id().as_u64(),
                    error = %e,
                    "could not enter for exit notifications"
                );
            }
        }

        let futures = self.set_exiting(code, message.as_deref())?;
        self.close_impl(true, Some(&futures))?;
        if entered {
            Err(PolyglotError::Exited { code, message })
        } else {
            Ok(())
        }
    }

    /// Stop all guest code and wait for every thread to leave
    ///
    /// Running threads observe [`PolyglotError::Interrupted`] at their next
    /// poll and the context stays usable afterwards. Waits at most
    /// `timeout`, or forever if it is zero. Returns false if threads were
    /// still active at the deadline; the context then stays interrupting.
    pub fn interrupt(&self, timeout: Duration) -> PolyglotResult<bool> {
        if self.is_entered_in_subtree() {
            return Err(PolyglotError::illegal_state(
                "Cannot interrupt context from a thread where the context is active.",
            ));
        }
        if self.is_closed() {
            return Ok(true);
        }
        let futures = self.set_interrupting();
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        let inactive = self.wait_until_inactive(deadline);
        if inactive {
            futures.cancel();
            self.finish_interrupt();
        }
        tracing::debug!(context = self.id().as_u64(), inactive, "interrupt finished");
        Ok(inactive)
    }

    fn wait_until_inactive(&self, deadline: Option<Instant>) -> bool {
        let inner = &self.inner;
        let interval = inner.engine.options().cancel_resubmit_interval;
        let mut core = inner.core.lock();
        loop {
            inner.revoke_fast_path();
            if !self.subtree_is_active(&core) {
                return true;
            }
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    (deadline - now).min(interval)
                }
                None => interval,
            };
            inner.changed.wait_for(&mut core, slice);
        }
    }

    /// Schedule `action` on `threads`, or on every registered thread
    ///
    /// Threads that are not entered perform it on their next enter. The
    /// returned future is already done if the context is closed.
    pub fn submit_thread_local_action(
        &self,
        threads: Option<&[ThreadKey]>,
        action: Arc<dyn ThreadLocalAction>,
        config: ActionConfig,
    ) -> PolyglotResult<ActionFuture> {
        safepoint::validate(&config)?;
        let inner = &self.inner;
        let core = inner.core.lock();
        if core.machine.state().is_closed() {
            return Ok(ActionFuture::completed());
        }
        inner.revoke_fast_path();
        let targets: Vec<_> = core
            .threads
            .records()
            .filter(|record| threads.map_or(true, |keys| keys.contains(&record.info.key())))
            .map(|record| record.info.clone())
            .collect();
        tracing::trace!(
            context = self.id().as_u64(),
            targets = targets.len(),
            ?config,
            "submitting thread-local action"
        );
        Ok(inner.actions.submit(&targets, action, config))
    }
}

#[cfg(test)]
mod tests {
    use crate::safepoint::{self, ActionConfig};
    use crate::{ContextOptions, ContextState, Engine, PolyglotError};
    use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
    use std::sync::{mpsc, Arc};
    use std::time::Duration;

    #[test]
    fn test_cancel_idle_context() {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let engine = Engine::new();
        let context = engine
            .create_context(
                ContextOptions::default().on_cancelled(move |_| flag.store(true, Ordering::SeqCst)),
            )
            .unwrap();
        context.cancel_with_message(true, "too much memory").unwrap();
        assert_eq!(context.state(), ContextState::ClosedCancelled);
        assert!(cancelled.load(Ordering::SeqCst));
        assert!(context.is_resource_limit_exceeded());
        assert_eq!(context.invalid_message().as_deref(), Some("too much memory"));
        assert!(context.enter().is_err());
    }

    #[test]
    fn test_exit_records_code() {
        let exited = Arc::new(AtomicI32::new(-1));
        let observed = exited.clone();
        let engine = Engine::new();
        let context = engine
            .create_context(
                ContextOptions::default()
                    .on_exited(move |_, code| observed.store(code, Ordering::SeqCst)),
            )
            .unwrap();
        context.enter().unwrap();
        let err = context.exit(3).unwrap_err();
        assert!(matches!(err, PolyglotError::Exited { code: 3, .. }));
        assert_eq!(context.state(), ContextState::ClosedExited);
        assert_eq!(context.exit_code(), Some(3));
        assert_eq!(exited.load(Ordering::SeqCst), 3);
        context.leave().unwrap();
    }

    #[test]
    fn test_exit_from_outside_returns_ok() {
        let engine = Engine::new();
        let context = engine.create_context(ContextOptions::default()).unwrap();
        context.exit(1).unwrap();
        assert_eq!(context.state(), ContextState::ClosedExited);
        assert_eq!(
            context.invalid_message().as_deref(),
            Some("Exit was called with exit code 1.")
        );
    }

    #[test]
    fn test_interrupt_from_entered_thread_rejected() {
        let engine = Engine::new();
        let context = engine.create_context(ContextOptions::default()).unwrap();
        context.enter().unwrap();
        assert!(context.interrupt(Duration::ZERO).is_err());
        context.leave().unwrap();
    }

    #[test]
    fn test_interrupt_idle_context_reverts() {
        let engine = Engine::new();
        let context = engine.create_context(ContextOptions::default()).unwrap();
        assert!(context.interrupt(Duration::from_secs(1)).unwrap());
        assert_eq!(context.state(), ContextState::Default);
        context.enter().unwrap();
        context.leave().unwrap();
    }

    #[test]
    fn test_interrupt_stops_polling_thread() {
        let engine = Engine::new();
        let context = engine.create_context(ContextOptions::default()).unwrap();
        let (tx, rx) = mpsc::channel();
        let worker = {
            let context = context.clone();
            std::thread::spawn(move || {
                context.enter().unwrap();
                tx.send(()).unwrap();
                let result = loop {
                    if let Err(e) = context.sleep_interruptibly(Duration::from_millis(5)) {
                        break e;
                    }
                };
                context.leave().unwrap();
                result
            })
        };
        rx.recv().unwrap();
        assert!(context.interrupt(Duration::ZERO).unwrap());
        assert!(worker.join().unwrap().is_interrupted());
        assert_eq!(context.state(), ContextState::Default);
    }

    #[test]
    fn test_submit_to_closed_context_is_done() {
        let engine = Engine::new();
        let context = engine.create_context(ContextOptions::default()).unwrap();
        context.close(false).unwrap();
        let future = context
            .submit_thread_local_action(
                None,
                safepoint::action(|_| Ok(())),
                ActionConfig::default(),
            )
            .unwrap();
        assert!(future.is_done());
    }
}
