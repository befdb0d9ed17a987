//! Inner contexts and propagation of invalidation
//!
//! Parents own their children; children only refer back weakly. Every
//! propagation sets the state of a context first and then recurses into a
//! snapshot of its children, so a child always observes its parent's
//! invalidation. Monitors are only ever taken parent before child.

use super::{Context, ContextCore, ContextId};
use crate::config::ContextOptions;
use crate::safepoint::{ActionAccess, ActionConfig, ActionFuture, CombinedFuture, ThreadLocalAction};
use crate::thread::ThreadKey;
use crate::{PolyglotError, PolyglotResult};
use std::sync::Arc;

/// Raises the cancel or exit signal of an invalid context
pub(crate) fn invalid_signal(access: &ActionAccess<'_>) -> PolyglotResult<()> {
    access.context().check_invalid()
}

/// Raises the interrupt signal while the context is interrupting
pub(crate) fn interrupt_signal(access: &ActionAccess<'_>) -> PolyglotResult<()> {
    if access.context().state().is_interrupting() {
        Err(PolyglotError::Interrupted)
    } else {
        Ok(())
    }
}

impl Context {
    /// Create an inner context
    ///
    /// The inner context shares the engine, is closed before this context
    /// completes its own close, and is invalidated with it.
    pub fn create_inner(&self, options: ContextOptions) -> PolyglotResult<Context> {
        Context::create(&self.inner.engine, Some(self), options)
    }

    /// The parent of an inner context
    pub fn parent(&self) -> Option<Context> {
        self.inner.parent().map(Context::from_inner)
    }

    /// Live inner contexts
    pub fn children(&self) -> Vec<Context> {
        self.inner
            .core
            .lock()
            .children
            .iter()
            .cloned()
            .map(Context::from_inner)
            .collect()
    }

    pub(crate) fn add_child(&self, child: &Context) -> PolyglotResult<()> {
        let mut core = self.inner.core.lock();
        if core.machine.closing_thread.is_some() || core.machine.state().is_invalid_or_closed() {
            return Err(PolyglotError::illegal_state(
                "Adding child context into a closing context.",
            ));
        }
        core.children.push(child.inner.clone());
        Ok(())
    }

    pub(crate) fn remove_child(&self, id: ContextId) {
        let mut core = self.inner.core.lock();
        core.children.retain(|child| child.id() != id);
        self.inner.changed.notify_all();
    }

    /// Whether a thread other than `key` is active here or in a descendant
    ///
    /// `core` is this context's locked monitor.
    pub(crate) fn subtree_has_active_other(&self, core: &ContextCore, key: ThreadKey) -> bool {
        if core.threads.has_active_other(key) {
            return true;
        }
        core.children.iter().any(|child| {
            child.revoke_fast_path();
            let child_core = child.core.lock();
            Context::from_inner(child.clone()).subtree_has_active_other(&child_core, key)
        })
    }

    /// Whether a thread is running guest code here or in a descendant
    ///
    /// The thread holding a closing role is not counted: it leaves once
    /// the close finished and is never interrupted.
    pub(crate) fn subtree_is_active(&self, core: &ContextCore) -> bool {
        let closing = core.machine.closing_thread;
        if core
            .threads
            .records()
            .any(|record| record.info.is_active() && Some(record.info.key()) != closing)
        {
            return true;
        }
        core.children.iter().any(|child| {
            child.revoke_fast_path();
            let child_core = child.core.lock();
            Context::from_inner(child.clone()).subtree_is_active(&child_core)
        })
    }

    /// Queue a lifecycle signal for the active threads and wake them
    ///
    /// Threads in `spared` get neither the signal nor an interrupt. The
    /// calling thread is never interrupted.
    pub(crate) fn submit_signal(
        &self,
        core: &ContextCore,
        action: Arc<dyn ThreadLocalAction>,
        spared: &[ThreadKey],
    ) -> ActionFuture {
        let current = ThreadKey::current();
        let targets: Vec<_> = core
            .threads
            .records()
            .filter(|record| record.info.is_active() && !spared.contains(&record.info.key()))
            .map(|record| record.info.clone())
            .collect();
        let future = self
            .inner
            .actions
            .submit(&targets, action, ActionConfig::internal());
        for record in core.threads.records() {
            let key = record.info.key();
            if key == current || spared.contains(&key) {
                continue;
            }
            if record.info.is_active() || record.interrupter.is_some() {
                record.interrupt();
            }
        }
        future
    }

    /// Move this subtree into a cancelling state
    pub(crate) fn set_cancelling(
        &self,
        resource_limit: bool,
        message: Option<&str>,
    ) -> CombinedFuture {
        let inner = &self.inner;
        let mut futures = CombinedFuture::new();
        let children = {
            let mut core = inner.core.lock();
            let state = core.machine.state();
            if state.is_closed() || state.is_cancelling() {
                return futures;
            }
            if let Some(message) = message {
                core.invalid_message = Some(message.to_string());
            }
            core.resource_limit_exceeded |= resource_limit;
            if let Err(e) = inner.set_state(&mut core, state.cancelling_variant()) {
                tracing::error!(
                    context = self.id().as_u64(),
                    error = %e,
                    "failed to cancel context"
                );
                return futures;
            }
            futures.push(self.submit_signal(&core, Arc::new(invalid_signal), &[]));
            core.children.clone()
        };
        for child in children {
            futures.extend(Context::from_inner(child).set_cancelling(resource_limit, message));
        }
        futures
    }

    /// Move this context into a hard exit and force its children after it
    pub(crate) fn set_exiting(
        &self,
        code: i32,
        message: Option<&str>,
    ) -> PolyglotResult<CombinedFuture> {
        let inner = &self.inner;
        let mut futures = CombinedFuture::new();
        let children = {
            let mut core = inner.core.lock();
            let state = core.machine.state();
            if state.is_closed() {
                return Ok(futures);
            }
            if state.is_cancelling() {
                return Err(inner.invalid_error(&core));
            }
            if !state.is_exiting() {
                inner.set_state(&mut core, state.exiting_variant())?;
            }
            let spared = [ThreadKey::current()];
            futures.push(self.submit_signal(&core, Arc::new(invalid_signal), &spared));
            core.children.clone()
        };
        for child in children {
            futures.extend(Context::from_inner(child).set_exiting_from_parent(code, message));
        }
        Ok(futures)
    }

    /// The parent reached a hard exit; skip the pending exit notifications
    ///
    /// A child that already exited or was cancelled on its own is left alone.
    fn set_exiting_from_parent(&self, code: i32, message: Option<&str>) -> CombinedFuture {
        let inner = &self.inner;
        let mut futures = CombinedFuture::new();
        let children = {
            let mut core = inner.core.lock();
            let state = core.machine.state();
            if state.is_invalid_or_closed() {
                return futures;
            }
            core.machine.skip_pending_exit = true;
            if core.exit_code.is_none() {
                core.exit_code = Some(code);
                core.invalid_message = message.map(str::to_string);
            }
            if let Err(e) = inner.set_state(&mut core, state.exiting_variant()) {
                tracing::error!(
                    context = self.id().as_u64(),
                    error = %e,
                    "failed to exit inner context"
                );
                return futures;
            }
            let spared = [ThreadKey::current()];
            futures.push(self.submit_signal(&core, Arc::new(invalid_signal), &spared));
            core.children.clone()
        };
        for child in children {
            futures.extend(Context::from_inner(child).set_exiting_from_parent(code, message));
        }
        futures
    }

    /// Move this subtree into an interrupting state
    pub(crate) fn set_interrupting(&self) -> CombinedFuture {
        let inner = &self.inner;
        let mut futures = CombinedFuture::new();
        let children = {
            let mut core = inner.core.lock();
            let state = core.machine.state();
            match state.interrupting_variant() {
                Some(target) => {
                    if let Err(e) = inner.set_state(&mut core, target) {
                        tracing::error!(
                            context = self.id().as_u64(),
                            error = %e,
                            "failed to interrupt context"
                        );
                        return futures;
                    }
                }
                None if state.is_interrupting() => {}
                None => return futures,
            }
            let spared: Vec<ThreadKey> = std::iter::once(ThreadKey::current())
                .chain(core.machine.closing_thread)
                .collect();
            futures.push(self.submit_signal(&core, Arc::new(interrupt_signal), &spared));
            core.children.clone()
        };
        for child in children {
            futures.extend(Context::from_inner(child).set_interrupting());
        }
        futures
    }

    /// Revert an interrupt once the subtree became inactive
    pub(crate) fn finish_interrupt(&self) {
        let inner = &self.inner;
        let children = {
            let mut core = inner.core.lock();
            if let Some(target) = core.machine.state().interrupt_done_variant() {
                if let Err(e) = inner.set_state(&mut core, target) {
                    tracing::error!(
                        context = self.id().as_u64(),
                        error = %e,
                        "failed to finish interrupt"
                    );
                }
            }
            for record in core.threads.records() {
                record.info.clear_interrupted();
            }
            core.children.clone()
        };
        for child in children {
            Context::from_inner(child).finish_interrupt();
        }
    }
}
