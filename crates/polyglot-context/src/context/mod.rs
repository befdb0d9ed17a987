//! Polyglot Execution Context
//!
//! A [`Context`] is an isolated execution environment hosting one or more
//! languages that may be shared across threads and nested in a parent
//! context. It owns:
//! - The lifecycle state machine ([`ContextState`])
//! - The registry of threads that have entered it
//! - One language context per registered language
//! - The thread-local action mailboxes used to signal running threads
//! - Context and context-thread locals
//!
//! All bookkeeping is guarded by one monitor (a mutex plus condvar); guest
//! code and language callbacks always run with the monitor released.

mod cancel;
mod close;
mod enter;
mod hierarchy;
mod languages;
mod locals;
mod state;

pub use enter::EnterGuard;
pub use locals::{LocalKey, ThreadLocalKey};
pub use state::ContextState;

use crate::config::ContextOptions;
use crate::engine::Engine;
use crate::language::LanguageSlot;
use crate::safepoint::{SafepointStats, ThreadLocalActions};
use crate::thread::{ThreadKey, ThreadRegistry};
use crate::{PolyglotError, PolyglotResult};
use crossbeam::atomic::AtomicCell;
use parking_lot::{Condvar, Mutex};
use state::StateMachine;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Value stored in a context or context-thread local
pub type LocalValue = Arc<dyn Any + Send + Sync>;

/// Unique identifier for a context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    /// Create a new unique context ID
    pub fn new() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        ContextId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Wakes a thread blocked inside [`Context::leave_and_enter`]
pub trait Interrupter: Send + Sync {
    /// Interrupt the blocked operation running on `thread`
    fn interrupt(&self, thread: ThreadKey);
}

/// Monitor-guarded state of a context
pub(crate) struct ContextCore {
    pub(crate) machine: StateMachine,
    pub(crate) threads: ThreadRegistry,
    pub(crate) children: Vec<Arc<ContextInner>>,
    /// Language ordinals in initialization order
    pub(crate) init_order: Vec<usize>,
    pub(crate) locals: Vec<Option<LocalValue>>,
    pub(crate) invalid_message: Option<String>,
    pub(crate) exit_code: Option<i32>,
    pub(crate) resource_limit_exceeded: bool,
    pub(crate) disposing: bool,
}

pub(crate) struct ContextInner {
    id: ContextId,
    engine: Engine,
    parent: Option<Weak<ContextInner>>,
    options: ContextOptions,
    /// One slot per engine language, never resized
    languages: Vec<LanguageSlot>,
    core: Mutex<ContextCore>,
    changed: Condvar,
    /// Lock-free copy of the state for fast-path checks
    state: AtomicCell<ContextState>,
    /// Key of the only thread allowed on the enter/leave fast path, 0 for none
    ///
    /// Anyone about to read entered counts of other threads clears it first
    /// (SeqCst); fast-path entrants increment first and re-read it.
    cached_thread: AtomicU64,
    actions: ThreadLocalActions,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        // No-op for inner contexts, they are never registered
        self.engine.unregister(self.id);
    }
}

impl ContextInner {
    pub(crate) fn id(&self) -> ContextId {
        self.id
    }

    pub(crate) fn on_thread_terminated(self: &Arc<Self>, key: ThreadKey) {
        Context::from_inner(self.clone()).thread_terminated(key);
    }

    /// Perform a checked transition and wake every waiter
    fn set_state(
        &self,
        core: &mut ContextCore,
        target: ContextState,
    ) -> PolyglotResult<ContextState> {
        let previous = core.machine.transition(target, ThreadKey::current())?;
        self.state.store(target);
        if target != ContextState::Default {
            self.revoke_fast_path();
        }
        self.changed.notify_all();
        tracing::debug!(
            context = self.id.as_u64(),
            from = %previous,
            to = %target,
            "context state transition"
        );
        Ok(previous)
    }

    fn revoke_fast_path(&self) {
        self.cached_thread.store(0, Ordering::SeqCst);
    }

    /// Wake waiters after a change made without the monitor held
    fn notify_waiters(&self) {
        drop(self.core.lock());
        self.changed.notify_all();
    }

    /// The error a thread observes when touching an invalid context
    fn invalid_error(&self, core: &ContextCore) -> PolyglotError {
        let state = core.machine.state();
        if state.is_exiting() || state == ContextState::ClosedExited {
            PolyglotError::Exited {
                code: core.exit_code.unwrap_or(0),
                message: core.invalid_message.clone(),
            }
        } else {
            PolyglotError::Cancelled {
                message: core.invalid_message.clone(),
                resource_limit: core.resource_limit_exceeded,
            }
        }
    }

    fn parent(&self) -> Option<Arc<ContextInner>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }
}

/// Handle to a polyglot context
///
/// Cheap to clone; all clones refer to the same context.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    pub(crate) fn from_inner(inner: Arc<ContextInner>) -> Self {
        Self { inner }
    }

    /// Create a context and initialize its host and eager languages
    pub(crate) fn create(
        engine: &Engine,
        parent: Option<&Context>,
        options: ContextOptions,
    ) -> PolyglotResult<Context> {
        let languages = engine
            .language_table()
            .iter()
            .map(|language| LanguageSlot::new(language.clone()))
            .collect();
        let context = Context {
            inner: Arc::new(ContextInner {
                id: ContextId::new(),
                engine: engine.clone(),
                parent: parent.map(|p| Arc::downgrade(&p.inner)),
                options,
                languages,
                core: Mutex::new(ContextCore {
                    machine: StateMachine::new(),
                    threads: ThreadRegistry::new(),
                    children: Vec::new(),
                    init_order: Vec::new(),
                    locals: Vec::new(),
                    invalid_message: None,
                    exit_code: None,
                    resource_limit_exceeded: false,
                    disposing: false,
                }),
                changed: Condvar::new(),
                state: AtomicCell::new(ContextState::Default),
                cached_thread: AtomicU64::new(0),
                actions: ThreadLocalActions::new(),
            }),
        };

        match parent {
            Some(parent) => parent.add_child(&context)?,
            None => engine.register(&context.inner)?,
        }
        if let Some(listener) = engine.listener() {
            listener.on_context_created(&context);
        }
        tracing::debug!(
            context = context.id().as_u64(),
            name = ?context.options().name,
            parent = ?parent.map(Context::id),
            "created context"
        );

        if let Err(e) = context.initialize_eager_languages() {
            if let Err(close_error) = context.close_impl(false, None) {
                tracing::warn!(
                    context = context.id().as_u64(),
                    error = %close_error,
                    "failed to close context after failed initialization"
                );
            }
            return Err(e);
        }
        Ok(context)
    }

    /// The context id
    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    /// The engine owning this context
    pub fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    /// Options the context was created with
    pub fn options(&self) -> &ContextOptions {
        &self.inner.options
    }

    /// Current lifecycle state
    pub fn state(&self) -> ContextState {
        self.inner.state.load()
    }

    /// Whether any thread is entered
    pub fn is_active(&self) -> bool {
        self.inner.revoke_fast_path();
        self.inner.core.lock().threads.is_active()
    }

    /// Whether the context reached a terminal state
    pub fn is_closed(&self) -> bool {
        self.state().is_closed()
    }

    /// Exit code recorded by `exit`
    pub fn exit_code(&self) -> Option<i32> {
        self.inner.core.lock().exit_code
    }

    /// Message recorded by a cancel or exit
    pub fn invalid_message(&self) -> Option<String> {
        self.inner.core.lock().invalid_message.clone()
    }

    /// Whether a resource limit triggered the cancellation
    pub fn is_resource_limit_exceeded(&self) -> bool {
        self.inner.core.lock().resource_limit_exceeded
    }

    /// Ids of initialized languages in initialization order
    pub fn initialized_languages(&self) -> Vec<String> {
        let order = self.inner.core.lock().init_order.clone();
        order
            .into_iter()
            .map(|ordinal| self.inner.languages[ordinal].id().to_string())
            .collect()
    }

    /// Statistics of thread-local actions performed in this context
    pub fn safepoint_stats(&self) -> &SafepointStats {
        self.inner.actions.stats()
    }

    /// Whether both handles refer to the same context
    pub fn ptr_eq(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Fail with the cancel or exit signal if the context became invalid
    pub(crate) fn check_invalid(&self) -> PolyglotResult<()> {
        let state = self.state();
        let invalid_close =
            matches!(state, ContextState::ClosedCancelled | ContextState::ClosedExited);
        if state.is_invalid() || invalid_close {
            let core = self.inner.core.lock();
            return Err(self.inner.invalid_error(&core));
        }
        Ok(())
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Context {}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (active, disposing) = {
            let core = self.inner.core.lock();
            (core.threads.is_active(), core.disposing)
        };
        write!(
            f,
            "Context[id={}, state={:?}, active={}, disposing={}, languages=[{}]]",
            self.id(),
            self.state(),
            active,
            disposing,
            self.initialized_languages().join(", ")
        )
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;

    #[test]
    fn test_context_id_uniqueness() {
        let id1 = ContextId::new();
        let id2 = ContextId::new();
        assert_ne!(id1, id2);
        assert!(id2.as_u64() > id1.as_u64());
    }

    #[test]
    fn test_new_context_is_default() {
        let engine = Engine::new();
        let context = engine.create_context(ContextOptions::default()).unwrap();
        assert_eq!(context.state(), ContextState::Default);
        assert!(!context.is_active());
        assert_eq!(context.initialized_languages(), vec!["host".to_string()]);
        assert_eq!(context.exit_code(), None);
    }

    #[test]
    fn test_display_reports_state_and_languages() {
        let engine = Engine::new();
        let context = engine.create_context(ContextOptions::default()).unwrap();
        let text = context.to_string();
        assert!(text.starts_with(&format!("Context[id={}, state=Default", context.id())));
        assert!(text.ends_with("active=false, disposing=false, languages=[host]]"));
    }

    #[test]
    fn test_handles_compare_by_identity() {
        let engine = Engine::new();
        let a = engine.create_context(ContextOptions::default()).unwrap();
        let b = engine.create_context(ContextOptions::default()).unwrap();
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }
}
