//! Engine: language table and registry of live contexts

use crate::config::{ContextOptions, EngineOptions};
use crate::context::{Context, ContextId, ContextInner, LocalKey, ThreadLocalKey};
use crate::language::{HostLanguage, Language};
use crate::thread::ThreadKey;
use crate::{PolyglotError, PolyglotResult};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Instrument-style notifications about contexts of an engine
///
/// Callbacks run on the thread causing the event, outside every context
/// monitor.
pub trait ContextListener: Send + Sync {
    /// A context was created
    fn on_context_created(&self, _context: &Context) {}

    /// A language finished initialization in a context
    fn on_language_initialized(&self, _context: &Context, _language: &str) {}

    /// A thread entered a context for the first time
    fn on_thread_started(&self, _context: &Context, _thread: ThreadKey) {}

    /// A thread was disposed, by termination or because the context closed
    fn on_thread_finished(&self, _context: &Context, _thread: ThreadKey) {}

    /// A context reached a closed state
    fn on_context_closed(&self, _context: &Context) {}
}

pub(crate) struct EngineInner {
    options: EngineOptions,
    languages: Vec<Arc<dyn Language>>,
    listener: Option<Arc<dyn ContextListener>>,
    /// Live root contexts; lookup only, never ownership
    contexts: DashMap<ContextId, Weak<ContextInner>>,
    closed: AtomicBool,
    context_locals: AtomicUsize,
    thread_locals: AtomicUsize,
}

/// Shared runtime services of a set of contexts
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Engine hosting only the host language
    pub fn new() -> Self {
        Self::from_parts(EngineOptions::default(), vec![Arc::new(HostLanguage)], None)
    }

    /// Start configuring an engine
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    fn from_parts(
        options: EngineOptions,
        languages: Vec<Arc<dyn Language>>,
        listener: Option<Arc<dyn ContextListener>>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                options,
                languages,
                listener,
                contexts: DashMap::new(),
                closed: AtomicBool::new(false),
                context_locals: AtomicUsize::new(0),
                thread_locals: AtomicUsize::new(0),
            }),
        }
    }

    /// Engine options
    pub fn options(&self) -> &EngineOptions {
        &self.inner.options
    }

    /// Ids of all languages, by ordinal
    pub fn language_ids(&self) -> Vec<String> {
        self.inner
            .languages
            .iter()
            .map(|language| language.id().to_string())
            .collect()
    }

    pub(crate) fn language_table(&self) -> &[Arc<dyn Language>] {
        &self.inner.languages
    }

    pub(crate) fn language_ordinal(&self, id: &str) -> Option<usize> {
        self.inner
            .languages
            .iter()
            .position(|language| language.id() == id)
    }

    pub(crate) fn listener(&self) -> Option<&dyn ContextListener> {
        self.inner.listener.as_deref()
    }

    /// Create a root context
    pub fn create_context(&self, options: ContextOptions) -> PolyglotResult<Context> {
        if self.is_closed() {
            return Err(PolyglotError::illegal_state("The engine is already closed."));
        }
        Context::create(self, None, options)
    }

    pub(crate) fn register(&self, context: &Arc<ContextInner>) -> PolyglotResult<()> {
        if self.is_closed() {
            return Err(PolyglotError::illegal_state("The engine is already closed."));
        }
        self.inner
            .contexts
            .insert(context.id(), Arc::downgrade(context));
        Ok(())
    }

    pub(crate) fn unregister(&self, id: ContextId) {
        self.inner.contexts.remove(&id);
    }

    /// Live root contexts
    pub fn contexts(&self) -> Vec<Context> {
        // Upgraded handles are released only after the shard locks, since
        // dropping the last one unregisters the context.
        let live: Vec<Arc<ContextInner>> = self
            .inner
            .contexts
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect();
        live.into_iter()
            .map(Context::from_inner)
            .filter(|context| !context.is_closed())
            .collect()
    }

    /// Whether `close` was called
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Close every live context and refuse new ones
    ///
    /// Stops at the first context that fails to close.
    pub fn close(&self, cancel_if_executing: bool) -> PolyglotResult<()> {
        self.inner.closed.store(true, Ordering::Release);
        for context in self.contexts() {
            context.close(cancel_if_executing)?;
        }
        self.inner.contexts.retain(|_, weak| weak.strong_count() > 0);
        tracing::debug!(engine = %self.inner.options.name, "closed engine");
        Ok(())
    }

    /// Allocate a context local slot
    pub fn new_context_local<T: Send + Sync + 'static>(&self) -> LocalKey<T> {
        LocalKey::new(self.inner.context_locals.fetch_add(1, Ordering::Relaxed))
    }

    /// Allocate a context-thread local slot
    pub fn new_context_thread_local<T: Send + Sync + 'static>(&self) -> ThreadLocalKey<T> {
        ThreadLocalKey::new(self.inner.thread_locals.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn context_local_count(&self) -> usize {
        self.inner.context_locals.load(Ordering::Relaxed)
    }

    pub(crate) fn thread_local_count(&self) -> usize {
        self.inner.thread_locals.load(Ordering::Relaxed)
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder registering languages and a listener
#[derive(Default)]
pub struct EngineBuilder {
    options: EngineOptions,
    languages: Vec<Arc<dyn Language>>,
    listener: Option<Arc<dyn ContextListener>>,
}

impl EngineBuilder {
    /// Set the engine options
    pub fn options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    /// Register a language; ordinals follow registration order after the host
    pub fn language(mut self, language: Arc<dyn Language>) -> Self {
        self.languages.push(language);
        self
    }

    /// Install a listener
    pub fn listener(mut self, listener: Arc<dyn ContextListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Build the engine, rejecting duplicate language ids
    pub fn build(self) -> PolyglotResult<Engine> {
        let mut languages: Vec<Arc<dyn Language>> = Vec::with_capacity(self.languages.len() + 1);
        languages.push(Arc::new(HostLanguage));
        for language in self.languages {
            if languages.iter().any(|known| known.id() == language.id()) {
                return Err(PolyglotError::illegal_state(format!(
                    "Duplicate language id {}.",
                    language.id()
                )));
            }
            languages.push(language);
        }
        Ok(Engine::from_parts(self.options, languages, self.listener))
    }
}
