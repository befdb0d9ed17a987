//! Lifecycle flags of one language inside one context

use super::{Language, LanguageData, LanguageEnv};
use crate::context::Context;
use crate::thread::ThreadKey;
use crate::PolyglotResult;
use once_cell::sync::OnceCell;
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Guard held while a language is being initialized
///
/// The cell is true while `initialize_context` runs, which turns a
/// recursive initialization request from the same thread into a no-op.
pub(crate) type InitGuard<'a> = ReentrantMutexGuard<'a, Cell<bool>>;

/// Per-(context, language) slot, allocated once at context construction
pub(crate) struct LanguageSlot {
    language: Arc<dyn Language>,
    data: OnceCell<LanguageData>,
    created: AtomicBool,
    initialized: AtomicBool,
    finalized: AtomicBool,
    disposed: AtomicBool,
    init_lock: ReentrantMutex<Cell<bool>>,
}

impl LanguageSlot {
    pub(crate) fn new(language: Arc<dyn Language>) -> Self {
        Self {
            language,
            data: OnceCell::new(),
            created: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            init_lock: ReentrantMutex::new(Cell::new(false)),
        }
    }

    pub(crate) fn language(&self) -> &dyn Language {
        self.language.as_ref()
    }

    pub(crate) fn id(&self) -> &str {
        self.language.id()
    }

    pub(crate) fn data(&self) -> Option<&LanguageData> {
        self.data.get()
    }

    pub(crate) fn is_created(&self) -> bool {
        self.created.load(Ordering::Acquire)
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Run `create_context` once
    pub(crate) fn ensure_created(&self, context: &Context) -> PolyglotResult<()> {
        if self.data.get().is_some() {
            return Ok(());
        }
        let data = self.language.create_context(&LanguageEnv::new(context, self))?;
        if self.data.set(data).is_ok() {
            self.created.store(true, Ordering::Release);
        }
        Ok(())
    }

    /// Take the initialization lock unless initialization is done or
    /// already running on this thread
    pub(crate) fn begin_initialize(&self) -> Option<InitGuard<'_>> {
        if self.is_initialized() {
            return None;
        }
        let guard = self.init_lock.lock();
        if self.is_initialized() || guard.get() {
            return None;
        }
        Some(guard)
    }

    pub(crate) fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::Release);
    }

    /// Run `finalize_context` once; returns whether it ran
    pub(crate) fn finalize(&self, context: &Context) -> PolyglotResult<bool> {
        if !self.is_initialized() || self.finalized.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        self.language.finalize_context(&LanguageEnv::new(context, self))?;
        Ok(true)
    }

    pub(crate) fn dispose_thread(
        &self,
        context: &Context,
        thread: ThreadKey,
    ) -> PolyglotResult<()> {
        if !self.is_initialized() || self.is_disposed() {
            return Ok(());
        }
        self.language
            .dispose_thread(&LanguageEnv::new(context, self), thread)
    }

    /// Run `dispose_context` once; returns whether it ran
    pub(crate) fn dispose(&self, context: &Context) -> PolyglotResult<bool> {
        if !self.is_created() || self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        if self.is_initialized() {
            self.language
                .dispose_context(&LanguageEnv::new(context, self))?;
        }
        Ok(true)
    }
}
