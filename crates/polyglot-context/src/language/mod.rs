//! Language Implementation Interface
//!
//! A context hosts one language context per registered [`Language`]. The
//! context drives every language through a strict lifecycle:
//!
//! ```text
//! create_context -> initialize_context -> initialize_thread*
//!     -> exit_context? -> finalize_context -> dispose_thread* -> dispose_context
//! ```
//!
//! Every callback runs outside the context monitor on the thread that
//! triggered it, and may raise errors. Cancel and exit signals raised while
//! the context is already being invalidated are logged and swallowed;
//! everything else propagates.

mod slot;

pub(crate) use slot::LanguageSlot;

use crate::context::Context;
use crate::thread::ThreadKey;
use crate::PolyglotResult;
use std::any::Any;
use std::sync::Arc;

/// Id of the built-in host language, always at ordinal 0
pub const HOST_LANGUAGE_ID: &str = "host";

/// Opaque per-context data of a language
pub type LanguageData = Arc<dyn Any + Send + Sync>;

/// How a context is exiting when `exit_context` is called
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitMode {
    /// The context is closed normally; guest code may still run
    Natural,
    /// The guest requested an exit; guest code may still run until the
    /// notifications are done
    Hard,
}

/// Callbacks a language implementation provides
pub trait Language: Send + Sync {
    /// Unique language id
    fn id(&self) -> &str;

    /// Create the language's per-context data
    fn create_context(&self, _env: &LanguageEnv<'_>) -> PolyglotResult<LanguageData> {
        Ok(Arc::new(()))
    }

    /// Initialize the created context; guest code may run
    fn initialize_context(&self, _env: &LanguageEnv<'_>) -> PolyglotResult<()> {
        Ok(())
    }

    /// Whether `thread` may access the context in the given threading mode
    fn is_thread_access_allowed(&self, _thread: ThreadKey, _single_threaded: bool) -> bool {
        true
    }

    /// The context became multi-threaded
    fn initialize_multi_threading(&self, _env: &LanguageEnv<'_>) -> PolyglotResult<()> {
        Ok(())
    }

    /// A thread started using the context
    fn initialize_thread(&self, _env: &LanguageEnv<'_>, _thread: ThreadKey) -> PolyglotResult<()> {
        Ok(())
    }

    /// Exit notification, run before finalization
    fn exit_context(
        &self,
        _env: &LanguageEnv<'_>,
        _mode: ExitMode,
        _code: i32,
    ) -> PolyglotResult<()> {
        Ok(())
    }

    /// Execution is ending; the context is still queryable
    fn finalize_context(&self, _env: &LanguageEnv<'_>) -> PolyglotResult<()> {
        Ok(())
    }

    /// A thread is done with the context
    fn dispose_thread(&self, _env: &LanguageEnv<'_>, _thread: ThreadKey) -> PolyglotResult<()> {
        Ok(())
    }

    /// Final teardown
    fn dispose_context(&self, _env: &LanguageEnv<'_>) -> PolyglotResult<()> {
        Ok(())
    }
}

/// The language context handed to [`Language`] callbacks
pub struct LanguageEnv<'a> {
    context: &'a Context,
    slot: &'a LanguageSlot,
}

impl<'a> LanguageEnv<'a> {
    pub(crate) fn new(context: &'a Context, slot: &'a LanguageSlot) -> Self {
        Self { context, slot }
    }

    /// Context owning this language context
    pub fn context(&self) -> &'a Context {
        self.context
    }

    /// Id of the language
    pub fn language_id(&self) -> &'a str {
        self.slot.id()
    }

    /// Data returned by `create_context`, once created
    pub fn data(&self) -> Option<&'a LanguageData> {
        self.slot.data()
    }

    /// Data downcast to the language's own type
    pub fn data_as<T: Any>(&self) -> Option<&'a T> {
        self.slot.data().and_then(|data| data.downcast_ref::<T>())
    }
}

/// The built-in host language
#[derive(Debug, Default)]
pub(crate) struct HostLanguage;

impl Language for HostLanguage {
    fn id(&self) -> &str {
        HOST_LANGUAGE_ID
    }
}
