//! Engine and context options

use crate::context::Context;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Hook invoked with the context that was cancelled or closed
pub type ContextHook = Arc<dyn Fn(&Context) + Send + Sync>;

/// Hook invoked with the context that exited and its exit code
pub type ExitHook = Arc<dyn Fn(&Context, i32) + Send + Sync>;

/// Options shared by every context of an engine
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Engine name used in diagnostics
    pub name: String,

    /// How often a blocked cancel or exit re-sends interrupts to threads
    /// that have not left the context yet
    pub cancel_resubmit_interval: Duration,

    /// Name of the thread that closes a context cancelled from inside
    pub cleanup_thread_name: String,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            name: "engine".to_string(),
            cancel_resubmit_interval: Duration::from_millis(100),
            cleanup_thread_name: "polyglot-context-cleanup".to_string(),
        }
    }
}

impl EngineOptions {
    /// Create options with an engine name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the interrupt re-send interval
    pub fn with_cancel_resubmit_interval(mut self, interval: Duration) -> Self {
        self.cancel_resubmit_interval = interval;
        self
    }
}

/// Options for creating a context
#[derive(Clone)]
pub struct ContextOptions {
    /// Context name used in diagnostics
    pub name: Option<String>,

    /// Whether two threads may be active at the same time
    pub allow_multi_threading: bool,

    /// Languages initialized at construction besides the host language
    pub eager_languages: Vec<String>,

    /// Invoked once the context closed after a cancel
    pub on_cancelled: Option<ContextHook>,

    /// Invoked once the context closed after an exit
    pub on_exited: Option<ExitHook>,

    /// Invoked once the context closed
    pub on_closed: Option<ContextHook>,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            name: None,
            allow_multi_threading: true,
            eager_languages: Vec::new(),
            on_cancelled: None,
            on_exited: None,
            on_closed: None,
        }
    }
}

impl ContextOptions {
    /// Create options with a context name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    /// Deny a second concurrently active thread
    pub fn single_threaded() -> Self {
        Self {
            allow_multi_threading: false,
            ..Default::default()
        }
    }

    /// Initialize a language at construction
    pub fn with_eager_language(mut self, id: impl Into<String>) -> Self {
        self.eager_languages.push(id.into());
        self
    }

    /// Set the cancel hook
    pub fn on_cancelled(mut self, hook: impl Fn(&Context) + Send + Sync + 'static) -> Self {
        self.on_cancelled = Some(Arc::new(hook));
        self
    }

    /// Set the exit hook
    pub fn on_exited(mut self, hook: impl Fn(&Context, i32) + Send + Sync + 'static) -> Self {
        self.on_exited = Some(Arc::new(hook));
        self
    }

    /// Set the close hook
    pub fn on_closed(mut self, hook: impl Fn(&Context) + Send + Sync + 'static) -> Self {
        self.on_closed = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for ContextOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextOptions")
            .field("name", &self.name)
            .field("allow_multi_threading", &self.allow_multi_threading)
            .field("eager_languages", &self.eager_languages)
            .field("on_cancelled", &self.on_cancelled.is_some())
            .field("on_exited", &self.on_exited.is_some())
            .field("on_closed", &self.on_closed.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_defaults() {
        let options = EngineOptions::default();
        assert_eq!(options.cancel_resubmit_interval, Duration::from_millis(100));
        let named =
            EngineOptions::named("test").with_cancel_resubmit_interval(Duration::from_millis(5));
        assert_eq!(named.name, "test");
        assert_eq!(named.cancel_resubmit_interval, Duration::from_millis(5));
    }

    #[test]
    fn test_context_builders() {
        let options = ContextOptions::single_threaded()
            .with_eager_language("js")
            .on_closed(|_| {});
        assert!(!options.allow_multi_threading);
        assert_eq!(options.eager_languages, vec!["js".to_string()]);
        assert!(options.on_closed.is_some());
        assert!(format!("{:?}", options).contains("on_closed: true"));
    }
}
