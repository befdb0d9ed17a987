//! Polyglot Context Core
//!
//! This crate provides the lifecycle and thread-safety core of a
//! multi-language embedding runtime:
//! - Context state machine (close, cancel, exit, interrupt)
//! - Thread registry with a single-threaded enter/leave fast path
//! - Cooperative thread-local actions executed at safepoint polls
//! - Inner (child) contexts and propagation of invalidation
//! - Ordered initialize/finalize/dispose of per-language contexts
//!
//! # Example
//!
//! ```rust,ignore
//! use polyglot_context::{ContextOptions, Engine};
//!
//! let engine = Engine::builder().language(Arc::new(MyLanguage)).build()?;
//! let context = engine.create_context(ContextOptions::default())?;
//!
//! context.enter()?;
//! context.initialize_language("my")?;
//! context.poll()?;
//! context.leave()?;
//!
//! context.close(false)?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod context;
pub mod engine;
pub mod language;
pub mod safepoint;
pub mod thread;

pub use config::{ContextHook, ContextOptions, EngineOptions, ExitHook};
pub use context::{
    Context, ContextId, ContextState, EnterGuard, Interrupter, LocalKey, LocalValue, ThreadLocalKey,
};
pub use engine::{ContextListener, Engine, EngineBuilder};
pub use language::{ExitMode, Language, LanguageData, LanguageEnv, HOST_LANGUAGE_ID};
pub use safepoint::{
    ActionAccess, ActionConfig, ActionFuture, CombinedFuture, SafepointStats, ThreadLocalAction,
};
pub use thread::ThreadKey;

/// Errors raised by context operations and delivered to guest code
#[derive(Debug, Clone, thiserror::Error)]
pub enum PolyglotError {
    /// The context was cancelled; thrown into guest code at a safepoint
    #[error(
        "Context execution was cancelled: {}",
        .message.as_deref().unwrap_or("no reason given")
    )]
    Cancelled {
        /// Message supplied by the canceller
        message: Option<String>,
        /// Whether a resource limit triggered the cancellation
        resource_limit: bool,
    },

    /// The context exited; thrown into guest code during a hard exit
    #[error("Context exited with code {code}")]
    Exited {
        /// Exit code requested by the guest
        code: i32,
        /// Optional exit message
        message: Option<String>,
    },

    /// Running guest code was interrupted; the context stays usable
    #[error("Execution got interrupted")]
    Interrupted,

    /// Caller protocol violation
    #[error("{0}")]
    IllegalState(String),

    /// Guest exception raised by a language implementation
    #[error("{language}: {message}")]
    Guest {
        /// Id of the language that raised it
        language: String,
        /// Guest error message
        message: String,
    },

    /// Internal failure, with earlier failures attached
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the failure
        message: String,
        /// Failures that happened before this one
        suppressed: Vec<PolyglotError>,
    },
}

impl PolyglotError {
    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        PolyglotError::Internal {
            message: message.into(),
            suppressed: Vec::new(),
        }
    }

    /// Create an illegal state error
    pub fn illegal_state(message: impl Into<String>) -> Self {
        PolyglotError::IllegalState(message.into())
    }

    /// Create a guest exception for a language
    pub fn guest(language: impl Into<String>, message: impl Into<String>) -> Self {
        PolyglotError::Guest {
            language: language.into(),
            message: message.into(),
        }
    }

    /// Cancellation signal
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PolyglotError::Cancelled { .. })
    }

    /// Exit signal
    pub fn is_exited(&self) -> bool {
        matches!(self, PolyglotError::Exited { .. })
    }

    /// Interrupt signal
    pub fn is_interrupted(&self) -> bool {
        matches!(self, PolyglotError::Interrupted)
    }

    /// Cancel, exit or interrupt signal rather than a failure
    pub fn is_control_flow(&self) -> bool {
        self.is_cancelled() || self.is_exited() || self.is_interrupted()
    }

    /// Internal error
    pub fn is_internal(&self) -> bool {
        matches!(self, PolyglotError::Internal { .. })
    }

    /// Failures attached to an internal error
    pub fn suppressed(&self) -> &[PolyglotError] {
        match self {
            PolyglotError::Internal { suppressed, .. } => suppressed,
            _ => &[],
        }
    }

    /// Attach an earlier failure
    ///
    /// Non-internal errors are promoted to internal errors carrying their
    /// own message so nothing gets dropped.
    pub fn with_suppressed(self, earlier: PolyglotError) -> Self {
        match self {
            PolyglotError::Internal {
                message,
                mut suppressed,
            } => {
                suppressed.push(earlier);
                PolyglotError::Internal {
                    message,
                    suppressed,
                }
            }
            other => PolyglotError::Internal {
                message: other.to_string(),
                suppressed: vec![earlier],
            },
        }
    }
}

/// Result of context operations
pub type PolyglotResult<T> = Result<T, PolyglotError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let cancelled = PolyglotError::Cancelled {
            message: Some("limit".to_string()),
            resource_limit: true,
        };
        assert_eq!(cancelled.to_string(), "Context execution was cancelled: limit");

        let exited = PolyglotError::Exited {
            code: 3,
            message: None,
        };
        assert_eq!(exited.to_string(), "Context exited with code 3");
        assert_eq!(PolyglotError::guest("js", "boom").to_string(), "js: boom");
    }

    #[test]
    fn test_control_flow_classification() {
        assert!(PolyglotError::Interrupted.is_control_flow());
        assert!(PolyglotError::Exited { code: 0, message: None }.is_control_flow());
        assert!(!PolyglotError::illegal_state("x").is_control_flow());
        assert!(!PolyglotError::internal("x").is_control_flow());
    }

    #[test]
    fn test_suppressed_chain() {
        let first = PolyglotError::guest("js", "finalize failed");
        let err = PolyglotError::internal("dispose failed").with_suppressed(first);
        assert!(err.is_internal());
        assert_eq!(err.suppressed().len(), 1);

        let promoted = PolyglotError::guest("py", "x").with_suppressed(PolyglotError::Interrupted);
        assert!(promoted.is_internal());
        assert_eq!(promoted.to_string(), "Internal error: py: x");
    }
}
