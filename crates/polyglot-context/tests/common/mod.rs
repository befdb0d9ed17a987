//! Shared fixtures for the integration tests
//!
//! `RecordingLanguage` appends every lifecycle callback to a log shared by
//! all languages of an engine, so tests can assert on cross-language order.

#![allow(dead_code)]

use parking_lot::Mutex;
use polyglot_context::{
    Context, ContextOptions, Engine, ExitMode, Language, LanguageEnv, PolyglotError, PolyglotResult,
    ThreadKey,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Callback log shared by the languages of one engine
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: String) {
        self.0.lock().push(event);
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.0.lock().iter().filter(|e| *e == event).count()
    }

    pub fn position(&self, event: &str) -> Option<usize> {
        self.0.lock().iter().position(|e| e == event)
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

/// Language that records its callbacks and fails or denies on request
pub struct RecordingLanguage {
    id: String,
    log: EventLog,
    pub fail_finalize: AtomicBool,
    pub fail_initialize: AtomicBool,
    pub deny_multi_threading: AtomicBool,
    on_exit: Mutex<Option<ExitHook>>,
}

type ExitHook = Arc<dyn Fn(&Context, ExitMode) -> PolyglotResult<()> + Send + Sync>;

impl RecordingLanguage {
    pub fn new(id: &str, log: &EventLog) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            log: log.clone(),
            fail_finalize: AtomicBool::new(false),
            fail_initialize: AtomicBool::new(false),
            deny_multi_threading: AtomicBool::new(false),
            on_exit: Mutex::new(None),
        })
    }

    /// Run `hook` from every `exit_context` with the context being exited
    ///
    /// Hooks run outside the fixture's lock, so two threads may be inside
    /// the same hook at once.
    pub fn set_on_exit(
        &self,
        hook: impl Fn(&Context, ExitMode) -> PolyglotResult<()> + Send + Sync + 'static,
    ) {
        *self.on_exit.lock() = Some(Arc::new(hook));
    }

    fn record(&self, event: &str) {
        self.log.push(format!("{}:{}", self.id, event));
    }
}

impl Language for RecordingLanguage {
    fn id(&self) -> &str {
        &self.id
    }

    fn create_context(
        &self,
        _env: &LanguageEnv<'_>,
    ) -> PolyglotResult<polyglot_context::LanguageData> {
        self.record("create");
        Ok(Arc::new(self.id.clone()))
    }

    fn initialize_context(&self, _env: &LanguageEnv<'_>) -> PolyglotResult<()> {
        if self.fail_initialize.load(Ordering::SeqCst) {
            return Err(PolyglotError::guest(self.id.as_str(), "initialization failed"));
        }
        self.record("initialize");
        Ok(())
    }

    fn is_thread_access_allowed(&self, _thread: ThreadKey, single_threaded: bool) -> bool {
        single_threaded || !self.deny_multi_threading.load(Ordering::SeqCst)
    }

    fn initialize_multi_threading(&self, _env: &LanguageEnv<'_>) -> PolyglotResult<()> {
        self.record("multi_threading");
        Ok(())
    }

    fn initialize_thread(&self, _env: &LanguageEnv<'_>, _thread: ThreadKey) -> PolyglotResult<()> {
        self.record("initialize_thread");
        Ok(())
    }

    fn exit_context(&self, env: &LanguageEnv<'_>, mode: ExitMode, code: i32) -> PolyglotResult<()> {
        self.record(&format!("exit({:?},{})", mode, code));
        let hook = self.on_exit.lock().clone();
        match hook {
            Some(hook) => hook(env.context(), mode),
            None => Ok(()),
        }
    }

    fn finalize_context(&self, _env: &LanguageEnv<'_>) -> PolyglotResult<()> {
        self.record("finalize");
        if self.fail_finalize.load(Ordering::SeqCst) {
            return Err(PolyglotError::guest(self.id.as_str(), "finalization failed"));
        }
        Ok(())
    }

    fn dispose_thread(&self, _env: &LanguageEnv<'_>, _thread: ThreadKey) -> PolyglotResult<()> {
        self.record("dispose_thread");
        Ok(())
    }

    fn dispose_context(&self, _env: &LanguageEnv<'_>) -> PolyglotResult<()> {
        self.record("dispose");
        Ok(())
    }
}

/// Engine with one recording language per id
pub fn engine_with(ids: &[&str], log: &EventLog) -> (Engine, Vec<Arc<RecordingLanguage>>) {
    let languages: Vec<_> = ids.iter().map(|id| RecordingLanguage::new(id, log)).collect();
    let mut builder = Engine::builder();
    for language in &languages {
        builder = builder.language(language.clone());
    }
    let engine = builder.build().expect("distinct language ids");
    (engine, languages)
}

pub fn new_context(engine: &Engine) -> Context {
    engine
        .create_context(ContextOptions::default())
        .expect("context creation")
}

/// Poll until `condition` holds or `timeout` elapses
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}

/// Body of a guest thread: poll until a signal unwinds it, then leave
pub fn run_until_signal(context: &Context) -> PolyglotError {
    let error = loop {
        if let Err(e) = context.sleep_interruptibly(Duration::from_millis(2)) {
            break e;
        }
    };
    let _ = context.leave();
    error
}
