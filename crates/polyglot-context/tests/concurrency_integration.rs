//! Concurrency Integration Tests
//!
//! Multi-threaded entering, the single to multi-threaded transition, the
//! language thread access policy and thread termination.
//!
//! # Running Tests
//! ```bash
//! cargo test --test concurrency_integration
//! ```

mod common;

use common::{engine_with, new_context, wait_for, EventLog};
use parking_lot::Mutex;
use polyglot_context::{Context, ContextListener, ContextOptions, Engine, PolyglotError, ThreadKey};
use std::sync::atomic::Ordering;
use std::sync::{mpsc, Arc, Barrier};
use std::time::Duration;

#[derive(Default)]
struct RecordingListener {
    events: Mutex<Vec<String>>,
    finished: Mutex<Vec<ThreadKey>>,
}

impl ContextListener for RecordingListener {
    fn on_context_created(&self, _context: &Context) {
        self.events.lock().push("created".to_string());
    }

    fn on_language_initialized(&self, _context: &Context, language: &str) {
        self.events.lock().push(format!("initialized:{}", language));
    }

    fn on_thread_started(&self, _context: &Context, _thread: ThreadKey) {
        self.events.lock().push("thread_started".to_string());
    }

    fn on_thread_finished(&self, _context: &Context, thread: ThreadKey) {
        self.events.lock().push("thread_finished".to_string());
        self.finished.lock().push(thread);
    }

    fn on_context_closed(&self, _context: &Context) {
        self.events.lock().push("closed".to_string());
    }
}

// ===== Enter/Leave Balance =====

#[test]
fn test_nested_enters_across_threads_balance() {
    let engine = Engine::new();
    let context = new_context(&engine);
    let barrier = Arc::new(Barrier::new(4));
    let handles: Vec<_> = (0..4)
        .map(|depth| {
            let context = context.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
                for _ in 0..100 {
                    for _ in 0..=depth {
                        context.enter().unwrap();
                    }
                    assert!(context.is_entered());
                    for _ in 0..=depth {
                        context.leave().unwrap();
                    }
                    assert!(!context.is_entered());
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert!(!context.is_active());
    context.close(false).unwrap();
}

#[test]
fn test_contexts_nest_on_one_thread() {
    let engine = Engine::new();
    let outer = new_context(&engine);
    let inner = new_context(&engine);

    outer.enter().unwrap();
    inner.enter().unwrap();
    assert_eq!(Context::current().as_ref(), Some(&inner));
    inner.leave().unwrap();
    assert_eq!(Context::current().as_ref(), Some(&outer));
    outer.leave().unwrap();
    assert!(Context::current().is_none());
}

// ===== Thread Access Policy =====

#[test]
fn test_multi_threading_initializes_languages_once() {
    let log = EventLog::default();
    let (engine, _languages) = engine_with(&["js"], &log);
    let context = new_context(&engine);
    context.initialize_language("js").unwrap();

    let barrier = Arc::new(Barrier::new(3));
    let handles: Vec<_> = (0..3)
        .map(|_| {
            let context = context.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                context.enter().unwrap();
                barrier.wait();
                context.leave().unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(log.count("js:multi_threading"), 1);
    assert!(log.count("js:initialize_thread") >= 4);
}

#[test]
fn test_language_denies_multi_threaded_access() {
    let log = EventLog::default();
    let (engine, languages) = engine_with(&["js"], &log);
    languages[0].deny_multi_threading.store(true, Ordering::SeqCst);
    let context = new_context(&engine);
    context.initialize_language("js").unwrap();

    context.enter().unwrap();
    let other = context.clone();
    let err = std::thread::spawn(move || other.enter().unwrap_err())
        .join()
        .unwrap();
    match err {
        PolyglotError::IllegalState(message) => {
            assert!(message.starts_with("Multi threaded access requested by thread"));
            assert!(message.ends_with("is not allowed for language(s) js."));
        }
        other => panic!("unexpected error: {other}"),
    }
    context.leave().unwrap();

    // Alone, the other thread is single-threaded access and allowed.
    let other = context.clone();
    std::thread::spawn(move || {
        other.enter().unwrap();
        other.leave().unwrap();
    })
    .join()
    .unwrap();
    assert_eq!(log.count("js:multi_threading"), 0);
}

#[test]
fn test_single_threaded_context_denies_second_thread() {
    let engine = Engine::new();
    let context = engine
        .create_context(ContextOptions::single_threaded())
        .unwrap();
    context.enter().unwrap();
    let other = context.clone();
    let err = std::thread::spawn(move || other.enter().unwrap_err())
        .join()
        .unwrap();
    assert!(err.to_string().contains("not allowed for this context"));
    context.leave().unwrap();
}

#[test]
fn test_language_initialized_later_checks_threads() {
    let log = EventLog::default();
    let (engine, languages) = engine_with(&["js"], &log);
    languages[0].deny_multi_threading.store(true, Ordering::SeqCst);
    let context = new_context(&engine);

    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let worker = {
        let context = context.clone();
        std::thread::spawn(move || {
            context.enter().unwrap();
            entered_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            context.leave().unwrap();
        })
    };
    entered_rx.recv().unwrap();
    context.enter().unwrap();

    let err = context.initialize_language("js").unwrap_err();
    assert!(err.to_string().contains("language(s) js"));

    context.leave().unwrap();
    release_tx.send(()).unwrap();
    worker.join().unwrap();
}

// ===== Thread Termination and Listener =====

#[test]
fn test_terminated_thread_is_disposed() {
    let log = EventLog::default();
    let listener = Arc::new(RecordingListener::default());
    let engine = Engine::builder()
        .language(common::RecordingLanguage::new("js", &log))
        .listener(listener.clone())
        .build()
        .unwrap();
    let context = new_context(&engine);
    context.initialize_language("js").unwrap();

    let worker = {
        let context = context.clone();
        std::thread::spawn(move || {
            context.enter().unwrap();
            context.leave().unwrap();
            ThreadKey::current()
        })
    };
    let key = worker.join().unwrap();

    assert!(wait_for(Duration::from_secs(5), || listener.finished.lock().contains(&key)));
    assert_eq!(log.count("js:dispose_thread"), 1);
    context.close(false).unwrap();
}

#[test]
fn test_listener_sees_lifecycle() {
    let listener = Arc::new(RecordingListener::default());
    let log = EventLog::default();
    let engine = Engine::builder()
        .language(common::RecordingLanguage::new("js", &log))
        .listener(listener.clone())
        .build()
        .unwrap();
    let context = new_context(&engine);
    context.initialize_language("js").unwrap();
    context.close(false).unwrap();

    assert_eq!(
        *listener.events.lock(),
        vec![
            "created",
            "thread_started",
            "initialized:host",
            "initialized:js",
            "thread_finished",
            "closed",
        ]
    );
}

#[test]
fn test_thread_locals_are_per_thread() {
    let engine = Engine::new();
    let key = engine.new_context_thread_local::<String>();
    let context = new_context(&engine);

    context.enter().unwrap();
    context.set_thread_local(key, "main".to_string()).unwrap();
    let other = context.clone();
    let seen = std::thread::spawn(move || {
        other.enter().unwrap();
        let before = other.get_thread_local(key);
        other.set_thread_local(key, "worker".to_string()).unwrap();
        other.leave().unwrap();
        before
    })
    .join()
    .unwrap();
    assert!(seen.is_none());
    assert_eq!(context.get_thread_local(key).as_deref().map(String::as_str), Some("main"));
    context.leave().unwrap();
}
