//! Inner Context Integration Tests
//!
//! Propagation of cancel, exit and interrupt from a parent to its inner
//! contexts, and closing order across the hierarchy.
//!
//! # Running Tests
//! ```bash
//! cargo test --test hierarchy_integration
//! ```

mod common;

use common::{engine_with, new_context, run_until_signal, EventLog};
use polyglot_context::{Context, ContextOptions, ContextState, Engine, PolyglotError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;

/// Enter `context` on a new thread and poll until a signal arrives
fn guest_in(
    context: &Context,
    barrier: &Arc<Barrier>,
    observed: &Arc<AtomicUsize>,
) -> std::thread::JoinHandle<PolyglotError> {
    let context = context.clone();
    let barrier = barrier.clone();
    let observed = observed.clone();
    std::thread::spawn(move || {
        context.enter().unwrap();
        barrier.wait();
        let error = loop {
            if let Err(e) = context.sleep_interruptibly(Duration::from_millis(2)) {
                break e;
            }
        };
        observed.fetch_add(1, Ordering::SeqCst);
        context.leave().unwrap();
        error
    })
}

#[test]
fn test_cancel_reaches_threads_of_every_child() {
    let engine = Engine::new();
    let parent = new_context(&engine);
    let first = parent.create_inner(ContextOptions::default()).unwrap();
    let second = parent.create_inner(ContextOptions::default()).unwrap();

    let barrier = Arc::new(Barrier::new(3));
    let observed = Arc::new(AtomicUsize::new(0));
    let guests = vec![
        guest_in(&first, &barrier, &observed),
        guest_in(&second, &barrier, &observed),
    ];
    barrier.wait();

    parent.cancel().unwrap();
    assert_eq!(observed.load(Ordering::SeqCst), 2);
    assert_eq!(first.state(), ContextState::ClosedCancelled);
    assert_eq!(second.state(), ContextState::ClosedCancelled);
    assert_eq!(parent.state(), ContextState::ClosedCancelled);
    for guest in guests {
        assert!(guest.join().unwrap().is_cancelled());
    }
}

#[test]
fn test_soft_close_refused_while_child_active() {
    let engine = Engine::new();
    let parent = new_context(&engine);
    let child = parent.create_inner(ContextOptions::default()).unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let observed = Arc::new(AtomicUsize::new(0));
    let guest = guest_in(&child, &barrier, &observed);
    barrier.wait();

    assert!(parent.close(false).is_err());
    assert_eq!(parent.state(), ContextState::Default);
    assert_eq!(child.state(), ContextState::Default);

    parent.close(true).unwrap();
    assert!(guest.join().unwrap().is_cancelled());
    assert!(child.is_closed());
}

#[test]
fn test_parent_exit_skips_child_notifications() {
    let log = EventLog::default();
    let (engine, _languages) = engine_with(&["js"], &log);
    let parent = new_context(&engine);
    let child = parent.create_inner(ContextOptions::default()).unwrap();
    child.initialize_language("js").unwrap();

    parent.exit(7).unwrap();
    assert_eq!(parent.state(), ContextState::ClosedExited);
    assert_eq!(child.state(), ContextState::ClosedExited);
    assert_eq!(child.exit_code(), Some(7));
    assert_eq!(log.count("js:exit(Hard,7)"), 0);
    assert_eq!(log.count("js:finalize"), 1);
}

#[test]
fn test_child_exiting_during_parent_pending_exit_completes_alone() {
    let log = EventLog::default();
    let (engine, languages) = engine_with(&["js"], &log);
    let parent = new_context(&engine);
    parent.initialize_language("js").unwrap();
    let child = parent.create_inner(ContextOptions::default()).unwrap();

    let inner = child.clone();
    languages[0].set_on_exit(move |context, _| {
        if context.parent().is_none() {
            inner.exit(5)?;
        }
        Ok(())
    });

    parent.exit(1).unwrap();
    assert_eq!(child.state(), ContextState::ClosedExited);
    assert_eq!(child.exit_code(), Some(5));
    assert_eq!(parent.exit_code(), Some(1));
    assert!(parent.children().is_empty());
}

#[test]
fn test_interrupt_propagates_and_reverts() {
    let engine = Engine::new();
    let parent = new_context(&engine);
    let child = parent.create_inner(ContextOptions::default()).unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let guest = {
        let child = child.clone();
        let barrier = barrier.clone();
        std::thread::spawn(move || {
            child.enter().unwrap();
            barrier.wait();
            run_until_signal(&child)
        })
    };
    barrier.wait();

    assert!(parent.interrupt(Duration::ZERO).unwrap());
    assert!(guest.join().unwrap().is_interrupted());
    assert_eq!(parent.state(), ContextState::Default);
    assert_eq!(child.state(), ContextState::Default);
    child.enter().unwrap();
    child.leave().unwrap();
}

#[test]
fn test_closing_parent_closes_inner_contexts_first() {
    let closed = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let engine = Engine::new();
    let order = closed.clone();
    let parent = engine
        .create_context(
            ContextOptions::named("parent").on_closed(move |_| order.lock().push("parent")),
        )
        .unwrap();
    let order = closed.clone();
    let _child = parent
        .create_inner(ContextOptions::named("child").on_closed(move |_| order.lock().push("child")))
        .unwrap();

    parent.close(false).unwrap();
    assert_eq!(*closed.lock(), vec!["child", "parent"]);
}
