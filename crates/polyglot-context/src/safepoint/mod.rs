//! Thread-Local Actions at Cooperative Safepoints
//!
//! This module lets one thread schedule work that runs on other threads the
//! next time they poll.
//!
//! ## Model
//!
//! Every thread has a mailbox of pending actions per context. Submitting an
//! action appends it to the targeted mailboxes and raises the thread's
//! pending flag; polling is a single atomic load when nothing is pending.
//! An action never preempts arbitrary code: guest code must reach a poll
//! ([`Context::poll`] or [`poll`]), and a thread that is not entered
//! performs it the next time it enters.
//!
//! ## Guarantees
//! - Each targeted thread performs an action at most once (recurring actions
//!   once per poll until cancelled)
//! - Synchronous actions are performed only after every active target
//!   arrived at its poll
//! - Actions flagged `run_when_invalid` run even after the context was
//!   cancelled or exited; other actions are skipped at that point

mod future;

pub use future::{ActionFuture, CombinedFuture};

use crate::context::Context;
use crate::thread::{self, ThreadInfo, ThreadKey};
use crate::{PolyglotError, PolyglotResult};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Work performed on a thread at a safepoint
///
/// Returning an error unwinds the polling guest code with it; this is how
/// cancellation, exit and interrupt reach running guest code.
pub trait ThreadLocalAction: Send + Sync {
    /// Perform the action on the polling thread
    fn perform(&self, access: &ActionAccess<'_>) -> PolyglotResult<()>;
}

impl<F> ThreadLocalAction for F
where
    F: Fn(&ActionAccess<'_>) -> PolyglotResult<()> + Send + Sync,
{
    fn perform(&self, access: &ActionAccess<'_>) -> PolyglotResult<()> {
        self(access)
    }
}

/// Box a closure as a shareable action
pub fn action<F>(f: F) -> Arc<dyn ThreadLocalAction>
where
    F: Fn(&ActionAccess<'_>) -> PolyglotResult<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// What a running action may access
pub struct ActionAccess<'a> {
    context: &'a Context,
    thread: ThreadKey,
}

impl<'a> ActionAccess<'a> {
    /// Context the action was submitted to
    pub fn context(&self) -> &'a Context {
        self.context
    }

    /// Thread performing the action
    pub fn thread(&self) -> ThreadKey {
        self.thread
    }
}

/// How an action is scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionConfig {
    /// Deferred while the thread has side effects disabled
    pub side_effecting: bool,
    /// All active targets arrive before any performs it
    pub synchronous: bool,
    /// Re-queued after every execution until cancelled
    pub recurring: bool,
    /// Still performed after the context became invalid
    pub run_when_invalid: bool,
}

impl Default for ActionConfig {
    fn default() -> Self {
        Self {
            side_effecting: true,
            synchronous: false,
            recurring: false,
            run_when_invalid: false,
        }
    }
}

impl ActionConfig {
    /// Side-effecting asynchronous action
    pub fn asynchronous() -> Self {
        Self::default()
    }

    /// Side-effecting synchronous action
    pub fn synchronous() -> Self {
        Self {
            synchronous: true,
            ..Default::default()
        }
    }

    /// Asynchronous action re-run at every poll until cancelled
    pub fn recurring() -> Self {
        Self {
            recurring: true,
            ..Default::default()
        }
    }

    /// Action the lifecycle itself submits (cancel, exit, interrupt)
    pub(crate) fn internal() -> Self {
        Self {
            side_effecting: false,
            synchronous: false,
            recurring: false,
            run_when_invalid: true,
        }
    }

    /// Set the side-effecting flag
    pub fn with_side_effects(mut self, side_effecting: bool) -> Self {
        self.side_effecting = side_effecting;
        self
    }

    /// Set the run-when-invalid flag
    pub fn with_run_when_invalid(mut self, run_when_invalid: bool) -> Self {
        self.run_when_invalid = run_when_invalid;
        self
    }
}

struct PendingAction {
    action: Arc<dyn ThreadLocalAction>,
    config: ActionConfig,
    future: ActionFuture,
    /// The thread no longer counts as a barrier party
    barrier_released: bool,
}

/// Statistics of performed actions
#[derive(Debug, Default)]
pub struct SafepointStats {
    /// Polls that found at least one action
    polls_with_actions: AtomicUsize,
    /// Actions performed
    performed: AtomicUsize,
    /// Longest single action (microseconds)
    max_action_time_us: AtomicUsize,
}

impl SafepointStats {
    fn record(&self, elapsed_us: usize) {
        self.performed.fetch_add(1, Ordering::Relaxed);
        let mut max = self.max_action_time_us.load(Ordering::Relaxed);
        while elapsed_us > max {
            match self.max_action_time_us.compare_exchange_weak(
                max,
                elapsed_us,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => max = current,
            }
        }
    }

    /// Polls that found at least one action
    pub fn polls_with_actions(&self) -> usize {
        self.polls_with_actions.load(Ordering::Relaxed)
    }

    /// Actions performed
    pub fn performed(&self) -> usize {
        self.performed.load(Ordering::Relaxed)
    }

    /// Longest single action in microseconds
    pub fn max_action_time_us(&self) -> usize {
        self.max_action_time_us.load(Ordering::Relaxed)
    }
}

/// Per-context coordinator of thread mailboxes
///
/// Lock order: the context monitor may be held while taking the mailbox
/// lock, never the other way round. Actions run with neither held.
#[derive(Default)]
pub(crate) struct ThreadLocalActions {
    mailboxes: Mutex<FxHashMap<ThreadKey, VecDeque<PendingAction>>>,
    stats: SafepointStats,
}

impl ThreadLocalActions {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn stats(&self) -> &SafepointStats {
        &self.stats
    }

    /// Queue an action for every target
    pub(crate) fn submit(
        &self,
        targets: &[Arc<ThreadInfo>],
        action: Arc<dyn ThreadLocalAction>,
        config: ActionConfig,
    ) -> ActionFuture {
        let parties = if config.synchronous {
            targets.iter().filter(|info| info.is_active()).count()
        } else {
            0
        };
        let future = ActionFuture::new(targets.len(), parties);
        let mut mailboxes = self.mailboxes.lock();
        for info in targets {
            mailboxes
                .entry(info.key())
                .or_default()
                .push_back(PendingAction {
                    action: action.clone(),
                    config,
                    future: future.clone(),
                    barrier_released: config.synchronous && !info.is_active(),
                });
            info.set_pending_actions(true);
            info.unpark();
        }
        future
    }

    /// Perform the pending actions of the calling thread
    pub(crate) fn process(&self, info: &ThreadInfo, context: &Context) -> PolyglotResult<()> {
        let key = info.key();
        let mut requeue = Vec::new();
        let mut found = false;
        let result = loop {
            let next = {
                let mut mailboxes = self.mailboxes.lock();
                let Some(queue) = mailboxes.get_mut(&key) else {
                    info.set_pending_actions(false);
                    break Ok(());
                };
                let side_effects = info.side_effects_allowed();
                let mut taken = None;
                let mut index = 0;
                while index < queue.len() {
                    let candidate = &queue[index];
                    if candidate.future.is_cancelled() {
                        if let Some(removed) = queue.remove(index) {
                            release_party(&removed);
                        }
                        continue;
                    }
                    if candidate.config.side_effecting && !side_effects {
                        index += 1;
                        continue;
                    }
                    taken = queue.remove(index);
                    break;
                }
                info.set_pending_actions(!queue.is_empty() || !requeue.is_empty());
                taken
            };
            let Some(pending) = next else {
                break Ok(());
            };
            if !found {
                found = true;
                self.stats.polls_with_actions.fetch_add(1, Ordering::Relaxed);
            }

            if !pending.config.run_when_invalid && context.state().is_invalid_or_closed() {
                release_party(&pending);
                pending.future.complete_part();
                continue;
            }
            if pending.config.synchronous && !pending.barrier_released {
                pending.future.arrive_and_wait();
            }

            let start = Instant::now();
            let outcome = pending.action.perform(&ActionAccess {
                context,
                thread: key,
            });
            self.stats.record(start.elapsed().as_micros() as usize);
            tracing::trace!(
                thread = key.as_u64(),
                ok = outcome.is_ok(),
                "performed thread-local action"
            );

            if pending.config.recurring && !pending.future.is_cancelled() {
                requeue.push(pending);
            } else {
                pending.future.complete_part();
            }
            if let Err(e) = outcome {
                break Err(e);
            }
        };

        if !requeue.is_empty() {
            let mut mailboxes = self.mailboxes.lock();
            mailboxes.entry(key).or_default().extend(requeue);
            info.set_pending_actions(true);
        }
        result
    }

    /// The thread left its last enter: release it from pending barriers
    pub(crate) fn thread_deactivated(&self, key: ThreadKey) {
        let mut mailboxes = self.mailboxes.lock();
        if let Some(queue) = mailboxes.get_mut(&key) {
            for pending in queue.iter_mut() {
                if pending.config.synchronous && !pending.barrier_released {
                    pending.barrier_released = true;
                    pending.future.leave_barrier();
                }
            }
        }
    }

    /// Complete everything queued for a disposed thread
    pub(crate) fn discard_thread(&self, info: &ThreadInfo) {
        let removed = self.mailboxes.lock().remove(&info.key());
        info.set_pending_actions(false);
        if let Some(queue) = removed {
            for pending in queue {
                release_party(&pending);
                pending.future.complete_part();
            }
        }
    }
}

fn release_party(pending: &PendingAction) {
    if pending.config.synchronous && !pending.barrier_released {
        pending.future.leave_barrier();
    }
}

/// Poll every context entered on the calling thread, innermost first
pub fn poll() -> PolyglotResult<()> {
    for inner in thread::entered_contexts().into_iter().rev() {
        Context::from_inner(inner).poll()?;
    }
    Ok(())
}

/// Reject configurations the coordinator cannot honor
pub(crate) fn validate(config: &ActionConfig) -> PolyglotResult<()> {
    if config.synchronous && config.recurring {
        return Err(PolyglotError::illegal_state(
            "Recurring thread-local actions cannot be synchronous.",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ActionConfig::default();
        assert!(config.side_effecting);
        assert!(!config.synchronous);
        assert!(!config.recurring);
        assert!(!config.run_when_invalid);
    }

    #[test]
    fn test_internal_config_runs_when_invalid() {
        let config = ActionConfig::internal();
        assert!(config.run_when_invalid);
        assert!(!config.side_effecting);
    }

    #[test]
    fn test_synchronous_recurring_rejected() {
        let config = ActionConfig {
            recurring: true,
            ..ActionConfig::synchronous()
        };
        assert!(validate(&config).is_err());
        assert!(validate(&ActionConfig::recurring()).is_ok());
    }

    #[test]
    fn test_submit_sets_pending_flag() {
        let actions = ThreadLocalActions::new();
        let info = Arc::new(ThreadInfo::for_current_thread());
        let action = super::action(|_| Ok(()));
        let future = actions.submit(&[info.clone()], action, ActionConfig::default());
        assert!(info.has_pending_actions());
        assert!(!future.is_done());

        actions.discard_thread(&info);
        assert!(!info.has_pending_actions());
        assert!(future.is_done());
    }

    #[test]
    fn test_stats_track_maximum() {
        let stats = SafepointStats::default();
        stats.record(5);
        stats.record(50);
        stats.record(10);
        assert_eq!(stats.performed(), 3);
        assert_eq!(stats.max_action_time_us(), 50);
    }
}
