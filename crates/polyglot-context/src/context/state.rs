//! Context lifecycle states and the legal transition table
//!
//! The lifecycle has five overlapping axes (running, interrupting, exiting,
//! cancelling, closing). Instead of independent flags every combination that
//! may actually occur is a variant of [`ContextState`], and the predicates
//! below answer questions about the axes. The transition table is closed:
//! anything not listed in [`ContextState::successors`] is rejected.

use crate::thread::ThreadKey;
use crate::{PolyglotError, PolyglotResult};
use std::fmt;

/// Lifecycle state of a context
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ContextState {
    /// Usable, guest code may run
    Default,
    /// `interrupt` is stopping all running guest code
    Interrupting,
    /// Soft exit: exit notifications are running in guest code
    PendingExit,
    /// Hard exit: no further guest code may run
    Exiting,
    /// Cancelled: no further guest code may run
    Cancelling,
    /// A close is in progress
    Closing,
    /// A close is in progress and exit notifications are running
    ClosingPendingExit,
    /// A close is finalizing the language contexts
    ClosingFinalizing,
    /// A close is in progress while an interrupt is outstanding
    ClosingInterrupting,
    /// A close is finalizing while an interrupt is outstanding
    ClosingInterruptingFinalizing,
    /// A forced close after cancellation
    ClosingCancelling,
    /// A forced close after a hard exit
    ClosingExiting,
    /// Closed normally
    Closed,
    /// Closed while an interrupt was outstanding
    ClosedInterrupted,
    /// Closed after cancellation
    ClosedCancelled,
    /// Closed after exit
    ClosedExited,
}

use ContextState::*;

impl ContextState {
    /// Every state, in declaration order
    pub const ALL: [ContextState; 16] = [
        Default,
        Interrupting,
        PendingExit,
        Exiting,
        Cancelling,
        Closing,
        ClosingPendingExit,
        ClosingFinalizing,
        ClosingInterrupting,
        ClosingInterruptingFinalizing,
        ClosingCancelling,
        ClosingExiting,
        Closed,
        ClosedInterrupted,
        ClosedCancelled,
        ClosedExited,
    ];

    /// Legal successor states
    pub fn successors(self) -> &'static [ContextState] {
        match self {
            Default => &[Interrupting, PendingExit, Exiting, Cancelling, Closing],
            Interrupting => &[Default, PendingExit, Exiting, Cancelling, ClosingInterrupting],
            PendingExit => &[Exiting, Cancelling],
            Exiting => &[Cancelling, ClosingExiting],
            Cancelling => &[ClosingCancelling],
            Closing => &[
                ClosingFinalizing,
                ClosingInterrupting,
                ClosingPendingExit,
                ClosingExiting,
                ClosingCancelling,
                Default,
            ],
            ClosingPendingExit => &[ClosingExiting, ClosingCancelling, PendingExit],
            ClosingFinalizing => &[
                Closed,
                ClosingInterruptingFinalizing,
                ClosingPendingExit,
                ClosingExiting,
                ClosingCancelling,
                Default,
            ],
            ClosingInterrupting => &[
                Closing,
                ClosingInterruptingFinalizing,
                ClosingPendingExit,
                ClosingExiting,
                ClosingCancelling,
                Interrupting,
            ],
            ClosingInterruptingFinalizing => &[
                ClosedInterrupted,
                ClosingFinalizing,
                ClosingPendingExit,
                ClosingExiting,
                ClosingCancelling,
                Interrupting,
            ],
            ClosingCancelling => &[ClosedCancelled, Cancelling],
            ClosingExiting => &[ClosedExited, ClosingCancelling, Exiting],
            Closed | ClosedInterrupted | ClosedCancelled | ClosedExited => &[],
        }
    }

    /// Whether `target` is in the transition table for this state
    pub fn can_transition_to(self, target: ContextState) -> bool {
        self.successors().contains(&target)
    }

    /// A close is in progress
    pub fn is_closing(self) -> bool {
        matches!(
            self,
            Closing
                | ClosingPendingExit
                | ClosingFinalizing
                | ClosingInterrupting
                | ClosingInterruptingFinalizing
                | ClosingCancelling
                | ClosingExiting
        )
    }

    /// One of the terminal states
    pub fn is_closed(self) -> bool {
        matches!(self, Closed | ClosedInterrupted | ClosedCancelled | ClosedExited)
    }

    /// Cancellation is in progress
    pub fn is_cancelling(self) -> bool {
        matches!(self, Cancelling | ClosingCancelling)
    }

    /// Cancellation is in progress or the context was closed by it
    pub fn is_cancelled(self) -> bool {
        self.is_cancelling() || self == ClosedCancelled
    }

    /// Hard exit is in progress
    pub fn is_exiting(self) -> bool {
        matches!(self, Exiting | ClosingExiting)
    }

    /// Exit notifications are running
    pub fn is_pending_exit(self) -> bool {
        matches!(self, PendingExit | ClosingPendingExit)
    }

    /// An interrupt is outstanding
    pub fn is_interrupting(self) -> bool {
        matches!(
            self,
            Interrupting | ClosingInterrupting | ClosingInterruptingFinalizing
        )
    }

    /// Language contexts are being finalized
    pub fn is_finalizing(self) -> bool {
        matches!(self, ClosingFinalizing | ClosingInterruptingFinalizing)
    }

    /// No guest code may run any more (cancelling or hard exiting)
    pub fn is_invalid(self) -> bool {
        self.is_cancelling() || self.is_exiting()
    }

    /// Invalid or already closed
    pub fn is_invalid_or_closed(self) -> bool {
        self.is_invalid() || self.is_closed()
    }

    /// The closing state entered when a close starts from this state
    pub fn closing_variant(self) -> Option<ContextState> {
        match self {
            Default => Some(Closing),
            Interrupting => Some(ClosingInterrupting),
            Cancelling => Some(ClosingCancelling),
            Exiting => Some(ClosingExiting),
            _ => None,
        }
    }

    /// The state used while language contexts are finalized
    pub fn finalizing_variant(self) -> ContextState {
        match self {
            Closing => ClosingFinalizing,
            ClosingInterrupting => ClosingInterruptingFinalizing,
            other => other,
        }
    }

    /// The terminal state a close reaches from this closing state
    pub fn closed_variant(self) -> Option<ContextState> {
        match self {
            Closing | ClosingFinalizing => Some(Closed),
            ClosingInterrupting | ClosingInterruptingFinalizing => Some(ClosedInterrupted),
            ClosingCancelling => Some(ClosedCancelled),
            ClosingExiting => Some(ClosedExited),
            _ => None,
        }
    }

    /// The state a failed soft close reverts to
    ///
    /// An exit or cancel that arrived while the close ran survives the
    /// rollback, so the thread driving it can close the context later.
    pub fn rollback_variant(self) -> Option<ContextState> {
        match self {
            Closing | ClosingFinalizing => Some(Default),
            ClosingInterrupting | ClosingInterruptingFinalizing => Some(Interrupting),
            ClosingPendingExit => Some(PendingExit),
            ClosingCancelling => Some(Cancelling),
            ClosingExiting => Some(Exiting),
            _ => None,
        }
    }

    /// Target state for a cancel request
    pub fn cancelling_variant(self) -> ContextState {
        if self.is_closing() {
            ClosingCancelling
        } else {
            Cancelling
        }
    }

    /// Target state for a hard exit
    pub fn exiting_variant(self) -> ContextState {
        if self.is_closing() {
            ClosingExiting
        } else {
            Exiting
        }
    }

    /// Target state for a soft exit
    pub fn pending_exit_variant(self) -> ContextState {
        if self.is_closing() {
            ClosingPendingExit
        } else {
            PendingExit
        }
    }

    /// Target state for an interrupt request
    pub fn interrupting_variant(self) -> Option<ContextState> {
        match self {
            Default => Some(Interrupting),
            Closing => Some(ClosingInterrupting),
            ClosingFinalizing => Some(ClosingInterruptingFinalizing),
            _ => None,
        }
    }

    /// The state an interrupt reverts to once all threads have left
    pub fn interrupt_done_variant(self) -> Option<ContextState> {
        match self {
            Interrupting => Some(Default),
            ClosingInterrupting => Some(Closing),
            ClosingInterruptingFinalizing => Some(ClosingFinalizing),
            _ => None,
        }
    }

    /// Upper-case name used in diagnostics
    pub fn name(self) -> &'static str {
        match self {
            Default => "DEFAULT",
            Interrupting => "INTERRUPTING",
            PendingExit => "PENDING_EXIT",
            Exiting => "EXITING",
            Cancelling => "CANCELLING",
            Closing => "CLOSING",
            ClosingPendingExit => "CLOSING_PENDING_EXIT",
            ClosingFinalizing => "CLOSING_FINALIZING",
            ClosingInterrupting => "CLOSING_INTERRUPTING",
            ClosingInterruptingFinalizing => "CLOSING_INTERRUPTING_FINALIZING",
            ClosingCancelling => "CLOSING_CANCELLING",
            ClosingExiting => "CLOSING_EXITING",
            Closed => "CLOSED",
            ClosedInterrupted => "CLOSED_INTERRUPTED",
            ClosedCancelled => "CLOSED_CANCELLED",
            ClosedExited => "CLOSED_EXITED",
        }
    }
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Current state plus the data the transition guards consult
///
/// Lives inside the context monitor; every mutation happens with the
/// monitor held and is followed by a broadcast on the context condvar.
#[derive(Debug)]
pub(crate) struct StateMachine {
    state: ContextState,
    /// Thread holding the exclusive closing role
    pub(crate) closing_thread: Option<ThreadKey>,
    /// Allows entering an exiting state without passing PENDING_EXIT
    pub(crate) skip_pending_exit: bool,
}

impl StateMachine {
    pub(crate) fn new() -> Self {
        Self {
            state: Default,
            closing_thread: None,
            skip_pending_exit: false,
        }
    }

    pub(crate) fn state(&self) -> ContextState {
        self.state
    }

    /// Check a transition against the table and the guards
    pub(crate) fn check(&self, target: ContextState, current: ThreadKey) -> PolyglotResult<()> {
        let from = self.state;
        if !from.can_transition_to(target) {
            return Err(PolyglotError::internal(format!(
                "illegal context state transition from {} to {}",
                from, target
            )));
        }
        if from.is_closing() != target.is_closing() && self.closing_thread != Some(current) {
            return Err(PolyglotError::internal(format!(
                "transition from {} to {} is reserved to the closing thread",
                from, target
            )));
        }
        if target.is_exiting()
            && !from.is_exiting()
            && !from.is_pending_exit()
            && !self.skip_pending_exit
        {
            return Err(PolyglotError::internal(format!(
                "transition from {} to {} must pass through PENDING_EXIT",
                from, target
            )));
        }
        Ok(())
    }

    /// Perform a checked transition, returning the previous state
    pub(crate) fn transition(
        &mut self,
        target: ContextState,
        current: ThreadKey,
    ) -> PolyglotResult<ContextState> {
        if let Err(e) = self.check(target, current) {
            tracing::error!(from = %self.state, to = %target, "rejected state transition");
            return Err(e);
        }
        let previous = self.state;
        self.state = target;
        Ok(previous)
    }
}
