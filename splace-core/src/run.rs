//! Run lifecycle shared by the search and replace engines.
//!
//! An engine owns a [`Reporter`]; its caller holds the matching
//! [`Completion`]. The reporter publishes [`RunState`] changes and fires
//! the completion signal exactly once, because `finish` consumes it.

use crate::Result;
use crate::error::SplaceError;
use crate::models::RunState;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;

/// Caller side of a run: state, cancellation and the final outcome.
#[derive(Debug)]
pub struct Completion {
    done: oneshot::Receiver<Result<()>>,
    state: watch::Receiver<RunState>,
    cancel: CancellationToken,
}

impl Completion {
    /// Latest published state.
    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    /// Receiver notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.state.clone()
    }

    /// Asks the run to stop. Queries already in flight finish on their own;
    /// no new ones are issued.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token tripped when the run is canceled or fails.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Waits for the run to end.
    ///
    /// # Errors
    /// Returns the first error the run hit, or [`SplaceError::Canceled`]
    /// when it was canceled before finishing.
    pub async fn wait(self) -> Result<()> {
        self.done.await.unwrap_or(Err(SplaceError::Canceled))
    }
}

/// Engine side of a run.
#[derive(Debug)]
pub(crate) struct Reporter {
    done: oneshot::Sender<Result<()>>,
    state: watch::Sender<RunState>,
}

impl Reporter {
    pub(crate) fn running(&self) {
        self.state.send_replace(RunState::Running);
    }

    /// Publishes the terminal state and fires the completion signal.
    pub(crate) fn finish(self, outcome: Result<()>) {
        let state = match &outcome {
            Ok(()) => RunState::Completed,
            Err(SplaceError::Canceled) => RunState::Canceled,
            Err(_) => RunState::Failed,
        };
        self.state.send_replace(state);
        // The caller may have dropped its completion; nothing to report to.
        let _ = self.done.send(outcome);
    }
}

/// Creates the two halves of a run tied to `cancel`.
pub(crate) fn channel(cancel: CancellationToken) -> (Reporter, Completion) {
    let (done_tx, done_rx) = oneshot::channel();
    let (state_tx, state_rx) = watch::channel(RunState::Idle);
    (
        Reporter {
            done: done_tx,
            state: state_tx,
        },
        Completion {
            done: done_rx,
            state: state_rx,
            cancel,
        },
    )
}
