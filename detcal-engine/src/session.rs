//! One sweep running on its own thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use flume::Sender;
use log::{debug, error, info};
use thiserror::Error;

use detcal_messages::{SessionState, SweepEvent, SweepSettings};

use crate::cancel::CancellationToken;
use crate::controller::{SweepController, SweepError, SweepOutcome};
use crate::instrument::Bench;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("a sweep is already running")]
    AlreadyRunning,

    #[error("sweep worker panicked, the instruments are lost")]
    WorkerPanicked,
}

/// Admits at most one running session. Clones share the same gate, so a
/// front end can hold one to grey out manual instrument controls.
#[derive(Debug, Clone, Default)]
pub struct SessionGate {
    active: Arc<AtomicBool>,
}

impl SessionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the gate, or fail if a session already holds it. Never waits.
    pub fn try_claim(&self) -> Result<SessionClaim, SessionError> {
        self.active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| SessionClaim {
                active: Arc::clone(&self.active),
            })
            .map_err(|_| SessionError::AlreadyRunning)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// Proof of holding the gate; dropping it opens the gate again.
#[derive(Debug)]
pub struct SessionClaim {
    active: Arc<AtomicBool>,
}

impl Drop for SessionClaim {
    fn drop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

pub type SessionResult = Result<SweepOutcome, SweepError>;

/// A sweep executing on a worker thread that owns the bench until it is
/// joined.
#[derive(Debug)]
pub struct SweepSession {
    state: Arc<Mutex<SessionState>>,
    cancel: CancellationToken,
    handle: JoinHandle<(Bench, SessionResult)>,
}

fn set_state(state: &Mutex<SessionState>, next: SessionState) {
    let mut current = state.lock().unwrap_or_else(PoisonError::into_inner);
    if current.can_transition_to(next) {
        debug!("Session {current:?} -> {next:?}");
        *current = next;
    } else {
        error!("Ignoring session transition {current:?} -> {next:?}");
    }
}

impl SweepSession {
    /// Start `settings` on a new worker thread. The worker sends the terminal
    /// event (`Finished`, `Stopped` or `Error`) once the RF fail-safe has run
    /// and the gate is open again.
    pub fn spawn(
        claim: SessionClaim,
        settings: SweepSettings,
        mut bench: Bench,
        controller: SweepController,
        event_tx: Sender<SweepEvent>,
    ) -> Self {
        let state = Arc::new(Mutex::new(SessionState::Idle));
        let cancel = CancellationToken::new();
        set_state(&state, SessionState::Running);

        let worker_state = Arc::clone(&state);
        let worker_cancel = cancel.clone();
        let handle = thread::spawn(move || {
            let result = controller.run(&settings, &mut bench, &worker_cancel, &event_tx);
            let (next, event) = match &result {
                Ok(SweepOutcome::Completed(points)) => {
                    (SessionState::Completed, SweepEvent::Finished(points.clone()))
                }
                Ok(SweepOutcome::Cancelled(points)) => {
                    (SessionState::Cancelled, SweepEvent::Stopped(points.clone()))
                }
                Err(e) => (
                    SessionState::Failed,
                    SweepEvent::Error {
                        message: e.to_string(),
                        points: e.partial_points().to_vec(),
                    },
                ),
            };
            set_state(&worker_state, next);
            drop(claim);
            if event_tx.send(event).is_err() {
                debug!("Terminal sweep event dropped, nobody is listening");
            }
            (bench, result)
        });
        info!("Sweep session started");

        Self {
            state,
            cancel,
            handle,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ask the sweep to stop at its next checkpoint.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the worker and take the bench back.
    pub fn join(self) -> Result<(Bench, SessionResult), SessionError> {
        self.handle.join().map_err(|_| {
            set_state(&self.state, SessionState::Failed);
            SessionError::WorkerPanicked
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_admits_one_claim_at_a_time() {
        let gate = SessionGate::new();
        let observer = gate.clone();

        let claim = gate.try_claim().unwrap();
        assert!(observer.is_active());
        assert_eq!(gate.try_claim().unwrap_err(), SessionError::AlreadyRunning);

        drop(claim);
        assert!(!observer.is_active());
        assert!(gate.try_claim().is_ok());
    }
}
