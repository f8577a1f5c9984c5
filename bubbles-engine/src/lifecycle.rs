//! Session lifecycle state machine.
//!
//! ```text
//! Uninitialized ──► Starting ──► Running ⇄ Paused
//!       │              │            │        │
//!       └──────────────┴─────┬──────┴────────┘
//!                            ▼
//!                    Stopped / Failed   (terminal)
//! ```
//!
//! The state lives in a `watch` channel so the I/O loop and the autopilot
//! observe transitions without polling.

use tokio::sync::watch;

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Starting,
    Running,
    Paused,
    Stopped,
    Failed,
}

impl LifecycleState {
    /// Stopped and Failed end a session instance.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    /// Whether the state machine allows `self → to`.
    pub fn can_transition(self, to: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, to),
            (Uninitialized, Starting)
                | (Uninitialized, Stopped)
                | (Starting, Running)
                | (Starting, Failed)
                | (Starting, Stopped)
                | (Running, Paused)
                | (Running, Failed)
                | (Running, Stopped)
                | (Paused, Running)
                | (Paused, Failed)
                | (Paused, Stopped)
        )
    }
}

/// Shared, observable lifecycle state.
pub struct Lifecycle {
    tx: watch::Sender<LifecycleState>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(LifecycleState::Uninitialized);
        Self { tx }
    }

    pub fn state(&self) -> LifecycleState {
        *self.tx.borrow()
    }

    /// Observe transitions.
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.tx.subscribe()
    }

    /// Atomically move to `to` if the current state allows it.
    ///
    /// Returns the previous state, or a `State` error naming `operation`.
    pub fn transition(
        &self,
        operation: &'static str,
        to: LifecycleState,
    ) -> Result<LifecycleState, EngineError> {
        let mut previous = LifecycleState::Uninitialized;
        let mut allowed = false;
        self.tx.send_if_modified(|state| {
            previous = *state;
            allowed = state.can_transition(to);
            if allowed {
                *state = to;
            }
            allowed
        });
        if allowed {
            log::info!("Session {previous:?} -> {to:?} ({operation})");
            Ok(previous)
        } else {
            Err(EngineError::state(operation, previous))
        }
    }

    /// Move to `Stopped` from any non-terminal state. Returns the previous state.
    pub fn stop(&self) -> LifecycleState {
        let mut previous = LifecycleState::Uninitialized;
        self.tx.send_if_modified(|state| {
            previous = *state;
            if state.is_terminal() {
                return false;
            }
            *state = LifecycleState::Stopped;
            true
        });
        if !previous.is_terminal() {
            log::info!("Session {previous:?} -> Stopped");
        }
        previous
    }

    /// Move to `Failed` unless the session already ended.
    ///
    /// Returns true if this call performed the transition.
    pub fn fail(&self) -> bool {
        let mut failed = false;
        self.tx.send_if_modified(|state| {
            failed = state.can_transition(LifecycleState::Failed);
            if failed {
                *state = LifecycleState::Failed;
            }
            failed
        });
        if failed {
            log::error!("Session -> Failed");
        }
        failed
    }
}
