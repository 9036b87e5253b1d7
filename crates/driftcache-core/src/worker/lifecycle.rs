//! Worker lifecycle state machine.
//!
//! A worker moves through `None → Installing → Installed → (Waiting →)
//! Activating → Activated → Controlling`; `Redundant` is reachable from any
//! state once a newer worker supersedes this one. At most one worker holds
//! `Controlling` for a page at a time.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    None,
    Installing,
    Installed,
    Waiting,
    Activating,
    Activated,
    Controlling,
    Redundant,
}

impl LifecycleState {
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        match (self, next) {
            // A superseded worker can go redundant from anywhere.
            (_, Redundant) => true,
            (None, Installing) => true,
            (Installing, Installed) => true,
            // First install activates directly; an update install waits.
            (Installed, Waiting) | (Installed, Activating) => true,
            (Waiting, Activating) => true,
            (Activating, Activated) => true,
            (Activated, Controlling) => true,
            _ => false,
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("invalid lifecycle transition from {from:?} to {to:?}")]
pub struct TransitionError {
    pub from: LifecycleState,
    pub to: LifecycleState,
}

/// Tracks one worker's position in the state machine with checked
/// transitions.
#[derive(Debug)]
pub struct LifecycleTracker {
    state: LifecycleState,
}

impl LifecycleTracker {
    pub fn new() -> Self {
        Self {
            state: LifecycleState::None,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn transition(&mut self, next: LifecycleState) -> Result<LifecycleState, TransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransitionError {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(next)
    }
}

impl Default for LifecycleTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifecycle notifications delivered to the coordinator. These are the only
/// way worker state reaches the page side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Install finished. `update` distinguishes an update install from the
    /// first one.
    Installed { update: bool },
    /// A new worker is ready but blocked behind the current one.
    Waiting,
    /// Activation finished. `first` is true for the very first activation.
    Activated { first: bool },
    /// This worker now controls the page.
    Controlling,
    /// This worker was superseded.
    Redundant,
    /// A handler failed; carried as a message so no error escapes the
    /// worker.
    Error(String),
}

// ============================================================================
// Tests
// ============================================================================
