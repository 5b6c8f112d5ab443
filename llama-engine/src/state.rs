// llama-engine/src/state.rs
//
// Lifecycle state of the engine and the register that validates transitions.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

use crate::error::{EngineError, Result};

/// Lifecycle state of the engine. Exactly one value is live at any instant.
#[derive(Debug, Clone, Default)]
pub enum EngineState {
    #[default]
    Uninitialized,
    Initializing,
    Initialized,
    LoadingModel,
    ModelReady,
    Generating,
    Benchmarking,
    UnloadingModel,
    Error(Arc<EngineError>),
    /// Terminal: the backend has been shut down and the worker torn down.
    Destroyed,
}

impl EngineState {
    pub fn name(&self) -> &'static str {
        match self {
            EngineState::Uninitialized => "Uninitialized",
            EngineState::Initializing => "Initializing",
            EngineState::Initialized => "Initialized",
            EngineState::LoadingModel => "LoadingModel",
            EngineState::ModelReady => "ModelReady",
            EngineState::Generating => "Generating",
            EngineState::Benchmarking => "Benchmarking",
            EngineState::UnloadingModel => "UnloadingModel",
            EngineState::Error(_) => "Error",
            EngineState::Destroyed => "Destroyed",
        }
    }

    /// States in which the native model handle exists.
    pub fn has_model(&self) -> bool {
        matches!(
            self,
            EngineState::ModelReady
                | EngineState::Generating
                | EngineState::Benchmarking
                | EngineState::UnloadingModel
        )
    }

    pub fn error(&self) -> Option<&EngineError> {
        match self {
            EngineState::Error(cause) => Some(cause),
            _ => None,
        }
    }

    /// Transition table. `Destroyed` is reachable from everywhere except itself.
    fn can_transition_to(&self, next: &EngineState) -> bool {
        use EngineState::*;
        match (self, next) {
            (Destroyed, _) => false,
            (_, Destroyed) => true,
            (Uninitialized, Initializing) => true,
            (Initializing, Initialized) => true,
            (Initialized, LoadingModel) => true,
            (LoadingModel, ModelReady) | (LoadingModel, Error(_)) => true,
            (ModelReady, Generating) | (Generating, ModelReady) => true,
            (ModelReady, Benchmarking) | (Benchmarking, ModelReady) => true,
            (ModelReady, UnloadingModel) | (UnloadingModel, Initialized) => true,
            (Error(_), Initialized) => true,
            _ => false,
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Error(cause) => write!(f, "Error({})", cause),
            other => f.write_str(other.name()),
        }
    }
}

/// Holds the current [`EngineState`].
///
/// Writes happen only on the serializer thread. Any number of readers may
/// take snapshots or subscribe to changes; a reader always sees a complete
/// value.
#[derive(Debug)]
pub struct StateRegister {
    tx: watch::Sender<EngineState>,
}

impl StateRegister {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(EngineState::Uninitialized);
        Self { tx }
    }

    pub fn current(&self) -> EngineState {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<EngineState> {
        self.tx.subscribe()
    }

    /// Fail with `IllegalStateTransition` unless `allowed` accepts the current state.
    pub(crate) fn require(
        &self,
        operation: &'static str,
        required: &'static str,
        allowed: impl Fn(&EngineState) -> bool,
    ) -> Result<EngineState> {
        let current = self.current();
        if allowed(&current) {
            Ok(current)
        } else {
            log::warn!(
                "Rejected '{}' in state {} (requires {})",
                operation,
                current.name(),
                required
            );
            Err(EngineError::IllegalStateTransition {
                operation,
                current: current.name(),
                required,
            })
        }
    }

    /// Move to `next` if the transition table allows it.
    pub(crate) fn transition(&self, next: EngineState) -> Result<()> {
        let current = self.current();
        if !current.can_transition_to(&next) {
            log::error!("Illegal state transition {} -> {}", current, next);
            return Err(EngineError::IllegalStateTransition {
                operation: "transition",
                current: current.name(),
                required: next.name(),
            });
        }
        log::info!("Engine state: {} -> {}", current.name(), next);
        self.tx.send_replace(next);
        Ok(())
    }
}

impl Default for StateRegister {
    fn default() -> Self {
        Self::new()
    }
}
