//! Component lifecycle state machine
//!
//! Long-lived components (processors, engines, transports) report their
//! state through this machine. Transitions are validated; `Failed` is
//! reachable from any transient state. Reading the state is a lock-free
//! atomic load.

use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    NotInitialized = 0,
    Initializing = 1,
    Initialized = 2,
    Starting = 3,
    Started = 4,
    Stopping = 5,
    Stopped = 6,
    Disposed = 7,
    Failed = 8,
}

impl LifecycleState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LifecycleState::NotInitialized,
            1 => LifecycleState::Initializing,
            2 => LifecycleState::Initialized,
            3 => LifecycleState::Starting,
            4 => LifecycleState::Started,
            5 => LifecycleState::Stopping,
            6 => LifecycleState::Stopped,
            7 => LifecycleState::Disposed,
            _ => LifecycleState::Failed,
        }
    }

    /// States a component passes through, as opposed to resting in.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LifecycleState::Initializing | LifecycleState::Starting | LifecycleState::Stopping
        )
    }

    pub fn is_running(&self) -> bool {
        *self == LifecycleState::Started
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LifecycleState::NotInitialized => "not_initialized",
            LifecycleState::Initializing => "initializing",
            LifecycleState::Initialized => "initialized",
            LifecycleState::Starting => "starting",
            LifecycleState::Started => "started",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Disposed => "disposed",
            LifecycleState::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Invalid lifecycle transition {from} -> {to}")]
pub struct LifecycleError {
    pub from: LifecycleState,
    pub to: LifecycleState,
}

/// Atomic lifecycle cell.
#[derive(Debug)]
pub struct Lifecycle {
    state: AtomicU8,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(LifecycleState::NotInitialized as u8),
        }
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn allowed(from: LifecycleState, to: LifecycleState) -> bool {
        use LifecycleState::*;
        match (from, to) {
            (NotInitialized, Initializing) => true,
            (Initializing, Initialized) => true,
            (Initialized, Starting) => true,
            (Stopped, Starting) => true,
            (Starting, Started) => true,
            (Started, Stopping) => true,
            (Stopping, Stopped) => true,
            (Initialized, Disposed) | (Stopped, Disposed) | (Failed, Disposed) => true,
            // Failure from any transient state.
            (from, Failed) if from.is_transient() => true,
            _ => false,
        }
    }

    /// Attempt a transition, returning the previous state on success.
    pub fn transition(&self, to: LifecycleState) -> Result<LifecycleState, LifecycleError> {
        loop {
            let current = self.state();
            if !Self::allowed(current, to) {
                return Err(LifecycleError {
                    from: current,
                    to,
                });
            }
            if self
                .state
                .compare_exchange(
                    current as u8,
                    to as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return Ok(current);
            }
        }
    }

    /// Run the full NotInitialized -> Started ramp.
    pub fn mark_started(&self) -> Result<(), LifecycleError> {
        if self.state() == LifecycleState::NotInitialized {
            self.transition(LifecycleState::Initializing)?;
            self.transition(LifecycleState::Initialized)?;
        }
        self.transition(LifecycleState::Starting)?;
        self.transition(LifecycleState::Started)?;
        Ok(())
    }

    pub fn mark_stopped(&self) -> Result<(), LifecycleError> {
        self.transition(LifecycleState::Stopping)?;
        self.transition(LifecycleState::Stopped)?;
        Ok(())
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
