//! Sync lifecycle state machine.
//!
//! ```text
//! Stopped --Start--> BaseSyncing --BaseSyncComplete--> DeltaSyncing
//! DeltaSyncing --SubscriptionEstablished--> Ready
//! Ready --BatchReceived--> DeltaSyncing --BatchApplied--> Ready
//! any --Stop/Fatal--> Stopped
//! ```
//!
//! The table is pure; the runtime feeds it inputs and acts on the result.
//! [`ReadyLatch`] makes sure `ready` fires once per start cycle even though
//! the machine passes through `Ready` many times.

use crate::{error::Result, Error};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Externally visible sync state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncState {
    #[default]
    Stopped,
    BaseSyncing,
    DeltaSyncing,
    Ready,
}

impl SyncState {
    /// Whether network tasks should be running in this state.
    pub fn is_running(self) -> bool {
        self != SyncState::Stopped
    }

    /// Next state for `input`, or [`Error::InvalidTransition`].
    pub fn transition(self, input: LifecycleInput) -> Result<SyncState> {
        use LifecycleInput::*;
        use SyncState::*;

        let next = match (self, input) {
            (_, Stop) | (_, Fatal) => Stopped,
            (Stopped, Start) => BaseSyncing,
            (BaseSyncing, BaseSyncComplete) => DeltaSyncing,
            (DeltaSyncing | Ready, SubscriptionEstablished) => Ready,
            (DeltaSyncing | Ready, BatchReceived) => DeltaSyncing,
            (DeltaSyncing | Ready, BatchApplied) => Ready,
            (state @ (DeltaSyncing | Ready), ConnectionLost) => state,
            (from, input) => {
                return Err(Error::InvalidTransition {
                    from: from.to_string(),
                    input: input.to_string(),
                })
            }
        };
        Ok(next)
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncState::Stopped => write!(f, "stopped"),
            SyncState::BaseSyncing => write!(f, "baseSyncing"),
            SyncState::DeltaSyncing => write!(f, "deltaSyncing"),
            SyncState::Ready => write!(f, "ready"),
        }
    }
}

/// Something that happened to the sync runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LifecycleInput {
    Start,
    BaseSyncComplete,
    SubscriptionEstablished,
    BatchReceived,
    BatchApplied,
    /// The subscription dropped; it is being re-established
    ConnectionLost,
    Stop,
    /// Unrecoverable error
    Fatal,
}

impl fmt::Display for LifecycleInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleInput::Start => "start",
            LifecycleInput::BaseSyncComplete => "baseSyncComplete",
            LifecycleInput::SubscriptionEstablished => "subscriptionEstablished",
            LifecycleInput::BatchReceived => "batchReceived",
            LifecycleInput::BatchApplied => "batchApplied",
            LifecycleInput::ConnectionLost => "connectionLost",
            LifecycleInput::Stop => "stop",
            LifecycleInput::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

/// Fires once per start cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadyLatch {
    fired: bool,
}

impl ReadyLatch {
    /// Returns true the first time it is called after a reset.
    pub fn fire(&mut self) -> bool {
        !std::mem::replace(&mut self.fired, true)
    }

    pub fn has_fired(&self) -> bool {
        self.fired
    }

    pub fn reset(&mut self) {
        self.fired = false;
    }
}

/// One applied transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: SyncState,
    pub to: SyncState,
    /// The `ready` event should be emitted now
    pub emit_ready: bool,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// State plus ready latch, owned by the runtime's coordinator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Lifecycle {
    state: SyncState,
    latch: ReadyLatch,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Feed an input; on error the state is unchanged.
    pub fn apply(&mut self, input: LifecycleInput) -> Result<Transition> {
        let from = self.state;
        let to = from.transition(input)?;

        if input == LifecycleInput::Start {
            self.latch.reset();
        }
        let emit_ready = to == SyncState::Ready && self.latch.fire();

        self.state = to;
        Ok(Transition {
            from,
            to,
            emit_ready,
        })
    }
}
