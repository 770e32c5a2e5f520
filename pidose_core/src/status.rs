//! Controller state and per-dose outcomes.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use crate::error::DoserError;

/// Where the controller is in its dose lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DoseState {
    /// No session, relay off.
    Idle = 0,
    /// Session running, waiting for the connection and the first valid sample.
    Subscribing = 1,
    /// Relay on, polling weight.
    Dosing = 2,
    /// Cancellation requested; the session is tearing down.
    Cancelling = 3,
}

impl DoseState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Subscribing,
            2 => Self::Dosing,
            3 => Self::Cancelling,
            _ => Self::Idle,
        }
    }
}

impl std::fmt::Display for DoseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Subscribing => "subscribing",
            Self::Dosing => "dosing",
            Self::Cancelling => "cancelling",
        };
        f.write_str(s)
    }
}

/// Lock-free cell holding a [`DoseState`].
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl Default for StateCell {
    fn default() -> Self {
        Self(AtomicU8::new(DoseState::Idle as u8))
    }
}

impl StateCell {
    #[inline]
    pub fn get(&self) -> DoseState {
        DoseState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Store `next`, returning the previous state.
    #[inline]
    pub fn set(&self, next: DoseState) -> DoseState {
        DoseState::from_u8(self.0.swap(next as u8, Ordering::AcqRel))
    }

    /// Move `from -> to` only if the cell still holds `from`.
    #[inline]
    pub fn transition(&self, from: DoseState, to: DoseState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// What a button press did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressAction {
    /// A new dose session was started.
    Started,
    /// The running session (or a stray relay-on) was cancelled.
    Cancelled,
    /// The dosing thread could not be spawned; nothing is running.
    Refused,
}

/// How a dose session ended.
#[derive(Debug, Clone, PartialEq)]
pub enum DoseOutcome {
    /// Target reached; relay closed at `final_g`.
    Completed { final_g: f32 },
    /// Cancelled by the user while the relay was on.
    Cancelled { last_g: Option<f32> },
    Failed(DoserError),
}

impl DoseOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Published once per session after cleanup has run.
#[derive(Debug, Clone, PartialEq)]
pub struct DoseReport {
    pub outcome: DoseOutcome,
    pub target_g: f32,
    pub elapsed: Duration,
    /// Whether the session's own cleanup tried to unsubscribe.
    pub unsubscribe_attempted: bool,
}
