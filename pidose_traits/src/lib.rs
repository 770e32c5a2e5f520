pub mod clock;

pub use clock::{Clock, MonotonicClock};

use std::time::Duration;

/// Error type crossing every driver boundary; classified later by `pidose_core`.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Notification callback invoked with the raw payload of each telemetry frame.
pub type NotifyFn = Box<dyn Fn(&[u8]) + Send + Sync + 'static>;

/// Press callback registered on a button.
pub type PressFn = Box<dyn FnMut() + Send + 'static>;

/// Radio stack session. One per process; outlives every peripheral it hands out.
pub trait Transport: Send + Sync {
    type Peripheral: Peripheral + Send + Sync + 'static;

    fn connect(
        &self,
        address: &str,
        timeout: Duration,
        auto_reconnect: bool,
    ) -> Result<Self::Peripheral, BoxError>;

    /// Addresses of nearby scales. Transports without discovery report none.
    fn discover(&self, _timeout: Duration) -> Result<Vec<String>, BoxError> {
        Ok(Vec::new())
    }
}

/// A live connection to the scale.
pub trait Peripheral {
    fn subscribe(
        &self,
        characteristic: &str,
        callback: NotifyFn,
        wait_for_response: bool,
    ) -> Result<(), BoxError>;

    fn unsubscribe(&self, characteristic: &str, wait_for_response: bool) -> Result<(), BoxError>;
}

/// Digital output gating the pump/valve. `on`/`off` must be idempotent.
pub trait Relay {
    fn on(&self) -> Result<(), BoxError>;
    fn off(&self) -> Result<(), BoxError>;
    fn is_on(&self) -> bool;
}

/// Edge-triggered push-button.
pub trait Button {
    fn when_pressed(&mut self, callback: PressFn) -> Result<(), BoxError>;
}
