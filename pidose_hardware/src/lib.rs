//! Concrete drivers behind the `pidose_traits` seams.
//!
//! - `sim` (always built): simulated scale link, relay and stdin button.
//! - `gpio` (`hardware` feature, Linux): relay and button on Raspberry Pi pins.
//! - `ble` (`ble` feature): btleplug transport for the scale.
pub mod error;
pub mod sim;

#[cfg(all(feature = "hardware", target_os = "linux"))]
pub mod gpio;

#[cfg(feature = "ble")]
pub mod ble;

pub use sim::{SimParams, SimPeripheral, SimRelay, SimScale, SimTransport, StdinButton};
