#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! Core dosing logic (hardware-agnostic).
//!
//! All radio and GPIO access goes through the `pidose_traits` seams
//! (`Transport`/`Peripheral` for the scale, `Relay` for the pump). The crate
//! provides:
//!
//! - **Telemetry**: decoding of the five-digit weight window and the shared
//!   latest-weight slot (`telemetry`)
//! - **Connection**: bounded-retry connect and the lazily created handle
//!   (`connection`)
//! - **Sessions**: the single-flight lock and per-dose progress (`session`)
//! - **Control**: the button-driven `DoseController` and its builder
//!
//! ## Fixed-Point Arithmetic
//!
//! The scale reports tenths of a gram, so thresholds are kept in decigrams
//! (`i32`). See `fixed_point`.

pub mod builder;
pub mod config;
pub mod connection;
pub mod controller;
pub mod conversions;
pub mod error;
pub mod fixed_point;
pub mod hw_error;
pub mod mocks;
pub mod session;
pub mod status;
pub mod telemetry;

pub use builder::DoseControllerBuilder;
pub use config::{DoseSettings, ScaleAddress};
pub use connection::{ConnectionManager, connect};
pub use controller::DoseController;
pub use error::{BuildError, DecodeError, DoserError, SubscriptionError};
pub use status::{DoseOutcome, DoseReport, DoseState, PressAction};
pub use telemetry::{TelemetryChannel, WeightSample, WeightSlot, decode_weight};
