//! Builder for `DoseController`.
//!
//! Transport and relay are mandatory; settings default to the stock setup.
//! `build()` returns an `eyre::Result` whose report wraps a typed
//! [`BuildError`], so callers can `downcast_ref::<BuildError>()`.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use crossbeam_channel as xch;
use eyre::WrapErr;
use pidose_traits::clock::{Clock, MonotonicClock};
use pidose_traits::{Relay, Transport};

use crate::config::{DoseSettings, ScaleAddress};
use crate::connection::ConnectionManager;
use crate::controller::{DoseController, Inner, REPORT_QUEUE};
use crate::error::BuildError;
use crate::session::SessionSlot;
use crate::status::StateCell;
use crate::telemetry::TelemetryChannel;

pub struct DoseControllerBuilder<T, R> {
    transport: Option<T>,
    relay: Option<R>,
    settings: Option<DoseSettings>,
    address: Option<ScaleAddress>,
    target_g: Option<f32>,
    clock: Option<Arc<dyn Clock + Send + Sync>>,
}

impl<T, R> Default for DoseControllerBuilder<T, R> {
    fn default() -> Self {
        Self {
            transport: None,
            relay: None,
            settings: None,
            address: None,
            target_g: None,
            clock: None,
        }
    }
}

impl<T, R> DoseControllerBuilder<T, R>
where
    T: Transport + 'static,
    R: Relay + Send + Sync + 'static,
{
    pub fn with_transport(mut self, transport: T) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_relay(mut self, relay: R) -> Self {
        self.relay = Some(relay);
        self
    }

    pub fn with_settings(mut self, settings: DoseSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Overrides `settings.address`.
    pub fn with_address(mut self, address: impl Into<ScaleAddress>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Overrides `settings.target_g`.
    pub fn with_target_grams(mut self, grams: f32) -> Self {
        self.target_g = Some(grams);
        self
    }

    /// Clock used for polling sleeps and elapsed time (tests inject a fake).
    pub fn with_clock(mut self, clock: impl Clock + Send + Sync + 'static) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    pub fn build(self) -> eyre::Result<DoseController<T, R>> {
        let transport = self.transport.ok_or(BuildError::MissingTransport)?;
        let relay = self.relay.ok_or(BuildError::MissingRelay)?;
        let mut settings = self.settings.unwrap_or_default();
        if let Some(a) = self.address {
            settings.address = a;
        }
        if let Some(g) = self.target_g {
            settings.target_g = g;
        }
        validate(&settings)?;

        // the controller starts idle: relay off
        relay
            .off()
            .map_err(|e| eyre::eyre!("{e}"))
            .wrap_err("driving relay off at startup")?;

        let connection = ConnectionManager::new(
            transport,
            settings.address.clone(),
            settings.connect_timeout,
            settings.auto_reconnect,
            settings.startup_connect_tries,
            settings.dose_connect_tries,
        );
        let telemetry = TelemetryChannel::new(settings.characteristic.clone(), settings.weight_offset);
        let (reports_tx, reports_rx) = xch::bounded(REPORT_QUEUE);
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(MonotonicClock::new()) as Arc<dyn Clock + Send + Sync>);

        Ok(DoseController {
            inner: Arc::new(Inner {
                settings,
                relay,
                connection,
                telemetry,
                slot: SessionSlot::new(),
                cancel: Arc::new(AtomicBool::new(false)),
                state: StateCell::default(),
                clock,
                reports_tx,
                reports_rx,
                worker: Mutex::new(None),
            }),
        })
    }
}

fn validate(s: &DoseSettings) -> Result<(), BuildError> {
    if s.address.is_empty() {
        return Err(BuildError::MissingAddress);
    }
    if !s.target_g.is_finite() || s.target_g <= 0.0 {
        return Err(BuildError::InvalidConfig("target_g must be > 0"));
    }
    if !s.tolerance_g.is_finite() || s.tolerance_g < 0.0 {
        return Err(BuildError::InvalidConfig("tolerance_g must be >= 0"));
    }
    if s.tolerance_g >= s.target_g {
        return Err(BuildError::InvalidConfig(
            "tolerance_g must be smaller than target_g",
        ));
    }
    if s.characteristic.trim().is_empty() {
        return Err(BuildError::InvalidConfig("characteristic must not be empty"));
    }
    if s.poll_interval.is_zero() {
        return Err(BuildError::InvalidConfig("poll interval must be > 0"));
    }
    if s.subscribe_tries == 0 || s.subscribe_interval.is_zero() {
        return Err(BuildError::InvalidConfig(
            "subscription wait needs tries >= 1 and a non-zero interval",
        ));
    }
    Ok(())
}
