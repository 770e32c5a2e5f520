#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
//! Config schema for the dosing service.
//!
//! Every section has built-in defaults, so an empty TOML file yields the stock
//! setup (16 g target, 1 g tolerance, 10/100 connect tries, 20 x 500 ms
//! subscription wait, 100 ms weight polling). `Config::validate` rejects values
//! the controller cannot honour.
use serde::Deserialize;

/// Largest weight the five-digit telemetry window can carry, in grams.
pub const MAX_REPORTABLE_G: f32 = 9_999.9;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ScaleCfg {
    /// Peripheral address; empty means "use the first discovered scale".
    pub address: String,
    /// Weight notification characteristic.
    pub characteristic: String,
    /// Offset of the five ASCII weight digits inside each notification.
    pub weight_offset: usize,
    /// Per-attempt connect timeout handed to the transport.
    pub connect_timeout_ms: u64,
    pub auto_reconnect: bool,
    /// Connect attempts at startup (failure leaves the scale unconnected).
    pub startup_connect_tries: u32,
    /// Connect attempts when a dose needs the scale (failure aborts the dose).
    pub dose_connect_tries: u32,
    /// How long `scan` and address discovery listen for advertisements.
    pub discover_ms: u64,
}

impl Default for ScaleCfg {
    fn default() -> Self {
        Self {
            address: String::new(),
            characteristic: "0000ffe1-0000-1000-8000-00805f9b34fb".to_string(),
            weight_offset: 3,
            connect_timeout_ms: 5_000,
            auto_reconnect: false,
            startup_connect_tries: 10,
            dose_connect_tries: 100,
            discover_ms: 5_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct DoseCfg {
    pub target_g: f32,
    /// The relay closes once `weight + tolerance_g >= target_g`.
    pub tolerance_g: f32,
    /// Weight polling interval while the relay is on.
    pub poll_ms: u64,
    /// Upper bound on relay-on time per dose; 0 disables the limit.
    pub max_run_ms: u64,
}

impl Default for DoseCfg {
    fn default() -> Self {
        Self {
            target_g: 16.0,
            tolerance_g: 1.0,
            poll_ms: 100,
            max_run_ms: 0,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct SubscriptionCfg {
    /// Checks for a first valid sample before giving up on the subscription.
    pub tries: u32,
    pub interval_ms: u64,
}

impl Default for SubscriptionCfg {
    fn default() -> Self {
        Self {
            tries: 20,
            interval_ms: 500,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct Pins {
    pub relay: u8,
    pub button: u8,
    /// Relay boards that energise on a low level.
    pub relay_active_low: bool,
    pub button_pull_up: bool,
    pub button_debounce_ms: u64,
}

impl Default for Pins {
    fn default() -> Self {
        Self {
            relay: 17,
            button: 27,
            relay_active_low: false,
            button_pull_up: true,
            button_debounce_ms: 50,
        }
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct Logging {
    pub file: Option<String>,  // path to .log (JSON lines)
    pub level: Option<String>, // "info","debug"
    /// Log rotation policy: "never" | "daily" | "hourly" (default: never)
    pub rotation: Option<String>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct Config {
    pub scale: ScaleCfg,
    pub dose: DoseCfg,
    pub subscription: SubscriptionCfg,
    pub pins: Pins,
    pub logging: Logging,
}

pub fn load_toml(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str::<Config>(s)
}

impl Config {
    pub fn validate(&self) -> eyre::Result<()> {
        // Scale
        if self.scale.characteristic.trim().is_empty() {
            eyre::bail!("scale.characteristic must not be empty");
        }
        if self.scale.connect_timeout_ms == 0 {
            eyre::bail!("scale.connect_timeout_ms must be >= 1");
        }
        if self.scale.startup_connect_tries == 0 {
            eyre::bail!("scale.startup_connect_tries must be >= 1");
        }
        if self.scale.dose_connect_tries == 0 {
            eyre::bail!("scale.dose_connect_tries must be >= 1");
        }
        if self.scale.weight_offset > 512 {
            eyre::bail!("scale.weight_offset is unreasonably large (>512)");
        }

        // Dose
        validate_target_g(self.dose.target_g)?;
        if !self.dose.tolerance_g.is_finite() || self.dose.tolerance_g < 0.0 {
            eyre::bail!("dose.tolerance_g must be >= 0");
        }
        if self.dose.tolerance_g >= self.dose.target_g {
            eyre::bail!("dose.tolerance_g must be smaller than dose.target_g");
        }
        if self.dose.poll_ms == 0 {
            eyre::bail!("dose.poll_ms must be >= 1");
        }
        if self.dose.poll_ms > 60_000 {
            eyre::bail!("dose.poll_ms is unreasonably large (>60s)");
        }
        if self.dose.max_run_ms != 0 && self.dose.max_run_ms < self.dose.poll_ms {
            eyre::bail!("dose.max_run_ms must be 0 (disabled) or >= dose.poll_ms");
        }

        // Subscription
        if self.subscription.tries == 0 {
            eyre::bail!("subscription.tries must be >= 1");
        }
        if self.subscription.interval_ms == 0 {
            eyre::bail!("subscription.interval_ms must be >= 1");
        }

        // Pins
        if self.pins.relay == self.pins.button {
            eyre::bail!("pins.relay and pins.button must differ");
        }

        // Logging
        if let Some(rot) = self.logging.rotation.as_deref()
            && !matches!(rot, "never" | "daily" | "hourly")
        {
            eyre::bail!("logging.rotation must be one of never|daily|hourly, got {rot}");
        }

        Ok(())
    }
}

/// Shared by config validation and the CLI `--grams` override.
pub fn validate_target_g(target_g: f32) -> eyre::Result<()> {
    if !target_g.is_finite() || target_g <= 0.0 {
        eyre::bail!("dose.target_g must be > 0");
    }
    if target_g > MAX_REPORTABLE_G {
        eyre::bail!("dose.target_g exceeds what the scale can report ({MAX_REPORTABLE_G} g)");
    }
    Ok(())
}
