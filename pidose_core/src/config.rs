//! Runtime settings for the dose controller.
use std::fmt;
use std::time::Duration;

/// Peripheral address as given to the transport (e.g. `00:1C:97:1A:2B:3C`).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScaleAddress(String);

impl ScaleAddress {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ScaleAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ScaleAddress {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ScaleAddress {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

#[derive(Debug, Clone)]
pub struct DoseSettings {
    pub address: ScaleAddress,
    pub characteristic: String,
    pub weight_offset: usize,
    pub target_g: f32,
    pub tolerance_g: f32,
    pub connect_timeout: Duration,
    pub auto_reconnect: bool,
    pub startup_connect_tries: u32,
    pub dose_connect_tries: u32,
    pub subscribe_tries: u32,
    pub subscribe_interval: Duration,
    pub poll_interval: Duration,
    /// `None` disables the relay-on time limit.
    pub max_run: Option<Duration>,
}

impl Default for DoseSettings {
    fn default() -> Self {
        Self {
            address: ScaleAddress::default(),
            characteristic: "0000ffe1-0000-1000-8000-00805f9b34fb".to_string(),
            weight_offset: 3,
            target_g: 16.0,
            tolerance_g: 1.0,
            connect_timeout: Duration::from_secs(5),
            auto_reconnect: false,
            startup_connect_tries: 10,
            dose_connect_tries: 100,
            subscribe_tries: 20,
            subscribe_interval: Duration::from_millis(500),
            poll_interval: Duration::from_millis(100),
            max_run: None,
        }
    }
}
