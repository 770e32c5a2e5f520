//! `From` implementations bridging `pidose_config` types to `pidose_core` types.

use std::time::Duration;

use crate::config::{DoseSettings, ScaleAddress};

impl From<&pidose_config::Config> for DoseSettings {
    fn from(c: &pidose_config::Config) -> Self {
        Self {
            address: ScaleAddress::new(c.scale.address.as_str()),
            characteristic: c.scale.characteristic.clone(),
            weight_offset: c.scale.weight_offset,
            target_g: c.dose.target_g,
            tolerance_g: c.dose.tolerance_g,
            connect_timeout: Duration::from_millis(c.scale.connect_timeout_ms),
            auto_reconnect: c.scale.auto_reconnect,
            startup_connect_tries: c.scale.startup_connect_tries,
            dose_connect_tries: c.scale.dose_connect_tries,
            subscribe_tries: c.subscription.tries,
            subscribe_interval: Duration::from_millis(c.subscription.interval_ms),
            poll_interval: Duration::from_millis(c.dose.poll_ms),
            max_run: (c.dose.max_run_ms > 0).then(|| Duration::from_millis(c.dose.max_run_ms)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stock_config_matches_stock_settings() {
        let cfg = pidose_config::Config::default();
        let s = DoseSettings::from(&cfg);
        let d = DoseSettings::default();
        assert_eq!(s.characteristic, d.characteristic);
        assert_eq!(s.weight_offset, d.weight_offset);
        assert_eq!(s.target_g, d.target_g);
        assert_eq!(s.tolerance_g, d.tolerance_g);
        assert_eq!(s.startup_connect_tries, d.startup_connect_tries);
        assert_eq!(s.dose_connect_tries, d.dose_connect_tries);
        assert_eq!(s.subscribe_tries, d.subscribe_tries);
        assert_eq!(s.subscribe_interval, d.subscribe_interval);
        assert_eq!(s.poll_interval, d.poll_interval);
        assert_eq!(s.connect_timeout, d.connect_timeout);
        assert!(s.max_run.is_none());
        assert!(s.address.is_empty());
    }

    #[test]
    fn address_is_trimmed_and_max_run_enabled() {
        let mut cfg = pidose_config::Config::default();
        cfg.scale.address = " 00:1C:97:1A:2B:3C \n".into();
        cfg.dose.max_run_ms = 30_000;
        let s = DoseSettings::from(&cfg);
        assert_eq!(s.address.as_str(), "00:1C:97:1A:2B:3C");
        assert_eq!(s.max_run, Some(Duration::from_secs(30)));
    }
}
