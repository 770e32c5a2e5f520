//! Hardware assembly: picks real drivers or the simulated rig per feature.
//!
//! Without `ble` the scale is simulated; without `hardware` (or off Linux)
//! the relay is simulated and the button reads lines from stdin. The
//! simulated relay and scale share state, so a fully simulated rig fills its
//! own cup.

use std::time::Duration;

use eyre::WrapErr;
use pidose_config::Config;
use pidose_core::ScaleAddress;
use pidose_hardware::sim::{self, SimParams};
use pidose_traits::Transport;
use tracing::{info, warn};

#[cfg(feature = "ble")]
pub type ScaleTransport = pidose_hardware::ble::BleTransport;
#[cfg(not(feature = "ble"))]
pub type ScaleTransport = pidose_hardware::SimTransport;

#[cfg(all(feature = "hardware", target_os = "linux"))]
pub type PumpRelay = pidose_hardware::gpio::GpioRelay;
#[cfg(not(all(feature = "hardware", target_os = "linux")))]
pub type PumpRelay = pidose_hardware::SimRelay;

#[cfg(all(feature = "hardware", target_os = "linux"))]
pub type PressButton = pidose_hardware::gpio::GpioButton;
#[cfg(not(all(feature = "hardware", target_os = "linux")))]
pub type PressButton = pidose_hardware::StdinButton;

pub struct Rig {
    pub transport: ScaleTransport,
    pub relay: PumpRelay,
}

pub fn assemble(cfg: &Config) -> eyre::Result<Rig> {
    let params = SimParams {
        weight_offset: cfg.scale.weight_offset,
        ..SimParams::from_env()
    };
    let (sim_transport, sim_relay, _scale) = sim::rig(params);

    #[cfg(feature = "ble")]
    let transport = {
        drop(sim_transport);
        pidose_hardware::ble::BleTransport::new().wrap_err("open bluetooth adapter")?
    };
    #[cfg(not(feature = "ble"))]
    let transport = {
        info!("using simulated scale");
        sim_transport
    };

    #[cfg(all(feature = "hardware", target_os = "linux"))]
    let relay = {
        drop(sim_relay);
        pidose_hardware::gpio::GpioRelay::new(cfg.pins.relay, cfg.pins.relay_active_low)
            .wrap_err("open relay pin")?
    };
    #[cfg(not(all(feature = "hardware", target_os = "linux")))]
    let relay = {
        info!("using simulated relay");
        sim_relay
    };

    if cfg!(feature = "ble") != cfg!(all(feature = "hardware", target_os = "linux")) {
        warn!("mixed real and simulated drivers; the scale will not see the relay's effect");
    }
    Ok(Rig { transport, relay })
}

#[cfg(all(feature = "hardware", target_os = "linux"))]
pub fn open_button(cfg: &Config) -> eyre::Result<PressButton> {
    pidose_hardware::gpio::GpioButton::new(
        cfg.pins.button,
        cfg.pins.button_pull_up,
        Duration::from_millis(cfg.pins.button_debounce_ms),
    )
    .wrap_err("open button pin")
}

#[cfg(not(all(feature = "hardware", target_os = "linux")))]
#[allow(clippy::unnecessary_wraps)]
pub fn open_button(_cfg: &Config) -> eyre::Result<PressButton> {
    info!("using stdin as the button: press Enter to dose or cancel");
    Ok(pidose_hardware::StdinButton::new())
}

/// The configured address, or the first one discovery finds.
pub fn resolve_address<T: Transport>(cfg: &Config, transport: &T) -> eyre::Result<ScaleAddress> {
    let configured = cfg.scale.address.trim();
    if !configured.is_empty() {
        return Ok(ScaleAddress::from(configured));
    }
    let timeout = Duration::from_millis(cfg.scale.discover_ms);
    info!(timeout_ms = cfg.scale.discover_ms, "no scale address configured; scanning");
    let found = transport
        .discover(timeout)
        .map_err(|e| eyre::eyre!(e))
        .wrap_err("scanning for scales")?;
    let Some(first) = found.into_iter().next() else {
        eyre::bail!("no scale address configured and none discovered nearby");
    };
    info!(address = %first, "using discovered scale");
    Ok(ScaleAddress::from(first))
}
