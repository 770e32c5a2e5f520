//! Bring-up commands that never switch the relay on: watch, scan, self-check.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use eyre::WrapErr;
use pidose_config::Config;
use pidose_core::{DoserError, ScaleAddress, TelemetryChannel, WeightSample, connect};
use pidose_traits::clock::{Clock, MonotonicClock};
use pidose_traits::{Relay, Transport};
use serde_json::json;
use tracing::info;

use crate::cli::json_mode;
use crate::rig::{self, ScaleTransport};

fn connect_scale(
    cfg: &Config,
    transport: &ScaleTransport,
) -> eyre::Result<(ScaleAddress, <ScaleTransport as Transport>::Peripheral)> {
    let address = rig::resolve_address(cfg, transport)?;
    let handle = connect(
        transport,
        &address,
        cfg.scale.startup_connect_tries,
        Duration::from_millis(cfg.scale.connect_timeout_ms),
        cfg.scale.auto_reconnect,
    )?;
    Ok((address, handle))
}

fn weight_line(seq: u32, sample: WeightSample) -> String {
    if json_mode() {
        let weight_g = sample.is_valid().then(|| sample.grams());
        return json!({ "seq": seq, "weight_g": weight_g }).to_string();
    }
    if sample.is_valid() {
        format!("weight: {:.1} g", sample.grams())
    } else {
        "weight: --".to_string()
    }
}

/// Subscribe and print the latest weight `count` times, `interval` apart.
pub fn watch(
    cfg: &Config,
    count: u32,
    interval: Duration,
    shutdown: &Arc<AtomicBool>,
) -> eyre::Result<()> {
    let rig = rig::assemble(cfg)?;
    let (address, handle) = connect_scale(cfg, &rig.transport)?;
    let telemetry = TelemetryChannel::new(cfg.scale.characteristic.clone(), cfg.scale.weight_offset);
    telemetry.subscribe(&handle).map_err(DoserError::from)?;
    info!(%address, count, "watching weight");

    let clock = MonotonicClock::new();
    for seq in 1..=count {
        if shutdown.load(Ordering::Acquire) {
            break;
        }
        clock.sleep(interval);
        println!("{}", weight_line(seq, telemetry.slot().sample()));
    }

    telemetry.unsubscribe(&handle);
    let (frames, bad) = telemetry.slot().frame_counts();
    info!(frames, bad, "frames received");
    Ok(())
}

/// Print nearby scale addresses, one per line.
pub fn scan(cfg: &Config, timeout: Duration) -> eyre::Result<()> {
    let rig = rig::assemble(cfg)?;
    let found = rig
        .transport
        .discover(timeout)
        .map_err(|e| eyre::eyre!(e))
        .wrap_err("scanning for scales")?;
    if json_mode() {
        println!("{}", json!({ "addresses": found }));
    } else if found.is_empty() {
        println!("no scales found");
    } else {
        for addr in &found {
            println!("{addr}");
        }
    }
    Ok(())
}

/// Relay forced off, then a startup-bound connect to the scale.
pub fn self_check(cfg: &Config) -> eyre::Result<()> {
    let rig = rig::assemble(cfg)?;
    rig.relay
        .off()
        .map_err(|e| DoserError::Relay(e.to_string()))?;
    let (address, _handle) = connect_scale(cfg, &rig.transport)?;
    if json_mode() {
        println!(
            "{}",
            json!({ "ok": true, "scale": address.as_str(), "relay_on": rig.relay.is_on() })
        );
    } else {
        println!("relay: off");
        println!("scale: reachable at {address}");
        println!("self-check ok");
    }
    Ok(())
}
