//! Dose execution: the button-driven `run` loop and the one-shot `dose`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam_channel::RecvTimeoutError;
use eyre::WrapErr;
use pidose_config::Config;
use pidose_core::{
    DoseController, DoseOutcome, DoseReport, DoseSettings, DoserError, PressAction,
};
use pidose_traits::Button;
use serde_json::json;
use tracing::{info, warn};

use crate::cli::json_mode;
use crate::error_fmt::reason_name;
use crate::rig::{self, PumpRelay, ScaleTransport};

/// How often the main thread looks at the Ctrl-C flag while waiting.
const WAKE: Duration = Duration::from_millis(100);
/// Upper bound on waiting for a cancelled session to clean up.
const SHUTDOWN_WAIT: Duration = Duration::from_secs(5);

type Controller = DoseController<ScaleTransport, PumpRelay>;

fn build_controller(cfg: &Config, settings: DoseSettings) -> eyre::Result<Controller> {
    let rig = rig::assemble(cfg)?;
    let address = rig::resolve_address(cfg, &rig.transport)?;
    DoseController::builder()
        .with_transport(rig.transport)
        .with_relay(rig.relay)
        .with_settings(settings)
        .with_address(address)
        .build()
}

/// Serve button presses until `shutdown` is set, then cancel anything in
/// flight (relay off, unsubscribe) and return.
pub fn run_controller(cfg: &Config, shutdown: &Arc<AtomicBool>) -> eyre::Result<()> {
    let controller = build_controller(cfg, DoseSettings::from(cfg))?;
    if !controller.connect_at_startup() {
        warn!("scale not reachable at startup; the first press will keep trying");
    }

    let mut button = rig::open_button(cfg)?;
    let ctl = controller.clone();
    button
        .when_pressed(Box::new(move || {
            let action = ctl.on_press();
            info!(?action, "button pressed");
        }))
        .map_err(|e| eyre::eyre!(e))
        .wrap_err("registering button handler")?;
    info!(
        target_g = controller.settings().target_g,
        address = %controller.settings().address,
        "ready"
    );

    let reports = controller.outcomes();
    while !shutdown.load(Ordering::Acquire) {
        match reports.recv_timeout(WAKE) {
            Ok(report) => print_report(&report),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    info!("shutting down");
    if !controller.shutdown(SHUTDOWN_WAIT) {
        warn!("dose thread did not finish in time; relay was driven off anyway");
    }
    while let Ok(report) = reports.try_recv() {
        print_report(&report);
    }
    Ok(())
}

/// Run one dose as if the button had been pressed; Ctrl-C cancels it.
pub fn run_dose(
    cfg: &Config,
    grams: Option<f32>,
    max_run_ms: Option<u64>,
    shutdown: &Arc<AtomicBool>,
) -> eyre::Result<()> {
    let mut settings = DoseSettings::from(cfg);
    if let Some(g) = grams {
        pidose_config::validate_target_g(g).wrap_err("invalid configuration")?;
        settings.target_g = g;
    }
    if let Some(ms) = max_run_ms {
        settings.max_run = (ms > 0).then(|| Duration::from_millis(ms));
    }
    let controller = build_controller(cfg, settings)?;
    let reports = controller.outcomes();

    match controller.on_press() {
        PressAction::Started => {}
        other => eyre::bail!("dose did not start ({other:?})"),
    }

    let mut cancel_sent = false;
    let report = loop {
        if !cancel_sent && shutdown.load(Ordering::Acquire) {
            info!("interrupted; cancelling dose");
            controller.cancel();
            cancel_sent = true;
        }
        match reports.recv_timeout(WAKE) {
            Ok(report) => break report,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                eyre::bail!("dose thread ended without a report")
            }
        }
    };
    controller.shutdown(SHUTDOWN_WAIT);

    print_report(&report);
    match report.outcome {
        DoseOutcome::Completed { .. } => Ok(()),
        DoseOutcome::Cancelled { .. } => Err(DoserError::CancelledDose.into()),
        DoseOutcome::Failed(e) => Err(e.into()),
    }
}

fn print_report(report: &DoseReport) {
    if json_mode() {
        println!("{}", report_json(report));
    } else {
        println!("{}", report_text(report));
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

pub fn report_text(report: &DoseReport) -> String {
    let ms = millis(report.elapsed);
    let target = report.target_g;
    match &report.outcome {
        DoseOutcome::Completed { final_g } => {
            format!("dose complete: {final_g:.1} g (target {target:.1} g) in {ms} ms")
        }
        DoseOutcome::Cancelled { last_g: Some(g) } => {
            format!("dose cancelled at {g:.1} g (target {target:.1} g) after {ms} ms")
        }
        DoseOutcome::Cancelled { last_g: None } => {
            format!("dose cancelled (target {target:.1} g) after {ms} ms")
        }
        DoseOutcome::Failed(e) => format!("dose failed after {ms} ms: {e}"),
    }
}

/// One JSON line per finished dose.
pub fn report_json(report: &DoseReport) -> serde_json::Value {
    let (outcome, final_g, reason) = match &report.outcome {
        DoseOutcome::Completed { final_g } => ("complete", Some(*final_g), None),
        DoseOutcome::Cancelled { last_g } => ("cancelled", *last_g, None),
        DoseOutcome::Failed(e) => ("failed", None, Some(reason_name(e))),
    };
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs());
    json!({
        "timestamp": timestamp,
        "outcome": outcome,
        "target_g": report.target_g,
        "final_g": final_g,
        "duration_ms": millis(report.elapsed),
        "reason": reason,
    })
}
