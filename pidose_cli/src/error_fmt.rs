//! Human-readable error descriptions and structured JSON error formatting.

use pidose_core::error::{BuildError, DoserError, SubscriptionError};
use serde_json::json;

/// Map an eyre::Report to a human-readable explanation with likely causes and fix hints.
pub fn humanize(err: &eyre::Report) -> String {
    // Typed matches first
    if let Some(be) = err.downcast_ref::<BuildError>() {
        return match be {
            BuildError::MissingTransport | BuildError::MissingRelay => format!(
                "What happened: The controller was built without a {}.\nLikely causes: A driver failed to initialize and was not wired into the builder.\nHow to fix: Check the log lines above for the driver error, then rerun.",
                if matches!(be, BuildError::MissingTransport) { "scale transport" } else { "relay" }
            ),
            BuildError::MissingAddress => {
                "What happened: No scale address is known.\nLikely causes: scale.address is empty and discovery was skipped.\nHow to fix: Set scale.address in the config, or run `pidose scan` and copy an address from it.".to_string()
            }
            BuildError::InvalidConfig(msg) => format!(
                "What happened: Invalid configuration ({msg}).\nLikely causes: Missing or out-of-range values in the TOML or on the command line.\nHow to fix: Edit the config file (or the --grams value), then rerun."
            ),
        };
    }

    if let Some(de) = err.downcast_ref::<DoserError>() {
        return match de {
            DoserError::ConnectionFailure { attempts, cause } => format!(
                "What happened: Could not connect to the scale after {attempts} attempt(s) (last error: {cause}).\nLikely causes: Scale switched off or asleep, out of range, or a wrong scale.address.\nHow to fix: Wake the scale, move it closer, check the address with `pidose scan`, or raise scale.dose_connect_tries."
            ),
            DoserError::SubscriptionFailure(SubscriptionError::NoSample { tries }) => format!(
                "What happened: The scale never sent a readable weight ({tries} checks).\nLikely causes: Wrong scale.characteristic or scale.weight_offset, or the scale stopped notifying.\nHow to fix: Run `pidose watch` to see raw readings, fix the characteristic/offset, or raise subscription.tries."
            ),
            DoserError::SubscriptionFailure(SubscriptionError::Rejected(cause)) => format!(
                "What happened: The scale refused the weight subscription ({cause}).\nLikely causes: Wrong scale.characteristic, or the link dropped while subscribing.\nHow to fix: Check the characteristic UUID in the config and press the button again."
            ),
            DoserError::CancelledDose => {
                "What happened: The dose was cancelled before it finished.\nLikely causes: A second button press, or Ctrl-C.\nHow to fix: Nothing to fix; start a new dose when ready.".to_string()
            }
            DoserError::MaxRuntime { limit_ms } => format!(
                "What happened: max run time was exceeded ({limit_ms} ms with the relay on).\nLikely causes: Empty hopper, jammed grinder, or a target too high for the limit.\nHow to fix: Check the grinder, or increase dose.max_run_ms (0 disables the limit)."
            ),
            DoserError::Relay(cause) => format!(
                "What happened: The relay could not be switched ({cause}).\nLikely causes: Wrong pins.relay, or no permission to access GPIO.\nHow to fix: Fix [pins] in the config; ensure the process may access /dev/gpiomem."
            ),
            DoserError::DecodeFailure(e) => format!(
                "What happened: {e}.\nLikely causes: scale.weight_offset does not match the scale's frame layout.\nHow to fix: Run `pidose watch --log-level=debug` and adjust scale.weight_offset."
            ),
        };
    }

    if let Some(te) = err.downcast_ref::<toml::de::Error>() {
        return format!(
            "What happened: The config file is not valid TOML for pidose.\nLikely causes: A typo, a wrong value type, or an unknown section.\nHow to fix: Fix the file and rerun. Parser said: {}",
            te.message()
        );
    }

    // String-based heuristics for errors coming from init or config
    let msg = err.to_string();
    let lower = msg.to_ascii_lowercase();

    if lower.contains("invalid configuration") {
        let detail = err.root_cause().to_string();
        return format!(
            "What happened: Configuration is invalid ({detail}).\nLikely causes: Out-of-range values in the TOML.\nHow to fix: Edit the config file and try again."
        );
    }

    if lower.contains("reading config") {
        return format!(
            "What happened: The config file could not be read ({msg}).\nLikely causes: Wrong --config path or missing permissions.\nHow to fix: Pass an existing file with --config, or omit it to use defaults."
        );
    }

    if lower.contains("no scale address") {
        return "What happened: No scale address configured and no scale was found nearby.\nLikely causes: Scale switched off or out of range.\nHow to fix: Wake the scale and rerun, or set scale.address in the config.".to_string();
    }

    if lower.contains("relay pin") || lower.contains("button pin") {
        return "What happened: Failed to initialize GPIO pins.\nLikely causes: Incorrect pin numbers or insufficient GPIO permissions.\nHow to fix: Fix the [pins] values in the config; ensure the process has permission to access GPIO.".to_string();
    }

    if lower.contains("bluetooth") {
        return "What happened: The Bluetooth adapter could not be opened.\nLikely causes: Adapter powered off, bluetoothd not running, or missing permissions.\nHow to fix: Run `bluetoothctl power on` and check that bluetoothd is active.".to_string();
    }

    // Generic fallback
    let mut cause = String::new();
    if let Some(src) = err.source() {
        cause = format!(" Cause: {src}");
    }
    format!(
        "Something went wrong.{cause}\nHow to fix: Re-run with --log-level=debug for details. Original: {msg}"
    )
}

/// Stable reason names used in JSON output.
pub fn reason_name(e: &DoserError) -> &'static str {
    match e {
        DoserError::ConnectionFailure { .. } => "ConnectionFailure",
        DoserError::SubscriptionFailure(_) => "SubscriptionFailure",
        DoserError::CancelledDose => "CancelledDose",
        DoserError::DecodeFailure(_) => "DecodeFailure",
        DoserError::Relay(_) => "Relay",
        DoserError::MaxRuntime { .. } => "MaxRuntime",
    }
}

/// Map domain errors to stable exit codes; everything else exits 1.
pub fn exit_code_for_error(err: &eyre::Report) -> u8 {
    match err.downcast_ref::<DoserError>() {
        Some(DoserError::ConnectionFailure { .. }) => 3,
        Some(DoserError::SubscriptionFailure(_)) => 4,
        Some(DoserError::CancelledDose) => 5,
        Some(DoserError::MaxRuntime { .. }) => 6,
        _ => 1,
    }
}

/// Structured JSON for errors when --json is enabled.
pub fn format_error_json(err: &eyre::Report) -> String {
    let msg = humanize(err);
    let Some(de) = err.downcast_ref::<DoserError>() else {
        return json!({ "reason": "Error", "message": msg }).to_string();
    };
    let details = match de {
        DoserError::ConnectionFailure { attempts, cause } => {
            Some(json!({ "attempts": attempts, "cause": cause }))
        }
        DoserError::SubscriptionFailure(SubscriptionError::NoSample { tries }) => {
            Some(json!({ "tries": tries }))
        }
        DoserError::MaxRuntime { limit_ms } => Some(json!({ "max_run_ms": limit_ms })),
        _ => None,
    };
    match details {
        Some(d) => json!({ "reason": reason_name(de), "details": d, "message": msg }),
        None => json!({ "reason": reason_name(de), "message": msg }),
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::WrapErr;

    #[test]
    fn exit_codes_follow_domain_errors_through_context() {
        let conn: eyre::Report = DoserError::ConnectionFailure {
            attempts: 3,
            cause: "peripheral not connected".into(),
        }
        .into();
        assert_eq!(exit_code_for_error(&conn), 3);

        let wrapped = Err::<(), _>(DoserError::SubscriptionFailure(SubscriptionError::NoSample {
            tries: 20,
        }))
        .wrap_err("dose failed")
        .unwrap_err();
        assert_eq!(exit_code_for_error(&wrapped), 4);

        assert_eq!(exit_code_for_error(&DoserError::CancelledDose.into()), 5);
        assert_eq!(
            exit_code_for_error(&DoserError::MaxRuntime { limit_ms: 10 }.into()),
            6
        );
        assert_eq!(exit_code_for_error(&eyre::eyre!("boom")), 1);
    }

    #[test]
    fn json_error_carries_reason_and_details() {
        let err: eyre::Report = DoserError::MaxRuntime { limit_ms: 250 }.into();
        let v: serde_json::Value = serde_json::from_str(&format_error_json(&err)).unwrap();
        assert_eq!(v["reason"], "MaxRuntime");
        assert_eq!(v["details"]["max_run_ms"], 250);
        assert!(v["message"].as_str().unwrap().contains("max run time"));

        let generic = format_error_json(&eyre::eyre!("boom"));
        let v: serde_json::Value = serde_json::from_str(&generic).unwrap();
        assert_eq!(v["reason"], "Error");
    }

    #[test]
    fn config_validation_errors_name_the_field() {
        let err = Err::<(), _>(eyre::eyre!("dose.target_g must be > 0"))
            .wrap_err("invalid configuration")
            .unwrap_err();
        let text = humanize(&err);
        assert!(text.contains("dose.target_g must be > 0"), "{text}");
        assert!(text.starts_with("What happened"));
    }
}
