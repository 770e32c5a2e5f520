use pidose_config::load_toml;
use rstest::rstest;
use std::fs;
use tempfile::tempdir;

const FULL: &str = r#"
[scale]
address = "00:1C:97:1A:2B:3C"
characteristic = "0000ffe1-0000-1000-8000-00805f9b34fb"
weight_offset = 3
connect_timeout_ms = 4000
auto_reconnect = true
startup_connect_tries = 10
dose_connect_tries = 100

[dose]
target_g = 16.0
tolerance_g = 1.0
poll_ms = 100

[subscription]
tries = 20
interval_ms = 500

[pins]
relay = 17
button = 27
relay_active_low = true

[logging]
file = "pidose.log"
rotation = "daily"
"#;

#[test]
fn accepts_full_config_from_disk() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("pidose.toml");
    fs::write(&path, FULL).unwrap();

    let text = fs::read_to_string(&path).unwrap();
    let cfg = load_toml(&text).expect("parse TOML");
    cfg.validate().expect("valid config should pass");
    assert_eq!(cfg.scale.address, "00:1C:97:1A:2B:3C");
    assert!(cfg.scale.auto_reconnect);
    assert!(cfg.pins.relay_active_low);
    assert_eq!(cfg.logging.rotation.as_deref(), Some("daily"));
}

#[rstest]
#[case("[dose]\ntarget_g = 0.0\n", "target_g must be > 0")]
#[case("[dose]\ntarget_g = -3.0\n", "target_g must be > 0")]
#[case("[dose]\ntarget_g = 12000.0\n", "exceeds what the scale can report")]
#[case("[dose]\ntarget_g = 2.0\ntolerance_g = 2.0\n", "smaller than dose.target_g")]
#[case("[dose]\ntolerance_g = -0.5\n", "tolerance_g must be >= 0")]
#[case("[dose]\npoll_ms = 0\n", "poll_ms must be >= 1")]
#[case("[dose]\npoll_ms = 200\nmax_run_ms = 50\n", "max_run_ms must be 0")]
#[case("[subscription]\ntries = 0\n", "subscription.tries must be >= 1")]
#[case("[subscription]\ninterval_ms = 0\n", "interval_ms must be >= 1")]
#[case("[scale]\nstartup_connect_tries = 0\n", "startup_connect_tries must be >= 1")]
#[case("[scale]\ndose_connect_tries = 0\n", "dose_connect_tries must be >= 1")]
#[case("[scale]\nconnect_timeout_ms = 0\n", "connect_timeout_ms must be >= 1")]
#[case("[scale]\ncharacteristic = \"  \"\n", "characteristic must not be empty")]
#[case("[pins]\nrelay = 5\nbutton = 5\n", "must differ")]
#[case("[logging]\nrotation = \"weekly\"\n", "never|daily|hourly")]
fn rejects_invalid_values(#[case] toml: &str, #[case] needle: &str) {
    let cfg = load_toml(toml).expect("parse TOML");
    let err = cfg.validate().expect_err("should reject");
    let msg = format!("{err}");
    assert!(msg.contains(needle), "message {msg:?} lacks {needle:?}");
}

#[test]
fn rejects_wrong_types_at_parse_time() {
    assert!(load_toml("[dose]\ntarget_g = \"lots\"\n").is_err());
}
