#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    // Parsing and validation may reject input but must never panic.
    if let Ok(cfg) = pidose_config::load_toml(data) {
        let _ = cfg.validate();
        let _ = pidose_core::DoseSettings::from(&cfg);
    }
});
