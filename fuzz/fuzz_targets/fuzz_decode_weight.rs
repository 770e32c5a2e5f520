#![no_main]
use libfuzzer_sys::fuzz_target;
use pidose_core::{WeightSlot, decode_weight};

fuzz_target!(|input: (u8, &[u8])| {
    let (offset, payload) = input;
    let offset = usize::from(offset);
    let slot = WeightSlot::new();
    match decode_weight(payload, offset) {
        Ok(dg) => {
            assert!(dg <= 99_999);
            assert_eq!(slot.record(payload, offset), Ok(dg));
            assert!(slot.sample().is_valid());
        }
        Err(_) => {
            assert!(slot.record(payload, offset).is_err());
            assert!(!slot.sample().is_valid());
        }
    }
});
