//! Weight telemetry: payload decoding, the shared latest-weight slot, and the
//! subscription wrapper around a peripheral's notification characteristic.
//!
//! Notifications arrive on whatever thread the transport uses for callbacks.
//! The callback only decodes and stores into atomics, so it never blocks the
//! transport and readers never see a torn value.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};

use pidose_traits::{NotifyFn, Peripheral};
use tracing::{debug, info, warn};

use crate::error::{DecodeError, SubscriptionError};
use crate::fixed_point::{SENTINEL_DG, dg_to_grams};

/// Number of ASCII digits in the weight window.
pub const WEIGHT_DIGITS: usize = 5;

/// Decode the five-digit weight window starting at `offset`.
///
/// Returns the weight in tenths of a gram. Anything other than five ASCII
/// digits inside the payload is a [`DecodeError`].
pub fn decode_weight(payload: &[u8], offset: usize) -> Result<u32, DecodeError> {
    let needed = offset.saturating_add(WEIGHT_DIGITS);
    let window = payload
        .get(offset..needed)
        .ok_or(DecodeError::TooShort {
            len: payload.len(),
            needed,
        })?;

    let mut value: u32 = 0;
    for (i, &byte) in window.iter().enumerate() {
        let digit = byte.wrapping_sub(b'0');
        if digit > 9 {
            return Err(DecodeError::NotADigit {
                index: offset + i,
                byte,
            });
        }
        value = value * 10 + u32::from(digit);
    }
    Ok(value)
}

/// Snapshot of the slot as seen by a reader.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightSample {
    pub value_dg: i32,
    pub subscribed: bool,
}

impl WeightSample {
    /// A sample the dosing loop may act on.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.subscribed && self.value_dg >= 0
    }

    #[inline]
    pub fn grams(&self) -> f32 {
        dg_to_grams(self.value_dg)
    }
}

/// Latest decoded weight plus the "subscription confirmed" flag.
#[derive(Debug)]
pub struct WeightSlot {
    value_dg: AtomicI32,
    subscribed: AtomicBool,
    frames: AtomicU64,
    bad_frames: AtomicU64,
}

impl Default for WeightSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl WeightSlot {
    pub fn new() -> Self {
        Self {
            value_dg: AtomicI32::new(SENTINEL_DG),
            subscribed: AtomicBool::new(false),
            frames: AtomicU64::new(0),
            bad_frames: AtomicU64::new(0),
        }
    }

    /// Back to "no sample" before a new subscription.
    pub fn reset(&self) {
        self.subscribed.store(false, Ordering::Release);
        self.value_dg.store(SENTINEL_DG, Ordering::Release);
    }

    /// Notification callback body.
    pub fn record(&self, payload: &[u8], offset: usize) -> Result<u32, DecodeError> {
        self.frames.fetch_add(1, Ordering::Relaxed);
        match decode_weight(payload, offset) {
            Ok(dg) => {
                let value = i32::try_from(dg).unwrap_or(i32::MAX);
                self.value_dg.store(value, Ordering::Release);
                self.subscribed.store(true, Ordering::Release);
                Ok(dg)
            }
            Err(e) => {
                self.bad_frames.fetch_add(1, Ordering::Relaxed);
                self.subscribed.store(false, Ordering::Release);
                self.value_dg.store(SENTINEL_DG, Ordering::Release);
                warn!(error = %e, len = payload.len(), "dropping malformed weight notification");
                Err(e)
            }
        }
    }

    pub fn sample(&self) -> WeightSample {
        let subscribed = self.subscribed.load(Ordering::Acquire);
        let value_dg = self.value_dg.load(Ordering::Acquire);
        WeightSample {
            value_dg,
            subscribed,
        }
    }

    /// (frames seen, frames that failed to decode)
    pub fn frame_counts(&self) -> (u64, u64) {
        (
            self.frames.load(Ordering::Relaxed),
            self.bad_frames.load(Ordering::Relaxed),
        )
    }
}

/// Weight notifications on one characteristic, feeding one [`WeightSlot`].
#[derive(Debug, Clone)]
pub struct TelemetryChannel {
    characteristic: String,
    weight_offset: usize,
    slot: Arc<WeightSlot>,
}

impl TelemetryChannel {
    pub fn new(characteristic: impl Into<String>, weight_offset: usize) -> Self {
        Self {
            characteristic: characteristic.into(),
            weight_offset,
            slot: Arc::new(WeightSlot::new()),
        }
    }

    pub fn characteristic(&self) -> &str {
        &self.characteristic
    }

    pub fn slot(&self) -> &Arc<WeightSlot> {
        &self.slot
    }

    /// Reset the slot and ask the peripheral for notifications.
    ///
    /// Success only means the transport accepted the request; the first
    /// valid sample in the slot is what confirms the subscription.
    pub fn subscribe<P: Peripheral + ?Sized>(&self, handle: &P) -> Result<(), SubscriptionError> {
        self.slot.reset();
        let slot = Arc::clone(&self.slot);
        let offset = self.weight_offset;
        let on_frame: NotifyFn = Box::new(move |payload: &[u8]| {
            let _ = slot.record(payload, offset);
        });
        handle
            .subscribe(&self.characteristic, on_frame, true)
            .map_err(|e| SubscriptionError::Rejected(e.to_string()))?;
        info!(characteristic = %self.characteristic, "weight notifications requested");
        Ok(())
    }

    /// Best-effort unsubscribe. Failures are logged and swallowed; the slot
    /// is marked unsubscribed either way.
    pub fn unsubscribe<P: Peripheral + ?Sized>(&self, handle: &P) {
        self.slot.subscribed.store(false, Ordering::Release);
        match handle.unsubscribe(&self.characteristic, true) {
            Ok(()) => debug!(characteristic = %self.characteristic, "unsubscribed"),
            Err(e) => warn!(
                characteristic = %self.characteristic,
                error = %e,
                "unsubscribe failed; continuing"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(b"\x01\x02+00160\r\n", 3, 160)]
    #[case(b"\x01\x02+00000\r\n", 3, 0)]
    #[case(b"\x01\x02+99999", 3, 99_999)]
    #[case(b"01234", 0, 1_234)]
    fn decodes_digit_window(#[case] payload: &[u8], #[case] offset: usize, #[case] want: u32) {
        assert_eq!(decode_weight(payload, offset), Ok(want));
    }

    #[test]
    fn short_payload_is_rejected() {
        assert_eq!(
            decode_weight(b"\x01\x02+001", 3),
            Err(DecodeError::TooShort { len: 6, needed: 8 })
        );
        assert!(decode_weight(b"", usize::MAX).is_err());
    }

    #[test]
    fn non_digit_is_rejected_with_position() {
        assert_eq!(
            decode_weight(b"\x01\x02+00x60", 3),
            Err(DecodeError::NotADigit { index: 5, byte: b'x' })
        );
        // a sign inside the window is not a digit either
        assert!(decode_weight(b"\x01\x02+-0160", 3).is_err());
    }

    #[test]
    fn slot_tracks_last_frame() {
        let slot = WeightSlot::new();
        assert!(!slot.sample().is_valid());
        assert_eq!(slot.sample().value_dg, SENTINEL_DG);

        slot.record(b"\x01\x02+00050\r\n", 3).unwrap();
        let s = slot.sample();
        assert!(s.is_valid());
        assert!((s.grams() - 5.0).abs() < 1e-6);

        assert!(slot.record(b"garbage", 3).is_err());
        let s = slot.sample();
        assert!(!s.is_valid());
        assert_eq!(s.value_dg, SENTINEL_DG);
        assert_eq!(slot.frame_counts(), (2, 1));

        slot.record(b"\x01\x02+00051\r\n", 3).unwrap();
        slot.reset();
        assert!(!slot.sample().is_valid());
    }
}
