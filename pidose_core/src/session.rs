//! Single-flight session lock and per-dose progress tracking.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::fixed_point::{dg_to_grams, grams_to_dg};
use crate::telemetry::WeightSample;

/// Try-lock admitting at most one dose session at a time.
#[derive(Debug, Default)]
pub struct SessionSlot {
    held: AtomicBool,
}

impl SessionSlot {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Non-blocking; `None` if a session already holds the slot.
    pub fn try_acquire(self: &Arc<Self>) -> Option<SessionLock> {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SessionLock {
                slot: Arc::clone(self),
            })
    }

    #[inline]
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

/// Releases the slot on drop, including on unwind.
#[derive(Debug)]
pub struct SessionLock {
    slot: Arc<SessionSlot>,
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        self.slot.held.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Progress {
    /// No valid sample seen yet.
    Waiting,
    Filling { weight_g: f32 },
    TargetReached { weight_g: f32 },
}

/// State of one dose: thresholds, cancellation, and the last good sample.
///
/// Invalid samples (decode failures, sentinel) never replace `last_good_dg`,
/// so a garbled notification cannot be mistaken for a weight.
#[derive(Debug)]
pub struct DoseSession {
    target_dg: i32,
    tolerance_dg: i32,
    last_good_dg: Option<i32>,
    cancel: Arc<AtomicBool>,
}

impl DoseSession {
    pub fn new(target_g: f32, tolerance_g: f32, cancel: Arc<AtomicBool>) -> Self {
        Self {
            target_dg: grams_to_dg(target_g),
            tolerance_dg: grams_to_dg(tolerance_g),
            last_good_dg: None,
            cancel,
        }
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// True once a valid sample proves the subscription is live.
    pub fn confirm_subscription(&mut self, sample: WeightSample) -> bool {
        if sample.is_valid() {
            self.last_good_dg = Some(sample.value_dg);
            true
        } else {
            false
        }
    }

    pub fn observe(&mut self, sample: WeightSample) -> Progress {
        if sample.is_valid() {
            self.last_good_dg = Some(sample.value_dg);
        }
        match self.last_good_dg {
            None => Progress::Waiting,
            Some(w) if w.saturating_add(self.tolerance_dg) >= self.target_dg => {
                Progress::TargetReached {
                    weight_g: dg_to_grams(w),
                }
            }
            Some(w) => Progress::Filling {
                weight_g: dg_to_grams(w),
            },
        }
    }

    pub fn last_weight_g(&self) -> Option<f32> {
        self.last_good_dg.map(dg_to_grams)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed_point::SENTINEL_DG;

    fn valid(dg: i32) -> WeightSample {
        WeightSample {
            value_dg: dg,
            subscribed: true,
        }
    }

    fn garbled() -> WeightSample {
        WeightSample {
            value_dg: SENTINEL_DG,
            subscribed: false,
        }
    }

    #[test]
    fn slot_admits_one_holder() {
        let slot = SessionSlot::new();
        let lock = slot.try_acquire().expect("first acquire");
        assert!(slot.is_held());
        assert!(slot.try_acquire().is_none());
        drop(lock);
        assert!(!slot.is_held());
        assert!(slot.try_acquire().is_some());
    }

    #[test]
    fn slot_released_on_panic() {
        let slot = SessionSlot::new();
        let s2 = Arc::clone(&slot);
        let r = std::thread::spawn(move || {
            let _lock = s2.try_acquire().unwrap();
            panic!("session blew up");
        })
        .join();
        assert!(r.is_err());
        assert!(!slot.is_held());
    }

    #[test]
    fn stops_at_target_minus_tolerance() {
        let mut s = DoseSession::new(16.0, 1.0, Arc::default());
        assert!(s.confirm_subscription(valid(0)));
        for dg in [50, 100, 140] {
            assert!(matches!(s.observe(valid(dg)), Progress::Filling { .. }));
        }
        assert_eq!(
            s.observe(valid(150)),
            Progress::TargetReached { weight_g: 15.0 }
        );
    }

    #[test]
    fn garbled_sample_keeps_last_good() {
        let mut s = DoseSession::new(16.0, 1.0, Arc::default());
        assert!(!s.confirm_subscription(garbled()));
        assert_eq!(s.observe(garbled()), Progress::Waiting);
        s.observe(valid(30));
        assert_eq!(s.observe(garbled()), Progress::Filling { weight_g: 3.0 });
        assert_eq!(s.last_weight_g(), Some(3.0));
    }

    #[test]
    fn unconfirmed_sample_is_ignored() {
        // value present but the slot says the subscription is not live
        let mut s = DoseSession::new(16.0, 1.0, Arc::default());
        let stale = WeightSample {
            value_dg: 200,
            subscribed: false,
        };
        assert!(!s.confirm_subscription(stale));
        assert_eq!(s.observe(stale), Progress::Waiting);
    }

    #[test]
    fn zero_tolerance_needs_exact_target() {
        let mut s = DoseSession::new(16.0, 0.0, Arc::default());
        assert!(matches!(s.observe(valid(159)), Progress::Filling { .. }));
        assert!(matches!(s.observe(valid(160)), Progress::TargetReached { .. }));
    }

    #[test]
    fn sees_shared_cancel_flag() {
        let flag = Arc::new(AtomicBool::new(false));
        let s = DoseSession::new(16.0, 1.0, Arc::clone(&flag));
        assert!(!s.is_cancelled());
        flag.store(true, Ordering::Release);
        assert!(s.is_cancelled());
    }
}
