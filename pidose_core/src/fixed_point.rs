//! Fixed-point decigram helpers.
//!
//! The scale reports weight as an integer count of tenths of a gram, so the
//! controller keeps every threshold in decigrams (`i32`, 1 dg = 0.1 g) and only
//! converts to grams at the edges (logs, reports).

/// Slot value meaning "no valid sample": −1.0 g.
pub const SENTINEL_DG: i32 = -10;

/// Quantize grams to decigrams, rounding to nearest and clamping to `i32`.
/// Non-finite values map to 0.
#[inline]
pub fn grams_to_dg(g: f32) -> i32 {
    if !g.is_finite() {
        return 0;
    }
    let scaled = (g * 10.0).round();
    if scaled >= i32::MAX as f32 {
        i32::MAX
    } else if scaled <= i32::MIN as f32 {
        i32::MIN
    } else {
        scaled as i32
    }
}

#[inline]
pub fn dg_to_grams(dg: i32) -> f32 {
    dg as f32 / 10.0
}
