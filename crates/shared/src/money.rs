//! Currency unit conversion
//!
//! Amounts are integer cents everywhere. These two functions are the only
//! places that cross between dollars and cents: dollars come in as the
//! platform fee setting and go out in display breakdowns.

/// Convert a dollar amount to cents, rounding half away from zero.
///
/// Returns `None` for NaN, infinite or out-of-range input.
pub fn dollars_to_cents(dollars: f64) -> Option<i64> {
    if !dollars.is_finite() {
        return None;
    }
    let cents = (dollars * 100.0).round();
    if cents > i64::MAX as f64 || cents < i64::MIN as f64 {
        return None;
    }
    Some(cents as i64)
}

/// Convert cents to dollars for display
pub fn cents_to_dollars(cents: i64) -> f64 {
    cents as f64 / 100.0
}
