use crate::CoreError;

/// Reject NaN and infinities.
pub fn ensure_finite(v: f64, what: &'static str) -> Result<f64, CoreError> {
    if v.is_finite() {
        Ok(v)
    } else {
        Err(CoreError::NonFinite { what, value: v })
    }
}

/// Check that `v` is a finite value inside `[min, max]`.
pub fn ensure_in_range(v: f64, min: f64, max: f64, what: &'static str) -> Result<f64, CoreError> {
    let v = ensure_finite(v, what)?;
    if v < min || v > max {
        return Err(CoreError::OutOfRange {
            what,
            value: v,
            min,
            max,
        });
    }
    Ok(v)
}

/// Duty cycles and similar ratios live in `[0, 1]`.
pub fn ensure_fraction(v: f64, what: &'static str) -> Result<f64, CoreError> {
    ensure_in_range(v, 0.0, 1.0, what)
}
