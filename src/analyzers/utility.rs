/// Computes the arithmetic mean of the finite values in a slice.
/// Returns NaN when there are none.
pub fn nan_mean(values: &[f64]) -> f64 {
    let (sum, count) = values
        .iter()
        .filter(|v| v.is_finite())
        .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 {
        return f64::NAN;
    }
    sum / count as f64
}

/// Relative imbalance `|dif| / vol`. NaN when either input is NaN or the
/// volume is zero, so an empty FATV is never reported as balanced.
pub fn imbalance_ratio(dif: f64, vol: f64) -> f64 {
    if dif.is_nan() || vol.is_nan() || vol == 0.0 {
        return f64::NAN;
    }
    dif.abs() / vol
}
