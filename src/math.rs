//! Small numeric helpers shared by analysis, profile and chain code.

/// Linear-interpolated percentile (`p` in 0..=1). Returns `None` for empty input.
/// Non-finite values are ignored.
pub fn percentile(values: &[f64], p: f64) -> Option<f64> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let p = p.clamp(0.0, 1.0);
    let pos = p * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

pub fn median(values: &[f64]) -> Option<f64> {
    percentile(values, 0.5)
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

pub fn clamp01(v: f64) -> f64 {
    clamp_finite(v, 0.0, 1.0, 0.0)
}

/// Clamp that never lets NaN/inf through: non-finite input becomes `fallback`
/// (itself clamped).
pub fn clamp_finite(v: f64, lo: f64, hi: f64, fallback: f64) -> f64 {
    if v.is_finite() {
        v.clamp(lo, hi)
    } else {
        fallback.clamp(lo, hi)
    }
}

/// `Some(v)` only when `v` is finite.
pub fn finite(v: Option<f64>) -> Option<f64> {
    v.filter(|x| x.is_finite())
}

pub fn db_to_lin(db: f64) -> f64 {
    10f64.powf(db / 20.0)
}

pub fn lin_to_db(lin: f64, floor_db: f64) -> f64 {
    if lin > 0.0 {
        (20.0 * lin.log10()).max(floor_db)
    } else {
        floor_db
    }
}

/// Nearest odd integer to `v` inside `[lo, hi]` (both bounds odd).
pub fn nearest_odd(v: f64, lo: u32, hi: u32) -> u32 {
    debug_assert!(lo % 2 == 1 && hi % 2 == 1 && lo <= hi);
    let v = clamp_finite(v, lo as f64, hi as f64, lo as f64);
    let down = (v.floor() as u32) | 1;
    let down = if down as f64 > v { down.saturating_sub(2) } else { down };
    let up = down + 2;
    let pick = if (v - down as f64) <= (up as f64 - v) { down } else { up };
    pick.clamp(lo, hi)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentile_interpolates() {
        let v = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(percentile(&v, 0.0), Some(1.0));
        assert_eq!(percentile(&v, 0.5), Some(3.0));
        assert_eq!(percentile(&v, 1.0), Some(5.0));
        assert!((percentile(&v, 0.125).unwrap() - 1.5).abs() < 1e-12);
        assert_eq!(percentile(&[], 0.5), None);
        assert_eq!(percentile(&[f64::NAN], 0.5), None);
    }

    #[test]
    fn test_clamp_finite_rejects_nan() {
        assert_eq!(clamp_finite(f64::NAN, 65.0, 105.0, 80.0), 80.0);
        assert_eq!(clamp_finite(f64::INFINITY, 0.0, 1.0, 0.0), 0.0);
        assert_eq!(clamp_finite(200.0, 65.0, 105.0, 80.0), 105.0);
    }

    #[test]
    fn test_nearest_odd() {
        assert_eq!(nearest_odd(31.0, 3, 301), 31);
        assert_eq!(nearest_odd(30.0, 3, 301), 29);
        assert_eq!(nearest_odd(30.6, 3, 301), 31);
        assert_eq!(nearest_odd(32.2, 3, 301), 33);
        assert_eq!(nearest_odd(31.8, 3, 301), 31);
        assert_eq!(nearest_odd(1.0, 11, 61), 11);
        assert_eq!(nearest_odd(500.0, 11, 61), 61);
        assert_eq!(nearest_odd(f64::NAN, 11, 61), 11);
        for i in 0..200 {
            let v = nearest_odd(i as f64 * 0.37, 11, 61);
            assert_eq!(v % 2, 1);
            assert!((11..=61).contains(&v));
        }
    }

    #[test]
    fn test_db_round_trip() {
        assert!((lin_to_db(db_to_lin(-12.0), -120.0) + 12.0).abs() < 1e-9);
        assert_eq!(lin_to_db(0.0, -120.0), -120.0);
    }
}
