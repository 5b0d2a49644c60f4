//! Batch-wide tonal and dynamics reference.

use serde::{Deserialize, Serialize};

use crate::analyzer::SignalMetrics;
use crate::math::median;

/// Fewest usable measurements a reference field needs.
pub const MIN_REFERENCE_FILES: usize = 2;

/// Values further than this many scaled MADs from the median are discarded.
const OUTLIER_MADS: f64 = 3.0;
/// MAD → standard deviation for normally distributed data.
const MAD_SCALE: f64 = 1.4826;

/// Robust central tendency of the batch. Every file is nudged toward it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatchReference {
    pub low_mid_tilt: f64,
    pub high_mid_tilt: f64,
    pub loudness_range: Option<f64>,
    /// Files that contributed a tilt measurement.
    pub file_count: usize,
}

impl BatchReference {
    /// Aggregate over every analysed file. `None` when fewer than
    /// `MIN_REFERENCE_FILES` files have both tilts measured.
    pub fn from_metrics<'a, I>(metrics: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a SignalMetrics>,
    {
        let mut low = Vec::new();
        let mut high = Vec::new();
        let mut lra = Vec::new();
        for m in metrics {
            if let (Some(l), Some(h)) = (m.low_mid_tilt(), m.high_mid_tilt()) {
                low.push(l);
                high.push(h);
            }
            if let Some(r) = m.loudness_range.filter(|r| r.is_finite()) {
                lra.push(r);
            }
        }

        if low.len() < MIN_REFERENCE_FILES {
            return None;
        }
        Some(Self {
            low_mid_tilt: robust_median(&low)?,
            high_mid_tilt: robust_median(&high)?,
            loudness_range: if lra.len() >= MIN_REFERENCE_FILES {
                robust_median(&lra)
            } else {
                None
            },
            file_count: low.len(),
        })
    }
}

/// Median after dropping values more than `OUTLIER_MADS` scaled MADs away.
/// With a zero MAD only values equal to the median survive.
pub fn robust_median(values: &[f64]) -> Option<f64> {
    let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    let m = median(&finite)?;
    let deviations: Vec<f64> = finite.iter().map(|v| (v - m).abs()).collect();
    let mad = median(&deviations)? * MAD_SCALE;
    let limit = OUTLIER_MADS * mad;

    let kept: Vec<f64> = finite.into_iter().filter(|v| (v - m).abs() <= limit).collect();
    median(&kept).or(Some(m))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tilted(low: f64, high: f64, lra: Option<f64>) -> SignalMetrics {
        SignalMetrics {
            low_rms_db: Some(-20.0 + low),
            mid_rms_db: Some(-20.0),
            high_rms_db: Some(-20.0 + high),
            loudness_range: lra,
            ..Default::default()
        }
    }

    #[test]
    fn test_robust_median_drops_outlier() {
        assert_eq!(robust_median(&[-2.0, -1.0, 0.0]), Some(-1.0));
        // 10 dB outlier is discarded rather than pulling the median up
        let r = robust_median(&[-2.0, -1.0, 0.0, 10.0]).unwrap();
        assert!((r + 1.0).abs() < 1e-9, "got {r}");
        assert_eq!(robust_median(&[]), None);
        assert_eq!(robust_median(&[f64::NAN, 4.0]), Some(4.0));
    }

    #[test]
    fn test_reference_uses_only_measured_files() {
        let files = vec![
            tilted(-2.0, -12.0, Some(6.0)),
            tilted(-1.0, -14.0, Some(8.0)),
            tilted(0.0, -16.0, None),
            SignalMetrics::default(),
        ];
        let r = BatchReference::from_metrics(&files).unwrap();
        assert_eq!(r.file_count, 3);
        assert!((r.low_mid_tilt + 1.0).abs() < 1e-9);
        assert!((r.high_mid_tilt + 14.0).abs() < 1e-9);
        assert_eq!(r.loudness_range, Some(7.0));
    }

    #[test]
    fn test_outlier_file_barely_moves_reference() {
        let mut files = vec![
            tilted(-2.0, -12.0, Some(6.0)),
            tilted(-1.0, -14.0, Some(8.0)),
            tilted(0.0, -16.0, Some(7.0)),
        ];
        let base = BatchReference::from_metrics(&files).unwrap();
        files.push(tilted(10.0, -4.0, Some(20.0)));
        let with_outlier = BatchReference::from_metrics(&files).unwrap();
        assert_eq!(with_outlier.file_count, 4);
        assert!((with_outlier.low_mid_tilt - base.low_mid_tilt).abs() <= 0.5);
        assert!((with_outlier.high_mid_tilt - base.high_mid_tilt).abs() <= 1.0);
    }

    #[test]
    fn test_too_few_files() {
        assert!(BatchReference::from_metrics(&[tilted(0.0, -10.0, None)]).is_none());
        let empty: Vec<SignalMetrics> = Vec::new();
        assert!(BatchReference::from_metrics(&empty).is_none());
    }
}
