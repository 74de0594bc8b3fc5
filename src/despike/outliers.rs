//! Voxel and volume outlier detection
//!
//! Each in-mask voxel series is detrended with a quadratic, and samples
//! further than `alpha * sqrt(pi/2) * MAD` from the residual mean are voxel
//! outliers. `alpha` is a Bonferroni-corrected normal quantile. The
//! percentage of outlying voxels per volume is then screened with a robust
//! z-score to flag whole volumes.
//!
//! Reference: AFNI 3dToutcount (Cox, R.W. 1996. "AFNI: software for analysis
//! and visualization of functional magnetic resonance neuroimages."
//! Computers and Biomedical Research 29:162-173).

use std::f64::consts::FRAC_PI_2;

use log::debug;
use rayon::prelude::*;

use crate::despike::report::Classification;
use crate::error::{QcError, Result};
use crate::stats::{detrend_polynomial, mad, mad_about, mean, median, QuantileFunctions};
use crate::volume::VolumeSeries;

/// Polynomial order removed before scoring
pub const DETREND_ORDER: usize = 2;

/// Consistency constant relating MAD to the standard deviation
pub const MAD_TO_SIGMA: f64 = 0.6745;

/// Output of the detection stage
#[derive(Clone, Debug)]
pub struct OutlierScan {
    /// Voxel-timepoints classified as outliers
    pub classification: Classification,
    /// Percentage of in-mask voxels that are outliers, per volume
    pub outlying_voxels: Vec<f64>,
    /// Flagged volumes
    pub outlier_volumes: Vec<bool>,
    /// z threshold used per voxel
    pub alpha: f64,
    /// Robust z threshold used per volume
    pub volume_threshold: f64,
}

impl OutlierScan {
    pub fn any_outlier_volume(&self) -> bool {
        self.outlier_volumes.iter().any(|&f| f)
    }
}

/// Bonferroni-corrected z threshold for `nt` samples
pub fn voxel_alpha(
    quantiles: &dyn QuantileFunctions,
    significance: f64,
    nt: usize,
) -> Result<f64> {
    let alpha = quantiles.normal_quantile(1.0 - significance / nt as f64)?;
    if !alpha.is_finite() {
        return Err(QcError::Configuration(format!(
            "normal quantile for significance {} over {} samples is not finite", significance, nt
        )));
    }
    Ok(alpha)
}

/// Robust z threshold for flagging volumes: sqrt(chi2_inv(confidence, 1))
pub fn volume_threshold(quantiles: &dyn QuantileFunctions, confidence: f64) -> Result<f64> {
    let q = quantiles.chi_square_quantile(confidence, 1.0)?;
    if !q.is_finite() || q < 0.0 {
        return Err(QcError::Configuration(format!(
            "chi-square quantile at {} is not a finite non-negative value: {}", confidence, q
        )));
    }
    Ok(q.sqrt())
}

/// Outlier flags for one voxel series
///
/// A series with non-finite samples or zero spread has no outliers.
pub fn voxel_outliers(series: &[f64], alpha: f64) -> Vec<bool> {
    let n = series.len();
    if n == 0 || series.iter().any(|v| !v.is_finite()) {
        return vec![false; n];
    }

    let clean = detrend_polynomial(series, DETREND_ORDER);
    let spread = mad(&clean);
    if !(spread > 0.0) {
        return vec![false; n];
    }

    let k = alpha * FRAC_PI_2.sqrt() * spread;
    let center = mean(&clean);
    clean.iter()
        .map(|&c| c > center + k || c < center - k)
        .collect()
}

/// Flag volumes whose outlier percentage is a robust outlier
///
/// Volume t is flagged when `|o[t] - M| / (MAD / 0.6745) > threshold`. With
/// zero MAD the ratio is unbounded for any `o[t] != M`, so exactly those
/// volumes are flagged.
pub fn flag_outlier_volumes(outlying_voxels: &[f64], threshold: f64) -> Vec<bool> {
    if outlying_voxels.is_empty() {
        return Vec::new();
    }
    let m = median(outlying_voxels);
    let spread = mad_about(outlying_voxels, m);

    outlying_voxels.iter()
        .map(|&o| {
            let dev = (o - m).abs();
            if spread > 0.0 {
                dev / (spread / MAD_TO_SIGMA) > threshold
            } else {
                dev > 0.0
            }
        })
        .collect()
}

/// Run the detection stage over the given in-mask voxels
pub fn scan_outliers(
    volumes: &VolumeSeries,
    voxels: &[usize],
    alpha: f64,
    volume_threshold: f64,
) -> OutlierScan {
    let nt = volumes.n_timepoints();
    let n_mask = voxels.len();

    // One write-once slot per in-mask voxel
    let flags: Vec<Vec<bool>> = voxels.par_iter()
        .map(|&v| voxel_outliers(&volumes.voxel_series(v), alpha))
        .collect();

    let mut classification = Classification::new(volumes.dims(), nt);
    for (&v, voxel_flags) in voxels.iter().zip(flags.iter()) {
        for (t, &f) in voxel_flags.iter().enumerate() {
            if f {
                classification.set(v, t);
            }
        }
    }

    let outlying_voxels: Vec<f64> = (0..nt)
        .map(|t| {
            if n_mask == 0 {
                0.0
            } else {
                100.0 * classification.count_at(t) as f64 / n_mask as f64
            }
        })
        .collect();

    let outlier_volumes = flag_outlier_volumes(&outlying_voxels, volume_threshold);
    debug!(
        "Outlier scan: alpha {:.4}, volume threshold {:.4}, {} voxel outliers",
        alpha, volume_threshold, classification.count()
    );

    OutlierScan {
        classification,
        outlying_voxels,
        outlier_volumes,
        alpha,
        volume_threshold,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::BuiltinQuantiles;

    fn alternating(nt: usize, offset: f64) -> Vec<f64> {
        (0..nt).map(|t| offset + if t % 2 == 0 { 0.5 } else { -0.5 }).collect()
    }

    #[test]
    fn test_alpha_bonferroni() {
        let alpha = voxel_alpha(&BuiltinQuantiles, 0.001, 20).unwrap();
        // Phi^-1(1 - 0.00005)
        assert!((alpha - 3.890_591_886_413_094).abs() < 1e-6, "alpha = {}", alpha);
    }

    #[test]
    fn test_volume_threshold_value() {
        let thr = volume_threshold(&BuiltinQuantiles, 0.975).unwrap();
        assert!((thr - 5.023_886_187_314_888f64.sqrt()).abs() < 1e-8);
    }

    #[test]
    fn test_voxel_outliers_clean_series() {
        let series = alternating(20, 100.0);
        let flags = voxel_outliers(&series, 3.89);
        assert!(flags.iter().all(|&f| !f));
    }

    #[test]
    fn test_voxel_outliers_detects_spike() {
        let mut series = alternating(30, 100.0);
        series[12] += 40.0;
        let flags = voxel_outliers(&series, 3.89);
        assert!(flags[12], "Spike should be an outlier");
        assert_eq!(flags.iter().filter(|&&f| f).count(), 1);
    }

    #[test]
    fn test_voxel_outliers_detects_dip() {
        let mut series = alternating(30, 100.0);
        series[7] -= 40.0;
        let flags = voxel_outliers(&series, 3.89);
        assert!(flags[7], "Negative excursion should be an outlier");
    }

    #[test]
    fn test_voxel_outliers_degenerate() {
        assert!(voxel_outliers(&[2.0; 10], 3.0).iter().all(|&f| !f));
        let mut with_nan = alternating(10, 1.0);
        with_nan[3] = f64::NAN;
        assert!(voxel_outliers(&with_nan, 3.0).iter().all(|&f| !f));
    }

    #[test]
    fn test_flag_volumes_zero_outliers() {
        let flags = flag_outlier_volumes(&[0.0; 15], 2.24);
        assert!(flags.iter().all(|&f| !f));
    }

    #[test]
    fn test_flag_volumes_zero_mad() {
        let mut o = vec![0.0; 10];
        o[4] = 1.5;
        let flags = flag_outlier_volumes(&o, 2.24);
        assert_eq!(flags.iter().filter(|&&f| f).count(), 1);
        assert!(flags[4]);
    }

    #[test]
    fn test_flag_volumes_robust_z() {
        let o = vec![1.0, 2.0, 1.5, 1.0, 2.0, 1.5, 30.0, 1.0, 2.0];
        let flags = flag_outlier_volumes(&o, 2.24);
        assert!(flags[6]);
        assert_eq!(flags.iter().filter(|&&f| f).count(), 1);
    }

    #[test]
    fn test_scan_outliers_percentages() {
        // 2 voxels, both clean except voxel 1 spiking at t = 5
        let nt = 20;
        let mut data = vec![0.0; 2 * nt];
        for t in 0..nt {
            data[2 * t] = 100.0 + if t % 2 == 0 { 0.5 } else { -0.5 };
            data[2 * t + 1] = 80.0 + if t % 2 == 0 { 0.5 } else { -0.5 };
        }
        data[2 * 5 + 1] += 50.0;
        let series = VolumeSeries::new(data, (2, 1, 1), nt).unwrap();

        let scan = scan_outliers(&series, &[0, 1], 3.89, 2.24);
        assert!(scan.classification.get(1, 5));
        assert_eq!(scan.outlying_voxels[5], 50.0);
        assert!(scan.outlier_volumes[5]);
        assert!(scan.any_outlier_volume());
    }
}
