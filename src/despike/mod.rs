//! Voxel-wise outlier detection and temporal despiking
//!
//! The run has two stages:
//! 1. Outlier scan: count voxel outliers per volume and flag volumes whose
//!    outlier percentage is itself an outlier (see `outliers`).
//! 2. Despiking, only when some volume was flagged: each in-mask voxel
//!    series is smoothed with a moving median, residuals are scaled by a
//!    MAD-based sigma, and residuals above `c1` are squashed towards `c2`
//!    with `s' = c1 + (c2 - c1) * tanh((s - c1) / (c2 - c1))`.
//!
//! Only positive excursions are compressed.
//!
//! Reference:
//! Cox, R.W. AFNI 3dDespike. https://afni.nimh.nih.gov/pub/dist/doc/program_help/3dDespike.html

pub mod median_filter;
pub mod outliers;
pub mod report;
pub mod window;

use std::f64::consts::FRAC_PI_2;
use std::str::FromStr;

use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::JsonConfig;
use crate::error::{QcError, Result};
use crate::stats::{mad, BuiltinQuantiles, QuantileFunctions};
use crate::volume::{Mask, VolumeSeries};

pub use median_filter::moving_median;
pub use outliers::{flag_outlier_volumes, scan_outliers, voxel_outliers, OutlierScan};
pub use report::{Classification, DespikeReport};
pub use window::{estimate_window, WindowEstimate, MIN_WINDOW};

/// Smoothing method for the despiking stage
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DespikeMethod {
    /// Moving median
    #[default]
    Median,
}

impl FromStr for DespikeMethod {
    type Err = QcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "median" => Ok(DespikeMethod::Median),
            other => Err(QcError::Configuration(format!(
                "unsupported despike method '{}' (only 'median' is available)", other
            ))),
        }
    }
}

/// Parameters for despiking
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DespikeParams {
    /// Smoothing method (default median)
    pub method: DespikeMethod,
    /// Moving-median window; `None` estimates it from the autocorrelation
    pub window: Option<usize>,
    /// Residual level (in sigma) above which a sample is a spike (default 2.5)
    pub c1: f64,
    /// Ceiling the compressed residual approaches (default 4.0)
    pub c2: f64,
    /// Family-wise significance of the voxel outlier scan (default 0.001)
    pub significance: f64,
    /// Chi-square confidence for flagging volumes (default 0.975)
    pub volume_confidence: f64,
}

impl Default for DespikeParams {
    fn default() -> Self {
        Self {
            method: DespikeMethod::Median,
            window: None,
            c1: 2.5,
            c2: 4.0,
            significance: 0.001,
            volume_confidence: 0.975,
        }
    }
}

impl JsonConfig for DespikeParams {}

/// Compress a normalised residual above `c1` towards the `c2` ceiling
///
/// Identity at `s == c1`; tends to `c2` as `s` grows.
#[inline]
pub fn compress_spike(s: f64, c1: f64, c2: f64) -> f64 {
    c1 + (c2 - c1) * ((s - c1) / (c2 - c1)).tanh()
}

/// Result of despiking one voxel series
#[derive(Clone, Debug, PartialEq)]
pub enum VoxelDespike {
    /// Series with non-finite samples, left unchanged
    NonFinite,
    /// Residual spread is zero, left unchanged
    FlatResidual,
    /// Despiked values and the samples that were compressed
    Despiked {
        values: Vec<f64>,
        events: Vec<bool>,
        sigma: f64,
    },
}

/// Despike a single voxel series with a moving median of `window` samples
///
/// Samples that are not spikes keep their raw value exactly.
pub fn despike_voxel(raw: &[f64], window: usize, c1: f64, c2: f64) -> VoxelDespike {
    if raw.iter().any(|v| !v.is_finite()) {
        return VoxelDespike::NonFinite;
    }

    let smoothed = moving_median(raw, window);
    let residual: Vec<f64> = raw.iter()
        .zip(smoothed.iter())
        .map(|(&r, &s)| r - s)
        .collect();

    let sigma = FRAC_PI_2.sqrt() * mad(&residual);
    if !(sigma > 0.0) {
        return VoxelDespike::FlatResidual;
    }

    let mut values = raw.to_vec();
    let mut events = vec![false; raw.len()];
    for t in 0..raw.len() {
        let s = residual[t] / sigma;
        if s > c1 {
            events[t] = true;
            values[t] = compress_spike(s, c1, c2) * sigma + smoothed[t];
        }
    }

    VoxelDespike::Despiked { values, events, sigma }
}

fn validate(volumes: &VolumeSeries, mask: &Mask, params: &DespikeParams) -> Result<()> {
    if mask.dims() != volumes.dims() {
        return Err(QcError::shape(
            "despike mask",
            format!("{:?}", volumes.dims()),
            format!("{:?}", mask.dims()),
        ));
    }

    let nt = volumes.n_timepoints();
    if nt < MIN_WINDOW {
        return Err(QcError::Configuration(format!(
            "despiking needs at least {} timepoints, got {}", MIN_WINDOW, nt
        )));
    }

    if let Some(w) = params.window {
        if w < MIN_WINDOW || w > nt {
            return Err(QcError::Configuration(format!(
                "window must lie in [{}, {}], got {}", MIN_WINDOW, nt, w
            )));
        }
    }

    if !(params.c1 > 0.0 && params.c2 > params.c1 && params.c2.is_finite()) {
        return Err(QcError::Configuration(format!(
            "despike levels need 0 < c1 < c2, got c1 = {}, c2 = {}", params.c1, params.c2
        )));
    }

    Ok(())
}

/// Despike a time series inside a mask
///
/// Returns the despiked series (identical to the input outside the mask)
/// and a complete report, even when nothing was despiked.
pub fn despike(
    volumes: &VolumeSeries,
    mask: &Mask,
    params: &DespikeParams,
) -> Result<(VolumeSeries, DespikeReport)> {
    despike_with_quantiles(volumes, mask, params, &BuiltinQuantiles, |_, _| {})
}

/// Despike with default parameters (median, estimated window)
pub fn despike_default(volumes: &VolumeSeries, mask: &Mask) -> Result<(VolumeSeries, DespikeReport)> {
    despike(volumes, mask, &DespikeParams::default())
}

/// Despike with a progress callback `(completed_stages, total_stages)`
pub fn despike_with_progress<F>(
    volumes: &VolumeSeries,
    mask: &Mask,
    params: &DespikeParams,
    progress_callback: F,
) -> Result<(VolumeSeries, DespikeReport)>
where
    F: FnMut(usize, usize),
{
    despike_with_quantiles(volumes, mask, params, &BuiltinQuantiles, progress_callback)
}

/// Despike using caller-supplied quantile functions
pub fn despike_with_quantiles<F>(
    volumes: &VolumeSeries,
    mask: &Mask,
    params: &DespikeParams,
    quantiles: &dyn QuantileFunctions,
    mut progress_callback: F,
) -> Result<(VolumeSeries, DespikeReport)>
where
    F: FnMut(usize, usize),
{
    const STAGES: usize = 3;

    validate(volumes, mask, params)?;

    let voxels = mask.indices();
    if voxels.is_empty() {
        return Err(QcError::Data("despike mask selects no voxels".to_string()));
    }
    let any_finite = voxels.par_iter()
        .any(|&v| volumes.voxel_series(v).iter().all(|x| x.is_finite()));
    if !any_finite {
        return Err(QcError::Data(
            "every in-mask voxel series contains non-finite samples".to_string(),
        ));
    }

    let nt = volumes.n_timepoints();
    let alpha = outliers::voxel_alpha(quantiles, params.significance, nt)?;
    let volume_threshold = outliers::volume_threshold(quantiles, params.volume_confidence)?;

    info!("Despiking {} in-mask voxels over {} timepoints", voxels.len(), nt);
    progress_callback(0, STAGES);

    // Stage 1: outlier scan
    let scan = scan_outliers(volumes, &voxels, alpha, volume_threshold);
    let n_flagged = scan.outlier_volumes.iter().filter(|&&f| f).count();
    info!("Outlier scan flagged {} of {} volumes", n_flagged, nt);
    progress_callback(1, STAGES);

    if n_flagged == 0 {
        info!("No outlier volumes; leaving series unchanged");
        progress_callback(STAGES, STAGES);
        let report = DespikeReport {
            dims: volumes.dims(),
            n_timepoints: nt,
            n_mask_voxels: voxels.len(),
            outlying_voxels: scan.outlying_voxels,
            outlier_volumes: scan.outlier_volumes,
            despiked_voxels: vec![0.0; nt],
            despiked: false,
            window: params.window.unwrap_or(MIN_WINDOW),
            window_estimated: false,
            skipped_voxels: 0,
            alpha,
            volume_threshold,
            outlier_classification: scan.classification,
            classification: Classification::new(volumes.dims(), nt),
        };
        return Ok((volumes.clone(), report));
    }

    // Stage 2: window and per-voxel despiking
    let (window, window_estimated) = match params.window {
        Some(w) => (w, false),
        None => (estimate_window(volumes, &voxels).window, true),
    };
    debug!("Moving-median window {} (estimated: {})", window, window_estimated);
    progress_callback(2, STAGES);

    let mut slots: Vec<VoxelDespike> = vec![VoxelDespike::FlatResidual; voxels.len()];
    slots.par_iter_mut()
        .zip(voxels.par_iter())
        .for_each(|(slot, &v)| {
            *slot = despike_voxel(&volumes.voxel_series(v), window, params.c1, params.c2);
        });

    // Scatter the slots back into the 4D output
    let mut output = volumes.clone();
    let n_vox = volumes.n_voxels();
    let mut classification = Classification::new(volumes.dims(), nt);
    let mut skipped = 0usize;
    {
        let out = output.data_mut();
        for (&v, slot) in voxels.iter().zip(slots.iter()) {
            match slot {
                VoxelDespike::Despiked { values, events, .. } => {
                    for t in 0..nt {
                        if events[t] {
                            out[v + t * n_vox] = values[t];
                            classification.set(v, t);
                        }
                    }
                }
                VoxelDespike::NonFinite | VoxelDespike::FlatResidual => skipped += 1,
            }
        }
    }
    if skipped > 0 {
        warn!("{} in-mask voxels left unchanged (non-finite or zero residual spread)", skipped);
    }

    let n_mask = voxels.len() as f64;
    let despiked_voxels: Vec<f64> = (0..nt)
        .map(|t| 100.0 * classification.count_at(t) as f64 / n_mask)
        .collect();
    info!("Despiked {} voxel-timepoints", classification.count());
    progress_callback(STAGES, STAGES);

    let report = DespikeReport {
        dims: volumes.dims(),
        n_timepoints: nt,
        n_mask_voxels: voxels.len(),
        outlying_voxels: scan.outlying_voxels,
        outlier_volumes: scan.outlier_volumes,
        despiked_voxels,
        despiked: true,
        window,
        window_estimated,
        skipped_voxels: skipped,
        alpha,
        volume_threshold,
        outlier_classification: scan.classification,
        classification,
    };

    Ok((output, report))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Alternating +/-0.5 baseline per voxel with a voxel-specific offset
    fn baseline_series(dims: (usize, usize, usize), nt: usize) -> Vec<f64> {
        let n_vox = dims.0 * dims.1 * dims.2;
        let mut data = vec![0.0; n_vox * nt];
        for t in 0..nt {
            for v in 0..n_vox {
                let wiggle = if t % 2 == 0 { 0.5 } else { -0.5 };
                data[v + t * n_vox] = 100.0 + v as f64 + wiggle;
            }
        }
        data
    }

    #[test]
    fn test_compress_identity_at_c1() {
        assert_eq!(compress_spike(2.5, 2.5, 4.0), 2.5);
    }

    #[test]
    fn test_compress_bounded_and_monotone() {
        let mut prev = 2.5;
        for i in 1..100 {
            let s = 2.5 + i as f64 * 0.5;
            let c = compress_spike(s, 2.5, 4.0);
            assert!(c > prev, "compression should be increasing");
            assert!(c <= 4.0, "compression must stay under c2");
            assert!(c < s, "compression must shrink the residual");
            prev = c;
        }
    }

    #[test]
    fn test_method_from_str() {
        assert_eq!("median".parse::<DespikeMethod>().unwrap(), DespikeMethod::Median);
        assert_eq!("Median".parse::<DespikeMethod>().unwrap(), DespikeMethod::Median);
        assert!(matches!("mean".parse::<DespikeMethod>(), Err(QcError::Configuration(_))));
    }

    #[test]
    fn test_despike_voxel_spike() {
        let mut raw: Vec<f64> = (0..20).map(|t| 100.5 - (t % 2) as f64).collect();
        raw[10] = 100.0 * 100.5;
        match despike_voxel(&raw, 3, 2.5, 4.0) {
            VoxelDespike::Despiked { values, events, sigma } => {
                assert!(events[10]);
                assert_eq!(events.iter().filter(|&&e| e).count(), 1);
                assert!(values[10] > 99.5 && values[10] < raw[10]);
                assert!(values[10] <= 99.5 + 4.0 * sigma + 1e-9);
                for t in 0..20 {
                    if t != 10 {
                        assert_eq!(values[t], raw[t]);
                    }
                }
            }
            other => panic!("Expected despiked voxel, got {:?}", other),
        }
    }

    #[test]
    fn test_despike_voxel_degenerate() {
        assert_eq!(despike_voxel(&[4.0; 12], 3, 2.5, 4.0), VoxelDespike::FlatResidual);
        let mut raw = vec![1.0, 2.0, 3.0, 2.0, 1.0];
        raw[2] = f64::INFINITY;
        assert_eq!(despike_voxel(&raw, 3, 2.5, 4.0), VoxelDespike::NonFinite);
    }

    #[test]
    fn test_despike_noop_without_outlier_volumes() {
        let dims = (3, 3, 2);
        let nt = 16;
        let series = VolumeSeries::new(baseline_series(dims, nt), dims, nt).unwrap();
        let mask = Mask::full(dims);

        let (out, report) = despike_default(&series, &mask).unwrap();
        assert_eq!(out, series);
        assert!(!report.despiked);
        assert_eq!(report.total_despiked(), 0);
        assert!(report.outlying_voxels.iter().all(|&o| o == 0.0));
        assert!(report.outlier_volumes.iter().all(|&f| !f));
        assert!(report.despiked_voxels.iter().all(|&d| d == 0.0));
    }

    #[test]
    fn test_despike_leaves_outside_mask_untouched() {
        let dims = (2, 2, 1);
        let nt = 20;
        let mut data = baseline_series(dims, nt);
        let n_vox = 4;
        // Spikes in voxel 0 (inside) and voxel 3 (outside)
        data[0 + 10 * n_vox] = 5000.0;
        data[3 + 10 * n_vox] = 5000.0;
        let series = VolumeSeries::new(data, dims, nt).unwrap();
        let mask = Mask::from_u8(vec![1, 1, 1, 0], dims).unwrap();

        let params = DespikeParams { window: Some(3), ..DespikeParams::default() };
        let (out, report) = despike(&series, &mask, &params).unwrap();

        assert!(report.despiked);
        assert!(out.value(0, 10) < 5000.0);
        assert_eq!(out.value(3, 10), 5000.0);
        assert!(!report.classification.get(3, 10));
        assert_eq!(report.n_mask_voxels, 3);
    }

    #[test]
    fn test_mask_shape_mismatch() {
        let series = VolumeSeries::new(vec![0.0; 8 * 5], (2, 2, 2), 5).unwrap();
        let mask = Mask::full((2, 2, 1));
        let result = despike_default(&series, &mask);
        assert!(matches!(result, Err(QcError::InputShape { .. })));
    }

    #[test]
    fn test_invalid_window_rejected() {
        let dims = (2, 1, 1);
        let series = VolumeSeries::new(baseline_series(dims, 10), dims, 10).unwrap();
        let mask = Mask::full(dims);
        for w in [1usize, 2, 11] {
            let params = DespikeParams { window: Some(w), ..DespikeParams::default() };
            assert!(matches!(despike(&series, &mask, &params), Err(QcError::Configuration(_))),
                "window {} should be rejected", w);
        }
    }

    #[test]
    fn test_too_few_timepoints() {
        let series = VolumeSeries::new(vec![1.0, 2.0], (1, 1, 1), 2).unwrap();
        let result = despike_default(&series, &Mask::full((1, 1, 1)));
        assert!(matches!(result, Err(QcError::Configuration(_))));
    }

    #[test]
    fn test_empty_mask_is_data_error() {
        let dims = (2, 1, 1);
        let series = VolumeSeries::new(baseline_series(dims, 10), dims, 10).unwrap();
        let result = despike_default(&series, &Mask::empty(dims));
        assert!(matches!(result, Err(QcError::Data(_))));
    }

    #[test]
    fn test_all_nan_is_data_error() {
        let series = VolumeSeries::new(vec![f64::NAN; 2 * 6], (2, 1, 1), 6).unwrap();
        let result = despike_default(&series, &Mask::full((2, 1, 1)));
        assert!(matches!(result, Err(QcError::Data(_))));
    }

    struct BrokenQuantiles;

    impl QuantileFunctions for BrokenQuantiles {
        fn normal_quantile(&self, _p: f64) -> Result<f64> {
            Ok(f64::NAN)
        }

        fn chi_square_quantile(&self, _p: f64, _df: f64) -> Result<f64> {
            Err(QcError::Configuration("chi-square quantile unavailable".to_string()))
        }
    }

    #[test]
    fn test_broken_quantiles_are_fatal() {
        let dims = (2, 1, 1);
        let series = VolumeSeries::new(baseline_series(dims, 10), dims, 10).unwrap();
        let result = despike_with_quantiles(
            &series, &Mask::full(dims), &DespikeParams::default(), &BrokenQuantiles, |_, _| {},
        );
        assert!(matches!(result, Err(QcError::Configuration(_))));
    }

    #[test]
    fn test_progress_reaches_total() {
        let dims = (2, 1, 1);
        let series = VolumeSeries::new(baseline_series(dims, 10), dims, 10).unwrap();
        let mut calls = Vec::new();
        despike_with_progress(&series, &Mask::full(dims), &DespikeParams::default(), |done, total| {
            calls.push((done, total));
        }).unwrap();
        assert_eq!(calls.first(), Some(&(0, 3)));
        assert_eq!(calls.last(), Some(&(3, 3)));
    }
}
