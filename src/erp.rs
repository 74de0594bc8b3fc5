//! Event-related response analysis on cleaned series
//!
//! Region time courses are cut into epochs around event onsets, baseline
//! corrected and averaged per subject. Subject responses are combined into a
//! group response with a percentile bootstrap confidence band.

use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::JsonConfig;
use crate::error::{QcError, Result};
use crate::stats::mean;
use crate::volume::{idx3d, VolumeSeries};

/// Samples taken before and after each onset
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventWindow {
    /// Samples before the onset, used as the baseline (default 2)
    pub pre: usize,
    /// Samples from the onset on, onset included (default 10)
    pub post: usize,
}

impl Default for EventWindow {
    fn default() -> Self {
        Self { pre: 2, post: 10 }
    }
}

impl JsonConfig for EventWindow {}

impl EventWindow {
    /// Epoch length in samples
    pub fn len(&self) -> usize {
        self.pre + self.post
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// How the pre-event samples are used to normalise an epoch
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaselineMode {
    None,
    /// Subtract the baseline mean
    #[default]
    Subtract,
    /// Express samples as percent change from the baseline mean
    PercentChange,
}

/// Parameters for the group bootstrap
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErpParams {
    /// Number of bootstrap resamples (default 1000)
    pub n_boot: usize,
    /// Two-sided confidence level of the band (default 0.95)
    pub confidence: f64,
    /// Seed of the resampling generator; equal seeds give equal bands
    pub seed: u64,
}

impl Default for ErpParams {
    fn default() -> Self {
        Self {
            n_boot: 1000,
            confidence: 0.95,
            seed: 0,
        }
    }
}

impl JsonConfig for ErpParams {}

/// Group-level response with its bootstrap band
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GroupResponse {
    pub mean: Vec<f64>,
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
    pub n_subjects: usize,
}

/// Voxel coordinates within `radius` of `center`
///
/// Distances are measured in voxel units; the result is in Fortran scan
/// order (x fastest).
pub fn sphere_coordinates(
    dims: (usize, usize, usize),
    center: (f64, f64, f64),
    radius: f64,
) -> Vec<(usize, usize, usize)> {
    let (nx, ny, nz) = dims;
    let r2 = radius * radius;
    let mut coords = Vec::new();

    for k in 0..nz {
        for j in 0..ny {
            for i in 0..nx {
                let dx = i as f64 - center.0;
                let dy = j as f64 - center.1;
                let dz = k as f64 - center.2;
                if dx * dx + dy * dy + dz * dz <= r2 {
                    coords.push((i, j, k));
                }
            }
        }
    }

    coords
}

/// Mean time series over a set of voxel coordinates
pub fn roi_mean_series(series: &VolumeSeries, coords: &[(usize, usize, usize)]) -> Result<Vec<f64>> {
    let (nx, ny, nz) = series.dims();
    if coords.is_empty() {
        return Err(QcError::Data("region of interest has no voxels".to_string()));
    }

    let mut voxels = Vec::with_capacity(coords.len());
    for &(i, j, k) in coords {
        if i >= nx || j >= ny || k >= nz {
            return Err(QcError::shape(
                "region coordinate",
                format!("inside {:?}", (nx, ny, nz)),
                format!("{:?}", (i, j, k)),
            ));
        }
        voxels.push(idx3d(i, j, k, nx, ny));
    }

    let n = voxels.len() as f64;
    Ok(series.volumes()
        .map(|vol| voxels.iter().map(|&v| vol[v]).sum::<f64>() / n)
        .collect())
}

/// Cut one epoch per onset
///
/// Epoch samples are `[onset - pre, onset + post)`. Onsets whose window
/// does not fit inside the series are skipped.
pub fn extract_epochs(series: &[f64], onsets: &[usize], window: EventWindow) -> Vec<Vec<f64>> {
    let n = series.len();
    let mut epochs = Vec::with_capacity(onsets.len());

    for &onset in onsets {
        let past_end = onset.checked_add(window.post).map_or(true, |end| end > n);
        if onset < window.pre || past_end {
            debug!(
                "Skipping onset {}: window [-{}, +{}) leaves the {} samples",
                onset, window.pre, window.post, n
            );
            continue;
        }
        epochs.push(series[onset - window.pre..onset + window.post].to_vec());
    }

    epochs
}

/// Normalise an epoch by the mean of its first `pre` samples
///
/// With no baseline samples the epoch is returned unchanged. A zero
/// baseline mean cannot be expressed as percent change and gives NaN.
pub fn baseline_correct(epoch: &[f64], pre: usize, mode: BaselineMode) -> Vec<f64> {
    if pre == 0 || mode == BaselineMode::None {
        return epoch.to_vec();
    }
    let base = mean(&epoch[..pre.min(epoch.len())]);

    match mode {
        BaselineMode::None => epoch.to_vec(),
        BaselineMode::Subtract => epoch.iter().map(|&x| x - base).collect(),
        BaselineMode::PercentChange => {
            if base == 0.0 {
                vec![f64::NAN; epoch.len()]
            } else {
                epoch.iter().map(|&x| 100.0 * (x - base) / base).collect()
            }
        }
    }
}

/// Sample-wise mean of equally long epochs
pub fn average_epochs(epochs: &[Vec<f64>]) -> Result<Vec<f64>> {
    let first = epochs.first()
        .ok_or_else(|| QcError::Data("no epochs to average".to_string()))?;
    let len = first.len();
    if let Some((i, e)) = epochs.iter().enumerate().find(|(_, e)| e.len() != len) {
        return Err(QcError::Data(format!(
            "epoch {} has {} samples, expected {}", i, e.len(), len
        )));
    }

    let mut avg = vec![0.0; len];
    for epoch in epochs {
        for (a, &x) in avg.iter_mut().zip(epoch.iter()) {
            *a += x;
        }
    }
    let n = epochs.len() as f64;
    avg.iter_mut().for_each(|a| *a /= n);
    Ok(avg)
}

/// Value at fraction `q` of a sorted slice, linear interpolation between ranks
fn percentile_of_sorted(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// Group mean over subjects with a percentile bootstrap band
///
/// Each resample draws `n_subjects` responses with replacement. Resample
/// `b` uses its own generator seeded from `seed + b`, so the band depends
/// only on the seed and not on thread scheduling.
pub fn bootstrap_group_response(
    subject_responses: &[Vec<f64>],
    params: &ErpParams,
) -> Result<GroupResponse> {
    if params.n_boot == 0 {
        return Err(QcError::Configuration("n_boot must be at least 1".to_string()));
    }
    if !(params.confidence > 0.0 && params.confidence < 1.0) {
        return Err(QcError::Configuration(format!(
            "confidence must lie in (0, 1), got {}", params.confidence
        )));
    }

    let group_mean = average_epochs(subject_responses)?;
    let n_subjects = subject_responses.len();
    let len = group_mean.len();
    info!("Bootstrapping group response: {} subjects, {} resamples", n_subjects, params.n_boot);

    let resampled: Vec<Vec<f64>> = (0..params.n_boot)
        .into_par_iter()
        .map(|b| {
            let mut rng = StdRng::seed_from_u64(params.seed.wrapping_add(b as u64));
            let mut acc = vec![0.0; len];
            for _ in 0..n_subjects {
                let pick = &subject_responses[rng.gen_range(0..n_subjects)];
                for (a, &x) in acc.iter_mut().zip(pick.iter()) {
                    *a += x;
                }
            }
            acc.iter_mut().for_each(|a| *a /= n_subjects as f64);
            acc
        })
        .collect();

    let tail = (1.0 - params.confidence) / 2.0;
    let (lower, upper): (Vec<f64>, Vec<f64>) = (0..len)
        .into_par_iter()
        .map(|s| {
            let mut column: Vec<f64> = resampled.iter().map(|r| r[s]).collect();
            column.sort_by(|a, b| a.total_cmp(b));
            (percentile_of_sorted(&column, tail), percentile_of_sorted(&column, 1.0 - tail))
        })
        .unzip();

    Ok(GroupResponse {
        mean: group_mean,
        lower,
        upper,
        n_subjects,
    })
}
