//! Moving-median window estimation from temporal autocorrelation
//!
//! The normalised autocorrelation of every in-mask voxel series is averaged
//! into one function. The lag of its first secondary peak sets the window,
//! so a single window applies to the whole run. A peak only counts when the
//! averaged correlation is significant: white noise gives a per-voxel
//! standard error of about `1/sqrt(T)`, and averaging `n` voxels shrinks it
//! to `1/sqrt(T * n)`. The bound is that standard error times a normal
//! quantile Bonferroni-corrected over the lags searched.

use log::debug;
use rayon::prelude::*;

use crate::stats::autocorrelation;
use crate::stats::distributions::normal_quantile;
use crate::volume::VolumeSeries;

/// Smallest window the moving median accepts
pub const MIN_WINDOW: usize = 3;

/// Family-wise false-peak rate over all lags searched
pub const PEAK_SIGNIFICANCE: f64 = 0.01;

/// Result of the window estimate
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowEstimate {
    /// Window to use, at least `MIN_WINDOW` and at most the series length
    pub window: usize,
    /// Lag of the secondary autocorrelation peak, if one was found
    pub peak_lag: Option<usize>,
}

/// Smallest mean autocorrelation that counts as a peak
///
/// `nt` samples per voxel, `n_voxels` averaged series, `max_lag` lags searched.
pub fn peak_bound(nt: usize, n_voxels: usize, max_lag: usize) -> f64 {
    let lags = max_lag.max(1) as f64;
    let z = normal_quantile(1.0 - PEAK_SIGNIFICANCE / lags);
    z / ((nt * n_voxels.max(1)) as f64).sqrt()
}

/// Lag of the first local maximum after lag 0 whose value exceeds `bound`
///
/// `bound` is clamped at zero, so negative peaks never count.
pub fn first_secondary_peak(acf: &[f64], bound: f64) -> Option<usize> {
    if acf.len() < 3 {
        return None;
    }
    let bound = bound.max(0.0);
    (1..acf.len() - 1).find(|&lag| {
        acf[lag] > bound && acf[lag] > acf[lag - 1] && acf[lag] >= acf[lag + 1]
    })
}

/// Mean autocorrelation over the given voxels for lags 0..=max_lag
///
/// Voxels with zero variance or non-finite samples are left out. Returns
/// the mean and the number of contributing voxels, or `None` when no voxel
/// contributes.
pub fn mean_autocorrelation(
    volumes: &VolumeSeries,
    voxels: &[usize],
    max_lag: usize,
) -> Option<(Vec<f64>, usize)> {
    let (sum, count) = voxels.par_iter()
        .filter_map(|&v| {
            let series = volumes.voxel_series(v);
            if series.iter().any(|x| !x.is_finite()) {
                return None;
            }
            autocorrelation(&series, max_lag)
        })
        .map(|acf| (acf, 1usize))
        .reduce(
            || (vec![0.0; max_lag + 1], 0),
            |(mut a, na), (b, nb)| {
                for (x, y) in a.iter_mut().zip(b.iter()) {
                    *x += y;
                }
                (a, na + nb)
            },
        );

    if count == 0 {
        return None;
    }
    Some((sum.into_iter().map(|s| s / count as f64).collect(), count))
}

/// Estimate the moving-median window for a run
///
/// Falls back to `MIN_WINDOW` when the autocorrelation has no significant
/// peak.
pub fn estimate_window(volumes: &VolumeSeries, voxels: &[usize]) -> WindowEstimate {
    let nt = volumes.n_timepoints();
    if nt < 3 {
        return WindowEstimate { window: MIN_WINDOW, peak_lag: None };
    }

    let max_lag = nt - 1;
    let peak_lag = mean_autocorrelation(volumes, voxels, max_lag).and_then(|(acf, count)| {
        let bound = peak_bound(nt, count, max_lag);
        debug!("Autocorrelation peak bound {:.4} from {} voxels", bound, count);
        first_secondary_peak(&acf, bound)
    });

    let window = peak_lag.unwrap_or(MIN_WINDOW).max(MIN_WINDOW).min(nt);
    debug!("Autocorrelation peak lag {:?}, window {}", peak_lag, window);

    WindowEstimate { window, peak_lag }
}
