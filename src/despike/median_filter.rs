//! Moving-median smoothing of voxel time series

use std::cmp::Ordering;

use crate::stats::robust::median_of_sorted;

/// Moving median with edge replication
///
/// The window covers samples `i - window/2 .. i - window/2 + window`;
/// positions before the start or past the end are replaced by the first or
/// last sample, so the filter never reads outside the series. The output
/// has the input's length and its final sample is copied unchanged.
pub fn moving_median(x: &[f64], window: usize) -> Vec<f64> {
    let n = x.len();
    if n == 0 {
        return Vec::new();
    }
    if window < 2 {
        return x.to_vec();
    }

    let half = window / 2;
    let mut out = Vec::with_capacity(n);
    let mut buf = Vec::with_capacity(window);

    for i in 0..n - 1 {
        buf.clear();
        for j in 0..window {
            let pos = (i + j).saturating_sub(half).min(n - 1);
            buf.push(x[pos]);
        }
        buf.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
        out.push(median_of_sorted(&buf));
    }
    out.push(x[n - 1]);

    out
}
