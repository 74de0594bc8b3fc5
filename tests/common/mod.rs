//! Common test utilities for fmri-qc integration tests

#![allow(dead_code)]

use fmri_qc::VolumeSeries;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

/// Compute RMSE between two arrays, only within mask (non-zero values)
pub fn rmse(a: &[f64], b: &[f64], mask: &[u8]) -> f64 {
    let mut sum_sq = 0.0;
    let mut count = 0usize;
    for i in 0..a.len() {
        if mask[i] > 0 {
            let diff = a[i] - b[i];
            sum_sq += diff * diff;
            count += 1;
        }
    }
    if count == 0 {
        return 0.0;
    }
    (sum_sq / count as f64).sqrt()
}

/// Largest absolute element-wise difference
pub fn max_abs_diff(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs()).fold(0.0, f64::max)
}

/// Alternating +-0.5 around `100 + voxel index`
///
/// Every voxel series is clean: no voxel outliers and no despike events
/// with a window of 3.
pub fn alternating_series(dims: (usize, usize, usize), nt: usize) -> VolumeSeries {
    let n_vox = dims.0 * dims.1 * dims.2;
    let mut data = vec![0.0; n_vox * nt];
    for t in 0..nt {
        let wiggle = if t % 2 == 0 { 0.5 } else { -0.5 };
        for v in 0..n_vox {
            data[v + t * n_vox] = 100.0 + v as f64 + wiggle;
        }
    }
    VolumeSeries::new(data, dims, nt).unwrap()
}

/// Bright fluctuating cube on a constant zero background
///
/// The cube spans `[lo, hi)` on every axis.
pub fn cube_phantom(n: usize, nt: usize, lo: usize, hi: usize) -> VolumeSeries {
    let n_vox = n * n * n;
    let mut data = vec![0.0; n_vox * nt];
    for t in 0..nt {
        let wiggle = if t % 2 == 0 { 5.0 } else { -5.0 };
        for k in lo..hi {
            for j in lo..hi {
                for i in lo..hi {
                    data[i + j * n + k * n * n + t * n_vox] = 1000.0 + wiggle;
                }
            }
        }
    }
    VolumeSeries::new(data, (n, n, n), nt).unwrap()
}

/// `base + N(0, sigma)` with a fixed seed
pub fn noisy_series(
    dims: (usize, usize, usize),
    nt: usize,
    base: f64,
    sigma: f64,
    seed: u64,
) -> VolumeSeries {
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Normal::new(0.0, sigma).unwrap();
    let len = dims.0 * dims.1 * dims.2 * nt;
    let data: Vec<f64> = (0..len).map(|_| base + noise.sample(&mut rng)).collect();
    VolumeSeries::new(data, dims, nt).unwrap()
}

/// Copy of `series` with `data[voxel, t]` multiplied by `factor`
pub fn with_spike(series: &VolumeSeries, voxel: usize, t: usize, factor: f64) -> VolumeSeries {
    let mut data = series.as_slice().to_vec();
    data[voxel + t * series.n_voxels()] *= factor;
    VolumeSeries::new(data, series.dims(), series.n_timepoints()).unwrap()
}

/// Unique scratch directory under the system temp dir
pub fn scratch_dir(name: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("fmri_qc_{}_{}", name, std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}
