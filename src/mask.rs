//! Brain mask estimation from a 4D time series
//!
//! The algorithm:
//! 1. Box-smooth every volume to close small holes and suppress noise
//! 2. Min-max normalise the whole smoothed stack with its global extremes
//! 3. Average the normalised volumes over time
//! 4. Keep voxels whose average exceeds the threshold and whose signal
//!    changes at least once between consecutive timepoints
//!
//! Because normalisation uses the global extremes, the result does not
//! change under a positive affine rescaling of the intensities.

use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::JsonConfig;
use crate::error::{QcError, Result};
use crate::utils::box_smooth_3d;
use crate::volume::{Mask, VolumeSeries};

/// Parameters for mask estimation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskParams {
    /// Threshold on the time-averaged normalised signal, as a fraction of
    /// the global range (default 0.2)
    pub threshold: f64,
    /// Width of the isotropic smoothing box in voxels, odd (default 3)
    pub smoothing_box: usize,
}

impl Default for MaskParams {
    fn default() -> Self {
        Self {
            threshold: 0.2,
            smoothing_box: 3,
        }
    }
}

impl JsonConfig for MaskParams {}

impl MaskParams {
    fn validate(&self) -> Result<()> {
        if !self.threshold.is_finite() {
            return Err(QcError::Configuration(format!(
                "mask threshold must be finite, got {}", self.threshold
            )));
        }
        if self.smoothing_box == 0 || self.smoothing_box % 2 == 0 {
            return Err(QcError::Configuration(format!(
                "smoothing box must be a positive odd width, got {}", self.smoothing_box
            )));
        }
        Ok(())
    }
}

/// Estimate a brain mask from a time series
///
/// Degenerate input whose smoothed samples are all equal yields an empty
/// mask (no voxel can change over time). Input without any finite sample
/// is a `QcError::Data`.
pub fn estimate_mask(volumes: &VolumeSeries, params: &MaskParams) -> Result<Mask> {
    params.validate()?;

    let (nx, ny, nz) = volumes.dims();
    let n_vox = volumes.n_voxels();
    let nt = volumes.n_timepoints();
    if n_vox == 0 || nt == 0 {
        return Err(QcError::Data(format!(
            "mask estimation needs at least one voxel and one timepoint, got {:?} x {}",
            volumes.dims(), nt
        )));
    }

    info!("Estimating mask from {} volumes of {}x{}x{}", nt, nx, ny, nz);

    // Step 1: smooth each volume independently
    let mut smoothed = vec![0.0; n_vox * nt];
    smoothed.par_chunks_mut(n_vox)
        .zip(volumes.as_slice().par_chunks(n_vox))
        .for_each(|(out, vol)| {
            out.copy_from_slice(&box_smooth_3d(vol, nx, ny, nz, params.smoothing_box));
        });

    // Step 2: global extremes over finite samples
    let (min_val, max_val) = smoothed.par_iter()
        .copied()
        .filter(|v| v.is_finite())
        .map(|v| (v, v))
        .reduce(
            || (f64::INFINITY, f64::NEG_INFINITY),
            |a, b| (a.0.min(b.0), a.1.max(b.1)),
        );

    if min_val > max_val {
        return Err(QcError::Data("mask estimation input has no finite samples".to_string()));
    }
    let range = max_val - min_val;
    if range <= 0.0 {
        warn!("Mask input is constant ({}); returning an empty mask", min_val);
        return Ok(Mask::empty(volumes.dims()));
    }
    debug!("Normalising smoothed stack with range [{}, {}]", min_val, max_val);

    // Steps 3-5: temporal mean and change indicator per voxel
    let threshold = params.threshold;
    let voxels: Vec<u8> = (0..n_vox).into_par_iter()
        .map(|v| {
            let mut sum = 0.0;
            let mut changed = false;
            let mut prev = (smoothed[v] - min_val) / range;
            sum += prev;
            for t in 1..nt {
                let cur = (smoothed[v + t * n_vox] - min_val) / range;
                if (cur - prev).abs() > 0.0 {
                    changed = true;
                }
                sum += cur;
                prev = cur;
            }
            let avg = sum / nt as f64;
            u8::from(changed && avg > threshold)
        })
        .collect();

    let mask = Mask::from_u8(voxels, volumes.dims())?;
    info!("Mask contains {} of {} voxels", mask.count(), n_vox);
    Ok(mask)
}

/// Mask estimation with default parameters (threshold 0.2, 3x3x3 box)
pub fn estimate_mask_default(volumes: &VolumeSeries) -> Result<Mask> {
    estimate_mask(volumes, &MaskParams::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::idx3d;

    /// 6x6x6 series: bright cube in the middle fluctuating over time,
    /// dim constant background
    fn cube_series(nt: usize) -> VolumeSeries {
        let n = 6;
        let mut vols = Vec::new();
        for t in 0..nt {
            let mut vol = vec![10.0; n * n * n];
            for k in 1..5 {
                for j in 1..5 {
                    for i in 1..5 {
                        vol[idx3d(i, j, k, n, n)] = 1000.0 + 20.0 * ((t % 3) as f64);
                    }
                }
            }
            vols.push(vol);
        }
        VolumeSeries::from_volumes(&vols, (n, n, n)).unwrap()
    }

    #[test]
    fn test_mask_selects_bright_fluctuating_cube() {
        let series = cube_series(6);
        let mask = estimate_mask_default(&series).unwrap();
        let n = 6;
        assert!(mask.contains(idx3d(2, 2, 2, n, n)), "Cube center should be inside");
        assert!(mask.contains(idx3d(3, 3, 3, n, n)), "Cube center should be inside");
        assert!(!mask.contains(idx3d(0, 0, 0, n, n)), "Far corner should be outside");
    }

    #[test]
    fn test_constant_series_gives_empty_mask() {
        // Spatially varying but constant in time
        let n = 5;
        let vol: Vec<f64> = (0..n * n * n).map(|i| (i % 7) as f64 * 10.0).collect();
        let series = VolumeSeries::from_volumes(&vec![vol; 4], (n, n, n)).unwrap();
        for &threshold in &[-1.0, 0.0, 0.2, 0.9] {
            let params = MaskParams { threshold, ..MaskParams::default() };
            let mask = estimate_mask(&series, &params).unwrap();
            assert_eq!(mask.count(), 0, "threshold {} should give empty mask", threshold);
        }
    }

    #[test]
    fn test_fully_flat_input_clamps_to_empty() {
        let series = VolumeSeries::new(vec![3.0; 27 * 3], (3, 3, 3), 3).unwrap();
        let mask = estimate_mask_default(&series).unwrap();
        assert_eq!(mask.count(), 0);
    }

    #[test]
    fn test_affine_rescaling_invariance() {
        let series = cube_series(5);
        let scaled = VolumeSeries::new(
            series.as_slice().iter().map(|&v| 3.5 * v + 200.0).collect(),
            series.dims(),
            series.n_timepoints(),
        ).unwrap();

        let a = estimate_mask_default(&series).unwrap();
        let b = estimate_mask_default(&scaled).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_single_timepoint_is_empty() {
        let series = cube_series(1);
        let mask = estimate_mask_default(&series).unwrap();
        assert_eq!(mask.count(), 0);
    }

    #[test]
    fn test_no_finite_samples_is_data_error() {
        let series = VolumeSeries::new(vec![f64::NAN; 8 * 2], (2, 2, 2), 2).unwrap();
        assert!(matches!(estimate_mask_default(&series), Err(QcError::Data(_))));
    }

    #[test]
    fn test_even_box_rejected() {
        let series = cube_series(3);
        let params = MaskParams { smoothing_box: 4, ..MaskParams::default() };
        assert!(matches!(estimate_mask(&series, &params), Err(QcError::Configuration(_))));
    }
}
