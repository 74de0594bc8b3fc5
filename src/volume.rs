//! In-memory 4D time series and 3D binary masks
//!
//! Both use Fortran (column-major) ordering to match NIfTI convention:
//! voxel index = x + y*nx + z*nx*ny, and a 4D sample lives at
//! voxel + t*nx*ny*nz.

use crate::error::{QcError, Result};

/// Index into 3D array (Fortran/column-major order)
#[inline(always)]
pub fn idx3d(i: usize, j: usize, k: usize, nx: usize, ny: usize) -> usize {
    i + j * nx + k * nx * ny
}

/// Ordered sequence of T volumes sharing one (nx, ny, nz) shape
#[derive(Clone, Debug, PartialEq)]
pub struct VolumeSeries {
    data: Vec<f64>,
    dims: (usize, usize, usize),
    nt: usize,
}

impl VolumeSeries {
    /// Wrap a flat buffer of length nx*ny*nz*nt (volumes stored back to back)
    pub fn new(data: Vec<f64>, dims: (usize, usize, usize), nt: usize) -> Result<Self> {
        let expected = dims.0 * dims.1 * dims.2 * nt;
        if data.len() != expected {
            return Err(QcError::shape(
                "volume series buffer",
                format!("{} samples for {:?} x {}", expected, dims, nt),
                data.len(),
            ));
        }
        Ok(Self { data, dims, nt })
    }

    /// Stack individual 3D volumes, checking that all of them match `dims`
    pub fn from_volumes(volumes: &[Vec<f64>], dims: (usize, usize, usize)) -> Result<Self> {
        let n_vox = dims.0 * dims.1 * dims.2;
        let mut data = Vec::with_capacity(n_vox * volumes.len());
        for (t, vol) in volumes.iter().enumerate() {
            if vol.len() != n_vox {
                return Err(QcError::shape(
                    &format!("volume {}", t),
                    format!("{} voxels for {:?}", n_vox, dims),
                    vol.len(),
                ));
            }
            data.extend_from_slice(vol);
        }
        Ok(Self { data, dims, nt: volumes.len() })
    }

    pub fn dims(&self) -> (usize, usize, usize) {
        self.dims
    }

    /// Number of voxels in one volume
    pub fn n_voxels(&self) -> usize {
        self.dims.0 * self.dims.1 * self.dims.2
    }

    pub fn n_timepoints(&self) -> usize {
        self.nt
    }

    /// Flat sample buffer
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    /// Volume at timepoint `t`
    pub fn volume(&self, t: usize) -> &[f64] {
        let n = self.n_voxels();
        &self.data[t * n..(t + 1) * n]
    }

    /// Iterate over volumes in time order
    pub fn volumes(&self) -> impl Iterator<Item = &[f64]> {
        // chunks() panics on a zero size
        self.data.chunks(self.n_voxels().max(1))
    }

    #[inline]
    pub fn value(&self, voxel: usize, t: usize) -> f64 {
        self.data[voxel + t * self.n_voxels()]
    }

    /// Time series of one voxel (linear 3D index)
    pub fn voxel_series(&self, voxel: usize) -> Vec<f64> {
        let n = self.n_voxels();
        (0..self.nt).map(|t| self.data[voxel + t * n]).collect()
    }

    pub(crate) fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }
}

/// Binary 3D mask (1 = inside, 0 = outside)
#[derive(Clone, Debug, PartialEq)]
pub struct Mask {
    voxels: Vec<u8>,
    dims: (usize, usize, usize),
}

impl Mask {
    /// Build a mask from 0/1 values; any non-zero value counts as inside
    pub fn from_u8(voxels: Vec<u8>, dims: (usize, usize, usize)) -> Result<Self> {
        let expected = dims.0 * dims.1 * dims.2;
        if voxels.len() != expected {
            return Err(QcError::shape(
                "mask buffer",
                format!("{} voxels for {:?}", expected, dims),
                voxels.len(),
            ));
        }
        let voxels = voxels.into_iter().map(|v| u8::from(v != 0)).collect();
        Ok(Self { voxels, dims })
    }

    /// Mask selecting every voxel
    pub fn full(dims: (usize, usize, usize)) -> Self {
        Self { voxels: vec![1u8; dims.0 * dims.1 * dims.2], dims }
    }

    /// Mask selecting no voxel
    pub fn empty(dims: (usize, usize, usize)) -> Self {
        Self { voxels: vec![0u8; dims.0 * dims.1 * dims.2], dims }
    }

    pub fn dims(&self) -> (usize, usize, usize) {
        self.dims
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.voxels
    }

    #[inline]
    pub fn contains(&self, voxel: usize) -> bool {
        self.voxels[voxel] != 0
    }

    pub fn set(&mut self, voxel: usize, inside: bool) {
        self.voxels[voxel] = u8::from(inside);
    }

    /// Number of voxels inside the mask
    pub fn count(&self) -> usize {
        self.voxels.iter().filter(|&&v| v != 0).count()
    }

    /// Linear indices of in-mask voxels, ascending
    pub fn indices(&self) -> Vec<usize> {
        self.voxels.iter()
            .enumerate()
            .filter(|(_, &v)| v != 0)
            .map(|(i, _)| i)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_series_layout() {
        // 2x1x1 volume, 3 timepoints
        let data = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let s = VolumeSeries::new(data, (2, 1, 1), 3).unwrap();
        assert_eq!(s.n_voxels(), 2);
        assert_eq!(s.volume(1), &[3.0, 4.0]);
        assert_eq!(s.voxel_series(1), vec![2.0, 4.0, 6.0]);
        assert_eq!(s.value(0, 2), 5.0);
        assert_eq!(s.volumes().count(), 3);
    }

    #[test]
    fn test_series_wrong_length() {
        let result = VolumeSeries::new(vec![0.0; 7], (2, 2, 2), 1);
        assert!(matches!(result, Err(QcError::InputShape { .. })));
    }

    #[test]
    fn test_from_volumes_mismatch() {
        let vols = vec![vec![0.0; 8], vec![0.0; 9]];
        let result = VolumeSeries::from_volumes(&vols, (2, 2, 2));
        match result {
            Err(QcError::InputShape { context, .. }) => assert_eq!(context, "volume 1"),
            other => panic!("Expected shape error, got {:?}", other),
        }
    }

    #[test]
    fn test_mask_indices() {
        let mask = Mask::from_u8(vec![0, 2, 0, 1], (2, 2, 1)).unwrap();
        assert_eq!(mask.count(), 2);
        assert_eq!(mask.indices(), vec![1, 3]);
        assert_eq!(mask.as_slice(), &[0, 1, 0, 1]);
        assert!(mask.contains(3));
        assert!(!mask.contains(0));
    }

    #[test]
    fn test_idx3d() {
        assert_eq!(idx3d(1, 2, 3, 4, 5), 1 + 2 * 4 + 3 * 20);
    }
}
