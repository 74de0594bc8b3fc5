//! Despiking report and voxel-timepoint classification arrays

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{QcError, Result};

/// 4D binary array (nx, ny, nz, t) marking voxel-timepoints
///
/// Stored densely in the same layout as `VolumeSeries`; serialised as a
/// sparse list of `(voxel, t)` events since spikes are rare.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "SparseClassification", into = "SparseClassification")]
pub struct Classification {
    dims: (usize, usize, usize),
    n_timepoints: usize,
    data: Vec<u8>,
}

#[derive(Clone, Serialize, Deserialize)]
struct SparseClassification {
    dims: (usize, usize, usize),
    n_timepoints: usize,
    events: Vec<(usize, usize)>,
}

impl From<Classification> for SparseClassification {
    fn from(c: Classification) -> Self {
        let events = c.events();
        Self { dims: c.dims, n_timepoints: c.n_timepoints, events }
    }
}

impl From<SparseClassification> for Classification {
    fn from(s: SparseClassification) -> Self {
        let mut c = Classification::new(s.dims, s.n_timepoints);
        let n_vox = c.n_voxels();
        for (voxel, t) in s.events {
            if voxel < n_vox && t < s.n_timepoints {
                c.set(voxel, t);
            }
        }
        c
    }
}

impl Classification {
    /// All-false classification
    pub fn new(dims: (usize, usize, usize), n_timepoints: usize) -> Self {
        let n = dims.0 * dims.1 * dims.2 * n_timepoints;
        Self { dims, n_timepoints, data: vec![0u8; n] }
    }

    pub fn dims(&self) -> (usize, usize, usize) {
        self.dims
    }

    pub fn n_timepoints(&self) -> usize {
        self.n_timepoints
    }

    fn n_voxels(&self) -> usize {
        self.dims.0 * self.dims.1 * self.dims.2
    }

    #[inline]
    pub fn get(&self, voxel: usize, t: usize) -> bool {
        self.data[voxel + t * self.n_voxels()] != 0
    }

    #[inline]
    pub fn set(&mut self, voxel: usize, t: usize) {
        let n = self.n_voxels();
        self.data[voxel + t * n] = 1;
    }

    /// Flat 0/1 buffer in `VolumeSeries` layout
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Number of marked voxels at timepoint `t`
    pub fn count_at(&self, t: usize) -> usize {
        let n = self.n_voxels();
        self.data[t * n..(t + 1) * n].iter().filter(|&&v| v != 0).count()
    }

    /// Total number of marked voxel-timepoints
    pub fn count(&self) -> usize {
        self.data.iter().filter(|&&v| v != 0).count()
    }

    /// All marked `(voxel, t)` pairs, ordered by time then voxel
    pub fn events(&self) -> Vec<(usize, usize)> {
        let n = self.n_voxels().max(1);
        self.data.iter()
            .enumerate()
            .filter(|(_, &v)| v != 0)
            .map(|(i, _)| (i % n, i / n))
            .collect()
    }
}

/// Summary of one despiking run
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DespikeReport {
    pub dims: (usize, usize, usize),
    pub n_timepoints: usize,
    /// Number of in-mask voxels the percentages refer to
    pub n_mask_voxels: usize,
    /// Percentage of in-mask voxels classified as outliers, per volume
    pub outlying_voxels: Vec<f64>,
    /// Volumes whose outlier percentage is itself an outlier
    pub outlier_volumes: Vec<bool>,
    /// Percentage of in-mask voxels that were despiked, per volume
    pub despiked_voxels: Vec<f64>,
    /// Whether the despiking stage ran (some volume was flagged)
    pub despiked: bool,
    /// Moving-median window used (or that would have been used)
    pub window: usize,
    /// True when the window came from the autocorrelation estimate
    pub window_estimated: bool,
    /// In-mask voxels left unchanged (non-finite samples or zero spread)
    pub skipped_voxels: usize,
    /// z threshold of the voxel outlier stage
    pub alpha: f64,
    /// Robust z threshold for flagging volumes
    pub volume_threshold: f64,
    /// Voxel outliers of the detection stage
    pub outlier_classification: Classification,
    /// Voxel-timepoints whose value was compressed
    pub classification: Classification,
}

impl DespikeReport {
    /// Number of flagged volumes
    pub fn n_outlier_volumes(&self) -> usize {
        self.outlier_volumes.iter().filter(|&&f| f).count()
    }

    /// Total number of despiked voxel-timepoints
    pub fn total_despiked(&self) -> usize {
        self.classification.count()
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Write the report as pretty-printed JSON
    pub fn save_json(&self, path: &Path) -> Result<()> {
        let json = self.to_json_string()?;
        std::fs::write(path, json)
            .map_err(|e| QcError::Io(format!("Failed to write report '{}': {}", path.display(), e)))
    }

    pub fn load_json(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| QcError::Io(format!("Failed to read report '{}': {}", path.display(), e)))?;
        Self::from_json_str(&text)
    }
}
