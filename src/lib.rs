//! fMRI-QC: time-series quality control for functional MRI
//!
//! This crate cleans 4D fMRI series before statistical analysis.
//!
//! # Modules
//! - `mask`: Brain mask estimation from the series itself
//! - `despike`: Voxel/volume outlier scan and median-filter despiking
//! - `stats`: Robust statistics, detrending, quantile functions
//! - `erp`: Epoch extraction and bootstrapped group responses
//! - `nifti_io`: NIfTI reading/writing of series, masks and despiked volumes
//! - `config`: JSON loading of parameter structs
//! - `utils`: Box smoothing

// Core types
pub mod error;
pub mod volume;
pub mod config;

// Algorithm modules
pub mod stats;
pub mod utils;
pub mod mask;
pub mod despike;
pub mod erp;

// I/O modules
pub mod nifti_io;

pub use config::JsonConfig;
pub use despike::{despike, despike_default, despike_with_progress, DespikeParams, DespikeReport};
pub use error::{QcError, Result};
pub use mask::{estimate_mask, estimate_mask_default, MaskParams};
pub use volume::{Mask, VolumeSeries};
