//! Utility functions shared by the processing stages

pub mod smoothing;

pub use smoothing::{box_filter_line, box_smooth_3d};
