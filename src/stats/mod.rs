//! Statistics primitives used by the outlier and despiking stages
//!
//! - `robust`: median, MAD, polynomial detrending, autocorrelation
//! - `distributions`: normal and chi-square quantiles behind the
//!   `QuantileFunctions` trait

pub mod distributions;
pub mod robust;

pub use distributions::{BuiltinQuantiles, QuantileFunctions};
pub use robust::{autocorrelation, detrend_polynomial, mad, mad_about, mean, median, polyfit};
