//! Robust location/spread estimators and time-series helpers

use std::cmp::Ordering;

/// Arithmetic mean (NaN for empty input)
pub fn mean(data: &[f64]) -> f64 {
    if data.is_empty() {
        return f64::NAN;
    }
    data.iter().sum::<f64>() / data.len() as f64
}

/// Median (NaN for empty input); even lengths average the two middle values
pub fn median(data: &[f64]) -> f64 {
    if data.is_empty() {
        return f64::NAN;
    }
    let mut sorted = data.to_vec();
    sorted.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    median_of_sorted(&sorted)
}

pub(crate) fn median_of_sorted(sorted: &[f64]) -> f64 {
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Median absolute deviation about the median
pub fn mad(data: &[f64]) -> f64 {
    mad_about(data, median(data))
}

/// Median absolute deviation about a given center
pub fn mad_about(data: &[f64], center: f64) -> f64 {
    let deviations: Vec<f64> = data.iter().map(|&v| (v - center).abs()).collect();
    median(&deviations)
}

/// Least-squares polynomial fit on time rescaled to [-1, 1]
///
/// Returns coefficients `c` so that the fit at sample `i` is
/// `sum_j c[j] * u_i^j` with `u_i = 2i/(n-1) - 1`. The order is reduced to
/// `n - 1` when there are too few samples.
pub fn polyfit(y: &[f64], order: usize) -> Vec<f64> {
    let n = y.len();
    if n == 0 {
        return Vec::new();
    }
    let order = order.min(n - 1);
    let m = order + 1;
    let u = rescaled_time(n);

    // Normal equations: (V^T V) c = V^T y
    let mut ata = vec![0.0; m * m];
    let mut aty = vec![0.0; m];
    for (i, &ui) in u.iter().enumerate() {
        let mut powers = vec![1.0; 2 * m - 1];
        for p in 1..powers.len() {
            powers[p] = powers[p - 1] * ui;
        }
        for r in 0..m {
            aty[r] += powers[r] * y[i];
            for c in 0..m {
                ata[r * m + c] += powers[r + c];
            }
        }
    }

    solve_linear(&mut ata, &mut aty, m).unwrap_or_else(|| {
        let mut c = vec![0.0; m];
        c[0] = mean(y);
        c
    })
}

/// Residual of `y` about its least-squares polynomial trend
pub fn detrend_polynomial(y: &[f64], order: usize) -> Vec<f64> {
    let coef = polyfit(y, order);
    let u = rescaled_time(y.len());
    y.iter()
        .zip(u.iter())
        .map(|(&yi, &ui)| {
            let trend = coef.iter().rev().fold(0.0, |acc, &c| acc * ui + c);
            yi - trend
        })
        .collect()
}

fn rescaled_time(n: usize) -> Vec<f64> {
    if n < 2 {
        return vec![0.0; n];
    }
    let scale = 2.0 / (n - 1) as f64;
    (0..n).map(|i| i as f64 * scale - 1.0).collect()
}

/// Gaussian elimination with partial pivoting; solution is left in `b`
fn solve_linear(a: &mut [f64], b: &mut [f64], m: usize) -> Option<Vec<f64>> {
    for col in 0..m {
        let pivot = (col..m)
            .max_by(|&r1, &r2| {
                a[r1 * m + col].abs()
                    .partial_cmp(&a[r2 * m + col].abs())
                    .unwrap_or(Ordering::Equal)
            })?;
        if a[pivot * m + col].abs() < 1e-12 {
            return None;
        }
        if pivot != col {
            for c in 0..m {
                a.swap(col * m + c, pivot * m + c);
            }
            b.swap(col, pivot);
        }
        for r in (col + 1)..m {
            let factor = a[r * m + col] / a[col * m + col];
            for c in col..m {
                a[r * m + c] -= factor * a[col * m + c];
            }
            b[r] -= factor * b[col];
        }
    }

    let mut x = vec![0.0; m];
    for r in (0..m).rev() {
        let mut sum = b[r];
        for c in (r + 1)..m {
            sum -= a[r * m + c] * x[c];
        }
        x[r] = sum / a[r * m + r];
    }
    Some(x)
}

/// Normalised autocorrelation of the demeaned series for lags 0..=max_lag
///
/// Returns `None` for series with zero variance.
pub fn autocorrelation(y: &[f64], max_lag: usize) -> Option<Vec<f64>> {
    let n = y.len();
    if n == 0 {
        return None;
    }
    let mu = mean(y);
    let centered: Vec<f64> = y.iter().map(|&v| v - mu).collect();
    let c0: f64 = centered.iter().map(|&v| v * v).sum();
    if !(c0 > 0.0) || !c0.is_finite() {
        return None;
    }

    let max_lag = max_lag.min(n - 1);
    let acf = (0..=max_lag)
        .map(|lag| {
            let c: f64 = centered[..n - lag].iter()
                .zip(centered[lag..].iter())
                .map(|(&a, &b)| a * b)
                .sum();
            c / c0
        })
        .collect();
    Some(acf)
}
