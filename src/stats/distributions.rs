//! Quantile functions for the normal and chi-square distributions
//!
//! The normal quantile uses Acklam's rational approximation (relative error
//! ~1e-9) followed by one Halley step against the exact CDF. The chi-square
//! quantile uses the closed form for one degree of freedom and bisection on
//! the regularised incomplete gamma function otherwise.
//!
//! Reference:
//! Acklam, P.J. (2003). "An algorithm for computing the inverse normal
//! cumulative distribution function."
//! Press, W.H., et al. (2007). "Numerical Recipes", 3rd ed., section 6.2.

use std::f64::consts::PI;

use crate::error::{QcError, Result};

/// Statistics routines the outlier stages depend on
///
/// Implementations must return finite values for valid input and a
/// `QcError::Configuration` otherwise; the despiker never substitutes a
/// fallback constant for a failed quantile.
pub trait QuantileFunctions: Sync {
    /// Inverse standard normal CDF
    fn normal_quantile(&self, p: f64) -> Result<f64>;

    /// Inverse chi-square CDF with `df` degrees of freedom
    fn chi_square_quantile(&self, p: f64, df: f64) -> Result<f64>;
}

/// Quantile functions implemented in this crate
#[derive(Clone, Copy, Debug, Default)]
pub struct BuiltinQuantiles;

impl QuantileFunctions for BuiltinQuantiles {
    fn normal_quantile(&self, p: f64) -> Result<f64> {
        check_probability(p)?;
        Ok(normal_quantile(p))
    }

    fn chi_square_quantile(&self, p: f64, df: f64) -> Result<f64> {
        check_probability(p)?;
        if !(df > 0.0) || !df.is_finite() {
            return Err(QcError::Configuration(format!(
                "chi-square degrees of freedom must be positive, got {}", df
            )));
        }
        Ok(chi_square_quantile(p, df))
    }
}

fn check_probability(p: f64) -> Result<()> {
    if p > 0.0 && p < 1.0 {
        Ok(())
    } else {
        Err(QcError::Configuration(format!(
            "probability must lie in (0, 1), got {}", p
        )))
    }
}

//=============================================================================
// Normal distribution
//=============================================================================

const ACKLAM_A: [f64; 6] = [
    -3.969683028665376e+01, 2.209460984245205e+02, -2.759285104469687e+02,
    1.383577518672690e+02, -3.066479806614716e+01, 2.506628277459239e+00,
];
const ACKLAM_B: [f64; 5] = [
    -5.447609879822406e+01, 1.615858368580409e+02, -1.556989798598866e+02,
    6.680131188771972e+01, -1.328068155288572e+01,
];
const ACKLAM_C: [f64; 6] = [
    -7.784894002430293e-03, -3.223964580411365e-01, -2.400758277161838e+00,
    -2.549732539343734e+00, 4.374664141464968e+00, 2.938163982698783e+00,
];
const ACKLAM_D: [f64; 4] = [
    7.784695709041462e-03, 3.224671290700398e-01, 2.445134137142996e+00,
    3.754408661907416e+00,
];
const P_LOW: f64 = 0.02425;

fn acklam_tail(q: f64) -> f64 {
    let c = &ACKLAM_C;
    let d = &ACKLAM_D;
    (((((c[0] * q + c[1]) * q + c[2]) * q + c[3]) * q + c[4]) * q + c[5])
        / ((((d[0] * q + d[1]) * q + d[2]) * q + d[3]) * q + 1.0)
}

/// Inverse standard normal CDF for p in (0, 1)
pub fn normal_quantile(p: f64) -> f64 {
    let x = if p < P_LOW {
        acklam_tail((-2.0 * p.ln()).sqrt())
    } else if p <= 1.0 - P_LOW {
        let a = &ACKLAM_A;
        let b = &ACKLAM_B;
        let q = p - 0.5;
        let r = q * q;
        (((((a[0] * r + a[1]) * r + a[2]) * r + a[3]) * r + a[4]) * r + a[5]) * q
            / (((((b[0] * r + b[1]) * r + b[2]) * r + b[3]) * r + b[4]) * r + 1.0)
    } else {
        -acklam_tail((-2.0 * (1.0 - p).ln()).sqrt())
    };

    // Halley refinement
    let e = normal_cdf(x) - p;
    let u = e * (2.0 * PI).sqrt() * (x * x / 2.0).exp();
    x - u / (1.0 + x * u / 2.0)
}

/// Standard normal CDF
pub fn normal_cdf(x: f64) -> f64 {
    // erfc(|x|/sqrt2) = Q(1/2, x^2/2)
    let tail = 0.5 * gamma_q(0.5, x * x / 2.0);
    if x < 0.0 { tail } else { 1.0 - tail }
}

//=============================================================================
// Chi-square distribution
//=============================================================================

/// Chi-square CDF with `df` degrees of freedom
pub fn chi_square_cdf(x: f64, df: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    gamma_p(df / 2.0, x / 2.0)
}

/// Inverse chi-square CDF for p in (0, 1) and df > 0
pub fn chi_square_quantile(p: f64, df: f64) -> f64 {
    if df == 1.0 {
        let z = normal_quantile((1.0 + p) / 2.0);
        return z * z;
    }

    let mut hi = df.max(1.0);
    while chi_square_cdf(hi, df) < p {
        hi *= 2.0;
    }
    let mut lo = 0.0;
    for _ in 0..200 {
        let mid = 0.5 * (lo + hi);
        if chi_square_cdf(mid, df) < p {
            lo = mid;
        } else {
            hi = mid;
        }
        if hi - lo <= 1e-12 * hi.max(1.0) {
            break;
        }
    }
    0.5 * (lo + hi)
}

//=============================================================================
// Incomplete gamma function
//=============================================================================

const LANCZOS_G: f64 = 7.0;
const LANCZOS_COEF: [f64; 9] = [
    0.999_999_999_999_809_9,
    676.520_368_121_885_1,
    -1_259.139_216_722_402_8,
    771.323_428_777_653_1,
    -176.615_029_162_140_6,
    12.507_343_278_686_905,
    -0.138_571_095_265_720_12,
    9.984_369_578_019_572e-6,
    1.505_632_735_149_311_6e-7,
];

/// Natural log of the gamma function (Lanczos approximation)
pub fn ln_gamma(x: f64) -> f64 {
    if x < 0.5 {
        // Reflection formula
        return (PI / (PI * x).sin()).ln() - ln_gamma(1.0 - x);
    }
    let x = x - 1.0;
    let mut a = LANCZOS_COEF[0];
    for (i, &c) in LANCZOS_COEF.iter().enumerate().skip(1) {
        a += c / (x + i as f64);
    }
    let t = x + LANCZOS_G + 0.5;
    0.5 * (2.0 * PI).ln() + (x + 0.5) * t.ln() - t + a.ln()
}

const GAMMA_EPS: f64 = 1e-15;
const GAMMA_FPMIN: f64 = 1e-300;
const GAMMA_MAX_ITER: usize = 1000;

/// Regularised lower incomplete gamma P(a, x)
pub fn gamma_p(a: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    if x < a + 1.0 {
        gamma_series(a, x)
    } else {
        1.0 - gamma_continued_fraction(a, x)
    }
}

/// Regularised upper incomplete gamma Q(a, x) = 1 - P(a, x)
pub fn gamma_q(a: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 1.0;
    }
    if x < a + 1.0 {
        1.0 - gamma_series(a, x)
    } else {
        gamma_continued_fraction(a, x)
    }
}

fn gamma_series(a: f64, x: f64) -> f64 {
    let mut ap = a;
    let mut del = 1.0 / a;
    let mut sum = del;
    for _ in 0..GAMMA_MAX_ITER {
        ap += 1.0;
        del *= x / ap;
        sum += del;
        if del.abs() < sum.abs() * GAMMA_EPS {
            break;
        }
    }
    sum * (-x + a * x.ln() - ln_gamma(a)).exp()
}

fn gamma_continued_fraction(a: f64, x: f64) -> f64 {
    // Modified Lentz
    let mut b = x + 1.0 - a;
    let mut c = 1.0 / GAMMA_FPMIN;
    let mut d = 1.0 / b;
    let mut h = d;
    for i in 1..GAMMA_MAX_ITER {
        let an = -(i as f64) * (i as f64 - a);
        b += 2.0;
        d = an * d + b;
        if d.abs() < GAMMA_FPMIN {
            d = GAMMA_FPMIN;
        }
        c = b + an / c;
        if c.abs() < GAMMA_FPMIN {
            c = GAMMA_FPMIN;
        }
        d = 1.0 / d;
        let del = d * c;
        h *= del;
        if (del - 1.0).abs() < GAMMA_EPS {
            break;
        }
    }
    (-x + a * x.ln() - ln_gamma(a)).exp() * h
}
