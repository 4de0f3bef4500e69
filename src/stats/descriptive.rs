//! NaN-aware descriptive statistics.
//!
//! Every function skips missing (`NaN`) entries and returns `NaN` when too
//! few values remain, so callers can propagate "undefined" without checks.

use std::cmp::Ordering;

/// Finite entries of `x`, in order.
pub fn present(x: &[f64]) -> Vec<f64> {
    x.iter().copied().filter(|v| v.is_finite()).collect()
}

pub fn count_present(x: &[f64]) -> usize {
    x.iter().filter(|v| v.is_finite()).count()
}

pub fn mean(x: &[f64]) -> f64 {
    let (sum, n) = x
        .iter()
        .filter(|v| v.is_finite())
        .fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        f64::NAN
    } else {
        sum / n as f64
    }
}

/// Standard deviation with `ddof` delta degrees of freedom.
pub fn std_dev(x: &[f64], ddof: usize) -> f64 {
    variance(x, ddof).sqrt()
}

pub fn variance(x: &[f64], ddof: usize) -> f64 {
    let vals = present(x);
    if vals.len() <= ddof {
        return f64::NAN;
    }
    let m = vals.iter().sum::<f64>() / vals.len() as f64;
    vals.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (vals.len() - ddof) as f64
}

pub fn median(x: &[f64]) -> f64 {
    let mut v = present(x);
    if v.is_empty() {
        return f64::NAN;
    }
    v.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let n = v.len();
    if n % 2 == 1 {
        v[n / 2]
    } else {
        0.5 * (v[n / 2 - 1] + v[n / 2])
    }
}

/// Unscaled median absolute deviation from the median.
pub fn mad(x: &[f64]) -> f64 {
    let m = median(x);
    if m.is_nan() {
        return f64::NAN;
    }
    let devs: Vec<f64> = present(x).iter().map(|v| (v - m).abs()).collect();
    median(&devs)
}

/// `(x - mean) / sd` with sample SD (`ddof = 1`); missing stays missing.
/// A constant or single-valued column becomes all `NaN`.
pub fn zscore(x: &[f64]) -> Vec<f64> {
    let m = mean(x);
    let sd = std_dev(x, 1);
    x.iter()
        .map(|v| {
            if v.is_finite() && sd > 0.0 {
                (v - m) / sd
            } else {
                f64::NAN
            }
        })
        .collect()
}

/// Sample covariance over rows where both are present.
pub fn covariance(x: &[f64], y: &[f64]) -> f64 {
    let pairs: Vec<(f64, f64)> = x
        .iter()
        .zip(y)
        .filter(|(a, b)| a.is_finite() && b.is_finite())
        .map(|(a, b)| (*a, *b))
        .collect();
    if pairs.len() < 2 {
        return f64::NAN;
    }
    let n = pairs.len() as f64;
    let mx = pairs.iter().map(|p| p.0).sum::<f64>() / n;
    let my = pairs.iter().map(|p| p.1).sum::<f64>() / n;
    pairs.iter().map(|(a, b)| (a - mx) * (b - my)).sum::<f64>() / (n - 1.0)
}

/// Slope of the simple regression `y ~ 1 + x` over complete pairs.
/// Needs at least three points and non-zero spread in `x`.
pub fn simple_slope(x: &[f64], y: &[f64]) -> f64 {
    let pairs: Vec<(f64, f64)> = x
        .iter()
        .zip(y)
        .filter(|(a, b)| a.is_finite() && b.is_finite())
        .map(|(a, b)| (*a, *b))
        .collect();
    if pairs.len() < 3 {
        return f64::NAN;
    }
    let n = pairs.len() as f64;
    let mx = pairs.iter().map(|p| p.0).sum::<f64>() / n;
    let my = pairs.iter().map(|p| p.1).sum::<f64>() / n;
    let sxx: f64 = pairs.iter().map(|(a, _)| (a - mx).powi(2)).sum();
    if sxx <= f64::EPSILON {
        return f64::NAN;
    }
    let sxy: f64 = pairs.iter().map(|(a, b)| (a - mx) * (b - my)).sum();
    sxy / sxx
}
