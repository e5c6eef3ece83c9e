//! Gaussian-density outlier filter.
//!
//! Fits an axis-independent 3-D Gaussian to a candidate point subset and
//! keeps only the points whose probability **density** exceeds a threshold:
//!
//! ```text
//! σ²ᵢ   = max(var(axisᵢ), 0.01)
//! pdf(p) = (2π)^(-3/2) · (σ²ₓ σ²ᵧ σ²_z)^(-1/2) · exp(-½ Σ (pᵢ − μᵢ)² / σ²ᵢ)
//! keep p ⇔ pdf(p) > threshold
//! ```
//!
//! The threshold is compared against a density, not a tail probability, so
//! its strictness depends on the cluster spread: a tight cluster has a high
//! peak density and survives a threshold that would wipe out a wide one.
//! The variance floor caps the peak at `(2π)^(-3/2) · 1000 ≈ 63.5`.
//!
//! Variance is the population variance (divide by `n`).

use std::f64::consts::PI;

/// Lower bound applied to each axis variance independently.
pub const VARIANCE_FLOOR: f64 = 0.01;

/// Gaussian with diagonal covariance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiagonalGaussian {
    pub mean: [f64; 3],
    /// Per-axis variance, already floored.
    pub variance: [f64; 3],
}

impl DiagonalGaussian {
    /// Fit mean and floored variance over the whole subset.
    ///
    /// Returns `None` for an empty subset or when the three slices disagree
    /// in length.
    pub fn fit(xs: &[f64], ys: &[f64], zs: &[f64]) -> Option<Self> {
        if xs.is_empty() || xs.len() != ys.len() || xs.len() != zs.len() {
            return None;
        }
        let mut mean = [0.0; 3];
        let mut variance = [0.0; 3];
        for (axis, values) in [xs, ys, zs].into_iter().enumerate() {
            let (m, v) = mean_and_variance(values);
            mean[axis] = m;
            variance[axis] = v.max(VARIANCE_FLOOR);
        }
        Some(Self { mean, variance })
    }

    /// Natural log of the density at `p`.
    pub fn log_pdf(&self, p: [f64; 3]) -> f64 {
        let mut maha = 0.0;
        let mut log_det = 0.0;
        for axis in 0..3 {
            let d = p[axis] - self.mean[axis];
            maha += d * d / self.variance[axis];
            log_det += self.variance[axis].ln();
        }
        -0.5 * (3.0 * (2.0 * PI).ln() + log_det + maha)
    }

    /// Density at `p`.
    pub fn pdf(&self, p: [f64; 3]) -> f64 {
        self.log_pdf(p).exp()
    }
}

fn mean_and_variance(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    (mean, var)
}

/// Return the subsequence of `indices` whose points are plausible members of
/// the same cluster.
///
/// `xs[i]`, `ys[i]`, `zs[i]` are the coordinates of the point `indices[i]`.
/// Order is preserved.  Empty input yields an empty result.  A subset that
/// contains a non-finite coordinate fits a non-finite mean, every density
/// is NaN and nothing is retained.
pub fn filter(xs: &[f64], ys: &[f64], zs: &[f64], indices: &[usize], threshold: f64) -> Vec<usize> {
    let Some(gaussian) = DiagonalGaussian::fit(xs, ys, zs) else {
        return Vec::new();
    };
    indices
        .iter()
        .enumerate()
        .filter(|(i, _)| gaussian.pdf([xs[*i], ys[*i], zs[*i]]) > threshold)
        .map(|(_, idx)| *idx)
        .collect()
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
