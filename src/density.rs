//! Kernel density estimate of the p-value distribution.
//!
//! The simulator collects one group-effect p-value per valid repetition
//! and summarizes them as a Gaussian KDE over `-log10(p)`, split at the
//! significance threshold. The split masses let a reader see how the
//! repetitions divide around `alpha` without binning artifacts.

use serde::{Deserialize, Serialize};

use crate::error::{PowerError, PowerResult};

/// Default number of evaluation points on the density grid.
pub const DEFAULT_DENSITY_POINTS: usize = 256;

/// Floor for the Silverman bandwidth when the sample is (near) degenerate.
const BANDWIDTH_FLOOR: f64 = 1e-3;

/// Padding, in bandwidths, added on both sides of the sample range.
const GRID_PADDING: f64 = 3.0;

/// Gaussian kernel density estimate over transformed p-values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PValueDensity {
    /// Grid of `-log10(p)` evaluation points, ascending.
    pub xs: Vec<f64>,
    /// Density value at each grid point.
    pub ys: Vec<f64>,
    /// Kernel bandwidth used: Silverman's rule, widened to the grid
    /// spacing when the grid could not resolve a narrower kernel.
    pub bandwidth: f64,
    /// Significance threshold on the transformed scale, `-log10(alpha)`.
    pub threshold: f64,
    /// Last grid point strictly below the threshold, if any.
    pub transition_x: Option<f64>,
    /// Estimated mass on the non-significant side of the threshold.
    pub mass_not_significant: f64,
    /// Estimated mass on the significant side of the threshold.
    pub mass_significant: f64,
}

impl PValueDensity {
    /// Estimate the density of `-log10(p)` from raw p-values.
    ///
    /// P-values of exactly zero are clamped to the smallest positive
    /// double before the log transform. The grid mass is normalized to
    /// one (kernel tails clipped at the zero boundary of the transformed
    /// scale would otherwise go missing), so the two reported masses are
    /// an exact partition of unit mass at the threshold.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` when `p_values` is empty, `alpha`
    /// is outside `(0, 1]`, any p-value is outside `[0, 1]`, or
    /// `points < 2`.
    pub fn estimate(p_values: &[f64], alpha: f64, points: usize) -> PowerResult<Self> {
        if p_values.is_empty() {
            return Err(PowerError::invalid_config(
                "cannot estimate a density from zero p-values",
            ));
        }
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(PowerError::invalid_config(format!(
                "alpha must be in (0, 1], got {alpha}"
            )));
        }
        if points < 2 {
            return Err(PowerError::invalid_config(format!(
                "density grid needs at least 2 points, got {points}"
            )));
        }

        let mut samples = Vec::with_capacity(p_values.len());
        for &p in p_values {
            if !(0.0..=1.0).contains(&p) {
                return Err(PowerError::invalid_config(format!(
                    "p-value {p} outside [0, 1]"
                )));
            }
            samples.push(-p.max(f64::MIN_POSITIVE).log10());
        }

        let raw_bandwidth = silverman_bandwidth(&samples);
        let threshold = -alpha.log10();

        // The grid has to span the threshold however tight the sample is,
        // which can stretch the spacing past a narrow kernel; a kernel
        // narrower than the spacing falls between grid points, so widen it
        // to the provisional spacing first.
        let (lo, hi) = grid_bounds(&samples, threshold, raw_bandwidth);
        let provisional_dx = (hi - lo) / (points - 1) as f64;
        let bandwidth = raw_bandwidth.max(provisional_dx);
        let (lo, hi) = grid_bounds(&samples, threshold, bandwidth);
        let dx = (hi - lo) / (points - 1) as f64;

        let norm = 1.0 / (samples.len() as f64 * bandwidth * (2.0 * std::f64::consts::PI).sqrt());
        let xs: Vec<f64> = (0..points).map(|i| lo + dx * i as f64).collect();
        let mut ys: Vec<f64> = xs
            .iter()
            .map(|&x| {
                let sum: f64 = samples
                    .iter()
                    .map(|&s| {
                        let z = (x - s) / bandwidth;
                        (-0.5 * z * z).exp()
                    })
                    .sum();
                norm * sum
            })
            .collect();

        let raw_total: f64 = ys.iter().sum::<f64>() * dx;
        if raw_total > 0.0 {
            for y in &mut ys {
                *y /= raw_total;
            }
        }

        let mut mass_not_significant = 0.0;
        let mut mass_significant = 0.0;
        let mut transition_x = None;
        for (&x, &y) in xs.iter().zip(&ys) {
            if x < threshold {
                mass_not_significant += y * dx;
                transition_x = Some(x);
            } else {
                mass_significant += y * dx;
            }
        }

        Ok(Self {
            xs,
            ys,
            bandwidth,
            threshold,
            transition_x,
            mass_not_significant,
            mass_significant,
        })
    }

    /// Total grid mass, the sum of both sides.
    #[must_use]
    pub fn total_mass(&self) -> f64 {
        self.mass_not_significant + self.mass_significant
    }
}

/// Grid endpoints: the padded sample range, clamped to the transformed
/// scale's zero boundary and stretched to include the threshold.
fn grid_bounds(samples: &[f64], threshold: f64, bandwidth: f64) -> (f64, f64) {
    let min = samples.iter().copied().fold(f64::INFINITY, f64::min);
    let max = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let lo = (min - GRID_PADDING * bandwidth).max(0.0).min(threshold);
    let hi = (max + GRID_PADDING * bandwidth).max(threshold);
    (lo, hi)
}

/// Silverman's rule-of-thumb bandwidth with a degeneracy floor.
///
/// `0.9 · min(sd, iqr / 1.34) · n^(-1/5)`, falling back to the floor when
/// the sample has (near) zero spread.
fn silverman_bandwidth(samples: &[f64]) -> f64 {
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    let sd = (samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n).sqrt();

    let mut sorted = samples.to_vec();
    sorted.sort_by(f64::total_cmp);
    let quartile = |q: f64| -> f64 {
        let idx = q * (sorted.len() - 1) as f64;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let lo = idx.floor() as usize;
        let hi = idx.ceil() as usize;
        let frac = idx - idx.floor();
        sorted[lo] * (1.0 - frac) + sorted[hi] * frac
    };
    let iqr = quartile(0.75) - quartile(0.25);

    let spread = if iqr > 0.0 { sd.min(iqr / 1.34) } else { sd };
    let bandwidth = 0.9 * spread * n.powf(-0.2);
    if bandwidth.is_finite() && bandwidth > BANDWIDTH_FLOOR {
        bandwidth
    } else {
        BANDWIDTH_FLOOR
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_mass_is_one() {
        // Normalization makes the grid mass exactly one even when kernel
        // tails are clipped at the zero boundary.
        let ps = [0.001, 0.003, 0.01, 0.02, 0.04, 0.06, 0.2, 0.5, 0.8, 0.03];
        let density = PValueDensity::estimate(&ps, 0.05, 512).unwrap();
        assert!(
            (density.total_mass() - 1.0).abs() < 1e-9,
            "total mass {}",
            density.total_mass()
        );
    }

    #[test]
    fn test_masses_split_at_threshold() {
        // All p-values far below alpha: nearly all mass is significant.
        let tiny: Vec<f64> = (1..=20).map(|i| 1e-6 * i as f64).collect();
        let density = PValueDensity::estimate(&tiny, 0.05, 256).unwrap();
        assert!(density.mass_significant > 0.9 * density.total_mass());

        // All p-values far above alpha: nearly all mass is not.
        let large: Vec<f64> = (1..=20).map(|i| 0.3 + 0.03 * i as f64).collect();
        let density = PValueDensity::estimate(&large, 0.05, 256).unwrap();
        assert!(density.mass_not_significant > 0.9 * density.total_mass());
    }

    #[test]
    fn test_threshold_is_log_alpha() {
        let density = PValueDensity::estimate(&[0.2, 0.4], 0.05, 64).unwrap();
        assert!((density.threshold - 0.05f64.log10().abs()).abs() < 1e-12);
    }

    #[test]
    fn test_transition_point_precedes_threshold() {
        let ps = [0.001, 0.01, 0.2, 0.6];
        let density = PValueDensity::estimate(&ps, 0.05, 128).unwrap();
        let transition = density.transition_x.unwrap();
        assert!(transition < density.threshold);
        // And it is the last grid point below the threshold.
        let next = density
            .xs
            .iter()
            .find(|&&x| x > transition)
            .copied()
            .unwrap();
        assert!(next >= density.threshold);
    }

    #[test]
    fn test_degenerate_identical_p_values() {
        // Zero spread falls back to the bandwidth floor instead of NaN,
        // and a spike narrower than the threshold-stretched grid spacing
        // must not slip between grid points.
        let density = PValueDensity::estimate(&[0.2; 30], 0.05, 128).unwrap();
        assert!(density.bandwidth >= 1e-3);
        assert!(density.ys.iter().all(|y| y.is_finite()));
        assert!(
            (density.total_mass() - 1.0).abs() < 1e-9,
            "total mass {}",
            density.total_mass()
        );
        assert!(density.mass_not_significant > 0.9);
    }

    #[test]
    fn test_spike_bandwidth_resolves_grid_spacing() {
        // A degenerate sample far from the threshold stretches the grid;
        // the kernel must widen to at least the resulting spacing.
        let density = PValueDensity::estimate(&[0.2; 30], 0.05, 128).unwrap();
        let dx = density.xs[1] - density.xs[0];
        assert!(
            density.bandwidth >= dx * 0.99,
            "bandwidth {} below spacing {dx}",
            density.bandwidth
        );
    }

    #[test]
    fn test_zero_p_value_is_clamped() {
        let density = PValueDensity::estimate(&[0.0, 0.01, 0.5], 0.05, 128).unwrap();
        assert!(density.xs.iter().all(|x| x.is_finite()));
        assert!(density.ys.iter().all(|y| y.is_finite()));
    }

    #[test]
    fn test_grid_is_ascending_and_sized() {
        let density = PValueDensity::estimate(&[0.1, 0.2, 0.3], 0.05, 77).unwrap();
        assert_eq!(density.xs.len(), 77);
        assert_eq!(density.ys.len(), 77);
        assert!(density.xs.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_rejects_bad_inputs() {
        assert!(PValueDensity::estimate(&[], 0.05, 128).is_err());
        assert!(PValueDensity::estimate(&[0.5], 0.0, 128).is_err());
        assert!(PValueDensity::estimate(&[0.5], 1.5, 128).is_err());
        assert!(PValueDensity::estimate(&[1.5], 0.05, 128).is_err());
        assert!(PValueDensity::estimate(&[-0.1], 0.05, 128).is_err());
        assert!(PValueDensity::estimate(&[0.5], 0.05, 1).is_err());
    }

    #[test]
    fn test_grid_always_spans_threshold() {
        // Even when every sample sits on one side, the grid must cross
        // the threshold so both masses are defined.
        let density = PValueDensity::estimate(&[0.9, 0.95, 0.99], 0.05, 64).unwrap();
        let first = density.xs[0];
        let last = *density.xs.last().unwrap();
        assert!(first <= density.threshold);
        assert!(last >= density.threshold);
        // Samples this close to zero have kernel mass clipped at the
        // boundary; normalization must make up for it.
        assert!((density.total_mass() - 1.0).abs() < 1e-9);
    }
}
