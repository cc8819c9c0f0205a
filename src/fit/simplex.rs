//! Nelder-Mead simplex minimization.
//!
//! Small derivative-free minimizer for the profiled REML deviance. The
//! objective surface is smooth and two-dimensional, so the classic
//! reflect/expand/contract/shrink scheme converges quickly. An optional
//! deadline lets the caller bound wall-clock time per fit.

use std::time::Instant;

/// Reflection coefficient.
const ALPHA: f64 = 1.0;
/// Expansion coefficient.
const GAMMA: f64 = 2.0;
/// Contraction coefficient.
const RHO: f64 = 0.5;
/// Shrink coefficient.
const SIGMA: f64 = 0.5;

/// Options controlling the simplex search.
#[derive(Debug, Clone)]
pub struct SimplexOptions {
    /// Maximum iterations before giving up.
    pub max_iter: usize,
    /// Convergence tolerance on the spread of simplex values.
    pub tol: f64,
    /// Convergence tolerance on the simplex diameter.
    ///
    /// Vertices symmetric about a minimum can share the same objective
    /// value while the simplex is still wide, so the value spread alone
    /// cannot establish convergence.
    pub point_tol: f64,
    /// Initial step added to each coordinate to form the starting simplex.
    pub step: f64,
    /// Optional wall-clock deadline.
    pub deadline: Option<Instant>,
}

impl Default for SimplexOptions {
    fn default() -> Self {
        Self {
            max_iter: 400,
            tol: 1e-10,
            point_tol: 1e-6,
            step: 1.0,
            deadline: None,
        }
    }
}

/// How the search terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimplexOutcome {
    /// Value spread fell below tolerance.
    Converged,
    /// Iteration cap reached first.
    IterationCap,
    /// Deadline expired first.
    TimedOut,
}

/// Result of a simplex minimization.
#[derive(Debug, Clone)]
pub struct SimplexResult {
    /// Best point found.
    pub point: Vec<f64>,
    /// Objective value at the best point.
    pub value: f64,
    /// Iterations performed.
    pub iterations: usize,
    /// Termination reason.
    pub outcome: SimplexOutcome,
}

/// Minimize `f` starting from `start`.
///
/// Non-finite objective values are treated as +infinity, which keeps the
/// simplex inside the feasible region without special-casing the caller.
pub fn minimize<F>(mut f: F, start: &[f64], options: &SimplexOptions) -> SimplexResult
where
    F: FnMut(&[f64]) -> f64,
{
    let n = start.len();
    let mut eval = |x: &[f64]| -> f64 {
        let v = f(x);
        if v.is_finite() {
            v
        } else {
            f64::INFINITY
        }
    };

    // Initial simplex: start plus one step along each coordinate.
    let mut simplex: Vec<(Vec<f64>, f64)> = Vec::with_capacity(n + 1);
    let v0 = eval(start);
    simplex.push((start.to_vec(), v0));
    for i in 0..n {
        let mut point = start.to_vec();
        point[i] += options.step;
        let value = eval(&point);
        simplex.push((point, value));
    }

    let mut iterations = 0;
    let outcome = loop {
        if let Some(deadline) = options.deadline {
            if Instant::now() >= deadline {
                break SimplexOutcome::TimedOut;
            }
        }
        if iterations >= options.max_iter {
            break SimplexOutcome::IterationCap;
        }
        iterations += 1;

        simplex.sort_by(|a, b| a.1.total_cmp(&b.1));
        let best = simplex[0].1;
        let worst = simplex[n].1;
        let diameter = simplex
            .iter()
            .skip(1)
            .map(|(point, _)| {
                point
                    .iter()
                    .zip(&simplex[0].0)
                    .map(|(a, b)| (a - b).abs())
                    .fold(0.0, f64::max)
            })
            .fold(0.0, f64::max);
        if worst.is_finite()
            && (worst - best).abs() <= options.tol * (best.abs() + options.tol)
            && diameter <= options.point_tol
        {
            break SimplexOutcome::Converged;
        }

        // Centroid of all points but the worst.
        let mut centroid = vec![0.0; n];
        for (point, _) in simplex.iter().take(n) {
            for (c, p) in centroid.iter_mut().zip(point) {
                *c += p;
            }
        }
        for c in &mut centroid {
            *c /= n as f64;
        }

        let blend = |from: &[f64], coeff: f64| -> Vec<f64> {
            centroid
                .iter()
                .zip(from)
                .map(|(c, x)| c + coeff * (c - x))
                .collect()
        };

        let reflected = blend(&simplex[n].0, ALPHA);
        let reflected_value = eval(&reflected);

        if reflected_value < simplex[0].1 {
            // Try expanding further along the same direction.
            let expanded = blend(&simplex[n].0, GAMMA);
            let expanded_value = eval(&expanded);
            simplex[n] = if expanded_value < reflected_value {
                (expanded, expanded_value)
            } else {
                (reflected, reflected_value)
            };
        } else if reflected_value < simplex[n - 1].1 {
            simplex[n] = (reflected, reflected_value);
        } else {
            // Contract toward the centroid.
            let contracted = blend(&simplex[n].0, -RHO);
            let contracted_value = eval(&contracted);
            if contracted_value < simplex[n].1 {
                simplex[n] = (contracted, contracted_value);
            } else {
                // Shrink everything toward the best point.
                let best_point = simplex[0].0.clone();
                for entry in simplex.iter_mut().skip(1) {
                    let point: Vec<f64> = best_point
                        .iter()
                        .zip(&entry.0)
                        .map(|(b, x)| b + SIGMA * (x - b))
                        .collect();
                    let value = eval(&point);
                    *entry = (point, value);
                }
            }
        }
    };

    simplex.sort_by(|a, b| a.1.total_cmp(&b.1));
    let (point, value) = simplex.swap_remove(0);
    SimplexResult {
        point,
        value,
        iterations,
        outcome,
    }
}
