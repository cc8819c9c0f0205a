//! Mixed-effects model fitting.
//!
//! Fits `response ~ contrast + (1 | subject) + (1 | trial)` by restricted
//! maximum likelihood. The two variance ratios are optimized on the log
//! scale with a Nelder-Mead simplex over the profiled deviance; the
//! residual variance and fixed effects fall out analytically at each
//! evaluation. Standard errors for the variance components come from the
//! finite-difference curvature of the full deviance at the optimum, and
//! fixed-effect p-values from two-sided t tests with containment degrees
//! of freedom.

mod reml;
mod simplex;

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, StudentsT};

use crate::error::{PowerError, PowerResult};
use crate::synth::Dataset;

use reml::{RemlWorkspace, LOG_GAMMA_BOUND};
use simplex::{minimize, SimplexOptions, SimplexOutcome};

/// Variance ratio below which a random effect is considered collapsed.
pub const SINGULAR_GAMMA: f64 = 1e-6;

/// Step used by the central-difference curvature, in log-SD units.
const HESSIAN_STEP: f64 = 1e-3;

/// The five model parameters reported by a fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParameterKind {
    /// Fixed intercept.
    FixedIntercept,
    /// Fixed group-contrast coefficient.
    FixedGroupEffect,
    /// SD of the per-subject random intercept.
    SubjectInterceptSd,
    /// SD of the per-trial random intercept.
    TrialInterceptSd,
    /// Residual SD.
    ResidualSd,
}

/// One estimated parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterEstimate {
    /// Which parameter this is.
    pub kind: ParameterKind,
    /// Point estimate (a coefficient for fixed effects, an SD otherwise).
    pub estimate: f64,
    /// Standard error; NaN when the curvature is unavailable.
    pub std_error: f64,
    /// Two-sided p-value; fixed effects only.
    pub p_value: Option<f64>,
}

/// Outcome of one successful model fit.
///
/// A singular fit (a variance component on the zero boundary) is a valid
/// outcome and is reported here rather than as an error; callers that
/// cannot use one should go through [`require_nonsingular`](Self::require_nonsingular).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitResult {
    /// All five parameter estimates.
    pub parameters: Vec<ParameterEstimate>,
    /// REML deviance at the optimum.
    pub deviance: f64,
    /// Optimizer iterations spent.
    pub iterations: usize,
    /// Whether any variance component collapsed to the boundary.
    pub singular: bool,
    /// The collapsed components, empty when `singular` is false.
    pub singular_components: Vec<ParameterKind>,
    /// Number of observations fitted.
    pub n_observations: usize,
}

impl FitResult {
    /// Look up one parameter estimate by kind.
    #[must_use]
    pub fn parameter(&self, kind: ParameterKind) -> Option<&ParameterEstimate> {
        self.parameters.iter().find(|p| p.kind == kind)
    }

    /// Upgrade a singular fit into a hard error.
    ///
    /// # Errors
    ///
    /// Returns `SingularFit` naming the first collapsed component.
    pub fn require_nonsingular(&self) -> PowerResult<&Self> {
        if let Some(&component) = self.singular_components.first() {
            let estimate = self
                .parameter(component)
                .map_or(0.0, |p| p.estimate);
            return Err(PowerError::SingularFit {
                component,
                estimate,
            });
        }
        Ok(self)
    }
}

/// REML fitter for the two-way crossed random-intercept model.
#[derive(Debug, Clone)]
pub struct MixedModelFitter {
    /// Simplex iteration cap.
    pub max_iterations: usize,
    /// Simplex convergence tolerance.
    pub tolerance: f64,
    /// Optional wall-clock budget per fit.
    pub timeout: Option<Duration>,
}

impl Default for MixedModelFitter {
    fn default() -> Self {
        Self {
            max_iterations: 400,
            tolerance: 1e-10,
            timeout: None,
        }
    }
}

impl MixedModelFitter {
    /// Fitter with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-fit wall-clock budget.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the simplex iteration cap.
    #[must_use]
    pub const fn max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Fit the model to one dataset.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` for unfittable datasets and
    /// `NonConvergence` when the optimizer hits its iteration cap or
    /// deadline, or never finds a feasible point.
    pub fn fit(&self, data: &Dataset) -> PowerResult<FitResult> {
        let ws = RemlWorkspace::from_dataset(data)?;

        let options = SimplexOptions {
            max_iter: self.max_iterations,
            tol: self.tolerance,
            deadline: self.timeout.map(|t| Instant::now() + t),
            ..SimplexOptions::default()
        };
        let objective = |x: &[f64]| {
            ws.profiled(x[0], x[1])
                .map_or(f64::INFINITY, |eval| eval.deviance)
        };
        let search = minimize(objective, &[0.0, 0.0], &options);

        match search.outcome {
            SimplexOutcome::Converged => {}
            SimplexOutcome::IterationCap => {
                return Err(PowerError::non_convergence(
                    search.iterations,
                    "iteration cap reached",
                ));
            }
            SimplexOutcome::TimedOut => {
                return Err(PowerError::non_convergence(
                    search.iterations,
                    "fit deadline expired",
                ));
            }
        }
        if !search.value.is_finite() {
            return Err(PowerError::non_convergence(
                search.iterations,
                "no feasible point found",
            ));
        }

        let eval = ws
            .profiled(search.point[0], search.point[1])
            .ok_or_else(|| {
                PowerError::non_convergence(search.iterations, "optimum is infeasible")
            })?;

        let gamma_s = search.point[0].clamp(-LOG_GAMMA_BOUND, LOG_GAMMA_BOUND).exp();
        let gamma_t = search.point[1].clamp(-LOG_GAMMA_BOUND, LOG_GAMMA_BOUND).exp();
        let sigma2 = eval.sigma2;
        let sd_subject = (gamma_s * sigma2).sqrt();
        let sd_trial = (gamma_t * sigma2).sqrt();
        let sd_residual = sigma2.sqrt();

        let mut singular_components = Vec::new();
        if gamma_s < SINGULAR_GAMMA {
            singular_components.push(ParameterKind::SubjectInterceptSd);
        }
        if gamma_t < SINGULAR_GAMMA {
            singular_components.push(ParameterKind::TrialInterceptSd);
        }
        let singular = !singular_components.is_empty();

        // Curvature in log-SD coordinates; skipped on the boundary where
        // the quadratic approximation is meaningless.
        let variance_ses = if singular {
            [f64::NAN; 3]
        } else {
            variance_std_errors(&ws, sd_subject, sd_trial, sd_residual)
        };

        let subjects = ws.subjects() as f64;
        let intercept = fixed_effect(
            ParameterKind::FixedIntercept,
            eval.beta[0],
            eval.beta_cov[(0, 0)],
            (subjects - 1.0).max(1.0),
        );
        let group_effect = fixed_effect(
            ParameterKind::FixedGroupEffect,
            eval.beta[1],
            eval.beta_cov[(1, 1)],
            (subjects - 2.0).max(1.0),
        );

        let parameters = vec![
            intercept,
            group_effect,
            ParameterEstimate {
                kind: ParameterKind::SubjectInterceptSd,
                estimate: sd_subject,
                std_error: variance_ses[0],
                p_value: None,
            },
            ParameterEstimate {
                kind: ParameterKind::TrialInterceptSd,
                estimate: sd_trial,
                std_error: variance_ses[1],
                p_value: None,
            },
            ParameterEstimate {
                kind: ParameterKind::ResidualSd,
                estimate: sd_residual,
                std_error: variance_ses[2],
                p_value: None,
            },
        ];

        Ok(FitResult {
            parameters,
            deviance: eval.deviance,
            iterations: search.iterations,
            singular,
            singular_components,
            n_observations: ws.n(),
        })
    }
}

/// Build one fixed-effect estimate with its t-test p-value.
fn fixed_effect(kind: ParameterKind, estimate: f64, variance: f64, df: f64) -> ParameterEstimate {
    let std_error = if variance > 0.0 {
        variance.sqrt()
    } else {
        f64::NAN
    };
    let p_value = if std_error.is_finite() && std_error > 0.0 {
        two_sided_t(estimate / std_error, df)
    } else {
        None
    };
    ParameterEstimate {
        kind,
        estimate,
        std_error,
        p_value,
    }
}

/// Two-sided p-value for a t statistic with `df` degrees of freedom.
fn two_sided_t(t: f64, df: f64) -> Option<f64> {
    if !t.is_finite() {
        return None;
    }
    let dist = StudentsT::new(0.0, 1.0, df).ok()?;
    let p = 2.0 * (1.0 - dist.cdf(t.abs()));
    Some(p.clamp(0.0, 1.0))
}

/// Delta-method standard errors for the three SD parameters.
///
/// Works in `θ = ln sd` coordinates where `d sd / d θ = sd`. The
/// covariance of `θ̂` is `2 H⁻¹` with `H` the deviance Hessian; any
/// failure along the way yields NaN entries rather than an error.
fn variance_std_errors(
    ws: &RemlWorkspace,
    sd_subject: f64,
    sd_trial: f64,
    sd_residual: f64,
) -> [f64; 3] {
    let fallback = [f64::NAN; 3];
    if !(sd_subject > 0.0 && sd_trial > 0.0 && sd_residual > 0.0) {
        return fallback;
    }
    let theta = [sd_subject.ln(), sd_trial.ln(), sd_residual.ln()];
    let f = |t: &[f64; 3]| -> Option<f64> {
        ws.full_deviance(
            (2.0 * t[0]).exp(),
            (2.0 * t[1]).exp(),
            (2.0 * t[2]).exp(),
        )
    };

    let Some(hessian) = central_hessian(&theta, f) else {
        return fallback;
    };
    let Some(cov) = hessian.try_inverse().map(|inv| 2.0 * inv) else {
        return fallback;
    };

    let mut ses = [f64::NAN; 3];
    let sds = [sd_subject, sd_trial, sd_residual];
    for k in 0..3 {
        let var = cov[(k, k)];
        if var.is_finite() && var > 0.0 {
            ses[k] = sds[k] * var.sqrt();
        }
    }
    ses
}

/// 3×3 central-difference Hessian of `f` at `theta`.
fn central_hessian<F>(theta: &[f64; 3], f: F) -> Option<nalgebra::DMatrix<f64>>
where
    F: Fn(&[f64; 3]) -> Option<f64>,
{
    let h = HESSIAN_STEP;
    let at = |ds: f64, dt: f64, de: f64| -> Option<f64> {
        f(&[theta[0] + ds, theta[1] + dt, theta[2] + de])
    };
    let center = at(0.0, 0.0, 0.0)?;

    let mut hess = nalgebra::DMatrix::zeros(3, 3);
    for k in 0..3 {
        let mut plus = [0.0; 3];
        let mut minus = [0.0; 3];
        plus[k] = h;
        minus[k] = -h;
        let fp = at(plus[0], plus[1], plus[2])?;
        let fm = at(minus[0], minus[1], minus[2])?;
        hess[(k, k)] = (fp - 2.0 * center + fm) / (h * h);
    }
    for k in 0..3 {
        for l in (k + 1)..3 {
            let mut pp = [0.0; 3];
            pp[k] = h;
            pp[l] = h;
            let mut pm = [0.0; 3];
            pm[k] = h;
            pm[l] = -h;
            let mut mp = [0.0; 3];
            mp[k] = -h;
            mp[l] = h;
            let mut mm = [0.0; 3];
            mm[k] = -h;
            mm[l] = -h;
            let value = (at(pp[0], pp[1], pp[2])? - at(pm[0], pm[1], pm[2])?
                - at(mp[0], mp[1], mp[2])?
                + at(mm[0], mm[1], mm[2])?)
                / (4.0 * h * h);
            hess[(k, l)] = value;
            hess[(l, k)] = value;
        }
    }
    hess.iter().all(|v| v.is_finite()).then_some(hess)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DesignParams;
    use crate::design::{generate_design, Group, CONTRAST_A, CONTRAST_B};
    use crate::rng::SimRng;
    use crate::synth::{synthesize, Observation};

    fn simulate(seed: u64) -> Dataset {
        let params = DesignParams::builder()
            .subjects(30)
            .trials(12)
            .intercept(2.0)
            .group_effect(1.0)
            .subject_sd(0.5)
            .trial_sd(0.3)
            .residual_sd(0.4)
            .build()
            .unwrap();
        let skeleton = generate_design(&params).unwrap();
        synthesize(&skeleton, &params, &mut SimRng::new(seed))
    }

    #[test]
    fn test_recovers_generating_parameters() {
        let fit = MixedModelFitter::new().fit(&simulate(17)).unwrap();
        assert_eq!(fit.n_observations, 360);
        assert_eq!(fit.parameters.len(), 5);

        let intercept = fit.parameter(ParameterKind::FixedIntercept).unwrap();
        let effect = fit.parameter(ParameterKind::FixedGroupEffect).unwrap();
        let residual = fit.parameter(ParameterKind::ResidualSd).unwrap();

        assert!((intercept.estimate - 2.0).abs() < 0.5, "{}", intercept.estimate);
        assert!((effect.estimate - 1.0).abs() < 0.6, "{}", effect.estimate);
        assert!((residual.estimate - 0.4).abs() < 0.1, "{}", residual.estimate);
    }

    #[test]
    fn test_fixed_effects_have_p_values() {
        let fit = MixedModelFitter::new().fit(&simulate(23)).unwrap();
        for kind in [ParameterKind::FixedIntercept, ParameterKind::FixedGroupEffect] {
            let p = fit.parameter(kind).unwrap().p_value;
            let p = p.unwrap();
            assert!((0.0..=1.0).contains(&p), "{kind:?}: p = {p}");
        }
        for kind in [
            ParameterKind::SubjectInterceptSd,
            ParameterKind::TrialInterceptSd,
            ParameterKind::ResidualSd,
        ] {
            assert!(fit.parameter(kind).unwrap().p_value.is_none());
        }
    }

    #[test]
    fn test_large_true_effect_is_significant() {
        // Effect of 1.0 against a subject SD of 0.5 is huge; the test
        // should reject comfortably.
        let fit = MixedModelFitter::new().fit(&simulate(31)).unwrap();
        let p = fit
            .parameter(ParameterKind::FixedGroupEffect)
            .unwrap()
            .p_value
            .unwrap();
        assert!(p < 0.05, "p = {p}");
    }

    #[test]
    fn test_nonsingular_fit_has_finite_std_errors() {
        let fit = MixedModelFitter::new().fit(&simulate(41)).unwrap();
        if !fit.singular {
            for p in &fit.parameters {
                assert!(p.std_error.is_finite() && p.std_error > 0.0, "{:?}", p.kind);
            }
        }
    }

    #[test]
    fn test_fit_is_deterministic() {
        let data = simulate(5);
        let a = MixedModelFitter::new().fit(&data).unwrap();
        let b = MixedModelFitter::new().fit(&data).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_expired_timeout_is_non_convergence() {
        let fitter = MixedModelFitter::new().timeout(Duration::from_millis(0));
        let result = fitter.fit(&simulate(3));
        assert!(matches!(result, Err(PowerError::NonConvergence { .. })));
    }

    #[test]
    fn test_tiny_iteration_cap_is_non_convergence() {
        let fitter = MixedModelFitter::new().max_iterations(1);
        let result = fitter.fit(&simulate(3));
        assert!(matches!(result, Err(PowerError::NonConvergence { .. })));
    }

    /// A dataset with structurally zero between-subject variance: the
    /// deterministic perturbation averages out within every subject, so
    /// the subject variance estimate sits on the boundary.
    fn zero_subject_variance_dataset() -> Dataset {
        let subjects = 10;
        let trials = 6;
        let mut observations = Vec::with_capacity(subjects * trials);
        for subject in 0..subjects {
            let group = if subject < subjects / 2 {
                Group::Treatment
            } else {
                Group::Control
            };
            let contrast = if group == Group::Treatment {
                CONTRAST_A
            } else {
                CONTRAST_B
            };
            for trial in 0..trials {
                let wiggle = if (subject + trial) % 2 == 0 { 0.1 } else { -0.1 };
                observations.push(Observation {
                    subject,
                    trial,
                    group,
                    contrast,
                    response: trial as f64 + wiggle,
                });
            }
        }
        Dataset {
            observations,
            subject_count: subjects,
            trial_count: trials,
        }
    }

    #[test]
    fn test_singular_fit_is_flagged_not_failed() {
        let fit = MixedModelFitter::new()
            .fit(&zero_subject_variance_dataset())
            .unwrap();
        assert!(fit.singular);
        assert!(fit
            .singular_components
            .contains(&ParameterKind::SubjectInterceptSd));

        let err = fit.require_nonsingular().unwrap_err();
        assert!(matches!(err, PowerError::SingularFit { .. }));
    }

    #[test]
    fn test_require_nonsingular_passes_clean_fit() {
        let fit = MixedModelFitter::new().fit(&simulate(47)).unwrap();
        if !fit.singular {
            assert!(fit.require_nonsingular().is_ok());
        }
    }

    #[test]
    fn test_intercept_tracks_grand_mean() {
        // Balanced design with symmetric contrast coding: the intercept
        // estimates the grand mean.
        let data = simulate(53);
        let grand_mean: f64 = data.observations.iter().map(|o| o.response).sum::<f64>()
            / data.len() as f64;
        let fit = MixedModelFitter::new().fit(&data).unwrap();
        let intercept = fit.parameter(ParameterKind::FixedIntercept).unwrap();
        assert!(
            (intercept.estimate - grand_mean).abs() < 0.1,
            "{} vs {grand_mean}",
            intercept.estimate
        );
    }
}
