//! Profiled REML computations for the two-way crossed random-intercept model.
//!
//! Model: `y = Xβ + Z_s b_s + Z_t b_t + ε` with `X = [1, contrast]`,
//! `b_s ~ N(0, σ_s² I)`, `b_t ~ N(0, σ_t² I)`, `ε ~ N(0, σ² I)`.
//!
//! Everything is computed from sufficient statistics through the
//! mixed-model-equations / Woodbury form, so each deviance evaluation
//! needs only one Cholesky of the `(S + T) × (S + T)` matrix
//! `M = Z'Z + Λ⁻¹` with `Λ = diag(γ_s I_S, γ_t I_T)` and
//! `γ_• = σ_•² / σ²`:
//!
//! - `Ṽ⁻¹ = I − Z M⁻¹ Z'` for `Ṽ = V / σ²`
//! - `log|Ṽ| = log|M| + S log γ_s + T log γ_t`
//! - profiled `σ̂² = y'P̃y / (n − p)` (REML divisor)

use nalgebra::{Cholesky, DMatrix, DVector};

use crate::error::{PowerError, PowerResult};
use crate::synth::Dataset;

/// Number of fixed-effect columns (intercept, group contrast).
const P: usize = 2;

/// Bound on `ln γ`; keeps `M` numerically sane at the edges.
pub(crate) const LOG_GAMMA_BOUND: f64 = 15.0;

const LN_2PI: f64 = 1.837_877_066_409_345_6;

/// Sufficient statistics of one dataset for REML evaluation.
#[derive(Debug, Clone)]
pub(crate) struct RemlWorkspace {
    /// Observations.
    n: usize,
    /// Subjects.
    s: usize,
    /// Trials.
    t: usize,
    /// X'X (2×2).
    xtx: DMatrix<f64>,
    /// X'y (2).
    xty: DVector<f64>,
    /// y'y.
    yty: f64,
    /// Z'X (q×2), subject rows first.
    ztx: DMatrix<f64>,
    /// Z'y (q).
    zty: DVector<f64>,
    /// Z'Z (q×q).
    ztz: DMatrix<f64>,
}

/// One profiled REML evaluation at fixed variance ratios.
#[derive(Debug, Clone)]
pub(crate) struct ProfiledEval {
    /// REML deviance (-2 restricted log-likelihood).
    pub deviance: f64,
    /// Profiled residual variance estimate.
    pub sigma2: f64,
    /// Fixed-effect estimates `[intercept, group]`.
    pub beta: DVector<f64>,
    /// Covariance of the fixed-effect estimates.
    pub beta_cov: DMatrix<f64>,
}

impl RemlWorkspace {
    /// Accumulate sufficient statistics from a dataset.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` if the dataset is too small to
    /// identify the model or carries out-of-range identifiers.
    pub fn from_dataset(data: &Dataset) -> PowerResult<Self> {
        let n = data.observations.len();
        let s = data.subject_count;
        let t = data.trial_count;
        if s < 2 || t < 1 || n <= P {
            return Err(PowerError::invalid_config(format!(
                "dataset too small to fit: {s} subjects, {t} trials, {n} rows"
            )));
        }

        let q = s + t;
        let mut xtx = DMatrix::zeros(P, P);
        let mut xty = DVector::zeros(P);
        let mut yty = 0.0;
        let mut ztx = DMatrix::zeros(q, P);
        let mut zty = DVector::zeros(q);
        let mut ztz = DMatrix::zeros(q, q);

        for obs in &data.observations {
            if obs.subject >= s || obs.trial >= t {
                return Err(PowerError::invalid_config(format!(
                    "observation ({}, {}) outside design {s}×{t}",
                    obs.subject, obs.trial
                )));
            }
            if !obs.response.is_finite() || !obs.contrast.is_finite() {
                return Err(PowerError::invalid_config(
                    "non-finite response or contrast in dataset",
                ));
            }

            let c = obs.contrast;
            let y = obs.response;
            let i = obs.subject;
            let j = s + obs.trial;

            xtx[(0, 0)] += 1.0;
            xtx[(0, 1)] += c;
            xtx[(1, 0)] += c;
            xtx[(1, 1)] += c * c;
            xty[0] += y;
            xty[1] += c * y;
            yty += y * y;

            ztx[(i, 0)] += 1.0;
            ztx[(i, 1)] += c;
            ztx[(j, 0)] += 1.0;
            ztx[(j, 1)] += c;
            zty[i] += y;
            zty[j] += y;

            ztz[(i, i)] += 1.0;
            ztz[(j, j)] += 1.0;
            ztz[(i, j)] += 1.0;
            ztz[(j, i)] += 1.0;
        }

        Ok(Self {
            n,
            s,
            t,
            xtx,
            xty,
            yty,
            ztx,
            zty,
            ztz,
        })
    }

    /// Observation count.
    pub const fn n(&self) -> usize {
        self.n
    }

    /// Subject count.
    pub const fn subjects(&self) -> usize {
        self.s
    }

    /// Trial count.
    pub const fn trials(&self) -> usize {
        self.t
    }

    /// Residual degrees of freedom used by the REML divisor.
    pub const fn residual_df(&self) -> usize {
        self.n - P
    }

    /// Solve `M u = [Z'X | Z'y]` and derive the reduced quantities.
    ///
    /// Returns `(log|M|, Ã, b̃, y'Ṽ⁻¹y)` where `Ã = X'Ṽ⁻¹X` and
    /// `b̃ = X'Ṽ⁻¹y`, or `None` when `M` fails to factor.
    fn reduce(&self, gamma_s: f64, gamma_t: f64) -> Option<(f64, DMatrix<f64>, DVector<f64>, f64)> {
        let q = self.s + self.t;
        let mut m = self.ztz.clone();
        for i in 0..self.s {
            m[(i, i)] += 1.0 / gamma_s;
        }
        for j in 0..self.t {
            m[(self.s + j, self.s + j)] += 1.0 / gamma_t;
        }

        let chol = Cholesky::new(m)?;
        let logdet_m: f64 = chol.l().diagonal().iter().map(|d| 2.0 * d.ln()).sum();

        let mut rhs = DMatrix::zeros(q, P + 1);
        rhs.view_mut((0, 0), (q, P)).copy_from(&self.ztx);
        rhs.view_mut((0, P), (q, 1)).copy_from(&self.zty);
        let sol = chol.solve(&rhs);

        let ztx_t = self.ztx.transpose();
        let a_tilde = &self.xtx - &ztx_t * sol.columns(0, P);
        let b_tilde = &self.xty - &ztx_t * sol.column(P);
        let yvy = self.yty - self.zty.dot(&sol.column(P));

        Some((logdet_m, a_tilde, b_tilde, yvy))
    }

    /// Evaluate the profiled REML deviance at `(ln γ_s, ln γ_t)`.
    ///
    /// The residual variance is profiled out analytically; `None` marks an
    /// infeasible or degenerate point (the optimizer treats it as +inf).
    pub fn profiled(&self, log_gamma_s: f64, log_gamma_t: f64) -> Option<ProfiledEval> {
        let gamma_s = log_gamma_s.clamp(-LOG_GAMMA_BOUND, LOG_GAMMA_BOUND).exp();
        let gamma_t = log_gamma_t.clamp(-LOG_GAMMA_BOUND, LOG_GAMMA_BOUND).exp();

        let (logdet_m, a_tilde, b_tilde, yvy) = self.reduce(gamma_s, gamma_t)?;

        let a_det = a_tilde.determinant();
        if !(a_det.is_finite() && a_det > 0.0) {
            return None;
        }
        let a_inv = a_tilde.try_inverse()?;
        let beta = &a_inv * &b_tilde;
        let ypy = yvy - b_tilde.dot(&beta);
        if !(ypy.is_finite() && ypy > 0.0) {
            return None;
        }

        let df = self.residual_df() as f64;
        let sigma2 = ypy / df;
        let logdet_v = logdet_m + self.s as f64 * gamma_s.ln() + self.t as f64 * gamma_t.ln();
        let deviance = df * (sigma2.ln() + 1.0 + LN_2PI) + logdet_v + a_det.ln();
        if !deviance.is_finite() {
            return None;
        }

        Some(ProfiledEval {
            deviance,
            sigma2,
            beta,
            beta_cov: sigma2 * a_inv,
        })
    }

    /// Full REML deviance at explicit variances `(σ_s², σ_t², σ²)`.
    ///
    /// Used for the curvature (standard-error) computation around the
    /// optimum; agrees with [`profiled`](Self::profiled) when
    /// `σ² = σ̂²(γ)`.
    pub fn full_deviance(&self, var_s: f64, var_t: f64, var_e: f64) -> Option<f64> {
        if !(var_s > 0.0 && var_t > 0.0 && var_e > 0.0) {
            return None;
        }
        let gamma_s = var_s / var_e;
        let gamma_t = var_t / var_e;

        let (logdet_m, a_tilde, b_tilde, yvy) = self.reduce(gamma_s, gamma_t)?;
        let a_det = a_tilde.determinant();
        if !(a_det.is_finite() && a_det > 0.0) {
            return None;
        }
        let a_inv = a_tilde.try_inverse()?;
        let beta = &a_inv * &b_tilde;
        let ypy = yvy - b_tilde.dot(&beta);
        if !(ypy.is_finite() && ypy >= 0.0) {
            return None;
        }

        let n = self.n as f64;
        let logdet_v = logdet_m + self.s as f64 * gamma_s.ln() + self.t as f64 * gamma_t.ln();
        let deviance = n.mul_add(var_e.ln(), logdet_v) + a_det.ln() - 2.0 * var_e.ln()
            + ypy / var_e
            + self.residual_df() as f64 * LN_2PI;
        deviance.is_finite().then_some(deviance)
    }
}
