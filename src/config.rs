//! Design and simulation parameter records.
//!
//! Mistake-proofing happens in two layers, mirroring the schema/semantic
//! split of the configuration system this crate is built around:
//! - schema validation via `validator` derive (ranges, positivity)
//! - semantic validation for constraints the schema cannot express
//!   (proportions summing to one, finiteness of every real parameter)
//!
//! Both records are immutable snapshots: the core has no notion of stale
//! or live inputs, the collaborator decides when to capture and invoke.

use serde::{Deserialize, Serialize};
use std::path::Path;
use validator::Validate;

use crate::error::{PowerError, PowerResult};

/// Tolerance for the group-proportion sum check.
const PROPORTION_TOLERANCE: f64 = 1e-6;

/// Parameters of the hierarchical design, immutable per run.
///
/// Describes a two-group, subjects × trials crossed design with a fixed
/// group effect, independent random intercepts for subjects and trials,
/// and residual noise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct DesignParams {
    /// Number of subjects.
    #[validate(range(min = 1))]
    pub subject_count: usize,

    /// Number of trials per subject.
    #[validate(range(min = 1))]
    pub trial_count: usize,

    /// Proportion of subjects in each of the two groups; must sum to 1.
    #[serde(default = "default_proportions")]
    pub group_proportions: (f64, f64),

    /// Fixed intercept (grand mean of the response).
    pub fixed_intercept: f64,

    /// Fixed group-effect magnitude (between-group mean difference).
    pub fixed_group_effect: f64,

    /// SD of the per-subject random intercept.
    #[validate(range(min = 0.0))]
    pub subject_sd: f64,

    /// SD of the per-trial random intercept.
    #[validate(range(min = 0.0))]
    pub trial_sd: f64,

    /// SD of the per-observation residual.
    #[validate(range(min = 0.0))]
    pub residual_sd: f64,

    /// Clamp negative responses to zero.
    ///
    /// The floor biases the response distribution and every model fit
    /// downstream; that is the documented, user-toggleable behavior.
    #[serde(default)]
    pub truncate_negative: bool,
}

const fn default_proportions() -> (f64, f64) {
    (0.5, 0.5)
}

impl DesignParams {
    /// Load design parameters from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read, YAML parsing fails, or
    /// validation fails.
    pub fn load<P: AsRef<Path>>(path: P) -> PowerResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse design parameters from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns error if parsing or validation fails.
    pub fn from_yaml(yaml: &str) -> PowerResult<Self> {
        let params: Self = serde_yaml::from_str(yaml)?;
        params.check()?;
        Ok(params)
    }

    /// Create a builder seeded with neutral defaults.
    #[must_use]
    pub fn builder() -> DesignParamsBuilder {
        DesignParamsBuilder::default()
    }

    /// Validate constraints the schema cannot express.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` describing the first violation.
    pub fn validate_semantic(&self) -> PowerResult<()> {
        let (p_a, p_b) = self.group_proportions;
        if !(p_a.is_finite() && p_b.is_finite()) || p_a <= 0.0 || p_b <= 0.0 {
            return Err(PowerError::invalid_config(format!(
                "group_proportions must be two positive values, got ({p_a}, {p_b})"
            )));
        }
        if ((p_a + p_b) - 1.0).abs() > PROPORTION_TOLERANCE {
            return Err(PowerError::invalid_config(format!(
                "group_proportions must sum to 1, got {}",
                p_a + p_b
            )));
        }

        for (name, value) in [
            ("fixed_intercept", self.fixed_intercept),
            ("fixed_group_effect", self.fixed_group_effect),
            ("subject_sd", self.subject_sd),
            ("trial_sd", self.trial_sd),
            ("residual_sd", self.residual_sd),
        ] {
            if !value.is_finite() {
                return Err(PowerError::invalid_config(format!(
                    "{name} must be finite, got {value}"
                )));
            }
        }

        Ok(())
    }

    /// Run both validation layers.
    ///
    /// Schema violations are reported as `InvalidConfiguration` so
    /// callers match one fail-fast variant for every bad parameter.
    ///
    /// # Errors
    ///
    /// Returns the first schema or semantic violation.
    pub fn check(&self) -> PowerResult<()> {
        self.validate()
            .map_err(|err| PowerError::invalid_config(err.to_string()))?;
        self.validate_semantic()
    }

    /// Total number of observations in one simulated dataset.
    #[must_use]
    pub const fn n_observations(&self) -> usize {
        self.subject_count * self.trial_count
    }
}

/// Builder for [`DesignParams`].
#[derive(Debug)]
pub struct DesignParamsBuilder {
    params: DesignParams,
}

impl Default for DesignParamsBuilder {
    fn default() -> Self {
        Self {
            params: DesignParams {
                subject_count: 20,
                trial_count: 10,
                group_proportions: default_proportions(),
                fixed_intercept: 0.0,
                fixed_group_effect: 0.0,
                subject_sd: 1.0,
                trial_sd: 1.0,
                residual_sd: 1.0,
                truncate_negative: false,
            },
        }
    }
}

impl DesignParamsBuilder {
    /// Set the number of subjects.
    #[must_use]
    pub const fn subjects(mut self, n: usize) -> Self {
        self.params.subject_count = n;
        self
    }

    /// Set the number of trials per subject.
    #[must_use]
    pub const fn trials(mut self, n: usize) -> Self {
        self.params.trial_count = n;
        self
    }

    /// Set the group-proportion split.
    #[must_use]
    pub const fn proportions(mut self, a: f64, b: f64) -> Self {
        self.params.group_proportions = (a, b);
        self
    }

    /// Set the fixed intercept.
    #[must_use]
    pub const fn intercept(mut self, value: f64) -> Self {
        self.params.fixed_intercept = value;
        self
    }

    /// Set the fixed group effect.
    #[must_use]
    pub const fn group_effect(mut self, value: f64) -> Self {
        self.params.fixed_group_effect = value;
        self
    }

    /// Set the subject random-intercept SD.
    #[must_use]
    pub const fn subject_sd(mut self, sd: f64) -> Self {
        self.params.subject_sd = sd;
        self
    }

    /// Set the trial random-intercept SD.
    #[must_use]
    pub const fn trial_sd(mut self, sd: f64) -> Self {
        self.params.trial_sd = sd;
        self
    }

    /// Set the residual SD.
    #[must_use]
    pub const fn residual_sd(mut self, sd: f64) -> Self {
        self.params.residual_sd = sd;
        self
    }

    /// Enable or disable floor-truncation of negative responses.
    #[must_use]
    pub const fn truncate_negative(mut self, on: bool) -> Self {
        self.params.truncate_negative = on;
        self
    }

    /// Finalize and validate the parameter record.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` (or a schema validation error) if
    /// the assembled record is inconsistent.
    pub fn build(self) -> PowerResult<DesignParams> {
        self.params.check()?;
        Ok(self.params)
    }
}

/// Options for a batch power simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct PowerOptions {
    /// Number of independent simulation repetitions.
    #[validate(range(min = 1))]
    pub n_repetitions: usize,

    /// Significance threshold in (0, 1].
    #[serde(default = "default_alpha")]
    pub alpha: f64,

    /// Master seed for the partitioned repetition streams.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Worker threads for the repetition loop; 0 = available parallelism.
    #[serde(default)]
    pub workers: usize,

    /// Maximum tolerated fraction of non-convergent repetitions.
    #[validate(range(min = 0.0, max = 1.0))]
    #[serde(default = "default_exclusion_ceiling")]
    pub exclusion_ceiling: f64,

    /// Optional wall-clock budget per model fit, in milliseconds.
    ///
    /// Expiry is reported as `NonConvergence` for that repetition.
    #[serde(default)]
    pub fit_timeout_ms: Option<u64>,

    /// Number of evaluation points in the -log10(p) density grid.
    #[validate(range(min = 16))]
    #[serde(default = "default_density_points")]
    pub density_points: usize,
}

const fn default_alpha() -> f64 {
    0.05
}

const fn default_seed() -> u64 {
    42
}

const fn default_exclusion_ceiling() -> f64 {
    0.20
}

const fn default_density_points() -> usize {
    256
}

impl Default for PowerOptions {
    fn default() -> Self {
        Self {
            n_repetitions: 200,
            alpha: default_alpha(),
            seed: default_seed(),
            workers: 0,
            exclusion_ceiling: default_exclusion_ceiling(),
            fit_timeout_ms: None,
            density_points: default_density_points(),
        }
    }
}

impl PowerOptions {
    /// Run both validation layers.
    ///
    /// # Errors
    ///
    /// Returns the first schema or semantic violation, both as
    /// `InvalidConfiguration`.
    pub fn check(&self) -> PowerResult<()> {
        self.validate()
            .map_err(|err| PowerError::invalid_config(err.to_string()))?;
        if !self.alpha.is_finite() || self.alpha <= 0.0 || self.alpha > 1.0 {
            return Err(PowerError::invalid_config(format!(
                "alpha must lie in (0, 1], got {}",
                self.alpha
            )));
        }
        Ok(())
    }
}
