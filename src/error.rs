//! Error types for simpower.
//!
//! All fallible operations return `Result<T, PowerError>`. Configuration
//! problems, schema and semantic alike, are caught as
//! `InvalidConfiguration` before any simulation work starts;
//! per-repetition fitting failures are recovered inside the power
//! simulator and only surface as a batch error when too many repetitions
//! are lost.

use thiserror::Error;

use crate::fit::ParameterKind;

/// Result type alias for simpower operations.
pub type PowerResult<T> = Result<T, PowerError>;

/// Unified error type for all simpower operations.
#[derive(Debug, Error)]
pub enum PowerError {
    // ===== Configuration =====
    /// Invalid design or simulation parameters, rejected before any work.
    #[error("invalid configuration: {message}")]
    InvalidConfiguration {
        /// Description of the offending parameter(s).
        message: String,
    },

    /// YAML parsing error.
    #[error("YAML parsing error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ===== Model fitting =====
    /// The REML optimizer did not reach a stable solution.
    #[error("model fit did not converge after {iterations} iterations ({reason})")]
    NonConvergence {
        /// Optimizer iterations spent before giving up.
        iterations: usize,
        /// Short description of the failure mode.
        reason: String,
    },

    /// A random-effect variance collapsed to (near) zero.
    ///
    /// A valid statistical outcome. Fits report this through
    /// [`FitResult::singular`](crate::fit::FitResult); this error is only
    /// produced when a caller demands a non-singular fit.
    #[error("singular fit: {component:?} variance collapsed to {estimate:.3e}")]
    SingularFit {
        /// Which variance component collapsed.
        component: ParameterKind,
        /// The near-zero SD estimate.
        estimate: f64,
    },

    // ===== Batch aggregation =====
    /// Too many repetitions were excluded for the power figure to be trusted.
    #[error(
        "unreliable power estimate: {excluded} of {total} repetitions excluded \
         (exclusion ceiling {max_rate:.2})"
    )]
    UnreliablePowerEstimate {
        /// Repetitions excluded for non-convergence.
        excluded: usize,
        /// Total repetitions attempted.
        total: usize,
        /// Configured exclusion-rate ceiling.
        max_rate: f64,
    },
}

impl PowerError {
    /// Create an `InvalidConfiguration` error with a message.
    #[must_use]
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            message: message.into(),
        }
    }

    /// Create a `NonConvergence` error.
    #[must_use]
    pub fn non_convergence(iterations: usize, reason: impl Into<String>) -> Self {
        Self::NonConvergence {
            iterations,
            reason: reason.into(),
        }
    }

    /// Check whether this error is recoverable per-repetition.
    ///
    /// The power simulator excludes (with counting) repetitions that fail
    /// this way instead of aborting the whole batch.
    #[must_use]
    pub const fn is_repetition_failure(&self) -> bool {
        matches!(
            self,
            Self::NonConvergence { .. } | Self::SingularFit { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_config_display() {
        let err = PowerError::invalid_config("subject_count must be positive");
        let msg = err.to_string();
        assert!(msg.contains("invalid configuration"));
        assert!(msg.contains("subject_count"));
        assert!(!err.is_repetition_failure());
    }

    #[test]
    fn test_non_convergence_display() {
        let err = PowerError::non_convergence(200, "iteration cap reached");
        let msg = err.to_string();
        assert!(msg.contains("did not converge"));
        assert!(msg.contains("200"));
        assert!(err.is_repetition_failure());
    }

    #[test]
    fn test_singular_fit_is_repetition_failure() {
        let err = PowerError::SingularFit {
            component: ParameterKind::SubjectInterceptSd,
            estimate: 1.0e-9,
        };
        assert!(err.is_repetition_failure());
        assert!(err.to_string().contains("singular fit"));
    }

    #[test]
    fn test_unreliable_power_estimate_display() {
        let err = PowerError::UnreliablePowerEstimate {
            excluded: 60,
            total: 200,
            max_rate: 0.2,
        };
        let msg = err.to_string();
        assert!(msg.contains("60 of 200"));
        assert!(msg.contains("0.20"));
        assert!(!err.is_repetition_failure());
    }

    #[test]
    fn test_error_debug() {
        let err = PowerError::invalid_config("test");
        let debug = format!("{err:?}");
        assert!(debug.contains("InvalidConfiguration"));
    }
}
