//! Response synthesis for one simulated repetition.
//!
//! Draws one random-intercept deviate per subject and per trial plus one
//! residual per row, composes the fixed-effect linear predictor, and
//! produces the observed response. A pure function of its inputs and the
//! RNG state: fresh deviates every call, never reused across repetitions.

use serde::{Deserialize, Serialize};

use crate::config::DesignParams;
use crate::design::{DesignSkeleton, Group};
use crate::rng::SimRng;

/// One simulated trial for one subject.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Subject identifier.
    pub subject: usize,
    /// Trial identifier.
    pub trial: usize,
    /// Group the subject belongs to.
    pub group: Group,
    /// Effect-coded group contrast.
    pub contrast: f64,
    /// Observed response value.
    pub response: f64,
}

/// One fully synthesized dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    /// Observations in skeleton order.
    pub observations: Vec<Observation>,
    /// Number of subjects.
    pub subject_count: usize,
    /// Number of trials per subject.
    pub trial_count: usize,
}

impl Dataset {
    /// Number of observations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.observations.len()
    }

    /// Whether the dataset has no observations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }
}

/// Synthesize a dataset over the given skeleton.
///
/// Response = (intercept + subject deviate + trial deviate)
/// + effect × contrast + residual, with every deviate drawn independently
/// from a zero-mean normal with the configured SD.
///
/// When `params.truncate_negative` is set, negative responses are clamped
/// to zero. The floor is a deliberate, documented distortion: it skews the
/// response distribution and biases any model fit downstream, and is
/// preserved as-is because the truncation is a user-facing option of the
/// design being studied.
#[must_use]
pub fn synthesize(skeleton: &DesignSkeleton, params: &DesignParams, rng: &mut SimRng) -> Dataset {
    let subject_deviates = rng.normal_vec(skeleton.subject_count, params.subject_sd);
    let trial_deviates = rng.normal_vec(skeleton.trial_count, params.trial_sd);

    let observations = skeleton
        .rows
        .iter()
        .map(|row| {
            let residual = rng.gen_normal(0.0, params.residual_sd);
            let mut response = params.fixed_intercept
                + subject_deviates[row.subject]
                + trial_deviates[row.trial]
                + params.fixed_group_effect * row.contrast
                + residual;
            if params.truncate_negative && response < 0.0 {
                response = 0.0;
            }
            Observation {
                subject: row.subject,
                trial: row.trial,
                group: row.group,
                contrast: row.contrast,
                response,
            }
        })
        .collect();

    Dataset {
        observations,
        subject_count: skeleton.subject_count,
        trial_count: skeleton.trial_count,
    }
}
