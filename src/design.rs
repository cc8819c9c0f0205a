//! Experimental design skeleton generation.
//!
//! Builds the crossed subjects × trials layout with a deterministic
//! two-group split and effect-coded group contrast. No responses yet;
//! the skeleton is shared, unchanged, across every simulated repetition.

use serde::{Deserialize, Serialize};

use crate::config::DesignParams;
use crate::error::{PowerError, PowerResult};

/// Effect code carried by the first group.
pub const CONTRAST_A: f64 = 0.5;
/// Effect code carried by the second group.
pub const CONTRAST_B: f64 = -0.5;

/// Two-level group factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Group {
    /// First group (effect code +0.5).
    Treatment,
    /// Second group (effect code -0.5).
    Control,
}

impl Group {
    /// Effect-coded contrast for this level; codes sum to zero across levels.
    #[must_use]
    pub const fn contrast(self) -> f64 {
        match self {
            Self::Treatment => CONTRAST_A,
            Self::Control => CONTRAST_B,
        }
    }
}

/// One design cell: a (subject, trial) pair with its group assignment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObservationSkeleton {
    /// Subject identifier, `0..subject_count`.
    pub subject: usize,
    /// Trial identifier, `0..trial_count`.
    pub trial: usize,
    /// Group the subject belongs to.
    pub group: Group,
    /// Effect-coded group contrast.
    pub contrast: f64,
}

/// Full design skeleton: every subject crossed with every trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesignSkeleton {
    /// Skeleton rows in (subject-major, trial-minor) order.
    pub rows: Vec<ObservationSkeleton>,
    /// Number of subjects.
    pub subject_count: usize,
    /// Number of trials per subject.
    pub trial_count: usize,
    /// Subjects assigned to the first group.
    pub treatment_count: usize,
}

impl DesignSkeleton {
    /// Number of rows, `subject_count × trial_count`.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the skeleton has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Build the design skeleton for the given parameters.
///
/// Group sizes are `round(p × subject_count)` for the first group and the
/// remainder for the second; assignment is deterministic and unshuffled
/// (the leading block of subjects forms the first group), so repeated
/// calls with the same counts and proportions yield the same split.
///
/// # Errors
///
/// Returns `InvalidConfiguration` if the counts are non-positive, the
/// proportions are not two positive values summing to one, or rounding
/// leaves either group without subjects.
pub fn generate_design(params: &DesignParams) -> PowerResult<DesignSkeleton> {
    params.check()?;

    let subjects = params.subject_count;
    let trials = params.trial_count;
    let (p_a, _) = params.group_proportions;

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let treatment_count = (p_a * subjects as f64).round() as usize;
    if treatment_count == 0 || treatment_count >= subjects {
        return Err(PowerError::invalid_config(format!(
            "group split {treatment_count}/{} leaves an empty group \
             (subject_count {subjects}, proportions {:?})",
            subjects - treatment_count,
            params.group_proportions
        )));
    }

    let mut rows = Vec::with_capacity(subjects * trials);
    for subject in 0..subjects {
        let group = if subject < treatment_count {
            Group::Treatment
        } else {
            Group::Control
        };
        for trial in 0..trials {
            rows.push(ObservationSkeleton {
                subject,
                trial,
                group,
                contrast: group.contrast(),
            });
        }
    }

    Ok(DesignSkeleton {
        rows,
        subject_count: subjects,
        trial_count: trials,
        treatment_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(subjects: usize, trials: usize) -> DesignParams {
        DesignParams::builder()
            .subjects(subjects)
            .trials(trials)
            .build()
            .unwrap()
    }

    #[test]
    fn test_row_count_is_cross_product() {
        let skeleton = generate_design(&params(10, 7)).unwrap();
        assert_eq!(skeleton.len(), 70);
        assert!(!skeleton.is_empty());
    }

    #[test]
    fn test_each_subject_has_trial_count_rows() {
        let skeleton = generate_design(&params(8, 5)).unwrap();
        for subject in 0..8 {
            let count = skeleton.rows.iter().filter(|r| r.subject == subject).count();
            assert_eq!(count, 5, "subject {subject} has {count} rows");
        }
    }

    #[test]
    fn test_subject_trial_pairs_unique() {
        use std::collections::HashSet;
        let skeleton = generate_design(&params(6, 9)).unwrap();
        let pairs: HashSet<(usize, usize)> =
            skeleton.rows.iter().map(|r| (r.subject, r.trial)).collect();
        assert_eq!(pairs.len(), skeleton.len());
    }

    #[test]
    fn test_even_split_contrast_sums_to_zero() {
        let skeleton = generate_design(&params(10, 4)).unwrap();
        let sum: f64 = skeleton.rows.iter().map(|r| r.contrast).sum();
        assert!(sum.abs() < 1e-12, "contrast sum {sum} not zero");
    }

    #[test]
    fn test_contrast_codes_symmetric() {
        assert!((Group::Treatment.contrast() + Group::Control.contrast()).abs() < f64::EPSILON);
        assert!((Group::Treatment.contrast() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_split_is_deterministic() {
        let a = generate_design(&params(11, 3)).unwrap();
        let b = generate_design(&params(11, 3)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_uneven_proportions_round() {
        let params = DesignParams::builder()
            .subjects(10)
            .trials(2)
            .proportions(0.3, 0.7)
            .build()
            .unwrap();
        let skeleton = generate_design(&params).unwrap();
        assert_eq!(skeleton.treatment_count, 3);
        let treated = skeleton
            .rows
            .iter()
            .filter(|r| r.group == Group::Treatment)
            .count();
        assert_eq!(treated, 3 * 2);
    }

    #[test]
    fn test_degenerate_split_rejected() {
        // One subject cannot be split into two non-empty groups.
        let params = DesignParams::builder().subjects(1).trials(2).build().unwrap();
        let result = generate_design(&params);
        assert!(matches!(
            result,
            Err(PowerError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn test_extreme_proportion_rejected() {
        let params = DesignParams::builder()
            .subjects(10)
            .trials(2)
            .proportions(0.999_999_9, 0.000_000_1);
        // Builder itself may accept the proportions; the split must not.
        match params.build() {
            Ok(p) => assert!(generate_design(&p).is_err()),
            Err(_) => {} // rejected even earlier
        }
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Falsification test: the cross product holds for all valid sizes.
        #[test]
        fn prop_row_count(subjects in 2usize..40, trials in 1usize..20) {
            let params = DesignParams::builder()
                .subjects(subjects)
                .trials(trials)
                .build()
                .unwrap();
            let skeleton = generate_design(&params).unwrap();
            prop_assert_eq!(skeleton.len(), subjects * trials);
        }

        /// Falsification test: every subject appears exactly trial_count times.
        #[test]
        fn prop_per_subject_rows(subjects in 2usize..30, trials in 1usize..15) {
            let params = DesignParams::builder()
                .subjects(subjects)
                .trials(trials)
                .build()
                .unwrap();
            let skeleton = generate_design(&params).unwrap();
            for subject in 0..subjects {
                let count = skeleton.rows.iter().filter(|r| r.subject == subject).count();
                prop_assert_eq!(count, trials);
            }
        }

        /// Falsification test: a 0.5/0.5 split averages the contrast to zero
        /// whenever the subject count is even.
        #[test]
        fn prop_even_split_zero_mean(half in 1usize..20, trials in 1usize..10) {
            let params = DesignParams::builder()
                .subjects(2 * half)
                .trials(trials)
                .build()
                .unwrap();
            let skeleton = generate_design(&params).unwrap();
            let sum: f64 = skeleton.rows.iter().map(|r| r.contrast).sum();
            prop_assert!(sum.abs() < 1e-9);
        }
    }
}
