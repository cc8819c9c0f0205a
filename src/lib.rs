//! # simpower
//!
//! Monte Carlo statistical power estimation for hierarchical designs.
//!
//! Simulates responses from a two-group, subjects × trials crossed design
//! with random intercepts for subjects and trials, fits each simulated
//! dataset with a REML mixed-effects model, and reports the fraction of
//! repetitions in which the group effect is detected. Repetitions run in
//! parallel with work stealing while staying bitwise-reproducible for a
//! given seed.
//!
//! ## Example
//!
//! ```rust
//! use simpower::prelude::*;
//!
//! let params = DesignParams::builder()
//!     .subjects(12)
//!     .trials(5)
//!     .intercept(1.0)
//!     .group_effect(0.8)
//!     .subject_sd(0.4)
//!     .trial_sd(0.3)
//!     .residual_sd(0.3)
//!     .build()?;
//! let options = PowerOptions {
//!     n_repetitions: 20,
//!     ..PowerOptions::default()
//! };
//! let summary = run_power_simulation(&params, &options)?;
//! assert!((0.0..=1.0).contains(&summary.power));
//! # Ok::<(), simpower::PowerError>(())
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![warn(clippy::pedantic, clippy::nursery)]
#![allow(
    clippy::module_name_repetitions,
    clippy::similar_names,
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::suboptimal_flops,  // Numerical code choices are intentional
    clippy::imprecise_flops,
    clippy::too_many_lines,
    clippy::missing_const_for_fn,  // Many functions can't be const in stable Rust
    clippy::needless_range_loop,   // Sometimes range loops are clearer
)]

pub mod config;
pub mod density;
pub mod design;
pub mod error;
pub mod fit;
pub mod power;
pub mod rng;
pub mod synth;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::{DesignParams, DesignParamsBuilder, PowerOptions};
    pub use crate::density::PValueDensity;
    pub use crate::design::{generate_design, DesignSkeleton, Group};
    pub use crate::error::{PowerError, PowerResult};
    pub use crate::fit::{FitResult, MixedModelFitter, ParameterEstimate, ParameterKind};
    pub use crate::power::{run_power_simulation, synthesize_and_fit, PowerSummary};
    pub use crate::rng::SimRng;
    pub use crate::synth::{synthesize, Dataset, Observation};
}

/// Re-export for public API
pub use error::{PowerError, PowerResult};
