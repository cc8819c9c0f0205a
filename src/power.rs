//! Batch power simulation.
//!
//! Runs many synthesize-then-fit repetitions over one shared design
//! skeleton and aggregates them into a power estimate. Repetitions are
//! scheduled with lock-free work stealing so variable-duration fits do
//! not leave workers idle, while each repetition draws from its own
//! partitioned RNG stream; the result is bitwise-identical for a given
//! seed whatever the worker count.
//!
//! Non-convergent fits are excluded from the aggregate but counted, and
//! the run fails with `UnreliablePowerEstimate` when the excluded
//! fraction passes the configured ceiling. Singular fits stay in the
//! aggregate and are counted separately.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{DesignParams, PowerOptions};
use crate::density::PValueDensity;
use crate::design::generate_design;
use crate::error::{PowerError, PowerResult};
use crate::fit::{FitResult, MixedModelFitter, ParameterKind};
use crate::rng::SimRng;
use crate::synth::synthesize;

/// One repetition scheduled onto the work-stealing loop.
#[derive(Debug)]
struct RepetitionTask {
    /// Position in the batch; fixes the merge order.
    index: usize,
    /// The repetition's own partitioned stream.
    rng: SimRng,
}

/// What one repetition contributed to the aggregate.
#[derive(Debug, Clone, Copy)]
struct RepetitionRecord {
    estimate: f64,
    std_error: f64,
    p_value: f64,
    singular: bool,
}

/// Aggregated outcome of a power simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerSummary {
    /// Fraction of valid repetitions with a significant group effect.
    pub power: f64,
    /// Significance threshold used.
    pub alpha: f64,
    /// Master seed the batch was run under.
    pub seed: u64,
    /// Repetitions attempted.
    pub n_repetitions: usize,
    /// Repetitions that produced a usable fit.
    pub n_valid: usize,
    /// Repetitions excluded for non-convergence.
    pub n_excluded: usize,
    /// Valid repetitions whose fit was singular.
    pub n_singular: usize,
    /// Mean group-effect estimate across valid repetitions.
    pub mean_estimate: f64,
    /// Sample SD of the group-effect estimate across valid repetitions.
    pub sd_estimate: f64,
    /// Mean group-effect standard error across valid repetitions.
    pub mean_std_error: f64,
    /// Density of the group-effect p-values on the -log10 scale.
    pub density: PValueDensity,
}

impl PowerSummary {
    /// Type II error rate, the complement of the power.
    #[must_use]
    pub fn type2_error(&self) -> f64 {
        1.0 - self.power
    }

    /// Fraction of repetitions excluded for non-convergence.
    #[must_use]
    pub fn exclusion_rate(&self) -> f64 {
        self.n_excluded as f64 / self.n_repetitions as f64
    }

    /// Fraction of valid repetitions that were singular.
    #[must_use]
    pub fn singular_rate(&self) -> f64 {
        if self.n_valid == 0 {
            0.0
        } else {
            self.n_singular as f64 / self.n_valid as f64
        }
    }
}

/// Synthesize one dataset and fit it, from a standalone seed.
///
/// Convenience entry point for inspecting a single repetition outside
/// the batch loop.
///
/// # Errors
///
/// Returns `InvalidConfiguration` for a bad design and `NonConvergence`
/// when the fit fails.
pub fn synthesize_and_fit(params: &DesignParams, seed: u64) -> PowerResult<FitResult> {
    let skeleton = generate_design(params)?;
    let mut rng = SimRng::new(seed);
    MixedModelFitter::new().fit(&synthesize(&skeleton, params, &mut rng))
}

/// Run a full power simulation.
///
/// The design skeleton is generated once and shared across every
/// repetition; only the random deviates differ between repetitions.
///
/// # Errors
///
/// Returns `InvalidConfiguration` for bad inputs and
/// `UnreliablePowerEstimate` when no repetition converged or the
/// excluded fraction exceeds `options.exclusion_ceiling`. Any
/// non-recoverable per-repetition error aborts the batch as-is.
pub fn run_power_simulation(
    params: &DesignParams,
    options: &PowerOptions,
) -> PowerResult<PowerSummary> {
    params.check()?;
    options.check()?;

    let skeleton = generate_design(params)?;
    let mut master = SimRng::new(options.seed);
    let streams = master.partition(options.n_repetitions);

    let mut fitter = MixedModelFitter::new();
    if let Some(ms) = options.fit_timeout_ms {
        fitter = fitter.timeout(Duration::from_millis(ms));
    }

    let workers = effective_workers(options.workers);
    let outcomes = execute_repetitions(streams, workers, |task| {
        let mut rng = task.rng;
        fitter.fit(&synthesize(&skeleton, params, &mut rng))
    });

    aggregate(options, outcomes)
}

/// Resolve the worker count, with 0 meaning available parallelism.
fn effective_workers(configured: usize) -> usize {
    if configured > 0 {
        return configured;
    }
    std::thread::available_parallelism().map_or(1, NonZeroUsize::get)
}

/// Run every repetition across `workers` threads with work stealing.
///
/// Idle workers steal from the global queue first and then from their
/// peers round-robin, so a handful of slow fits cannot serialize the
/// batch. Results come back in index order regardless of scheduling.
fn execute_repetitions<F>(
    streams: Vec<SimRng>,
    workers: usize,
    simulate: F,
) -> Vec<PowerResult<FitResult>>
where
    F: Fn(RepetitionTask) -> PowerResult<FitResult> + Sync,
{
    use crossbeam_deque::{Injector, Steal, Stealer, Worker};

    let n = streams.len();
    let injector: Injector<RepetitionTask> = Injector::new();
    for (index, rng) in streams.into_iter().enumerate() {
        injector.push(RepetitionTask { index, rng });
    }

    let local_queues: Vec<Worker<RepetitionTask>> =
        (0..workers).map(|_| Worker::new_fifo()).collect();
    let stealers: Vec<Stealer<RepetitionTask>> =
        local_queues.iter().map(Worker::stealer).collect();

    let results: std::sync::Mutex<Vec<(usize, PowerResult<FitResult>)>> =
        std::sync::Mutex::new(Vec::with_capacity(n));

    std::thread::scope(|s| {
        for (worker_id, local) in local_queues.into_iter().enumerate() {
            let injector = &injector;
            let stealers = &stealers;
            let results = &results;
            let simulate = &simulate;

            s.spawn(move || loop {
                let task = local
                    .pop()
                    .or_else(|| loop {
                        match injector.steal() {
                            Steal::Success(task) => break Some(task),
                            Steal::Empty => break None,
                            Steal::Retry => {}
                        }
                    })
                    .or_else(|| {
                        for i in 0..stealers.len() {
                            let victim = (worker_id + i + 1) % stealers.len();
                            loop {
                                match stealers[victim].steal() {
                                    Steal::Success(task) => return Some(task),
                                    Steal::Empty => break,
                                    Steal::Retry => {}
                                }
                            }
                        }
                        None
                    });

                match task {
                    Some(task) => {
                        let index = task.index;
                        let outcome = simulate(task);
                        if let Ok(mut guard) = results.lock() {
                            guard.push((index, outcome));
                        }
                    }
                    None => break,
                }
            });
        }
    });

    let mut indexed = results.into_inner().unwrap_or_default();
    indexed.sort_by_key(|(index, _)| *index);
    indexed.into_iter().map(|(_, outcome)| outcome).collect()
}

/// Fold per-repetition outcomes into the batch summary.
fn aggregate(
    options: &PowerOptions,
    outcomes: Vec<PowerResult<FitResult>>,
) -> PowerResult<PowerSummary> {
    let total = outcomes.len();
    let mut records: Vec<RepetitionRecord> = Vec::with_capacity(total);
    let mut excluded = 0usize;

    for outcome in outcomes {
        match outcome {
            Ok(fit) => match group_effect_record(&fit) {
                Some(record) => records.push(record),
                // A fit without a testable group effect is as unusable
                // as a non-convergent one.
                None => excluded += 1,
            },
            Err(PowerError::NonConvergence { .. }) => excluded += 1,
            Err(err) => return Err(err),
        }
    }

    let exclusion_rate = excluded as f64 / total as f64;
    if records.is_empty() || exclusion_rate > options.exclusion_ceiling {
        return Err(PowerError::UnreliablePowerEstimate {
            excluded,
            total,
            max_rate: options.exclusion_ceiling,
        });
    }

    let n_valid = records.len();
    let n_singular = records.iter().filter(|r| r.singular).count();
    let significant = records
        .iter()
        .filter(|r| r.p_value < options.alpha)
        .count();

    let p_values: Vec<f64> = records.iter().map(|r| r.p_value).collect();
    let density = PValueDensity::estimate(&p_values, options.alpha, options.density_points)?;

    let n = n_valid as f64;
    let mean_estimate = records.iter().map(|r| r.estimate).sum::<f64>() / n;
    let sd_estimate = if n_valid > 1 {
        (records
            .iter()
            .map(|r| (r.estimate - mean_estimate).powi(2))
            .sum::<f64>()
            / (n - 1.0))
            .sqrt()
    } else {
        0.0
    };

    Ok(PowerSummary {
        power: significant as f64 / n,
        alpha: options.alpha,
        seed: options.seed,
        n_repetitions: total,
        n_valid,
        n_excluded: excluded,
        n_singular,
        mean_estimate,
        sd_estimate,
        mean_std_error: records.iter().map(|r| r.std_error).sum::<f64>() / n,
        density,
    })
}

/// Extract the group-effect test from one fit, if it is testable.
fn group_effect_record(fit: &FitResult) -> Option<RepetitionRecord> {
    let effect = fit.parameter(ParameterKind::FixedGroupEffect)?;
    let p_value = effect.p_value?;
    Some(RepetitionRecord {
        estimate: effect.estimate,
        std_error: effect.std_error,
        p_value,
        singular: fit.singular,
    })
}
