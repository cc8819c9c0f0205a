//! Deterministic random number generation.
//!
//! Wraps PCG (Permuted Congruential Generator) with partitioned streams so
//! that every simulated repetition draws from its own independent,
//! seed-derived sequence.
//!
//! # Reproducibility Guarantee
//!
//! Given the same master seed, all random number sequences are
//! bitwise-identical across runs, platforms, and worker-thread counts
//! (each repetition owns one partitioned stream, so scheduling order
//! cannot change what any repetition draws).

use rand::prelude::*;
use rand_pcg::Pcg64;

/// Deterministic, reproducible random number generator.
#[derive(Debug, Clone)]
pub struct SimRng {
    /// Master seed for reproducibility.
    master_seed: u64,
    /// Current stream index for partitioning.
    stream: u64,
    /// Internal PCG state.
    rng: Pcg64,
}

impl SimRng {
    /// Create a new RNG with the given master seed.
    #[must_use]
    pub fn new(master_seed: u64) -> Self {
        Self {
            master_seed,
            stream: 0,
            rng: Pcg64::seed_from_u64(master_seed),
        }
    }

    /// Get the master seed.
    #[must_use]
    pub const fn master_seed(&self) -> u64 {
        self.master_seed
    }

    /// Get current stream index.
    #[must_use]
    pub const fn stream(&self) -> u64 {
        self.stream
    }

    /// Create partitioned RNGs, one independent stream per repetition.
    ///
    /// Each partition derives its seed from the master seed and a stream
    /// index, so the sequence a given repetition sees does not depend on
    /// how repetitions are scheduled across workers.
    ///
    /// # Example
    ///
    /// ```rust
    /// use simpower::rng::SimRng;
    ///
    /// let mut rng = SimRng::new(42);
    /// let streams = rng.partition(8);
    /// assert_eq!(streams.len(), 8);
    /// ```
    #[must_use]
    pub fn partition(&mut self, n: usize) -> Vec<Self> {
        let partitions: Vec<Self> = (0..n)
            .map(|i| {
                let stream = self.stream + i as u64;
                let seed = self
                    .master_seed
                    .wrapping_add(stream.wrapping_mul(0x9E37_79B9_7F4A_7C15));
                Self {
                    master_seed: self.master_seed,
                    stream,
                    rng: Pcg64::seed_from_u64(seed),
                }
            })
            .collect();

        self.stream += n as u64;
        partitions
    }

    /// Generate a random f64 in [0, 1).
    pub fn gen_f64(&mut self) -> f64 {
        self.rng.gen()
    }

    /// Generate a standard normal sample using the Box-Muller transform.
    pub fn gen_standard_normal(&mut self) -> f64 {
        let u1 = self.gen_f64();
        let u2 = self.gen_f64();

        // Avoid log(0)
        let u1 = if u1 < f64::EPSILON { f64::EPSILON } else { u1 };

        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
    }

    /// Generate a normal sample with given mean and standard deviation.
    pub fn gen_normal(&mut self, mean: f64, sd: f64) -> f64 {
        mean + sd * self.gen_standard_normal()
    }

    /// Generate n zero-mean normal samples with the given standard deviation.
    #[must_use]
    pub fn normal_vec(&mut self, n: usize, sd: f64) -> Vec<f64> {
        (0..n).map(|_| self.gen_normal(0.0, sd)).collect()
    }
}
