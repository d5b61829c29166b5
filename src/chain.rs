use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Result, bail};
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::SmallRng;

use crate::model::ModelGraph;
use crate::operators::OperatorSchedule;

/// One sampled row of the cold chain's trace, pulled at the configured
/// cadence.
#[derive(Debug, Clone)]
pub struct TraceSample {
    pub step: u64,
    pub columns: Vec<(String, f64)>,
}

/// A single Markov chain: owns its graph, temperature, operator schedule
/// and RNG. Each step is store → propose → evaluate → accept or restore;
/// a proposal that is vetoed or produces a non-finite density degrades to
/// a reject and leaves no trace.
#[derive(Debug)]
pub struct MarkovChain {
    pub graph: ModelGraph,
    temperature: f64,
    schedule: OperatorSchedule,
    rng: SmallRng,
    current_score: f64,
    steps_taken: u64,
    /// Per-operator (accepted, tried).
    counts: Vec<(u64, u64)>,
    sample_every: Option<u64>,
    samples: Vec<TraceSample>,
}

impl MarkovChain {
    /// Evaluates the initial state eagerly: a graph whose starting density
    /// is zero or numerically broken indicates a construction defect, so
    /// both cases abort rather than start a chain that can never move.
    pub fn new(
        mut graph: ModelGraph,
        temperature: f64,
        schedule: OperatorSchedule,
        seed: u64,
    ) -> Result<Self> {
        if temperature < 1.0 {
            bail!("chain temperature must be >= 1, got {temperature}");
        }
        graph.validate()?;
        let current_score = graph.log_posterior()?;
        if current_score == f64::NEG_INFINITY {
            bail!("the initial model has zero probability");
        }
        if !current_score.is_finite() {
            bail!("the initial likelihood evaluation returned a numerical error");
        }
        graph.accept_all();
        let n_ops = schedule.len();
        Ok(Self {
            graph,
            temperature,
            schedule,
            rng: SmallRng::seed_from_u64(seed),
            current_score,
            steps_taken: 0,
            counts: vec![(0, 0); n_ops],
            sample_every: None,
            samples: Vec::new(),
        })
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    /// Raw (untempered) log posterior of the current state.
    pub fn current_score(&self) -> f64 {
        self.current_score
    }

    pub fn steps_taken(&self) -> u64 {
        self.steps_taken
    }

    /// Enable trace sampling at this cadence (cold chain only, typically).
    pub fn set_sample_every(&mut self, every: u64) {
        self.sample_every = if every == 0 { None } else { Some(every) };
    }

    pub fn drain_samples(&mut self) -> Vec<TraceSample> {
        std::mem::take(&mut self.samples)
    }

    /// One proposal/accept-or-reject cycle.
    pub fn step(&mut self) -> Result<()> {
        self.graph.store_all();
        let op_idx = self.schedule.choose(&mut self.rng);
        self.counts[op_idx].1 += 1;

        let log_hastings = match self.schedule.op(op_idx).propose(&mut self.graph, &mut self.rng)
        {
            Ok(h) => h,
            Err(_veto) => {
                // Invalid move: an automatic reject, invisible to the user.
                self.graph.restore_all();
                self.steps_taken += 1;
                self.maybe_sample();
                return Ok(());
            }
        };

        let score = self.graph.log_posterior()?;
        let accept = if !score.is_finite() {
            // A numerically pathological state must never be committed.
            false
        } else {
            let log_alpha = (score - self.current_score) / self.temperature + log_hastings;
            log_alpha >= 0.0 || self.rng.gen::<f64>() < log_alpha.exp()
        };

        if accept {
            self.graph.accept_all();
            self.current_score = score;
            self.counts[op_idx].0 += 1;
        } else {
            self.graph.restore_all();
        }
        self.steps_taken += 1;
        self.maybe_sample();
        Ok(())
    }

    fn maybe_sample(&mut self) {
        if let Some(every) = self.sample_every {
            if self.steps_taken % every == 0 {
                let row = TraceSample {
                    step: self.steps_taken,
                    columns: self.log_columns(),
                };
                self.samples.push(row);
            }
        }
    }

    /// Run up to `n` steps, polling the cancellation flag between steps.
    /// Returns the number of steps actually taken.
    pub fn run_steps(&mut self, n: u64, cancel: &AtomicBool) -> Result<u64> {
        let mut done = 0;
        while done < n {
            if cancel.load(Ordering::Relaxed) {
                break;
            }
            self.step()?;
            done += 1;
        }
        Ok(done)
    }

    /// Pull interface for loggers: posterior first, then the graph's own
    /// columns.
    pub fn log_columns(&self) -> Vec<(String, f64)> {
        let mut cols = vec![("posterior".to_string(), self.current_score)];
        cols.extend(self.graph.log_columns());
        cols
    }

    /// Per-operator acceptance rates, by operator name.
    pub fn acceptance_rates(&self) -> Vec<(String, f64, u64)> {
        self.counts
            .iter()
            .enumerate()
            .map(|(i, &(accepted, tried))| {
                let rate = if tried > 0 {
                    accepted as f64 / tried as f64
                } else {
                    0.0
                };
                (self.schedule.op(i).name().to_string(), rate, tried)
            })
            .collect()
    }

    /// Exchange complete states with another chain (the MC3 swap). The
    /// graphs and scores move; temperature, schedule, RNG and sampling
    /// role stay with the slot, keeping the ladder read-only.
    pub fn swap_state_with(&mut self, other: &mut MarkovChain) {
        std::mem::swap(&mut self.graph, &mut other.graph);
        std::mem::swap(&mut self.current_score, &mut other.current_score);
    }
}
