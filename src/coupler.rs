use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Result, bail};
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use rayon::prelude::*;

use crate::chain::{MarkovChain, TraceSample};

/// Temperature ladder generated from a single delta: `t_i = 1 + i * delta`.
/// Chain 0 is the cold (target) chain.
pub fn ladder(n_chains: usize, delta: f64) -> Vec<f64> {
    (0..n_chains).map(|i| 1.0 + i as f64 * delta).collect()
}

/// Swap acceptance log-probability for chains at temperatures `t_i`, `t_j`
/// with raw log densities `score_i`, `score_j`.
pub fn swap_log_alpha(t_i: f64, t_j: f64, score_i: f64, score_j: f64) -> f64 {
    (1.0 / t_i - 1.0 / t_j) * (score_j - score_i)
}

#[derive(Debug, Clone)]
pub struct SwapRate {
    pub cold_index: usize,
    pub hot_index: usize,
    pub attempts: u64,
    pub accepts: u64,
}

/// Runs N chains at distinct temperatures in rounds of `swap_interval`
/// steps. Within a round the chains advance in parallel and share nothing;
/// the end-of-round barrier is the rendezvous where a pairwise swap is
/// proposed, so neither participant can be observed mid-step and the
/// exchange is a plain ownership swap of two graphs. One seeded RNG makes
/// every swap decision, keeping runs reproducible.
pub struct ChainCoupler {
    chains: Vec<MarkovChain>,
    swap_interval: u64,
    swap_rng: SmallRng,
    swap_stats: Vec<(u64, u64)>,
    cancel: Arc<AtomicBool>,
}

impl ChainCoupler {
    pub fn new(chains: Vec<MarkovChain>, swap_interval: u64, seed: u64) -> Result<Self> {
        if chains.is_empty() {
            bail!("coupler needs at least one chain");
        }
        if swap_interval == 0 {
            bail!("swap interval must be >= 1");
        }
        if (chains[0].temperature() - 1.0).abs() > 1e-12 {
            bail!(
                "chain 0 must run at temperature 1, got {}",
                chains[0].temperature()
            );
        }
        for pair in chains.windows(2) {
            if pair[1].temperature() <= pair[0].temperature() {
                bail!("chain temperatures must be strictly increasing");
            }
        }
        let n_pairs = chains.len().saturating_sub(1);
        Ok(Self {
            chains,
            swap_interval,
            swap_rng: SmallRng::seed_from_u64(seed),
            swap_stats: vec![(0, 0); n_pairs],
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Shared cancellation flag; setting it halts the run at the next step
    /// boundary of every chain.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn n_chains(&self) -> usize {
        self.chains.len()
    }

    pub fn cold_chain(&self) -> &MarkovChain {
        &self.chains[0]
    }

    pub fn chain(&self, i: usize) -> &MarkovChain {
        &self.chains[i]
    }

    pub fn cold_chain_mut(&mut self) -> &mut MarkovChain {
        &mut self.chains[0]
    }

    /// Advance all chains by `n_steps`, swapping between rounds. The
    /// callback receives the samples the cold chain collected each round,
    /// plus the number of steps completed so far.
    pub fn run(
        &mut self,
        n_steps: u64,
        mut on_round: impl FnMut(u64, Vec<TraceSample>) -> Result<()>,
    ) -> Result<u64> {
        let mut done = 0u64;
        while done < n_steps && !self.cancel.load(Ordering::Relaxed) {
            let todo = self.swap_interval.min(n_steps - done);
            let cancel = &*self.cancel;
            let stepped: Vec<u64> = self
                .chains
                .par_iter_mut()
                .map(|chain| chain.run_steps(todo, cancel))
                .collect::<Result<_>>()?;
            done += stepped.iter().copied().min().unwrap_or(0);
            let samples = self.chains[0].drain_samples();
            on_round(done, samples)?;
            if self.cancel.load(Ordering::Relaxed) || stepped.iter().any(|&s| s < todo) {
                break;
            }
            if done < n_steps {
                self.propose_swap();
            }
        }
        Ok(done)
    }

    /// One swap attempt between a uniformly drawn adjacent pair. Both
    /// participants are at the barrier, so the exchange of their complete
    /// graph snapshots is atomic from every chain's point of view.
    fn propose_swap(&mut self) {
        if self.chains.len() < 2 {
            return;
        }
        let i = self.swap_rng.gen_range(0..self.chains.len() - 1);
        let j = i + 1;
        self.swap_stats[i].0 += 1;
        let log_alpha = swap_log_alpha(
            self.chains[i].temperature(),
            self.chains[j].temperature(),
            self.chains[i].current_score(),
            self.chains[j].current_score(),
        );
        let accept = log_alpha >= 0.0 || self.swap_rng.gen::<f64>() < log_alpha.exp();
        if accept {
            self.swap_stats[i].1 += 1;
            let (head, tail) = self.chains.split_at_mut(j);
            head[i].swap_state_with(&mut tail[0]);
        }
    }

    pub fn swap_rates(&self) -> Vec<SwapRate> {
        self.swap_stats
            .iter()
            .enumerate()
            .map(|(i, &(attempts, accepts))| SwapRate {
                cold_index: i,
                hot_index: i + 1,
                attempts,
                accepts,
            })
            .collect()
    }

    pub fn temperatures(&self) -> Vec<f64> {
        self.chains.iter().map(|c| c.temperature()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ladder_starts_cold() {
        let t = ladder(4, 0.5);
        assert_eq!(t, vec![1.0, 1.5, 2.0, 2.5]);
    }

    #[test]
    fn swap_log_alpha_matches_reference_scenario() {
        // T=1 and T=2: moving the better state (-90) to the cold chain is
        // always accepted; the mirror move is accepted with exp(-5).
        let downhill = swap_log_alpha(1.0, 2.0, -100.0, -90.0);
        assert!((downhill - 5.0).abs() < 1e-12);
        let uphill = swap_log_alpha(1.0, 2.0, -90.0, -100.0);
        assert!((uphill - (-5.0)).abs() < 1e-12);
        assert!(uphill.exp() > 0.0 && uphill.exp() < 1.0);
    }

    #[test]
    fn swap_log_alpha_is_antisymmetric() {
        // Detailed balance: swapping the roles negates the exponent.
        let fwd = swap_log_alpha(1.0, 2.5, -80.0, -60.0);
        let rev = swap_log_alpha(2.5, 1.0, -60.0, -80.0);
        assert!((fwd + rev).abs() < 1e-12);
    }

    #[test]
    fn equal_temperatures_always_swap() {
        // Degenerate limit: identical inverse temperatures give alpha = 1.
        let la = swap_log_alpha(2.0, 2.0, -50.0, -10.0);
        assert_eq!(la, 0.0);
    }
}
