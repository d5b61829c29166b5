use anyhow::{Context, Result, bail};
use ndarray::ArrayViewMut2;

use crate::param::{ParamId, ParamStore};
use crate::utils::{chisq_quantile, gammainc};

pub const NUM_STATES: usize = 4;

/// Map a nucleotide byte to an index (A=0, C=1, G=2, T=3). Accepts both
/// cases; returns `None` for anything else (including ambiguity codes).
pub fn nucleotide_index(b: u8) -> Option<usize> {
    match b.to_ascii_uppercase() {
        b'A' => Some(0),
        b'C' => Some(1),
        b'G' => Some(2),
        b'T' | b'U' => Some(3),
        _ => None,
    }
}

/// Indicator vector over {A,C,G,T} for one IUPAC code. Ambiguous and
/// missing states become multi-state indicators, so tips never need
/// recomputation to handle them.
pub fn ambiguity_partial(code: u8) -> [f64; 4] {
    let set: &[usize] = match code.to_ascii_uppercase() {
        b'A' => &[0],
        b'C' => &[1],
        b'G' => &[2],
        b'T' | b'U' => &[3],
        b'R' => &[0, 2],
        b'Y' => &[1, 3],
        b'S' => &[1, 2],
        b'W' => &[0, 3],
        b'K' => &[2, 3],
        b'M' => &[0, 1],
        b'B' => &[1, 2, 3],
        b'D' => &[0, 2, 3],
        b'H' => &[0, 1, 3],
        b'V' => &[0, 1, 2],
        _ => &[0, 1, 2, 3], // N, gaps, unknowns
    };
    let mut out = [0.0; 4];
    for &s in set {
        out[s] = 1.0;
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubstKind {
    Jc69,
    Hky85,
}

/// A nucleotide substitution process. All free quantities live in graph
/// parameters, so the process itself carries no transactional state.
#[derive(Debug, Clone)]
pub struct SubstModel {
    pub kind: SubstKind,
    /// Transition/transversion ratio; present for HKY85 only.
    pub kappa: Option<ParamId>,
    /// Equilibrium frequencies, 4 dimensions summing to 1.
    pub freqs: ParamId,
}

impl SubstModel {
    pub fn n_states(&self) -> usize {
        NUM_STATES
    }

    pub fn frequencies<'a>(&self, params: &'a ParamStore) -> &'a [f64] {
        params.get(self.freqs).values()
    }

    /// Fill `out` with P(branch length t), rows = ancestral state. The rate
    /// matrix is normalized to one expected substitution per unit length, so
    /// t is measured in expected substitutions.
    pub fn fill_transition(
        &self,
        params: &ParamStore,
        t: f64,
        mut out: ArrayViewMut2<f64>,
    ) -> Result<()> {
        if t < 0.0 {
            bail!("negative evolutionary distance {t}");
        }
        match self.kind {
            SubstKind::Jc69 => {
                let e = (-4.0 * t / 3.0).exp();
                let p_same = 0.25 + 0.75 * e;
                let p_diff = 0.25 - 0.25 * e;
                for i in 0..4 {
                    for j in 0..4 {
                        out[(i, j)] = if i == j { p_same } else { p_diff };
                    }
                }
            }
            SubstKind::Hky85 => {
                let kappa = params
                    .get(self.kappa.context("HKY85 process is missing kappa")?)
                    .value(0);
                let f = params.get(self.freqs).values();
                hky_transition(kappa, [f[0], f[1], f[2], f[3]], t, &mut out);
            }
        }
        Ok(())
    }
}

/// HKY85 transition probabilities in closed form (the two-rate special case
/// of Tamura-Nei). Frequencies indexed A=0, C=1, G=2, T=3.
fn hky_transition(kappa: f64, pi: [f64; 4], t: f64, out: &mut ArrayViewMut2<f64>) {
    let (pa, pc, pg, pt) = (pi[0], pi[1], pi[2], pi[3]);
    let pr = pa + pg;
    let py = pc + pt;

    // Normalize the rate matrix to mean rate 1.
    let scale = 2.0 * (kappa * (pa * pg + pc * pt) + pr * py);
    let b = 1.0 / scale;
    let a = kappa / scale;

    let e2 = (-b * t).exp();
    let e3 = (-(pr * a + py * b) * t).exp(); // purine transition decay
    let e4 = (-(py * a + pr * b) * t).exp(); // pyrimidine transition decay

    // A row
    out[(0, 0)] = pa + pa * py / pr * e2 + pg / pr * e3;
    out[(0, 1)] = pc * (1.0 - e2);
    out[(0, 2)] = pg + pg * py / pr * e2 - pg / pr * e3;
    out[(0, 3)] = pt * (1.0 - e2);
    // C row
    out[(1, 0)] = pa * (1.0 - e2);
    out[(1, 1)] = pc + pc * pr / py * e2 + pt / py * e4;
    out[(1, 2)] = pg * (1.0 - e2);
    out[(1, 3)] = pt + pt * pr / py * e2 - pt / py * e4;
    // G row
    out[(2, 0)] = pa + pa * py / pr * e2 - pa / pr * e3;
    out[(2, 1)] = pc * (1.0 - e2);
    out[(2, 2)] = pg + pg * py / pr * e2 + pa / pr * e3;
    out[(2, 3)] = pt * (1.0 - e2);
    // T row
    out[(3, 0)] = pa * (1.0 - e2);
    out[(3, 1)] = pc + pc * pr / py * e2 - pc / py * e4;
    out[(3, 2)] = pg * (1.0 - e2);
    out[(3, 3)] = pt + pt * pr / py * e2 + pc / py * e4;
}

/// Discrete-gamma site-rate heterogeneity with equal-probability categories
/// (mean method). With no shape parameter this degrades to a single
/// unit-rate category.
#[derive(Debug, Clone)]
pub struct SiteRates {
    pub n_categories: usize,
    pub shape: Option<ParamId>,
    rates: Vec<f64>,
    stored_rates: Vec<f64>,
    rates_known: bool,
}

impl SiteRates {
    pub fn single() -> Self {
        Self {
            n_categories: 1,
            shape: None,
            rates: vec![1.0],
            stored_rates: vec![1.0],
            rates_known: true,
        }
    }

    pub fn gamma(n_categories: usize, shape: ParamId) -> Self {
        Self {
            n_categories,
            shape: Some(shape),
            rates: vec![1.0; n_categories],
            stored_rates: vec![1.0; n_categories],
            rates_known: false,
        }
    }

    pub fn rates(&self) -> &[f64] {
        &self.rates
    }

    pub fn category_weight(&self) -> f64 {
        1.0 / self.n_categories as f64
    }

    pub(crate) fn mark_stale(&mut self) {
        self.rates_known = false;
    }

    /// Recompute category rates from the current shape parameter if stale.
    pub(crate) fn refresh(&mut self, params: &ParamStore) -> Result<()> {
        if self.rates_known {
            return Ok(());
        }
        let shape_id = match self.shape {
            Some(id) => id,
            None => {
                self.rates_known = true;
                return Ok(());
            }
        };
        let alpha = params.get(shape_id).value(0);
        if alpha <= 0.0 {
            bail!("gamma shape must be positive, got {alpha}");
        }
        let k = self.n_categories;
        // Category mean rates: differences of the regularized incomplete
        // gamma at the equal-probability quantile boundaries, scaled to
        // average 1.
        let mut prev_p = 0.0;
        for (i, rate) in self.rates.iter_mut().enumerate() {
            let next_p = if i + 1 == k {
                1.0
            } else {
                let q = chisq_quantile((i + 1) as f64 / k as f64, 2.0 * alpha)? / (2.0 * alpha);
                gammainc(alpha + 1.0, alpha * q)?
            };
            *rate = (next_p - prev_p) * k as f64;
            prev_p = next_p;
        }
        self.rates_known = true;
        Ok(())
    }

    pub(crate) fn store_state(&mut self) {
        self.stored_rates.clone_from(&self.rates);
    }

    pub(crate) fn restore_state(&mut self) {
        self.rates.clone_from(&self.stored_rates);
        self.rates_known = true;
    }

    pub(crate) fn accept_state(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::{Parameter, ParamStore};
    use ndarray::Array2;

    fn approx_eq(a: f64, b: f64, eps: f64) {
        assert!(
            (a - b).abs() <= eps,
            "expected {a} ~= {b} within eps={eps}, got diff={}",
            (a - b).abs()
        );
    }

    fn store_with(values: Vec<(&str, Vec<f64>)>) -> ParamStore {
        let mut store = ParamStore::default();
        for (name, vals) in values {
            store.add(Parameter::new(name, vals, None));
        }
        store
    }

    #[test]
    fn jc69_zero_length_is_identity() {
        let store = store_with(vec![("freqs", vec![0.25; 4])]);
        let model = SubstModel {
            kind: SubstKind::Jc69,
            kappa: None,
            freqs: 0,
        };
        let mut p = Array2::zeros((4, 4));
        model
            .fill_transition(&store, 0.0, p.view_mut())
            .expect("valid length");
        for i in 0..4 {
            for j in 0..4 {
                let want = if i == j { 1.0 } else { 0.0 };
                approx_eq(p[(i, j)], want, 1e-12);
            }
        }
    }

    #[test]
    fn hky_with_kappa_one_uniform_freqs_matches_jc69() {
        let store = store_with(vec![("kappa", vec![1.0]), ("freqs", vec![0.25; 4])]);
        let hky = SubstModel {
            kind: SubstKind::Hky85,
            kappa: Some(0),
            freqs: 1,
        };
        let jc = SubstModel {
            kind: SubstKind::Jc69,
            kappa: None,
            freqs: 1,
        };
        let mut p_hky = Array2::zeros((4, 4));
        let mut p_jc = Array2::zeros((4, 4));
        hky.fill_transition(&store, 0.3, p_hky.view_mut())
            .expect("valid");
        jc.fill_transition(&store, 0.3, p_jc.view_mut())
            .expect("valid");
        for i in 0..4 {
            for j in 0..4 {
                approx_eq(p_hky[(i, j)], p_jc[(i, j)], 1e-12);
            }
        }
    }

    #[test]
    fn hky_rows_sum_to_one_and_respect_stationarity() {
        let freqs = vec![0.1, 0.2, 0.3, 0.4];
        let store = store_with(vec![("kappa", vec![4.0]), ("freqs", freqs.clone())]);
        let hky = SubstModel {
            kind: SubstKind::Hky85,
            kappa: Some(0),
            freqs: 1,
        };
        for &t in &[0.0, 0.01, 0.4, 2.0, 50.0] {
            let mut p = Array2::zeros((4, 4));
            hky.fill_transition(&store, t, p.view_mut()).expect("valid");
            for i in 0..4 {
                let row: f64 = (0..4).map(|j| p[(i, j)]).sum();
                approx_eq(row, 1.0, 1e-10);
            }
            // detailed balance of the reversible process
            for i in 0..4 {
                for j in 0..4 {
                    approx_eq(freqs[i] * p[(i, j)], freqs[j] * p[(j, i)], 1e-10);
                }
            }
        }
    }

    #[test]
    fn negative_length_is_fatal() {
        let store = store_with(vec![("freqs", vec![0.25; 4])]);
        let model = SubstModel {
            kind: SubstKind::Jc69,
            kappa: None,
            freqs: 0,
        };
        let mut p = Array2::zeros((4, 4));
        assert!(model.fill_transition(&store, -0.1, p.view_mut()).is_err());
    }

    #[test]
    fn gamma_rates_average_to_one() {
        let mut store = ParamStore::default();
        let shape = store.add(Parameter::new("shape", vec![0.5], None));
        for k in [1usize, 2, 4, 8] {
            let mut rates = SiteRates::gamma(k, shape);
            rates.refresh(&store).expect("rates computable");
            let mean: f64 = rates.rates().iter().sum::<f64>() / k as f64;
            approx_eq(mean, 1.0, 1e-6);
            let mut prev = 0.0;
            for &r in rates.rates() {
                assert!(r >= prev, "rates should be increasing");
                prev = r;
            }
        }
    }

    #[test]
    fn large_shape_rates_collapse_to_equal() {
        let mut store = ParamStore::default();
        let shape = store.add(Parameter::new("shape", vec![500.0], None));
        let mut rates = SiteRates::gamma(4, shape);
        rates.refresh(&store).expect("rates computable");
        for &r in rates.rates() {
            approx_eq(r, 1.0, 0.1);
        }
    }
}
