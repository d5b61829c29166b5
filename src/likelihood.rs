use std::sync::Arc;

use anyhow::{Result, bail};
use ndarray::{Array3, ArrayView2, Axis};

use crate::io::fasta::SitePatterns;
use crate::param::ParamStore;
use crate::subst::{NUM_STATES, SiteRates, SubstModel, ambiguity_partial};
use crate::tree::TreeModel;

/// Seam for accelerated likelihood backends: combines two children's
/// partials through their branch matrices for one rate category. The engine
/// accepts the kernel's output unchanged.
pub trait PartialsKernel: Send + Sync {
    fn combine(
        &self,
        left: &[f64],
        right: &[f64],
        m_left: ArrayView2<f64>,
        m_right: ArrayView2<f64>,
        dest: &mut [f64],
        n_patterns: usize,
    );
}

/// Portable CPU kernel, the only backend shipped with the crate.
pub struct CpuKernel;

impl PartialsKernel for CpuKernel {
    fn combine(
        &self,
        left: &[f64],
        right: &[f64],
        m_left: ArrayView2<f64>,
        m_right: ArrayView2<f64>,
        dest: &mut [f64],
        n_patterns: usize,
    ) {
        for pat in 0..n_patterns {
            let off = pat * NUM_STATES;
            for s in 0..NUM_STATES {
                let mut sum_l = 0.0;
                let mut sum_r = 0.0;
                for j in 0..NUM_STATES {
                    sum_l += m_left[(s, j)] * left[off + j];
                    sum_r += m_right[(s, j)] * right[off + j];
                }
                dest[off + s] = sum_l * sum_r;
            }
        }
    }
}

/// Post-order dynamic-programming likelihood over a tree, caching partial
/// likelihood vectors per node. Only nodes marked damaged since the last
/// query are recomputed, so the cost of a query is proportional to the
/// dirty frontier, not the tree.
///
/// Partials and transition matrices are double buffered: a recomputation
/// within a transaction writes the buffer the stored index does not point
/// at, so a rejected proposal is undone by copying the stored indices back.
/// No recomputation happens on restore.
#[derive(Clone)]
pub struct TreeLikelihoodEngine {
    n_tips: usize,
    n_patterns: usize,
    n_categories: usize,
    pattern_weights: Vec<f64>,
    /// Fixed at construction, ambiguity codes folded in.
    tip_partials: Vec<Vec<f64>>,
    /// Internal-node partials, indexed by `node - n_tips`; each buffer is
    /// category-major `n_categories * n_patterns * NUM_STATES`.
    partials: Vec<[Vec<f64>; 2]>,
    partial_active: Vec<u8>,
    partial_stored: Vec<u8>,
    /// Per-branch transition matrices, indexed by the child node id; the
    /// root entry is never used.
    matrices: Vec<[Array3<f64>; 2]>,
    matrix_active: Vec<u8>,
    matrix_stored: Vec<u8>,
    update_partial: Vec<bool>,
    update_matrix: Vec<bool>,
    kernel: Arc<dyn PartialsKernel>,
    partial_recomputes: u64,
    /// Arena indices of the collaborators this engine evaluates against.
    pub tree_ref: usize,
    pub subst_ref: usize,
    pub rates_ref: usize,
}

impl std::fmt::Debug for TreeLikelihoodEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeLikelihoodEngine")
            .field("n_tips", &self.n_tips)
            .field("n_patterns", &self.n_patterns)
            .field("n_categories", &self.n_categories)
            .field("tree_ref", &self.tree_ref)
            .field("subst_ref", &self.subst_ref)
            .field("rates_ref", &self.rates_ref)
            .finish_non_exhaustive()
    }
}

impl TreeLikelihoodEngine {
    /// Build the engine for a tree whose tips 0..n_tips correspond to the
    /// pattern rows in order. All nodes start damaged, forcing one full
    /// evaluation.
    pub fn new(
        tree: &TreeModel,
        patterns: &SitePatterns,
        n_categories: usize,
        kernel: Arc<dyn PartialsKernel>,
    ) -> Result<Self> {
        let n_tips = tree.n_tips();
        if patterns.n_taxa() != n_tips {
            bail!(
                "alignment has {} taxa but tree has {} tips",
                patterns.n_taxa(),
                n_tips
            );
        }
        let n_patterns = patterns.n_patterns();
        if n_patterns == 0 {
            bail!("alignment has no site patterns");
        }
        let n_nodes = tree.node_count();
        let n_internal = n_nodes - n_tips;

        let mut tip_partials = Vec::with_capacity(n_tips);
        for tip in 0..n_tips {
            let mut buf = vec![0.0; n_patterns * NUM_STATES];
            for (pat, &code) in patterns.row(tip).iter().enumerate() {
                let states = ambiguity_partial(code);
                buf[pat * NUM_STATES..(pat + 1) * NUM_STATES].copy_from_slice(&states);
            }
            tip_partials.push(buf);
        }

        let block = n_categories * n_patterns * NUM_STATES;
        Ok(Self {
            n_tips,
            n_patterns,
            n_categories,
            pattern_weights: patterns.weights().to_vec(),
            tip_partials,
            partials: (0..n_internal)
                .map(|_| [vec![0.0; block], vec![0.0; block]])
                .collect(),
            partial_active: vec![0; n_internal],
            partial_stored: vec![0; n_internal],
            matrices: (0..n_nodes)
                .map(|_| {
                    [
                        Array3::zeros((n_categories, NUM_STATES, NUM_STATES)),
                        Array3::zeros((n_categories, NUM_STATES, NUM_STATES)),
                    ]
                })
                .collect(),
            matrix_active: vec![0; n_nodes],
            matrix_stored: vec![0; n_nodes],
            update_partial: vec![true; n_nodes],
            update_matrix: vec![true; n_nodes],
            kernel,
            partial_recomputes: 0,
            tree_ref: 0,
            subst_ref: 0,
            rates_ref: 0,
        })
    }

    /// Total partial-vector recomputations so far; test hook for the
    /// dirty-minimality guarantees.
    pub fn partial_recomputes(&self) -> u64 {
        self.partial_recomputes
    }

    /// Nodes whose partials are pending recomputation.
    pub fn pending_partials(&self) -> Vec<usize> {
        self.update_partial
            .iter()
            .enumerate()
            .filter(|&(id, &b)| b && id >= self.n_tips)
            .map(|(id, _)| id)
            .collect()
    }

    /// Nodes whose branch matrices are pending recomputation.
    pub fn pending_matrices(&self) -> Vec<usize> {
        self.update_matrix
            .iter()
            .enumerate()
            .filter(|&(_, &b)| b)
            .map(|(id, _)| id)
            .collect()
    }

    /// Damage for a height change of `node`: the branch above it and the
    /// branches to its children change length; partials are stale on the
    /// strictly rootward path only, never in sibling subtrees.
    pub fn mark_height_change(&mut self, tree: &TreeModel, node: usize) {
        self.update_matrix[node] = true;
        if !tree.is_tip(node) {
            self.update_matrix[tree.left(node)] = true;
            self.update_matrix[tree.right(node)] = true;
        }
        self.mark_path_to_root(tree, node);
    }

    /// Damage for a topology change that re-parented `node`.
    pub fn mark_topology_change(&mut self, tree: &TreeModel, node: usize) {
        self.update_matrix[node] = true;
        self.mark_path_to_root(tree, node);
    }

    /// Damage everything (substitution or site-rate parameters changed).
    pub fn mark_all(&mut self) {
        self.update_partial.iter_mut().for_each(|b| *b = true);
        self.update_matrix.iter_mut().for_each(|b| *b = true);
    }

    fn mark_path_to_root(&mut self, tree: &TreeModel, node: usize) {
        self.update_partial[node] = true;
        let mut cur = node;
        while let Some(parent) = tree.parent(cur) {
            self.update_partial[parent] = true;
            cur = parent;
        }
    }

    /// Recompute damaged branch matrices and partials in post order and
    /// return the total log-likelihood. Work is proportional to the damage
    /// set. A zero pattern likelihood yields `-inf`, which the chain treats
    /// as an automatic reject.
    pub fn log_likelihood(
        &mut self,
        tree: &mut TreeModel,
        subst: &SubstModel,
        rates: &SiteRates,
        params: &ParamStore,
    ) -> Result<f64> {
        let postorder = tree.postorder().to_vec();
        let root = tree.root();
        let cat_rates = rates.rates().to_vec();
        let block = self.n_patterns * NUM_STATES;

        for &node in &postorder {
            if node == root || !self.update_matrix[node] {
                continue;
            }
            let parent = tree.parent(node).expect("non-root node has a parent");
            let blen = tree.height(parent) - tree.height(node);
            if blen < 0.0 {
                bail!(
                    "negative branch length {blen} above node {node}: tree edits bypassed the height invariant"
                );
            }
            if self.matrix_active[node] == self.matrix_stored[node] {
                self.matrix_active[node] ^= 1;
            }
            let buf = self.matrix_active[node] as usize;
            for (cat, &rate) in cat_rates.iter().enumerate() {
                subst.fill_transition(
                    params,
                    blen * rate,
                    self.matrices[node][buf].index_axis_mut(Axis(0), cat),
                )?;
            }
        }

        for &node in &postorder {
            if tree.is_tip(node) || !self.update_partial[node] {
                continue;
            }
            let left = tree.left(node);
            let right = tree.right(node);
            let slot = node - self.n_tips;
            if self.partial_active[slot] == self.partial_stored[slot] {
                self.partial_active[slot] ^= 1;
            }
            let buf = self.partial_active[slot] as usize;
            let mut dest = std::mem::take(&mut self.partials[slot][buf]);
            for cat in 0..self.n_categories {
                let l_part = self.node_partials(left, cat, block);
                let r_part = self.node_partials(right, cat, block);
                let m_l = self.matrices[left][self.matrix_active[left] as usize]
                    .index_axis(Axis(0), cat);
                let m_r = self.matrices[right][self.matrix_active[right] as usize]
                    .index_axis(Axis(0), cat);
                self.kernel.combine(
                    l_part,
                    r_part,
                    m_l,
                    m_r,
                    &mut dest[cat * block..(cat + 1) * block],
                    self.n_patterns,
                );
            }
            self.partials[slot][buf] = dest;
            self.partial_recomputes += 1;
        }

        let freqs = subst.frequencies(params);
        let cat_weight = rates.category_weight();
        let root_slot = root - self.n_tips;
        let root_buf = self.partial_active[root_slot] as usize;
        let root_partials = &self.partials[root_slot][root_buf];
        let mut total = 0.0;
        for pat in 0..self.n_patterns {
            let mut site = 0.0;
            for cat in 0..self.n_categories {
                let off = cat * block + pat * NUM_STATES;
                for s in 0..NUM_STATES {
                    site += cat_weight * freqs[s] * root_partials[off + s];
                }
            }
            if site <= 0.0 {
                total = f64::NEG_INFINITY;
                break;
            }
            total += self.pattern_weights[pat] * site.ln();
        }

        self.update_partial.iter_mut().for_each(|b| *b = false);
        self.update_matrix.iter_mut().for_each(|b| *b = false);
        Ok(total)
    }

    fn node_partials(&self, node: usize, cat: usize, block: usize) -> &[f64] {
        if node < self.n_tips {
            // Tip partials carry no category axis: the category enters
            // through the branch matrix alone.
            &self.tip_partials[node]
        } else {
            let slot = node - self.n_tips;
            let buf = self.partial_active[slot] as usize;
            &self.partials[slot][buf][cat * block..(cat + 1) * block]
        }
    }

    pub(crate) fn store_state(&mut self) {
        self.partial_stored.copy_from_slice(&self.partial_active);
        self.matrix_stored.copy_from_slice(&self.matrix_active);
    }

    pub(crate) fn restore_state(&mut self) {
        self.partial_active.copy_from_slice(&self.partial_stored);
        self.matrix_active.copy_from_slice(&self.matrix_stored);
        self.update_partial.iter_mut().for_each(|b| *b = false);
        self.update_matrix.iter_mut().for_each(|b| *b = false);
    }

    pub(crate) fn accept_state(&mut self) {
        self.partial_stored.copy_from_slice(&self.partial_active);
        self.matrix_stored.copy_from_slice(&self.matrix_active);
    }

    /// Snapshot of active-buffer indices and damage flags; test hook for
    /// the reject round-trip property.
    pub fn cache_fingerprint(&self) -> (Vec<u8>, Vec<u8>, Vec<bool>, Vec<bool>) {
        (
            self.partial_active.clone(),
            self.matrix_active.clone(),
            self.update_partial.clone(),
            self.update_matrix.clone(),
        )
    }

    /// Active partials of one node, flattened; test hook.
    pub fn active_partials(&self, node: usize) -> &[f64] {
        let slot = node - self.n_tips;
        &self.partials[slot][self.partial_active[slot] as usize]
    }
}
