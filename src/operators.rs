use anyhow::{Result, bail};
use rand::Rng;
use rand::rngs::SmallRng;

use crate::model::{ModelGraph, ModelId};
use crate::param::{MoveVeto, ParamId};

/// The move generators. A closed set, like the model variants: every
/// operator mutates state only through the graph's checked contracts and
/// reports its log Hastings ratio, or a veto the chain counts as a reject.
#[derive(Debug, Clone)]
pub enum OperatorKind {
    /// Multiply one random dimension of a parameter by
    /// `s = f + u(1/f - f)`.
    Scale { param: ParamId, factor: f64 },
    /// Slide one random internal non-root node height inside a uniform
    /// window.
    HeightSlide { tree: ModelId, window: f64 },
    /// Scale the root height.
    RootScale { tree: ModelId, factor: f64 },
    /// Scale every internal node height by one factor.
    TreeScale { tree: ModelId, factor: f64 },
    /// Narrow exchange: swap a nephew with its uncle.
    NarrowExchange { tree: ModelId },
}

fn draw_scale(factor: f64, rng: &mut SmallRng) -> f64 {
    factor + rng.gen::<f64>() * (1.0 / factor - factor)
}

impl OperatorKind {
    pub fn name(&self) -> &'static str {
        match self {
            OperatorKind::Scale { .. } => "scale",
            OperatorKind::HeightSlide { .. } => "height_slide",
            OperatorKind::RootScale { .. } => "root_scale",
            OperatorKind::TreeScale { .. } => "tree_scale",
            OperatorKind::NarrowExchange { .. } => "narrow_exchange",
        }
    }

    /// Apply the move to the graph. `Err` is a veto: the caller broadcasts
    /// restore and counts a rejection; nothing here recomputes densities.
    pub fn propose(&self, graph: &mut ModelGraph, rng: &mut SmallRng) -> Result<f64, MoveVeto> {
        match *self {
            OperatorKind::Scale { param, factor } => {
                let dim = graph.params().get(param).dim();
                let index = rng.gen_range(0..dim);
                let old = graph.params().get(param).value(index);
                let s = draw_scale(factor, rng);
                graph.set_value(param, index, old * s)?;
                Ok(-s.ln())
            }
            OperatorKind::HeightSlide { tree, window } => {
                let view = graph.tree_view(tree)?;
                let root = view.root();
                let n_tips = view.n_tips();
                let n_nodes = view.node_count();
                let candidates: Vec<usize> =
                    (n_tips..n_nodes).filter(|&id| id != root).collect();
                if candidates.is_empty() {
                    return Err(MoveVeto::new("tree has no slidable internal nodes"));
                }
                let node = candidates[rng.gen_range(0..candidates.len())];
                let delta = (rng.gen::<f64>() * 2.0 - 1.0) * window;
                let height = view.height(node) + delta;
                graph.set_node_height(tree, node, height)?;
                Ok(0.0)
            }
            OperatorKind::RootScale { tree, factor } => {
                let view = graph.tree_view(tree)?;
                let root = view.root();
                let old = view.height(root);
                let s = draw_scale(factor, rng);
                graph.set_node_height(tree, root, old * s)?;
                Ok(-s.ln())
            }
            OperatorKind::TreeScale { tree, factor } => {
                let s = draw_scale(factor, rng);
                let view = graph.tree_view(tree)?;
                let n_tips = view.n_tips();
                let n_nodes = view.node_count();
                let mut internals: Vec<(usize, f64)> = (n_tips..n_nodes)
                    .map(|id| (id, view.height(id)))
                    .collect();
                // Apply top-down when growing and bottom-up when shrinking
                // so no intermediate state trips the ordering check.
                if s >= 1.0 {
                    internals.sort_by(|a, b| b.1.total_cmp(&a.1));
                } else {
                    internals.sort_by(|a, b| a.1.total_cmp(&b.1));
                }
                for (id, height) in internals {
                    graph.set_node_height(tree, id, height * s)?;
                }
                let k = (n_nodes - n_tips) as f64;
                Ok((k - 2.0) * s.ln())
            }
            OperatorKind::NarrowExchange { tree } => {
                let view = graph.tree_view(tree)?;
                let root = view.root();
                let n_tips = view.n_tips();
                let n_nodes = view.node_count();
                let candidates: Vec<usize> =
                    (n_tips..n_nodes).filter(|&id| id != root).collect();
                if candidates.is_empty() {
                    return Err(MoveVeto::new("tree is too small for an exchange"));
                }
                let node = candidates[rng.gen_range(0..candidates.len())];
                let parent = view.parent(node).expect("non-root node has a parent");
                let sibling = if view.left(parent) == node {
                    view.right(parent)
                } else {
                    view.left(parent)
                };
                let child = if rng.gen::<bool>() {
                    view.left(node)
                } else {
                    view.right(node)
                };
                graph.exchange(tree, child, sibling)?;
                Ok(0.0)
            }
        }
    }
}

/// Weighted schedule over operators; drawn by cumulative probability each
/// step.
#[derive(Debug, Clone)]
pub struct OperatorSchedule {
    ops: Vec<OperatorKind>,
    weights: Vec<f64>,
    total: f64,
}

impl OperatorSchedule {
    pub fn new(entries: Vec<(OperatorKind, f64)>) -> Result<Self> {
        if entries.is_empty() {
            bail!("operator schedule is empty");
        }
        let mut ops = Vec::with_capacity(entries.len());
        let mut weights = Vec::with_capacity(entries.len());
        for (op, w) in entries {
            if w <= 0.0 || !w.is_finite() {
                bail!("operator {} has non-positive weight {w}", op.name());
            }
            ops.push(op);
            weights.push(w);
        }
        let total = weights.iter().sum();
        Ok(Self {
            ops,
            weights,
            total,
        })
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn op(&self, idx: usize) -> &OperatorKind {
        &self.ops[idx]
    }

    pub fn choose(&self, rng: &mut SmallRng) -> usize {
        let target = rng.gen::<f64>() * self.total;
        let mut acc = 0.0;
        for (i, w) in self.weights.iter().enumerate() {
            acc += w;
            if acc > target {
                return i;
            }
        }
        self.ops.len() - 1
    }
}
