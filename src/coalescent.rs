use crate::param::{ParamId, ParamStore};
use crate::tree::TreeModel;

/// Constant-population coalescent density over the node heights of a tree.
/// The demographic function is the pluggable piece; this is the one member
/// of the catalogue the crate ships.
#[derive(Debug, Clone)]
pub struct ConstantCoalescent {
    pub pop_size: ParamId,
    /// Arena index of the tree this prior watches.
    pub tree_ref: usize,
}

impl ConstantCoalescent {
    /// Log density of the genealogy: one factor 1/N per coalescence, and
    /// exponential waiting-time factors k(k-1)/2 · Δt / N per interval.
    /// Supports non-contemporaneous tips; sampling events add lineages.
    pub fn log_prior(&self, tree: &TreeModel, params: &ParamStore) -> f64 {
        let n = params.get(self.pop_size).value(0);
        if n <= 0.0 {
            return f64::NEG_INFINITY;
        }

        // (height, lineage delta); samples enter before coalescences at ties.
        let mut events: Vec<(f64, i32)> = Vec::with_capacity(tree.node_count());
        for id in 0..tree.node_count() {
            if tree.is_tip(id) {
                events.push((tree.height(id), 1));
            } else {
                events.push((tree.height(id), -1));
            }
        }
        events.sort_by(|a, b| a.0.total_cmp(&b.0).then(b.1.cmp(&a.1)));

        let mut log_p = 0.0;
        let mut k: i32 = 0;
        let mut prev = 0.0;
        for (height, delta) in events {
            let pairs = (k * (k - 1) / 2) as f64;
            log_p -= pairs * (height - prev) / n;
            if delta < 0 {
                log_p -= n.ln();
            }
            k += delta;
            prev = height;
        }
        log_p
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::{ParamStore, Parameter};
    use crate::tree::{NONE, TreeModel, TreeNode};

    fn approx_eq(a: f64, b: f64, eps: f64) {
        assert!(
            (a - b).abs() <= eps,
            "expected {a} ~= {b} within eps={eps}, got diff={}",
            (a - b).abs()
        );
    }

    fn two_tip_tree(root_height: f64) -> TreeModel {
        let names = vec!["A".to_string(), "B".to_string()];
        let mut nodes = vec![TreeNode::tip(0.0), TreeNode::tip(0.0)];
        nodes.push(TreeNode {
            parent: NONE,
            left: 0,
            right: 1,
            height: root_height,
        });
        nodes[0].parent = 2;
        nodes[1].parent = 2;
        TreeModel::from_nodes(names, nodes, 2).expect("valid tree")
    }

    #[test]
    fn two_tip_density_matches_closed_form() {
        let mut store = ParamStore::default();
        let pop = store.add(Parameter::new("pop_size", vec![2.0], None));
        let prior = ConstantCoalescent {
            pop_size: pop,
            tree_ref: 0,
        };
        let tree = two_tip_tree(1.5);
        // f = (1/N) exp(-t/N) for a single pair coalescing at t
        let want = -(2.0f64.ln()) - 1.5 / 2.0;
        approx_eq(prior.log_prior(&tree, &store), want, 1e-12);
    }

    #[test]
    fn nonpositive_population_is_rejected_not_fatal() {
        let mut store = ParamStore::default();
        let pop = store.add(Parameter::new("pop_size", vec![0.0], None));
        let prior = ConstantCoalescent {
            pop_size: pop,
            tree_ref: 0,
        };
        let tree = two_tip_tree(1.0);
        assert_eq!(prior.log_prior(&tree, &store), f64::NEG_INFINITY);
    }

    #[test]
    fn deeper_trees_are_less_probable_under_small_populations() {
        let mut store = ParamStore::default();
        let pop = store.add(Parameter::new("pop_size", vec![0.5], None));
        let prior = ConstantCoalescent {
            pop_size: pop,
            tree_ref: 0,
        };
        let shallow = prior.log_prior(&two_tip_tree(0.5), &store);
        let deep = prior.log_prior(&two_tip_tree(5.0), &store);
        assert!(shallow > deep);
    }
}
