mod common;

use common::{approx_eq, fixed_graph, four_tip_tree};

use std::sync::Arc;

use bmc3_rs::io::fasta::{SitePatterns, parse_fasta};
use bmc3_rs::likelihood::{CpuKernel, TreeLikelihoodEngine};
use bmc3_rs::param::{ParamStore, Parameter};
use bmc3_rs::subst::{SiteRates, SubstKind, SubstModel};

#[test]
fn root_height_move_dirties_exactly_the_root() {
    let mut fx = fixed_graph();
    fx.graph.log_posterior().expect("initial evaluation");
    fx.graph.accept_all();
    fx.graph.store_all();

    let tree_model = fx.tree_model;
    fx.graph
        .set_node_height(tree_model, 6, 3.0)
        .expect("root move is legal");

    // Partials: only the root. Not the internal children, not the tips.
    assert_eq!(fx.graph.engine(0).pending_partials(), vec![6]);
    // Matrices: the two branches hanging off the root changed length.
    let mut matrices = fx.graph.engine(0).pending_matrices();
    matrices.retain(|&n| n != 6); // the root itself carries no branch
    matrices.sort_unstable();
    assert_eq!(matrices, vec![4, 5]);
    fx.graph.restore_all();
}

#[test]
fn cherry_height_move_dirties_the_rootward_path_only() {
    let mut fx = fixed_graph();
    fx.graph.log_posterior().expect("initial evaluation");
    fx.graph.accept_all();
    fx.graph.store_all();

    let tree_model = fx.tree_model;
    fx.graph
        .set_node_height(tree_model, 4, 1.5)
        .expect("cherry move is legal");

    let mut pending = fx.graph.engine(0).pending_partials();
    pending.sort_unstable();
    // Node 4 and its ancestor path; the sibling subtree (node 5) is spared.
    assert_eq!(pending, vec![4, 6]);
    fx.graph.restore_all();
}

#[test]
fn recomputation_work_tracks_the_dirty_frontier() {
    let mut fx = fixed_graph();
    fx.graph.log_posterior().expect("initial evaluation");
    fx.graph.accept_all();

    fx.graph.store_all();
    let tree_model = fx.tree_model;
    fx.graph
        .set_node_height(tree_model, 6, 2.5)
        .expect("root move is legal");
    let before = fx.graph.engine(0).partial_recomputes();
    fx.graph.log_posterior().expect("incremental evaluation");
    assert_eq!(
        fx.graph.engine(0).partial_recomputes() - before,
        1,
        "a root-only change must recompute one partial vector"
    );
    fx.graph.accept_all();
}

#[test]
fn incremental_update_matches_fresh_evaluation() {
    let mut fx = fixed_graph();
    fx.graph.log_posterior().expect("initial evaluation");
    fx.graph.accept_all();

    fx.graph.store_all();
    let tree_model = fx.tree_model;
    fx.graph
        .set_node_height(tree_model, 4, 1.7)
        .expect("cherry move is legal");
    fx.graph
        .set_node_height(tree_model, 6, 2.9)
        .expect("root move is legal");
    let incremental = fx.graph.log_posterior().expect("incremental evaluation");
    fx.graph.accept_all();

    // A graph built directly in the final state must agree exactly.
    let mut fresh = fixed_graph();
    let tree_model = fresh.tree_model;
    fresh.graph.store_all();
    fresh
        .graph
        .set_node_height(tree_model, 4, 1.7)
        .expect("cherry move is legal");
    fresh
        .graph
        .set_node_height(tree_model, 6, 2.9)
        .expect("root move is legal");
    let full = fresh.graph.log_posterior().expect("full evaluation");
    approx_eq(incremental, full, 1e-12);
}

#[test]
fn topology_exchange_updates_the_likelihood_consistently() {
    let mut fx = fixed_graph();
    fx.graph.log_posterior().expect("initial evaluation");
    fx.graph.accept_all();

    fx.graph.store_all();
    let tree_model = fx.tree_model;
    fx.graph.exchange(tree_model, 0, 2).expect("legal exchange");
    let swapped = fx.graph.log_posterior().expect("post-exchange evaluation");
    fx.graph.accept_all();
    assert!(swapped.is_finite());

    // Restore-by-inverse: exchanging back recovers the original density.
    fx.graph.store_all();
    fx.graph.exchange(tree_model, 0, 2).expect("inverse exchange");
    let back = fx.graph.log_posterior().expect("inverse evaluation");
    let original = {
        let mut fresh = fixed_graph();
        fresh.graph.log_posterior().expect("fresh evaluation")
    };
    approx_eq(back, original, 1e-9);
}

#[test]
fn all_ambiguous_alignment_has_zero_log_likelihood() {
    let aln = parse_fasta(">A\nNNNN\n>B\nNNNN\n>C\nNNNN\n>D\nNNNN\n").expect("valid fasta");
    let patterns = SitePatterns::from_alignment(&aln).expect("patterns");
    let mut tree = four_tip_tree();
    let mut params = ParamStore::default();
    let freqs = params.add(Parameter::new("freqs", vec![0.25; 4], None));
    let subst = SubstModel {
        kind: SubstKind::Jc69,
        kappa: None,
        freqs,
    };
    let rates = SiteRates::single();
    let mut engine =
        TreeLikelihoodEngine::new(&tree, &patterns, 1, Arc::new(CpuKernel)).expect("engine");
    let ll = engine
        .log_likelihood(&mut tree, &subst, &rates, &params)
        .expect("evaluates");
    // Missing data is uninformative: each site integrates to probability 1.
    approx_eq(ll, 0.0, 1e-12);
}

#[test]
fn identical_sequences_prefer_shallow_trees() {
    let aln = parse_fasta(
        ">A\nACGTACGTACGTACGT\n>B\nACGTACGTACGTACGT\n>C\nACGTACGTACGTACGT\n>D\nACGTACGTACGTACGT\n",
    )
    .expect("valid fasta");
    let patterns = SitePatterns::from_alignment(&aln).expect("patterns");
    let mut params = ParamStore::default();
    let freqs = params.add(Parameter::new("freqs", vec![0.25; 4], None));
    let subst = SubstModel {
        kind: SubstKind::Jc69,
        kappa: None,
        freqs,
    };
    let rates = SiteRates::single();

    let ll_at = |scale: f64| {
        let mut tree = four_tip_tree();
        for (node, h) in [(4usize, 1.0), (5, 1.0), (6, 2.0)] {
            // scale the fixture heights
            tree.set_height(node, h * scale).expect("legal heights");
        }
        let mut engine =
            TreeLikelihoodEngine::new(&tree, &patterns, 1, Arc::new(CpuKernel)).expect("engine");
        engine
            .log_likelihood(&mut tree, &subst, &rates, &params)
            .expect("evaluates")
    };
    assert!(ll_at(0.1) > ll_at(1.0));
}

#[test]
fn pattern_weights_reproduce_per_site_evaluation() {
    // Two alignments with the same columns in different multiplicities:
    // doubling every column doubles the log-likelihood.
    let aln1 = parse_fasta(">A\nAC\n>B\nAC\n>C\nTG\n>D\nTG\n").expect("valid fasta");
    let aln2 = parse_fasta(">A\nACAC\n>B\nACAC\n>C\nTGTG\n>D\nTGTG\n").expect("valid fasta");
    let mut params = ParamStore::default();
    let freqs = params.add(Parameter::new("freqs", vec![0.25; 4], None));
    let subst = SubstModel {
        kind: SubstKind::Jc69,
        kappa: None,
        freqs,
    };
    let rates = SiteRates::single();

    let ll = |aln: &bmc3_rs::io::fasta::Alignment| {
        let patterns = SitePatterns::from_alignment(aln).expect("patterns");
        let mut tree = four_tip_tree();
        let mut engine =
            TreeLikelihoodEngine::new(&tree, &patterns, 1, Arc::new(CpuKernel)).expect("engine");
        engine
            .log_likelihood(&mut tree, &subst, &rates, &params)
            .expect("evaluates")
    };
    approx_eq(2.0 * ll(&aln1), ll(&aln2), 1e-10);
}
