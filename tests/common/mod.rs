#![allow(dead_code)]

use std::sync::Arc;

use bmc3_rs::coalescent::ConstantCoalescent;
use bmc3_rs::io::fasta::{SitePatterns, parse_fasta};
use bmc3_rs::likelihood::{CpuKernel, TreeLikelihoodEngine};
use bmc3_rs::model::{Composite, ModelGraph, ModelKind};
use bmc3_rs::param::{Bounds, Parameter};
use bmc3_rs::subst::{SiteRates, SubstKind, SubstModel};
use bmc3_rs::tree::{NONE, TreeModel, TreeNode};

pub struct Fixture {
    pub graph: ModelGraph,
    pub tree_model: usize,
    pub likelihood_model: usize,
    pub demographic_model: usize,
    pub posterior_model: usize,
    pub pop_size: usize,
}

pub fn four_tip_patterns() -> SitePatterns {
    let aln = parse_fasta(
        ">A\nACGTACGTACGTACGTAAGG\n>B\nACGTACGTACGTACGTAAGC\n>C\nTGCATGCATGCATGCAAAGG\n>D\nTGCATGCATGCATGCAAAGC\n",
    )
    .expect("fixture alignment parses");
    SitePatterns::from_alignment(&aln).expect("fixture patterns build")
}

/// ((A,B),(C,D)) with tips at height 0, cherries at 1.0, root at 2.0.
pub fn four_tip_tree() -> TreeModel {
    let names: Vec<String> = ["A", "B", "C", "D"].iter().map(|s| s.to_string()).collect();
    let mut nodes = vec![TreeNode::tip(0.0); 4];
    nodes.push(TreeNode {
        parent: 6,
        left: 0,
        right: 1,
        height: 1.0,
    });
    nodes.push(TreeNode {
        parent: 6,
        left: 2,
        right: 3,
        height: 1.0,
    });
    nodes.push(TreeNode {
        parent: NONE,
        left: 4,
        right: 5,
        height: 2.0,
    });
    for (tip, parent) in [(0usize, 4usize), (1, 4), (2, 5), (3, 5)] {
        nodes[tip].parent = parent;
    }
    TreeModel::from_nodes(names, nodes, 6).expect("fixture tree is valid")
}

/// A deterministic JC69 graph over the fixed 4-tip tree: likelihood plus a
/// constant coalescent prior, wired exactly the way the builder wires a
/// full analysis.
pub fn fixed_graph() -> Fixture {
    fixed_graph_with_pop(2.0)
}

pub fn fixed_graph_with_pop(pop: f64) -> Fixture {
    let patterns = four_tip_patterns();
    let tree = four_tip_tree();
    let mut graph = ModelGraph::new();

    let freqs = graph.add_param(Parameter::new("freqs", vec![0.25; 4], None));
    let pop_size = graph.add_param(Parameter::new(
        "pop_size",
        vec![pop],
        Some(Bounds { lo: 1e-9, hi: 1e9 }),
    ));

    let tree_idx = graph.add_tree(tree);
    let subst_idx = graph.add_subst(SubstModel {
        kind: SubstKind::Jc69,
        kappa: None,
        freqs,
    });
    let rates_idx = graph.add_rates(SiteRates::single());
    let demo_idx = graph.add_demographic(ConstantCoalescent {
        pop_size,
        tree_ref: tree_idx,
    });
    let mut engine =
        TreeLikelihoodEngine::new(graph.tree(tree_idx), &patterns, 1, Arc::new(CpuKernel))
            .expect("fixture engine builds");
    engine.tree_ref = tree_idx;
    engine.subst_ref = subst_idx;
    engine.rates_ref = rates_idx;
    let engine_idx = graph.add_likelihood(engine);

    let tree_model = graph.add_model("tree", ModelKind::Tree(tree_idx));
    let subst_model = graph.add_model("substitution", ModelKind::SubstitutionProcess(subst_idx));
    let rates_model = graph.add_model("site_rates", ModelKind::SiteRates(rates_idx));
    let demographic_model = graph.add_model("coalescent", ModelKind::Demographic(demo_idx));
    let likelihood_model = graph.add_model("tree_likelihood", ModelKind::TreeLikelihood(engine_idx));
    let composite_idx = graph.add_composite(Composite {
        children: vec![likelihood_model, demographic_model],
    });
    let posterior_model = graph.add_model("posterior", ModelKind::Composite(composite_idx));

    graph.bind_param(freqs, subst_model);
    graph.bind_param(pop_size, demographic_model);
    graph.add_listener(tree_model, likelihood_model);
    graph.add_listener(tree_model, demographic_model);
    graph.add_listener(subst_model, likelihood_model);
    graph.add_listener(rates_model, likelihood_model);
    graph.add_listener(likelihood_model, posterior_model);
    graph.add_listener(demographic_model, posterior_model);
    graph.set_posterior(posterior_model);
    graph.validate().expect("fixture graph validates");

    Fixture {
        graph,
        tree_model,
        likelihood_model,
        demographic_model,
        posterior_model,
        pop_size,
    }
}

pub fn approx_eq(a: f64, b: f64, eps: f64) {
    assert!(
        (a - b).abs() <= eps,
        "expected {a} ~= {b} within eps={eps}, got diff={}",
        (a - b).abs()
    );
}
