use std::sync::Arc;

use anyhow::{Result, bail};
use rand::Rng;
use rand::rngs::SmallRng;

use crate::coalescent::ConstantCoalescent;
use crate::io::fasta::SitePatterns;
use crate::likelihood::{CpuKernel, TreeLikelihoodEngine};
use crate::model::{Composite, ModelGraph, ModelId, ModelKind};
use crate::operators::{OperatorKind, OperatorSchedule};
use crate::param::{Bounds, ParamId, Parameter};
use crate::subst::{SiteRates, SubstKind, SubstModel};
use crate::tree::{NONE, TreeModel, TreeNode};

/// Settings the builder needs beyond the alignment itself.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub subst: SubstKind,
    /// 0 or 1 disables site-rate heterogeneity.
    pub gamma_categories: usize,
    pub kappa0: f64,
    pub shape0: f64,
    pub pop_size0: f64,
    pub slide_window: f64,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            subst: SubstKind::Hky85,
            gamma_categories: 4,
            kappa0: 2.0,
            shape0: 0.5,
            pop_size0: 1.0,
            slide_window: 0.25,
        }
    }
}

/// A fully wired graph plus the handles operators and reporting need.
pub struct BuiltGraph {
    pub graph: ModelGraph,
    pub tree_model: ModelId,
    pub likelihood_model: ModelId,
    pub demographic_model: ModelId,
    pub kappa: Option<ParamId>,
    pub shape: Option<ParamId>,
    pub pop_size: ParamId,
    pub slide_window: f64,
}

/// Draw a starting genealogy by sequential random coalescence: tips enter
/// at height 0, pairs merge at exponentially distributed waiting times
/// under the initial population size.
pub fn random_coalescent_tree(
    tip_names: &[String],
    pop_size: f64,
    rng: &mut SmallRng,
) -> Result<TreeModel> {
    let n = tip_names.len();
    if n < 2 {
        bail!("cannot build a tree from {n} tips");
    }
    let mut nodes: Vec<TreeNode> = (0..n).map(|_| TreeNode::tip(0.0)).collect();
    let mut active: Vec<usize> = (0..n).collect();
    let mut height = 0.0;
    while active.len() > 1 {
        let k = active.len() as f64;
        let mean_wait = 2.0 * pop_size / (k * (k - 1.0));
        let u: f64 = rng.gen::<f64>().max(f64::MIN_POSITIVE);
        height += -u.ln() * mean_wait;
        let a = active.swap_remove(rng.gen_range(0..active.len()));
        let b = active.swap_remove(rng.gen_range(0..active.len()));
        let id = nodes.len();
        nodes.push(TreeNode {
            parent: NONE,
            left: a,
            right: b,
            height,
        });
        nodes[a].parent = id;
        nodes[b].parent = id;
        active.push(id);
    }
    let root = nodes.len() - 1;
    TreeModel::from_nodes(tip_names.to_vec(), nodes, root)
}

/// Construct the full model graph for one analysis: tree, substitution
/// process, site rates, coalescent prior, likelihood engine and the
/// posterior composite, with dependencies wired so change notifications
/// reach every cache. The graph is validated before handover.
pub fn build_graph(
    patterns: &SitePatterns,
    settings: &RunSettings,
    rng: &mut SmallRng,
) -> Result<BuiltGraph> {
    let mut graph = ModelGraph::new();

    let tree = random_coalescent_tree(patterns.names(), settings.pop_size0, rng)?;

    let freqs = match settings.subst {
        SubstKind::Jc69 => Parameter::new("freqs", vec![0.25; 4], None),
        SubstKind::Hky85 => {
            let f = patterns.empirical_frequencies();
            Parameter::new("freqs", f.to_vec(), Some(Bounds { lo: 0.0, hi: 1.0 }))
        }
    };
    let freqs = graph.add_param(freqs);

    let kappa = match settings.subst {
        SubstKind::Jc69 => None,
        SubstKind::Hky85 => {
            if settings.kappa0 <= 0.0 {
                bail!("initial kappa must be positive, got {}", settings.kappa0);
            }
            Some(graph.add_param(Parameter::new(
                "kappa",
                vec![settings.kappa0],
                Some(Bounds {
                    lo: 1e-4,
                    hi: 1e4,
                }),
            )))
        }
    };

    let gamma_on = settings.gamma_categories > 1;
    let shape = if gamma_on {
        if settings.shape0 <= 0.0 {
            bail!("initial gamma shape must be positive, got {}", settings.shape0);
        }
        Some(graph.add_param(Parameter::new(
            "gamma_shape",
            vec![settings.shape0],
            Some(Bounds { lo: 0.05, hi: 100.0 }),
        )))
    } else {
        None
    };

    if settings.pop_size0 <= 0.0 {
        bail!(
            "initial population size must be positive, got {}",
            settings.pop_size0
        );
    }
    let pop_size = graph.add_param(Parameter::new(
        "pop_size",
        vec![settings.pop_size0],
        Some(Bounds { lo: 1e-9, hi: 1e9 }),
    ));

    let tree_idx = graph.add_tree(tree);
    let subst_idx = graph.add_subst(SubstModel {
        kind: settings.subst,
        kappa,
        freqs,
    });
    let rates_idx = graph.add_rates(match shape {
        Some(shape) => SiteRates::gamma(settings.gamma_categories, shape),
        None => SiteRates::single(),
    });
    let demo_idx = graph.add_demographic(ConstantCoalescent {
        pop_size,
        tree_ref: tree_idx,
    });

    let n_categories = if gamma_on { settings.gamma_categories } else { 1 };
    let mut engine = TreeLikelihoodEngine::new(
        graph.tree(tree_idx),
        patterns,
        n_categories,
        Arc::new(CpuKernel),
    )?;
    engine.tree_ref = tree_idx;
    engine.subst_ref = subst_idx;
    engine.rates_ref = rates_idx;
    let engine_idx = graph.add_likelihood(engine);

    let tree_model = graph.add_model("tree", ModelKind::Tree(tree_idx));
    let subst_model = graph.add_model("substitution", ModelKind::SubstitutionProcess(subst_idx));
    let rates_model = graph.add_model("site_rates", ModelKind::SiteRates(rates_idx));
    let demographic_model = graph.add_model("coalescent", ModelKind::Demographic(demo_idx));
    let likelihood_model =
        graph.add_model("tree_likelihood", ModelKind::TreeLikelihood(engine_idx));
    let composite_idx = graph.add_composite(Composite {
        children: vec![likelihood_model, demographic_model],
    });
    let posterior = graph.add_model("posterior", ModelKind::Composite(composite_idx));

    graph.bind_param(freqs, subst_model);
    if let Some(kappa) = kappa {
        graph.bind_param(kappa, subst_model);
    }
    if let Some(shape) = shape {
        graph.bind_param(shape, rates_model);
    }
    graph.bind_param(pop_size, demographic_model);

    graph.add_listener(tree_model, likelihood_model);
    graph.add_listener(tree_model, demographic_model);
    graph.add_listener(subst_model, likelihood_model);
    graph.add_listener(rates_model, likelihood_model);
    graph.add_listener(likelihood_model, posterior);
    graph.add_listener(demographic_model, posterior);

    graph.set_posterior(posterior);
    graph.validate()?;

    Ok(BuiltGraph {
        graph,
        tree_model,
        likelihood_model,
        demographic_model,
        kappa,
        shape,
        pop_size,
        slide_window: settings.slide_window,
    })
}

/// The default weighted operator mix for a built graph, in the spirit of
/// the usual height-heavy schedules.
pub fn default_schedule(built: &BuiltGraph) -> Result<OperatorSchedule> {
    let mut entries = vec![
        (
            OperatorKind::HeightSlide {
                tree: built.tree_model,
                window: built.slide_window,
            },
            15.0,
        ),
        (
            OperatorKind::RootScale {
                tree: built.tree_model,
                factor: 0.75,
            },
            3.0,
        ),
        (
            OperatorKind::TreeScale {
                tree: built.tree_model,
                factor: 0.75,
            },
            3.0,
        ),
        (
            OperatorKind::NarrowExchange {
                tree: built.tree_model,
            },
            10.0,
        ),
        (
            OperatorKind::Scale {
                param: built.pop_size,
                factor: 0.75,
            },
            3.0,
        ),
    ];
    if let Some(kappa) = built.kappa {
        entries.push((
            OperatorKind::Scale {
                param: kappa,
                factor: 0.75,
            },
            2.0,
        ));
    }
    if let Some(shape) = built.shape {
        entries.push((
            OperatorKind::Scale {
                param: shape,
                factor: 0.75,
            },
            2.0,
        ));
    }
    OperatorSchedule::new(entries)
}
