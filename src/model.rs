use anyhow::{Context, Result, bail};

use crate::coalescent::ConstantCoalescent;
use crate::likelihood::TreeLikelihoodEngine;
pub(crate) use crate::param::ModelId;
use crate::param::{MoveVeto, ParamId, ParamStore, Parameter};
use crate::subst::{SiteRates, SubstModel};
use crate::tree::TreeModel;

/// Closed set of model variants. Each tag indexes a typed component arena
/// on the graph; the graph walker dispatches on the tag instead of virtual
/// call chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    Tree(usize),
    SubstitutionProcess(usize),
    SiteRates(usize),
    Demographic(usize),
    TreeLikelihood(usize),
    Composite(usize),
}

/// Payload of a change notification. Height and topology events carry the
/// edited node so engines can damage the rootward path only.
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    Value,
    NodeHeight(usize),
    Topology(usize),
}

#[derive(Debug, Clone)]
struct ModelNode {
    name: String,
    kind: ModelKind,
    listeners: Vec<ModelId>,
    dirty: bool,
    cached: f64,
    stored_cached: f64,
}

/// Composite density: sums the contributions of its children (the joint
/// posterior is the composite over likelihoods and priors).
#[derive(Debug, Clone)]
pub struct Composite {
    pub children: Vec<ModelId>,
}

/// The dependency graph: parameters, model nodes with dirty flags and
/// listener lists, and the typed component arenas. All mutation flows
/// through the checked `set_*` API so change notifications cannot be
/// skipped, and the whole graph obeys one store/restore/accept protocol.
#[derive(Debug, Clone)]
pub struct ModelGraph {
    params: ParamStore,
    nodes: Vec<ModelNode>,
    trees: Vec<TreeModel>,
    substs: Vec<SubstModel>,
    rates: Vec<SiteRates>,
    demographics: Vec<ConstantCoalescent>,
    likelihoods: Vec<TreeLikelihoodEngine>,
    composites: Vec<Composite>,
    posterior: Option<ModelId>,
}

impl ModelGraph {
    pub fn new() -> Self {
        Self {
            params: ParamStore::default(),
            nodes: Vec::new(),
            trees: Vec::new(),
            substs: Vec::new(),
            rates: Vec::new(),
            demographics: Vec::new(),
            likelihoods: Vec::new(),
            composites: Vec::new(),
            posterior: None,
        }
    }

    // ----- construction ---------------------------------------------------

    pub fn add_param(&mut self, param: Parameter) -> ParamId {
        self.params.add(param)
    }

    pub fn bind_param(&mut self, param: ParamId, owner: ModelId) {
        self.params.get_mut(param).owner = owner;
    }

    pub fn add_tree(&mut self, tree: TreeModel) -> usize {
        self.trees.push(tree);
        self.trees.len() - 1
    }

    pub fn add_subst(&mut self, subst: SubstModel) -> usize {
        self.substs.push(subst);
        self.substs.len() - 1
    }

    pub fn add_rates(&mut self, rates: SiteRates) -> usize {
        self.rates.push(rates);
        self.rates.len() - 1
    }

    pub fn add_demographic(&mut self, demo: ConstantCoalescent) -> usize {
        self.demographics.push(demo);
        self.demographics.len() - 1
    }

    pub fn add_likelihood(&mut self, engine: TreeLikelihoodEngine) -> usize {
        self.likelihoods.push(engine);
        self.likelihoods.len() - 1
    }

    pub fn add_composite(&mut self, composite: Composite) -> usize {
        self.composites.push(composite);
        self.composites.len() - 1
    }

    pub fn add_model(&mut self, name: impl Into<String>, kind: ModelKind) -> ModelId {
        self.nodes.push(ModelNode {
            name: name.into(),
            kind,
            listeners: Vec::new(),
            dirty: true,
            cached: 0.0,
            stored_cached: 0.0,
        });
        self.nodes.len() - 1
    }

    pub fn add_listener(&mut self, source: ModelId, listener: ModelId) {
        self.nodes[source].listeners.push(listener);
    }

    pub fn set_posterior(&mut self, root: ModelId) {
        self.posterior = Some(root);
    }

    /// Handover check: the builder must deliver a fully wired graph.
    /// Structural defects found here abort the run.
    pub fn validate(&mut self) -> Result<()> {
        let root = self.posterior.context("graph has no posterior root model")?;
        if root >= self.nodes.len() {
            bail!("posterior root {root} is not a registered model");
        }
        for tree in &mut self.trees {
            tree.validate()?;
        }
        for node in &self.nodes {
            let in_range = match node.kind {
                ModelKind::Tree(i) => i < self.trees.len(),
                ModelKind::SubstitutionProcess(i) => i < self.substs.len(),
                ModelKind::SiteRates(i) => i < self.rates.len(),
                ModelKind::Demographic(i) => i < self.demographics.len(),
                ModelKind::TreeLikelihood(i) => i < self.likelihoods.len(),
                ModelKind::Composite(i) => i < self.composites.len(),
            };
            if !in_range {
                bail!("model {} references a missing component", node.name);
            }
            for &l in &node.listeners {
                if l >= self.nodes.len() {
                    bail!("model {} has an unregistered listener {l}", node.name);
                }
            }
        }
        Ok(())
    }

    // ----- accessors ------------------------------------------------------

    pub fn params(&self) -> &ParamStore {
        &self.params
    }

    pub fn tree(&self, idx: usize) -> &TreeModel {
        &self.trees[idx]
    }

    pub fn engine(&self, idx: usize) -> &TreeLikelihoodEngine {
        &self.likelihoods[idx]
    }

    pub fn is_dirty(&self, id: ModelId) -> bool {
        self.nodes[id].dirty
    }

    pub fn cached_value(&self, id: ModelId) -> f64 {
        self.nodes[id].cached
    }

    // ----- mutation -------------------------------------------------------

    /// The one write path for parameters: bounds-checked, shadowing, and
    /// change-firing. A veto leaves no trace.
    pub fn set_value(&mut self, param: ParamId, index: usize, value: f64) -> Result<(), MoveVeto> {
        self.params.get_mut(param).set(index, value)?;
        let owner = self.params.get(param).owner;
        self.notify(owner, ChangeEvent::Value);
        Ok(())
    }

    /// Grow or shrink a parameter vector through the same contract.
    pub fn set_dim(&mut self, param: ParamId, dim: usize, fill: f64) -> Result<(), MoveVeto> {
        self.params.get_mut(param).set_dim(dim, fill)?;
        let owner = self.params.get(param).owner;
        self.notify(owner, ChangeEvent::Value);
        Ok(())
    }

    /// Checked node-height edit on a tree model; fires a height event so
    /// only the rootward path is damaged.
    pub fn set_node_height(
        &mut self,
        tree_model: ModelId,
        node: usize,
        height: f64,
    ) -> Result<(), MoveVeto> {
        let t = self.tree_of(tree_model)?;
        self.trees[t].set_height(node, height)?;
        self.notify(tree_model, ChangeEvent::NodeHeight(node));
        Ok(())
    }

    /// Checked subtree exchange; fires topology events for both re-parented
    /// nodes so both new rootward paths are damaged.
    pub fn exchange(&mut self, tree_model: ModelId, a: usize, b: usize) -> Result<(), MoveVeto> {
        let t = self.tree_of(tree_model)?;
        self.trees[t].exchange(a, b)?;
        self.notify(tree_model, ChangeEvent::Topology(a));
        self.notify(tree_model, ChangeEvent::Topology(b));
        Ok(())
    }

    /// Read access to a tree by its model id; operators use this to pick
    /// edit targets before going through the checked edit API.
    pub fn tree_view(&self, model: ModelId) -> Result<&TreeModel, MoveVeto> {
        let t = self.tree_of(model)?;
        Ok(&self.trees[t])
    }

    fn tree_of(&self, model: ModelId) -> Result<usize, MoveVeto> {
        match self.nodes[model].kind {
            ModelKind::Tree(t) => Ok(t),
            _ => Err(MoveVeto::new(format!(
                "model {} is not a tree",
                self.nodes[model].name
            ))),
        }
    }

    /// Propagate a change event through the listener graph. Each model is
    /// visited at most once per event, so deep diamond-shaped graphs stay
    /// linear; damage translation happens on that single visit even when
    /// the model was already dirty from an earlier event this step.
    fn notify(&mut self, start: ModelId, event: ChangeEvent) {
        let mut visited = vec![false; self.nodes.len()];
        let mut queue = vec![start];
        visited[start] = true;
        while let Some(m) = queue.pop() {
            self.apply_event(m, &event);
            self.nodes[m].dirty = true;
            let listeners = self.nodes[m].listeners.clone();
            for l in listeners {
                if !visited[l] {
                    visited[l] = true;
                    queue.push(l);
                }
            }
        }
    }

    /// Model-specific translation of an incoming event into cache damage.
    /// Never recomputes anything; recomputation waits for the next query.
    fn apply_event(&mut self, model: ModelId, event: &ChangeEvent) {
        match self.nodes[model].kind {
            ModelKind::SiteRates(i) => self.rates[i].mark_stale(),
            ModelKind::TreeLikelihood(i) => {
                let tree_ref = self.likelihoods[i].tree_ref;
                let engine = &mut self.likelihoods[i];
                let tree = &self.trees[tree_ref];
                match event {
                    ChangeEvent::Value => engine.mark_all(),
                    ChangeEvent::NodeHeight(n) => engine.mark_height_change(tree, *n),
                    ChangeEvent::Topology(n) => engine.mark_topology_change(tree, *n),
                }
            }
            ModelKind::Tree(_)
            | ModelKind::SubstitutionProcess(_)
            | ModelKind::Demographic(_)
            | ModelKind::Composite(_) => {}
        }
    }

    // ----- evaluation -----------------------------------------------------

    /// Joint log density at the posterior root. Lazy: clean models answer
    /// from cache, dirty models recompute and become clean. Structural
    /// errors (negative branch length, missing component) are fatal here;
    /// non-finite values are returned for the chain to reject.
    pub fn log_posterior(&mut self) -> Result<f64> {
        let root = self.posterior.context("graph has no posterior root model")?;
        self.eval(root)
    }

    fn eval(&mut self, model: ModelId) -> Result<f64> {
        if !self.nodes[model].dirty {
            return Ok(self.nodes[model].cached);
        }
        let value = match self.nodes[model].kind {
            ModelKind::Composite(c) => {
                let children = self.composites[c].children.clone();
                let mut sum = 0.0;
                for child in children {
                    sum += self.eval(child)?;
                }
                sum
            }
            ModelKind::TreeLikelihood(i) => {
                let tree_ref = self.likelihoods[i].tree_ref;
                let subst_ref = self.likelihoods[i].subst_ref;
                let rates_ref = self.likelihoods[i].rates_ref;
                self.rates[rates_ref].refresh(&self.params)?;
                let engine = &mut self.likelihoods[i];
                let tree = &mut self.trees[tree_ref];
                let subst = &self.substs[subst_ref];
                let rates = &self.rates[rates_ref];
                engine.log_likelihood(tree, subst, rates, &self.params)?
            }
            ModelKind::Demographic(i) => {
                let tree_ref = self.demographics[i].tree_ref;
                self.demographics[i].log_prior(&self.trees[tree_ref], &self.params)
            }
            ModelKind::SiteRates(i) => {
                self.rates[i].refresh(&self.params)?;
                0.0
            }
            ModelKind::Tree(_) | ModelKind::SubstitutionProcess(_) => 0.0,
        };
        self.nodes[model].cached = value;
        self.nodes[model].dirty = false;
        Ok(value)
    }

    // ----- transaction protocol -------------------------------------------

    /// Snapshot model-local derived state (tree structure, cache buffer
    /// indices, category rates, cached contributions). Parameter values
    /// shadow themselves lazily on first write, so they are not copied
    /// here. Walks in registration order.
    pub fn store_all(&mut self) {
        for idx in 0..self.nodes.len() {
            match self.nodes[idx].kind {
                ModelKind::Tree(i) => self.trees[i].store_state(),
                ModelKind::SiteRates(i) => self.rates[i].store_state(),
                ModelKind::TreeLikelihood(i) => self.likelihoods[i].store_state(),
                ModelKind::SubstitutionProcess(_)
                | ModelKind::Demographic(_)
                | ModelKind::Composite(_) => {}
            }
            self.nodes[idx].stored_cached = self.nodes[idx].cached;
        }
    }

    /// Roll the whole graph back to the last snapshot without recomputing
    /// anything, and clear every dirty flag. Walks in reverse (LIFO) order.
    pub fn restore_all(&mut self) {
        for idx in (0..self.nodes.len()).rev() {
            match self.nodes[idx].kind {
                ModelKind::Tree(i) => self.trees[i].restore_state(),
                ModelKind::SiteRates(i) => self.rates[i].restore_state(),
                ModelKind::TreeLikelihood(i) => self.likelihoods[i].restore_state(),
                ModelKind::SubstitutionProcess(_)
                | ModelKind::Demographic(_)
                | ModelKind::Composite(_) => {}
            }
            self.nodes[idx].cached = self.nodes[idx].stored_cached;
            self.nodes[idx].dirty = false;
        }
        self.params.restore_all();
    }

    /// Commit the proposal: discard snapshots, clear dirty flags, and let
    /// the current caches stand as valid. Walks in reverse (LIFO) order.
    pub fn accept_all(&mut self) {
        for idx in (0..self.nodes.len()).rev() {
            match self.nodes[idx].kind {
                ModelKind::Tree(i) => self.trees[i].accept_state(),
                ModelKind::SiteRates(i) => self.rates[i].accept_state(),
                ModelKind::TreeLikelihood(i) => self.likelihoods[i].accept_state(),
                ModelKind::SubstitutionProcess(_)
                | ModelKind::Demographic(_)
                | ModelKind::Composite(_) => {}
            }
            self.nodes[idx].stored_cached = self.nodes[idx].cached;
            self.nodes[idx].dirty = false;
        }
        self.params.accept_all();
    }

    // ----- reporting ------------------------------------------------------

    /// Pull-style columns for loggers: density contributions, tree
    /// summaries, then every parameter dimension.
    pub fn log_columns(&self) -> Vec<(String, f64)> {
        let mut cols = Vec::new();
        for node in &self.nodes {
            match node.kind {
                ModelKind::TreeLikelihood(_) | ModelKind::Demographic(_) => {
                    cols.push((node.name.clone(), node.cached));
                }
                _ => {}
            }
        }
        if let Some(tree) = self.trees.first() {
            cols.push(("root_height".to_string(), tree.root_height()));
            cols.push(("tree_length".to_string(), tree.tree_length()));
        }
        for p in self.params.iter() {
            if p.dim() == 1 {
                cols.push((p.name.clone(), p.value(0)));
            } else {
                for i in 0..p.dim() {
                    cols.push((format!("{}[{}]", p.name, i), p.value(i)));
                }
            }
        }
        cols
    }
}

impl Default for ModelGraph {
    fn default() -> Self {
        Self::new()
    }
}
