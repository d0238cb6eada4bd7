use anyhow::bail;
use log::{debug, info};

use crate::backend::{BackendShape, ComputeBackend, CpuBackend, PartialsOperation};
use crate::branch_rates::{BranchRateModel, StrictClock};
use crate::config::{ConfigurationError, LikelihoodConfig};
use crate::likelihood::buffer_index::{DoubleBufferIndex, StateLifecycleError};
use crate::likelihood::dirty::DirtyTracker;
use crate::likelihood::operations::{plan_traversal, OperationPlanner, TraversalPlan};
use crate::likelihood::rescaling::RescalingController;
use crate::likelihood::substitution_delegate::SubstitutionModelDelegate;
use crate::likelihood::{ModelEvent, TreeEvent};
use crate::patterns::Patterns;
use crate::site_models::{DiscreteRates, SiteRateModel};
use crate::substitution_models::{
    BranchModel, HomogeneousBranchModel, SubstMatrix, SubstitutionModel,
};
use crate::tree::{Tree, TreeTopology};
use crate::Result;

/// Everything `restore_state` rolls back that is not a buffer index.
#[derive(Debug, Clone)]
struct StoredState {
    tree: Tree,
    models: Vec<Box<dyn SubstitutionModel>>,
    site_model: Box<dyn SiteRateModel>,
    branch_rates: Box<dyn BranchRateModel>,
    scale_buffer_indices: Vec<usize>,
    log_likelihood: Option<f64>,
    site_log_likelihoods: Option<Vec<f64>>,
    evaluation_id: u64,
    update_substitution_model: bool,
    update_site_model: bool,
    patterns: Option<Patterns>,
}

/// Incrementally evaluated log-likelihood of a tree under a substitution process.
///
/// The likelihood owns the tree and the models. Changes go through the `update_*` methods,
/// which mark the affected partials dirty. [`log_likelihood`](Self::log_likelihood) only
/// recomputes what is dirty and caches the result.
#[derive(Debug)]
pub struct TreeLikelihood<B: ComputeBackend = CpuBackend> {
    tree: Tree,
    patterns: Patterns,
    tip_taxa: Vec<usize>,
    site_model: Box<dyn SiteRateModel>,
    branch_rates: Box<dyn BranchRateModel>,
    delegate: SubstitutionModelDelegate,
    backend: B,
    config: LikelihoodConfig,
    partial_helper: DoubleBufferIndex,
    scale_helper: DoubleBufferIndex,
    scale_buffer_indices: Vec<usize>,
    dirty: DirtyTracker,
    rescaling: RescalingController,
    planner: OperationPlanner,
    update_substitution_model: bool,
    update_site_model: bool,
    log_likelihood: Option<f64>,
    site_log_likelihoods: Option<Vec<f64>>,
    evaluation_id: u64,
    evaluation_count: u64,
    last_plan: TraversalPlan,
    last_operations: Vec<PartialsOperation>,
    pending_tips: Vec<usize>,
    stored: Option<StoredState>,
}

pub struct TreeLikelihoodBuilder {
    tree: Tree,
    patterns: Patterns,
    models: Vec<Box<dyn SubstitutionModel>>,
    branch_model: Option<Box<dyn BranchModel>>,
    site_model: Option<Box<dyn SiteRateModel>>,
    branch_rates: Option<Box<dyn BranchRateModel>>,
    config: LikelihoodConfig,
}

impl TreeLikelihoodBuilder {
    pub fn new(tree: Tree, patterns: Patterns) -> Self {
        TreeLikelihoodBuilder {
            tree,
            patterns,
            models: Vec::new(),
            branch_model: None,
            site_model: None,
            branch_rates: None,
            config: LikelihoodConfig::default(),
        }
    }

    pub fn substitution_model(mut self, model: impl SubstitutionModel + 'static) -> Self {
        self.models.push(Box::new(model));
        self
    }

    pub fn substitution_models(mut self, models: Vec<Box<dyn SubstitutionModel>>) -> Self {
        self.models.extend(models);
        self
    }

    pub fn branch_model(mut self, branch_model: impl BranchModel + 'static) -> Self {
        self.branch_model = Some(Box::new(branch_model));
        self
    }

    pub fn site_model(mut self, site_model: impl SiteRateModel + 'static) -> Self {
        self.site_model = Some(Box::new(site_model));
        self
    }

    pub fn branch_rates(mut self, branch_rates: impl BranchRateModel + 'static) -> Self {
        self.branch_rates = Some(Box::new(branch_rates));
        self
    }

    pub fn config(mut self, config: LikelihoodConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<TreeLikelihood<CpuBackend>> {
        self.build_with_backend()
    }

    pub fn build_with_backend<B: ComputeBackend>(self) -> Result<TreeLikelihood<B>> {
        let TreeLikelihoodBuilder {
            tree,
            patterns,
            models,
            branch_model,
            site_model,
            branch_rates,
            config,
        } = self;
        let tip_taxa = match_taxa(&tree, &patterns)?;
        check_binary(&tree)?;
        if let Some(model) = models
            .iter()
            .find(|m| m.state_count() != patterns.state_count())
        {
            bail!(ConfigurationError {
                message: format!(
                    "Substitution model {} has {} states but the data has {}.",
                    model.name(),
                    model.state_count(),
                    patterns.state_count()
                )
            });
        }

        let node_count = tree.node_count();
        let tip_count = tree.external_node_count();
        let internal_count = node_count - tip_count;
        let site_model = site_model.unwrap_or_else(|| Box::new(DiscreteRates::homogeneous()));
        let branch_rates = branch_rates.unwrap_or_else(|| Box::new(StrictClock::default()));
        branch_rates.check(node_count)?;
        let branch_model = branch_model.unwrap_or_else(|| Box::new(HomogeneousBranchModel));
        let delegate = SubstitutionModelDelegate::new(
            models,
            branch_model,
            node_count,
            config.extra_buffer_count,
        )?;

        let partial_helper = DoubleBufferIndex::new(node_count, tip_count);
        let scale_helper = DoubleBufferIndex::new(internal_count + 1, 0);
        let shape = BackendShape {
            tip_count,
            partials_buffer_count: partial_helper.buffer_count(),
            compact_buffer_count: if config.use_ambiguities { 0 } else { tip_count },
            state_count: patterns.state_count(),
            pattern_count: patterns.pattern_count(),
            eigen_buffer_count: delegate.eigen_buffer_count(),
            matrix_buffer_count: delegate.matrix_buffer_count(),
            category_count: site_model.category_count(),
            scale_buffer_count: scale_helper.buffer_count(),
        };
        let mut backend = B::create(shape, &config.resource)?;
        backend.set_pattern_weights(patterns.weights())?;
        backend.set_category_weights(&site_model.category_proportions())?;

        let rescaling = RescalingController::new(&config, backend.supports_auto_scaling());
        info!("Using tree likelihood on {}", backend.details());
        info!(
            "  {} taxa, {} unique site patterns from {} sites, {} rate categories",
            tip_count,
            patterns.pattern_count(),
            patterns.site_count(),
            site_model.category_count()
        );
        if config.use_ambiguities {
            info!("  Using ambiguities in tips (tip partials)");
        } else {
            info!("  Ignoring ambiguities in tips (compact states)");
        }
        info!("  Using {}", rescaling);

        let mut dirty = DirtyTracker::new(node_count, patterns.pattern_count());
        dirty.mark_all();
        Ok(TreeLikelihood {
            planner: OperationPlanner::new(tip_count),
            scale_buffer_indices: scale_helper.indices()[..internal_count].to_vec(),
            pending_tips: (0..tip_count).collect(),
            tree,
            patterns,
            tip_taxa,
            site_model,
            branch_rates,
            delegate,
            backend,
            config,
            partial_helper,
            scale_helper,
            dirty,
            rescaling,
            update_substitution_model: true,
            update_site_model: true,
            log_likelihood: None,
            site_log_likelihoods: None,
            evaluation_id: 0,
            evaluation_count: 0,
            last_plan: TraversalPlan::default(),
            last_operations: Vec::new(),
            stored: None,
        })
    }
}

/// Index of the data row for every tip of the tree.
fn match_taxa(tree: &Tree, patterns: &Patterns) -> Result<Vec<usize>> {
    if tree.external_node_count() != patterns.taxon_count() {
        bail!(ConfigurationError {
            message: format!(
                "Tree has {} tips but there are sequences for {} taxa.",
                tree.external_node_count(),
                patterns.taxon_count()
            )
        });
    }
    (0..tree.external_node_count())
        .map(|tip| {
            let id = tree.taxon_id(tip).unwrap_or_default();
            match patterns.taxon_index(id) {
                Some(taxon) => Ok(taxon),
                None => bail!(ConfigurationError {
                    message: format!("Taxon {} not found in the sequence data.", id)
                }),
            }
        })
        .collect()
}

fn check_binary(tree: &Tree) -> Result<()> {
    let tip_count = tree.external_node_count();
    if let Some(node) =
        (tip_count..tree.node_count()).find(|&node| tree.child_count(node) != 2)
    {
        bail!(ConfigurationError {
            message: format!(
                "Node {} has {} children, only binary trees are supported.",
                node,
                tree.child_count(node)
            )
        });
    }
    Ok(())
}

impl TreeLikelihood<CpuBackend> {
    pub fn new(
        tree: Tree,
        patterns: Patterns,
        model: impl SubstitutionModel + 'static,
        config: LikelihoodConfig,
    ) -> Result<Self> {
        TreeLikelihoodBuilder::new(tree, patterns)
            .substitution_model(model)
            .config(config)
            .build()
    }
}

impl<B: ComputeBackend> TreeLikelihood<B> {
    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn patterns(&self) -> &Patterns {
        &self.patterns
    }

    pub fn site_model(&self) -> &dyn SiteRateModel {
        self.site_model.as_ref()
    }

    pub fn branch_rates(&self) -> &dyn BranchRateModel {
        self.branch_rates.as_ref()
    }

    pub fn substitution_model(&self, i: usize) -> Option<&dyn SubstitutionModel> {
        self.delegate.model(i)
    }

    pub fn substitution_delegate(&self) -> &SubstitutionModelDelegate {
        &self.delegate
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    #[cfg(test)]
    pub(crate) fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn config(&self) -> &LikelihoodConfig {
        &self.config
    }

    pub fn rescaling(&self) -> &RescalingController {
        &self.rescaling
    }

    pub fn dirty(&self) -> &DirtyTracker {
        &self.dirty
    }

    pub fn partial_buffer_count(&self) -> usize {
        self.partial_helper.buffer_count()
    }

    pub fn partial_buffer_index(&self, node: usize) -> usize {
        self.partial_helper.offset_index(node)
    }

    pub fn scale_buffer_indices(&self) -> &[usize] {
        &self.scale_buffer_indices
    }

    /// Data row of a tip.
    pub fn tip_taxon(&self, tip: usize) -> usize {
        self.tip_taxa[tip]
    }

    pub fn is_likelihood_known(&self) -> bool {
        self.log_likelihood.is_some()
    }

    /// Identifies the buffer contents behind the cached likelihood. Changes with every
    /// recomputation and returns to the stored value on restore.
    pub fn evaluation_id(&self) -> u64 {
        self.evaluation_id
    }

    /// Partial updates dispatched by the last evaluation, including a rescaling retry.
    pub fn last_operations(&self) -> &[PartialsOperation] {
        &self.last_operations
    }

    /// Branches whose transition matrices the last evaluation recomputed, with their lengths.
    pub fn last_branch_updates(&self) -> &[(usize, f64)] {
        &self.last_plan.branch_updates
    }

    fn check_node(&self, node: usize, tips_only: bool) -> Result<()> {
        let limit = if tips_only {
            self.tree.external_node_count()
        } else {
            self.tree.node_count()
        };
        if node >= limit {
            bail!(ConfigurationError {
                message: format!(
                    "Node {} is out of range, the tree has {} {}.",
                    node,
                    limit,
                    if tips_only { "tips" } else { "nodes" }
                )
            });
        }
        Ok(())
    }

    fn check_tree_event(&self, event: TreeEvent) -> Result<()> {
        match event {
            TreeEvent::NodeChanged(node) | TreeEvent::SubtreeChanged(node) => {
                self.check_node(node, false)
            }
            TreeEvent::TreeChanged => Ok(()),
        }
    }

    fn check_model_event(&self, event: ModelEvent) -> Result<()> {
        match event {
            ModelEvent::BranchRates(Some(node)) => self.check_node(node, false),
            ModelEvent::TipStates(tip) => self.check_node(tip, true),
            ModelEvent::SubstitutionModel(Some(model)) if model >= self.delegate.models().len() => {
                bail!(ConfigurationError {
                    message: format!(
                        "No substitution model {}, there are {}.",
                        model,
                        self.delegate.models().len()
                    )
                })
            }
            _ => Ok(()),
        }
    }

    /// Marks the nodes `event` names as dirty. Fails for a node outside the tree.
    pub fn handle_tree_event(&mut self, event: TreeEvent) -> Result<()> {
        self.check_tree_event(event)?;
        debug!("Tree event {:?}", event);
        match event {
            TreeEvent::NodeChanged(node) => self.dirty.mark_node_and_children(node, &self.tree),
            TreeEvent::SubtreeChanged(node) => self.dirty.mark_subtree(node, &self.tree),
            TreeEvent::TreeChanged => self.dirty.mark_all(),
        }
        self.log_likelihood = None;
        Ok(())
    }

    pub fn handle_model_event(&mut self, event: ModelEvent) -> Result<()> {
        self.check_model_event(event)?;
        debug!("Model event {:?}", event);
        match event {
            ModelEvent::BranchRates(Some(node)) => self.dirty.mark_node(node),
            ModelEvent::BranchRates(None) => self.dirty.mark_all(),
            ModelEvent::SubstitutionModel(_) => {
                self.update_substitution_model = true;
                self.dirty.mark_all();
            }
            ModelEvent::SiteModel => {
                self.update_site_model = true;
                self.dirty.mark_all();
            }
            ModelEvent::TipStates(node) => self.dirty.mark_node(node),
        }
        self.log_likelihood = None;
        Ok(())
    }

    /// Applies `change` to the tree and marks the nodes `event` names as dirty.
    pub fn update_tree<F>(&mut self, event: TreeEvent, change: F) -> Result<()>
    where
        F: FnOnce(&mut Tree) -> Result<()>,
    {
        self.check_tree_event(event)?;
        change(&mut self.tree)?;
        self.handle_tree_event(event)
    }

    /// Changes the rate of one branch, or of all branches when `node` is `None`.
    pub fn update_branch_rates<F>(&mut self, node: Option<usize>, change: F) -> Result<()>
    where
        F: FnOnce(&mut dyn BranchRateModel) -> Result<()>,
    {
        let event = ModelEvent::BranchRates(node);
        self.check_model_event(event)?;
        change(self.branch_rates.as_mut())?;
        self.handle_model_event(event)
    }

    pub fn update_substitution_model<F>(&mut self, model: usize, change: F) -> Result<()>
    where
        F: FnOnce(&mut dyn SubstitutionModel) -> Result<()>,
    {
        change(self.delegate.model_mut(model)?.as_mut())?;
        self.handle_model_event(ModelEvent::SubstitutionModel(Some(model)))
    }

    pub fn update_site_model<F>(&mut self, change: F) -> Result<()>
    where
        F: FnOnce(&mut dyn SiteRateModel) -> Result<()>,
    {
        change(self.site_model.as_mut())?;
        if self.site_model.category_count() != self.backend.shape().category_count {
            bail!(ConfigurationError {
                message: format!(
                    "Site model now has {} rate categories, the likelihood was set up for {}.",
                    self.site_model.category_count(),
                    self.backend.shape().category_count
                )
            });
        }
        self.handle_model_event(ModelEvent::SiteModel)
    }

    /// Replaces the observed states of a tip, one code per pattern.
    pub fn set_tip_states(&mut self, tip: usize, codes: &[usize]) -> Result<()> {
        self.check_node(tip, true)?;
        let taxon = self.tip_taxa[tip];
        let previous = self.patterns.states(taxon).to_vec();
        if let Some(stored) = self.stored.as_mut() {
            if stored.patterns.is_none() {
                stored.patterns = Some(self.patterns.clone());
            }
        }
        self.patterns.set_states(taxon, codes)?;
        for (p, (old, new)) in previous.iter().zip(codes).enumerate() {
            if old != new {
                self.dirty.mark_pattern(p);
            }
        }
        if !self.pending_tips.contains(&tip) {
            self.pending_tips.push(tip);
        }
        self.handle_model_event(ModelEvent::TipStates(tip))
    }

    /// Forces a full recomputation on the next evaluation.
    pub fn make_dirty(&mut self) {
        self.dirty.mark_all();
        self.update_substitution_model = true;
        self.update_site_model = true;
        self.log_likelihood = None;
    }

    pub fn log_likelihood(&mut self) -> Result<f64> {
        if let Some(log_likelihood) = self.log_likelihood {
            return Ok(log_likelihood);
        }
        let log_likelihood = self.calculate_log_likelihood()?;
        self.log_likelihood = Some(log_likelihood);
        Ok(log_likelihood)
    }

    /// Per-pattern log-likelihoods behind the current log-likelihood, unweighted.
    pub fn site_log_likelihoods(&mut self) -> Result<Vec<f64>> {
        self.log_likelihood()?;
        match &self.site_log_likelihoods {
            Some(site_log_likelihoods) => Ok(site_log_likelihoods.clone()),
            None => bail!("Site log-likelihoods are not available."),
        }
    }

    /// Live partials of a node laid out by category, pattern and state. Internal partials
    /// are as stored by the backend, i.e. possibly rescaled.
    pub fn partials(&mut self, node: usize) -> Result<Vec<f64>> {
        self.log_likelihood()?;
        self.backend
            .get_partials(self.partial_helper.offset_index(node), None)
    }

    /// Live transition matrix of the branch above `node` for a rate category.
    pub fn transition_matrix(&mut self, node: usize, category: usize) -> Result<SubstMatrix> {
        self.log_likelihood()?;
        self.backend
            .get_transition_matrix(self.delegate.matrix_index(node), category)
    }

    fn upload_pending_tips(&mut self) -> Result<()> {
        for tip in std::mem::take(&mut self.pending_tips) {
            let taxon = self.tip_taxa[tip];
            if self.config.use_ambiguities {
                self.backend
                    .set_tip_partials(tip, &self.patterns.tip_partials(taxon))?;
            } else {
                self.backend
                    .set_tip_states(tip, self.patterns.states(taxon))?;
            }
        }
        Ok(())
    }

    fn calculate_log_likelihood(&mut self) -> Result<f64> {
        if self.rescaling.begin_evaluation() {
            self.dirty.mark_all();
        }
        let plan = plan_traversal(&self.tree, self.branch_rates.as_ref(), &self.dirty)?;
        let category_rates = if self.update_site_model {
            match self.site_model.category_rates() {
                Some(rates) => Some(rates),
                None => {
                    debug!("Category rates unavailable, log-likelihood is -inf");
                    return Ok(f64::NEG_INFINITY);
                }
            }
        } else {
            None
        };

        self.upload_pending_tips()?;
        self.partial_helper.begin_round();
        self.scale_helper.begin_round();
        self.delegate.begin_round();
        for &(branch, _) in &plan.branch_updates {
            self.delegate.flip_matrix_buffer(branch);
        }
        let mut operations = self.emit_operations(&plan);

        if self.update_substitution_model {
            self.delegate
                .update_substitution_models(&mut self.backend, true)?;
        }
        if let Some(rates) = category_rates {
            self.backend.set_category_rates(&rates)?;
            self.backend
                .set_category_weights(&self.site_model.category_proportions())?;
        }
        self.update_substitution_model = false;
        self.update_site_model = false;
        self.delegate
            .update_transition_matrices(&mut self.backend, &plan.branch_updates)?;

        let mut first_attempt = true;
        let mut dispatched = Vec::with_capacity(operations.len());
        let log_likelihood = loop {
            self.backend.update_partials(&operations)?;
            dispatched.append(&mut operations);
            let cumulative_scale = self.accumulate_scale_factors()?;
            let root = self.partial_helper.offset_index(self.tree.root());
            let log_likelihood = self
                .backend
                .calculate_root_log_likelihoods(root, cumulative_scale)?;
            if log_likelihood.is_finite() {
                break log_likelihood;
            }
            if !self.rescaling.underflow(first_attempt) {
                break f64::NEG_INFINITY;
            }
            first_attempt = false;
            // matrices are still valid, only partials and scale factors are redone
            self.dirty.mark_all();
            let retry = plan_traversal(&self.tree, self.branch_rates.as_ref(), &self.dirty)?;
            operations = self.emit_operations(&retry);
        };

        self.evaluation_count += 1;
        self.evaluation_id = self.evaluation_count;
        self.site_log_likelihoods = Some(self.backend.site_log_likelihoods()?);
        self.last_operations = dispatched;
        self.last_plan = plan;
        if log_likelihood.is_finite() {
            self.dirty.clear();
        }
        Ok(log_likelihood)
    }

    fn emit_operations(&mut self, plan: &TraversalPlan) -> Vec<PartialsOperation> {
        let delegate = &self.delegate;
        self.planner.emit_operations(
            plan,
            &self.tree,
            &mut self.partial_helper,
            &mut self.scale_helper,
            &mut self.scale_buffer_indices,
            self.rescaling.scaling(),
            |node| delegate.matrix_index(node),
        )
    }

    fn accumulate_scale_factors(&mut self) -> Result<Option<usize>> {
        let scaling = self.rescaling.scaling();
        let cumulative = self.scale_buffer_indices.len();
        if scaling.use_scale_factors {
            if scaling.recompute {
                let index = self
                    .planner
                    .flip_cumulative_scale(&mut self.scale_helper, cumulative);
                self.backend.reset_scale_factors(index)?;
                self.backend
                    .accumulate_scale_factors(&self.scale_buffer_indices, Some(index))?;
                Ok(Some(index))
            } else {
                Ok(Some(self.scale_helper.offset_index(cumulative)))
            }
        } else {
            if scaling.auto {
                self.backend
                    .accumulate_scale_factors(&self.scale_buffer_indices, None)?;
            }
            Ok(None)
        }
    }

    /// Snapshots the buffer indices, the models and the cached likelihood before a proposal.
    pub fn store_state(&mut self) {
        self.partial_helper.store_state();
        self.scale_helper.store_state();
        self.delegate.store_state();
        self.dirty.store_state();
        self.stored = Some(StoredState {
            tree: self.tree.clone(),
            models: self.delegate.models().to_vec(),
            site_model: self.site_model.clone(),
            branch_rates: self.branch_rates.clone(),
            scale_buffer_indices: self.scale_buffer_indices.clone(),
            log_likelihood: self.log_likelihood,
            site_log_likelihoods: self.site_log_likelihoods.clone(),
            evaluation_id: self.evaluation_id,
            update_substitution_model: self.update_substitution_model,
            update_site_model: self.update_site_model,
            patterns: None,
        });
    }

    /// Rolls back to the last stored state. Fails if nothing is stored.
    pub fn restore_state(&mut self) -> Result<()> {
        let Some(stored) = self.stored.take() else {
            bail!(StateLifecycleError {
                message: String::from("Likelihood restored without a stored state.")
            });
        };
        self.partial_helper.restore_state()?;
        self.scale_helper.restore_state()?;
        self.delegate.restore_state()?;
        self.dirty.restore_state();
        self.tree = stored.tree;
        self.delegate.set_models(stored.models);
        self.site_model = stored.site_model;
        self.branch_rates = stored.branch_rates;
        self.scale_buffer_indices = stored.scale_buffer_indices;
        self.log_likelihood = stored.log_likelihood;
        self.site_log_likelihoods = stored.site_log_likelihoods;
        self.evaluation_id = stored.evaluation_id;
        self.update_substitution_model = stored.update_substitution_model;
        // category rates are not double buffered by the backend
        self.update_site_model = true;
        if let Some(patterns) = stored.patterns {
            self.patterns = patterns;
            self.pending_tips = (0..self.tree.external_node_count()).collect();
        }
        Ok(())
    }

    pub fn accept_state(&mut self) {
        self.partial_helper.accept_state();
        self.scale_helper.accept_state();
        self.delegate.accept_state();
        self.dirty.accept_state();
        self.stored = None;
    }
}
