use anyhow::bail;
use log::{debug, info};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::backend::{ComputeBackend, CpuBackend};
use crate::config::ConfigurationError;
use crate::likelihood::TreeLikelihood;
use crate::tree::TreeTopology;
use crate::Result;

pub mod markov_jumps;
pub use markov_jumps::*;

#[derive(Debug, Clone)]
struct Draw {
    states: Vec<Vec<usize>>,
    joint_log_density: f64,
    expected_jumps: Vec<Vec<Vec<f64>>>,
    drawn_for: Option<u64>,
}

/// Samples discrete ancestral states from a tree likelihood.
///
/// States are drawn in pre-order: the root from the root frequencies weighted by its partials,
/// every other node from the transition probabilities out of its parent's sampled state
/// weighted by its own partials. Tips keep their observed states, ambiguous observations
/// are resampled among the compatible states.
///
/// A draw belongs to the evaluation that produced the partials. Whenever the likelihood is
/// recomputed the states are drawn again on the next request.
#[derive(Debug)]
pub struct AncestralStateReconstructor<B: ComputeBackend = CpuBackend> {
    likelihood: TreeLikelihood<B>,
    rng: StdRng,
    use_map: bool,
    jumps: Vec<MarkovJumps>,
    draw: Draw,
    stored: Option<Draw>,
}

impl<B: ComputeBackend> AncestralStateReconstructor<B> {
    pub fn new(likelihood: TreeLikelihood<B>, seed: u64) -> Result<Self> {
        let categories = likelihood.site_model().category_count();
        if categories > 1 {
            bail!(ConfigurationError {
                message: format!(
                    "Ancestral reconstruction is not implemented for multiple rate categories, \
                     the site model has {}.",
                    categories
                )
            });
        }
        Ok(AncestralStateReconstructor {
            likelihood,
            rng: StdRng::seed_from_u64(seed),
            use_map: false,
            jumps: Vec::new(),
            draw: Draw {
                states: Vec::new(),
                joint_log_density: 0.0,
                expected_jumps: Vec::new(),
                drawn_for: None,
            },
            stored: None,
        })
    }

    /// Picks the most probable state at every node instead of sampling.
    pub fn with_map(mut self, use_map: bool) -> Self {
        self.use_map = use_map;
        self
    }

    pub fn with_markov_jumps(mut self, jumps: MarkovJumps) -> Result<Self> {
        let state_count = self.likelihood.patterns().state_count();
        if jumps.state_count() != state_count {
            bail!(ConfigurationError {
                message: format!(
                    "Jump register {} has {} states, the data has {}.",
                    jumps.name(),
                    jumps.state_count(),
                    state_count
                )
            });
        }
        if self.likelihood.substitution_model(jumps.model()).is_none() {
            bail!(ConfigurationError {
                message: format!(
                    "Jump register {} refers to missing substitution model {}.",
                    jumps.name(),
                    jumps.model()
                )
            });
        }
        self.jumps.push(jumps);
        self.draw.drawn_for = None;
        Ok(self)
    }

    pub fn likelihood(&self) -> &TreeLikelihood<B> {
        &self.likelihood
    }

    pub fn likelihood_mut(&mut self) -> &mut TreeLikelihood<B> {
        &mut self.likelihood
    }

    pub fn into_likelihood(self) -> TreeLikelihood<B> {
        self.likelihood
    }

    pub fn log_likelihood(&mut self) -> Result<f64> {
        self.likelihood.log_likelihood()
    }

    pub fn markov_jumps(&self) -> &[MarkovJumps] {
        &self.jumps
    }

    /// True when the current states were drawn from the current partials.
    pub fn states_are_drawn(&self) -> bool {
        self.likelihood.is_likelihood_known()
            && self.draw.drawn_for == Some(self.likelihood.evaluation_id())
    }

    /// Sampled state of every pattern at `node`.
    pub fn states(&mut self, node: usize) -> Result<&[usize]> {
        self.ensure_drawn()?;
        match self.draw.states.get(node) {
            Some(states) => Ok(states.as_slice()),
            None => bail!("No node {} in the tree.", node),
        }
    }

    /// Sampled states at `node` expanded to the sites of the alignment, as symbols.
    pub fn site_states(&mut self, node: usize) -> Result<String> {
        self.states(node)?;
        let patterns = self.likelihood.patterns();
        let alphabet = patterns.alphabet();
        let states = &self.draw.states[node];
        Ok(patterns
            .site_patterns()
            .iter()
            .map(|&p| alphabet.symbol(states[p]) as char)
            .collect())
    }

    /// Log density of the sampled states at all nodes, root frequencies included.
    pub fn joint_log_density(&mut self) -> Result<f64> {
        self.ensure_drawn()?;
        Ok(self.draw.joint_log_density)
    }

    /// Per-pattern conditional expectations of a register on the branch above `node`.
    pub fn expected_jumps(&mut self, register: usize, node: usize) -> Result<&[f64]> {
        if register >= self.jumps.len() {
            bail!("No jump register {}, there are {}.", register, self.jumps.len());
        }
        self.ensure_drawn()?;
        match self.draw.expected_jumps[register].get(node) {
            Some(jumps) => Ok(jumps.as_slice()),
            None => bail!("No node {} in the tree.", node),
        }
    }

    /// Per-pattern conditional expectations of a register summed over the whole tree.
    pub fn total_expected_jumps(&mut self, register: usize) -> Result<Vec<f64>> {
        self.expected_jumps(register, 0)?;
        let pattern_count = self.likelihood.patterns().pattern_count();
        let mut total = vec![0.0; pattern_count];
        for branch in &self.draw.expected_jumps[register] {
            for (t, j) in total.iter_mut().zip(branch) {
                *t += j;
            }
        }
        Ok(total)
    }

    /// Draws new states even if the current ones are still valid.
    pub fn redraw(&mut self) -> Result<()> {
        let log_likelihood = self.likelihood.log_likelihood()?;
        if !log_likelihood.is_finite() {
            bail!("Cannot sample ancestral states, the likelihood is zero.");
        }
        self.draw_states()?;
        self.draw_jumps()?;
        self.draw.drawn_for = Some(self.likelihood.evaluation_id());
        debug!(
            "Drew ancestral states for evaluation {}, joint log density {}",
            self.likelihood.evaluation_id(),
            self.draw.joint_log_density
        );
        Ok(())
    }

    fn ensure_drawn(&mut self) -> Result<()> {
        self.likelihood.log_likelihood()?;
        if !self.states_are_drawn() {
            self.redraw()?;
        }
        Ok(())
    }

    fn draw_states(&mut self) -> Result<()> {
        let tree = self.likelihood.tree();
        let node_count = tree.node_count();
        let order = preorder(tree);
        let parents: Vec<Option<usize>> = (0..node_count).map(|n| tree.parent(n)).collect();
        let tips = tree.external_node_count();

        let patterns = self.likelihood.patterns();
        let alphabet = patterns.alphabet();
        let state_count = patterns.state_count();
        let pattern_count = patterns.pattern_count();
        let tip_codes: Vec<Vec<usize>> = (0..tips)
            .map(|tip| patterns.states(self.likelihood.tip_taxon(tip)).to_vec())
            .collect();
        let freqs = self
            .likelihood
            .substitution_delegate()
            .root_frequencies()
            .clone();

        let mut states = vec![vec![0; pattern_count]; node_count];
        let mut joint_log_density = 0.0;
        let mut weights = vec![0.0; state_count];
        for &node in &order {
            let partials = if node < tips {
                None
            } else {
                Some(self.likelihood.partials(node)?)
            };
            let Some(parent) = parents[node] else {
                let Some(partials) = partials else {
                    // a single tip is its own root
                    states[node].clone_from(&tip_codes[node]);
                    continue;
                };
                for p in 0..pattern_count {
                    for (s, w) in weights.iter_mut().enumerate() {
                        *w = freqs[s] * partials[p * state_count + s];
                    }
                    let state = draw_choice(&mut self.rng, self.use_map, &weights)?;
                    states[node][p] = state;
                    joint_log_density += freqs[state].ln();
                }
                continue;
            };

            let matrix = self.likelihood.transition_matrix(node, 0)?;
            for p in 0..pattern_count {
                let from = states[parent][p];
                let state = match &partials {
                    Some(partials) => {
                        for (s, w) in weights.iter_mut().enumerate() {
                            *w = matrix[(from, s)] * partials[p * state_count + s];
                        }
                        draw_choice(&mut self.rng, self.use_map, &weights)?
                    }
                    None if tip_codes[node][p] < state_count => tip_codes[node][p],
                    None => {
                        let compatible = alphabet.state_set(tip_codes[node][p]);
                        for (s, w) in weights.iter_mut().enumerate() {
                            *w = if compatible[s] { matrix[(from, s)] } else { 0.0 };
                        }
                        draw_choice(&mut self.rng, self.use_map, &weights)?
                    }
                };
                states[node][p] = state;
                joint_log_density += matrix[(from, state)].ln();
            }
        }
        self.draw.states = states;
        self.draw.joint_log_density = joint_log_density;
        Ok(())
    }

    fn draw_jumps(&mut self) -> Result<()> {
        let tree = self.likelihood.tree();
        let node_count = tree.node_count();
        let pattern_count = self.likelihood.patterns().pattern_count();
        let Some(rates) = self.likelihood.site_model().category_rates() else {
            bail!("Category rates are not available for the current site model.");
        };
        let delegate = self.likelihood.substitution_delegate();
        let mut expected_jumps = Vec::with_capacity(self.jumps.len());
        for jumps in &self.jumps {
            let mut per_node = vec![vec![0.0; pattern_count]; node_count];
            let Some(model) = delegate.model(jumps.model()) else {
                bail!("No substitution model {}.", jumps.model());
            };
            for (node, node_jumps) in per_node.iter_mut().enumerate() {
                let Some(parent) = tree.parent(node) else {
                    continue;
                };
                if delegate.branch_model().mapping(node).order[0] != jumps.model() {
                    continue;
                }
                let time = self.likelihood.branch_rates().branch_rate(tree, node)
                    * (tree.node_height(parent) - tree.node_height(node))
                    * rates[0];
                let expectations = jumps.conditional_expectations(model, time);
                for (p, value) in node_jumps.iter_mut().enumerate() {
                    *value = expectations[(self.draw.states[parent][p], self.draw.states[node][p])];
                }
            }
            expected_jumps.push(per_node);
        }
        self.draw.expected_jumps = expected_jumps;
        Ok(())
    }

    pub fn store_state(&mut self) {
        self.likelihood.store_state();
        self.stored = Some(self.draw.clone());
    }

    pub fn restore_state(&mut self) -> Result<()> {
        self.likelihood.restore_state()?;
        if let Some(draw) = self.stored.take() {
            self.draw = draw;
        }
        Ok(())
    }

    pub fn accept_state(&mut self) {
        self.likelihood.accept_state();
        self.stored = None;
    }

    /// Logs the sampled states of every node, one line per node.
    pub fn log_states(&mut self) -> Result<()> {
        for node in 0..self.likelihood.tree().node_count() {
            let states = self.site_states(node)?;
            let name = self
                .likelihood
                .tree()
                .taxon_id(node)
                .filter(|id| !id.is_empty())
                .map(String::from)
                .unwrap_or_else(|| format!("node {}", node));
            info!("{}: {}", name, states);
        }
        Ok(())
    }
}

fn preorder(tree: &dyn TreeTopology) -> Vec<usize> {
    let mut order = Vec::with_capacity(tree.node_count());
    let mut stack = vec![tree.root()];
    while let Some(node) = stack.pop() {
        order.push(node);
        for i in (0..tree.child_count(node)).rev() {
            stack.push(tree.child(node, i));
        }
    }
    order
}

fn draw_choice(rng: &mut StdRng, use_map: bool, weights: &[f64]) -> Result<usize> {
    if use_map {
        let mut choice = 0;
        for (i, &w) in weights.iter().enumerate().skip(1) {
            if w > weights[choice] {
                choice = i;
            }
        }
        return Ok(choice);
    }
    match WeightedIndex::new(weights) {
        Ok(dist) => Ok(dist.sample(rng)),
        Err(e) => bail!("Cannot draw a state from weights {:?}: {}", weights, e),
    }
}

#[cfg(test)]
mod tests;
