use std::fmt::Debug;

use anyhow::bail;
use dyn_clone::DynClone;

use crate::config::ConfigurationError;
use crate::tree::TreeTopology;
use crate::Result;

/// Rate of evolution along the branch above a node.
pub trait BranchRateModel: Debug + DynClone + Send {
    fn branch_rate(&self, tree: &dyn TreeTopology, node: usize) -> f64;
    /// `None` sets the rate of every branch.
    fn set_branch_rate(&mut self, node: Option<usize>, rate: f64) -> Result<()>;
    /// Fails unless every node of a tree with `node_count` nodes has a rate.
    fn check(&self, _node_count: usize) -> Result<()> {
        Ok(())
    }
}

dyn_clone::clone_trait_object!(BranchRateModel);

#[derive(Debug, Clone, PartialEq)]
pub struct StrictClock {
    rate: f64,
}

impl StrictClock {
    pub fn new(rate: f64) -> Self {
        StrictClock { rate }
    }
}

impl Default for StrictClock {
    fn default() -> Self {
        StrictClock::new(1.0)
    }
}

impl BranchRateModel for StrictClock {
    fn branch_rate(&self, _tree: &dyn TreeTopology, _node: usize) -> f64 {
        self.rate
    }

    fn set_branch_rate(&mut self, node: Option<usize>, rate: f64) -> Result<()> {
        if let Some(node) = node {
            bail!("A strict clock has no rate for node {} alone.", node);
        }
        self.rate = rate;
        Ok(())
    }
}

/// Independent rate for every branch.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalRates {
    rates: Vec<f64>,
}

impl LocalRates {
    pub fn new(rates: Vec<f64>) -> Self {
        LocalRates { rates }
    }

    pub fn uniform(node_count: usize, rate: f64) -> Self {
        LocalRates {
            rates: vec![rate; node_count],
        }
    }
}

impl BranchRateModel for LocalRates {
    fn branch_rate(&self, _tree: &dyn TreeTopology, node: usize) -> f64 {
        self.rates[node]
    }

    fn set_branch_rate(&mut self, node: Option<usize>, rate: f64) -> Result<()> {
        match node {
            Some(node) if node < self.rates.len() => self.rates[node] = rate,
            Some(node) => bail!("No branch rate for node {}.", node),
            None => self.rates.fill(rate),
        }
        Ok(())
    }

    fn check(&self, node_count: usize) -> Result<()> {
        if self.rates.len() < node_count {
            bail!(ConfigurationError {
                message: format!(
                    "{} branch rates given for a tree with {} nodes.",
                    self.rates.len(),
                    node_count
                )
            });
        }
        Ok(())
    }
}
