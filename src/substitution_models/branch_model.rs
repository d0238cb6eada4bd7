use std::fmt::Debug;

use anyhow::bail;
use dyn_clone::DynClone;

use crate::Result;

/// Which substitution models act along a branch, in order from the parent, and the share of
/// the branch each of them covers.
#[derive(Debug, Clone, PartialEq)]
pub struct BranchMapping {
    pub order: Vec<usize>,
    pub weights: Vec<f64>,
}

impl BranchMapping {
    pub fn single(model: usize) -> Self {
        BranchMapping {
            order: vec![model],
            weights: vec![1.0],
        }
    }
}

/// Assigns substitution models to branches. Branches covered by more than one model get their
/// transition matrix by convolving the matrices of the individual pieces.
pub trait BranchModel: Debug + DynClone + Send {
    fn mapping(&self, node: usize) -> BranchMapping;
    fn model_count(&self) -> usize;
    fn requires_convolution(&self) -> bool;
    fn root_frequency_model(&self) -> usize {
        0
    }
}

dyn_clone::clone_trait_object!(BranchModel);

/// Every branch evolves under the same model.
#[derive(Debug, Clone, Default)]
pub struct HomogeneousBranchModel;

impl BranchModel for HomogeneousBranchModel {
    fn mapping(&self, _node: usize) -> BranchMapping {
        BranchMapping::single(0)
    }

    fn model_count(&self) -> usize {
        1
    }

    fn requires_convolution(&self) -> bool {
        false
    }
}

/// Explicit per-branch assignment, branches without an entry use the default mapping.
#[derive(Debug, Clone)]
pub struct AssignedBranchModel {
    model_count: usize,
    default: BranchMapping,
    assignments: Vec<Option<BranchMapping>>,
}

impl AssignedBranchModel {
    pub fn new(model_count: usize, node_count: usize, default: BranchMapping) -> Result<Self> {
        Self::check(model_count, &default)?;
        Ok(AssignedBranchModel {
            model_count,
            default,
            assignments: vec![None; node_count],
        })
    }

    pub fn assign(&mut self, node: usize, mapping: BranchMapping) -> Result<()> {
        Self::check(self.model_count, &mapping)?;
        if node >= self.assignments.len() {
            bail!("Node {} is not part of the tree.", node);
        }
        self.assignments[node] = Some(mapping);
        Ok(())
    }

    fn check(model_count: usize, mapping: &BranchMapping) -> Result<()> {
        if mapping.order.is_empty() || mapping.order.len() != mapping.weights.len() {
            bail!("A branch mapping needs one weight per model.");
        }
        if let Some(&model) = mapping.order.iter().find(|&&m| m >= model_count) {
            bail!("Model {} is not one of the {} models.", model, model_count);
        }
        if mapping.weights.iter().any(|&w| w.is_nan() || w < 0.0)
            || mapping.weights.iter().sum::<f64>() <= 0.0
        {
            bail!("Branch mapping weights must be non-negative with a positive sum.");
        }
        Ok(())
    }
}

impl BranchModel for AssignedBranchModel {
    fn mapping(&self, node: usize) -> BranchMapping {
        self.assignments
            .get(node)
            .and_then(|m| m.clone())
            .unwrap_or_else(|| self.default.clone())
    }

    fn model_count(&self) -> usize {
        self.model_count
    }

    fn requires_convolution(&self) -> bool {
        self.default.order.len() > 1
            || self
                .assignments
                .iter()
                .flatten()
                .any(|m| m.order.len() > 1)
    }
}
