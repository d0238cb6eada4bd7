use std::error::Error;
use std::fmt;

use anyhow::bail;

use crate::backend::PartialsOperation;
use crate::branch_rates::BranchRateModel;
use crate::config::ConfigurationError;
use crate::likelihood::buffer_index::DoubleBufferIndex;
use crate::likelihood::dirty::DirtyTracker;
use crate::likelihood::rescaling::Scaling;
use crate::tree::TreeTopology;
use crate::Result;

/// A node sits above its parent, so the branch between them would have negative length.
pub struct InvalidBranchError {
    pub node: usize,
    pub parent: usize,
    pub branch_length: f64,
    pub parent_height: f64,
    pub node_height: f64,
}

impl fmt::Debug for InvalidBranchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for InvalidBranchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Negative branch length {} between node {} (height {}) and its parent {} (height {}).",
            self.branch_length, self.node, self.node_height, self.parent, self.parent_height
        )
    }
}

impl Error for InvalidBranchError {}

/// Outcome of the validating pass over the tree: which branches need new transition
/// matrices and which internal nodes need new partials, children before parents.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraversalPlan {
    pub branch_updates: Vec<(usize, f64)>,
    pub updated_nodes: Vec<usize>,
}

/// Walks the tree in post-order and collects the work implied by the dirty flags.
///
/// Nothing is flipped here: a tree with an inverted height or a non-binary node is rejected
/// before any buffer index changes.
pub fn plan_traversal(
    tree: &dyn TreeTopology,
    branch_rates: &dyn BranchRateModel,
    dirty: &DirtyTracker,
) -> Result<TraversalPlan> {
    let mut plan = TraversalPlan::default();
    let mut updated = vec![false; tree.node_count()];
    let mut stack = vec![(tree.root(), false)];
    while let Some((node, children_done)) = stack.pop() {
        if !children_done && !tree.is_external(node) {
            if tree.child_count(node) != 2 {
                bail!(ConfigurationError {
                    message: format!(
                        "Node {} has {} children, only binary trees are supported.",
                        node,
                        tree.child_count(node)
                    )
                });
            }
            stack.push((node, true));
            stack.push((tree.child(node, 1), false));
            stack.push((tree.child(node, 0), false));
            continue;
        }

        if let Some(parent) = tree.parent(node) {
            if dirty.is_dirty(node) {
                let parent_height = tree.node_height(parent);
                let node_height = tree.node_height(node);
                let branch_time =
                    branch_rates.branch_rate(tree, node) * (parent_height - node_height);
                if branch_time.is_nan() || branch_time < 0.0 {
                    bail!(InvalidBranchError {
                        node,
                        parent,
                        branch_length: branch_time,
                        parent_height,
                        node_height,
                    });
                }
                plan.branch_updates.push((node, branch_time));
                updated[node] = true;
            }
        }

        if !tree.is_external(node) && (updated[tree.child(node, 0)] || updated[tree.child(node, 1)])
        {
            plan.updated_nodes.push(node);
            updated[node] = true;
        }
    }
    Ok(plan)
}

/// Turns a [`TraversalPlan`] into backend operations, flipping buffer slots on the way.
///
/// Slots go through [`DoubleBufferIndex::flip_once`], so a rescaling retry or a second
/// evaluation of the same proposal overwrites the buffers written before and leaves the
/// stored ones alone.
#[derive(Debug, Clone)]
pub(crate) struct OperationPlanner {
    tip_count: usize,
}

impl OperationPlanner {
    pub(crate) fn new(tip_count: usize) -> Self {
        OperationPlanner { tip_count }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn emit_operations(
        &self,
        plan: &TraversalPlan,
        tree: &dyn TreeTopology,
        partials: &mut DoubleBufferIndex,
        scales: &mut DoubleBufferIndex,
        scale_buffer_indices: &mut [usize],
        scaling: Scaling,
        matrix_index: impl Fn(usize) -> usize,
    ) -> Vec<PartialsOperation> {
        let mut operations = Vec::with_capacity(plan.updated_nodes.len());
        for &node in &plan.updated_nodes {
            partials.flip_once(node);
            let n = node - self.tip_count;
            let (scale_write, scale_read) = if scaling.use_scale_factors {
                if scaling.recompute {
                    scales.flip_once(n);
                    scale_buffer_indices[n] = scales.offset_index(n);
                    (Some(scale_buffer_indices[n]), None)
                } else {
                    (None, Some(scale_buffer_indices[n]))
                }
            } else {
                if scaling.auto {
                    scale_buffer_indices[n] = partials.offset_index(node);
                }
                (None, None)
            };
            let (child1, child2) = (tree.child(node, 0), tree.child(node, 1));
            operations.push(PartialsOperation {
                destination: partials.offset_index(node),
                scale_write,
                scale_read,
                child1: partials.offset_index(child1),
                matrix1: matrix_index(child1),
                child2: partials.offset_index(child2),
                matrix2: matrix_index(child2),
            });
        }
        operations
    }

    /// Flips the cumulative scale slot unless this round already did, returns its offset.
    pub(crate) fn flip_cumulative_scale(
        &self,
        scales: &mut DoubleBufferIndex,
        cumulative: usize,
    ) -> usize {
        scales.flip_once(cumulative);
        scales.offset_index(cumulative)
    }
}
