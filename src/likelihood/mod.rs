pub mod buffer_index;
pub mod dirty;
pub mod operations;
pub mod rescaling;
pub mod substitution_delegate;
pub mod tree_likelihood;

pub use buffer_index::{DoubleBufferIndex, StateLifecycleError};
pub use dirty::DirtyTracker;
pub use operations::{plan_traversal, InvalidBranchError, TraversalPlan};
pub use rescaling::{RescalingController, Scaling};
pub use substitution_delegate::SubstitutionModelDelegate;
pub use tree_likelihood::{TreeLikelihood, TreeLikelihoodBuilder};

/// Changes to the tree, named by the part of it they invalidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeEvent {
    /// Height of a node changed, affecting its own branch and the branches to its children.
    NodeChanged(usize),
    SubtreeChanged(usize),
    TreeChanged,
}

/// Changes to the models the likelihood depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelEvent {
    /// Rate of one branch, or of every branch when `None`.
    BranchRates(Option<usize>),
    SubstitutionModel(Option<usize>),
    SiteModel,
    TipStates(usize),
}
