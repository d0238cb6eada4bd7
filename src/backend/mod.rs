use std::fmt::Display;

use crate::config::ResourceSelection;
use crate::substitution_models::{EigenDecomposition, SubstMatrix};
use crate::Result;

mod cpu;
pub use cpu::CpuBackend;

#[cfg(test)]
pub(crate) mod counting;

/// Buffer layout fixed when a backend instance is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendShape {
    pub tip_count: usize,
    pub partials_buffer_count: usize,
    pub compact_buffer_count: usize,
    pub state_count: usize,
    pub pattern_count: usize,
    pub eigen_buffer_count: usize,
    pub matrix_buffer_count: usize,
    pub category_count: usize,
    pub scale_buffer_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceDetails {
    pub resource_number: usize,
    pub resource_name: String,
    pub implementation_name: String,
    pub auto_scaling: bool,
}

impl Display for InstanceDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "resource {}: {} ({})",
            self.resource_number, self.resource_name, self.implementation_name
        )
    }
}

/// Computes the partials of `destination` from two children and their transition matrices.
///
/// At most one of `scale_write` and `scale_read` is set: the first stores fresh scale factors
/// for the new partials, the second rescales them with previously stored factors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartialsOperation {
    pub destination: usize,
    pub scale_write: Option<usize>,
    pub scale_read: Option<usize>,
    pub child1: usize,
    pub matrix1: usize,
    pub child2: usize,
    pub matrix2: usize,
}

/// Vectorised likelihood arithmetic over indexed buffers.
///
/// Partials are laid out category by category, pattern by pattern, state by state. Scale factors
/// are kept in log space, one per pattern.
pub trait ComputeBackend: Send {
    fn create(shape: BackendShape, resource: &ResourceSelection) -> Result<Self>
    where
        Self: Sized;
    fn details(&self) -> &InstanceDetails;
    fn shape(&self) -> &BackendShape;
    fn supports_auto_scaling(&self) -> bool {
        self.details().auto_scaling
    }

    fn set_tip_states(&mut self, tip: usize, states: &[usize]) -> Result<()>;
    fn set_tip_partials(&mut self, tip: usize, partials: &[f64]) -> Result<()>;
    fn set_partials(&mut self, buffer: usize, partials: &[f64]) -> Result<()>;
    fn get_partials(&self, buffer: usize, cumulative_scale: Option<usize>) -> Result<Vec<f64>>;
    fn set_pattern_weights(&mut self, weights: &[f64]) -> Result<()>;

    fn set_eigen_decomposition(&mut self, eigen: usize, decomposition: &EigenDecomposition)
        -> Result<()>;
    fn set_category_rates(&mut self, rates: &[f64]) -> Result<()>;
    fn set_category_weights(&mut self, weights: &[f64]) -> Result<()>;
    fn set_state_frequencies(&mut self, freqs: &[f64]) -> Result<()>;

    fn update_transition_matrices(
        &mut self,
        eigen: usize,
        matrices: &[usize],
        branch_lengths: &[f64],
    ) -> Result<()>;
    /// `result[i] = first[i] * second[i]` for every rate category.
    fn convolve_transition_matrices(
        &mut self,
        first: &[usize],
        second: &[usize],
        result: &[usize],
    ) -> Result<()>;
    fn get_transition_matrix(&self, matrix: usize, category: usize) -> Result<SubstMatrix>;

    fn update_partials(&mut self, operations: &[PartialsOperation]) -> Result<()>;
    fn reset_scale_factors(&mut self, cumulative: usize) -> Result<()>;
    fn accumulate_scale_factors(&mut self, scales: &[usize], cumulative: Option<usize>)
        -> Result<()>;

    /// Sum of the per-pattern log-likelihoods at the root weighted by the pattern weights.
    fn calculate_root_log_likelihoods(
        &mut self,
        root: usize,
        cumulative_scale: Option<usize>,
    ) -> Result<f64>;
    fn site_log_likelihoods(&self) -> Result<Vec<f64>>;
}

#[cfg(test)]
mod tests;
