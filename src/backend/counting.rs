use crate::backend::{BackendShape, ComputeBackend, CpuBackend, InstanceDetails, PartialsOperation};
use crate::config::ResourceSelection;
use crate::substitution_models::{EigenDecomposition, SubstMatrix};
use crate::Result;

/// Record of the calls a likelihood evaluation made into the backend.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct CallLog {
    pub(crate) operations: Vec<Vec<PartialsOperation>>,
    pub(crate) matrix_updates: Vec<(usize, Vec<usize>, Vec<f64>)>,
    pub(crate) convolutions: Vec<(Vec<usize>, Vec<usize>, Vec<usize>)>,
    pub(crate) eigen_uploads: Vec<usize>,
    pub(crate) category_rate_uploads: usize,
    pub(crate) scale_resets: Vec<usize>,
    pub(crate) scale_accumulations: Vec<Vec<usize>>,
    /// Accumulations left to a backend with automatic scaling.
    pub(crate) auto_scale_accumulations: Vec<Vec<usize>>,
    pub(crate) root_calls: usize,
    pub(crate) tip_state_uploads: Vec<usize>,
    pub(crate) tip_partial_uploads: Vec<usize>,
}

impl CallLog {
    pub(crate) fn partials_operation_count(&self) -> usize {
        self.operations.iter().map(|ops| ops.len()).sum()
    }

    pub(crate) fn matrix_update_count(&self) -> usize {
        self.matrix_updates.iter().map(|(_, m, _)| m.len()).sum()
    }

    pub(crate) fn scale_writes(&self) -> usize {
        self.operations
            .iter()
            .flatten()
            .filter(|op| op.scale_write.is_some())
            .count()
    }

    pub(crate) fn scale_reads(&self) -> usize {
        self.operations
            .iter()
            .flatten()
            .filter(|op| op.scale_read.is_some())
            .count()
    }
}

/// Selecting this resource gives a [`CountingBackend`] that claims automatic scaling.
pub(crate) const AUTO_SCALING_RESOURCE: usize = 1;

/// CPU backend that logs every call, and can be told to report underflow at the root.
#[derive(Debug, Clone)]
pub(crate) struct CountingBackend {
    inner: CpuBackend,
    details: InstanceDetails,
    pub(crate) calls: CallLog,
    pub(crate) underflowing_roots: usize,
}

impl CountingBackend {
    pub(crate) fn reset(&mut self) {
        self.calls = CallLog::default();
    }
}

impl ComputeBackend for CountingBackend {
    fn create(shape: BackendShape, resource: &ResourceSelection) -> Result<Self> {
        let auto_scaling = resource.first() == AUTO_SCALING_RESOURCE;
        let inner = if auto_scaling {
            CpuBackend::create(shape, &ResourceSelection::cpu())?
        } else {
            CpuBackend::create(shape, resource)?
        };
        let details = InstanceDetails {
            auto_scaling,
            ..inner.details().clone()
        };
        Ok(CountingBackend {
            inner,
            details,
            calls: CallLog::default(),
            underflowing_roots: 0,
        })
    }

    fn details(&self) -> &InstanceDetails {
        &self.details
    }

    fn shape(&self) -> &BackendShape {
        self.inner.shape()
    }

    fn set_tip_states(&mut self, tip: usize, states: &[usize]) -> Result<()> {
        self.calls.tip_state_uploads.push(tip);
        self.inner.set_tip_states(tip, states)
    }

    fn set_tip_partials(&mut self, tip: usize, partials: &[f64]) -> Result<()> {
        self.calls.tip_partial_uploads.push(tip);
        self.inner.set_tip_partials(tip, partials)
    }

    fn set_partials(&mut self, buffer: usize, partials: &[f64]) -> Result<()> {
        self.inner.set_partials(buffer, partials)
    }

    fn get_partials(&self, buffer: usize, cumulative_scale: Option<usize>) -> Result<Vec<f64>> {
        self.inner.get_partials(buffer, cumulative_scale)
    }

    fn set_pattern_weights(&mut self, weights: &[f64]) -> Result<()> {
        self.inner.set_pattern_weights(weights)
    }

    fn set_eigen_decomposition(
        &mut self,
        eigen: usize,
        decomposition: &EigenDecomposition,
    ) -> Result<()> {
        self.calls.eigen_uploads.push(eigen);
        self.inner.set_eigen_decomposition(eigen, decomposition)
    }

    fn set_category_rates(&mut self, rates: &[f64]) -> Result<()> {
        self.calls.category_rate_uploads += 1;
        self.inner.set_category_rates(rates)
    }

    fn set_category_weights(&mut self, weights: &[f64]) -> Result<()> {
        self.inner.set_category_weights(weights)
    }

    fn set_state_frequencies(&mut self, freqs: &[f64]) -> Result<()> {
        self.inner.set_state_frequencies(freqs)
    }

    fn update_transition_matrices(
        &mut self,
        eigen: usize,
        matrices: &[usize],
        branch_lengths: &[f64],
    ) -> Result<()> {
        self.calls
            .matrix_updates
            .push((eigen, matrices.to_vec(), branch_lengths.to_vec()));
        self.inner
            .update_transition_matrices(eigen, matrices, branch_lengths)
    }

    fn convolve_transition_matrices(
        &mut self,
        first: &[usize],
        second: &[usize],
        result: &[usize],
    ) -> Result<()> {
        self.calls
            .convolutions
            .push((first.to_vec(), second.to_vec(), result.to_vec()));
        self.inner.convolve_transition_matrices(first, second, result)
    }

    fn get_transition_matrix(&self, matrix: usize, category: usize) -> Result<SubstMatrix> {
        self.inner.get_transition_matrix(matrix, category)
    }

    fn update_partials(&mut self, operations: &[PartialsOperation]) -> Result<()> {
        self.calls.operations.push(operations.to_vec());
        self.inner.update_partials(operations)
    }

    fn reset_scale_factors(&mut self, cumulative: usize) -> Result<()> {
        self.calls.scale_resets.push(cumulative);
        self.inner.reset_scale_factors(cumulative)
    }

    fn accumulate_scale_factors(
        &mut self,
        scales: &[usize],
        cumulative: Option<usize>,
    ) -> Result<()> {
        if cumulative.is_none() && self.details.auto_scaling {
            self.calls.auto_scale_accumulations.push(scales.to_vec());
            return Ok(());
        }
        self.calls.scale_accumulations.push(scales.to_vec());
        self.inner.accumulate_scale_factors(scales, cumulative)
    }

    fn calculate_root_log_likelihoods(
        &mut self,
        root: usize,
        cumulative_scale: Option<usize>,
    ) -> Result<f64> {
        self.calls.root_calls += 1;
        let log_likelihood = self
            .inner
            .calculate_root_log_likelihoods(root, cumulative_scale)?;
        if self.underflowing_roots > 0 {
            self.underflowing_roots -= 1;
            return Ok(f64::NEG_INFINITY);
        }
        Ok(log_likelihood)
    }

    fn site_log_likelihoods(&self) -> Result<Vec<f64>> {
        self.inner.site_log_likelihoods()
    }
}
