use std::collections::VecDeque;

use anyhow::bail;
use log::debug;

use crate::backend::ComputeBackend;
use crate::config::ConfigurationError;
use crate::likelihood::buffer_index::DoubleBufferIndex;
use crate::substitution_models::{BranchModel, FreqVector, SubstitutionModel};
use crate::Result;

/// Per-eigen-system lists of matrix buffers and branch lengths waiting to be computed.
#[derive(Debug)]
struct PendingMatrices {
    indices: Vec<Vec<usize>>,
    lengths: Vec<Vec<f64>>,
}

impl PendingMatrices {
    fn new(eigen_count: usize) -> Self {
        PendingMatrices {
            indices: vec![Vec::new(); eigen_count],
            lengths: vec![Vec::new(); eigen_count],
        }
    }

    fn push(&mut self, eigen: usize, matrix: usize, length: f64) {
        self.indices[eigen].push(matrix);
        self.lengths[eigen].push(length);
    }

    fn clear(&mut self) {
        self.indices.iter_mut().for_each(Vec::clear);
        self.lengths.iter_mut().for_each(Vec::clear);
    }
}

/// Owns the substitution models and the eigen and transition matrix buffers they use.
///
/// Branches covered by several models get one pool buffer per piece; the pieces are then
/// convolved pairwise into the branch's own matrix buffer.
#[derive(Debug, Clone)]
pub struct SubstitutionModelDelegate {
    models: Vec<Box<dyn SubstitutionModel>>,
    branch_model: Box<dyn BranchModel>,
    eigen_helper: DoubleBufferIndex,
    matrix_helper: DoubleBufferIndex,
    extra_buffer_count: usize,
    reserve_buffer_index: usize,
    available_buffers: VecDeque<usize>,
}

impl SubstitutionModelDelegate {
    pub fn new(
        models: Vec<Box<dyn SubstitutionModel>>,
        branch_model: Box<dyn BranchModel>,
        node_count: usize,
        extra_buffer_count: usize,
    ) -> Result<Self> {
        if models.is_empty() {
            bail!(ConfigurationError {
                message: String::from("At least one substitution model is needed.")
            });
        }
        if branch_model.model_count() != models.len() {
            bail!(ConfigurationError {
                message: format!(
                    "Branch model refers to {} substitution models but {} were given.",
                    branch_model.model_count(),
                    models.len()
                )
            });
        }
        if branch_model.root_frequency_model() >= models.len() {
            bail!(ConfigurationError {
                message: format!(
                    "Root frequencies taken from model {} of {}.",
                    branch_model.root_frequency_model(),
                    models.len()
                )
            });
        }
        let extra_buffer_count = if branch_model.requires_convolution() {
            if extra_buffer_count < models.len() {
                bail!(ConfigurationError {
                    message: format!(
                        "Need at least {} extra matrix buffers for convolution, got {}.",
                        models.len(),
                        extra_buffer_count
                    )
                });
            }
            extra_buffer_count
        } else {
            0
        };
        let eigen_helper = DoubleBufferIndex::new(models.len(), 0);
        let matrix_helper = DoubleBufferIndex::new(node_count, 0);
        let pool_start = matrix_helper.buffer_count();
        debug!(
            "Substitution model delegate with {} models and {} extra matrix buffers",
            models.len(),
            extra_buffer_count
        );
        Ok(SubstitutionModelDelegate {
            models,
            branch_model,
            eigen_helper,
            matrix_helper,
            extra_buffer_count,
            reserve_buffer_index: pool_start + extra_buffer_count,
            available_buffers: (pool_start..pool_start + extra_buffer_count).collect(),
        })
    }

    pub fn eigen_count(&self) -> usize {
        self.models.len()
    }

    pub fn eigen_buffer_count(&self) -> usize {
        self.eigen_helper.buffer_count()
    }

    /// Node matrix buffers, then the convolution pool, then one reserve buffer.
    pub fn matrix_buffer_count(&self) -> usize {
        self.matrix_helper.buffer_count() + self.extra_buffer_count + 1
    }

    pub fn models(&self) -> &[Box<dyn SubstitutionModel>] {
        &self.models
    }

    pub fn model(&self, i: usize) -> Option<&dyn SubstitutionModel> {
        self.models.get(i).map(|m| m.as_ref())
    }

    pub(crate) fn model_mut(&mut self, i: usize) -> Result<&mut Box<dyn SubstitutionModel>> {
        let count = self.models.len();
        match self.models.get_mut(i) {
            Some(model) => Ok(model),
            None => bail!("No substitution model {}, there are {}.", i, count),
        }
    }

    pub(crate) fn set_models(&mut self, models: Vec<Box<dyn SubstitutionModel>>) {
        self.models = models;
    }

    pub fn branch_model(&self) -> &dyn BranchModel {
        self.branch_model.as_ref()
    }

    pub fn root_frequencies(&self) -> &FreqVector {
        self.models[self.branch_model.root_frequency_model()].freqs()
    }

    pub fn matrix_index(&self, branch: usize) -> usize {
        self.matrix_helper.offset_index(branch)
    }

    pub fn eigen_index(&self, model: usize) -> usize {
        self.eigen_helper.offset_index(model)
    }

    pub fn begin_round(&mut self) {
        self.eigen_helper.begin_round();
        self.matrix_helper.begin_round();
    }

    pub fn flip_matrix_buffer(&mut self, branch: usize) {
        self.matrix_helper.flip_once(branch);
    }

    /// Uploads every eigen decomposition and the root frequencies.
    pub fn update_substitution_models<B: ComputeBackend>(
        &mut self,
        backend: &mut B,
        flip: bool,
    ) -> Result<()> {
        for (i, model) in self.models.iter().enumerate() {
            if flip {
                self.eigen_helper.flip_once(i);
            }
            backend.set_eigen_decomposition(
                self.eigen_helper.offset_index(i),
                model.eigen_decomposition(),
            )?;
        }
        backend.set_state_frequencies(self.root_frequencies().as_slice())
    }

    /// Computes the transition matrices of the given branches, grouped by eigen system.
    pub fn update_transition_matrices<B: ComputeBackend>(
        &mut self,
        backend: &mut B,
        branch_updates: &[(usize, f64)],
    ) -> Result<()> {
        let mut pending = PendingMatrices::new(self.models.len());
        let mut convolutions: Vec<VecDeque<usize>> = Vec::new();
        for &(branch, length) in branch_updates {
            let mapping = self.branch_model.mapping(branch);
            if mapping.order.len() == 1 {
                pending.push(mapping.order[0], self.matrix_helper.offset_index(branch), length);
                continue;
            }
            if self.available_buffers.len() < mapping.order.len() {
                debug!("Matrix buffer pool exhausted, computing the pending matrices first");
                self.compute_matrices(backend, &pending)?;
                pending.clear();
                self.convolve_matrices(backend, &mut convolutions)?;
            }
            let total: f64 = mapping.weights.iter().sum();
            let mut buffers = VecDeque::with_capacity(mapping.order.len() + 1);
            for (&model, &weight) in mapping.order.iter().zip(&mapping.weights) {
                let Some(buffer) = self.available_buffers.pop_front() else {
                    bail!("Ran out of buffers for transition matrices.");
                };
                pending.push(model, buffer, weight * length / total);
                buffers.push_back(buffer);
            }
            buffers.push_back(self.matrix_helper.offset_index(branch));
            convolutions.push(buffers);
        }
        self.compute_matrices(backend, &pending)?;
        self.convolve_matrices(backend, &mut convolutions)
    }

    fn compute_matrices<B: ComputeBackend>(
        &self,
        backend: &mut B,
        pending: &PendingMatrices,
    ) -> Result<()> {
        for (k, (indices, lengths)) in pending.indices.iter().zip(&pending.lengths).enumerate() {
            if !indices.is_empty() {
                backend.update_transition_matrices(
                    self.eigen_helper.offset_index(k),
                    indices,
                    lengths,
                )?;
            }
        }
        Ok(())
    }

    /// Each queue holds the pieces of one branch followed by its destination buffer. Every
    /// round convolves the first two pieces of every queue, until only the destination is
    /// written.
    fn convolve_matrices<B: ComputeBackend>(
        &mut self,
        backend: &mut B,
        convolutions: &mut Vec<VecDeque<usize>>,
    ) -> Result<()> {
        while !convolutions.is_empty() {
            let mut first = Vec::new();
            let mut second = Vec::new();
            let mut result = Vec::new();
            for queue in convolutions.iter_mut() {
                let (Some(a), Some(b)) = (queue.pop_front(), queue.pop_front()) else {
                    bail!("Unexpected convolution list of size {}.", queue.len());
                };
                let destination = if queue.len() > 1 {
                    let buffer = match self.available_buffers.pop_front() {
                        Some(buffer) => buffer,
                        None if !first.is_empty() => {
                            self.convolve_and_release(backend, &first, &second, &result)?;
                            first.clear();
                            second.clear();
                            result.clear();
                            match self.available_buffers.pop_front() {
                                Some(buffer) => buffer,
                                None => self.reserve_buffer_index,
                            }
                        }
                        None => self.reserve_buffer_index,
                    };
                    queue.push_front(buffer);
                    buffer
                } else {
                    match queue.pop_front() {
                        Some(destination) => destination,
                        None => bail!("Convolution list lost its destination buffer."),
                    }
                };
                first.push(a);
                second.push(b);
                result.push(destination);
            }
            self.convolve_and_release(backend, &first, &second, &result)?;
            convolutions.retain(|queue| !queue.is_empty());
        }
        Ok(())
    }

    fn convolve_and_release<B: ComputeBackend>(
        &mut self,
        backend: &mut B,
        first: &[usize],
        second: &[usize],
        result: &[usize],
    ) -> Result<()> {
        if first.is_empty() {
            return Ok(());
        }
        backend.convolve_transition_matrices(first, second, result)?;
        let pool_start = self.matrix_helper.buffer_count();
        for &buffer in first.iter().chain(second) {
            if buffer >= pool_start && buffer != self.reserve_buffer_index {
                self.available_buffers.push_back(buffer);
            }
        }
        Ok(())
    }

    pub fn store_state(&mut self) {
        self.eigen_helper.store_state();
        self.matrix_helper.store_state();
    }

    pub fn restore_state(&mut self) -> Result<()> {
        self.eigen_helper.restore_state()?;
        self.matrix_helper.restore_state()
    }

    pub fn accept_state(&mut self) {
        self.eigen_helper.accept_state();
        self.matrix_helper.accept_state();
    }
}
