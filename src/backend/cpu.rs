use anyhow::bail;
use log::{info, warn};
use nalgebra::DMatrix;

use crate::backend::{BackendShape, ComputeBackend, InstanceDetails, PartialsOperation};
use crate::config::{ConfigurationError, ResourceSelection};
use crate::substitution_models::{EigenDecomposition, SubstMatrix};
use crate::Result;

type Partials = DMatrix<f64>;

/// Reference backend doing the arithmetic with dense `nalgebra` matrices, one `states x patterns`
/// matrix per rate category.
#[derive(Debug, Clone)]
pub struct CpuBackend {
    details: InstanceDetails,
    shape: BackendShape,
    tip_states: Vec<Option<Partials>>,
    partials: Vec<Option<Vec<Partials>>>,
    pattern_weights: Vec<f64>,
    eigen: Vec<Option<EigenDecomposition>>,
    category_rates: Option<Vec<f64>>,
    category_weights: Vec<f64>,
    freqs: Vec<f64>,
    matrices: Vec<Option<Vec<SubstMatrix>>>,
    scale_factors: Vec<Vec<f64>>,
    site_log_likelihoods: Option<Vec<f64>>,
}

fn check_index(index: usize, count: usize, what: &str) -> Result<()> {
    if index >= count {
        bail!("{} buffer {} out of range, there are {}.", what, index, count);
    }
    Ok(())
}

fn check_len(actual: usize, expected: usize, what: &str) -> Result<()> {
    if actual != expected {
        bail!("Expected {} {}, got {}.", expected, what, actual);
    }
    Ok(())
}

impl CpuBackend {
    fn child(&self, buffer: usize, category: usize) -> Result<&Partials> {
        if let Some(Some(states)) = self.tip_states.get(buffer) {
            return Ok(states);
        }
        match &self.partials[buffer] {
            Some(partials) => Ok(&partials[category]),
            None => bail!("Partials buffer {} has not been computed.", buffer),
        }
    }

    fn matrix(&self, matrix: usize, category: usize) -> Result<&SubstMatrix> {
        check_index(matrix, self.shape.matrix_buffer_count, "Matrix")?;
        match &self.matrices[matrix] {
            Some(matrices) => Ok(&matrices[category]),
            None => bail!("Transition matrix {} has not been computed.", matrix),
        }
    }

    fn compute_operation(&self, op: &PartialsOperation) -> Result<Vec<Partials>> {
        check_index(op.destination, self.shape.partials_buffer_count, "Partials")?;
        check_index(op.child1, self.shape.partials_buffer_count, "Partials")?;
        check_index(op.child2, self.shape.partials_buffer_count, "Partials")?;
        let mut result = Vec::with_capacity(self.shape.category_count);
        for c in 0..self.shape.category_count {
            let left = self.matrix(op.matrix1, c)? * self.child(op.child1, c)?;
            let right = self.matrix(op.matrix2, c)? * self.child(op.child2, c)?;
            result.push(left.component_mul(&right));
        }
        Ok(result)
    }

    fn rescale(&mut self, partials: &mut [Partials], scale: usize) {
        for p in 0..self.shape.pattern_count {
            let max = partials
                .iter()
                .map(|cat| cat.column(p).max())
                .fold(0.0, f64::max);
            if max > 0.0 {
                for cat in partials.iter_mut() {
                    cat.column_mut(p).unscale_mut(max);
                }
                self.scale_factors[scale][p] = max.ln();
            } else {
                self.scale_factors[scale][p] = 0.0;
            }
        }
    }

    fn apply_scale(&self, partials: &mut [Partials], scale: usize) {
        for (p, &factor) in self.scale_factors[scale].iter().enumerate() {
            let factor = factor.exp();
            for cat in partials.iter_mut() {
                cat.column_mut(p).unscale_mut(factor);
            }
        }
    }
}

impl ComputeBackend for CpuBackend {
    fn create(shape: BackendShape, resource: &ResourceSelection) -> Result<Self> {
        if shape.state_count < 2 || shape.pattern_count == 0 || shape.category_count == 0 {
            bail!(ConfigurationError {
                message: format!(
                    "Cannot create a backend for {} states, {} patterns and {} categories.",
                    shape.state_count, shape.pattern_count, shape.category_count
                )
            });
        }
        if shape.compact_buffer_count > shape.tip_count
            || shape.tip_count > shape.partials_buffer_count
        {
            bail!(ConfigurationError {
                message: format!(
                    "Inconsistent buffer counts: {} tips, {} compact and {} partials buffers.",
                    shape.tip_count, shape.compact_buffer_count, shape.partials_buffer_count
                )
            });
        }
        if resource.first() != 0 {
            warn!(
                "Resource {} is not available, falling back to the CPU.",
                resource.first()
            );
        }
        let details = InstanceDetails {
            resource_number: 0,
            resource_name: String::from("CPU"),
            implementation_name: String::from("nalgebra reference"),
            auto_scaling: false,
        };
        info!("Created compute backend on {}", details);
        Ok(CpuBackend {
            details,
            shape,
            tip_states: vec![None; shape.compact_buffer_count],
            partials: vec![None; shape.partials_buffer_count],
            pattern_weights: vec![1.0; shape.pattern_count],
            eigen: vec![None; shape.eigen_buffer_count],
            category_rates: None,
            category_weights: vec![1.0 / shape.category_count as f64; shape.category_count],
            freqs: vec![1.0 / shape.state_count as f64; shape.state_count],
            matrices: vec![None; shape.matrix_buffer_count],
            scale_factors: vec![vec![0.0; shape.pattern_count]; shape.scale_buffer_count],
            site_log_likelihoods: None,
        })
    }

    fn details(&self) -> &InstanceDetails {
        &self.details
    }

    fn shape(&self) -> &BackendShape {
        &self.shape
    }

    fn set_tip_states(&mut self, tip: usize, states: &[usize]) -> Result<()> {
        check_index(tip, self.shape.compact_buffer_count, "Compact")?;
        check_len(states.len(), self.shape.pattern_count, "tip states")?;
        let n = self.shape.state_count;
        let expanded = Partials::from_fn(n, states.len(), |s, p| {
            if states[p] >= n || states[p] == s {
                1.0
            } else {
                0.0
            }
        });
        self.tip_states[tip] = Some(expanded);
        self.partials[tip] = None;
        Ok(())
    }

    fn set_tip_partials(&mut self, tip: usize, partials: &[f64]) -> Result<()> {
        check_index(tip, self.shape.tip_count, "Tip")?;
        let (n, p) = (self.shape.state_count, self.shape.pattern_count);
        check_len(partials.len(), n * p, "tip partials")?;
        let partials = Partials::from_column_slice(n, p, partials);
        self.partials[tip] = Some(vec![partials; self.shape.category_count]);
        if let Some(states) = self.tip_states.get_mut(tip) {
            *states = None;
        }
        Ok(())
    }

    fn set_partials(&mut self, buffer: usize, partials: &[f64]) -> Result<()> {
        check_index(buffer, self.shape.partials_buffer_count, "Partials")?;
        let (n, p) = (self.shape.state_count, self.shape.pattern_count);
        check_len(partials.len(), n * p * self.shape.category_count, "partials")?;
        self.partials[buffer] = Some(
            partials
                .chunks(n * p)
                .map(|chunk| Partials::from_column_slice(n, p, chunk))
                .collect(),
        );
        Ok(())
    }

    fn get_partials(&self, buffer: usize, cumulative_scale: Option<usize>) -> Result<Vec<f64>> {
        check_index(buffer, self.shape.partials_buffer_count, "Partials")?;
        let mut partials: Vec<Partials> = (0..self.shape.category_count)
            .map(|c| self.child(buffer, c).cloned())
            .collect::<Result<_>>()?;
        if let Some(scale) = cumulative_scale {
            check_index(scale, self.shape.scale_buffer_count, "Scale")?;
            for (p, &factor) in self.scale_factors[scale].iter().enumerate() {
                for cat in partials.iter_mut() {
                    cat.column_mut(p).scale_mut(factor.exp());
                }
            }
        }
        Ok(partials
            .iter()
            .flat_map(|cat| cat.as_slice().iter().copied())
            .collect())
    }

    fn set_pattern_weights(&mut self, weights: &[f64]) -> Result<()> {
        check_len(weights.len(), self.shape.pattern_count, "pattern weights")?;
        self.pattern_weights = weights.to_vec();
        Ok(())
    }

    fn set_eigen_decomposition(
        &mut self,
        eigen: usize,
        decomposition: &EigenDecomposition,
    ) -> Result<()> {
        check_index(eigen, self.shape.eigen_buffer_count, "Eigen")?;
        check_len(decomposition.state_count(), self.shape.state_count, "eigenvalues")?;
        self.eigen[eigen] = Some(decomposition.clone());
        Ok(())
    }

    fn set_category_rates(&mut self, rates: &[f64]) -> Result<()> {
        check_len(rates.len(), self.shape.category_count, "category rates")?;
        self.category_rates = Some(rates.to_vec());
        Ok(())
    }

    fn set_category_weights(&mut self, weights: &[f64]) -> Result<()> {
        check_len(weights.len(), self.shape.category_count, "category weights")?;
        self.category_weights = weights.to_vec();
        Ok(())
    }

    fn set_state_frequencies(&mut self, freqs: &[f64]) -> Result<()> {
        check_len(freqs.len(), self.shape.state_count, "state frequencies")?;
        self.freqs = freqs.to_vec();
        Ok(())
    }

    fn update_transition_matrices(
        &mut self,
        eigen: usize,
        matrices: &[usize],
        branch_lengths: &[f64],
    ) -> Result<()> {
        check_index(eigen, self.shape.eigen_buffer_count, "Eigen")?;
        check_len(branch_lengths.len(), matrices.len(), "branch lengths")?;
        let Some(decomposition) = &self.eigen[eigen] else {
            bail!("Eigen decomposition {} has not been set.", eigen);
        };
        let Some(rates) = &self.category_rates else {
            bail!("Category rates have not been set.");
        };
        let mut computed = Vec::with_capacity(matrices.len());
        for (&matrix, &length) in matrices.iter().zip(branch_lengths) {
            check_index(matrix, self.shape.matrix_buffer_count, "Matrix")?;
            let per_category: Vec<SubstMatrix> = rates
                .iter()
                .map(|rate| decomposition.transition_matrix(rate * length))
                .collect();
            computed.push((matrix, per_category));
        }
        for (matrix, per_category) in computed {
            self.matrices[matrix] = Some(per_category);
        }
        Ok(())
    }

    fn convolve_transition_matrices(
        &mut self,
        first: &[usize],
        second: &[usize],
        result: &[usize],
    ) -> Result<()> {
        check_len(second.len(), first.len(), "second convolution buffers")?;
        check_len(result.len(), first.len(), "result convolution buffers")?;
        for ((&a, &b), &r) in first.iter().zip(second).zip(result) {
            check_index(r, self.shape.matrix_buffer_count, "Matrix")?;
            let convolved = (0..self.shape.category_count)
                .map(|c| Ok(self.matrix(a, c)? * self.matrix(b, c)?))
                .collect::<Result<Vec<_>>>()?;
            self.matrices[r] = Some(convolved);
        }
        Ok(())
    }

    fn get_transition_matrix(&self, matrix: usize, category: usize) -> Result<SubstMatrix> {
        check_index(category, self.shape.category_count, "Category")?;
        self.matrix(matrix, category).cloned()
    }

    fn update_partials(&mut self, operations: &[PartialsOperation]) -> Result<()> {
        for op in operations {
            let mut partials = self.compute_operation(op)?;
            match (op.scale_write, op.scale_read) {
                (Some(_), Some(_)) => bail!("Operation both writes and reads scale factors."),
                (Some(scale), None) => {
                    check_index(scale, self.shape.scale_buffer_count, "Scale")?;
                    self.rescale(&mut partials, scale);
                }
                (None, Some(scale)) => {
                    check_index(scale, self.shape.scale_buffer_count, "Scale")?;
                    self.apply_scale(&mut partials, scale);
                }
                (None, None) => {}
            }
            self.partials[op.destination] = Some(partials);
        }
        Ok(())
    }

    fn reset_scale_factors(&mut self, cumulative: usize) -> Result<()> {
        check_index(cumulative, self.shape.scale_buffer_count, "Scale")?;
        self.scale_factors[cumulative].fill(0.0);
        Ok(())
    }

    fn accumulate_scale_factors(
        &mut self,
        scales: &[usize],
        cumulative: Option<usize>,
    ) -> Result<()> {
        let Some(cumulative) = cumulative else {
            bail!("Automatic scaling is not supported by the CPU backend.");
        };
        check_index(cumulative, self.shape.scale_buffer_count, "Scale")?;
        for &scale in scales {
            check_index(scale, self.shape.scale_buffer_count, "Scale")?;
            for p in 0..self.shape.pattern_count {
                self.scale_factors[cumulative][p] += self.scale_factors[scale][p];
            }
        }
        Ok(())
    }

    fn calculate_root_log_likelihoods(
        &mut self,
        root: usize,
        cumulative_scale: Option<usize>,
    ) -> Result<f64> {
        check_index(root, self.shape.partials_buffer_count, "Partials")?;
        if let Some(scale) = cumulative_scale {
            check_index(scale, self.shape.scale_buffer_count, "Scale")?;
        }
        let mut site_likelihoods = vec![0.0; self.shape.pattern_count];
        for c in 0..self.shape.category_count {
            let partials = self.child(root, c)?;
            for (p, column) in partials.column_iter().enumerate() {
                let site: f64 = column.iter().zip(&self.freqs).map(|(l, f)| l * f).sum();
                site_likelihoods[p] += self.category_weights[c] * site;
            }
        }
        let site_log_likelihoods: Vec<f64> = site_likelihoods
            .iter()
            .enumerate()
            .map(|(p, l)| match cumulative_scale {
                Some(scale) => l.ln() + self.scale_factors[scale][p],
                None => l.ln(),
            })
            .collect();
        let log_likelihood = site_log_likelihoods
            .iter()
            .zip(&self.pattern_weights)
            .map(|(l, w)| l * w)
            .sum();
        self.site_log_likelihoods = Some(site_log_likelihoods);
        Ok(log_likelihood)
    }

    fn site_log_likelihoods(&self) -> Result<Vec<f64>> {
        match &self.site_log_likelihoods {
            Some(site_log_likelihoods) => Ok(site_log_likelihoods.clone()),
            None => bail!("Root log-likelihoods have not been calculated."),
        }
    }
}
