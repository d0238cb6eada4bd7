use std::fmt::{Debug, Display};

use anyhow::bail;
use dyn_clone::DynClone;
use log::info;
use nalgebra::{DMatrix, DVector, SymmetricEigen};

use crate::Result;

pub mod branch_model;
pub mod dna_models;
pub use branch_model::*;
pub use dna_models::*;

pub type SubstMatrix = DMatrix<f64>;
pub type FreqVector = DVector<f64>;

/// Spectral decomposition `Q = U diag(lambda) U^-1` of a rate matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct EigenDecomposition {
    pub eigenvectors: SubstMatrix,
    pub inverse_eigenvectors: SubstMatrix,
    pub eigenvalues: FreqVector,
}

impl EigenDecomposition {
    /// Decomposes a time-reversible rate matrix through its symmetrised form
    /// `S = Pi^1/2 Q Pi^-1/2`, so that `U = Pi^-1/2 V` and `U^-1 = V^T Pi^1/2`.
    pub fn from_reversible(q: &SubstMatrix, pi: &FreqVector) -> Result<Self> {
        let n = q.nrows();
        if q.ncols() != n || pi.len() != n {
            bail!(
                "Rate matrix is {}x{} but there are {} frequencies.",
                q.nrows(),
                q.ncols(),
                pi.len()
            );
        }
        if pi.iter().any(|&p| p <= 0.0) {
            bail!("Reversible decomposition requires strictly positive frequencies.");
        }
        let sqrt_pi = pi.map(f64::sqrt);
        let s = SubstMatrix::from_fn(n, n, |i, j| sqrt_pi[i] * q[(i, j)] / sqrt_pi[j]);
        let s = (&s + s.transpose()) * 0.5;
        let SymmetricEigen {
            eigenvalues,
            eigenvectors,
        } = SymmetricEigen::new(s);
        let u = SubstMatrix::from_fn(n, n, |i, j| eigenvectors[(i, j)] / sqrt_pi[i]);
        let u_inv = SubstMatrix::from_fn(n, n, |i, j| eigenvectors[(j, i)] * sqrt_pi[j]);
        Ok(EigenDecomposition {
            eigenvectors: u,
            inverse_eigenvectors: u_inv,
            eigenvalues,
        })
    }

    pub fn state_count(&self) -> usize {
        self.eigenvalues.len()
    }

    /// Transition probabilities `exp(Qt)`, negative round-off is clamped to zero.
    pub fn transition_matrix(&self, time: f64) -> SubstMatrix {
        let mut scaled = self.eigenvectors.clone();
        for (j, &lambda) in self.eigenvalues.iter().enumerate() {
            scaled.column_mut(j).scale_mut((lambda * time).exp());
        }
        let mut p = scaled * &self.inverse_eigenvectors;
        p.iter_mut().for_each(|x| *x = x.max(0.0));
        p
    }
}

/// A continuous-time Markov substitution process as seen by the likelihood engine.
pub trait SubstitutionModel: Debug + DynClone + Send {
    fn name(&self) -> &str;
    fn state_count(&self) -> usize;
    fn q(&self) -> &SubstMatrix;
    fn freqs(&self) -> &FreqVector;
    fn eigen_decomposition(&self) -> &EigenDecomposition;
    fn parameters(&self) -> &[f64];
    fn set_parameters(&mut self, params: &[f64]) -> Result<()>;
    fn set_frequencies(&mut self, freqs: &[f64]) -> Result<()>;

    fn p(&self, time: f64) -> SubstMatrix {
        self.eigen_decomposition().transition_matrix(time)
    }
}

dyn_clone::clone_trait_object!(SubstitutionModel);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelType {
    JC69,
    K80,
    HKY,
    GTR,
    Binary,
}

impl Display for ModelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ModelType::JC69 => "JC69",
            ModelType::K80 => "K80",
            ModelType::HKY => "HKY",
            ModelType::GTR => "GTR",
            ModelType::Binary => "binary",
        };
        write!(f, "{}", name)
    }
}

impl TryFrom<&str> for ModelType {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self> {
        Ok(match value.to_uppercase().as_str() {
            "JC69" => ModelType::JC69,
            "K80" => ModelType::K80,
            "HKY" | "HKY85" => ModelType::HKY,
            "GTR" => ModelType::GTR,
            "BINARY" | "TWOSTATE" => ModelType::Binary,
            _ => bail!("Unknown substitution model requested: {}", value),
        })
    }
}

impl ModelType {
    pub fn state_count(&self) -> usize {
        match self {
            ModelType::Binary => 2,
            _ => 4,
        }
    }
}

/// Time-reversible model given by symmetric exchangeabilities and stationary frequencies,
/// normalised to one expected substitution per unit time.
#[derive(Debug, Clone, PartialEq)]
pub struct ReversibleModel {
    model_type: ModelType,
    params: Vec<f64>,
    pi: FreqVector,
    q: SubstMatrix,
    eigen: EigenDecomposition,
}

impl ReversibleModel {
    pub fn new(model_type: ModelType, params: &[f64], freqs: Option<&[f64]>) -> Result<Self> {
        let n = model_type.state_count();
        let pi = match freqs {
            Some(freqs) => make_pi(freqs, n)?,
            None => FreqVector::from_element(n, 1.0 / n as f64),
        };
        let params = parse_parameters(model_type, params)?;
        let q = reversible_q(&exchangeabilities(model_type, &params), &pi)?;
        let eigen = EigenDecomposition::from_reversible(&q, &pi)?;
        info!(
            "Set up {} model with parameters {:?} and frequencies {:?}",
            model_type,
            params,
            pi.as_slice()
        );
        Ok(ReversibleModel {
            model_type,
            params,
            pi,
            q,
            eigen,
        })
    }

    pub fn model_type(&self) -> ModelType {
        self.model_type
    }

    fn rebuild(&mut self) -> Result<()> {
        let q = reversible_q(&exchangeabilities(self.model_type, &self.params), &self.pi)?;
        self.eigen = EigenDecomposition::from_reversible(&q, &self.pi)?;
        self.q = q;
        Ok(())
    }
}

impl SubstitutionModel for ReversibleModel {
    fn name(&self) -> &str {
        match self.model_type {
            ModelType::JC69 => "JC69",
            ModelType::K80 => "K80",
            ModelType::HKY => "HKY",
            ModelType::GTR => "GTR",
            ModelType::Binary => "binary",
        }
    }

    fn state_count(&self) -> usize {
        self.pi.len()
    }

    fn q(&self) -> &SubstMatrix {
        &self.q
    }

    fn freqs(&self) -> &FreqVector {
        &self.pi
    }

    fn eigen_decomposition(&self) -> &EigenDecomposition {
        &self.eigen
    }

    fn parameters(&self) -> &[f64] {
        &self.params
    }

    fn set_parameters(&mut self, params: &[f64]) -> Result<()> {
        self.params = parse_parameters(self.model_type, params)?;
        self.rebuild()
    }

    fn set_frequencies(&mut self, freqs: &[f64]) -> Result<()> {
        if matches!(self.model_type, ModelType::JC69 | ModelType::K80) {
            bail!("The {} model has fixed equal frequencies.", self.model_type);
        }
        self.pi = make_pi(freqs, self.pi.len())?;
        self.rebuild()
    }
}

pub(crate) fn make_pi(freqs: &[f64], n: usize) -> Result<FreqVector> {
    if freqs.len() != n {
        bail!("Expected {} equilibrium frequencies, got {}.", n, freqs.len());
    }
    let pi = frequencies!(freqs);
    if (pi.sum() - 1.0).abs() > 1e-10 {
        bail!("The equilibrium frequencies provided do not sum up to 1.");
    }
    if pi.iter().any(|&p| p <= 0.0) {
        bail!("The equilibrium frequencies must be strictly positive.");
    }
    Ok(pi)
}

fn parse_parameters(model_type: ModelType, params: &[f64]) -> Result<Vec<f64>> {
    let params = match model_type {
        ModelType::JC69 | ModelType::Binary => parse_jc69_parameters(params),
        ModelType::K80 | ModelType::HKY => parse_kappa_parameters(params),
        ModelType::GTR => parse_gtr_parameters(params)?,
    };
    if params.iter().any(|&r| !r.is_finite() || r < 0.0) {
        bail!("Substitution rates must be finite and non-negative: {:?}", params);
    }
    Ok(params)
}

/// Normalised rate matrix `q_ij = r_ij pi_j` with mean rate one.
pub fn reversible_q(exchangeabilities: &SubstMatrix, pi: &FreqVector) -> Result<SubstMatrix> {
    let n = pi.len();
    let mut q = SubstMatrix::from_fn(n, n, |i, j| {
        if i == j {
            0.0
        } else {
            exchangeabilities[(i, j)] * pi[j]
        }
    });
    for i in 0..n {
        q[(i, i)] = -q.row(i).sum();
    }
    let mean_rate = -(0..n).map(|i| pi[i] * q[(i, i)]).sum::<f64>();
    if mean_rate <= 0.0 {
        bail!("The rate matrix has no substitutions.");
    }
    Ok(q / mean_rate)
}
