use anyhow::bail;

use crate::substitution_models::{FreqVector, SubstMatrix, SubstitutionModel};
use crate::Result;

/// Eigenvalues closer than this are treated as equal when integrating along a branch.
const EIGENVALUE_TOLERANCE: f64 = 1e-12;

/// What a register accumulates along a branch.
#[derive(Debug, Clone, PartialEq)]
pub enum JumpRegister {
    /// Every substitution `i -> j` adds `R[i][j]`, the diagonal is ignored.
    Counts(SubstMatrix),
    /// Every unit of time spent in state `i` adds `r[i]`.
    Rewards(FreqVector),
}

/// Expected number of labelled substitutions (or accumulated rewards) along a branch,
/// conditional on the states at both of its ends.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkovJumps {
    name: String,
    register: JumpRegister,
    model: usize,
}

impl MarkovJumps {
    pub fn counts(name: &str, register: SubstMatrix) -> Result<Self> {
        if register.nrows() != register.ncols() {
            bail!(
                "Jump register {} must be square, got {}x{}.",
                name,
                register.nrows(),
                register.ncols()
            );
        }
        let mut register = register;
        register.fill_diagonal(0.0);
        Ok(MarkovJumps {
            name: name.to_string(),
            register: JumpRegister::Counts(register),
            model: 0,
        })
    }

    /// Counts every substitution.
    pub fn all_substitutions(name: &str, state_count: usize) -> Self {
        MarkovJumps {
            name: name.to_string(),
            register: JumpRegister::Counts(SubstMatrix::from_fn(state_count, state_count, |i, j| {
                if i == j {
                    0.0
                } else {
                    1.0
                }
            })),
            model: 0,
        }
    }

    pub fn state_to_state(name: &str, state_count: usize, from: usize, to: usize) -> Result<Self> {
        if from >= state_count || to >= state_count || from == to {
            bail!(
                "Cannot count jumps from {} to {} among {} states.",
                from,
                to,
                state_count
            );
        }
        let mut register = SubstMatrix::zeros(state_count, state_count);
        register[(from, to)] = 1.0;
        Self::counts(name, register)
    }

    pub fn rewards(name: &str, rewards: &[f64]) -> Self {
        MarkovJumps {
            name: name.to_string(),
            register: JumpRegister::Rewards(FreqVector::from_column_slice(rewards)),
            model: 0,
        }
    }

    /// Restricts the register to branches whose first substitution model is `model`.
    pub fn for_model(mut self, model: usize) -> Self {
        self.model = model;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn register(&self) -> &JumpRegister {
        &self.register
    }

    pub fn model(&self) -> usize {
        self.model
    }

    pub fn state_count(&self) -> usize {
        match &self.register {
            JumpRegister::Counts(register) => register.nrows(),
            JumpRegister::Rewards(rewards) => rewards.len(),
        }
    }

    /// `E[a][b]`: expected register value over `time` jointly with ending in `b` from `a`.
    ///
    /// With `Q = U diag(l) U^-1` and the register rates `M`, this is
    /// `U ((U^-1 M U) o J) U^-1` where `J[i][j]` integrates `exp(l_i s) exp(l_j (t - s))`.
    pub fn joint_expectations(&self, model: &dyn SubstitutionModel, time: f64) -> SubstMatrix {
        let eigen = model.eigen_decomposition();
        let rates = match &self.register {
            JumpRegister::Counts(register) => model.q().component_mul(register),
            JumpRegister::Rewards(rewards) => SubstMatrix::from_diagonal(rewards),
        };
        let lambda = &eigen.eigenvalues;
        let n = lambda.len();
        let integrals = SubstMatrix::from_fn(n, n, |i, j| {
            let (li, lj) = (lambda[i], lambda[j]);
            if (li - lj).abs() < EIGENVALUE_TOLERANCE {
                time * (li * time).exp()
            } else {
                ((li * time).exp() - (lj * time).exp()) / (li - lj)
            }
        });
        let inner = (&eigen.inverse_eigenvectors * rates * &eigen.eigenvectors)
            .component_mul(&integrals);
        &eigen.eigenvectors * inner * &eigen.inverse_eigenvectors
    }

    /// `E[a][b] / P[a][b]`, zero where the end states cannot be reached.
    pub fn conditional_expectations(
        &self,
        model: &dyn SubstitutionModel,
        time: f64,
    ) -> SubstMatrix {
        let joint = self.joint_expectations(model, time);
        let probabilities = model.p(time);
        joint.zip_map(&probabilities, |e, p| if p > 0.0 { e / p } else { 0.0 })
    }
}
