use std::fmt::Debug;

use anyhow::bail;
use dyn_clone::DynClone;

use crate::Result;

/// Rate heterogeneity across sites as a set of discrete rate categories.
pub trait SiteRateModel: Debug + DynClone + Send {
    fn category_count(&self) -> usize;
    /// `None` when the rates cannot be computed for the current parameters.
    fn category_rates(&self) -> Option<Vec<f64>>;
    fn category_proportions(&self) -> Vec<f64>;
    fn set_category_rates(&mut self, rates: &[f64]) -> Result<()>;
    fn set_mu(&mut self, mu: f64);
}

dyn_clone::clone_trait_object!(SiteRateModel);

/// Explicitly given rate categories with their proportions, scaled by an overall rate `mu`.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscreteRates {
    rates: Vec<f64>,
    proportions: Vec<f64>,
    mu: f64,
}

impl DiscreteRates {
    pub fn homogeneous() -> Self {
        DiscreteRates {
            rates: vec![1.0],
            proportions: vec![1.0],
            mu: 1.0,
        }
    }

    pub fn new(rates: &[f64], proportions: &[f64]) -> Result<Self> {
        if rates.is_empty() || rates.len() != proportions.len() {
            bail!(
                "Need one proportion per rate category, got {} rates and {} proportions.",
                rates.len(),
                proportions.len()
            );
        }
        let total: f64 = proportions.iter().sum();
        if proportions.iter().any(|&p| p.is_nan() || p < 0.0) || total <= 0.0 {
            bail!("Category proportions must be non-negative with a positive sum.");
        }
        Ok(DiscreteRates {
            rates: rates.to_vec(),
            proportions: proportions.iter().map(|p| p / total).collect(),
            mu: 1.0,
        })
    }

    pub fn mu(&self) -> f64 {
        self.mu
    }
}

impl SiteRateModel for DiscreteRates {
    fn category_count(&self) -> usize {
        self.rates.len()
    }

    fn category_rates(&self) -> Option<Vec<f64>> {
        let rates: Vec<f64> = self.rates.iter().map(|r| r * self.mu).collect();
        if rates.iter().all(|r| r.is_finite() && *r >= 0.0) {
            Some(rates)
        } else {
            None
        }
    }

    fn category_proportions(&self) -> Vec<f64> {
        self.proportions.clone()
    }

    fn set_category_rates(&mut self, rates: &[f64]) -> Result<()> {
        if rates.len() != self.rates.len() {
            bail!(
                "Expected {} category rates, got {}.",
                self.rates.len(),
                rates.len()
            );
        }
        self.rates = rates.to_vec();
        Ok(())
    }

    fn set_mu(&mut self, mu: f64) {
        self.mu = mu;
    }
}

#[cfg(test)]
mod tests;
