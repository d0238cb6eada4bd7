use anyhow::bail;
use log::warn;

use crate::substitution_models::{ModelType, ReversibleModel, SubstMatrix};
use crate::Result;

const A: usize = 0;
const C: usize = 1;
const G: usize = 2;
const T: usize = 3;

pub fn jc69() -> Result<ReversibleModel> {
    ReversibleModel::new(ModelType::JC69, &[], None)
}

pub fn k80(alpha: f64, beta: f64) -> Result<ReversibleModel> {
    ReversibleModel::new(ModelType::K80, &[alpha, beta], None)
}

pub fn hky(kappa: f64, freqs: &[f64]) -> Result<ReversibleModel> {
    ReversibleModel::new(ModelType::HKY, &[kappa, 1.0], Some(freqs))
}

/// Rates in the order `rtc, rta, rtg, rca, rcg, rag`.
pub fn gtr(rates: &[f64], freqs: &[f64]) -> Result<ReversibleModel> {
    ReversibleModel::new(ModelType::GTR, rates, Some(freqs))
}

/// Two-state model, symmetric unless frequencies are given.
pub fn binary(freqs: Option<&[f64]>) -> Result<ReversibleModel> {
    ReversibleModel::new(ModelType::Binary, &[], freqs)
}

pub(crate) fn parse_jc69_parameters(model_params: &[f64]) -> Vec<f64> {
    if !model_params.is_empty() {
        warn!("Too many values provided for JC69, average rate is fixed at 1.0.");
    }
    Vec::new()
}

pub(crate) fn parse_kappa_parameters(model_params: &[f64]) -> Vec<f64> {
    let (alpha, beta) = if model_params.is_empty() {
        warn!("Too few values provided, required 1 or 2 values, kappa or alpha and beta.");
        warn!("Falling back to default values.");
        (2.0, 1.0)
    } else if model_params.len() == 1 {
        (model_params[0], 1.0)
    } else if model_params.len() == 2 {
        (model_params[0], model_params[1])
    } else {
        warn!("Too many values provided, required 2 values, alpha and beta.");
        warn!("Will only use the first two values provided.");
        (model_params[0], model_params[1])
    };
    vec![alpha, beta]
}

pub(crate) fn parse_gtr_parameters(model_params: &[f64]) -> Result<Vec<f64>> {
    if model_params.len() != 6 {
        bail!(
            "{} parameters for the GTR model, expected 6, got {}",
            if model_params.len() < 6 {
                "Not enough"
            } else {
                "Too many"
            },
            model_params.len()
        );
    }
    Ok(model_params.to_vec())
}

/// Symmetric exchangeability matrix for the given model, nucleotides ordered `ACGT`.
pub(crate) fn exchangeabilities(model_type: ModelType, params: &[f64]) -> SubstMatrix {
    let n = model_type.state_count();
    let mut r = SubstMatrix::from_element(n, n, 1.0);
    let mut set = |i: usize, j: usize, value: f64| {
        r[(i, j)] = value;
        r[(j, i)] = value;
    };
    match model_type {
        ModelType::JC69 | ModelType::Binary => {}
        ModelType::K80 | ModelType::HKY => {
            let (alpha, beta) = (params[0], params[1]);
            set(A, C, beta);
            set(A, T, beta);
            set(C, G, beta);
            set(G, T, beta);
            set(A, G, alpha);
            set(C, T, alpha);
        }
        ModelType::GTR => {
            set(T, C, params[0]);
            set(T, A, params[1]);
            set(T, G, params[2]);
            set(C, A, params[3]);
            set(C, G, params[4]);
            set(A, G, params[5]);
        }
    }
    r.fill_diagonal(0.0);
    r
}
