use anyhow::Error;

#[macro_use]
pub mod macros;

pub mod alphabets;
pub mod ancestral;
pub mod backend;
pub mod branch_rates;
pub mod config;
pub mod io;
pub mod likelihood;
pub mod patterns;
pub mod site_models;
pub mod substitution_models;
pub mod tree;

pub type Result<T> = std::result::Result<T, Error>;

pub fn assert_float_relative_slice_eq(actual: &[f64], expected: &[f64], epsilon: f64) {
    use approx::relative_eq;
    assert_eq!(
        actual.len(),
        expected.len(),
        "Must have the same number of entries."
    );
    for (i, (&act, &exp)) in actual.iter().zip(expected.iter()).enumerate() {
        assert!(
            relative_eq!(act, exp, epsilon = epsilon),
            "Entries at position {} do not match, actual: {}, expected: {}",
            i,
            act,
            exp,
        );
    }
}
