use approx::assert_relative_eq;

use crate::site_models::{DiscreteRates, SiteRateModel};

#[test]
fn homogeneous_has_single_category() {
    let model = DiscreteRates::homogeneous();
    assert_eq!(model.category_count(), 1);
    assert_eq!(model.category_rates(), Some(vec![1.0]));
    assert_eq!(model.category_proportions(), vec![1.0]);
}

#[test]
fn proportions_normalised() {
    let model = DiscreteRates::new(&[0.5, 1.5], &[1.0, 3.0]).unwrap();
    let proportions = model.category_proportions();
    assert_relative_eq!(proportions[0], 0.25);
    assert_relative_eq!(proportions[1], 0.75);
}

#[test]
fn mu_scales_rates() {
    let mut model = DiscreteRates::new(&[0.5, 1.5], &[0.5, 0.5]).unwrap();
    model.set_mu(2.0);
    assert_eq!(model.mu(), 2.0);
    assert_eq!(model.category_rates(), Some(vec![1.0, 3.0]));
}

#[test]
fn invalid_rates_give_none() {
    let mut model = DiscreteRates::new(&[0.5, 1.5], &[0.5, 0.5]).unwrap();
    model.set_category_rates(&[f64::NAN, 1.0]).unwrap();
    assert_eq!(model.category_rates(), None);
    assert!(model.set_category_rates(&[1.0]).is_err());
}

#[test]
fn invalid_construction() {
    assert!(DiscreteRates::new(&[], &[]).is_err());
    assert!(DiscreteRates::new(&[1.0, 2.0], &[1.0]).is_err());
    assert!(DiscreteRates::new(&[1.0], &[-1.0]).is_err());
}
