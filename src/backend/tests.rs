use approx::assert_relative_eq;
use rstest::*;

use crate::assert_float_relative_slice_eq;
use crate::backend::{BackendShape, ComputeBackend, CpuBackend, PartialsOperation};
use crate::config::{ConfigurationError, ResourceSelection};
use crate::substitution_models::{binary, SubstitutionModel};

fn cherry_shape(category_count: usize) -> BackendShape {
    BackendShape {
        tip_count: 2,
        partials_buffer_count: 3,
        compact_buffer_count: 2,
        state_count: 2,
        pattern_count: 2,
        eigen_buffer_count: 1,
        matrix_buffer_count: 3,
        category_count,
        scale_buffer_count: 2,
    }
}

fn cherry_backend(rates: &[f64], weights: &[f64]) -> CpuBackend {
    let model = binary(None).unwrap();
    let mut backend =
        CpuBackend::create(cherry_shape(rates.len()), &ResourceSelection::cpu()).unwrap();
    backend
        .set_eigen_decomposition(0, model.eigen_decomposition())
        .unwrap();
    backend.set_category_rates(rates).unwrap();
    backend.set_category_weights(weights).unwrap();
    backend.set_state_frequencies(&[0.5, 0.5]).unwrap();
    backend.set_pattern_weights(&[1.0, 1.0]).unwrap();
    backend.set_tip_states(0, &[0, 1]).unwrap();
    backend.set_tip_states(1, &[0, 0]).unwrap();
    backend
        .update_transition_matrices(0, &[0, 1], &[0.5, 0.5])
        .unwrap();
    backend
}

fn cherry_op(scale_write: Option<usize>, scale_read: Option<usize>) -> PartialsOperation {
    PartialsOperation {
        destination: 2,
        scale_write,
        scale_read,
        child1: 0,
        matrix1: 0,
        child2: 1,
        matrix2: 1,
    }
}

fn binary_p(t: f64) -> (f64, f64) {
    (0.5 + 0.5 * (-2.0 * t).exp(), 0.5 - 0.5 * (-2.0 * t).exp())
}

#[test]
fn cherry_log_likelihood() {
    let mut backend = cherry_backend(&[1.0], &[1.0]);
    backend.update_partials(&[cherry_op(None, None)]).unwrap();
    let log_likelihood = backend.calculate_root_log_likelihoods(2, None).unwrap();

    let (same, diff) = binary_p(0.5);
    let site0 = 0.5 * (same * same + diff * diff);
    let site1 = 0.5 * (2.0 * same * diff);
    assert_relative_eq!(log_likelihood, site0.ln() + site1.ln(), epsilon = 1e-12);
    let sites = backend.site_log_likelihoods().unwrap();
    assert_relative_eq!(sites[0], site0.ln(), epsilon = 1e-12);
    assert_relative_eq!(sites[1], site1.ln(), epsilon = 1e-12);
}

#[test]
fn pattern_weights_multiply_site_log_likelihoods() {
    let mut backend = cherry_backend(&[1.0], &[1.0]);
    backend.set_pattern_weights(&[3.0, 2.0]).unwrap();
    backend.update_partials(&[cherry_op(None, None)]).unwrap();
    let log_likelihood = backend.calculate_root_log_likelihoods(2, None).unwrap();
    let sites = backend.site_log_likelihoods().unwrap();
    assert_relative_eq!(log_likelihood, 3.0 * sites[0] + 2.0 * sites[1], epsilon = 1e-12);
}

#[test]
fn scaling_leaves_log_likelihood_unchanged() {
    let mut unscaled = cherry_backend(&[1.0], &[1.0]);
    unscaled.update_partials(&[cherry_op(None, None)]).unwrap();
    let expected = unscaled.calculate_root_log_likelihoods(2, None).unwrap();

    let mut scaled = cherry_backend(&[1.0], &[1.0]);
    scaled.update_partials(&[cherry_op(Some(0), None)]).unwrap();
    scaled.reset_scale_factors(1).unwrap();
    scaled.accumulate_scale_factors(&[0], Some(1)).unwrap();
    let log_likelihood = scaled.calculate_root_log_likelihoods(2, Some(1)).unwrap();
    assert_relative_eq!(log_likelihood, expected, epsilon = 1e-12);

    let partials = scaled.get_partials(2, None).unwrap();
    assert_relative_eq!(partials[0].max(partials[1]), 1.0);
    assert_float_relative_slice_eq(
        &scaled.get_partials(2, Some(1)).unwrap(),
        &unscaled.get_partials(2, None).unwrap(),
        1e-12,
    );
}

#[test]
fn reading_scale_factors_applies_stored_ones() {
    let mut backend = cherry_backend(&[1.0], &[1.0]);
    backend.update_partials(&[cherry_op(Some(0), None)]).unwrap();
    let written = backend.get_partials(2, None).unwrap();
    backend.update_partials(&[cherry_op(None, Some(0))]).unwrap();
    let read = backend.get_partials(2, None).unwrap();
    assert_float_relative_slice_eq(&read, &written, 1e-12);
}

#[test]
fn unknown_state_contributes_one() {
    let mut backend = cherry_backend(&[1.0], &[1.0]);
    backend.set_tip_states(0, &[2, 2]).unwrap();
    backend.set_tip_states(1, &[0, 1]).unwrap();
    backend.update_partials(&[cherry_op(None, None)]).unwrap();
    backend.calculate_root_log_likelihoods(2, None).unwrap();
    let sites = backend.site_log_likelihoods().unwrap();
    assert_relative_eq!(sites[0], 0.5f64.ln(), epsilon = 1e-12);
    assert_relative_eq!(sites[1], 0.5f64.ln(), epsilon = 1e-12);
}

#[test]
fn tip_partials_match_tip_states() {
    let mut states = cherry_backend(&[1.0], &[1.0]);
    states.update_partials(&[cherry_op(None, None)]).unwrap();
    let expected = states.calculate_root_log_likelihoods(2, None).unwrap();

    let model = binary(None).unwrap();
    let mut partials = CpuBackend::create(cherry_shape(1), &ResourceSelection::cpu()).unwrap();
    partials
        .set_eigen_decomposition(0, model.eigen_decomposition())
        .unwrap();
    partials.set_category_rates(&[1.0]).unwrap();
    partials.set_state_frequencies(&[0.5, 0.5]).unwrap();
    partials
        .set_tip_partials(0, &[1.0, 0.0, 0.0, 1.0])
        .unwrap();
    partials
        .set_tip_partials(1, &[1.0, 0.0, 1.0, 0.0])
        .unwrap();
    partials
        .update_transition_matrices(0, &[0, 1], &[0.5, 0.5])
        .unwrap();
    partials.update_partials(&[cherry_op(None, None)]).unwrap();
    let log_likelihood = partials.calculate_root_log_likelihoods(2, None).unwrap();
    assert_relative_eq!(log_likelihood, expected, epsilon = 1e-12);
}

#[test]
fn categories_are_averaged() {
    let mut backend = cherry_backend(&[0.5, 1.5], &[0.25, 0.75]);
    backend.update_partials(&[cherry_op(None, None)]).unwrap();
    backend.calculate_root_log_likelihoods(2, None).unwrap();
    let sites = backend.site_log_likelihoods().unwrap();

    let site0 = |t: f64| {
        let (same, diff) = binary_p(t);
        0.5 * (same * same + diff * diff)
    };
    let expected = 0.25 * site0(0.25) + 0.75 * site0(0.75);
    assert_relative_eq!(sites[0], expected.ln(), epsilon = 1e-12);
    assert_eq!(backend.get_partials(2, None).unwrap().len(), 2 * 2 * 2);
}

#[test]
fn convolution_composes_matrices() {
    let mut backend = cherry_backend(&[1.0, 2.0], &[0.5, 0.5]);
    backend
        .update_transition_matrices(0, &[0, 1], &[0.2, 0.3])
        .unwrap();
    backend.convolve_transition_matrices(&[0], &[1], &[2]).unwrap();
    backend.update_transition_matrices(0, &[1], &[0.5]).unwrap();
    for c in 0..2 {
        assert_relative_eq!(
            backend.get_transition_matrix(2, c).unwrap(),
            backend.get_transition_matrix(1, c).unwrap(),
            epsilon = 1e-12
        );
    }
    backend.convolve_transition_matrices(&[0], &[2], &[0]).unwrap();
    backend.update_transition_matrices(0, &[1], &[0.7]).unwrap();
    assert_relative_eq!(
        backend.get_transition_matrix(0, 1).unwrap(),
        backend.get_transition_matrix(1, 1).unwrap(),
        epsilon = 1e-12
    );
}

#[test]
fn zero_likelihood_gives_negative_infinity() {
    let mut backend = cherry_backend(&[1.0], &[1.0]);
    backend.set_tip_partials(0, &[0.0; 4]).unwrap();
    backend.update_partials(&[cherry_op(None, None)]).unwrap();
    let log_likelihood = backend.calculate_root_log_likelihoods(2, None).unwrap();
    assert_eq!(log_likelihood, f64::NEG_INFINITY);
}

#[rstest]
#[case::no_states(BackendShape { state_count: 1, ..cherry_shape(1) })]
#[case::no_patterns(BackendShape { pattern_count: 0, ..cherry_shape(1) })]
#[case::no_categories(BackendShape { category_count: 0, ..cherry_shape(1) })]
#[case::too_many_compact(BackendShape { compact_buffer_count: 3, ..cherry_shape(1) })]
fn invalid_shapes_rejected(#[case] shape: BackendShape) {
    let res = CpuBackend::create(shape, &ResourceSelection::cpu());
    assert!(res.unwrap_err().downcast_ref::<ConfigurationError>().is_some());
}

#[test]
fn unavailable_resource_falls_back_to_cpu() {
    let backend = CpuBackend::create(
        cherry_shape(1),
        &ResourceSelection {
            preferred: vec![3, 1],
        },
    )
    .unwrap();
    assert_eq!(backend.details().resource_number, 0);
    assert!(!backend.supports_auto_scaling());
    assert_eq!(backend.shape(), &cherry_shape(1));
}

#[test]
fn invalid_calls_rejected() {
    let mut backend = CpuBackend::create(cherry_shape(1), &ResourceSelection::cpu()).unwrap();
    assert!(backend.update_transition_matrices(0, &[0], &[0.1]).is_err());
    assert!(backend.set_tip_states(2, &[0, 0]).is_err());
    assert!(backend.set_tip_states(0, &[0]).is_err());
    assert!(backend.set_category_rates(&[1.0, 2.0]).is_err());
    assert!(backend.update_partials(&[cherry_op(None, None)]).is_err());
    assert!(backend.site_log_likelihoods().is_err());
    assert!(backend.accumulate_scale_factors(&[0], None).is_err());
    assert!(backend.reset_scale_factors(2).is_err());
}
