use approx::assert_relative_eq;
use rstest::*;

use crate::alphabets::{binary_alphabet, dna_alphabet};
use crate::ancestral::{AncestralStateReconstructor, JumpRegister, MarkovJumps};
use crate::config::{ConfigurationError, LikelihoodConfigBuilder};
use crate::likelihood::{TreeEvent, TreeLikelihood, TreeLikelihoodBuilder};
use crate::patterns::Patterns;
use crate::site_models::DiscreteRates;
use crate::substitution_models::{binary, jc69};
use crate::tree;
use crate::tree::TreeTopology;

const THREE_TAXA: &str = "((A:1,B:1):1,C:2);";
const FIVE_TAXA: &str = "(((A:0.1,B:0.2):0.3,C:0.4):0.2,(D:0.3,E:0.1):0.5);";

fn binary_likelihood(newick: &str, states: &[Vec<usize>]) -> TreeLikelihood {
    let taxa = ["A", "B", "C", "D", "E"][..states.len()]
        .iter()
        .map(|t| t.to_string())
        .collect();
    let data = Patterns::from_states(taxa, states, binary_alphabet()).unwrap();
    TreeLikelihood::new(tree!(newick), data, binary(None).unwrap(), Default::default()).unwrap()
}

fn dna_likelihood(states: &[Vec<usize>]) -> TreeLikelihood {
    let taxa = ["A", "B", "C", "D", "E"].iter().map(|t| t.to_string()).collect();
    let data = Patterns::from_states(taxa, states, dna_alphabet()).unwrap();
    TreeLikelihood::new(tree!(FIVE_TAXA), data, jc69().unwrap(), Default::default()).unwrap()
}

fn five_taxa_dna() -> Vec<Vec<usize>> {
    vec![
        vec![0, 1, 2, 3, 0],
        vec![0, 1, 2, 2, 1],
        vec![0, 3, 2, 0, 1],
        vec![1, 3, 0, 0, 1],
        vec![1, 3, 0, 1, 2],
    ]
}

#[test]
fn tips_keep_observed_states() {
    let data = five_taxa_dna();
    let mut reconstructor = AncestralStateReconstructor::new(dna_likelihood(&data), 7).unwrap();
    for tip in 0..5 {
        let taxon = reconstructor.likelihood().tip_taxon(tip);
        let observed = reconstructor.likelihood().patterns().states(taxon).to_vec();
        assert_eq!(reconstructor.states(tip).unwrap(), observed.as_slice());
    }
}

#[test]
fn map_reconstruction_ignores_seed() {
    let data = five_taxa_dna();
    let mut first = AncestralStateReconstructor::new(dna_likelihood(&data), 1)
        .unwrap()
        .with_map(true);
    let mut second = AncestralStateReconstructor::new(dna_likelihood(&data), 99)
        .unwrap()
        .with_map(true);
    for node in 0..9 {
        assert_eq!(
            first.states(node).unwrap().to_vec(),
            second.states(node).unwrap().to_vec()
        );
    }
    assert_eq!(
        first.joint_log_density().unwrap(),
        second.joint_log_density().unwrap()
    );
}

#[test]
fn sampling_is_reproducible_with_seed() {
    let data = five_taxa_dna();
    let draw = |seed| {
        let mut reconstructor =
            AncestralStateReconstructor::new(dna_likelihood(&data), seed).unwrap();
        (5..9)
            .map(|node| reconstructor.states(node).unwrap().to_vec())
            .collect::<Vec<_>>()
    };
    assert_eq!(draw(42), draw(42));
}

#[test]
fn map_on_constant_data() {
    let likelihood = binary_likelihood(THREE_TAXA, &[vec![0], vec![0], vec![0]]);
    let mut reconstructor = AncestralStateReconstructor::new(likelihood, 0)
        .unwrap()
        .with_map(true);
    for node in 0..5 {
        assert_eq!(reconstructor.states(node).unwrap(), &[0]);
    }
    let same = |t: f64| 0.5 + 0.5 * (-2.0 * t).exp();
    let expected = 0.5f64.ln() + 3.0 * same(1.0).ln() + same(2.0).ln();
    assert_relative_eq!(
        reconstructor.joint_log_density().unwrap(),
        expected,
        epsilon = 1e-12
    );
    assert_eq!(reconstructor.site_states(3).unwrap(), "0");
}

#[test]
fn ambiguous_tips_are_resampled_among_compatible_states() {
    let r = dna_alphabet().code(b'R').unwrap();
    let n = dna_alphabet().code(b'N').unwrap();
    let mut data = five_taxa_dna();
    data[2] = vec![r, r, n, r, r];
    for seed in 0..20 {
        let mut reconstructor =
            AncestralStateReconstructor::new(dna_likelihood(&data), seed).unwrap();
        let states = reconstructor.states(2).unwrap().to_vec();
        let taxon = reconstructor.likelihood().tip_taxon(2);
        let codes = reconstructor.likelihood().patterns().states(taxon).to_vec();
        for (state, code) in states.iter().zip(codes) {
            assert!(*state < 4);
            if code == r {
                assert!(*state == 0 || *state == 2);
            }
        }
    }
}

#[test]
fn states_are_redrawn_after_recomputation() {
    let data = five_taxa_dna();
    let mut reconstructor = AncestralStateReconstructor::new(dna_likelihood(&data), 3).unwrap();
    assert!(!reconstructor.states_are_drawn());
    reconstructor.states(6).unwrap();
    assert!(reconstructor.states_are_drawn());
    reconstructor.log_likelihood().unwrap();
    assert!(reconstructor.states_are_drawn());

    reconstructor
        .likelihood_mut()
        .update_tree(TreeEvent::NodeChanged(0), |tree| {
            tree.set_node_height(0, 0.05);
            Ok(())
        })
        .unwrap();
    assert!(!reconstructor.states_are_drawn());
    reconstructor.log_likelihood().unwrap();
    assert!(!reconstructor.states_are_drawn());
    reconstructor.states(6).unwrap();
    assert!(reconstructor.states_are_drawn());
}

#[test]
fn rejected_proposal_restores_draw() {
    let data = five_taxa_dna();
    let mut reconstructor = AncestralStateReconstructor::new(dna_likelihood(&data), 11).unwrap();
    let before: Vec<Vec<usize>> = (0..9)
        .map(|node| reconstructor.states(node).unwrap().to_vec())
        .collect();
    let density = reconstructor.joint_log_density().unwrap();

    reconstructor.store_state();
    reconstructor
        .likelihood_mut()
        .update_branch_rates(None, |rates| rates.set_branch_rate(None, 3.0))
        .unwrap();
    reconstructor.redraw().unwrap();
    reconstructor.restore_state().unwrap();

    assert!(reconstructor.states_are_drawn());
    for (node, states) in before.iter().enumerate() {
        assert_eq!(reconstructor.states(node).unwrap(), states.as_slice());
    }
    assert_eq!(reconstructor.joint_log_density().unwrap(), density);
    assert!(reconstructor.restore_state().is_err());
}

#[test]
fn rate_categories_rejected() {
    let data = Patterns::from_states(
        vec!["A".to_string(), "B".to_string(), "C".to_string()],
        &[vec![0], vec![0], vec![1]],
        binary_alphabet(),
    )
    .unwrap();
    let likelihood = TreeLikelihoodBuilder::new(tree!(THREE_TAXA), data)
        .substitution_model(binary(None).unwrap())
        .site_model(DiscreteRates::new(&[0.5, 1.5], &[0.5, 0.5]).unwrap())
        .build()
        .unwrap();
    let res = AncestralStateReconstructor::new(likelihood, 0);
    assert!(res
        .unwrap_err()
        .downcast_ref::<ConfigurationError>()
        .is_some());
}

#[test]
fn zero_likelihood_cannot_be_sampled() {
    let likelihood = binary_likelihood(THREE_TAXA, &[vec![0], vec![0], vec![1]]);
    let mut reconstructor = AncestralStateReconstructor::new(likelihood, 0).unwrap();
    reconstructor
        .likelihood_mut()
        .update_site_model(|site_model| {
            site_model.set_mu(f64::NAN);
            Ok(())
        })
        .unwrap();
    assert!(reconstructor.states(3).is_err());
}

#[rstest]
#[case(0.1)]
#[case(0.7)]
#[case(2.5)]
fn two_state_jump_counts(#[case] t: f64) {
    let model = binary(None).unwrap();
    let jumps = MarkovJumps::all_substitutions("all", 2);
    let counts = jumps.conditional_expectations(&model, t);
    assert_relative_eq!(counts[(0, 0)], t * t.tanh(), max_relative = 1e-9);
    assert_relative_eq!(counts[(1, 1)], t * t.tanh(), max_relative = 1e-9);
    assert_relative_eq!(counts[(0, 1)], t / t.tanh(), max_relative = 1e-9);
    assert_relative_eq!(counts[(1, 0)], t / t.tanh(), max_relative = 1e-9);

    let joint = jumps.joint_expectations(&model, t);
    for a in 0..2 {
        assert_relative_eq!(joint.row(a).sum(), t, max_relative = 1e-9);
    }
}

#[test]
fn directed_jumps_split_total() {
    let model = binary(None).unwrap();
    let t = 1.3;
    let up = MarkovJumps::state_to_state("up", 2, 0, 1).unwrap();
    let down = MarkovJumps::state_to_state("down", 2, 1, 0).unwrap();
    let all = MarkovJumps::all_substitutions("all", 2);
    let sum = up.conditional_expectations(&model, t) + down.conditional_expectations(&model, t);
    let total = all.conditional_expectations(&model, t);
    for (s, a) in sum.iter().zip(total.iter()) {
        assert_relative_eq!(*s, *a, max_relative = 1e-9);
    }
    let ends_up = up.conditional_expectations(&model, t);
    let ends_down = down.conditional_expectations(&model, t);
    assert_relative_eq!(ends_up[(0, 1)] - ends_down[(0, 1)], 1.0, epsilon = 1e-9);
    assert!(MarkovJumps::state_to_state("self", 2, 1, 1).is_err());
}

#[test]
fn rewards_measure_time_in_state() {
    let model = binary(None).unwrap();
    let t = 0.8;
    let time_in_zero = MarkovJumps::rewards("time0", &[1.0, 0.0]);
    assert_matches::assert_matches!(time_in_zero.register(), JumpRegister::Rewards(_));
    let expected = time_in_zero.conditional_expectations(&model, t);
    assert_relative_eq!(expected[(0, 1)], t / 2.0, max_relative = 1e-9);
    assert_relative_eq!(expected[(0, 0)] + expected[(1, 1)], t, max_relative = 1e-9);
}

#[test]
fn jump_counts_follow_reconstructed_states() {
    let likelihood = binary_likelihood(THREE_TAXA, &[vec![0], vec![0], vec![0]]);
    let mut reconstructor = AncestralStateReconstructor::new(likelihood, 0)
        .unwrap()
        .with_map(true)
        .with_markov_jumps(MarkovJumps::all_substitutions("all", 2))
        .unwrap();
    let root = reconstructor.likelihood().tree().root();
    assert_eq!(reconstructor.expected_jumps(0, root).unwrap(), &[0.0]);
    assert_relative_eq!(
        reconstructor.expected_jumps(0, 0).unwrap()[0],
        1f64.tanh(),
        max_relative = 1e-9
    );
    assert_relative_eq!(
        reconstructor.total_expected_jumps(0).unwrap()[0],
        3.0 * 1f64.tanh() + 2.0 * 2f64.tanh(),
        max_relative = 1e-9
    );
    assert!(reconstructor.expected_jumps(1, 0).is_err());
}

#[test]
fn jump_register_must_match_states() {
    let likelihood = binary_likelihood(THREE_TAXA, &[vec![0], vec![0], vec![1]]);
    let res = AncestralStateReconstructor::new(likelihood, 0)
        .unwrap()
        .with_markov_jumps(MarkovJumps::all_substitutions("all", 4));
    assert!(res
        .unwrap_err()
        .downcast_ref::<ConfigurationError>()
        .is_some());
}

#[test]
fn reconstruction_with_tip_partials() {
    let data = five_taxa_dna();
    let taxa = ["A", "B", "C", "D", "E"].iter().map(|t| t.to_string()).collect();
    let patterns = Patterns::from_states(taxa, &data, dna_alphabet()).unwrap();
    let likelihood = TreeLikelihoodBuilder::new(tree!(FIVE_TAXA), patterns)
        .substitution_model(jc69().unwrap())
        .config(LikelihoodConfigBuilder::new().use_ambiguities(true).build())
        .build()
        .unwrap();
    let mut with_partials = AncestralStateReconstructor::new(likelihood, 5)
        .unwrap()
        .with_map(true);
    let mut with_states = AncestralStateReconstructor::new(dna_likelihood(&data), 5)
        .unwrap()
        .with_map(true);
    for node in 0..9 {
        assert_eq!(
            with_partials.states(node).unwrap().to_vec(),
            with_states.states(node).unwrap().to_vec()
        );
    }
}
