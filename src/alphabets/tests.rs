use rstest::rstest;

use crate::alphabets::{alphabet_from_name, binary_alphabet, dna_alphabet};

#[rstest]
#[case(b'A', 0)]
#[case(b'c', 1)]
#[case(b'G', 2)]
#[case(b't', 3)]
#[case(b'-', 4)]
#[case(b'N', 4)]
#[case(b'?', 4)]
fn dna_codes(#[case] char: u8, #[case] code: usize) {
    assert_eq!(dna_alphabet().code(char), Some(code));
}

#[test]
fn dna_ambiguity_sets() {
    let dna = dna_alphabet();
    let r = dna.code(b'R').unwrap();
    assert!(dna.is_ambiguous(r));
    assert!(!dna.is_unknown(r));
    assert_eq!(dna.state_set(r), [true, false, true, false]);
    let h = dna.code(b'H').unwrap();
    assert_eq!(dna.state_set(h), [true, true, false, true]);
    assert_eq!(dna.symbol(r), b'R');
    assert_eq!(dna.state_set(dna.unknown_state()), [true; 4]);
}

#[test]
fn char_encoding_matches_state_set() {
    let dna = dna_alphabet();
    let y = dna.code(b'Y').unwrap();
    assert_eq!(dna.char_encoding(y).as_slice(), &[0.0, 1.0, 0.0, 1.0]);
    assert_eq!(dna.char_encoding(2).as_slice(), &[0.0, 0.0, 1.0, 0.0]);
}

#[test]
fn invalid_characters_rejected() {
    assert_eq!(dna_alphabet().code(b'Z'), None);
    assert!(!dna_alphabet().is_word(b"ACGZ"));
    assert!(dna_alphabet().is_word(b"ACG-RN"));
    assert_eq!(binary_alphabet().code(b'A'), None);
}

#[test]
fn binary_alphabet_codes() {
    let binary = binary_alphabet();
    assert_eq!(binary.state_count(), 2);
    assert_eq!(binary.code(b'1'), Some(1));
    assert_eq!(binary.code(b'-'), Some(2));
    assert_eq!(binary.code_count(), 3);
}

#[test]
fn alphabet_lookup_by_name() {
    assert_eq!(alphabet_from_name("DNA"), Some(dna_alphabet()));
    assert_eq!(alphabet_from_name("binary"), Some(binary_alphabet()));
    assert_eq!(alphabet_from_name("protein"), None);
}
