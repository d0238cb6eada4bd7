#[macro_export]
macro_rules! record_wo_desc {
    ($e1:expr,$e2:expr) => {{
        use bio::io::fasta::Record;
        Record::with_attrs($e1, None, $e2)
    }};
}

#[macro_export]
macro_rules! record {
    ($e1:expr,$e2:expr,$e3:expr) => {{
        use bio::io::fasta::Record;
        Record::with_attrs($e1, $e2, $e3)
    }};
}

#[macro_export]
macro_rules! tree {
    ($e:expr) => {{
        use $crate::tree::tree_parser::from_newick;
        from_newick($e).unwrap().pop().unwrap()
    }};
}

#[macro_export]
macro_rules! frequencies {
    ($slice:expr) => {{
        use $crate::substitution_models::FreqVector;
        FreqVector::from_column_slice($slice)
    }};
}

#[cfg(test)]
#[cfg_attr(coverage, coverage(off))]
pub mod tests {
    use crate::alphabets::dna_alphabet;
    use crate::patterns::Patterns;
    use crate::tree::TreeTopology;

    #[test]
    fn records_feed_patterns() {
        let records = vec![
            record!("A", Some("first taxon"), b"ACGT"),
            record_wo_desc!("B", b"ACGA"),
        ];
        assert_eq!(records[0].desc(), Some("first taxon"));
        assert_eq!(records[1].desc(), None);
        let patterns = Patterns::from_records(&records, dna_alphabet()).unwrap();
        assert_eq!(patterns.taxa(), &["A", "B"]);
        assert_eq!(patterns.pattern_count(), 4);
    }

    #[test]
    fn tree_from_expression() {
        let newick = format!("(({}:1,B:1):1,C:2);", "A");
        let tree = tree!(&newick);
        assert_eq!(tree.external_node_count(), 3);
        assert_eq!(tree.node_count(), 5);
        assert_eq!(tree.taxon_id(0), Some("A"));
    }

    #[test]
    fn frequencies_sum() {
        let freqs = frequencies!(&[0.1, 0.2, 0.3, 0.4]);
        assert_eq!(freqs.nrows(), 4);
        assert!((freqs.sum() - 1.0).abs() < 1e-12);
    }

    #[test]
    #[allow(non_snake_case)]
    fn macros_are_hygienic() {
        let Record = "not a record";
        fn from_newick() -> usize {
            0
        }
        let _record = record_wo_desc!("A", b"ACGT");
        let _tree = tree!("(A:1,B:1);");
        assert_eq!(Record, "not a record");
        assert_eq!(from_newick(), 0);
    }
}
