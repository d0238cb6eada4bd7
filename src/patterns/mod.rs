use anyhow::bail;
use bio::io::fasta::Record;
use hashbrown::HashMap;
use log::info;

use crate::alphabets::Alphabet;
use crate::io::DataError;
use crate::Result;

/// Alignment compressed into its distinct columns.
///
/// `states[taxon][pattern]` holds the state code of a taxon in a pattern, codes at or above the
/// state count mark ambiguous characters. Each pattern carries the number of sites it stands for.
#[derive(Debug, Clone, PartialEq)]
pub struct Patterns {
    alphabet: &'static Alphabet,
    taxa: Vec<String>,
    states: Vec<Vec<usize>>,
    weights: Vec<f64>,
    site_patterns: Vec<usize>,
}

impl Patterns {
    pub fn from_records(records: &[Record], alphabet: &'static Alphabet) -> Result<Self> {
        if records.is_empty() {
            bail!(DataError {
                message: String::from("No sequences to build site patterns from.")
            });
        }
        let site_count = records[0].seq().len();
        let mut columns = Vec::with_capacity(records.len());
        for rec in records {
            if rec.seq().len() != site_count {
                bail!(DataError {
                    message: format!(
                        "Sequence {} has {} sites, expected {}.",
                        rec.id(),
                        rec.seq().len(),
                        site_count
                    )
                });
            }
            let mut codes = Vec::with_capacity(site_count);
            for &char in rec.seq() {
                match alphabet.code(char) {
                    Some(code) => codes.push(code),
                    None => bail!(DataError {
                        message: format!(
                            "Invalid character {} in sequence {} for the {} alphabet.",
                            char as char,
                            rec.id(),
                            alphabet
                        )
                    }),
                }
            }
            columns.push(codes);
        }
        let taxa = records.iter().map(|rec| rec.id().to_string()).collect();
        Self::compress(taxa, &columns, alphabet)
    }

    /// Builds patterns from per-taxon state codes, one code per site.
    pub fn from_states(
        taxa: Vec<String>,
        sequences: &[Vec<usize>],
        alphabet: &'static Alphabet,
    ) -> Result<Self> {
        if taxa.len() != sequences.len() || sequences.is_empty() {
            bail!(DataError {
                message: format!(
                    "Got {} taxon names for {} sequences.",
                    taxa.len(),
                    sequences.len()
                )
            });
        }
        let site_count = sequences[0].len();
        if sequences.iter().any(|seq| seq.len() != site_count) {
            bail!(DataError {
                message: String::from("All sequences must have the same number of sites.")
            });
        }
        if let Some(&code) = sequences.iter().flatten().find(|&&c| c >= alphabet.code_count()) {
            bail!(DataError {
                message: format!("State code {} is not part of the {} alphabet.", code, alphabet)
            });
        }
        Self::compress(taxa, sequences, alphabet)
    }

    fn compress(
        taxa: Vec<String>,
        sequences: &[Vec<usize>],
        alphabet: &'static Alphabet,
    ) -> Result<Self> {
        let site_count = sequences[0].len();
        let mut index = HashMap::<Vec<usize>, usize>::with_capacity(site_count);
        let mut states = vec![Vec::new(); taxa.len()];
        let mut weights = Vec::new();
        let mut site_patterns = Vec::with_capacity(site_count);
        for site in 0..site_count {
            let column: Vec<usize> = sequences.iter().map(|seq| seq[site]).collect();
            let pattern = match index.get(&column) {
                Some(&pattern) => {
                    weights[pattern] += 1.0;
                    pattern
                }
                None => {
                    let pattern = weights.len();
                    for (taxon_states, &code) in states.iter_mut().zip(column.iter()) {
                        taxon_states.push(code);
                    }
                    weights.push(1.0);
                    index.insert(column, pattern);
                    pattern
                }
            };
            site_patterns.push(pattern);
        }
        info!(
            "Compressed {} sites of {} taxa into {} patterns.",
            site_count,
            taxa.len(),
            weights.len()
        );
        Ok(Patterns {
            alphabet,
            taxa,
            states,
            weights,
            site_patterns,
        })
    }

    pub fn alphabet(&self) -> &'static Alphabet {
        self.alphabet
    }

    pub fn state_count(&self) -> usize {
        self.alphabet.state_count()
    }

    pub fn pattern_count(&self) -> usize {
        self.weights.len()
    }

    pub fn taxon_count(&self) -> usize {
        self.taxa.len()
    }

    pub fn site_count(&self) -> usize {
        self.site_patterns.len()
    }

    pub fn taxa(&self) -> &[String] {
        &self.taxa
    }

    pub fn taxon_index(&self, id: &str) -> Option<usize> {
        self.taxa.iter().position(|taxon| taxon == id)
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Pattern each alignment site was compressed into.
    pub fn site_patterns(&self) -> &[usize] {
        &self.site_patterns
    }

    pub fn states(&self, taxon: usize) -> &[usize] {
        &self.states[taxon]
    }

    pub(crate) fn set_states(&mut self, taxon: usize, states: &[usize]) -> Result<()> {
        if states.len() != self.pattern_count() {
            bail!(DataError {
                message: format!(
                    "Expected {} states for taxon {}, got {}.",
                    self.pattern_count(),
                    self.taxa[taxon],
                    states.len()
                )
            });
        }
        if let Some(&code) = states.iter().find(|&&c| c >= self.alphabet.code_count()) {
            bail!(DataError {
                message: format!("State code {} is not part of the {} alphabet.", code, self.alphabet)
            });
        }
        self.states[taxon] = states.to_vec();
        Ok(())
    }

    /// Tip partials laid out pattern by pattern, with every compatible state set to one.
    pub fn tip_partials(&self, taxon: usize) -> Vec<f64> {
        let n = self.state_count();
        let mut partials = Vec::with_capacity(self.pattern_count() * n);
        for &code in &self.states[taxon] {
            partials.extend(
                self.alphabet
                    .state_set(code)
                    .into_iter()
                    .map(|compatible| if compatible { 1.0 } else { 0.0 }),
            );
        }
        partials
    }
}
