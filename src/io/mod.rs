use std::error::Error;
use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::bail;
use bio::io::fasta::{Reader, Record, Writer};
use log::info;

use crate::alphabets::{Alphabet, GAP, POSSIBLE_GAPS};
use crate::tree::{tree_parser, Tree};
use crate::Result;

pub struct DataError {
    pub(crate) message: String,
}

impl fmt::Debug for DataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for DataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Error for DataError {}

/// Reads sequences from a fasta file, returning a vector of fasta records.
/// All sequences are converted to uppercase and every gap character becomes `-`.
///
/// # Arguments
/// * `path` - Path to the fasta file.
/// * `alphabet` - Alphabet the sequences have to be written in.
pub fn read_sequences(path: &Path, alphabet: &Alphabet) -> Result<Vec<Record>> {
    info!("Reading sequences from file {}", path.display());
    let reader = Reader::from_file(path)?;
    let mut sequences = Vec::new();

    for result in reader.records() {
        let rec = result?;
        if let Err(e) = rec.check() {
            bail!(DataError {
                message: e.to_string()
            });
        }
        let seq: Vec<u8> = rec
            .seq()
            .to_ascii_uppercase()
            .iter()
            .map(|c| if POSSIBLE_GAPS.contains(c) { GAP } else { *c })
            .collect();

        if !alphabet.is_word(&seq) {
            bail!(DataError {
                message: format!(
                    "Invalid {} sequence encountered for {}: {}",
                    alphabet,
                    rec.id(),
                    String::from_utf8_lossy(&seq)
                )
            });
        }

        sequences.push(Record::with_attrs(rec.id(), rec.desc(), &seq));
    }
    if sequences.is_empty() {
        bail!(DataError {
            message: String::from("No sequences found in file")
        });
    }

    info!("Read {} sequences successfully", sequences.len());
    Ok(sequences)
}

/// Reads newick trees from a file, returning a vector of trees.
///
/// Unrooted trees are rooted at the trifurcation. Nodes are renumbered so that tips come first.
pub fn read_newick_from_file(path: &Path) -> Result<Vec<Tree>> {
    info!("Reading newick trees from file {}", path.display());
    let newick = fs::read_to_string(path)?;
    info!("Read file successfully");
    tree_parser::from_newick(&newick)
}

/// Writes one fasta record per reconstructed node, named by its label.
/// Refuses to overwrite an existing file.
pub fn write_reconstruction(path: &Path, nodes: &[(String, String)]) -> Result<()> {
    if path.exists() {
        bail!(DataError {
            message: format!("Output file {} already exists", path.display())
        });
    }
    let mut writer = Writer::to_file(path)?;
    for (label, states) in nodes {
        writer.write(label, None, states.as_bytes())?;
    }
    writer.flush()?;
    info!(
        "Wrote {} reconstructed sequences to {}",
        nodes.len(),
        path.display()
    );
    Ok(())
}
