use std::path::PathBuf;

use clap::Parser;

use treelik::config::RescalingScheme;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub(super) struct Cli {
    /// Tree file in newick format
    #[arg(short, long, value_name = "TREE_FILE")]
    pub(super) tree: PathBuf,

    /// Sequence file in fasta format
    #[arg(short, long, value_name = "SEQ_FILE")]
    pub(super) sequences: PathBuf,

    /// Substitution model: jc69, k80, hky, gtr or binary
    #[arg(short, long, value_name = "MODEL", default_value = "jc69")]
    pub(super) model: String,

    /// Substitution model parameters, e.g. alpha and beta for k80
    #[arg(short = 'p', long, value_name = "MODEL_PARAMS", num_args = 1..)]
    pub(super) params: Vec<f64>,

    /// Stationary frequencies, equal if omitted
    #[arg(short, long, value_name = "FREQS", num_args = 1..)]
    pub(super) freqs: Vec<f64>,

    /// Number of rate categories
    #[arg(short, long, value_name = "K", default_value_t = 1)]
    pub(super) categories: usize,

    /// Rate of every category
    #[arg(short, long, value_name = "RATES", num_args = 1..)]
    pub(super) rates: Vec<f64>,

    /// Proportion of sites in every category
    #[arg(short, long, value_name = "WEIGHTS", num_args = 1..)]
    pub(super) weights: Vec<f64>,

    /// Rescaling scheme: none, always, dynamic, delayed or auto
    #[arg(long, value_name = "SCHEME", default_value_t = RescalingScheme::Dynamic)]
    pub(super) rescaling: RescalingScheme,

    /// Evaluations between rescaled evaluations for the dynamic scheme
    #[arg(long, value_name = "N", default_value_t = 100)]
    pub(super) rescale_frequency: usize,

    /// Do not wait for the first underflow before rescaling
    #[arg(long)]
    pub(super) no_delay: bool,

    /// Use tip partials so ambiguous characters keep their state sets
    #[arg(short, long)]
    pub(super) ambiguities: bool,

    /// Sample ancestral states after evaluating the likelihood
    #[arg(long)]
    pub(super) reconstruct: bool,

    /// Report the most probable ancestral states instead of sampling them
    #[arg(long, requires = "reconstruct")]
    pub(super) map: bool,

    /// Fasta file for the reconstructed ancestral sequences, printed if omitted
    #[arg(short, long, value_name = "OUTPUT_FILE", requires = "reconstruct")]
    pub(super) output: Option<PathBuf>,

    /// Seed of the ancestral state sampler
    #[arg(long, value_name = "SEED", default_value_t = 0)]
    pub(super) seed: u64,

    /// Log debug messages
    #[arg(short, long)]
    pub(super) verbose: bool,
}
