use anyhow::{bail, Error};
use clap::Parser;
use ftail::Ftail;
use log::{debug, info, LevelFilter};

use treelik::alphabets::{binary_alphabet, dna_alphabet};
use treelik::ancestral::AncestralStateReconstructor;
use treelik::config::LikelihoodConfigBuilder;
use treelik::io::{read_newick_from_file, read_sequences, write_reconstruction};
use treelik::likelihood::TreeLikelihoodBuilder;
use treelik::patterns::Patterns;
use treelik::site_models::DiscreteRates;
use treelik::substitution_models::{ModelType, ReversibleModel};
use treelik::tree::TreeTopology;

mod cli;
use crate::cli::Cli;

type Result<T> = std::result::Result<T, Error>;

fn site_model(cli: &Cli) -> Result<DiscreteRates> {
    if cli.categories <= 1 && cli.rates.is_empty() {
        return Ok(DiscreteRates::homogeneous());
    }
    if cli.rates.len() != cli.categories {
        bail!(
            "Expected {} category rates, got {}.",
            cli.categories,
            cli.rates.len()
        );
    }
    let weights = if cli.weights.is_empty() {
        vec![1.0; cli.categories]
    } else {
        cli.weights.clone()
    };
    DiscreteRates::new(&cli.rates, &weights)
}

fn main() -> Result<()> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) => {
            bail!("Unable to parse command line arguments: \n {}", error)
        }
    };
    let level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    if let Err(error) = Ftail::new().console(level).init() {
        bail!("Unable to set up logging: {:?}", error)
    }
    info!("Successfully parsed the command line parameters");

    let model_type = ModelType::try_from(cli.model.as_str())?;
    let alphabet = match model_type {
        ModelType::Binary => binary_alphabet(),
        _ => dna_alphabet(),
    };
    let freqs = (!cli.freqs.is_empty()).then_some(cli.freqs.as_slice());
    let model = ReversibleModel::new(model_type, &cli.params, freqs)?;
    let site_model = site_model(&cli)?;

    let records = read_sequences(&cli.sequences, alphabet)?;
    let patterns = Patterns::from_records(&records, alphabet)?;
    let tree = match read_newick_from_file(&cli.tree)?.into_iter().next() {
        Some(tree) => tree,
        None => bail!("No trees found in {}", cli.tree.display()),
    };
    debug!("Tree has {} nodes.", tree.node_count());

    let config = LikelihoodConfigBuilder::new()
        .rescaling(cli.rescaling)
        .rescaling_frequency(cli.rescale_frequency)
        .delay_rescaling_until_underflow(!cli.no_delay)
        .use_ambiguities(cli.ambiguities)
        .build();
    let mut likelihood = TreeLikelihoodBuilder::new(tree, patterns)
        .substitution_model(model)
        .site_model(site_model)
        .config(config)
        .build()?;

    let logl = likelihood.log_likelihood()?;
    info!("Log-likelihood: {}", logl);
    println!("{}", logl);

    if cli.reconstruct {
        let mut reconstructor =
            AncestralStateReconstructor::new(likelihood, cli.seed)?.with_map(cli.map);
        reconstructor.log_states()?;
        let tree_nodes = reconstructor.likelihood().tree().node_count();
        let tips = reconstructor.likelihood().tree().external_node_count();
        let mut ancestors = Vec::with_capacity(tree_nodes - tips);
        for node in tips..tree_nodes {
            ancestors.push((format!("node{}", node), reconstructor.site_states(node)?));
        }
        match &cli.output {
            Some(path) => write_reconstruction(path, &ancestors)?,
            None => {
                for (label, states) in &ancestors {
                    println!(">{}\n{}", label, states);
                }
            }
        }
        info!(
            "Joint log density of the reconstruction: {}",
            reconstructor.joint_log_density()?
        );
    }
    Ok(())
}
