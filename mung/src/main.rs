mod cli_common;
mod run_cluster;
mod run_integrate;
mod run_transfer;

use cli_common::*;
use run_cluster::*;
use run_integrate::*;
use run_transfer::*;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "MUNG",
    long_about = "Mutual-neighbour Unified Graph integration of single-cell batches\n\
		  Data files are cells × features text matrices (tsv/csv, optionally gzipped)\n\
		  with feature names on the first line and cell names in the first column."
)]
struct Cli {
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Integrate batches into one corrected embedding",
        long_about = "Integrate batches in three stages: \n\
		      (1) Project every batch onto a pooled PCA basis\n\
		      (2) Find anchors (mutual nearest neighbours with consistent neighbourhoods)\n\
		      (3) Correct each batch towards the merged reference, largest batch first.\n"
    )]
    Integrate(IntegrateArgs),

    #[command(
        about = "Integrate batches and cluster the corrected cells",
        long_about = "Integrate batches as in `integrate`, then build a\n\
		      shared-nearest-neighbour graph of the corrected cells\n\
		      and detect communities (Louvain or Leiden).\n"
    )]
    Cluster(ClusterArgs),

    #[command(
        about = "Transfer labels from an annotated reference to a query",
        long_about = "Find anchors between the reference and the query and\n\
		      predict each query cell's label by an anchor-weighted vote.\n",
        visible_alias = "annotate"
    )]
    Transfer(TransferArgs),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.commands {
        Commands::Integrate(args) => {
            run_integrate(args)?;
        }
        Commands::Cluster(args) => {
            run_cluster(args)?;
        }
        Commands::Transfer(args) => {
            run_transfer(args)?;
        }
    }

    info!("Done");
    Ok(())
}
