use crate::cli_common::*;

use mung::integration::integrate_datasets;
use mung::projection::project_datasets;

#[derive(Args, Debug)]
pub struct IntegrateArgs {
    #[arg(
        long,
        short = 'd',
        num_args = 2..,
        required = true,
        help = "Data files, one per batch (cells × features)",
        long_help = "Normalised cells × features matrices, tab or comma\n\
		     delimited, optionally gzipped. The first line names the\n\
		     features and the first column names the cells.\n\
		     Each file is one batch, named after the file."
    )]
    data_files: Vec<Box<str>>,

    #[command(flatten)]
    anchor: AnchorArgs,

    #[arg(
        long,
        short = 'o',
        required = true,
        help = "Output file prefix",
        long_help = "Output file prefix.\n\n\
		     Generates:\n\
		     - {out}.corrected.tsv.gz: corrected embedding (cells × components)\n\
		     - {out}.cells.tsv.gz: cell and batch of each row\n\
		     - {out}.run.json: merge order and anchor statistics"
    )]
    out: Box<str>,

    #[command(flatten)]
    runtime: RuntimeArgs,
}

pub fn run_integrate(args: &IntegrateArgs) -> anyhow::Result<()> {
    let interrupt = args.runtime.init()?;
    mkdir(&args.out)?;

    let datasets = args
        .data_files
        .iter()
        .map(|f| read_dataset(f))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let (basis, embeddings) = project_datasets(&datasets.iter().collect::<Vec<_>>(), &args.anchor.projection_config())?;

    let config = args.anchor.integration_config();
    let result = integrate_datasets(&embeddings.iter().collect::<Vec<_>>(), &config, &interrupt)?;

    let corrected = result.corrected_in_input_order("corrected")?;
    write_embedding(&corrected, &format!("{}.corrected.tsv.gz", args.out))?;
    write_cell_batches(&result.per_dataset, &format!("{}.cells.tsv.gz", args.out))?;

    #[derive(serde::Serialize)]
    struct Record<'a> {
        batches: Vec<&'a str>,
        basis: mung::embedding::BasisId,
        config: &'a mung::integration::IntegrationConfig,
        integration: &'a mung::integration::IntegrationReport,
    }

    write_json(
        &Record {
            batches: datasets.iter().map(|d| d.batch()).collect(),
            basis: basis.id,
            config: &config,
            integration: &result.report,
        },
        &format!("{}.run.json", args.out),
    )?;

    Ok(())
}

/// `cell<TAB>batch` per corrected row
pub fn write_cell_batches(per_dataset: &[Embedding], file: &str) -> anyhow::Result<()> {
    let lines: Vec<Box<str>> = per_dataset
        .iter()
        .flat_map(|e| {
            e.cell_ids()
                .iter()
                .map(move |c| format!("{}\t{}", c, e.batch()).into_boxed_str())
        })
        .collect();
    write_lines(&lines, file)
}
