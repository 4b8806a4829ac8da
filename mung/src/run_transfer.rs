use crate::cli_common::*;

use mung::pipeline::{annotate, AnnotationConfig, JointSpace};

#[derive(Args, Debug)]
pub struct TransferArgs {
    #[arg(long, required = true, help = "Annotated reference data file (cells × features)")]
    reference: Box<str>,

    #[arg(
        long,
        short = 'l',
        required = true,
        help = "Reference labels, `cell<TAB>label` per line"
    )]
    labels: Box<str>,

    #[arg(long, short = 'q', required = true, help = "Query data file (cells × features)")]
    query: Box<str>,

    #[command(flatten)]
    anchor: AnchorArgs,

    #[arg(
        long,
        value_enum,
        default_value = "reference-pca",
        help = "Joint space of reference and query",
        long_help = "Joint space of reference and query:\n\n\
		     - reference-pca: PCA of the reference, query projected into it\n\
		     - cca: canonical correlation of the pair"
    )]
    space: JointSpace,

    #[arg(long, default_value_t = 1e-3, help = "Added to distances before inverting them")]
    epsilon: f32,

    #[arg(
        long,
        short = 'o',
        required = true,
        help = "Output file prefix",
        long_help = "Output file prefix.\n\n\
		     Generates:\n\
		     - {out}.labels.tsv.gz: cell, predicted label and confidence\n\
		     - {out}.shares.tsv.gz: per-label vote shares (cells × labels)\n\
		     - {out}.run.json: configuration and anchor statistics"
    )]
    out: Box<str>,

    #[command(flatten)]
    runtime: RuntimeArgs,
}

pub fn run_transfer(args: &TransferArgs) -> anyhow::Result<()> {
    let interrupt = args.runtime.init()?;
    mkdir(&args.out)?;

    let reference = read_dataset(&args.reference)?;
    let labels = read_labels(&args.labels, &reference)?;
    let reference = reference.with_annotation(labels)?;
    let query = read_dataset(&args.query)?;

    let integration = args.anchor.integration_config();
    let mut config = AnnotationConfig::new(args.anchor.rank, args.anchor.min_score, args.anchor.bandwidth);
    config.projection = args.anchor.projection_config();
    config.space = args.space;
    config.anchors = integration.anchors;
    config.transfer.window = integration.correction.window;
    config.transfer.epsilon = args.epsilon;
    config.transfer.block_size = args.anchor.block_size;

    let out = annotate(&reference, &query, &config, &interrupt)?;

    let mut lines: Vec<Box<str>> = vec!["cell\tlabel\tconfidence".into()];
    for (i, c) in query.cell_ids().iter().enumerate() {
        lines.push(format!("{}\t{}\t{:.4}", c, out.transfer.labels[i], out.transfer.confidence[i]).into_boxed_str());
    }
    let labels_file = format!("{}.labels.tsv.gz", args.out);
    write_lines(&lines, &labels_file)?;
    info!("wrote {}", labels_file);

    out.transfer.shares.write_data(
        query.cell_ids(),
        &out.transfer.label_names,
        &format!("{}.shares.tsv.gz", args.out),
        "\t",
    )?;

    write_json(&out.record, &format!("{}.run.json", args.out))?;
    Ok(())
}
