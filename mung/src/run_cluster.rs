use crate::cli_common::*;
use crate::run_integrate::write_cell_batches;

use mung::community::CommunityMethod;
use mung::neighbors::{GraphConfig, GraphKind, DEFAULT_PRUNE_SNN};
use mung::pipeline::{integrate_and_cluster, PipelineConfig};

#[derive(Args, Debug)]
pub struct ClusterArgs {
    #[arg(
        long,
        short = 'd',
        num_args = 1..,
        required = true,
        help = "Data files, one per batch (cells × features)",
        long_help = "Normalised cells × features matrices, tab or comma\n\
		     delimited, optionally gzipped. With a single file the\n\
		     integration step is a pass-through."
    )]
    data_files: Vec<Box<str>>,

    #[command(flatten)]
    anchor: AnchorArgs,

    #[arg(long, default_value_t = 15, help = "Number of nearest neighbours of the clustering graph")]
    knn: usize,

    #[arg(
        long,
        value_enum,
        default_value = "snn",
        help = "Graph to cluster on",
        long_help = "Graph derived from the kNN lists:\n\n\
		     - snn: Jaccard overlap of shared neighbours (default)\n\
		     - union: i ~ j if either is a neighbour of the other\n\
		     - reciprocal: i ~ j only if both are neighbours\n\
		     kNN graphs are weighted by exp(-d / median d)."
    )]
    graph: GraphKind,

    #[arg(long, default_value_t = DEFAULT_PRUNE_SNN, help = "Drop SNN edges below this Jaccard weight")]
    prune_snn: f32,

    #[arg(
        long,
        short = 'm',
        value_enum,
        default_value = "louvain",
        help = "Community detection method",
        long_help = "Community detection method:\n\n\
		     - louvain: multi-level modularity optimisation (default)\n\
		     - leiden: Louvain with a refinement step that keeps\n\
		       communities well connected"
    )]
    method: CommunityMethod,

    #[arg(long, default_value_t = 1.0, help = "Resolution (higher = more clusters)")]
    resolution: f64,

    #[arg(
        long,
        short = 'k',
        help = "Tune the resolution towards this many clusters"
    )]
    num_clusters: Option<usize>,

    #[arg(long, default_value_t = 42, help = "Random seed for tie-breaking")]
    seed: u64,

    #[arg(long, default_value_t = 1, help = "Leave cells of smaller clusters unassigned")]
    min_cluster_size: usize,

    #[arg(
        long,
        short = 'o',
        required = true,
        help = "Output file prefix",
        long_help = "Output file prefix.\n\n\
		     Generates:\n\
		     - {out}.corrected.tsv.gz: corrected embedding (cells × components)\n\
		     - {out}.clusters.tsv.gz: cell, batch and cluster (NA if removed)\n\
		     - {out}.run.json: configuration, merge order and clustering summary"
    )]
    out: Box<str>,

    #[command(flatten)]
    runtime: RuntimeArgs,
}

pub fn run_cluster(args: &ClusterArgs) -> anyhow::Result<()> {
    let interrupt = args.runtime.init()?;
    mkdir(&args.out)?;

    let datasets = args
        .data_files
        .iter()
        .map(|f| read_dataset(f))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let mut config = PipelineConfig::new(args.anchor.rank, args.anchor.min_score, args.anchor.bandwidth);
    config.projection = args.anchor.projection_config();
    config.integration = args.anchor.integration_config();
    config.graph = GraphConfig::exact(args.knn);
    config.graph.knn.policy = args.anchor.search_policy();
    config.graph.knn.block_size = args.anchor.block_size;
    config.graph.kind = args.graph;
    config.graph.prune_snn = args.prune_snn;
    config.method = args.method;
    config.community.resolution = args.resolution;
    config.community.seed = args.seed;
    config.target_clusters = args.num_clusters;
    config.min_cluster_size = args.min_cluster_size;

    let out = integrate_and_cluster(&datasets.iter().collect::<Vec<_>>(), &config, &interrupt)?;

    if args.runtime.verbose() {
        eprintln!();
        eprintln!("{}", out.communities.result.histogram_ascii(50, 30));
        eprintln!();
    }

    write_embedding(&out.corrected, &format!("{}.corrected.tsv.gz", args.out))?;

    let labels = &out.communities.result.labels;
    let mut lines: Vec<Box<str>> = vec!["cell\tbatch\tcluster".into()];
    let mut row = 0;
    for e in out.integration.per_dataset.iter() {
        for c in e.cell_ids() {
            let cluster = match labels[row] {
                usize::MAX => "NA".to_string(),
                k => k.to_string(),
            };
            lines.push(format!("{}\t{}\t{}", c, e.batch(), cluster).into_boxed_str());
            row += 1;
        }
    }
    let clusters_file = format!("{}.clusters.tsv.gz", args.out);
    write_lines(&lines, &clusters_file)?;
    info!("wrote {}", clusters_file);

    write_cell_batches(&out.integration.per_dataset, &format!("{}.cells.tsv.gz", args.out))?;
    write_json(&out.record, &format!("{}.run.json", args.out))?;
    Ok(())
}
