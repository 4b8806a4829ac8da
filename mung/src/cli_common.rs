pub use clap::{Args, Parser, Subcommand};
pub use log::info;

pub use matrix_util::common_io::*;
pub use matrix_util::traits::{IoOps, MatWithNames};
pub use mung::common::Mat;
pub use mung::dataset::Dataset;
pub use mung::embedding::Embedding;
pub use mung::Interrupt;

use mung::integration::IntegrationConfig;
use mung::neighbors::SearchPolicy;
use mung::projection::{Decomposition, ProjectionConfig};
use serde::Serialize;
use std::io::Write;

const INPUT_DELIMS: [char; 2] = ['\t', ','];

#[derive(Args, Debug)]
pub struct RuntimeArgs {
    #[arg(
        long,
        help = "Number of worker threads",
        long_help = "Number of worker threads.\n\
		     Defaults to the number of logical CPUs."
    )]
    threads: Option<usize>,

    #[arg(long, short = 'v', help = "Verbose output")]
    verbose: bool,
}

impl RuntimeArgs {
    pub fn verbose(&self) -> bool {
        self.verbose
    }

    /// Logging, thread pool and a Ctrl-C handler that raises the
    /// returned interrupt
    pub fn init(&self) -> anyhow::Result<Interrupt> {
        if self.verbose {
            std::env::set_var("RUST_LOG", "info");
        }
        env_logger::init();

        let threads = self.threads.unwrap_or_else(num_cpus::get).max(1);
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()?;
        info!("using {} thread(s)", threads);

        let interrupt = Interrupt::new();
        let handle = interrupt.clone();
        ctrlc::set_handler(move || {
            info!("Interrupt received; stopping at the next checkpoint...");
            handle.trigger();
        })?;
        Ok(interrupt)
    }
}

/// Options shared by every command that projects and anchors batches
#[derive(Args, Debug)]
pub struct AnchorArgs {
    #[arg(long, short = 'r', default_value_t = 30, help = "Number of components")]
    pub rank: usize,

    #[arg(long, help = "Standardize features on pooled statistics before projection")]
    pub standardize: bool,

    #[arg(
        long,
        help = "Randomized SVD with this seed",
        long_help = "Use a randomized SVD seeded with this value instead of\n\
		     the exact decomposition. Faster on large inputs."
    )]
    pub rsvd_seed: Option<u64>,

    #[arg(long, default_value_t = 5, help = "Cross-batch neighbours searched for mutual pairs")]
    pub k_anchor: usize,

    #[arg(long, default_value_t = 30, help = "Neighbourhood size for anchor scoring")]
    pub k_filter: usize,

    #[arg(
        long,
        required = true,
        help = "Minimum anchor score in [0, 1]",
        long_help = "Anchors whose neighbourhood consistency score falls\n\
		     below this value are dropped. No default."
    )]
    pub min_score: f32,

    #[arg(long, default_value_t = 0.0, help = "Minimum shared-neighbour overlap of a consistent pair")]
    pub min_overlap: f32,

    #[arg(
        long,
        required = true,
        help = "Kernel bandwidth in embedding units",
        long_help = "Width h of the Gaussian kernel exp(-d^2 / 2h^2)\n\
		     weighting anchors by distance. No default."
    )]
    pub bandwidth: f32,

    #[arg(long, default_value_t = 100, help = "Maximum anchors per cell window")]
    pub k_weight: usize,

    #[arg(long, default_value_t = 3.0, help = "Ignore anchors beyond cutoff × bandwidth")]
    pub cutoff: f32,

    #[arg(
        long,
        help = "Approximate (HNSW) neighbour search with this minimum recall",
        long_help = "Use approximate HNSW search. Recall is estimated against\n\
		     exact search on a sample of queries; below this value the\n\
		     search is redone exactly."
    )]
    pub min_recall: Option<f32>,

    #[arg(long, default_value_t = 1000, help = "Block size for parallel jobs")]
    pub block_size: usize,
}

impl AnchorArgs {
    pub fn projection_config(&self) -> ProjectionConfig {
        let mut ret = ProjectionConfig::with_rank(self.rank);
        ret.standardize = self.standardize;
        if let Some(seed) = self.rsvd_seed {
            ret.decomposition = Decomposition::Randomized { seed };
        }
        ret
    }

    pub fn search_policy(&self) -> SearchPolicy {
        match self.min_recall {
            Some(r) => SearchPolicy::approximate(r),
            None => SearchPolicy::Exact,
        }
    }

    pub fn integration_config(&self) -> IntegrationConfig {
        let mut ret = IntegrationConfig::new(self.min_score, self.bandwidth);
        ret.anchors.k_anchor = self.k_anchor;
        ret.anchors.k_filter = self.k_filter;
        ret.anchors.min_overlap = self.min_overlap;
        ret.anchors.search = self.search_policy();
        ret.anchors.block_size = self.block_size;
        ret.correction.window.k_weight = self.k_weight;
        ret.correction.window.cutoff = self.cutoff;
        ret.correction.block_size = self.block_size;
        ret
    }
}

/// Read a cells × features matrix; the batch is named after the file
pub fn read_dataset(file: &str) -> anyhow::Result<Dataset> {
    let MatWithNames { rows, cols, mat } = Mat::read_data(file, &INPUT_DELIMS)?;
    let batch = basename(file)?;
    info!("{}: {} cells × {} features", batch, mat.nrows(), mat.ncols());
    Dataset::new(&batch, rows, cols, mat)
}

/// Per-cell labels, one `cell<TAB>label` pair per line
pub fn read_labels(file: &str, dataset: &Dataset) -> anyhow::Result<Vec<Box<str>>> {
    let parsed = read_lines_of_words_delim(file, &INPUT_DELIMS, -1)?;
    let pairs: fnv::FnvHashMap<Box<str>, Box<str>> = parsed
        .lines
        .into_iter()
        .filter_map(|w| {
            let mut words = w.into_iter();
            Some((words.next()?, words.next()?))
        })
        .collect();

    dataset
        .cell_ids()
        .iter()
        .map(|c| {
            pairs
                .get(c)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("{}: no label for cell '{}'", file, c))
        })
        .collect()
}

pub fn write_embedding(emb: &Embedding, file: &str) -> anyhow::Result<()> {
    let cols: Vec<Box<str>> = (0..emb.dim()).map(|j| format!("d{}", j).into_boxed_str()).collect();
    emb.coords().write_data(emb.cell_ids(), &cols, file, "\t")?;
    info!("wrote {}", file);
    Ok(())
}

pub fn write_json<T: Serialize>(x: &T, file: &str) -> anyhow::Result<()> {
    let mut buf = open_buf_writer(file)?;
    serde_json::to_writer_pretty(&mut buf, x)?;
    writeln!(buf)?;
    buf.flush()?;
    info!("wrote {}", file);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dataset_and_labels_from_files() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let data_file = dir.path().join("donor1.tsv.gz");
        let data_file = data_file.to_str().unwrap();
        let label_file = dir.path().join("labels.tsv");
        let label_file = label_file.to_str().unwrap();

        let cells: Vec<Box<str>> = vec!["c1".into(), "c2".into(), "c3".into()];
        let genes: Vec<Box<str>> = vec!["g1".into(), "g2".into()];
        let xx = Mat::from_row_slice(3, 2, &[1., 0., 0., 2., 3., 3.]);
        xx.write_data(&cells, &genes, data_file, "\t")?;

        let data = read_dataset(data_file)?;
        assert_eq!(data.batch(), "donor1");
        assert_eq!(data.cell_ids(), &cells[..]);
        assert_eq!(data.features(), &genes[..]);
        assert_eq!(data.data(), &xx);

        // order in the label file does not matter
        let lines: Vec<Box<str>> = vec!["c3\tB".into(), "c1\tT".into(), "c2\tT".into()];
        write_lines(&lines, label_file)?;
        let labels = read_labels(label_file, &data)?;
        let expected: Vec<Box<str>> = vec!["T".into(), "T".into(), "B".into()];
        assert_eq!(labels, expected);

        write_lines(&lines[..2], label_file)?;
        assert!(read_labels(label_file, &data).is_err());
        Ok(())
    }

    #[test]
    fn json_record_is_written() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("run.json");
        let file = file.to_str().unwrap();

        write_json(&serde_json::json!({ "clusters": 3 }), file)?;
        let back: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(file)?)?;
        assert_eq!(back["clusters"], 3);
        Ok(())
    }
}
