//! k-nearest-neighbour lists and shared-nearest-neighbour graphs over
//! embeddings, within a dataset, across two, or over their union

use crate::common::*;
use crate::embedding::Embedding;
use crate::error::MungError;

use matrix_util::knn_graph::{KnnGraph, KnnLists, KnnSearchArgs};
use matrix_util::knn_match::{ColumnDict, ExactDict, HnswParams, NeighbourIndex};
use serde::Serialize;

/// queries used to estimate the recall of an approximate search
const RECALL_SAMPLE: usize = 200;

pub const DEFAULT_PRUNE_SNN: f32 = 1.0 / 15.0;

/// Exact brute-force search, or HNSW with a minimum recall
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub enum SearchPolicy {
    #[default]
    Exact,
    Approximate {
        ef_search: usize,
        ef_construction: usize,
        seed: u64,
        /// fall back to exact search below this estimated recall
        min_recall: f32,
    },
}

impl SearchPolicy {
    pub fn approximate(min_recall: f32) -> Self {
        let params = HnswParams::default();
        SearchPolicy::Approximate {
            ef_search: params.ef_search,
            ef_construction: params.ef_construction,
            seed: params.seed,
            min_recall,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct KnnConfig {
    pub knn: usize,
    pub policy: SearchPolicy,
    pub block_size: usize,
}

impl KnnConfig {
    pub fn exact(knn: usize) -> Self {
        Self {
            knn,
            policy: SearchPolicy::Exact,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

/// Which undirected graph to derive from the kNN lists
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, clap::ValueEnum)]
pub enum GraphKind {
    /// Jaccard overlap of closed neighbourhoods
    #[default]
    Snn,
    /// i ~ j if either lists the other; exp-kernel weights
    Union,
    /// i ~ j only if both list each other; exp-kernel weights
    Reciprocal,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct GraphConfig {
    pub knn: KnnConfig,
    pub kind: GraphKind,
    /// drop shared-neighbour weights below this
    pub prune_snn: f32,
}

impl GraphConfig {
    pub fn exact(knn: usize) -> Self {
        Self {
            knn: KnnConfig::exact(knn),
            kind: GraphKind::Snn,
            prune_snn: DEFAULT_PRUNE_SNN,
        }
    }
}

/// kNN lists and the undirected graph derived from them
pub struct NeighborGraph {
    pub knn: KnnLists,
    pub graph: KnnGraph,
    pub k: usize,
    pub policy: SearchPolicy,
}

fn search_exact(
    data: &Mat,
    queries: &Mat,
    args: &KnnSearchArgs,
) -> anyhow::Result<KnnLists> {
    KnnLists::search(&ExactDict::from_rows(data), queries, args)
}

/// Indices of the recall sample: evenly spaced over the queries
fn recall_sample(nquery: usize) -> Vec<usize> {
    let m = RECALL_SAMPLE.min(nquery);
    (0..m).map(|s| s * nquery / m).collect()
}

/// Search `queries` against the rows of `data` under `config.policy`
fn search_lists(
    data: &Mat,
    queries: &Mat,
    exclude_self: bool,
    config: &KnnConfig,
    interrupt: &Interrupt,
) -> anyhow::Result<KnnLists> {
    let args = KnnSearchArgs {
        knn: config.knn,
        block_size: config.block_size,
        exclude_self,
        stop: Some(interrupt.flag()),
    };

    let lists = match config.policy {
        SearchPolicy::Exact => search_exact(data, queries, &args),
        SearchPolicy::Approximate {
            ef_search,
            ef_construction,
            seed,
            min_recall,
        } => {
            let params = HnswParams {
                ef_search: ef_search.max(config.knn + 1),
                ef_construction,
                seed,
            };
            let dict = ColumnDict::from_rows(data, &params);
            let approx = KnnLists::search(&dict, queries, &args).map_err(lift_interrupted)?;

            let sample = recall_sample(queries.nrows());
            let exact_dict = ExactDict::from_rows(data);
            let mut hits = 0;
            let mut total = 0;
            for &i in sample.iter() {
                let q: Vec<f32> = queries.row(i).iter().cloned().collect();
                let exclude = if exclude_self { Some(i) } else { None };
                let (truth, _) = exact_dict.search(&q, config.knn, exclude);
                hits += approx.indices[i].iter().filter(|j| truth.contains(j)).count();
                total += truth.len();
            }
            let recall = if total > 0 { hits as f32 / total as f32 } else { 1.0 };

            if recall < min_recall {
                warn!(
                    "approximate kNN recall {:.3} < {:.3}; redoing the search exactly",
                    recall, min_recall
                );
                search_exact(data, queries, &args)
            } else {
                info!("approximate kNN recall {:.3} on {} queries", recall, sample.len());
                Ok(approx)
            }
        }
    };

    lists.map_err(lift_interrupted)
}

fn validate_k(knn: usize) -> anyhow::Result<()> {
    if knn == 0 {
        return Err(MungError::invalid("knn", "must be at least 1"));
    }
    Ok(())
}

/// kNN of every cell among the other cells of the same embedding
pub fn knn_within(
    embedding: &Embedding,
    config: &KnnConfig,
    interrupt: &Interrupt,
) -> anyhow::Result<KnnLists> {
    validate_k(config.knn)?;
    let nn = embedding.num_cells();
    if nn <= config.knn {
        return Err(MungError::InsufficientPoints {
            points: nn,
            k: config.knn,
        }
        .into());
    }
    search_lists(embedding.coords(), embedding.coords(), true, config, interrupt)
}

/// kNN of every `query` cell among the `target` cells
pub fn knn_between(
    query: &Embedding,
    target: &Embedding,
    config: &KnnConfig,
    interrupt: &Interrupt,
) -> anyhow::Result<KnnLists> {
    query.ensure_same_basis(target)?;
    validate_k(config.knn)?;
    if target.num_cells() < config.knn {
        return Err(MungError::InsufficientPoints {
            points: target.num_cells(),
            k: config.knn,
        }
        .into());
    }
    search_lists(target.coords(), query.coords(), false, config, interrupt)
}

/// kNN over the union of two embeddings. Indices below `a.num_cells()`
/// refer to `a`; the rest to `b`, shifted by `a.num_cells()`.
pub fn knn_union(
    a: &Embedding,
    b: &Embedding,
    config: &KnnConfig,
    interrupt: &Interrupt,
) -> anyhow::Result<KnnLists> {
    let union = Embedding::concat("union", &[a, b])?;
    knn_within(&union, config, interrupt)
}

/// kNN lists plus the undirected graph of one embedding (SNN by default)
pub fn build_graph(
    embedding: &Embedding,
    config: &GraphConfig,
    interrupt: &Interrupt,
) -> anyhow::Result<NeighborGraph> {
    if !(0.0..=1.0).contains(&config.prune_snn) {
        return Err(MungError::invalid("prune_snn", "must lie in [0, 1]"));
    }

    info!(
        "building kNN (k={}) and {:?} graphs over {} cells",
        config.knn.knn,
        config.kind,
        embedding.num_cells()
    );

    let knn = knn_within(embedding, &config.knn, interrupt)?;
    interrupt.check()?;
    let graph = match config.kind {
        GraphKind::Snn => KnnGraph::shared_neighbour(&knn, config.prune_snn),
        GraphKind::Union => KnnGraph::from_knn_lists(&knn, false)?,
        GraphKind::Reciprocal => KnnGraph::from_knn_lists(&knn, true)?,
    };

    Ok(NeighborGraph {
        knn,
        graph,
        k: config.knn.knn,
        policy: config.knn.policy,
    })
}
