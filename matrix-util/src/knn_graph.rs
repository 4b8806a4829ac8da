use crate::knn_match::NeighbourIndex;
use crate::utils::{check_stop, generate_minibatch_intervals};

use dashmap::DashMap;
use fnv::FnvHashMap as HashMap;
use indicatif::ParallelProgressIterator;
use log::info;
use nalgebra::DMatrix;
use nalgebra_sparse::{CooMatrix, CscMatrix};
use rayon::prelude::*;
use std::sync::atomic::AtomicBool;

/// Ranked neighbour lists, one per query point
#[derive(Clone, Debug, Default)]
pub struct KnnLists {
    /// neighbour indices, ranked by (distance, index)
    pub indices: Vec<Vec<usize>>,
    /// distances parallel to `indices`
    pub distances: Vec<Vec<f32>>,
}

pub struct KnnSearchArgs<'a> {
    pub knn: usize,
    pub block_size: usize,
    /// the i-th query is the i-th indexed point and must not be its
    /// own neighbour
    pub exclude_self: bool,
    pub stop: Option<&'a AtomicBool>,
}

impl KnnLists {
    /// Search every row of `queries` against `index`.
    ///
    /// Queries are split into blocks processed in parallel; the stop
    /// flag is checked before each block.
    pub fn search<I>(
        index: &I,
        queries: &DMatrix<f32>,
        args: &KnnSearchArgs,
    ) -> anyhow::Result<KnnLists>
    where
        I: NeighbourIndex + ?Sized,
    {
        let nn = queries.nrows();
        let jobs = generate_minibatch_intervals(nn, args.block_size);
        let njobs = jobs.len() as u64;

        let mut blocks = jobs
            .into_par_iter()
            .progress_count(njobs)
            .map(|(lb, ub)| -> anyhow::Result<(usize, Vec<(Vec<usize>, Vec<f32>)>)> {
                check_stop(args.stop)?;
                let found = (lb..ub)
                    .map(|i| {
                        let q: Vec<f32> = queries.row(i).iter().cloned().collect();
                        let exclude = if args.exclude_self { Some(i) } else { None };
                        index.search(&q, args.knn, exclude)
                    })
                    .collect();
                Ok((lb, found))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        blocks.sort_by_key(|(lb, _)| *lb);

        let (indices, distances) = blocks.into_iter().flat_map(|(_, found)| found).unzip();

        Ok(KnnLists { indices, distances })
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// `{i} ∪ kNN(i)`, sorted
    pub fn closed_neighbourhood(&self, i: usize) -> Vec<usize> {
        let mut ret = Vec::with_capacity(self.indices[i].len() + 1);
        ret.push(i);
        ret.extend(self.indices[i].iter().copied().filter(|&j| j != i));
        ret.sort_unstable();
        ret.dedup();
        ret
    }
}

/// What the edge values of a graph mean
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EdgeKind {
    Distance,
    Similarity,
}

pub struct KnnGraph {
    /// Symmetric CSC adjacency matrix (n_nodes x n_nodes)
    pub adjacency: CscMatrix<f32>,
    /// Sorted edge list (i < j), deduplicated
    pub edges: Vec<(usize, usize)>,
    /// Edge distances or similarities, parallel to `edges`
    pub values: Vec<f32>,
    pub kind: EdgeKind,
    /// Number of nodes
    pub n_nodes: usize,
}

pub fn median_f32(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let n = sorted.len();
    if n % 2 == 0 {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    } else {
        sorted[n / 2]
    }
}

impl KnnGraph {
    /// Symmetrize directed kNN lists into an undirected distance graph.
    ///
    /// * `lists` - neighbour lists over the same point set
    /// * `reciprocal` - if true, keep only reciprocal edges (i→j AND
    ///   j→i); otherwise keep union edges with the min distance
    pub fn from_knn_lists(lists: &KnnLists, reciprocal: bool) -> anyhow::Result<KnnGraph> {
        let nn = lists.len();

        /////////////////////////////////
        // step 1: directed triplets   //
        /////////////////////////////////

        let triplets: DashMap<(usize, usize), f32> = DashMap::new();

        lists
            .indices
            .par_iter()
            .zip(lists.distances.par_iter())
            .enumerate()
            .for_each(|(i, (idx, dist))| {
                for (&j, &d_ij) in idx.iter().zip(dist.iter()) {
                    if i != j {
                        triplets.insert((i, j), d_ij);
                    }
                }
            });

        info!("{} triplets by kNN matching", triplets.len());

        if triplets.is_empty() {
            return Err(anyhow::anyhow!("empty triplets"));
        }

        ///////////////////////////////////////////////////
        // step 2: edge filtering (reciprocal or union) //
        ///////////////////////////////////////////////////

        let mut edges: Vec<((usize, usize), f32)> = if reciprocal {
            triplets
                .par_iter()
                .filter_map(|entry| {
                    let &(i, j) = entry.key();
                    if i < j && triplets.contains_key(&(j, i)) {
                        Some(((i, j), *entry.value()))
                    } else {
                        None
                    }
                })
                .collect()
        } else {
            triplets
                .par_iter()
                .filter_map(|entry| {
                    let &(i, j) = entry.key();
                    if i < j {
                        let d_ij = *entry.value();
                        let d_ji = triplets.get(&(j, i)).map(|e| *e).unwrap_or(d_ij);
                        Some(((i, j), d_ij.min(d_ji)))
                    } else if i > j && !triplets.contains_key(&(j, i)) {
                        // Only (i→j) exists with i > j; emit as canonical (j, i)
                        Some(((j, i), *entry.value()))
                    } else {
                        None
                    }
                })
                .collect()
        };

        edges.par_sort_by_key(|&(ij, _)| ij);
        edges.dedup_by_key(|(ij, _)| *ij);

        info!(
            "{} edges after {} matching",
            edges.len(),
            if reciprocal { "reciprocal" } else { "union" }
        );

        Ok(Self::from_edges(nn, edges, EdgeKind::Distance))
    }

    /// Shared-nearest-neighbour graph: the weight between i and j is
    /// the Jaccard overlap of their closed neighbourhoods. Every pair
    /// sharing at least one member is a candidate; weights below
    /// `prune` are dropped.
    pub fn shared_neighbour(lists: &KnnLists, prune: f32) -> KnnGraph {
        let nn = lists.len();

        let closed: Vec<Vec<usize>> = (0..nn)
            .into_par_iter()
            .map(|i| lists.closed_neighbourhood(i))
            .collect();

        // member -> nodes whose closed neighbourhood contains it
        let mut inverted: Vec<Vec<usize>> = vec![vec![]; nn];
        for (i, members) in closed.iter().enumerate() {
            for &m in members {
                if m < nn {
                    inverted[m].push(i);
                }
            }
        }

        let mut edges: Vec<((usize, usize), f32)> = (0..nn)
            .into_par_iter()
            .flat_map_iter(|i| {
                let mut shared: HashMap<usize, usize> = HashMap::default();
                for &m in closed[i].iter().filter(|&&m| m < nn) {
                    for &j in inverted[m].iter().filter(|&&j| j > i) {
                        *shared.entry(j).or_default() += 1;
                    }
                }
                let ni = closed[i].len();
                let closed = &closed;
                shared.into_iter().filter_map(move |(j, c)| {
                    let w = c as f32 / (ni + closed[j].len() - c) as f32;
                    (w >= prune).then_some(((i, j), w))
                })
            })
            .collect();

        edges.par_sort_by_key(|&(ij, _)| ij);

        info!("{} shared-neighbour edges (prune < {:.4})", edges.len(), prune);

        Self::from_edges(nn, edges, EdgeKind::Similarity)
    }

    /// Build from canonical (i < j) sorted edges
    pub fn from_edges(nn: usize, edges: Vec<((usize, usize), f32)>, kind: EdgeKind) -> KnnGraph {
        let mut coo = CooMatrix::new(nn, nn);
        for &((i, j), v) in edges.iter() {
            coo.push(i, j, v);
            coo.push(j, i, v);
        }

        let adjacency = CscMatrix::from(&coo);
        let (edge_pairs, values): (Vec<_>, Vec<_>) = edges.into_iter().unzip();

        KnnGraph {
            adjacency,
            edges: edge_pairs,
            values,
            kind,
            n_nodes: nn,
        }
    }

    /// Get neighbors of a node from the CSC adjacency matrix
    pub fn neighbors(&self, node: usize) -> &[usize] {
        let offsets = self.adjacency.col_offsets();
        let start = offsets[node];
        let end = offsets[node + 1];
        &self.adjacency.row_indices()[start..end]
    }

    /// Edge values parallel to `neighbors(node)`
    pub fn neighbor_values(&self, node: usize) -> &[f32] {
        let offsets = self.adjacency.col_offsets();
        let start = offsets[node];
        let end = offsets[node + 1];
        &self.adjacency.values()[start..end]
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    pub fn num_nodes(&self) -> usize {
        self.n_nodes
    }

    /// Convert distances to similarity weights using an exponential kernel:
    /// `w = exp(-d / σ)` where σ = median distance.
    ///
    /// Returns weights parallel to `self.edges`, all in (0, 1].
    pub fn exp_kernel_weights(&self) -> Vec<f32> {
        if self.values.is_empty() {
            return Vec::new();
        }
        let sigma = median_f32(&self.values);
        let sigma = if sigma <= 0.0 { 1.0 } else { sigma };
        info!("exp_kernel_weights: σ (median distance) = {:.4}", sigma);
        self.values.iter().map(|&d| (-d / sigma).exp()).collect()
    }

    /// Edge weights usable for modularity: similarities as they are,
    /// distances through [`Self::exp_kernel_weights`]
    pub fn similarity_weights(&self) -> Vec<f32> {
        match self.kind {
            EdgeKind::Similarity => self.values.clone(),
            EdgeKind::Distance => self.exp_kernel_weights(),
        }
    }
}
