//! Modularity-based community detection over weighted undirected graphs
//!
//! [`Louvain`](crate::louvain::Louvain) and [`Leiden`](crate::leiden::Leiden)
//! share the graph representation, the local-moving phase and the
//! aggregation step defined here.

use crate::common::*;
use crate::error::MungError;

use fnv::FnvHashMap as HashMap;
use indicatif::ParallelProgressIterator;
use matrix_util::knn_graph::KnnGraph;
use rand::rngs::StdRng;
use rand::Rng;
use rayon::prelude::*;
use serde::Serialize;

/// smallest modularity gain that counts as an improvement
pub(crate) const GAIN_EPS: f64 = 1e-10;

/// Clustering result
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterResult {
    /// Cluster assignment for each cell (cell index -> cluster id)
    pub labels: Vec<usize>,
    /// Number of clusters
    pub n_clusters: usize,
}

impl ClusterResult {
    /// Renumber arbitrary community ids by order of first appearance
    pub fn from_membership(membership: &[usize]) -> Self {
        let (labels, n_clusters) = renumber(membership);
        Self { labels, n_clusters }
    }

    /// Get cluster size distribution
    pub fn cluster_sizes(&self) -> Vec<usize> {
        let mut counts = vec![0; self.n_clusters];
        for &label in &self.labels {
            if label < self.n_clusters {
                counts[label] += 1;
            }
        }
        counts
    }

    /// Remove clusters smaller than `min_size`.
    ///
    /// Cells in removed clusters get label `usize::MAX` (written as NA in output).
    /// Remaining clusters are renumbered contiguously.
    pub fn remove_small_clusters(&mut self, min_size: usize) {
        let sizes = self.cluster_sizes();

        let mut new_label = vec![usize::MAX; self.n_clusters];
        let mut next = 0;
        for (old, &sz) in sizes.iter().enumerate() {
            if sz >= min_size {
                new_label[old] = next;
                next += 1;
            }
        }

        let n_removed = self.n_clusters - next;
        if n_removed > 0 {
            let n_cells_removed: usize = sizes.iter().filter(|&&s| s < min_size).sum();
            for label in self.labels.iter_mut() {
                if *label < new_label.len() {
                    *label = new_label[*label];
                }
            }
            info!(
                "Removed {} cluster(s) with < {} cells ({} cells unassigned)",
                n_removed, min_size, n_cells_removed
            );
            self.n_clusters = next;
        }
    }

    /// Cluster sizes as ASCII bars, showing up to `max_show` largest
    /// clusters in descending order of size.
    pub fn histogram_ascii(&self, max_width: usize, max_show: usize) -> String {
        let sizes = self.cluster_sizes();

        let mut ranked: Vec<(usize, usize)> = sizes
            .iter()
            .enumerate()
            .filter(|(_, &s)| s > 0)
            .map(|(id, &s)| (id, s))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        let n_total = ranked.len();
        let n_show = max_show.min(n_total);
        let max_size = ranked.first().map(|&(_, s)| s).unwrap_or(1);
        let n_cells = self.labels.len().max(1) as f64;

        let mut lines = Vec::new();
        lines.push(format!(
            "Cluster assignments ({} cells, {} clusters):",
            self.labels.len(),
            n_total
        ));
        lines.push(String::new());

        for &(cluster_id, size) in ranked.iter().take(n_show) {
            let pct = 100.0 * size as f64 / n_cells;
            let bar_len = ((size as f64 / max_size as f64) * max_width as f64) as usize;
            let bar = "█".repeat(bar_len.max(1));
            lines.push(format!(
                "  Cluster {:3}  {:>6} cells ({:>5.1}%)  {}",
                cluster_id, size, pct, bar
            ));
        }

        if n_total > n_show {
            let hidden_cells: usize = ranked[n_show..].iter().map(|&(_, s)| s).sum();
            lines.push(format!(
                "  ... and {} more clusters ({} cells, {:.1}%)",
                n_total - n_show,
                hidden_cells,
                100.0 * hidden_cells as f64 / n_cells
            ));
        }

        lines.join("\n")
    }
}

/// Relabel by first appearance; returns the labels and their count
pub(crate) fn renumber(membership: &[usize]) -> (Vec<usize>, usize) {
    let mut map: HashMap<usize, usize> = HashMap::default();
    let labels = membership
        .iter()
        .map(|&c| {
            let next = map.len();
            *map.entry(c).or_insert(next)
        })
        .collect();
    (labels, map.len())
}

/// Weighted undirected graph in adjacency-list form.
///
/// Self-loops carry the weight internal to a node (both directions
/// counted) so that aggregated graphs keep the modularity of the
/// partition they came from.
#[derive(Clone, Debug)]
pub struct WeightedGraph {
    offsets: Vec<usize>,
    targets: Vec<usize>,
    weights: Vec<f64>,
    self_loops: Vec<f64>,
    degree: Vec<f64>,
    /// 2m
    total_weight: f64,
}

impl WeightedGraph {
    /// Build from undirected edges `((i, j), w)`; `i == j` is a self-loop
    pub fn from_edges(nn: usize, edges: &[((usize, usize), f64)]) -> anyhow::Result<Self> {
        let mut self_loops = vec![0f64; nn];
        let mut counts = vec![0usize; nn];

        for &((i, j), w) in edges.iter() {
            if i >= nn || j >= nn {
                return Err(MungError::mismatch("edge endpoint", nn, i.max(j) + 1));
            }
            if !(w.is_finite() && w >= 0.0) {
                return Err(MungError::invalid("edge weight", format!("{} on ({}, {})", w, i, j)));
            }
            if i == j {
                self_loops[i] += 2.0 * w;
            } else {
                counts[i] += 1;
                counts[j] += 1;
            }
        }

        let mut offsets = vec![0usize; nn + 1];
        for i in 0..nn {
            offsets[i + 1] = offsets[i] + counts[i];
        }

        let mut fill = offsets.clone();
        let mut targets = vec![0usize; offsets[nn]];
        let mut weights = vec![0f64; offsets[nn]];
        for &((i, j), w) in edges.iter().filter(|((i, j), _)| i != j) {
            targets[fill[i]] = j;
            weights[fill[i]] = w;
            fill[i] += 1;
            targets[fill[j]] = i;
            weights[fill[j]] = w;
            fill[j] += 1;
        }

        Ok(Self::finish(offsets, targets, weights, self_loops))
    }

    fn finish(offsets: Vec<usize>, targets: Vec<usize>, weights: Vec<f64>, self_loops: Vec<f64>) -> Self {
        let nn = self_loops.len();
        let degree: Vec<f64> = (0..nn)
            .map(|i| self_loops[i] + weights[offsets[i]..offsets[i + 1]].iter().sum::<f64>())
            .collect();
        let total_weight = degree.iter().sum();
        Self {
            offsets,
            targets,
            weights,
            self_loops,
            degree,
            total_weight,
        }
    }

    /// Similarity-weighted graph of a kNN/SNN graph
    pub fn from_knn_graph(graph: &KnnGraph) -> anyhow::Result<Self> {
        let weights = graph.similarity_weights();
        let edges: Vec<((usize, usize), f64)> = graph
            .edges
            .iter()
            .zip(weights.iter())
            .map(|(&ij, &w)| (ij, w as f64))
            .collect();
        Self::from_edges(graph.num_nodes(), &edges)
    }

    pub fn num_nodes(&self) -> usize {
        self.degree.len()
    }

    /// undirected edges, self-loops excluded
    pub fn num_edges(&self) -> usize {
        self.targets.len() / 2
    }

    /// 2m
    pub fn total_weight(&self) -> f64 {
        self.total_weight
    }

    pub fn degree(&self, node: usize) -> f64 {
        self.degree[node]
    }

    pub fn self_loop(&self, node: usize) -> f64 {
        self.self_loops[node]
    }

    /// `(neighbour, weight)` pairs, self-loop excluded
    pub fn neighbors(&self, node: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        let range = self.offsets[node]..self.offsets[node + 1];
        self.targets[range.clone()]
            .iter()
            .copied()
            .zip(self.weights[range].iter().copied())
    }

    /// Collapse every community of `membership` (ids in `0..n_comm`)
    /// into one node
    pub fn aggregate(&self, membership: &[usize], n_comm: usize) -> WeightedGraph {
        let mut self_loops = vec![0f64; n_comm];
        let mut between: Vec<HashMap<usize, f64>> = vec![HashMap::default(); n_comm];

        for i in 0..self.num_nodes() {
            let ci = membership[i];
            self_loops[ci] += self.self_loops[i];
            for (j, w) in self.neighbors(i) {
                let cj = membership[j];
                if ci == cj {
                    self_loops[ci] += w;
                } else {
                    *between[ci].entry(cj).or_default() += w;
                }
            }
        }

        let mut offsets = Vec::with_capacity(n_comm + 1);
        let mut targets = vec![];
        let mut weights = vec![];
        offsets.push(0);
        for row in between.into_iter() {
            let mut row: Vec<(usize, f64)> = row.into_iter().collect();
            row.sort_by_key(|&(j, _)| j);
            for (j, w) in row {
                targets.push(j);
                weights.push(w);
            }
            offsets.push(targets.len());
        }

        Self::finish(offsets, targets, weights, self_loops)
    }

    /// Newman-Girvan modularity of a partition at `resolution`
    pub fn modularity(&self, membership: &[usize], resolution: f64) -> f64 {
        if self.total_weight <= 0.0 {
            return 0.0;
        }
        let (labels, n_comm) = renumber(membership);
        let mut internal = vec![0f64; n_comm];
        let mut total = vec![0f64; n_comm];
        for i in 0..self.num_nodes() {
            let c = labels[i];
            total[c] += self.degree[i];
            internal[c] += self.self_loops[i];
            internal[c] += self.neighbors(i).filter(|&(j, _)| labels[j] == c).map(|(_, w)| w).sum::<f64>();
        }
        let m2 = self.total_weight;
        internal
            .iter()
            .zip(total.iter())
            .map(|(&inn, &tot)| inn / m2 - resolution * (tot / m2) * (tot / m2))
            .sum()
    }
}

/// Parameters of one community detection run
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct CommunityParams {
    pub resolution: f64,
    pub seed: u64,
    /// aggregation levels
    pub max_levels: usize,
    /// local-moving passes per level
    pub max_passes: usize,
}

impl Default for CommunityParams {
    fn default() -> Self {
        Self {
            resolution: 1.0,
            seed: 42,
            max_levels: 10,
            max_passes: 100,
        }
    }
}

impl CommunityParams {
    fn validate(&self) -> anyhow::Result<()> {
        if !(self.resolution.is_finite() && self.resolution > 0.0) {
            return Err(MungError::invalid("resolution", "must be positive"));
        }
        if self.max_levels == 0 || self.max_passes == 0 {
            return Err(MungError::invalid("max_levels", "levels and passes must be at least 1"));
        }
        Ok(())
    }
}

/// Detected communities of one run
#[derive(Debug, Clone)]
pub struct Communities {
    pub result: ClusterResult,
    /// membership of every original node after each aggregation level
    pub levels: Vec<Vec<usize>>,
    /// modularity of `result` on the input graph
    pub modularity: f64,
    pub resolution: f64,
}

impl Communities {
    pub(crate) fn finish(graph: &WeightedGraph, levels: Vec<Vec<usize>>, params: &CommunityParams) -> Self {
        let result = match levels.last() {
            Some(last) => ClusterResult::from_membership(last),
            None => ClusterResult::from_membership(&(0..graph.num_nodes()).collect::<Vec<_>>()),
        };
        let modularity = graph.modularity(&result.labels, params.resolution);
        Self {
            result,
            levels,
            modularity,
            resolution: params.resolution,
        }
    }
}

pub trait CommunityDetection: Sync {
    fn name(&self) -> &'static str;

    /// Partition the nodes of `graph`
    fn detect(
        &self,
        graph: &WeightedGraph,
        params: &CommunityParams,
        interrupt: &Interrupt,
    ) -> anyhow::Result<Communities>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, clap::ValueEnum)]
pub enum CommunityMethod {
    #[default]
    Louvain,
    Leiden,
}

impl CommunityMethod {
    pub fn detector(&self) -> Box<dyn CommunityDetection> {
        match self {
            CommunityMethod::Louvain => Box::new(crate::louvain::Louvain),
            CommunityMethod::Leiden => Box::new(crate::leiden::Leiden::default()),
        }
    }
}

/// Common checks before any detection
pub(crate) fn check_input(graph: &WeightedGraph, params: &CommunityParams) -> anyhow::Result<()> {
    if graph.num_nodes() == 0 {
        return Err(MungError::EmptyGraph.into());
    }
    params.validate()
}

/// Move single nodes between communities while modularity improves.
///
/// Nodes are visited in index order each pass. A node is first taken
/// out of its community, then placed in the neighbouring community of
/// largest gain `k_i,C - ρ k_i Σ_C / 2m`; it stays unless another
/// community beats staying by [`GAIN_EPS`]. Equal best gains are
/// broken by `rng`. Returns whether any node moved.
pub(crate) fn local_moving(
    graph: &WeightedGraph,
    membership: &mut [usize],
    params: &CommunityParams,
    rng: &mut StdRng,
    interrupt: &Interrupt,
) -> anyhow::Result<bool> {
    let nn = graph.num_nodes();
    let m2 = graph.total_weight();
    if m2 <= 0.0 {
        return Ok(false);
    }

    let ncomm = membership.iter().copied().max().map(|x| x + 1).unwrap_or(0);
    let mut sigma_tot = vec![0f64; ncomm.max(nn)];
    for i in 0..nn {
        sigma_tot[membership[i]] += graph.degree(i);
    }

    let rho = params.resolution;
    let mut any_move = false;
    let mut links: HashMap<usize, f64> = HashMap::default();

    for pass in 0..params.max_passes {
        interrupt.check()?;
        let mut moves = 0usize;

        for i in 0..nn {
            let old = membership[i];
            let k_i = graph.degree(i);

            links.clear();
            links.insert(old, 0.0);
            for (j, w) in graph.neighbors(i) {
                *links.entry(membership[j]).or_default() += w;
            }

            sigma_tot[old] -= k_i;

            let gain = |c: usize, k_ic: f64| k_ic - rho * k_i * sigma_tot[c] / m2;
            let stay = gain(old, links[&old]);

            let mut others: Vec<(usize, f64)> = links
                .iter()
                .filter(|&(&c, _)| c != old)
                .map(|(&c, &k_ic)| (c, k_ic))
                .collect();
            others.sort_unstable_by_key(|&(c, _)| c);

            let mut best_gain = stay;
            let mut tied: Vec<usize> = vec![];
            for (c, k_ic) in others {
                let g = gain(c, k_ic);
                if g > best_gain + GAIN_EPS {
                    best_gain = g;
                    tied.clear();
                    tied.push(c);
                } else if !tied.is_empty() && (g - best_gain).abs() <= GAIN_EPS {
                    tied.push(c);
                }
            }

            let new = match tied.len() {
                0 => old,
                1 => tied[0],
                _ => tied[rng.random_range(0..tied.len())],
            };

            sigma_tot[new] += k_i;
            if new != old {
                membership[i] = new;
                moves += 1;
            }
        }

        log::debug!("pass {}: {} moves", pass + 1, moves);
        if moves == 0 {
            break;
        }
        any_move = true;
    }

    Ok(any_move)
}

/// Binary search on the resolution to get close to `target_k`
/// communities. Lower resolution gives fewer communities.
pub fn tune_resolution(
    graph: &WeightedGraph,
    detector: &dyn CommunityDetection,
    target_k: usize,
    params: &CommunityParams,
    interrupt: &Interrupt,
) -> anyhow::Result<Communities> {
    if target_k == 0 {
        return Err(MungError::invalid("target_k", "must be at least 1"));
    }

    let mut lo = 1e-6_f64;
    let mut hi = 10.0_f64.max(2.0 * params.resolution);
    let mut best = detector.detect(graph, params, interrupt)?;

    info!(
        "  resolution={:.6} → {} clusters (target {})",
        params.resolution, best.result.n_clusters, target_k
    );

    if best.result.n_clusters == target_k {
        return Ok(best);
    }

    const MAX_EXPAND: usize = 10;

    if best.result.n_clusters > target_k {
        hi = params.resolution;
    } else {
        lo = params.resolution;

        // widen the upper end until it overshoots the target
        for _ in 0..MAX_EXPAND {
            let upper = detector.detect(
                graph,
                &CommunityParams {
                    resolution: hi,
                    ..*params
                },
                interrupt,
            )?;

            info!("  resolution={:.6} → {} clusters", hi, upper.result.n_clusters);

            let n_upper = upper.result.n_clusters;
            if n_upper.abs_diff(target_k) < best.result.n_clusters.abs_diff(target_k) {
                best = upper;
            }
            if n_upper == target_k {
                return Ok(best);
            }
            if n_upper > target_k || n_upper == graph.num_nodes() {
                break;
            }
            lo = hi;
            hi *= 2.0;
        }
    }

    const MAX_SEARCH: usize = 20;

    for step in 0..MAX_SEARCH {
        let mid = (lo + hi) / 2.0;
        let current = detector.detect(
            graph,
            &CommunityParams {
                resolution: mid,
                ..*params
            },
            interrupt,
        )?;

        info!(
            "  step {}: resolution={:.6} → {} clusters",
            step + 1,
            mid,
            current.result.n_clusters
        );

        if current.result.n_clusters > target_k {
            hi = mid;
        } else {
            lo = mid;
        }

        let cur_diff = current.result.n_clusters.abs_diff(target_k);
        let best_diff = best.result.n_clusters.abs_diff(target_k);
        if cur_diff < best_diff {
            best = current;
        }

        if best.result.n_clusters == target_k || (hi - lo) / hi.max(1e-10) < 1e-4 {
            break;
        }
    }

    info!(
        "  best resolution={:.6} → {} clusters (target {})",
        best.resolution, best.result.n_clusters, target_k
    );

    Ok(best)
}

/// Independent runs, e.g. over resolutions or seeds, in parallel
pub fn detect_many(
    graph: &WeightedGraph,
    detector: &dyn CommunityDetection,
    runs: &[CommunityParams],
    interrupt: &Interrupt,
) -> anyhow::Result<Vec<Communities>> {
    runs.par_iter()
        .progress_count(runs.len() as u64)
        .map(|params| detector.detect(graph, params, interrupt))
        .collect()
}

/// Count connected components using DFS.
pub fn count_components(graph: &WeightedGraph) -> usize {
    let n = graph.num_nodes();
    let mut visited = vec![false; n];
    let mut n_components = 0;

    for start in 0..n {
        if visited[start] {
            continue;
        }
        n_components += 1;
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            if visited[node] {
                continue;
            }
            visited[node] = true;
            for (neighbor, _) in graph.neighbors(node) {
                if !visited[neighbor] {
                    stack.push(neighbor);
                }
            }
        }
    }

    n_components
}
