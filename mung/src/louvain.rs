//! Multi-level Louvain: local moving, then aggregation of the found
//! communities into single nodes, until nothing moves

use crate::common::*;
use crate::community::*;

use rand::rngs::StdRng;
use rand::SeedableRng;

#[derive(Clone, Copy, Debug, Default)]
pub struct Louvain;

impl CommunityDetection for Louvain {
    fn name(&self) -> &'static str {
        "louvain"
    }

    fn detect(
        &self,
        graph: &WeightedGraph,
        params: &CommunityParams,
        interrupt: &Interrupt,
    ) -> anyhow::Result<Communities> {
        check_input(graph, params)?;

        let mut rng = StdRng::seed_from_u64(params.seed);

        // original node -> node of the current level
        let mut node_of: Vec<usize> = (0..graph.num_nodes()).collect();
        let mut levels: Vec<Vec<usize>> = vec![];
        let mut current = graph.clone();

        for level in 0..params.max_levels {
            let mut membership: Vec<usize> = (0..current.num_nodes()).collect();
            let moved = local_moving(&current, &mut membership, params, &mut rng, interrupt)?;
            let (membership, n_comm) = renumber(&membership);

            if !moved || n_comm == current.num_nodes() {
                break;
            }

            for v in node_of.iter_mut() {
                *v = membership[*v];
            }
            levels.push(node_of.clone());

            info!(
                "louvain level {}: {} nodes → {} communities",
                level + 1,
                current.num_nodes(),
                n_comm
            );
            current = current.aggregate(&membership, n_comm);
        }

        let ret = Communities::finish(graph, levels, params);
        info!(
            "louvain: {} communities, modularity {:.4} (resolution {})",
            ret.result.n_clusters, ret.modularity, params.resolution
        );
        Ok(ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::community::tests::cliques;

    #[test]
    fn separated_cliques() {
        let g = cliques(3, 6, 0.1);
        let out = Louvain
            .detect(&g, &CommunityParams::default(), &Interrupt::default())
            .unwrap();
        assert_eq!(out.result.n_clusters, 3);
        for c in 0..3 {
            let first = out.result.labels[c * 6];
            assert!(out.result.labels[c * 6..(c + 1) * 6].iter().all(|&l| l == first));
        }
        assert!(out.modularity > 0.5);
    }

    #[test]
    fn levels_cover_every_node() {
        let g = cliques(4, 5, 0.3);
        let out = Louvain
            .detect(&g, &CommunityParams::default(), &Interrupt::default())
            .unwrap();
        assert!(!out.levels.is_empty());
        for level in out.levels.iter() {
            assert_eq!(level.len(), g.num_nodes());
        }
        // each level coarsens the previous one
        for pair in out.levels.windows(2) {
            for i in 0..g.num_nodes() {
                for j in 0..g.num_nodes() {
                    if pair[0][i] == pair[0][j] {
                        assert_eq!(pair[1][i], pair[1][j]);
                    }
                }
            }
        }
    }

    #[test]
    fn same_seed_same_partition() {
        let g = cliques(3, 4, 1.0);
        let params = CommunityParams {
            seed: 7,
            ..Default::default()
        };
        let a = Louvain.detect(&g, &params, &Interrupt::default()).unwrap();
        let b = Louvain.detect(&g, &params, &Interrupt::default()).unwrap();
        assert_eq!(a.result, b.result);
    }
}
