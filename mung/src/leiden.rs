//! Leiden: Louvain-style local moving followed by a refinement of each
//! community into well-connected sub-communities, which become the
//! nodes of the next level.

use crate::common::*;
use crate::community::*;

use fnv::FnvHashMap as HashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Clone, Copy, Debug)]
pub struct Leiden {
    /// randomness of the refinement merges
    pub theta: f64,
}

impl Default for Leiden {
    fn default() -> Self {
        Self { theta: 0.01 }
    }
}

impl Leiden {
    /// Split each community of `comm` into well-connected parts.
    ///
    /// Every node starts alone. A node still alone and well connected to
    /// the rest of its community may join a well-connected part of the
    /// same community with non-negative gain, drawn with probability
    /// ∝ exp(gain / θ). Returns part ids (node ids of the founders).
    fn refine(
        &self,
        graph: &WeightedGraph,
        comm: &[usize],
        n_comm: usize,
        resolution: f64,
        rng: &mut StdRng,
    ) -> Vec<usize> {
        let nn = graph.num_nodes();
        let scale = resolution / graph.total_weight();

        let mut part: Vec<usize> = (0..nn).collect();
        let mut alone = vec![true; nn];
        let mut part_k: Vec<f64> = (0..nn).map(|v| graph.degree(v)).collect();
        let mut comm_k = vec![0f64; n_comm];
        // weight from a part to the rest of its community
        let mut external = vec![0f64; nn];

        for v in 0..nn {
            comm_k[comm[v]] += graph.degree(v);
            external[v] = graph
                .neighbors(v)
                .filter(|&(u, _)| comm[u] == comm[v])
                .map(|(_, w)| w)
                .sum();
        }

        let mut links: HashMap<usize, f64> = HashMap::default();

        for v in 0..nn {
            if !alone[v] {
                continue;
            }
            let s = comm[v];
            let k_v = graph.degree(v);
            if external[v] < scale * k_v * (comm_k[s] - k_v) {
                continue;
            }

            links.clear();
            for (u, w) in graph.neighbors(v).filter(|&(u, _)| comm[u] == s) {
                *links.entry(part[u]).or_default() += w;
            }

            let mut cand: Vec<(usize, f64, f64)> = links
                .iter()
                .filter(|&(&t, _)| t != part[v])
                .filter(|&(&t, _)| external[t] >= scale * part_k[t] * (comm_k[s] - part_k[t]))
                .map(|(&t, &w_vt)| (t, w_vt - scale * k_v * part_k[t], w_vt))
                .filter(|&(_, gain, _)| gain >= 0.0)
                .collect();

            if cand.is_empty() {
                continue;
            }
            cand.sort_unstable_by_key(|&(t, _, _)| t);

            let top = cand.iter().map(|x| x.1).fold(f64::NEG_INFINITY, f64::max);
            let probs: Vec<f64> = cand.iter().map(|x| ((x.1 - top) / self.theta).exp()).collect();
            let mut draw = rng.random::<f64>() * probs.iter().sum::<f64>();
            let mut pick = cand.len() - 1;
            for (i, p) in probs.iter().enumerate() {
                if draw < *p {
                    pick = i;
                    break;
                }
                draw -= p;
            }

            let (t, _, w_vt) = cand[pick];
            part[v] = t;
            part_k[t] += k_v;
            external[t] += external[v] - 2.0 * w_vt;
            alone[v] = false;
            alone[t] = false;
        }

        part
    }
}

impl CommunityDetection for Leiden {
    fn name(&self) -> &'static str {
        "leiden"
    }

    fn detect(
        &self,
        graph: &WeightedGraph,
        params: &CommunityParams,
        interrupt: &Interrupt,
    ) -> anyhow::Result<Communities> {
        check_input(graph, params)?;
        if !(self.theta.is_finite() && self.theta > 0.0) {
            return Err(crate::error::MungError::invalid("theta", "must be positive"));
        }

        let mut rng = StdRng::seed_from_u64(params.seed);

        // original node -> refined part of the current level
        let mut node_of: Vec<usize> = (0..graph.num_nodes()).collect();
        let mut levels: Vec<Vec<usize>> = vec![];
        let mut current = graph.clone();
        let mut membership: Vec<usize> = (0..graph.num_nodes()).collect();

        for level in 0..params.max_levels {
            let moved = local_moving(&current, &mut membership, params, &mut rng, interrupt)?;
            let (comm, n_comm) = renumber(&membership);

            if n_comm == current.num_nodes() || (!moved && level > 0) {
                break;
            }

            levels.push(node_of.iter().map(|&v| comm[v]).collect());

            let part = self.refine(&current, &comm, n_comm, params.resolution, &mut rng);
            let (part, n_part) = renumber(&part);

            info!(
                "leiden level {}: {} nodes → {} communities, {} refined",
                level + 1,
                current.num_nodes(),
                n_comm,
                n_part
            );

            if n_part == current.num_nodes() {
                break;
            }

            // next level starts from the unrefined communities
            let mut next = vec![0usize; n_part];
            for v in 0..current.num_nodes() {
                next[part[v]] = comm[v];
            }

            for v in node_of.iter_mut() {
                *v = part[*v];
            }
            current = current.aggregate(&part, n_part);
            membership = next;
        }

        let ret = Communities::finish(graph, levels, params);
        info!(
            "leiden: {} communities, modularity {:.4} (resolution {})",
            ret.result.n_clusters, ret.modularity, params.resolution
        );
        Ok(ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::community::tests::cliques;
    use crate::louvain::Louvain;

    #[test]
    fn separated_cliques() {
        let g = cliques(3, 6, 0.1);
        let out = Leiden::default()
            .detect(&g, &CommunityParams::default(), &Interrupt::default())
            .unwrap();
        assert_eq!(out.result.n_clusters, 3);
        for c in 0..3 {
            let first = out.result.labels[c * 6];
            assert!(out.result.labels[c * 6..(c + 1) * 6].iter().all(|&l| l == first));
        }
    }

    #[test]
    fn agrees_with_louvain_on_cliques() {
        let g = cliques(4, 5, 0.05);
        let params = CommunityParams::default();
        let a = Leiden::default().detect(&g, &params, &Interrupt::default()).unwrap();
        let b = Louvain.detect(&g, &params, &Interrupt::default()).unwrap();
        assert_eq!(a.result, b.result);
        approx::assert_abs_diff_eq!(a.modularity, b.modularity, epsilon = 1e-9);
    }

    #[test]
    fn refined_parts_stay_inside_communities() {
        let g = cliques(2, 5, 0.5);
        let comm: Vec<usize> = (0..10).map(|i| i / 5).collect();
        let mut rng = StdRng::seed_from_u64(0);
        let part = Leiden::default().refine(&g, &comm, 2, 1.0, &mut rng);
        for i in 0..10 {
            for j in 0..10 {
                if part[i] == part[j] {
                    assert_eq!(comm[i], comm[j]);
                }
            }
        }
    }
}
