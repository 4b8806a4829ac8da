//! Cross-dataset anchors: mutual nearest neighbours scored by the
//! consistency of their local neighbourhoods

use crate::common::*;
use crate::embedding::Embedding;
use crate::error::MungError;
use crate::neighbors::*;

use fnv::FnvHashMap as HashMap;
use matrix_util::knn_graph::KnnLists;
use matrix_util::utils::generate_minibatch_intervals;
use rayon::prelude::*;
use serde::Serialize;

/// A pair of corresponding cells in datasets A and B
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Anchor {
    /// row in A
    pub cell_a: usize,
    /// row in B
    pub cell_b: usize,
    /// neighbourhood consistency in [0, 1]
    pub score: f32,
    /// distance in the search space
    pub distance: f32,
}

/// Anchors between two batches, sorted by (A row, B row)
#[derive(Clone, Debug)]
pub struct AnchorSet {
    batch_a: Box<str>,
    batch_b: Box<str>,
    anchors: Vec<Anchor>,
    num_candidates: usize,
}

impl AnchorSet {
    pub(crate) fn from_parts(batch_a: &str, batch_b: &str, mut anchors: Vec<Anchor>, num_candidates: usize) -> Self {
        anchors.sort_by_key(|x| (x.cell_a, x.cell_b));
        Self {
            batch_a: batch_a.into(),
            batch_b: batch_b.into(),
            anchors,
            num_candidates,
        }
    }

    pub fn batch_a(&self) -> &str {
        &self.batch_a
    }

    pub fn batch_b(&self) -> &str {
        &self.batch_b
    }

    pub fn anchors(&self) -> &[Anchor] {
        &self.anchors
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    /// mutual-neighbour pairs before scoring and selection
    pub fn num_candidates(&self) -> usize {
        self.num_candidates
    }

    pub fn mean_score(&self) -> f32 {
        if self.anchors.is_empty() {
            0.0
        } else {
            self.anchors.iter().map(|x| x.score).sum::<f32>() / self.anchors.len() as f32
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct AnchorConfig {
    /// cross-dataset neighbours searched for mutual pairs
    pub k_anchor: usize,
    /// neighbourhood size used for consistency scoring
    pub k_filter: usize,
    /// drop anchors scoring below this
    pub min_score: f32,
    /// a neighbour counts as consistent only above this overlap
    pub min_overlap: f32,
    pub search: SearchPolicy,
    pub block_size: usize,
}

impl AnchorConfig {
    /// `min_score` has no default
    pub fn new(min_score: f32) -> Self {
        Self {
            k_anchor: 5,
            k_filter: 30,
            min_score,
            min_overlap: 0.0,
            search: SearchPolicy::Exact,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }

    fn knn(&self, knn: usize) -> KnnConfig {
        KnnConfig {
            knn,
            policy: self.search,
            block_size: self.block_size,
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.k_anchor == 0 {
            return Err(MungError::invalid("k_anchor", "must be at least 1"));
        }
        if self.k_filter == 0 {
            return Err(MungError::invalid("k_filter", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.min_score) {
            return Err(MungError::invalid("min_score", "must lie in [0, 1]"));
        }
        if !(0.0..1.0).contains(&self.min_overlap) {
            return Err(MungError::invalid("min_overlap", "must lie in [0, 1)"));
        }
        Ok(())
    }
}

/// |x ∩ y| / |x ∪ y| of two sorted sets
fn jaccard_sorted(xx: &[usize], yy: &[usize]) -> f32 {
    let (mut i, mut j, mut shared) = (0, 0, 0);
    while i < xx.len() && j < yy.len() {
        match xx[i].cmp(&yy[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                shared += 1;
                i += 1;
                j += 1;
            }
        }
    }
    let union = xx.len() + yy.len() - shared;
    if union == 0 {
        0.0
    } else {
        shared as f32 / union as f32
    }
}

/// Mutual pairs of the two cross-dataset lists with their A→B distance
fn mutual_pairs(ab: &KnnLists, ba: &KnnLists) -> Vec<(usize, usize, f32)> {
    ab.indices
        .par_iter()
        .zip(ab.distances.par_iter())
        .enumerate()
        .flat_map_iter(|(a, (bs, ds))| {
            bs.iter()
                .zip(ds.iter())
                .filter(move |&(&b, _)| ba.indices[b].contains(&a))
                .map(move |(&b, &d)| (a, b, d))
        })
        .collect()
}

/// Pick one anchor per cell on each side, best first
fn select_one_to_one(mut scored: Vec<Anchor>, na: usize, nb: usize) -> Vec<Anchor> {
    scored.sort_by(|x, y| {
        y.score
            .total_cmp(&x.score)
            .then(x.distance.total_cmp(&y.distance))
            .then(x.cell_a.cmp(&y.cell_a))
            .then(x.cell_b.cmp(&y.cell_b))
    });

    let mut used_a = vec![false; na];
    let mut used_b = vec![false; nb];
    scored
        .into_iter()
        .filter(|x| {
            if used_a[x.cell_a] || used_b[x.cell_b] {
                false
            } else {
                used_a[x.cell_a] = true;
                used_b[x.cell_b] = true;
                true
            }
        })
        .collect()
}

/// Find anchors between `a` and `b`.
///
/// 1. cross-dataset `k_anchor`-NN in both directions;
/// 2. mutual pairs become candidates;
/// 3. a candidate (a, b) is scored by the fraction of a's closed
///    within-A neighbourhood that has its own candidate partner inside
///    b's closed within-B neighbourhood, with shared-neighbour overlap
///    in the union space above `min_overlap`;
/// 4. candidates below `min_score` are dropped and the rest selected
///    one-to-one by (score desc, distance asc, a, b).
///
/// Fails with `NoAnchorsFound` if nothing survives.
pub fn find_anchors(
    a: &Embedding,
    b: &Embedding,
    config: &AnchorConfig,
    interrupt: &Interrupt,
) -> anyhow::Result<AnchorSet> {
    a.ensure_same_basis(b)?;
    config.validate()?;

    let no_anchors = || -> anyhow::Error {
        MungError::NoAnchorsFound {
            batch_a: a.batch().to_string(),
            batch_b: b.batch().to_string(),
        }
        .into()
    };

    let na = a.num_cells();
    let nb = b.num_cells();

    //////////////////////////////////////////////
    // step 1: mutual nearest neighbour pairs   //
    //////////////////////////////////////////////

    let ab = knn_between(a, b, &config.knn(config.k_anchor), interrupt)?;
    let ba = knn_between(b, a, &config.knn(config.k_anchor), interrupt)?;

    let candidates = mutual_pairs(&ab, &ba);
    info!(
        "{} mutual pairs between '{}' ({} cells) and '{}' ({} cells)",
        candidates.len(),
        a.batch(),
        na,
        b.batch(),
        nb
    );

    if candidates.is_empty() {
        return Err(no_anchors());
    }

    //////////////////////////////////////////////
    // step 2: neighbourhoods for scoring       //
    //////////////////////////////////////////////

    let within_a = knn_within(a, &config.knn(config.k_filter), interrupt)?;
    let within_b = knn_within(b, &config.knn(config.k_filter), interrupt)?;
    let union = knn_union(a, b, &config.knn(config.k_filter), interrupt)?;

    // shared-neighbour overlap of every candidate in the union space
    let overlap: HashMap<(usize, usize), f32> = candidates
        .par_iter()
        .map(|&(ia, ib, _)| {
            let na_u = union.closed_neighbourhood(ia);
            let nb_u = union.closed_neighbourhood(na + ib);
            ((ia, ib), jaccard_sorted(&na_u, &nb_u))
        })
        .collect();

    let mut partners: HashMap<usize, Vec<usize>> = HashMap::default();
    for &(ia, ib, _) in candidates.iter() {
        if overlap[&(ia, ib)] > config.min_overlap {
            partners.entry(ia).or_default().push(ib);
        }
    }

    //////////////////////////////////////////////
    // step 3: consistency scores               //
    //////////////////////////////////////////////

    let jobs = generate_minibatch_intervals(candidates.len(), config.block_size);

    let scored = jobs
        .into_par_iter()
        .map(|(lb, ub)| -> anyhow::Result<Vec<Anchor>> {
            interrupt.check()?;
            Ok(candidates[lb..ub]
                .iter()
                .map(|&(ia, ib, distance)| {
                    // a's own pair does not vote for itself
                    let hood_a = &within_a.indices[ia];
                    let hood_b = within_b.closed_neighbourhood(ib);
                    let consistent = hood_a
                        .iter()
                        .filter(|&&a_prime| {
                            partners.get(&a_prime).is_some_and(|bs| {
                                bs.iter().any(|b_prime| hood_b.binary_search(b_prime).is_ok())
                            })
                        })
                        .count();
                    Anchor {
                        cell_a: ia,
                        cell_b: ib,
                        score: consistent as f32 / hood_a.len().max(1) as f32,
                        distance,
                    }
                })
                .collect())
        })
        .collect::<anyhow::Result<Vec<_>>>()?
        .into_iter()
        .flatten()
        .filter(|x| x.score >= config.min_score)
        .collect::<Vec<_>>();

    info!("{} candidates score at least {:.3}", scored.len(), config.min_score);

    //////////////////////////////////////////////
    // step 4: one-to-one selection             //
    //////////////////////////////////////////////

    let selected = select_one_to_one(scored, na, nb);

    if selected.is_empty() {
        return Err(no_anchors());
    }

    let ret = AnchorSet::from_parts(a.batch(), b.batch(), selected, candidates.len());
    info!(
        "{} anchors between '{}' and '{}' (mean score {:.3})",
        ret.len(),
        a.batch(),
        b.batch(),
        ret.mean_score()
    );
    Ok(ret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::BasisId;

    #[test]
    fn jaccard_of_sorted_sets() {
        assert_eq!(jaccard_sorted(&[1, 2, 3], &[2, 3, 4]), 0.5);
        assert_eq!(jaccard_sorted(&[1], &[2]), 0.0);
        assert_eq!(jaccard_sorted(&[], &[]), 0.0);
    }

    #[test]
    fn one_to_one_prefers_score_then_distance() {
        let cand = vec![
            Anchor { cell_a: 0, cell_b: 0, score: 0.5, distance: 0.1 },
            Anchor { cell_a: 0, cell_b: 1, score: 0.9, distance: 0.5 },
            Anchor { cell_a: 1, cell_b: 1, score: 0.9, distance: 0.2 },
            Anchor { cell_a: 1, cell_b: 0, score: 0.4, distance: 0.1 },
        ];
        let sel = select_one_to_one(cand, 2, 2);
        assert_eq!(sel.len(), 2);
        assert_eq!((sel[0].cell_a, sel[0].cell_b), (1, 1));
        assert_eq!((sel[1].cell_a, sel[1].cell_b), (0, 0));
    }

    #[test]
    fn matched_lines_give_mutual_anchors() {
        // B is A shifted by a small amount: each cell's partner is mutual
        let xs: Vec<f32> = (0..40).map(|i| i as f32).collect();
        let ys: Vec<f32> = xs.iter().map(|x| x + 0.1).collect();
        let cells = |p: &str| (0..40).map(|i| format!("{}{}", p, i).into_boxed_str()).collect::<Vec<_>>();
        let a = Embedding::new("a", cells("a"), Mat::from_column_slice(40, 1, &xs), BasisId(0)).unwrap();
        let b = Embedding::new("b", cells("b"), Mat::from_column_slice(40, 1, &ys), BasisId(0)).unwrap();

        let mut config = AnchorConfig::new(0.5);
        config.k_anchor = 3;
        config.k_filter = 5;
        let set = find_anchors(&a, &b, &config, &Interrupt::default()).unwrap();

        assert!(set.len() > 30);
        assert!(set.len() <= 40);
        for x in set.anchors() {
            assert_eq!(x.cell_a, x.cell_b);
            assert!(x.score >= 0.5 && x.score <= 1.0);
        }
        let keys: Vec<_> = set.anchors().iter().map(|x| (x.cell_a, x.cell_b)).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn invalid_parameters() {
        let a = Embedding::new("a", vec!["x".into(), "y".into()], Mat::zeros(2, 1), BasisId(0)).unwrap();
        let mut config = AnchorConfig::new(1.5);
        let err = find_anchors(&a, &a, &config, &Interrupt::default()).unwrap_err();
        assert!(matches!(MungError::of(&err), Some(MungError::InvalidParameter { name: "min_score", .. })));

        config.min_score = 0.5;
        config.k_anchor = 0;
        let err = find_anchors(&a, &a, &config, &Interrupt::default()).unwrap_err();
        assert!(matches!(MungError::of(&err), Some(MungError::InvalidParameter { name: "k_anchor", .. })));
    }

    #[test]
    fn lone_pair_scores_zero() {
        // a0 and b0 sit together; every other cell is far away and has
        // no partner of its own
        let xa: Vec<f32> = std::iter::once(0.).chain((0..5).map(|i| 100. + i as f32)).collect();
        let xb: Vec<f32> = std::iter::once(0.1).chain((0..5).map(|i| -100. - i as f32)).collect();
        let cells = |p: &str| (0..6).map(|i| format!("{}{}", p, i).into_boxed_str()).collect::<Vec<_>>();
        let a = Embedding::new("a", cells("a"), Mat::from_column_slice(6, 1, &xa), BasisId(0)).unwrap();
        let b = Embedding::new("b", cells("b"), Mat::from_column_slice(6, 1, &xb), BasisId(0)).unwrap();

        let mut config = AnchorConfig::new(0.0);
        config.k_anchor = 1;
        config.k_filter = 2;
        let set = find_anchors(&a, &b, &config, &Interrupt::default()).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!((set.anchors()[0].cell_a, set.anchors()[0].cell_b), (0, 0));
        assert_eq!(set.anchors()[0].score, 0.0);

        config.min_score = 0.1;
        let err = find_anchors(&a, &b, &config, &Interrupt::default()).unwrap_err();
        assert!(matches!(MungError::of(&err), Some(MungError::NoAnchorsFound { .. })));
    }
}
