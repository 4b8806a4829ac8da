//! Shared low-rank bases for several batches
//!
//! Pooled PCA by default, CCA for a pair of batches, and per-batch
//! alignment of the resulting embeddings into a common search space.

use crate::common::*;
use crate::dataset::Dataset;
use crate::embedding::{BasisId, Embedding};
use crate::error::MungError;

use matrix_util::traits::{MatOps, RandomizedAlgs};
use serde::Serialize;

/// singular values below this fraction of the largest count as zero
const RANK_TOL: f32 = 1e-5;

pub const DEFAULT_CLIP: f32 = 10.0;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum Decomposition {
    /// full SVD of the pooled matrix
    #[default]
    Exact,
    /// randomized SVD with a fixed test-matrix seed
    Randomized { seed: u64 },
}

#[derive(Clone, Debug, Serialize)]
pub struct ProjectionConfig {
    /// number of components k
    pub rank: usize,
    /// non-negative per-feature weights applied before decomposition
    pub feature_weights: Option<Vec<f32>>,
    /// z-score features on pooled statistics
    pub standardize: bool,
    /// clip standardized values to [-clip, clip]
    pub clip: f32,
    pub decomposition: Decomposition,
}

impl ProjectionConfig {
    pub fn with_rank(rank: usize) -> Self {
        Self {
            rank,
            feature_weights: None,
            standardize: false,
            clip: DEFAULT_CLIP,
            decomposition: Decomposition::Exact,
        }
    }
}

/// Centre, scale and loadings of a pooled decomposition
#[derive(Clone, Debug)]
pub struct ProjectionBasis {
    pub features: Vec<Box<str>>,
    pub centre: DVec,
    pub scale: Option<DVec>,
    pub clip: f32,
    pub weights: Option<DVec>,
    /// features × k, unit columns
    pub loadings: Mat,
    pub singular_values: DVec,
    pub id: BasisId,
}

impl ProjectionBasis {
    pub fn rank(&self) -> usize {
        self.loadings.ncols()
    }

    fn transform(&self, data: &Mat) -> Mat {
        let mut xx = data.clone();
        for (j, mut x_j) in xx.column_iter_mut().enumerate() {
            x_j.add_scalar_mut(-self.centre[j]);
            if let Some(scale) = &self.scale {
                x_j /= scale[j];
                let clip = self.clip;
                x_j.apply(|x| *x = x.clamp(-clip, clip));
            }
            if let Some(w) = &self.weights {
                x_j *= w[j];
            }
        }
        xx
    }

    /// Project the cells of a dataset into this basis
    pub fn project(&self, dataset: &Dataset) -> anyhow::Result<Embedding> {
        if dataset.num_features() != self.features.len() {
            return Err(MungError::mismatch(
                format!("features of '{}' vs projection basis", dataset.batch()),
                self.features.len(),
                dataset.num_features(),
            ));
        }
        if let Some(j) = (0..self.features.len()).find(|&j| dataset.features()[j] != self.features[j]) {
            return Err(MungError::mismatch(
                format!(
                    "feature vocabulary of '{}' vs projection basis (differs at '{}')",
                    dataset.batch(),
                    dataset.features()[j]
                ),
                self.features.len(),
                j,
            ));
        }
        let coords = self.transform(dataset.data()) * &self.loadings;
        Embedding::new(dataset.batch(), dataset.cell_ids().to_vec(), coords, self.id)
    }
}

fn validate_common(datasets: &[&Dataset], rank: usize) -> anyhow::Result<()> {
    let first = datasets
        .first()
        .ok_or_else(|| MungError::invalid("datasets", "at least one dataset is needed"))?;
    for ds in datasets.iter().skip(1) {
        first.ensure_same_features(ds)?;
    }
    if rank == 0 {
        return Err(MungError::invalid("rank", "must be at least 1"));
    }
    Ok(())
}

/// Flip each component so its largest-magnitude entry in `mat` is
/// positive; returns the signs applied
fn fix_signs(mat: &mut Mat) -> Vec<f32> {
    mat.column_iter_mut()
        .map(|mut col| {
            let mut best = 0;
            for (i, x) in col.iter().enumerate() {
                if x.abs() > col[best].abs() {
                    best = i;
                }
            }
            if col[best] < 0.0 {
                col.neg_mut();
                -1.0
            } else {
                1.0
            }
        })
        .collect()
}

fn numeric_rank(singular_values: &[f32]) -> usize {
    match singular_values.first() {
        Some(&s0) if s0 > 0.0 => singular_values.iter().filter(|&&s| s > RANK_TOL * s0).count(),
        _ => 0,
    }
}

/// Rank-`rank` factors (U, d, V) with descending singular values,
/// failing with `DegenerateInput` when `xx` supports fewer components
fn decompose(xx: Mat, rank: usize, decomposition: Decomposition) -> anyhow::Result<(Mat, DVec, Mat)> {
    let bound = xx.nrows().min(xx.ncols()).saturating_sub(1);
    if rank > bound {
        return Err(MungError::DegenerateInput {
            requested: rank,
            achievable: bound,
        }
        .into());
    }

    let (uu, dd, vv) = match decomposition {
        Decomposition::Exact => {
            let svd = xx.svd(true, true);
            let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
                anyhow::bail!("SVD failed");
            };
            let mut order = (0..svd.singular_values.len()).collect::<Vec<_>>();
            order.sort_by(|&a, &b| {
                svd.singular_values[b]
                    .total_cmp(&svd.singular_values[a])
                    .then(a.cmp(&b))
            });
            let dd = DVec::from_iterator(order.len(), order.iter().map(|&k| svd.singular_values[k]));
            (u.select_columns(order.iter()), dd, v_t.transpose().select_columns(order.iter()))
        }
        Decomposition::Randomized { seed } => xx.rsvd_seeded(rank, seed)?,
    };

    let achievable = numeric_rank(dd.as_slice()).min(bound);
    if rank > achievable {
        return Err(MungError::DegenerateInput {
            requested: rank,
            achievable,
        }
        .into());
    }

    Ok((
        uu.columns(0, rank).into_owned(),
        dd.rows(0, rank).into_owned(),
        vv.columns(0, rank).into_owned(),
    ))
}

/// Validated per-feature weights of `config`, if any
fn feature_weights(config: &ProjectionConfig, nfeatures: usize) -> anyhow::Result<Option<DVec>> {
    match &config.feature_weights {
        Some(w) if w.len() != nfeatures => Err(MungError::mismatch("feature weights", nfeatures, w.len())),
        Some(w) if w.iter().any(|x| !x.is_finite() || *x < 0.0) => Err(MungError::invalid(
            "feature_weights",
            "weights must be finite and non-negative",
        )),
        Some(w) => Ok(Some(DVec::from_column_slice(w))),
        None => Ok(None),
    }
}

/// Decompose the pooled, centred matrix of all datasets and project
/// every dataset into the resulting basis.
///
/// * `datasets` - same feature vocabulary
/// * `config` - rank and preprocessing
pub fn project_datasets(
    datasets: &[&Dataset],
    config: &ProjectionConfig,
) -> anyhow::Result<(ProjectionBasis, Vec<Embedding>)> {
    validate_common(datasets, config.rank)?;
    let nfeatures = datasets[0].num_features();

    let weights = feature_weights(config, nfeatures)?;

    if config.standardize && !(config.clip > 0.0) {
        return Err(MungError::invalid("clip", "must be positive"));
    }

    let pooled = vstack(&datasets.iter().map(|d| d.data()).collect::<Vec<_>>());
    let ntot = pooled.nrows() as f32;

    info!(
        "pooled {} cells × {} features from {} dataset(s)",
        pooled.nrows(),
        nfeatures,
        datasets.len()
    );

    let centre = DVec::from_iterator(nfeatures, pooled.column_iter().map(|x_j| x_j.mean()));

    let scale = if config.standardize {
        let sd = pooled.column_iter().enumerate().map(|(j, x_j)| {
            let ss = x_j.iter().map(|x| (x - centre[j]).powi(2)).sum::<f32>();
            let sd = (ss / ntot).sqrt();
            if sd > 0.0 {
                sd
            } else {
                1.0
            }
        });
        Some(DVec::from_iterator(nfeatures, sd))
    } else {
        None
    };

    let mut basis = ProjectionBasis {
        features: datasets[0].features().to_vec(),
        centre,
        scale,
        clip: config.clip,
        weights,
        loadings: Mat::zeros(nfeatures, 0),
        singular_values: DVec::zeros(0),
        id: BasisId(0),
    };

    let xx = basis.transform(&pooled);
    let (_, dd, mut vv) = decompose(xx, config.rank, config.decomposition)?;
    fix_signs(&mut vv);

    info!(
        "rank {} basis, leading singular value {:.4}",
        config.rank,
        dd.get(0).copied().unwrap_or(0.0)
    );

    basis.id = BasisId::of_matrices("pca", &[&vv, &Mat::from_column_slice(nfeatures, 1, basis.centre.as_slice())]);
    basis.loadings = vv;
    basis.singular_values = dd;

    let embeddings = datasets
        .iter()
        .map(|ds| basis.project(ds))
        .collect::<anyhow::Result<Vec<_>>>()?;

    Ok((basis, embeddings))
}

/// Canonical correlation embedding of two datasets: the SVD of the
/// cross-product of the per-dataset standardized matrices gives one
/// coordinate set per dataset, sharing one basis identifier.
pub fn canonical_correlation(
    a: &Dataset,
    b: &Dataset,
    config: &ProjectionConfig,
) -> anyhow::Result<(Embedding, Embedding)> {
    validate_common(&[a, b], config.rank)?;

    let weights = feature_weights(config, a.num_features())?;
    if !(config.clip > 0.0) {
        return Err(MungError::invalid("clip", "must be positive"));
    }

    let standardized = |ds: &Dataset| -> Mat {
        let mut xx = ds.data().scale_columns();
        let clip = config.clip;
        xx.apply(|x| *x = x.clamp(-clip, clip));
        if let Some(w) = &weights {
            for (mut x_j, &w_j) in xx.column_iter_mut().zip(w.iter()) {
                x_j *= w_j;
            }
        }
        xx
    };

    let xa = standardized(a);
    let xb = standardized(b);

    let bound = a.num_features().min(a.num_cells()).min(b.num_cells()).saturating_sub(1);
    if config.rank > bound {
        return Err(MungError::DegenerateInput {
            requested: config.rank,
            achievable: bound,
        }
        .into());
    }

    info!(
        "CCA between '{}' ({} cells) and '{}' ({} cells)",
        a.batch(),
        a.num_cells(),
        b.batch(),
        b.num_cells()
    );

    let cross = &xa * xb.transpose();
    let (mut uu, _dd, mut vv) = decompose(cross, config.rank, config.decomposition)?;

    let signs = fix_signs(&mut uu);
    for (mut v_k, s) in vv.column_iter_mut().zip(signs) {
        v_k *= s;
    }

    let id = BasisId::of_matrices("cca", &[&uu, &vv]);
    Ok((
        Embedding::new(a.batch(), a.cell_ids().to_vec(), uu, id)?,
        Embedding::new(b.batch(), b.cell_ids().to_vec(), vv, id)?,
    ))
}

/// How embeddings are brought into the common search space
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct AlignConfig {
    /// subtract each dataset's own mean
    pub centre: bool,
    /// rescale each dataset to unit mean squared row norm
    pub scale: bool,
    /// L2-normalize every cell
    pub l2_normalize: bool,
}

impl Default for AlignConfig {
    fn default() -> Self {
        Self {
            centre: true,
            scale: false,
            l2_normalize: false,
        }
    }
}

impl AlignConfig {
    fn tag(&self) -> String {
        format!("align:{}{}{}", self.centre as u8, self.scale as u8, self.l2_normalize as u8)
    }
}

/// Align embeddings of one basis into a common search space. Each
/// dataset is transformed on its own statistics; inputs are untouched.
pub fn align_embeddings(embeddings: &[&Embedding], align: &AlignConfig) -> anyhow::Result<Vec<Embedding>> {
    let first = embeddings
        .first()
        .ok_or_else(|| MungError::invalid("embeddings", "nothing to align"))?;
    for e in embeddings.iter().skip(1) {
        first.ensure_same_basis(e)?;
    }

    let basis = first.basis().derive(&align.tag());

    embeddings
        .iter()
        .map(|e| {
            let mut xx = e.coords().clone();
            if align.centre {
                xx.centre_columns_inplace();
            }
            if align.scale && xx.nrows() > 0 {
                let msq = xx.norm_squared() / xx.nrows() as f32;
                if msq > 0.0 {
                    xx /= msq.sqrt();
                }
            }
            if align.l2_normalize {
                xx.normalize_rows_inplace();
            }
            Embedding::new(e.batch(), e.cell_ids().to_vec(), xx, basis)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    fn random_dataset(batch: &str, n: usize, d: usize, seed: u64) -> Dataset {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let noise = Normal::new(0.0f32, 1.0).unwrap();
        let data = Mat::from_fn(n, d, |_, j| j as f32 + noise.sample(&mut rng));
        Dataset::from_matrix(batch, data).unwrap()
    }

    #[test]
    fn projection_is_deterministic() {
        let a = random_dataset("a", 40, 8, 1);
        let b = random_dataset("b", 30, 8, 2);
        let config = ProjectionConfig::with_rank(3);

        let (basis1, emb1) = project_datasets(&[&a, &b], &config).unwrap();
        let (basis2, emb2) = project_datasets(&[&a, &b], &config).unwrap();

        assert_eq!(basis1.id, basis2.id);
        assert_eq!(emb1[0].coords(), emb2[0].coords());
        assert_eq!(emb1[1].coords(), emb2[1].coords());
        assert_eq!(emb1[0].basis(), emb1[1].basis());
        assert_eq!(emb1[0].dim(), 3);
        assert_eq!(emb1[1].num_cells(), 30);

        // loadings are orthonormal with positive dominant entries
        let vtv = basis1.loadings.transpose() * &basis1.loadings;
        assert_abs_diff_eq!(vtv, Mat::identity(3, 3), epsilon = 1e-4);
        for col in basis1.loadings.column_iter() {
            let dominant = col.iter().cloned().fold(0.0f32, |m, x| if x.abs() > m.abs() { x } else { m });
            assert!(dominant > 0.0);
        }
    }

    #[test]
    fn randomized_matches_exact_projection_up_to_tolerance() {
        let a = random_dataset("a", 60, 6, 3);
        let exact = project_datasets(&[&a], &ProjectionConfig::with_rank(2)).unwrap();
        let mut config = ProjectionConfig::with_rank(2);
        config.decomposition = Decomposition::Randomized { seed: 5 };
        let approx = project_datasets(&[&a], &config).unwrap();

        for k in 0..2 {
            assert_abs_diff_eq!(exact.0.singular_values[k], approx.0.singular_values[k], epsilon = 1e-2);
        }
    }

    #[test]
    fn rank_errors() {
        let a = random_dataset("a", 10, 4, 4);

        let zero = project_datasets(&[&a], &ProjectionConfig::with_rank(0)).unwrap_err();
        assert!(matches!(MungError::of(&zero), Some(MungError::InvalidParameter { .. })));

        let too_big = project_datasets(&[&a], &ProjectionConfig::with_rank(4)).unwrap_err();
        assert_eq!(
            MungError::of(&too_big),
            Some(&MungError::DegenerateInput {
                requested: 4,
                achievable: 3
            })
        );

        let constant = Dataset::from_matrix("c", Mat::from_element(10, 4, 2.0)).unwrap();
        let err = project_datasets(&[&constant], &ProjectionConfig::with_rank(1)).unwrap_err();
        assert_eq!(
            MungError::of(&err),
            Some(&MungError::DegenerateInput {
                requested: 1,
                achievable: 0
            })
        );
    }

    #[test]
    fn feature_mismatch_and_bad_weights() {
        let a = random_dataset("a", 10, 4, 5);
        let b = random_dataset("b", 10, 5, 6);
        let err = project_datasets(&[&a, &b], &ProjectionConfig::with_rank(2)).unwrap_err();
        assert!(matches!(MungError::of(&err), Some(MungError::DimensionMismatch { .. })));

        let mut config = ProjectionConfig::with_rank(2);
        config.feature_weights = Some(vec![1.0, -1.0, 1.0, 1.0]);
        let err = project_datasets(&[&a], &config).unwrap_err();
        assert!(matches!(MungError::of(&err), Some(MungError::InvalidParameter { .. })));

        config.feature_weights = Some(vec![1.0; 3]);
        let err = project_datasets(&[&a], &config).unwrap_err();
        assert!(matches!(MungError::of(&err), Some(MungError::DimensionMismatch { .. })));
    }

    #[test]
    fn project_a_further_dataset() {
        let a = random_dataset("a", 30, 5, 7);
        let q = random_dataset("q", 12, 5, 8);
        let mut config = ProjectionConfig::with_rank(2);
        config.standardize = true;
        let (basis, emb) = project_datasets(&[&a], &config).unwrap();

        let eq = basis.project(&q).unwrap();
        assert_eq!(eq.basis(), emb[0].basis());
        assert_eq!(eq.num_cells(), 12);

        // re-projecting the training data reproduces its embedding
        let ea = basis.project(&a).unwrap();
        assert_abs_diff_eq!(ea.coords(), emb[0].coords(), epsilon = 1e-5);
    }

    #[test]
    fn cca_shares_basis() {
        let a = random_dataset("a", 20, 6, 9);
        let b = random_dataset("b", 25, 6, 10);
        let (ea, eb) = canonical_correlation(&a, &b, &ProjectionConfig::with_rank(3)).unwrap();
        assert_eq!(ea.basis(), eb.basis());
        assert_eq!(ea.coords().shape(), (20, 3));
        assert_eq!(eb.coords().shape(), (25, 3));
    }

    #[test]
    fn cca_rejects_bad_weights() {
        let a = random_dataset("a", 20, 4, 9);
        let b = random_dataset("b", 25, 4, 10);
        let mut config = ProjectionConfig::with_rank(2);

        config.feature_weights = Some(vec![1.0, f32::NAN, 1.0, 1.0]);
        let err = canonical_correlation(&a, &b, &config).unwrap_err();
        assert!(matches!(MungError::of(&err), Some(MungError::InvalidParameter { .. })));

        config.feature_weights = Some(vec![1.0, 1.0, -0.5, 1.0]);
        let err = canonical_correlation(&a, &b, &config).unwrap_err();
        assert!(matches!(MungError::of(&err), Some(MungError::InvalidParameter { .. })));

        config.feature_weights = Some(vec![1.0; 5]);
        let err = canonical_correlation(&a, &b, &config).unwrap_err();
        assert!(matches!(MungError::of(&err), Some(MungError::DimensionMismatch { .. })));

        config.feature_weights = Some(vec![1.0, 0.5, 2.0, 1.0]);
        assert!(canonical_correlation(&a, &b, &config).is_ok());
    }

    #[test]
    fn alignment_centres_each_dataset() {
        let id = BasisId(3);
        let a = Embedding::new(
            "a",
            vec!["x".into(), "y".into()],
            Mat::from_row_slice(2, 2, &[0., 0., 2., 2.]),
            id,
        )
        .unwrap();
        let b = Embedding::new(
            "b",
            vec!["x".into(), "y".into()],
            Mat::from_row_slice(2, 2, &[10., 10., 12., 12.]),
            id,
        )
        .unwrap();

        let aligned = align_embeddings(&[&a, &b], &AlignConfig::default()).unwrap();
        assert_eq!(aligned[0].coords(), aligned[1].coords());
        assert_ne!(aligned[0].basis(), id);
        assert_eq!(aligned[0].basis(), aligned[1].basis());
        // inputs are untouched
        assert_eq!(b.coords()[(0, 0)], 10.);

        let l2 = AlignConfig {
            centre: true,
            scale: true,
            l2_normalize: true,
        };
        let aligned = align_embeddings(&[&a], &l2).unwrap();
        for row in aligned[0].coords().row_iter() {
            assert_abs_diff_eq!(row.norm(), 1.0, epsilon = 1e-6);
        }
    }
}
