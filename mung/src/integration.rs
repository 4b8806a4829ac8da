//! Anchor-based batch correction: a kernel-smoothed correction field
//! per query cell, and iterative merging of several datasets

use crate::anchors::*;
use crate::common::*;
use crate::embedding::Embedding;
use crate::error::MungError;
use crate::projection::{align_embeddings, AlignConfig};
use crate::window::*;

use rayon::prelude::*;
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct CorrectionConfig {
    pub window: WindowConfig,
    /// pseudo-weight of a zero correction
    pub shrinkage: f32,
    /// cells with less total kernel weight are flagged
    pub min_support: f32,
    pub block_size: usize,
}

impl CorrectionConfig {
    pub fn with_bandwidth(bandwidth: f32) -> Self {
        Self {
            window: WindowConfig::with_bandwidth(bandwidth),
            shrinkage: 0.1,
            min_support: 1.0,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

/// Per-cell correction of one query dataset
#[derive(Clone, Debug)]
pub struct CorrectionField {
    /// cells × dim, added to the raw query coordinates
    pub correction: Mat,
    /// total kernel weight behind each correction
    pub support: Vec<f32>,
    pub low_confidence: Vec<bool>,
}

impl CorrectionField {
    pub fn num_low_confidence(&self) -> usize {
        self.low_confidence.iter().filter(|&&x| x).count()
    }
}

/// Correction field moving `query` towards `reference`.
///
/// `anchors` must have been found with the reference as A and the
/// query as B. Each anchor contributes `reference[a] - query[b]`,
/// weighted by `score * exp(-d^2 / 2h^2)` where `d` is the distance
/// from the query cell to the anchor's query cell. Cells without any
/// anchor in their window get a zero correction.
pub fn correct_query(
    reference: &Embedding,
    query: &Embedding,
    anchors: &AnchorSet,
    config: &CorrectionConfig,
    interrupt: &Interrupt,
) -> anyhow::Result<CorrectionField> {
    reference.ensure_same_basis(query)?;
    config.window.validate()?;

    if !(config.shrinkage.is_finite() && config.shrinkage >= 0.0) {
        return Err(MungError::invalid("shrinkage", "must be non-negative"));
    }
    if anchors.batch_a() != reference.batch() || anchors.batch_b() != query.batch() {
        return Err(MungError::invalid(
            "anchors",
            format!(
                "found between '{}' and '{}', applied to '{}' and '{}'",
                anchors.batch_a(),
                anchors.batch_b(),
                reference.batch(),
                query.batch()
            ),
        ));
    }

    let nref = reference.num_cells();
    let nquery = query.num_cells();
    for x in anchors.anchors() {
        if x.cell_a >= nref {
            return Err(MungError::mismatch("anchor reference cell", nref, x.cell_a + 1));
        }
        if x.cell_b >= nquery {
            return Err(MungError::mismatch("anchor query cell", nquery, x.cell_b + 1));
        }
    }

    let dim = query.dim();
    let rows_a: Vec<usize> = anchors.anchors().iter().map(|x| x.cell_a).collect();
    let rows_b: Vec<usize> = anchors.anchors().iter().map(|x| x.cell_b).collect();

    let anchor_pts = select_rows(query.coords(), &rows_b);
    let diffs = select_rows(reference.coords(), &rows_a) - &anchor_pts;

    let windows = if anchors.is_empty() {
        vec![vec![]; nquery]
    } else {
        anchor_windows(query.coords(), &anchor_pts, &config.window, config.block_size, interrupt)?
    };

    let cells: Vec<(Vec<f32>, f32)> = windows
        .par_iter()
        .map(|win| {
            let mut delta = vec![0f32; dim];
            let mut total = 0f32;
            for &(j, d) in win.iter() {
                let w = anchors.anchors()[j].score * config.window.kernel(d);
                total += w;
                for (k, x) in delta.iter_mut().enumerate() {
                    *x += w * diffs[(j, k)];
                }
            }
            let denom = total + config.shrinkage;
            if win.is_empty() || denom <= 0.0 {
                delta.iter_mut().for_each(|x| *x = 0.0);
            } else {
                delta.iter_mut().for_each(|x| *x /= denom);
            }
            (delta, total)
        })
        .collect();

    let mut correction = Mat::zeros(nquery, dim);
    let mut support = Vec::with_capacity(nquery);
    let mut low_confidence = Vec::with_capacity(nquery);
    for (i, (delta, total)) in cells.into_iter().enumerate() {
        for (k, x) in delta.into_iter().enumerate() {
            correction[(i, k)] = x;
        }
        low_confidence.push(total < config.min_support);
        support.push(total);
    }

    let ret = CorrectionField {
        correction,
        support,
        low_confidence,
    };

    let nlow = ret.num_low_confidence();
    if nlow > 0 {
        warn!(
            "{} of {} cells in '{}' have low correction support (< {})",
            nlow,
            nquery,
            query.batch(),
            config.min_support
        );
    }
    Ok(ret)
}

/// Move `query` by a correction field
pub fn apply_correction(query: &Embedding, field: &CorrectionField) -> anyhow::Result<Embedding> {
    if field.correction.shape() != query.coords().shape() {
        return Err(MungError::mismatch(
            "correction rows",
            query.num_cells(),
            field.correction.nrows(),
        ));
    }
    query.with_coords(query.coords() + &field.correction)
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct IntegrationConfig {
    /// search space for anchors
    pub align: AlignConfig,
    pub anchors: AnchorConfig,
    pub correction: CorrectionConfig,
}

impl IntegrationConfig {
    /// Both thresholds have no default
    pub fn new(min_score: f32, bandwidth: f32) -> Self {
        Self {
            align: AlignConfig::default(),
            anchors: AnchorConfig::new(min_score),
            correction: CorrectionConfig::with_bandwidth(bandwidth),
        }
    }
}

/// Statistics of one merge
#[derive(Clone, Debug, Serialize)]
pub struct MergeStep {
    pub query_batch: Box<str>,
    pub reference_cells: usize,
    pub query_cells: usize,
    pub candidates: usize,
    pub anchors: usize,
    pub mean_score: f32,
    pub low_confidence: usize,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct IntegrationReport {
    /// input positions, reference first
    pub merge_order: Vec<usize>,
    pub steps: Vec<MergeStep>,
}

#[derive(Debug)]
pub struct IntegrationResult {
    /// all cells, in merge order
    pub merged: Embedding,
    /// corrected embedding of each input, in input order
    pub per_dataset: Vec<Embedding>,
    /// one field per merge step
    pub fields: Vec<CorrectionField>,
    pub report: IntegrationReport,
}

impl IntegrationResult {
    /// All corrected cells stacked in input order
    pub fn corrected_in_input_order(&self, batch: &str) -> anyhow::Result<Embedding> {
        Embedding::concat(batch, &self.per_dataset.iter().collect::<Vec<_>>())
    }
}

/// Largest first; equal sizes keep their input order
pub fn merge_order(sizes: &[usize]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..sizes.len()).collect();
    order.sort_by_key(|&i| (std::cmp::Reverse(sizes[i]), i));
    order
}

/// Merge every embedding into the largest one.
///
/// Each further dataset, in `merge_order`, is anchored against the
/// combined reference in the aligned search space, then corrected in
/// the given (unaligned) space and appended to the reference.
pub fn integrate_datasets(
    embeddings: &[&Embedding],
    config: &IntegrationConfig,
    interrupt: &Interrupt,
) -> anyhow::Result<IntegrationResult> {
    let first = embeddings
        .first()
        .ok_or_else(|| MungError::invalid("embeddings", "nothing to integrate"))?;
    for e in embeddings.iter().skip(1) {
        first.ensure_same_basis(e)?;
    }

    let sizes: Vec<usize> = embeddings.iter().map(|e| e.num_cells()).collect();
    let order = merge_order(&sizes);

    info!(
        "merge order: {}",
        order
            .iter()
            .map(|&i| embeddings[i].batch())
            .collect::<Vec<_>>()
            .join(" <- ")
    );

    let mut per_dataset: Vec<Option<Embedding>> = vec![None; embeddings.len()];
    let mut fields = Vec::with_capacity(order.len().saturating_sub(1));
    let mut steps = Vec::with_capacity(order.len().saturating_sub(1));

    let reference = embeddings[order[0]];
    per_dataset[order[0]] = Some(reference.clone());
    let mut merged = Embedding::concat("integrated", &[reference])?;

    for (step, &q) in order.iter().enumerate().skip(1) {
        interrupt.check()?;
        let query = embeddings[q];

        info!(
            "step {}: '{}' ({} cells) onto {} integrated cells",
            step,
            query.batch(),
            query.num_cells(),
            merged.num_cells()
        );

        let aligned = align_embeddings(&[&merged, query], &config.align)?;
        // anchor rows index the unaligned embeddings as well
        let anchors = find_anchors(&aligned[0], &aligned[1], &config.anchors, interrupt)?;

        let field = correct_query(&merged, query, &anchors, &config.correction, interrupt)?;
        let corrected = apply_correction(query, &field)?;

        steps.push(MergeStep {
            query_batch: query.batch().into(),
            reference_cells: merged.num_cells(),
            query_cells: query.num_cells(),
            candidates: anchors.num_candidates(),
            anchors: anchors.len(),
            mean_score: anchors.mean_score(),
            low_confidence: field.num_low_confidence(),
        });

        merged = Embedding::concat("integrated", &[&merged, &corrected])?;
        per_dataset[q] = Some(corrected);
        fields.push(field);
    }

    for s in steps.iter() {
        info!(
            "'{}': {} anchors of {} candidates, mean score {:.3}, {} low-confidence cells",
            s.query_batch, s.anchors, s.candidates, s.mean_score, s.low_confidence
        );
    }

    let per_dataset = per_dataset
        .into_iter()
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| anyhow::anyhow!("a dataset was skipped during merging"))?;

    Ok(IntegrationResult {
        merged,
        per_dataset,
        fields,
        report: IntegrationReport {
            merge_order: order,
            steps,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::BasisId;
    use approx::assert_abs_diff_eq;

    fn emb(batch: &str, rows: &[[f32; 2]]) -> Embedding {
        let cells = (0..rows.len()).map(|i| format!("{}{}", batch, i).into_boxed_str()).collect();
        let flat: Vec<f32> = rows.iter().flatten().cloned().collect();
        Embedding::new(batch, cells, Mat::from_row_slice(rows.len(), 2, &flat), BasisId(1)).unwrap()
    }

    #[test]
    fn merge_order_is_size_then_position() {
        assert_eq!(merge_order(&[10, 30, 10, 30]), vec![1, 3, 0, 2]);
        assert!(merge_order(&[]).is_empty());
    }

    #[test]
    fn correction_is_zero_far_from_anchors() {
        let reference = emb("r", &[[0., 0.], [1., 0.]]);
        let query = emb("q", &[[0., 1.], [1., 1.], [50., 50.]]);
        let anchors = AnchorSet::from_parts(
            "r",
            "q",
            vec![
                Anchor { cell_a: 0, cell_b: 0, score: 1.0, distance: 1.0 },
                Anchor { cell_a: 1, cell_b: 1, score: 1.0, distance: 1.0 },
            ],
            2,
        );
        let mut config = CorrectionConfig::with_bandwidth(1.0);
        config.shrinkage = 0.0;

        let field = correct_query(&reference, &query, &anchors, &config, &Interrupt::default()).unwrap();

        // both anchors pull by (0, -1)
        assert_abs_diff_eq!(field.correction[(0, 1)], -1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(field.correction[(1, 0)], 0.0, epsilon = 1e-6);
        assert_eq!(field.correction[(2, 0)], 0.0);
        assert_eq!(field.correction[(2, 1)], 0.0);
        assert!(field.low_confidence[2]);
        assert!(!field.low_confidence[0]);
        assert_eq!(field.support[2], 0.0);

        let moved = apply_correction(&query, &field).unwrap();
        assert_abs_diff_eq!(moved.coords()[(0, 1)], 0.0, epsilon = 1e-6);
        assert_eq!(moved.coords()[(2, 0)], 50.0);
    }

    #[test]
    fn shrinkage_pulls_towards_zero() {
        let reference = emb("r", &[[0., 0.]]);
        let query = emb("q", &[[0., 2.]]);
        let anchors = AnchorSet::from_parts(
            "r",
            "q",
            vec![Anchor { cell_a: 0, cell_b: 0, score: 1.0, distance: 2.0 }],
            1,
        );
        let mut config = CorrectionConfig::with_bandwidth(1.0);
        config.shrinkage = 1.0;

        let field = correct_query(&reference, &query, &anchors, &config, &Interrupt::default()).unwrap();
        // w = 1 at d = 0, so the pull is halved
        assert_abs_diff_eq!(field.correction[(0, 1)], -1.0, epsilon = 1e-6);
    }

    #[test]
    fn anchors_must_match_batches() {
        let reference = emb("r", &[[0., 0.]]);
        let query = emb("q", &[[0., 2.]]);
        let anchors = AnchorSet::from_parts("q", "r", vec![], 0);
        let config = CorrectionConfig::with_bandwidth(1.0);
        let err = correct_query(&reference, &query, &anchors, &config, &Interrupt::default()).unwrap_err();
        assert!(matches!(MungError::of(&err), Some(MungError::InvalidParameter { name: "anchors", .. })));
    }

    #[test]
    fn single_dataset_passes_through() {
        let only = emb("a", &[[0., 0.], [1., 1.]]);
        let config = IntegrationConfig::new(0.5, 1.0);
        let out = integrate_datasets(&[&only], &config, &Interrupt::default()).unwrap();
        assert_eq!(out.report.merge_order, vec![0]);
        assert!(out.report.steps.is_empty());
        assert_eq!(out.per_dataset[0].coords(), only.coords());
        assert_eq!(out.merged.num_cells(), 2);
    }
}
