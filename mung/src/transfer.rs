//! Label transfer from an annotated reference to a query through
//! anchors: each query cell takes the weighted majority label of the
//! anchors in its window

use crate::anchors::AnchorSet;
use crate::common::*;
use crate::embedding::Embedding;
use crate::error::MungError;
use crate::window::*;

use rayon::prelude::*;
use serde::Serialize;

/// label of query cells without any anchor in reach
pub const UNASSIGNED: &str = "UNASSIGNED";

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct TransferConfig {
    pub window: WindowConfig,
    /// added to distances before inverting them
    pub epsilon: f32,
    pub block_size: usize,
}

impl TransferConfig {
    pub fn with_bandwidth(bandwidth: f32) -> Self {
        Self {
            window: WindowConfig::with_bandwidth(bandwidth),
            epsilon: 1e-3,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

#[derive(Clone, Debug)]
pub struct LabelTransfer {
    /// predicted label per query cell, or [`UNASSIGNED`]
    pub labels: Vec<Box<str>>,
    /// vote share of the winning label
    pub confidence: Vec<f32>,
    /// sorted distinct reference labels
    pub label_names: Vec<Box<str>>,
    /// query cells × `label_names` vote shares; rows sum to 1 or 0
    pub shares: Mat,
}

impl LabelTransfer {
    pub fn num_unassigned(&self) -> usize {
        self.confidence.iter().filter(|&&c| c == 0.0).count()
    }
}

/// Predict query labels from reference `labels` (one per reference
/// cell). `anchors` pair the reference (A) with the query (B).
///
/// A vote is `score / (distance + epsilon)` with the distance from the
/// query cell to the anchor's query cell. Ties go to the label that
/// sorts first.
pub fn transfer_labels(
    reference: &Embedding,
    labels: &[Box<str>],
    query: &Embedding,
    anchors: &AnchorSet,
    config: &TransferConfig,
    interrupt: &Interrupt,
) -> anyhow::Result<LabelTransfer> {
    reference.ensure_same_basis(query)?;
    config.window.validate()?;

    if labels.len() != reference.num_cells() {
        return Err(MungError::mismatch("reference labels", reference.num_cells(), labels.len()));
    }
    if !(config.epsilon.is_finite() && config.epsilon > 0.0) {
        return Err(MungError::invalid("epsilon", "must be positive"));
    }
    if labels.iter().any(|l| l.as_ref() == UNASSIGNED) {
        return Err(MungError::invalid(
            "labels",
            format!("'{}' is reserved for cells without anchors", UNASSIGNED),
        ));
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
    for x in anchors.anchors() {
        if x.cell_a >= reference.num_cells() || x.cell_b >= query.num_cells() {
            return Err(MungError::mismatch(
                "anchor cell",
                reference.num_cells().min(query.num_cells()),
                x.cell_a.max(x.cell_b) + 1,
            ));
        }
    }

    let mut label_names: Vec<Box<str>> = labels.to_vec();
    label_names.sort();
    label_names.dedup();

    // label ordinal of each anchor
    let anchor_label: Vec<usize> = anchors
        .anchors()
        .iter()
        .map(|x| label_names.binary_search(&labels[x.cell_a]).unwrap_or_default())
        .collect();

    let nquery = query.num_cells();
    let rows_b: Vec<usize> = anchors.anchors().iter().map(|x| x.cell_b).collect();
    let anchor_pts = select_rows(query.coords(), &rows_b);

    let windows = if anchors.is_empty() {
        vec![vec![]; nquery]
    } else {
        anchor_windows(query.coords(), &anchor_pts, &config.window, config.block_size, interrupt)?
    };

    let nlabels = label_names.len();
    let votes: Vec<Vec<f32>> = windows
        .par_iter()
        .map(|win| {
            let mut v = vec![0f32; nlabels];
            for &(j, d) in win.iter() {
                v[anchor_label[j]] += anchors.anchors()[j].score / (d + config.epsilon);
            }
            let total: f32 = v.iter().sum();
            if total > 0.0 {
                v.iter_mut().for_each(|x| *x /= total);
            }
            v
        })
        .collect();

    let mut shares = Mat::zeros(nquery, nlabels);
    let mut out_labels = Vec::with_capacity(nquery);
    let mut confidence = Vec::with_capacity(nquery);

    for (i, v) in votes.iter().enumerate() {
        let mut best: Option<(usize, f32)> = None;
        for (l, &s) in v.iter().enumerate() {
            shares[(i, l)] = s;
            if s > 0.0 && best.map_or(true, |(_, b)| s > b) {
                best = Some((l, s));
            }
        }
        match best {
            Some((l, s)) => {
                out_labels.push(label_names[l].clone());
                confidence.push(s);
            }
            None => {
                out_labels.push(UNASSIGNED.into());
                confidence.push(0.0);
            }
        }
    }

    let ret = LabelTransfer {
        labels: out_labels,
        confidence,
        label_names,
        shares,
    };

    info!(
        "transferred {} labels to {} cells of '{}' ({} unassigned)",
        nlabels,
        nquery,
        query.batch(),
        ret.num_unassigned()
    );
    Ok(ret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchors::Anchor;
    use crate::embedding::BasisId;
    use approx::assert_abs_diff_eq;

    fn line(batch: &str, xs: &[f32]) -> Embedding {
        let cells = (0..xs.len()).map(|i| format!("{}{}", batch, i).into_boxed_str()).collect();
        Embedding::new(batch, cells, Mat::from_column_slice(xs.len(), 1, xs), BasisId(3)).unwrap()
    }

    fn names(xs: &[&str]) -> Vec<Box<str>> {
        xs.iter().map(|&x| x.into()).collect()
    }

    fn anchor(a: usize, b: usize) -> Anchor {
        Anchor {
            cell_a: a,
            cell_b: b,
            score: 1.0,
            distance: 0.0,
        }
    }

    #[test]
    fn anchors_into_one_type_only() {
        // reference: 50 X then 50 Y; all anchors land on X cells
        let xs: Vec<f32> = (0..100).map(|i| i as f32 * 0.01).collect();
        let reference = line("r", &xs);
        let labels: Vec<Box<str>> = (0..100).map(|i| if i < 50 { "X".into() } else { "Y".into() }).collect();
        let query = line("q", &xs[..20]);
        let anchors = AnchorSet::from_parts("r", "q", (0..20).map(|i| anchor(i, i)).collect(), 20);

        let config = TransferConfig::with_bandwidth(1.0);
        let out = transfer_labels(&reference, &labels, &query, &anchors, &config, &Interrupt::default()).unwrap();

        assert_eq!(out.label_names, names(&["X", "Y"]));
        for i in 0..20 {
            assert_eq!(&*out.labels[i], "X");
            assert_abs_diff_eq!(out.confidence[i], 1.0);
            assert_abs_diff_eq!(out.shares[(i, 1)], 0.0);
        }
    }

    #[test]
    fn ties_go_to_lexicographically_first() {
        let reference = line("r", &[0., 1.]);
        let labels = names(&["beta", "alpha"]);
        // query cell 1 sits halfway between the two anchored query cells
        let query = line("q", &[0., 0.5, 1.]);
        let anchors = AnchorSet::from_parts("r", "q", vec![anchor(0, 0), anchor(1, 2)], 2);

        let config = TransferConfig::with_bandwidth(1.0);
        let out = transfer_labels(&reference, &labels, &query, &anchors, &config, &Interrupt::default()).unwrap();

        assert_eq!(&*out.labels[1], "alpha");
        assert_abs_diff_eq!(out.confidence[1], 0.5, epsilon = 1e-6);
        assert_eq!(&*out.labels[0], "beta");
        assert_eq!(&*out.labels[2], "alpha");
    }

    #[test]
    fn no_anchor_in_reach_is_unassigned() {
        let reference = line("r", &[0.]);
        let query = line("q", &[0., 100.]);
        let anchors = AnchorSet::from_parts("r", "q", vec![anchor(0, 0)], 1);
        let config = TransferConfig::with_bandwidth(1.0);
        let out = transfer_labels(&reference, &names(&["T"]), &query, &anchors, &config, &Interrupt::default())
            .unwrap();
        assert_eq!(&*out.labels[1], UNASSIGNED);
        assert_eq!(out.confidence[1], 0.0);
        assert_eq!(out.num_unassigned(), 1);
    }

    #[test]
    fn label_count_must_match() {
        let reference = line("r", &[0., 1.]);
        let anchors = AnchorSet::from_parts("r", "r", vec![], 0);
        let config = TransferConfig::with_bandwidth(1.0);
        let err = transfer_labels(&reference, &names(&["a"]), &reference, &anchors, &config, &Interrupt::default())
            .unwrap_err();
        assert!(matches!(MungError::of(&err), Some(MungError::DimensionMismatch { .. })));
    }

    #[test]
    fn reserved_label_is_rejected() {
        let reference = line("r", &[0., 1.]);
        let query = line("q", &[0.]);
        let anchors = AnchorSet::from_parts("r", "q", vec![anchor(0, 0)], 1);
        let config = TransferConfig::with_bandwidth(1.0);
        let labels = names(&["T", UNASSIGNED]);
        let err = transfer_labels(&reference, &labels, &query, &anchors, &config, &Interrupt::default())
            .unwrap_err();
        assert!(matches!(MungError::of(&err), Some(MungError::InvalidParameter { name: "labels", .. })));
    }
}
