//! Anchor windows: the anchors within reach of a query cell, shared by
//! batch correction and label transfer

use crate::common::*;
use crate::error::MungError;

use matrix_util::knn_match::{ExactDict, NeighbourIndex};
use matrix_util::utils::generate_minibatch_intervals;
use rayon::prelude::*;
use serde::Serialize;

pub const DEFAULT_K_WEIGHT: usize = 100;
pub const DEFAULT_CUTOFF: f32 = 3.0;

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct WindowConfig {
    /// at most this many nearest anchors per cell
    pub k_weight: usize,
    /// Gaussian kernel width; no default
    pub bandwidth: f32,
    /// ignore anchors beyond `cutoff * bandwidth`
    pub cutoff: f32,
}

impl WindowConfig {
    pub fn with_bandwidth(bandwidth: f32) -> Self {
        Self {
            k_weight: DEFAULT_K_WEIGHT,
            bandwidth,
            cutoff: DEFAULT_CUTOFF,
        }
    }

    pub(crate) fn validate(&self) -> anyhow::Result<()> {
        if !(self.bandwidth.is_finite() && self.bandwidth > 0.0) {
            return Err(MungError::invalid("bandwidth", "must be positive"));
        }
        if !(self.cutoff.is_finite() && self.cutoff > 0.0) {
            return Err(MungError::invalid("cutoff", "must be positive"));
        }
        if self.k_weight == 0 {
            return Err(MungError::invalid("k_weight", "must be at least 1"));
        }
        Ok(())
    }

    /// Gaussian kernel of a distance
    pub fn kernel(&self, distance: f32) -> f32 {
        let h = self.bandwidth;
        (-(distance * distance) / (2.0 * h * h)).exp()
    }
}

/// For every row of `cells`, the nearby rows of `anchor_points` as
/// `(anchor position, distance)`, nearest first.
pub(crate) fn anchor_windows(
    cells: &Mat,
    anchor_points: &Mat,
    config: &WindowConfig,
    block_size: usize,
    interrupt: &Interrupt,
) -> anyhow::Result<Vec<Vec<(usize, f32)>>> {
    config.validate()?;

    let dict = ExactDict::from_rows(anchor_points);
    let knn = config.k_weight.min(dict.len());
    let radius = config.cutoff * config.bandwidth;

    let jobs = generate_minibatch_intervals(cells.nrows(), block_size);

    let blocks = jobs
        .into_par_iter()
        .map(|(lb, ub)| -> anyhow::Result<Vec<Vec<(usize, f32)>>> {
            interrupt.check()?;
            Ok((lb..ub)
                .map(|i| {
                    let q: Vec<f32> = cells.row(i).iter().cloned().collect();
                    let (idx, dist) = dict.search(&q, knn, None);
                    idx.into_iter().zip(dist).take_while(|&(_, d)| d <= radius).collect()
                })
                .collect())
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    Ok(blocks.into_iter().flatten().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows_respect_cutoff_and_k() {
        let anchors = Mat::from_column_slice(4, 1, &[0., 1., 2., 10.]);
        let cells = Mat::from_column_slice(2, 1, &[0.5, 30.]);
        let mut config = WindowConfig::with_bandwidth(1.0);
        config.k_weight = 2;

        let win = anchor_windows(&cells, &anchors, &config, 1, &Interrupt::default()).unwrap();
        assert_eq!(win[0].iter().map(|x| x.0).collect::<Vec<_>>(), vec![0, 1]);
        assert!(win[1].is_empty());
    }

    #[test]
    fn kernel_is_one_at_zero() {
        let config = WindowConfig::with_bandwidth(2.0);
        approx::assert_abs_diff_eq!(config.kernel(0.0), 1.0);
        approx::assert_abs_diff_eq!(config.kernel(2.0), (-0.5f32).exp(), epsilon = 1e-6);
    }

    #[test]
    fn bandwidth_must_be_positive() {
        let config = WindowConfig::with_bandwidth(0.0);
        let err = anchor_windows(&Mat::zeros(1, 1), &Mat::zeros(1, 1), &config, 10, &Interrupt::default())
            .unwrap_err();
        assert!(matches!(MungError::of(&err), Some(MungError::InvalidParameter { name: "bandwidth", .. })));
    }
}
