pub use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::MungError;

pub type Mat = nalgebra::DMatrix<f32>;
pub type DVec = nalgebra::DVector<f32>;

pub const DEFAULT_BLOCK_SIZE: usize = 1000;

/// Cooperative cancellation shared by every stage of a run.
///
/// Cloning shares the same flag. Stages check it between blocks of
/// points, candidate pairs or passes and stop with
/// [`MungError::Cancelled`].
#[derive(Clone, Debug, Default)]
pub struct Interrupt {
    flag: Arc<AtomicBool>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    pub fn flag(&self) -> &AtomicBool {
        &self.flag
    }

    pub fn check(&self) -> anyhow::Result<()> {
        if self.is_set() {
            Err(MungError::Cancelled.into())
        } else {
            Ok(())
        }
    }
}

/// Report matrix-util's stop signal as [`MungError::Cancelled`]
pub(crate) fn lift_interrupted(err: anyhow::Error) -> anyhow::Error {
    if err.is::<matrix_util::utils::Interrupted>() {
        MungError::Cancelled.into()
    } else {
        err
    }
}

/// Stack row blocks vertically
pub(crate) fn vstack(parts: &[&Mat]) -> Mat {
    let ncols = parts.first().map(|m| m.ncols()).unwrap_or(0);
    let nrows = parts.iter().map(|m| m.nrows()).sum();
    let mut ret = Mat::zeros(nrows, ncols);
    let mut lb = 0;
    for m in parts {
        ret.rows_mut(lb, m.nrows()).copy_from(m);
        lb += m.nrows();
    }
    ret
}

/// Copy selected rows
pub(crate) fn select_rows(mat: &Mat, rows: &[usize]) -> Mat {
    Mat::from_fn(rows.len(), mat.ncols(), |i, j| mat[(rows[i], j)])
}
