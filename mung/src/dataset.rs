use crate::common::*;
use crate::error::MungError;

use fnv::FnvHashSet as HashSet;
use nalgebra::{Dyn, MatrixView, U1};

pub type RowView<'a> = MatrixView<'a, f32, U1, Dyn, U1, Dyn>;

/// Cells (rows) measured over a shared feature vocabulary (columns)
/// in one batch. Immutable after construction.
#[derive(Clone, Debug)]
pub struct Dataset {
    batch: Box<str>,
    cells: Vec<Box<str>>,
    features: Vec<Box<str>>,
    data: Mat,
    annotation: Option<Vec<Box<str>>>,
}

/// A borrowed cell of a [`Dataset`]
#[derive(Clone, Copy)]
pub struct CellRef<'a> {
    pub index: usize,
    pub id: &'a str,
    pub values: RowView<'a>,
    pub annotation: Option<&'a str>,
}

impl Dataset {
    /// * `batch` - batch label
    /// * `cells` - cell identifiers, unique within the dataset
    /// * `features` - feature (gene) names, one per column
    /// * `data` - cells × features, finite values
    pub fn new(
        batch: &str,
        cells: Vec<Box<str>>,
        features: Vec<Box<str>>,
        data: Mat,
    ) -> anyhow::Result<Self> {
        if cells.len() != data.nrows() {
            return Err(MungError::mismatch(
                format!("cell ids of '{}'", batch),
                data.nrows(),
                cells.len(),
            ));
        }
        if features.len() != data.ncols() {
            return Err(MungError::mismatch(
                format!("feature names of '{}'", batch),
                data.ncols(),
                features.len(),
            ));
        }

        let mut seen = HashSet::default();
        if let Some(dup) = cells.iter().find(|&c| !seen.insert(&**c)) {
            return Err(MungError::invalid(
                "cells",
                format!("duplicate cell id '{}' in '{}'", dup, batch),
            ));
        }

        if let Some(pos) = data.iter().position(|x| !x.is_finite()) {
            let (i, j) = (pos % data.nrows(), pos / data.nrows());
            return Err(MungError::invalid(
                "data",
                format!("non-finite value at cell {}, feature {} of '{}'", i, j, batch),
            ));
        }

        Ok(Self {
            batch: batch.into(),
            cells,
            features,
            data,
            annotation: None,
        })
    }

    /// Name cells `{batch}_{i}` and features `f{j}`
    pub fn from_matrix(batch: &str, data: Mat) -> anyhow::Result<Self> {
        let cells = (0..data.nrows())
            .map(|i| format!("{}_{}", batch, i).into_boxed_str())
            .collect();
        let features = (0..data.ncols())
            .map(|j| format!("f{}", j).into_boxed_str())
            .collect();
        Self::new(batch, cells, features, data)
    }

    /// Attach one categorical label per cell
    pub fn with_annotation(mut self, labels: Vec<Box<str>>) -> anyhow::Result<Self> {
        if labels.len() != self.num_cells() {
            return Err(MungError::mismatch(
                format!("annotation of '{}'", self.batch),
                self.num_cells(),
                labels.len(),
            ));
        }
        self.annotation = Some(labels);
        Ok(self)
    }

    pub fn batch(&self) -> &str {
        &self.batch
    }

    pub fn cell_ids(&self) -> &[Box<str>] {
        &self.cells
    }

    pub fn features(&self) -> &[Box<str>] {
        &self.features
    }

    pub fn data(&self) -> &Mat {
        &self.data
    }

    pub fn annotation(&self) -> Option<&[Box<str>]> {
        self.annotation.as_deref()
    }

    pub fn num_cells(&self) -> usize {
        self.data.nrows()
    }

    pub fn num_features(&self) -> usize {
        self.data.ncols()
    }

    pub fn cell(&self, index: usize) -> CellRef<'_> {
        CellRef {
            index,
            id: &self.cells[index],
            values: self.data.row(index),
            annotation: self.annotation.as_ref().map(|a| a[index].as_ref()),
        }
    }

    pub fn cells(&self) -> impl Iterator<Item = CellRef<'_>> {
        (0..self.num_cells()).map(move |i| self.cell(i))
    }

    /// `DimensionMismatch` unless both share the same feature vocabulary
    pub fn ensure_same_features(&self, other: &Dataset) -> anyhow::Result<()> {
        if self.num_features() != other.num_features() {
            return Err(MungError::mismatch(
                format!("features of '{}' vs '{}'", self.batch, other.batch),
                self.num_features(),
                other.num_features(),
            ));
        }
        if let Some(j) = (0..self.num_features()).find(|&j| self.features[j] != other.features[j]) {
            return Err(MungError::mismatch(
                format!(
                    "feature vocabulary of '{}' vs '{}' (differs at '{}' / '{}')",
                    self.batch, other.batch, self.features[j], other.features[j]
                ),
                self.num_features(),
                j,
            ));
        }
        Ok(())
    }
}
