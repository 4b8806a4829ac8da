use crate::common::*;
use crate::error::MungError;

use serde::Serialize;
use std::hash::Hasher;

/// Fingerprint of the projection that produced an embedding.
///
/// Derived from the content of the basis, so identical input always
/// yields the same identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct BasisId(pub u64);

impl std::fmt::Display for BasisId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl BasisId {
    /// Hash a tag and the exact bits of some matrices
    pub fn of_matrices(tag: &str, mats: &[&Mat]) -> Self {
        let mut hasher = fnv::FnvHasher::default();
        hasher.write(tag.as_bytes());
        for m in mats {
            hasher.write_usize(m.nrows());
            hasher.write_usize(m.ncols());
            for x in m.iter() {
                hasher.write_u32(x.to_bits());
            }
        }
        BasisId(hasher.finish())
    }

    /// A new identifier for a space derived from this one
    pub fn derive(&self, tag: &str) -> Self {
        let mut hasher = fnv::FnvHasher::default();
        hasher.write_u64(self.0);
        hasher.write(tag.as_bytes());
        BasisId(hasher.finish())
    }
}

/// Cells × k coordinates of one batch in a shared basis
#[derive(Clone, Debug)]
pub struct Embedding {
    batch: Box<str>,
    cells: Vec<Box<str>>,
    coords: Mat,
    basis: BasisId,
}

impl Embedding {
    pub fn new(batch: &str, cells: Vec<Box<str>>, coords: Mat, basis: BasisId) -> anyhow::Result<Self> {
        if cells.len() != coords.nrows() {
            return Err(MungError::mismatch(
                format!("cells of embedding '{}'", batch),
                coords.nrows(),
                cells.len(),
            ));
        }
        Ok(Self {
            batch: batch.into(),
            cells,
            coords,
            basis,
        })
    }

    pub fn batch(&self) -> &str {
        &self.batch
    }

    pub fn cell_ids(&self) -> &[Box<str>] {
        &self.cells
    }

    pub fn coords(&self) -> &Mat {
        &self.coords
    }

    pub fn basis(&self) -> BasisId {
        self.basis
    }

    pub fn num_cells(&self) -> usize {
        self.coords.nrows()
    }

    pub fn dim(&self) -> usize {
        self.coords.ncols()
    }

    /// Same cells and basis, new coordinates
    pub fn with_coords(&self, coords: Mat) -> anyhow::Result<Self> {
        Self::new(&self.batch, self.cells.clone(), coords, self.basis)
    }

    /// `BasisMismatch` unless both live in the same basis
    pub fn ensure_same_basis(&self, other: &Embedding) -> anyhow::Result<()> {
        if self.basis != other.basis {
            return Err(MungError::BasisMismatch {
                left: format!("{} ({})", self.basis, self.batch),
                right: format!("{} ({})", other.basis, other.batch),
            }
            .into());
        }
        if self.dim() != other.dim() {
            return Err(MungError::mismatch(
                format!("embedding dimension of '{}' vs '{}'", self.batch, other.batch),
                self.dim(),
                other.dim(),
            ));
        }
        Ok(())
    }

    /// Stack embeddings of one basis under a new batch label
    pub fn concat(batch: &str, parts: &[&Embedding]) -> anyhow::Result<Embedding> {
        let first = parts
            .first()
            .ok_or_else(|| MungError::invalid("parts", "nothing to concatenate"))?;
        for p in parts.iter().skip(1) {
            first.ensure_same_basis(p)?;
        }
        let coords = vstack(&parts.iter().map(|p| &p.coords).collect::<Vec<_>>());
        let cells = parts.iter().flat_map(|p| p.cells.iter().cloned()).collect();
        Embedding::new(batch, cells, coords, first.basis)
    }
}
