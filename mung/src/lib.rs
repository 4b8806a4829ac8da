//! Mutual-neighbour unified graph integration of single-cell batches
//!
//! Cells of several batches are projected into one low-rank basis,
//! paired across batches by mutual nearest neighbours (anchors),
//! corrected by a kernel-smoothed field of anchor differences, and
//! clustered on a shared-nearest-neighbour graph.

pub mod anchors;
pub mod common;
pub mod community;
pub mod dataset;
pub mod embedding;
pub mod error;
pub mod integration;
pub mod leiden;
pub mod louvain;
pub mod neighbors;
pub mod pipeline;
pub mod projection;
pub mod transfer;
pub mod window;

pub use common::Interrupt;
pub use error::MungError;
