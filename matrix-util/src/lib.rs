pub mod common_io; // gzip-aware line readers and writers
pub mod dmatrix_io; // delimited text I/O for `DMatrix`
pub mod dmatrix_rsvd; // randomized SVD
pub mod dmatrix_util; // sampling and column/row scaling for `DMatrix`
pub mod knn_graph; // kNN lists, symmetric kNN and shared-neighbour graphs
pub mod knn_match; // exact and HNSW nearest-neighbour indexes
pub mod traits;
pub mod utils;
