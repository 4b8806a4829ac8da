use crate::common_io::Delimiter;

/// some linear algebra routines
pub trait RandomizedAlgs {
    type Mat;
    type DVec;

    /// Rank-`max_rank` randomized SVD. The random test matrix is drawn
    /// from `seed`, so repeated calls give identical factors.
    fn rsvd_seeded(
        &self,
        max_rank: usize,
        seed: u64,
    ) -> anyhow::Result<(Self::Mat, Self::DVec, Self::Mat)>;
}

/// Scale or centre columns, normalize rows
pub trait MatOps {
    type Mat;
    type Scalar;

    fn scale_columns_inplace(&mut self);
    fn scale_columns(&self) -> Self::Mat;
    fn centre_columns_inplace(&mut self);

    /// Divide each row by its L2 norm (zero rows are left alone)
    fn normalize_rows_inplace(&mut self);
}

/// Operations to sample random matrices
pub trait SampleOps {
    type Mat;
    type Scalar;

    /// Sample `U(0,1)` sequentially from a seeded generator
    fn runif_seeded(dd: usize, nn: usize, seed: u64) -> Self::Mat;

    /// Sample `N(0,1)` sequentially from a seeded generator
    fn rnorm_seeded(dd: usize, nn: usize, seed: u64) -> Self::Mat;
}

/// A matrix with row and column names
pub struct MatWithNames<M> {
    pub rows: Vec<Box<str>>,
    pub cols: Vec<Box<str>>,
    pub mat: M,
}

/// Read and write matrices from and to files
pub trait IoOps {
    type Scalar;
    type Mat;

    /// Read a matrix whose first line holds column names and whose
    /// first column holds row names
    ///
    /// * `file` - file name--either gzipped or not
    /// * `delim` - delimiter
    fn read_data(file: &str, delim: impl Into<Delimiter>)
        -> anyhow::Result<MatWithNames<Self::Mat>>;

    /// Write a matrix with a header line and a leading row-name column
    ///
    /// * `rows` - row names
    /// * `cols` - column names
    /// * `file` - file name--either gzipped or not
    /// * `delim` - delimiter
    fn write_data(
        &self,
        rows: &[Box<str>],
        cols: &[Box<str>],
        file: &str,
        delim: &str,
    ) -> anyhow::Result<()>;
}
