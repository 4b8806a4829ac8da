use crate::traits::{RandomizedAlgs, SampleOps};
use log::debug;
use nalgebra::{DMatrix, DVector};

type Mat = DMatrix<f32>;
type Vec = DVector<f32>;

const DEFAULT_ITER: usize = 5;

impl RandomizedAlgs for Mat {
    type Mat = Mat;
    type DVec = Vec;

    fn rsvd_seeded(&self, max_rank: usize, seed: u64) -> anyhow::Result<(Mat, Vec, Mat)> {
        let mut rsvd = RandomizedSVD::new(max_rank, DEFAULT_ITER).with_seed(seed);
        rsvd.compute(self)?;
        Ok(rsvd.into_parts())
    }
}

/// Randomized SVD
///
/// Implement Alg 4.4 of Halko et al. (2009)
/// Modified from https://github.com/kazuotani14/RandomizedSvd
///
pub struct RandomizedSVD {
    max_rank: usize,
    iter: usize,
    seed: u64,
    u_vectors: Mat,
    singular_values: Vec,
    v_vectors: Mat,
    qq: Mat,
}

impl RandomizedSVD {
    pub fn new(max_rank: usize, iter: usize) -> Self {
        Self {
            max_rank,
            iter,
            seed: 0,
            u_vectors: Mat::zeros(0, 0),
            singular_values: Vec::zeros(0),
            v_vectors: Mat::zeros(0, 0),
            qq: Mat::zeros(0, 0),
        }
    }

    /// Seed of the random test matrix (0 unless set)
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn matrix_u(&self) -> &Mat {
        &self.u_vectors
    }

    pub fn matrix_v(&self) -> &Mat {
        &self.v_vectors
    }

    pub fn singular_values(&self) -> &Vec {
        &self.singular_values
    }

    pub fn into_parts(self) -> (Mat, Vec, Mat) {
        (self.u_vectors, self.singular_values, self.v_vectors)
    }

    pub fn compute(&mut self, xx: &Mat) -> anyhow::Result<()> {
        let nr = xx.nrows();
        let nc = xx.ncols();

        let mut rank = nr.min(nc);
        let mut oversample = 0;

        if self.max_rank > 0 && rank > self.max_rank {
            rank = self.max_rank;
            oversample = 5.min(nr.min(nc) - rank);
        }

        if rank == 0 {
            anyhow::bail!("randomized SVD needs a non-empty matrix");
        }

        self.rand_subspace_iteration(xx, rank + oversample);

        let rank = rank.min(self.qq.ncols());
        let bb = self.qq.transpose() * xx;

        debug!("final svd on [{} x {}]", bb.nrows(), bb.ncols());

        let svd = bb.svd(true, true);

        if let (Some(svd_u), Some(svd_vt)) = (svd.u, svd.v_t) {
            // nalgebra does not promise sorted singular values
            let mut order = (0..svd.singular_values.len()).collect::<std::vec::Vec<_>>();
            order.sort_by(|&a, &b| svd.singular_values[b].total_cmp(&svd.singular_values[a]));
            order.truncate(rank);

            let uu = &self.qq * svd_u.select_columns(order.iter());
            self.u_vectors = uu;
            self.v_vectors = svd_vt.transpose().select_columns(order.iter());
            self.singular_values = Vec::from_iterator(rank, order.iter().map(|&k| svd.singular_values[k]));
        } else {
            anyhow::bail!("SVD failed");
        }

        Ok(())
    }

    // Find an orthonormal matrix qq whose range approximates the range of xx
    fn rand_subspace_iteration(&mut self, xx: &Mat, rank_and_oversample: usize) {
        let nc = xx.ncols();

        let omega = Mat::rnorm_seeded(nc, rank_and_oversample, self.seed);

        // power iterations, re-orthonormalized each half step
        let mut qq = (xx * &omega).qr().q();
        for i in 0..self.iter {
            let zz = (xx.transpose() * &qq).qr().q();
            qq = (xx * &zz).qr().q();
            debug!("power iteration {:>4}", i + 1);
        }

        let kk = rank_and_oversample.min(qq.ncols());
        self.qq = qq.columns(0, kk).into_owned();
    }
}
