pub use nalgebra::{DMatrix, DVector};
pub use rand::Rng;
use rand::SeedableRng;
pub use rand_distr::StandardNormal;

use crate::traits::*;

impl SampleOps for DMatrix<f32> {
    type Mat = Self;
    type Scalar = f32;

    fn runif_seeded(dd: usize, nn: usize, seed: u64) -> Self::Mat {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        DMatrix::<f32>::from_fn(dd, nn, |_, _| rng.random::<f32>())
    }

    fn rnorm_seeded(dd: usize, nn: usize, seed: u64) -> Self::Mat {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        DMatrix::<f32>::from_fn(dd, nn, |_, _| rng.sample::<f32, _>(StandardNormal))
    }
}

impl MatOps for DMatrix<f32> {
    type Mat = Self;
    type Scalar = f32;

    /// Y[,j] = (X[,j] - mean) / sd, or just centred if sd = 0
    fn scale_columns_inplace(&mut self) {
        let nn = self.nrows() as f32;
        if nn < 1.0 {
            return;
        }
        for mut xx_j in self.column_iter_mut() {
            let mu = xx_j.mean();
            xx_j.add_scalar_mut(-mu);
            let sig = (xx_j.norm_squared() / nn).sqrt();
            if sig > 0.0 {
                xx_j /= sig;
            }
        }
    }

    fn scale_columns(&self) -> Self::Mat {
        let mut ret = self.clone();
        ret.scale_columns_inplace();
        ret
    }

    fn centre_columns_inplace(&mut self) {
        if self.nrows() == 0 {
            return;
        }
        for mut xx_j in self.column_iter_mut() {
            let mu = xx_j.mean();
            xx_j.add_scalar_mut(-mu);
        }
    }

    fn normalize_rows_inplace(&mut self) {
        for mut xx_i in self.row_iter_mut() {
            let denom = xx_i.norm();
            if denom > 0.0 {
                xx_i /= denom;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn seeded_sampling_is_reproducible() {
        let a = DMatrix::<f32>::runif_seeded(7, 3, 11);
        let b = DMatrix::<f32>::runif_seeded(7, 3, 11);
        let c = DMatrix::<f32>::runif_seeded(7, 3, 12);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.iter().all(|&x| (0.0..1.0).contains(&x)));
    }

    #[test]
    fn scale_and_centre() {
        let xx = DMatrix::<f32>::from_row_slice(4, 2, &[1., 5., 2., 5., 3., 5., 4., 5.]);

        let zz = xx.scale_columns();
        assert_abs_diff_eq!(zz.column(0).mean(), 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(zz.column(0).norm_squared() / 4.0, 1.0, epsilon = 1e-5);
        // constant column: centred only
        assert!(zz.column(1).iter().all(|&x| x == 0.0));

        let mut cc = xx.clone();
        cc.centre_columns_inplace();
        assert_abs_diff_eq!(cc[(0, 0)], -1.5, epsilon = 1e-6);
        assert_eq!(cc[(2, 1)], 0.0);
    }

    #[test]
    fn normalize_rows() {
        let mut xx = DMatrix::<f32>::from_row_slice(2, 2, &[3., 4., 0., 0.]);
        xx.normalize_rows_inplace();
        assert_abs_diff_eq!(xx[(0, 0)], 0.6, epsilon = 1e-6);
        assert_abs_diff_eq!(xx[(0, 1)], 0.8, epsilon = 1e-6);
        assert_eq!(xx[(1, 0)], 0.0);
    }
}
