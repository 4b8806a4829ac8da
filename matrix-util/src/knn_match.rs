use instant_distance::{Builder, Search};
use nalgebra::DMatrix;
use rayon::prelude::*;
use std::fmt::Debug;

#[derive(Clone, Debug)]
/// a wrapper for Vec<f32>
pub struct VecPoint {
    pub data: Vec<f32>,
}

pub trait MakeVecPoint {
    fn to_vp(&self) -> VecPoint;
}

impl MakeVecPoint for Vec<f32> {
    fn to_vp(&self) -> VecPoint {
        VecPoint { data: self.clone() }
    }
}

impl MakeVecPoint for [f32] {
    fn to_vp(&self) -> VecPoint {
        VecPoint {
            data: self.to_vec(),
        }
    }
}

impl MakeVecPoint for nalgebra::DVectorView<'_, f32> {
    fn to_vp(&self) -> VecPoint {
        VecPoint {
            data: self.iter().cloned().collect(),
        }
    }
}

impl MakeVecPoint for nalgebra::RowDVector<f32> {
    fn to_vp(&self) -> VecPoint {
        VecPoint {
            data: self.iter().cloned().collect(),
        }
    }
}

impl VecPoint {
    pub fn squared_distance(&self, other: &[f32]) -> f32 {
        self.data
            .iter()
            .zip(other.iter())
            .map(|(x, y)| (x - y) * (x - y))
            .sum::<f32>()
    }
}

impl instant_distance::Point for VecPoint {
    fn distance(&self, other: &Self) -> f32 {
        self.squared_distance(&other.data).sqrt()
    }
}

/// Each row of `data` becomes one point
pub fn rows_to_points(data: &DMatrix<f32>) -> Vec<VecPoint> {
    (0..data.nrows())
        .into_par_iter()
        .map(|i| VecPoint {
            data: data.row(i).iter().cloned().collect(),
        })
        .collect()
}

/// Order neighbour candidates by distance, then by index
fn sort_by_distance_then_index(cand: &mut [(usize, f32)]) {
    cand.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
}

/// A point index that returns ranked neighbours
pub trait NeighbourIndex: Sync {
    /// number of indexed points
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `knn` nearest points to `query`, ranked by (distance, index)
    ///
    /// * `query` - coordinates
    /// * `knn` - number of neighbours
    /// * `exclude` - an indexed point to leave out (the query itself)
    fn search(&self, query: &[f32], knn: usize, exclude: Option<usize>) -> (Vec<usize>, Vec<f32>);
}

/// Brute-force Euclidean search
pub struct ExactDict {
    pub data_vec: Vec<VecPoint>,
}

impl ExactDict {
    pub fn from_rows(data: &DMatrix<f32>) -> Self {
        Self {
            data_vec: rows_to_points(data),
        }
    }
}

impl NeighbourIndex for ExactDict {
    fn len(&self) -> usize {
        self.data_vec.len()
    }

    fn search(&self, query: &[f32], knn: usize, exclude: Option<usize>) -> (Vec<usize>, Vec<f32>) {
        let mut cand: Vec<(usize, f32)> = self
            .data_vec
            .iter()
            .enumerate()
            .filter(|(j, _)| Some(*j) != exclude)
            .map(|(j, p)| (j, p.squared_distance(query)))
            .collect();

        let nquery = knn.min(cand.len());
        if nquery == 0 {
            return (vec![], vec![]);
        }

        // partial selection first, then exact order on the survivors;
        // keep every tie at the boundary so the index tie-break is exact
        cand.select_nth_unstable_by(nquery - 1, |a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        cand.truncate(nquery);
        sort_by_distance_then_index(&mut cand);

        cand.into_iter().map(|(j, d2)| (j, d2.sqrt())).unzip()
    }
}

/// HNSW construction and search effort
#[derive(Clone, Copy, Debug)]
pub struct HnswParams {
    pub ef_search: usize,
    pub ef_construction: usize,
    pub seed: u64,
}

impl Default for HnswParams {
    fn default() -> Self {
        Self {
            ef_search: 100,
            ef_construction: 100,
            seed: 42,
        }
    }
}

/// A dictionary (HnswMap wrapper) for fast row look-up
///
pub struct ColumnDict<T> {
    pub dict: instant_distance::HnswMap<VecPoint, T>,
    pub data_vec: Vec<VecPoint>,
}

impl<T> ColumnDict<T>
where
    T: Clone + Debug + Send + Sync,
{
    /// Build an HNSW index over points with names
    pub fn from_points(data_vec: Vec<VecPoint>, names: Vec<T>, params: &HnswParams) -> Self {
        debug_assert!(
            data_vec.len() == names.len(),
            "Data and names must have the same length"
        );

        let dict = Builder::default()
            .ef_search(params.ef_search)
            .ef_construction(params.ef_construction)
            .seed(params.seed)
            .build(data_vec.clone(), names);

        ColumnDict { dict, data_vec }
    }

    /// Names of the `knn` approximate nearest points
    pub fn search_by_query(&self, query: &VecPoint, knn: usize) -> Vec<(T, f32)> {
        let mut search = Search::default();
        self.dict
            .search(query, &mut search)
            .take(knn)
            .map(|item| (item.value.clone(), item.distance))
            .collect()
    }
}

impl ColumnDict<usize> {
    /// Index the rows of `data`, each named by its row index
    pub fn from_rows(data: &DMatrix<f32>, params: &HnswParams) -> Self {
        let names = (0..data.nrows()).collect();
        Self::from_points(rows_to_points(data), names, params)
    }
}

impl NeighbourIndex for ColumnDict<usize> {
    fn len(&self) -> usize {
        self.data_vec.len()
    }

    fn search(&self, query: &[f32], knn: usize, exclude: Option<usize>) -> (Vec<usize>, Vec<f32>) {
        // a couple of spares so that equal-distance points can be
        // re-ranked by index
        let nfetch = (knn + 1 + 2).min(self.data_vec.len());
        let query = query.to_vp();
        let mut cand: Vec<(usize, f32)> = self
            .search_by_query(&query, nfetch)
            .into_iter()
            .filter(|(j, _)| Some(*j) != exclude)
            .collect();

        sort_by_distance_then_index(&mut cand);
        cand.truncate(knn);
        cand.into_iter().unzip()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_ties_go_to_lower_index() {
        // points 1 and 2 are both at distance 1 from point 0
        let data = DMatrix::<f32>::from_row_slice(4, 1, &[0., 1., -1., 5.]);
        let dict = ExactDict::from_rows(&data);
        let (idx, dist) = dict.search(&[0.], 2, Some(0));
        assert_eq!(idx, vec![1, 2]);
        assert_eq!(dist, vec![1., 1.]);

        let (idx, _) = dict.search(&[0.], 10, None);
        assert_eq!(idx, vec![0, 1, 2, 3]);
    }

    #[test]
    fn hnsw_finds_exact_neighbours_on_small_data() {
        let data = DMatrix::<f32>::from_fn(50, 3, |i, j| (i * (j + 1)) as f32 * 0.1);
        let exact = ExactDict::from_rows(&data);
        let hnsw = ColumnDict::from_rows(&data, &HnswParams::default());
        assert_eq!(hnsw.len(), 50);

        for i in [0, 17, 49] {
            let q: Vec<f32> = data.row(i).iter().cloned().collect();
            let (ei, _) = exact.search(&q, 5, Some(i));
            let (hi, _) = hnsw.search(&q, 5, Some(i));
            assert_eq!(ei, hi);
        }
    }
}
