//! Asymmetric distance computation.
//!
//! A [`DistanceTable`] holds, for one query, the squared distance from each
//! query slice to every centroid of its subspace. Building it costs
//! `O(K * dim)` regardless of corpus size; scoring a stored code afterwards is
//! `M` table lookups.

use ndarray::{s, Array2, ArrayView1, ArrayView2};

use crate::codec::Codebook;
use crate::error::{Error, Result};
use crate::utils::squared_l2;

/// Query-scoped `[M, K]` table of squared subspace distances.
#[derive(Debug, Clone, PartialEq)]
pub struct DistanceTable {
    table: Array2<f32>,
}

impl DistanceTable {
    /// Build the table for `query` against every centroid of `codebook`.
    pub fn build(query: &ArrayView1<f32>, codebook: &Codebook) -> Result<Self> {
        if query.len() != codebook.dim() {
            return Err(Error::Shape(format!(
                "Query dimension {} does not match codebook dimension {}",
                query.len(),
                codebook.dim()
            )));
        }

        let m = codebook.num_subspaces();
        let k = codebook.num_centroids();
        let dsub = codebook.subspace_dim();
        let mut table = Array2::<f32>::zeros((m, k));

        for (j, mut row) in table.outer_iter_mut().enumerate() {
            let sub_query = query.slice(s![j * dsub..(j + 1) * dsub]);
            for (dist, centroid) in row.iter_mut().zip(codebook.subspace(j).outer_iter()) {
                *dist = squared_l2(&sub_query, &centroid);
            }
        }

        Ok(Self { table })
    }

    pub fn num_subspaces(&self) -> usize {
        self.table.nrows()
    }

    pub fn num_centroids(&self) -> usize {
        self.table.ncols()
    }

    /// Entry `[subspace, centroid]`.
    pub fn get(&self, subspace: usize, centroid: usize) -> Option<f32> {
        self.table.get((subspace, centroid)).copied()
    }

    pub fn view(&self) -> ArrayView2<'_, f32> {
        self.table.view()
    }

    /// Approximate squared distance of a code: `sum_j table[j][code[j]]`.
    ///
    /// Fails with [`Error::Codec`] if the code has the wrong length or
    /// references a centroid outside the table.
    #[inline]
    pub fn score(&self, id: i64, code: &[u16]) -> Result<f32> {
        if code.len() != self.num_subspaces() {
            return Err(Error::Codec(format!(
                "Code for id {} has {} entries, expected {}",
                id,
                code.len(),
                self.num_subspaces()
            )));
        }

        let mut total = 0.0f32;
        for (j, &c) in code.iter().enumerate() {
            total += self.table.get((j, c as usize)).copied().ok_or_else(|| {
                Error::Codec(format!(
                    "Code for id {} references centroid {} but subspaces have {}",
                    id,
                    c,
                    self.num_centroids()
                ))
            })?;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array3};

    fn codebook() -> Codebook {
        let centroids = Array3::from_shape_vec(
            (2, 2, 2),
            vec![
                0.0, 0.0, 2.0, 0.0, // subspace 0
                1.0, 1.0, -1.0, -1.0, // subspace 1
            ],
        )
        .unwrap();
        Codebook::from_centroids(1, centroids).unwrap()
    }

    #[test]
    fn test_table_entries() {
        let query = array![1.0f32, 0.0, 1.0, 1.0];
        let table = DistanceTable::build(&query.view(), &codebook()).unwrap();
        assert_eq!(table.num_subspaces(), 2);
        assert_eq!(table.num_centroids(), 2);
        assert_eq!(table.get(0, 0), Some(1.0));
        assert_eq!(table.get(0, 1), Some(1.0));
        assert_eq!(table.get(1, 0), Some(0.0));
        assert_eq!(table.get(1, 1), Some(8.0));
        assert!(table.view().iter().all(|&d| d >= 0.0));
    }

    #[test]
    fn test_score_sums_lookups() {
        let query = array![1.0f32, 0.0, 1.0, 1.0];
        let table = DistanceTable::build(&query.view(), &codebook()).unwrap();
        assert_eq!(table.score(0, &[0, 1]).unwrap(), 9.0);
        assert_eq!(table.score(0, &[1, 0]).unwrap(), 1.0);
    }

    #[test]
    fn test_score_rejects_bad_codes() {
        let query = array![1.0f32, 0.0, 1.0, 1.0];
        let table = DistanceTable::build(&query.view(), &codebook()).unwrap();
        assert!(matches!(table.score(3, &[0]), Err(Error::Codec(_))));
        assert!(matches!(table.score(3, &[0, 2]), Err(Error::Codec(_))));
    }

    #[test]
    fn test_build_rejects_dimension_mismatch() {
        assert!(matches!(
            DistanceTable::build(&array![1.0f32, 0.0].view(), &codebook()),
            Err(Error::Shape(_))
        ));
    }
}
