//! Corpus records: raw sense vectors and their product-quantization codes.

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One sense of a word together with its raw embedding.
///
/// `id` is unique within a corpus; `(word, sense_id)` need not be.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SenseVector {
    pub id: i64,
    pub word: String,
    pub sense_id: i32,
    pub embedding: Array1<f32>,
}

impl SenseVector {
    pub fn new(id: i64, word: impl Into<String>, sense_id: i32, embedding: Array1<f32>) -> Self {
        Self {
            id,
            word: word.into(),
            sense_id,
            embedding,
        }
    }

    pub fn dim(&self) -> usize {
        self.embedding.len()
    }
}

/// Compressed representation of a vector: one centroid id per subspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PqCode {
    pub id: i64,
    pub code: Vec<u16>,
}

/// A code as yielded by a [`CodeStore`](crate::store::CodeStore) stream,
/// joined with the word metadata of its vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCode {
    pub id: i64,
    pub word: String,
    pub sense_id: i32,
    pub code: Vec<u16>,
}

/// Stack the embeddings of a corpus into a `[N, dim]` matrix.
///
/// Fails if the vectors do not all share the same dimension.
pub fn stack_embeddings(vectors: &[SenseVector]) -> Result<Array2<f32>> {
    let dim = vectors.first().map(SenseVector::dim).unwrap_or(0);
    let mut matrix = Array2::<f32>::zeros((vectors.len(), dim));

    for (mut row, vector) in matrix.rows_mut().into_iter().zip(vectors) {
        if vector.dim() != dim {
            return Err(Error::Shape(format!(
                "Vector {} has dimension {}, expected {}",
                vector.id,
                vector.dim(),
                dim
            )));
        }
        row.assign(&vector.embedding);
    }

    Ok(matrix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_stack_embeddings() {
        let vectors = vec![
            SenseVector::new(1, "a", 0, array![1.0, 2.0]),
            SenseVector::new(2, "b", 0, array![3.0, 4.0]),
        ];
        let matrix = stack_embeddings(&vectors).unwrap();
        assert_eq!(matrix.dim(), (2, 2));
        assert_eq!(matrix[[1, 0]], 3.0);
    }

    #[test]
    fn test_stack_embeddings_rejects_ragged_corpus() {
        let vectors = vec![
            SenseVector::new(1, "a", 0, array![1.0, 2.0]),
            SenseVector::new(2, "b", 0, array![3.0]),
        ];
        assert!(matches!(stack_embeddings(&vectors), Err(Error::Shape(_))));
    }

    #[test]
    fn test_stack_empty_corpus() {
        let matrix = stack_embeddings(&[]).unwrap();
        assert_eq!(matrix.nrows(), 0);
    }
}
