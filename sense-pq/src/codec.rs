//! Product-quantization codebook and encoder

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::Path;

use ndarray::{s, Array2, Array3, ArrayView1, ArrayView2};
use ndarray_npy::{ReadNpyExt, WriteNpyExt};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::{check_subspace_split, MAX_NBITS};
use crate::embeddings::{PqCode, SenseVector};
use crate::error::{Error, Result};
use crate::kmeans::nearest_centroid;

/// Metadata persisted next to `centroids.npy`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodebookMetadata {
    pub m_subspaces: usize,
    pub nbits: usize,
    pub dim: usize,
}

/// Per-subspace centroid sets learned by the trainer.
///
/// A codebook is immutable once built. Retraining produces a new codebook
/// rather than mutating a published one, so it can be shared through an
/// `Arc` by any number of concurrent encoders and searches.
#[derive(Debug, Clone, PartialEq)]
pub struct Codebook {
    nbits: usize,
    /// Centroids of shape `[M, K, dim / M]`
    centroids: Array3<f32>,
}

impl Codebook {
    /// Wrap trained centroids of shape `[M, 2^nbits, dim / M]`.
    pub fn from_centroids(nbits: usize, centroids: Array3<f32>) -> Result<Self> {
        if nbits == 0 || nbits > MAX_NBITS {
            return Err(Error::Config(format!(
                "nbits must be in 1..={}, got {}",
                MAX_NBITS, nbits
            )));
        }
        let (m, k, dsub) = centroids.dim();
        if m == 0 || dsub == 0 {
            return Err(Error::Shape(format!(
                "Codebook needs at least one subspace of non-zero width, got [{}, {}, {}]",
                m, k, dsub
            )));
        }
        if k != 1 << nbits {
            return Err(Error::Shape(format!(
                "Codebook has {} centroids per subspace, expected {} for nbits={}",
                k,
                1usize << nbits,
                nbits
            )));
        }
        Ok(Self { nbits, centroids })
    }

    /// Number of subspaces (M)
    pub fn num_subspaces(&self) -> usize {
        self.centroids.dim().0
    }

    /// Number of centroids per subspace (K)
    pub fn num_centroids(&self) -> usize {
        self.centroids.dim().1
    }

    /// Width of one subspace slice (dim / M)
    pub fn subspace_dim(&self) -> usize {
        self.centroids.dim().2
    }

    /// Full embedding dimension (D)
    pub fn dim(&self) -> usize {
        self.num_subspaces() * self.subspace_dim()
    }

    pub fn nbits(&self) -> usize {
        self.nbits
    }

    /// Raw centroid tensor `[M, K, dim / M]`.
    pub fn centroids(&self) -> &Array3<f32> {
        &self.centroids
    }

    /// Centroids of subspace `j`, shape `[K, dim / M]`.
    pub fn subspace(&self, j: usize) -> ArrayView2<'_, f32> {
        self.centroids.slice(s![j, .., ..])
    }

    /// Centroid `c` of subspace `j`.
    pub fn centroid(&self, j: usize, c: usize) -> ArrayView1<'_, f32> {
        self.centroids.slice(s![j, c, ..])
    }

    /// Number of rows in the flattened quantization table (M * K).
    pub fn num_table_rows(&self) -> usize {
        self.num_subspaces() * self.num_centroids()
    }

    /// Flattened `(subspace_id, centroid_id, centroid)` rows, subspace-major.
    pub fn table_rows(&self) -> impl Iterator<Item = (usize, usize, ArrayView1<'_, f32>)> + '_ {
        let k = self.num_centroids();
        (0..self.num_subspaces())
            .flat_map(move |j| (0..k).map(move |c| (j, c, self.centroid(j, c))))
    }

    fn check_dim(&self, dim: usize) -> Result<()> {
        if dim != self.dim() {
            return Err(Error::Shape(format!(
                "Vector dimension {} does not match codebook dimension {}",
                dim,
                self.dim()
            )));
        }
        Ok(())
    }

    /// Encode one embedding: nearest centroid per subspace, ties to the smallest id.
    pub fn encode(&self, embedding: &ArrayView1<f32>) -> Result<Vec<u16>> {
        self.check_dim(embedding.len())?;
        let dsub = self.subspace_dim();

        Ok((0..self.num_subspaces())
            .map(|j| {
                let slice = embedding.slice(s![j * dsub..(j + 1) * dsub]);
                let (best, _) = nearest_centroid(&slice, &self.subspace(j));
                best as u16
            })
            .collect())
    }

    /// Encode a corpus vector into its [`PqCode`].
    pub fn encode_vector(&self, vector: &SenseVector) -> Result<PqCode> {
        Ok(PqCode {
            id: vector.id,
            code: self.encode(&vector.embedding.view())?,
        })
    }

    /// Encode a batch of embeddings `[N, dim]` in parallel, returning codes `[N, M]`.
    pub fn encode_batch(&self, embeddings: &ArrayView2<f32>) -> Result<Array2<u16>> {
        self.check_dim(embeddings.ncols())?;
        let m = self.num_subspaces();

        let rows: Vec<Vec<u16>> = embeddings
            .outer_iter()
            .into_par_iter()
            .map(|row| self.encode(&row))
            .collect::<Result<_>>()?;

        let flat: Vec<u16> = rows.into_iter().flatten().collect();
        Array2::from_shape_vec((embeddings.nrows(), m), flat)
            .map_err(|e| Error::Shape(format!("Failed to assemble codes: {}", e)))
    }

    /// Check that a stored code can be scored against this codebook.
    pub fn check_code(&self, id: i64, code: &[u16]) -> Result<()> {
        if code.len() != self.num_subspaces() {
            return Err(Error::Codec(format!(
                "Code for id {} has {} entries, expected {}",
                id,
                code.len(),
                self.num_subspaces()
            )));
        }
        let k = self.num_centroids();
        if let Some(&bad) = code.iter().find(|&&c| c as usize >= k) {
            return Err(Error::Codec(format!(
                "Code for id {} references centroid {} but subspaces have {}",
                id, bad, k
            )));
        }
        Ok(())
    }

    /// Whether `dir` holds a codebook written by [`Codebook::save_to_dir`].
    pub fn exists_in(dir: &Path) -> bool {
        dir.join("centroids.npy").is_file() && dir.join("metadata.json").is_file()
    }

    /// Write `centroids.npy` and `metadata.json` into `dir`.
    pub fn save_to_dir(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;

        let centroids_file = BufWriter::new(File::create(dir.join("centroids.npy"))?);
        self.centroids.write_npy(centroids_file)?;

        let metadata = CodebookMetadata {
            m_subspaces: self.num_subspaces(),
            nbits: self.nbits,
            dim: self.dim(),
        };
        let metadata_file = BufWriter::new(File::create(dir.join("metadata.json"))?);
        serde_json::to_writer_pretty(metadata_file, &metadata)?;

        tracing::info!(
            path = %dir.display(),
            m_subspaces = metadata.m_subspaces,
            nbits = metadata.nbits,
            "codebook.saved"
        );
        Ok(())
    }

    /// Load a codebook written by [`Codebook::save_to_dir`].
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let metadata_path = dir.join("metadata.json");
        let metadata: CodebookMetadata = serde_json::from_reader(BufReader::new(
            File::open(&metadata_path).map_err(|e| {
                Error::Store(format!("Failed to open {}: {}", metadata_path.display(), e))
            })?,
        ))?;

        let centroids_path = dir.join("centroids.npy");
        let centroids = Array3::<f32>::read_npy(BufReader::new(
            File::open(&centroids_path).map_err(|e| {
                Error::Store(format!("Failed to open {}: {}", centroids_path.display(), e))
            })?,
        ))?;

        check_subspace_split(metadata.dim, metadata.m_subspaces)?;
        let (m, _, dsub) = centroids.dim();
        if m != metadata.m_subspaces || m * dsub != metadata.dim {
            return Err(Error::Shape(format!(
                "centroids.npy has shape {:?}, metadata declares m_subspaces={} dim={}",
                centroids.dim(),
                metadata.m_subspaces,
                metadata.dim
            )));
        }

        let codebook = Self::from_centroids(metadata.nbits, centroids)?;
        tracing::info!(path = %dir.display(), "codebook.loaded");
        Ok(codebook)
    }
}
