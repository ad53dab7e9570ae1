//! Validated configuration for training and search.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Largest supported `nbits`; codes are stored as `u16`.
pub const MAX_NBITS: usize = 16;

/// Largest supported `augment_multiple`.
pub const MAX_AUGMENT_MULTIPLE: usize = 64;

/// Configuration for codebook training and two-phase search.
///
/// Values are checked once by [`PqConfig::validate`] when the configuration
/// is loaded; search calls do not re-validate them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PqConfig {
    /// Number of subspaces (M). The embedding dimension must be divisible by it.
    pub m_subspaces: usize,
    /// Bits per subspace code; each subspace has `2^nbits` centroids
    pub nbits: usize,
    /// Train on the first `train_size` vectors only. None trains on the whole corpus.
    #[serde(default)]
    pub train_size: Option<usize>,
    /// Number of approximate candidates kept for exact re-ranking (N)
    #[serde(default = "default_post_verification_k")]
    pub post_verification_k: usize,
    /// Number of results returned after re-ranking
    #[serde(default = "default_final_k")]
    pub final_k: usize,
    /// Store raw vectors as big-endian float4 byte strings instead of float arrays
    #[serde(default = "default_use_bytea")]
    pub use_bytea: bool,
    /// Maximum number of Lloyd iterations per subspace (default: 25)
    #[serde(default = "default_kmeans_niters")]
    pub kmeans_niters: usize,
    /// Random seed for centroid initialisation and training-set augmentation
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Undersized training sets are padded to `augment_multiple * 2^nbits` points
    #[serde(default = "default_augment_multiple")]
    pub augment_multiple: usize,
    /// Noise standard deviation of padded points, relative to each dimension's spread
    #[serde(default = "default_noise_fraction")]
    pub noise_fraction: f32,
    /// L2-normalise corpus vectors before training and encoding
    #[serde(default)]
    pub normalization: bool,
    /// Number of shards the code stream is scored in (1 = sequential)
    #[serde(default = "default_num_shards")]
    pub num_shards: usize,
    /// Reuse the codebook saved in this directory instead of training, if present
    #[serde(default)]
    pub codebook_dir: Option<PathBuf>,
    /// Save a freshly trained codebook to this directory
    #[serde(default)]
    pub export_codebook_dir: Option<PathBuf>,
}

fn default_post_verification_k() -> usize {
    500
}

fn default_final_k() -> usize {
    10
}

fn default_use_bytea() -> bool {
    true
}

fn default_kmeans_niters() -> usize {
    25
}

fn default_seed() -> u64 {
    42
}

fn default_augment_multiple() -> usize {
    1
}

fn default_noise_fraction() -> f32 {
    0.001
}

fn default_num_shards() -> usize {
    1
}

impl Default for PqConfig {
    fn default() -> Self {
        Self {
            m_subspaces: 10,
            nbits: 8,
            train_size: None,
            post_verification_k: default_post_verification_k(),
            final_k: default_final_k(),
            use_bytea: default_use_bytea(),
            kmeans_niters: default_kmeans_niters(),
            seed: default_seed(),
            augment_multiple: default_augment_multiple(),
            noise_fraction: default_noise_fraction(),
            normalization: false,
            num_shards: default_num_shards(),
            codebook_dir: None,
            export_codebook_dir: None,
        }
    }
}

impl PqConfig {
    /// Load a configuration from a JSON file and validate it.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            Error::Config(format!("Failed to open {}: {}", path.display(), e))
        })?;
        let config: PqConfig = serde_json::from_reader(BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject invalid field values and combinations.
    pub fn validate(&self) -> Result<()> {
        if self.m_subspaces == 0 {
            return Err(Error::Config("m_subspaces must be > 0".into()));
        }
        if self.nbits == 0 || self.nbits > MAX_NBITS {
            return Err(Error::Config(format!(
                "nbits must be in 1..={}, got {}",
                MAX_NBITS, self.nbits
            )));
        }
        if self.train_size == Some(0) {
            return Err(Error::Config("train_size must be > 0".into()));
        }
        SearchParameters::from(self).validate()?;
        if self.kmeans_niters == 0 {
            return Err(Error::Config("kmeans_niters must be > 0".into()));
        }
        if self.augment_multiple == 0 || self.augment_multiple > MAX_AUGMENT_MULTIPLE {
            return Err(Error::Config(format!(
                "augment_multiple must be in 1..={}, got {}",
                MAX_AUGMENT_MULTIPLE, self.augment_multiple
            )));
        }
        if !self.noise_fraction.is_finite() || self.noise_fraction < 0.0 {
            return Err(Error::Config(format!(
                "noise_fraction must be finite and >= 0, got {}",
                self.noise_fraction
            )));
        }
        if self.num_shards == 0 {
            return Err(Error::Config("num_shards must be > 0".into()));
        }
        Ok(())
    }

    /// Validate the configuration against a concrete embedding dimension.
    pub fn validate_for_dim(&self, dim: usize) -> Result<()> {
        self.validate()?;
        check_subspace_split(dim, self.m_subspaces)
    }

    /// Number of centroids per subspace (K).
    pub fn num_centroids(&self) -> usize {
        1usize << self.nbits
    }
}

/// Check that `dim` splits evenly into `m` non-empty subspaces.
pub(crate) fn check_subspace_split(dim: usize, m: usize) -> Result<()> {
    if m == 0 || dim == 0 || dim % m != 0 {
        return Err(Error::Config(format!(
            "Dimension {} must be divisible by m_subspaces {}",
            dim, m
        )));
    }
    Ok(())
}

/// Training parameters derived from [`PqConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct TrainConfig {
    pub train_size: Option<usize>,
    pub kmeans_niters: usize,
    pub seed: u64,
    pub augment_multiple: usize,
    pub noise_fraction: f32,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self::from(&PqConfig::default())
    }
}

impl From<&PqConfig> for TrainConfig {
    fn from(config: &PqConfig) -> Self {
        Self {
            train_size: config.train_size,
            kmeans_niters: config.kmeans_niters,
            seed: config.seed,
            augment_multiple: config.augment_multiple,
            noise_fraction: config.noise_fraction,
        }
    }
}

/// Search parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchParameters {
    /// Number of approximate candidates re-ranked with exact distances (N)
    pub post_verification_k: usize,
    /// Number of final results to return
    pub final_k: usize,
}

impl Default for SearchParameters {
    fn default() -> Self {
        Self {
            post_verification_k: default_post_verification_k(),
            final_k: default_final_k(),
        }
    }
}

impl From<&PqConfig> for SearchParameters {
    fn from(config: &PqConfig) -> Self {
        Self {
            post_verification_k: config.post_verification_k,
            final_k: config.final_k,
        }
    }
}

impl SearchParameters {
    pub fn new(post_verification_k: usize, final_k: usize) -> Self {
        Self {
            post_verification_k,
            final_k,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.post_verification_k == 0 {
            return Err(Error::Config("post_verification_k must be > 0".into()));
        }
        if self.final_k == 0 {
            return Err(Error::Config("final_k must be > 0".into()));
        }
        if self.final_k > self.post_verification_k {
            return Err(Error::Config(format!(
                "final_k ({}) must not exceed post_verification_k ({})",
                self.final_k, self.post_verification_k
            )));
        }
        Ok(())
    }
}
