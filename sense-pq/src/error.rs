//! Error types for the sense-pq library

use thiserror::Error;

/// Result type alias for sense-pq operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur during training, encoding and search.
///
/// A raw vector that cannot be fetched during verification is not an error:
/// it is dropped from the ranking and reported in
/// [`SearchResponse::missing_ids`](crate::search::SearchResponse::missing_ids).
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration, raised before any computation starts
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Error with vector or array dimensions
    #[error("Shape error: {0}")]
    Shape(String),

    /// A stored code does not match the codebook
    #[error("Codec error: {0}")]
    Codec(String),

    /// Failure reported by a storage collaborator
    #[error("Store error: {0}")]
    Store(String),

    /// Error reading/writing files
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Error parsing JSON
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// NPY read error
    #[error("NPY read error: {0}")]
    NpyRead(#[from] ndarray_npy::ReadNpyError),

    /// NPY write error
    #[error("NPY write error: {0}")]
    NpyWrite(#[from] ndarray_npy::WriteNpyError),
}
