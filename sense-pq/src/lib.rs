//! Sense-PQ: product quantization with post-verification for sense embeddings
//!
//! This crate trains per-subspace centroid codebooks, encodes embedding
//! vectors into compact multi-index codes, and answers nearest-neighbour
//! queries in two phases: an approximate scan of all codes through a
//! per-query distance table, followed by exact re-ranking of the surviving
//! candidates against their raw vectors.

pub mod adc;
pub mod codec;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod index;
pub mod kmeans;
pub mod search;
pub mod store;
pub mod topn;
pub mod utils;

pub use adc::DistanceTable;
pub use codec::{Codebook, CodebookMetadata};
pub use config::{PqConfig, SearchParameters, TrainConfig};
pub use embeddings::{PqCode, SenseVector, StoredCode};
pub use error::{Error, Result};
pub use index::{build_index, prepare_corpus, BuildReport};
pub use kmeans::{augment_training_set, lloyd, train_codebook};
pub use search::{SearchEngine, SearchResponse, SearchResult};
pub use store::{CodeStore, CodebookSink, MemoryStore, VectorStore, WordLookup};
pub use topn::{BoundedTopN, Candidate};
