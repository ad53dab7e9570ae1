//! Index building: train or reuse a codebook, encode every vector and
//! hand both to the storage sink.

use std::time::Instant;

use ndarray::ArrayView2;

use crate::codec::Codebook;
use crate::config::{PqConfig, TrainConfig};
use crate::embeddings::{stack_embeddings, PqCode, SenseVector};
use crate::error::{Error, Result};
use crate::kmeans::train_codebook;
use crate::store::CodebookSink;

/// Apply the corpus preprocessing selected by `config`.
///
/// With `config.normalization` every embedding is scaled to unit L2 norm
/// (zero vectors are kept as-is). The returned vectors are the ones to store
/// as raw vectors and to pass to [`build_index`], so that exact re-ranking and
/// quantization see the same data.
pub fn prepare_corpus(mut vectors: Vec<SenseVector>, config: &PqConfig) -> Vec<SenseVector> {
    if config.normalization {
        for vector in &mut vectors {
            let norm = vector.embedding.dot(&vector.embedding).sqrt();
            if norm > 0.0 {
                vector.embedding /= norm;
            }
        }
    }
    vectors
}

/// Summary of a completed build.
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub num_vectors: usize,
    pub dim: usize,
    /// Rows in the flattened quantization table (M * K)
    pub table_rows: usize,
    /// The codebook was loaded from `config.codebook_dir` rather than trained
    pub reused_codebook: bool,
}

/// Load the codebook saved in `config.codebook_dir`, or train one on `embeddings`.
///
/// A trained codebook is exported to `config.export_codebook_dir` when set.
/// Returns the codebook and whether it was reused.
fn load_or_train(embeddings: &ArrayView2<f32>, config: &PqConfig) -> Result<(Codebook, bool)> {
    if let Some(dir) = config.codebook_dir.as_deref().filter(|dir| Codebook::exists_in(dir)) {
        let codebook = Codebook::load_from_dir(dir)?;
        if codebook.dim() != embeddings.ncols() {
            return Err(Error::Shape(format!(
                "Codebook in {} has dimension {}, corpus has {}",
                dir.display(),
                codebook.dim(),
                embeddings.ncols()
            )));
        }
        if codebook.num_subspaces() != config.m_subspaces || codebook.nbits() != config.nbits {
            return Err(Error::Config(format!(
                "Codebook in {} has m_subspaces={} nbits={}, configured m_subspaces={} nbits={}",
                dir.display(),
                codebook.num_subspaces(),
                codebook.nbits(),
                config.m_subspaces,
                config.nbits
            )));
        }
        tracing::info!(path = %dir.display(), "index.build.reuse_codebook");
        return Ok((codebook, true));
    }

    let codebook = train_codebook(
        embeddings,
        config.m_subspaces,
        config.nbits,
        &TrainConfig::from(config),
    )?;
    if let Some(dir) = &config.export_codebook_dir {
        codebook.save_to_dir(dir)?;
    }
    Ok((codebook, false))
}

/// Train, encode and persist a corpus.
///
/// `vectors` should already have gone through [`prepare_corpus`]. A codebook
/// saved in `config.codebook_dir` is reused; otherwise one is trained on the
/// first `config.train_size` vectors. Then every vector is encoded in
/// parallel. The sink receives the codebook before the codes.
///
/// # Returns
///
/// The codebook used for encoding and a build summary.
pub fn build_index<K: CodebookSink + ?Sized>(
    vectors: &[SenseVector],
    config: &PqConfig,
    sink: &mut K,
) -> Result<(Codebook, BuildReport)> {
    config.validate()?;
    if vectors.is_empty() {
        return Err(Error::Config("Cannot build an index from an empty corpus".into()));
    }

    let embeddings = stack_embeddings(vectors)?;
    let dim = embeddings.ncols();
    config.validate_for_dim(dim)?;

    let start = Instant::now();
    let (codebook, reused_codebook) = load_or_train(&embeddings.view(), config)?;
    let codebook_ms = start.elapsed().as_millis() as u64;

    let start = Instant::now();
    let codes = codebook.encode_batch(&embeddings.view())?;
    let pq_codes: Vec<PqCode> = vectors
        .iter()
        .zip(codes.outer_iter())
        .map(|(vector, code)| PqCode {
            id: vector.id,
            code: code.to_vec(),
        })
        .collect();
    let encode_ms = start.elapsed().as_millis() as u64;

    sink.persist_codebook(&codebook)?;
    sink.persist_codes(&pq_codes)?;

    let report = BuildReport {
        num_vectors: vectors.len(),
        dim,
        table_rows: codebook.num_table_rows(),
        reused_codebook,
    };
    tracing::info!(
        num_vectors = report.num_vectors,
        dim,
        table_rows = report.table_rows,
        reused_codebook,
        codebook_ms,
        encode_ms,
        "index.build.complete"
    );

    Ok((codebook, report))
}
