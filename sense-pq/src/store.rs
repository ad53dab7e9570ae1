//! Storage collaborators consumed by training and search.
//!
//! The engine never owns corpus data: raw vectors, codes and the codebook are
//! read and written through these traits. [`MemoryStore`] is an in-process
//! implementation of all of them.

use std::collections::HashMap;

use ndarray::Array1;

use crate::codec::Codebook;
use crate::embeddings::{PqCode, SenseVector, StoredCode};
use crate::error::{Error, Result};
use crate::utils::{decode_bytea, encode_bytea};

/// Lazy, finite stream of stored codes.
pub type CodeStream<'a> = Box<dyn Iterator<Item = Result<StoredCode>> + Send + 'a>;

/// A contiguous slice of the code stream.
///
/// `offset` is the stream position of the shard's first code, so candidates
/// keep their global position when shards are scored independently.
pub struct CodeShard<'a> {
    pub offset: u64,
    pub codes: CodeStream<'a>,
}

/// Batched access to raw vectors for exact re-ranking.
pub trait VectorStore {
    /// Fetch the raw embeddings of `ids`. Ids that are not found are omitted.
    fn fetch_raw(&self, ids: &[i64]) -> Result<HashMap<i64, Array1<f32>>>;
}

/// Restartable access to the stored codes.
pub trait CodeStore {
    /// Start a new pass over all codes, in a fixed order.
    fn stream_codes(&self) -> Result<CodeStream<'_>>;

    /// Split the stream into at most `num_shards` ordered shards.
    ///
    /// Concatenating the shards must reproduce [`CodeStore::stream_codes`].
    fn code_shards(&self, _num_shards: usize) -> Result<Vec<CodeShard<'_>>> {
        Ok(vec![CodeShard {
            offset: 0,
            codes: self.stream_codes()?,
        }])
    }
}

/// Lookup of a stored sense by word.
pub trait WordLookup {
    /// First stored sense of `word`, if any.
    fn lookup_word(&self, word: &str) -> Result<Option<SenseVector>>;
}

/// Write-only sink for the artifacts of training and encoding.
pub trait CodebookSink {
    fn persist_codebook(&mut self, codebook: &Codebook) -> Result<()>;
    fn persist_codes(&mut self, codes: &[PqCode]) -> Result<()>;
}

#[derive(Debug, Clone)]
enum RawPayload {
    Floats(Array1<f32>),
    Bytea(Vec<u8>),
}

#[derive(Debug, Clone)]
struct Row {
    id: i64,
    word: String,
    sense_id: i32,
    raw: Option<RawPayload>,
}

impl Row {
    fn decode(&self) -> Result<Option<Array1<f32>>> {
        match &self.raw {
            Some(RawPayload::Floats(v)) => Ok(Some(v.clone())),
            Some(RawPayload::Bytea(bytes)) => decode_bytea(bytes).map(Some),
            None => Ok(None),
        }
    }
}

/// In-memory corpus: raw vectors, codes and the current codebook.
///
/// Codes are streamed in the order they were persisted.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    use_bytea: bool,
    rows: Vec<Row>,
    by_id: HashMap<i64, usize>,
    codebook: Option<Codebook>,
    codes: Vec<PqCode>,
}

impl MemoryStore {
    /// Create an empty store. With `use_bytea` raw vectors are kept as
    /// big-endian float4 byte strings and decoded on fetch.
    pub fn new(use_bytea: bool) -> Self {
        Self {
            use_bytea,
            ..Default::default()
        }
    }

    /// Create a store holding `vectors`.
    pub fn from_vectors(vectors: &[SenseVector], use_bytea: bool) -> Result<Self> {
        let mut store = Self::new(use_bytea);
        for vector in vectors {
            store.insert(vector)?;
        }
        Ok(store)
    }

    /// Add a raw vector. Ids must be unique.
    pub fn insert(&mut self, vector: &SenseVector) -> Result<()> {
        if self.by_id.contains_key(&vector.id) {
            return Err(Error::Store(format!("Duplicate vector id {}", vector.id)));
        }
        let raw = if self.use_bytea {
            RawPayload::Bytea(encode_bytea(&vector.embedding.view()))
        } else {
            RawPayload::Floats(vector.embedding.clone())
        };
        self.by_id.insert(vector.id, self.rows.len());
        self.rows.push(Row {
            id: vector.id,
            word: vector.word.clone(),
            sense_id: vector.sense_id,
            raw: Some(raw),
        });
        Ok(())
    }

    /// Drop the raw vector of `id`, keeping its word metadata and code.
    pub fn remove_raw(&mut self, id: i64) -> bool {
        match self.by_id.get(&id) {
            Some(&idx) => self.rows[idx].raw.take().is_some(),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn uses_bytea(&self) -> bool {
        self.use_bytea
    }

    /// Codebook of the current generation, if one was persisted.
    pub fn codebook(&self) -> Option<&Codebook> {
        self.codebook.as_ref()
    }

    pub fn codes(&self) -> &[PqCode] {
        &self.codes
    }

    fn join(&self, code: &PqCode) -> Result<StoredCode> {
        let row = self
            .by_id
            .get(&code.id)
            .map(|&idx| &self.rows[idx])
            .ok_or_else(|| Error::Store(format!("Code references unknown id {}", code.id)))?;
        Ok(StoredCode {
            id: row.id,
            word: row.word.clone(),
            sense_id: row.sense_id,
            code: code.code.clone(),
        })
    }
}

impl VectorStore for MemoryStore {
    fn fetch_raw(&self, ids: &[i64]) -> Result<HashMap<i64, Array1<f32>>> {
        let mut found = HashMap::with_capacity(ids.len());
        for id in ids {
            if let Some(&idx) = self.by_id.get(id) {
                if let Some(vector) = self.rows[idx].decode()? {
                    found.insert(*id, vector);
                }
            }
        }
        Ok(found)
    }
}

impl CodeStore for MemoryStore {
    fn stream_codes(&self) -> Result<CodeStream<'_>> {
        Ok(Box::new(self.codes.iter().map(move |code| self.join(code))))
    }

    fn code_shards(&self, num_shards: usize) -> Result<Vec<CodeShard<'_>>> {
        let num_shards = num_shards.max(1);
        if self.codes.is_empty() {
            return Ok(vec![CodeShard {
                offset: 0,
                codes: Box::new(std::iter::empty::<Result<StoredCode>>()),
            }]);
        }

        let shard_len = self.codes.len().div_ceil(num_shards);
        Ok(self
            .codes
            .chunks(shard_len)
            .enumerate()
            .map(|(i, chunk)| CodeShard {
                offset: (i * shard_len) as u64,
                codes: Box::new(chunk.iter().map(move |code| self.join(code))) as CodeStream<'_>,
            })
            .collect())
    }
}

impl WordLookup for MemoryStore {
    fn lookup_word(&self, word: &str) -> Result<Option<SenseVector>> {
        for row in self.rows.iter().filter(|row| row.word == word) {
            if let Some(embedding) = row.decode()? {
                return Ok(Some(SenseVector {
                    id: row.id,
                    word: row.word.clone(),
                    sense_id: row.sense_id,
                    embedding,
                }));
            }
        }
        Ok(None)
    }
}

impl CodebookSink for MemoryStore {
    /// Store a new codebook generation. Codes of the previous generation are discarded.
    fn persist_codebook(&mut self, codebook: &Codebook) -> Result<()> {
        self.codebook = Some(codebook.clone());
        self.codes.clear();
        Ok(())
    }

    fn persist_codes(&mut self, codes: &[PqCode]) -> Result<()> {
        let codebook = self
            .codebook
            .as_ref()
            .ok_or_else(|| Error::Store("persist_codes called before persist_codebook".into()))?;
        for code in codes {
            if !self.by_id.contains_key(&code.id) {
                return Err(Error::Store(format!(
                    "Code references unknown id {}",
                    code.id
                )));
            }
            codebook.check_code(code.id, &code.code)?;
        }
        self.codes.extend_from_slice(codes);
        Ok(())
    }
}
