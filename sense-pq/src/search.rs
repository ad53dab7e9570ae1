//! Two-phase search: approximate PQ scoring followed by exact re-ranking.
//!
//! A query moves through `Idle -> BuildTable -> ScoreCandidates -> FetchRaw ->
//! Rerank -> Done`. Invalid parameters fail the query before any work starts.
//! Raw vectors that cannot be fetched are dropped from the ranking and the
//! response is marked partial.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Instant;

use ndarray::{ArrayView1, ArrayView2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::adc::DistanceTable;
use crate::codec::Codebook;
use crate::config::{PqConfig, SearchParameters};
use crate::embeddings::{SenseVector, StoredCode};
use crate::error::{Error, Result};
use crate::store::{CodeShard, CodeStore, VectorStore, WordLookup};
use crate::topn::{merge_top_n, BoundedTopN, Candidate};
use crate::utils::squared_l2;

/// Stage of a single query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueryPhase {
    Idle,
    BuildTable,
    ScoreCandidates,
    FetchRaw,
    Rerank,
    Done,
    Failed,
}

fn enter(phase: QueryPhase) {
    tracing::debug!(phase = ?phase, "search.phase");
}

/// One re-ranked result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub id: i64,
    pub word: String,
    pub sense_id: i32,
    pub approx_distance: f32,
    pub exact_distance: f32,
}

/// Results of a query, ascending by exact distance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    /// Candidates whose raw vector could not be fetched
    pub missing_ids: Vec<i64>,
}

impl SearchResponse {
    /// Whether some candidates were dropped because their raw vector was missing.
    pub fn is_partial(&self) -> bool {
        !self.missing_ids.is_empty()
    }

    pub fn ids(&self) -> Vec<i64> {
        self.results.iter().map(|r| r.id).collect()
    }
}

/// Score a code stream against `table`, keeping the best `n` candidates.
///
/// `offset` is the stream position of the first code. Any stream error fails
/// the whole pass.
pub fn score_candidates<I>(
    table: &DistanceTable,
    codes: I,
    offset: u64,
    n: usize,
) -> Result<Vec<Candidate>>
where
    I: IntoIterator<Item = Result<StoredCode>>,
{
    let mut top = BoundedTopN::new(n);

    for (i, stored) in codes.into_iter().enumerate() {
        let stored = stored?;
        let approx_distance = table.score(stored.id, &stored.code)?;
        if let Some(threshold) = top.threshold() {
            if approx_distance > threshold {
                continue;
            }
        }
        top.push(Candidate {
            id: stored.id,
            word: stored.word,
            sense_id: stored.sense_id,
            approx_distance,
            position: offset + i as u64,
        });
    }

    Ok(top.into_sorted_vec())
}

/// Score shards in parallel and merge their local top-N into the global top-N.
pub fn score_sharded(
    table: &DistanceTable,
    shards: Vec<CodeShard<'_>>,
    n: usize,
) -> Result<Vec<Candidate>> {
    let local: Vec<Vec<Candidate>> = shards
        .into_par_iter()
        .map(|shard| score_candidates(table, shard.codes, shard.offset, n))
        .collect::<Result<_>>()?;

    Ok(merge_top_n(local, n))
}

/// Re-rank candidates by exact squared distance to `query`.
///
/// Raw vectors are fetched with a single batched call. Results are sorted by
/// exact distance, ties by ascending id, and truncated to `params.final_k`.
pub fn verify_candidates<V: VectorStore + ?Sized>(
    query: &ArrayView1<f32>,
    candidates: Vec<Candidate>,
    store: &V,
    params: &SearchParameters,
) -> Result<SearchResponse> {
    params.validate()?;
    if candidates.is_empty() {
        return Ok(SearchResponse::default());
    }

    enter(QueryPhase::FetchRaw);
    let ids: Vec<i64> = candidates.iter().map(|c| c.id).collect();
    let raw = store.fetch_raw(&ids)?;

    enter(QueryPhase::Rerank);
    let mut missing_ids = Vec::new();
    let mut results = Vec::with_capacity(candidates.len());

    for candidate in candidates {
        let Some(vector) = raw.get(&candidate.id) else {
            missing_ids.push(candidate.id);
            continue;
        };
        if vector.len() != query.len() {
            return Err(Error::Shape(format!(
                "Raw vector {} has dimension {}, query has {}",
                candidate.id,
                vector.len(),
                query.len()
            )));
        }
        results.push(SearchResult {
            id: candidate.id,
            word: candidate.word,
            sense_id: candidate.sense_id,
            approx_distance: candidate.approx_distance,
            exact_distance: squared_l2(query, &vector.view()),
        });
    }

    if !missing_ids.is_empty() {
        tracing::warn!(missing = missing_ids.len(), "search.verify.missing");
    }

    results.sort_by(|a, b| match a.exact_distance.total_cmp(&b.exact_distance) {
        Ordering::Equal => a.id.cmp(&b.id),
        other => other,
    });
    results.truncate(params.final_k);

    Ok(SearchResponse {
        results,
        missing_ids,
    })
}

/// Handle for searching one corpus generation.
///
/// The codebook is shared read-only; queries hold no state between calls and
/// may run concurrently.
pub struct SearchEngine<S> {
    codebook: Arc<Codebook>,
    store: S,
    num_shards: usize,
}

impl<S> SearchEngine<S> {
    pub fn new(codebook: Arc<Codebook>, store: S) -> Self {
        Self {
            codebook,
            store,
            num_shards: 1,
        }
    }

    /// Score the code stream in `num_shards` parallel shards.
    pub fn with_num_shards(mut self, num_shards: usize) -> Self {
        self.num_shards = num_shards.max(1);
        self
    }

    /// Build an engine using the shard count of `config`.
    pub fn from_config(codebook: Arc<Codebook>, store: S, config: &PqConfig) -> Self {
        Self::new(codebook, store).with_num_shards(config.num_shards)
    }

    pub fn codebook(&self) -> &Arc<Codebook> {
        &self.codebook
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn num_shards(&self) -> usize {
        self.num_shards
    }
}

impl<S: CodeStore + VectorStore> SearchEngine<S> {
    /// Search with `post_verification_k` approximate candidates and `final_k` results.
    pub fn search(
        &self,
        query: &ArrayView1<f32>,
        post_verification_k: usize,
        final_k: usize,
    ) -> Result<SearchResponse> {
        self.search_with(query, &SearchParameters::new(post_verification_k, final_k))
    }

    /// Run the two-phase search for one query.
    pub fn search_with(
        &self,
        query: &ArrayView1<f32>,
        params: &SearchParameters,
    ) -> Result<SearchResponse> {
        enter(QueryPhase::Idle);
        let result = params
            .validate()
            .and_then(|()| self.run_query(query, params));
        if result.is_err() {
            enter(QueryPhase::Failed);
        }
        result
    }

    fn run_query(
        &self,
        query: &ArrayView1<f32>,
        params: &SearchParameters,
    ) -> Result<SearchResponse> {
        let start = Instant::now();

        enter(QueryPhase::BuildTable);
        let table = DistanceTable::build(query, &self.codebook)?;

        enter(QueryPhase::ScoreCandidates);
        let candidates = if self.num_shards > 1 {
            score_sharded(
                &table,
                self.store.code_shards(self.num_shards)?,
                params.post_verification_k,
            )?
        } else {
            score_candidates(
                &table,
                self.store.stream_codes()?,
                0,
                params.post_verification_k,
            )?
        };
        let num_candidates = candidates.len();

        let response = verify_candidates(query, candidates, &self.store, params)?;

        enter(QueryPhase::Done);
        tracing::debug!(
            candidates = num_candidates,
            results = response.results.len(),
            partial = response.is_partial(),
            elapsed_us = start.elapsed().as_micros() as u64,
            "search.complete"
        );
        Ok(response)
    }
}

impl<S: CodeStore + VectorStore + Sync> SearchEngine<S> {
    /// Search every row of `queries` in parallel.
    pub fn search_batch(
        &self,
        queries: &ArrayView2<f32>,
        params: &SearchParameters,
    ) -> Result<Vec<SearchResponse>> {
        params.validate()?;
        queries
            .outer_iter()
            .into_par_iter()
            .map(|query| self.search_with(&query, params))
            .collect()
    }
}

impl<S: CodeStore + VectorStore + WordLookup> SearchEngine<S> {
    /// Search with the first stored sense of `word` as the query.
    ///
    /// Returns `None` if the word is not in the corpus.
    pub fn search_word(
        &self,
        word: &str,
        params: &SearchParameters,
    ) -> Result<Option<(SenseVector, SearchResponse)>> {
        params.validate()?;
        let Some(query) = self.store.lookup_word(word)? else {
            tracing::warn!(word, "search.word.not_found");
            return Ok(None);
        };
        tracing::info!(word, sense_id = query.sense_id, dim = query.dim(), "search.word");
        let response = self.search_with(&query.embedding.view(), params)?;
        Ok(Some((query, response)))
    }
}
