//! Property-based tests for training, scoring and re-ranking.
//!
//! These tests verify invariants that should hold for any corpus:
//! - Trained codebooks and codes have the configured shape
//! - Approximate distances are the sum of the per-query table entries
//! - Final results are ordered by exact distance and never exceed final_k
//! - Sharded scoring selects the same candidates as a single pass

use std::collections::HashMap;
use std::sync::Arc;

use ndarray::{Array1, Array2};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use proptest::prelude::*;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use sense_pq::{
    build_index, BoundedTopN, Candidate, DistanceTable, MemoryStore, PqConfig, SearchEngine,
    SenseVector,
};

fn random_corpus(n: usize, dim: usize, seed: u64) -> Vec<SenseVector> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let embeddings = Array2::random_using((n, dim), Uniform::new(-1.0f32, 1.0), &mut rng);
    embeddings
        .outer_iter()
        .enumerate()
        .map(|(i, row)| {
            SenseVector::new(i as i64 + 100, format!("w{}", i / 2), (i % 2) as i32, row.to_owned())
        })
        .collect()
}

fn config(m: usize, nbits: usize, post_verification_k: usize, final_k: usize) -> PqConfig {
    PqConfig {
        m_subspaces: m,
        nbits,
        post_verification_k,
        final_k,
        kmeans_niters: 10,
        ..Default::default()
    }
}

prop_compose! {
    /// (n, m, dsub, nbits, seed)
    fn arb_layout()(
        n in 1usize..40,
        m in 1usize..4,
        dsub in 1usize..4,
        nbits in 1usize..5,
        seed in any::<u64>(),
    ) -> (usize, usize, usize, usize, u64) {
        (n, m, dsub, nbits, seed)
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn trained_codebook_has_configured_shape((n, m, dsub, nbits, seed) in arb_layout()) {
        let vectors = random_corpus(n, m * dsub, seed);
        let mut store = MemoryStore::from_vectors(&vectors, true).unwrap();
        let (codebook, report) =
            build_index(&vectors, &config(m, nbits, 8, 4), &mut store).unwrap();

        let k = 1usize << nbits;
        prop_assert_eq!(codebook.centroids().dim(), (m, k, dsub));
        prop_assert_eq!(report.table_rows, m * k);
        prop_assert!(codebook.centroids().iter().all(|v| v.is_finite()));

        prop_assert_eq!(store.codes().len(), n);
        for code in store.codes() {
            prop_assert_eq!(code.code.len(), m);
            prop_assert!(code.code.iter().all(|&c| (c as usize) < k));
        }
    }

    #[test]
    fn approx_distance_is_sum_of_table_entries(
        (n, m, dsub, nbits, seed) in arb_layout(),
        query_seed in any::<u64>(),
    ) {
        let vectors = random_corpus(n, m * dsub, seed);
        let mut store = MemoryStore::from_vectors(&vectors, true).unwrap();
        let (codebook, _) = build_index(&vectors, &config(m, nbits, 8, 4), &mut store).unwrap();
        let codes: HashMap<i64, Vec<u16>> =
            store.codes().iter().map(|c| (c.id, c.code.clone())).collect();

        let mut rng = ChaCha8Rng::seed_from_u64(query_seed);
        let query = Array1::random_using(m * dsub, Uniform::new(-1.0f32, 1.0), &mut rng);
        let table = DistanceTable::build(&query.view(), &codebook).unwrap();

        let engine = SearchEngine::new(Arc::new(codebook), store);
        let response = engine.search(&query.view(), 8, 4).unwrap();

        for result in &response.results {
            let expected: f32 = codes[&result.id]
                .iter()
                .enumerate()
                .map(|(j, &c)| table.get(j, c as usize).unwrap())
                .sum();
            prop_assert!(
                (result.approx_distance - expected).abs() <= 1e-4 * expected.max(1.0),
                "approx {} vs table sum {}",
                result.approx_distance,
                expected
            );
        }
    }

    #[test]
    fn results_are_sorted_and_bounded(
        (n, m, dsub, nbits, seed) in arb_layout(),
        post_verification_k in 1usize..20,
        final_k_seed in any::<usize>(),
        query_seed in any::<u64>(),
    ) {
        let final_k = 1 + final_k_seed % post_verification_k;
        let vectors = random_corpus(n, m * dsub, seed);
        let mut store = MemoryStore::from_vectors(&vectors, false).unwrap();
        let config = config(m, nbits, post_verification_k, final_k);
        let (codebook, _) = build_index(&vectors, &config, &mut store).unwrap();
        let engine = SearchEngine::new(Arc::new(codebook), store);

        let mut rng = ChaCha8Rng::seed_from_u64(query_seed);
        let query = Array1::random_using(m * dsub, Uniform::new(-1.0f32, 1.0), &mut rng);
        let response = engine.search(&query.view(), post_verification_k, final_k).unwrap();

        prop_assert_eq!(response.results.len(), final_k.min(n));
        prop_assert!(!response.is_partial());
        prop_assert!(response.results.iter().all(|r| r.exact_distance >= 0.0));
        for pair in response.results.windows(2) {
            prop_assert!(pair[0].exact_distance <= pair[1].exact_distance);
        }
        let mut ids = response.ids();
        ids.sort_unstable();
        ids.dedup();
        prop_assert_eq!(ids.len(), response.results.len());
    }

    #[test]
    fn stored_vector_finds_itself_when_corpus_fits_codebook(
        (n, m, dsub, nbits, seed) in arb_layout(),
        pick in any::<usize>(),
    ) {
        // n <= K: every vector is reproduced exactly by its code.
        let nbits = nbits.max(6);
        let vectors = random_corpus(n, m * dsub, seed);
        let mut store = MemoryStore::from_vectors(&vectors, true).unwrap();
        let (codebook, _) = build_index(&vectors, &config(m, nbits, 5, 1), &mut store).unwrap();
        let engine = SearchEngine::new(Arc::new(codebook), store);

        let target = &vectors[pick % n];
        let response = engine.search(&target.embedding.view(), 5, 1).unwrap();
        prop_assert_eq!(response.results[0].id, target.id);
        prop_assert_eq!(response.results[0].approx_distance, 0.0);
        prop_assert_eq!(response.results[0].exact_distance, 0.0);
    }

    #[test]
    fn sharded_scoring_matches_single_pass(
        (n, m, dsub, nbits, seed) in arb_layout(),
        num_shards in 2usize..7,
        post_verification_k in 1usize..12,
    ) {
        let vectors = random_corpus(n, m * dsub, seed);
        let mut store = MemoryStore::from_vectors(&vectors, true).unwrap();
        let (codebook, _) =
            build_index(&vectors, &config(m, nbits, post_verification_k, 1), &mut store).unwrap();
        let codebook = Arc::new(codebook);

        let single = SearchEngine::new(Arc::clone(&codebook), store.clone());
        let sharded = SearchEngine::new(codebook, store).with_num_shards(num_shards);

        let query = &vectors[0].embedding * 0.5;
        let final_k = post_verification_k;
        prop_assert_eq!(
            single.search(&query.view(), post_verification_k, final_k).unwrap(),
            sharded.search(&query.view(), post_verification_k, final_k).unwrap()
        );
    }

    #[test]
    fn bounded_top_n_keeps_first_seen_of_equal_distances(
        distances in prop::collection::vec(0u8..6, 0..60),
        n in 1usize..10,
    ) {
        let mut top = BoundedTopN::new(n);
        for (position, &d) in distances.iter().enumerate() {
            top.push(Candidate {
                id: position as i64,
                word: String::new(),
                sense_id: 0,
                approx_distance: f32::from(d),
                position: position as u64,
            });
        }

        let mut expected: Vec<(u8, usize)> =
            distances.iter().enumerate().map(|(p, &d)| (d, p)).collect();
        expected.sort();
        expected.truncate(n);

        let kept: Vec<(u8, usize)> = top
            .into_sorted_vec()
            .iter()
            .map(|c| (c.approx_distance as u8, c.position as usize))
            .collect();
        prop_assert_eq!(kept, expected);
    }
}
