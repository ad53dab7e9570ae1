//! Codebook training: per-subspace Lloyd clustering.
//!
//! Each of the M subspaces is clustered independently, so training fans out
//! over a rayon pool and joins before the [`Codebook`] is assembled. Training
//! sets smaller than the number of centroids are padded with noisy copies of
//! existing points (see [`augment_training_set`]); this is logged and never
//! surfaced as a failure.

use std::time::Instant;

use ndarray::{s, Array2, Array3, ArrayView1, ArrayView2, Axis};
use ndarray_rand::rand_distr::StandardNormal;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;

use crate::codec::Codebook;
use crate::config::{check_subspace_split, TrainConfig, MAX_NBITS};
use crate::error::{Error, Result};
use crate::utils::squared_l2;

/// Index and squared distance of the centroid nearest to `point`.
///
/// Ties go to the smallest centroid index.
#[inline]
pub fn nearest_centroid(point: &ArrayView1<f32>, centroids: &ArrayView2<f32>) -> (usize, f32) {
    let mut best_idx = 0;
    let mut best_dist = f32::INFINITY;

    for (idx, centroid) in centroids.outer_iter().enumerate() {
        let dist = squared_l2(point, &centroid);
        if dist < best_dist {
            best_dist = dist;
            best_idx = idx;
        }
    }

    (best_idx, best_dist)
}

/// Cluster `data` (`[N, dim]`, N >= k) into `k` centroids with Lloyd iterations.
///
/// Initial centroids are the first `k` rows of a seeded shuffle. Iteration
/// stops once assignments no longer change or after `max_iters` rounds.
/// A cluster that loses all its points keeps its previous centroid.
pub fn lloyd(
    data: &ArrayView2<f32>,
    k: usize,
    max_iters: usize,
    seed: u64,
) -> Result<Array2<f32>> {
    let n = data.nrows();
    if k == 0 || n < k {
        return Err(Error::Config(format!(
            "Cannot compute {} centroids from {} points",
            k, n
        )));
    }

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut order: Vec<usize> = (0..n).collect();
    order.shuffle(&mut rng);
    let mut centroids = data.select(Axis(0), &order[..k]);

    let mut assignments: Vec<usize> = Vec::new();
    for iteration in 0..max_iters {
        let next: Vec<usize> = data
            .outer_iter()
            .into_par_iter()
            .map(|row| nearest_centroid(&row, &centroids.view()).0)
            .collect();

        if next == assignments {
            tracing::trace!(iteration, "kmeans.converged");
            break;
        }
        assignments = next;
        update_centroids(&mut centroids, data, &assignments);
    }

    Ok(centroids)
}

/// Recompute every non-empty centroid as the mean of its assigned points.
fn update_centroids(centroids: &mut Array2<f32>, data: &ArrayView2<f32>, assignments: &[usize]) {
    let (k, dim) = centroids.dim();
    let mut sums = Array2::<f64>::zeros((k, dim));
    let mut counts = vec![0usize; k];

    for (row, &c) in data.outer_iter().zip(assignments) {
        counts[c] += 1;
        sums.row_mut(c)
            .zip_mut_with(&row, |acc, &x| *acc += f64::from(x));
    }

    for (c, &count) in counts.iter().enumerate() {
        if count == 0 {
            continue;
        }
        let denom = count as f64;
        centroids
            .row_mut(c)
            .zip_mut_with(&sums.row(c), |dst, &sum| *dst = (sum / denom) as f32);
    }
}

/// Pad a training set with noisy duplicates until it holds `target` rows.
///
/// The original rows are kept verbatim. Row `i >= n` copies row `i % n` plus
/// zero-mean Gaussian noise whose standard deviation in dimension `d` is
/// `noise_fraction * std_d`, where `std_d` is the population standard
/// deviation of that dimension (1.0 when the dimension is constant). Noise is
/// drawn row-major from `ChaCha8Rng::seed_from_u64(seed)`.
pub fn augment_training_set(
    data: &ArrayView2<f32>,
    target: usize,
    noise_fraction: f32,
    seed: u64,
) -> Array2<f32> {
    let n = data.nrows();
    if n == 0 || n >= target {
        return data.to_owned();
    }

    let spread = data
        .std_axis(Axis(0), 0.0)
        .mapv(|std| if std > 0.0 { std } else { 1.0 });
    let scale = spread * noise_fraction;

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut augmented = Array2::<f32>::zeros((target, data.ncols()));
    augmented.slice_mut(s![..n, ..]).assign(data);

    for i in n..target {
        let source = data.row(i % n);
        let mut row = augmented.row_mut(i);
        for ((dst, &x), &sigma) in row.iter_mut().zip(source.iter()).zip(scale.iter()) {
            let z: f32 = rng.sample(StandardNormal);
            *dst = x + z * sigma;
        }
    }

    augmented
}

/// Train a product-quantization codebook.
///
/// # Arguments
///
/// * `corpus` - Training vectors, shape `[N, dim]`
/// * `m_subspaces` - Number of subspaces; `dim` must be divisible by it
/// * `nbits` - Each subspace gets `2^nbits` centroids
/// * `config` - Training parameters
///
/// # Returns
///
/// A codebook with exactly `m_subspaces` subspaces of `2^nbits` centroids.
pub fn train_codebook(
    corpus: &ArrayView2<f32>,
    m_subspaces: usize,
    nbits: usize,
    config: &TrainConfig,
) -> Result<Codebook> {
    let dim = corpus.ncols();
    check_subspace_split(dim, m_subspaces)?;
    if nbits == 0 || nbits > MAX_NBITS {
        return Err(Error::Config(format!(
            "nbits must be in 1..={}, got {}",
            MAX_NBITS, nbits
        )));
    }
    if config.train_size == Some(0) {
        return Err(Error::Config("train_size must be > 0".into()));
    }
    if corpus.nrows() == 0 {
        return Err(Error::Config("Training corpus is empty".into()));
    }

    let start = Instant::now();
    let k = 1usize << nbits;
    let dsub = dim / m_subspaces;

    let n_train = config
        .train_size
        .map_or(corpus.nrows(), |size| size.min(corpus.nrows()));
    let train = corpus.slice(s![..n_train, ..]);

    let augmented;
    let train = if n_train < k {
        let target = k
            .checked_mul(config.augment_multiple.max(1))
            .ok_or_else(|| {
                Error::Config(format!(
                    "augment_multiple {} overflows the training set size for {} centroids",
                    config.augment_multiple, k
                ))
            })?;
        tracing::warn!(
            train_vectors = n_train,
            centroids = k,
            target,
            "pq.train.augment"
        );
        augmented = augment_training_set(&train, target, config.noise_fraction, config.seed);
        augmented.view()
    } else {
        train
    };

    tracing::info!(
        dim,
        m_subspaces,
        nbits,
        train_vectors = train.nrows(),
        "pq.train.start"
    );

    let subspace_centroids: Vec<Array2<f32>> = (0..m_subspaces)
        .into_par_iter()
        .map(|j| {
            let slice = train.slice(s![.., j * dsub..(j + 1) * dsub]);
            lloyd(
                &slice,
                k,
                config.kmeans_niters,
                config.seed.wrapping_add(j as u64),
            )
        })
        .collect::<Result<_>>()?;

    let mut centroids = Array3::<f32>::zeros((m_subspaces, k, dsub));
    for (j, subspace) in subspace_centroids.iter().enumerate() {
        centroids.slice_mut(s![j, .., ..]).assign(subspace);
    }

    tracing::info!(
        elapsed_ms = start.elapsed().as_millis() as u64,
        table_rows = m_subspaces * k,
        "pq.train.complete"
    );

    Codebook::from_centroids(nbits, centroids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;

    #[test]
    fn test_nearest_centroid_tie_break() {
        let centroids = array![[1.0f32, 0.0], [-1.0, 0.0], [0.0, 5.0]];
        let (idx, dist) = nearest_centroid(&array![0.0f32, 0.0].view(), &centroids.view());
        assert_eq!(idx, 0);
        assert_eq!(dist, 1.0);
    }

    #[test]
    fn test_lloyd_separates_clusters() {
        let data = array![
            [0.0f32, 0.0],
            [0.1, 0.0],
            [0.0, 0.1],
            [10.0, 10.0],
            [10.1, 10.0],
            [10.0, 10.1],
        ];
        let centroids = lloyd(&data.view(), 2, 20, 7).unwrap();
        assert_eq!(centroids.dim(), (2, 2));

        let (a, _) = nearest_centroid(&data.row(0), &centroids.view());
        let (b, _) = nearest_centroid(&data.row(3), &centroids.view());
        assert_ne!(a, b);
        for row in 0..3 {
            assert_eq!(nearest_centroid(&data.row(row), &centroids.view()).0, a);
            assert_eq!(nearest_centroid(&data.row(row + 3), &centroids.view()).0, b);
        }
    }

    #[test]
    fn test_lloyd_with_k_equal_to_n_reproduces_points() {
        let data = array![[1.0f32, 2.0], [3.0, 4.0], [5.0, 6.0]];
        let centroids = lloyd(&data.view(), 3, 10, 1).unwrap();
        for row in data.outer_iter() {
            let (_, dist) = nearest_centroid(&row, &centroids.view());
            assert_eq!(dist, 0.0);
        }
    }

    #[test]
    fn test_lloyd_rejects_too_few_points() {
        let data = array![[1.0f32], [2.0]];
        assert!(matches!(lloyd(&data.view(), 3, 10, 1), Err(Error::Config(_))));
    }

    #[test]
    fn test_lloyd_handles_duplicate_points() {
        let data = array![[1.0f32], [1.0], [1.0], [2.0]];
        let centroids = lloyd(&data.view(), 3, 10, 3).unwrap();
        assert_eq!(centroids.nrows(), 3);
        assert!(centroids.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_augment_keeps_originals_and_reaches_target() {
        let data: Array2<f32> = Array2::random((5, 4), Uniform::new(-1.0f32, 1.0));
        let augmented = augment_training_set(&data.view(), 16, 0.001, 42);

        assert_eq!(augmented.dim(), (16, 4));
        assert_eq!(augmented.slice(s![..5, ..]), data);
        for i in 5..16 {
            let source = data.row(i % 5);
            let dist = squared_l2(&augmented.row(i), &source);
            assert!(dist > 0.0, "duplicate {} should be perturbed", i);
            assert!(dist < 1e-3, "duplicate {} drifted too far: {}", i, dist);
        }
    }

    #[test]
    fn test_augment_is_deterministic() {
        let data: Array2<f32> = Array2::random((3, 6), Uniform::new(-1.0f32, 1.0));
        let a = augment_training_set(&data.view(), 10, 0.01, 9);
        let b = augment_training_set(&data.view(), 10, 0.01, 9);
        assert_eq!(a, b);
    }

    #[test]
    fn test_augment_perturbs_constant_dimensions() {
        let data = array![[1.0f32, 0.5], [2.0, 0.5]];
        let augmented = augment_training_set(&data.view(), 4, 0.01, 3);
        assert_ne!(augmented[[2, 1]], 0.5);
        assert_ne!(augmented[[3, 1]], 0.5);
    }

    #[test]
    fn test_train_codebook_shape() {
        let data: Array2<f32> = Array2::random((300, 16), Uniform::new(-1.0f32, 1.0));
        let config = TrainConfig {
            kmeans_niters: 5,
            ..Default::default()
        };
        let codebook = train_codebook(&data.view(), 4, 4, &config).unwrap();

        assert_eq!(codebook.num_subspaces(), 4);
        assert_eq!(codebook.num_centroids(), 16);
        assert_eq!(codebook.subspace_dim(), 4);
    }

    #[test]
    fn test_train_codebook_augments_small_corpus() {
        let data: Array2<f32> = Array2::random((10, 8), Uniform::new(-1.0f32, 1.0));
        let codebook = train_codebook(&data.view(), 2, 5, &TrainConfig::default()).unwrap();
        assert_eq!(codebook.num_centroids(), 32);
        assert_eq!(codebook.num_table_rows(), 64);
    }

    #[test]
    fn test_train_codebook_respects_train_size() {
        let mut data = Array2::<f32>::zeros((40, 4));
        // Rows past train_size are far away and must not influence the centroids.
        data.slice_mut(s![20.., ..]).fill(1000.0);
        for i in 0..20 {
            data[[i, 0]] = i as f32 * 0.01;
        }

        let config = TrainConfig {
            train_size: Some(20),
            ..Default::default()
        };
        let codebook = train_codebook(&data.view(), 2, 2, &config).unwrap();
        assert!(codebook.centroids().iter().all(|&v| v < 10.0));
    }

    #[test]
    fn test_train_codebook_is_deterministic() {
        let data: Array2<f32> = Array2::random((64, 12), Uniform::new(-1.0f32, 1.0));
        let config = TrainConfig::default();
        let a = train_codebook(&data.view(), 3, 3, &config).unwrap();
        let b = train_codebook(&data.view(), 3, 3, &config).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_train_codebook_rejects_indivisible_dimension() {
        let data: Array2<f32> = Array2::random((64, 10), Uniform::new(-1.0f32, 1.0));
        assert!(matches!(
            train_codebook(&data.view(), 3, 3, &TrainConfig::default()),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_train_codebook_rejects_overflowing_augmentation() {
        let data: Array2<f32> = Array2::random((10, 8), Uniform::new(-1.0f32, 1.0));
        let config = TrainConfig {
            augment_multiple: usize::MAX / 2 + 1,
            ..Default::default()
        };
        assert!(matches!(
            train_codebook(&data.view(), 2, 4, &config),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_train_codebook_rejects_empty_corpus() {
        let data = Array2::<f32>::zeros((0, 8));
        assert!(matches!(
            train_codebook(&data.view(), 2, 2, &TrainConfig::default()),
            Err(Error::Config(_))
        ));
    }
}
