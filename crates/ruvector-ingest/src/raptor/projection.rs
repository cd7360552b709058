//! Neighbourhood-graph projection of embeddings to a few dimensions
//!
//! A fuzzy k-nearest-neighbour graph under cosine distance is laid out with
//! attractive/repulsive SGD, the way UMAP does it. Seeded, so the same input
//! always lands in the same place.

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const N_EPOCHS: usize = 200;
const NEGATIVE_SAMPLES: usize = 5;
const LEARNING_RATE: f64 = 1.0;
const GRAD_CLIP: f64 = 4.0;
/// Curve parameters for `min_dist = 0.1`, `spread = 1.0`
const CURVE_A: f64 = 1.577;
const CURVE_B: f64 = 0.895;

/// Projection settings
#[derive(Debug, Clone, Copy)]
pub struct Projection {
    pub n_neighbors: usize,
    pub n_components: usize,
    pub seed: u64,
}

impl Projection {
    /// Settings used for one RAPTOR layer of `n` items
    pub fn for_layer(n: usize, seed: u64) -> Self {
        let n_neighbors = ((n.saturating_sub(1)) as f64).powf(0.8) as usize;
        Self {
            n_neighbors: n_neighbors.max(2),
            n_components: n.saturating_sub(2).clamp(1, 12),
            seed,
        }
    }

    /// Project the rows of `vectors`
    pub fn fit_transform(&self, vectors: &[Vec<f32>]) -> Array2<f64> {
        let n = vectors.len();
        let dim = self.n_components.max(1);
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut embedding =
            Array2::<f64>::from_shape_fn((n, dim), |_| rng.gen_range(-10.0..10.0));
        if n < 2 {
            return embedding;
        }

        let edges = fuzzy_graph(vectors, self.n_neighbors.min(n - 1));
        let max_weight = edges.iter().map(|e| e.2).fold(0.0f64, f64::max).max(f64::MIN_POSITIVE);

        for epoch in 0..N_EPOCHS {
            let alpha = LEARNING_RATE * (1.0 - epoch as f64 / N_EPOCHS as f64);
            for &(i, j, weight) in &edges {
                // Edges are sampled in proportion to their membership strength
                if rng.gen::<f64>() > weight / max_weight {
                    continue;
                }

                let dist_sq = squared_distance(&embedding, i, j);
                if dist_sq > 0.0 {
                    let coeff = -2.0 * CURVE_A * CURVE_B * dist_sq.powf(CURVE_B - 1.0)
                        / (CURVE_A * dist_sq.powf(CURVE_B) + 1.0);
                    for d in 0..dim {
                        let grad = (coeff * (embedding[[i, d]] - embedding[[j, d]]))
                            .clamp(-GRAD_CLIP, GRAD_CLIP);
                        embedding[[i, d]] += grad * alpha;
                        embedding[[j, d]] -= grad * alpha;
                    }
                }

                for _ in 0..NEGATIVE_SAMPLES {
                    let k = rng.gen_range(0..n);
                    if k == i {
                        continue;
                    }
                    let dist_sq = squared_distance(&embedding, i, k);
                    let coeff = 2.0 * CURVE_B
                        / ((0.001 + dist_sq) * (CURVE_A * dist_sq.powf(CURVE_B) + 1.0));
                    for d in 0..dim {
                        let grad = if coeff > 0.0 {
                            (coeff * (embedding[[i, d]] - embedding[[k, d]])).clamp(-GRAD_CLIP, GRAD_CLIP)
                        } else {
                            GRAD_CLIP
                        };
                        embedding[[i, d]] += grad * alpha;
                    }
                }
            }
        }
        embedding
    }
}

fn cosine_distance(a: &[f32], b: &[f32]) -> f64 {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| *x as f64 * *y as f64).sum();
    let na: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let nb: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 1.0;
    }
    (1.0 - dot / (na * nb)).max(0.0)
}

fn squared_distance(embedding: &Array2<f64>, a: usize, b: usize) -> f64 {
    embedding
        .row(a)
        .iter()
        .zip(embedding.row(b).iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum()
}

/// Symmetrized fuzzy kNN graph as `(i, j, weight)` edges with `i < j`
fn fuzzy_graph(vectors: &[Vec<f32>], k: usize) -> Vec<(usize, usize, f64)> {
    let n = vectors.len();
    let mut weights = vec![vec![0.0f64; n]; n];
    let target = (k as f64).log2().max(f64::MIN_POSITIVE);

    for i in 0..n {
        let mut neighbours: Vec<(usize, f64)> = (0..n)
            .filter(|&j| j != i)
            .map(|j| (j, cosine_distance(&vectors[i], &vectors[j])))
            .collect();
        neighbours.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        neighbours.truncate(k);

        let rho = neighbours
            .iter()
            .map(|(_, d)| *d)
            .find(|d| *d > 0.0)
            .unwrap_or(0.0);
        let sigma = smooth_sigma(&neighbours, rho, target);
        for (j, d) in neighbours {
            weights[i][j] = (-((d - rho).max(0.0)) / sigma).exp();
        }
    }

    let mut edges = Vec::new();
    for i in 0..n {
        for j in (i + 1)..n {
            let (a, b) = (weights[i][j], weights[j][i]);
            let w = a + b - a * b;
            if w > 0.0 {
                edges.push((i, j, w));
            }
        }
    }
    edges
}

/// Binary search for the bandwidth whose memberships sum to `log2(k)`
fn smooth_sigma(neighbours: &[(usize, f64)], rho: f64, target: f64) -> f64 {
    let (mut lo, mut hi, mut mid) = (0.0f64, f64::INFINITY, 1.0f64);
    for _ in 0..64 {
        let total: f64 = neighbours
            .iter()
            .map(|(_, d)| (-((d - rho).max(0.0)) / mid).exp())
            .sum();
        if (total - target).abs() < 1e-5 {
            break;
        }
        if total > target {
            hi = mid;
            mid = (lo + hi) / 2.0;
        } else {
            lo = mid;
            mid = if hi.is_infinite() { mid * 2.0 } else { (lo + hi) / 2.0 };
        }
    }
    mid.max(1e-3)
}
