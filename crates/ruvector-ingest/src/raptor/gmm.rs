//! Diagonal-covariance Gaussian mixture fitted with EM

use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{Error, Result};

const MAX_ITER: usize = 100;
const TOLERANCE: f64 = 1e-3;
const REG_COVAR: f64 = 1e-6;

/// Fitted mixture model
#[derive(Debug, Clone)]
pub struct GaussianMixture {
    weights: Array1<f64>,
    means: Array2<f64>,
    variances: Array2<f64>,
}

impl GaussianMixture {
    /// Fit `k` components to the rows of `data`
    pub fn fit(data: &Array2<f64>, k: usize, seed: u64) -> Result<Self> {
        let (n, d) = data.dim();
        if k == 0 || n < k {
            return Err(Error::internal(format!(
                "Cannot fit {} components to {} samples",
                k, n
            )));
        }

        // Seeded first mean, then farthest-point picks; variances start global
        let mut rng = StdRng::seed_from_u64(seed);
        let first = rng.gen_range(0..n);
        let mut chosen = vec![first];
        let mut nearest: Vec<f64> = (0..n).map(|i| squared_distance(data, i, first)).collect();
        while chosen.len() < k {
            let next = (0..n)
                .filter(|i| !chosen.contains(i))
                .fold(None, |best: Option<usize>, i| match best {
                    Some(b) if nearest[b] >= nearest[i] => Some(b),
                    _ => Some(i),
                })
                .unwrap_or(first);
            chosen.push(next);
            for (i, dist) in nearest.iter_mut().enumerate() {
                *dist = dist.min(squared_distance(data, i, next));
            }
        }
        let mut means = Array2::<f64>::zeros((k, d));
        for (c, &row) in chosen.iter().enumerate() {
            means.row_mut(c).assign(&data.row(row));
        }
        let global = data.var_axis(Axis(0), 0.0).mapv(|v| v + REG_COVAR);
        let mut variances = Array2::<f64>::zeros((k, d));
        for mut row in variances.rows_mut() {
            row.assign(&global);
        }

        let mut model = Self {
            weights: Array1::from_elem(k, 1.0 / k as f64),
            means,
            variances,
        };

        let mut previous = f64::NEG_INFINITY;
        for _ in 0..MAX_ITER {
            let (resp, log_likelihood) = model.e_step(data);
            model.m_step(data, &resp);
            let mean_ll = log_likelihood / n as f64;
            if (mean_ll - previous).abs() < TOLERANCE {
                break;
            }
            previous = mean_ll;
        }
        Ok(model)
    }

    pub fn n_components(&self) -> usize {
        self.weights.len()
    }

    /// `log(w_c) + log N(x | c)` for every sample and component
    fn weighted_log_prob(&self, data: &Array2<f64>) -> Array2<f64> {
        let n = data.nrows();
        let k = self.n_components();
        let mut out = Array2::<f64>::zeros((n, k));
        for c in 0..k {
            let mean = self.means.row(c);
            let var = self.variances.row(c);
            let log_det: f64 = var.iter().map(|v| (2.0 * std::f64::consts::PI * v).ln()).sum();
            let log_weight = self.weights[c].max(f64::MIN_POSITIVE).ln();
            for (i, x) in data.rows().into_iter().enumerate() {
                let mahalanobis = mahalanobis_diag(x, mean, var);
                out[[i, c]] = log_weight - 0.5 * (log_det + mahalanobis);
            }
        }
        out
    }

    /// Responsibilities and total log-likelihood
    fn e_step(&self, data: &Array2<f64>) -> (Array2<f64>, f64) {
        let mut log_prob = self.weighted_log_prob(data);
        let mut total = 0.0;
        for mut row in log_prob.rows_mut() {
            let norm = log_sum_exp(row.view());
            total += norm;
            row.mapv_inplace(|v| (v - norm).exp());
        }
        (log_prob, total)
    }

    fn m_step(&mut self, data: &Array2<f64>, resp: &Array2<f64>) {
        let n = data.nrows() as f64;
        let counts = resp.sum_axis(Axis(0)).mapv(|v| v + 10.0 * f64::EPSILON);
        self.weights = &counts / n;

        for c in 0..self.n_components() {
            let r = resp.column(c);
            let mut mean = Array1::<f64>::zeros(data.ncols());
            for (x, &w) in data.rows().into_iter().zip(r.iter()) {
                mean.scaled_add(w, &x);
            }
            mean /= counts[c];

            let mut var = Array1::<f64>::zeros(data.ncols());
            for (x, &w) in data.rows().into_iter().zip(r.iter()) {
                let diff = &x - &mean;
                var.scaled_add(w, &(&diff * &diff));
            }
            var /= counts[c];
            var.mapv_inplace(|v| v + REG_COVAR);

            self.means.row_mut(c).assign(&mean);
            self.variances.row_mut(c).assign(&var);
        }
    }

    /// Posterior probability of each component per sample
    pub fn predict_proba(&self, data: &Array2<f64>) -> Array2<f64> {
        self.e_step(data).0
    }

    /// Total log-likelihood of `data`
    pub fn score(&self, data: &Array2<f64>) -> f64 {
        self.e_step(data).1
    }

    /// Bayesian information criterion; lower is better
    pub fn bic(&self, data: &Array2<f64>) -> f64 {
        let (n, d) = data.dim();
        let k = self.n_components();
        let free_params = (2 * k * d + k - 1) as f64;
        -2.0 * self.score(data) + free_params * (n as f64).ln()
    }
}

fn squared_distance(data: &Array2<f64>, a: usize, b: usize) -> f64 {
    data.row(a)
        .iter()
        .zip(data.row(b).iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum()
}

fn mahalanobis_diag(x: ArrayView1<f64>, mean: ArrayView1<f64>, var: ArrayView1<f64>) -> f64 {
    x.iter()
        .zip(mean.iter())
        .zip(var.iter())
        .map(|((x, m), v)| (x - m).powi(2) / v)
        .sum()
}

fn log_sum_exp(row: ArrayView1<f64>) -> f64 {
    let max = row.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + row.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

/// Component count in `1..max_clusters` with the lowest BIC; 1 when the range is empty
pub fn optimal_clusters(data: &Array2<f64>, max_clusters: usize, seed: u64) -> usize {
    let limit = max_clusters.min(data.nrows());
    let mut best: Option<(usize, f64)> = None;
    for k in 1..limit {
        match GaussianMixture::fit(data, k, seed) {
            Ok(model) => {
                let bic = model.bic(data);
                if best.map_or(true, |(_, b)| bic < b) {
                    best = Some((k, bic));
                }
            }
            Err(e) => tracing::debug!("Skipping {} components: {}", k, e),
        }
    }
    best.map(|(k, _)| k).unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn two_blobs() -> Array2<f64> {
        array![
            [0.0, 0.1],
            [0.1, 0.0],
            [0.05, 0.05],
            [0.12, 0.08],
            [10.0, 10.1],
            [10.1, 10.0],
            [10.05, 9.95],
            [9.9, 10.05],
        ]
    }

    #[test]
    fn test_separates_two_blobs() {
        let data = two_blobs();
        let model = GaussianMixture::fit(&data, 2, 7).unwrap();
        let probs = model.predict_proba(&data);
        let label = |i: usize| if probs[[i, 0]] > 0.5 { 0 } else { 1 };
        assert!((0..4).all(|i| label(i) == label(0)));
        assert!((4..8).all(|i| label(i) == label(4)));
        assert_ne!(label(0), label(4));
    }

    #[test]
    fn test_probabilities_sum_to_one() {
        let data = two_blobs();
        let probs = GaussianMixture::fit(&data, 3, 1).unwrap().predict_proba(&data);
        for row in probs.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_bic_prefers_two_components() {
        assert_eq!(optimal_clusters(&two_blobs(), 3, 3), 2);
    }

    #[test]
    fn test_empty_range_gives_one() {
        let data = array![[0.0], [1.0]];
        assert_eq!(optimal_clusters(&data, 1, 0), 1);
    }

    #[test]
    fn test_deterministic_for_seed() {
        let data = two_blobs();
        let a = GaussianMixture::fit(&data, 2, 42).unwrap().predict_proba(&data);
        let b = GaussianMixture::fit(&data, 2, 42).unwrap().predict_proba(&data);
        assert_eq!(a, b);
    }
}
