// ========================================================================================
//                      EM Sufficient-Statistics Accumulator
// ========================================================================================
//
// The mutable reduction target for Gaussian-mixture EM: per-component soft counts,
// weighted mean contributions, weighted second moments, and the batch log-likelihood.
// Partial accumulators are produced by independent workers over disjoint slices of
// the data and merged pairwise; the merge is associative and commutative, so any
// grouping or order of merges (sequential fold, tree reduction, whatever shape the
// engine's shuffle produces) yields the same totals. That equivalence is the
// correctness property a distributed reduction depends on, and the property the
// tests pin down.

use crate::operator::OperatorError;
use ndarray::{Array1, Array2};
use rayon::prelude::*;

/// Sufficient statistics for a `k`-component Gaussian mixture over `dim`-dimensional
/// data. Sizing is fixed at construction; row `i` of every per-component container
/// always corresponds to mixture component `i`.
#[derive(Debug, Clone, PartialEq)]
pub struct GmmStatistics {
    k: usize,
    dim: usize,
    log_likelihood: f64,
    sum_weights: Array1<f64>,
    sum_means: Array2<f64>,
    sum_covars: Array2<f64>,
}

impl GmmStatistics {
    /// The reduction's zero element for a `(k, dim)` model: every field empty, ready
    /// to absorb observations or partial accumulators.
    pub fn zero(k: usize, dim: usize) -> Self {
        Self {
            k,
            dim,
            log_likelihood: 0.0,
            sum_weights: Array1::zeros(k),
            sum_means: Array2::zeros((k, dim)),
            sum_covars: Array2::zeros((k, dim * dim)),
        }
    }

    #[inline]
    pub fn k(&self) -> usize {
        self.k
    }

    #[inline]
    pub fn dim(&self) -> usize {
        self.dim
    }

    #[inline]
    pub fn log_likelihood(&self) -> f64 {
        self.log_likelihood
    }

    #[inline]
    pub fn sum_weights(&self) -> &Array1<f64> {
        &self.sum_weights
    }

    /// Per-component weighted mean contributions, one `dim`-vector per row.
    #[inline]
    pub fn sum_means(&self) -> &Array2<f64> {
        &self.sum_means
    }

    /// Per-component weighted second moments, one flattened `dim x dim` outer
    /// product per row.
    #[inline]
    pub fn sum_covars(&self) -> &Array2<f64> {
        &self.sum_covars
    }

    /// Folds one data point's soft assignment into the statistics: for each
    /// component `i`, `sum_weights[i] += r_i`, `sum_means[i] += r_i * x`,
    /// `sum_covars[i] += r_i * x xᵀ`; the point's log-density joins the running
    /// log-likelihood.
    pub fn observe(
        &mut self,
        x: &[f64],
        responsibilities: &[f64],
        log_density: f64,
    ) -> Result<(), OperatorError> {
        if x.len() != self.dim {
            return Err(OperatorError::ObservationDimensionMismatch {
                expected: self.dim,
                actual: x.len(),
            });
        }
        if responsibilities.len() != self.k {
            return Err(OperatorError::ObservationDimensionMismatch {
                expected: self.k,
                actual: responsibilities.len(),
            });
        }

        for (i, &r) in responsibilities.iter().enumerate() {
            self.sum_weights[i] += r;
            for (p, &xp) in x.iter().enumerate() {
                self.sum_means[[i, p]] += r * xp;
                for (q, &xq) in x.iter().enumerate() {
                    self.sum_covars[[i, p * self.dim + q]] += r * xp * xq;
                }
            }
        }
        self.log_likelihood += log_density;
        Ok(())
    }

    /// Merges two partial accumulators: every field becomes the elementwise sum of
    /// the inputs' corresponding fields, and the log-likelihoods add. Merging
    /// accumulators built against different `(k, dim)` is a fatal configuration
    /// error; callers guarantee consistent sizing across all partials feeding one
    /// reduction.
    pub fn merge(mut self, other: GmmStatistics) -> Result<GmmStatistics, OperatorError> {
        if self.k != other.k || self.dim != other.dim {
            return Err(OperatorError::StatisticsConfigMismatch {
                left_k: self.k,
                left_dim: self.dim,
                right_k: other.k,
                right_dim: other.dim,
            });
        }
        self.log_likelihood += other.log_likelihood;
        self.sum_weights += &other.sum_weights;
        self.sum_means += &other.sum_means;
        self.sum_covars += &other.sum_covars;
        Ok(self)
    }
}

/// Sequentially folds a stream of partial accumulators from the `(k, dim)` zero
/// element.
pub fn merge_partials(
    k: usize,
    dim: usize,
    partials: impl IntoIterator<Item = GmmStatistics>,
) -> Result<GmmStatistics, OperatorError> {
    partials
        .into_iter()
        .try_fold(GmmStatistics::zero(k, dim), GmmStatistics::merge)
}

/// Tree-reduces partial accumulators in parallel. By the associativity and
/// commutativity of [`GmmStatistics::merge`], the result equals the sequential
/// fold regardless of how rayon splits the work.
pub fn par_merge_partials(
    k: usize,
    dim: usize,
    partials: Vec<GmmStatistics>,
) -> Result<GmmStatistics, OperatorError> {
    partials
        .into_par_iter()
        .map(Ok)
        .try_reduce(|| GmmStatistics::zero(k, dim), GmmStatistics::merge)
}
