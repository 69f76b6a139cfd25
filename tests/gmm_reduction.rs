// Distributed-style EM reduction: independent workers accumulate sufficient
// statistics over disjoint slices of a sampled dataset, and every way of merging
// the partials (sequential, reversed, lopsided tree, rayon) must land on the
// same totals. The merged totals are also checked against a single-pass
// whole-dataset accumulation, which is what the grouping invariance is for.

use approx::assert_abs_diff_eq;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use tessera::aggregate::{GmmStatistics, merge_partials, par_merge_partials};

const K: usize = 2;
const DIM: usize = 2;

/// Isotropic two-component model used to produce responsibilities and per-point
/// log-densities for the test data.
struct ToyModel {
    means: [[f64; DIM]; K],
    weights: [f64; K],
}

impl ToyModel {
    fn responsibilities(&self, x: &[f64]) -> ([f64; K], f64) {
        let mut densities = [0.0; K];
        for (i, mean) in self.means.iter().enumerate() {
            let sq_dist: f64 = x
                .iter()
                .zip(mean)
                .map(|(xv, mv)| (xv - mv) * (xv - mv))
                .sum();
            densities[i] = self.weights[i] * (-0.5 * sq_dist).exp()
                / (2.0 * std::f64::consts::PI);
        }
        let total: f64 = densities.iter().sum();
        let mut resp = [0.0; K];
        for i in 0..K {
            resp[i] = densities[i] / total;
        }
        (resp, total.ln())
    }
}

fn sample_dataset(n: usize) -> Vec<Vec<f64>> {
    let mut rng = StdRng::seed_from_u64(29);
    let lo = Normal::new(-2.0, 0.8).unwrap();
    let hi = Normal::new(3.0, 1.2).unwrap();
    (0..n)
        .map(|i| {
            let dist = if i % 2 == 0 { &lo } else { &hi };
            (0..DIM).map(|_| dist.sample(&mut rng)).collect()
        })
        .collect()
}

fn accumulate(model: &ToyModel, points: &[Vec<f64>]) -> GmmStatistics {
    let mut stats = GmmStatistics::zero(K, DIM);
    for x in points {
        let (resp, log_density) = model.responsibilities(x);
        stats.observe(x, &resp, log_density).unwrap();
    }
    stats
}

#[test]
fn partial_merges_agree_across_groupings() {
    let model = ToyModel {
        means: [[-2.0, -2.0], [3.0, 3.0]],
        weights: [0.5, 0.5],
    };
    let points = sample_dataset(200);

    // Eight workers over disjoint slices of the data.
    let partials: Vec<GmmStatistics> =
        points.chunks(25).map(|chunk| accumulate(&model, chunk)).collect();

    let forward = merge_partials(K, DIM, partials.clone()).unwrap();
    let reversed =
        merge_partials(K, DIM, partials.iter().rev().cloned().collect::<Vec<_>>()).unwrap();
    let parallel = par_merge_partials(K, DIM, partials.clone()).unwrap();

    // A lopsided tree: (p0+p1+p2) + ((p3+p4) + (p5+p6+p7)).
    let head = merge_partials(K, DIM, partials[0..3].to_vec()).unwrap();
    let mid = merge_partials(K, DIM, partials[3..5].to_vec()).unwrap();
    let tail = merge_partials(K, DIM, partials[5..8].to_vec()).unwrap();
    let tree = head.merge(mid.merge(tail).unwrap()).unwrap();

    let whole = accumulate(&model, &points);

    for other in [&reversed, &parallel, &tree, &whole] {
        assert_abs_diff_eq!(
            forward.log_likelihood(),
            other.log_likelihood(),
            epsilon = 1e-9
        );
        for i in 0..K {
            assert_abs_diff_eq!(
                forward.sum_weights()[i],
                other.sum_weights()[i],
                epsilon = 1e-9
            );
            for p in 0..DIM {
                assert_abs_diff_eq!(
                    forward.sum_means()[[i, p]],
                    other.sum_means()[[i, p]],
                    epsilon = 1e-9
                );
            }
            for pq in 0..DIM * DIM {
                assert_abs_diff_eq!(
                    forward.sum_covars()[[i, pq]],
                    other.sum_covars()[[i, pq]],
                    epsilon = 1e-9
                );
            }
        }
    }
}

#[test]
fn soft_counts_total_the_number_of_observations() {
    let model = ToyModel {
        means: [[-2.0, -2.0], [3.0, 3.0]],
        weights: [0.4, 0.6],
    };
    let points = sample_dataset(120);
    let partials: Vec<GmmStatistics> =
        points.chunks(30).map(|chunk| accumulate(&model, chunk)).collect();

    let merged = merge_partials(K, DIM, partials).unwrap();

    // Responsibilities are normalized per point, so the soft counts across all
    // components must total exactly one unit of weight per observation.
    let total: f64 = merged.sum_weights().iter().sum();
    assert_abs_diff_eq!(total, points.len() as f64, epsilon = 1e-9);
}

#[test]
fn merging_across_model_sizes_is_rejected() {
    let a = GmmStatistics::zero(K, DIM);
    let b = GmmStatistics::zero(K + 1, DIM);
    assert!(a.merge(b).is_err());

    let c = GmmStatistics::zero(K, DIM);
    let d = GmmStatistics::zero(K, DIM + 2);
    assert!(c.merge(d).is_err());
}
