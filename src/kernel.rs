// ========================================================================================
//
//                      The kernels: pure block-local numerics
//
// ========================================================================================
//
// This module contains the numeric kernels of the operator layer. Every kernel is a
// pure function of its input block(s) and the operator's fixed configuration, holds
// no mutable state, and writes its output tile in a single pass. Kernels that carry
// a dense-algebra inner loop dispatch through an explicit `Backend` selected at
// construction; the cheap scalar-loop kernels have no backend to select.

use crate::operator::{
    AggregateOperator, JoinOperator, MapOperator, OperatorError, require_supported,
};
use crate::types::{Backend, MatrixBlock};
use log::debug;
use ndarray::ArrayView2;

/// Layer normalization over one tile, treating the tile's `rows * cols` values as a
/// single flat sample:
///
/// 1. `mean = sum(v) / n`
/// 2. `var  = sum((v - mean)^2) / n`  (population variance, not sample variance)
/// 3. output `= (v - mean) / sqrt(var)`
///
/// The population-variance divisor is a compatibility requirement and must not be
/// "corrected" to `n - 1`. A constant tile has zero variance; the kernel emits all
/// zeros for it instead of letting the division produce NaN/Inf.
pub struct LayerNorm {
    backend: Backend,
}

impl LayerNorm {
    pub fn new(backend: Backend) -> Result<Self, OperatorError> {
        require_supported(backend)?;
        Ok(Self { backend })
    }

    #[inline]
    pub fn backend(&self) -> Backend {
        self.backend
    }
}

impl MapOperator for LayerNorm {
    fn project(&self, input: &MatrixBlock) -> Result<MatrixBlock, OperatorError> {
        let n = (input.rows() * input.cols()) as f64;
        let sum: f64 = input.values().iter().sum();
        let mean = sum / n;
        let var = input
            .values()
            .iter()
            .map(|v| (v - mean) * (v - mean))
            .sum::<f64>()
            / n;
        let sd = var.sqrt();

        let mut out = MatrixBlock::same_shape_as(input);
        if sd == 0.0 {
            // Zero-variance tile: defined to normalize to zero.
            return Ok(out);
        }
        for (o, v) in out.values_mut().iter_mut().zip(input.values()) {
            *o = (v - mean) / sd;
        }
        Ok(out)
    }
}

/// Residual connection: the elementwise sum of two aligned tiles, both interpreted
/// as dense `(context_size, embed_size)` row-major matrices.
///
/// The model shape is operator configuration, fixed at construction and deliberately
/// independent of the block's own `rows`/`cols` metadata. That decoupling is a real
/// hazard: if the configured shape disagrees with the actual block size, a naive
/// elementwise mapping silently reads the wrong logical region. The kernel therefore
/// proves `context_size * embed_size == rows * cols` on every invocation and fails
/// the whole invocation otherwise.
pub struct ResidualAdd {
    context_size: usize,
    embed_size: usize,
    backend: Backend,
}

impl ResidualAdd {
    pub fn new(
        context_size: usize,
        embed_size: usize,
        backend: Backend,
    ) -> Result<Self, OperatorError> {
        require_supported(backend)?;
        Ok(Self {
            context_size,
            embed_size,
            backend,
        })
    }

    #[inline]
    pub fn backend(&self) -> Backend {
        self.backend
    }

    fn check_configured_shape(&self, block: &MatrixBlock) -> Result<(), OperatorError> {
        if self.context_size * self.embed_size != block.rows() * block.cols() {
            return Err(OperatorError::ConfiguredShapeMismatch {
                context_size: self.context_size,
                embed_size: self.embed_size,
                block_row: block.block_row(),
                block_col: block.block_col(),
                actual: block.rows() * block.cols(),
            });
        }
        Ok(())
    }
}

impl JoinOperator for ResidualAdd {
    fn combine(
        &self,
        left: &MatrixBlock,
        right: &MatrixBlock,
    ) -> Result<MatrixBlock, OperatorError> {
        // Operational tracing of the model shape against the tile actually received.
        debug!(
            "residual add: model shape {}x{}, left block {} ({}x{}), right block {} ({}x{})",
            self.context_size,
            self.embed_size,
            left.coords(),
            left.rows(),
            left.cols(),
            right.coords(),
            right.rows(),
            right.cols(),
        );

        if left.rows() != right.rows() || left.cols() != right.cols() {
            return Err(OperatorError::ShapeMismatch {
                left_rows: left.rows(),
                left_cols: left.cols(),
                right_rows: right.rows(),
                right_cols: right.cols(),
            });
        }
        self.check_configured_shape(left)?;
        self.check_configured_shape(right)?;

        let shape = (self.context_size, self.embed_size);
        let x0 = ArrayView2::from_shape(shape, left.values())
            .expect("configured shape proven equal to block size");
        let x1 = ArrayView2::from_shape(shape, right.values())
            .expect("configured shape proven equal to block size");
        let y0 = &x0 + &x1;

        let mut out = MatrixBlock::same_shape_as(left);
        out.values_mut()
            .copy_from_slice(y0.as_slice().expect("elementwise sum is standard layout"));
        Ok(out)
    }
}

/// The partial product `leftᵀ · right` for one pair of tiles drawn from two matrices
/// partitioned identically along their shared leading (contraction) dimension.
///
/// Tiles match when they sit on the same grid row (the contraction index), and the
/// output tile is rekeyed to `(left.block_col, right.block_col)` within logical totals
/// `(left.total_cols, right.total_cols)`. Summing same-keyed partial products with
/// [`BlockSum`] completes the tiled contraction.
pub struct TransposeMultiply {
    backend: Backend,
}

impl TransposeMultiply {
    pub fn new(backend: Backend) -> Result<Self, OperatorError> {
        require_supported(backend)?;
        Ok(Self { backend })
    }

    #[inline]
    pub fn backend(&self) -> Backend {
        self.backend
    }
}

impl JoinOperator for TransposeMultiply {
    fn matches(&self, left: &MatrixBlock, right: &MatrixBlock) -> bool {
        left.block_row() == right.block_row()
    }

    fn combine(
        &self,
        left: &MatrixBlock,
        right: &MatrixBlock,
    ) -> Result<MatrixBlock, OperatorError> {
        if left.rows() != right.rows() {
            return Err(OperatorError::ShapeMismatch {
                left_rows: left.rows(),
                left_cols: left.cols(),
                right_rows: right.rows(),
                right_cols: right.cols(),
            });
        }

        let product = left.view().t().dot(&right.view());

        let mut out = MatrixBlock::with_totals(
            left.block_col(),
            right.block_col(),
            left.cols(),
            right.cols(),
            left.total_cols(),
            right.total_cols(),
        );
        out.values_mut()
            .copy_from_slice(product.as_slice().expect("matrix product is standard layout"));
        Ok(out)
    }

    fn rekeys(&self) -> bool {
        true
    }
}

/// Elementwise sum of same-keyed blocks: the reduction that folds partial products
/// (or partial row sums) into the completed tile. Associative and commutative.
#[derive(Default)]
pub struct BlockSum;

impl AggregateOperator for BlockSum {
    fn merge(&self, mut acc: MatrixBlock, next: &MatrixBlock) -> Result<MatrixBlock, OperatorError> {
        if acc.rows() != next.rows() || acc.cols() != next.cols() {
            return Err(OperatorError::ShapeMismatch {
                left_rows: acc.rows(),
                left_cols: acc.cols(),
                right_rows: next.rows(),
                right_cols: next.cols(),
            });
        }
        for (a, b) in acc.values_mut().iter_mut().zip(next.values()) {
            *a += b;
        }
        Ok(acc)
    }
}

/// Per-row `Σ exp(v)` over one tile: the first half of a softmax-style row
/// aggregation. The output is a `rows x 1` column tile rekeyed to grid column 0
/// (logical totals `(total_rows, 1)`); partial sums from different column blocks of
/// the same block-row are completed by [`BlockSum`].
#[derive(Default)]
pub struct RowExpSum;

impl MapOperator for RowExpSum {
    fn project(&self, input: &MatrixBlock) -> Result<MatrixBlock, OperatorError> {
        let mut out = MatrixBlock::with_totals(
            input.block_row(),
            0,
            input.rows(),
            1,
            input.total_rows(),
            1,
        );
        for (o, row) in out
            .values_mut()
            .iter_mut()
            .zip(input.values().chunks(input.cols()))
        {
            *o = row.iter().map(|v| v.exp()).sum();
        }
        Ok(out)
    }

    fn rekeys(&self) -> bool {
        true
    }
}

/// The second half of the softmax: joins a tile with its completed row-sum column
/// tile (matching on the shared block-row) and emits `exp(v) / row_sum[row]`, so
/// each logical row of the output sums to one across the whole tiling.
#[derive(Default)]
pub struct SoftmaxNormalize;

impl JoinOperator for SoftmaxNormalize {
    fn matches(&self, left: &MatrixBlock, right: &MatrixBlock) -> bool {
        left.block_row() == right.block_row()
    }

    fn combine(
        &self,
        left: &MatrixBlock,
        right: &MatrixBlock,
    ) -> Result<MatrixBlock, OperatorError> {
        if right.cols() != 1 || right.rows() != left.rows() {
            return Err(OperatorError::ShapeMismatch {
                left_rows: left.rows(),
                left_cols: left.cols(),
                right_rows: right.rows(),
                right_cols: right.cols(),
            });
        }

        let mut out = MatrixBlock::same_shape_as(left);
        let cols = left.cols();
        for (r, (o_row, row)) in out
            .values_mut()
            .chunks_mut(cols)
            .zip(left.values().chunks(cols))
            .enumerate()
        {
            let denom = right.values()[r];
            for (o, v) in o_row.iter_mut().zip(row) {
                *o = v.exp() / denom;
            }
        }
        Ok(out)
    }
}

/// Feed-forward activation step: joins a tile with a per-row bias column tile
/// (matching on the shared block-row) and emits `max(0, v + bias[row])`.
#[derive(Default)]
pub struct ReluBiasAdd;

impl JoinOperator for ReluBiasAdd {
    fn matches(&self, left: &MatrixBlock, right: &MatrixBlock) -> bool {
        left.block_row() == right.block_row()
    }

    fn combine(
        &self,
        left: &MatrixBlock,
        right: &MatrixBlock,
    ) -> Result<MatrixBlock, OperatorError> {
        if right.cols() != 1 || right.rows() != left.rows() {
            return Err(OperatorError::ShapeMismatch {
                left_rows: left.rows(),
                left_cols: left.cols(),
                right_rows: right.rows(),
                right_cols: right.cols(),
            });
        }

        let mut out = MatrixBlock::same_shape_as(left);
        let cols = left.cols();
        for (r, (o_row, row)) in out
            .values_mut()
            .chunks_mut(cols)
            .zip(left.values().chunks(cols))
            .enumerate()
        {
            let bias = right.values()[r];
            for (o, v) in o_row.iter_mut().zip(row) {
                *o = (v + bias).max(0.0);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    fn block_2x2(values: [f64; 4]) -> MatrixBlock {
        MatrixBlock::from_values(0, 0, 2, 2, 2, 2, values.to_vec()).unwrap()
    }

    #[test]
    fn layer_norm_matches_hand_computed_values() {
        // mean = 2.5, population var = 1.25, sd ≈ 1.118
        let op = LayerNorm::new(Backend::Ndarray).unwrap();
        let out = op.project(&block_2x2([1.0, 2.0, 3.0, 4.0])).unwrap();

        let expected = [-1.342, -0.447, 0.447, 1.342];
        for (o, e) in out.values().iter().zip(expected) {
            assert_abs_diff_eq!(*o, e, epsilon = 1e-3);
        }
    }

    #[test]
    fn layer_norm_output_has_zero_mean_unit_variance() {
        let op = LayerNorm::new(Backend::Ndarray).unwrap();
        let input =
            MatrixBlock::from_values(1, 2, 3, 4, 9, 8, (0..12).map(|v| v as f64 * 1.7).collect())
                .unwrap();
        let out = op.project(&input).unwrap();
        assert!(out.is_aligned_with(&input));

        let n = out.values().len() as f64;
        let mean = out.values().iter().sum::<f64>() / n;
        let var = out.values().iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
        assert_abs_diff_eq!(mean, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(var, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn layer_norm_constant_block_yields_zeros_not_nan() {
        let op = LayerNorm::new(Backend::Ndarray).unwrap();
        let out = op.project(&block_2x2([7.0, 7.0, 7.0, 7.0])).unwrap();
        assert!(out.values().iter().all(|v| *v == 0.0));
    }

    #[test]
    fn layer_norm_rejects_cuda_backend_at_construction() {
        assert!(matches!(
            LayerNorm::new(Backend::Cuda),
            Err(OperatorError::UnsupportedBackend { .. })
        ));
    }

    #[test]
    fn residual_add_sums_elementwise() {
        let op = ResidualAdd::new(1, 4, Backend::Ndarray).unwrap();
        let a = MatrixBlock::from_values(0, 0, 1, 4, 1, 4, vec![1.0; 4]).unwrap();
        let b = MatrixBlock::from_values(0, 0, 1, 4, 1, 4, vec![2.0; 4]).unwrap();
        let out = op.combine(&a, &b).unwrap();
        assert_eq!(out.values(), &[3.0, 3.0, 3.0, 3.0]);
    }

    #[test]
    fn residual_add_is_commutative_and_keeps_left_metadata() {
        let op = ResidualAdd::new(2, 2, Backend::Ndarray).unwrap();
        let a = MatrixBlock::from_values(1, 3, 2, 2, 4, 8, vec![1.0, -2.0, 0.5, 9.0]).unwrap();
        let b = MatrixBlock::from_values(1, 3, 2, 2, 4, 8, vec![4.0, 0.25, -1.5, 2.0]).unwrap();

        let ab = op.combine(&a, &b).unwrap();
        let ba = op.combine(&b, &a).unwrap();
        assert_eq!(ab.values(), ba.values());
        assert_eq!(ab.coords(), a.coords());
    }

    #[test]
    fn residual_add_rejects_configured_shape_disagreement() {
        // Operator believes the model is 10x64 but the tile holds 4 values.
        let op = ResidualAdd::new(10, 64, Backend::Ndarray).unwrap();
        let a = block_2x2([1.0; 4]);
        let b = block_2x2([2.0; 4]);
        assert!(matches!(
            op.combine(&a, &b),
            Err(OperatorError::ConfiguredShapeMismatch { .. })
        ));
    }

    #[test]
    fn residual_add_rejects_incompatible_tiles() {
        let op = ResidualAdd::new(1, 4, Backend::Ndarray).unwrap();
        let a = MatrixBlock::from_values(0, 0, 1, 4, 1, 4, vec![1.0; 4]).unwrap();
        let b = MatrixBlock::from_values(0, 0, 2, 2, 2, 2, vec![2.0; 4]).unwrap();
        assert!(matches!(
            op.combine(&a, &b),
            Err(OperatorError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn transpose_multiply_rekeys_to_output_grid() {
        let op = TransposeMultiply::new(Backend::Ndarray).unwrap();
        // A tile at grid (2, 1) of a matrix with 6 logical columns, B tile at (2, 0)
        // of a matrix with 3 logical columns: the partial product lands at (1, 0).
        let a = MatrixBlock::from_values(2, 1, 2, 2, 8, 6, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let b = MatrixBlock::from_values(2, 0, 2, 3, 8, 3, (1..=6).map(f64::from).collect())
            .unwrap();

        let out = op.combine(&a, &b).unwrap();
        assert_eq!((out.block_row(), out.block_col()), (1, 0));
        assert_eq!((out.rows(), out.cols()), (2, 3));
        assert_eq!((out.total_rows(), out.total_cols()), (6, 3));

        // leftᵀ·right computed by hand.
        assert_eq!(out.values(), &[13.0, 17.0, 21.0, 18.0, 24.0, 30.0]);
    }

    #[test]
    fn transpose_multiply_rejects_contraction_mismatch() {
        let op = TransposeMultiply::new(Backend::Ndarray).unwrap();
        let a = MatrixBlock::from_values(0, 0, 2, 2, 2, 2, vec![1.0; 4]).unwrap();
        let b = MatrixBlock::from_values(0, 0, 3, 2, 3, 2, vec![1.0; 6]).unwrap();
        assert!(matches!(
            op.combine(&a, &b),
            Err(OperatorError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn block_sum_folds_same_keyed_blocks() {
        let op = BlockSum;
        let acc = block_2x2([1.0, 2.0, 3.0, 4.0]);
        let next = block_2x2([10.0, 20.0, 30.0, 40.0]);
        let out = op.merge(acc, &next).unwrap();
        assert_eq!(out.values(), &[11.0, 22.0, 33.0, 44.0]);
    }

    #[test]
    fn row_exp_sum_then_normalize_recovers_softmax_rows() {
        let input = MatrixBlock::from_values(
            0,
            0,
            2,
            3,
            2,
            3,
            vec![0.1, 0.7, -0.4, 2.0, -1.0, 0.0],
        )
        .unwrap();

        let sums = RowExpSum.project(&input).unwrap();
        assert_eq!((sums.rows(), sums.cols()), (2, 1));
        assert_eq!((sums.block_row(), sums.block_col()), (0, 0));
        assert_eq!(sums.total_cols(), 1);

        let out = SoftmaxNormalize.combine(&input, &sums).unwrap();
        assert_eq!(out.coords(), input.coords());
        for row in out.values().chunks(out.cols()) {
            assert_relative_eq!(row.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn relu_bias_add_clamps_below_zero() {
        let x = MatrixBlock::from_values(0, 0, 2, 2, 2, 2, vec![1.0, -3.0, 0.5, -0.25]).unwrap();
        let bias = MatrixBlock::from_values(0, 0, 2, 1, 2, 1, vec![1.0, -1.0]).unwrap();
        let out = ReluBiasAdd.combine(&x, &bias).unwrap();
        assert_eq!(out.values(), &[2.0, 0.0, 0.0, 0.0]);
    }
}
