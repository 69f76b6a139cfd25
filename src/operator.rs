// ========================================================================================
//                            Block Operator Contracts
// ========================================================================================
//
// The three capability interfaces the dataflow engine dispatches through. A concrete
// kernel implements exactly one of them. Every kernel is a synchronous, non-blocking
// pure function of its input block(s) and the operator's fixed configuration: no
// kernel observes another block's state, which is what lets the engine run blocks
// in any order and in parallel.

use crate::types::{Backend, MatrixBlock};
use thiserror::Error;

/// The terminal failure modes of the operator layer. This layer has no retry logic:
/// every error is signaled up to the dataflow engine, which decides whether to retry
/// the enclosing pipeline stage. A kernel either emits one well-formed block or fails
/// the whole invocation; there is no partial-result emission.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OperatorError {
    #[error("the '{requested}' backend is not compiled into this build (only '{supported}' is)")]
    UnsupportedBackend {
        requested: Backend,
        supported: Backend,
    },

    #[error(
        "cannot combine a {left_rows}x{left_cols} block with a {right_rows}x{right_cols} block elementwise"
    )]
    ShapeMismatch {
        left_rows: usize,
        left_cols: usize,
        right_rows: usize,
        right_cols: usize,
    },

    #[error(
        "operator configured for {context_size}x{embed_size} = {} values but block ({block_row},{block_col}) holds {actual}",
        .context_size * .embed_size
    )]
    ConfiguredShapeMismatch {
        context_size: usize,
        embed_size: usize,
        block_row: usize,
        block_col: usize,
        actual: usize,
    },

    #[error(
        "cannot merge statistics built for k={left_k}, dim={left_dim} with statistics built for k={right_k}, dim={right_dim}"
    )]
    StatisticsConfigMismatch {
        left_k: usize,
        left_dim: usize,
        right_k: usize,
        right_dim: usize,
    },

    #[error("observation has {actual} values but the accumulator was built for {expected}")]
    ObservationDimensionMismatch { expected: usize, actual: usize },
}

/// Checks an operator's configured backend at construction time. Fail-fast: a kernel
/// must never branch on backend state mid-invocation or silently produce wrong
/// results under an unsupported selection.
pub(crate) fn require_supported(backend: Backend) -> Result<(), OperatorError> {
    match backend {
        Backend::Ndarray => Ok(()),
        other => Err(OperatorError::UnsupportedBackend {
            requested: other,
            supported: Backend::Ndarray,
        }),
    }
}

/// A stateless (or operator-state-only) transform applied independently to every
/// block of one input port.
pub trait MapOperator: Send + Sync {
    /// Whether this block participates. Defaults to selecting every block.
    fn selects(&self, _input: &MatrixBlock) -> bool {
        true
    }

    /// Produces exactly one output block per accepted input. A plain map kernel
    /// must preserve its input's coordinate metadata; kernels that renormalize
    /// output coordinates must report it via [`MapOperator::rekeys`].
    fn project(&self, input: &MatrixBlock) -> Result<MatrixBlock, OperatorError>;

    /// True for the distinct class of operators that intentionally change the
    /// coordinate space of their output (a transpose, a reduction across a
    /// dimension). The executor exempts these from the preservation check that
    /// guards every downstream join.
    fn rekeys(&self) -> bool {
        false
    }
}

/// A pairwise combiner invoked once per matching pair of blocks drawn from two
/// input ports. The engine guarantees eventual delivery of both halves of a match
/// and at-most-once delivery of each matched pair.
pub trait JoinOperator: Send + Sync {
    /// The matching predicate. Defaults to block alignment: equal grid coordinates
    /// within the same logical matrix dimensions.
    fn matches(&self, left: &MatrixBlock, right: &MatrixBlock) -> bool {
        left.is_aligned_with(right)
    }

    /// Produces exactly one output block per matched pair. A plain join kernel's
    /// output carries the first input's coordinate metadata.
    fn combine(
        &self,
        left: &MatrixBlock,
        right: &MatrixBlock,
    ) -> Result<MatrixBlock, OperatorError>;

    /// See [`MapOperator::rekeys`].
    fn rekeys(&self) -> bool {
        false
    }
}

/// A keyed block reduction: blocks sharing a key are folded pairwise into one.
/// The merge must be associative and commutative so that any grouping or order of
/// partial merges yields the same result.
pub trait AggregateOperator: Send + Sync {
    /// The grouping key. Defaults to the block's grid coordinates.
    fn key(&self, block: &MatrixBlock) -> (usize, usize) {
        (block.block_row(), block.block_col())
    }

    /// Folds `next` into the running `acc` for one key.
    fn merge(&self, acc: MatrixBlock, next: &MatrixBlock) -> Result<MatrixBlock, OperatorError>;
}
