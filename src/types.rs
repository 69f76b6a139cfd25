// ========================================================================================
//                             High-Level Data Contracts
// ========================================================================================

// This file is ONLY for types that are SHARED BETWEEN FILES, not types that only are used in one file.

use itertools::iproduct;
use ndarray::{ArrayView2, ArrayViewMut2};
use std::fmt;

/// The `(block_row, block_col, total_rows, total_cols)` tuple that identifies where a
/// tile sits within its logical matrix. Two blocks belong to the same coordinate space
/// iff their `BlockCoords` are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockCoords {
    pub block_row: usize,
    pub block_col: usize,
    pub total_rows: usize,
    pub total_cols: usize,
}

impl fmt::Display for BlockCoords {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({},{}) of {}x{}",
            self.block_row, self.block_col, self.total_rows, self.total_cols
        )
    }
}

/// One tile of a logical 2-D matrix: the unit of distributed matrix storage.
///
/// A block is self-describing. It carries its grid coordinates, its own (possibly
/// edge-truncated) dimensions, and the logical matrix's full dimensions, so any
/// block-local kernel can reason about its position within the whole without a
/// side-channel lookup. The value buffer is flat, row-major, exclusively owned,
/// and always exactly `rows * cols` long. That sizing check at construction is
/// the only bounds policy this type enforces; kernels get a contiguous span and
/// are expected to respect it.
#[derive(Debug, Clone, PartialEq)]
pub struct MatrixBlock {
    block_row: usize,
    block_col: usize,
    rows: usize,
    cols: usize,
    total_rows: usize,
    total_cols: usize,
    values: Vec<f64>,
}

impl MatrixBlock {
    /// Creates a zero-filled single-tile matrix: the totals default to the tile's own
    /// dimensions, so the block is a complete logical matrix on its own.
    pub fn new(block_row: usize, block_col: usize, rows: usize, cols: usize) -> Self {
        Self::with_totals(block_row, block_col, rows, cols, rows, cols)
    }

    /// Creates a zero-filled tile of a partitioned matrix with explicit logical totals.
    pub fn with_totals(
        block_row: usize,
        block_col: usize,
        rows: usize,
        cols: usize,
        total_rows: usize,
        total_cols: usize,
    ) -> Self {
        Self {
            block_row,
            block_col,
            rows,
            cols,
            total_rows,
            total_cols,
            values: vec![0.0; rows * cols],
        }
    }

    /// Creates a tile around a caller-supplied row-major buffer. This is the sole
    /// entry point that accepts external data, and the `values.len() == rows * cols`
    /// invariant is checked here once so every downstream kernel can rely on it.
    pub fn from_values(
        block_row: usize,
        block_col: usize,
        rows: usize,
        cols: usize,
        total_rows: usize,
        total_cols: usize,
        values: Vec<f64>,
    ) -> Result<Self, &'static str> {
        if values.len() != rows * cols {
            return Err("Mismatched block data: values.len() does not equal rows * cols");
        }
        Ok(Self {
            block_row,
            block_col,
            rows,
            cols,
            total_rows,
            total_cols,
            values,
        })
    }

    /// A zero-filled block carrying the same coordinate and shape metadata as `other`.
    /// Producing kernels use this to stamp out their output tile before the write pass.
    pub fn same_shape_as(other: &MatrixBlock) -> Self {
        Self::with_totals(
            other.block_row,
            other.block_col,
            other.rows,
            other.cols,
            other.total_rows,
            other.total_cols,
        )
    }

    #[inline]
    pub fn block_row(&self) -> usize {
        self.block_row
    }

    #[inline]
    pub fn block_col(&self) -> usize {
        self.block_col
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    pub fn total_rows(&self) -> usize {
        self.total_rows
    }

    #[inline]
    pub fn total_cols(&self) -> usize {
        self.total_cols
    }

    #[inline]
    pub fn coords(&self) -> BlockCoords {
        BlockCoords {
            block_row: self.block_row,
            block_col: self.block_col,
            total_rows: self.total_rows,
            total_cols: self.total_cols,
        }
    }

    /// Two blocks are aligned iff they share grid coordinates and logical totals.
    /// This is the natural matching predicate for elementwise join kernels.
    #[inline]
    pub fn is_aligned_with(&self, other: &MatrixBlock) -> bool {
        self.coords() == other.coords()
    }

    /// The contiguous row-major value buffer.
    #[inline]
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Mutable access to the contiguous value buffer, for the producing kernel's
    /// single write pass. The borrow is scoped; no alias survives the kernel call.
    #[inline]
    pub fn values_mut(&mut self) -> &mut [f64] {
        &mut self.values
    }

    /// A 2-D `(rows, cols)` view over the buffer for kernels that want dense-matrix
    /// indexing rather than flat iteration.
    #[inline]
    pub fn view(&self) -> ArrayView2<'_, f64> {
        ArrayView2::from_shape((self.rows, self.cols), &self.values)
            .expect("block buffer sized rows * cols by construction")
    }

    #[inline]
    pub fn view_mut(&mut self) -> ArrayViewMut2<'_, f64> {
        ArrayViewMut2::from_shape((self.rows, self.cols), &mut self.values)
            .expect("block buffer sized rows * cols by construction")
    }
}

/// Tiles a dense row-major matrix into a grid of blocks with nominal tile size
/// `tile_rows x tile_cols`. Tiles at the grid's last row/column are truncated to
/// whatever remains, so every element lands in exactly one block.
pub fn partition(
    total_rows: usize,
    total_cols: usize,
    tile_rows: usize,
    tile_cols: usize,
    values: &[f64],
) -> Result<Vec<MatrixBlock>, &'static str> {
    if tile_rows == 0 || tile_cols == 0 {
        return Err("Tile dimensions must be non-zero");
    }
    if values.len() != total_rows * total_cols {
        return Err("Mismatched matrix data: values.len() does not equal total_rows * total_cols");
    }

    let grid_rows = total_rows.div_ceil(tile_rows);
    let grid_cols = total_cols.div_ceil(tile_cols);

    let mut blocks = Vec::with_capacity(grid_rows * grid_cols);
    for (block_row, block_col) in iproduct!(0..grid_rows, 0..grid_cols) {
        let row_start = block_row * tile_rows;
        let col_start = block_col * tile_cols;
        let rows = tile_rows.min(total_rows - row_start);
        let cols = tile_cols.min(total_cols - col_start);

        let mut tile = Vec::with_capacity(rows * cols);
        for r in 0..rows {
            let offset = (row_start + r) * total_cols + col_start;
            tile.extend_from_slice(&values[offset..offset + cols]);
        }

        blocks.push(MatrixBlock::from_values(
            block_row, block_col, rows, cols, total_rows, total_cols, tile,
        )?);
    }
    Ok(blocks)
}

/// Reassembles a dense row-major matrix from the blocks of one tiling. The inverse
/// of [`partition`]; used to compare block-local results against whole-matrix
/// reference computations.
pub fn assemble(blocks: &[MatrixBlock], tile_rows: usize, tile_cols: usize) -> Result<Vec<f64>, &'static str> {
    let first = blocks.first().ok_or("Cannot assemble an empty block set")?;
    let (total_rows, total_cols) = (first.total_rows(), first.total_cols());

    let mut dense = vec![0.0; total_rows * total_cols];
    for block in blocks {
        if block.total_rows() != total_rows || block.total_cols() != total_cols {
            return Err("Cannot assemble blocks drawn from different logical matrices");
        }
        let row_start = block.block_row() * tile_rows;
        let col_start = block.block_col() * tile_cols;
        if row_start + block.rows() > total_rows || col_start + block.cols() > total_cols {
            return Err("Block lies outside the logical matrix for this tile size");
        }
        for r in 0..block.rows() {
            let src = &block.values()[r * block.cols()..(r + 1) * block.cols()];
            let offset = (row_start + r) * total_cols + col_start;
            dense[offset..offset + block.cols()].copy_from_slice(src);
        }
    }
    Ok(dense)
}


/// The numeric backend an operator dispatches through. The selection is explicit
/// per-operator configuration, fixed at construction. Only [`Backend::Ndarray`] is
/// compiled into this build; constructing an operator against any other variant is
/// a fatal configuration error, surfaced immediately rather than at first kernel
/// invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    #[default]
    Ndarray,
    Cuda,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Ndarray => write!(f, "ndarray"),
            Backend::Cuda => write!(f, "cuda"),
        }
    }
}
