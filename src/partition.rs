//! Mapping of global matrix dimensions onto grid blocks.
//!
//! The engine requires every global dimension to be a multiple of the grid
//! side, so all blocks along a dimension are exactly `d / p` wide. The
//! ceiling-division helpers are kept for callers that want to inspect the
//! padded shape of a non-divisible dimension before rejecting it.

use crate::error::{dimension_error, Result};

/// `ceil(d / p)`.
#[inline(always)]
pub fn ceil_div(d: usize, p: usize) -> usize {
    d.div_ceil(p)
}

/// Per-rank extents along one dimension split `p` ways with ceiling division.
///
/// Trailing ranks receive the remainder and may get a smaller (or empty)
/// extent; the extents always sum to `d`.
pub fn extents(d: usize, p: usize) -> Vec<usize> {
    let block = ceil_div(d, p);
    (0..p)
        .map(|i| d.saturating_sub(i * block).min(block))
        .collect()
}

/// Block extents of the three operands for one job.
///
/// `A` tiles are `block_m x block_k`, `B` tiles `block_k x block_n`, `C` tiles
/// `block_m x block_n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockShape {
    /// Rows of `A` and `C` per block.
    pub block_m: usize,
    /// Columns of `A`, rows of `B` per block.
    pub block_k: usize,
    /// Columns of `B` and `C` per block.
    pub block_n: usize,
}

impl BlockShape {
    /// Validates divisibility and returns the block shape for a `p x p` grid.
    pub fn new(m: usize, n: usize, k: usize, p: usize) -> Result<Self> {
        let mut offending = Vec::new();
        for (name, d) in [("m", m), ("n", n), ("k", k)] {
            if d == 0 {
                return Err(dimension_error(format!("{name} must be positive")));
            }
            if d % p != 0 {
                offending.push(format!("{name}={d}"));
            }
        }
        if !offending.is_empty() {
            return Err(dimension_error(format!(
                "matrix dimensions must be divisible by grid size ({p}): {}",
                offending.join(", ")
            )));
        }
        Ok(BlockShape {
            block_m: m / p,
            block_k: k / p,
            block_n: n / p,
        })
    }

    /// `(rows, cols)` of an `A` tile.
    pub fn a_tile(&self) -> (usize, usize) {
        (self.block_m, self.block_k)
    }

    /// `(rows, cols)` of a `B` tile.
    pub fn b_tile(&self) -> (usize, usize) {
        (self.block_k, self.block_n)
    }

    /// `(rows, cols)` of a `C` tile.
    pub fn c_tile(&self) -> (usize, usize) {
        (self.block_m, self.block_n)
    }
}

/// Location of one tile inside a row-major global buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileSpan {
    /// Element offset of the tile's top-left entry.
    pub offset: usize,
    /// Distance in elements between consecutive tile rows.
    pub stride: usize,
    /// Tile rows.
    pub rows: usize,
    /// Tile columns (contiguous run length per row).
    pub cols: usize,
}

impl TileSpan {
    /// Element index range of tile row `r` in the global buffer.
    #[inline(always)]
    pub fn row_range(&self, r: usize) -> std::ops::Range<usize> {
        let start = self.offset + r * self.stride;
        start..start + self.cols
    }
}

/// `p x p` tiling of a row-major `rows x cols` matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileLayout {
    rows: usize,
    cols: usize,
    block_rows: usize,
    block_cols: usize,
}

impl TileLayout {
    /// Describes the tiling; tiles must cover the matrix exactly.
    pub fn new(rows: usize, cols: usize, block_rows: usize, block_cols: usize, p: usize) -> Result<Self> {
        if block_rows * p != rows || block_cols * p != cols {
            return Err(dimension_error(format!(
                "{p}x{p} tiles of {block_rows}x{block_cols} do not cover a {rows}x{cols} matrix"
            )));
        }
        Ok(TileLayout {
            rows,
            cols,
            block_rows,
            block_cols,
        })
    }

    /// Global rows.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Global columns.
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Elements in one tile.
    pub fn tile_len(&self) -> usize {
        self.block_rows * self.block_cols
    }

    /// `(block_row, block_col) -> (offset, stride)` of a tile.
    pub fn span(&self, block_row: usize, block_col: usize) -> TileSpan {
        TileSpan {
            offset: block_row * self.block_rows * self.cols + block_col * self.block_cols,
            stride: self.cols,
            rows: self.block_rows,
            cols: self.block_cols,
        }
    }

    /// Copies tile `(block_row, block_col)` out of `global` into a contiguous buffer.
    pub fn extract<T: Copy>(&self, global: &[T], block_row: usize, block_col: usize, tile: &mut [T]) {
        let span = self.span(block_row, block_col);
        for (r, dst) in tile.chunks_exact_mut(span.cols).enumerate() {
            dst.copy_from_slice(&global[span.row_range(r)]);
        }
    }

    /// Copies a contiguous tile into position `(block_row, block_col)` of `global`.
    pub fn place<T: Copy>(&self, global: &mut [T], block_row: usize, block_col: usize, tile: &[T]) {
        let span = self.span(block_row, block_col);
        for (r, src) in tile.chunks_exact(span.cols).enumerate() {
            global[span.row_range(r)].copy_from_slice(src);
        }
    }
}
