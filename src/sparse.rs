//! Compressed sparse row matrices and block-distributed sparse SUMMA.
//!
//! A [`CsrMatrix`] plays the left operand of `C = A * B` with dense `B`. The
//! grid, partitioner and round loop are shared with the dense engine through
//! [`LeftBlock`]; only the tile extraction, the transfer of a tile (three
//! arrays instead of one) and the local kernel differ.
//!
//! # Inputs
//!
//! - [`CsrMatrix::random`]: seeded generator placing one to three entries per
//!   row with small integer values.
//! - [`read_matrix_market`]: coordinate Matrix Market files, `real`,
//!   `integer` or `pattern`, `general` or `symmetric`.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use log::debug;
use rand::prelude::*;
use rayon::{
    iter::{IndexedParallelIterator, ParallelIterator},
    slice::ParallelSliceMut,
};

use crate::comm::Communicator;
use crate::distribute::TilePlacement;
use crate::element::Element;
use crate::error::{configuration_error, dimension_error, Result, SummaError};
use crate::grid::{GridCoord, ProcessGrid};
use crate::matrix::Matrix;
use crate::summa::{LeftBlock, PARALLEL_THRESHOLD};
use crate::verify::{compare, VerificationReport};

/// Tolerance used by sparse verification.
pub const SPARSE_TOLERANCE: f64 = 1e-10;

const TAG_CSR_ROW_PTR: u32 = 110;
const TAG_CSR_COL_IDX: u32 = 111;
const TAG_CSR_VALUES: u32 = 112;

/// A `rows x cols` sparse matrix in compressed sparse row form.
///
/// Column indices within a row are strictly increasing.
#[derive(Debug, Clone, PartialEq)]
pub struct CsrMatrix<T> {
    rows: usize,
    cols: usize,
    row_ptr: Vec<usize>,
    col_indices: Vec<usize>,
    values: Vec<T>,
}

impl<T: Element> CsrMatrix<T> {
    /// Builds a CSR matrix from raw arrays, validating their structure.
    pub fn new(
        rows: usize,
        cols: usize,
        row_ptr: Vec<usize>,
        col_indices: Vec<usize>,
        values: Vec<T>,
    ) -> Result<Self> {
        if row_ptr.len() != rows + 1 || row_ptr[0] != 0 {
            return Err(dimension_error(format!(
                "row pointer of length {} does not describe {rows} rows",
                row_ptr.len()
            )));
        }
        if col_indices.len() != values.len() || row_ptr[rows] != values.len() {
            return Err(dimension_error(format!(
                "{} column indices and {} values for {} stored entries",
                col_indices.len(),
                values.len(),
                row_ptr[rows]
            )));
        }
        for (i, w) in row_ptr.windows(2).enumerate() {
            if w[0] > w[1] {
                return Err(dimension_error(format!("row pointer decreases at row {i}")));
            }
            if w[1] > col_indices.len() {
                return Err(dimension_error(format!(
                    "row pointer {} at row {i} runs past {} stored entries",
                    w[1],
                    col_indices.len()
                )));
            }
            let row = &col_indices[w[0]..w[1]];
            if row.iter().any(|&c| c >= cols) || row.windows(2).any(|p| p[0] >= p[1]) {
                return Err(dimension_error(format!(
                    "row {i} has unsorted or out-of-range column indices"
                )));
            }
        }
        Ok(CsrMatrix {
            rows,
            cols,
            row_ptr,
            col_indices,
            values,
        })
    }

    /// Builds from `(row, col, value)` triplets; duplicates are summed.
    pub fn from_triplets(rows: usize, cols: usize, mut entries: Vec<(usize, usize, T)>) -> Result<Self> {
        if let Some(&(r, c, _)) = entries.iter().find(|&&(r, c, _)| r >= rows || c >= cols) {
            return Err(dimension_error(format!(
                "entry ({r}, {c}) outside a {rows}x{cols} matrix"
            )));
        }
        entries.sort_by(|x, y| (x.0, x.1).cmp(&(y.0, y.1)));

        let mut row_ptr = vec![0; rows + 1];
        let mut col_indices: Vec<usize> = Vec::with_capacity(entries.len());
        let mut values: Vec<T> = Vec::with_capacity(entries.len());
        let mut last: Option<(usize, usize)> = None;
        for (r, c, v) in entries {
            if last == Some((r, c)) {
                if let Some(tail) = values.last_mut() {
                    *tail += v;
                }
                continue;
            }
            last = Some((r, c));
            row_ptr[r + 1] += 1;
            col_indices.push(c);
            values.push(v);
        }
        for i in 0..rows {
            row_ptr[i + 1] += row_ptr[i];
        }
        Self::new(rows, cols, row_ptr, col_indices, values)
    }

    /// Keeps the non-zero entries of a dense matrix.
    pub fn from_dense(dense: &Matrix<T>) -> Self {
        let mut row_ptr = Vec::with_capacity(dense.rows() + 1);
        let mut col_indices = Vec::new();
        let mut values = Vec::new();
        row_ptr.push(0);
        for i in 0..dense.rows() {
            for j in 0..dense.cols() {
                let v = dense.get(i, j);
                if v != T::zero() {
                    col_indices.push(j);
                    values.push(v);
                }
            }
            row_ptr.push(values.len());
        }
        CsrMatrix {
            rows: dense.rows(),
            cols: dense.cols(),
            row_ptr,
            col_indices,
            values,
        }
    }

    /// Seeded random matrix with roughly `rows * cols * density` stored entries.
    ///
    /// Rows get one to three entries at distinct random columns with integer
    /// values in `0..10`, until the entry budget (at least one per row) runs out.
    pub fn random(rows: usize, cols: usize, density: f64, seed: u64) -> Result<Self> {
        if !(density > 0.0 && density <= 1.0) {
            return Err(configuration_error(format!(
                "density must be in (0, 1], got {density}"
            )));
        }
        if cols == 0 {
            return Err(dimension_error("sparse matrix needs at least one column"));
        }
        let budget = ((rows as f64 * cols as f64 * density) as usize).max(rows);
        let mut rng = StdRng::seed_from_u64(seed);

        let mut row_ptr = Vec::with_capacity(rows + 1);
        let mut col_indices = Vec::with_capacity(budget);
        let mut values = Vec::with_capacity(budget);
        row_ptr.push(0);
        for _ in 0..rows {
            let wanted = rng.random_range(1..=3usize).min(cols);
            let take = wanted.min(budget - values.len());
            let mut picked = BTreeSet::new();
            while picked.len() < take {
                picked.insert(rng.random_range(0..cols));
            }
            for c in picked {
                col_indices.push(c);
                values.push(T::from_f64_lossy(rng.random_range(0..10u32) as f64));
            }
            row_ptr.push(values.len());
        }
        Ok(CsrMatrix {
            rows,
            cols,
            row_ptr,
            col_indices,
            values,
        })
    }

    /// Number of rows.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns.
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Number of stored entries.
    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Row pointer array (`rows + 1` entries).
    pub fn row_ptr(&self) -> &[usize] {
        &self.row_ptr
    }

    /// Column index of every stored entry.
    pub fn col_indices(&self) -> &[usize] {
        &self.col_indices
    }

    /// Value of every stored entry.
    pub fn values(&self) -> &[T] {
        &self.values
    }

    /// Expands into a dense matrix.
    pub fn to_dense(&self) -> Result<Matrix<T>> {
        let mut dense = Matrix::zeros(self.rows, self.cols)?;
        let cols = self.cols;
        let out = dense.as_mut_slice();
        for i in 0..self.rows {
            for idx in self.row_ptr[i]..self.row_ptr[i + 1] {
                out[i * cols + self.col_indices[idx]] += self.values[idx];
            }
        }
        Ok(dense)
    }

    /// Sub-matrix of tile `(block_row, block_col)` with tile-local column indices.
    pub fn tile(&self, block_row: usize, block_col: usize, block_rows: usize, block_cols: usize) -> Self {
        let (r0, c0) = (block_row * block_rows, block_col * block_cols);
        let mut row_ptr = Vec::with_capacity(block_rows + 1);
        let mut col_indices = Vec::new();
        let mut values = Vec::new();
        row_ptr.push(0);
        for i in r0..r0 + block_rows {
            let span = self.row_ptr[i]..self.row_ptr[i + 1];
            for (&c, &v) in self.col_indices[span.clone()].iter().zip(&self.values[span]) {
                if (c0..c0 + block_cols).contains(&c) {
                    col_indices.push(c - c0);
                    values.push(v);
                }
            }
            row_ptr.push(values.len());
        }
        CsrMatrix {
            rows: block_rows,
            cols: block_cols,
            row_ptr,
            col_indices,
            values,
        }
    }

    fn row_accumulate(&self, i: usize, b: &[T], n: usize, out_row: &mut [T]) {
        for idx in self.row_ptr[i]..self.row_ptr[i + 1] {
            let a_ij = self.values[idx];
            let b_row = &b[self.col_indices[idx] * n..(self.col_indices[idx] + 1) * n];
            for (o, &b_jl) in out_row.iter_mut().zip(b_row) {
                *o += a_ij * b_jl;
            }
        }
    }
}

impl<T: Element> LeftBlock<T> for CsrMatrix<T> {
    fn rows(&self) -> usize {
        self.rows
    }

    fn cols(&self) -> usize {
        self.cols
    }

    fn multiply_accumulate(&self, b: &[T], n: usize, out: &mut [T], _block_size: usize) {
        assert_eq!(b.len(), self.cols * n, "b must hold cols * n elements");
        assert_eq!(out.len(), self.rows * n, "out must hold rows * n elements");
        if n == 0 {
            return;
        }
        if self.nnz() * n >= PARALLEL_THRESHOLD {
            out.par_chunks_mut(n)
                .enumerate()
                .for_each(|(i, out_row)| self.row_accumulate(i, b, n, out_row));
        } else {
            out.chunks_mut(n)
                .enumerate()
                .for_each(|(i, out_row)| self.row_accumulate(i, b, n, out_row));
        }
    }

    fn broadcast<C: Communicator>(&mut self, comm: &C, root: usize) -> Result<()> {
        comm.broadcast_vec(root, &mut self.row_ptr)?;
        comm.broadcast_vec(root, &mut self.col_indices)?;
        comm.broadcast_vec(root, &mut self.values)?;
        if self.row_ptr.len() != self.rows + 1 || self.row_ptr[self.rows] != self.values.len() {
            return Err(dimension_error("broadcast CSR block does not match the block shape"));
        }
        Ok(())
    }
}

/// Sequential `C = A * B` for sparse `A` and dense `B`.
pub fn csr_spmm<T: Element>(a: &CsrMatrix<T>, b: &Matrix<T>) -> Result<Matrix<T>> {
    if a.cols() != b.rows() {
        return Err(dimension_error(format!(
            "cannot multiply sparse {}x{} by {}x{}",
            a.rows(),
            a.cols(),
            b.rows(),
            b.cols()
        )));
    }
    let mut c = Matrix::zeros(a.rows(), b.cols())?;
    let n = b.cols();
    for (i, out_row) in c.as_mut_slice().chunks_mut(n.max(1)).enumerate().take(a.rows()) {
        a.row_accumulate(i, b.as_slice(), n, out_row);
    }
    Ok(c)
}

/// Compares a sparse product against [`csr_spmm`].
pub fn verify_spmm<T: Element>(
    c: &Matrix<T>,
    a: &CsrMatrix<T>,
    b: &Matrix<T>,
    tolerance: f64,
) -> Result<VerificationReport> {
    let reference = csr_spmm(a, b)?;
    compare(c, &reference, tolerance)
}

/// Scatters a global CSR matrix into CSR tiles, mirroring
/// [`distribute_with`](crate::distribute::distribute_with).
pub fn distribute_csr<T, C>(
    global: Option<&CsrMatrix<T>>,
    rows: usize,
    cols: usize,
    block_rows: usize,
    block_cols: usize,
    placement: TilePlacement,
    grid: &ProcessGrid<C>,
) -> Result<CsrMatrix<T>>
where
    T: Element,
    C: Communicator,
{
    if block_rows * grid.side() != rows || block_cols * grid.side() != cols {
        return Err(dimension_error(format!(
            "{p}x{p} tiles of {block_rows}x{block_cols} do not cover a {rows}x{cols} matrix",
            p = grid.side()
        )));
    }

    match global {
        Some(global) => {
            if !grid.is_coordinator() {
                return Err(configuration_error(
                    "non-coordinator rank holds a global sparse matrix",
                ));
            }
            if global.rows() != rows || global.cols() != cols {
                return Err(configuration_error(format!(
                    "global sparse matrix is {}x{}, distribution expects {rows}x{cols}",
                    global.rows(),
                    global.cols()
                )));
            }
            let mut own = None;
            for row in 0..grid.side() {
                for col in 0..grid.side() {
                    let tile = global.tile(row, col, block_rows, block_cols);
                    let owner = placement.owner(GridCoord { row, col });
                    if owner == grid.coord() {
                        own = Some(tile);
                    } else {
                        let dest = grid.rank_at(owner);
                        grid.world().send(dest, TAG_CSR_ROW_PTR, tile.row_ptr())?;
                        grid.world().send(dest, TAG_CSR_COL_IDX, tile.col_indices())?;
                        grid.world().send(dest, TAG_CSR_VALUES, tile.values())?;
                    }
                }
            }
            debug!(
                "distributed sparse {rows}x{cols} matrix ({} entries) to {} ranks",
                global.nnz(),
                grid.size()
            );
            own.ok_or_else(|| configuration_error("coordinator tile missing"))
        }
        None => {
            if grid.is_coordinator() {
                return Err(configuration_error(
                    "coordinator has no global sparse matrix to distribute",
                ));
            }
            let root = grid.coordinator();
            let row_ptr = grid.world().recv::<usize>(root, TAG_CSR_ROW_PTR)?;
            let col_indices = grid.world().recv::<usize>(root, TAG_CSR_COL_IDX)?;
            let values = grid.world().recv::<T>(root, TAG_CSR_VALUES)?;
            CsrMatrix::new(block_rows, block_cols, row_ptr, col_indices, values)
        }
    }
}

/// Where the coordinator obtains the sparse operand.
#[derive(Debug, Clone)]
pub enum SparseSource<T> {
    /// Generate with [`CsrMatrix::random`].
    Random {
        /// Target fraction of stored entries.
        density: f64,
        /// Generator seed.
        seed: u64,
    },
    /// Read with [`read_matrix_market`].
    MatrixMarket(PathBuf),
    /// Use the given matrix as-is.
    Provided(CsrMatrix<T>),
}

impl<T: Element> SparseSource<T> {
    /// Produces the operand, checking its shape against `(rows, cols)`.
    pub fn materialize(&self, rows: usize, cols: usize) -> Result<CsrMatrix<T>> {
        let matrix = match self {
            SparseSource::Random { density, seed } => return CsrMatrix::random(rows, cols, *density, *seed),
            SparseSource::MatrixMarket(path) => read_matrix_market(path)?,
            SparseSource::Provided(matrix) => matrix.clone(),
        };
        if matrix.rows() != rows || matrix.cols() != cols {
            return Err(dimension_error(format!(
                "sparse operand is {}x{}, job expects {rows}x{cols}",
                matrix.rows(),
                matrix.cols()
            )));
        }
        Ok(matrix)
    }
}

fn parse_field<V: std::str::FromStr>(field: Option<&str>, line: usize, what: &str) -> Result<V> {
    field
        .and_then(|f| f.parse().ok())
        .ok_or_else(|| SummaError::Parse {
            line,
            message: format!("missing or malformed {what}"),
        })
}

/// How the stored triangle of a Matrix Market file expands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Symmetry {
    General,
    Symmetric,
    SkewSymmetric,
}

fn header_error(message: impl Into<String>) -> SummaError {
    SummaError::Parse {
        line: 1,
        message: message.into(),
    }
}

/// Reads a coordinate-format Matrix Market file into CSR.
///
/// Indices are 1-based in the file. Symmetric files store one triangle and the
/// mirrored entries are added; skew-symmetric files mirror with the sign
/// flipped. Pattern files get value `1` for every entry. Complex and Hermitian
/// files are rejected.
pub fn read_matrix_market<T: Element>(path: impl AsRef<Path>) -> Result<CsrMatrix<T>> {
    let reader = BufReader::new(File::open(path.as_ref())?);
    let mut lines = reader.lines().enumerate();

    let header = match lines.next() {
        Some((_, line)) => line?.to_lowercase(),
        None => return Err(header_error("empty file")),
    };
    let tokens: Vec<&str> = header.split_whitespace().collect();
    if tokens.len() < 3 || tokens[0] != "%%matrixmarket" || tokens[1] != "matrix" || tokens[2] != "coordinate" {
        return Err(header_error("expected a '%%MatrixMarket matrix coordinate' header"));
    }
    let pattern = match tokens.get(3).copied().unwrap_or("real") {
        "real" | "double" | "integer" => false,
        "pattern" => true,
        other => return Err(header_error(format!("unsupported field '{other}'"))),
    };
    let symmetry = match tokens.get(4).copied().unwrap_or("general") {
        "general" => Symmetry::General,
        "symmetric" => Symmetry::Symmetric,
        "skew-symmetric" => Symmetry::SkewSymmetric,
        other => return Err(header_error(format!("unsupported symmetry '{other}'"))),
    };

    let mut size_line = None;
    for (idx, line) in lines.by_ref() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('%') {
            continue;
        }
        size_line = Some((idx + 1, trimmed.to_string()));
        break;
    }
    let (size_no, size_line) = size_line.ok_or_else(|| SummaError::Parse {
        line: 1,
        message: "missing size line".into(),
    })?;
    let mut fields = size_line.split_whitespace();
    let rows: usize = parse_field(fields.next(), size_no, "row count")?;
    let cols: usize = parse_field(fields.next(), size_no, "column count")?;
    let declared: usize = parse_field(fields.next(), size_no, "entry count")?;

    let mirrored = symmetry != Symmetry::General;
    let mut entries = Vec::with_capacity(if mirrored { 2 * declared } else { declared });
    let mut seen = 0;
    for (idx, line) in lines {
        if seen == declared {
            break;
        }
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('%') {
            continue;
        }
        let line_no = idx + 1;
        let mut fields = trimmed.split_whitespace();
        let r: usize = parse_field(fields.next(), line_no, "row index")?;
        let c: usize = parse_field(fields.next(), line_no, "column index")?;
        let v = if pattern {
            T::one()
        } else {
            T::from_f64_lossy(parse_field::<f64>(fields.next(), line_no, "value")?)
        };
        if r == 0 || c == 0 || r > rows || c > cols {
            return Err(SummaError::Parse {
                line: line_no,
                message: format!("index ({r}, {c}) outside a {rows}x{cols} matrix"),
            });
        }
        if symmetry == Symmetry::SkewSymmetric && r == c {
            return Err(SummaError::Parse {
                line: line_no,
                message: format!("diagonal entry ({r}, {c}) in a skew-symmetric file"),
            });
        }
        entries.push((r - 1, c - 1, v));
        if mirrored && r != c {
            let mirror = if symmetry == Symmetry::SkewSymmetric { -v } else { v };
            entries.push((c - 1, r - 1, mirror));
        }
        seen += 1;
    }
    if seen != declared {
        return Err(SummaError::Parse {
            line: size_no,
            message: format!("declared {declared} entries, found {seen}"),
        });
    }

    CsrMatrix::from_triplets(rows, cols, entries)
}
