//! Row-major dense matrix storage.
//!
//! [`Matrix`] serves both as the coordinator-held global matrix and as the
//! per-rank dense block. Buffers are reserved fallibly so an allocation
//! failure surfaces as [`SummaError::Allocation`](crate::error::SummaError)
//! instead of aborting the process.

use ndarray::Array2;
use rand::prelude::*;

use crate::element::Element;
use crate::error::{allocation_error, dimension_error, Result};

/// Seed used for the generated `A` operand.
pub const SEED_A: u64 = 42;

/// Seed used for the generated `B` operand.
pub const SEED_B: u64 = 142;

/// Reserves and zero-fills `len` elements, reporting failure instead of aborting.
pub fn try_zeroed<T: Element>(len: usize, what: &str) -> Result<Vec<T>> {
    let mut data = Vec::new();
    data.try_reserve_exact(len)
        .map_err(|e| allocation_error(len, format!("{what}: {e}")))?;
    data.resize(len, T::zero());
    Ok(data)
}

/// A `rows x cols` matrix stored row-major in one contiguous buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix<T> {
    rows: usize,
    cols: usize,
    data: Vec<T>,
}

impl<T: Element> Matrix<T> {
    /// Zero matrix.
    pub fn zeros(rows: usize, cols: usize) -> Result<Self> {
        Ok(Matrix {
            rows,
            cols,
            data: try_zeroed(rows * cols, "matrix buffer")?,
        })
    }

    /// Wraps an existing row-major buffer.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<T>) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(dimension_error(format!(
                "buffer of {} elements cannot hold a {rows}x{cols} matrix",
                data.len()
            )));
        }
        Ok(Matrix { rows, cols, data })
    }

    /// Builds a matrix from `f(row, col)`.
    pub fn from_fn(rows: usize, cols: usize, mut f: impl FnMut(usize, usize) -> T) -> Self {
        let data = (0..rows * cols).map(|idx| f(idx / cols, idx % cols)).collect();
        Matrix { rows, cols, data }
    }

    /// Square identity matrix.
    pub fn identity(n: usize) -> Self {
        Self::from_fn(n, n, |i, j| if i == j { T::one() } else { T::zero() })
    }

    /// Deterministic matrix with entries uniform in `[0, 1)`.
    pub fn random(rows: usize, cols: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let data = (0..rows * cols)
            .map(|_| rng.random_range(T::zero()..T::one()))
            .collect();
        Matrix { rows, cols, data }
    }

    /// Number of rows.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns.
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Element at `(row, col)`.
    #[inline(always)]
    pub fn get(&self, row: usize, col: usize) -> T {
        self.data[row * self.cols + col]
    }

    /// Row-major view of the buffer.
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    /// Mutable row-major view of the buffer.
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Consumes the matrix, returning its buffer.
    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    /// Copies into an `ndarray` matrix.
    pub fn to_array2(&self) -> Array2<T> {
        Array2::from_shape_fn((self.rows, self.cols), |(i, j)| self.get(i, j))
    }
}

impl<T: Element> From<&Array2<T>> for Matrix<T> {
    fn from(array: &Array2<T>) -> Self {
        let (rows, cols) = array.dim();
        Matrix::from_fn(rows, cols, |i, j| array[[i, j]])
    }
}

/// Where the coordinator obtains a global operand.
#[derive(Debug, Clone)]
pub enum MatrixSource<T> {
    /// Generate uniformly in `[0, 1)` from `seed`.
    Random {
        /// Generator seed.
        seed: u64,
    },
    /// Use the given matrix as-is.
    Provided(Matrix<T>),
}

impl<T: Element> MatrixSource<T> {
    /// Produces the operand, checking its shape against `(rows, cols)`.
    pub fn materialize(&self, rows: usize, cols: usize) -> Result<Matrix<T>> {
        match self {
            MatrixSource::Random { seed } => Ok(Matrix::random(rows, cols, *seed)),
            MatrixSource::Provided(matrix) => {
                if matrix.rows() != rows || matrix.cols() != cols {
                    return Err(dimension_error(format!(
                        "provided operand is {}x{}, job expects {rows}x{cols}",
                        matrix.rows(),
                        matrix.cols()
                    )));
                }
                Ok(matrix.clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_is_reproducible() {
        let a = Matrix::<f64>::random(5, 7, SEED_A);
        let b = Matrix::<f64>::random(5, 7, SEED_A);
        let c = Matrix::<f64>::random(5, 7, SEED_B);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.as_slice().iter().all(|&x| (0.0..1.0).contains(&x)));
    }

    #[test]
    fn test_from_vec_checks_length() {
        assert!(Matrix::from_vec(2, 3, vec![0.0f32; 6]).is_ok());
        assert!(Matrix::from_vec(2, 3, vec![0.0f32; 5])
            .unwrap_err()
            .is_configuration());
    }

    #[test]
    fn test_identity_and_indexing() {
        let eye = Matrix::<f32>::identity(3);
        assert_eq!(eye.get(1, 1), 1.0);
        assert_eq!(eye.get(1, 2), 0.0);
        assert_eq!(eye.as_slice().iter().sum::<f32>(), 3.0);
    }

    #[test]
    fn test_ndarray_round_trip() {
        let m = Matrix::from_fn(2, 3, |i, j| (i * 3 + j) as f64);
        let array = m.to_array2();
        assert_eq!(array[[1, 2]], 5.0);
        assert_eq!(Matrix::from(&array), m);
    }

    #[test]
    fn test_source_shape_check() {
        let provided = MatrixSource::Provided(Matrix::<f64>::zeros(2, 2).unwrap());
        assert!(provided.materialize(2, 2).is_ok());
        assert!(provided.materialize(2, 3).is_err());
    }
}
