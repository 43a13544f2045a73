//! Sequential reference products and element-wise verification.
//!
//! [`verify`] always scans the whole result and never mutates its inputs;
//! mismatches are reported as statistics, not errors. [`verify_fast`] is the
//! early-exit check that stops at the first out-of-tolerance element.
//!
//! An element is out of tolerance when `|actual - expected|` exceeds
//! `tolerance * max(1, |expected|)`: absolute near zero, relative for large
//! entries, whose rounding error grows with their magnitude.

use std::fmt;

use crate::element::Element;
use crate::error::{dimension_error, Result};
use crate::matrix::Matrix;

/// Number of individual mismatches kept for display.
pub const REPORTED_MISMATCHES: usize = 5;

/// Whether `error` against the reference value `expected` is out of tolerance.
#[inline]
pub fn out_of_tolerance(error: f64, expected: f64, tolerance: f64) -> bool {
    error.is_nan() || error > tolerance * expected.abs().max(1.0)
}

fn check_operands<T: Element>(a: &Matrix<T>, b: &Matrix<T>) -> Result<()> {
    if a.cols() != b.rows() {
        return Err(dimension_error(format!(
            "cannot multiply {}x{} by {}x{}",
            a.rows(),
            a.cols(),
            b.rows(),
            b.cols()
        )));
    }
    Ok(())
}

/// Sequential `A * B`, summing over `k` in ascending order from zero.
pub fn reference_matmul<T: Element>(a: &Matrix<T>, b: &Matrix<T>) -> Result<Matrix<T>> {
    reference_matmul_chunked(a, b, 1)
}

/// Sequential `A * B` with `k` split into `chunks` equal contiguous chunks.
///
/// Each chunk's partial sum starts from zero and the partials are added in
/// chunk order. This is the summation order of the distributed engine on a
/// grid of side `chunks`, so results compare bit for bit.
pub fn reference_matmul_chunked<T: Element>(
    a: &Matrix<T>,
    b: &Matrix<T>,
    chunks: usize,
) -> Result<Matrix<T>> {
    check_operands(a, b)?;
    let (m, k, n) = (a.rows(), a.cols(), b.cols());
    if chunks == 0 || k % chunks != 0 {
        return Err(dimension_error(format!(
            "inner dimension {k} cannot be split into {chunks} chunks"
        )));
    }
    let chunk = k / chunks;

    let mut c = Matrix::zeros(m, n)?;
    for i in 0..m {
        for j in 0..n {
            let mut total = T::zero();
            for t in 0..chunks {
                let mut partial = T::zero();
                for p in t * chunk..(t + 1) * chunk {
                    partial += a.get(i, p) * b.get(p, j);
                }
                total += partial;
            }
            c.as_mut_slice()[i * n + j] = total;
        }
    }
    Ok(c)
}

/// One out-of-tolerance element.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mismatch {
    /// Row of the element.
    pub row: usize,
    /// Column of the element.
    pub col: usize,
    /// Value in the checked result.
    pub actual: f64,
    /// Value in the reference.
    pub expected: f64,
}

/// Aggregate statistics of a full verification scan.
#[derive(Debug, Clone, PartialEq)]
pub struct VerificationReport {
    /// Elements compared.
    pub total: usize,
    /// Elements outside the magnitude-scaled tolerance.
    pub mismatches: usize,
    /// Largest absolute error seen.
    pub max_error: f64,
    /// `(row, col)` of the largest error, `None` if every error was zero.
    pub max_error_at: Option<(usize, usize)>,
    /// Mean absolute error.
    pub avg_error: f64,
    /// Tolerance the scan used.
    pub tolerance: f64,
    /// The first few mismatches in row-major order.
    pub first_mismatches: Vec<Mismatch>,
}

impl VerificationReport {
    /// Whether every element is within tolerance.
    pub fn passed(&self) -> bool {
        self.mismatches == 0
    }

    /// Mismatching elements as a percentage of all elements.
    pub fn mismatch_percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            100.0 * self.mismatches as f64 / self.total as f64
        }
    }
}

impl fmt::Display for VerificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for m in &self.first_mismatches {
            writeln!(
                f,
                "Error at position [{},{}]: C_global={:.6}, C_ref={:.6}, diff={:.6}",
                m.row,
                m.col,
                m.actual,
                m.expected,
                (m.actual - m.expected).abs()
            )?;
        }
        writeln!(f, "Verification Results:")?;
        writeln!(f, "  Total Elements: {}", self.total)?;
        writeln!(
            f,
            "  Errors: {} ({:.2}%)",
            self.mismatches,
            self.mismatch_percent()
        )?;
        match self.max_error_at {
            Some((i, j)) => writeln!(f, "  Max Error: {:e} at position [{i},{j}]", self.max_error)?,
            None => writeln!(f, "  Max Error: {:e}", self.max_error)?,
        }
        write!(f, "  Average Error: {:e}", self.avg_error)
    }
}

/// Compares two equally shaped matrices element-wise.
pub fn compare<T: Element>(actual: &Matrix<T>, expected: &Matrix<T>, tolerance: f64) -> Result<VerificationReport> {
    if actual.rows() != expected.rows() || actual.cols() != expected.cols() {
        return Err(dimension_error(format!(
            "result is {}x{}, reference is {}x{}",
            actual.rows(),
            actual.cols(),
            expected.rows(),
            expected.cols()
        )));
    }

    let cols = actual.cols();
    let mut report = VerificationReport {
        total: actual.as_slice().len(),
        mismatches: 0,
        max_error: 0.0,
        max_error_at: None,
        avg_error: 0.0,
        tolerance,
        first_mismatches: Vec::new(),
    };

    let mut error_sum = 0.0;
    for (idx, (&got, &want)) in actual.as_slice().iter().zip(expected.as_slice()).enumerate() {
        let (got, want) = (got.to_f64_lossy(), want.to_f64_lossy());
        let error = (got - want).abs();
        error_sum += error;

        if error > report.max_error || (error.is_nan() && !report.max_error.is_nan()) {
            report.max_error = error;
            report.max_error_at = Some((idx / cols, idx % cols));
        }
        if out_of_tolerance(error, want, tolerance) {
            report.mismatches += 1;
            if report.first_mismatches.len() < REPORTED_MISMATCHES {
                report.first_mismatches.push(Mismatch {
                    row: idx / cols,
                    col: idx % cols,
                    actual: got,
                    expected: want,
                });
            }
        }
    }
    if report.total > 0 {
        report.avg_error = error_sum / report.total as f64;
    }
    Ok(report)
}

/// Recomputes `A * B` sequentially and compares it with `c`.
pub fn verify<T: Element>(
    c: &Matrix<T>,
    a: &Matrix<T>,
    b: &Matrix<T>,
    tolerance: f64,
) -> Result<VerificationReport> {
    let reference = reference_matmul(a, b)?;
    compare(c, &reference, tolerance)
}

/// Early-exit check returning the first out-of-tolerance `(row, col)`, if any.
pub fn verify_fast<T: Element>(
    c: &Matrix<T>,
    a: &Matrix<T>,
    b: &Matrix<T>,
    tolerance: f64,
) -> Result<Option<(usize, usize)>> {
    let reference = reference_matmul(a, b)?;
    if c.rows() != reference.rows() || c.cols() != reference.cols() {
        return Err(dimension_error("result shape differs from reference"));
    }
    let cols = c.cols();
    Ok(c
        .as_slice()
        .iter()
        .zip(reference.as_slice())
        .position(|(&got, &want)| {
            let (got, want) = (got.to_f64_lossy(), want.to_f64_lossy());
            out_of_tolerance((got - want).abs(), want, tolerance)
        })
        .map(|idx| (idx / cols, idx % cols)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_small_product() {
        let a = Matrix::from_vec(2, 2, vec![1.0f64, 2.0, 3.0, 4.0]).unwrap();
        let b = Matrix::from_vec(2, 2, vec![5.0f64, 6.0, 7.0, 8.0]).unwrap();
        let c = reference_matmul(&a, &b).unwrap();
        assert_eq!(c.as_slice(), &[19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn test_chunked_reference_rejects_uneven_split() {
        let a = Matrix::<f64>::zeros(2, 3).unwrap();
        let b = Matrix::<f64>::zeros(3, 2).unwrap();
        assert!(reference_matmul_chunked(&a, &b, 2).is_err());
        assert!(reference_matmul_chunked(&a, &b, 3).is_ok());
    }

    #[test]
    fn test_report_statistics() {
        let expected = Matrix::from_vec(2, 2, vec![1.0f64, 1.0, 1.0, 1.0]).unwrap();
        let actual = Matrix::from_vec(2, 2, vec![1.0f64, 1.5, 1.0, 0.0]).unwrap();
        let report = compare(&actual, &expected, 1e-5).unwrap();
        assert_eq!(report.total, 4);
        assert_eq!(report.mismatches, 2);
        assert_eq!(report.mismatch_percent(), 50.0);
        assert_eq!(report.max_error, 1.0);
        assert_eq!(report.max_error_at, Some((1, 1)));
        assert!((report.avg_error - 0.375).abs() < 1e-12);
        assert_eq!(report.first_mismatches.len(), 2);
        assert!(!report.passed());
        assert!(format!("{report}").contains("Errors: 2 (50.00%)"));
    }

    #[test]
    fn test_report_caps_listed_mismatches() {
        let expected = Matrix::<f32>::zeros(4, 4).unwrap();
        let actual = Matrix::from_fn(4, 4, |_, _| 1.0f32);
        let report = compare(&actual, &expected, 1e-5).unwrap();
        assert_eq!(report.mismatches, 16);
        assert_eq!(report.first_mismatches.len(), REPORTED_MISMATCHES);
    }

    #[test]
    fn test_tolerance_scales_with_magnitude() {
        let expected = Matrix::from_vec(1, 3, vec![1000.0f64, 0.5, 0.0]).unwrap();
        let actual = Matrix::from_vec(1, 3, vec![1000.005f64, 0.500009, 2e-5]).unwrap();
        let report = compare(&actual, &expected, 1e-5).unwrap();
        assert_eq!(report.mismatches, 1);
        assert_eq!((report.first_mismatches[0].row, report.first_mismatches[0].col), (0, 2));
        assert!(out_of_tolerance(0.02, 1000.0, 1e-5));
        assert!(!out_of_tolerance(0.009, 1000.0, 1e-5));
    }

    #[test]
    fn test_nan_counts_as_mismatch() {
        let expected = Matrix::<f64>::zeros(1, 2).unwrap();
        let actual = Matrix::from_vec(1, 2, vec![0.0, f64::NAN]).unwrap();
        let report = compare(&actual, &expected, 1e-5).unwrap();
        assert_eq!(report.mismatches, 1);
        assert_eq!(report.max_error_at, Some((0, 1)));
    }

    #[test]
    fn test_verify_fast_stops_at_first() {
        let a = Matrix::<f64>::identity(3);
        let b = Matrix::from_fn(3, 3, |i, j| (i * 3 + j) as f64);
        let mut c = b.clone();
        assert_eq!(verify_fast(&c, &a, &b, 1e-10).unwrap(), None);
        c.as_mut_slice()[5] = -1.0;
        c.as_mut_slice()[7] = -1.0;
        assert_eq!(verify_fast(&c, &a, &b, 1e-10).unwrap(), Some((1, 2)));
    }

    #[test]
    fn test_verify_leaves_inputs_untouched() {
        let a = Matrix::<f64>::random(3, 4, 1);
        let b = Matrix::<f64>::random(4, 2, 2);
        let c = reference_matmul(&a, &b).unwrap();
        let (a0, b0, c0) = (a.clone(), b.clone(), c.clone());
        let report = verify(&c, &a, &b, 1e-10).unwrap();
        assert!(report.passed());
        assert_eq!((a, b, c), (a0, b0, c0));
    }
}
