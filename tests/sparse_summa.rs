//! Sparse-times-dense SUMMA jobs checked against the sequential CSR product.

use std::io::Write;

use summagrid::job::{launch_sparse, SparseJob};
use summagrid::sparse::{csr_spmm, read_matrix_market, CsrMatrix, SparseSource};
use summagrid::{ClusterOptions, JobRequest, Matrix, MatrixSource, Stationary};

fn run_sparse(nprocs: usize, variant: Stationary, a: &CsrMatrix<f64>, b: &Matrix<f64>) -> Matrix<f64> {
    let job = SparseJob {
        a: SparseSource::Provided(a.clone()),
        b: MatrixSource::Provided(b.clone()),
        keep_result: true,
        ..SparseJob::default()
    };
    let request = JobRequest::new(a.rows(), b.cols(), a.cols(), variant);
    let outcome = launch_sparse(nprocs, ClusterOptions::default(), request, &job).unwrap();
    assert_eq!(outcome.exit_codes(), vec![0; nprocs], "{:?}", outcome.first_error());
    let summary = outcome.coordinator().unwrap();
    assert!(summary.report.as_ref().unwrap().passed());
    summary.result.clone().unwrap()
}

/// Both variants agree with `csr_spmm` on grids up to 3x3.
#[test]
fn test_sparse_summa_matches_spmm_reference() {
    for p in 1..=3usize {
        let (m, n, k) = (4 * p, 3 * p, 5 * p);
        let a = CsrMatrix::<f64>::random(m, k, 0.1, 42).unwrap();
        let b = Matrix::<f64>::random(k, n, 142);
        let reference = csr_spmm(&a, &b).unwrap();
        for variant in [Stationary::A, Stationary::B] {
            let c = run_sparse(p * p, variant, &a, &b);
            let max = c
                .as_slice()
                .iter()
                .zip(reference.as_slice())
                .map(|(x, y)| (x - y).abs())
                .fold(0.0, f64::max);
            println!("p={p} {variant}: nnz={} max error {max:e}", a.nnz());
            assert!(max <= 1e-10);
        }
    }
}

/// A sparse identity returns B.
#[test]
fn test_sparse_identity_reproduces_b() {
    let a = CsrMatrix::from_dense(&Matrix::<f64>::identity(6));
    let b = Matrix::from_fn(6, 6, |i, j| (i * 6 + j) as f64);
    for variant in [Stationary::A, Stationary::B] {
        assert_eq!(run_sparse(4, variant, &a, &b), b);
        assert_eq!(run_sparse(9, variant, &a, &b), b);
    }
}

/// Tiles with no stored entries contribute zeros.
#[test]
fn test_empty_tiles_are_handled() {
    // Only the top-left tile of A holds entries on a 3x3 grid.
    let a = CsrMatrix::from_triplets(6, 6, vec![(0, 0, 2.0f64), (1, 1, 3.0)]).unwrap();
    let b = Matrix::from_fn(6, 3, |_, _| 1.0f64);
    let c = run_sparse(9, Stationary::B, &a, &b);
    assert_eq!(&c.as_slice()[..6], &[2.0, 2.0, 2.0, 3.0, 3.0, 3.0]);
    assert!(c.as_slice()[6..].iter().all(|&x| x == 0.0));
}

/// A job reads its sparse operand from a Matrix Market file.
#[test]
fn test_matrix_market_input() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "%%MatrixMarket matrix coordinate real symmetric").unwrap();
    writeln!(file, "% small symmetric test matrix").unwrap();
    writeln!(file, "4 4 4").unwrap();
    writeln!(file, "1 1 4.0").unwrap();
    writeln!(file, "2 1 -1.0").unwrap();
    writeln!(file, "3 2 -1.0").unwrap();
    writeln!(file, "4 4 2.5").unwrap();
    let a = read_matrix_market::<f64>(file.path()).unwrap();
    assert_eq!(a.nnz(), 6);

    let job = SparseJob {
        a: SparseSource::MatrixMarket(file.path().to_path_buf()),
        keep_result: true,
        ..SparseJob::default()
    };
    let outcome = launch_sparse::<f64>(4, ClusterOptions::default(), JobRequest::new(4, 2, 4, Stationary::A), &job).unwrap();
    assert!(outcome.succeeded(), "{:?}", outcome.first_error());
    let b = Matrix::<f64>::random(4, 2, summagrid::matrix::SEED_B);
    let expected = csr_spmm(&a, &b).unwrap();
    let c = outcome.coordinator().unwrap().result.as_ref().unwrap();
    for (x, y) in c.as_slice().iter().zip(expected.as_slice()) {
        assert!((x - y).abs() <= 1e-10);
    }
}
