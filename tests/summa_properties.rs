//! End-to-end properties of dense SUMMA jobs.
//!
//! Every test launches a full job on an in-process cluster and compares the
//! gathered product with a sequential reference.

use summagrid::job::{launch, DenseJob};
use summagrid::verify::{reference_matmul, reference_matmul_chunked};
use summagrid::{ClusterOptions, GridPlacement, JobRequest, Matrix, MatrixSource, Stationary};

fn run_dense(
    nprocs: usize,
    variant: Stationary,
    a: &Matrix<f64>,
    b: &Matrix<f64>,
    placement: GridPlacement,
) -> Matrix<f64> {
    let (m, k, n) = (a.rows(), a.cols(), b.cols());
    let job = DenseJob {
        a: MatrixSource::Provided(a.clone()),
        b: MatrixSource::Provided(b.clone()),
        placement,
        keep_result: true,
        ..DenseJob::default()
    };
    let outcome = launch(nprocs, ClusterOptions::default(), JobRequest::new(m, n, k, variant), &job)
        .expect("cluster starts");
    assert_eq!(outcome.exit_codes(), vec![0; nprocs], "{:?}", outcome.first_error());
    let summary = outcome.coordinator().expect("coordinator summary");
    assert!(summary.report.as_ref().unwrap().passed());
    summary.result.clone().expect("result kept")
}

/// Both variants follow the k-chunked summation order on grids up to 4x4.
#[test]
fn test_both_variants_match_reference_on_every_grid() {
    for p in 1..=4usize {
        let (m, n, k) = (3 * p, 2 * p, 4 * p);
        let a = Matrix::<f64>::random(m, k, 42);
        let b = Matrix::<f64>::random(k, n, 142);
        let reference = reference_matmul(&a, &b).unwrap();
        let chunked = reference_matmul_chunked(&a, &b, p).unwrap();

        for variant in [Stationary::A, Stationary::B] {
            let c = run_dense(p * p, variant, &a, &b, GridPlacement::RowMajor);
            println!("p={p} {variant}: max |c - ref| = {:e}", max_abs_diff(&c, &reference));
            assert!(max_abs_diff(&c, &reference) <= 1e-5);
            assert_eq!(c, chunked, "p={p} {variant} must follow the chunked summation order");
        }
    }
}

/// The identity on the left returns B unchanged.
#[test]
fn test_identity_times_b_is_b() {
    let a = Matrix::<f64>::identity(4);
    let b = Matrix::from_fn(4, 4, |i, j| (i * 4 + j + 1) as f64);
    for variant in [Stationary::A, Stationary::B] {
        let c = run_dense(4, variant, &a, &b, GridPlacement::RowMajor);
        assert_eq!(c, b, "{variant}");
    }
}

/// A ones matrix times a column vector on a single rank.
#[test]
fn test_ones_times_column_vector() {
    let a = Matrix::from_fn(4, 4, |_, _| 1.0f64);
    let b = Matrix::from_vec(4, 1, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
    for variant in [Stationary::A, Stationary::B] {
        let c = run_dense(1, variant, &a, &b, GridPlacement::RowMajor);
        assert_eq!(c.as_slice(), &[10.0; 4]);
    }
}

/// One rank reproduces the sequential reference bit for bit.
#[test]
fn test_single_process_equals_sequential_exactly() {
    let a = Matrix::<f64>::random(17, 9, 7);
    let b = Matrix::<f64>::random(9, 13, 8);
    let reference = reference_matmul(&a, &b).unwrap();
    for variant in [Stationary::A, Stationary::B] {
        let c = run_dense(1, variant, &a, &b, GridPlacement::RowMajor);
        assert_eq!(c, reference);
    }
}

/// A permuted rank placement does not change the product.
#[test]
fn test_relabelled_grid_gives_same_result() {
    let a = Matrix::<f64>::random(6, 9, 1);
    let b = Matrix::<f64>::random(9, 3, 2);
    let permuted = GridPlacement::Permuted(vec![4, 7, 2, 0, 8, 1, 5, 3, 6]);
    for variant in [Stationary::A, Stationary::B] {
        let row_major = run_dense(9, variant, &a, &b, GridPlacement::RowMajor);
        let relabelled = run_dense(9, variant, &a, &b, permuted.clone());
        assert_eq!(row_major, relabelled, "{variant}");
    }
}

/// The local kernel's inner tile is invisible in the result.
#[test]
fn test_block_size_does_not_change_result() {
    let a = Matrix::<f64>::random(8, 8, 11);
    let b = Matrix::<f64>::random(8, 8, 12);
    let mut results = Vec::new();
    for block_size in [1, 3, 32] {
        let job = DenseJob {
            a: MatrixSource::Provided(a.clone()),
            b: MatrixSource::Provided(b.clone()),
            keep_result: true,
            ..DenseJob::default()
        };
        let mut request = JobRequest::new(8, 8, 8, Stationary::B);
        request.block_size = block_size;
        let outcome = launch(4, ClusterOptions::default(), request, &job).unwrap();
        results.push(outcome.coordinator().unwrap().result.clone().unwrap());
    }
    assert_eq!(results[0], results[1]);
    assert_eq!(results[1], results[2]);
}

/// A small seeded single-precision job verifies.
#[test]
fn test_seeded_job_in_single_precision() {
    let request = JobRequest::new(16, 16, 16, Stationary::A);
    let outcome = launch::<f32>(4, ClusterOptions::default(), request, &DenseJob::default()).unwrap();
    assert!(outcome.succeeded());
    let report = outcome.coordinator().unwrap().report.as_ref().unwrap();
    assert_eq!(report.total, 256);
    println!("{report}");
}

/// Single precision with a long inner dimension stays within tolerance.
#[test]
fn test_single_precision_large_inner_dimension() {
    for variant in [Stationary::A, Stationary::B] {
        let request = JobRequest::new(256, 256, 256, variant);
        let outcome = launch::<f32>(4, ClusterOptions::default(), request, &DenseJob::default()).unwrap();
        let report = outcome.coordinator().unwrap().report.as_ref().unwrap();
        println!("{variant}: max error {:e}", report.max_error);
        assert_eq!(report.mismatches, 0, "{report}");
        assert!(outcome.succeeded());
    }
}

fn max_abs_diff(x: &Matrix<f64>, y: &Matrix<f64>) -> f64 {
    x.as_slice()
        .iter()
        .zip(y.as_slice())
        .map(|(a, b)| (a - b).abs())
        .fold(0.0, f64::max)
}
