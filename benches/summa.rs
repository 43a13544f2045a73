//! SUMMA benchmark across grid sizes and variants.
//!
//! # Usage:
//! ```bash
//! # Run every group
//! cargo bench --bench summa
//!
//! # Only the local block kernel
//! cargo bench --bench summa -- local_kernel
//! ```

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use summagrid::job::{launch, DenseJob};
use summagrid::summa::matmul_accumulate;
use summagrid::{ClusterOptions, JobRequest, Matrix, Stationary};

/// Local kernel alone, sweeping the inner tile size
fn bench_local_kernel(c: &mut Criterion) {
    let (m, k, n) = (256, 256, 256);
    let a = Matrix::<f64>::random(m, k, 42);
    let b = Matrix::<f64>::random(k, n, 142);
    let mut out = vec![0.0; m * n];

    let mut group = c.benchmark_group("local_kernel");
    group.throughput(Throughput::Elements((2 * m * n * k) as u64));
    for block_size in [16, 32, 64, 256] {
        group.bench_with_input(BenchmarkId::from_parameter(block_size), &block_size, |bench, &bs| {
            bench.iter(|| {
                out.fill(0.0);
                matmul_accumulate(a.as_slice(), b.as_slice(), &mut out, m, k, n, bs);
                black_box(&out);
            })
        });
    }
    group.finish();
}

/// End-to-end job (distribute, rounds, gather, verify) on 1, 4 and 9 ranks
fn bench_summa_grid(c: &mut Criterion) {
    let dim = 192;
    for variant in [Stationary::A, Stationary::B] {
        let mut group = c.benchmark_group(format!("summa_{}x{}x{}_{}", dim, dim, dim, variant.as_char()));
        group.sample_size(10);
        for nprocs in [1usize, 4, 9] {
            let job = DenseJob::<f64>::default();
            let request = JobRequest::new(dim, dim, dim, variant);
            group.bench_with_input(BenchmarkId::new("ranks", nprocs), &nprocs, |bench, &np| {
                bench.iter(|| {
                    let outcome = launch(np, ClusterOptions::default(), request, &job)
                        .expect("cluster starts");
                    black_box(outcome.succeeded())
                })
            });
        }
        group.finish();
    }
}

criterion_group!(benches, bench_local_kernel, bench_summa_grid);
criterion_main!(benches);
