//! End-to-end job control flow.
//!
//! Every rank runs the same sequence:
//!
//! 1. receive the [`JobRequest`] broadcast from world rank [`CONFIG_ROOT`];
//! 2. validate it into a [`SummaConfig`], failing identically everywhere;
//! 3. build the [`ProcessGrid`] and let the coordinator materialise `A` and `B`;
//! 4. distribute the operands with the placements the variant needs;
//! 5. run the timed SUMMA section between two barriers;
//! 6. gather `C` on the coordinator, which verifies it.
//!
//! [`launch`] runs this on a fresh [`LocalCluster`] and collects the per-rank
//! outcomes together with the diagnostics it logged. A rejected request is the
//! same on every rank and is logged once, by [`CONFIG_ROOT`]. Any later failure
//! is logged by the rank that raised it, wherever the grid placed that rank.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::{debug, error, info};

use crate::comm::{ClusterOptions, CommStats, Communicator, LocalCluster};
use crate::config::{JobRequest, SummaConfig};
use crate::distribute::{distribute_with, gather, TilePlacement};
use crate::element::Element;
use crate::error::{Result, SummaError};
use crate::grid::{GridCoord, GridPlacement, ProcessGrid};
use crate::matrix::{Matrix, MatrixSource, SEED_A, SEED_B};
use crate::sparse::{distribute_csr, verify_spmm, SparseSource, SPARSE_TOLERANCE};
use crate::summa::summa;
use crate::verify::{verify, VerificationReport};

/// World rank that broadcasts the job request.
pub const CONFIG_ROOT: usize = 0;

/// Inputs of a dense job, read on the coordinator only.
#[derive(Debug, Clone)]
pub struct DenseJob<T> {
    /// Source of the `m x k` operand.
    pub a: MatrixSource<T>,
    /// Source of the `k x n` operand.
    pub b: MatrixSource<T>,
    /// Assignment of world ranks to grid cells.
    pub placement: GridPlacement,
    /// Verification tolerance, relative for references above 1 in magnitude.
    pub tolerance: f64,
    /// Keep the gathered `C` in the coordinator's summary.
    pub keep_result: bool,
}

impl<T: Element> Default for DenseJob<T> {
    fn default() -> Self {
        DenseJob {
            a: MatrixSource::Random { seed: SEED_A },
            b: MatrixSource::Random { seed: SEED_B },
            placement: GridPlacement::RowMajor,
            tolerance: T::DENSE_TOLERANCE.to_f64_lossy(),
            keep_result: false,
        }
    }
}

/// Inputs of a sparse-times-dense job, read on the coordinator only.
#[derive(Debug, Clone)]
pub struct SparseJob<T> {
    /// Source of the sparse `m x k` operand.
    pub a: SparseSource<T>,
    /// Source of the dense `k x n` operand.
    pub b: MatrixSource<T>,
    /// Assignment of world ranks to grid cells.
    pub placement: GridPlacement,
    /// Verification tolerance, relative for references above 1 in magnitude.
    pub tolerance: f64,
    /// Keep the gathered `C` in the coordinator's summary.
    pub keep_result: bool,
}

impl<T: Element> Default for SparseJob<T> {
    fn default() -> Self {
        SparseJob {
            a: SparseSource::Random {
                density: 0.01,
                seed: SEED_A,
            },
            b: MatrixSource::Random { seed: SEED_B },
            placement: GridPlacement::RowMajor,
            tolerance: SPARSE_TOLERANCE,
            keep_result: false,
        }
    }
}

/// What one rank reports after a successful job.
#[derive(Debug, Clone)]
pub struct JobSummary<T> {
    /// Validated configuration.
    pub config: SummaConfig,
    /// This rank's world rank.
    pub world_rank: usize,
    /// This rank's grid coordinate.
    pub coord: GridCoord,
    /// Wall time of the barrier-bracketed SUMMA section.
    pub elapsed: Duration,
    /// Communication during the SUMMA section.
    pub comm: CommStats,
    /// Verification of the gathered result, coordinator only.
    pub report: Option<VerificationReport>,
    /// Gathered result, coordinator only and only when requested.
    pub result: Option<Matrix<T>>,
}

impl<T> JobSummary<T> {
    /// Whether this summary belongs to the coordinator.
    pub fn is_coordinator(&self) -> bool {
        self.report.is_some()
    }

    /// Throughput of the SUMMA section in GFLOP/s.
    pub fn gflops(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.config.flops() / secs / 1e9
        } else {
            0.0
        }
    }
}

/// Error lines reported by the ranks of one job.
///
/// Shared by every rank running in this process.
#[derive(Debug, Default)]
pub struct Diagnostics {
    lines: Mutex<Vec<String>>,
    rejected: AtomicBool,
}

impl Diagnostics {
    fn report(&self, world_rank: usize, e: &SummaError) {
        error!("rank {world_rank}: {e}");
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(e.to_string());
        }
    }

    /// Reports `e` unless it only echoes another rank's failure.
    fn local_failure(&self, world_rank: usize, e: SummaError) -> SummaError {
        if !matches!(e, SummaError::Aborted { .. }) {
            self.report(world_rank, &e);
        }
        e
    }

    /// Whether a rank in this process rejected the job request.
    ///
    /// Every rank rejects an invalid request the same way, so none of them is
    /// left waiting on a peer.
    pub fn request_rejected(&self) -> bool {
        self.rejected.load(Ordering::SeqCst)
    }

    /// Reported lines in reporting order.
    pub fn into_lines(self) -> Vec<String> {
        self.lines.into_inner().unwrap_or_default()
    }
}

/// Receives and validates the request, then runs `body` on the validated job.
fn run_reported<C, R>(
    world: C,
    request: Option<&JobRequest>,
    diagnostics: &Diagnostics,
    body: impl FnOnce(C, SummaConfig) -> Result<R>,
) -> Result<R>
where
    C: Communicator,
{
    let world_rank = world.rank();
    let request = JobRequest::broadcast(request, &world, CONFIG_ROOT)
        .map_err(|e| diagnostics.local_failure(world_rank, e))?;
    let config = match request.validate(world.size()) {
        Ok(config) => config,
        Err(e) => {
            diagnostics.rejected.store(true, Ordering::SeqCst);
            if world_rank == CONFIG_ROOT {
                diagnostics.report(world_rank, &e);
            }
            return Err(e);
        }
    };
    body(world, config).map_err(|e| diagnostics.local_failure(world_rank, e))
}

fn placements(config: &SummaConfig) -> (TilePlacement, TilePlacement) {
    let pick = |transposed: bool| {
        if transposed {
            TilePlacement::Transposed
        } else {
            TilePlacement::Direct
        }
    };
    (
        pick(config.stationary.transposes_a()),
        pick(config.stationary.transposes_b()),
    )
}

fn log_config<C: Communicator>(config: &SummaConfig, grid: &ProcessGrid<C>) {
    if grid.is_coordinator() {
        info!(
            "SUMMA {}: C({}x{}) = A({}x{}) * B({}x{}) on a {}x{} grid, block size {}",
            config.stationary,
            config.m,
            config.n,
            config.m,
            config.k,
            config.k,
            config.n,
            config.side,
            config.side,
            config.block_size
        );
    }
    if config.verbose {
        let (bm, bk, bn) = (config.shape.block_m, config.shape.block_k, config.shape.block_n);
        info!(
            "rank {} at {}: blocks A {bm}x{bk}, B {bk}x{bn}, C {bm}x{bn}",
            grid.world().rank(),
            grid.coord()
        );
    }
}

/// Runs the barrier-bracketed section and returns its duration and traffic.
fn timed<C, R>(grid: &ProcessGrid<C>, section: impl FnOnce() -> Result<R>) -> Result<(R, Duration, CommStats)>
where
    C: Communicator,
{
    grid.world().barrier()?;
    let before = grid.world().stats();
    let start = Instant::now();
    let out = section()?;
    grid.world().barrier()?;
    let elapsed = start.elapsed();
    Ok((out, elapsed, grid.world().stats().since(&before)))
}

/// Runs one rank of a dense job.
///
/// `request` is only read on world rank [`CONFIG_ROOT`]; `job` inputs only on
/// the coordinator. Failures are logged into `diagnostics`.
pub fn run_rank<T, C>(
    world: C,
    request: Option<&JobRequest>,
    job: &DenseJob<T>,
    diagnostics: &Diagnostics,
) -> Result<JobSummary<T>>
where
    T: Element,
    C: Communicator,
{
    run_reported(world, request, diagnostics, |world, config| dense_rank(world, config, job))
}

fn dense_rank<T, C>(world: C, config: SummaConfig, job: &DenseJob<T>) -> Result<JobSummary<T>>
where
    T: Element,
    C: Communicator,
{
    let grid = ProcessGrid::with_placement(world, job.placement.clone())?;
    log_config(&config, &grid);

    let (m, n, k) = (config.m, config.n, config.k);
    let shape = config.shape;
    let (a_place, b_place) = placements(&config);

    let a_global = grid.is_coordinator().then(|| job.a.materialize(m, k)).transpose()?;
    let b_global = grid.is_coordinator().then(|| job.b.materialize(k, n)).transpose()?;

    let a_local = distribute_with(a_global.as_ref(), m, k, shape.block_m, shape.block_k, a_place, &grid)?;
    let b_local = distribute_with(b_global.as_ref(), k, n, shape.block_k, shape.block_n, b_place, &grid)?;

    let (c_local, elapsed, comm) = timed(&grid, || {
        summa(config.stationary, &a_local, &b_local, &shape, config.block_size, &grid)
    })?;
    debug!(
        "rank at {}: {} messages, {} bytes, {:?} in communication",
        grid.coord(),
        comm.messages_sent,
        comm.bytes_sent,
        comm.comm_time
    );

    let c_global = gather(&c_local, m, n, &grid)?;
    let mut summary = JobSummary {
        config,
        world_rank: grid.world().rank(),
        coord: grid.coord(),
        elapsed,
        comm,
        report: None,
        result: None,
    };

    if let (Some(c), Some(a), Some(b)) = (c_global, a_global, b_global) {
        let report = verify(&c, &a, &b, job.tolerance)?;
        info!(
            "verification {}: {} of {} elements outside {:e}",
            if report.passed() { "passed" } else { "FAILED" },
            report.mismatches,
            report.total,
            report.tolerance
        );
        summary.report = Some(report);
        summary.result = job.keep_result.then_some(c);
    }
    Ok(summary)
}

/// Runs one rank of a sparse-times-dense job.
pub fn run_sparse_rank<T, C>(
    world: C,
    request: Option<&JobRequest>,
    job: &SparseJob<T>,
    diagnostics: &Diagnostics,
) -> Result<JobSummary<T>>
where
    T: Element,
    C: Communicator,
{
    run_reported(world, request, diagnostics, |world, config| sparse_rank(world, config, job))
}

fn sparse_rank<T, C>(world: C, config: SummaConfig, job: &SparseJob<T>) -> Result<JobSummary<T>>
where
    T: Element,
    C: Communicator,
{
    let grid = ProcessGrid::with_placement(world, job.placement.clone())?;
    log_config(&config, &grid);

    let (m, n, k) = (config.m, config.n, config.k);
    let shape = config.shape;
    let (a_place, b_place) = placements(&config);

    let a_global = grid.is_coordinator().then(|| job.a.materialize(m, k)).transpose()?;
    if let Some(a) = &a_global {
        info!("sparse A holds {} entries", a.nnz());
    }
    let b_global = grid.is_coordinator().then(|| job.b.materialize(k, n)).transpose()?;

    let a_local = distribute_csr(a_global.as_ref(), m, k, shape.block_m, shape.block_k, a_place, &grid)?;
    let b_local = distribute_with(b_global.as_ref(), k, n, shape.block_k, shape.block_n, b_place, &grid)?;

    let (c_local, elapsed, comm) = timed(&grid, || {
        summa(config.stationary, &a_local, &b_local, &shape, config.block_size, &grid)
    })?;

    let c_global = gather(&c_local, m, n, &grid)?;
    let mut summary = JobSummary {
        config,
        world_rank: grid.world().rank(),
        coord: grid.coord(),
        elapsed,
        comm,
        report: None,
        result: None,
    };

    if let (Some(c), Some(a), Some(b)) = (c_global, a_global, b_global) {
        summary.report = Some(verify_spmm(&c, &a, &b, job.tolerance)?);
        summary.result = job.keep_result.then_some(c);
    }
    Ok(summary)
}

/// Per-rank outcomes of a launched job.
#[derive(Debug)]
pub struct LaunchOutcome<T> {
    /// Outcome of every rank, indexed by world rank.
    pub ranks: Vec<Result<JobSummary<T>>>,
    /// Error messages reported to the user, in reporting order.
    pub diagnostics: Vec<String>,
}

impl<T> LaunchOutcome<T> {
    /// Process-style exit status of every rank: `0` on success, `2` for a
    /// configuration error, `1` for any other failure.
    pub fn exit_codes(&self) -> Vec<i32> {
        self.ranks
            .iter()
            .map(|r| r.as_ref().map_or_else(SummaError::exit_code, |_| 0))
            .collect()
    }

    /// Whether every rank succeeded and the result verified.
    pub fn succeeded(&self) -> bool {
        self.ranks.iter().all(|r| r.is_ok())
            && self
                .coordinator()
                .and_then(|s| s.report.as_ref())
                .is_some_and(VerificationReport::passed)
    }

    /// The coordinator's summary, if it succeeded.
    pub fn coordinator(&self) -> Option<&JobSummary<T>> {
        self.ranks
            .iter()
            .filter_map(|r| r.as_ref().ok())
            .find(|s| s.is_coordinator())
    }

    /// First error in world-rank order, preferring a root cause over an abort.
    pub fn first_error(&self) -> Option<&SummaError> {
        let errors = || self.ranks.iter().filter_map(|r| r.as_ref().err());
        errors()
            .find(|e| !matches!(e, SummaError::Aborted { .. }))
            .or_else(|| errors().next())
    }
}

fn launch_with<T, F>(nprocs: usize, options: ClusterOptions, rank_job: F) -> Result<LaunchOutcome<T>>
where
    T: Element,
    F: Fn(crate::comm::LocalComm, &Diagnostics) -> Result<JobSummary<T>> + Sync,
{
    let diagnostics = Diagnostics::default();
    let ranks = LocalCluster::run(nprocs, options, |comm| rank_job(comm, &diagnostics))?;
    Ok(LaunchOutcome {
        ranks,
        diagnostics: diagnostics.into_lines(),
    })
}

/// Runs a dense job on `nprocs` in-process ranks.
pub fn launch<T: Element>(
    nprocs: usize,
    options: ClusterOptions,
    request: JobRequest,
    job: &DenseJob<T>,
) -> Result<LaunchOutcome<T>> {
    launch_with(nprocs, options, |comm, diagnostics| {
        let request = (comm.rank() == CONFIG_ROOT).then_some(&request);
        run_rank(comm, request, job, diagnostics)
    })
}

/// Runs a sparse-times-dense job on `nprocs` in-process ranks.
pub fn launch_sparse<T: Element>(
    nprocs: usize,
    options: ClusterOptions,
    request: JobRequest,
    job: &SparseJob<T>,
) -> Result<LaunchOutcome<T>> {
    launch_with(nprocs, options, |comm, diagnostics| {
        let request = (comm.rank() == CONFIG_ROOT).then_some(&request);
        run_sparse_rank(comm, request, job, diagnostics)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::summa::Stationary;

    #[test]
    fn test_dense_job_verifies() {
        let request = JobRequest::new(8, 4, 6, Stationary::B);
        let outcome = launch::<f64>(4, ClusterOptions::default(), request, &DenseJob::default()).unwrap();
        assert_eq!(outcome.exit_codes(), vec![0; 4]);
        assert!(outcome.succeeded());
        assert!(outcome.diagnostics.is_empty());
        let coordinator = outcome.coordinator().unwrap();
        assert_eq!(coordinator.world_rank, 0);
        assert!(coordinator.gflops() >= 0.0);
    }

    #[test]
    fn test_non_square_reports_once() {
        let request = JobRequest::new(6, 6, 6, Stationary::A);
        let outcome = launch::<f32>(3, ClusterOptions::default(), request, &DenseJob::default()).unwrap();
        assert_eq!(outcome.exit_codes(), vec![2; 3]);
        assert_eq!(outcome.diagnostics.len(), 1);
        assert!(outcome.diagnostics[0].contains("perfect square"));
    }

    #[test]
    fn test_rejected_request_is_flagged() {
        let diagnostics = Diagnostics::default();
        let request = JobRequest::new(4, 4, 4, Stationary::B);
        let ranks = LocalCluster::run(2, ClusterOptions::default(), |comm| {
            let request = (comm.rank() == CONFIG_ROOT).then_some(&request);
            run_rank(comm, request, &DenseJob::<f64>::default(), &diagnostics)
        })
        .unwrap();
        assert!(ranks.iter().all(|r| r.is_err()));
        assert!(diagnostics.request_rejected());
        assert_eq!(diagnostics.into_lines().len(), 1);
    }

    #[test]
    fn test_failure_after_validation_is_not_flagged() {
        let diagnostics = Diagnostics::default();
        let job = DenseJob {
            b: MatrixSource::Provided(Matrix::<f64>::zeros(3, 3).unwrap()),
            ..DenseJob::default()
        };
        let request = JobRequest::new(2, 2, 2, Stationary::A);
        let ranks = LocalCluster::run(1, ClusterOptions::default(), |comm| {
            run_rank(comm, Some(&request), &job, &diagnostics)
        })
        .unwrap();
        assert!(ranks[0].as_ref().is_err_and(SummaError::is_configuration));
        assert!(!diagnostics.request_rejected());
        let lines = diagnostics.into_lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("provided operand"));
    }

    #[test]
    fn test_sparse_job_verifies() {
        let request = JobRequest::new(6, 3, 9, Stationary::A);
        let job = SparseJob::<f64> {
            a: SparseSource::Random { density: 0.2, seed: 3 },
            ..SparseJob::default()
        };
        let outcome = launch_sparse(9, ClusterOptions::default(), request, &job).unwrap();
        assert!(outcome.succeeded(), "{:?}", outcome.first_error());
    }

    #[test]
    fn test_keep_result() {
        let request = JobRequest::new(2, 2, 2, Stationary::A);
        let job = DenseJob::<f64> {
            keep_result: true,
            ..DenseJob::default()
        };
        let outcome = launch(1, ClusterOptions::default(), request, &job).unwrap();
        let c = outcome.coordinator().unwrap().result.as_ref().unwrap();
        assert_eq!((c.rows(), c.cols()), (2, 2));
    }
}
