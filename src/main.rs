use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use log::{error, info};

use summagrid::job::{launch, launch_sparse, DenseJob, JobSummary, LaunchOutcome, SparseJob};
use summagrid::sparse::{read_matrix_market, SparseSource};
use summagrid::{ClusterOptions, JobRequest, DEFAULT_BLOCK_SIZE};

/// Distributed SUMMA matrix multiplication on a grid of ranks
#[derive(Parser, Debug)]
#[command(name = "summagrid", version, about)]
struct Cli {
    /// Number of ranks; must be a perfect square
    #[arg(short = 'p', long, default_value_t = 4)]
    procs: usize,

    /// Rows of A and C
    #[arg(short, default_value_t = 512)]
    m: usize,

    /// Columns of B and C
    #[arg(short, default_value_t = 512)]
    n: usize,

    /// Columns of A, rows of B
    #[arg(short, default_value_t = 512)]
    k: usize,

    /// Inner tiling of the local block kernel
    #[arg(short = 'b', long, default_value_t = DEFAULT_BLOCK_SIZE)]
    block_size: usize,

    /// Stationary operand, 'A' or 'B'
    #[arg(short = 's', long, default_value_t = 'A')]
    stationary: char,

    /// Per-rank detail and debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Abort the job if a rank waits longer than this many seconds in total
    #[arg(long, env = "SUMMAGRID_TIMEOUT")]
    timeout: Option<u64>,

    /// Multiply a sparse (CSR) A by a dense B
    #[arg(long)]
    sparse: bool,

    /// Fraction of stored entries of a generated sparse A
    #[arg(long, default_value_t = 0.01, requires = "sparse")]
    density: f64,

    /// Read the sparse A from a Matrix Market file; overrides -m and -k
    #[arg(long, requires = "sparse")]
    file: Option<PathBuf>,

    /// One rank per process under mpirun; --procs and --timeout are ignored
    #[cfg(feature = "mpi")]
    #[arg(long)]
    mpi: bool,
}

enum Job {
    Dense(DenseJob<f64>),
    Sparse(SparseJob<f64>),
}

fn print_summary(summary: &JobSummary<f64>) {
    let config = &summary.config;
    println!(
        "Matrix dimensions: A({}x{}) B({}x{}) C({}x{})",
        config.m, config.k, config.k, config.n, config.m, config.n
    );
    println!("Process grid: {}x{}", config.side, config.side);
    println!("Algorithm: {}", config.stationary);
    println!("Block size: {}", config.block_size);
    println!("SUMMA computation time: {:.6} seconds", summary.elapsed.as_secs_f64());
    println!("Performance: {:.2} GFLOP/s", summary.gflops());
    println!(
        "Coordinator traffic: {} messages, {} bytes, {:.6} seconds in communication",
        summary.comm.messages_sent,
        summary.comm.bytes_sent,
        summary.comm.comm_time.as_secs_f64()
    );
    if let Some(report) = &summary.report {
        println!("{report}");
        println!(
            "Verification {}",
            if report.passed() { "PASSED" } else { "FAILED" }
        );
    }
}

fn print_outcome(outcome: &LaunchOutcome<f64>) {
    if let Some(summary) = outcome.coordinator() {
        print_summary(summary);
    }
}

/// Runs this process's rank of an `mpirun`-launched job.
#[cfg(feature = "mpi")]
fn run_mpi(request: JobRequest, job: &Job) -> ExitCode {
    use summagrid::job::{run_rank, run_sparse_rank, Diagnostics, CONFIG_ROOT};
    use summagrid::{Communicator, MpiComm};

    let Some(universe) = mpi::initialize() else {
        error!("MPI was already initialised");
        return ExitCode::FAILURE;
    };
    let world = MpiComm::world(universe.world());
    let request = (world.rank() == CONFIG_ROOT).then_some(&request);
    let diagnostics = Diagnostics::default();
    let outcome = match job {
        Job::Dense(job) => run_rank(world, request, job, &diagnostics),
        Job::Sparse(job) => run_sparse_rank(world, request, job, &diagnostics),
    };

    match outcome {
        Ok(summary) => {
            if summary.is_coordinator() {
                print_summary(&summary);
            }
            match &summary.report {
                Some(report) if !report.passed() => ExitCode::FAILURE,
                _ => ExitCode::SUCCESS,
            }
        }
        Err(e) => {
            let code = e.exit_code();
            if !diagnostics.request_rejected() {
                // Peers may still be blocked on this rank.
                MpiComm::world(universe.world()).abort(code);
            }
            ExitCode::from(code as u8)
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let options = ClusterOptions {
        timeout: cli.timeout.map(Duration::from_secs),
    };
    let mut request = JobRequest {
        m: cli.m,
        n: cli.n,
        k: cli.k,
        block_size: cli.block_size,
        stationary: cli.stationary,
        verbose: cli.verbose,
    };

    let job = if cli.sparse {
        let a = match &cli.file {
            Some(path) => match read_matrix_market::<f64>(path) {
                Ok(matrix) => {
                    info!(
                        "read {}x{} matrix with {} entries from {}",
                        matrix.rows(),
                        matrix.cols(),
                        matrix.nnz(),
                        path.display()
                    );
                    request.m = matrix.rows();
                    request.k = matrix.cols();
                    SparseSource::Provided(matrix)
                }
                Err(e) => {
                    error!("{e}");
                    return ExitCode::FAILURE;
                }
            },
            None => SparseSource::Random {
                density: cli.density,
                seed: summagrid::matrix::SEED_A,
            },
        };
        Job::Sparse(SparseJob {
            a,
            ..SparseJob::default()
        })
    } else {
        Job::Dense(DenseJob::default())
    };

    #[cfg(feature = "mpi")]
    {
        if cli.mpi {
            return run_mpi(request, &job);
        }
    }

    let outcome = match &job {
        Job::Sparse(job) => launch_sparse(cli.procs, options, request, job),
        Job::Dense(job) => launch(cli.procs, options, request, job),
    };

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    print_outcome(&outcome);

    let worst = outcome.exit_codes().into_iter().max().unwrap_or(0);
    if worst != 0 {
        ExitCode::from(worst as u8)
    } else if outcome.succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
