//! Distributed dense and sparse matrix multiplication with SUMMA over a
//! `p x p` process grid.

pub mod comm;
pub mod config;
pub mod distribute;
pub mod element;
pub mod error;
pub mod grid;
pub mod job;
pub mod matrix;
pub mod partition;
pub mod sparse;
pub mod summa;
pub mod verify;

pub use comm::{ClusterOptions, CommStats, Communicator, LocalCluster, LocalComm, Payload};
#[cfg(feature = "mpi")]
pub use comm::MpiComm;
pub use config::{JobRequest, SummaConfig, DEFAULT_BLOCK_SIZE};
pub use element::Element;
pub use error::{Result, SummaError};
pub use grid::{GridCoord, GridPlacement, ProcessGrid};
pub use job::{launch, launch_sparse, DenseJob, Diagnostics, JobSummary, LaunchOutcome, SparseJob};
pub use matrix::{Matrix, MatrixSource};
pub use sparse::{CsrMatrix, SparseSource};
pub use summa::Stationary;
pub use verify::VerificationReport;
