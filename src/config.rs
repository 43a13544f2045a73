//! Job parameters and their broadcast wire form.
//!
//! The coordinator builds a [`JobRequest`] from whatever front end it has (the
//! CLI, a test) and broadcasts it as a fixed array of scalars before any matrix
//! data moves. Every rank then derives the same [`SummaConfig`] with
//! [`JobRequest::validate`], so a bad request fails identically everywhere.

use crate::comm::Communicator;
use crate::error::{configuration_error, Result};
use crate::grid::check_square;
use crate::partition::BlockShape;
use crate::summa::Stationary;

/// Default inner tiling of the local block kernel.
pub const DEFAULT_BLOCK_SIZE: usize = 32;

const WIRE_LEN: usize = 6;

/// Unvalidated job parameters as parsed on the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobRequest {
    /// Rows of `A` and `C`.
    pub m: usize,
    /// Columns of `B` and `C`.
    pub n: usize,
    /// Columns of `A`, rows of `B`.
    pub k: usize,
    /// Inner tiling of the local kernel.
    pub block_size: usize,
    /// Variant selector, `'A'` or `'B'` (any case).
    pub stationary: char,
    /// Print per-rank detail.
    pub verbose: bool,
}

impl Default for JobRequest {
    fn default() -> Self {
        JobRequest {
            m: 0,
            n: 0,
            k: 0,
            block_size: DEFAULT_BLOCK_SIZE,
            stationary: 'A',
            verbose: false,
        }
    }
}

impl JobRequest {
    /// Convenience constructor for an `m x k` by `k x n` job.
    pub fn new(m: usize, n: usize, k: usize, stationary: Stationary) -> Self {
        JobRequest {
            m,
            n,
            k,
            stationary: stationary.as_char(),
            ..JobRequest::default()
        }
    }

    /// Scalar wire form: `[m, n, k, block_size, stationary, verbose]`.
    pub fn to_wire(&self) -> [u64; WIRE_LEN] {
        [
            self.m as u64,
            self.n as u64,
            self.k as u64,
            self.block_size as u64,
            self.stationary as u64,
            self.verbose as u64,
        ]
    }

    /// Inverse of [`to_wire`](Self::to_wire).
    pub fn from_wire(wire: &[u64; WIRE_LEN]) -> Self {
        JobRequest {
            m: wire[0] as usize,
            n: wire[1] as usize,
            k: wire[2] as usize,
            block_size: wire[3] as usize,
            stationary: char::from_u32(wire[4] as u32).unwrap_or('\0'),
            verbose: wire[5] != 0,
        }
    }

    /// Broadcasts the request from world rank `root`.
    ///
    /// `request` is only read on the root; every rank returns the root's copy.
    pub fn broadcast<C: Communicator>(request: Option<&JobRequest>, world: &C, root: usize) -> Result<JobRequest> {
        let mut wire = [0u64; WIRE_LEN];
        if world.rank() == root {
            let request = request.ok_or_else(|| configuration_error("root has no job request to broadcast"))?;
            wire = request.to_wire();
        }
        world.broadcast_into(root, &mut wire)?;
        Ok(JobRequest::from_wire(&wire))
    }

    /// Validates the request for a world of `nprocs` ranks.
    ///
    /// Checks run in a fixed order (process count, variant, block size,
    /// dimensions) so every rank reports the same first failure.
    pub fn validate(&self, nprocs: usize) -> Result<SummaConfig> {
        let side = check_square(nprocs)?;
        let stationary = Stationary::from_char(self.stationary)?;
        if self.block_size == 0 {
            return Err(configuration_error("block size must be positive"));
        }
        let shape = BlockShape::new(self.m, self.n, self.k, side)?;
        Ok(SummaConfig {
            m: self.m,
            n: self.n,
            k: self.k,
            block_size: self.block_size,
            stationary,
            verbose: self.verbose,
            side,
            shape,
        })
    }
}

/// Validated job configuration, identical on every rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SummaConfig {
    /// Rows of `A` and `C`.
    pub m: usize,
    /// Columns of `B` and `C`.
    pub n: usize,
    /// Columns of `A`, rows of `B`.
    pub k: usize,
    /// Inner tiling of the local kernel.
    pub block_size: usize,
    /// Selected variant.
    pub stationary: Stationary,
    /// Print per-rank detail.
    pub verbose: bool,
    /// Grid side `p`.
    pub side: usize,
    /// Per-rank block extents.
    pub shape: BlockShape,
}

impl SummaConfig {
    /// Floating-point operations of the full product, `2 * m * n * k`.
    pub fn flops(&self) -> f64 {
        2.0 * self.m as f64 * self.n as f64 * self.k as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_round_trip() {
        let request = JobRequest {
            m: 8,
            n: 4,
            k: 12,
            block_size: 16,
            stationary: 'b',
            verbose: true,
        };
        assert_eq!(JobRequest::from_wire(&request.to_wire()), request);
    }

    #[test]
    fn test_validate_accepts_divisible() {
        let config = JobRequest::new(8, 4, 12, Stationary::B).validate(4).unwrap();
        assert_eq!(config.side, 2);
        assert_eq!(config.stationary, Stationary::B);
        assert_eq!(config.shape.c_tile(), (4, 2));
        assert_eq!(config.flops(), 768.0);
    }

    #[test]
    fn test_validate_order() {
        // Bad process count wins over a bad variant.
        let mut request = JobRequest::new(4, 4, 4, Stationary::A);
        request.stationary = 'z';
        let err = request.validate(3).unwrap_err();
        assert!(format!("{err}").contains("perfect square"));

        let err = request.validate(4).unwrap_err();
        assert!(format!("{err}").contains("unknown stationary option"));

        let err = JobRequest::new(6, 4, 4, Stationary::A).validate(16).unwrap_err();
        assert!(format!("{err}").contains("divisible by grid size (4)"));
    }

    #[test]
    fn test_zero_block_size_rejected() {
        let mut request = JobRequest::new(4, 4, 4, Stationary::A);
        request.block_size = 0;
        assert!(request.validate(1).unwrap_err().is_configuration());
    }
}
