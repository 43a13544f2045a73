//! Two-dimensional process grid over a world communicator.
//!
//! A [`ProcessGrid`] arranges `P = p * p` ranks into a `p x p` mesh and derives
//! the two sub-groups every SUMMA round broadcasts over:
//!
//! - the **row group**: all ranks sharing this rank's row, ordered by column,
//!   so a rank's position in it equals its `col`;
//! - the **column group**: all ranks sharing this rank's column, ordered by
//!   row, so a rank's position in it equals its `row`.
//!
//! The grid is built once per job and never mutated.

use std::fmt;

use log::debug;

use crate::comm::Communicator;
use crate::error::{configuration_error, Result};

/// Position of a rank in the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GridCoord {
    /// Grid row.
    pub row: usize,
    /// Grid column.
    pub col: usize,
}

impl fmt::Display for GridCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.row, self.col)
    }
}

/// How world ranks are assigned to grid cells.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum GridPlacement {
    /// `row = rank / p`, `col = rank % p`.
    #[default]
    RowMajor,
    /// `cells[rank]` is the row-major cell index (`row * p + col`) of `rank`.
    Permuted(Vec<usize>),
}

impl GridPlacement {
    fn validate(&self, size: usize) -> Result<()> {
        if let GridPlacement::Permuted(cells) = self {
            if cells.len() != size {
                return Err(configuration_error(format!(
                    "placement lists {} cells for {} ranks",
                    cells.len(),
                    size
                )));
            }
            let mut seen = vec![false; size];
            for &cell in cells {
                if cell >= size || seen[cell] {
                    return Err(configuration_error(format!(
                        "placement is not a permutation of 0..{size}: cell {cell} repeated or out of range"
                    )));
                }
                seen[cell] = true;
            }
        }
        Ok(())
    }

    fn cell_of(&self, rank: usize) -> usize {
        match self {
            GridPlacement::RowMajor => rank,
            GridPlacement::Permuted(cells) => cells[rank],
        }
    }

    fn rank_of(&self, cell: usize) -> usize {
        match self {
            GridPlacement::RowMajor => cell,
            GridPlacement::Permuted(cells) => cells
                .iter()
                .position(|&c| c == cell)
                .unwrap_or(cell),
        }
    }
}

/// Returns `p` when `size == p * p`, `None` otherwise.
pub fn grid_side(size: usize) -> Option<usize> {
    let mut p = (size as f64).sqrt() as usize;
    // Correct for floating-point rounding on either side.
    while p * p > size {
        p -= 1;
    }
    while (p + 1) * (p + 1) <= size {
        p += 1;
    }
    (size > 0 && p * p == size).then_some(p)
}

/// Checks that `size` ranks can form a square grid.
pub fn check_square(size: usize) -> Result<usize> {
    grid_side(size).ok_or_else(|| {
        configuration_error(format!(
            "number of processes ({size}) must form a perfect square grid"
        ))
    })
}

/// Per-rank view of the `p x p` grid.
pub struct ProcessGrid<C: Communicator> {
    side: usize,
    coord: GridCoord,
    placement: GridPlacement,
    world: C,
    row: C,
    col: C,
}

impl<C: Communicator> ProcessGrid<C> {
    /// Builds the grid with row-major rank placement.
    pub fn new(world: C) -> Result<Self> {
        Self::with_placement(world, GridPlacement::RowMajor)
    }

    /// Builds the grid with an explicit rank placement.
    ///
    /// The square check and placement validation run before any communication,
    /// so every rank fails identically on a bad configuration.
    pub fn with_placement(world: C, placement: GridPlacement) -> Result<Self> {
        let side = check_square(world.size())?;
        placement.validate(world.size())?;

        let cell = placement.cell_of(world.rank());
        let coord = GridCoord {
            row: cell / side,
            col: cell % side,
        };

        let row = world.split(coord.row, coord.col)?;
        let col = world.split(coord.col, coord.row)?;

        debug!(
            "rank {} placed at {} (row group rank {}, column group rank {})",
            world.rank(),
            coord,
            row.rank(),
            col.rank()
        );

        Ok(ProcessGrid {
            side,
            coord,
            placement,
            world,
            row,
            col,
        })
    }

    /// Grid side length `p`.
    pub fn side(&self) -> usize {
        self.side
    }

    /// Number of ranks `p * p`.
    pub fn size(&self) -> usize {
        self.side * self.side
    }

    /// This rank's coordinate.
    pub fn coord(&self) -> GridCoord {
        self.coord
    }

    /// World rank sitting at `coord`.
    pub fn rank_at(&self, coord: GridCoord) -> usize {
        self.placement.rank_of(coord.row * self.side + coord.col)
    }

    /// Coordinate of world rank `rank`.
    pub fn coord_of(&self, rank: usize) -> GridCoord {
        let cell = self.placement.cell_of(rank);
        GridCoord {
            row: cell / self.side,
            col: cell % self.side,
        }
    }

    /// World rank of the coordinating process, the one at (0, 0).
    pub fn coordinator(&self) -> usize {
        self.rank_at(GridCoord { row: 0, col: 0 })
    }

    /// Whether this rank is the coordinating process.
    pub fn is_coordinator(&self) -> bool {
        self.coord == GridCoord { row: 0, col: 0 }
    }

    /// Communicator over every rank of the grid.
    pub fn world(&self) -> &C {
        &self.world
    }

    /// Communicator over this rank's grid row; relative rank == column.
    pub fn row_group(&self) -> &C {
        &self.row
    }

    /// Communicator over this rank's grid column; relative rank == row.
    pub fn col_group(&self) -> &C {
        &self.col
    }
}
