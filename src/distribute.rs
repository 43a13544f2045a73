//! Scatter of global matrices into grid tiles and gather of result tiles.
//!
//! Only the coordinating process (grid coordinate `(0, 0)`) holds global
//! matrices, so both directions take or return an `Option<Matrix<T>>` that is
//! `Some` exactly on the coordinator.

use log::debug;

use crate::comm::Communicator;
use crate::element::Element;
use crate::error::{configuration_error, Result};
use crate::grid::{GridCoord, ProcessGrid};
use crate::matrix::{try_zeroed, Matrix};
use crate::partition::TileLayout;

const TAG_TILE: u32 = 100;
const TAG_RESULT_TILE: u32 = 101;

/// Which grid coordinate receives tile `(i, j)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TilePlacement {
    /// Tile `(i, j)` goes to coordinate `(i, j)`.
    #[default]
    Direct,
    /// Tile `(i, j)` goes to coordinate `(j, i)`.
    Transposed,
}

impl TilePlacement {
    /// Grid coordinate that owns tile `(i, j)`.
    pub fn owner(&self, tile: GridCoord) -> GridCoord {
        match self {
            TilePlacement::Direct => tile,
            TilePlacement::Transposed => GridCoord {
                row: tile.col,
                col: tile.row,
            },
        }
    }
}

/// Scatters a `rows x cols` global matrix into `block_rows x block_cols` tiles.
///
/// The coordinator passes `Some(global)` and copies its own tile locally;
/// tile `(i, j)` is sent to the rank at grid coordinate `(i, j)`. Every other
/// rank passes `None` and blocks until its tile arrives.
pub fn distribute<T, C>(
    global: Option<&Matrix<T>>,
    rows: usize,
    cols: usize,
    block_rows: usize,
    block_cols: usize,
    grid: &ProcessGrid<C>,
) -> Result<Matrix<T>>
where
    T: Element,
    C: Communicator,
{
    distribute_with(global, rows, cols, block_rows, block_cols, TilePlacement::Direct, grid)
}

/// [`distribute`] with an explicit tile placement.
pub fn distribute_with<T, C>(
    global: Option<&Matrix<T>>,
    rows: usize,
    cols: usize,
    block_rows: usize,
    block_cols: usize,
    placement: TilePlacement,
    grid: &ProcessGrid<C>,
) -> Result<Matrix<T>>
where
    T: Element,
    C: Communicator,
{
    let layout = TileLayout::new(rows, cols, block_rows, block_cols, grid.side())?;
    let mut local = Matrix::from_vec(
        block_rows,
        block_cols,
        try_zeroed(layout.tile_len(), "local block")?,
    )?;

    match global {
        Some(global) => {
            if !grid.is_coordinator() {
                return Err(configuration_error(format!(
                    "rank at {} holds a global matrix but is not the coordinator",
                    grid.coord()
                )));
            }
            if global.rows() != rows || global.cols() != cols {
                return Err(configuration_error(format!(
                    "global matrix is {}x{}, distribution expects {rows}x{cols}",
                    global.rows(),
                    global.cols()
                )));
            }

            let mut tile = try_zeroed(layout.tile_len(), "transfer tile")?;
            for row in 0..grid.side() {
                for col in 0..grid.side() {
                    let owner = placement.owner(GridCoord { row, col });
                    if owner == grid.coord() {
                        layout.extract(global.as_slice(), row, col, local.as_mut_slice());
                    } else {
                        layout.extract(global.as_slice(), row, col, &mut tile);
                        grid.world().send(grid.rank_at(owner), TAG_TILE, &tile)?;
                    }
                }
            }
            debug!(
                "distributed {rows}x{cols} matrix as {block_rows}x{block_cols} tiles to {} ranks ({placement:?})",
                grid.size()
            );
        }
        None => {
            if grid.is_coordinator() {
                return Err(configuration_error(
                    "coordinator has no global matrix to distribute",
                ));
            }
            grid.world()
                .recv_into(grid.coordinator(), TAG_TILE, local.as_mut_slice())?;
        }
    }

    Ok(local)
}

/// Gathers every rank's tile into a `rows x cols` global matrix on the coordinator.
///
/// Returns `Some(global)` on the coordinator once all `P - 1` peer tiles have
/// been placed at `(row * block_rows, col * block_cols)` of their sender's
/// coordinate, and `None` on every other rank.
pub fn gather<T, C>(
    local: &Matrix<T>,
    rows: usize,
    cols: usize,
    grid: &ProcessGrid<C>,
) -> Result<Option<Matrix<T>>>
where
    T: Element,
    C: Communicator,
{
    let layout = TileLayout::new(rows, cols, local.rows(), local.cols(), grid.side())?;

    if !grid.is_coordinator() {
        grid.world()
            .send(grid.coordinator(), TAG_RESULT_TILE, local.as_slice())?;
        return Ok(None);
    }

    let mut global = Matrix::zeros(rows, cols)?;
    let own = grid.coord();
    layout.place(global.as_mut_slice(), own.row, own.col, local.as_slice());

    let mut tile = try_zeroed(layout.tile_len(), "gather tile")?;
    for rank in (0..grid.size()).filter(|&r| r != grid.coordinator()) {
        grid.world().recv_into(rank, TAG_RESULT_TILE, &mut tile)?;
        let coord = grid.coord_of(rank);
        layout.place(global.as_mut_slice(), coord.row, coord.col, &tile);
    }

    Ok(Some(global))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{ClusterOptions, LocalCluster};
    use crate::grid::GridPlacement;

    #[test]
    fn test_each_rank_receives_its_tile() {
        let results = LocalCluster::run(4, ClusterOptions::default(), |comm| {
            let grid = ProcessGrid::new(comm)?;
            let global = grid
                .is_coordinator()
                .then(|| Matrix::from_fn(4, 4, |i, j| (i * 4 + j) as f64));
            let local = distribute(global.as_ref(), 4, 4, 2, 2, &grid)?;
            Ok(local.into_vec())
        })
        .unwrap();
        assert_eq!(results[0].as_ref().unwrap(), &vec![0.0, 1.0, 4.0, 5.0]);
        assert_eq!(results[1].as_ref().unwrap(), &vec![2.0, 3.0, 6.0, 7.0]);
        assert_eq!(results[2].as_ref().unwrap(), &vec![8.0, 9.0, 12.0, 13.0]);
        assert_eq!(results[3].as_ref().unwrap(), &vec![10.0, 11.0, 14.0, 15.0]);
    }

    #[test]
    fn test_permuted_coordinator_gathers() {
        let placement = GridPlacement::Permuted(vec![1, 0, 3, 2]);
        let results = LocalCluster::run(4, ClusterOptions::default(), |comm| {
            let grid = ProcessGrid::with_placement(comm, placement.clone())?;
            let global = grid
                .is_coordinator()
                .then(|| Matrix::from_fn(2, 6, |i, j| (i * 6 + j) as f32));
            let local = distribute(global.as_ref(), 2, 6, 1, 3, &grid)?;
            let gathered = gather(&local, 2, 6, &grid)?;
            Ok((grid.is_coordinator(), gathered, global))
        })
        .unwrap();
        let (is_coordinator, gathered, original) = results[1].as_ref().unwrap();
        assert!(*is_coordinator);
        assert_eq!(gathered, original);
        assert!(results[0].as_ref().unwrap().1.is_none());
    }

    #[test]
    fn test_transposed_placement() {
        let results = LocalCluster::run(4, ClusterOptions::default(), |comm| {
            let grid = ProcessGrid::new(comm)?;
            let global = grid
                .is_coordinator()
                .then(|| Matrix::from_fn(4, 4, |i, j| (i * 4 + j) as f64));
            let local = distribute_with(global.as_ref(), 4, 4, 2, 2, TilePlacement::Transposed, &grid)?;
            Ok(local.into_vec())
        })
        .unwrap();
        // Rank 1 sits at (0, 1) and owns tile (1, 0).
        assert_eq!(results[1].as_ref().unwrap(), &vec![8.0, 9.0, 12.0, 13.0]);
        assert_eq!(results[2].as_ref().unwrap(), &vec![2.0, 3.0, 6.0, 7.0]);
        assert_eq!(results[3].as_ref().unwrap(), &vec![10.0, 11.0, 14.0, 15.0]);
    }

    #[test]
    fn test_global_on_wrong_rank_is_rejected() {
        let results = LocalCluster::run(1, ClusterOptions::default(), |comm| {
            let grid = ProcessGrid::new(comm)?;
            distribute::<f64, _>(None, 2, 2, 2, 2, &grid).map(|_| ())
        })
        .unwrap();
        assert!(results[0].as_ref().unwrap_err().is_configuration());
    }
}
