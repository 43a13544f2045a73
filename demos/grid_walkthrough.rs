//! Walks through one small stationary-B job rank by rank.
//!
//! ```bash
//! RUST_LOG=debug cargo run --example grid_walkthrough
//! ```

use summagrid::distribute::{distribute_with, gather, TilePlacement};
use summagrid::summa::summa;
use summagrid::{ClusterOptions, JobRequest, LocalCluster, Matrix, ProcessGrid, Stationary};

fn main() -> summagrid::Result<()> {
    env_logger::init();

    let (m, n, k) = (4, 4, 4);
    let config = JobRequest::new(m, n, k, Stationary::B).validate(4)?;
    let shape = config.shape;

    let a = Matrix::<f64>::identity(4);
    let b = Matrix::from_fn(4, 4, |i, j| (i * 4 + j + 1) as f64);

    let results = LocalCluster::run(4, ClusterOptions::default(), |comm| {
        let grid = ProcessGrid::new(comm)?;
        let root = grid.is_coordinator();

        let a_local = distribute_with(
            root.then_some(&a),
            m,
            k,
            shape.block_m,
            shape.block_k,
            TilePlacement::Transposed,
            &grid,
        )?;
        let b_local = distribute_with(
            root.then_some(&b),
            k,
            n,
            shape.block_k,
            shape.block_n,
            TilePlacement::Direct,
            &grid,
        )?;
        println!(
            "rank at {} holds A tile {:?} and B tile {:?}",
            grid.coord(),
            a_local.as_slice(),
            b_local.as_slice()
        );

        let c_local = summa(config.stationary, &a_local, &b_local, &shape, config.block_size, &grid)?;
        println!("rank at {} computed C tile {:?}", grid.coord(), c_local.as_slice());
        gather(&c_local, m, n, &grid)
    })?;

    for c in results.into_iter().flatten().flatten() {
        println!("gathered C:");
        for row in c.as_slice().chunks(n) {
            println!("  {row:?}");
        }
        assert_eq!(c, b);
    }
    Ok(())
}
