//! Property tests for block extents, shapes and tile layouts.

use proptest::prelude::*;

use summagrid::partition::{extents, BlockShape, TileLayout};

proptest! {
    /// Divisible dimensions split into equal extents.
    #[test]
    fn prop_divisible_extents_are_equal_and_cover(p in 1usize..=8, blocks in 1usize..=64) {
        let d = p * blocks;
        let parts = extents(d, p);
        prop_assert_eq!(parts.len(), p);
        prop_assert_eq!(parts.iter().sum::<usize>(), d);
        prop_assert!(parts.iter().all(|&e| e == d / p));
    }

    /// Extents cover the dimension for any split.
    #[test]
    fn prop_extents_always_sum(d in 0usize..1000, p in 1usize..=16) {
        prop_assert_eq!(extents(d, p).iter().sum::<usize>(), d);
    }

    /// Tile shapes are the dimensions over the grid side.
    #[test]
    fn prop_block_shape_matches_division(p in 1usize..=6, bm in 1usize..=16, bn in 1usize..=16, bk in 1usize..=16) {
        let shape = BlockShape::new(bm * p, bn * p, bk * p, p).unwrap();
        prop_assert_eq!(shape.c_tile(), (bm, bn));
        prop_assert_eq!(shape.a_tile(), (bm, bk));
        prop_assert_eq!(shape.b_tile(), (bk, bn));
    }

    /// A dimension the grid side does not divide is a configuration error.
    #[test]
    fn prop_non_divisible_rejected(p in 2usize..=6, bm in 1usize..=16, r in 1usize..6) {
        prop_assume!(r % p != 0);
        let m = bm * p + r;
        prop_assert!(BlockShape::new(m, p, p, p).unwrap_err().is_configuration());
    }

    /// Tile spans hit every element of the buffer exactly once.
    #[test]
    fn prop_tiles_partition_the_buffer(p in 1usize..=5, br in 1usize..=6, bc in 1usize..=6) {
        let (rows, cols) = (br * p, bc * p);
        let layout = TileLayout::new(rows, cols, br, bc, p).unwrap();
        let mut hits = vec![0u8; rows * cols];
        for i in 0..p {
            for j in 0..p {
                let span = layout.span(i, j);
                prop_assert_eq!(span.stride, cols);
                for r in 0..span.rows {
                    for idx in span.row_range(r) {
                        hits[idx] += 1;
                    }
                }
            }
        }
        prop_assert!(hits.iter().all(|&h| h == 1));
    }
}

/// Span offsets and strides of a small layout.
#[test]
fn test_span_offsets() {
    let layout = TileLayout::new(4, 6, 2, 3, 2).unwrap();
    assert_eq!(layout.span(0, 0).offset, 0);
    assert_eq!(layout.span(0, 1).offset, 3);
    assert_eq!(layout.span(1, 0).offset, 12);
    assert_eq!(layout.span(1, 1).offset, 15);
    assert_eq!(layout.span(1, 1).row_range(1), 21..24);
}
