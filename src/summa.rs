//! SUMMA broadcast-multiply-accumulate engine.
//!
//! Both variants run `p` rounds over the `p x p` grid. The stationary operand
//! never leaves the rank it was distributed to; the other operand was
//! distributed with transposed tile placement so that in round `t` the block
//! each group needs sits on the group member with index `t`.
//!
//! # Stationary-B
//!
//! Rank `(r, c)` holds `B(r, c)` and `A(c, r)`. In round `t` the rank with
//! column `t` broadcasts its resident `A(t, r)` across its row group. Every
//! member multiplies `A(t, r) x B(r, c)`, a partial of `C(t, c)`, and the
//! column group sums the partials onto its member at row `t`.
//!
//! # Stationary-A
//!
//! Rank `(r, c)` holds `A(r, c)` and `B(c, r)`. In round `t` the rank with row
//! `t` broadcasts its resident `B(c, t)` down its column group. Every member
//! multiplies `A(r, c) x B(c, t)`, a partial of `C(r, t)`, and the row group
//! sums the partials onto its member at column `t`.
//!
//! # Numeric semantics
//!
//! Every `C` block is written in exactly one round. Its value is
//! `sum_t (A_t x B_t)` with the `p` partials added in ascending group order,
//! and each partial summed over its `k` chunk in ascending order. That is the
//! order of [`crate::verify::reference_matmul_chunked`]; for `p = 1` it is the
//! plain sequential order.

use std::fmt;
use std::str::FromStr;

use log::{debug, trace};
use rayon::{
    iter::{IndexedParallelIterator, ParallelIterator},
    slice::ParallelSliceMut,
};

use crate::comm::Communicator;
use crate::element::Element;
use crate::error::{configuration_error, dimension_error, Result};
use crate::grid::ProcessGrid;
use crate::matrix::{try_zeroed, Matrix};
use crate::partition::BlockShape;

/// Multiply-adds per block product above which rows of `C` are split across rayon workers.
pub const PARALLEL_THRESHOLD: usize = 1 << 18;

/// Which operand stays resident on its rank for every round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stationary {
    /// `A` blocks fixed, `B` blocks broadcast down columns.
    A,
    /// `B` blocks fixed, `A` blocks broadcast along rows.
    B,
}

impl Stationary {
    /// Parses the single-character wire form, `'A'`/`'a'` or `'B'`/`'b'`.
    pub fn from_char(c: char) -> Result<Self> {
        match c.to_ascii_uppercase() {
            'A' => Ok(Stationary::A),
            'B' => Ok(Stationary::B),
            other => Err(configuration_error(format!(
                "unknown stationary option '{other}', use 'A' or 'B'"
            ))),
        }
    }

    /// Single-character wire form.
    pub fn as_char(&self) -> char {
        match self {
            Stationary::A => 'A',
            Stationary::B => 'B',
        }
    }

    /// Whether `A` is distributed with transposed tile placement for this variant.
    pub fn transposes_a(&self) -> bool {
        matches!(self, Stationary::B)
    }

    /// Whether `B` is distributed with transposed tile placement for this variant.
    pub fn transposes_b(&self) -> bool {
        matches!(self, Stationary::A)
    }
}

impl fmt::Display for Stationary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Stationary {}", self.as_char())
    }
}

impl FromStr for Stationary {
    type Err = crate::error::SummaError;

    fn from_str(s: &str) -> Result<Self> {
        let mut chars = s.trim().chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Stationary::from_char(c),
            _ => Err(configuration_error(format!(
                "stationary option must be a single character, got '{s}'"
            ))),
        }
    }
}

/// Computes `c += a * b` for row-major blocks, `a` is `m x k`, `b` is `k x n`.
///
/// Loop order is i-k-j with `k` split into tiles of `block_size`; for every
/// output element the products are added in ascending `k`. Rows of `c` are
/// processed in parallel once the product is larger than
/// [`PARALLEL_THRESHOLD`], which does not change any element's summation order.
pub fn matmul_accumulate<T: Element>(
    a: &[T],
    b: &[T],
    c: &mut [T],
    m: usize,
    k: usize,
    n: usize,
    block_size: usize,
) {
    assert_eq!(a.len(), m * k, "a must hold m * k elements");
    assert_eq!(b.len(), k * n, "b must hold k * n elements");
    assert_eq!(c.len(), m * n, "c must hold m * n elements");
    if m == 0 || n == 0 || k == 0 {
        return;
    }
    let kc = block_size.clamp(1, k);

    let row_kernel = |i: usize, c_row: &mut [T]| {
        let a_row = &a[i * k..(i + 1) * k];
        for pc in (0..k).step_by(kc) {
            let k_end = (pc + kc).min(k);
            for (p, &a_ip) in a_row.iter().enumerate().take(k_end).skip(pc) {
                let b_row = &b[p * n..(p + 1) * n];
                for (c_ij, &b_pj) in c_row.iter_mut().zip(b_row) {
                    *c_ij += a_ip * b_pj;
                }
            }
        }
    };

    if m * n * k >= PARALLEL_THRESHOLD {
        c.par_chunks_mut(n)
            .enumerate()
            .for_each(|(i, c_row)| row_kernel(i, c_row));
    } else {
        c.chunks_mut(n)
            .enumerate()
            .for_each(|(i, c_row)| row_kernel(i, c_row));
    }
}

/// Left operand block of a SUMMA product.
///
/// Implemented by dense [`Matrix`] blocks and by CSR blocks
/// ([`crate::sparse::CsrMatrix`]), so both run through the same round loop.
pub trait LeftBlock<T: Element>: Clone {
    /// Block rows.
    fn rows(&self) -> usize;

    /// Block columns.
    fn cols(&self) -> usize;

    /// `out += self * b`, with `b` a row-major `cols() x n` block.
    fn multiply_accumulate(&self, b: &[T], n: usize, out: &mut [T], block_size: usize);

    /// Replaces `self` on every member with the root's block.
    fn broadcast<C: Communicator>(&mut self, comm: &C, root: usize) -> Result<()>;
}

impl<T: Element> LeftBlock<T> for Matrix<T> {
    fn rows(&self) -> usize {
        Matrix::rows(self)
    }

    fn cols(&self) -> usize {
        Matrix::cols(self)
    }

    fn multiply_accumulate(&self, b: &[T], n: usize, out: &mut [T], block_size: usize) {
        matmul_accumulate(
            self.as_slice(),
            b,
            out,
            Matrix::rows(self),
            Matrix::cols(self),
            n,
            block_size,
        );
    }

    fn broadcast<C: Communicator>(&mut self, comm: &C, root: usize) -> Result<()> {
        comm.broadcast_into(root, self.as_mut_slice())
    }
}

/// Sums `contribution` from every member of `comm` onto `acc` at `root`.
///
/// The root adds contributions in ascending member order, its own included.
/// Non-root members only send; their `acc` is left untouched.
pub fn reduce_sum_into<T, C>(comm: &C, root: usize, contribution: &[T], acc: &mut [T], tag: u32) -> Result<()>
where
    T: Element,
    C: Communicator,
{
    if comm.rank() != root {
        return comm.send(root, tag, contribution);
    }
    let mut incoming = try_zeroed(contribution.len(), "reduce buffer")?;
    for member in 0..comm.size() {
        let part: &[T] = if member == root {
            contribution
        } else {
            comm.recv_into(member, tag, &mut incoming)?;
            &incoming
        };
        for (dst, &src) in acc.iter_mut().zip(part) {
            *dst += src;
        }
    }
    Ok(())
}

const TAG_REDUCE: u32 = 200;

fn check_blocks<T: Element, L: LeftBlock<T>>(a: &L, b: &Matrix<T>, shape: &BlockShape) -> Result<()> {
    if (a.rows(), a.cols()) != shape.a_tile() || (b.rows(), b.cols()) != shape.b_tile() {
        return Err(dimension_error(format!(
            "local blocks {}x{} and {}x{} do not match block shape {:?}",
            a.rows(),
            a.cols(),
            b.rows(),
            b.cols(),
            shape
        )));
    }
    Ok(())
}

/// Stationary-B SUMMA: `B` blocks fixed, `A` blocks broadcast along rows.
///
/// `a_local` must come from transposed placement (rank `(r, c)` holds
/// `A(c, r)`), `b_local` from direct placement. Returns this rank's `C(r, c)`.
pub fn summa_stationary_b<T, L, C>(
    a_local: &L,
    b_local: &Matrix<T>,
    shape: &BlockShape,
    block_size: usize,
    grid: &ProcessGrid<C>,
) -> Result<Matrix<T>>
where
    T: Element,
    L: LeftBlock<T>,
    C: Communicator,
{
    check_blocks(a_local, b_local, shape)?;
    let (cm, cn) = shape.c_tile();
    let coord = grid.coord();

    let mut c_local = Matrix::zeros(cm, cn)?;
    let mut a_temp = a_local.clone();
    let mut partial = try_zeroed::<T>(cm * cn, "partial product")?;

    for t in 0..grid.side() {
        if coord.col == t {
            a_temp.clone_from(a_local);
        }
        a_temp.broadcast(grid.row_group(), t)?;

        partial.fill(T::zero());
        a_temp.multiply_accumulate(b_local.as_slice(), cn, &mut partial, block_size);

        reduce_sum_into(grid.col_group(), t, &partial, c_local.as_mut_slice(), TAG_REDUCE)?;
        trace!("rank at {} finished round {t}", coord);
    }

    debug!("stationary-B finished {} rounds at {}", grid.side(), coord);
    Ok(c_local)
}

/// Stationary-A SUMMA: `A` blocks fixed, `B` blocks broadcast down columns.
///
/// `a_local` must come from direct placement, `b_local` from transposed
/// placement (rank `(r, c)` holds `B(c, r)`). Returns this rank's `C(r, c)`.
pub fn summa_stationary_a<T, L, C>(
    a_local: &L,
    b_local: &Matrix<T>,
    shape: &BlockShape,
    block_size: usize,
    grid: &ProcessGrid<C>,
) -> Result<Matrix<T>>
where
    T: Element,
    L: LeftBlock<T>,
    C: Communicator,
{
    check_blocks(a_local, b_local, shape)?;
    let (cm, cn) = shape.c_tile();
    let coord = grid.coord();

    let mut c_local = Matrix::zeros(cm, cn)?;
    let mut b_temp = Matrix::zeros(b_local.rows(), b_local.cols())?;
    let mut partial = try_zeroed::<T>(cm * cn, "partial product")?;

    for t in 0..grid.side() {
        if coord.row == t {
            b_temp.as_mut_slice().copy_from_slice(b_local.as_slice());
        }
        grid.col_group().broadcast_into(t, b_temp.as_mut_slice())?;

        partial.fill(T::zero());
        a_local.multiply_accumulate(b_temp.as_slice(), cn, &mut partial, block_size);

        reduce_sum_into(grid.row_group(), t, &partial, c_local.as_mut_slice(), TAG_REDUCE)?;
        trace!("rank at {} finished round {t}", coord);
    }

    debug!("stationary-A finished {} rounds at {}", grid.side(), coord);
    Ok(c_local)
}

/// Runs the selected variant on already distributed blocks.
pub fn summa<T, L, C>(
    variant: Stationary,
    a_local: &L,
    b_local: &Matrix<T>,
    shape: &BlockShape,
    block_size: usize,
    grid: &ProcessGrid<C>,
) -> Result<Matrix<T>>
where
    T: Element,
    L: LeftBlock<T>,
    C: Communicator,
{
    match variant {
        Stationary::A => summa_stationary_a(a_local, b_local, shape, block_size, grid),
        Stationary::B => summa_stationary_b(a_local, b_local, shape, block_size, grid),
    }
}
