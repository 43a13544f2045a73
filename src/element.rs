//! Scalar element types accepted by the engine.

use std::fmt::{Debug, Display};

use num::traits::{Float, NumAssign};
use rand::distr::uniform::SampleUniform;

use crate::comm::Payload;

/// IEEE-754 element type of matrices moved and multiplied by the engine.
///
/// Implemented for `f32` and `f64`. Accumulation always happens in the element
/// type itself; there is no mixed-precision path.
pub trait Element:
    Float + NumAssign + SampleUniform + Payload + Copy + Sync + Debug + Display + Default
{
    /// Dense verification tolerance for this type, scaled by the reference magnitude above 1.
    const DENSE_TOLERANCE: Self;

    /// Widens to `f64` for error statistics.
    fn to_f64_lossy(self) -> f64;

    /// Narrows from `f64`.
    fn from_f64_lossy(value: f64) -> Self;
}

impl Element for f32 {
    const DENSE_TOLERANCE: Self = 1e-5;

    #[inline(always)]
    fn to_f64_lossy(self) -> f64 {
        self as f64
    }

    #[inline(always)]
    fn from_f64_lossy(value: f64) -> Self {
        value as f32
    }
}

impl Element for f64 {
    const DENSE_TOLERANCE: Self = 1e-5;

    #[inline(always)]
    fn to_f64_lossy(self) -> f64 {
        self
    }

    #[inline(always)]
    fn from_f64_lossy(value: f64) -> Self {
        value
    }
}
