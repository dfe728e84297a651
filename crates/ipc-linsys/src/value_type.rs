//! Element types stored in the system matrix.
//!
//! The solver is generic over the value held at each pattern position: a
//! scalar `f64`, or a small dense block (`Matrix2<f64>`, `Matrix3<f64>`)
//! when every vertex carries several coupled unknowns. The vector type seen
//! by the Krylov and multigrid kernels follows from the block type.

use std::fmt::Debug;
use std::ops::{Add, AddAssign, Sub, SubAssign};

use nalgebra::{Matrix2, Matrix3, Vector2, Vector3};

/// One block of a right-hand side or solution vector.
pub trait BlockVector:
    Copy + Debug + PartialEq + Send + Sync + 'static + Add<Output = Self> + Sub<Output = Self> + AddAssign + SubAssign
{
    fn zero() -> Self;
    fn vdot(&self, other: &Self) -> f64;
    fn scaled(&self, s: f64) -> Self;
    fn component(&self, k: usize) -> f64;
    fn component_mut(&mut self, k: usize) -> &mut f64;
}

/// One entry of the system matrix.
pub trait BlockValue:
    Copy + Debug + PartialEq + Send + Sync + 'static + Add<Output = Self> + Sub<Output = Self> + AddAssign + SubAssign
{
    type Vector: BlockVector;

    /// Scalar unknowns per vertex.
    const BLOCK: usize;

    fn zero() -> Self;
    fn identity() -> Self;
    /// Block-vector product `self * x`.
    fn apply(&self, x: &Self::Vector) -> Self::Vector;
    /// Block-block product `self * rhs`.
    fn mul_block(&self, rhs: &Self) -> Self;
    fn scaled(&self, s: f64) -> Self;
    fn transposed(&self) -> Self;
    fn inverse(&self) -> Option<Self>;
    /// Squared Frobenius norm.
    fn frobenius_sq(&self) -> f64;
    fn entry(&self, row: usize, col: usize) -> f64;
    fn entry_mut(&mut self, row: usize, col: usize) -> &mut f64;

    fn frobenius(&self) -> f64 {
        self.frobenius_sq().sqrt()
    }

    fn is_finite(&self) -> bool {
        (0..Self::BLOCK).all(|r| (0..Self::BLOCK).all(|c| self.entry(r, c).is_finite()))
    }

    fn has_positive_diagonal(&self) -> bool {
        (0..Self::BLOCK).all(|k| self.entry(k, k) > 0.0)
    }
}

impl BlockVector for f64 {
    fn zero() -> Self {
        0.0
    }

    fn vdot(&self, other: &Self) -> f64 {
        self * other
    }

    fn scaled(&self, s: f64) -> Self {
        self * s
    }

    fn component(&self, _k: usize) -> f64 {
        *self
    }

    fn component_mut(&mut self, _k: usize) -> &mut f64 {
        self
    }
}

impl BlockValue for f64 {
    type Vector = f64;
    const BLOCK: usize = 1;

    fn zero() -> Self {
        0.0
    }

    fn identity() -> Self {
        1.0
    }

    fn apply(&self, x: &f64) -> f64 {
        self * x
    }

    fn mul_block(&self, rhs: &Self) -> Self {
        self * rhs
    }

    fn scaled(&self, s: f64) -> Self {
        self * s
    }

    fn transposed(&self) -> Self {
        *self
    }

    fn inverse(&self) -> Option<Self> {
        (*self != 0.0).then(|| 1.0 / self)
    }

    fn frobenius_sq(&self) -> f64 {
        self * self
    }

    fn entry(&self, _row: usize, _col: usize) -> f64 {
        *self
    }

    fn entry_mut(&mut self, _row: usize, _col: usize) -> &mut f64 {
        self
    }
}

macro_rules! impl_static_block {
    ($mat:ty, $vec:ty, $n:expr) => {
        impl BlockVector for $vec {
            fn zero() -> Self {
                <$vec>::zeros()
            }

            fn vdot(&self, other: &Self) -> f64 {
                self.iter().zip(other.iter()).map(|(a, b)| a * b).sum()
            }

            fn scaled(&self, s: f64) -> Self {
                self.map(|v| v * s)
            }

            fn component(&self, k: usize) -> f64 {
                self[k]
            }

            fn component_mut(&mut self, k: usize) -> &mut f64 {
                &mut self[k]
            }
        }

        impl BlockValue for $mat {
            type Vector = $vec;
            const BLOCK: usize = $n;

            fn zero() -> Self {
                <$mat>::zeros()
            }

            fn identity() -> Self {
                <$mat>::identity()
            }

            fn apply(&self, x: &$vec) -> $vec {
                self * x
            }

            fn mul_block(&self, rhs: &Self) -> Self {
                self * rhs
            }

            fn scaled(&self, s: f64) -> Self {
                self.map(|v| v * s)
            }

            fn transposed(&self) -> Self {
                self.transpose()
            }

            fn inverse(&self) -> Option<Self> {
                self.try_inverse()
            }

            fn frobenius_sq(&self) -> f64 {
                self.iter().map(|v| v * v).sum()
            }

            fn entry(&self, row: usize, col: usize) -> f64 {
                self[(row, col)]
            }

            fn entry_mut(&mut self, row: usize, col: usize) -> &mut f64 {
                &mut self[(row, col)]
            }
        }
    };
}

impl_static_block!(Matrix2<f64>, Vector2<f64>, 2);
impl_static_block!(Matrix3<f64>, Vector3<f64>, 3);

/// Splits a flat scalar vector into blocks of `V::BLOCK` components.
pub(crate) fn to_blocks<V: BlockValue>(flat: &[f64]) -> Vec<V::Vector> {
    flat.chunks_exact(V::BLOCK)
        .map(|chunk| {
            let mut block = V::Vector::zero();
            for (k, &v) in chunk.iter().enumerate() {
                *block.component_mut(k) = v;
            }
            block
        })
        .collect()
}

/// Inverse of [`to_blocks`].
pub(crate) fn from_blocks<V: BlockValue>(blocks: &[V::Vector]) -> Vec<f64> {
    let mut flat = Vec::with_capacity(blocks.len() * V::BLOCK);
    for block in blocks {
        flat.extend((0..V::BLOCK).map(|k| block.component(k)));
    }
    flat
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_inverse_matches_identity() {
        let a = Matrix3::new(4.0, -1.0, 0.0, -1.0, 4.0, -1.0, 0.0, -1.0, 4.0);
        let inv = BlockValue::inverse(&a).expect("invertible");
        let id = a.mul_block(&inv);
        for r in 0..3 {
            for c in 0..3 {
                let expected = if r == c { 1.0 } else { 0.0 };
                assert!((id[(r, c)] - expected).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn scalar_zero_has_no_inverse() {
        assert_eq!(BlockValue::inverse(&0.0f64), None);
        assert_eq!(BlockValue::inverse(&4.0f64), Some(0.25));
    }

    #[test]
    fn blocks_roundtrip_through_flat_vectors() {
        let flat = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let blocks = to_blocks::<Matrix3<f64>>(&flat);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1], Vector3::new(4.0, 5.0, 6.0));
        assert_eq!(from_blocks::<Matrix3<f64>>(&blocks), flat);
    }

    #[test]
    fn positive_diagonal_check_looks_at_every_component() {
        let mut a = Matrix2::<f64>::identity();
        assert!(a.has_positive_diagonal());
        a[(1, 1)] = 0.0;
        assert!(!a.has_positive_diagonal());
    }
}
