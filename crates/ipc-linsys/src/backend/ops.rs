//! Block-vector kernels shared by the smoothers and Krylov solvers.
//!
//! Matrix-vector products run one rayon task per row; every row sums its
//! entries sequentially, so results do not depend on the thread count.
//! Reductions (dot products, norms) are sequential for the same reason.

use nalgebra_sparse::CsrMatrix;
use rayon::prelude::*;

use crate::value_type::{BlockValue, BlockVector};

/// `y = A x`
pub fn spmv<V: BlockValue>(a: &CsrMatrix<V>, x: &[V::Vector], y: &mut [V::Vector]) {
    let offsets = a.row_offsets();
    let cols = a.col_indices();
    let vals = a.values();
    y.par_iter_mut().enumerate().for_each(|(i, yi)| {
        let mut sum = V::Vector::zero();
        for k in offsets[i]..offsets[i + 1] {
            sum += vals[k].apply(&x[cols[k]]);
        }
        *yi = sum;
    });
}

/// `r = b - A x`
pub fn residual<V: BlockValue>(
    a: &CsrMatrix<V>,
    b: &[V::Vector],
    x: &[V::Vector],
    r: &mut [V::Vector],
) {
    let offsets = a.row_offsets();
    let cols = a.col_indices();
    let vals = a.values();
    r.par_iter_mut().enumerate().for_each(|(i, ri)| {
        let mut sum = b[i];
        for k in offsets[i]..offsets[i + 1] {
            sum -= vals[k].apply(&x[cols[k]]);
        }
        *ri = sum;
    });
}

pub fn dot<T: BlockVector>(x: &[T], y: &[T]) -> f64 {
    x.iter().zip(y).map(|(a, b)| a.vdot(b)).sum()
}

pub fn norm<T: BlockVector>(x: &[T]) -> f64 {
    dot(x, x).sqrt()
}

/// `y += alpha * x`
pub fn axpy<T: BlockVector>(alpha: f64, x: &[T], y: &mut [T]) {
    for (yi, xi) in y.iter_mut().zip(x) {
        *yi += xi.scaled(alpha);
    }
}

/// `y = alpha * x + beta * y`
pub fn axpby<T: BlockVector>(alpha: f64, x: &[T], beta: f64, y: &mut [T]) {
    for (yi, xi) in y.iter_mut().zip(x) {
        *yi = xi.scaled(alpha) + yi.scaled(beta);
    }
}

pub fn fill_zero<T: BlockVector>(x: &mut [T]) {
    x.iter_mut().for_each(|v| *v = T::zero());
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra_sparse::CooMatrix;

    fn tridiag(n: usize) -> CsrMatrix<f64> {
        let mut coo = CooMatrix::new(n, n);
        for i in 0..n {
            coo.push(i, i, 2.0);
            if i > 0 {
                coo.push(i, i - 1, -1.0);
            }
            if i + 1 < n {
                coo.push(i, i + 1, -1.0);
            }
        }
        CsrMatrix::from(&coo)
    }

    #[test]
    fn spmv_and_residual_agree() {
        let a = tridiag(5);
        let x = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let b = vec![1.0; 5];
        let mut ax = vec![0.0; 5];
        let mut r = vec![0.0; 5];
        spmv(&a, &x, &mut ax);
        residual(&a, &b, &x, &mut r);
        assert_eq!(ax, vec![0.0, 0.0, 0.0, 0.0, 6.0]);
        for i in 0..5 {
            assert_eq!(r[i], b[i] - ax[i]);
        }
    }

    #[test]
    fn axpby_combines_vectors() {
        let x = vec![1.0f64, 2.0];
        let mut y = vec![3.0, 4.0];
        axpby(2.0, &x, 0.5, &mut y);
        assert_eq!(y, vec![3.5, 6.0]);
        axpy(-1.0, &x, &mut y);
        assert_eq!(y, vec![2.5, 4.0]);
        assert_eq!(norm(&[3.0f64, 4.0]), 5.0);
    }
}
