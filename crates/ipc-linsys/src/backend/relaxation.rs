//! Smoothers.
//!
//! Each smoother is set up once per numeric update (`create`) and owns the
//! scratch vectors it needs, so repeated sweeps allocate nothing.

use std::sync::Arc;

use nalgebra_sparse::CsrMatrix;
use rayon::prelude::*;

use super::csr;
use super::ops;
use super::traits::{BackendError, Preconditioner};
use crate::params::{RelaxParams, RelaxationType};
use crate::value_type::{BlockValue, BlockVector};

/// One relaxation step `x ← x + M (rhs - A x)` for a fixed matrix.
pub trait Relaxation<V: BlockValue>: Send {
    fn name(&self) -> &'static str;

    /// Pre-smoothing sweep.
    fn apply_pre(&mut self, a: &CsrMatrix<V>, rhs: &[V::Vector], x: &mut [V::Vector]);

    /// Post-smoothing sweep.
    fn apply_post(&mut self, a: &CsrMatrix<V>, rhs: &[V::Vector], x: &mut [V::Vector]) {
        self.apply_pre(a, rhs, x);
    }
}

/// Sets up the configured smoother for `a`.
pub fn create<V: BlockValue>(
    params: &RelaxParams,
    a: &CsrMatrix<V>,
) -> Result<Box<dyn Relaxation<V>>, BackendError> {
    let relax: Box<dyn Relaxation<V>> = match params.kind {
        RelaxationType::Spai0 => Box::new(Spai0::<V>::new(a)?),
        RelaxationType::DampedJacobi => Box::new(DampedJacobi::new(a, params.damping)?),
        RelaxationType::GaussSeidel => Box::new(GaussSeidel::new(a)?),
        RelaxationType::Chebyshev => Box::new(Chebyshev::new(a, params.degree, params.lower)?),
    };
    Ok(relax)
}

/// Inverted diagonal blocks; a singular block is a setup failure.
pub(crate) fn inverse_diagonal<V: BlockValue>(a: &CsrMatrix<V>) -> Result<Vec<V>, BackendError> {
    csr::diagonal(a)
        .into_iter()
        .enumerate()
        .map(|(i, d)| {
            d.inverse()
                .ok_or_else(|| BackendError(format!("singular diagonal block in row {i}")))
        })
        .collect()
}

/// `x += M r` for a block-diagonal `M`.
fn apply_diagonal<V: BlockValue>(m: &[V], r: &[V::Vector], x: &mut [V::Vector]) {
    x.par_iter_mut()
        .zip(m.par_iter().zip(r.par_iter()))
        .for_each(|(xi, (mi, ri))| *xi += mi.apply(ri));
}

/// Sparse approximate inverse restricted to the diagonal pattern.
pub struct Spai0<V: BlockValue> {
    m: Vec<V>,
    r: Vec<V::Vector>,
}

impl<V: BlockValue> Spai0<V> {
    pub fn new(a: &CsrMatrix<V>) -> Result<Self, BackendError> {
        let diag = csr::diagonal(a);
        let m = (0..a.nrows())
            .map(|i| {
                let den: f64 = a.row(i).values().iter().map(|v| v.frobenius_sq()).sum();
                if den > 0.0 && den.is_finite() {
                    Ok(diag[i].transposed().scaled(1.0 / den))
                } else {
                    Err(BackendError(format!("row {i} has no usable entries")))
                }
            })
            .collect::<Result<Vec<V>, BackendError>>()?;
        Ok(Self {
            m,
            r: vec![V::Vector::zero(); a.nrows()],
        })
    }
}

impl<V: BlockValue> Relaxation<V> for Spai0<V> {
    fn name(&self) -> &'static str {
        "spai0"
    }

    fn apply_pre(&mut self, a: &CsrMatrix<V>, rhs: &[V::Vector], x: &mut [V::Vector]) {
        ops::residual(a, rhs, x, &mut self.r);
        apply_diagonal(&self.m, &self.r, x);
    }
}

pub struct DampedJacobi<V: BlockValue> {
    m: Vec<V>,
    r: Vec<V::Vector>,
}

impl<V: BlockValue> DampedJacobi<V> {
    pub fn new(a: &CsrMatrix<V>, damping: f64) -> Result<Self, BackendError> {
        let m = inverse_diagonal(a)?
            .into_iter()
            .map(|d| d.scaled(damping))
            .collect();
        Ok(Self {
            m,
            r: vec![V::Vector::zero(); a.nrows()],
        })
    }
}

impl<V: BlockValue> Relaxation<V> for DampedJacobi<V> {
    fn name(&self) -> &'static str {
        "damped_jacobi"
    }

    fn apply_pre(&mut self, a: &CsrMatrix<V>, rhs: &[V::Vector], x: &mut [V::Vector]) {
        ops::residual(a, rhs, x, &mut self.r);
        apply_diagonal(&self.m, &self.r, x);
    }
}

/// Symmetric Gauss-Seidel: forward sweep before the coarse correction,
/// backward sweep after it.
pub struct GaussSeidel<V: BlockValue> {
    dinv: Vec<V>,
}

impl<V: BlockValue> GaussSeidel<V> {
    pub fn new(a: &CsrMatrix<V>) -> Result<Self, BackendError> {
        Ok(Self {
            dinv: inverse_diagonal(a)?,
        })
    }

    fn update_row(&self, a: &CsrMatrix<V>, rhs: &[V::Vector], x: &mut [V::Vector], i: usize) {
        let row = a.row(i);
        let mut sum = rhs[i];
        for (&j, v) in row.col_indices().iter().zip(row.values()) {
            if j != i {
                sum -= v.apply(&x[j]);
            }
        }
        x[i] = self.dinv[i].apply(&sum);
    }
}

impl<V: BlockValue> Relaxation<V> for GaussSeidel<V> {
    fn name(&self) -> &'static str {
        "gauss_seidel"
    }

    fn apply_pre(&mut self, a: &CsrMatrix<V>, rhs: &[V::Vector], x: &mut [V::Vector]) {
        for i in 0..a.nrows() {
            self.update_row(a, rhs, x, i);
        }
    }

    fn apply_post(&mut self, a: &CsrMatrix<V>, rhs: &[V::Vector], x: &mut [V::Vector]) {
        for i in (0..a.nrows()).rev() {
            self.update_row(a, rhs, x, i);
        }
    }
}

/// Chebyshev polynomial smoother on the Jacobi-scaled operator `D⁻¹A`.
///
/// The spectrum is assumed to lie in `[lower * ρ, ρ]` where `ρ` is the
/// Gershgorin bound of `D⁻¹A`.
pub struct Chebyshev<V: BlockValue> {
    dinv: Vec<V>,
    degree: usize,
    theta: f64,
    delta: f64,
    r: Vec<V::Vector>,
    d: Vec<V::Vector>,
}

impl<V: BlockValue> Chebyshev<V> {
    pub fn new(a: &CsrMatrix<V>, degree: usize, lower: f64) -> Result<Self, BackendError> {
        let dinv = inverse_diagonal(a)?;
        let hi = gershgorin_scaled(a, &dinv);
        if !(hi > 0.0 && hi.is_finite()) {
            return Err(BackendError(format!(
                "invalid spectral bound {hi} for chebyshev smoother"
            )));
        }
        let lo = hi * lower;
        let n = a.nrows();
        Ok(Self {
            dinv,
            degree,
            theta: 0.5 * (hi + lo),
            delta: 0.5 * (hi - lo),
            r: vec![V::Vector::zero(); n],
            d: vec![V::Vector::zero(); n],
        })
    }

    /// `r ← D⁻¹ (rhs - A x)`
    fn scaled_residual(&mut self, a: &CsrMatrix<V>, rhs: &[V::Vector], x: &[V::Vector]) {
        ops::residual(a, rhs, x, &mut self.r);
        self.r
            .par_iter_mut()
            .zip(self.dinv.par_iter())
            .for_each(|(ri, di)| *ri = di.apply(ri));
    }
}

impl<V: BlockValue> Relaxation<V> for Chebyshev<V> {
    fn name(&self) -> &'static str {
        "chebyshev"
    }

    fn apply_pre(&mut self, a: &CsrMatrix<V>, rhs: &[V::Vector], x: &mut [V::Vector]) {
        let sigma = self.theta / self.delta;
        let mut rho = 1.0 / sigma;

        self.scaled_residual(a, rhs, x);
        let inv_theta = 1.0 / self.theta;
        for (di, ri) in self.d.iter_mut().zip(&self.r) {
            *di = ri.scaled(inv_theta);
        }

        for k in 0..self.degree {
            ops::axpy(1.0, &self.d, x);
            if k + 1 == self.degree {
                break;
            }
            self.scaled_residual(a, rhs, x);
            let rho_next = 1.0 / (2.0 * sigma - rho);
            ops::axpby(2.0 * rho_next / self.delta, &self.r, rho_next * rho, &mut self.d);
            rho = rho_next;
        }
    }
}

/// Upper bound on the spectrum of `D⁻¹A`: `max_i Σ_j ||D_i⁻¹ A_ij||`.
pub(crate) fn gershgorin_scaled<V: BlockValue>(a: &CsrMatrix<V>, dinv: &[V]) -> f64 {
    (0..a.nrows())
        .into_par_iter()
        .map(|i| {
            a.row(i)
                .values()
                .iter()
                .map(|v| dinv[i].mul_block(v).frobenius())
                .sum::<f64>()
        })
        .reduce(|| 0.0, f64::max)
}

/// A single-level smoother used as a preconditioner: one pre and one post
/// sweep starting from a zero guess.
pub struct RelaxationPrecond<V: BlockValue> {
    matrix: Arc<CsrMatrix<V>>,
    relax: Box<dyn Relaxation<V>>,
}

impl<V: BlockValue> RelaxationPrecond<V> {
    pub fn new(params: &RelaxParams, matrix: Arc<CsrMatrix<V>>) -> Result<Self, BackendError> {
        let relax = create(params, &matrix)?;
        Ok(Self { matrix, relax })
    }
}

impl<V: BlockValue> Preconditioner<V> for RelaxationPrecond<V> {
    fn apply(&mut self, rhs: &[V::Vector], x: &mut [V::Vector]) {
        ops::fill_zero(x);
        self.relax.apply_pre(&self.matrix, rhs, x);
        self.relax.apply_post(&self.matrix, rhs, x);
    }

    fn describe(&self) -> String {
        format!("relaxation({})", self.relax.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::RelaxParams;

    fn laplace_1d(n: usize) -> CsrMatrix<f64> {
        let rows = (0..n)
            .map(|i| {
                let mut row = vec![(i, 2.0)];
                if i > 0 {
                    row.push((i - 1, -1.0));
                }
                if i + 1 < n {
                    row.push((i + 1, -1.0));
                }
                row
            })
            .collect();
        csr::assemble_rows(n, rows).expect("valid rows")
    }

    fn residual_norm(a: &CsrMatrix<f64>, b: &[f64], x: &[f64]) -> f64 {
        let mut r = vec![0.0; b.len()];
        ops::residual(a, b, x, &mut r);
        ops::norm(&r)
    }

    #[test]
    fn every_smoother_reduces_the_residual() {
        let n = 20;
        let a = laplace_1d(n);
        let b = vec![1.0; n];
        let start = residual_norm(&a, &b, &vec![0.0; n]);
        for kind in [
            RelaxationType::Spai0,
            RelaxationType::DampedJacobi,
            RelaxationType::GaussSeidel,
            RelaxationType::Chebyshev,
        ] {
            let params = RelaxParams {
                kind,
                ..Default::default()
            };
            let mut relax = create(&params, &a).expect("smoother setup");
            let mut x = vec![0.0; n];
            relax.apply_pre(&a, &b, &mut x);
            relax.apply_post(&a, &b, &mut x);
            let end = residual_norm(&a, &b, &x);
            assert!(end < start, "{} did not reduce the residual: {end} >= {start}", relax.name());
        }
    }

    #[test]
    fn spai0_scalar_formula() {
        let a = laplace_1d(3);
        let spai = Spai0::new(&a).expect("setup");
        assert!((spai.m[0] - 2.0 / 5.0).abs() < 1e-15);
        assert!((spai.m[1] - 2.0 / 6.0).abs() < 1e-15);
    }

    #[test]
    fn singular_diagonal_is_rejected() {
        let a = csr::assemble_rows(2, vec![vec![(0, 0.0), (1, 1.0)], vec![(0, 1.0), (1, 2.0)]])
            .expect("valid rows");
        assert!(GaussSeidel::new(&a).is_err());
        assert!(DampedJacobi::new(&a, 0.72).is_err());
    }

    #[test]
    fn gershgorin_bound_of_scaled_laplacian() {
        let a = laplace_1d(5);
        let dinv = inverse_diagonal(&a).expect("invertible");
        assert!((gershgorin_scaled(&a, &dinv) - 2.0).abs() < 1e-15);
    }
}
