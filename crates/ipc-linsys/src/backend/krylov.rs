//! Krylov and stationary iterations.
//!
//! All solvers stop when `||b - A x|| <= max(tol * ||b||, abstol)` or after
//! `maxiter` iterations, whichever comes first, and report the final
//! residual relative to `||b||`. The initial guess is whatever `x` holds on
//! entry.

use std::collections::VecDeque;

use nalgebra_sparse::CsrMatrix;
use tracing::trace;

use super::ops;
use super::traits::{IterationReport, KrylovSolver, Preconditioner};
use crate::params::{KrylovParams, SolverType};
use crate::value_type::{BlockValue, BlockVector};

/// Creates the configured outer iteration.
pub fn create<V: BlockValue>(params: &KrylovParams) -> Box<dyn KrylovSolver<V>> {
    let stop = Stopping::from(params);
    match params.kind {
        SolverType::Cg => Box::new(Cg::<V>::new(stop)),
        SolverType::Bicgstab => Box::new(BiCgStab::<V>::new(stop)),
        SolverType::Gmres => Box::new(Gmres::<V>::new(stop, params.m)),
        SolverType::Lgmres => Box::new(Lgmres::<V>::new(stop, params.m, params.k)),
        SolverType::Preonly => Box::new(PreOnly::<V>::new(stop)),
    }
}

#[derive(Debug, Clone, Copy)]
struct Stopping {
    tol: f64,
    abstol: f64,
    maxiter: usize,
}

impl From<&KrylovParams> for Stopping {
    fn from(params: &KrylovParams) -> Self {
        Self {
            tol: params.tol,
            abstol: params.abstol,
            maxiter: params.maxiter,
        }
    }
}

impl Stopping {
    /// Absolute residual threshold for a right-hand side of norm `norm_b`.
    fn threshold(&self, norm_b: f64) -> f64 {
        (self.tol * norm_b).max(self.abstol)
    }

    fn report(&self, iterations: usize, res: f64, norm_b: f64, eps: f64) -> IterationReport {
        IterationReport {
            iterations,
            residual: if norm_b > 0.0 { res / norm_b } else { res },
            converged: res <= eps,
        }
    }
}

fn resize<T: BlockVector>(v: &mut Vec<T>, n: usize) {
    v.clear();
    v.resize(n, T::zero());
}

/// Preconditioned conjugate gradient.
pub struct Cg<V: BlockValue> {
    stop: Stopping,
    r: Vec<V::Vector>,
    s: Vec<V::Vector>,
    p: Vec<V::Vector>,
    q: Vec<V::Vector>,
}

impl<V: BlockValue> Cg<V> {
    fn new(stop: Stopping) -> Self {
        Self {
            stop,
            r: Vec::new(),
            s: Vec::new(),
            p: Vec::new(),
            q: Vec::new(),
        }
    }
}

impl<V: BlockValue> KrylovSolver<V> for Cg<V> {
    fn name(&self) -> &'static str {
        "cg"
    }

    fn allocate(&mut self, n: usize) {
        for v in [&mut self.r, &mut self.s, &mut self.p, &mut self.q] {
            resize(v, n);
        }
    }

    fn solve(
        &mut self,
        a: &CsrMatrix<V>,
        precond: &mut dyn Preconditioner<V>,
        rhs: &[V::Vector],
        x: &mut [V::Vector],
    ) -> IterationReport {
        let norm_b = ops::norm(rhs);
        let eps = self.stop.threshold(norm_b);

        ops::residual(a, rhs, x, &mut self.r);
        let mut res = ops::norm(&self.r);
        let mut rho_prev = 1.0;
        let mut iter = 0;

        while iter < self.stop.maxiter && res > eps {
            precond.apply(&self.r, &mut self.s);
            let rho = ops::dot(&self.r, &self.s);
            if iter == 0 {
                self.p.copy_from_slice(&self.s);
            } else {
                ops::axpby(1.0, &self.s, rho / rho_prev, &mut self.p);
            }

            ops::spmv(a, &self.p, &mut self.q);
            let pq = ops::dot(&self.q, &self.p);
            if pq == 0.0 || !pq.is_finite() {
                break;
            }
            let alpha = rho / pq;
            ops::axpy(alpha, &self.p, x);
            ops::axpy(-alpha, &self.q, &mut self.r);

            rho_prev = rho;
            res = ops::norm(&self.r);
            iter += 1;
            trace!(iteration = iter, residual = res / norm_b, "cg");
        }

        self.stop.report(iter, res, norm_b, eps)
    }
}

/// Right-preconditioned BiCGStab.
pub struct BiCgStab<V: BlockValue> {
    stop: Stopping,
    r: Vec<V::Vector>,
    rh: Vec<V::Vector>,
    p: Vec<V::Vector>,
    v: Vec<V::Vector>,
    s: Vec<V::Vector>,
    t: Vec<V::Vector>,
    phat: Vec<V::Vector>,
    shat: Vec<V::Vector>,
}

impl<V: BlockValue> BiCgStab<V> {
    fn new(stop: Stopping) -> Self {
        Self {
            stop,
            r: Vec::new(),
            rh: Vec::new(),
            p: Vec::new(),
            v: Vec::new(),
            s: Vec::new(),
            t: Vec::new(),
            phat: Vec::new(),
            shat: Vec::new(),
        }
    }
}

impl<V: BlockValue> KrylovSolver<V> for BiCgStab<V> {
    fn name(&self) -> &'static str {
        "bicgstab"
    }

    fn allocate(&mut self, n: usize) {
        for v in [
            &mut self.r,
            &mut self.rh,
            &mut self.p,
            &mut self.v,
            &mut self.s,
            &mut self.t,
            &mut self.phat,
            &mut self.shat,
        ] {
            resize(v, n);
        }
    }

    fn solve(
        &mut self,
        a: &CsrMatrix<V>,
        precond: &mut dyn Preconditioner<V>,
        rhs: &[V::Vector],
        x: &mut [V::Vector],
    ) -> IterationReport {
        let norm_b = ops::norm(rhs);
        let eps = self.stop.threshold(norm_b);

        ops::residual(a, rhs, x, &mut self.r);
        self.rh.copy_from_slice(&self.r);
        let mut res = ops::norm(&self.r);
        let (mut rho_prev, mut alpha, mut omega) = (1.0, 1.0, 1.0);
        let mut iter = 0;

        while iter < self.stop.maxiter && res > eps {
            let rho = ops::dot(&self.rh, &self.r);
            if rho == 0.0 || !rho.is_finite() {
                break;
            }

            if iter == 0 {
                self.p.copy_from_slice(&self.r);
            } else {
                // p = r + beta (p - omega v)
                let beta = (rho / rho_prev) * (alpha / omega);
                ops::axpy(-omega, &self.v, &mut self.p);
                ops::axpby(1.0, &self.r, beta, &mut self.p);
            }

            precond.apply(&self.p, &mut self.phat);
            ops::spmv(a, &self.phat, &mut self.v);
            let rhv = ops::dot(&self.rh, &self.v);
            if rhv == 0.0 || !rhv.is_finite() {
                break;
            }
            alpha = rho / rhv;

            self.s.copy_from_slice(&self.r);
            ops::axpy(-alpha, &self.v, &mut self.s);
            iter += 1;

            let norm_s = ops::norm(&self.s);
            if norm_s <= eps {
                ops::axpy(alpha, &self.phat, x);
                res = norm_s;
                trace!(iteration = iter, residual = res / norm_b, "bicgstab");
                break;
            }

            precond.apply(&self.s, &mut self.shat);
            ops::spmv(a, &self.shat, &mut self.t);
            let tt = ops::dot(&self.t, &self.t);
            if tt == 0.0 || !tt.is_finite() {
                ops::axpy(alpha, &self.phat, x);
                res = norm_s;
                break;
            }
            omega = ops::dot(&self.t, &self.s) / tt;

            ops::axpy(alpha, &self.phat, x);
            ops::axpy(omega, &self.shat, x);
            self.r.copy_from_slice(&self.s);
            ops::axpy(-omega, &self.t, &mut self.r);

            rho_prev = rho;
            res = ops::norm(&self.r);
            trace!(iteration = iter, residual = res / norm_b, "bicgstab");
            if omega == 0.0 {
                break;
            }
        }

        self.stop.report(iter, res, norm_b, eps)
    }
}

/// Hessenberg least-squares problem of one restart cycle, reduced with
/// Givens rotations as columns arrive.
struct Hessenberg {
    /// Column-major: `h[j][i]`
    h: Vec<Vec<f64>>,
    cs: Vec<f64>,
    sn: Vec<f64>,
    g: Vec<f64>,
}

impl Hessenberg {
    fn new(m: usize) -> Self {
        Self {
            h: vec![vec![0.0; m + 1]; m],
            cs: vec![0.0; m],
            sn: vec![0.0; m],
            g: vec![0.0; m + 1],
        }
    }

    fn reset(&mut self, beta: f64) {
        self.g.iter_mut().for_each(|gi| *gi = 0.0);
        self.g[0] = beta;
    }

    /// Rotates column `k` into upper-triangular form and returns the new
    /// residual estimate, or `None` if the column is degenerate.
    fn rotate(&mut self, k: usize) -> Option<f64> {
        let col = &mut self.h[k];
        for i in 0..k {
            let (hi, hi1) = (col[i], col[i + 1]);
            col[i] = self.cs[i] * hi + self.sn[i] * hi1;
            col[i + 1] = -self.sn[i] * hi + self.cs[i] * hi1;
        }
        let (hkk, hk1) = (col[k], col[k + 1]);
        let denom = hkk.hypot(hk1);
        if denom == 0.0 {
            return None;
        }
        self.cs[k] = hkk / denom;
        self.sn[k] = hk1 / denom;
        col[k] = denom;
        col[k + 1] = 0.0;
        self.g[k + 1] = -self.sn[k] * self.g[k];
        self.g[k] *= self.cs[k];
        Some(self.g[k + 1].abs())
    }

    /// Back substitution on the leading `k × k` triangle.
    fn coefficients(&self, k: usize) -> Vec<f64> {
        let mut y = self.g[..k].to_vec();
        for i in (0..k).rev() {
            for j in i + 1..k {
                y[i] -= self.h[j][i] * y[j];
            }
            y[i] /= self.h[i][i];
        }
        y
    }
}

/// Orthogonalizes `w` against `basis[..=k]` with modified Gram-Schmidt,
/// storing the coefficients in column `k` of `hess`, and writes the
/// normalized remainder to `basis[k + 1]`. Returns the remainder norm.
fn arnoldi_step<T: BlockVector>(
    hess: &mut Hessenberg,
    basis: &mut [Vec<T>],
    w: &mut [T],
    k: usize,
) -> f64 {
    for i in 0..=k {
        let hik = ops::dot(w, &basis[i]);
        hess.h[k][i] = hik;
        ops::axpy(-hik, &basis[i], w);
    }
    let h_next = ops::norm(w);
    hess.h[k][k + 1] = h_next;
    if h_next > 0.0 {
        for (vi, wi) in basis[k + 1].iter_mut().zip(w.iter()) {
            *vi = wi.scaled(1.0 / h_next);
        }
    }
    h_next
}

/// Restarted GMRES with right preconditioning.
///
/// The Arnoldi basis is orthogonalized with modified Gram-Schmidt and the
/// Hessenberg least-squares problem is reduced with Givens rotations. The
/// true residual is recomputed at every restart.
pub struct Gmres<V: BlockValue> {
    stop: Stopping,
    m: usize,
    r: Vec<V::Vector>,
    w: Vec<V::Vector>,
    z: Vec<V::Vector>,
    basis: Vec<Vec<V::Vector>>,
    hess: Hessenberg,
}

impl<V: BlockValue> Gmres<V> {
    fn new(stop: Stopping, m: usize) -> Self {
        Self {
            stop,
            m,
            r: Vec::new(),
            w: Vec::new(),
            z: Vec::new(),
            basis: Vec::new(),
            hess: Hessenberg::new(m),
        }
    }

    /// Accumulates `x += M (V y)` for the first `k` basis vectors.
    fn update(
        &mut self,
        k: usize,
        precond: &mut dyn Preconditioner<V>,
        x: &mut [V::Vector],
    ) {
        let y = self.hess.coefficients(k);
        ops::fill_zero(&mut self.w);
        for (yi, vi) in y.iter().zip(&self.basis) {
            ops::axpy(*yi, vi, &mut self.w);
        }
        precond.apply(&self.w, &mut self.z);
        ops::axpy(1.0, &self.z, x);
    }
}

impl<V: BlockValue> KrylovSolver<V> for Gmres<V> {
    fn name(&self) -> &'static str {
        "gmres"
    }

    fn allocate(&mut self, n: usize) {
        for v in [&mut self.r, &mut self.w, &mut self.z] {
            resize(v, n);
        }
        self.basis = vec![vec![V::Vector::zero(); n]; self.m + 1];
    }

    fn solve(
        &mut self,
        a: &CsrMatrix<V>,
        precond: &mut dyn Preconditioner<V>,
        rhs: &[V::Vector],
        x: &mut [V::Vector],
    ) -> IterationReport {
        let norm_b = ops::norm(rhs);
        let eps = self.stop.threshold(norm_b);
        let mut iter = 0;
        let mut res;

        loop {
            ops::residual(a, rhs, x, &mut self.r);
            res = ops::norm(&self.r);
            if res <= eps || iter >= self.stop.maxiter {
                break;
            }

            let beta = res;
            for (vi, ri) in self.basis[0].iter_mut().zip(&self.r) {
                *vi = ri.scaled(1.0 / beta);
            }
            self.hess.reset(beta);

            let mut k = 0;
            while k < self.m && iter < self.stop.maxiter {
                precond.apply(&self.basis[k], &mut self.z);
                ops::spmv(a, &self.z, &mut self.w);
                let h_next = arnoldi_step(&mut self.hess, &mut self.basis, &mut self.w, k);
                let Some(estimate) = self.hess.rotate(k) else {
                    break;
                };

                k += 1;
                iter += 1;
                res = estimate;
                trace!(iteration = iter, residual = res / norm_b, "gmres");
                if res <= eps || h_next == 0.0 {
                    break;
                }
            }

            if k == 0 {
                break;
            }
            self.update(k, precond, x);
        }

        self.stop.report(iter, res, norm_b, eps)
    }
}

/// Loose GMRES: restarted GMRES whose search space is augmented with the
/// corrections of up to `k` previous cycles.
///
/// Augmented directions are not preconditioned, so the cycle keeps the
/// search directions themselves (flexible form) and builds the update from
/// them. The augmentation mitigates the stagnation plain restarts show on
/// hard nonsymmetric systems.
pub struct Lgmres<V: BlockValue> {
    stop: Stopping,
    m: usize,
    k: usize,
    r: Vec<V::Vector>,
    w: Vec<V::Vector>,
    basis: Vec<Vec<V::Vector>>,
    /// Search direction behind every basis column
    directions: Vec<Vec<V::Vector>>,
    /// Normalized previous corrections, newest first
    augment: VecDeque<Vec<V::Vector>>,
    hess: Hessenberg,
}

impl<V: BlockValue> Lgmres<V> {
    fn new(stop: Stopping, m: usize, k: usize) -> Self {
        Self {
            stop,
            m,
            k,
            r: Vec::new(),
            w: Vec::new(),
            basis: Vec::new(),
            directions: Vec::new(),
            augment: VecDeque::with_capacity(k),
            hess: Hessenberg::new(m + k),
        }
    }

    /// Applies `x += Z y` over the first `steps` directions and records the
    /// normalized correction for later cycles.
    fn update(&mut self, steps: usize, x: &mut [V::Vector]) {
        let y = self.hess.coefficients(steps);
        ops::fill_zero(&mut self.w);
        for (yi, zi) in y.iter().zip(&self.directions) {
            ops::axpy(*yi, zi, &mut self.w);
        }
        ops::axpy(1.0, &self.w, x);

        let norm = ops::norm(&self.w);
        if self.k == 0 || !(norm > 0.0) {
            return;
        }
        let mut correction = if self.augment.len() == self.k {
            self.augment.pop_back().unwrap_or_default()
        } else {
            Vec::with_capacity(self.w.len())
        };
        correction.clear();
        correction.extend(self.w.iter().map(|wi| wi.scaled(1.0 / norm)));
        self.augment.push_front(correction);
    }
}

impl<V: BlockValue> KrylovSolver<V> for Lgmres<V> {
    fn name(&self) -> &'static str {
        "lgmres"
    }

    fn allocate(&mut self, n: usize) {
        resize(&mut self.r, n);
        resize(&mut self.w, n);
        let dim = self.m + self.k;
        self.basis = vec![vec![V::Vector::zero(); n]; dim + 1];
        self.directions = vec![vec![V::Vector::zero(); n]; dim];
        self.augment.clear();
    }

    fn solve(
        &mut self,
        a: &CsrMatrix<V>,
        precond: &mut dyn Preconditioner<V>,
        rhs: &[V::Vector],
        x: &mut [V::Vector],
    ) -> IterationReport {
        let norm_b = ops::norm(rhs);
        let eps = self.stop.threshold(norm_b);
        let mut iter = 0;
        let mut res;
        self.augment.clear();

        loop {
            ops::residual(a, rhs, x, &mut self.r);
            res = ops::norm(&self.r);
            if res <= eps || iter >= self.stop.maxiter {
                break;
            }

            let beta = res;
            for (vi, ri) in self.basis[0].iter_mut().zip(&self.r) {
                *vi = ri.scaled(1.0 / beta);
            }
            self.hess.reset(beta);

            let dim = self.m + self.augment.len();
            let mut j = 0;
            while j < dim && iter < self.stop.maxiter {
                if j < self.m {
                    precond.apply(&self.basis[j], &mut self.directions[j]);
                } else {
                    self.directions[j].copy_from_slice(&self.augment[j - self.m]);
                }
                ops::spmv(a, &self.directions[j], &mut self.w);
                let h_next = arnoldi_step(&mut self.hess, &mut self.basis, &mut self.w, j);
                let Some(estimate) = self.hess.rotate(j) else {
                    break;
                };

                j += 1;
                iter += 1;
                res = estimate;
                trace!(iteration = iter, residual = res / norm_b, "lgmres");
                if res <= eps || h_next == 0.0 {
                    break;
                }
            }

            if j == 0 {
                break;
            }
            self.update(j, x);
        }

        self.stop.report(iter, res, norm_b, eps)
    }
}

/// Stationary iteration `x += M (b - A x)`; with an AMG preconditioner each
/// iteration is one V-cycle.
pub struct PreOnly<V: BlockValue> {
    stop: Stopping,
    r: Vec<V::Vector>,
    s: Vec<V::Vector>,
}

impl<V: BlockValue> PreOnly<V> {
    fn new(stop: Stopping) -> Self {
        Self {
            stop,
            r: Vec::new(),
            s: Vec::new(),
        }
    }
}

impl<V: BlockValue> KrylovSolver<V> for PreOnly<V> {
    fn name(&self) -> &'static str {
        "preonly"
    }

    fn allocate(&mut self, n: usize) {
        resize(&mut self.r, n);
        resize(&mut self.s, n);
    }

    fn solve(
        &mut self,
        a: &CsrMatrix<V>,
        precond: &mut dyn Preconditioner<V>,
        rhs: &[V::Vector],
        x: &mut [V::Vector],
    ) -> IterationReport {
        let norm_b = ops::norm(rhs);
        let eps = self.stop.threshold(norm_b);

        ops::residual(a, rhs, x, &mut self.r);
        let mut res = ops::norm(&self.r);
        let mut iter = 0;
        while iter < self.stop.maxiter && res > eps {
            precond.apply(&self.r, &mut self.s);
            ops::axpy(1.0, &self.s, x);
            ops::residual(a, rhs, x, &mut self.r);
            res = ops::norm(&self.r);
            iter += 1;
            trace!(iteration = iter, residual = res / norm_b, "preonly");
        }

        self.stop.report(iter, res, norm_b, eps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::csr;

    struct Identity;

    impl Preconditioner<f64> for Identity {
        fn apply(&mut self, rhs: &[f64], x: &mut [f64]) {
            x.copy_from_slice(rhs);
        }

        fn describe(&self) -> String {
            "identity".into()
        }
    }

    /// Tridiagonal convection-diffusion stencil; symmetric when `shift` is 0.
    fn convection(n: usize, diag: f64, shift: f64) -> CsrMatrix<f64> {
        let rows = (0..n)
            .map(|i| {
                let mut row = vec![(i, diag)];
                if i > 0 {
                    row.push((i - 1, -1.0 - shift));
                }
                if i + 1 < n {
                    row.push((i + 1, -1.0 + shift));
                }
                row
            })
            .collect();
        csr::assemble_rows(n, rows).expect("valid rows")
    }

    fn params(kind: SolverType) -> KrylovParams {
        KrylovParams {
            kind,
            tol: 1e-10,
            maxiter: 1000,
            m: 20,
            ..Default::default()
        }
    }

    fn check_solution(a: &CsrMatrix<f64>, b: &[f64], x: &[f64], tol: f64) {
        let mut r = vec![0.0; b.len()];
        ops::residual(a, b, x, &mut r);
        assert!(ops::norm(&r) <= tol * ops::norm(b));
    }

    #[test]
    fn krylov_methods_solve_symmetric_system() {
        let n = 40;
        let a = convection(n, 2.5, 0.0);
        let b: Vec<f64> = (0..n).map(|i| (i as f64).sin() + 1.0).collect();
        for kind in [
            SolverType::Cg,
            SolverType::Bicgstab,
            SolverType::Gmres,
            SolverType::Lgmres,
        ] {
            let mut solver = create::<f64>(&params(kind));
            solver.allocate(n);
            let mut x = vec![0.0; n];
            let report = solver.solve(&a, &mut Identity, &b, &mut x);
            assert!(report.converged, "{} failed: {report:?}", solver.name());
            assert!(report.iterations > 0);
            check_solution(&a, &b, &x, 1e-9);
        }
    }

    #[test]
    fn nonsymmetric_methods_solve_convection() {
        let n = 30;
        let a = convection(n, 3.0, 0.4);
        let b = vec![1.0; n];
        for kind in [SolverType::Bicgstab, SolverType::Gmres, SolverType::Lgmres] {
            let mut solver = create::<f64>(&params(kind));
            solver.allocate(n);
            let mut x = vec![0.0; n];
            let report = solver.solve(&a, &mut Identity, &b, &mut x);
            assert!(report.converged, "{} failed: {report:?}", solver.name());
            check_solution(&a, &b, &x, 1e-9);
        }
    }

    #[test]
    fn zero_iterations_report_unconverged() {
        let a = convection(5, 2.0, 0.0);
        let b = vec![1.0; 5];
        let mut p = params(SolverType::Cg);
        p.maxiter = 0;
        let mut solver = create::<f64>(&p);
        solver.allocate(5);
        let mut x = vec![0.0; 5];
        let report = solver.solve(&a, &mut Identity, &b, &mut x);
        assert_eq!(report.iterations, 0);
        assert!(!report.converged);
        assert_eq!(report.residual, 1.0);
        assert_eq!(x, vec![0.0; 5]);
    }

    #[test]
    fn gmres_restarts_until_converged() {
        let n = 60;
        let a = convection(n, 3.0, 0.2);
        let b = vec![1.0; n];
        let mut p = params(SolverType::Gmres);
        p.m = 5;
        p.maxiter = 2000;
        let mut solver = create::<f64>(&p);
        solver.allocate(n);
        let mut x = vec![0.0; n];
        let report = solver.solve(&a, &mut Identity, &b, &mut x);
        assert!(report.converged, "{report:?}");
        assert!(report.iterations > 5);
        check_solution(&a, &b, &x, 1e-9);
    }

    #[test]
    fn lgmres_augments_short_restarts() {
        let n = 60;
        let a = convection(n, 3.0, 0.2);
        let b = vec![1.0; n];
        for k in [0, 2] {
            let mut p = params(SolverType::Lgmres);
            p.m = 5;
            p.k = k;
            p.maxiter = 2000;
            let mut solver = create::<f64>(&p);
            solver.allocate(n);
            let mut x = vec![0.0; n];
            let report = solver.solve(&a, &mut Identity, &b, &mut x);
            assert!(report.converged, "k = {k}: {report:?}");
            check_solution(&a, &b, &x, 1e-9);

            // A second solve starts without stale augmentation vectors.
            let mut again = vec![0.0; n];
            let repeat = solver.solve(&a, &mut Identity, &b, &mut again);
            assert_eq!(repeat.iterations, report.iterations);
        }
    }
}
