//! Algebraic multigrid hierarchy and V-cycle.

use std::sync::Arc;

use nalgebra::linalg::LU;
use nalgebra::{DMatrix, DVector, Dyn};
use nalgebra_sparse::CsrMatrix;
use tracing::{debug, warn};

use super::coarsening::Coarsening;
use super::csr;
use super::ops;
use super::relaxation::{self, Relaxation};
use super::traits::{BackendError, Preconditioner};
use crate::params::PrecondParams;
use crate::value_type::{BlockValue, BlockVector};

/// Pivot ratio below which the coarse LU is treated as singular.
const SINGULAR_PIVOT_RATIO: f64 = 1e-10;
const SVD_MAX_SWEEPS: usize = 1000;

enum CoarseFactor {
    Lu(LU<f64, Dyn, Dyn>),
    /// Pseudo-inverse of a (semi)definite operator with a null space.
    Pinv(DMatrix<f64>),
}

/// Direct solve of the coarsest operator.
///
/// Singular coarse operators (pure Neumann problems and the like) are
/// inverted on their range only, so the correction carries no null-space
/// component.
struct CoarseSolver {
    factor: CoarseFactor,
    buf: DVector<f64>,
    out: DVector<f64>,
}

impl CoarseSolver {
    fn new<V: BlockValue>(a: &CsrMatrix<V>) -> Option<Self> {
        let dense = csr::to_dense(a);
        let n = dense.nrows();
        let factor = match well_conditioned_lu(dense.clone()) {
            Some(lu) => CoarseFactor::Lu(lu),
            None => {
                let svd = dense.try_svd(true, true, f64::EPSILON, SVD_MAX_SWEEPS)?;
                let cutoff = SINGULAR_PIVOT_RATIO * svd.singular_values.max();
                let pinv = svd.pseudo_inverse(cutoff).ok()?;
                debug!(rows = n, "coarsest operator is singular, using its pseudo-inverse");
                CoarseFactor::Pinv(pinv)
            }
        };
        Some(Self {
            factor,
            buf: DVector::zeros(n),
            out: DVector::zeros(n),
        })
    }

    fn is_pseudo_inverse(&self) -> bool {
        matches!(self.factor, CoarseFactor::Pinv(_))
    }

    fn solve<V: BlockValue>(&mut self, rhs: &[V::Vector], x: &mut [V::Vector]) {
        for (i, block) in rhs.iter().enumerate() {
            for k in 0..V::BLOCK {
                self.buf[i * V::BLOCK + k] = block.component(k);
            }
        }
        let solved = match &self.factor {
            CoarseFactor::Lu(lu) => lu.solve_mut(&mut self.buf),
            CoarseFactor::Pinv(pinv) => {
                self.out.gemv(1.0, pinv, &self.buf, 0.0);
                std::mem::swap(&mut self.buf, &mut self.out);
                true
            }
        };
        if solved {
            for (i, block) in x.iter_mut().enumerate() {
                for k in 0..V::BLOCK {
                    *block.component_mut(k) = self.buf[i * V::BLOCK + k];
                }
            }
        }
    }
}

/// LU of `dense`, or `None` when the smallest pivot is roundoff compared
/// with the largest.
fn well_conditioned_lu(dense: DMatrix<f64>) -> Option<LU<f64, Dyn, Dyn>> {
    let lu = dense.lu();
    let pivots = lu.u().diagonal().map(f64::abs);
    if pivots.is_empty() {
        return Some(lu);
    }
    let largest = pivots.max();
    (largest > 0.0 && pivots.min() > SINGULAR_PIVOT_RATIO * largest).then_some(lu)
}

/// One level of the hierarchy.
///
/// A level stores the work vectors of the *next* level (`fc`, `uc`) so the
/// recursion can borrow them alongside the remaining levels.
struct Level<V: BlockValue> {
    a: Arc<CsrMatrix<V>>,
    transfer: Option<(CsrMatrix<V>, CsrMatrix<V>)>,
    relax: Option<Box<dyn Relaxation<V>>>,
    coarse: Option<CoarseSolver>,
    t: Vec<V::Vector>,
    fc: Vec<V::Vector>,
    uc: Vec<V::Vector>,
}

impl<V: BlockValue> Level<V> {
    fn rows(&self) -> usize {
        self.a.nrows()
    }
}

/// AMG preconditioner: one cycle from a zero initial guess.
pub struct Amg<V: BlockValue> {
    params: PrecondParams,
    levels: Vec<Level<V>>,
}

impl<V: BlockValue> Amg<V> {
    /// Builds the hierarchy for `matrix`.
    ///
    /// Levels are added while the scalar size exceeds `coarse_enough` and
    /// fewer than `max_levels` exist. The coarsest level is solved by dense
    /// LU when `direct_coarse` is set and the level is small enough, by its
    /// pseudo-inverse when that LU is singular, and smoothed otherwise.
    pub fn new(params: &PrecondParams, matrix: Arc<CsrMatrix<V>>) -> Result<Self, BackendError> {
        let mut coarsening = Coarsening::new(&params.coarsening);
        let mut levels = Vec::new();
        let mut a = matrix;

        while a.nrows() * V::BLOCK > params.coarse_enough && levels.len() + 1 < params.max_levels
        {
            let Some(transfer) = coarsening.transfer_operators(&a)? else {
                break;
            };
            let coarse = coarsening.coarse_operator(&a, &transfer)?;
            if coarse.nrows() >= a.nrows() {
                break;
            }
            let relax = relaxation::create(&params.relax, &a)?;
            let n = a.nrows();
            let nc = coarse.nrows();
            levels.push(Level {
                a,
                transfer: Some((transfer.p, transfer.r)),
                relax: Some(relax),
                coarse: None,
                t: vec![V::Vector::zero(); n],
                fc: vec![V::Vector::zero(); nc],
                uc: vec![V::Vector::zero(); nc],
            });
            a = Arc::new(coarse);
        }

        let n = a.nrows();
        let mut coarse = None;
        if params.direct_coarse && n * V::BLOCK <= params.coarse_enough {
            coarse = CoarseSolver::new(&a);
            if coarse.is_none() {
                warn!(rows = n, "coarsest operator cannot be inverted, falling back to smoothing");
            }
        }
        let relax = match coarse {
            Some(_) => None,
            None => Some(relaxation::create(&params.relax, &a)?),
        };
        levels.push(Level {
            a,
            transfer: None,
            relax,
            coarse,
            t: Vec::new(),
            fc: Vec::new(),
            uc: Vec::new(),
        });

        let amg = Self {
            params: params.clone(),
            levels,
        };
        amg.log_hierarchy();
        Ok(amg)
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    /// Block rows per level, finest first.
    pub fn level_sizes(&self) -> Vec<usize> {
        self.levels.iter().map(|l| l.rows()).collect()
    }

    /// Total stored entries over the fine-level entries.
    pub fn operator_complexity(&self) -> f64 {
        let total: usize = self.levels.iter().map(|l| l.a.nnz()).sum();
        let fine = self.levels.first().map_or(0, |l| l.a.nnz());
        if fine == 0 {
            1.0
        } else {
            total as f64 / fine as f64
        }
    }

    fn log_hierarchy(&self) {
        for (depth, level) in self.levels.iter().enumerate() {
            debug!(
                level = depth,
                rows = level.rows(),
                nnz = level.a.nnz(),
                direct = level.coarse.is_some(),
                pseudo_inverse = level.coarse.as_ref().is_some_and(CoarseSolver::is_pseudo_inverse),
                "amg level"
            );
        }
        debug!(
            levels = self.levels.len(),
            complexity = self.operator_complexity(),
            "amg hierarchy ready"
        );
    }

    fn cycle(params: &PrecondParams, levels: &mut [Level<V>], rhs: &[V::Vector], x: &mut [V::Vector]) {
        let Some((level, rest)) = levels.split_first_mut() else {
            return;
        };

        if rest.is_empty() {
            if let Some(solver) = level.coarse.as_mut() {
                solver.solve::<V>(rhs, x);
            } else if let Some(relax) = level.relax.as_mut() {
                for _ in 0..params.npre {
                    relax.apply_pre(&level.a, rhs, x);
                }
                for _ in 0..params.npost {
                    relax.apply_post(&level.a, rhs, x);
                }
            }
            return;
        }

        let (Some((p, r)), Some(relax)) = (level.transfer.as_ref(), level.relax.as_mut()) else {
            return;
        };
        for _ in 0..params.ncycle {
            for _ in 0..params.npre {
                relax.apply_pre(&level.a, rhs, x);
            }

            ops::residual(&level.a, rhs, x, &mut level.t);
            ops::spmv(r, &level.t, &mut level.fc);
            ops::fill_zero(&mut level.uc);
            Self::cycle(params, rest, &level.fc, &mut level.uc);
            ops::spmv(p, &level.uc, &mut level.t);
            ops::axpy(1.0, &level.t, x);

            for _ in 0..params.npost {
                relax.apply_post(&level.a, rhs, x);
            }
        }
    }
}

impl<V: BlockValue> Preconditioner<V> for Amg<V> {
    fn apply(&mut self, rhs: &[V::Vector], x: &mut [V::Vector]) {
        ops::fill_zero(x);
        Self::cycle(&self.params, &mut self.levels, rhs, x);
    }

    fn describe(&self) -> String {
        format!(
            "amg({}, {}, {} levels)",
            self.params.coarsening.kind.name(),
            self.params.relax.kind.name(),
            self.levels.len()
        )
    }
}
