//! Aggregation-based coarsening.
//!
//! Fine rows are grouped into aggregates along strong connections; each
//! aggregate becomes one coarse row. The prolongator is either the
//! piecewise-constant tentative operator (plain aggregation) or that
//! operator after one damped-Jacobi smoothing step (smoothed aggregation).

use nalgebra_sparse::CsrMatrix;
use rayon::prelude::*;

use super::csr;
use super::traits::BackendError;
use crate::params::{CoarseningParams, CoarseningType};
use crate::value_type::BlockValue;

/// Strong-connection flags, one per stored entry of `a`.
///
/// An off-diagonal entry is strong when
/// `||a_ij||² > eps² ||a_ii|| ||a_jj||`; diagonal entries are never strong.
pub fn strong_connections<V: BlockValue>(a: &CsrMatrix<V>, eps: f64) -> Vec<bool> {
    let diag: Vec<f64> = csr::diagonal(a).iter().map(|d| d.frobenius()).collect();
    let eps2 = eps * eps;
    let offsets = a.row_offsets();
    let cols = a.col_indices();
    let vals = a.values();
    let mut strong = vec![false; vals.len()];
    for i in 0..a.nrows() {
        for k in offsets[i]..offsets[i + 1] {
            let j = cols[k];
            strong[k] = j != i && vals[k].frobenius_sq() > eps2 * diag[i] * diag[j];
        }
    }
    strong
}

/// Aggregate membership of every fine row.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregates {
    pub count: usize,
    /// `None` marks a row excluded from the coarse space (no strong
    /// connections).
    pub id: Vec<Option<usize>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum State {
    Undone,
    Removed,
    In(usize),
}

impl Aggregates {
    /// Three-pass plain aggregation.
    ///
    /// 1. Rows without strong connections are removed.
    /// 2. Each row not yet claimed seeds an aggregate together with its
    ///    strong neighbours; the neighbours' unclaimed strong neighbours join
    ///    tentatively.
    /// 3. Aggregates emptied by later seeds are dropped and ids compacted.
    pub fn plain<V: BlockValue>(a: &CsrMatrix<V>, strong: &[bool]) -> Self {
        let n = a.nrows();
        let offsets = a.row_offsets();
        let cols = a.col_indices();
        let strong_row = move |i: usize| {
            (offsets[i]..offsets[i + 1])
                .filter(move |&k| strong[k])
                .map(move |k| cols[k])
        };

        let mut state: Vec<State> = (0..n)
            .map(|i| {
                if strong_row(i).next().is_some() {
                    State::Undone
                } else {
                    State::Removed
                }
            })
            .collect();

        let mut count = 0;
        let mut neighbours = Vec::new();
        for i in 0..n {
            if state[i] != State::Undone {
                continue;
            }
            let id = count;
            count += 1;
            state[i] = State::In(id);

            neighbours.clear();
            for c in strong_row(i) {
                if state[c] != State::Removed {
                    state[c] = State::In(id);
                    neighbours.push(c);
                }
            }
            for &c in &neighbours {
                for cc in strong_row(c) {
                    if state[cc] == State::Undone {
                        state[cc] = State::In(id);
                    }
                }
            }
        }

        // Compact: seeds may lose every member to a later aggregate.
        let mut used = vec![false; count];
        for s in &state {
            if let State::In(g) = *s {
                used[g] = true;
            }
        }
        let mut renumber = vec![0; count];
        let mut next = 0;
        for g in 0..count {
            renumber[g] = next;
            if used[g] {
                next += 1;
            }
        }

        let id = state
            .into_iter()
            .map(|s| match s {
                State::In(g) => Some(renumber[g]),
                _ => None,
            })
            .collect();
        Self { count: next, id }
    }
}

/// Interpolation between one level and the next coarser one.
pub struct Transfer<V: BlockValue> {
    /// Prolongation (fine × coarse)
    pub p: CsrMatrix<V>,
    /// Restriction (coarse × fine)
    pub r: CsrMatrix<V>,
}

/// Builds transfer and coarse operators level by level.
#[derive(Debug, Clone)]
pub struct Coarsening {
    kind: CoarseningType,
    eps_strong: f64,
    over_interp: f64,
}

impl Coarsening {
    pub fn new(params: &CoarseningParams) -> Self {
        Self {
            kind: params.kind,
            eps_strong: params.eps_strong,
            over_interp: params.over_interp(),
        }
    }

    /// Transfer operators for `a`, or `None` when no aggregate can be formed
    /// (every row is isolated).
    ///
    /// Smoothed aggregation halves the strength threshold after every level.
    pub fn transfer_operators<V: BlockValue>(
        &mut self,
        a: &CsrMatrix<V>,
    ) -> Result<Option<Transfer<V>>, BackendError> {
        let strong = strong_connections(a, self.eps_strong);
        let aggregates = Aggregates::plain(a, &strong);
        if aggregates.count == 0 {
            return Ok(None);
        }

        let tentative = tentative_prolongation::<V>(&aggregates)?;
        let p = match self.kind {
            CoarseningType::Aggregation => tentative,
            CoarseningType::SmoothedAggregation => {
                self.eps_strong *= 0.5;
                smooth_prolongation(a, &strong, &tentative, self.over_interp)?
            }
        };
        let r = csr::transpose(&p)?;
        Ok(Some(Transfer { p, r }))
    }

    /// Galerkin operator `R A P`. Plain aggregation scales it by
    /// `1 / over_interp` to compensate for the piecewise-constant
    /// interpolation.
    pub fn coarse_operator<V: BlockValue>(
        &self,
        a: &CsrMatrix<V>,
        transfer: &Transfer<V>,
    ) -> Result<CsrMatrix<V>, BackendError> {
        let ap = csr::product(a, &transfer.p)?;
        let mut ac = csr::product(&transfer.r, &ap)?;
        if self.kind == CoarseningType::Aggregation {
            let scale = 1.0 / self.over_interp;
            ac.values_mut().iter_mut().for_each(|v| *v = v.scaled(scale));
        }
        Ok(ac)
    }
}

/// Piecewise-constant prolongator with identity blocks; removed rows are
/// empty.
pub fn tentative_prolongation<V: BlockValue>(
    aggregates: &Aggregates,
) -> Result<CsrMatrix<V>, BackendError> {
    let rows = aggregates
        .id
        .iter()
        .map(|id| match id {
            Some(g) => vec![(*g, V::identity())],
            None => Vec::new(),
        })
        .collect();
    csr::assemble_rows(aggregates.count, rows)
}

/// `P = (I - ω D_F⁻¹ A_F) P_tent`.
///
/// `A_F` keeps the strong entries of `A`; weak off-diagonal entries are
/// lumped into its diagonal `D_F`. `ω = over_interp / ρ` with `ρ` the
/// Gershgorin bound of `D_F⁻¹ A_F`.
fn smooth_prolongation<V: BlockValue>(
    a: &CsrMatrix<V>,
    strong: &[bool],
    tentative: &CsrMatrix<V>,
    over_interp: f64,
) -> Result<CsrMatrix<V>, BackendError> {
    let n = a.nrows();
    let offsets = a.row_offsets();
    let cols = a.col_indices();
    let vals = a.values();

    let filtered_diag: Vec<V> = (0..n)
        .map(|i| {
            let mut d = V::zero();
            for k in offsets[i]..offsets[i + 1] {
                if cols[k] == i || !strong[k] {
                    d += vals[k];
                }
            }
            d
        })
        .collect();
    let dinv = filtered_diag
        .iter()
        .enumerate()
        .map(|(i, d)| {
            d.inverse()
                .ok_or_else(|| BackendError(format!("singular filtered diagonal in row {i}")))
        })
        .collect::<Result<Vec<V>, BackendError>>()?;

    let rho = (0..n)
        .into_par_iter()
        .map(|i| {
            let mut sum = 1.0;
            for k in offsets[i]..offsets[i + 1] {
                if cols[k] != i && strong[k] {
                    sum += dinv[i].mul_block(&vals[k]).frobenius();
                }
            }
            sum
        })
        .reduce(|| 0.0, f64::max);
    let omega = over_interp / rho;

    let rows: Vec<Vec<(usize, V)>> = (0..n)
        .into_par_iter()
        .map(|i| {
            let scale = dinv[i].scaled(-omega);
            let mut row: Vec<(usize, V)> = Vec::new();
            let tent = tentative.row(i);
            for (&g, v) in tent.col_indices().iter().zip(tent.values()) {
                row.push((g, *v));
            }
            for k in offsets[i]..offsets[i + 1] {
                let j = cols[k];
                let a_f = if j == i {
                    filtered_diag[i]
                } else if strong[k] {
                    vals[k]
                } else {
                    continue;
                };
                let coef = scale.mul_block(&a_f);
                let tj = tentative.row(j);
                for (&g, v) in tj.col_indices().iter().zip(tj.values()) {
                    row.push((g, coef.mul_block(v)));
                }
            }
            row
        })
        .collect();
    csr::assemble_rows(tentative.ncols(), rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ops;

    /// 2D five-point Laplacian on an `m × m` grid.
    fn poisson_2d(m: usize) -> CsrMatrix<f64> {
        let idx = |x: usize, y: usize| y * m + x;
        let rows = (0..m * m)
            .map(|i| {
                let (x, y) = (i % m, i / m);
                let mut row = vec![(i, 4.0)];
                if x > 0 {
                    row.push((idx(x - 1, y), -1.0));
                }
                if x + 1 < m {
                    row.push((idx(x + 1, y), -1.0));
                }
                if y > 0 {
                    row.push((idx(x, y - 1), -1.0));
                }
                if y + 1 < m {
                    row.push((idx(x, y + 1), -1.0));
                }
                row
            })
            .collect();
        csr::assemble_rows(m * m, rows).expect("valid rows")
    }

    #[test]
    fn laplacian_off_diagonals_are_strong() {
        let a = poisson_2d(3);
        let strong = strong_connections(&a, 0.08);
        for i in 0..a.nrows() {
            let row = a.row(i);
            for (k, &j) in row.col_indices().iter().enumerate() {
                assert_eq!(strong[a.row_offsets()[i] + k], j != i);
            }
        }
    }

    #[test]
    fn aggregation_covers_every_connected_row() {
        let a = poisson_2d(6);
        let strong = strong_connections(&a, 0.08);
        let agg = Aggregates::plain(&a, &strong);
        assert!(agg.count > 0 && agg.count < a.nrows());
        assert!(agg.id.iter().all(|id| matches!(id, Some(g) if *g < agg.count)));
        for g in 0..agg.count {
            assert!(agg.id.contains(&Some(g)), "aggregate {g} is empty");
        }
    }

    #[test]
    fn isolated_rows_are_removed() {
        let a = csr::assemble_rows(
            3,
            vec![vec![(0, 2.0), (1, -1.0)], vec![(0, -1.0), (1, 2.0)], vec![(2, 5.0)]],
        )
        .expect("valid rows");
        let strong = strong_connections(&a, 0.08);
        let agg = Aggregates::plain(&a, &strong);
        assert_eq!(agg.count, 1);
        assert_eq!(agg.id, vec![Some(0), Some(0), None]);

        let p = tentative_prolongation::<f64>(&agg).expect("tentative");
        assert_eq!(p.row(2).nnz(), 0);
    }

    #[test]
    fn smoothed_prolongation_preserves_constants_in_the_interior() {
        let a = poisson_2d(8);
        let mut coarsening = Coarsening::new(&CoarseningParams::default());
        let transfer = coarsening
            .transfer_operators(&a)
            .expect("setup")
            .expect("aggregates");
        // P 1 = 1 - ω D⁻¹ A 1, and A 1 vanishes away from the boundary.
        let ones = vec![1.0; transfer.p.ncols()];
        let mut p1 = vec![0.0; a.nrows()];
        ops::spmv(&transfer.p, &ones, &mut p1);
        let center = 3 * 8 + 3;
        assert!((p1[center] - 1.0).abs() < 1e-12);
        assert_eq!(coarsening.eps_strong, 0.04);
    }

    #[test]
    fn coarse_operator_is_symmetric() {
        let a = poisson_2d(7);
        for kind in [CoarseningType::Aggregation, CoarseningType::SmoothedAggregation] {
            let params = CoarseningParams {
                kind,
                ..Default::default()
            };
            let mut coarsening = Coarsening::new(&params);
            let transfer = coarsening
                .transfer_operators(&a)
                .expect("setup")
                .expect("aggregates");
            let ac = coarsening.coarse_operator(&a, &transfer).expect("galerkin");
            let dense = csr::to_dense(&ac);
            assert_eq!(dense.nrows(), transfer.p.ncols());
            assert!((&dense - dense.transpose()).amax() < 1e-12);
        }
    }
}
