//! Value assembly into the pattern-owned value array.
//!
//! None of these operations touch row offsets or column indices: values are
//! written in place at positions resolved against the current pattern.
//! Every successful write demotes a factorized engine to `Analyzed`.

use nalgebra_sparse::pattern::SparsityPattern;

use crate::error::{LinSysError, Result};
use crate::pattern::DofMap;
use crate::solver::AmgSolver;
use crate::value_type::BlockValue;

/// One physical contribution keyed by original vertex indices.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Contribution<V> {
    pub vertex: usize,
    pub neighbor: usize,
    pub value: V,
}

impl<V> Contribution<V> {
    pub fn new(vertex: usize, neighbor: usize, value: V) -> Self {
        Self {
            vertex,
            neighbor,
            value,
        }
    }
}

/// An off-diagonal pattern entry: DOF row, DOF column and its position in
/// the value array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffDiagEntry {
    pub row: usize,
    pub col: usize,
    pub position: usize,
}

/// Cached value-array positions of one pattern.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValueLayout {
    /// Diagonal position of every row
    diag: Vec<usize>,
    off_diag: Vec<OffDiagEntry>,
}

impl ValueLayout {
    pub fn new(pattern: &SparsityPattern) -> Self {
        let offsets = pattern.major_offsets();
        let mut diag = Vec::with_capacity(pattern.major_dim());
        let mut off_diag = Vec::with_capacity(pattern.nnz().saturating_sub(pattern.major_dim()));
        for row in 0..pattern.major_dim() {
            for (k, &col) in pattern.lane(row).iter().enumerate() {
                let position = offsets[row] + k;
                if col == row {
                    diag.push(position);
                } else {
                    off_diag.push(OffDiagEntry { row, col, position });
                }
            }
        }
        Self { diag, off_diag }
    }

    pub fn diag(&self) -> &[usize] {
        &self.diag
    }

    pub fn off_diag(&self) -> &[OffDiagEntry] {
        &self.off_diag
    }
}

/// Value-array position of the entry `(vertex, neighbor)`.
fn position(
    pattern: &SparsityPattern,
    dofs: &DofMap,
    vertex: usize,
    neighbor: usize,
) -> Result<usize> {
    let mismatch = LinSysError::PatternMismatch {
        row: vertex,
        col: neighbor,
    };
    let (Some(r), Some(c)) = (dofs.dof(vertex), dofs.dof(neighbor)) else {
        return Err(mismatch);
    };
    pattern
        .lane(r)
        .binary_search(&c)
        .map(|k| pattern.major_offsets()[r] + k)
        .map_err(|_| mismatch)
}

impl<V: BlockValue> AmgSolver<V> {
    /// Rebuilds the cached diagonal and off-diagonal positions. Runs
    /// automatically on `set_pattern` and `load`.
    pub fn copy_off_diag_indices(&mut self) -> Result<()> {
        let system = self.system_mut("copy_off_diag_indices requires a pattern")?;
        system.layout = ValueLayout::new(system.matrix.pattern());
        Ok(())
    }

    /// Off-diagonal entries of the current pattern, row-major.
    pub fn off_diag_entries(&self) -> &[OffDiagEntry] {
        self.system.as_ref().map_or(&[], |s| s.layout.off_diag())
    }

    /// Current values in pattern order.
    pub fn values(&self) -> &[V] {
        self.system.as_ref().map_or(&[], |s| s.matrix.values())
    }

    /// Replaces every off-diagonal value by the sum of the contributions
    /// addressed to it; off-diagonals without a contribution become zero.
    ///
    /// Every contribution is resolved before anything is written, so a
    /// [`LinSysError::PatternMismatch`] leaves the values untouched.
    pub fn copy_off_diag_values(&mut self, contributions: &[Contribution<V>]) -> Result<()> {
        let system = self.system_mut("copy_off_diag_values requires a pattern")?;
        let pattern = system.matrix.pattern();
        let positions = contributions
            .iter()
            .map(|c| {
                if c.vertex == c.neighbor {
                    return Err(LinSysError::PatternMismatch {
                        row: c.vertex,
                        col: c.neighbor,
                    });
                }
                position(pattern, &system.dofs, c.vertex, c.neighbor)
            })
            .collect::<Result<Vec<_>>>()?;

        let values = system.matrix.values_mut();
        for entry in system.layout.off_diag() {
            values[entry.position] = V::zero();
        }
        for (c, &k) in contributions.iter().zip(&positions) {
            values[k] += c.value;
        }
        self.values_changed();
        Ok(())
    }

    /// Replaces every diagonal value by the sum of the contributions
    /// addressed to its vertex.
    pub fn copy_diag_values(&mut self, diagonal: &[(usize, V)]) -> Result<()> {
        let system = self.system_mut("copy_diag_values requires a pattern")?;
        let rows = diagonal
            .iter()
            .map(|&(vertex, _)| {
                system.dofs.dof(vertex).ok_or(LinSysError::PatternMismatch {
                    row: vertex,
                    col: vertex,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let values = system.matrix.values_mut();
        for &k in system.layout.diag() {
            values[k] = V::zero();
        }
        for (&(_, value), &row) in diagonal.iter().zip(&rows) {
            values[system.layout.diag()[row]] += value;
        }
        self.values_changed();
        Ok(())
    }

    /// Overwrites every stored value with `f(vertex, neighbor)`, visiting
    /// entries in pattern order.
    pub fn fill_values<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(usize, usize) -> V,
    {
        let system = self.system_mut("fill_values requires a pattern")?;
        let vertices = system.dofs.vertices();
        let (offsets, cols, values) = system.matrix.csr_data_mut();
        for (row, &vertex) in vertices.iter().enumerate() {
            for k in offsets[row]..offsets[row + 1] {
                values[k] = f(vertex, vertices[cols[k]]);
            }
        }
        self.values_changed();
        Ok(())
    }

    /// Replaces the whole value array; `values` must follow pattern order.
    pub fn set_values(&mut self, values: Vec<V>) -> Result<()> {
        let system = self.system_mut("set_values requires a pattern")?;
        let slot = system.matrix.values_mut();
        if values.len() != slot.len() {
            return Err(LinSysError::DimensionMismatch {
                expected: slot.len(),
                found: values.len(),
            });
        }
        slot.copy_from_slice(&values);
        self.values_changed();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::solver::Phase;

    fn chain(n: usize) -> Vec<BTreeSet<usize>> {
        (0..n)
            .map(|i| {
                let mut s = BTreeSet::new();
                if i > 0 {
                    s.insert(i - 1);
                }
                if i + 1 < n {
                    s.insert(i + 1);
                }
                s
            })
            .collect()
    }

    #[test]
    fn layout_lists_diagonal_and_off_diagonal_positions() {
        let mut solver = AmgSolver::<f64>::default();
        solver.set_pattern(&chain(3), &BTreeSet::new()).expect("pattern");
        let entries = solver.off_diag_entries().to_vec();
        assert_eq!(
            entries,
            vec![
                OffDiagEntry { row: 0, col: 1, position: 1 },
                OffDiagEntry { row: 1, col: 0, position: 2 },
                OffDiagEntry { row: 1, col: 2, position: 4 },
                OffDiagEntry { row: 2, col: 1, position: 5 },
            ]
        );
        solver.copy_off_diag_indices().expect("idempotent");
        assert_eq!(solver.off_diag_entries(), entries.as_slice());
    }

    #[test]
    fn contributions_accumulate_at_their_positions() {
        let mut solver = AmgSolver::<f64>::default();
        solver.set_pattern(&chain(3), &BTreeSet::new()).expect("pattern");
        solver
            .copy_off_diag_values(&[
                Contribution::new(0, 1, -1.0),
                Contribution::new(0, 1, -0.5),
                Contribution::new(2, 1, -2.0),
            ])
            .expect("contributions in pattern");
        solver
            .copy_diag_values(&[(0, 3.0), (1, 4.0), (2, 5.0), (1, 1.0)])
            .expect("diagonal");
        assert_eq!(solver.values(), &[3.0, -1.5, 0.0, 5.0, 0.0, -2.0, 5.0]);

        // A second call replaces rather than accumulates across calls.
        solver
            .copy_off_diag_values(&[Contribution::new(1, 0, -1.0)])
            .expect("contributions in pattern");
        assert_eq!(solver.values(), &[3.0, 0.0, -1.0, 5.0, 0.0, 0.0, 5.0]);
    }

    #[test]
    fn fixed_vertices_are_pattern_mismatches() {
        let mut solver = AmgSolver::<f64>::default();
        solver.set_pattern(&chain(3), &BTreeSet::from([1])).expect("pattern");
        solver.set_values(vec![2.0, 2.0]).expect("values");

        let err = solver
            .copy_off_diag_values(&[Contribution::new(0, 1, -1.0)])
            .expect_err("vertex 1 is fixed");
        assert!(matches!(err, LinSysError::PatternMismatch { row: 0, col: 1 }));
        assert!(matches!(
            solver.copy_diag_values(&[(1, 1.0)]),
            Err(LinSysError::PatternMismatch { row: 1, col: 1 })
        ));
        assert!(matches!(
            solver.copy_off_diag_values(&[Contribution::new(0, 2, 1.0)]),
            Err(LinSysError::PatternMismatch { row: 0, col: 2 })
        ));
        assert_eq!(solver.values(), &[2.0, 2.0]);
    }

    #[test]
    fn fill_values_sees_original_vertex_ids() {
        let mut solver = AmgSolver::<f64>::default();
        solver.set_pattern(&chain(4), &BTreeSet::from([0])).expect("pattern");
        solver
            .fill_values(|v, n| if v == n { 10.0 * v as f64 } else { -((v * n) as f64) })
            .expect("fill");
        // Rows are vertices 1, 2, 3.
        assert_eq!(solver.values(), &[10.0, -2.0, -2.0, 20.0, -6.0, -6.0, 30.0]);
    }

    #[test]
    fn value_writes_demote_factorized() {
        let mut solver = AmgSolver::<f64>::default();
        solver.set_pattern(&chain(2), &BTreeSet::new()).expect("pattern");
        solver.set_values(vec![2.0, -1.0, -1.0, 2.0]).expect("values");
        solver.analyze_pattern().expect("analyze");
        solver.factorize().expect("factorize");
        assert_eq!(solver.phase(), Phase::Factorized);

        solver.copy_diag_values(&[(0, 3.0), (1, 3.0)]).expect("diagonal");
        assert_eq!(solver.phase(), Phase::Analyzed);
        solver.factorize().expect("refactorize");
        assert_eq!(solver.phase(), Phase::Factorized);

        assert!(matches!(
            solver.set_values(vec![1.0]),
            Err(LinSysError::DimensionMismatch { expected: 4, found: 1 })
        ));
        assert_eq!(solver.phase(), Phase::Factorized);
    }
}
