//! Saving and restoring a system through the `ipc-io` file format.
//!
//! Blocks are expanded into scalar triplets on write and regrouped on load,
//! so a file written by a `Matrix3` engine can be loaded by a scalar one and
//! the other way round, as long as the row count divides the block size.

use std::collections::BTreeMap;
use std::path::Path;

use ipc_io::{SparseSystem, SparseTriplets};
use nalgebra::DVector;
use nalgebra_sparse::CsrMatrix;
use nalgebra_sparse::pattern::SparsityPattern;
use tracing::debug;

use crate::error::{LinSysError, Result};
use crate::pattern::{DofMap, Pattern, PatternStats};
use crate::solver::{AmgSolver, System};
use crate::value_type::BlockValue;

/// Expands every stored block, explicit zeros included, into scalar
/// triplets.
pub fn to_triplets<V: BlockValue>(matrix: &CsrMatrix<V>) -> SparseTriplets {
    let b = V::BLOCK;
    let mut triplets = SparseTriplets::new(matrix.nrows() * b, matrix.ncols() * b);
    for row in 0..matrix.nrows() {
        let lane = matrix.row(row);
        for (&col, value) in lane.col_indices().iter().zip(lane.values()) {
            for br in 0..b {
                for bc in 0..b {
                    triplets.push(row * b + br, col * b + bc, value.entry(br, bc));
                }
            }
        }
    }
    triplets
}

/// Regroups scalar triplets into a block pattern with values.
///
/// Duplicates are summed and every missing diagonal block is stored as
/// zero. Each block row becomes a free vertex.
pub fn from_triplets<V: BlockValue>(triplets: &SparseTriplets) -> Result<(Pattern, Vec<V>)> {
    let b = V::BLOCK;
    if triplets.nrows != triplets.ncols {
        return Err(LinSysError::InvalidPattern(format!(
            "system matrix is not square: {}x{}",
            triplets.nrows, triplets.ncols
        )));
    }
    if triplets.nrows % b != 0 {
        return Err(LinSysError::InvalidPattern(format!(
            "{} rows do not split into blocks of {b}",
            triplets.nrows
        )));
    }
    triplets.validate()?;

    let n = triplets.nrows / b;
    let mut blocks: BTreeMap<(usize, usize), V> = (0..n).map(|i| ((i, i), V::zero())).collect();
    for (r, c, v) in triplets.iter() {
        let block = blocks.entry((r / b, c / b)).or_insert_with(V::zero);
        *block.entry_mut(r % b, c % b) += v;
    }

    let mut offsets = vec![0usize; n + 1];
    let mut indices = Vec::with_capacity(blocks.len());
    let mut values = Vec::with_capacity(blocks.len());
    for ((row, col), value) in blocks {
        offsets[row + 1] += 1;
        indices.push(col);
        values.push(value);
    }
    for i in 0..n {
        offsets[i + 1] += offsets[i];
    }

    let sparsity = SparsityPattern::try_from_offsets_and_indices(n, n, offsets, indices)
        .map_err(|e| LinSysError::InvalidPattern(e.to_string()))?;
    let stats = PatternStats {
        num_vertices: n,
        num_fixed: 0,
        num_dofs: n,
        nnz: sparsity.nnz(),
        symmetrized_edges: 0,
    };
    let pattern = Pattern {
        dofs: DofMap::identity(n),
        sparsity,
        stats,
    };
    Ok((pattern, values))
}

impl<V: BlockValue> AmgSolver<V> {
    /// Writes the current matrix and `rhs` (DOF space, `V::BLOCK` scalars
    /// per DOF) to `path`.
    pub fn write(&self, path: impl AsRef<Path>, rhs: &DVector<f64>) -> Result<()> {
        let Some(system) = self.system.as_ref() else {
            return Err(LinSysError::NoPattern("write requires a pattern"));
        };
        let expected = system.dofs.num_dofs() * V::BLOCK;
        if rhs.len() != expected {
            return Err(LinSysError::DimensionMismatch {
                expected,
                found: rhs.len(),
            });
        }

        let path = path.as_ref();
        let file = SparseSystem::new(to_triplets(&system.matrix), rhs.as_slice().to_vec())?;
        ipc_io::write_system(path, &file)?;
        debug!(path = %path.display(), nnz = file.matrix.nnz(), "system written");
        Ok(())
    }

    /// Replaces pattern and values with the system stored at `path` and
    /// returns its right-hand side. Every vertex of a loaded system is free.
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<DVector<f64>> {
        let path = path.as_ref();
        let file = ipc_io::read_system(path)?;
        let (pattern, values) = from_triplets::<V>(&file.matrix)?;
        let system = System::with_values(pattern, values)?;
        debug!(
            path = %path.display(),
            dofs = system.dofs.num_dofs(),
            nnz = system.stats.nnz,
            "system loaded"
        );
        self.install(system);
        Ok(DVector::from_vec(file.rhs))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use nalgebra::Matrix2;

    use super::*;
    use crate::solver::Phase;

    #[test]
    fn duplicates_are_summed_and_diagonals_inserted() {
        let mut t = SparseTriplets::new(3, 3);
        t.push(0, 1, -1.0);
        t.push(0, 1, -0.5);
        t.push(0, 0, 2.0);
        t.push(2, 0, 4.0);
        let (pattern, values) = from_triplets::<f64>(&t).expect("square");
        assert_eq!(pattern.sparsity.major_offsets(), &[0, 2, 3, 5]);
        assert_eq!(pattern.sparsity.minor_indices(), &[0, 1, 1, 0, 2]);
        assert_eq!(values, vec![2.0, -1.5, 0.0, 4.0, 0.0]);
        assert_eq!(pattern.stats.num_dofs, 3);
    }

    #[test]
    fn scalars_regroup_into_blocks() {
        let mut t = SparseTriplets::new(4, 4);
        for (r, c, v) in [(0, 0, 4.0), (0, 1, 1.0), (1, 1, 5.0), (2, 3, -2.0), (3, 0, 7.0)] {
            t.push(r, c, v);
        }
        let (pattern, values) = from_triplets::<Matrix2<f64>>(&t).expect("even rows");
        assert_eq!(pattern.sparsity.minor_indices(), &[0, 0, 1]);
        assert_eq!(values[0], Matrix2::new(4.0, 1.0, 0.0, 5.0));
        assert_eq!(values[1], Matrix2::new(0.0, 0.0, 7.0, 0.0));
        assert_eq!(values[2], Matrix2::new(0.0, -2.0, 0.0, 0.0));

        let odd = SparseTriplets::new(3, 3);
        assert!(matches!(
            from_triplets::<Matrix2<f64>>(&odd),
            Err(LinSysError::InvalidPattern(_))
        ));
    }

    #[test]
    fn rectangular_systems_are_rejected() {
        let t = SparseTriplets::new(2, 3);
        assert!(matches!(from_triplets::<f64>(&t), Err(LinSysError::InvalidPattern(_))));
    }

    #[test]
    fn write_then_load_restores_the_engine() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("chain.mtx");

        let adjacency = vec![BTreeSet::from([1]), BTreeSet::from([0, 2]), BTreeSet::from([1])];
        let mut solver = AmgSolver::<f64>::default();
        assert!(matches!(
            solver.write(&path, &DVector::zeros(0)),
            Err(LinSysError::NoPattern(_))
        ));
        solver.set_pattern(&adjacency, &BTreeSet::new()).expect("pattern");
        solver
            .set_values(vec![2.0, -1.0, -1.0, 2.0, -1.0, -1.0, 2.0 + 1e-3])
            .expect("values");
        assert!(matches!(
            solver.write(&path, &DVector::zeros(2)),
            Err(LinSysError::DimensionMismatch { expected: 3, found: 2 })
        ));
        let rhs = DVector::from_vec(vec![0.1, 1.0 / 3.0, -7.25]);
        solver.write(&path, &rhs).expect("write");

        let mut loaded = AmgSolver::<f64>::default();
        let loaded_rhs = loaded.load(&path).expect("load");
        assert_eq!(loaded.phase(), Phase::PatternSet);
        assert_eq!(loaded.values(), solver.values());
        assert_eq!(loaded_rhs, rhs);
        assert_eq!(
            loaded.matrix().map(|m| m.pattern().clone()),
            solver.matrix().map(|m| m.pattern().clone())
        );
    }
}
