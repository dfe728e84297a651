//! Sparsity pattern construction from vertex adjacency.
//!
//! Fixed (Dirichlet) vertices are dropped from the system by renumbering:
//! free vertices keep their relative order and get contiguous DOF indices.
//! Each free vertex contributes one block row holding itself and its free
//! neighbours.

use std::collections::BTreeSet;

use nalgebra::DVector;
use nalgebra_sparse::pattern::SparsityPattern;
use tracing::{debug, warn};

use crate::error::{LinSysError, Result};
use crate::params::AsymmetryPolicy;

/// Bijection between free vertices and DOF indices.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DofMap {
    vertex_to_dof: Vec<Option<usize>>,
    dof_to_vertex: Vec<usize>,
}

impl DofMap {
    /// Numbers the vertices of `0..num_vertices` not contained in `fixed`.
    pub fn new(num_vertices: usize, fixed: &BTreeSet<usize>) -> Self {
        let mut vertex_to_dof = vec![None; num_vertices];
        let mut dof_to_vertex = Vec::with_capacity(num_vertices);
        for (vertex, slot) in vertex_to_dof.iter_mut().enumerate() {
            if !fixed.contains(&vertex) {
                *slot = Some(dof_to_vertex.len());
                dof_to_vertex.push(vertex);
            }
        }
        Self {
            vertex_to_dof,
            dof_to_vertex,
        }
    }

    /// Every vertex free, DOF `i` is vertex `i`.
    pub fn identity(num_vertices: usize) -> Self {
        Self::new(num_vertices, &BTreeSet::new())
    }

    /// DOF of a vertex; `None` for fixed or out-of-range vertices.
    pub fn dof(&self, vertex: usize) -> Option<usize> {
        self.vertex_to_dof.get(vertex).copied().flatten()
    }

    /// Vertex behind a DOF; `None` past the last DOF.
    pub fn vertex(&self, dof: usize) -> Option<usize> {
        self.dof_to_vertex.get(dof).copied()
    }

    /// Vertex of every DOF, in DOF order.
    pub fn vertices(&self) -> &[usize] {
        &self.dof_to_vertex
    }

    pub fn num_dofs(&self) -> usize {
        self.dof_to_vertex.len()
    }

    pub fn num_vertices(&self) -> usize {
        self.vertex_to_dof.len()
    }

    pub fn is_fixed(&self, vertex: usize) -> bool {
        vertex < self.num_vertices() && self.vertex_to_dof[vertex].is_none()
    }

    /// Expands a DOF-space vector (`block` scalars per DOF) to vertex space,
    /// writing `fixed_fill` into the components of fixed vertices.
    pub fn scatter(
        &self,
        dof_values: &DVector<f64>,
        block: usize,
        fixed_fill: f64,
    ) -> Result<DVector<f64>> {
        let expected = self.num_dofs() * block;
        if dof_values.len() != expected {
            return Err(LinSysError::DimensionMismatch {
                expected,
                found: dof_values.len(),
            });
        }
        let mut out = DVector::from_element(self.num_vertices() * block, fixed_fill);
        for (dof, &vertex) in self.dof_to_vertex.iter().enumerate() {
            for k in 0..block {
                out[vertex * block + k] = dof_values[dof * block + k];
            }
        }
        Ok(out)
    }

    /// Restricts a vertex-space vector to the free DOFs.
    pub fn gather(&self, vertex_values: &DVector<f64>, block: usize) -> Result<DVector<f64>> {
        let expected = self.num_vertices() * block;
        if vertex_values.len() != expected {
            return Err(LinSysError::DimensionMismatch {
                expected,
                found: vertex_values.len(),
            });
        }
        Ok(DVector::from_fn(self.num_dofs() * block, |i, _| {
            vertex_values[self.dof_to_vertex[i / block] * block + i % block]
        }))
    }
}

/// Summary of one pattern build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PatternStats {
    pub num_vertices: usize,
    pub num_fixed: usize,
    pub num_dofs: usize,
    /// Stored block entries, diagonal included
    pub nnz: usize,
    /// Reverse edges added to make the adjacency symmetric
    pub symmetrized_edges: usize,
}

/// DOF numbering plus the block sparsity pattern over the free DOFs.
#[derive(Debug, Clone)]
pub struct Pattern {
    pub dofs: DofMap,
    pub sparsity: SparsityPattern,
    pub stats: PatternStats,
}

impl Pattern {
    /// Builds the pattern of the free vertices of `adjacency`.
    ///
    /// Every row is sorted, holds its diagonal exactly once and the pattern
    /// is structurally symmetric. A free vertex whose neighbours are all
    /// fixed keeps a diagonal-only row.
    pub fn build(
        adjacency: &[BTreeSet<usize>],
        fixed: &BTreeSet<usize>,
        policy: AsymmetryPolicy,
    ) -> Result<Self> {
        let n = adjacency.len();
        if let Some(&v) = fixed.iter().find(|&&v| v >= n) {
            return Err(LinSysError::InvalidPattern(format!(
                "fixed vertex {v} out of range for {n} vertices"
            )));
        }

        let mut symmetrized_edges = 0;
        for (v, neighbours) in adjacency.iter().enumerate() {
            for &u in neighbours {
                if u >= n {
                    return Err(LinSysError::InvalidPattern(format!(
                        "vertex {v} lists neighbour {u}, but there are only {n} vertices"
                    )));
                }
                if u != v && !adjacency[u].contains(&v) {
                    if policy == AsymmetryPolicy::Reject {
                        return Err(LinSysError::InvalidPattern(format!(
                            "edge ({v}, {u}) has no reverse edge ({u}, {v})"
                        )));
                    }
                    symmetrized_edges += 1;
                }
            }
        }
        if symmetrized_edges > 0 {
            warn!(edges = symmetrized_edges, "adjacency is not symmetric, adding reverse edges");
        }

        let dofs = DofMap::new(n, fixed);
        let mut rows: Vec<BTreeSet<usize>> = (0..dofs.num_dofs())
            .map(|d| BTreeSet::from([d]))
            .collect();
        for (v, neighbours) in adjacency.iter().enumerate() {
            let Some(dv) = dofs.dof(v) else {
                continue;
            };
            for &u in neighbours {
                if let Some(du) = dofs.dof(u) {
                    rows[dv].insert(du);
                    rows[du].insert(dv);
                }
            }
        }

        let mut offsets = Vec::with_capacity(rows.len() + 1);
        let mut indices = Vec::new();
        offsets.push(0);
        for row in rows {
            indices.extend(row);
            offsets.push(indices.len());
        }

        let num_dofs = dofs.num_dofs();
        let sparsity =
            SparsityPattern::try_from_offsets_and_indices(num_dofs, num_dofs, offsets, indices)
                .map_err(|e| LinSysError::InvalidPattern(e.to_string()))?;

        let stats = PatternStats {
            num_vertices: n,
            num_fixed: fixed.len(),
            num_dofs,
            nnz: sparsity.nnz(),
            symmetrized_edges,
        };
        debug!(
            vertices = stats.num_vertices,
            fixed = stats.num_fixed,
            dofs = stats.num_dofs,
            nnz = stats.nnz,
            "pattern built"
        );

        Ok(Self {
            dofs,
            sparsity,
            stats,
        })
    }
}
