//! Built-in backend: runtime-selected preconditioner × Krylov solver.

use std::sync::Arc;

use nalgebra_sparse::CsrMatrix;
use nalgebra_sparse::pattern::SparsityPattern;
use tracing::debug;

use super::amg::Amg;
use super::csr;
use super::krylov;
use super::ops;
use super::relaxation::RelaxationPrecond;
use super::traits::{Backend, BackendError, IterationReport, KrylovSolver, Preconditioner};
use crate::params::{PrecondClass, SolverParams};
use crate::value_type::BlockValue;

/// Identity preconditioner (`precond.class = "dummy"`).
pub struct Identity;

impl<V: BlockValue> Preconditioner<V> for Identity {
    fn apply(&mut self, rhs: &[V::Vector], x: &mut [V::Vector]) {
        x.copy_from_slice(rhs);
    }

    fn describe(&self) -> String {
        "dummy".to_string()
    }
}

pub struct BuiltinBackend<V: BlockValue> {
    params: SolverParams,
    size: usize,
    matrix: Option<Arc<CsrMatrix<V>>>,
    precond: Option<Box<dyn Preconditioner<V>>>,
    krylov: Box<dyn KrylovSolver<V>>,
}

impl<V: BlockValue> BuiltinBackend<V> {
    pub fn new(params: &SolverParams) -> Self {
        Self {
            params: params.clone(),
            size: 0,
            matrix: None,
            precond: None,
            krylov: krylov::create(&params.solver),
        }
    }

    /// Diagonal blocks must be finite, invertible and have a positive
    /// diagonal; every other value must be finite.
    fn check_values(matrix: &CsrMatrix<V>) -> Result<(), BackendError> {
        for (i, d) in csr::diagonal(matrix).iter().enumerate() {
            if !d.is_finite() || !d.has_positive_diagonal() {
                return Err(BackendError(format!(
                    "non-positive diagonal in row {i}: {d:?}"
                )));
            }
            if d.inverse().is_none() {
                return Err(BackendError(format!("singular diagonal block in row {i}")));
            }
        }
        if let Some(k) = matrix.values().iter().position(|v| !v.is_finite()) {
            return Err(BackendError(format!("non-finite value at position {k}")));
        }
        Ok(())
    }

    fn build_precond(
        &self,
        matrix: Arc<CsrMatrix<V>>,
    ) -> Result<Box<dyn Preconditioner<V>>, BackendError> {
        if matrix.nrows() == 0 {
            return Ok(Box::new(Identity));
        }
        let precond: Box<dyn Preconditioner<V>> = match self.params.precond.class {
            PrecondClass::Amg => Box::new(Amg::new(&self.params.precond, matrix)?),
            PrecondClass::Relaxation => {
                Box::new(RelaxationPrecond::new(&self.params.precond.relax, matrix)?)
            }
            PrecondClass::Dummy => Box::new(Identity),
        };
        Ok(precond)
    }
}

impl<V: BlockValue> Backend<V> for BuiltinBackend<V> {
    fn name(&self) -> String {
        match &self.precond {
            Some(p) => format!("{} + {}", p.describe(), self.krylov.name()),
            None => self.params.describe(),
        }
    }

    fn build_hierarchy(&mut self, pattern: &SparsityPattern) -> Result<(), BackendError> {
        if pattern.major_dim() != pattern.minor_dim() {
            return Err(BackendError(format!(
                "pattern is not square: {}x{}",
                pattern.major_dim(),
                pattern.minor_dim()
            )));
        }
        self.size = pattern.major_dim();
        self.matrix = None;
        self.precond = None;
        self.krylov.allocate(self.size);
        debug!(rows = self.size, nnz = pattern.nnz(), "builtin backend sized");
        Ok(())
    }

    fn prepare_numeric(&mut self, matrix: &CsrMatrix<V>) -> Result<(), BackendError> {
        if matrix.nrows() != self.size || matrix.ncols() != self.size {
            return Err(BackendError(format!(
                "matrix is {}x{}, hierarchy was built for {}",
                matrix.nrows(),
                matrix.ncols(),
                self.size
            )));
        }
        self.matrix = None;
        self.precond = None;
        Self::check_values(matrix)?;

        let matrix = Arc::new(matrix.clone());
        self.precond = Some(self.build_precond(Arc::clone(&matrix))?);
        self.matrix = Some(matrix);
        Ok(())
    }

    fn iterate(
        &mut self,
        rhs: &[V::Vector],
        x: &mut [V::Vector],
    ) -> Result<IterationReport, BackendError> {
        let (Some(matrix), Some(precond)) = (self.matrix.as_ref(), self.precond.as_mut()) else {
            return Err("numeric setup has not been run".into());
        };
        if rhs.len() != self.size || x.len() != self.size {
            return Err(BackendError(format!(
                "vectors of length {} and {} for {} rows",
                rhs.len(),
                x.len(),
                self.size
            )));
        }

        if ops::norm(rhs) == 0.0 {
            ops::fill_zero(x);
            return Ok(IterationReport {
                iterations: 0,
                residual: 0.0,
                converged: true,
            });
        }
        Ok(self.krylov.solve(matrix, &mut **precond, rhs, x))
    }
}
