//! Numerical backend abstraction layer.
//!
//! The solver engine owns pattern and values and hands them to a backend
//! through the [`Backend`] trait. Which backend, preconditioner and Krylov
//! method serve a solve is decided by [`SolverParams`] at run time.
//!
//! # Architecture
//!
//! ```text
//! AmgSolver (pattern + CsrMatrix<V> values)
//!         │
//!         ▼
//! Backend trait (build_hierarchy, prepare_numeric, iterate)
//!         │
//!         ▼
//! BuiltinBackend
//!    ┌────┴──────────────┐
//!    ▼                   ▼
//! Preconditioner      KrylovSolver
//! (amg | relaxation   (cg | bicgstab | gmres
//!  | dummy)            | lgmres | preonly)
//! ```

pub mod amg;
pub mod builtin;
pub mod coarsening;
pub mod csr;
pub mod krylov;
pub mod ops;
pub mod relaxation;
pub mod traits;

pub use builtin::BuiltinBackend;
pub use traits::*;

use crate::params::{BackendKind, SolverParams};
use crate::value_type::BlockValue;

/// Creates the backend selected by `params.backend`.
pub fn create<V: BlockValue>(params: &SolverParams) -> Result<Box<dyn Backend<V>>, BackendError> {
    match params.backend {
        BackendKind::Builtin => Ok(Box::new(BuiltinBackend::<V>::new(params))),
    }
}
