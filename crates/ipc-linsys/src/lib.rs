//! Pattern-reusing sparse linear solver for implicit contact simulation.
//!
//! Each Newton step of an implicit solver produces a system with the same
//! vertex adjacency and new values. This crate splits the work accordingly:
//!
//! - **Pattern** (`set_pattern`): block CSR structure over the free vertices,
//!   built once per adjacency change
//! - **Values** (`copy_off_diag_values`, `copy_diag_values`, ...): written in
//!   place at cached positions, never touching indices
//! - **Solve** (`analyze_pattern`, `factorize`, `solve`): AMG or relaxation
//!   preconditioned Krylov methods selected at run time by [`SolverParams`]
//!
//! Systems can be saved and restored with `write`/`load` for offline
//! reproduction.

pub mod assembler;
pub mod backend;
pub mod error;
pub mod params;
pub mod pattern;
pub mod persistence;
pub mod solver;
pub mod value_type;

pub use assembler::{Contribution, OffDiagEntry, ValueLayout};
pub use backend::{Backend, BackendError, IterationReport};
pub use error::{LinSysError, Result};
pub use params::{
    AsymmetryPolicy, BackendKind, CoarseningParams, CoarseningType, KrylovParams, PrecondClass,
    PrecondParams, RelaxParams, RelaxationType, SolverParams, SolverType,
};
pub use pattern::{DofMap, Pattern, PatternStats};
pub use solver::{AmgSolver, Phase, SolveDiagnostics};
pub use value_type::{BlockValue, BlockVector};
