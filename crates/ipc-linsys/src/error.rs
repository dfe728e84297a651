//! Error types for the solver engine.

use nalgebra::DVector;
use thiserror::Error;

use crate::backend::BackendError;

pub type Result<T> = std::result::Result<T, LinSysError>;

#[derive(Error, Debug)]
pub enum LinSysError {
    /// Adjacency or fixed-vertex input that cannot form a pattern.
    #[error("invalid pattern: {0}")]
    InvalidPattern(String),

    /// A lifecycle step was invoked before the step it depends on.
    #[error("no pattern available: {0}")]
    NoPattern(&'static str),

    /// A value contribution addressed a position the pattern does not have.
    #[error("pattern mismatch: entry ({row}, {col}) is not part of the current pattern")]
    PatternMismatch { row: usize, col: usize },

    #[error("factorization failed: {0}")]
    FactorizationFailure(String),

    /// The backend could not run the iteration at all.
    #[error("solve failed: {0}")]
    SolveFailure(String),

    /// The iteration cap was reached first. `solution` is the best-effort
    /// iterate; the caller decides whether it is usable.
    #[error("no convergence after {iterations} iterations (relative residual {residual:e})")]
    ConvergenceFailure {
        iterations: usize,
        residual: f64,
        solution: DVector<f64>,
    },

    #[error("dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("invalid solver configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] ipc_io::IoError),
}

impl LinSysError {
    /// A backend error raised while iterating rather than during setup.
    pub fn solve_failure(err: BackendError) -> Self {
        LinSysError::SolveFailure(err.0)
    }
}

/// Setup-phase backend errors.
impl From<BackendError> for LinSysError {
    fn from(err: BackendError) -> Self {
        LinSysError::FactorizationFailure(err.0)
    }
}

impl From<serde_json::Error> for LinSysError {
    fn from(err: serde_json::Error) -> Self {
        LinSysError::InvalidConfig(err.to_string())
    }
}
