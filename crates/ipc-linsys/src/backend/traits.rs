//! Backend trait definitions.
//!
//! The engine owns the pattern and the values; everything numerical past
//! that point (multigrid hierarchy, smoothers, Krylov iteration) sits
//! behind these traits so the algorithm family is chosen at run time.

use nalgebra_sparse::CsrMatrix;
use nalgebra_sparse::pattern::SparsityPattern;

use crate::value_type::BlockValue;

/// Error type for backend operations.
#[derive(Debug, Clone)]
pub struct BackendError(pub String);

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for BackendError {}

impl From<String> for BackendError {
    fn from(s: String) -> Self {
        BackendError(s)
    }
}

impl From<&str> for BackendError {
    fn from(s: &str) -> Self {
        BackendError(s.to_string())
    }
}

/// Outcome of one iterative solve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IterationReport {
    pub iterations: usize,
    /// Final residual norm relative to `||b||`
    pub residual: f64,
    pub converged: bool,
}

/// Iterative solver capability consumed by the engine.
///
/// Call order is `build_hierarchy` once per pattern, `prepare_numeric` once
/// per value update, then any number of `iterate` calls.
pub trait Backend<V: BlockValue>: Send {
    /// Human-readable description of the configured method.
    fn name(&self) -> String;

    /// Symbolic setup for a new pattern: sizes the Krylov workspace.
    fn build_hierarchy(&mut self, pattern: &SparsityPattern) -> Result<(), BackendError>;

    /// Numeric setup: validates the values and builds the preconditioner.
    fn prepare_numeric(&mut self, matrix: &CsrMatrix<V>) -> Result<(), BackendError>;

    /// Solves `A x = rhs`, using `x` as the initial guess.
    fn iterate(
        &mut self,
        rhs: &[V::Vector],
        x: &mut [V::Vector],
    ) -> Result<IterationReport, BackendError>;
}

/// Approximate inverse `x ≈ A⁻¹ rhs`.
pub trait Preconditioner<V: BlockValue>: Send {
    /// Overwrites `x` with the preconditioned `rhs`.
    fn apply(&mut self, rhs: &[V::Vector], x: &mut [V::Vector]);

    fn describe(&self) -> String;
}

/// Krylov (or stationary) iteration driven by a preconditioner.
pub trait KrylovSolver<V: BlockValue>: Send {
    fn name(&self) -> &'static str;

    /// Resizes the work vectors for `n` block rows.
    fn allocate(&mut self, n: usize);

    fn solve(
        &mut self,
        a: &CsrMatrix<V>,
        precond: &mut dyn Preconditioner<V>,
        rhs: &[V::Vector],
        x: &mut [V::Vector],
    ) -> IterationReport;
}
