//! Solver engine.
//!
//! [`AmgSolver`] owns the pattern, the value array and the backend, and
//! enforces the lifecycle
//!
//! ```text
//! Empty ─set_pattern/load─▶ PatternSet ─analyze_pattern─▶ Analyzed ─factorize─▶ Factorized
//!                                 ▲                          ▲                      │
//!                                 └──────── set_params ──────┴──── value writes ────┘
//! ```
//!
//! A pattern is reused across any number of value updates and solves; only
//! a new pattern or new parameters force the symbolic setup to be redone.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use nalgebra::DVector;
use nalgebra_sparse::CsrMatrix;
use tracing::{debug, warn};

use crate::assembler::ValueLayout;
use crate::backend::{self, Backend};
use crate::error::{LinSysError, Result};
use crate::params::SolverParams;
use crate::pattern::{DofMap, Pattern, PatternStats};
use crate::value_type::{BlockValue, BlockVector, from_blocks, to_blocks};

/// Lifecycle phase, ordered from least to most prepared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Empty,
    PatternSet,
    Analyzed,
    Factorized,
}

/// Convergence record of the last `solve`.
#[derive(Debug, Clone, PartialEq)]
pub struct SolveDiagnostics {
    pub iterations: usize,
    /// Final residual norm relative to `||b||`
    pub residual: f64,
    pub converged: bool,
    /// Description of the preconditioner and Krylov method used
    pub solver_name: String,
    pub elapsed: Duration,
}

/// Pattern-derived state owned by the engine.
pub(crate) struct System<V: BlockValue> {
    pub(crate) dofs: DofMap,
    pub(crate) matrix: CsrMatrix<V>,
    pub(crate) layout: ValueLayout,
    pub(crate) stats: PatternStats,
}

impl<V: BlockValue> System<V> {
    /// Zero-valued system over `pattern`.
    pub(crate) fn new(pattern: Pattern) -> Result<Self> {
        let values = vec![V::zero(); pattern.sparsity.nnz()];
        Self::with_values(pattern, values)
    }

    pub(crate) fn with_values(pattern: Pattern, values: Vec<V>) -> Result<Self> {
        let matrix = CsrMatrix::try_from_pattern_and_values(pattern.sparsity, values)
            .map_err(|e| LinSysError::InvalidPattern(e.to_string()))?;
        let layout = ValueLayout::new(matrix.pattern());
        Ok(Self {
            dofs: pattern.dofs,
            matrix,
            layout,
            stats: pattern.stats,
        })
    }
}

/// Sparse linear-system solver reusing one pattern across many value
/// updates.
///
/// `V` is the value stored per pattern entry: `f64`, or a
/// `Matrix2<f64>`/`Matrix3<f64>` block when each vertex carries several
/// unknowns.
pub struct AmgSolver<V: BlockValue = f64> {
    pub(crate) params: SolverParams,
    pub(crate) system: Option<System<V>>,
    pub(crate) backend: Option<Box<dyn Backend<V>>>,
    pub(crate) phase: Phase,
    pub(crate) diagnostics: Option<SolveDiagnostics>,
}

impl<V: BlockValue> Default for AmgSolver<V> {
    fn default() -> Self {
        Self {
            params: SolverParams::default(),
            system: None,
            backend: None,
            phase: Phase::Empty,
            diagnostics: None,
        }
    }
}

impl<V: BlockValue> AmgSolver<V> {
    pub fn new(params: SolverParams) -> Result<Self> {
        params.validate()?;
        Ok(Self {
            params,
            ..Default::default()
        })
    }

    pub fn params(&self) -> &SolverParams {
        &self.params
    }

    /// Replaces the configuration. The backend is discarded, so
    /// `analyze_pattern` and `factorize` must run again.
    pub fn set_params(&mut self, params: SolverParams) -> Result<()> {
        params.validate()?;
        self.params = params;
        self.backend = None;
        self.diagnostics = None;
        if self.phase > Phase::PatternSet {
            self.phase = Phase::PatternSet;
        }
        Ok(())
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Number of free DOFs (block rows); 0 without a pattern.
    pub fn num_dofs(&self) -> usize {
        self.system.as_ref().map_or(0, |s| s.dofs.num_dofs())
    }

    pub fn dof_map(&self) -> Option<&DofMap> {
        self.system.as_ref().map(|s| &s.dofs)
    }

    pub fn matrix(&self) -> Option<&CsrMatrix<V>> {
        self.system.as_ref().map(|s| &s.matrix)
    }

    pub fn pattern_stats(&self) -> Option<&PatternStats> {
        self.system.as_ref().map(|s| &s.stats)
    }

    pub fn diagnostics(&self) -> Option<&SolveDiagnostics> {
        self.diagnostics.as_ref()
    }

    /// Builds the pattern of the free vertices of `adjacency` and resets the
    /// values to zero. Any previous symbolic or numeric setup is dropped.
    pub fn set_pattern(
        &mut self,
        adjacency: &[BTreeSet<usize>],
        fixed: &BTreeSet<usize>,
    ) -> Result<PatternStats> {
        let pattern = Pattern::build(adjacency, fixed, self.params.asymmetry)?;
        let stats = pattern.stats;
        self.install(System::new(pattern)?);
        Ok(stats)
    }

    /// Replaces the owned system and drops everything derived from the
    /// previous one.
    pub(crate) fn install(&mut self, system: System<V>) {
        self.system = Some(system);
        self.backend = None;
        self.diagnostics = None;
        self.phase = Phase::PatternSet;
    }

    pub(crate) fn system_mut(&mut self, step: &'static str) -> Result<&mut System<V>> {
        self.system.as_mut().ok_or(LinSysError::NoPattern(step))
    }

    /// Called after every value write.
    pub(crate) fn values_changed(&mut self) {
        if self.phase == Phase::Factorized {
            self.phase = Phase::Analyzed;
        }
    }

    /// Symbolic setup: creates the configured backend and sizes it for the
    /// current pattern.
    pub fn analyze_pattern(&mut self) -> Result<()> {
        let Some(system) = self.system.as_ref() else {
            return Err(LinSysError::NoPattern("analyze_pattern requires a pattern"));
        };
        let mut backend = backend::create::<V>(&self.params)?;
        backend.build_hierarchy(system.matrix.pattern())?;
        debug!(backend = %backend.name(), dofs = system.dofs.num_dofs(), "pattern analyzed");
        self.backend = Some(backend);
        self.phase = Phase::Analyzed;
        Ok(())
    }

    /// Numeric setup for the current values.
    ///
    /// On failure the engine stays `Analyzed`, so values can be fixed and
    /// `factorize` retried.
    pub fn factorize(&mut self) -> Result<()> {
        if self.phase < Phase::Analyzed {
            return Err(LinSysError::NoPattern("factorize requires analyze_pattern"));
        }
        let (Some(system), Some(backend)) = (self.system.as_ref(), self.backend.as_mut()) else {
            return Err(LinSysError::NoPattern("factorize requires analyze_pattern"));
        };

        match backend.prepare_numeric(&system.matrix) {
            Ok(()) => {
                debug!(backend = %backend.name(), "numeric setup complete");
                self.phase = Phase::Factorized;
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "factorization failed");
                self.phase = Phase::Analyzed;
                Err(err.into())
            }
        }
    }

    /// Solves `A x = rhs` with the prepared backend.
    ///
    /// `rhs` holds `V::BLOCK` scalars per DOF. If the tolerance is not met
    /// the best-effort iterate is returned inside
    /// [`LinSysError::ConvergenceFailure`].
    pub fn solve(&mut self, rhs: &DVector<f64>) -> Result<DVector<f64>> {
        if self.phase != Phase::Factorized {
            return Err(LinSysError::NoPattern("solve requires factorize"));
        }
        let (Some(system), Some(backend)) = (self.system.as_ref(), self.backend.as_mut()) else {
            return Err(LinSysError::NoPattern("solve requires factorize"));
        };
        let expected = system.dofs.num_dofs() * V::BLOCK;
        if rhs.len() != expected {
            return Err(LinSysError::DimensionMismatch {
                expected,
                found: rhs.len(),
            });
        }

        let start = Instant::now();
        let b = to_blocks::<V>(rhs.as_slice());
        let mut x = vec![V::Vector::zero(); b.len()];
        let report = backend
            .iterate(&b, &mut x)
            .map_err(LinSysError::solve_failure)?;
        let solution = DVector::from_vec(from_blocks::<V>(&x));

        let diagnostics = SolveDiagnostics {
            iterations: report.iterations,
            residual: report.residual,
            converged: report.converged,
            solver_name: backend.name(),
            elapsed: start.elapsed(),
        };
        debug!(
            iterations = diagnostics.iterations,
            residual = diagnostics.residual,
            converged = diagnostics.converged,
            solver = %diagnostics.solver_name,
            "solve finished"
        );
        self.diagnostics = Some(diagnostics);

        if report.converged {
            Ok(solution)
        } else {
            warn!(
                iterations = report.iterations,
                residual = report.residual,
                "solver did not converge"
            );
            Err(LinSysError::ConvergenceFailure {
                iterations: report.iterations,
                residual: report.residual,
                solution,
            })
        }
    }
}
