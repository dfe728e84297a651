//! Solver configuration.
//!
//! The configuration is a nested key-value tree: every solver and
//! multigrid choice is made here at run time, so one compiled engine serves
//! every preconditioner/Krylov combination. The tree serializes to JSON and
//! individual keys can be edited by dotted path:
//!
//! ```
//! use ipc_linsys::SolverParams;
//!
//! let mut params = SolverParams::default();
//! params.put("solver.tol", 1e-6).unwrap();
//! params.put("precond.relax.type", "gauss_seidel").unwrap();
//! assert_eq!(params.solver.tol, 1e-6);
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{LinSysError, Result};

/// Which backend implementation serves the solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// In-crate AMG + Krylov kernels.
    Builtin,
}

impl Default for BackendKind {
    fn default() -> Self {
        BackendKind::Builtin
    }
}

/// What `set_pattern` does with an edge whose reverse edge is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AsymmetryPolicy {
    /// Add the missing reverse edge and log a warning.
    Symmetrize,
    /// Fail with `InvalidPattern`.
    Reject,
}

impl Default for AsymmetryPolicy {
    fn default() -> Self {
        AsymmetryPolicy::Symmetrize
    }
}

/// Preconditioner family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrecondClass {
    /// Algebraic multigrid V-cycle
    Amg,
    /// Single-level smoother
    Relaxation,
    /// Identity (unpreconditioned Krylov)
    Dummy,
}

impl Default for PrecondClass {
    fn default() -> Self {
        PrecondClass::Amg
    }
}

/// How coarse levels are built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoarseningType {
    /// Piecewise-constant interpolation over aggregates
    Aggregation,
    /// Aggregation followed by one Jacobi smoothing step of the prolongator
    SmoothedAggregation,
}

impl Default for CoarseningType {
    fn default() -> Self {
        CoarseningType::SmoothedAggregation
    }
}

impl CoarseningType {
    pub fn name(&self) -> &'static str {
        match self {
            CoarseningType::Aggregation => "aggregation",
            CoarseningType::SmoothedAggregation => "smoothed_aggregation",
        }
    }

    /// Over-interpolation factor used when none is configured.
    pub fn default_over_interp(&self) -> f64 {
        match self {
            CoarseningType::Aggregation => 1.5,
            CoarseningType::SmoothedAggregation => 4.0 / 3.0,
        }
    }
}

/// Smoother choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelaxationType {
    /// Sparse approximate inverse with diagonal pattern
    Spai0,
    DampedJacobi,
    /// Symmetric Gauss-Seidel (forward pre-sweep, backward post-sweep)
    GaussSeidel,
    /// Chebyshev polynomial of the Jacobi-scaled operator
    Chebyshev,
}

impl Default for RelaxationType {
    fn default() -> Self {
        RelaxationType::Spai0
    }
}

impl RelaxationType {
    pub fn name(&self) -> &'static str {
        match self {
            RelaxationType::Spai0 => "spai0",
            RelaxationType::DampedJacobi => "damped_jacobi",
            RelaxationType::GaussSeidel => "gauss_seidel",
            RelaxationType::Chebyshev => "chebyshev",
        }
    }
}

/// Outer iterative method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverType {
    /// Conjugate Gradient (SPD systems)
    Cg,
    /// Biconjugate Gradient Stabilized
    Bicgstab,
    /// Restarted GMRES
    Gmres,
    /// Restarted GMRES augmented with previous corrections
    Lgmres,
    /// No Krylov acceleration: repeated preconditioner sweeps
    Preonly,
}

impl Default for SolverType {
    fn default() -> Self {
        SolverType::Cg
    }
}

impl SolverType {
    pub fn name(&self) -> &'static str {
        match self {
            SolverType::Cg => "cg",
            SolverType::Bicgstab => "bicgstab",
            SolverType::Gmres => "gmres",
            SolverType::Lgmres => "lgmres",
            SolverType::Preonly => "preonly",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoarseningParams {
    #[serde(rename = "type")]
    pub kind: CoarseningType,
    /// Strong-connection threshold
    pub eps_strong: f64,
    /// Prolongation over-interpolation factor (type-specific default when unset)
    pub over_interp: Option<f64>,
}

impl Default for CoarseningParams {
    fn default() -> Self {
        Self {
            kind: CoarseningType::default(),
            eps_strong: 0.08,
            over_interp: None,
        }
    }
}

impl CoarseningParams {
    pub fn over_interp(&self) -> f64 {
        self.over_interp
            .unwrap_or_else(|| self.kind.default_over_interp())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelaxParams {
    #[serde(rename = "type")]
    pub kind: RelaxationType,
    /// Damped Jacobi weight
    pub damping: f64,
    /// Chebyshev polynomial degree
    pub degree: usize,
    /// Chebyshev lower eigenvalue bound as a fraction of the upper bound
    pub lower: f64,
}

impl Default for RelaxParams {
    fn default() -> Self {
        Self {
            kind: RelaxationType::default(),
            damping: 0.72,
            degree: 5,
            lower: 1.0 / 30.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PrecondParams {
    pub class: PrecondClass,
    pub coarsening: CoarseningParams,
    pub relax: RelaxParams,
    /// Scalar size below which a level is not coarsened further
    pub coarse_enough: usize,
    pub max_levels: usize,
    /// Pre-smoothing sweeps per level
    pub npre: usize,
    /// Post-smoothing sweeps per level
    pub npost: usize,
    /// Cycles per level (1 = V-cycle, 2 = W-cycle)
    pub ncycle: usize,
    /// Solve the coarsest level with dense LU instead of smoothing
    pub direct_coarse: bool,
}

impl Default for PrecondParams {
    fn default() -> Self {
        Self {
            class: PrecondClass::default(),
            coarsening: CoarseningParams::default(),
            relax: RelaxParams::default(),
            coarse_enough: 500,
            max_levels: 20,
            npre: 1,
            npost: 1,
            ncycle: 1,
            direct_coarse: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KrylovParams {
    #[serde(rename = "type")]
    pub kind: SolverType,
    /// Relative residual tolerance
    pub tol: f64,
    /// Absolute residual tolerance
    pub abstol: f64,
    /// Maximum iterations (0 performs no iteration)
    pub maxiter: usize,
    /// GMRES restart length
    pub m: usize,
    /// LGMRES augmentation vectors kept between restarts
    pub k: usize,
}

impl Default for KrylovParams {
    fn default() -> Self {
        Self {
            kind: SolverType::default(),
            tol: 1e-8,
            abstol: 0.0,
            maxiter: 100,
            m: 30,
            k: 3,
        }
    }
}

/// Complete solver configuration tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct SolverParams {
    pub backend: BackendKind,
    pub asymmetry: AsymmetryPolicy,
    pub precond: PrecondParams,
    pub solver: KrylovParams,
}

impl SolverParams {
    /// AMG-preconditioned CG (the default).
    pub fn amg_cg() -> Self {
        Self::default()
    }

    /// AMG V-cycles used directly as the iteration, without Krylov
    /// acceleration. Set `solver.maxiter` to 1 for a single sweep.
    pub fn amg_vcycle() -> Self {
        Self {
            solver: KrylovParams {
                kind: SolverType::Preonly,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Damped-Jacobi preconditioned CG.
    pub fn jacobi_cg() -> Self {
        Self {
            precond: PrecondParams {
                class: PrecondClass::Relaxation,
                relax: RelaxParams {
                    kind: RelaxationType::DampedJacobi,
                    ..Default::default()
                },
                ..Default::default()
            },
            solver: KrylovParams {
                maxiter: 1000,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let params: SolverParams = serde_json::from_str(text)?;
        params.validate()?;
        Ok(params)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(ipc_io::IoError::from)?;
        Self::from_json_str(&text)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Sets one key of the tree by dotted path, e.g. `"precond.npre"`.
    ///
    /// The key must already exist; the updated tree is re-validated and
    /// `self` is left untouched on error.
    pub fn put(&mut self, path: &str, value: impl Into<Value>) -> Result<()> {
        let mut tree = serde_json::to_value(&*self)?;
        let keys: Vec<&str> = path.split('.').collect();
        let Some((last, parents)) = keys.split_last() else {
            return Err(LinSysError::InvalidConfig("empty key path".into()));
        };

        let mut node = &mut tree;
        for key in parents {
            node = node
                .get_mut(*key)
                .ok_or_else(|| LinSysError::InvalidConfig(format!("unknown key '{path}'")))?;
        }
        let object = node
            .as_object_mut()
            .ok_or_else(|| LinSysError::InvalidConfig(format!("'{path}' is not a nested key")))?;
        if !object.contains_key(*last) {
            return Err(LinSysError::InvalidConfig(format!("unknown key '{path}'")));
        }
        object.insert((*last).to_string(), value.into());

        let updated: SolverParams = serde_json::from_value(tree)?;
        updated.validate()?;
        *self = updated;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(LinSysError::InvalidConfig(msg));
        let s = &self.solver;
        if !(s.tol >= 0.0 && s.abstol >= 0.0) || (s.tol == 0.0 && s.abstol == 0.0) {
            return invalid(format!(
                "tolerances must be non-negative and not both zero (tol {}, abstol {})",
                s.tol, s.abstol
            ));
        }
        if s.m == 0 {
            return invalid("GMRES restart length m must be at least 1".into());
        }

        let p = &self.precond;
        if p.coarse_enough == 0 || p.max_levels == 0 {
            return invalid("coarse_enough and max_levels must be at least 1".into());
        }
        if p.ncycle == 0 {
            return invalid("ncycle must be at least 1".into());
        }
        if !(p.coarsening.eps_strong >= 0.0) {
            return invalid(format!("eps_strong must be >= 0, got {}", p.coarsening.eps_strong));
        }
        if let Some(w) = p.coarsening.over_interp
            && !(w > 0.0)
        {
            return invalid(format!("over_interp must be > 0, got {w}"));
        }
        if !(p.relax.damping > 0.0) {
            return invalid(format!("damping must be > 0, got {}", p.relax.damping));
        }
        if p.relax.degree == 0 {
            return invalid("chebyshev degree must be at least 1".into());
        }
        if !(p.relax.lower > 0.0 && p.relax.lower < 1.0) {
            return invalid(format!("chebyshev lower must be in (0, 1), got {}", p.relax.lower));
        }
        Ok(())
    }

    /// Short human-readable description, e.g. `amg(smoothed_aggregation, spai0) + cg`.
    pub fn describe(&self) -> String {
        let precond = match self.precond.class {
            PrecondClass::Amg => format!(
                "amg({}, {})",
                self.precond.coarsening.kind.name(),
                self.precond.relax.kind.name()
            ),
            PrecondClass::Relaxation => format!("relaxation({})", self.precond.relax.kind.name()),
            PrecondClass::Dummy => "dummy".to_string(),
        };
        format!("{precond} + {}", self.solver.kind.name())
    }
}
