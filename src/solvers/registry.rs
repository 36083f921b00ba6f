//! The fixed set of solver names each framework accepts, and how to reach them.
//!
//! A registry is built once (usually from the configuration) and passed by reference to
//! every [Executor](crate::Executor). Resolving a name fails only when the name is unknown;
//! a known backend that cannot be reached on this machine is replaced by the fallback.
use std::fmt::{Display, Formatter};

use tracing::{debug, warn};

use crate::error::BridgeError;
use crate::framework::Framework;
use crate::solvers::microlp::MicroLp;
use crate::solvers::SolverBackend;

/// A solver shipped as a separate executable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalSolver {
    /// COIN-OR branch and cut
    Cbc,
    /// GNU linear programming kit
    Glpk,
    /// Gurobi optimizer
    Gurobi,
    /// IBM CPLEX
    Cplex,
}

impl ExternalSolver {
    /// The executable looked up on `PATH`
    pub fn command(self) -> &'static str {
        match self {
            ExternalSolver::Cbc => "cbc",
            ExternalSolver::Glpk => "glpsol",
            ExternalSolver::Gurobi => "gurobi_cl",
            ExternalSolver::Cplex => "cplex",
        }
    }
}

/// How a registered name is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// The pure rust solver linked into the binary
    MicroLp,
    /// HiGHS, linked in with the `highs` feature
    Highs,
    /// An executable driven through an LP file
    External(ExternalSolver),
}

impl BackendKind {
    /// Whether this backend can run on this machine
    pub fn is_available(self) -> bool {
        match self {
            BackendKind::MicroLp => true,
            BackendKind::Highs => cfg!(feature = "highs"),
            BackendKind::External(solver) => cfg!(feature = "lp-solvers") && on_path(solver.command()),
        }
    }
}

fn on_path(command: &str) -> bool {
    which::which(command).is_ok()
}

/// One entry of a registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SolverSpec {
    /// The name accepted from callers
    pub name: &'static str,
    /// How to reach it
    pub kind: BackendKind,
}

const fn spec(name: &'static str, kind: BackendKind) -> SolverSpec {
    SolverSpec { name, kind }
}

const LINEAR_EXPRESSION_SOLVERS: [SolverSpec; 6] = [
    spec("cbc", BackendKind::External(ExternalSolver::Cbc)),
    spec("gurobi", BackendKind::External(ExternalSolver::Gurobi)),
    spec("glpk", BackendKind::External(ExternalSolver::Glpk)),
    spec("cplex", BackendKind::External(ExternalSolver::Cplex)),
    spec("highs", BackendKind::Highs),
    spec("microlp", BackendKind::MicroLp),
];

const CONSTRAINT_BASED_SOLVERS: [SolverSpec; 6] = [
    spec("highs", BackendKind::Highs),
    spec("cbc", BackendKind::External(ExternalSolver::Cbc)),
    spec("glpk", BackendKind::External(ExternalSolver::Glpk)),
    spec("gurobi", BackendKind::External(ExternalSolver::Gurobi)),
    spec("cplex", BackendKind::External(ExternalSolver::Cplex)),
    spec("microlp", BackendKind::MicroLp),
];

const FALLBACK: SolverSpec = spec("microlp", BackendKind::MicroLp);

/// The solvers accepted for one framework
#[derive(Debug, Clone)]
pub struct SolverRegistry {
    framework: Framework,
    specs: Vec<SolverSpec>,
    time_limit: Option<f64>,
}

impl SolverRegistry {
    /// The built-in registry of a framework
    pub fn for_framework(framework: Framework) -> Self {
        let specs = match framework {
            Framework::ConstraintBased => CONSTRAINT_BASED_SOLVERS.to_vec(),
            Framework::LinearExpression => LINEAR_EXPRESSION_SOLVERS.to_vec(),
        };
        SolverRegistry {
            framework,
            specs,
            time_limit: None,
        }
    }

    /// Forward a time limit, in seconds, to the backends that support one
    pub fn with_time_limit(mut self, seconds: Option<f64>) -> Self {
        self.time_limit = seconds.filter(|s| s.is_finite() && *s > 0.);
        self
    }

    /// The framework this registry serves
    pub fn framework(&self) -> Framework {
        self.framework
    }

    /// The name used when the caller does not pick one
    pub fn default_solver(&self) -> &'static str {
        self.specs[0].name
    }

    /// Every accepted name, in registry order
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.specs.iter().map(|s| s.name)
    }

    /// The entry registered under `name`, compared case-insensitively
    pub fn lookup(&self, name: &str) -> Option<SolverSpec> {
        let name = name.trim();
        self.specs
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(name))
            .copied()
    }

    /// The backend used when the requested one cannot be reached
    pub fn fallback(&self) -> SolverSpec {
        FALLBACK
    }

    /// Check the name against the registry and probe the backend.
    pub fn resolve(&self, name: &str) -> Result<ResolvedSolver, BridgeError> {
        self.resolve_with(name, BackendKind::is_available)
    }

    fn resolve_with(
        &self,
        name: &str,
        is_available: impl Fn(BackendKind) -> bool,
    ) -> Result<ResolvedSolver, BridgeError> {
        let requested = self
            .lookup(name)
            .ok_or_else(|| BridgeError::UnsupportedSolver {
                name: name.to_string(),
                framework: self.framework,
                supported: self.names().collect::<Vec<_>>().join(", "),
            })?;
        let spec = if is_available(requested.kind) {
            debug!(solver = requested.name, "solver backend available");
            requested
        } else {
            let fallback = self.fallback();
            warn!(
                requested = requested.name,
                fallback = fallback.name,
                "solver not available, using the default backend"
            );
            fallback
        };
        Ok(ResolvedSolver {
            requested: requested.name,
            spec,
            time_limit: self.time_limit,
        })
    }
}

/// The outcome of [SolverRegistry::resolve]
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSolver {
    requested: &'static str,
    spec: SolverSpec,
    time_limit: Option<f64>,
}

impl ResolvedSolver {
    /// The registry name the caller asked for
    pub fn requested(&self) -> &'static str {
        self.requested
    }

    /// The name of the backend that will run
    pub fn name(&self) -> &'static str {
        self.spec.name
    }

    /// Whether the requested backend was replaced by the fallback
    pub fn is_downgraded(&self) -> bool {
        self.requested != self.spec.name
    }

    /// Build the backend
    pub fn instantiate(&self) -> Box<dyn SolverBackend> {
        match self.spec.kind {
            BackendKind::MicroLp => Box::new(MicroLp),
            #[cfg(feature = "highs")]
            BackendKind::Highs => {
                let highs = crate::solvers::highs::Highs::default();
                Box::new(match self.time_limit {
                    Some(seconds) => highs.with_time_limit(seconds),
                    None => highs,
                })
            }
            #[cfg(feature = "lp-solvers")]
            BackendKind::External(solver) => {
                use crate::solvers::lp_solvers;
                match solver {
                    ExternalSolver::Cbc => Box::new(lp_solvers::cbc(self.time_limit)),
                    ExternalSolver::Glpk => Box::new(lp_solvers::glpk()),
                    ExternalSolver::Gurobi => Box::new(lp_solvers::gurobi()),
                    ExternalSolver::Cplex => Box::new(lp_solvers::cplex()),
                }
            }
            #[allow(unreachable_patterns)]
            _ => Box::new(MicroLp),
        }
    }
}

impl Display for ResolvedSolver {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_downgraded() {
            write!(f, "{} (requested {})", self.spec.name, self.requested)
        } else {
            f.write_str(self.spec.name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_solver_is_rejected_with_the_alternatives() {
        let registry = SolverRegistry::for_framework(Framework::LinearExpression);
        let err = registry.resolve("mosek").unwrap_err();
        match err {
            BridgeError::UnsupportedSolver { name, supported, .. } => {
                assert_eq!(name, "mosek");
                assert_eq!(supported, "cbc, gurobi, glpk, cplex, highs, microlp");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn microlp_is_always_available() {
        let registry = SolverRegistry::for_framework(Framework::ConstraintBased);
        let resolved = registry.resolve("MicroLP").unwrap();
        assert_eq!(resolved.name(), "microlp");
        assert!(!resolved.is_downgraded());
        assert_eq!(resolved.instantiate().name(), "microlp");
    }

    #[test]
    fn unreachable_backends_fall_back() {
        assert!(!on_path("autoopt-solver-that-is-not-installed"));

        let registry = SolverRegistry::for_framework(Framework::LinearExpression);
        let only_linked_in = |kind: BackendKind| kind == BackendKind::MicroLp;
        let resolved = registry.resolve_with("gurobi", only_linked_in).unwrap();
        assert!(resolved.is_downgraded());
        assert_eq!(resolved.name(), "microlp");
        assert_eq!(resolved.requested(), "gurobi");
        assert_eq!(resolved.instantiate().name(), "microlp");
        assert_eq!(resolved.to_string(), "microlp (requested gurobi)");

        let resolved = registry.resolve_with("glpk", |_| true).unwrap();
        assert!(!resolved.is_downgraded());
        assert_eq!(resolved.name(), "glpk");
    }

    #[test]
    fn defaults_follow_registry_order() {
        assert_eq!(
            SolverRegistry::for_framework(Framework::LinearExpression).default_solver(),
            "cbc"
        );
        assert_eq!(
            SolverRegistry::for_framework(Framework::ConstraintBased).default_solver(),
            "highs"
        );
    }
}
