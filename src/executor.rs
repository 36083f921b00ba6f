//! Running a fragment and solving the model it builds.
//!
//! Every call stages the fragment in its own temporary file, runs it in a fresh [Session]
//! of the framework's surface and hands the `model` it leaves behind to the chosen backend.
//! Whatever goes wrong on the way (a syntax error, a runtime error, a missing `model`, a
//! backend failure or a panic) ends up in the `status` and `message` of the returned
//! [SolutionRecord]. The staged file is removed on every path out.
use std::io::Write;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::time::Instant;

use tempfile::NamedTempFile;
use tracing::{debug, error, warn};

use crate::analyze::analyze;
use crate::config::GatePolicy;
use crate::error::BridgeError;
use crate::framework::Framework;
use crate::normalize::{normalize, SolutionRecord, SolvedModel, SolverMetadata};
use crate::script::{parse, Limits, Session, Value};
use crate::solvers::{ResolutionError, ResolvedSolver, SolverRegistry};
use crate::surface::surface_for;
use crate::validate::{is_executable, validate};

/// Solves fragments of one framework with one backend
#[derive(Debug, Clone)]
pub struct Executor {
    framework: Framework,
    solver: ResolvedSolver,
    limits: Limits,
    gate: GatePolicy,
    staging_dir: Option<PathBuf>,
}

/// The fragment copied to disk for the duration of one call. Dropping it removes the file.
struct StagedFragment {
    file: NamedTempFile,
}

impl StagedFragment {
    fn write(code: &str, dir: Option<&Path>) -> std::io::Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("autoopt-").suffix(".py");
        let mut file = match dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        file.write_all(code.as_bytes())?;
        file.flush()?;
        Ok(StagedFragment { file })
    }

    fn path(&self) -> &Path {
        self.file.path()
    }

    fn read(&self) -> std::io::Result<String> {
        std::fs::read_to_string(self.path())
    }
}

impl Executor {
    /// An executor for `framework` using the backend registered as `solver_name`.
    ///
    /// Unknown names fail with [BridgeError::UnsupportedSolver]. A known backend that is not
    /// reachable here is replaced by the registry fallback, with a warning.
    pub fn new(framework: Framework, solver_name: &str, registry: &SolverRegistry) -> Result<Self, BridgeError> {
        if registry.framework() != framework {
            return Err(BridgeError::UnsupportedFrameworkKind(format!(
                "{framework} (the solver registry serves {})",
                registry.framework()
            )));
        }
        let solver = registry.resolve(solver_name)?;
        debug!(%framework, solver = %solver, "executor ready");
        Ok(Executor {
            framework,
            solver,
            limits: Limits::default(),
            gate: GatePolicy::default(),
            staging_dir: None,
        })
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_gate(mut self, gate: GatePolicy) -> Self {
        self.gate = gate;
        self
    }

    /// Stage fragments in `dir` instead of the system temporary directory
    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = Some(dir.into());
        self
    }

    pub fn framework(&self) -> Framework {
        self.framework
    }

    /// The backend that runs, and the name it was requested under
    pub fn solver(&self) -> &ResolvedSolver {
        &self.solver
    }

    fn metadata(&self) -> SolverMetadata {
        SolverMetadata {
            name: self.solver.name().to_string(),
            requested: self.solver.requested().to_string(),
            ..SolverMetadata::default()
        }
    }

    /// Run `code` and solve its model. Never fails: problems are reported in the record.
    pub fn solve(&self, code: &str) -> SolutionRecord {
        let mut metadata = self.metadata();
        if let Some(reasons) = self.refusal(code) {
            warn!(gate = %self.gate, "fragment refused");
            return SolutionRecord::error(format!("refused to execute: {reasons}"), metadata);
        }
        match self.execute(code) {
            Ok((solved, elapsed)) => {
                metadata.solve_time = Some(elapsed);
                let record = normalize(&solved, &metadata);
                if let Some(message) = &record.message {
                    error!(solver = %self.solver, %message, "solver failed");
                } else {
                    debug!(status = %record.status, objective = ?record.objective_value, "solved");
                }
                record
            }
            Err(err) => {
                error!(error = %err, code = err.code(), "model execution failed");
                SolutionRecord::error(err.to_string(), metadata)
            }
        }
    }

    /// The reasons the gate policy keeps `code` from running, if any
    fn refusal(&self, code: &str) -> Option<String> {
        if self.gate == GatePolicy::Advisory {
            return None;
        }
        if let (false, message) = is_executable(code) {
            return Some(message.unwrap_or_else(|| "the code does not parse".to_string()));
        }
        if self.gate == GatePolicy::Strict {
            let verdict = validate(&analyze(code, self.framework), self.framework);
            if !verdict.is_valid() {
                return Some(verdict.issues().join("; "));
            }
        }
        None
    }

    /// Run `code` and solve the model it binds, returning the solved model and the time the
    /// final solve took, in seconds.
    pub fn execute(&self, code: &str) -> Result<(SolvedModel, f64), BridgeError> {
        let staged = StagedFragment::write(code, self.staging_dir.as_deref())
            .map_err(|e| BridgeError::SolveRuntimeFailure(format!("could not stage the model code: {e}")))?;
        debug!(path = %staged.path().display(), "staged fragment");
        let outcome = catch_unwind(AssertUnwindSafe(|| self.run_staged(&staged)));
        drop(staged);
        match outcome {
            Ok(result) => result,
            Err(payload) => {
                let reason = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown cause".to_string());
                Err(BridgeError::SolveRuntimeFailure(format!("internal failure: {reason}")))
            }
        }
    }

    fn run_staged(&self, staged: &StagedFragment) -> Result<(SolvedModel, f64), BridgeError> {
        let source = staged
            .read()
            .map_err(|e| BridgeError::SolveRuntimeFailure(format!("could not read the staged code: {e}")))?;
        let program = parse(&source).map_err(|e| BridgeError::SyntaxInvalid(e.to_string()))?;

        let surface = surface_for(self.framework);
        let backend = self.solver.instantiate();
        let mut session = Session::new(surface.as_ref(), backend.as_ref(), self.limits);
        session.set_global("__file__", Value::str(staged.path().to_string_lossy()));
        session
            .run(&program)
            .map_err(|e| BridgeError::SolveRuntimeFailure(e.to_string()))?;
        debug!(steps = session.steps(), printed = session.output().len(), "fragment finished");

        let model = session.global("model").ok_or(BridgeError::MalformedModel)?;
        let problem = surface
            .materialize(&mut session, &model)
            .map_err(|e| BridgeError::SolveRuntimeFailure(e.to_string()))?;
        debug!(
            variables = problem.variables().len(),
            constraints = problem.constraints().len(),
            "model materialized"
        );

        let start = Instant::now();
        let outcome = backend.solve(&problem);
        let elapsed = start.elapsed().as_secs_f64();
        if let Err(err @ (ResolutionError::Other(_) | ResolutionError::Str(_))) = &outcome {
            warn!(backend = backend.name(), error = %err, "backend reported a failure");
        }
        Ok((SolvedModel::new(self.framework, problem, outcome), elapsed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::SolveStatus;
    use float_eq::assert_float_eq;

    fn executor(framework: Framework) -> Executor {
        Executor::new(framework, "microlp", &SolverRegistry::for_framework(framework)).unwrap()
    }

    #[test]
    fn pulp_fragment_is_solved() {
        let code = "\
import pulp
model = pulp.LpProblem('p', pulp.LpMaximize)
x = pulp.LpVariable('x', lowBound=0)
y = pulp.LpVariable('y', lowBound=0)
model += 3 * x + 2 * y
model += x + y <= 4, 'cap'
model += x + 3 * y <= 6
";
        let record = executor(Framework::LinearExpression).solve(code);
        assert_eq!(record.status, SolveStatus::Optimal, "{:?}", record.message);
        assert_float_eq!(record.objective_value.unwrap(), 12., abs <= 1e-6);
        assert_float_eq!(record.variables["x"].value.unwrap(), 4., abs <= 1e-6);
        assert_eq!(record.solver.name, "microlp");
        assert_eq!(record.solver.termination_condition.as_deref(), Some("Optimal"));
        assert!(record.solver.solve_time.is_some());
        assert!(record.constraints.contains_key("cap"));
        assert!(record.constraints.contains_key("_C2"));
    }

    #[test]
    fn missing_model_is_an_error_record() {
        let record = executor(Framework::LinearExpression).solve("import pulp\nprob = pulp.LpProblem('p')\n");
        assert!(record.is_error());
        assert_eq!(
            record.message.as_deref(),
            Some("model code did not create a 'model' variable")
        );
        assert!(record.variables.is_empty() && record.constraints.is_empty());
        assert_eq!(record.objective_value, None);
    }

    #[test]
    fn runtime_and_syntax_errors_are_error_records() {
        let record = executor(Framework::ConstraintBased).solve("import pyomo.environ as pyo\nmodel = undefined_name\n");
        assert!(record.is_error());
        assert!(record.message.unwrap().starts_with("NameError"));

        let record = executor(Framework::ConstraintBased).solve("model = (\n");
        assert!(record.message.unwrap().starts_with("syntax error"));
    }

    #[test]
    fn long_operator_chains_are_error_records() {
        let code = format!("import pulp\nx = {}1\nmodel = pulp.LpProblem('p')\n", "1+".repeat(100_000));
        let record = executor(Framework::LinearExpression).solve(&code);
        assert!(record.is_error());
        assert!(record.message.unwrap().contains("too deeply nested"));
    }

    #[test]
    fn disallowed_imports_fail() {
        let record = executor(Framework::LinearExpression).solve("import os\nmodel = os.system('true')\n");
        assert!(record.is_error());
        assert!(record.message.unwrap().starts_with("ImportError"));
    }

    #[test]
    fn runaway_fragments_are_stopped() {
        let limits = Limits {
            max_steps: 1_000,
            ..Limits::default()
        };
        let record = executor(Framework::LinearExpression)
            .with_limits(limits)
            .solve("while True:\n    pass\n");
        assert!(record.message.unwrap().starts_with("StepLimitExceeded"));
    }

    #[test]
    fn gate_policies() {
        let broken = "model = (\n";
        let record = executor(Framework::ConstraintBased)
            .with_gate(GatePolicy::Syntax)
            .solve(broken);
        assert!(record.message.unwrap().starts_with("refused to execute: SyntaxError"));

        let record = executor(Framework::ConstraintBased)
            .with_gate(GatePolicy::Strict)
            .solve("model = 1\n");
        let message = record.message.unwrap();
        assert!(message.contains("Missing Pyomo import"), "{message}");

        let record = executor(Framework::ConstraintBased)
            .with_gate(GatePolicy::Advisory)
            .solve("model = 1\n");
        assert!(record.message.unwrap().contains("model must be a ConcreteModel"));
    }

    #[test]
    fn staged_files_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(Framework::LinearExpression).with_staging_dir(dir.path());
        exec.solve("import pulp\nmodel = pulp.LpProblem('p')\n");
        exec.solve("raise ValueError('boom')\n");
        exec.solve("model = (\n");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn fragments_see_their_staged_path() {
        let dir = tempfile::tempdir().unwrap();
        let record = executor(Framework::LinearExpression)
            .with_staging_dir(dir.path())
            .with_gate(GatePolicy::Advisory)
            .solve(
                "assert __file__.endswith('.py')\nassert 'autoopt-' in __file__\nimport pulp\n\
                 model = pulp.LpProblem('p')\nx = pulp.LpVariable('x', 0, 1)\nmodel += x\nmodel += x >= 0\n",
            );
        assert_eq!(record.status, SolveStatus::Optimal, "{:?}", record.message);
    }

    #[test]
    fn registry_must_match_the_framework() {
        let registry = SolverRegistry::for_framework(Framework::ConstraintBased);
        let err = Executor::new(Framework::LinearExpression, "cbc", &registry).unwrap_err();
        assert_eq!(err.code(), "UNSUPPORTED_FRAMEWORK");
        let err = Executor::new(Framework::ConstraintBased, "mosek", &registry).unwrap_err();
        assert_eq!(err.code(), "UNSUPPORTED_SOLVER");
    }
}
