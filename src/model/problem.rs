//! The in-memory model materialized from an executed fragment, ready to be handed to a solver.
use std::fmt::Formatter;

use fnv::FnvHashMap as HashMap;

use crate::model::constraint::Constraint;
use crate::model::expression::Expression;
use crate::model::variable::{FormatWithVars, Named, ProblemVariables, Variable, VariableDefinition};
use crate::solvers::ObjectiveDirection;

/// A linear problem: an optional objective, its variables and named constraints.
#[derive(Clone, Debug)]
pub struct Problem {
    pub(crate) name: String,
    pub(crate) direction: ObjectiveDirection,
    pub(crate) objective: Option<Expression>,
    pub(crate) variables: Vec<(Variable, VariableDefinition)>,
    pub(crate) constraints: Vec<Constraint>,
    pub(crate) names: ProblemVariables,
}

impl Problem {
    /// Build a problem over `members`. Variables referenced by the objective or a constraint
    /// but missing from `members` are appended in creation order.
    pub fn new(
        name: impl Into<String>,
        direction: ObjectiveDirection,
        objective: Option<Expression>,
        constraints: Vec<Constraint>,
        store: &ProblemVariables,
        members: impl IntoIterator<Item = Variable>,
    ) -> Problem {
        let mut seen: HashMap<Variable, ()> = HashMap::default();
        let mut ordered: Vec<Variable> = Vec::new();
        for var in members {
            if seen.insert(var, ()).is_none() {
                ordered.push(var);
            }
        }
        let mut referenced: Vec<Variable> = objective
            .iter()
            .flat_map(|o| o.variables())
            .chain(constraints.iter().flat_map(|c| c.expression.variables()))
            .filter(|v| !seen.contains_key(v))
            .collect();
        referenced.sort();
        referenced.dedup();
        ordered.extend(referenced);

        let variables = ordered
            .into_iter()
            .filter_map(|var| store.definition(var).map(|def| (var, def.clone())))
            .collect();
        Problem {
            name: name.into(),
            direction,
            objective,
            variables,
            constraints,
            names: store.clone(),
        }
    }

    /// The problem name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Maximisation or minimisation
    pub fn direction(&self) -> ObjectiveDirection {
        self.direction
    }

    /// The objective, if the fragment defined one
    pub fn objective(&self) -> Option<&Expression> {
        self.objective.as_ref()
    }

    /// The decision variables of the problem, with their definitions
    pub fn variables(&self) -> &[(Variable, VariableDefinition)] {
        &self.variables
    }

    /// The constraints of the problem
    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    /// Column index of every variable, for solvers that number their columns
    pub(crate) fn columns(&self) -> HashMap<Variable, usize> {
        self.variables
            .iter()
            .enumerate()
            .map(|(col, (var, _))| (*var, col))
            .collect()
    }

    /// Render anything holding variables of this problem with their real names
    pub fn display<'a, T: FormatWithVars>(&'a self, item: &'a T) -> Named<'a, T> {
        Named {
            item,
            variables: &self.names,
        }
    }

    /// The name given to a constraint when the fragment did not name it
    pub(crate) fn constraint_name(&self, index: usize) -> String {
        self.constraints[index]
            .name
            .clone()
            .unwrap_or_else(|| format!("_C{}", index + 1))
    }
}

impl FormatWithVars for Problem {
    fn format_with<FUN>(&self, f: &mut Formatter<'_>, mut variable_format: FUN) -> std::fmt::Result
    where
        FUN: FnMut(&mut Formatter<'_>, Variable) -> std::fmt::Result,
    {
        let sense = match self.direction {
            ObjectiveDirection::Maximisation => "maximize",
            ObjectiveDirection::Minimisation => "minimize",
        };
        write!(f, "{}: ", sense)?;
        match &self.objective {
            Some(objective) => objective.format_with(f, &mut variable_format)?,
            None => write!(f, "0")?,
        }
        for constraint in &self.constraints {
            write!(f, "\n  ")?;
            constraint.format_with(f, &mut variable_format)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::variable::variable;

    #[test]
    fn referenced_variables_are_appended() {
        let mut store = ProblemVariables::new();
        let x = store.add(variable().name("x").min(0));
        let y = store.add(variable().name("y").min(0));
        let unused = store.add(variable().name("unused"));
        let problem = Problem::new(
            "p",
            ObjectiveDirection::Maximisation,
            Some(x * 1. + y * 2.),
            vec![(y * 1.).leq(Expression::from(4.))],
            &store,
            vec![x],
        );
        let names: Vec<&str> = problem
            .variables()
            .iter()
            .map(|(_, def)| def.name.as_str())
            .collect();
        assert_eq!(names, vec!["x", "y"]);
        assert!(problem.variables().iter().all(|(v, _)| *v != unused));
        assert_eq!(problem.constraint_name(0), "_C1");
        assert_eq!(
            problem.display(problem.objective().unwrap()).to_string(),
            "x + 2*y"
        );
    }
}
