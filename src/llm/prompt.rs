//! Prompt templates. Building a prompt is deterministic: the same inputs give the same text.
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::framework::Framework;

/// How much guidance the prompt carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PromptStyle {
    /// The task and the problem description
    Direct,
    /// The task, a description of the library, the expected structure and a worked example
    #[default]
    FewShot,
}

impl Display for PromptStyle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            PromptStyle::Direct => "direct",
            PromptStyle::FewShot => "few-shot",
        })
    }
}

impl FromStr for PromptStyle {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(PromptStyle::Direct),
            "few-shot" | "few_shot" | "fewshot" => Ok(PromptStyle::FewShot),
            other => Err(ConfigError::Invalid(format!(
                "unknown prompt style '{other}' (expected direct or few-shot)"
            ))),
        }
    }
}

/// What the model is told about a modeling library
pub struct LibraryGuide {
    pub description: &'static str,
    pub import_statement: &'static str,
    /// A complete model in the library, runnable as is
    pub example: &'static str,
}

/// A small production model written against the pyomo surface
pub const PYOMO_EXAMPLE: &str = r#"# Example: choose production quantities to maximize profit
import pyomo.environ as pyo

# Create a concrete model
model = pyo.ConcreteModel()

# Sets
model.i = pyo.Set(initialize=['product1', 'product2'])

# Parameters
model.profit = pyo.Param(model.i, initialize={'product1': 10, 'product2': 15})
model.resource_usage = pyo.Param(model.i, initialize={'product1': 5, 'product2': 7})
model.resource_limit = pyo.Param(initialize=100)

# Variables
model.x = pyo.Var(model.i, domain=pyo.NonNegativeReals)

# Objective
def obj_rule(model):
    return sum(model.profit[i] * model.x[i] for i in model.i)
model.objective = pyo.Objective(rule=obj_rule, sense=pyo.maximize)

# Constraints
def resource_rule(model):
    return sum(model.resource_usage[i] * model.x[i] for i in model.i) <= model.resource_limit
model.resource_constraint = pyo.Constraint(rule=resource_rule)

# Solve
solver = pyo.SolverFactory('highs')
results = solver.solve(model)

# Results
print("Termination:", results.solver.termination_condition)
for i in model.i:
    print(f"{i}: {pyo.value(model.x[i])}")
"#;

/// The same production model written against the pulp surface
pub const PULP_EXAMPLE: &str = r#"# Example: choose production quantities to maximize profit
from pulp import *

# Create the problem
model = LpProblem(name="production_problem", sense=LpMaximize)

# Variables
x1 = LpVariable(name="product1", lowBound=0)
x2 = LpVariable(name="product2", lowBound=0)

# Objective
model += 10 * x1 + 15 * x2, "Profit"

# Constraints
model += 5 * x1 + 7 * x2 <= 100, "Resource_Constraint"

# Solve
model.solve(PULP_CBC_CMD(msg=False))

# Results
print("Status:", LpStatus[model.status])
print(f"product1: {value(x1)}")
print(f"product2: {value(x2)}")
"#;

/// The guide for `framework`
pub fn guide(framework: Framework) -> LibraryGuide {
    match framework {
        Framework::ConstraintBased => LibraryGuide {
            description: "Pyomo is a Python-based open-source optimization modeling language.",
            import_statement: "import pyomo.environ as pyo",
            example: PYOMO_EXAMPLE,
        },
        Framework::LinearExpression => LibraryGuide {
            description: "PuLP is an LP modeler written in Python, allowing for easy creation of linear programs.",
            import_statement: "from pulp import *",
            example: PULP_EXAMPLE,
        },
    }
}

/// The prompt asking for a `framework` model of `description`
pub fn build_prompt(description: &str, framework: Framework, style: PromptStyle) -> String {
    let library = framework.library();
    let description = description.trim();
    match style {
        PromptStyle::Direct => format!(
            "You are an expert in mathematical optimization and operations research.\n\n\
             Please convert the following optimization problem description into valid Python code \
             using the {library} framework.\n\n\
             Include the objective function, constraints, variable definitions, and solver configuration.\n\
             Bind the model object to a variable named `model`.\n\
             Structure the code clearly with a comment for each section, and use variable names \
             that reflect their meaning in the problem.\n\n\
             Problem description:\n{description}\n\n\
             Return only the Python code without any additional explanation.\n"
        ),
        PromptStyle::FewShot => {
            let guide = guide(framework);
            format!(
                "You are an expert in mathematical optimization and operations research.\n\n\
                 I need you to formulate an optimization problem using the {library} framework.\n\n\
                 {description_of_library}\n\n\
                 Please create a well-structured {library} model with the following components:\n\
                 1. Proper import statements (e.g., {import})\n\
                 2. Clear variable definitions with appropriate domains\n\
                 3. Objective function (clearly indicate if maximizing or minimizing)\n\
                 4. All necessary constraints\n\
                 5. Solver configuration\n\
                 6. Code to display the results\n\n\
                 Bind the model object to a variable named `model`, and comment each component.\n\n\
                 Here's an example of how to structure the model:\n\n\
                 ```python\n{example}```\n\n\
                 Now, please create a similar model for the following problem:\n\n\
                 {description}\n\n\
                 Return only the Python code without any additional explanation.\n",
                description_of_library = guide.description,
                import = guide.import_statement,
                example = guide.example,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompts_are_deterministic() {
        let a = build_prompt("maximize profit", Framework::ConstraintBased, PromptStyle::FewShot);
        let b = build_prompt("maximize profit", Framework::ConstraintBased, PromptStyle::FewShot);
        assert_eq!(a, b);
    }

    #[test]
    fn direct_prompt_names_the_library_and_description() {
        let prompt = build_prompt("  ship 10 crates  ", Framework::LinearExpression, PromptStyle::Direct);
        assert!(prompt.contains("using the pulp framework"));
        assert!(prompt.contains("Problem description:\nship 10 crates\n"));
        assert!(!prompt.contains("```"));
    }

    #[test]
    fn few_shot_prompt_embeds_the_example() {
        let prompt = build_prompt("x", Framework::ConstraintBased, PromptStyle::FewShot);
        assert!(prompt.contains("import pyomo.environ as pyo"));
        assert!(prompt.contains(PYOMO_EXAMPLE));
        assert!(prompt.trim_end().ends_with("without any additional explanation."));
    }

    #[test]
    fn style_names() {
        assert_eq!("few_shot".parse::<PromptStyle>().unwrap(), PromptStyle::FewShot);
        assert_eq!(PromptStyle::Direct.to_string(), "direct");
        assert!("chain".parse::<PromptStyle>().is_err());
    }
}
