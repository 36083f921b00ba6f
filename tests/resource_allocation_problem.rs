//! A resource allocation problem, written once per modeling surface and solved through the executor.
//!
//! In this problem, we decide the production quantities for several products.
//! Each product requires a certain amount of fuel and time to produce,
//! and provides a specific profit per unit.
//!
//! The goal is to maximize the overall profit without exceeding the available fuel and time.
//! The model code is generated from the product list, the way a text generator would write it.

use autoopt::{Executor, Framework, SolutionRecord, SolveStatus, SolverRegistry};
use float_eq::assert_float_eq;

struct Product {
    name: &'static str,
    // amount of fuel producing 1 unit takes
    needed_fuel: f64,
    // time it takes to produce 1 unit
    needed_time: f64,
    value: f64, // The amount of money we can sell an unit of the product for
}

struct ResourceAllocationProblem {
    available_fuel: f64,
    available_time: f64,
    products: Vec<Product>,
}

impl ResourceAllocationProblem {
    fn pyomo(&self) -> String {
        let names: Vec<String> = self.products.iter().map(|p| format!("'{}'", p.name)).collect();
        let table = |field: fn(&Product) -> f64| -> String {
            let entries: Vec<String> = self
                .products
                .iter()
                .map(|p| format!("'{}': {}", p.name, field(p)))
                .collect();
            format!("{{{}}}", entries.join(", "))
        };
        format!(
            "import pyomo.environ as pyo

model = pyo.ConcreteModel()
model.P = pyo.Set(initialize=[{names}])
model.fuel_use = pyo.Param(model.P, initialize={fuel})
model.time_use = pyo.Param(model.P, initialize={time})
model.unit_value = pyo.Param(model.P, initialize={value})
model.produce = pyo.Var(model.P, domain=pyo.NonNegativeReals)

model.profit = pyo.Objective(expr=sum(model.unit_value[p] * model.produce[p] for p in model.P), sense=pyo.maximize)

def fuel_rule(m):
    return sum(m.fuel_use[p] * m.produce[p] for p in m.P) <= {available_fuel}
model.fuel_limit = pyo.Constraint(rule=fuel_rule)

def time_rule(m):
    return sum(m.time_use[p] * m.produce[p] for p in m.P) <= {available_time}
model.time_limit = pyo.Constraint(rule=time_rule)

results = pyo.SolverFactory('highs').solve(model)
",
            names = names.join(", "),
            fuel = table(|p| p.needed_fuel),
            time = table(|p| p.needed_time),
            value = table(|p| p.value),
            available_fuel = self.available_fuel,
            available_time = self.available_time,
        )
    }

    fn pulp(&self) -> String {
        let mut code = String::from(
            "from pulp import *\n\nmodel = LpProblem('resource_allocation', LpMaximize)\n",
        );
        for p in &self.products {
            code += &format!("{0} = LpVariable('{0}', lowBound=0)\n", p.name);
        }
        let sum = |field: fn(&Product) -> f64| -> String {
            let terms: Vec<String> = self
                .products
                .iter()
                .map(|p| format!("{} * {}", field(p), p.name))
                .collect();
            terms.join(" + ")
        };
        code += &format!("model += {}, 'profit'\n", sum(|p| p.value));
        code += &format!("model += {} <= {}, 'fuel_limit'\n", sum(|p| p.needed_fuel), self.available_fuel);
        code += &format!("model += {} <= {}, 'time_limit'\n", sum(|p| p.needed_time), self.available_time);
        code += "model.solve(PULP_CBC_CMD(msg=0))\n";
        code
    }

    fn solve(&self, framework: Framework) -> SolutionRecord {
        let registry = SolverRegistry::for_framework(framework);
        let executor = Executor::new(framework, "microlp", &registry).unwrap();
        let code = match framework {
            Framework::ConstraintBased => self.pyomo(),
            Framework::LinearExpression => self.pulp(),
        };
        executor.solve(&code)
    }
}

fn steel_problem() -> ResourceAllocationProblem {
    ResourceAllocationProblem {
        available_fuel: 5.,
        available_time: 3.,
        products: vec![
            Product {
                name: "steel",
                needed_fuel: 1.,
                needed_time: 1.,
                value: 10.,
            },
            Product {
                name: "stainless_steel",
                needed_fuel: 2.,
                needed_time: 1.,
                value: 11.,
            },
        ],
    }
}

#[test]
fn resource_allocation_pyomo() {
    let record = steel_problem().solve(Framework::ConstraintBased);
    assert_eq!(record.status, SolveStatus::Optimal, "{:?}", record.message);
    // The amount of steel we should produce
    assert_float_eq!(1., record.variables["produce[steel]"].value.unwrap(), abs <= 1e-6);
    // The amount of stainless steel we should produce
    assert_float_eq!(2., record.variables["produce[stainless_steel]"].value.unwrap(), abs <= 1e-6);
    assert_float_eq!(32., record.objective_value.unwrap(), abs <= 1e-6);
    assert_eq!(record.solver.termination_condition.as_deref(), Some("optimal"));
    let constraints: Vec<&str> = record.constraints.keys().map(String::as_str).collect();
    assert_eq!(constraints, vec!["fuel_limit", "time_limit"]);
}

#[test]
fn resource_allocation_pulp() {
    let record = steel_problem().solve(Framework::LinearExpression);
    assert_eq!(record.status, SolveStatus::Optimal, "{:?}", record.message);
    assert_float_eq!(1., record.variables["steel"].value.unwrap(), abs <= 1e-6);
    assert_float_eq!(2., record.variables["stainless_steel"].value.unwrap(), abs <= 1e-6);
    assert_float_eq!(32., record.objective_value.unwrap(), abs <= 1e-6);
    assert_eq!(record.solver.termination_condition.as_deref(), Some("Optimal"));
}

#[test]
fn both_surfaces_agree() {
    let mut problem = steel_problem();
    problem.products.push(Product {
        name: "alloy",
        needed_fuel: 0.5,
        needed_time: 2.,
        value: 9.,
    });
    let pyomo = problem.solve(Framework::ConstraintBased);
    let pulp = problem.solve(Framework::LinearExpression);
    assert_float_eq!(
        pyomo.objective_value.unwrap(),
        pulp.objective_value.unwrap(),
        abs <= 1e-6
    );
}
