use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;

use autoopt::script::parse;
use autoopt::{Executor, Framework, SolverRegistry, analyze};

/// A pulp fragment with `n` variables, summed in the objective and bounded in pairs
fn pulp_fragment(n: usize) -> String {
    let mut code = String::from(
        "import pulp\nmodel = pulp.LpProblem('bench', pulp.LpMaximize)\n\
         x = [pulp.LpVariable(f'x{i}', lowBound=0, upBound=10) for i in range(",
    );
    code += &format!("{n})]\n");
    code += "model += pulp.lpSum(2 * v + 1 for v in x)\n";
    code += "for i in range(len(x) - 1):\n    model += x[i] + x[i + 1] <= 15\n";
    code += "model.solve()\n";
    code
}

pub fn criterion_benchmark(c: &mut Criterion) {
    let small = pulp_fragment(100);
    c.bench_function("parse a 100 variable fragment", |b| {
        b.iter(|| parse(black_box(&small)).unwrap())
    });

    c.bench_function("analyze a 100 variable fragment", |b| {
        b.iter(|| analyze(black_box(&small), Framework::LinearExpression))
    });

    let large = pulp_fragment(1_000);
    let registry = SolverRegistry::for_framework(Framework::LinearExpression);
    let executor = Executor::new(Framework::LinearExpression, "microlp", &registry).unwrap();
    c.bench_function("run and solve a 1000 variable fragment", |b| {
        b.iter(|| executor.solve(black_box(&large)))
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
