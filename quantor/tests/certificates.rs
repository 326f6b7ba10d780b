//! Certificate synthesis checks: the emitted Skolem (Herbrand) network,
//! substituted into the matrix, must satisfy (falsify) it under every
//! assignment of the opponent's variables.

use anyhow::Result;
use hashbrown::HashMap;
use quantor::circuit::{Node, Valuation};
use quantor::{Circuit, GateKind, Lit, QbfResult, Quantifier, Solver, SolverOptions};

fn certify_options(preprocess: bool) -> SolverOptions {
    SolverOptions {
        certify: true,
        preprocess,
        ..SolverOptions::default()
    }
}

/// Substitutes the winning strategy into `matrix` (a reencoded copy of the
/// original circuit) and checks it under every assignment of the strategy's
/// inputs.
fn check_strategy(matrix: &Circuit, solver: &Solver, result: QbfResult) {
    let strategy = solver.certification().unwrap().strategy(result);
    let expected = result == QbfResult::Sat;

    let inputs = strategy.inputs();
    assert!(inputs.len() <= 16, "too many inputs to enumerate");
    for mask in 0u32..(1 << inputs.len()) {
        let mut env = HashMap::new();
        let mut assignment: HashMap<Lit, bool> = HashMap::new();
        for (index, (lit, label)) in inputs.iter().enumerate() {
            let value = mask & (1 << index) != 0;
            env.insert(*lit, value);
            assignment.insert(label.parse().unwrap(), value);
        }

        let output_values = strategy.evaluate(&env);
        for ((_, label), value) in strategy.outputs().iter().zip(output_values) {
            if label == "result" {
                assert_eq!(value, expected);
                continue;
            }
            assignment.insert(label.parse().unwrap(), value);
        }
        // Variables removed by preprocessing keep their forced value.
        for record in solver.circuit().var_records() {
            assignment.entry(record.orig_id).or_insert(record.value > 0);
        }

        let mut values = Valuation::for_circuit(matrix);
        for id in 1..=matrix.max_num() {
            if let Some(Node::Var(var)) = matrix.try_node(id) {
                let value = assignment.get(&var.info.orig_id).copied().unwrap_or(false);
                values.set(id, if value { 1 } else { -1 });
            }
        }
        matrix.evaluate(&mut values);
        let matrix_value = values.value(matrix.output().unsigned_abs()) > 0;
        assert_eq!(
            matrix_value, expected,
            "strategy fails under opponent assignment {mask:b}"
        );
    }
}

fn solve_and_check(circuit: Circuit, expected: QbfResult) -> Result<()> {
    let mut matrix = circuit.clone();
    matrix.reencode()?;
    for preprocess in [true, false] {
        let mut solver = Solver::new(certify_options(preprocess), circuit.clone());
        assert_eq!(solver.solve()?, expected);
        check_strategy(&matrix, &solver, expected);
    }
    Ok(())
}

#[test]
fn test_exists_x_skolem_is_true() -> Result<()> {
    let mut circuit = Circuit::new();
    let e = circuit.new_scope(Quantifier::Exists);
    circuit.new_var(e, 1);
    circuit.new_gate(2, GateKind::And);
    circuit.add_gate_input(2, 1);
    circuit.set_output(2);
    solve_and_check(circuit, QbfResult::Sat)
}

#[test]
fn test_forall_x_herbrand_is_false() -> Result<()> {
    let mut circuit = Circuit::new();
    let a = circuit.new_scope(Quantifier::Forall);
    circuit.new_var(a, 1);
    circuit.new_gate(2, GateKind::And);
    circuit.add_gate_input(2, 1);
    circuit.set_output(2);

    let mut matrix = circuit.clone();
    matrix.reencode()?;
    let mut solver = Solver::new(certify_options(true), circuit.clone());
    assert_eq!(solver.solve()?, QbfResult::Unsat);
    check_strategy(&matrix, &solver, QbfResult::Unsat);

    // The counter-witness assigns x = false.
    let strategy = solver.certification().unwrap().strategy(QbfResult::Unsat);
    let outputs = strategy.evaluate(&HashMap::new());
    let x_position = strategy
        .outputs()
        .iter()
        .position(|(_, label)| label == "1")
        .unwrap();
    assert!(!outputs[x_position]);
    Ok(())
}

#[test]
fn test_constant_skolem_function() -> Result<()> {
    // forall x exists y: (x | y) & (-x | y); the Skolem function for y is
    // constant true.
    let mut circuit = Circuit::new();
    let a = circuit.new_scope(Quantifier::Forall);
    circuit.new_var(a, 1);
    let e = circuit.new_scope(Quantifier::Exists);
    circuit.new_var(e, 2);
    circuit.new_gate(3, GateKind::Or);
    circuit.add_gate_input(3, 1);
    circuit.add_gate_input(3, 2);
    circuit.new_gate(4, GateKind::Or);
    circuit.add_gate_input(4, -1);
    circuit.add_gate_input(4, 2);
    circuit.new_gate(5, GateKind::And);
    circuit.add_gate_input(5, 3);
    circuit.add_gate_input(5, 4);
    circuit.set_output(5);
    solve_and_check(circuit.clone(), QbfResult::Sat)?;

    let mut solver = Solver::new(certify_options(false), circuit);
    solver.solve()?;
    let strategy = solver.certification().unwrap().strategy(QbfResult::Sat);
    for x in [false, true] {
        let mut env = HashMap::new();
        if let Some((lit, _)) = strategy.inputs().first() {
            env.insert(*lit, x);
        }
        let outputs = strategy.evaluate(&env);
        let y_position = strategy
            .outputs()
            .iter()
            .position(|(_, label)| label == "2")
            .unwrap();
        assert!(outputs[y_position], "y must be constant true");
    }
    Ok(())
}

#[test]
fn test_equality_skolem_is_identity() -> Result<()> {
    // forall x exists y: x <-> y; the Skolem function for y is x itself.
    let mut circuit = Circuit::new();
    let a = circuit.new_scope(Quantifier::Forall);
    circuit.new_var(a, 1);
    let e = circuit.new_scope(Quantifier::Exists);
    circuit.new_var(e, 2);
    circuit.new_gate(3, GateKind::Or);
    circuit.add_gate_input(3, -1);
    circuit.add_gate_input(3, 2);
    circuit.new_gate(4, GateKind::Or);
    circuit.add_gate_input(4, 1);
    circuit.add_gate_input(4, -2);
    circuit.new_gate(5, GateKind::And);
    circuit.add_gate_input(5, 3);
    circuit.add_gate_input(5, 4);
    circuit.set_output(5);
    solve_and_check(circuit.clone(), QbfResult::Sat)?;

    let mut solver = Solver::new(certify_options(false), circuit);
    solver.solve()?;
    let strategy = solver.certification().unwrap().strategy(QbfResult::Sat);
    let x_lit = strategy.inputs()[0].0;
    let y_position = strategy
        .outputs()
        .iter()
        .position(|(_, label)| label == "2")
        .unwrap();
    for x in [false, true] {
        let mut env = HashMap::new();
        env.insert(x_lit, x);
        let outputs = strategy.evaluate(&env);
        assert_eq!(outputs[y_position], x, "y must equal x");
    }
    Ok(())
}

#[test]
fn test_herbrand_for_losing_universal() -> Result<()> {
    // exists x forall y: x & y; Herbrand for y is constant false.
    let mut circuit = Circuit::new();
    let e = circuit.new_scope(Quantifier::Exists);
    circuit.new_var(e, 1);
    let a = circuit.new_scope(Quantifier::Forall);
    circuit.new_var(a, 2);
    circuit.new_gate(3, GateKind::And);
    circuit.add_gate_input(3, 1);
    circuit.add_gate_input(3, 2);
    circuit.set_output(3);
    solve_and_check(circuit.clone(), QbfResult::Unsat)?;

    let mut solver = Solver::new(certify_options(false), circuit);
    solver.solve()?;
    let strategy = solver.certification().unwrap().strategy(QbfResult::Unsat);
    let y_position = strategy
        .outputs()
        .iter()
        .position(|(_, label)| label == "2")
        .unwrap();
    for x in [false, true] {
        let mut env = HashMap::new();
        if let Some((lit, _)) = strategy.inputs().first() {
            env.insert(*lit, x);
        }
        let outputs = strategy.evaluate(&env);
        assert!(!outputs[y_position], "y must be constant false");
    }
    Ok(())
}

#[test]
fn test_constant_outputs_round_trip_through_aag() -> Result<()> {
    // An empty conjunction is true; the certificate is a constant network.
    let mut circuit = Circuit::new();
    circuit.new_gate(1, GateKind::And);
    circuit.set_output(1);
    let mut solver = Solver::new(certify_options(true), circuit);
    assert_eq!(solver.solve()?, QbfResult::Sat);
    let mut buffer = Vec::new();
    solver.write_certificate(&mut buffer)?;
    let text = String::from_utf8(buffer).unwrap();
    assert!(text.starts_with("aag 0 0 0 1 0\n"));
    assert!(text.contains("\n1\n"));
    assert!(text.contains("o0 result"));
    assert!(text.contains("SAT"));

    // An empty disjunction is false.
    let mut circuit = Circuit::new();
    circuit.new_gate(1, GateKind::Or);
    circuit.set_output(1);
    let mut solver = Solver::new(certify_options(true), circuit);
    assert_eq!(solver.solve()?, QbfResult::Unsat);
    let mut buffer = Vec::new();
    solver.write_certificate(&mut buffer)?;
    let text = String::from_utf8(buffer).unwrap();
    assert!(text.starts_with("aag 0 0 0 1 0\n"));
    assert!(text.contains("o0 result"));
    assert!(text.contains("UNSAT"));
    Ok(())
}
