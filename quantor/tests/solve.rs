//! End-to-end solving scenarios over hand-built circuits.

use anyhow::Result;
use quantor::{Circuit, GateKind, QbfResult, Quantifier, Solver, SolverOptions};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn solve_with(circuit: Circuit, options: SolverOptions) -> Result<QbfResult> {
    let mut solver = Solver::new(options, circuit);
    solver.solve()
}

fn solve(circuit: &Circuit) -> Result<QbfResult> {
    // Exercise the solver with and without preprocessing; the result must
    // not depend on it.
    let preprocessed = solve_with(circuit.clone(), SolverOptions::default())?;
    let plain = solve_with(
        circuit.clone(),
        SolverOptions {
            preprocess: false,
            ..SolverOptions::default()
        },
    )?;
    assert_eq!(preprocessed, plain, "preprocessing changed the result");
    Ok(preprocessed)
}

/// exists x: x
fn exists_x() -> Circuit {
    let mut circuit = Circuit::new();
    let e = circuit.new_scope(Quantifier::Exists);
    circuit.new_var(e, 1);
    circuit.new_gate(2, GateKind::And);
    circuit.add_gate_input(2, 1);
    circuit.set_output(2);
    circuit
}

/// forall x: x
fn forall_x() -> Circuit {
    let mut circuit = Circuit::new();
    let a = circuit.new_scope(Quantifier::Forall);
    circuit.new_var(a, 1);
    circuit.new_gate(2, GateKind::And);
    circuit.add_gate_input(2, 1);
    circuit.set_output(2);
    circuit
}

/// forall x exists y: (x | y) & (-x | y)
fn constant_skolem() -> Circuit {
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
    circuit
}

/// forall x exists y: x <-> y
fn equality() -> Circuit {
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
    circuit
}

/// exists x forall y: x & y
fn conjunction_of_players() -> Circuit {
    let mut circuit = Circuit::new();
    let e = circuit.new_scope(Quantifier::Exists);
    circuit.new_var(e, 1);
    let a = circuit.new_scope(Quantifier::Forall);
    circuit.new_var(a, 2);
    circuit.new_gate(3, GateKind::And);
    circuit.add_gate_input(3, 1);
    circuit.add_gate_input(3, 2);
    circuit.set_output(3);
    circuit
}

/// forall u1 u2 exists e: (u1 | e) & (u2 | -e)
fn two_constraints() -> Circuit {
    let mut circuit = Circuit::new();
    let a = circuit.new_scope(Quantifier::Forall);
    circuit.new_var(a, 1);
    circuit.new_var(a, 2);
    let e = circuit.new_scope(Quantifier::Exists);
    circuit.new_var(e, 3);
    circuit.new_gate(4, GateKind::Or);
    circuit.add_gate_input(4, 1);
    circuit.add_gate_input(4, 3);
    circuit.new_gate(5, GateKind::Or);
    circuit.add_gate_input(5, 2);
    circuit.add_gate_input(5, -3);
    circuit.new_gate(6, GateKind::And);
    circuit.add_gate_input(6, 4);
    circuit.add_gate_input(6, 5);
    circuit.set_output(6);
    circuit
}

#[test]
fn test_exists_x_is_sat() -> Result<()> {
    init_logging();
    assert_eq!(solve(&exists_x())?, QbfResult::Sat);
    Ok(())
}

#[test]
fn test_forall_x_is_unsat() -> Result<()> {
    init_logging();
    assert_eq!(solve(&forall_x())?, QbfResult::Unsat);
    Ok(())
}

#[test]
fn test_constant_skolem_is_sat() -> Result<()> {
    init_logging();
    assert_eq!(solve(&constant_skolem())?, QbfResult::Sat);
    Ok(())
}

#[test]
fn test_equality_is_sat() -> Result<()> {
    init_logging();
    assert_eq!(solve(&equality())?, QbfResult::Sat);
    Ok(())
}

#[test]
fn test_conjunction_of_players_is_unsat() -> Result<()> {
    init_logging();
    assert_eq!(solve(&conjunction_of_players())?, QbfResult::Unsat);
    Ok(())
}

#[test]
fn test_two_constraints_is_unsat() -> Result<()> {
    init_logging();
    assert_eq!(solve(&two_constraints())?, QbfResult::Unsat);
    Ok(())
}

#[test]
fn test_two_constraints_with_miniscoping() -> Result<()> {
    init_logging();
    let options = SolverOptions {
        miniscoping: true,
        ..SolverOptions::default()
    };
    assert_eq!(solve_with(two_constraints(), options)?, QbfResult::Unsat);
    Ok(())
}

#[test]
fn test_empty_and_output_is_sat() -> Result<()> {
    init_logging();
    let mut circuit = Circuit::new();
    circuit.new_gate(1, GateKind::And);
    circuit.set_output(1);
    assert_eq!(solve(&circuit)?, QbfResult::Sat);
    Ok(())
}

#[test]
fn test_empty_or_output_is_unsat() -> Result<()> {
    init_logging();
    let mut circuit = Circuit::new();
    circuit.new_gate(1, GateKind::Or);
    circuit.set_output(1);
    assert_eq!(solve(&circuit)?, QbfResult::Unsat);
    Ok(())
}

#[test]
fn test_propositional_circuit_is_a_single_sat_call() -> Result<()> {
    init_logging();
    // (x | y) & (-x | y): satisfiable with y = true.
    let mut circuit = Circuit::new();
    let top = circuit.top_level();
    circuit.new_var(top, 1);
    circuit.new_var(top, 2);
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
    assert_eq!(solve(&circuit)?, QbfResult::Sat);

    // x & -x: propositional and unsatisfiable.
    let mut circuit = Circuit::new();
    let top = circuit.top_level();
    circuit.new_var(top, 1);
    circuit.new_gate(2, GateKind::Or);
    circuit.add_gate_input(2, 1);
    circuit.new_gate(3, GateKind::Or);
    circuit.add_gate_input(3, -1);
    circuit.new_gate(4, GateKind::And);
    circuit.add_gate_input(4, 2);
    circuit.add_gate_input(4, 3);
    circuit.set_output(4);
    assert_eq!(solve(&circuit)?, QbfResult::Unsat);
    Ok(())
}

#[test]
fn test_partial_assignment_of_winning_scope() -> Result<()> {
    init_logging();
    let options = SolverOptions {
        partial_assignment: true,
        preprocess: false,
        ..SolverOptions::default()
    };
    let mut solver = Solver::new(options, conjunction_of_players());
    assert_eq!(solver.solve()?, QbfResult::Unsat);
    // The formula is UNSAT and the outermost block is existential, so no
    // assignment belongs to the winner.
    assert!(solver.partial_assignment().is_none());

    let options = SolverOptions {
        partial_assignment: true,
        preprocess: false,
        ..SolverOptions::default()
    };
    let mut solver = Solver::new(options, exists_x());
    assert_eq!(solver.solve()?, QbfResult::Sat);
    let assignment = solver.partial_assignment().unwrap();
    assert_eq!(assignment, vec![1]);

    let mut output = Vec::new();
    solver.write_partial_assignment(&mut output)?;
    assert_eq!(String::from_utf8(output).unwrap(), "V 1 0\n");
    Ok(())
}

#[test]
fn test_deep_alternation() -> Result<()> {
    init_logging();
    // forall a exists b forall c exists d:
    //   (a | b) & (-a | -b) & (c | d) & (-c | -d)
    // b = -a and d = -c, so the formula is true.
    let mut circuit = Circuit::new();
    let s1 = circuit.new_scope(Quantifier::Forall);
    circuit.new_var(s1, 1);
    let s2 = circuit.new_scope(Quantifier::Exists);
    circuit.new_var(s2, 2);
    let s3 = circuit.new_scope(Quantifier::Forall);
    circuit.new_var(s3, 3);
    let s4 = circuit.new_scope(Quantifier::Exists);
    circuit.new_var(s4, 4);
    let clauses = [[1, 2], [-1, -2], [3, 4], [-3, -4]];
    let mut gate_id = 5;
    let mut and_inputs = Vec::new();
    for clause in clauses {
        circuit.new_gate(gate_id, GateKind::Or);
        for lit in clause {
            circuit.add_gate_input(gate_id, lit);
        }
        and_inputs.push(gate_id);
        gate_id += 1;
    }
    circuit.new_gate(gate_id, GateKind::And);
    for input in and_inputs {
        circuit.add_gate_input(gate_id, input as i32);
    }
    circuit.set_output(gate_id as i32);
    assert_eq!(solve(&circuit)?, QbfResult::Sat);
    Ok(())
}
