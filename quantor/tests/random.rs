//! Randomized properties: the solver must agree with ground-truth
//! quantifier expansion, and emitted strategies must win the matrix.

use anyhow::Result;
use hashbrown::HashMap;
use quantor::circuit::{Node, Valuation};
use quantor::{Circuit, GateKind, NodeId, QbfResult, Quantifier, Solver, SolverOptions};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

fn random_circuit(rng: &mut ChaCha8Rng) -> Circuit {
    let mut circuit = Circuit::new();
    let mut next_id: NodeId = 1;
    let mut nodes: Vec<NodeId> = Vec::new();

    let num_blocks = rng.gen_range(1..=3);
    let mut quant = if rng.gen() {
        Quantifier::Exists
    } else {
        Quantifier::Forall
    };
    for _ in 0..num_blocks {
        let scope = circuit.new_scope(quant);
        for _ in 0..rng.gen_range(1..=3) {
            circuit.new_var(scope, next_id);
            nodes.push(next_id);
            next_id += 1;
        }
        quant = quant.negate();
    }

    let num_gates = rng.gen_range(1..=6);
    let mut output = 0;
    for _ in 0..num_gates {
        let kind = if rng.gen() { GateKind::And } else { GateKind::Or };
        let gate = circuit.new_gate(next_id, kind);
        next_id += 1;
        for _ in 0..rng.gen_range(1..=3) {
            let node = nodes[rng.gen_range(0..nodes.len())];
            let lit = if rng.gen() { node as i32 } else { -(node as i32) };
            circuit.add_gate_input(gate, lit);
        }
        nodes.push(gate);
        output = gate;
    }
    circuit.set_output(output as i32);
    circuit
}

/// Ground truth by full quantifier expansion over the prefix.
fn expand(circuit: &Circuit, blocks: &[(Quantifier, NodeId)], values: &mut Valuation) -> bool {
    let Some(&(quant, var)) = blocks.first() else {
        let mut evaluated = values.clone();
        circuit.evaluate(&mut evaluated);
        return evaluated.value(circuit.output().unsigned_abs()) > 0;
    };
    let rest = &blocks[1..];
    let mut results = [false, false];
    for (index, value) in [-1, 1].into_iter().enumerate() {
        values.set(var, value);
        results[index] = expand(circuit, rest, values);
    }
    values.set(var, 0);
    match quant {
        Quantifier::Exists => results[0] || results[1],
        Quantifier::Forall => results[0] && results[1],
    }
}

fn brute_force(circuit: &Circuit) -> QbfResult {
    let mut blocks = Vec::new();
    for scope in circuit.prefix_scopes() {
        let scope = circuit.scope(scope);
        for &var in &scope.vars {
            blocks.push((scope.quant, var));
        }
    }
    let mut values = Valuation::for_circuit(circuit);
    if expand(circuit, &blocks, &mut values) {
        QbfResult::Sat
    } else {
        QbfResult::Unsat
    }
}

fn configurations() -> Vec<SolverOptions> {
    let default = SolverOptions::default();
    vec![
        default.clone(),
        SolverOptions {
            preprocess: false,
            ..default.clone()
        },
        SolverOptions {
            use_combined_abstraction: false,
            ..default.clone()
        },
        SolverOptions {
            assignment_b_lit_minimization: false,
            preprocess: false,
            ..default.clone()
        },
        SolverOptions {
            miniscoping: true,
            ..default
        },
    ]
}

#[test]
fn test_random_circuits_against_expansion() -> Result<()> {
    let mut rng = ChaCha8Rng::seed_from_u64(0x5eed);
    for iteration in 0..80 {
        let circuit = random_circuit(&mut rng);
        let mut reference = circuit.clone();
        reference.reencode()?;
        let expected = brute_force(&reference);

        for (config, options) in configurations().into_iter().enumerate() {
            let mut solver = Solver::new(options, circuit.clone());
            let result = solver.solve()?;
            assert_eq!(
                result, expected,
                "iteration {iteration}, configuration {config}"
            );
        }
    }
    Ok(())
}

/// Substitutes the winning strategy into the matrix and checks every
/// opponent assignment.
fn strategy_wins(matrix: &Circuit, solver: &Solver, result: QbfResult) -> bool {
    let strategy = solver.certification().unwrap().strategy(result);
    let expected = result == QbfResult::Sat;
    let inputs = strategy.inputs();

    for mask in 0u32..(1 << inputs.len()) {
        let mut env = HashMap::new();
        let mut assignment: HashMap<i32, bool> = HashMap::new();
        for (index, (lit, label)) in inputs.iter().enumerate() {
            let value = mask & (1 << index) != 0;
            env.insert(*lit, value);
            assignment.insert(label.parse().unwrap(), value);
        }
        let output_values = strategy.evaluate(&env);
        for ((_, label), value) in strategy.outputs().iter().zip(output_values) {
            if label != "result" {
                assignment.insert(label.parse().unwrap(), value);
            }
        }
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
        if (values.value(matrix.output().unsigned_abs()) > 0) != expected {
            return false;
        }
    }
    true
}

#[test]
fn test_random_certificates_win_the_matrix() -> Result<()> {
    let mut rng = ChaCha8Rng::seed_from_u64(0xcafe);
    for iteration in 0..40 {
        let circuit = random_circuit(&mut rng);
        let mut matrix = circuit.clone();
        matrix.reencode()?;

        for preprocess in [true, false] {
            let options = SolverOptions {
                certify: true,
                preprocess,
                ..SolverOptions::default()
            };
            let mut solver = Solver::new(options, circuit.clone());
            let result = solver.solve()?;
            assert!(
                strategy_wins(&matrix, &solver, result),
                "iteration {iteration}, preprocess {preprocess}"
            );
        }
    }
    Ok(())
}
