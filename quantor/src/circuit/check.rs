//! Structural audits over the circuit, run after every preprocessing pass
//! and used directly by tests.
//!
//! All checks return `bool` so they compose under `debug_assert!`.

use log::error;

use crate::circuit::{Circuit, Node, Phase, Valuation, TOP_LEVEL};
use crate::literal::{var_of, NodeId, ScopeRef, NO_NODE};

fn is_defined(circuit: &Circuit, id: NodeId) -> bool {
    circuit.try_node(id).is_some()
}

/// Every literal appearing as a gate input or scope-node sub refers to a
/// defined node.
pub fn all_nodes_defined(circuit: &Circuit) -> bool {
    let mut all_defined = true;
    for id in 1..=circuit.max_num() {
        match circuit.try_node(id) {
            Some(Node::Gate(gate)) => {
                for &input in &gate.inputs {
                    if !is_defined(circuit, var_of(input)) {
                        error!(
                            "node {} is undefined (referenced by node {})",
                            var_of(input),
                            id
                        );
                        all_defined = false;
                    }
                }
            }
            Some(Node::Scope(node)) => {
                if !is_defined(circuit, var_of(node.sub)) {
                    error!(
                        "node {} is undefined (referenced by node {})",
                        var_of(node.sub),
                        id
                    );
                    all_defined = false;
                }
            }
            _ => {}
        }
    }
    all_defined
}

/// After encoding, every gate input and scope-node sub has a strictly
/// smaller id than its parent.
pub fn check_topological(circuit: &Circuit) -> bool {
    if circuit.phase() == Phase::Building {
        return true;
    }
    for id in 1..=circuit.max_num() {
        match circuit.try_node(id) {
            Some(Node::Gate(gate)) => {
                if gate.inputs.iter().any(|&input| var_of(input) >= id) {
                    return false;
                }
            }
            Some(Node::Scope(node)) => {
                if node.sub == 0 || var_of(node.sub) >= id {
                    return false;
                }
            }
            _ => {}
        }
    }
    true
}

/// Negations appear only on literals whose variable is a `Var` node.
pub fn check_nnf(circuit: &Circuit) -> bool {
    for id in 1..=circuit.max_num() {
        match circuit.try_node(id) {
            Some(Node::Gate(gate)) => {
                for &input in &gate.inputs {
                    if input < 0 && !matches!(circuit.try_node(var_of(input)), Some(Node::Var(_)))
                    {
                        return false;
                    }
                }
            }
            Some(Node::Scope(node)) => {
                if node.sub < 0
                    && !matches!(circuit.try_node(var_of(node.sub)), Some(Node::Var(_)))
                {
                    return false;
                }
            }
            _ => {}
        }
    }
    true
}

/// Recomputing the occurrence counts from scratch matches the stored
/// counts.
pub fn check_occurrences(circuit: &Circuit) -> bool {
    let mut counts = vec![0usize; circuit.max_num() as usize + 1];
    for id in 1..=circuit.max_num() {
        match circuit.try_node(id) {
            Some(Node::Gate(gate)) => {
                for &input in &gate.inputs {
                    counts[var_of(input) as usize] += 1;
                }
            }
            Some(Node::Scope(node)) => {
                counts[var_of(node.sub) as usize] += 1;
            }
            _ => {}
        }
    }
    for id in 1..=circuit.max_num() {
        if let Some(node) = circuit.try_node(id) {
            if node.info().num_occ != counts[id as usize] {
                error!(
                    "node {} has {} stored occurrences, recounted {}",
                    id,
                    node.info().num_occ,
                    counts[id as usize]
                );
                return false;
            }
        }
    }
    true
}

/// Outside of propagation, no live node except the output carries a value.
pub fn check_values(circuit: &Circuit, values: &Valuation) -> bool {
    for id in 1..=circuit.max_num() {
        if circuit.try_node(id).is_none() {
            continue;
        }
        if id != var_of(circuit.output()) && values.value(id) != 0 {
            return false;
        }
    }
    true
}

fn check_scopes_recursive(circuit: &Circuit, scope: ScopeRef) -> bool {
    let s = circuit.scope(scope);
    for &child in &s.children {
        if child == scope || circuit.scope(child).parent != Some(scope) {
            return false;
        }
        if !check_scopes_recursive(circuit, child) {
            return false;
        }
    }
    if s.node == NO_NODE && circuit.phase() != Phase::Building && s.depth != s.scope_id {
        // Prefix scopes are numbered along the chain.
        return false;
    }
    if scope == TOP_LEVEL {
        if s.parent.is_some() {
            return false;
        }
    } else {
        if s.vars.is_empty() {
            return false;
        }
        if s.node != NO_NODE {
            match circuit.try_node(s.node) {
                Some(Node::Scope(node)) if node.scope == scope => {}
                _ => return false,
            }
        }
    }
    true
}

/// Scope tree shape: parent/child links are symmetric, non-top scopes are
/// non-empty, anchored scopes point back at their node.
pub fn check_scopes(circuit: &Circuit) -> bool {
    check_scopes_recursive(circuit, TOP_LEVEL)
}

/// Every variable is contained in the var list of the scope it names.
pub fn check_variables(circuit: &Circuit) -> bool {
    for id in 1..=circuit.max_num() {
        if let Some(Node::Var(var)) = circuit.try_node(id) {
            if !circuit.scope(var.scope).vars.contains(&id) {
                return false;
            }
        }
    }
    // Each live variable appears in exactly one scope list.
    let mut seen = vec![false; circuit.max_num() as usize + 1];
    let mut stack = vec![TOP_LEVEL];
    while let Some(scope) = stack.pop() {
        let s = circuit.scope(scope);
        for &var in &s.vars {
            if seen[var as usize] {
                return false;
            }
            seen[var as usize] = true;
        }
        stack.extend(&s.children);
    }
    true
}

fn check_alternation_recursive(circuit: &Circuit, scope: ScopeRef) -> bool {
    let s = circuit.scope(scope);
    for &child in &s.children {
        if circuit.scope(child).quant == s.quant {
            return false;
        }
        if !check_alternation_recursive(circuit, child) {
            return false;
        }
    }
    true
}

/// After encoding, quantifier types alternate strictly along every branch.
/// Scope removals may suspend the property while propagation runs, so it is
/// only enforced in the encoded phase.
pub fn check_alternation(circuit: &Circuit) -> bool {
    if circuit.phase() != Phase::Encoded {
        return true;
    }
    check_alternation_recursive(circuit, TOP_LEVEL)
}

/// All structural invariants at once.
pub fn check(circuit: &Circuit) -> bool {
    all_nodes_defined(circuit)
        && check_topological(circuit)
        && check_nnf(circuit)
        && check_occurrences(circuit)
        && check_scopes(circuit)
        && check_variables(circuit)
        && check_alternation(circuit)
}
