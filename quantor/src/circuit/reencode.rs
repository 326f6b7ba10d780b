//! Reencoding: negation normal form, scope cleanup and topological
//! renumbering.
//!
//! After reencoding, node ids are assigned in DFS post-order from the
//! output, so every gate input has a strictly smaller id than the gate, and
//! negations appear only on variable literals.

use anyhow::{bail, ensure, Result};

use crate::circuit::{check, Circuit, Node, Phase, Valuation, TOP_LEVEL};
use crate::literal::{lit_of, lit_with_sign_of, var_of, Lit, NodeId, NO_NODE};

impl Circuit {
    /// Creates the de-Morgan twin of a gate and caches the link on both
    /// sides. The twin's original id is the negation of the gate's.
    fn copy_and_negate(&mut self, gate_id: NodeId) -> NodeId {
        let (kind, inputs, orig_id) = {
            let gate = self.gate(gate_id);
            (gate.kind, gate.inputs.clone(), gate.info.orig_id)
        };
        let twin = self.new_gate(self.max_num() + 1, kind.negate());
        for input in inputs {
            self.add_gate_input(twin, -input);
        }
        {
            let twin_gate = self.gate_mut(twin);
            twin_gate.info.orig_id = -orig_id;
            twin_gate.negation = gate_id;
        }
        self.gate_mut(gate_id).negation = twin;
        twin
    }

    /// Rewrites every negated gate literal to the positive literal of the
    /// gate's de-Morgan twin. Twins are created lazily, one per gate, and
    /// are themselves converted as the scan reaches them. May orphan gates.
    fn to_nnf(&mut self) {
        if self.output() < 0 {
            let var = var_of(self.output());
            debug_assert!(matches!(self.node(var), Node::Gate(_)));
            let negation = self.gate(var).negation;
            let new_output = if negation != NO_NODE {
                negation
            } else {
                self.copy_and_negate(var)
            };
            self.replace_output(lit_of(new_output, false));
        }

        // Twins appended during the scan are visited as well.
        let mut id = 1;
        while id <= self.max_num() {
            if !matches!(self.try_node(id), Some(Node::Gate(_))) {
                id += 1;
                continue;
            }
            for pos in 0..self.gate(id).inputs.len() {
                let lit = self.gate(id).inputs[pos];
                let var = var_of(lit);
                if lit > 0 || matches!(self.node(var), Node::Var(_)) {
                    continue;
                }
                let negation = self.gate(var).negation;
                let twin = if negation != NO_NODE {
                    negation
                } else {
                    self.copy_and_negate(var)
                };
                self.gate_mut(id).inputs[pos] = lit_of(twin, false);
            }
            id += 1;
        }
    }

    pub(crate) fn remove_empty_scopes_from(&mut self, values: &Valuation, scope: u32) {
        let mut i = 0;
        while i < self.scope(scope).children.len() {
            let next = self.scope(scope).children[i];
            self.remove_empty_scopes_from(values, next);
            if !self.scope(next).vars.is_empty() {
                i += 1;
                continue;
            }
            self.remove_scope(values, next);
        }
    }

    /// While the output is a quantifier node, its scope is appended to the
    /// tail of the prefix and the node dissolved.
    fn lift_root_quantifiers(&mut self) {
        debug_assert!(self.output() > 0);
        if !matches!(self.node(var_of(self.output())), Node::Scope(_)) {
            return;
        }

        let mut last_quant = TOP_LEVEL;
        while let Some(next) = self.next_scope_in_prefix(last_quant) {
            last_quant = next;
        }

        loop {
            let node_id = var_of(self.output());
            let (scope, sub) = match self.try_node(node_id) {
                Some(Node::Scope(node)) => (node.scope, node.sub),
                _ => break,
            };
            debug_assert!(self.scope(scope).parent.is_none());
            self.link_scope(last_quant, scope);
            last_quant = scope;
            self.scope_mut(scope).node = NO_NODE;
            debug_assert!(sub > 0);
            self.replace_output(sub);
            // The output node cannot be referenced twice, so it is dropped
            // without occurrence bookkeeping.
            self.clear_slot(node_id);
        }
    }

    /// Merges every child scope whose quantifier type matches its parent's,
    /// establishing strict alternation along all branches.
    pub(crate) fn normalize_quantifiers(&mut self, values: &Valuation) {
        self.normalize_quantifiers_recursive(values, TOP_LEVEL);
    }

    fn normalize_quantifiers_recursive(&mut self, values: &Valuation, scope: u32) {
        let mut i = 0;
        while i < self.scope(scope).children.len() {
            let child = self.scope(scope).children[i];
            self.normalize_quantifiers_recursive(values, child);
            if self.scope(scope).quant != self.scope(child).quant {
                i += 1;
            } else {
                self.merge_scopes(values, child, scope);
            }
        }
    }

    /// Establishes the encoding assumed by evaluation and the abstraction
    /// builder:
    /// - nodes are topologically sorted: every input of a gate has a
    ///   smaller id than the gate itself,
    /// - the circuit is in negation normal form,
    /// - scope ids are consecutive, strictly increasing along the prefix,
    /// - quantifier types alternate strictly.
    pub fn reencode(&mut self) -> Result<()> {
        ensure!(
            check::all_nodes_defined(self),
            "circuit refers to undefined nodes"
        );
        assert!(self.output() != 0, "output must be set before reencoding");
        let values = Valuation::default();

        self.to_nnf();
        self.remove_empty_scopes_from(&values, TOP_LEVEL);
        self.lift_root_quantifiers();

        // Renumber the quantifier prefix.
        self.current_scope_id = 1;
        self.max_scope_id = 1;
        self.current_depth = 1;
        self.max_depth = 1;
        let mut cursor = Some(TOP_LEVEL);
        while let Some(scope) = cursor {
            let scope_id = self.current_scope_id;
            self.current_scope_id += 1;
            if self.current_scope_id > self.max_scope_id {
                self.max_scope_id = self.current_scope_id;
            }
            let depth = self.current_depth;
            self.current_depth += 1;
            if self.current_depth > self.max_depth {
                self.max_depth = self.current_depth;
            }
            {
                let s = self.scope_mut(scope);
                s.scope_id = scope_id;
                s.depth = depth;
                // Recomputed by the influence analysis once the tree shape
                // is final.
                s.max_depth = 0;
            }
            self.set_previous_scope(scope);
            cursor = self.next_scope_in_prefix(scope);
        }

        // Assign new ids in DFS post-order starting at the output.
        let mut new_ids = vec![0 as NodeId; self.max_num() as usize + 1];
        let mut next_id: NodeId = 1;
        let output = self.output();
        topological_sort_dfs(self, &mut new_ids, &mut next_id, output)?;

        // Drop nodes the DFS did not reach.
        for id in (1..=self.max_num()).rev() {
            if self.try_node(id).is_none() || new_ids[id as usize] != 0 {
                continue;
            }
            match self.node(id) {
                Node::Var(_) => self.remove_var(&values, id),
                Node::Gate(_) => self.remove_gate(&values, id),
                Node::Scope(_) => {
                    panic!("quantifier node {id} became unreachable during reencoding")
                }
            }
        }

        // Pack the arena by the new ids; the ids stored in the nodes were
        // already rewritten during the DFS.
        let new_max = new_ids[var_of(output) as usize];
        debug_assert!(new_max > 0 && new_max <= self.max_num());
        self.compact_nodes(new_max);

        // Remap the id lists kept outside the arena.
        for entry in self.vars.iter_mut() {
            if entry.node != NO_NODE {
                entry.node = new_ids[entry.node as usize];
                debug_assert!(entry.node != NO_NODE);
            }
        }
        self.remap_scope_vars(&new_ids, TOP_LEVEL);

        self.replace_output(lit_with_sign_of(new_max, output));
        self.set_phase(Phase::Encoded);

        self.normalize_quantifiers(&values);

        debug_assert!(check::check(self));
        Ok(())
    }

    fn remap_scope_vars(&mut self, new_ids: &[NodeId], scope: u32) {
        let mut vars = std::mem::take(&mut self.scope_mut(scope).vars);
        for var in vars.iter_mut() {
            *var = new_ids[*var as usize];
            debug_assert!(*var != NO_NODE);
        }
        self.scope_mut(scope).vars = vars;
        let children = self.scope(scope).children.clone();
        for child in children {
            self.remap_scope_vars(new_ids, child);
        }
    }
}

/// Rewrites `lit` to its post-DFS form, counting the occurrence on the
/// first encoding pass.
fn process_occurrence(
    circuit: &mut Circuit,
    new_ids: &mut [NodeId],
    next_id: &mut NodeId,
    lit: Lit,
) -> Result<Lit> {
    let occ_var = var_of(lit);
    debug_assert!(lit > 0 || matches!(circuit.node(occ_var), Node::Var(_)));

    topological_sort_dfs(circuit, new_ids, next_id, lit)?;
    let new_occ_var = new_ids[occ_var as usize];
    debug_assert!(new_occ_var > 0);

    if circuit.phase() == Phase::Building {
        // After the first reencoding the occurrence counts are maintained
        // incrementally.
        circuit.info_mut(occ_var).num_occ += 1;
    }
    Ok(lit_of(new_occ_var, lit < 0))
}

/// Assigns ids such that every parent's id is larger than its children's.
/// Also renumbers scopes and links embedded quantifiers into the tree at
/// the position the traversal finds them.
fn topological_sort_dfs(
    circuit: &mut Circuit,
    new_ids: &mut [NodeId],
    next_id: &mut NodeId,
    lit: Lit,
) -> Result<()> {
    // Ids are assigned post-order, so a node that is entered but not yet
    // numbered is marked with an id no real node can have.
    let marked = new_ids.len() as NodeId;
    let node_id = var_of(lit);
    debug_assert!(node_id > 0);

    if new_ids[node_id as usize] == marked {
        bail!("circuit contains a cycle through node {node_id}");
    }
    if new_ids[node_id as usize] != 0 {
        if matches!(circuit.node(node_id), Node::Scope(_)) {
            bail!("quantified subformula {node_id} is referenced more than once");
        }
        return Ok(());
    }

    match circuit.node(node_id) {
        Node::Var(_) => {
            let new_node = *next_id;
            *next_id += 1;
            new_ids[node_id as usize] = new_node;
            circuit.info_mut(node_id).id = new_node;
        }
        Node::Scope(node) => {
            let scope = node.scope;
            let sub = node.sub;
            new_ids[node_id as usize] = marked;

            // The embedded scope continues the chain at the traversal
            // position.
            let last_scope = circuit.previous_scope();
            circuit.link_scope(last_scope, scope);
            circuit.set_previous_scope(scope);

            let scope_id = circuit.current_scope_id;
            circuit.current_scope_id += 1;
            if circuit.current_scope_id > circuit.max_scope_id {
                circuit.max_scope_id = circuit.current_scope_id;
            }
            let depth = circuit.current_depth;
            circuit.current_depth += 1;
            if circuit.current_depth > circuit.max_depth {
                circuit.max_depth = circuit.current_depth;
            }
            {
                let s = circuit.scope_mut(scope);
                s.scope_id = scope_id;
                s.depth = depth;
                s.max_depth = depth;
            }

            let new_sub = process_occurrence(circuit, new_ids, next_id, sub)?;
            let new_node = *next_id;
            *next_id += 1;
            new_ids[node_id as usize] = new_node;
            {
                let n = circuit.scope_node_mut(node_id);
                n.info.id = new_node;
                n.sub = new_sub;
            }
            circuit.scope_mut(scope).node = new_node;

            circuit.set_previous_scope(last_scope);
            circuit.current_depth -= 1;
            let children = circuit.scope(scope).children.clone();
            let mut max_depth = circuit.scope(scope).max_depth;
            for child in children {
                max_depth = max_depth.max(circuit.scope(child).max_depth);
            }
            circuit.scope_mut(scope).max_depth = max_depth;
        }
        Node::Gate(_) => {
            new_ids[node_id as usize] = marked;
            circuit.gate_mut(node_id).reachable = true;
            let num_inputs = circuit.gate(node_id).inputs.len();
            for pos in 0..num_inputs {
                let input = circuit.gate(node_id).inputs[pos];
                let new_input = process_occurrence(circuit, new_ids, next_id, input)?;
                circuit.gate_mut(node_id).inputs[pos] = new_input;
            }
            let new_node = *next_id;
            *next_id += 1;
            new_ids[node_id as usize] = new_node;
            circuit.info_mut(node_id).id = new_node;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::Circuit;
    use crate::literal::{GateKind, Quantifier};

    fn two_level_circuit() -> Circuit {
        // forall x exists y: and(or(x, y), or(-x, -y)), built with gate ids
        // out of topological order and a negated gate reference.
        let mut circuit = Circuit::new();
        let a = circuit.new_scope(Quantifier::Forall);
        circuit.new_var(a, 4);
        let e = circuit.new_scope(Quantifier::Exists);
        circuit.new_var(e, 7);
        circuit.new_gate(2, GateKind::And);
        circuit.new_gate(9, GateKind::Or);
        circuit.add_gate_input(9, 4);
        circuit.add_gate_input(9, 7);
        circuit.new_gate(5, GateKind::And);
        circuit.add_gate_input(5, 4);
        circuit.add_gate_input(5, 7);
        circuit.add_gate_input(2, 9);
        // -5 = or(-x, -y) after NNF conversion
        circuit.add_gate_input(2, -5);
        circuit.set_output(2);
        circuit
    }

    #[test]
    fn test_reencode_establishes_topological_order_and_nnf() {
        let mut circuit = two_level_circuit();
        circuit.reencode().unwrap();
        assert!(check::check_topological(&circuit));
        assert!(check::check_nnf(&circuit));
        assert!(check::check_occurrences(&circuit));
        assert!(circuit.is_prenex());
    }

    #[test]
    fn test_reencode_is_a_fixed_point() {
        let mut circuit = two_level_circuit();
        circuit.reencode().unwrap();
        let ids_before: Vec<_> = (1..=circuit.max_num())
            .map(|id| circuit.info(id).orig_id)
            .collect();
        let output_before = circuit.output();
        circuit.reencode().unwrap();
        let ids_after: Vec<_> = (1..=circuit.max_num())
            .map(|id| circuit.info(id).orig_id)
            .collect();
        assert_eq!(ids_before, ids_after);
        assert_eq!(output_before, circuit.output());
        assert!(check::check_occurrences(&circuit));
    }

    #[test]
    fn test_unreachable_nodes_are_dropped() {
        let mut circuit = Circuit::new();
        let e = circuit.new_scope(Quantifier::Exists);
        circuit.new_var(e, 1);
        circuit.new_var(e, 2);
        circuit.new_gate(3, GateKind::And);
        circuit.add_gate_input(3, 1);
        // Gate 4 is never referenced by the output.
        circuit.new_gate(4, GateKind::Or);
        circuit.add_gate_input(4, 2);
        circuit.set_output(3);
        circuit.reencode().unwrap();
        // Output gate and variable 1 survive.
        assert_eq!(circuit.max_num(), 2);
        assert!(check::check(&circuit));
    }

    #[test]
    fn test_cycle_is_detected() {
        let mut circuit = Circuit::new();
        let e = circuit.new_scope(Quantifier::Exists);
        circuit.new_var(e, 1);
        circuit.new_gate(2, GateKind::And);
        circuit.new_gate(3, GateKind::Or);
        circuit.add_gate_input(2, 3);
        circuit.add_gate_input(2, 1);
        circuit.add_gate_input(3, 2);
        circuit.set_output(2);
        let err = circuit.reencode().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_shared_quantified_subformula_is_rejected() {
        let mut circuit = Circuit::new();
        let e = circuit.new_scope(Quantifier::Exists);
        circuit.new_var(e, 1);
        let node = circuit.new_scope_node(Quantifier::Forall, 4);
        let a = circuit.scope_node(node).scope;
        circuit.new_var(a, 2);
        circuit.new_gate(3, GateKind::Or);
        circuit.add_gate_input(3, 1);
        circuit.add_gate_input(3, 2);
        circuit.set_scope_node_sub(4, 3);
        circuit.new_gate(5, GateKind::And);
        circuit.add_gate_input(5, 4);
        circuit.new_gate(6, GateKind::Or);
        circuit.add_gate_input(6, 4);
        circuit.new_gate(7, GateKind::And);
        circuit.add_gate_input(7, 5);
        circuit.add_gate_input(7, 6);
        circuit.set_output(7);
        let err = circuit.reencode().unwrap_err();
        assert!(err.to_string().contains("referenced more than once"));
    }

    #[test]
    fn test_undefined_node_is_rejected() {
        let mut circuit = Circuit::new();
        let e = circuit.new_scope(Quantifier::Exists);
        circuit.new_var(e, 1);
        circuit.new_gate(2, GateKind::And);
        circuit.add_gate_input(2, 1);
        circuit.add_gate_input(2, 5);
        circuit.set_output(2);
        let err = circuit.reencode().unwrap_err();
        assert!(err.to_string().contains("undefined"));
    }

    #[test]
    fn test_root_quantifier_is_lifted_into_prefix() {
        let mut circuit = Circuit::new();
        let e = circuit.new_scope(Quantifier::Exists);
        circuit.new_var(e, 1);
        let node = circuit.new_scope_node(Quantifier::Forall, 5);
        let inner = circuit.scope_node(node).scope;
        circuit.new_var(inner, 2);
        circuit.new_gate(3, GateKind::Or);
        circuit.add_gate_input(3, 1);
        circuit.add_gate_input(3, 2);
        circuit.new_gate(4, GateKind::And);
        circuit.add_gate_input(4, 3);
        circuit.set_scope_node_sub(5, 4);
        circuit.set_output(5);
        circuit.reencode().unwrap();
        assert!(circuit.is_prenex());
        assert!(matches!(
            circuit.node(var_of(circuit.output())),
            Node::Gate(_)
        ));
    }
}
