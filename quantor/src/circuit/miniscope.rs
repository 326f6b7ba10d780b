//! Miniscoping (pushing quantifiers inward) and prenexing (hoisting them
//! back out).

use anyhow::Result;
use hashbrown::HashMap;
use log::{debug, info};
use quantor_util::BitSet;

use crate::circuit::{check, Circuit, Node, Valuation, TOP_LEVEL};
use crate::literal::{lit_of, lit_with_sign_of, var_of, GateKind, Lit, NodeId, Quantifier, ScopeRef, NO_NODE};

impl Circuit {
    pub(crate) fn scope_exists(&self, scope: ScopeRef) -> bool {
        self.scopes_slot(scope).is_some()
    }

    fn move_variable(&mut self, var_id: NodeId, from: ScopeRef, to: ScopeRef) {
        debug_assert_eq!(self.var(var_id).scope, from);
        let vars = &mut self.scope_mut(from).vars;
        let pos = vars.iter().position(|&v| v == var_id).unwrap();
        vars.remove(pos);
        self.scope_mut(to).vars.push(var_id);
        self.var_mut(var_id).scope = to;
    }

    fn copy_variable(&mut self, var_id: NodeId, new_scope: ScopeRef) -> NodeId {
        let orig_id = self.var(var_id).info.orig_id;
        let copy = self.new_var(new_scope, self.max_num() + 1);
        self.var_mut(copy).info.orig_id = orig_id;
        let index = self.var(copy).var_index as usize;
        self.vars[index].orig_id = orig_id;
        copy
    }

    fn copy_gate(&mut self, gate_id: NodeId) -> NodeId {
        let (kind, inputs) = {
            let gate = self.gate(gate_id);
            (gate.kind, gate.inputs.clone())
        };
        let copy = self.new_gate(self.max_num() + 1, kind);
        for input in inputs {
            self.add_gate_input(copy, input);
        }
        copy
    }

    /// Rewrites `subtree` so that variables in `mapping` are replaced by
    /// their copies. A gate referenced from outside the subtree being
    /// rebuilt is copied before it is touched (copy-on-write keyed by the
    /// owning scope node); occurrence counts are maintained at the single
    /// point where an input slot changes.
    fn replace_variables_in_subtree(
        &mut self,
        mapping: &mut HashMap<NodeId, NodeId>,
        owner: NodeId,
        shared: bool,
        subtree: Lit,
    ) -> Lit {
        let subtree_var = var_of(subtree);
        match self.node(subtree_var) {
            Node::Var(_) => {
                debug_assert!(!mapping.contains_key(&subtree_var));
                subtree
            }
            Node::Scope(node) => {
                debug_assert!(!shared);
                let sub = node.sub;
                let new_sub = self.replace_variables_in_subtree(mapping, owner, shared, sub);
                debug_assert_eq!(new_sub, sub);
                self.scope_node_mut(subtree_var).sub = new_sub;
                subtree
            }
            Node::Gate(_) => {
                let mut gate_id = subtree_var;
                let shared = shared || self.info(gate_id).num_occ > 1;
                let num_inputs = self.gate(gate_id).inputs.len();
                for i in 0..num_inputs {
                    let gate_input = self.gate(gate_id).inputs[i];
                    let gate_input_var = var_of(gate_input);
                    let (new_input, transformed) = match mapping.get(&gate_input_var) {
                        // May be a variable copy or a previously copied gate.
                        Some(&replacement) => {
                            (lit_with_sign_of(replacement, gate_input), replacement)
                        }
                        None => {
                            let rewritten = self
                                .replace_variables_in_subtree(mapping, owner, shared, gate_input);
                            (rewritten, var_of(rewritten))
                        }
                    };

                    if new_input != gate_input {
                        if shared && self.gate(gate_id).owner != owner {
                            debug_assert_eq!(self.gate(gate_id).owner, NO_NODE);
                            let copy = self.copy_gate(gate_id);
                            mapping.insert(gate_id, copy);
                            self.gate_mut(copy).owner = owner;
                            // The copy duplicates every reference it holds.
                            for j in 0..self.gate(copy).inputs.len() {
                                if j != i {
                                    let input = self.gate(copy).inputs[j];
                                    self.info_mut(var_of(input)).num_occ += 1;
                                } else {
                                    self.info_mut(transformed).num_occ += 1;
                                }
                            }
                            let orig_id = self.gate(gate_id).info.orig_id;
                            self.gate_mut(copy).info.orig_id = orig_id;
                            debug_assert_eq!(
                                self.gate(gate_id).inputs.len(),
                                self.gate(copy).inputs.len()
                            );
                            gate_id = copy;
                        } else {
                            self.info_mut(gate_input_var).num_occ -= 1;
                            self.info_mut(transformed).num_occ += 1;
                        }
                    }
                    self.gate_mut(gate_id).inputs[i] = new_input;
                }
                lit_of(gate_id, false)
            }
        }
    }

    /// A universal over a conjunction (dually, an existential over a
    /// disjunction) distributes: each input gets its own quantifier node
    /// binding copies of the variables that actually influence it.
    fn split_scope(&mut self, scope: ScopeRef, gate_id: NodeId) {
        let quant = self.scope(scope).quant;
        let num_inputs = self.gate(gate_id).inputs.len();

        for i in 0..num_inputs {
            let gate_input = self.gate(gate_id).inputs[i];
            let node_id = self.new_scope_node(quant, self.max_num() + 1);
            let new_scope = self.scope_node(node_id).scope;

            let mut replacement = HashMap::new();
            let scope_vars = self.scope(scope).vars.clone();
            for var in scope_vars {
                let index = self.var(var).var_index as usize;
                if self.info(var_of(gate_input)).influences.contains(index) {
                    let copy = self.copy_variable(var, new_scope);
                    replacement.insert(var, copy);
                }
            }
            if self.scope(new_scope).vars.is_empty() {
                // Nothing to bind below this input.
                self.clear_slot(node_id);
                self.drop_scope_slot(new_scope);
                continue;
            }

            self.gate_mut(gate_id).inputs[i] = lit_of(node_id, false);
            let new_sub =
                self.replace_variables_in_subtree(&mut replacement, node_id, false, gate_input);
            self.scope_node_mut(node_id).sub = new_sub;
            self.info_mut(node_id).num_occ = 1;
            if new_sub != gate_input {
                self.info_mut(var_of(new_sub)).num_occ += 1;
                self.info_mut(var_of(gate_input)).num_occ -= 1;
            }
        }

        debug_assert!(self.scope(scope).children.is_empty());

        // The original variables are replaced by their per-input copies.
        let values = Valuation::default();
        let vars = self.scope(scope).vars.clone();
        for var in vars {
            let index = self.var(var).var_index as usize;
            self.remove_var(&values, var);
            self.vars[index].superseded = true;
        }

        // Free subtrees that lost their last reference.
        for id in 1..=self.max_num() {
            if let Some(Node::Gate(gate)) = self.try_node(id) {
                if gate.info.num_occ == 0 && id != var_of(self.output()) {
                    self.remove_gates_recursive(id);
                }
            }
        }
    }

    /// A universal over a disjunction (dually, an existential over a
    /// conjunction) splits along the connected components of the
    /// "co-appears in some input" relation, computed by a union-find over
    /// the inputs' influence sets.
    fn partition_scope(&mut self, scope: ScopeRef, gate_id: NodeId, partitions: &mut [u32]) {
        let scope_scope_id = self.scope(scope).scope_id;
        let quant = self.scope(scope).quant;

        // Union the partitions of variables sharing an input.
        let num_inputs = self.gate(gate_id).inputs.len();
        for i in 0..num_inputs {
            let gate_input = self.gate(gate_id).inputs[i];
            let influence: Vec<usize> =
                self.info(var_of(gate_input)).influences.iter().collect();
            let mut connection: Option<u32> = None;
            for var_index in influence {
                let node = self.vars[var_index].node;
                debug_assert!(node != NO_NODE);
                if self.scope(self.var(node).scope).scope_id < scope_scope_id {
                    continue;
                }

                let var_id = var_index as u32;
                while partitions[partitions[var_id as usize] as usize]
                    != partitions[var_id as usize]
                {
                    partitions[var_id as usize] =
                        partitions[partitions[var_id as usize] as usize];
                }
                let class = partitions[var_id as usize];
                match connection {
                    None => connection = Some(class),
                    Some(current) if current < class => {
                        partitions[class as usize] = current;
                        partitions[var_id as usize] = current;
                    }
                    Some(current) if current > class => {
                        partitions[current as usize] = class;
                        connection = Some(class);
                    }
                    _ => {}
                }
            }
        }

        // One scope node per equivalence class. Flattening the forest and
        // assigning group representatives happens in a single ascending
        // sweep: the representative of a class is always its smallest
        // variable index.
        let mut num_groups = 0usize;
        let mut groups: HashMap<u32, NodeId> = HashMap::new();
        let mut pivots: Vec<u32> = Vec::new();
        for var_index in 0..self.vars.len() {
            let node = self.vars[var_index].node;
            if node == NO_NODE {
                continue;
            }
            let var_scope = self.var(node).scope;
            if self.scope(var_scope).scope_id < scope_scope_id || var_scope != scope {
                continue;
            }
            let var_id = var_index as u32;
            loop {
                partitions[var_index] = partitions[partitions[var_index] as usize];
                let p = partitions[var_index];
                if !(p >= var_id && p != partitions[p as usize]) {
                    break;
                }
            }

            if partitions[var_index] == var_id {
                num_groups += 1;
                let node_id = self.new_scope_node(quant, self.max_num() + 1);
                let new_scope = self.scope_node(node_id).scope;
                groups.insert(var_id, node_id);
                self.move_variable(node, scope, new_scope);
                self.link_scope(scope, new_scope);
                pivots.push(var_id);
            } else {
                debug_assert!(partitions[var_index] < var_id);
                debug_assert!(num_groups > 0);
                let node_id = groups[&partitions[var_index]];
                let new_scope = self.scope_node(node_id).scope;
                self.move_variable(node, scope, new_scope);
                self.link_scope(scope, new_scope);
            }
            debug!(
                "variable {} is in variable group {}",
                var_id, partitions[var_index]
            );
        }
        info!("detected {} groups", num_groups);

        // The gate is rewritten below, so remember its original inputs.
        let original_inputs = self.gate(gate_id).inputs.clone();

        for pivot in pivots {
            let node_id = groups[&pivot];
            let group_scope = self.scope_node(node_id).scope;

            let mut relevant_inputs: Vec<Lit> = Vec::new();
            for &gate_input in &original_inputs {
                let group_vars = self.scope(group_scope).vars.clone();
                let hits = group_vars.iter().any(|&v| {
                    let index = self.var(v).var_index as usize;
                    self.info(var_of(gate_input)).influences.contains(index)
                });
                if hits {
                    relevant_inputs.push(gate_input);
                }
            }
            debug_assert!(!relevant_inputs.is_empty());

            if relevant_inputs.len() > 1 {
                // Group the inputs of this class under an auxiliary gate of
                // the parent's type.
                let kind = self.gate(gate_id).kind;
                let aux = self.new_gate(self.max_num() + 1, kind);
                self.info_mut(aux).num_occ = 1;
                self.info_mut(aux).influences = BitSet::new(self.num_vars());
                for &gate_input in &relevant_inputs {
                    self.gate_mut(gate_id).remove_input(gate_input);
                    self.add_gate_input(aux, gate_input);
                    let source =
                        std::mem::take(&mut self.info_mut(var_of(gate_input)).influences);
                    self.info_mut(aux).influences.union_with(&source);
                    self.info_mut(var_of(gate_input)).influences = source;
                }
                self.scope_node_mut(node_id).sub = lit_of(aux, false);
                self.add_gate_input(gate_id, lit_of(node_id, false));
            } else {
                let gate_input = relevant_inputs[0];
                self.gate_mut(gate_id).remove_input(gate_input);
                self.scope_node_mut(node_id).sub = gate_input;
                self.add_gate_input(gate_id, lit_of(node_id, false));
            }

            debug_assert_eq!(self.info(node_id).num_occ, 0);
            self.info_mut(node_id).num_occ = 1;
            let sub = self.scope_node(node_id).sub;
            self.info_mut(node_id).influences = BitSet::new(self.num_vars());
            let source = std::mem::take(&mut self.info_mut(var_of(sub)).influences);
            self.info_mut(node_id).influences.union_with(&source);
            self.info_mut(var_of(sub)).influences = source;
        }

        // The links to the fresh scope nodes are rebuilt by the next
        // reencoding; detach them before dropping the scope.
        while let Some(&next) = self.scope(scope).children.first() {
            self.unlink_scope(scope, next);
        }
        if scope != TOP_LEVEL {
            self.remove_scope(&Valuation::default(), scope);
        }
    }

    fn apply_miniscoping(&mut self, scope: ScopeRef, target: NodeId, partitions: &mut [u32]) {
        if !matches!(self.try_node(target), Some(Node::Gate(_))) {
            return;
        }
        self.compute_variable_influence();

        if self.info(target).num_occ > 1 {
            // Do not split below a shared gate.
            return;
        }

        let quant = self.scope(scope).quant;
        let kind = self.gate(target).kind;
        if (kind == GateKind::And && quant == Quantifier::Forall)
            || (kind == GateKind::Or && quant == Quantifier::Exists)
        {
            self.split_scope(scope, target);
        } else {
            self.partition_scope(scope, target, partitions);
        }
        debug_assert!(check::check_occurrences(self));
    }

    fn unprenex_recursive(&mut self, scope: ScopeRef, partitions: &mut [u32]) {
        // Children created by splitting deeper scopes are appended later and
        // must not be revisited, so iterate over a snapshot.
        let children = self.scope(scope).children.clone();
        for child in children {
            if !self.scope_exists(child) {
                continue;
            }
            self.unprenex_recursive(child, partitions);
        }

        if scope == TOP_LEVEL && self.scope(scope).vars.is_empty() {
            return;
        }
        debug_assert!(!self.scope(scope).vars.is_empty());

        let node = self.scope(scope).node;
        let target = if node != NO_NODE {
            var_of(self.scope_node(node).sub)
        } else {
            var_of(self.output())
        };
        self.apply_miniscoping(scope, target, partitions);
    }

    /// Converts the circuit into non-prenex form by pushing quantifiers
    /// inward, starting at the leaf scopes.
    pub fn unprenex_by_miniscoping(&mut self) -> Result<()> {
        let mut partitions: Vec<u32> = (0..self.num_vars() as u32).collect();
        self.unprenex_recursive(TOP_LEVEL, &mut partitions);
        self.reencode()
    }

    /// Converts the circuit into prenex form by collapsing the quantifier
    /// tree level by level into fresh tail-prefix scopes.
    pub fn to_prenex(&mut self) {
        let values = Valuation::default();
        let mut last_in_prefix = TOP_LEVEL;
        while let Some(next) = self.next_scope_in_prefix(last_in_prefix) {
            last_in_prefix = next;
        }
        self.set_previous_scope(last_in_prefix);

        while !self.scope(last_in_prefix).children.is_empty() {
            let quant = self.scope(last_in_prefix).quant.negate();
            let new_last = self.new_scope(quant);

            // All current leaves of this level share the new quantifier
            // type; merge them into the fresh prefix scope. New scopes are
            // appended at the back of the child list, so the leaves stay at
            // the front.
            while self.scope(last_in_prefix).children.len() > 1 {
                let not_in_prefix = self.scope(last_in_prefix).children[0];
                debug_assert_eq!(self.scope(not_in_prefix).quant, quant);
                debug_assert!(self.scope(not_in_prefix).node != NO_NODE);
                self.unlink_scope(last_in_prefix, not_in_prefix);
                self.link_scope(new_last, not_in_prefix);
                self.merge_scopes(&values, not_in_prefix, new_last);
            }
            debug_assert_eq!(self.scope(last_in_prefix).children[0], new_last);
            last_in_prefix = new_last;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::check;

    /// forall u1 u2 exists e: and(or(u1, e), or(u2, -e))
    fn shared_existential() -> Circuit {
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
        circuit.reencode().unwrap();
        circuit
    }

    /// forall u1 u2 exists e1 e2: and(or(u1, e1), or(u2, e2))
    fn independent_existentials() -> Circuit {
        let mut circuit = Circuit::new();
        let a = circuit.new_scope(Quantifier::Forall);
        circuit.new_var(a, 1);
        circuit.new_var(a, 2);
        let e = circuit.new_scope(Quantifier::Exists);
        circuit.new_var(e, 3);
        circuit.new_var(e, 4);
        circuit.new_gate(5, GateKind::Or);
        circuit.add_gate_input(5, 1);
        circuit.add_gate_input(5, 3);
        circuit.new_gate(6, GateKind::Or);
        circuit.add_gate_input(6, 2);
        circuit.add_gate_input(6, 4);
        circuit.new_gate(7, GateKind::And);
        circuit.add_gate_input(7, 5);
        circuit.add_gate_input(7, 6);
        circuit.set_output(7);
        circuit.reencode().unwrap();
        circuit
    }

    fn scope_tree_is_chain(circuit: &Circuit) -> bool {
        let mut scope = TOP_LEVEL;
        loop {
            let s = circuit.scope(scope);
            if s.children.len() > 1 {
                return false;
            }
            match s.children.first() {
                Some(&next) => scope = next,
                None => return true,
            }
        }
    }

    #[test]
    fn test_shared_variable_prevents_partitioning() {
        let mut circuit = shared_existential();
        circuit.unprenex_by_miniscoping().unwrap();
        // e connects both inputs, so no branching is introduced.
        assert!(scope_tree_is_chain(&circuit));
        assert!(check::check(&circuit));
    }

    #[test]
    fn test_independent_variables_are_partitioned() {
        let mut circuit = independent_existentials();
        circuit.unprenex_by_miniscoping().unwrap();
        assert!(!circuit.is_prenex());
        assert!(!scope_tree_is_chain(&circuit));
        assert!(check::check(&circuit));
    }

    #[test]
    fn test_forall_splits_over_conjunction() {
        // forall x1 x2: and(x1-part, x2-part) splits the universal.
        let mut circuit = Circuit::new();
        let a = circuit.new_scope(Quantifier::Forall);
        circuit.new_var(a, 1);
        circuit.new_var(a, 2);
        circuit.new_gate(3, GateKind::Or);
        circuit.add_gate_input(3, 1);
        circuit.add_gate_input(3, -1);
        circuit.new_gate(4, GateKind::Or);
        circuit.add_gate_input(4, 2);
        circuit.add_gate_input(4, -2);
        circuit.new_gate(5, GateKind::And);
        circuit.add_gate_input(5, 3);
        circuit.add_gate_input(5, 4);
        circuit.set_output(5);
        circuit.reencode().unwrap();
        circuit.unprenex_by_miniscoping().unwrap();

        assert!(!circuit.is_prenex());
        assert!(!scope_tree_is_chain(&circuit));
        // The original universals were superseded by copies.
        assert_eq!(
            circuit.vars.iter().filter(|entry| entry.superseded).count(),
            2
        );
        assert!(check::check(&circuit));
    }

    #[test]
    fn test_prenexing_restores_a_prefix() {
        let mut circuit = independent_existentials();
        let prefix_before: Vec<_> = circuit
            .prefix_scopes()
            .map(|s| (circuit.scope(s).quant, circuit.scope(s).vars.len()))
            .collect();
        circuit.unprenex_by_miniscoping().unwrap();
        circuit.to_prenex();
        circuit.reencode().unwrap();
        assert!(circuit.is_prenex());
        let prefix_after: Vec<_> = circuit
            .prefix_scopes()
            .map(|s| (circuit.scope(s).quant, circuit.scope(s).vars.len()))
            .collect();
        assert_eq!(prefix_before, prefix_after);
    }
}
