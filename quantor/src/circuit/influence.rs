//! Influence analysis: which variables and which scope depths a node
//! depends on, and which scopes a node is relevant for.

use quantor_util::BitSet;

use crate::circuit::{Circuit, Node, Phase, TOP_LEVEL};
use crate::literal::{var_of, Lit, NodeId, ScopeRef, NO_NODE};

fn union_influences(circuit: &mut Circuit, dst: NodeId, src: NodeId) {
    debug_assert_ne!(dst, src);
    let source = std::mem::take(&mut circuit.info_mut(src).influences);
    circuit.info_mut(dst).influences.union_with(&source);
    circuit.info_mut(src).influences = source;
}

fn variable_influence_dfs(circuit: &mut Circuit, lit: Lit) {
    let id = var_of(lit);
    if circuit.info(id).dfs_processed {
        return;
    }
    match circuit.node(id) {
        Node::Var(_) => {}
        Node::Gate(gate) => {
            let inputs = gate.inputs.clone();
            for input in inputs {
                variable_influence_dfs(circuit, input);
                union_influences(circuit, id, var_of(input));
            }
            circuit.info_mut(id).dfs_processed = true;
        }
        Node::Scope(node) => {
            let sub = node.sub;
            variable_influence_dfs(circuit, sub);
            union_influences(circuit, id, var_of(sub));
            circuit.info_mut(id).dfs_processed = true;
        }
    }
}

impl Circuit {
    /// Computes, for every node reachable from the output, the set of
    /// variable indices it depends on. Restartable: resets the DFS marks
    /// and previous sets first.
    pub fn compute_variable_influence(&mut self) {
        let max_var = self.num_vars();
        for id in 1..=self.max_num() {
            if self.try_node(id).is_none() {
                continue;
            }
            {
                let info = self.info_mut(id);
                info.influences = BitSet::new(max_var);
                info.dfs_processed = false;
            }
            match self.node_mut(id) {
                Node::Var(var) => {
                    let index = var.var_index as usize;
                    debug_assert!(index < max_var);
                    var.info.influences.insert(index);
                }
                Node::Gate(gate) => {
                    gate.owner = NO_NODE;
                }
                Node::Scope(_) => {}
            }
        }
        variable_influence_dfs(self, self.output());
    }

    fn recompute_scope_max_depth(&mut self, scope: ScopeRef) -> u32 {
        let mut max_depth = self.scope(scope).depth;
        let children = self.scope(scope).children.clone();
        for child in children {
            max_depth = max_depth.max(self.recompute_scope_max_depth(child));
        }
        self.scope_mut(scope).max_depth = max_depth;
        max_depth
    }

    /// Computes, for every node, the set of scope depths it depends on, and
    /// refreshes each scope's `max_depth`. Nodes are visited in topological
    /// order, so a single ascending sweep suffices.
    pub fn compute_scope_influence(&mut self) {
        assert!(
            self.phase() == Phase::Encoded,
            "circuit must be encoded before influence analysis"
        );
        let max_depth = self.max_depth() as usize;

        for id in 1..=self.max_num() {
            self.info_mut(id).influences = BitSet::new(max_depth);

            match self.node(id) {
                Node::Var(var) => {
                    let depth = self.scope(var.scope).depth as usize;
                    debug_assert!(depth < max_depth);
                    self.info_mut(id).influences.insert(depth);
                }
                Node::Gate(gate) => {
                    let inputs = gate.inputs.clone();
                    for input in inputs {
                        union_influences(self, id, var_of(input));
                    }
                }
                Node::Scope(node) => {
                    let sub = node.sub;
                    let parent = self.scope(node.scope).parent;
                    union_influences(self, id, var_of(sub));
                    if parent == Some(TOP_LEVEL) {
                        // A quantifier directly below the top level still
                        // depends on the top-level decisions.
                        let top_depth = self.scope(TOP_LEVEL).depth as usize;
                        self.info_mut(id).influences.insert(top_depth);
                    }
                }
            }

            if self.info(id).influences.min().is_none() {
                let top_depth = self.scope(TOP_LEVEL).depth as usize;
                self.info_mut(id).influences.insert(top_depth);
            }
        }

        self.recompute_scope_max_depth(TOP_LEVEL);
    }

    /// Computes, for every node, the set of scope ids in whose subformula
    /// it occurs. Prefix scopes see the whole circuit; a quantifier node
    /// restricts its subtree.
    pub fn compute_relevant_scopes(&mut self) {
        let capacity = self.max_scope_id() as usize;
        let mut relevant = BitSet::new(capacity);
        let prefix: Vec<_> = self.prefix_scopes().collect();
        for scope in prefix {
            relevant.insert(self.scope(scope).scope_id as usize);
        }

        for id in 1..=self.max_num() {
            self.info_mut(id).relevant_for = BitSet::new(capacity);
        }

        let output = self.output();
        relevant_scopes_recursive(self, &mut relevant, output);
    }
}

fn relevant_scopes_recursive(circuit: &mut Circuit, relevant: &mut BitSet, lit: Lit) {
    let id = var_of(lit);
    if circuit.info(id).relevant_for == *relevant {
        // Only propagate new information.
        return;
    }
    circuit.info_mut(id).relevant_for.union_with(relevant);

    match circuit.node(id) {
        Node::Var(_) => {}
        Node::Gate(gate) => {
            let inputs = gate.inputs.clone();
            for input in inputs {
                relevant_scopes_recursive(circuit, relevant, input);
            }
        }
        Node::Scope(node) => {
            let scope_id = circuit.scope(node.scope).scope_id as usize;
            let sub = node.sub;
            relevant.insert(scope_id);
            circuit.info_mut(id).relevant_for.insert(scope_id);
            relevant_scopes_recursive(circuit, relevant, sub);
            relevant.remove(scope_id);
        }
    }
}
