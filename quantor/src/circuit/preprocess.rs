//! Satisfiability-preserving simplifications, applied to a fixed point:
//! gate flattening, singleton removal, polarity-based forcing and constant
//! propagation.

use anyhow::Result;
use log::{debug, info};

use crate::circuit::{check, Circuit, Node, Phase, Polarity, Valuation, TOP_LEVEL};
use crate::literal::{var_of, Lit, NodeId, Quantifier};

impl Circuit {
    /// Inlines a gate with a single input into its parent.
    fn remove_singleton_gate(&mut self, values: &Valuation, outer: NodeId, pos: usize) {
        let inner_lit = self.gate(outer).inputs[pos];
        let inner = var_of(inner_lit);
        debug_assert_eq!(self.gate(inner).inputs.len(), 1);
        debug!(
            "singleton gate {} ({})",
            inner,
            self.info(inner).orig_id
        );

        self.gate_mut(outer).remove_input(inner_lit);

        let input = self.gate(inner).inputs[0];
        let added = self.add_gate_input(outer, input);

        self.info_mut(inner).num_occ -= 1;
        if self.info(inner).num_occ == 0 {
            // Dropping the inner gate hands its single reference over to the
            // parent, so the counts only change if the parent already had
            // the input.
            self.gate_mut(inner).inputs.clear();
            self.remove_gate(values, inner);
            if !added {
                self.info_mut(var_of(input)).num_occ -= 1;
            }
        } else if added {
            self.info_mut(var_of(input)).num_occ += 1;
        }

        debug_assert!(check::check(self));
    }

    /// Moves all inputs of a same-type gate with a single occurrence into
    /// its parent and frees it.
    fn flatten_into(&mut self, values: &Valuation, outer: NodeId, pos: usize) {
        let inner_lit = self.gate(outer).inputs[pos];
        debug_assert!(inner_lit > 0);
        let inner = var_of(inner_lit);
        debug_assert_eq!(self.gate(outer).kind, self.gate(inner).kind);
        debug_assert_eq!(self.info(inner).num_occ, 1);

        self.gate_mut(outer).remove_input_at(pos);

        let inputs = self.gate(inner).inputs.clone();
        for input in inputs {
            let added = self.add_gate_input(outer, input);
            if !added {
                self.info_mut(var_of(input)).num_occ -= 1;
            }
        }
        self.info_mut(inner).num_occ -= 1;
        self.gate_mut(inner).inputs.clear();
        self.remove_gate(values, inner);
    }

    /// One flattening/singleton sweep. Returns the number of rewrites.
    fn normalize_gates(&mut self, values: &Valuation) -> usize {
        let mut changes = 0;
        for id in 1..=self.max_num() {
            if !matches!(self.try_node(id), Some(Node::Gate(_))) {
                continue;
            }
            let mut pos = 0;
            while pos < self.gate(id).inputs.len() {
                let input = self.gate(id).inputs[pos];
                let inner = match self.is_gate(input) {
                    Some(gate) if !gate.inputs.is_empty() => gate,
                    _ => {
                        pos += 1;
                        continue;
                    }
                };
                if inner.inputs.len() == 1 {
                    self.remove_singleton_gate(values, id, pos);
                    changes += 1;
                } else if inner.kind == self.gate(id).kind && inner.info.num_occ == 1 {
                    self.flatten_into(values, id, pos);
                    changes += 1;
                } else {
                    pos += 1;
                }
            }
        }
        changes
    }

    fn update_polarity(&mut self, var_id: NodeId, occurrence: Lit) {
        debug_assert!(occurrence != 0);
        let var = self.var_mut(var_id);
        var.polarity = match (var.polarity, occurrence > 0) {
            (Polarity::Undefined, true) => Polarity::Pos,
            (Polarity::Undefined, false) => Polarity::Neg,
            (Polarity::Neg, true) | (Polarity::Pos, false) => Polarity::Both,
            (polarity, _) => polarity,
        };
    }

    /// Computes each variable's polarity summary and fixes single-polarity
    /// variables: an existential keeps its satisfying value, a universal
    /// the falsifying one.
    fn compute_polarities(&mut self, values: &mut Valuation) {
        for id in 1..=self.max_num() {
            match self.try_node(id) {
                Some(Node::Gate(gate)) => {
                    let inputs = gate.inputs.clone();
                    for input in inputs {
                        if self.is_var(input).is_some() {
                            self.update_polarity(var_of(input), input);
                        }
                    }
                }
                Some(Node::Scope(node)) => {
                    let sub = node.sub;
                    if self.is_var(sub).is_some() {
                        self.update_polarity(var_of(sub), sub);
                    }
                }
                _ => {}
            }
        }

        for index in 0..self.vars.len() {
            let node = self.vars[index].node;
            if node == 0 {
                continue;
            }
            let var = self.var(node);
            let mut value = match var.polarity {
                Polarity::Neg => -1,
                Polarity::Pos => 1,
                _ => 0,
            };
            if value != 0 {
                debug!(
                    "variable {} appears only {}",
                    self.vars[index].orig_id,
                    if value > 0 { "positively" } else { "negatively" }
                );
            }
            if self.scope(var.scope).quant == Quantifier::Forall {
                value = -value;
            }
            if value != 0 {
                values.set(node, value);
            } else {
                // Reset so a later pass starts fresh.
                self.var_mut(node).polarity = Polarity::Undefined;
            }
        }
    }

    /// Variables appearing directly under the output gate are forced: the
    /// existential player satisfies the literal, the universal player
    /// falsifies it.
    fn force_root_literals(&mut self, values: &mut Valuation) {
        let root_inputs = match self.is_gate(self.output()) {
            Some(root) => root.inputs.clone(),
            None => return,
        };
        for lit in root_inputs {
            if let Some(var) = self.is_var(lit) {
                let value = if self.scope(var.scope).quant == Quantifier::Forall {
                    if lit > 0 {
                        -1
                    } else {
                        1
                    }
                } else if lit > 0 {
                    1
                } else {
                    -1
                };
                values.set(var_of(lit), value);
            }
        }
    }

    /// Evaluates the circuit and removes every node whose value is
    /// determined, freeing orphaned subtrees. Returns whether anything
    /// changed.
    fn propagate(&mut self, values: &mut Valuation) -> bool {
        let mut num_propagations = 0;
        self.evaluate(values);

        for id in 1..=self.max_num() {
            if self.try_node(id).is_none() || values.value(id) == 0 {
                continue;
            }
            if id != var_of(self.output()) {
                num_propagations += 1;
            }
            match self.node(id) {
                Node::Var(_) => self.remove_var(values, id),
                Node::Scope(_) => self.remove_scope_node(values, id),
                Node::Gate(_) => self.remove_gate(values, id),
            }
        }

        num_propagations += self.remove_orphans();

        info!("{} propagations", num_propagations);
        num_propagations > 0
    }

    /// Applies all rewriting rules to a fixed point, reencoding after each
    /// pass. Satisfiability is preserved.
    pub fn preprocess(&mut self) -> Result<()> {
        assert!(
            self.phase() == Phase::Encoded,
            "circuit must be encoded before preprocessing"
        );
        self.set_phase(Phase::Propagation);

        loop {
            let mut changed = false;
            let mut values = Valuation::for_circuit(self);

            changed |= self.normalize_gates(&values) > 0;
            debug_assert!(check::check(self));
            self.remove_empty_scopes_from(&values, TOP_LEVEL);
            self.compute_polarities(&mut values);
            self.force_root_literals(&mut values);

            changed |= self.propagate(&mut values);
            debug_assert!(check::check(self));
            debug_assert!(check::check_values(self, &values));

            self.reencode()?;
            if !changed {
                return Ok(());
            }
        }
    }
}
