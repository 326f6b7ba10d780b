//! Certificate synthesis: Skolem and Herbrand functions are accumulated
//! incrementally while solving, one And-Inverter-Graph per player.
//!
//! During abstraction encoding, every interface literal of the CNF gets a
//! twin definition in the strategy networks; during each assignment
//! minimization, the current entry becomes the precondition of a new
//! function case for the scope's variables.

pub mod aig;

use std::io::{self, Write};

use hashbrown::HashMap;
use quantor_util::IntQueue;

use crate::certify::aig::{
    aig_not, aig_strip, encode_and_as, encode_or_as, Aig, AIG_FALSE, AIG_TRUE,
};
use crate::circuit::{Circuit, Node, Valuation, TOP_LEVEL};
use crate::literal::{var_of, GateKind, Lit, NodeId, QbfResult, Quantifier, ScopeRef, NO_NODE};

pub struct Certification {
    skolem: Aig,
    herbrand: Aig,
    next_var_skolem: u32,
    next_var_herbrand: u32,
    queue: IntQueue,
    /// Circuit id count at certification start; b-literal translations are
    /// offset per scope by this stride.
    max_num: u32,
    /// Current strategy literal per variable id.
    function_lit: HashMap<NodeId, u32>,
    /// Disjunction of all preconditions seen so far per variable id.
    precondition_lit: HashMap<NodeId, u32>,
}

fn lit_to_aig(lit: Lit) -> u32 {
    let aig_lit = var_of(lit) * 2;
    if lit < 0 {
        aig_not(aig_lit)
    } else {
        aig_lit
    }
}

impl Certification {
    pub fn new(circuit: &Circuit) -> Self {
        let first_free = (circuit.max_scope_id() + 1) * circuit.max_num();
        Self {
            skolem: Aig::new(),
            herbrand: Aig::new(),
            next_var_skolem: first_free,
            next_var_herbrand: first_free,
            queue: IntQueue::new(),
            max_num: circuit.max_num(),
            function_lit: HashMap::new(),
            precondition_lit: HashMap::new(),
        }
    }

    fn aig_mut(&mut self, quant: Quantifier) -> (&mut Aig, &mut u32) {
        match quant {
            Quantifier::Exists => (&mut self.skolem, &mut self.next_var_skolem),
            Quantifier::Forall => (&mut self.herbrand, &mut self.next_var_herbrand),
        }
    }

    fn import_scope(&mut self, circuit: &Circuit, scope: ScopeRef) {
        let s = circuit.scope(scope);
        for &var in &s.vars {
            let label = circuit.info(var).orig_id.to_string();
            match s.quant {
                Quantifier::Exists => {
                    self.skolem.add_output(var * 2, &label);
                    self.herbrand.add_input(var * 2, &label);
                }
                Quantifier::Forall => {
                    self.herbrand.add_output(var * 2, &label);
                    self.skolem.add_input(var * 2, &label);
                }
            }
            self.function_lit.insert(var, AIG_FALSE);
            self.precondition_lit.insert(var, AIG_FALSE);
        }
        for &child in &s.children {
            self.import_scope(circuit, child);
        }
    }

    /// Registers every live variable as input/output of the two networks
    /// and emits constant outputs for variables removed by preprocessing.
    pub fn import_variables(&mut self, circuit: &Circuit) {
        self.import_scope(circuit, TOP_LEVEL);

        for entry in &circuit.vars {
            if entry.node != NO_NODE || entry.superseded {
                continue;
            }
            let value = if entry.value > 0 { AIG_TRUE } else { AIG_FALSE };
            let label = entry.orig_id.to_string();
            match entry.quant {
                Quantifier::Exists => self.skolem.add_output(value, &label),
                Quantifier::Forall => self.herbrand.add_output(value, &label),
            }
        }
    }

    /// Translated AIG literal of a gate's b-literal in the block of the
    /// given scope. OR-normalized gates are represented negated, matching
    /// the conjunction-only definitions.
    fn translate_b_literal(
        &self,
        circuit: &Circuit,
        scope_id: u32,
        quant: Quantifier,
        node_id: NodeId,
    ) -> u32 {
        let offset = (scope_id - 1) * self.max_num;
        let aig_lit = (offset + node_id) * 2;
        match circuit.node(node_id) {
            Node::Gate(gate) => {
                if gate.kind.normalize(quant) == GateKind::Or {
                    aig_not(aig_lit)
                } else {
                    aig_lit
                }
            }
            _ => aig_lit,
        }
    }

    /// Queues a literal of the current scope's CNF clause.
    pub(crate) fn add_literal(&mut self, lit: Lit) {
        self.queue.push(lit_to_aig(lit));
    }

    /// Queues the b-literal of `node_id` in this scope's block.
    pub(crate) fn add_b_literal(
        &mut self,
        circuit: &Circuit,
        scope_id: u32,
        quant: Quantifier,
        node_id: NodeId,
    ) {
        let translated = self.translate_b_literal(circuit, scope_id, quant, node_id);
        self.queue.push(translated);
    }

    /// Queues the b-literal of `node_id` in the block of the nearest outer
    /// scope owning it. A t-literal with no owning outer scope contributes
    /// nothing.
    pub(crate) fn add_t_literal(
        &mut self,
        circuit: &Circuit,
        owner_scope_id: Option<u32>,
        quant: Quantifier,
        node_id: NodeId,
    ) {
        if let Some(scope_id) = owner_scope_id {
            let translated = self.translate_b_literal(circuit, scope_id, quant, node_id);
            self.queue.push(translated);
        }
    }

    /// Defines the queued literals as the gate's b-literal in the given
    /// scope block: a conjunction for AND-normalized gates, a disjunction
    /// otherwise.
    pub(crate) fn define_b_literal(
        &mut self,
        circuit: &Circuit,
        scope_id: u32,
        quant: Quantifier,
        node_id: NodeId,
    ) {
        let translated = self.translate_b_literal(circuit, scope_id, quant, node_id);
        let kind = match circuit.node(node_id) {
            Node::Gate(gate) => gate.kind.normalize(quant),
            _ => GateKind::And,
        };
        let mut queue = std::mem::take(&mut self.queue);
        let (base, next_var) = self.aig_mut(quant);
        match kind {
            GateKind::Or => encode_or_as(base, next_var, &mut queue, aig_strip(translated)),
            GateKind::And => encode_and_as(base, next_var, &mut queue, translated),
        }
        self.queue = queue;
    }

    fn define_and(&mut self, quant: Quantifier) -> u32 {
        let mut queue = std::mem::take(&mut self.queue);
        let (base, next_var) = self.aig_mut(quant);
        let result = aig::encode_and(base, next_var, &mut queue);
        self.queue = queue;
        result
    }

    pub(crate) fn queue_is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Extends the strategy of each variable assigned true in the current
    /// minimized assignment: the queued entry literals form the
    /// precondition of the new case.
    pub(crate) fn append_function_case(
        &mut self,
        circuit: &Circuit,
        values: &Valuation,
        scope: ScopeRef,
        quant: Quantifier,
    ) {
        let current_precondition = self.define_and(quant);
        let vars = circuit.scope(scope).vars.clone();
        for var in vars {
            let negated = values.value(var) <= 0;
            let function_lit = self.function_lit[&var];
            let last_precondition = self.precondition_lit[&var];

            if !negated {
                // !last_precondition && current_precondition => var
                debug_assert!(self.queue_is_empty());
                self.queue.push(aig_not(last_precondition));
                self.queue.push(current_precondition);
                let function_case = self.define_and(quant);

                // function_lit |= function_case
                debug_assert!(self.queue_is_empty());
                self.queue.push(aig_not(function_lit));
                self.queue.push(aig_not(function_case));
                let new_function_lit = aig_not(self.define_and(quant));
                self.function_lit.insert(var, new_function_lit);
            }

            // last_precondition |= current_precondition
            debug_assert!(self.queue_is_empty());
            self.queue.push(aig_not(last_precondition));
            self.queue.push(aig_not(current_precondition));
            let new_precondition = aig_not(self.define_and(quant));
            self.precondition_lit.insert(var, new_precondition);
        }
    }

    /// Wires the accumulated function literals of the winning player's
    /// variables to the network outputs.
    pub fn define_outputs(&mut self, circuit: &Circuit, result: QbfResult) {
        self.define_outputs_recursive(circuit, TOP_LEVEL, result);
    }

    fn define_outputs_recursive(
        &mut self,
        circuit: &Circuit,
        scope: ScopeRef,
        result: QbfResult,
    ) {
        let s = circuit.scope(scope);
        let winning = (s.quant == Quantifier::Exists && result == QbfResult::Sat)
            || (s.quant == Quantifier::Forall && result == QbfResult::Unsat);
        if winning {
            let vars = s.vars.clone();
            let quant = s.quant;
            for var in vars {
                let function_lit = self.function_lit[&var];
                let (strategy, _) = self.aig_mut(quant);
                // Defined as a gate so the output stays evaluatable even
                // when the function literal is constant.
                strategy.add_and(var * 2, function_lit, AIG_TRUE);
            }
        }
        let children = circuit.scope(scope).children.clone();
        for child in children {
            self.define_outputs_recursive(circuit, child, result);
        }
    }

    /// The winning player's network.
    pub fn strategy(&self, result: QbfResult) -> &Aig {
        match result {
            QbfResult::Unsat => &self.herbrand,
            _ => &self.skolem,
        }
    }

    /// Writes the winning strategy in ASCII AIGER format. The last output,
    /// labeled `result`, is constant true for SAT and false for UNSAT.
    pub fn write<W: Write>(&self, result: QbfResult, writer: &mut W) -> io::Result<()> {
        let mut strategy = self.strategy(result).clone();
        let (value, comment) = match result {
            QbfResult::Unsat => (AIG_FALSE, "UNSAT"),
            _ => (AIG_TRUE, "SAT"),
        };
        strategy.add_output(value, "result");
        strategy.add_comment(comment);
        strategy.write_ascii(writer)
    }
}
