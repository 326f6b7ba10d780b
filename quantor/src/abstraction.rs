//! The per-scope propositional abstraction: a CNF view of the circuit in
//! which unresolved subformulas are replaced by interface literals, plus
//! the dual view used for assignment minimization.
//!
//! Every circuit node `v` owns two SAT variables: `v` itself (whose
//! negative phase is the *b-literal*, reporting that inner scopes must
//! satisfy the node) and `v + max_num` (the *t-literal*, conveying outer
//! decisions inward as assumptions).

use anyhow::{ensure, Result};
use log::debug;
use quantor_util::BitSet;

use crate::certify::Certification;
use crate::circuit::{Circuit, Node, NodeInfo, Scope, Valuation};
use crate::literal::{
    lit_with_sign_of, var_of, GateKind, Lit, NodeId, QbfResult, Quantifier, ScopeRef, NO_NODE,
};
use crate::sat::{SatResult, SatSolver, VarisatBackend};
use crate::solver::SolverOptions;
use crate::stats::Stats;

pub(crate) fn insert_sorted(vec: &mut Vec<u32>, value: u32) {
    if let Err(pos) = vec.binary_search(&value) {
        vec.insert(pos, value);
    }
}

pub(crate) fn contains_sorted(vec: &[u32], value: u32) -> bool {
    vec.binary_search(&value).is_ok()
}

pub(crate) fn t_lit_of(circuit: &Circuit, node: NodeId) -> u32 {
    node + circuit.max_num()
}

pub(crate) fn b_lit_of(node: NodeId) -> u32 {
    node
}

pub(crate) fn t_lit_to_node(circuit: &Circuit, t_lit: u32) -> NodeId {
    debug_assert!(t_lit > circuit.max_num());
    t_lit - circuit.max_num()
}

fn influence_min(info: &NodeInfo) -> u32 {
    info.influences.min().map_or(u32::MAX, |min| min as u32)
}

fn influence_max(info: &NodeInfo) -> u32 {
    info.influences.max().map_or(u32::MAX, |max| max as u32)
}

/// Projects the maximal scope depth of a node into the current analysis
/// frame: depths below this scope's subtree are cut off at `max_depth`.
fn current_max(info: &NodeInfo, scope: &Scope) -> u32 {
    let max = influence_max(info);
    if scope.max_depth != 0 && scope.max_depth < max {
        scope.max_depth
    } else {
        max
    }
}

pub struct ScopeAbstraction {
    pub(crate) scope: ScopeRef,
    pub(crate) scope_id: u32,
    pub(crate) depth: u32,
    pub(crate) quant: Quantifier,
    /// Id of the anchoring quantifier node, or [`NO_NODE`] for prefix
    /// scopes.
    pub(crate) scope_node: NodeId,
    pub(crate) result: QbfResult,
    pub(crate) children: Vec<ScopeAbstraction>,

    sat: VarisatBackend,
    /// The dual abstraction over the same variables.
    negation: VarisatBackend,

    pub(crate) t_lits: Vec<u32>,
    pub(crate) b_lits: Vec<u32>,
    /// B-literals the last model disabled, in ascending order.
    pub(crate) assumptions: Vec<u32>,
    /// T-literals the parent currently asserts.
    pub(crate) entry: BitSet,
    pub(crate) local_unsat_core: Vec<u32>,
    /// Negative-phase assumptions passed to the last SAT call.
    sat_solver_assumptions: Vec<Lit>,

    pub(crate) stats: Stats,

    /// For certification: scope ids of the outer abstractions together with
    /// their b-literal sets, outermost first.
    outer_b_lits: Vec<(u32, Vec<u32>)>,
}

impl ScopeAbstraction {
    pub(crate) fn new(
        circuit: &Circuit,
        options: &SolverOptions,
        cert: &mut Option<&mut Certification>,
        scope_ref: ScopeRef,
        outer: &[(u32, Vec<u32>)],
    ) -> Self {
        let scope = circuit.scope(scope_ref);
        let max_num = circuit.max_num();
        let mut abstraction = Self {
            scope: scope_ref,
            scope_id: scope.scope_id,
            depth: scope.depth,
            quant: scope.quant,
            scope_node: scope.node,
            result: QbfResult::Unknown,
            children: Vec::new(),
            sat: VarisatBackend::new(),
            negation: VarisatBackend::new(),
            t_lits: Vec::new(),
            b_lits: Vec::new(),
            assumptions: Vec::new(),
            entry: BitSet::new(2 * max_num as usize + 2),
            local_unsat_core: Vec::new(),
            sat_solver_assumptions: Vec::new(),
            stats: Stats::new(10_000.0),
            outer_b_lits: if options.certify {
                outer.to_vec()
            } else {
                Vec::new()
            },
        };

        for _ in 0..2 * max_num {
            abstraction.sat.new_var();
            abstraction.negation.new_var();
        }

        debug!("abstraction for level {}", abstraction.scope_id);
        abstraction.build_instance(circuit, options, false, cert);
        abstraction.build_instance(circuit, options, true, cert);

        debug_assert!(abstraction.t_lits.windows(2).all(|w| w[0] < w[1]));
        debug_assert!(abstraction.b_lits.windows(2).all(|w| w[0] < w[1]));
        abstraction
    }

    fn sat_mut(&mut self, negate: bool) -> &mut VarisatBackend {
        if negate {
            &mut self.negation
        } else {
            &mut self.sat
        }
    }

    pub(crate) fn solve_sat(&mut self) -> Result<SatResult> {
        self.sat.solve()
    }

    pub(crate) fn sat_value(&self, lit: Lit) -> i32 {
        self.sat.value(lit)
    }

    pub(crate) fn add_refinement_literal(&mut self, lit: Lit) {
        self.sat.add(lit);
    }

    /// Scope id of the nearest outer abstraction owning this b-literal, for
    /// the certificate's t-literal translation.
    fn outer_owner(&self, b_lit: u32) -> Option<u32> {
        self.outer_b_lits
            .iter()
            .rev()
            .find(|(_, b_lits)| contains_sorted(b_lits, b_lit))
            .map(|&(scope_id, _)| scope_id)
    }

    /// Prefix scopes see every node; a quantifier-anchored scope only sees
    /// nodes of its own subformula or of the enclosing chain.
    fn node_is_relevant(&self, circuit: &Circuit, node: NodeId) -> bool {
        if self.scope_node == NO_NODE {
            return true;
        }
        let info = circuit.info(node);
        if info.relevant_for.contains(self.scope_id as usize) {
            return true;
        }
        let mut scope = circuit.scope(self.scope).parent;
        while let Some(outer) = scope {
            if info.relevant_for.max() == Some(circuit.scope(outer).scope_id as usize) {
                return true;
            }
            scope = circuit.scope(outer).parent;
        }
        false
    }

    /// Determines which interface literals this gate contributes. In
    /// combined mode, gates living entirely in outer scopes are represented
    /// by proxy t-literals of their frontier instead of their own.
    fn analyze_gate(&mut self, circuit: &Circuit, options: &SolverOptions, gate_id: NodeId) {
        let scope = circuit.scope(self.scope);
        let gate = circuit.gate(gate_id);
        let t_lit = t_lit_of(circuit, gate_id);
        let b_lit = b_lit_of(gate_id);

        let mut input_max_scope_current = false;
        let mut input_max_scope_outer = false;
        let mut variable_of_outer_scope = false;
        let mut variable_of_current_scope = false;
        let mut all_gates_max_scope_outer = true;
        let mut all_gates_max_scope_current = true;

        for &input in &gate.inputs {
            let input_var = var_of(input);
            if !self.node_is_relevant(circuit, input_var) {
                continue;
            }
            let input_info = circuit.info(input_var);
            let projected = current_max(input_info, scope);
            if projected == scope.depth {
                input_max_scope_current = true;
            } else if projected < scope.depth {
                input_max_scope_outer = true;
            }

            match circuit.node(input_var) {
                Node::Var(_) => {
                    if influence_max(input_info) < scope.depth {
                        variable_of_outer_scope = true;
                    } else if input_info.influences.contains(scope.depth as usize) {
                        variable_of_current_scope = true;
                    }
                }
                Node::Gate(_) => {
                    if projected >= scope.depth {
                        all_gates_max_scope_outer = false;
                    }
                    if projected > scope.depth {
                        all_gates_max_scope_current = false;
                    }
                }
                Node::Scope(_) => {
                    all_gates_max_scope_outer = false;
                    all_gates_max_scope_current = false;
                }
            }
        }

        if !options.use_combined_abstraction {
            if variable_of_current_scope && !scope.children.is_empty() {
                insert_sorted(&mut self.b_lits, b_lit);
            }
            if variable_of_outer_scope {
                insert_sorted(&mut self.t_lits, t_lit);
            }
            return;
        }

        let gate_projected = current_max(circuit.info(gate_id), scope);
        let gate_max_scope_current = gate_projected <= scope.depth;
        let variable_b_lit = variable_of_current_scope && !gate_max_scope_current;
        let combination_b_lit = input_max_scope_current && !gate_max_scope_current;

        let gate_max_scope_outer = gate_projected < scope.depth;
        let variable_t_lit = variable_of_outer_scope && !gate_max_scope_outer;
        let combination_t_lit = input_max_scope_outer && !gate_max_scope_outer;

        if variable_b_lit {
            debug_assert!(influence_max(circuit.info(gate_id)) > scope.depth);
            debug_assert!(!scope.children.is_empty());
            insert_sorted(&mut self.b_lits, b_lit);
        }
        if combination_b_lit {
            if !all_gates_max_scope_current {
                for &input in &gate.inputs {
                    let input_var = var_of(input);
                    if !matches!(circuit.node(input_var), Node::Gate(_)) {
                        continue;
                    }
                    if current_max(circuit.info(input_var), scope) != scope.depth {
                        continue;
                    }
                    insert_sorted(&mut self.b_lits, b_lit_of(input_var));
                }
            } else if !variable_b_lit {
                debug_assert!(influence_max(circuit.info(gate_id)) > scope.depth);
                debug_assert!(!scope.children.is_empty());
                insert_sorted(&mut self.b_lits, b_lit);
            }
        }

        if variable_t_lit {
            insert_sorted(&mut self.t_lits, t_lit);
        }
        if combination_t_lit {
            if !all_gates_max_scope_outer {
                for &input in &gate.inputs {
                    let input_var = var_of(input);
                    if !matches!(circuit.node(input_var), Node::Gate(_)) {
                        continue;
                    }
                    if current_max(circuit.info(input_var), scope) >= scope.depth {
                        continue;
                    }
                    insert_sorted(&mut self.t_lits, t_lit_of(circuit, input_var));
                }
            } else if !variable_t_lit {
                insert_sorted(&mut self.t_lits, t_lit);
            }
        }
    }

    /// Emits the single wide clause allowing an OR gate's b-literal.
    fn encode_or_gate(
        &mut self,
        circuit: &Circuit,
        options: &SolverOptions,
        negate: bool,
        gate_id: NodeId,
        cert: &mut Option<&mut Certification>,
    ) {
        let quant = if negate { self.quant.negate() } else { self.quant };
        let t_lit = t_lit_of(circuit, gate_id);
        let b_lit = b_lit_of(gate_id);
        let depth = self.depth;

        if circuit.gate(gate_id).keep {
            return;
        }

        let inputs = circuit.gate(gate_id).inputs.clone();
        for gate_input in inputs {
            let input_var = var_of(gate_input);
            if !self.node_is_relevant(circuit, input_var) {
                continue;
            }
            // Variable inputs are negated under a universal quantifier.
            let is_var = matches!(circuit.node(input_var), Node::Var(_));
            let transformed = if !is_var || quant == Quantifier::Exists {
                gate_input
            } else {
                -gate_input
            };
            let occ_info = circuit.info(input_var);
            if influence_min(occ_info) > depth {
                debug_assert!(influence_max(occ_info) > depth);
                continue;
            }

            match circuit.node(input_var) {
                Node::Var(_) => {
                    if occ_info.influences.contains(depth as usize) {
                        self.sat_mut(negate).add(transformed);
                        if options.certify {
                            if let Some(cert) = cert.as_deref_mut() {
                                cert.add_literal(transformed);
                            }
                        }
                    }
                }
                Node::Scope(_) => {
                    self.sat_mut(negate).add(-(b_lit_of(input_var) as Lit));
                }
                Node::Gate(other) => {
                    let other_b_lit = b_lit_of(input_var);
                    let other_t_lit = t_lit_of(circuit, input_var);
                    let scope = circuit.scope(self.scope);

                    if current_max(occ_info, scope) < depth {
                        if !options.use_combined_abstraction {
                            self.sat_mut(negate).add(other_b_lit as Lit);
                            if options.certify {
                                if let Some(cert) = cert.as_deref_mut() {
                                    debug_assert!(!contains_sorted(&self.b_lits, other_b_lit));
                                    cert.add_b_literal(circuit, self.scope_id, quant, input_var);
                                }
                            }
                        } else if contains_sorted(&self.t_lits, other_t_lit) {
                            self.sat_mut(negate).add(other_t_lit as Lit);
                            if options.certify {
                                let owner = self.outer_owner(other_b_lit);
                                if let Some(cert) = cert.as_deref_mut() {
                                    cert.add_t_literal(circuit, owner, quant, input_var);
                                }
                            }
                        }
                        continue;
                    }

                    if other.kind.normalize(quant) == GateKind::Or {
                        self.sat_mut(negate).add(other_b_lit as Lit);
                        if options.certify {
                            if let Some(cert) = cert.as_deref_mut() {
                                cert.add_b_literal(circuit, self.scope_id, quant, input_var);
                            }
                        }
                    }
                    if current_max(occ_info, circuit.scope(self.scope)) == depth {
                        // Chaining: the gate may also be satisfied here.
                        self.sat_mut(negate).add(other_b_lit as Lit);
                        if options.certify {
                            if let Some(cert) = cert.as_deref_mut() {
                                cert.add_b_literal(circuit, self.scope_id, quant, input_var);
                            }
                        }
                    }
                }
            }
        }

        if contains_sorted(&self.t_lits, t_lit) {
            self.sat_mut(negate).add(t_lit as Lit);
            if options.certify {
                let owner = self.outer_owner(b_lit);
                if let Some(cert) = cert.as_deref_mut() {
                    cert.add_t_literal(circuit, owner, quant, gate_id);
                }
            }
        }

        self.sat_mut(negate).add(-(b_lit as Lit));
        self.sat_mut(negate).add(0);

        if options.certify {
            if let Some(cert) = cert.as_deref_mut() {
                cert.define_b_literal(circuit, self.scope_id, quant, gate_id);
            }
        }
    }

    /// Inlines an OR gate's disjuncts into the currently open clause. The
    /// clause is intentionally left unterminated.
    fn append_or_gate(
        &mut self,
        circuit: &Circuit,
        options: &SolverOptions,
        negate: bool,
        gate_id: NodeId,
    ) {
        let quant = if negate { self.quant.negate() } else { self.quant };
        let t_lit = t_lit_of(circuit, gate_id);
        let b_lit = b_lit_of(gate_id);
        let depth = self.depth;

        debug_assert!(!circuit.gate(gate_id).keep);

        if influence_min(circuit.info(gate_id)) > depth {
            self.sat_mut(negate).add(-(b_lit as Lit));
            return;
        }

        let inputs = circuit.gate(gate_id).inputs.clone();
        for gate_input in inputs {
            let input_var = var_of(gate_input);
            if !self.node_is_relevant(circuit, input_var) {
                continue;
            }
            let is_var = matches!(circuit.node(input_var), Node::Var(_));
            let transformed = if !is_var || quant == Quantifier::Exists {
                gate_input
            } else {
                -gate_input
            };
            let occ_info = circuit.info(input_var);
            if influence_min(occ_info) > depth {
                self.sat_mut(negate).add(-(b_lit as Lit));
                continue;
            }

            match circuit.node(input_var) {
                Node::Var(_) => {
                    if occ_info.influences.contains(depth as usize) {
                        self.sat_mut(negate).add(transformed);
                    }
                }
                Node::Scope(_) => {
                    debug_assert!(transformed > 0);
                    self.sat_mut(negate).add(-(b_lit_of(input_var) as Lit));
                }
                Node::Gate(other) => {
                    let other_b_lit = b_lit_of(input_var);
                    let other_t_lit = t_lit_of(circuit, input_var);
                    let scope = circuit.scope(self.scope);

                    if current_max(occ_info, scope) < depth {
                        if !options.use_combined_abstraction {
                            self.sat_mut(negate).add(other_b_lit as Lit);
                        } else if contains_sorted(&self.t_lits, other_t_lit) {
                            self.sat_mut(negate).add(other_t_lit as Lit);
                        }
                        continue;
                    }

                    if current_max(occ_info, scope) == depth {
                        self.sat_mut(negate).add(other_b_lit as Lit);
                        continue;
                    }

                    if other.kind.normalize(quant) == GateKind::Or {
                        self.append_or_gate(circuit, options, negate, input_var);
                    } else {
                        self.sat_mut(negate).add(other_b_lit as Lit);
                    }
                }
            }
        }

        if contains_sorted(&self.t_lits, t_lit) {
            self.sat_mut(negate).add(t_lit as Lit);
        }

        if contains_sorted(&self.b_lits, b_lit) {
            debug_assert!(!circuit.scope(self.scope).children.is_empty());
            // The disjunction must be satisfied by this scope or an outer
            // one whenever the b-literal is raised.
            self.sat_mut(negate).add(-(b_lit as Lit));
        }
    }

    /// Emits one binary clause per relevant input of an AND gate.
    fn encode_and_gate(
        &mut self,
        circuit: &Circuit,
        options: &SolverOptions,
        negate: bool,
        gate_id: NodeId,
        cert: &mut Option<&mut Certification>,
    ) {
        let quant = if negate { self.quant.negate() } else { self.quant };
        let t_lit = t_lit_of(circuit, gate_id);
        let b_lit = b_lit_of(gate_id);
        let depth = self.depth;

        let inputs = circuit.gate(gate_id).inputs.clone();
        for gate_input in inputs {
            let input_var = var_of(gate_input);
            if !self.node_is_relevant(circuit, input_var) {
                continue;
            }
            let is_var = matches!(circuit.node(input_var), Node::Var(_));
            let transformed = if !is_var || quant == Quantifier::Exists {
                gate_input
            } else {
                -gate_input
            };
            let occ_info = circuit.info(input_var);
            if influence_min(occ_info) > depth {
                debug_assert!(influence_max(occ_info) > depth);
                continue;
            }

            match circuit.node(input_var) {
                Node::Var(_) => {
                    if occ_info.influences.contains(depth as usize) {
                        self.sat_mut(negate).add(transformed);
                        self.sat_mut(negate).add(-(b_lit as Lit));
                        self.sat_mut(negate).add(0);
                        if options.certify {
                            if let Some(cert) = cert.as_deref_mut() {
                                cert.add_literal(transformed);
                            }
                        }
                    }
                }
                Node::Scope(_) => {
                    debug_assert!(transformed > 0);
                    self.sat_mut(negate).add(-(b_lit_of(input_var) as Lit));
                    self.sat_mut(negate).add(-(b_lit as Lit));
                    self.sat_mut(negate).add(0);
                }
                Node::Gate(other) => {
                    let other_b_lit = b_lit_of(input_var);
                    let other_t_lit = t_lit_of(circuit, input_var);
                    let scope = circuit.scope(self.scope);

                    if current_max(occ_info, scope) < depth {
                        if !options.use_combined_abstraction {
                            self.sat_mut(negate).add(other_b_lit as Lit);
                            self.sat_mut(negate).add(-(b_lit as Lit));
                            self.sat_mut(negate).add(0);
                            if options.certify {
                                if let Some(cert) = cert.as_deref_mut() {
                                    debug_assert!(!contains_sorted(&self.b_lits, other_b_lit));
                                    cert.add_b_literal(circuit, self.scope_id, quant, input_var);
                                }
                            }
                        } else if contains_sorted(&self.t_lits, other_t_lit) {
                            self.sat_mut(negate).add(other_t_lit as Lit);
                            self.sat_mut(negate).add(-(b_lit as Lit));
                            self.sat_mut(negate).add(0);
                            if options.certify {
                                let owner = self.outer_owner(other_b_lit);
                                if let Some(cert) = cert.as_deref_mut() {
                                    cert.add_t_literal(circuit, owner, quant, input_var);
                                }
                            }
                        }
                        continue;
                    }

                    if other.kind.normalize(quant) == GateKind::And {
                        self.sat_mut(negate).add(other_b_lit as Lit);
                        self.sat_mut(negate).add(-(b_lit as Lit));
                        self.sat_mut(negate).add(0);
                        if options.certify {
                            if let Some(cert) = cert.as_deref_mut() {
                                cert.add_b_literal(circuit, self.scope_id, quant, input_var);
                            }
                        }
                    } else {
                        if current_max(occ_info, circuit.scope(self.scope)) == depth {
                            self.sat_mut(negate).add(other_b_lit as Lit);
                            if options.certify {
                                if let Some(cert) = cert.as_deref_mut() {
                                    cert.add_b_literal(circuit, self.scope_id, quant, input_var);
                                }
                            }
                        } else {
                            self.append_or_gate(circuit, options, negate, input_var);
                        }
                        self.sat_mut(negate).add(-(b_lit as Lit));
                        self.sat_mut(negate).add(0);
                    }
                }
            }
        }

        if contains_sorted(&self.t_lits, t_lit) {
            self.sat_mut(negate).add(t_lit as Lit);
            self.sat_mut(negate).add(-(b_lit as Lit));
            self.sat_mut(negate).add(0);
            if options.certify {
                let owner = self.outer_owner(b_lit);
                if let Some(cert) = cert.as_deref_mut() {
                    cert.add_t_literal(circuit, owner, quant, gate_id);
                }
            }
        }

        if options.certify {
            if let Some(cert) = cert.as_deref_mut() {
                cert.define_b_literal(circuit, self.scope_id, quant, gate_id);
            }
        }
    }

    fn encode_gate(
        &mut self,
        circuit: &Circuit,
        options: &SolverOptions,
        negate: bool,
        gate_id: NodeId,
        cert: &mut Option<&mut Certification>,
    ) {
        let quant = if negate { self.quant.negate() } else { self.quant };
        let scope = circuit.scope(self.scope);

        if influence_min(circuit.info(gate_id)) > scope.depth {
            return;
        }
        if options.use_combined_abstraction
            && current_max(circuit.info(gate_id), scope) < scope.depth
        {
            return;
        }

        match circuit.gate(gate_id).kind.normalize(quant) {
            GateKind::And => self.encode_and_gate(circuit, options, negate, gate_id, cert),
            GateKind::Or => self.encode_or_gate(circuit, options, negate, gate_id, cert),
        }
    }

    /// Interface clauses for an embedded quantifier node: its own scope
    /// registers the t-literal, the parent scope the b-literal.
    fn encode_node_scope(
        &mut self,
        circuit: &Circuit,
        options: &SolverOptions,
        negate: bool,
        node_id: NodeId,
    ) {
        let quant = if negate { self.quant.negate() } else { self.quant };
        let node = circuit.scope_node(node_id);
        let t_lit = t_lit_of(circuit, node_id);
        let b_lit = b_lit_of(node_id);

        if node.scope == self.scope {
            if !negate {
                insert_sorted(&mut self.t_lits, t_lit);
            }
        } else if circuit.scope(node.scope).parent == Some(self.scope) && !negate {
            insert_sorted(&mut self.b_lits, b_lit);
        }

        let sub_var = var_of(node.sub);
        debug_assert!(!matches!(circuit.node(sub_var), Node::Var(_)));

        match circuit.node(sub_var) {
            Node::Scope(_) => {
                self.sat_mut(negate).add(b_lit as Lit);
                self.sat_mut(negate).add(-(b_lit_of(sub_var) as Lit));
                self.sat_mut(negate).add(0);
            }
            Node::Gate(other) => {
                if other.kind.normalize(quant) == GateKind::And {
                    self.sat_mut(negate).add(b_lit_of(sub_var) as Lit);
                    self.sat_mut(negate).add(b_lit as Lit);
                    self.sat_mut(negate).add(0);
                } else {
                    self.append_or_gate(circuit, options, negate, sub_var);
                    self.sat_mut(negate).add(b_lit as Lit);
                    self.sat_mut(negate).add(0);
                }
            }
            Node::Var(_) => unreachable!(),
        }
    }

    /// Forces the circuit output in this abstraction: the b-literal of an
    /// AND output, or the output's appended disjuncts.
    fn fix_output(
        &mut self,
        circuit: &Circuit,
        options: &SolverOptions,
        negate: bool,
        cert: &mut Option<&mut Certification>,
    ) {
        let quant = if negate { self.quant.negate() } else { self.quant };
        let output = circuit.output();
        debug_assert!(output > 0);
        let output_var = var_of(output);

        match circuit.gate(output_var).kind.normalize(quant) {
            GateKind::And => {
                self.sat_mut(negate).add(b_lit_of(output_var) as Lit);
            }
            GateKind::Or => {
                if let Some(cert) = cert.as_deref_mut() {
                    debug_assert!(cert.queue_is_empty());
                }
                self.append_or_gate(circuit, options, negate, output_var);
                if let Some(cert) = cert.as_deref_mut() {
                    debug_assert!(cert.queue_is_empty());
                }
            }
        }
        self.sat_mut(negate).add(0);
    }

    fn build_instance(
        &mut self,
        circuit: &Circuit,
        options: &SolverOptions,
        negate: bool,
        cert: &mut Option<&mut Certification>,
    ) {
        // Preprocessing guarantees no empty scope except a variable-free
        // top level.
        debug_assert!(
            !circuit.scope(self.scope).vars.is_empty() || self.scope_id == 1
        );

        if !negate {
            for id in 1..=circuit.max_num() {
                if !self.node_is_relevant(circuit, id) {
                    continue;
                }
                if matches!(circuit.node(id), Node::Gate(_)) {
                    self.analyze_gate(circuit, options, id);
                }
            }
        }

        for id in 1..=circuit.max_num() {
            if !self.node_is_relevant(circuit, id) {
                continue;
            }
            match circuit.node(id) {
                Node::Scope(_) => self.encode_node_scope(circuit, options, negate, id),
                Node::Gate(_) => self.encode_gate(circuit, options, negate, id, cert),
                Node::Var(_) => {}
            }
        }

        self.fix_output(circuit, options, negate, cert);
    }

    /// Sets the t-literal assumptions for the next SAT call: positive for
    /// entry literals, negative otherwise (flipped for the dual solver).
    pub(crate) fn assume_t_literals(&mut self, negation: bool) {
        self.sat_solver_assumptions.clear();
        for i in 0..self.t_lits.len() {
            let t_lit = self.t_lits[i];
            let mut lit = t_lit as Lit;
            if !self.entry.contains(t_lit as usize) {
                lit = -lit;
            }
            if negation {
                lit = -lit;
            }
            self.sat_mut(negation).assume(lit);
            if lit < 0 {
                self.sat_solver_assumptions.push(lit);
            }
        }
    }

    /// Reads the b-literals the model disabled and distributes the
    /// corresponding t-literals into the children's entries.
    pub(crate) fn derive_assumptions(
        &mut self,
        circuit: &Circuit,
        values: &Valuation,
        options: &SolverOptions,
    ) {
        self.assumptions.clear();
        for child in self.children.iter_mut() {
            child.entry.clear();
        }

        for i in 0..self.b_lits.len() {
            let b_lit = self.b_lits[i];
            if self.sat.value(b_lit as Lit) >= 0 {
                continue;
            }
            // This b-literal was disabled by the SAT solver.

            if options.assignment_b_lit_minimization {
                let node_id = b_lit;
                let circuit_value = values.value(node_id);
                let normalized_value = if self.quant == Quantifier::Forall {
                    -circuit_value
                } else {
                    circuit_value
                };
                if let Node::Gate(gate) = circuit.node(node_id) {
                    let kind = gate.kind.normalize(self.quant);
                    if circuit_value == 0 && kind == GateKind::And {
                        continue;
                    }
                    if normalized_value > 0 {
                        // Already satisfied by the current assignment.
                        continue;
                    }
                }
            }

            debug!("disabled b{}", b_lit);
            self.assumptions.push(b_lit);

            let t_lit = b_lit + circuit.max_num();
            let mut num_added = 0;
            for child in self.children.iter_mut() {
                if contains_sorted(&child.t_lits, t_lit) {
                    child.entry.insert(t_lit as usize);
                    num_added += 1;
                }
            }
            debug_assert!(num_added > 0);
        }

        for i in 0..self.t_lits.len() {
            let t_lit = self.t_lits[i];
            if self.entry.contains(t_lit as usize) {
                continue;
            }
            let b_lit = t_lit - circuit.max_num();
            if !contains_sorted(&self.b_lits, b_lit) {
                for child in self.children.iter_mut() {
                    if contains_sorted(&child.t_lits, t_lit) {
                        child.entry.insert(t_lit as usize);
                    }
                }
            }
        }
    }

    /// Assignment minimization: the dual solver, constrained to the current
    /// assignment and the negated entry, must be unsatisfiable; its failed
    /// assumptions form the minimal entry reported upward.
    pub(crate) fn dual_propagation(
        &mut self,
        circuit: &Circuit,
        values: &Valuation,
        options: &SolverOptions,
        cert: &mut Option<&mut Certification>,
    ) -> Result<()> {
        let scope_vars = circuit.scope(self.scope).vars.clone();
        for var in scope_vars {
            let value = self.sat.value(var as Lit);
            if value != 0 {
                self.negation.assume(lit_with_sign_of(var, value));
            }
        }
        self.assume_t_literals(true);

        if !self.children.is_empty() {
            // The last UNSAT core becomes a blocking clause of the dual.
            for i in 0..self.local_unsat_core.len() {
                let failed_t_lit = self.local_unsat_core[i];
                let b_lit = failed_t_lit - circuit.max_num();
                if !contains_sorted(&self.b_lits, b_lit) {
                    self.negation.add(failed_t_lit as Lit);
                } else {
                    self.negation.add(b_lit as Lit);
                }
            }
            self.negation.add(0);
        }

        let result = self.negation.solve()?;
        ensure!(
            result == SatResult::Unsat,
            "SAT backend protocol violation: dual abstraction of level {} was satisfiable",
            self.scope_id
        );

        self.entry.clear();
        for i in 0..self.sat_solver_assumptions.len() {
            let failed = self.sat_solver_assumptions[i];
            debug_assert!(failed < 0);
            if !self.negation.failed(failed) {
                continue;
            }
            let t_lit = (-failed) as u32;
            self.entry.insert(t_lit as usize);
            debug!("minimized entry t{}", t_lit_to_node(circuit, t_lit));

            if options.certify {
                let node = t_lit_to_node(circuit, t_lit);
                let owner = self.outer_owner(b_lit_of(node));
                if let Some(cert) = cert.as_deref_mut() {
                    cert.add_t_literal(circuit, owner, self.quant, node);
                }
            }
        }

        if options.certify {
            if let Some(cert) = cert.as_deref_mut() {
                cert.append_function_case(circuit, values, self.scope, self.quant);
            }
        }
        Ok(())
    }

    /// After a local UNSAT result, the failed assumptions shrink the entry.
    pub(crate) fn collect_unsat_core(&mut self) {
        self.entry.clear();
        for i in 0..self.sat_solver_assumptions.len() {
            let failed = self.sat_solver_assumptions[i];
            debug_assert!(failed < 0);
            if self.sat.failed(failed) {
                self.entry.insert((-failed) as usize);
            }
        }
    }

    /// A child that returned its good result contributes its entry to this
    /// scope's local UNSAT core.
    pub(crate) fn absorb_child_core(&mut self, child_index: usize) {
        let child_entry: Vec<usize> = self.children[child_index].entry.iter().collect();
        for t_lit in child_entry {
            self.local_unsat_core.push(t_lit as u32);
        }
    }
}
