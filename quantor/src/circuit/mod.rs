//! The circuit store: a topologically indexed DAG of variables, gates and
//! embedded quantifier scopes.
//!
//! Nodes live in a dense arena indexed by their id; edges are signed literals,
//! never owning pointers. The quantifier structure is a tree of [`Scope`]s
//! held in a second arena, with the prefix chain linked through the first
//! child of each scope.

pub mod check;
pub mod influence;
pub mod miniscope;
pub mod preprocess;
pub mod reencode;

use log::debug;
use quantor_util::BitSet;

use crate::literal::{var_of, GateKind, Lit, NodeId, Quantifier, ScopeRef, NO_NODE};

/// Value used by [`Circuit::evaluate`] to disable the level cap.
pub(crate) const EVALUATION_NO_MAX: i32 = -1;

/// Attributes shared by all node variants.
#[derive(Clone, Debug)]
pub struct NodeInfo {
    pub id: NodeId,
    /// Id the node carried when it was created; kept for certification.
    /// Negative for de-Morgan twins created during NNF conversion.
    pub orig_id: Lit,
    /// Number of parents referring to this node.
    pub num_occ: usize,
    /// Variable indices (or scope depths, depending on the last analysis)
    /// this node depends on.
    pub influences: BitSet,
    /// Scope ids in whose subformula this node occurs.
    pub relevant_for: BitSet,
    pub(crate) dfs_processed: bool,
}

impl NodeInfo {
    fn new(id: NodeId) -> Self {
        Self {
            id,
            orig_id: id as Lit,
            num_occ: 0,
            influences: BitSet::default(),
            relevant_for: BitSet::default(),
            dfs_processed: false,
        }
    }
}

/// Polarity summary of a variable, computed by the preprocessor.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Polarity {
    #[default]
    Undefined,
    Pos,
    Neg,
    Both,
}

#[derive(Clone, Debug)]
pub struct Var {
    pub info: NodeInfo,
    /// Dense index into [`Circuit::vars`], stable across reencoding.
    pub var_index: u32,
    pub scope: ScopeRef,
    pub polarity: Polarity,
    pub orig_quant: Quantifier,
}

#[derive(Clone, Debug)]
pub struct Gate {
    pub info: NodeInfo,
    pub kind: GateKind,
    pub inputs: Vec<Lit>,
    /// The gate contains some literal and its negation.
    pub conflict: bool,
    /// Survives preprocessing unconditionally.
    pub keep: bool,
    pub reachable: bool,
    /// Id of the de-Morgan twin, or [`NO_NODE`].
    pub negation: NodeId,
    /// Copy-on-write owner during miniscoping.
    pub owner: NodeId,
}

impl Gate {
    fn remove_input_at(&mut self, pos: usize) {
        self.inputs.remove(pos);
    }

    fn remove_input(&mut self, input: Lit) {
        let before = self.inputs.len();
        self.inputs.retain(|&lit| lit != input);
        debug_assert_eq!(self.inputs.len(), before - 1);
    }
}

/// A non-prenex quantifier embedded in the circuit, wrapping a single
/// sub-literal.
#[derive(Clone, Debug)]
pub struct ScopeNode {
    pub info: NodeInfo,
    pub scope: ScopeRef,
    pub sub: Lit,
}

#[derive(Clone, Debug)]
pub enum Node {
    Var(Var),
    Gate(Gate),
    Scope(ScopeNode),
}

impl Node {
    pub fn info(&self) -> &NodeInfo {
        match self {
            Node::Var(var) => &var.info,
            Node::Gate(gate) => &gate.info,
            Node::Scope(node) => &node.info,
        }
    }

    pub fn info_mut(&mut self) -> &mut NodeInfo {
        match self {
            Node::Var(var) => &mut var.info,
            Node::Gate(gate) => &mut gate.info,
            Node::Scope(node) => &mut node.info,
        }
    }
}

/// A node of the quantifier tree.
#[derive(Clone, Debug)]
pub struct Scope {
    /// Unique and strictly increasing along the prefix chain; consecutive
    /// after reencoding.
    pub scope_id: u32,
    pub depth: u32,
    /// Maximal depth reachable in this scope's subtree.
    pub max_depth: u32,
    pub quant: Quantifier,
    /// Ids of the variables bound by this scope.
    pub vars: Vec<NodeId>,
    /// Id of the anchoring [`ScopeNode`], or [`NO_NODE`] for prefix scopes.
    pub node: NodeId,
    pub parent: Option<ScopeRef>,
    pub children: Vec<ScopeRef>,
}

/// Record of every variable ever created, indexed by its dense variable
/// index. Removed variables keep their entry so certificates can still
/// report them.
#[derive(Clone, Debug)]
pub struct VarEntry {
    /// Current node id, or [`NO_NODE`] once the variable was removed.
    pub node: NodeId,
    pub orig_id: Lit,
    pub quant: Quantifier,
    /// Value the variable was fixed to when it was removed (sign only).
    pub value: i32,
    /// Replaced by per-subtree copies during miniscoping; not reported in
    /// certificates.
    pub superseded: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    Building,
    Encoded,
    Propagation,
}

/// Evaluation values for all nodes, indexed by node id.
///
/// Values are level-tagged: the sign is the truth value, the magnitude the
/// scope id at which the node was decided, and `0` means undefined. Keeping
/// them outside the nodes leaves the circuit immutable while solving.
#[derive(Clone, Debug, Default)]
pub struct Valuation {
    values: Vec<i32>,
}

impl Valuation {
    pub fn for_circuit(circuit: &Circuit) -> Self {
        Self {
            values: vec![0; circuit.max_num as usize + 1],
        }
    }

    pub fn value(&self, node: NodeId) -> i32 {
        self.values.get(node as usize).copied().unwrap_or(0)
    }

    pub fn set(&mut self, node: NodeId, value: i32) {
        if node as usize >= self.values.len() {
            self.values.resize(node as usize + 1, 0);
        }
        self.values[node as usize] = value;
    }
}

#[derive(Clone, Debug)]
pub struct Circuit {
    nodes: Vec<Option<Node>>,
    max_num: NodeId,
    output: Lit,
    pub(crate) vars: Vec<VarEntry>,
    scopes: Vec<Option<Scope>>,
    previous_scope: ScopeRef,
    pub(crate) current_scope_id: u32,
    pub(crate) max_scope_id: u32,
    pub(crate) current_depth: u32,
    pub(crate) max_depth: u32,
    phase: Phase,
}

pub const TOP_LEVEL: ScopeRef = 0;

impl Default for Circuit {
    fn default() -> Self {
        Self::new()
    }
}

impl Circuit {
    pub fn new() -> Self {
        // The top-level scope is existential and holds the free variables.
        let top = Scope {
            scope_id: 1,
            depth: 1,
            max_depth: 1,
            quant: Quantifier::Exists,
            vars: Vec::new(),
            node: NO_NODE,
            parent: None,
            children: Vec::new(),
        };
        Self {
            nodes: vec![None],
            max_num: 0,
            output: 0,
            vars: Vec::new(),
            scopes: vec![Some(top)],
            previous_scope: TOP_LEVEL,
            current_scope_id: 2,
            max_scope_id: 2,
            current_depth: 2,
            max_depth: 2,
            phase: Phase::Building,
        }
    }

    pub fn max_num(&self) -> NodeId {
        self.max_num
    }

    pub fn num_vars(&self) -> usize {
        self.vars.len()
    }

    /// One record per variable ever created, including removed ones.
    pub fn var_records(&self) -> &[VarEntry] {
        &self.vars
    }

    pub fn output(&self) -> Lit {
        self.output
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub(crate) fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
    }

    pub fn top_level(&self) -> ScopeRef {
        TOP_LEVEL
    }

    pub(crate) fn previous_scope(&self) -> ScopeRef {
        self.previous_scope
    }

    pub(crate) fn set_previous_scope(&mut self, scope: ScopeRef) {
        self.previous_scope = scope;
    }

    /// Moves every node to the slot given by its (already rewritten) id and
    /// shrinks the arena to `new_max`.
    pub(crate) fn compact_nodes(&mut self, new_max: NodeId) {
        let old = std::mem::take(&mut self.nodes);
        let mut new_nodes: Vec<Option<Node>> = Vec::new();
        new_nodes.resize_with(new_max as usize + 1, || None);
        for node in old.into_iter().flatten() {
            let id = node.info().id as usize;
            debug_assert!(id <= new_max as usize);
            debug_assert!(new_nodes[id].is_none());
            new_nodes[id] = Some(node);
        }
        self.nodes = new_nodes;
        self.max_num = new_max;
    }

    pub(crate) fn max_scope_id(&self) -> u32 {
        self.max_scope_id
    }

    pub(crate) fn max_depth(&self) -> u32 {
        self.max_depth
    }

    fn ensure_slot(&mut self, id: NodeId) {
        if id as usize >= self.nodes.len() {
            self.nodes.resize_with(id as usize + 1, || None);
        }
        if id > self.max_num {
            self.max_num = id;
        }
    }

    // Node access

    pub fn node(&self, id: NodeId) -> &Node {
        self.nodes[id as usize]
            .as_ref()
            .unwrap_or_else(|| panic!("node {id} is not defined"))
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes[id as usize]
            .as_mut()
            .unwrap_or_else(|| panic!("node {id} is not defined"))
    }

    pub fn try_node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id as usize).and_then(Option::as_ref)
    }

    pub fn info(&self, id: NodeId) -> &NodeInfo {
        self.node(id).info()
    }

    pub fn info_mut(&mut self, id: NodeId) -> &mut NodeInfo {
        self.node_mut(id).info_mut()
    }

    pub fn gate(&self, id: NodeId) -> &Gate {
        match self.node(id) {
            Node::Gate(gate) => gate,
            _ => panic!("node {id} is not a gate"),
        }
    }

    pub fn gate_mut(&mut self, id: NodeId) -> &mut Gate {
        match self.node_mut(id) {
            Node::Gate(gate) => gate,
            _ => panic!("node {id} is not a gate"),
        }
    }

    pub fn var(&self, id: NodeId) -> &Var {
        match self.node(id) {
            Node::Var(var) => var,
            _ => panic!("node {id} is not a variable"),
        }
    }

    pub fn var_mut(&mut self, id: NodeId) -> &mut Var {
        match self.node_mut(id) {
            Node::Var(var) => var,
            _ => panic!("node {id} is not a variable"),
        }
    }

    pub fn scope_node(&self, id: NodeId) -> &ScopeNode {
        match self.node(id) {
            Node::Scope(node) => node,
            _ => panic!("node {id} is not a scope node"),
        }
    }

    pub fn scope_node_mut(&mut self, id: NodeId) -> &mut ScopeNode {
        match self.node_mut(id) {
            Node::Scope(node) => node,
            _ => panic!("node {id} is not a scope node"),
        }
    }

    /// The gate referenced by `lit`, if any.
    pub fn is_gate(&self, lit: Lit) -> Option<&Gate> {
        match self.try_node(var_of(lit)) {
            Some(Node::Gate(gate)) => Some(gate),
            _ => None,
        }
    }

    /// The variable referenced by `lit`, if any.
    pub fn is_var(&self, lit: Lit) -> Option<&Var> {
        match self.try_node(var_of(lit)) {
            Some(Node::Var(var)) => Some(var),
            _ => None,
        }
    }

    pub(crate) fn take_node(&mut self, id: NodeId) -> Node {
        self.nodes[id as usize]
            .take()
            .unwrap_or_else(|| panic!("node {id} is not defined"))
    }

    pub(crate) fn clear_slot(&mut self, id: NodeId) {
        self.nodes[id as usize] = None;
    }

    // Scope access

    pub(crate) fn scopes_slot(&self, scope: ScopeRef) -> Option<&Scope> {
        self.scopes.get(scope as usize).and_then(Option::as_ref)
    }

    pub(crate) fn drop_scope_slot(&mut self, scope: ScopeRef) {
        debug_assert!(self.scopes[scope as usize]
            .as_ref()
            .is_some_and(|s| s.vars.is_empty() && s.children.is_empty()));
        self.scopes[scope as usize] = None;
    }

    pub fn scope(&self, scope: ScopeRef) -> &Scope {
        self.scopes[scope as usize]
            .as_ref()
            .unwrap_or_else(|| panic!("scope {scope} was removed"))
    }

    pub fn scope_mut(&mut self, scope: ScopeRef) -> &mut Scope {
        self.scopes[scope as usize]
            .as_mut()
            .unwrap_or_else(|| panic!("scope {scope} was removed"))
    }

    /// The next scope in the quantifier prefix, or `None` once the chain
    /// leaves the prefix.
    pub fn next_scope_in_prefix(&self, scope: ScopeRef) -> Option<ScopeRef> {
        let scope = self.scope(scope);
        let next = *scope.children.first()?;
        if self.scope(next).node != NO_NODE {
            return None;
        }
        Some(next)
    }

    /// All scopes of the quantifier prefix, outermost first.
    pub fn prefix_scopes(&self) -> impl Iterator<Item = ScopeRef> + '_ {
        let mut current = Some(TOP_LEVEL);
        std::iter::from_fn(move || {
            let scope = current?;
            current = self.next_scope_in_prefix(scope);
            Some(scope)
        })
    }

    pub fn is_prenex(&self) -> bool {
        let mut scope = TOP_LEVEL;
        loop {
            let s = self.scope(scope);
            if s.children.len() > 1 || s.node != NO_NODE {
                return false;
            }
            match s.children.first() {
                Some(&next) => scope = next,
                None => return true,
            }
        }
    }

    // Building

    /// Sets the output literal. May only be called once.
    pub fn set_output(&mut self, lit: Lit) {
        assert!(self.output == 0, "output can only be set once");
        assert!(lit != 0, "output literal must be non-zero");
        self.output = lit;
    }

    pub(crate) fn replace_output(&mut self, lit: Lit) {
        debug_assert!(lit != 0);
        self.output = lit;
    }

    fn create_scope(&mut self, quant: Quantifier, in_prefix: bool) -> ScopeRef {
        if in_prefix {
            if let Some(prev) = self.scopes[self.previous_scope as usize].as_ref() {
                if prev.quant == quant {
                    return self.previous_scope;
                }
            }
        }
        let mut scope = Scope {
            scope_id: 0,
            depth: 0,
            max_depth: 0,
            quant,
            vars: Vec::new(),
            node: NO_NODE,
            parent: None,
            children: Vec::new(),
        };
        if in_prefix {
            scope.scope_id = self.current_scope_id;
            self.current_scope_id += 1;
            if self.current_scope_id > self.max_scope_id {
                self.max_scope_id = self.current_scope_id;
            }
        }
        let slot = self.scopes.len() as ScopeRef;
        self.scopes.push(Some(scope));
        slot
    }

    /// Appends a scope of the given quantifier to the prefix. Consecutive
    /// scopes of the same quantifier are merged.
    pub fn new_scope(&mut self, quant: Quantifier) -> ScopeRef {
        let scope = self.create_scope(quant, true);
        if self.previous_scope != scope {
            self.link_scope(self.previous_scope, scope);
        }
        self.previous_scope = scope;
        scope
    }

    /// Creates a variable with the given id inside `scope`.
    pub fn new_var(&mut self, scope: ScopeRef, var_id: NodeId) -> NodeId {
        assert!(var_id > 0, "variable ids must be greater than 0");
        self.ensure_slot(var_id);
        assert!(
            self.nodes[var_id as usize].is_none(),
            "node {var_id} is already defined"
        );
        let quant = self.scope(scope).quant;
        let var = Var {
            info: NodeInfo::new(var_id),
            var_index: self.vars.len() as u32,
            scope,
            polarity: Polarity::Undefined,
            orig_quant: quant,
        };
        self.vars.push(VarEntry {
            node: var_id,
            orig_id: var_id as Lit,
            quant,
            value: 0,
            superseded: false,
        });
        self.nodes[var_id as usize] = Some(Node::Var(var));
        self.scope_mut(scope).vars.push(var_id);
        var_id
    }

    /// Creates a quantifier node embedded in the formula. Its scope is not
    /// part of the prefix until reencoding links it.
    pub fn new_scope_node(&mut self, quant: Quantifier, node_id: NodeId) -> NodeId {
        assert!(node_id > 0, "node ids must be greater than 0");
        let scope = self.create_scope(quant, false);
        self.scope_mut(scope).node = node_id;
        self.ensure_slot(node_id);
        assert!(
            self.nodes[node_id as usize].is_none(),
            "node {node_id} is already defined"
        );
        self.nodes[node_id as usize] = Some(Node::Scope(ScopeNode {
            info: NodeInfo::new(node_id),
            scope,
            sub: 0,
        }));
        node_id
    }

    /// Sets the sub-formula of a scope node. May only be called once.
    pub fn set_scope_node_sub(&mut self, node_id: NodeId, lit: Lit) {
        self.ensure_slot(var_of(lit));
        let node = self.scope_node_mut(node_id);
        assert!(node.sub == 0, "scope node is already set");
        node.sub = lit;
    }

    /// Creates a gate with the given id and kind; inputs are added with
    /// [`Circuit::add_gate_input`].
    pub fn new_gate(&mut self, gate_id: NodeId, kind: GateKind) -> NodeId {
        assert!(gate_id > 0, "gate ids must be greater than 0");
        self.ensure_slot(gate_id);
        assert!(
            self.nodes[gate_id as usize].is_none(),
            "node {gate_id} is already defined"
        );
        self.nodes[gate_id as usize] = Some(Node::Gate(Gate {
            info: NodeInfo::new(gate_id),
            kind,
            inputs: Vec::new(),
            conflict: false,
            keep: false,
            reachable: false,
            negation: NO_NODE,
            owner: NO_NODE,
        }));
        gate_id
    }

    /// Adds an input to a gate, ignoring duplicates. Returns whether the
    /// input was added. A gate containing both a literal and its negation is
    /// flagged as conflicting.
    pub fn add_gate_input(&mut self, gate_id: NodeId, lit: Lit) -> bool {
        self.ensure_slot(var_of(lit));
        let gate = self.gate_mut(gate_id);
        let mut contained = false;
        for &input in &gate.inputs {
            if input == lit {
                contained = true;
            } else if input == -lit {
                gate.conflict = true;
            }
        }
        if contained {
            return false;
        }
        gate.inputs.push(lit);
        true
    }

    // Scope tree maintenance

    /// Makes `child` a child of `parent`, unlinking it from a previous
    /// parent if necessary. No-op when the edge already exists.
    pub(crate) fn link_scope(&mut self, parent: ScopeRef, child: ScopeRef) {
        if self.scope(child).parent == Some(parent) {
            return;
        }
        if let Some(old) = self.scope(child).parent {
            self.scope_mut(old).children.retain(|&c| c != child);
        }
        self.scope_mut(parent).children.push(child);
        self.scope_mut(child).parent = Some(parent);
    }

    pub(crate) fn unlink_scope(&mut self, parent: ScopeRef, child: ScopeRef) {
        debug_assert_eq!(self.scope(child).parent, Some(parent));
        self.scope_mut(parent).children.retain(|&c| c != child);
        self.scope_mut(child).parent = None;
    }

    fn free_scope_node(&mut self, node_id: NodeId) {
        debug_assert!(matches!(self.node(node_id), Node::Scope(_)));
        self.clear_slot(node_id);
    }

    /// Removes a scope node whose scope became empty or whose value was
    /// determined. An empty, undetermined scope node is replaced by a
    /// singleton gate so the remaining encoding stays intact.
    pub(crate) fn remove_scope_node(&mut self, values: &Valuation, node_id: NodeId) {
        assert!(
            self.phase == Phase::Encoded || self.phase == Phase::Propagation,
            "circuit must be encoded first"
        );
        let (scope, sub, info) = {
            let node = self.scope_node(node_id);
            (node.scope, node.sub, node.info.clone())
        };
        let value = values.value(node_id);
        debug!(
            "remove scope node {} ({}), value {}",
            node_id, info.orig_id, value
        );

        // Detach the anchor first: removing the scope's last variable tears
        // the scope down, which must not re-enter this node.
        self.scope_mut(scope).node = NO_NODE;
        while let Some(&var) = self.scope(scope).vars.first() {
            debug_assert!(value != 0);
            self.remove_var(values, var);
        }

        self.free_scope_node(node_id);
        if value == 0 {
            // Keep the node id alive as a single-input AND so parents do not
            // dangle.
            self.new_gate(node_id, GateKind::And);
            self.add_gate_input(node_id, sub);
            self.gate_mut(node_id).info = info;
        } else {
            let sub_info = self.info_mut(var_of(sub));
            debug_assert!(sub_info.num_occ > 0);
            sub_info.num_occ -= 1;
        }
    }

    fn free_scope(&mut self, values: &Valuation, scope: ScopeRef) {
        debug_assert!(self.scope(scope).parent.is_none());
        debug_assert!(scope != TOP_LEVEL);
        debug_assert!(self.scope(scope).vars.is_empty());
        let node = self.scope(scope).node;
        if node != NO_NODE {
            self.remove_scope_node(values, node);
        }
        debug_assert!(self.scope(scope).children.is_empty());
        self.scopes[scope as usize] = None;
    }

    /// Merges scope `from` into its parent `to` (same quantifier type).
    pub(crate) fn merge_scopes(&mut self, values: &Valuation, from: ScopeRef, to: ScopeRef) {
        debug_assert_eq!(self.scope(from).quant, self.scope(to).quant);
        debug_assert!(self.scope(to).children.contains(&from));

        let moved = std::mem::take(&mut self.scope_mut(from).vars);
        for &var in &moved {
            self.var_mut(var).scope = to;
        }
        self.scope_mut(to).vars.extend(moved);

        // Children of `from` alternate against `to`, so they become direct
        // children of `to`.
        self.unlink_scope(to, from);
        while let Some(&child) = self.scope(from).children.first() {
            debug_assert_eq!(
                self.scope(child).quant,
                self.scope(to).quant.negate()
            );
            self.unlink_scope(from, child);
            self.link_scope(to, child);
        }

        if self.scope(to).node != NO_NODE {
            let mut max_depth = self.scope(to).depth;
            for &child in &self.scope(to).children {
                max_depth = max_depth.max(self.scope(child).max_depth);
            }
            self.scope_mut(to).max_depth = max_depth;
        }

        let from_node = self.scope(from).node;
        if from_node != NO_NODE {
            self.scope_mut(from).node = NO_NODE;
            self.remove_scope_node(values, from_node);
        }
        self.scopes[from as usize] = None;
    }

    /// Removes an empty scope from the quantifier tree, merging its prefix
    /// neighbors when possible.
    pub(crate) fn remove_scope(&mut self, values: &Valuation, scope: ScopeRef) {
        debug_assert!(self.scope(scope).vars.is_empty());
        debug_assert!(scope != TOP_LEVEL);

        let previous = self.scope(scope).parent.expect("scope has no parent");

        if self.scope(scope).children.is_empty() {
            self.unlink_scope(previous, scope);
            self.free_scope(values, scope);
            return;
        }

        let next = self.scope(scope).children[0];
        if self.scope(scope).children.len() == 1 && self.scope(next).node == NO_NODE {
            // Both neighbors are in the prefix and share a quantifier type;
            // collapse all three into `previous`.
            debug_assert_eq!(self.scope(previous).quant, self.scope(next).quant);
            let moved = std::mem::take(&mut self.scope_mut(next).vars);
            for &var in &moved {
                self.var_mut(var).scope = previous;
            }
            self.scope_mut(previous).vars.extend(moved);
            self.unlink_scope(previous, scope);
            self.unlink_scope(scope, next);
            while let Some(&after) = self.scope(next).children.first() {
                self.unlink_scope(next, after);
                self.link_scope(previous, after);
            }
            self.free_scope(values, scope);
            self.free_scope(values, next);
        } else {
            // Not in the quantifier prefix; splice the children up.
            self.unlink_scope(previous, scope);
            while let Some(&child) = self.scope(scope).children.first() {
                self.unlink_scope(scope, child);
                self.link_scope(previous, child);
            }
            self.free_scope(values, scope);
        }
    }

    /// Removes a variable. The variable's entry survives with the value it
    /// carried so certificates can report it.
    pub(crate) fn remove_var(&mut self, values: &Valuation, var_id: NodeId) {
        assert!(var_id > 0, "variable ids must be greater than zero");
        let (scope, var_index) = {
            let var = self.var(var_id);
            (var.scope, var.var_index)
        };
        debug!(
            "remove variable {} ({}), value {}",
            var_id,
            self.vars[var_index as usize].orig_id,
            values.value(var_id)
        );

        let scope_vars = &mut self.scope_mut(scope).vars;
        let pos = scope_vars
            .iter()
            .position(|&v| v == var_id)
            .expect("variable not in its scope");
        scope_vars.remove(pos);

        self.vars[var_index as usize].node = NO_NODE;
        self.vars[var_index as usize].value = values.value(var_id);
        self.clear_slot(var_id);

        if self.scope(scope).vars.is_empty() && scope != TOP_LEVEL {
            debug!("scope {} became empty", self.scope(scope).scope_id);
            self.remove_scope(values, scope);
        }
    }

    /// Removes a gate, decrementing its inputs' occurrence counts. The
    /// output gate is kept as an empty gate whose kind encodes its value.
    pub(crate) fn remove_gate(&mut self, values: &Valuation, gate_id: NodeId) {
        assert!(gate_id > 0, "gate ids must be greater than zero");
        debug!(
            "remove gate {} ({}), value {}",
            gate_id,
            self.info(gate_id).orig_id,
            values.value(gate_id)
        );

        let inputs = std::mem::take(&mut self.gate_mut(gate_id).inputs);
        for &input in &inputs {
            let input_var = var_of(input);
            if self.try_node(input_var).is_none() {
                continue;
            }
            if self.phase == Phase::Encoded || self.phase == Phase::Propagation {
                self.info_mut(input_var).num_occ -= 1;
            }
        }

        if var_of(self.output) == gate_id {
            let value = values.value(gate_id);
            debug_assert!(value != 0);
            let gate = self.gate_mut(gate_id);
            gate.kind = if value > 0 { GateKind::And } else { GateKind::Or };
            gate.conflict = false;
        } else {
            self.clear_slot(gate_id);
        }
    }

    /// Frees a gate subtree whose occurrence count dropped to zero.
    pub(crate) fn remove_gates_recursive(&mut self, node_id: NodeId) {
        debug_assert!(matches!(self.node(node_id), Node::Gate(_)));
        if self.info(node_id).num_occ > 0 {
            return;
        }
        let gate = match self.take_node(node_id) {
            Node::Gate(gate) => gate,
            _ => unreachable!(),
        };
        for &input in &gate.inputs {
            let input_var = var_of(input);
            debug_assert!(!matches!(self.try_node(input_var), Some(Node::Scope(_))));
            if let Some(node) = self.nodes[input_var as usize].as_mut() {
                node.info_mut().num_occ -= 1;
            }
            if matches!(self.try_node(input_var), Some(Node::Gate(_))) {
                self.remove_gates_recursive(input_var);
            }
        }
    }

    /// Drops gate inputs that refer to removed nodes. Returns the number of
    /// dropped references.
    pub(crate) fn remove_orphans(&mut self) -> usize {
        let mut removed = 0;
        for id in 1..=self.max_num {
            match self.nodes[id as usize] {
                Some(Node::Gate(_)) => {
                    let inputs = std::mem::take(&mut self.gate_mut(id).inputs);
                    let kept: Vec<Lit> = inputs
                        .into_iter()
                        .filter(|&input| {
                            let alive = self.try_node(var_of(input)).is_some();
                            if !alive {
                                removed += 1;
                            }
                            alive
                        })
                        .collect();
                    self.gate_mut(id).inputs = kept;
                }
                Some(Node::Scope(ref node)) => {
                    debug_assert!(self.try_node(var_of(node.sub)).is_some());
                }
                _ => {}
            }
        }
        removed
    }

    // Evaluation

    /// Evaluates all gates bottom-up from the variable values in `values`.
    pub fn evaluate(&self, values: &mut Valuation) {
        self.evaluate_capped(values, EVALUATION_NO_MAX);
    }

    /// Evaluates the circuit, treating values decided at a scope id greater
    /// than `max_value` as undefined.
    pub fn evaluate_capped(&self, values: &mut Valuation, max_value: i32) {
        debug_assert!(max_value > 0 || max_value == EVALUATION_NO_MAX);
        let no_max = max_value == EVALUATION_NO_MAX;
        let max_value = if no_max { 1 } else { max_value };

        for id in 1..=self.max_num {
            let gate = match self.nodes[id as usize] {
                Some(Node::Gate(ref gate)) => gate,
                Some(Node::Scope(ref node)) => {
                    let sub_value = values.value(var_of(node.sub));
                    values.set(id, sub_value);
                    continue;
                }
                _ => continue,
            };

            let orig_value = values.value(id);
            let mut value = match gate.kind {
                GateKind::And => max_value,
                GateKind::Or => -max_value,
            };
            // A gate decided at an outer level stays decided.
            if gate.kind == GateKind::Or && orig_value > 0 && !no_max && orig_value < max_value {
                continue;
            }
            if gate.kind == GateKind::And && orig_value < 0 && !no_max && orig_value > -max_value {
                continue;
            }

            for &input in &gate.inputs {
                let occ_var = var_of(input);
                debug_assert!(occ_var < id);
                let mut occ_val = values.value(occ_var);
                if input < 0 {
                    occ_val = -occ_val;
                }
                if !no_max && occ_val.abs() > max_value {
                    occ_val = 0;
                }

                match gate.kind {
                    GateKind::And => {
                        if value > 0 && occ_val == 0 {
                            value = 0;
                        }
                        if occ_val < 0 {
                            value = occ_val;
                            break;
                        }
                        if gate.conflict {
                            value = -max_value;
                            break;
                        }
                    }
                    GateKind::Or => {
                        if value < 0 && occ_val == 0 {
                            value = 0;
                        }
                        if occ_val > 0 {
                            value = occ_val;
                            break;
                        }
                        if gate.conflict {
                            value = max_value;
                            break;
                        }
                    }
                }
            }

            // Do not raise the level of an already decided gate.
            if orig_value < 0 && value < 0 && value < orig_value {
                value = orig_value;
            } else if orig_value > 0 && value > 0 && value > orig_value {
                value = orig_value;
            }
            values.set(id, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::literal::{GateKind, Quantifier};

    fn simple_and_or() -> Circuit {
        // exists x forall y: and(or(x, y), or(-x, -y))
        let mut circuit = Circuit::new();
        let e = circuit.new_scope(Quantifier::Exists);
        circuit.new_var(e, 1);
        let a = circuit.new_scope(Quantifier::Forall);
        circuit.new_var(a, 2);
        circuit.new_gate(3, GateKind::Or);
        circuit.add_gate_input(3, 1);
        circuit.add_gate_input(3, 2);
        circuit.new_gate(4, GateKind::Or);
        circuit.add_gate_input(4, -1);
        circuit.add_gate_input(4, -2);
        circuit.new_gate(5, GateKind::And);
        circuit.add_gate_input(5, 3);
        circuit.add_gate_input(5, 4);
        circuit.set_output(5);
        circuit
    }

    #[test]
    fn test_build_and_evaluate() {
        let mut circuit = simple_and_or();
        circuit.reencode().unwrap();

        let mut values = Valuation::for_circuit(&circuit);
        let x = circuit
            .prefix_scopes()
            .map(|s| circuit.scope(s))
            .find(|s| s.quant == Quantifier::Exists && !s.vars.is_empty())
            .unwrap()
            .vars[0];
        let y = circuit
            .prefix_scopes()
            .map(|s| circuit.scope(s))
            .find(|s| s.quant == Quantifier::Forall)
            .unwrap()
            .vars[0];

        values.set(x, 1);
        values.set(y, -1);
        circuit.evaluate(&mut values);
        assert!(values.value(var_of(circuit.output())) > 0);

        let mut values = Valuation::for_circuit(&circuit);
        values.set(x, 1);
        values.set(y, 1);
        circuit.evaluate(&mut values);
        assert!(values.value(var_of(circuit.output())) < 0);
    }

    #[test]
    fn test_duplicate_inputs_and_conflicts() {
        let mut circuit = Circuit::new();
        let e = circuit.new_scope(Quantifier::Exists);
        circuit.new_var(e, 1);
        circuit.new_gate(2, GateKind::And);
        assert!(circuit.add_gate_input(2, 1));
        assert!(!circuit.add_gate_input(2, 1));
        assert!(circuit.add_gate_input(2, -1));
        assert!(circuit.gate(2).conflict);
    }

    #[test]
    fn test_prefix_scope_merging() {
        let mut circuit = Circuit::new();
        let e1 = circuit.new_scope(Quantifier::Exists);
        let e2 = circuit.new_scope(Quantifier::Exists);
        assert_eq!(e1, e2);
        let a = circuit.new_scope(Quantifier::Forall);
        assert_ne!(e1, a);
        let e3 = circuit.new_scope(Quantifier::Exists);
        assert_ne!(e1, e3);
    }

    #[test]
    #[should_panic(expected = "output can only be set once")]
    fn test_output_set_twice() {
        let mut circuit = Circuit::new();
        circuit.new_gate(1, GateKind::And);
        circuit.set_output(1);
        circuit.set_output(1);
    }

    #[test]
    fn test_capped_evaluation() {
        let mut circuit = Circuit::new();
        let e = circuit.new_scope(Quantifier::Exists);
        circuit.new_var(e, 1);
        let a = circuit.new_scope(Quantifier::Forall);
        circuit.new_var(a, 2);
        circuit.new_gate(3, GateKind::And);
        circuit.add_gate_input(3, 1);
        circuit.add_gate_input(3, 2);
        circuit.set_output(3);
        circuit.reencode().unwrap();

        let out = var_of(circuit.output());
        let scopes: Vec<_> = circuit.prefix_scopes().collect();
        let x = circuit.scope(scopes[0]).vars[0];
        let y = circuit.scope(scopes[1]).vars[0];
        let x_level = circuit.scope(scopes[0]).scope_id as i32;
        let y_level = circuit.scope(scopes[1]).scope_id as i32;

        let mut values = Valuation::for_circuit(&circuit);
        values.set(x, x_level);
        values.set(y, y_level);
        // Capped below y's level, the conjunction stays undefined.
        circuit.evaluate_capped(&mut values, x_level);
        assert_eq!(values.value(out), 0);
        circuit.evaluate_capped(&mut values, y_level);
        assert!(values.value(out) > 0);
    }
}
