//! The recursive clausal-abstraction driver: one abstraction per scope,
//! SAT candidates flowing inward as assumptions, UNSAT cores flowing
//! outward as refinements.

use anyhow::Result;
use log::{debug, info, warn};

use crate::abstraction::{b_lit_of, contains_sorted, ScopeAbstraction};
use crate::certify::Certification;
use crate::circuit::{Circuit, Valuation, TOP_LEVEL};
use crate::literal::{Lit, QbfResult, Quantifier, ScopeRef, NO_NODE};
use crate::sat::SatResult;
use crate::stats::Stats;

/// High- and low-level solving features, defaulted like the reference
/// configuration: preprocessing on, miniscoping/certification off,
/// b-literal minimization and the combined abstraction on.
#[derive(Clone, Debug)]
pub struct SolverOptions {
    pub preprocess: bool,
    pub miniscoping: bool,
    pub certify: bool,
    pub statistics: bool,
    pub partial_assignment: bool,

    /// Minimize derived child entries using the circuit valuation.
    pub assignment_b_lit_minimization: bool,
    /// Represent purely-outer subformulas by proxy t-literals.
    pub use_combined_abstraction: bool,

    /// Solve the children of a branching scope concurrently. Concurrency is
    /// bounded by the global rayon pool.
    #[cfg(feature = "parallel")]
    pub parallel: bool,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            preprocess: true,
            miniscoping: false,
            certify: false,
            statistics: false,
            partial_assignment: false,
            assignment_b_lit_minimization: true,
            use_combined_abstraction: true,
            #[cfg(feature = "parallel")]
            parallel: false,
        }
    }
}

pub struct Solver {
    options: SolverOptions,
    circuit: Circuit,
    values: Valuation,
    abstraction: Option<ScopeAbstraction>,
    certification: Option<Certification>,
    result: QbfResult,

    encoding: Stats,
    preprocessing: Stats,
    building_abstraction: Stats,
    solving: Stats,
}

impl Solver {
    pub fn new(options: SolverOptions, circuit: Circuit) -> Self {
        #[cfg(feature = "parallel")]
        assert!(
            !(options.parallel && options.certify),
            "certification requires sequential solving"
        );
        Self {
            options,
            circuit,
            values: Valuation::default(),
            abstraction: None,
            certification: None,
            result: QbfResult::Unknown,
            encoding: Stats::new(10_000.0),
            preprocessing: Stats::new(10_000.0),
            building_abstraction: Stats::new(10_000.0),
            solving: Stats::new(10_000.0),
        }
    }

    pub fn options(&self) -> &SolverOptions {
        &self.options
    }

    pub fn circuit(&self) -> &Circuit {
        &self.circuit
    }

    pub fn result(&self) -> QbfResult {
        self.result
    }

    /// The accumulated certificate, if certification was enabled.
    pub fn certification(&self) -> Option<&Certification> {
        self.certification.as_ref()
    }

    /// Decides the circuit. The result of the first call is cached.
    pub fn solve(&mut self) -> Result<QbfResult> {
        if self.result != QbfResult::Unknown {
            return Ok(self.result);
        }

        self.encoding.start_timer();
        self.circuit.reencode()?;
        self.encoding.stop_and_record();

        if self.options.preprocess {
            self.preprocessing.start_timer();
            self.circuit.preprocess()?;
            self.preprocessing.stop_and_record();
        }

        if self.options.miniscoping {
            self.circuit.unprenex_by_miniscoping()?;
        }

        if self.options.certify {
            let mut certification = Certification::new(&self.circuit);
            certification.import_variables(&self.circuit);
            self.certification = Some(certification);
        }

        self.building_abstraction.start_timer();
        self.circuit.compute_scope_influence();
        if !self.circuit.is_prenex() {
            warn!("input is non-prenex; solving is supported but less tested than prenex input");
            self.circuit.compute_relevant_scopes();
        }

        self.values = Valuation::for_circuit(&self.circuit);
        let mut cert = self.certification.as_mut();
        let mut outer = Vec::new();
        let mut abstraction = build_abstraction_tree(
            &self.circuit,
            &self.options,
            &mut cert,
            TOP_LEVEL,
            &mut outer,
        );
        self.building_abstraction.stop_and_record();

        self.solving.start_timer();
        let result = solve_recursive(
            &mut abstraction,
            &self.circuit,
            &mut self.values,
            &self.options,
            &mut cert,
        )?;
        self.solving.stop_and_record();

        if let Some(certification) = self.certification.as_mut() {
            certification.define_outputs(&self.circuit, result);
        }

        self.abstraction = Some(abstraction);
        self.result = result;
        Ok(result)
    }

    /// Assignment of the outermost scope won by the winning player, as
    /// original-id literals. `None` when the result does not belong to that
    /// scope's player or nothing was solved yet.
    pub fn partial_assignment(&self) -> Option<Vec<Lit>> {
        let mut top = self.abstraction.as_ref()?;
        if self.circuit.scope(top.scope).vars.is_empty() && top.children.len() == 1 {
            top = &top.children[0];
        }
        let winning = (self.result == QbfResult::Sat && top.quant == Quantifier::Exists)
            || (self.result == QbfResult::Unsat && top.quant == Quantifier::Forall);
        if !winning {
            return None;
        }
        let mut assignment = Vec::new();
        for &var in &self.circuit.scope(top.scope).vars {
            let value = self.values.value(var);
            if value == 0 {
                continue;
            }
            let orig_id = self.circuit.info(var).orig_id;
            assignment.push(if value > 0 { orig_id } else { -orig_id });
        }
        Some(assignment)
    }

    /// Writes the partial assignment in the `V <literals> 0` format.
    pub fn write_partial_assignment<W: std::io::Write>(&self, writer: &mut W) -> Result<()> {
        if let Some(assignment) = self.partial_assignment() {
            write!(writer, "V ")?;
            for lit in assignment {
                write!(writer, "{lit} ")?;
            }
            writeln!(writer, "0")?;
        }
        Ok(())
    }

    /// Writes the winning strategy as an ASCII And-Inverter-Graph.
    pub fn write_certificate<W: std::io::Write>(&self, writer: &mut W) -> Result<()> {
        let certification = self
            .certification
            .as_ref()
            .expect("solver was not run with certification enabled");
        assert!(self.result != QbfResult::Unknown, "nothing was solved yet");
        certification.write(self.result, writer)?;
        Ok(())
    }

    pub fn print_statistics(&self) {
        self.encoding.print_time("reencoding the circuit");
        self.preprocessing.print_time("preprocessing");
        self.building_abstraction.print_time("building the abstraction");
        self.solving.print_time("solving");
        if let Some(abstraction) = &self.abstraction {
            print_scope_statistics(abstraction);
        }
    }
}

fn print_scope_statistics(abstraction: &ScopeAbstraction) {
    info!(
        "statistics for {} level {}",
        match abstraction.quant {
            Quantifier::Exists => "existential",
            Quantifier::Forall => "universal",
        },
        abstraction.scope_id
    );
    abstraction.stats.print();
    for child in &abstraction.children {
        print_scope_statistics(child);
    }
}

fn build_abstraction_tree(
    circuit: &Circuit,
    options: &SolverOptions,
    cert: &mut Option<&mut Certification>,
    scope: ScopeRef,
    outer: &mut Vec<(u32, Vec<u32>)>,
) -> ScopeAbstraction {
    let mut abstraction = ScopeAbstraction::new(circuit, options, cert, scope, outer);
    outer.push((abstraction.scope_id, abstraction.b_lits.clone()));
    let children = circuit.scope(scope).children.clone();
    for child in children {
        abstraction
            .children
            .push(build_abstraction_tree(circuit, options, cert, child, outer));
    }
    outer.pop();

    // Interface consistency: every b-literal must be accepted as t-literal
    // by some child.
    #[cfg(debug_assertions)]
    for &b_lit in &abstraction.b_lits {
        let t_lit = b_lit + circuit.max_num();
        let accepted = abstraction
            .children
            .iter()
            .any(|child| contains_sorted(&child.t_lits, t_lit));
        debug_assert!(accepted, "b-literal {b_lit} has no inner counterpart");
    }

    abstraction
}

/// Assigns this scope's variables from the current model, tagged with the
/// scope id, and re-evaluates the circuit up to this level.
fn set_value_and_evaluate(
    abstraction: &ScopeAbstraction,
    circuit: &Circuit,
    values: &mut Valuation,
    options: &SolverOptions,
) {
    for &var in &circuit.scope(abstraction.scope).vars {
        let value = abstraction.sat_value(var as Lit);
        values.set(var, value * abstraction.scope_id as i32);
        debug!("assign {}", if value < 0 { -(var as Lit) } else { var as Lit });
    }
    if options.assignment_b_lit_minimization {
        circuit.evaluate_capped(values, abstraction.scope_id as i32);
    }
}

fn child_enabled(abstraction: &ScopeAbstraction, child_index: usize) -> bool {
    let child = &abstraction.children[child_index];
    if child.scope_node == NO_NODE {
        // Scopes in the quantifier prefix are always enabled.
        debug_assert_eq!(abstraction.children.len(), 1);
        return true;
    }
    // An embedded scope is enabled if the b-literal of its anchor is among
    // the current assumptions.
    contains_sorted(&abstraction.assumptions, b_lit_of(child.scope_node))
}

/// Blocks the failing candidate: the child's UNSAT core, translated back
/// into this scope's namespace, plus the child's anchor.
fn refine(
    abstraction: &mut ScopeAbstraction,
    circuit: &Circuit,
    values: &mut Valuation,
    options: &SolverOptions,
    child_index: usize,
) {
    let core: Vec<usize> = abstraction.children[child_index].entry.iter().collect();
    let child_anchor = abstraction.children[child_index].scope_node;

    for t_lit in core {
        let t_lit = t_lit as u32;
        let b_lit = t_lit - circuit.max_num();
        if !contains_sorted(&abstraction.b_lits, b_lit) {
            debug_assert!(!contains_sorted(&abstraction.assumptions, b_lit));
            abstraction.add_refinement_literal(t_lit as Lit);
            debug!("refine t{}", b_lit);
        } else {
            debug_assert!(contains_sorted(&abstraction.assumptions, b_lit));
            abstraction.add_refinement_literal(b_lit as Lit);
            debug!("refine b{}", b_lit);
        }
    }
    if child_anchor != NO_NODE {
        abstraction.add_refinement_literal(b_lit_of(child_anchor) as Lit);
    }
    abstraction.add_refinement_literal(0);

    if abstraction.scope_id > 1 && options.assignment_b_lit_minimization {
        circuit.evaluate_capped(values, abstraction.scope_id as i32 - 1);
    }
}

fn solve_children_sequentially(
    abstraction: &mut ScopeAbstraction,
    circuit: &Circuit,
    values: &mut Valuation,
    options: &SolverOptions,
    cert: &mut Option<&mut Certification>,
    good: QbfResult,
    bad: QbfResult,
) -> Result<()> {
    for child_index in 0..abstraction.children.len() {
        if !child_enabled(abstraction, child_index) {
            continue;
        }
        let sub_result = solve_recursive(
            &mut abstraction.children[child_index],
            circuit,
            values,
            options,
            cert,
        )?;
        if sub_result == good {
            abstraction.absorb_child_core(child_index);
        } else {
            debug_assert_eq!(sub_result, bad);
            refine(abstraction, circuit, values, options, child_index);
            abstraction.result = bad;
        }
    }
    Ok(())
}

#[cfg(feature = "parallel")]
fn solve_children_concurrently(
    abstraction: &mut ScopeAbstraction,
    circuit: &Circuit,
    values: &mut Valuation,
    options: &SolverOptions,
    good: QbfResult,
    bad: QbfResult,
) -> Result<()> {
    use rayon::prelude::*;

    let enabled: Vec<bool> = (0..abstraction.children.len())
        .map(|child_index| child_enabled(abstraction, child_index))
        .collect();

    // Children run against their own copy of the valuation; the parent
    // refines only after every child has returned.
    let shared_values: &Valuation = values;
    let child_results: Vec<(usize, Result<QbfResult>)> = abstraction
        .children
        .par_iter_mut()
        .enumerate()
        .filter(|(child_index, _)| enabled[*child_index])
        .map(|(child_index, child)| {
            let mut child_values = shared_values.clone();
            let mut no_cert: Option<&mut Certification> = None;
            let result =
                solve_recursive(child, circuit, &mut child_values, options, &mut no_cert);
            (child_index, result)
        })
        .collect();

    for (child_index, sub_result) in child_results {
        let sub_result = sub_result?;
        if sub_result == good {
            abstraction.absorb_child_core(child_index);
        } else {
            debug_assert_eq!(sub_result, bad);
            refine(abstraction, circuit, values, options, child_index);
            abstraction.result = bad;
        }
    }
    Ok(())
}

fn solve_children(
    abstraction: &mut ScopeAbstraction,
    circuit: &Circuit,
    values: &mut Valuation,
    options: &SolverOptions,
    cert: &mut Option<&mut Certification>,
    good: QbfResult,
    bad: QbfResult,
) -> Result<()> {
    #[cfg(feature = "parallel")]
    if options.parallel && abstraction.children.len() > 1 && cert.is_none() {
        return solve_children_concurrently(abstraction, circuit, values, options, good, bad);
    }
    solve_children_sequentially(abstraction, circuit, values, options, cert, good, bad)
}

pub(crate) fn solve_recursive(
    abstraction: &mut ScopeAbstraction,
    circuit: &Circuit,
    values: &mut Valuation,
    options: &SolverOptions,
    cert: &mut Option<&mut Certification>,
) -> Result<QbfResult> {
    let is_existential = abstraction.quant == Quantifier::Exists;
    let good = if is_existential {
        QbfResult::Sat
    } else {
        QbfResult::Unsat
    };
    let bad = good.negate();

    loop {
        info!(
            "{} level {}",
            if is_existential { "existential" } else { "universal" },
            abstraction.scope_id
        );
        abstraction.stats.start_timer();

        abstraction.assume_t_literals(false);
        match abstraction.solve_sat()? {
            SatResult::Sat => {
                set_value_and_evaluate(abstraction, circuit, values, options);

                if abstraction.children.is_empty() {
                    abstraction.dual_propagation(circuit, values, options, cert)?;
                    abstraction.stats.stop_and_record();
                    return Ok(good);
                }

                abstraction.derive_assumptions(circuit, values, options);
                abstraction.stats.stop_and_record();

                abstraction.result = good;
                abstraction.local_unsat_core.clear();

                solve_children(abstraction, circuit, values, options, cert, good, bad)?;

                if abstraction.result == good {
                    abstraction.dual_propagation(circuit, values, options, cert)?;
                    return Ok(good);
                }
            }
            SatResult::Unsat => {
                abstraction.collect_unsat_core();
                abstraction.stats.stop_and_record();
                return Ok(bad);
            }
        }
    }
}
