//! The incremental SAT contract used by the scope abstractions, and its
//! default backend.
//!
//! The solver only ever needs variable allocation, clause addition with a
//! `0` terminator, assumptions, solving, model values and failed-assumption
//! queries. The default backend wraps the `varisat` CDCL library.

use anyhow::{anyhow, Result};
use varisat::{ExtendFormula, Lit as SatLit, Solver};

use crate::literal::Lit;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SatResult {
    Sat,
    Unsat,
}

/// Narrow incremental-SAT interface. Assumptions accumulate until the next
/// [`SatSolver::solve`] call, which consumes them.
pub trait SatSolver {
    fn new_var(&mut self);

    /// Adds a literal to the pending clause; `0` terminates the clause.
    fn add(&mut self, lit: Lit);

    fn assume(&mut self, lit: Lit);

    fn solve(&mut self) -> Result<SatResult>;

    /// Value of `lit` in the last model: `1`, `-1`, or `0` if unassigned.
    fn value(&self, lit: Lit) -> i32;

    /// Whether `lit` was an assumption used to derive the last
    /// unsatisfiability.
    fn failed(&self, lit: Lit) -> bool;
}

/// Incremental SAT solving backed by `varisat`.
pub struct VarisatBackend {
    solver: Solver<'static>,
    clause: Vec<SatLit>,
    assumptions: Vec<SatLit>,
    model: Vec<i32>,
    failed: Vec<Lit>,
}

impl Default for VarisatBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl VarisatBackend {
    pub fn new() -> Self {
        Self {
            solver: Solver::new(),
            clause: Vec::new(),
            assumptions: Vec::new(),
            model: Vec::new(),
            failed: Vec::new(),
        }
    }

    fn to_sat_lit(lit: Lit) -> SatLit {
        debug_assert!(lit != 0);
        SatLit::from_dimacs(lit as isize)
    }
}

impl SatSolver for VarisatBackend {
    fn new_var(&mut self) {
        let _ = self.solver.new_var();
    }

    fn add(&mut self, lit: Lit) {
        if lit == 0 {
            let clause = std::mem::take(&mut self.clause);
            self.solver.add_clause(&clause);
            return;
        }
        self.clause.push(Self::to_sat_lit(lit));
    }

    fn assume(&mut self, lit: Lit) {
        self.assumptions.push(Self::to_sat_lit(lit));
    }

    fn solve(&mut self) -> Result<SatResult> {
        debug_assert!(self.clause.is_empty(), "unterminated clause");
        let assumptions = std::mem::take(&mut self.assumptions);
        self.solver.assume(&assumptions);
        self.model.clear();
        self.failed.clear();

        let satisfiable = self
            .solver
            .solve()
            .map_err(|err| anyhow!("SAT backend error: {err}"))?;

        if satisfiable {
            let model = self
                .solver
                .model()
                .ok_or_else(|| anyhow!("SAT backend reported SAT without a model"))?;
            for lit in model {
                let index = lit.var().index();
                if index >= self.model.len() {
                    self.model.resize(index + 1, 0);
                }
                self.model[index] = if lit.is_positive() { 1 } else { -1 };
            }
            Ok(SatResult::Sat)
        } else {
            if let Some(core) = self.solver.failed_core() {
                self.failed
                    .extend(core.iter().map(|lit| lit.to_dimacs() as Lit));
            }
            Ok(SatResult::Unsat)
        }
    }

    fn value(&self, lit: Lit) -> i32 {
        let index = lit.unsigned_abs() as usize - 1;
        let value = self.model.get(index).copied().unwrap_or(0);
        if lit < 0 {
            -value
        } else {
            value
        }
    }

    fn failed(&self, lit: Lit) -> bool {
        self.failed.contains(&lit)
    }
}
