//! A clausal-abstraction solver for quantified Boolean formulas given as
//! quantified circuits.
//!
//! The circuit is a DAG of AND/OR gates over variables bound by an
//! arbitrary-depth tree of alternating quantifier scopes. Solving builds
//! one propositional abstraction per scope and negotiates candidate
//! assignments and refutations between neighboring scopes through
//! assumption (t-) and blocking (b-) literals. On request, the solver
//! emits the winning player's strategy as an And-Inverter-Graph.

#![allow(clippy::too_many_arguments)]
#![allow(clippy::needless_range_loop)]

pub mod abstraction;
pub mod certify;
pub mod circuit;
pub mod literal;
pub mod sat;
pub mod solver;
pub mod stats;

pub use crate::circuit::Circuit;
pub use crate::literal::{GateKind, Lit, NodeId, QbfResult, Quantifier};
pub use crate::solver::{Solver, SolverOptions};
