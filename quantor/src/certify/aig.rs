//! In-memory And-Inverter-Graphs and the ASCII `aag` writer used for
//! certificates.
//!
//! Literals follow the AIGER convention: variable `v` is literal `2v`, its
//! negation `2v + 1`; `0` is constant false and `1` constant true.

use std::io::{self, Write};

use hashbrown::HashMap;
use quantor_util::IntQueue;

pub const AIG_FALSE: u32 = 0;
pub const AIG_TRUE: u32 = 1;

#[inline]
pub fn aig_not(lit: u32) -> u32 {
    lit ^ 1
}

#[inline]
pub fn aig_strip(lit: u32) -> u32 {
    lit & !1
}

#[derive(Clone, Debug, Default)]
pub struct Aig {
    inputs: Vec<(u32, String)>,
    outputs: Vec<(u32, String)>,
    /// AND gates keyed by their (even) left-hand side.
    ands: HashMap<u32, (u32, u32)>,
    comments: Vec<String>,
}

impl Aig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_input(&mut self, lit: u32, symbol: &str) {
        debug_assert!(lit > AIG_TRUE && lit % 2 == 0);
        self.inputs.push((lit, symbol.to_string()));
    }

    pub fn add_output(&mut self, lit: u32, symbol: &str) {
        self.outputs.push((lit, symbol.to_string()));
    }

    pub fn add_and(&mut self, lhs: u32, rhs0: u32, rhs1: u32) {
        debug_assert!(lhs % 2 == 0 && lhs > AIG_TRUE);
        debug_assert!(!self.ands.contains_key(&lhs), "gate {lhs} defined twice");
        self.ands.insert(lhs, (rhs0, rhs1));
    }

    pub fn add_comment(&mut self, comment: &str) {
        self.comments.push(comment.to_string());
    }

    pub fn inputs(&self) -> &[(u32, String)] {
        self.inputs.as_slice()
    }

    pub fn outputs(&self) -> &[(u32, String)] {
        self.outputs.as_slice()
    }

    /// Evaluates every output under the given assignment of input literals
    /// (keyed by the stripped input literal).
    pub fn evaluate(&self, input_values: &HashMap<u32, bool>) -> Vec<bool> {
        let mut cache: HashMap<u32, bool> = HashMap::new();
        self.outputs
            .iter()
            .map(|&(lit, _)| self.eval_lit(lit, input_values, &mut cache))
            .collect()
    }

    fn eval_lit(
        &self,
        lit: u32,
        input_values: &HashMap<u32, bool>,
        cache: &mut HashMap<u32, bool>,
    ) -> bool {
        let stripped = aig_strip(lit);
        let negated = lit & 1 == 1;
        let value = if stripped == AIG_FALSE {
            false
        } else if let Some(&value) = cache.get(&stripped) {
            value
        } else if let Some(&value) = input_values.get(&stripped) {
            value
        } else {
            let &(rhs0, rhs1) = self
                .ands
                .get(&stripped)
                .unwrap_or_else(|| panic!("undefined literal {stripped} in certificate"));
            let value = self.eval_lit(rhs0, input_values, cache)
                && self.eval_lit(rhs1, input_values, cache);
            cache.insert(stripped, value);
            value
        };
        value != negated
    }

    fn map_lit(&self, lit: u32, mapping: &mut HashMap<u32, u32>, emitted: &mut Vec<(u32, u32, u32)>, next: &mut u32) -> u32 {
        let stripped = aig_strip(lit);
        let negated = lit & 1;
        if stripped == AIG_FALSE {
            return lit;
        }
        if let Some(&mapped) = mapping.get(&stripped) {
            return mapped | negated;
        }
        let &(rhs0, rhs1) = self
            .ands
            .get(&stripped)
            .unwrap_or_else(|| panic!("undefined literal {stripped} in certificate"));
        let new_rhs0 = self.map_lit(rhs0, mapping, emitted, next);
        let new_rhs1 = self.map_lit(rhs1, mapping, emitted, next);
        let lhs = *next;
        *next += 2;
        mapping.insert(stripped, lhs);
        emitted.push((lhs, new_rhs0.max(new_rhs1), new_rhs0.min(new_rhs1)));
        lhs | negated
    }

    /// Writes the network in ASCII AIGER format. Literals are renumbered
    /// compactly (inputs first, AND gates in dependency order restricted to
    /// the cone of the outputs), so that `lhs > rhs0 >= rhs1` holds for
    /// every gate line.
    pub fn write_ascii<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let mut mapping: HashMap<u32, u32> = HashMap::new();
        let mut next: u32 = 2;
        for &(lit, _) in &self.inputs {
            mapping.insert(aig_strip(lit), next);
            next += 2;
        }

        let mut emitted: Vec<(u32, u32, u32)> = Vec::new();
        let outputs: Vec<u32> = self
            .outputs
            .iter()
            .map(|&(lit, _)| self.map_lit(lit, &mut mapping, &mut emitted, &mut next))
            .collect();

        let max_var = (next - 2) / 2;
        writeln!(
            writer,
            "aag {} {} 0 {} {}",
            max_var,
            self.inputs.len(),
            outputs.len(),
            emitted.len()
        )?;
        for (index, _) in self.inputs.iter().enumerate() {
            writeln!(writer, "{}", (index as u32 + 1) * 2)?;
        }
        for lit in &outputs {
            writeln!(writer, "{lit}")?;
        }
        for (lhs, rhs0, rhs1) in &emitted {
            writeln!(writer, "{lhs} {rhs0} {rhs1}")?;
        }
        for (index, (_, symbol)) in self.inputs.iter().enumerate() {
            writeln!(writer, "i{index} {symbol}")?;
        }
        for (index, (_, symbol)) in self.outputs.iter().enumerate() {
            writeln!(writer, "o{index} {symbol}")?;
        }
        if !self.comments.is_empty() {
            writeln!(writer, "c")?;
            for comment in &self.comments {
                writeln!(writer, "{comment}")?;
            }
        }
        Ok(())
    }
}

/// Encodes the conjunction of the queued literals into `dest` (an even
/// literal), reducing the queue pairwise through fresh gates.
pub(crate) fn encode_and_as(aig: &mut Aig, next_var: &mut u32, lits: &mut IntQueue, dest: u32) {
    while lits.len() > 2 {
        let lhs = lits.pop().unwrap();
        let rhs = lits.pop().unwrap();
        *next_var += 1;
        let new_lit = *next_var * 2;
        aig.add_and(new_lit, lhs, rhs);
        lits.push(new_lit);
    }
    let lhs = lits.pop().unwrap_or(AIG_TRUE);
    let rhs = lits.pop().unwrap_or(AIG_TRUE);
    aig.add_and(aig_strip(dest), lhs, rhs);
}

/// Encodes the disjunction of the queued literals into `dest`.
pub(crate) fn encode_or_as(aig: &mut Aig, next_var: &mut u32, lits: &mut IntQueue, dest: u32) {
    lits.map_in_place(aig_not);
    encode_and_as(aig, next_var, lits, dest);
}

/// Encodes the conjunction of the queued literals into a fresh literal and
/// returns it.
pub(crate) fn encode_and(aig: &mut Aig, next_var: &mut u32, lits: &mut IntQueue) -> u32 {
    if lits.len() < 2 {
        return lits.pop().unwrap_or(AIG_TRUE);
    }
    while lits.len() > 2 {
        let lhs = lits.pop().unwrap();
        let rhs = lits.pop().unwrap();
        *next_var += 1;
        let new_lit = *next_var * 2;
        aig.add_and(new_lit, lhs, rhs);
        lits.push(new_lit);
    }
    let lhs = lits.pop().unwrap_or(AIG_TRUE);
    let rhs = lits.pop().unwrap_or(AIG_TRUE);
    *next_var += 1;
    let result = *next_var * 2;
    aig.add_and(result, lhs, rhs);
    result
}

/// Encodes the disjunction of the queued literals into a fresh literal and
/// returns it.
pub(crate) fn encode_or(aig: &mut Aig, next_var: &mut u32, lits: &mut IntQueue) -> u32 {
    lits.map_in_place(aig_not);
    aig_not(encode_and(aig, next_var, lits))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evaluate_small_network() {
        // out = x AND NOT y
        let mut aig = Aig::new();
        aig.add_input(2, "x");
        aig.add_input(4, "y");
        aig.add_and(6, 2, 5);
        aig.add_output(6, "out");

        let mut env = HashMap::new();
        env.insert(2, true);
        env.insert(4, false);
        assert_eq!(aig.evaluate(&env), vec![true]);
        env.insert(4, true);
        assert_eq!(aig.evaluate(&env), vec![false]);
    }

    #[test]
    fn test_encode_and_over_queue() {
        let mut aig = Aig::new();
        aig.add_input(2, "a");
        aig.add_input(4, "b");
        aig.add_input(6, "c");
        let mut next_var = 100;
        let mut queue = IntQueue::new();
        queue.push(2);
        queue.push(4);
        queue.push(7);
        let result = encode_and(&mut aig, &mut next_var, &mut queue);
        aig.add_output(result, "and");

        for a in [false, true] {
            for b in [false, true] {
                for c in [false, true] {
                    let mut env = HashMap::new();
                    env.insert(2, a);
                    env.insert(4, b);
                    env.insert(6, c);
                    assert_eq!(aig.evaluate(&env), vec![a && b && !c]);
                }
            }
        }
    }

    #[test]
    fn test_empty_conjunction_is_true() {
        let mut aig = Aig::new();
        let mut next_var = 10;
        let mut queue = IntQueue::new();
        assert_eq!(encode_and(&mut aig, &mut next_var, &mut queue), AIG_TRUE);
        assert_eq!(encode_or(&mut aig, &mut next_var, &mut queue), AIG_FALSE);
    }

    #[test]
    fn test_ascii_writer_renumbers_topologically() {
        let mut aig = Aig::new();
        aig.add_input(40, "x");
        aig.add_and(90, 41, 1);
        aig.add_output(91, "out");
        let mut buffer = Vec::new();
        aig.write_ascii(&mut buffer).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("aag 2 1 0 1 1"));
        assert_eq!(lines.next(), Some("2"));
        assert_eq!(lines.next(), Some("5"));
        assert_eq!(lines.next(), Some("4 3 1"));
        assert_eq!(lines.next(), Some("i0 x"));
        assert_eq!(lines.next(), Some("o0 out"));
    }
}
