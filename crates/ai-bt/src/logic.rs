#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Prefix-notation boolean expression over the decorators of one child edge.
///
/// `Test(i)` reads decorator `i` of the edge, `And(n)` / `Or(n)` combine the next `n`
/// sub-expressions, `Not` negates the next one. An empty expression means "all decorators pass".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DecoratorLogic {
    Test(usize),
    And(usize),
    Or(usize),
    Not,
}

impl DecoratorLogic {
    /// True when `ops` is exactly one well-formed expression over `decorator_count` decorators.
    pub fn validate(ops: &[DecoratorLogic], decorator_count: usize) -> bool {
        if ops.is_empty() {
            return true;
        }
        matches!(parse(ops, 0, decorator_count), Some(end) if end == ops.len())
    }

    /// Evaluates `ops` against per-decorator results.
    ///
    /// Malformed expressions evaluate as the plain conjunction of `results`.
    pub fn evaluate(ops: &[DecoratorLogic], results: &[bool]) -> bool {
        if ops.is_empty() || !Self::validate(ops, results.len()) {
            return results.iter().all(|r| *r);
        }
        eval(ops, 0, results).0
    }

    /// Combines an edge's own expression with the root decorators injected from a subtree.
    ///
    /// The result is the conjunction of both sides; injected tests are shifted past the
    /// `existing_count` own decorators.
    pub fn merge_injected(
        existing: &[DecoratorLogic],
        existing_count: usize,
        injected: &[DecoratorLogic],
        injected_count: usize,
    ) -> Vec<DecoratorLogic> {
        if existing.is_empty() && injected.is_empty() {
            return Vec::new();
        }
        if injected_count == 0 {
            return existing.to_vec();
        }
        if existing_count == 0 {
            return shifted(injected, injected_count, 0);
        }

        let mut merged = vec![DecoratorLogic::And(2)];
        merged.extend(shifted(existing, existing_count, 0));
        merged.extend(shifted(injected, injected_count, existing_count));
        merged
    }
}

fn shifted(ops: &[DecoratorLogic], count: usize, offset: usize) -> Vec<DecoratorLogic> {
    if ops.is_empty() {
        let mut all = Vec::with_capacity(count + 1);
        all.push(DecoratorLogic::And(count));
        all.extend((0..count).map(|i| DecoratorLogic::Test(i + offset)));
        return all;
    }
    ops.iter()
        .map(|op| match op {
            DecoratorLogic::Test(i) => DecoratorLogic::Test(i + offset),
            other => *other,
        })
        .collect()
}

fn parse(ops: &[DecoratorLogic], pos: usize, count: usize) -> Option<usize> {
    match *ops.get(pos)? {
        DecoratorLogic::Test(i) => (i < count).then_some(pos + 1),
        DecoratorLogic::Not => parse(ops, pos + 1, count),
        DecoratorLogic::And(n) | DecoratorLogic::Or(n) => {
            let mut next = pos + 1;
            for _ in 0..n {
                next = parse(ops, next, count)?;
            }
            Some(next)
        }
    }
}

fn eval(ops: &[DecoratorLogic], pos: usize, results: &[bool]) -> (bool, usize) {
    match ops[pos] {
        DecoratorLogic::Test(i) => (results[i], pos + 1),
        DecoratorLogic::Not => {
            let (value, next) = eval(ops, pos + 1, results);
            (!value, next)
        }
        DecoratorLogic::And(n) => {
            let mut value = true;
            let mut next = pos + 1;
            for _ in 0..n {
                let (v, after) = eval(ops, next, results);
                value &= v;
                next = after;
            }
            (value, next)
        }
        DecoratorLogic::Or(n) => {
            let mut value = false;
            let mut next = pos + 1;
            for _ in 0..n {
                let (v, after) = eval(ops, next, results);
                value |= v;
                next = after;
            }
            (value, next)
        }
    }
}
