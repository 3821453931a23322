//! Readiness predicates.
//!
//! Manifests declare readiness through `eno.azure.io/readiness[-<name>]`
//! annotations holding a small CEL-like expression. The language here is a
//! deliberately tiny subset — the evaluator is a seam, not a commitment:
//! anything that can compile an expression string into something satisfying
//! [`Predicate`] can replace it.
//!
//! Supported forms:
//!   - `true` / `false`
//!   - `condition(Ready)` — true when `status.conditions` contains an entry
//!     with `type == "Ready"` and `status == "True"`
//!   - `<operand> <op> <operand>` with ops `== != < <= > >=`, where an
//!     operand is a `self.`-rooted path or a string/number/bool literal
//!   - clauses joined with `&&`
//!
//! Evaluation errors (missing path, type mismatch) mean "not ready", never
//! an error surfaced to the caller.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty expression")]
    Empty,
    #[error("expected comparison operator in clause {0:?}")]
    MissingOperator(String),
    #[error("invalid operand {0:?}")]
    InvalidOperand(String),
    #[error("unterminated string literal in {0:?}")]
    UnterminatedString(String),
}

/// Anything that can be asked "is this live object ready".
pub trait Predicate: Send + Sync + std::fmt::Debug {
    fn eval(&self, obj: &Value) -> bool;
}

/// A named, compiled readiness check.
#[derive(Debug, Clone, PartialEq)]
pub struct Check {
    pub name: String,
    pub expr: String,
    compiled: Expr,
}

impl Check {
    pub fn parse(expr: &str) -> Result<Self, ParseError> {
        Ok(Self { name: String::new(), expr: expr.to_string(), compiled: Expr::parse(expr)? })
    }

    pub fn eval(&self, obj: &Value) -> bool {
        self.compiled.eval(obj)
    }
}

impl Predicate for Check {
    fn eval(&self, obj: &Value) -> bool {
        Check::eval(self, obj)
    }
}

/// True iff every check passes. An empty set means a resource is ready as
/// soon as it exists.
pub fn all_ready(checks: &[Check], obj: &Value) -> bool {
    checks.iter().all(|c| c.eval(obj))
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    And(Vec<Clause>),
}

#[derive(Debug, Clone, PartialEq)]
enum Clause {
    Literal(bool),
    Condition(String),
    Compare { left: Operand, op: Op, right: Operand },
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Path(Vec<String>),
    Literal(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Expr {
    fn parse(input: &str) -> Result<Self, ParseError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(ParseError::Empty);
        }
        let clauses = input
            .split("&&")
            .map(|c| Clause::parse(c.trim()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Expr::And(clauses))
    }

    fn eval(&self, obj: &Value) -> bool {
        let Expr::And(clauses) = self;
        clauses.iter().all(|c| c.eval(obj))
    }
}

impl Clause {
    fn parse(input: &str) -> Result<Self, ParseError> {
        if input.is_empty() {
            return Err(ParseError::Empty);
        }
        match input {
            "true" => return Ok(Clause::Literal(true)),
            "false" => return Ok(Clause::Literal(false)),
            _ => {}
        }
        if let Some(rest) = input.strip_prefix("condition(") {
            let name = rest
                .strip_suffix(')')
                .ok_or_else(|| ParseError::InvalidOperand(input.to_string()))?
                .trim()
                .trim_matches('\'')
                .trim_matches('"');
            if name.is_empty() {
                return Err(ParseError::InvalidOperand(input.to_string()));
            }
            return Ok(Clause::Condition(name.to_string()));
        }

        // Longest operators first so `<=` is not read as `<`.
        for (tok, op) in [
            ("==", Op::Eq),
            ("!=", Op::Ne),
            ("<=", Op::Le),
            (">=", Op::Ge),
            ("<", Op::Lt),
            (">", Op::Gt),
        ] {
            if let Some((l, r)) = input.split_once(tok) {
                return Ok(Clause::Compare {
                    left: Operand::parse(l.trim())?,
                    op,
                    right: Operand::parse(r.trim())?,
                });
            }
        }
        Err(ParseError::MissingOperator(input.to_string()))
    }

    fn eval(&self, obj: &Value) -> bool {
        match self {
            Clause::Literal(b) => *b,
            Clause::Condition(name) => condition_true(obj, name),
            Clause::Compare { left, op, right } => {
                let (Some(l), Some(r)) = (left.resolve(obj), right.resolve(obj)) else {
                    return false;
                };
                compare(&l, *op, &r).unwrap_or(false)
            }
        }
    }
}

impl Operand {
    fn parse(input: &str) -> Result<Self, ParseError> {
        if input.is_empty() {
            return Err(ParseError::InvalidOperand(input.to_string()));
        }
        if let Some(rest) = input.strip_prefix("self.") {
            let segments: Vec<String> = rest.split('.').map(|s| s.to_string()).collect();
            if segments.iter().any(|s| s.is_empty()) {
                return Err(ParseError::InvalidOperand(input.to_string()));
            }
            return Ok(Operand::Path(segments));
        }
        if let Some(stripped) = input.strip_prefix('\'') {
            let s = stripped
                .strip_suffix('\'')
                .ok_or_else(|| ParseError::UnterminatedString(input.to_string()))?;
            return Ok(Operand::Literal(Value::String(s.to_string())));
        }
        if let Some(stripped) = input.strip_prefix('"') {
            let s = stripped
                .strip_suffix('"')
                .ok_or_else(|| ParseError::UnterminatedString(input.to_string()))?;
            return Ok(Operand::Literal(Value::String(s.to_string())));
        }
        match input {
            "true" => return Ok(Operand::Literal(Value::Bool(true))),
            "false" => return Ok(Operand::Literal(Value::Bool(false))),
            _ => {}
        }
        if let Ok(n) = input.parse::<f64>() {
            let num = serde_json::Number::from_f64(n)
                .ok_or_else(|| ParseError::InvalidOperand(input.to_string()))?;
            return Ok(Operand::Literal(Value::Number(num)));
        }
        Err(ParseError::InvalidOperand(input.to_string()))
    }

    fn resolve(&self, obj: &Value) -> Option<Value> {
        match self {
            Operand::Literal(v) => Some(v.clone()),
            Operand::Path(segments) => {
                let mut cur = obj;
                for seg in segments {
                    cur = cur.get(seg)?;
                }
                Some(cur.clone())
            }
        }
    }
}

fn compare(l: &Value, op: Op, r: &Value) -> Option<bool> {
    match op {
        Op::Eq => Some(loose_eq(l, r)),
        Op::Ne => Some(!loose_eq(l, r)),
        _ => {
            let (a, b) = (l.as_f64()?, r.as_f64()?);
            Some(match op {
                Op::Lt => a < b,
                Op::Le => a <= b,
                Op::Gt => a > b,
                Op::Ge => a >= b,
                Op::Eq | Op::Ne => unreachable!(),
            })
        }
    }
}

// Numbers compare numerically regardless of integer/float representation.
fn loose_eq(l: &Value, r: &Value) -> bool {
    match (l.as_f64(), r.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => l == r,
    }
}

fn condition_true(obj: &Value, name: &str) -> bool {
    let Some(conditions) = obj.pointer("/status/conditions").and_then(|c| c.as_array()) else {
        return false;
    };
    conditions.iter().any(|c| {
        c.get("type").and_then(|t| t.as_str()) == Some(name)
            && c.get("status").and_then(|s| s.as_str()) == Some("True")
    })
}
