//! Expression evaluation.

use crate::{BinaryOperator, Expr, Literal};
use std::cmp::Ordering;
use thiserror::Error;

/// A runtime value. Field lookups that miss resolve to [`Value::Null`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
}

impl Value {
    /// Truthiness: booleans stand for themselves, numbers are true when
    /// non-zero, strings parse as booleans (anything but a
    /// case-insensitive `true` is false), null is false.
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Bool(b) => *b,
            Self::Number(n) => *n != 0.0,
            Self::Str(s) => s.eq_ignore_ascii_case("true"),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::Str(_) => "string",
        }
    }

    /// Numeric view, coercing numeric strings.
    fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// A per-record field source.
pub trait EvalContext {
    /// Resolve a dotted path. Missing fields are [`Value::Null`].
    fn field(&self, path: &[String]) -> Value;
}

/// Evaluation failures. These exclude the single record being
/// evaluated, never the whole batch.
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("cannot order {lhs} against {rhs}")]
    NotOrderable {
        lhs: &'static str,
        rhs: &'static str,
    },
}

pub(crate) fn evaluate(expr: &Expr, context: &dyn EvalContext) -> Result<Value, EvalError> {
    Ok(match expr {
        Expr::Literal(l) => literal_value(l),
        Expr::FieldRef(path) => context.field(path),
        Expr::Not(inner) => Value::Bool(!evaluate(inner, context)?.is_truthy()),
        Expr::Binary { lhs, op, rhs } => match op {
            BinaryOperator::And => {
                let lhs = evaluate(lhs, context)?;
                if !lhs.is_truthy() {
                    Value::Bool(false)
                } else {
                    Value::Bool(evaluate(rhs, context)?.is_truthy())
                }
            }
            BinaryOperator::Or => {
                let lhs = evaluate(lhs, context)?;
                if lhs.is_truthy() {
                    Value::Bool(true)
                } else {
                    Value::Bool(evaluate(rhs, context)?.is_truthy())
                }
            }
            BinaryOperator::Eq => {
                Value::Bool(values_equal(&evaluate(lhs, context)?, &evaluate(rhs, context)?))
            }
            BinaryOperator::NotEq => {
                Value::Bool(!values_equal(&evaluate(lhs, context)?, &evaluate(rhs, context)?))
            }
            BinaryOperator::Lt | BinaryOperator::LtEq | BinaryOperator::Gt
            | BinaryOperator::GtEq => {
                let ordering = order_values(&evaluate(lhs, context)?, &evaluate(rhs, context)?)?;
                Value::Bool(match op {
                    BinaryOperator::Lt => ordering == Ordering::Less,
                    BinaryOperator::LtEq => ordering != Ordering::Greater,
                    BinaryOperator::Gt => ordering == Ordering::Greater,
                    BinaryOperator::GtEq => ordering != Ordering::Less,
                    _ => unreachable!(),
                })
            }
        },
    })
}

fn literal_value(literal: &Literal) -> Value {
    match literal {
        Literal::Null => Value::Null,
        Literal::Bool(b) => Value::Bool(*b),
        Literal::Number(n) => Value::Number(*n),
        Literal::String(s) => Value::Str(s.clone()),
    }
}

/// Equality with numeric coercion for string/number pairs. Mismatched
/// kinds are unequal rather than an error.
fn values_equal(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(l), Value::Bool(r)) => l == r,
        (Value::Str(l), Value::Str(r)) => l == r,
        (Value::Number(_), _) | (_, Value::Number(_)) => {
            match (lhs.as_number(), rhs.as_number()) {
                (Some(l), Some(r)) => l == r,
                _ => false,
            }
        }
        _ => false,
    }
}

/// Ordering: numbers (with numeric-string coercion) or two strings.
/// Anything else, including null, is not orderable.
fn order_values(lhs: &Value, rhs: &Value) -> Result<Ordering, EvalError> {
    if let (Value::Str(l), Value::Str(r)) = (lhs, rhs) {
        return Ok(l.cmp(r));
    }
    match (lhs.as_number(), rhs.as_number()) {
        (Some(l), Some(r)) => l.partial_cmp(&r).ok_or(EvalError::NotOrderable {
            lhs: lhs.kind(),
            rhs: rhs.kind(),
        }),
        _ => Err(EvalError::NotOrderable {
            lhs: lhs.kind(),
            rhs: rhs.kind(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(Value::Bool(true).is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(Value::Number(-1.0).is_truthy());
        assert!(!Value::Number(0.0).is_truthy());
        assert!(Value::Str("True".into()).is_truthy());
        assert!(!Value::Str("yes".into()).is_truthy());
    }

    #[test]
    fn test_equality_coercion() {
        assert!(values_equal(&Value::Number(12.0), &Value::Str("12".into())));
        assert!(!values_equal(&Value::Number(12.0), &Value::Str("x".into())));
        assert!(!values_equal(&Value::Bool(true), &Value::Str("true".into())));
        assert!(values_equal(&Value::Null, &Value::Null));
        assert!(!values_equal(&Value::Null, &Value::Number(0.0)));
    }

    #[test]
    fn test_ordering() {
        assert_eq!(
            order_values(&Value::Number(1.0), &Value::Number(2.0)).unwrap(),
            Ordering::Less
        );
        assert_eq!(
            order_values(&Value::Str("b".into()), &Value::Str("a".into())).unwrap(),
            Ordering::Greater
        );
        assert!(order_values(&Value::Null, &Value::Number(1.0)).is_err());
        assert!(order_values(&Value::Bool(true), &Value::Bool(false)).is_err());
    }
}
