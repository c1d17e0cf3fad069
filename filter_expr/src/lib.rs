//! Record-filter expressions.
//!
//! An expression is compiled once at startup and shared across shards
//! (the compiled form is immutable, so it is thread-safe by
//! construction). Evaluation happens per record against an
//! [`EvalContext`] exposing dotted field paths such as
//! `metadata.operation` or `newImage.price`; missing fields resolve to
//! null.
//!
//! ```
//! use filter_expr::{EvalContext, FilterExpression, Value};
//!
//! struct Ctx;
//! impl EvalContext for Ctx {
//!     fn field(&self, path: &[String]) -> Value {
//!         match path.join(".").as_str() {
//!             "metadata.operation" => Value::Str("INSERT".into()),
//!             "newImage.n" => Value::Number(10.0),
//!             _ => Value::Null,
//!         }
//!     }
//! }
//!
//! let expr =
//!     FilterExpression::compile("metadata.operation == 'INSERT' && newImage.n > 5").unwrap();
//! assert!(expr.matches(&Ctx));
//! ```

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod eval;
mod parse;

pub use eval::{EvalContext, EvalError, Value};

use observability_deps::tracing::warn;
use thiserror::Error;

/// A failure to compile an expression. Fatal at startup.
#[derive(Debug, Error)]
#[error("invalid filter expression {source_text:?}: {message}")]
pub struct ParseError {
    source_text: String,
    message: String,
}

/// Comparison and logical operators, in the order the parser tries them
/// (longest match first where prefixes overlap).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    Eq,
    NotEq,
    LtEq,
    GtEq,
    Lt,
    Gt,
    And,
    Or,
}

/// A literal value appearing in an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
}

/// The expression AST.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Literal),
    /// A dotted field reference, e.g. `newImage.price`.
    FieldRef(Vec<String>),
    Not(Box<Expr>),
    Binary {
        lhs: Box<Expr>,
        op: BinaryOperator,
        rhs: Box<Expr>,
    },
}

/// A compiled filter expression.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterExpression {
    source_text: String,
    root: Expr,
}

impl FilterExpression {
    /// Compiles `source`. The whole input must parse; trailing garbage is
    /// an error.
    pub fn compile(source: &str) -> Result<Self, ParseError> {
        let root = parse::parse(source).map_err(|message| ParseError {
            source_text: source.to_string(),
            message,
        })?;
        Ok(Self {
            source_text: source.to_string(),
            root,
        })
    }

    /// The original expression text.
    pub fn source_text(&self) -> &str {
        &self.source_text
    }

    /// Evaluates to a [`Value`] without applying truthiness.
    pub fn evaluate(&self, context: &dyn EvalContext) -> Result<Value, EvalError> {
        eval::evaluate(&self.root, context)
    }

    /// Evaluates and applies truthiness: booleans stand for themselves,
    /// numbers are true when non-zero, strings parse as booleans.
    /// Evaluation errors exclude the record (return false) rather than
    /// failing the batch.
    pub fn matches(&self, context: &dyn EvalContext) -> bool {
        match self.evaluate(context) {
            Ok(value) => {
                let truthy = value.is_truthy();
                if !matches!(value, Value::Bool(_)) {
                    warn!(
                        expression = %self.source_text,
                        result = ?value,
                        "filter expression did not evaluate to a boolean",
                    );
                }
                truthy
            }
            Err(e) => {
                warn!(
                    expression = %self.source_text,
                    error = %e,
                    "filter expression evaluation failed; excluding record",
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[derive(Debug, Default)]
    struct MapContext(BTreeMap<String, Value>);

    impl MapContext {
        fn with(mut self, path: &str, value: Value) -> Self {
            self.0.insert(path.to_string(), value);
            self
        }
    }

    impl EvalContext for MapContext {
        fn field(&self, path: &[String]) -> Value {
            self.0.get(&path.join(".")).cloned().unwrap_or(Value::Null)
        }
    }

    fn insert_ctx(n: f64) -> MapContext {
        MapContext::default()
            .with("metadata.operation", Value::Str("INSERT".into()))
            .with("newImage.n", Value::Number(n))
    }

    #[test]
    fn test_operation_and_field_filter() {
        let expr =
            FilterExpression::compile("metadata.operation == 'INSERT' && newImage.n > 5")
                .unwrap();

        assert!(expr.matches(&insert_ctx(10.0)));
        assert!(!expr.matches(&insert_ctx(3.0)));
        assert!(!expr.matches(
            &MapContext::default()
                .with("metadata.operation", Value::Str("DELETE".into()))
                .with("newImage.n", Value::Number(10.0))
        ));
    }

    #[test]
    fn test_missing_fields_are_null() {
        let expr = FilterExpression::compile("newImage.absent == null").unwrap();
        assert!(expr.matches(&MapContext::default()));

        let expr = FilterExpression::compile("newImage.absent == 'x'").unwrap();
        assert!(!expr.matches(&MapContext::default()));
    }

    #[test]
    fn test_ordering_against_null_excludes_record() {
        let expr = FilterExpression::compile("newImage.absent > 5").unwrap();
        assert!(!expr.matches(&MapContext::default()));
    }

    #[test]
    fn test_truthiness() {
        let ctx = MapContext::default()
            .with("newImage.count", Value::Number(2.0))
            .with("newImage.zero", Value::Number(0.0))
            .with("newImage.yes", Value::Str("TRUE".into()))
            .with("newImage.word", Value::Str("banana".into()));

        assert!(FilterExpression::compile("newImage.count").unwrap().matches(&ctx));
        assert!(!FilterExpression::compile("newImage.zero").unwrap().matches(&ctx));
        assert!(FilterExpression::compile("newImage.yes").unwrap().matches(&ctx));
        assert!(!FilterExpression::compile("newImage.word").unwrap().matches(&ctx));
        assert!(!FilterExpression::compile("newImage.absent").unwrap().matches(&ctx));
    }

    #[test]
    fn test_logical_operators() {
        let ctx = insert_ctx(10.0);
        for (source, expected) in [
            ("true || false", true),
            ("true && false", false),
            ("!(newImage.n == 10)", false),
            ("newImage.n >= 10 && newImage.n <= 10", true),
            ("newImage.n != 10 || metadata.operation == 'INSERT'", true),
        ] {
            let expr = FilterExpression::compile(source).unwrap();
            assert_eq!(expr.matches(&ctx), expected, "expression {source:?}");
        }
    }

    #[test]
    fn test_string_number_coercion() {
        let ctx = MapContext::default().with("newImage.n", Value::Str("12".into()));
        assert!(FilterExpression::compile("newImage.n == 12").unwrap().matches(&ctx));
        assert!(FilterExpression::compile("newImage.n > 5").unwrap().matches(&ctx));
    }

    #[test]
    fn test_compile_errors() {
        assert!(FilterExpression::compile("").is_err());
        assert!(FilterExpression::compile("newImage.n >").is_err());
        assert!(FilterExpression::compile("a == 1 garbage").is_err());
        assert!(FilterExpression::compile("(a == 1").is_err());
    }
}
