//! Restricted boolean expressions over a flat approval context.
//!
//! Expressions are tokenized and parsed into a small AST before evaluation:
//!
//! ```text
//! #amount >= 300000
//! #expense_codes:ENTN,EQUM
//! #amount > 50000 && (#department == sales || !#pre_approved)
//! ```
//!
//! A blank expression means "no condition" and always holds. Nothing here ever
//! executes host code; unknown syntax is a [`ConditionParseError`].

mod lexer;
mod parser;

use std::collections::BTreeMap;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use lexer::{tokenize, CompareOp};
use parser::{parse_tokens, Expr, Literal};

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ConditionParseError {
    #[error("unexpected character `{ch}` at {position}")]
    UnexpectedCharacter { ch: char, position: usize },
    #[error("unterminated string literal starting at {position}")]
    UnterminatedString { position: usize },
    #[error("`#` at {position} must be followed by a field name")]
    EmptyFieldName { position: usize },
    #[error("invalid number `{raw}` at {position}")]
    InvalidNumber { raw: String, position: usize },
    #[error("unexpected {found} at {position}")]
    UnexpectedToken { found: String, position: usize },
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("membership test on `#{field}` needs at least one code")]
    EmptyMembershipList { field: String },
    #[error("ordering comparison on `#{field}` at {position} requires a numeric literal")]
    NonNumericOrdering { field: String, position: usize },
    #[error("expression nests deeper than {limit} levels")]
    TooDeeplyNested { limit: usize },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContextValue {
    Bool(bool),
    Number(Decimal),
    Text(String),
    List(Vec<String>),
}

impl ContextValue {
    fn as_number(&self) -> Option<Decimal> {
        match self {
            Self::Number(value) => Some(*value),
            Self::Text(raw) => Decimal::from_str(raw.trim()).ok(),
            _ => None,
        }
    }

    fn is_truthy(&self) -> bool {
        match self {
            Self::Bool(value) => *value,
            Self::Number(value) => !value.is_zero(),
            Self::Text(value) => !value.trim().is_empty(),
            Self::List(values) => !values.is_empty(),
        }
    }
}

/// Flat key/value snapshot of an approvable, supplied by the caller before
/// every rule evaluation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalContext {
    values: BTreeMap<String, ContextValue>,
}

impl ApprovalContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_number(mut self, key: impl Into<String>, value: impl Into<Decimal>) -> Self {
        self.values.insert(key.into(), ContextValue::Number(value.into()));
        self
    }

    pub fn with_text(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), ContextValue::Text(value.into()));
        self
    }

    pub fn with_flag(mut self, key: impl Into<String>, value: bool) -> Self {
        self.values.insert(key.into(), ContextValue::Bool(value));
        self
    }

    pub fn with_list<I, S>(mut self, key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.values
            .insert(key.into(), ContextValue::List(values.into_iter().map(Into::into).collect()));
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: ContextValue) {
        self.values.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&ContextValue> {
        self.values.get(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Builds a context from a flat JSON object. Nested objects and nulls are
    /// ignored; array elements are stringified.
    pub fn from_json(value: &serde_json::Value) -> Self {
        let mut context = Self::default();
        let Some(object) = value.as_object() else {
            return context;
        };

        for (key, value) in object {
            let converted = match value {
                serde_json::Value::Bool(flag) => Some(ContextValue::Bool(*flag)),
                serde_json::Value::Number(number) => {
                    Decimal::from_str(&number.to_string()).ok().map(ContextValue::Number)
                }
                serde_json::Value::String(text) => Some(ContextValue::Text(text.clone())),
                serde_json::Value::Array(items) => Some(ContextValue::List(
                    items
                        .iter()
                        .filter_map(|item| match item {
                            serde_json::Value::String(text) => Some(text.clone()),
                            serde_json::Value::Number(number) => Some(number.to_string()),
                            serde_json::Value::Bool(flag) => Some(flag.to_string()),
                            _ => None,
                        })
                        .collect(),
                )),
                serde_json::Value::Null | serde_json::Value::Object(_) => None,
            };
            if let Some(converted) = converted {
                context.values.insert(key.clone(), converted);
            }
        }

        context
    }
}

/// A parsed condition, ready to evaluate against any number of contexts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Condition {
    expr: Option<Expr>,
}

impl Condition {
    pub fn parse(expression: &str) -> Result<Self, ConditionParseError> {
        if expression.trim().is_empty() {
            return Ok(Self::always());
        }
        let tokens = tokenize(expression)?;
        Ok(Self { expr: Some(parse_tokens(&tokens)?) })
    }

    pub fn always() -> Self {
        Self { expr: None }
    }

    pub fn is_unconditional(&self) -> bool {
        self.expr.is_none()
    }

    pub fn evaluate(&self, context: &ApprovalContext) -> bool {
        match &self.expr {
            None => true,
            Some(expr) => eval(expr, context),
        }
    }
}

/// Parses and evaluates `expression` against `context` in one step.
pub fn evaluate(expression: &str, context: &ApprovalContext) -> Result<bool, ConditionParseError> {
    Ok(Condition::parse(expression)?.evaluate(context))
}

fn eval(expr: &Expr, context: &ApprovalContext) -> bool {
    match expr {
        Expr::Const(value) => *value,
        Expr::Truthy(field) => context.get(field).is_some_and(ContextValue::is_truthy),
        Expr::Not(inner) => !eval(inner, context),
        Expr::And(terms) => terms.iter().all(|term| eval(term, context)),
        Expr::Or(terms) => terms.iter().any(|term| eval(term, context)),
        Expr::AnyOf { field, codes } => match context.get(field) {
            Some(ContextValue::List(present)) => {
                codes.iter().any(|code| present.iter().any(|value| value == code))
            }
            Some(ContextValue::Text(value)) => codes.iter().any(|code| code == value),
            _ => false,
        },
        Expr::Compare { field, op, value } => match context.get(field) {
            Some(actual) => compare(actual, op, value),
            None => false,
        },
    }
}

fn compare(actual: &ContextValue, op: &CompareOp, expected: &Literal) -> bool {
    match expected {
        Literal::Number(expected) => {
            let Some(actual) = actual.as_number() else {
                return false;
            };
            match op {
                CompareOp::Gt => actual > *expected,
                CompareOp::Ge => actual >= *expected,
                CompareOp::Lt => actual < *expected,
                CompareOp::Le => actual <= *expected,
                CompareOp::Eq => actual == *expected,
                CompareOp::Ne => actual != *expected,
            }
        }
        Literal::Text(expected) => {
            let ContextValue::Text(actual) = actual else {
                return false;
            };
            match op {
                CompareOp::Eq => actual == expected,
                CompareOp::Ne => actual != expected,
                _ => false,
            }
        }
        Literal::Bool(expected) => {
            let ContextValue::Bool(actual) = actual else {
                return false;
            };
            match op {
                CompareOp::Eq => actual == expected,
                CompareOp::Ne => actual != expected,
                _ => false,
            }
        }
    }
}
