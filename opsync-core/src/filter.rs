//! Secondary query filters
//!
//! A [`QueryFilter`] narrows a collection beyond its partition key (for
//! example `is_forecast = true`). The same filter drives three things: the
//! remote query string, the query-shape segment of a cache key, and local
//! matching of change-feed rows.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// Filter operator for field comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOperator {
    /// Equal to
    Eq,
    /// Not equal to
    Neq,
    /// Greater than
    Gt,
    /// Less than
    Lt,
    /// Greater than or equal
    Gte,
    /// Less than or equal
    Lte,
    /// In list of values
    In,
}

impl FilterOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Neq => "neq",
            Self::Gt => "gt",
            Self::Lt => "lt",
            Self::Gte => "gte",
            Self::Lte => "lte",
            Self::In => "in",
        }
    }
}

/// One field comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterExpr {
    /// Field to filter on
    pub field: String,
    /// Operator to apply
    pub operator: FilterOperator,
    /// Value to compare against (JSON value for flexibility)
    pub value: Value,
}

impl FilterExpr {
    pub fn new(field: impl Into<String>, operator: FilterOperator, value: Value) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
        }
    }

    /// Create an equality filter.
    pub fn eq(field: impl Into<String>, value: Value) -> Self {
        Self::new(field, FilterOperator::Eq, value)
    }

    /// Render the right-hand side of a PostgREST-style query parameter.
    pub fn query_value(&self) -> String {
        match (&self.operator, &self.value) {
            (FilterOperator::In, Value::Array(items)) => {
                let rendered: Vec<String> = items.iter().map(render_scalar).collect();
                format!("in.({})", rendered.join(","))
            }
            (op, value) => format!("{}.{}", op.as_str(), render_scalar(value)),
        }
    }

    /// Evaluate this comparison against a JSON object.
    ///
    /// A missing field only satisfies `neq`.
    pub fn matches(&self, object: &Value) -> bool {
        let Some(actual) = object.get(&self.field) else {
            return self.operator == FilterOperator::Neq;
        };
        match self.operator {
            FilterOperator::Eq => actual == &self.value,
            FilterOperator::Neq => actual != &self.value,
            FilterOperator::In => match &self.value {
                Value::Array(items) => items.contains(actual),
                other => actual == other,
            },
            FilterOperator::Gt => compare(actual, &self.value) == Some(Ordering::Greater),
            FilterOperator::Lt => compare(actual, &self.value) == Some(Ordering::Less),
            FilterOperator::Gte => matches!(
                compare(actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOperator::Lte => matches!(
                compare(actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
        }
    }
}

/// A conjunction of field comparisons. Empty means "whole partition".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryFilter {
    exprs: Vec<FilterExpr>,
}

impl QueryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, expr: FilterExpr) -> Self {
        self.exprs.push(expr);
        self
    }

    pub fn with_eq(self, field: impl Into<String>, value: Value) -> Self {
        self.with(FilterExpr::eq(field, value))
    }

    pub fn is_empty(&self) -> bool {
        self.exprs.is_empty()
    }

    pub fn exprs(&self) -> &[FilterExpr] {
        &self.exprs
    }

    /// Query parameters for the remote call, in a stable order.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = self
            .exprs
            .iter()
            .map(|expr| (expr.field.clone(), expr.query_value()))
            .collect();
        pairs.sort();
        pairs
    }

    /// Canonical encoding used as the query-shape segment of cache keys.
    ///
    /// Two filters with the same clauses in a different order share a shape.
    pub fn shape(&self) -> String {
        if self.exprs.is_empty() {
            return "all".to_string();
        }
        self.query_pairs()
            .into_iter()
            .map(|(field, value)| format!("{}={}", field, value))
            .collect::<Vec<_>>()
            .join("&")
    }

    pub fn matches(&self, object: &Value) -> bool {
        self.exprs.iter().all(|expr| expr.matches(object))
    }
}

fn render_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}
