//! Snapshot query description
//!
//! A `Query` is what a realtime service hands to its gateway when fetching a
//! snapshot: an optional column filter plus the entity's default ordering.
//! The same `SnapshotFilter` is evaluated locally by sync bindings so that
//! pushed records outside a filtered view do not leak into it.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Sort key for snapshot queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderBy {
    pub column: &'static str,
    pub ascending: bool,
}

impl OrderBy {
    pub const fn asc(column: &'static str) -> Self {
        Self {
            column,
            ascending: true,
        }
    }

    pub const fn desc(column: &'static str) -> Self {
        Self {
            column,
            ascending: false,
        }
    }

    /// Render as a PostgREST `order` clause (`name.asc`)
    pub fn to_clause(&self) -> String {
        let direction = if self.ascending { "asc" } else { "desc" };
        format!("{}.{}", self.column, direction)
    }

    /// Compare two rows by this key
    ///
    /// Missing or null values sort last regardless of direction.
    pub fn compare(&self, a: &Value, b: &Value) -> Ordering {
        let left = a.get(self.column).filter(|v| !v.is_null());
        let right = b.get(self.column).filter(|v| !v.is_null());
        match (left, right) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(l), Some(r)) => {
                let ordering = compare_values(l, r);
                if self.ascending {
                    ordering
                } else {
                    ordering.reverse()
                }
            }
        }
    }
}

/// Conjunction of column equality predicates
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotFilter {
    conditions: Vec<(String, Value)>,
}

impl SnapshotFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to rows owned by an agency
    pub fn agency(agency: impl Into<String>) -> Self {
        Self::new().eq("agency", agency.into())
    }

    /// Add a `column = value` predicate
    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push((column.into(), value.into()));
        self
    }

    pub fn conditions(&self) -> &[(String, Value)] {
        &self.conditions
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Evaluate against a JSON row
    pub fn matches(&self, row: &Value) -> bool {
        self.conditions
            .iter()
            .all(|(column, expected)| row.get(column).is_some_and(|actual| loose_eq(actual, expected)))
    }

    /// Evaluate against a typed record
    pub fn matches_record<T: Serialize>(&self, record: &T) -> bool {
        if self.is_empty() {
            return true;
        }
        match serde_json::to_value(record) {
            Ok(row) => self.matches(&row),
            Err(_) => false,
        }
    }
}

/// Snapshot request sent to a gateway
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub filter: Option<SnapshotFilter>,
    pub order: Option<OrderBy>,
}

impl Query {
    pub fn new(filter: Option<SnapshotFilter>, order: OrderBy) -> Self {
        Self {
            filter,
            order: Some(order),
        }
    }

    /// Unfiltered, unordered query
    pub fn all() -> Self {
        Self {
            filter: None,
            order: None,
        }
    }

    pub fn matches(&self, row: &Value) -> bool {
        self.filter.as_ref().map_or(true, |f| f.matches(row))
    }
}

/// Render a filter value the way PostgREST expects after `eq.`
pub fn filter_literal(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

// Gateways may hand back numbers where a filter was written as a string
// (or the reverse), so compare on the rendered literal.
fn loose_eq(actual: &Value, expected: &Value) -> bool {
    actual == expected || filter_literal(actual) == filter_literal(expected)
}

pub(crate) fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(l), Value::Number(r)) => {
            let l = l.as_f64().unwrap_or(f64::NAN);
            let r = r.as_f64().unwrap_or(f64::NAN);
            l.partial_cmp(&r).unwrap_or(Ordering::Equal)
        }
        (Value::String(l), Value::String(r)) => l.cmp(r),
        (Value::Bool(l), Value::Bool(r)) => l.cmp(r),
        _ => filter_literal(a).cmp(&filter_literal(b)),
    }
}
