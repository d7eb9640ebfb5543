//! Generic parameterized SELECT model.
//!
//! Stores translate a [`SelectQuery`] into their own dialect (SQL with bound
//! parameters for PostgreSQL, direct evaluation for the in-memory store).
//! Nothing here is dialect specific.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;

use super::row::{parse_timestamp, Row};
use crate::error::MigrateError;

/// Schema-qualified table identifier, written `schema.table` in config.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TableRef {
    pub schema: Option<String>,
    pub name: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: Some(schema.into()),
            name: name.into(),
        }
    }

    pub fn unqualified(name: impl Into<String>) -> Self {
        Self {
            schema: None,
            name: name.into(),
        }
    }

    /// Parse `table` or `schema.table`.
    pub fn parse(s: &str) -> Result<Self, MigrateError> {
        let parts: Vec<&str> = s.split('.').collect();
        let valid = |p: &str| !p.is_empty() && !p.contains(char::is_whitespace);
        match parts.as_slice() {
            [name] if valid(*name) => Ok(Self::unqualified(*name)),
            [schema, name] if valid(*schema) && valid(*name) => Ok(Self::new(*schema, *name)),
            _ => Err(MigrateError::Config(format!("Invalid table name: '{}'", s))),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

impl TryFrom<String> for TableRef {
    type Error = MigrateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        TableRef::parse(&value)
    }
}

impl From<TableRef> for String {
    fn from(value: TableRef) -> Self {
        value.to_string()
    }
}

/// A single filter condition on one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op")]
pub enum Predicate {
    Eq { field: String, value: Value },
    NotEq { field: String, value: Value },
    Gt { field: String, value: Value },
    /// `field > value OR field IS NULL`.
    GtOrNull { field: String, value: Value },
    In { field: String, values: Vec<Value> },
    IsNull { field: String },
}

impl Predicate {
    pub fn eq(field: impl Into<String>, value: Value) -> Self {
        Predicate::Eq {
            field: field.into(),
            value,
        }
    }

    pub fn gt(field: impl Into<String>, value: Value) -> Self {
        Predicate::Gt {
            field: field.into(),
            value,
        }
    }

    pub fn gt_or_null(field: impl Into<String>, value: Value) -> Self {
        Predicate::GtOrNull {
            field: field.into(),
            value,
        }
    }

    pub fn is_in(field: impl Into<String>, values: Vec<Value>) -> Self {
        Predicate::In {
            field: field.into(),
            values,
        }
    }

    pub fn field(&self) -> &str {
        match self {
            Predicate::Eq { field, .. }
            | Predicate::NotEq { field, .. }
            | Predicate::Gt { field, .. }
            | Predicate::GtOrNull { field, .. }
            | Predicate::In { field, .. }
            | Predicate::IsNull { field } => field,
        }
    }

    /// Evaluate against a row. SQL semantics: comparisons with null are false.
    pub fn matches(&self, row: &Row) -> bool {
        let actual = row.get(self.field()).unwrap_or(&Value::Null);
        match self {
            Predicate::Eq { value, .. } => {
                compare_values(actual, value) == Some(Ordering::Equal)
            }
            Predicate::NotEq { value, .. } => matches!(
                compare_values(actual, value),
                Some(Ordering::Less | Ordering::Greater)
            ),
            Predicate::Gt { value, .. } => {
                compare_values(actual, value) == Some(Ordering::Greater)
            }
            Predicate::GtOrNull { value, .. } => {
                actual.is_null() || compare_values(actual, value) == Some(Ordering::Greater)
            }
            Predicate::In { values, .. } => values
                .iter()
                .any(|v| compare_values(actual, v) == Some(Ordering::Equal)),
            Predicate::IsNull { .. } => actual.is_null(),
        }
    }
}

/// SELECT with optional projection, conjunctive predicates, ascending order
/// and limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectQuery {
    pub table: TableRef,
    /// Projected fields; empty selects every field.
    pub columns: Vec<String>,
    pub predicates: Vec<Predicate>,
    pub order_by: Option<String>,
    pub limit: Option<usize>,
}

impl SelectQuery {
    pub fn on(table: TableRef) -> Self {
        Self {
            table,
            columns: Vec::new(),
            predicates: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    pub fn columns(mut self, columns: &[&str]) -> Self {
        self.columns = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    /// Apply the projection to a full row.
    pub fn project(&self, row: &Row) -> Row {
        if self.columns.is_empty() {
            return row.clone();
        }
        self.columns
            .iter()
            .filter_map(|c| row.get(c).map(|v| (c.clone(), v.clone())))
            .collect()
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    pub fn filter_opt(mut self, predicate: Option<Predicate>) -> Self {
        if let Some(p) = predicate {
            self.predicates.push(p);
        }
        self
    }

    pub fn order_by(mut self, field: impl Into<String>) -> Self {
        self.order_by = Some(field.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, row: &Row) -> bool {
        self.predicates.iter().all(|p| p.matches(row))
    }
}

/// Compare two JSON values the way the stores order them.
///
/// Numbers compare numerically, strings that both parse as timestamps
/// compare chronologically, other strings lexicographically. Null and
/// mismatched types are incomparable.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        (Value::String(x), Value::String(y)) => {
            match (parse_timestamp(a), parse_timestamp(b)) {
                (Some(tx), Some(ty)) => Some(tx.cmp(&ty)),
                _ => Some(x.cmp(y)),
            }
        }
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}
