//! Narrow row-store interface used by the console modules.
//!
//! Every filter value travels as a bound parameter. Table and column names are
//! the only text spliced into SQL and must pass [`is_identifier`].

use crate::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;

/// A single column value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Text(String),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Text(s) => s.parse().ok(),
            Value::Null => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&String> for Value {
    fn from(v: &String) -> Self {
        Value::Text(v.clone())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Integer(v as i64)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// One result row, keyed by column name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row(pub BTreeMap<String, Value>);

impl Row {
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    /// Text value of a column, empty when missing or NULL
    pub fn text(&self, column: &str) -> String {
        self.0.get(column).map(|v| v.to_string()).unwrap_or_default()
    }

    /// Text value of a column, `None` when missing, NULL or empty
    pub fn opt_text(&self, column: &str) -> Option<String> {
        match self.0.get(column) {
            Some(Value::Null) | None => None,
            Some(v) => {
                let s = v.to_string();
                if s.is_empty() {
                    None
                } else {
                    Some(s)
                }
            }
        }
    }

    pub fn int(&self, column: &str) -> Option<i64> {
        self.0.get(column).and_then(Value::as_i64)
    }
}

/// Ordered column → value pairs for insert and update
pub type Values = Vec<(&'static str, Value)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    NotEq,
    Lt,
    Like,
}

impl Op {
    pub(crate) fn sql(&self) -> &'static str {
        match self {
            Op::Eq => "=",
            Op::NotEq => "!=",
            Op::Lt => "<",
            Op::Like => "LIKE",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub column: String,
    pub op: Op,
    pub value: Value,
}

/// Conjunction of column conditions
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub conditions: Vec<Condition>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter matching every row
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.push(column, Op::Eq, value.into());
        self
    }

    pub fn ne(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.push(column, Op::NotEq, value.into());
        self
    }

    pub fn lt(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.push(column, Op::Lt, value.into());
        self
    }

    pub fn like(mut self, column: &str, pattern: impl Into<Value>) -> Self {
        self.push(column, Op::Like, pattern.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    fn push(&mut self, column: &str, op: Op, value: Value) {
        self.conditions.push(Condition {
            column: column.to_string(),
            op,
            value,
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub offset: u32,
    pub limit: u32,
}

impl Pagination {
    pub const ONE: Pagination = Pagination { offset: 0, limit: 1 };

    pub fn new(offset: u32, limit: u32) -> Self {
        Self { offset, limit }
    }
}

/// Minimal storage surface required by the console.
pub trait Store: Send + Sync {
    /// Select `columns` (or `*`) from `table`
    fn select(
        &self,
        table: &str,
        columns: &[&str],
        filter: &Filter,
        page: Option<Pagination>,
    ) -> Result<Vec<Row>>;

    /// Insert one row, returns the new rowid
    fn insert(&self, table: &str, values: &Values) -> Result<i64>;

    /// Update matching rows, returns the affected row count
    fn update(&self, table: &str, values: &Values, filter: &Filter) -> Result<usize>;

    /// Delete matching rows, returns the affected row count.
    /// An empty filter is refused.
    fn delete(&self, table: &str, filter: &Filter) -> Result<usize>;

    fn count(&self, table: &str, filter: &Filter) -> Result<i64>;

    /// Insert one row only while no row of `table` matches `guard`, as a
    /// single atomic step. Returns `None` when the guard matched.
    fn insert_unless(&self, table: &str, values: &Values, guard: &Filter) -> Result<Option<i64>>;

    fn exists(&self, table: &str, filter: &Filter) -> Result<bool> {
        Ok(self.count(table, filter)? > 0)
    }

    /// First matching row
    fn find(&self, table: &str, filter: &Filter) -> Result<Option<Row>> {
        Ok(self
            .select(table, &["*"], filter, Some(Pagination::ONE))?
            .into_iter()
            .next())
    }
}

/// SQL identifier check for table and column names
pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub(crate) fn check_identifier(s: &str) -> Result<()> {
    if is_identifier(s) {
        Ok(())
    } else {
        Err(Error::Internal(format!("invalid SQL identifier: {:?}", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers() {
        assert!(is_identifier("virtual_machine"));
        assert!(is_identifier("_x1"));
        assert!(!is_identifier("1abc"));
        assert!(!is_identifier("name; DROP TABLE users"));
        assert!(!is_identifier(""));
    }

    #[test]
    fn row_accessors() {
        let mut map = BTreeMap::new();
        map.insert("name".to_string(), Value::from("vm1"));
        map.insert("ip".to_string(), Value::Null);
        map.insert("cpu".to_string(), Value::Integer(2));
        let row = Row(map);
        assert_eq!(row.text("name"), "vm1");
        assert_eq!(row.opt_text("ip"), None);
        assert_eq!(row.int("cpu"), Some(2));
        assert_eq!(row.text("missing"), "");
    }

    #[test]
    fn option_into_value() {
        let none: Option<&str> = None;
        assert_eq!(Value::from(none), Value::Null);
        assert_eq!(Value::from(Some("x")), Value::Text("x".into()));
    }
}
