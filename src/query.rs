//! Typed filter parameter objects for list endpoints.
//!
//! Column names are `&'static str` chosen by the caller's code; every value a
//! request supplies is bound as a positional parameter.

use rusqlite::types::Value;
use serde::Deserialize;

#[derive(Debug, Default)]
pub struct Where {
    clauses: Vec<String>,
    params: Vec<Value>,
}

impl Where {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, column: &'static str, op: &str, value: Value) {
        self.params.push(value);
        self.clauses.push(format!("{column} {op} ?{}", self.params.len()));
    }

    pub fn eq(mut self, column: &'static str, value: impl Into<Value>) -> Self {
        self.push(column, "=", value.into());
        self
    }

    pub fn eq_opt<V: Into<Value>>(mut self, column: &'static str, value: Option<V>) -> Self {
        if let Some(v) = value {
            self.push(column, "=", v.into());
        }
        self
    }

    pub fn gte_opt<V: Into<Value>>(mut self, column: &'static str, value: Option<V>) -> Self {
        if let Some(v) = value {
            self.push(column, ">=", v.into());
        }
        self
    }

    pub fn lte_opt<V: Into<Value>>(mut self, column: &'static str, value: Option<V>) -> Self {
        if let Some(v) = value {
            self.push(column, "<=", v.into());
        }
        self
    }

    /// Restrict `column` to a set of ids. An empty set matches nothing.
    pub fn in_ids(mut self, column: &'static str, ids: &[i64]) -> Self {
        if ids.is_empty() {
            self.clauses.push("1 = 0".to_string());
            return self;
        }
        let start = self.params.len();
        let placeholders: Vec<String> = ids
            .iter()
            .enumerate()
            .map(|(i, _)| format!("?{}", start + i + 1))
            .collect();
        self.params.extend(ids.iter().map(|id| Value::Integer(*id)));
        self.clauses.push(format!("{column} IN ({})", placeholders.join(", ")));
        self
    }

    pub fn sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    /// Placeholder index for the next parameter (used for LIMIT/OFFSET).
    pub fn next_index(&self) -> usize {
        self.params.len() + 1
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct Page {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl Page {
    pub const DEFAULT_LIMIT: i64 = 100;
    pub const MAX_LIMIT: i64 = 500;

    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(Self::DEFAULT_LIMIT).clamp(1, Self::MAX_LIMIT)
    }

    pub fn offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }
}

/// Append `LIMIT ?n OFFSET ?n+1` and return the full parameter list.
pub fn paged(filter: &Where, page: Page) -> (String, Vec<Value>) {
    let n = filter.next_index();
    let mut params = filter.params().to_vec();
    params.push(Value::Integer(page.limit()));
    params.push(Value::Integer(page.offset()));
    (format!(" LIMIT ?{} OFFSET ?{}", n, n + 1), params)
}
