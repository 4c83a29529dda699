//! Relational query plans produced by the translator.

use crate::query::Operator;
use crate::schema::CompiledTable;
use serde_json::Value;
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq)]
pub enum Predicate {
    Compare {
        column: String,
        op: Operator,
        value: Value,
    },
    /// Conjunction; empty means "every row".
    And(Vec<Predicate>),
}

impl Predicate {
    pub fn always() -> Self {
        Predicate::And(Vec::new())
    }

    pub fn compare(column: &str, op: Operator, value: Value) -> Self {
        Predicate::Compare {
            column: column.to_string(),
            op,
            value,
        }
    }

    pub fn eq(column: &str, value: Value) -> Self {
        Self::compare(column, Operator::Eq, value)
    }

    /// Flattening conjunction.
    pub fn all(parts: Vec<Predicate>) -> Self {
        let mut out = Vec::with_capacity(parts.len());
        for p in parts {
            match p {
                Predicate::And(inner) => out.extend(inner),
                leaf => out.push(leaf),
            }
        }
        if out.len() == 1 {
            out.pop().unwrap_or_else(Predicate::always)
        } else {
            Predicate::And(out)
        }
    }

    pub fn is_always(&self) -> bool {
        matches!(self, Predicate::And(v) if v.is_empty())
    }

    pub fn leaves(&self) -> Vec<&Predicate> {
        match self {
            Predicate::And(parts) => parts.iter().flat_map(|p| p.leaves()).collect(),
            leaf => vec![leaf],
        }
    }

    pub fn references(&self, column: &str) -> bool {
        self.leaves()
            .iter()
            .any(|l| matches!(l, Predicate::Compare { column: c, .. } if c == column))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    /// `1` ascending, `-1` descending.
    pub fn from_i64(n: i64) -> Option<Self> {
        match n {
            1 => Some(SortDirection::Asc),
            -1 => Some(SortDirection::Desc),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SortKey {
    pub column: String,
    pub direction: SortDirection,
}

/// One request's plan. `columns` are physical columns; `relations` are
/// many-to-many fields loaded from their link tables.
#[derive(Clone, Debug)]
pub struct QueryPlan {
    pub table: Arc<CompiledTable>,
    pub predicate: Predicate,
    pub columns: Vec<String>,
    pub relations: Vec<String>,
    pub order: Vec<SortKey>,
    pub limit: Option<u64>,
    pub offset: u64,
}

impl QueryPlan {
    /// All columns, no relations, ordered by primary key, unlimited.
    pub fn scan(table: Arc<CompiledTable>, predicate: Predicate) -> Self {
        let columns = table.column_names().map(String::from).collect();
        let order = vec![SortKey {
            column: table.primary_key.clone(),
            direction: SortDirection::Asc,
        }];
        QueryPlan {
            table,
            predicate,
            columns,
            relations: Vec::new(),
            order,
            limit: None,
            offset: 0,
        }
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_columns(mut self, columns: Vec<String>) -> Self {
        self.columns = columns;
        self
    }
}
