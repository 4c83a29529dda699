//! In-process driver. Tables live behind one async mutex; a transaction
//! holds the lock and works on a copy that replaces the shared state on
//! commit. Constraint checks mirror the DDL the PostgreSQL driver emits.

use crate::driver::{Driver, Record, Transaction};
use crate::error::StorageError;
use crate::query::{Operator, Predicate, QueryPlan, SortDirection};
use crate::schema::{Column, ColumnType, CompiledTable};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::RegexBuilder;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Clone, Debug, Default)]
struct MemoryTable {
    columns: Vec<Column>,
    rows: Vec<Record>,
    next_id: i64,
}

#[derive(Clone, Debug, Default)]
struct MemoryState {
    tables: HashMap<String, MemoryTable>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultOp {
    Insert,
    Update,
    Delete,
}

#[derive(Clone, Default)]
pub struct MemoryDriver {
    state: Arc<Mutex<MemoryState>>,
    faults: Arc<StdMutex<Vec<(FaultOp, String)>>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `op` against `table` fail with [`StorageError::Injected`].
    pub fn fail_next(&self, op: FaultOp, table: &str) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.push((op, table.to_string()));
        }
    }

    /// Committed rows of a physical table, in insertion order.
    pub async fn rows(&self, table: &str) -> Vec<Record> {
        let state = self.state.lock().await;
        state
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    async fn create_table(&self, table: &CompiledTable) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        state
            .tables
            .entry(table.table_name.clone())
            .or_insert_with(|| MemoryTable {
                columns: table.columns.clone(),
                rows: Vec::new(),
                next_id: 1,
            });
        Ok(())
    }

    async fn add_foreign_keys(&self, _table: &CompiledTable) -> Result<(), StorageError> {
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>, StorageError> {
        let guard = self.state.clone().lock_owned().await;
        let work = guard.clone();
        Ok(Box::new(MemoryTransaction {
            guard: Some(guard),
            work,
            faults: self.faults.clone(),
        }))
    }
}

struct MemoryTransaction {
    guard: Option<OwnedMutexGuard<MemoryState>>,
    work: MemoryState,
    faults: Arc<StdMutex<Vec<(FaultOp, String)>>>,
}

fn constraint(table: &str, message: impl Into<String>) -> StorageError {
    StorageError::Constraint {
        table: table.to_string(),
        message: message.into(),
    }
}

fn parse_ts(v: &Value) -> Option<DateTime<Utc>> {
    v.as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc))
}

/// Order two non-null values of a column. `None` when they are not comparable.
fn compare(ty: ColumnType, a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        (Value::String(_), Value::String(_)) if ty == ColumnType::DateTime => {
            Some(parse_ts(a)?.cmp(&parse_ts(b)?))
        }
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn equals(ty: ColumnType, a: &Value, b: &Value) -> bool {
    if ty == ColumnType::Json {
        return a == b;
    }
    compare(ty, a, b) == Some(Ordering::Equal)
}

/// SQL LIKE to an anchored regex.
fn like(column: &str, pattern: &str, text: &str, case_insensitive: bool) -> Result<bool, StorageError> {
    let mut re = String::from("^");
    let mut chars = pattern.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '%' => re.push_str(".*"),
            '_' => re.push('.'),
            '\\' => {
                if let Some(next) = chars.next() {
                    re.push_str(&regex::escape(&next.to_string()));
                }
            }
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    let compiled = RegexBuilder::new(&re)
        .case_insensitive(case_insensitive)
        .dot_matches_new_line(true)
        .build()
        .map_err(|e| StorageError::Encode {
            column: column.to_string(),
            message: format!("bad pattern '{}': {}", pattern, e),
        })?;
    Ok(compiled.is_match(text))
}

fn column_type(columns: &[Column], name: &str) -> ColumnType {
    columns
        .iter()
        .find(|c| c.name == name)
        .map(|c| c.column_type)
        .unwrap_or(ColumnType::Json)
}

/// Evaluate a predicate with SQL null semantics: any comparison against a
/// null cell is false.
fn matches(columns: &[Column], row: &Record, p: &Predicate) -> Result<bool, StorageError> {
    let (column, op, value) = match p {
        Predicate::And(parts) => {
            for part in parts {
                if !matches(columns, row, part)? {
                    return Ok(false);
                }
            }
            return Ok(true);
        }
        Predicate::Compare { column, op, value } => (column, *op, value),
    };
    let ty = column_type(columns, column);
    let cell = row.get(column).unwrap_or(&Value::Null);
    Ok(match (op, value) {
        (Operator::Eq, Value::Null) => cell.is_null(),
        (Operator::Ne, Value::Null) => !cell.is_null(),
        _ if cell.is_null() => false,
        (Operator::Eq, v) => equals(ty, cell, v),
        (Operator::Ne, v) => !equals(ty, cell, v),
        (Operator::Lt, v) => compare(ty, cell, v) == Some(Ordering::Less),
        (Operator::Lte, v) => matches!(compare(ty, cell, v), Some(Ordering::Less | Ordering::Equal)),
        (Operator::Gt, v) => compare(ty, cell, v) == Some(Ordering::Greater),
        (Operator::Gte, v) => matches!(compare(ty, cell, v), Some(Ordering::Greater | Ordering::Equal)),
        (Operator::In, Value::Array(items)) => items.iter().any(|v| equals(ty, cell, v)),
        (Operator::In, _) => false,
        (Operator::Like | Operator::ILike | Operator::StartsWith, Value::String(pattern)) => {
            let Some(text) = cell.as_str() else { return Ok(false) };
            match op {
                Operator::StartsWith => text.starts_with(pattern.as_str()),
                _ => like(column, pattern, text, op == Operator::ILike)?,
            }
        }
        (Operator::Like | Operator::ILike | Operator::StartsWith, _) => false,
    })
}

/// Nulls sort last ascending and first descending, as in PostgreSQL.
fn order_rows(columns: &[Column], rows: &mut [Record], plan: &QueryPlan) {
    rows.sort_by(|a, b| {
        for key in &plan.order {
            let ty = column_type(columns, &key.column);
            let x = a.get(&key.column).unwrap_or(&Value::Null);
            let y = b.get(&key.column).unwrap_or(&Value::Null);
            let ord = match (x.is_null(), y.is_null()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) => compare(ty, x, y).unwrap_or(Ordering::Equal),
            };
            let ord = match key.direction {
                SortDirection::Asc => ord,
                SortDirection::Desc => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

impl MemoryTransaction {
    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.guard.is_none() {
            return Err(StorageError::TransactionFinished);
        }
        Ok(())
    }

    fn take_fault(&self, op: FaultOp, table: &str) -> Result<(), StorageError> {
        let Ok(mut faults) = self.faults.lock() else { return Ok(()) };
        if let Some(i) = faults.iter().position(|(o, t)| *o == op && t == table) {
            faults.remove(i);
            return Err(StorageError::Injected(format!("{:?} on '{}'", op, table)));
        }
        Ok(())
    }

    fn table(&self, name: &str) -> Result<&MemoryTable, StorageError> {
        self.ensure_open()?;
        self.work
            .tables
            .get(name)
            .ok_or_else(|| StorageError::UnknownTable(name.to_string()))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut MemoryTable, StorageError> {
        self.ensure_open()?;
        self.work
            .tables
            .get_mut(name)
            .ok_or_else(|| StorageError::UnknownTable(name.to_string()))
    }

    fn indices(&self, table: &str, predicate: &Predicate) -> Result<Vec<usize>, StorageError> {
        let t = self.table(table)?;
        let mut out = Vec::new();
        for (i, row) in t.rows.iter().enumerate() {
            if matches(&t.columns, row, predicate)? {
                out.push(i);
            }
        }
        Ok(out)
    }

    /// Fill defaults for a new row and reject unknown columns.
    fn build_row(&mut self, table: &CompiledTable, record: &Record) -> Result<Record, StorageError> {
        let name = table.table_name.as_str();
        let now = Utc::now().to_rfc3339();
        let t = self.table_mut(name)?;
        if let Some(k) = record.keys().find(|k| !t.columns.iter().any(|c| &c.name == *k)) {
            return Err(constraint(name, format!("column '{}' does not exist", k)));
        }
        let mut row = Record::new();
        for c in &t.columns {
            let v = match record.get(&c.name) {
                Some(v) => v.clone(),
                None if c.auto_increment => {
                    let id = t.next_id;
                    t.next_id += 1;
                    Value::from(id)
                }
                None => match (&c.default, c.default_now) {
                    (Some(d), _) => d.clone(),
                    (None, true) => Value::String(now.clone()),
                    (None, false) => Value::Null,
                },
            };
            if c.auto_increment {
                if let Some(n) = v.as_i64() {
                    t.next_id = t.next_id.max(n + 1);
                }
            }
            row.insert(c.name.clone(), v);
        }
        Ok(row)
    }

    /// Not-null, uniqueness and reference checks for `row`, ignoring the row at `skip`.
    fn check_row(&self, table: &CompiledTable, row: &Record, skip: Option<usize>) -> Result<(), StorageError> {
        let name = table.table_name.as_str();
        let t = self.table(name)?;
        let others = || {
            t.rows
                .iter()
                .enumerate()
                .filter(move |(i, _)| Some(*i) != skip)
                .map(|(_, r)| r)
        };
        for c in &t.columns {
            let v = row.get(&c.name).unwrap_or(&Value::Null);
            if v.is_null() {
                if !c.nullable || c.primary_key {
                    return Err(constraint(name, format!("null value in column '{}'", c.name)));
                }
                continue;
            }
            if (c.unique || c.primary_key)
                && others().any(|r| r.get(&c.name).is_some_and(|o| equals(c.column_type, o, v)))
            {
                return Err(constraint(name, format!("duplicate key value for '{}'", c.name)));
            }
            if let Some(fk) = &c.references {
                let target = self.table(&fk.table)?;
                let found = target
                    .rows
                    .iter()
                    .any(|r| r.get(&fk.column).is_some_and(|o| equals(c.column_type, o, v)));
                if !found {
                    return Err(constraint(
                        name,
                        format!("'{}' = {} is not present in '{}'", c.name, v, fk.table),
                    ));
                }
            }
        }
        for group in &table.unique_together {
            let key: Vec<&Value> = group.iter().map(|c| row.get(c).unwrap_or(&Value::Null)).collect();
            if key.iter().any(|v| v.is_null()) {
                continue;
            }
            let clash = others().any(|r| {
                group
                    .iter()
                    .zip(&key)
                    .all(|(c, v)| r.get(c).is_some_and(|o| o == *v))
            });
            if clash {
                return Err(constraint(name, format!("duplicate key value for ({})", group.join(", "))));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn select(&mut self, plan: &QueryPlan) -> Result<Vec<Record>, StorageError> {
        let t = self.table(&plan.table.table_name)?;
        let mut rows = Vec::new();
        for row in &t.rows {
            if matches(&t.columns, row, &plan.predicate)? {
                rows.push(row.clone());
            }
        }
        order_rows(&t.columns, &mut rows, plan);
        let offset = usize::try_from(plan.offset).unwrap_or(usize::MAX);
        let limit = plan
            .limit
            .map(|n| usize::try_from(n).unwrap_or(usize::MAX))
            .unwrap_or(usize::MAX);
        Ok(rows
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|row| {
                plan.columns
                    .iter()
                    .map(|c| (c.clone(), row.get(c).cloned().unwrap_or(Value::Null)))
                    .collect()
            })
            .collect())
    }

    async fn count(&mut self, table: &CompiledTable, predicate: &Predicate) -> Result<u64, StorageError> {
        Ok(self.indices(&table.table_name, predicate)?.len() as u64)
    }

    async fn insert(&mut self, table: &CompiledTable, record: &Record) -> Result<Value, StorageError> {
        self.ensure_open()?;
        self.take_fault(FaultOp::Insert, &table.table_name)?;
        let row = self.build_row(table, record)?;
        self.check_row(table, &row, None)?;
        let pk = row.get(&table.primary_key).cloned().unwrap_or(Value::Null);
        self.table_mut(&table.table_name)?.rows.push(row);
        Ok(pk)
    }

    async fn upsert(&mut self, table: &CompiledTable, record: &Record) -> Result<(), StorageError> {
        self.ensure_open()?;
        self.take_fault(FaultOp::Insert, &table.table_name)?;
        let pk = record.get(&table.primary_key).cloned().unwrap_or(Value::Null);
        let existing = self.indices(&table.table_name, &Predicate::eq(&table.primary_key, pk))?;
        match existing.first() {
            Some(&i) => {
                let mut row = self.table(&table.table_name)?.rows[i].clone();
                for (k, v) in record {
                    if !row.contains_key(k) {
                        return Err(constraint(&table.table_name, format!("column '{}' does not exist", k)));
                    }
                    row.insert(k.clone(), v.clone());
                }
                self.check_row(table, &row, Some(i))?;
                self.table_mut(&table.table_name)?.rows[i] = row;
            }
            None => {
                let row = self.build_row(table, record)?;
                self.check_row(table, &row, None)?;
                self.table_mut(&table.table_name)?.rows.push(row);
            }
        }
        Ok(())
    }

    async fn update(
        &mut self,
        table: &CompiledTable,
        predicate: &Predicate,
        assignments: &Record,
    ) -> Result<u64, StorageError> {
        self.ensure_open()?;
        self.take_fault(FaultOp::Update, &table.table_name)?;
        let hits = self.indices(&table.table_name, predicate)?;
        for &i in &hits {
            let mut row = self.table(&table.table_name)?.rows[i].clone();
            for (k, v) in assignments {
                if !row.contains_key(k) {
                    return Err(constraint(&table.table_name, format!("column '{}' does not exist", k)));
                }
                row.insert(k.clone(), v.clone());
            }
            self.check_row(table, &row, Some(i))?;
            self.table_mut(&table.table_name)?.rows[i] = row;
        }
        Ok(hits.len() as u64)
    }

    async fn delete(&mut self, table: &CompiledTable, predicate: &Predicate) -> Result<u64, StorageError> {
        self.ensure_open()?;
        self.take_fault(FaultOp::Delete, &table.table_name)?;
        let hits = self.indices(&table.table_name, predicate)?;
        let t = self.table_mut(&table.table_name)?;
        let mut i = 0;
        t.rows.retain(|_| {
            let keep = !hits.contains(&i);
            i += 1;
            keep
        });
        Ok(hits.len() as u64)
    }

    async fn commit(&mut self) -> Result<(), StorageError> {
        let mut guard = self.guard.take().ok_or(StorageError::TransactionFinished)?;
        *guard = std::mem::take(&mut self.work);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StorageError> {
        self.guard.take().ok_or(StorageError::TransactionFinished)?;
        self.work = MemoryState::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AdapterConfig, Domain, FieldSpec, ResourceConfig};
    use crate::schema::{compile, CompiledSchema};
    use rstest::rstest;
    use serde_json::json;

    fn schema() -> CompiledSchema {
        let domain = Domain::new().resource(
            "people",
            ResourceConfig::default()
                .field("firstname", FieldSpec::new("string"))
                .field("lastname", FieldSpec::new("string").unique())
                .field("prog", FieldSpec::new("integer")),
        );
        compile(&domain, &AdapterConfig::default()).unwrap()
    }

    async fn seeded() -> (MemoryDriver, Arc<CompiledTable>) {
        let s = schema();
        let people = s.table("people").unwrap().clone();
        let driver = MemoryDriver::new();
        driver.create_table(&people).await.unwrap();
        let mut tx = driver.begin().await.unwrap();
        for (first, last, prog) in [("john", "doe", json!(1)), ("Jane", "roe", json!(2)), ("jim", "poe", Value::Null)] {
            let mut r = Record::new();
            r.insert("firstname".into(), json!(first));
            r.insert("lastname".into(), json!(last));
            r.insert("prog".into(), prog);
            tx.insert(&people, &r).await.unwrap();
        }
        tx.commit().await.unwrap();
        (driver, people)
    }

    #[tokio::test]
    async fn insert_assigns_sequential_ids_and_timestamps() {
        let (driver, _) = seeded().await;
        let rows = driver.rows("people").await;
        let ids: Vec<_> = rows.iter().map(|r| r["id"].clone()).collect();
        assert_eq!(ids, vec![json!(1), json!(2), json!(3)]);
        assert!(rows[0]["_created"].is_string());
    }

    #[rstest]
    #[case(Predicate::eq("prog", Value::Null), 1)]
    #[case(Predicate::compare("prog", Operator::Ne, json!(1)), 1)]
    #[case(Predicate::compare("prog", Operator::Gte, json!(1)), 2)]
    #[case(Predicate::compare("firstname", Operator::Like, json!("j%")), 2)]
    #[case(Predicate::compare("firstname", Operator::ILike, json!("j%")), 3)]
    #[case(Predicate::compare("firstname", Operator::StartsWith, json!("ji")), 1)]
    #[case(Predicate::compare("id", Operator::In, json!([1, 3, 9])), 2)]
    #[case(Predicate::always(), 3)]
    #[tokio::test]
    async fn predicates_follow_sql_semantics(#[case] p: Predicate, #[case] expected: u64) {
        let (driver, people) = seeded().await;
        let mut tx = driver.begin().await.unwrap();
        assert_eq!(tx.count(&people, &p).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn uncommitted_changes_are_discarded_on_drop() {
        let (driver, people) = seeded().await;
        {
            let mut tx = driver.begin().await.unwrap();
            tx.delete(&people, &Predicate::always()).await.unwrap();
        }
        assert_eq!(driver.rows("people").await.len(), 3);
    }

    #[tokio::test]
    async fn unique_violation_is_a_constraint_error() {
        let (driver, people) = seeded().await;
        let mut tx = driver.begin().await.unwrap();
        let mut r = Record::new();
        r.insert("lastname".into(), json!("doe"));
        let err = tx.insert(&people, &r).await.unwrap_err();
        assert!(matches!(err, StorageError::Constraint { .. }));
    }

    #[tokio::test]
    async fn sort_puts_nulls_last_and_pages() {
        let (driver, people) = seeded().await;
        let mut tx = driver.begin().await.unwrap();
        let mut plan = QueryPlan::scan(people.clone(), Predicate::always()).with_limit(2);
        plan.order.insert(
            0,
            crate::query::SortKey {
                column: "prog".into(),
                direction: SortDirection::Asc,
            },
        );
        let rows = tx.select(&plan).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["prog"], json!(1));
        plan.offset = 2;
        let rest = tx.select(&plan).await.unwrap();
        assert_eq!(rest[0]["prog"], Value::Null);
    }

    #[tokio::test]
    async fn injected_fault_fires_once() {
        let (driver, people) = seeded().await;
        driver.fail_next(FaultOp::Delete, "people");
        let mut tx = driver.begin().await.unwrap();
        assert!(matches!(
            tx.delete(&people, &Predicate::always()).await,
            Err(StorageError::Injected(_))
        ));
        assert_eq!(tx.delete(&people, &Predicate::always()).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn finished_transaction_rejects_work() {
        let (driver, people) = seeded().await;
        let mut tx = driver.begin().await.unwrap();
        tx.commit().await.unwrap();
        assert!(matches!(
            tx.count(&people, &Predicate::always()).await,
            Err(StorageError::TransactionFinished)
        ));
        assert!(matches!(tx.rollback().await, Err(StorageError::TransactionFinished)));
    }
}
