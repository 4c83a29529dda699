//! Builds parameterized DDL, SELECT, COUNT, INSERT, UPSERT, UPDATE and DELETE
//! from compiled tables and query plans.

use crate::driver::Record;
use crate::error::StorageError;
use crate::query::{Operator, Predicate, QueryPlan, SortDirection};
use crate::schema::{Column, ColumnType, CompiledTable, TableKind};
use crate::sql::PgBindValue;
use serde_json::Value;

/// Quote identifier for PostgreSQL (safe: only from compiled schema).
fn quoted(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

/// Full qualified table name.
fn qualified_table(schema: &str, table: &str) -> String {
    format!("{}.{}", quoted(schema), quoted(table))
}

fn literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

#[derive(Debug, Default)]
pub struct QueryBuf {
    pub sql: String,
    pub params: Vec<PgBindValue>,
}

impl QueryBuf {
    fn new() -> Self {
        Self::default()
    }

    fn push_param(&mut self, v: PgBindValue) -> u32 {
        let n = self.params.len() as u32 + 1;
        self.params.push(v);
        n
    }
}

fn column<'a>(table: &'a CompiledTable, name: &str) -> Result<&'a Column, StorageError> {
    table.column(name).ok_or_else(|| StorageError::Encode {
        column: name.to_string(),
        message: format!("no such column on table '{}'", table.table_name),
    })
}

fn default_literal(c: &Column, v: &Value) -> String {
    match (c.column_type, v) {
        (_, Value::Null) => "NULL".into(),
        (ColumnType::Json, v) => format!("{}::jsonb", literal(&v.to_string())),
        (_, Value::Bool(b)) => if *b { "TRUE" } else { "FALSE" }.into(),
        (_, Value::Number(n)) => n.to_string(),
        (_, Value::String(s)) => literal(s),
        (_, other) => literal(&other.to_string()),
    }
}

fn column_def(c: &Column) -> String {
    let mut def = if c.auto_increment {
        format!("{} BIGSERIAL", quoted(&c.name))
    } else {
        format!("{} {}", quoted(&c.name), c.column_type.sql_type())
    };
    if c.primary_key {
        def.push_str(" PRIMARY KEY");
    } else {
        if !c.nullable {
            def.push_str(" NOT NULL");
        }
        if c.unique {
            def.push_str(" UNIQUE");
        }
    }
    if let Some(ref d) = c.default {
        def.push_str(" DEFAULT ");
        def.push_str(&default_literal(c, d));
    } else if c.default_now {
        def.push_str(" DEFAULT NOW()");
    }
    def
}

pub fn create_schema(schema: &str) -> String {
    format!("CREATE SCHEMA IF NOT EXISTS {}", quoted(schema))
}

/// CREATE TABLE IF NOT EXISTS with column constraints and unique pairs.
/// Foreign keys are added separately once every table exists.
pub fn create_table(schema: &str, table: &CompiledTable) -> String {
    let mut defs: Vec<String> = table.columns.iter().map(column_def).collect();
    for group in &table.unique_together {
        let cols: Vec<String> = group.iter().map(|s| quoted(s)).collect();
        defs.push(format!("UNIQUE ({})", cols.join(", ")));
    }
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n  {}\n)",
        qualified_table(schema, &table.table_name),
        defs.join(",\n  ")
    )
}

/// One idempotent statement per referencing column. Link rows go with
/// either end; plain references block deletion.
pub fn foreign_keys(schema: &str, table: &CompiledTable) -> Vec<String> {
    let on_delete = match table.kind {
        TableKind::Link => "CASCADE",
        TableKind::Resource => "NO ACTION",
    };
    table
        .columns
        .iter()
        .filter_map(|c| c.references.as_ref().map(|fk| (c, fk)))
        .map(|(c, fk)| {
            let constraint = format!("{}_{}_fkey", table.table_name, c.name);
            format!(
                "DO $$ BEGIN\n  ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE {};\nEXCEPTION WHEN duplicate_object THEN NULL;\nEND $$",
                qualified_table(schema, &table.table_name),
                quoted(&constraint),
                quoted(&c.name),
                qualified_table(schema, &fk.table),
                quoted(&fk.column),
                on_delete
            )
        })
        .collect()
}

/// Escape `%`, `_` and the escape character itself for a LIKE prefix.
fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

fn render_predicate(q: &mut QueryBuf, table: &CompiledTable, p: &Predicate) -> Result<String, StorageError> {
    let (name, op, value) = match p {
        Predicate::And(parts) if parts.is_empty() => return Ok("TRUE".into()),
        Predicate::And(parts) => {
            let rendered = parts
                .iter()
                .map(|part| render_predicate(q, table, part).map(|s| format!("({})", s)))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(rendered.join(" AND "));
        }
        Predicate::Compare { column, op, value } => (column, *op, value),
    };
    let c = column(table, name)?;
    let col = quoted(&c.name);
    let ty = c.column_type;
    Ok(match (op, value) {
        (Operator::Eq, Value::Null) => format!("{} IS NULL", col),
        (Operator::Ne, Value::Null) => format!("{} IS NOT NULL", col),
        (Operator::In, Value::Array(items)) if items.is_empty() => "FALSE".into(),
        (Operator::In, Value::Array(items)) => {
            let n = q.push_param(PgBindValue::array(name, ty, items)?);
            format!("{} = ANY(${})", col, n)
        }
        (Operator::StartsWith, Value::String(prefix)) => {
            let n = q.push_param(PgBindValue::Text(Some(format!("{}%", escape_like(prefix)))));
            format!("{} LIKE ${}", col, n)
        }
        (op, v) => {
            let sql_op = match op {
                Operator::Eq => "=",
                Operator::Ne => "<>",
                Operator::Lt => "<",
                Operator::Lte => "<=",
                Operator::Gt => ">",
                Operator::Gte => ">=",
                Operator::Like => "LIKE",
                Operator::ILike => "ILIKE",
                Operator::StartsWith | Operator::In => {
                    return Err(StorageError::Encode {
                        column: name.clone(),
                        message: format!("{} is not a valid operand for {:?}", v, op),
                    })
                }
            };
            let n = q.push_param(PgBindValue::from_value(name, ty, v)?);
            format!("{} {} ${}", col, sql_op, n)
        }
    })
}

fn where_clause(q: &mut QueryBuf, table: &CompiledTable, p: &Predicate) -> Result<String, StorageError> {
    if p.is_always() {
        return Ok(String::new());
    }
    Ok(format!(" WHERE {}", render_predicate(q, table, p)?))
}

/// SELECT the plan's columns with filter, order, LIMIT/OFFSET.
pub fn select(schema: &str, plan: &QueryPlan) -> Result<QueryBuf, StorageError> {
    let mut q = QueryBuf::new();
    let table = plan.table.as_ref();
    let cols = plan
        .columns
        .iter()
        .map(|c| column(table, c).map(|c| quoted(&c.name)))
        .collect::<Result<Vec<_>, _>>()?;
    let where_sql = where_clause(&mut q, table, &plan.predicate)?;
    let order = plan
        .order
        .iter()
        .map(|k| {
            let dir = match k.direction {
                SortDirection::Asc => "ASC",
                SortDirection::Desc => "DESC",
            };
            format!("{} {}", quoted(&k.column), dir)
        })
        .collect::<Vec<_>>();
    let order_clause = if order.is_empty() {
        String::new()
    } else {
        format!(" ORDER BY {}", order.join(", "))
    };
    let limit_clause = plan.limit.map(|n| format!(" LIMIT {}", n)).unwrap_or_default();
    let offset_clause = if plan.offset > 0 {
        format!(" OFFSET {}", plan.offset)
    } else {
        String::new()
    };
    q.sql = format!(
        "SELECT {} FROM {}{}{}{}{}",
        cols.join(", "),
        qualified_table(schema, &table.table_name),
        where_sql,
        order_clause,
        limit_clause,
        offset_clause
    );
    Ok(q)
}

pub fn count(schema: &str, table: &CompiledTable, predicate: &Predicate) -> Result<QueryBuf, StorageError> {
    let mut q = QueryBuf::new();
    let where_sql = where_clause(&mut q, table, predicate)?;
    q.sql = format!(
        "SELECT COUNT(*) FROM {}{}",
        qualified_table(schema, &table.table_name),
        where_sql
    );
    Ok(q)
}

/// Columns and placeholders for the record's keys, in table column order.
fn values_list(q: &mut QueryBuf, table: &CompiledTable, record: &Record) -> Result<(Vec<String>, Vec<String>), StorageError> {
    for k in record.keys() {
        column(table, k)?;
    }
    let mut cols = Vec::new();
    let mut placeholders = Vec::new();
    for c in &table.columns {
        let Some(v) = record.get(&c.name) else { continue };
        let n = q.push_param(PgBindValue::from_value(&c.name, c.column_type, v)?);
        cols.push(quoted(&c.name));
        placeholders.push(format!("${}", n));
    }
    Ok((cols, placeholders))
}

/// INSERT only the record's columns (omitted columns take their DB default),
/// returning the primary key.
pub fn insert(schema: &str, table: &CompiledTable, record: &Record) -> Result<QueryBuf, StorageError> {
    let mut q = QueryBuf::new();
    let target = qualified_table(schema, &table.table_name);
    let (cols, placeholders) = values_list(&mut q, table, record)?;
    q.sql = if cols.is_empty() {
        format!("INSERT INTO {} DEFAULT VALUES RETURNING {}", target, quoted(&table.primary_key))
    } else {
        format!(
            "INSERT INTO {} ({}) VALUES ({}) RETURNING {}",
            target,
            cols.join(", "),
            placeholders.join(", "),
            quoted(&table.primary_key)
        )
    };
    Ok(q)
}

/// INSERT ... ON CONFLICT (pk) DO UPDATE: every non-key column in the record
/// overwrites the existing row.
pub fn upsert(schema: &str, table: &CompiledTable, record: &Record) -> Result<QueryBuf, StorageError> {
    if !record.contains_key(&table.primary_key) {
        return Err(StorageError::Encode {
            column: table.primary_key.clone(),
            message: "upsert requires the primary key".into(),
        });
    }
    let mut q = QueryBuf::new();
    let (cols, placeholders) = values_list(&mut q, table, record)?;
    let pk = quoted(&table.primary_key);
    let sets: Vec<String> = cols
        .iter()
        .filter(|c| **c != pk)
        .map(|c| format!("{} = EXCLUDED.{}", c, c))
        .collect();
    let conflict = if sets.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", sets.join(", "))
    };
    q.sql = format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) {}",
        qualified_table(schema, &table.table_name),
        cols.join(", "),
        placeholders.join(", "),
        pk,
        conflict
    );
    Ok(q)
}

/// Move the key sequence of an auto-increment table past every stored key.
/// Needed after a row was written with an explicit key, which BIGSERIAL
/// does not observe. `None` for tables without a generated key.
pub fn sync_sequence(schema: &str, table: &CompiledTable) -> Option<QueryBuf> {
    let pk = table.pk_column().filter(|c| c.auto_increment)?;
    let mut q = QueryBuf::new();
    let target = qualified_table(schema, &table.table_name);
    let t = q.push_param(PgBindValue::Text(Some(target.clone())));
    let c = q.push_param(PgBindValue::Text(Some(pk.name.clone())));
    q.sql = format!(
        "SELECT setval(s.seq, COALESCE(GREATEST(m.top, pg_sequence_last_value(s.seq)), 1), \
         GREATEST(m.top, pg_sequence_last_value(s.seq)) IS NOT NULL) \
         FROM (SELECT pg_get_serial_sequence(${}, ${})::regclass AS seq) s, \
         (SELECT MAX({}) AS top FROM {}) m",
        t,
        c,
        quoted(&pk.name),
        target
    );
    Some(q)
}

pub fn update(
    schema: &str,
    table: &CompiledTable,
    predicate: &Predicate,
    assignments: &Record,
) -> Result<QueryBuf, StorageError> {
    let mut q = QueryBuf::new();
    let mut sets = Vec::new();
    for (k, v) in assignments {
        let c = column(table, k)?;
        let n = q.push_param(PgBindValue::from_value(&c.name, c.column_type, v)?);
        sets.push(format!("{} = ${}", quoted(&c.name), n));
    }
    if sets.is_empty() {
        return Err(StorageError::Encode {
            column: table.primary_key.clone(),
            message: "update without assignments".into(),
        });
    }
    let where_sql = where_clause(&mut q, table, predicate)?;
    q.sql = format!(
        "UPDATE {} SET {}{}",
        qualified_table(schema, &table.table_name),
        sets.join(", "),
        where_sql
    );
    Ok(q)
}

pub fn delete(schema: &str, table: &CompiledTable, predicate: &Predicate) -> Result<QueryBuf, StorageError> {
    let mut q = QueryBuf::new();
    let where_sql = where_clause(&mut q, table, predicate)?;
    q.sql = format!("DELETE FROM {}{}", qualified_table(schema, &table.table_name), where_sql);
    Ok(q)
}
