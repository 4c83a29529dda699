//! Run a plan inside a transaction and shape rows into records.

use crate::config::AdapterConfig;
use crate::driver::{Record, Transaction};
use crate::error::{AppError, SchemaError};
use crate::query::{Operator, Predicate, QueryPlan};
use crate::schema::{ColumnType, CompiledSchema, CompiledTable, ManyToMany};
use chrono::DateTime;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Write;

/// Records of one query plus the total ignoring limit and offset.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResultSet {
    records: Vec<Record>,
    total: u64,
}

impl ResultSet {
    pub fn new(records: Vec<Record>, total: u64) -> Self {
        ResultSet { records, total }
    }

    /// Matching rows across all pages.
    pub fn count(&self) -> u64 {
        self.total
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Record> {
        self.records.iter()
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }
}

impl<'a> IntoIterator for &'a ResultSet {
    type Item = &'a Record;
    type IntoIter = std::slice::Iter<'a, Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

impl IntoIterator for ResultSet {
    type Item = Record;
    type IntoIter = std::vec::IntoIter<Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

pub async fn execute(
    tx: &mut dyn Transaction,
    schema: &CompiledSchema,
    plan: &QueryPlan,
    config: &AdapterConfig,
) -> Result<ResultSet, AppError> {
    let records = fetch(tx, schema, plan, config).await?;
    let total = tx.count(&plan.table, &plan.predicate).await?;
    Ok(ResultSet::new(records, total))
}

/// First record of the plan; absence is not an error.
pub async fn fetch_one(
    tx: &mut dyn Transaction,
    schema: &CompiledSchema,
    plan: QueryPlan,
    config: &AdapterConfig,
) -> Result<Option<Record>, AppError> {
    let mut plan = plan.with_limit(1);
    plan.offset = 0;
    Ok(fetch(tx, schema, &plan, config).await?.into_iter().next())
}

/// Rows of the plan with relations loaded and dates formatted.
pub async fn fetch(
    tx: &mut dyn Transaction,
    schema: &CompiledSchema,
    plan: &QueryPlan,
    config: &AdapterConfig,
) -> Result<Vec<Record>, AppError> {
    let mut records = tx.select(plan).await?;
    for field in &plan.relations {
        let Some(m) = plan.table.many_to_many(field) else { continue };
        load_members(tx, schema, &plan.table, m, &mut records).await?;
    }
    if let Some(format) = &config.date_format {
        format_dates(&plan.table, format, &mut records)?;
    }
    Ok(records)
}

/// Target ids linked to each owner id, in link insertion order.
pub(crate) async fn linked_members(
    tx: &mut dyn Transaction,
    schema: &CompiledSchema,
    m: &ManyToMany,
    owners: Vec<Value>,
) -> Result<HashMap<String, Vec<Value>>, AppError> {
    let link = schema.link_table(&m.link_table)?;
    let plan = QueryPlan::scan(
        link.clone(),
        Predicate::compare(&m.local_column, Operator::In, Value::Array(owners)),
    )
    .with_columns(vec![m.local_column.clone(), m.remote_column.clone()]);
    let mut grouped: HashMap<String, Vec<Value>> = HashMap::new();
    for row in tx.select(&plan).await? {
        let owner = row.get(&m.local_column).cloned().unwrap_or(Value::Null);
        let member = row.get(&m.remote_column).cloned().unwrap_or(Value::Null);
        grouped.entry(owner.to_string()).or_default().push(member);
    }
    Ok(grouped)
}

async fn load_members(
    tx: &mut dyn Transaction,
    schema: &CompiledSchema,
    table: &CompiledTable,
    m: &ManyToMany,
    records: &mut [Record],
) -> Result<(), AppError> {
    let owners: Vec<Value> = records
        .iter()
        .filter_map(|r| r.get(&table.primary_key).cloned())
        .collect();
    if owners.is_empty() {
        return Ok(());
    }
    let mut grouped = linked_members(tx, schema, m, owners).await?;
    for record in records.iter_mut() {
        let key = record
            .get(&table.primary_key)
            .map(Value::to_string)
            .unwrap_or_default();
        let members = grouped.remove(&key).unwrap_or_default();
        record.insert(m.field.clone(), Value::Array(members));
    }
    Ok(())
}

fn format_dates(table: &CompiledTable, format: &str, records: &mut [Record]) -> Result<(), AppError> {
    let columns: Vec<&str> = table
        .columns
        .iter()
        .filter(|c| c.column_type == ColumnType::DateTime)
        .map(|c| c.name.as_str())
        .collect();
    for record in records.iter_mut() {
        for name in &columns {
            let Some(Value::String(s)) = record.get(*name) else { continue };
            let Ok(parsed) = DateTime::parse_from_rfc3339(s) else { continue };
            let mut out = String::new();
            write!(out, "{}", parsed.format(format))
                .map_err(|_| SchemaError::Load(format!("invalid date_format '{}'", format)))?;
            record.insert((*name).to_string(), Value::String(out));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Domain, FieldSpec, ResourceConfig};
    use crate::driver::{Driver, MemoryDriver};
    use crate::schema::compile;
    use serde_json::json;

    async fn setup(config: &AdapterConfig) -> (MemoryDriver, CompiledSchema) {
        let domain = Domain::new()
            .resource("people", ResourceConfig::default().field("name", FieldSpec::new("string")))
            .resource(
                "groups",
                ResourceConfig::default().field("members", FieldSpec::new("list").relation("people")),
            );
        let schema = compile(&domain, config).unwrap();
        let driver = MemoryDriver::new();
        for t in schema.physical_tables() {
            driver.create_table(t).await.unwrap();
        }
        let mut tx = driver.begin().await.unwrap();
        let people = schema.table("people").unwrap();
        let groups = schema.table("groups").unwrap();
        let link = schema.link_table("groups_people").unwrap();
        for name in ["ann", "bob"] {
            let mut r = Record::new();
            r.insert("name".into(), json!(name));
            r.insert("_created".into(), json!("2024-03-01T12:30:00Z"));
            tx.insert(people, &r).await.unwrap();
        }
        tx.insert(groups, &Record::new()).await.unwrap();
        tx.insert(groups, &Record::new()).await.unwrap();
        for member in [2, 1] {
            let mut r = Record::new();
            r.insert("groups_id".into(), json!(1));
            r.insert("people_id".into(), json!(member));
            tx.insert(link, &r).await.unwrap();
        }
        tx.commit().await.unwrap();
        (driver, schema)
    }

    #[tokio::test]
    async fn loads_members_in_link_order() {
        let config = AdapterConfig::default();
        let (driver, schema) = setup(&config).await;
        let groups = schema.table("groups").unwrap().clone();
        let mut plan = QueryPlan::scan(groups, Predicate::always());
        plan.relations = vec!["members".into()];
        let mut tx = driver.begin().await.unwrap();
        let rs = execute(tx.as_mut(), &schema, &plan, &config).await.unwrap();
        assert_eq!(rs.count(), 2);
        assert_eq!(rs.records()[0]["members"], json!([2, 1]));
        assert_eq!(rs.records()[1]["members"], json!([]));
    }

    #[tokio::test]
    async fn count_ignores_limit_and_iteration_restarts() {
        let config = AdapterConfig::default();
        let (driver, schema) = setup(&config).await;
        let people = schema.table("people").unwrap().clone();
        let plan = QueryPlan::scan(people, Predicate::always()).with_limit(1);
        let mut tx = driver.begin().await.unwrap();
        let rs = execute(tx.as_mut(), &schema, &plan, &config).await.unwrap();
        assert_eq!(rs.len(), 1);
        assert_eq!(rs.count(), 2);
        assert_eq!(rs.iter().count(), 1);
        assert_eq!(rs.iter().next(), (&rs).into_iter().next());
    }

    #[tokio::test]
    async fn fetch_one_returns_none_when_absent() {
        let config = AdapterConfig::default();
        let (driver, schema) = setup(&config).await;
        let people = schema.table("people").unwrap().clone();
        let plan = QueryPlan::scan(people, Predicate::eq("name", json!("zed")));
        let mut tx = driver.begin().await.unwrap();
        assert!(fetch_one(tx.as_mut(), &schema, plan, &config).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn applies_date_format() {
        let config = AdapterConfig {
            date_format: Some("%d/%m/%Y".into()),
            ..AdapterConfig::default()
        };
        let (driver, schema) = setup(&config).await;
        let people = schema.table("people").unwrap().clone();
        let plan = QueryPlan::scan(people, Predicate::eq("name", json!("ann")));
        let mut tx = driver.begin().await.unwrap();
        let rec = fetch_one(tx.as_mut(), &schema, plan, &config).await.unwrap().unwrap();
        assert_eq!(rec["_created"], json!("01/03/2024"));
    }
}
