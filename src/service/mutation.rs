//! Insert, update, replace and remove. Each call runs in its own
//! transaction and commits only when every statement succeeded.

use crate::config::AdapterConfig;
use crate::driver::{Driver, Record, Transaction};
use crate::error::AppError;
use crate::query::{coerce, FilterEntry, FilterExpression, FilterSource, Operator, Predicate, QueryPlan, Translator};
use crate::schema::{ColumnType, CompiledSchema, CompiledTable, ManyToMany, CREATED, UPDATED};
use crate::service::materialize::linked_members;
use crate::service::DocumentValidator;
use chrono::Utc;
use serde_json::{Number, Value};
use std::sync::Arc;

/// Commit on success; roll back and surface the original error otherwise.
pub(crate) async fn finish<T>(mut tx: Box<dyn Transaction>, result: Result<T, AppError>) -> Result<T, AppError> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = tx.rollback().await {
                tracing::error!(error = %rollback, "rollback failed");
            }
            Err(e)
        }
    }
}

fn now() -> Value {
    Value::String(Utc::now().to_rfc3339())
}

/// Float columns store JSON floats whatever the document sent (`7` becomes `7.0`),
/// matching what a `DOUBLE PRECISION` column reads back.
fn canonical_floats(table: &CompiledTable, record: &mut Record) {
    for c in table.columns.iter().filter(|c| c.column_type == ColumnType::Float) {
        let Some(f) = record.get(&c.name).and_then(Value::as_f64).and_then(Number::from_f64) else {
            continue;
        };
        record.insert(c.name.clone(), Value::Number(f));
    }
}

/// Column values, and member lists of the many-to-many fields present.
fn split<'t>(table: &'t CompiledTable, doc: &Record) -> (Record, Vec<(&'t ManyToMany, Vec<Value>)>) {
    let mut row = Record::new();
    let mut links = Vec::new();
    for (field, v) in doc {
        if let Some(m) = table.many_to_many(field) {
            let members = match v {
                Value::Array(items) => items.clone(),
                _ => Vec::new(),
            };
            links.push((m, members));
        } else {
            row.insert(field.clone(), v.clone());
        }
    }
    (row, links)
}

pub struct MutationExecutor<'a> {
    driver: &'a dyn Driver,
    schema: &'a CompiledSchema,
    config: &'a AdapterConfig,
}

impl<'a> MutationExecutor<'a> {
    pub fn new(driver: &'a dyn Driver, schema: &'a CompiledSchema, config: &'a AdapterConfig) -> Self {
        MutationExecutor { driver, schema, config }
    }

    /// One transaction per document. Assigned ids and timestamps are
    /// written back into each document; a failure leaves earlier documents
    /// committed.
    pub async fn insert(&self, table: &Arc<CompiledTable>, docs: &mut [Record]) -> Result<Vec<Value>, AppError> {
        let mut ids = Vec::with_capacity(docs.len());
        for doc in docs.iter_mut() {
            let mut tx = self.driver.begin().await?;
            let result = self.insert_one(tx.as_mut(), table, doc).await;
            ids.push(finish(tx, result).await?);
        }
        Ok(ids)
    }

    pub async fn update(&self, table: &Arc<CompiledTable>, id: &Value, updates: &Record) -> Result<(), AppError> {
        let mut tx = self.driver.begin().await?;
        let result = self.update_one(tx.as_mut(), table, id, updates).await;
        finish(tx, result).await
    }

    pub async fn replace(&self, table: &Arc<CompiledTable>, id: &Value, document: &Record) -> Result<(), AppError> {
        let mut tx = self.driver.begin().await?;
        let result = self.replace_one(tx.as_mut(), table, id, document).await;
        finish(tx, result).await
    }

    /// Soft-delete or delete the visible rows matching `lookup`. Returns the
    /// number of rows affected.
    pub async fn remove(&self, table: &Arc<CompiledTable>, lookup: &FilterExpression) -> Result<u64, AppError> {
        let mut tx = self.driver.begin().await?;
        let result = self.remove_matching(tx.as_mut(), table, lookup).await;
        finish(tx, result).await
    }

    async fn insert_one(&self, tx: &mut dyn Transaction, table: &CompiledTable, doc: &mut Record) -> Result<Value, AppError> {
        DocumentValidator::validate(self.schema, table, doc)?;
        canonical_floats(table, doc);
        let (mut row, links) = split(table, doc);
        let stamp = now();
        for ts in [CREATED, UPDATED] {
            row.entry(ts).or_insert_with(|| stamp.clone());
        }
        let id = tx.insert(table, &row).await?;
        for (m, members) in &links {
            self.write_links(tx, m, &id, members).await?;
        }
        doc.insert(table.primary_key.clone(), id.clone());
        for ts in [CREATED, UPDATED] {
            if let Some(v) = row.remove(ts) {
                doc.insert(ts.to_string(), v);
            }
        }
        tracing::debug!(resource = %table.resource, id = %id, "inserted");
        Ok(id)
    }

    async fn update_one(
        &self,
        tx: &mut dyn Transaction,
        table: &Arc<CompiledTable>,
        id: &Value,
        updates: &Record,
    ) -> Result<(), AppError> {
        let id = self
            .locate(tx, table, id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("{} '{}'", table.resource, id)))?;
        DocumentValidator::validate_partial(self.schema, table, updates)?;
        let (mut row, links) = split(table, updates);
        canonical_floats(table, &mut row);
        row.remove(&table.primary_key);
        row.insert(UPDATED.to_string(), now());
        tx.update(table, &Predicate::eq(&table.primary_key, id.clone()), &row)
            .await?;
        for (m, members) in &links {
            self.replace_links(tx, m, &id, members).await?;
        }
        Ok(())
    }

    /// Fresh record from the full schema with the key forced. Timestamps
    /// come from the document, else the stored row, else now.
    async fn replace_one(
        &self,
        tx: &mut dyn Transaction,
        table: &Arc<CompiledTable>,
        id: &Value,
        document: &Record,
    ) -> Result<(), AppError> {
        DocumentValidator::validate(self.schema, table, document)?;
        let id = self.coerce_id(table, id)?;
        let stored = tx
            .select(&QueryPlan::scan(table.clone(), Predicate::eq(&table.primary_key, id.clone())).with_limit(1))
            .await?
            .into_iter()
            .next();
        let (mut fields, links) = split(table, document);
        canonical_floats(table, &mut fields);
        let stamp = now();
        let mut row = Record::new();
        for c in &table.columns {
            let v = if c.name == table.primary_key {
                id.clone()
            } else if let Some(v) = fields.get(&c.name) {
                v.clone()
            } else if c.name == CREATED || c.name == UPDATED {
                stored
                    .as_ref()
                    .and_then(|r| r.get(&c.name))
                    .filter(|v| !v.is_null())
                    .cloned()
                    .unwrap_or_else(|| stamp.clone())
            } else {
                c.default.clone().unwrap_or(Value::Null)
            };
            row.insert(c.name.clone(), v);
        }
        tx.upsert(table, &row).await?;
        for m in &table.many_to_many {
            let members = links
                .iter()
                .find(|(l, _)| l.field == m.field)
                .map(|(_, v)| v.clone())
                .unwrap_or_default();
            self.replace_links(tx, m, &id, &members).await?;
        }
        Ok(())
    }

    async fn remove_matching(
        &self,
        tx: &mut dyn Transaction,
        table: &Arc<CompiledTable>,
        lookup: &FilterExpression,
    ) -> Result<u64, AppError> {
        let predicate = Translator::new(self.config).predicate(table, lookup, FilterSource::Lookup, false)?;
        if let Some(deleted) = &table.deleted_column {
            let mut set = Record::new();
            set.insert(deleted.clone(), Value::Bool(true));
            set.insert(UPDATED.to_string(), now());
            let n = tx.update(table, &predicate, &set).await?;
            tracing::debug!(resource = %table.resource, rows = n, "soft-deleted");
            return Ok(n);
        }
        if lookup.is_empty() {
            tracing::warn!(resource = %table.resource, "removing every row");
        }
        let plan = QueryPlan::scan(table.clone(), predicate).with_columns(vec![table.primary_key.clone()]);
        let ids: Vec<Value> = tx
            .select(&plan)
            .await?
            .into_iter()
            .filter_map(|mut r| r.remove(&table.primary_key))
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }
        let targets = Value::Array(ids);
        for (link, column) in self.schema.link_columns_referencing(&table.table_name) {
            tx.delete(link, &Predicate::compare(column, Operator::In, targets.clone()))
                .await?;
        }
        let n = tx
            .delete(table, &Predicate::compare(&table.primary_key, Operator::In, targets))
            .await?;
        tracing::debug!(resource = %table.resource, rows = n, "deleted");
        Ok(n)
    }

    /// Primary key of the visible row with this id.
    async fn locate(&self, tx: &mut dyn Transaction, table: &Arc<CompiledTable>, id: &Value) -> Result<Option<Value>, AppError> {
        let mut lookup = FilterExpression::new();
        lookup.push(FilterEntry {
            field: table.primary_key.clone(),
            op: Operator::Eq,
            value: id.clone(),
        });
        let predicate = Translator::new(self.config).predicate(table, &lookup, FilterSource::Lookup, false)?;
        let plan = QueryPlan::scan(table.clone(), predicate)
            .with_columns(vec![table.primary_key.clone()])
            .with_limit(1);
        Ok(tx
            .select(&plan)
            .await?
            .into_iter()
            .next()
            .and_then(|mut r| r.remove(&table.primary_key)))
    }

    fn coerce_id(&self, table: &CompiledTable, id: &Value) -> Result<Value, AppError> {
        let ty = table
            .pk_column()
            .map(|c| c.column_type)
            .ok_or_else(|| AppError::NotFound(format!("primary key of '{}'", table.resource)))?;
        let id = coerce(ty, id);
        if id.is_null() || !ty.accepts(&id) {
            return Err(AppError::Validation(format!("invalid identifier for '{}'", table.resource)));
        }
        Ok(id)
    }

    async fn write_links(
        &self,
        tx: &mut dyn Transaction,
        m: &ManyToMany,
        owner: &Value,
        members: &[Value],
    ) -> Result<(), AppError> {
        let link = self.schema.link_table(&m.link_table)?;
        for member in members {
            let mut row = Record::new();
            row.insert(m.local_column.clone(), owner.clone());
            row.insert(m.remote_column.clone(), member.clone());
            tx.insert(link, &row).await?;
        }
        Ok(())
    }

    /// Rewrite the owner's link rows unless they already hold `members` in order.
    async fn replace_links(
        &self,
        tx: &mut dyn Transaction,
        m: &ManyToMany,
        owner: &Value,
        members: &[Value],
    ) -> Result<(), AppError> {
        let current = linked_members(tx, self.schema, m, vec![owner.clone()])
            .await?
            .remove(&owner.to_string())
            .unwrap_or_default();
        if current == members {
            return Ok(());
        }
        let link = self.schema.link_table(&m.link_table)?;
        tx.delete(link, &Predicate::eq(&m.local_column, owner.clone())).await?;
        self.write_links(tx, m, owner, members).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Domain, FieldSpec, ResourceConfig};
    use crate::schema::compile;
    use serde_json::json;

    #[test]
    fn integral_numbers_become_floats_on_float_columns() {
        let domain = Domain::new().resource(
            "items",
            ResourceConfig::default()
                .field("price", FieldSpec::new("float"))
                .field("qty", FieldSpec::new("integer")),
        );
        let schema = compile(&domain, &AdapterConfig::default()).unwrap();
        let table = schema.table("items").unwrap();
        let mut rec = json!({"price": 7, "qty": 3}).as_object().cloned().unwrap();
        canonical_floats(table, &mut rec);
        assert_eq!(rec["price"], json!(7.0));
        assert_ne!(rec["price"], json!(7));
        assert_eq!(rec["qty"], json!(3));
    }
}
