//! The data-layer facade a REST framework calls: compiled schema, driver and
//! settings behind one cloneable handle.

use crate::config::{AdapterConfig, Domain};
use crate::driver::{Driver, Record};
use crate::error::AppError;
use crate::migration::apply_schema;
use crate::query::{
    resolve_order, resolve_projection, FilterEntry, FilterExpression, FilterSource, Operator, Projection,
    QueryPlan, QueryRequest, Translator,
};
use crate::schema::{compile, CompiledSchema, CompiledTable};
use crate::service::{finish, materialize, MutationExecutor, ResultSet};
use serde_json::Value;
use std::sync::Arc;

#[derive(Clone)]
pub struct DataLayer {
    driver: Arc<dyn Driver>,
    schema: Arc<CompiledSchema>,
    config: Arc<AdapterConfig>,
}

impl DataLayer {
    /// Compile the domain and create its tables.
    pub async fn init(driver: Arc<dyn Driver>, domain: &Domain, config: AdapterConfig) -> Result<Self, AppError> {
        let schema = compile(domain, &config)?;
        apply_schema(driver.as_ref(), &schema).await?;
        Ok(Self::new(driver, Arc::new(schema), Arc::new(config)))
    }

    pub fn new(driver: Arc<dyn Driver>, schema: Arc<CompiledSchema>, config: Arc<AdapterConfig>) -> Self {
        DataLayer { driver, schema, config }
    }

    pub fn schema(&self) -> &CompiledSchema {
        &self.schema
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    fn table(&self, resource: &str) -> Result<&Arc<CompiledTable>, AppError> {
        self.schema.table(resource)
    }

    fn mutations(&self) -> MutationExecutor<'_> {
        MutationExecutor::new(self.driver.as_ref(), &self.schema, &self.config)
    }

    /// Records matching the client request narrowed by an optional framework lookup.
    pub async fn find(
        &self,
        resource: &str,
        request: &QueryRequest,
        lookup: Option<&FilterExpression>,
    ) -> Result<ResultSet, AppError> {
        let table = self.table(resource)?;
        let empty = FilterExpression::new();
        let plan = Translator::new(&self.config).translate_with_lookup(table, request, lookup.unwrap_or(&empty))?;
        let mut tx = self.driver.begin().await?;
        let result = materialize::execute(tx.as_mut(), &self.schema, &plan, &self.config).await;
        finish(tx, result).await
    }

    pub async fn find_one(
        &self,
        resource: &str,
        request: &QueryRequest,
        lookup: &FilterExpression,
    ) -> Result<Option<Record>, AppError> {
        let table = self.table(resource)?;
        let plan = Translator::new(&self.config).translate_with_lookup(table, request, lookup)?;
        let mut tx = self.driver.begin().await?;
        let result = materialize::fetch_one(tx.as_mut(), &self.schema, plan, &self.config).await;
        finish(tx, result).await
    }

    /// Record by primary key with no datasource filter or soft-delete rule applied.
    pub async fn find_one_raw(&self, resource: &str, id: &Value) -> Result<Option<Record>, AppError> {
        let table = self.table(resource)?;
        let mut lookup = FilterExpression::new();
        lookup.push(FilterEntry {
            field: table.primary_key.clone(),
            op: Operator::Eq,
            value: id.clone(),
        });
        let raw = CompiledTable {
            default_filter: serde_json::Map::new(),
            ..table.as_ref().clone()
        };
        let predicate = Translator::new(&self.config).predicate(&raw, &lookup, FilterSource::Lookup, true)?;
        let mut plan = QueryPlan::scan(table.clone(), predicate);
        plan.relations = table.many_to_many.iter().map(|m| m.field.clone()).collect();
        let mut tx = self.driver.begin().await?;
        let result = materialize::fetch_one(tx.as_mut(), &self.schema, plan, &self.config).await;
        finish(tx, result).await
    }

    /// Visible records whose primary key is in `ids`, in key order.
    pub async fn find_list_of_ids(
        &self,
        resource: &str,
        ids: &[Value],
        projection: Option<&Projection>,
    ) -> Result<Vec<Record>, AppError> {
        let table = self.table(resource)?;
        let mut lookup = FilterExpression::new();
        lookup.push(FilterEntry {
            field: table.primary_key.clone(),
            op: Operator::In,
            value: Value::Array(ids.to_vec()),
        });
        let predicate = Translator::new(&self.config).predicate(table, &lookup, FilterSource::Lookup, false)?;
        let (columns, relations) = resolve_projection(table, projection)?;
        let plan = QueryPlan {
            table: table.clone(),
            predicate,
            columns,
            relations,
            order: resolve_order(table, &[])?,
            limit: None,
            offset: 0,
        };
        let mut tx = self.driver.begin().await?;
        let result = materialize::fetch(tx.as_mut(), &self.schema, &plan, &self.config).await;
        finish(tx, result).await
    }

    /// Insert documents, writing assigned ids back into them.
    pub async fn insert(&self, resource: &str, docs: &mut [Record]) -> Result<Vec<Value>, AppError> {
        let table = self.table(resource)?;
        self.mutations().insert(table, docs).await
    }

    pub async fn update(&self, resource: &str, id: &Value, updates: &Record) -> Result<(), AppError> {
        let table = self.table(resource)?;
        self.mutations().update(table, id, updates).await
    }

    pub async fn replace(&self, resource: &str, id: &Value, document: &Record) -> Result<(), AppError> {
        let table = self.table(resource)?;
        self.mutations().replace(table, id, document).await
    }

    pub async fn remove(&self, resource: &str, lookup: &FilterExpression) -> Result<u64, AppError> {
        let table = self.table(resource)?;
        self.mutations().remove(table, lookup).await
    }

    /// True when the resource has no visible rows.
    pub async fn is_empty(&self, resource: &str) -> Result<bool, AppError> {
        let table = self.table(resource)?;
        let predicate =
            Translator::new(&self.config).predicate(table, &FilterExpression::new(), FilterSource::Lookup, false)?;
        let mut tx = self.driver.begin().await?;
        let result: Result<u64, AppError> = tx.count(table, &predicate).await.map_err(AppError::from);
        Ok(finish(tx, result).await? == 0)
    }

    pub fn combine_queries(a: FilterExpression, b: FilterExpression) -> FilterExpression {
        a.and(b)
    }

    pub fn get_value_from_query<'q>(filter: &'q FilterExpression, field: &str) -> Option<&'q Value> {
        filter.equality_value(field)
    }

    pub fn query_contains_field(filter: &FilterExpression, field: &str) -> bool {
        filter.references(field)
    }

    pub async fn aggregate(&self, _resource: &str, _pipeline: &[Value]) -> Result<Vec<Record>, AppError> {
        Err(AppError::NotSupported("aggregate"))
    }
}
