//! PostgreSQL driver over a sqlx pool.

use crate::config::AdapterConfig;
use crate::driver::{Driver, Record, Transaction};
use crate::error::StorageError;
use crate::query::{Predicate, QueryPlan};
use crate::schema::{ColumnType, CompiledTable};
use crate::sql::{self, QueryBuf};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Postgres, Row};

#[derive(Clone)]
pub struct PgDriver {
    pool: PgPool,
    schema: String,
}

impl PgDriver {
    pub fn new(pool: PgPool, db_schema: &str) -> Self {
        PgDriver {
            pool,
            schema: db_schema.to_string(),
        }
    }

    pub async fn connect(config: &AdapterConfig) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&config.database_url)
            .await?;
        Ok(Self::new(pool, &config.db_schema))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn query(q: QueryBuf) -> (String, Vec<sql::PgBindValue>) {
    tracing::debug!(sql = %q.sql, params = ?q.params, "query");
    (q.sql, q.params)
}

#[async_trait]
impl Driver for PgDriver {
    async fn create_table(&self, table: &CompiledTable) -> Result<(), StorageError> {
        sqlx::query(&sql::create_schema(&self.schema))
            .execute(&self.pool)
            .await?;
        let ddl = sql::create_table(&self.schema, table);
        tracing::debug!(sql = %ddl, "ddl");
        sqlx::query(&ddl).execute(&self.pool).await?;
        Ok(())
    }

    async fn add_foreign_keys(&self, table: &CompiledTable) -> Result<(), StorageError> {
        for ddl in sql::foreign_keys(&self.schema, table) {
            tracing::debug!(sql = %ddl, "ddl");
            sqlx::query(&ddl).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>, StorageError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTransaction {
            tx: Some(tx),
            schema: self.schema.clone(),
        }))
    }
}

pub struct PgTransaction {
    tx: Option<sqlx::Transaction<'static, Postgres>>,
    schema: String,
}

impl PgTransaction {
    fn conn(&mut self) -> Result<&mut PgConnection, StorageError> {
        self.tx.as_deref_mut().ok_or(StorageError::TransactionFinished)
    }

    async fn fetch_all(&mut self, q: QueryBuf) -> Result<Vec<PgRow>, StorageError> {
        let (sql, params) = query(q);
        let mut stmt = sqlx::query(&sql);
        for p in params {
            stmt = p.bind(stmt);
        }
        Ok(stmt.fetch_all(self.conn()?).await?)
    }

    async fn sync_sequence(&mut self, table: &CompiledTable, record: &Record) -> Result<(), StorageError> {
        if !record.contains_key(&table.primary_key) {
            return Ok(());
        }
        if let Some(q) = sql::sync_sequence(&self.schema, table) {
            self.fetch_all(q).await?;
        }
        Ok(())
    }

    async fn execute(&mut self, q: QueryBuf) -> Result<u64, StorageError> {
        let (sql, params) = query(q);
        let mut stmt = sqlx::query(&sql);
        for p in params {
            stmt = p.bind(stmt);
        }
        Ok(stmt.execute(self.conn()?).await?.rows_affected())
    }
}

fn decode(row: &PgRow, idx: usize, ty: ColumnType) -> Result<Value, sqlx::Error> {
    Ok(match ty {
        ColumnType::Text => row.try_get::<Option<String>, _>(idx)?.map(Value::String),
        ColumnType::Boolean => row.try_get::<Option<bool>, _>(idx)?.map(Value::Bool),
        ColumnType::Integer => row.try_get::<Option<i64>, _>(idx)?.map(Value::from),
        ColumnType::Float => row.try_get::<Option<f64>, _>(idx)?.map(Value::from),
        ColumnType::DateTime => row
            .try_get::<Option<DateTime<Utc>>, _>(idx)?
            .map(|d| Value::String(d.to_rfc3339())),
        ColumnType::Json => row.try_get::<Option<Value>, _>(idx)?,
    }
    .unwrap_or(Value::Null))
}

fn column_type(table: &CompiledTable, name: &str) -> Result<ColumnType, StorageError> {
    table
        .column(name)
        .map(|c| c.column_type)
        .ok_or_else(|| StorageError::Encode {
            column: name.to_string(),
            message: format!("no such column on table '{}'", table.table_name),
        })
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn select(&mut self, plan: &QueryPlan) -> Result<Vec<Record>, StorageError> {
        let types = plan
            .columns
            .iter()
            .map(|c| column_type(&plan.table, c))
            .collect::<Result<Vec<_>, _>>()?;
        let rows = self.fetch_all(sql::select(&self.schema, plan)?).await?;
        rows.iter()
            .map(|row| {
                let mut rec = Record::new();
                for (i, (name, ty)) in plan.columns.iter().zip(&types).enumerate() {
                    rec.insert(name.clone(), decode(row, i, *ty)?);
                }
                Ok(rec)
            })
            .collect()
    }

    async fn count(&mut self, table: &CompiledTable, predicate: &Predicate) -> Result<u64, StorageError> {
        let rows = self.fetch_all(sql::count(&self.schema, table, predicate)?).await?;
        let n = match rows.first() {
            Some(row) => row.try_get::<i64, _>(0)?,
            None => 0,
        };
        Ok(n.max(0) as u64)
    }

    async fn insert(&mut self, table: &CompiledTable, record: &Record) -> Result<Value, StorageError> {
        let ty = column_type(table, &table.primary_key)?;
        let rows = self.fetch_all(sql::insert(&self.schema, table, record)?).await?;
        let row = rows.first().ok_or(sqlx::Error::RowNotFound)?;
        let id = decode(row, 0, ty)?;
        self.sync_sequence(table, record).await?;
        Ok(id)
    }

    async fn upsert(&mut self, table: &CompiledTable, record: &Record) -> Result<(), StorageError> {
        self.execute(sql::upsert(&self.schema, table, record)?).await?;
        self.sync_sequence(table, record).await
    }

    async fn update(
        &mut self,
        table: &CompiledTable,
        predicate: &Predicate,
        assignments: &Record,
    ) -> Result<u64, StorageError> {
        self.execute(sql::update(&self.schema, table, predicate, assignments)?)
            .await
    }

    async fn delete(&mut self, table: &CompiledTable, predicate: &Predicate) -> Result<u64, StorageError> {
        self.execute(sql::delete(&self.schema, table, predicate)?).await
    }

    async fn commit(&mut self) -> Result<(), StorageError> {
        let tx = self.tx.take().ok_or(StorageError::TransactionFinished)?;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StorageError> {
        let tx = self.tx.take().ok_or(StorageError::TransactionFinished)?;
        tx.rollback().await?;
        Ok(())
    }
}
