//! Storage drivers. A driver creates physical tables and opens transactions;
//! every read and write of a data-layer operation goes through one
//! transaction.

mod memory;
mod postgres;

pub use memory::{FaultOp, MemoryDriver};
pub use postgres::{PgDriver, PgTransaction};

use crate::error::StorageError;
use crate::query::{Predicate, QueryPlan};
use crate::schema::CompiledTable;
use async_trait::async_trait;
use serde_json::{Map, Value};

/// A stored row or an API document: field name → JSON value.
pub type Record = Map<String, Value>;

#[async_trait]
pub trait Driver: Send + Sync {
    /// Create the table if it does not exist. Foreign keys are left to
    /// [`Driver::add_foreign_keys`].
    async fn create_table(&self, table: &CompiledTable) -> Result<(), StorageError>;

    async fn add_foreign_keys(&self, table: &CompiledTable) -> Result<(), StorageError>;

    async fn begin(&self) -> Result<Box<dyn Transaction>, StorageError>;
}

/// A unit of work. Dropping it without [`Transaction::commit`] discards
/// every change made through it.
#[async_trait]
pub trait Transaction: Send {
    /// Rows matching the plan, carrying exactly `plan.columns`.
    async fn select(&mut self, plan: &QueryPlan) -> Result<Vec<Record>, StorageError>;

    async fn count(&mut self, table: &CompiledTable, predicate: &Predicate) -> Result<u64, StorageError>;

    /// Insert one row; columns absent from `record` take their defaults.
    /// Returns the primary key of the new row.
    async fn insert(&mut self, table: &CompiledTable, record: &Record) -> Result<Value, StorageError>;

    /// Insert, or overwrite the row with the same primary key.
    async fn upsert(&mut self, table: &CompiledTable, record: &Record) -> Result<(), StorageError>;

    /// Returns the number of rows changed.
    async fn update(
        &mut self,
        table: &CompiledTable,
        predicate: &Predicate,
        assignments: &Record,
    ) -> Result<u64, StorageError>;

    /// Returns the number of rows removed.
    async fn delete(&mut self, table: &CompiledTable, predicate: &Predicate) -> Result<u64, StorageError>;

    async fn commit(&mut self) -> Result<(), StorageError>;

    async fn rollback(&mut self) -> Result<(), StorageError>;
}
