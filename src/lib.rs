//! Resource store: a data layer for REST resource frameworks over a
//! relational database, driven by declarative resource schemas.

pub mod config;
pub mod data_layer;
pub mod driver;
pub mod error;
pub mod migration;
pub mod query;
pub mod schema;
pub mod service;
pub mod sql;

pub use config::{load_domain_from_path, load_domain_from_str, AdapterConfig, Domain, FieldSpec, ResourceConfig};
pub use data_layer::DataLayer;
pub use driver::{Driver, MemoryDriver, PgDriver, Record, Transaction};
pub use error::{AppError, SchemaError, StorageError};
pub use migration::apply_schema;
pub use query::{FilterExpression, ParsedRequest, QueryRequest, SortDirection};
pub use schema::{compile, CompiledSchema, CompiledTable};
pub use service::ResultSet;
