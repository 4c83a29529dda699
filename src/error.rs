//! Typed errors for schema compilation, request validation and storage.

use thiserror::Error;

/// Malformed or contradictory resource schema. Fatal at startup.
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("unknown field type '{type_name}' for {resource}.{field}")]
    UnknownType {
        resource: String,
        field: String,
        type_name: String,
    },
    #[error("{resource}.{field} references unknown resource '{target}'")]
    UnknownResource {
        resource: String,
        field: String,
        target: String,
    },
    #[error("resource '{resource}' declares more than one primary key: {fields:?}")]
    MultiplePrimaryKeys { resource: String, fields: Vec<String> },
    #[error("{resource}.{field} cannot be both primary key and a relation")]
    RelationPrimaryKey { resource: String, field: String },
    #[error("invalid identifier: '{0}'")]
    InvalidIdentifier(String),
    #[error("duplicate link table: {0}")]
    DuplicateLinkTable(String),
    #[error("default of {resource}.{field} does not match its type")]
    InvalidDefault { resource: String, field: String },
    #[error("{resource}.{field} collides with a synthesized column")]
    ReservedField { resource: String, field: String },
    #[error("datasource of '{resource}': {reason}")]
    InvalidDatasource { resource: String, reason: String },
    #[error("config load: {0}")]
    Load(String),
}

/// Fault raised by the persistence driver.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("database: {0}")]
    Db(#[from] sqlx::Error),
    #[error("constraint violation on {table}: {message}")]
    Constraint { table: String, message: String },
    #[error("cannot encode value for column '{column}': {message}")]
    Encode { column: String, message: String },
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("transaction already finished")]
    TransactionFinished,
    #[error("injected fault: {0}")]
    Injected(String),
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("validation: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("operation not supported by this data layer: {0}")]
    NotSupported(&'static str),
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        AppError::Storage(StorageError::Db(e))
    }
}

impl AppError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::NotFound(_))
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, AppError::Validation(_))
    }

    pub fn is_storage(&self) -> bool {
        matches!(self, AppError::Storage(_))
    }
}
