//! Compiled table descriptors: the runtime form of a resource schema.

use crate::error::AppError;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub const CREATED: &str = "_created";
pub const UPDATED: &str = "_updated";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Boolean,
    Integer,
    Float,
    DateTime,
    Json,
}

impl ColumnType {
    /// Map a schema type name. `list` and `dict` are stored as JSON unless a
    /// `list` carries a relation (handled by the compiler).
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "string" => Some(ColumnType::Text),
            "boolean" => Some(ColumnType::Boolean),
            "integer" => Some(ColumnType::Integer),
            "float" | "number" => Some(ColumnType::Float),
            "datetime" => Some(ColumnType::DateTime),
            "dict" | "list" => Some(ColumnType::Json),
            _ => None,
        }
    }

    /// DDL type.
    pub fn sql_type(self) -> &'static str {
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Integer => "BIGINT",
            ColumnType::Float => "DOUBLE PRECISION",
            ColumnType::DateTime => "TIMESTAMPTZ",
            ColumnType::Json => "JSONB",
        }
    }

    /// Whether a JSON value can be stored in a column of this type. Null is checked separately.
    pub fn accepts(self, v: &Value) -> bool {
        match (self, v) {
            (_, Value::Null) => true,
            (ColumnType::Text, Value::String(_)) => true,
            (ColumnType::Boolean, Value::Bool(_)) => true,
            (ColumnType::Integer, Value::Number(n)) => n.is_i64(),
            (ColumnType::Float, Value::Number(_)) => true,
            (ColumnType::DateTime, Value::String(s)) => chrono::DateTime::parse_from_rfc3339(s).is_ok(),
            (ColumnType::Json, _) => true,
            _ => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForeignKey {
    pub table: String,
    pub column: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
    pub unique: bool,
    pub default: Option<Value>,
    /// Database fills the value with the current time when omitted.
    pub default_now: bool,
    pub primary_key: bool,
    pub auto_increment: bool,
    pub required: bool,
    pub min_length: Option<u32>,
    pub max_length: Option<u32>,
    pub references: Option<ForeignKey>,
}

impl Column {
    pub fn new(name: &str, column_type: ColumnType) -> Self {
        Column {
            name: name.to_string(),
            column_type,
            nullable: true,
            unique: false,
            default: None,
            default_now: false,
            primary_key: false,
            auto_increment: false,
            required: false,
            min_length: None,
            max_length: None,
            references: None,
        }
    }

    pub(crate) fn identity(name: &str) -> Self {
        Column {
            nullable: false,
            unique: true,
            primary_key: true,
            auto_increment: true,
            ..Column::new(name, ColumnType::Integer)
        }
    }

    pub(crate) fn timestamp(name: &str) -> Self {
        Column {
            nullable: false,
            default_now: true,
            ..Column::new(name, ColumnType::DateTime)
        }
    }

    /// A value is generated for this column when the record omits it.
    pub fn has_default(&self) -> bool {
        self.default.is_some() || self.default_now || self.auto_increment
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableKind {
    Resource,
    Link,
}

/// A list field realized through a link table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManyToMany {
    pub field: String,
    pub target: String,
    pub link_table: String,
    /// Link column pointing at the owning row.
    pub local_column: String,
    /// Link column pointing at the target row.
    pub remote_column: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AllowedFilters {
    All,
    Only(HashSet<String>),
}

impl AllowedFilters {
    pub fn from_list(list: &[String]) -> Self {
        if list.iter().any(|f| f == "*") {
            AllowedFilters::All
        } else {
            AllowedFilters::Only(list.iter().cloned().collect())
        }
    }

    pub fn allows(&self, field: &str) -> bool {
        match self {
            AllowedFilters::All => true,
            AllowedFilters::Only(set) => set.contains(field),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CompiledTable {
    /// Resource name (for link tables, the link table name).
    pub resource: String,
    /// Physical table; differs from `resource` for datasource aliases.
    pub table_name: String,
    pub kind: TableKind,
    pub columns: Vec<Column>,
    pub primary_key: String,
    pub deleted_column: Option<String>,
    pub many_to_many: Vec<ManyToMany>,
    pub unique_together: Vec<Vec<String>>,
    pub allowed_filters: AllowedFilters,
    pub auto_fields: Vec<String>,
    pub default_filter: Map<String, Value>,
    pub default_projection: Option<Map<String, Value>>,
    pub default_sort: Vec<(String, i64)>,
    pub paginated: bool,
}

impl CompiledTable {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn pk_column(&self) -> Option<&Column> {
        self.column(&self.primary_key)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn many_to_many(&self, field: &str) -> Option<&ManyToMany> {
        self.many_to_many.iter().find(|m| m.field == field)
    }

    /// Column or many-to-many field.
    pub fn has_field(&self, name: &str) -> bool {
        self.has_column(name) || self.many_to_many(name).is_some()
    }

    pub fn is_soft_delete(&self) -> bool {
        self.deleted_column.is_some()
    }
}

/// All compiled tables, keyed by resource name. Immutable once built.
#[derive(Clone, Debug, Default)]
pub struct CompiledSchema {
    pub(crate) resources: HashMap<String, Arc<CompiledTable>>,
    pub(crate) order: Vec<String>,
    pub(crate) links: HashMap<String, Arc<CompiledTable>>,
    /// Physical tables in creation order: base tables, then link tables.
    pub(crate) physical: Vec<Arc<CompiledTable>>,
}

impl CompiledSchema {
    pub fn get(&self, resource: &str) -> Option<&Arc<CompiledTable>> {
        self.resources.get(resource)
    }

    pub fn table(&self, resource: &str) -> Result<&Arc<CompiledTable>, AppError> {
        self.get(resource)
            .ok_or_else(|| AppError::NotFound(format!("resource '{}'", resource)))
    }

    pub fn link_table(&self, name: &str) -> Result<&Arc<CompiledTable>, AppError> {
        self.links
            .get(name)
            .ok_or_else(|| AppError::NotFound(format!("link table '{}'", name)))
    }

    pub fn resource_names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn physical_tables(&self) -> impl Iterator<Item = &Arc<CompiledTable>> {
        self.physical.iter()
    }

    /// Link-table columns that reference rows of `table_name`.
    pub fn link_columns_referencing<'a>(&'a self, table_name: &'a str) -> impl Iterator<Item = (&'a CompiledTable, &'a str)> + 'a {
        self.physical
            .iter()
            .filter(|t| t.kind == TableKind::Link)
            .flat_map(move |t| {
                t.columns
                    .iter()
                    .filter(move |c| c.references.as_ref().is_some_and(|fk| fk.table == table_name))
                    .map(move |c| (t.as_ref(), c.name.as_str()))
            })
    }
}
