//! Translate a typed request into a query plan bound to a compiled table.

use crate::config::AdapterConfig;
use crate::error::AppError;
use crate::query::request::projection_from_map;
use crate::query::*;
use crate::schema::{ColumnType, CompiledTable};
use serde_json::Value;
use std::sync::Arc;

/// Whether the table's `allowed_filters` applies. Framework lookups (item ids,
/// sub-resource keys) bypass it; client `where` clauses do not.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterSource {
    Client,
    Lookup,
}

pub struct Translator<'a> {
    config: &'a AdapterConfig,
}

impl<'a> Translator<'a> {
    pub fn new(config: &'a AdapterConfig) -> Self {
        Translator { config }
    }

    pub fn translate(&self, table: &Arc<CompiledTable>, request: &QueryRequest) -> Result<QueryPlan, AppError> {
        let predicate = self.predicate(table, &request.filter, FilterSource::Client, request.show_deleted)?;
        let (columns, relations) = resolve_projection(table, request.projection.as_ref())?;
        let order = resolve_order(table, &request.sort)?;
        let (limit, offset) = self.paginate(table, request.pagination);
        let plan = QueryPlan {
            table: table.clone(),
            predicate,
            columns,
            relations,
            order,
            limit,
            offset,
        };
        tracing::trace!(resource = %table.resource, predicate = ?plan.predicate, limit = ?plan.limit, offset = plan.offset, "plan");
        Ok(plan)
    }

    /// Like [`Translator::translate`], narrowed by a framework lookup that
    /// bypasses `allowed_filters`.
    pub fn translate_with_lookup(
        &self,
        table: &Arc<CompiledTable>,
        request: &QueryRequest,
        lookup: &FilterExpression,
    ) -> Result<QueryPlan, AppError> {
        let mut plan = self.translate(table, request)?;
        if lookup.is_empty() {
            return Ok(plan);
        }
        let mut parts = vec![plan.predicate];
        for entry in lookup.entries() {
            parts.push(compile_leaf(table, entry)?);
        }
        plan.predicate = Predicate::all(parts);
        Ok(plan)
    }

    /// User filter AND datasource filter AND (unless shown or referenced) `deleted == false`.
    pub fn predicate(
        &self,
        table: &CompiledTable,
        filter: &FilterExpression,
        source: FilterSource,
        show_deleted: bool,
    ) -> Result<Predicate, AppError> {
        let mut parts = Vec::with_capacity(filter.len() + 2);
        for entry in filter.entries() {
            if source == FilterSource::Client && !table.allowed_filters.allows(&entry.field) {
                return Err(AppError::Validation(format!("filter on '{}' not allowed", entry.field)));
            }
            parts.push(compile_leaf(table, entry)?);
        }
        let defaults = FilterExpression::from_object(&table.default_filter);
        for entry in defaults.entries() {
            parts.push(compile_leaf(table, entry)?);
        }
        if let Some(deleted) = &table.deleted_column {
            if !show_deleted && !filter.references(deleted) && !defaults.references(deleted) {
                parts.push(Predicate::eq(deleted, Value::Bool(false)));
            }
        }
        Ok(Predicate::all(parts))
    }

    /// `(limit, offset)`; unpaginated resources return no limit.
    pub fn paginate(&self, table: &CompiledTable, pagination: Pagination) -> (Option<u64>, u64) {
        if !table.paginated {
            return (None, 0);
        }
        let size = pagination
            .max_results
            .filter(|n| *n > 0)
            .unwrap_or(self.config.pagination_default)
            .min(self.config.pagination_limit);
        let offset = if pagination.page > 1 {
            (pagination.page - 1).saturating_mul(size)
        } else {
            0
        };
        (Some(size), offset)
    }
}

fn compile_leaf(table: &CompiledTable, entry: &FilterEntry) -> Result<Predicate, AppError> {
    let column = table
        .column(&entry.field)
        .ok_or_else(|| AppError::Validation(format!("unknown filter field '{}'", entry.field)))?;
    let ty = column.column_type;
    if ty == ColumnType::Json && (entry.op == Operator::In || entry.op.is_ordering()) {
        return Err(AppError::Validation(format!(
            "'{}' is a document field and supports only equality",
            entry.field
        )));
    }
    let value = match entry.op {
        Operator::In => match &entry.value {
            Value::Array(items) => {
                let items = items
                    .iter()
                    .map(|v| checked_scalar(&entry.field, ty, v))
                    .collect::<Result<Vec<_>, _>>()?;
                Value::Array(items)
            }
            _ => return Err(AppError::Validation(format!("'{}__in' expects a list", entry.field))),
        },
        op if op.is_pattern() => {
            if ty != ColumnType::Text {
                return Err(AppError::Validation(format!("'{}' is not a text field", entry.field)));
            }
            match &entry.value {
                Value::String(_) => entry.value.clone(),
                _ => return Err(AppError::Validation(format!("pattern for '{}' must be a string", entry.field))),
            }
        }
        op => {
            let v = checked_scalar(&entry.field, ty, &entry.value)?;
            if op.is_ordering() && v.is_null() {
                return Err(AppError::Validation(format!("cannot order-compare '{}' with null", entry.field)));
            }
            v
        }
    };
    Ok(Predicate::compare(&column.name, entry.op, value))
}

/// Coerce text to the column's scalar type where it parses.
pub(crate) fn coerce(ty: ColumnType, v: &Value) -> Value {
    let Value::String(s) = v else { return v.clone() };
    match ty {
        ColumnType::Integer => s.trim().parse::<i64>().map(Value::from).unwrap_or_else(|_| v.clone()),
        ColumnType::Float => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| v.clone()),
        ColumnType::Boolean => match s.to_lowercase().as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => v.clone(),
        },
        _ => v.clone(),
    }
}

fn checked_scalar(field: &str, ty: ColumnType, v: &Value) -> Result<Value, AppError> {
    let v = coerce(ty, v);
    if ty != ColumnType::Json && (v.is_array() || v.is_object()) {
        return Err(AppError::Validation(format!("filter value for '{}' must be a scalar", field)));
    }
    if !ty.accepts(&v) {
        return Err(AppError::Validation(format!("filter value for '{}' does not match its type", field)));
    }
    Ok(v)
}

/// Physical columns and many-to-many fields to return.
pub fn resolve_projection(
    table: &CompiledTable,
    projection: Option<&Projection>,
) -> Result<(Vec<String>, Vec<String>), AppError> {
    let default_projection;
    let projection = match projection.filter(|p| !p.is_empty()) {
        Some(p) => Some(p),
        None => match &table.default_projection {
            Some(map) => {
                default_projection = projection_from_map(map)?;
                Some(&default_projection).filter(|p| !p.is_empty())
            }
            None => None,
        },
    };
    let all_relations = || table.many_to_many.iter().map(|m| m.field.clone()).collect::<Vec<_>>();
    let Some(projection) = projection else {
        return Ok((table.column_names().map(String::from).collect(), all_relations()));
    };

    if let Some((field, _)) = projection.iter().find(|(f, _)| !table.has_field(f)) {
        return Err(AppError::Validation(format!("unknown projection field '{}'", field)));
    }
    let include = projection[0].1;
    if projection.iter().any(|(_, flag)| *flag != include) {
        return Err(AppError::Validation(
            "projection cannot mix inclusion and exclusion".into(),
        ));
    }

    let listed = |name: &str| projection.iter().any(|(f, _)| f == name);
    let forced = |name: &str| name == table.primary_key || table.auto_fields.iter().any(|f| f == name);
    let keep = |name: &str| forced(name) || listed(name) == include;
    let columns = table
        .column_names()
        .filter(|c| keep(*c))
        .map(String::from)
        .collect();
    let relations = table
        .many_to_many
        .iter()
        .map(|m| m.field.as_str())
        .filter(|f| keep(*f))
        .map(String::from)
        .collect();
    Ok((columns, relations))
}

/// Requested (or default) order, with the primary key as final tie-break.
pub fn resolve_order(table: &CompiledTable, sort: &[(String, SortDirection)]) -> Result<Vec<SortKey>, AppError> {
    let mut order = Vec::with_capacity(sort.len() + 1);
    if sort.is_empty() {
        for (field, dir) in &table.default_sort {
            let direction = if *dir < 0 { SortDirection::Desc } else { SortDirection::Asc };
            order.push(SortKey {
                column: field.clone(),
                direction,
            });
        }
    } else {
        for (field, direction) in sort {
            if !table.has_column(field) {
                return Err(AppError::Validation(format!("unknown sort field '{}'", field)));
            }
            order.push(SortKey {
                column: field.clone(),
                direction: *direction,
            });
        }
    }
    if !order.iter().any(|k| k.column == table.primary_key) {
        order.push(SortKey {
            column: table.primary_key.clone(),
            direction: SortDirection::Asc,
        });
    }
    Ok(order)
}
