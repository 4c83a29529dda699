//! Compile a resource domain into table descriptors.
//!
//! Pass 1 builds base tables without relation columns, pass 2 adds foreign keys
//! and collects link-table requirements, pass 3 builds link tables, pass 4
//! resolves datasource aliases onto their source tables.

use crate::config::{check_identifier, validate, AdapterConfig, Cardinality, Domain, FieldSpec, ResourceConfig};
use crate::error::SchemaError;
use crate::schema::compiled::*;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

struct LinkRequirement {
    owner: String,
    field: String,
    target: String,
}

pub fn compile(domain: &Domain, config: &AdapterConfig) -> Result<CompiledSchema, SchemaError> {
    validate(domain)?;

    // Pass 1: base tables.
    let mut tables: Vec<CompiledTable> = Vec::new();
    for (name, resource) in domain.resources.iter() {
        if resource.source().is_some() {
            continue;
        }
        tables.push(base_table(name, resource, config)?);
    }
    let index: HashMap<String, usize> = tables
        .iter()
        .enumerate()
        .map(|(i, t)| (t.resource.clone(), i))
        .collect();

    // Pass 2: foreign keys and link requirements.
    let mut links = Vec::new();
    for (name, resource) in domain.resources.iter() {
        if resource.source().is_some() {
            continue;
        }
        for (field, relation) in resource.relations() {
            let target = resolve_target(domain, &index, name, field, &relation.target)?;
            let target_table = &tables[target];
            let target_resource = target_table.resource.clone();
            let target_table_name = target_table.table_name.clone();
            let target_pk = pk_of(target_table)?.clone();
            let owner = &mut tables[index[name]];
            match relation.cardinality {
                Cardinality::OneToMany => {
                    let spec = resource.schema.get(field).cloned().unwrap_or_default();
                    let column = Column {
                        nullable: spec.nullable.unwrap_or(!spec.required),
                        unique: spec.unique,
                        required: spec.required,
                        references: Some(ForeignKey {
                            table: target_table_name,
                            column: target_pk.name.clone(),
                        }),
                        ..Column::new(field, target_pk.column_type)
                    };
                    owner.columns.push(column);
                }
                Cardinality::ManyToMany => {
                    links.push(LinkRequirement {
                        owner: name.to_string(),
                        field: field.to_string(),
                        target: target_resource,
                    });
                }
            }
        }
    }

    // Pass 3: link tables.
    let mut link_tables: Vec<CompiledTable> = Vec::new();
    let mut taken: HashSet<String> = tables.iter().map(|t| t.table_name.clone()).collect();
    for req in &links {
        let owner = &tables[index[&req.owner]];
        let target = &tables[index[&req.target]];
        let link = link_table(req, owner, target, config)?;
        if !taken.insert(link.table_name.clone()) {
            return Err(SchemaError::DuplicateLinkTable(link.table_name));
        }
        let m2m = ManyToMany {
            field: req.field.clone(),
            target: req.target.clone(),
            link_table: link.table_name.clone(),
            local_column: link.columns[1].name.clone(),
            remote_column: link.columns[2].name.clone(),
        };
        tables[index[&req.owner]].many_to_many.push(m2m);
        link_tables.push(link);
    }

    let mut schema = CompiledSchema::default();
    for table in tables {
        let table = Arc::new(table);
        schema.order.push(table.resource.clone());
        schema.resources.insert(table.resource.clone(), table.clone());
        schema.physical.push(table);
    }
    for link in link_tables {
        let link = Arc::new(link);
        schema.links.insert(link.table_name.clone(), link.clone());
        schema.physical.push(link);
    }

    // Pass 4: datasource aliases share their source's physical table.
    for (name, resource) in domain.resources.iter() {
        let Some(source) = resource.source() else { continue };
        let source_table = schema.get(source).ok_or_else(|| SchemaError::InvalidDatasource {
            resource: name.to_string(),
            reason: format!("unknown source '{}'", source),
        })?;
        let mut alias = CompiledTable::clone(source_table);
        alias.resource = name.to_string();
        apply_resource_options(&mut alias, name, resource)?;
        schema.order.push(name.to_string());
        schema.resources.insert(name.to_string(), Arc::new(alias));
    }

    tracing::info!(
        resources = schema.order.len(),
        link_tables = schema.links.len(),
        "schema compiled"
    );
    Ok(schema)
}

fn base_table(name: &str, resource: &ResourceConfig, config: &AdapterConfig) -> Result<CompiledTable, SchemaError> {
    let declared_pks: Vec<String> = resource
        .schema
        .iter()
        .filter(|(_, spec)| spec.primary_key)
        .map(|(field, _)| field.to_string())
        .collect();
    if declared_pks.len() > 1 {
        return Err(SchemaError::MultiplePrimaryKeys {
            resource: name.to_string(),
            fields: declared_pks,
        });
    }

    let mut reserved = vec![CREATED.to_string(), UPDATED.to_string()];
    if resource.soft_delete {
        reserved.push(config.deleted_field.clone());
    }
    if declared_pks.is_empty() {
        reserved.push(config.id_field.clone());
    }

    let mut columns = Vec::new();
    if declared_pks.is_empty() {
        check_identifier(&config.id_field)?;
        columns.push(Column::identity(&config.id_field));
    }
    for (field, spec) in resource.schema.iter() {
        if reserved.iter().any(|r| r == field) {
            return Err(SchemaError::ReservedField {
                resource: name.to_string(),
                field: field.to_string(),
            });
        }
        let column_type = ColumnType::parse(&spec.type_).ok_or_else(|| SchemaError::UnknownType {
            resource: name.to_string(),
            field: field.to_string(),
            type_name: spec.type_.clone(),
        })?;
        if spec.data_relation.is_some() {
            if spec.primary_key {
                return Err(SchemaError::RelationPrimaryKey {
                    resource: name.to_string(),
                    field: field.to_string(),
                });
            }
            continue;
        }
        columns.push(field_column(name, field, spec, column_type)?);
    }
    columns.push(Column::timestamp(CREATED));
    columns.push(Column::timestamp(UPDATED));
    let deleted_column = if resource.soft_delete {
        check_identifier(&config.deleted_field)?;
        columns.push(Column {
            nullable: false,
            default: Some(serde_json::Value::Bool(false)),
            ..Column::new(&config.deleted_field, ColumnType::Boolean)
        });
        Some(config.deleted_field.clone())
    } else {
        None
    };

    let primary_key = declared_pks
        .into_iter()
        .next()
        .unwrap_or_else(|| config.id_field.clone());
    let mut table = CompiledTable {
        resource: name.to_string(),
        table_name: name.to_string(),
        kind: TableKind::Resource,
        columns,
        primary_key,
        deleted_column,
        many_to_many: Vec::new(),
        unique_together: Vec::new(),
        allowed_filters: AllowedFilters::All,
        auto_fields: Vec::new(),
        default_filter: serde_json::Map::new(),
        default_projection: None,
        default_sort: Vec::new(),
        paginated: true,
    };
    apply_resource_options(&mut table, name, resource)?;
    Ok(table)
}

fn field_column(resource: &str, field: &str, spec: &FieldSpec, column_type: ColumnType) -> Result<Column, SchemaError> {
    if let Some(default) = &spec.default {
        if !column_type.accepts(default) {
            return Err(SchemaError::InvalidDefault {
                resource: resource.to_string(),
                field: field.to_string(),
            });
        }
    }
    let column = if spec.primary_key {
        Column {
            nullable: false,
            unique: true,
            primary_key: true,
            auto_increment: column_type == ColumnType::Integer,
            ..Column::new(field, column_type)
        }
    } else {
        Column {
            nullable: spec.nullable.unwrap_or(!spec.required),
            unique: spec.unique,
            default: spec.default.clone(),
            required: spec.required,
            min_length: spec.minlength,
            max_length: spec.maxlength,
            ..Column::new(field, column_type)
        }
    };
    Ok(column)
}

/// Per-resource read options. Shared by base tables and aliases.
fn apply_resource_options(table: &mut CompiledTable, name: &str, resource: &ResourceConfig) -> Result<(), SchemaError> {
    table.allowed_filters = AllowedFilters::from_list(&resource.allowed_filters);
    table.auto_fields = resource.auto_fields.clone();
    table.paginated = resource.pagination;
    if let Some(ds) = &resource.datasource {
        if let Some(filter) = &ds.filter {
            for key in filter.keys() {
                let field = key.split("__").next().unwrap_or(key);
                if !table.has_column(field) {
                    return Err(SchemaError::InvalidDatasource {
                        resource: name.to_string(),
                        reason: format!("filter on unknown field '{}'", field),
                    });
                }
            }
            table.default_filter = filter.clone();
        }
        table.default_projection = ds.projection.clone();
        if let Some(sort) = &ds.default_sort {
            if let Some((field, _)) = sort.iter().find(|(f, _)| !table.has_column(f)) {
                return Err(SchemaError::InvalidDatasource {
                    resource: name.to_string(),
                    reason: format!("default sort on unknown field '{}'", field),
                });
            }
            table.default_sort = sort.clone();
        }
    }
    Ok(())
}

fn resolve_target(
    domain: &Domain,
    index: &HashMap<String, usize>,
    owner: &str,
    field: &str,
    target: &str,
) -> Result<usize, SchemaError> {
    let unknown = || SchemaError::UnknownResource {
        resource: owner.to_string(),
        field: field.to_string(),
        target: target.to_string(),
    };
    let physical = match domain.get(target) {
        Some(cfg) => cfg.source().unwrap_or(target),
        None => return Err(unknown()),
    };
    index.get(physical).copied().ok_or_else(unknown)
}

fn pk_of(table: &CompiledTable) -> Result<&Column, SchemaError> {
    table
        .pk_column()
        .ok_or_else(|| SchemaError::InvalidIdentifier(table.primary_key.clone()))
}

fn link_table(
    req: &LinkRequirement,
    owner: &CompiledTable,
    target: &CompiledTable,
    config: &AdapterConfig,
) -> Result<CompiledTable, SchemaError> {
    let name = format!("{}_{}", req.owner, req.target);
    let local = format!("{}_{}", req.owner, config.id_field);
    let mut remote = format!("{}_{}", req.target, config.id_field);
    if remote == local {
        remote = format!("{}_{}", req.field, config.id_field);
    }
    if remote == local {
        remote = format!("{}_target_{}", req.field, config.id_field);
    }
    for ident in [&name, &local, &remote] {
        check_identifier(ident)?;
    }

    let owner_pk = pk_of(owner)?;
    let target_pk = pk_of(target)?;
    let fk_column = |column: &str, table: &CompiledTable, pk: &Column| Column {
        nullable: false,
        required: true,
        references: Some(ForeignKey {
            table: table.table_name.clone(),
            column: pk.name.clone(),
        }),
        ..Column::new(column, pk.column_type)
    };
    let columns = vec![
        Column::identity(&config.id_field),
        fk_column(&local, owner, owner_pk),
        fk_column(&remote, target, target_pk),
        Column::timestamp(CREATED),
        Column::timestamp(UPDATED),
    ];
    Ok(CompiledTable {
        resource: name.clone(),
        table_name: name,
        kind: TableKind::Link,
        columns,
        primary_key: config.id_field.clone(),
        deleted_column: None,
        many_to_many: Vec::new(),
        unique_together: vec![vec![local, remote]],
        allowed_filters: AllowedFilters::All,
        auto_fields: Vec::new(),
        default_filter: serde_json::Map::new(),
        default_projection: None,
        default_sort: Vec::new(),
        paginated: false,
    })
}
