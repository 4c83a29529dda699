//! Document validation from compiled column rules.

use crate::driver::Record;
use crate::error::AppError;
use crate::schema::{Column, ColumnType, CompiledSchema, CompiledTable, ManyToMany};
use serde_json::Value;

pub struct DocumentValidator;

impl DocumentValidator {
    /// Validate a whole document. Required fields must be present.
    pub fn validate(schema: &CompiledSchema, table: &CompiledTable, doc: &Record) -> Result<(), AppError> {
        for c in &table.columns {
            if c.auto_increment || c.has_default() {
                continue;
            }
            let missing = doc.get(&c.name).map_or(true, Value::is_null);
            if missing && (c.required || !c.nullable) {
                return Err(AppError::Validation(format!("{} is required", c.name)));
            }
        }
        Self::validate_partial(schema, table, doc)
    }

    /// Validate only the fields present in doc (for PATCH).
    pub fn validate_partial(schema: &CompiledSchema, table: &CompiledTable, doc: &Record) -> Result<(), AppError> {
        for (field, v) in doc {
            if let Some(c) = table.column(field) {
                validate_field(c, v)?;
            } else if let Some(m) = table.many_to_many(field) {
                validate_members(schema, m, v)?;
            } else {
                return Err(AppError::Validation(format!("unknown field '{}'", field)));
            }
        }
        Ok(())
    }
}

fn type_name(ty: ColumnType) -> &'static str {
    match ty {
        ColumnType::Text => "string",
        ColumnType::Boolean => "boolean",
        ColumnType::Integer => "integer",
        ColumnType::Float => "float",
        ColumnType::DateTime => "datetime",
        ColumnType::Json => "dict or list",
    }
}

fn validate_field(c: &Column, v: &Value) -> Result<(), AppError> {
    if v.is_null() {
        if !c.nullable {
            return Err(AppError::Validation(format!("{} cannot be null", c.name)));
        }
        return Ok(());
    }
    if !c.column_type.accepts(v) {
        return Err(AppError::Validation(format!(
            "{} must be of {} type",
            c.name,
            type_name(c.column_type)
        )));
    }
    let len = match v {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(items) => Some(items.len()),
        _ => None,
    };
    if let (Some(len), Some(max)) = (len, c.max_length) {
        if len > max as usize {
            return Err(AppError::Validation(format!("{} must be at most {} long", c.name, max)));
        }
    }
    if let (Some(len), Some(min)) = (len, c.min_length) {
        if len < min as usize {
            return Err(AppError::Validation(format!("{} must be at least {} long", c.name, min)));
        }
    }
    Ok(())
}

/// Members are target identifiers of the target key type.
fn validate_members(schema: &CompiledSchema, m: &ManyToMany, v: &Value) -> Result<(), AppError> {
    let items = match v {
        Value::Null => return Ok(()),
        Value::Array(items) => items,
        _ => return Err(AppError::Validation(format!("{} must be a list", m.field))),
    };
    let target = schema.table(&m.target)?;
    let key_type = target
        .pk_column()
        .map(|c| c.column_type)
        .unwrap_or(ColumnType::Integer);
    for item in items {
        if item.is_null() || !key_type.accepts(item) {
            return Err(AppError::Validation(format!(
                "{} members must be {} identifiers of '{}'",
                m.field,
                type_name(key_type),
                m.target
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AdapterConfig, Domain, FieldSpec, ResourceConfig};
    use crate::schema::compile;
    use rstest::rstest;
    use serde_json::json;

    fn schema() -> CompiledSchema {
        let domain = Domain::new()
            .resource(
                "people",
                ResourceConfig::default()
                    .field("firstname", FieldSpec::new("string").min_length(2).max_length(10))
                    .field("lastname", FieldSpec::new("string").required())
                    .field("prog", FieldSpec::new("integer"))
                    .field("born", FieldSpec::new("datetime")),
            )
            .resource(
                "groups",
                ResourceConfig::default().field("members", FieldSpec::new("list").relation("people")),
            );
        compile(&domain, &AdapterConfig::default()).unwrap()
    }

    fn doc(v: Value) -> Record {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn accepts_valid_document() {
        let s = schema();
        let people = s.table("people").unwrap();
        let d = doc(json!({"firstname": "john", "lastname": "doe", "prog": 3, "born": "1990-01-01T00:00:00Z"}));
        DocumentValidator::validate(&s, people, &d).unwrap();
    }

    #[rstest]
    #[case(json!({"firstname": "john"}), "lastname is required")]
    #[case(json!({"lastname": "doe", "nick": "j"}), "unknown field 'nick'")]
    #[case(json!({"lastname": "doe", "prog": "3"}), "prog must be of integer type")]
    #[case(json!({"lastname": "doe", "prog": 1.5}), "prog must be of integer type")]
    #[case(json!({"lastname": "doe", "firstname": "j"}), "at least 2")]
    #[case(json!({"lastname": "doe", "firstname": "johnjohnjohn"}), "at most 10")]
    #[case(json!({"lastname": "doe", "born": "yesterday"}), "born must be of datetime type")]
    #[case(json!({"lastname": null}), "lastname is required")]
    fn rejects_invalid_documents(#[case] d: Value, #[case] message: &str) {
        let s = schema();
        let people = s.table("people").unwrap();
        let err = DocumentValidator::validate(&s, people, &doc(d)).unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains(message), "{}", err);
    }

    #[test]
    fn partial_skips_required() {
        let s = schema();
        let people = s.table("people").unwrap();
        DocumentValidator::validate_partial(&s, people, &doc(json!({"prog": 4}))).unwrap();
        let err = DocumentValidator::validate_partial(&s, people, &doc(json!({"lastname": null}))).unwrap_err();
        assert!(err.to_string().contains("cannot be null"));
    }

    #[rstest]
    #[case(json!([1, 2]), true)]
    #[case(json!([]), true)]
    #[case(json!(["1"]), false)]
    #[case(json!([1.5]), false)]
    #[case(json!(1), false)]
    fn many_to_many_members_are_integer_ids(#[case] members: Value, #[case] ok: bool) {
        let s = schema();
        let groups = s.table("groups").unwrap();
        let d = doc(json!({ "members": members }));
        assert_eq!(DocumentValidator::validate(&s, groups, &d).is_ok(), ok);
    }
}
