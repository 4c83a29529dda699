//! Domain validation: identifiers and datasource references.

use crate::config::Domain;
use crate::error::SchemaError;
use regex::Regex;
use std::sync::LazyLock;

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// Names end up quoted in SQL, but are still restricted to plain identifiers.
pub fn check_identifier(name: &str) -> Result<(), SchemaError> {
    if name.len() <= 63 && IDENTIFIER.is_match(name) {
        Ok(())
    } else {
        Err(SchemaError::InvalidIdentifier(name.to_string()))
    }
}

pub fn validate(domain: &Domain) -> Result<(), SchemaError> {
    for (name, resource) in domain.resources.iter() {
        check_identifier(name)?;
        for field in resource.schema.keys() {
            check_identifier(field)?;
        }
        if let Some(source) = resource.source() {
            let Some(target) = domain.get(source) else {
                return Err(SchemaError::InvalidDatasource {
                    resource: name.to_string(),
                    reason: format!("unknown source '{}'", source),
                });
            };
            if !resource.schema.is_empty() {
                return Err(SchemaError::InvalidDatasource {
                    resource: name.to_string(),
                    reason: format!("an alias of '{}' cannot declare its own schema", source),
                });
            }
            if target.source().is_some() {
                return Err(SchemaError::InvalidDatasource {
                    resource: name.to_string(),
                    reason: format!("source '{}' is itself an alias", source),
                });
            }
        }
    }
    Ok(())
}
