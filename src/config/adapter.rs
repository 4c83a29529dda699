//! Adapter settings, passed explicitly to every component.

use crate::error::SchemaError;

#[derive(Clone, Debug, PartialEq)]
pub struct AdapterConfig {
    /// Name of the synthesized identity column when a resource declares no primary key.
    pub id_field: String,
    /// Name of the soft-delete flag column.
    pub deleted_field: String,
    pub pagination_default: u64,
    pub pagination_limit: u64,
    /// chrono format string for datetime values in records; RFC 3339 when unset.
    pub date_format: Option<String>,
    pub database_url: String,
    /// PostgreSQL schema holding the resource tables.
    pub db_schema: String,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        AdapterConfig {
            id_field: "id".into(),
            deleted_field: "_deleted".into(),
            pagination_default: 25,
            pagination_limit: 50,
            date_format: None,
            database_url: "postgres://localhost/resources".into(),
            db_schema: "public".into(),
        }
    }
}

impl AdapterConfig {
    /// Read settings from the environment (after loading `.env` if present).
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self, SchemaError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, SchemaError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = AdapterConfig::default();
        if let Some(v) = lookup("ID_FIELD") {
            cfg.id_field = v;
        }
        if let Some(v) = lookup("DELETED_FIELD") {
            cfg.deleted_field = v;
        }
        if let Some(v) = lookup("PAGINATION_DEFAULT") {
            cfg.pagination_default = parse_number("PAGINATION_DEFAULT", &v)?;
        }
        if let Some(v) = lookup("PAGINATION_LIMIT") {
            cfg.pagination_limit = parse_number("PAGINATION_LIMIT", &v)?;
        }
        if let Some(v) = lookup("DATE_FORMAT") {
            cfg.date_format = Some(v).filter(|s| !s.is_empty());
        }
        if let Some(v) = lookup("DATABASE_URL") {
            cfg.database_url = v;
        }
        if let Some(v) = lookup("DB_SCHEMA") {
            cfg.db_schema = v;
        }
        if cfg.pagination_default > cfg.pagination_limit {
            tracing::warn!(
                default = cfg.pagination_default,
                limit = cfg.pagination_limit,
                "PAGINATION_DEFAULT exceeds PAGINATION_LIMIT; pages are capped at the limit"
            );
        }
        Ok(cfg)
    }
}

fn parse_number(key: &str, v: &str) -> Result<u64, SchemaError> {
    v.trim()
        .parse()
        .map_err(|_| SchemaError::Load(format!("{} must be a non-negative integer, got '{}'", key, v)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn lookup_overrides_defaults() {
        let env: HashMap<&str, &str> = [("ID_FIELD", "_id"), ("PAGINATION_LIMIT", "100"), ("DATE_FORMAT", "")]
            .into_iter()
            .collect();
        let cfg = AdapterConfig::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(cfg.id_field, "_id");
        assert_eq!(cfg.pagination_limit, 100);
        assert_eq!(cfg.pagination_default, 25);
        assert_eq!(cfg.date_format, None);
    }

    #[test]
    fn bad_number_is_a_load_error() {
        let err = AdapterConfig::from_lookup(|k| (k == "PAGINATION_DEFAULT").then(|| "ten".to_string())).unwrap_err();
        assert!(matches!(err, SchemaError::Load(_)));
    }
}
