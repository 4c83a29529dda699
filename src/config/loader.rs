//! Load the resource domain from a JSON document.

use crate::config::{validate, Domain};
use crate::error::SchemaError;
use std::path::Path;

/// Parse and validate a domain document: `{ "<resource>": { "schema": {...}, ... }, ... }`.
pub fn load_domain_from_str(json: &str) -> Result<Domain, SchemaError> {
    let domain: Domain = serde_json::from_str(json).map_err(|e| SchemaError::Load(e.to_string()))?;
    validate(&domain)?;
    Ok(domain)
}

pub async fn load_domain_from_path(path: impl AsRef<Path>) -> Result<Domain, SchemaError> {
    let path = path.as_ref();
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| SchemaError::Load(format!("{}: {}", path.display(), e)))?;
    tracing::debug!(path = %path.display(), "loading domain");
    load_domain_from_str(&text)
}
