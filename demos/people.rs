//! Demo: compile `demos/people.json`, create its tables in PostgreSQL and run
//! a few data-layer operations. Reads `DATABASE_URL` (and friends) from the
//! environment or `.env`.

use resource_store::{
    load_domain_from_path, AdapterConfig, DataLayer, FilterExpression, ParsedRequest, PgDriver, QueryRequest, Record,
};
use serde_json::json;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("resource_store=info".parse()?))
        .init();

    let config = AdapterConfig::from_env()?;
    let path = std::env::var("DOMAIN_PATH").unwrap_or_else(|_| "demos/people.json".into());
    let domain = load_domain_from_path(&path).await?;
    let driver = PgDriver::connect(&config).await?;
    let data = DataLayer::init(Arc::new(driver), &domain, config).await?;

    let mut docs: Vec<Record> = [
        json!({"firstname": "john", "lastname": "doe", "prog": 2}),
        json!({"firstname": "jane", "lastname": "roe", "prog": 7}),
    ]
    .into_iter()
    .filter_map(|v| v.as_object().cloned())
    .collect();
    let ids = data.insert("people", &mut docs).await?;
    tracing::info!(?ids, "inserted people");

    let mut group: Vec<Record> = json!({"name": "admins", "owner": ids[0], "members": ids})
        .as_object()
        .cloned()
        .into_iter()
        .collect();
    data.insert("groups", &mut group).await?;

    let request = QueryRequest::from_parsed(&ParsedRequest {
        where_: Some(r#"{"lastname__startswith": "d"}"#.into()),
        sort: Some("-prog".into()),
        max_results: Some(10),
        ..Default::default()
    })?;
    let found = data.find("people", &request, None).await?;
    tracing::info!(total = found.count(), "people matching");
    for person in &found {
        println!("{}", serde_json::to_string(person)?);
    }

    let users = data.find("users", &QueryRequest::new(), None).await?;
    tracing::info!(total = users.count(), "users (prog < 5)");

    let removed = data
        .remove("people", &FilterExpression::new().with("lastname", json!("roe")))
        .await?;
    tracing::info!(removed, "soft-deleted");
    Ok(())
}
