//! Apply a compiled schema to storage: every physical table first, then
//! foreign keys, so references never point at a missing table.

use crate::driver::Driver;
use crate::error::StorageError;
use crate::schema::CompiledSchema;

/// Idempotent: tables are created if absent and existing foreign keys are kept.
pub async fn apply_schema(driver: &dyn Driver, schema: &CompiledSchema) -> Result<(), StorageError> {
    let mut tables = 0usize;
    for table in schema.physical_tables() {
        driver.create_table(table).await?;
        tables += 1;
    }
    for table in schema.physical_tables() {
        driver.add_foreign_keys(table).await?;
    }
    tracing::info!(tables, "schema applied");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AdapterConfig, Domain, FieldSpec, ResourceConfig};
    use crate::driver::MemoryDriver;
    use crate::schema::compile;

    #[tokio::test]
    async fn creates_base_and_link_tables_twice_without_error() {
        let domain = Domain::new()
            .resource("people", ResourceConfig::default().field("name", FieldSpec::new("string")))
            .resource(
                "groups",
                ResourceConfig::default().field("members", FieldSpec::new("list").relation("people")),
            );
        let schema = compile(&domain, &AdapterConfig::default()).unwrap();
        let driver = MemoryDriver::new();
        apply_schema(&driver, &schema).await.unwrap();
        apply_schema(&driver, &schema).await.unwrap();
        let mut tx = driver.begin().await.unwrap();
        for t in schema.physical_tables() {
            let n = tx.count(t, &crate::query::Predicate::always()).await.unwrap();
            assert_eq!(n, 0, "{}", t.table_name);
        }
    }
}
