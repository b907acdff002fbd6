//! Destination schema probing.
//!
//! The destination is pre-existing and its exact shape varies between
//! deployments: optional tables may be absent and optional columns may
//! not have been created yet. Everything here asks the live catalog
//! instead of assuming, and every statement is generic over
//! [`GenericClient`] so probes run inside the migration transaction.

use std::collections::BTreeSet;

use tokio_postgres::GenericClient;
use tracing::{debug, info};

use crate::error::Result;

/// Quote a PostgreSQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Schemas on the active search path, session schemas included.
pub async fn active_schemas<C: GenericClient>(client: &C) -> Result<Vec<String>> {
    let row = client
        .query_one("SELECT current_schemas(true)::text[]", &[])
        .await?;
    Ok(row.get(0))
}

/// Find the schema that owns `table`, preferring one already on the
/// active search path, otherwise the first match by schema name.
/// `None` when no schema has the table at all.
pub async fn resolve_table_schema<C: GenericClient>(
    client: &C,
    table: &str,
) -> Result<Option<String>> {
    let rows = client
        .query(
            "SELECT table_schema::text FROM information_schema.tables \
             WHERE table_name = $1 ORDER BY table_schema",
            &[&table],
        )
        .await?;
    let owners: Vec<String> = rows.iter().map(|r| r.get(0)).collect();
    if owners.is_empty() {
        return Ok(None);
    }

    for schema in active_schemas(client).await? {
        if owners.contains(&schema) {
            return Ok(Some(schema));
        }
    }
    Ok(owners.into_iter().next())
}

/// Point the transaction's search path at `schema`.
pub async fn set_search_path<C: GenericClient>(client: &C, schema: &str) -> Result<()> {
    info!("Setting search_path to schema {schema}");
    client
        .execute(&format!("SET search_path TO {}", quote_ident(schema)), &[])
        .await?;
    Ok(())
}

/// Whether `table` is visible on the active search path.
pub async fn table_exists<C: GenericClient>(client: &C, table: &str) -> Result<bool> {
    let row = client
        .query_one(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
             WHERE table_name = $1 AND table_schema = ANY(current_schemas(true)))",
            &[&table],
        )
        .await?;
    Ok(row.get(0))
}

/// Column names `table` actually has, on the active search path.
pub async fn table_columns<C: GenericClient>(client: &C, table: &str) -> Result<BTreeSet<String>> {
    let rows = client
        .query(
            "SELECT column_name::text FROM information_schema.columns \
             WHERE table_name = $1 AND table_schema = ANY(current_schemas(true))",
            &[&table],
        )
        .await?;
    let columns: BTreeSet<String> = rows.iter().map(|r| r.get(0)).collect();
    debug!("Probed {table}: {} columns", columns.len());
    Ok(columns)
}

/// Current maximum `id` in `table`, 0 when empty.
pub async fn max_id<C: GenericClient>(client: &C, table: &str) -> Result<i64> {
    let row = client
        .query_one(
            &format!(
                "SELECT COALESCE(MAX(id), 0)::bigint FROM {}",
                quote_ident(table)
            ),
            &[],
        )
        .await?;
    Ok(row.get(0))
}

/// Resynchronize the serial/identity sequence behind `table.id` to the
/// table's current maximum. Returns whether a reset actually ran; a
/// table with no backing sequence or no rows is left alone.
pub async fn resync_id_sequence<C: GenericClient>(client: &C, table: &str) -> Result<bool> {
    let row = client
        .query_one("SELECT pg_get_serial_sequence($1, 'id')", &[&table])
        .await?;
    let sequence: Option<String> = row.get(0);
    let Some(sequence) = sequence else {
        debug!("Table {table} has no id sequence to resynchronize");
        return Ok(false);
    };

    let max = max_id(client, table).await?;
    if max == 0 {
        debug!("Table {table} is empty, leaving sequence {sequence} alone");
        return Ok(false);
    }

    client
        .query_one("SELECT setval($1::text::regclass, $2)", &[&sequence, &max])
        .await?;
    info!("Resynchronized sequence {sequence} to {max}");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident_wraps_and_doubles_quotes() {
        assert_eq!(quote_ident("users"), "\"users\"");
        assert_eq!(quote_ident("odd\"name"), "\"odd\"\"name\"");
    }
}
