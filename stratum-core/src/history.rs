//! Migration history table operations.
//!
//! The table lives in its own schema (`supabase_migrations` by default) so
//! user-schema diffs never pick it up.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_postgres::Client;

use crate::db::quote_ident;
use crate::error::Result;

/// Name of the history table inside the history schema.
pub const HISTORY_TABLE: &str = "schema_migrations";

/// A row from the history table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationHistoryRow {
    pub version: String,
    pub name: Option<String>,
    pub statements: Vec<String>,
    pub inserted_at: Option<DateTime<Utc>>,
}

fn qualified(schema: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(HISTORY_TABLE))
}

/// Create the history schema and table if they do not exist.
pub async fn ensure_exists(client: &Client, schema: &str) -> Result<()> {
    let fq = qualified(schema);
    let sql = format!(
        r#"
CREATE SCHEMA IF NOT EXISTS {schema};
CREATE TABLE IF NOT EXISTS {fq} (
    version     TEXT NOT NULL PRIMARY KEY,
    name        TEXT,
    statements  TEXT[],
    inserted_at TIMESTAMPTZ DEFAULT now()
);
"#,
        schema = quote_ident(schema),
        fq = fq,
    );
    client.batch_execute(&sql).await?;

    upgrade_history_table(client, schema).await
}

/// Bring tables created by older releases up to the current column set.
async fn upgrade_history_table(client: &Client, schema: &str) -> Result<()> {
    let sql = format!(
        "ALTER TABLE {fq} ADD COLUMN IF NOT EXISTS name TEXT; \
         ALTER TABLE {fq} ADD COLUMN IF NOT EXISTS statements TEXT[]; \
         ALTER TABLE {fq} ADD COLUMN IF NOT EXISTS inserted_at TIMESTAMPTZ DEFAULT now();",
        fq = qualified(schema),
    );
    client.batch_execute(&sql).await?;
    Ok(())
}

/// Check if the history table exists.
pub async fn exists(client: &Client, schema: &str) -> Result<bool> {
    let row = client
        .query_one(
            "SELECT EXISTS (
                SELECT FROM information_schema.tables
                WHERE table_schema = $1 AND table_name = $2
            )",
            &[&schema, &HISTORY_TABLE],
        )
        .await?;
    Ok(row.get::<_, bool>(0))
}

/// Applied versions, ascending. A missing table means no history.
pub async fn list_versions(client: &Client, schema: &str) -> Result<Vec<String>> {
    if !exists(client, schema).await? {
        log::debug!("No history table; schema={}", schema);
        return Ok(Vec::new());
    }
    let sql = format!("SELECT version FROM {} ORDER BY version", qualified(schema));
    let rows = client.query(&sql, &[]).await?;
    Ok(rows.iter().map(|r| r.get::<_, String>(0)).collect())
}

/// Full history rows, ascending by version.
pub async fn list_rows(client: &Client, schema: &str) -> Result<Vec<MigrationHistoryRow>> {
    if !exists(client, schema).await? {
        return Ok(Vec::new());
    }
    let sql = format!(
        "SELECT version, name, statements, inserted_at FROM {} ORDER BY version",
        qualified(schema)
    );
    let rows = client.query(&sql, &[]).await?;

    Ok(rows
        .iter()
        .map(|row| MigrationHistoryRow {
            version: row.get(0),
            name: row.get(1),
            statements: row.get::<_, Option<Vec<String>>>(2).unwrap_or_default(),
            inserted_at: row.get(3),
        })
        .collect())
}

/// Record a migration. Re-inserting an existing version replaces its
/// name and statements.
pub async fn insert(
    client: &Client,
    schema: &str,
    version: &str,
    name: &str,
    statements: &[String],
) -> Result<()> {
    let sql = format!(
        "INSERT INTO {}(version, name, statements) VALUES ($1, $2, $3) \
         ON CONFLICT (version) DO UPDATE SET name = EXCLUDED.name, statements = EXCLUDED.statements",
        qualified(schema)
    );
    client
        .execute(&sql, &[&version, &name, &statements])
        .await?;
    log::debug!("Recorded migration; version={}, name={}", version, name);
    Ok(())
}

/// Delete every row with `version <= up_to`. Returns the number removed.
pub async fn delete_before(client: &Client, schema: &str, up_to: &str) -> Result<u64> {
    let sql = format!("DELETE FROM {} WHERE version <= $1", qualified(schema));
    Ok(client.execute(&sql, &[&up_to]).await?)
}

/// Delete the rows for the given versions. Returns the number removed.
pub async fn delete_versions(client: &Client, schema: &str, versions: &[String]) -> Result<u64> {
    let sql = format!("DELETE FROM {} WHERE version = ANY($1)", qualified(schema));
    Ok(client.execute(&sql, &[&versions]).await?)
}

/// Drop the whole history schema.
pub async fn drop_history_schema(client: &Client, schema: &str) -> Result<()> {
    let sql = format!("DROP SCHEMA IF EXISTS {} CASCADE", quote_ident(schema));
    client.batch_execute(&sql).await?;
    Ok(())
}
