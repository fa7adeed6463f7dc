//! Transactional migration apply.
//!
//! Each migration runs in its own transaction: its statements are sent as
//! one pipelined batch and its history row is inserted before `COMMIT`, so a
//! migration is recorded if and only if it was applied.

use std::collections::HashSet;

use tokio_postgres::Client;
use tokio_util::sync::CancellationToken;

use crate::db::{execute_batch, rollback_quietly};
use crate::error::{format_db_error, sqlstate, Result, StratumError};
use crate::history;
use crate::migration::Migration;

/// Select the migrations that still need applying.
///
/// Versions already in `remote` are skipped. A local version that sorts
/// before the newest remote version but was never applied is a
/// [`StratumError::HistoryConflict`], as are remote versions with no
/// local file.
pub fn pending<'a>(migrations: &'a [Migration], remote: &[String]) -> Result<Vec<&'a Migration>> {
    let remote_set: HashSet<&str> = remote.iter().map(String::as_str).collect();
    let local_set: HashSet<&str> = migrations.iter().map(|m| m.version.as_str()).collect();
    let max_remote = remote.iter().max();

    let mut out_of_order = Vec::new();
    let mut todo = Vec::new();
    for m in migrations {
        if remote_set.contains(m.version.as_str()) {
            continue;
        }
        if max_remote.is_some_and(|max| m.version.as_str() < max.as_str()) {
            out_of_order.push(m.version.clone());
        } else {
            todo.push(m);
        }
    }

    let extra_remote: Vec<String> = remote
        .iter()
        .filter(|v| !local_set.contains(v.as_str()))
        .cloned()
        .collect();
    if !out_of_order.is_empty() || !extra_remote.is_empty() {
        return Err(StratumError::HistoryConflict {
            extra_local: out_of_order,
            extra_remote,
        });
    }
    Ok(todo)
}

/// Apply every migration not yet recorded on the target, in version order.
/// Returns the versions applied.
pub async fn apply_all(
    client: &Client,
    history_schema: &str,
    migrations: &[Migration],
    cancel: &CancellationToken,
) -> Result<Vec<String>> {
    history::ensure_exists(client, history_schema).await?;
    let remote = history::list_versions(client, history_schema).await?;
    let todo = pending(migrations, &remote)?;

    if todo.is_empty() {
        log::info!("Database is up to date; applied={}", remote.len());
        return Ok(Vec::new());
    }

    let mut applied = Vec::with_capacity(todo.len());
    for migration in todo {
        apply_migration(client, history_schema, migration, cancel).await?;
        applied.push(migration.version.clone());
    }
    Ok(applied)
}

/// [`apply_all`] bounded to versions `<= version`.
pub async fn apply_up_to(
    client: &Client,
    history_schema: &str,
    migrations: &[Migration],
    version: &str,
    cancel: &CancellationToken,
) -> Result<Vec<String>> {
    let end = migrations
        .iter()
        .position(|m| m.version.as_str() > version)
        .unwrap_or(migrations.len());
    apply_all(client, history_schema, &migrations[..end], cancel).await
}

/// Apply a single migration and record it in one transaction.
pub async fn apply_migration(
    client: &Client,
    history_schema: &str,
    migration: &Migration,
    cancel: &CancellationToken,
) -> Result<()> {
    log::info!(
        "Applying migration; version={}, name={}, statements={}",
        migration.version,
        migration.name,
        migration.statements.len()
    );
    let start = std::time::Instant::now();

    run_in_transaction(client, &migration.version, &migration.statements, cancel, async {
        history::insert(
            client,
            history_schema,
            &migration.version,
            &migration.name,
            &migration.statements,
        )
        .await
    })
    .await?;

    log::debug!(
        "Migration applied; version={}, elapsed_ms={}",
        migration.version,
        start.elapsed().as_millis()
    );
    Ok(())
}

/// Run a seed script after migrations. Seeds are not recorded in history.
pub async fn seed(client: &Client, statements: &[String], cancel: &CancellationToken) -> Result<()> {
    log::info!("Seeding data; statements={}", statements.len());
    run_script(client, "seed", statements, cancel).await
}

/// Execute a script in one transaction. `label` identifies it in errors.
pub async fn run_script(
    client: &Client,
    label: &str,
    statements: &[String],
    cancel: &CancellationToken,
) -> Result<()> {
    run_in_transaction(client, label, statements, cancel, async { Ok(()) }).await
}

async fn run_in_transaction<F>(
    client: &Client,
    label: &str,
    statements: &[String],
    cancel: &CancellationToken,
    before_commit: F,
) -> Result<()>
where
    F: std::future::Future<Output = Result<()>>,
{
    if cancel.is_cancelled() {
        return Err(StratumError::Cancelled);
    }
    client.batch_execute("BEGIN").await?;

    let batch = tokio::select! {
        result = execute_batch(client, statements) => result,
        _ = cancel.cancelled() => {
            rollback_quietly(client).await;
            return Err(StratumError::Cancelled);
        }
    };

    if let Err(failure) = batch {
        rollback_quietly(client).await;
        let statement = statements
            .get(failure.index)
            .cloned()
            .unwrap_or_default();
        return Err(StratumError::ApplyError {
            version: label.to_string(),
            sqlstate: sqlstate(&failure.source),
            message: format_db_error(&failure.source),
            index: failure.index,
            statement,
        });
    }

    if let Err(e) = before_commit.await {
        rollback_quietly(client).await;
        return Err(e);
    }

    client.batch_execute("COMMIT").await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn migration(version: &str) -> Migration {
        Migration {
            version: version.to_string(),
            name: format!("m{}", version),
            path: PathBuf::from(format!("{}_m.sql", version)),
            statements: vec!["select 1".to_string()],
        }
    }

    fn versions(ms: &[&Migration]) -> Vec<String> {
        ms.iter().map(|m| m.version.clone()).collect()
    }

    #[test]
    fn test_pending_empty_remote_applies_everything() {
        let local = vec![migration("0"), migration("1")];
        let todo = pending(&local, &[]).unwrap();
        assert_eq!(versions(&todo), vec!["0", "1"]);
    }

    #[test]
    fn test_pending_skips_applied() {
        let local = vec![migration("0"), migration("1"), migration("2")];
        let remote = vec!["0".to_string(), "1".to_string()];
        let todo = pending(&local, &remote).unwrap();
        assert_eq!(versions(&todo), vec!["2"]);
    }

    #[test]
    fn test_pending_up_to_date_is_noop() {
        let local = vec![migration("0"), migration("1")];
        let remote = vec!["0".to_string(), "1".to_string()];
        assert!(pending(&local, &remote).unwrap().is_empty());
    }

    #[test]
    fn test_pending_gap_below_remote_max_is_conflict() {
        let local = vec![migration("0"), migration("1"), migration("2")];
        let remote = vec!["0".to_string(), "2".to_string()];
        match pending(&local, &remote).unwrap_err() {
            StratumError::HistoryConflict {
                extra_local,
                extra_remote,
            } => {
                assert_eq!(extra_local, vec!["1"]);
                assert!(extra_remote.is_empty());
            }
            other => panic!("expected HistoryConflict, got {:?}", other),
        }
    }

    #[test]
    fn test_pending_remote_only_version_is_conflict() {
        let local = vec![migration("0")];
        let remote = vec!["0".to_string(), "3".to_string()];
        match pending(&local, &remote).unwrap_err() {
            StratumError::HistoryConflict { extra_remote, .. } => {
                assert_eq!(extra_remote, vec!["3"]);
            }
            other => panic!("expected HistoryConflict, got {:?}", other),
        }
    }
}
