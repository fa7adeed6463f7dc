//! Squash migrations into a single anchor file.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Serialize;

use crate::commands::local_migrations;
use crate::context::{Context, Target};
use crate::dump::{self, DumpOptions};
use crate::error::{Result, StratumError};
use crate::history;
use crate::migration::{self, Migration};
use crate::shadow::ShadowDatabase;
use crate::sql_parser::split_statements;

#[derive(Debug, Clone, Serialize)]
pub struct SquashReport {
    /// Version every earlier migration was merged into; `None` when there
    /// was nothing to squash.
    pub anchor: Option<String>,
    pub path: Option<PathBuf>,
    pub removed: Vec<PathBuf>,
    pub baselined: bool,
}

/// Lines of `after` that are not in `before`, in order. Repeated lines are
/// matched one for one.
pub fn line_diff(before: &str, after: &str) -> String {
    let mut seen: HashMap<&str, usize> = HashMap::new();
    for line in before.lines() {
        *seen.entry(line).or_default() += 1;
    }
    let mut out = String::new();
    for line in after.lines() {
        match seen.get_mut(line) {
            Some(count) if *count > 0 => *count -= 1,
            _ => {
                out.push_str(line);
                out.push('\n');
            }
        }
    }
    out
}

/// Data dump of the managed schemas with every row in its own INSERT, so a
/// line diff of two dumps is itself valid SQL.
fn managed_data_options(ctx: &Context) -> DumpOptions {
    DumpOptions {
        single_row_inserts: true,
        ..DumpOptions::data_only(ctx.config.schemas.managed.clone())
    }
}

/// Replay `migrations` on a shadow and return the squashed contents: the
/// schema dump followed by rows the migrations added to managed schemas.
async fn squashed_contents(ctx: &Context, migrations: &[Migration]) -> Result<String> {
    let mut shadow = ShadowDatabase::start(ctx).await?;
    let result = async {
        shadow.seed(ctx).await?;
        let url = shadow.url().to_string();
        let managed = managed_data_options(ctx);

        let before = dump::dump_to_string(ctx, &url, &managed).await?;
        shadow.migrate(ctx, migrations).await?;
        let schema = dump::dump_to_string(
            ctx,
            &url,
            &DumpOptions::schema_only(ctx.config.schemas.excluded()),
        )
        .await?;
        let after = dump::dump_to_string(ctx, &url, &managed).await?;

        let mut contents = schema;
        let data = line_diff(&before, &after);
        if !data.trim().is_empty() {
            contents.push('\n');
            contents.push_str(&data);
        }
        Ok(contents)
    }
    .await;
    shadow.dispose().await;
    result
}

/// Execute the squash command.
///
/// With `linked`, the remote history is baselined to the anchor after a
/// confirmation.
pub async fn execute(ctx: &Context, version: Option<&str>, linked: bool) -> Result<SquashReport> {
    let dir = ctx.config.migrations_dir();
    let migrations = match version {
        Some(v) => migration::partial(ctx.fs.as_ref(), &dir, v)?,
        None => local_migrations(ctx)?,
    };
    let Some(anchor) = migrations.last().cloned() else {
        log::info!("No migrations to squash");
        return Ok(SquashReport {
            anchor: None,
            path: None,
            removed: Vec::new(),
            baselined: false,
        });
    };
    log::info!(
        "Squashing migrations; count={}, anchor={}",
        migrations.len(),
        anchor.version
    );

    let contents = squashed_contents(ctx, &migrations).await?;
    ctx.check_cancelled()?;

    ctx.fs
        .write_string(&anchor.path, &contents)
        .map_err(|e| StratumError::file(&anchor.path, e))?;
    let mut removed = Vec::new();
    for m in &migrations[..migrations.len() - 1] {
        ctx.fs
            .remove_file(&m.path)
            .map_err(|e| StratumError::file(&m.path, e))?;
        log::debug!("Removed squashed migration; path={}", m.path.display());
        removed.push(m.path.clone());
    }

    let mut baselined = false;
    if linked
        && ctx
            .confirm("Update remote migration history table?", true)
            .await?
    {
        let statements = split_statements(&contents)?;
        baseline(ctx, &anchor, &statements).await?;
        baselined = true;
    }

    Ok(SquashReport {
        anchor: Some(anchor.version),
        path: Some(anchor.path),
        removed,
        baselined,
    })
}

/// Collapse remote history up to the anchor into a single row.
async fn baseline(ctx: &Context, anchor: &Migration, statements: &[String]) -> Result<()> {
    let schema = ctx.history_schema();
    let client = ctx.connect(Target::Linked).await?;
    ctx.guard(history::ensure_exists(&client, schema)).await?;

    client.batch_execute("BEGIN").await?;
    let result = async {
        let deleted = history::delete_before(&client, schema, &anchor.version).await?;
        history::insert(&client, schema, &anchor.version, &anchor.name, statements).await?;
        Ok::<u64, StratumError>(deleted)
    }
    .await;
    match result {
        Ok(deleted) => {
            client.batch_execute("COMMIT").await?;
            log::info!(
                "Baselined remote history; version={}, replaced={}",
                anchor.version,
                deleted
            );
            Ok(())
        }
        Err(e) => {
            crate::db::rollback_quietly(&client).await;
            Err(e)
        }
    }
}
