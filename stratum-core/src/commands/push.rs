//! Push local migrations that the target has not applied yet.

use std::collections::HashSet;

use serde::Serialize;

use crate::applier;
use crate::commands::{local_migrations, versions};
use crate::context::{Context, Target};
use crate::error::{Result, StratumError};
use crate::history;
use crate::migration::{self, Migration};
use crate::reconcile::diverge;

#[derive(Debug, Clone, Default)]
pub struct PushOptions {
    pub target: Target,
    /// Report what would be applied without touching the target.
    pub dry_run: bool,
    /// Run the seed script after migrations.
    pub include_seed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PushReport {
    /// Versions that were pending on the target.
    pub pending: Vec<String>,
    /// Versions actually applied.
    pub applied: Vec<String>,
    pub seeded: bool,
    pub dry_run: bool,
}

/// Local migrations missing from `remote`, in apply order.
///
/// Fails with [`StratumError::HistoryConflict`] when the remote has versions
/// with no local file, or a local version sorts before the remote head.
pub fn pending_migrations<'a>(
    local: &'a [Migration],
    remote: &[String],
) -> Result<Vec<&'a Migration>> {
    let divergence = diverge(&versions(local), remote);
    divergence.check()?;
    let extra: HashSet<&str> = divergence.extra_local.iter().map(String::as_str).collect();
    Ok(local
        .iter()
        .filter(|m| extra.contains(m.version.as_str()))
        .collect())
}

/// Execute the push command.
pub async fn execute(ctx: &Context, options: &PushOptions) -> Result<PushReport> {
    let history_schema = ctx.history_schema().to_string();
    let client = ctx.connect(options.target).await?;
    let remote = ctx
        .guard(history::list_versions(&client, &history_schema))
        .await?;
    let local = local_migrations(ctx)?;
    let pending = pending_migrations(&local, &remote)?;
    let pending_versions: Vec<String> = pending.iter().map(|m| m.version.clone()).collect();

    let mut report = PushReport {
        pending: pending_versions,
        applied: Vec::new(),
        seeded: false,
        dry_run: options.dry_run,
    };
    if options.dry_run {
        log::info!(
            "Dry run: would apply {} migration(s); target={}",
            report.pending.len(),
            options.target
        );
        return Ok(report);
    }

    if pending.is_empty() {
        log::info!("Remote database is up to date; target={}", options.target);
    } else {
        let names: Vec<String> = pending
            .iter()
            .map(|m| format!("{}_{}", m.version, m.name))
            .collect();
        let question = format!(
            "Apply {} migration(s) to the {} database ({})?",
            pending.len(),
            options.target,
            names.join(", ")
        );
        if !ctx.confirm(&question, true).await? {
            return Err(StratumError::Aborted("push declined".to_string()));
        }

        ctx.guard(history::ensure_exists(&client, &history_schema))
            .await?;
        for m in pending {
            ctx.check_cancelled()?;
            applier::apply_migration(&client, &history_schema, m, &ctx.cancel).await?;
            report.applied.push(m.version.clone());
        }
    }

    if options.include_seed {
        let seed_path = ctx.config.seed_path();
        if let Some(statements) = migration::load_seed(ctx.fs.as_ref(), &seed_path)? {
            applier::seed(&client, &statements, &ctx.cancel).await?;
            report.seeded = true;
        }
    }

    log::info!(
        "Push complete; applied={}, seeded={}",
        report.applied.len(),
        report.seeded
    );
    Ok(report)
}
