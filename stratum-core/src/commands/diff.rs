//! Diff a database (or the declarative schema) against the migration history.

use std::path::PathBuf;

use serde::Serialize;

use crate::applier;
use crate::commands::{local_migrations, write_migration};
use crate::context::{Context, Target};
use crate::db::{self, ConnectOptions};
use crate::differ::{self, find_drop_statements, DiffRequest};
use crate::error::{Result, StratumError};
use crate::migration::{self, Migration};
use crate::shadow::ShadowDatabase;

/// Database created next to the shadow's own for declarative diffs.
const DECLARED_DATABASE: &str = "declared";

#[derive(Debug, Clone, Default)]
pub struct DiffOptions {
    pub target: Target,
    /// Schemas to diff; empty means every user schema.
    pub schemas: Vec<String>,
    /// Write the diff to a new migration with this name.
    pub file: Option<String>,
    /// Compare the declarative schema directory instead of a live database.
    pub declarative: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiffReport {
    pub source: String,
    pub schemas: Vec<String>,
    pub diff: String,
    pub drop_statements: Vec<String>,
    /// Migration file written, if any.
    pub path: Option<PathBuf>,
}

impl DiffReport {
    pub fn is_empty(&self) -> bool {
        self.diff.trim().is_empty()
    }
}

/// Replay `migrations` on a fresh shadow and diff `source_url` against it.
/// The shadow is always disposed.
pub(crate) async fn diff_with_shadow(
    ctx: &Context,
    migrations: &[Migration],
    source_url: &str,
    schemas: Vec<String>,
) -> Result<String> {
    let shadow = ShadowDatabase::start_migrated(ctx, migrations).await?;
    let request = DiffRequest {
        source_url: source_url.to_string(),
        target_url: shadow.url().to_string(),
        schemas,
    };
    let result = differ::diff(ctx, &request).await;
    shadow.dispose().await;
    result
}

/// Execute the diff command.
pub async fn execute(ctx: &Context, options: &DiffOptions) -> Result<DiffReport> {
    let migrations = local_migrations(ctx)?;

    let (source, schemas, diff) = if options.declarative {
        let (schemas, diff) = declarative_diff(ctx, &migrations, &options.schemas).await?;
        ("declarative".to_string(), schemas, diff)
    } else {
        let source_url = ctx.target_url(options.target)?;
        let schemas = if options.schemas.is_empty() {
            let client = ctx.connect(options.target).await?;
            ctx.guard(db::list_schemas(&client, &ctx.config.schemas.excluded()))
                .await?
        } else {
            options.schemas.clone()
        };
        let diff = diff_with_shadow(ctx, &migrations, &source_url, schemas.clone()).await?;
        (options.target.to_string(), schemas, diff)
    };

    let drop_statements = find_drop_statements(&diff);
    for stmt in &drop_statements {
        log::debug!("Found drop statement in schema diff; statement={}", stmt);
    }

    let mut path = None;
    if let Some(name) = &options.file {
        if diff.trim().is_empty() {
            log::info!("No schema changes found; not writing a migration");
        } else {
            let written = write_migration(
                ctx.fs.as_ref(),
                &ctx.config.migrations_dir(),
                name,
                &diff,
            )?;
            path = Some(written.path);
        }
    }

    Ok(DiffReport {
        source,
        schemas,
        diff,
        drop_statements,
        path,
    })
}

/// Build the declared schema in a second database of the shadow container
/// and diff it against the replayed migrations.
async fn declarative_diff(
    ctx: &Context,
    migrations: &[Migration],
    requested: &[String],
) -> Result<(Vec<String>, String)> {
    let dir = ctx.config.schemas_dir();
    let fragments = migration::load_sql_dir(ctx.fs.as_ref(), &dir)?;
    if fragments.is_empty() {
        return Err(StratumError::ConfigError(format!(
            "No declarative schema files found in {}",
            dir.display()
        )));
    }

    let mut shadow = ShadowDatabase::start_migrated(ctx, migrations).await?;
    let result = async {
        let declared_url = shadow.create_database(ctx, DECLARED_DATABASE).await?;
        let declared = ctx
            .guard(db::connect(&declared_url, &ConnectOptions::local()))
            .await?;
        for (path, statements) in &fragments {
            let label = path.display().to_string();
            log::debug!("Applying declarative schema; file={}", label);
            applier::run_script(&declared, &label, statements, &ctx.cancel).await?;
        }

        let schemas = if requested.is_empty() {
            ctx.guard(db::list_schemas(&declared, &ctx.config.schemas.excluded()))
                .await?
        } else {
            requested.to_vec()
        };
        let request = DiffRequest {
            source_url: declared_url,
            target_url: shadow.url().to_string(),
            schemas: schemas.clone(),
        };
        let diff = differ::diff(ctx, &request).await?;
        Ok((schemas, diff))
    }
    .await;
    shadow.dispose().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StratumConfig;
    use crate::fs::MemFs;
    use crate::test_utils::MockRuntime;
    use std::sync::Arc;

    fn context(fs: &Arc<MemFs>, runtime: &MockRuntime) -> Context {
        let mut config = StratumConfig::default();
        config.workdir = PathBuf::from("/project");
        Context::new(config)
            .with_fs(fs.clone())
            .with_runtime(Arc::new(runtime.clone()))
    }

    #[tokio::test]
    async fn test_declarative_without_schema_files_is_config_error() {
        let fs = Arc::new(MemFs::new());
        let runtime = MockRuntime::new();
        let ctx = context(&fs, &runtime);
        let options = DiffOptions {
            declarative: true,
            ..Default::default()
        };
        let err = execute(&ctx, &options).await.unwrap_err();
        assert!(matches!(err, StratumError::ConfigError(_)));
        assert!(runtime.started().is_empty());
    }

    #[tokio::test]
    async fn test_shadow_failure_still_removes_container() {
        let fs = Arc::new(MemFs::new());
        let runtime = MockRuntime::new();
        runtime.set_default_health("unhealthy");
        runtime.set_logs("FATAL: could not bind");
        let mut ctx = context(&fs, &runtime);
        ctx.config.shadow.health_timeout_secs = 0;

        let err = diff_with_shadow(&ctx, &[], "postgresql://remote/db", vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, StratumError::ShadowUnhealthy { .. }));
        assert_eq!(runtime.started().len(), 1);
        assert_eq!(runtime.removed(), vec![MockRuntime::id_for("stratum_shadow")]);
        assert!(runtime.runs().is_empty());
    }

    #[test]
    fn test_report_is_empty() {
        let report = DiffReport {
            source: "local".to_string(),
            schemas: vec!["public".to_string()],
            diff: "\n".to_string(),
            drop_statements: vec![],
            path: None,
        };
        assert!(report.is_empty());
    }
}
