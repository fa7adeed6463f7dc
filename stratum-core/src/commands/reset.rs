//! Reset a database to the state described by the local migrations.
//!
//! The local database is dropped and recreated through `template1`; the
//! remote one is emptied schema by schema after an explicit confirmation.

use serde::Serialize;
use tokio_postgres::Client;

use crate::applier;
use crate::commands::local_migrations;
use crate::context::{Context, Target};
use crate::db::{self, quote_ident, ConnectOptions};
use crate::error::{Result, StratumError};
use crate::history;
use crate::migration::{self, Migration};
use crate::shadow::seed_globals;

/// Extensions the platform installs itself; never dropped by a remote reset.
const PLATFORM_EXTENSIONS: &[&str] = &[
    "plpgsql",
    "pg_graphql",
    "pg_stat_statements",
    "pgcrypto",
    "pgjwt",
    "pgsodium",
    "supabase_vault",
    "uuid-ossp",
];

/// Drops everything a user may have created in `public`: extensions first,
/// then relations, routines and types. Objects owned by an extension are
/// left to the extension.
const DROP_OBJECTS_SQL: &str = r#"
DO $$
DECLARE
    rec record;
BEGIN
    FOR rec IN
        SELECT extname FROM pg_extension
        WHERE NOT (extname = ANY (string_to_array(current_setting('stratum.platform_extensions'), ',')))
    LOOP
        EXECUTE format('DROP EXTENSION IF EXISTS %I CASCADE', rec.extname);
    END LOOP;

    FOR rec IN
        SELECT c.relname, c.relkind
        FROM pg_class c
        JOIN pg_namespace n ON n.oid = c.relnamespace
        WHERE n.nspname = 'public'
          AND c.relkind IN ('r', 'p', 'v', 'm', 'S', 'f')
          AND NOT EXISTS (SELECT 1 FROM pg_depend d WHERE d.objid = c.oid AND d.deptype = 'e')
    LOOP
        EXECUTE format(
            'DROP %s IF EXISTS public.%I CASCADE',
            CASE rec.relkind
                WHEN 'v' THEN 'VIEW'
                WHEN 'm' THEN 'MATERIALIZED VIEW'
                WHEN 'S' THEN 'SEQUENCE'
                WHEN 'f' THEN 'FOREIGN TABLE'
                ELSE 'TABLE'
            END,
            rec.relname
        );
    END LOOP;

    FOR rec IN
        SELECT p.proname, p.prokind, pg_get_function_identity_arguments(p.oid) AS args
        FROM pg_proc p
        JOIN pg_namespace n ON n.oid = p.pronamespace
        WHERE n.nspname = 'public'
          AND NOT EXISTS (SELECT 1 FROM pg_depend d WHERE d.objid = p.oid AND d.deptype = 'e')
    LOOP
        EXECUTE format(
            'DROP %s IF EXISTS public.%I(%s) CASCADE',
            CASE rec.prokind WHEN 'p' THEN 'PROCEDURE' WHEN 'a' THEN 'AGGREGATE' ELSE 'FUNCTION' END,
            rec.proname,
            coalesce(rec.args, '')
        );
    END LOOP;

    FOR rec IN
        SELECT t.typname, t.typtype
        FROM pg_type t
        JOIN pg_namespace n ON n.oid = t.typnamespace
        WHERE n.nspname = 'public'
          AND t.typtype IN ('e', 'd', 'r', 'c')
          AND (t.typtype <> 'c' OR EXISTS (
              SELECT 1 FROM pg_class c WHERE c.oid = t.typrelid AND c.relkind = 'c'))
          AND NOT EXISTS (SELECT 1 FROM pg_depend d WHERE d.objid = t.oid AND d.deptype = 'e')
    LOOP
        EXECUTE format(
            'DROP %s IF EXISTS public.%I CASCADE',
            CASE rec.typtype WHEN 'd' THEN 'DOMAIN' ELSE 'TYPE' END,
            rec.typname
        );
    END LOOP;
END
$$;
"#;

#[derive(Debug, Clone, Serialize)]
pub struct ResetReport {
    pub target: String,
    pub version: Option<String>,
    pub applied: Vec<String>,
    pub seeded: bool,
    /// User schemas dropped (remote reset only).
    pub dropped_schemas: Vec<String>,
    /// Containers signalled or restarted (local reset only).
    pub restarted: Vec<String>,
}

/// Migrations to replay, bounded by `version` when given.
fn migrations_up_to(ctx: &Context, version: Option<&str>) -> Result<Vec<Migration>> {
    let Some(version) = version else {
        return local_migrations(ctx);
    };
    if version.is_empty() || !version.bytes().all(|b| b.is_ascii_digit()) {
        return Err(StratumError::ParseError(format!(
            "Invalid migration version '{}'",
            version
        )));
    }
    let migrations = migration::partial(ctx.fs.as_ref(), &ctx.config.migrations_dir(), version)?;
    if migrations.last().map(|m| m.version.as_str()) != Some(version) {
        return Err(StratumError::ParseError(format!(
            "No local migration with version {}",
            version
        )));
    }
    Ok(migrations)
}

/// Execute the reset command.
pub async fn execute(ctx: &Context, target: Target, version: Option<&str>) -> Result<ResetReport> {
    let migrations = migrations_up_to(ctx, version)?;
    let mut report = ResetReport {
        target: target.to_string(),
        version: version.map(str::to_string),
        applied: Vec::new(),
        seeded: false,
        dropped_schemas: Vec::new(),
        restarted: Vec::new(),
    };

    match target {
        Target::Local => reset_local(ctx, &migrations, &mut report).await?,
        Target::Linked => reset_remote(ctx, &migrations, &mut report).await?,
    }

    log::info!(
        "Reset complete; target={}, applied={}, seeded={}",
        target,
        report.applied.len(),
        report.seeded
    );
    Ok(report)
}

async fn reset_local(ctx: &Context, migrations: &[Migration], report: &mut ResetReport) -> Result<()> {
    let container = &ctx.config.local.db_container;
    ctx.guard(ctx.runtime.ping()).await?;
    match ctx.guard(ctx.runtime.inspect(container)).await? {
        Some(status) if status.running => {}
        _ => {
            return Err(StratumError::NotRunning(format!(
                "local database container {} is not running",
                container
            )))
        }
    }

    recreate_database(ctx).await?;

    let client = ctx.connect(Target::Local).await?;
    seed_globals(ctx, &client).await?;
    report.applied =
        applier::apply_all(&client, ctx.history_schema(), migrations, &ctx.cancel).await?;
    report.seeded = run_seed(ctx, &client).await?;
    drop(client);

    report.restarted = restart_services(ctx).await?;
    Ok(())
}

/// Drop and recreate the local database from `template1`.
async fn recreate_database(ctx: &Context) -> Result<()> {
    let name = ctx.config.local.database.clone();
    let admin_url = ctx.config.local_database_url("template1");
    let admin = ctx
        .guard(db::connect(&admin_url, &ConnectOptions::local()))
        .await?;
    log::info!("Recreating local database; database={}", name);

    let result = async {
        admin
            .batch_execute(&format!(
                "ALTER DATABASE {} ALLOW_CONNECTIONS false",
                quote_ident(&name)
            ))
            .await?;
        admin
            .execute(
                "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
                 WHERE datname = $1 AND pid <> pg_backend_pid()",
                &[&name],
            )
            .await?;
        admin
            .batch_execute(&format!(
                "DROP DATABASE IF EXISTS {} WITH (FORCE)",
                quote_ident(&name)
            ))
            .await?;
        admin
            .batch_execute(&format!("CREATE DATABASE {}", quote_ident(&name)))
            .await?;
        Ok::<(), StratumError>(())
    }
    .await;

    if result.is_err() {
        // Don't leave the old database locked out.
        let allow = format!("ALTER DATABASE {} ALLOW_CONNECTIONS true", quote_ident(&name));
        if let Err(e) = admin.batch_execute(&allow).await {
            log::warn!("Failed to re-allow connections to {}: {}", name, e);
        }
    }
    result
}

async fn run_seed(ctx: &Context, client: &Client) -> Result<bool> {
    let path = ctx.config.seed_path();
    match migration::load_seed(ctx.fs.as_ref(), &path)? {
        Some(statements) => {
            applier::seed(client, &statements, &ctx.cancel).await?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Reload PostgREST and restart the other services so they reconnect.
/// Containers that don't exist are skipped.
async fn restart_services(ctx: &Context) -> Result<Vec<String>> {
    let mut restarted = Vec::new();
    if let Some(rest) = &ctx.config.local.rest_container {
        if ctx.guard(ctx.runtime.inspect(rest)).await?.is_some() {
            ctx.guard(ctx.runtime.signal(rest, "SIGHUP")).await?;
            restarted.push(rest.clone());
        }
    }
    for service in &ctx.config.local.service_containers {
        match ctx.guard(ctx.runtime.inspect(service)).await? {
            Some(_) => {
                log::debug!("Restarting service; container={}", service);
                ctx.guard(ctx.runtime.restart(service)).await?;
                restarted.push(service.clone());
            }
            None => log::debug!("Service not running, skipping; container={}", service),
        }
    }
    Ok(restarted)
}

async fn reset_remote(ctx: &Context, migrations: &[Migration], report: &mut ResetReport) -> Result<()> {
    let confirmed = ctx
        .confirm(
            "Do you really want to reset the remote database? All data will be lost.",
            false,
        )
        .await?;
    if !confirmed {
        return Err(StratumError::Aborted("remote reset declined".to_string()));
    }

    let client = ctx.connect(Target::Linked).await?;
    let mut protected = ctx.config.schemas.excluded();
    protected.push("public".to_string());
    let schemas = ctx.guard(db::list_schemas(&client, &protected)).await?;

    for schema in &schemas {
        log::info!("Dropping schema; schema={}", schema);
        ctx.guard(async {
            client
                .batch_execute(&format!("DROP SCHEMA IF EXISTS {} CASCADE", quote_ident(schema)))
                .await
                .map_err(StratumError::from)
        })
        .await?;
    }
    ctx.guard(history::drop_history_schema(&client, ctx.history_schema()))
        .await?;
    ctx.guard(drop_public_objects(&client)).await?;
    report.dropped_schemas = schemas;

    report.applied =
        applier::apply_all(&client, ctx.history_schema(), migrations, &ctx.cancel).await?;
    Ok(())
}

async fn drop_public_objects(client: &Client) -> Result<()> {
    log::info!("Dropping objects in public schema");
    let set = format!(
        "SET stratum.platform_extensions = {}",
        db::quote_literal(&PLATFORM_EXTENSIONS.join(","))
    );
    client.batch_execute(&set).await?;
    client.batch_execute(DROP_OBJECTS_SQL).await?;
    client.batch_execute("RESET stratum.platform_extensions").await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StratumConfig;
    use crate::container::ContainerStatus;
    use crate::fs::MemFs;
    use crate::sql_parser::split_statements;
    use crate::test_utils::{MockRuntime, RuntimeCall, ScriptedPrompt};
    use std::path::PathBuf;
    use std::sync::Arc;

    fn context(fs: MemFs, runtime: &MockRuntime, prompt: ScriptedPrompt) -> Context {
        let mut config = StratumConfig::default();
        config.workdir = PathBuf::from("/p");
        Context::new(config)
            .with_fs(Arc::new(fs))
            .with_runtime(Arc::new(runtime.clone()))
            .with_prompt(Arc::new(prompt))
    }

    fn project() -> MemFs {
        let fs = MemFs::new();
        fs.add_file("/p/supabase/migrations/20220101000000_init.sql", "create table a();")
            .unwrap();
        fs.add_file("/p/supabase/migrations/20220102000000_b.sql", "create table b();")
            .unwrap();
        fs
    }

    #[test]
    fn test_drop_objects_script_is_one_statement() {
        let statements = split_statements(DROP_OBJECTS_SQL).unwrap();
        assert_eq!(statements.len(), 1);
    }

    #[test]
    fn test_migrations_up_to_version() {
        let runtime = MockRuntime::new();
        let ctx = context(project(), &runtime, ScriptedPrompt::default());
        let all = migrations_up_to(&ctx, None).unwrap();
        assert_eq!(all.len(), 2);
        let first = migrations_up_to(&ctx, Some("20220101000000")).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].name, "init");
    }

    #[test]
    fn test_migrations_up_to_unknown_version_is_error() {
        let runtime = MockRuntime::new();
        let ctx = context(project(), &runtime, ScriptedPrompt::default());
        assert!(matches!(
            migrations_up_to(&ctx, Some("20220101500000")),
            Err(StratumError::ParseError(_))
        ));
        assert!(matches!(
            migrations_up_to(&ctx, Some("abc")),
            Err(StratumError::ParseError(_))
        ));
    }

    #[tokio::test]
    async fn test_remote_reset_declined_does_not_connect() {
        let runtime = MockRuntime::new();
        let prompt = ScriptedPrompt::new([false]);
        let ctx = context(project(), &runtime, prompt.clone());

        let err = execute(&ctx, Target::Linked, None).await.unwrap_err();
        assert!(matches!(err, StratumError::Aborted(_)));
        assert_eq!(prompt.asked().len(), 1);
        assert!(prompt.asked()[0].contains("reset the remote database"));
    }

    #[tokio::test]
    async fn test_local_reset_requires_running_container() {
        let runtime = MockRuntime::new();
        runtime.push_status(ContainerStatus {
            running: false,
            status: "exited".to_string(),
            health: None,
        });
        let ctx = context(project(), &runtime, ScriptedPrompt::default());

        let err = execute(&ctx, Target::Local, None).await.unwrap_err();
        assert!(matches!(err, StratumError::NotRunning(_)));
        assert_eq!(
            runtime.calls(),
            vec![RuntimeCall::Ping, RuntimeCall::Inspect("stratum_db".to_string())]
        );
    }

    #[tokio::test]
    async fn test_restart_services_signals_rest_and_restarts_others() {
        let runtime = MockRuntime::new();
        let ctx = context(MemFs::new(), &runtime, ScriptedPrompt::default());

        let restarted = restart_services(&ctx).await.unwrap();
        assert_eq!(
            restarted,
            vec!["stratum_rest", "stratum_auth", "stratum_storage", "stratum_realtime"]
        );
        let calls = runtime.calls();
        assert!(calls.contains(&RuntimeCall::Signal(
            "stratum_rest".to_string(),
            "SIGHUP".to_string()
        )));
        assert!(calls.contains(&RuntimeCall::Restart("stratum_auth".to_string())));
        assert!(!calls.contains(&RuntimeCall::Restart("stratum_rest".to_string())));
    }
}
