//! Shadow database lifecycle.
//!
//! A shadow database is an ephemeral Postgres container used as a clean
//! replay target. It moves through
//! `absent -> starting -> healthy -> seeded -> migrated -> disposed`,
//! and every path that starts one must end in [`ShadowDatabase::dispose`].

use std::sync::Arc;
use std::time::Duration;

use tokio_postgres::Client;

use crate::applier;
use crate::config::StratumConfig;
use crate::container::{ContainerRuntime, ContainerSpec};
use crate::context::Context;
use crate::db::{self, quote_ident, ConnectOptions};
use crate::error::{tail, Result, StratumError};
use crate::migration::{self, Migration};
use crate::sql_parser::split_statements;

/// Platform roles and schemas every fresh database gets before migrations.
/// Idempotent, so it is safe on images that already ship them.
pub const GLOBALS_SQL: &str = r#"
DO $$
BEGIN
    IF NOT EXISTS (SELECT FROM pg_roles WHERE rolname = 'anon') THEN
        CREATE ROLE anon NOLOGIN NOINHERIT;
    END IF;
    IF NOT EXISTS (SELECT FROM pg_roles WHERE rolname = 'authenticated') THEN
        CREATE ROLE authenticated NOLOGIN NOINHERIT;
    END IF;
    IF NOT EXISTS (SELECT FROM pg_roles WHERE rolname = 'service_role') THEN
        CREATE ROLE service_role NOLOGIN NOINHERIT BYPASSRLS;
    END IF;
    IF NOT EXISTS (SELECT FROM pg_roles WHERE rolname = 'authenticator') THEN
        CREATE ROLE authenticator LOGIN NOINHERIT;
    END IF;
    IF NOT EXISTS (SELECT FROM pg_roles WHERE rolname = 'dashboard_user') THEN
        CREATE ROLE dashboard_user NOSUPERUSER CREATEDB CREATEROLE REPLICATION;
    END IF;
END
$$;

GRANT anon, authenticated, service_role TO authenticator;

CREATE SCHEMA IF NOT EXISTS extensions;
CREATE SCHEMA IF NOT EXISTS auth;
CREATE SCHEMA IF NOT EXISTS storage;
CREATE SCHEMA IF NOT EXISTS realtime;

GRANT USAGE ON SCHEMA public, extensions TO anon, authenticated, service_role;
ALTER DEFAULT PRIVILEGES IN SCHEMA public GRANT ALL ON TABLES TO anon, authenticated, service_role;
ALTER DEFAULT PRIVILEGES IN SCHEMA public GRANT ALL ON FUNCTIONS TO anon, authenticated, service_role;
ALTER DEFAULT PRIVILEGES IN SCHEMA public GRANT ALL ON SEQUENCES TO anon, authenticated, service_role;
"#;

/// Port Postgres listens on inside its container.
const CONTAINER_PG_PORT: u16 = 5432;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShadowState {
    Absent,
    Starting,
    Healthy,
    Seeded,
    Migrated,
    Disposed,
}

/// Container spec for the shadow database.
///
/// On the host network there is no port mapping, so Postgres itself is
/// moved to the shadow port.
pub fn shadow_spec(config: &StratumConfig) -> ContainerSpec {
    let shadow = &config.shadow;
    let host_network = shadow.network == "host";
    let listen_port = if host_network {
        shadow.port
    } else {
        CONTAINER_PG_PORT
    };

    let mut spec = ContainerSpec::new(&shadow.container_name, &shadow.image)
        .env("POSTGRES_PASSWORD", &config.local.password)
        .env("POSTGRES_USER", &config.local.user)
        .env("POSTGRES_HOST", "/var/run/postgresql");
    spec.network = Some(shadow.network.clone());
    spec.health_cmd = Some(format!(
        "pg_isready -U {} -h 127.0.0.1 -p {}",
        config.local.user, listen_port
    ));
    if host_network {
        spec.cmd = vec![
            "postgres".to_string(),
            "-c".to_string(),
            format!("port={}", shadow.port),
        ];
    } else {
        spec.ports = vec![(shadow.port, CONTAINER_PG_PORT)];
    }
    spec
}

/// Statements for the initial schema of a fresh database: built-in globals,
/// then `roles.sql` if present, then the configured initial schema files.
pub fn initial_scripts(ctx: &Context) -> Result<Vec<(String, Vec<String>)>> {
    let mut scripts = vec![("globals".to_string(), split_statements(GLOBALS_SQL)?)];

    let roles = ctx.config.roles_path();
    if let Some(statements) = migration::load_seed(ctx.fs.as_ref(), &roles)? {
        scripts.push((roles.display().to_string(), statements));
    }
    for path in &ctx.config.paths.initial_schema {
        let path = ctx.config.resolve(path);
        let sql = ctx
            .fs
            .read_to_string(&path)
            .map_err(|e| StratumError::file(&path, e))?;
        scripts.push((path.display().to_string(), split_statements(&sql)?));
    }
    Ok(scripts)
}

/// Run globals and initial schema scripts on a fresh database.
pub async fn seed_globals(ctx: &Context, client: &Client) -> Result<()> {
    for (label, statements) in initial_scripts(ctx)? {
        log::debug!("Running initial script; script={}", label);
        applier::run_script(client, &label, &statements, &ctx.cancel).await?;
    }
    Ok(())
}

pub struct ShadowDatabase {
    runtime: Arc<dyn ContainerRuntime>,
    id: String,
    url: String,
    client: Option<Client>,
    state: ShadowState,
}

impl ShadowDatabase {
    /// Start the container and wait for it to become healthy.
    ///
    /// On failure the container is force-removed before the error returns.
    pub async fn start(ctx: &Context) -> Result<Self> {
        ctx.guard(ctx.runtime.ping()).await?;

        let spec = shadow_spec(&ctx.config);
        log::info!(
            "Starting shadow database; container={}, port={}",
            spec.name,
            ctx.config.shadow.port
        );
        let id = match ctx.guard(ctx.runtime.start(&spec)).await {
            Ok(id) => id,
            Err(e) => {
                // A failed `run` can leave a created container behind.
                force_remove(ctx.runtime.as_ref(), &spec.name).await;
                return Err(e);
            }
        };

        let mut shadow = ShadowDatabase {
            runtime: Arc::clone(&ctx.runtime),
            id,
            url: ctx.config.shadow_connection_string("postgres"),
            client: None,
            state: ShadowState::Starting,
        };

        let timeout = Duration::from_secs(ctx.config.shadow.health_timeout_secs);
        let healthy = ctx
            .guard(ctx.runtime.wait_healthy(&shadow.id, timeout))
            .await;
        if let Err(e) = healthy {
            shadow.dispose().await;
            return Err(e);
        }
        shadow.state = ShadowState::Healthy;
        Ok(shadow)
    }

    /// Start, seed and apply `migrations` in one step.
    pub async fn start_migrated(ctx: &Context, migrations: &[Migration]) -> Result<Self> {
        let mut shadow = Self::start(ctx).await?;
        let prepared = async {
            shadow.seed(ctx).await?;
            shadow.migrate(ctx, migrations).await
        }
        .await;
        match prepared {
            Ok(()) => Ok(shadow),
            Err(e) => {
                shadow.dispose().await;
                Err(e)
            }
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ShadowState {
        self.state
    }

    /// URL of the shadow's `postgres` database.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Open (or reuse) the connection to the shadow.
    pub async fn client(&mut self, ctx: &Context) -> Result<&Client> {
        if self.client.is_none() {
            let options = ConnectOptions {
                retries: 3,
                ..ConnectOptions::local()
            };
            let client = ctx.guard(db::connect(&self.url, &options)).await?;
            self.client = Some(client);
        }
        self.client
            .as_ref()
            .ok_or_else(|| StratumError::ContainerError("shadow connection unavailable".to_string()))
    }

    /// Seed globals, custom roles, initial schema and service schemas.
    pub async fn seed(&mut self, ctx: &Context) -> Result<()> {
        let client = self.client(ctx).await?;
        seed_globals(ctx, client).await?;

        for service in &ctx.config.shadow.services {
            let mut spec = ContainerSpec::new(
                format!("{}_{}", ctx.config.shadow.container_name, service_suffix(&service.image)),
                &service.image,
            )
            .env("DATABASE_URL", &self.url)
            .env("DB_URL", &self.url);
            spec.env
                .extend(service.env.iter().map(|(k, v)| (k.clone(), v.clone())));
            spec.cmd = service.cmd.clone();
            spec.network = Some(ctx.config.shadow.network.clone());

            let mut stdout = tokio::io::sink();
            let mut stderr = Vec::new();
            log::info!("Seeding service schema; image={}", service.image);
            let code = ctx
                .guard(ctx.runtime.run_once(&spec, &mut stdout, &mut stderr))
                .await?;
            if code != 0 {
                return Err(StratumError::ContainerError(format!(
                    "service migration {} exited with code {}: {}",
                    service.image,
                    code,
                    tail(&String::from_utf8_lossy(&stderr), 10)
                )));
            }
        }

        self.state = ShadowState::Seeded;
        Ok(())
    }

    /// Apply migration history.
    pub async fn migrate(&mut self, ctx: &Context, migrations: &[Migration]) -> Result<()> {
        let schema = ctx.history_schema().to_string();
        let client = self.client(ctx).await?;
        applier::apply_all(client, &schema, migrations, &ctx.cancel).await?;
        self.state = ShadowState::Migrated;
        Ok(())
    }

    /// Create an extra database in the shadow container, seeded with globals.
    /// Returns its URL.
    pub async fn create_database(&mut self, ctx: &Context, name: &str) -> Result<String> {
        let client = self.client(ctx).await?;
        client
            .batch_execute(&format!("CREATE DATABASE {}", quote_ident(name)))
            .await?;
        let url = ctx.config.shadow_connection_string(name);
        let extra = ctx
            .guard(db::connect(&url, &ConnectOptions::local()))
            .await?;
        seed_globals(ctx, &extra).await?;
        Ok(url)
    }

    /// Close the connection and force-remove the container.
    ///
    /// Never fails and removes exactly once; a removal error is logged.
    pub async fn dispose(mut self) {
        self.client = None;
        log::debug!("Disposing shadow database; id={}", self.id);
        if let Err(e) = self.runtime.remove(&self.id).await {
            log::error!("Failed to remove shadow database {}: {}", self.id, e);
        }
        self.state = ShadowState::Disposed;
    }
}

impl Drop for ShadowDatabase {
    fn drop(&mut self) {
        if self.state != ShadowState::Disposed {
            log::warn!("Shadow database {} was not disposed", self.id);
        }
    }
}

async fn force_remove(runtime: &dyn ContainerRuntime, name: &str) {
    if let Err(e) = runtime.remove(name).await {
        log::warn!("Failed to remove container {}: {}", name, e);
    }
}

/// Last path segment of an image name without its tag, e.g. `gotrue`.
fn service_suffix(image: &str) -> String {
    let name = image.rsplit('/').next().unwrap_or(image);
    name.split(':').next().unwrap_or(name).replace(['.', '-'], "_")
}
