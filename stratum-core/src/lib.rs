//! Local-versus-remote Postgres migration reconciliation.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use stratum_core::config::{CliOverrides, StratumConfig};
//! use stratum_core::Stratum;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = StratumConfig::load(None, &CliOverrides::default())?;
//! let stratum = Stratum::new(config);
//! let report = stratum.push(&Default::default()).await?;
//! println!("Applied {} migrations", report.applied.len());
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`config`]: Configuration loading (TOML, env vars, CLI overrides)
//! - [`context`]: Per-command context: config, filesystem, runtime, prompt, cancellation
//! - [`fs`]: Filesystem abstraction with an in-memory implementation
//! - [`migration`]: Migration file discovery, parsing and creation
//! - [`sql_parser`]: State-machine SQL statement splitter
//! - [`db`]: Database connections, TLS, pipelined batches
//! - [`history`]: `schema_migrations` table operations
//! - [`applier`]: Transactional migration apply
//! - [`reconcile`]: Local/remote history comparison and repair suggestions
//! - [`container`]: Container runtime seam and the docker CLI implementation
//! - [`shadow`]: Shadow database lifecycle
//! - [`differ`]: External schema differ driver
//! - [`dump`]: pg_dump driver
//! - [`prompt`]: Interactive confirmation
//! - [`commands`]: Reconciler commands
//! - [`error`]: Error types

pub mod applier;
pub mod commands;
pub mod config;
pub mod container;
pub mod context;
pub mod db;
pub mod differ;
pub mod dump;
pub mod error;
pub mod fs;
pub mod history;
pub mod migration;
pub mod prompt;
pub mod reconcile;
pub mod shadow;
pub mod sql_parser;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

use std::io::Read;
use std::path::Path;

use tokio::io::AsyncWrite;

use config::StratumConfig;
use context::{Context, Target};
use error::Result;

pub use commands::diff::{DiffOptions, DiffReport};
pub use commands::dump::DumpReport;
pub use commands::list::ListRow;
pub use commands::new::NewReport;
pub use commands::pull::{PullReport, PullStatus};
pub use commands::push::{PushOptions, PushReport};
pub use commands::repair::{RepairReport, RepairStatus};
pub use commands::reset::ResetReport;
pub use commands::squash::SquashReport;
pub use config::CliOverrides;
pub use dump::{DumpMode, DumpOptions};
pub use error::StratumError;

/// Main entry point for the stratum library.
///
/// Wraps a [`Context`] and exposes one method per reconciler command.
pub struct Stratum {
    ctx: Context,
}

impl Stratum {
    /// Create an instance backed by the real filesystem, docker and stdin.
    pub fn new(config: StratumConfig) -> Self {
        Self {
            ctx: Context::new(config),
        }
    }

    /// Create an instance from a prepared context.
    pub fn with_context(ctx: Context) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Write a new migration file.
    pub fn new_migration(&self, name: &str, input: Option<&mut dyn Read>) -> Result<NewReport> {
        commands::new::execute(&self.ctx, name, input)
    }

    /// Pull remote schema changes into a new migration.
    pub async fn pull(&self, target: Target, name: &str, schemas: &[String]) -> Result<PullReport> {
        commands::pull::execute(&self.ctx, target, name, schemas).await
    }

    /// Apply local migrations missing from the target.
    pub async fn push(&self, options: &PushOptions) -> Result<PushReport> {
        commands::push::execute(&self.ctx, options).await
    }

    /// Recreate a database from local migrations.
    pub async fn reset(&self, target: Target, version: Option<&str>) -> Result<ResetReport> {
        commands::reset::execute(&self.ctx, target, version).await
    }

    /// Squash migrations into one anchor file.
    pub async fn squash(&self, version: Option<&str>, linked: bool) -> Result<SquashReport> {
        commands::squash::execute(&self.ctx, version, linked).await
    }

    /// Diff a database against the migration history.
    pub async fn diff(&self, options: &DiffOptions) -> Result<DiffReport> {
        commands::diff::execute(&self.ctx, options).await
    }

    /// Dump a database to `file` or `out`.
    pub async fn dump(
        &self,
        target: Target,
        options: DumpOptions,
        file: Option<&Path>,
        out: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<DumpReport> {
        commands::dump::execute(&self.ctx, target, options, file, out).await
    }

    /// Local and remote versions side by side.
    pub async fn list(&self, target: Target) -> Result<Vec<ListRow>> {
        commands::list::execute(&self.ctx, target).await
    }

    /// Mark versions applied or reverted in the target's history.
    pub async fn repair(
        &self,
        target: Target,
        status: RepairStatus,
        versions: &[String],
    ) -> Result<RepairReport> {
        commands::repair::execute(&self.ctx, target, status, versions).await
    }
}
