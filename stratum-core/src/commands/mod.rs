//! Reconciler commands: new, pull, push, reset, squash, diff, dump, list,
//! repair.

pub mod diff;
pub mod dump;
pub mod list;
pub mod new;
pub mod pull;
pub mod push;
pub mod repair;
pub mod reset;
pub mod squash;

use std::path::Path;

use crate::context::Context;
use crate::error::Result;
use crate::fs::Filesystem;
use crate::migration::{self, Migration};

/// Local migrations. A missing migrations directory means none.
pub(crate) fn local_migrations(ctx: &Context) -> Result<Vec<Migration>> {
    let dir = ctx.config.migrations_dir();
    if !ctx.fs.exists(&dir) {
        log::debug!("No migrations directory; dir={}", dir.display());
        return Ok(Vec::new());
    }
    migration::list(ctx.fs.as_ref(), &dir)
}

pub(crate) fn versions(migrations: &[Migration]) -> Vec<String> {
    migrations.iter().map(|m| m.version.clone()).collect()
}

/// Create a migration file holding `contents`.
pub(crate) fn write_migration(
    fs: &dyn Filesystem,
    dir: &Path,
    name: &str,
    contents: &str,
) -> Result<Migration> {
    let mut reader = contents.as_bytes();
    let path = migration::create(fs, dir, name, Some(&mut reader))?;
    migration::load(fs, &path)
}
