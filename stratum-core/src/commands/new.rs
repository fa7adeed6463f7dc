//! Create an empty (or stdin-filled) migration file.

use std::io::Read;
use std::path::PathBuf;

use serde::Serialize;

use crate::context::Context;
use crate::error::Result;
use crate::migration;

#[derive(Debug, Clone, Serialize)]
pub struct NewReport {
    pub version: String,
    pub path: PathBuf,
}

/// Execute the new command. `input` is copied into the file when given.
pub fn execute(ctx: &Context, name: &str, input: Option<&mut dyn Read>) -> Result<NewReport> {
    let dir = ctx.config.migrations_dir();
    let path = migration::create(ctx.fs.as_ref(), &dir, name, input)?;
    let version = path
        .file_name()
        .and_then(|n| migration::parse_migration_filename(&n.to_string_lossy()))
        .map(|(version, _)| version)
        .unwrap_or_default();
    Ok(NewReport { version, path })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StratumConfig;
    use crate::fs::{Filesystem, MemFs};
    use std::path::Path;
    use std::sync::Arc;

    fn context(fs: &Arc<MemFs>) -> Context {
        let mut config = StratumConfig::default();
        config.workdir = PathBuf::from("/project");
        Context::new(config).with_fs(fs.clone())
    }

    #[test]
    fn test_new_with_empty_input_creates_empty_file() {
        let fs = Arc::new(MemFs::new());
        let ctx = context(&fs);
        let report = execute(&ctx, "add_users", None).unwrap();

        assert_eq!(report.version.len(), 14);
        assert!(report.path.starts_with("/project/supabase/migrations"));
        assert!(report
            .path
            .to_string_lossy()
            .ends_with(&format!("{}_add_users.sql", report.version)));
        assert_eq!(fs.read_to_string(&report.path).unwrap(), "");
    }

    #[test]
    fn test_new_copies_piped_input() {
        let fs = Arc::new(MemFs::new());
        let ctx = context(&fs);
        let mut input: &[u8] = b"create table t(id int);\n";
        let report = execute(&ctx, "t", Some(&mut input)).unwrap();
        assert_eq!(
            fs.read_to_string(&report.path).unwrap(),
            "create table t(id int);\n"
        );
    }

    #[test]
    fn test_new_sorts_after_existing_files() {
        let fs = Arc::new(MemFs::new());
        fs.add_file(
            Path::new("/project/supabase/migrations/99990101000000_future.sql"),
            "",
        )
        .unwrap();
        let ctx = context(&fs);
        let report = execute(&ctx, "next", None).unwrap();
        assert_eq!(report.version, "99990101000001");

        let listed = crate::commands::local_migrations(&ctx).unwrap();
        assert_eq!(listed.last().map(|m| m.name.as_str()), Some("next"));
    }
}
