//! Dump a database's schema, data or roles.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::io::AsyncWrite;

use crate::context::{Context, Target};
use crate::dump::{self, DumpMode, DumpOptions};
use crate::error::{Result, StratumError};

#[derive(Debug, Clone, Serialize)]
pub struct DumpReport {
    pub mode: DumpMode,
    pub target: String,
    pub path: Option<PathBuf>,
    pub dry_run: bool,
}

/// Fill in the default schema exclusions when nothing was selected.
pub fn with_defaults(ctx: &Context, mut options: DumpOptions) -> DumpOptions {
    if options.mode != DumpMode::Roles
        && options.schemas.is_empty()
        && options.excluded_schemas.is_empty()
    {
        options.excluded_schemas = ctx.config.schemas.excluded();
    }
    options
}

/// Execute the dump command, writing to `file` when given and to `out`
/// otherwise.
pub async fn execute(
    ctx: &Context,
    target: Target,
    options: DumpOptions,
    file: Option<&Path>,
    out: &mut (dyn AsyncWrite + Unpin + Send),
) -> Result<DumpReport> {
    let options = with_defaults(ctx, options);
    let url = ctx.target_url(target)?;

    match file {
        Some(path) => {
            let mut buf = Vec::new();
            dump::dump(ctx, &url, &options, &mut buf).await?;
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                ctx.fs
                    .create_dir_all(parent)
                    .map_err(|e| StratumError::file(parent, e))?;
            }
            let mut writer = ctx.fs.create(path).map_err(|e| StratumError::file(path, e))?;
            writer
                .write_all(&buf)
                .and_then(|_| writer.flush())
                .map_err(|e| StratumError::file(path, e))?;
            log::info!("Dumped {:?} to {}", options.mode, path.display());
        }
        None => dump::dump(ctx, &url, &options, out).await?,
    }

    Ok(DumpReport {
        mode: options.mode,
        target: target.to_string(),
        path: file.map(Path::to_path_buf),
        dry_run: options.dry_run,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StratumConfig;
    use crate::fs::{Filesystem, MemFs};
    use crate::test_utils::{MockRuntime, RunOutput};
    use std::sync::Arc;

    fn context(fs: &Arc<MemFs>, runtime: &MockRuntime) -> Context {
        Context::new(StratumConfig::default())
            .with_fs(fs.clone())
            .with_runtime(Arc::new(runtime.clone()))
    }

    #[test]
    fn test_defaults_exclude_internal_schemas() {
        let ctx = Context::new(StratumConfig::default());
        let options = with_defaults(&ctx, DumpOptions::default());
        assert!(options.excluded_schemas.contains(&"auth".to_string()));
        assert!(options
            .excluded_schemas
            .contains(&"supabase_migrations".to_string()));

        let explicit = with_defaults(&ctx, DumpOptions::data_only(vec!["public".to_string()]));
        assert!(explicit.excluded_schemas.is_empty());
    }

    #[tokio::test]
    async fn test_dump_to_file() {
        let fs = Arc::new(MemFs::new());
        let runtime = MockRuntime::new();
        runtime.push_output(RunOutput::ok("CREATE TABLE t();\n"));
        let ctx = context(&fs, &runtime);

        let mut sink = tokio::io::sink();
        let report = execute(
            &ctx,
            Target::Local,
            DumpOptions::default(),
            Some(Path::new("/out/schema.sql")),
            &mut sink,
        )
        .await
        .unwrap();
        assert_eq!(report.path, Some(PathBuf::from("/out/schema.sql")));
        assert_eq!(
            fs.read_to_string(Path::new("/out/schema.sql")).unwrap(),
            "CREATE TABLE t();\n"
        );
        let flags = runtime.runs()[0].env_value("EXTRA_FLAGS").map(str::to_string);
        assert!(flags.unwrap().starts_with("--exclude-schema="));
    }

    #[tokio::test]
    async fn test_dump_to_writer() {
        let fs = Arc::new(MemFs::new());
        let runtime = MockRuntime::new();
        runtime.push_output(RunOutput::ok("CREATE ROLE app;\n"));
        let ctx = context(&fs, &runtime);

        let mut out = Vec::new();
        let options = DumpOptions {
            mode: DumpMode::Roles,
            ..Default::default()
        };
        let report = execute(&ctx, Target::Local, options, None, &mut out)
            .await
            .unwrap();
        assert_eq!(report.mode, DumpMode::Roles);
        assert_eq!(String::from_utf8(out).unwrap(), "CREATE ROLE app;\n");
    }
}
