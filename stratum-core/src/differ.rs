//! Schema differ driver.
//!
//! The diff itself is computed by migra running in a one-shot container.
//! The driver only wires URLs and schemas in and classifies the exit code.

use std::sync::LazyLock;

use regex_lite::Regex;

use crate::container::ContainerSpec;
use crate::context::Context;
use crate::error::{tail, Result, StratumError};

/// Loops over the schemas given as arguments and diffs each one.
/// migra exits 2 when it found differences; that is not a failure.
const DIFF_SCRIPT: &str = r#"set -u
status=0
run() {
    migra --unsafe "$@" "$TARGET" "$SOURCE"
    code=$?
    if [ "$code" -eq 2 ]; then
        status=2
    elif [ "$code" -ne 0 ]; then
        exit "$code"
    fi
}
if [ "$#" -eq 0 ]; then
    run
else
    for schema in "$@"; do
        run --schema "$schema"
    done
fi
exit "$status"
"#;

/// Exit code the differ uses for "differences found".
pub const DIFFERENCES_FOUND: i32 = 2;

static DROP_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bdrop\s").unwrap());

/// What to compare. The result is the DDL that turns `target` into `source`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffRequest {
    pub source_url: String,
    pub target_url: String,
    /// Schemas to diff; empty diffs the whole database.
    pub schemas: Vec<String>,
}

/// Container spec for a differ run.
pub fn differ_spec(ctx: &Context, request: &DiffRequest) -> ContainerSpec {
    let mut spec = ContainerSpec::new(
        format!("{}_differ", ctx.config.shadow.container_name),
        &ctx.config.differ.image,
    )
    .env("SOURCE", &request.source_url)
    .env("TARGET", &request.target_url);
    spec.network = Some(ctx.config.shadow.network.clone());
    spec.entrypoint = Some("sh".to_string());
    spec.cmd = vec!["-c".to_string(), DIFF_SCRIPT.to_string(), "differ".to_string()];
    spec.cmd.extend(request.schemas.iter().cloned());
    spec
}

/// Run the differ. An empty string means the databases are in sync.
pub async fn diff(ctx: &Context, request: &DiffRequest) -> Result<String> {
    let spec = differ_spec(ctx, request);
    log::info!(
        "Diffing schemas; schemas={}",
        if request.schemas.is_empty() {
            "all".to_string()
        } else {
            request.schemas.join(",")
        }
    );

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let code = ctx
        .guard(ctx.runtime.run_once(&spec, &mut stdout, &mut stderr))
        .await?;
    let stderr = String::from_utf8_lossy(&stderr);
    if !stderr.trim().is_empty() {
        log::debug!("Differ stderr: {}", stderr.trim_end());
    }

    if code != 0 && code != DIFFERENCES_FOUND {
        return Err(StratumError::DifferError {
            exit_code: code,
            stderr_tail: tail(&stderr, 10),
        });
    }

    let output = String::from_utf8_lossy(&stdout).into_owned();
    if output.trim().is_empty() {
        return Ok(String::new());
    }
    Ok(output)
}

/// Lines of a diff that drop something.
pub fn find_drop_statements(diff: &str) -> Vec<String> {
    diff.lines()
        .filter(|line| DROP_RE.is_match(line))
        .map(|line| line.trim().to_string())
        .collect()
}
