//! Mark remote migration versions as applied or reverted without running them.

use serde::Serialize;

use crate::commands::local_migrations;
use crate::context::{Context, Target};
use crate::db::rollback_quietly;
use crate::error::{Result, StratumError};
use crate::history;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RepairStatus {
    Applied,
    Reverted,
}

impl std::str::FromStr for RepairStatus {
    type Err = StratumError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "applied" => Ok(RepairStatus::Applied),
            "reverted" => Ok(RepairStatus::Reverted),
            _ => Err(StratumError::ParseError(format!(
                "Invalid repair status '{}'. Use 'applied' or 'reverted'.",
                s
            ))),
        }
    }
}

impl std::fmt::Display for RepairStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RepairStatus::Applied => write!(f, "applied"),
            RepairStatus::Reverted => write!(f, "reverted"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RepairReport {
    pub status: RepairStatus,
    pub versions: Vec<String>,
    /// Rows inserted or deleted.
    pub affected: u64,
}

fn validate_versions(versions: &[String]) -> Result<()> {
    if versions.is_empty() {
        return Err(StratumError::ParseError(
            "At least one migration version is required".to_string(),
        ));
    }
    for v in versions {
        if v.is_empty() || !v.bytes().all(|b| b.is_ascii_digit()) {
            return Err(StratumError::ParseError(format!(
                "Invalid migration version '{}'",
                v
            )));
        }
    }
    Ok(())
}

/// Execute the repair command. All versions are repaired in one transaction.
pub async fn execute(
    ctx: &Context,
    target: Target,
    status: RepairStatus,
    versions: &[String],
) -> Result<RepairReport> {
    validate_versions(versions)?;
    let local = local_migrations(ctx)?;
    let schema = ctx.history_schema();

    let client = ctx.connect(target).await?;
    ctx.guard(history::ensure_exists(&client, schema)).await?;

    client.batch_execute("BEGIN").await?;
    let result = async {
        match status {
            RepairStatus::Applied => {
                for version in versions {
                    match local.iter().find(|m| &m.version == version) {
                        Some(m) => {
                            history::insert(&client, schema, version, &m.name, &m.statements)
                                .await?
                        }
                        None => {
                            log::warn!(
                                "No local file for version; recording without statements; version={}",
                                version
                            );
                            history::insert(&client, schema, version, "", &[]).await?
                        }
                    }
                }
                Ok(versions.len() as u64)
            }
            RepairStatus::Reverted => history::delete_versions(&client, schema, versions).await,
        }
    }
    .await;

    let affected = match result {
        Ok(n) => {
            client.batch_execute("COMMIT").await?;
            n
        }
        Err(e) => {
            rollback_quietly(&client).await;
            return Err(e);
        }
    };

    log::info!(
        "Repaired migration history; status={}, versions={}, affected={}",
        status,
        versions.join(","),
        affected
    );
    Ok(RepairReport {
        status,
        versions: versions.to_vec(),
        affected,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StratumConfig;
    use crate::fs::MemFs;
    use std::sync::Arc;

    #[test]
    fn test_parse_status() {
        assert_eq!("applied".parse::<RepairStatus>().unwrap(), RepairStatus::Applied);
        assert_eq!("reverted".parse::<RepairStatus>().unwrap(), RepairStatus::Reverted);
        assert!("done".parse::<RepairStatus>().is_err());
        assert_eq!(RepairStatus::Reverted.to_string(), "reverted");
    }

    #[test]
    fn test_validate_versions() {
        assert!(validate_versions(&["20220101000000".to_string()]).is_ok());
        assert!(validate_versions(&[]).is_err());
        assert!(validate_versions(&["2022-01-01".to_string()]).is_err());
    }

    #[tokio::test]
    async fn test_invalid_version_fails_before_connecting() {
        let ctx = Context::new(StratumConfig::default()).with_fs(Arc::new(MemFs::new()));
        let err = execute(&ctx, Target::Linked, RepairStatus::Applied, &["v1".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, StratumError::ParseError(_)));
    }
}
