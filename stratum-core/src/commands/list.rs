//! Side-by-side listing of local and remote migration versions.

use std::collections::HashMap;

use chrono::NaiveDateTime;
use serde::Serialize;

use crate::commands::{local_migrations, versions};
use crate::context::{Context, Target};
use crate::error::Result;
use crate::history::{self, MigrationHistoryRow};
use crate::migration::VERSION_FORMAT;
use crate::reconcile::{merge_walk, Side};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListRow {
    pub local: Option<String>,
    pub remote: Option<String>,
    /// Time encoded in the version, `YYYY-MM-DD HH:MM:SS` (UTC).
    pub time: Option<String>,
    pub name: Option<String>,
}

/// Timestamp a 14-digit version stands for.
pub fn version_time(version: &str) -> Option<String> {
    NaiveDateTime::parse_from_str(version, VERSION_FORMAT)
        .ok()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
}

/// Merge local versions and remote history rows into display rows.
pub fn build_rows(
    local: &[String],
    local_names: &HashMap<String, String>,
    remote: &[MigrationHistoryRow],
) -> Vec<ListRow> {
    let remote_versions: Vec<String> = remote.iter().map(|r| r.version.clone()).collect();
    let remote_names: HashMap<&str, &str> = remote
        .iter()
        .filter_map(|r| r.name.as_deref().map(|n| (r.version.as_str(), n)))
        .collect();

    merge_walk(local, &remote_versions)
        .into_iter()
        .map(|side| {
            let (local, remote, version) = match side {
                Side::Both(v) => (Some(v), Some(v), v),
                Side::LocalOnly(v) => (Some(v), None, v),
                Side::RemoteOnly(v) => (None, Some(v), v),
            };
            let name = local_names
                .get(version)
                .map(String::as_str)
                .or_else(|| remote_names.get(version).copied())
                .map(str::to_string);
            ListRow {
                local: local.map(str::to_string),
                remote: remote.map(str::to_string),
                time: version_time(version),
                name,
            }
        })
        .collect()
}

/// Execute the list command.
pub async fn execute(ctx: &Context, target: Target) -> Result<Vec<ListRow>> {
    let local = local_migrations(ctx)?;
    let names: HashMap<String, String> = local
        .iter()
        .map(|m| (m.version.clone(), m.name.clone()))
        .collect();

    let client = ctx.connect(target).await?;
    let remote = ctx
        .guard(history::list_rows(&client, ctx.history_schema()))
        .await?;
    Ok(build_rows(&versions(&local), &names, &remote))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(version: &str, name: Option<&str>) -> MigrationHistoryRow {
        MigrationHistoryRow {
            version: version.to_string(),
            name: name.map(str::to_string),
            statements: vec![],
            inserted_at: None,
        }
    }

    #[test]
    fn test_version_time() {
        assert_eq!(
            version_time("20220727064247").as_deref(),
            Some("2022-07-27 06:42:47")
        );
        assert_eq!(version_time("0"), None);
    }

    #[test]
    fn test_build_rows_aligns_both_sides() {
        let local = vec!["20220101000000".to_string(), "20220102000000".to_string()];
        let names: HashMap<String, String> =
            [("20220101000000".to_string(), "init".to_string())].into_iter().collect();
        let remote = vec![
            row("20220101000000", Some("init")),
            row("20220103000000", Some("hotfix")),
        ];

        let rows = build_rows(&local, &names, &remote);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].local.as_deref(), Some("20220101000000"));
        assert_eq!(rows[0].remote.as_deref(), Some("20220101000000"));
        assert_eq!(rows[0].name.as_deref(), Some("init"));
        assert_eq!(rows[1].remote, None);
        assert_eq!(rows[1].name, None);
        assert_eq!(rows[2].local, None);
        assert_eq!(rows[2].name.as_deref(), Some("hotfix"));
        assert_eq!(rows[2].time.as_deref(), Some("2022-01-03 00:00:00"));
    }
}
