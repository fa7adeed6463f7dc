//! Local-versus-remote history comparison.
//!
//! Both histories are sorted version lists, so they are compared with a
//! single merge walk instead of set operations. The walk keeps the output
//! ordered, which is what the repair suggestions print.

use std::cmp::Ordering;
use std::fmt::Write;

use serde::Serialize;

use crate::error::StratumError;

/// One step of the merge walk: a version present locally, remotely, or both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side<'a> {
    Both(&'a str),
    LocalOnly(&'a str),
    RemoteOnly(&'a str),
}

/// How the two histories relate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Divergence {
    /// Local versions not applied remotely; new work to deploy.
    pub extra_local: Vec<String>,
    /// Remote versions without a local file; must be repaired.
    pub extra_remote: Vec<String>,
    pub common: Vec<String>,
}

impl Divergence {
    pub fn is_in_sync(&self) -> bool {
        self.extra_local.is_empty() && self.extra_remote.is_empty()
    }

    /// Local versions older than the newest remote one. They were never
    /// applied and cannot be applied in order.
    pub fn out_of_order(&self) -> Vec<String> {
        let newest_remote = self.common.iter().chain(&self.extra_remote).max();
        self.extra_local
            .iter()
            .filter(|v| newest_remote.is_some_and(|max| v.as_str() < max.as_str()))
            .cloned()
            .collect()
    }

    /// Fail with [`StratumError::HistoryConflict`] if anything exists only
    /// remotely or a local version was skipped.
    pub fn check(&self) -> crate::error::Result<()> {
        if self.extra_remote.is_empty() && self.out_of_order().is_empty() {
            return Ok(());
        }
        Err(StratumError::HistoryConflict {
            extra_local: self.extra_local.clone(),
            extra_remote: self.extra_remote.clone(),
        })
    }
}

fn is_numeric(version: &str) -> bool {
    !version.is_empty() && version.bytes().all(|b| b.is_ascii_digit())
}

/// Merge-walk two ascending version lists.
///
/// Versions that are not all digits are skipped on both sides.
pub fn merge_walk<'a>(local: &'a [String], remote: &'a [String]) -> Vec<Side<'a>> {
    let local: Vec<&str> = local.iter().map(String::as_str).filter(|v| is_numeric(v)).collect();
    let remote: Vec<&str> = remote.iter().map(String::as_str).filter(|v| is_numeric(v)).collect();

    let mut out = Vec::with_capacity(local.len().max(remote.len()));
    let (mut i, mut j) = (0, 0);
    while i < local.len() && j < remote.len() {
        match local[i].cmp(remote[j]) {
            Ordering::Equal => {
                out.push(Side::Both(local[i]));
                i += 1;
                j += 1;
            }
            Ordering::Less => {
                out.push(Side::LocalOnly(local[i]));
                i += 1;
            }
            Ordering::Greater => {
                out.push(Side::RemoteOnly(remote[j]));
                j += 1;
            }
        }
    }
    out.extend(local[i..].iter().copied().map(Side::LocalOnly));
    out.extend(remote[j..].iter().copied().map(Side::RemoteOnly));
    out
}

/// Classify local and remote versions.
pub fn diverge(local: &[String], remote: &[String]) -> Divergence {
    let mut result = Divergence::default();
    for side in merge_walk(local, remote) {
        match side {
            Side::Both(v) => result.common.push(v.to_string()),
            Side::LocalOnly(v) => result.extra_local.push(v.to_string()),
            Side::RemoteOnly(v) => result.extra_remote.push(v.to_string()),
        }
    }
    result
}

/// Repair commands that bring the remote history in line with local files.
pub fn repair_commands(extra_local: &[String], extra_remote: &[String]) -> Vec<String> {
    extra_remote
        .iter()
        .map(|v| format!("stratum migration repair --status reverted {}", v))
        .chain(
            extra_local
                .iter()
                .map(|v| format!("stratum migration repair --status applied {}", v)),
        )
        .collect()
}

/// Human-readable suggestion block for a history conflict.
pub fn repair_suggestion(extra_local: &[String], extra_remote: &[String]) -> String {
    let mut out = String::from(
        "Make sure your local git repo is up-to-date. If the error persists, try repairing the migration history table:\n",
    );
    for cmd in repair_commands(extra_local, extra_remote) {
        let _ = writeln!(out, "  {}", cmd);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_diverge_in_sync() {
        let d = diverge(&v(&["0", "1"]), &v(&["0", "1"]));
        assert!(d.is_in_sync());
        assert_eq!(d.common, v(&["0", "1"]));
        assert!(d.check().is_ok());
    }

    #[test]
    fn test_diverge_new_local_work_is_not_conflict() {
        let d = diverge(&v(&["0", "1", "2"]), &v(&["0"]));
        assert_eq!(d.extra_local, v(&["1", "2"]));
        assert!(d.extra_remote.is_empty());
        assert!(d.check().is_ok());
    }

    #[test]
    fn test_diverge_both_sides() {
        let d = diverge(&v(&["0", "1", "2"]), &v(&["0", "2", "3"]));
        assert_eq!(d.extra_local, v(&["1"]));
        assert_eq!(d.extra_remote, v(&["3"]));
        assert_eq!(d.common, v(&["0", "2"]));
        assert!(matches!(
            d.check(),
            Err(StratumError::HistoryConflict { .. })
        ));
    }

    #[test]
    fn test_skipped_local_version_is_conflict() {
        let d = diverge(&v(&["0", "1", "2", "3"]), &v(&["0", "2"]));
        assert_eq!(d.extra_local, v(&["1", "3"]));
        assert_eq!(d.out_of_order(), v(&["1"]));
        match d.check() {
            Err(StratumError::HistoryConflict {
                extra_local,
                extra_remote,
            }) => {
                assert_eq!(extra_local, v(&["1", "3"]));
                assert!(extra_remote.is_empty());
            }
            other => panic!("expected HistoryConflict, got {:?}", other),
        }
    }

    #[test]
    fn test_diverge_empty_sides() {
        assert_eq!(diverge(&[], &[]), Divergence::default());
        let d = diverge(&[], &v(&["5"]));
        assert_eq!(d.extra_remote, v(&["5"]));
    }

    #[test]
    fn test_diverge_skips_non_numeric() {
        let d = diverge(&v(&["0", "abc"]), &v(&["0", "x1"]));
        assert!(d.is_in_sync());
        assert_eq!(d.common, v(&["0"]));
    }

    #[test]
    fn test_merge_walk_is_ordered() {
        let local = v(&["1", "3"]);
        let remote = v(&["2", "3", "4"]);
        assert_eq!(
            merge_walk(&local, &remote),
            vec![
                Side::LocalOnly("1"),
                Side::RemoteOnly("2"),
                Side::Both("3"),
                Side::RemoteOnly("4"),
            ]
        );
    }

    #[test]
    fn test_repair_suggestion_lists_both_sets() {
        let text = repair_suggestion(&v(&["1"]), &v(&["3"]));
        assert!(text.contains("repair --status reverted 3"));
        assert!(text.contains("repair --status applied 1"));
        let reverted = text.find("reverted 3").unwrap();
        let applied = text.find("applied 1").unwrap();
        assert!(reverted < applied);
    }
}
