//! Migration file discovery, parsing and creation.
//!
//! Migration files live in a single directory and are named
//! `<version>_<name>.sql`, where the version is an all-digit timestamp
//! (`YYYYMMDDHHMMSS` for files created by this tool). Lexicographic order of
//! versions is the apply order.

use std::collections::HashSet;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex_lite::Regex;
use serde::Serialize;

use crate::error::{Result, StratumError};
use crate::fs::Filesystem;
use crate::sql_parser::split_statements;

static MIGRATION_FILENAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9]+)_([A-Za-z0-9_-]+)\.sql$").unwrap());

static MIGRATION_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap());

/// Format used for the version of newly created migrations.
pub const VERSION_FORMAT: &str = "%Y%m%d%H%M%S";

/// A migration file found on disk, not yet read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationFile {
    pub version: String,
    pub name: String,
    pub path: PathBuf,
}

/// A loaded migration: its file metadata plus the split statements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Migration {
    pub version: String,
    pub name: String,
    pub path: PathBuf,
    pub statements: Vec<String>,
}

/// Parse a migration filename into `(version, name)`.
///
/// Returns `None` for files that are not migrations.
pub fn parse_migration_filename(filename: &str) -> Option<(String, String)> {
    let caps = MIGRATION_FILENAME_RE.captures(filename)?;
    Some((caps[1].to_string(), caps[2].to_string()))
}

/// Current UTC time as a migration version.
pub fn timestamp_version(now: DateTime<Utc>) -> String {
    now.format(VERSION_FORMAT).to_string()
}

/// Enumerate migration files in `dir`, sorted by version ascending.
///
/// Files that don't match the naming pattern are skipped. A missing
/// directory is an error; an empty directory is not.
pub fn scan(fs: &dyn Filesystem, dir: &Path) -> Result<Vec<MigrationFile>> {
    let entries = fs.read_dir(dir).map_err(|e| StratumError::file(dir, e))?;

    let mut files = Vec::new();
    let mut seen = HashSet::new();
    for entry in entries {
        if entry.is_dir {
            continue;
        }
        let Some((version, name)) = parse_migration_filename(&entry.name) else {
            log::debug!("Skipping non-migration file; file={}", entry.name);
            continue;
        };
        if !seen.insert(version.clone()) {
            return Err(StratumError::ParseError(format!(
                "Duplicate migration version {} in {}",
                version,
                dir.display()
            )));
        }
        files.push(MigrationFile {
            version,
            name,
            path: entry.path,
        });
    }

    files.sort_by(|a, b| a.version.cmp(&b.version));
    Ok(files)
}

/// Read and split a single migration file.
pub fn load(fs: &dyn Filesystem, path: &Path) -> Result<Migration> {
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let (version, name) = parse_migration_filename(&filename).ok_or_else(|| {
        StratumError::ParseError(format!("Invalid migration filename: {}", filename))
    })?;
    let sql = fs
        .read_to_string(path)
        .map_err(|e| StratumError::file(path, e))?;
    let statements = split_statements(&sql)
        .map_err(|e| StratumError::ParseError(format!("{}: {}", filename, e)))?;

    Ok(Migration {
        version,
        name,
        path: path.to_path_buf(),
        statements,
    })
}

/// Enumerate and load every migration in `dir`.
pub fn list(fs: &dyn Filesystem, dir: &Path) -> Result<Vec<Migration>> {
    scan(fs, dir)?
        .iter()
        .map(|file| load(fs, &file.path))
        .collect()
}

/// Like [`list`], truncated after `up_to_version` (inclusive).
pub fn partial(fs: &dyn Filesystem, dir: &Path, up_to_version: &str) -> Result<Vec<Migration>> {
    scan(fs, dir)?
        .iter()
        .take_while(|file| file.version.as_str() <= up_to_version)
        .map(|file| load(fs, &file.path))
        .collect()
}

/// Write a new migration `<timestamp>_<name>.sql` into `dir`.
///
/// The contents are copied from `input` when given, otherwise the file is
/// empty. The directory is created if it doesn't exist.
pub fn create(
    fs: &dyn Filesystem,
    dir: &Path,
    name: &str,
    input: Option<&mut dyn Read>,
) -> Result<PathBuf> {
    create_at(fs, dir, name, input, Utc::now())
}

/// [`create`] with an explicit clock.
///
/// If the timestamp would not sort after the newest existing migration,
/// the version is bumped past it so ordering stays strictly increasing.
pub fn create_at(
    fs: &dyn Filesystem,
    dir: &Path,
    name: &str,
    input: Option<&mut dyn Read>,
    now: DateTime<Utc>,
) -> Result<PathBuf> {
    if !MIGRATION_NAME_RE.is_match(name) {
        return Err(StratumError::ParseError(format!(
            "Invalid migration name '{}'. Only [A-Za-z0-9_-] are allowed.",
            name
        )));
    }

    fs.create_dir_all(dir)
        .map_err(|e| StratumError::file(dir, e))?;

    let mut version = timestamp_version(now);
    if let Some(latest) = scan(fs, dir)?.last() {
        if version <= latest.version {
            let bumped = latest
                .version
                .parse::<u64>()
                .ok()
                .and_then(|v| v.checked_add(1))
                .ok_or_else(|| {
                    StratumError::ParseError(format!(
                        "Cannot derive a version after {}",
                        latest.version
                    ))
                })?;
            version = format!("{:0width$}", bumped, width = version.len());
            log::debug!("Bumped migration version past {}; version={}", latest.version, version);
        }
    }

    let path = dir.join(format!("{}_{}.sql", version, name));
    let mut writer = fs.create(&path).map_err(|e| StratumError::file(&path, e))?;
    if let Some(reader) = input {
        std::io::copy(reader, &mut writer).map_err(|e| StratumError::file(&path, e))?;
    }
    writer.flush().map_err(|e| StratumError::file(&path, e))?;

    log::info!("Created new migration; path={}", path.display());
    Ok(path)
}

/// Load an optional seed script. A missing file yields `None`.
pub fn load_seed(fs: &dyn Filesystem, path: &Path) -> Result<Option<Vec<String>>> {
    if !fs.exists(path) {
        log::debug!("No seed file; path={}", path.display());
        return Ok(None);
    }
    let sql = fs
        .read_to_string(path)
        .map_err(|e| StratumError::file(path, e))?;
    Ok(Some(split_statements(&sql)?))
}

/// Read every `.sql` file in `dir` in filename order, as one script each.
/// A missing directory yields an empty list.
pub fn load_sql_dir(fs: &dyn Filesystem, dir: &Path) -> Result<Vec<(PathBuf, Vec<String>)>> {
    if !fs.exists(dir) {
        return Ok(Vec::new());
    }
    let mut entries: Vec<_> = fs
        .read_dir(dir)
        .map_err(|e| StratumError::file(dir, e))?
        .into_iter()
        .filter(|e| !e.is_dir && e.name.ends_with(".sql"))
        .collect();
    entries.sort_by(|a, b| a.name.cmp(&b.name));

    let mut scripts = Vec::with_capacity(entries.len());
    for entry in entries {
        let sql = fs
            .read_to_string(&entry.path)
            .map_err(|e| StratumError::file(&entry.path, e))?;
        scripts.push((entry.path, split_statements(&sql)?));
    }
    Ok(scripts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemFs;
    use chrono::TimeZone;

    fn dir() -> PathBuf {
        PathBuf::from("/proj/supabase/migrations")
    }

    #[test]
    fn test_parse_migration_filename() {
        assert_eq!(
            parse_migration_filename("20220727064247_init.sql"),
            Some(("20220727064247".to_string(), "init".to_string()))
        );
        assert_eq!(
            parse_migration_filename("0_init.sql"),
            Some(("0".to_string(), "init".to_string()))
        );
        assert_eq!(parse_migration_filename("README.md"), None);
        assert_eq!(parse_migration_filename("init.sql"), None);
        assert_eq!(parse_migration_filename("20220727_bad name.sql"), None);
        assert_eq!(parse_migration_filename("v1_init.sql"), None);
    }

    #[test]
    fn test_scan_sorts_and_skips_non_migrations() {
        let fs = MemFs::new();
        fs.add_file(dir().join("20230102000000_b.sql"), "").unwrap();
        fs.add_file(dir().join("20230101000000_a.sql"), "").unwrap();
        fs.add_file(dir().join("notes.txt"), "").unwrap();
        fs.add_file(dir().join("seed.sql"), "").unwrap();
        fs.create_dir_all(&dir().join("20230103000000_dir.sql")).unwrap();

        let files = scan(&fs, &dir()).unwrap();
        let versions: Vec<&str> = files.iter().map(|f| f.version.as_str()).collect();
        assert_eq!(versions, vec!["20230101000000", "20230102000000"]);
        assert_eq!(files[0].name, "a");
    }

    #[test]
    fn test_scan_missing_dir_is_not_found() {
        let fs = MemFs::new();
        let err = scan(&fs, &dir()).unwrap_err();
        assert_eq!(err.io_kind(), Some(std::io::ErrorKind::NotFound));
    }

    #[test]
    fn test_scan_permission_denied() {
        let fs = MemFs::new();
        fs.create_dir_all(&dir()).unwrap();
        fs.deny(dir());
        let err = scan(&fs, &dir()).unwrap_err();
        assert_eq!(err.io_kind(), Some(std::io::ErrorKind::PermissionDenied));
    }

    #[test]
    fn test_scan_empty_dir() {
        let fs = MemFs::new();
        fs.create_dir_all(&dir()).unwrap();
        assert!(scan(&fs, &dir()).unwrap().is_empty());
    }

    #[test]
    fn test_scan_duplicate_version_is_error() {
        let fs = MemFs::new();
        fs.add_file(dir().join("1_a.sql"), "").unwrap();
        fs.add_file(dir().join("1_b.sql"), "").unwrap();
        assert!(matches!(
            scan(&fs, &dir()),
            Err(StratumError::ParseError(_))
        ));
    }

    #[test]
    fn test_load_splits_statements() {
        let fs = MemFs::new();
        let path = dir().join("20220727064247_init.sql");
        fs.add_file(&path, "create table t(id int);\ndrop table t;")
            .unwrap();
        let m = load(&fs, &path).unwrap();
        assert_eq!(m.version, "20220727064247");
        assert_eq!(m.name, "init");
        assert_eq!(m.statements, vec!["create table t(id int)", "drop table t"]);
    }

    #[test]
    fn test_load_reports_parse_error_with_filename() {
        let fs = MemFs::new();
        let path = dir().join("1_bad.sql");
        fs.add_file(&path, "select 'unterminated").unwrap();
        match load(&fs, &path).unwrap_err() {
            StratumError::ParseError(msg) => assert!(msg.contains("1_bad.sql")),
            other => panic!("expected ParseError, got {:?}", other),
        }
    }

    #[test]
    fn test_partial_is_inclusive() {
        let fs = MemFs::new();
        for v in ["0_init", "1_a", "2_b"] {
            fs.add_file(dir().join(format!("{}.sql", v)), "select 1;")
                .unwrap();
        }
        let migrations = partial(&fs, &dir(), "1").unwrap();
        let versions: Vec<&str> = migrations.iter().map(|m| m.version.as_str()).collect();
        assert_eq!(versions, vec!["0", "1"]);
    }

    #[test]
    fn test_create_empty_file_and_list_roundtrip() {
        let fs = MemFs::new();
        let now = Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap();
        let path = create_at(&fs, &dir(), "add_users", None, now).unwrap();
        assert_eq!(path, dir().join("20240506070809_add_users.sql"));
        assert_eq!(fs.metadata(&path).unwrap().len, 0);

        let listed = list(&fs, &dir()).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].version, "20240506070809");
        assert!(listed[0].statements.is_empty());
    }

    #[test]
    fn test_create_from_input() {
        let fs = MemFs::new();
        let mut input: &[u8] = b"create schema test;";
        let path = create(&fs, &dir(), "piped", Some(&mut input)).unwrap();
        assert_eq!(fs.read_to_string(&path).unwrap(), "create schema test;");
    }

    #[test]
    fn test_create_bumps_past_newer_version() {
        let fs = MemFs::new();
        fs.add_file(dir().join("20990101000000_future.sql"), "")
            .unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let path = create_at(&fs, &dir(), "next", None, now).unwrap();
        assert_eq!(path, dir().join("20990101000001_next.sql"));
    }

    #[test]
    fn test_create_rejects_bad_name() {
        let fs = MemFs::new();
        assert!(create(&fs, &dir(), "has space", None).is_err());
        assert!(create(&fs, &dir(), "../escape", None).is_err());
    }

    #[test]
    fn test_create_new_version_sorts_after_existing() {
        let fs = MemFs::new();
        fs.add_file(dir().join("20200101000000_old.sql"), "").unwrap();
        let path = create(&fs, &dir(), "newer", None).unwrap();
        let files = scan(&fs, &dir()).unwrap();
        assert_eq!(files.last().unwrap().path, path);
        assert_eq!(files.last().unwrap().version.len(), 14);
    }

    #[test]
    fn test_load_seed_missing_is_none() {
        let fs = MemFs::new();
        assert_eq!(load_seed(&fs, Path::new("/proj/seed.sql")).unwrap(), None);
        fs.add_file("/proj/seed.sql", "insert into t values (1);")
            .unwrap();
        assert_eq!(
            load_seed(&fs, Path::new("/proj/seed.sql")).unwrap(),
            Some(vec!["insert into t values (1)".to_string()])
        );
    }

    #[test]
    fn test_load_sql_dir_sorted() {
        let fs = MemFs::new();
        fs.add_file("/proj/schemas/b.sql", "create table b();").unwrap();
        fs.add_file("/proj/schemas/a.sql", "create table a();").unwrap();
        fs.add_file("/proj/schemas/readme.md", "x").unwrap();
        let scripts = load_sql_dir(&fs, Path::new("/proj/schemas")).unwrap();
        assert_eq!(scripts.len(), 2);
        assert_eq!(scripts[0].1, vec!["create table a()"]);
        assert!(load_sql_dir(&fs, Path::new("/proj/none")).unwrap().is_empty());
    }
}
