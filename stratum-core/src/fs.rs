//! Filesystem abstraction so migration files, seeds and dumps can be
//! exercised against an in-memory tree in tests.

use std::collections::{BTreeMap, HashSet};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// A single entry returned by [`Filesystem::read_dir`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// File name without the parent directory.
    pub name: String,
    /// Full path of the entry.
    pub path: PathBuf,
    /// Whether the entry is a directory.
    pub is_dir: bool,
}

/// Result of [`Filesystem::metadata`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub is_dir: bool,
    pub len: u64,
}

/// Operations the migration pipeline needs from a filesystem.
pub trait Filesystem: Send + Sync {
    /// Open an existing file for reading.
    fn open_read(&self, path: &Path) -> io::Result<Box<dyn Read + Send>>;
    /// Create a file, truncating it if it exists.
    fn create(&self, path: &Path) -> io::Result<Box<dyn Write + Send>>;
    /// Open a file for appending, creating it if missing.
    fn append(&self, path: &Path) -> io::Result<Box<dyn Write + Send>>;
    /// Create a directory and all of its parents. Existing directories are fine.
    fn create_dir_all(&self, path: &Path) -> io::Result<()>;
    /// List the direct children of a directory.
    fn read_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>>;
    /// Remove a single file.
    fn remove_file(&self, path: &Path) -> io::Result<()>;
    /// Stat a path.
    fn metadata(&self, path: &Path) -> io::Result<FileStat>;

    fn exists(&self, path: &Path) -> bool {
        self.metadata(path).is_ok()
    }

    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        let mut reader = self.open_read(path)?;
        let mut buf = String::new();
        reader.read_to_string(&mut buf)?;
        Ok(buf)
    }

    fn write_string(&self, path: &Path, contents: &str) -> io::Result<()> {
        let mut writer = self.create(path)?;
        writer.write_all(contents.as_bytes())?;
        writer.flush()
    }
}

/// The real filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsFs;

impl Filesystem for OsFs {
    fn open_read(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(std::fs::File::open(path)?))
    }

    fn create(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
        Ok(Box::new(std::fs::File::create(path)?))
    }

    fn append(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Box::new(file))
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(path)
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                path: entry.path(),
                is_dir: entry.file_type()?.is_dir(),
            });
        }
        Ok(entries)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }

    fn metadata(&self, path: &Path) -> io::Result<FileStat> {
        let meta = std::fs::metadata(path)?;
        Ok(FileStat {
            is_dir: meta.is_dir(),
            len: meta.len(),
        })
    }
}

#[derive(Debug, Clone)]
enum Node {
    Dir,
    File(Arc<Mutex<Vec<u8>>>),
}

#[derive(Debug, Default)]
struct MemState {
    nodes: BTreeMap<PathBuf, Node>,
    denied: HashSet<PathBuf>,
}

/// In-memory filesystem. Paths are normalised lexically; `/` always exists.
#[derive(Debug, Clone, Default)]
pub struct MemFs {
    state: Arc<Mutex<MemState>>,
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::from("/");
    for comp in path.components() {
        match comp {
            Component::Normal(part) => out.push(part),
            Component::ParentDir => {
                out.pop();
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    out
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("{}: no such file or directory", path.display()),
    )
}

fn denied(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::PermissionDenied,
        format!("{}: permission denied", path.display()),
    )
}

struct MemReader {
    data: Vec<u8>,
    pos: usize,
}

impl Read for MemReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = &self.data[self.pos..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.pos += n;
        Ok(n)
    }
}

struct MemWriter {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl Write for MemWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        lock_buf(&self.buf)?.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn lock_buf(buf: &Mutex<Vec<u8>>) -> io::Result<MutexGuard<'_, Vec<u8>>> {
    buf.lock()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "memfs buffer poisoned"))
}

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> io::Result<MutexGuard<'_, MemState>> {
        self.state
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "memfs poisoned"))
    }

    /// Make every operation on `path` (and anything below it) fail with
    /// `PermissionDenied`.
    pub fn deny(&self, path: impl AsRef<Path>) {
        if let Ok(mut state) = self.lock() {
            state.denied.insert(normalize(path.as_ref()));
        }
    }

    /// Create a file with the given contents, creating parents as needed.
    pub fn add_file(&self, path: impl AsRef<Path>, contents: &str) -> io::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            self.create_dir_all(parent)?;
        }
        self.write_string(path, contents)
    }

    fn check_denied(state: &MemState, path: &Path) -> io::Result<()> {
        if state.denied.iter().any(|d| path.starts_with(d)) {
            return Err(denied(path));
        }
        Ok(())
    }

    fn parent_is_dir(state: &MemState, path: &Path) -> bool {
        match path.parent() {
            None => true,
            Some(p) if p == Path::new("/") => true,
            Some(p) => matches!(state.nodes.get(p), Some(Node::Dir)),
        }
    }

    fn open_write(&self, path: &Path, truncate: bool) -> io::Result<Box<dyn Write + Send>> {
        let path = normalize(path);
        let mut state = self.lock()?;
        Self::check_denied(&state, &path)?;
        if !Self::parent_is_dir(&state, &path) {
            return Err(not_found(&path));
        }
        let buf = match state.nodes.get(&path) {
            Some(Node::Dir) => {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("{}: is a directory", path.display()),
                ))
            }
            Some(Node::File(buf)) => {
                if truncate {
                    lock_buf(buf)?.clear();
                }
                buf.clone()
            }
            None => {
                let buf = Arc::new(Mutex::new(Vec::new()));
                state.nodes.insert(path.clone(), Node::File(buf.clone()));
                buf
            }
        };
        Ok(Box::new(MemWriter { buf }))
    }
}

impl Filesystem for MemFs {
    fn open_read(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
        let path = normalize(path);
        let state = self.lock()?;
        Self::check_denied(&state, &path)?;
        match state.nodes.get(&path) {
            Some(Node::File(buf)) => {
                let data = lock_buf(buf)?.clone();
                Ok(Box::new(MemReader { data, pos: 0 }))
            }
            Some(Node::Dir) => Err(io::Error::new(
                io::ErrorKind::Other,
                format!("{}: is a directory", path.display()),
            )),
            None => Err(not_found(&path)),
        }
    }

    fn create(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
        self.open_write(path, true)
    }

    fn append(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
        self.open_write(path, false)
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        let path = normalize(path);
        let mut state = self.lock()?;
        Self::check_denied(&state, &path)?;
        let mut current = PathBuf::from("/");
        for comp in path.components().skip(1) {
            current.push(comp);
            match state.nodes.get(&current) {
                Some(Node::Dir) => {}
                Some(Node::File(_)) => {
                    return Err(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        format!("{}: not a directory", current.display()),
                    ))
                }
                None => {
                    state.nodes.insert(current.clone(), Node::Dir);
                }
            }
        }
        Ok(())
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>> {
        let path = normalize(path);
        let state = self.lock()?;
        Self::check_denied(&state, &path)?;
        let is_root = path == Path::new("/");
        if !is_root && !matches!(state.nodes.get(&path), Some(Node::Dir)) {
            return Err(not_found(&path));
        }
        Ok(state
            .nodes
            .iter()
            .filter(|(p, _)| p.parent() == Some(path.as_path()))
            .map(|(p, node)| DirEntry {
                name: p
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                path: p.clone(),
                is_dir: matches!(node, Node::Dir),
            })
            .collect())
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        let path = normalize(path);
        let mut state = self.lock()?;
        Self::check_denied(&state, &path)?;
        match state.nodes.get(&path) {
            Some(Node::File(_)) => {
                state.nodes.remove(&path);
                Ok(())
            }
            Some(Node::Dir) => Err(io::Error::new(
                io::ErrorKind::Other,
                format!("{}: is a directory", path.display()),
            )),
            None => Err(not_found(&path)),
        }
    }

    fn metadata(&self, path: &Path) -> io::Result<FileStat> {
        let path = normalize(path);
        let state = self.lock()?;
        Self::check_denied(&state, &path)?;
        if path == Path::new("/") {
            return Ok(FileStat { is_dir: true, len: 0 });
        }
        match state.nodes.get(&path) {
            Some(Node::Dir) => Ok(FileStat { is_dir: true, len: 0 }),
            Some(Node::File(buf)) => Ok(FileStat {
                is_dir: false,
                len: lock_buf(buf)?.len() as u64,
            }),
            None => Err(not_found(&path)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memfs_write_then_read() {
        let fs = MemFs::new();
        fs.create_dir_all(Path::new("/proj/migrations")).unwrap();
        fs.write_string(Path::new("/proj/migrations/a.sql"), "select 1;")
            .unwrap();
        assert_eq!(
            fs.read_to_string(Path::new("/proj/migrations/a.sql")).unwrap(),
            "select 1;"
        );
        assert_eq!(
            fs.metadata(Path::new("/proj/migrations/a.sql")).unwrap().len,
            9
        );
    }

    #[test]
    fn test_memfs_append_and_truncate() {
        let fs = MemFs::new();
        fs.add_file("/a.sql", "one\n").unwrap();
        fs.append(Path::new("/a.sql"))
            .unwrap()
            .write_all(b"two\n")
            .unwrap();
        assert_eq!(fs.read_to_string(Path::new("/a.sql")).unwrap(), "one\ntwo\n");
        fs.write_string(Path::new("/a.sql"), "three").unwrap();
        assert_eq!(fs.read_to_string(Path::new("/a.sql")).unwrap(), "three");
    }

    #[test]
    fn test_memfs_create_requires_parent() {
        let fs = MemFs::new();
        let err = fs.create(Path::new("/missing/a.sql")).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_memfs_read_dir_lists_direct_children_only() {
        let fs = MemFs::new();
        fs.add_file("/m/1_a.sql", "").unwrap();
        fs.add_file("/m/sub/2_b.sql", "").unwrap();
        let mut names: Vec<String> = fs
            .read_dir(Path::new("/m"))
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["1_a.sql", "sub"]);
    }

    #[test]
    fn test_memfs_denied_paths() {
        let fs = MemFs::new();
        fs.add_file("/secret/a.sql", "x").unwrap();
        fs.deny("/secret");
        let err = fs.read_dir(Path::new("/secret")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
        let err = fs.open_read(Path::new("/secret/a.sql")).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
    }

    #[test]
    fn test_memfs_remove_file() {
        let fs = MemFs::new();
        fs.add_file("/a.sql", "x").unwrap();
        fs.remove_file(Path::new("/a.sql")).unwrap();
        assert!(!fs.exists(Path::new("/a.sql")));
        assert_eq!(
            fs.remove_file(Path::new("/a.sql")).unwrap_err().kind(),
            io::ErrorKind::NotFound
        );
    }

    #[test]
    fn test_osfs_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let fs = OsFs;
        let nested = dir.path().join("a/b");
        fs.create_dir_all(&nested).unwrap();
        let file = nested.join("x.sql");
        fs.write_string(&file, "hello").unwrap();
        fs.append(&file).unwrap().write_all(b" world").unwrap();
        assert_eq!(fs.read_to_string(&file).unwrap(), "hello world");
        let entries = fs.read_dir(&nested).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "x.sql");
        assert!(!entries[0].is_dir);
    }
}
