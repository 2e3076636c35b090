//! Normalized pool keys for workbook paths.

use std::fmt;
use std::path::{Component, Path, PathBuf};

const FOLD_CASE: bool = cfg!(any(windows, target_os = "macos"));

/// Identity of a workbook file inside the pool.
///
/// Two paths that name the same file (relative vs absolute, `.`/`..` segments,
/// symlinks) produce equal keys. Letter case is folded only on platforms whose
/// filesystems ignore it; elsewhere `Book.xlsx` and `book.xlsx` stay distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathKey(String);

impl PathKey {
    pub fn new(path: &Path) -> std::io::Result<Self> {
        let absolute = absolute_path(path)?;
        let resolved = std::fs::canonicalize(&absolute).unwrap_or(absolute);
        let text = resolved.to_string_lossy();
        if FOLD_CASE {
            Ok(Self(text.to_lowercase()))
        } else {
            Ok(Self(text.into_owned()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Make `path` absolute against the current directory and resolve `.` and
/// `..` lexically. The file does not need to exist.
pub fn absolute_path(path: &Path) -> std::io::Result<PathBuf> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    Ok(out)
}
