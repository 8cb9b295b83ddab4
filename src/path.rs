use std::fmt;
use std::path::{Component, Path};

use anyhow::{bail, Result};

/// Fixed filename for a permission file. Present in any directory, governs
/// that directory and its descendants.
pub const PERMISSION_FILE_NAME: &str = "_.syftperm";

/// Fixed filename for the ignore file at the datasites root.
pub const IGNORE_FILE_NAME: &str = ".syftignore";

/// A forward-slash-separated path rooted at the datasites directory.
///
/// Never absolute, never contains `.` or `..` components, always normalized
/// to `/` separators regardless of host platform.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct RelativePath(String);

impl RelativePath {
    pub fn new(raw: impl AsRef<str>) -> Result<Self> {
        let raw = raw.as_ref();
        let normalized = raw.replace('\\', "/");
        let mut parts = Vec::new();
        for seg in normalized.split('/') {
            match seg {
                "" | "." => continue,
                ".." => bail!("relative path must not contain '..': {raw}"),
                s => parts.push(s),
            }
        }
        if parts.is_empty() {
            bail!("relative path must not be empty: {raw}");
        }
        Ok(Self(parts.join("/")))
    }

    /// Builds a RelativePath from an absolute filesystem path and the root
    /// it should be relative to.
    pub fn from_abs(abs_path: &Path, root: &Path) -> Result<Self> {
        let rel = abs_path
            .strip_prefix(root)
            .map_err(|_| anyhow::anyhow!("{} is not under {}", abs_path.display(), root.display()))?;
        let mut parts = Vec::new();
        for c in rel.components() {
            match c {
                Component::Normal(seg) => parts.push(seg.to_string_lossy().into_owned()),
                Component::CurDir => {}
                other => bail!("unexpected path component {other:?} in {}", rel.display()),
            }
        }
        if parts.is_empty() {
            bail!("path equals root: {}", abs_path.display());
        }
        Ok(Self(parts.join("/")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_abs(&self, root: &Path) -> std::path::PathBuf {
        let mut out = root.to_path_buf();
        for seg in self.0.split('/') {
            out.push(seg);
        }
        out
    }

    /// The datasite email this path is rooted under, i.e. its first segment.
    pub fn datasite(&self) -> &str {
        self.0.split('/').next().unwrap_or("")
    }

    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Ordered list of ancestor directories from the datasite root down to
    /// (but excluding) the path itself, nearest-last.
    pub fn ancestor_dirs(&self) -> Vec<String> {
        let segs: Vec<&str> = self.0.split('/').collect();
        let mut out = Vec::new();
        for i in 1..segs.len() {
            out.push(segs[..i].join("/"));
        }
        out
    }
}

impl fmt::Display for RelativePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// True if the given relative path's filename is the well-known permission
/// file name.
pub fn is_permission_file(path: &RelativePath) -> bool {
    path.file_name() == PERMISSION_FILE_NAME
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_parent_traversal() {
        assert!(RelativePath::new("alice/../bob/x.txt").is_err());
    }

    #[test]
    fn normalizes_backslashes_and_dots() {
        let p = RelativePath::new("alice\\./public/./x.txt").unwrap();
        assert_eq!(p.as_str(), "alice/public/x.txt");
    }

    #[test]
    fn from_abs_strips_root() {
        let root = Path::new("/tmp/datasites");
        let abs = root.join("alice").join("public").join("x.txt");
        let rel = RelativePath::from_abs(&abs, root).unwrap();
        assert_eq!(rel.as_str(), "alice/public/x.txt");
    }

    #[test]
    fn datasite_is_first_segment() {
        let p = RelativePath::new("alice/public/x.txt").unwrap();
        assert_eq!(p.datasite(), "alice");
    }

    #[test]
    fn is_permission_file_matches_fixed_name() {
        let perm = RelativePath::new("alice/public/_.syftperm").unwrap();
        let regular = RelativePath::new("alice/public/x.txt").unwrap();
        assert!(is_permission_file(&perm));
        assert!(!is_permission_file(&regular));
    }

    #[test]
    fn ancestor_dirs_excludes_self() {
        let p = RelativePath::new("alice/a/b/x.txt").unwrap();
        assert_eq!(p.ancestor_dirs(), vec!["alice", "alice/a", "alice/a/b"]);
    }
}
