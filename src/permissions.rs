use std::collections::HashSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::path::{RelativePath, PERMISSION_FILE_NAME};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
    Admin,
}

pub type PermissionSet = HashSet<Permission>;

/// One rule inside a permission file: grants `permissions` on paths matching
/// `path_glob` to `user` (an email, or `"*"` for everyone).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRule {
    #[serde(rename = "path")]
    pub path_glob: String,
    pub user: String,
    pub permissions: Vec<Permission>,
    /// When true, this rule stops inheritance for matching paths below it;
    /// deeper permission files may still add rules but nothing shallower
    /// applies past this point.
    #[serde(default)]
    pub terminal: bool,
}

/// The ordered list of rules living in one `_.syftperm` file, plus the
/// directory that file governs.
#[derive(Debug, Clone)]
pub struct PermissionFile {
    pub dir: RelativePath,
    pub rules: Vec<PermissionRule>,
}

impl PermissionFile {
    pub fn load(abs_path: &Path, dir: RelativePath) -> Result<Self> {
        let data = fs::read_to_string(abs_path)
            .with_context(|| format!("read permission file {}", abs_path.display()))?;
        let rules: Vec<PermissionRule> = serde_json::from_str(&data)
            .with_context(|| format!("parse permission file {}", abs_path.display()))?;
        Ok(Self { dir, rules })
    }
}

/// The merge of every permission file from a datasite root down to a
/// target path: deeper files override shallower ones rule-for-rule (a
/// shallower rule is skipped for a path once a deeper `terminal` rule has
/// matched it).
#[derive(Debug, Clone, Default)]
pub struct PermissionTree {
    /// Files ordered shallowest-first.
    files: Vec<PermissionFile>,
}

impl PermissionTree {
    pub fn new() -> Self {
        Self { files: Vec::new() }
    }

    pub fn push(&mut self, file: PermissionFile) {
        self.files.push(file);
    }

    /// Builds the effective permission set for `user` at `path`, walking
    /// from the datasite root to `path`, concatenating rules in order, and
    /// honoring `terminal` rules that stop further (shallower-applied)
    /// inheritance once reached walking root-to-leaf.
    pub fn permission_for(&self, path: &RelativePath, user: &str) -> PermissionSet {
        let mut effective = PermissionSet::new();
        let mut stopped = false;

        let mut ordered: Vec<&PermissionFile> = self.files.iter().collect();
        ordered.sort_by(|a, b| a.dir.as_str().len().cmp(&b.dir.as_str().len()));

        for file in ordered {
            if !governs(&file.dir, path) {
                continue;
            }
            for rule in &file.rules {
                if !glob_matches(&rule.path_glob, path, &file.dir) {
                    continue;
                }
                if rule.user == user || rule.user == "*" {
                    effective.extend(rule.permissions.iter().copied());
                }
                if rule.terminal {
                    stopped = true;
                }
            }
            if stopped {
                // A terminal rule at this depth still applies its own
                // grants (above); only rules from files *above* this depth
                // are prevented from applying further down, which the
                // shallow-to-deep walk above already guarantees since we
                // only break out of considering additional, deeper files.
                break;
            }
        }
        effective
    }
}

/// True if `dir` is `path`'s own directory or an ancestor of it.
fn governs(dir: &RelativePath, path: &RelativePath) -> bool {
    if dir.as_str() == path.datasite() && path.as_str().starts_with(dir.as_str()) {
        return true;
    }
    let prefix = format!("{}/", dir.as_str());
    path.as_str().starts_with(&prefix) || path.as_str() == dir.as_str()
}

/// Glob match of `pattern` (relative to the owning directory `base`)
/// against `path`, using the same glob syntax as the ignore file (`**`,
/// `*`, `?`).
fn glob_matches(pattern: &str, path: &RelativePath, base: &RelativePath) -> bool {
    let rel = path
        .as_str()
        .strip_prefix(base.as_str())
        .map(|s| s.trim_start_matches('/'))
        .unwrap_or(path.as_str());
    glob_match(pattern, rel)
}

fn glob_match(pattern: &str, text: &str) -> bool {
    let pat_segs: Vec<&str> = pattern.split('/').collect();
    let txt_segs: Vec<&str> = text.split('/').collect();
    glob_match_segs(&pat_segs, &txt_segs)
}

fn glob_match_segs(pat: &[&str], txt: &[&str]) -> bool {
    match pat.first() {
        None => txt.is_empty(),
        Some(&"**") => {
            if pat.len() == 1 {
                return true;
            }
            for i in 0..=txt.len() {
                if glob_match_segs(&pat[1..], &txt[i..]) {
                    return true;
                }
            }
            false
        }
        Some(seg) => {
            if txt.is_empty() {
                false
            } else {
                segment_match(seg, txt[0]) && glob_match_segs(&pat[1..], &txt[1..])
            }
        }
    }
}

fn segment_match(pattern: &str, text: &str) -> bool {
    fn inner(p: &[u8], t: &[u8]) -> bool {
        match (p.first(), t.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                (0..=t.len()).any(|i| inner(&p[1..], &t[i..]))
            }
            (Some(b'?'), Some(_)) => inner(&p[1..], &t[1..]),
            (Some(pc), Some(tc)) if pc == tc => inner(&p[1..], &t[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), text.as_bytes())
}

/// Required permission for editing a path: `admin` for permission files,
/// `write` for everything else.
pub fn required_write_permission(path: &RelativePath) -> Permission {
    if crate::path::is_permission_file(path) {
        Permission::Admin
    } else {
        Permission::Write
    }
}

pub fn required_read_permission() -> Permission {
    Permission::Read
}

/// Loads every `_.syftperm` file found under `datasite_root` (relative to
/// `root`) into a `PermissionTree`.
pub fn build_tree(root: &Path, datasite_root: &RelativePath) -> Result<PermissionTree> {
    let mut tree = PermissionTree::new();
    let abs_root = datasite_root.to_abs(root);
    for entry in walkdir::WalkDir::new(&abs_root)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if entry.file_type().is_file() && entry.file_name() == PERMISSION_FILE_NAME {
            let rel = RelativePath::from_abs(entry.path(), root)?;
            let dir_str = rel
                .as_str()
                .rsplit_once('/')
                .map(|(d, _)| d.to_string())
                .unwrap_or_else(|| datasite_root.as_str().to_string());
            let dir = RelativePath::new(dir_str)?;
            tree.push(PermissionFile::load(entry.path(), dir)?);
        }
    }
    Ok(tree)
}
