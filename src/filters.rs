use std::{
    fs,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use ignore::gitignore::{Gitignore, GitignoreBuilder};

/// Patterns ignored regardless of `.syftignore`, matching the set of paths
/// the sync engine itself creates as bookkeeping (temp files, markers) or
/// that are near-universally noise on a synced tree.
const DEFAULT_IGNORE_LINES: &[&str] = &[
    crate::path::IGNORE_FILE_NAME,
    "**/.*.tmp-*", // atomic-write temp files (see journal.rs, consumer.rs)
    "**/*.tmp-*",
    ".syftkeep",
    ".ipynb_checkpoints/",
    "__pycache__/",
    "*.py[cod]",
    ".vscode",
    ".idea",
    ".git",
    "*.tmp",
    "*.log",
    ".DS_Store",
];

/// The datasites-root ignore file (`.syftignore`), glob syntax with `#`
/// comments and `!` negations identical to common workspace-ignore files
/// (spec.md §6), plus the fixed defaults above. Both the local scan and the
/// remote listing are filtered through the same matcher so ignored paths
/// neither upload nor delete remote copies.
#[derive(Clone)]
pub struct SyncIgnoreList {
    base_dir: PathBuf,
    ignore: Gitignore,
}

impl SyncIgnoreList {
    pub fn load(datasites_root: &Path) -> Result<Self> {
        let mut builder = GitignoreBuilder::new(datasites_root);
        for line in DEFAULT_IGNORE_LINES {
            builder
                .add_line(None, line)
                .with_context(|| format!("add default ignore line: {line}"))?;
        }

        let ignore_path = datasites_root.join(crate::path::IGNORE_FILE_NAME);
        if ignore_path.exists() {
            for line in read_ignore_file(&ignore_path)? {
                builder
                    .add_line(None, &line)
                    .with_context(|| format!("add .syftignore line: {line}"))?;
            }
        }

        let ignore = builder.build().context("build ignore matcher")?;
        Ok(Self {
            base_dir: datasites_root.to_path_buf(),
            ignore,
        })
    }

    pub fn should_ignore_abs(&self, abs_path: &Path, is_dir: bool) -> bool {
        let rel = abs_path.strip_prefix(&self.base_dir).unwrap_or(abs_path);
        self.should_ignore_rel(rel, is_dir)
    }

    pub fn should_ignore_rel(&self, rel_path: &Path, is_dir: bool) -> bool {
        self.ignore
            .matched_path_or_any_parents(rel_path, is_dir)
            .is_ignore()
    }

    pub fn should_ignore_path(&self, path: &crate::path::RelativePath) -> bool {
        self.should_ignore_rel(Path::new(path.as_str()), false)
    }
}

fn read_ignore_file(path: &Path) -> Result<Vec<String>> {
    let file =
        fs::File::open(path).with_context(|| format!("open ignore file {}", path.display()))?;
    let mut out = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.contains('\0') {
            continue;
        }
        out.push(trimmed.to_string());
    }
    Ok(out)
}
