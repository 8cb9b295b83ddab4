use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::filters::SyncIgnoreList;
use crate::metadata::{self, FileMetadata};
use crate::path::RelativePath;
use crate::sync_client::SyncClient;

/// `{ email, local_state, remote_state }`: the in-memory snapshot one sync
/// cycle builds for a single datasite before diffing it through the action
/// determiner.
pub struct DatasiteState {
    pub email: String,
    pub local_state: Vec<FileMetadata>,
    pub remote_state: Vec<FileMetadata>,
}

/// Builds a `DatasiteState` for `email`: walks `<root>/datasites/<email>`
/// recursively hashing every file not matched by `ignore`, and fetches the
/// server's authoritative list over one HTTP call. Both lists are filtered
/// through the same ignore function so ignored files neither upload nor
/// delete remote copies.
pub async fn build(
    root: &Path,
    email: &str,
    ignore: &SyncIgnoreList,
    client: &dyn SyncClient,
) -> Result<DatasiteState> {
    let local_state = scan_local(root, email, ignore)?;
    let remote_state = client
        .get_remote_state(email)
        .await?
        .into_iter()
        .filter(|m| !ignore.should_ignore_path(&m.path))
        .collect();
    Ok(DatasiteState {
        email: email.to_string(),
        local_state,
        remote_state,
    })
}

fn scan_local(root: &Path, email: &str, ignore: &SyncIgnoreList) -> Result<Vec<FileMetadata>> {
    let datasites_root = root.join("datasites");
    let datasite_dir = datasites_root.join(email);
    if !datasite_dir.exists() {
        return Ok(Vec::new());
    }

    let mut out = Vec::new();
    for entry in walkdir::WalkDir::new(&datasite_dir)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let rel_to_datasites = entry
            .path()
            .strip_prefix(&datasites_root)
            .unwrap_or(entry.path());
        if ignore.should_ignore_rel(rel_to_datasites, false) {
            continue;
        }
        match metadata::hash_file(entry.path(), &datasites_root) {
            Ok(meta) => out.push(meta),
            Err(_) => {
                // Disappeared between the walk and the read: the next
                // determine_action call sees it absent, which is correct.
                continue;
            }
        }
    }
    Ok(out)
}

/// Extracts the bulk-download zip stream under `<root>/datasites`,
/// rejecting any entry whose name is absolute or contains a `..`
/// component, and returns the relative paths actually written so the
/// caller can hash each one and mark it `CREATE_LOCAL` in the journal.
pub async fn extract_bulk(root: &Path, zip_bytes: Vec<u8>) -> Result<Vec<RelativePath>> {
    let datasites_root = root.join("datasites");
    std::fs::create_dir_all(&datasites_root)
        .with_context(|| format!("create {}", datasites_root.display()))?;

    let reader = async_zip::base::read::mem::ZipFileReader::new(zip_bytes)
        .await
        .context("open bulk download zip")?;

    let mut extracted = Vec::new();
    for index in 0..reader.file().entries().len() {
        let entry = reader
            .file()
            .entries()
            .get(index)
            .context("zip entry index out of range")?;
        if entry.dir().unwrap_or(false) {
            continue;
        }
        let raw_name = entry
            .filename()
            .as_str()
            .context("zip entry name is not valid utf-8")?
            .to_string();
        let rel = safe_entry_path(&raw_name)?;

        let mut entry_reader = reader
            .reader_with_entry(index)
            .await
            .with_context(|| format!("open zip entry {raw_name}"))?;
        let mut buf = Vec::new();
        futures_util::io::AsyncReadExt::read_to_end(&mut entry_reader, &mut buf)
            .await
            .with_context(|| format!("read zip entry {raw_name}"))?;

        let target = rel.to_abs(&datasites_root);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        crate::consumer::write_atomic(&target, &buf)?;
        extracted.push(rel);
    }
    Ok(extracted)
}

fn safe_entry_path(raw: &str) -> Result<RelativePath> {
    if raw.starts_with('/') || raw.starts_with('\\') || raw.contains(':') {
        bail!("zip entry has an absolute or drive-qualified path: {raw}");
    }
    RelativePath::new(raw)
}
