use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::action::{SyncAction, SyncActionKind};
use crate::errors::SyncEnvironmentError;
use crate::metadata::FileMetadata;
use crate::path::RelativePath;

/// Last successfully synced metadata for one path, plus the kind of the
/// last action applied to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalStateEntry {
    pub hash: String,
    pub signature: String,
    pub file_size: u64,
    pub last_modified: chrono::DateTime<chrono::Utc>,
    pub last_action: SyncActionKind,
}

impl LocalStateEntry {
    fn from_metadata(meta: &FileMetadata, action: SyncActionKind) -> Self {
        Self {
            hash: meta.hash.clone(),
            signature: meta.signature.clone(),
            file_size: meta.file_size,
            last_modified: meta.last_modified,
            last_action: action,
        }
    }

    pub fn to_metadata(&self, path: RelativePath) -> FileMetadata {
        FileMetadata {
            path,
            hash: self.hash.clone(),
            signature: self.signature.clone(),
            file_size: self.file_size,
            last_modified: self.last_modified,
        }
    }
}

/// The client's durable memory of the last-synced metadata per path,
/// persisted atomically as a single JSON document at
/// `<root>/.syft/local_state.json`.
pub struct LocalState {
    path: PathBuf,
    entries: HashMap<String, LocalStateEntry>,
}

fn journal_path(root: &Path) -> PathBuf {
    root.join(".syft").join("local_state.json")
}

impl LocalState {
    /// Creates an empty journal on disk at `root`'s journal path, failing
    /// if one already exists.
    pub fn init(root: &Path) -> Result<Self> {
        let path = journal_path(root);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let state = Self {
            path,
            entries: HashMap::new(),
        };
        state.save()?;
        Ok(state)
    }

    /// Loads the journal from disk. A missing file signals environment
    /// tampering (the sync folder was reset externally without going
    /// through `init`) and is raised as `SyncEnvironmentError`.
    pub fn load(root: &Path) -> Result<Self> {
        let path = journal_path(root);
        if !path.exists() {
            return Err(SyncEnvironmentError::new(format!(
                "journal file missing: {}",
                path.display()
            ))
            .into());
        }
        let data = fs::read_to_string(&path)
            .with_context(|| format!("read journal {}", path.display()))?;
        let entries: HashMap<String, LocalStateEntry> =
            serde_json::from_str(&data).with_context(|| format!("parse journal {}", path.display()))?;
        Ok(Self { path, entries })
    }

    /// Loads the journal if present, otherwise initializes a fresh one.
    /// Used on first-ever run of a datasites root.
    pub fn load_or_init(root: &Path) -> Result<Self> {
        let path = journal_path(root);
        if path.exists() {
            Self::load(root)
        } else {
            Self::init(root)
        }
    }

    pub fn get(&self, path: &RelativePath) -> Option<FileMetadata> {
        self.entries
            .get(path.as_str())
            .map(|e| e.to_metadata(path.clone()))
    }

    /// Upserts the entry for `path` and flushes to disk.
    pub fn insert_synced_file(
        &mut self,
        path: &RelativePath,
        metadata: &FileMetadata,
        action_kind: SyncActionKind,
    ) -> Result<()> {
        self.entries.insert(
            path.as_str().to_string(),
            LocalStateEntry::from_metadata(metadata, action_kind),
        );
        self.save()
    }

    /// Applies a completed action to the journal: deletions remove the
    /// entry, everything else records the new metadata.
    pub fn insert_completed_action(&mut self, action: &SyncAction) -> Result<()> {
        match action.kind {
            SyncActionKind::DeleteLocal | SyncActionKind::DeleteRemote => {
                self.entries.remove(action.path.as_str());
            }
            SyncActionKind::Noop => {}
            _ => {
                if let Some(meta) = &action.resulting_metadata {
                    self.entries.insert(
                        action.path.as_str().to_string(),
                        LocalStateEntry::from_metadata(meta, action.kind),
                    );
                }
            }
        }
        self.save()
    }

    pub fn remove(&mut self, path: &RelativePath) -> Result<()> {
        self.entries.remove(path.as_str());
        self.save()
    }

    /// Every path this journal remembers under `datasite` (its top-level
    /// path segment), regardless of whether local disk or the remote still
    /// has it. Used to find stale tombstones neither side has any longer.
    pub fn paths_for_datasite(&self, datasite: &str) -> Vec<RelativePath> {
        let prefix = format!("{datasite}/");
        self.entries
            .keys()
            .filter(|key| key.starts_with(&prefix))
            .filter_map(|key| RelativePath::new(key.clone()).ok())
            .collect()
    }

    /// Atomic write: serialize to a temp file in the same directory, then
    /// rename over the journal path so a crash mid-write never leaves a
    /// partially-written document in place.
    pub fn save(&self) -> Result<()> {
        let parent = self
            .path
            .parent()
            .context("journal path has no parent")?;
        fs::create_dir_all(parent)?;
        let tmp = parent.join(format!(".local_state.json.tmp-{}", uuid::Uuid::new_v4()));
        let data = serde_json::to_vec_pretty(&self.entries).context("serialize journal")?;
        fs::write(&tmp, &data).with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("rename {} -> {}", tmp.display(), self.path.display()))?;
        Ok(())
    }

    pub fn exists(root: &Path) -> bool {
        journal_path(root).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    fn make_temp_dir(prefix: &str) -> PathBuf {
        let mut root = std::env::temp_dir();
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        root.push(format!("{prefix}-{nanos}"));
        fs::create_dir_all(&root).unwrap();
        root
    }

    fn sample_metadata(path: &str) -> FileMetadata {
        FileMetadata {
            path: RelativePath::new(path).unwrap(),
            hash: "aaa".into(),
            signature: "sig".into(),
            file_size: 10,
            last_modified: chrono::Utc::now(),
        }
    }

    #[test]
    fn load_missing_journal_is_environment_error() {
        let root = make_temp_dir("syftbox-rs-journal-missing");
        let err = LocalState::load(&root).unwrap_err();
        assert!(err.downcast_ref::<SyncEnvironmentError>().is_some());
    }

    #[test]
    fn init_then_load_round_trips() {
        let root = make_temp_dir("syftbox-rs-journal-roundtrip");
        let mut journal = LocalState::init(&root).unwrap();
        let meta = sample_metadata("alice/x.txt");
        journal
            .insert_synced_file(&meta.path, &meta, SyncActionKind::CreateLocal)
            .unwrap();

        let reloaded = LocalState::load(&root).unwrap();
        let got = reloaded.get(&meta.path).unwrap();
        assert_eq!(got.hash, "aaa");
    }

    #[test]
    fn delete_action_removes_entry() {
        let root = make_temp_dir("syftbox-rs-journal-delete");
        let mut journal = LocalState::init(&root).unwrap();
        let meta = sample_metadata("alice/x.txt");
        journal
            .insert_synced_file(&meta.path, &meta, SyncActionKind::CreateLocal)
            .unwrap();

        let action = SyncAction {
            path: meta.path.clone(),
            kind: SyncActionKind::DeleteLocal,
            resulting_metadata: None,
        };
        journal.insert_completed_action(&action).unwrap();
        assert!(journal.get(&meta.path).is_none());
    }

    #[test]
    fn paths_for_datasite_filters_by_prefix() {
        let root = make_temp_dir("syftbox-rs-journal-paths");
        let mut journal = LocalState::init(&root).unwrap();
        let alice_meta = sample_metadata("alice/x.txt");
        let bob_meta = sample_metadata("bob/y.txt");
        journal
            .insert_synced_file(&alice_meta.path, &alice_meta, SyncActionKind::CreateLocal)
            .unwrap();
        journal
            .insert_synced_file(&bob_meta.path, &bob_meta, SyncActionKind::CreateLocal)
            .unwrap();

        let alice_paths = journal.paths_for_datasite("alice");
        assert_eq!(alice_paths.len(), 1);
        assert_eq!(alice_paths[0].as_str(), "alice/x.txt");
    }
}
