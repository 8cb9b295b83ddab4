use serde::{Deserialize, Serialize};

use crate::metadata::FileMetadata;
use crate::path::RelativePath;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncActionKind {
    Noop,
    CreateLocal,
    CreateRemote,
    ModifyLocal,
    ModifyRemote,
    DeleteLocal,
    DeleteRemote,
}

impl SyncActionKind {
    pub fn is_noop(&self) -> bool {
        matches!(self, SyncActionKind::Noop)
    }

    pub fn is_remote_mutation(&self) -> bool {
        matches!(
            self,
            SyncActionKind::CreateRemote | SyncActionKind::ModifyRemote | SyncActionKind::DeleteRemote
        )
    }

    pub fn is_local_mutation(&self) -> bool {
        matches!(
            self,
            SyncActionKind::CreateLocal | SyncActionKind::ModifyLocal | SyncActionKind::DeleteLocal
        )
    }

    /// The deterministic inverse applied when the server rejects this
    /// action on a permission basis, one reversal per non-NOOP kind.
    pub fn reversal(&self) -> SyncActionKind {
        match self {
            SyncActionKind::DeleteLocal => SyncActionKind::CreateLocal,
            SyncActionKind::CreateRemote => SyncActionKind::DeleteLocal,
            SyncActionKind::ModifyRemote => SyncActionKind::ModifyLocal,
            SyncActionKind::CreateLocal => SyncActionKind::DeleteLocal,
            SyncActionKind::DeleteRemote => SyncActionKind::CreateLocal,
            SyncActionKind::ModifyLocal => SyncActionKind::ModifyLocal,
            SyncActionKind::Noop => SyncActionKind::Noop,
        }
    }
}

/// Outcome status attached to a processed action, distinct from its kind:
/// an action can be determined as e.g. `CreateRemote` but end up `Ignored`
/// if it would violate permissions or match an ignore rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionStatus {
    Applied,
    Ignored,
    Errored,
}

/// A tagged sync action: the target path, the action kind the three-way
/// diff produced, and the metadata that should land in the journal once
/// the action completes successfully (`None` for deletions).
#[derive(Debug, Clone)]
pub struct SyncAction {
    pub path: RelativePath,
    pub kind: SyncActionKind,
    pub resulting_metadata: Option<FileMetadata>,
}

impl SyncAction {
    pub fn new(path: RelativePath, kind: SyncActionKind, resulting_metadata: Option<FileMetadata>) -> Self {
        Self {
            path,
            kind,
            resulting_metadata,
        }
    }

    pub fn noop(path: RelativePath) -> Self {
        Self {
            path,
            kind: SyncActionKind::Noop,
            resulting_metadata: None,
        }
    }
}

/// Three-way diff: given the metadata triple (current local disk,
/// previously-synced journal entry, current remote), determines the one
/// `SyncAction` to take. Total function over every combination in the
/// decision table.
pub fn determine_action(
    path: RelativePath,
    local: Option<&FileMetadata>,
    previous: Option<&FileMetadata>,
    remote: Option<&FileMetadata>,
) -> SyncAction {
    use SyncActionKind::*;

    match (local, previous, remote) {
        (None, None, None) => SyncAction::noop(path),

        (None, None, Some(r)) => SyncAction::new(path, CreateLocal, Some(r.clone())),

        (Some(l), None, None) => SyncAction::new(path, CreateRemote, Some(l.clone())),

        (Some(l), None, Some(r)) => {
            if l.hash_equal(r) {
                // Converged without ever syncing (e.g. a reinstall landing on
                // disk already matching the server). The caller must still
                // record this in the journal even though the action itself
                // is a NOOP, or a later local deletion reads as brand-new
                // content absent from the journal and gets re-downloaded
                // instead of propagating as a delete.
                SyncAction::new(path, Noop, Some(r.clone()))
            } else if r.last_modified >= l.last_modified {
                SyncAction::new(path, ModifyLocal, Some(r.clone()))
            } else {
                SyncAction::new(path, ModifyRemote, Some(l.clone()))
            }
        }

        (Some(l), Some(p), None) => {
            if l.hash_equal(p) {
                SyncAction::new(path, DeleteLocal, None)
            } else {
                SyncAction::new(path, CreateRemote, Some(l.clone()))
            }
        }

        (None, Some(p), Some(r)) => {
            if p.hash_equal(r) {
                SyncAction::new(path, DeleteRemote, None)
            } else {
                SyncAction::new(path, ModifyLocal, Some(r.clone()))
            }
        }

        // Both sides have already converged on "this path doesn't exist".
        // The action is a NOOP, but a stale journal entry for it is a
        // tombstone the caller must clear; see enqueue_diffs in sync_loop.rs.
        (None, Some(_), None) => SyncAction::noop(path),

        (Some(l), Some(p), Some(r)) => {
            let l_eq_r = l.hash_equal(r);
            let l_eq_p = l.hash_equal(p);
            let p_eq_r = p.hash_equal(r);

            if l_eq_r {
                SyncAction::new(path, Noop, Some(l.clone()))
            } else if l_eq_p && !p_eq_r {
                SyncAction::new(path, ModifyLocal, Some(r.clone()))
            } else if !l_eq_p && p_eq_r {
                SyncAction::new(path, ModifyRemote, Some(l.clone()))
            } else {
                // Both sides changed since the journal and disagree: the
                // server is the linearization point, so it wins.
                SyncAction::new(path, ModifyLocal, Some(r.clone()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn meta(hash: &str, ts: i64) -> FileMetadata {
        FileMetadata {
            path: RelativePath::new("alice/x.txt").unwrap(),
            hash: hash.into(),
            signature: "sig".into(),
            file_size: 10,
            last_modified: ts_at(ts),
        }
    }

    fn ts_at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn p() -> RelativePath {
        RelativePath::new("alice/x.txt").unwrap()
    }

    #[test]
    fn nothing_exists_is_noop() {
        let action = determine_action(p(), None, None, None);
        assert_eq!(action.kind, SyncActionKind::Noop);
    }

    #[test]
    fn new_on_server_is_create_local() {
        let r = meta("aaa", 1);
        let action = determine_action(p(), None, None, Some(&r));
        assert_eq!(action.kind, SyncActionKind::CreateLocal);
    }

    #[test]
    fn new_locally_is_create_remote() {
        let l = meta("bbb", 1);
        let action = determine_action(p(), Some(&l), None, None);
        assert_eq!(action.kind, SyncActionKind::CreateRemote);
    }

    #[test]
    fn server_removed_known_file_is_delete_local() {
        let l = meta("ccc", 1);
        let p_meta = meta("ccc", 1);
        let action = determine_action(p(), Some(&l), Some(&p_meta), None);
        assert_eq!(action.kind, SyncActionKind::DeleteLocal);
    }

    #[test]
    fn user_removed_converged_file_is_delete_remote() {
        let p_meta = meta("ccc", 1);
        let r = meta("ccc", 1);
        let action = determine_action(p(), None, Some(&p_meta), Some(&r));
        assert_eq!(action.kind, SyncActionKind::DeleteRemote);
    }

    #[test]
    fn converged_on_deletion_is_noop() {
        let p_meta = meta("ccc", 1);
        let action = determine_action(p(), None, Some(&p_meta), None);
        assert_eq!(action.kind, SyncActionKind::Noop);
    }

    #[test]
    fn unchanged_is_noop() {
        let l = meta("ccc", 1);
        let p_meta = meta("ccc", 1);
        let r = meta("ccc", 1);
        let action = determine_action(p(), Some(&l), Some(&p_meta), Some(&r));
        assert_eq!(action.kind, SyncActionKind::Noop);
    }

    #[test]
    fn only_server_changed_is_modify_local() {
        let l = meta("ccc", 1);
        let p_meta = meta("ccc", 1);
        let r = meta("eee", 2);
        let action = determine_action(p(), Some(&l), Some(&p_meta), Some(&r));
        assert_eq!(action.kind, SyncActionKind::ModifyLocal);
    }

    #[test]
    fn only_local_changed_is_modify_remote() {
        let l = meta("ddd", 2);
        let p_meta = meta("ccc", 1);
        let r = meta("ccc", 1);
        let action = determine_action(p(), Some(&l), Some(&p_meta), Some(&r));
        assert_eq!(action.kind, SyncActionKind::ModifyRemote);
    }

    #[test]
    fn conflict_resolves_server_wins() {
        let l = meta("ddd", 1);
        let p_meta = meta("ccc", 1);
        let r = meta("eee", 2);
        let action = determine_action(p(), Some(&l), Some(&p_meta), Some(&r));
        assert_eq!(action.kind, SyncActionKind::ModifyLocal);
        assert_eq!(action.resulting_metadata.unwrap().hash, "eee");
    }

    #[test]
    fn local_deletion_vs_remote_change_server_wins() {
        let p_meta = meta("ccc", 1);
        let r = meta("eee", 2);
        let action = determine_action(p(), None, Some(&p_meta), Some(&r));
        assert_eq!(action.kind, SyncActionKind::ModifyLocal);
    }

    #[test]
    fn local_resurrected_is_create_remote() {
        let l = meta("ddd", 2);
        let p_meta = meta("ccc", 1);
        let action = determine_action(p(), Some(&l), Some(&p_meta), None);
        assert_eq!(action.kind, SyncActionKind::CreateRemote);
    }

    #[test]
    fn tie_breaks_to_modify_local() {
        let l = meta("ddd", 5);
        let r = meta("eee", 5);
        let action = determine_action(p(), Some(&l), None, Some(&r));
        assert_eq!(action.kind, SyncActionKind::ModifyLocal);
    }

    #[test]
    fn reversal_of_delete_local_is_create_local() {
        assert_eq!(
            SyncActionKind::DeleteLocal.reversal(),
            SyncActionKind::CreateLocal
        );
    }

    #[test]
    fn reversal_of_delete_remote_is_create_local() {
        assert_eq!(
            SyncActionKind::DeleteRemote.reversal(),
            SyncActionKind::CreateLocal
        );
    }

    #[test]
    fn reversal_of_create_remote_is_delete_local() {
        assert_eq!(
            SyncActionKind::CreateRemote.reversal(),
            SyncActionKind::DeleteLocal
        );
    }
}
