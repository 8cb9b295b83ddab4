use std::path::Path;

use anyhow::{Context, Result};

use crate::action::{SyncAction, SyncActionKind};
use crate::config::Config;
use crate::errors::{self, FatalSyncError, Outcome, SyftPermissionError, SyncValidationError};
use crate::journal::LocalState;
use crate::logging;
use crate::metadata;
use crate::path::RelativePath;
use crate::permissions::{self, Permission, PermissionTree};
use crate::sync_client::SyncClient;

/// Outcome the caller acts on once an action has been handed to the
/// consumer: whether the journal already reflects it, or whether it must
/// be retried (validation/transient) or the whole cycle aborted (fatal).
pub enum ConsumerOutcome {
    Applied,
    Reversed(SyncActionKind),
    RetryLater,
    Fatal(anyhow::Error),
}

/// Validates and executes one `SyncAction` against `client`, writing the
/// result to `journal` and the local disk under `root` as appropriate.
///
/// Mirrors spec.md §4.7: validate (permission + size) before touching the
/// network, execute, classify the outcome, and either commit, reverse, or
/// leave the queue entry for a later cycle. `NOOP` and ignored actions
/// never reach the journal.
pub async fn process(
    root: &Path,
    user_email: &str,
    action: SyncAction,
    permissions: &PermissionTree,
    cfg: &Config,
    client: &dyn SyncClient,
    journal: &mut LocalState,
) -> Result<ConsumerOutcome> {
    match validate_and_execute(root, user_email, action, permissions, cfg, client).await {
        Validated::Ignored => Ok(ConsumerOutcome::Applied),
        Validated::Ran(action, result) => finalize(root, action, result, journal, client).await,
    }
}

/// Network/disk half of processing one action, with no journal access —
/// safe to run for several queue items concurrently (bounded by
/// `cfg.worker_pool_size`) since it touches no shared mutable state.
/// `finalize` must then be called for each result, in order, to keep
/// journal mutations serialized per spec.md §5.
pub async fn validate_and_execute(
    root: &Path,
    user_email: &str,
    action: SyncAction,
    permissions: &PermissionTree,
    cfg: &Config,
    client: &dyn SyncClient,
) -> Validated {
    if action.kind.is_noop() {
        return Validated::Ignored;
    }
    if let Err(err) = validate(root, user_email, &action, permissions, cfg) {
        logging::info_kv(
            "action ignored",
            &[
                ("path", action.path.as_str()),
                ("kind", &format!("{:?}", action.kind)),
                ("reason", &err.to_string()),
            ],
        );
        return Validated::Ignored;
    }
    let result = execute(root, &action, client).await;
    Validated::Ran(action, result)
}

pub enum Validated {
    Ignored,
    Ran(SyncAction, Result<()>),
}

/// Journal-mutation half of processing one action: classifies the
/// `validate_and_execute` outcome and commits, reverses, or requests a
/// retry. Must be called in queue order relative to other `finalize`
/// calls sharing the same journal.
pub async fn finalize(
    root: &Path,
    action: SyncAction,
    result: Result<()>,
    journal: &mut LocalState,
    client: &dyn SyncClient,
) -> Result<ConsumerOutcome> {
    if !LocalState::exists(root) {
        return Ok(ConsumerOutcome::Fatal(
            FatalSyncError::new(format!(
                "journal vanished mid-cycle while processing {}",
                action.path
            ))
            .into(),
        ));
    }

    match result {
        Ok(()) => {
            journal.insert_completed_action(&action)?;
            logging::info_kv(
                "action applied",
                &[
                    ("path", action.path.as_str()),
                    ("kind", &format!("{:?}", action.kind)),
                ],
            );
            Ok(ConsumerOutcome::Applied)
        }
        Err(err) => match errors::classify(&err) {
            Outcome::PermissionRejected => {
                let reversal = action.kind.reversal();
                logging::info_kv(
                    "action reversed",
                    &[
                        ("path", action.path.as_str()),
                        ("kind", &format!("{:?}", action.kind)),
                        ("reversal", &format!("{:?}", reversal)),
                    ],
                );
                apply_reversal(root, &action, reversal, client).await?;
                Ok(ConsumerOutcome::Reversed(reversal))
            }
            Outcome::ValidationFailed => {
                logging::error(&format!(
                    "validation rejected {}: {err:#}",
                    action.path.as_str()
                ));
                Ok(ConsumerOutcome::RetryLater)
            }
            Outcome::Transient => {
                logging::error(&format!(
                    "transient error syncing {}: {err:#}",
                    action.path.as_str()
                ));
                Ok(ConsumerOutcome::RetryLater)
            }
            Outcome::Success => unreachable!("classify never returns Success for an Err"),
        },
    }
}

fn validate(
    root: &Path,
    user_email: &str,
    action: &SyncAction,
    permissions: &PermissionTree,
    cfg: &Config,
) -> Result<()> {
    if action.kind.is_remote_mutation() {
        let required = permissions::required_write_permission(&action.path);
        let grant = permissions.permission_for(&action.path, user_email);
        if !grant.contains(&required) {
            anyhow::bail!(SyftPermissionError(format!(
                "missing {required:?} permission for {}",
                action.path.as_str()
            )));
        }
    }

    if matches!(
        action.kind,
        SyncActionKind::CreateRemote | SyncActionKind::ModifyRemote
    ) {
        if let Some(meta) = &action.resulting_metadata {
            if meta.file_size > cfg.max_upload_bytes {
                anyhow::bail!(SyncValidationError(format!(
                    "{} ({} bytes) exceeds max_upload_bytes ({})",
                    action.path.as_str(),
                    meta.file_size,
                    cfg.max_upload_bytes
                )));
            }
        }
    }

    let _ = root;
    Ok(())
}

async fn execute(root: &Path, action: &SyncAction, client: &dyn SyncClient) -> Result<()> {
    let datasites_root = root.join("datasites");
    match action.kind {
        SyncActionKind::Noop => Ok(()),

        SyncActionKind::CreateLocal | SyncActionKind::ModifyLocal => {
            let (bytes, _meta) = client.download(&action.path).await?;
            let target = action.path.to_abs(&datasites_root);
            write_atomic(&target, &bytes)
        }

        SyncActionKind::DeleteLocal => {
            let target = action.path.to_abs(&datasites_root);
            remove_local(&target)
        }

        SyncActionKind::CreateRemote | SyncActionKind::ModifyRemote => {
            let target = action.path.to_abs(&datasites_root);
            let bytes = std::fs::read(&target)
                .with_context(|| format!("read {}", target.display()))?;
            // The file may have changed again since the diff that produced
            // this action; re-hash before uploading so a fast double-edit
            // never ships a stale signature to the server.
            let fresh = metadata::hash_file(&target, &datasites_root)?;
            client.upload(&action.path, &bytes, &fresh.signature).await?;
            Ok(())
        }

        SyncActionKind::DeleteRemote => client.delete(&action.path).await,
    }
}

async fn apply_reversal(
    root: &Path,
    original: &SyncAction,
    reversal: SyncActionKind,
    client: &dyn SyncClient,
) -> Result<()> {
    let datasites_root = root.join("datasites");
    match reversal {
        SyncActionKind::CreateLocal => {
            // Reversal of a rejected DELETE_LOCAL or DELETE_REMOTE: the
            // local copy must exist again, so re-download it exactly as a
            // fresh CREATE_LOCAL would.
            let (bytes, _meta) = client.download(&original.path).await?;
            let target = original.path.to_abs(&datasites_root);
            write_atomic(&target, &bytes)?;
        }
        SyncActionKind::DeleteLocal => {
            let target = original.path.to_abs(&datasites_root);
            remove_local(&target)?;
        }
        SyncActionKind::ModifyLocal => {
            // A rejected ModifyRemote reverses to ModifyLocal: the local
            // edit is discarded in favor of whatever the journal still
            // holds as the last-synced remote copy; nothing to write here
            // since the disk wasn't touched by the failed upload attempt.
        }
        SyncActionKind::Noop
        | SyncActionKind::CreateRemote
        | SyncActionKind::ModifyRemote
        | SyncActionKind::DeleteRemote => {}
    }
    // A reversal restores whichever side was about to diverge back to what
    // the journal already records as last-synced; the journal itself is
    // never touched here.
    Ok(())
}

fn remove_local(target: &Path) -> Result<()> {
    if !target.exists() {
        return Ok(());
    }
    let meta = std::fs::metadata(target)?;
    if meta.is_dir() {
        std::fs::remove_dir_all(target)
    } else {
        std::fs::remove_file(target)
    }
    .with_context(|| format!("remove {}", target.display()))
}

/// Writes `bytes` to `target` via a same-directory temp file and rename, so
/// a crash mid-write never leaves a half-written file in place. If a
/// directory already occupies `target` (a remote rename collided with a
/// local directory), it is removed first.
pub fn write_atomic(target: &Path, bytes: &[u8]) -> Result<()> {
    let parent = target.parent().context("target has no parent")?;
    std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    if target.exists() {
        let meta = std::fs::metadata(target)?;
        if meta.is_dir() {
            std::fs::remove_dir_all(target)?;
        }
    }
    let fname = target.file_name().and_then(|n| n.to_str()).unwrap_or("file");
    let tmp = parent.join(format!(".{fname}.tmp-{}", uuid::Uuid::new_v4()));
    std::fs::write(&tmp, bytes).with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, target)
        .with_context(|| format!("rename {} -> {}", tmp.display(), target.display()))?;
    Ok(())
}
