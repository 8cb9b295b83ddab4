use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::action::{self, SyncActionKind};
use crate::config::Config;
use crate::consumer::{self, ConsumerOutcome};
use crate::datasite::{self, DatasiteState};
use crate::errors::SyncEnvironmentError;
use crate::filters::SyncIgnoreList;
use crate::journal::LocalState;
use crate::logging;
use crate::path::RelativePath;
use crate::permissions::{self, PermissionTree};
use crate::queue::{FileChangeInfo, SyncQueue, SyncSide};
use crate::sync_client::SyncClient;

/// Runs the sync loop until `stop` is set, sleeping `cfg.poll_interval_secs`
/// between cycles. Mirrors spec.md §4.8's five-step tick. Cancellation is
/// cooperative: `stop` is only observed between cycles and between queue
/// items, never mid-journal-write (checked inside `drain_queue` too).
pub async fn run(root: &Path, cfg: &Config, client: Arc<dyn SyncClient>, stop: Arc<AtomicBool>) -> Result<()> {
    while !stop.load(Ordering::SeqCst) {
        match run_once(root, cfg, client.as_ref()).await {
            Ok(()) => {}
            Err(err) if err.downcast_ref::<SyncEnvironmentError>().is_some() => {
                logging::error(&format!("sync environment invalid, aborting: {err:#}"));
                return Err(err);
            }
            Err(err) if err.downcast_ref::<crate::errors::FatalSyncError>().is_some() => {
                logging::error(&format!("fatal sync error, aborting: {err:#}"));
                return Err(err);
            }
            Err(err) => {
                logging::error(&format!("sync cycle failed, will retry next tick: {err:#}"));
            }
        }

        let interval = Duration::from_secs(cfg.poll_interval_secs);
        let slept = Duration::from_millis(100);
        let mut waited = Duration::ZERO;
        while waited < interval {
            if stop.load(Ordering::SeqCst) {
                return Ok(());
            }
            tokio::time::sleep(slept.min(interval - waited)).await;
            waited += slept;
        }
    }
    Ok(())
}

/// Runs exactly one tick (used by the `sync-once` CLI command as well as
/// the `run` loop above).
pub async fn run_once(root: &Path, cfg: &Config, client: &dyn SyncClient) -> Result<()> {
    validate_sync_environment(root)?;

    let datasites_root = root.join("datasites");
    let ignore = SyncIgnoreList::load(&datasites_root).context("load .syftignore")?;
    let mut journal = LocalState::load(root)?;
    let datasites = list_known_datasites(root, &cfg.email)?;

    let mut queue = SyncQueue::new();
    let mut bulk_candidates: Vec<RelativePath> = Vec::new();

    for email in &datasites {
        let state = datasite::build(root, email, &ignore, client).await?;
        enqueue_diffs(&state, &mut journal, &mut queue, &mut bulk_candidates)?;
    }

    if !bulk_candidates.is_empty() {
        match run_bulk_bootstrap(root, client, &bulk_candidates, &mut journal).await {
            Ok(fetched) => {
                let fetched: std::collections::HashSet<String> =
                    fetched.iter().map(|p| p.as_str().to_string()).collect();
                queue_retain_not_fetched(&mut queue, &fetched);
            }
            Err(err) => {
                logging::error(&format!("bulk bootstrap failed, falling back per-file: {err:#}"));
            }
        }
    }

    drain_queue(root, cfg, client, &mut queue, &mut journal).await?;
    Ok(())
}

/// `validate_sync_environment()`: the datasites directory and the journal
/// file must both exist; either missing is a fatal, loop-aborting error
/// rather than something the consumer can route around.
pub fn validate_sync_environment(root: &Path) -> Result<()> {
    let datasites_root = root.join("datasites");
    if !datasites_root.is_dir() {
        return Err(SyncEnvironmentError::new(format!(
            "datasites directory missing: {}",
            datasites_root.display()
        ))
        .into());
    }
    if !LocalState::exists(root) {
        return Err(SyncEnvironmentError::new(format!(
            "journal file missing under {}",
            root.display()
        ))
        .into());
    }
    Ok(())
}

/// Every subdirectory of `<root>/datasites/` is a known datasite (the
/// user's own, plus any shared datasite already materialized locally);
/// the user's own datasite directory is created if it doesn't yet exist
/// so a brand-new install has somewhere to scan and upload from.
fn list_known_datasites(root: &Path, own_email: &str) -> Result<Vec<String>> {
    let datasites_root = root.join("datasites");
    let own_dir = datasites_root.join(own_email);
    std::fs::create_dir_all(&own_dir)
        .with_context(|| format!("create {}", own_dir.display()))?;

    let mut out = Vec::new();
    for entry in std::fs::read_dir(&datasites_root)
        .with_context(|| format!("read_dir {}", datasites_root.display()))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            out.push(name.to_string());
        }
    }
    out.sort();
    out.dedup();
    Ok(out)
}

/// Diffs one datasite's local/journal/remote triple and feeds the result
/// either into the priority queue (journal already has a prior entry, or
/// the file is purely local/purely remote-content-changed) or into the
/// bulk-bootstrap candidate list (never-before-seen remote path).
fn enqueue_diffs(
    state: &DatasiteState,
    journal: &mut LocalState,
    queue: &mut SyncQueue,
    bulk_candidates: &mut Vec<RelativePath>,
) -> Result<()> {
    let mut seen = std::collections::HashSet::new();

    for local in &state.local_state {
        seen.insert(local.path.as_str().to_string());
        let previous = journal.get(&local.path);
        let remote = state
            .remote_state
            .iter()
            .find(|r| r.path == local.path);
        queue_action(local.path.clone(), Some(local), previous.as_ref(), remote, queue, journal)?;
    }

    for remote in &state.remote_state {
        if seen.contains(remote.path.as_str()) {
            continue;
        }
        seen.insert(remote.path.as_str().to_string());
        let previous = journal.get(&remote.path);
        if previous.is_none() {
            // Never seen locally or in the journal: a bulk-bootstrap
            // candidate rather than a queue item, per spec.md §4.8 step 3.
            bulk_candidates.push(remote.path.clone());
            continue;
        }
        queue_action(remote.path.clone(), None, previous.as_ref(), Some(remote), queue, journal)?;
    }

    // Paths the journal remembers but neither side has any longer converge
    // on deletion (the ∅ | x | ∅ decision-table row): determine_action
    // reports NOOP since there's nothing left to sync, but the stale
    // tombstone must still be cleared so a later remote recreation of the
    // same path isn't misread as a pending delete against the old entry.
    for path in journal.paths_for_datasite(&state.email) {
        if seen.contains(path.as_str()) {
            continue;
        }
        journal.remove(&path)?;
    }

    Ok(())
}

fn queue_action(
    path: RelativePath,
    local: Option<&crate::metadata::FileMetadata>,
    previous: Option<&crate::metadata::FileMetadata>,
    remote: Option<&crate::metadata::FileMetadata>,
    queue: &mut SyncQueue,
    journal: &mut LocalState,
) -> Result<()> {
    let action = action::determine_action(path.clone(), local, previous, remote);
    if action.kind.is_noop() {
        // (Some l, None, Some r) with l.hash_equal(r): content converged
        // without ever going through a queued action (e.g. a reinstall
        // landing on disk already matching the server). The journal has no
        // entry yet, so record the converged state now — otherwise a later
        // local deletion reads as (None, None-journal, Some r) and the file
        // is silently re-downloaded instead of the deletion propagating.
        if previous.is_none() {
            if let Some(meta) = &action.resulting_metadata {
                journal.insert_synced_file(&path, meta, SyncActionKind::Noop)?;
            }
        }
        return Ok(());
    }
    let side = if action.kind.is_remote_mutation() {
        SyncSide::Local
    } else {
        SyncSide::Remote
    };
    let (size, when) = action
        .resulting_metadata
        .as_ref()
        .map(|m| (m.file_size, m.last_modified))
        .unwrap_or((0, chrono::Utc::now()));
    queue.put(FileChangeInfo::new(path, side, when, size));
    Ok(())
}

/// Step 3: collects every remote path absent from the journal, issues one
/// `download_bulk`, extracts it under the datasites root, and marks each
/// extracted path `CREATE_LOCAL` in the journal directly (bypassing the
/// queue, since the content is already on disk).
async fn run_bulk_bootstrap(
    root: &Path,
    client: &dyn SyncClient,
    candidates: &[RelativePath],
    journal: &mut LocalState,
) -> Result<Vec<RelativePath>> {
    let zip_bytes = client.download_bulk(candidates).await?;
    let extracted = datasite::extract_bulk(root, zip_bytes).await?;

    let datasites_root = root.join("datasites");
    for path in &extracted {
        let abs = path.to_abs(&datasites_root);
        match crate::metadata::hash_file(&abs, &datasites_root) {
            Ok(meta) => {
                journal.insert_synced_file(path, &meta, SyncActionKind::CreateLocal)?;
            }
            Err(err) => {
                logging::error(&format!("bulk-extracted file vanished before hashing: {err:#}"));
            }
        }
    }
    logging::info_kv(
        "bulk bootstrap complete",
        &[("count", &extracted.len().to_string())],
    );
    Ok(extracted)
}

fn queue_retain_not_fetched(queue: &mut SyncQueue, fetched: &std::collections::HashSet<String>) {
    let mut remaining = Vec::new();
    while let Some(item) = queue.get(Duration::from_millis(0)) {
        if !fetched.contains(item.data.path.as_str()) {
            remaining.push(item.data);
        }
    }
    for info in remaining {
        queue.put(info);
    }
}

/// Step 4: drains the queue in two priority tiers — every priority-0
/// (permission file) action completes before any content action is even
/// diffed, per spec.md §5's ordering guarantee — with bounded concurrency
/// for network I/O inside each tier and journal mutations serialized
/// through the loop owner afterward.
async fn drain_queue(
    root: &Path,
    cfg: &Config,
    client: &dyn SyncClient,
    queue: &mut SyncQueue,
    journal: &mut LocalState,
) -> Result<()> {
    let mut drained = Vec::new();
    while let Some(item) = queue.get(Duration::from_millis(0)) {
        drained.push(item.data);
    }
    // SyncQueue always pops ascending by priority, so every priority-0
    // item (permission files) appears as a contiguous prefix.
    let split = drained
        .iter()
        .position(|info| info.get_priority() != 0)
        .unwrap_or(drained.len());
    let (tier0, tier1) = drained.split_at(split);

    drain_tier(root, cfg, client, tier0, journal).await?;
    drain_tier(root, cfg, client, tier1, journal).await?;
    Ok(())
}

async fn drain_tier(
    root: &Path,
    cfg: &Config,
    client: &dyn SyncClient,
    tier: &[FileChangeInfo],
    journal: &mut LocalState,
) -> Result<()> {
    use futures_util::stream::{self, StreamExt};

    let datasites_root = root.join("datasites");
    let mut trees: std::collections::HashMap<String, PermissionTree> = std::collections::HashMap::new();
    let mut pending = Vec::with_capacity(tier.len());

    for info in tier {
        validate_sync_environment(root)?;

        let owner_datasite = info.path.datasite().to_string();
        if !trees.contains_key(&owner_datasite) {
            let datasite_rel = RelativePath::new(owner_datasite.clone())?;
            trees.insert(
                owner_datasite.clone(),
                permissions::build_tree(root, &datasite_rel).unwrap_or_default(),
            );
        }

        let previous = journal.get(&info.path);
        let local_abs = info.path.to_abs(&datasites_root);
        let local = if local_abs.exists() {
            crate::metadata::hash_file(&local_abs, &datasites_root).ok()
        } else {
            None
        };
        let remote = client.get_metadata(&info.path).await.unwrap_or(None);

        let action = action::determine_action(info.path.clone(), local.as_ref(), previous.as_ref(), remote.as_ref());
        if !action.kind.is_noop() {
            pending.push((action, owner_datasite));
        }
    }

    let user_email = cfg.email.clone();
    let results: Vec<consumer::Validated> = stream::iter(pending.into_iter().map(|(action, owner_datasite)| {
        let tree = trees.get(&owner_datasite).cloned().unwrap_or_default();
        let user_email = user_email.clone();
        async move { consumer::validate_and_execute(root, &user_email, action, &tree, cfg, client).await }
    }))
    .buffer_unordered(cfg.worker_pool_size.max(1))
    .collect()
    .await;

    for validated in results {
        if let consumer::Validated::Ran(action, result) = validated {
            match consumer::finalize(root, action, result, journal, client).await? {
                ConsumerOutcome::Applied | ConsumerOutcome::Reversed(_) => {}
                // No re-enqueue here: run_once builds a fresh SyncQueue every
                // cycle and nothing drains it after this function returns, so
                // a re-put would be dead weight. The action is re-derived
                // from truth (disk, journal, remote) on the next cycle.
                ConsumerOutcome::RetryLater => {}
                ConsumerOutcome::Fatal(err) => return Err(err),
            }
        }
    }
    Ok(())
}
