use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::path::{is_permission_file, RelativePath};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSide {
    Local,
    Remote,
}

/// `{ path, side_last_modified, date_last_modified, file_size }`: the
/// observation that produced a queue item.
#[derive(Debug, Clone)]
pub struct FileChangeInfo {
    pub path: RelativePath,
    pub side_last_modified: SyncSide,
    pub date_last_modified: DateTime<Utc>,
    pub file_size: u64,
}

impl FileChangeInfo {
    pub fn new(
        path: RelativePath,
        side_last_modified: SyncSide,
        date_last_modified: DateTime<Utc>,
        file_size: u64,
    ) -> Self {
        Self {
            path,
            side_last_modified,
            date_last_modified,
            file_size,
        }
    }

    /// Permission files sync first (priority 0) so subsequent content
    /// actions in the same cycle are evaluated under current rules;
    /// everything else is priced by size so small changes still jump
    /// ahead of a large one queued at the same time.
    pub fn get_priority(&self) -> u64 {
        if is_permission_file(&self.path) {
            0
        } else {
            self.file_size.max(1)
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncQueueItem {
    pub data: FileChangeInfo,
    pub priority: u64,
}

impl SyncQueueItem {
    pub fn new(data: FileChangeInfo) -> Self {
        let priority = data.get_priority();
        Self { data, priority }
    }
}

impl PartialEq for SyncQueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.data.path == other.data.path
    }
}
impl Eq for SyncQueueItem {}

impl Ord for SyncQueueItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the lowest priority (and,
        // for ties, the lexicographically-first path) pops first.
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.data.path.cmp(&self.data.path))
    }
}

impl PartialOrd for SyncQueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A priority queue of pending changes, deduplicated by path: `put`ting a
/// second change for a path already queued replaces the queued item with
/// the newer one rather than adding a duplicate entry.
#[derive(Default)]
pub struct SyncQueue {
    heap: BinaryHeap<SyncQueueItem>,
    queued_paths: HashSet<String>,
}

impl SyncQueue {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            queued_paths: HashSet::new(),
        }
    }

    /// Enqueues `info`, or replaces the existing entry for the same path
    /// so the queue always carries the most recently observed change.
    pub fn put(&mut self, info: FileChangeInfo) {
        let path = info.path.as_str().to_string();
        if self.queued_paths.contains(&path) {
            self.replace(&path, info);
            return;
        }
        self.queued_paths.insert(path);
        self.heap.push(SyncQueueItem::new(info));
    }

    fn replace(&mut self, path: &str, info: FileChangeInfo) {
        let mut rebuilt: Vec<SyncQueueItem> = self
            .heap
            .drain()
            .filter(|item| item.data.path.as_str() != path)
            .collect();
        rebuilt.push(SyncQueueItem::new(info));
        self.heap = rebuilt.into_iter().collect();
    }

    /// Returns the lowest-priority item, if any is queued within
    /// `timeout`. Since the producer fully populates the queue before the
    /// consumer drains it in this engine's single-threaded cooperative
    /// model, `timeout` only matters if a future concurrent producer is
    /// introduced; today it degrades to an immediate check.
    pub fn get(&mut self, _timeout: Duration) -> Option<SyncQueueItem> {
        let item = self.heap.pop()?;
        self.queued_paths.remove(item.data.path.as_str());
        Some(item)
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }
}
