/*
 * resman - Game resource update and sync engine.
 * Copyright (C) 2025  resman contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Worker state shared between a tree's worker thread and its callers.

use crate::error::{ErrorReport, WorkerError};
use crate::manifest::ResourceEntry;
use crate::mirror::MirrorPool;
use crate::progress::{ActiveJobs, WorkProgress};
use crate::scheduler::PendingDownloadItem;
use crate::util::lock;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// What a tree's worker is doing, or last did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WorkerMode {
    Idle = 0,
    Fetching = 1,
    Downloading = 2,
    Checking = 3,
    RemovingModifications = 4,
}

impl WorkerMode {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => WorkerMode::Fetching,
            2 => WorkerMode::Downloading,
            3 => WorkerMode::Checking,
            4 => WorkerMode::RemovingModifications,
            _ => WorkerMode::Idle,
        }
    }
}

impl fmt::Display for WorkerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerMode::Idle => "idle",
            WorkerMode::Fetching => "updates fetcher",
            WorkerMode::Downloading => "files downloader",
            WorkerMode::Checking => "files checker",
            WorkerMode::RemovingModifications => "modifications remover",
        };
        f.write_str(name)
    }
}

/// Counters a node publishes for lock-free reads while the worker owns it
#[derive(Debug, Default)]
pub(crate) struct NodeCounters {
    pub(crate) pending_files: AtomicUsize,
    entries: AtomicUsize,
    pending_bytes: AtomicU64,
    children: Mutex<Vec<Arc<NodeCounters>>>,
}

impl NodeCounters {
    pub(crate) fn publish(&self, entries: usize, pending: &[PendingDownloadItem]) {
        let bytes = pending.iter().map(|item| item.entry.transfer_size()).sum();
        self.entries.store(entries, Ordering::SeqCst);
        self.pending_files.store(pending.len(), Ordering::SeqCst);
        self.pending_bytes.store(bytes, Ordering::SeqCst);
    }

    pub(crate) fn attach(&self, child: Arc<NodeCounters>) {
        lock(&self.children).push(child);
    }

    fn sum<F>(&self, include_dependencies: bool, read: &F) -> u64
    where
        F: Fn(&NodeCounters) -> u64,
    {
        let mut total = read(self);
        if include_dependencies {
            for child in lock(&self.children).iter() {
                total += child.sum(true, read);
            }
        }
        total
    }

    pub(crate) fn pending_files(&self, include_dependencies: bool) -> usize {
        self.sum(include_dependencies, &|c| c.pending_files.load(Ordering::SeqCst) as u64) as usize
    }

    pub(crate) fn entries(&self, include_dependencies: bool) -> usize {
        self.sum(include_dependencies, &|c| c.entries.load(Ordering::SeqCst) as u64) as usize
    }

    pub(crate) fn pending_bytes(&self, include_dependencies: bool) -> u64 {
        self.sum(include_dependencies, &|c| c.pending_bytes.load(Ordering::SeqCst))
    }
}

/// Data a worker operates on: one tree and, by exclusive ownership, its dependencies
#[derive(Debug)]
pub(crate) struct TreeNode {
    pub(crate) base_path: PathBuf,
    pub(crate) mirrors: Arc<MirrorPool>,
    pub(crate) items: Vec<ResourceEntry>,
    pub(crate) pending: Vec<PendingDownloadItem>,
    pub(crate) counters: Arc<NodeCounters>,
    pub(crate) dependencies: Vec<TreeNode>,
}

impl TreeNode {
    pub(crate) fn new(base_path: PathBuf, mirrors: Arc<MirrorPool>) -> Self {
        Self {
            base_path,
            mirrors,
            items: Vec::new(),
            pending: Vec::new(),
            counters: Arc::new(NodeCounters::default()),
            dependencies: Vec::new(),
        }
    }

    pub(crate) fn publish(&self) {
        self.counters.publish(self.items.len(), &self.pending);
    }

    /// Point this node and everything below it at `base_path`
    pub(crate) fn rebase(&mut self, base_path: &Path) {
        self.base_path = base_path.to_path_buf();
        for dependency in &mut self.dependencies {
            dependency.rebase(base_path);
        }
    }

    pub(crate) fn tree_count(&self) -> u64 {
        1 + self.dependencies.iter().map(TreeNode::tree_count).sum::<u64>()
    }

    pub(crate) fn entry_count(&self) -> u64 {
        self.items.len() as u64 + self.dependencies.iter().map(TreeNode::entry_count).sum::<u64>()
    }

    pub(crate) fn pending_transfer_bytes(&self) -> u64 {
        let own: u64 = self.pending.iter().map(|item| item.entry.transfer_size()).sum();
        own + self
            .dependencies
            .iter()
            .map(TreeNode::pending_transfer_bytes)
            .sum::<u64>()
    }
}

/// State of a root tree's worker, readable from any thread
#[derive(Debug, Default)]
pub(crate) struct TreeState {
    current: AtomicU8,
    last: AtomicU8,
    pub(crate) progress: WorkProgress,
    pub(crate) jobs: ActiveJobs,
    error: Mutex<Option<WorkerError>>,
}

impl TreeState {
    pub(crate) fn current(&self) -> WorkerMode {
        WorkerMode::from_u8(self.current.load(Ordering::SeqCst))
    }

    pub(crate) fn last(&self) -> WorkerMode {
        WorkerMode::from_u8(self.last.load(Ordering::SeqCst))
    }

    /// Enter `mode` for a new operation
    pub(crate) fn begin(&self, mode: WorkerMode) {
        *lock(&self.error) = None;
        self.progress.clear_stop();
        self.progress.reset(0);
        self.current.store(mode as u8, Ordering::SeqCst);
    }

    /// Return to idle, remembering the mode that just finished
    pub(crate) fn finish(&self) {
        let finished = self.current.swap(WorkerMode::Idle as u8, Ordering::SeqCst);
        self.last.store(finished, Ordering::SeqCst);
    }

    /// Undo `begin` for an operation whose worker never started
    pub(crate) fn abandon(&self) {
        self.current.store(WorkerMode::Idle as u8, Ordering::SeqCst);
    }

    /// Keep the first terminal error of the operation
    pub(crate) fn store_error(&self, err: WorkerError) {
        let mut slot = lock(&self.error);
        match slot.as_ref() {
            None => *slot = Some(err),
            Some(first) => debug!("not storing '{}', '{}' was raised first", err, first),
        }
    }

    pub(crate) fn with_error<T>(&self, read: impl FnOnce(&WorkerError) -> T) -> Option<T> {
        lock(&self.error).as_ref().map(read)
    }

    pub(crate) fn error_report(&self) -> Option<ErrorReport> {
        self.with_error(WorkerError::report)
    }
}
