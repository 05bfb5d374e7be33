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

//! Operation passes executed on a tree's worker thread.
//!
//! Every pass runs against the root node first and then recurses into each
//! dependency with the same context. Errors bubble up with `?`; only [`run`]
//! stores them on the root state.

use super::state::{TreeNode, TreeState, WorkerMode};
use crate::config::Config;
use crate::error::WorkerError;
use crate::hasher;
use crate::manifest::{parse_manifest, ResourceEntry, MANIFEST_FILENAME};
use crate::mirror::MirrorPool;
use crate::progress::WorkProgress;
use crate::scheduler::{DownloadScheduler, PendingDownloadItem, SchedulerLimits};
use crate::transfer::{BodySink, TransferError, Transport};
use crate::util::lock;
use async_trait::async_trait;
use std::fs;
use std::future::Future;
use std::io;
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::Mutex;
use std::thread;
use tokio::runtime::Runtime;
use tracing::{error, info, trace};

/// Everything a pass needs besides the node it works on
pub(crate) struct PassContext<'a> {
    pub(crate) state: &'a TreeState,
    pub(crate) transport: &'a dyn Transport,
    pub(crate) limits: SchedulerLimits,
}

impl PassContext<'_> {
    fn ensure_running(&self) -> Result<(), WorkerError> {
        if self.state.progress.stop_requested() {
            return Err(WorkerError::ForceStopped);
        }
        Ok(())
    }
}

/// Puts the tree back to idle when the worker exits, even by panic
struct ModeReset<'a>(&'a TreeState);

impl Drop for ModeReset<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.store_error(WorkerError::Panicked);
        }
        self.0.finish();
    }
}

/// Worker thread entry point
pub(crate) fn run(
    mode: WorkerMode,
    node: &Mutex<TreeNode>,
    state: &TreeState,
    transport: &dyn Transport,
    config: &Config,
) {
    let _reset = ModeReset(state);
    let mut node = lock(node);
    let ctx = PassContext {
        state,
        transport,
        limits: SchedulerLimits::from(config),
    };

    info!("{} started", mode);
    let total = match mode {
        WorkerMode::Fetching => node.tree_count(),
        WorkerMode::Checking => node.entry_count(),
        WorkerMode::Downloading => node.pending_transfer_bytes(),
        _ => 0,
    };
    state.progress.reset(total);

    let result = match mode {
        WorkerMode::Fetching => build_runtime().and_then(|rt| fetch(&mut node, &ctx, &rt)),
        WorkerMode::Checking => check(&mut node, &ctx),
        WorkerMode::Downloading => build_runtime().and_then(|rt| download(&mut node, &ctx, &rt)),
        WorkerMode::RemovingModifications => Err(WorkerError::NotImplemented("removing modifications")),
        WorkerMode::Idle => Ok(()),
    };

    if let Err(err) = result {
        error!("exception during {}: {}", mode, err);
        state.store_error(err);
    }
    info!("{} completed", mode);
}

fn build_runtime() -> Result<Runtime, WorkerError> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(WorkerError::Runtime)
}

/// Resolve `future`, giving up once a stop is requested
async fn stop_aware<T, F>(ctx: &PassContext<'_>, future: F) -> Result<T, WorkerError>
where
    F: Future<Output = Result<T, WorkerError>>,
{
    tokio::pin!(future);
    loop {
        tokio::select! {
            out = &mut future => return out,
            _ = tokio::time::sleep(ctx.limits.poll_interval) => ctx.ensure_running()?,
        }
    }
}

// Fetching

fn fetch(node: &mut TreeNode, ctx: &PassContext<'_>, rt: &Runtime) -> Result<(), WorkerError> {
    node.items.clear();
    node.pending.clear();
    node.publish();

    let data = rt.block_on(stop_aware(ctx, fetch_manifest(&node.mirrors, ctx)))?;
    ctx.ensure_running()?;
    node.items = parse_manifest(&data)?;
    node.publish();
    ctx.state.progress.add_processed(1);
    info!(
        "manifest for {} lists {} files",
        node.base_path.display(),
        node.items.len()
    );

    for dependency in &mut node.dependencies {
        fetch(dependency, ctx, rt)?;
    }
    Ok(())
}

struct ManifestSink<'a> {
    body: Vec<u8>,
    progress: &'a WorkProgress,
}

#[async_trait]
impl BodySink for ManifestSink<'_> {
    async fn on_chunk(&mut self, chunk: &[u8]) -> io::Result<ControlFlow<()>> {
        if self.progress.stop_requested() {
            return Ok(ControlFlow::Break(()));
        }
        trace!("manifest fetch progress: {} bytes", chunk.len());
        self.body.extend_from_slice(chunk);
        Ok(ControlFlow::Continue(()))
    }
}

/// Fetch the manifest, rotating through mirrors on failure
async fn fetch_manifest(mirrors: &MirrorPool, ctx: &PassContext<'_>) -> Result<Vec<u8>, WorkerError> {
    let max_fails = (mirrors.max_errors() * mirrors.len()).max(1);
    let mut fails = 0;
    loop {
        let mirror = mirrors.select().ok_or(WorkerError::NoMirrors)?;
        let request = mirror.request(MANIFEST_FILENAME);
        let mut sink = ManifestSink {
            body: Vec::new(),
            progress: &ctx.state.progress,
        };

        let failure = match ctx.transport.fetch(&request, &mut sink).await {
            Err(TransferError::Aborted) => return Err(WorkerError::ForceStopped),
            Err(err) => WorkerError::from(err),
            Ok(status) if mirror.is_http() && status != Some(200) => WorkerError::UnexpectedStatus {
                url: request.url.clone(),
                status: status.unwrap_or(0),
            },
            Ok(_) => return Ok(sink.body),
        };

        fails += 1;
        mirrors.record_error();
        error!(
            "error during fetching manifest: {} (attempt {} of {})",
            failure, fails, max_fails
        );
        if fails >= max_fails {
            return Err(WorkerError::RetriesExhausted {
                target: MANIFEST_FILENAME.to_string(),
                attempts: fails,
                last: Box::new(failure),
            });
        }
        ctx.ensure_running()?;
    }
}

// Checking

fn check(node: &mut TreeNode, ctx: &PassContext<'_>) -> Result<(), WorkerError> {
    node.pending.clear();
    let result = check_entries(&node.base_path, &node.items, &mut node.pending, ctx);
    node.publish();
    result?;
    info!(
        "{} of {} files under {} need downloading",
        node.pending.len(),
        node.items.len(),
        node.base_path.display()
    );

    for dependency in &mut node.dependencies {
        check(dependency, ctx)?;
    }
    Ok(())
}

fn check_entries(
    base_path: &Path,
    items: &[ResourceEntry],
    pending: &mut Vec<PendingDownloadItem>,
    ctx: &PassContext<'_>,
) -> Result<(), WorkerError> {
    for entry in items {
        ctx.ensure_running()?;
        if !entry_is_valid(base_path, entry)? {
            pending.push(PendingDownloadItem::new(entry.clone()));
        }
        ctx.state.progress.add_processed(1);
    }
    Ok(())
}

/// Whether the file on disk matches its manifest record
pub(crate) fn entry_is_valid(base_path: &Path, entry: &ResourceEntry) -> Result<bool, WorkerError> {
    let path = entry.local_path(base_path);
    let Ok(metadata) = fs::metadata(&path) else {
        return Ok(false);
    };
    if !metadata.is_file() || metadata.len() != entry.size {
        return Ok(false);
    }
    let hash = hasher::file_hash(&path)
        .map_err(|e| WorkerError::io(format!("hashing {}", path.display()), e))?;
    Ok(hash == entry.hash)
}

// Downloading

fn download(node: &mut TreeNode, ctx: &PassContext<'_>, rt: &Runtime) -> Result<(), WorkerError> {
    if !node.pending.is_empty() {
        let result = {
            let scheduler = DownloadScheduler::new(
                ctx.transport,
                &node.mirrors,
                &ctx.state.progress,
                &ctx.state.jobs,
                &node.base_path,
                ctx.limits,
            );
            rt.block_on(scheduler.run(&mut node.pending, &node.counters.pending_files))
        };
        node.publish();
        result?;
        info!("files under {} are up to date", node.base_path.display());
    }

    for dependency in &mut node.dependencies {
        download(dependency, ctx, rt)?;
    }
    Ok(())
}
