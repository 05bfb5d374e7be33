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

//! Bounded-parallel download scheduler.
//!
//! Pending items are downloaded in waves of at most `parallel_jobs` transfers,
//! taken from the front of the queue. All transfers of a wave are polled on the
//! calling thread; completions are classified as they arrive. Failed items stay
//! queued and are retried by a later wave until they hit `max_item_errors`.

use crate::codec::{self, COMPRESSED_SUFFIX};
use crate::config::Config;
use crate::error::WorkerError;
use crate::manifest::ResourceEntry;
use crate::mirror::{MirrorDescriptor, MirrorPool};
use crate::progress::{ActiveJobs, JobProgress, WorkProgress};
use crate::transfer::{BodySink, TransferError, Transport};
use futures::stream::{FuturesUnordered, StreamExt};
use async_trait::async_trait;
use std::fs;
use std::io;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, error, info, warn};

/// Maximum concurrent transfers
pub const PARALLEL_JOBS: usize = 5;
/// Failures of a single item before the whole download is abandoned
pub const MAX_ITEM_ERRORS: usize = 15;
/// Upper bound on how long a stop request may go unnoticed by the event loop
pub const POLL_INTERVAL: Duration = Duration::from_millis(300);

/// An entry queued for (re)download
#[derive(Debug, Clone)]
pub struct PendingDownloadItem {
    pub entry: ResourceEntry,
    pub errors: usize,
    /// Bytes already counted as progress by failed or aborted attempts
    pub credited: u64,
}

impl PendingDownloadItem {
    pub fn new(entry: ResourceEntry) -> Self {
        Self {
            entry,
            errors: 0,
            credited: 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerLimits {
    pub parallel_jobs: usize,
    pub max_item_errors: usize,
    pub poll_interval: Duration,
}

impl Default for SchedulerLimits {
    fn default() -> Self {
        Self {
            parallel_jobs: PARALLEL_JOBS,
            max_item_errors: MAX_ITEM_ERRORS,
            poll_interval: POLL_INTERVAL,
        }
    }
}

impl From<&Config> for SchedulerLimits {
    fn from(config: &Config) -> Self {
        Self {
            parallel_jobs: config.parallel_jobs,
            max_item_errors: config.max_item_errors,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        }
    }
}

/// Path of the compressed artifact written next to `target`
pub fn compressed_path(target: &Path) -> PathBuf {
    let mut path = target.as_os_str().to_owned();
    path.push(COMPRESSED_SUFFIX);
    PathBuf::from(path)
}

/// Output side of one job: the file being written plus its live counters
struct JobSink {
    out: BufWriter<File>,
    job: Arc<JobProgress>,
}

impl JobSink {
    async fn finish(mut self) -> io::Result<()> {
        self.out.flush().await
    }
}

#[async_trait]
impl BodySink for JobSink {
    async fn on_chunk(&mut self, chunk: &[u8]) -> io::Result<ControlFlow<()>> {
        if self.job.is_aborted() {
            return Ok(ControlFlow::Break(()));
        }
        self.out.write_all(chunk).await?;
        self.job.add_downloaded(chunk.len() as u64);
        Ok(ControlFlow::Continue(()))
    }
}

struct Completion {
    job: Arc<JobProgress>,
    mirror: Arc<MirrorDescriptor>,
    url: String,
    outcome: Result<Option<u16>, TransferError>,
}

/// Empties the job registry however a pass ends, keeping the bytes already received
struct JobsGuard<'a> {
    jobs: &'a ActiveJobs,
    progress: &'a WorkProgress,
}

impl Drop for JobsGuard<'_> {
    fn drop(&mut self) {
        self.jobs.finish_all(self.progress);
    }
}

pub struct DownloadScheduler<'a> {
    transport: &'a dyn Transport,
    mirrors: &'a MirrorPool,
    progress: &'a WorkProgress,
    jobs: &'a ActiveJobs,
    base_path: &'a Path,
    limits: SchedulerLimits,
}

impl<'a> DownloadScheduler<'a> {
    pub fn new(
        transport: &'a dyn Transport,
        mirrors: &'a MirrorPool,
        progress: &'a WorkProgress,
        jobs: &'a ActiveJobs,
        base_path: &'a Path,
        limits: SchedulerLimits,
    ) -> Self {
        Self {
            transport,
            mirrors,
            progress,
            jobs,
            base_path,
            limits,
        }
    }

    /// Drain `pending`, keeping `pending_files` in sync with its length
    pub async fn run(
        &self,
        pending: &mut Vec<PendingDownloadItem>,
        pending_files: &AtomicUsize,
    ) -> Result<(), WorkerError> {
        let _guard = JobsGuard {
            jobs: self.jobs,
            progress: self.progress,
        };
        for item in pending.iter_mut() {
            item.credited = 0;
        }
        while !pending.is_empty() {
            if self.progress.stop_requested() {
                return Err(WorkerError::ForceStopped);
            }
            self.run_wave(pending, pending_files).await?;
        }
        if self.progress.stop_requested() {
            return Err(WorkerError::ForceStopped);
        }
        Ok(())
    }

    async fn run_wave(
        &self,
        pending: &mut Vec<PendingDownloadItem>,
        pending_files: &AtomicUsize,
    ) -> Result<(), WorkerError> {
        let window: Vec<(ResourceEntry, u64)> = pending
            .iter()
            .take(self.limits.parallel_jobs.max(1))
            .map(|item| (item.entry.clone(), item.credited))
            .collect();

        let mut in_flight = FuturesUnordered::new();
        for (entry, credited) in &window {
            let mirror = self.mirrors.select().ok_or(WorkerError::NoMirrors)?;
            let sink = self.open_job(entry, *credited).await?;
            let job = Arc::clone(&sink.job);
            let request = mirror.request(&entry.relative_path);
            let transport = self.transport;
            self.jobs.insert(Arc::clone(&job));
            debug!("queued {} from {}", entry.relative_path, request.url);

            in_flight.push(async move {
                let mut sink = sink;
                let mut outcome = transport.fetch(&request, &mut sink).await;
                if let Err(source) = sink.finish().await {
                    if outcome.is_ok() {
                        outcome = Err(TransferError::Io {
                            url: request.url.clone(),
                            source,
                        });
                    }
                }
                Completion {
                    job,
                    mirror,
                    url: request.url,
                    outcome,
                }
            });
        }

        loop {
            if self.progress.stop_requested() {
                self.jobs.abort_all();
            }
            tokio::select! {
                done = in_flight.next() => match done {
                    Some(completion) => self.complete(completion, pending, pending_files)?,
                    None => break,
                },
                _ = tokio::time::sleep(self.limits.poll_interval) => {}
            }
        }
        Ok(())
    }

    async fn open_job(&self, entry: &ResourceEntry, credited: u64) -> Result<JobSink, WorkerError> {
        let mut target = entry.local_path(self.base_path);
        if entry.compressed {
            target = compressed_path(&target);
        }
        let context = |action: &str| format!("{} {}", action, target.display());

        match tokio::fs::remove_file(&target).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(WorkerError::io(context("removing"), e)),
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| WorkerError::io(context("creating parent of"), e))?;
        }
        let file = File::create(&target)
            .await
            .map_err(|e| WorkerError::io(context("creating"), e))?;

        Ok(JobSink {
            out: BufWriter::new(file),
            job: Arc::new(JobProgress::resumed(entry.relative_path.clone(), credited)),
        })
    }

    fn complete(
        &self,
        completion: Completion,
        pending: &mut Vec<PendingDownloadItem>,
        pending_files: &AtomicUsize,
    ) -> Result<(), WorkerError> {
        let Completion {
            job,
            mirror,
            url,
            outcome,
        } = completion;

        let Some(index) = pending
            .iter()
            .position(|item| item.entry.relative_path == job.relative_path())
        else {
            warn!("finished job for {} has no pending item", job.relative_path());
            self.jobs.finish(&job, self.progress);
            return Ok(());
        };

        let failure = match outcome {
            Err(TransferError::Aborted) => {
                debug!("transfer of {} aborted", job.relative_path());
                pending[index].credited += self.jobs.finish(&job, self.progress);
                return Ok(());
            }
            Err(err) => Some(WorkerError::from(err)),
            Ok(status) if mirror.is_http() && status != Some(200) => {
                Some(WorkerError::UnexpectedStatus {
                    url,
                    status: status.unwrap_or(0),
                })
            }
            Ok(_) => self.finalize(&pending[index].entry).err(),
        };

        match failure {
            None => {
                self.jobs.finish(&job, self.progress);
                let item = pending.remove(index);
                pending_files.store(pending.len(), Ordering::SeqCst);
                info!("file {} is downloaded successfully", item.entry.relative_path);
                Ok(())
            }
            Some(err) => {
                let item = &mut pending[index];
                item.credited += self.jobs.finish(&job, self.progress);
                self.mirrors.record_error();
                item.errors += 1;
                error!(
                    "error during downloading files: {} (file: {}, attempt {})",
                    err, item.entry.relative_path, item.errors
                );
                if item.errors >= self.limits.max_item_errors {
                    return Err(WorkerError::RetriesExhausted {
                        target: item.entry.relative_path.clone(),
                        attempts: item.errors,
                        last: Box::new(err),
                    });
                }
                Ok(())
            }
        }
    }

    /// Unpack a compressed download in place
    fn finalize(&self, entry: &ResourceEntry) -> Result<(), WorkerError> {
        if !entry.compressed {
            return Ok(());
        }
        let target = entry.local_path(self.base_path);
        let packed = compressed_path(&target);

        info!("file {} is compressed, decompressing...", entry.relative_path);
        if let Err(err) = codec::decompress_file(&packed, &target) {
            if target.exists() {
                if let Err(e) = fs::remove_file(&target) {
                    warn!("could not remove partial file {}: {}", target.display(), e);
                }
            }
            return Err(err.into());
        }
        fs::remove_file(&packed)
            .map_err(|e| WorkerError::io(format!("removing {}", packed.display()), e))?;
        info!("file {} is decompressed successfully", entry.relative_path);
        Ok(())
    }
}
