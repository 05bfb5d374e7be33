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

//! Progress counters shared between a worker and the threads polling it.

use crate::util::lock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Work totals and the cooperative stop flag of one operation
#[derive(Debug, Default)]
pub struct WorkProgress {
    total: AtomicU64,
    processed: AtomicU64,
    force_stop: AtomicBool,
}

impl WorkProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new operation with `total` units of work
    pub fn reset(&self, total: u64) {
        self.total.store(total, Ordering::SeqCst);
        self.processed.store(0, Ordering::SeqCst);
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn add_processed(&self, amount: u64) {
        self.processed.fetch_add(amount, Ordering::Relaxed);
    }

    pub fn request_stop(&self) {
        self.force_stop.store(true, Ordering::SeqCst);
    }

    pub fn clear_stop(&self) {
        self.force_stop.store(false, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.force_stop.load(Ordering::SeqCst)
    }
}

/// Live state of one in-flight download job.
///
/// `credited` bytes of the same file were already counted by earlier failed
/// attempts; only bytes past that mark count as new progress.
#[derive(Debug)]
pub struct JobProgress {
    relative_path: String,
    credited: u64,
    downloaded: AtomicU64,
    abort: AtomicBool,
}

impl JobProgress {
    pub fn new(relative_path: impl Into<String>) -> Self {
        Self::resumed(relative_path, 0)
    }

    pub fn resumed(relative_path: impl Into<String>, credited: u64) -> Self {
        Self {
            relative_path: relative_path.into(),
            credited,
            downloaded: AtomicU64::new(0),
            abort: AtomicBool::new(false),
        }
    }

    pub fn relative_path(&self) -> &str {
        &self.relative_path
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    pub fn add_downloaded(&self, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Downloaded bytes not yet counted by a previous attempt
    pub fn uncounted(&self) -> u64 {
        self.downloaded().saturating_sub(self.credited)
    }

    pub fn abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }
}

/// Registry of in-flight jobs, readable from any thread
#[derive(Debug, Default)]
pub struct ActiveJobs {
    jobs: Mutex<Vec<Arc<JobProgress>>>,
}

impl ActiveJobs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, job: Arc<JobProgress>) {
        lock(&self.jobs).push(job);
    }

    /// Retire `job`, moving its uncounted bytes into `progress`.
    ///
    /// Removal and transfer happen under the registry lock, so
    /// [`ActiveJobs::completed`] never sees the bytes twice or not at all.
    /// Returns the bytes moved.
    pub fn finish(&self, job: &Arc<JobProgress>, progress: &WorkProgress) -> u64 {
        let mut jobs = lock(&self.jobs);
        jobs.retain(|j| !Arc::ptr_eq(j, job));
        let bytes = job.uncounted();
        progress.add_processed(bytes);
        bytes
    }

    /// Retire every job, keeping their bytes in `progress`
    pub fn finish_all(&self, progress: &WorkProgress) {
        let mut jobs = lock(&self.jobs);
        for job in jobs.drain(..) {
            progress.add_processed(job.uncounted());
        }
    }

    /// Processed work plus the bytes of every in-flight job, read as one snapshot
    pub fn completed(&self, progress: &WorkProgress) -> u64 {
        let jobs = lock(&self.jobs);
        progress.processed() + jobs.iter().map(|j| j.uncounted()).sum::<u64>()
    }

    pub fn len(&self) -> usize {
        lock(&self.jobs).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tell every in-flight job to abort at its next chunk
    pub fn abort_all(&self) {
        for job in lock(&self.jobs).iter() {
            job.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_keeps_stop_flag() {
        let progress = WorkProgress::new();
        progress.reset(10);
        progress.add_processed(4);
        progress.request_stop();
        progress.reset(3);
        assert_eq!(progress.total(), 3);
        assert_eq!(progress.processed(), 0);
        assert!(progress.stop_requested());
        progress.clear_stop();
        assert!(!progress.stop_requested());
    }

    #[test]
    fn test_active_jobs_accounting() {
        let progress = WorkProgress::new();
        let jobs = ActiveJobs::new();
        let a = Arc::new(JobProgress::new("a"));
        let b = Arc::new(JobProgress::new("b"));
        jobs.insert(a.clone());
        jobs.insert(b.clone());
        a.add_downloaded(10);
        b.add_downloaded(5);
        assert_eq!(jobs.completed(&progress), 15);

        jobs.abort_all();
        assert!(a.is_aborted() && b.is_aborted());

        assert_eq!(jobs.finish(&a, &progress), 10);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs.completed(&progress), 15);

        jobs.finish_all(&progress);
        assert!(jobs.is_empty());
        assert_eq!(progress.processed(), 15);
    }

    #[test]
    fn test_resumed_job_counts_only_new_bytes() {
        let progress = WorkProgress::new();
        let jobs = ActiveJobs::new();

        let first = Arc::new(JobProgress::new("a"));
        jobs.insert(first.clone());
        first.add_downloaded(40);
        let credited = jobs.finish(&first, &progress);
        assert_eq!(credited, 40);

        let retry = Arc::new(JobProgress::resumed("a", credited));
        jobs.insert(retry.clone());
        retry.add_downloaded(30);
        assert_eq!(jobs.completed(&progress), 40);
        retry.add_downloaded(70);
        assert_eq!(jobs.completed(&progress), 100);

        jobs.finish(&retry, &progress);
        assert_eq!(progress.processed(), 100);
    }
}
