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

//! Resource trees and their background worker.
//!
//! A [`ResourceTree`] owns a local content directory, the mirrors serving it and
//! any dependency trees attached to it. Commands (`fetch_updates`, `check`,
//! `download`, `remove_modifications`) start a single worker thread and return
//! immediately; progress, mode and the terminal error are polled through
//! `&self` accessors, which are safe to call from any thread.

mod state;
mod worker;

pub use state::WorkerMode;

use crate::config::Config;
use crate::error::{ErrorKind, ErrorReport, TreeError};
use crate::mirror::{MirrorDescriptor, MirrorPool};
use crate::transfer::Transport;
use crate::util::lock;
use state::{NodeCounters, TreeNode, TreeState};
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

pub struct ResourceTree {
    base_path: PathBuf,
    mirrors: Arc<MirrorPool>,
    node: Arc<Mutex<TreeNode>>,
    counters: Arc<NodeCounters>,
    state: Arc<TreeState>,
    transport: Arc<dyn Transport>,
    config: Config,
    worker: Option<JoinHandle<()>>,
}

impl ResourceTree {
    /// Create a tree rooted at `base_path` with the default configuration
    pub fn new(base_path: impl Into<PathBuf>, transport: Arc<dyn Transport>) -> Self {
        Self::build(base_path.into(), transport, Config::default())
    }

    /// Create a tree with an explicit configuration, rejecting invalid limits
    pub fn with_config(
        base_path: impl Into<PathBuf>,
        transport: Arc<dyn Transport>,
        config: Config,
    ) -> Result<Self, TreeError> {
        config.validate().map_err(TreeError::InvalidConfig)?;
        Ok(Self::build(base_path.into(), transport, config))
    }

    fn build(base_path: PathBuf, transport: Arc<dyn Transport>, config: Config) -> Self {
        let mirrors = Arc::new(MirrorPool::new(config.max_mirror_errors));
        let node = TreeNode::new(base_path.clone(), Arc::clone(&mirrors));
        let counters = Arc::clone(&node.counters);
        Self {
            base_path,
            mirrors,
            node: Arc::new(Mutex::new(node)),
            counters,
            state: Arc::new(TreeState::default()),
            transport,
            config,
            worker: None,
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // Common

    pub fn add_mirror(&mut self, mirror: MirrorDescriptor) -> Result<(), TreeError> {
        self.ensure_idle()?;
        debug!("adding mirror {}", mirror.base_url());
        self.mirrors.push(mirror);
        Ok(())
    }

    /// Attach `dependency`, which from now on shares this tree's base path and worker.
    ///
    /// Only allowed before any operation has run on this tree. A dependency
    /// that is itself busy is rejected and dropped, which stops its worker.
    pub fn add_dependency(&mut self, mut dependency: ResourceTree) -> Result<(), TreeError> {
        self.ensure_idle()?;
        if self.state.last() != WorkerMode::Idle {
            return Err(TreeError::AlreadyStarted);
        }
        if dependency.is_working() {
            return Err(TreeError::AlreadyWorking);
        }
        dependency.release_worker();

        let placeholder = TreeNode::new(PathBuf::new(), Arc::clone(&dependency.mirrors));
        let mut node = mem::replace(&mut *lock(&dependency.node), placeholder);
        node.rebase(&self.base_path);

        let mut root = lock(&self.node);
        root.counters.attach(Arc::clone(&node.counters));
        root.dependencies.push(node);
        debug!("attached dependency to {}", self.base_path.display());
        Ok(())
    }

    // Fetcher

    pub fn fetch_updates(&mut self) -> Result<(), TreeError> {
        self.spawn(WorkerMode::Fetching)
    }

    pub fn fetching(&self) -> bool {
        self.current_mode() == WorkerMode::Fetching
    }

    pub fn fetched(&self) -> bool {
        !self.fetching() && self.last_completed_mode() == WorkerMode::Fetching
    }

    pub fn stop_fetching(&self) -> Result<(), TreeError> {
        self.request_stop(WorkerMode::Fetching)
    }

    // Downloader

    pub fn download(&mut self) -> Result<(), TreeError> {
        self.ensure_idle()?;
        if self.pending_download_files_count(true) == 0 {
            return Err(TreeError::NothingToDownload);
        }
        self.spawn(WorkerMode::Downloading)
    }

    pub fn downloading(&self) -> bool {
        self.current_mode() == WorkerMode::Downloading
    }

    pub fn downloaded(&self) -> bool {
        !self.downloading() && self.last_completed_mode() == WorkerMode::Downloading
    }

    pub fn stop_download(&self) -> Result<(), TreeError> {
        self.request_stop(WorkerMode::Downloading)
    }

    // Checker

    pub fn check(&mut self) -> Result<(), TreeError> {
        self.spawn(WorkerMode::Checking)
    }

    pub fn checking(&self) -> bool {
        self.current_mode() == WorkerMode::Checking
    }

    pub fn checked(&self) -> bool {
        !self.checking() && self.last_completed_mode() == WorkerMode::Checking
    }

    pub fn stop_check(&self) -> Result<(), TreeError> {
        self.request_stop(WorkerMode::Checking)
    }

    // Modifications remover

    /// Not implemented: the worker always ends with an `Internal` error.
    pub fn remove_modifications(&mut self) -> Result<(), TreeError> {
        self.spawn(WorkerMode::RemovingModifications)
    }

    pub fn removing_modifications(&self) -> bool {
        self.current_mode() == WorkerMode::RemovingModifications
    }

    pub fn removed_modifications(&self) -> bool {
        !self.removing_modifications()
            && self.last_completed_mode() == WorkerMode::RemovingModifications
    }

    pub fn stop_remove_modifications(&self) -> Result<(), TreeError> {
        self.request_stop(WorkerMode::RemovingModifications)
    }

    // Worker state

    pub fn is_working(&self) -> bool {
        self.current_mode() != WorkerMode::Idle
    }

    pub fn current_mode(&self) -> WorkerMode {
        self.state.current()
    }

    /// Mode of the last finished operation, `Idle` if none ran yet
    pub fn last_completed_mode(&self) -> WorkerMode {
        self.state.last()
    }

    pub fn has_worker_error(&self) -> bool {
        self.state.with_error(|_| ()).is_some()
    }

    pub fn worker_error_kind(&self) -> Option<ErrorKind> {
        self.state.with_error(|e| e.kind())
    }

    pub fn is_system_error(&self) -> bool {
        self.worker_error_kind() == Some(ErrorKind::Io)
    }

    pub fn is_force_stopped(&self) -> bool {
        self.worker_error_kind() == Some(ErrorKind::ForceStopped)
    }

    /// 0 without an error, -1 when the error did not come from the OS
    pub fn worker_sys_error_code(&self) -> i32 {
        self.state
            .with_error(|e| e.os_error_code().unwrap_or(-1))
            .unwrap_or(0)
    }

    /// Human-readable terminal error, empty without one
    pub fn worker_error_string(&self) -> String {
        self.state.with_error(|e| e.to_string()).unwrap_or_default()
    }

    pub fn worker_error_report(&self) -> Option<ErrorReport> {
        self.state.error_report()
    }

    // Progress

    pub fn total_work_amount(&self) -> u64 {
        self.state.progress.total()
    }

    /// Work done so far, counting bytes of in-flight downloads
    pub fn completed_work_amount(&self) -> u64 {
        if self.downloading() {
            return self.state.jobs.completed(&self.state.progress);
        }
        self.state.progress.processed()
    }

    pub fn pending_download_files_count(&self, include_dependencies: bool) -> usize {
        self.counters().pending_files(include_dependencies)
    }

    pub fn entries_count(&self, include_dependencies: bool) -> usize {
        self.counters().entries(include_dependencies)
    }

    /// Bytes still to transfer, using the compressed size of compressed entries
    pub fn pending_download_size(&self, include_dependencies: bool) -> u64 {
        self.counters().pending_bytes(include_dependencies)
    }

    /// The mirror currently serving this tree, if one was selected
    pub fn active_mirror(&self) -> Option<Arc<MirrorDescriptor>> {
        self.mirrors.current()
    }

    // Helpers

    fn counters(&self) -> &NodeCounters {
        &self.counters
    }

    fn ensure_idle(&self) -> Result<(), TreeError> {
        if self.is_working() {
            return Err(TreeError::AlreadyWorking);
        }
        Ok(())
    }

    fn request_stop(&self, mode: WorkerMode) -> Result<(), TreeError> {
        if self.current_mode() != mode {
            return Err(TreeError::NotWorking);
        }
        debug!("stop requested for {}", mode);
        self.state.progress.request_stop();
        Ok(())
    }

    /// Join a finished worker
    fn release_worker(&mut self) {
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!("worker thread of {} panicked", self.base_path.display());
            }
        }
    }

    fn spawn(&mut self, mode: WorkerMode) -> Result<(), TreeError> {
        self.ensure_idle()?;
        self.release_worker();
        self.state.begin(mode);

        let node = Arc::clone(&self.node);
        let state = Arc::clone(&self.state);
        let transport = Arc::clone(&self.transport);
        let config = self.config.clone();
        let spawned = thread::Builder::new()
            .name("resman-worker".to_string())
            .spawn(move || worker::run(mode, &node, &state, transport.as_ref(), &config));

        match spawned {
            Ok(handle) => {
                self.worker = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.state.abandon();
                Err(TreeError::Spawn(e))
            }
        }
    }
}

impl Drop for ResourceTree {
    fn drop(&mut self) {
        if self.is_working() {
            self.state.progress.request_stop();
        }
        self.release_worker();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{compress_file, DEFAULT_LEVEL};
    use crate::hasher::fnv_hash;
    use crate::manifest::MANIFEST_FILENAME;
    use crate::transfer::{BodySink, TransferEngine, TransferError, TransferRequest};
    use async_trait::async_trait;
    use std::fs;
    use std::ops::ControlFlow;
    use std::time::{Duration, Instant};
    use tempfile::{tempdir, TempDir};
    use url::Url;

    fn engine() -> Arc<dyn Transport> {
        Arc::new(TransferEngine::new(&Config::default()))
    }

    fn test_config() -> Config {
        Config {
            poll_interval_ms: 10,
            ..Config::default()
        }
    }

    fn wait_idle(tree: &ResourceTree) {
        let deadline = Instant::now() + Duration::from_secs(30);
        while tree.is_working() {
            assert!(Instant::now() < deadline, "worker did not finish");
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// A local directory served as a `file://` mirror
    struct Cdn {
        dir: TempDir,
        records: Vec<String>,
    }

    impl Cdn {
        fn new() -> Self {
            Self {
                dir: tempdir().unwrap(),
                records: Vec::new(),
            }
        }

        fn add(&mut self, path: &str, content: &[u8]) -> &mut Self {
            let target = self.dir.path().join(path);
            fs::create_dir_all(target.parent().unwrap()).unwrap();
            fs::write(&target, content).unwrap();
            self.records.push(format!(
                r#"{{"p": "{}", "s": {}, "h": {}, "c": false}}"#,
                path,
                content.len(),
                fnv_hash(content)
            ));
            self
        }

        fn add_compressed(&mut self, path: &str, content: &[u8]) -> &mut Self {
            let scratch = tempdir().unwrap();
            let plain = scratch.path().join("plain");
            fs::write(&plain, content).unwrap();
            let target = self.dir.path().join(path);
            let packed_size = compress_file(&plain, &target, DEFAULT_LEVEL).unwrap();
            let packed = fs::read(&target).unwrap();
            self.records.push(format!(
                r#"{{"p": "{}", "s": {}, "h": {}, "c": true, "cs": {}, "ch": {}}}"#,
                path,
                content.len(),
                fnv_hash(content),
                packed_size,
                fnv_hash(&packed)
            ));
            self
        }

        fn publish(&self) -> MirrorDescriptor {
            let manifest = format!("[{}]", self.records.join(","));
            fs::write(self.dir.path().join(MANIFEST_FILENAME), manifest).unwrap();
            let url = Url::from_directory_path(self.dir.path()).unwrap();
            MirrorDescriptor::new(url.to_string())
        }
    }

    fn run(tree: &mut ResourceTree, start: fn(&mut ResourceTree) -> Result<(), TreeError>) {
        start(tree).unwrap();
        wait_idle(tree);
        assert!(!tree.has_worker_error(), "{}", tree.worker_error_string());
    }

    /// Streams a never-ending body until the sink asks to stop
    struct EndlessTransport;

    #[async_trait]
    impl Transport for EndlessTransport {
        async fn fetch(
            &self,
            _request: &TransferRequest,
            sink: &mut (dyn BodySink + Send),
        ) -> Result<Option<u16>, TransferError> {
            loop {
                match sink.on_chunk(b"[").await {
                    Ok(ControlFlow::Continue(())) => tokio::time::sleep(Duration::from_millis(5)).await,
                    _ => return Err(TransferError::Aborted),
                }
            }
        }
    }

    /// Serves a fixed manifest, then streams every other resource until aborted
    struct StallingTransport {
        manifest: String,
    }

    #[async_trait]
    impl Transport for StallingTransport {
        async fn fetch(
            &self,
            request: &TransferRequest,
            sink: &mut (dyn BodySink + Send),
        ) -> Result<Option<u16>, TransferError> {
            if request.url.ends_with(MANIFEST_FILENAME) {
                sink.on_chunk(self.manifest.as_bytes()).await.unwrap();
                return Ok(Some(200));
            }
            loop {
                match sink.on_chunk(&[0u8; 64]).await {
                    Ok(ControlFlow::Continue(())) => tokio::time::sleep(Duration::from_millis(5)).await,
                    _ => return Err(TransferError::Aborted),
                }
            }
        }
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let base = tempdir().unwrap();
        let config = Config {
            poll_interval_ms: 0,
            ..Config::default()
        };
        let err = ResourceTree::with_config(base.path(), engine(), config)
            .err()
            .unwrap();
        assert!(matches!(err, TreeError::InvalidConfig(_)));
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(err.to_string().contains("poll_interval_ms"));
    }

    #[test]
    fn test_fetch_check_download_cycle() {
        let mut cdn = Cdn::new();
        let content = vec![b'a'; 100];
        cdn.add("a.txt", &content);
        let base = tempdir().unwrap();

        let mut tree = ResourceTree::with_config(base.path(), engine(), test_config()).unwrap();
        tree.add_mirror(cdn.publish()).unwrap();

        run(&mut tree, ResourceTree::fetch_updates);
        assert!(tree.fetched());
        assert_eq!(tree.entries_count(false), 1);
        assert_eq!(tree.total_work_amount(), 1);
        assert_eq!(tree.completed_work_amount(), 1);

        run(&mut tree, ResourceTree::check);
        assert!(tree.checked());
        assert!(!tree.fetched());
        assert_eq!(tree.pending_download_files_count(true), 1);
        assert_eq!(tree.pending_download_size(true), 100);

        run(&mut tree, ResourceTree::download);
        assert!(tree.downloaded());
        assert_eq!(tree.pending_download_files_count(true), 0);
        assert_eq!(tree.total_work_amount(), 100);
        assert_eq!(tree.completed_work_amount(), 100);
        assert_eq!(fs::read(base.path().join("a.txt")).unwrap(), content);
        assert!(tree.active_mirror().is_some());

        run(&mut tree, ResourceTree::check);
        assert_eq!(tree.pending_download_files_count(true), 0);
    }

    #[test]
    fn test_modified_and_intact_files() {
        let mut cdn = Cdn::new();
        cdn.add("data/intact.bin", b"unchanged contents");
        cdn.add("data/modified.bin", b"original contents!");
        let base = tempdir().unwrap();
        fs::create_dir_all(base.path().join("data")).unwrap();
        fs::write(base.path().join("data/intact.bin"), b"unchanged contents").unwrap();
        fs::write(base.path().join("data/modified.bin"), b"tampered contents!").unwrap();

        let mut tree = ResourceTree::with_config(base.path(), engine(), test_config()).unwrap();
        tree.add_mirror(cdn.publish()).unwrap();
        run(&mut tree, ResourceTree::fetch_updates);
        run(&mut tree, ResourceTree::check);
        assert_eq!(tree.pending_download_files_count(false), 1);
        assert_eq!(tree.total_work_amount(), 2);

        run(&mut tree, ResourceTree::download);
        assert_eq!(
            fs::read(base.path().join("data/modified.bin")).unwrap(),
            b"original contents!"
        );
    }

    #[test]
    fn test_compressed_entry_end_to_end() {
        let mut cdn = Cdn::new();
        let content: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        cdn.add_compressed("models/car.dff", &content);
        let base = tempdir().unwrap();

        let mut tree = ResourceTree::with_config(base.path(), engine(), test_config()).unwrap();
        tree.add_mirror(cdn.publish()).unwrap();
        run(&mut tree, ResourceTree::fetch_updates);
        run(&mut tree, ResourceTree::check);
        assert!(tree.pending_download_size(false) < content.len() as u64);

        run(&mut tree, ResourceTree::download);
        let target = base.path().join("models/car.dff");
        assert_eq!(fs::read(&target).unwrap(), content);
        assert!(!base.path().join("models/car.dff.zst").exists());

        run(&mut tree, ResourceTree::check);
        assert_eq!(tree.pending_download_files_count(false), 0);
    }

    #[test]
    fn test_dependencies_share_base_path_and_worker() {
        let mut main_cdn = Cdn::new();
        main_cdn.add("main.scm", b"main script");
        let mut mod_cdn = Cdn::new();
        mod_cdn.add("cleo/mod.cs", b"mod script").add("cleo/mod.ini", b"[mod]");
        let base = tempdir().unwrap();

        let mut dependency = ResourceTree::with_config("/unused", engine(), test_config()).unwrap();
        dependency.add_mirror(mod_cdn.publish()).unwrap();
        let mut tree = ResourceTree::with_config(base.path(), engine(), test_config()).unwrap();
        tree.add_mirror(main_cdn.publish()).unwrap();
        tree.add_dependency(dependency).unwrap();

        run(&mut tree, ResourceTree::fetch_updates);
        assert_eq!(tree.total_work_amount(), 2);
        assert_eq!(tree.entries_count(false), 1);
        assert_eq!(tree.entries_count(true), 3);

        run(&mut tree, ResourceTree::check);
        assert_eq!(tree.total_work_amount(), 3);
        assert_eq!(tree.pending_download_files_count(false), 1);
        assert_eq!(tree.pending_download_files_count(true), 3);

        run(&mut tree, ResourceTree::download);
        assert_eq!(tree.pending_download_files_count(true), 0);
        assert_eq!(fs::read(base.path().join("cleo/mod.cs")).unwrap(), b"mod script");
        assert_eq!(fs::read(base.path().join("main.scm")).unwrap(), b"main script");
    }

    #[test]
    fn test_command_rejections() {
        let base = tempdir().unwrap();
        let mut tree = ResourceTree::with_config(base.path(), engine(), test_config()).unwrap();

        assert!(matches!(tree.download(), Err(TreeError::NothingToDownload)));
        assert!(matches!(tree.stop_fetching(), Err(TreeError::NotWorking)));
        assert!(matches!(tree.stop_download(), Err(TreeError::NotWorking)));
        assert!(matches!(tree.stop_check(), Err(TreeError::NotWorking)));
        assert!(matches!(tree.stop_remove_modifications(), Err(TreeError::NotWorking)));

        run(&mut tree, ResourceTree::check);
        assert!(tree.checked());
        let dependency = ResourceTree::new(base.path(), engine());
        assert!(matches!(tree.add_dependency(dependency), Err(TreeError::AlreadyStarted)));
    }

    #[test]
    fn test_stop_while_fetching() {
        let base = tempdir().unwrap();
        let transport: Arc<dyn Transport> = Arc::new(EndlessTransport);
        let mut tree = ResourceTree::with_config(base.path(), transport, test_config()).unwrap();
        tree.add_mirror(MirrorDescriptor::new("https://cdn.example.com/"))
            .unwrap();

        tree.fetch_updates().unwrap();
        assert!(tree.fetching());
        assert!(matches!(tree.fetch_updates(), Err(TreeError::AlreadyWorking)));
        assert!(matches!(tree.check(), Err(TreeError::AlreadyWorking)));
        assert!(matches!(
            tree.add_mirror(MirrorDescriptor::new("https://backup.example.com/")),
            Err(TreeError::AlreadyWorking)
        ));
        assert!(matches!(tree.stop_check(), Err(TreeError::NotWorking)));

        tree.stop_fetching().unwrap();
        wait_idle(&tree);
        assert!(tree.fetched());
        assert!(tree.is_force_stopped());
        assert_eq!(tree.worker_error_kind(), Some(ErrorKind::ForceStopped));
        assert_eq!(tree.worker_sys_error_code(), -1);
    }

    #[test]
    fn test_download_progress_counts_live_bytes_and_stops() {
        let base = tempdir().unwrap();
        let transport: Arc<dyn Transport> = Arc::new(StallingTransport {
            manifest: r#"[{"p": "big.img", "s": 1000000, "h": 1, "c": false}]"#.to_string(),
        });
        let mut tree = ResourceTree::with_config(base.path(), transport, test_config()).unwrap();
        tree.add_mirror(MirrorDescriptor::new("https://cdn.example.com/"))
            .unwrap();
        run(&mut tree, ResourceTree::fetch_updates);
        run(&mut tree, ResourceTree::check);
        assert_eq!(tree.pending_download_size(false), 1_000_000);

        tree.download().unwrap();
        let deadline = Instant::now() + Duration::from_secs(30);
        while tree.completed_work_amount() == 0 {
            assert!(Instant::now() < deadline, "no bytes were reported");
            thread::sleep(Duration::from_millis(5));
        }
        assert!(tree.downloading());
        assert_eq!(tree.state.progress.processed(), 0);
        let live = tree.completed_work_amount();

        tree.stop_download().unwrap();
        wait_idle(&tree);
        assert!(tree.downloaded());
        assert!(tree.is_force_stopped());
        assert!(tree.completed_work_amount() >= live);
        assert_eq!(tree.pending_download_files_count(false), 1);
    }

    #[test]
    fn test_completed_work_never_decreases_while_downloading() {
        let mut cdn = Cdn::new();
        let content = vec![7u8; 32 * 1024];
        for i in 0..200 {
            cdn.add(&format!("textures/tex{i}.txd"), &content);
        }
        let base = tempdir().unwrap();
        let mut tree = ResourceTree::with_config(base.path(), engine(), test_config()).unwrap();
        tree.add_mirror(cdn.publish()).unwrap();
        run(&mut tree, ResourceTree::fetch_updates);
        run(&mut tree, ResourceTree::check);

        tree.download().unwrap();
        let tree = &tree;
        thread::scope(|scope| {
            let reader = scope.spawn(|| {
                let mut last = 0;
                loop {
                    let working = tree.is_working();
                    let now = tree.completed_work_amount();
                    assert!(now >= last, "completed work went from {last} to {now}");
                    last = now;
                    if !working {
                        break;
                    }
                }
            });
            wait_idle(tree);
            reader.join().unwrap();
        });

        assert!(!tree.has_worker_error(), "{}", tree.worker_error_string());
        assert_eq!(tree.completed_work_amount(), tree.total_work_amount());
        assert_eq!(tree.total_work_amount(), 200 * 32 * 1024);
    }

    #[test]
    fn test_stop_while_checking() {
        let mut cdn = Cdn::new();
        cdn.add("a.txt", b"a").add("b.txt", b"b");
        let base = tempdir().unwrap();
        let mut tree = ResourceTree::with_config(base.path(), engine(), test_config()).unwrap();
        tree.add_mirror(cdn.publish()).unwrap();
        run(&mut tree, ResourceTree::fetch_updates);

        // Hold the tree data so the worker cannot start checking before the stop lands.
        let node = Arc::clone(&tree.node);
        let guard = node.lock().unwrap();
        tree.check().unwrap();
        assert!(tree.checking());
        assert!(matches!(tree.stop_download(), Err(TreeError::NotWorking)));
        tree.stop_check().unwrap();
        drop(guard);

        wait_idle(&tree);
        assert!(tree.checked());
        assert!(tree.is_force_stopped());
        assert_eq!(tree.completed_work_amount(), 0);
    }

    #[test]
    fn test_drop_stops_running_worker() {
        let base = tempdir().unwrap();
        let transport: Arc<dyn Transport> = Arc::new(EndlessTransport);
        let mut tree = ResourceTree::with_config(base.path(), transport, test_config()).unwrap();
        tree.add_mirror(MirrorDescriptor::new("https://cdn.example.com/"))
            .unwrap();
        tree.fetch_updates().unwrap();
        drop(tree);
    }

    #[test]
    fn test_unreachable_manifest_is_fatal() {
        let cdn = tempdir().unwrap();
        let base = tempdir().unwrap();
        let config = Config {
            max_mirror_errors: 2,
            ..test_config()
        };
        let mut tree = ResourceTree::with_config(base.path(), engine(), config).unwrap();
        let url = Url::from_directory_path(cdn.path()).unwrap();
        tree.add_mirror(MirrorDescriptor::new(url.to_string())).unwrap();

        tree.fetch_updates().unwrap();
        wait_idle(&tree);
        assert!(tree.fetched());
        assert!(tree.has_worker_error());
        assert_eq!(tree.worker_error_kind(), Some(ErrorKind::TransportFailure));
        assert!(tree.worker_error_string().contains("2 failed attempts"));
        assert_eq!(tree.entries_count(true), 0);
    }

    #[test]
    fn test_fetch_without_mirrors() {
        let base = tempdir().unwrap();
        let mut tree = ResourceTree::with_config(base.path(), engine(), test_config()).unwrap();
        tree.fetch_updates().unwrap();
        wait_idle(&tree);
        assert_eq!(tree.worker_error_kind(), Some(ErrorKind::Internal));
    }

    #[test]
    fn test_remove_modifications_always_fails() {
        let base = tempdir().unwrap();
        let mut tree = ResourceTree::with_config(base.path(), engine(), test_config()).unwrap();
        tree.remove_modifications().unwrap();
        wait_idle(&tree);
        assert!(tree.removed_modifications());
        assert!(!tree.removing_modifications());
        assert_eq!(tree.worker_error_kind(), Some(ErrorKind::Internal));
        assert!(tree.worker_error_string().contains("not implemented"));

        let report = tree.worker_error_report().unwrap();
        assert_eq!(report.os_code, None);
    }

    #[test]
    fn test_new_operation_clears_previous_error() {
        let base = tempdir().unwrap();
        let mut tree = ResourceTree::with_config(base.path(), engine(), test_config()).unwrap();
        tree.remove_modifications().unwrap();
        wait_idle(&tree);
        assert!(tree.has_worker_error());

        run(&mut tree, ResourceTree::check);
        assert_eq!(tree.worker_error_string(), "");
        assert_eq!(tree.worker_sys_error_code(), 0);
    }
}
