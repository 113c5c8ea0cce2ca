//! The worker's dependency cache: downloads parent bundle contents from
//! the server, caches them on disk under a byte ceiling, and coordinates
//! with other workers sharing the same cache directory so that each
//! dependency is downloaded by at most one worker at a time.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use longshore_bundle::fmt::size_str;
use longshore_bundle::fsutil::remove_path;
use longshore_bundle::{unix_now, DependencyKey};

use crate::committer::JsonStateCommitter;
use crate::fsutil::un_tar_gz_directory;
use crate::lock::FileLease;
use crate::service::{BundleService, TargetKind};
use crate::tasks::TaskRegistry;

pub const DEPENDENCIES_DIR_NAME: &str = "dependencies";
/// FAILED entries stay on record this long so dependents fail fast, then
/// get pruned so a later run can retry the download.
pub const DEPENDENCY_FAILURE_COOLDOWN: u64 = 10;
/// The serialized dependency list is reported at checkin and stored in a
/// bounded column server-side.
pub const MAX_SERIALIZED_LEN: usize = 60_000;
/// A downloader that hasn't streamed a byte for this long loses its claim.
pub const DEPENDENCY_DOWNLOAD_TIMEOUT: u64 = 5 * 60;
/// Claims survive much longer when the cache is shared over NFS, where a
/// healthy worker can still stall for minutes.
pub const DEPENDENCY_DOWNLOAD_TIMEOUT_SHARED: u64 = 60 * 60;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DependencyStage {
    Downloading,
    Ready,
    Failed,
}

/// One cache entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DependencyState {
    pub stage: DependencyStage,
    /// Identity of the worker currently downloading, if any.
    pub downloading_by: Option<String>,
    pub key: DependencyKey,
    /// Cache-relative path holding the contents.
    pub path: String,
    pub size_bytes: u64,
    /// Child bundle uuids using this entry; a referenced entry is never
    /// evicted.
    pub dependents: BTreeSet<String>,
    pub last_used: u64,
    /// Download heartbeat; staleness lets another worker take over.
    pub last_downloading: u64,
    pub message: String,
    pub killed: bool,
}

/// The durable shape of the cache, exactly what the state file holds.
#[serde_as]
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CacheState {
    #[serde_as(as = "BTreeMap<serde_with::DisplayFromStr, _>")]
    pub dependencies: BTreeMap<DependencyKey, DependencyState>,
    /// Every cache-relative path in use, to keep assignments collision
    /// free.
    pub paths: BTreeSet<String>,
}

/// Shared slot between a download task and the transition loop.
pub struct DownloadStatus {
    pub size_bytes: AtomicU64,
    pub last_downloading: AtomicU64,
    pub message: Mutex<String>,
    pub killed: AtomicBool,
    pub success: AtomicBool,
    pub failure_message: Mutex<Option<String>>,
}

impl DownloadStatus {
    fn new() -> Arc<Self> {
        Arc::new(DownloadStatus {
            size_bytes: AtomicU64::new(0),
            last_downloading: AtomicU64::new(unix_now()),
            message: Mutex::new("Starting download".to_string()),
            killed: AtomicBool::new(false),
            success: AtomicBool::new(false),
            failure_message: Mutex::new(None),
        })
    }
}

pub struct DependencyManager {
    /// Identity used for download claims; unique per manager instance.
    id: String,
    committer: JsonStateCommitter,
    service: Arc<dyn BundleService>,
    pub dependencies_dir: PathBuf,
    max_cache_size_bytes: u64,
    max_retries: u32,
    download_timeout: u64,
    /// Cross-process lock, present when the cache directory is shared.
    lease: Option<FileLease>,
    state: Mutex<CacheState>,
    downloads: TaskRegistry<DependencyKey, DownloadStatus>,
    stop: Arc<AtomicBool>,
    main_task: Mutex<Option<JoinHandle<()>>>,
}

impl DependencyManager {
    pub fn new(
        commit_file: impl Into<PathBuf>,
        service: Arc<dyn BundleService>,
        worker_dir: &Path,
        max_cache_size_bytes: u64,
        max_retries: u32,
        shared_cache: bool,
    ) -> io::Result<Self> {
        let dependencies_dir = worker_dir.join(DEPENDENCIES_DIR_NAME);
        std::fs::create_dir_all(&dependencies_dir)?;

        let lease = if shared_cache {
            Some(FileLease::new(worker_dir.join("locks_claims/state.lock")))
        } else {
            None
        };

        let manager = DependencyManager {
            id: format!(
                "worker-dependency-manager-{}-{:x}",
                std::process::id(),
                unix_now()
            ),
            committer: JsonStateCommitter::new(commit_file),
            service,
            dependencies_dir,
            max_cache_size_bytes,
            max_retries,
            download_timeout: if shared_cache {
                DEPENDENCY_DOWNLOAD_TIMEOUT_SHARED
            } else {
                DEPENDENCY_DOWNLOAD_TIMEOUT
            },
            lease,
            state: Mutex::new(CacheState::default()),
            downloads: TaskRegistry::new(),
            stop: Arc::new(AtomicBool::new(false)),
            main_task: Mutex::new(None),
        };
        manager.sync_state()?;
        info!(id=%manager.id, "initialized dependency manager");
        Ok(manager)
    }

    /// Runs `f` under the state lock and commits the result. On a shared
    /// cache the state file is authoritative: it is re-read under the file
    /// lease so concurrent workers' writes are observed.
    fn with_state<R>(&self, f: impl FnOnce(&mut CacheState) -> R) -> io::Result<R> {
        let mut state = self.state.lock();
        let _lease = match &self.lease {
            Some(lease) => {
                let guard = lease.acquire()?;
                *state = self.committer.load_or_default()?;
                Some(guard)
            }
            None => None,
        };
        let result = f(&mut state);
        self.committer.commit(&*state)?;
        Ok(result)
    }

    /// Reconciles the committed state with what is actually on disk:
    /// entries whose contents vanished are dropped, directories nothing
    /// tracks are deleted.
    fn sync_state(&self) -> io::Result<()> {
        let on_disk: BTreeSet<String> = std::fs::read_dir(&self.dependencies_dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();

        let mut state: CacheState = if self.committer.state_file_exists() {
            // The state file exists, so its contents matter: this method
            // prunes, and pruning from a half-read state would delete live
            // cache entries. Unreadable means fatal.
            self.committer.load()?
        } else {
            info!(path=?self.committer.path(), "no cache state file yet, creating one");
            CacheState::default()
        };

        let tracked: BTreeSet<String> = state
            .dependencies
            .values()
            .map(|dep| dep.path.clone())
            .collect();
        let live: BTreeSet<String> = state
            .paths
            .intersection(&tracked)
            .cloned()
            .collect::<BTreeSet<_>>()
            .intersection(&on_disk)
            .cloned()
            .collect();

        state.dependencies.retain(|key, dep| {
            let keep = live.contains(&dep.path);
            if !keep {
                info!(key=%key, path=%dep.path, "dropping cache entry without contents on disk");
            }
            keep
        });
        for orphan in on_disk.difference(&live) {
            let full = self.dependencies_dir.join(orphan);
            info!(path=?full, "removing orphaned cache directory");
            remove_path(&full)?;
        }
        state.paths = live;

        *self.state.lock() = state.clone();
        self.committer.commit(&state)?;
        Ok(())
    }

    /// Starts the transition/cleanup loop.
    pub fn start(self: &Arc<Self>) {
        info!("starting dependency manager");
        let manager = self.clone();
        let task = tokio::spawn(async move {
            while !manager.stop.load(Ordering::SeqCst) {
                if let Err(e) = manager.transition_dependencies() {
                    error!(err=%e, "error transitioning dependencies");
                }
                if let Err(e) = manager.cleanup() {
                    error!(err=%e, "error cleaning up dependency cache");
                }
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        });
        *self.main_task.lock() = Some(task);
    }

    pub async fn stop(&self) {
        info!("stopping dependency manager");
        self.stop.store(true, Ordering::SeqCst);
        self.downloads.abort_all();
        let task = self.main_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        info!("stopped dependency manager");
    }

    /// Identity used for download claims.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn has(&self, key: &DependencyKey) -> io::Result<bool> {
        self.with_state(|state| state.dependencies.contains_key(key))
    }

    pub fn all_dependencies(&self) -> io::Result<Vec<DependencyKey>> {
        self.with_state(|state| state.dependencies.keys().cloned().collect())
    }

    /// Requests the dependency for the run `child_uuid`, registering it as
    /// a dependent. Absent entries enter DOWNLOADING with a fresh path.
    pub fn get(&self, child_uuid: &str, key: &DependencyKey) -> io::Result<DependencyState> {
        self.with_state(|state| {
            let now = unix_now();
            if !state.dependencies.contains_key(key) {
                let path = Self::assign_path(&mut state.paths, key);
                state.dependencies.insert(
                    key.clone(),
                    DependencyState {
                        stage: DependencyStage::Downloading,
                        downloading_by: None,
                        key: key.clone(),
                        path,
                        size_bytes: 0,
                        dependents: BTreeSet::from([child_uuid.to_string()]),
                        last_used: now,
                        last_downloading: now,
                        message: "Starting download".to_string(),
                        killed: false,
                    },
                );
            }
            let entry = state.dependencies.get_mut(key).expect("just inserted");
            if entry.stage != DependencyStage::Failed {
                entry.dependents.insert(child_uuid.to_string());
                entry.last_used = now;
            }
            entry.clone()
        })
    }

    /// Drops `child_uuid` from the entry's dependents; an unreferenced
    /// entry still downloading is killed.
    pub fn release(&self, child_uuid: &str, key: &DependencyKey) -> io::Result<()> {
        self.with_state(|state| {
            if let Some(entry) = state.dependencies.get_mut(key) {
                entry.dependents.remove(child_uuid);
                if entry.dependents.is_empty() && entry.stage == DependencyStage::Downloading {
                    entry.killed = true;
                }
            }
        })
    }

    /// Derives a filesystem-safe cache path from the key, bumping with `_`
    /// until unique (`a/b_c` and `a_b/c` would otherwise collide).
    fn assign_path(paths: &mut BTreeSet<String>, key: &DependencyKey) -> String {
        let mut path = if key.parent_path.is_empty() {
            key.parent_uuid.clone()
        } else {
            format!("{}/{}", key.parent_uuid, key.parent_path)
        }
        .replace(std::path::MAIN_SEPARATOR, "_");
        while paths.contains(&path) {
            path.push('_');
        }
        paths.insert(path.clone());
        path
    }

    /// Advances every DOWNLOADING entry one step.
    #[instrument(skip(self))]
    pub(crate) fn transition_dependencies(&self) -> io::Result<()> {
        self.with_state(|state| {
            let keys: Vec<DependencyKey> = state
                .dependencies
                .iter()
                .filter(|(_, dep)| dep.stage == DependencyStage::Downloading)
                .map(|(key, _)| key.clone())
                .collect();
            for key in keys {
                let entry = state.dependencies.get(&key).expect("listed above").clone();
                let next = self.transition_from_downloading(entry, &mut state.paths);
                state.dependencies.insert(key, next);
            }
        })
    }

    /// One step of the DOWNLOADING stage: claim (or take over a stale
    /// claim), reflect download progress, and settle READY or FAILED when
    /// this worker's download task finishes.
    fn transition_from_downloading(
        &self,
        mut dep: DependencyState,
        paths: &mut BTreeSet<String>,
    ) -> DependencyState {
        let now = unix_now();

        let claimable = match &dep.downloading_by {
            None => true,
            Some(_) => now.saturating_sub(dep.last_downloading) >= self.download_timeout,
        };
        if claimable {
            match &dep.downloading_by {
                None => info!(id=%self.id, key=%dep.key, "starting dependency download"),
                Some(previous) => info!(
                    previous=%previous, id=%self.id, key=%dep.key,
                    "previous downloader went quiet, taking over"
                ),
            }
            self.spawn_download(&dep);
            dep.downloading_by = Some(self.id.clone());
            dep.last_downloading = now;
        }

        if dep.downloading_by.as_deref() != Some(self.id.as_str()) {
            // Another worker holds a live claim; wait for it.
            debug!(key=%dep.key, by=?dep.downloading_by, "waiting for another worker's download");
            return dep;
        }

        let Some(status) = self.downloads.get(&dep.key) else {
            // Claimed by us but no task (e.g. restart with our id persisted
            // before the crash); start one.
            self.spawn_download(&dep);
            return dep;
        };

        if dep.killed {
            status.killed.store(true, Ordering::SeqCst);
        }

        if self.downloads.is_running(&dep.key) {
            dep.last_downloading = status.last_downloading.load(Ordering::SeqCst);
            dep.size_bytes = status.size_bytes.load(Ordering::SeqCst);
            dep.message = status.message.lock().clone();
            return dep;
        }

        // The download task finished; consume its result.
        self.downloads.remove(&dep.key);
        dep.downloading_by = None;
        if status.success.load(Ordering::SeqCst) {
            dep.stage = DependencyStage::Ready;
            dep.message = "Download complete".to_string();
        } else {
            // Free the path so the post-cooldown retry can re-assign it.
            paths.remove(&dep.path);
            dep.stage = DependencyStage::Failed;
            dep.message = status
                .failure_message
                .lock()
                .clone()
                .unwrap_or_else(|| "Dependency download failed".to_string());
            error!(key=%dep.key, message=%dep.message, "dependency download failed");
        }
        dep
    }

    fn spawn_download(&self, dep: &DependencyState) {
        let key = dep.key.clone();
        let target = self.dependencies_dir.join(&dep.path);
        let service = self.service.clone();
        let max_retries = self.max_retries.max(1);
        self.downloads.add_if_new(dep.key.clone(), move || {
            let status = DownloadStatus::new();
            let shared = status.clone();
            let handle = tokio::spawn(async move {
                download(service, key, target, shared, max_retries).await;
            });
            (handle, status)
        });
    }

    /// Prunes cooled-down FAILED entries, then evicts until both the byte
    /// ceiling and the serialized-length ceiling hold: oldest FAILED
    /// first, then the oldest READY entry nothing references. DOWNLOADING
    /// entries are never touched; if only those remain, eviction waits.
    #[instrument(skip(self))]
    pub(crate) fn cleanup(&self) -> io::Result<()> {
        self.prune_failed_dependencies()?;

        loop {
            let evicted = self.with_state(|state| {
                let bytes_used: u64 = state.dependencies.values().map(|d| d.size_bytes).sum();
                let serialized_len = serde_json::to_string(&state.dependencies)
                    .map(|s| s.len())
                    .unwrap_or(0);
                if bytes_used <= self.max_cache_size_bytes && serialized_len <= MAX_SERIALIZED_LEN
                {
                    return Ok::<bool, io::Error>(false);
                }
                debug!(
                    entries = state.dependencies.len(),
                    disk_use = %size_str(bytes_used),
                    max = %size_str(self.max_cache_size_bytes),
                    serialized_len,
                    "dependency cache over budget"
                );

                let oldest = |stage: DependencyStage, unreferenced_only: bool| {
                    state
                        .dependencies
                        .values()
                        .filter(|d| d.stage == stage)
                        .filter(|d| !unreferenced_only || d.dependents.is_empty())
                        .min_by_key(|d| d.last_used)
                        .map(|d| d.key.clone())
                };
                let victim = oldest(DependencyStage::Failed, false)
                    .or_else(|| oldest(DependencyStage::Ready, true));
                match victim {
                    Some(key) => {
                        self.delete_dependency(&key, state)?;
                        Ok(true)
                    }
                    None => {
                        info!(
                            "dependency quota full but only downloading entries remain, \
                             not cleaning up until downloads are over"
                        );
                        Ok(false)
                    }
                }
            })??;
            if !evicted {
                return Ok(());
            }
        }
    }

    fn prune_failed_dependencies(&self) -> io::Result<()> {
        let now = unix_now();
        self.with_state(|state| {
            let cooled: Vec<DependencyKey> = state
                .dependencies
                .values()
                .filter(|dep| {
                    dep.stage == DependencyStage::Failed
                        && now.saturating_sub(dep.last_used) > DEPENDENCY_FAILURE_COOLDOWN
                })
                .map(|dep| dep.key.clone())
                .collect();
            for key in cooled {
                self.delete_dependency(&key, state)?;
            }
            Ok(())
        })?
    }

    /// Removes the entry, its path reservation and its on-disk contents.
    fn delete_dependency(&self, key: &DependencyKey, state: &mut CacheState) -> io::Result<()> {
        if let Some(entry) = state.dependencies.remove(key) {
            state.paths.remove(&entry.path);
            if let Err(e) = remove_path(&self.dependencies_dir.join(&entry.path)) {
                warn!(key=%key, err=%e, "could not remove dependency contents");
            }
            info!(key=%key, "deleted dependency");
        }
        Ok(())
    }
}

/// The download task: streams the parent's contents from the server into
/// the cache path, with bounded retries on transport errors. Progress and
/// kill checks ride on every read.
async fn download(
    service: Arc<dyn BundleService>,
    key: DependencyKey,
    target: PathBuf,
    status: Arc<DownloadStatus>,
    max_retries: u32,
) {
    debug!(key=%key, "downloading dependency");
    let mut attempt = 0;
    loop {
        match fetch(&*service, &key, &target, &status).await {
            Ok(()) => {
                status.success.store(true, Ordering::SeqCst);
                debug!(key=%key, path=?target, "finished downloading dependency");
                return;
            }
            Err(e) => {
                let aborted = status.killed.load(Ordering::SeqCst);
                attempt += 1;
                if aborted || attempt >= max_retries {
                    *status.failure_message.lock() =
                        Some(format!("Dependency download failed: {} ", e));
                    return;
                }
                warn!(key=%key, attempt, err=%e, "dependency download failed, retrying");
            }
        }
    }
}

async fn fetch(
    service: &dyn BundleService,
    key: &DependencyKey,
    target: &Path,
    status: &Arc<DownloadStatus>,
) -> io::Result<()> {
    let kind = service
        .target_kind(key)
        .await
        .map_err(|e| io::Error::other(e.to_string()))?;
    let contents = service
        .open_contents(key)
        .await
        .map_err(|e| io::Error::other(e.to_string()))?;
    let mut reader = ProgressReader {
        inner: contents,
        status: status.clone(),
    };

    // A previous worker may have left a partial download behind; replace
    // it.
    remove_path(target)?;
    match kind {
        TargetKind::Directory => un_tar_gz_directory(reader, target).await,
        TargetKind::File => {
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let mut file = tokio::fs::File::create(target).await?;
            tokio::io::copy(&mut reader, &mut file).await?;
            Ok(())
        }
    }
}

/// Counts bytes into the shared status and aborts when the entry has been
/// killed.
struct ProgressReader {
    inner: Box<dyn AsyncRead + Send + Unpin>,
    status: Arc<DownloadStatus>,
}

impl AsyncRead for ProgressReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.status.killed.load(Ordering::SeqCst) {
            return Poll::Ready(Err(io::Error::other("Download aborted by user")));
        }
        let before = buf.filled().len();
        let result = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            let read = (buf.filled().len() - before) as u64;
            if read > 0 {
                let total = self.status.size_bytes.fetch_add(read, Ordering::SeqCst) + read;
                self.status.last_downloading.store(unix_now(), Ordering::SeqCst);
                *self.status.message.lock() =
                    format!("Downloading dependency: {} done", size_str(total));
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_assignment_is_collision_free() {
        let mut paths = BTreeSet::new();
        let a = DependencyManager::assign_path(&mut paths, &DependencyKey::new("a/b", "c"));
        let b = DependencyManager::assign_path(&mut paths, &DependencyKey::new("a", "b/c"));
        assert_eq!(a, "a_b_c");
        assert_eq!(b, "a_b_c_");
        assert_ne!(a, b);
        assert!(paths.contains(&a) && paths.contains(&b));
    }

    #[test]
    fn path_assignment_without_parent_path() {
        let mut paths = BTreeSet::new();
        let path =
            DependencyManager::assign_path(&mut paths, &DependencyKey::new("0xparent", ""));
        assert_eq!(path, "0xparent");
    }
}
