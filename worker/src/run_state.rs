//! The per-bundle state machine a worker drives once a run is accepted:
//! PREPARING → RUNNING → CLEANING_UP → (UPLOADING_RESULTS) → FINALIZING →
//! FINISHED. Each run advances at most one stage per tick, and every
//! handler is safe to re-enter, so a worker restart resumes where the
//! committed state left off.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

use longshore_bundle::fmt::{duration_str, size_str};
use longshore_bundle::fsutil::{normalize_path, path_is_contained, remove_path};
use longshore_bundle::{
    unix_now, BundleCheckinState, BundleInfo, BundleState, RunResources, RunStage, StageTimes,
};

use crate::dependencies::{DependencyManager, DependencyStage};
use crate::images::ImageManager;
use crate::observer::StageObserver;
use crate::runtime::{ContainerRuntime, ContainerSpec};
use crate::service::BundleService;
use crate::tasks::TaskRegistry;

/// Ticks to wait for the server to create the bundle directory on a
/// shared filesystem before giving up.
pub const BUNDLE_DIR_WAIT_NUM_TRIES: u32 = 120;

/// Worker-local record of one in-flight bundle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub stage: RunStage,
    pub run_status: String,
    pub bundle: BundleInfo,
    pub bundle_path: PathBuf,
    pub bundle_dir_wait_num_tries: u32,
    pub resources: RunResources,
    pub bundle_start_time: u64,
    pub container_time_total: u64,
    pub container_time_user: u64,
    pub container_time_system: u64,
    pub container_start_time: Option<u64>,
    /// The engine's container handle; re-resolved after a restart, and
    /// cleared if the container is gone.
    pub container_id: Option<String>,
    /// Image digest actually used for the run.
    pub docker_image: Option<String>,
    pub is_killed: bool,
    /// The run produced (or may have produced) contents worth uploading.
    pub has_contents: bool,
    pub cpuset: BTreeSet<String>,
    pub gpuset: BTreeSet<String>,
    pub max_memory: u64,
    pub disk_utilization: u64,
    pub exitcode: Option<i32>,
    pub failure_message: Option<String>,
    pub kill_message: Option<String>,
    pub finished: bool,
    pub finalized: bool,
    pub stage_times: BTreeMap<RunStage, StageTimes>,
}

impl RunState {
    pub fn new(
        bundle: BundleInfo,
        bundle_path: PathBuf,
        resources: RunResources,
    ) -> RunState {
        let now = unix_now();
        RunState {
            stage: RunStage::Preparing,
            run_status: String::new(),
            bundle,
            bundle_path,
            bundle_dir_wait_num_tries: BUNDLE_DIR_WAIT_NUM_TRIES,
            resources,
            bundle_start_time: now,
            container_time_total: 0,
            container_time_user: 0,
            container_time_system: 0,
            container_start_time: None,
            container_id: None,
            docker_image: None,
            is_killed: false,
            has_contents: false,
            cpuset: BTreeSet::new(),
            gpuset: BTreeSet::new(),
            max_memory: 0,
            disk_utilization: 0,
            exitcode: None,
            failure_message: None,
            kill_message: None,
            finished: false,
            finalized: false,
            stage_times: BTreeMap::from([(
                RunStage::Preparing,
                StageTimes {
                    start: now,
                    end: now,
                    elapsed: 0,
                },
            )]),
        }
    }

    /// Moves to `stage`, closing the timing record of the stage being
    /// left.
    fn advance(mut self, stage: RunStage) -> RunState {
        let now = unix_now();
        if let Some(times) = self.stage_times.get_mut(&self.stage) {
            times.end = now;
            times.elapsed = now.saturating_sub(times.start);
        }
        self.stage_times.entry(stage).or_insert(StageTimes {
            start: now,
            end: now,
            elapsed: 0,
        });
        self.stage = stage;
        self
    }

    fn fail(mut self, message: impl Into<String>) -> RunState {
        let message = message.into();
        error!(uuid=%self.bundle.uuid, message=%message, "run failed");
        self.failure_message = Some(message);
        self.advance(RunStage::CleaningUp)
    }

    /// The bundle state the server should record for this run right now.
    pub fn server_state(&self) -> BundleState {
        if self.stage == RunStage::Finished {
            if self.is_killed {
                BundleState::Killed
            } else if !matches!(self.exitcode, Some(0)) {
                BundleState::Failed
            } else {
                BundleState::Ready
            }
        } else {
            self.stage.server_state()
        }
    }

    /// What the worker reports for this run at checkin.
    pub fn checkin_state(&self, worker_id: &str) -> BundleCheckinState {
        BundleCheckinState {
            uuid: self.bundle.uuid.clone(),
            run_status: self.run_status.clone(),
            bundle_start_time: self.bundle_start_time,
            container_time_total: self.container_time_total,
            container_time_user: self.container_time_user,
            container_time_system: self.container_time_system,
            docker_image: self.docker_image.clone(),
            state: self.server_state(),
            remote: worker_id.to_string(),
            exitcode: self.exitcode,
            failure_message: self.failure_message.clone(),
            is_killed: self.is_killed,
            stage_times: self.stage_times.clone(),
        }
    }
}

/// Disk sampler slot: the latest measured size of the bundle directory.
pub struct DiskUsage {
    pub bytes: AtomicU64,
    pub running: AtomicBool,
}

/// Upload slot shared with the background uploader.
pub struct UploadStatus {
    pub run_status: Mutex<String>,
    pub success: AtomicBool,
    pub killed: AtomicBool,
}

/// Assigns free cpu/gpu indices for a run; fails with a message when the
/// machine cannot cover the request.
pub type ResourceAssigner = Arc<
    dyn Fn(u32, u32) -> Result<(BTreeSet<String>, BTreeSet<String>), String> + Send + Sync,
>;

pub struct RunStateMachine {
    pub(crate) images: Arc<ImageManager>,
    /// Absent on shared-filesystem workers, which read parents in place.
    pub(crate) dependencies: Option<Arc<DependencyManager>>,
    pub(crate) runtime: Arc<dyn ContainerRuntime>,
    pub(crate) service: Arc<dyn BundleService>,
    pub(crate) observer: Arc<dyn StageObserver>,
    pub(crate) worker_id: String,
    pub(crate) docker_runtime: String,
    pub(crate) network_external: String,
    pub(crate) network_internal: String,
    pub(crate) shared_file_system: bool,
    pub(crate) assign_resources: ResourceAssigner,
    pub(crate) disk_samplers: TaskRegistry<String, DiskUsage>,
    pub(crate) uploads: TaskRegistry<String, UploadStatus>,
}

impl RunStateMachine {
    /// Advances a run by at most one stage.
    pub async fn transition(&self, state: RunState) -> RunState {
        let uuid = state.bundle.uuid.clone();
        let before = state.stage;
        let next = match state.stage {
            RunStage::Preparing => self.transition_from_preparing(state).await,
            RunStage::Running => self.transition_from_running(state).await,
            RunStage::CleaningUp => self.transition_from_cleaning_up(state).await,
            RunStage::UploadingResults => self.transition_from_uploading_results(state).await,
            RunStage::Finalizing => self.transition_from_finalizing(state).await,
            RunStage::Finished => state,
        };
        if next.stage != before {
            debug!(uuid=%uuid, from=%before, to=%next.stage, "run stage transition");
            self.observer.on_transition(&uuid, before, next.stage);
        }
        next
    }

    /// PREPARING: gather dependencies and the image, set up the bundle
    /// directory and dependency mounts, allocate cpu/gpu sets, start the
    /// container.
    async fn transition_from_preparing(&self, mut state: RunState) -> RunState {
        if state.is_killed {
            return state.advance(RunStage::CleaningUp);
        }

        let mut status_messages: Vec<String> = Vec::new();
        let mut dependencies_ready = true;

        let bundle_dependencies = state.bundle.dependencies.clone();
        if let Some(dependencies) = &self.dependencies {
            for dep in &bundle_dependencies {
                let dep_state = match dependencies.get(&state.bundle.uuid, &dep.key()) {
                    Ok(dep_state) => dep_state,
                    Err(e) => return state.fail(format!("Dependency cache error: {}", e)),
                };
                match dep_state.stage {
                    DependencyStage::Downloading => {
                        status_messages.push(format!(
                            "Downloading dependency {}: {} done (archived size)",
                            dep.child_path,
                            size_str(dep_state.size_bytes)
                        ));
                        dependencies_ready = false;
                    }
                    DependencyStage::Failed => {
                        return state.fail(format!(
                            "Failed to download dependency {}: {}",
                            dep.child_path, dep_state.message
                        ));
                    }
                    DependencyStage::Ready => {}
                }
            }
        }

        let image_state = self.images.get(&state.resources.docker_image).await;
        match image_state.stage {
            DependencyStage::Downloading => {
                status_messages.push(format!(
                    "Pulling docker image: {}",
                    if image_state.message.is_empty() {
                        &state.resources.docker_image
                    } else {
                        &image_state.message
                    }
                ));
                dependencies_ready = false;
            }
            DependencyStage::Failed => {
                return state.fail(format!(
                    "Failed to download Docker image: {}",
                    image_state.message
                ));
            }
            DependencyStage::Ready => {}
        }

        if !dependencies_ready {
            let mut status_message = status_messages.pop().unwrap_or_default();
            if !status_messages.is_empty() {
                status_message.push_str(&format!(
                    " (and downloading {} other dependencies and docker images)",
                    status_messages.len()
                ));
            }
            state.run_status = status_message;
            return state;
        }

        // Everything is ready; set up the bundle directory.
        if self.shared_file_system {
            if !state.bundle_path.exists() {
                if state.bundle_dir_wait_num_tries == 0 {
                    return state.fail(
                        "Bundle directory cannot be found on the shared filesystem. \
                         Please ensure the shared filesystem between the server and \
                         your worker is mounted properly or contact your administrators.",
                    );
                }
                state.run_status =
                    "Waiting for bundle directory to be created by the server".to_string();
                state.bundle_dir_wait_num_tries -= 1;
                return state;
            }
        } else {
            if let Err(e) = remove_path(&state.bundle_path)
                .and_then(|_| std::fs::create_dir_all(&state.bundle_path))
            {
                return state.fail(format!("Cannot create bundle directory: {}", e));
            }
        }

        // Wire up dependency mounts: symlinks from the bundle directory to
        // in-container paths, plus the volume binds realizing them.
        let container_deps_root = if self.shared_file_system {
            format!("/{}", state.bundle.uuid)
        } else {
            format!("/{}_dependencies", state.bundle.uuid)
        };
        let mut container_dependencies: Vec<(PathBuf, String)> = Vec::new();
        for dep in &bundle_dependencies {
            if !path_is_contained(&state.bundle_path, std::path::Path::new(&dep.child_path)) {
                // Dependencies must end up inside their bundle; no
                // escaping the root with relative paths.
                return state.fail(format!("Invalid key for dependency: {}", dep.child_path));
            }
            let full_child_path = normalize_path(&state.bundle_path.join(&dep.child_path));
            let container_dep_path = format!("{}/{}", container_deps_root, dep.child_path);

            let host_dep_path = if self.shared_file_system {
                let Some(location) = &dep.location else {
                    return state.fail(format!(
                        "Dependency {} has no location on the shared filesystem",
                        dep.key()
                    ));
                };
                match std::fs::canonicalize(PathBuf::from(location).join(&dep.parent_path)) {
                    Ok(path) => path,
                    Err(e) => return state.fail(format!("Invalid dependency {}: {}", dep.key(), e)),
                }
            } else {
                let dependencies = self.dependencies.as_ref().expect("checked above");
                let dep_state = match dependencies.get(&state.bundle.uuid, &dep.key()) {
                    Ok(dep_state) => dep_state,
                    Err(e) => return state.fail(format!("Dependency cache error: {}", e)),
                };
                let host_path = dependencies.dependencies_dir.join(&dep_state.path);
                let _ = remove_path(&full_child_path);
                #[cfg(unix)]
                if let Err(e) = std::os::unix::fs::symlink(&container_dep_path, &full_child_path)
                {
                    return state.fail(format!("Cannot link dependency: {}", e));
                }
                host_path
            };
            container_dependencies.push((host_dep_path, container_dep_path));
        }

        let network = if state.resources.network {
            self.network_external.clone()
        } else {
            self.network_internal.clone()
        };

        let (cpuset, gpuset) =
            match (self.assign_resources)(state.resources.cpus, state.resources.gpus) {
                Ok(sets) => sets,
                Err(e) => return state.fail(format!("Cannot assign enough resources: {}", e)),
            };

        let spec = ContainerSpec {
            uuid: state.bundle.uuid.clone(),
            bundle_path: state.bundle_path.clone(),
            command: state.bundle.command.clone(),
            image: state.resources.docker_image.clone(),
            dependencies: container_dependencies,
            network,
            cpuset: cpuset.clone(),
            gpuset: gpuset.clone(),
            memory_bytes: state.resources.memory,
            runtime: self.docker_runtime.clone(),
        };
        let container_id = match self.runtime.start_container(&spec).await {
            Ok(id) => id,
            Err(e) => return state.fail(format!("Cannot start Docker container: {}", e)),
        };

        state.run_status = "Running job in Docker container".to_string();
        state.container_id = Some(container_id);
        state.container_start_time = Some(unix_now());
        state.docker_image = image_state.digest;
        state.has_contents = true;
        state.cpuset = cpuset;
        state.gpuset = gpuset;
        state.advance(RunStage::Running)
    }

    /// RUNNING: probe liveness, enforce the resource ceilings, keep the
    /// disk sampler alive.
    async fn transition_from_running(&self, mut state: RunState) -> RunState {
        let uuid = state.bundle.uuid.clone();
        let Some(container_id) = state.container_id.clone() else {
            return state.fail("Container vanished while running");
        };

        self.ensure_disk_sampler(&uuid, &state.bundle_path);

        match self.runtime.check_finished(&container_id).await {
            Ok(status) => {
                state.finished = status.finished;
                if status.finished {
                    state.exitcode = status.exitcode;
                    if state.failure_message.is_none() {
                        state.failure_message = status.failure_message;
                    }
                }
            }
            Err(e) => {
                error!(uuid=%uuid, err=%e, "cannot check container status");
            }
        }

        if let Ok(stats) = self.runtime.container_stats(&container_id).await {
            state.max_memory = state.max_memory.max(stats.memory_bytes);
            state.container_time_user = stats.time_user;
            state.container_time_system = stats.time_system;
            state.container_time_total = if stats.time_total > 0 {
                stats.time_total
            } else {
                unix_now().saturating_sub(state.container_start_time.unwrap_or(unix_now()))
            };
        }
        if let Some(sampler) = self.disk_samplers.get(&uuid) {
            state.disk_utilization = sampler.bytes.load(Ordering::SeqCst);
        }

        let mut kill_messages = Vec::new();
        if let Some(time_limit) = state.resources.time {
            if time_limit > 0 && state.container_time_total > time_limit {
                kill_messages.push(format!(
                    "Time limit exceeded. (Container uptime {} > time limit {})",
                    duration_str(state.container_time_total),
                    duration_str(time_limit)
                ));
            }
        }
        if state.max_memory > state.resources.memory || state.exitcode == Some(137) {
            kill_messages.push(format!(
                "Memory limit {} exceeded.",
                size_str(state.resources.memory)
            ));
        }
        if state.resources.disk > 0 && state.disk_utilization > state.resources.disk {
            kill_messages.push(format!(
                "Disk limit {} exceeded.",
                size_str(state.resources.disk)
            ));
        }
        if !kill_messages.is_empty() {
            state.kill_message = Some(kill_messages.join(" "));
            state.is_killed = true;
        }

        if state.is_killed {
            if self.runtime.container_exists(&container_id).await.unwrap_or(false) {
                if let Err(e) = self.runtime.kill_container(&container_id).await {
                    // The container may have won the race and exited.
                    let finished = self
                        .runtime
                        .check_finished(&container_id)
                        .await
                        .map(|s| s.finished)
                        .unwrap_or(false);
                    if !finished {
                        error!(uuid=%uuid, err=%e, "cannot kill container");
                    }
                }
            }
            self.stop_disk_sampler(&uuid);
            return state.advance(RunStage::CleaningUp);
        }
        if state.finished {
            debug!(
                uuid=%uuid, exitcode=?state.exitcode, failure_message=?state.failure_message,
                "finished run"
            );
            self.stop_disk_sampler(&uuid);
            state.run_status = "Uploading results".to_string();
            return state.advance(RunStage::CleaningUp);
        }
        state
    }

    /// CLEANING_UP: tear the container down, release and unlink the
    /// dependencies, then branch to upload or straight to finalize.
    async fn transition_from_cleaning_up(&self, mut state: RunState) -> RunState {
        if let Some(container_id) = state.container_id.clone() {
            while self.runtime.container_exists(&container_id).await.unwrap_or(false) {
                let finished = self
                    .runtime
                    .check_finished(&container_id)
                    .await
                    .map(|s| s.finished)
                    .unwrap_or(false);
                if finished {
                    if let Err(e) = self.runtime.remove_container(&container_id).await {
                        error!(uuid=%state.bundle.uuid, err=%e, "cannot remove container");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        continue;
                    }
                    state.container_id = None;
                    break;
                }
                if let Err(e) = self.runtime.kill_container(&container_id).await {
                    error!(uuid=%state.bundle.uuid, err=%e, "cannot kill container");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }

        for dep in &state.bundle.dependencies {
            if let Some(dependencies) = &self.dependencies {
                if let Err(e) = dependencies.release(&state.bundle.uuid, &dep.key()) {
                    error!(uuid=%state.bundle.uuid, key=%dep.key(), err=%e, "cannot release dependency");
                }
                let child_path = state.bundle_path.join(&dep.child_path);
                if let Err(e) = remove_path(&child_path) {
                    error!(uuid=%state.bundle.uuid, path=?child_path, err=%e, "cannot remove dependency link");
                }
            }
        }

        if !self.shared_file_system && state.has_contents {
            state.run_status = "Uploading results".to_string();
            return state.advance(RunStage::UploadingResults);
        }
        if state.failure_message.is_none() && state.is_killed {
            state.failure_message = state.kill_message.clone();
        }
        state.run_status = "Finalizing bundle".to_string();
        state.advance(RunStage::Finalizing)
    }

    /// UPLOADING_RESULTS: one background upload per run; the progress
    /// callback keeps `run_status` fresh and aborts when the run is
    /// killed.
    async fn transition_from_uploading_results(&self, mut state: RunState) -> RunState {
        let uuid = state.bundle.uuid.clone();
        let service = self.service.clone();
        let worker_id = self.worker_id.clone();
        let bundle_path = state.bundle_path.clone();
        self.uploads.add_if_new(uuid.clone(), || {
            let status = Arc::new(UploadStatus {
                run_status: Mutex::new("Uploading results".to_string()),
                success: AtomicBool::new(false),
                killed: AtomicBool::new(false),
            });
            let shared = status.clone();
            let task_uuid = uuid.clone();
            let handle = tokio::spawn(async move {
                debug!(uuid=%task_uuid, "uploading results");
                let progress = {
                    let shared = shared.clone();
                    Arc::new(move |bytes: u64| {
                        *shared.run_status.lock() = format!(
                            "Uploading results: {} done (archived size)",
                            size_str(bytes)
                        );
                        !shared.killed.load(Ordering::SeqCst)
                    })
                };
                match service
                    .upload_contents(&worker_id, &task_uuid, &bundle_path, progress)
                    .await
                {
                    Ok(()) => shared.success.store(true, Ordering::SeqCst),
                    Err(e) => {
                        *shared.run_status.lock() = format!("Error while uploading: {}", e);
                        error!(uuid=%task_uuid, err=%e, "upload failed");
                    }
                }
            });
            (handle, status)
        });

        let status = self.uploads.get(&uuid).expect("just added");
        if state.is_killed {
            status.killed.store(true, Ordering::SeqCst);
        }
        if self.uploads.is_running(&state.bundle.uuid) {
            state.run_status = status.run_status.lock().clone();
            return state;
        }
        if !status.success.load(Ordering::SeqCst) {
            let upload_status = status.run_status.lock().clone();
            state.failure_message = Some(match state.failure_message.take() {
                Some(existing) => format!("{}. {}", existing, upload_status),
                None => upload_status,
            });
        }
        self.uploads.remove(&state.bundle.uuid);
        if state.failure_message.is_none() && state.is_killed {
            state.failure_message = state.kill_message.clone();
        }
        state.run_status = "Finalizing bundle".to_string();
        state.advance(RunStage::Finalizing)
    }

    /// FINALIZING: once the server has acknowledged the finish, the bundle
    /// directory can go and the run record is done.
    async fn transition_from_finalizing(&self, mut state: RunState) -> RunState {
        if state.finalized {
            if !self.shared_file_system {
                if let Err(e) = remove_path(&state.bundle_path) {
                    error!(uuid=%state.bundle.uuid, err=%e, "cannot remove bundle directory");
                }
            }
            state.run_status = "Finished".to_string();
            return state.advance(RunStage::Finished);
        }
        state.finished = true;
        state
    }

    /// Keeps one background sampler computing the bundle directory's size.
    /// The sampler sleeps at least 10x its own scan time so it stays under
    /// ~10% of disk bandwidth even on huge trees.
    fn ensure_disk_sampler(&self, uuid: &str, bundle_path: &std::path::Path) {
        let path = bundle_path.to_path_buf();
        self.disk_samplers.add_if_new(uuid.to_string(), || {
            let usage = Arc::new(DiskUsage {
                bytes: AtomicU64::new(0),
                running: AtomicBool::new(true),
            });
            let shared = usage.clone();
            let handle = tokio::spawn(async move {
                while shared.running.load(Ordering::SeqCst) {
                    let started = std::time::Instant::now();
                    match crate::fsutil::path_size(path.clone()).await {
                        Ok(bytes) => shared.bytes.store(bytes, Ordering::SeqCst),
                        Err(e) => error!(path=?path, err=%e, "disk sampling failed"),
                    }
                    let elapsed = started.elapsed();
                    tokio::time::sleep(std::cmp::max(
                        elapsed * 10,
                        std::time::Duration::from_secs(1),
                    ))
                    .await;
                }
            });
            (handle, usage)
        });
    }

    fn stop_disk_sampler(&self, uuid: &str) {
        if let Some(usage) = self.disk_samplers.remove(&uuid.to_string()) {
            usage.running.store(false, Ordering::SeqCst);
        }
    }
}
