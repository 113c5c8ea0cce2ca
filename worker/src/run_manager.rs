//! Owns the table of in-flight runs and everything they share: the docker
//! networks, the cpu/gpu sets, the dependency and image caches, durable
//! state, and the read/netcat/write/kill directives passed through from
//! the server.

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, error, info};

use longshore_bundle::fsutil::normalize_path;
use longshore_bundle::messages::ReadArgs;
use longshore_bundle::{BundleCheckinState, BundleInfo, DependencyKey, RunResources, RunStage};

use crate::committer::JsonStateCommitter;
use crate::config::WorkerConfig;
use crate::dependencies::DependencyManager;
use crate::images::ImageManager;
use crate::observer::StageObserver;
use crate::reader::Reader;
use crate::run_state::{RunState, RunStateMachine};
use crate::runtime::ContainerRuntime;
use crate::service::BundleService;
use crate::tasks::TaskRegistry;

/// Directory under the work dir holding running bundles.
const BUNDLES_DIR_NAME: &str = "runs";
/// Seconds to wait for kills to propagate before giving up on a clean
/// shutdown.
const KILL_TIMEOUT: u64 = 100;
/// Buffer size while proxying netcat traffic.
const NETCAT_BUFFER_SIZE: usize = 4096;

struct WorkerNetworks {
    general: String,
    external: String,
    internal: String,
}

pub struct RunManager {
    worker_id: String,
    committer: JsonStateCommitter,
    runtime: Arc<dyn ContainerRuntime>,
    service: Arc<dyn BundleService>,
    images: Arc<ImageManager>,
    dependencies: Option<Arc<DependencyManager>>,
    runs: Arc<Mutex<HashMap<String, RunState>>>,
    machine: RunStateMachine,
    total_cpuset: BTreeSet<String>,
    total_gpuset: BTreeSet<String>,
    bundles_dir: PathBuf,
    work_dir: PathBuf,
    shared_file_system: bool,
    networks: WorkerNetworks,
    reader: Reader,
    stop: AtomicBool,
}

impl RunManager {
    pub async fn new(
        config: &WorkerConfig,
        service: Arc<dyn BundleService>,
        runtime: Arc<dyn ContainerRuntime>,
        observer: Arc<dyn StageObserver>,
    ) -> io::Result<Self> {
        let bundles_dir = config.work_dir.join(BUNDLES_DIR_NAME);
        if !config.shared_file_system {
            std::fs::create_dir_all(&bundles_dir)?;
        }

        let images = Arc::new(ImageManager::new(
            config.work_dir.join("images-state.json"),
            runtime.clone(),
            config.max_image_cache_size,
        )?);
        let dependencies = if config.shared_file_system {
            // All bundles already live on this filesystem; there is
            // nothing to cache.
            None
        } else {
            Some(Arc::new(DependencyManager::new(
                config.work_dir.join("dependencies-state.json"),
                service.clone(),
                &config.work_dir,
                config.max_cache_size_bytes,
                config.download_dependencies_max_retries,
                config.shared_dependency_cache,
            )?))
        };

        // One network with external access, one without, plus the general
        // worker network every container joins for netcat.
        let prefix = &config.docker_network_prefix;
        let networks = WorkerNetworks {
            general: runtime
                .ensure_network(&format!("{}_general", prefix), true)
                .await?,
            external: runtime
                .ensure_network(&format!("{}_ext", prefix), false)
                .await?,
            internal: runtime
                .ensure_network(&format!("{}_int", prefix), true)
                .await?,
        };

        let runs: Arc<Mutex<HashMap<String, RunState>>> = Arc::new(Mutex::new(HashMap::new()));
        let assign_resources: crate::run_state::ResourceAssigner = {
            let runs = runs.clone();
            let total_cpuset = config.cpuset.clone();
            let total_gpuset = config.gpuset.clone();
            Arc::new(move |request_cpus: u32, request_gpus: u32| {
                propose_sets(
                    &runs.lock(),
                    &total_cpuset,
                    &total_gpuset,
                    request_cpus,
                    request_gpus,
                )
            })
        };

        let machine = RunStateMachine {
            images: images.clone(),
            dependencies: dependencies.clone(),
            runtime: runtime.clone(),
            service: service.clone(),
            observer,
            worker_id: config.worker_id.clone(),
            docker_runtime: config.docker_runtime.clone(),
            network_external: networks.external.clone(),
            network_internal: networks.internal.clone(),
            shared_file_system: config.shared_file_system,
            assign_resources,
            disk_samplers: TaskRegistry::new(),
            uploads: TaskRegistry::new(),
        };

        Ok(RunManager {
            worker_id: config.worker_id.clone(),
            committer: JsonStateCommitter::new(config.work_dir.join("runs-state.json")),
            runtime,
            service,
            images,
            dependencies,
            runs,
            machine,
            total_cpuset: config.cpuset.clone(),
            total_gpuset: config.gpuset.clone(),
            bundles_dir,
            work_dir: config.work_dir.clone(),
            shared_file_system: config.shared_file_system,
            networks,
            reader: Reader::new(),
            stop: AtomicBool::new(false),
        })
    }

    /// Restores committed state and starts the cache managers.
    pub async fn start(&self) -> io::Result<()> {
        self.load_state().await?;
        self.images.start();
        if let Some(dependencies) = &self.dependencies {
            dependencies.start();
        }
        Ok(())
    }

    /// Stops sub-managers, commits state and removes the networks. Blocks
    /// until it is safe to quit.
    pub async fn stop(&self) {
        info!("stopping run manager");
        self.stop.store(true, Ordering::SeqCst);
        self.images.stop().await;
        if let Some(dependencies) = &self.dependencies {
            dependencies.stop().await;
        }
        self.reader.stop().await;
        if let Err(e) = self.save_state() {
            error!(err=%e, "cannot save run state");
        }
        for network in [
            &self.networks.general,
            &self.networks.external,
            &self.networks.internal,
        ] {
            if let Err(e) = self.runtime.remove_network(network).await {
                error!(network=%network, err=%e, "cannot remove docker network");
            }
        }
        info!("stopped run manager");
    }

    pub fn save_state(&self) -> io::Result<()> {
        // Container handles are plain ids here, so the snapshot is the
        // table itself.
        let runs = self.runs.lock().clone();
        self.committer.commit(&runs)
    }

    /// Restores the run table; containers that no longer exist lose their
    /// handle and the affected run fails over in its stage handler.
    pub async fn load_state(&self) -> io::Result<()> {
        let mut runs: HashMap<String, RunState> = self.committer.load_or_default()?;
        for run in runs.values_mut() {
            if let Some(container_id) = &run.container_id {
                if !self.runtime.container_exists(container_id).await.unwrap_or(false) {
                    debug!(uuid=%run.bundle.uuid, container_id=%container_id,
                        "container vanished while we were away");
                    run.container_id = None;
                }
            }
        }
        *self.runs.lock() = runs;
        Ok(())
    }

    /// Advances every run one stage, then drops finished runs (removing
    /// any containers they left behind).
    pub async fn process_runs(&self) {
        let uuids: Vec<String> = self.runs.lock().keys().cloned().collect();
        for uuid in uuids {
            let Some(run) = self.runs.lock().get(&uuid).cloned() else {
                continue;
            };
            let next = self.machine.transition(run).await;
            self.runs.lock().insert(uuid, next);
        }

        let leftover_containers: Vec<String> = self
            .runs
            .lock()
            .values()
            .filter(|run| {
                matches!(run.stage, RunStage::Finished | RunStage::Finalizing)
                    && run.container_id.is_some()
            })
            .filter_map(|run| run.container_id.clone())
            .collect();
        for container_id in leftover_containers {
            if let Err(e) = self.runtime.remove_container(&container_id).await {
                if e.kind() != io::ErrorKind::NotFound {
                    error!(container_id=%container_id, err=%e, "cannot remove finished container");
                }
            }
        }
        self.runs
            .lock()
            .retain(|_, run| run.stage != RunStage::Finished);
    }

    /// Registers a freshly dispatched bundle.
    pub fn create_run(&self, bundle: BundleInfo, resources: RunResources) {
        if self.stop.load(Ordering::SeqCst) {
            // Shutting down; refuse new work.
            return;
        }
        let bundle_path = if self.shared_file_system {
            PathBuf::from(bundle.location.clone().unwrap_or_default())
        } else {
            self.bundles_dir.join(&bundle.uuid)
        };
        let run = RunState::new(bundle, normalize_path(&bundle_path), resources);
        self.runs.lock().insert(run.bundle.uuid.clone(), run);
    }

    pub fn has_run(&self, uuid: &str) -> bool {
        self.runs.lock().contains_key(uuid)
    }

    pub fn get_run(&self, uuid: &str) -> Option<RunState> {
        self.runs.lock().get(uuid).cloned()
    }

    /// The server persisted the finish; the run may be discarded next
    /// tick.
    pub fn mark_finalized(&self, uuid: &str) {
        if let Some(run) = self.runs.lock().get_mut(uuid) {
            run.finalized = true;
        }
    }

    pub fn kill(&self, uuid: &str) {
        if let Some(run) = self.runs.lock().get_mut(uuid) {
            run.kill_message = Some("Kill requested".to_string());
            run.is_killed = true;
        }
    }

    /// Kills every run and waits for them to unwind.
    pub async fn kill_all(&self) {
        debug!("killing all runs");
        {
            let mut runs = self.runs.lock();
            for run in runs.values_mut() {
                run.kill_message = Some("Worker stopped".to_string());
                run.is_killed = true;
            }
        }
        for _ in 0..KILL_TIMEOUT {
            self.process_runs().await;
            let remaining = self.runs.lock().len();
            if remaining == 0 {
                return;
            }
            debug!(remaining, "waiting for runs to wind down");
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }
    }

    /// Writes `contents` to `subpath` in the bundle; dependency mounts are
    /// off limits.
    pub async fn write(&self, uuid: &str, subpath: &str, contents: &str) -> io::Result<()> {
        let Some(run) = self.get_run(uuid) else {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such run"));
        };
        let dep_paths: BTreeSet<&str> = run
            .bundle
            .dependencies
            .iter()
            .map(|dep| dep.child_path.as_str())
            .collect();
        if dep_paths.contains(normalize_path(std::path::Path::new(subpath)).to_string_lossy().as_ref()) {
            return Ok(());
        }
        let target = crate::fsutil::get_target_path(&run.bundle_path, uuid, subpath)
            .map_err(|e| io::Error::new(io::ErrorKind::PermissionDenied, e.to_string()))?;
        tokio::fs::write(target, contents).await
    }

    /// Proxies `message` to a port inside the run's container and replies
    /// with whatever comes back.
    pub async fn netcat(&self, uuid: &str, port: u16, message: &str, socket_id: &str) {
        let reply_err = |e: String| (500u16, e);
        let result: io::Result<Vec<u8>> = async {
            let run = self
                .get_run(uuid)
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such run"))?;
            let container_id = run
                .container_id
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no container"))?;
            let ip = self
                .runtime
                .container_ip(&self.networks.general, &container_id)
                .await?;
            let mut stream = tokio::net::TcpStream::connect((ip, port)).await?;
            stream.write_all(message.as_bytes()).await?;
            stream.shutdown().await?;
            let mut response = Vec::new();
            let mut buffer = vec![0u8; NETCAT_BUFFER_SIZE];
            loop {
                let n = stream.read(&mut buffer).await?;
                if n == 0 {
                    break;
                }
                response.extend_from_slice(&buffer[..n]);
            }
            Ok(response)
        }
        .await;

        match result {
            Ok(data) => {
                let _ = self
                    .service
                    .reply_data(
                        &self.worker_id,
                        socket_id,
                        serde_json::json!({}),
                        Box::new(std::io::Cursor::new(data)),
                    )
                    .await;
            }
            Err(e) => {
                let _ = self
                    .service
                    .reply(
                        &self.worker_id,
                        socket_id,
                        Some(reply_err(e.to_string())),
                        serde_json::json!({}),
                    )
                    .await;
            }
        }
    }

    pub async fn read(&self, uuid: &str, path: &str, args: ReadArgs, socket_id: &str) {
        let Some(run) = self.get_run(uuid) else {
            let _ = self
                .service
                .reply(
                    &self.worker_id,
                    socket_id,
                    Some((500, "Bundle no longer running".to_string())),
                    serde_json::json!({}),
                )
                .await;
            return;
        };
        self.reader
            .read(
                self.service.clone(),
                &self.worker_id,
                &run,
                path,
                args,
                socket_id,
            )
            .await;
    }

    /// Everything the worker reports about its runs at checkin.
    pub fn all_runs(&self) -> Vec<BundleCheckinState> {
        self.runs
            .lock()
            .values()
            .map(|run| run.checkin_state(&self.worker_id))
            .collect()
    }

    /// Dependency keys cached on this worker. Shared-filesystem workers
    /// report nothing; caching does not apply to them.
    pub fn all_dependencies(&self) -> Vec<DependencyKey> {
        match &self.dependencies {
            Some(dependencies) => dependencies.all_dependencies().unwrap_or_default(),
            None => Vec::new(),
        }
    }

    pub fn cpus(&self) -> u32 {
        self.total_cpuset.len() as u32
    }

    pub fn gpus(&self) -> u32 {
        self.total_gpuset.len() as u32
    }

    /// Total installed memory.
    pub fn memory_bytes(&self) -> u64 {
        read_total_memory_bytes().unwrap_or(0)
    }

    /// Free bytes on the filesystem holding the work dir.
    pub fn free_disk_bytes(&self) -> Option<u64> {
        #[cfg(unix)]
        {
            nix::sys::statvfs::statvfs(&self.work_dir)
                .ok()
                .map(|vfs| vfs.blocks_available() as u64 * vfs.fragment_size() as u64)
        }
        #[cfg(not(unix))]
        {
            None
        }
    }
}

/// Proposes cpu/gpu index sets for a request, given what RUNNING runs
/// already hold. No side effects; the caller records the assignment on the
/// run itself.
fn propose_sets(
    runs: &HashMap<String, RunState>,
    total_cpuset: &BTreeSet<String>,
    total_gpuset: &BTreeSet<String>,
    request_cpus: u32,
    request_gpus: u32,
) -> Result<(BTreeSet<String>, BTreeSet<String>), String> {
    let mut cpuset = total_cpuset.clone();
    let mut gpuset = total_gpuset.clone();
    for run in runs.values() {
        if run.stage == RunStage::Running {
            for cpu in &run.cpuset {
                cpuset.remove(cpu);
            }
            for gpu in &run.gpuset {
                gpuset.remove(gpu);
            }
        }
    }
    if (cpuset.len() as u32) < request_cpus {
        return Err(format!(
            "Requested more CPUs ({}) than available ({} currently out of {} on the machine)",
            request_cpus,
            cpuset.len(),
            total_cpuset.len()
        ));
    }
    if (gpuset.len() as u32) < request_gpus {
        return Err(format!(
            "Requested more GPUs ({}) than available ({} currently out of {} on the machine)",
            request_gpus,
            gpuset.len(),
            total_gpuset.len()
        ));
    }
    Ok((
        cpuset.into_iter().take(request_cpus as usize).collect(),
        gpuset.into_iter().take(request_gpus as usize).collect(),
    ))
}

#[cfg(target_os = "linux")]
fn read_total_memory_bytes() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            let kb: u64 = rest.trim().trim_end_matches(" kB").trim().parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
fn read_total_memory_bytes() -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::propose_sets;
    use std::collections::{BTreeSet, HashMap};

    #[test]
    fn proposes_from_free_sets() {
        let total: BTreeSet<String> = ["0", "1", "2", "3"].iter().map(|s| s.to_string()).collect();
        let (cpuset, gpuset) =
            propose_sets(&HashMap::new(), &total, &BTreeSet::new(), 2, 0).unwrap();
        assert_eq!(cpuset.len(), 2);
        assert!(gpuset.is_empty());
    }

    #[test]
    fn refuses_over_allocation() {
        let total: BTreeSet<String> = ["0"].iter().map(|s| s.to_string()).collect();
        let err = propose_sets(&HashMap::new(), &total, &BTreeSet::new(), 2, 0).unwrap_err();
        assert!(err.contains("Requested more CPUs"));
    }
}
