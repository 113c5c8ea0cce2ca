use std::collections::BTreeSet;
use std::path::PathBuf;

/// Worker settings, assembled by the binary from flags and environment.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// Root of the worker's scratch space; runs and caches live under it.
    pub work_dir: PathBuf,
    pub tag: Option<String>,
    pub tag_exclusive: bool,
    pub group_name: Option<String>,
    /// Cpu indices available to runs.
    pub cpuset: BTreeSet<String>,
    /// Gpu indices available to runs.
    pub gpuset: BTreeSet<String>,
    pub max_cache_size_bytes: u64,
    pub max_image_cache_size: Option<u64>,
    pub download_dependencies_max_retries: u32,
    /// Bundle contents live on a filesystem shared with the server.
    pub shared_file_system: bool,
    /// The dependency cache directory is shared with other worker
    /// processes, so its state file needs the cross-process lease.
    pub shared_dependency_cache: bool,
    pub docker_runtime: String,
    pub docker_network_prefix: String,
    /// Seconds between checkins.
    pub checkin_interval: u64,
    pub exit_when_idle: bool,
    pub exit_after_num_runs: Option<i64>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            worker_id: "worker".to_string(),
            work_dir: PathBuf::from("/var/lib/longshore-worker"),
            tag: None,
            tag_exclusive: false,
            group_name: None,
            cpuset: (0..num_cpus()).map(|i| i.to_string()).collect(),
            gpuset: BTreeSet::new(),
            max_cache_size_bytes: 10 << 30,
            max_image_cache_size: None,
            download_dependencies_max_retries: 3,
            shared_file_system: false,
            shared_dependency_cache: false,
            docker_runtime: "runc".to_string(),
            docker_network_prefix: "longshore_worker_network".to_string(),
            checkin_interval: 5,
            exit_when_idle: false,
            exit_after_num_runs: None,
        }
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|threads| threads.into())
        .unwrap_or(1)
}
