use clap::Parser;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};

use longshore_bundle::fmt::parse_size;
use longshore_worker::config::WorkerConfig;
use longshore_worker::observer::NoopObserver;
use longshore_worker::run_manager::RunManager;
use longshore_worker::runtime::DummyContainerRuntime;
use longshore_worker::service::MemoryBundleService;
use longshore_worker::worker::Worker;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// A global log level to use when printing logs.
    /// It's also possible to set `RUST_LOG` according to
    /// `tracing_subscriber::filter::EnvFilter`, which will always have
    /// priority.
    #[arg(long)]
    log_level: Option<Level>,

    #[arg(long, env, default_value = "worker-1")]
    worker_id: String,

    /// Root of the worker's scratch space.
    #[arg(long, env, default_value = "/var/lib/longshore-worker")]
    work_dir: PathBuf,

    /// Queue tag advertised to the scheduler.
    #[arg(long, env)]
    tag: Option<String>,

    /// Only accept bundles whose tag matches exactly.
    #[arg(long, env, default_value_t = false)]
    tag_exclusive: bool,

    /// Ceiling on the dependency cache, e.g. `10g`.
    #[arg(long, env, default_value = "10g")]
    max_cache_size: String,

    /// Ceiling on the image cache, e.g. `50g`. Unset means unbounded.
    #[arg(long, env)]
    max_image_cache_size: Option<String>,

    #[arg(long, env, default_value_t = 3)]
    download_dependencies_max_retries: u32,

    /// Bundle contents live on a filesystem shared with the server.
    #[arg(long, env, default_value_t = false)]
    shared_file_system: bool,

    /// The dependency cache is shared with other worker processes.
    #[arg(long, env, default_value_t = false)]
    shared_dependency_cache: bool,

    #[arg(long, env, default_value = "runc")]
    docker_runtime: String,

    #[arg(long, env, default_value = "longshore_worker_network")]
    docker_network_prefix: String,

    /// Seconds between checkins.
    #[arg(long, env, default_value_t = 5)]
    checkin_interval: u64,

    /// Exit once a successful checkin reports no runs.
    #[arg(long, env, default_value_t = false)]
    exit_when_idle: bool,

    /// Terminate after accepting this many runs.
    #[arg(long, env)]
    exit_after_num_runs: Option<i64>,

    /// Gpu indices to offer to runs, e.g. `0,1`.
    #[arg(long, env, value_delimiter = ',')]
    gpuset: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    longshore_tracing::TracingBuilder::default()
        .level(cli.log_level.unwrap_or(Level::INFO))
        .build()?;

    let config = WorkerConfig {
        worker_id: cli.worker_id,
        work_dir: cli.work_dir,
        tag: cli.tag,
        tag_exclusive: cli.tag_exclusive,
        gpuset: cli.gpuset.into_iter().collect::<BTreeSet<String>>(),
        max_cache_size_bytes: parse_size(&cli.max_cache_size)?,
        max_image_cache_size: cli
            .max_image_cache_size
            .as_deref()
            .map(parse_size)
            .transpose()?,
        download_dependencies_max_retries: cli.download_dependencies_max_retries,
        shared_file_system: cli.shared_file_system,
        shared_dependency_cache: cli.shared_dependency_cache,
        docker_runtime: cli.docker_runtime,
        docker_network_prefix: cli.docker_network_prefix,
        checkin_interval: cli.checkin_interval,
        exit_when_idle: cli.exit_when_idle,
        exit_after_num_runs: cli.exit_after_num_runs,
        ..Default::default()
    };

    // The in-tree service and runtime are stand-ins; deployments link
    // their bundle-server client and container engine here.
    let service = Arc::new(MemoryBundleService::new());
    let runtime = Arc::new(DummyContainerRuntime);

    let run_manager = Arc::new(
        RunManager::new(&config, service.clone(), runtime, Arc::new(NoopObserver)).await?,
    );
    let worker = Arc::new(Worker::new(config, service, run_manager));

    tokio::spawn({
        let worker = worker.clone();
        async move {
            tokio::signal::ctrl_c().await.expect("ctrl_c handler");
            info!("interrupt received, shutting down");
            worker.signal();
        }
    });

    worker.start().await?;
    Ok(())
}
