use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};

use longshore_server::auth::AllowAll;
use longshore_server::config::{ServerConfig, WorkersSection};
use longshore_server::manager::BundleManager;
use longshore_server::model::from_addr;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// A global log level to use when printing logs.
    /// It's also possible to set `RUST_LOG` according to
    /// `tracing_subscriber::filter::EnvFilter`, which will always have
    /// priority.
    #[arg(long)]
    log_level: Option<Level>,

    /// Seconds between manager ticks.
    #[arg(long, env, default_value_t = 1)]
    sleep_time: u64,

    #[arg(long, env, default_value = "memory://")]
    model_addr: String,

    /// The user owning the shared worker pool.
    #[arg(long, env, default_value = "0")]
    root_user_id: String,

    /// Ceiling on requested run time, e.g. `10d`.
    #[arg(long, env)]
    max_request_time: Option<String>,

    /// Ceiling on requested memory, e.g. `64g`.
    #[arg(long, env)]
    max_request_memory: Option<String>,

    /// Floor on requested memory; defaults to docker's 4m minimum.
    #[arg(long, env)]
    min_request_memory: Option<String>,

    /// Ceiling on requested disk, e.g. `100g`.
    #[arg(long, env)]
    max_request_disk: Option<String>,

    #[arg(long, env, default_value = "longshore/default-cpu:latest")]
    default_cpu_image: String,

    #[arg(long, env, default_value = "longshore/default-gpu:latest")]
    default_gpu_image: String,

    /// Seconds without a checkin after which a worker counts as dead.
    #[arg(long, env)]
    worker_timeout_seconds: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    longshore_tracing::TracingBuilder::default()
        .level(cli.log_level.unwrap_or(Level::INFO))
        .build()?;

    let config: ServerConfig = WorkersSection {
        max_request_time: cli.max_request_time,
        max_request_memory: cli.max_request_memory,
        min_request_memory: cli.min_request_memory,
        max_request_disk: cli.max_request_disk,
        default_cpu_image: Some(cli.default_cpu_image),
        default_gpu_image: Some(cli.default_gpu_image),
        worker_timeout_seconds: cli.worker_timeout_seconds,
    }
    .try_into()?;

    let model = from_addr(&cli.model_addr, &cli.root_user_id)?;

    let manager = Arc::new(BundleManager::new(
        model.clone(),
        model,
        Arc::new(AllowAll),
        config,
    ));

    tokio::spawn({
        let manager = manager.clone();
        async move {
            tokio::signal::ctrl_c().await.expect("ctrl_c handler");
            info!("interrupt received, shutting down after in-flight makes");
            manager.signal();
        }
    });

    manager.run(Duration::from_secs(cli.sleep_time)).await;
    Ok(())
}
