//! The worker's outer loop: advance runs, commit state, check in with the
//! server and dispatch whatever directive comes back. Checkins must stay
//! fast; anything slow runs in the background via the run manager.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

use longshore_bundle::messages::{ServerMessage, StartMessage, WorkerCheckin};
use longshore_bundle::unix_now;

use crate::config::WorkerConfig;
use crate::run_manager::RunManager;
use crate::service::BundleService;

/// Protocol version reported at checkin.
pub const VERSION: u32 = 1;
/// After an exception, sleep this long so a broken configuration doesn't
/// hot-loop against the server.
const ERROR_BACKOFF_SECONDS: u64 = 60 * 60;

pub struct Worker {
    config: WorkerConfig,
    service: Arc<dyn BundleService>,
    run_manager: Arc<RunManager>,
    stop: AtomicBool,
    hostname: String,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        service: Arc<dyn BundleService>,
        run_manager: Arc<RunManager>,
    ) -> Self {
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        Worker {
            config,
            service,
            run_manager,
            stop: AtomicBool::new(false),
            hostname,
        }
    }

    pub fn signal(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Runs until signalled (or until idle, when configured to exit then).
    pub async fn start(&self) -> std::io::Result<()> {
        self.run_manager.start().await?;
        let mut last_checkin_successful = false;
        while !self.stop.load(Ordering::SeqCst) {
            let tick = async {
                self.run_manager.process_runs().await;
                self.run_manager.save_state()?;
                self.checkin().await?;
                self.run_manager.save_state()?;
                Ok::<(), std::io::Error>(())
            }
            .await;

            match tick {
                Ok(()) => {
                    if !last_checkin_successful {
                        info!("connected, successful checkin");
                    }
                    last_checkin_successful = true;
                    if self.config.exit_when_idle && self.run_manager.all_runs().is_empty() {
                        info!("idle, exiting");
                        break;
                    }
                    tokio::time::sleep(std::time::Duration::from_secs(
                        self.config.checkin_interval,
                    ))
                    .await;
                }
                Err(e) => {
                    last_checkin_successful = false;
                    error!(err=%e, "checkin loop error, sleeping for an hour");
                    tokio::time::sleep(std::time::Duration::from_secs(ERROR_BACKOFF_SECONDS))
                        .await;
                }
            }
        }
        self.run_manager.stop().await;
        Ok(())
    }

    /// One checkin: post the worker's state, handle at most one directive.
    pub async fn checkin(&self) -> std::io::Result<()> {
        let checkin = WorkerCheckin {
            version: VERSION,
            tag: self.config.tag.clone(),
            tag_exclusive: self.config.tag_exclusive,
            group_name: self.config.group_name.clone(),
            cpus: self.run_manager.cpus(),
            gpus: self.run_manager.gpus(),
            memory_bytes: self.run_manager.memory_bytes(),
            free_disk_bytes: self.run_manager.free_disk_bytes(),
            dependencies: self.run_manager.all_dependencies(),
            hostname: self.hostname.clone(),
            runs: self.run_manager.all_runs(),
            shared_file_system: self.config.shared_file_system,
            exit_after_num_runs: self.config.exit_after_num_runs,
            is_terminating: self.stop.load(Ordering::SeqCst),
        };
        let response = self
            .service
            .checkin(&self.config.worker_id, checkin)
            .await
            .map_err(std::io::Error::other)?;
        let Some(message) = response else {
            return Ok(());
        };
        debug!(?message, "received directive");
        match message {
            ServerMessage::Run { bundle, resources } => {
                // Re-confirm the assignment; the scheduler may have
                // restaged the bundle since the message was queued.
                let start = StartMessage {
                    hostname: self.hostname.clone(),
                    start_time: unix_now(),
                };
                match self
                    .service
                    .start_bundle(&self.config.worker_id, &bundle.uuid, &start)
                    .await
                {
                    Ok(true) => self.run_manager.create_run(*bundle, resources),
                    Ok(false) => {
                        info!(uuid=%bundle.uuid, "bundle no longer assigned to this worker")
                    }
                    Err(e) => error!(uuid=%bundle.uuid, err=%e, "cannot confirm run start"),
                }
            }
            ServerMessage::Read {
                uuid,
                path,
                read_args,
                socket_id,
            } => {
                self.run_manager
                    .read(&uuid, &path, read_args, &socket_id)
                    .await;
            }
            ServerMessage::Netcat {
                uuid,
                port,
                message,
                socket_id,
            } => {
                self.run_manager
                    .netcat(&uuid, port, &message, &socket_id)
                    .await;
            }
            ServerMessage::Write {
                uuid,
                subpath,
                string,
            } => {
                if let Err(e) = self.run_manager.write(&uuid, &subpath, &string).await {
                    error!(uuid=%uuid, err=%e, "write directive failed");
                }
            }
            ServerMessage::Kill { uuid } => self.run_manager.kill(&uuid),
            ServerMessage::MarkFinalized { uuid } => self.run_manager.mark_finalized(&uuid),
        }
        Ok(())
    }
}
