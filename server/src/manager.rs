//! The central bundle manager loop: stage created bundles, assemble make
//! bundles, schedule run bundles onto workers and reap bundles nobody has
//! heard from in a very long time.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};

use longshore_bundle::fsutil::{normalize_path, path_is_contained, remove_path};
use longshore_bundle::{unix_now, BundleInfo, BundleState, BundleType};

use crate::access::WorkerInfoAccessor;
use crate::auth::Authorizer;
use crate::config::ServerConfig;
use crate::model::{BundleModel, BundleUpdate, MetadataPatch, WorkerModel};
use crate::Error;

const SECONDS_PER_DAY: u64 = 60 * 60 * 24;
/// Fail unresponsive bundles in uploading, staged and running state after
/// this many days.
pub const BUNDLE_TIMEOUT_DAYS: u64 = 60;
/// A STARTING bundle whose run message went missing is restaged after this.
const STARTING_STALE_SECONDS: u64 = 5 * 60;
/// The unresponsive-bundle sweep scans the whole table; amortize it.
const UNRESPONSIVE_SWEEP_INTERVAL: u64 = SECONDS_PER_DAY;
/// Bound on concurrently assembling make bundles.
const MAX_CONCURRENT_MAKES: usize = 16;

pub struct BundleManager {
    pub(crate) model: Arc<dyn BundleModel>,
    pub(crate) worker_model: Arc<dyn WorkerModel>,
    pub(crate) auth: Arc<dyn Authorizer>,
    pub(crate) config: ServerConfig,

    /// Make bundles currently being assembled by this process.
    make_uuids: Arc<Mutex<HashSet<String>>>,
    make_tasks: Mutex<Vec<JoinHandle<()>>>,
    make_permits: Arc<Semaphore>,
    exiting: AtomicBool,
    last_unresponsive_sweep: Mutex<Option<u64>>,
}

impl BundleManager {
    pub fn new(
        model: Arc<dyn BundleModel>,
        worker_model: Arc<dyn WorkerModel>,
        auth: Arc<dyn Authorizer>,
        config: ServerConfig,
    ) -> Self {
        BundleManager {
            model,
            worker_model,
            auth,
            config,
            make_uuids: Arc::new(Mutex::new(HashSet::new())),
            make_tasks: Mutex::new(Vec::new()),
            make_permits: Arc::new(Semaphore::new(MAX_CONCURRENT_MAKES)),
            exiting: AtomicBool::new(false),
            last_unresponsive_sweep: Mutex::new(None),
        }
    }

    /// Runs the manager until [signal](Self::signal) is called, ticking
    /// every `sleep_time`. A failed tick is logged and retried on the next
    /// interval; shutdown waits for in-flight make assemblies.
    pub async fn run(&self, sleep_time: Duration) {
        info!("bundle manager running");
        while !self.exiting.load(Ordering::SeqCst) {
            if let Err(e) = self.tick().await {
                error!(err=%e, "manager tick failed");
            }
            tokio::time::sleep(sleep_time).await;
        }
        let tasks: Vec<_> = self.make_tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!(err=%e, "make task panicked");
            }
        }
        info!("bundle manager stopped");
    }

    pub fn signal(&self) {
        self.exiting.store(true, Ordering::SeqCst);
    }

    /// One iteration of the manager. Step order matters: freshly staged
    /// bundles become schedulable within the same tick.
    pub async fn tick(&self) -> Result<(), Error> {
        self.stage_bundles().await?;
        self.make_bundles().await?;
        self.schedule_run_bundles().await?;
        self.fail_unresponsive_bundles().await?;
        self.make_tasks.lock().retain(|task| !task.is_finished());
        Ok(())
    }

    /// Fails CREATED bundles with missing, unreadable or failed parents and
    /// stages the ones whose parents are all in an acceptable state.
    #[instrument(skip(self))]
    pub(crate) async fn stage_bundles(&self) -> Result<(), Error> {
        let bundles = self
            .model
            .batch_get_bundles(&[BundleState::Created], None)
            .await?;
        let parent_uuids: Vec<String> = bundles
            .iter()
            .flat_map(|b| b.dependencies.iter().map(|d| d.parent_uuid.clone()))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let parents = self.model.batch_get_bundles_by_uuid(&parent_uuids).await?;
        let parent_states: std::collections::HashMap<&str, BundleState> =
            parents.iter().map(|p| (p.uuid.as_str(), p.state)).collect();

        let mut to_fail: Vec<(BundleInfo, String)> = Vec::new();
        let mut to_stage: Vec<BundleInfo> = Vec::new();
        for bundle in bundles {
            let wanted: Vec<String> = bundle
                .dependency_keys()
                .map(|k| k.parent_uuid)
                .collect::<HashSet<_>>()
                .into_iter()
                .collect();

            let mut missing: Vec<&String> = wanted
                .iter()
                .filter(|uuid| !parent_states.contains_key(uuid.as_str()))
                .collect();
            if !missing.is_empty() {
                missing.sort();
                let message = format!(
                    "Missing parent bundles: {}",
                    missing
                        .iter()
                        .map(|s| s.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                );
                to_fail.push((bundle, message));
                continue;
            }

            if let Err(message) = self.auth.can_read(&bundle.owner_id, &wanted) {
                to_fail.push((bundle, message));
                continue;
            }

            let states: Vec<(&String, BundleState)> = wanted
                .iter()
                .map(|uuid| (uuid, parent_states[uuid.as_str()]))
                .collect();

            if !bundle.metadata.allow_failed_dependencies {
                let mut failed: Vec<&str> = states
                    .iter()
                    .filter(|(_, s)| *s == BundleState::Failed)
                    .map(|(uuid, _)| uuid.as_str())
                    .collect();
                let mut killed: Vec<&str> = states
                    .iter()
                    .filter(|(_, s)| *s == BundleState::Killed)
                    .map(|(uuid, _)| uuid.as_str())
                    .collect();
                failed.sort();
                killed.sort();
                if !failed.is_empty() || !killed.is_empty() {
                    let mut message = String::new();
                    if !failed.is_empty() {
                        message += &format!("Parent bundles failed: {} ", failed.join(", "));
                    }
                    if !killed.is_empty() {
                        message += &format!("Parent bundles were killed: {} ", killed.join(", "));
                    }
                    message += "(Please use the --allow-failed-dependencies flag to depend on \
                                results of failed or killed bundles)";
                    to_fail.push((bundle, message));
                    continue;
                }
            }

            let allow_failed = bundle.metadata.allow_failed_dependencies;
            let acceptable = move |state: BundleState| {
                state == BundleState::Ready
                    || (allow_failed
                        && matches!(state, BundleState::Failed | BundleState::Killed))
            };
            if states.iter().all(|(_, state)| acceptable(*state)) {
                to_stage.push(bundle);
            }
        }

        for (bundle, message) in to_fail {
            info!(uuid=%bundle.uuid, message=%message, "failing bundle");
            self.model
                .update_bundle(&bundle, BundleUpdate::failed(message))
                .await?;
        }
        for bundle in to_stage {
            info!(uuid=%bundle.uuid, "staging bundle");
            self.model
                .update_bundle(
                    &bundle,
                    BundleUpdate {
                        state: Some(BundleState::Staged),
                        metadata: MetadataPatch {
                            staged_status: Some(
                                "Bundle's dependencies are all ready. Waiting for the bundle \
                                 to be assigned to a worker to be run."
                                    .to_string(),
                            ),
                            ..Default::default()
                        },
                    },
                )
                .await?;
        }
        Ok(())
    }

    /// Restages MAKING bundles orphaned by a manager restart, then kicks
    /// off one assembly task per STAGED make bundle.
    #[instrument(skip(self))]
    pub(crate) async fn make_bundles(&self) -> Result<(), Error> {
        for bundle in self
            .model
            .batch_get_bundles(&[BundleState::Making], Some(BundleType::Make))
            .await?
        {
            if !self.make_uuids.lock().contains(&bundle.uuid) {
                info!(uuid=%bundle.uuid, "re-staging make bundle");
                self.model
                    .update_bundle(&bundle, BundleUpdate::state(BundleState::Staged))
                    .await?;
            }
        }

        for bundle in self
            .model
            .batch_get_bundles(&[BundleState::Staged], Some(BundleType::Make))
            .await?
        {
            info!(uuid=%bundle.uuid, "making bundle");
            self.model
                .update_bundle(&bundle, BundleUpdate::state(BundleState::Making))
                .await?;
            self.make_uuids.lock().insert(bundle.uuid.clone());

            let model = self.model.clone();
            let make_uuids = self.make_uuids.clone();
            let permits = self.make_permits.clone();
            let task = tokio::spawn(async move {
                let _permit = permits.acquire_owned().await.expect("semaphore closed");
                Self::make_bundle(model, bundle, make_uuids).await;
            });
            self.make_tasks.lock().push(task);
        }
        Ok(())
    }

    pub(crate) fn is_making_bundles(&self) -> bool {
        !self.make_uuids.lock().is_empty()
    }

    /// Assembles one make bundle and records the outcome on the bundle row.
    async fn make_bundle(
        model: Arc<dyn BundleModel>,
        bundle: BundleInfo,
        make_uuids: Arc<Mutex<HashSet<String>>>,
    ) {
        let result = Self::assemble_make_bundle(&*model, &bundle).await;
        let update = match &result {
            Ok(location) => match model.update_disk_metadata(&bundle, location, true).await {
                Ok(()) => {
                    info!(uuid=%bundle.uuid, "finished making bundle");
                    BundleUpdate::state(BundleState::Ready)
                }
                Err(e) => {
                    info!(uuid=%bundle.uuid, err=%e, "failing bundle");
                    BundleUpdate::failed(e.to_string())
                }
            },
            Err(e) => {
                info!(uuid=%bundle.uuid, err=%e, "failing bundle");
                BundleUpdate {
                    state: Some(BundleState::Failed),
                    metadata: MetadataPatch {
                        failure_message: Some(e.to_string()),
                        error_traceback: Some(format!("{:?}", e)),
                        ..Default::default()
                    },
                }
            }
        };
        if let Err(e) = model.update_bundle(&bundle, update).await {
            error!(uuid=%bundle.uuid, err=%e, "could not record make outcome");
        }
        make_uuids.lock().remove(&bundle.uuid);
    }

    /// Copies each dependency under its `child_path` into a freshly created
    /// bundle directory, never following symlinks, and returns the bundle
    /// location. Source and destination paths must stay inside their
    /// respective bundle roots.
    async fn assemble_make_bundle(
        model: &dyn BundleModel,
        bundle: &BundleInfo,
    ) -> Result<std::path::PathBuf, Error> {
        let location = match &bundle.metadata.link_url {
            Some(url) => std::path::PathBuf::from(url),
            None => model.get_bundle_location(&bundle.uuid).await?,
        };
        let path = normalize_path(&location);

        let parent_uuids: Vec<String> = bundle
            .dependencies
            .iter()
            .map(|d| d.parent_uuid.clone())
            .collect();
        let parent_links = model.get_bundle_metadata(&parent_uuids, "link_url").await?;

        let mut deps: Vec<(std::path::PathBuf, std::path::PathBuf)> = Vec::new();
        for dep in &bundle.dependencies {
            let parent_base = match parent_links.get(&dep.parent_uuid) {
                Some(url) => std::path::PathBuf::from(url),
                None => model
                    .get_bundle_location(&dep.parent_uuid)
                    .await
                    .map_err(|_| invalid_dependency(dep))?,
            };
            let parent_base = normalize_path(&parent_base);
            let source = normalize_path(&parent_base.join(&dep.parent_path));
            if !source.starts_with(&parent_base) {
                return Err(invalid_dependency(dep));
            }
            let source_meta = std::fs::symlink_metadata(&source);
            if source_meta.is_err() {
                return Err(invalid_dependency(dep));
            }

            if !path_is_contained(&path, std::path::Path::new(&dep.child_path)) {
                return Err(Error::InvalidRequest(format!(
                    "Invalid key for dependency: {}",
                    dep.child_path
                )));
            }
            let dest = normalize_path(&path.join(&dep.child_path));
            deps.push((source, dest));
        }

        remove_path(&path)?;
        if deps.len() == 1 && deps[0].1 == path {
            longshore_bundle::fsutil::copy_path(&deps[0].0, &path)?;
        } else {
            std::fs::create_dir_all(&path)?;
            for (source, dest) in &deps {
                longshore_bundle::fsutil::copy_path(source, dest)?;
            }
        }
        Ok(path)
    }

    /// Fails bundles stuck in uploading, staged or running state for more
    /// than [BUNDLE_TIMEOUT_DAYS]. The scan is amortized to one sweep per
    /// day.
    #[instrument(skip(self))]
    pub(crate) async fn fail_unresponsive_bundles(&self) -> Result<(), Error> {
        let now = unix_now();
        {
            let mut last = self.last_unresponsive_sweep.lock();
            if let Some(at) = *last {
                if now.saturating_sub(at) < UNRESPONSIVE_SWEEP_INTERVAL {
                    return Ok(());
                }
            }
            *last = Some(now);
        }

        let bundles = self
            .model
            .batch_get_bundles(
                &[
                    BundleState::Uploading,
                    BundleState::Staged,
                    BundleState::Running,
                ],
                None,
            )
            .await?;
        for bundle in bundles {
            let created = bundle.metadata.created.unwrap_or(now);
            if now.saturating_sub(created) > BUNDLE_TIMEOUT_DAYS * SECONDS_PER_DAY {
                let message = format!(
                    "Bundle has been stuck in {} state for more than {} days.",
                    bundle.state, BUNDLE_TIMEOUT_DAYS
                );
                info!(uuid=%bundle.uuid, message=%message, "failing bundle");
                self.model
                    .update_bundle(&bundle, BundleUpdate::failed(message))
                    .await?;
            }
        }
        Ok(())
    }

    /// The run-bundle half of the tick: reconcile the fleet, then validate
    /// and dispatch staged run bundles.
    #[instrument(skip(self))]
    pub(crate) async fn schedule_run_bundles(&self) -> Result<(), Error> {
        let accessor = WorkerInfoAccessor::new(
            self.worker_model.clone(),
            self.config.worker_timeout_seconds.saturating_sub(5),
        )
        .await?;

        self.cleanup_dead_workers(&accessor).await?;
        self.restage_stuck_starting_bundles(&accessor).await?;
        self.bring_offline_stuck_running_bundles(&accessor).await?;
        self.acknowledge_recently_finished_bundles(&accessor).await?;

        let mut user_info_cache = std::collections::HashMap::new();
        let staged = self.get_staged_bundles_to_run(&mut user_info_cache).await?;
        self.schedule_run_bundles_on_workers(&accessor, staged, &mut user_info_cache)
            .await
    }

    /// Removes workers we haven't heard from within the timeout; such
    /// workers probably died without checking out properly.
    pub(crate) async fn cleanup_dead_workers(
        &self,
        workers: &WorkerInfoAccessor,
    ) -> Result<(), Error> {
        let now = unix_now();
        for worker in workers.workers().await? {
            if now.saturating_sub(worker.checkin_time) > self.config.worker_timeout_seconds {
                info!(user_id=%worker.user_id, worker_id=%worker.worker_id, "cleaning up dead worker");
                self.worker_model
                    .worker_cleanup(&worker.user_id, &worker.worker_id)
                    .await?;
                workers.remove(&worker.worker_id).await?;
            }
        }
        Ok(())
    }

    /// Moves bundles stuck in STARTING back to STAGED so they can be
    /// scheduled again; the run message went missing.
    async fn restage_stuck_starting_bundles(
        &self,
        workers: &WorkerInfoAccessor,
    ) -> Result<(), Error> {
        let now = unix_now();
        for bundle in self
            .model
            .batch_get_bundles(&[BundleState::Starting], Some(BundleType::Run))
            .await?
        {
            let stale = match bundle.metadata.last_updated {
                Some(at) => now.saturating_sub(at) > STARTING_STALE_SECONDS,
                None => true,
            };
            if !workers.is_running(&bundle.uuid).await? || stale {
                info!(uuid=%bundle.uuid, "re-staging run bundle");
                if self.model.transition_bundle_staged(&bundle).await? {
                    workers.restage(&bundle.uuid).await?;
                }
            }
        }
        Ok(())
    }

    /// Moves RUNNING/PREPARING bundles nobody claims (or whose worker went
    /// quiet) to WORKER_OFFLINE; a returning worker can resume them.
    /// Preemptible bundles that already ran somewhere restage instead,
    /// keeping their history.
    async fn bring_offline_stuck_running_bundles(
        &self,
        workers: &WorkerInfoAccessor,
    ) -> Result<(), Error> {
        let now = unix_now();
        let active = self
            .model
            .batch_get_bundles(
                &[BundleState::Running, BundleState::Preparing],
                Some(BundleType::Run),
            )
            .await?;
        for bundle in active {
            let mut failure = None;
            if !workers.is_running(&bundle.uuid).await? {
                failure = Some("No worker claims bundle.");
            }
            if let Some(at) = bundle.metadata.last_updated {
                if now.saturating_sub(at) > self.config.worker_timeout_seconds {
                    failure = Some("Worker offline.");
                }
            }
            let Some(failure) = failure else { continue };
            if bundle.metadata.preemptible && !bundle.metadata.remote_history.is_empty() {
                info!(uuid=%bundle.uuid, reason=%failure, "re-staging preemptible bundle");
                self.model.transition_bundle_staged(&bundle).await?;
            } else {
                info!(uuid=%bundle.uuid, reason=%failure, "bringing bundle offline");
                self.model.transition_bundle_worker_offline(&bundle).await?;
            }
        }
        Ok(())
    }

    /// Tells workers about bundles whose finish has been persisted so they
    /// can discard the run information.
    async fn acknowledge_recently_finished_bundles(
        &self,
        _workers: &WorkerInfoAccessor,
    ) -> Result<(), Error> {
        for bundle in self
            .model
            .batch_get_bundles(&[BundleState::Finalizing], Some(BundleType::Run))
            .await?
        {
            let Some(worker) = self.worker_model.get_bundle_worker(&bundle.uuid).await? else {
                info!(uuid=%bundle.uuid, "bringing bundle offline: no worker claims bundle");
                self.model.transition_bundle_worker_offline(&bundle).await?;
                continue;
            };
            let message = longshore_bundle::messages::ServerMessage::MarkFinalized {
                uuid: bundle.uuid.clone(),
            };
            if self
                .worker_model
                .send_json_message(&worker.socket_id, &message, Duration::from_millis(200))
                .await
            {
                info!(uuid=%bundle.uuid, worker_id=%worker.worker_id, "acknowledged finalization");
                let location = self.model.get_bundle_location(&bundle.uuid).await?;
                self.model
                    .transition_bundle_finished(&bundle, &location)
                    .await?;
            } else {
                debug!(uuid=%bundle.uuid, worker_id=%worker.worker_id, "finalize ack not delivered");
            }
        }
        Ok(())
    }
}

fn invalid_dependency(dep: &longshore_bundle::Dependency) -> Error {
    Error::InvalidRequest(format!("Invalid dependency {}", dep.key()))
}
