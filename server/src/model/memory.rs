//! An in-memory implementation of the model traits, used by the test
//! suite and by single-process demo deployments.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use longshore_bundle::messages::{ServerMessage, WorkerCheckin};
use longshore_bundle::{
    fsutil, unix_now, BundleCheckinState, BundleInfo, BundleState, BundleType, RunStage,
    StageTimes,
};

use super::{BundleModel, BundleUpdate, UserInfo, UserPatch, Worker, WorkerModel, WorkerPatch};
use crate::Error;

#[derive(Default)]
struct Inner {
    bundles: HashMap<String, BundleInfo>,
    locations: HashMap<String, PathBuf>,
    users: HashMap<String, UserInfo>,
    workers: HashMap<String, Worker>,
    /// worker_run table: bundle uuid → (user_id, worker_id).
    claims: HashMap<String, (String, String)>,
    stage_times: HashMap<String, BTreeMap<RunStage, StageTimes>>,
    /// Latest reported container time per bundle, charged on finish.
    container_times: HashMap<String, u64>,
    /// Outcome reported by the worker for bundles that finished running.
    outcomes: HashMap<String, BundleState>,
}

/// Both model traits over plain maps.
pub struct MemoryModel {
    root_user_id: String,
    inner: RwLock<Inner>,
    /// Whether [WorkerModel::send_json_message] reports delivery success.
    deliverable: AtomicBool,
    sent: Mutex<Vec<(String, ServerMessage)>>,
}

impl MemoryModel {
    pub fn new(root_user_id: impl Into<String>) -> Self {
        MemoryModel {
            root_user_id: root_user_id.into(),
            inner: RwLock::new(Inner::default()),
            deliverable: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn save_bundle(&self, bundle: BundleInfo) {
        self.inner
            .write()
            .bundles
            .insert(bundle.uuid.clone(), bundle);
    }

    pub fn save_user(&self, user: UserInfo) {
        self.inner.write().users.insert(user.user_id.clone(), user);
    }

    /// Overrides a worker's checkin time, for staleness tests.
    pub fn set_checkin_time(&self, worker_id: &str, checkin_time: u64) {
        if let Some(worker) = self.inner.write().workers.get_mut(worker_id) {
            worker.checkin_time = checkin_time;
        }
    }

    /// Whether delivery through [WorkerModel::send_json_message] succeeds.
    pub fn set_deliverable(&self, deliverable: bool) {
        self.deliverable.store(deliverable, Ordering::SeqCst);
    }

    /// Messages sent so far, in order.
    pub fn sent_messages(&self) -> Vec<(String, ServerMessage)> {
        self.sent.lock().clone()
    }

    /// The worker currently claiming `uuid`, if any.
    pub fn claim_of(&self, uuid: &str) -> Option<(String, String)> {
        self.inner.read().claims.get(uuid).cloned()
    }

    fn user_or_default(inner: &Inner, user_id: &str) -> UserInfo {
        inner.users.get(user_id).cloned().unwrap_or(UserInfo {
            user_id: user_id.to_string(),
            disk_quota: u64::MAX / 2,
            disk_used: 0,
            time_quota: u64::MAX / 2,
            time_used: 0,
            parallel_run_quota: i64::MAX / 2,
        })
    }

    fn release_claim(inner: &mut Inner, uuid: &str) {
        if let Some((_, worker_id)) = inner.claims.remove(uuid) {
            if let Some(worker) = inner.workers.get_mut(&worker_id) {
                worker.run_uuids.remove(uuid);
            }
        }
    }
}

#[async_trait]
impl BundleModel for MemoryModel {
    async fn batch_get_bundles(
        &self,
        states: &[BundleState],
        bundle_type: Option<BundleType>,
    ) -> Result<Vec<BundleInfo>, Error> {
        let inner = self.inner.read();
        let mut bundles: Vec<_> = inner
            .bundles
            .values()
            .filter(|b| states.contains(&b.state))
            .filter(|b| bundle_type.map_or(true, |t| b.bundle_type == t))
            .cloned()
            .collect();
        // Deterministic snapshot order; the scheduler applies its own.
        bundles.sort_by(|a, b| {
            let created = |x: &BundleInfo| x.metadata.created.unwrap_or(0);
            created(a).cmp(&created(b)).then(a.uuid.cmp(&b.uuid))
        });
        Ok(bundles)
    }

    async fn batch_get_bundles_by_uuid(&self, uuids: &[String]) -> Result<Vec<BundleInfo>, Error> {
        let inner = self.inner.read();
        Ok(uuids
            .iter()
            .filter_map(|uuid| inner.bundles.get(uuid).cloned())
            .collect())
    }

    async fn get_bundle(&self, uuid: &str) -> Result<BundleInfo, Error> {
        self.inner
            .read()
            .bundles
            .get(uuid)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("bundle {}", uuid)))
    }

    async fn update_bundle(&self, bundle: &BundleInfo, update: BundleUpdate) -> Result<(), Error> {
        let mut inner = self.inner.write();
        let row = inner
            .bundles
            .get_mut(&bundle.uuid)
            .ok_or_else(|| Error::NotFound(format!("bundle {}", bundle.uuid)))?;
        if let Some(state) = update.state {
            row.state = state;
        }
        update.metadata.apply(&mut row.metadata);
        Ok(())
    }

    async fn transition_bundle_starting(
        &self,
        bundle: &BundleInfo,
        user_id: &str,
        worker_id: &str,
    ) -> Result<bool, Error> {
        let mut inner = self.inner.write();
        if inner.claims.contains_key(&bundle.uuid) {
            return Ok(false);
        }
        match inner.bundles.get_mut(&bundle.uuid) {
            Some(row) if row.state == BundleState::Staged => {
                row.state = BundleState::Starting;
                row.metadata.last_updated = Some(unix_now());
                row.metadata.remote = Some(worker_id.to_string());
            }
            _ => return Ok(false),
        }
        inner.claims.insert(
            bundle.uuid.clone(),
            (user_id.to_string(), worker_id.to_string()),
        );
        if let Some(worker) = inner.workers.get_mut(worker_id) {
            worker.run_uuids.insert(bundle.uuid.clone());
        }
        Ok(true)
    }

    async fn transition_bundle_staged(&self, bundle: &BundleInfo) -> Result<bool, Error> {
        let mut inner = self.inner.write();
        let transitioned = match inner.bundles.get_mut(&bundle.uuid) {
            Some(row)
                if matches!(
                    row.state,
                    BundleState::Starting | BundleState::Preparing | BundleState::Running
                ) =>
            {
                row.state = BundleState::Staged;
                true
            }
            _ => false,
        };
        if transitioned {
            Self::release_claim(&mut inner, &bundle.uuid);
        }
        Ok(transitioned)
    }

    async fn transition_bundle_worker_offline(&self, bundle: &BundleInfo) -> Result<bool, Error> {
        let mut inner = self.inner.write();
        match inner.bundles.get_mut(&bundle.uuid) {
            Some(row)
                if matches!(
                    row.state,
                    BundleState::Preparing | BundleState::Running | BundleState::Finalizing
                ) =>
            {
                row.state = BundleState::WorkerOffline;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn transition_bundle_finished(
        &self,
        bundle: &BundleInfo,
        _location: &Path,
    ) -> Result<bool, Error> {
        let mut inner = self.inner.write();
        let outcome = inner.outcomes.get(&bundle.uuid).copied();
        let times = inner.stage_times.get(&bundle.uuid).cloned();
        match inner.bundles.get_mut(&bundle.uuid) {
            Some(row) if row.state == BundleState::Finalizing => {
                row.state = outcome.unwrap_or(match row.metadata.exitcode {
                    Some(0) | None => BundleState::Ready,
                    Some(_) => BundleState::Failed,
                });
                if let Some(times) = times {
                    let elapsed = |stage: RunStage| times.get(&stage).map(|t| t.elapsed);
                    row.metadata.time_preparing = elapsed(RunStage::Preparing);
                    row.metadata.time_running = elapsed(RunStage::Running);
                    row.metadata.time_cleaning_up = elapsed(RunStage::CleaningUp);
                    row.metadata.time_uploading_results = elapsed(RunStage::UploadingResults);
                }
            }
            _ => return Ok(false),
        }
        // Charge the run's container time against the owner's quota.
        if let Some(time) = inner.container_times.remove(&bundle.uuid) {
            let user = Self::user_or_default(&inner, &bundle.owner_id);
            let user = inner
                .users
                .entry(bundle.owner_id.clone())
                .or_insert(user);
            user.time_used += time;
        }
        Self::release_claim(&mut inner, &bundle.uuid);
        Ok(true)
    }

    async fn bundle_checkin(
        &self,
        checkin: &BundleCheckinState,
        _user_id: &str,
        worker_id: &str,
    ) -> Result<bool, Error> {
        let mut inner = self.inner.write();
        inner
            .stage_times
            .insert(checkin.uuid.clone(), checkin.stage_times.clone());
        inner
            .container_times
            .insert(checkin.uuid.clone(), checkin.container_time_total);
        if checkin.state.is_final() || checkin.is_killed {
            let outcome = if checkin.is_killed {
                BundleState::Killed
            } else if matches!(checkin.exitcode, Some(0) | None) {
                BundleState::Ready
            } else {
                BundleState::Failed
            };
            inner.outcomes.insert(checkin.uuid.clone(), outcome);
        }
        match inner.bundles.get_mut(&checkin.uuid) {
            Some(row) => {
                if !row.state.is_final() {
                    row.state = match checkin.state {
                        BundleState::Preparing | BundleState::Running | BundleState::Finalizing => {
                            checkin.state
                        }
                        _ => row.state,
                    };
                }
                row.metadata.last_updated = Some(unix_now());
                row.metadata.run_status = Some(checkin.run_status.clone());
                row.metadata.remote = Some(worker_id.to_string());
                row.metadata.exitcode = checkin.exitcode;
                if let Some(image) = &checkin.docker_image {
                    row.metadata.docker_image = Some(image.clone());
                }
                if let Some(message) = &checkin.failure_message {
                    row.metadata.failure_message = Some(message.clone());
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_bundle_metadata(
        &self,
        uuids: &[String],
        key: &str,
    ) -> Result<HashMap<String, String>, Error> {
        let inner = self.inner.read();
        let mut out = HashMap::new();
        for uuid in uuids {
            let Some(bundle) = inner.bundles.get(uuid) else {
                continue;
            };
            let value = match key {
                "link_url" => bundle.metadata.link_url.clone(),
                "failure_message" => bundle.metadata.failure_message.clone(),
                "staged_status" => bundle.metadata.staged_status.clone(),
                "time_preparing" => bundle.metadata.time_preparing.map(|v| v.to_string()),
                "time_running" => bundle.metadata.time_running.map(|v| v.to_string()),
                "time_cleaning_up" => bundle.metadata.time_cleaning_up.map(|v| v.to_string()),
                "time_uploading_results" => {
                    bundle.metadata.time_uploading_results.map(|v| v.to_string())
                }
                other => bundle
                    .metadata
                    .extra
                    .get(other)
                    .map(|v| v.to_string().trim_matches('"').to_string()),
            };
            if let Some(value) = value {
                out.insert(uuid.clone(), value);
            }
        }
        Ok(out)
    }

    async fn get_bundle_location(&self, uuid: &str) -> Result<PathBuf, Error> {
        let inner = self.inner.read();
        if let Some(location) = inner.locations.get(uuid) {
            return Ok(location.clone());
        }
        // Known bundles get a deterministic default location, like a real
        // bundle store computing paths from the uuid.
        if inner.bundles.contains_key(uuid) {
            Ok(std::env::temp_dir().join("longshore-bundles").join(uuid))
        } else {
            Err(Error::NotFound(format!("no location for bundle {}", uuid)))
        }
    }

    async fn add_bundle_location(&self, uuid: &str, location: PathBuf) -> Result<(), Error> {
        self.inner
            .write()
            .locations
            .insert(uuid.to_string(), location);
        Ok(())
    }

    async fn update_disk_metadata(
        &self,
        bundle: &BundleInfo,
        location: &Path,
        enforce_disk_quota: bool,
    ) -> Result<(), Error> {
        let size = fsutil::path_size(location)?;
        let mut inner = self.inner.write();
        if enforce_disk_quota {
            let user = Self::user_or_default(&inner, &bundle.owner_id);
            if size > user.disk_quota_left() {
                return Err(Error::InvalidRequest(format!(
                    "Bundle of size {} exceeds remaining disk quota of {}",
                    size,
                    user.disk_quota_left()
                )));
            }
        }
        if let Some(row) = inner.bundles.get_mut(&bundle.uuid) {
            row.metadata.data_size = Some(size);
        }
        Ok(())
    }

    async fn get_user_info(&self, user_id: &str) -> Result<UserInfo, Error> {
        Ok(Self::user_or_default(&self.inner.read(), user_id))
    }

    async fn update_user_info(&self, user_id: &str, patch: UserPatch) -> Result<(), Error> {
        let mut inner = self.inner.write();
        let user = Self::user_or_default(&inner, user_id);
        let user = inner.users.entry(user_id.to_string()).or_insert(user);
        if let Some(time) = patch.add_time_used {
            user.time_used += time;
        }
        if let Some(disk) = patch.add_disk_used {
            user.disk_used += disk;
        }
        Ok(())
    }

    async fn get_user_disk_quota_left(
        &self,
        user_id: &str,
        user_info: Option<&UserInfo>,
    ) -> Result<u64, Error> {
        match user_info {
            Some(info) => Ok(info.disk_quota_left()),
            None => Ok(Self::user_or_default(&self.inner.read(), user_id).disk_quota_left()),
        }
    }

    async fn get_user_time_quota_left(
        &self,
        user_id: &str,
        user_info: Option<&UserInfo>,
    ) -> Result<u64, Error> {
        match user_info {
            Some(info) => Ok(info.time_quota_left()),
            None => Ok(Self::user_or_default(&self.inner.read(), user_id).time_quota_left()),
        }
    }

    async fn get_user_parallel_run_quota_left(
        &self,
        user_id: &str,
        user_info: Option<&UserInfo>,
    ) -> Result<i64, Error> {
        let inner = self.inner.read();
        let quota = match user_info {
            Some(info) => info.parallel_run_quota,
            None => Self::user_or_default(&inner, user_id).parallel_run_quota,
        };
        // Runs by this user currently claimed by shared-pool workers.
        let in_flight = inner
            .claims
            .iter()
            .filter(|(uuid, (_, worker_id))| {
                inner
                    .workers
                    .get(worker_id)
                    .map_or(false, |w| w.user_id == self.root_user_id)
                    && inner
                        .bundles
                        .get(*uuid)
                        .map_or(false, |b| b.owner_id == user_id)
            })
            .count() as i64;
        Ok(quota - in_flight)
    }

    fn root_user_id(&self) -> &str {
        &self.root_user_id
    }
}

#[async_trait]
impl WorkerModel for MemoryModel {
    async fn get_workers(&self) -> Result<Vec<Worker>, Error> {
        let mut workers: Vec<_> = self.inner.read().workers.values().cloned().collect();
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        Ok(workers)
    }

    async fn worker_checkin(
        &self,
        user_id: &str,
        worker_id: &str,
        checkin: &WorkerCheckin,
    ) -> Result<(), Error> {
        let mut inner = self.inner.write();
        let run_uuids = inner
            .workers
            .get(worker_id)
            .map(|w| w.run_uuids.clone())
            .unwrap_or_default();
        inner.workers.insert(
            worker_id.to_string(),
            Worker {
                worker_id: worker_id.to_string(),
                user_id: user_id.to_string(),
                tag: checkin.tag.clone(),
                tag_exclusive: checkin.tag_exclusive,
                cpus: checkin.cpus,
                gpus: checkin.gpus,
                has_gpus: checkin.gpus > 0,
                memory_bytes: checkin.memory_bytes,
                free_disk_bytes: checkin.free_disk_bytes,
                run_uuids,
                dependencies: checkin.dependencies.iter().cloned().collect(),
                shared_file_system: checkin.shared_file_system,
                checkin_time: unix_now(),
                socket_id: format!("socket-{}", worker_id),
                exit_after_num_runs: checkin.exit_after_num_runs,
                is_terminating: checkin.is_terminating,
                hostname: checkin.hostname.clone(),
            },
        );
        Ok(())
    }

    async fn worker_cleanup(&self, _user_id: &str, worker_id: &str) -> Result<(), Error> {
        let mut inner = self.inner.write();
        inner.workers.remove(worker_id);
        inner
            .claims
            .retain(|_, (_, claimed_by)| claimed_by != worker_id);
        Ok(())
    }

    async fn update_workers(
        &self,
        _user_id: &str,
        worker_id: &str,
        patch: WorkerPatch,
    ) -> Result<(), Error> {
        let mut inner = self.inner.write();
        let worker = inner
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| Error::NotFound(format!("worker {}", worker_id)))?;
        if let Some(runs) = patch.exit_after_num_runs {
            worker.exit_after_num_runs = Some(runs);
        }
        Ok(())
    }

    async fn get_bundle_worker(&self, uuid: &str) -> Result<Option<Worker>, Error> {
        let inner = self.inner.read();
        Ok(inner
            .claims
            .get(uuid)
            .and_then(|(_, worker_id)| inner.workers.get(worker_id))
            .cloned())
    }

    async fn send_json_message(
        &self,
        socket_id: &str,
        message: &ServerMessage,
        _timeout: Duration,
    ) -> bool {
        self.sent
            .lock()
            .push((socket_id.to_string(), message.clone()));
        self.deliverable.load(Ordering::SeqCst)
    }
}
