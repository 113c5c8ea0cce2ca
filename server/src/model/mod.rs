//! The transactional store consumed by the manager, split into the bundle
//! table ([BundleModel]) and the worker fleet ([WorkerModel]). The manager
//! never touches storage directly; guarded `transition_*` operations take
//! the expected prior state so lost races are detected, not overwritten.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use longshore_bundle::messages::{ServerMessage, WorkerCheckin};
use longshore_bundle::{
    BundleCheckinState, BundleInfo, BundleMetadata, BundleState, BundleType, DependencyKey,
};

use crate::Error;

mod from_addr;
mod memory;

pub use from_addr::from_addr;
pub use memory::MemoryModel;

/// A worker as projected from the worker table.
#[derive(Clone, Debug, PartialEq)]
pub struct Worker {
    pub worker_id: String,
    /// The owning user; workers owned by the root user form the shared pool.
    pub user_id: String,
    pub tag: Option<String>,
    pub tag_exclusive: bool,
    pub cpus: u32,
    pub gpus: u32,
    /// Whether the machine has any GPUs at all, even if all are allocated.
    pub has_gpus: bool,
    pub memory_bytes: u64,
    pub free_disk_bytes: Option<u64>,
    /// Bundles currently claimed by this worker.
    pub run_uuids: BTreeSet<String>,
    /// Dependency keys present in this worker's cache.
    pub dependencies: BTreeSet<DependencyKey>,
    pub shared_file_system: bool,
    /// Seconds since the epoch of the last checkin.
    pub checkin_time: u64,
    /// Reply channel for out-of-band directives.
    pub socket_id: String,
    pub exit_after_num_runs: Option<i64>,
    pub is_terminating: bool,
    pub hostname: String,
}

/// Identity and quota record for a user.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UserInfo {
    pub user_id: String,
    pub disk_quota: u64,
    pub disk_used: u64,
    pub time_quota: u64,
    pub time_used: u64,
    pub parallel_run_quota: i64,
}

impl UserInfo {
    pub fn disk_quota_left(&self) -> u64 {
        self.disk_quota.saturating_sub(self.disk_used)
    }

    pub fn time_quota_left(&self) -> u64 {
        self.time_quota.saturating_sub(self.time_used)
    }
}

/// A partial update of a bundle's mutable metadata. Unset fields are left
/// untouched.
#[derive(Clone, Debug, Default)]
pub struct MetadataPatch {
    pub failure_message: Option<String>,
    pub error_traceback: Option<String>,
    pub staged_status: Option<String>,
    pub run_status: Option<String>,
    pub data_size: Option<u64>,
    pub last_updated: Option<u64>,
    pub remote: Option<String>,
    pub remote_history: Option<Vec<String>>,
    pub exitcode: Option<i32>,
    pub docker_image: Option<String>,
}

impl MetadataPatch {
    pub fn apply(&self, metadata: &mut BundleMetadata) {
        if let Some(v) = &self.failure_message {
            metadata.failure_message = Some(v.clone());
        }
        if let Some(v) = &self.error_traceback {
            metadata.error_traceback = Some(v.clone());
        }
        if let Some(v) = &self.staged_status {
            metadata.staged_status = Some(v.clone());
        }
        if let Some(v) = &self.run_status {
            metadata.run_status = Some(v.clone());
        }
        if let Some(v) = self.data_size {
            metadata.data_size = Some(v);
        }
        if let Some(v) = self.last_updated {
            metadata.last_updated = Some(v);
        }
        if let Some(v) = &self.remote {
            metadata.remote = Some(v.clone());
        }
        if let Some(v) = &self.remote_history {
            metadata.remote_history = v.clone();
        }
        if let Some(v) = self.exitcode {
            metadata.exitcode = Some(v);
        }
        if let Some(v) = &self.docker_image {
            metadata.docker_image = Some(v.clone());
        }
    }
}

/// A partial update of a bundle row: state and/or metadata.
#[derive(Clone, Debug, Default)]
pub struct BundleUpdate {
    pub state: Option<BundleState>,
    pub metadata: MetadataPatch,
}

impl BundleUpdate {
    pub fn state(state: BundleState) -> Self {
        BundleUpdate {
            state: Some(state),
            ..Default::default()
        }
    }

    pub fn failed(failure_message: impl Into<String>) -> Self {
        BundleUpdate {
            state: Some(BundleState::Failed),
            metadata: MetadataPatch {
                failure_message: Some(failure_message.into()),
                ..Default::default()
            },
        }
    }
}

/// A partial update of a worker row.
#[derive(Clone, Debug, Default)]
pub struct WorkerPatch {
    pub exit_after_num_runs: Option<i64>,
}

/// Additive quota-usage charges against a user.
#[derive(Clone, Debug, Default)]
pub struct UserPatch {
    pub add_time_used: Option<u64>,
    pub add_disk_used: Option<u64>,
}

/// The bundle table.
#[async_trait]
pub trait BundleModel: Send + Sync {
    /// Snapshot query by state (and optionally type).
    async fn batch_get_bundles(
        &self,
        states: &[BundleState],
        bundle_type: Option<BundleType>,
    ) -> Result<Vec<BundleInfo>, Error>;

    /// Snapshot query by uuid; unknown uuids are silently absent.
    async fn batch_get_bundles_by_uuid(&self, uuids: &[String]) -> Result<Vec<BundleInfo>, Error>;

    async fn get_bundle(&self, uuid: &str) -> Result<BundleInfo, Error>;

    async fn update_bundle(&self, bundle: &BundleInfo, update: BundleUpdate) -> Result<(), Error>;

    /// STAGED → STARTING, claiming the bundle for `(user_id, worker_id)`.
    /// Returns false when the bundle is no longer STAGED or already claimed.
    async fn transition_bundle_starting(
        &self,
        bundle: &BundleInfo,
        user_id: &str,
        worker_id: &str,
    ) -> Result<bool, Error>;

    /// Back to STAGED, clearing the worker claim. Returns false when the
    /// bundle has left the claimed states in the meantime.
    async fn transition_bundle_staged(&self, bundle: &BundleInfo) -> Result<bool, Error>;

    async fn transition_bundle_worker_offline(&self, bundle: &BundleInfo) -> Result<bool, Error>;

    /// Persists the finish of a FINALIZING bundle: final state per the
    /// reported outcome, per-stage times, and the bundle-store finish hook
    /// for `location`.
    async fn transition_bundle_finished(
        &self,
        bundle: &BundleInfo,
        location: &std::path::Path,
    ) -> Result<bool, Error>;

    /// A worker's per-bundle progress report, routed through the manager.
    async fn bundle_checkin(
        &self,
        checkin: &BundleCheckinState,
        user_id: &str,
        worker_id: &str,
    ) -> Result<bool, Error>;

    /// Bulk fetch of one metadata key as strings.
    async fn get_bundle_metadata(
        &self,
        uuids: &[String],
        key: &str,
    ) -> Result<HashMap<String, String>, Error>;

    async fn get_bundle_location(&self, uuid: &str) -> Result<PathBuf, Error>;

    async fn add_bundle_location(&self, uuid: &str, location: PathBuf) -> Result<(), Error>;

    /// Recomputes a bundle's on-disk size; with `enforce_disk_quota`, fails
    /// when the owner's remaining quota cannot hold it.
    async fn update_disk_metadata(
        &self,
        bundle: &BundleInfo,
        location: &std::path::Path,
        enforce_disk_quota: bool,
    ) -> Result<(), Error>;

    async fn get_user_info(&self, user_id: &str) -> Result<UserInfo, Error>;

    /// Charges quota usage to a user (time on finish, disk on upload).
    async fn update_user_info(&self, user_id: &str, patch: UserPatch) -> Result<(), Error>;

    async fn get_user_disk_quota_left(
        &self,
        user_id: &str,
        user_info: Option<&UserInfo>,
    ) -> Result<u64, Error>;

    async fn get_user_time_quota_left(
        &self,
        user_id: &str,
        user_info: Option<&UserInfo>,
    ) -> Result<u64, Error>;

    /// Remaining parallel-run budget on the shared pool for this user.
    async fn get_user_parallel_run_quota_left(
        &self,
        user_id: &str,
        user_info: Option<&UserInfo>,
    ) -> Result<i64, Error>;

    /// The user owning the shared worker pool.
    fn root_user_id(&self) -> &str;
}

/// The worker fleet table plus the out-of-band directive channel.
#[async_trait]
pub trait WorkerModel: Send + Sync {
    async fn get_workers(&self) -> Result<Vec<Worker>, Error>;

    /// Upserts a worker row from its checkin payload.
    async fn worker_checkin(
        &self,
        user_id: &str,
        worker_id: &str,
        checkin: &WorkerCheckin,
    ) -> Result<(), Error>;

    /// Removes a dead worker and releases its bundle claims.
    async fn worker_cleanup(&self, user_id: &str, worker_id: &str) -> Result<(), Error>;

    async fn update_workers(
        &self,
        user_id: &str,
        worker_id: &str,
        patch: WorkerPatch,
    ) -> Result<(), Error>;

    /// The worker currently claiming `uuid`, if any.
    async fn get_bundle_worker(&self, uuid: &str) -> Result<Option<Worker>, Error>;

    /// Delivers a directive to a worker socket, waiting up to `timeout`
    /// for the worker to take it. Returns whether delivery succeeded.
    async fn send_json_message(
        &self,
        socket_id: &str,
        message: &ServerMessage,
        timeout: Duration,
    ) -> bool;
}
