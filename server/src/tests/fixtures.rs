//! Shared scaffolding: a manager over the in-memory model, plus builders
//! for bundles and worker checkins.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use longshore_bundle::messages::WorkerCheckin;
use longshore_bundle::{unix_now, BundleInfo, BundleMetadata, BundleState, BundleType, Dependency};

use crate::auth::AllowAll;
use crate::config::ServerConfig;
use crate::manager::BundleManager;
use crate::model::{MemoryModel, UserInfo};

pub const ROOT_USER: &str = "0";
pub const OWNER: &str = "user-1";

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub fn generate_uuid() -> String {
    format!("0x{:031x}", NEXT_ID.fetch_add(1, Ordering::SeqCst))
}

pub fn test_config() -> ServerConfig {
    ServerConfig {
        max_request_time: Some(10 * 24 * 60 * 60),
        max_request_memory: Some(64 << 30),
        max_request_disk: Some(10 << 30),
        default_cpu_image: Some("longshore/default-cpu:latest".into()),
        default_gpu_image: Some("longshore/default-gpu:latest".into()),
        ..Default::default()
    }
}

pub fn setup() -> (Arc<MemoryModel>, BundleManager) {
    setup_with_config(test_config())
}

pub fn setup_with_config(config: ServerConfig) -> (Arc<MemoryModel>, BundleManager) {
    let model = Arc::new(MemoryModel::new(ROOT_USER));
    model.save_user(UserInfo {
        user_id: OWNER.into(),
        disk_quota: 100 << 30,
        disk_used: 0,
        time_quota: 365 * 24 * 60 * 60,
        time_used: 0,
        parallel_run_quota: 10,
    });
    let manager = BundleManager::new(model.clone(), model.clone(), Arc::new(AllowAll), config);
    (model, manager)
}

pub fn run_bundle(state: BundleState) -> BundleInfo {
    BundleInfo {
        uuid: generate_uuid(),
        bundle_type: BundleType::Run,
        owner_id: OWNER.into(),
        command: "echo hello".into(),
        state,
        is_frozen: false,
        is_anonymous: false,
        data_hash: None,
        dependencies: vec![],
        metadata: BundleMetadata {
            request_cpus: Some(1),
            request_gpus: Some(0),
            request_memory: Some("1g".into()),
            created: Some(unix_now()),
            last_updated: Some(unix_now()),
            ..Default::default()
        },
        location: None,
    }
}

pub fn make_bundle(state: BundleState) -> BundleInfo {
    BundleInfo {
        uuid: generate_uuid(),
        bundle_type: BundleType::Make,
        owner_id: OWNER.into(),
        command: String::new(),
        state,
        is_frozen: false,
        is_anonymous: false,
        data_hash: None,
        dependencies: vec![],
        metadata: BundleMetadata {
            created: Some(unix_now()),
            ..Default::default()
        },
        location: None,
    }
}

pub fn depend_on(child: &mut BundleInfo, parent_uuid: &str, child_path: &str) {
    child.dependencies.push(Dependency {
        parent_uuid: parent_uuid.to_string(),
        parent_path: String::new(),
        child_uuid: child.uuid.clone(),
        child_path: child_path.to_string(),
        location: None,
    });
}

pub fn worker_checkin(cpus: u32, gpus: u32, memory_bytes: u64) -> WorkerCheckin {
    WorkerCheckin {
        version: 1,
        cpus,
        gpus,
        memory_bytes,
        free_disk_bytes: Some(1 << 40),
        hostname: "test-worker".into(),
        exit_after_num_runs: Some(999_999_999),
        ..Default::default()
    }
}

/// Registers a worker and returns its id.
pub async fn checkin_worker(model: &MemoryModel, user_id: &str, checkin: &WorkerCheckin) -> String {
    use crate::model::WorkerModel;
    let worker_id = generate_uuid();
    model
        .worker_checkin(user_id, &worker_id, checkin)
        .await
        .unwrap();
    worker_id
}
