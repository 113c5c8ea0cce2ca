//! Drives full runs through the state machine against the fake runtime:
//! the happy path, kills, ceilings, re-entrancy, crash resume and the
//! durable round trip of run state.

use std::sync::Arc;

use longshore_bundle::{BundleState, Dependency, RunStage};

use super::fixtures::*;
use crate::observer::NoopObserver;
use crate::run_manager::RunManager;
use crate::run_state::RunState;
use crate::runtime::ContainerRuntime;
use crate::service::{BundleService, MemoryBundleService, TargetKind};

async fn new_manager(
    dir: &std::path::Path,
    service: Arc<MemoryBundleService>,
    runtime: Arc<FakeRuntime>,
) -> Arc<RunManager> {
    let service: Arc<dyn BundleService> = service;
    Arc::new(
        RunManager::new(&test_config(dir), service, runtime, Arc::new(NoopObserver))
            .await
            .unwrap(),
    )
}

/// Ticks `process_runs` until the run reaches `stage` (or is gone, when
/// `stage` is FINISHED and the table has been swept).
async fn drive_until(manager: &RunManager, uuid: &str, stage: RunStage) -> Option<RunState> {
    for _ in 0..500 {
        manager.process_runs().await;
        match manager.get_run(uuid) {
            Some(run) if run.stage == stage => return Some(run),
            Some(_) => {}
            None => {
                assert_eq!(stage, RunStage::Finished, "run vanished before {}", stage);
                return None;
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!(
        "run {} never reached {} (currently {:?})",
        uuid,
        stage,
        manager.get_run(uuid).map(|r| r.stage)
    );
}

#[tokio::test]
async fn happy_path_runs_to_completion() {
    let dir = tempfile::tempdir().unwrap();
    let service = Arc::new(MemoryBundleService::new());
    let runtime = runtime_with_busybox();
    let manager = new_manager(dir.path(), service.clone(), runtime.clone()).await;

    let bundle = run_bundle();
    let uuid = bundle.uuid.clone();
    manager.create_run(bundle, small_resources());

    let run = drive_until(&manager, &uuid, RunStage::Running).await.unwrap();
    assert!(run.container_id.is_some());
    assert!(!run.cpuset.is_empty());
    assert_eq!(run.run_status, "Running job in Docker container");
    assert_eq!(run.server_state(), BundleState::Running);

    runtime.finish_container(run.container_id.as_deref().unwrap(), 0);
    let run = drive_until(&manager, &uuid, RunStage::Finalizing).await.unwrap();
    assert!(run.finished);
    assert_eq!(run.exitcode, Some(0));
    assert_eq!(run.server_state(), BundleState::Finalizing);
    // Results were uploaded along the way.
    assert!(service.uploaded_bytes(&uuid).unwrap() > 0);

    manager.mark_finalized(&uuid);
    drive_until(&manager, &uuid, RunStage::Finished).await;
    assert!(!manager.has_run(&uuid));
    assert!(runtime.running_container_ids().is_empty());
}

#[tokio::test]
async fn kill_interrupts_a_running_bundle() {
    let dir = tempfile::tempdir().unwrap();
    let service = Arc::new(MemoryBundleService::new());
    let runtime = runtime_with_busybox();
    let manager = new_manager(dir.path(), service, runtime.clone()).await;

    let bundle = run_bundle();
    let uuid = bundle.uuid.clone();
    manager.create_run(bundle, small_resources());
    drive_until(&manager, &uuid, RunStage::Running).await;

    manager.kill(&uuid);
    let run = drive_until(&manager, &uuid, RunStage::Finalizing).await.unwrap();
    assert!(run.is_killed);
    assert_eq!(run.kill_message.as_deref(), Some("Kill requested"));
    // A kill during upload aborts it, so the failure message is either the
    // kill reason or the aborted upload; the user sees a failure either
    // way.
    assert!(run.failure_message.is_some());
    assert_eq!(run.server_state(), BundleState::Finalizing);
    assert!(run.checkin_state("test-worker").is_killed);
}

#[tokio::test]
async fn memory_ceiling_kills_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let service = Arc::new(MemoryBundleService::new());
    let runtime = runtime_with_busybox();
    let manager = new_manager(dir.path(), service, runtime.clone()).await;

    let bundle = run_bundle();
    let uuid = bundle.uuid.clone();
    manager.create_run(bundle, small_resources());
    let run = drive_until(&manager, &uuid, RunStage::Running).await.unwrap();

    // Blow well past the 64m ceiling.
    runtime.set_container_memory(run.container_id.as_deref().unwrap(), 1 << 30);

    let run = drive_until(&manager, &uuid, RunStage::Finalizing).await.unwrap();
    assert!(run.is_killed);
    assert!(run
        .failure_message
        .as_deref()
        .unwrap()
        .contains("Memory limit"));
}

#[tokio::test]
async fn failed_image_fails_the_run_in_preparing() {
    let dir = tempfile::tempdir().unwrap();
    let service = Arc::new(MemoryBundleService::new());
    // No images at all, and pulls fail.
    let runtime = Arc::new(FakeRuntime::new());
    let manager = new_manager(dir.path(), service, runtime).await;

    let bundle = run_bundle();
    let uuid = bundle.uuid.clone();
    manager.create_run(bundle, small_resources());

    let run = drive_until(&manager, &uuid, RunStage::Finalizing).await.unwrap();
    assert!(run
        .failure_message
        .as_deref()
        .unwrap()
        .contains("Failed to download Docker image"));
    assert_eq!(run.server_state(), BundleState::Finalizing);
}

#[tokio::test]
async fn dependency_is_linked_then_released() {
    let dir = tempfile::tempdir().unwrap();
    let service = Arc::new(MemoryBundleService::new());
    let runtime = runtime_with_busybox();

    let mut bundle = run_bundle();
    let key = longshore_bundle::DependencyKey::new("0xparent", "");
    service.put_contents(key.clone(), TargetKind::File, b"training data".to_vec());
    bundle.dependencies.push(Dependency {
        parent_uuid: "0xparent".to_string(),
        parent_path: String::new(),
        child_uuid: bundle.uuid.clone(),
        child_path: "data".to_string(),
        location: None,
    });
    let uuid = bundle.uuid.clone();

    let manager = new_manager(dir.path(), service.clone(), runtime.clone()).await;
    manager.start().await.unwrap();
    manager.create_run(bundle, small_resources());

    let run = drive_until(&manager, &uuid, RunStage::Running).await.unwrap();
    // The dependency is mounted via a symlink pointing into the container.
    let link = run.bundle_path.join("data");
    assert!(std::fs::symlink_metadata(&link)
        .unwrap()
        .file_type()
        .is_symlink());
    assert_eq!(manager.all_dependencies(), vec![key.clone()]);

    runtime.finish_container(run.container_id.as_deref().unwrap(), 0);
    drive_until(&manager, &uuid, RunStage::Finalizing).await;
    // Released and unlinked during cleanup.
    assert!(std::fs::symlink_metadata(&link).is_err());
    manager.stop().await;
}

#[tokio::test]
async fn handlers_are_reentrant_while_waiting() {
    let dir = tempfile::tempdir().unwrap();
    let service = Arc::new(MemoryBundleService::new());
    let runtime = runtime_with_busybox();
    let manager = new_manager(dir.path(), service, runtime.clone()).await;

    let bundle = run_bundle();
    let uuid = bundle.uuid.clone();
    manager.create_run(bundle, small_resources());
    drive_until(&manager, &uuid, RunStage::Running).await;

    // Nothing changes while the container runs, however many times the
    // handler re-enters.
    for _ in 0..5 {
        manager.process_runs().await;
        let run = manager.get_run(&uuid).unwrap();
        assert_eq!(run.stage, RunStage::Running);
        assert!(!run.finished);
    }

    // Same at FINALIZING: without the server's acknowledgement the run
    // parks there.
    runtime.finish_container(
        manager.get_run(&uuid).unwrap().container_id.as_deref().unwrap(),
        0,
    );
    drive_until(&manager, &uuid, RunStage::Finalizing).await;
    for _ in 0..5 {
        manager.process_runs().await;
        assert_eq!(manager.get_run(&uuid).unwrap().stage, RunStage::Finalizing);
    }
}

#[tokio::test]
async fn committed_state_resumes_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let service = Arc::new(MemoryBundleService::new());
    let runtime = runtime_with_busybox();

    let uuid;
    {
        let manager = new_manager(dir.path(), service.clone(), runtime.clone()).await;
        let bundle = run_bundle();
        uuid = bundle.uuid.clone();
        manager.create_run(bundle, small_resources());
        drive_until(&manager, &uuid, RunStage::Running).await;
        manager.save_state().unwrap();
        // The manager is dropped here, as if the worker crashed.
    }

    let manager = new_manager(dir.path(), service.clone(), runtime.clone()).await;
    manager.load_state().await.unwrap();
    let resumed = manager.get_run(&uuid).unwrap();
    assert_eq!(resumed.stage, RunStage::Running);
    // The container survived the restart, so the handle is intact.
    assert!(resumed.container_id.is_some());

    runtime.finish_container(resumed.container_id.as_deref().unwrap(), 0);
    let run = drive_until(&manager, &uuid, RunStage::Finalizing).await.unwrap();
    assert_eq!(run.exitcode, Some(0));
}

#[tokio::test]
async fn restart_with_vanished_container_clears_the_handle() {
    let dir = tempfile::tempdir().unwrap();
    let service = Arc::new(MemoryBundleService::new());
    let runtime = runtime_with_busybox();

    let uuid;
    {
        let manager = new_manager(dir.path(), service.clone(), runtime.clone()).await;
        let bundle = run_bundle();
        uuid = bundle.uuid.clone();
        manager.create_run(bundle, small_resources());
        let run = drive_until(&manager, &uuid, RunStage::Running).await.unwrap();
        manager.save_state().unwrap();
        // The container disappears while the worker is down.
        runtime
            .remove_container(run.container_id.as_deref().unwrap())
            .await
            .unwrap();
    }

    let manager = new_manager(dir.path(), service, runtime).await;
    manager.load_state().await.unwrap();
    assert_eq!(manager.get_run(&uuid).unwrap().container_id, None);
}

#[test]
fn run_state_roundtrips_through_serde() {
    let mut run = RunState::new(
        run_bundle(),
        std::path::PathBuf::from("/work/runs/0x1"),
        small_resources(),
    );
    run.container_id = Some("container-7".to_string());
    run.docker_image = Some("sha256:busybox".to_string());
    run.cpuset = ["0", "1"].iter().map(|s| s.to_string()).collect();
    run.gpuset = ["2"].iter().map(|s| s.to_string()).collect();
    run.max_memory = 123456;
    run.disk_utilization = 7890;
    run.exitcode = Some(0);
    run.finished = true;

    let encoded = serde_json::to_string(&run).unwrap();
    let decoded: RunState = serde_json::from_str(&encoded).unwrap();
    assert_eq!(decoded, run);
}
