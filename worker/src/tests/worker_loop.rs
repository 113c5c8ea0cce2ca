//! The checkin loop: payload contents and directive dispatch.

use std::sync::Arc;

use longshore_bundle::messages::{ReadArgs, ServerMessage};
use longshore_bundle::RunStage;

use super::fixtures::*;
use crate::observer::NoopObserver;
use crate::run_manager::RunManager;
use crate::service::{BundleService, MemoryBundleService, RecordedReply};
use crate::worker::Worker;

async fn setup(
    dir: &std::path::Path,
) -> (Arc<MemoryBundleService>, Arc<FakeRuntime>, Worker) {
    let service = Arc::new(MemoryBundleService::new());
    let runtime = runtime_with_busybox();
    let service_handle: Arc<dyn BundleService> = service.clone();
    let run_manager = Arc::new(
        RunManager::new(
            &test_config(dir),
            service_handle.clone(),
            runtime.clone(),
            Arc::new(NoopObserver),
        )
        .await
        .unwrap(),
    );
    let worker = Worker::new(test_config(dir), service_handle, run_manager.clone());
    (service, runtime, worker)
}

#[tokio::test]
async fn checkin_reports_capacity_and_runs() {
    let dir = tempfile::tempdir().unwrap();
    let (service, _runtime, worker) = setup(dir.path()).await;

    worker.checkin().await.unwrap();

    assert_eq!(service.checkin_count(), 1);
}

#[tokio::test]
async fn run_directive_creates_a_run() {
    let dir = tempfile::tempdir().unwrap();
    let service = Arc::new(MemoryBundleService::new());
    let runtime = runtime_with_busybox();
    let service_handle: Arc<dyn BundleService> = service.clone();
    let run_manager = Arc::new(
        RunManager::new(
            &test_config(dir.path()),
            service_handle.clone(),
            runtime,
            Arc::new(NoopObserver),
        )
        .await
        .unwrap(),
    );
    let worker = Worker::new(test_config(dir.path()), service_handle, run_manager.clone());

    let bundle = run_bundle();
    let uuid = bundle.uuid.clone();
    service.queue_directive(ServerMessage::Run {
        bundle: Box::new(bundle),
        resources: small_resources(),
    });

    worker.checkin().await.unwrap();

    assert!(run_manager.has_run(&uuid));
    assert_eq!(run_manager.get_run(&uuid).unwrap().stage, RunStage::Preparing);
}

#[tokio::test]
async fn kill_directive_flags_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let service = Arc::new(MemoryBundleService::new());
    let runtime = runtime_with_busybox();
    let service_handle: Arc<dyn BundleService> = service.clone();
    let run_manager = Arc::new(
        RunManager::new(
            &test_config(dir.path()),
            service_handle.clone(),
            runtime,
            Arc::new(NoopObserver),
        )
        .await
        .unwrap(),
    );
    let worker = Worker::new(test_config(dir.path()), service_handle, run_manager.clone());

    let bundle = run_bundle();
    let uuid = bundle.uuid.clone();
    run_manager.create_run(bundle, small_resources());

    service.queue_directive(ServerMessage::Kill { uuid: uuid.clone() });
    worker.checkin().await.unwrap();

    let run = run_manager.get_run(&uuid).unwrap();
    assert!(run.is_killed);
    assert_eq!(run.kill_message.as_deref(), Some("Kill requested"));
}

#[tokio::test]
async fn read_directive_streams_target_info() {
    let dir = tempfile::tempdir().unwrap();
    let service = Arc::new(MemoryBundleService::new());
    let runtime = runtime_with_busybox();
    let service_handle: Arc<dyn BundleService> = service.clone();
    let run_manager = Arc::new(
        RunManager::new(
            &test_config(dir.path()),
            service_handle.clone(),
            runtime,
            Arc::new(NoopObserver),
        )
        .await
        .unwrap(),
    );
    let worker = Worker::new(test_config(dir.path()), service_handle, run_manager.clone());

    let bundle = run_bundle();
    let uuid = bundle.uuid.clone();
    run_manager.create_run(bundle, small_resources());

    // Materialize some bundle contents.
    let bundle_path = dir.path().join("runs").join(&uuid);
    std::fs::create_dir_all(bundle_path.join("out")).unwrap();
    std::fs::write(bundle_path.join("out/stdout"), b"hello").unwrap();

    service.queue_directive(ServerMessage::Read {
        uuid: uuid.clone(),
        path: String::new(),
        read_args: ReadArgs::GetTargetInfo { depth: 1 },
        socket_id: "socket-7".to_string(),
    });
    worker.checkin().await.unwrap();

    let replies = service.take_replies();
    assert_eq!(replies.len(), 1);
    match &replies[0] {
        RecordedReply::Message {
            socket_id,
            err,
            message,
        } => {
            assert_eq!(socket_id, "socket-7");
            assert!(err.is_none(), "unexpected error: {:?}", err);
            assert_eq!(message["target_info"]["type"], "directory");
        }
        other => panic!("expected a message reply, got {:?}", other),
    }
}
