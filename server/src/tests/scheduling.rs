//! Scheduling: validation, fairness, domination, dispatch and the
//! exceptional paths of the run-bundle state machine.

use std::collections::BTreeMap;

use longshore_bundle::messages::ServerMessage;
use longshore_bundle::{
    unix_now, BundleCheckinState, BundleState, RunStage, StageTimes,
};

use super::fixtures::*;
use crate::model::{BundleModel, MemoryModel, WorkerModel};

async fn state_of(model: &MemoryModel, uuid: &str) -> BundleState {
    model.get_bundle(uuid).await.unwrap().state
}

fn run_messages(model: &MemoryModel) -> Vec<String> {
    model
        .sent_messages()
        .into_iter()
        .filter_map(|(_, message)| match message {
            ServerMessage::Run { bundle, .. } => Some(bundle.uuid),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn no_bundles_nothing_happens() {
    let (_, manager) = setup();
    manager.schedule_run_bundles().await.unwrap();
}

#[tokio::test]
async fn single_bundle_single_worker_starts() {
    let (model, manager) = setup();
    let mut bundle = run_bundle(BundleState::Staged);
    bundle.metadata.request_time = Some("60".into());
    model.save_bundle(bundle.clone());
    let worker_id = checkin_worker(&model, OWNER, &worker_checkin(1, 0, 1 << 30)).await;

    manager.schedule_run_bundles().await.unwrap();

    assert_eq!(state_of(&model, &bundle.uuid).await, BundleState::Starting);
    let (_, claimed_by) = model.claim_of(&bundle.uuid).unwrap();
    assert_eq!(claimed_by, worker_id);
    assert_eq!(run_messages(&model), vec![bundle.uuid.clone()]);
}

#[tokio::test]
async fn one_worker_accepts_at_most_one_bundle_per_tick() {
    let (model, manager) = setup();
    let first = run_bundle(BundleState::Staged);
    let second = run_bundle(BundleState::Staged);
    model.save_bundle(first.clone());
    model.save_bundle(second.clone());
    checkin_worker(&model, OWNER, &worker_checkin(8, 0, 16 << 30)).await;

    manager.schedule_run_bundles().await.unwrap();

    let states = [
        state_of(&model, &first.uuid).await,
        state_of(&model, &second.uuid).await,
    ];
    assert_eq!(
        states
            .iter()
            .filter(|s| **s == BundleState::Starting)
            .count(),
        1
    );
    assert_eq!(
        states.iter().filter(|s| **s == BundleState::Staged).count(),
        1
    );
    assert_eq!(run_messages(&model).len(), 1);
}

#[tokio::test]
async fn higher_priority_dispatches_first() {
    let (model, manager) = setup();
    let mut low = run_bundle(BundleState::Staged);
    low.metadata.request_priority = Some(1);
    let mut high = run_bundle(BundleState::Staged);
    high.metadata.request_priority = Some(5);
    model.save_bundle(low.clone());
    model.save_bundle(high.clone());
    checkin_worker(&model, OWNER, &worker_checkin(1, 0, 2 << 30)).await;

    manager.schedule_run_bundles().await.unwrap();

    assert_eq!(state_of(&model, &high.uuid).await, BundleState::Starting);
    assert_eq!(state_of(&model, &low.uuid).await, BundleState::Staged);
}

#[tokio::test]
async fn null_priority_outranks_negative_priority() {
    let (model, manager) = setup();
    let mut negative = run_bundle(BundleState::Staged);
    negative.metadata.request_priority = Some(-1);
    let mut null = run_bundle(BundleState::Staged);
    null.metadata.request_priority = None;
    model.save_bundle(negative.clone());
    model.save_bundle(null.clone());
    checkin_worker(&model, OWNER, &worker_checkin(1, 0, 2 << 30)).await;

    manager.schedule_run_bundles().await.unwrap();

    assert_eq!(state_of(&model, &null.uuid).await, BundleState::Starting);
    assert_eq!(state_of(&model, &negative.uuid).await, BundleState::Staged);
}

#[tokio::test]
async fn tagged_job_outranks_untagged_at_equal_priority() {
    let (model, manager) = setup();
    let untagged = run_bundle(BundleState::Staged);
    let mut tagged = run_bundle(BundleState::Staged);
    tagged.metadata.request_queue = Some("fast".into());
    model.save_bundle(untagged.clone());
    model.save_bundle(tagged.clone());
    let mut checkin = worker_checkin(1, 0, 2 << 30);
    checkin.tag = Some("fast".into());
    checkin_worker(&model, OWNER, &checkin).await;

    manager.schedule_run_bundles().await.unwrap();

    assert_eq!(state_of(&model, &tagged.uuid).await, BundleState::Starting);
    assert_eq!(state_of(&model, &untagged.uuid).await, BundleState::Staged);
}

#[tokio::test]
async fn tagged_bundle_only_matches_workers_with_that_tag() {
    let (model, manager) = setup();
    let mut bundle = run_bundle(BundleState::Staged);
    bundle.metadata.request_queue = Some("gpu-queue".into());
    model.save_bundle(bundle.clone());
    checkin_worker(&model, OWNER, &worker_checkin(8, 0, 16 << 30)).await;

    manager.schedule_run_bundles().await.unwrap();
    assert_eq!(state_of(&model, &bundle.uuid).await, BundleState::Staged);

    let mut tagged = worker_checkin(8, 0, 16 << 30);
    tagged.tag = Some("gpu-queue".into());
    let tagged_id = checkin_worker(&model, OWNER, &tagged).await;

    manager.schedule_run_bundles().await.unwrap();
    assert_eq!(state_of(&model, &bundle.uuid).await, BundleState::Starting);
    assert_eq!(model.claim_of(&bundle.uuid).unwrap().1, tagged_id);
}

#[tokio::test]
async fn undominated_request_records_a_recommendation() {
    let (model, manager) = setup();
    let mut bundle = run_bundle(BundleState::Staged);
    bundle.metadata.request_cpus = Some(8);
    model.save_bundle(bundle.clone());
    checkin_worker(&model, OWNER, &worker_checkin(2, 0, 16 << 30)).await;

    manager.schedule_run_bundles().await.unwrap();

    let staged = model.get_bundle(&bundle.uuid).await.unwrap();
    assert_eq!(staged.state, BundleState::Staged);
    let status = staged.metadata.staged_status.unwrap();
    assert!(status.contains("No worker can meet"));
    assert!(status.contains("cpus: 2 (requested 8)"));
}

#[tokio::test]
async fn validation_failure_below_memory_minimum() {
    let (model, manager) = setup();
    let mut bundle = run_bundle(BundleState::Staged);
    bundle.metadata.request_memory = Some("1k".into());
    model.save_bundle(bundle.clone());
    checkin_worker(&model, OWNER, &worker_checkin(1, 0, 1 << 30)).await;

    manager.schedule_run_bundles().await.unwrap();

    let failed = model.get_bundle(&bundle.uuid).await.unwrap();
    assert_eq!(failed.state, BundleState::Failed);
    assert!(failed
        .metadata
        .failure_message
        .unwrap()
        .contains("Requested less memory"));
}

#[tokio::test]
async fn validation_failure_above_disk_maximum() {
    let (model, manager) = setup();
    let mut bundle = run_bundle(BundleState::Staged);
    // test_config caps jobs at 10g.
    bundle.metadata.request_disk = Some("20g".into());
    model.save_bundle(bundle.clone());

    manager.schedule_run_bundles().await.unwrap();

    let failed = model.get_bundle(&bundle.uuid).await.unwrap();
    assert_eq!(failed.state, BundleState::Failed);
    assert!(failed
        .metadata
        .failure_message
        .unwrap()
        .contains("Maximum job disk size"));
}

#[tokio::test]
async fn dispatched_worker_dominates_the_request() {
    let (model, manager) = setup();
    let mut bundle = run_bundle(BundleState::Staged);
    bundle.metadata.request_cpus = Some(2);
    bundle.metadata.request_memory = Some("2g".into());
    model.save_bundle(bundle.clone());
    // One worker too small on memory, one that fits.
    checkin_worker(&model, OWNER, &worker_checkin(4, 0, 1 << 30)).await;
    let fitting = checkin_worker(&model, OWNER, &worker_checkin(2, 0, 4 << 30)).await;

    manager.schedule_run_bundles().await.unwrap();

    assert_eq!(state_of(&model, &bundle.uuid).await, BundleState::Starting);
    assert_eq!(model.claim_of(&bundle.uuid).unwrap().1, fitting);
}

#[tokio::test]
async fn parallel_run_quota_gates_the_shared_pool() {
    let (model, manager) = setup();
    model.save_user(crate::model::UserInfo {
        user_id: OWNER.into(),
        disk_quota: 100 << 30,
        disk_used: 0,
        time_quota: 365 * 24 * 60 * 60,
        time_used: 0,
        parallel_run_quota: 0,
    });
    let bundle = run_bundle(BundleState::Staged);
    model.save_bundle(bundle.clone());
    checkin_worker(&model, ROOT_USER, &worker_checkin(8, 0, 16 << 30)).await;

    manager.schedule_run_bundles().await.unwrap();

    assert_eq!(state_of(&model, &bundle.uuid).await, BundleState::Staged);
}

#[tokio::test]
async fn accepted_run_decrements_exit_after_num_runs() {
    let (model, manager) = setup();
    let bundle = run_bundle(BundleState::Staged);
    model.save_bundle(bundle.clone());
    let mut checkin = worker_checkin(4, 0, 8 << 30);
    checkin.exit_after_num_runs = Some(5);
    let worker_id = checkin_worker(&model, OWNER, &checkin).await;

    manager.schedule_run_bundles().await.unwrap();

    assert_eq!(state_of(&model, &bundle.uuid).await, BundleState::Starting);
    let workers = model.get_workers().await.unwrap();
    let worker = workers.iter().find(|w| w.worker_id == worker_id).unwrap();
    assert_eq!(worker.exit_after_num_runs, Some(4));
}

#[tokio::test]
async fn dead_worker_is_cleaned_and_its_bundle_goes_offline() {
    let (model, manager) = setup();
    let bundle = run_bundle(BundleState::Staged);
    model.save_bundle(bundle.clone());
    let worker_id = checkin_worker(&model, OWNER, &worker_checkin(1, 0, 2 << 30)).await;

    manager.schedule_run_bundles().await.unwrap();
    assert_eq!(state_of(&model, &bundle.uuid).await, BundleState::Starting);

    // Worker reports the run, then goes silent past the timeout.
    let checkin = BundleCheckinState {
        uuid: bundle.uuid.clone(),
        run_status: "Running job in container".into(),
        bundle_start_time: unix_now(),
        container_time_total: 0,
        container_time_user: 0,
        container_time_system: 0,
        docker_image: None,
        state: BundleState::Running,
        remote: worker_id.clone(),
        exitcode: None,
        failure_message: None,
        is_killed: false,
        stage_times: BTreeMap::new(),
    };
    model
        .bundle_checkin(&checkin, OWNER, &worker_id)
        .await
        .unwrap();
    model.set_checkin_time(&worker_id, unix_now() - 120);

    manager.schedule_run_bundles().await.unwrap();

    assert_eq!(
        state_of(&model, &bundle.uuid).await,
        BundleState::WorkerOffline
    );
    assert!(model.get_workers().await.unwrap().is_empty());
}

#[tokio::test]
async fn stuck_starting_bundle_is_restaged() {
    let (model, manager) = setup();
    let mut bundle = run_bundle(BundleState::Starting);
    bundle.metadata.last_updated = Some(unix_now() - 6 * 60);
    model.save_bundle(bundle.clone());
    // A worker is alive but redelivery fails, so the bundle settles back
    // in STAGED rather than STARTING.
    checkin_worker(&model, OWNER, &worker_checkin(1, 0, 2 << 30)).await;
    model.set_deliverable(false);

    manager.schedule_run_bundles().await.unwrap();

    assert_eq!(state_of(&model, &bundle.uuid).await, BundleState::Staged);
    assert!(model.claim_of(&bundle.uuid).is_none());
}

#[tokio::test]
async fn unclaimed_running_bundle_goes_offline() {
    let (model, manager) = setup();
    let bundle = run_bundle(BundleState::Running);
    model.save_bundle(bundle.clone());

    manager.schedule_run_bundles().await.unwrap();

    assert_eq!(
        state_of(&model, &bundle.uuid).await,
        BundleState::WorkerOffline
    );
}

#[tokio::test]
async fn unclaimed_preemptible_bundle_restages_keeping_history() {
    let (model, manager) = setup();
    let mut bundle = run_bundle(BundleState::Running);
    bundle.metadata.preemptible = true;
    bundle.metadata.remote_history = vec!["remote1".into()];
    model.save_bundle(bundle.clone());

    manager.schedule_run_bundles().await.unwrap();

    let restaged = model.get_bundle(&bundle.uuid).await.unwrap();
    assert_eq!(restaged.state, BundleState::Staged);
    assert_eq!(restaged.metadata.remote_history, vec!["remote1".to_string()]);
}

#[tokio::test]
async fn finalizing_bundle_without_claimant_goes_offline() {
    let (model, manager) = setup();
    let bundle = run_bundle(BundleState::Finalizing);
    model.save_bundle(bundle.clone());

    manager.schedule_run_bundles().await.unwrap();

    assert_eq!(
        state_of(&model, &bundle.uuid).await,
        BundleState::WorkerOffline
    );
}

#[tokio::test]
async fn finalizing_bundle_finishes_with_stage_times() {
    let (model, manager) = setup();
    let bundle = run_bundle(BundleState::Staged);
    model.save_bundle(bundle.clone());
    let worker_id = checkin_worker(&model, OWNER, &worker_checkin(1, 0, 2 << 30)).await;

    manager.schedule_run_bundles().await.unwrap();
    assert_eq!(state_of(&model, &bundle.uuid).await, BundleState::Starting);

    let stage_times: BTreeMap<RunStage, StageTimes> = [
        RunStage::Preparing,
        RunStage::Running,
        RunStage::CleaningUp,
        RunStage::UploadingResults,
        RunStage::Finalizing,
    ]
    .into_iter()
    .map(|stage| {
        (
            stage,
            StageTimes {
                start: 15,
                end: 20,
                elapsed: 5,
            },
        )
    })
    .collect();
    let checkin = BundleCheckinState {
        uuid: bundle.uuid.clone(),
        run_status: "Finalizing bundle".into(),
        bundle_start_time: unix_now(),
        container_time_total: 5,
        container_time_user: 4,
        container_time_system: 1,
        docker_image: Some("longshore/default-cpu:latest".into()),
        state: BundleState::Finalizing,
        remote: worker_id.clone(),
        exitcode: Some(0),
        failure_message: None,
        is_killed: false,
        stage_times,
    };
    model
        .bundle_checkin(&checkin, OWNER, &worker_id)
        .await
        .unwrap();

    manager.schedule_run_bundles().await.unwrap();

    let finished = model.get_bundle(&bundle.uuid).await.unwrap();
    assert_eq!(finished.state, BundleState::Ready);
    assert_eq!(finished.metadata.time_preparing, Some(5));
    assert_eq!(finished.metadata.time_running, Some(5));
    assert_eq!(finished.metadata.time_uploading_results, Some(5));
    assert_eq!(finished.metadata.time_cleaning_up, Some(5));
    // The worker was told to discard the run.
    assert!(model
        .sent_messages()
        .iter()
        .any(|(_, m)| matches!(m, ServerMessage::MarkFinalized { uuid } if *uuid == bundle.uuid)));
    // The run's container time was charged against the owner's quota.
    let user = model.get_user_info(OWNER).await.unwrap();
    assert_eq!(user.time_used, 5);
}
