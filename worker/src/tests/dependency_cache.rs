//! The dependency cache: reference counting, eviction order and bounds,
//! failure cooldown, and the at-most-one-downloader claim.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use longshore_bundle::{unix_now, DependencyKey};

use crate::committer::JsonStateCommitter;
use crate::dependencies::{
    CacheState, DependencyManager, DependencyStage, DependencyState,
    DEPENDENCY_DOWNLOAD_TIMEOUT_SHARED,
};
use crate::service::{BundleService, MemoryBundleService, TargetKind};

fn manager(dir: &std::path::Path, max_bytes: u64, shared: bool) -> Arc<DependencyManager> {
    let service: Arc<dyn BundleService> = Arc::new(MemoryBundleService::new());
    Arc::new(
        DependencyManager::new(
            dir.join("dependencies-state.json"),
            service,
            dir,
            max_bytes,
            3,
            shared,
        )
        .unwrap(),
    )
}

fn ready_entry(
    uuid: &str,
    path: &str,
    size_bytes: u64,
    last_used: u64,
    dependents: &[&str],
) -> (DependencyKey, DependencyState) {
    let key = DependencyKey::new(uuid, "");
    (
        key.clone(),
        DependencyState {
            stage: DependencyStage::Ready,
            downloading_by: None,
            key,
            path: path.to_string(),
            size_bytes,
            dependents: dependents.iter().map(|s| s.to_string()).collect(),
            last_used,
            last_downloading: last_used,
            message: "Download complete".to_string(),
            killed: false,
        },
    )
}

/// Writes a cache state file plus the matching content directories, so a
/// freshly constructed manager adopts it.
fn seed_state(dir: &std::path::Path, entries: Vec<(DependencyKey, DependencyState)>) {
    let mut state = CacheState::default();
    for (key, entry) in entries {
        std::fs::create_dir_all(dir.join("dependencies").join(&entry.path)).unwrap();
        state.paths.insert(entry.path.clone());
        state.dependencies.insert(key, entry);
    }
    JsonStateCommitter::new(dir.join("dependencies-state.json"))
        .commit(&state)
        .unwrap();
}

fn load_state(dir: &std::path::Path) -> CacheState {
    JsonStateCommitter::new(dir.join("dependencies-state.json"))
        .load()
        .unwrap()
}

#[tokio::test]
async fn get_registers_dependents_and_starts_downloading() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(dir.path(), 1 << 30, false);
    let key = DependencyKey::new("0xparent", "out");

    let state = manager.get("0xchild", &key).unwrap();
    assert_eq!(state.stage, DependencyStage::Downloading);
    assert_eq!(state.dependents, BTreeSet::from(["0xchild".to_string()]));
    assert!(manager.has(&key).unwrap());

    let again = manager.get("0xother", &key).unwrap();
    assert_eq!(
        again.dependents,
        BTreeSet::from(["0xchild".to_string(), "0xother".to_string()])
    );
}

#[tokio::test]
async fn release_kills_unreferenced_download() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(dir.path(), 1 << 30, false);
    let key = DependencyKey::new("0xparent", "");

    manager.get("0xchild", &key).unwrap();
    manager.release("0xchild", &key).unwrap();

    let state = load_state(dir.path());
    let entry = &state.dependencies[&key];
    assert!(entry.dependents.is_empty());
    assert!(entry.killed);
}

#[tokio::test]
async fn eviction_removes_least_recently_used_unreferenced_entry() {
    let dir = tempfile::tempdir().unwrap();
    let now = unix_now();
    seed_state(
        dir.path(),
        vec![
            ready_entry("0xa", "0xa", 400, now - 300, &[]),
            ready_entry("0xb", "0xb", 400, now - 200, &[]),
            ready_entry("0xc", "0xc", 400, now - 100, &[]),
        ],
    );
    let manager = manager(dir.path(), 1000, false);

    manager.cleanup().unwrap();

    let state = load_state(dir.path());
    let remaining: Vec<String> = state.dependencies.keys().map(|k| k.to_string()).collect();
    assert_eq!(remaining, vec!["0xb".to_string(), "0xc".to_string()]);
    assert!(!state.paths.contains("0xa"));
    assert!(!dir.path().join("dependencies/0xa").exists());
    // One pass was enough; 800 bytes fit the 1000-byte ceiling.
    assert_eq!(state.dependencies.values().map(|d| d.size_bytes).sum::<u64>(), 800);
}

#[tokio::test]
async fn eviction_never_removes_referenced_entries() {
    let dir = tempfile::tempdir().unwrap();
    let now = unix_now();
    seed_state(
        dir.path(),
        vec![
            // Oldest, but referenced by a run.
            ready_entry("0xa", "0xa", 400, now - 300, &["0xrun"]),
            ready_entry("0xb", "0xb", 400, now - 200, &[]),
        ],
    );
    let manager = manager(dir.path(), 500, false);

    manager.cleanup().unwrap();

    let state = load_state(dir.path());
    assert!(state.dependencies.contains_key(&DependencyKey::new("0xa", "")));
    assert!(!state.dependencies.contains_key(&DependencyKey::new("0xb", "")));
}

#[tokio::test]
async fn failed_entries_prune_after_cooldown() {
    let dir = tempfile::tempdir().unwrap();
    let now = unix_now();
    let key = DependencyKey::new("0xfailed", "");
    let mut entry = ready_entry("0xfailed", "0xfailed", 10, now - 60, &[]).1;
    entry.stage = DependencyStage::Failed;
    entry.message = "Dependency download failed".to_string();
    seed_state(dir.path(), vec![(key.clone(), entry)]);
    let manager = manager(dir.path(), 1 << 30, false);

    manager.cleanup().unwrap();

    assert!(!manager.has(&key).unwrap());
}

#[tokio::test]
async fn fresh_claim_by_another_worker_is_respected() {
    let dir = tempfile::tempdir().unwrap();
    let now = unix_now();
    let key = DependencyKey::new("0xparent", "");
    let mut entry = ready_entry("0xparent", "0xparent", 0, now, &["0xchild"]).1;
    entry.stage = DependencyStage::Downloading;
    entry.downloading_by = Some("some-other-worker".to_string());
    entry.last_downloading = now;
    seed_state(dir.path(), vec![(key.clone(), entry)]);
    let manager = manager(dir.path(), 1 << 30, true);

    manager.transition_dependencies().unwrap();

    let state = load_state(dir.path());
    assert_eq!(
        state.dependencies[&key].downloading_by.as_deref(),
        Some("some-other-worker")
    );
}

#[tokio::test]
async fn stale_claim_is_taken_over() {
    let dir = tempfile::tempdir().unwrap();
    let now = unix_now();
    let key = DependencyKey::new("0xparent", "");
    let mut entry = ready_entry("0xparent", "0xparent", 0, now, &["0xchild"]).1;
    entry.stage = DependencyStage::Downloading;
    entry.downloading_by = Some("some-other-worker".to_string());
    entry.last_downloading = now - DEPENDENCY_DOWNLOAD_TIMEOUT_SHARED - 60;
    seed_state(dir.path(), vec![(key.clone(), entry)]);
    let manager = manager(dir.path(), 1 << 30, true);

    manager.transition_dependencies().unwrap();

    let state = load_state(dir.path());
    assert_eq!(
        state.dependencies[&key].downloading_by.as_deref(),
        Some(manager.id())
    );
}

#[tokio::test]
async fn file_dependency_downloads_to_its_assigned_path() {
    let dir = tempfile::tempdir().unwrap();
    let service = Arc::new(MemoryBundleService::new());
    let key = DependencyKey::new("0xparent", "");
    service.put_contents(key.clone(), TargetKind::File, b"model weights".to_vec());
    let service_handle: Arc<dyn BundleService> = service.clone();
    let manager = Arc::new(
        DependencyManager::new(
            dir.path().join("dependencies-state.json"),
            service_handle,
            dir.path(),
            1 << 30,
            3,
            false,
        )
        .unwrap(),
    );

    let state = manager.get("0xchild", &key).unwrap();
    assert_eq!(state.stage, DependencyStage::Downloading);

    // Drive the transition loop by hand until the download settles.
    let mut stage = DependencyStage::Downloading;
    for _ in 0..200 {
        manager.transition_dependencies().unwrap();
        stage = manager.get("0xchild", &key).unwrap().stage;
        if stage != DependencyStage::Downloading {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(stage, DependencyStage::Ready);

    let entry = manager.get("0xchild", &key).unwrap();
    assert_eq!(entry.message, "Download complete");
    let contents = std::fs::read(dir.path().join("dependencies").join(&entry.path)).unwrap();
    assert_eq!(contents, b"model weights");
}

#[tokio::test]
async fn serialized_state_roundtrips_through_the_committer() {
    let mut state = CacheState::default();
    let (key, entry) = ready_entry("0xa", "0xa", 123, 456, &["0xrun"]);
    state.paths.insert("0xa".to_string());
    state.dependencies.insert(key.clone(), entry.clone());

    let encoded = serde_json::to_string(&state).unwrap();
    let decoded: CacheState = serde_json::from_str(&encoded).unwrap();
    assert_eq!(decoded.dependencies, BTreeMap::from([(key, entry)]));
    assert_eq!(decoded.paths, BTreeSet::from(["0xa".to_string()]));
}
