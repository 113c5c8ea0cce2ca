//! The scheduling half of the bundle manager: validate staged run bundles
//! against quotas and global ceilings, order them fairly within each user,
//! and dispatch them onto workers whose remaining capacity dominates the
//! request.

use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, info, instrument};

use longshore_bundle::fmt::{duration_str, parse_duration, parse_size, size_str};
use longshore_bundle::fsutil::remove_path;
use longshore_bundle::messages::ServerMessage;
use longshore_bundle::{
    BundleInfo, BundleState, BundleType, RunResources, DISK_QUOTA_SLACK_BYTES,
};

use crate::access::WorkerInfoAccessor;
use crate::manager::BundleManager;
use crate::model::{BundleUpdate, MetadataPatch, UserInfo, Worker, WorkerPatch};
use crate::Error;

/// How long to wait for a worker to take a `run` message off its socket.
const RUN_MESSAGE_TIMEOUT: Duration = Duration::from_millis(200);
/// Fallback memory request for runs predating client-side defaults.
const DEFAULT_REQUEST_MEMORY_BYTES: u64 = 2 << 30;

impl BundleManager {
    /// Validates every STAGED run bundle; failures move the bundle to
    /// FAILED with all offending checks joined into one message, survivors
    /// come back with their computed resource envelope, in queue order.
    #[instrument(skip_all)]
    pub(crate) async fn get_staged_bundles_to_run(
        &self,
        user_info_cache: &mut HashMap<String, UserInfo>,
    ) -> Result<Vec<(BundleInfo, RunResources)>, Error> {
        let mut staged = Vec::new();
        for bundle in self
            .model
            .batch_get_bundles(&[BundleState::Staged], Some(BundleType::Run))
            .await?
        {
            if !user_info_cache.contains_key(&bundle.owner_id) {
                let info = self.model.get_user_info(&bundle.owner_id).await?;
                user_info_cache.insert(bundle.owner_id.clone(), info);
            }
            let user_info = &user_info_cache[&bundle.owner_id];

            let mut failures = Vec::new();
            let resources = match self.compute_bundle_resources(&bundle, Some(user_info)).await {
                Ok(resources) => resources,
                Err(message) => {
                    failures.push(message);
                    RunResources::default()
                }
            };

            if failures.is_empty() {
                failures.extend(self.resource_failures(&resources, user_info).await?);
            }

            if failures.is_empty() {
                staged.push((bundle, resources));
            } else {
                let message = failures.join(". ");
                info!(uuid=%bundle.uuid, message=%message, "failing bundle");
                self.model
                    .update_bundle(&bundle, BundleUpdate::failed(message))
                    .await?;
            }
        }
        Ok(staged)
    }

    /// The per-dimension limit checks. A zero value means "unchecked", the
    /// way a `0` request always has.
    async fn resource_failures(
        &self,
        resources: &RunResources,
        user_info: &UserInfo,
    ) -> Result<Vec<String>, Error> {
        let mut failures = Vec::new();

        if resources.disk > 0 {
            let user_max = user_info
                .disk_quota_left()
                .saturating_sub(DISK_QUOTA_SLACK_BYTES);
            if resources.disk > user_max {
                failures.push(format!(
                    "Requested more disk ({}) than user disk quota left ({}) by {}",
                    size_str(resources.disk),
                    size_str(user_max),
                    size_str(resources.disk - user_max)
                ));
            } else if let Some(global_max) = self.config.max_request_disk {
                if resources.disk > global_max {
                    failures.push(format!(
                        "Maximum job disk size ({}) exceeded ({}) by {}",
                        size_str(resources.disk),
                        size_str(global_max),
                        size_str(resources.disk - global_max)
                    ));
                }
            }
        }

        if let Some(time) = resources.time.filter(|t| *t > 0) {
            let user_max = user_info.time_quota_left();
            if time > user_max {
                failures.push(format!(
                    "Requested more time ({}) than user time quota left ({}) by {}",
                    duration_str(time),
                    duration_str(user_max),
                    duration_str(time - user_max)
                ));
            } else if let Some(global_max) = self.config.max_request_time {
                if time > global_max {
                    failures.push(format!(
                        "Maximum job time ({}) exceeded ({}) by {}",
                        duration_str(time),
                        duration_str(global_max),
                        duration_str(time - global_max)
                    ));
                }
            }
        }

        if resources.memory > 0 {
            if let Some(global_max) = self.config.max_request_memory {
                if resources.memory > global_max {
                    failures.push(format!(
                        "Requested more memory ({}) than maximum limit ({}) by {}",
                        size_str(resources.memory),
                        size_str(global_max),
                        size_str(resources.memory - global_max)
                    ));
                }
            }
            // Below the docker minimum a container cannot start at all.
            if resources.memory < self.config.min_request_memory {
                failures.push(format!(
                    "Requested less memory ({}) than minimum limit ({}) by {}",
                    size_str(resources.memory),
                    size_str(self.config.min_request_memory),
                    size_str(self.config.min_request_memory - resources.memory)
                ));
            }
        }

        Ok(failures)
    }

    /// Computes the resource envelope of a run bundle. Defaults: 1 cpu,
    /// 0 gpus, 2 GiB memory, disk and time capped by what the user has
    /// left and the global ceilings.
    pub(crate) async fn compute_bundle_resources(
        &self,
        bundle: &BundleInfo,
        user_info: Option<&UserInfo>,
    ) -> Result<RunResources, String> {
        let metadata = &bundle.metadata;

        let cpus = match metadata.request_cpus {
            None | Some(0) => 1,
            Some(n) => n,
        };
        let gpus = metadata.request_gpus.unwrap_or(0);

        let memory = match metadata.request_memory.as_deref().filter(|s| !s.is_empty()) {
            Some(spec) => parse_size(spec).map_err(|e| e.to_string())?,
            None => DEFAULT_REQUEST_MEMORY_BYTES,
        };

        let disk = match metadata.request_disk.as_deref().filter(|s| !s.is_empty()) {
            Some(spec) => parse_size(spec).map_err(|e| e.to_string())?,
            None => {
                let quota_left = self
                    .model
                    .get_user_disk_quota_left(&bundle.owner_id, user_info)
                    .await
                    .map_err(|e| e.to_string())?;
                quota_left
                    .saturating_sub(DISK_QUOTA_SLACK_BYTES)
                    .min(self.config.max_request_disk.unwrap_or(u64::MAX))
            }
        };

        let time = match metadata.request_time.as_deref().filter(|s| !s.is_empty()) {
            Some(spec) => Some(parse_duration(spec).map_err(|e| e.to_string())?),
            None => {
                let quota_left = self
                    .model
                    .get_user_time_quota_left(&bundle.owner_id, user_info)
                    .await
                    .map_err(|e| e.to_string())?;
                Some(quota_left.min(self.config.max_request_time.unwrap_or(u64::MAX)))
            }
        };

        let mut docker_image = match metadata.request_docker_image.clone() {
            Some(image) => image,
            None => {
                let default = if gpus > 0 {
                    self.config.default_gpu_image.clone()
                } else {
                    self.config.default_cpu_image.clone()
                };
                default.ok_or_else(|| "No default docker image configured".to_string())?
            }
        };
        // Match docker's own behavior when no tag is given.
        if !docker_image.contains(':') {
            docker_image.push_str(":latest");
        }

        Ok(RunResources {
            cpus,
            gpus,
            memory,
            disk,
            time,
            docker_image,
            network: metadata.request_network,
            tag: metadata.request_queue().map(str::to_string),
            tag_exclusive: false,
            runs_left: None,
        })
    }

    /// Reorders the queue within each owner by (non-negative priority,
    /// unset priority, priority value, has a queue tag), descending, while
    /// other owners' queue positions stay untouched.
    fn order_staged_bundles(staged: &mut [(BundleInfo, RunResources)]) {
        let mut owner_positions: HashMap<String, Vec<usize>> = HashMap::new();
        for (position, (bundle, _)) in staged.iter().enumerate() {
            owner_positions
                .entry(bundle.owner_id.clone())
                .or_default()
                .push(position);
        }
        for positions in owner_positions.values() {
            let mut subset: Vec<_> = positions.iter().map(|i| staged[*i].clone()).collect();
            subset.sort_by_key(|(bundle, _)| {
                let priority = bundle.metadata.request_priority;
                std::cmp::Reverse((
                    priority.map_or(false, |p| p >= 0),
                    priority.is_none(),
                    priority.unwrap_or(0),
                    bundle.metadata.request_queue().is_some(),
                ))
            });
            for (position, item) in positions.iter().zip(subset) {
                staged[*position] = item;
            }
        }
    }

    /// Resource envelopes of every bundle known to occupy (or about to
    /// occupy) worker capacity, for deduction.
    async fn get_running_bundles_info(
        &self,
        workers: &WorkerInfoAccessor,
        staged: &[(BundleInfo, RunResources)],
    ) -> Result<HashMap<String, RunResources>, Error> {
        let mut uuids = workers.running_uuids().await?;
        let mut info: HashMap<String, RunResources> = staged
            .iter()
            .map(|(bundle, resources)| (bundle.uuid.clone(), resources.clone()))
            .collect();
        uuids.retain(|uuid| !info.contains_key(uuid));
        for bundle in self.model.batch_get_bundles_by_uuid(&uuids).await? {
            if let Ok(resources) = self.compute_bundle_resources(&bundle, None).await {
                info.insert(bundle.uuid.clone(), resources);
            }
        }
        Ok(info)
    }

    /// Subtracts the resources of every claimed bundle from its worker's
    /// advertised capacity. Works on a deep copy: the scheduler's view of
    /// a tick, not the stored rows.
    async fn deduct_worker_resources(
        &self,
        mut workers_list: Vec<Worker>,
        running: &HashMap<String, RunResources>,
    ) -> Vec<Worker> {
        for worker in &mut workers_list {
            for uuid in worker.run_uuids.clone() {
                let resources = match running.get(&uuid) {
                    Some(resources) => resources.clone(),
                    None => match self.model.get_bundle(&uuid).await {
                        Ok(bundle) => match self.compute_bundle_resources(&bundle, None).await {
                            Ok(resources) => resources,
                            Err(_) => continue,
                        },
                        Err(_) => {
                            debug!(uuid=%uuid, worker_id=%worker.worker_id,
                                "bundle on worker no longer in bundle table, skipping deduction");
                            continue;
                        }
                    },
                };
                worker.cpus = worker.cpus.saturating_sub(resources.cpus);
                worker.gpus = worker.gpus.saturating_sub(resources.gpus);
                worker.memory_bytes = worker.memory_bytes.saturating_sub(resources.memory);
            }
        }
        workers_list
    }

    fn worker_to_run_resources(worker: &Worker) -> RunResources {
        RunResources {
            cpus: worker.cpus,
            gpus: worker.gpus,
            memory: worker.memory_bytes,
            disk: worker.free_disk_bytes.unwrap_or(0),
            time: None,
            docker_image: String::new(),
            network: false,
            tag: worker.tag.clone(),
            tag_exclusive: worker.tag_exclusive,
            runs_left: worker.exit_after_num_runs,
        }
    }

    /// Workers whose remaining capacity dominates the request.
    fn dominating_workers<'a>(
        request: &RunResources,
        workers_list: &'a [Worker],
        strict: bool,
    ) -> Vec<&'a Worker> {
        workers_list
            .iter()
            .filter(|worker| Self::worker_to_run_resources(worker).dominates(request, strict))
            .collect()
    }

    /// Capacity summaries of the workers not strictly dominated by another
    /// candidate; shown to the user when nothing can take the bundle.
    fn resource_recommendations(request: &RunResources, workers_list: &[Worker]) -> String {
        let mut recommendations = Vec::new();
        for worker in workers_list {
            let capacity = Self::worker_to_run_resources(worker);
            let better = workers_list.iter().any(|other| {
                other.worker_id != worker.worker_id
                    && Self::worker_to_run_resources(other).dominates(&capacity, true)
            });
            if !better {
                recommendations.push(capacity.comparison(request));
            }
        }
        if recommendations.is_empty() {
            String::new()
        } else {
            format!("Available resources: {}", recommendations.join("; "))
        }
    }

    /// Filters candidates to those that dominate the request and sorts them
    /// in dispatch preference order. When nothing dominates, records a
    /// recommendation on the bundle's `staged_status` and returns nothing.
    ///
    /// Preference, in order: tag-exclusive workers, then workers without
    /// GPUs (a cpu job should not squat on a GPU machine), more cached
    /// dependencies, fewer cpus, fewer running jobs. Ties break randomly so
    /// new jobs spread their dependency downloads across the fleet instead
    /// of piling onto one worker's cache.
    async fn filter_and_sort_workers(
        &self,
        workers_list: Vec<Worker>,
        bundle: &BundleInfo,
        resources: &RunResources,
    ) -> Result<Vec<Worker>, Error> {
        let dominating: Vec<Worker> = Self::dominating_workers(resources, &workers_list, false)
            .into_iter()
            .cloned()
            .collect();

        if dominating.is_empty() {
            let recommendations = Self::resource_recommendations(resources, &workers_list);
            let staged_status = format!(
                "No worker can meet your bundle's resource requirements. {}",
                recommendations
            );
            self.model
                .update_bundle(
                    bundle,
                    BundleUpdate {
                        state: None,
                        metadata: MetadataPatch {
                            staged_status: Some(staged_status.trim_end().to_string()),
                            ..Default::default()
                        },
                    },
                )
                .await?;
            return Ok(Vec::new());
        }

        let needed: HashSet<_> = bundle.dependency_keys().collect();
        let mut keyed: Vec<(_, Worker)> = dominating
            .into_iter()
            .map(|worker| {
                let available_deps = if worker.shared_file_system {
                    needed.len()
                } else {
                    needed
                        .iter()
                        .filter(|key| worker.dependencies.contains(key))
                        .count()
                };
                let key = (
                    !worker.tag_exclusive,
                    worker.gpus > 0 || worker.has_gpus,
                    -(available_deps as i64),
                    worker.cpus,
                    worker.run_uuids.len(),
                    rand::random::<u64>(),
                );
                (key, worker)
            })
            .collect();
        keyed.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(keyed.into_iter().map(|(_, worker)| worker).collect())
    }

    /// Tries to start the bundle on the given worker. The STARTING
    /// transition is reverted when the worker does not take the run message
    /// in time.
    async fn try_start_bundle(
        &self,
        workers: &WorkerInfoAccessor,
        worker: &Worker,
        bundle: &BundleInfo,
        resources: &RunResources,
    ) -> Result<bool, Error> {
        if !self.auth.can_run(&worker.user_id, bundle) {
            return Ok(false);
        }
        if !self
            .model
            .transition_bundle_starting(bundle, &worker.user_id, &worker.worker_id)
            .await?
        {
            return Ok(false);
        }
        workers.set_starting(&bundle.uuid, &worker.worker_id).await?;

        if worker.shared_file_system {
            // On a shared file system the server creates the bundle
            // directory, avoiding NFS directory cache issues on the worker.
            let location = self.model.get_bundle_location(&bundle.uuid).await?;
            remove_path(&location)?;
            std::fs::create_dir_all(&location)?;
        }

        let message = self
            .construct_run_message(worker.shared_file_system, bundle, resources)
            .await?;
        if self
            .worker_model
            .send_json_message(&worker.socket_id, &message, RUN_MESSAGE_TIMEOUT)
            .await
        {
            info!(uuid=%bundle.uuid, worker_id=%worker.worker_id, "starting run bundle");
            Ok(true)
        } else {
            self.model.transition_bundle_staged(bundle).await?;
            workers.restage(&bundle.uuid).await?;
            Ok(false)
        }
    }

    /// Builds the `run` message. Shared-filesystem workers additionally get
    /// the bundle and parent locations so they can read everything in
    /// place.
    async fn construct_run_message(
        &self,
        shared_file_system: bool,
        bundle: &BundleInfo,
        resources: &RunResources,
    ) -> Result<ServerMessage, Error> {
        let mut bundle = bundle.clone();
        if shared_file_system {
            bundle.location = Some(match &bundle.metadata.link_url {
                Some(url) => url.clone(),
                None => self
                    .model
                    .get_bundle_location(&bundle.uuid)
                    .await?
                    .to_string_lossy()
                    .into_owned(),
            });
            let parent_uuids: Vec<String> = bundle
                .dependencies
                .iter()
                .map(|d| d.parent_uuid.clone())
                .collect();
            let links = self.model.get_bundle_metadata(&parent_uuids, "link_url").await?;
            for dep in &mut bundle.dependencies {
                dep.location = Some(match links.get(&dep.parent_uuid) {
                    Some(url) => url.clone(),
                    None => self
                        .model
                        .get_bundle_location(&dep.parent_uuid)
                        .await?
                        .to_string_lossy()
                        .into_owned(),
                });
            }
        }
        Ok(ServerMessage::Run {
            bundle: Box::new(bundle),
            resources: resources.clone(),
        })
    }

    /// The dispatch loop: highest-priority bundles first within each user;
    /// private workers preferred, the shared pool only while the user has
    /// parallel-run quota left. One bundle starts on at most one worker,
    /// one worker accepts at most one new bundle per tick, and workers that
    /// go offline mid-tick stay excluded even if they come right back.
    #[instrument(skip_all, fields(staged = staged.len()))]
    pub(crate) async fn schedule_run_bundles_on_workers(
        &self,
        workers: &WorkerInfoAccessor,
        mut staged: Vec<(BundleInfo, RunResources)>,
        user_info_cache: &mut HashMap<String, UserInfo>,
    ) -> Result<(), Error> {
        Self::order_staged_bundles(&mut staged);

        let running_info = self.get_running_bundles_info(workers, &staged).await?;

        let root_user_id = self.model.root_user_id().to_string();
        // Pre-compute per-user worker views with resources already
        // deducted. Workers that recover capacity mid-tick are not reused
        // until the next tick, preserving the queue order.
        let mut user_workers: HashMap<String, Vec<Worker>> = HashMap::new();
        let mut parallel_quota_left: HashMap<String, i64> = HashMap::new();
        for (bundle, _) in &staged {
            if user_workers.contains_key(&bundle.owner_id) {
                continue;
            }
            let own = if bundle.owner_id == root_user_id {
                Vec::new()
            } else {
                self.deduct_worker_resources(
                    workers.get_user_workers(&bundle.owner_id).await?,
                    &running_info,
                )
                .await
            };
            user_workers.insert(bundle.owner_id.clone(), own);
            parallel_quota_left.insert(
                bundle.owner_id.clone(),
                self.model
                    .get_user_parallel_run_quota_left(
                        &bundle.owner_id,
                        user_info_cache.get(&bundle.owner_id),
                    )
                    .await?,
            );
        }
        let mut pool_workers = self
            .deduct_worker_resources(workers.get_user_workers(&root_user_id).await?, &running_info)
            .await;

        let mut offline_workers: HashSet<String> = HashSet::new();
        let mut started_workers: HashSet<String> = HashSet::new();

        for (bundle, resources) in &staged {
            let own = user_workers.get(&bundle.owner_id).cloned().unwrap_or_default();
            let mut candidates: Vec<Worker> = own;
            if parallel_quota_left.get(&bundle.owner_id).copied().unwrap_or(0) > 0 {
                candidates.extend(pool_workers.iter().cloned());
            }

            // Workers go offline while we dispatch; refresh the fleet and
            // drop them, remembering them so a worker flapping back online
            // cannot jump the queue.
            self.cleanup_dead_workers(workers).await?;
            let mut online: HashSet<String> = HashSet::new();
            for worker in workers.get_user_workers(&bundle.owner_id).await? {
                online.insert(worker.worker_id);
            }
            for worker in workers.get_user_workers(&root_user_id).await? {
                online.insert(worker.worker_id);
            }
            offline_workers.extend(
                candidates
                    .iter()
                    .filter(|w| !online.contains(&w.worker_id))
                    .map(|w| w.worker_id.clone()),
            );
            candidates.retain(|w| {
                !offline_workers.contains(&w.worker_id) && !started_workers.contains(&w.worker_id)
            });

            let candidates = self
                .filter_and_sort_workers(candidates, bundle, resources)
                .await?;

            for worker in &candidates {
                if self
                    .try_start_bundle(workers, worker, bundle, resources)
                    .await?
                {
                    started_workers.insert(worker.worker_id.clone());
                    if worker.user_id == root_user_id {
                        if let Some(quota) = parallel_quota_left.get_mut(&bundle.owner_id) {
                            *quota -= 1;
                        }
                    }
                    let runs_left = worker.exit_after_num_runs.map(|n| n - 1);
                    for list in user_workers
                        .values_mut()
                        .chain(std::iter::once(&mut pool_workers))
                    {
                        for entry in list.iter_mut().filter(|w| w.worker_id == worker.worker_id) {
                            entry.cpus = entry.cpus.saturating_sub(resources.cpus);
                            entry.gpus = entry.gpus.saturating_sub(resources.gpus);
                            entry.memory_bytes = entry.memory_bytes.saturating_sub(resources.memory);
                            entry.exit_after_num_runs = runs_left;
                        }
                    }
                    // The run budget is part of the worker row; write the
                    // decrement through before the next scheduling loop
                    // races the worker's own checkin.
                    if let Some(runs_left) = runs_left {
                        self.worker_model
                            .update_workers(
                                &worker.user_id,
                                &worker.worker_id,
                                WorkerPatch {
                                    exit_after_num_runs: Some(runs_left),
                                },
                            )
                            .await?;
                    }
                    break;
                }
            }
        }
        Ok(())
    }
}
