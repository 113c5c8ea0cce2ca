//! A read-through cache over the worker table, refreshed on a TTL. The
//! scheduler mutates the cached view (`set_starting`, `restage`, `remove`)
//! so that decisions within one tick see their own effects without another
//! round-trip to the store.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use longshore_bundle::unix_now;

use crate::model::{Worker, WorkerModel};
use crate::Error;

struct Cache {
    fetched_at: u64,
    workers: HashMap<String, Worker>,
    /// bundle uuid → worker_id.
    uuid_to_worker: HashMap<String, String>,
    user_to_workers: HashMap<String, Vec<String>>,
}

impl Cache {
    fn index(workers: Vec<Worker>) -> Cache {
        let mut uuid_to_worker = HashMap::new();
        let mut user_to_workers: HashMap<String, Vec<String>> = HashMap::new();
        for worker in &workers {
            for uuid in &worker.run_uuids {
                uuid_to_worker.insert(uuid.clone(), worker.worker_id.clone());
            }
            user_to_workers
                .entry(worker.user_id.clone())
                .or_default()
                .push(worker.worker_id.clone());
        }
        Cache {
            fetched_at: unix_now(),
            workers: workers
                .into_iter()
                .map(|w| (w.worker_id.clone(), w))
                .collect(),
            uuid_to_worker,
            user_to_workers,
        }
    }
}

pub struct WorkerInfoAccessor {
    model: Arc<dyn WorkerModel>,
    refresh_ttl: u64,
    cache: Mutex<Cache>,
}

impl WorkerInfoAccessor {
    pub async fn new(model: Arc<dyn WorkerModel>, refresh_ttl: u64) -> Result<Self, Error> {
        let workers = model.get_workers().await?;
        Ok(WorkerInfoAccessor {
            model,
            refresh_ttl,
            cache: Mutex::new(Cache::index(workers)),
        })
    }

    async fn refresh_if_stale(&self) -> Result<(), Error> {
        let stale = {
            let cache = self.cache.lock();
            unix_now().saturating_sub(cache.fetched_at) >= self.refresh_ttl
        };
        if stale {
            let workers = self.model.get_workers().await?;
            *self.cache.lock() = Cache::index(workers);
        }
        Ok(())
    }

    pub async fn workers(&self) -> Result<Vec<Worker>, Error> {
        self.refresh_if_stale().await?;
        let cache = self.cache.lock();
        Ok(cache.workers.values().cloned().collect())
    }

    pub async fn get_user_workers(&self, user_id: &str) -> Result<Vec<Worker>, Error> {
        self.refresh_if_stale().await?;
        let cache = self.cache.lock();
        Ok(cache
            .user_to_workers
            .get(user_id)
            .into_iter()
            .flatten()
            .filter_map(|id| cache.workers.get(id))
            .cloned()
            .collect())
    }

    /// Whether any cached worker claims `uuid`.
    pub async fn is_running(&self, uuid: &str) -> Result<bool, Error> {
        self.refresh_if_stale().await?;
        Ok(self.cache.lock().uuid_to_worker.contains_key(uuid))
    }

    /// All bundle uuids claimed by any cached worker.
    pub async fn running_uuids(&self) -> Result<Vec<String>, Error> {
        self.refresh_if_stale().await?;
        Ok(self.cache.lock().uuid_to_worker.keys().cloned().collect())
    }

    /// Records a fresh claim in both indexes.
    pub async fn set_starting(&self, uuid: &str, worker_id: &str) -> Result<(), Error> {
        self.refresh_if_stale().await?;
        let mut cache = self.cache.lock();
        if let Some(worker) = cache.workers.get_mut(worker_id) {
            worker.run_uuids.insert(uuid.to_string());
        }
        cache
            .uuid_to_worker
            .insert(uuid.to_string(), worker_id.to_string());
        Ok(())
    }

    /// Drops a claim from the reverse index.
    pub async fn restage(&self, uuid: &str) -> Result<(), Error> {
        self.refresh_if_stale().await?;
        let mut cache = self.cache.lock();
        if let Some(worker_id) = cache.uuid_to_worker.remove(uuid) {
            if let Some(worker) = cache.workers.get_mut(&worker_id) {
                worker.run_uuids.remove(uuid);
            }
        }
        Ok(())
    }

    /// Forgets a worker and every claim it held.
    pub async fn remove(&self, worker_id: &str) -> Result<(), Error> {
        self.refresh_if_stale().await?;
        let mut cache = self.cache.lock();
        if let Some(worker) = cache.workers.remove(worker_id) {
            for uuid in &worker.run_uuids {
                cache.uuid_to_worker.remove(uuid);
            }
            if let Some(ids) = cache.user_to_workers.get_mut(&worker.user_id) {
                ids.retain(|id| id != worker_id);
            }
        }
        Ok(())
    }
}
