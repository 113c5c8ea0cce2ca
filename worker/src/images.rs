//! The worker's container-image cache: answers "is this image ready?"
//! while pulls run in the background, and prunes least-recently-used
//! images once their total virtual size crosses the configured ceiling.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use longshore_bundle::unix_now;

use crate::committer::JsonStateCommitter;
use crate::dependencies::DependencyStage;
use crate::runtime::ContainerRuntime;
use crate::tasks::TaskRegistry;

/// Download state of an image: the digest once known, the stage, and a
/// human-readable status.
#[derive(Clone, Debug)]
pub struct ImageAvailability {
    pub digest: Option<String>,
    pub stage: DependencyStage,
    pub message: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImageCacheEntry {
    pub id: String,
    pub digest: String,
    pub last_used: u64,
    /// Upper bound on disk use; images sharing layers count them twice,
    /// which errs on the side of evicting early.
    pub virtual_size_bytes: u64,
    pub marginal_size_bytes: u64,
}

pub struct PullStatus {
    pub success: AtomicBool,
    pub message: Mutex<String>,
}

pub struct ImageManager {
    committer: JsonStateCommitter,
    runtime: Arc<dyn ContainerRuntime>,
    cache: Mutex<HashMap<String, ImageCacheEntry>>,
    pulls: TaskRegistry<String, PullStatus>,
    max_image_cache_size: Option<u64>,
    stop: Arc<AtomicBool>,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl ImageManager {
    pub fn new(
        commit_file: impl Into<std::path::PathBuf>,
        runtime: Arc<dyn ContainerRuntime>,
        max_image_cache_size: Option<u64>,
    ) -> io::Result<Self> {
        let committer = JsonStateCommitter::new(commit_file);
        let cache: HashMap<String, ImageCacheEntry> = committer.load_or_default()?;
        Ok(ImageManager {
            committer,
            runtime,
            cache: Mutex::new(cache),
            pulls: TaskRegistry::new(),
            max_image_cache_size,
            stop: Arc::new(AtomicBool::new(false)),
            cleanup_task: Mutex::new(None),
        })
    }

    pub fn save_state(&self) -> io::Result<()> {
        self.committer.commit(&*self.cache.lock())
    }

    pub fn start(self: &Arc<Self>) {
        info!("starting image manager");
        if self.max_image_cache_size.is_none() {
            return;
        }
        let manager = self.clone();
        let task = tokio::spawn(async move {
            while !manager.stop.load(Ordering::SeqCst) {
                if let Err(e) = manager.cleanup().await {
                    error!(err=%e, "error pruning image cache");
                }
                if let Err(e) = manager.save_state() {
                    error!(err=%e, "error committing image cache state");
                }
                tokio::time::sleep(std::time::Duration::from_secs(10)).await;
            }
        });
        *self.cleanup_task.lock() = Some(task);
    }

    pub async fn stop(&self) {
        info!("stopping image manager");
        self.stop.store(true, Ordering::SeqCst);
        self.pulls.abort_all();
        let task = self.cleanup_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        info!("stopped image manager");
    }

    /// Requests the image, starting a pull if it is not on the machine.
    pub async fn get(&self, image_spec: &str) -> ImageAvailability {
        // A repo without a tag is ambiguous between engine operations;
        // resolve it to `:latest` once, up front.
        let image_spec = if image_spec.contains(':') {
            image_spec.to_string()
        } else {
            format!("{}:latest", image_spec)
        };

        match self.runtime.get_image(&image_spec).await {
            Ok(Some(info)) => {
                if info.digest.is_empty() {
                    return ImageAvailability {
                        digest: None,
                        stage: DependencyStage::Failed,
                        message: format!(
                            "No digest available for {}, probably because it was built \
                             locally; delete the image on the worker and try again",
                            image_spec
                        ),
                    };
                }
                self.cache.lock().insert(
                    info.digest.clone(),
                    ImageCacheEntry {
                        id: info.id.clone(),
                        digest: info.digest.clone(),
                        last_used: unix_now(),
                        virtual_size_bytes: info.virtual_size_bytes,
                        marginal_size_bytes: info.marginal_size_bytes,
                    },
                );
                self.pulls.remove(&image_spec);
                ImageAvailability {
                    digest: Some(info.digest),
                    stage: DependencyStage::Ready,
                    message: "Image ready".to_string(),
                }
            }
            Ok(None) => self.pull_or_report(&image_spec).await,
            Err(e) => ImageAvailability {
                digest: None,
                stage: DependencyStage::Failed,
                message: e.to_string(),
            },
        }
    }

    async fn pull_or_report(&self, image_spec: &str) -> ImageAvailability {
        if let Some(status) = self.pulls.get(&image_spec.to_string()) {
            if self.pulls.is_running(&image_spec.to_string()) {
                return ImageAvailability {
                    digest: None,
                    stage: DependencyStage::Downloading,
                    message: status.message.lock().clone(),
                };
            }
            let availability = if status.success.load(Ordering::SeqCst) {
                match self.runtime.get_image(image_spec).await {
                    Ok(Some(info)) => ImageAvailability {
                        digest: Some(info.digest),
                        stage: DependencyStage::Ready,
                        message: status.message.lock().clone(),
                    },
                    _ => ImageAvailability {
                        digest: None,
                        stage: DependencyStage::Failed,
                        message: "image vanished after pull".to_string(),
                    },
                }
            } else {
                ImageAvailability {
                    digest: None,
                    stage: DependencyStage::Failed,
                    message: status.message.lock().clone(),
                }
            };
            self.pulls.remove(&image_spec.to_string());
            return availability;
        }

        let runtime = self.runtime.clone();
        let spec = image_spec.to_string();
        self.pulls.add_if_new(image_spec.to_string(), move || {
            let status = Arc::new(PullStatus {
                success: AtomicBool::new(false),
                message: Mutex::new("Pulling image".to_string()),
            });
            let shared = status.clone();
            let handle = tokio::spawn(async move {
                debug!(image=%spec, "pulling image");
                match runtime.pull_image(&spec).await {
                    Ok(()) => {
                        shared.success.store(true, Ordering::SeqCst);
                        *shared.message.lock() = "Image pulled".to_string();
                    }
                    Err(e) => {
                        *shared.message.lock() = format!("Can't download image: {}", e);
                    }
                }
            });
            (handle, status)
        });
        ImageAvailability {
            digest: None,
            stage: DependencyStage::Downloading,
            message: "Pulling image".to_string(),
        }
    }

    /// Evicts least-recently-used images until the sum of virtual sizes
    /// fits the ceiling. Images the engine refuses to delete (still in use
    /// by a long run) are skipped this round.
    pub(crate) async fn cleanup(&self) -> io::Result<()> {
        let Some(max_size) = self.max_image_cache_size else {
            return Ok(());
        };
        let mut deletable: Vec<ImageCacheEntry> = self.cache.lock().values().cloned().collect();
        loop {
            let disk_use: u64 = deletable.iter().map(|e| e.virtual_size_bytes).sum();
            if disk_use <= max_size {
                return Ok(());
            }
            let victim = deletable
                .iter()
                .min_by_key(|e| e.last_used)
                .cloned()
                .expect("non-zero disk use implies entries");
            info!(
                disk_use,
                max_size,
                digest = %victim.digest,
                "image cache over budget, pruning"
            );
            match self.runtime.remove_image(&victim.id).await {
                Ok(()) => {
                    self.cache.lock().remove(&victim.digest);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    // Gone already; stop tracking it.
                    self.cache.lock().remove(&victim.digest);
                }
                Err(e) => {
                    error!(digest=%victim.digest, err=%e, "cannot remove image from cache");
                }
            }
            deletable.retain(|e| e.digest != victim.digest);
        }
    }

    #[cfg(test)]
    pub(crate) fn cached_digests(&self) -> Vec<String> {
        self.cache.lock().keys().cloned().collect()
    }
}
