//! Handles the `read` directives: resolves the requested path inside the
//! bundle, then streams target info, directory tarballs, files, file
//! sections or summaries back through the reply channel. Streaming reads
//! run as background tasks so the checkin loop stays fast.

use parking_lot::Mutex;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::warn;

use longshore_bundle::messages::ReadArgs;

use crate::fsutil::{
    get_target_path, gzip_bytes, gzip_file_stream, read_file_section, summarize_file,
    tar_gz_directory_stream,
};
use crate::run_state::RunState;
use crate::service::BundleService;

const HTTP_NOT_FOUND: u16 = 404;
const HTTP_BAD_REQUEST: u16 = 400;
const HTTP_INTERNAL_SERVER_ERROR: u16 = 500;

#[derive(Default)]
pub struct Reader {
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Reader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for in-flight read streams to drain.
    pub async fn stop(&self) {
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(err=%e, "read task failed");
            }
        }
    }

    pub async fn read(
        &self,
        service: Arc<dyn BundleService>,
        worker_id: &str,
        run: &RunState,
        path: &str,
        args: ReadArgs,
        socket_id: &str,
    ) {
        let dep_paths: BTreeSet<String> = run
            .bundle
            .dependencies
            .iter()
            .map(|dep| dep.child_path.clone())
            .collect();

        let target = match get_target_path(&run.bundle_path, &run.bundle.uuid, path) {
            Ok(target) => target,
            Err(e) => {
                let _ = service
                    .reply(
                        worker_id,
                        socket_id,
                        Some((HTTP_NOT_FOUND, e.to_string())),
                        json!({}),
                    )
                    .await;
                return;
            }
        };

        match args {
            ReadArgs::GetTargetInfo { depth } => {
                // Dependency mounts are not part of the bundle's own
                // contents; asking for one is a miss.
                if !path.is_empty() && dep_paths.contains(path) {
                    let _ = service
                        .reply(
                            worker_id,
                            socket_id,
                            Some((
                                HTTP_NOT_FOUND,
                                format!("{} not found in bundle {}", path, run.bundle.uuid),
                            )),
                            json!({}),
                        )
                        .await;
                    return;
                }
                let exclude = if path.is_empty() { dep_paths } else { BTreeSet::new() };
                match target_info(&target, depth, &exclude) {
                    Ok(info) => {
                        let _ = service
                            .reply(worker_id, socket_id, None, json!({ "target_info": info }))
                            .await;
                    }
                    Err(e) => {
                        let _ = service
                            .reply(
                                worker_id,
                                socket_id,
                                Some((HTTP_NOT_FOUND, e.to_string())),
                                json!({}),
                            )
                            .await;
                    }
                }
            }
            ReadArgs::StreamDirectory => {
                let exclude: Vec<String> = if path.is_empty() {
                    dep_paths.into_iter().collect()
                } else {
                    Vec::new()
                };
                self.spawn_reply_data(service, worker_id, socket_id, move || {
                    Ok(tar_gz_directory_stream(target, exclude))
                });
            }
            ReadArgs::StreamFile => {
                self.spawn_reply_data(service, worker_id, socket_id, move || {
                    Ok(gzip_file_stream(target))
                });
            }
            ReadArgs::ReadFileSection { offset, length } => {
                let service = service.clone();
                let worker_id = worker_id.to_string();
                let socket_id = socket_id.to_string();
                self.track(tokio::spawn(async move {
                    let result = async {
                        let section = read_file_section(&target, offset, length).await?;
                        gzip_bytes(&section).await
                    }
                    .await;
                    reply_bytes(&*service, &worker_id, &socket_id, result).await;
                }));
            }
            ReadArgs::SummarizeFile {
                num_head_lines,
                num_tail_lines,
                max_line_length,
                truncation_text,
            } => {
                let service = service.clone();
                let worker_id = worker_id.to_string();
                let socket_id = socket_id.to_string();
                self.track(tokio::spawn(async move {
                    let result = async {
                        let summary = summarize_file(
                            &target,
                            num_head_lines,
                            num_tail_lines,
                            max_line_length,
                            &truncation_text,
                        )
                        .await?;
                        gzip_bytes(summary.as_bytes()).await
                    }
                    .await;
                    reply_bytes(&*service, &worker_id, &socket_id, result).await;
                }));
            }
        }
    }

    fn spawn_reply_data(
        &self,
        service: Arc<dyn BundleService>,
        worker_id: &str,
        socket_id: &str,
        open: impl FnOnce() -> std::io::Result<Box<dyn tokio::io::AsyncRead + Send + Unpin>>
            + Send
            + 'static,
    ) {
        let worker_id = worker_id.to_string();
        let socket_id = socket_id.to_string();
        self.track(tokio::spawn(async move {
            match open() {
                Ok(stream) => {
                    if let Err(e) = service
                        .reply_data(&worker_id, &socket_id, json!({}), stream)
                        .await
                    {
                        warn!(err=%e, "could not stream read reply");
                    }
                }
                Err(e) => {
                    let _ = service
                        .reply(
                            &worker_id,
                            &socket_id,
                            Some((HTTP_INTERNAL_SERVER_ERROR, e.to_string())),
                            json!({}),
                        )
                        .await;
                }
            }
        }));
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }
}

async fn reply_bytes(
    service: &dyn BundleService,
    worker_id: &str,
    socket_id: &str,
    result: std::io::Result<Vec<u8>>,
) {
    match result {
        Ok(data) => {
            let _ = service
                .reply_data(
                    worker_id,
                    socket_id,
                    json!({}),
                    Box::new(std::io::Cursor::new(data)),
                )
                .await;
        }
        Err(e) => {
            let code = if e.kind() == std::io::ErrorKind::NotFound {
                HTTP_NOT_FOUND
            } else {
                HTTP_BAD_REQUEST
            };
            let _ = service
                .reply(worker_id, socket_id, Some((code, e.to_string())), json!({}))
                .await;
        }
    }
}

/// Describes a path in a bundle: name, type, size and, for directories up
/// to `depth`, children. Top-level entries in `exclude` are hidden.
fn target_info(
    path: &std::path::Path,
    depth: usize,
    exclude: &BTreeSet<String>,
) -> std::io::Result<serde_json::Value> {
    let metadata = std::fs::symlink_metadata(path)?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let kind = if metadata.file_type().is_symlink() {
        "link"
    } else if metadata.is_dir() {
        "directory"
    } else {
        "file"
    };
    let mut info = json!({
        "name": name,
        "type": kind,
        "size": metadata.len(),
    });
    if metadata.is_dir() && depth > 0 {
        let mut contents = Vec::new();
        let mut entries: Vec<_> = std::fs::read_dir(path)?
            .collect::<Result<Vec<_>, _>>()?;
        entries.sort_by_key(|entry| entry.file_name());
        for entry in entries {
            let child_name = entry.file_name().to_string_lossy().into_owned();
            if exclude.contains(&child_name) {
                continue;
            }
            contents.push(target_info(&entry.path(), depth - 1, &BTreeSet::new())?);
        }
        info["contents"] = serde_json::Value::Array(contents);
    }
    Ok(info)
}
