//! The worker's view of the bundle server: checkins, dependency content
//! streams, result uploads and read-directive replies. [MemoryBundleService]
//! backs the tests and single-process demos, the way the platform's other
//! seams ship memory implementations.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use longshore_bundle::messages::{ReplyError, ServerMessage, StartMessage, WorkerCheckin};
use longshore_bundle::DependencyKey;

#[derive(Debug, Error)]
pub enum ServiceError {
    /// The server rejected the request; retrying will not help.
    #[error("{0}")]
    Client(String),

    /// Transport-level trouble; retry later.
    #[error("bundle service unavailable: {0}")]
    Unavailable(String),
}

impl ServiceError {
    pub fn is_client_error(&self) -> bool {
        matches!(self, ServiceError::Client(_))
    }
}

impl From<io::Error> for ServiceError {
    fn from(value: io::Error) -> Self {
        ServiceError::Unavailable(value.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetKind {
    File,
    Directory,
}

/// Called with the running byte count as content moves; returning false
/// aborts the transfer (killable uploads).
pub type ProgressCallback = Arc<dyn Fn(u64) -> bool + Send + Sync>;

#[async_trait]
pub trait BundleService: Send + Sync {
    /// Posts the worker's state; the response carries at most one
    /// directive.
    async fn checkin(
        &self,
        worker_id: &str,
        checkin: WorkerCheckin,
    ) -> Result<Option<ServerMessage>, ServiceError>;

    /// Confirms a freshly dispatched bundle is still assigned to this
    /// worker before the run is created.
    async fn start_bundle(
        &self,
        worker_id: &str,
        uuid: &str,
        start: &StartMessage,
    ) -> Result<bool, ServiceError>;

    async fn target_kind(&self, key: &DependencyKey) -> Result<TargetKind, ServiceError>;

    /// Streaming read of a dependency's contents: a gzipped tarball for
    /// directories, raw bytes for files.
    async fn open_contents(
        &self,
        key: &DependencyKey,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, ServiceError>;

    /// Uploads a bundle directory to the store, reporting progress per
    /// chunk through `progress`.
    async fn upload_contents(
        &self,
        worker_id: &str,
        uuid: &str,
        path: &Path,
        progress: ProgressCallback,
    ) -> Result<(), ServiceError>;

    async fn reply(
        &self,
        worker_id: &str,
        socket_id: &str,
        err: Option<ReplyError>,
        message: serde_json::Value,
    ) -> Result<(), ServiceError>;

    async fn reply_data(
        &self,
        worker_id: &str,
        socket_id: &str,
        message: serde_json::Value,
        data: Box<dyn AsyncRead + Send + Unpin>,
    ) -> Result<(), ServiceError>;
}

/// Recorded reply, for assertions.
#[derive(Debug)]
pub enum RecordedReply {
    Message {
        socket_id: String,
        err: Option<ReplyError>,
        message: serde_json::Value,
    },
    Data {
        socket_id: String,
        message: serde_json::Value,
        data: Vec<u8>,
    },
}

/// In-memory bundle service: directives are queued by hand, dependency
/// contents live in a map, uploads record their byte counts.
#[derive(Default)]
pub struct MemoryBundleService {
    directives: Mutex<VecDeque<ServerMessage>>,
    contents: Mutex<HashMap<DependencyKey, (TargetKind, Vec<u8>)>>,
    uploads: Mutex<HashMap<String, u64>>,
    replies: Mutex<Vec<RecordedReply>>,
    checkins: Mutex<Vec<WorkerCheckin>>,
}

impl MemoryBundleService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_directive(&self, message: ServerMessage) {
        self.directives.lock().push_back(message);
    }

    /// Registers dependency contents. Directories take pre-packed gzipped
    /// tarballs, files raw bytes.
    pub fn put_contents(&self, key: DependencyKey, kind: TargetKind, data: Vec<u8>) {
        self.contents.lock().insert(key, (kind, data));
    }

    pub fn uploaded_bytes(&self, uuid: &str) -> Option<u64> {
        self.uploads.lock().get(uuid).copied()
    }

    pub fn take_replies(&self) -> Vec<RecordedReply> {
        std::mem::take(&mut self.replies.lock())
    }

    pub fn checkin_count(&self) -> usize {
        self.checkins.lock().len()
    }
}

#[async_trait]
impl BundleService for MemoryBundleService {
    async fn checkin(
        &self,
        _worker_id: &str,
        checkin: WorkerCheckin,
    ) -> Result<Option<ServerMessage>, ServiceError> {
        self.checkins.lock().push(checkin);
        Ok(self.directives.lock().pop_front())
    }

    async fn start_bundle(
        &self,
        _worker_id: &str,
        _uuid: &str,
        _start: &StartMessage,
    ) -> Result<bool, ServiceError> {
        Ok(true)
    }

    async fn target_kind(&self, key: &DependencyKey) -> Result<TargetKind, ServiceError> {
        self.contents
            .lock()
            .get(key)
            .map(|(kind, _)| *kind)
            .ok_or_else(|| ServiceError::Client(format!("no such target: {}", key)))
    }

    async fn open_contents(
        &self,
        key: &DependencyKey,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, ServiceError> {
        let data = self
            .contents
            .lock()
            .get(key)
            .map(|(_, data)| data.clone())
            .ok_or_else(|| ServiceError::Client(format!("no such target: {}", key)))?;
        Ok(Box::new(std::io::Cursor::new(data)))
    }

    async fn upload_contents(
        &self,
        _worker_id: &str,
        uuid: &str,
        path: &Path,
        progress: ProgressCallback,
    ) -> Result<(), ServiceError> {
        let mut stream = crate::fsutil::tar_gz_directory_stream(path.to_path_buf(), Vec::new());
        let mut total = 0u64;
        let mut buffer = vec![0u8; 8192];
        loop {
            let n = stream.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            total += n as u64;
            if !progress(total) {
                return Err(ServiceError::Client("upload aborted".to_string()));
            }
        }
        self.uploads.lock().insert(uuid.to_string(), total);
        Ok(())
    }

    async fn reply(
        &self,
        _worker_id: &str,
        socket_id: &str,
        err: Option<ReplyError>,
        message: serde_json::Value,
    ) -> Result<(), ServiceError> {
        self.replies.lock().push(RecordedReply::Message {
            socket_id: socket_id.to_string(),
            err,
            message,
        });
        Ok(())
    }

    async fn reply_data(
        &self,
        _worker_id: &str,
        socket_id: &str,
        message: serde_json::Value,
        mut data: Box<dyn AsyncRead + Send + Unpin>,
    ) -> Result<(), ServiceError> {
        let mut buffer = Vec::new();
        data.read_to_end(&mut buffer).await?;
        self.replies.lock().push(RecordedReply::Data {
            socket_id: socket_id.to_string(),
            message,
            data: buffer,
        });
        Ok(())
    }
}
