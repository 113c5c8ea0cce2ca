//! The JSON messages exchanged between the bundle manager and its workers.
//!
//! Directives flow server→worker through the worker's socket and are
//! dispatched one per checkin; replies to read/netcat directives flow back
//! through the reply channel identified by `socket_id`.

use serde::{Deserialize, Serialize};

use crate::{BundleCheckinState, BundleInfo, DependencyKey, RunResources};

/// A directive sent to a worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Start running a bundle with the given resource envelope.
    Run {
        bundle: Box<BundleInfo>,
        resources: RunResources,
    },
    /// Stream contents out of a running bundle.
    Read {
        uuid: String,
        path: String,
        read_args: ReadArgs,
        socket_id: String,
    },
    /// Proxy a message to a port inside the container.
    Netcat {
        uuid: String,
        port: u16,
        message: String,
        socket_id: String,
    },
    /// Write a string into the bundle directory.
    Write {
        uuid: String,
        subpath: String,
        string: String,
    },
    Kill {
        uuid: String,
    },
    /// The server has persisted the finish; the worker may discard the run.
    MarkFinalized {
        uuid: String,
    },
}

/// The five read modes of the `read` directive.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReadArgs {
    GetTargetInfo {
        depth: usize,
    },
    StreamDirectory,
    StreamFile,
    ReadFileSection {
        offset: u64,
        length: u64,
    },
    SummarizeFile {
        num_head_lines: usize,
        num_tail_lines: usize,
        max_line_length: usize,
        truncation_text: String,
    },
}

/// An error reply: http-ish status code plus text.
pub type ReplyError = (u16, String);

/// Sent alongside a worker's claim of a freshly dispatched bundle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StartMessage {
    pub hostname: String,
    pub start_time: u64,
}

/// The worker's periodic checkin payload.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerCheckin {
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default)]
    pub tag_exclusive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
    pub cpus: u32,
    pub gpus: u32,
    pub memory_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub free_disk_bytes: Option<u64>,
    /// Dependency keys present in this worker's cache.
    #[serde(default)]
    pub dependencies: Vec<DependencyKey>,
    pub hostname: String,
    #[serde(default)]
    pub runs: Vec<BundleCheckinState>,
    #[serde(default)]
    pub shared_file_system: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_after_num_runs: Option<i64>,
    #[serde(default)]
    pub is_terminating: bool,
}
