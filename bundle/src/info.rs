use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::BundleState;

/// The type of a bundle, which decides how the manager drives it through
/// its lifecycle: run bundles get scheduled onto workers, make bundles get
/// assembled server-side, everything else only ever has contents uploaded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleType {
    Run,
    Make,
    Dataset,
}

/// Uniquely identifies a dependency on a worker: the parent bundle and the
/// subpath inside it (empty for the whole parent). Child information is
/// deliberately absent, since multiple child bundles can share the same
/// parent dependency.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DependencyKey {
    pub parent_uuid: String,
    pub parent_path: String,
}

impl DependencyKey {
    pub fn new(parent_uuid: impl Into<String>, parent_path: impl Into<String>) -> Self {
        DependencyKey {
            parent_uuid: parent_uuid.into(),
            parent_path: parent_path.into(),
        }
    }
}

/// Renders as `parent_uuid` or `parent_uuid/parent_path`. Bundle uuids
/// never contain a separator, so the first `/` splits unambiguously.
impl fmt::Display for DependencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.parent_path.is_empty() {
            f.write_str(&self.parent_uuid)
        } else {
            write!(f, "{}/{}", self.parent_uuid, self.parent_path)
        }
    }
}

impl FromStr for DependencyKey {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.split_once('/') {
            Some((uuid, path)) => DependencyKey::new(uuid, path),
            None => DependencyKey::new(s, ""),
        })
    }
}

/// A parent bundle (and optional subpath) mounted into a child bundle at
/// `child_path`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub parent_uuid: String,
    pub parent_path: String,
    pub child_uuid: String,
    pub child_path: String,
    /// Actual path of the parent bundle, only set on run messages to
    /// shared-filesystem workers which read parents in place.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl Dependency {
    pub fn key(&self) -> DependencyKey {
        DependencyKey::new(self.parent_uuid.clone(), self.parent_path.clone())
    }
}

/// The recognized metadata fields of a bundle, plus a side-bag for
/// everything else a client may have attached. Resource requests are kept
/// as the raw strings the user typed (`"2g"`, `"4m"`); they are parsed at
/// validation time so that a bad value fails the bundle, not the server.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BundleMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_cpus: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_gpus: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_memory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_disk: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_docker_image: Option<String>,
    #[serde(default)]
    pub request_network: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_queue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_priority: Option<i64>,
    #[serde(default)]
    pub allow_failed_dependencies: bool,
    #[serde(default)]
    pub preemptible: bool,

    /// Creation time, seconds since the epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<u64>,
    /// Last time a worker or the manager touched the bundle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_traceback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staged_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exitcode: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_image: Option<String>,

    /// Id of the worker currently (or last) running the bundle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,
    /// Workers this bundle has previously run on, for preemptible runs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remote_history: Vec<String>,

    /// Overrides the bundle store location when contents live elsewhere.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_preparing: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_running: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_cleaning_up: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_uploading_results: Option<u64>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl BundleMetadata {
    /// The queue tag, with the empty string normalized away.
    pub fn request_queue(&self) -> Option<&str> {
        self.request_queue.as_deref().filter(|q| !q.is_empty())
    }
}

/// A bundle as the manager and the workers see it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BundleInfo {
    pub uuid: String,
    pub bundle_type: BundleType,
    pub owner_id: String,
    /// Opaque command line; empty for non-run bundles.
    #[serde(default)]
    pub command: String,
    pub state: BundleState,
    #[serde(default)]
    pub is_frozen: bool,
    #[serde(default)]
    pub is_anonymous: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_hash: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    #[serde(default)]
    pub metadata: BundleMetadata,
    /// Bundle location on disk, only set on run messages to
    /// shared-filesystem workers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl BundleInfo {
    /// The set of dependency keys this bundle needs.
    pub fn dependency_keys(&self) -> impl Iterator<Item = DependencyKey> + '_ {
        self.dependencies.iter().map(Dependency::key)
    }
}

#[cfg(test)]
mod tests {
    use super::DependencyKey;
    use rstest::rstest;

    #[rstest]
    #[case::whole_parent("0x1111", "", "0x1111")]
    #[case::subpath("0x1111", "out/model", "0x1111/out/model")]
    fn dependency_key_roundtrip(
        #[case] parent_uuid: &str,
        #[case] parent_path: &str,
        #[case] rendered: &str,
    ) {
        let key = DependencyKey::new(parent_uuid, parent_path);
        assert_eq!(key.to_string(), rendered);
        assert_eq!(rendered.parse::<DependencyKey>().unwrap(), key);
    }
}
