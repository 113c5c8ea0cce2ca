use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::BundleState;

/// The worker-local stages of a run. The wire strings are stable; the
/// server maps them onto bundle states with [RunStage::server_state].
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStage {
    /// Downloading dependencies and the image, then starting the container.
    Preparing,
    /// The container is running.
    Running,
    /// Tearing down the container and the dependency symlinks.
    CleaningUp,
    /// Uploading the bundle directory to the store.
    UploadingResults,
    /// Reported finished, waiting for the server's acknowledgement.
    Finalizing,
    /// Acknowledged; the run record is dropped at the next sweep.
    Finished,
}

impl RunStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStage::Preparing => "PREPARING",
            RunStage::Running => "RUNNING",
            RunStage::CleaningUp => "CLEANING_UP",
            RunStage::UploadingResults => "UPLOADING_RESULTS",
            RunStage::Finalizing => "FINALIZING",
            RunStage::Finished => "FINISHED",
        }
    }

    /// The bundle state the server records for a run in this stage.
    /// Cleanup and upload still count as RUNNING from the outside.
    pub fn server_state(&self) -> BundleState {
        match self {
            RunStage::Preparing => BundleState::Preparing,
            RunStage::Running | RunStage::CleaningUp | RunStage::UploadingResults => {
                BundleState::Running
            }
            RunStage::Finalizing => BundleState::Finalizing,
            RunStage::Finished => BundleState::Ready,
        }
    }
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wall-clock bookkeeping for one stage of a run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StageTimes {
    pub start: u64,
    pub end: u64,
    pub elapsed: u64,
}

/// Everything a worker reports for one of its runs at checkin time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BundleCheckinState {
    pub uuid: String,
    pub run_status: String,
    pub bundle_start_time: u64,
    pub container_time_total: u64,
    pub container_time_user: u64,
    pub container_time_system: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_image: Option<String>,
    /// The mapped server state, not the raw stage.
    pub state: BundleState,
    /// Id of the reporting worker.
    pub remote: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exitcode: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
    /// Whether the run was killed (by the user or a resource ceiling);
    /// decides KILLED over FAILED once the run finalizes.
    #[serde(default)]
    pub is_killed: bool,
    /// Elapsed time per stage, keyed by the stable stage strings.
    #[serde(default)]
    pub stage_times: BTreeMap<RunStage, StageTimes>,
}
