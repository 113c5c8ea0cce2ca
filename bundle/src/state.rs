use serde::{Deserialize, Serialize};
use std::fmt;

/// The lifecycle states of a bundle, as stored in the bundle table.
///
/// The wire representation is the lowercase name; these strings are stable
/// and shared with every worker that ever checks in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleState {
    /// Waiting for contents to be uploaded.
    Uploading,
    /// Just created.
    Created,
    /// All the dependencies are met.
    Staged,
    /// A make bundle being assembled.
    Making,
    /// Waiting for the worker to start running the bundle.
    Starting,
    /// Waiting for the worker to download dependencies and images.
    Preparing,
    /// Actually running.
    Running,
    /// Run finished and finalized server-side, tell the worker to discard it.
    Finalizing,
    /// Done running and succeeded.
    Ready,
    /// Done running and failed.
    Failed,
    /// Killed by the user.
    Killed,
    /// The assigned worker has gone offline.
    WorkerOffline,
}

impl BundleState {
    /// States in which a worker or the manager is actively driving the bundle.
    pub const ACTIVE_STATES: &'static [BundleState] = &[
        BundleState::Making,
        BundleState::Starting,
        BundleState::Running,
        BundleState::Finalizing,
        BundleState::Preparing,
    ];

    /// Terminal states; bundles never leave these.
    pub const FINAL_STATES: &'static [BundleState] =
        &[BundleState::Ready, BundleState::Failed, BundleState::Killed];

    pub fn is_final(&self) -> bool {
        Self::FINAL_STATES.contains(self)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BundleState::Uploading => "uploading",
            BundleState::Created => "created",
            BundleState::Staged => "staged",
            BundleState::Making => "making",
            BundleState::Starting => "starting",
            BundleState::Preparing => "preparing",
            BundleState::Running => "running",
            BundleState::Finalizing => "finalizing",
            BundleState::Ready => "ready",
            BundleState::Failed => "failed",
            BundleState::Killed => "killed",
            BundleState::WorkerOffline => "worker_offline",
        }
    }
}

impl fmt::Display for BundleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::BundleState;

    #[test]
    fn wire_representation_is_lowercase() {
        assert_eq!(
            serde_json::to_string(&BundleState::WorkerOffline).unwrap(),
            "\"worker_offline\""
        );
        assert_eq!(
            serde_json::from_str::<BundleState>("\"staged\"").unwrap(),
            BundleState::Staged
        );
    }

    #[test]
    fn final_states_are_terminal() {
        for state in BundleState::FINAL_STATES {
            assert!(state.is_final());
            assert!(!BundleState::ACTIVE_STATES.contains(state));
        }
    }
}
