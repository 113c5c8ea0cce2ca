use serde::{Deserialize, Serialize};

use crate::fmt::size_str;

/// Minimum container memory request, 4 MiB, the same as docker's own
/// minimum allowed value. The REST surface allows 0, which would give the
/// container unbounded access to host memory; the manager refuses it.
pub const MIN_REQUEST_MEMORY_BYTES: u64 = 4 << 20;

/// Deducted from the user's remaining disk quota when computing the
/// default disk request, so a defaulted run cannot consume the quota to
/// the last byte.
pub const DISK_QUOTA_SLACK_BYTES: u64 = 512 << 20;

/// The resource envelope of a run, computed at dispatch time and carried
/// in the `run` message. The same record doubles as a worker's advertised
/// capacity when the scheduler checks domination.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunResources {
    pub cpus: u32,
    pub gpus: u32,
    /// Memory ceiling in bytes.
    pub memory: u64,
    /// Disk ceiling in bytes.
    pub disk: u64,
    /// Wall-clock ceiling in seconds; `None` leaves the run unconstrained.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<u64>,
    /// `repo:tag` image spec; the manager appends `:latest` when no tag is
    /// given.
    #[serde(default)]
    pub docker_image: String,
    #[serde(default)]
    pub network: bool,
    /// Queue name; a set tag restricts the run to workers carrying it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default)]
    pub tag_exclusive: bool,
    /// Remaining run budget of a worker; `Some(0)` means the worker is
    /// draining and accepts nothing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runs_left: Option<i64>,
}

impl RunResources {
    /// Whether this (a worker's advertised capacity) can satisfy `request`.
    ///
    /// Tag rules: a tagged request only matches a worker with exactly that
    /// tag; a tag-exclusive worker refuses untagged requests. A worker out
    /// of run budget dominates nothing. With `strict`, every resource
    /// dimension must be strictly greater; that flavour is only used to
    /// drop strictly-worse workers from resource recommendations.
    pub fn dominates(&self, request: &RunResources, strict: bool) -> bool {
        match request.tag.as_deref() {
            Some(tag) => {
                if self.tag.as_deref() != Some(tag) {
                    return false;
                }
            }
            None => {
                if self.tag_exclusive {
                    return false;
                }
            }
        }
        if matches!(self.runs_left, Some(n) if n <= 0) {
            return false;
        }
        let fits = |have: u64, want: u64| if strict { have > want } else { have >= want };
        fits(self.cpus as u64, request.cpus as u64)
            && fits(self.gpus as u64, request.gpus as u64)
            && fits(self.memory, request.memory)
            && fits(self.disk, request.disk)
    }

    /// Renders this worker's capacity against a request: the dimensions
    /// where it falls short, or the full capacity when only the tag was
    /// the problem. Feeds the `Available resources: …` recommendation.
    pub fn comparison(&self, request: &RunResources) -> String {
        let mut lacking = Vec::new();
        if (self.cpus) < request.cpus {
            lacking.push(format!("cpus: {} (requested {})", self.cpus, request.cpus));
        }
        if self.gpus < request.gpus {
            lacking.push(format!("gpus: {} (requested {})", self.gpus, request.gpus));
        }
        if self.memory < request.memory {
            lacking.push(format!(
                "memory: {} (requested {})",
                size_str(self.memory),
                size_str(request.memory)
            ));
        }
        if self.disk < request.disk {
            lacking.push(format!(
                "disk: {} (requested {})",
                size_str(self.disk),
                size_str(request.disk)
            ));
        }
        if lacking.is_empty() {
            return format!(
                "cpus: {}, gpus: {}, memory: {}, disk: {}",
                self.cpus,
                self.gpus,
                size_str(self.memory),
                size_str(self.disk)
            );
        }
        lacking.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(cpus: u32, gpus: u32, memory: u64, disk: u64) -> RunResources {
        RunResources {
            cpus,
            gpus,
            memory,
            disk,
            ..Default::default()
        }
    }

    #[test]
    fn domination_is_componentwise() {
        let capacity = worker(4, 1, 8 << 30, 100 << 30);
        let mut request = worker(4, 1, 8 << 30, 100 << 30);
        assert!(capacity.dominates(&request, false));
        assert!(!capacity.dominates(&request, true));
        request.memory += 1;
        assert!(!capacity.dominates(&request, false));
    }

    #[test]
    fn tagged_requests_need_exact_tag() {
        let mut capacity = worker(4, 0, 8 << 30, 100 << 30);
        let mut request = worker(1, 0, 1 << 30, 1 << 30);
        request.tag = Some("gpu-queue".into());
        assert!(!capacity.dominates(&request, false));
        capacity.tag = Some("gpu-queue".into());
        assert!(capacity.dominates(&request, false));
    }

    #[test]
    fn tag_exclusive_worker_refuses_untagged() {
        let mut capacity = worker(4, 0, 8 << 30, 100 << 30);
        capacity.tag = Some("private".into());
        capacity.tag_exclusive = true;
        let request = worker(1, 0, 1 << 30, 1 << 30);
        assert!(!capacity.dominates(&request, false));
    }

    #[test]
    fn drained_worker_dominates_nothing() {
        let mut capacity = worker(64, 8, 512 << 30, 1 << 40);
        capacity.runs_left = Some(0);
        assert!(!capacity.dominates(&worker(1, 0, 1 << 20, 1 << 20), false));
    }

    #[test]
    fn comparison_lists_shortfalls() {
        let capacity = worker(2, 0, 1 << 30, 100 << 30);
        let request = worker(4, 0, 2 << 30, 1 << 30);
        let rendered = capacity.comparison(&request);
        assert!(rendered.contains("cpus: 2 (requested 4)"));
        assert!(rendered.contains("memory: 1.0g (requested 2.0g)"));
        assert!(!rendered.contains("disk:"));
    }
}
