use serde::Deserialize;

use longshore_bundle::fmt::{parse_duration, parse_size, ParseError};
use longshore_bundle::MIN_REQUEST_MEMORY_BYTES;

/// Clean up workers we haven't heard from for this long; they probably
/// died without checking out properly.
pub const DEFAULT_WORKER_TIMEOUT_SECONDS: u64 = 60;

/// The `workers` configuration section as written in the config file:
/// sizes and durations are human-readable strings (`"4m"`, `"24h"`).
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkersSection {
    pub max_request_time: Option<String>,
    pub max_request_memory: Option<String>,
    pub min_request_memory: Option<String>,
    pub max_request_disk: Option<String>,
    pub default_cpu_image: Option<String>,
    pub default_gpu_image: Option<String>,
    pub worker_timeout_seconds: Option<u64>,
}

/// The parsed server configuration the manager actually works with.
/// `None` ceilings are unlimited.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub max_request_time: Option<u64>,
    pub max_request_memory: Option<u64>,
    pub min_request_memory: u64,
    pub max_request_disk: Option<u64>,
    pub default_cpu_image: Option<String>,
    pub default_gpu_image: Option<String>,
    pub worker_timeout_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            max_request_time: None,
            max_request_memory: None,
            min_request_memory: MIN_REQUEST_MEMORY_BYTES,
            max_request_disk: None,
            default_cpu_image: None,
            default_gpu_image: None,
            worker_timeout_seconds: DEFAULT_WORKER_TIMEOUT_SECONDS,
        }
    }
}

impl TryFrom<WorkersSection> for ServerConfig {
    type Error = ParseError;

    fn try_from(section: WorkersSection) -> Result<Self, Self::Error> {
        Ok(ServerConfig {
            max_request_time: section
                .max_request_time
                .as_deref()
                .map(parse_duration)
                .transpose()?,
            max_request_memory: section
                .max_request_memory
                .as_deref()
                .map(parse_size)
                .transpose()?,
            min_request_memory: section
                .min_request_memory
                .as_deref()
                .map(parse_size)
                .transpose()?
                .unwrap_or(MIN_REQUEST_MEMORY_BYTES),
            max_request_disk: section
                .max_request_disk
                .as_deref()
                .map(parse_size)
                .transpose()?,
            default_cpu_image: section.default_cpu_image,
            default_gpu_image: section.default_gpu_image,
            worker_timeout_seconds: section
                .worker_timeout_seconds
                .unwrap_or(DEFAULT_WORKER_TIMEOUT_SECONDS),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_human_readable_limits() {
        let section = WorkersSection {
            max_request_time: Some("24h".into()),
            max_request_memory: Some("16g".into()),
            min_request_memory: None,
            max_request_disk: Some("100g".into()),
            default_cpu_image: Some("library/ubuntu".into()),
            default_gpu_image: None,
            worker_timeout_seconds: None,
        };
        let config = ServerConfig::try_from(section).unwrap();
        assert_eq!(config.max_request_time, Some(86400));
        assert_eq!(config.max_request_memory, Some(16 << 30));
        assert_eq!(config.min_request_memory, MIN_REQUEST_MEMORY_BYTES);
        assert_eq!(config.worker_timeout_seconds, 60);
    }
}
