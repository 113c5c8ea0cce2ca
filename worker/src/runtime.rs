//! The seam to the container engine. The worker never shells out to
//! docker directly; everything it needs is behind [ContainerRuntime], so
//! deployments plug in their engine of choice and tests plug in a fake.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::io;
use std::net::IpAddr;
use std::path::PathBuf;

/// Everything needed to start one run's container.
#[derive(Clone, Debug, Default)]
pub struct ContainerSpec {
    pub uuid: String,
    pub bundle_path: PathBuf,
    pub command: String,
    pub image: String,
    /// `(host path, container path)` read-only binds for dependencies.
    pub dependencies: Vec<(PathBuf, String)>,
    pub network: String,
    pub cpuset: BTreeSet<String>,
    pub gpuset: BTreeSet<String>,
    pub memory_bytes: u64,
    /// Engine runtime name, e.g. `runc` or `nvidia`.
    pub runtime: String,
}

#[derive(Clone, Debug, Default)]
pub struct ContainerStatus {
    pub finished: bool,
    pub exitcode: Option<i32>,
    pub failure_message: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct ContainerStats {
    pub memory_bytes: u64,
    /// Container wall-clock runtime in seconds.
    pub time_total: u64,
    pub time_user: u64,
    pub time_system: u64,
}

#[derive(Clone, Debug)]
pub struct ImageInfo {
    pub id: String,
    pub digest: String,
    /// Upper bound on the image's disk use; shared layers are counted per
    /// image.
    pub virtual_size_bytes: u64,
    pub marginal_size_bytes: u64,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn start_container(&self, spec: &ContainerSpec) -> io::Result<String>;

    async fn container_exists(&self, container_id: &str) -> io::Result<bool>;

    async fn check_finished(&self, container_id: &str) -> io::Result<ContainerStatus>;

    async fn container_stats(&self, container_id: &str) -> io::Result<ContainerStats>;

    async fn kill_container(&self, container_id: &str) -> io::Result<()>;

    async fn remove_container(&self, container_id: &str) -> io::Result<()>;

    async fn container_ip(&self, network: &str, container_id: &str) -> io::Result<IpAddr>;

    /// Local image lookup; `Ok(None)` means not present.
    async fn get_image(&self, image_spec: &str) -> io::Result<Option<ImageInfo>>;

    async fn pull_image(&self, image_spec: &str) -> io::Result<()>;

    async fn remove_image(&self, id_or_digest: &str) -> io::Result<()>;

    /// Creates the network if needed and returns its name.
    async fn ensure_network(&self, name: &str, internal: bool) -> io::Result<String>;

    async fn remove_network(&self, name: &str) -> io::Result<()>;
}

/// A runtime that refuses to do anything; useful to bring a worker up for
/// checkin testing without a container engine.
#[derive(Clone, Copy, Debug, Default)]
pub struct DummyContainerRuntime;

fn unsupported() -> io::Error {
    io::Error::new(io::ErrorKind::Unsupported, "dummy runtime")
}

#[async_trait]
impl ContainerRuntime for DummyContainerRuntime {
    async fn start_container(&self, _spec: &ContainerSpec) -> io::Result<String> {
        Err(unsupported())
    }

    async fn container_exists(&self, _container_id: &str) -> io::Result<bool> {
        Ok(false)
    }

    async fn check_finished(&self, _container_id: &str) -> io::Result<ContainerStatus> {
        Err(unsupported())
    }

    async fn container_stats(&self, _container_id: &str) -> io::Result<ContainerStats> {
        Err(unsupported())
    }

    async fn kill_container(&self, _container_id: &str) -> io::Result<()> {
        Err(unsupported())
    }

    async fn remove_container(&self, _container_id: &str) -> io::Result<()> {
        Err(unsupported())
    }

    async fn container_ip(&self, _network: &str, _container_id: &str) -> io::Result<IpAddr> {
        Err(unsupported())
    }

    async fn get_image(&self, _image_spec: &str) -> io::Result<Option<ImageInfo>> {
        Ok(None)
    }

    async fn pull_image(&self, _image_spec: &str) -> io::Result<()> {
        Err(unsupported())
    }

    async fn remove_image(&self, _id_or_digest: &str) -> io::Result<()> {
        Err(unsupported())
    }

    async fn ensure_network(&self, name: &str, _internal: bool) -> io::Result<String> {
        Ok(name.to_string())
    }

    async fn remove_network(&self, _name: &str) -> io::Result<()> {
        Ok(())
    }
}
