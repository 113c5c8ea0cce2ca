//! The advisory lock protecting the dependency cache's state file when the
//! cache directory is shared between worker processes (typically over
//! NFS). Within a process the cache's own mutex serializes access; this
//! adds the cross-process half: an exclusive `flock` on a dedicated lock
//! file, held only for the duration of one read-modify-write. The lease is
//! bounded by the kernel: an exiting or killed holder releases it
//! automatically, so a crashed worker can never wedge the fleet.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

/// A cross-process advisory lock on a file.
pub struct FileLease {
    path: PathBuf,
}

pub struct LeaseGuard {
    // Dropping the descriptor releases the flock.
    _file: File,
}

impl FileLease {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileLease { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Blocks until the exclusive lock is held and returns a guard that
    /// releases it on drop.
    #[cfg(unix)]
    pub fn acquire(&self) -> io::Result<LeaseGuard> {
        use std::os::fd::AsRawFd;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::options()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.path)?;
        nix::fcntl::flock(file.as_raw_fd(), nix::fcntl::FlockArg::LockExclusive)
            .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
        Ok(LeaseGuard { _file: file })
    }

    #[cfg(not(unix))]
    pub fn acquire(&self) -> io::Result<LeaseGuard> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "file leases need flock",
        ))
    }
}
