//! Atomic durable snapshots of in-memory structures: one JSON object per
//! file, written through a temp file in the same directory and renamed
//! into place so readers never observe a torn write.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub struct JsonStateCommitter {
    path: PathBuf,
}

impl JsonStateCommitter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonStateCommitter { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state_file_exists(&self) -> bool {
        self.path.exists()
    }

    /// Loads the committed state. A missing file is an error here; use
    /// [load_or_default](Self::load_or_default) when absence is expected.
    pub fn load<T: DeserializeOwned>(&self) -> io::Result<T> {
        let data = std::fs::read(&self.path)?;
        serde_json::from_slice(&data).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("corrupted state file {:?}: {}", self.path, e),
            )
        })
    }

    /// Loads the committed state, recovering from a missing file with the
    /// default. A file that exists but does not parse is NOT recovered
    /// from: that is corruption, and silently resetting would leak every
    /// resource the state tracks.
    pub fn load_or_default<T: DeserializeOwned + Default>(&self) -> io::Result<T> {
        if !self.state_file_exists() {
            return Ok(T::default());
        }
        self.load()
    }

    /// Serializes `state` to a temp file next to the target and renames it
    /// into place.
    pub fn commit<T: Serialize>(&self, state: &T) -> io::Result<()> {
        let dir = self.path.parent().unwrap_or(Path::new("."));
        std::fs::create_dir_all(dir)?;
        let mut temp = tempfile::NamedTempFile::new_in(dir)?;
        temp.write_all(&serde_json::to_vec(state)?)?;
        temp.flush()?;
        temp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::JsonStateCommitter;
    use std::collections::BTreeMap;

    #[test]
    fn roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let committer = JsonStateCommitter::new(dir.path().join("state.json"));

        let mut state = BTreeMap::new();
        state.insert("a".to_string(), 1u64);
        committer.commit(&state).unwrap();

        let loaded: BTreeMap<String, u64> = committer.load().unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn missing_file_recovers_with_default() {
        let dir = tempfile::tempdir().unwrap();
        let committer = JsonStateCommitter::new(dir.path().join("absent.json"));
        let loaded: BTreeMap<String, u64> = committer.load_or_default().unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn corrupted_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{not json").unwrap();
        let committer = JsonStateCommitter::new(path);
        let loaded: std::io::Result<BTreeMap<String, u64>> = committer.load_or_default();
        assert!(loaded.is_err());
    }

    #[test]
    fn commit_replaces_previous_state() {
        let dir = tempfile::tempdir().unwrap();
        let committer = JsonStateCommitter::new(dir.path().join("state.json"));
        committer.commit(&vec![1u64, 2]).unwrap();
        committer.commit(&vec![3u64]).unwrap();
        let loaded: Vec<u64> = committer.load().unwrap();
        assert_eq!(loaded, vec![3]);
    }
}
