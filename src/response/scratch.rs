//! Instance-scoped scratch storage for node energy traces
//!
//! Used only when memory conservation is on. Each stacking worker writes its
//! node's energy once; the reducer reads it once and deletes it. Files live in
//! `<root>/brightness-<instance>/node_<index>.json.zst`, so concurrent runs
//! with different instance ids never collide. A crash mid-run leaves the
//! directory behind.

use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// zstd level for scratch files; favours speed over ratio.
const COMPRESSION_LEVEL: i32 = 3;

#[derive(Error, Debug)]
pub enum ScratchError {
    #[error("Scratch I/O error ({0}): {1}")]
    Io(PathBuf, std::io::Error),

    #[error("Scratch encode/decode error ({0}): {1}")]
    Codec(PathBuf, serde_json::Error),

    #[error("Scratch directory {0} already exists; another run may be using this instance id")]
    InstanceInUse(PathBuf),
}

#[derive(Debug)]
pub struct ScratchStore {
    dir: PathBuf,
}

impl ScratchStore {
    /// Create the instance directory under `root`. Refuses to reuse an
    /// existing directory.
    pub fn create(root: &Path, instance: &str) -> Result<Self, ScratchError> {
        let dir = root.join(format!("brightness-{instance}"));
        if dir.exists() {
            return Err(ScratchError::InstanceInUse(dir));
        }
        fs::create_dir_all(&dir).map_err(|e| ScratchError::Io(dir.clone(), e))?;
        debug!(dir = %dir.display(), "Scratch directory created");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, node: usize) -> PathBuf {
        self.dir.join(format!("node_{node}.json.zst"))
    }

    /// Persist one node's energy trace.
    pub fn write(&self, node: usize, energy: &[u16]) -> Result<PathBuf, ScratchError> {
        let path = self.path_for(node);
        let json = serde_json::to_vec(energy).map_err(|e| ScratchError::Codec(path.clone(), e))?;
        let compressed = zstd::encode_all(json.as_slice(), COMPRESSION_LEVEL)
            .map_err(|e| ScratchError::Io(path.clone(), e))?;
        fs::write(&path, compressed).map_err(|e| ScratchError::Io(path.clone(), e))?;
        Ok(path)
    }

    /// Read one node's energy trace and delete its file.
    pub fn take(&self, node: usize) -> Result<Vec<u16>, ScratchError> {
        let path = self.path_for(node);
        let compressed = fs::read(&path).map_err(|e| ScratchError::Io(path.clone(), e))?;
        let json = zstd::decode_all(compressed.as_slice()).map_err(|e| ScratchError::Io(path.clone(), e))?;
        let energy = serde_json::from_slice(&json).map_err(|e| ScratchError::Codec(path.clone(), e))?;
        fs::remove_file(&path).map_err(|e| ScratchError::Io(path.clone(), e))?;
        Ok(energy)
    }

    /// Remove the instance directory. Leftover files are logged and removed too.
    pub fn finish(self) -> Result<(), ScratchError> {
        let leftover = fs::read_dir(&self.dir)
            .map_err(|e| ScratchError::Io(self.dir.clone(), e))?
            .count();
        if leftover > 0 {
            warn!(dir = %self.dir.display(), files = leftover, "Scratch files were not consumed");
        }
        fs::remove_dir_all(&self.dir).map_err(|e| ScratchError::Io(self.dir.clone(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_then_take_deletes_file() {
        let root = TempDir::new().unwrap();
        let store = ScratchStore::create(root.path(), "t1").unwrap();

        let path = store.write(7, &[0, 500, 65535]).unwrap();
        assert!(path.ends_with("node_7.json.zst"));
        assert!(path.exists());

        assert_eq!(store.take(7).unwrap(), vec![0, 500, 65535]);
        assert!(!path.exists());
        assert!(store.take(7).is_err());
    }

    #[test]
    fn test_instances_are_isolated() {
        let root = TempDir::new().unwrap();
        let a = ScratchStore::create(root.path(), "a").unwrap();
        let b = ScratchStore::create(root.path(), "b").unwrap();
        a.write(0, &[1]).unwrap();
        b.write(0, &[2]).unwrap();
        assert_eq!(a.take(0).unwrap(), vec![1]);
        assert_eq!(b.take(0).unwrap(), vec![2]);
        assert!(matches!(
            ScratchStore::create(root.path(), "a"),
            Err(ScratchError::InstanceInUse(_))
        ));
    }

    #[test]
    fn test_finish_removes_directory() {
        let root = TempDir::new().unwrap();
        let store = ScratchStore::create(root.path(), "done").unwrap();
        store.write(1, &[3, 4]).unwrap();
        let dir = store.dir().to_path_buf();
        store.finish().unwrap();
        assert!(!dir.exists());
    }
}
