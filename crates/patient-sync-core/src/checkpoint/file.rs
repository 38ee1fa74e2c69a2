//! One small text file per checkpoint key.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::{CheckpointError, CheckpointResult, StateStore};

/// Stores each key as `<dir>/<key>.txt`.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    /// The directory is created lazily on first write.
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> CheckpointResult<PathBuf> {
        if key.is_empty()
            || !key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(CheckpointError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{}.txt", key)))
    }
}

fn io_err(path: &Path, source: std::io::Error) -> CheckpointError {
    CheckpointError::Io {
        path: path.display().to_string(),
        source,
    }
}

impl StateStore for FileStateStore {
    fn get(&self, key: &str) -> CheckpointResult<Option<String>> {
        let path = self.path_for(key)?;
        match fs::read_to_string(&path) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(&path, e)),
        }
    }

    fn set(&mut self, key: &str, value: &str) -> CheckpointResult<()> {
        let path = self.path_for(key)?;
        fs::create_dir_all(&self.dir).map_err(|e| io_err(&self.dir, e))?;

        // Write-then-rename so a crash never leaves a truncated checkpoint.
        let tmp = path.with_extension("txt.tmp");
        fs::write(&tmp, value).map_err(|e| io_err(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| io_err(&path, e))
    }

    fn remove(&mut self, key: &str) -> CheckpointResult<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&path, e)),
        }
    }
}
