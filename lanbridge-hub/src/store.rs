//! Filesystem payload store: one file per upload under the upload directory.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use lanbridge_core::{sanitize_file_name, PayloadStore, StoreWriteError};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct FsPayloadStore {
    dir: PathBuf,
    reference_prefix: String,
}

impl FsPayloadStore {
    /// The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>, reference_prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            reference_prefix: reference_prefix.into().trim_end_matches('/').to_string(),
        }
    }
}

impl PayloadStore for FsPayloadStore {
    /// Never overwrites: an existing file with the same name is a write error.
    fn persist(&mut self, name: &str, bytes: &[u8]) -> Result<String, StoreWriteError> {
        if name.is_empty() || sanitize_file_name(name) != name {
            return Err(StoreWriteError::InvalidName(name.to_string()));
        }
        let io_err = |source| StoreWriteError::Io {
            name: name.to_string(),
            source,
        };
        std::fs::create_dir_all(&self.dir).map_err(io_err)?;
        let path = self.dir.join(name);
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(io_err)?;
        file.write_all(bytes).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        debug!(path = %path.display(), bytes = bytes.len(), "payload written");
        Ok(format!("{}/{}", self.reference_prefix, name))
    }
}
