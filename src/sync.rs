use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::InfraError;

/// Exclusive access to a file, held through a sibling `<file>.lock`.
pub struct LockedFile {
    /// Path to the lock file.
    lock_path: PathBuf,
    /// The file this lock protects.
    file_path: PathBuf,
}

impl LockedFile {
    /// Waits until no one else holds the lock, then takes it.
    pub async fn acquire(file_path: &Path) -> Result<Self, InfraError> {
        let mut lock_path = file_path.as_os_str().to_owned();
        lock_path.push(".lock");
        let lock_path = PathBuf::from(lock_path);
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(_) => break,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    debug!(lock = %lock_path.display(), "waiting for lock");
                    tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Self {
            lock_path,
            file_path: file_path.to_path_buf(),
        })
    }

    /// Opens the protected file for reading, or `None` if it does not exist.
    pub fn read_handle(&self) -> Result<Option<File>, InfraError> {
        match File::open(&self.file_path) {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn write_handle(&self) -> Result<File, InfraError> {
        Ok(File::create(&self.file_path)?)
    }
}

impl Drop for LockedFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.lock_path) {
            warn!(lock = %self.lock_path.display(), error = %e, "failed to remove lock file");
        }
    }
}
