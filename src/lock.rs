//! Project-scoped lock serializing stash operations
//!
//! The lock file holds the PID of its owner, so a lock left behind by a
//! crashed process can be told apart from a running one.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::StashError;

/// Held for the duration of a save or load; the lock file is removed on drop
#[derive(Debug)]
pub struct ProjectLock {
    _file: File,
    lock_path: PathBuf,
}

impl ProjectLock {
    /// Try to acquire the lock immediately
    pub async fn try_acquire(lock_path: &Path) -> Result<Self, StashError> {
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(lock_path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(StashError::Locked(format!(
                    "{} is held by {} - another stash operation may be running",
                    lock_path.display(),
                    owner(lock_path).await
                )));
            }
            Err(e) => return Err(StashError::IoError(e)),
        };

        let pid = std::process::id();
        let written = async {
            file.write_all(pid.to_string().as_bytes()).await?;
            file.flush().await
        }
        .await;
        if let Err(e) = written {
            let _ = fs::remove_file(lock_path).await;
            return Err(StashError::IoError(e));
        }

        debug!(path = %lock_path.display(), pid, "Acquired project lock");
        Ok(Self {
            _file: file,
            lock_path: lock_path.to_path_buf(),
        })
    }

    /// Poll for the lock until `timeout` elapses
    pub async fn acquire(
        lock_path: &Path,
        timeout: Duration,
        retry_interval: Duration,
    ) -> Result<Self, StashError> {
        let start = Instant::now();

        loop {
            match Self::try_acquire(lock_path).await {
                Err(StashError::Locked(msg)) => {
                    if start.elapsed() >= timeout {
                        return Err(StashError::Locked(format!(
                            "timed out after {}ms: {}",
                            timeout.as_millis(),
                            msg
                        )));
                    }
                    tokio::time::sleep(retry_interval).await;
                }
                result => return result,
            }
        }
    }
}

impl Drop for ProjectLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.lock_path);
    }
}

/// Describe the holder recorded in an existing lock file
async fn owner(lock_path: &Path) -> String {
    match fs::read_to_string(lock_path).await {
        Ok(content) => match content.trim().parse::<u32>() {
            Ok(pid) => format!("pid {}", pid),
            Err(_) => "an unknown process".to_string(),
        },
        Err(_) => "an unknown process".to_string(),
    }
}
