// Local snapshot cache

use async_trait::async_trait;
use log::{info, warn};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use uuid::Uuid;

use super::snapshot::PersistedSnapshot;
use crate::errors::ServiceError;

const WRITE_ATTEMPTS: u32 = 3;
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("cache I/O failed for {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("snapshot serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("credential sealing failed: {0}")]
    Crypto(String),
    #[error("remote progress call failed: {0}")]
    Remote(#[from] ServiceError),
}

#[async_trait]
pub trait LocalCache: Send + Sync {
    async fn load(&self) -> Result<Option<PersistedSnapshot>, PersistenceError>;

    async fn save(&self, snapshot: &PersistedSnapshot) -> Result<(), PersistenceError>;

    async fn clear(&self) -> Result<(), PersistenceError>;
}

/// JSON snapshot on disk, replaced atomically on every save.
pub struct FileCache {
    path: PathBuf,
}

impl FileCache {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: io::Error) -> PersistenceError {
        PersistenceError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::other("cache path has no parent"))?;
    tokio::fs::create_dir_all(parent).await?;

    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("wizard-state");
    let tmp_path = parent.join(format!(".{}.tmp-{}", file_name, Uuid::new_v4().simple()));

    let written = async {
        let mut file = tokio::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&tmp_path)
            .await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp_path, path).await
    }
    .await;
    if written.is_err() {
        let _ = tokio::fs::remove_file(&tmp_path).await;
    }
    written
}

#[async_trait]
impl LocalCache for FileCache {
    async fn load(&self) -> Result<Option<PersistedSnapshot>, PersistenceError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_error(e)),
        };
        let snapshot: PersistedSnapshot = serde_json::from_str(&raw)?;
        Ok(Some(snapshot))
    }

    async fn save(&self, snapshot: &PersistedSnapshot) -> Result<(), PersistenceError> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        let mut last_err: Option<io::Error> = None;

        for attempt in 1..=WRITE_ATTEMPTS {
            let started = Instant::now();
            match timeout(WRITE_TIMEOUT, write_atomic(&self.path, &bytes)).await {
                Ok(Ok(())) => {
                    info!(
                        "[PHASE: persistence] [STEP: local] snapshot saved (attempt={}, path={:?}, bytes={}, duration_ms={})",
                        attempt,
                        self.path,
                        bytes.len(),
                        started.elapsed().as_millis()
                    );
                    return Ok(());
                }
                Ok(Err(e)) => {
                    warn!(
                        "[PHASE: persistence] [STEP: local] snapshot save failed (attempt={}, path={:?}, error={:?})",
                        attempt, self.path, e
                    );
                    last_err = Some(e);
                }
                Err(_) => {
                    warn!(
                        "[PHASE: persistence] [STEP: local] snapshot save timed out (attempt={}, path={:?})",
                        attempt, self.path
                    );
                    last_err = Some(io::Error::new(io::ErrorKind::TimedOut, "write timed out"));
                }
            }

            let backoff_ms = 50_u64.saturating_mul(1_u64 << (attempt - 1));
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
        }

        Err(self.io_error(
            last_err.unwrap_or_else(|| io::Error::other("failed to write snapshot")),
        ))
    }

    async fn clear(&self) -> Result<(), PersistenceError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                info!(
                    "[PHASE: persistence] [STEP: local] cleared snapshot at {:?}",
                    self.path
                );
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_error(e)),
        }
    }
}

/// Keeps the serialized snapshot in memory.
#[derive(Default)]
pub struct MemoryCache {
    json: Mutex<Option<String>>,
    saves: Mutex<usize>,
}

impl MemoryCache {
    pub fn raw(&self) -> Option<String> {
        self.json
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl LocalCache for MemoryCache {
    async fn load(&self) -> Result<Option<PersistedSnapshot>, PersistenceError> {
        match self.raw() {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, snapshot: &PersistedSnapshot) -> Result<(), PersistenceError> {
        let json = serde_json::to_string(snapshot)?;
        *self.json.lock().unwrap_or_else(PoisonError::into_inner) = Some(json);
        *self.saves.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        Ok(())
    }

    async fn clear(&self) -> Result<(), PersistenceError> {
        *self.json.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}
