//! # Checkpoint stores
//!
//! The mining loop reads its starting position once per (re)start and writes
//! the acknowledged position as delivery progresses. Storage is pluggable
//! through [`CheckpointStore`].
//!
//! ## Usage
//!
//! ```ignore
//! use logminer_cdc::common::{CheckpointStore, FileCheckpointStore};
//!
//! let store = FileCheckpointStore::new("/var/lib/cdc/orders.json", "oracle");
//! let resume_from = store.load().await?;
//! ```

use crate::common::{CdcError, PositionToken, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::debug;

/// Durable storage for the last acknowledged position.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Last saved position, `Null` if nothing was saved yet.
    async fn load(&self) -> Result<PositionToken>;

    /// Replace the saved position.
    async fn save(&self, position: PositionToken) -> Result<()>;
}

/// On-disk checkpoint document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckpointRecord {
    pub position: PositionToken,
    pub source: String,
    pub timestamp: DateTime<Utc>,
}

/// Checkpoint kept in a single JSON file, replaced atomically on save.
pub struct FileCheckpointStore {
    path: PathBuf,
    source: String,
    fsync: bool,
}

impl FileCheckpointStore {
    pub fn new(path: impl AsRef<Path>, source: impl Into<String>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            source: source.into(),
            fsync: true,
        }
    }

    /// Skip fsync on save (tests, throwaway pipelines).
    pub fn without_fsync(mut self) -> Self {
        self.fsync = false;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the full checkpoint document, if one exists.
    pub async fn load_record(&self) -> Result<Option<CheckpointRecord>> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CdcError::checkpoint(format!("{}: {}", self.path.display(), e))),
        };
        let record: CheckpointRecord = serde_json::from_str(&contents)
            .map_err(|e| CdcError::Serialization(format!("{}: {}", self.path.display(), e)))?;
        Ok(Some(record))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self) -> Result<PositionToken> {
        Ok(self
            .load_record()
            .await?
            .map(|r| r.position)
            .unwrap_or_default())
    }

    async fn save(&self, position: PositionToken) -> Result<()> {
        let record = CheckpointRecord {
            position,
            source: self.source.clone(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&record)
            .map_err(|e| CdcError::Serialization(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| CdcError::checkpoint(e.to_string()))?;
            }
        }

        let temp_path = self.path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .await
            .map_err(|e| CdcError::checkpoint(format!("{}: {}", temp_path.display(), e)))?;
        file.write_all(json.as_bytes())
            .await
            .map_err(|e| CdcError::checkpoint(e.to_string()))?;
        if self.fsync {
            file.sync_all()
                .await
                .map_err(|e| CdcError::checkpoint(e.to_string()))?;
        }

        fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| CdcError::checkpoint(e.to_string()))?;

        debug!("Saved checkpoint {} to {}", position, self.path.display());
        Ok(())
    }
}

/// In-memory checkpoint (tests, or when persistence lives elsewhere).
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    position: RwLock<PositionToken>,
    saves: std::sync::atomic::AtomicU64,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with `position`, as after an earlier run.
    pub fn starting_at(position: PositionToken) -> Self {
        Self {
            position: RwLock::new(position),
            saves: Default::default(),
        }
    }

    /// Number of successful saves.
    pub fn save_count(&self) -> u64 {
        self.saves.load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self) -> Result<PositionToken> {
        Ok(*self.position.read().await)
    }

    async fn save(&self, position: PositionToken) -> Result<()> {
        *self.position.write().await = position;
        self.saves
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }
}
