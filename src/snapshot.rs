//! Versioned state snapshot carried between runs.
//!
//! The snapshot is compact JSON:
//! `{"version":1,"saved_at":"...","dedup":{id:ts},"translations":{src:{text,cached_at}}}`.
//! Missing sections default to empty and unknown fields are ignored, so older
//! and newer writers of the same major version can read each other's output.

use crate::dedup::DedupState;
use crate::error::PersistError;
use crate::translator::TranslationState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// Highest snapshot version this build reads and the version it writes.
pub const SNAPSHOT_VERSION: u32 = 1;

fn default_version() -> u32 {
    1
}

/// Serializable run-to-run state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub saved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub dedup: DedupState,
    #[serde(default)]
    pub translations: TranslationState,
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            saved_at: None,
            dedup: DedupState::new(),
            translations: TranslationState::new(),
        }
    }
}

/// Only the version, read before committing to the full schema.
#[derive(Deserialize)]
struct VersionHeader {
    #[serde(default = "default_version")]
    version: u32,
}

impl StateSnapshot {
    pub fn new(
        dedup: DedupState,
        translations: TranslationState,
        saved_at: DateTime<Utc>,
    ) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            saved_at: Some(saved_at),
            dedup,
            translations,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, PersistError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PersistError> {
        let header: VersionHeader = serde_json::from_slice(bytes)?;
        if header.version > SNAPSHOT_VERSION {
            return Err(PersistError::UnsupportedVersion {
                found: header.version,
                supported: SNAPSHOT_VERSION,
            });
        }
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// External storage for the snapshot.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Returns `None` when no snapshot was ever saved.
    async fn load(&self) -> Result<Option<StateSnapshot>, PersistError>;

    async fn save(&self, snapshot: &StateSnapshot) -> Result<(), PersistError>;
}

/// Snapshot kept in a local file, replaced atomically on save.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "state.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn load(&self) -> Result<Option<StateSnapshot>, PersistError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => StateSnapshot::from_bytes(&bytes).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No snapshot yet");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, snapshot: &StateSnapshot) -> Result<(), PersistError> {
        let bytes = snapshot.to_bytes()?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.temp_path();
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), bytes = bytes.len(), "Snapshot saved");
        Ok(())
    }
}

/// In-process store, for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    stored: Mutex<Option<Vec<u8>>>,
    fail_saves: bool,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose `save` always fails.
    pub fn failing() -> Self {
        Self {
            stored: Mutex::new(None),
            fail_saves: true,
        }
    }

    /// Seeds the store with raw bytes.
    pub fn with_bytes(bytes: Vec<u8>) -> Self {
        Self {
            stored: Mutex::new(Some(bytes)),
            fail_saves: false,
        }
    }

    /// The last saved bytes.
    pub fn bytes(&self) -> Option<Vec<u8>> {
        self.stored.lock().ok().and_then(|s| s.clone())
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load(&self) -> Result<Option<StateSnapshot>, PersistError> {
        match self.bytes() {
            Some(bytes) => StateSnapshot::from_bytes(&bytes).map(Some),
            None => Ok(None),
        }
    }

    async fn save(&self, snapshot: &StateSnapshot) -> Result<(), PersistError> {
        if self.fail_saves {
            return Err(PersistError::Io(std::io::Error::other("snapshot storage unavailable")));
        }
        let bytes = snapshot.to_bytes()?;
        if let Ok(mut stored) = self.stored.lock() {
            *stored = Some(bytes);
        }
        Ok(())
    }
}
