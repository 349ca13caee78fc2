use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::StoreConfig;
use crate::error::{AttendanceError, Result};

/// Durable projection of presence state. Holds identities only, never channels.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Snapshot {
    pub students_online: Vec<String>,
    pub teachers_online: Vec<String>,
    pub active_timers: Vec<String>,
    pub present: Vec<String>,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.students_online.is_empty()
            && self.teachers_online.is_empty()
            && self.active_timers.is_empty()
            && self.present.is_empty()
    }
}

/// username -> last completion time
pub type AttendanceLog = BTreeMap<String, DateTime<Utc>>;

/// File-backed store for the snapshot and the attendance log.
///
/// Writes go to a sibling temp file that is synced and renamed over the
/// target, so a crash mid-write leaves the previous contents intact.
#[derive(Debug, Clone)]
pub struct PersistentStore {
    snapshot_path: PathBuf,
    log_path: PathBuf,
}

impl PersistentStore {
    pub fn new(snapshot_path: impl Into<PathBuf>, log_path: impl Into<PathBuf>) -> Self {
        Self {
            snapshot_path: snapshot_path.into(),
            log_path: log_path.into(),
        }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(config.snapshot_path.clone(), config.log_path.clone())
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Loads the snapshot; missing or unparsable files yield an empty one
    pub async fn load(&self) -> Snapshot {
        match read_json(&self.snapshot_path).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => Snapshot::default(),
            Err(e) => {
                tracing::warn!(
                    path = %self.snapshot_path.display(),
                    error = %e,
                    "Snapshot unreadable, starting from empty state"
                );
                Snapshot::default()
            }
        }
    }

    pub async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        write_atomic(&self.snapshot_path, &bytes).await
    }

    /// Loads the attendance log; missing or unparsable files yield an empty log
    pub async fn load_log(&self) -> AttendanceLog {
        match read_json(&self.log_path).await {
            Ok(Some(log)) => log,
            Ok(None) => AttendanceLog::new(),
            Err(e) => {
                tracing::warn!(
                    path = %self.log_path.display(),
                    error = %e,
                    "Attendance log unreadable"
                );
                AttendanceLog::new()
            }
        }
    }

    /// Records a completion, replacing only the entry for `username`
    pub async fn append_log(&self, username: &str, timestamp: DateTime<Utc>) -> Result<()> {
        let mut log = match read_json::<AttendanceLog>(&self.log_path).await {
            Ok(log) => log.unwrap_or_default(),
            Err(AttendanceError::StoreSerialize(e)) => {
                // Keep the unreadable file around instead of overwriting it
                let aside = sibling(&self.log_path, "corrupt");
                tracing::warn!(
                    path = %self.log_path.display(),
                    moved_to = %aside.display(),
                    error = %e,
                    "Attendance log corrupt, moving aside"
                );
                tokio::fs::rename(&self.log_path, &aside)
                    .await
                    .map_err(|e| AttendanceError::store_io(&self.log_path, e))?;
                AttendanceLog::new()
            }
            Err(e) => return Err(e),
        };

        log.insert(username.to_string(), timestamp);
        let bytes = serde_json::to_vec_pretty(&log)?;
        write_atomic(&self.log_path, &bytes).await
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(AttendanceError::store_io(path, e)),
    };
    Ok(Some(serde_json::from_slice(&bytes)?))
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| AttendanceError::store_io(parent, e))?;
    }

    let tmp = sibling(path, "tmp");
    let result = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        tokio::io::AsyncWriteExt::write_all(&mut file, bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, path).await
    }
    .await;

    if let Err(e) = result {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(AttendanceError::store_io(path, e));
    }
    Ok(())
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}
