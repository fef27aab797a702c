//! Watermark persistence and the remote store capability for the uploader.

mod memory;
mod supabase;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info;
use uploader_core::{Group, Identity, NewGroup, TimeTrackingDraft, TimeTrackingRow};
use uuid::Uuid;

pub use memory::{InMemoryStore, StoreCallCounts};
pub use supabase::{StoreClientConfig, SupabaseStore};

pub const CRATE_NAME: &str = "uploader-storage";

/// Naive timestamps written by older uploader versions (no offset, local time).
const LEGACY_WATERMARK_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("{operation} failed with http status {status}: {message}")]
    Operation {
        operation: &'static str,
        status: u16,
        message: String,
    },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("{0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_authentication(&self) -> bool {
        matches!(self, StoreError::Authentication(_))
    }
}

/// Read/write capability over the remote relational store.
///
/// `owner` filters selects to rows owned by that user id; `None` reads every
/// row visible to the identity.
#[async_trait]
pub trait Store: Send + Sync {
    async fn authenticate(&self, email: &str, password: &str) -> Result<Identity, StoreError>;

    async fn select_groups(
        &self,
        identity: &Identity,
        owner: Option<&str>,
    ) -> Result<Vec<Group>, StoreError>;

    /// Create groups in one batch, returning them with their new ids.
    async fn insert_groups(
        &self,
        identity: &Identity,
        groups: &[NewGroup],
    ) -> Result<Vec<Group>, StoreError>;

    async fn select_time_tracking(
        &self,
        identity: &Identity,
        owner: Option<&str>,
    ) -> Result<Vec<TimeTrackingRow>, StoreError>;

    async fn insert_time_tracking(
        &self,
        identity: &Identity,
        rows: &[TimeTrackingDraft],
    ) -> Result<usize, StoreError>;

    /// Update rows by id in one batch; every draft must carry an id.
    async fn upsert_time_tracking(
        &self,
        identity: &Identity,
        rows: &[TimeTrackingDraft],
    ) -> Result<usize, StoreError>;
}

#[derive(Debug, Error)]
pub enum WatermarkError {
    #[error("reading watermark {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("writing watermark {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("watermark {} holds {value:?}, which is not a timestamp", .path.display())]
    Corrupt { path: PathBuf, value: String },
}

/// File-backed timestamp of the last fully handled export.
#[derive(Debug, Clone)]
pub struct WatermarkStore {
    path: PathBuf,
}

impl WatermarkStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored watermark, initialised to now on first use so that files
    /// already present at first run are not treated as new.
    pub async fn get(&self) -> Result<DateTime<Utc>, WatermarkError> {
        if let Some(stored) = self.peek().await? {
            return Ok(stored);
        }
        let now = Utc::now();
        self.set(now).await?;
        info!(path = %self.path.display(), watermark = %format_watermark(now), "initialised watermark");
        Ok(now)
    }

    pub async fn peek(&self) -> Result<Option<DateTime<Utc>>, WatermarkError> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(WatermarkError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        let value = text.trim();
        parse_watermark(value)
            .map(Some)
            .ok_or_else(|| WatermarkError::Corrupt {
                path: self.path.clone(),
                value: value.to_string(),
            })
    }

    /// Replace the stored value via temp-file write and rename; on failure the
    /// previous value is left untouched.
    pub async fn set(&self, at: DateTime<Utc>) -> Result<(), WatermarkError> {
        let write_error = |source: std::io::Error| WatermarkError::Write {
            path: self.path.clone(),
            source,
        };

        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).await.map_err(write_error)?;

        let temp_path = parent.join(format!(".{}.watermark.tmp", Uuid::new_v4()));
        let body = format_watermark(at);
        match write_then_rename(&temp_path, &self.path, body.as_bytes()).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(write_error(err))
            }
        }
    }
}

async fn write_then_rename(temp_path: &Path, dest: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(temp_path)
        .await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(temp_path, dest).await
}

/// RFC 3339 with nanoseconds, so file mtimes compare exactly after a round trip.
pub fn format_watermark(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn parse_watermark(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(text, LEGACY_WATERMARK_FORMAT).ok()?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
}
