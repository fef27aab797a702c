//! Ingestion loop: watermark-gated discovery of export files, reconciliation
//! into the remote store, and archiving of handled files.

mod reconcile;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uploader_core::ReconciliationResult;
use uploader_export::{is_export_file, parse_export_file, ExportError};
use uploader_storage::{
    format_watermark, Store, StoreClientConfig, StoreError, SupabaseStore, WatermarkError,
    WatermarkStore,
};
use uuid::Uuid;

pub use reconcile::{
    plan_reconciliation, OwnerScope, ReconcileError, ReconciliationEngine, ReconciliationPlan,
};

pub const CRATE_NAME: &str = "uploader-sync";

/// Consecutive files rejected at sign-in before a run gives up.
pub const MAX_CONSECUTIVE_AUTH_FAILURES: usize = 2;

pub const LOG_FILE_NAME: &str = "daily-data-uploader.log";

const REQUIRED_VARS: [&str; 6] = [
    "DAILY_UPLOADER_EXPORT_DIR",
    "DAILY_UPLOADER_LOG_DIR",
    "SUPABASE_URL",
    "SUPABASE_KEY",
    "SUPABASE_USER_EMAIL",
    "SUPABASE_USER_PASSWORD",
];

/// String that never appears in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub email: String,
    pub password: Secret,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable(s): {}", .0.join(", "))]
    Missing(Vec<&'static str>),
    #[error("{name}={value:?} is invalid: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub export_dir: PathBuf,
    pub log_dir: PathBuf,
    pub processed_dir: PathBuf,
    pub watermark_file: PathBuf,
    pub supabase_url: String,
    pub supabase_key: Secret,
    pub credentials: Credentials,
    pub sort_by_mtime: bool,
    pub owner_scope: OwnerScope,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub cron: Option<String>,
}

impl SyncConfig {
    /// Configuration with every optional setting at its default.
    pub fn new(
        export_dir: impl Into<PathBuf>,
        log_dir: impl Into<PathBuf>,
        supabase_url: impl Into<String>,
        supabase_key: impl Into<String>,
        credentials: Credentials,
    ) -> Self {
        let export_dir = export_dir.into();
        Self {
            processed_dir: export_dir.join("processed"),
            watermark_file: export_dir.join("last_update.txt"),
            export_dir,
            log_dir: log_dir.into(),
            supabase_url: supabase_url.into(),
            supabase_key: Secret::new(supabase_key),
            credentials,
            sort_by_mtime: true,
            owner_scope: OwnerScope::default(),
            http_timeout_secs: 20,
            user_agent: "daily-uploader/0.1".to_string(),
            cron: None,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let missing: Vec<&'static str> = REQUIRED_VARS
            .iter()
            .copied()
            .filter(|name| get(*name).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }
        let required = |name: &str| get(name).unwrap_or_default();

        let mut config = Self::new(
            required("DAILY_UPLOADER_EXPORT_DIR"),
            required("DAILY_UPLOADER_LOG_DIR"),
            required("SUPABASE_URL"),
            required("SUPABASE_KEY"),
            Credentials {
                email: required("SUPABASE_USER_EMAIL"),
                password: Secret::new(required("SUPABASE_USER_PASSWORD")),
            },
        );

        if let Some(dir) = get("DAILY_UPLOADER_PROCESSED_DIR") {
            config.processed_dir = PathBuf::from(dir);
        }
        if let Some(file) = get("DAILY_UPLOADER_WATERMARK_FILE") {
            config.watermark_file = PathBuf::from(file);
        }
        if let Some(value) = get("DAILY_UPLOADER_SORT_BY_MTIME") {
            config.sort_by_mtime = parse_flag("DAILY_UPLOADER_SORT_BY_MTIME", &value)?;
        }
        if let Some(value) = get("DAILY_UPLOADER_OWNER_SCOPE") {
            config.owner_scope = value.parse().map_err(|reason| ConfigError::Invalid {
                name: "DAILY_UPLOADER_OWNER_SCOPE",
                value: value.clone(),
                reason,
            })?;
        }
        if let Some(value) = get("DAILY_UPLOADER_HTTP_TIMEOUT_SECS") {
            config.http_timeout_secs = value
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|secs| *secs > 0)
                .ok_or_else(|| ConfigError::Invalid {
                    name: "DAILY_UPLOADER_HTTP_TIMEOUT_SECS",
                    value: value.clone(),
                    reason: "expected a positive number of seconds".to_string(),
                })?;
        }
        if let Some(agent) = get("DAILY_UPLOADER_USER_AGENT") {
            config.user_agent = agent;
        }
        config.cron = get("DAILY_UPLOADER_CRON");

        Ok(config)
    }

    pub fn log_file(&self) -> PathBuf {
        self.log_dir.join(LOG_FILE_NAME)
    }
}

fn parse_flag(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            name,
            value: value.to_string(),
            reason: "expected true or false".to_string(),
        }),
    }
}

/// Failure confined to one export file; the file stays for the next run.
#[derive(Debug, Error)]
pub enum FileError {
    #[error("reading modification time of {}", .path.display())]
    Metadata {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: ExportError,
    },
    #[error("reconciling {}", .path.display())]
    Reconcile {
        path: PathBuf,
        #[source]
        source: ReconcileError,
    },
    #[error("moving {} to {}", .from.display(), .to.display())]
    Move {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl FileError {
    pub fn is_authentication(&self) -> bool {
        matches!(self, FileError::Reconcile { source, .. } if source.is_authentication())
    }
}

/// Failure that ends the whole run.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("creating processed directory {}", .path.display())]
    ProcessedDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("listing export directory {}", .path.display())]
    ListExports {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Watermark(#[from] WatermarkError),
    #[error("stopped after {failures} consecutive authentication failures")]
    Authentication {
        failures: usize,
        #[source]
        source: FileError,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct FileFailure {
    pub file: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestionSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub discovered: usize,
    pub eligible: usize,
    pub skipped: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub inserted: usize,
    pub updated: usize,
    pub groups_created: usize,
    pub previous_watermark: DateTime<Utc>,
    pub new_watermark: DateTime<Utc>,
    pub failures: Vec<FileFailure>,
}

/// Tracks how far the watermark may move during a run.
///
/// Successes raise it to the newest handled mtime; any file left behind caps
/// it just below that file's mtime so the file is seen again next run. The
/// result never drops below the starting value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatermarkAdvance {
    base: DateTime<Utc>,
    advanced: Option<DateTime<Utc>>,
    ceiling: Option<DateTime<Utc>>,
}

impl WatermarkAdvance {
    pub fn new(base: DateTime<Utc>) -> Self {
        Self {
            base,
            advanced: None,
            ceiling: None,
        }
    }

    pub fn succeeded(&mut self, mtime: DateTime<Utc>) {
        self.advanced = Some(self.advanced.map_or(mtime, |at| at.max(mtime)));
    }

    pub fn held_back(&mut self, mtime: DateTime<Utc>) {
        self.ceiling = Some(self.ceiling.map_or(mtime, |at| at.min(mtime)));
    }

    pub fn value(&self) -> DateTime<Utc> {
        let Some(advanced) = self.advanced else {
            return self.base;
        };
        let candidate = match self.ceiling {
            Some(ceiling) => advanced.min(ceiling - Duration::nanoseconds(1)),
            None => advanced,
        };
        candidate.max(self.base)
    }
}

#[derive(Debug)]
struct ExportCandidate {
    path: PathBuf,
    name: String,
    mtime: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct ExportListing {
    candidates: Vec<ExportCandidate>,
    unreadable: Vec<FileError>,
}

pub struct Uploader {
    config: SyncConfig,
    store: Arc<dyn Store>,
    engine: ReconciliationEngine,
    watermark: WatermarkStore,
}

impl Uploader {
    pub fn new(config: SyncConfig, store: Arc<dyn Store>) -> Self {
        let engine = ReconciliationEngine::new(config.credentials.clone(), config.owner_scope);
        let watermark = WatermarkStore::new(config.watermark_file.clone());
        Self {
            config,
            store,
            engine,
            watermark,
        }
    }

    /// Uploader backed by the configured Supabase project.
    pub fn connect(config: SyncConfig) -> Result<Self, StoreError> {
        let store = SupabaseStore::new(
            config.supabase_url.clone(),
            config.supabase_key.expose(),
            StoreClientConfig {
                timeout: StdDuration::from_secs(config.http_timeout_secs),
                user_agent: Some(config.user_agent.clone()),
                ..Default::default()
            },
        )?;
        Ok(Self::new(config, Arc::new(store)))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<IngestionSummary, SyncError> {
        let run_id = Uuid::new_v4();
        self.run(run_id)
            .instrument(info_span!("ingestion_run", %run_id))
            .await
    }

    async fn run(&self, run_id: Uuid) -> Result<IngestionSummary, SyncError> {
        let started_at = Utc::now();
        fs::create_dir_all(&self.config.processed_dir)
            .await
            .map_err(|source| SyncError::ProcessedDir {
                path: self.config.processed_dir.clone(),
                source,
            })?;

        let previous = self.watermark.get().await?;
        info!(
            export_dir = %self.config.export_dir.display(),
            watermark = %format_watermark(previous),
            "starting ingestion run"
        );

        let listing = self.list_exports().await?;
        let discovered = listing.candidates.len() + listing.unreadable.len();
        let mut failures: Vec<FileFailure> = listing
            .unreadable
            .iter()
            .map(|err| {
                warn!(error = %describe(err), "skipping export file");
                failure_entry(err)
            })
            .collect();

        let (mut eligible, skipped): (Vec<_>, Vec<_>) = listing
            .candidates
            .into_iter()
            .partition(|candidate| candidate.mtime > previous);
        if self.config.sort_by_mtime {
            eligible.sort_by(|a, b| a.mtime.cmp(&b.mtime).then_with(|| a.name.cmp(&b.name)));
        }
        info!(
            discovered,
            eligible = eligible.len(),
            skipped = skipped.len(),
            "found export files"
        );

        let mut advance = WatermarkAdvance::new(previous);
        let mut totals = ReconciliationResult::default();
        let mut succeeded = 0usize;
        let mut consecutive_auth_failures = 0usize;

        for (index, candidate) in eligible.iter().enumerate() {
            let outcome = self
                .ingest_file(candidate)
                .instrument(info_span!("export_file", file = %candidate.name))
                .await;
            match outcome {
                Ok(result) => {
                    advance.succeeded(candidate.mtime);
                    succeeded += 1;
                    consecutive_auth_failures = 0;
                    totals.inserted += result.inserted;
                    totals.updated += result.updated;
                    totals.groups_created += result.groups_created;
                }
                Err(err) => {
                    advance.held_back(candidate.mtime);
                    failures.push(failure_entry(&err));
                    if !err.is_authentication() {
                        consecutive_auth_failures = 0;
                        continue;
                    }
                    consecutive_auth_failures += 1;
                    if consecutive_auth_failures >= MAX_CONSECUTIVE_AUTH_FAILURES {
                        for remaining in &eligible[index + 1..] {
                            advance.held_back(remaining.mtime);
                        }
                        let watermark = advance.value();
                        self.watermark.set(watermark).await?;
                        error!(
                            failures = consecutive_auth_failures,
                            watermark = %format_watermark(watermark),
                            "giving up on run after repeated authentication failures"
                        );
                        return Err(SyncError::Authentication {
                            failures: consecutive_auth_failures,
                            source: err,
                        });
                    }
                }
            }
        }

        let new_watermark = advance.value();
        self.watermark.set(new_watermark).await?;

        let summary = IngestionSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            discovered,
            eligible: eligible.len(),
            skipped: skipped.len(),
            succeeded,
            failed: failures.len(),
            inserted: totals.inserted,
            updated: totals.updated,
            groups_created: totals.groups_created,
            previous_watermark: previous,
            new_watermark,
            failures,
        };
        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            inserted = summary.inserted,
            updated = summary.updated,
            watermark = %format_watermark(new_watermark),
            "ingestion run finished"
        );
        Ok(summary)
    }

    /// Non-recursive listing of export files directly inside the export dir.
    async fn list_exports(&self) -> Result<ExportListing, SyncError> {
        let export_dir = &self.config.export_dir;
        let list_error = |source| SyncError::ListExports {
            path: export_dir.clone(),
            source,
        };

        let mut listing = ExportListing::default();
        let mut entries = fs::read_dir(export_dir).await.map_err(list_error)?;
        while let Some(entry) = entries.next_entry().await.map_err(list_error)? {
            let path = entry.path();
            if !is_export_file(&path) {
                continue;
            }
            let metadata = match fs::metadata(&path).await {
                Ok(metadata) => metadata,
                Err(source) => {
                    listing.unreadable.push(FileError::Metadata { path, source });
                    continue;
                }
            };
            if !metadata.is_file() {
                continue;
            }
            match metadata.modified() {
                Ok(modified) => listing.candidates.push(ExportCandidate {
                    name: entry.file_name().to_string_lossy().into_owned(),
                    mtime: DateTime::<Utc>::from(modified),
                    path,
                }),
                Err(source) => listing.unreadable.push(FileError::Metadata { path, source }),
            }
        }
        Ok(listing)
    }

    async fn ingest_file(
        &self,
        candidate: &ExportCandidate,
    ) -> Result<ReconciliationResult, FileError> {
        let outcome = self.process_file(candidate).await;
        match &outcome {
            Ok(result) => info!(
                inserted = result.inserted,
                updated = result.updated,
                groups_created = result.groups_created,
                "export file ingested"
            ),
            Err(err) => warn!(error = %describe(err), "export file left in place for retry"),
        }
        outcome
    }

    async fn process_file(
        &self,
        candidate: &ExportCandidate,
    ) -> Result<ReconciliationResult, FileError> {
        let path = &candidate.path;
        let data = parse_export_file(path).map_err(|source| FileError::Parse {
            path: path.clone(),
            source,
        })?;
        info!(entries = data.len(), "parsed export");

        let result = self
            .engine
            .reconcile(self.store.as_ref(), &data)
            .await
            .map_err(|source| FileError::Reconcile {
                path: path.clone(),
                source,
            })?;

        let destination = self.config.processed_dir.join(&candidate.name);
        fs::rename(path, &destination)
            .await
            .map_err(|source| FileError::Move {
                from: path.clone(),
                to: destination.clone(),
                source,
            })?;
        Ok(result)
    }
}

fn failure_entry(err: &FileError) -> FileFailure {
    let file = match err {
        FileError::Metadata { path, .. }
        | FileError::Parse { path, .. }
        | FileError::Reconcile { path, .. } => file_label(path),
        FileError::Move { from, .. } => file_label(from),
    };
    FileFailure {
        file,
        error: describe(err),
    }
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Error message followed by each of its causes.
fn describe(err: &(dyn std::error::Error + 'static)) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}

/// Scheduler that runs `run_once` on `DAILY_UPLOADER_CRON`, or `None` when no
/// schedule is configured. A tick that finds the previous run still going is
/// skipped.
pub async fn build_scheduler(uploader: Arc<Uploader>) -> anyhow::Result<Option<JobScheduler>> {
    let Some(cron) = uploader.config().cron.clone() else {
        return Ok(None);
    };

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let in_progress = Arc::new(tokio::sync::Mutex::new(()));
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let uploader = Arc::clone(&uploader);
        let in_progress = Arc::clone(&in_progress);
        Box::pin(async move {
            let Ok(_guard) = in_progress.try_lock() else {
                warn!("previous ingestion run still in progress; skipping tick");
                return;
            };
            match uploader.run_once().await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    succeeded = summary.succeeded,
                    failed = summary.failed,
                    "scheduled ingestion run complete"
                ),
                Err(err) => error!(error = %describe(&err), "scheduled ingestion run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
