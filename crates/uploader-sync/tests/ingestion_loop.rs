use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tempfile::{tempdir, TempDir};
use uploader_storage::{InMemoryStore, WatermarkStore};
use uploader_sync::{Credentials, Secret, SyncConfig, SyncError, Uploader};

const PREAMBLE: &str = "Report\nUser: someone\nRange: week\n\nGenerated\nTotals\n";

struct Harness {
    _dir: TempDir,
    config: SyncConfig,
    store: Arc<InMemoryStore>,
}

impl Harness {
    /// Export dir with the watermark pinned to 2020 so test files are eligible.
    async fn new(password: &str) -> Self {
        let dir = tempdir().expect("tempdir");
        let export_dir = dir.path().join("exports");
        fs::create_dir_all(&export_dir).unwrap();
        let config = SyncConfig::new(
            &export_dir,
            dir.path().join("logs"),
            "http://localhost:54321",
            "anon-key",
            Credentials {
                email: "a@example.com".into(),
                password: Secret::new(password),
            },
        );
        WatermarkStore::new(&config.watermark_file)
            .set(at(1_577_836_800))
            .await
            .unwrap();
        let store = Arc::new(InMemoryStore::new().with_account("a@example.com", "pw", "user-1"));
        Self {
            _dir: dir,
            config,
            store,
        }
    }

    fn uploader(&self) -> Uploader {
        Uploader::new(self.config.clone(), self.store.clone())
    }

    fn export_path(&self, name: &str) -> PathBuf {
        self.config.export_dir.join(name)
    }

    fn processed_path(&self, name: &str) -> PathBuf {
        self.config.processed_dir.join(name)
    }

    fn write_export(&self, name: &str, table: &str, mtime_secs: u64) -> PathBuf {
        let path = self.export_path(name);
        fs::write(&path, format!("{PREAMBLE}{table}")).unwrap();
        set_mtime(&path, mtime_secs);
        path
    }

    async fn watermark(&self) -> DateTime<Utc> {
        WatermarkStore::new(&self.config.watermark_file)
            .peek()
            .await
            .unwrap()
            .unwrap()
    }
}

fn set_mtime(path: &Path, secs: u64) {
    File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
        .unwrap();
}

fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap()
}

// 2024-01-01T00:00:00Z
const JAN_1: u64 = 1_704_067_200;

#[tokio::test]
async fn ingested_file_is_moved_and_watermark_advances() {
    let h = Harness::new("pw").await;
    let path = h.write_export(
        "week-01.csv",
        "Activity,Group,01-01-24,02-01-24\nWork,Team A,90,0\nMeet,Team B,30,15\n",
        JAN_1,
    );

    let summary = h.uploader().run_once().await.unwrap();

    assert_eq!(summary.discovered, 1);
    assert_eq!(summary.eligible, 1);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.inserted, 3);
    assert_eq!(summary.groups_created, 2);
    assert!(!path.exists());
    assert!(h.processed_path("week-01.csv").exists());
    assert_eq!(summary.new_watermark, at(JAN_1 as i64));
    assert_eq!(h.watermark().await, at(JAN_1 as i64));
    assert_eq!(h.store.rows().await.len(), 3);
}

#[tokio::test]
async fn malformed_file_stays_and_holds_watermark_below_it() {
    let h = Harness::new("pw").await;
    let bad = h.write_export("a-bad.csv", "Activity,Group,2024-01-01\nWork,Team A,1\n", JAN_1);
    h.write_export(
        "b-good.csv",
        "Activity,Group,01-01-24\nWork,Team A,10\n",
        JAN_1 + 3600,
    );

    let summary = h.uploader().run_once().await.unwrap();
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.failures[0].file, "a-bad.csv");
    assert!(summary.failures[0].error.contains("DD-MM-YY"));
    assert!(bad.exists());
    assert!(h.processed_path("b-good.csv").exists());

    let expected = at(JAN_1 as i64) - ChronoDuration::nanoseconds(1);
    assert_eq!(h.watermark().await, expected);

    // The failed file is picked up again on the next run.
    let retry = h.uploader().run_once().await.unwrap();
    assert_eq!(retry.eligible, 1);
    assert_eq!(retry.failed, 1);
    assert_eq!(h.watermark().await, expected);
}

#[tokio::test]
async fn files_at_or_below_watermark_are_skipped() {
    let h = Harness::new("pw").await;
    WatermarkStore::new(&h.config.watermark_file)
        .set(at(JAN_1 as i64))
        .await
        .unwrap();
    let old = h.write_export("old.csv", "Activity,Group,01-01-24\nWork,Team A,10\n", JAN_1);
    fs::write(h.export_path("notes.txt"), "not an export").unwrap();

    let summary = h.uploader().run_once().await.unwrap();
    assert_eq!(summary.discovered, 1);
    assert_eq!(summary.eligible, 0);
    assert_eq!(summary.skipped, 1);
    assert!(old.exists());
    assert_eq!(h.store.calls().await.total(), 0);
    assert_eq!(h.watermark().await, at(JAN_1 as i64));
}

#[tokio::test]
async fn files_are_applied_oldest_first() {
    let h = Harness::new("pw").await;
    // Name order and mtime order disagree; the newer file must win.
    h.write_export("a-newer.csv", "Activity,Group,01-01-24\nWork,Team A,20\n", JAN_1 + 60);
    h.write_export("b-older.csv", "Activity,Group,01-01-24\nWork,Team A,10\n", JAN_1);

    let summary = h.uploader().run_once().await.unwrap();
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.inserted, 1);
    assert_eq!(summary.updated, 1);

    let rows = h.store.rows().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].duration, 20);
}

#[tokio::test]
async fn empty_export_succeeds_without_store_calls() {
    let h = Harness::new("pw").await;
    h.write_export("empty.csv", "Activity,Group,01-01-24\nWork,Team A,0\n", JAN_1);

    let summary = h.uploader().run_once().await.unwrap();
    assert_eq!(summary.succeeded, 1);
    assert_eq!(h.store.calls().await.total(), 0);
    assert!(h.processed_path("empty.csv").exists());
}

#[tokio::test]
async fn repeated_authentication_failures_stop_the_run() {
    let h = Harness::new("wrong-password").await;
    for (i, name) in ["a.csv", "b.csv", "c.csv"].into_iter().enumerate() {
        h.write_export(
            name,
            "Activity,Group,01-01-24\nWork,Team A,10\n",
            JAN_1 + i as u64,
        );
    }

    let err = h.uploader().run_once().await.unwrap_err();
    assert!(matches!(err, SyncError::Authentication { failures: 2, .. }));
    assert_eq!(h.store.calls().await.authenticate, 2);
    for name in ["a.csv", "b.csv", "c.csv"] {
        assert!(h.export_path(name).exists());
    }
    assert_eq!(h.watermark().await, at(1_577_836_800));
}

#[tokio::test]
async fn store_outage_fails_each_file_without_ending_the_run() {
    let h = Harness::new("pw").await;
    h.store.set_offline(true).await;
    for (i, name) in ["a.csv", "b.csv", "c.csv"].into_iter().enumerate() {
        h.write_export(
            name,
            "Activity,Group,01-01-24\nWork,Team A,10\n",
            JAN_1 + i as u64,
        );
    }

    let summary = h.uploader().run_once().await.unwrap();
    assert_eq!(summary.eligible, 3);
    assert_eq!(summary.succeeded, 0);
    assert_eq!(summary.failed, 3);
    assert_eq!(h.store.calls().await.authenticate, 3);
    for name in ["a.csv", "b.csv", "c.csv"] {
        assert!(h.export_path(name).exists());
    }
    assert!(h.watermark().await < at(JAN_1 as i64));

    // Once the store is back, the same files are picked up and archived.
    h.store.set_offline(false).await;
    let retry = h.uploader().run_once().await.unwrap();
    assert_eq!(retry.succeeded, 3);
    assert_eq!(h.watermark().await, at(JAN_1 as i64 + 2));
}

#[tokio::test]
async fn corrupt_watermark_is_fatal() {
    let h = Harness::new("pw").await;
    fs::write(&h.config.watermark_file, "not a timestamp").unwrap();
    let path = h.write_export("week.csv", "Activity,Group,01-01-24\nWork,Team A,10\n", JAN_1);

    let err = h.uploader().run_once().await.unwrap_err();
    assert!(matches!(err, SyncError::Watermark(_)));
    assert!(path.exists());
    assert_eq!(
        fs::read_to_string(&h.config.watermark_file).unwrap(),
        "not a timestamp"
    );
}

#[tokio::test]
async fn first_run_baselines_watermark_to_now() {
    let h = Harness::new("pw").await;
    fs::remove_file(&h.config.watermark_file).unwrap();
    let path = h.write_export("existing.csv", "Activity,Group,01-01-24\nWork,Team A,10\n", JAN_1);

    let before = Utc::now();
    let summary = h.uploader().run_once().await.unwrap();
    assert!(summary.previous_watermark >= before);
    assert_eq!(summary.eligible, 0);
    assert!(path.exists());
    assert_eq!(h.watermark().await, summary.previous_watermark);
}

#[tokio::test]
async fn missing_export_dir_is_fatal() {
    let h = Harness::new("pw").await;
    let mut config = h.config.clone();
    config.processed_dir = h.config.export_dir.with_file_name("archive");
    config.watermark_file = h.config.export_dir.with_file_name("last_update.txt");
    fs::remove_dir_all(&h.config.export_dir).unwrap();

    let err = Uploader::new(config, h.store.clone())
        .run_once()
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::ListExports { .. }));
}
