//! Per-print record store (C4).
//!
//! The printer only ever tells us about the print it's currently running; it
//! has no concept of print history. So that an agent restart mid-print can
//! recover its "how long has this been running" context, we persist one
//! small JSON file per print, keyed by its cookie, under
//! `<local_storage>/<serial>/PrintInfos/<cookie>.json`.

use std::path::{Path, PathBuf};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

const PRINT_ID_LEN: usize = 60;
const PRINT_ID_ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrintRecord {
    #[serde(rename = "PrintCookie")]
    pub print_cookie: String,
    #[serde(rename = "PrintId")]
    pub print_id: String,
    #[serde(rename = "PrintStartTimeSec")]
    pub local_start_time_sec: i64,
    #[serde(rename = "FileName")]
    pub file_name: Option<String>,
    #[serde(rename = "FileSizeKBytes")]
    pub file_size_kb: Option<i64>,
    #[serde(rename = "EstFilamentUsageMm")]
    pub est_filament_usage_mm: Option<f64>,
    #[serde(rename = "FinalPrintDurationSec")]
    pub final_duration_sec: Option<i64>,
}

impl PrintRecord {
    fn new(cookie: &str) -> Self {
        let mut rng = rand::thread_rng();
        let print_id: String = (0..PRINT_ID_LEN)
            .map(|_| {
                let idx = rng.gen_range(0..PRINT_ID_ALPHABET.len());
                PRINT_ID_ALPHABET[idx] as char
            })
            .collect();

        Self {
            print_cookie: cookie.to_string(),
            print_id,
            local_start_time_sec: chrono::Utc::now().timestamp(),
            file_name: None,
            file_size_kb: None,
            est_filament_usage_mm: None,
            final_duration_sec: None,
        }
    }
}

/// Directory-backed store, one instance per registered printer.
pub struct PrintRecordStore {
    dir: PathBuf,
}

impl PrintRecordStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, cookie: &str) -> PathBuf {
        self.dir.join(format!("{cookie}.json"))
    }

    /// Look up the record for `cookie`, best-effort garbage-collecting any
    /// other record file found in the directory (at most one cookie's
    /// record is meant to exist at a time).
    pub async fn get_or_none(&self, cookie: &str) -> Option<PrintRecord> {
        if let Err(e) = tokio::fs::create_dir_all(&self.dir).await {
            warn!(error = %e, dir = %self.dir.display(), "failed to create print records dir");
            return None;
        }

        let wanted_name = format!("{cookie}.json");
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "failed to list print records dir");
                return None;
            }
        };

        let mut found = None;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name == wanted_name {
                match self.read(&entry.path()).await {
                    Some(record) => found = Some(record),
                    None => {
                        // Unreadable record, drop it rather than keep retrying.
                        let _ = tokio::fs::remove_file(entry.path()).await;
                    }
                }
            } else if name.ends_with(".json") {
                // Best-effort GC of stale records for other cookies.
                let _ = tokio::fs::remove_file(entry.path()).await;
            }
        }

        found
    }

    async fn read(&self, path: &Path) -> Option<PrintRecord> {
        let bytes = tokio::fs::read(path).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    pub async fn create_new(&self, cookie: &str) -> PrintRecord {
        let record = PrintRecord::new(cookie);
        self.save(&record).await;
        record
    }

    pub async fn save(&self, record: &PrintRecord) {
        if let Err(e) = tokio::fs::create_dir_all(&self.dir).await {
            warn!(error = %e, "failed to create print records dir");
            return;
        }
        let path = self.path_for(&record.print_cookie);
        match serde_json::to_vec_pretty(record) {
            Ok(bytes) => {
                if let Err(e) = tokio::fs::write(&path, bytes).await {
                    warn!(error = %e, path = %path.display(), "failed to write print record");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize print record"),
        }
    }

    pub async fn clear_all(&self) {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(e) => e,
            Err(_) => return,
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let _ = tokio::fs::remove_file(entry.path()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_a_record() {
        let dir = tempdir();
        let store = PrintRecordStore::new(dir.clone());

        let mut record = store.create_new("p1-cube").await;
        assert_eq!(record.print_id.len(), PRINT_ID_LEN);

        record.file_name = Some("cube.3mf".to_string());
        record.final_duration_sec = Some(1234);
        store.save(&record).await;

        let reloaded = store.get_or_none("p1-cube").await.unwrap();
        assert_eq!(reloaded.print_id, record.print_id);
        assert_eq!(reloaded.file_name.as_deref(), Some("cube.3mf"));
        assert_eq!(reloaded.final_duration_sec, Some(1234));

        tokio::fs::remove_dir_all(dir).await.ok();
    }

    #[tokio::test]
    async fn lookup_for_different_cookie_evicts_stale_record() {
        let dir = tempdir();
        let store = PrintRecordStore::new(dir.clone());

        store.create_new("p1-cube").await;
        assert!(store.get_or_none("p2-sphere").await.is_none());
        assert!(store.get_or_none("p1-cube").await.is_none());

        tokio::fs::remove_dir_all(dir).await.ok();
    }

    #[tokio::test]
    async fn clear_all_removes_every_record() {
        let dir = tempdir();
        let store = PrintRecordStore::new(dir.clone());

        store.create_new("p1-cube").await;
        store.clear_all().await;
        assert!(store.get_or_none("p1-cube").await.is_none());

        tokio::fs::remove_dir_all(dir).await.ok();
    }

    fn tempdir() -> PathBuf {
        let mut rng = rand::thread_rng();
        let suffix: u64 = rng.gen();
        std::env::temp_dir().join(format!("bambu-agent-test-{suffix}"))
    }
}
