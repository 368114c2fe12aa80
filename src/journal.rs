use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::AppConfig;
use crate::errors::AppResult;

const JOURNAL_FILE: &str = "run-journal.jsonl";

#[derive(Debug, Clone, Copy)]
pub struct JournalSettings {
    pub enabled: bool,
    pub batch_size: usize,
    pub max_file_bytes: u64,
    pub max_file_count: usize,
}

impl JournalSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            enabled: config.journal_enabled,
            batch_size: config.journal_batch_size.max(1),
            max_file_bytes: config.journal_max_bytes,
            max_file_count: config.journal_max_files,
        }
    }
}

/// Append-only JSONL record of batch runs and per-place outcomes, rotated by
/// size next to the database.
#[derive(Clone)]
pub struct RunJournal {
    settings: JournalSettings,
    queue: Arc<Mutex<Vec<JournalEntry>>>,
    path: PathBuf,
}

#[derive(Debug, Serialize)]
pub struct JournalEntry {
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub place_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub detail: serde_json::Value,
}

impl RunJournal {
    pub fn new<P: AsRef<Path>>(data_dir: P, settings: JournalSettings) -> AppResult<Self> {
        let data_dir = data_dir.as_ref();
        let path = data_dir.join(JOURNAL_FILE);
        if settings.enabled {
            fs::create_dir_all(data_dir)?;
            OpenOptions::new().create(true).append(true).open(&path)?;
        }
        Ok(Self {
            settings,
            queue: Arc::new(Mutex::new(Vec::new())),
            path,
        })
    }

    /// A journal that accepts and drops everything.
    pub fn disabled() -> Self {
        Self {
            settings: JournalSettings {
                enabled: false,
                batch_size: 1,
                max_file_bytes: 0,
                max_file_count: 1,
            },
            queue: Arc::new(Mutex::new(Vec::new())),
            path: PathBuf::from(JOURNAL_FILE),
        }
    }

    pub fn record(
        &self,
        event: impl Into<String>,
        place_id: Option<&str>,
        detail: serde_json::Value,
    ) -> AppResult<()> {
        if !self.settings.enabled {
            return Ok(());
        }
        let mut queue = self.queue.lock();
        queue.push(JournalEntry {
            event: event.into(),
            place_id: place_id.map(str::to_string),
            timestamp: Utc::now(),
            detail,
        });
        if queue.len() >= self.settings.batch_size {
            self.persist_locked(&mut queue)?;
        }
        Ok(())
    }

    pub fn flush(&self) -> AppResult<()> {
        let mut queue = self.queue.lock();
        self.persist_locked(&mut queue)
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entries leave the queue only once they are on disk.
    fn persist_locked(&self, queue: &mut Vec<JournalEntry>) -> AppResult<()> {
        if queue.is_empty() {
            return Ok(());
        }
        let mut lines = Vec::with_capacity(queue.len());
        let mut incoming = 0_u64;
        for entry in queue.iter() {
            let line = serde_json::to_vec(entry)?;
            incoming += (line.len() + 1) as u64;
            lines.push(line);
        }

        self.rotate_if_needed(incoming)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        for line in &lines {
            file.write_all(line)?;
            file.write_all(b"\n")?;
        }
        file.flush()?;
        queue.clear();
        Ok(())
    }

    fn rotate_if_needed(&self, incoming: u64) -> AppResult<()> {
        let current = fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        if current == 0 || current + incoming <= self.settings.max_file_bytes {
            return Ok(());
        }

        if self.settings.max_file_count <= 1 {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&self.path)?;
            return Ok(());
        }

        let rotated = self.parent().join(format!(
            "{}-{}.jsonl",
            self.stem(),
            Utc::now().format("%Y%m%d%H%M%S%3f")
        ));
        fs::rename(&self.path, rotated)?;
        self.prune_rotations()
    }

    fn prune_rotations(&self) -> AppResult<()> {
        let prefix = format!("{}-", self.stem());
        let mut rotations = fs::read_dir(self.parent())?
            .filter_map(|entry| {
                let entry = entry.ok()?;
                let name = entry.file_name().to_string_lossy().to_string();
                if !(name.starts_with(&prefix) && name.ends_with(".jsonl")) {
                    return None;
                }
                Some((entry.path(), entry.metadata().ok()?.modified().ok()?))
            })
            .collect::<Vec<_>>();

        rotations.sort_by_key(|(_, modified)| *modified);
        let allowed = self.settings.max_file_count.saturating_sub(1);
        let excess = rotations.len().saturating_sub(allowed);
        for (path, _) in rotations.into_iter().take(excess) {
            let _ = fs::remove_file(path);
        }
        Ok(())
    }

    fn parent(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }

    fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "run-journal".into())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::tempdir;

    use super::*;

    fn settings(batch_size: usize) -> JournalSettings {
        JournalSettings {
            enabled: true,
            batch_size,
            max_file_bytes: 4096,
            max_file_count: 3,
        }
    }

    fn rotated_files(dir: &Path) -> usize {
        fs::read_dir(dir)
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with("run-journal-"))
            .count()
    }

    #[test]
    fn buffers_until_batch_size_then_writes() {
        let dir = tempdir().unwrap();
        let journal = RunJournal::new(dir.path(), settings(2)).unwrap();
        journal
            .record("place_completed", Some("p1"), json!({ "inserted": 2 }))
            .unwrap();
        assert_eq!(journal.pending(), 1);
        assert_eq!(fs::read_to_string(journal.path()).unwrap(), "");

        journal
            .record("place_failed", Some("p2"), json!({ "error": "HTTP 502" }))
            .unwrap();
        assert_eq!(journal.pending(), 0);
        let written = fs::read_to_string(journal.path()).unwrap();
        let lines: Vec<serde_json::Value> = written
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["place_id"], "p1");
        assert_eq!(lines[1]["detail"]["error"], "HTTP 502");
    }

    #[test]
    fn appends_across_instances() {
        let dir = tempdir().unwrap();
        {
            let journal = RunJournal::new(dir.path(), settings(10)).unwrap();
            journal.record("run_started", None, json!({})).unwrap();
            journal.flush().unwrap();
        }
        let journal = RunJournal::new(dir.path(), settings(10)).unwrap();
        journal.record("run_finished", None, json!({})).unwrap();
        journal.flush().unwrap();

        let written = fs::read_to_string(journal.path()).unwrap();
        assert!(written.contains("run_started"));
        assert!(written.contains("run_finished"));
        assert!(!written.contains("place_id"));
    }

    #[test]
    fn rotation_keeps_bounded_history() {
        let dir = tempdir().unwrap();
        let journal = RunJournal::new(
            dir.path(),
            JournalSettings {
                enabled: true,
                batch_size: 1,
                max_file_bytes: 64,
                max_file_count: 2,
            },
        )
        .unwrap();
        for idx in 0..5 {
            journal
                .record(
                    "place_completed",
                    Some("p1"),
                    json!({ "note": "0123456789abcdef0123456789abcdef", "idx": idx }),
                )
                .unwrap();
        }
        assert_eq!(rotated_files(dir.path()), 1);
        assert!(fs::read_to_string(journal.path()).unwrap().contains("\"idx\":4"));
    }

    #[test]
    fn failed_write_keeps_entries_queued() {
        let dir = tempdir().unwrap();
        let data_dir = dir.path().join("journal");
        let journal = RunJournal::new(&data_dir, settings(1)).unwrap();
        fs::remove_dir_all(&data_dir).unwrap();

        assert!(journal.record("place_failed", Some("p1"), json!({})).is_err());
        assert_eq!(journal.pending(), 1);
    }

    #[test]
    fn disabled_journal_touches_nothing() {
        let journal = RunJournal::disabled();
        journal.record("run_started", None, json!({})).unwrap();
        journal.flush().unwrap();
        assert_eq!(journal.pending(), 0);
        assert!(!journal.path().exists());
    }
}
