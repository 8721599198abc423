//! JSON Lines partition log.
//!
//! Uses JSON Lines format (.jsonl) for robustness:
//! - Each line is a complete upsert or tombstone
//! - Partial file corruption only affects individual lines
//! - The file is opened in append mode and flushed after every entry
//! - Compaction rewrites the live set through a temp file + rename

use crate::error::PersistenceResult;
use chrono::{DateTime, Utc};
use cmdty_core::DurableRecord;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// One line of a partition log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum LogEntry {
    Put(DurableRecord),
    Delete { key: String, at: DateTime<Utc> },
}

/// Append-only log for one partition.
pub struct PartitionLog {
    path: PathBuf,
    writer: BufWriter<File>,
    entries_written: usize,
}

impl PartitionLog {
    /// Open (or create) the log at `path` in append mode.
    pub fn open(path: &Path) -> PersistenceResult<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        debug!(path = %path.display(), "Opened partition log (append mode)");

        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            entries_written: 0,
        })
    }

    /// Append one entry and flush it to disk.
    pub fn append(&mut self, entry: &LogEntry) -> PersistenceResult<()> {
        let json = serde_json::to_string(entry)?;
        writeln!(self.writer, "{}", json)?;
        self.writer.flush()?;
        self.entries_written += 1;
        Ok(())
    }

    /// Replace the log with exactly `records`, then reopen for appends.
    pub fn compact<'a>(
        &mut self,
        records: impl Iterator<Item = &'a DurableRecord>,
    ) -> PersistenceResult<usize> {
        let tmp_path = self.path.with_extension("jsonl.tmp");
        let mut count = 0;
        {
            let mut tmp = BufWriter::new(File::create(&tmp_path)?);
            for record in records {
                let json = serde_json::to_string(&LogEntry::Put(record.clone()))?;
                writeln!(tmp, "{}", json)?;
                count += 1;
            }
            tmp.flush()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.entries_written = 0;

        info!(path = %self.path.display(), records = count, "Compacted partition log");
        Ok(count)
    }

    /// Entries appended since open or last compaction.
    pub fn entries_written(&self) -> usize {
        self.entries_written
    }
}

/// Read every parseable entry from `path`. A missing file yields nothing.
pub fn replay(path: &Path) -> PersistenceResult<Vec<LogEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let reader = BufReader::new(File::open(path)?);
    let mut entries = Vec::new();
    let mut skipped = 0usize;

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LogEntry>(&line) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                skipped += 1;
                debug!(?e, "Skipping unreadable log line");
            }
        }
    }

    if skipped > 0 {
        warn!(path = %path.display(), skipped, "Partition log contained unreadable lines");
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cmdty_core::EntityType;
    use serde_json::json;
    use tempfile::TempDir;

    fn make_record(key: &str) -> DurableRecord {
        DurableRecord {
            entity_type: EntityType::Commodities,
            key: key.to_string(),
            payload: json!({"price": "2001.50"}),
            written_at: Utc::now(),
        }
    }

    #[test]
    fn test_append_and_replay() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("commodities.jsonl");

        {
            let mut log = PartitionLog::open(&path).unwrap();
            log.append(&LogEntry::Put(make_record("Gold Futures"))).unwrap();
            log.append(&LogEntry::Delete {
                key: "Gold Futures".into(),
                at: Utc::now(),
            })
            .unwrap();
            assert_eq!(log.entries_written(), 2);
        }

        let entries = replay(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(matches!(entries[0], LogEntry::Put(_)));
        assert!(matches!(entries[1], LogEntry::Delete { .. }));
    }

    #[test]
    fn test_replay_skips_torn_line() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("news.jsonl");

        {
            let mut log = PartitionLog::open(&path).unwrap();
            log.append(&LogEntry::Put(make_record("a"))).unwrap();
        }
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            write!(file, "{{\"op\":\"put\",\"entityType\":").unwrap();
        }

        let entries = replay(&path).unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_compact_keeps_only_live_records() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("portfolio.jsonl");

        let mut log = PartitionLog::open(&path).unwrap();
        for key in ["a", "b", "c"] {
            log.append(&LogEntry::Put(make_record(key))).unwrap();
        }
        let live = vec![make_record("c")];
        assert_eq!(log.compact(live.iter()).unwrap(), 1);

        log.append(&LogEntry::Put(make_record("d"))).unwrap();
        let entries = replay(&path).unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn test_replay_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        assert!(replay(&temp_dir.path().join("missing.jsonl")).unwrap().is_empty());
    }
}
