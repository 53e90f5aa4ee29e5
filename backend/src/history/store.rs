use serde::{Deserialize, Serialize};
use shared::LogEntry;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Prediction log lock poisoned")]
    Poisoned,
    #[error("Invalid log entry: {0}")]
    InvalidEntry(String),
}

/// One line of the persisted log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum LogRecord {
    Entry(LogEntry),
    /// Everything before this marker is gone; ids continue from `next_id`.
    Cleared { next_id: u64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Replay {
    pub entries: Vec<LogEntry>,
    pub next_id: u64,
}

impl Replay {
    pub fn from_records(records: impl IntoIterator<Item = LogRecord>) -> Self {
        let mut entries = Vec::new();
        let mut next_id = 1;
        for record in records {
            match record {
                LogRecord::Entry(entry) => {
                    next_id = next_id.max(entry.id + 1);
                    entries.push(entry);
                }
                LogRecord::Cleared { next_id: marker } => {
                    entries.clear();
                    next_id = next_id.max(marker);
                }
            }
        }
        Self { entries, next_id }
    }
}

/// Append-only backing storage for the prediction log.
///
/// Callers serialize access; a store never sees two operations at once.
pub trait LogStore: Send + Sync {
    fn load(&mut self) -> Result<Replay, StorageError>;

    fn append(&mut self, entry: &LogEntry) -> Result<(), StorageError>;

    /// Replaces the whole log with `entries`, preserving the id sequence.
    fn reset(&mut self, next_id: u64, entries: &[LogEntry]) -> Result<(), StorageError>;

    fn describe(&self) -> String;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Vec<LogRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogStore for MemoryStore {
    fn load(&mut self) -> Result<Replay, StorageError> {
        Ok(Replay::from_records(self.records.iter().cloned()))
    }

    fn append(&mut self, entry: &LogEntry) -> Result<(), StorageError> {
        self.records.push(LogRecord::Entry(entry.clone()));
        Ok(())
    }

    fn reset(&mut self, next_id: u64, entries: &[LogEntry]) -> Result<(), StorageError> {
        self.records = std::iter::once(LogRecord::Cleared { next_id })
            .chain(entries.iter().cloned().map(LogRecord::Entry))
            .collect();
        Ok(())
    }

    fn describe(&self) -> String {
        "in-memory".to_string()
    }
}

/// JSON Lines file. Appends add one line; resets rewrite through a temporary
/// file and rename so readers of the file never see a half-written log.
#[derive(Debug)]
pub struct JsonlStore {
    path: PathBuf,
    writer: Option<File>,
    /// Set when the file ends in a torn line that the next append must not extend.
    needs_newline: bool,
}

impl JsonlStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            writer: None,
            needs_newline: false,
        }
    }

    fn ensure_parent(&self) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    fn writer(&mut self) -> Result<&mut File, StorageError> {
        if self.writer.is_none() {
            self.ensure_parent()?;
            let file = OpenOptions::new()
                .read(true)
                .create(true)
                .append(true)
                .open(&self.path)?;
            if ends_in_torn_line(&file)? {
                self.needs_newline = true;
            }
            self.writer = Some(file);
        }
        self.writer.as_mut().ok_or(StorageError::Poisoned)
    }

    fn encode(record: &LogRecord) -> Result<String, StorageError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        Ok(line)
    }
}

fn ends_in_torn_line(mut file: &File) -> Result<bool, StorageError> {
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

impl LogStore for JsonlStore {
    fn load(&mut self) -> Result<Replay, StorageError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No prediction log at {}, starting empty", self.path.display());
                return Ok(Replay::from_records(Vec::new()));
            }
            Err(e) => return Err(e.into()),
        };
        self.needs_newline = !contents.is_empty() && !contents.ends_with('\n');

        let mut records = Vec::new();
        for (number, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) => log::warn!(
                    "Skipping unreadable line {} in {}: {}",
                    number + 1,
                    self.path.display(),
                    e
                ),
            }
        }
        Ok(Replay::from_records(records))
    }

    fn append(&mut self, entry: &LogEntry) -> Result<(), StorageError> {
        let mut line = Self::encode(&LogRecord::Entry(entry.clone()))?;
        self.writer()?;
        if self.needs_newline {
            line.insert(0, '\n');
        }
        // A failed write may leave a fragment behind; the next append starts a fresh line.
        self.needs_newline = true;
        let writer = self.writer()?;
        writer.write_all(line.as_bytes())?;
        writer.flush()?;
        self.needs_newline = false;
        Ok(())
    }

    fn reset(&mut self, next_id: u64, entries: &[LogEntry]) -> Result<(), StorageError> {
        let mut contents = Self::encode(&LogRecord::Cleared { next_id })?;
        for entry in entries {
            contents.push_str(&Self::encode(&LogRecord::Entry(entry.clone()))?);
        }

        self.ensure_parent()?;
        let tmp_path = self.path.with_extension("tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(contents.as_bytes())?;
            tmp.sync_all()?;
        }
        self.writer = None;
        fs::rename(&tmp_path, &self.path)?;
        self.needs_newline = false;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("jsonl file {}", self.path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::log_entry as entry;

    #[test]
    fn test_replay_honours_clear_marker() {
        let replay = Replay::from_records(vec![
            LogRecord::Entry(entry(1, "cat", 0.9)),
            LogRecord::Entry(entry(2, "dog", 0.8)),
            LogRecord::Cleared { next_id: 3 },
            LogRecord::Entry(entry(3, "cat", 0.7)),
        ]);
        assert_eq!(replay.entries.len(), 1);
        assert_eq!(replay.entries[0].id, 3);
        assert_eq!(replay.next_id, 4);

        let cleared = Replay::from_records(vec![LogRecord::Cleared { next_id: 42 }]);
        assert!(cleared.entries.is_empty());
        assert_eq!(cleared.next_id, 42);
    }

    #[test]
    fn test_jsonl_roundtrip_and_reset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("history.jsonl");

        let mut store = JsonlStore::new(&path);
        assert_eq!(store.load().unwrap().next_id, 1);
        store.append(&entry(1, "cat", 0.9)).unwrap();
        store.append(&entry(2, "dog", 0.4)).unwrap();

        let mut reopened = JsonlStore::new(&path);
        let replay = reopened.load().unwrap();
        assert_eq!(replay.entries.len(), 2);
        assert_eq!(replay.entries[1].top_prediction.class_name, "dog");
        assert_eq!(replay.next_id, 3);

        reopened.reset(3, &[]).unwrap();
        reopened.append(&entry(3, "bird", 0.5)).unwrap();

        let replay = JsonlStore::new(&path).load().unwrap();
        assert_eq!(replay.entries.len(), 1);
        assert_eq!(replay.entries[0].id, 3);
        assert_eq!(replay.next_id, 4);
    }

    #[test]
    fn test_jsonl_skips_torn_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.jsonl");
        let mut store = JsonlStore::new(&path);
        store.append(&entry(1, "cat", 0.9)).unwrap();
        drop(store);

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"record\":\"entry\",\"id\":2,\"timest").unwrap();
        drop(file);

        let mut store = JsonlStore::new(&path);
        let replay = store.load().unwrap();
        assert_eq!(replay.entries.len(), 1);
        assert_eq!(replay.next_id, 2);

        store.append(&entry(2, "dog", 0.5)).unwrap();
        let replay = JsonlStore::new(&path).load().unwrap();
        assert_eq!(replay.entries.len(), 2);
        assert_eq!(replay.entries[1].top_prediction.class_name, "dog");
    }

    #[test]
    fn test_append_after_fragment_without_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.jsonl");
        let mut store = JsonlStore::new(&path);
        store.append(&entry(5, "cat", 0.9)).unwrap();
        drop(store);

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"record\":\"entry\",\"id\":6,\"ti").unwrap();
        drop(file);

        let mut store = JsonlStore::new(&path);
        store.append(&entry(7, "dog", 0.5)).unwrap();
        store.append(&entry(8, "bird", 0.4)).unwrap();

        let replay = JsonlStore::new(&path).load().unwrap();
        let ids: Vec<u64> = replay.entries.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![5, 7, 8]);
        assert_eq!(replay.next_id, 9);
    }

    #[test]
    fn test_fragment_only_file_is_repaired_on_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.jsonl");
        fs::write(&path, b"{\"record\":\"cle").unwrap();

        let mut store = JsonlStore::new(&path);
        store.append(&entry(1, "cat", 0.9)).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.ends_with('\n'));
        let replay = JsonlStore::new(&path).load().unwrap();
        assert_eq!(replay.entries.len(), 1);
        assert_eq!(replay.entries[0].id, 1);
    }

    #[test]
    fn test_memory_store_reset() {
        let mut store = MemoryStore::new();
        store.append(&entry(1, "cat", 0.9)).unwrap();
        store.reset(2, &[]).unwrap();
        let replay = store.load().unwrap();
        assert!(replay.entries.is_empty());
        assert_eq!(replay.next_id, 2);
    }
}
