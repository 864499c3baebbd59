//! Disk-backed storage.
//!
//! Persistent state lives in three files inside `dir`:
//!   meta.json     - term and vote, overwritten atomically via rename
//!   log.jsonl     - one JSON object per retained log entry, one per line
//!   snapshot.json - the latest snapshot, overwritten atomically via rename
//!
//! Memory acts as a write-through cache: reads are served from memory,
//! writes update memory then flush to disk with fsync before returning.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::log::{LogEntry, Snapshot};
use crate::storage::{HardState, PersistedState, Storage};
use crate::types::LogIndex;

/// Error type for FileStorage operations.
#[derive(Debug, thiserror::Error)]
pub enum FileStorageError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt storage: {0}")]
    Corrupt(#[from] serde_json::Error),
}

pub struct FileStorage<C> {
    dir: PathBuf,
    hard_state: HardState,
    snapshot: Option<Snapshot>,
    entries: Vec<LogEntry<C>>,
}

impl<C> FileStorage<C>
where
    C: Clone + Serialize + DeserializeOwned,
{
    /// Open (or create) storage rooted at `dir`. On first use the directory
    /// is created and everything starts empty (term 0, no vote, empty log).
    pub fn open(dir: &Path) -> Result<Self, FileStorageError> {
        fs::create_dir_all(dir)?;
        let hard_state = Self::read_meta(dir)?;
        let snapshot = Self::read_snapshot(dir)?;
        let mut entries = Self::read_log(dir)?;
        if let Some(snapshot) = &snapshot {
            // A crash between writing the snapshot and rewriting the log
            // leaves compacted entries behind; drop them here.
            entries.retain(|e| e.index > snapshot.last_index);
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            hard_state,
            snapshot,
            entries,
        })
    }

    fn meta_path(&self) -> PathBuf {
        self.dir.join("meta.json")
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join("log.jsonl")
    }

    fn snapshot_path(&self) -> PathBuf {
        self.dir.join("snapshot.json")
    }

    fn read_meta(dir: &Path) -> Result<HardState, FileStorageError> {
        let path = dir.join("meta.json");
        if !path.exists() {
            return Ok(HardState::default());
        }
        let bytes = fs::read(&path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn read_snapshot(dir: &Path) -> Result<Option<Snapshot>, FileStorageError> {
        let path = dir.join("snapshot.json");
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    fn read_log(dir: &Path) -> Result<Vec<LogEntry<C>>, FileStorageError> {
        let path = dir.join("log.jsonl");
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&path)?;
        let lines: Vec<String> = BufReader::new(file).lines().collect::<Result<_, _>>()?;
        let mut entries = Vec::new();
        for (pos, line) in lines.iter().enumerate() {
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<LogEntry<C>>(line) {
                Ok(entry) => entries.push(entry),
                // A torn final line is an interrupted append: the entry was
                // never acknowledged, so dropping it is safe. Anything
                // earlier failing to parse is real corruption.
                Err(err) if pos + 1 == lines.len() => {
                    tracing::warn!(error = %err, "dropping torn trailing log entry");
                    break;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(entries)
    }

    /// Write `bytes` to `path` atomically: temp file, fsync, rename, fsync
    /// the directory so the rename survives a crash.
    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), FileStorageError> {
        let tmp = path.with_extension("tmp");
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, path)?;
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }

    fn flush_meta(&self) -> Result<(), FileStorageError> {
        let bytes = serde_json::to_vec(&self.hard_state)?;
        self.write_atomic(&self.meta_path(), &bytes)
    }

    /// Rewrite log.jsonl from the in-memory cache atomically and fsync.
    fn rewrite_log_file(&self) -> Result<(), FileStorageError> {
        let mut buffer = Vec::new();
        for entry in &self.entries {
            serde_json::to_writer(&mut buffer, entry)?;
            buffer.push(b'\n');
        }
        self.write_atomic(&self.log_path(), &buffer)
    }
}

impl<C> Storage<C> for FileStorage<C>
where
    C: Clone + Serialize + DeserializeOwned,
{
    type Error = FileStorageError;

    fn save_hard_state(&mut self, hard_state: HardState) -> Result<(), Self::Error> {
        self.hard_state = hard_state;
        self.flush_meta()
    }

    /// Appends are the hot path: serialized lines go out in one write with
    /// one fsync, without rewriting the file.
    fn append_entries(&mut self, entries: &[LogEntry<C>]) -> Result<(), Self::Error> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut buffer = Vec::new();
        for entry in entries {
            serde_json::to_writer(&mut buffer, entry)?;
            buffer.push(b'\n');
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())?;
        file.write_all(&buffer)?;
        file.sync_all()?;
        self.entries.extend_from_slice(entries);
        Ok(())
    }

    fn truncate_from(&mut self, from: LogIndex) -> Result<(), Self::Error> {
        self.entries.retain(|e| e.index < from);
        self.rewrite_log_file()
    }

    fn compact_through(&mut self, snapshot: &Snapshot) -> Result<(), Self::Error> {
        // Snapshot first: if we crash before the log rewrite, open() drops
        // the now-covered prefix.
        let bytes = serde_json::to_vec(snapshot)?;
        self.write_atomic(&self.snapshot_path(), &bytes)?;
        self.snapshot = Some(snapshot.clone());
        self.entries.retain(|e| e.index > snapshot.last_index);
        self.rewrite_log_file()
    }

    fn load(&self) -> Result<PersistedState<C>, Self::Error> {
        Ok(PersistedState {
            hard_state: self.hard_state,
            snapshot: self.snapshot.clone(),
            entries: self.entries.clone(),
        })
    }
}
