//! Durable per-file processing state.
//!
//! Records are keyed by repository-relative file path. Every mutation is a
//! per-key upsert that re-reads the file, checks the record version the
//! caller last saw, and atomically replaces the file. A concurrent writer
//! that changed the same key first causes [`StateError::Conflict`]; changes
//! to other keys are merged in.

use std::{
    collections::BTreeMap,
    fmt, fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Pending,
    Created,
    Assigned,
    Completed,
}

impl FileStatus {
    pub fn next(&self) -> Option<FileStatus> {
        match self {
            FileStatus::Pending => Some(FileStatus::Created),
            FileStatus::Created => Some(FileStatus::Assigned),
            FileStatus::Assigned => Some(FileStatus::Completed),
            FileStatus::Completed => None,
        }
    }

    /// Only single forward steps are legal.
    pub fn can_transition_to(&self, to: FileStatus) -> bool {
        self.next() == Some(to)
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FileStatus::Pending => "pending",
            FileStatus::Created => "created",
            FileStatus::Assigned => "assigned",
            FileStatus::Completed => "completed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub status: FileStatus,
    pub issue_number: Option<u64>,
    /// Issues filed for this path over its lifetime.
    pub issue_count: u32,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl FileRecord {
    fn fresh() -> Self {
        Self {
            status: FileStatus::Pending,
            issue_number: None,
            issue_count: 0,
            updated_at: Utc::now(),
            version: 0,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("failed to read state file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("state file {} is not valid: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to write state file {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("state for '{key}' changed concurrently (expected version {expected}, found {found})")]
    Conflict {
        key: String,
        expected: u64,
        found: u64,
    },
    #[error("illegal state transition for '{key}': {from} -> {to}")]
    InvalidTransition {
        key: String,
        from: FileStatus,
        to: FileStatus,
    },
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateDocument {
    #[serde(default)]
    files: BTreeMap<String, FileRecord>,
}

fn read_document(path: &Path) -> Result<StateDocument, StateError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(StateDocument::default()),
        Err(source) => {
            return Err(StateError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    if content.trim().is_empty() {
        return Ok(StateDocument::default());
    }

    serde_json::from_str(&content).map_err(|source| StateError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn write_document(path: &Path, doc: &StateDocument) -> Result<(), StateError> {
    let write_err = |source: std::io::Error| StateError::Write {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(write_err)?;
    }

    let json = serde_json::to_string_pretty(doc).map_err(|e| write_err(e.into()))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).map_err(write_err)?;
    fs::rename(&tmp, path).map_err(write_err)
}

#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    records: BTreeMap<String, FileRecord>,
    /// Set for a store started empty over an unreadable file; the first
    /// write moves that file aside and replaces it.
    replace_unreadable: bool,
}

impl StateStore {
    /// Loads the store; a missing file yields an empty store.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, StateError> {
        let path = path.into();
        let doc = read_document(&path)?;
        debug!(path = %path.display(), records = doc.files.len(), "Loaded state");
        Ok(Self {
            path,
            records: doc.files,
            replace_unreadable: false,
        })
    }

    /// An empty store bound to `path`, for runs that could not load state.
    /// If the file at `path` is corrupt, the first write keeps a copy at
    /// `<path>.corrupt` and starts the file over.
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            records: BTreeMap::new(),
            replace_unreadable: true,
        }
    }

    fn read_for_update(&self) -> Result<StateDocument, StateError> {
        match read_document(&self.path) {
            Err(StateError::Parse { source, .. }) if self.replace_unreadable => {
                let backup = self.path.with_extension("json.corrupt");
                warn!(
                    path = %self.path.display(),
                    backup = %backup.display(),
                    error = %source,
                    "Replacing unreadable state file"
                );
                fs::rename(&self.path, &backup).map_err(|source| StateError::Write {
                    path: backup,
                    source,
                })?;
                Ok(StateDocument {
                    files: self.records.clone(),
                })
            }
            other => other,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<&FileRecord> {
        self.records.get(key)
    }

    pub fn status(&self, key: &str) -> Option<FileStatus> {
        self.get(key).map(|r| r.status)
    }

    pub fn records(&self) -> impl Iterator<Item = (&String, &FileRecord)> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn upsert(&mut self, key: &str, mut record: FileRecord) -> Result<FileRecord, StateError> {
        let expected = record.version;
        let mut doc = self.read_for_update()?;
        let found = doc.files.get(key).map_or(0, |r| r.version);

        if found != expected {
            self.records = doc.files;
            return Err(StateError::Conflict {
                key: key.to_string(),
                expected,
                found,
            });
        }

        record.version = expected + 1;
        record.updated_at = Utc::now();
        doc.files.insert(key.to_string(), record.clone());
        write_document(&self.path, &doc)?;
        self.records = doc.files;
        self.replace_unreadable = false;

        Ok(record)
    }

    /// Records `key` as pending unless it is already tracked.
    pub fn ensure_pending(&mut self, key: &str) -> Result<(), StateError> {
        if !self.records.contains_key(key) {
            self.upsert(key, FileRecord::fresh())?;
        }
        Ok(())
    }

    /// Advances `key` one step to `to`. An untracked key starts at pending.
    /// Moving to `Created` records the issue number and bumps the issue count.
    pub fn transition(
        &mut self,
        key: &str,
        to: FileStatus,
        issue_number: Option<u64>,
    ) -> Result<FileRecord, StateError> {
        let mut record = self.records.get(key).cloned().unwrap_or_else(FileRecord::fresh);

        if !record.status.can_transition_to(to) {
            return Err(StateError::InvalidTransition {
                key: key.to_string(),
                from: record.status,
                to,
            });
        }

        record.status = to;
        if to == FileStatus::Created {
            record.issue_count += 1;
        }
        if issue_number.is_some() {
            record.issue_number = issue_number;
        }

        debug!(key, status = %to, issue = ?record.issue_number, "State transition");
        self.upsert(key, record)
    }

    /// Force-reprocess: puts `key` back to pending, keeping its issue count.
    pub fn reset(&mut self, key: &str) -> Result<FileRecord, StateError> {
        let mut record = self.records.get(key).cloned().unwrap_or_else(FileRecord::fresh);
        record.status = FileStatus::Pending;
        record.issue_number = None;
        self.upsert(key, record)
    }
}
