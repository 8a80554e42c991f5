//! Append-only ledger of documents that already reached the tablet, so a
//! scheduled run never uploads the same document twice.
//!
//! Each line is `<RFC3339 timestamp> - <title> (<document id>)`. Lines that
//! are blank or start with `#` are ignored.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use chrono::Utc;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("invalid tracker pattern: {0}")]
    Pattern(#[from] regex::Error),
}

pub struct ExportTracker {
    path: PathBuf,
    exported: HashSet<String>,
}

impl ExportTracker {
    /// Opens the ledger, loading previously exported document ids. A missing
    /// file is fine; an unreadable one is a warning and we start empty.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, TrackerError> {
        let path = path.into();
        let entry_id = Regex::new(r"\(([^)]+)\)$")?;
        let mut exported = HashSet::new();

        if path.exists() {
            match fs::read_to_string(&path) {
                Ok(contents) => {
                    for line in contents.lines() {
                        let line = line.trim();
                        if line.is_empty() || line.starts_with('#') {
                            continue;
                        }
                        if let Some(captures) = entry_id.captures(line) {
                            exported.insert(captures[1].to_string());
                        }
                    }
                }
                Err(error) => {
                    warn!(
                        path = %path.display(),
                        %error,
                        "Could not read export tracker, starting empty"
                    );
                }
            }
        }

        debug!(path = %path.display(), count = exported.len(), "Loaded export tracker");
        Ok(Self { path, exported })
    }

    pub fn is_exported(&self, id: &str) -> bool {
        self.exported.contains(id)
    }

    pub fn mark_exported(&mut self, id: &str, title: &str) -> Result<(), TrackerError> {
        let entry = format!("{} - {} ({})\n", Utc::now().to_rfc3339(), title, id);

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(entry.as_bytes())?;

        self.exported.insert(id.to_string());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.exported.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exported.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marked_documents_survive_a_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exported.txt");

        let mut tracker = ExportTracker::open(&path).unwrap();
        assert!(!tracker.is_exported("doc-1"));
        tracker.mark_exported("doc-1", "A Great Read").unwrap();
        tracker.mark_exported("doc-2", "Another (with parens)").unwrap();
        assert!(tracker.is_exported("doc-1"));

        let reopened = ExportTracker::open(&path).unwrap();
        assert!(reopened.is_exported("doc-1"));
        assert!(reopened.is_exported("doc-2"));
        assert_eq!(reopened.len(), 2);
    }

    #[test]
    fn comments_blanks_and_garbage_lines_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exported.txt");
        std::fs::write(
            &path,
            "# header comment\n\nnot a valid entry\n2026-01-01T00:00:00Z - Title (doc-9)\n",
        )
        .unwrap();

        let tracker = ExportTracker::open(&path).unwrap();
        assert_eq!(tracker.len(), 1);
        assert!(tracker.is_exported("doc-9"));
    }

    #[test]
    fn missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = ExportTracker::open(dir.path().join("nope.txt")).unwrap();
        assert!(tracker.is_empty());
    }
}
