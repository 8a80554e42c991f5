//! High-level pipeline: list tagged documents, skip ones already exported,
//! convert or fetch each, upload via rmapi, and record the export.
//!
//! The run is strictly sequential. A per-document failure is recorded in the
//! report and the run continues with the next document; a listing failure
//! aborts the run.

use std::path::Path;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::SyncSettings;
use crate::convert::Converter;
use crate::readwise::{filter_documents, Document, ReaderApi, ReadwiseError};
use crate::tracker::ExportTracker;
use crate::upload::Uploader;

/// Reader location documents are moved to when `archive_after_sync` is set.
pub const ARCHIVE_LOCATION: &str = "archive";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Readwise(#[from] ReadwiseError),
    #[error("failed to create scratch directory: {0}")]
    Scratch(#[source] std::io::Error),
}

/// Outcome of one sync run.
#[derive(Debug, Default)]
pub struct SyncReport {
    /// Documents that matched the tag/location filter.
    pub matched: usize,
    /// Matched documents skipped because the tracker already has them.
    pub already_exported: usize,
    pub synced: Vec<SyncedDocument>,
    pub failed: Vec<FailedDocument>,
}

#[derive(Debug)]
pub struct SyncedDocument {
    pub id: String,
    pub title: String,
    pub file_name: String,
}

#[derive(Debug)]
pub struct FailedDocument {
    pub id: String,
    pub title: String,
    pub reason: String,
}

impl SyncReport {
    pub fn summary(&self) -> String {
        let mut lines = vec![format!(
            "Sync finished: {} matched, {} already exported, {} synced, {} failed.",
            self.matched,
            self.already_exported,
            self.synced.len(),
            self.failed.len()
        )];
        for doc in &self.synced {
            lines.push(format!("  synced: {} -> {}", doc.title, doc.file_name));
        }
        for doc in &self.failed {
            lines.push(format!("  failed: {} ({})", doc.title, doc.reason));
        }
        lines.join("\n")
    }
}

/// Runs one full sync pass.
pub async fn synchronise<R, C, U>(
    settings: &SyncSettings,
    reader: &R,
    converter: &C,
    uploader: &U,
    tracker: &mut ExportTracker,
) -> Result<SyncReport, SyncError>
where
    R: ReaderApi,
    C: Converter,
    U: Uploader,
{
    info!(
        tag = %settings.tag,
        locations = ?settings.locations,
        "Starting Readwise to reMarkable sync"
    );

    let mut documents: Vec<Document> = Vec::new();
    for location in &settings.locations {
        documents.extend(reader.list_documents(location).await?);
    }
    let matched = filter_documents(documents, &settings.tag, &settings.locations);
    info!(count = matched.len(), tag = %settings.tag, "Documents matching tag filter");

    let mut report = SyncReport {
        matched: matched.len(),
        ..Default::default()
    };

    let mut pending = Vec::new();
    for document in matched {
        if tracker.is_exported(&document.id) {
            report.already_exported += 1;
        } else {
            pending.push(document);
        }
    }

    if pending.is_empty() {
        info!("Nothing new to sync");
        return Ok(report);
    }

    let scratch = tempfile::tempdir().map_err(SyncError::Scratch)?;
    let total = pending.len();
    for (index, document) in pending.iter().enumerate() {
        info!(
            n = index + 1,
            total,
            title = document.title(),
            "Processing document"
        );
        match process_document(settings, reader, converter, uploader, tracker, scratch.path(), document)
            .await
        {
            Ok(file_name) => report.synced.push(SyncedDocument {
                id: document.id.clone(),
                title: document.title().to_string(),
                file_name,
            }),
            Err(reason) => {
                error!(title = document.title(), %reason, "Failed to sync document");
                report.failed.push(FailedDocument {
                    id: document.id.clone(),
                    title: document.title().to_string(),
                    reason: reason.to_string(),
                });
            }
        }
    }

    info!(
        synced = report.synced.len(),
        failed = report.failed.len(),
        skipped = report.already_exported,
        "Sync finished"
    );
    Ok(report)
}

/// Converts, uploads and records a single document. The document is only
/// marked exported after a successful upload.
async fn process_document<R, C, U>(
    settings: &SyncSettings,
    reader: &R,
    converter: &C,
    uploader: &U,
    tracker: &mut ExportTracker,
    scratch: &Path,
    document: &Document,
) -> Result<String, Box<dyn std::error::Error + Send + Sync>>
where
    R: ReaderApi,
    C: Converter,
    U: Uploader,
{
    let file = converter.prepare(document, scratch).await?;
    uploader.upload(&file).await?;
    tracker.mark_exported(&document.id, document.title())?;

    if settings.archive_after_sync {
        if let Err(error) = reader.update_location(&document.id, ARCHIVE_LOCATION).await {
            warn!(
                id = %document.id,
                %error,
                "Uploaded but could not archive document in Readwise"
            );
        }
    }

    let file_name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| file.display().to_string());
    Ok(file_name)
}
