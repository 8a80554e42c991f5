use serde::Deserialize;
use std::path::PathBuf;
use tracing::{debug, info};

/// Raw on-disk configuration file. The Readwise access token may instead be
/// supplied via the `READWISE_TOKEN` environment variable, which takes
/// precedence over the file value.
#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub readwise: ReadwiseSection,
    #[serde(default)]
    pub remarkable: RemarkableSection,
    #[serde(default)]
    pub sync: SyncSection,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReadwiseSection {
    #[serde(default)]
    pub access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RemarkableSection {
    /// Path to the rmapi binary. Defaults to `rmapi` on PATH.
    #[serde(default = "default_rmapi_path")]
    pub rmapi_path: String,
    /// Destination folder on the tablet.
    #[serde(default = "default_folder")]
    pub folder: String,
}

impl Default for RemarkableSection {
    fn default() -> Self {
        Self {
            rmapi_path: default_rmapi_path(),
            folder: default_folder(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SyncSection {
    /// Reader locations to poll (new, later, shortlist, archive, feed).
    #[serde(default = "default_locations")]
    pub locations: Vec<String>,
    /// Documents must carry this tag to be exported.
    #[serde(default = "default_tag")]
    pub tag: String,
    /// Move documents to the archive location after a successful upload.
    #[serde(default)]
    pub archive_after_sync: bool,
    /// Append-only ledger of already-exported document ids.
    #[serde(default = "default_tracker_file")]
    pub tracker_file: PathBuf,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            locations: default_locations(),
            tag: default_tag(),
            archive_after_sync: false,
            tracker_file: default_tracker_file(),
        }
    }
}

fn default_rmapi_path() -> String {
    "rmapi".to_string()
}

fn default_folder() -> String {
    "Readwise".to_string()
}

fn default_locations() -> Vec<String> {
    vec!["new".to_string(), "later".to_string(), "shortlist".to_string()]
}

fn default_tag() -> String {
    "remarkable".to_string()
}

fn default_tracker_file() -> PathBuf {
    PathBuf::from("exported_documents.txt")
}

/// Fully resolved settings for one sync run: file values merged with
/// environment secrets and defaults applied.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub access_token: String,
    pub rmapi_path: String,
    pub folder: String,
    pub locations: Vec<String>,
    pub tag: String,
    pub archive_after_sync: bool,
    pub tracker_file: PathBuf,
}

impl SyncSettings {
    pub fn trace_loaded(&self) {
        info!(
            rmapi_path = %self.rmapi_path,
            folder = %self.folder,
            locations = ?self.locations,
            tag = %self.tag,
            archive_after_sync = self.archive_after_sync,
            "Loaded configuration"
        );
        debug!(
            token_len = self.access_token.len(),
            tracker_file = %self.tracker_file.display(),
            "Configuration details"
        );
    }
}
