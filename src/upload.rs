//! Upload to the reMarkable cloud via the external `rmapi` binary.

use std::path::{Path, PathBuf};
use std::process::Command;

use async_trait::async_trait;
#[cfg(any(test, feature = "test-export-mocks"))]
use mockall::automock;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("rmapi not found or not working at '{path}': {reason}")]
    Unavailable { path: String, reason: String },
    #[error("rmapi {subcommand} exited with {status}: {stderr}")]
    CommandFailed {
        subcommand: &'static str,
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("upload path has no file name: {0}")]
    InvalidPath(PathBuf),
    #[error("failed to launch rmapi: {0}")]
    Io(#[from] std::io::Error),
}

/// Pushes a file into the tablet's cloud storage. Mockable for orchestration
/// tests.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, file: &Path) -> Result<(), UploadError>;
}

pub struct RmapiUploader {
    rmapi_path: String,
    folder: String,
}

impl RmapiUploader {
    pub fn new(rmapi_path: impl Into<String>, folder: impl Into<String>) -> Self {
        Self {
            rmapi_path: rmapi_path.into(),
            folder: folder.into(),
        }
    }

    /// Probes the binary with `rmapi version`. A failure here is fatal: the
    /// run cannot do anything useful without the uploader.
    pub fn ensure_available(&self) -> Result<(), UploadError> {
        match Command::new(&self.rmapi_path).arg("version").output() {
            Ok(output) if output.status.success() => {
                debug!(
                    rmapi = %self.rmapi_path,
                    version = %String::from_utf8_lossy(&output.stdout).trim(),
                    "rmapi is available"
                );
                Ok(())
            }
            Ok(output) => Err(UploadError::Unavailable {
                path: self.rmapi_path.clone(),
                reason: format!("`rmapi version` exited with {}", output.status),
            }),
            Err(error) => Err(UploadError::Unavailable {
                path: self.rmapi_path.clone(),
                reason: error.to_string(),
            }),
        }
    }

    /// Creates the target folder on the tablet if `rmapi find` cannot see it.
    /// Failures are warnings; `rmapi put` will surface a real problem.
    pub fn ensure_folder(&self) {
        match Command::new(&self.rmapi_path)
            .args(["find", &self.folder])
            .output()
        {
            Ok(output)
                if output.status.success()
                    && !String::from_utf8_lossy(&output.stdout).trim().is_empty() =>
            {
                debug!(folder = %self.folder, "Folder exists on reMarkable");
            }
            Ok(_) => {
                info!(folder = %self.folder, "Creating folder on reMarkable");
                match Command::new(&self.rmapi_path)
                    .args(["mkdir", &self.folder])
                    .output()
                {
                    Ok(output) if output.status.success() => {}
                    Ok(output) => warn!(
                        folder = %self.folder,
                        status = %output.status,
                        stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                        "Could not create folder on reMarkable"
                    ),
                    Err(error) => warn!(
                        folder = %self.folder,
                        %error,
                        "Could not create folder on reMarkable"
                    ),
                }
            }
            Err(error) => {
                warn!(folder = %self.folder, %error, "Could not check folder on reMarkable");
            }
        }
    }
}

#[async_trait]
impl Uploader for RmapiUploader {
    async fn upload(&self, file: &Path) -> Result<(), UploadError> {
        let file_name = file
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| UploadError::InvalidPath(file.to_path_buf()))?;
        // Run from the file's directory so rmapi sees a bare relative name.
        let working_dir = file.parent().unwrap_or_else(|| Path::new("."));

        info!(file = file_name, folder = %self.folder, "Uploading to reMarkable");
        let output = Command::new(&self.rmapi_path)
            .arg("put")
            .arg(file_name)
            .arg(&self.folder)
            .current_dir(working_dir)
            .output()?;

        if output.status.success() {
            info!(file = file_name, "Uploaded to reMarkable");
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!(
                file = file_name,
                status = %output.status,
                stderr = %stderr,
                "rmapi put failed"
            );
            Err(UploadError::CommandFailed {
                subcommand: "put",
                status: output.status,
                stderr,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_binary_is_reported_as_unavailable() {
        let uploader = RmapiUploader::new("/definitely/not/rmapi", "Readwise");
        let err = uploader.ensure_available().unwrap_err();
        assert!(matches!(err, UploadError::Unavailable { .. }));
        assert!(err.to_string().contains("/definitely/not/rmapi"));
    }

    #[tokio::test]
    async fn upload_with_missing_binary_fails_with_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("doc.epub");
        std::fs::write(&file, b"stub").unwrap();

        let uploader = RmapiUploader::new("/definitely/not/rmapi", "Readwise");
        let err = uploader.upload(&file).await.unwrap_err();
        assert!(matches!(err, UploadError::Io(_)));
    }
}
