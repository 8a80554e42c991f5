use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::{error, info};

use crate::config::{ConfigFile, SyncSettings};

/// Environment variable that overrides `readwise.access_token` from the file.
pub const TOKEN_ENV_VAR: &str = "READWISE_TOKEN";

/// Value shipped in sample configs; never a real token.
const TOKEN_PLACEHOLDER: &str = "your_readwise_access_token_here";

/// Loads the static YAML config file and resolves the access token from the
/// environment or the file. Returns fully merged settings or an error.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<SyncSettings> {
    let path = path.as_ref();
    info!(config_path = ?path, "Loading configuration from file");

    if !path.exists() {
        error!(config_path = ?path, "Config file not found");
        bail!(
            "config file not found at {}; see config.example.yaml for the expected layout",
            path.display()
        );
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;

    let file: ConfigFile = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config YAML {}", path.display()))?;
    info!(config_path = ?path, "Parsed config YAML successfully");

    let access_token = match resolve_token(&file) {
        Some(token) => token,
        None => {
            error!("No Readwise access token configured");
            bail!(
                "no Readwise access token: set the {TOKEN_ENV_VAR} environment variable \
                 or readwise.access_token in the config file"
            );
        }
    };

    let locations: Vec<String> = file
        .sync
        .locations
        .into_iter()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect();
    if locations.is_empty() {
        bail!("sync.locations must list at least one Reader location");
    }

    let tag = file.sync.tag.trim().to_string();
    if tag.is_empty() {
        bail!("sync.tag must not be empty");
    }

    let settings = SyncSettings {
        access_token,
        rmapi_path: file.remarkable.rmapi_path,
        folder: file.remarkable.folder,
        locations,
        tag,
        archive_after_sync: file.sync.archive_after_sync,
        tracker_file: file.sync.tracker_file,
    };

    info!(
        folder = %settings.folder,
        locations = ?settings.locations,
        tag = %settings.tag,
        "Config loaded and merged successfully"
    );

    Ok(settings)
}

fn resolve_token(file: &ConfigFile) -> Option<String> {
    let from_env = std::env::var(TOKEN_ENV_VAR)
        .ok()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());
    if from_env.is_some() {
        info!("Using Readwise access token from {TOKEN_ENV_VAR}");
    }

    from_env
        .or_else(|| {
            file.readwise
                .access_token
                .as_ref()
                .map(|t| t.trim().to_string())
        })
        .filter(|t| !t.is_empty() && t != TOKEN_PLACEHOLDER)
}
