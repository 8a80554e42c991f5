pub mod config;
pub mod convert;
pub mod load_config;
pub mod readwise;
pub mod synchronise;
pub mod tracker;
pub mod upload;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::convert::DocumentConverter;
use crate::load_config::load_config;
use crate::readwise::ReadwiseClient;
use crate::synchronise::synchronise;
use crate::tracker::ExportTracker;
use crate::upload::RmapiUploader;

#[derive(Parser)]
#[clap(
    name = "reader-sync",
    version,
    about = "Sync tagged Readwise Reader documents to a reMarkable tablet via rmapi"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one sync pass: fetch tagged documents, convert and upload them
    Sync {
        /// Path to the YAML config file
        #[clap(long, default_value = "config.yaml")]
        config: PathBuf,
    },
}

/// Async CLI entrypoint shared by main() and integration tests.
pub async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Sync { config } => {
            let settings = load_config(config)?;
            settings.trace_loaded();

            let uploader = RmapiUploader::new(&settings.rmapi_path, &settings.folder);
            uploader
                .ensure_available()
                .context("rmapi is not usable; install it or fix remarkable.rmapi_path")?;
            uploader.ensure_folder();

            let reader = ReadwiseClient::new(&settings.access_token)?;
            let converter = DocumentConverter::new()?;
            let mut tracker = ExportTracker::open(&settings.tracker_file)?;

            let report = synchronise(&settings, &reader, &converter, &uploader, &mut tracker)
                .await
                .context("synchronisation failed")?;
            println!("{}", report.summary());
            Ok(())
        }
    }
}
