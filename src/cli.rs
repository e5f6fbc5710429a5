use crate::{
    CaptureService, Config, DomSerializer, HttpUploadClient, OuterHtmlSerializer, ScriptSerializer,
    SnapshotRequest,
};
use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::future::join_all;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "snapshot-capture")]
#[command(about = "Discover page assets and upload snapshots")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, help = "Number of pages discovering at once")]
    pub concurrency: Option<usize>,

    #[arg(long, global = true, help = "Refetch every asset instead of reusing earlier responses")]
    pub disable_cache: bool,

    #[arg(long, global = true, help = "Capture snapshots without uploading them")]
    pub skip_uploads: bool,

    #[arg(long, global = true, help = "Upload each snapshot once the next one is ready")]
    pub delay_uploads: bool,

    #[arg(long, global = true, help = "Upload every snapshot when the run ends")]
    pub defer_uploads: bool,

    #[arg(long, global = true, help = "Chrome executable path")]
    pub chrome_path: Option<String>,

    #[arg(long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Capture a single URL
    Snapshot {
        #[arg(short, long, help = "URL to snapshot")]
        url: String,

        #[arg(short, long, help = "Snapshot name (default: URL path)")]
        name: Option<String>,

        #[arg(short, long = "width", help = "Width to capture, may be repeated")]
        widths: Vec<u32>,

        #[arg(long, help = "Minimum viewport height")]
        min_height: Option<u32>,

        #[arg(long, help = "Use this serialized DOM instead of the live page")]
        dom_snapshot_file: Option<PathBuf>,
    },

    /// Capture every snapshot request in a JSON file
    Batch {
        #[arg(short, long, help = "JSON file containing an array of snapshot requests")]
        input: PathBuf,
    },

    /// Validate configuration
    Validate {
        #[arg(short, long, help = "Configuration file to validate")]
        config: PathBuf,
    },
}

impl Cli {
    /// Apply command-line overrides on top of a loaded configuration.
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if self.disable_cache {
            config.disable_cache = true;
        }
        if self.skip_uploads {
            config.skip_uploads = true;
        }
        if self.delay_uploads {
            config.delay_uploads = true;
        }
        if self.defer_uploads {
            config.defer_uploads = true;
        }
        if let Some(chrome_path) = &self.chrome_path {
            config.chrome_path = Some(chrome_path.clone());
        }
    }
}

pub struct CliRunner {
    pub config: Config,
    pub service: Arc<CaptureService>,
}

impl CliRunner {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let serializer: Arc<dyn DomSerializer> = match &config.dom_serializer_script {
            Some(path) => Arc::new(
                ScriptSerializer::from_file(path)
                    .await
                    .with_context(|| format!("reading DOM serializer {path}"))?,
            ),
            None => Arc::new(OuterHtmlSerializer),
        };
        let client = Arc::new(HttpUploadClient::new(&config)?);
        let service = CaptureService::launch(config.clone(), client, serializer).await?;

        Ok(Self { config, service })
    }

    pub async fn run(&self, command: Commands) -> anyhow::Result<()> {
        match command {
            Commands::Snapshot {
                url,
                name,
                widths,
                min_height,
                dom_snapshot_file,
            } => {
                let dom_snapshot = match dom_snapshot_file {
                    Some(path) => Some(read_dom_snapshot(&path).await?),
                    None => None,
                };
                let request = SnapshotRequest {
                    name,
                    widths,
                    min_height,
                    dom_snapshot,
                    ..SnapshotRequest::new(url)
                };
                self.run_snapshot(request).await
            }
            Commands::Batch { input } => self.run_batch(&input).await,
            Commands::Validate { config } => validate_config(&config).await,
        }
    }

    pub async fn run_snapshot(&self, request: SnapshotRequest) -> anyhow::Result<()> {
        info!("Taking snapshot of: {}", request.url);
        self.service.capture(request).await?;
        self.service.idle().await;
        Ok(())
    }

    pub async fn run_batch(&self, input: &Path) -> anyhow::Result<()> {
        let requests = read_requests(input).await?;
        info!("Loaded {} snapshot(s) from {}", requests.len(), input.display());

        let results = join_all(
            requests
                .into_iter()
                .map(|request| self.service.capture(request)),
        )
        .await;
        self.service.idle().await;

        // failures were already logged by the service
        let failed = results.iter().filter(|result| result.is_err()).count();
        info!(
            "Batch completed. Success: {}, Errors: {}",
            results.len() - failed,
            failed
        );
        if failed > 0 {
            warn!("{} snapshot(s) failed", failed);
        }
        Ok(())
    }
}

/// A DOM snapshot file holds either raw HTML or the serializer's JSON output.
async fn read_dom_snapshot(path: &Path) -> anyhow::Result<Value> {
    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;

    Ok(match serde_json::from_str::<Value>(&content) {
        Ok(value @ Value::Object(_)) => value,
        _ => Value::String(content),
    })
}

pub async fn read_requests(path: &Path) -> anyhow::Result<Vec<SnapshotRequest>> {
    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
}

pub async fn validate_config(config_path: &Path) -> anyhow::Result<()> {
    println!("Validating configuration: {}", config_path.display());

    let config_content = fs::read_to_string(config_path).await?;
    let config: Config = serde_json::from_str(&config_content)?;
    config.validate()?;

    println!("Configuration is valid:");
    println!("  Concurrency: {}", config.concurrency);
    println!("  Network idle timeout: {:?}", config.network_idle_timeout);
    println!("  Max resource size: {}", crate::format_bytes(config.max_resource_size));
    println!("  Default widths: {:?}", config.default_widths);
    println!("  Uploads: {:?}", config.upload_policy());
    println!("  Cache: {}", if config.disable_cache { "disabled" } else { "enabled" });

    Ok(())
}

pub fn setup_logging(verbose: bool) -> anyhow::Result<()> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    Ok(())
}
