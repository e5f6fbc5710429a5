use anyhow::Context;
use clap::Parser;
use snapshot_capture::{setup_logging, validate_config, Cli, CliRunner, Commands, Config};
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let args = Cli::parse();

    // Setup logging
    setup_logging(args.verbose)?;

    info!("Starting snapshot-capture v{}", env!("CARGO_PKG_VERSION"));

    if let Commands::Validate { config } = &args.command {
        return validate_config(config).await;
    }

    // Load configuration
    let config = load_config(&args).await?;

    // Launch the browser and capture service
    let cli_runner = CliRunner::new(config).await?;

    // Setup graceful shutdown
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::broadcast::channel(1);
    let _shutdown_handler = setup_shutdown_handler(shutdown_tx);

    let result = tokio::select! {
        result = cli_runner.run(args.command) => {
            info!("Application completed");
            result
        }
        _ = shutdown_rx.recv() => {
            info!("Received shutdown signal");
            Ok(())
        }
    };

    // Drain uploads and finalize the build
    info!("Shutting down...");
    match cli_runner.service.stop(true).await {
        Ok(Some(build)) => info!("Build #{} finalized: {}", build.number, build.url),
        Ok(None) => {}
        Err(e) => error!("Failed to finalize build: {}", e),
    }

    if let Err(e) = result {
        error!("Application error: {:#}", e);
        std::process::exit(1);
    }

    info!("snapshot-capture stopped");
    Ok(())
}

async fn load_config(args: &Cli) -> anyhow::Result<Config> {
    let mut config = if let Some(config_path) = &args.config {
        // Load from file
        let config_content = tokio::fs::read_to_string(config_path)
            .await
            .with_context(|| format!("reading {}", config_path.display()))?;
        serde_json::from_str(&config_content)
            .with_context(|| format!("parsing {}", config_path.display()))?
    } else {
        // Use default configuration
        Config::default()
    };

    // Override with CLI arguments
    args.apply_overrides(&mut config);
    config.validate()?;

    info!("Configuration loaded successfully");
    info!("Concurrency: {}", config.concurrency);
    info!("Uploads: {:?}", config.upload_policy());

    Ok(config)
}

fn setup_shutdown_handler(
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let (mut sigint, mut sigterm) = match (
            signal::unix::signal(signal::unix::SignalKind::interrupt()),
            signal::unix::signal(signal::unix::SignalKind::terminate()),
        ) {
            (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to install signal handlers: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
        }

        let _ = shutdown_tx.send(());
    })
}
