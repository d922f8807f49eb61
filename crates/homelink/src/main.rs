use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use homelink::bridge::find_config_pin;
use homelink::bridge::HapBridge;
use homelink::config::Config;
use homelink::platform::Automation;
use homelink::platform::PlatformOptions;
use homelink::sandbox;
use homelink::sandbox::ProcessLauncher;
use homelink::upstream::ClientOptions;
use homelink::upstream::WsConnector;
use homelink::LogLevel;
use homelink::Platform;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Parser)]
#[command(version, about = "Bridges local HomeKit accessories to a remote control service")]
struct Args {
    /// Config file, may be given more than once
    #[arg(short, long = "config", default_value = "homelink.toml")]
    configs: Vec<PathBuf>,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        anyhow::bail!("a rustls crypto provider was already installed");
    }

    let config = Config::from_files(&args.configs)?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(config.logging.targets(args.log_level))
        .init();

    tracing::info!("homelink {} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!("Loaded config from: {:?}", args.configs);

    let pin = match config.bridge.pin.clone() {
        Some(pin) => pin,
        None => {
            let cwd = std::env::current_dir().context("Failed to read current directory")?;
            find_config_pin(&cwd)
                .context("No bridge.pin configured and no Homebridge config.json found")?
        }
    };
    let bridge = HapBridge::new(
        config.bridge.instances.clone(),
        pin,
        config.bridge.poll_interval(),
    )?;

    let automation = match &config.automation {
        Some(automation) => match sandbox::load_script(&automation.script) {
            Ok(source) => {
                tracing::info!("Running automation script {}", automation.script.display());
                Some(Automation {
                    source,
                    launcher: Arc::new(ProcessLauncher::new(
                        automation.command.clone(),
                        automation.memory_limit_mb,
                    )),
                    options: automation.sandbox_options(),
                })
            }
            Err(e) => {
                tracing::error!("Automations disabled: {}", e);
                None
            }
        },
        None => None,
    };

    let platform = Platform::launched(
        PlatformOptions {
            client: ClientOptions {
                url: config.upstream.url.clone(),
                api_key: config.upstream.api_key.clone(),
                development: config.upstream.development,
            },
            settle_delay: config.upstream.settle_delay(),
        },
        Arc::new(bridge),
        Arc::new(WsConnector),
        automation,
    );

    let api = config.api.as_ref().map(|api| {
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        let server = tokio::spawn(homelink::api::serve(
            api.listen.clone(),
            api.port,
            platform.status_source(),
            shutdown_rx,
        ));
        (shutdown_tx, server)
    });

    tracing::info!("Press Ctrl+C to exit");

    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received shutdown signal");
        }
        Err(e) => {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
        }
    }

    if let Some((shutdown_tx, server)) = api {
        let _ = shutdown_tx.send(());
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("HTTP API server failed: {}", e),
            Err(e) => tracing::error!("HTTP API task failed: {}", e),
        }
    }

    platform.shutdown().await;
    tracing::info!("homelink shutdown complete");

    Ok(())
}
