//! Sentinel DNS firewall - Entry point.
//!
//! Brings up a TUN interface that captures the device's DNS traffic, then
//! filters it according to the configured rules. Commands (`start`, `stop`,
//! `app <package> on|off`, `domain <name> on|off`, `ip <address> on|off`) are
//! read from stdin, one per line; engine events are written to stdout as JSON
//! lines. Logs go to stderr.

use anyhow::Result;
use tracing_subscriber::EnvFilter;

#[cfg(target_os = "linux")]
async fn run() -> Result<()> {
    use std::borrow::Cow;
    use std::time::Duration;

    use anyhow::Context;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tracing::{info, warn};

    use sentinel::config::Config;
    use sentinel::host::LinuxHost;
    use sentinel::{Command, Engine};

    let config_path = std::env::var("CONFIG_PATH")
        .map(Cow::Owned)
        .unwrap_or(Cow::Borrowed("config.toml"));
    let config = if std::path::Path::new(config_path.as_ref()).exists() {
        Config::load(config_path.as_ref()).context("Failed to load configuration")?
    } else {
        info!("No configuration at {config_path}, using defaults");
        Config::default()
    };

    // Initialize metrics (must be done early, before any metrics are recorded)
    sentinel::metrics::init(&config.metrics).context("Failed to initialize metrics")?;
    if config.metrics.enabled {
        info!("Metrics enabled on {}", config.metrics.listen);
    }

    info!("Starting Sentinel on {}...", config.tunnel.name);
    info!("Intercepting resolvers: {:?}", config.tunnel.dns_servers);
    info!("Fallback upstreams: {:?}", config.upstream.fallback);
    info!(
        apps = config.policy.blocked_apps.len(),
        domains = config.policy.blocked_domains.len(),
        addresses = config.policy.blocked_addresses.len(),
        "initial rules loaded"
    );

    let host = LinuxHost::new(config.tunnel.name.clone());
    let (engine, mut events) = Engine::new(config, host);

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(err) => warn!("Failed to encode event: {err}"),
            }
        }
    });

    engine.start().await.context("Failed to start engine")?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, shutting down...");
                break;
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => match line.parse::<Command>() {
                    Ok(command) => {
                        if let Err(err) = engine.handle(command).await {
                            warn!("Command {line:?} failed: {err}");
                        }
                    }
                    Err(err) => warn!("Ignoring {line:?}: {err}"),
                },
                Ok(None) => stdin_open = false,
                Err(err) => {
                    warn!("Failed to read commands: {err}");
                    stdin_open = false;
                }
            },
        }
    }

    engine.stop();
    drop(engine);
    let _ = tokio::time::timeout(Duration::from_secs(1), printer).await;

    info!("Shutdown complete.");
    Ok(())
}

#[cfg(not(target_os = "linux"))]
async fn run() -> Result<()> {
    anyhow::bail!("no host platform available for this operating system")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    run().await
}
