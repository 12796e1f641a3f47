//! NetworkManager VPN plugin service (nm-vpn-service)
//!
//! Started by NetworkManager (via D-Bus activation) for one VPN provider.
//! It exports `org.freedesktop.NetworkManager.VPN.Plugin`, runs the
//! provider's daemon for the requested connection and exits after
//! `Disconnect`, SIGTERM or SIGINT.
//!
//! # Usage
//!
//! ```bash
//! nm-vpn-service --provider tailscale
//!
//! # Debug logging on the session bus
//! NM_VPN_DEV_MODE=1 nm-vpn-service --provider n2n --session-bus
//! ```

use anyhow::{bail, Context, Result};
use clap::Parser;
use libnmvpn::config::{CliArgs, ServiceConfig};
use libnmvpn::logging::{self, LogSettings};
use libnmvpn::{PluginService, ProviderRegistry};
use tracing::{debug, error, info, info_span, Instrument};

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let registry = ProviderRegistry::with_builtin();
    if !registry.contains(&args.provider) {
        bail!(
            "Unknown provider '{}' (available: {})",
            args.provider,
            registry.available().join(", ")
        );
    }

    logging::init_logging(&args.provider, &LogSettings::from_env());
    if let Err(e) = logging::set_process_name(&format!("NM:{}", args.provider)) {
        debug!("Could not set process name: {}", e);
    }

    let span = info_span!("provider", name = %args.provider);
    run(args, registry).instrument(span).await
}

async fn run(args: CliArgs, registry: ProviderRegistry) -> Result<()> {
    info!("Starting VPN plugin service, version {}", env!("CARGO_PKG_VERSION"));
    if !args.extra.is_empty() {
        debug!("Ignoring extra arguments: {:?}", args.extra);
    }

    let config = ServiceConfig::from_args(&args).context("Invalid service configuration")?;
    debug!("Service configuration: {:?}", config);

    let service = PluginService::start(config.clone(), &registry)
        .await
        .with_context(|| format!("Failed to start D-Bus service {}", config.bus_name))?;
    info!("VPN plugin service is ready on {}", config.bus_name);

    if let Err(e) = wait_for_shutdown(&service).await {
        error!("Signal handler error: {}", e);
    }

    service.shutdown().await?;
    info!("VPN plugin service stopped");
    Ok(())
}

/// Block until Disconnect was handled or SIGTERM/SIGINT arrives
async fn wait_for_shutdown(service: &PluginService) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = service.quit_requested() => {
            info!("Disconnected, exiting");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT, initiating graceful shutdown");
        }
    }
    Ok(())
}
