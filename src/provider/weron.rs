//! weron controller (WebRTC based overlay)

use super::backend::{ConnectionController, ConnectionResult, ControllerContext, StartRequest};
use super::common::{self, Settings, DUMMY_GATEWAY};
use crate::error::PluginResult;
use crate::interface;
use crate::process::{Readiness, Redirect, SupervisedProcess, DEFAULT_GRACEFUL_EXIT_TIMEOUT};
use async_trait::async_trait;
use std::time::Duration;
use tracing::info;

pub const PROVIDER: &str = "weron";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeronMode {
    /// Layer 3, `weron vpn ip`
    Ip,
    /// Layer 2, `weron vpn ethernet`
    Ethernet,
}

impl WeronMode {
    fn from_settings(settings: &Settings) -> Self {
        if settings.get_or("mode", "").to_ascii_uppercase().contains("ETHERNET") {
            WeronMode::Ethernet
        } else {
            WeronMode::Ip
        }
    }

    fn as_arg(self) -> &'static str {
        match self {
            WeronMode::Ip => "ip",
            WeronMode::Ethernet => "ethernet",
        }
    }
}

#[derive(Default)]
pub struct WeronController {
    process: Option<SupervisedProcess>,
    dev: Option<String>,
    graceful_exit_timeout: Option<Duration>,
}

pub fn create_controller() -> Box<dyn ConnectionController> {
    Box::new(WeronController::default())
}

pub fn weron_command(settings: &Settings, connection_name: &str) -> PluginResult<(Vec<String>, String)> {
    let mode = WeronMode::from_settings(settings);
    let mut cmd: Vec<String> = vec![
        settings.get_or("weron-bin", "weron").to_string(),
        "vpn".to_string(),
        mode.as_arg().to_string(),
    ];
    for key in ["community", "password", "key"] {
        cmd.push(format!("--{}", key));
        cmd.push(settings.require(key)?.to_string());
    }

    let dev = common::device_name(settings, "dev", connection_name)?;
    cmd.extend(["--dev".to_string(), dev.clone()]);

    if mode == WeronMode::Ip {
        cmd.extend(["--ips".to_string(), settings.require("ips")?.to_string()]);
        if settings.flag("static") {
            cmd.push("--static".to_string());
        }
    }
    if let Some(raddr) = settings.get("raddr") {
        cmd.extend(["--raddr".to_string(), raddr.to_string()]);
    }
    if settings.flag("force-relay") {
        cmd.push("--force-relay".to_string());
    }
    if let Some(ice) = settings.get("ice") {
        cmd.extend(["--ice".to_string(), ice.to_string()]);
    }
    if let Some(verbose) = settings.get("verbose") {
        cmd.extend(["--verbose".to_string(), verbose.to_string()]);
    }
    Ok((cmd, dev))
}

#[async_trait]
impl ConnectionController for WeronController {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    async fn start(&mut self, request: &StartRequest, ctx: &ControllerContext) -> PluginResult<ConnectionResult> {
        let (cmd, dev) = weron_command(&request.settings, &request.name)?;
        self.graceful_exit_timeout = Some(ctx.graceful_exit_timeout);
        self.dev = Some(dev.clone());

        info!("Run weron: {:?}", cmd);
        let process = self.process.insert(SupervisedProcess::spawn(
            &cmd,
            Some("weron"),
            Redirect::Inherit,
            common::stderr_target(&request.settings),
        )?);
        common::wait_for_interface(process, &dev).await?;

        let (ipv4, ipv6) = interface::primary_addresses(&dev).await?;
        Ok(ConnectionResult::new(DUMMY_GATEWAY)
            .with_device(dev)
            .with_addresses(ipv4, ipv6))
    }

    async fn stop(&mut self) -> PluginResult<()> {
        let timeout = self.graceful_exit_timeout.unwrap_or(DEFAULT_GRACEFUL_EXIT_TIMEOUT);
        common::stop_process(&mut self.process, timeout).await
    }

    fn readiness(&self) -> Option<Readiness> {
        self.dev.clone().map(Readiness::Interface)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::common::settings;

    fn base() -> Vec<(&'static str, &'static str)> {
        vec![("community", "lan"), ("password", "pw"), ("key", "k3y"), ("dev", "weron0")]
    }

    #[test]
    fn test_ip_mode() {
        let mut pairs = base();
        pairs.extend([("ips", "10.10.0.2/24"), ("static", "true"), ("raddr", "wss://signal.example"), ("verbose", "5")]);
        let (cmd, dev) = weron_command(&settings(&pairs), "x").unwrap();
        assert_eq!(dev, "weron0");
        assert_eq!(
            cmd,
            [
                "weron", "vpn", "ip", "--community", "lan", "--password", "pw", "--key", "k3y", "--dev", "weron0",
                "--ips", "10.10.0.2/24", "--static", "--raddr", "wss://signal.example", "--verbose", "5"
            ]
        );
    }

    #[test]
    fn test_ethernet_mode_skips_ips() {
        let mut pairs = base();
        pairs.extend([("mode", "Ethernet (L2)"), ("force-relay", "true"), ("ice", "stun:stun.example:3478")]);
        let (cmd, _) = weron_command(&settings(&pairs), "x").unwrap();
        assert_eq!(&cmd[..3], ["weron", "vpn", "ethernet"]);
        assert!(!cmd.contains(&"--ips".to_string()));
        assert!(cmd.contains(&"--force-relay".to_string()));
        assert_eq!(cmd.last().map(String::as_str), Some("stun:stun.example:3478"));
    }

    #[test]
    fn test_ip_mode_requires_ips() {
        assert!(weron_command(&settings(&base()), "x").is_err());
    }
}
