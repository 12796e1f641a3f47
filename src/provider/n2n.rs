//! n2n edge controller
//!
//! Runs `edge` in the foreground and waits for its TAP device.

use super::backend::{ConnectionController, ConnectionResult, ControllerContext, StartRequest};
use super::common::{self, Settings, DUMMY_GATEWAY};
use crate::error::PluginResult;
use crate::interface;
use crate::process::{Readiness, Redirect, SupervisedProcess, DEFAULT_GRACEFUL_EXIT_TIMEOUT};
use async_trait::async_trait;
use std::time::Duration;
use tracing::info;

pub const PROVIDER: &str = "n2n";

#[derive(Default)]
pub struct N2nController {
    edge: Option<SupervisedProcess>,
    dev: Option<String>,
    graceful_exit_timeout: Option<Duration>,
}

pub fn create_controller() -> Box<dyn ConnectionController> {
    Box::new(N2nController::default())
}

/// Build the `edge` command line and the device it will create
pub fn edge_command(settings: &Settings, connection_name: &str) -> PluginResult<(Vec<String>, String)> {
    let mut cmd = vec![settings.get_or("edge-bin", "edge").to_string(), "-f".to_string()];
    cmd.extend(["-c".to_string(), settings.require("community")?.to_string()]);
    cmd.extend(["-k".to_string(), settings.require("encryption-key")?.to_string()]);
    if let Some(password) = settings.get("password") {
        cmd.extend(["-J".to_string(), password.to_string()]);
    }

    let dev = common::device_name(settings, "dev", connection_name)?;
    cmd.extend(["-d".to_string(), dev.clone()]);

    for supernode in settings.split("supernodes", &[',']) {
        cmd.extend(["-l".to_string(), supernode.to_string()]);
    }
    if let Some(static_ip) = settings.get("static-ip") {
        cmd.extend(["-a".to_string(), static_ip.to_string()]);
    }
    if settings.flag("force-relay-via-supernode") {
        cmd.push("-S1".to_string());
    }
    let verbosity = settings.parse::<u8>("verbose")?.unwrap_or(0);
    cmd.extend((0..verbosity).map(|_| "-v".to_string()));

    Ok((cmd, dev))
}

#[async_trait]
impl ConnectionController for N2nController {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    async fn start(&mut self, request: &StartRequest, ctx: &ControllerContext) -> PluginResult<ConnectionResult> {
        let (cmd, dev) = edge_command(&request.settings, &request.name)?;
        self.graceful_exit_timeout = Some(ctx.graceful_exit_timeout);
        self.dev = Some(dev.clone());

        info!("Run n2n edge {:?}", cmd);
        let edge = self.edge.insert(SupervisedProcess::spawn(
            &cmd,
            Some("n2n-edge"),
            Redirect::Inherit,
            common::stderr_target(&request.settings),
        )?);
        common::wait_for_interface(edge, &dev).await?;

        let (ipv4, ipv6) = interface::primary_addresses(&dev).await?;
        Ok(ConnectionResult::new(DUMMY_GATEWAY)
            .with_device(dev)
            .with_addresses(ipv4, ipv6))
    }

    async fn stop(&mut self) -> PluginResult<()> {
        let timeout = self.graceful_exit_timeout.unwrap_or(DEFAULT_GRACEFUL_EXIT_TIMEOUT);
        common::stop_process(&mut self.edge, timeout).await
    }

    fn readiness(&self) -> Option<Readiness> {
        self.dev.clone().map(Readiness::Interface)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PluginError;
    use crate::provider::common::settings;

    #[test]
    fn test_full_command_line() {
        let s = settings(&[
            ("community", "home"),
            ("encryption-key", "s3cret"),
            ("password", "pw"),
            ("dev", "edge0"),
            ("supernodes", "sn1.example:7777,sn2.example:7777"),
            ("static-ip", "10.9.0.2/24"),
            ("force-relay-via-supernode", "true"),
            ("verbose", "2"),
        ]);
        let (cmd, dev) = edge_command(&s, "ignored").unwrap();
        assert_eq!(dev, "edge0");
        assert_eq!(
            cmd,
            [
                "edge", "-f", "-c", "home", "-k", "s3cret", "-J", "pw", "-d", "edge0", "-l", "sn1.example:7777",
                "-l", "sn2.example:7777", "-a", "10.9.0.2/24", "-S1", "-v", "-v"
            ]
        );
    }

    #[test]
    fn test_minimal_command_line() {
        let s = settings(&[("community", "c"), ("encryption-key", "k"), ("edge-bin", "/opt/n2n/edge")]);
        let (cmd, dev) = edge_command(&s, "Office Net").unwrap();
        assert_eq!(dev, "OfficeNet");
        assert_eq!(cmd, ["/opt/n2n/edge", "-f", "-c", "c", "-k", "k", "-d", "OfficeNet"]);
    }

    #[test]
    fn test_missing_required_keys() {
        assert!(matches!(
            edge_command(&settings(&[("community", "c")]), "x"),
            Err(PluginError::InvalidSettings(msg)) if msg.contains("encryption-key")
        ));
        assert!(edge_command(&settings(&[("community", "c"), ("encryption-key", "k"), ("verbose", "lots")]), "x").is_err());
    }

    #[tokio::test]
    async fn test_stop_without_start() {
        let mut controller = N2nController::default();
        controller.stop().await.unwrap();
        assert!(controller.readiness().is_none());
    }
}
