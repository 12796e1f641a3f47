//! tailscale controller
//!
//! Runs a private `tailscaled` on its own control socket, then drives
//! `tailscale up --json` in the background. Login URLs reported by `up` are
//! forwarded to NetworkManager as an authentication prompt.

use super::backend::{ConnectionController, ConnectionResult, ControllerContext, StartRequest};
use super::common::{self, Settings, DUMMY_GATEWAY};
use crate::error::{PluginError, PluginResult};
use crate::net;
use crate::process::readiness::socket_exists;
use crate::process::{
    check_output_json, wait_until_ready, BackgroundProcess, Readiness, Redirect, SupervisedProcess,
    DEFAULT_GRACEFUL_EXIT_TIMEOUT,
};
use crate::session::notify::AuthPrompt;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const PROVIDER: &str = "tailscale";

pub const DEFAULT_SOCKPATH: &str = "/var/run/tailscale/tailscaled.sock";
const DEFAULT_UP_TIMEOUT_SECS: u64 = 90;
const SOCKET_CHECK_INTERVAL: Duration = Duration::from_millis(500);
const SOCKET_APPEAR_TIMEOUT: Duration = Duration::from_secs(60);
const STATUS_TIMEOUT: Duration = Duration::from_secs(10);
const TAILSCALE_MTU: u32 = 1280;
const QR_PREFIX: &str = "data:image/png;base64,";

/// Boolean `tailscale up` flags and the settings keys that feed them
const UP_FLAGS: &[(&str, &str)] = &[
    ("accept-dns", "is-accept-dns"),
    ("accept-routes", "is-accept-routes"),
    ("ssh", "is-ssh"),
    ("advertise-exit-node", "is-advertise-exit-node"),
    ("exit-node-allow-lan-access", "is-exit-node-allow-lan-access"),
    ("snat-subnet-routes", "is-snat-subnet-routes"),
];

/// Optional valued `tailscale up` flags
const UP_OPTIONS: &[(&str, &str)] = &[
    ("advertise-tags", "advertise-tags"),
    ("advertise-routes", "advertise-routes"),
    ("hostname", "hostname"),
    ("exit-node", "exit-node"),
];

/// One JSON document printed by `tailscale up --json`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct UpMessage {
    #[serde(rename = "AuthURL", default)]
    pub auth_url: Option<String>,
    #[serde(rename = "QR", default)]
    pub qr: Option<String>,
    #[serde(rename = "BackendState", default)]
    pub backend_state: Option<String>,
}

impl UpMessage {
    /// The QR code as bare base64 PNG data
    pub fn qr_png_base64(&self) -> Option<&str> {
        self.qr
            .as_deref()
            .map(|qr| qr.strip_prefix(QR_PREFIX).unwrap_or(qr))
            .filter(|qr| !qr.is_empty())
    }
}

/// Reassembles JSON documents that `tailscale up` pretty-prints across lines
#[derive(Debug, Default)]
pub struct UpStream {
    buffer: String,
}

impl UpStream {
    pub fn push_line(&mut self, line: &str) -> Option<UpMessage> {
        self.buffer.push_str(line);
        self.buffer.push('\n');
        match serde_json::from_str::<UpMessage>(&self.buffer) {
            Ok(message) => {
                self.buffer.clear();
                Some(message)
            }
            Err(e) if e.is_eof() => None,
            Err(e) => {
                warn!("(tailscale up) discarding unparsable output {:?}: {}", self.buffer, e);
                self.buffer.clear();
                None
            }
        }
    }

    /// Unparsed leftover output
    pub fn remainder(&self) -> &str {
        self.buffer.trim()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SelfStatus {
    #[serde(rename = "TailscaleIPs", default)]
    pub tailscale_ips: Vec<String>,
}

/// The part of `tailscale status --json` we look at
#[derive(Debug, Clone, Deserialize)]
pub struct TailscaleStatus {
    #[serde(rename = "BackendState")]
    pub backend_state: String,
    #[serde(rename = "Self")]
    pub self_status: Option<SelfStatus>,
}

pub fn auth_message(auth_url: &str) -> String {
    format!(
        "<b>To authenticate, visit: <i><a href=\"{url}\">{url}</a></i></b>",
        url = auth_url
    )
}

/// Control socket for this connection
pub fn socket_path(settings: &Settings, runtime_dir: &Path, uuid: &str) -> PathBuf {
    match settings.get("sockpath") {
        Some("default") => PathBuf::from(DEFAULT_SOCKPATH),
        Some(path) => PathBuf::from(path),
        None => runtime_dir.join(format!("tailscaled.{}.sock", uuid)),
    }
}

/// Build the `tailscaled` command line and the tun device it will create
pub fn tailscaled_command(
    settings: &Settings,
    sockpath: &Path,
    state_dir: Option<&Path>,
    connection_name: &str,
) -> PluginResult<(Vec<String>, String)> {
    let mut cmd = vec!["tailscaled".to_string(), "-socket".to_string(), sockpath.display().to_string()];
    if let Some(state_dir) = state_dir {
        cmd.extend(["-statedir".to_string(), state_dir.display().to_string()]);
    }
    if let Some(port) = settings.get("listening-port") {
        let port: u16 = port
            .parse()
            .map_err(|_| PluginError::InvalidSettings(format!("Invalid port value: '{}'", port)))?;
        cmd.extend(["-port".to_string(), port.to_string()]);
    }

    let dev = common::device_name(settings, "tun-device-name", connection_name)?;
    cmd.extend(["-tun".to_string(), dev.clone()]);

    if let Some(verbosity) = settings.get("log-verbosity") {
        cmd.extend(["-verbose".to_string(), verbosity.to_string()]);
    }
    cmd.extend(extra_args(settings, "tailscaled-args")?);
    Ok((cmd, dev))
}

fn extra_args(settings: &Settings, key: &str) -> PluginResult<Vec<String>> {
    match settings.get(key) {
        Some(args) => shlex::split(args)
            .ok_or_else(|| PluginError::InvalidSettings(format!("Could not split '{}': {:?}", key, args))),
        None => Ok(Vec::new()),
    }
}

fn cli_base(sockpath: &Path) -> Vec<String> {
    vec!["tailscale".to_string(), format!("--socket={}", sockpath.display())]
}

pub fn up_timeout(settings: &Settings) -> PluginResult<Duration> {
    let secs = settings.parse::<u64>("tailscale-up-timeout")?.unwrap_or(DEFAULT_UP_TIMEOUT_SECS);
    Ok(Duration::from_secs(secs))
}

/// Build the `tailscale up` command line
pub fn up_command(settings: &Settings, sockpath: &Path) -> PluginResult<Vec<String>> {
    let mut cmd = cli_base(sockpath);
    cmd.extend(["up".to_string(), "--reset".to_string(), "--json".to_string()]);
    cmd.push(format!("--timeout={}s", up_timeout(settings)?.as_secs()));
    for (flag, key) in UP_FLAGS {
        cmd.push(format!("--{}={}", flag, settings.get_or(key, "false")));
    }
    for (flag, key) in UP_OPTIONS {
        if let Some(value) = settings.get(key) {
            cmd.push(format!("--{}={}", flag, value));
        }
    }
    cmd.extend(extra_args(settings, "tailscale-up-args")?);
    Ok(cmd)
}

#[derive(Default)]
pub struct TailscaleController {
    tailscaled: Option<SupervisedProcess>,
    up: Option<BackgroundProcess>,
    sockpath: Option<PathBuf>,
    graceful_exit_timeout: Option<Duration>,
}

pub fn create_controller() -> Box<dyn ConnectionController> {
    Box::new(TailscaleController::default())
}

impl TailscaleController {
    fn ensure_not_running(&mut self) -> PluginResult<()> {
        if let Some(tailscaled) = self.tailscaled.as_mut() {
            if tailscaled.is_running() {
                return Err(PluginError::AlreadyRunning("tailscaled".to_string()));
            }
        }
        if self.up.is_some() {
            return Err(PluginError::AlreadyRunning("tailscale up".to_string()));
        }
        Ok(())
    }

    async fn call_up(&mut self, settings: &Settings, sockpath: &Path, ctx: &ControllerContext) -> PluginResult<()> {
        let cmd = up_command(settings, sockpath)?;
        let timeout = up_timeout(settings)? + Duration::from_secs(1);
        info!("Calling tailscale up: {:?}", cmd);

        let up = self.up.insert(
            BackgroundProcess::spawn(&cmd, "tailscale up", Some(timeout), ctx.graceful_exit_timeout).await?,
        );
        let mut stream = UpStream::default();
        while let Some(line) = up.next_line().await? {
            let Some(message) = stream.push_line(&line) else {
                continue;
            };
            info!("(tailscale up) parsed> {:?}", message);
            if let Some(auth_url) = message.auth_url.as_deref() {
                debug!("Found auth url: {}", auth_url);
                let mut prompt = AuthPrompt::web_link(auth_message(auth_url));
                if let Some(qr) = message.qr_png_base64() {
                    prompt = prompt.with_qr_image(qr);
                }
                ctx.prompter.prompt(&prompt).await;
            }
            if message.backend_state.as_deref() == Some("Running") {
                info!("tailscale is already up and running");
            }
        }

        let exit = match self.up.take() {
            Some(up) => up.wait().await?,
            None => return Err(PluginError::InvalidState("tailscale up handle vanished".to_string())),
        };
        if !stream.remainder().is_empty() {
            warn!("(tailscale up) stdout> {}", stream.remainder());
        }
        match exit.code {
            Some(0) => info!("tailscale up exited with code: 0"),
            Some(code) if !exit.gracefully_killed => {
                error!("tailscale up exited with code: {}", code);
                return Err(PluginError::Provider(format!("tailscale up exited with code {}", code)));
            }
            code => warn!("tailscale up stopped (code: {:?})", code),
        }
        Ok(())
    }
}

#[async_trait]
impl ConnectionController for TailscaleController {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    async fn start(&mut self, request: &StartRequest, ctx: &ControllerContext) -> PluginResult<ConnectionResult> {
        self.ensure_not_running()?;
        self.graceful_exit_timeout = Some(ctx.graceful_exit_timeout);

        let settings = &request.settings;
        let sockpath = socket_path(settings, &ctx.runtime_dir, &request.uuid);
        if socket_exists(&sockpath).await {
            return Err(PluginError::Provider(format!(
                "tailscale socket is already present: {}",
                sockpath.display()
            )));
        }
        if let Some(parent) = sockpath.parent() {
            common::ensure_directory_exists(parent).await?;
        }
        self.sockpath = Some(sockpath.clone());

        let state_dir = ctx.state_base_dir.join(&request.uuid);
        let (cmd, dev) = tailscaled_command(settings, &sockpath, Some(&state_dir), &request.name)?;
        info!("Exec: {:?}", cmd);
        let tailscaled = self.tailscaled.insert(SupervisedProcess::spawn(
            &cmd,
            Some("tailscaled"),
            Redirect::Inherit,
            common::stderr_target(settings),
        )?);

        info!("Waiting for tailscaled to be up and running");
        let sock: &Path = &sockpath;
        wait_until_ready(
            || socket_exists(sock),
            Some(tailscaled),
            SOCKET_CHECK_INTERVAL,
            Some(SOCKET_APPEAR_TIMEOUT),
            &format!("Wait for socket: {}", sockpath.display()),
        )
        .await?;

        self.call_up(settings, &sockpath, ctx).await?;

        let mut status_cmd = cli_base(&sockpath);
        status_cmd.extend(["status".to_string(), "--json".to_string()]);
        let status: TailscaleStatus = check_output_json(&status_cmd, Some(STATUS_TIMEOUT)).await?;
        info!("tailscale status: {:?}", status);
        if status.backend_state != "Running" {
            return Err(PluginError::Provider(format!(
                "Could not up tailscale (state: {})",
                status.backend_state
            )));
        }

        let ips = status.self_status.map(|s| s.tailscale_ips).unwrap_or_default();
        let (ipv4, ipv6) = net::addresses_by_family(&ips)?;
        Ok(ConnectionResult::new(DUMMY_GATEWAY)
            .with_device(dev)
            .with_addresses(ipv4, ipv6)
            .with_mtu(Some(TAILSCALE_MTU)))
    }

    async fn stop(&mut self) -> PluginResult<()> {
        let timeout = self.graceful_exit_timeout.unwrap_or(DEFAULT_GRACEFUL_EXIT_TIMEOUT);
        if let Some(up) = self.up.take() {
            if let Err(e) = up.close().await {
                warn!("Could not stop tailscale up: {}", e);
            }
        }
        common::stop_process(&mut self.tailscaled, timeout).await
    }

    fn readiness(&self) -> Option<Readiness> {
        self.sockpath.clone().map(Readiness::Socket)
    }
}
