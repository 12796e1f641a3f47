//! tinc controller
//!
//! Generates a throwaway tinc configuration directory per connection
//! (`tinc.conf`, `hosts/*`, `tinc-up`) and runs `tincd` in the foreground.

use super::backend::{ConnectionController, ConnectionResult, ControllerContext, StartRequest};
use super::common::{self, Settings, DUMMY_GATEWAY};
use crate::error::{PluginError, PluginResult};
use crate::interface;
use crate::net::IpInterface;
use crate::process::{Readiness, Redirect, SupervisedProcess, DEFAULT_GRACEFUL_EXIT_TIMEOUT};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

pub const PROVIDER: &str = "tinc";

const DEFAULT_LISTEN_PORT: &str = "655";
const EDIT_PLACEHOLDER: &str = "<edit>";
const HOST_FILE_PERMISSIONS: u32 = 0o644;
const TINC_UP_PERMISSIONS: u32 = 0o755;

/// Ordered `Key = Value` entries of a tinc config file.
///
/// A key may repeat (`Subnet`); keys keep their first-insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TincConfig {
    entries: Vec<(String, Vec<String>)>,
}

impl TincConfig {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&mut self, key: &str) -> &mut Vec<String> {
        let index = match self.entries.iter().position(|(k, _)| k == key) {
            Some(index) => index,
            None => {
                self.entries.push((key.to_string(), Vec::new()));
                self.entries.len() - 1
            }
        };
        &mut self.entries[index].1
    }

    /// Replace every value of `key`
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        *self.slot(key) = vec![value.into()];
    }

    /// Add a value to `key` unless it is already present
    pub fn add(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        let values = self.slot(key);
        if !values.contains(&value) {
            values.push(value);
        }
    }

    /// Overlay `other`: its keys replace ours wholesale
    pub fn merge(&mut self, other: TincConfig) {
        for (key, values) in other.entries {
            *self.slot(&key) = values;
        }
    }

    pub fn get(&self, key: &str) -> &[String] {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn render(&self) -> String {
        let mut content = String::new();
        for (key, values) in &self.entries {
            for value in values {
                content.push_str(&format!("{} = {}\n", key, value));
            }
        }
        content
    }
}

/// One `hosts/<name>` file for a remote node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub name: String,
    pub entries: TincConfig,
    pub public_key: String,
}

impl PeerConfig {
    pub fn subnets(&self) -> &[String] {
        self.entries.get("Subnet")
    }

    pub fn render(&self) -> String {
        format!("{}\n{}", self.entries.render(), self.public_key)
    }
}

fn split_key_value(kv: &str) -> Option<(&str, &str)> {
    let (key, value) = kv.split_once('=')?;
    if value.contains('=') {
        return None;
    }
    Some((key.trim(), value.trim()))
}

/// tinc node names are `[A-Za-z0-9_]+`; they also become `hosts/` file names
fn is_valid_node_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn armour_public_key(words: &[&str]) -> String {
    let text = words.join(" ").replace("\\n", "\n");
    if text.contains("-----BEGIN") {
        return text.trim().to_string();
    }
    let body: Vec<&str> = text.split_whitespace().collect();
    format!(
        "-----BEGIN RSA PUBLIC KEY-----\n{}\n-----END RSA PUBLIC KEY-----",
        body.join("\n")
    )
}

/// Tokenize one peer line:
/// `name address subnet,subnet [key=value,...] public key words...`
pub fn parse_peer(line: &str) -> PluginResult<Option<PeerConfig>> {
    let invalid = |why: String| PluginError::InvalidSettings(format!("Could not parse peer config {:?}: {}", line, why));
    let mut words = line
        .split(' ')
        .map(str::trim)
        .filter(|w| !w.is_empty() && *w != EDIT_PLACEHOLDER);

    let Some(name) = words.next() else {
        return Ok(None);
    };
    if !is_valid_node_name(name) {
        return Err(invalid(format!("Invalid peer name: {}", name)));
    }

    let mut entries = TincConfig::new();
    let address = words.next().ok_or_else(|| invalid("missing address".into()))?;
    entries.set("Address", address.replace(':', " "));
    let subnets = words.next().ok_or_else(|| invalid("missing subnets".into()))?;
    for subnet in subnets.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        entries.add("Subnet", subnet);
    }

    let mut rest: Vec<&str> = words.collect();
    if let Some(first) = rest.first() {
        let pairs: Option<Vec<(&str, &str)>> = first
            .split(',')
            .map(|kv| split_key_value(kv).filter(|(k, v)| !k.is_empty() && !v.is_empty()))
            .collect();
        if let Some(pairs) = pairs {
            for (key, value) in pairs {
                entries.add(key, value);
            }
            rest.remove(0);
        }
    }
    if rest.is_empty() {
        return Err(invalid("missing public key".into()));
    }

    Ok(Some(PeerConfig {
        name: name.to_string(),
        entries,
        public_key: armour_public_key(&rest),
    }))
}

/// Parse the `peers` setting, a JSON list of peer lines
pub fn parse_peers(settings: &Settings) -> PluginResult<Vec<PeerConfig>> {
    let mut peers: Vec<PeerConfig> = Vec::new();
    for line in settings.json_list("peers")?.unwrap_or_default() {
        if let Some(peer) = parse_peer(&line)? {
            peers.retain(|p| p.name != peer.name);
            peers.push(peer);
        }
    }
    Ok(peers)
}

/// Parse a JSON list of `Key=Value` strings
pub fn parse_config_entries(settings: &Settings, key: &str) -> PluginResult<TincConfig> {
    let mut config = TincConfig::new();
    for kv in settings.json_list(key)?.unwrap_or_default() {
        if kv.trim().is_empty() || kv == EDIT_PLACEHOLDER {
            continue;
        }
        let (k, v) = split_key_value(&kv)
            .ok_or_else(|| PluginError::InvalidSettings(format!("Invalid config entry in '{}': {:?}", key, kv)))?;
        if !k.is_empty() && !v.is_empty() {
            config.add(k, v);
        }
    }
    Ok(config)
}

/// Local hostname reduced to characters tinc accepts in node names
pub fn default_node_name() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: buf is valid for buf.len() bytes
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    let len = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    let host = if rc == 0 { String::from_utf8_lossy(&buf[..len]).into_owned() } else { String::new() };
    let name: String = host
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if name.is_empty() {
        "localhost".to_string()
    } else {
        name
    }
}

/// Everything written into the config directory before `tincd` starts
#[derive(Debug, Clone)]
pub struct TincLayout {
    pub node_name: String,
    pub dev: String,
    pub debug_level: u32,
    pub server: TincConfig,
    pub host: TincConfig,
    pub tinc_up: String,
    pub peers: Vec<PeerConfig>,
}

impl TincLayout {
    pub fn from_settings(settings: &Settings, connection_name: &str) -> PluginResult<Self> {
        let node_name = match settings.get("node-name") {
            Some(name) if is_valid_node_name(name) => name.to_string(),
            Some(name) => {
                return Err(PluginError::InvalidSettings(format!("Invalid node-name: {}", name)));
            }
            None => default_node_name(),
        };
        let debug_level = settings.parse::<u32>("debug-level")?.unwrap_or(1);
        let device_type = if settings.get_or("net-mode", "").to_ascii_uppercase().contains("ETHERNET") {
            "tap"
        } else {
            "tun"
        };
        let dev = common::device_name(settings, "dev", connection_name)?;
        let listen_port = settings.get_or("listen-port", DEFAULT_LISTEN_PORT);

        let mut server = TincConfig::new();
        server.set("Name", node_name.as_str());
        server.set("DeviceType", device_type);
        server.set("Interface", dev.as_str());
        server.set("AddressFamily", "any");
        server.set("BindToAddress", format!("* {}", listen_port));
        server.set("PrivateKeyFile", settings.require("rsa-private-key")?);
        server.merge(parse_config_entries(settings, "additional-server-conf")?);

        let cidrs = settings
            .split("cidrs", &[',', ' '])
            .into_iter()
            .map(str::parse::<IpInterface>)
            .collect::<PluginResult<Vec<_>>>()?;
        if cidrs.is_empty() {
            return Err(PluginError::InvalidSettings("Missing required setting 'cidrs'".into()));
        }

        let mut external_address = settings.require("external-address")?.to_string();
        if !external_address.contains(':') {
            external_address = format!("{}:{}", external_address, listen_port);
        }
        let mut host = TincConfig::new();
        host.set("Address", external_address.replace(':', " "));
        for cidr in &cidrs {
            host.add("Subnet", cidr.network().to_string());
        }
        host.merge(parse_config_entries(settings, "additional-host-conf")?);

        let mut tinc_up = String::from("#!/bin/sh\nset -ex\n");
        for cidr in cidrs.iter().filter(|c| c.is_host_address()) {
            tinc_up.push_str(&format!("ip addr add {} dev $INTERFACE\n", cidr));
        }

        Ok(Self {
            node_name,
            dev,
            debug_level,
            server,
            host,
            tinc_up,
            peers: parse_peers(settings)?,
        })
    }

    /// Networks reachable through peers
    pub fn routes(&self) -> PluginResult<Vec<IpInterface>> {
        let mut routes: Vec<IpInterface> = Vec::new();
        for peer in &self.peers {
            for subnet in peer.subnets() {
                let network = subnet.parse::<IpInterface>()?.network();
                if !routes.contains(&network) {
                    routes.push(network);
                }
            }
        }
        Ok(routes)
    }

    pub async fn write(&self, config_dir: &Path) -> PluginResult<()> {
        let hosts_dir = config_dir.join("hosts");
        common::ensure_directory_exists(&hosts_dir).await?;

        common::write_secure_config(&config_dir.join("tinc-up"), &self.tinc_up, TINC_UP_PERMISSIONS).await?;
        for peer in &self.peers {
            let content = peer.render();
            debug!("tinc peer host config: {}: {:?}", peer.name, content);
            common::write_secure_config(&hosts_dir.join(&peer.name), &content, HOST_FILE_PERMISSIONS).await?;
        }

        let server = self.server.render();
        debug!("tinc server config: {:?}", server);
        common::write_secure_config(&config_dir.join("tinc.conf"), &server, HOST_FILE_PERMISSIONS).await?;

        let host = self.host.render();
        debug!("tinc host config: {:?}", host);
        common::write_secure_config(&hosts_dir.join(&self.node_name), &host, HOST_FILE_PERMISSIONS).await
    }

    pub fn command(&self, settings: &Settings, config_dir: &Path) -> Vec<String> {
        vec![
            settings.get_or("tincd-bin", "tincd").to_string(),
            "--config".to_string(),
            config_dir.display().to_string(),
            "--no-detach".to_string(),
            "--debug".to_string(),
            self.debug_level.to_string(),
        ]
    }
}

#[derive(Default)]
pub struct TincController {
    tincd: Option<SupervisedProcess>,
    config_dir: Option<PathBuf>,
    dev: Option<String>,
    graceful_exit_timeout: Option<Duration>,
}

pub fn create_controller() -> Box<dyn ConnectionController> {
    Box::new(TincController::default())
}

#[async_trait]
impl ConnectionController for TincController {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    async fn start(&mut self, request: &StartRequest, ctx: &ControllerContext) -> PluginResult<ConnectionResult> {
        let layout = TincLayout::from_settings(&request.settings, &request.name)?;
        let routes = layout.routes()?;
        self.graceful_exit_timeout = Some(ctx.graceful_exit_timeout);
        self.dev = Some(layout.dev.clone());

        let config_dir = ctx
            .runtime_dir
            .join("tinc-nm")
            .join(format!("config.{}", request.uuid));
        layout.write(&config_dir).await?;
        self.config_dir = Some(config_dir.clone());

        let cmd = layout.command(&request.settings, &config_dir);
        info!("Run tincd: {:?}", cmd);
        let tincd = self.tincd.insert(SupervisedProcess::spawn(
            &cmd,
            Some("tincd"),
            Redirect::Inherit,
            common::stderr_target(&request.settings),
        )?);
        common::wait_for_interface(tincd, &layout.dev).await?;

        let (ipv4, ipv6) = interface::primary_addresses(&layout.dev).await?;
        Ok(ConnectionResult::new(DUMMY_GATEWAY)
            .with_device(layout.dev)
            .with_addresses(ipv4, ipv6)
            .with_routes(routes))
    }

    async fn stop(&mut self) -> PluginResult<()> {
        let timeout = self.graceful_exit_timeout.unwrap_or(DEFAULT_GRACEFUL_EXIT_TIMEOUT);
        common::stop_process(&mut self.tincd, timeout).await
    }

    fn readiness(&self) -> Option<Readiness> {
        self.dev.clone().map(Readiness::Interface)
    }
}
