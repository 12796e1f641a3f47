//! nebula controller
//!
//! Renders a JSON nebula config from the connection settings, runs
//! `nebula -config <file>` and waits for the tun device.

use super::backend::{ConnectionController, ConnectionResult, ControllerContext, StartRequest};
use super::common::{self, Settings, DUMMY_GATEWAY};
use crate::error::{PluginError, PluginResult};
use crate::interface;
use crate::process::{Readiness, Redirect, SupervisedProcess, DEFAULT_GRACEFUL_EXIT_TIMEOUT};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const PROVIDER: &str = "nebula";

const DEFAULT_INBOUND_RULES: &str = r#"["port=any,proto=icmp,host=any"]"#;
const DEFAULT_OUTBOUND_RULES: &str = r#"["port=any,proto=any,host=any"]"#;
const CONFIG_PERMISSIONS: u32 = 0o600;
const USE_RELAYS_KEY: &str = "realy-use_relays";

#[derive(Default)]
pub struct NebulaController {
    process: Option<SupervisedProcess>,
    config_file: Option<PathBuf>,
    dev: Option<String>,
    graceful_exit_timeout: Option<Duration>,
}

pub fn create_controller() -> Box<dyn ConnectionController> {
    Box::new(NebulaController::default())
}

/// Parse firewall rules stored as a JSON list of `k=v,k=v` strings.
///
/// Numeric `port` values become JSON numbers; empty and duplicate rules are dropped.
pub fn parse_firewall_rules(serialized: &str) -> PluginResult<Vec<Value>> {
    let entries: Vec<String> = serde_json::from_str(serialized)
        .map_err(|e| PluginError::InvalidSettings(format!("Firewall rules must be a JSON list: {}", e)))?;

    let mut rules: Vec<Value> = Vec::new();
    for entry in entries {
        let mut rule = Map::new();
        for kv in entry.split(',').filter(|kv| !kv.trim().is_empty()) {
            let (key, value) = kv
                .split_once('=')
                .ok_or_else(|| PluginError::InvalidSettings(format!("Malformed firewall rule part {:?}", kv)))?;
            let (key, value) = (key.trim(), value.trim());
            let value = match (key, value.parse::<u16>()) {
                ("port", Ok(port)) => Value::from(port),
                _ => Value::from(value),
            };
            rule.insert(key.to_string(), value);
        }
        let rule = Value::Object(rule);
        if rule.as_object().is_some_and(|r| !r.is_empty()) && !rules.contains(&rule) {
            rules.push(rule);
        }
    }
    Ok(rules)
}

/// Build the nebula config document and the tun device it names
pub fn nebula_config(settings: &Settings, connection_name: &str) -> PluginResult<(Value, String)> {
    let lighthouse_ip = settings.require("lighthouse-overlay-ip")?;
    let lighthouse_endpoint = settings.require("lighthouse-host-port")?;
    let dev = common::device_name(settings, "tun-dev", connection_name)?;

    let mut config = json!({
        "pki": {
            "ca": settings.require("pki-ca")?,
            "cert": settings.require("pki-cert")?,
            "key": settings.require("pki-key")?,
        },
        "static_host_map": { lighthouse_ip: [lighthouse_endpoint] },
        "lighthouse": {
            "am_lighthouse": false,
            "interval": 60,
            "hosts": [lighthouse_ip],
        },
        "tun": { "dev": dev },
        "firewall": {
            "inbound": parse_firewall_rules(settings.get_or("inbound-rules", DEFAULT_INBOUND_RULES))?,
            "outbound": parse_firewall_rules(settings.get_or("outbound-rules", DEFAULT_OUTBOUND_RULES))?,
        },
    });

    if let Some(level) = settings.get("logging-level") {
        config["logging"] = json!({ "level": level });
    }
    // Stored profiles spell the key this way
    if settings.get(USE_RELAYS_KEY).is_some() {
        config["relay"] = json!({ "use_relays": settings.flag(USE_RELAYS_KEY) });
    }
    let mut listen = Map::new();
    if let Some(host) = settings.get("listen-host") {
        listen.insert("host".to_string(), Value::from(host));
    }
    match settings.parse::<u16>("listen-port")? {
        Some(0) | None => {}
        Some(port) => {
            listen.insert("port".to_string(), Value::from(port));
        }
    }
    if !listen.is_empty() {
        config["listen"] = Value::Object(listen);
    }

    Ok((config, dev))
}

#[async_trait]
impl ConnectionController for NebulaController {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    async fn start(&mut self, request: &StartRequest, ctx: &ControllerContext) -> PluginResult<ConnectionResult> {
        let (config, dev) = nebula_config(&request.settings, &request.name)?;
        self.graceful_exit_timeout = Some(ctx.graceful_exit_timeout);
        self.dev = Some(dev.clone());

        let config_file = ctx
            .runtime_dir
            .join("nebula-nm")
            .join(format!("config.{}.json", request.uuid));
        debug!("Nebula config: {}", config);
        let rendered = serde_json::to_string_pretty(&config)?;
        common::write_secure_config(&config_file, &rendered, CONFIG_PERMISSIONS).await?;
        self.config_file = Some(config_file.clone());

        let cmd = vec![
            request.settings.get_or("nebula-bin", "nebula").to_string(),
            "-config".to_string(),
            config_file.display().to_string(),
        ];
        info!("Run nebula {:?}", cmd);
        let process = self.process.insert(SupervisedProcess::spawn(
            &cmd,
            Some("nebula"),
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
        let stopped = common::stop_process(&mut self.process, timeout).await;
        if let Some(path) = self.config_file.take() {
            if let Err(e) = common::delete_config_file(&path).await {
                warn!("Could not remove {:?}: {}", path, e);
            }
        }
        stopped
    }

    fn readiness(&self) -> Option<Readiness> {
        self.dev.clone().map(Readiness::Interface)
    }
}
