//! Service configuration
//!
//! Resolved from the command line NetworkManager passes, an optional TOML
//! file and the environment, in that order of precedence.

use crate::error::{PluginError, PluginResult};
use crate::process::DEFAULT_GRACEFUL_EXIT_TIMEOUT;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Object path NetworkManager expects the plugin at
pub const PLUGIN_OBJECT_PATH: &str = "/org/freedesktop/NetworkManager/VPN/Plugin";

const BUS_NAME_PREFIX: &str = "org.freedesktop.NetworkManager";
const STATE_BASE_PREFIX: &str = "/etc/NetworkManager";
const FALLBACK_RUNTIME_DIR: &str = "/var/run";

/// NetworkManager VPN plugin service
#[derive(Parser, Debug, Clone)]
#[command(name = "nm-vpn-service")]
#[command(version, about, long_about = None)]
pub struct CliArgs {
    /// VPN provider to drive (n2n, nebula, tailscale, tinc, weron, zerotier)
    #[arg(long)]
    pub provider: String,

    /// D-Bus well-known name to own
    #[arg(long)]
    pub bus_name: Option<String>,

    /// Directory for persistent per-connection provider state
    #[arg(long)]
    pub state_base_dir: Option<PathBuf>,

    /// Optional TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Use the session bus even when running as root
    #[arg(long)]
    pub session_bus: bool,

    /// Anything else NetworkManager passes along
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, hide = true)]
    pub extra: Vec<String>,
}

/// Optional overrides read from `--config`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub runtime_dir: Option<PathBuf>,
    pub state_base_dir: Option<PathBuf>,
    pub graceful_exit_timeout_secs: Option<u64>,
}

impl FileConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> PluginResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        toml::from_str(&content).map_err(|e| {
            PluginError::InvalidSettings(format!("Failed to parse {}: {}", path.as_ref().display(), e))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    System,
    Session,
}

/// Fully resolved service configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub provider: String,
    pub bus_name: String,
    pub object_path: String,
    pub state_base_dir: PathBuf,
    pub runtime_dir: PathBuf,
    pub graceful_exit_timeout: Duration,
    pub bus: BusKind,
}

fn default_runtime_dir() -> PathBuf {
    std::env::var_os("XDG_RUNTIME_DIR")
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(FALLBACK_RUNTIME_DIR))
}

fn default_bus() -> BusKind {
    if unsafe { libc::getuid() } == 0 {
        BusKind::System
    } else {
        BusKind::Session
    }
}

impl ServiceConfig {
    pub fn resolve(args: &CliArgs, file: FileConfig) -> Self {
        let bus_name = args
            .bus_name
            .clone()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| format!("{}.{}", BUS_NAME_PREFIX, args.provider));

        let state_base_dir = args
            .state_base_dir
            .clone()
            .or(file.state_base_dir)
            .unwrap_or_else(|| Path::new(STATE_BASE_PREFIX).join(&bus_name));

        let graceful_exit_timeout = file
            .graceful_exit_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_GRACEFUL_EXIT_TIMEOUT);

        Self {
            provider: args.provider.clone(),
            bus_name,
            object_path: PLUGIN_OBJECT_PATH.to_string(),
            state_base_dir,
            runtime_dir: file.runtime_dir.unwrap_or_else(default_runtime_dir),
            graceful_exit_timeout,
            bus: if args.session_bus { BusKind::Session } else { default_bus() },
        }
    }

    /// Parse the command line and load `--config` if given
    pub fn from_args(args: &CliArgs) -> PluginResult<Self> {
        let file = match &args.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Ok(Self::resolve(args, file))
    }
}
