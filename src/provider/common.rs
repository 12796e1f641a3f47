//! Helpers shared by the provider controllers

use crate::error::{PluginError, PluginResult};
use crate::interface;
use crate::process::{wait_until_ready, Redirect, SupervisedProcess};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// Placeholder gateway for overlay networks that have no single VPN gateway
pub const DUMMY_GATEWAY: Ipv4Addr = Ipv4Addr::BROADCAST;

/// Poll interval while waiting for a tunnel interface
pub const INTERFACE_CHECK_INTERVAL: Duration = Duration::from_secs(2);

/// How long a daemon gets to bring its tunnel interface up
pub const INTERFACE_READY_TIMEOUT: Duration = Duration::from_secs(30);

/// The `vpn.data` string map of a connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings(HashMap<String, String>);

impl Settings {
    pub fn new(data: HashMap<String, String>) -> Self {
        Self(data)
    }

    /// Untrimmed value exactly as stored
    pub fn raw(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Trimmed value; blank values count as absent
    pub fn get(&self, key: &str) -> Option<&str> {
        self.raw(key).map(str::trim).filter(|v| !v.is_empty())
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    pub fn require(&self, key: &str) -> PluginResult<&str> {
        self.get(key)
            .ok_or_else(|| PluginError::InvalidSettings(format!("Missing required setting '{}'", key)))
    }

    /// `true` only for the literal string "true"
    pub fn flag(&self, key: &str) -> bool {
        self.get(key) == Some("true")
    }

    pub fn parse<T: FromStr>(&self, key: &str) -> PluginResult<Option<T>> {
        self.get(key)
            .map(|v| {
                v.parse::<T>()
                    .map_err(|_| PluginError::InvalidSettings(format!("Invalid value for '{}': {:?}", key, v)))
            })
            .transpose()
    }

    /// Split on any of `delimiters`, dropping empty pieces
    pub fn split(&self, key: &str, delimiters: &[char]) -> Vec<&str> {
        self.get(key)
            .map(|v| {
                v.split(|c| delimiters.contains(&c))
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// A JSON array of strings, as the connection editor stores lists
    pub fn json_list(&self, key: &str) -> PluginResult<Option<Vec<String>>> {
        self.get(key)
            .map(|v| {
                serde_json::from_str::<Vec<String>>(v)
                    .map_err(|e| PluginError::InvalidSettings(format!("'{}' must be a JSON list of strings: {}", key, e)))
            })
            .transpose()
    }
}

impl From<HashMap<String, String>> for Settings {
    fn from(data: HashMap<String, String>) -> Self {
        Self(data)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Settings {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Daemon stderr goes to `log-file` when configured
pub fn stderr_target(settings: &Settings) -> Redirect {
    match settings.get("log-file") {
        Some(path) => Redirect::File(PathBuf::from(path)),
        None => Redirect::Inherit,
    }
}

/// Tunnel device from `key`, or one derived from the connection name
pub fn device_name(settings: &Settings, key: &str, connection_name: &str) -> PluginResult<String> {
    match settings.get(key) {
        Some(dev) => {
            interface::validate_interface_name(dev)?;
            Ok(dev.to_string())
        }
        None => Ok(interface::valid_interface_name(connection_name)),
    }
}

/// Block until `dev` is up with an address, or the daemon dies, or time runs out
pub async fn wait_for_interface(process: &mut SupervisedProcess, dev: &str) -> PluginResult<()> {
    wait_until_ready(
        || interface::is_interface_ready(dev),
        Some(process),
        INTERFACE_CHECK_INTERVAL,
        Some(INTERFACE_READY_TIMEOUT),
        &format!("Wait for interface: {}", dev),
    )
    .await
}

/// Ensure a directory exists, creating it if necessary
pub async fn ensure_directory_exists(path: &Path) -> PluginResult<()> {
    if !path.exists() {
        tokio::fs::create_dir_all(path).await?;
        info!("Created directory: {:?}", path);
    }
    Ok(())
}

/// Write a file that is never readable beyond `permissions`.
///
/// New files are created with the mode; an existing file is narrowed before
/// it is truncated.
pub async fn write_secure_config(path: &Path, content: &str, permissions: u32) -> PluginResult<()> {
    use std::os::unix::fs::PermissionsExt;
    use tokio::io::AsyncWriteExt;

    if let Some(parent) = path.parent() {
        ensure_directory_exists(parent).await?;
    }
    if path.exists() {
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(permissions)).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(permissions)
        .open(path)
        .await?;
    file.write_all(content.as_bytes()).await?;
    file.flush().await?;
    // The umask may have narrowed the creation mode further
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(permissions)).await?;

    debug!("Wrote config to {:?} with permissions {:o}", path, permissions);
    Ok(())
}

/// Delete a configuration file if it exists
pub async fn delete_config_file(path: &Path) -> PluginResult<()> {
    if path.exists() {
        tokio::fs::remove_file(path).await?;
        debug!("Deleted config file: {:?}", path);
    }
    Ok(())
}

/// Stop an optional daemon handle, leaving `None` behind
pub async fn stop_process(slot: &mut Option<SupervisedProcess>, timeout: Duration) -> PluginResult<()> {
    if let Some(mut process) = slot.take() {
        process.graceful_stop(timeout).await?;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) fn settings(pairs: &[(&str, &str)]) -> Settings {
    pairs.iter().map(|(k, v)| (*k, *v)).collect()
}
