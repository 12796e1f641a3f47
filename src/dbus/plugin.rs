//! `org.freedesktop.NetworkManager.VPN.Plugin` D-Bus interface
//!
//! A thin adapter: method calls are forwarded to the [`Session`], and the
//! session's notifications come back through [`DbusNotifier`] as signals.

use super::descriptor::{self, ConnectionDescriptor};
use crate::error::{PluginError, PluginResult};
use crate::net::{ipv4_to_u32, ipv6_to_bytes};
use crate::session::notify::NotificationSink;
use crate::session::state::{GeneralConfig, Ip4Config, Ip6Config, Notification};
use crate::session::Session;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use zbus::object_server::SignalEmitter;
use zbus::zvariant::{OwnedValue, Value};
use zbus::{fdo, interface, Connection};

pub const VPN_PLUGIN_INTERFACE: &str = "org.freedesktop.NetworkManager.VPN.Plugin";

/// A `a{sv}` map as NetworkManager expects it
pub type VariantMap = HashMap<String, Value<'static>>;

/// Generic connection details (`Config` signal)
pub fn config_map(config: &GeneralConfig) -> VariantMap {
    let mut map = VariantMap::new();
    if let Some(tundev) = &config.tundev {
        map.insert("tundev".to_string(), Value::from(tundev.clone()));
    }
    map.insert("banner".to_string(), Value::from(config.banner.clone()));
    map.insert("gateway".to_string(), Value::from(ipv4_to_u32(config.gateway)));
    if let Some(mtu) = config.mtu {
        map.insert("mtu".to_string(), Value::from(mtu));
    }
    map.insert("has-ip4".to_string(), Value::from(config.has_ip4));
    map.insert("has-ip6".to_string(), Value::from(config.has_ip6));
    map
}

/// IPv4 details (`Ip4Config` signal)
pub fn ip4_config_map(config: &Ip4Config) -> VariantMap {
    let mut map = VariantMap::new();
    map.insert("address".to_string(), Value::from(ipv4_to_u32(config.address.address)));
    map.insert("prefix".to_string(), Value::from(u32::from(config.address.prefix)));
    let dns: Vec<u32> = config.dns.iter().copied().map(ipv4_to_u32).collect();
    map.insert("dns".to_string(), Value::from(dns));
    if !config.routes.is_empty() {
        // [destination, prefix, next hop, metric]
        let routes: Vec<Vec<u32>> = config
            .routes
            .iter()
            .map(|route| vec![ipv4_to_u32(route.address), u32::from(route.prefix), 0, 0])
            .collect();
        map.insert("routes".to_string(), Value::from(routes));
    }
    map.insert("never-default".to_string(), Value::from(config.never_default));
    map
}

/// IPv6 details (`Ip6Config` signal)
pub fn ip6_config_map(config: &Ip6Config) -> VariantMap {
    let mut map = VariantMap::new();
    map.insert("address".to_string(), Value::from(ipv6_to_bytes(config.address.address)));
    map.insert("prefix".to_string(), Value::from(u32::from(config.address.prefix)));
    let dns: Vec<Vec<u8>> = config.dns.iter().copied().map(ipv6_to_bytes).collect();
    map.insert("dns".to_string(), Value::from(dns));
    if !config.routes.is_empty() {
        let routes: Vec<(Vec<u8>, u32, Vec<u8>, u32)> = config
            .routes
            .iter()
            .map(|route| {
                (
                    ipv6_to_bytes(route.address),
                    u32::from(route.prefix),
                    vec![0u8; 16],
                    0u32,
                )
            })
            .collect();
        map.insert("routes".to_string(), Value::from(routes));
    }
    map.insert("never-default".to_string(), Value::from(config.never_default));
    map
}

/// The VPN plugin object exported at the plugin path
pub struct VpnPlugin {
    session: Arc<Session>,
    quit: Arc<Notify>,
}

impl VpnPlugin {
    pub fn new(session: Arc<Session>, quit: Arc<Notify>) -> Self {
        Self { session, quit }
    }
}

#[interface(name = "org.freedesktop.NetworkManager.VPN.Plugin")]
impl VpnPlugin {
    /// Non-interactive connect; only ConnectInteractive is supported
    async fn connect(&self, connection: ConnectionDescriptor) -> fdo::Result<()> {
        warn!("Not implemented: Connect() {:?}", connection.keys().collect::<Vec<_>>());
        Ok(())
    }

    async fn connect_interactive(
        &self,
        connection: ConnectionDescriptor,
        details: HashMap<String, OwnedValue>,
    ) -> fdo::Result<()> {
        info!(
            "ConnectInteractive() details={:?} connecting={}",
            details.keys().collect::<Vec<_>>(),
            self.session.is_connecting()
        );
        let request = descriptor::start_request(&connection)?;
        self.session.connect(request).await?;
        Ok(())
    }

    async fn need_secrets(&self, settings: ConnectionDescriptor) -> fdo::Result<String> {
        info!("NeedSecrets() {:?}", settings.keys().collect::<Vec<_>>());
        Ok(String::new())
    }

    async fn new_secrets(&self, connection: ConnectionDescriptor) -> fdo::Result<()> {
        info!("NewSecrets() {:?}", connection.keys().collect::<Vec<_>>());
        Ok(())
    }

    /// Stop the connection and let the service exit
    async fn disconnect(&self) -> fdo::Result<()> {
        info!("Disconnect() connecting={}", self.session.is_connecting());
        let stopped = self.session.disconnect().await;
        self.quit.notify_one();
        stopped.map_err(fdo::Error::from)
    }

    async fn set_config(&self, config: HashMap<String, OwnedValue>) -> fdo::Result<()> {
        info!("SetConfig() {:?}", config);
        Ok(())
    }

    #[zbus(name = "SetIp4Config")]
    async fn set_ip4_config(&self, config: HashMap<String, OwnedValue>) -> fdo::Result<()> {
        info!("SetIp4Config() {:?}", config);
        Ok(())
    }

    #[zbus(name = "SetIp6Config")]
    async fn set_ip6_config(&self, config: HashMap<String, OwnedValue>) -> fdo::Result<()> {
        info!("SetIp6Config() {:?}", config);
        Ok(())
    }

    async fn set_failure(&self, reason: &str) -> fdo::Result<()> {
        info!("SetFailure() {:?}", reason);
        Ok(())
    }

    /// `NMVpnServiceState`
    #[zbus(property)]
    async fn state(&self) -> u32 {
        u32::from(self.session.state().await)
    }

    #[zbus(signal, name = "StateChanged")]
    async fn service_state_changed(emitter: &SignalEmitter<'_>, state: u32) -> zbus::Result<()>;

    #[zbus(signal, name = "SecretsRequired")]
    async fn secrets_required(emitter: &SignalEmitter<'_>, message: &str, secrets: Vec<String>) -> zbus::Result<()>;

    #[zbus(signal, name = "Config")]
    async fn config(emitter: &SignalEmitter<'_>, config: VariantMap) -> zbus::Result<()>;

    #[zbus(signal, name = "Ip4Config")]
    async fn ip4_config(emitter: &SignalEmitter<'_>, ip4config: VariantMap) -> zbus::Result<()>;

    #[zbus(signal, name = "Ip6Config")]
    async fn ip6_config(emitter: &SignalEmitter<'_>, ip6config: VariantMap) -> zbus::Result<()>;

    #[zbus(signal, name = "LoginBanner")]
    async fn login_banner(emitter: &SignalEmitter<'_>, banner: &str) -> zbus::Result<()>;

    #[zbus(signal, name = "Failure")]
    async fn failure(emitter: &SignalEmitter<'_>, reason: u32) -> zbus::Result<()>;
}

/// Emits session notifications as signals of the exported [`VpnPlugin`]
pub struct DbusNotifier {
    connection: Connection,
    path: String,
}

impl DbusNotifier {
    pub fn new(connection: Connection, path: impl Into<String>) -> Self {
        Self {
            connection,
            path: path.into(),
        }
    }
}

#[async_trait]
impl NotificationSink for DbusNotifier {
    async fn notify(&self, notification: Notification) -> PluginResult<()> {
        let iface_ref = self
            .connection
            .object_server()
            .interface::<_, VpnPlugin>(self.path.as_str())
            .await
            .map_err(|e| PluginError::InvalidState(format!("VPN plugin not exported at {}: {}", self.path, e)))?;
        let emitter = iface_ref.signal_emitter();
        let name = notification.signal_name();

        match notification {
            Notification::StateChanged(state) => VpnPlugin::service_state_changed(emitter, u32::from(state)).await?,
            Notification::Config(config) => VpnPlugin::config(emitter, config_map(&config)).await?,
            Notification::Ip4Config(config) => VpnPlugin::ip4_config(emitter, ip4_config_map(&config)).await?,
            Notification::Ip6Config(config) => VpnPlugin::ip6_config(emitter, ip6_config_map(&config)).await?,
            Notification::LoginBanner(banner) => VpnPlugin::login_banner(emitter, &banner).await?,
            Notification::Failure(reason) => VpnPlugin::failure(emitter, u32::from(reason)).await?,
            Notification::SecretsRequired { message, secrets } => {
                VpnPlugin::secrets_required(emitter, &message, secrets).await?
            }
        }
        debug!("Emitted {}", name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{Ipv4Interface, Ipv6Interface};
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn general(mtu: Option<u32>) -> GeneralConfig {
        GeneralConfig {
            tundev: Some("edge0".to_string()),
            banner: String::new(),
            gateway: Ipv4Addr::BROADCAST,
            mtu,
            has_ip4: true,
            has_ip6: false,
        }
    }

    #[test]
    fn test_config_map() {
        let map = config_map(&general(None));
        assert_eq!(map["tundev"], Value::from("edge0"));
        assert_eq!(map["gateway"], Value::from(u32::MAX));
        assert_eq!(map["has-ip4"], Value::from(true));
        assert_eq!(map["has-ip6"], Value::from(false));
        assert!(!map.contains_key("mtu"));

        assert_eq!(config_map(&general(Some(1280)))["mtu"], Value::from(1280u32));
    }

    #[test]
    fn test_ip4_config_map() {
        let address = Ipv4Interface::new(Ipv4Addr::new(10, 0, 0, 2), 24).unwrap();
        let mut config = Ip4Config {
            address,
            dns: vec![Ipv4Addr::new(10, 0, 0, 1)],
            routes: Vec::new(),
            never_default: true,
        };
        let map = ip4_config_map(&config);
        assert_eq!(map["address"], Value::from(ipv4_to_u32(Ipv4Addr::new(10, 0, 0, 2))));
        assert_eq!(map["prefix"], Value::from(24u32));
        assert_eq!(map["dns"], Value::from(vec![ipv4_to_u32(Ipv4Addr::new(10, 0, 0, 1))]));
        assert_eq!(map["never-default"], Value::from(true));
        assert!(!map.contains_key("routes"));

        config.routes.push(Ipv4Interface::new(Ipv4Addr::new(10, 20, 0, 0), 16).unwrap());
        let map = ip4_config_map(&config);
        assert_eq!(
            map["routes"],
            Value::from(vec![vec![ipv4_to_u32(Ipv4Addr::new(10, 20, 0, 0)), 16u32, 0, 0]])
        );
    }

    #[test]
    fn test_ip6_config_map() {
        let address: Ipv6Addr = "fd7a:115c:a1e0::1".parse().unwrap();
        let config = Ip6Config {
            address: Ipv6Interface::new(address, 128).unwrap(),
            dns: Vec::new(),
            routes: vec![Ipv6Interface::new("fd00:20::".parse().unwrap(), 64).unwrap()],
            never_default: true,
        };
        let map = ip6_config_map(&config);
        assert_eq!(map["address"], Value::from(address.octets().to_vec()));
        assert_eq!(map["prefix"], Value::from(128u32));
        assert!(map.contains_key("routes"));
        assert_eq!(map["routes"].value_signature().to_string(), "a(ayuayu)");
    }
}
