use crate::error::PluginResult;
use crate::net::{IpInterface, Ipv4Interface, Ipv6Interface};
use crate::process::Readiness;
use crate::provider::common::Settings;
use crate::session::notify::AuthPrompter;
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

/// What NetworkManager asked us to bring up
#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    /// `connection.uuid`
    pub uuid: String,
    /// `connection.id`, the human readable name
    pub name: String,
    /// `vpn.data`
    pub settings: Settings,
}

/// Service-wide facilities handed to a controller
#[derive(Clone)]
pub struct ControllerContext {
    /// Persistent provider state lives below this directory
    pub state_base_dir: PathBuf,
    /// Generated config files and sockets live below this directory
    pub runtime_dir: PathBuf,
    pub graceful_exit_timeout: Duration,
    pub prompter: AuthPrompter,
}

/// Outcome of a successful start, reported to NetworkManager
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionResult {
    pub gateway: Ipv4Addr,
    pub device: Option<String>,
    pub ipv4: Option<Ipv4Interface>,
    pub ipv6: Option<Ipv6Interface>,
    pub dns: Vec<IpAddr>,
    pub routes: Vec<IpInterface>,
    pub mtu: Option<u32>,
    pub banner: String,
    pub never_default_route: bool,
}

impl ConnectionResult {
    pub fn new(gateway: Ipv4Addr) -> Self {
        Self {
            gateway,
            device: None,
            ipv4: None,
            ipv6: None,
            dns: Vec::new(),
            routes: Vec::new(),
            mtu: None,
            banner: String::new(),
            never_default_route: true,
        }
    }

    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(device.into());
        self
    }

    pub fn with_addresses(mut self, ipv4: Option<Ipv4Interface>, ipv6: Option<Ipv6Interface>) -> Self {
        self.ipv4 = ipv4;
        self.ipv6 = ipv6;
        self
    }

    pub fn with_routes(mut self, routes: Vec<IpInterface>) -> Self {
        self.routes = routes;
        self
    }

    pub fn with_mtu(mut self, mtu: Option<u32>) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn with_banner(mut self, banner: impl Into<String>) -> Self {
        self.banner = banner.into();
        self
    }
}

/// Drives one VPN technology's daemon(s) for a single connection.
///
/// `stop` must be safe to call at any time, including when `start` never ran
/// or was aborted midway; every process handle a controller spawns is kept
/// in the controller so `stop` can reach it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConnectionController: Send {
    /// Provider name, e.g. "n2n"
    fn name(&self) -> &'static str;

    async fn start(&mut self, request: &StartRequest, ctx: &ControllerContext) -> PluginResult<ConnectionResult>;

    async fn stop(&mut self) -> PluginResult<()>;

    /// Condition that should hold while the tunnel is up
    fn readiness(&self) -> Option<Readiness>;
}

/// Creates a fresh controller; one per plugin process
pub type ControllerFactory = fn() -> Box<dyn ConnectionController>;
