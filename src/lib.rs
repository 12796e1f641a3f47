//! nmvpn - NetworkManager VPN plugin service
//!
//! Bridges NetworkManager's VPN plugin D-Bus API to overlay VPN daemons:
//! - n2n (`edge`)
//! - nebula
//! - tailscale (`tailscaled` + `tailscale up`)
//! - tinc (`tincd`)
//! - weron
//! - ZeroTier (`zerotier-one`)
//!
//! One service process drives one provider and at most one connection.

pub mod config;
pub mod error;
pub mod interface;
pub mod logging;
pub mod net;
pub mod process;
pub mod provider;
pub mod session;
pub mod dbus;

// Re-export commonly used types
pub use config::{CliArgs, ServiceConfig};
pub use dbus::PluginService;
pub use error::{FailureReason, PluginError, PluginResult};
pub use net::{IpInterface, Ipv4Interface, Ipv6Interface};
pub use provider::{ConnectionController, ConnectionResult, ProviderRegistry, Settings, StartRequest};
pub use session::state::ServiceState;
pub use session::Session;
