//! NetworkManager VPN plugin D-Bus surface

pub mod descriptor;
pub mod integration;
pub mod plugin;

pub use descriptor::{start_request, ConnectionDescriptor};
pub use integration::PluginService;
pub use plugin::{DbusNotifier, VpnPlugin, VPN_PLUGIN_INTERFACE};
