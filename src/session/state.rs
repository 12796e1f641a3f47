//! Connection session state machine
//!
//! [`ServiceState::apply`] is a pure function: it maps the current state and
//! an event to the next state plus the notifications NetworkManager must see,
//! in emission order. Nothing here performs I/O.

use crate::error::{FailureReason, PluginError, PluginResult};
use crate::net::{Ipv4Interface, Ipv6Interface, IpInterface};
use crate::provider::ConnectionResult;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// `NMVpnServiceState`
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ServiceState {
    #[default]
    Unknown = 0,
    Init = 1,
    Shutdown = 2,
    Starting = 3,
    Started = 4,
    Stopping = 5,
    Stopped = 6,
}

impl From<ServiceState> for u32 {
    fn from(state: ServiceState) -> Self {
        state as u32
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceState::Unknown => "unknown",
            ServiceState::Init => "init",
            ServiceState::Shutdown => "shutdown",
            ServiceState::Starting => "starting",
            ServiceState::Started => "started",
            ServiceState::Stopping => "stopping",
            ServiceState::Stopped => "stopped",
        };
        write!(f, "{}({})", name, *self as u32)
    }
}

/// Inputs to the state machine
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// ConnectInteractive accepted
    Connect,
    /// The controller started successfully
    Connected(Box<ConnectionResult>),
    /// The controller failed to start
    Failed(FailureReason),
    /// Disconnect requested (by NetworkManager or on shutdown)
    Disconnect,
    /// The controller finished stopping
    StopCompleted,
}

/// Generic VPN configuration (`Config` signal)
#[derive(Debug, Clone, PartialEq)]
pub struct GeneralConfig {
    pub tundev: Option<String>,
    pub banner: String,
    pub gateway: Ipv4Addr,
    pub mtu: Option<u32>,
    pub has_ip4: bool,
    pub has_ip6: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ip4Config {
    pub address: Ipv4Interface,
    pub dns: Vec<Ipv4Addr>,
    pub routes: Vec<Ipv4Interface>,
    pub never_default: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ip6Config {
    pub address: Ipv6Interface,
    pub dns: Vec<Ipv6Addr>,
    pub routes: Vec<Ipv6Interface>,
    pub never_default: bool,
}

/// Outbound signals, in the order they must be emitted
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    StateChanged(ServiceState),
    Config(GeneralConfig),
    Ip4Config(Ip4Config),
    Ip6Config(Ip6Config),
    LoginBanner(String),
    Failure(FailureReason),
    SecretsRequired { message: String, secrets: Vec<String> },
}

impl Notification {
    pub fn signal_name(&self) -> &'static str {
        match self {
            Notification::StateChanged(_) => "StateChanged",
            Notification::Config(_) => "Config",
            Notification::Ip4Config(_) => "Ip4Config",
            Notification::Ip6Config(_) => "Ip6Config",
            Notification::LoginBanner(_) => "LoginBanner",
            Notification::Failure(_) => "Failure",
            Notification::SecretsRequired { .. } => "SecretsRequired",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub state: ServiceState,
    pub notifications: Vec<Notification>,
}

impl Transition {
    fn to(state: ServiceState, mut notifications: Vec<Notification>) -> Self {
        notifications.push(Notification::StateChanged(state));
        Self { state, notifications }
    }

    fn stay(state: ServiceState) -> Self {
        Self {
            state,
            notifications: Vec::new(),
        }
    }

    /// Whether anything changed
    pub fn is_noop(&self) -> bool {
        self.notifications.is_empty()
    }
}

/// Config, Ip4Config, Ip6Config and LoginBanner for a started connection
pub fn config_notifications(result: &ConnectionResult) -> Vec<Notification> {
    let mut notifications = vec![Notification::Config(GeneralConfig {
        tundev: result.device.clone(),
        banner: result.banner.clone(),
        gateway: result.gateway,
        mtu: result.mtu,
        has_ip4: result.ipv4.is_some(),
        has_ip6: result.ipv6.is_some(),
    })];

    if let Some(address) = result.ipv4 {
        notifications.push(Notification::Ip4Config(Ip4Config {
            address,
            dns: result
                .dns
                .iter()
                .filter_map(|ip| match ip {
                    IpAddr::V4(v4) => Some(*v4),
                    IpAddr::V6(_) => None,
                })
                .collect(),
            routes: result
                .routes
                .iter()
                .filter_map(|route| match route.network() {
                    IpInterface::V4(v4) => Some(v4),
                    IpInterface::V6(_) => None,
                })
                .collect(),
            never_default: result.never_default_route,
        }));
    }

    if let Some(address) = result.ipv6 {
        notifications.push(Notification::Ip6Config(Ip6Config {
            address,
            dns: result
                .dns
                .iter()
                .filter_map(|ip| match ip {
                    IpAddr::V6(v6) => Some(*v6),
                    IpAddr::V4(_) => None,
                })
                .collect(),
            routes: result
                .routes
                .iter()
                .filter_map(|route| match route.network() {
                    IpInterface::V6(v6) => Some(v6),
                    IpInterface::V4(_) => None,
                })
                .collect(),
            never_default: result.never_default_route,
        }));
    }

    if !result.banner.is_empty() {
        notifications.push(Notification::LoginBanner(result.banner.clone()));
    }
    notifications
}

impl ServiceState {
    pub fn apply(self, event: &SessionEvent) -> PluginResult<Transition> {
        use ServiceState::*;

        match (self, event) {
            (Starting, SessionEvent::Connect) => Err(PluginError::AlreadyConnecting),
            (Unknown | Init | Stopped, SessionEvent::Connect) => Ok(Transition::to(Starting, Vec::new())),

            (Starting, SessionEvent::Connected(result)) => Ok(Transition::to(Started, config_notifications(result))),

            (Starting, SessionEvent::Failed(reason)) => {
                Ok(Transition::to(Stopping, vec![Notification::Failure(*reason)]))
            }

            (Stopped | Stopping, SessionEvent::Disconnect) => Ok(Transition::stay(self)),
            (_, SessionEvent::Disconnect) => Ok(Transition::to(Stopping, Vec::new())),

            (Stopping, SessionEvent::StopCompleted) => Ok(Transition::to(Stopped, Vec::new())),

            (state, event) => Err(PluginError::InvalidState(format!(
                "{:?} is not valid while {}",
                EventKind(event),
                state
            ))),
        }
    }
}

/// Event name without its payload, for error messages
struct EventKind<'a>(&'a SessionEvent);

impl fmt::Debug for EventKind<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.0 {
            SessionEvent::Connect => "Connect",
            SessionEvent::Connected(_) => "Connected",
            SessionEvent::Failed(_) => "Failed",
            SessionEvent::Disconnect => "Disconnect",
            SessionEvent::StopCompleted => "StopCompleted",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::common::DUMMY_GATEWAY;

    fn result() -> ConnectionResult {
        ConnectionResult::new(DUMMY_GATEWAY)
            .with_device("edge0")
            .with_addresses(
                Some(Ipv4Interface::new(Ipv4Addr::new(10, 9, 0, 2), 24).unwrap()),
                None,
            )
            .with_routes(vec!["10.20.0.5/16".parse().unwrap(), "fd00::/64".parse().unwrap()])
    }

    #[test]
    fn test_connect_from_idle_states() {
        for state in [ServiceState::Unknown, ServiceState::Init, ServiceState::Stopped] {
            let t = state.apply(&SessionEvent::Connect).unwrap();
            assert_eq!(t.state, ServiceState::Starting);
            assert_eq!(t.notifications, vec![Notification::StateChanged(ServiceState::Starting)]);
        }
    }

    #[test]
    fn test_connect_rejected_while_busy() {
        assert!(matches!(
            ServiceState::Starting.apply(&SessionEvent::Connect),
            Err(PluginError::AlreadyConnecting)
        ));
        assert!(matches!(
            ServiceState::Started.apply(&SessionEvent::Connect),
            Err(PluginError::InvalidState(_))
        ));
    }

    #[test]
    fn test_connected_emits_config_then_started() {
        let t = ServiceState::Starting
            .apply(&SessionEvent::Connected(Box::new(result())))
            .unwrap();
        assert_eq!(t.state, ServiceState::Started);

        let names: Vec<_> = t.notifications.iter().map(Notification::signal_name).collect();
        assert_eq!(names, vec!["Config", "Ip4Config", "StateChanged"]);

        match &t.notifications[0] {
            Notification::Config(config) => {
                assert_eq!(config.tundev.as_deref(), Some("edge0"));
                assert!(config.banner.is_empty());
                assert!(config.has_ip4);
                assert!(!config.has_ip6);
            }
            other => panic!("unexpected {:?}", other),
        }
        match &t.notifications[1] {
            Notification::Ip4Config(ip4) => {
                assert_eq!(ip4.address.prefix, 24);
                assert!(ip4.never_default);
                assert_eq!(ip4.routes, vec![Ipv4Interface::new(Ipv4Addr::new(10, 20, 0, 0), 16).unwrap()]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_banner_and_ipv6() {
        let mut result = result().with_banner("Welcome");
        result.ipv6 = Some(Ipv6Interface::new("fd00::2".parse().unwrap(), 64).unwrap());
        result.dns = vec!["10.9.0.1".parse().unwrap(), "fd00::1".parse().unwrap()];

        let notifications = config_notifications(&result);
        let names: Vec<_> = notifications.iter().map(Notification::signal_name).collect();
        assert_eq!(names, vec!["Config", "Ip4Config", "Ip6Config", "LoginBanner"]);
        match &notifications[2] {
            Notification::Ip6Config(ip6) => {
                assert_eq!(ip6.dns, vec!["fd00::1".parse::<Ipv6Addr>().unwrap()]);
                assert_eq!(ip6.routes.len(), 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_failure_path() {
        let t = ServiceState::Starting
            .apply(&SessionEvent::Failed(FailureReason::ConnectFailed))
            .unwrap();
        assert_eq!(t.state, ServiceState::Stopping);
        assert_eq!(
            t.notifications,
            vec![
                Notification::Failure(FailureReason::ConnectFailed),
                Notification::StateChanged(ServiceState::Stopping)
            ]
        );

        let t = t.state.apply(&SessionEvent::StopCompleted).unwrap();
        assert_eq!(t.state, ServiceState::Stopped);
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let t = ServiceState::Started.apply(&SessionEvent::Disconnect).unwrap();
        assert_eq!(t.state, ServiceState::Stopping);

        let t = ServiceState::Stopped.apply(&SessionEvent::Disconnect).unwrap();
        assert!(t.is_noop());
        assert_eq!(t.state, ServiceState::Stopped);
    }

    #[test]
    fn test_late_result_rejected() {
        let err = ServiceState::Stopped
            .apply(&SessionEvent::Connected(Box::new(result())))
            .unwrap_err();
        assert!(err.to_string().contains("Connected"));
        assert!(ServiceState::Started.apply(&SessionEvent::StopCompleted).is_err());
    }

    #[test]
    fn test_state_codes() {
        assert_eq!(u32::from(ServiceState::Starting), 3);
        assert_eq!(u32::from(ServiceState::Stopped), 6);
        assert_eq!(ServiceState::Started.to_string(), "started(4)");
    }
}
