//! Network interface helpers
//!
//! Name derivation and validation, and the readiness/address queries used
//! once a VPN daemon has created its tunnel device. Uses sysfs and `ip -json`.

use crate::error::{PluginError, PluginResult};
use crate::net::{IpInterface, Ipv4Interface, Ipv6Interface};
use crate::process::command::check_output_json;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::debug;

/// Linux kernel limit (IFNAMSIZ - 1)
pub const MAX_INTERFACE_NAME_LEN: usize = 15;

/// Used when nothing usable is left of a connection name
pub const FALLBACK_INTERFACE_NAME: &str = "vpn0";

const IP_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Derive a kernel-acceptable interface name from arbitrary text
pub fn valid_interface_name(name: &str) -> String {
    let name: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(MAX_INTERFACE_NAME_LEN)
        .collect();
    if name.is_empty() {
        FALLBACK_INTERFACE_NAME.to_string()
    } else {
        name
    }
}

/// Reject a configured device name the kernel or `ip` would misread
pub fn validate_interface_name(name: &str) -> PluginResult<()> {
    let problem = if name.is_empty() {
        "is empty"
    } else if name.len() > MAX_INTERFACE_NAME_LEN {
        "is longer than IFNAMSIZ allows"
    } else if name.starts_with('-') || name == "." || name == ".." {
        "cannot be passed as a device argument"
    } else if !name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')) {
        "has characters outside [A-Za-z0-9_.-]"
    } else {
        return Ok(());
    };
    Err(PluginError::InvalidSettings(format!("Device name {:?} {}", name, problem)))
}

async fn read_sysfs_string(interface: &str, file: &str) -> Option<String> {
    let path = format!("/sys/class/net/{}/{}", interface, file);
    fs::read_to_string(path).await.ok().map(|s| s.trim().to_string())
}

pub fn interface_exists(interface: &str) -> bool {
    Path::new(&format!("/sys/class/net/{}", interface)).exists()
}

fn parse_flags(raw: &str) -> Option<u32> {
    u32::from_str_radix(raw.trim().trim_start_matches("0x"), 16).ok()
}

/// Administrative IFF_UP flag from sysfs
pub async fn is_interface_up(interface: &str) -> bool {
    read_sysfs_string(interface, "flags")
        .await
        .and_then(|raw| parse_flags(&raw))
        .is_some_and(|flags| flags & libc::IFF_UP as u32 != 0)
}

#[derive(Debug, Deserialize)]
struct IpAddrShow {
    #[serde(default)]
    addr_info: Vec<AddrInfo>,
}

#[derive(Debug, Deserialize)]
struct AddrInfo {
    family: String,
    local: String,
    prefixlen: u8,
    #[serde(default)]
    scope: Option<String>,
}

fn parse_addresses(links: Vec<IpAddrShow>) -> Vec<IpInterface> {
    links
        .into_iter()
        .flat_map(|link| link.addr_info)
        .filter(|info| info.family == "inet" || info.family == "inet6")
        .filter_map(|info| {
            let parsed = format!("{}/{}", info.local, info.prefixlen).parse::<IpInterface>();
            match parsed {
                Ok(addr) => Some(addr),
                Err(e) => {
                    debug!("Skipping address {:?} (scope {:?}): {}", info.local, info.scope, e);
                    None
                }
            }
        })
        .collect()
}

/// All addresses currently configured on `interface`
pub async fn interface_addresses(interface: &str) -> PluginResult<Vec<IpInterface>> {
    validate_interface_name(interface)?;
    let argv: Vec<String> = ["ip", "-json", "addr", "show", "dev", interface]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let links: Vec<IpAddrShow> = check_output_json(&argv, Some(IP_COMMAND_TIMEOUT)).await?;
    Ok(parse_addresses(links))
}

/// First IPv4 and first non link-local IPv6 address
pub fn primary_of(addresses: &[IpInterface]) -> (Option<Ipv4Interface>, Option<Ipv6Interface>) {
    let ipv4 = addresses.iter().find_map(|addr| match addr {
        IpInterface::V4(v4) => Some(*v4),
        _ => None,
    });
    let ipv6 = addresses.iter().find_map(|addr| match addr {
        IpInterface::V6(v6) if v6.address.segments()[0] & 0xffc0 != 0xfe80 => Some(*v6),
        _ => None,
    });
    (ipv4, ipv6)
}

pub async fn primary_addresses(interface: &str) -> PluginResult<(Option<Ipv4Interface>, Option<Ipv6Interface>)> {
    Ok(primary_of(&interface_addresses(interface).await?))
}

/// Exists, is administratively up and carries at least one address
pub async fn is_interface_ready(interface: &str) -> bool {
    if !interface_exists(interface) || !is_interface_up(interface).await {
        return false;
    }
    match interface_addresses(interface).await {
        Ok(addresses) => !addresses.is_empty(),
        Err(e) => {
            debug!("Address lookup for {} failed: {}", interface, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_interface_name() {
        assert_eq!(valid_interface_name("my-vpn (home)"), "myvpnhome");
        assert_eq!(valid_interface_name("averyveryverylongname"), "averyveryverylo");
        assert_eq!(valid_interface_name("---"), FALLBACK_INTERFACE_NAME);
        assert_eq!(valid_interface_name("ünï"), "n");
    }

    #[test]
    fn test_validate_interface_name() {
        assert!(validate_interface_name("edge0").is_ok());
        assert!(validate_interface_name("tailscale-1").is_ok());
        assert!(validate_interface_name("").is_err());
        assert!(validate_interface_name("-flag").is_err());
        assert!(validate_interface_name("eth0; rm -rf").is_err());
        assert!(validate_interface_name("sixteencharsxxxx").is_err());
        assert!(validate_interface_name("..").is_err());
        assert!(validate_interface_name("a/b").is_err());
        assert!(validate_interface_name("wg.home").is_ok());
        match validate_interface_name("tun 0") {
            Err(PluginError::InvalidSettings(msg)) => {
                assert_eq!(msg, r#"Device name "tun 0" has characters outside [A-Za-z0-9_.-]"#)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_flags() {
        assert_eq!(parse_flags("0x1003\n"), Some(0x1003));
        assert_eq!(parse_flags("0x1002").map(|f| f & libc::IFF_UP as u32), Some(0));
        assert_eq!(parse_flags("garbage"), None);
    }

    #[test]
    fn test_parse_ip_json() {
        let raw = r#"[{"ifindex":7,"ifname":"edge0","addr_info":[
            {"family":"inet6","local":"fe80::1","prefixlen":64,"scope":"link"},
            {"family":"inet","local":"10.9.0.2","prefixlen":24,"scope":"global"},
            {"family":"inet6","local":"fd00::2","prefixlen":64,"scope":"global"},
            {"family":"inet","local":"10.9.0.3","prefixlen":24,"scope":"global"}]}]"#;
        let links: Vec<IpAddrShow> = serde_json::from_str(raw).unwrap();
        let addresses = parse_addresses(links);
        assert_eq!(addresses.len(), 4);

        let (v4, v6) = primary_of(&addresses);
        assert_eq!(v4.unwrap().address.to_string(), "10.9.0.2");
        assert_eq!(v6.unwrap().address.to_string(), "fd00::2");
    }

    #[tokio::test]
    async fn test_missing_interface_not_ready() {
        assert!(!interface_exists("nmvpn-none0"));
        assert!(!is_interface_ready("nmvpn-none0").await);
    }
}
