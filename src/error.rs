//! Error types for nmvpn

use std::io;
use thiserror::Error;

/// NetworkManager failure reason codes (`NMVpnPluginFailure`)
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// Login failed
    LoginFailed = 1,
    /// Connect failed
    ConnectFailed = 2,
    /// Invalid IP configuration returned from the VPN plugin
    BadIpConfig = 3,
}

impl From<FailureReason> for u32 {
    fn from(reason: FailureReason) -> Self {
        reason as u32
    }
}

#[derive(Debug, Error)]
pub enum PluginError {
    /// A deadline elapsed while waiting for an interface, socket or process
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A supervised process died before its readiness condition was met
    #[error("{name} exited prematurely (code: {code:?})")]
    PrematureExit { name: String, code: Option<i32> },

    /// A bounded command exited non-zero
    #[error("Command '{cmd}' failed with code {code:?}: {stderr}")]
    CommandFailed {
        cmd: String,
        code: Option<i32>,
        stdout: Vec<u8>,
        stderr: String,
    },

    /// Command output was not valid JSON / UTF-8
    #[error("Decode failed: {0}")]
    DecodeFailed(String),

    /// A provider setting is missing or malformed
    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    /// A connect attempt is already in flight
    #[error("Already connecting")]
    AlreadyConnecting,

    /// A controller still holds a live process handle at start time
    #[error("Already running: {0}")]
    AlreadyRunning(String),

    /// Operation not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Runtime failure reported by a provider
    #[error("{0}")]
    Provider(String),

    /// Authentication against the VPN service failed
    #[error("Login failed: {0}")]
    LoginFailed(String),

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("D-Bus error: {0}")]
    DBus(#[from] zbus::Error),
}

impl PluginError {
    /// Failures that are part of normal operation and are logged without
    /// a full debug dump.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            PluginError::Timeout(_)
                | PluginError::AlreadyConnecting
                | PluginError::PrematureExit { .. }
                | PluginError::InvalidSettings(_)
                | PluginError::Provider(_)
                | PluginError::LoginFailed(_)
        )
    }

    /// Coarse reason code reported to NetworkManager
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            PluginError::LoginFailed(_) => FailureReason::LoginFailed,
            _ => FailureReason::ConnectFailed,
        }
    }
}

impl From<serde_json::Error> for PluginError {
    fn from(error: serde_json::Error) -> Self {
        PluginError::DecodeFailed(error.to_string())
    }
}

impl From<zvariant::Error> for PluginError {
    fn from(error: zvariant::Error) -> Self {
        PluginError::InvalidSettings(format!("Malformed connection descriptor: {}", error))
    }
}

impl From<reqwest::Error> for PluginError {
    fn from(error: reqwest::Error) -> Self {
        PluginError::Http(error.to_string())
    }
}

impl From<PluginError> for zbus::fdo::Error {
    fn from(error: PluginError) -> Self {
        match error {
            PluginError::InvalidSettings(msg) => zbus::fdo::Error::InvalidArgs(msg),
            other => zbus::fdo::Error::Failed(other.to_string()),
        }
    }
}

pub type PluginResult<T> = Result<T, PluginError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_classification() {
        assert!(PluginError::Timeout("After 30s".into()).is_expected());
        assert!(PluginError::AlreadyConnecting.is_expected());
        assert!(PluginError::Provider("could not up tailscale".into()).is_expected());
        assert!(!PluginError::DecodeFailed("bad".into()).is_expected());
        assert!(!PluginError::Io(io::Error::other("boom")).is_expected());
    }

    #[test]
    fn test_failure_reason() {
        assert_eq!(
            PluginError::LoginFailed("denied".into()).failure_reason(),
            FailureReason::LoginFailed
        );
        assert_eq!(
            PluginError::Timeout("x".into()).failure_reason(),
            FailureReason::ConnectFailed
        );
        assert_eq!(u32::from(FailureReason::ConnectFailed), 2);
    }
}
