//! Polling until an external condition holds

use super::deadline::Deadline;
use super::supervisor::SupervisedProcess;
use crate::error::{PluginError, PluginResult};
use crate::interface;
use std::future::Future;
use std::os::unix::fs::FileTypeExt;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// Poll `predicate` every `interval` until it holds.
///
/// Fails with `PrematureExit` as soon as the optional supervised process has
/// died, and with a `Timeout` carrying `label` once `timeout` has elapsed.
pub async fn wait_until_ready<F, Fut>(
    mut predicate: F,
    mut process: Option<&mut SupervisedProcess>,
    interval: Duration,
    timeout: Option<Duration>,
    label: &str,
) -> PluginResult<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let mut deadline = Deadline::new(timeout).with_description(label);
    deadline.start()?;

    loop {
        if predicate().await {
            debug!("{}: ready after {:?}", label, deadline.elapsed()?);
            return Ok(());
        }
        if let Some(process) = process.as_deref_mut() {
            if !process.is_running() {
                return Err(PluginError::PrematureExit {
                    name: process.name().to_string(),
                    code: process.exit_code(),
                });
            }
        }
        deadline.sleep(interval).await?;
    }
}

/// Observable condition that tells whether a controller's tunnel is up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// A network interface exists, is up and has an address
    Interface(String),
    /// A daemon control socket exists
    Socket(PathBuf),
}

impl Readiness {
    pub async fn check(&self) -> bool {
        match self {
            Readiness::Interface(dev) => interface::is_interface_ready(dev).await,
            Readiness::Socket(path) => socket_exists(path).await,
        }
    }

    pub fn label(&self) -> String {
        match self {
            Readiness::Interface(dev) => format!("Wait for interface: {}", dev),
            Readiness::Socket(path) => format!("Wait for socket: {}", path.display()),
        }
    }
}

pub async fn socket_exists(path: &std::path::Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.file_type().is_socket())
        .unwrap_or(false)
}
