//! Plugin service root
//!
//! Connects to the bus, exports the VPN plugin object and owns the single
//! connection session for the lifetime of the process.

use super::plugin::{DbusNotifier, VpnPlugin, VPN_PLUGIN_INTERFACE};
use crate::config::{BusKind, ServiceConfig};
use crate::error::PluginResult;
use crate::provider::{ControllerContext, ProviderRegistry};
use crate::session::notify::{AuthPrompter, NotificationSink};
use crate::session::Session;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{error, info, warn};
use zbus::Connection;

pub struct PluginService {
    config: ServiceConfig,
    connection: Connection,
    session: Arc<Session>,
    quit: Arc<Notify>,
}

impl PluginService {
    /// Create the provider's controller, export the plugin object and claim the bus name
    pub async fn start(config: ServiceConfig, registry: &ProviderRegistry) -> PluginResult<Self> {
        let controller = registry.create(&config.provider)?;

        let connection = match config.bus {
            BusKind::System => Connection::system().await?,
            BusKind::Session => Connection::session().await?,
        };

        let sink: Arc<dyn NotificationSink> = Arc::new(DbusNotifier::new(connection.clone(), config.object_path.as_str()));
        let context = ControllerContext {
            state_base_dir: config.state_base_dir.clone(),
            runtime_dir: config.runtime_dir.clone(),
            graceful_exit_timeout: config.graceful_exit_timeout,
            prompter: AuthPrompter::new(Arc::clone(&sink)),
        };
        let session = Arc::new(Session::new(controller, context, sink));
        let quit = Arc::new(Notify::new());

        connection
            .object_server()
            .at(
                config.object_path.as_str(),
                VpnPlugin::new(Arc::clone(&session), Arc::clone(&quit)),
            )
            .await?;
        info!("Registered {} at {}", VPN_PLUGIN_INTERFACE, config.object_path);

        connection.request_name(config.bus_name.as_str()).await?;
        info!("Acquired D-Bus name {} on the {:?} bus", config.bus_name, config.bus);

        Ok(Self {
            config,
            connection,
            session,
            quit,
        })
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Resolves once Disconnect has been handled
    pub async fn quit_requested(&self) {
        self.quit.notified().await
    }

    /// Stop the session's controller and release the bus name
    pub async fn shutdown(&self) -> PluginResult<()> {
        info!("Shutting down {}", self.config.bus_name);
        if let Err(e) = self.session.disconnect().await {
            error!("Stopping session failed: {}", e);
        }
        if let Err(e) = self.connection.release_name(self.config.bus_name.as_str()).await {
            warn!("Could not release {}: {}", self.config.bus_name, e);
        }
        Ok(())
    }
}
