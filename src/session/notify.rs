//! Outbound notification seam between the session and D-Bus

use super::state::Notification;
use crate::error::PluginResult;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Receives notifications in emission order
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: Notification) -> PluginResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    /// The user completes authentication in a browser
    WebLink,
}

/// Payload of a SecretsRequired message, rendered by the auth dialog
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthPrompt {
    pub auth_type: AuthType,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qr_image: Option<String>,
}

impl AuthPrompt {
    pub fn web_link(message: impl Into<String>) -> Self {
        Self {
            auth_type: AuthType::WebLink,
            message: message.into(),
            qr_image: None,
        }
    }

    /// Base64 PNG shown next to the message
    pub fn with_qr_image(mut self, png_base64: impl Into<String>) -> Self {
        self.qr_image = Some(png_base64.into());
        self
    }
}

/// Secret names sent along with a prompt; NetworkManager requires at least one
pub const PROMPT_SECRETS: &[&str] = &["__dummy__"];

/// Lets a controller ask the user for interaction while starting
#[derive(Clone)]
pub struct AuthPrompter {
    sink: Arc<dyn NotificationSink>,
}

impl AuthPrompter {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self { sink }
    }

    pub fn build(prompt: &AuthPrompt, secrets: &[&str]) -> PluginResult<Notification> {
        Ok(Notification::SecretsRequired {
            message: serde_json::to_string(prompt)?,
            secrets: secrets.iter().map(|s| s.to_string()).collect(),
        })
    }

    /// Emit SecretsRequired. Failures are logged, the start continues.
    pub async fn prompt(&self, prompt: &AuthPrompt) {
        info!("Prompting for authentication: {}", prompt.message);
        let notification = match Self::build(prompt, PROMPT_SECRETS) {
            Ok(notification) => notification,
            Err(e) => {
                warn!("Could not encode auth prompt: {}", e);
                return;
            }
        };
        if let Err(e) = self.sink.notify(notification).await {
            warn!("Could not emit auth prompt: {}", e);
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use tokio::sync::mpsc;

    /// Collects notifications for assertions
    pub struct ChannelSink(pub mpsc::UnboundedSender<Notification>);

    #[async_trait]
    impl NotificationSink for ChannelSink {
        async fn notify(&self, notification: Notification) -> PluginResult<()> {
            let _ = self.0.send(notification);
            Ok(())
        }
    }

    pub fn channel_sink() -> (Arc<dyn NotificationSink>, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(ChannelSink(tx)), rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compact_json() {
        let prompt = AuthPrompt::web_link("Open https://login.example/abc");
        match AuthPrompter::build(&prompt, PROMPT_SECRETS).unwrap() {
            Notification::SecretsRequired { message, secrets } => {
                assert_eq!(message, r#"{"auth_type":"web_link","message":"Open https://login.example/abc"}"#);
                assert_eq!(secrets, vec!["__dummy__"]);
            }
            other => panic!("unexpected {:?}", other),
        }

        let with_qr = AuthPrompt::web_link("scan").with_qr_image("iVBOR");
        let json = serde_json::to_string(&with_qr).unwrap();
        assert_eq!(json, r#"{"auth_type":"web_link","message":"scan","qr_image":"iVBOR"}"#);
    }

    #[tokio::test]
    async fn test_prompt_reaches_sink() {
        let (sink, mut rx) = testing::channel_sink();
        AuthPrompter::new(sink).prompt(&AuthPrompt::web_link("hi")).await;
        assert!(matches!(rx.recv().await, Some(Notification::SecretsRequired { .. })));
    }
}
