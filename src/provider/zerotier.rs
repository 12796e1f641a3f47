//! ZeroTier controller
//!
//! Joins a network through the local `zerotier-one` service and polls its
//! network list until the member is authorized and configured.

use super::backend::{ConnectionController, ConnectionResult, ControllerContext, StartRequest};
use super::common::{Settings, DUMMY_GATEWAY};
use crate::error::{PluginError, PluginResult};
use crate::net;
use crate::process::{check_output_json, check_output_text, Deadline, Readiness};
use crate::session::notify::AuthPrompt;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const PROVIDER: &str = "zerotier";

pub const CENTRAL_API_URL: &str = "https://my.zerotier.com/api/v1";
const CENTRAL_WEB_URL: &str = "https://my.zerotier.com";
const DEFAULT_PRIMARY_PORT: u16 = 9993;
const DEFAULT_WORKING_DIRECTORY: &str = "/var/lib/zerotier-one";
const CLI_TIMEOUT: Duration = Duration::from_secs(30);
const JOIN_TIMEOUT: Duration = Duration::from_secs(30);
const STATUS_CHECK_INTERVAL: Duration = Duration::from_secs(2);
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DnsConfig {
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub servers: Vec<String>,
}

/// One entry of `zerotier-one -q -j listnetworks`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkState {
    pub id: String,
    /// `REQUESTING_CONFIGURATION`, `ACCESS_DENIED`, `OK`, ...
    pub status: String,
    #[serde(default)]
    pub assigned_addresses: Vec<String>,
    pub mtu: Option<u32>,
    pub port_device_name: Option<String>,
    #[serde(default)]
    pub dns: DnsConfig,
}

impl NetworkState {
    pub fn is_ok(&self) -> bool {
        self.status == "OK"
    }

    pub fn is_access_denied(&self) -> bool {
        self.status == "ACCESS_DENIED"
    }
}

/// `zerotier-one -q -j info`
#[derive(Debug, Clone, Deserialize)]
pub struct NodeInfo {
    pub address: String,
    #[serde(default)]
    pub online: bool,
}

/// The `zerotier-one -q` control client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZerotierCli {
    service: String,
    base: Vec<String>,
}

impl ZerotierCli {
    pub fn from_settings(settings: &Settings) -> PluginResult<Self> {
        let service = settings.get_or("zerotier-bin", "zerotier-one").to_string();
        let port = settings.parse::<u16>("primary-port")?.unwrap_or(DEFAULT_PRIMARY_PORT);
        let work_dir = settings.get_or("service-working-directory", DEFAULT_WORKING_DIRECTORY);
        let base = vec![
            service.clone(),
            "-q".to_string(),
            format!("-D{}", work_dir),
            format!("-p{}", port),
        ];
        Ok(Self { service, base })
    }

    pub fn command(&self, args: &[&str]) -> Vec<String> {
        let mut cmd = self.base.clone();
        cmd.push("-j".to_string());
        cmd.extend(args.iter().map(|a| a.to_string()));
        cmd
    }

    async fn call<T: DeserializeOwned>(&self, args: &[&str]) -> PluginResult<T> {
        check_output_json(&self.command(args), Some(CLI_TIMEOUT)).await
    }

    pub async fn version(&self) -> PluginResult<String> {
        let argv = [self.service.clone(), "-v".to_string()];
        Ok(check_output_text(&argv, Some(CLI_TIMEOUT)).await?.trim().to_string())
    }

    pub async fn join(&self, network_id: &str) -> PluginResult<NetworkState> {
        self.call(&["join", network_id]).await
    }

    pub async fn leave(&self, network_id: &str) -> PluginResult<serde_json::Value> {
        self.call(&["leave", network_id]).await
    }

    pub async fn info(&self) -> PluginResult<NodeInfo> {
        self.call(&["info"]).await
    }

    pub async fn list_networks(&self) -> PluginResult<Vec<NetworkState>> {
        self.call(&["listnetworks"]).await
    }

    pub async fn network_state(&self, network_id: &str) -> PluginResult<Option<NetworkState>> {
        Ok(self.list_networks().await?.into_iter().find(|n| n.id == network_id))
    }
}

/// Minimal ZeroTier Central client used to self-authorize a member
pub struct CentralApi {
    client: Client,
    base_url: String,
}

impl CentralApi {
    pub fn new(base_url: impl Into<String>) -> PluginResult<Self> {
        let client = Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    pub fn member_url(&self, network_id: &str, member_id: &str) -> String {
        format!("{}/network/{}/member/{}", self.base_url, network_id, member_id)
    }

    pub async fn authorize_member(
        &self,
        network_id: &str,
        member_id: &str,
        api_token: &str,
    ) -> PluginResult<serde_json::Value> {
        let response = self
            .client
            .post(self.member_url(network_id, member_id))
            .header("Authorization", format!("Bearer {}", api_token))
            .json(&serde_json::json!({ "hidden": false, "config": { "authorized": true } }))
            .send()
            .await?;
        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(PluginError::LoginFailed(format!(
                "ZeroTier Central rejected the API token ({})",
                response.status()
            ))),
            _ => Ok(response.error_for_status()?.json().await?),
        }
    }
}

pub fn member_prompt(network_id: &str, member_id: &str) -> AuthPrompt {
    let page_url = format!("{}/network/{}", CENTRAL_WEB_URL, network_id);
    AuthPrompt::web_link(format!(
        "<b>Please authorize member <i>{member}</i><br>visit: <i><a href=\"{url}\">{url}</a></i></br>",
        member = member_id,
        url = page_url
    ))
}

/// Build the connection result from a configured network
pub fn network_result(state: &NetworkState) -> PluginResult<ConnectionResult> {
    let (ipv4, ipv6) = net::addresses_by_family(&state.assigned_addresses)?;
    let mut result = ConnectionResult::new(DUMMY_GATEWAY)
        .with_addresses(ipv4, ipv6)
        .with_mtu(state.mtu);
    if let Some(dev) = state.port_device_name.as_deref().filter(|d| !d.is_empty()) {
        result = result.with_device(dev);
    }
    Ok(result)
}

#[derive(Default)]
pub struct ZerotierController {
    cli: Option<ZerotierCli>,
    network_id: Option<String>,
    dev: Option<String>,
}

pub fn create_controller() -> Box<dyn ConnectionController> {
    Box::new(ZerotierController::default())
}

/// React to the first ACCESS_DENIED: self-authorize with an API token, or
/// ask the user to authorize the member on the network page.
async fn request_authorization(
    network_id: &str,
    member_id: &str,
    api_token: Option<&str>,
    ctx: &ControllerContext,
) -> PluginResult<()> {
    match api_token {
        Some(token) => {
            info!("Status is ACCESS_DENIED. Self authorize using given API token");
            let response = CentralApi::new(CENTRAL_API_URL)?
                .authorize_member(network_id, member_id, token)
                .await?;
            debug!("Self authorize API response: {}", response);
        }
        None => {
            info!("Status is ACCESS_DENIED. Asking the user to authorize {}", member_id);
            ctx.prompter.prompt(&member_prompt(network_id, member_id)).await;
        }
    }
    Ok(())
}

#[async_trait]
impl ConnectionController for ZerotierController {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    async fn start(&mut self, request: &StartRequest, ctx: &ControllerContext) -> PluginResult<ConnectionResult> {
        let settings = &request.settings;
        let network_id = settings.require("network-id")?.to_string();
        let api_token = settings.get("api-token");
        let cli = ZerotierCli::from_settings(settings)?;

        info!("Zerotier version: {}", cli.version().await?);
        let mut state = cli.join(&network_id).await?;
        self.cli = Some(cli.clone());
        self.network_id = Some(network_id.clone());
        info!("Join state: {}", state.status);

        let member = cli.info().await?;
        debug!("Member info: {:?}", member);

        let deadline = Deadline::started(JOIN_TIMEOUT, "wait for connection OK");
        let mut seen_access_denied = false;
        while !state.is_ok() {
            match cli.network_state(&network_id).await? {
                Some(current) => state = current,
                None => warn!("Network {} is not listed yet", network_id),
            }
            debug!("Waiting for status OK. current state: {}", state.status);
            if state.is_access_denied() && !seen_access_denied {
                seen_access_denied = true;
                request_authorization(&network_id, &member.address, api_token, ctx).await?;
            }
            if state.is_ok() {
                break;
            }
            deadline.sleep(STATUS_CHECK_INTERVAL).await?;
        }

        let result = network_result(&state)?;
        self.dev = result.device.clone();
        Ok(result)
    }

    async fn stop(&mut self) -> PluginResult<()> {
        if let (Some(cli), Some(network_id)) = (self.cli.take(), self.network_id.take()) {
            let response = cli.leave(&network_id).await?;
            debug!("Leave action response: {}", response);
        }
        Ok(())
    }

    fn readiness(&self) -> Option<Readiness> {
        self.dev.clone().map(Readiness::Interface)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureReason;
    use crate::provider::common::settings;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Answer one HTTP request with `status` and `body`; yields the raw request
    async fn serve_once(status: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}/api/v1", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let n = stream.read(&mut chunk).await.unwrap();
                request.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&request).to_string();
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text
                        .lines()
                        .find_map(|l| {
                            let (k, v) = l.split_once(':')?;
                            k.eq_ignore_ascii_case("content-length").then(|| v.trim().parse::<usize>().ok())?
                        })
                        .unwrap_or(0);
                    if request.len() >= end + 4 + length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.shutdown().await.unwrap();
            String::from_utf8_lossy(&request).to_string()
        });
        (base_url, server)
    }

    #[tokio::test]
    async fn test_authorize_member() {
        let (base_url, server) = serve_once("200 OK", r#"{"nodeId":"a1b2c3d4e5","config":{"authorized":true}}"#).await;
        let api = CentralApi::new(base_url).unwrap();

        let member = api
            .authorize_member("9e1948db634a83ee", "a1b2c3d4e5", "s3cret")
            .await
            .unwrap();
        assert_eq!(member["config"]["authorized"], serde_json::json!(true));

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /api/v1/network/9e1948db634a83ee/member/a1b2c3d4e5 HTTP/1.1"));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer s3cret"));
        assert!(request.contains(r#""authorized":true"#));
    }

    #[tokio::test]
    async fn test_rejected_token_is_login_failure() {
        for status in ["401 Unauthorized", "403 Forbidden"] {
            let (base_url, server) = serve_once(status, r#"{"message":"forbidden"}"#).await;
            let api = CentralApi::new(base_url).unwrap();

            let err = api.authorize_member("9e1948db634a83ee", "a1b2c3d4e5", "bad").await.unwrap_err();
            assert!(matches!(err, PluginError::LoginFailed(_)), "{:?}", err);
            assert_eq!(err.failure_reason(), FailureReason::LoginFailed);
            server.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_server_error_is_connect_failure() {
        let (base_url, server) = serve_once("500 Internal Server Error", "{}").await;
        let api = CentralApi::new(base_url).unwrap();

        let err = api.authorize_member("9e1948db634a83ee", "a1b2c3d4e5", "s3cret").await.unwrap_err();
        assert!(matches!(err, PluginError::Http(_)), "{:?}", err);
        assert_eq!(err.failure_reason(), FailureReason::ConnectFailed);
        server.await.unwrap();
    }

    const JOIN_OUTPUT: &str = r#"{"allowDNS":false,"allowDefault":false,"assignedAddresses":[],"bridge":false,
        "dns":{"domain":"","servers":[]},"id":"9e1948db634a83ee","mac":"ee:e6:cb:c8:76:41","mtu":2800,
        "name":"","nwid":"9e1948db634a83ee","portDeviceName":"ztiv5aewen","portError":0,"routes":[],
        "status":"REQUESTING_CONFIGURATION","type":"PRIVATE"}"#;

    #[test]
    fn test_cli_command() {
        let cli = ZerotierCli::from_settings(&settings(&[
            ("primary-port", "19993"),
            ("service-working-directory", "/tmp/zt"),
        ]))
        .unwrap();
        assert_eq!(cli.command(&["join", "abc"]), ["zerotier-one", "-q", "-D/tmp/zt", "-p19993", "-j", "join", "abc"]);

        let default = ZerotierCli::from_settings(&Settings::default()).unwrap();
        assert_eq!(default.command(&["info"])[2..4], ["-D/var/lib/zerotier-one", "-p9993"]);
        assert!(ZerotierCli::from_settings(&settings(&[("primary-port", "x")])).is_err());
    }

    #[test]
    fn test_decode_join_output() {
        let state: NetworkState = serde_json::from_str(JOIN_OUTPUT).unwrap();
        assert!(!state.is_ok());
        assert!(!state.is_access_denied());
        assert_eq!(state.port_device_name.as_deref(), Some("ztiv5aewen"));
        assert_eq!(state.mtu, Some(2800));
    }

    #[test]
    fn test_network_result() {
        let mut state: NetworkState = serde_json::from_str(JOIN_OUTPUT).unwrap();
        state.status = "OK".into();
        state.assigned_addresses = vec!["10.147.17.5/24".into(), "fd9e:1948:db63:4a83::1/88".into()];
        let result = network_result(&state).unwrap();
        assert_eq!(result.device.as_deref(), Some("ztiv5aewen"));
        assert_eq!(result.mtu, Some(2800));
        assert_eq!(result.gateway, DUMMY_GATEWAY);
        let ipv4 = result.ipv4.unwrap();
        assert_eq!((ipv4.address.to_string(), ipv4.prefix), ("10.147.17.5".to_string(), 24));
        assert_eq!(result.ipv6.unwrap().prefix, 88);
    }

    #[test]
    fn test_member_prompt() {
        let prompt = member_prompt("9e1948db634a83ee", "a1b2c3d4e5");
        assert_eq!(
            prompt.message,
            "<b>Please authorize member <i>a1b2c3d4e5</i><br>visit: <i><a href=\"https://my.zerotier.com/network/9e1948db634a83ee\">\
             https://my.zerotier.com/network/9e1948db634a83ee</a></i></br>"
        );
        assert!(prompt.qr_image.is_none());
    }

    #[test]
    fn test_member_url() {
        let api = CentralApi::new(CENTRAL_API_URL).unwrap();
        assert_eq!(
            api.member_url("nw", "m1"),
            "https://my.zerotier.com/api/v1/network/nw/member/m1"
        );
    }

    #[tokio::test]
    async fn test_missing_network_id() {
        let mut controller = ZerotierController::default();
        let (sink, _rx) = crate::session::notify::testing::channel_sink();
        let ctx = ControllerContext {
            state_base_dir: std::env::temp_dir(),
            runtime_dir: std::env::temp_dir(),
            graceful_exit_timeout: Duration::from_secs(1),
            prompter: crate::session::notify::AuthPrompter::new(sink),
        };
        let err = controller.start(&StartRequest::default(), &ctx).await.unwrap_err();
        assert!(matches!(err, PluginError::InvalidSettings(msg) if msg.contains("network-id")));
        controller.stop().await.unwrap();
    }
}
