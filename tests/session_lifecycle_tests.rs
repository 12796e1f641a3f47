//! Session lifecycle against a real child process
//!
//! A minimal controller runs `sleep` under supervision, so connect and
//! disconnect go through the same process handling as the real providers.

use async_trait::async_trait;
use libnmvpn::error::{PluginError, PluginResult};
use libnmvpn::process::{Readiness, Redirect, SupervisedProcess};
use libnmvpn::provider::ControllerContext;
use libnmvpn::session::notify::{AuthPrompter, NotificationSink};
use libnmvpn::session::state::Notification;
use libnmvpn::{ConnectionController, Ipv4Interface, ConnectionResult, ServiceState, Session, StartRequest};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

struct Recorder(mpsc::UnboundedSender<Notification>);

#[async_trait]
impl NotificationSink for Recorder {
    async fn notify(&self, notification: Notification) -> PluginResult<()> {
        let _ = self.0.send(notification);
        Ok(())
    }
}

/// Runs `argv` and reports a fixed address once it has stayed alive for `settle`
struct SleepController {
    argv: Vec<String>,
    settle: Duration,
    spawned: Arc<Mutex<Option<u32>>>,
    process: Option<SupervisedProcess>,
}

impl SleepController {
    fn new(argv: &[&str]) -> Self {
        Self {
            argv: argv.iter().map(|s| s.to_string()).collect(),
            settle: Duration::from_millis(100),
            spawned: Arc::new(Mutex::new(None)),
            process: None,
        }
    }

    fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Pid of the child once it was spawned
    fn spawned(&self) -> Arc<Mutex<Option<u32>>> {
        Arc::clone(&self.spawned)
    }
}

fn process_exists(pid: u32) -> bool {
    std::path::Path::new(&format!("/proc/{}", pid)).exists()
}

#[async_trait]
impl ConnectionController for SleepController {
    fn name(&self) -> &'static str {
        "sleep"
    }

    async fn start(&mut self, _request: &StartRequest, _ctx: &ControllerContext) -> PluginResult<ConnectionResult> {
        let process = self.process.insert(SupervisedProcess::spawn(
            &self.argv,
            Some("sleeper"),
            Redirect::Null,
            Redirect::Null,
        )?);
        if let Ok(mut spawned) = self.spawned.lock() {
            *spawned = process.pid();
        }
        tokio::time::sleep(self.settle).await;
        if !process.is_running() {
            return Err(PluginError::PrematureExit {
                name: process.name().to_string(),
                code: process.exit_code(),
            });
        }
        Ok(ConnectionResult::new(Ipv4Addr::BROADCAST)
            .with_device("sleep0")
            .with_addresses(Some(Ipv4Interface::new(Ipv4Addr::new(10, 99, 0, 2), 24)?), None))
    }

    async fn stop(&mut self) -> PluginResult<()> {
        if let Some(mut process) = self.process.take() {
            process.graceful_stop(Duration::from_secs(2)).await?;
        }
        Ok(())
    }

    fn readiness(&self) -> Option<Readiness> {
        None
    }
}

fn session(controller: SleepController) -> (Arc<Session>, mpsc::UnboundedReceiver<Notification>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sink: Arc<dyn NotificationSink> = Arc::new(Recorder(tx));
    let context = ControllerContext {
        state_base_dir: std::env::temp_dir(),
        runtime_dir: std::env::temp_dir(),
        graceful_exit_timeout: Duration::from_secs(2),
        prompter: AuthPrompter::new(Arc::clone(&sink)),
    };
    (Arc::new(Session::new(Box::new(controller), context, sink)), rx)
}

async fn wait_for(session: &Session, state: ServiceState) {
    for _ in 0..300 {
        if session.state().await == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session never reached {}", state);
}

fn states(rx: &mut mpsc::UnboundedReceiver<Notification>) -> Vec<String> {
    let mut names = Vec::new();
    while let Ok(notification) = rx.try_recv() {
        names.push(match notification {
            Notification::StateChanged(state) => state.to_string(),
            other => other.signal_name().to_string(),
        });
    }
    names
}

#[tokio::test]
async fn test_connect_then_disconnect() {
    let (session, mut rx) = session(SleepController::new(&["sleep", "30"]));

    session.connect(StartRequest::default()).await.unwrap();
    wait_for(&session, ServiceState::Started).await;
    session.disconnect().await.unwrap();

    assert_eq!(session.state().await, ServiceState::Stopped);
    assert_eq!(
        states(&mut rx),
        ["starting(3)", "Config", "Ip4Config", "started(4)", "stopping(5)", "stopped(6)"]
    );
}

#[tokio::test]
async fn test_daemon_dying_fails_the_connect() {
    let (session, mut rx) = session(SleepController::new(&["false"]));

    session.connect(StartRequest::default()).await.unwrap();
    wait_for(&session, ServiceState::Stopped).await;

    assert_eq!(states(&mut rx), ["starting(3)", "Failure", "stopping(5)", "stopped(6)"]);
    assert!(!session.is_connecting());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disconnect_while_starting() {
    let controller = SleepController::new(&["sleep", "30"]).with_settle(Duration::from_secs(20));
    let spawned = controller.spawned();
    let (session, mut rx) = session(controller);

    session.connect(StartRequest::default()).await.unwrap();
    let mut pid = None;
    for _ in 0..300 {
        pid = *spawned.lock().unwrap();
        if pid.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let pid = pid.expect("controller never spawned its child");
    assert!(process_exists(pid));
    assert_eq!(session.state().await, ServiceState::Starting);

    tokio::time::timeout(Duration::from_secs(5), session.disconnect())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(session.state().await, ServiceState::Stopped);
    assert!(!process_exists(pid));
    assert_eq!(states(&mut rx), ["starting(3)", "stopping(5)", "stopped(6)"]);
    assert!(!session.is_connecting());
}
