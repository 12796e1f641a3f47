//! Bounded command execution
//!
//! Short-lived CLI calls (`ip -json`, `tailscale status`, `zerotier-one -q`)
//! run to completion under a timeout. [`BackgroundProcess`] covers the case
//! where the caller must consume output while the command is still running.

use super::supervisor::{Redirect, StdioConfig, SupervisedProcess, DEFAULT_GRACEFUL_EXIT_TIMEOUT};
use crate::error::{PluginError, PluginResult};
use serde::de::DeserializeOwned;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::ChildStdout;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long a caller waits for a background spawn to be confirmed
const SPAWN_CONFIRM_TIMEOUT: Duration = Duration::from_secs(1);

/// Extra bound on joining a background task after it was told to stop
const JOIN_GRACE: Duration = Duration::from_secs(1);

/// Captured result of a finished command
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// A command that is spawned immediately and then driven to completion
pub struct BoundedCommand {
    process: SupervisedProcess,
    graceful_exit_timeout: Duration,
}

async fn read_all<R: AsyncRead + Unpin>(reader: Option<R>) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        reader.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

impl BoundedCommand {
    pub fn spawn(argv: &[String]) -> PluginResult<Self> {
        Ok(Self {
            process: SupervisedProcess::spawn_with(argv, None, &StdioConfig::piped())?,
            graceful_exit_timeout: DEFAULT_GRACEFUL_EXIT_TIMEOUT,
        })
    }

    pub fn with_graceful_exit_timeout(mut self, timeout: Duration) -> Self {
        self.graceful_exit_timeout = timeout;
        self
    }

    pub fn process(&mut self) -> &mut SupervisedProcess {
        &mut self.process
    }

    fn command_line(&self) -> String {
        self.process.argv().join(" ")
    }

    async fn collect(&mut self, input: Option<&[u8]>) -> PluginResult<CommandOutput> {
        let stdin = self.process.take_stdin();
        let stdout = self.process.take_stdout();
        let stderr = self.process.take_stderr();

        let feed = async move {
            if let (Some(mut stdin), Some(input)) = (stdin, input) {
                match stdin.write_all(input).await {
                    Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => return Err(e),
                    _ => {}
                }
            }
            // stdin is dropped here so the child sees EOF
            Ok(())
        };
        let (_, stdout, stderr) = tokio::try_join!(feed, read_all(stdout), read_all(stderr))?;
        let status = self.process.wait().await?;
        Ok(CommandOutput { status, stdout, stderr })
    }

    /// Feed `input`, capture both output streams and wait for exit.
    ///
    /// On timeout the child is gracefully stopped before `Timeout` is returned.
    pub async fn run(&mut self, input: Option<&[u8]>, timeout: Option<Duration>) -> PluginResult<CommandOutput> {
        let output = match timeout {
            Some(limit) => match tokio::time::timeout(limit, self.collect(input)).await {
                Ok(output) => output?,
                Err(_) => {
                    warn!("'{}' did not finish within {:?}", self.command_line(), limit);
                    self.process.graceful_stop(self.graceful_exit_timeout).await?;
                    return Err(PluginError::Timeout(format!(
                        "After {}s: {}",
                        limit.as_secs_f64(),
                        self.command_line()
                    )));
                }
            },
            None => self.collect(input).await?,
        };

        if !output.status.success() {
            return Err(PluginError::CommandFailed {
                cmd: self.command_line(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                stdout: output.stdout,
            });
        }
        Ok(output)
    }
}

/// Run `argv` to completion and return its stdout
pub async fn check_output(argv: &[String], timeout: Option<Duration>) -> PluginResult<Vec<u8>> {
    let output = BoundedCommand::spawn(argv)?.run(None, timeout).await?;
    Ok(output.stdout)
}

/// Run `argv` and decode its stdout as JSON
pub async fn check_output_json<T: DeserializeOwned>(argv: &[String], timeout: Option<Duration>) -> PluginResult<T> {
    let raw = check_output(argv, timeout).await?;
    decode_json(&argv.join(" "), &raw)
}

/// Run `argv` and decode its stdout as UTF-8 text
pub async fn check_output_text(argv: &[String], timeout: Option<Duration>) -> PluginResult<String> {
    let raw = check_output(argv, timeout).await?;
    decode_text(&argv.join(" "), raw)
}

pub fn decode_json<T: DeserializeOwned>(cmd: &str, raw: &[u8]) -> PluginResult<T> {
    serde_json::from_slice(raw).map_err(|e| {
        error!("Invalid JSON from '{}': {:?}", cmd, String::from_utf8_lossy(raw));
        PluginError::DecodeFailed(format!("{}: {}", cmd, e))
    })
}

pub fn decode_text(cmd: &str, raw: Vec<u8>) -> PluginResult<String> {
    String::from_utf8(raw).map_err(|e| {
        error!("Invalid UTF-8 from '{}': {:?}", cmd, e.as_bytes());
        PluginError::DecodeFailed(format!("{}: {}", cmd, e.utf8_error()))
    })
}

/// How a background command ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackgroundExit {
    pub code: Option<i32>,
    pub gracefully_killed: bool,
}

/// A command supervised by its own task while the caller reads its stdout.
///
/// Call [`close`](Self::close) or [`wait`](Self::wait) to end it. Dropping the
/// handle instead only signals the detached task, which finishes the graceful
/// stop as long as the runtime keeps running; if the runtime shuts down first
/// the child is killed outright.
pub struct BackgroundProcess {
    name: String,
    pid: Option<u32>,
    stdout: BufReader<ChildStdout>,
    cancel: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<PluginResult<BackgroundExit>>>,
    graceful_exit_timeout: Duration,
}

type SpawnReport = PluginResult<(Option<u32>, ChildStdout)>;

async fn supervise(
    mut process: SupervisedProcess,
    timeout: Option<Duration>,
    cancel: oneshot::Receiver<()>,
    graceful_exit_timeout: Duration,
) -> PluginResult<BackgroundExit> {
    let expiry = async {
        match timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => futures::future::pending::<()>().await,
        }
    };

    tokio::select! {
        status = process.wait() => {
            let status = status?;
            debug!("{} exited on its own: {}", process.name(), status);
            return Ok(BackgroundExit { code: status.code(), gracefully_killed: false });
        }
        _ = cancel => {
            debug!("Stopping {} on request", process.name());
        }
        _ = expiry => {
            warn!("{} exceeded its {:?} timeout", process.name(), timeout);
        }
    }

    let code = process.graceful_stop(graceful_exit_timeout).await?;
    Ok(BackgroundExit {
        code,
        gracefully_killed: process.gracefully_killed(),
    })
}

impl BackgroundProcess {
    /// Spawn `argv` on a supervising task with stdout piped back to the caller.
    ///
    /// Spawn errors are reported here. The child is stopped when `timeout`
    /// elapses or the handle is closed.
    pub async fn spawn(
        argv: &[String],
        name: &str,
        timeout: Option<Duration>,
        graceful_exit_timeout: Duration,
    ) -> PluginResult<Self> {
        let (report_tx, report_rx) = oneshot::channel::<SpawnReport>();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let argv = argv.to_vec();
        let task_name = name.to_string();

        let task = tokio::spawn(async move {
            let mut process =
                match SupervisedProcess::spawn(&argv, Some(&task_name), Redirect::Piped, Redirect::Inherit) {
                    Ok(process) => process,
                    Err(e) => {
                        let _ = report_tx.send(Err(e));
                        return Err(PluginError::Provider(format!("{} was not started", task_name)));
                    }
                };
            match process.take_stdout() {
                Some(stdout) => {
                    let _ = report_tx.send(Ok((process.pid(), stdout)));
                }
                None => {
                    let _ = report_tx.send(Err(PluginError::InvalidState(format!("{} has no stdout", task_name))));
                }
            }
            supervise(process, timeout, cancel_rx, graceful_exit_timeout).await
        });

        let (pid, stdout) = match tokio::time::timeout(SPAWN_CONFIRM_TIMEOUT, report_rx).await {
            Ok(Ok(report)) => report?,
            Ok(Err(_)) => return Err(PluginError::Provider(format!("{} task ended before spawning", name))),
            Err(_) => {
                task.abort();
                return Err(PluginError::Timeout(format!("Spawn of {}", name)));
            }
        };
        info!("Running {} in background (pid {:?})", name, pid);

        Ok(Self {
            name: name.to_string(),
            pid,
            stdout: BufReader::new(stdout),
            cancel: Some(cancel_tx),
            task: Some(task),
            graceful_exit_timeout,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Next stdout line without its terminator; `None` at EOF
    pub async fn next_line(&mut self) -> PluginResult<Option<String>> {
        let mut buf = Vec::new();
        let read = self.stdout.read_until(b'\n', &mut buf).await?;
        if read == 0 {
            return Ok(None);
        }
        while matches!(buf.last(), Some(b'\n' | b'\r')) {
            buf.pop();
        }
        Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
    }

    async fn join(&mut self, bound: Option<Duration>) -> PluginResult<BackgroundExit> {
        let task = self
            .task
            .take()
            .ok_or_else(|| PluginError::InvalidState(format!("{} already joined", self.name)))?;
        let joined = match bound {
            Some(bound) => tokio::time::timeout(bound, task)
                .await
                .map_err(|_| PluginError::Timeout(format!("Join of {}", self.name)))?,
            None => task.await,
        };
        joined.map_err(|e| PluginError::Provider(format!("{} supervisor task failed: {}", self.name, e)))?
    }

    /// Wait for the child to exit by itself (or hit its own timeout)
    pub async fn wait(mut self) -> PluginResult<BackgroundExit> {
        self.join(None).await
    }

    /// Stop the child gracefully and join the supervising task
    pub async fn close(mut self) -> PluginResult<BackgroundExit> {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        let bound = self.graceful_exit_timeout + JOIN_GRACE;
        self.join(Some(bound)).await
    }
}

impl Drop for BackgroundProcess {
    fn drop(&mut self) {
        if self.task.is_some() {
            warn!("Background handle for {} dropped without close, stopping it detached", self.name);
        }
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }
}
