//! Supervision of long-running child processes
//!
//! A [`SupervisedProcess`] owns its child. Stopping is graceful: SIGTERM,
//! a bounded wait, then SIGKILL and an unbounded wait for the zombie.

use crate::error::{PluginError, PluginResult};
use chrono::{DateTime, Local};
use std::fmt;
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{debug, error, info, warn};

/// Default wait between SIGTERM and SIGKILL
pub const DEFAULT_GRACEFUL_EXIT_TIMEOUT: Duration = Duration::from_secs(3);

/// Where a standard stream of the child goes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Redirect {
    #[default]
    Inherit,
    Null,
    Piped,
    /// Output is truncated into this file; as stdin the file is read
    File(PathBuf),
}

impl Redirect {
    fn stdio(&self, writable: bool) -> io::Result<Stdio> {
        Ok(match self {
            Redirect::Inherit => Stdio::inherit(),
            Redirect::Null => Stdio::null(),
            Redirect::Piped => Stdio::piped(),
            Redirect::File(path) if writable => Stdio::from(File::create(path)?),
            Redirect::File(path) => Stdio::from(File::open(path)?),
        })
    }
}

/// Stream setup for [`SupervisedProcess::spawn_with`]
#[derive(Debug, Clone, Default)]
pub struct StdioConfig {
    pub stdin: Redirect,
    pub stdout: Redirect,
    pub stderr: Redirect,
}

impl StdioConfig {
    pub fn piped() -> Self {
        Self {
            stdin: Redirect::Piped,
            stdout: Redirect::Piped,
            stderr: Redirect::Piped,
        }
    }
}

/// A spawned child together with its bookkeeping
pub struct SupervisedProcess {
    name: String,
    argv: Vec<String>,
    child: Child,
    pid: Option<u32>,
    started_at: DateTime<Local>,
    exit_status: Option<ExitStatus>,
    gracefully_killed: bool,
}

impl SupervisedProcess {
    /// Spawn `argv` with stdin closed and the given output redirections.
    ///
    /// `name` defaults to the program path.
    pub fn spawn(
        argv: &[String],
        name: Option<&str>,
        stdout: Redirect,
        stderr: Redirect,
    ) -> PluginResult<Self> {
        let stdio = StdioConfig {
            stdin: Redirect::Null,
            stdout,
            stderr,
        };
        Self::spawn_with(argv, name, &stdio)
    }

    pub fn spawn_with(argv: &[String], name: Option<&str>, stdio: &StdioConfig) -> PluginResult<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| PluginError::InvalidSettings("Empty command line".to_string()))?;
        let name = name.unwrap_or(program).to_string();

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(stdio.stdin.stdio(false)?)
            .stdout(stdio.stdout.stdio(true)?)
            .stderr(stdio.stderr.stdio(true)?)
            .kill_on_drop(true);

        debug!("Spawning {}: {:?}", name, argv);
        let child = cmd.spawn().map_err(|e| {
            PluginError::Io(io::Error::new(e.kind(), format!("Failed to spawn {}: {}", program, e)))
        })?;

        let process = Self {
            name,
            argv: argv.to_vec(),
            pid: child.id(),
            child,
            started_at: Local::now(),
            exit_status: None,
            gracefully_killed: false,
        };
        info!("Started {}", process);
        Ok(process)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }

    /// Set once a graceful stop has completed
    pub fn gracefully_killed(&self) -> bool {
        self.gracefully_killed
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_status.and_then(|s| s.code())
    }

    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.child.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Non-blocking liveness check; reaps the child if it has exited
    pub fn is_running(&mut self) -> bool {
        if self.exit_status.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit_status = Some(status);
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!("Could not poll {}: {}", self.name, e);
                false
            }
        }
    }

    /// Wait for the child to exit. Cancel safe.
    pub async fn wait(&mut self) -> PluginResult<ExitStatus> {
        if let Some(status) = self.exit_status {
            return Ok(status);
        }
        let status = self.child.wait().await?;
        self.exit_status = Some(status);
        Ok(status)
    }

    fn send_signal(&self, signal: libc::c_int) -> io::Result<()> {
        let pid = self
            .pid
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "process has no pid"))?;
        let ret = unsafe { libc::kill(pid as libc::pid_t, signal) };
        if ret == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    async fn force_kill(&mut self) -> io::Result<ExitStatus> {
        self.child.start_kill()?;
        self.child.wait().await
    }

    /// Terminate the child, escalating to SIGKILL after `timeout`.
    ///
    /// An already exited child is only reported, no signal is sent.
    pub async fn graceful_stop(&mut self, timeout: Duration) -> PluginResult<Option<i32>> {
        if !self.is_running() {
            warn!("Process already exited {}", self);
            return Ok(self.exit_code());
        }

        warn!("Terminating {}", self);
        if let Err(e) = self.send_signal(libc::SIGTERM) {
            warn!("SIGTERM to {} failed: {}", self.name, e);
        }

        let result = match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => Ok(status),
            Ok(Err(e)) => {
                error!("Waiting for {} failed: {}", self.name, e);
                self.force_kill().await
            }
            Err(_) => {
                warn!("{} ignored SIGTERM for {:?}, sending SIGKILL", self.name, timeout);
                self.force_kill().await
            }
        };

        self.gracefully_killed = true;
        let status = result?;
        self.exit_status = Some(status);
        warn!("Exited {}", self);
        Ok(status.code())
    }
}

impl fmt::Display for SupervisedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}", self.name)?;
        if let Some(pid) = self.pid {
            write!(f, " pid={}", pid)?;
        }
        write!(f, " started={}", self.started_at.format("%H:%M:%S"))?;
        match self.exit_status {
            Some(status) => write!(f, " exit={}>", status),
            None => write!(f, " running>"),
        }
    }
}

impl fmt::Debug for SupervisedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupervisedProcess")
            .field("name", &self.name)
            .field("argv", &self.argv)
            .field("pid", &self.pid)
            .field("exit_status", &self.exit_status)
            .field("gracefully_killed", &self.gracefully_killed)
            .finish()
    }
}
