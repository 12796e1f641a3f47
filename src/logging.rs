//! Logging setup
//!
//! `RUST_LOG` wins when set. Otherwise the level comes from the environment
//! NetworkManager gives plugin services (`NM_VPN_DEV_MODE`,
//! `NM_VPN_LOG_LEVEL`), and `NM_VPN_LOG_SYSLOG=1` sends everything to syslog.

use std::ffi::CString;
use std::io::{self, Write};
use tracing::{Level, Metadata};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: Level,
    pub syslog: bool,
}

fn env_is_true(value: Option<String>) -> bool {
    value.is_some_and(|v| matches!(v.to_ascii_lowercase().as_str(), "true" | "1"))
}

impl LogSettings {
    pub fn from_vars(dev_mode: Option<String>, log_level: Option<String>, syslog: Option<String>) -> Self {
        let verbose = log_level.and_then(|v| v.trim().parse::<i32>().ok()).is_some_and(|v| v > 1);
        let level = if env_is_true(dev_mode) || verbose {
            Level::DEBUG
        } else {
            Level::INFO
        };
        Self {
            level,
            syslog: syslog.as_deref() == Some("1"),
        }
    }

    pub fn from_env() -> Self {
        Self::from_vars(
            std::env::var("NM_VPN_DEV_MODE").ok(),
            std::env::var("NM_VPN_LOG_LEVEL").ok(),
            std::env::var("NM_VPN_LOG_SYSLOG").ok(),
        )
    }
}

/// Install the global subscriber for `provider`
pub fn init_logging(provider: &str, settings: &LogSettings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.level.to_string().to_lowercase()));

    if settings.syslog {
        match Syslog::open(&format!("nm-vpn-{}", provider)) {
            Ok(syslog) => {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(syslog)
                    .with_ansi(false)
                    .without_time()
                    .with_target(false)
                    .init();
                return;
            }
            Err(e) => eprintln!("syslog unavailable, logging to stderr: {}", e),
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .init();
}

/// Writer factory backed by `syslog(3)`
pub struct Syslog {
    // openlog keeps the pointer, so the ident lives as long as the subscriber
    _ident: CString,
}

impl Syslog {
    pub fn open(ident: &str) -> io::Result<Self> {
        let ident = CString::new(ident).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        unsafe { libc::openlog(ident.as_ptr(), libc::LOG_PID, libc::LOG_DAEMON) };
        Ok(Self { _ident: ident })
    }
}

fn priority(level: &Level) -> libc::c_int {
    match *level {
        Level::ERROR => libc::LOG_ERR,
        Level::WARN => libc::LOG_WARNING,
        Level::INFO => libc::LOG_INFO,
        Level::DEBUG | Level::TRACE => libc::LOG_DEBUG,
    }
}

impl<'a> MakeWriter<'a> for Syslog {
    type Writer = SyslogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SyslogWriter::new(libc::LOG_INFO)
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        SyslogWriter::new(priority(meta.level()))
    }
}

/// Buffers one formatted event and submits it on drop
pub struct SyslogWriter {
    priority: libc::c_int,
    buf: Vec<u8>,
}

impl SyslogWriter {
    fn new(priority: libc::c_int) -> Self {
        Self { priority, buf: Vec::new() }
    }

    fn message(&self) -> Option<CString> {
        let text: Vec<u8> = self.buf.iter().copied().filter(|b| *b != 0).collect();
        let text = String::from_utf8_lossy(&text);
        let text = text.trim_end();
        if text.is_empty() {
            None
        } else {
            CString::new(text).ok()
        }
    }
}

impl Write for SyslogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for SyslogWriter {
    fn drop(&mut self) {
        if let Some(message) = self.message() {
            unsafe { libc::syslog(self.priority, c"%s".as_ptr(), message.as_ptr()) };
        }
    }
}

/// Set the kernel thread name shown by `ps`/`top` (truncated to 15 bytes)
pub fn set_process_name(name: &str) -> io::Result<()> {
    let truncated: Vec<u8> = name.bytes().filter(|b| *b != 0).take(15).collect();
    let name = CString::new(truncated).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let ret = unsafe { libc::prctl(libc::PR_SET_NAME, name.as_ptr() as libc::c_ulong, 0, 0, 0) };
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}
