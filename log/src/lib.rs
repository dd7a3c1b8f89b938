//! Daemon logging for `warden`, inspired by OpenBSD's `log.c`.
//!
//! Every warden process — the privileged supervisor as well as the forked
//! workers — routes its diagnostics through a global [`slog`] logger that
//! either writes to stderr (foreground mode) or to syslog.  The supervisor
//! runs inside a tokio runtime and uses the [`Async`] drain; workers are
//! single-threaded poll loops and install the synchronous path right after
//! fork, so a crashing worker never loses its last lines to a channel.

use derive_more::{Display, From, Into};
use libc::openlog;
use serde_derive::{Deserialize, Serialize};
use slog::{Drain, Level, OwnedKVList, Record, KV};
use slog_scope::GlobalLoggerGuard;
use std::{
    ffi::{CStr, CString},
    fmt,
    io::{self, Write},
    pin::Pin,
    sync::{Mutex, Once},
};
use tokio::sync::mpsc;

/// Re-export the scoped logging macros.
pub use slog_scope::{crit, debug, error, info, trace, warn};

static LOG_BRIDGE: Once = Once::new();

/// Configuration for the logging crate.
#[derive(Debug, Default, Deserialize, Serialize, From)]
pub struct Config {
    /// Log to the foreground or to syslog (default: syslog).
    #[from(forward)]
    pub foreground: bool,
}

/// Logging errors.
#[derive(Debug, Display, From)]
pub enum Error {
    #[display(fmt = "{}", "_0")]
    NulError(std::ffi::NulError),
    #[display(fmt = "{}", "_0")]
    IoError(io::Error),
    #[display(fmt = "{}", "_0")]
    SendError(mpsc::error::SendError<Message>),
}

impl std::error::Error for Error {}

fn init(drain: Box<dyn Drain<Err = slog::Never, Ok = ()> + Send>) -> GlobalLoggerGuard {
    let drain = slog_envlogger::new(drain);

    // The mutex makes the boxed drain `UnwindSafe`.
    let drain = Mutex::new(drain.fuse());
    let logger = slog::Logger::root(drain.fuse(), slog::o!()).into_erased();

    let guard = slog_scope::set_global_logger(logger);
    LOG_BRIDGE.call_once(|| {
        let _ = slog_stdlog::init();
    });

    guard
}

/// Install a global logger whose target runs on a background tokio task.
///
/// Only valid inside a runtime; the supervisor uses this so that slow
/// syslog writes never stall signal dispatch or the message relay.
pub async fn async_logger<C: Into<Config>>(
    name: &str,
    config: C,
) -> Result<GlobalLoggerGuard, Error> {
    let config = config.into();

    let target: Box<dyn Target> = if config.foreground {
        Box::new(Stderr::new(name)?)
    } else {
        Box::new(Syslog::new(name)?)
    };

    let drain = Async::new(target).await;
    Ok(init(Box::new(drain.fuse())))
}

/// Install a global logger that writes from the calling thread.
///
/// This is the path for forked workers: no runtime, no channel, every
/// line is on its target before the call returns.
pub fn sync_logger<C: Into<Config>>(name: &str, config: C) -> Result<GlobalLoggerGuard, Error> {
    let config = config.into();

    let guard = if config.foreground {
        init(Box::new(Stderr::new(name)?.fuse()))
    } else {
        init(Box::new(Syslog::new(name)?.fuse()))
    };

    Ok(guard)
}

/// A log target that can be driven either inline or from the async drain.
pub trait Target: Send + Sync {
    fn new(name: &str) -> Result<Self, Error>
    where
        Self: Sized;
    fn log_str(&self, level: Level, line: &str) -> Result<(), Error>;
}

/// Foreground target that writes to stderr, prefixed with process name and pid.
pub struct Stderr {
    name: String,
    pid: u32,
}

impl Target for Stderr {
    fn new(name: &str) -> Result<Self, Error> {
        Ok(Self {
            name: name.to_string(),
            pid: std::process::id(),
        })
    }

    fn log_str(&self, _level: Level, line: &str) -> Result<(), Error> {
        let line = format!("{}[{}]: {}\n", self.name, self.pid, line);
        io::stderr().write_all(line.as_bytes()).map_err(Into::into)
    }
}

impl Drain for Stderr {
    type Ok = ();
    type Err = Error;

    fn log(&self, record: &Record<'_>, values: &OwnedKVList) -> Result<Self::Ok, Self::Err> {
        self.log_str(record.level(), &format_log(record, values))
    }
}

/// Background target that writes to syslog.
pub struct Syslog {
    /// syslog(3) keeps a pointer to the ident, so the string must outlive us.
    _ident: Pin<CString>,
}

impl Target for Syslog {
    fn new(name: &str) -> Result<Self, Error> {
        // "worker 1(1234)" → ident "worker 1"; syslog appends the pid itself.
        let ident = CString::new(&name[..name.find('(').unwrap_or(name.len())])?;
        let c_str: &CStr = ident.as_c_str();

        unsafe {
            openlog(
                c_str.as_ptr(),
                libc::LOG_PID | libc::LOG_NDELAY,
                libc::LOG_DAEMON,
            )
        };

        Ok(Self {
            _ident: Pin::new(ident),
        })
    }

    fn log_str(&self, level: Level, line: &str) -> Result<(), Error> {
        let c_line = CString::new(line.as_bytes())?;

        let priority = match level {
            Level::Critical => libc::LOG_CRIT,
            Level::Error => libc::LOG_ERR,
            Level::Warning => libc::LOG_WARNING,
            Level::Info => libc::LOG_NOTICE,
            Level::Debug | Level::Trace => libc::LOG_DEBUG,
        };

        unsafe {
            libc::syslog(priority, b"%s\0".as_ptr().cast(), c_line.as_ptr());
        }

        Ok(())
    }
}

impl Drop for Syslog {
    fn drop(&mut self) {
        unsafe {
            libc::closelog();
        }
    }
}

impl Drain for Syslog {
    type Ok = ();
    type Err = Error;

    fn log(&self, record: &Record<'_>, values: &OwnedKVList) -> Result<Self::Ok, Self::Err> {
        self.log_str(record.level(), &format_log(record, values))
    }
}

/// Drain that hands formatted lines to a background tokio task.
pub struct Async {
    sender: mpsc::UnboundedSender<Message>,
}

impl Async {
    pub async fn new(target: Box<dyn Target>) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Message>();

        tokio::spawn(async move {
            while let Some(Message::Entry(level, line)) = receiver.recv().await {
                let _ = target.log_str(level, &line);
            }
        });

        Self { sender }
    }
}

impl Drain for Async {
    type Ok = ();
    type Err = Error;

    fn log(&self, record: &Record<'_>, values: &OwnedKVList) -> Result<Self::Ok, Self::Err> {
        self.sender
            .send(Message::Entry(record.level(), format_log(record, values)))
            .map_err(Into::into)
    }
}

#[derive(Debug, Clone)]
pub enum Message {
    Entry(Level, String),
    Close,
}

/// Format the record and its key-value pairs into a single line.
#[inline]
fn format_log(record: &Record<'_>, values: &OwnedKVList) -> String {
    let mut formatter = Formatter::new(record);
    let _ = record.kv().serialize(record, &mut formatter);
    let _ = values.serialize(record, &mut formatter);
    formatter.into()
}

#[derive(Into)]
struct Formatter {
    #[into]
    buf: String,
}

impl Formatter {
    fn new(record: &Record<'_>) -> Self {
        let mut buf = format!("{}", record.msg());

        if record.level() >= Level::Debug {
            buf.push_str(&format!(
                ", source: {}:{}, module: {}",
                record.file(),
                record.line(),
                record.module()
            ));
        };

        Self { buf }
    }
}

impl slog::Serializer for Formatter {
    fn emit_arguments(&mut self, key: &str, val: &fmt::Arguments<'_>) -> slog::Result {
        self.buf.push_str(&format!(", {}: {}", key, val));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{info, sync_logger, warn};

    #[test]
    fn test_log_stderr() {
        let _guard = sync_logger("test", true).unwrap();

        info!("worker {} started (cpu#{}, pid#{})", 1, 0, 4242);
        warn!("short keymgr message ({})", 3);
    }
}
