use derive_more::{Display, From};
use std::io;

/// Common errors.
#[derive(Debug, Display, From)]
pub enum Error {
    #[display(fmt = "I/O error: {}", "_0")]
    IoError(io::Error),
    #[display(fmt = "{}", "_0")]
    UnixError(nix::Error),
    #[display(fmt = "Permission denied, must run as root")]
    PermissionDenied,
    #[display(fmt = "{:?}", "_0")]
    Error(&'static str),
    #[display(fmt = "Invalid configuration: {}", "_0")]
    #[from(ignore)]
    Config(String),
    #[display(fmt = "Username '{}' for dropping privileges not found", "_0")]
    #[from(ignore)]
    UserNotFound(String),
    #[display(fmt = "Failed to drop privileges ({}) - {}", "_0", "_1")]
    Privdrop(&'static str, Box<dyn std::error::Error + Send + Sync>),
    #[display(fmt = "Sandbox setup failed: {}", "_0")]
    #[from(ignore)]
    Sandbox(String),
    #[display(fmt = "short write on control channel")]
    ShortWrite,
    #[display(fmt = "control channel closed by peer")]
    ChannelClosed,
    #[display(fmt = "{}", "_0")]
    Log(warden_log::Error),
}

impl std::error::Error for Error {}
