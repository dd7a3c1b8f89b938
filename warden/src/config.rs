//! Typed runtime configuration.
//!
//! The configuration language and its parser are external to this crate;
//! what arrives here is the deserialized [`Config`] the core consumes.
//! Defaults match the server's shipped behavior: pool size from the
//! detected CPU count, restart-on-crash policy, 512 connections and 768
//! descriptors per worker.

use crate::{Error, Result};
use serde_derive::Deserialize;
use std::{fs, path::Path, path::PathBuf};

/// What the supervisor does when a network worker dies uncleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerPolicy {
    /// Re-spawn the slot with the same id and cpu.
    #[default]
    Restart,
    /// Tear the whole server down on the first crash.
    Terminate,
}

/// A listener the server will accept connections on.
///
/// Binding and connection handling live in the listener subsystem; the
/// core only needs to know how many listeners exist (no listeners means
/// no accept arbitration at all).
#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    pub addr: String,
}

/// A TLS domain served by this host, with the key material the keymgr
/// loads on behalf of the network workers.
#[derive(Debug, Clone, Deserialize)]
pub struct DomainConfig {
    pub name: String,
    pub certfile: Option<PathBuf>,
    pub crlfile: Option<PathBuf>,
}

/// Key-manager sibling settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KeymgrConfig {
    /// Privdrop user for the keymgr, falling back to `runas_user`.
    pub runas_user: Option<String>,
    /// chroot for the keymgr, falling back to `root_path`.  Certificate
    /// and CRL files are resolved inside this root.
    pub root_path: Option<PathBuf>,
    pub domains: Vec<DomainConfig>,
}

/// ACME sibling settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AcmeConfig {
    /// Directory URL of the ACME provider.
    pub provider: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of network workers; 0 means use the detected CPU count.
    pub worker_count: u16,
    /// Pin each worker to its cpu index.
    pub worker_set_affinity: bool,
    /// Connection-count release threshold for the accept lock.
    pub worker_max_connections: u32,
    /// Base NOFILE target before the inherited-descriptor adjustment.
    pub worker_rlimit_nofiles: u64,
    /// Accept batch size hint handed to the listener subsystem.
    pub worker_accept_threshold: u32,
    /// Crash policy for network workers.
    pub worker_policy: WorkerPolicy,
    /// In-flight HTTP request release threshold.
    pub http_request_limit: u32,
    /// Privdrop user; required unless `skip_runas`.
    pub runas_user: Option<String>,
    /// Worker chroot; required unless `skip_chroot` (then only chdir'd).
    pub root_path: Option<PathBuf>,
    pub skip_runas: bool,
    pub skip_chroot: bool,
    /// Suppress the routine NOTICE-level lifecycle lines.
    pub quiet: bool,
    /// Log to stderr instead of syslog.
    pub foreground: bool,
    pub listeners: Vec<ListenerConfig>,
    /// Enables the key-manager sibling when present.
    pub keymgr: Option<KeymgrConfig>,
    /// Enables the ACME sibling when present (requires `keymgr`).
    pub acme: Option<AcmeConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_count: 0,
            worker_set_affinity: true,
            worker_max_connections: 512,
            worker_rlimit_nofiles: 768,
            worker_accept_threshold: 16,
            worker_policy: WorkerPolicy::default(),
            http_request_limit: 1000,
            runas_user: None,
            root_path: None,
            skip_runas: false,
            skip_chroot: false,
            quiet: false,
            foreground: false,
            listeners: Vec::new(),
            keymgr: None,
            acme: None,
        }
    }
}

impl Config {
    /// Load and validate a TOML configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let config: Config =
            toml::from_str(&raw).map_err(|err| Error::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.skip_runas && self.runas_user.is_none() {
            return Err(Error::Config(
                "no runas user given and skip_runas not set".to_string(),
            ));
        }
        if self.root_path.is_none() {
            return Err(Error::Config("no root directory".to_string()));
        }
        if self.acme.is_some() && self.keymgr.is_none() {
            return Err(Error::Config(
                "acme requires the keymgr to be enabled".to_string(),
            ));
        }
        Ok(())
    }

    pub fn keymgr_active(&self) -> bool {
        self.keymgr.is_some()
    }

    pub fn acme_active(&self) -> bool {
        self.keymgr.is_some() && self.acme.is_some()
    }

    pub fn nlisteners(&self) -> usize {
        self.listeners.len()
    }
}
