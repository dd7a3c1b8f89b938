//! Privilege-separated worker supervision for a multi-process network server.
//!
//! A single privileged supervisor process forks a pool of unprivileged
//! worker processes that each run an independent event loop serving network
//! connections.  Workers coordinate through a small shared-memory region
//! holding an "accept lock": the worker that wins the lock is the only one
//! allowed to arm its listeners for new connections, which spreads load
//! without a thundering herd and without a userspace scheduler.
//!
//! Two specialized sibling processes never accept connections: the
//! key-manager holds private key material and answers certificate, CRL and
//! entropy requests, and the optional ACME sibling drives certificate
//! provisioning.  All cross-process communication other than the accept
//! lock and the worker record table travels over a parent-mediated message
//! bus built on socketpairs.

pub mod acme;
pub mod config;
pub mod domain;
mod error;
pub mod keymgr;
pub mod msg;
pub mod platform;
pub mod privdrop;
pub mod sandbox;
pub mod shm;
pub mod signal;
pub mod supervisor;
pub mod timer;
pub mod worker;

pub use crate::{config::Config, error::Error};

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Pool sizes at or below this skip lock arbitration entirely; every
/// worker behaves as if it unconditionally holds the accept lock.
pub const WORKER_SOLO_COUNT: u16 = 3;

/// Period between entropy requests from a network worker to the keymgr.
pub const RESEED_INTERVAL: u64 = 1_800 * 1_000;

/// Size of an entropy response payload.
pub const ENTROPY_LEN: usize = 1024;

/// Maximum domain name length; the wire slot is this plus a NUL.
pub const DOMAIN_NAME_LEN: usize = 255;

/// Width of the crash-diagnostic route-name slot in a worker record.
pub const ROUTE_NAME_MAX: usize = 64;

/// Record-table slot reserved for the key-manager.
pub const KEYMGR_SLOT: usize = 0;

/// Record-table slot reserved for the ACME sibling.
pub const ACME_SLOT: usize = 1;

/// First record-table slot used by network workers.
pub const WORKER_BASE: usize = 2;

/// Reserved worker id naming the key-manager on the message bus.
pub const WORKER_KEYMGR: u16 = 2000;

/// Reserved worker id naming the ACME sibling on the message bus.
pub const WORKER_ACME: u16 = 2001;

/// Human-readable process name for a worker id.
pub fn worker_name(id: u16) -> String {
    match id {
        WORKER_KEYMGR => "keymgr".to_string(),
        WORKER_ACME => "acme".to_string(),
        id => format!("worker {}", id),
    }
}

/// Monotonic milliseconds, the clock every loop round starts with.
pub fn time_ms() -> u64 {
    use nix::time::{clock_gettime, ClockId};

    // CLOCK_MONOTONIC cannot fail on any platform we run on.
    match clock_gettime(ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => (ts.tv_sec() as u64) * 1_000 + (ts.tv_nsec() as u64) / 1_000_000,
        Err(_) => 0,
    }
}
