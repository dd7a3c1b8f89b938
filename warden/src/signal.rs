//! Deferred signal handling for worker processes.
//!
//! The handler does exactly one thing: store the signal number in a
//! process-local atomic.  The event loop drains the flag at its drain
//! point, which keeps every signal effect ordered against loop effects
//! and keeps the handler trivially async-signal-safe.
//!
//! The supervisor does not use this module; it runs inside a tokio
//! runtime and consumes its signal streams instead.

use crate::Result;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicI32, Ordering};

static SIG_RECV: AtomicI32 = AtomicI32::new(0);

extern "C" fn handle_signal(sig: libc::c_int) {
    SIG_RECV.store(sig, Ordering::Relaxed);
}

/// Install the deferred handler for every signal the worker loop drains.
///
/// Called once per process, immediately after fork, replacing whatever
/// dispositions were inherited from the supervisor.
pub fn setup() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(handle_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );

    for sig in [
        Signal::SIGHUP,
        Signal::SIGQUIT,
        Signal::SIGINT,
        Signal::SIGTERM,
        Signal::SIGCHLD,
        Signal::SIGUSR1,
    ] {
        unsafe {
            sigaction(sig, &action)?;
        }
    }

    // A peer closing its end of a socketpair must surface as EPIPE on the
    // write, never as a process kill.
    ignore(Signal::SIGPIPE)?;

    Ok(())
}

pub fn ignore(sig: Signal) -> Result<()> {
    let action = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    unsafe {
        sigaction(sig, &action)?;
    }
    Ok(())
}

/// The signal received since the last drain, without consuming it.
pub fn pending() -> Option<Signal> {
    match SIG_RECV.load(Ordering::Relaxed) {
        0 => None,
        sig => Signal::try_from(sig).ok(),
    }
}

/// Consume and return the pending signal.
pub fn take() -> Option<Signal> {
    match SIG_RECV.swap(0, Ordering::Relaxed) {
        0 => None,
        sig => Signal::try_from(sig).ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_drains() {
        SIG_RECV.store(libc::SIGTERM, Ordering::Relaxed);
        assert_eq!(pending(), Some(Signal::SIGTERM));
        assert_eq!(take(), Some(Signal::SIGTERM));
        assert_eq!(take(), None);
        assert_eq!(pending(), None);
    }
}
