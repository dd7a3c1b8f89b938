//! Platform services for worker processes: the poll(2)-backed event
//! queue, cpu pinning and the process title.
//!
//! The event queue is the worker loop's single suspension point.  It
//! answers `wait(timeout)` with the set of ready sources; everything else
//! in the loop is non-blocking.

use crate::Result;
use nix::poll::{poll, PollFd, PollFlags};
use std::os::unix::io::RawFd;

/// What a registered descriptor belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// The control socketpair to the supervisor.
    Bus,
    /// Listener number `n` in the worker's listener table.
    Listener(usize),
}

/// One ready descriptor out of a `wait` call.
#[derive(Debug, Clone, Copy)]
pub struct Readiness {
    pub source: Source,
    pub readable: bool,
    pub writable: bool,
    pub hangup: bool,
}

struct Entry {
    fd: RawFd,
    source: Source,
    read: bool,
    write: bool,
}

/// A registered set of descriptors with per-descriptor interest flags.
#[derive(Default)]
pub struct EventQueue {
    entries: Vec<Entry>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, fd: RawFd, source: Source, read: bool, write: bool) {
        self.entries.push(Entry {
            fd,
            source,
            read,
            write,
        });
    }

    pub fn deregister(&mut self, source: Source) {
        self.entries.retain(|e| e.source != source);
    }

    /// Flip read interest, e.g. arming and disarming listener accepts.
    pub fn set_read(&mut self, source: Source, read: bool) {
        for entry in self.entries.iter_mut().filter(|e| e.source == source) {
            entry.read = read;
        }
    }

    /// Flip write interest, used while the bus has queued output.
    pub fn set_write(&mut self, source: Source, write: bool) {
        for entry in self.entries.iter_mut().filter(|e| e.source == source) {
            entry.write = write;
        }
    }

    /// Wait for events, `None` meaning forever.  An interrupting signal
    /// yields an empty ready set so the caller reaches its drain point.
    pub fn wait(&self, timeout: Option<u64>) -> Result<Vec<Readiness>> {
        let mut fds: Vec<PollFd> = self
            .entries
            .iter()
            .map(|e| {
                let mut events = PollFlags::empty();
                if e.read {
                    events |= PollFlags::POLLIN;
                }
                if e.write {
                    events |= PollFlags::POLLOUT;
                }
                PollFd::new(e.fd, events)
            })
            .collect();

        let timeout = match timeout {
            Some(ms) => ms.min(i32::MAX as u64) as libc::c_int,
            None => -1,
        };

        match poll(&mut fds, timeout) {
            Ok(0) => Ok(Vec::new()),
            Ok(_) => {
                let mut ready = Vec::new();
                for (entry, fd) in self.entries.iter().zip(fds.iter()) {
                    let revents = fd.revents().unwrap_or_else(PollFlags::empty);
                    if revents.is_empty() {
                        continue;
                    }
                    ready.push(Readiness {
                        source: entry.source,
                        readable: revents
                            .intersects(PollFlags::POLLIN | PollFlags::POLLHUP),
                        writable: revents.contains(PollFlags::POLLOUT),
                        hangup: revents
                            .intersects(PollFlags::POLLHUP | PollFlags::POLLERR),
                    });
                }
                Ok(ready)
            }
            Err(nix::errno::Errno::EINTR) => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Detected CPU count, the pool size when `worker_count = 0`.
pub fn cpu_count() -> u16 {
    num_cpus::get() as u16
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        /// Pin the calling process to `cpu`.
        pub fn setcpu(cpu: u16) -> Result<()> {
            use nix::sched::{sched_setaffinity, CpuSet};
            use nix::unistd::Pid;

            let mut set = CpuSet::new();
            set.set(cpu as usize % CpuSet::count())?;
            sched_setaffinity(Pid::from_raw(0), &set)?;
            Ok(())
        }
    } else {
        /// Affinity is best-effort; platforms without it just spread by
        /// the kernel scheduler.
        pub fn setcpu(_cpu: u16) -> Result<()> {
            Ok(())
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        /// Retitle the process so `ps` shows the worker name.
        pub fn proctitle(name: &str) {
            // PR_SET_NAME takes at most 15 bytes plus the NUL.
            let mut buf = [0u8; 16];
            let bytes = name.as_bytes();
            let n = bytes.len().min(15);
            buf[..n].copy_from_slice(&bytes[..n]);
            unsafe {
                libc::prctl(libc::PR_SET_NAME, buf.as_ptr() as libc::c_ulong, 0, 0, 0);
            }
        }
    } else {
        pub fn proctitle(_name: &str) {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_wait_timeout_elapses() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut queue = EventQueue::new();
        queue.register(a.as_raw_fd(), Source::Bus, true, false);

        let ready = queue.wait(Some(10)).unwrap();
        assert!(ready.is_empty());
    }

    #[test]
    fn test_wait_reports_readable() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let mut queue = EventQueue::new();
        queue.register(a.as_raw_fd(), Source::Bus, true, false);

        b.write_all(b"x").unwrap();
        let ready = queue.wait(Some(1000)).unwrap();
        assert_eq!(ready.len(), 1);
        assert!(ready[0].readable);
        assert_eq!(ready[0].source, Source::Bus);
    }

    #[test]
    fn test_interest_toggling() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let mut queue = EventQueue::new();
        queue.register(a.as_raw_fd(), Source::Listener(0), true, false);

        b.write_all(b"x").unwrap();
        queue.set_read(Source::Listener(0), false);
        assert!(queue.wait(Some(10)).unwrap().is_empty());

        queue.set_read(Source::Listener(0), true);
        assert!(!queue.wait(Some(10)).unwrap().is_empty());
    }

    #[test]
    fn test_cpu_count_positive() {
        assert!(cpu_count() >= 1);
    }
}
