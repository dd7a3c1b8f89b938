//! Shared accept-lock region and worker record table.
//!
//! A single anonymous `MAP_SHARED` mapping is created by the supervisor
//! before any fork, so every worker inherits the same physical pages.  The
//! [`AcceptLock`] sits at offset zero, followed by the [`WorkerRecord`]
//! array, aligned to the record size.  This region and the record table
//! are the only mutable state shared between processes; everything else
//! travels over the message bus.
//!
//! All fields that cross a process boundary are word-sized atomics, and
//! the lock word can only be touched through the compare-and-swap
//! operations on [`AcceptLock`].  Writer roles are fixed: the supervisor
//! owns `pid`, `running` and `restarted`; the process occupying a slot
//! owns `has_lock`, the active-route slot and the log-buffer offset.

use crate::{Result, ROUTE_NAME_MAX};
use nix::{
    sys::mman::{mmap, munmap, MapFlags, ProtFlags},
    unistd::Pid,
};
use std::{
    mem,
    num::NonZeroUsize,
    sync::atomic::{AtomicI32, AtomicU16, AtomicU32, AtomicU8, Ordering},
};

/// The accept arbitration lock: a CAS-only lock word plus the pid of the
/// current holder, recorded for forensics and forced release.
#[repr(C)]
pub struct AcceptLock {
    lock: AtomicU32,
    current: AtomicI32,
}

impl AcceptLock {
    /// Try to take the lock without blocking.
    ///
    /// On success the caller's pid is recorded as the holder.  On failure
    /// there are no side effects; the event loop simply tries again on a
    /// later round.
    pub fn try_acquire(&self, pid: Pid) -> bool {
        if self
            .lock
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        self.current.store(pid.as_raw(), Ordering::Release);
        true
    }

    /// Release the lock.
    ///
    /// Returns `false` when the word was already 0, which happens when the
    /// supervisor pre-emptively released after a crash; callers log that
    /// and carry on.
    pub fn release(&self) -> bool {
        self.current.store(0, Ordering::Release);
        self.lock
            .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Pid of the current holder, 0 when free or mid-transition.
    pub fn holder(&self) -> i32 {
        self.current.load(Ordering::Acquire)
    }

    pub fn is_held(&self) -> bool {
        self.lock.load(Ordering::Acquire) == 1
    }
}

/// One slot of the worker record table.
///
/// Slots are created once at startup and never destroyed until server
/// shutdown; pids within a slot turn over on restart while `id` and `cpu`
/// stay fixed.
#[repr(C)]
pub struct WorkerRecord {
    id: AtomicU16,
    cpu: AtomicU16,
    pid: AtomicI32,
    running: AtomicU32,
    restarted: AtomicU32,
    has_lock: AtomicU32,
    /// Name of the request handler the worker was executing, for the
    /// supervisor's post-mortem crash line.  Written only by the owning
    /// process while alive, read only after its death.
    active_route: [AtomicU8; ROUTE_NAME_MAX],
    /// Batched-log write offset.  The buffer itself is process-local;
    /// only the offset lives here, zeroed at init.
    lb_offset: AtomicU32,
}

impl WorkerRecord {
    pub fn id(&self) -> u16 {
        self.id.load(Ordering::Relaxed)
    }

    pub fn cpu(&self) -> u16 {
        self.cpu.load(Ordering::Relaxed)
    }

    /// Supervisor only, while the slot has no live process.
    pub fn set_identity(&self, id: u16, cpu: u16) {
        self.id.store(id, Ordering::Relaxed);
        self.cpu.store(cpu, Ordering::Relaxed);
    }

    pub fn pid(&self) -> i32 {
        self.pid.load(Ordering::Acquire)
    }

    pub fn set_pid(&self, pid: i32) {
        self.pid.store(pid, Ordering::Release);
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::Acquire) != 0
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running as u32, Ordering::Release);
    }

    pub fn restarted(&self) -> bool {
        self.restarted.load(Ordering::Acquire) != 0
    }

    pub fn set_restarted(&self, restarted: bool) {
        self.restarted.store(restarted as u32, Ordering::Release);
    }

    pub fn has_lock(&self) -> bool {
        self.has_lock.load(Ordering::Acquire) != 0
    }

    /// Owning process only.  Advisory: authority lives in the lock word.
    pub fn set_has_lock(&self, has_lock: bool) {
        self.has_lock.store(has_lock as u32, Ordering::Release);
    }

    pub fn lb_offset(&self) -> u32 {
        self.lb_offset.load(Ordering::Relaxed)
    }

    pub fn set_lb_offset(&self, offset: u32) {
        self.lb_offset.store(offset, Ordering::Relaxed);
    }

    /// Record the currently executing handler, or clear it with `None`.
    pub fn set_active_route(&self, name: Option<&str>) {
        let bytes = name.map(str::as_bytes).unwrap_or_default();
        for (i, slot) in self.active_route.iter().enumerate() {
            let b = if i < bytes.len() && i < ROUTE_NAME_MAX - 1 {
                bytes[i]
            } else {
                0
            };
            slot.store(b, Ordering::Relaxed);
        }
    }

    /// The last recorded handler name, if any.
    pub fn active_route(&self) -> Option<String> {
        let mut buf = Vec::with_capacity(ROUTE_NAME_MAX);
        for slot in &self.active_route {
            let b = slot.load(Ordering::Relaxed);
            if b == 0 {
                break;
            }
            buf.push(b);
        }
        if buf.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&buf).into_owned())
        }
    }
}

/// The shared region: lock at offset 0, record table after padding.
///
/// Created read-write and zeroed; removed (unmapped) by the supervisor
/// only after every slot has drained.  Worker processes never unmap; they
/// exit and the kernel drops their reference.
pub struct Region {
    base: *mut u8,
    len: usize,
    slots: usize,
}

// The raw base pointer is only dereferenced through the atomic views.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

fn records_offset() -> usize {
    let align = mem::align_of::<WorkerRecord>();
    (mem::size_of::<AcceptLock>() + align - 1) / align * align
}

impl Region {
    /// Total mapping size for a table of `slots` records.
    pub fn size_for(slots: usize) -> usize {
        records_offset() + slots * mem::size_of::<WorkerRecord>()
    }

    /// Map a new zeroed region sized for `slots` worker records.
    pub fn new(slots: usize) -> Result<Self> {
        let len = Self::size_for(slots);
        let len_nz = NonZeroUsize::new(len).ok_or(crate::Error::Error("empty worker table"))?;

        let base = unsafe {
            mmap(
                None,
                len_nz,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED | MapFlags::MAP_ANONYMOUS,
                -1,
                0,
            )?
        };

        Ok(Self {
            base: base.cast(),
            len,
            slots,
        })
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    pub fn lock(&self) -> &AcceptLock {
        unsafe { &*(self.base as *const AcceptLock) }
    }

    pub fn worker(&self, slot: usize) -> &WorkerRecord {
        assert!(slot < self.slots, "slot {} out of range", slot);
        unsafe {
            let ptr = self
                .base
                .add(records_offset() + slot * mem::size_of::<WorkerRecord>());
            &*(ptr as *const WorkerRecord)
        }
    }

    /// Slot index currently occupied by `pid`, if any.
    pub fn slot_of_pid(&self, pid: i32) -> Option<usize> {
        (0..self.slots).find(|&slot| self.worker(slot).pid() == pid)
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.base.cast(), self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::getpid;

    #[test]
    fn test_region_size() {
        // lock word + holder pid, then the aligned record array
        let one = Region::size_for(1);
        let two = Region::size_for(2);
        assert_eq!(two - one, mem::size_of::<WorkerRecord>());
        assert!(one >= mem::size_of::<AcceptLock>() + mem::size_of::<WorkerRecord>());
    }

    #[test]
    fn test_region_zeroed() {
        let region = Region::new(4).unwrap();
        assert!(!region.lock().is_held());
        assert_eq!(region.lock().holder(), 0);
        for slot in 0..4 {
            let record = region.worker(slot);
            assert_eq!(record.pid(), 0);
            assert!(!record.running());
            assert!(!record.has_lock());
            assert_eq!(record.active_route(), None);
            assert_eq!(record.lb_offset(), 0);
        }
    }

    #[test]
    fn test_acquire_release_roundtrip() {
        let region = Region::new(1).unwrap();
        let lock = region.lock();

        assert!(lock.try_acquire(getpid()));
        assert!(lock.is_held());
        assert_eq!(lock.holder(), getpid().as_raw());

        // held: a second acquisition must fail without side effects
        assert!(!lock.try_acquire(getpid()));
        assert_eq!(lock.holder(), getpid().as_raw());

        assert!(lock.release());
        assert!(!lock.is_held());
        assert_eq!(lock.holder(), 0);
    }

    #[test]
    fn test_release_unheld_is_soft() {
        let region = Region::new(1).unwrap();
        assert!(!region.lock().release());
        assert!(!region.lock().is_held());
    }

    #[test]
    fn test_record_identity_survives_flag_churn() {
        let region = Region::new(3).unwrap();
        let record = region.worker(2);

        record.set_identity(3, 1);
        record.set_pid(1234);
        record.set_running(true);
        record.set_restarted(true);
        record.set_has_lock(true);

        assert_eq!(record.id(), 3);
        assert_eq!(record.cpu(), 1);
        assert!(record.restarted());

        record.set_pid(5678);
        record.set_restarted(false);
        record.set_has_lock(false);

        assert_eq!(record.id(), 3);
        assert_eq!(record.cpu(), 1);
        assert_eq!(record.pid(), 5678);
    }

    #[test]
    fn test_active_route() {
        let region = Region::new(1).unwrap();
        let record = region.worker(0);

        record.set_active_route(Some("page_serve"));
        assert_eq!(record.active_route().as_deref(), Some("page_serve"));

        record.set_active_route(None);
        assert_eq!(record.active_route(), None);

        // oversized names are truncated, not wrapped
        let long = "x".repeat(2 * ROUTE_NAME_MAX);
        record.set_active_route(Some(&long));
        assert_eq!(record.active_route().map(|s| s.len()), Some(ROUTE_NAME_MAX - 1));
    }
}
