//! The privileged supervisor: region allocation, worker spawning, signal
//! dispatch, crash policy and the bus relay.
//!
//! The supervisor forks every process of the pool, keeps one end of each
//! slot's control socketpair and relays bus frames between workers.  It
//! is the only writer of `pid`, `running` and `restarted` in the record
//! table, and the only process that may force-release the accept lock —
//! which it does exactly when a crashed worker died holding it.

use crate::{
    config::{Config, WorkerPolicy},
    msg::{
        spawn_peer_reader, MsgHeader, PeerFrame, PeerSender, MSG_PARENT, MSG_SHUTDOWN,
        MSG_WORKER_ALL,
    },
    platform,
    shm::Region,
    signal as worker_signal, worker,
    worker::Hooks,
    worker_name, Error, Result, ACME_SLOT, KEYMGR_SLOT, WORKER_ACME, WORKER_BASE, WORKER_KEYMGR,
};
use nix::{
    errno::Errno,
    sys::{
        signal::{kill, raise, Signal},
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::{fork, getpid, ForkResult, Pid},
};
use std::{os::unix::net::UnixStream, process, sync::Arc};
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::mpsc,
    task::JoinHandle,
};
use warden_log::{crit, debug, error, info, warn};

struct Peer {
    sender: PeerSender,
    reader: JoinHandle<()>,
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// The spawn order for a pool: network workers first, then — when the
/// keymgr is enabled — the ACME sibling before the keymgr, so the keymgr
/// can talk to it from its first message on.
fn spawn_plan(nworkers: u16, cpus: u16, keymgr: bool, acme: bool) -> Vec<(usize, u16, u16)> {
    let mut plan = Vec::new();

    for n in 0..nworkers {
        let cpu = if cpus == 0 { 0 } else { n % cpus };
        plan.push((WORKER_BASE + n as usize, n + 1, cpu));
    }

    if keymgr {
        if acme {
            plan.push((ACME_SLOT, WORKER_ACME, 0));
        }
        plan.push((KEYMGR_SLOT, WORKER_KEYMGR, 0));
    }

    plan
}

pub struct Supervisor<H: Hooks + 'static> {
    config: Arc<Config>,
    region: Region,
    nworkers: u16,
    slots: usize,
    peers: Vec<Option<Peer>>,
    pending: Vec<Option<UnixStream>>,
    tx: mpsc::UnboundedSender<PeerFrame>,
    rx: Option<mpsc::UnboundedReceiver<PeerFrame>>,
    factory: fn() -> H,
    quit: bool,
}

impl<H: Hooks + 'static> Supervisor<H> {
    /// Allocate the shared region and fork the whole pool.
    ///
    /// `factory` builds the application hooks inside each freshly forked
    /// worker; the supervisor itself never runs them.
    pub fn init(config: Config, factory: fn() -> H) -> Result<Self> {
        config.validate()?;

        let nworkers = match config.worker_count {
            0 => platform::cpu_count(),
            n => n,
        };

        // Account for the keymgr/acme slots even if we don't start them.
        let slots = nworkers as usize + 2;
        let region = Region::new(slots)?;

        for slot in 0..slots {
            region.worker(slot).set_lb_offset(0);
        }

        debug!("starting {} workers across {} cpus", nworkers, platform::cpu_count());

        worker_signal::ignore(Signal::SIGPIPE)?;

        let (tx, rx) = mpsc::unbounded_channel();

        let mut supervisor = Self {
            config: Arc::new(config),
            region,
            nworkers,
            slots,
            peers: (0..slots).map(|_| None).collect(),
            pending: (0..slots).map(|_| None).collect(),
            tx,
            rx: Some(rx),
            factory,
            quit: false,
        };

        let plan = spawn_plan(
            nworkers,
            platform::cpu_count(),
            supervisor.config.keymgr_active(),
            supervisor.config.acme_active(),
        );
        for (slot, id, cpu) in plan {
            supervisor.spawn(slot, id, cpu)?;
        }

        Ok(supervisor)
    }

    /// Create the control pair and fork one slot.  The child enters the
    /// worker runtime and never returns.
    fn spawn(&mut self, slot: usize, id: u16, cpu: u16) -> Result<()> {
        let record = self.region.worker(slot);
        record.set_identity(id, cpu);
        record.set_has_lock(false);
        record.set_active_route(None);
        record.set_running(true);

        let (parent_end, child_end) = UnixStream::pair()?;
        parent_end.set_nonblocking(true)?;
        child_end.set_nonblocking(true)?;

        match unsafe { fork() }.map_err(Error::from)? {
            ForkResult::Parent { child } => {
                record.set_pid(child.as_raw());
                self.pending[slot] = Some(parent_end);
                Ok(())
            }
            ForkResult::Child => {
                record.set_pid(getpid().as_raw());
                // the parent's end goes with the bus handover
                drop(parent_end);

                let hooks = (self.factory)();
                let code = match worker::entry(
                    slot,
                    self.nworkers,
                    &self.config,
                    &self.region,
                    child_end,
                    hooks,
                ) {
                    Ok(()) => 0,
                    Err(err) => {
                        eprintln!("{}: {}", worker_name(id), err);
                        1
                    }
                };
                process::exit(code);
            }
        }
    }

    /// Move a freshly spawned slot's parent end onto the runtime.
    fn attach(&mut self, slot: usize) -> Result<()> {
        let Some(stream) = self.pending[slot].take() else {
            return Ok(());
        };
        let stream = tokio::net::UnixStream::from_std(stream)?;
        let (read, write) = stream.into_split();

        self.peers[slot] = Some(Peer {
            sender: PeerSender::new(write),
            reader: spawn_peer_reader(slot, read, self.tx.clone()),
        });
        Ok(())
    }

    /// Deliver `sig` to every live worker; failures are logged, not fatal.
    fn dispatch_signal(&self, sig: Signal) {
        for slot in 0..self.slots {
            let pid = self.region.worker(slot).pid();
            if pid <= 0 {
                continue;
            }
            if let Err(err) = kill(Pid::from_raw(pid), sig) {
                debug!("kill({}, {}): {}", pid, sig, err);
            }
        }
    }

    /// Non-blocking reap loop over everything that exited.
    fn reap(&mut self) {
        loop {
            match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(status) => self.reaper(status),
                Err(Errno::ECHILD) => break,
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    error!("failed to wait for children: {}", err);
                    break;
                }
            }
        }
    }

    fn reaper(&mut self, status: WaitStatus) {
        let (pid, clean, sigsys) = match status {
            WaitStatus::Exited(pid, code) => (pid, code == 0, false),
            WaitStatus::Signaled(pid, sig, _) => (pid, false, sig == Signal::SIGSYS),
            _ => return,
        };

        let Some(slot) = self.region.slot_of_pid(pid.as_raw()) else {
            return;
        };
        let record = self.region.worker(slot);
        let id = record.id();

        if !self.config.quiet {
            info!(
                "worker {} ({}) exited with status {:?}",
                worker_name(id),
                pid,
                status
            );
        }

        record.set_running(false);

        if clean {
            record.set_pid(0);
            self.peers[slot] = None;
            return;
        }

        let route = record
            .active_route()
            .unwrap_or_else(|| "none".to_string());
        info!("worker {} (pid: {}) (handler: {}) gone", id, pid, route);

        if sigsys {
            info!("worker {} died from sandbox violation", id);
        }

        // The siblings hold state that cannot be rebuilt in place; their
        // loss takes the server down.
        if id == WORKER_KEYMGR || id == WORKER_ACME {
            crit!("keymgr or acme process gone, stopping");
            record.set_pid(0);
            self.peers[slot] = None;
            if raise(Signal::SIGTERM).is_err() {
                warn!("failed to raise SIGTERM signal");
            }
            return;
        }

        if self.config.nlisteners() != 0 && self.region.lock().holder() == pid.as_raw() {
            info!("worker {} died holding the accept lock, releasing", id);
            self.region.lock().release();
        }

        if self.config.worker_policy == WorkerPolicy::Terminate {
            record.set_pid(0);
            self.peers[slot] = None;
            info!("worker policy is 'terminate', stopping");
            if raise(Signal::SIGTERM).is_err() {
                warn!("failed to raise SIGTERM signal");
            }
            return;
        }

        info!("restarting worker {}", id);
        record.set_restarted(true);
        self.peers[slot] = None;

        let cpu = record.cpu();
        if let Err(err) = self.spawn(slot, id, cpu) {
            error!("could not respawn worker {}: {}", id, err);
            let _ = raise(Signal::SIGTERM);
            return;
        }
        if let Err(err) = self.attach(slot) {
            error!("could not attach respawned worker {}: {}", id, err);
        }
    }

    /// Frames addressed to the supervisor itself.
    fn parent_msg(&mut self, slot: usize, header: &MsgHeader) {
        match header.id {
            MSG_SHUTDOWN => {
                if !self.quit {
                    info!(
                        "worker {} requested shutdown",
                        worker_name(self.region.worker(slot).id())
                    );
                    self.quit = true;
                }
            }
            id => debug!("no parent handler for message {}", id),
        }
    }

    /// Relay a worker frame to its destination.
    async fn relay(&mut self, slot: usize, header: MsgHeader, payload: Vec<u8>) {
        match header.dst {
            MSG_PARENT => self.parent_msg(slot, &header),
            MSG_WORKER_ALL => {
                for target in WORKER_BASE..self.slots {
                    if !self.region.worker(target).running() {
                        continue;
                    }
                    self.send_to(target, header, &payload).await;
                }
            }
            dst => {
                let target = (0..self.slots).find(|&s| {
                    self.region.worker(s).running() && self.region.worker(s).id() == dst
                });
                match target {
                    Some(target) => self.send_to(target, header, &payload).await,
                    None => debug!("message {} for unknown worker {}", header.id, dst),
                }
            }
        }
    }

    async fn send_to(&mut self, slot: usize, header: MsgHeader, payload: &[u8]) {
        if let Some(peer) = self.peers[slot].as_mut() {
            if let Err(err) = peer.sender.send(header, payload).await {
                debug!("relay to slot {} failed: {}", slot, err);
            }
        }
    }

    /// Supervise until told to stop: forward SIGHUP, reap on SIGCHLD,
    /// shut down on the termination signals, relay bus frames between
    /// workers in the meantime.
    pub async fn run(mut self) -> Result<()> {
        let mut sighup = signal(SignalKind::hangup())?;
        let mut sigchld = signal(SignalKind::child())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigquit = signal(SignalKind::quit())?;

        for slot in 0..self.slots {
            self.attach(slot)?;
        }

        let mut rx = self.rx.take().ok_or(Error::Error("supervisor already ran"))?;

        // anything that died between fork and the signal stream coming up
        self.reap();

        if !self.config.quiet {
            info!("server ready, pool of {} workers", self.nworkers);
        }

        while !self.quit {
            tokio::select! {
                _ = sighup.recv() => {
                    info!("reload requested, signaling workers");
                    self.dispatch_signal(Signal::SIGHUP);
                }
                _ = sigchld.recv() => self.reap(),
                _ = sigterm.recv() => self.quit = true,
                _ = sigint.recv() => self.quit = true,
                _ = sigquit.recv() => self.quit = true,
                frame = rx.recv() => {
                    if let Some((slot, header, payload)) = frame {
                        self.relay(slot, header, payload).await;
                    }
                }
            }
        }

        self.dispatch_signal(Signal::SIGTERM);
        self.shutdown();

        Ok(())
    }

    /// Blocking drain: wait for every slot, then remove the region.
    fn shutdown(mut self) {
        if !self.config.quiet {
            info!("waiting for workers to drain and shutdown");
        }

        for slot in 0..self.slots {
            let record = self.region.worker(slot);
            let pid = record.pid();
            if !record.running() || pid <= 0 {
                continue;
            }

            loop {
                match waitpid(Pid::from_raw(pid), None) {
                    Ok(WaitStatus::Signaled(_, sig, _)) if sig == Signal::SIGSYS => {
                        info!(
                            "worker {} died from sandbox violation",
                            record.id()
                        );
                        break;
                    }
                    Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => break,
                    Ok(_) => continue,
                    Err(Errno::EINTR) => continue,
                    Err(_) => break,
                }
            }

            record.set_pid(0);
            record.set_running(false);
            self.peers[slot] = None;

            if !self.config.quiet {
                info!("worker {} exited", worker_name(record.id()));
            }
        }

        // dropping self unmaps the shared region, after every slot drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_plan_round_robin() {
        let plan = spawn_plan(4, 2, false, false);
        assert_eq!(
            plan,
            vec![
                (WORKER_BASE, 1, 0),
                (WORKER_BASE + 1, 2, 1),
                (WORKER_BASE + 2, 3, 0),
                (WORKER_BASE + 3, 4, 1),
            ]
        );
    }

    #[test]
    fn test_spawn_plan_two_workers_two_cpus() {
        // cold start: ids 1 and 2 on cpus 0 and 1
        let plan = spawn_plan(2, 8, false, false);
        assert_eq!(plan, vec![(WORKER_BASE, 1, 0), (WORKER_BASE + 1, 2, 1)]);
    }

    #[test]
    fn test_spawn_plan_acme_before_keymgr() {
        let plan = spawn_plan(1, 1, true, true);
        assert_eq!(
            plan,
            vec![
                (WORKER_BASE, 1, 0),
                (ACME_SLOT, WORKER_ACME, 0),
                (KEYMGR_SLOT, WORKER_KEYMGR, 0),
            ]
        );
    }

    #[test]
    fn test_spawn_plan_keymgr_only() {
        let plan = spawn_plan(1, 1, true, false);
        assert_eq!(
            plan,
            vec![(WORKER_BASE, 1, 0), (KEYMGR_SLOT, WORKER_KEYMGR, 0)]
        );
    }

    #[test]
    fn test_region_sized_for_detected_cpus() {
        // pool_size == 0 resolves to the detected cpu count plus the two
        // reserved slots
        let cpus = platform::cpu_count();
        let slots = cpus as usize + 2;
        let region = Region::new(slots).unwrap();
        assert_eq!(region.slots(), slots);
    }
}
