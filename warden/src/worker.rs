//! The per-worker runtime: post-fork initialization and the event loop.
//!
//! Every worker re-initializes every subsystem after fork in a fixed
//! order — platform event source, control channel, message bus, privilege
//! drop, listeners, domain state, timers — rather than sharing anything
//! with the supervisor beyond the shared region and its socketpair.
//!
//! The loop proceeds in rounds.  Each round reads the monotonic clock,
//! handles the periodic entropy reseed, tries for the accept lock when it
//! is available, sleeps in the event wait, evaluates the release policy,
//! drains the deferred signal flag and then runs timers, application work
//! and the connection sweeps.  The event wait is the only suspension
//! point; everything else is non-blocking.

use crate::{
    config::Config,
    domain::{CertSource, DomainMap},
    keymgr::CertPayload,
    msg::{
        Channel, MsgBus, MsgHeader, MsgSender, MSG_ACCEPT_AVAILABLE,
        MSG_ACME_CHALLENGE_CLEAR_CERT, MSG_ACME_CHALLENGE_SET_CERT, MSG_CERTIFICATE,
        MSG_CERTIFICATE_REQ, MSG_CRL, MSG_ENTROPY_RESP, MSG_PARENT, MSG_SHUTDOWN,
        MSG_WORKER_ALL,
    },
    platform::{self, EventQueue, Source},
    privdrop,
    sandbox::Role,
    shm::{Region, WorkerRecord},
    signal, time_ms,
    timer::TimerList,
    worker_name, Result, ENTROPY_LEN, RESEED_INTERVAL, WORKER_ACME, WORKER_KEYMGR,
    WORKER_SOLO_COUNT,
};
use nix::{
    sys::{
        signal::Signal,
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::Pid,
};
use rand::{rngs::StdRng, RngCore, SeedableRng};
use std::{cell::RefCell, os::unix::io::RawFd, os::unix::net::UnixStream, rc::Rc};
use warden_log::{debug, info, warn};

/// Application integration points called from the worker loop.
///
/// The HTTP pipeline, the connection table and the listener sockets are
/// external subsystems; they plug in here.  Every hook defaults to a
/// no-op so a bare worker is a valid (if idle) process.
pub trait Hooks {
    /// User-defined configure step, run once before the first round.
    /// Application timers installed here fire against `self` in step 10
    /// of every later round.
    fn configure(&mut self, _ctx: &mut WorkerCtx, _timers: &mut TimerList<Self>) -> Result<()>
    where
        Self: Sized,
    {
        Ok(())
    }

    /// SIGHUP arrived: reload application modules.
    fn reload(&mut self, _ctx: &mut WorkerCtx) {}

    /// User-defined teardown step, run after the loop exits.
    fn teardown(&mut self, _ctx: &mut WorkerCtx) {}

    /// Listener descriptors to register with the event queue.  Accept
    /// readiness on these is armed only while the accept lock is held.
    fn listeners(&self) -> Vec<RawFd> {
        Vec::new()
    }

    /// A ready listener with the lock held: accept up to the configured
    /// batch threshold, returning how many connections were taken.
    fn accept(&mut self, _ctx: &mut WorkerCtx, _listener: usize) -> u32 {
        0
    }

    /// Run the HTTP pipeline.
    fn http_process(&mut self, _ctx: &mut WorkerCtx) {}

    /// Run scheduled outbound client work.
    fn client_work(&mut self, _ctx: &mut WorkerCtx) {}

    /// Whether a cooperative task is runnable (clamps the event wait).
    fn task_pending(&self) -> bool {
        false
    }

    /// Run cooperative tasks.
    fn task_run(&mut self, _ctx: &mut WorkerCtx) {}

    /// Sweep connections for idle timeout; called at most every 500 ms.
    fn connection_sweep(&mut self, _ctx: &mut WorkerCtx, _now: u64) {}

    /// Prune connections marked disconnected.
    fn connection_prune(&mut self, _ctx: &mut WorkerCtx) {}

    /// SIGCHLD arrived for a worker-owned sub-process.
    fn child_reap(&mut self) {}
}

/// Hooks implementation with no application attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHooks;

impl Hooks for NullHooks {}

/// Process-wide worker state shared with the message handlers.
pub struct WorkerCtx<'a> {
    pub config: &'a Config,
    region: &'a Region,
    slot: usize,
    /// Resolved network pool size (reserved siblings not counted).
    nworkers: u16,
    /// No listeners: arbitration disabled, `has_lock` pinned true.
    no_lock: bool,
    accept_avail: bool,
    had_lock: bool,
    quit: bool,
    active_connections: u32,
    http_request_count: u32,
    last_seed: u64,
    next_timeo: u64,
    nlisteners: usize,
    sender: MsgSender,
    events: EventQueue,
    domains: DomainMap,
    rng: StdRng,
    keymgr_active: bool,
}

impl<'a> WorkerCtx<'a> {
    pub fn record(&self) -> &WorkerRecord {
        self.region.worker(self.slot)
    }

    pub fn id(&self) -> u16 {
        self.record().id()
    }

    pub fn domains(&self) -> &DomainMap {
        &self.domains
    }

    pub fn sender(&self) -> &MsgSender {
        &self.sender
    }

    pub fn active_connections(&self) -> u32 {
        self.active_connections
    }

    pub fn connection_opened(&mut self) {
        self.active_connections += 1;
    }

    pub fn connection_closed(&mut self) {
        self.active_connections = self.active_connections.saturating_sub(1);
    }

    pub fn http_request_count(&self) -> u32 {
        self.http_request_count
    }

    pub fn http_request_started(&mut self) {
        self.http_request_count += 1;
    }

    pub fn http_request_finished(&mut self) {
        self.http_request_count = self.http_request_count.saturating_sub(1);
    }

    /// Record the handler about to run, for post-mortem crash lines.
    pub fn set_active_route(&self, name: Option<&str>) {
        self.record().set_active_route(name);
    }

    /// Fill `buf` from the worker RNG (reseeded from the keymgr).
    pub fn rng_fill(&mut self, buf: &mut [u8]) {
        self.rng.fill_bytes(buf);
    }

    fn solo(&self) -> bool {
        self.nworkers <= WORKER_SOLO_COUNT
    }

    fn trylock(&self) -> bool {
        self.region
            .lock()
            .try_acquire(Pid::from_raw(self.record().pid()))
    }

    fn unlock(&self) {
        if !self.region.lock().release() {
            // the supervisor pre-emptively released after a crash
            info!("release of accept lock that was not held");
        }
    }

    /// Try to become the accepting worker.  Declines without a CAS when
    /// arbitration is off or this worker is already at a ceiling.
    fn acceptlock_obtain(&mut self) -> bool {
        if self.record().has_lock() {
            return true;
        }

        if self.solo() || self.no_lock {
            self.record().set_has_lock(true);
            return true;
        }

        if self.active_connections >= self.config.worker_max_connections {
            return false;
        }
        if self.http_request_count >= self.config.http_request_limit {
            return false;
        }

        if self.trylock() {
            self.record().set_has_lock(true);
            return true;
        }

        false
    }

    /// Give the lock up once either ceiling is reached, then tell the
    /// pool to contend for it.
    ///
    /// With arbitration disabled this returns early without clearing
    /// `has_lock`: a worker without listeners reports holding the lock
    /// forever, intentionally.
    fn acceptlock_release(&mut self) {
        if self.solo() || self.no_lock {
            return;
        }

        if !self.record().has_lock() {
            return;
        }

        if self.active_connections < self.config.worker_max_connections
            && self.http_request_count < self.config.http_request_limit
        {
            return;
        }

        self.unlock();
        self.record().set_has_lock(false);

        if let Err(err) = self.sender.send(MSG_WORKER_ALL, MSG_ACCEPT_AVAILABLE, &[]) {
            warn!("failed to broadcast accept-available: {}", err);
        }
    }

    /// Voluntary release ahead of a long-running operation.
    pub fn make_busy(&mut self) {
        if self.solo() || self.no_lock {
            return;
        }

        if self.record().has_lock() {
            self.unlock();
            self.record().set_has_lock(false);

            if let Err(err) = self.sender.send(MSG_WORKER_ALL, MSG_ACCEPT_AVAILABLE, &[]) {
                warn!("failed to broadcast accept-available: {}", err);
            }
        }
    }

    fn enable_accept(&mut self) {
        for i in 0..self.nlisteners {
            self.events.set_read(Source::Listener(i), true);
        }
    }

    fn disable_accept(&mut self) {
        for i in 0..self.nlisteners {
            self.events.set_read(Source::Listener(i), false);
        }
    }
}

/// ACCEPT_AVAILABLE from a releasing peer: contend on the next round.
fn worker_accept_avail(ctx: &mut WorkerCtx, _header: &MsgHeader, _data: &[u8]) {
    ctx.accept_avail = true;
}

/// ENTROPY_RESP: fold the buffer into the worker RNG.  An unexpected
/// length is logged but still stirred in, matching the original server.
fn worker_entropy_recv(ctx: &mut WorkerCtx, _header: &MsgHeader, data: &[u8]) {
    if data.len() != ENTROPY_LEN {
        warn!(
            "invalid entropy response (got:{} - wanted:{})",
            data.len(),
            ENTROPY_LEN
        );
    }

    let mut seed = [0u8; 32];
    ctx.rng.fill_bytes(&mut seed);
    for (i, b) in data.iter().enumerate() {
        seed[i % seed.len()] ^= b;
    }
    ctx.rng = StdRng::from_seed(seed);
}

/// Certificate-shaped keymgr responses: validate, resolve the domain and
/// apply.  Anything that fails validation is dropped with one log line
/// and no state change.
fn worker_keymgr_response(ctx: &mut WorkerCtx, header: &MsgHeader, data: &[u8]) {
    let payload = match CertPayload::parse(data) {
        Ok(payload) => payload,
        Err(err) => {
            warn!("{}", err);
            return;
        }
    };

    let Some(domain) = ctx.domains.lookup_mut(payload.domain) else {
        warn!("got keymgr response for domain that does not exist");
        return;
    };

    match header.id {
        MSG_CERTIFICATE => {
            domain.tls_init(CertSource::PemChain, payload.data);
            debug!("[{}] tls context initialized", payload.domain);
        }
        MSG_CRL => {
            if !domain.crl_install(payload.data) {
                warn!("[{}] crl arrived without a tls context", payload.domain);
            }
        }
        MSG_ACME_CHALLENGE_SET_CERT => {
            domain.acme_challenge_set(payload.data);
            info!("[{}] tls-alpn-01 challenge active", payload.domain);
        }
        MSG_ACME_CHALLENGE_CLEAR_CERT => {
            domain.acme_challenge_clear();
            info!("[{}] tls-alpn-01 challenge disabled", payload.domain);
        }
        id => warn!("unknown keymgr request {}", id),
    }
}

/// The milliseconds the event wait may sleep: until the next timer, with
/// clamps when something outside the timer list wants the loop back soon.
fn compute_netwait(
    next_timer: Option<u64>,
    signal_pending: bool,
    http_requests: u32,
    task_pending: bool,
) -> Option<u64> {
    if next_timer.is_some() {
        return next_timer;
    }

    let mut netwait = None;
    if signal_pending {
        netwait = Some(10);
    }
    if http_requests > 0 {
        netwait = Some(100);
    }
    if task_pending {
        netwait = Some(10);
    }
    netwait
}

/// Reap sub-processes the worker itself spawned (scripted handlers and
/// the like); the supervisor never sees these.
fn reap_children() {
    loop {
        match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(_) => break,
            Ok(status) => debug!("reaped worker-owned child: {:?}", status),
        }
    }
}

struct Worker<'a, H: Hooks> {
    ctx: WorkerCtx<'a>,
    hooks: H,
    timers: TimerList<H>,
}

impl<'a, H: Hooks> Worker<'a, H> {
    fn run(&mut self, bus: &mut MsgBus<WorkerCtx<'a>>) {
        loop {
            let mut now = time_ms();

            // last_seed of 0 means no request yet; the first round seeds
            // unconditionally, later rounds on the reseed interval.
            if self.ctx.keymgr_active
                && (self.ctx.last_seed == 0
                    || now.saturating_sub(self.ctx.last_seed) >= RESEED_INTERVAL)
            {
                if let Err(err) =
                    self.ctx
                        .sender
                        .send(WORKER_KEYMGR, crate::msg::MSG_ENTROPY_REQ, &[])
                {
                    warn!("failed to request entropy: {}", err);
                }
                self.ctx.last_seed = now.max(1);
            }

            if !self.ctx.record().has_lock() && self.ctx.accept_avail {
                if self.ctx.acceptlock_obtain() {
                    self.ctx.accept_avail = false;
                    if !self.ctx.had_lock {
                        self.ctx.enable_accept();
                        self.ctx.had_lock = true;
                    }
                }
            }

            let netwait = compute_netwait(
                self.timers.next_run(now),
                signal::pending().is_some(),
                self.ctx.http_request_count,
                self.hooks.task_pending(),
            );

            self.ctx
                .events
                .set_write(Source::Bus, self.ctx.sender.wants_write());

            let ready = match self.ctx.events.wait(netwait) {
                Ok(ready) => ready,
                Err(err) => {
                    warn!("event wait failed: {}", err);
                    Vec::new()
                }
            };
            now = time_ms();

            for readiness in ready {
                match readiness.source {
                    Source::Bus => {
                        if readiness.writable {
                            let _ = self.ctx.sender.flush();
                        }
                        if readiness.readable {
                            if let Err(err) = bus.dispatch(&mut self.ctx) {
                                warn!("control channel lost: {}", err);
                                self.ctx.quit = true;
                            }
                        }
                    }
                    Source::Listener(listener) => {
                        if readiness.readable && self.ctx.record().has_lock() {
                            let accepted = self.hooks.accept(&mut self.ctx, listener);
                            self.ctx.active_connections += accepted;
                        }
                    }
                }
            }

            if self.ctx.record().has_lock() {
                self.ctx.acceptlock_release();
            }

            if !self.ctx.record().has_lock() && self.ctx.had_lock {
                self.ctx.had_lock = false;
                self.ctx.disable_accept();
            }

            if let Some(sig) = signal::take() {
                match sig {
                    Signal::SIGHUP => self.hooks.reload(&mut self.ctx),
                    Signal::SIGQUIT | Signal::SIGINT | Signal::SIGTERM => {
                        self.ctx.quit = true;
                    }
                    Signal::SIGCHLD => {
                        reap_children();
                        self.hooks.child_reap();
                    }
                    _ => {}
                }
            }

            if self.ctx.quit {
                break;
            }

            self.timers.run(now, &mut self.hooks);
            self.hooks.client_work(&mut self.ctx);
            self.hooks.http_process(&mut self.ctx);
            self.hooks.task_run(&mut self.ctx);

            if self.ctx.next_timeo <= now {
                self.hooks.connection_sweep(&mut self.ctx, now);
                self.ctx.next_timeo = now + 500;
            }

            self.hooks.connection_prune(&mut self.ctx);
        }
    }
}

/// Per-process entry point, called in the child right after fork.
///
/// Never returns to the supervisor's control flow; the caller exits the
/// process with this function's outcome.
pub fn entry<H: Hooks>(
    slot: usize,
    nworkers: u16,
    config: &Config,
    region: &Region,
    stream: UnixStream,
    hooks: H,
) -> Result<()> {
    let record = region.worker(slot);
    let id = record.id();

    let _log_guard = warden_log::sync_logger(&worker_name(id), config.foreground)?;

    platform::proctitle(&worker_name(id));

    if config.worker_set_affinity {
        if let Err(err) = platform::setcpu(record.cpu()) {
            debug!("could not pin worker to cpu {}: {}", record.cpu(), err);
        }
    }

    signal::setup()?;

    let channel = Channel::new(stream)?;

    // The siblings share the record table but nothing of the network
    // runtime below; they branch into their own loops here.
    if id == WORKER_KEYMGR {
        return crate::keymgr::run(config, channel);
    }
    if id == WORKER_ACME {
        return crate::acme::run(config, channel);
    }

    let channel = Rc::new(RefCell::new(channel));
    let sender = MsgSender::new(channel.clone(), id);

    let mut events = EventQueue::new();
    events.register(channel.borrow().fd(), Source::Bus, true, false);

    let mut bus: MsgBus<WorkerCtx> = MsgBus::new(channel.clone());

    privdrop::apply(config, Role::Network)?;

    let listener_fds = hooks.listeners();
    for (i, fd) in listener_fds.iter().enumerate() {
        // accept readiness stays disarmed until the lock is won
        events.register(*fd, Source::Listener(i), false, false);
    }

    let mut domains = DomainMap::new();
    if let Some(keymgr) = &config.keymgr {
        for domain in &keymgr.domains {
            domains.insert(&domain.name);
        }
    }

    let mut ctx = WorkerCtx {
        config,
        region,
        slot,
        nworkers,
        no_lock: config.nlisteners() == 0,
        accept_avail: true,
        had_lock: false,
        quit: false,
        active_connections: 0,
        http_request_count: 0,
        last_seed: 0,
        next_timeo: 0,
        nlisteners: listener_fds.len(),
        sender,
        events,
        domains,
        rng: StdRng::from_entropy(),
        keymgr_active: config.keymgr_active(),
    };

    if ctx.keymgr_active {
        bus.register(MSG_CRL, worker_keymgr_response);
        bus.register(MSG_ENTROPY_RESP, worker_entropy_recv);
        bus.register(MSG_CERTIFICATE, worker_keymgr_response);
        bus.register(MSG_ACME_CHALLENGE_SET_CERT, worker_keymgr_response);
        bus.register(MSG_ACME_CHALLENGE_CLEAR_CERT, worker_keymgr_response);

        // A restarted slot cannot wait for the reseed tick: it needs the
        // certificate payloads now to rebuild its TLS contexts.
        if ctx.record().restarted() {
            ctx.sender.send(WORKER_KEYMGR, MSG_CERTIFICATE_REQ, &[])?;
        }
    }

    bus.register(MSG_ACCEPT_AVAILABLE, worker_accept_avail);

    if !config.quiet {
        info!(
            "worker {} started (cpu#{}, pid#{})",
            id,
            record.cpu(),
            record.pid()
        );
    }

    let mut worker = Worker {
        ctx,
        hooks,
        timers: TimerList::new(),
    };

    worker.hooks.configure(&mut worker.ctx, &mut worker.timers)?;
    worker.ctx.record().set_restarted(false);

    worker.run(&mut bus);

    // Teardown, in reverse of the init order above.
    worker.hooks.teardown(&mut worker.ctx);
    worker.ctx.make_busy();
    let _ = worker.ctx.sender.send(MSG_PARENT, MSG_SHUTDOWN, &[]);
    let _ = worker.ctx.sender.flush();
    worker.ctx.disable_accept();

    debug!("worker {} shutting down", id);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::MSG_ENTROPY_REQ;
    use crate::DOMAIN_NAME_LEN;

    struct Harness {
        ctx: WorkerCtx<'static>,
        peer: Channel,
    }

    fn harness(config: &'static Config, region: &'static Region, slot: usize) -> Harness {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let channel = Rc::new(RefCell::new(Channel::new(ours).unwrap()));
        let record = region.worker(slot);
        record.set_identity((slot - crate::WORKER_BASE + 1) as u16, 0);
        record.set_pid(nix::unistd::getpid().as_raw());
        record.set_running(true);

        let mut domains = DomainMap::new();
        if let Some(keymgr) = &config.keymgr {
            for domain in &keymgr.domains {
                domains.insert(&domain.name);
            }
        }

        Harness {
            ctx: WorkerCtx {
                config,
                region,
                slot,
                nworkers: config.worker_count,
                no_lock: config.nlisteners() == 0,
                accept_avail: true,
                had_lock: false,
                quit: false,
                active_connections: 0,
                http_request_count: 0,
                last_seed: 0,
                next_timeo: 0,
                nlisteners: config.nlisteners(),
                sender: MsgSender::new(channel.clone(), (slot - crate::WORKER_BASE + 1) as u16),
                events: EventQueue::new(),
                domains,
                rng: StdRng::from_entropy(),
                keymgr_active: config.keymgr_active(),
            },
            peer: Channel::new(theirs).unwrap(),
        }
    }

    fn leak_config(config: Config) -> &'static Config {
        Box::leak(Box::new(config))
    }

    fn leak_region(slots: usize) -> &'static Region {
        Box::leak(Box::new(Region::new(slots).unwrap()))
    }

    fn listening_config(workers: u16) -> Config {
        Config {
            worker_count: workers,
            listeners: vec![crate::config::ListenerConfig {
                addr: "127.0.0.1:8888".to_string(),
            }],
            ..Config::default()
        }
    }

    #[test]
    fn test_solo_pool_never_touches_lock_word() {
        let config = leak_config(listening_config(2));
        let region = leak_region(4);
        let mut harness = harness(config, region, crate::WORKER_BASE);

        assert!(harness.ctx.acceptlock_obtain());
        assert!(harness.ctx.record().has_lock());
        assert!(!region.lock().is_held());

        // and release never clears it either
        harness.ctx.active_connections = config.worker_max_connections;
        harness.ctx.acceptlock_release();
        assert!(harness.ctx.record().has_lock());
    }

    #[test]
    fn test_no_listeners_no_cas() {
        let config = leak_config(Config {
            worker_count: 8,
            ..Config::default()
        });
        let region = leak_region(10);
        let mut harness = harness(config, region, crate::WORKER_BASE);

        assert!(harness.ctx.no_lock);
        assert!(harness.ctx.acceptlock_obtain());
        assert!(!region.lock().is_held());

        // documented quirk: has_lock stays pinned true
        harness.ctx.active_connections = u32::MAX;
        harness.ctx.acceptlock_release();
        assert!(harness.ctx.record().has_lock());
    }

    #[test]
    fn test_obtain_declines_at_ceilings() {
        let config = leak_config(listening_config(8));
        let region = leak_region(10);
        let mut harness = harness(config, region, crate::WORKER_BASE);

        harness.ctx.active_connections = config.worker_max_connections;
        assert!(!harness.ctx.acceptlock_obtain());
        assert!(!region.lock().is_held());

        harness.ctx.active_connections = 0;
        harness.ctx.http_request_count = config.http_request_limit;
        assert!(!harness.ctx.acceptlock_obtain());
        assert!(!region.lock().is_held());
    }

    #[test]
    fn test_release_on_either_ceiling_broadcasts() {
        let config = leak_config(listening_config(8));
        let region = leak_region(10);
        let mut harness = harness(config, region, crate::WORKER_BASE);

        assert!(harness.ctx.acceptlock_obtain());
        assert!(region.lock().is_held());

        // below both ceilings the lock is kept
        harness.ctx.acceptlock_release();
        assert!(harness.ctx.record().has_lock());

        harness.ctx.http_request_count = config.http_request_limit;
        harness.ctx.acceptlock_release();
        assert!(!harness.ctx.record().has_lock());
        assert!(!region.lock().is_held());

        let frames = harness.peer.recv().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0.id, MSG_ACCEPT_AVAILABLE);
        assert_eq!(frames[0].0.dst, MSG_WORKER_ALL);
    }

    #[test]
    fn test_lock_handover_between_contexts() {
        let config = leak_config(listening_config(8));
        let region = leak_region(10);
        let mut a = harness(config, region, crate::WORKER_BASE);
        let mut b = harness(config, region, crate::WORKER_BASE + 1);

        assert!(a.ctx.acceptlock_obtain());
        assert!(!b.ctx.acceptlock_obtain());

        a.ctx.active_connections = config.worker_max_connections;
        a.ctx.acceptlock_release();

        assert!(b.ctx.acceptlock_obtain());
        assert!(b.ctx.record().has_lock());
        assert!(!a.ctx.record().has_lock());
    }

    #[test]
    fn test_make_busy_releases_and_is_idempotent() {
        let config = leak_config(listening_config(8));
        let region = leak_region(10);
        let mut harness = harness(config, region, crate::WORKER_BASE);

        assert!(harness.ctx.acceptlock_obtain());
        harness.ctx.make_busy();
        assert!(!harness.ctx.record().has_lock());
        assert!(!region.lock().is_held());

        harness.ctx.make_busy();
        assert_eq!(harness.peer.recv().unwrap().len(), 1);
    }

    #[test]
    fn test_netwait_clamps() {
        assert_eq!(compute_netwait(None, false, 0, false), None);
        assert_eq!(compute_netwait(Some(250), false, 0, false), Some(250));
        assert_eq!(compute_netwait(None, true, 0, false), Some(10));
        assert_eq!(compute_netwait(None, false, 3, false), Some(100));
        assert_eq!(compute_netwait(None, false, 0, true), Some(10));
        // an armed timer wins over the clamps
        assert_eq!(compute_netwait(Some(5), true, 3, true), Some(5));
    }

    fn keymgr_config() -> Config {
        Config {
            worker_count: 8,
            keymgr: Some(crate::config::KeymgrConfig {
                domains: vec![crate::config::DomainConfig {
                    name: "example.com".to_string(),
                    certfile: None,
                    crlfile: None,
                }],
                ..crate::config::KeymgrConfig::default()
            }),
            ..Config::default()
        }
    }

    #[test]
    fn test_keymgr_response_applies_certificate() {
        let config = leak_config(keymgr_config());
        let region = leak_region(10);
        let mut harness = harness(config, region, crate::WORKER_BASE);

        let raw = CertPayload::encode("example.com", b"pem").unwrap();
        let header = MsgHeader::new(MSG_CERTIFICATE, WORKER_KEYMGR, 1, raw.len());
        worker_keymgr_response(&mut harness.ctx, &header, &raw);

        let domain = harness.ctx.domains.lookup("example.com").unwrap();
        assert_eq!(domain.ctx().unwrap().chain, b"pem");
    }

    #[test]
    fn test_keymgr_response_short_message_mutates_nothing() {
        let config = leak_config(keymgr_config());
        let region = leak_region(10);
        let mut harness = harness(config, region, crate::WORKER_BASE);

        let header = MsgHeader::new(MSG_CERTIFICATE, WORKER_KEYMGR, 1, 3);
        worker_keymgr_response(&mut harness.ctx, &header, &[1, 2, 3]);

        let domain = harness.ctx.domains.lookup("example.com").unwrap();
        assert!(domain.ctx().is_none());
    }

    #[test]
    fn test_keymgr_response_unknown_domain_dropped() {
        let config = leak_config(keymgr_config());
        let region = leak_region(10);
        let mut harness = harness(config, region, crate::WORKER_BASE);

        let raw = CertPayload::encode("other.example", b"pem").unwrap();
        let header = MsgHeader::new(MSG_CERTIFICATE, WORKER_KEYMGR, 1, raw.len());
        worker_keymgr_response(&mut harness.ctx, &header, &raw);

        let domain = harness.ctx.domains.lookup("example.com").unwrap();
        assert!(domain.ctx().is_none());
    }

    #[test]
    fn test_challenge_set_clear_via_handlers() {
        let config = leak_config(keymgr_config());
        let region = leak_region(10);
        let mut harness = harness(config, region, crate::WORKER_BASE);

        let raw = CertPayload::encode("example.com", b"der").unwrap();
        let set = MsgHeader::new(MSG_ACME_CHALLENGE_SET_CERT, WORKER_KEYMGR, 1, raw.len());
        worker_keymgr_response(&mut harness.ctx, &set, &raw);
        {
            let domain = harness.ctx.domains.lookup("example.com").unwrap();
            assert!(domain.acme_challenge());
            assert_eq!(domain.acme_cert_len(), 3);
        }

        let raw = CertPayload::encode("example.com", &[]).unwrap();
        let clear = MsgHeader::new(MSG_ACME_CHALLENGE_CLEAR_CERT, WORKER_KEYMGR, 1, raw.len());
        worker_keymgr_response(&mut harness.ctx, &clear, &raw);
        let domain = harness.ctx.domains.lookup("example.com").unwrap();
        assert!(!domain.acme_challenge());
        assert_eq!(domain.acme_cert_len(), 0);
    }

    #[test]
    fn test_entropy_recv_reseeds_even_when_short() {
        let config = leak_config(keymgr_config());
        let region = leak_region(10);
        let mut harness = harness(config, region, crate::WORKER_BASE);

        let header = MsgHeader::new(MSG_ENTROPY_RESP, WORKER_KEYMGR, 1, 16);
        worker_entropy_recv(&mut harness.ctx, &header, &[7u8; 16]);

        let mut buf = [0u8; 8];
        harness.ctx.rng_fill(&mut buf);
        // not asserting randomness, only that the rng still works
        let _ = buf;
    }

    #[test]
    fn test_accept_avail_flag() {
        let config = leak_config(listening_config(8));
        let region = leak_region(10);
        let mut harness = harness(config, region, crate::WORKER_BASE);
        harness.ctx.accept_avail = false;

        let header = MsgHeader::new(MSG_ACCEPT_AVAILABLE, 2, MSG_WORKER_ALL, 0);
        worker_accept_avail(&mut harness.ctx, &header, &[]);
        assert!(harness.ctx.accept_avail);
    }

    #[test]
    fn test_domain_name_length_bound() {
        // the wire slot must accommodate the longest legal name
        let name = "a".repeat(DOMAIN_NAME_LEN);
        assert!(CertPayload::encode(&name, b"x").is_some());
    }

    #[test]
    fn test_entropy_req_sent_on_reseed_path() {
        let config = leak_config(keymgr_config());
        let region = leak_region(10);
        let harness = harness(config, region, crate::WORKER_BASE);

        harness
            .ctx
            .sender
            .send(WORKER_KEYMGR, MSG_ENTROPY_REQ, &[])
            .unwrap();

        let mut peer = harness.peer;
        let frames = peer.recv().unwrap();
        assert_eq!(frames[0].0.id, MSG_ENTROPY_REQ);
        assert_eq!(frames[0].0.dst, WORKER_KEYMGR);
    }
}
