//! The key-manager sibling process.
//!
//! The keymgr shares the worker record structure but diverges immediately
//! after fork: it never initializes the network stack, never contends for
//! the accept lock, and runs under a sandbox profile that permits the
//! private-key and filesystem operations network workers are denied.  Its
//! run loop consumes bus messages and answers with certificate, CRL and
//! entropy payloads.

use crate::{
    config::Config,
    msg::{
        Channel, MsgBus, MsgHeader, MsgSender, MSG_ACME_CHALLENGE_CLEAR_CERT,
        MSG_ACME_CHALLENGE_SET_CERT, MSG_ACME_INSTALL_CERT, MSG_ACME_ORDER_DOMAIN,
        MSG_CERTIFICATE, MSG_CERTIFICATE_REQ, MSG_CRL, MSG_ENTROPY_REQ, MSG_ENTROPY_RESP,
        MSG_PARENT, MSG_SHUTDOWN, MSG_WORKER_ALL,
    },
    platform::{self, EventQueue, Source},
    privdrop,
    sandbox::Role,
    signal, Result, DOMAIN_NAME_LEN, ENTROPY_LEN, WORKER_ACME, WORKER_KEYMGR,
};
use nix::sys::signal::Signal;
use rand::{rngs::OsRng, RngCore};
use std::{cell::RefCell, fmt, fs, mem, path::PathBuf, rc::Rc};
use warden_log::{debug, info, warn};
use zerocopy::{AsBytes, FromBytes};

/// Fixed-width header of every certificate-shaped payload on the bus:
/// a NUL-terminated domain slot followed by the length of the data that
/// trails the header.
#[derive(Clone, Copy, AsBytes, FromBytes)]
#[repr(C)]
pub struct CertHeader {
    pub domain: [u8; DOMAIN_NAME_LEN + 1],
    pub data_len: u32,
}

pub const CERT_HEADER_LEN: usize = mem::size_of::<CertHeader>();

/// A parsed and validated certificate-shaped payload.
#[derive(Debug, PartialEq, Eq)]
pub struct CertPayload<'a> {
    pub domain: &'a str,
    pub data: &'a [u8],
}

/// Validation failures; each maps to exactly one log line at the caller.
#[derive(Debug, PartialEq, Eq)]
pub enum CertPayloadError {
    /// Header not even present.
    Short(usize),
    /// Total size disagrees with the declared data length.
    Mismatch(usize),
    /// Domain slot not NUL-terminated.
    Domain,
}

impl fmt::Display for CertPayloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CertPayloadError::Short(len) => write!(f, "short keymgr message ({})", len),
            CertPayloadError::Mismatch(len) => write!(f, "invalid keymgr payload ({})", len),
            CertPayloadError::Domain => write!(f, "domain not NUL-terminated"),
        }
    }
}

impl<'a> CertPayload<'a> {
    /// Validate a raw payload: header present, total length equals header
    /// plus declared data, domain NUL-terminated within its slot.
    pub fn parse(raw: &'a [u8]) -> std::result::Result<Self, CertPayloadError> {
        if raw.len() < CERT_HEADER_LEN {
            return Err(CertPayloadError::Short(raw.len()));
        }

        let header = CertHeader::read_from(&raw[..CERT_HEADER_LEN])
            .ok_or(CertPayloadError::Short(raw.len()))?;

        if raw.len() != CERT_HEADER_LEN + header.data_len as usize {
            return Err(CertPayloadError::Mismatch(raw.len()));
        }

        if header.domain[DOMAIN_NAME_LEN] != 0 {
            return Err(CertPayloadError::Domain);
        }

        let nul = raw[..=DOMAIN_NAME_LEN]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(DOMAIN_NAME_LEN);
        let domain =
            std::str::from_utf8(&raw[..nul]).map_err(|_| CertPayloadError::Domain)?;

        Ok(Self {
            domain,
            data: &raw[CERT_HEADER_LEN..],
        })
    }

    /// Frame `data` for `domain` into a bus payload.
    pub fn encode(domain: &str, data: &[u8]) -> Option<Vec<u8>> {
        if domain.is_empty() || domain.len() > DOMAIN_NAME_LEN {
            return None;
        }

        let mut raw = Vec::with_capacity(CERT_HEADER_LEN + data.len());
        raw.extend_from_slice(domain.as_bytes());
        raw.resize(DOMAIN_NAME_LEN + 1, 0);
        raw.extend_from_slice(&(data.len() as u32).to_ne_bytes());
        raw.extend_from_slice(data);
        Some(raw)
    }
}

struct ManagedDomain {
    name: String,
    certfile: Option<PathBuf>,
    crlfile: Option<PathBuf>,
    cert: Option<Vec<u8>>,
    crl: Option<Vec<u8>>,
}

/// Run state of the key-manager process.
pub struct Keymgr {
    sender: MsgSender,
    domains: Vec<ManagedDomain>,
    acme_active: bool,
    quit: bool,
}

impl Keymgr {
    fn load_domains(&mut self) {
        for domain in &mut self.domains {
            if let Some(certfile) = &domain.certfile {
                match fs::read(certfile) {
                    Ok(data) => domain.cert = Some(data),
                    Err(err) => {
                        warn!("no certificate for {}: {}", domain.name, err);
                        domain.cert = None;
                    }
                }
            }
            if let Some(crlfile) = &domain.crlfile {
                match fs::read(crlfile) {
                    Ok(data) => domain.crl = Some(data),
                    Err(err) => {
                        warn!("no crl for {}: {}", domain.name, err);
                        domain.crl = None;
                    }
                }
            }
        }
    }

    /// Send every loaded certificate and CRL to `dst`.
    fn submit_certificates(&self, dst: u16) {
        for domain in &self.domains {
            if let Some(cert) = &domain.cert {
                if let Some(raw) = CertPayload::encode(&domain.name, cert) {
                    if let Err(err) = self.sender.send(dst, MSG_CERTIFICATE, &raw) {
                        warn!("failed to submit certificate for {}: {}", domain.name, err);
                    }
                }
            }
            if let Some(crl) = &domain.crl {
                if let Some(raw) = CertPayload::encode(&domain.name, crl) {
                    if let Err(err) = self.sender.send(dst, MSG_CRL, &raw) {
                        warn!("failed to submit crl for {}: {}", domain.name, err);
                    }
                }
            }
        }
    }

    /// Ask the ACME sibling to provision every domain we hold no
    /// certificate for.
    fn order_missing(&self) {
        if !self.acme_active {
            return;
        }
        for domain in self.domains.iter().filter(|d| d.cert.is_none()) {
            info!("[{}] ordering certificate", domain.name);
            if let Err(err) =
                self.sender
                    .send(WORKER_ACME, MSG_ACME_ORDER_DOMAIN, domain.name.as_bytes())
            {
                warn!("failed to order certificate for {}: {}", domain.name, err);
            }
        }
    }
}

fn keymgr_entropy_req(keymgr: &mut Keymgr, header: &MsgHeader, _data: &[u8]) {
    let mut entropy = [0u8; ENTROPY_LEN];
    OsRng.fill_bytes(&mut entropy);
    if let Err(err) = keymgr.sender.send(header.src, MSG_ENTROPY_RESP, &entropy) {
        warn!("failed to answer entropy request: {}", err);
    }
}

fn keymgr_certificate_req(keymgr: &mut Keymgr, header: &MsgHeader, _data: &[u8]) {
    debug!("certificate request from worker {}", header.src);
    keymgr.submit_certificates(header.src);
}

/// A provisioned certificate arriving from the ACME sibling: persist it,
/// cache it and hand it to every network worker.
fn keymgr_acme_install(keymgr: &mut Keymgr, _header: &MsgHeader, data: &[u8]) {
    let payload = match CertPayload::parse(data) {
        Ok(payload) => payload,
        Err(err) => {
            warn!("{}", err);
            return;
        }
    };

    let Some(domain) = keymgr
        .domains
        .iter_mut()
        .find(|d| d.name == payload.domain)
    else {
        warn!("got acme certificate for domain that does not exist");
        return;
    };

    if let Some(certfile) = &domain.certfile {
        if let Err(err) = fs::write(certfile, payload.data) {
            warn!("[{}] failed to persist certificate: {}", domain.name, err);
        }
    }
    domain.cert = Some(payload.data.to_vec());

    info!("[{}] certificate provisioned", payload.domain);
    if let Err(err) = keymgr.sender.send(MSG_WORKER_ALL, MSG_CERTIFICATE, data) {
        warn!("failed to broadcast certificate: {}", err);
    }
}

/// Challenge set/clear from the ACME sibling is relayed verbatim to the
/// network workers; the keymgr is the only process the sibling talks to.
fn keymgr_challenge_relay(keymgr: &mut Keymgr, header: &MsgHeader, data: &[u8]) {
    if let Err(err) = CertPayload::parse(data) {
        warn!("{}", err);
        return;
    }
    if let Err(err) = keymgr.sender.send(MSG_WORKER_ALL, header.id, data) {
        warn!("failed to relay challenge update: {}", err);
    }
}

/// Entry point of the keymgr process; never returns to the caller's loop.
pub fn run(config: &Config, channel: Channel) -> Result<()> {
    platform::proctitle("keymgr");
    signal::setup()?;

    let channel = Rc::new(RefCell::new(channel));
    let sender = MsgSender::new(channel.clone(), WORKER_KEYMGR);

    let mut bus: MsgBus<Keymgr> = MsgBus::new(channel.clone());
    bus.register(MSG_ENTROPY_REQ, keymgr_entropy_req);
    bus.register(MSG_CERTIFICATE_REQ, keymgr_certificate_req);
    bus.register(MSG_ACME_INSTALL_CERT, keymgr_acme_install);
    bus.register(MSG_ACME_CHALLENGE_SET_CERT, keymgr_challenge_relay);
    bus.register(MSG_ACME_CHALLENGE_CLEAR_CERT, keymgr_challenge_relay);

    privdrop::apply(config, Role::Keymgr)?;

    let domains = config
        .keymgr
        .as_ref()
        .map(|k| k.domains.as_slice())
        .unwrap_or_default()
        .iter()
        .map(|d| ManagedDomain {
            name: d.name.clone(),
            certfile: d.certfile.clone(),
            crlfile: d.crlfile.clone(),
            cert: None,
            crl: None,
        })
        .collect();

    let mut keymgr = Keymgr {
        sender,
        domains,
        acme_active: config.acme_active(),
        quit: false,
    };

    keymgr.load_domains();
    keymgr.order_missing();

    if !config.quiet {
        info!("keymgr started");
    }

    let mut events = EventQueue::new();
    events.register(channel.borrow().fd(), Source::Bus, true, false);

    while !keymgr.quit {
        events.set_write(Source::Bus, channel.borrow().wants_write());

        let ready = events.wait(Some(1_000))?;
        for readiness in ready {
            if readiness.writable {
                let _ = channel.borrow_mut().flush();
            }
            if readiness.readable {
                if bus.dispatch(&mut keymgr).is_err() {
                    // supervisor gone; nothing left to serve
                    keymgr.quit = true;
                }
            }
        }

        match signal::take() {
            Some(Signal::SIGHUP) => {
                info!("keymgr reloading certificates");
                keymgr.load_domains();
                keymgr.submit_certificates(MSG_WORKER_ALL);
                keymgr.order_missing();
            }
            Some(Signal::SIGQUIT) | Some(Signal::SIGINT) | Some(Signal::SIGTERM) => {
                keymgr.quit = true;
            }
            _ => {}
        }
    }

    let _ = keymgr.sender.send(MSG_PARENT, MSG_SHUTDOWN, &[]);
    let _ = channel.borrow_mut().flush();

    Ok(())
}
