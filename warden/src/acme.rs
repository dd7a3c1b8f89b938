//! The ACME sibling process.
//!
//! A further-isolated process that drives certificate provisioning.  It
//! talks to exactly one peer — the key-manager — over the bus: it receives
//! domain orders, arms and disarms TLS-ALPN-01 challenge certificates
//! while an order is in flight, and hands the provisioned chain back for
//! persistence and broadcast.  Like the keymgr it never touches the
//! accept lock and never arms a listener.
//!
//! The ACME wire protocol itself (directory, JOSE, HTTP exchange) is an
//! external collaborator behind [`AcmeClient`]; this module owns the
//! process lifecycle and the message flows.

use crate::{
    config::Config,
    keymgr::CertPayload,
    msg::{
        Channel, MsgBus, MsgHeader, MsgSender, MSG_ACME_CHALLENGE_CLEAR_CERT,
        MSG_ACME_CHALLENGE_SET_CERT, MSG_ACME_INSTALL_CERT, MSG_ACME_ORDER_DOMAIN, MSG_PARENT,
        MSG_SHUTDOWN,
    },
    platform::{self, EventQueue, Source},
    privdrop,
    sandbox::Role,
    signal, Error, Result, WORKER_ACME, WORKER_KEYMGR,
};
use nix::sys::signal::Signal;
use std::{cell::RefCell, rc::Rc};
use warden_log::{info, warn};

/// Challenge plumbing handed to the provisioning client: whatever it
/// arms here ends up on every network worker, relayed via the keymgr.
pub trait ChallengeOps {
    fn set_challenge_cert(&mut self, domain: &str, der: &[u8]) -> Result<()>;
    fn clear_challenge_cert(&mut self, domain: &str) -> Result<()>;
}

/// The provisioning protocol seam.
pub trait AcmeClient {
    /// Order a certificate for `domain`, driving challenge state through
    /// `ops`; returns the provisioned chain in PEM form.
    fn order(&mut self, domain: &str, ops: &mut dyn ChallengeOps) -> Result<Vec<u8>>;
}

/// Placeholder client used until a provider session is wired up; orders
/// fail soft and are retried on the next reload.
pub struct UnconfiguredClient {
    provider: String,
}

impl UnconfiguredClient {
    pub fn new(provider: &str) -> Self {
        Self {
            provider: provider.to_string(),
        }
    }
}

impl AcmeClient for UnconfiguredClient {
    fn order(&mut self, domain: &str, _ops: &mut dyn ChallengeOps) -> Result<Vec<u8>> {
        warn!("[{}] no session with {}, order deferred", domain, self.provider);
        Err(Error::Error("acme session not established"))
    }
}

struct BusChallengeOps<'a> {
    sender: &'a MsgSender,
}

impl ChallengeOps for BusChallengeOps<'_> {
    fn set_challenge_cert(&mut self, domain: &str, der: &[u8]) -> Result<()> {
        let raw = CertPayload::encode(domain, der)
            .ok_or(Error::Error("challenge domain too long"))?;
        self.sender
            .send(WORKER_KEYMGR, MSG_ACME_CHALLENGE_SET_CERT, &raw)
    }

    fn clear_challenge_cert(&mut self, domain: &str) -> Result<()> {
        let raw = CertPayload::encode(domain, &[])
            .ok_or(Error::Error("challenge domain too long"))?;
        self.sender
            .send(WORKER_KEYMGR, MSG_ACME_CHALLENGE_CLEAR_CERT, &raw)
    }
}

/// Run state of the ACME process.
pub struct Acme {
    sender: MsgSender,
    client: Box<dyn AcmeClient>,
    quit: bool,
}

fn acme_order_domain(acme: &mut Acme, _header: &MsgHeader, data: &[u8]) {
    let Ok(domain) = std::str::from_utf8(data) else {
        warn!("order for undecodable domain name");
        return;
    };

    info!("[{}] order received", domain);

    let mut ops = BusChallengeOps {
        sender: &acme.sender,
    };
    let result = acme.client.order(domain, &mut ops);

    // Whatever the challenge left behind is disarmed, success or not: an
    // order can arm the challenge and still fail afterwards, and a failed
    // order must not leave challenge certs on the workers.
    if let Err(err) = ops.clear_challenge_cert(domain) {
        warn!("[{}] failed to clear challenge: {}", domain, err);
    }

    let chain = match result {
        Ok(chain) => chain,
        Err(err) => {
            warn!("[{}] order failed: {}", domain, err);
            return;
        }
    };

    match CertPayload::encode(domain, &chain) {
        Some(raw) => {
            if let Err(err) = acme
                .sender
                .send(WORKER_KEYMGR, MSG_ACME_INSTALL_CERT, &raw)
            {
                warn!("[{}] failed to hand off certificate: {}", domain, err);
            }
        }
        None => warn!("[{}] domain name does not fit payload", domain),
    }
}

/// Entry point of the ACME process.
pub fn run(config: &Config, channel: Channel) -> Result<()> {
    platform::proctitle("acme");
    signal::setup()?;

    let channel = Rc::new(RefCell::new(channel));
    let sender = MsgSender::new(channel.clone(), WORKER_ACME);

    let mut bus: MsgBus<Acme> = MsgBus::new(channel.clone());
    bus.register(MSG_ACME_ORDER_DOMAIN, acme_order_domain);

    privdrop::apply(config, Role::Acme)?;

    let provider = config
        .acme
        .as_ref()
        .map(|a| a.provider.as_str())
        .unwrap_or_default();

    let mut acme = Acme {
        sender,
        client: Box::new(UnconfiguredClient::new(provider)),
        quit: false,
    };

    if !config.quiet {
        info!("acme started, provider: {}", provider);
    }

    let mut events = EventQueue::new();
    events.register(channel.borrow().fd(), Source::Bus, true, false);

    while !acme.quit {
        events.set_write(Source::Bus, channel.borrow().wants_write());

        let ready = events.wait(Some(1_000))?;
        for readiness in ready {
            if readiness.writable {
                let _ = channel.borrow_mut().flush();
            }
            if readiness.readable && bus.dispatch(&mut acme).is_err() {
                acme.quit = true;
            }
        }

        match signal::take() {
            Some(Signal::SIGQUIT) | Some(Signal::SIGINT) | Some(Signal::SIGTERM) => {
                acme.quit = true;
            }
            _ => {}
        }
    }

    let _ = acme.sender.send(MSG_PARENT, MSG_SHUTDOWN, &[]);
    let _ = channel.borrow_mut().flush();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::{MsgHeader, MSG_ACME_ORDER_DOMAIN};
    use std::os::unix::net::UnixStream;

    struct StubClient {
        chain: Vec<u8>,
        der: Vec<u8>,
    }

    impl AcmeClient for StubClient {
        fn order(&mut self, domain: &str, ops: &mut dyn ChallengeOps) -> Result<Vec<u8>> {
            ops.set_challenge_cert(domain, &self.der)?;
            Ok(self.chain.clone())
        }
    }

    fn test_acme() -> (Acme, Channel) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let channel = Rc::new(RefCell::new(Channel::new(ours).unwrap()));
        let acme = Acme {
            sender: MsgSender::new(channel, WORKER_ACME),
            client: Box::new(StubClient {
                chain: b"pem chain".to_vec(),
                der: b"challenge der".to_vec(),
            }),
            quit: false,
        };
        (acme, Channel::new(theirs).unwrap())
    }

    #[test]
    fn test_order_emits_challenge_and_install() {
        let (mut acme, mut peer) = test_acme();

        let header = MsgHeader::new(MSG_ACME_ORDER_DOMAIN, WORKER_KEYMGR, WORKER_ACME, 11);
        acme_order_domain(&mut acme, &header, b"example.com");

        let frames = peer.recv().unwrap();
        let ids: Vec<u32> = frames.iter().map(|(h, _)| h.id).collect();
        assert_eq!(
            ids,
            vec![
                MSG_ACME_CHALLENGE_SET_CERT,
                MSG_ACME_CHALLENGE_CLEAR_CERT,
                MSG_ACME_INSTALL_CERT
            ]
        );

        let set = CertPayload::parse(&frames[0].1).unwrap();
        assert_eq!(set.domain, "example.com");
        assert_eq!(set.data, b"challenge der");

        let install = CertPayload::parse(&frames[2].1).unwrap();
        assert_eq!(install.data, b"pem chain");
    }

    #[test]
    fn test_failed_order_installs_nothing() {
        let (mut acme, mut peer) = test_acme();
        acme.client = Box::new(UnconfiguredClient::new("https://acme.example"));

        let header = MsgHeader::new(MSG_ACME_ORDER_DOMAIN, WORKER_KEYMGR, WORKER_ACME, 1);
        acme_order_domain(&mut acme, &header, b"x");

        // the challenge is disarmed even though nothing armed it
        let frames = peer.recv().unwrap();
        let ids: Vec<u32> = frames.iter().map(|(h, _)| h.id).collect();
        assert_eq!(ids, vec![MSG_ACME_CHALLENGE_CLEAR_CERT]);
    }

    struct ArmThenFailClient;

    impl AcmeClient for ArmThenFailClient {
        fn order(&mut self, domain: &str, ops: &mut dyn ChallengeOps) -> Result<Vec<u8>> {
            // ownership proof succeeds, the CA rejects afterwards
            ops.set_challenge_cert(domain, b"challenge der")?;
            Err(crate::Error::Error("order rejected"))
        }
    }

    #[test]
    fn test_armed_then_failed_order_still_clears_challenge() {
        let (mut acme, mut peer) = test_acme();
        acme.client = Box::new(ArmThenFailClient);

        let header = MsgHeader::new(MSG_ACME_ORDER_DOMAIN, WORKER_KEYMGR, WORKER_ACME, 11);
        acme_order_domain(&mut acme, &header, b"example.com");

        let frames = peer.recv().unwrap();
        let ids: Vec<u32> = frames.iter().map(|(h, _)| h.id).collect();
        assert_eq!(
            ids,
            vec![MSG_ACME_CHALLENGE_SET_CERT, MSG_ACME_CHALLENGE_CLEAR_CERT]
        );

        let clear = CertPayload::parse(&frames[1].1).unwrap();
        assert_eq!(clear.domain, "example.com");
        assert!(clear.data.is_empty());
    }
}
