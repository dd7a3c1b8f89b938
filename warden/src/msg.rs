//! Parent-mediated message bus between warden processes.
//!
//! Every worker owns one half of an AF_UNIX socketpair whose other half
//! stays with the supervisor.  The bus is point-to-point, reliable and
//! ordered per (sender, receiver) pair: a worker addresses the supervisor
//! ([`MSG_PARENT`]), a specific worker id, or every worker
//! ([`MSG_WORKER_ALL`]); the supervisor relays anything not addressed to
//! itself.  This is the sole cross-process channel — shared memory is
//! reserved for the accept lock and the worker record table.
//!
//! Workers drive their end synchronously from the event loop over a
//! non-blocking stream: reads reassemble frames across short reads,
//! writes queue and drain on write-readiness.  The supervisor drives its
//! ends from the tokio runtime, one reader task per live slot.

use crate::{Error, Result};
use std::{
    cell::RefCell,
    collections::HashMap,
    io::{Read, Write},
    mem,
    os::unix::io::{AsRawFd, RawFd},
    os::unix::net::UnixStream,
    rc::Rc,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::unix::{OwnedReadHalf, OwnedWriteHalf},
    sync::mpsc,
    task::JoinHandle,
};
use warden_log::debug;
use zerocopy::{AsBytes, FromBytes};

/// Destination id naming the supervisor.
pub const MSG_PARENT: u16 = 1000;

/// Destination id naming every network worker.
pub const MSG_WORKER_ALL: u16 = 1001;

/// A worker announces orderly shutdown to the supervisor.
pub const MSG_SHUTDOWN: u32 = 1;
/// Worker → keymgr: request a fresh entropy buffer.
pub const MSG_ENTROPY_REQ: u32 = 2;
/// Keymgr → worker: 1024 bytes for the worker RNG.
pub const MSG_ENTROPY_RESP: u32 = 3;
/// Keymgr → worker: a domain's certificate chain (PEM).
pub const MSG_CERTIFICATE: u32 = 4;
/// Worker → keymgr: repopulate my TLS contexts (sent after a restart).
pub const MSG_CERTIFICATE_REQ: u32 = 5;
/// Keymgr → worker: a domain's CRL payload.
pub const MSG_CRL: u32 = 6;
/// Lock holder → all workers: the accept lock is up for grabs.
pub const MSG_ACCEPT_AVAILABLE: u32 = 7;
/// Keymgr → worker: arm a TLS-ALPN-01 challenge certificate (DER).
pub const MSG_ACME_CHALLENGE_SET_CERT: u32 = 8;
/// Keymgr → worker: disarm a domain's challenge certificate.
pub const MSG_ACME_CHALLENGE_CLEAR_CERT: u32 = 9;
/// Keymgr → acme: provision a certificate for a domain.
pub const MSG_ACME_ORDER_DOMAIN: u32 = 10;
/// Acme → keymgr: a provisioned certificate to persist and broadcast.
pub const MSG_ACME_INSTALL_CERT: u32 = 11;

/// Upper bound on a single payload; anything larger is a framing bug.
pub const MSG_MAX_PAYLOAD: usize = 4 * 1024 * 1024;

/// Ceiling on queued unsent bytes before sends start failing; sends on
/// the bus must never block, and a backlog this deep means the peer is
/// gone or wedged.
const WBUF_MAX: usize = 8 * 1024 * 1024;

/// Wire header preceding every payload.
#[derive(Debug, Default, Clone, Copy, AsBytes, FromBytes)]
#[repr(C)]
pub struct MsgHeader {
    /// Message type.
    pub id: u32,
    /// Payload length, excluding this header.
    pub length: u32,
    /// Worker id of the sender ([`MSG_PARENT`] for the supervisor).
    pub src: u16,
    /// Destination worker id, [`MSG_PARENT`] or [`MSG_WORKER_ALL`].
    pub dst: u16,
}

pub const HEADER_LEN: usize = mem::size_of::<MsgHeader>();

impl MsgHeader {
    pub fn new(id: u32, src: u16, dst: u16, length: usize) -> Self {
        Self {
            id,
            length: length as u32,
            src,
            dst,
        }
    }
}

/// Synchronous, non-blocking framed channel over one socketpair half.
pub struct Channel {
    stream: UnixStream,
    rbuf: Vec<u8>,
    wbuf: Vec<u8>,
    closed: bool,
}

impl Channel {
    pub fn new(stream: UnixStream) -> Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self {
            stream,
            rbuf: Vec::new(),
            wbuf: Vec::new(),
            closed: false,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// Queue one frame and opportunistically drain the queue.
    pub fn send(&mut self, header: MsgHeader, payload: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Error::ChannelClosed);
        }
        if self.wbuf.len() + HEADER_LEN + payload.len() > WBUF_MAX {
            return Err(Error::ShortWrite);
        }

        self.wbuf.extend_from_slice(header.as_bytes());
        self.wbuf.extend_from_slice(payload);
        self.flush()?;
        Ok(())
    }

    /// Drain queued output; `Ok(true)` when the queue is empty.
    pub fn flush(&mut self) -> Result<bool> {
        while !self.wbuf.is_empty() {
            match self.stream.write(&self.wbuf) {
                Ok(0) => {
                    self.closed = true;
                    return Err(Error::ChannelClosed);
                }
                Ok(n) => {
                    self.wbuf.drain(..n);
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    return Ok(false);
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => {
                    self.closed = true;
                    return Err(Error::ChannelClosed);
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(true)
    }

    /// Whether the event loop should watch this fd for writability.
    pub fn wants_write(&self) -> bool {
        !self.wbuf.is_empty()
    }

    /// Read whatever the socket holds and return every complete frame.
    ///
    /// End-of-file surfaces as [`Error::ChannelClosed`] once all buffered
    /// frames have been handed out; for a worker that means the
    /// supervisor is gone.
    pub fn recv(&mut self) -> Result<Vec<(MsgHeader, Vec<u8>)>> {
        let mut tmp = [0u8; 16 * 1024];
        loop {
            match self.stream.read(&mut tmp) {
                Ok(0) => {
                    self.closed = true;
                    break;
                }
                Ok(n) => self.rbuf.extend_from_slice(&tmp[..n]),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }

        let mut frames = Vec::new();
        loop {
            if self.rbuf.len() < HEADER_LEN {
                break;
            }
            let header = MsgHeader::read_from(&self.rbuf[..HEADER_LEN])
                .ok_or(Error::Error("unreadable message header"))?;
            let length = header.length as usize;
            if length > MSG_MAX_PAYLOAD {
                return Err(Error::Error("oversized message payload"));
            }
            if self.rbuf.len() < HEADER_LEN + length {
                break;
            }
            let payload = self.rbuf[HEADER_LEN..HEADER_LEN + length].to_vec();
            self.rbuf.drain(..HEADER_LEN + length);
            frames.push((header, payload));
        }

        if frames.is_empty() && self.closed {
            return Err(Error::ChannelClosed);
        }

        Ok(frames)
    }
}

/// Message handler: receives the registered context, the header and the
/// payload bytes.
pub type Handler<C> = fn(&mut C, &MsgHeader, &[u8]);

/// The worker-side bus: the shared channel plus the handler registry.
pub struct MsgBus<C> {
    channel: Rc<RefCell<Channel>>,
    handlers: HashMap<u32, Handler<C>>,
}

impl<C> MsgBus<C> {
    pub fn new(channel: Rc<RefCell<Channel>>) -> Self {
        Self {
            channel,
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, id: u32, handler: Handler<C>) {
        self.handlers.insert(id, handler);
    }

    /// Drain the channel and dispatch every complete frame.
    pub fn dispatch(&mut self, ctx: &mut C) -> Result<()> {
        let frames = self.channel.borrow_mut().recv()?;
        for (header, payload) in frames {
            match self.handlers.get(&header.id) {
                Some(handler) => handler(ctx, &header, &payload),
                None => debug!("no handler for message {}", header.id),
            }
        }
        Ok(())
    }
}

/// Cloneable sending half handed to contexts that emit messages.
#[derive(Clone)]
pub struct MsgSender {
    channel: Rc<RefCell<Channel>>,
    our_id: u16,
}

impl MsgSender {
    pub fn new(channel: Rc<RefCell<Channel>>, our_id: u16) -> Self {
        Self { channel, our_id }
    }

    pub fn send(&self, dst: u16, id: u32, payload: &[u8]) -> Result<()> {
        let header = MsgHeader::new(id, self.our_id, dst, payload.len());
        self.channel.borrow_mut().send(header, payload)
    }

    pub fn fd(&self) -> RawFd {
        self.channel.borrow().fd()
    }

    pub fn wants_write(&self) -> bool {
        self.channel.borrow().wants_write()
    }

    pub fn flush(&self) -> Result<bool> {
        self.channel.borrow_mut().flush()
    }
}

/// Supervisor-side sending half of one slot's pair.
pub struct PeerSender {
    write: OwnedWriteHalf,
}

impl PeerSender {
    pub fn new(write: OwnedWriteHalf) -> Self {
        Self { write }
    }

    pub async fn send(&mut self, header: MsgHeader, payload: &[u8]) -> std::io::Result<()> {
        self.write.write_all(header.as_bytes()).await?;
        if !payload.is_empty() {
            self.write.write_all(payload).await?;
        }
        Ok(())
    }
}

/// Frames arriving at the supervisor, tagged with the slot they came from.
pub type PeerFrame = (usize, MsgHeader, Vec<u8>);

/// Spawn the reader task for one slot's pair; it runs until the child
/// closes its end or the frame stream turns invalid.
pub fn spawn_peer_reader(
    slot: usize,
    mut read: OwnedReadHalf,
    tx: mpsc::UnboundedSender<PeerFrame>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let mut header_buf = [0u8; HEADER_LEN];
            if read.read_exact(&mut header_buf).await.is_err() {
                break;
            }
            let header = match MsgHeader::read_from(&header_buf[..]) {
                Some(header) => header,
                None => break,
            };
            if header.length as usize > MSG_MAX_PAYLOAD {
                break;
            }
            let mut payload = vec![0u8; header.length as usize];
            if !payload.is_empty() && read.read_exact(&mut payload).await.is_err() {
                break;
            }
            if tx.send((slot, header, payload)).is_err() {
                break;
            }
        }
    })
}
