//! STUN binding checks on an established peer-to-peer path.
//!
//! [`StunKeepalive`] confirms the direct path with binding request/response
//! pairs and gives up after a fixed stretch of silence. Packet parsing and
//! building sit behind [`BindingCodec`], and outgoing bytes go through
//! [`PacketSink`], so the state machine runs without a real socket in tests.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const MAGIC_COOKIE: u32 = 0x2112_A442;
pub const BINDING_REQUEST: u16 = 0x0001;
pub const BINDING_RESPONSE: u16 = 0x0101;
pub const ATTR_USERNAME: u16 = 0x0006;
pub const HEADER_LEN: usize = 20;

/// First retry interval, and the floor it is clamped back to.
pub const INITIAL_INTERVAL: Duration = Duration::from_millis(500);
/// Silence after which the interval grows to half the silence.
pub const BACKOFF_AFTER: Duration = Duration::from_millis(5000);
/// Silence after which the peer is presumed gone.
pub const ABANDON_AFTER: Duration = Duration::from_millis(15000);

/// Transaction ids remembered for matching responses.
const SENT_HISTORY: usize = 32;

pub type TransactionId = [u8; 12];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StunError {
    #[error("packet too short: {0} bytes")]
    TooShort(usize),

    #[error("missing magic cookie")]
    BadCookie,

    #[error("not a binding message: 0x{0:04x}")]
    NotBinding(u16),

    #[error("malformed attribute")]
    Malformed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    Request,
    Response,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingPacket {
    pub kind: BindingKind,
    pub transaction_id: TransactionId,
    pub username: Option<String>,
}

/// The STUN library boundary.
pub trait BindingCodec: Send + Sync + 'static {
    fn parse(&self, bytes: &[u8]) -> Result<BindingPacket, StunError>;
    fn build_request(&self, transaction_id: TransactionId, username: &str) -> Vec<u8>;
    fn build_response(&self, transaction_id: TransactionId) -> Vec<u8>;
}

/// Cheap header check: top two bits clear and the magic cookie in place.
pub fn is_stun(bytes: &[u8]) -> bool {
    bytes.len() >= HEADER_LEN
        && bytes[0] & 0xC0 == 0
        && u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) == MAGIC_COOKIE
}

/// Minimal RFC 5389 codec: binding messages with an optional USERNAME.
#[derive(Debug, Clone, Copy, Default)]
pub struct StunCodec;

impl StunCodec {
    fn header(msg_type: u16, body_len: usize, transaction_id: &TransactionId) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + body_len);
        out.extend_from_slice(&msg_type.to_be_bytes());
        out.extend_from_slice(&(body_len as u16).to_be_bytes());
        out.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        out.extend_from_slice(transaction_id);
        out
    }
}

impl BindingCodec for StunCodec {
    fn parse(&self, bytes: &[u8]) -> Result<BindingPacket, StunError> {
        if bytes.len() < HEADER_LEN {
            return Err(StunError::TooShort(bytes.len()));
        }
        if !is_stun(bytes) {
            return Err(StunError::BadCookie);
        }
        let msg_type = u16::from_be_bytes([bytes[0], bytes[1]]);
        let kind = match msg_type {
            BINDING_REQUEST => BindingKind::Request,
            BINDING_RESPONSE => BindingKind::Response,
            other => return Err(StunError::NotBinding(other)),
        };
        let body_len = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        let body = bytes
            .get(HEADER_LEN..HEADER_LEN + body_len)
            .ok_or(StunError::Malformed)?;

        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&bytes[8..HEADER_LEN]);

        let mut username = None;
        let mut rest = body;
        while rest.len() >= 4 {
            let attr_type = u16::from_be_bytes([rest[0], rest[1]]);
            let attr_len = u16::from_be_bytes([rest[2], rest[3]]) as usize;
            let value = rest.get(4..4 + attr_len).ok_or(StunError::Malformed)?;
            if attr_type == ATTR_USERNAME {
                let name = std::str::from_utf8(value).map_err(|_| StunError::Malformed)?;
                username = Some(name.to_string());
            }
            let padded = (attr_len + 3) & !3;
            rest = rest.get(4 + padded..).unwrap_or_default();
        }

        Ok(BindingPacket {
            kind,
            transaction_id,
            username,
        })
    }

    fn build_request(&self, transaction_id: TransactionId, username: &str) -> Vec<u8> {
        let name = username.as_bytes();
        let padded = (name.len() + 3) & !3;
        let mut out = Self::header(BINDING_REQUEST, 4 + padded, &transaction_id);
        out.extend_from_slice(&ATTR_USERNAME.to_be_bytes());
        out.extend_from_slice(&(name.len() as u16).to_be_bytes());
        out.extend_from_slice(name);
        out.resize(HEADER_LEN + 4 + padded, 0);
        out
    }

    fn build_response(&self, transaction_id: TransactionId) -> Vec<u8> {
        Self::header(BINDING_RESPONSE, 0, &transaction_id)
    }
}

/// Where outgoing STUN packets go.
pub trait PacketSink: Send + Sync + 'static {
    fn send_packet(&self, packet: Vec<u8>) -> io::Result<()>;
}

/// A UDP socket bound to one remote address.
#[derive(Debug, Clone)]
pub struct UdpPacketSink {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
}

impl UdpPacketSink {
    pub fn new(socket: Arc<UdpSocket>, remote: SocketAddr) -> Self {
        Self { socket, remote }
    }
}

impl PacketSink for UdpPacketSink {
    fn send_packet(&self, packet: Vec<u8>) -> io::Result<()> {
        self.socket.try_send_to(&packet, self.remote).map(|_| ())
    }
}

impl PacketSink for mpsc::UnboundedSender<Vec<u8>> {
    fn send_packet(&self, packet: Vec<u8>) -> io::Result<()> {
        self.send(packet)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "packet receiver dropped"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveState {
    Idle,
    Checking,
    Ready,
    Abandoned,
}

impl KeepaliveState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, KeepaliveState::Ready | KeepaliveState::Abandoned)
    }
}

#[derive(Debug)]
struct Inner {
    local_ready: bool,
    retrying: bool,
    last_recv: Instant,
    sent: VecDeque<TransactionId>,
}

/// Binding-check state machine for one direct connection.
pub struct StunKeepalive<C, S> {
    local_id: String,
    remote_id: String,
    codec: C,
    sink: S,
    inner: Mutex<Inner>,
    state: watch::Sender<KeepaliveState>,
}

impl<C: BindingCodec, S: PacketSink> StunKeepalive<C, S> {
    pub fn new(local_id: impl Into<String>, remote_id: impl Into<String>, codec: C, sink: S) -> Arc<Self> {
        let (state, _) = watch::channel(KeepaliveState::Idle);
        Arc::new(Self {
            local_id: local_id.into(),
            remote_id: remote_id.into(),
            codec,
            sink,
            inner: Mutex::new(Inner {
                local_ready: false,
                retrying: false,
                last_recv: Instant::now(),
                sent: VecDeque::new(),
            }),
            state,
        })
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> KeepaliveState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<KeepaliveState> {
        self.state.subscribe()
    }

    /// Allow answering the remote's binding requests.
    pub fn set_local_ready(&self, ready: bool) {
        self.inner().local_ready = ready;
    }

    /// Begin checking; the silence clock starts now.
    pub fn start(self: &Arc<Self>) {
        self.inner().last_recv = Instant::now();
        self.spawn_retry_loop();
    }

    /// Feed one inbound datagram. Returns whether it was a STUN packet.
    pub fn on_packet(self: &Arc<Self>, bytes: &[u8]) -> bool {
        self.inner().last_recv = Instant::now();
        if !is_stun(bytes) {
            return false;
        }
        let packet = match self.codec.parse(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(remote = %self.remote_id, "Invalid STUN packet: {}", e);
                return true;
            }
        };
        match packet.kind {
            BindingKind::Request => self.on_request(packet),
            BindingKind::Response => self.on_response(packet),
        }
        true
    }

    fn on_request(self: &Arc<Self>, packet: BindingPacket) {
        let expected = format!("{}:{}", self.local_id, self.remote_id);
        match packet.username.as_deref() {
            Some(name) if name.split(':').count() == 2 && name == expected => {}
            other => {
                warn!(remote = %self.remote_id, username = ?other, "Binding request with bad username");
                return;
            }
        }
        if !self.inner().local_ready {
            debug!(remote = %self.remote_id, "Not ready, ignoring binding request");
            return;
        }

        let response = self.codec.build_response(packet.transaction_id);
        if let Err(e) = self.sink.send_packet(response) {
            warn!(remote = %self.remote_id, "Failed to send binding response: {}", e);
        }
        self.spawn_retry_loop();
    }

    fn on_response(&self, packet: BindingPacket) {
        if !self.inner().sent.contains(&packet.transaction_id) {
            debug!(remote = %self.remote_id, "Binding response for unknown transaction");
            return;
        }
        let became_ready = self.state.send_if_modified(|state| {
            if state.is_terminal() {
                return false;
            }
            *state = KeepaliveState::Ready;
            true
        });
        if became_ready {
            info!(local = %self.local_id, remote = %self.remote_id, "Direct path ready");
        }
    }

    fn spawn_retry_loop(self: &Arc<Self>) {
        {
            let mut inner = self.inner();
            if inner.retrying || self.state().is_terminal() {
                return;
            }
            inner.retrying = true;
        }
        self.state.send_replace(KeepaliveState::Checking);
        let this = self.clone();
        tokio::spawn(async move {
            this.retry_loop().await;
            this.inner().retrying = false;
        });
    }

    fn send_request(&self) {
        let transaction_id: TransactionId = rand::random();
        {
            let mut inner = self.inner();
            if inner.sent.len() == SENT_HISTORY {
                inner.sent.pop_front();
            }
            inner.sent.push_back(transaction_id);
        }
        let username = format!("{}:{}", self.remote_id, self.local_id);
        let request = self.codec.build_request(transaction_id, &username);
        if let Err(e) = self.sink.send_packet(request) {
            warn!(remote = %self.remote_id, "Failed to send binding request: {}", e);
        }
    }

    async fn retry_loop(&self) {
        let mut interval = INITIAL_INTERVAL;
        loop {
            if self.state() != KeepaliveState::Checking {
                return;
            }
            self.send_request();

            let silent = self.inner().last_recv.elapsed();
            let remaining = ABANDON_AFTER.saturating_sub(silent);
            tokio::time::sleep(interval.min(remaining)).await;

            if self.state() != KeepaliveState::Checking {
                return;
            }
            let elapsed = self.inner().last_recv.elapsed();
            if elapsed >= ABANDON_AFTER {
                self.state.send_replace(KeepaliveState::Abandoned);
                info!(remote = %self.remote_id, ?elapsed, "Peer silent, abandoning checks");
                return;
            } else if elapsed > BACKOFF_AFTER {
                interval = elapsed / 2;
            } else if elapsed < INITIAL_INTERVAL {
                interval = INITIAL_INTERVAL;
            }
        }
    }
}
