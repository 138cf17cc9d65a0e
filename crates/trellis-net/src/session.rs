//! Encrypted sessions with direct peers
//!
//! A session moves `Unestablished -> Handshaking -> Established -> Expired`.
//! The handshake is two signed messages:
//!
//! ```text
//! initiator                          responder
//!     Hello { handle_i, key_i, e_i } ->
//!                                  <- Key { handle_i, handle_r, key_r, e_r, e_i }
//!     Data(keepalive)               ->   (confirms the session for the responder)
//! ```
//!
//! Both sides derive directional ChaCha20-Poly1305 keys with HKDF over the
//! X25519 secret, salted by a hash of both identities and both ephemerals.
//! Data frames carry `receiver_handle: u32 || nonce: u64` (both big-endian)
//! in the clear, authenticated as associated data.
//!
//! When both ends send a Hello at once, the node with the lower key keeps
//! its own Hello and the other answers it.

use crate::crypto::{
    transcript_hash, CryptoError, EphemeralKeyExchange, KeyPair, SessionKeys, TAG_SIZE,
};
use crate::framing::{Frame, FrameType};
use crate::replay::ReplayWindow;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use tracing::{debug, info, warn};
use trellis_core::canonical::{
    canonical_bytes, from_canonical_bytes, signing_bytes, DOMAIN_HELLO, DOMAIN_KEY,
};
use trellis_core::{Error, NodeKey, Result};
use x25519_dalek::PublicKey as X25519Public;

/// Cleartext prefix of every data frame
pub const DATA_HEADER_SIZE: usize = 12;

/// Default number of outbound payloads held while a handshake runs
pub const DEFAULT_MAX_QUEUED: usize = 16;

/// Default limit on session records, established or not
pub const DEFAULT_MAX_SESSIONS: usize = 1024;

/// Session settings
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Payloads held per peer until the session is established
    pub max_queued: usize,
    /// Abandon a handshake after this long without a Key
    pub handshake_timeout_ms: u64,
    /// Expire an established session after this long without valid data
    pub session_timeout_ms: u64,
    /// Send an empty data frame after this long without sending
    pub keepalive_interval_ms: u64,
    /// Refuse new peers once this many sessions exist
    pub max_sessions: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_queued: DEFAULT_MAX_QUEUED,
            handshake_timeout_ms: 5_000,
            session_timeout_ms: 120_000,
            keepalive_interval_ms: 40_000,
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }
}

/// Session lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Unestablished,
    Handshaking,
    Established,
    Expired,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Unestablished => write!(f, "unestablished"),
            SessionState::Handshaking => write!(f, "handshaking"),
            SessionState::Established => write!(f, "established"),
            SessionState::Expired => write!(f, "expired"),
        }
    }
}

/// Which side of the handshake this node played
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// State changes the host reacts to
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    /// Keys are in place; data can flow
    Established { peer: NodeKey, role: Role },
    /// The peer proved it holds the keys too
    Confirmed { peer: NodeKey },
    /// No valid traffic within the session timeout
    Expired { peer: NodeKey },
    /// A handshake was abandoned
    Failed { peer: NodeKey, reason: String },
}

/// Signed fields of a Hello
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HelloBody {
    pub sender_handle: u32,
    pub key: NodeKey,
    pub recipient: NodeKey,
    pub ephemeral: [u8; 32],
}

/// Handshake initiation
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Hello {
    pub body: HelloBody,
    pub signature: Vec<u8>,
}

/// Signed fields of a Key
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyBody {
    /// Initiator's handle, echoed from the Hello
    pub receiver_handle: u32,
    pub sender_handle: u32,
    pub key: NodeKey,
    pub ephemeral: [u8; 32],
    /// Initiator ephemeral this Key answers
    pub hello_ephemeral: [u8; 32],
    /// Handle of a Hello the responder gave up on for this one
    pub abandoned_handle: Option<u32>,
}

/// Handshake response
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyMessage {
    pub body: KeyBody,
    pub signature: Vec<u8>,
}

/// A frame the session layer wants on the wire
#[derive(Clone, Debug)]
pub struct Outbound {
    pub peer: NodeKey,
    pub addr: SocketAddr,
    pub frame: Frame,
}

/// Result of handling one inbound frame
#[derive(Debug, Default)]
pub struct Received {
    /// Decrypted payload and its sender; keepalives deliver nothing
    pub delivered: Option<(NodeKey, Vec<u8>)>,
    /// Frames to send in response
    pub replies: Vec<Outbound>,
}

/// Per-peer session record
pub struct Session {
    peer: NodeKey,
    addr: SocketAddr,
    state: SessionState,
    role: Option<Role>,
    /// Handle the peer puts on data addressed to us (0 = none)
    local_handle: u32,
    remote_handle: u32,
    pending: Option<EphemeralKeyExchange>,
    pending_public: [u8; 32],
    keys: Option<SessionKeys>,
    replay: ReplayWindow,
    confirmed: bool,
    queue: VecDeque<Vec<u8>>,
    answered_hello: Option<[u8; 32]>,
    key_reply: Option<Frame>,
    abandoned_remote: Option<u32>,
    handshake_started_ms: u64,
    last_recv_ms: u64,
    last_send_ms: u64,
    handshakes: u32,
}

impl Session {
    fn new(peer: NodeKey, addr: SocketAddr, now_ms: u64) -> Self {
        Self {
            peer,
            addr,
            state: SessionState::Unestablished,
            role: None,
            local_handle: 0,
            remote_handle: 0,
            pending: None,
            pending_public: [0; 32],
            keys: None,
            replay: ReplayWindow::new(),
            confirmed: false,
            queue: VecDeque::new(),
            answered_hello: None,
            key_reply: None,
            abandoned_remote: None,
            handshake_started_ms: now_ms,
            last_recv_ms: now_ms,
            last_send_ms: now_ms,
            handshakes: 0,
        }
    }

    pub fn peer(&self) -> NodeKey {
        self.peer
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    /// Whether the peer has shown it holds the session keys
    pub fn is_confirmed(&self) -> bool {
        self.confirmed
    }

    /// Payloads waiting for the handshake
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Hellos this node has sent to the peer
    pub fn handshake_attempts(&self) -> u32 {
        self.handshakes
    }

    pub fn last_recv_ms(&self) -> u64 {
        self.last_recv_ms
    }

    fn enqueue(&mut self, plaintext: &[u8], max_queued: usize) {
        if max_queued == 0 {
            warn!("session queue disabled, dropping payload for {}", self.peer);
            return;
        }
        while self.queue.len() >= max_queued {
            self.queue.pop_front();
            warn!("session queue for {} full, dropped oldest payload", self.peer);
        }
        self.queue.push_back(plaintext.to_vec());
    }

    fn seal(&mut self, plaintext: &[u8], now_ms: u64) -> Result<Outbound> {
        let keys = self.keys.as_mut().ok_or(Error::NotEstablished)?;
        let nonce = keys.next_nonce().map_err(rejected)?;

        let mut payload = Vec::with_capacity(DATA_HEADER_SIZE + plaintext.len() + TAG_SIZE);
        payload.extend_from_slice(&self.remote_handle.to_be_bytes());
        payload.extend_from_slice(&nonce.to_be_bytes());
        let ciphertext = keys.encrypt(nonce, plaintext, &payload).map_err(rejected)?;
        payload.extend_from_slice(&ciphertext);

        self.last_send_ms = now_ms;
        Ok(Outbound {
            peer: self.peer,
            addr: self.addr,
            frame: Frame::new(FrameType::Data, payload),
        })
    }

    fn flush(&mut self, now_ms: u64) -> Result<Vec<Outbound>> {
        let queued: Vec<_> = self.queue.drain(..).collect();
        queued.iter().map(|p| self.seal(p, now_ms)).collect()
    }

    fn reset_crypto(&mut self) {
        self.pending = None;
        self.keys = None;
        self.replay.reset();
        self.confirmed = false;
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("peer", &self.peer)
            .field("addr", &self.addr)
            .field("state", &self.state)
            .field("role", &self.role)
            .field("confirmed", &self.confirmed)
            .field("queued", &self.queue.len())
            .finish()
    }
}

fn rejected(e: CryptoError) -> Error {
    Error::HandshakeFailure(e.to_string())
}

/// Sessions with every direct peer, indexed by key and by local handle
pub struct SessionManager {
    keypair: KeyPair,
    local: NodeKey,
    config: SessionConfig,
    sessions: HashMap<NodeKey, Session>,
    handles: HashMap<u32, NodeKey>,
    next_handle: u32,
    events: Vec<SessionEvent>,
}

impl SessionManager {
    pub fn new(keypair: KeyPair, config: SessionConfig) -> Self {
        let local = keypair.node_key();
        Self {
            keypair,
            local,
            config,
            sessions: HashMap::new(),
            handles: HashMap::new(),
            next_handle: 1,
            events: Vec::new(),
        }
    }

    pub fn local_key(&self) -> NodeKey {
        self.local
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn get(&self, peer: &NodeKey) -> Option<&Session> {
        self.sessions.get(peer)
    }

    /// State of the session with `peer`; unknown peers are unestablished.
    pub fn state(&self, peer: &NodeKey) -> SessionState {
        self.sessions
            .get(peer)
            .map_or(SessionState::Unestablished, |s| s.state)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    /// Peers with an established session
    pub fn established(&self) -> impl Iterator<Item = NodeKey> + '_ {
        self.sessions
            .values()
            .filter(|s| s.state == SessionState::Established)
            .map(|s| s.peer)
    }

    /// Drain events raised since the last call
    pub fn take_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    /// Make sure a record exists for `peer`.
    ///
    /// `addr` only replaces the recorded address while no handshake is
    /// running and no session is up; after that the address follows
    /// authenticated frames only. Fails when the table is full.
    pub fn ensure(&mut self, peer: NodeKey, addr: SocketAddr, now_ms: u64) -> Result<&mut Session> {
        if !self.sessions.contains_key(&peer) && self.sessions.len() >= self.config.max_sessions {
            return Err(Error::HandshakeFailure(format!(
                "session table full ({} sessions), refusing {}",
                self.sessions.len(),
                peer
            )));
        }
        let session = self
            .sessions
            .entry(peer)
            .or_insert_with(|| Session::new(peer, addr, now_ms));
        if matches!(session.state, SessionState::Unestablished | SessionState::Expired) {
            session.addr = addr;
        }
        Ok(session)
    }

    /// Start a handshake unless one is running or done.
    ///
    /// Returns the Hello to send, or `None` when the session is already
    /// handshaking or established.
    pub fn initiate(
        &mut self,
        peer: NodeKey,
        addr: SocketAddr,
        now_ms: u64,
    ) -> Result<Option<Outbound>> {
        if peer == self.local {
            return Err(Error::HandshakeFailure("refusing session with own key".into()));
        }
        let state = self.ensure(peer, addr, now_ms)?.state;
        if matches!(state, SessionState::Handshaking | SessionState::Established) {
            return Ok(None);
        }

        let handle = self.rebind_handle(peer);
        let exchange = EphemeralKeyExchange::new();
        let body = HelloBody {
            sender_handle: handle,
            key: self.local,
            recipient: peer,
            ephemeral: exchange.public_key(),
        };
        let signature = self.keypair.sign(&signing_bytes(DOMAIN_HELLO, &body)?).to_vec();
        let ephemeral = body.ephemeral;
        let frame = Frame::new(FrameType::Hello, canonical_bytes(&Hello { body, signature })?);

        let session = self.ensure(peer, addr, now_ms)?;
        session.reset_crypto();
        session.state = SessionState::Handshaking;
        session.role = Some(Role::Initiator);
        session.pending = Some(exchange);
        session.pending_public = ephemeral;
        session.handshake_started_ms = now_ms;
        session.handshakes += 1;
        debug!("initiating session with {} at {}", peer, addr);

        Ok(Some(Outbound { peer, addr, frame }))
    }

    /// Encrypt `plaintext` for `peer`, or queue it until the session is up.
    pub fn send(&mut self, peer: &NodeKey, plaintext: &[u8], now_ms: u64) -> Result<Vec<Outbound>> {
        let max_queued = self.config.max_queued;
        let session = self.sessions.get_mut(peer).ok_or(Error::NotEstablished)?;
        match session.state {
            SessionState::Established => Ok(vec![session.seal(plaintext, now_ms)?]),
            SessionState::Handshaking => {
                session.enqueue(plaintext, max_queued);
                Ok(Vec::new())
            }
            SessionState::Unestablished | SessionState::Expired => {
                session.enqueue(plaintext, max_queued);
                let addr = session.addr;
                Ok(self.initiate(*peer, addr, now_ms)?.into_iter().collect())
            }
        }
    }

    /// Handle a Hello, Key or Data frame from `from`.
    pub fn receive(&mut self, from: SocketAddr, frame: &Frame, now_ms: u64) -> Result<Received> {
        match frame.frame_type {
            FrameType::Hello => self.on_hello(from, &frame.payload, now_ms),
            FrameType::Key => self.on_key(from, &frame.payload, now_ms),
            FrameType::Data => self.on_data(from, &frame.payload, now_ms),
            FrameType::Beacon => Err(Error::InvalidProtocol(FrameType::Beacon as u16)),
        }
    }

    /// Expire idle sessions, abandon stale handshakes and emit keepalives.
    pub fn maintain(&mut self, now_ms: u64) -> Vec<Outbound> {
        self.forget_unestablished(now_ms);
        let mut out = Vec::new();
        for session in self.sessions.values_mut() {
            match session.state {
                SessionState::Handshaking
                    if now_ms.saturating_sub(session.handshake_started_ms)
                        > self.config.handshake_timeout_ms =>
                {
                    let dropped = session.queue.len();
                    session.queue.clear();
                    session.reset_crypto();
                    session.state = SessionState::Unestablished;
                    session.role = None;
                    debug!(
                        "handshake with {} timed out, dropped {} queued payloads",
                        session.peer, dropped
                    );
                    self.events.push(SessionEvent::Failed {
                        peer: session.peer,
                        reason: "handshake timed out".into(),
                    });
                }
                SessionState::Established
                    if now_ms.saturating_sub(session.last_recv_ms)
                        > self.config.session_timeout_ms =>
                {
                    session.reset_crypto();
                    session.state = SessionState::Expired;
                    info!("session with {} expired", session.peer);
                    self.events.push(SessionEvent::Expired { peer: session.peer });
                }
                SessionState::Established
                    if now_ms.saturating_sub(session.last_send_ms)
                        >= self.config.keepalive_interval_ms =>
                {
                    match session.seal(&[], now_ms) {
                        Ok(keepalive) => out.push(keepalive),
                        Err(e) => warn!("keepalive to {} failed: {}", session.peer, e),
                    }
                }
                _ => {}
            }
        }
        out
    }

    /// Drop records that never got a session up and have been quiet for a
    /// whole session timeout.
    fn forget_unestablished(&mut self, now_ms: u64) {
        let idle_ms = self.config.session_timeout_ms;
        let handles = &mut self.handles;
        self.sessions.retain(|peer, session| {
            let quiet_since = session.handshake_started_ms.max(session.last_recv_ms);
            let stale = session.state == SessionState::Unestablished
                && now_ms.saturating_sub(quiet_since) > idle_ms;
            if stale {
                if session.local_handle != 0 {
                    handles.remove(&session.local_handle);
                }
                debug!("forgetting unestablished session with {}", peer);
            }
            !stale
        });
    }

    /// Forget `peer` entirely.
    pub fn teardown(&mut self, peer: &NodeKey) -> Option<Session> {
        let session = self.sessions.remove(peer)?;
        self.handles.remove(&session.local_handle);
        Some(session)
    }

    fn rebind_handle(&mut self, peer: NodeKey) -> u32 {
        if let Some(old) = self.sessions.get(&peer).map(|s| s.local_handle) {
            if old != 0 {
                self.handles.remove(&old);
            }
        }
        let mut handle = self.next_handle;
        while handle == 0 || self.handles.contains_key(&handle) {
            handle = handle.wrapping_add(1);
        }
        self.next_handle = handle.wrapping_add(1);
        self.handles.insert(handle, peer);
        if let Some(session) = self.sessions.get_mut(&peer) {
            session.local_handle = handle;
        }
        handle
    }

    fn on_hello(&mut self, from: SocketAddr, payload: &[u8], now_ms: u64) -> Result<Received> {
        let hello: Hello = from_canonical_bytes(payload)?;
        let body = &hello.body;
        if body.recipient != self.local {
            return Err(Error::HandshakeFailure("hello addressed to another node".into()));
        }
        if body.key == self.local {
            return Err(Error::HandshakeFailure("hello signed with own key".into()));
        }
        KeyPair::verify(&body.key.0, &signing_bytes(DOMAIN_HELLO, body)?, &hello.signature)
            .map_err(rejected)?;
        let peer = body.key;

        let mut abandoned = None;
        if let Some(session) = self.sessions.get_mut(&peer) {
            if session.answered_hello == Some(body.ephemeral) {
                if let Some(frame) = session.key_reply.clone() {
                    if !session.confirmed {
                        session.addr = from;
                    }
                    debug!("repeating key for retransmitted hello from {}", peer);
                    return Ok(Received {
                        delivered: None,
                        replies: vec![Outbound { peer, addr: from, frame }],
                    });
                }
            }
            if session.abandoned_remote == Some(body.sender_handle) {
                debug!("ignoring hello {} from {} it already abandoned", body.sender_handle, peer);
                return Ok(Received::default());
            }
            if session.state == SessionState::Handshaking && session.role == Some(Role::Initiator) {
                if self.local < peer {
                    debug!("simultaneous open with {}: keeping our hello", peer);
                    return Ok(Received::default());
                }
                abandoned = Some(session.local_handle);
            }
        }

        let exchange = EphemeralKeyExchange::new();
        let our_ephemeral = exchange.public_key();
        let shared = exchange.exchange(&body.ephemeral).map_err(rejected)?;
        let transcript = transcript_hash(&peer, &self.local, &body.ephemeral, &our_ephemeral);
        let keys = SessionKeys::derive(
            &shared,
            &X25519Public::from(our_ephemeral),
            &X25519Public::from(body.ephemeral),
            &transcript,
        )
        .map_err(rejected)?;

        self.ensure(peer, from, now_ms)?;
        let handle = self.rebind_handle(peer);
        let key_body = KeyBody {
            receiver_handle: body.sender_handle,
            sender_handle: handle,
            key: self.local,
            ephemeral: our_ephemeral,
            hello_ephemeral: body.ephemeral,
            abandoned_handle: abandoned,
        };
        let signature = self.keypair.sign(&signing_bytes(DOMAIN_KEY, &key_body)?).to_vec();
        let frame = Frame::new(
            FrameType::Key,
            canonical_bytes(&KeyMessage {
                body: key_body,
                signature,
            })?,
        );

        let session = self.ensure(peer, from, now_ms)?;
        session.reset_crypto();
        session.addr = from;
        session.state = SessionState::Established;
        session.role = Some(Role::Responder);
        session.remote_handle = body.sender_handle;
        session.keys = Some(keys);
        session.answered_hello = Some(body.ephemeral);
        session.key_reply = Some(frame.clone());
        session.abandoned_remote = None;
        session.last_recv_ms = now_ms;
        session.last_send_ms = now_ms;

        let mut replies = vec![Outbound {
            peer,
            addr: from,
            frame,
        }];
        replies.extend(session.flush(now_ms)?);

        info!("session established with {} (responder)", peer);
        self.events.push(SessionEvent::Established {
            peer,
            role: Role::Responder,
        });
        Ok(Received {
            delivered: None,
            replies,
        })
    }

    fn on_key(&mut self, from: SocketAddr, payload: &[u8], now_ms: u64) -> Result<Received> {
        let message: KeyMessage = from_canonical_bytes(payload)?;
        let body = &message.body;
        KeyPair::verify(&body.key.0, &signing_bytes(DOMAIN_KEY, body)?, &message.signature)
            .map_err(rejected)?;

        let peer = self
            .handles
            .get(&body.receiver_handle)
            .copied()
            .ok_or_else(|| Error::HandshakeFailure("key for unknown handle".into()))?;
        if peer != body.key {
            return Err(Error::HandshakeFailure("key signed by unexpected node".into()));
        }
        let session = self
            .sessions
            .get_mut(&peer)
            .ok_or_else(|| Error::HandshakeFailure("key for unknown session".into()))?;

        if session.state == SessionState::Established && session.remote_handle == body.sender_handle {
            debug!("ignoring duplicate key from {}", peer);
            return Ok(Received::default());
        }
        if session.state != SessionState::Handshaking
            || session.role != Some(Role::Initiator)
            || body.hello_ephemeral != session.pending_public
        {
            return Err(Error::HandshakeFailure("key does not answer our hello".into()));
        }

        let exchange = session
            .pending
            .take()
            .ok_or_else(|| Error::HandshakeFailure("no pending handshake".into()))?;
        let our_ephemeral = session.pending_public;
        let keys = exchange.exchange(&body.ephemeral).and_then(|shared| {
            let transcript = transcript_hash(&self.local, &peer, &our_ephemeral, &body.ephemeral);
            SessionKeys::derive(
                &shared,
                &X25519Public::from(our_ephemeral),
                &X25519Public::from(body.ephemeral),
                &transcript,
            )
        });
        let keys = match keys {
            Ok(keys) => keys,
            Err(e) => {
                session.reset_crypto();
                session.state = SessionState::Unestablished;
                session.role = None;
                warn!("handshake with {} failed: {}", peer, e);
                self.events.push(SessionEvent::Failed {
                    peer,
                    reason: e.to_string(),
                });
                return Err(rejected(e));
            }
        };

        session.replay.reset();
        session.keys = Some(keys);
        session.state = SessionState::Established;
        session.remote_handle = body.sender_handle;
        session.abandoned_remote = body.abandoned_handle;
        session.confirmed = true;
        session.addr = from;
        session.last_recv_ms = now_ms;

        let mut replies = session.flush(now_ms)?;
        if replies.is_empty() {
            // The responder only confirms on its first data frame
            replies.push(session.seal(&[], now_ms)?);
        }

        info!("session established with {} (initiator)", peer);
        self.events.push(SessionEvent::Established {
            peer,
            role: Role::Initiator,
        });
        self.events.push(SessionEvent::Confirmed { peer });
        Ok(Received {
            delivered: None,
            replies,
        })
    }

    fn on_data(&mut self, from: SocketAddr, payload: &[u8], now_ms: u64) -> Result<Received> {
        if payload.len() < DATA_HEADER_SIZE + TAG_SIZE {
            return Err(Error::MalformedFrame {
                needed: DATA_HEADER_SIZE + TAG_SIZE,
                got: payload.len(),
            });
        }
        let mut handle = [0u8; 4];
        handle.copy_from_slice(&payload[..4]);
        let mut nonce = [0u8; 8];
        nonce.copy_from_slice(&payload[4..DATA_HEADER_SIZE]);
        let handle = u32::from_be_bytes(handle);
        let nonce = u64::from_be_bytes(nonce);

        let peer = *self.handles.get(&handle).ok_or(Error::NotEstablished)?;
        let session = self.sessions.get_mut(&peer).ok_or(Error::NotEstablished)?;
        if session.state != SessionState::Established {
            return Err(Error::NotEstablished);
        }
        if !session.replay.check(nonce) {
            return Err(Error::Replay(nonce));
        }
        let keys = session.keys.as_ref().ok_or(Error::NotEstablished)?;
        let plaintext = keys
            .decrypt(&payload[DATA_HEADER_SIZE..], &payload[..DATA_HEADER_SIZE], nonce)
            .map_err(|_| Error::HandshakeFailure("data failed authentication".into()))?;

        session.replay.accept(nonce);
        session.last_recv_ms = now_ms;
        session.addr = from;
        if !session.confirmed {
            session.confirmed = true;
            debug!("session with {} confirmed", peer);
            self.events.push(SessionEvent::Confirmed { peer });
        }

        Ok(Received {
            delivered: (!plaintext.is_empty()).then_some((peer, plaintext)),
            replies: Vec::new(),
        })
    }
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("local", &self.local)
            .field("sessions", &self.sessions.len())
            .finish()
    }
}
