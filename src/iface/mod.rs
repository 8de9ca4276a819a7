/*! The protocol handle and its dispatch loop.

An [Interface] owns the set of connections multiplexed over one datagram
socket, the configuration snapshot, and the statistics counters. The host
reactor drives it through [Interface::poll] whenever the socket becomes
readable or writable or the deadline reported by [Interface::poll_delay]
passes; every notification towards the application arrives through the
[Events] trait during that call.

The engine is strictly single-threaded: nothing blocks, and a send that
hits a full socket buffer leaves the segment queued behind the
[PollStatus::WriteBlocked] indication.
*/

use core::fmt;
use std::net::SocketAddr;

use crate::config::MAX_WINDOW_SIZE;
use crate::conn::{check_config_valid, Connection, Message, State};
use crate::phy::DatagramSocket;
use crate::rand::Rand;
use crate::time::{Duration, Instant};
use crate::wire::{RdpPacket, SeqNumber, FIXED_HEADER_LEN, FLAG_RST, FLAG_SYN, FLAG_VER, VERSION_BITS};

mod conn_set;

pub use self::conn_set::ConnHandle;
use self::conn_set::ConnSet;

/// The reserved identifier no connection ever carries.
pub const INVALID_CONN_ID: u32 = 0xffff_ffff;

/// Errors surfaced by the engine, both as return values and through
/// [Events] notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The send queue or the peer's window cannot take the message now.
    Backpressure,
    /// The message's time-to-live ran out before delivery.
    TtlExpired,
    /// The socket is temporarily unable to proceed.
    WouldBlock,
    /// The referenced connection does not exist.
    InvalidConnection,
    /// The operation is not legal in the connection's current state.
    InvalidState,
    /// The peer sent a structurally or semantically malformed segment.
    InvalidResponse,
    /// The supplied data is not sendable (for instance, empty).
    InvalidData,
    /// The window parameters cannot carry a full application message.
    InvalidConfig,
    /// The peer reset the connection.
    RemoteReset,
    /// Data retransmission gave up.
    Timeout,
    /// The peer stopped answering keepalive probes.
    ProbeTimeout,
    /// The peer's window stayed closed past the application timeout.
    PersistTimeout,
    /// The peer runs a protocol version this engine does not speak.
    VersionNotSupported,
    /// The socket failed in a non-recoverable way.
    SocketError,
    /// The connection is going down; in-flight messages are returned.
    Disconnecting,
    /// No connection ports were left to allocate.
    Exhausted,
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Backpressure => write!(f, "send window is full"),
            Error::TtlExpired => write!(f, "message time-to-live expired"),
            Error::WouldBlock => write!(f, "operation would block"),
            Error::InvalidConnection => write!(f, "no such connection"),
            Error::InvalidState => write!(f, "operation illegal in the current state"),
            Error::InvalidResponse => write!(f, "malformed segment from peer"),
            Error::InvalidData => write!(f, "invalid data"),
            Error::InvalidConfig => write!(f, "window configuration cannot carry a full message"),
            Error::RemoteReset => write!(f, "connection reset by peer"),
            Error::Timeout => write!(f, "retransmission timeout"),
            Error::ProbeTimeout => write!(f, "keepalive probe timeout"),
            Error::PersistTimeout => write!(f, "persist probe timeout"),
            Error::VersionNotSupported => write!(f, "peer protocol version not supported"),
            Error::SocketError => write!(f, "socket error"),
            Error::Disconnecting => write!(f, "connection is going down"),
            Error::Exhausted => write!(f, "connection ports exhausted"),
        }
    }
}

/// Why a connection left the OPEN state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The local host asked for the close.
    Local,
    /// The peer sent RST.
    RemoteReset,
    /// Data retransmission gave up.
    Timeout,
    /// Keepalive probing gave up.
    ProbeTimeout,
    /// The peer's window stayed frozen past the application timeout.
    PersistTimeout,
    /// The peer sent a malformed or out-of-protocol segment.
    InvalidResponse,
    /// The peer runs an unsupported protocol version.
    VersionNotSupported,
    /// The underlying socket failed.
    SocketError,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Local => write!(f, "locally closed"),
            DisconnectReason::RemoteReset => write!(f, "reset by peer"),
            DisconnectReason::Timeout => write!(f, "retransmission timeout"),
            DisconnectReason::ProbeTimeout => write!(f, "probe timeout"),
            DisconnectReason::PersistTimeout => write!(f, "persist timeout"),
            DisconnectReason::InvalidResponse => write!(f, "invalid response"),
            DisconnectReason::VersionNotSupported => write!(f, "version not supported"),
            DisconnectReason::SocketError => write!(f, "socket error"),
        }
    }
}

/// A positive accept decision: the receive window this side offers and the
/// handshake payload to carry on the SYN-ACK.
#[derive(Debug, Clone)]
pub struct Accept {
    /// Receive window capacity offered to the peer, in segments.
    pub seg_max: u16,
    /// Largest segment this side is willing to receive, in bytes.
    pub seg_buf_max: u16,
    /// Opaque application handshake data for the SYN-ACK.
    pub payload: Vec<u8>,
}

/// The notifications the engine raises towards the application.
///
/// All methods fire on the stack of [Interface::poll] (or of the API call
/// that triggered them); they receive plain data and must not block.
/// Reactions that require the interface (sending, releasing, closing) are
/// made after the call returns.
pub trait Events {
    /// An incoming connection asks to be admitted. Returning `None`
    /// refuses it with a reset; returning an [Accept] completes this
    /// side's window negotiation and answers with a SYN-ACK.
    fn accept(&mut self, conn: ConnHandle, remote: SocketAddr, syn_payload: &[u8]) -> Option<Accept> {
        let _ = (conn, remote, syn_payload);
        None
    }

    /// The connection entered OPEN (`Ok`), or establishment failed.
    /// `syn_payload` carries the peer's handshake data.
    fn connected(
        &mut self,
        conn: ConnHandle,
        passive: bool,
        syn_payload: &[u8],
        status: Result<(), Error>,
    ) {
        let _ = (conn, passive, syn_payload, status);
    }

    /// The connection entered CLOSE-WAIT.
    fn disconnected(&mut self, conn: ConnHandle, reason: DisconnectReason) {
        let _ = (conn, reason);
    }

    /// A complete message is available. The buffers stay with the engine
    /// until [Interface::recv_ready] is called with `message.start()`.
    fn recv(&mut self, conn: ConnHandle, message: &Message) {
        let _ = (conn, message);
    }

    /// A previously submitted message is finished: acknowledged (`Ok`),
    /// expired ([Error::TtlExpired]) or flushed by a disconnect
    /// ([Error::Disconnecting]). The buffer returns to the application.
    fn send_done(&mut self, conn: ConnHandle, buffer: Vec<u8>, status: Result<(), Error>) {
        let _ = (conn, buffer, status);
    }

    /// The peer's advertised send window changed.
    fn window_changed(&mut self, conn: ConnHandle, window: u16, status: Result<(), Error>) {
        let _ = (conn, window, status);
    }
}

/// Per-handle configuration. All intervals are in milliseconds.
#[derive(Debug, Clone)]
pub struct Config {
    /// Seed for connection identifiers, ports and initial sequences.
    pub random_seed: u64,
    /// Interval between SYN retransmissions.
    pub connect_timeout: u32,
    /// SYN retransmissions before the open attempt fails.
    pub connect_retries: u32,
    /// Retransmission timeout used before an RTT estimate exists.
    pub initial_data_timeout: u32,
    /// Give up on a connection after retransmitting this long.
    pub total_data_retry_timeout: u32,
    /// Minimum retransmissions before the timeout above may strike.
    pub min_data_retries: u32,
    /// Base interval of zero-window probing.
    pub persist_interval: u32,
    /// Give up on a frozen window after this long.
    pub total_app_timeout: u32,
    /// Declare the link dead after this long without traffic.
    pub link_timeout: u32,
    /// Keepalive probes sent across `link_timeout`.
    pub keepalive_retries: u32,
    /// Duplicate-EACK count that triggers a fast retransmit.
    pub fast_retransmit_ack_counter: u32,
    /// How long a bare ACK may wait for data to piggyback on.
    pub delayed_ack_timeout: u32,
    /// CLOSE-WAIT linger before the record is dropped.
    pub timewait: u32,
    /// Default receive window capacity offered on connect, in segments.
    pub segmax: u16,
    /// Default per-segment byte capacity offered on connect.
    pub segbmax: u16,
    /// Largest message the application will ever submit; connections that
    /// cannot carry it are refused outright.
    pub max_message_len: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            random_seed: 0,
            connect_timeout: 1000,
            connect_retries: 10,
            initial_data_timeout: 1000,
            total_data_retry_timeout: 30_000,
            min_data_retries: 5,
            persist_interval: 1000,
            total_app_timeout: 30_000,
            link_timeout: 30_000,
            keepalive_retries: 5,
            fast_retransmit_ack_counter: 1,
            delayed_ack_timeout: 100,
            timewait: 1000,
            segmax: 16,
            segbmax: 4440,
            max_message_len: 65_536,
        }
    }
}

/// Protocol statistics, accumulated over the life of the handle.
#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    pub accept_cbs: u32,
    pub connect_cbs: u32,
    pub disconnect_cbs: u32,
    pub recv_cbs: u32,
    pub send_cbs: u32,
    /// Outbound messages dropped for any reason.
    pub outbound_drops: u32,
    /// Outbound messages dropped before reaching the wire.
    pub preflight_drops: u32,
    /// Outbound messages dropped after reaching the wire.
    pub inflight_drops: u32,
    /// Inbound messages dropped because their TTL ran out.
    pub inbound_drops: u32,
    pub syn_sends: u32,
    pub syn_recvs: u32,
    pub synack_sends: u32,
    pub synack_recvs: u32,
    pub synackack_sends: u32,
    pub synackack_recvs: u32,
    pub rst_sends: u32,
    pub rst_recvs: u32,
    pub nul_sends: u32,
    pub nul_recvs: u32,
}

/// What [Interface::poll] tells the host reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    /// Normal progress; wake again at [Interface::poll_delay].
    Ready,
    /// The socket refused a write; wait for writability before polling
    /// again, or queued segments will not move.
    WriteBlocked,
}

/// A send the engine did not take; the buffer comes back with the reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRejected {
    pub buffer: Vec<u8>,
    pub reason: Error,
}

/// The state shared between the interface and its connections while a call
/// is on the stack.
#[derive(Debug)]
pub(crate) struct InterfaceInner {
    pub(crate) config: Config,
    pub(crate) rand: Rand,
    pub(crate) now: Instant,
    /// The socket refused a write; suppress sends until writable again.
    pub(crate) traffic_jam: bool,
    pub(crate) accepting: bool,
    pub(crate) stats: Stats,
}

impl InterfaceInner {
    pub(crate) fn new(config: Config) -> InterfaceInner {
        InterfaceInner {
            rand: Rand::new(config.random_seed),
            now: Instant::ZERO,
            traffic_jam: false,
            accepting: false,
            stats: Stats::default(),
            config,
        }
    }
}

/// A protocol handle multiplexing reliable connections over one datagram
/// socket.
#[derive(Debug)]
pub struct Interface<'a> {
    inner: InterfaceInner,
    conns: ConnSet<'a>,
    next_wake: Option<Instant>,
}

impl<'a> Interface<'a> {
    pub fn new(config: Config) -> Interface<'a> {
        Interface {
            inner: InterfaceInner::new(config),
            conns: ConnSet::new(vec![]),
            next_wake: None,
        }
    }

    /// Start admitting inbound connections through [Events::accept].
    pub fn listen(&mut self) {
        self.inner.accepting = true;
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn stats(&self) -> &Stats {
        &self.inner.stats
    }

    pub fn reset_stats(&mut self) {
        self.inner.stats = Stats::default();
    }

    /// Actively open a connection to `remote`, advertising a receive window
    /// of `segmax` segments of up to `segbmax` bytes and carrying `payload`
    /// as opaque handshake data.
    pub fn connect<S>(
        &mut self,
        now: Instant,
        socket: &mut S,
        remote: SocketAddr,
        segmax: u16,
        segbmax: u16,
        payload: Vec<u8>,
    ) -> Result<ConnHandle, Error>
    where
        S: DatagramSocket,
    {
        self.inner.now = now;

        if !check_config_valid(segmax, segbmax, MAX_WINDOW_SIZE, self.inner.config.max_message_len)
        {
            return Err(Error::InvalidConfig);
        }

        let local = self.alloc_local_port(0)?;
        let conn = Connection::new(&mut self.inner, local, 0, remote);
        let handle = self.conns.add(conn);

        let conn = self.conns.get_mut(handle).ok_or(Error::InvalidConnection)?;
        conn.handle = handle;
        match conn.connect(&mut self.inner, socket, segmax, segbmax, payload) {
            Ok(()) => Ok(handle),
            Err(err) => {
                self.conns.remove(handle);
                Err(err)
            }
        }
    }

    /// Close a connection. The disconnect notification and the flush of
    /// pending sends follow on the next poll.
    pub fn disconnect<S, E>(
        &mut self,
        now: Instant,
        socket: &mut S,
        events: &mut E,
        handle: ConnHandle,
    ) -> Result<(), Error>
    where
        S: DatagramSocket,
        E: Events,
    {
        self.inner.now = now;
        let conn = self.conns.get_mut(handle).ok_or(Error::InvalidConnection)?;
        conn.disconnect(&mut self.inner, socket, events, None);
        Ok(())
    }

    /// Submit a message with a time-to-live in milliseconds (zero meaning
    /// no expiry). On success the buffer belongs to the engine until it
    /// returns through [Events::send_done].
    pub fn send<S, E>(
        &mut self,
        now: Instant,
        socket: &mut S,
        events: &mut E,
        handle: ConnHandle,
        payload: Vec<u8>,
        ttl: u32,
    ) -> Result<(), SendRejected>
    where
        S: DatagramSocket,
        E: Events,
    {
        self.inner.now = now;
        let conn = match self.conns.get_mut(handle) {
            Some(conn) => conn,
            None => {
                return Err(SendRejected {
                    buffer: payload,
                    reason: Error::InvalidConnection,
                })
            }
        };
        conn.send(&mut self.inner, socket, events, payload, ttl)
            .map_err(|(buffer, reason)| SendRejected { buffer, reason })
    }

    /// Return a received message to the engine, freeing its fragments and
    /// widening the advertised window. `som` is [Message::start].
    pub fn recv_ready(
        &mut self,
        now: Instant,
        handle: ConnHandle,
        som: SeqNumber,
    ) -> Result<(), Error> {
        self.inner.now = now;
        let conn = self.conns.get_mut(handle).ok_or(Error::InvalidConnection)?;
        conn.recv_ready(&mut self.inner, som)
    }

    /// Drop a connection record. Valid after a terminal notification
    /// (failed connect, disconnect) has been observed.
    pub fn release(&mut self, handle: ConnHandle) -> Result<(), Error> {
        self.conns
            .remove(handle)
            .map(|_| ())
            .ok_or(Error::InvalidConnection)
    }

    /// The connection's random identifier.
    pub fn conn_id(&self, handle: ConnHandle) -> Option<u32> {
        self.conns.get(handle).map(|conn| conn.id)
    }

    /// Whether `handle` still refers to the connection known as `id`.
    pub fn is_conn_valid(&self, handle: ConnHandle, id: u32) -> bool {
        self.conns.get(handle).map_or(false, |conn| conn.id == id)
    }

    pub fn state(&self, handle: ConnHandle) -> Option<State> {
        self.conns.get(handle).map(|conn| conn.state)
    }

    /// Number of unacknowledged segments queued on the connection.
    pub fn pending(&self, handle: ConnHandle) -> Option<u16> {
        self.conns.get(handle).map(|conn| conn.snd.pending)
    }

    pub fn remote_endpoint(&self, handle: ConnHandle) -> Option<SocketAddr> {
        self.conns.get(handle).map(|conn| conn.remote)
    }

    /// The connection's dynamic data timeout with headroom, the interval an
    /// application should allow before considering traffic on it stuck.
    pub fn data_timeout(&self, handle: ConnHandle) -> u32 {
        let fallback =
            self.inner.config.total_data_retry_timeout + 2 * self.inner.config.initial_data_timeout;
        match self.conns.get(handle) {
            Some(conn) => {
                conn.rtte.data_timeout(
                    self.inner.config.total_data_retry_timeout,
                    conn.snd.segmax as u32,
                    conn.snd.segbmax as u32,
                ) + 2 * self.inner.config.initial_data_timeout
            }
            None => fallback,
        }
    }

    /// Drive the engine: drain the socket if `readable`, clear the write
    /// block if `writable`, fire expired timers, and recompute the next
    /// deadline.
    pub fn poll<S, E>(
        &mut self,
        now: Instant,
        socket: &mut S,
        readable: bool,
        writable: bool,
        events: &mut E,
    ) -> PollStatus
    where
        S: DatagramSocket,
        E: Events,
    {
        self.inner.now = now;

        if writable {
            self.inner.traffic_jam = false;
        }

        if readable {
            self.ingress(socket, events);
        }

        self.fire_timers(socket, events);

        let jam = self.inner.traffic_jam;
        self.next_wake = self
            .conns
            .iter()
            .filter_map(|(_, conn)| conn.poll_at(jam))
            .min();

        if self.inner.traffic_jam {
            PollStatus::WriteBlocked
        } else {
            PollStatus::Ready
        }
    }

    /// How long the host may sleep before calling [Interface::poll] again,
    /// or `None` when no timer is pending.
    pub fn poll_delay(&self, now: Instant) -> Option<Duration> {
        match self.next_wake {
            Some(when) if when <= now => Some(Duration::ZERO),
            Some(when) => Some(when - now),
            None => None,
        }
    }

    /// The absolute deadline variant of [Interface::poll_delay].
    pub fn poll_at(&self) -> Option<Instant> {
        self.next_wake
    }

    fn ingress<S, E>(&mut self, socket: &mut S, events: &mut E)
    where
        S: DatagramSocket,
        E: Events,
    {
        // A UDP datagram can be up to 64K long.
        let mut buf = vec![0u8; 65536];

        loop {
            let (len, from) = match socket.recv_from(&mut buf) {
                Ok((len, from)) => (len, from),
                Err(_) => break,
            };
            if len < 6 {
                continue;
            }

            let demux = RdpPacket::new_unchecked(&buf[..len]);
            let local = demux.dst_port();
            let foreign = demux.src_port();

            if local == 0 {
                if self.inner.accepting {
                    // The remote may just be retrying while we already hold
                    // a half-open connection for it.
                    if !self.has_connection_to(foreign, from) {
                        self.accept_incoming(socket, events, &buf[..len], from);
                    }
                } else {
                    send_rst(&mut self.inner, socket, from, local, foreign);
                }
                continue;
            }

            let handle = match self
                .lookup(local, foreign)
                .or_else(|| self.lookup(local, 0))
            {
                Some(handle) => handle,
                None => continue,
            };

            let keepalive_retries = self.inner.config.keepalive_retries as u16;
            let now = self.inner.now;
            let mut dead = false;
            if let Some(conn) = self.conns.get_mut(handle) {
                if !matches!(conn.state, State::Closed | State::CloseWait) {
                    conn.note_traffic(now, keepalive_retries);
                }
                if conn.receive(&mut self.inner, socket, events, &buf[..len])
                    == Err(Error::InvalidResponse)
                {
                    conn.disconnect(
                        &mut self.inner,
                        socket,
                        events,
                        Some(DisconnectReason::InvalidResponse),
                    );
                }
                dead = conn.defunct;
            }
            if dead {
                self.conns.remove(handle);
            }
        }
    }

    /// Construct a passive connection for an inbound SYN and run it through
    /// the state machine.
    fn accept_incoming<S, E>(
        &mut self,
        socket: &mut S,
        events: &mut E,
        buf: &[u8],
        from: SocketAddr,
    ) where
        S: DatagramSocket,
        E: Events,
    {
        let packet = RdpPacket::new_unchecked(buf);
        let flags = packet.flags();
        let foreign = packet.src_port();

        if flags & FLAG_SYN == 0 || flags & FLAG_RST != 0 {
            send_rst(&mut self.inner, socket, from, 0, foreign);
            return;
        }
        if flags & VERSION_BITS != FLAG_VER {
            net_debug!(
                "refusing connection with unsupported version {:#04x}",
                flags & VERSION_BITS
            );
            send_rst(&mut self.inner, socket, from, 0, foreign);
            return;
        }

        let local = match self.alloc_local_port(foreign) {
            Ok(local) => local,
            Err(_) => {
                send_rst(&mut self.inner, socket, from, 0, foreign);
                return;
            }
        };

        let mut conn = Connection::new(&mut self.inner, local, foreign, from);
        conn.passive = true;
        conn.set_state(State::Listen);
        let handle = self.conns.add(conn);

        let mut failed = false;
        let mut dead = false;
        if let Some(conn) = self.conns.get_mut(handle) {
            conn.handle = handle;
            failed = conn
                .receive(&mut self.inner, socket, events, buf)
                .is_err();
            dead = conn.defunct;
        }

        if failed {
            self.conns.remove(handle);
            send_rst(&mut self.inner, socket, from, 0, foreign);
        } else if dead {
            self.conns.remove(handle);
        }
    }

    fn fire_timers<S, E>(&mut self, socket: &mut S, events: &mut E)
    where
        S: DatagramSocket,
        E: Events,
    {
        let handles: Vec<ConnHandle> = self.conns.handles().collect();
        for handle in handles {
            let mut dead = false;
            if let Some(conn) = self.conns.get_mut(handle) {
                conn.dispatch_timers(&mut self.inner, socket, events);
                dead = conn.defunct;
            }
            if dead {
                self.conns.remove(handle);
            }
        }
    }

    fn lookup(&self, local: u16, foreign: u16) -> Option<ConnHandle> {
        self.conns
            .iter()
            .find(|(_, conn)| conn.local == local && conn.foreign == foreign)
            .map(|(handle, _)| handle)
    }

    fn has_connection_to(&self, foreign: u16, remote: SocketAddr) -> bool {
        self.conns
            .iter()
            .any(|(_, conn)| conn.foreign == foreign && conn.remote == remote)
    }

    /// Allocate an ephemeral port such that `(local, foreign)` is unique
    /// within this handle.
    fn alloc_local_port(&mut self, foreign: u16) -> Result<u16, Error> {
        let mut local = self.inner.rand.rand_port();
        for _ in 0..65535u32 {
            if self.lookup(local, foreign).is_none() {
                return Ok(local);
            }
            local = local.wrapping_add(1);
            if local == 0 {
                local = 1;
            }
        }
        net_debug!("cannot allocate a connection port; too many connections?");
        Err(Error::Exhausted)
    }
}

/// Answer a datagram that matches no connection with a bare reset.
fn send_rst<S>(
    inner: &mut InterfaceInner,
    socket: &mut S,
    to: SocketAddr,
    local: u16,
    foreign: u16,
) where
    S: DatagramSocket + ?Sized,
{
    let mut hdr = [0u8; FIXED_HEADER_LEN];
    let mut packet = RdpPacket::new_unchecked(&mut hdr[..]);
    packet.set_flags(FLAG_RST | FLAG_VER);
    packet.set_header_len(FIXED_HEADER_LEN);
    packet.set_src_port(local);
    packet.set_dst_port(foreign);

    inner.stats.rst_sends += 1;
    let _ = socket.send_to(&[&hdr[..]], to);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phy::{Loopback, TapVerdict};
    use crate::wire::{FLAG_ACK, SYN_HEADER_LEN, TTL_INFINITE};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    /// Records every notification for later inspection.
    #[derive(Default)]
    struct Recorder {
        accept_with: Option<(u16, u16, Vec<u8>)>,
        accepted_payloads: Vec<Vec<u8>>,
        connected: Vec<(ConnHandle, bool, Vec<u8>, Result<(), Error>)>,
        disconnected: Vec<(ConnHandle, DisconnectReason)>,
        received: Vec<(ConnHandle, SeqNumber, Vec<u8>)>,
        send_done: Vec<(Vec<u8>, Result<(), Error>)>,
        windows: Vec<(u16, Result<(), Error>)>,
    }

    impl Events for Recorder {
        fn accept(
            &mut self,
            _conn: ConnHandle,
            _remote: SocketAddr,
            syn_payload: &[u8],
        ) -> Option<Accept> {
            self.accepted_payloads.push(syn_payload.to_vec());
            self.accept_with
                .clone()
                .map(|(seg_max, seg_buf_max, payload)| Accept {
                    seg_max,
                    seg_buf_max,
                    payload,
                })
        }

        fn connected(
            &mut self,
            conn: ConnHandle,
            passive: bool,
            syn_payload: &[u8],
            status: Result<(), Error>,
        ) {
            self.connected.push((conn, passive, syn_payload.to_vec(), status));
        }

        fn disconnected(&mut self, conn: ConnHandle, reason: DisconnectReason) {
            self.disconnected.push((conn, reason));
        }

        fn recv(&mut self, conn: ConnHandle, message: &Message) {
            self.received.push((conn, message.start(), message.to_vec()));
        }

        fn send_done(&mut self, _conn: ConnHandle, buffer: Vec<u8>, status: Result<(), Error>) {
            self.send_done.push((buffer, status));
        }

        fn window_changed(&mut self, _conn: ConnHandle, window: u16, status: Result<(), Error>) {
            self.windows.push((window, status));
        }
    }

    /// Two interfaces joined by a loopback link, with a hand-stepped clock.
    /// Unless a test opts out, received messages are released back to the
    /// engine right after each poll, the way a prompt application would.
    struct Net {
        a: Interface<'static>,
        b: Interface<'static>,
        la: Loopback,
        lb: Loopback,
        ea: Recorder,
        eb: Recorder,
        now: Instant,
        auto_release: bool,
        released_a: usize,
        released_b: usize,
    }

    fn config(seed: u64) -> Config {
        Config {
            random_seed: seed,
            max_message_len: 40_000,
            ..Config::default()
        }
    }

    impl Net {
        fn new(config_a: Config, config_b: Config) -> Net {
            let (la, lb) = Loopback::pair(addr(1111), addr(2222));
            let mut b = Interface::new(config_b);
            b.listen();
            let mut eb = Recorder::default();
            eb.accept_with = Some((32, 1448, b"H2".to_vec()));
            Net {
                a: Interface::new(config_a),
                b,
                la,
                lb,
                ea: Recorder::default(),
                eb,
                now: Instant::from_millis(0),
                auto_release: true,
                released_a: 0,
                released_b: 0,
            }
        }

        /// One poll round on both sides at the current time.
        fn tick(&mut self) {
            self.a.poll(self.now, &mut self.la, true, true, &mut self.ea);
            self.b.poll(self.now, &mut self.lb, true, true, &mut self.eb);
            if self.auto_release {
                while self.released_a < self.ea.received.len() {
                    let (conn, som, _) = self.ea.received[self.released_a].clone();
                    let _ = self.a.recv_ready(self.now, conn, som);
                    self.released_a += 1;
                }
                while self.released_b < self.eb.received.len() {
                    let (conn, som, _) = self.eb.received[self.released_b].clone();
                    let _ = self.b.recv_ready(self.now, conn, som);
                    self.released_b += 1;
                }
            }
        }

        /// Poll until no datagrams are in flight in either direction.
        fn settle(&mut self) {
            for _ in 0..32 {
                self.tick();
                if self.la.queued() == 0 && self.lb.queued() == 0 {
                    break;
                }
            }
        }

        /// Advance the clock in `step`-ms increments, polling both sides.
        fn run_for(&mut self, ms: u64, step: u64) {
            let end = self.now + Duration::from_millis(ms);
            while self.now < end {
                self.now += Duration::from_millis(step);
                self.tick();
            }
        }

        /// Establish a connection from A to B and return A's handle.
        fn handshake(&mut self) -> ConnHandle {
            let handle = self
                .a
                .connect(self.now, &mut self.la, addr(2222), 32, 1448, b"H1".to_vec())
                .unwrap();
            self.settle();
            assert_eq!(self.a.state(handle), Some(State::Open));
            handle
        }

        fn b_handle(&self) -> ConnHandle {
            self.eb.connected[0].0
        }
    }

    #[test]
    fn test_handshake_callbacks() {
        // S1: both connect notifications fire with the right passive flags
        // and carry the peer's handshake payload.
        let mut net = Net::new(config(1), config(2));
        let handle = net.handshake();

        assert_eq!(net.ea.connected.len(), 1);
        let (a_conn, a_passive, a_payload, a_status) = net.ea.connected[0].clone();
        assert_eq!(a_conn, handle);
        assert!(!a_passive);
        assert_eq!(a_payload, b"H2");
        assert_eq!(a_status, Ok(()));

        assert_eq!(net.eb.accepted_payloads, vec![b"H1".to_vec()]);
        assert_eq!(net.eb.connected.len(), 1);
        let (_, b_passive, b_payload, b_status) = net.eb.connected[0].clone();
        assert!(b_passive);
        assert_eq!(b_payload, b"H1");
        assert_eq!(b_status, Ok(()));

        assert_eq!(net.b.state(net.b_handle()), Some(State::Open));
        assert_eq!(net.a.stats().syn_sends, 1);
        assert_eq!(net.b.stats().synack_sends, 1);
    }

    #[test]
    fn test_handshake_wire_level() {
        // S1 on the wire: drive the passive side with hand-built segments.
        let (mut la, mut lb) = Loopback::pair(addr(1111), addr(2222));
        let mut b = Interface::new(config(7));
        b.listen();
        let mut eb = Recorder::default();
        eb.accept_with = Some((32, 1448, b"H2".to_vec()));

        // SYN seq=1000 segmax=32 segbmax=1500 payload "H1".
        let mut syn = vec![0u8; SYN_HEADER_LEN + 2];
        {
            let mut packet = RdpPacket::new_unchecked(&mut syn[..]);
            packet.set_flags(FLAG_SYN | FLAG_VER);
            packet.set_header_len(SYN_HEADER_LEN);
            packet.set_src_port(7777);
            packet.set_dst_port(0);
            packet.set_data_len(2);
            packet.set_seq_number(SeqNumber(1000));
            packet.set_ack_number(SeqNumber(0));
            packet.set_seg_max(32);
            packet.set_seg_buf_max(1500);
            packet.set_delayed_ack_timeout(100);
            packet.set_options(crate::wire::FLAG_SDM);
            packet.clear_syn_reserve();
        }
        syn[SYN_HEADER_LEN..].copy_from_slice(b"H1");
        la.send_to(&[&syn[..]], addr(2222)).unwrap();

        b.poll(Instant::from_millis(0), &mut lb, true, true, &mut eb);

        // B answered with a SYN-ACK acking seq 1000 and carrying "H2".
        let mut rx = [0u8; 2048];
        let (len, _) = la.recv_from(&mut rx).unwrap();
        let syn_ack = RdpPacket::new_checked(&rx[..len]).unwrap();
        assert!(syn_ack.syn() && syn_ack.ack());
        assert_eq!(syn_ack.ack_number(), SeqNumber(1000));
        assert_eq!(syn_ack.dst_port(), 7777);
        assert_eq!(syn_ack.seg_max(), 32);
        assert_eq!(syn_ack.payload(), b"H2");
        let b_iss = syn_ack.seq_number();
        let b_port = syn_ack.src_port();

        // Final ACK seq=1001 ack=B's ISS completes the handshake.
        let mut ack = vec![0u8; FIXED_HEADER_LEN];
        {
            let mut packet = RdpPacket::new_unchecked(&mut ack[..]);
            packet.set_flags(FLAG_ACK | FLAG_VER);
            packet.set_header_len(FIXED_HEADER_LEN);
            packet.set_src_port(7777);
            packet.set_dst_port(b_port);
            packet.set_seq_number(SeqNumber(1001));
            packet.set_ack_number(b_iss);
            packet.set_last_consumed(b_iss);
            packet.set_ack_next(SeqNumber(1001));
            packet.clear_reserved();
        }
        la.send_to(&[&ack[..]], addr(2222)).unwrap();

        b.poll(Instant::from_millis(1), &mut lb, true, true, &mut eb);
        assert_eq!(eb.connected.len(), 1);
        let (handle, passive, payload, status) = eb.connected[0].clone();
        assert!(passive);
        assert_eq!(payload, b"H1");
        assert_eq!(status, Ok(()));
        assert_eq!(b.state(handle), Some(State::Open));
    }

    #[test]
    fn test_fragmented_round_trip() {
        // S2: a 3500-byte message travels as three fragments and arrives
        // as one in-order delivery; the sender sees a single completion.
        let mut net = Net::new(config(3), config(4));
        let handle = net.handshake();

        let payload: Vec<u8> = (0..3500u32).map(|i| i as u8).collect();
        net.a
            .send(net.now, &mut net.la, &mut net.ea, handle, payload.clone(), TTL_INFINITE)
            .unwrap();
        assert_eq!(net.a.pending(handle), Some(3));

        net.settle();
        // The delayed ACK fires and completes the exchange.
        net.run_for(200, 50);

        assert_eq!(net.eb.received.len(), 1);
        assert_eq!(net.eb.received[0].2, payload);
        assert_eq!(net.ea.send_done.len(), 1);
        assert_eq!(net.ea.send_done[0].1, Ok(()));
        assert_eq!(net.ea.send_done[0].0, payload);
        assert_eq!(net.a.pending(handle), Some(0));
    }

    #[test]
    fn test_out_of_order_eack_fast_retransmit() {
        // S3: the middle fragment is lost; the EACK mask flags the gap and
        // fast retransmit repairs it well before the retransmission timeout.
        let mut net = Net::new(
            Config {
                fast_retransmit_ack_counter: 0,
                ..config(5)
            },
            config(6),
        );
        let handle = net.handshake();

        // Drop the second data-bearing segment leaving A.
        let mut data_seen = 0;
        net.la.set_tap(move |datagram| {
            let packet = RdpPacket::new_unchecked(datagram);
            if !packet.syn() && packet.data_len() != 0 {
                data_seen += 1;
                if data_seen == 2 {
                    return TapVerdict::Drop;
                }
            }
            TapVerdict::Pass
        });

        let payload: Vec<u8> = (0..3500u32).map(|i| (i * 7) as u8).collect();
        net.a
            .send(net.now, &mut net.la, &mut net.ea, handle, payload.clone(), TTL_INFINITE)
            .unwrap();
        net.settle();

        // Nothing delivered yet: the gap holds the message back.
        assert!(net.eb.received.is_empty());

        // B's delayed ACK carries the EACK mask; A repairs the gap at once.
        net.run_for(300, 50);
        assert_eq!(net.eb.received.len(), 1);
        assert_eq!(net.eb.received[0].2, payload);
        assert_eq!(net.ea.send_done.len(), 1);
        assert_eq!(net.ea.send_done[0].1, Ok(()));
        // Well under the 1000 ms initial retransmission timeout.
        assert!(net.now.total_millis() < 400);
    }

    #[test]
    fn test_sender_ttl_expiry() {
        // S4: a message whose TTL lapses in flight is dropped, the window
        // moves past it, and traffic continues unharmed.
        let mut net = Net::new(
            Config {
                initial_data_timeout: 300,
                ..config(8)
            },
            config(9),
        );
        let handle = net.handshake();

        // The link eats every data segment for now.
        net.la.set_tap(|datagram| {
            let packet = RdpPacket::new_unchecked(datagram);
            if !packet.syn() && packet.data_len() != 0 {
                TapVerdict::Drop
            } else {
                TapVerdict::Pass
            }
        });

        let doomed: Vec<u8> = vec![0xd0; 3500];
        net.a
            .send(net.now, &mut net.la, &mut net.ea, handle, doomed.clone(), 50)
            .unwrap();

        // The retransmit timer fires at t+300 and finds the TTL long gone.
        net.run_for(400, 100);
        assert_eq!(net.a.stats().inflight_drops, 1);
        assert_eq!(net.a.pending(handle), Some(3));

        // The link heals; a subsequent message flows normally and its ACK
        // also completes the expired one.
        net.la.clear_tap();
        let fresh = vec![0x11; 100];
        net.a
            .send(net.now, &mut net.la, &mut net.ea, handle, fresh.clone(), TTL_INFINITE)
            .unwrap();
        net.run_for(400, 50);

        assert_eq!(net.eb.received.len(), 1);
        assert_eq!(net.eb.received[0].2, fresh);
        let statuses: Vec<_> = net.ea.send_done.iter().map(|(_, s)| *s).collect();
        assert!(statuses.contains(&Err(Error::TtlExpired)));
        assert!(statuses.contains(&Ok(())));
        assert_eq!(net.a.pending(handle), Some(0));
    }

    #[test]
    fn test_persist_probe_reopens_window() {
        // S5: the peer's window freezes below the minimum; persist NULs
        // keep probing until the application drains and the window reopens.
        let small = |seed| Config {
            random_seed: seed,
            max_message_len: 2500,
            ..Config::default()
        };
        let mut net = Net::new(small(10), small(11));
        net.auto_release = false;
        net.eb.accept_with = Some((4, 1448, b"H2".to_vec()));
        let handle = net
            .a
            .connect(net.now, &mut net.la, addr(2222), 4, 1448, b"H1".to_vec())
            .unwrap();
        net.settle();
        assert_eq!(net.a.state(handle), Some(State::Open));

        // Four un-released messages freeze B's window.
        for _ in 0..4 {
            net.a
                .send(net.now, &mut net.la, &mut net.ea, handle, vec![0x22; 1000], TTL_INFINITE)
                .unwrap();
        }
        net.run_for(200, 50);
        assert_eq!(net.eb.received.len(), 4);
        assert_eq!(net.ea.windows.last(), Some(&(0, Err(Error::Backpressure))));

        // The persist timer sends a NUL probe.
        net.run_for(1100, 100);
        assert!(net.a.stats().nul_sends >= 1);

        // B's application finally consumes one message; the advertised
        // window reopens and A hears about it.
        let (b_conn, som, _) = net.eb.received[0].clone();
        net.b.recv_ready(net.now, b_conn, som).unwrap();
        net.run_for(300, 50);
        let (window, status) = *net.ea.windows.last().unwrap();
        assert!(window > 0);
        assert_eq!(status, Ok(()));
    }

    #[test]
    fn test_keepalive_probe_timeout() {
        // S6: probes keep an idle link alive; an unreachable peer is
        // declared dead after the retry budget drains.
        let keep = |seed| Config {
            random_seed: seed,
            link_timeout: 3000,
            keepalive_retries: 3,
            max_message_len: 40_000,
            ..Config::default()
        };
        let mut net = Net::new(keep(12), keep(13));
        let handle = net.handshake();

        // An idle second passes; A probes and B answers, restoring the
        // retry budget.
        net.run_for(1200, 100);
        assert!(net.a.stats().nul_sends >= 1);
        assert_eq!(net.a.state(handle), Some(State::Open));

        // B drops off the network entirely.
        net.lb.set_tap(|_| TapVerdict::Drop);
        net.run_for(5000, 100);

        let reasons: Vec<_> = net.ea.disconnected.iter().map(|(_, r)| *r).collect();
        assert!(reasons.contains(&DisconnectReason::ProbeTimeout));
    }

    #[test]
    fn test_exact_window_fill_then_backpressure() {
        // B1: a message of exactly segmax * max_dlen fragments fills the
        // whole window; anything more is refused with backpressure.
        let small = |seed| Config {
            random_seed: seed,
            max_message_len: 5000,
            ..Config::default()
        };
        let mut net = Net::new(small(14), small(15));
        net.eb.accept_with = Some((4, 1448, b"H2".to_vec()));
        let handle = net
            .a
            .connect(net.now, &mut net.la, addr(2222), 4, 1448, b"H1".to_vec())
            .unwrap();
        net.settle();

        // max_dlen = 1448 - (8 + 36 + 4) = 1400; 4 fragments fill it.
        let full: Vec<u8> = vec![0x33; 4 * 1400];
        net.a
            .send(net.now, &mut net.la, &mut net.ea, handle, full, TTL_INFINITE)
            .unwrap();
        assert_eq!(net.a.pending(handle), Some(4));

        let rejected = net
            .a
            .send(net.now, &mut net.la, &mut net.ea, handle, vec![0x44], TTL_INFINITE)
            .unwrap_err();
        assert_eq!(rejected.reason, Error::Backpressure);
        assert_eq!(rejected.buffer, vec![0x44]);
    }

    #[test]
    fn test_zero_length_send_rejected() {
        // B2.
        let mut net = Net::new(config(16), config(17));
        let handle = net.handshake();
        let rejected = net
            .a
            .send(net.now, &mut net.la, &mut net.ea, handle, vec![], TTL_INFINITE)
            .unwrap_err();
        assert_eq!(rejected.reason, Error::InvalidData);
    }

    #[test]
    fn test_malformed_segment_resets_connection() {
        // B4: a segment whose dlen disagrees with the datagram length is
        // structurally rejected; the connection resets, nothing delivered.
        let mut net = Net::new(config(18), config(19));
        let handle = net.handshake();

        net.a
            .send(net.now, &mut net.la, &mut net.ea, handle, vec![0x55; 10], TTL_INFINITE)
            .unwrap();

        // Steal the data segment off the wire and replay it truncated, so
        // that dlen + hlen*2 no longer matches the datagram length.
        let mut raw = [0u8; 2048];
        let (len, from) = net.lb.recv_from(&mut raw).unwrap();
        net.la.send_to(&[&raw[..len - 1]], from).unwrap();
        net.settle();

        let reasons: Vec<_> = net.eb.disconnected.iter().map(|(_, r)| *r).collect();
        assert!(reasons.contains(&DisconnectReason::InvalidResponse));
        assert!(net.eb.received.is_empty());
    }

    #[test]
    fn test_connect_rejects_invalid_window() {
        // B5 at the API boundary: segmax above the ceiling never leaves
        // the house.
        let mut net = Net::new(config(20), config(21));
        let err = net
            .a
            .connect(net.now, &mut net.la, addr(2222), 257, 65000, vec![])
            .unwrap_err();
        assert_eq!(err, Error::InvalidConfig);
    }

    #[test]
    fn test_local_disconnect_notifies_and_reaps() {
        // A locally closed connection flushes, notifies, lingers through
        // TIMEWAIT and disappears.
        let mut net = Net::new(config(22), config(23));
        let handle = net.handshake();

        net.a
            .disconnect(net.now, &mut net.la, &mut net.ea, handle)
            .unwrap();
        assert_eq!(net.a.state(handle), Some(State::CloseWait));

        net.run_for(100, 50);
        let reasons: Vec<_> = net.ea.disconnected.iter().map(|(_, r)| *r).collect();
        assert!(reasons.contains(&DisconnectReason::Local));
        // The record is gone once the teardown timer ran.
        assert_eq!(net.a.state(handle), None);

        // B saw the RST.
        let b_reasons: Vec<_> = net.eb.disconnected.iter().map(|(_, r)| *r).collect();
        assert!(b_reasons.contains(&DisconnectReason::RemoteReset));
    }

    #[test]
    fn test_random_payload_round_trip() {
        // P8: arbitrary payloads survive fragmentation and reassembly.
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);

        let mut net = Net::new(config(24), config(25));
        let handle = net.handshake();

        let payload: Vec<u8> = (0..10_000).map(|_| rng.gen()).collect();
        net.a
            .send(net.now, &mut net.la, &mut net.ea, handle, payload.clone(), TTL_INFINITE)
            .unwrap();
        net.run_for(300, 50);

        assert_eq!(net.eb.received.len(), 1);
        assert_eq!(net.eb.received[0].2, payload);
        assert_eq!(net.ea.send_done.len(), 1);
        assert_eq!(net.ea.send_done[0].1, Ok(()));
    }

    #[test]
    fn test_poll_delay_reports_next_timer() {
        let mut net = Net::new(config(26), config(27));
        net.a
            .connect(net.now, &mut net.la, addr(2222), 32, 1448, vec![])
            .unwrap();
        net.a.poll(net.now, &mut net.la, false, true, &mut Recorder::default());
        // The connect retry timer is due within connect_timeout.
        let delay = net.a.poll_delay(net.now).unwrap();
        assert!(delay <= Duration::from_millis(1000));
        assert!(delay > Duration::ZERO);
    }
}
