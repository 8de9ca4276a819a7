/*! Connection state machine and per-connection queues.

A [Connection](struct.Connection.html) is one reliable channel to one remote
endpoint: the six-state machine, the send and receive rings, the RTT
estimator, and the four connection timers. Connections are owned by
[crate::iface::Interface] and driven exclusively from its poll loop.
*/

use core::fmt;
use std::net::SocketAddr;

use crate::config::{
    DISCONNECT_RETRY, DISCONNECT_RETRY_TIMEOUT, EACK_MASK_WORDS, MAX_WINDOW_SIZE,
    MIN_DELAYED_ACK_TIMEOUT, UDP_HEADER_LEN,
};
use crate::iface::{Accept, ConnHandle, DisconnectReason, Error, Events, InterfaceInner};
use crate::phy::{DatagramSocket, SocketError};
use crate::time::Instant;
use crate::wire::{
    in_window, RdpPacket, SeqNumber, FIXED_HEADER_LEN, FLAG_ACK, FLAG_EACK, FLAG_NUL, FLAG_RST,
    FLAG_SDM, FLAG_SYN, FLAG_VER, SYN_HEADER_LEN, TTL_INFINITE, VERSION_BITS,
};

mod recv;
mod rtte;
mod send;
mod timer;

pub use self::recv::Message;

use self::recv::{RecvOutcome, RecvQueue};
use self::rtte::RttEstimator;
use self::send::SendQueue;
use self::timer::Timer;

/// The states of the connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// No connection exists.
    Closed,
    /// Passive open: waiting for a SYN from the remote.
    Listen,
    /// Active open: SYN sent, waiting for the SYN-ACK.
    SynSent,
    /// SYN received and accepted; SYN-ACK sent, waiting for the final ACK.
    SynRcvd,
    /// Connection established; data flows.
    Open,
    /// Local close or remote reset; waiting out TIMEWAIT.
    CloseWait,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            State::Closed => write!(f, "CLOSED"),
            State::Listen => write!(f, "LISTEN"),
            State::SynSent => write!(f, "SYN-SENT"),
            State::SynRcvd => write!(f, "SYN-RCVD"),
            State::Open => write!(f, "OPEN"),
            State::CloseWait => write!(f, "CLOSE-WAIT"),
        }
    }
}

/// The interesting fields of the segment currently being processed.
#[derive(Debug, Clone, Copy)]
struct Seg {
    flags: u8,
    dlen: u16,
    seq: SeqNumber,
    ack: SeqNumber,
    lcs: SeqNumber,
    acknxt: SeqNumber,
    som: SeqNumber,
    ttl: u32,
    fcnt: u16,
    window: u16,
}

/// Whether the advertised window still needs a full message to fit, and the
/// largest message a connection must be able to carry.
pub(crate) fn check_config_valid(
    segmax: u16,
    segbmax: u16,
    window: u16,
    max_message_len: usize,
) -> bool {
    let mask_words = (window as usize + 31) / 32;
    let hlen = FIXED_HEADER_LEN + mask_words * 4;

    if segmax > MAX_WINDOW_SIZE {
        net_debug!("segmax {} exceeds maximum window size {}", segmax, MAX_WINDOW_SIZE);
        return false;
    }
    if segbmax as usize <= UDP_HEADER_LEN + hlen {
        net_debug!("segbmax {} too small (need more than {})", segbmax, UDP_HEADER_LEN + hlen);
        return false;
    }
    let max_payload = segbmax as usize - (UDP_HEADER_LEN + hlen);
    if max_payload * (segmax as usize) < max_message_len {
        net_debug!(
            "segmax {} and segbmax {} cannot fit a {} byte message",
            segmax,
            segbmax,
            max_message_len
        );
        return false;
    }
    true
}

/// One reliable channel to one remote endpoint.
#[derive(Debug)]
pub(crate) struct Connection {
    /// Randomly chosen connection identifier, never the invalid marker.
    pub(crate) id: u32,
    /// The slot this connection occupies in the interface.
    pub(crate) handle: ConnHandle,
    pub(crate) state: State,
    /// True when this end was connected to, false when it connected.
    pub(crate) passive: bool,
    /// Our connection port.
    pub(crate) local: u16,
    /// The peer's connection port. Zero until the handshake reveals it.
    pub(crate) foreign: u16,
    /// The peer's UDP endpoint.
    pub(crate) remote: SocketAddr,
    pub(crate) snd: SendQueue,
    pub(crate) rcv: RecvQueue,
    pub(crate) rtte: RttEstimator,
    /// Segments the peer can currently accept.
    pub(crate) window: u16,
    /// Segments required to carry the largest application message.
    pub(crate) min_send_window: u16,
    /// EACK mask words expected in segments from the peer.
    pub(crate) remote_msk_sz: u16,
    /// Last time any traffic arrived on this connection.
    pub(crate) last_seen: Instant,
    /// Our handshake payload, retained for SYN retransmission.
    syn_data: Vec<u8>,
    /// The peer's handshake payload, retained on the passive side so the
    /// connect notification can carry it.
    peer_syn_data: Vec<u8>,
    /// Connect timer during establishment, TIMEWAIT timer during teardown.
    connect_timer: Timer,
    probe_timer: Timer,
    ack_timer: Timer,
    persist_timer: Timer,
    /// Segments received since the last ACK we sent.
    ack_pending: u16,
    /// A locally initiated close still owes the disconnect notification.
    notify_local_on_timer: bool,
    /// The record can be dropped by the interface.
    pub(crate) defunct: bool,
}

impl Connection {
    pub(crate) fn new(inner: &mut InterfaceInner, local: u16, foreign: u16, remote: SocketAddr) -> Connection {
        let id = inner.rand.rand_conn_id();
        let iss = SeqNumber(inner.rand.rand_u32());
        net_trace!("new connection {} local={} foreign={}", id, local, foreign);
        Connection {
            id,
            handle: ConnHandle::default(),
            state: State::Closed,
            passive: false,
            local,
            foreign,
            remote,
            snd: SendQueue::new(iss),
            rcv: RecvQueue::new(),
            rtte: RttEstimator::new(inner.config.initial_data_timeout),
            window: 0,
            min_send_window: 0,
            remote_msk_sz: 0,
            last_seen: inner.now,
            syn_data: Vec::new(),
            peer_syn_data: Vec::new(),
            connect_timer: Timer::idle(),
            probe_timer: Timer::idle(),
            ack_timer: Timer::idle(),
            persist_timer: Timer::idle(),
            ack_pending: 0,
            notify_local_on_timer: false,
            defunct: false,
        }
    }

    pub(crate) fn set_state(&mut self, state: State) {
        net_trace!("conn {}: {}=>{}", self.id, self.state, state);
        self.state = state;
    }

    /// Any traffic from the peer proves the link alive: refresh the
    /// keepalive bookkeeping.
    pub(crate) fn note_traffic(&mut self, now: Instant, keepalive_retries: u16) {
        self.last_seen = now;
        self.probe_timer.set_retries(keepalive_retries);
    }

    // === Emission ===========================================================

    /// Send a bare control segment carrying the current acknowledgment
    /// state (and the EACK mask when one is pending). On success any
    /// delayed ACK becomes redundant and is cancelled.
    fn emit_ctl(
        &mut self,
        inner: &mut InterfaceInner,
        socket: &mut dyn DatagramSocket,
        flags: u8,
        seq: SeqNumber,
        ack: SeqNumber,
    ) -> Result<(), SocketError> {
        let mut hdr = [0u8; FIXED_HEADER_LEN + EACK_MASK_WORDS * 4];
        let mask_words = if self.rcv.eack.is_empty() {
            0
        } else {
            self.rcv.eack.words().len()
        };
        let hlen = FIXED_HEADER_LEN + mask_words * 4;

        let mut packet = RdpPacket::new_unchecked(&mut hdr[..hlen]);
        packet.set_flags(flags | if mask_words != 0 { FLAG_EACK } else { 0 });
        packet.set_header_len(hlen);
        packet.set_src_port(self.local);
        packet.set_dst_port(self.foreign);
        packet.set_data_len(0);
        packet.set_seq_number(seq);
        packet.set_ack_number(ack);
        packet.set_ttl(0);
        packet.set_last_consumed(self.rcv.lcs);
        packet.set_ack_next(self.snd.una);
        packet.set_message_start(SeqNumber(0));
        packet.set_fragment_count(0);
        packet.clear_reserved();
        if mask_words != 0 {
            packet.set_eack_mask(self.rcv.eack.words());
        }

        match socket.send_to(&[&hdr[..hlen]], self.remote) {
            Ok(()) => {
                self.ack_timer.cancel();
                self.ack_pending = 0;
                Ok(())
            }
            Err(SocketError::WouldBlock) => {
                inner.traffic_jam = true;
                Err(SocketError::WouldBlock)
            }
            Err(err) => {
                self.ack_timer.cancel();
                self.ack_pending = 0;
                Err(err)
            }
        }
    }

    /// (Re)send the data fragment held in send slot `index`, piggybacking
    /// the current acknowledgment state.
    fn emit_data(
        &mut self,
        inner: &mut InterfaceInner,
        socket: &mut dyn DatagramSocket,
        index: usize,
        wire_ttl: u32,
    ) -> Result<(), SocketError> {
        let mut hdr = [0u8; FIXED_HEADER_LEN + EACK_MASK_WORDS * 4];
        let mask_words = if self.rcv.eack.is_empty() {
            0
        } else {
            self.rcv.eack.words().len()
        };
        let hlen = FIXED_HEADER_LEN + mask_words * 4;

        let (seq, som, fcnt, dlen) = {
            let slot = self.snd.slot(index);
            (slot.seq, slot.som, slot.fcnt, slot.len as u16)
        };

        let mut packet = RdpPacket::new_unchecked(&mut hdr[..hlen]);
        packet.set_flags(FLAG_ACK | FLAG_VER | if mask_words != 0 { FLAG_EACK } else { 0 });
        packet.set_header_len(hlen);
        packet.set_src_port(self.local);
        packet.set_dst_port(self.foreign);
        packet.set_data_len(dlen);
        packet.set_seq_number(seq);
        packet.set_ack_number(self.rcv.cur);
        packet.set_ttl(wire_ttl);
        packet.set_last_consumed(self.rcv.lcs);
        packet.set_ack_next(self.snd.una);
        packet.set_message_start(som);
        packet.set_fragment_count(fcnt);
        packet.clear_reserved();
        if mask_words != 0 {
            packet.set_eack_mask(self.rcv.eack.words());
        }

        net_trace!(
            "conn {}: data seq={} ack={} lcs={} ttl={}",
            self.id,
            seq,
            self.rcv.cur,
            self.rcv.lcs,
            wire_ttl
        );

        let result = socket.send_to(&[&hdr[..hlen], self.snd.fragment_payload(index)], self.remote);
        match result {
            Ok(()) => {
                // Piggybacked the ACK: the delayed timer is moot.
                self.ack_timer.cancel();
                self.ack_pending = 0;
                inner.traffic_jam = false;
                Ok(())
            }
            Err(SocketError::WouldBlock) => {
                inner.traffic_jam = true;
                Err(SocketError::WouldBlock)
            }
            Err(err) => Err(err),
        }
    }

    /// Send our SYN (or SYN-ACK, when we are past LISTEN) together with the
    /// retained handshake payload.
    fn emit_syn(
        &mut self,
        inner: &mut InterfaceInner,
        socket: &mut dyn DatagramSocket,
    ) -> Result<(), SocketError> {
        let mut hdr = [0u8; SYN_HEADER_LEN];
        let syn_ack = self.state == State::SynRcvd;

        let mut packet = RdpPacket::new_unchecked(&mut hdr[..]);
        packet.set_flags(FLAG_SYN | FLAG_VER | if syn_ack { FLAG_ACK } else { 0 });
        packet.set_header_len(SYN_HEADER_LEN);
        packet.set_src_port(self.local);
        packet.set_dst_port(self.foreign);
        packet.set_data_len(self.syn_data.len() as u16);
        packet.set_seq_number(self.snd.iss);
        packet.set_ack_number(self.rcv.cur);
        packet.set_seg_max(self.rcv.segmax);
        packet.set_seg_buf_max(self.rcv.segbmax);
        packet.set_delayed_ack_timeout(inner.config.delayed_ack_timeout);
        packet.set_options(FLAG_SDM);
        packet.clear_syn_reserve();

        if syn_ack {
            inner.stats.synack_sends += 1;
        } else {
            inner.stats.syn_sends += 1;
        }

        socket.send_to(&[&hdr[..], &self.syn_data[..]], self.remote)
    }

    /// Retain the handshake payload and start the connect retry schedule.
    fn send_syn(
        &mut self,
        inner: &mut InterfaceInner,
        socket: &mut dyn DatagramSocket,
        payload: Vec<u8>,
    ) -> Result<(), Error> {
        self.syn_data = payload;
        match self.emit_syn(inner, socket) {
            Ok(()) => {
                self.connect_timer.arm(
                    inner.now,
                    inner.config.connect_timeout,
                    (inner.config.connect_retries + 1) as u16,
                );
                Ok(())
            }
            Err(SocketError::WouldBlock) => Err(Error::WouldBlock),
            Err(_) => Err(Error::SocketError),
        }
    }

    // === Establishment ======================================================

    /// Active open: initialize the receive side we advertise and send the
    /// first SYN.
    pub(crate) fn connect(
        &mut self,
        inner: &mut InterfaceInner,
        socket: &mut dyn DatagramSocket,
        segmax: u16,
        segbmax: u16,
        payload: Vec<u8>,
    ) -> Result<(), Error> {
        self.rcv.init(segmax, segbmax);
        self.send_syn(inner, socket, payload)?;
        self.set_state(State::SynSent);
        Ok(())
    }

    /// Compute the payload budget towards this peer and allocate the send
    /// ring. Requires both sides' window parameters to be known.
    fn init_send_side(&mut self, inner: &InterfaceInner) -> Result<(), Error> {
        let mask_words = (self.rcv.segmax as usize + 31) / 32;
        let hlen = FIXED_HEADER_LEN + mask_words * 4;

        if !check_config_valid(
            self.snd.segmax,
            self.snd.segbmax,
            self.rcv.segmax,
            inner.config.max_message_len,
        ) {
            return Err(Error::InvalidConfig);
        }

        let max_dlen = self.snd.segbmax as usize - (UDP_HEADER_LEN + hlen);
        self.snd.init_ring(max_dlen);
        self.min_send_window = inner.config.max_message_len.div_ceil(max_dlen) as u16;
        net_debug!(
            "conn {}: max_dlen={} min_send_window={}",
            self.id,
            max_dlen,
            self.min_send_window
        );
        Ok(())
    }

    /// Adopt the peer's parameters from a SYN or SYN-ACK header.
    fn unmarshal_syn(&mut self, packet: &RdpPacket<&[u8]>, seg: &Seg) {
        self.foreign = packet.src_port();
        self.snd.adopt_peer(
            packet.seg_max(),
            packet.seg_buf_max(),
            packet.delayed_ack_timeout(),
        );
        self.rcv.set_initial(seg.seq);
        self.window = self.snd.segmax;
        self.remote_msk_sz = (self.snd.segmax + 31) / 32;
    }

    /// Final transition into OPEN: complete the receive side and start the
    /// steady-state timers.
    fn enter_open(&mut self, inner: &InterfaceInner) {
        self.rcv.post_init();
        self.set_state(State::Open);
        self.connect_timer.cancel();
        self.last_seen = inner.now;

        let cfg = &inner.config;
        self.probe_timer.arm(
            inner.now,
            cfg.link_timeout / cfg.keepalive_retries.max(1),
            cfg.keepalive_retries as u16,
        );
        self.persist_timer.arm(inner.now, cfg.persist_interval, 0);
        self.ack_timer.arm(inner.now, cfg.delayed_ack_timeout, 0);
        self.syn_data = Vec::new();
    }

    // === Ingress ============================================================

    /// Validate an inbound segment and feed it to the state machine.
    ///
    /// Structural rejects surface as [Error::InvalidResponse] and the caller
    /// disconnects the peer.
    pub(crate) fn receive(
        &mut self,
        inner: &mut InterfaceInner,
        socket: &mut dyn DatagramSocket,
        events: &mut dyn Events,
        buf: &[u8],
    ) -> Result<(), Error> {
        let packet = RdpPacket::new_checked(buf).map_err(|_| Error::InvalidResponse)?;
        let flags = packet.flags();

        let mut seg = Seg {
            flags,
            dlen: packet.data_len(),
            seq: packet.seq_number(),
            ack: packet.ack_number(),
            lcs: SeqNumber(0),
            acknxt: SeqNumber(0),
            som: SeqNumber(0),
            ttl: TTL_INFINITE,
            fcnt: 0,
            window: 0,
        };

        if flags & FLAG_RST != 0 {
            // A reset needs no further scrutiny.
            self.machine(inner, socket, events, &seg, &packet);
            return Ok(());
        }

        if seg.dlen as usize + packet.header_len() != buf.len() {
            net_debug!(
                "length check failed: len={} hlen={} dlen={}",
                buf.len(),
                packet.header_len(),
                seg.dlen
            );
            return Err(Error::InvalidResponse);
        }

        if flags & FLAG_SYN == 0 {
            seg.lcs = packet.last_consumed();
            seg.acknxt = packet.ack_next();
            seg.ttl = packet.ttl();
            seg.som = packet.message_start();
            seg.fcnt = packet.fragment_count();
            seg.window =
                (self.snd.segmax as i32).wrapping_sub(self.snd.nxt - (seg.lcs + 1)) as u16;

            if self.snd.nxt < seg.ack {
                net_debug!("ack {} ahead of snd.nxt {}", seg.ack, self.snd.nxt);
                return Err(Error::InvalidResponse);
            }
            if seg.ack < seg.lcs {
                net_debug!("lcs {} and ack {} out of order", seg.lcs, seg.ack);
                return Err(Error::InvalidResponse);
            }

            // SEQ and ACKNXT must fall within the receive window; a segment
            // with no payload is allowed one extra.
            let span = seg.seq - seg.acknxt;
            if span > self.rcv.segmax as i32
                || seg.seq < seg.acknxt
                || (seg.dlen != 0 && span == self.rcv.segmax as i32)
            {
                net_debug!("bad sequence numbers seq={} acknxt={}", seg.seq, seg.acknxt);
                return Err(Error::InvalidResponse);
            }

            if seg.dlen != 0
                && (seg.fcnt == 0
                    || seg.fcnt > self.rcv.segmax
                    || seg.seq < seg.som
                    || (seg.seq - seg.som) >= seg.fcnt as i32)
            {
                net_debug!(
                    "bad data segment seq={} som={} fcnt={}",
                    seg.seq,
                    seg.som,
                    seg.fcnt
                );
                return Err(Error::InvalidResponse);
            }
        }

        self.machine(inner, socket, events, &seg, &packet);
        Ok(())
    }

    /// The per-state segment processing.
    fn machine(
        &mut self,
        inner: &mut InterfaceInner,
        socket: &mut dyn DatagramSocket,
        events: &mut dyn Events,
        seg: &Seg,
        packet: &RdpPacket<&[u8]>,
    ) {
        match self.state {
            State::Closed => self.state_closed(inner, socket, seg),
            State::Listen => self.state_listen(inner, socket, events, seg, packet),
            State::SynSent => self.state_syn_sent(inner, socket, events, seg, packet),
            State::SynRcvd => self.state_syn_rcvd(inner, socket, events, seg),
            State::Open => self.state_open(inner, socket, events, seg, packet),
            // The transition out of CLOSE-WAIT is driven by the TIMEWAIT
            // timer alone.
            State::CloseWait => {}
        }
    }

    fn state_closed(
        &mut self,
        inner: &mut InterfaceInner,
        socket: &mut dyn DatagramSocket,
        seg: &Seg,
    ) {
        if seg.flags & FLAG_RST != 0 {
            inner.stats.rst_recvs += 1;
            return;
        }
        if seg.flags & (FLAG_ACK | FLAG_NUL) != 0 {
            if seg.flags & FLAG_NUL != 0 {
                inner.stats.nul_recvs += 1;
            }
            inner.stats.rst_sends += 1;
            let _ = self.emit_ctl(inner, socket, FLAG_RST | FLAG_VER, seg.ack + 1, SeqNumber(0));
            return;
        }
        inner.stats.rst_sends += 1;
        let _ = self.emit_ctl(
            inner,
            socket,
            FLAG_RST | FLAG_ACK | FLAG_VER,
            SeqNumber(0),
            seg.seq,
        );
    }

    fn state_listen(
        &mut self,
        inner: &mut InterfaceInner,
        socket: &mut dyn DatagramSocket,
        events: &mut dyn Events,
        seg: &Seg,
        packet: &RdpPacket<&[u8]>,
    ) {
        if seg.flags & FLAG_RST != 0 {
            inner.stats.rst_recvs += 1;
            return;
        }
        if seg.flags & (FLAG_ACK | FLAG_NUL) != 0 {
            net_debug!("conn {}: foreign host acking a listening connection", self.id);
            if seg.flags & FLAG_NUL != 0 {
                inner.stats.nul_recvs += 1;
            }
            inner.stats.rst_sends += 1;
            let _ = self.emit_ctl(inner, socket, FLAG_RST | FLAG_VER, seg.ack + 1, SeqNumber(0));
            self.disconnect(inner, socket, events, Some(DisconnectReason::InvalidResponse));
            return;
        }
        if seg.flags & FLAG_SYN == 0 {
            return;
        }

        inner.stats.syn_recvs += 1;
        self.unmarshal_syn(packet, seg);
        net_debug!(
            "conn {}: syn received, peer can buffer {} x {} bytes",
            self.id,
            self.snd.segmax,
            self.snd.segbmax
        );

        inner.stats.accept_cbs += 1;
        let decision = events.accept(self.handle, self.remote, packet.payload());
        match decision {
            Some(accept) => {
                if self.establish_passive(inner, socket, seg, packet, accept).is_err() {
                    inner.stats.rst_sends += 1;
                    let _ =
                        self.emit_ctl(inner, socket, FLAG_RST | FLAG_VER, self.snd.nxt, SeqNumber(0));
                    self.set_state(State::Closed);
                    self.defunct = true;
                }
            }
            None => {
                net_debug!("conn {}: accept refused", self.id);
                inner.stats.rst_sends += 1;
                let _ = self.emit_ctl(inner, socket, FLAG_RST | FLAG_VER, seg.ack + 1, seg.seq);
                self.set_state(State::Closed);
                self.defunct = true;
            }
        }
    }

    /// The accept decision carries our side of the window negotiation:
    /// initialize both queues, move to SYN-RCVD and answer with a SYN-ACK.
    fn establish_passive(
        &mut self,
        inner: &mut InterfaceInner,
        socket: &mut dyn DatagramSocket,
        seg: &Seg,
        packet: &RdpPacket<&[u8]>,
        accept: Accept,
    ) -> Result<(), Error> {
        if !check_config_valid(
            accept.seg_max,
            accept.seg_buf_max,
            MAX_WINDOW_SIZE,
            inner.config.max_message_len,
        ) {
            return Err(Error::InvalidConfig);
        }

        self.rcv.init(accept.seg_max, accept.seg_buf_max);
        self.rcv.set_initial(seg.seq);
        self.peer_syn_data = packet.payload().to_vec();
        self.init_send_side(inner)?;

        self.set_state(State::SynRcvd);
        self.send_syn(inner, socket, accept.payload)?;
        Ok(())
    }

    fn state_syn_sent(
        &mut self,
        inner: &mut InterfaceInner,
        socket: &mut dyn DatagramSocket,
        events: &mut dyn Events,
        seg: &Seg,
        packet: &RdpPacket<&[u8]>,
    ) {
        let mut status: Result<(), Error> = Ok(());

        if seg.flags & FLAG_RST != 0 {
            inner.stats.rst_recvs += 1;
            // When the versions do not match, the likeliest reason for the
            // reset is exactly that.
            status = if seg.flags & VERSION_BITS != FLAG_VER {
                Err(Error::VersionNotSupported)
            } else {
                Err(Error::RemoteReset)
            };
        } else if seg.flags & FLAG_SYN != 0 {
            inner.stats.syn_recvs += 1;
            self.unmarshal_syn(packet, seg);
            status = self.init_send_side(inner);

            if status.is_ok() {
                if seg.flags & FLAG_ACK != 0 {
                    if seg.flags & VERSION_BITS != FLAG_VER {
                        net_debug!(
                            "conn {}: unsupported protocol version {:#04x}",
                            self.id,
                            seg.flags & VERSION_BITS
                        );
                        status = Err(Error::VersionNotSupported);
                    } else if seg.ack != self.snd.iss {
                        net_debug!("conn {}: syn-ack does not ack our iss", self.id);
                        status = Err(Error::InvalidResponse);
                    } else {
                        inner.stats.synack_recvs += 1;
                        self.snd.una = seg.ack + 1;
                        self.enter_open(inner);

                        inner.stats.synackack_sends += 1;
                        match self.emit_ctl(
                            inner,
                            socket,
                            FLAG_ACK | FLAG_VER,
                            self.snd.nxt,
                            self.rcv.cur,
                        ) {
                            Ok(()) | Err(SocketError::WouldBlock) => {
                                inner.stats.connect_cbs += 1;
                                events.connected(self.handle, false, packet.payload(), Ok(()));
                            }
                            Err(_) => status = Err(Error::SocketError),
                        }
                    }
                } else {
                    // Simultaneous open: both sides sent a SYN. Treat the
                    // peer's SYN like a passive open and answer SYN-ACK.
                    net_debug!("conn {}: simultaneous open", self.id);
                    inner.stats.accept_cbs += 1;
                    match events.accept(self.handle, self.remote, packet.payload()) {
                        Some(accept) => {
                            status = self.establish_passive(inner, socket, seg, packet, accept);
                        }
                        None => status = Err(Error::InvalidState),
                    }
                }
            }
        }

        if let Err(err) = status {
            self.set_state(State::Closed);
            self.connect_timer.cancel();
            inner.stats.connect_cbs += 1;
            events.connected(self.handle, self.passive, &[], Err(err));
            // The record stays for the host to inspect and release.
        }
    }

    fn state_syn_rcvd(
        &mut self,
        inner: &mut InterfaceInner,
        socket: &mut dyn DatagramSocket,
        events: &mut dyn Events,
        seg: &Seg,
    ) {
        if seg.flags & FLAG_RST != 0 {
            inner.stats.rst_recvs += 1;
            self.disconnect(inner, socket, events, Some(DisconnectReason::RemoteReset));
            return;
        }

        if !in_window(self.rcv.cur + 1, self.rcv.segmax as u32, seg.seq) {
            net_debug!("conn {}: unacceptable sequence {}", self.id, seg.seq);
            let _ = self.emit_ctl(inner, socket, FLAG_ACK | FLAG_VER, self.snd.nxt, self.rcv.cur);
            return;
        }

        if seg.flags & FLAG_SYN != 0 {
            inner.stats.syn_recvs += 1;
            self.disconnect(inner, socket, events, Some(DisconnectReason::InvalidResponse));
            return;
        }

        if seg.flags & FLAG_EACK != 0 {
            self.disconnect(inner, socket, events, Some(DisconnectReason::InvalidResponse));
            return;
        }

        if seg.flags & FLAG_ACK == 0 {
            return;
        }

        if seg.ack != self.snd.iss {
            net_debug!("conn {}: ack {} does not ack our iss", self.id, seg.ack);
            self.disconnect(inner, socket, events, Some(DisconnectReason::InvalidResponse));
            return;
        }

        inner.stats.synackack_recvs += 1;
        self.snd.una = seg.ack + 1;
        self.enter_open(inner);

        if seg.flags & FLAG_NUL != 0 {
            inner.stats.nul_recvs += 1;
            inner.stats.nul_sends += 1;
            let _ = self.emit_ctl(inner, socket, FLAG_ACK | FLAG_VER, self.snd.nxt, self.rcv.cur);
        }

        inner.stats.connect_cbs += 1;
        let payload = core::mem::take(&mut self.peer_syn_data);
        events.connected(self.handle, true, &payload, Ok(()));
    }

    fn state_open(
        &mut self,
        inner: &mut InterfaceInner,
        socket: &mut dyn DatagramSocket,
        events: &mut dyn Events,
        seg: &Seg,
        packet: &RdpPacket<&[u8]>,
    ) {
        let valid_window = if seg.dlen != 0 {
            self.rcv.segmax as u32
        } else {
            self.rcv.segmax as u32 + 1
        };
        let mut is_duplicate = false;

        if seg.flags & FLAG_RST != 0 {
            inner.stats.rst_recvs += 1;
            self.disconnect(inner, socket, events, Some(DisconnectReason::RemoteReset));
            return;
        }

        if !in_window(self.rcv.lcs + 1, valid_window, seg.seq) {
            // The peer may have missed our ACK and repeated an old segment.
            if seg.dlen != 0
                && in_window(
                    self.rcv.cur + 1 - self.rcv.segmax as usize,
                    self.rcv.segmax as u32,
                    seg.seq,
                )
            {
                is_duplicate = true;
            } else {
                net_debug!(
                    "conn {}: unacceptable sequence {} (cur={} lcs={})",
                    self.id,
                    seg.seq,
                    self.rcv.cur,
                    self.rcv.lcs
                );
                self.disconnect(inner, socket, events, Some(DisconnectReason::InvalidResponse));
                return;
            }
        }

        if seg.flags & FLAG_SYN != 0 {
            inner.stats.syn_recvs += 1;
            // A repeat of the peer's half of a simultaneous open deserves a
            // fresh ACK; anything else is a protocol violation.
            if is_duplicate
                && !self.passive
                && seg.flags & FLAG_ACK != 0
                && seg.ack == self.snd.iss
            {
                let _ =
                    self.emit_ctl(inner, socket, FLAG_ACK | FLAG_VER, self.snd.nxt, self.rcv.cur);
            } else {
                self.disconnect(inner, socket, events, Some(DisconnectReason::InvalidResponse));
            }
            return;
        }

        if self.rcv.cur + 1 < seg.acknxt {
            net_debug!(
                "conn {}: peer expired everything below {} (cur={})",
                self.id,
                seg.acknxt,
                self.rcv.cur
            );
            let out = self.rcv.flush_expired(inner.now, seg.acknxt);
            self.finish_recv(inner, events, out);
        }

        if seg.flags & FLAG_ACK != 0 {
            let mut need_update = false;
            if in_window(self.snd.una, (self.snd.nxt - self.snd.una) as u32 + 1, seg.ack)
                || self.snd.lcs != seg.lcs
            {
                self.snd.una = seg.ack + 1;
                need_update = true;
            }

            if seg.flags & FLAG_EACK != 0 {
                let words = packet
                    .eack_mask_words()
                    .min(self.remote_msk_sz as usize)
                    .min(EACK_MASK_WORDS);
                let mut mask = [0u32; EACK_MASK_WORDS];
                for (i, word) in mask.iter_mut().enumerate().take(words) {
                    *word = packet.eack_mask_word(i);
                }
                self.snd.process_eack(
                    inner.now,
                    seg.ack,
                    &mask[..words],
                    inner.config.fast_retransmit_ack_counter,
                );
            }

            if need_update {
                let (out, result) =
                    self.snd.process_ack(inner.now, seg.ack, seg.lcs, &mut self.rtte);
                for (buf, _len, expired) in out.completed {
                    inner.stats.send_cbs += 1;
                    let status = if expired { Err(Error::TtlExpired) } else { Ok(()) };
                    events.send_done(self.handle, buf, status);
                }
                if out.need_unsolicited_ack && !self.ack_timer.is_armed() {
                    self.ack_timer.arm(inner.now, MIN_DELAYED_ACK_TIMEOUT, 1);
                }
                if result.is_err() {
                    self.disconnect(
                        inner,
                        socket,
                        events,
                        Some(DisconnectReason::InvalidResponse),
                    );
                    return;
                }
            }
        }

        if seg.flags & FLAG_NUL != 0 {
            inner.stats.nul_recvs += 1;
            // Answer probes immediately so the peer sees the window now.
            match self.emit_ctl(inner, socket, FLAG_ACK | FLAG_VER, self.snd.nxt, self.rcv.cur) {
                Err(SocketError::WouldBlock) => self.ack_timer.arm(inner.now, 0, 1),
                _ => (),
            }
        } else if seg.dlen != 0 {
            if seg.seq < self.rcv.cur + 1 {
                is_duplicate = true;
            }

            if !is_duplicate {
                match self.rcv.store(
                    inner.now,
                    seg.seq,
                    seg.som,
                    seg.fcnt,
                    seg.ttl,
                    packet.payload(),
                ) {
                    Ok(out) => self.finish_recv(inner, events, out),
                    Err(_) => {
                        self.disconnect(
                            inner,
                            socket,
                            events,
                            Some(DisconnectReason::InvalidResponse),
                        );
                        return;
                    }
                }
            }

            self.ack_pending += 1;
            if !self.ack_timer.is_armed() {
                self.ack_timer.arm(inner.now, inner.config.delayed_ack_timeout, 1);
            } else if self.ack_pending >= self.rcv.segmax / 4 {
                net_debug!("conn {}: {} segments unacked, urgent ack", self.id, self.ack_pending);
                self.ack_fire(inner, socket);
            }
        }

        if self.window != seg.window {
            if !self.snd.in_flight()
                && seg.window < self.min_send_window
                && !self.persist_timer.is_armed()
            {
                let cfg = &inner.config;
                self.persist_timer.arm(
                    inner.now,
                    cfg.persist_interval,
                    (cfg.total_app_timeout / cfg.persist_interval + 1) as u16,
                );
            } else if self.persist_timer.is_armed()
                && (seg.window >= self.min_send_window || self.snd.in_flight())
            {
                self.persist_timer.cancel();
            }

            self.window = seg.window;
            let status = if seg.window != 0 {
                Ok(())
            } else {
                Err(Error::Backpressure)
            };
            events.window_changed(self.handle, seg.window, status);
        }
    }

    /// Deliver completed messages and schedule the delayed ACK that intake
    /// asked for.
    fn finish_recv(
        &mut self,
        inner: &mut InterfaceInner,
        events: &mut dyn Events,
        out: RecvOutcome,
    ) {
        inner.stats.inbound_drops += out.inbound_drops;
        for som in out.deliveries {
            inner.stats.recv_cbs += 1;
            let message = Message::new(&self.rcv, som);
            events.recv(self.handle, &message);
        }
        if out.ack_needed && !self.ack_timer.is_armed() {
            self.ack_timer.arm(inner.now, inner.config.delayed_ack_timeout, 1);
        }
    }

    // === Data path ==========================================================

    /// Fragment and transmit an application message with the given TTL.
    ///
    /// On rejection the buffer is handed back in the error; once accepted,
    /// it returns through [Events::send_done], whatever the outcome.
    pub(crate) fn send(
        &mut self,
        inner: &mut InterfaceInner,
        socket: &mut dyn DatagramSocket,
        events: &mut dyn Events,
        payload: Vec<u8>,
        ttl: u32,
    ) -> Result<(), (Vec<u8>, Error)> {
        if self.state != State::Open {
            return Err((payload, Error::InvalidState));
        }
        if payload.is_empty() {
            return Err((payload, Error::InvalidData));
        }
        if self.window == 0 || (self.snd.nxt - self.snd.una) >= self.snd.segmax as i32 {
            return Err((payload, Error::Backpressure));
        }

        let len = payload.len();
        let max_dlen = self.snd.max_dlen;
        let fcnt = len.div_ceil(max_dlen);
        let last_len = len - max_dlen * (fcnt - 1);

        if fcnt > self.window as usize {
            net_debug!("conn {}: {} fragments exceed window {}", self.id, fcnt, self.window);
            return Err((payload, Error::Backpressure));
        }
        if fcnt > (self.snd.segmax - self.snd.pending) as usize {
            net_debug!(
                "conn {}: {} fragments exceed queue depth {}",
                self.id,
                fcnt,
                self.snd.segmax - self.snd.pending
            );
            return Err((payload, Error::Backpressure));
        }

        // A message that cannot beat its own expected transit time is not
        // worth putting on the wire; one that can pays its expected one-way
        // delay up front.
        let mut wire_ttl = ttl;
        if self.rtte.is_init() && ttl != TTL_INFINITE {
            let threshold = self.rtte.wire_time(len, fcnt as u32);
            if ttl + self.snd.dackt <= threshold {
                inner.stats.outbound_drops += 1;
                inner.stats.preflight_drops += 1;
                net_debug!(
                    "conn {}: dropping expired message (len={} ttl={} threshold={})",
                    self.id,
                    len,
                    ttl,
                    threshold
                );
                return Err((payload, Error::TtlExpired));
            }
            if ttl > threshold {
                wire_ttl = ttl - threshold;
            }
        }

        let som = self.snd.nxt;
        let now = inner.now;
        let mut msg = Some(payload);

        for i in 0..fcnt {
            let seg_len = if i == fcnt - 1 { last_len } else { max_dlen };
            let index = self.snd.stage_fragment(
                now,
                som + i,
                som,
                fcnt as u16,
                ttl,
                i * max_dlen,
                seg_len,
                msg.take(),
            );

            let mut fatal = false;
            let mut timeout = inner.config.initial_data_timeout;
            if !inner.traffic_jam {
                match self.emit_data(inner, socket, index, wire_ttl) {
                    Ok(()) | Err(SocketError::WouldBlock) => (),
                    Err(_) => fatal = true,
                }
                if self.rtte.is_init() {
                    timeout = self.rtte.retransmission_timeout();
                }
            }
            if inner.traffic_jam {
                // The fragment stays queued; the retransmit pass picks it up
                // as soon as the socket drains.
                timeout = 0;
            }

            self.snd.commit_fragment(now, index, timeout);
            self.persist_timer.cancel();

            if fatal {
                self.disconnect(inner, socket, events, Some(DisconnectReason::SocketError));
                return Ok(());
            }
        }

        Ok(())
    }

    /// The application is done with a received message; free its fragments
    /// and widen the advertised window.
    pub(crate) fn recv_ready(
        &mut self,
        inner: &mut InterfaceInner,
        som: SeqNumber,
    ) -> Result<(), Error> {
        match self.state {
            State::Open => {
                if self.rcv.release(som)? && !self.ack_timer.is_armed() {
                    self.ack_timer.arm(inner.now, inner.config.delayed_ack_timeout, 1);
                }
                Ok(())
            }
            State::Closed | State::CloseWait => {
                self.rcv.release_after_close(som);
                Ok(())
            }
            _ => Err(Error::InvalidState),
        }
    }

    // === Teardown ===========================================================

    /// Move the connection to CLOSE-WAIT. `None` means the local host asked;
    /// any other reason notifies the application immediately and flushes
    /// whatever was still in flight.
    pub(crate) fn disconnect(
        &mut self,
        inner: &mut InterfaceInner,
        socket: &mut dyn DatagramSocket,
        events: &mut dyn Events,
        reason: Option<DisconnectReason>,
    ) {
        if matches!(self.state, State::Closed | State::CloseWait) {
            return;
        }

        self.set_state(State::CloseWait);

        if reason != Some(DisconnectReason::RemoteReset) {
            inner.stats.rst_sends += 1;
            let _ = self.emit_ctl(inner, socket, FLAG_RST | FLAG_VER, self.snd.nxt, self.rcv.cur);
        }

        let mut timewait = 0;
        match reason {
            Some(reason) => {
                if self.snd.pending != 0 {
                    for (buf, _len) in self.snd.flush_all() {
                        inner.stats.send_cbs += 1;
                        events.send_done(self.handle, buf, Err(Error::Disconnecting));
                    }
                }
                timewait = inner.config.timewait;
                inner.stats.disconnect_cbs += 1;
                events.disconnected(self.handle, reason);
                self.notify_local_on_timer = false;
            }
            None => self.notify_local_on_timer = true,
        }

        self.connect_timer.arm(inner.now, timewait, DISCONNECT_RETRY);
    }

    // === Timers =============================================================

    /// Fire whatever timers have expired. Mirrors the per-connection part
    /// of the dispatch loop: the connect/disconnect timer excludes all
    /// others, and data retransmission stops as soon as the socket jams.
    pub(crate) fn dispatch_timers(
        &mut self,
        inner: &mut InterfaceInner,
        socket: &mut dyn DatagramSocket,
        events: &mut dyn Events,
    ) {
        let now = inner.now;

        if self.connect_timer.is_armed() {
            if self.connect_timer.is_expired(now) {
                match self.state {
                    State::Closed | State::CloseWait => {
                        self.disconnect_timer_fire(inner, events)
                    }
                    _ => self.connect_timer_fire(inner, socket, events),
                }
                if self.connect_timer.is_armed() {
                    self.connect_timer.restart(now);
                }
            }
            return;
        }

        if self.state != State::Open {
            return;
        }

        // The probe timer runs for the whole life of an open connection.
        if self.probe_timer.when() <= now {
            self.probe_fire(inner, socket, events);
            self.probe_timer.restart(now);
        }

        if self.ack_timer.is_expired(now) {
            self.ack_fire(inner, socket);
        }

        if self.persist_timer.is_expired(now) {
            self.persist_fire(inner, socket, events);
            self.persist_timer.restart(now);
        }

        if !inner.traffic_jam {
            for index in 0..self.snd.slot_count() {
                if self.state != State::Open {
                    break;
                }
                if self.snd.slot(index).rexmit.is_expired(now) {
                    self.retransmit_fire(inner, socket, events, index);
                    let slot = self.snd.slot_mut(index);
                    if slot.rexmit.is_armed() {
                        slot.rexmit.restart(now);
                    }
                    if inner.traffic_jam {
                        break;
                    }
                }
            }
        }
    }

    fn connect_timer_fire(
        &mut self,
        inner: &mut InterfaceInner,
        socket: &mut dyn DatagramSocket,
        events: &mut dyn Events,
    ) {
        let mut retrying = false;

        if self.connect_timer.retries() > 1 {
            match self.emit_syn(inner, socket) {
                Ok(()) => {
                    self.connect_timer.set_delta_ms(inner.config.connect_timeout);
                    retrying = true;
                }
                Err(SocketError::WouldBlock) => {
                    // Try again sooner than a full connect interval.
                    self.connect_timer.set_delta_ms(inner.config.connect_timeout >> 2);
                    retrying = true;
                }
                Err(_) => (),
            }
        }

        if retrying {
            self.connect_timer.dec_retries();
        } else {
            net_debug!("conn {}: connect retries exhausted", self.id);
            self.set_state(State::Closed);
            self.connect_timer.cancel();
            inner.stats.connect_cbs += 1;
            events.connected(self.handle, self.passive, &[], Err(Error::Timeout));
            inner.stats.rst_sends += 1;
            let _ = self.emit_ctl(inner, socket, FLAG_RST | FLAG_VER, self.snd.nxt, self.rcv.cur);
            // The host detects the failure and releases the record.
        }
    }

    fn disconnect_timer_fire(&mut self, inner: &mut InterfaceInner, events: &mut dyn Events) {
        self.set_state(State::Closed);

        if self.notify_local_on_timer {
            self.notify_local_on_timer = false;
            if self.snd.pending != 0 {
                for (buf, _len) in self.snd.flush_all() {
                    inner.stats.send_cbs += 1;
                    events.send_done(self.handle, buf, Err(Error::Disconnecting));
                }
            }
            inner.stats.disconnect_cbs += 1;
            events.disconnected(self.handle, DisconnectReason::Local);
        }

        if self.rcv.is_drained() {
            self.connect_timer.cancel();
            self.defunct = true;
        } else {
            // The application still holds received buffers; check back.
            self.connect_timer
                .arm(inner.now, DISCONNECT_RETRY_TIMEOUT, DISCONNECT_RETRY);
        }
    }

    fn probe_fire(
        &mut self,
        inner: &mut InterfaceInner,
        socket: &mut dyn DatagramSocket,
        events: &mut dyn Events,
    ) {
        let elapsed = (inner.now - self.last_seen).total_millis() as u32;

        // An idle link invalidates the round-trip estimate.
        if !self.snd.in_flight() {
            self.rtte.reset();
        }

        if elapsed > self.probe_timer.delta_ms() || elapsed >= inner.config.link_timeout {
            if self.probe_timer.retries() == 0 {
                net_debug!(
                    "conn {}: probe timeout, nothing heard for {}ms",
                    self.id,
                    elapsed
                );
                self.disconnect(inner, socket, events, Some(DisconnectReason::ProbeTimeout));
            } else {
                match self.emit_ctl(
                    inner,
                    socket,
                    FLAG_ACK | FLAG_VER | FLAG_NUL,
                    self.snd.nxt,
                    self.rcv.cur,
                ) {
                    Ok(()) => {
                        inner.stats.nul_sends += 1;
                        self.probe_timer.dec_retries();
                    }
                    Err(SocketError::WouldBlock) => (),
                    Err(_) => {
                        self.disconnect(inner, socket, events, Some(DisconnectReason::SocketError))
                    }
                }
            }
        }
    }

    fn ack_fire(&mut self, inner: &mut InterfaceInner, socket: &mut dyn DatagramSocket) {
        match self.emit_ctl(inner, socket, FLAG_ACK | FLAG_VER, self.snd.nxt, self.rcv.cur) {
            Err(SocketError::WouldBlock) => self.ack_timer.set_delta_ms(0),
            _ => (),
        }
    }

    fn persist_fire(
        &mut self,
        inner: &mut InterfaceInner,
        socket: &mut dyn DatagramSocket,
        events: &mut dyn Events,
    ) {
        if self.window >= self.min_send_window || self.snd.in_flight() {
            return;
        }

        if self.persist_timer.retries() > 1 {
            net_debug!(
                "conn {}: window {} below {}, probing",
                self.id,
                self.window,
                self.min_send_window
            );
            if self
                .emit_ctl(
                    inner,
                    socket,
                    FLAG_ACK | FLAG_VER | FLAG_NUL,
                    self.snd.nxt,
                    self.rcv.cur,
                )
                .is_ok()
            {
                inner.stats.nul_sends += 1;
                self.persist_timer.dec_retries();
                let total = inner.config.total_app_timeout / inner.config.persist_interval;
                let shift = total
                    .saturating_sub(self.persist_timer.retries() as u32)
                    .min(16);
                self.persist_timer
                    .set_delta_ms(inner.config.persist_interval << shift);
            }
        } else {
            net_debug!("conn {}: persist timeout (frozen window)", self.id);
            self.disconnect(inner, socket, events, Some(DisconnectReason::PersistTimeout));
        }
    }

    fn retransmit_fire(
        &mut self,
        inner: &mut InterfaceInner,
        socket: &mut dyn DatagramSocket,
        events: &mut dyn Events,
        index: usize,
    ) {
        let timeout = self.rtte.data_timeout(
            inner.config.total_data_retry_timeout,
            self.snd.segmax as u32,
            self.snd.segbmax as u32,
        );

        let (ttl, t_start, len, som, fcnt, retries) = {
            let slot = self.snd.slot_mut(index);
            slot.retransmits += 1;
            (
                slot.ttl,
                slot.t_start,
                slot.len,
                slot.som,
                slot.fcnt,
                slot.rexmit.retries(),
            )
        };

        let mut elapsed = (inner.now - t_start).total_millis() as u32;

        if elapsed >= timeout && retries as u32 > inner.config.min_data_retries {
            net_debug!(
                "conn {}: slot {} hit the retry time limit {}ms",
                self.id,
                index,
                timeout
            );
            self.snd.slot_mut(index).rexmit.cancel();
            self.disconnect(inner, socket, events, Some(DisconnectReason::Timeout));
            return;
        }

        if ttl != TTL_INFINITE {
            // Count the expected time on the wire against the TTL.
            if self.rtte.is_init() {
                elapsed += self.rtte.wire_time(len, 1);
            }
            if elapsed >= ttl {
                inner.stats.outbound_drops += 1;
                inner.stats.inflight_drops += 1;
                net_debug!("conn {}: message at {} expired in flight", self.id, som);
                if self.snd.expire_message(som, fcnt) && !self.ack_timer.is_armed() {
                    // Tell the peer so it can move past the dead message.
                    self.ack_timer.arm(inner.now, MIN_DELAYED_ACK_TIMEOUT, 1);
                }
                return;
            }
        } else {
            elapsed = 0;
        }

        match self.emit_data(inner, socket, index, ttl.wrapping_sub(elapsed)) {
            Ok(()) => {
                self.rtte.raise_backoff(retries as u32);
                let delta = if self.rtte.is_init() {
                    self.rtte.retransmission_timeout()
                } else {
                    inner.config.initial_data_timeout
                };
                let slot = self.snd.slot_mut(index);
                slot.rexmit.set_delta_ms(delta);
                slot.rexmit.set_retries(retries + 1);
            }
            Err(SocketError::WouldBlock) => {
                self.snd.slot_mut(index).rexmit.set_delta_ms(0);
            }
            Err(_) => {
                self.snd.slot_mut(index).rexmit.cancel();
                self.disconnect(inner, socket, events, Some(DisconnectReason::SocketError));
            }
        }
    }

    /// The earliest deadline of any timer on this connection, for the
    /// host's next-wakeup hint.
    pub(crate) fn poll_at(&self, traffic_jam: bool) -> Option<Instant> {
        if self.connect_timer.is_armed() {
            return self.connect_timer.poll_at();
        }
        if self.state != State::Open {
            return None;
        }

        let mut next = Some(self.probe_timer.when());
        let mut merge = |t: Option<Instant>| {
            next = match (next, t) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, None) => a,
                (None, b) => b,
            };
        };
        merge(self.ack_timer.poll_at());
        merge(self.persist_timer.poll_at());
        if !traffic_jam {
            for index in 0..self.snd.slot_count() {
                merge(self.snd.slot(index).rexmit.poll_at());
            }
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_config_valid_bounds() {
        // The maximum window is accepted, one past it is not.
        assert!(check_config_valid(256, 65000, 256, 131072));
        assert!(!check_config_valid(257, 65000, 257, 131072));
        // segbmax must clear the UDP and RDP header overhead.
        let overhead = UDP_HEADER_LEN + FIXED_HEADER_LEN + 4;
        assert!(!check_config_valid(16, overhead as u16, 16, 1));
        assert!(check_config_valid(16, (overhead + 1) as u16, 16, 16));
        // The largest application message must fit in the window:
        // max_dlen = 4440 - (8 + 36 + 4) = 4392 per segment.
        assert!(check_config_valid(16, 4440, 16, 16 * 4392));
        assert!(!check_config_valid(16, 4440, 16, 16 * 4392 + 1));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(format!("{}", State::SynRcvd), "SYN-RCVD");
        assert_eq!(format!("{}", State::CloseWait), "CLOSE-WAIT");
    }
}
