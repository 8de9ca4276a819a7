use crate::iface::Error;
use crate::time::Instant;
use crate::wire::{SeqNumber, TTL_EXPIRED, TTL_INFINITE};

use super::rtte::RttEstimator;
use super::timer::Timer;

/// One in-flight segment. The message buffer rides in the slot of the
/// first fragment; the other fragments reference ranges of it.
#[derive(Debug)]
pub(crate) struct SendSlot {
    pub(crate) seq: SeqNumber,
    pub(crate) som: SeqNumber,
    pub(crate) fcnt: u16,
    pub(crate) offset: usize,
    pub(crate) len: usize,
    pub(crate) msg: Option<Vec<u8>>,
    pub(crate) ttl: u32,
    pub(crate) t_start: Instant,
    pub(crate) in_use: bool,
    pub(crate) rexmit: Timer,
    pub(crate) retransmits: u16,
    pub(crate) fast_rt: u16,
}

impl SendSlot {
    fn empty() -> SendSlot {
        SendSlot {
            seq: SeqNumber(0),
            som: SeqNumber(0),
            fcnt: 0,
            offset: 0,
            len: 0,
            msg: None,
            ttl: TTL_INFINITE,
            t_start: Instant::ZERO,
            in_use: false,
            rexmit: Timer::idle(),
            retransmits: 0,
            fast_rt: 0,
        }
    }
}

/// What a cumulative acknowledgment did to the send queue.
#[derive(Debug, Default)]
pub(crate) struct AckOutcome {
    /// Fully consumed messages, in submission order: the original buffer,
    /// its total length, and whether it expired in flight.
    pub(crate) completed: Vec<(Vec<u8>, usize, bool)>,
    /// `snd.UNA` was advanced past expired segments; the peer should be
    /// told without waiting for data to piggyback on.
    pub(crate) need_unsolicited_ack: bool,
}

/// The send side of a connection: a ring of `segmax` slots indexed by
/// `seq % segmax`.
#[derive(Debug)]
pub(crate) struct SendQueue {
    /// Initial send sequence, as carried in our SYN.
    pub(crate) iss: SeqNumber,
    /// Next sequence to be sent.
    pub(crate) nxt: SeqNumber,
    /// Oldest unacknowledged sequence.
    pub(crate) una: SeqNumber,
    /// Last sequence the peer has consumed and released.
    pub(crate) lcs: SeqNumber,
    /// Peer's receive window capacity in segments.
    pub(crate) segmax: u16,
    /// Peer's per-segment byte capacity.
    pub(crate) segbmax: u16,
    /// Peer's delayed-ack timeout, for sender-side TTL accounting.
    pub(crate) dackt: u32,
    /// Largest payload that fits one segment towards this peer.
    pub(crate) max_dlen: usize,
    /// Number of in-use slots.
    pub(crate) pending: u16,
    slots: Vec<SendSlot>,
}

impl SendQueue {
    pub(crate) fn new(iss: SeqNumber) -> SendQueue {
        SendQueue {
            iss,
            nxt: iss + 1,
            una: iss,
            lcs: iss,
            segmax: 0,
            segbmax: 0,
            dackt: 0,
            max_dlen: 0,
            pending: 0,
            slots: Vec::new(),
        }
    }

    /// Adopt the peer's connection parameters from its SYN.
    pub(crate) fn adopt_peer(&mut self, segmax: u16, segbmax: u16, dackt: u32) {
        self.segmax = segmax;
        self.segbmax = segbmax;
        self.dackt = dackt;
    }

    /// Allocate the slot ring once the peer's window is known.
    pub(crate) fn init_ring(&mut self, max_dlen: usize) {
        self.max_dlen = max_dlen;
        self.slots = (0..self.segmax).map(|_| SendSlot::empty()).collect();
    }

    pub(crate) fn index_of(&self, seq: SeqNumber) -> usize {
        seq.index(self.segmax)
    }

    pub(crate) fn slot(&self, index: usize) -> &SendSlot {
        &self.slots[index]
    }

    pub(crate) fn slot_mut(&mut self, index: usize) -> &mut SendSlot {
        &mut self.slots[index]
    }

    pub(crate) fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// The payload bytes of the fragment in `index`, sliced out of the
    /// message buffer held by its first fragment.
    pub(crate) fn fragment_payload(&self, index: usize) -> &[u8] {
        let slot = &self.slots[index];
        let head = &self.slots[slot.som.index(self.segmax)];
        match head.msg.as_ref() {
            Some(msg) => &msg[slot.offset..slot.offset + slot.len],
            None => &[],
        }
    }

    /// Whether any sent segment is awaiting acknowledgment with a
    /// retransmit scheduled.
    pub(crate) fn in_flight(&self) -> bool {
        (self.una + 1) != self.nxt && self.una != self.nxt
    }

    /// Write one outgoing fragment into its slot. The slot is not counted
    /// as pending until [commit_fragment](Self::commit_fragment).
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn stage_fragment(
        &mut self,
        now: Instant,
        seq: SeqNumber,
        som: SeqNumber,
        fcnt: u16,
        ttl: u32,
        offset: usize,
        len: usize,
        msg: Option<Vec<u8>>,
    ) -> usize {
        let index = self.index_of(seq);
        let slot = &mut self.slots[index];
        slot.seq = seq;
        slot.som = som;
        slot.fcnt = fcnt;
        slot.offset = offset;
        slot.len = len;
        slot.ttl = ttl;
        slot.t_start = now;
        slot.retransmits = 0;
        slot.fast_rt = 0;
        if msg.is_some() {
            slot.msg = msg;
        }
        index
    }

    /// Take ownership of the staged fragment: arm its retransmit timer and
    /// advance `nxt` over it.
    pub(crate) fn commit_fragment(&mut self, now: Instant, index: usize, timeout_ms: u32) {
        let slot = &mut self.slots[index];
        slot.in_use = true;
        slot.rexmit.arm(now, timeout_ms, 1);
        self.pending += 1;
        self.nxt += 1;
    }

    /// Process a cumulative acknowledgment `(ack, lcs)` from the peer.
    ///
    /// Feeds clean round trips into the RTT estimator, cancels retransmit
    /// timers on acknowledged slots, surfaces fully consumed messages, and
    /// advances `una` over any trailing run of expired segments.
    ///
    /// Completions gathered before a malformed update is noticed are still
    /// returned; their buffers must reach the application either way.
    pub(crate) fn process_ack(
        &mut self,
        now: Instant,
        ack: SeqNumber,
        peer_lcs: SeqNumber,
        rtte: &mut RttEstimator,
    ) -> (AckOutcome, Result<(), Error>) {
        let mut out = AckOutcome::default();

        if self.pending == 0 {
            self.lcs = peer_lcs;
            return (out, Ok(()));
        }

        // Only first transmissions produce meaningful round trips.
        let slot = &self.slots[self.index_of(ack)];
        if slot.retransmits == 0 && slot.rexmit.is_armed() {
            let rtt = (now - slot.t_start).total_millis() as u32;
            rtte.sample(rtt, slot.len);
        }

        let count = ack - self.lcs;
        if count < 0 {
            net_debug!("ack {} behind lcs {}", ack, self.lcs);
            return (out, Err(Error::InvalidResponse));
        }

        let mut seq = self.lcs + 1;
        for _ in 0..count {
            let index = self.index_of(seq);
            let (in_use, slot_seq) = {
                let slot = &self.slots[index];
                (slot.in_use, slot.seq)
            };
            if !in_use || ack < slot_seq {
                net_debug!(
                    "bad ack update: {} slot {} ack {}",
                    if in_use { "full" } else { "empty" },
                    slot_seq,
                    ack
                );
                return (out, Err(Error::InvalidResponse));
            }

            let slot = &mut self.slots[index];
            slot.rexmit.cancel();

            // A message completes when its last fragment has been both
            // acknowledged and consumed.
            if slot.seq <= peer_lcs && slot.seq == slot.som + (slot.fcnt as usize - 1) {
                let som = slot.som;
                let fcnt = slot.fcnt;
                let expired = slot.ttl == TTL_EXPIRED;
                let (msg, total) = self.flush_message(som, fcnt);
                out.completed.push((msg, total, expired));
            }

            seq += 1;
        }

        // Advance una past segments that expired right after the acked run.
        loop {
            let slot = &self.slots[self.index_of(seq)];
            if slot.in_use && slot.ttl == TTL_EXPIRED {
                self.una = slot.seq + 1;
                out.need_unsolicited_ack = true;
                seq += 1;
            } else {
                break;
            }
        }

        self.lcs = peer_lcs;
        (out, Ok(()))
    }

    /// Release every slot of the message starting at `som`, returning the
    /// original buffer and the total payload length.
    pub(crate) fn flush_message(&mut self, som: SeqNumber, fcnt: u16) -> (Vec<u8>, usize) {
        let mut total = 0;
        let mut msg = None;
        let mut seq = som;
        for _ in 0..fcnt {
            let index = self.index_of(seq);
            let slot = &mut self.slots[index];
            slot.rexmit.cancel();
            slot.in_use = false;
            slot.fast_rt = 0;
            slot.retransmits = 0;
            total += slot.len;
            if slot.msg.is_some() {
                msg = slot.msg.take();
            }
            self.pending -= 1;
            seq += 1;
        }
        (msg.unwrap_or_default(), total)
    }

    /// Flush every pending message, in submission order. Used when the
    /// connection goes down and the application must get its buffers back.
    pub(crate) fn flush_all(&mut self) -> Vec<(Vec<u8>, usize)> {
        let mut flushed = Vec::new();
        let mut seq = self.lcs + 1;
        for _ in 0..self.slot_count() {
            let index = self.index_of(seq);
            let slot = &self.slots[index];
            if slot.in_use && slot.seq == slot.som {
                let (som, fcnt) = (slot.som, slot.fcnt);
                flushed.push(self.flush_message(som, fcnt));
            }
            seq += 1;
        }
        flushed
    }

    /// Mark the whole message containing an expired fragment as dead and
    /// stop retransmitting it. Returns true when `una` moved past the
    /// message, which warrants an unsolicited ACK.
    pub(crate) fn expire_message(&mut self, som: SeqNumber, fcnt: u16) -> bool {
        let mut seq = som;
        for _ in 0..fcnt {
            let index = self.index_of(seq);
            let slot = &mut self.slots[index];
            slot.rexmit.cancel();
            slot.ttl = TTL_EXPIRED;
            seq += 1;
        }

        if som <= self.una && self.una < som + fcnt as usize {
            // UNA may catch up with NXT when the expired message was the
            // last one sent.
            self.una = som + fcnt as usize;
            true
        } else {
            false
        }
    }

    /// Process the out-of-order acknowledgment mask accompanying `ack`.
    /// Bit 31 of word 0 denotes `ack + 2`.
    pub(crate) fn process_eack(
        &mut self,
        now: Instant,
        ack: SeqNumber,
        words: &[u32],
        fast_rt_threshold: u32,
    ) {
        let first_unacked = self.index_of(ack + 1);
        self.fast_retransmit(now, first_unacked, fast_rt_threshold);

        for (i, &word) in words.iter().enumerate() {
            let mut word = word;
            let mut seq = ack + 2 + i * 32;
            while word != 0 {
                let index = self.index_of(seq);
                if word & 0x8000_0000 != 0 {
                    self.slots[index].rexmit.cancel();
                } else if i < 1 {
                    // Fill gaps in the first 32-segment window eagerly; the
                    // rest are caught as the window moves.
                    self.fast_retransmit(now, index, fast_rt_threshold);
                }
                word <<= 1;
                seq += 1;
            }
        }
    }

    fn fast_retransmit(&mut self, now: Instant, index: usize, threshold: u32) {
        let slot = &mut self.slots[index];
        if slot.fast_rt as u32 == threshold && slot.retransmits == 0 {
            net_debug!("fast retransmit of {}", slot.seq);
            slot.rexmit.expire_now(now);
        }
        slot.fast_rt += 1;
    }
}
