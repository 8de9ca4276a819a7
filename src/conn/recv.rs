use crate::config::EACK_MASK_WORDS;
use crate::iface::Error;
use crate::time::Instant;
use crate::wire::{SeqNumber, TTL_EXPIRED, TTL_INFINITE};

/// One received segment awaiting reassembly or release.
#[derive(Debug)]
pub(crate) struct RecvSlot {
    pub(crate) data: Vec<u8>,
    pub(crate) seq: SeqNumber,
    pub(crate) som: SeqNumber,
    pub(crate) fcnt: u16,
    pub(crate) ttl: u32,
    pub(crate) t_recv: Instant,
    pub(crate) in_use: bool,
    pub(crate) delivered: bool,
}

impl RecvSlot {
    fn empty() -> RecvSlot {
        RecvSlot {
            data: Vec::new(),
            seq: SeqNumber(0),
            som: SeqNumber(0),
            fcnt: 0,
            ttl: TTL_INFINITE,
            t_recv: Instant::ZERO,
            in_use: false,
            delivered: false,
        }
    }

    fn clear(&mut self) {
        self.data = Vec::new();
        self.in_use = false;
        self.delivered = false;
        self.ttl = TTL_INFINITE;
    }
}

/// Tracking of out-of-order received segments, kept in host order. Bit 31
/// of word 0 denotes sequence `cur + 2`; the mask is emitted to the peer
/// whenever it is non-empty.
#[derive(Debug)]
pub(crate) struct EackMask {
    words: heapless::Vec<u32, EACK_MASK_WORDS>,
    used: usize,
}

impl EackMask {
    fn new(fixed_words: usize) -> EackMask {
        let mut words = heapless::Vec::new();
        while words.len() < fixed_words {
            // Cannot fail: fixed_words <= EACK_MASK_WORDS by config check.
            let _ = words.push(0);
        }
        EackMask { words, used: 0 }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// The full fixed-size mask as put on the wire.
    pub(crate) fn words(&self) -> &[u32] {
        &self.words
    }

    /// Record sequence `cur + 1 + delta` as received out of order.
    fn add(&mut self, delta: u32) {
        let bin = ((delta - 1) / 32) as usize;
        let offset = 32 - (delta - (bin as u32) * 32);
        self.words[bin] |= 1u32 << offset;
        if self.used < bin + 1 {
            self.used = bin + 1;
        }
    }

    /// Slide the window left by one sequence number.
    fn shift(&mut self) {
        if self.used == 0 {
            return;
        }
        self.words[0] <<= 1;
        for i in 1..self.used {
            let carry = self.words[i] >> 31;
            self.words[i] <<= 1;
            self.words[i - 1] |= carry;
        }
        self.used = self
            .words
            .iter()
            .rposition(|w| *w != 0)
            .map_or(0, |i| i + 1);
    }
}

/// What segment intake did to the receive queue.
#[derive(Debug, Default)]
pub(crate) struct RecvOutcome {
    /// Start-of-message sequences of messages that became deliverable, in
    /// sequence order.
    pub(crate) deliveries: Vec<SeqNumber>,
    /// The window state changed; an ACK should be scheduled if none is.
    pub(crate) ack_needed: bool,
    /// Messages dropped on this side because their TTL ran out.
    pub(crate) inbound_drops: u32,
}

/// The receive side of a connection: a ring of `segmax` slots indexed by
/// `seq % segmax`, plus the EACK mask describing the out-of-order part.
#[derive(Debug)]
pub(crate) struct RecvQueue {
    /// Highest sequence received correctly and in order.
    pub(crate) cur: SeqNumber,
    /// Initial receive sequence (the peer's SYN sequence).
    pub(crate) irs: SeqNumber,
    /// Last sequence delivered to the application and released.
    pub(crate) lcs: SeqNumber,
    /// Our receive window capacity, advertised in our SYN.
    pub(crate) segmax: u16,
    /// Our per-segment byte capacity, advertised in our SYN.
    pub(crate) segbmax: u16,
    pub(crate) eack: EackMask,
    slots: Vec<RecvSlot>,
}

impl RecvQueue {
    pub(crate) fn new() -> RecvQueue {
        RecvQueue {
            cur: SeqNumber(0),
            irs: SeqNumber(0),
            lcs: SeqNumber(0),
            segmax: 0,
            segbmax: 0,
            eack: EackMask::new(0),
            slots: Vec::new(),
        }
    }

    /// Allocate the slot ring for the window we are about to advertise.
    pub(crate) fn init(&mut self, segmax: u16, segbmax: u16) {
        self.segmax = segmax;
        self.segbmax = segbmax;
        self.eack = EackMask::new((segmax as usize + 31) / 32);
        self.slots = (0..segmax).map(|_| RecvSlot::empty()).collect();
    }

    /// Adopt the peer's initial sequence from its SYN.
    pub(crate) fn set_initial(&mut self, irs: SeqNumber) {
        self.cur = irs;
        self.irs = irs;
        self.lcs = irs;
    }

    /// Final initialization once the connection reaches OPEN.
    pub(crate) fn post_init(&mut self) {
        self.lcs = self.cur;
        for slot in self.slots.iter_mut() {
            slot.seq = self.irs;
        }
    }

    pub(crate) fn index_of(&self, seq: SeqNumber) -> usize {
        seq.index(self.segmax)
    }

    pub(crate) fn slot(&self, index: usize) -> &RecvSlot {
        &self.slots[index]
    }

    /// Whether every delivered buffer has been released by the application.
    pub(crate) fn is_drained(&self) -> bool {
        !self.slots.iter().any(|slot| slot.delivered)
    }

    /// File a payload-bearing segment into its slot.
    ///
    /// An exact duplicate is dropped (the caller still acknowledges it); a
    /// slot collision means the peer overran our window.
    pub(crate) fn store(
        &mut self,
        now: Instant,
        seq: SeqNumber,
        som: SeqNumber,
        fcnt: u16,
        ttl: u32,
        payload: &[u8],
    ) -> Result<RecvOutcome, Error> {
        let index = self.index_of(seq);
        if self.slots[index].seq == seq {
            net_debug!("duplicate segment {}, acknowledge", seq);
            return Ok(RecvOutcome::default());
        }
        if self.slots[index].in_use {
            net_debug!("segment {} overwrites unreleased slot", seq);
            return Err(Error::InvalidResponse);
        }

        let slot = &mut self.slots[index];
        slot.data = payload.to_vec();
        slot.seq = seq;
        slot.som = som;
        slot.fcnt = fcnt;
        slot.ttl = ttl;
        slot.t_recv = now;
        slot.in_use = true;
        slot.delivered = false;

        if seq == self.cur + 1 {
            Ok(self.advance(now, seq))
        } else {
            self.eack.add((seq - (self.cur + 1)) as u32);
            Ok(RecvOutcome::default())
        }
    }

    /// Walk forward from `start_seq` over consecutive in-use slots,
    /// delivering completed messages, discarding expired ones, and
    /// advancing `cur`.
    pub(crate) fn advance(&mut self, now: Instant, start_seq: SeqNumber) -> RecvOutcome {
        let mut out = RecvOutcome::default();
        let mut seq = start_seq;
        let mut expiring = false;
        let mut exp_som = SeqNumber(0);
        let mut exp_fcnt = 0u16;

        loop {
            self.eack.shift();
            let index = self.index_of(seq);

            if expiring {
                // Walking out the rest of an expired message; release once
                // its last fragment position is reached.
                if seq == exp_som + (exp_fcnt as usize - 1) {
                    let _ = self.release_buffers(exp_som, exp_fcnt, true);
                    expiring = false;
                }
            } else {
                let (ttl, t_recv, som, fcnt) = {
                    let slot = &self.slots[index];
                    (slot.ttl, slot.t_recv, slot.som, slot.fcnt)
                };
                let elapsed = (now - t_recv).total_millis() as u32;

                if ttl != TTL_INFINITE && elapsed >= ttl {
                    net_debug!("expired fragment {} (start {}, fcnt {})", seq, som, fcnt);
                    out.inbound_drops += 1;
                    // The whole message dies with it, received or not.
                    let mut mark = som;
                    for _ in 0..fcnt {
                        let index = self.index_of(mark);
                        self.slots[index].ttl = TTL_EXPIRED;
                        mark += 1;
                    }
                    if seq == som + (fcnt as usize - 1) {
                        let _ = self.release_buffers(som, fcnt, true);
                    } else {
                        expiring = true;
                        exp_som = som;
                        exp_fcnt = fcnt;
                    }
                } else if seq == som + (fcnt as usize - 1) {
                    // Last fragment in order: the message is complete.
                    out.deliveries.push(som);
                    let mut mark = som;
                    for _ in 0..fcnt {
                        let index = self.index_of(mark);
                        self.slots[index].delivered = true;
                        mark += 1;
                    }
                }
            }

            seq += 1;
            let next = &self.slots[self.index_of(seq)];
            if !((next.in_use && !next.delivered) || expiring) {
                break;
            }
        }

        if self.cur < seq - 1 {
            self.cur = seq - 1;
        }
        out.ack_needed = true;
        out
    }

    /// The peer declared everything below `acknxt` expired: drop the
    /// affected receive state and deliver whatever became complete behind
    /// it.
    pub(crate) fn flush_expired(&mut self, now: Instant, acknxt: SeqNumber) -> RecvOutcome {
        let mut out = RecvOutcome::default();
        let current = &self.slots[self.index_of(self.cur)];

        let (start_seq, mut delta) =
            if !current.in_use || current.seq == current.som + (current.fcnt as usize - 1) {
                // The in-order prefix ends on a message boundary.
                if self.eack.is_empty() && self.lcs == self.cur {
                    // Nothing out of order and nothing undelivered: the
                    // counters simply jump forward.
                    self.lcs = acknxt - 1;
                    self.cur = acknxt - 1;
                    out.ack_needed = true;
                    return out;
                }
                (self.cur + 1, 0u32)
            } else {
                // A message was partially received; expire it from its
                // first fragment.
                let som = current.som;
                (som, ((self.cur + 1) - som) as u32)
            };

        // Mark everything below acknxt as expired, sliding the EACK mask
        // for positions past the in-order prefix.
        let mut seq = start_seq;
        loop {
            let index = self.index_of(seq);
            self.slots[index].ttl = TTL_EXPIRED;
            if delta == 0 {
                self.eack.shift();
            } else {
                delta -= 1;
            }
            seq += 1;
            if seq >= acknxt {
                break;
            }
        }

        if self.cur < acknxt - 1 {
            self.cur = acknxt - 1;
        }

        let _ = self.release_buffers(start_seq, (seq - start_seq) as u16, true);

        // Deliver in-order complete messages that were waiting behind the
        // expired range.
        let next = &self.slots[self.index_of(seq)];
        if next.in_use && !next.delivered {
            let nested = self.advance(now, seq);
            out.deliveries = nested.deliveries;
        }

        out.ack_needed = true;
        out
    }

    /// Release the message starting at `som` back to the queue, together
    /// with any run of expired segments directly behind it. Returns whether
    /// an ACK should be scheduled to advertise the wider window.
    pub(crate) fn release(&mut self, som: SeqNumber) -> Result<bool, Error> {
        let slot = &self.slots[self.index_of(som)];
        if !slot.in_use || slot.seq != som {
            return Err(Error::InvalidState);
        }
        let fcnt = slot.fcnt;
        self.release_buffers(som, fcnt, false)
    }

    fn release_buffers(&mut self, seq: SeqNumber, fcnt: u16, expired: bool) -> Result<bool, Error> {
        if fcnt == 0 {
            return Err(Error::InvalidData);
        }

        if seq != self.lcs + 1 {
            if expired {
                // Not at the head of the queue yet; the release happens
                // when the application returns the earlier messages.
                return Ok(false);
            }
            net_debug!("released message {} is not first in queue", seq);
            return Err(Error::InvalidState);
        }

        if !expired && self.slots[self.index_of(seq)].seq != seq {
            return Err(Error::InvalidState);
        }

        let mut count = fcnt;
        let mut at = seq;
        loop {
            let index = self.index_of(at);
            self.slots[index].clear();
            self.lcs += 1;
            if count != 0 {
                count -= 1;
            }
            at += 1;

            let next = &self.slots[self.index_of(at)];
            if !(count != 0 || (next.ttl == TTL_EXPIRED && !next.delivered)) {
                break;
            }
        }

        // A partially received message can expire before it was ever
        // assembled, leaving CUR behind LCS.
        if self.cur < self.lcs {
            self.cur = self.lcs;
        }

        Ok(true)
    }

    /// Free the remains of a delivered message after the connection went
    /// down. No ordering obligations remain at that point.
    pub(crate) fn release_after_close(&mut self, som: SeqNumber) {
        let fcnt = self.slots[self.index_of(som)].fcnt;
        let mut seq = som;
        for _ in 0..fcnt {
            let index = self.index_of(seq);
            self.slots[index].clear();
            let next = &self.slots[self.index_of(seq + 1)];
            if !next.in_use || next.som != som {
                break;
            }
            seq += 1;
        }
    }
}

/// A complete received message, presented as its run of fragments.
///
/// The fragment buffers stay owned by the engine; the application borrows
/// them for the duration of the [recv](crate::iface::Events::recv) callback
/// and until it calls [recv_ready](crate::iface::Interface::recv_ready)
/// with the message's start sequence.
#[derive(Debug)]
pub struct Message<'a> {
    queue: &'a RecvQueue,
    som: SeqNumber,
}

impl<'a> Message<'a> {
    pub(crate) fn new(queue: &'a RecvQueue, som: SeqNumber) -> Message<'a> {
        Message { queue, som }
    }

    /// The start-of-message sequence identifying this message. Pass it to
    /// [recv_ready](crate::iface::Interface::recv_ready) to release the
    /// buffers.
    pub fn start(&self) -> SeqNumber {
        self.som
    }

    /// Number of fragments comprising the message.
    pub fn fragment_count(&self) -> u16 {
        self.queue.slot(self.queue.index_of(self.som)).fcnt
    }

    /// Total payload length in bytes.
    pub fn len(&self) -> usize {
        self.fragments().map(|f| f.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The fragment payloads, in order.
    pub fn fragments(&self) -> impl Iterator<Item = &'a [u8]> + '_ {
        let queue = self.queue;
        let som = self.som;
        let fcnt = self.fragment_count();
        (0..fcnt as usize).map(move |i| &queue.slot(queue.index_of(som + i)).data[..])
    }

    /// The message contents, gathered into one buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.len());
        for fragment in self.fragments() {
            buf.extend_from_slice(fragment);
        }
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> RecvQueue {
        let mut rcv = RecvQueue::new();
        rcv.init(8, 1500);
        rcv.set_initial(SeqNumber(5000));
        rcv.post_init();
        rcv
    }

    #[test]
    fn test_store_in_order_delivers() {
        let mut rcv = queue();
        let now = Instant::from_millis(0);
        let out = rcv
            .store(now, SeqNumber(5001), SeqNumber(5001), 1, TTL_INFINITE, b"ab")
            .unwrap();
        assert_eq!(out.deliveries, vec![SeqNumber(5001)]);
        assert!(out.ack_needed);
        assert_eq!(rcv.cur, SeqNumber(5001));
        assert!(rcv.slot(rcv.index_of(SeqNumber(5001))).delivered);

        let msg = Message::new(&rcv, SeqNumber(5001));
        assert_eq!(msg.to_vec(), b"ab");
    }

    #[test]
    fn test_store_out_of_order_sets_mask() {
        let mut rcv = queue();
        let now = Instant::from_millis(0);
        let out = rcv
            .store(now, SeqNumber(5003), SeqNumber(5003), 1, TTL_INFINITE, b"x")
            .unwrap();
        assert!(out.deliveries.is_empty());
        // 5003 = cur + 3 = (cur + 2) + 1, so bit 30 of word 0.
        assert_eq!(rcv.eack.words()[0], 0x4000_0000);
        assert_eq!(rcv.cur, SeqNumber(5000));
    }

    #[test]
    fn test_gap_fill_delivers_run_and_clears_mask() {
        let mut rcv = queue();
        let now = Instant::from_millis(0);
        rcv.store(now, SeqNumber(5002), SeqNumber(5002), 1, TTL_INFINITE, b"b")
            .unwrap();
        assert_eq!(rcv.eack.words()[0], 0x8000_0000);

        let out = rcv
            .store(now, SeqNumber(5001), SeqNumber(5001), 1, TTL_INFINITE, b"a")
            .unwrap();
        assert_eq!(out.deliveries, vec![SeqNumber(5001), SeqNumber(5002)]);
        assert_eq!(rcv.cur, SeqNumber(5002));
        assert!(rcv.eack.is_empty());
    }

    #[test]
    fn test_fragmented_message_delivers_once_complete() {
        let mut rcv = queue();
        let now = Instant::from_millis(0);
        let som = SeqNumber(5001);
        let out = rcv.store(now, SeqNumber(5001), som, 3, TTL_INFINITE, b"aa").unwrap();
        assert!(out.deliveries.is_empty());
        let out = rcv.store(now, SeqNumber(5002), som, 3, TTL_INFINITE, b"bb").unwrap();
        assert!(out.deliveries.is_empty());
        let out = rcv.store(now, SeqNumber(5003), som, 3, TTL_INFINITE, b"cc").unwrap();
        assert_eq!(out.deliveries, vec![som]);

        let msg = Message::new(&rcv, som);
        assert_eq!(msg.fragment_count(), 3);
        assert_eq!(msg.to_vec(), b"aabbcc");
    }

    #[test]
    fn test_duplicate_is_dropped_quietly() {
        let mut rcv = queue();
        let now = Instant::from_millis(0);
        rcv.store(now, SeqNumber(5001), SeqNumber(5001), 1, TTL_INFINITE, b"a")
            .unwrap();
        let out = rcv
            .store(now, SeqNumber(5001), SeqNumber(5001), 1, TTL_INFINITE, b"a")
            .unwrap();
        assert!(out.deliveries.is_empty());
    }

    #[test]
    fn test_release_advances_lcs_and_window() {
        let mut rcv = queue();
        let now = Instant::from_millis(0);
        rcv.store(now, SeqNumber(5001), SeqNumber(5001), 1, TTL_INFINITE, b"a")
            .unwrap();
        assert_eq!(rcv.lcs, SeqNumber(5000));
        assert!(rcv.release(SeqNumber(5001)).unwrap());
        assert_eq!(rcv.lcs, SeqNumber(5001));
        assert!(rcv.is_drained());
        // Out-of-order release is refused.
        rcv.store(now, SeqNumber(5002), SeqNumber(5002), 1, TTL_INFINITE, b"b")
            .unwrap();
        rcv.store(now, SeqNumber(5003), SeqNumber(5003), 1, TTL_INFINITE, b"c")
            .unwrap();
        assert_eq!(rcv.release(SeqNumber(5003)), Err(Error::InvalidState));
    }

    #[test]
    fn test_receiver_side_ttl_expiry_drops_message() {
        let mut rcv = queue();
        let som = SeqNumber(5001);
        // The tail fragments wait out of order while the head is missing.
        rcv.store(Instant::from_millis(0), SeqNumber(5002), som, 3, 40, b"bb")
            .unwrap();
        rcv.store(Instant::from_millis(0), SeqNumber(5003), som, 3, 40, b"cc")
            .unwrap();
        // By the time the head shows up, the tail has outlived its TTL:
        // the whole message is dropped, never delivered.
        let out = rcv
            .store(Instant::from_millis(100), SeqNumber(5001), som, 3, 40, b"aa")
            .unwrap();
        assert!(out.deliveries.is_empty());
        assert_eq!(rcv.lcs, SeqNumber(5003));
        assert_eq!(rcv.cur, SeqNumber(5003));
        assert!(rcv.is_drained());
    }

    #[test]
    fn test_flush_expired_jumps_counters() {
        let mut rcv = queue();
        let out = rcv.flush_expired(Instant::from_millis(0), SeqNumber(5004));
        assert!(out.deliveries.is_empty());
        assert_eq!(rcv.cur, SeqNumber(5003));
        assert_eq!(rcv.lcs, SeqNumber(5003));
    }

    #[test]
    fn test_flush_expired_releases_stragglers_and_delivers() {
        let mut rcv = queue();
        let now = Instant::from_millis(0);
        // 5001 never arrives; 5002 waits out of order.
        rcv.store(now, SeqNumber(5002), SeqNumber(5002), 1, TTL_INFINITE, b"y")
            .unwrap();
        // Peer expires 5001 (acknxt = 5002): 5002 becomes deliverable.
        let out = rcv.flush_expired(now, SeqNumber(5002));
        assert_eq!(out.deliveries, vec![SeqNumber(5002)]);
        assert_eq!(rcv.cur, SeqNumber(5002));
        assert_eq!(rcv.lcs, SeqNumber(5001));
    }
}
