use byteorder::{ByteOrder, NetworkEndian};
use core::{cmp, fmt, ops};

use super::{Error, Result};

/// Control flag. Request to open a connection. Must be a separate segment.
pub const FLAG_SYN: u8 = 0x01;
/// Control flag. Acknowledge a segment. May accompany data.
pub const FLAG_ACK: u8 = 0x02;
/// Control flag. Non-cumulative (extended) acknowledgement.
pub const FLAG_EACK: u8 = 0x04;
/// Control flag. Reset this connection. Must be a separate segment.
pub const FLAG_RST: u8 = 0x08;
/// Control flag. Null (zero data length) segment, used for probing.
pub const FLAG_NUL: u8 = 0x10;
/// Bits 6-7 of the flags byte. The current protocol version is 1.
pub const FLAG_VER: u8 = 0x40;
/// Mask extracting the version bits from the flags byte.
pub const VERSION_BITS: u8 = 0xC0;
/// Sequenced delivery mode option. In-order delivery is always in force.
pub const FLAG_SDM: u16 = 0x0001;

/// Reserved TTL value indicating that a message never expires.
pub const TTL_INFINITE: u32 = 0;
/// Reserved TTL value marking expired data. Never put on the wire.
pub const TTL_EXPIRED: u32 = 0xffff_ffff;
/// Largest TTL value a message may carry.
pub const TTL_MAX: u32 = TTL_EXPIRED - 1;

/// Length of the fixed part of the header (sans EACK mask).
pub const FIXED_HEADER_LEN: usize = 36;
/// Length of a SYN segment header. SYN payload follows immediately.
pub const SYN_HEADER_LEN: usize = 28;

/// A sequence number of a segment, evaluated modulo 2<sup>32</sup>.
///
/// Sequence numbers compare with signed wraparound semantics: `a < b` iff
/// `(a - b) as i32` is negative. The comparison is meaningful only for
/// numbers at most half the sequence space apart, which the window bounds
/// guarantee.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy, Hash)]
pub struct SeqNumber(pub u32);

impl fmt::Display for SeqNumber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PartialOrd for SeqNumber {
    fn partial_cmp(&self, other: &SeqNumber) -> Option<cmp::Ordering> {
        (self.0.wrapping_sub(other.0) as i32).partial_cmp(&0)
    }
}

impl ops::Add<usize> for SeqNumber {
    type Output = SeqNumber;

    fn add(self, rhs: usize) -> SeqNumber {
        SeqNumber(self.0.wrapping_add(rhs as u32))
    }
}

impl ops::Sub<usize> for SeqNumber {
    type Output = SeqNumber;

    fn sub(self, rhs: usize) -> SeqNumber {
        SeqNumber(self.0.wrapping_sub(rhs as u32))
    }
}

impl ops::AddAssign<usize> for SeqNumber {
    fn add_assign(&mut self, rhs: usize) {
        *self = *self + rhs;
    }
}

impl ops::Sub for SeqNumber {
    type Output = i32;

    fn sub(self, rhs: SeqNumber) -> i32 {
        self.0.wrapping_sub(rhs.0) as i32
    }
}

impl SeqNumber {
    /// The slot index this sequence number occupies in a ring of `size` slots.
    pub fn index(&self, size: u16) -> usize {
        (self.0 % size as u32) as usize
    }
}

/// Whether `p` lies in `[beg, beg + size)`, accounting for wraparound.
pub fn in_window(beg: SeqNumber, size: u32, p: SeqNumber) -> bool {
    let off = p - beg;
    off >= 0 && (off as u32) < size
}

/// A read/write wrapper around an RDP segment buffer.
///
/// Two segment formats share the leading byte layout: the fixed header
/// (optionally followed by an EACK bitmask) carried by every data, ACK and
/// NUL segment, and the shorter SYN header carried only during connection
/// establishment. The [syn](#method.syn) flag selects which accessors are
/// meaningful beyond the first 16 octets.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Packet<T: AsRef<[u8]>> {
    buffer: T,
}

mod field {
    #![allow(non_snake_case)]

    use crate::wire::field::*;

    pub const FLAGS: usize = 0;
    pub const HLEN: usize = 1;
    pub const SRC: Field = 2..4;
    pub const DST: Field = 4..6;
    pub const DLEN: Field = 6..8;
    pub const SEQ: Field = 8..12;
    pub const ACK: Field = 12..16;
    pub const TTL: Field = 16..20;
    pub const LCS: Field = 20..24;
    pub const ACKNXT: Field = 24..28;
    pub const SOM: Field = 28..32;
    pub const FCNT: Field = 32..34;
    pub const RSRV: Field = 34..36;

    // A SYN header shares the first 16 octets with the fixed header and
    // continues with the connection parameters.
    pub const SEGMAX: Field = 16..18;
    pub const SEGBMAX: Field = 18..20;
    pub const DACKT: Field = 20..24;
    pub const OPTIONS: Field = 24..26;
    pub const RESERVE: Field = 26..28;

    pub const fn PAYLOAD(header_len: usize) -> Rest {
        header_len..
    }
}

impl<T: AsRef<[u8]>> Packet<T> {
    /// Imbue a raw octet buffer with RDP segment structure.
    pub const fn new_unchecked(buffer: T) -> Packet<T> {
        Packet { buffer }
    }

    /// Shorthand for a combination of [new_unchecked] and [check_len].
    ///
    /// [new_unchecked]: #method.new_unchecked
    /// [check_len]: #method.check_len
    pub fn new_checked(buffer: T) -> Result<Packet<T>> {
        let packet = Self::new_unchecked(buffer);
        packet.check_len()?;
        Ok(packet)
    }

    /// Ensure that no accessor method will panic if called.
    /// Returns `Err(Error)` if the buffer is shorter than the base header
    /// for the segment kind, or if the header length field points outside
    /// the buffer or inside the base header.
    pub fn check_len(&self) -> Result<()> {
        let len = self.buffer.as_ref().len();
        if len < 1 {
            return Err(Error);
        }
        let base = if self.syn() {
            SYN_HEADER_LEN
        } else {
            FIXED_HEADER_LEN
        };
        if len < base {
            return Err(Error);
        }
        let header_len = self.header_len();
        if header_len < base || header_len > len {
            return Err(Error);
        }
        Ok(())
    }

    /// Consume the packet, returning the underlying buffer.
    pub fn into_inner(self) -> T {
        self.buffer
    }

    /// Return the raw flags byte.
    #[inline]
    pub fn flags(&self) -> u8 {
        self.buffer.as_ref()[field::FLAGS]
    }

    /// Return the SYN flag.
    #[inline]
    pub fn syn(&self) -> bool {
        self.flags() & FLAG_SYN != 0
    }

    /// Return the ACK flag.
    #[inline]
    pub fn ack(&self) -> bool {
        self.flags() & FLAG_ACK != 0
    }

    /// Return the EACK flag.
    #[inline]
    pub fn eack(&self) -> bool {
        self.flags() & FLAG_EACK != 0
    }

    /// Return the RST flag.
    #[inline]
    pub fn rst(&self) -> bool {
        self.flags() & FLAG_RST != 0
    }

    /// Return the NUL flag.
    #[inline]
    pub fn nul(&self) -> bool {
        self.flags() & FLAG_NUL != 0
    }

    /// Return the version bits of the flags byte.
    #[inline]
    pub fn version(&self) -> u8 {
        self.flags() & VERSION_BITS
    }

    /// Return the header length in bytes. Includes the EACK mask.
    ///
    /// The raw field counts 16-bit units.
    #[inline]
    pub fn header_len(&self) -> usize {
        (self.buffer.as_ref()[field::HLEN] as usize) * 2
    }

    /// Return the local connection port of the sender.
    #[inline]
    pub fn src_port(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::SRC])
    }

    /// Return the local connection port of the receiver. Zero during the
    /// initial SYN, when the receiver has not allocated a port yet.
    #[inline]
    pub fn dst_port(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::DST])
    }

    /// Return the payload length in bytes. Does not include the header.
    #[inline]
    pub fn data_len(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::DLEN])
    }

    /// Return the sequence number of this segment.
    #[inline]
    pub fn seq_number(&self) -> SeqNumber {
        SeqNumber(NetworkEndian::read_u32(&self.buffer.as_ref()[field::SEQ]))
    }

    /// Return the highest in-order sequence the sender has received.
    #[inline]
    pub fn ack_number(&self) -> SeqNumber {
        SeqNumber(NetworkEndian::read_u32(&self.buffer.as_ref()[field::ACK]))
    }

    /// Return the remaining time-to-live in milliseconds.
    #[inline]
    pub fn ttl(&self) -> u32 {
        NetworkEndian::read_u32(&self.buffer.as_ref()[field::TTL])
    }

    /// Return the last consumed segment on the sender's receive side.
    #[inline]
    pub fn last_consumed(&self) -> SeqNumber {
        SeqNumber(NetworkEndian::read_u32(&self.buffer.as_ref()[field::LCS]))
    }

    /// Return the first unexpired sequence on the sender's send side.
    #[inline]
    pub fn ack_next(&self) -> SeqNumber {
        SeqNumber(NetworkEndian::read_u32(
            &self.buffer.as_ref()[field::ACKNXT],
        ))
    }

    /// Return the start-of-message sequence number.
    #[inline]
    pub fn message_start(&self) -> SeqNumber {
        SeqNumber(NetworkEndian::read_u32(&self.buffer.as_ref()[field::SOM]))
    }

    /// Return the number of fragments comprising the message.
    #[inline]
    pub fn fragment_count(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::FCNT])
    }

    /// Return the advertised receive window capacity, in segments.
    /// Meaningful only on SYN segments.
    #[inline]
    pub fn seg_max(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::SEGMAX])
    }

    /// Return the advertised per-segment byte capacity.
    /// Meaningful only on SYN segments.
    #[inline]
    pub fn seg_buf_max(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::SEGBMAX])
    }

    /// Return the sender's delayed-ACK timeout in milliseconds.
    /// Meaningful only on SYN segments.
    #[inline]
    pub fn delayed_ack_timeout(&self) -> u32 {
        NetworkEndian::read_u32(&self.buffer.as_ref()[field::DACKT])
    }

    /// Return the connection options. Meaningful only on SYN segments.
    #[inline]
    pub fn options(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::OPTIONS])
    }

    /// Return the number of 32-bit words in the EACK mask.
    #[inline]
    pub fn eack_mask_words(&self) -> usize {
        if self.syn() {
            return 0;
        }
        (self.header_len() - FIXED_HEADER_LEN) / 4
    }

    /// Return word `i` of the EACK mask, in host order.
    ///
    /// Bit 31 of word 0 denotes sequence `ack + 2`.
    #[inline]
    pub fn eack_mask_word(&self, i: usize) -> u32 {
        let offset = FIXED_HEADER_LEN + i * 4;
        NetworkEndian::read_u32(&self.buffer.as_ref()[offset..offset + 4])
    }
}

impl<'a, T: AsRef<[u8]> + ?Sized> Packet<&'a T> {
    /// Return a pointer to the payload.
    #[inline]
    pub fn payload(&self) -> &'a [u8] {
        let header_len = self.header_len();
        let data = self.buffer.as_ref();
        &data[field::PAYLOAD(header_len)]
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Packet<T> {
    /// Set the raw flags byte.
    #[inline]
    pub fn set_flags(&mut self, value: u8) {
        self.buffer.as_mut()[field::FLAGS] = value;
    }

    /// Set the header length, given in bytes. Must be even.
    #[inline]
    pub fn set_header_len(&mut self, value: usize) {
        self.buffer.as_mut()[field::HLEN] = (value >> 1) as u8;
    }

    /// Set the local connection port of the sender.
    #[inline]
    pub fn set_src_port(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::SRC], value)
    }

    /// Set the local connection port of the receiver.
    #[inline]
    pub fn set_dst_port(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::DST], value)
    }

    /// Set the payload length field.
    #[inline]
    pub fn set_data_len(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::DLEN], value)
    }

    /// Set the sequence number.
    #[inline]
    pub fn set_seq_number(&mut self, value: SeqNumber) {
        NetworkEndian::write_u32(&mut self.buffer.as_mut()[field::SEQ], value.0)
    }

    /// Set the acknowledgement number.
    #[inline]
    pub fn set_ack_number(&mut self, value: SeqNumber) {
        NetworkEndian::write_u32(&mut self.buffer.as_mut()[field::ACK], value.0)
    }

    /// Set the time-to-live field.
    #[inline]
    pub fn set_ttl(&mut self, value: u32) {
        NetworkEndian::write_u32(&mut self.buffer.as_mut()[field::TTL], value)
    }

    /// Set the last-consumed-segment field.
    #[inline]
    pub fn set_last_consumed(&mut self, value: SeqNumber) {
        NetworkEndian::write_u32(&mut self.buffer.as_mut()[field::LCS], value.0)
    }

    /// Set the first-unexpired-sequence field.
    #[inline]
    pub fn set_ack_next(&mut self, value: SeqNumber) {
        NetworkEndian::write_u32(&mut self.buffer.as_mut()[field::ACKNXT], value.0)
    }

    /// Set the start-of-message field.
    #[inline]
    pub fn set_message_start(&mut self, value: SeqNumber) {
        NetworkEndian::write_u32(&mut self.buffer.as_mut()[field::SOM], value.0)
    }

    /// Set the fragment count field.
    #[inline]
    pub fn set_fragment_count(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::FCNT], value)
    }

    /// Zero the reserved field. Required on every emitted fixed header.
    #[inline]
    pub fn clear_reserved(&mut self) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::RSRV], 0)
    }

    /// Set the advertised receive window capacity. SYN segments only.
    #[inline]
    pub fn set_seg_max(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::SEGMAX], value)
    }

    /// Set the advertised per-segment byte capacity. SYN segments only.
    #[inline]
    pub fn set_seg_buf_max(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::SEGBMAX], value)
    }

    /// Set the delayed-ACK timeout field. SYN segments only.
    #[inline]
    pub fn set_delayed_ack_timeout(&mut self, value: u32) {
        NetworkEndian::write_u32(&mut self.buffer.as_mut()[field::DACKT], value)
    }

    /// Set the connection options. SYN segments only.
    #[inline]
    pub fn set_options(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::OPTIONS], value)
    }

    /// Zero the reserved field of a SYN header.
    #[inline]
    pub fn clear_syn_reserve(&mut self) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::RESERVE], 0)
    }

    /// Write the EACK mask words after the fixed header, in network order.
    /// The header length field must already cover the mask.
    #[inline]
    pub fn set_eack_mask(&mut self, words: &[u32]) {
        let data = self.buffer.as_mut();
        for (i, word) in words.iter().enumerate() {
            let offset = FIXED_HEADER_LEN + i * 4;
            NetworkEndian::write_u32(&mut data[offset..offset + 4], *word);
        }
    }
}

impl<T: AsRef<[u8]>> AsRef<[u8]> for Packet<T> {
    fn as_ref(&self) -> &[u8] {
        self.buffer.as_ref()
    }
}

impl<'a, T: AsRef<[u8]> + ?Sized> fmt::Display for Packet<&'a T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "RDP src={} dst={} seq={} ack={}",
            self.src_port(),
            self.dst_port(),
            self.seq_number(),
            self.ack_number()
        )?;
        if self.syn() {
            write!(f, " syn segmax={} segbmax={}", self.seg_max(), self.seg_buf_max())?;
        } else {
            write!(f, " dlen={}", self.data_len())?;
        }
        for (flag, set) in [
            ("ack", self.ack()),
            ("eack", self.eack()),
            ("rst", self.rst()),
            ("nul", self.nul()),
        ] {
            if set {
                write!(f, " {flag}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A data segment of 4 payload bytes, carrying a one-word EACK mask.
    static SEGMENT_BYTES: [u8; 44] = [
        0x46, 0x14, 0x12, 0x34, 0x56, 0x78, 0x00, 0x04, 0x00, 0x00, 0x03, 0xe9, 0x00, 0x00, 0x13,
        0x88, 0x00, 0x00, 0x01, 0xf4, 0x00, 0x00, 0x13, 0x87, 0x00, 0x00, 0x03, 0xe7, 0x00, 0x00,
        0x03, 0xe9, 0x00, 0x01, 0x00, 0x00, 0x80, 0x00, 0x00, 0x01, 0xaa, 0xbb, 0xcc, 0xdd,
    ];

    // A SYN segment with a two-byte handshake payload.
    static SYN_BYTES: [u8; 30] = [
        0x41, 0x0e, 0x12, 0x34, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x03, 0xe8, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x20, 0x05, 0xdc, 0x00, 0x00, 0x00, 0x64, 0x00, 0x01, 0x00, 0x00, 0x48, 0x31,
    ];

    #[test]
    fn test_deconstruct() {
        let packet = Packet::new_checked(&SEGMENT_BYTES[..]).unwrap();
        assert_eq!(packet.flags(), FLAG_ACK | FLAG_EACK | FLAG_VER);
        assert!(packet.ack());
        assert!(packet.eack());
        assert!(!packet.syn());
        assert!(!packet.rst());
        assert!(!packet.nul());
        assert_eq!(packet.version(), FLAG_VER);
        assert_eq!(packet.header_len(), 40);
        assert_eq!(packet.src_port(), 0x1234);
        assert_eq!(packet.dst_port(), 0x5678);
        assert_eq!(packet.data_len(), 4);
        assert_eq!(packet.seq_number(), SeqNumber(1001));
        assert_eq!(packet.ack_number(), SeqNumber(5000));
        assert_eq!(packet.ttl(), 500);
        assert_eq!(packet.last_consumed(), SeqNumber(4999));
        assert_eq!(packet.ack_next(), SeqNumber(999));
        assert_eq!(packet.message_start(), SeqNumber(1001));
        assert_eq!(packet.fragment_count(), 1);
        assert_eq!(packet.eack_mask_words(), 1);
        assert_eq!(packet.eack_mask_word(0), 0x8000_0001);
        assert_eq!(packet.payload(), &[0xaa, 0xbb, 0xcc, 0xdd]);
    }

    #[test]
    fn test_construct() {
        let mut bytes = vec![0xa5; 44];
        let mut packet = Packet::new_unchecked(&mut bytes[..]);
        packet.set_flags(FLAG_ACK | FLAG_EACK | FLAG_VER);
        packet.set_header_len(40);
        packet.set_src_port(0x1234);
        packet.set_dst_port(0x5678);
        packet.set_data_len(4);
        packet.set_seq_number(SeqNumber(1001));
        packet.set_ack_number(SeqNumber(5000));
        packet.set_ttl(500);
        packet.set_last_consumed(SeqNumber(4999));
        packet.set_ack_next(SeqNumber(999));
        packet.set_message_start(SeqNumber(1001));
        packet.set_fragment_count(1);
        packet.clear_reserved();
        packet.set_eack_mask(&[0x8000_0001]);
        bytes[40..].copy_from_slice(&[0xaa, 0xbb, 0xcc, 0xdd]);
        assert_eq!(&bytes[..], &SEGMENT_BYTES[..]);
    }

    #[test]
    fn test_deconstruct_syn() {
        let packet = Packet::new_checked(&SYN_BYTES[..]).unwrap();
        assert!(packet.syn());
        assert!(!packet.ack());
        assert_eq!(packet.version(), FLAG_VER);
        assert_eq!(packet.header_len(), SYN_HEADER_LEN);
        assert_eq!(packet.src_port(), 0x1234);
        assert_eq!(packet.dst_port(), 0);
        assert_eq!(packet.data_len(), 2);
        assert_eq!(packet.seq_number(), SeqNumber(1000));
        assert_eq!(packet.seg_max(), 32);
        assert_eq!(packet.seg_buf_max(), 1500);
        assert_eq!(packet.delayed_ack_timeout(), 100);
        assert_eq!(packet.options(), FLAG_SDM);
        assert_eq!(packet.payload(), b"H1");
    }

    #[test]
    fn test_construct_syn() {
        let mut bytes = vec![0; 30];
        let mut packet = Packet::new_unchecked(&mut bytes[..]);
        packet.set_flags(FLAG_SYN | FLAG_VER);
        packet.set_header_len(SYN_HEADER_LEN);
        packet.set_src_port(0x1234);
        packet.set_dst_port(0);
        packet.set_data_len(2);
        packet.set_seq_number(SeqNumber(1000));
        packet.set_ack_number(SeqNumber(0));
        packet.set_seg_max(32);
        packet.set_seg_buf_max(1500);
        packet.set_delayed_ack_timeout(100);
        packet.set_options(FLAG_SDM);
        packet.clear_syn_reserve();
        bytes[28..].copy_from_slice(b"H1");
        assert_eq!(&bytes[..], &SYN_BYTES[..]);
    }

    #[test]
    fn test_check_len() {
        // Truncated below the base header.
        assert_eq!(Packet::new_checked(&SEGMENT_BYTES[..20]), Err(Error));
        // Header length pointing past the buffer.
        let mut bytes = SEGMENT_BYTES;
        bytes[1] = 23;
        assert_eq!(Packet::new_checked(&bytes[..]), Err(Error));
        // Header length inside the base header.
        let mut bytes = SEGMENT_BYTES;
        bytes[1] = 17;
        assert_eq!(Packet::new_checked(&bytes[..]), Err(Error));
        // A SYN is held to the shorter base.
        assert!(Packet::new_checked(&SYN_BYTES[..]).is_ok());
        assert_eq!(Packet::new_checked(&SYN_BYTES[..27]), Err(Error));
    }

    #[test]
    fn test_seq_number_compare() {
        assert!(SeqNumber(1) < SeqNumber(2));
        assert!(SeqNumber(2) > SeqNumber(1));
        assert_eq!(SeqNumber(5), SeqNumber(5));
        // Wraparound behaves like nearby arithmetic.
        assert!(SeqNumber(u32::MAX) < SeqNumber(0));
        assert!(SeqNumber(u32::MAX - 2) < SeqNumber(3));
        assert!(SeqNumber(1) > SeqNumber(u32::MAX));
        assert_eq!(SeqNumber(u32::MAX) + 2, SeqNumber(1));
        assert_eq!(SeqNumber(1) - SeqNumber(u32::MAX), 2);
        assert_eq!(SeqNumber(3) - 5, SeqNumber(u32::MAX - 1));
    }

    #[test]
    fn test_in_window() {
        assert!(in_window(SeqNumber(10), 4, SeqNumber(10)));
        assert!(in_window(SeqNumber(10), 4, SeqNumber(13)));
        assert!(!in_window(SeqNumber(10), 4, SeqNumber(14)));
        assert!(!in_window(SeqNumber(10), 4, SeqNumber(9)));
        // The window may straddle the wrap point.
        assert!(in_window(SeqNumber(u32::MAX - 1), 4, SeqNumber(1)));
        assert!(!in_window(SeqNumber(u32::MAX - 1), 4, SeqNumber(2)));
    }
}
