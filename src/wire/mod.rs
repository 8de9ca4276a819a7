/*! Low-level segment access and construction.

The `wire` module deals with the on-the-wire *representation* of RDP
segments. It provides functions to extract fields from sequences of octets
and to insert fields into sequences of octets, through the [Packet] family
of structures.

The `Packet::new_checked` method is a shorthand for a combination of
`Packet::new_unchecked` and `Packet::check_len`. When parsing untrusted
input, it is *necessary* to use `Packet::new_checked()`; so long as the
buffer is not modified, no accessor will fail. When emitting output, it is
*incorrect* to use `Packet::new_checked()`; the length check is likely to
succeed on a zeroed buffer, but fail on a buffer filled with data from a
previous packet.

[Packet]: struct.RdpPacket.html
*/

mod field {
    pub type Field = ::core::ops::Range<usize>;
    pub type Rest = ::core::ops::RangeFrom<usize>;
}

use core::fmt;

mod rdp;
pub use self::rdp::{
    in_window, Packet as RdpPacket, SeqNumber, FIXED_HEADER_LEN, FLAG_ACK, FLAG_EACK, FLAG_NUL,
    FLAG_RST, FLAG_SDM, FLAG_SYN, FLAG_VER, SYN_HEADER_LEN, TTL_EXPIRED, TTL_INFINITE, TTL_MAX,
    VERSION_BITS,
};

/// Parsing a packet failed.
///
/// Either it is malformed, or it is not supported by rudp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error;

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wire::Error")
    }
}

pub type Result<T> = core::result::Result<T, Error>;
