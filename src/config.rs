//! Compile-time protocol bounds.
//!
//! These are properties of the wire format and of the engine itself, as
//! opposed to the per-handle knobs in [crate::iface::Config].

/// Hard ceiling on the advertised receive window, in segments.
///
/// Bounded by the 8-bit `hlen` header field together with the requirement
/// that the EACK mask fits in the header in whole 32-bit words.
pub const MAX_WINDOW_SIZE: u16 = 256;

/// Number of 32-bit words needed for an EACK mask covering [MAX_WINDOW_SIZE].
pub const EACK_MASK_WORDS: usize = (MAX_WINDOW_SIZE as usize + 31) / 32;

/// Payload bytes available to a UDP datagram on a 1500-byte link.
pub const UDP_MTU: u32 = 1472;

/// Overhead of the UDP header itself, counted against the peer's SEGBMAX.
pub const UDP_HEADER_LEN: usize = 8;

/// Connections are torn down by a single timer pass after TIMEWAIT.
pub const DISCONNECT_RETRY: u16 = 1;

/// Re-check interval while waiting for the receive queue to drain before
/// the final delete.
pub const DISCONNECT_RETRY_TIMEOUT: u32 = 1000;

/// Lower clamp on the retransmission timeout, in milliseconds.
pub const MIN_RTO: u32 = 100;

/// Upper clamp on the retransmission timeout, in milliseconds.
pub const MAX_RTO: u32 = 64_000;

/// Shortest delay used for unsolicited window-update ACKs, in milliseconds.
pub const MIN_DELAYED_ACK_TIMEOUT: u32 = 10;
