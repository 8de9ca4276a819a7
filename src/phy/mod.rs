/*! Access to datagram transport.

The `phy` module provides the socket abstraction the protocol engine is
driven through, and two implementations of it:

 * [UdpSocket], a non-blocking UDP socket backed by the operating system,
   transmitting with scatter-gather so that header and payload are never
   copied into one buffer.
 * [Loopback], an in-memory datagram link used by the test suite and by
   single-process demos. It supports a transmit-side tap for injecting
   loss deterministically.

The engine never blocks: both operations report [SocketError::WouldBlock]
and the host reactor is expected to call back in when the socket becomes
ready again.
*/

use core::fmt;
use std::net::SocketAddr;

mod loopback;
#[cfg(unix)]
mod sys;
#[cfg(unix)]
mod udp;

pub use self::loopback::{Loopback, TapVerdict};
#[cfg(unix)]
pub use self::udp::UdpSocket;

/// Error returned by socket operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketError {
    /// The socket is not ready; retry when the host reactor signals
    /// readiness in the relevant direction.
    WouldBlock,
    /// The socket failed in a way the engine cannot recover from.
    Fatal,
}

impl std::error::Error for SocketError {}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketError::WouldBlock => write!(f, "operation would block"),
            SocketError::Fatal => write!(f, "socket error"),
        }
    }
}

pub type SocketResult<T> = core::result::Result<T, SocketError>;

/// A non-blocking datagram socket, as consumed by the protocol engine.
pub trait DatagramSocket {
    /// Send one datagram, gathered from `parts`, to `addr`.
    fn send_to(&mut self, parts: &[&[u8]], addr: SocketAddr) -> SocketResult<()>;

    /// Receive one datagram into `buf`, returning its length and origin.
    fn recv_from(&mut self, buf: &mut [u8]) -> SocketResult<(usize, SocketAddr)>;
}
