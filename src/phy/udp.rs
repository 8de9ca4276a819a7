use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::io::AsRawFd;

use super::{sys, DatagramSocket, SocketError, SocketResult};

/// A non-blocking UDP socket backed by the operating system.
///
/// Transmission uses `sendmsg(2)` scatter-gather, so segment headers and
/// payloads are handed to the kernel as separate buffers.
#[derive(Debug)]
pub struct UdpSocket {
    lower: std::net::UdpSocket,
}

impl UdpSocket {
    /// Bind a socket to `addr` and switch it to non-blocking mode.
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<UdpSocket> {
        let lower = std::net::UdpSocket::bind(addr)?;
        lower.set_nonblocking(true)?;
        Ok(UdpSocket { lower })
    }

    /// Return the local address the socket is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.lower.local_addr()
    }
}

impl AsRawFd for UdpSocket {
    fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
        self.lower.as_raw_fd()
    }
}

fn classify(err: io::Error) -> SocketError {
    if err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EAGAIN) {
        SocketError::WouldBlock
    } else {
        SocketError::Fatal
    }
}

impl DatagramSocket for UdpSocket {
    fn send_to(&mut self, parts: &[&[u8]], addr: SocketAddr) -> SocketResult<()> {
        match sys::send_to_vectored(self.lower.as_raw_fd(), parts, &addr) {
            Ok(_) => Ok(()),
            Err(err) => Err(classify(err)),
        }
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> SocketResult<(usize, SocketAddr)> {
        match sys::recv_from(self.lower.as_raw_fd(), buf) {
            Ok((len, addr)) => Ok((len, addr)),
            Err(err) => Err(classify(err)),
        }
    }
}
