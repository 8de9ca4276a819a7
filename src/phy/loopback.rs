use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::Rc;

use super::{DatagramSocket, SocketError, SocketResult};

type Queue = Rc<RefCell<VecDeque<(SocketAddr, Vec<u8>)>>>;

/// Decision made by a transmit tap for one outgoing datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapVerdict {
    /// Deliver the datagram to the peer.
    Pass,
    /// Silently discard the datagram.
    Drop,
    /// Report a full socket buffer to the sender.
    Block,
}

/// One endpoint of an in-memory datagram link.
///
/// A [Loopback::pair] connects two endpoints with lossless queues. A
/// transmit-side tap can be installed to drop, delay, or block individual
/// datagrams, which is how the test suite simulates loss and backpressure.
pub struct Loopback {
    addr: SocketAddr,
    tx: Queue,
    rx: Queue,
    tap: Option<Box<dyn FnMut(&[u8]) -> TapVerdict>>,
}

impl core::fmt::Debug for Loopback {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Loopback").field("addr", &self.addr).finish()
    }
}

impl Loopback {
    /// Create two connected endpoints pretending to live at `a` and `b`.
    pub fn pair(a: SocketAddr, b: SocketAddr) -> (Loopback, Loopback) {
        let ab: Queue = Rc::new(RefCell::new(VecDeque::new()));
        let ba: Queue = Rc::new(RefCell::new(VecDeque::new()));
        (
            Loopback {
                addr: a,
                tx: ab.clone(),
                rx: ba.clone(),
                tap: None,
            },
            Loopback {
                addr: b,
                tx: ba,
                rx: ab,
                tap: None,
            },
        )
    }

    /// The pretend address of this endpoint.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Install a transmit tap. The tap sees every outgoing datagram before
    /// it is queued and decides its fate.
    pub fn set_tap<F>(&mut self, tap: F)
    where
        F: FnMut(&[u8]) -> TapVerdict + 'static,
    {
        self.tap = Some(Box::new(tap));
    }

    /// Remove the transmit tap.
    pub fn clear_tap(&mut self) {
        self.tap = None;
    }

    /// Number of datagrams queued towards the peer.
    pub fn queued(&self) -> usize {
        self.tx.borrow().len()
    }
}

impl DatagramSocket for Loopback {
    fn send_to(&mut self, parts: &[&[u8]], _addr: SocketAddr) -> SocketResult<()> {
        let mut datagram = Vec::with_capacity(parts.iter().map(|p| p.len()).sum());
        for part in parts {
            datagram.extend_from_slice(part);
        }
        if let Some(tap) = self.tap.as_mut() {
            match tap(&datagram) {
                TapVerdict::Pass => (),
                TapVerdict::Drop => return Ok(()),
                TapVerdict::Block => return Err(SocketError::WouldBlock),
            }
        }
        self.tx.borrow_mut().push_back((self.addr, datagram));
        Ok(())
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> SocketResult<(usize, SocketAddr)> {
        match self.rx.borrow_mut().pop_front() {
            Some((from, datagram)) => {
                let len = datagram.len().min(buf.len());
                buf[..len].copy_from_slice(&datagram[..len]);
                Ok((len, from))
            }
            None => Err(SocketError::WouldBlock),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_pair_round_trip() {
        let (mut a, mut b) = Loopback::pair(addr(1), addr(2));
        a.send_to(&[&b"he"[..], &b"llo"[..]], addr(2)).unwrap();
        let mut buf = [0; 16];
        let (len, from) = b.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"hello");
        assert_eq!(from, addr(1));
        assert_eq!(b.recv_from(&mut buf), Err(SocketError::WouldBlock));
    }

    #[test]
    fn test_tap_drop() {
        let (mut a, mut b) = Loopback::pair(addr(1), addr(2));
        let mut nth = 0;
        a.set_tap(move |_| {
            nth += 1;
            if nth == 2 {
                TapVerdict::Drop
            } else {
                TapVerdict::Pass
            }
        });
        for payload in [b"one", b"two", b"tri"] {
            a.send_to(&[&payload[..]], addr(2)).unwrap();
        }
        let mut buf = [0; 16];
        assert_eq!(b.recv_from(&mut buf).map(|(n, _)| n), Ok(3));
        assert_eq!(&buf[..3], b"one");
        assert_eq!(b.recv_from(&mut buf).map(|(n, _)| n), Ok(3));
        assert_eq!(&buf[..3], b"tri");
    }
}
