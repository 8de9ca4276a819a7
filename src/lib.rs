/*! A reliable datagram protocol engine on top of UDP.

`rudp` provides a connection-oriented, sequenced, message-based delivery
service with per-message time-to-live, selective acknowledgment, flow
control and keepalive, for peer-to-peer messaging where payloads may span
several datagrams but TCP's head-of-line blocking and lack of message
expiry are undesirable.

The engine is strictly single-threaded and cooperative: the host reactor
calls [iface::Interface::poll] whenever the socket is readable or writable
or a previously requested timer deadline passes, and the engine reports the
next deadline through [iface::Interface::poll_delay]. All application
notifications are delivered through the [iface::Events] trait during the
poll call.

The crate is split the following way:

 * The [wire] module marshals and unmarshals segment headers.
 * The [phy] module abstracts the datagram socket the engine is driven
   through, and provides UDP and in-memory loopback implementations.
 * The [conn] module holds the per-connection state machine together with
   its send and receive rings, RTT estimation, and timers.
 * The [iface] module owns the connections and implements the dispatch
   loop and the host-facing API.
*/

#[macro_use]
mod macros;

pub mod config;
pub mod conn;
pub mod iface;
pub mod phy;
pub mod time;
pub mod wire;

mod rand;
