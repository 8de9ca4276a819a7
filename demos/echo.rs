//! A two-peer echo demo over real UDP sockets.
//!
//! Terminal one:
//!     cargo run --example echo -- --listen 127.0.0.1:5555
//! Terminal two:
//!     cargo run --example echo -- --connect 127.0.0.1:5555 --message "hello there"

use std::net::SocketAddr;
use std::time::Duration as StdDuration;

use rudp::conn::Message;
use rudp::iface::{Accept, Config, ConnHandle, DisconnectReason, Error, Events, Interface};
use rudp::phy::UdpSocket;
use rudp::time::Instant;
use rudp::wire::SeqNumber;

const SEGMAX: u16 = 16;
const SEGBMAX: u16 = 4440;

#[derive(Default)]
struct Echo {
    accepting: bool,
    open: Vec<ConnHandle>,
    inbox: Vec<(ConnHandle, SeqNumber, Vec<u8>)>,
    closed: bool,
}

impl Events for Echo {
    fn accept(&mut self, _conn: ConnHandle, remote: SocketAddr, syn_payload: &[u8]) -> Option<Accept> {
        if !self.accepting {
            return None;
        }
        log::info!(
            "accepting {} (handshake {:?})",
            remote,
            String::from_utf8_lossy(syn_payload)
        );
        Some(Accept {
            seg_max: SEGMAX,
            seg_buf_max: SEGBMAX,
            payload: b"echo-server".to_vec(),
        })
    }

    fn connected(
        &mut self,
        conn: ConnHandle,
        passive: bool,
        syn_payload: &[u8],
        status: Result<(), Error>,
    ) {
        match status {
            Ok(()) => {
                log::info!(
                    "connection {conn} open (passive={passive}, peer says {:?})",
                    String::from_utf8_lossy(syn_payload)
                );
                self.open.push(conn);
            }
            Err(err) => {
                log::error!("connect failed: {err}");
                self.closed = true;
            }
        }
    }

    fn disconnected(&mut self, conn: ConnHandle, reason: DisconnectReason) {
        log::info!("connection {conn} closed: {reason}");
        self.closed = true;
    }

    fn recv(&mut self, conn: ConnHandle, message: &Message) {
        self.inbox.push((conn, message.start(), message.to_vec()));
    }

    fn send_done(&mut self, _conn: ConnHandle, buffer: Vec<u8>, status: Result<(), Error>) {
        match status {
            Ok(()) => log::debug!("delivered {} bytes", buffer.len()),
            Err(err) => log::warn!("send of {} bytes failed: {err}", buffer.len()),
        }
    }

    fn window_changed(&mut self, _conn: ConnHandle, window: u16, _status: Result<(), Error>) {
        log::debug!("peer window is now {window}");
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut opts = getopts::Options::new();
    opts.optopt("l", "listen", "accept connections on ADDR", "ADDR");
    opts.optopt("c", "connect", "connect to a listener at ADDR", "ADDR");
    opts.optopt("m", "message", "message for the listener to echo", "TEXT");
    opts.optflag("h", "help", "print this help");

    let matches = match opts.parse(&args) {
        Ok(matches) => matches,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    };
    if matches.opt_present("h") || (!matches.opt_present("l") && !matches.opt_present("c")) {
        print!("{}", opts.usage("Usage: echo --listen ADDR | --connect ADDR [--message TEXT]"));
        return;
    }

    let mut events = Echo::default();
    let mut iface = Interface::new(Config {
        random_seed: std::process::id() as u64,
        ..Config::default()
    });

    let mut socket;
    let mut to_send: Option<Vec<u8>> = None;

    if let Some(listen) = matches.opt_str("l") {
        socket = UdpSocket::bind(listen.as_str()).expect("cannot bind socket");
        events.accepting = true;
        iface.listen();
        log::info!("listening on {}", socket.local_addr().unwrap());
    } else {
        let remote: SocketAddr = matches
            .opt_str("c")
            .unwrap()
            .parse()
            .expect("bad remote address");
        socket = UdpSocket::bind("0.0.0.0:0").expect("cannot bind socket");
        let text = matches.opt_str("m").unwrap_or_else(|| "ping".to_string());
        to_send = Some(text.into_bytes());
        iface
            .connect(
                Instant::now(),
                &mut socket,
                remote,
                SEGMAX,
                SEGBMAX,
                b"echo-client".to_vec(),
            )
            .expect("connect failed");
    }

    let server = events.accepting;
    loop {
        let now = Instant::now();
        iface.poll(now, &mut socket, true, true, &mut events);

        // The client sends its message once the connection opens; the
        // server echoes whatever arrives.
        let open = events.open.first().copied();
        if let Some(conn) = open {
            if let Some(payload) = to_send.take() {
                if let Err(rejected) = iface.send(now, &mut socket, &mut events, conn, payload, 0) {
                    log::warn!("send rejected: {}", rejected.reason);
                    to_send = Some(rejected.buffer);
                }
            }
        }

        // Messages release in arrival order; the receive window reopens as
        // they do.
        while !events.inbox.is_empty() {
            let (conn, som, data) = events.inbox.remove(0);
            iface.recv_ready(now, conn, som).ok();
            if server {
                log::info!("echoing {} bytes", data.len());
                if let Err(rejected) = iface.send(now, &mut socket, &mut events, conn, data, 0) {
                    log::warn!("echo rejected: {}", rejected.reason);
                }
            } else {
                println!("{}", String::from_utf8_lossy(&data));
                iface.disconnect(now, &mut socket, &mut events, conn).ok();
            }
        }

        if events.closed && !server {
            break;
        }

        let sleep = iface
            .poll_delay(Instant::now())
            .map(|d| StdDuration::from(d).min(StdDuration::from_millis(50)))
            .unwrap_or(StdDuration::from_millis(50));
        std::thread::sleep(sleep);
    }
}
