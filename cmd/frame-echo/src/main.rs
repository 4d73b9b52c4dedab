//! Framed echo over the evnet reactor.
//!
//! The server sends every complete frame back unchanged. The client reads
//! lines from stdin on a helper thread, hands them to the reactor thread
//! through a `BoundedQueue`, sends each as one frame and prints the echoes.
//!
//! Usage:
//!     frame-echo server [tcp|udp] [port]
//!     frame-echo client [tcp|udp] [host] [port]
//!
//! Logging is controlled by `RUST_LOG` (default `info`), reactor tuning by
//! the `EVNET_*` variables, e.g. `EVNET_MAX_FDS=4096`.
//!
//! Test with:
//!     frame-echo server tcp 9999
//!     printf 'hello\nworld\n' | frame-echo client tcp 127.0.0.1 9999

use std::cell::Cell;
use std::net::Ipv4Addr;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use std::{io, process, thread};

use evnet_core::BoundedQueue;
use evnet_reactor::{
    PacketHandler, Reactor, ReactorConfig, Session, SocketId, SocketMeta, TcpSocket, UdpSocket,
};
use evnet_wire::{encode_packet, Decoder, MAIN_CMD_PAXOS};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_PORT: u16 = 9999;
const SUB_CMD_ECHO: u16 = 1;
const LINE_QUEUE_CAPACITY: usize = 1024;
/// How long the client waits for outstanding replies once input ended.
const REPLY_WAIT: Duration = Duration::from_secs(2);

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_sigint(_: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

#[derive(Clone, Copy, PartialEq)]
enum Transport {
    Tcp,
    Udp,
}

// ── Server ──

#[derive(Default)]
struct EchoHandler {
    frames: Cell<u64>,
    bytes: Cell<u64>,
}

impl PacketHandler for EchoHandler {
    fn handle_packet(&self, data: &[u8], session: &mut Session<'_>) -> isize {
        let n = Decoder::handler_verdict(data);
        if n <= 0 {
            if n < 0 {
                warn!(socket = %session.id(), peer = ?session.peer_addr(), "malformed frame");
            }
            return n;
        }
        let frame = &data[..n as usize];
        if let Err(e) = session.send_packet(frame) {
            warn!(socket = %session.id(), error = %e, "echo failed");
            return -1;
        }
        self.frames.set(self.frames.get() + 1);
        self.bytes.set(self.bytes.get() + frame.len() as u64);
        n
    }

    fn handle_close(&self, meta: &SocketMeta) {
        info!(socket = %meta.id(), peer = ?meta.peer_addr, "connection closed");
    }
}

fn run_server(reactor: &mut Reactor, transport: Transport, port: u16) -> evnet_reactor::Result<()> {
    let handler = Rc::new(EchoHandler::default());
    match transport {
        Transport::Tcp => TcpSocket::listen(reactor, port, 128, handler.clone())?,
        Transport::Udp => UdpSocket::listen(reactor, port, handler.clone())?,
    };

    while RUNNING.load(Ordering::Relaxed) {
        reactor.dispatch()?;
    }
    info!(
        frames = handler.frames.get(),
        bytes = handler.bytes.get(),
        sockets = reactor.socket_count(),
        "server stopped"
    );
    Ok(())
}

// ── Client ──

#[derive(Default)]
struct ReplyPrinter {
    replies: Cell<u64>,
    closed: Cell<bool>,
}

impl PacketHandler for ReplyPrinter {
    fn handle_packet(&self, data: &[u8], _session: &mut Session<'_>) -> isize {
        let n = match Decoder::frame_len(data) {
            Ok(Some(n)) => n,
            Ok(None) => return 0,
            Err(_) => return -1,
        };
        let mut line = String::new();
        match Decoder::new(&data[..n]).deserialize(&mut line) {
            Ok(header) => {
                println!("[{}] {}", header.sequence, line);
                self.replies.set(self.replies.get() + 1);
                n as isize
            }
            Err(e) => {
                warn!(error = %e, "undecodable reply");
                -1
            }
        }
    }

    fn handle_close(&self, _meta: &SocketMeta) {
        self.closed.set(true);
    }
}

/// Feed stdin lines into `queue` until EOF, then raise `done`.
fn spawn_reader(queue: Arc<BoundedQueue<String>>, done: Arc<AtomicBool>) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new().name("stdin".into()).spawn(move || {
        for line in io::stdin().lines() {
            let mut line = match line {
                Ok(line) => line,
                Err(e) => {
                    error!(error = %e, "stdin read failed");
                    break;
                }
            };
            while let Err(back) = queue.push(line) {
                if !RUNNING.load(Ordering::Relaxed) {
                    return;
                }
                line = back;
                thread::sleep(Duration::from_millis(1));
            }
        }
        done.store(true, Ordering::Release);
    })
}

/// Client exit check once stdin is drained: every reply arrived, or none
/// arrived for `REPLY_WAIT` (a lost UDP datagram never comes back).
fn client_done(sent: u32, replies: u64, quiet: Duration) -> bool {
    replies >= u64::from(sent) || quiet >= REPLY_WAIT
}

fn run_client(
    reactor: &mut Reactor,
    transport: Transport,
    host: Ipv4Addr,
    port: u16,
) -> evnet_reactor::Result<()> {
    let printer = Rc::new(ReplyPrinter::default());
    let id: SocketId = match transport {
        Transport::Tcp => TcpSocket::connect(reactor, host, port, printer.clone())?,
        Transport::Udp => UdpSocket::connect(reactor, host, port, printer.clone())?,
    };

    let queue = Arc::new(BoundedQueue::new(LINE_QUEUE_CAPACITY));
    let input_done = Arc::new(AtomicBool::new(false));
    let reader = match spawn_reader(queue.clone(), input_done.clone()) {
        Ok(handle) => Some(handle),
        Err(e) => {
            error!(error = %e, "cannot start stdin reader");
            None
        }
    };

    let mut batch = Vec::new();
    let mut sequence = 0u32;
    let mut seen = 0u64;
    let mut last_progress = Instant::now();
    while RUNNING.load(Ordering::Relaxed) && !printer.closed.get() {
        reactor.dispatch()?;
        if printer.replies.get() != seen {
            seen = printer.replies.get();
            last_progress = Instant::now();
        }

        let ready = reactor.get(id).map_or(false, |m| m.state.is_established());
        if ready {
            batch.clear();
            queue.drain_into(&mut batch, Duration::ZERO);
            for line in batch.drain(..) {
                sequence = sequence.wrapping_add(1);
                let frame = match encode_packet(MAIN_CMD_PAXOS, sequence, SUB_CMD_ECHO, 0, &line) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(error = %e, "line not sent");
                        continue;
                    }
                };
                reactor.send_packet(id, &frame)?;
                last_progress = Instant::now();
            }
        }

        let drained = input_done.load(Ordering::Acquire) && queue.is_empty();
        if drained && client_done(sequence, seen, last_progress.elapsed()) {
            break;
        }
    }

    let missing = u64::from(sequence).saturating_sub(printer.replies.get());
    if missing > 0 {
        warn!(missing, "gave up waiting for replies");
    }

    reactor.close(id).ok();
    if let Some(handle) = reader {
        // Blocked on stdin unless input ended.
        if input_done.load(Ordering::Acquire) {
            handle.join().ok();
        }
    }
    info!(sent = sequence, replies = printer.replies.get(), "client finished");
    Ok(())
}

// ── main ──

fn usage() -> ! {
    eprintln!("usage: frame-echo server [tcp|udp] [port]");
    eprintln!("       frame-echo client [tcp|udp] [host] [port]");
    process::exit(2);
}

fn parse_transport(arg: Option<&String>) -> Transport {
    match arg.map(String::as_str) {
        None | Some("tcp") => Transport::Tcp,
        Some("udp") => Transport::Udp,
        Some(_) => usage(),
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    unsafe {
        libc::signal(libc::SIGINT, handle_sigint as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_sigint as libc::sighandler_t);
    }

    let args: Vec<String> = std::env::args().collect();
    let mode = args.get(1).map(String::as_str).unwrap_or("server");
    let transport = parse_transport(args.get(2));

    let config = ReactorConfig::from_env();
    let mut reactor = match Reactor::new(config) {
        Ok(reactor) => reactor,
        Err(e) => {
            error!(error = %e, "reactor setup failed");
            process::exit(1);
        }
    };

    let result = match mode {
        "server" => {
            let port = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(DEFAULT_PORT);
            run_server(&mut reactor, transport, port)
        }
        "client" => {
            let host = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(Ipv4Addr::LOCALHOST);
            let port = args.get(4).and_then(|s| s.parse().ok()).unwrap_or(DEFAULT_PORT);
            run_client(&mut reactor, transport, host, port)
        }
        _ => usage(),
    };

    if let Err(e) = result {
        error!(error = %e, "frame-echo failed");
        process::exit(1);
    }
}
