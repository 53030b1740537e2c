//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! ## Edge-triggered readiness
//!
//! mio reports readiness transitions, not levels. Every client is registered
//! once for both directions and the loop keeps the level itself in two
//! per-client flags:
//! - `readable` is set by a readable event and cleared when a read would
//!   block. Each turn reads at most `reads_per_turn` chunks per client, so a
//!   client that keeps its socket full cannot starve the others. While any
//!   client still has unread input the wait does not block.
//! - `writable` is set by a writable event and cleared when a send would
//!   block, so the write interest set is exactly the clients whose flag is
//!   set.
//!
//! Each turn accepts, then reads, then runs one flush pass over the
//! registry. Sends never happen from inside the read path, so a slow reader
//! only ever delays itself.

use crate::config::Config;
use crate::runtime::buffer::LineTooLong;
use crate::runtime::connection::ClientRegistry;
use crate::runtime::protocol::Notice;
use crate::runtime::token::LISTENER;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token};
use std::io::{self, Read};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Why a client is being removed.
#[derive(Debug, thiserror::Error)]
enum Departure {
    #[error("end of stream")]
    Eof,
    #[error("read failed: {0}")]
    Read(io::Error),
    #[error("write failed: {0}")]
    Write(io::Error),
    #[error(transparent)]
    Overlong(LineTooLong),
}

/// Single-threaded relay driven by a mio `Poll`.
pub struct EventLoop {
    poll: Poll,
    events: Events,
    relay: Relay,
}

/// Everything the loop mutates while dispatching events.
struct Relay {
    listener: TcpListener,
    clients: ClientRegistry<TcpStream>,
    read_buf: Vec<u8>,
    reads_per_turn: usize,
}

impl EventLoop {
    /// Wrap a bound, listening socket and register it with a new poller.
    pub fn new(listener: std::net::TcpListener, config: &Config) -> io::Result<Self> {
        listener.set_nonblocking(true)?;
        let mut listener = TcpListener::from_std(listener);

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        Ok(Self {
            poll,
            events: Events::with_capacity(config.event_capacity),
            relay: Relay {
                listener,
                clients: ClientRegistry::new(config.max_line_len),
                read_buf: vec![0u8; config.read_chunk_size],
                reads_per_turn: config.reads_per_turn,
            },
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.relay.listener.local_addr()
    }

    /// Serve clients until the readiness wait fails.
    pub fn run(&mut self) -> io::Result<()> {
        info!(
            addr = %self.local_addr()?,
            read_chunk_size = self.relay.read_buf.len(),
            reads_per_turn = self.relay.reads_per_turn,
            "Relay loop started"
        );

        loop {
            self.turn()?;
        }
    }

    /// Wait for readiness once, dispatch every event, read, then flush.
    fn turn(&mut self) -> io::Result<()> {
        let timeout = if self.relay.has_unread_input() {
            Some(Duration::ZERO)
        } else {
            None
        };

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        let registry = self.poll.registry();
        for event in self.events.iter() {
            match event.token() {
                LISTENER => self.relay.accept(registry),
                token => {
                    if event.is_readable() || event.is_error() {
                        self.relay.mark_readable(token);
                    }
                    if event.is_writable() {
                        self.relay.mark_writable(token);
                    }
                }
            }
        }

        self.relay.read_ready(registry);
        self.relay.flush(registry);
        Ok(())
    }
}

impl Relay {
    /// Accept every pending connection.
    fn accept(&mut self, registry: &Registry) {
        loop {
            let (stream, peer) = match self.listener.accept() {
                Ok(pair) => pair,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    return;
                }
            };

            let client = self.clients.register(stream);
            let (token, id) = (client.token, client.id);

            if let Err(e) = registry.register(
                &mut client.stream,
                token,
                Interest::READABLE | Interest::WRITABLE,
            ) {
                warn!(client = %id, peer = %peer, error = %e, "Failed to register connection");
                self.clients.unregister(token);
                continue;
            }

            debug!(
                client = %id,
                token = token.0,
                peer = %peer,
                active = self.clients.len(),
                "Client arrived"
            );
            self.clients
                .broadcast(Some(token), Notice::Arrived(id).encode());
        }
    }

    fn has_unread_input(&self) -> bool {
        self.clients.all().any(|client| client.readable)
    }

    fn mark_readable(&mut self, token: Token) {
        if let Some(client) = self.clients.lookup(token) {
            client.readable = true;
        }
    }

    fn mark_writable(&mut self, token: Token) {
        if let Some(client) = self.clients.lookup(token) {
            client.writable = true;
        }
    }

    /// Service every client with unread input, in insertion order.
    fn read_ready(&mut self, registry: &Registry) {
        for token in self.clients.tokens() {
            if self.clients.lookup(token).is_some_and(|c| c.readable) {
                self.read(registry, token);
            }
        }
    }

    /// Read up to `reads_per_turn` chunks, relaying each completed line.
    fn read(&mut self, registry: &Registry, token: Token) {
        let mut reads = 0;
        while reads < self.reads_per_turn {
            let Some(client) = self.clients.lookup(token) else {
                return;
            };

            let n = match client.stream.read(&mut self.read_buf) {
                Ok(0) => return self.disconnect(registry, token, Departure::Eof),
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    client.readable = false;
                    return;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return self.disconnect(registry, token, Departure::Read(e)),
            };
            reads += 1;

            let from = client.id;
            let framed = client.inbound.feed(&self.read_buf[..n]);

            for line in framed.lines {
                trace!(client = %from, bytes = line.len(), "Relaying line");
                self.clients
                    .broadcast(Some(token), Notice::Line { from, line: &line[..] }.encode());
            }

            if let Some(e) = framed.overflow {
                return self.disconnect(registry, token, Departure::Overlong(e));
            }
        }
    }

    /// Drain the queue of every writable client.
    ///
    /// Tearing down a client whose send failed queues a departure notice for
    /// the others, so the pass repeats until no send fails.
    fn flush(&mut self, registry: &Registry) {
        while !self.clients.is_empty() {
            let failed = self.clients.flush_writable();
            if failed.is_empty() {
                return;
            }
            for (token, e) in failed {
                self.disconnect(registry, token, Departure::Write(e));
            }
        }
    }

    /// Remove a client, close its socket and tell everyone else.
    fn disconnect(&mut self, registry: &Registry, token: Token, reason: Departure) {
        let mut client = self.clients.depart(token);
        if let Err(e) = registry.deregister(&mut client.stream) {
            debug!(client = %client.id, error = %e, "Deregister failed");
        }

        match reason {
            Departure::Eof => debug!(client = %client.id, "Client left"),
            Departure::Write(_) => warn!(
                client = %client.id,
                reason = %reason,
                "Disconnecting client"
            ),
            _ => debug!(
                client = %client.id,
                reason = %reason,
                dropped = client.outbound.len(),
                partial = client.inbound.pending().len(),
                "Disconnecting client"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::bind_listener;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpStream as StdStream;
    use std::thread;
    use std::time::Duration;

    fn spawn_relay(config: Config) -> SocketAddr {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), config.backlog).unwrap();
        let mut event_loop = EventLoop::new(listener, &config).unwrap();
        let addr = event_loop.local_addr().unwrap();
        thread::spawn(move || {
            let _ = event_loop.run();
        });
        addr
    }

    fn default_config() -> Config {
        Config::from_args(["line-relay", "0"]).unwrap()
    }

    struct Peer {
        reader: BufReader<StdStream>,
    }

    impl Peer {
        fn connect(addr: SocketAddr) -> Self {
            let stream = StdStream::connect(addr).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            Self {
                reader: BufReader::new(stream),
            }
        }

        fn send(&mut self, data: &[u8]) {
            self.reader.get_mut().write_all(data).unwrap();
        }

        fn recv(&mut self) -> Vec<u8> {
            let mut line = Vec::new();
            self.reader.read_until(b'\n', &mut line).unwrap();
            line
        }

        fn recv_str(&mut self) -> String {
            String::from_utf8(self.recv()).unwrap()
        }

        fn expect_silence(&mut self) {
            self.reader
                .get_ref()
                .set_read_timeout(Some(Duration::from_millis(200)))
                .unwrap();
            let mut buf = [0u8; 64];
            match self.reader.read(&mut buf) {
                Err(e)
                    if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
                other => panic!("expected no data, got {:?}", other),
            }
            self.reader
                .get_ref()
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
        }
    }

    #[test]
    fn test_arrive_relay_leave() {
        let addr = spawn_relay(default_config());

        let mut x = Peer::connect(addr);
        let mut y = Peer::connect(addr);
        assert_eq!(x.recv_str(), "server: client 1 just arrived\n");

        y.send(b"hi\n");
        assert_eq!(x.recv_str(), "client 1: hi\n");

        drop(y);
        assert_eq!(x.recv_str(), "server: client 1 just left\n");
        x.expect_silence();
    }

    #[test]
    fn test_arrival_fans_out_to_all_others() {
        let addr = spawn_relay(default_config());

        let mut x = Peer::connect(addr);
        let mut y = Peer::connect(addr);
        assert_eq!(x.recv_str(), "server: client 1 just arrived\n");

        let mut z = Peer::connect(addr);
        assert_eq!(x.recv_str(), "server: client 2 just arrived\n");
        assert_eq!(y.recv_str(), "server: client 2 just arrived\n");

        z.send(b"to everyone\n");
        assert_eq!(x.recv_str(), "client 2: to everyone\n");
        assert_eq!(y.recv_str(), "client 2: to everyone\n");
        z.expect_silence();
    }

    #[test]
    fn test_sender_never_sees_own_line() {
        let addr = spawn_relay(default_config());

        let mut x = Peer::connect(addr);
        let mut y = Peer::connect(addr);
        assert_eq!(x.recv_str(), "server: client 1 just arrived\n");

        y.send(b"hi\n");
        assert_eq!(x.recv_str(), "client 1: hi\n");

        x.send(b"yo\n");
        assert_eq!(y.recv_str(), "client 0: yo\n");
    }

    #[test]
    fn test_line_split_across_writes() {
        let addr = spawn_relay(default_config());

        let mut x = Peer::connect(addr);
        let mut y = Peer::connect(addr);
        assert_eq!(x.recv_str(), "server: client 1 just arrived\n");

        y.send(b"hel");
        thread::sleep(Duration::from_millis(50));
        y.send(b"lo\n");
        assert_eq!(x.recv_str(), "client 1: hello\n");
    }

    #[test]
    fn test_many_lines_in_one_write() {
        let addr = spawn_relay(default_config());

        let mut x = Peer::connect(addr);
        let mut y = Peer::connect(addr);
        assert_eq!(x.recv_str(), "server: client 1 just arrived\n");

        y.send(b"a\nb\n");
        assert_eq!(x.recv_str(), "client 1: a\n");
        assert_eq!(x.recv_str(), "client 1: b\n");
    }

    #[test]
    fn test_long_line_in_small_chunks() {
        let mut config = default_config();
        config.read_chunk_size = 8;
        let addr = spawn_relay(config);

        let mut x = Peer::connect(addr);
        let mut y = Peer::connect(addr);
        assert_eq!(x.recv_str(), "server: client 1 just arrived\n");

        let payload: Vec<u8> = (0..256 * 1024).map(|i| b'a' + (i % 26) as u8).collect();
        let mut line = payload.clone();
        line.push(b'\n');

        let writer = thread::spawn(move || {
            y.send(&line);
            y
        });

        let mut expected = b"client 1: ".to_vec();
        expected.extend_from_slice(&payload);
        expected.push(b'\n');
        assert_eq!(x.recv(), expected);

        drop(writer.join().unwrap());
        assert_eq!(x.recv_str(), "server: client 1 just left\n");
    }

    #[test]
    fn test_ids_not_reused_after_disconnect() {
        let addr = spawn_relay(default_config());

        let mut x = Peer::connect(addr);
        let y = Peer::connect(addr);
        assert_eq!(x.recv_str(), "server: client 1 just arrived\n");

        drop(y);
        assert_eq!(x.recv_str(), "server: client 1 just left\n");

        let _z = Peer::connect(addr);
        assert_eq!(x.recv_str(), "server: client 2 just arrived\n");
    }

    #[test]
    fn test_overlong_line_disconnects_only_sender() {
        let mut config = default_config();
        config.max_line_len = 16;
        let addr = spawn_relay(config);

        let mut x = Peer::connect(addr);
        let mut y = Peer::connect(addr);
        let mut z = Peer::connect(addr);
        assert_eq!(x.recv_str(), "server: client 1 just arrived\n");
        assert_eq!(x.recv_str(), "server: client 2 just arrived\n");
        assert_eq!(y.recv_str(), "server: client 2 just arrived\n");

        y.send(&[b'x'; 64]);
        assert_eq!(x.recv_str(), "server: client 1 just left\n");
        assert_eq!(z.recv_str(), "server: client 1 just left\n");

        z.send(b"still here\n");
        assert_eq!(x.recv_str(), "client 2: still here\n");
    }

    #[test]
    fn test_lines_before_overlong_line_are_relayed() {
        let mut config = default_config();
        config.max_line_len = 16;
        let addr = spawn_relay(config);

        let mut x = Peer::connect(addr);
        let mut y = Peer::connect(addr);
        assert_eq!(x.recv_str(), "server: client 1 just arrived\n");

        y.send(b"ok\nabcdefghijklmnopqrstuvwxyz\n");
        assert_eq!(x.recv_str(), "client 1: ok\n");
        assert_eq!(x.recv_str(), "server: client 1 just left\n");
        x.expect_silence();
    }

    fn numbered_line(i: usize) -> Vec<u8> {
        let mut line = format!("{i:06}").into_bytes();
        line.resize(4096, b'a' + (i % 26) as u8);
        line.push(b'\n');
        line
    }

    #[test]
    fn test_stalled_receiver_does_not_block_others() {
        const LINES: usize = 2000;
        let addr = spawn_relay(default_config());

        // x never reads until the burst is over.
        let mut x = Peer::connect(addr);
        let mut y = Peer::connect(addr);
        let mut z = Peer::connect(addr);
        assert_eq!(y.recv_str(), "server: client 2 just arrived\n");

        let writer = thread::spawn(move || {
            for i in 0..LINES {
                z.send(&numbered_line(i));
            }
            z
        });

        for i in 0..LINES {
            let mut expected = b"client 2: ".to_vec();
            expected.extend_from_slice(&numbered_line(i));
            assert_eq!(y.recv(), expected, "line {i} to the reading client");
        }
        let _z = writer.join().unwrap();

        assert_eq!(x.recv_str(), "server: client 1 just arrived\n");
        assert_eq!(x.recv_str(), "server: client 2 just arrived\n");
        for i in 0..LINES {
            let mut expected = b"client 2: ".to_vec();
            expected.extend_from_slice(&numbered_line(i));
            assert_eq!(x.recv(), expected, "line {i} to the stalled client");
        }
    }

    #[test]
    fn test_flooding_sender_does_not_starve_others() {
        let mut config = default_config();
        config.read_chunk_size = 8;
        config.reads_per_turn = 1;
        let addr = spawn_relay(config);

        let mut x = Peer::connect(addr);
        let mut y = Peer::connect(addr);
        let mut z = Peer::connect(addr);
        assert_eq!(x.recv_str(), "server: client 1 just arrived\n");
        assert_eq!(x.recv_str(), "server: client 2 just arrived\n");
        assert_eq!(y.recv_str(), "server: client 2 just arrived\n");

        // One unterminated line, far larger than a single turn can read.
        thread::spawn(move || {
            let flood = vec![b'f'; 4 * 1024 * 1024];
            let _ = y.reader.get_mut().write_all(&flood);
            y
        });
        thread::sleep(Duration::from_millis(50));

        z.send(b"hi\n");
        assert_eq!(x.recv_str(), "client 2: hi\n");
    }
}
