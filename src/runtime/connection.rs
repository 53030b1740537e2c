//! Client state and the registry of active clients.
//!
//! Each client tracks its display identifier, socket, partial inbound line
//! and queue of outbound messages. The registry owns all clients, keyed by
//! their poll token, and remembers insertion order so broadcast fan-out is
//! deterministic.

use crate::runtime::buffer::{FlushStatus, LineFramer, OutboundQueue};
use crate::runtime::protocol::Notice;
use crate::runtime::token::{ClientId, IdAllocator};
use bytes::Bytes;
use mio::Token;
use slab::Slab;
use std::io::{self, Write};
use tracing::trace;

/// A single connected client.
#[derive(Debug)]
pub struct Client<S> {
    /// Poll token; the registry key for this client.
    pub token: Token,
    /// Display identifier, unique for the lifetime of the process.
    pub id: ClientId,
    /// Underlying connection.
    pub stream: S,
    /// Unterminated tail of the current inbound line.
    pub inbound: LineFramer,
    /// Messages waiting to be written to this client.
    pub outbound: OutboundQueue,
    /// Whether the socket may still hold unread bytes.
    pub readable: bool,
    /// Whether the last readiness edge said the socket accepts writes.
    pub writable: bool,
}

/// Registry of active clients using slab allocation.
///
/// Provides O(1) insert and lookup. Removal is linear in the number of
/// clients because the insertion order list has to be kept in step.
#[derive(Debug)]
pub struct ClientRegistry<S> {
    clients: Slab<Client<S>>,
    /// Slab keys in insertion order.
    order: Vec<usize>,
    ids: IdAllocator,
    max_line_len: usize,
}

impl<S> ClientRegistry<S> {
    /// Create an empty registry. New clients get framers limited to
    /// `max_line_len` bytes (0 = unbounded).
    pub fn new(max_line_len: usize) -> Self {
        Self {
            clients: Slab::new(),
            order: Vec::new(),
            ids: IdAllocator::new(),
            max_line_len,
        }
    }

    /// Register a new connection and assign it the next identifier.
    pub fn register(&mut self, stream: S) -> &mut Client<S> {
        let entry = self.clients.vacant_entry();
        let key = entry.key();
        self.order.push(key);

        entry.insert(Client {
            token: Token(key),
            id: self.ids.allocate(),
            stream,
            inbound: LineFramer::new(self.max_line_len),
            outbound: OutboundQueue::new(),
            readable: false,
            writable: false,
        })
    }

    /// Remove a client and hand it back for teardown.
    ///
    /// # Panics
    /// Panics if `token` does not belong to a registered client. That means
    /// the registry and the poller disagree about which sockets are live.
    pub fn unregister(&mut self, token: Token) -> Client<S> {
        let client = self
            .clients
            .try_remove(token.0)
            .unwrap_or_else(|| panic!("unregister of unknown client {token:?}"));
        self.order.retain(|&key| key != token.0);
        client
    }

    /// Remove a client and queue its departure notice for everyone left.
    ///
    /// Messages still queued for the departing client are dropped with it.
    pub fn depart(&mut self, token: Token) -> Client<S> {
        let client = self.unregister(token);
        self.broadcast(None, Notice::Left(client.id).encode());
        client
    }

    /// Get a mutable reference to a client.
    pub fn lookup(&mut self, token: Token) -> Option<&mut Client<S>> {
        self.clients.get_mut(token.0)
    }

    /// Iterate over all clients in insertion order.
    pub fn all(&self) -> impl Iterator<Item = &Client<S>> + '_ {
        self.order.iter().map(move |&key| &self.clients[key])
    }

    /// Tokens of all clients in insertion order.
    pub fn tokens(&self) -> Vec<Token> {
        self.all().map(|client| client.token).collect()
    }

    /// Queue `message` for every client except `exclude`, in insertion order.
    ///
    /// Returns the number of recipients.
    pub fn broadcast(&mut self, exclude: Option<Token>, message: Bytes) -> usize {
        let mut recipients = 0;
        for &key in &self.order {
            if exclude == Some(Token(key)) {
                continue;
            }
            self.clients[key].outbound.enqueue(message.clone());
            recipients += 1;
        }
        recipients
    }

    /// Number of active clients.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Check if there are no clients.
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

impl<S: Write> ClientRegistry<S> {
    /// Drain the queue of every writable client, in insertion order.
    ///
    /// A client whose socket would block loses its `writable` flag until the
    /// next writable event. Clients whose send failed are returned with the
    /// error and left registered; the caller decides how to tear them down.
    pub fn flush_writable(&mut self) -> Vec<(Token, io::Error)> {
        let mut failed = Vec::new();

        for &key in &self.order {
            let client = &mut self.clients[key];
            if !client.writable || client.outbound.is_empty() {
                continue;
            }

            match client.outbound.flush(&mut client.stream) {
                Ok(FlushStatus::Drained) => {
                    trace!(client = %client.id, "Queue drained");
                }
                Ok(FlushStatus::Blocked) => {
                    trace!(
                        client = %client.id,
                        queued = client.outbound.len(),
                        pending_bytes = client.outbound.pending_bytes(),
                        "Send would block"
                    );
                    client.writable = false;
                }
                Err(e) => failed.push((client.token, e)),
            }
        }

        failed
    }
}
