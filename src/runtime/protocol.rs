//! Relay wire format.
//!
//! Clients send raw newline-terminated lines. The server only ever sends
//! one of three messages:
//!
//! ```text
//! server: client <id> just arrived\n
//! server: client <id> just left\n
//! client <id>: <line>\n
//! ```
//!
//! Each message is encoded once into an immutable `Bytes` and shared by
//! reference count across every recipient queue.

use crate::runtime::token::ClientId;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt::Write;

/// A server-to-client message before encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice<'a> {
    /// A new client was accepted.
    Arrived(ClientId),
    /// A client disconnected or was torn down.
    Left(ClientId),
    /// A complete line relayed from a client, without its newline.
    Line { from: ClientId, line: &'a [u8] },
}

impl Notice<'_> {
    /// Encode into the exact bytes placed on the wire.
    pub fn encode(&self) -> Bytes {
        match *self {
            Notice::Arrived(id) => server_notice(id, "just arrived"),
            Notice::Left(id) => server_notice(id, "just left"),
            Notice::Line { from, line } => {
                let mut buf = BytesMut::with_capacity(line.len() + 32);
                // Writing to BytesMut is infallible.
                let _ = write!(buf, "client {from}: ");
                buf.put_slice(line);
                buf.put_u8(b'\n');
                buf.freeze()
            }
        }
    }
}

fn server_notice(id: ClientId, event: &str) -> Bytes {
    Bytes::from(format!("server: client {id} {event}\n"))
}
