//! Client identifiers and poll tokens.
//!
//! Two kinds of identity exist for a connected client:
//! - `ClientId`: the display number shown to other clients. Allocated from a
//!   monotonically increasing counter and never reused within a run.
//! - `mio::Token`: the slab key used to correlate readiness events. Keys are
//!   recycled once a client leaves, so they are only unique among live clients.

use mio::Token;
use std::fmt;

/// Poll token reserved for the listening socket.
pub const LISTENER: Token = Token(usize::MAX);

/// Display identifier assigned to a client at accept time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Allocator for client identifiers.
///
/// Hands out 0, 1, 2, ... in call order. Freed identifiers are never
/// returned again, so a reconnecting peer always gets a fresh number.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next: u64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next identifier.
    pub fn allocate(&mut self) -> ClientId {
        let id = ClientId(self.next);
        self.next += 1;
        id
    }
}
