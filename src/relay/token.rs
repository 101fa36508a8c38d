//! Connection handles and display identities.
//!
//! A `Handle` addresses a connection inside the registry and doubles as its
//! poll token. A `ClientId` is what peers see in relayed messages; ids come
//! from a process-wide counter and are never handed out twice.

use std::fmt;

/// Registry slot of a live connection; also its `mio::Token`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(pub usize);

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity shown to other clients, e.g. the `3` in `client 3: hi`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Strictly increasing id source.
///
/// Unlike slab keys, ids are not recycled when a client leaves.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next: u64,
}

impl IdAllocator {
    /// Create an allocator whose first id is 0.
    pub fn new() -> Self {
        Self { next: 0 }
    }

    /// Hand out the next id.
    ///
    /// Returns `None` once the counter is exhausted.
    pub fn alloc(&mut self) -> Option<ClientId> {
        let id = self.next;
        self.next = self.next.checked_add(1)?;
        Some(ClientId(id))
    }

    /// Id the next successful `alloc` will return.
    #[cfg(test)]
    pub fn peek(&self) -> ClientId {
        ClientId(self.next)
    }

    #[cfg(test)]
    pub fn starting_at(next: u64) -> Self {
        Self { next }
    }
}
