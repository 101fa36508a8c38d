//! Live connection tracking.
//!
//! The registry owns every client stream together with its line framer and
//! write-readiness flag. Entering or leaving the registry always goes through
//! the multiplexer's watch set in the same call, so a handle is watched if and
//! only if it is registered.

use crate::error::RelayError;
use crate::relay::framer::LineFramer;
use crate::relay::token::{ClientId, Handle, IdAllocator};
use bytes::BytesMut;
use slab::Slab;
use std::io;
use tracing::debug;

/// The multiplexer's set of watched streams.
///
/// Implemented by `mio::Registry` in production and by a recording fake in
/// tests.
pub trait WatchSet<S> {
    /// Start reporting read and write readiness for `stream` under `handle`.
    fn watch(&mut self, handle: Handle, stream: &mut S) -> io::Result<()>;

    /// Stop reporting readiness for `stream`.
    fn unwatch(&mut self, handle: Handle, stream: &mut S) -> io::Result<()>;
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection<S> {
    /// Display identity assigned at accept time.
    pub id: ClientId,
    /// The client socket. Dropping the connection closes it.
    pub stream: S,
    /// Residue of the client's byte stream.
    pub framer: LineFramer,
    /// Whether the last readiness report allows writing.
    pub writable: bool,
    /// Unsent tail of a message the socket only partly accepted.
    pub outbox: BytesMut,
}

impl<S> Connection<S> {
    /// A freshly accepted socket has an empty send buffer, so it starts out
    /// writable.
    pub fn new(id: ClientId, stream: S) -> Self {
        Self {
            id,
            stream,
            framer: LineFramer::new(),
            writable: true,
            outbox: BytesMut::new(),
        }
    }
}

/// Registry of active connections using slab allocation.
///
/// Handles are slab keys and may be reused after a departure; ids never are.
pub struct ConnectionRegistry<S> {
    connections: Slab<Connection<S>>,
    ids: IdAllocator,
}

impl<S> Default for ConnectionRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> ConnectionRegistry<S> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::with_ids(IdAllocator::new())
    }

    fn with_ids(ids: IdAllocator) -> Self {
        Self {
            connections: Slab::new(),
            ids,
        }
    }

    /// Admit `stream`: assign the next id and start watching it.
    ///
    /// Nothing is inserted if the watch set refuses the stream.
    pub fn register<W>(
        &mut self,
        mut stream: S,
        watch: &mut W,
    ) -> Result<(Handle, ClientId), RelayError>
    where
        W: WatchSet<S> + ?Sized,
    {
        let entry = self.connections.vacant_entry();
        let handle = Handle(entry.key());

        watch
            .watch(handle, &mut stream)
            .map_err(RelayError::Watch)?;

        let id = match self.ids.alloc() {
            Some(id) => id,
            None => {
                if let Err(e) = watch.unwatch(handle, &mut stream) {
                    debug!(%handle, error = %e, "Unwatch failed");
                }
                return Err(RelayError::IdsExhausted);
            }
        };

        entry.insert(Connection::new(id, stream));
        Ok((handle, id))
    }

    /// Remove `handle`, stop watching it and hand back the connection.
    ///
    /// The caller drops the returned value to close the socket. Returns
    /// `None` if the handle is not registered.
    pub fn deregister<W>(&mut self, handle: Handle, watch: &mut W) -> Option<Connection<S>>
    where
        W: WatchSet<S> + ?Sized,
    {
        let mut conn = self.connections.try_remove(handle.0)?;
        if let Err(e) = watch.unwatch(handle, &mut conn.stream) {
            debug!(%handle, error = %e, "Unwatch failed");
        }
        Some(conn)
    }

    /// Deregister and close every connection. Returns how many were open.
    pub fn clear<W>(&mut self, watch: &mut W) -> usize
    where
        W: WatchSet<S> + ?Sized,
    {
        let handles = self.handles();
        let count = handles.len();
        for handle in handles {
            drop(self.deregister(handle, watch));
        }
        count
    }

    /// Get an immutable reference to a connection.
    #[cfg(test)]
    pub fn get(&self, handle: Handle) -> Option<&Connection<S>> {
        self.connections.get(handle.0)
    }

    /// Get a mutable reference to a connection.
    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut Connection<S>> {
        self.connections.get_mut(handle.0)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if there are no connections.
    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Snapshot of the registered handles, ascending.
    ///
    /// Safe to iterate while registering or deregistering.
    pub fn handles(&self) -> Vec<Handle> {
        self.connections.iter().map(|(key, _)| Handle(key)).collect()
    }

    /// Iterate over all connections mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Handle, &mut Connection<S>)> {
        self.connections
            .iter_mut()
            .map(|(key, conn)| (Handle(key), conn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::testing::{MockPeer, MockStream, RecordingWatch};

    #[test]
    fn test_register_assigns_sequential_ids() {
        let mut watch = RecordingWatch::default();
        let mut registry = ConnectionRegistry::new();

        let (h0, id0) = registry.register(MockStream::new(), &mut watch).unwrap();
        let (h1, id1) = registry.register(MockStream::new(), &mut watch).unwrap();

        assert_eq!((id0, id1), (ClientId(0), ClientId(1)));
        assert_ne!(h0, h1);
        assert_eq!(registry.len(), 2);
        assert!(registry.get(h0).unwrap().writable);
        assert!(watch.is_watching(h0) && watch.is_watching(h1));
    }

    #[test]
    fn test_ids_not_reused_after_departure() {
        let mut watch = RecordingWatch::default();
        let mut registry = ConnectionRegistry::new();

        let (h0, _) = registry.register(MockStream::new(), &mut watch).unwrap();
        let (_, id1) = registry.register(MockStream::new(), &mut watch).unwrap();
        let gone = registry.deregister(h0, &mut watch).unwrap();
        let (h2, id2) = registry.register(MockStream::new(), &mut watch).unwrap();

        assert_eq!(gone.id, ClientId(0));
        // The slab slot comes back, the id does not.
        assert_eq!(h2, h0);
        assert!(id2 > id1);
        assert_eq!(id2, ClientId(2));
    }

    #[test]
    fn test_registry_and_watch_set_stay_in_step() {
        let mut watch = RecordingWatch::default();
        let mut registry = ConnectionRegistry::new();

        let handles: Vec<_> = (0..5)
            .map(|_| registry.register(MockStream::new(), &mut watch).unwrap().0)
            .collect();
        registry.deregister(handles[1], &mut watch);
        registry.deregister(handles[3], &mut watch);

        let mut registered = registry.handles();
        registered.sort();
        assert_eq!(registered, watch.watched());
        assert!(registry.get(handles[1]).is_none());
        assert!(registry.get(handles[3]).is_none());
    }

    #[test]
    fn test_failed_watch_inserts_nothing() {
        let mut watch = RecordingWatch::default();
        watch.fail_next_watch();
        let mut registry: ConnectionRegistry<MockStream> = ConnectionRegistry::new();

        let result = registry.register(MockStream::new(), &mut watch);

        assert!(matches!(result, Err(RelayError::Watch(_))));
        assert!(registry.is_empty());
        assert!(watch.watched().is_empty());

        // The failed attempt did not burn an id.
        let (_, id) = registry.register(MockStream::new(), &mut watch).unwrap();
        assert_eq!(id, ClientId(0));
    }

    #[test]
    fn test_id_exhaustion_rolls_back() {
        let mut watch = RecordingWatch::default();
        let mut registry = ConnectionRegistry::with_ids(IdAllocator::starting_at(u64::MAX));
        let (stream, peer) = MockStream::pair();

        let result = registry.register(stream, &mut watch);

        assert!(matches!(result, Err(RelayError::IdsExhausted)));
        assert!(registry.is_empty());
        assert!(watch.watched().is_empty());
        assert_eq!(watch.unwatch_calls(), 1);
        assert!(peer.is_closed());
    }

    #[test]
    fn test_deregister_twice() {
        let mut watch = RecordingWatch::default();
        let mut registry = ConnectionRegistry::new();

        let (h, _) = registry.register(MockStream::new(), &mut watch).unwrap();

        assert!(registry.deregister(h, &mut watch).is_some());
        assert!(registry.deregister(h, &mut watch).is_none());
        assert_eq!(watch.unwatch_calls(), 1);
    }

    #[test]
    fn test_deregister_closes_stream() {
        let mut watch = RecordingWatch::default();
        let mut registry = ConnectionRegistry::new();
        let (stream, peer) = MockStream::pair();

        let (h, _) = registry.register(stream, &mut watch).unwrap();
        assert!(!peer.is_closed());

        drop(registry.deregister(h, &mut watch));
        assert!(peer.is_closed());
    }

    #[test]
    fn test_clear_releases_everything() {
        let mut watch = RecordingWatch::default();
        let mut registry = ConnectionRegistry::new();
        let mut peers = Vec::new();

        for _ in 0..3 {
            let (stream, peer) = MockStream::pair();
            registry.register(stream, &mut watch).unwrap();
            peers.push(peer);
        }

        assert_eq!(registry.clear(&mut watch), 3);
        assert!(registry.is_empty());
        assert!(watch.watched().is_empty());
        assert!(peers.iter().all(MockPeer::is_closed));
    }

    #[test]
    fn test_snapshot_survives_mutation() {
        let mut watch = RecordingWatch::default();
        let mut registry = ConnectionRegistry::new();
        for _ in 0..4 {
            registry.register(MockStream::new(), &mut watch).unwrap();
        }

        let mut seen = Vec::new();
        for handle in registry.handles() {
            seen.push(handle);
            registry.deregister(handle, &mut watch);
        }

        assert_eq!(seen, vec![Handle(0), Handle(1), Handle(2), Handle(3)]);
        assert!(registry.is_empty());
    }
}
