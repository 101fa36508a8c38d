//! Line relay engine.
//!
//! Single-threaded and readiness-based:
//! - `framer`: splits each client's byte stream into lines
//! - `connection`: registry of live clients, kept in step with the poller
//! - `broadcast`: fan-out of one message to every other client
//! - `message`: wire formats for notices and relayed lines
//! - `event_loop`: mio poll loop driving the pieces above
//!
//! `Relay` holds the state the event loop dispatches into. It is generic over
//! the stream type so it can be driven by in-memory streams in tests.

mod broadcast;
mod connection;
mod event_loop;
mod framer;
mod listener;
mod message;
mod token;

#[cfg(test)]
mod testing;

use broadcast::{broadcast, flush_outbox};
use connection::{ConnectionRegistry, WatchSet};
use event_loop::Server;
use token::Handle;

pub(crate) use token::ClientId;

use crate::config::{Config, ReadErrorPolicy};
use crate::error::RelayError;
use std::io::{self, Read, Write};
use tracing::{debug, info, trace, warn};

/// Reads taken from one client before the event loop moves on to others.
const READ_BUDGET: usize = 4;

/// Run the relay until a fatal error.
pub fn run(config: Config) -> Result<(), RelayError> {
    Server::bind(&config)?.run()
}

/// Whether a serviced source has more input waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Serviced {
    /// The source reported would-block or is gone.
    Drained,
    /// The read budget ran out; the source must be serviced again without
    /// waiting for a new readiness event.
    Pending,
}

/// Relay state owned by the event loop.
pub struct Relay<S> {
    registry: ConnectionRegistry<S>,
    recv_buf: Vec<u8>,
    read_errors: ReadErrorPolicy,
}

impl<S: Read + Write> Relay<S> {
    /// Create a relay reading at most `recv_buffer_size` bytes per read.
    pub fn new(recv_buffer_size: usize, read_errors: ReadErrorPolicy) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            recv_buf: vec![0u8; recv_buffer_size.max(1)],
            read_errors,
        }
    }

    /// Live connections.
    pub fn registry(&self) -> &ConnectionRegistry<S> {
        &self.registry
    }

    /// Register a newly accepted stream and announce it to everyone else.
    pub fn admit<W>(&mut self, stream: S, watch: &mut W) -> Result<(Handle, ClientId), RelayError>
    where
        W: WatchSet<S> + ?Sized,
    {
        let (handle, id) = self.registry.register(stream, watch)?;
        let delivery = broadcast(&mut self.registry, &message::arrival(id), Some(handle));
        debug!(%handle, %id, ?delivery, "Arrival announced");
        Ok((handle, id))
    }

    /// Record that the poller reported `handle` writable and send whatever
    /// was left over from an earlier partial write.
    pub fn mark_writable(&mut self, handle: Handle) {
        if let Some(conn) = self.registry.get_mut(handle) {
            conn.writable = true;
            if !flush_outbox(handle, conn) {
                trace!(%handle, id = %conn.id, left = conn.outbox.len(), "Outbox still blocked");
            }
        }
    }

    /// Read what is available on `handle`, relaying each completed line.
    ///
    /// At most `READ_BUDGET` reads are taken so one busy client cannot hold
    /// the loop. Readiness is only reported on change, so a `Pending` result
    /// obliges the caller to come back. End of stream deregisters the client
    /// and announces the departure. Unknown handles are ignored.
    pub fn service<W>(&mut self, handle: Handle, watch: &mut W) -> Result<Serviced, RelayError>
    where
        W: WatchSet<S> + ?Sized,
    {
        let mut reads = 0;
        while reads < READ_BUDGET {
            let Some(conn) = self.registry.get_mut(handle) else {
                return Ok(Serviced::Drained);
            };
            let id = conn.id;

            let lines = match conn.stream.read(&mut self.recv_buf) {
                Ok(0) => {
                    self.depart(handle, watch);
                    return Ok(Serviced::Drained);
                }
                Ok(n) => {
                    trace!(%handle, %id, bytes = n, "Read");
                    reads += 1;
                    conn.framer.feed(&self.recv_buf[..n])
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Serviced::Drained)
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => match self.read_errors {
                    ReadErrorPolicy::Fatal => return Err(RelayError::Read { id, source: e }),
                    ReadErrorPolicy::Disconnect => {
                        warn!(%handle, %id, error = %e, "Read failed, dropping client");
                        self.depart(handle, watch);
                        return Ok(Serviced::Drained);
                    }
                },
            };

            for line in lines {
                let msg = message::relayed(id, &line);
                let delivery = broadcast(&mut self.registry, &msg, Some(handle));
                debug!(%id, len = line.len(), ?delivery, "Line relayed");
            }
        }
        Ok(Serviced::Pending)
    }

    /// Deregister and close every connection. Returns how many were open.
    pub fn shutdown<W>(&mut self, watch: &mut W) -> usize
    where
        W: WatchSet<S> + ?Sized,
    {
        self.registry.clear(watch)
    }

    fn depart<W>(&mut self, handle: Handle, watch: &mut W)
    where
        W: WatchSet<S> + ?Sized,
    {
        let Some(mut conn) = self.registry.deregister(handle, watch) else {
            return;
        };
        let id = conn.id;
        let residue = conn.framer.take_pending();
        if !residue.is_empty() {
            trace!(%id, bytes = residue.len(), "Discarding unterminated residue");
        }
        drop(conn);

        let delivery = broadcast(&mut self.registry, &message::departure(id), None);
        info!(%handle, %id, remaining = self.registry.len(), ?delivery, "Client left");
    }
}
