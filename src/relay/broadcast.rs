//! Fan-out of one message to every other connected client.
//!
//! Only peers whose last readiness report allowed writing are tried. Peers
//! lose whole messages, never parts of one: if a socket takes only part of a
//! message, the rest is parked in the connection's outbox and flushed once
//! the poller reports it writable again. While an outbox is non-empty the
//! peer skips new messages. Failures on one peer never stop delivery to the
//! others.

use crate::relay::connection::{Connection, ConnectionRegistry};
use crate::relay::token::Handle;
use bytes::Buf;
use std::io::{self, Write};
use tracing::{debug, trace};

/// Per-broadcast delivery counts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    /// Peers that received the whole message.
    pub delivered: usize,
    /// Peers that took part of the message; the rest waits in their outbox.
    pub queued: usize,
    /// Peers that were not writable or still had an outbox to drain.
    pub skipped: usize,
    /// Peers whose write returned an error.
    pub failed: usize,
}

enum SendOutcome {
    Complete,
    Blocked { written: usize },
    Failed(io::Error),
}

/// Send `message` to every registered connection except `excluded`.
pub fn broadcast<S: Write>(
    registry: &mut ConnectionRegistry<S>,
    message: &[u8],
    excluded: Option<Handle>,
) -> Delivery {
    let mut delivery = Delivery::default();

    for (handle, conn) in registry.iter_mut() {
        if Some(handle) == excluded {
            continue;
        }
        if !conn.writable || !flush_outbox(handle, conn) {
            delivery.skipped += 1;
            continue;
        }

        match send(&mut conn.stream, message) {
            SendOutcome::Complete => delivery.delivered += 1,
            SendOutcome::Blocked { written: 0 } => {
                trace!(%handle, id = %conn.id, len = message.len(), "Peer not writable");
                conn.writable = false;
                delivery.skipped += 1;
            }
            SendOutcome::Blocked { written } => {
                trace!(%handle, id = %conn.id, written, len = message.len(), "Message parked");
                conn.writable = false;
                conn.outbox.extend_from_slice(&message[written..]);
                delivery.queued += 1;
            }
            SendOutcome::Failed(e) => {
                debug!(%handle, id = %conn.id, error = %e, "Send failed");
                delivery.failed += 1;
            }
        }
    }

    delivery
}

/// Write out whatever is parked in `conn`'s outbox.
///
/// Returns `true` once the outbox is empty. A write error discards the
/// parked bytes; the read side reports the broken connection.
pub fn flush_outbox<S: Write>(handle: Handle, conn: &mut Connection<S>) -> bool {
    if conn.outbox.is_empty() {
        return true;
    }

    match send(&mut conn.stream, &conn.outbox) {
        SendOutcome::Complete => {
            conn.outbox.clear();
            true
        }
        SendOutcome::Blocked { written } => {
            conn.outbox.advance(written);
            conn.writable = false;
            false
        }
        SendOutcome::Failed(e) => {
            debug!(%handle, id = %conn.id, error = %e, "Outbox flush failed");
            conn.outbox.clear();
            true
        }
    }
}

/// Write as much of `message` as the socket takes without blocking.
fn send<S: Write>(stream: &mut S, message: &[u8]) -> SendOutcome {
    let mut written = 0;
    while written < message.len() {
        match stream.write(&message[written..]) {
            Ok(0) => return SendOutcome::Failed(io::ErrorKind::WriteZero.into()),
            Ok(n) => written += n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                return SendOutcome::Blocked { written };
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return SendOutcome::Failed(e),
        }
    }
    SendOutcome::Complete
}
