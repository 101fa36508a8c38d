//! Runtime errors that end the relay.
//!
//! Every variant is fatal: the event loop stops, open connections are
//! released and the process exits non-zero.

use crate::relay::ClientId;
use std::io;

/// Unrecoverable relay failure.
#[derive(Debug)]
pub enum RelayError {
    /// Creating, binding or listening on the loopback socket failed.
    Listen(io::Error),
    /// Setting up the poller failed.
    Poll(io::Error),
    /// `accept` failed with something other than `WouldBlock`.
    Accept(io::Error),
    /// Adding an accepted socket to the watch set failed.
    Watch(io::Error),
    /// Reading from a client failed.
    Read { id: ClientId, source: io::Error },
    /// The client id counter ran out.
    IdsExhausted,
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayError::Listen(e) => write!(f, "Failed to open listening socket: {}", e),
            RelayError::Poll(e) => write!(f, "Failed to create poller: {}", e),
            RelayError::Accept(e) => write!(f, "Failed to accept connection: {}", e),
            RelayError::Watch(e) => write!(f, "Failed to watch connection: {}", e),
            RelayError::Read { id, source } => {
                write!(f, "Failed to read from client {}: {}", id, source)
            }
            RelayError::IdsExhausted => write!(f, "Client id space exhausted"),
        }
    }
}

impl std::error::Error for RelayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RelayError::Listen(e)
            | RelayError::Poll(e)
            | RelayError::Accept(e)
            | RelayError::Watch(e)
            | RelayError::Read { source: e, .. } => Some(e),
            RelayError::IdsExhausted => None,
        }
    }
}
