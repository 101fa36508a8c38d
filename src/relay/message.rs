//! Server-to-client wire formats.
//!
//! ```text
//! server: client <id> just arrived\n
//! server: client <id> just left\n
//! client <id>: <line, including its own \n>
//! ```

use super::token::ClientId;
use bytes::{BufMut, Bytes, BytesMut};

/// Notice sent to everyone else when a client connects.
pub fn arrival(id: ClientId) -> Bytes {
    Bytes::from(format!("server: client {id} just arrived\n"))
}

/// Notice sent to the remaining clients when one disconnects.
pub fn departure(id: ClientId) -> Bytes {
    Bytes::from(format!("server: client {id} just left\n"))
}

/// Tag a completed line with its sender.
///
/// `line` is relayed verbatim; it already ends in a newline.
pub fn relayed(id: ClientId, line: &[u8]) -> Bytes {
    let prefix = format!("client {id}: ");
    let mut msg = BytesMut::with_capacity(prefix.len() + line.len());
    msg.put_slice(prefix.as_bytes());
    msg.put_slice(line);
    msg.freeze()
}
