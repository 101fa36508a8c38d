//! Newline framing for a single connection's byte stream.
//!
//! Reads arrive in arbitrary chunks. The framer accumulates them and cuts a
//! line every time it sees `\n`; whatever follows the last newline stays
//! behind as residue until a later read completes it. Lines keep their
//! trailing newline and there is no length limit.

use bytes::{Bytes, BytesMut};

const NEWLINE: u8 = b'\n';

/// Per-connection line splitter.
#[derive(Debug, Default)]
pub struct LineFramer {
    /// Bytes not yet terminated by a newline, plus any lines not yet taken.
    pending: BytesMut,
    /// Prefix of `pending` already known to contain no newline.
    scanned: usize,
}

impl LineFramer {
    /// Create an empty framer.
    pub fn new() -> Self {
        Self {
            pending: BytesMut::new(),
            scanned: 0,
        }
    }

    /// Append freshly read bytes.
    pub fn push(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
    }

    /// Cut the next complete line, newline included.
    ///
    /// Returns `None` when the remaining bytes hold no newline; they stay
    /// buffered for the next `push`.
    pub fn next_line(&mut self) -> Option<Bytes> {
        match find_newline(&self.pending[self.scanned..]) {
            Some(offset) => {
                let end = self.scanned + offset + 1;
                self.scanned = 0;
                Some(self.pending.split_to(end).freeze())
            }
            None => {
                self.scanned = self.pending.len();
                None
            }
        }
    }

    /// Push `data` and take every line it completes, in order.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.push(data);
        let mut lines = Vec::new();
        while let Some(line) = self.next_line() {
            lines.push(line);
        }
        lines
    }

    /// Residue waiting for a newline.
    #[cfg(test)]
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    /// Number of residue bytes.
    #[cfg(test)]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Drain the residue, leaving the framer empty.
    pub fn take_pending(&mut self) -> Bytes {
        self.scanned = 0;
        self.pending.split().freeze()
    }
}

fn find_newline(buf: &[u8]) -> Option<usize> {
    buf.iter().position(|&b| b == NEWLINE)
}
