//! In-memory doubles for exercising the relay without sockets.

use crate::relay::connection::WatchSet;
use crate::relay::token::Handle;
use std::cell::RefCell;
use std::collections::{BTreeSet, VecDeque};
use std::io::{self, Read, Write};
use std::rc::Rc;

enum Incoming {
    Data(Vec<u8>),
    Eof,
    Fail(io::ErrorKind),
}

#[derive(Default)]
struct Shared {
    incoming: VecDeque<Incoming>,
    received: Vec<u8>,
    write_calls: usize,
    write_limit: Option<usize>,
    write_error: Option<io::ErrorKind>,
    closed: bool,
}

/// Server side of a fake connection. Reads drain what the peer queued and
/// report `WouldBlock` once the queue is empty.
pub struct MockStream {
    shared: Rc<RefCell<Shared>>,
}

/// Client side of a fake connection, kept by the test.
#[derive(Clone)]
pub struct MockPeer {
    shared: Rc<RefCell<Shared>>,
}

impl MockStream {
    /// A stream whose peer is never looked at.
    pub fn new() -> Self {
        Self::pair().0
    }

    /// A connected stream and its remote end.
    pub fn pair() -> (MockStream, MockPeer) {
        let shared = Rc::new(RefCell::new(Shared::default()));
        (
            MockStream {
                shared: Rc::clone(&shared),
            },
            MockPeer { shared },
        )
    }
}

impl Drop for MockStream {
    fn drop(&mut self) {
        self.shared.borrow_mut().closed = true;
    }
}

impl Read for MockStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut shared = self.shared.borrow_mut();
        match shared.incoming.pop_front() {
            None => Err(io::ErrorKind::WouldBlock.into()),
            Some(Incoming::Eof) => Ok(0),
            Some(Incoming::Fail(kind)) => Err(kind.into()),
            Some(Incoming::Data(mut data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    shared.incoming.push_front(Incoming::Data(data.split_off(n)));
                }
                Ok(n)
            }
        }
    }
}

impl Write for MockStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut shared = self.shared.borrow_mut();
        shared.write_calls += 1;
        if let Some(kind) = shared.write_error {
            return Err(kind.into());
        }
        let n = shared.write_limit.map_or(buf.len(), |limit| limit.min(buf.len()));
        if n == 0 && !buf.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        shared.received.extend_from_slice(&buf[..n]);
        if let Some(limit) = shared.write_limit.as_mut() {
            *limit -= n;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl MockPeer {
    /// Queue bytes for the server's next read.
    pub fn send(&self, data: &[u8]) {
        self.shared
            .borrow_mut()
            .incoming
            .push_back(Incoming::Data(data.to_vec()));
    }

    /// Queue an orderly close.
    pub fn hang_up(&self) {
        self.shared.borrow_mut().incoming.push_back(Incoming::Eof);
    }

    /// Queue a read failure.
    pub fn fail_read(&self, kind: io::ErrorKind) {
        self.shared
            .borrow_mut()
            .incoming
            .push_back(Incoming::Fail(kind));
    }

    /// Everything the server wrote to this peer so far.
    pub fn received(&self) -> Vec<u8> {
        self.shared.borrow().received.clone()
    }

    /// Received bytes as text, for readable assertions.
    pub fn received_text(&self) -> String {
        String::from_utf8_lossy(&self.shared.borrow().received).into_owned()
    }

    /// Number of `write` calls the server made.
    pub fn write_calls(&self) -> usize {
        self.shared.borrow().write_calls
    }

    /// Accept only `bytes` more bytes, then report `WouldBlock`.
    pub fn limit_writes(&self, bytes: usize) {
        self.shared.borrow_mut().write_limit = Some(bytes);
    }

    /// Make every write fail with `kind`.
    pub fn fail_writes(&self, kind: io::ErrorKind) {
        self.shared.borrow_mut().write_error = Some(kind);
    }

    /// Whether the server side has been dropped.
    pub fn is_closed(&self) -> bool {
        self.shared.borrow().closed
    }
}

/// Watch set that remembers which handles are watched.
#[derive(Default)]
pub struct RecordingWatch {
    watched: BTreeSet<Handle>,
    fail_next: bool,
    unwatch_calls: usize,
}

impl RecordingWatch {
    /// Refuse the next `watch` call.
    pub fn fail_next_watch(&mut self) {
        self.fail_next = true;
    }

    pub fn is_watching(&self, handle: Handle) -> bool {
        self.watched.contains(&handle)
    }

    /// Watched handles, ascending.
    pub fn watched(&self) -> Vec<Handle> {
        self.watched.iter().copied().collect()
    }

    pub fn unwatch_calls(&self) -> usize {
        self.unwatch_calls
    }
}

impl<S> WatchSet<S> for RecordingWatch {
    fn watch(&mut self, handle: Handle, _stream: &mut S) -> io::Result<()> {
        if std::mem::take(&mut self.fail_next) {
            return Err(io::Error::new(io::ErrorKind::Other, "watch refused"));
        }
        assert!(self.watched.insert(handle), "handle {handle} watched twice");
        Ok(())
    }

    fn unwatch(&mut self, handle: Handle, _stream: &mut S) -> io::Result<()> {
        self.unwatch_calls += 1;
        assert!(self.watched.remove(&handle), "handle {handle} was not watched");
        Ok(())
    }
}
