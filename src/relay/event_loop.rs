//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready, then we
//! perform non-blocking accept/read/write syscalls. Uses epoll on Linux,
//! kqueue on macOS. Everything runs on the calling thread.
//!
//! Each pass first records which clients became writable, then handles the
//! ready sources in ascending order with the listener first. Sources that
//! used up their budget without draining are carried into the next pass, and
//! while any are carried the poll does not block.

use super::connection::WatchSet;
use super::token::Handle;
use super::{listener, Relay, Serviced};
use crate::config::Config;
use crate::error::RelayError;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token};
use std::collections::BTreeSet;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Connections accepted per pass before ready clients get their turn.
const ACCEPT_BUDGET: usize = 16;

impl WatchSet<TcpStream> for Registry {
    fn watch(&mut self, handle: Handle, stream: &mut TcpStream) -> io::Result<()> {
        self.register(
            stream,
            Token(handle.0),
            Interest::READABLE | Interest::WRITABLE,
        )
    }

    fn unwatch(&mut self, _handle: Handle, stream: &mut TcpStream) -> io::Result<()> {
        self.deregister(stream)
    }
}

/// Something the current pass has to act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Ready {
    Listener,
    Client(Handle),
}

/// The relay bound to its loopback listener.
pub struct Server {
    poll: Poll,
    events: Events,
    /// Handle onto `poll`'s registry used as the connections' watch set.
    registry: Registry,
    listener: TcpListener,
    relay: Relay<TcpStream>,
    /// Sources that may still hold input no new event will announce.
    unfinished: BTreeSet<Ready>,
}

impl Server {
    /// Bind the listener and set up the poller. Nothing is accepted until
    /// `run`.
    pub fn bind(config: &Config) -> Result<Self, RelayError> {
        let poll = Poll::new().map_err(RelayError::Poll)?;
        let registry = poll.registry().try_clone().map_err(RelayError::Poll)?;

        let listener =
            listener::bind(config.listen_addr(), config.backlog).map_err(RelayError::Listen)?;
        let mut listener = TcpListener::from_std(listener);
        registry
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(RelayError::Poll)?;

        Ok(Self {
            poll,
            events: Events::with_capacity(config.events_capacity),
            registry,
            listener,
            relay: Relay::new(config.recv_buffer_size, config.read_errors),
            unfinished: BTreeSet::new(),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until a fatal error, then release every open connection.
    pub fn run(mut self) -> Result<(), RelayError> {
        match self.local_addr() {
            Ok(addr) => info!(addr = %addr, "Relay listening"),
            Err(e) => warn!(error = %e, "Could not read listener address"),
        }

        let result = self.serve();

        if let Err(ref e) = result {
            error!(error = %e, "Relay stopping");
        }
        let released = self.relay.shutdown(&mut self.registry);
        info!(released, "Connections released");

        result
    }

    fn serve(&mut self) -> Result<(), RelayError> {
        let mut ready = Vec::with_capacity(self.events.capacity());
        let mut poll_failures: u64 = 0;

        loop {
            let timeout = if self.unfinished.is_empty() {
                None
            } else {
                Some(Duration::ZERO)
            };

            if let Err(e) = self.poll.poll(&mut self.events, timeout) {
                if e.kind() != io::ErrorKind::Interrupted {
                    // A poller that keeps failing turns this into a busy loop;
                    // only log on powers of two so it does not flood stderr.
                    poll_failures += 1;
                    if should_log_poll_failure(poll_failures) {
                        warn!(error = %e, failures = poll_failures, "Poll failed, waiting again");
                    }
                }
                continue;
            }
            if poll_failures > 0 {
                debug!(failures = poll_failures, "Poll recovered");
                poll_failures = 0;
            }

            ready.clear();
            ready.extend(std::mem::take(&mut self.unfinished));
            for event in self.events.iter() {
                match event.token() {
                    LISTENER_TOKEN => ready.push(Ready::Listener),
                    Token(key) => {
                        let handle = Handle(key);
                        if event.is_writable() {
                            self.relay.mark_writable(handle);
                        }
                        if event.is_readable() || event.is_read_closed() || event.is_error() {
                            ready.push(Ready::Client(handle));
                        }
                    }
                }
            }
            if ready.is_empty() {
                continue;
            }

            ready.sort_unstable();
            ready.dedup();

            for source in &ready {
                let serviced = match *source {
                    Ready::Listener => self.accept_pending()?,
                    Ready::Client(handle) => self.relay.service(handle, &mut self.registry)?,
                };
                if serviced == Serviced::Pending {
                    self.unfinished.insert(*source);
                }
            }
        }
    }

    /// Accept until the listener would block or the accept budget runs out.
    fn accept_pending(&mut self) -> Result<Serviced, RelayError> {
        let mut accepted = 0;
        while accepted < ACCEPT_BUDGET {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    accepted += 1;
                    let (handle, id) = self.relay.admit(stream, &mut self.registry)?;
                    info!(
                        %handle,
                        %id,
                        peer = %peer,
                        clients = self.relay.registry().len(),
                        "Client arrived"
                    );
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Serviced::Drained)
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(error = %e, "Accept failed");
                    return Err(RelayError::Accept(e));
                }
            }
        }
        Ok(Serviced::Pending)
    }
}

/// Whether the `count`th consecutive poll failure is worth a warning.
fn should_log_poll_failure(count: u64) -> bool {
    count.is_power_of_two()
}
