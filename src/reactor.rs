use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use mio::event::Source;
use mio::{Events, Interest, Poll, Registry, Token};
use parking_lot::Mutex;
use tracing::trace;

use crate::trigger::Trigger;

/// Token reserved for the cross-thread trigger.
pub const TRIGGER: Token = Token(0);

/// Anything registered with the reactor: acceptors, server channels, FTP
/// data channels, passive acceptors. `ready` runs on the loop thread only
/// and must restrict itself to non-blocking operations.
pub trait EventHandler: Send + Sync {
    fn ready(self: Arc<Self>, reactor: &Arc<Reactor>, readable: bool, writable: bool);
}

/// Periodic housekeeping hook, driven once per loop iteration.
pub trait Maintainer: Send + Sync {
    fn check_maintenance(&self, now: Instant);
}

/// Shared reactor state: the registration table and the trigger. The
/// registry is usable from any thread, which is how worker threads attach
/// FTP data connections mid-command.
pub struct Reactor {
    registry: Registry,
    handlers: Mutex<HashMap<Token, Arc<dyn EventHandler>>>,
    maintainers: Mutex<Vec<Weak<dyn Maintainer>>>,
    next_token: AtomicUsize,
    trigger: Arc<Trigger>,
}

impl Reactor {
    /// Allocates a token and registers `source` for both readiness kinds.
    /// Interest never changes afterwards; the readable/writable predicates
    /// live in the handlers instead.
    pub fn register(&self, source: &mut dyn Source) -> io::Result<Token> {
        let token = Token(self.next_token.fetch_add(1, Ordering::SeqCst));
        self.registry
            .register(source, token, Interest::READABLE | Interest::WRITABLE)?;
        Ok(token)
    }

    /// Like `register`, but readable-only (listening sockets).
    pub fn register_readable(&self, source: &mut dyn Source) -> io::Result<Token> {
        let token = Token(self.next_token.fetch_add(1, Ordering::SeqCst));
        self.registry.register(source, token, Interest::READABLE)?;
        Ok(token)
    }

    pub fn insert(&self, token: Token, handler: Arc<dyn EventHandler>) {
        self.handlers.lock().insert(token, handler);
    }

    pub fn remove(&self, token: Token) -> Option<Arc<dyn EventHandler>> {
        self.handlers.lock().remove(&token)
    }

    pub fn trigger(&self) -> &Arc<Trigger> {
        &self.trigger
    }

    pub fn add_maintainer(&self, maintainer: Weak<dyn Maintainer>) {
        self.maintainers.lock().push(maintainer);
    }

    fn run_maintenance(&self, now: Instant) {
        let mut maintainers = self.maintainers.lock();
        maintainers.retain(|weak| {
            if let Some(maintainer) = weak.upgrade() {
                maintainer.check_maintenance(now);
                true
            } else {
                false
            }
        });
    }
}

/// Owns the poll and drives the reactor. Exactly one thread runs this.
pub struct EventLoop {
    poll: Poll,
    events: Events,
    reactor: Arc<Reactor>,
}

impl EventLoop {
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let trigger = Trigger::new(poll.registry(), TRIGGER)?;
        let reactor = Arc::new(Reactor {
            registry,
            handlers: Mutex::new(HashMap::new()),
            maintainers: Mutex::new(Vec::new()),
            next_token: AtomicUsize::new(TRIGGER.0 + 1),
            trigger,
        });
        Ok(EventLoop {
            poll,
            events: Events::with_capacity(1024),
            reactor,
        })
    }

    pub fn reactor(&self) -> Arc<Reactor> {
        Arc::clone(&self.reactor)
    }

    /// Runs the loop forever. Only an error from the poll itself escapes;
    /// per-connection failures are absorbed by the handlers.
    pub fn run(&mut self) -> io::Result<()> {
        loop {
            self.poll_once(Some(Duration::from_secs(1)))?;
        }
    }

    /// A single poll-dispatch-maintain iteration.
    pub fn poll_once(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(err) => return Err(err),
        }
        let reactor = Arc::clone(&self.reactor);
        for event in self.events.iter() {
            let token = event.token();
            if token == TRIGGER {
                reactor.trigger.drain();
                continue;
            }
            let handler = reactor.handlers.lock().get(&token).cloned();
            match handler {
                Some(handler) => {
                    handler.ready(&reactor, event.is_readable(), event.is_writable());
                }
                // Events can arrive for freshly removed tokens.
                None => trace!(?token, "event for unknown token"),
            }
        }
        reactor.run_maintenance(Instant::now());
        Ok(())
    }
}
