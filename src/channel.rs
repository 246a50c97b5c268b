use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use mio::Token;
use mio::net::TcpStream;
use parking_lot::Mutex;
use tracing::warn;

use crate::adjustments::Adjustments;
use crate::buffers::OverflowBuffer;
use crate::reactor::Reactor;
use crate::trigger::Trigger;

/// Connection state shared between the event loop and worker threads.
///
/// A channel is in exactly one of two modes. In async mode the loop reads
/// the socket and drains the output buffer; in sync mode the loop leaves
/// the channel alone and a worker writes through [`write`](Self::write) /
/// [`flush`](Self::flush). Mode switches are the synchronisation points
/// for the output buffer.
///
/// The socket slot starts empty for FTP data channels and is filled in by
/// [`attach`](Self::attach) once the transfer connection exists.
pub struct ChannelCore {
    sock: Mutex<Option<TcpStream>>,
    addr: Mutex<Option<SocketAddr>>,
    token: Mutex<Option<Token>>,
    pub adj: Arc<Adjustments>,
    outbuf: Mutex<OverflowBuffer>,
    async_mode: AtomicBool,
    will_close: AtomicBool,
    connected: AtomicBool,
    closed: AtomicBool,
    pub creation_time: Instant,
    last_activity: Mutex<Instant>,
    trigger: Arc<Trigger>,
}

impl ChannelCore {
    /// Core for an accepted, registered connection. Starts in async mode.
    pub fn new_connected(
        stream: TcpStream,
        addr: SocketAddr,
        token: Token,
        adj: Arc<Adjustments>,
        trigger: Arc<Trigger>,
    ) -> Self {
        let now = Instant::now();
        ChannelCore {
            sock: Mutex::new(Some(stream)),
            addr: Mutex::new(Some(addr)),
            token: Mutex::new(Some(token)),
            outbuf: Mutex::new(OverflowBuffer::new(adj.outbuf_overflow)),
            adj,
            async_mode: AtomicBool::new(true),
            will_close: AtomicBool::new(false),
            connected: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            creation_time: now,
            last_activity: Mutex::new(now),
            trigger,
        }
    }

    /// Core without a socket yet (FTP data channels).
    pub fn new_detached(adj: Arc<Adjustments>, trigger: Arc<Trigger>, async_mode: bool) -> Self {
        let now = Instant::now();
        ChannelCore {
            sock: Mutex::new(None),
            addr: Mutex::new(None),
            token: Mutex::new(None),
            outbuf: Mutex::new(OverflowBuffer::new(adj.outbuf_overflow)),
            adj,
            async_mode: AtomicBool::new(async_mode),
            will_close: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            creation_time: now,
            last_activity: Mutex::new(now),
            trigger,
        }
    }

    pub fn attach(&self, stream: TcpStream, addr: SocketAddr, token: Token) {
        *self.sock.lock() = Some(stream);
        *self.addr.lock() = Some(addr);
        *self.token.lock() = Some(token);
        self.connected.store(true, Ordering::SeqCst);
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        *self.addr.lock()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.sock.lock().as_ref().and_then(|s| s.local_addr().ok())
    }

    pub fn token(&self) -> Option<Token> {
        *self.token.lock()
    }

    pub fn trigger(&self) -> &Arc<Trigger> {
        &self.trigger
    }

    pub fn async_mode(&self) -> bool {
        self.async_mode.load(Ordering::SeqCst)
    }

    /// Switches to synchronous mode: the loop stops calling `received`.
    pub fn set_sync(&self) {
        self.async_mode.store(false, Ordering::SeqCst);
    }

    pub(crate) fn mark_async(&self) {
        self.async_mode.store(true, Ordering::SeqCst);
    }

    pub fn will_close(&self) -> bool {
        self.will_close.load(Ordering::SeqCst)
    }

    pub(crate) fn set_will_close(&self) {
        self.will_close.store(true, Ordering::SeqCst);
    }

    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Marks the channel closed. Returns false when it already was.
    pub(crate) fn mark_closed(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::SeqCst);
        if first {
            self.connected.store(false, Ordering::SeqCst);
        }
        first
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    pub fn outbuf_len(&self) -> usize {
        self.outbuf.lock().len()
    }

    /// Appends to the output buffer and, while at least `send_bytes` are
    /// pending, flushes what the socket will take without blocking.
    /// Errors propagate to the caller on purpose, to stop the application
    /// when the connection goes away.
    pub fn write(&self, data: &[u8]) -> io::Result<usize> {
        if !data.is_empty() {
            self.outbuf
                .lock()
                .append(data)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        }
        while self.outbuf_len() >= self.adj.send_bytes {
            if !self.flush_some()? {
                break;
            }
        }
        Ok(data.len())
    }

    /// Sends pending data. With `block` set this pauses the caller until
    /// the buffer drains, retrying after every would-block; otherwise only
    /// what fits into the socket right now goes out.
    pub fn flush(&self, block: bool) -> io::Result<()> {
        loop {
            if self.outbuf_len() == 0 {
                return Ok(());
            }
            match self.flush_some()? {
                true => continue,
                false if block => std::thread::sleep(std::time::Duration::from_millis(2)),
                false => return Ok(()),
            }
        }
    }

    /// One bounded flush attempt: at most `send_bytes` go out, partial
    /// sends advance the buffer cursor. Returns true if progress was made.
    pub fn flush_some(&self) -> io::Result<bool> {
        let sock = self.sock.lock();
        let Some(stream) = sock.as_ref() else {
            return Ok(false);
        };
        if !self.connected() {
            return Ok(false);
        }
        let mut outbuf = self.outbuf.lock();
        if outbuf.is_empty() {
            return Ok(false);
        }
        let chunk = outbuf
            .get(self.adj.send_bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        match (&mut &*stream).write(&chunk) {
            Ok(0) => Ok(false),
            Ok(n) => {
                outbuf
                    .skip(n)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(true)
            }
            Err(ref err) if would_block(err) => Ok(false),
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub(crate) fn recv_some(&self, buf: &mut [u8]) -> io::Result<usize> {
        let sock = self.sock.lock();
        let Some(stream) = sock.as_ref() else {
            return Err(io::ErrorKind::WouldBlock.into());
        };
        (&mut &*stream).read(buf)
    }

    pub(crate) fn shutdown_socket(&self) {
        if let Some(stream) = self.sock.lock().as_ref() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

impl std::fmt::Debug for ChannelCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelCore")
            .field("addr", &self.addr())
            .field("token", &self.token())
            .field("async_mode", &self.async_mode())
            .field("will_close", &self.will_close())
            .field("connected", &self.connected())
            .finish()
    }
}

pub fn would_block(err: &io::Error) -> bool {
    // A connect still in progress reads as NotConnected; treat it the
    // same as WouldBlock and wait for the next readiness event.
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::NotConnected
    )
}

/// The dual-mode protocol surface. Concrete channels (HTTP, FTP control,
/// FTP data) implement the hooks; the free functions below supply the
/// mode-switching machinery that every channel shares.
pub trait DualMode: Send + Sync + 'static {
    fn core(&self) -> &ChannelCore;

    fn reactor(&self) -> &Arc<Reactor>;

    /// Bytes arrived in async mode.
    fn received(ch: &Arc<Self>, data: &[u8])
    where
        Self: Sized;

    /// Peer closed its end.
    fn handle_eof(ch: &Arc<Self>)
    where
        Self: Sized,
    {
        close_channel(ch);
    }

    /// Runs once, right after the channel fully closed.
    fn on_closed(&self) {}
}

/// Drain reads and writes for one channel; the loop calls this on every
/// readiness event and after every mode switch back to async.
pub fn pump<C: DualMode>(ch: &Arc<C>) {
    handle_read_events(ch);
    handle_write_events(ch);
}

pub fn handle_read_events<C: DualMode>(ch: &Arc<C>) {
    let core = ch.core();
    let mut buf = vec![0u8; core.adj.recv_bytes];
    // Reads must drain until would-block, but stop the moment a request
    // hands the channel to a worker (sync mode).
    loop {
        if !core.async_mode() || core.will_close() || core.is_closed() {
            return;
        }
        match core.recv_some(&mut buf) {
            Ok(0) => {
                C::handle_eof(ch);
                return;
            }
            Ok(n) => {
                core.touch();
                C::received(ch, &buf[..n]);
            }
            Err(ref err) if would_block(err) => return,
            Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                handle_comm_error(ch, &err);
                return;
            }
        }
    }
}

pub fn handle_write_events<C: DualMode>(ch: &Arc<C>) {
    let core = ch.core();
    if !core.async_mode() || core.is_closed() {
        return;
    }
    loop {
        match core.flush_some() {
            Ok(true) => continue,
            Ok(false) => break,
            Err(err) => {
                handle_comm_error(ch, &err);
                return;
            }
        }
    }
    if core.will_close() && core.outbuf_len() == 0 {
        close_channel(ch);
    }
}

/// Communication (not program) errors: log per the adjustments, close.
pub fn handle_comm_error<C: DualMode>(ch: &Arc<C>, err: &io::Error) {
    let core = ch.core();
    if core.adj.log_socket_errors {
        warn!(addr = ?core.addr(), "socket error on channel: {}", err);
    }
    close_channel(ch);
}

/// Re-enables loop callbacks and wakes the loop so buffered work (unread
/// socket data, unflushed output) is picked up immediately.
pub fn set_async<C: DualMode>(ch: &Arc<C>) {
    let core = ch.core();
    core.mark_async();
    let clone = Arc::clone(ch);
    core.trigger().pull(Some(Box::new(move || pump(&clone))));
}

/// Close as soon as the output buffer drains: immediately when empty,
/// otherwise after handing the remainder to the loop.
pub fn close_when_done<C: DualMode>(ch: &Arc<C>) {
    let core = ch.core();
    loop {
        match core.flush_some() {
            Ok(true) => continue,
            _ => break,
        }
    }
    if core.outbuf_len() == 0 {
        close_channel(ch);
    } else {
        core.set_will_close();
        core.mark_async();
        let clone = Arc::clone(ch);
        core.trigger().pull(Some(Box::new(move || pump(&clone))));
    }
}

/// Tears the channel down exactly once: deregisters, shuts the socket
/// down, then runs the `on_closed` hook.
pub fn close_channel<C: DualMode>(ch: &Arc<C>) {
    let core = ch.core();
    if !core.mark_closed() {
        return;
    }
    if let Some(token) = core.token() {
        ch.reactor().remove(token);
    }
    core.shutdown_socket();
    ch.on_closed();
}
