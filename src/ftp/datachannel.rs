use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use mio::net::TcpStream;
use parking_lot::Mutex;
use tracing::debug;

use crate::buffers::OverflowBuffer;
use crate::channel::{ChannelCore, DualMode, close_channel, close_when_done, pump};
use crate::ftp::channel::FtpChannel;
use crate::ftp::messages::StatusMessage;
use crate::interfaces::ByteSink;
use crate::reactor::{EventHandler, Reactor};
use crate::serverbase::queue_task;
use crate::taskthreads::Task;

/// What to do with a completed upload: target path, append mode, and the
/// restart offset.
#[derive(Debug, Clone)]
pub struct FinishArgs {
    pub path: String,
    pub append: bool,
    pub start: u64,
}

/// Either kind of data connection, as the control channel tracks it.
#[derive(Clone)]
pub enum DataChannelRef {
    Recv(Arc<RecvChannel>),
    Xmit(Arc<XmitChannel>),
}

impl DataChannelRef {
    pub fn attach(&self, stream: TcpStream, addr: SocketAddr) -> io::Result<()> {
        match self {
            DataChannelRef::Recv(dc) => dc.attach_stream(stream, addr),
            DataChannelRef::Xmit(dc) => dc.attach_stream(stream, addr),
        }
    }

    pub fn is_connected(&self) -> bool {
        match self {
            DataChannelRef::Recv(dc) => dc.core.connected(),
            DataChannelRef::Xmit(dc) => dc.core.connected(),
        }
    }

    /// Close with an explicit reply to the control channel.
    pub fn close_with(&self, reply: Option<StatusMessage>) {
        match self {
            DataChannelRef::Recv(dc) => dc.close_with(reply),
            DataChannelRef::Xmit(dc) => dc.close_with(reply),
        }
    }

    /// Close without notifying the control channel (it is going away).
    pub fn close_quiet(&self) {
        match self {
            DataChannelRef::Recv(dc) => {
                dc.control.lock().take();
                if let Some(me) = dc.me.upgrade() {
                    close_channel(&me);
                }
            }
            DataChannelRef::Xmit(dc) => {
                dc.control.lock().take();
                if let Some(me) = dc.me.upgrade() {
                    close_channel(&me);
                }
            }
        }
    }
}

/// Upload-side data connection: async reads accumulate into an overflow
/// buffer; client EOF schedules the finishing task that writes the
/// buffer into the filesystem and sends the final reply.
pub struct RecvChannel {
    core: ChannelCore,
    reactor: Arc<Reactor>,
    control: Mutex<Option<Arc<FtpChannel>>>,
    inbuf: Mutex<Option<OverflowBuffer>>,
    finish_args: FinishArgs,
    complete_transfer: AtomicBool,
    me: Weak<RecvChannel>,
}

impl RecvChannel {
    pub fn new(control: &Arc<FtpChannel>, finish_args: FinishArgs) -> Arc<Self> {
        let adj = Arc::clone(&control.core().adj);
        let inbuf = OverflowBuffer::new(adj.inbuf_overflow);
        let reactor = Arc::clone(control.reactor());
        let core = ChannelCore::new_detached(adj, Arc::clone(reactor.trigger()), true);
        Arc::new_cyclic(|me| RecvChannel {
            core,
            reactor,
            control: Mutex::new(Some(Arc::clone(control))),
            inbuf: Mutex::new(Some(inbuf)),
            finish_args,
            complete_transfer: AtomicBool::new(false),
            me: me.clone(),
        })
    }

    pub fn attach_stream(&self, mut stream: TcpStream, addr: SocketAddr) -> io::Result<()> {
        let token = self.reactor.register(&mut stream)?;
        self.core.attach(stream, addr, token);
        if let Some(me) = self.me.upgrade() {
            self.reactor.insert(token, me);
        }
        Ok(())
    }

    pub fn close_with(&self, reply: Option<StatusMessage>) {
        let control = self.control.lock().take();
        if let Some(control) = control {
            let reply = match reply {
                None if !self.complete_transfer.load(Ordering::SeqCst) => {
                    // Not all data transferred.
                    Some(StatusMessage::TransferAborted)
                }
                other => other,
            };
            control.notify_client_dc_closing(reply);
        }
        if let Some(me) = self.me.upgrade() {
            close_channel(&me);
        }
    }
}

impl DualMode for RecvChannel {
    fn core(&self) -> &ChannelCore {
        &self.core
    }

    fn reactor(&self) -> &Arc<Reactor> {
        &self.reactor
    }

    fn received(ch: &Arc<Self>, data: &[u8]) {
        if let Some(inbuf) = ch.inbuf.lock().as_mut() {
            if let Err(err) = inbuf.append(data) {
                debug!("dropping upload data: {}", err);
            }
        }
    }

    /// Client EOF ends the transfer; the buffered upload is handed to a
    /// worker to write out and reply.
    fn handle_eof(ch: &Arc<Self>) {
        ch.complete_transfer.store(true, Ordering::SeqCst);
        let control = ch.control.lock().clone();
        let inbuf = ch.inbuf.lock().take();
        close_channel(ch);
        if let (Some(control), Some(inbuf)) = (control, inbuf) {
            let task = FinishedRecvTask {
                control: Arc::clone(&control),
                inbuf,
                args: ch.finish_args.clone(),
            };
            queue_task(&control, Box::new(task));
        }
    }

    fn on_closed(&self) {
        let control = self.control.lock().take();
        if let Some(control) = control {
            let reply = if self.complete_transfer.load(Ordering::SeqCst) {
                None
            } else {
                Some(StatusMessage::TransferAborted)
            };
            control.notify_client_dc_closing(reply);
        }
    }
}

impl EventHandler for RecvChannel {
    fn ready(self: Arc<Self>, _reactor: &Arc<Reactor>, _readable: bool, _writable: bool) {
        pump(&self);
    }
}

/// Writes the accumulated upload into the filesystem, then replies.
/// Always runs on a worker through the control channel's task FIFO.
struct FinishedRecvTask {
    control: Arc<FtpChannel>,
    inbuf: OverflowBuffer,
    args: FinishArgs,
}

impl Task for FinishedRecvTask {
    fn service(mut self: Box<Self>) {
        self.control.finished_recv(&mut self.inbuf, &self.args);
    }

    fn cancel(self: Box<Self>) {
        close_when_done(&self.control);
    }
}

/// Download-side data connection. Runs in sync mode with an async
/// helper: the command handler writes through it from a worker while the
/// loop drains the buffer to the client. The first write opens the
/// connection (sends the 150 reply and, in active mode, connects out).
pub struct XmitChannel {
    core: ChannelCore,
    reactor: Arc<Reactor>,
    control: Mutex<Option<Arc<FtpChannel>>>,
    ok_reply: Mutex<Option<StatusMessage>>,
    opened: AtomicBool,
    me: Weak<XmitChannel>,
}

impl XmitChannel {
    pub fn new(control: &Arc<FtpChannel>, ok_reply: StatusMessage) -> Arc<Self> {
        let adj = Arc::clone(&control.core().adj);
        let reactor = Arc::clone(control.reactor());
        let core = ChannelCore::new_detached(adj, Arc::clone(reactor.trigger()), true);
        Arc::new_cyclic(|me| XmitChannel {
            core,
            reactor,
            control: Mutex::new(Some(Arc::clone(control))),
            ok_reply: Mutex::new(Some(ok_reply)),
            opened: AtomicBool::new(false),
            me: me.clone(),
        })
    }

    pub fn attach_stream(&self, mut stream: TcpStream, addr: SocketAddr) -> io::Result<()> {
        let token = self.reactor.register(&mut stream)?;
        self.core.attach(stream, addr, token);
        if let Some(me) = self.me.upgrade() {
            self.reactor.insert(token, me);
        }
        Ok(())
    }

    /// Signal the client that the transfer starts: the deferred 150 goes
    /// out and the data connection is established.
    fn open(&self) {
        let control = self.control.lock().clone();
        let Some(control) = control else { return };
        if let Some(reply) = self.ok_reply.lock().take() {
            control.reply(reply);
        }
        if let Some(me) = self.me.upgrade() {
            control.connect_data_channel(&DataChannelRef::Xmit(me));
        }
    }

    /// Buffer outbound transfer data, opening the connection on first
    /// use.
    pub fn write(&self, data: &[u8]) -> io::Result<usize> {
        if self.control.lock().is_none() {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "client FTP connection closed",
            ));
        }
        if !self.opened.swap(true, Ordering::SeqCst) {
            self.open();
        }
        self.core.write(data)
    }

    pub fn flush(&self) -> io::Result<()> {
        self.core.flush(false)
    }

    /// Send what is buffered, then close; replies `226` on a complete
    /// send and `426` otherwise. A zero-length transfer still opens the
    /// connection first.
    pub fn finish(&self) {
        if !self.opened.swap(true, Ordering::SeqCst) {
            self.open();
        }
        if let Some(me) = self.me.upgrade() {
            close_when_done(&me);
        }
    }

    pub fn close_with(&self, reply: Option<StatusMessage>) {
        let control = self.control.lock().take();
        if let Some(control) = control {
            let reply = match reply {
                Some(reply) => Some(reply),
                None => {
                    if self.core.outbuf_len() == 0 {
                        Some(StatusMessage::TransSuccess)
                    } else {
                        Some(StatusMessage::TransferAborted)
                    }
                }
            };
            control.notify_client_dc_closing(reply);
        }
        if let Some(me) = self.me.upgrade() {
            close_channel(&me);
        }
    }
}

impl DualMode for XmitChannel {
    fn core(&self) -> &ChannelCore {
        &self.core
    }

    fn reactor(&self) -> &Arc<Reactor> {
        &self.reactor
    }

    fn received(_ch: &Arc<Self>, _data: &[u8]) {
        // Nothing meaningful arrives on a transmit-only connection.
    }

    fn handle_eof(ch: &Arc<Self>) {
        ch.close_with(None);
    }

    fn on_closed(&self) {
        let control = self.control.lock().take();
        if let Some(control) = control {
            let reply = if self.core.outbuf_len() == 0 {
                // All data transferred.
                StatusMessage::TransSuccess
            } else {
                StatusMessage::TransferAborted
            };
            control.notify_client_dc_closing(Some(reply));
        }
    }
}

impl EventHandler for XmitChannel {
    fn ready(self: Arc<Self>, _reactor: &Arc<Reactor>, _readable: bool, _writable: bool) {
        pump(&self);
    }
}

/// Stream adapter handed to the filesystem for downloads; `close` maps
/// onto `close_when_done`.
pub struct ApplicationXmitStream {
    channel: Arc<XmitChannel>,
}

impl ApplicationXmitStream {
    pub fn new(channel: Arc<XmitChannel>) -> Self {
        ApplicationXmitStream { channel }
    }

    pub fn close(self) {
        self.channel.finish();
    }
}

impl ByteSink for ApplicationXmitStream {
    fn write_bytes(&mut self, data: &[u8]) -> io::Result<()> {
        self.channel.write(data).map(|_| ())
    }

    fn flush_bytes(&mut self) -> io::Result<()> {
        self.channel.flush()
    }
}

impl Write for ApplicationXmitStream {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.channel.write(data)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.channel.flush()
    }
}
