use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use mio::Token;
use mio::net::{TcpListener, TcpStream};
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::adjustments::{Adjustments, SocketOption};
use crate::channel::{DualMode, set_async};
use crate::interfaces::{HitLog, Resolver};
use crate::reactor::{EventHandler, Maintainer, Reactor};
use crate::taskthreads::{Task, ThreadedTaskDispatcher};

/// An incremental request parser: consumes bytes, reports how many it took,
/// raises `completed` once a full message is in. A completed parser that
/// consumed nothing meaningful sets `is_empty` and is discarded.
pub trait StreamConsumer {
    fn received(&mut self, data: &[u8]) -> usize;
    fn completed(&self) -> bool;
    fn is_empty(&self) -> bool;
}

/// Feeds a chunk of socket data through the per-connection parser slot.
/// Completed requests go to `on_request`; leftover bytes restart with a
/// fresh parser, which is what makes pipelining work.
pub fn feed_parser<P, F, G>(slot: &mut Option<P>, new_parser: F, mut data: &[u8], mut on_request: G)
where
    P: StreamConsumer,
    F: Fn() -> P,
    G: FnMut(P),
{
    while !data.is_empty() {
        let mut parser = slot.take().unwrap_or_else(&new_parser);
        let n = parser.received(data);
        if parser.completed() {
            if !parser.is_empty() {
                on_request(parser);
            }
        } else {
            *slot = Some(parser);
        }
        if n >= data.len() {
            break;
        }
        data = &data[n..];
    }
}

/// What the server base needs from every connection it tracks.
pub trait ServerChannel: Send + Sync {
    fn channel_token(&self) -> Token;
    fn last_activity(&self) -> Instant;
    fn has_running_tasks(&self) -> bool;
    fn close(&self);
}

struct TaskQueueState {
    queue: VecDeque<Box<dyn Task>>,
    /// True while a worker owns this channel's task FIFO.
    running: bool,
}

/// Per-channel FIFO of pending request tasks. While the FIFO is live the
/// channel sits in sync mode and is represented in the dispatcher by a
/// single [`ChannelJob`]; requests of one connection never run in
/// parallel.
pub struct TaskQueue {
    state: Mutex<TaskQueueState>,
}

impl TaskQueue {
    pub fn new() -> Self {
        TaskQueue {
            state: Mutex::new(TaskQueueState {
                queue: VecDeque::new(),
                running: false,
            }),
        }
    }

    /// Queues a task; returns true when the caller must hand a job to the
    /// dispatcher because no worker currently owns the FIFO.
    fn push(&self, task: Box<dyn Task>) -> bool {
        let mut state = self.state.lock();
        state.queue.push_back(task);
        if !state.running {
            state.running = true;
            true
        } else {
            false
        }
    }

    /// Takes the next task, or releases the FIFO when drained.
    fn pop(&self) -> Option<Box<dyn Task>> {
        let mut state = self.state.lock();
        match state.queue.pop_front() {
            Some(task) => Some(task),
            None => {
                state.running = false;
                None
            }
        }
    }

    fn drain(&self) -> Vec<Box<dyn Task>> {
        let mut state = self.state.lock();
        state.running = false;
        state.queue.drain(..).collect()
    }

    pub fn running(&self) -> bool {
        self.state.lock().running
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// A channel whose requests are serviced through the shared FIFO
/// machinery.
pub trait ServiceChannel: DualMode {
    fn task_queue(&self) -> &TaskQueue;
    fn server_base(&self) -> &Arc<ServerBase>;
}

/// The worker-side job for one channel: drains the channel's FIFO, then
/// flips the connection back to async and wakes the loop. This is the
/// piece of the connection that travels through the dispatcher; the
/// channel itself stays an I/O object.
pub struct ChannelJob<C: ServiceChannel> {
    channel: Arc<C>,
}

impl<C: ServiceChannel> Task for ChannelJob<C> {
    fn service(self: Box<Self>) {
        let ch = &self.channel;
        loop {
            match ch.task_queue().pop() {
                Some(task) => task.service(),
                None => {
                    set_async(ch);
                    break;
                }
            }
        }
    }

    fn cancel(self: Box<Self>) {
        let pending = self.channel.task_queue().drain();
        for task in pending {
            task.cancel();
        }
        set_async(&self.channel);
    }
}

/// Queue a request task on its channel, entering sync mode on the first
/// one.
pub fn queue_task<C: ServiceChannel>(ch: &Arc<C>, task: Box<dyn Task>) {
    if ch.task_queue().push(task) {
        ch.core().set_sync();
        ch.server_base().add_task(Box::new(ChannelJob {
            channel: Arc::clone(ch),
        }));
    }
}

/// TCP acceptor plus per-server channel registry and zombie reaping.
/// Concrete servers (HTTP, FTP) wrap this and supply the channel factory.
pub struct ServerBase {
    listener: TcpListener,
    pub token: Token,
    pub reactor: Arc<Reactor>,
    pub adj: Arc<Adjustments>,
    pub dispatcher: Option<Arc<ThreadedTaskDispatcher>>,
    pub server_ident: String,
    pub server_name: String,
    pub port: u16,
    pub hit_log: Option<Arc<dyn HitLog>>,
    pub resolver: Option<Arc<dyn Resolver>>,
    pub verbose: bool,
    accepting: AtomicBool,
    channels: Mutex<HashMap<Token, Arc<dyn ServerChannel>>>,
    next_cleanup: Mutex<Instant>,
}

pub struct ServerConfig {
    pub ip: String,
    pub port: u16,
    pub task_dispatcher: Option<Arc<ThreadedTaskDispatcher>>,
    pub adj: Arc<Adjustments>,
    pub start: bool,
    pub hit_log: Option<Arc<dyn HitLog>>,
    pub resolver: Option<Arc<dyn Resolver>>,
    pub verbose: bool,
}

impl ServerConfig {
    pub fn new(ip: &str, port: u16) -> Self {
        ServerConfig {
            ip: ip.to_string(),
            port,
            task_dispatcher: None,
            adj: Arc::new(Adjustments::default()),
            start: true,
            hit_log: None,
            resolver: None,
            verbose: false,
        }
    }

    pub fn dispatcher(mut self, dispatcher: Arc<ThreadedTaskDispatcher>) -> Self {
        self.task_dispatcher = Some(dispatcher);
        self
    }

    pub fn adjustments(mut self, adj: Arc<Adjustments>) -> Self {
        self.adj = adj;
        self
    }

    pub fn hit_log(mut self, hit_log: Arc<dyn HitLog>) -> Self {
        self.hit_log = Some(hit_log);
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

impl ServerBase {
    pub fn new(config: ServerConfig, server_ident: String, reactor: Arc<Reactor>) -> io::Result<Arc<Self>> {
        let addr: SocketAddr = format!("{}:{}", config.ip, config.port)
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let mut listener = TcpListener::bind(addr)?;
        let port = listener.local_addr()?.port();
        let token = reactor.register_readable(&mut listener)?;
        let server_name = compute_server_name(&config.ip);
        let base = Arc::new(ServerBase {
            listener,
            token,
            reactor,
            adj: config.adj,
            dispatcher: config.task_dispatcher,
            server_ident,
            server_name,
            port,
            hit_log: config.hit_log,
            resolver: config.resolver,
            verbose: config.verbose,
            accepting: AtomicBool::new(false),
            channels: Mutex::new(HashMap::new()),
            next_cleanup: Mutex::new(Instant::now()),
        });
        base.reactor
            .add_maintainer(Arc::downgrade(&base) as std::sync::Weak<dyn Maintainer>);
        if config.start {
            base.accept_connections();
        }
        Ok(base)
    }

    pub fn accept_connections(&self) {
        self.accepting.store(true, Ordering::SeqCst);
        if self.verbose {
            info!(
                "{} started. Hostname: {} Port: {}",
                self.server_ident, self.server_name, self.port
            );
        }
    }

    pub fn accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Admission control: accept only while this server's own connection
    /// count is under its limit. The tally is per server, so one
    /// protocol's load never throttles the other's.
    fn may_accept(&self) -> bool {
        self.accepting() && self.channel_count() < self.adj.connection_limit
    }

    /// Accept as many pending connections as admission allows; each one is
    /// registered and handed to the channel factory. Acceptor errors are
    /// logged, never fatal.
    pub fn poll_accept<C, F>(&self, make_channel: F)
    where
        C: ServerChannel + EventHandler + 'static,
        F: Fn(TcpStream, SocketAddr, Token) -> Arc<C>,
    {
        loop {
            if !self.may_accept() {
                return;
            }
            match self.listener.accept() {
                Ok((mut stream, addr)) => {
                    apply_socket_options(&stream, &self.adj.socket_options);
                    let token = match self.reactor.register(&mut stream) {
                        Ok(token) => token,
                        Err(err) => {
                            warn!("failed to register accepted connection: {}", err);
                            continue;
                        }
                    };
                    let channel = make_channel(stream, addr, token);
                    self.reactor
                        .insert(token, Arc::clone(&channel) as Arc<dyn EventHandler>);
                    self.channels
                        .lock()
                        .insert(token, channel as Arc<dyn ServerChannel>);
                    self.check_maintenance(Instant::now());
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    if self.adj.log_socket_errors {
                        warn!("server accept() threw an exception: {}", err);
                    }
                    return;
                }
            }
        }
    }

    /// Hand a task to the dispatcher, or run it inline when there is none.
    pub fn add_task(&self, task: Box<dyn Task>) {
        match &self.dispatcher {
            Some(dispatcher) => {
                if let Err(err) = dispatcher.add_task(task) {
                    error!("could not queue task: {}", err);
                }
            }
            None => task.service(),
        }
    }

    pub fn remove_channel(&self, token: Token) {
        self.channels.lock().remove(&token);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }

    /// Closes connections without activity for longer than
    /// `channel_timeout`. Channels with running tasks are left alone.
    pub fn kill_zombies(&self, now: Instant) {
        let cutoff = match now.checked_sub(self.adj.channel_timeout) {
            Some(cutoff) => cutoff,
            None => return,
        };
        let stale: Vec<Arc<dyn ServerChannel>> = self
            .channels
            .lock()
            .values()
            .filter(|ch| !ch.has_running_tasks() && ch.last_activity() < cutoff)
            .cloned()
            .collect();
        for channel in stale {
            info!(token = ?channel.channel_token(), "closing zombie channel");
            channel.close();
        }
    }
}

impl Maintainer for ServerBase {
    fn check_maintenance(&self, now: Instant) {
        {
            let mut next = self.next_cleanup.lock();
            if now < *next {
                return;
            }
            *next = now + self.adj.cleanup_interval;
        }
        self.kill_zombies(now);
    }
}

fn apply_socket_options(stream: &TcpStream, options: &[SocketOption]) {
    for option in options {
        let res = match option {
            SocketOption::NoDelay(v) => stream.set_nodelay(*v),
            SocketOption::Ttl(v) => stream.set_ttl(*v),
        };
        if let Err(err) = res {
            warn!("failed to apply socket option {:?}: {}", option, err);
        }
    }
}

/// The advertised server name: the bind IP verbatim, or `localhost` for
/// an unspecified address. No reverse lookups here.
fn compute_server_name(ip: &str) -> String {
    if ip.is_empty() || ip == "0.0.0.0" || ip == "::" {
        "localhost".to_string()
    } else {
        ip.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingParser {
        seen: Vec<u8>,
        done: bool,
    }

    impl StreamConsumer for CountingParser {
        fn received(&mut self, data: &[u8]) -> usize {
            // Consume up to and including the first newline.
            match data.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    self.seen.extend_from_slice(&data[..pos]);
                    self.done = true;
                    pos + 1
                }
                None => {
                    self.seen.extend_from_slice(data);
                    data.len()
                }
            }
        }

        fn completed(&self) -> bool {
            self.done
        }

        fn is_empty(&self) -> bool {
            self.seen.is_empty()
        }
    }

    #[test]
    fn feed_parser_splits_pipelined_messages() {
        let mut slot: Option<CountingParser> = None;
        let mut lines = Vec::new();
        feed_parser(
            &mut slot,
            || CountingParser {
                seen: Vec::new(),
                done: false,
            },
            b"one\ntwo\nthr",
            |p| lines.push(p.seen),
        );
        assert_eq!(lines, vec![b"one".to_vec(), b"two".to_vec()]);
        // The tail lives on in the parser slot.
        let rest = slot.expect("partial parser kept");
        assert_eq!(rest.seen, b"thr");
    }

    #[test]
    fn feed_parser_discards_empty_messages() {
        let mut slot: Option<CountingParser> = None;
        let mut lines = Vec::new();
        feed_parser(
            &mut slot,
            || CountingParser {
                seen: Vec::new(),
                done: false,
            },
            b"\n\nreal\n",
            |p| lines.push(p.seen),
        );
        assert_eq!(lines, vec![b"real".to_vec()]);
    }

    #[test]
    fn task_queue_hands_out_one_job_at_a_time() {
        struct Nop;
        impl Task for Nop {
            fn service(self: Box<Self>) {}
            fn cancel(self: Box<Self>) {}
        }

        let q = TaskQueue::new();
        assert!(q.push(Box::new(Nop)));
        assert!(!q.push(Box::new(Nop)));
        assert!(q.pop().is_some());
        assert!(q.pop().is_some());
        assert!(q.pop().is_none());
        assert!(!q.running());
        // After draining, the next push starts a new job.
        assert!(q.push(Box::new(Nop)));
    }
}
