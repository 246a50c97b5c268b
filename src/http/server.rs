use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Instant;

use mio::Token;
use mio::net::TcpStream;
use parking_lot::Mutex;

use crate::channel::{ChannelCore, DualMode, close_channel, pump};
use crate::http::parser::{BodyStream, HttpRequestParser};
use crate::http::task::{HttpTask, TaskError};
use crate::reactor::{EventHandler, Reactor};
use crate::serverbase::{
    ServerBase, ServerChannel, ServerConfig, ServiceChannel, TaskQueue, feed_parser, queue_task,
};

/// The environment handed to the application: CGI variables plus the
/// usual gateway facts.
pub struct WsgiEnviron {
    pub vars: HashMap<String, String>,
    pub url_scheme: &'static str,
    pub multithread: bool,
    pub multiprocess: bool,
    pub run_once: bool,
    /// The buffered request body.
    pub input: BodyStream,
    /// Where applications should complain; they ought to use `tracing`.
    pub errors: std::io::Stderr,
}

/// Errors crossing the application boundary.
pub type AppError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum ResponseError {
    /// Headers were already on the wire. When the caller supplied the
    /// error that forced the late replacement, it rides along here so
    /// propagating this re-raises the original failure.
    #[error("response headers already sent")]
    HeadersAlreadySent(#[source] Option<AppError>),
    #[error("malformed status line {0:?}")]
    BadStatus(String),
}

/// The response side handed to the application: `start_response` plus a
/// body sink.
pub trait Responder {
    /// `status` is the full status line, e.g. `"200 OK"`. Calling this a
    /// second time before any body was written discards the previously
    /// supplied headers and replaces the status; `exc_info` carries the
    /// error that forced the replacement. Once output has started the
    /// call fails, re-raising `exc_info` as the error's source.
    fn start_response(
        &mut self,
        status: &str,
        headers: &[(String, String)],
        exc_info: Option<AppError>,
    ) -> Result<(), ResponseError>;

    fn write_body(&mut self, chunk: &[u8]) -> io::Result<()>;
}

/// The application callable. Errors bubble to the task: a 500 when no
/// headers went out yet, a dropped connection otherwise.
pub trait Application: Send + Sync {
    fn call(
        &self,
        environ: &mut WsgiEnviron,
        responder: &mut dyn Responder,
    ) -> Result<(), AppError>;
}

struct TaskResponder<'a> {
    task: &'a mut HttpTask,
    started: bool,
    io_error: Option<io::Error>,
}

impl Responder for TaskResponder<'_> {
    fn start_response(
        &mut self,
        status: &str,
        headers: &[(String, String)],
        exc_info: Option<AppError>,
    ) -> Result<(), ResponseError> {
        if self.task.wrote_response_header() {
            // Too late to replace anything; hand the original error back
            // to the application so it propagates.
            return Err(ResponseError::HeadersAlreadySent(exc_info));
        }
        if self.started {
            // Error replacement before output: drop what the application
            // queued so far.
            self.task.accumulated_headers.clear();
        }
        let status = status.trim();
        let (code, reason) = match status.split_once(' ') {
            Some((code, reason)) => (code, reason.trim()),
            None => (status, ""),
        };
        if code.is_empty() || !code.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ResponseError::BadStatus(status.to_string()));
        }
        self.task.set_response_status(code, reason);
        let lines: Vec<String> = headers
            .iter()
            .map(|(name, value)| format!("{}: {}", name, value))
            .collect();
        self.task.append_response_headers(&lines);
        self.started = true;
        Ok(())
    }

    fn write_body(&mut self, chunk: &[u8]) -> io::Result<()> {
        match self.task.write(chunk) {
            Ok(()) => Ok(()),
            Err(err) => {
                let kind = err.kind();
                self.io_error = Some(err);
                Err(kind.into())
            }
        }
    }
}

/// HTTP server: accepts connections, parses requests incrementally, and
/// executes them against the configured application.
pub struct HttpServer {
    pub base: Arc<ServerBase>,
    pub application: Arc<dyn Application>,
}

impl HttpServer {
    pub const SERVER_IDENT: &'static str = "polyserve/http";

    pub fn new(
        application: Arc<dyn Application>,
        sub_protocol: Option<&str>,
        config: ServerConfig,
        reactor: Arc<Reactor>,
    ) -> io::Result<Arc<Self>> {
        let ident = match sub_protocol {
            Some(sub) => format!("{} ({})", Self::SERVER_IDENT, sub),
            None => Self::SERVER_IDENT.to_string(),
        };
        let base = ServerBase::new(config, ident, reactor)?;
        let server = Arc::new(HttpServer { base, application });
        server
            .base
            .reactor
            .insert(server.base.token, Arc::clone(&server) as Arc<dyn EventHandler>);
        Ok(server)
    }

    /// Builds the environment, runs the application, and streams its
    /// output back through the task.
    pub fn execute_request(&self, task: &mut HttpTask) -> Result<(), TaskError> {
        let mut environ = self.build_environ(task);
        let mut responder = TaskResponder {
            task,
            started: false,
            io_error: None,
        };
        let app_result = self.application.call(&mut environ, &mut responder);
        if let Some(err) = responder.io_error {
            return Err(TaskError::Io(err));
        }
        app_result.map_err(TaskError::App)
    }

    fn build_environ(&self, task: &mut HttpTask) -> WsgiEnviron {
        let vars = task.cgi_environment();
        // Deduce the URL scheme the request arrived on.
        let https = vars
            .get("HTTPS")
            .map(|v| v.eq_ignore_ascii_case("on"))
            .unwrap_or(false)
            || vars.get("SERVER_PORT_SECURE").map(String::as_str) == Some("1");
        WsgiEnviron {
            vars,
            url_scheme: if https { "https" } else { "http" },
            multithread: true,
            multiprocess: true,
            run_once: false,
            input: task.request.body_stream(),
            errors: std::io::stderr(),
        }
    }
}

impl EventHandler for HttpServer {
    fn ready(self: Arc<Self>, _reactor: &Arc<Reactor>, _readable: bool, _writable: bool) {
        let server = Arc::clone(&self);
        self.base.poll_accept(move |stream, addr, token| {
            HttpChannel::new(Arc::clone(&server), stream, addr, token)
        });
    }
}

/// One HTTP connection. Parses requests off the wire on the loop thread
/// and queues a task per request; the task FIFO machinery keeps the
/// channel in sync mode while a worker answers them in order.
pub struct HttpChannel {
    core: ChannelCore,
    server: Arc<HttpServer>,
    parser: Mutex<Option<HttpRequestParser>>,
    tasks: TaskQueue,
    me: Weak<HttpChannel>,
}

impl HttpChannel {
    pub fn new(
        server: Arc<HttpServer>,
        stream: TcpStream,
        addr: SocketAddr,
        token: Token,
    ) -> Arc<Self> {
        let core = ChannelCore::new_connected(
            stream,
            addr,
            token,
            Arc::clone(&server.base.adj),
            Arc::clone(server.base.reactor.trigger()),
        );
        Arc::new_cyclic(|me| HttpChannel {
            core,
            server,
            parser: Mutex::new(None),
            tasks: TaskQueue::new(),
            me: me.clone(),
        })
    }

    pub fn core(&self) -> &ChannelCore {
        &self.core
    }

    pub fn server(&self) -> &Arc<HttpServer> {
        &self.server
    }
}

impl DualMode for HttpChannel {
    fn core(&self) -> &ChannelCore {
        &self.core
    }

    fn reactor(&self) -> &Arc<Reactor> {
        &self.server.base.reactor
    }

    fn received(ch: &Arc<Self>, data: &[u8]) {
        let adj = Arc::clone(&ch.core.adj);
        let mut slot = ch.parser.lock();
        feed_parser(
            &mut slot,
            || HttpRequestParser::new(Arc::clone(&adj)),
            data,
            |request| {
                let task = HttpTask::new(Arc::clone(ch), request);
                queue_task(ch, Box::new(task));
            },
        );
    }

    fn on_closed(&self) {
        if let Some(token) = self.core.token() {
            self.server.base.remove_channel(token);
        }
    }
}

impl ServiceChannel for HttpChannel {
    fn task_queue(&self) -> &TaskQueue {
        &self.tasks
    }

    fn server_base(&self) -> &Arc<ServerBase> {
        &self.server.base
    }
}

impl EventHandler for HttpChannel {
    fn ready(self: Arc<Self>, _reactor: &Arc<Reactor>, _readable: bool, _writable: bool) {
        pump(&self);
    }
}

impl ServerChannel for HttpChannel {
    fn channel_token(&self) -> Token {
        self.core.token().unwrap_or(Token(usize::MAX))
    }

    fn last_activity(&self) -> Instant {
        self.core.last_activity()
    }

    fn has_running_tasks(&self) -> bool {
        self.tasks.running()
    }

    fn close(&self) {
        if let Some(me) = self.me.upgrade() {
            close_channel(&me);
        }
    }
}
