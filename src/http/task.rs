use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::SystemTime;

use tracing::{error, warn};

use crate::channel::close_when_done;
use crate::http::parser::HttpRequestParser;
use crate::http::server::HttpChannel;
use crate::interfaces::HitRecord;
use crate::taskthreads::Task;

/// Header names the CGI environment keeps un-prefixed (or renames).
fn rename_header(key: &str) -> Option<&'static str> {
    match key {
        "CONTENT_LENGTH" => Some("CONTENT_LENGTH"),
        "CONTENT_TYPE" => Some("CONTENT_TYPE"),
        "CONNECTION" => Some("CONNECTION_TYPE"),
        _ => None,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("application error: {0}")]
    App(Box<dyn std::error::Error + Send + Sync>),
}

/// One HTTP request being answered. Runs on a worker: asks the server to
/// execute the application, lazily writes the response header on the
/// first body write, and decides whether the connection survives.
pub struct HttpTask {
    pub channel: Arc<HttpChannel>,
    pub request: HttpRequestParser,
    /// Response protocol version, clamped to a version we speak.
    pub version: String,
    pub status: String,
    pub reason: String,
    pub response_headers: Vec<(String, String)>,
    /// Pre-formatted `Name: value` lines appended by the application.
    pub accumulated_headers: Vec<String>,
    pub wrote_header: bool,
    pub bytes_written: usize,
    pub close_on_finish: bool,
    pub auth_user_name: String,
    pub start_time: Option<SystemTime>,
    cgi_env: Option<HashMap<String, String>>,
}

impl HttpTask {
    pub fn new(channel: Arc<HttpChannel>, request: HttpRequestParser) -> Self {
        let version = match request.version.as_deref() {
            Some("1.0") => "1.0",
            Some("1.1") => "1.1",
            // Fall back to a version we support.
            _ => "1.0",
        };
        HttpTask {
            channel,
            request,
            version: version.to_string(),
            status: "200".to_string(),
            reason: "OK".to_string(),
            response_headers: Vec::new(),
            accumulated_headers: Vec::new(),
            wrote_header: false,
            bytes_written: 0,
            close_on_finish: true,
            auth_user_name: String::new(),
            start_time: None,
            cgi_env: None,
        }
    }

    pub fn set_response_status(&mut self, status: &str, reason: &str) {
        self.status = status.to_string();
        self.reason = reason.to_string();
    }

    pub fn set_response_header(&mut self, name: &str, value: &str) {
        for (k, v) in self.response_headers.iter_mut() {
            if k.eq_ignore_ascii_case(name) {
                *v = value.to_string();
                return;
            }
        }
        self.response_headers
            .push((name.to_string(), value.to_string()));
    }

    pub fn append_response_headers(&mut self, lines: &[String]) {
        self.accumulated_headers.extend_from_slice(lines);
    }

    pub fn wrote_response_header(&self) -> bool {
        self.wrote_header
    }

    fn response_header(&self, name: &str) -> Option<&str> {
        self.response_headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// True when either header store carries `name`.
    fn has_header(&self, name: &str) -> bool {
        if self.response_header(name).is_some() {
            return true;
        }
        let prefix = format!("{}:", name.to_ascii_lowercase());
        self.accumulated_headers
            .iter()
            .any(|line| line.to_ascii_lowercase().starts_with(&prefix))
    }

    fn accumulated_contains(&self, lowered_line: &str) -> bool {
        self.accumulated_headers
            .iter()
            .any(|line| line.to_ascii_lowercase().trim() == lowered_line)
    }

    /// Decides keep-alive versus close and injects the standing headers.
    fn prepare_response_headers(&mut self) {
        let connection = self
            .request
            .header("CONNECTION")
            .unwrap_or("")
            .to_ascii_lowercase();
        let mut close_it = false;

        let version = self.version.clone();
        match version.as_str() {
            "1.0" => {
                if connection == "keep-alive" {
                    if self.has_header("Content-Length") {
                        self.set_response_header("Connection", "Keep-Alive");
                    } else {
                        close_it = true;
                    }
                } else {
                    close_it = true;
                }
            }
            "1.1" => {
                if self.accumulated_contains("connection: close") || connection == "close" {
                    close_it = true;
                } else if let Some(te) = self.response_header("Transfer-Encoding") {
                    if te != "chunked" {
                        close_it = true;
                    }
                } else if self.status == "304" {
                    // Replying with headers only.
                } else if !self.has_header("Content-Length") {
                    close_it = true;
                }
                // Keep-alive is the 1.1 default; no header needed.
            }
            _ => close_it = true,
        }

        self.close_on_finish = close_it;
        if close_it {
            self.set_response_header("Connection", "close");
        }

        // Set Server and Date if the application didn't. An app that sets
        // its own Server header is being proxied through us, hence Via.
        let ident = self.channel.server().base.server_ident.clone();
        if self.has_header("Server") {
            self.set_response_header("Via", &ident);
        } else {
            self.set_response_header("Server", &ident);
        }
        if !self.has_header("Date") {
            let when = self.start_time.unwrap_or_else(SystemTime::now);
            self.set_response_header("Date", &httpdate::fmt_http_date(when));
        }
    }

    fn build_response_header(&mut self) -> Vec<u8> {
        self.prepare_response_headers();
        let mut lines = Vec::with_capacity(2 + self.response_headers.len());
        lines.push(format!(
            "HTTP/{} {} {}",
            self.version, self.status, self.reason
        ));
        for (name, value) in &self.response_headers {
            lines.push(format!("{}: {}", name, value));
        }
        lines.extend(self.accumulated_headers.iter().cloned());
        let mut out = lines.join("\r\n").into_bytes();
        out.extend_from_slice(b"\r\n\r\n");
        out
    }

    /// On the first call this serialises the status line and headers;
    /// afterwards it appends body bytes to the channel's output buffer.
    pub fn write(&mut self, data: &[u8]) -> io::Result<()> {
        if !self.wrote_header {
            let header = self.build_response_header();
            self.channel.core().write(&header)?;
            self.bytes_written += header.len();
            self.wrote_header = true;
        }
        if !data.is_empty() {
            self.channel.core().write(data)?;
            self.bytes_written += data.len();
        }
        Ok(())
    }

    pub fn flush(&self) -> io::Result<()> {
        self.channel.core().flush(false)
    }

    /// A CGI-style environment for the request.
    pub fn cgi_environment(&mut self) -> HashMap<String, String> {
        if let Some(env) = &self.cgi_env {
            return env.clone();
        }
        let server = self.channel.server();
        let base = &server.base;
        let path = self.request.path.trim_start_matches('/');

        let mut env = HashMap::new();
        env.insert("REQUEST_METHOD".into(), self.request.command.clone());
        env.insert("SERVER_PORT".into(), base.port.to_string());
        env.insert("SERVER_NAME".into(), base.server_name.clone());
        env.insert("SERVER_SOFTWARE".into(), base.server_ident.clone());
        env.insert("SERVER_PROTOCOL".into(), format!("HTTP/{}", self.version));
        env.insert("SCRIPT_NAME".into(), String::new());
        env.insert("PATH_INFO".into(), format!("/{}", path));
        env.insert(
            "QUERY_STRING".into(),
            self.request.query.clone().unwrap_or_default(),
        );
        env.insert("GATEWAY_INTERFACE".into(), "CGI/1.1".into());
        if let Some(addr) = self.channel.core().addr() {
            env.insert("REMOTE_ADDR".into(), addr.ip().to_string());
            if let Some(resolver) = &base.resolver {
                if let Some(host) = resolver.cached_host(addr.ip()) {
                    env.insert("REMOTE_HOST".into(), host);
                }
            }
        }

        for (key, value) in &self.request.headers {
            let env_key = match rename_header(key) {
                Some(renamed) => renamed.to_string(),
                None => format!("HTTP_{}", key),
            };
            env.entry(env_key).or_insert_with(|| value.trim().to_string());
        }

        self.cgi_env = Some(env.clone());
        env
    }

    /// Best-effort 500 when the application failed before any output.
    pub fn internal_error(&mut self) {
        self.response_headers.clear();
        self.accumulated_headers.clear();
        self.set_response_status("500", "Internal Server Error");
        let body = b"500 Internal Server Error";
        self.set_response_header("Content-Type", "text/plain");
        self.set_response_header("Content-Length", &body.len().to_string());
        if let Err(err) = self.write(body) {
            warn!("could not write error response: {}", err);
        }
    }

    fn finish(&mut self) {
        if let Some(hit_log) = &self.channel.server().base.hit_log {
            let Some(addr) = self.channel.core().addr() else {
                return;
            };
            hit_log.log(&HitRecord {
                remote_addr: addr.ip(),
                user_name: self.auth_user_name.clone(),
                first_line: self.request.first_line.clone(),
                status: self.status.clone(),
                bytes_written: self.bytes_written,
                referer: self.request.header("REFERER").unwrap_or("").to_string(),
                user_agent: self.request.header("USER_AGENT").unwrap_or("").to_string(),
            });
        }
    }
}

impl Task for HttpTask {
    fn service(mut self: Box<Self>) {
        self.start_time = Some(SystemTime::now());
        let server = Arc::clone(self.channel.server());
        match server.execute_request(&mut self) {
            Ok(()) => {}
            Err(TaskError::Io(err)) => {
                self.close_on_finish = true;
                if self.channel.core().adj.log_socket_errors {
                    warn!("I/O error while servicing request: {}", err);
                }
            }
            Err(TaskError::App(err)) => {
                error!("application error: {}", err);
                if self.wrote_header {
                    self.close_on_finish = true;
                } else {
                    self.internal_error();
                }
            }
        }
        if !self.wrote_header {
            if let Err(err) = self.write(b"") {
                warn!("could not write response header: {}", err);
                self.close_on_finish = true;
            }
        }
        self.finish();
        if self.close_on_finish {
            close_when_done(&self.channel);
        }
    }

    fn cancel(self: Box<Self>) {
        close_when_done(&self.channel);
    }
}
