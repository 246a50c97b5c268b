use std::io::Read;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use polyserve::accesslog::CommonAccessLogger;
use polyserve::ftp::FtpServer;
use polyserve::http::{Application, HttpServer, Responder, WsgiEnviron};
use polyserve::reactor::EventLoop;
use polyserve::serverbase::ServerConfig;
use polyserve::taskthreads::ThreadedTaskDispatcher;
use polyserve::vfs::memfs::{MemfsAccess, MemoryFilesystem};

#[derive(Parser)]
#[command(about = "Multi-protocol (HTTP + FTP) event-loop server")]
struct Args {
    /// Address to bind both servers on
    #[arg(long, default_value = "127.0.0.1")]
    ip: String,

    #[arg(long, default_value_t = 8080)]
    http_port: u16,

    #[arg(long, default_value_t = 8021)]
    ftp_port: u16,

    /// Worker threads servicing requests
    #[arg(long, default_value_t = 4)]
    threads: usize,

    /// FTP login
    #[arg(long, default_value = "demo")]
    ftp_user: String,

    #[arg(long, default_value = "demo")]
    ftp_password: String,
}

/// Default application: says hello and echoes any request body.
struct DemoApp;

impl Application for DemoApp {
    fn call(
        &self,
        environ: &mut WsgiEnviron,
        responder: &mut dyn Responder,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut body = Vec::new();
        environ.input.read_to_end(&mut body)?;
        if body.is_empty() {
            let path = environ
                .vars
                .get("PATH_INFO")
                .map(String::as_str)
                .unwrap_or("/");
            body = format!("polyserve is running; you asked for {}\r\n", path).into_bytes();
        }
        let headers = vec![
            ("Content-Type".to_string(), "text/plain".to_string()),
            ("Content-Length".to_string(), body.len().to_string()),
        ];
        responder.start_response("200 OK", &headers, None)?;
        responder.write_body(&body)?;
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let args = Args::parse();

    let dispatcher = Arc::new(ThreadedTaskDispatcher::new());
    dispatcher.set_thread_count(args.threads);

    let mut event_loop = EventLoop::new().context("creating event loop")?;
    let reactor = event_loop.reactor();

    let http = HttpServer::new(
        Arc::new(DemoApp),
        None,
        ServerConfig::new(&args.ip, args.http_port)
            .dispatcher(Arc::clone(&dispatcher))
            .hit_log(Arc::new(CommonAccessLogger::new()))
            .verbose(true),
        Arc::clone(&reactor),
    )
    .context("starting HTTP server")?;
    info!("HTTP on {}:{}", args.ip, http.base.port);

    let fs = MemoryFilesystem::new();
    fs.mkdirs("/pub");
    fs.put("/pub/welcome.txt", b"Welcome to polyserve.\r\n");
    let fs_access = Arc::new(MemfsAccess::new(fs).with_user(&args.ftp_user, &args.ftp_password));

    let ftp = FtpServer::new(
        fs_access,
        ServerConfig::new(&args.ip, args.ftp_port)
            .dispatcher(Arc::clone(&dispatcher))
            .verbose(true),
        Arc::clone(&reactor),
    )
    .context("starting FTP server")?;
    info!("FTP on {}:{}", args.ip, ftp.base.port);

    event_loop.run().context("event loop failed")
}
