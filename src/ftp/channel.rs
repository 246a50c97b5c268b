use std::io::Cursor;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Instant;

use chrono::{Datelike, Timelike};
use mio::Token;
use mio::net::TcpStream;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::buffers::OverflowBuffer;
use crate::channel::{ChannelCore, DualMode, close_channel, close_when_done, pump};
use crate::ftp::datachannel::{
    ApplicationXmitStream, DataChannelRef, FinishArgs, RecvChannel, XmitChannel,
};
use crate::ftp::listing;
use crate::ftp::messages::StatusMessage;
use crate::ftp::passive::PassiveAcceptor;
use crate::ftp::server::FtpServer;
use crate::interfaces::HitRecord;
use crate::linereceiver::LineCommandParser;
use crate::reactor::{EventHandler, Reactor};
use crate::serverbase::{
    ServerBase, ServerChannel, ServiceChannel, TaskQueue, feed_parser, queue_task,
};
use crate::taskthreads::Task;
use crate::vfs::{Credentials, Filesystem, NodeKind, VfsError, VfsResult};

type Handler = fn(&Arc<FtpChannel>, &str);

/// One FTP command: who may run it and where it runs. Filesystem-touching
/// commands go to a worker thread; the rest execute inline on the loop.
pub struct CommandSpec {
    pub name: &'static str,
    pub requires_auth: bool,
    pub runs_in_worker: bool,
    handler: Handler,
}

const fn cmd(
    name: &'static str,
    requires_auth: bool,
    runs_in_worker: bool,
    handler: Handler,
) -> CommandSpec {
    CommandSpec {
        name,
        requires_auth,
        runs_in_worker,
        handler,
    }
}

pub static COMMANDS: &[CommandSpec] = &[
    cmd("ABOR", true, false, cmd_abor),
    cmd("APPE", true, true, cmd_appe),
    cmd("CDUP", true, true, cmd_cdup),
    cmd("CWD", true, true, cmd_cwd),
    cmd("DELE", true, true, cmd_dele),
    cmd("HELP", true, false, cmd_help),
    cmd("LIST", true, true, cmd_list),
    cmd("MDTM", true, true, cmd_mdtm),
    cmd("MKD", true, true, cmd_mkd),
    cmd("MODE", true, false, cmd_mode),
    cmd("NLST", true, true, cmd_nlst),
    cmd("NOOP", false, false, cmd_noop),
    cmd("PASS", false, true, cmd_pass),
    cmd("PASV", true, false, cmd_pasv),
    cmd("PORT", true, false, cmd_port),
    cmd("PWD", true, false, cmd_pwd),
    cmd("QUIT", false, false, cmd_quit),
    cmd("REST", true, false, cmd_rest),
    cmd("RETR", true, true, cmd_retr),
    cmd("RMD", true, true, cmd_rmd),
    cmd("RNFR", true, true, cmd_rnfr),
    cmd("RNTO", true, true, cmd_rnto),
    cmd("SIZE", true, true, cmd_size),
    cmd("STOR", true, true, cmd_stor),
    cmd("STRU", true, true, cmd_stru),
    cmd("SYST", true, false, cmd_syst),
    cmd("TYPE", false, false, cmd_type),
    cmd("USER", false, false, cmd_user),
];

fn type_label(mode: char) -> &'static str {
    match mode {
        'a' => "ASCII",
        _ => "Binary",
    }
}

/// Per-session command state. Restart position and rename source are
/// one-shot: they reset after the operation they arm.
pub struct FtpState {
    pub cwd: String,
    pub transfer_mode: char,
    pub authenticated: bool,
    pub username: String,
    pub credentials: Option<Credentials>,
    pub restart_position: u64,
    pub rnfr: Option<String>,
    pub client_addr: SocketAddr,
    pub passive_acceptor: Option<Arc<PassiveAcceptor>>,
    pub client_dc: Option<DataChannelRef>,
}

/// The FTP control connection: line-oriented command dispatch plus the
/// coordination of at most one passive acceptor and one data channel.
pub struct FtpChannel {
    core: ChannelCore,
    server: Arc<FtpServer>,
    parser: Mutex<Option<LineCommandParser>>,
    tasks: TaskQueue,
    pub state: Mutex<FtpState>,
    me: Weak<FtpChannel>,
}

impl FtpChannel {
    pub fn new(
        server: Arc<FtpServer>,
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
        let channel = Arc::new_cyclic(|me| FtpChannel {
            core,
            parser: Mutex::new(None),
            tasks: TaskQueue::new(),
            state: Mutex::new(FtpState {
                cwd: "/".to_string(),
                // Have to default to ASCII.
                transfer_mode: 'a',
                authenticated: false,
                username: String::new(),
                credentials: None,
                restart_position: 0,
                rnfr: None,
                client_addr: SocketAddr::new(addr.ip(), 21),
                passive_acceptor: None,
                client_dc: None,
            }),
            server,
            me: me.clone(),
        });
        channel.reply(StatusMessage::ServerReady(
            channel.server.base.server_name.clone(),
        ));
        channel
    }

    pub fn core(&self) -> &ChannelCore {
        &self.core
    }

    pub fn reactor(&self) -> &Arc<Reactor> {
        &self.server.base.reactor
    }

    pub fn server(&self) -> &Arc<FtpServer> {
        &self.server
    }

    /// Writes one reply line and flushes what the socket will take.
    pub fn reply(&self, msg: StatusMessage) {
        let line = format!("{}\r\n", msg);
        if let Err(err) = self.core.write(line.as_bytes()) {
            debug!("could not write reply: {}", err);
            return;
        }
        let _ = self.core.flush(false);
    }

    /// Opens the filesystem using the session credentials.
    pub fn filesystem(&self) -> VfsResult<Arc<dyn Filesystem>> {
        let credentials = self.state.lock().credentials.clone();
        self.server.fs_access.open(credentials.as_ref())
    }

    /// Resolves `args` against the working directory, POSIX style.
    /// Escapes past the root clamp to `/`.
    pub fn generate_path(&self, args: &str) -> String {
        let cwd = self.state.lock().cwd.clone();
        join_and_normalize(&cwd, args.trim())
    }

    pub fn client_dc(&self) -> Option<DataChannelRef> {
        self.state.lock().client_dc.clone()
    }

    pub fn clear_passive_acceptor(&self) {
        self.state.lock().passive_acceptor = None;
    }

    /// A data channel is going away; forget it and relay its final reply.
    pub fn notify_client_dc_closing(&self, reply: Option<StatusMessage>) {
        let had = {
            let mut state = self.state.lock();
            state.client_dc.take().is_some()
        };
        if had {
            if let Some(reply) = reply {
                self.reply(reply);
            }
        }
    }

    /// Establishes the transfer connection for `dc`: adopt the passive
    /// acceptor's stashed socket, wait for the passive connect, or dial
    /// the client's PORT address.
    pub fn connect_data_channel(&self, dc: &DataChannelRef) {
        if dc.is_connected() {
            // The passive acceptor already handed the socket over.
            return;
        }
        let acceptor = self.state.lock().passive_acceptor.clone();
        if let Some(acceptor) = acceptor {
            if let Some((stream, addr)) = acceptor.take_ready() {
                // The client connected before the transfer command.
                acceptor.close();
                self.state.lock().passive_acceptor = None;
                if let Err(err) = dc.attach(stream, addr) {
                    warn!("could not attach data connection: {}", err);
                    dc.close_with(Some(StatusMessage::NoDataConn));
                }
            }
            // else: still waiting for the client to hit the PASV port;
            // the acceptor hands the socket over on accept.
        } else {
            let addr = self.state.lock().client_addr;
            match TcpStream::connect(addr) {
                Ok(stream) => {
                    if let Err(err) = dc.attach(stream, addr) {
                        warn!("could not attach data connection: {}", err);
                        dc.close_with(Some(StatusMessage::NoDataConn));
                    }
                }
                Err(_) => dc.close_with(Some(StatusMessage::NoDataConn)),
            }
        }
    }

    /// Called from the finishing task once an upload's data connection
    /// closed: write the buffered bytes into the filesystem and reply.
    pub fn finished_recv(&self, inbuf: &mut OverflowBuffer, args: &FinishArgs) {
        let fs = match self.filesystem() {
            Ok(fs) => fs,
            Err(err) => {
                self.reply(StatusMessage::ErrOpenWrite(err.to_string()));
                return;
            }
        };
        let data = match inbuf.get_all() {
            Ok(data) => data,
            Err(err) => {
                self.reply(StatusMessage::ErrIo(err.to_string()));
                return;
            }
        };
        let mut input = Cursor::new(data);
        match fs.writefile(&args.path, &mut input, Some(args.start), None, args.append) {
            Ok(()) => self.reply(StatusMessage::TransSuccess),
            Err(VfsError::Io(err)) => self.reply(StatusMessage::ErrIo(err.to_string())),
            Err(err) => self.reply(StatusMessage::ErrOpenWrite(err.to_string())),
        }
    }

    fn log_command(&self, line: &str) {
        if let Some(hit_log) = &self.server.base.hit_log {
            let Some(addr) = self.core.addr() else { return };
            let user_name = self.state.lock().username.clone();
            hit_log.log(&HitRecord {
                remote_addr: addr.ip(),
                user_name,
                first_line: line.to_string(),
                status: "-".to_string(),
                bytes_written: 0,
                referer: String::new(),
                user_agent: String::new(),
            });
        }
    }
}

/// Dispatch one parsed command line.
pub fn process_request(ch: &Arc<FtpChannel>, cmd_name: &str, args: &str) {
    let upper = cmd_name.to_uppercase();
    let Some(spec) = COMMANDS.iter().find(|spec| spec.name == upper) else {
        ch.reply(StatusMessage::CmdUnknown(upper));
        return;
    };
    if spec.requires_auth && !ch.state.lock().authenticated {
        // Not logged in; only the special commands are allowed.
        ch.reply(StatusMessage::LoginRequired);
        return;
    }
    if spec.runs_in_worker {
        let line = if args.is_empty() {
            upper
        } else {
            format!("{} {}", upper, args)
        };
        queue_task(
            ch,
            Box::new(FtpTask {
                channel: Arc::clone(ch),
                handler: spec.handler,
                args: args.to_string(),
                line,
            }),
        );
    } else {
        (spec.handler)(ch, args);
    }
}

/// Worker-side execution of one threaded command.
struct FtpTask {
    channel: Arc<FtpChannel>,
    handler: Handler,
    args: String,
    line: String,
}

impl Task for FtpTask {
    fn service(self: Box<Self>) {
        (self.handler)(&self.channel, &self.args);
        self.channel.log_command(&self.line);
    }

    fn cancel(self: Box<Self>) {
        close_when_done(&self.channel);
    }
}

//
// Command handlers. Protocol failures are tagged replies; only the
// filesystem speaks in errors, translated right here at the boundary.
//

fn cmd_abor(ch: &Arc<FtpChannel>, _args: &str) {
    match ch.client_dc() {
        Some(dc) => dc.close_with(Some(StatusMessage::TransferAborted)),
        None => ch.reply(StatusMessage::TransferAborted),
    }
}

fn cmd_appe(ch: &Arc<FtpChannel>, args: &str) {
    store(ch, args, true);
}

fn cmd_cdup(ch: &Arc<FtpChannel>, _args: &str) {
    let path = ch.generate_path("../");
    let fs = match ch.filesystem() {
        Ok(fs) => fs,
        Err(err) => return ch.reply(StatusMessage::InternalError(err.to_string())),
    };
    if fs.kind(&path).is_some() {
        ch.state.lock().cwd = path;
        ch.reply(StatusMessage::Success250("CDUP"));
    } else {
        ch.reply(StatusMessage::ErrNoFile(path));
    }
}

fn cmd_cwd(ch: &Arc<FtpChannel>, args: &str) {
    let path = ch.generate_path(args);
    let fs = match ch.filesystem() {
        Ok(fs) => fs,
        Err(err) => return ch.reply(StatusMessage::InternalError(err.to_string())),
    };
    if fs.kind(&path) == Some(NodeKind::Dir) {
        ch.state.lock().cwd = path;
        ch.reply(StatusMessage::Success250("CWD"));
    } else {
        ch.reply(StatusMessage::ErrNoDir(path));
    }
}

fn cmd_dele(ch: &Arc<FtpChannel>, args: &str) {
    if args.trim().is_empty() {
        return ch.reply(StatusMessage::ErrArgs);
    }
    let path = ch.generate_path(args);
    let fs = match ch.filesystem() {
        Ok(fs) => fs,
        Err(err) => return ch.reply(StatusMessage::InternalError(err.to_string())),
    };
    match fs.remove(&path) {
        Ok(()) => ch.reply(StatusMessage::Success250("DELE")),
        Err(err) => ch.reply(StatusMessage::ErrDeleteFile(err.to_string())),
    }
}

fn cmd_help(ch: &Arc<FtpChannel>, _args: &str) {
    ch.reply(StatusMessage::HelpStart);
    let names: Vec<&str> = COMMANDS.iter().map(|spec| spec.name).collect();
    let _ = ch.core().write(format!("  {}\r\n", names.join(" ")).as_bytes());
    ch.reply(StatusMessage::HelpEnd);
}

fn cmd_list(ch: &Arc<FtpChannel>, args: &str) {
    list(ch, args, true);
}

fn cmd_nlst(ch: &Arc<FtpChannel>, args: &str) {
    list(ch, args, false);
}

/// Shared implementation of LIST and NLST, with `-lad` flag parsing.
fn list(ch: &Arc<FtpChannel>, args: &str, long_default: bool) {
    let mut long = long_default;
    let mut directory = false;
    let mut path_arg = String::new();
    if args.trim().starts_with('-') {
        let mut paths = Vec::new();
        for token in args.split_whitespace() {
            if let Some(flags) = token.strip_prefix('-') {
                for flag in flags.chars() {
                    match flag {
                        'l' => long = true,
                        'a' => {}
                        'd' => directory = true,
                        _ => return ch.reply(StatusMessage::ErrArgs),
                    }
                }
            } else {
                paths.push(token);
            }
        }
        if paths.len() > 1 {
            return ch.reply(StatusMessage::ErrArgs);
        }
        if let Some(path) = paths.first() {
            path_arg = path.to_string();
        }
    } else {
        path_arg = args.trim().to_string();
    }

    let fs = match ch.filesystem() {
        Ok(fs) => fs,
        Err(err) => return ch.reply(StatusMessage::InternalError(err.to_string())),
    };
    let path = ch.generate_path(&path_arg);
    if fs.kind(&path).is_none() {
        return ch.reply(StatusMessage::ErrNoDirFile(path));
    }
    let text = match build_listing(fs.as_ref(), &path, long, directory) {
        Ok(text) => text,
        Err(err) => return ch.reply(StatusMessage::ErrNoList(err.to_string())),
    };

    let mode = {
        let state = ch.state.lock();
        type_label(state.transfer_mode).to_string()
    };
    let dc = XmitChannel::new(ch, StatusMessage::OpenDataConn(mode));
    ch.state.lock().client_dc = Some(DataChannelRef::Xmit(Arc::clone(&dc)));
    match dc.write(text.as_bytes()) {
        Ok(_) => dc.finish(),
        Err(err) => dc.close_with(Some(StatusMessage::ErrNoList(err.to_string()))),
    }
}

fn build_listing(
    fs: &dyn Filesystem,
    path: &str,
    long: bool,
    directory_only: bool,
) -> VfsResult<String> {
    let lines: Vec<String> = if fs.kind(path) == Some(NodeKind::Dir) && !directory_only {
        if long {
            fs.ls(path)?.iter().map(listing::ls).collect()
        } else {
            fs.names(path)?
        }
    } else if long {
        vec![listing::ls(&fs.lsinfo(path)?)]
    } else {
        vec![basename(path).to_string()]
    };
    Ok(format!("{}\r\n", lines.join("\r\n")))
}

fn cmd_mdtm(ch: &Arc<FtpChannel>, args: &str) {
    // No support for the non-standard extension carrying extra fields.
    if args.split_whitespace().count() > 1 {
        return ch.reply(StatusMessage::ErrArgs);
    }
    let path = ch.generate_path(args);
    let fs = match ch.filesystem() {
        Ok(fs) => fs,
        Err(err) => return ch.reply(StatusMessage::InternalError(err.to_string())),
    };
    if fs.kind(&path) != Some(NodeKind::File) {
        return ch.reply(StatusMessage::ErrIsNotFile(path));
    }
    let msg = match fs.mtime(&path) {
        Ok(Some(mtime)) => StatusMessage::FileDate {
            year: mtime.year(),
            month: mtime.month(),
            day: mtime.day(),
            hour: mtime.hour(),
            minute: mtime.minute(),
            second: mtime.second(),
        },
        _ => StatusMessage::FileDate {
            year: 0,
            month: 0,
            day: 0,
            hour: 0,
            minute: 0,
            second: 0,
        },
    };
    ch.reply(msg);
}

fn cmd_mkd(ch: &Arc<FtpChannel>, args: &str) {
    if args.trim().is_empty() {
        return ch.reply(StatusMessage::ErrArgs);
    }
    let path = ch.generate_path(args);
    let fs = match ch.filesystem() {
        Ok(fs) => fs,
        Err(err) => return ch.reply(StatusMessage::InternalError(err.to_string())),
    };
    match fs.mkdir(&path) {
        Ok(()) => ch.reply(StatusMessage::Success257("MKD")),
        Err(err) => ch.reply(StatusMessage::ErrCreateDir(err.to_string())),
    }
}

fn cmd_mode(ch: &Arc<FtpChannel>, args: &str) {
    let args = args.trim();
    if args.len() == 1 && args.eq_ignore_ascii_case("s") {
        ch.reply(StatusMessage::ModeOk);
    } else {
        ch.reply(StatusMessage::ModeUnknown);
    }
}

fn cmd_noop(ch: &Arc<FtpChannel>, _args: &str) {
    ch.reply(StatusMessage::Success200("NOOP"));
}

fn cmd_pass(ch: &Arc<FtpChannel>, args: &str) {
    ch.state.lock().authenticated = false;
    let username = ch.state.lock().username.clone();
    let credentials = Credentials {
        username,
        password: args.to_string(),
    };
    match ch.server().fs_access.authenticate(&credentials) {
        Ok(()) => {
            let mut state = ch.state.lock();
            state.credentials = Some(credentials);
            state.authenticated = true;
            drop(state);
            ch.reply(StatusMessage::LoginSuccess);
        }
        Err(_) => {
            ch.reply(StatusMessage::LoginMismatch);
            close_when_done(ch);
        }
    }
}

fn cmd_pasv(ch: &Arc<FtpChannel>, _args: &str) {
    // Only one passive acceptor at a time.
    let old = {
        let mut state = ch.state.lock();
        state.client_dc = None;
        state.passive_acceptor.take()
    };
    if let Some(old) = old {
        old.close();
    }
    match PassiveAcceptor::new(ch) {
        Ok(acceptor) => {
            let port = acceptor.addr.port();
            let ip = match acceptor.addr.ip() {
                IpAddr::V4(ip) => ip,
                IpAddr::V6(_) => {
                    acceptor.close();
                    return ch.reply(StatusMessage::NoDataConn);
                }
            };
            ch.state.lock().passive_acceptor = Some(acceptor);
            ch.reply(StatusMessage::PasvMode(ip, port));
        }
        Err(err) => {
            warn!("could not build passive acceptor: {}", err);
            ch.reply(StatusMessage::NoDataConn);
        }
    }
}

fn cmd_port(ch: &Arc<FtpChannel>, args: &str) {
    let parts: Vec<u8> = args
        .split(',')
        .filter_map(|part| part.trim().parse::<u8>().ok())
        .collect();
    if parts.len() != 6 {
        return ch.reply(StatusMessage::ErrArgs);
    }
    let ip = IpAddr::from([parts[0], parts[1], parts[2], parts[3]]);
    let port = u16::from(parts[4]) * 256 + u16::from(parts[5]);
    let old = {
        let mut state = ch.state.lock();
        state.client_addr = SocketAddr::new(ip, port);
        state.passive_acceptor.take()
    };
    if let Some(old) = old {
        old.close();
    }
    ch.reply(StatusMessage::Success200("PORT"));
}

fn cmd_pwd(ch: &Arc<FtpChannel>, _args: &str) {
    let cwd = ch.state.lock().cwd.clone();
    ch.reply(StatusMessage::AlreadyCurrent(cwd));
}

fn cmd_quit(ch: &Arc<FtpChannel>, _args: &str) {
    ch.reply(StatusMessage::Goodbye);
    close_when_done(ch);
}

fn cmd_rest(ch: &Arc<FtpChannel>, args: &str) {
    match args.trim().parse::<u64>() {
        Ok(pos) => {
            ch.state.lock().restart_position = pos;
            ch.reply(StatusMessage::RestartTransfer(pos));
        }
        Err(_) => ch.reply(StatusMessage::ErrArgs),
    }
}

fn cmd_retr(ch: &Arc<FtpChannel>, args: &str) {
    if args.trim().is_empty() {
        return ch.reply(StatusMessage::CmdUnknown("RETR".to_string()));
    }
    let path = ch.generate_path(args);
    let fs = match ch.filesystem() {
        Ok(fs) => fs,
        Err(err) => return ch.reply(StatusMessage::InternalError(err.to_string())),
    };
    if fs.kind(&path) != Some(NodeKind::File) {
        return ch.reply(StatusMessage::ErrIsNotFile(path));
    }
    let (start, mode) = {
        let mut state = ch.state.lock();
        let start = state.restart_position;
        state.restart_position = 0;
        (start, type_label(state.transfer_mode).to_string())
    };
    let dc = XmitChannel::new(ch, StatusMessage::OpenConn(mode, path.clone()));
    ch.state.lock().client_dc = Some(DataChannelRef::Xmit(Arc::clone(&dc)));
    let mut out = ApplicationXmitStream::new(Arc::clone(&dc));
    match fs.readfile(&path, &mut out, start, None) {
        Ok(()) => dc.finish(),
        Err(VfsError::Io(err)) => dc.close_with(Some(StatusMessage::ErrIo(err.to_string()))),
        Err(err) => dc.close_with(Some(StatusMessage::ErrOpenRead(err.to_string()))),
    }
}

fn cmd_rmd(ch: &Arc<FtpChannel>, args: &str) {
    if args.trim().is_empty() {
        return ch.reply(StatusMessage::ErrArgs);
    }
    let path = ch.generate_path(args);
    let fs = match ch.filesystem() {
        Ok(fs) => fs,
        Err(err) => return ch.reply(StatusMessage::InternalError(err.to_string())),
    };
    match fs.rmdir(&path) {
        Ok(()) => ch.reply(StatusMessage::Success250("RMD")),
        Err(err) => ch.reply(StatusMessage::ErrDeleteDir(err.to_string())),
    }
}

fn cmd_rnfr(ch: &Arc<FtpChannel>, args: &str) {
    let path = ch.generate_path(args);
    let fs = match ch.filesystem() {
        Ok(fs) => fs,
        Err(err) => return ch.reply(StatusMessage::InternalError(err.to_string())),
    };
    if fs.kind(&path).is_some() {
        ch.state.lock().rnfr = Some(path);
        ch.reply(StatusMessage::ReadyForDest);
    } else {
        ch.reply(StatusMessage::ErrNoFile(path));
    }
}

fn cmd_rnto(ch: &Arc<FtpChannel>, args: &str) {
    let source = ch.state.lock().rnfr.take();
    let Some(source) = source else {
        return ch.reply(StatusMessage::ErrRnfrSource);
    };
    let path = ch.generate_path(args);
    let fs = match ch.filesystem() {
        Ok(fs) => fs,
        Err(err) => return ch.reply(StatusMessage::InternalError(err.to_string())),
    };
    match fs.rename(&source, &path) {
        Ok(()) => ch.reply(StatusMessage::Success250("RNTO")),
        Err(err) => ch.reply(StatusMessage::ErrRename(source, path, err.to_string())),
    }
}

fn cmd_size(ch: &Arc<FtpChannel>, args: &str) {
    let path = ch.generate_path(args);
    let fs = match ch.filesystem() {
        Ok(fs) => fs,
        Err(err) => return ch.reply(StatusMessage::InternalError(err.to_string())),
    };
    if fs.kind(&path) != Some(NodeKind::File) {
        return ch.reply(StatusMessage::ErrNoFile(path));
    }
    match fs.size(&path) {
        Ok(size) => ch.reply(StatusMessage::FileSize(size)),
        Err(err) => ch.reply(StatusMessage::ErrIo(err.to_string())),
    }
}

fn cmd_stor(ch: &Arc<FtpChannel>, args: &str) {
    store(ch, args, false);
}

fn store(ch: &Arc<FtpChannel>, args: &str, append: bool) {
    if args.trim().is_empty() {
        return ch.reply(StatusMessage::ErrArgs);
    }
    let path = ch.generate_path(args);
    let fs = match ch.filesystem() {
        Ok(fs) => fs,
        Err(err) => return ch.reply(StatusMessage::InternalError(err.to_string())),
    };
    // Verify writability without opening anything.
    if !fs.writable(&path) {
        return ch.reply(StatusMessage::ErrOpenWrite("Can't write file".to_string()));
    }
    let (start, mode) = {
        let mut state = ch.state.lock();
        let start = state.restart_position;
        state.restart_position = 0;
        (start, type_label(state.transfer_mode).to_string())
    };
    let dc = RecvChannel::new(
        ch,
        FinishArgs {
            path: path.clone(),
            append,
            start,
        },
    );
    ch.state.lock().client_dc = Some(DataChannelRef::Recv(Arc::clone(&dc)));
    ch.reply(StatusMessage::OpenConn(mode, path));
    ch.connect_data_channel(&DataChannelRef::Recv(dc));
}

fn cmd_stru(ch: &Arc<FtpChannel>, args: &str) {
    let args = args.trim();
    if args.len() == 1 && args.eq_ignore_ascii_case("f") {
        ch.reply(StatusMessage::StruOk);
    } else {
        ch.reply(StatusMessage::StruUnknown);
    }
}

fn cmd_syst(ch: &Arc<FtpChannel>, _args: &str) {
    ch.reply(StatusMessage::ServerType("UNIX", "L8"));
}

fn cmd_type(ch: &Arc<FtpChannel>, args: &str) {
    // ascii, image, local <byte size>; no EBCDIC support.
    let tokens: Vec<&str> = args.split_whitespace().collect();
    let Some(first) = tokens.first() else {
        return ch.reply(StatusMessage::ErrArgs);
    };
    let t = first.to_lowercase();
    match t.as_str() {
        "a" | "i" | "l" => {
            if t == "l" && tokens.len() > 1 && tokens[1] != "8" {
                return ch.reply(StatusMessage::WrongByteSize);
            }
            let mode = t.chars().next().unwrap();
            ch.state.lock().transfer_mode = mode;
            ch.reply(StatusMessage::TypeSetOk(type_label(mode)));
        }
        _ => ch.reply(StatusMessage::ErrArgs),
    }
}

fn cmd_user(ch: &Arc<FtpChannel>, args: &str) {
    ch.state.lock().authenticated = false;
    let name = args.trim();
    if name.is_empty() {
        ch.reply(StatusMessage::ErrArgs);
    } else {
        ch.state.lock().username = name.to_string();
        ch.reply(StatusMessage::PassRequired);
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// POSIX join + normalize, clamping `..` at the root instead of
/// rejecting it.
pub fn join_and_normalize(cwd: &str, arg: &str) -> String {
    let joined = if arg.starts_with('/') {
        arg.to_string()
    } else if arg.is_empty() {
        cwd.to_string()
    } else {
        format!("{}/{}", cwd.trim_end_matches('/'), arg)
    };
    let mut stack: Vec<&str> = Vec::new();
    for segment in joined.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                stack.pop();
            }
            name => stack.push(name),
        }
    }
    if stack.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", stack.join("/"))
    }
}

impl DualMode for FtpChannel {
    fn core(&self) -> &ChannelCore {
        &self.core
    }

    fn reactor(&self) -> &Arc<Reactor> {
        &self.server.base.reactor
    }

    fn received(ch: &Arc<Self>, data: &[u8]) {
        let mut slot = ch.parser.lock();
        feed_parser(&mut slot, LineCommandParser::new, data, |parser| {
            process_request(ch, &parser.cmd, &parser.args);
        });
    }

    fn on_closed(&self) {
        if let Some(token) = self.core.token() {
            self.server.base.remove_channel(token);
        }
        // Tear down whatever transfer machinery is still around.
        let (dc, acceptor) = {
            let mut state = self.state.lock();
            (state.client_dc.take(), state.passive_acceptor.take())
        };
        if let Some(acceptor) = acceptor {
            acceptor.close();
        }
        if let Some(dc) = dc {
            dc.close_quiet();
        }
    }
}

impl ServiceChannel for FtpChannel {
    fn task_queue(&self) -> &TaskQueue {
        &self.tasks
    }

    fn server_base(&self) -> &Arc<ServerBase> {
        &self.server.base
    }
}

impl EventHandler for FtpChannel {
    fn ready(self: Arc<Self>, _reactor: &Arc<Reactor>, _readable: bool, _writable: bool) {
        pump(&self);
    }
}

impl ServerChannel for FtpChannel {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_resolution_is_posix_and_rooted() {
        assert_eq!(join_and_normalize("/", "foo"), "/foo");
        assert_eq!(join_and_normalize("/a/b", "c.txt"), "/a/b/c.txt");
        assert_eq!(join_and_normalize("/a/b", "/abs"), "/abs");
        assert_eq!(join_and_normalize("/a/b", ".."), "/a");
        assert_eq!(join_and_normalize("/a/b", "../.."), "/");
        // Escapes clamp to the root instead of failing.
        assert_eq!(join_and_normalize("/", "../../etc"), "/etc");
        assert_eq!(join_and_normalize("/a", "./b/./c"), "/a/b/c");
        assert_eq!(join_and_normalize("/a/b", ""), "/a/b");
    }

    #[test]
    fn command_table_matches_the_threading_policy() {
        let threaded = [
            "APPE", "CDUP", "CWD", "DELE", "LIST", "NLST", "MDTM", "MKD", "PASS", "RETR", "RMD",
            "RNFR", "RNTO", "SIZE", "STOR", "STRU",
        ];
        for spec in COMMANDS {
            assert_eq!(
                spec.runs_in_worker,
                threaded.contains(&spec.name),
                "threading policy for {}",
                spec.name
            );
        }
        let special = ["QUIT", "TYPE", "NOOP", "USER", "PASS"];
        for spec in COMMANDS {
            assert_eq!(
                !spec.requires_auth,
                special.contains(&spec.name),
                "auth policy for {}",
                spec.name
            );
        }
    }
}
