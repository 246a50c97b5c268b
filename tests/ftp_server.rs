use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use polyserve::ftp::FtpServer;
use polyserve::reactor::EventLoop;
use polyserve::serverbase::ServerConfig;
use polyserve::taskthreads::ThreadedTaskDispatcher;
use polyserve::vfs::Filesystem;
use polyserve::vfs::memfs::{MemfsAccess, MemoryFilesystem};

struct TestFtp {
    port: u16,
    fs: Arc<MemoryFilesystem>,
}

fn start_server() -> TestFtp {
    let fs = MemoryFilesystem::new();
    fs.mkdirs("/test");
    fs.put("/test/existing.txt", b"root initial data");
    let fs_access = Arc::new(MemfsAccess::new(Arc::clone(&fs)).with_user("foo", "bar"));

    let dispatcher = Arc::new(ThreadedTaskDispatcher::new());
    dispatcher.set_thread_count(2);
    let mut event_loop = EventLoop::new().unwrap();
    let reactor = event_loop.reactor();
    let server = FtpServer::new(
        fs_access,
        ServerConfig::new("127.0.0.1", 0).dispatcher(dispatcher),
        reactor,
    )
    .unwrap();
    let port = server.base.port;
    thread::spawn(move || {
        event_loop.run().unwrap();
    });
    TestFtp { port, fs }
}

struct Session {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Session {
    fn connect(port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port)).expect("connect control");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let writer = stream.try_clone().unwrap();
        let mut session = Session {
            reader: BufReader::new(stream),
            writer,
        };
        let banner = session.read_reply();
        assert!(banner.starts_with("220 "), "banner: {}", banner);
        session
    }

    fn login(port: u16) -> Self {
        let mut session = Session::connect(port);
        assert!(session.send("USER foo").starts_with("331"));
        assert!(session.send("PASS bar").starts_with("230"));
        session
    }

    fn send(&mut self, line: &str) -> String {
        self.writer
            .write_all(format!("{}\r\n", line).as_bytes())
            .unwrap();
        self.read_reply()
    }

    fn read_reply(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).expect("read reply");
        line.trim_end().to_string()
    }

    /// Issues PASV and opens a connection to the advertised port.
    fn open_passive(&mut self) -> TcpStream {
        let reply = self.send("PASV");
        assert!(reply.starts_with("227 "), "PASV reply: {}", reply);
        let inside = reply
            .split('(')
            .nth(1)
            .and_then(|s| s.split(')').next())
            .expect("address in PASV reply");
        let parts: Vec<u16> = inside.split(',').map(|p| p.parse().unwrap()).collect();
        assert_eq!(parts.len(), 6);
        let ip = format!("{}.{}.{}.{}", parts[0], parts[1], parts[2], parts[3]);
        let port = parts[4] * 256 + parts[5];
        let data = TcpStream::connect((ip.as_str(), port)).expect("connect data port");
        data.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        data
    }
}

#[test]
fn login_is_required_for_filesystem_commands() {
    let server = start_server();
    let mut session = Session::connect(server.port);
    assert!(session.send("LIST").starts_with("530"));
    assert!(session.send("NOOP").starts_with("200"));
    assert!(session.send("WHAT").starts_with("500"));
}

#[test]
fn bad_password_gets_530_and_a_close() {
    let server = start_server();
    let mut session = Session::connect(server.port);
    assert!(session.send("USER foo").starts_with("331"));
    let reply = session.send("PASS wrong");
    assert!(reply.starts_with("530"), "reply: {}", reply);
    // Server closes once the reply drains.
    let mut rest = String::new();
    let _ = self::read_to_string_best_effort(&mut session.reader, &mut rest);
    assert!(rest.is_empty(), "unexpected extra data: {}", rest);
}

fn read_to_string_best_effort(reader: &mut BufReader<TcpStream>, out: &mut String) -> usize {
    let mut buf = [0u8; 256];
    let mut total = 0;
    loop {
        match reader.get_mut().read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                out.push_str(&String::from_utf8_lossy(&buf[..n]));
                total += n;
            }
            Err(_) => break,
        }
    }
    total
}

#[test]
fn stor_uploads_through_a_passive_connection() {
    let server = start_server();
    let mut session = Session::login(server.port);
    assert!(session.send("TYPE I").starts_with("200"));

    let mut data = session.open_passive();
    let reply = session.send("STOR /test/x");
    assert!(reply.starts_with("150 "), "STOR reply: {}", reply);

    data.write_all(b"Charity never faileth").unwrap();
    drop(data);

    let done = session.read_reply();
    assert_eq!(done, "226 Transfer successful.");
    assert_eq!(
        server.fs.contents("/test/x").unwrap(),
        b"Charity never faileth"
    );
}

#[test]
fn appe_appends_to_an_existing_file() {
    let server = start_server();
    let mut session = Session::login(server.port);

    let mut data = session.open_passive();
    assert!(session.send("APPE /test/existing.txt").starts_with("150"));
    data.write_all(b" plus more").unwrap();
    drop(data);
    assert!(session.read_reply().starts_with("226"));
    assert_eq!(
        server.fs.contents("/test/existing.txt").unwrap(),
        b"root initial data plus more"
    );
}

#[test]
fn retr_with_rest_delivers_from_the_offset() {
    let server = start_server();
    let mut session = Session::login(server.port);
    assert!(session.send("TYPE I").starts_with("200"));
    assert!(session.send("REST 1").starts_with("350"));

    let mut data = session.open_passive();
    let reply = session.send("RETR /test/existing.txt");
    assert!(reply.starts_with("150 "), "RETR reply: {}", reply);

    let mut body = Vec::new();
    data.read_to_end(&mut body).unwrap();
    assert_eq!(body, b"oot initial data");
    assert_eq!(session.read_reply(), "226 Transfer successful.");

    // The restart position is one-shot.
    let mut data = session.open_passive();
    assert!(session.send("RETR /test/existing.txt").starts_with("150"));
    let mut body = Vec::new();
    data.read_to_end(&mut body).unwrap();
    assert_eq!(body, b"root initial data");
    assert!(session.read_reply().starts_with("226"));
}

#[test]
fn rename_needs_a_source_first() {
    let server = start_server();
    let mut session = Session::login(server.port);

    assert!(session.send("RNFR /test/existing.txt").starts_with("350"));
    assert!(session.send("RNTO /test/b.txt").starts_with("250"));
    assert_eq!(server.fs.kind("/test/existing.txt"), None);
    assert!(server.fs.contents("/test/b.txt").is_some());

    // RNTO without a fresh RNFR is refused.
    let reply = session.send("RNTO /test/c.txt");
    assert!(reply.starts_with("560"), "reply: {}", reply);
}

#[test]
fn directory_listing_long_and_short() {
    let server = start_server();
    let mut session = Session::login(server.port);

    let mut data = session.open_passive();
    assert!(session.send("NLST /test").starts_with("150"));
    let mut listing = String::new();
    data.read_to_string(&mut listing).unwrap();
    assert!(session.read_reply().starts_with("226"));
    assert_eq!(listing, "existing.txt\r\n");

    let mut data = session.open_passive();
    assert!(session.send("LIST /test").starts_with("150"));
    let mut listing = String::new();
    data.read_to_string(&mut listing).unwrap();
    assert!(session.read_reply().starts_with("226"));
    assert!(listing.starts_with("-rw"), "listing: {}", listing);
    assert!(listing.contains("existing.txt"), "listing: {}", listing);
    assert!(listing.contains("root"), "listing: {}", listing);
}

#[test]
fn session_state_commands() {
    let server = start_server();
    let mut session = Session::login(server.port);

    assert_eq!(
        session.send("PWD"),
        "257 \"/\" is the current directory."
    );
    assert!(session.send("CWD /test").starts_with("250"));
    assert_eq!(
        session.send("PWD"),
        "257 \"/test\" is the current directory."
    );
    assert!(session.send("CDUP").starts_with("250"));
    assert_eq!(session.send("PWD"), "257 \"/\" is the current directory.");

    assert!(session.send("SYST").starts_with("215 UNIX"));
    assert!(session.send("STRU F").starts_with("200"));
    assert!(session.send("MODE S").starts_with("200"));
    assert!(session.send("MODE B").starts_with("502"));
    assert_eq!(session.send("SIZE /test/existing.txt"), "213 17 Bytes");
    assert!(session.send("MDTM /test/existing.txt").starts_with("213 "));

    assert!(session.send("MKD /test/sub").starts_with("257"));
    assert!(session.send("RMD /test/sub").starts_with("250"));
    assert!(session.send("DELE /test/existing.txt").starts_with("250"));
    assert!(session.send("CWD /missing").starts_with("550"));

    assert_eq!(session.send("QUIT"), "221 Goodbye.");
}
