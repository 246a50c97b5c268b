use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use mio::Token;
use mio::net::{TcpListener, TcpStream};
use parking_lot::Mutex;
use tracing::warn;

use crate::ftp::channel::FtpChannel;
use crate::reactor::{EventHandler, Reactor};

/// One-shot listener for a single incoming FTP data connection, bound to
/// the interface the control connection arrived on. If a data channel is
/// already waiting when the client connects, the socket is handed over
/// directly; otherwise it is stashed until the transfer command arrives.
/// Either way the acceptor closes itself after one acceptance.
pub struct PassiveAcceptor {
    listener: TcpListener,
    token: Token,
    pub addr: SocketAddr,
    reactor: Arc<Reactor>,
    control: Weak<FtpChannel>,
    ready: Mutex<Option<(TcpStream, SocketAddr)>>,
    closed: AtomicBool,
}

impl PassiveAcceptor {
    pub fn new(control: &Arc<FtpChannel>) -> io::Result<Arc<Self>> {
        let ip = control
            .core()
            .local_addr()
            .map(|a| a.ip())
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let mut listener = TcpListener::bind(SocketAddr::new(ip, 0))?;
        let addr = listener.local_addr()?;
        let reactor = Arc::clone(control.reactor());
        let token = reactor.register_readable(&mut listener)?;
        let acceptor = Arc::new(PassiveAcceptor {
            listener,
            token,
            addr,
            reactor: Arc::clone(&reactor),
            control: Arc::downgrade(control),
            ready: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        reactor.insert(token, Arc::clone(&acceptor) as Arc<dyn EventHandler>);
        Ok(acceptor)
    }

    /// The stashed connection, if the client connected before the
    /// transfer command created a data channel.
    pub fn take_ready(&self) -> Option<(TcpStream, SocketAddr)> {
        self.ready.lock().take()
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.reactor.remove(self.token);
        }
    }
}

impl EventHandler for PassiveAcceptor {
    fn ready(self: Arc<Self>, _reactor: &Arc<Reactor>, _readable: bool, _writable: bool) {
        match self.listener.accept() {
            Ok((stream, addr)) => {
                if let Some(control) = self.control.upgrade() {
                    let dc = control.client_dc();
                    match dc {
                        Some(dc) if !dc.is_connected() => {
                            if let Err(err) = dc.attach(stream, addr) {
                                warn!("could not attach passive data connection: {}", err);
                            }
                            control.clear_passive_acceptor();
                        }
                        _ => {
                            *self.ready.lock() = Some((stream, addr));
                        }
                    }
                }
                self.close();
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => {
                warn!("passive acceptor error: {}", err);
                self.close();
            }
        }
    }
}
