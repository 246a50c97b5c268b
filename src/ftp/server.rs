use std::io;
use std::sync::Arc;

use crate::ftp::channel::FtpChannel;
use crate::reactor::{EventHandler, Reactor};
use crate::serverbase::{ServerBase, ServerConfig};
use crate::vfs::FilesystemAccess;

/// FTP server: accepts control connections and hands each one an
/// authenticated view of the filesystem.
pub struct FtpServer {
    pub base: Arc<ServerBase>,
    pub fs_access: Arc<dyn FilesystemAccess>,
}

impl FtpServer {
    pub const SERVER_IDENT: &'static str = "polyserve/ftp";

    pub fn new(
        fs_access: Arc<dyn FilesystemAccess>,
        config: ServerConfig,
        reactor: Arc<Reactor>,
    ) -> io::Result<Arc<Self>> {
        let base = ServerBase::new(config, Self::SERVER_IDENT.to_string(), reactor)?;
        let server = Arc::new(FtpServer { base, fs_access });
        server
            .base
            .reactor
            .insert(server.base.token, Arc::clone(&server) as Arc<dyn EventHandler>);
        Ok(server)
    }
}

impl EventHandler for FtpServer {
    fn ready(self: Arc<Self>, _reactor: &Arc<Reactor>, _readable: bool, _writable: bool) {
        let server = Arc::clone(&self);
        self.base.poll_accept(move |stream, addr, token| {
            FtpChannel::new(Arc::clone(&server), stream, addr, token)
        });
    }
}
