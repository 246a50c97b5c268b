//! Explicit interfaces at the seams of the framework: byte streams handed
//! across the application and filesystem boundaries, hit logging, and the
//! optional reverse-resolver consumed by the loggers and the CGI
//! environment builder.

use std::io::{self, Read};
use std::net::IpAddr;

/// Destination for produced bytes (download streams, listing output).
pub trait ByteSink {
    fn write_bytes(&mut self, data: &[u8]) -> io::Result<()>;

    fn flush_bytes(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ByteSink for Vec<u8> {
    fn write_bytes(&mut self, data: &[u8]) -> io::Result<()> {
        self.extend_from_slice(data);
        Ok(())
    }
}

/// Source of request/file bytes. Anything `Read` qualifies; the alias keeps
/// the boundary explicit.
pub trait ByteStream: Read + Send {}

impl<T: Read + Send> ByteStream for T {}

/// One serviced request, flattened for the hit log.
#[derive(Debug, Clone)]
pub struct HitRecord {
    pub remote_addr: IpAddr,
    pub user_name: String,
    /// The request line (HTTP) or command line (FTP).
    pub first_line: String,
    pub status: String,
    pub bytes_written: usize,
    pub referer: String,
    pub user_agent: String,
}

/// Sink for completed requests. Implementations are out of scope for the
/// core pipeline; `accesslog::CommonAccessLogger` provides the usual one.
pub trait HitLog: Send + Sync {
    fn log(&self, hit: &HitRecord);
}

/// Optional reverse resolver. Only cache lookups are consumed; no resolver
/// is implemented here.
pub trait Resolver: Send + Sync {
    /// Returns the cached host name for `addr`, if any. Must not block.
    fn cached_host(&self, addr: IpAddr) -> Option<String>;
}
