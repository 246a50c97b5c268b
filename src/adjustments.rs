use std::time::Duration;

/// Socket options applied to every accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketOption {
    NoDelay(bool),
    Ttl(u32),
}

/// Tunable communication parameters, shared read-only by the servers and
/// every channel they create. Construct once, wrap in an `Arc`, and never
/// mutate after the accept loop starts.
#[derive(Debug, Clone)]
pub struct Adjustments {
    /// Argument to `listen()`.
    pub backlog: u32,
    /// Maximum bytes pulled from a socket per `read` call.
    pub recv_bytes: usize,
    /// Maximum bytes pushed to a socket per `write` call.
    pub send_bytes: usize,
    /// Chunk size when shuffling buffered data between files.
    pub copy_bytes: usize,
    /// Pending output spills to a tempfile past this size.
    pub outbuf_overflow: usize,
    /// Received data spills to a tempfile past this size.
    pub inbuf_overflow: usize,
    /// Stop accepting new connections when this many are active.
    pub connection_limit: usize,
    /// Minimum interval between sweeps for inactive channels.
    pub cleanup_interval: Duration,
    /// Inactive connections older than this are closed by the sweep.
    pub channel_timeout: Duration,
    /// Turn off to silence premature client disconnects.
    pub log_socket_errors: bool,
    pub socket_options: Vec<SocketOption>,
}

impl Default for Adjustments {
    fn default() -> Self {
        Adjustments {
            backlog: 1024,
            recv_bytes: 8192,
            send_bytes: 8192,
            copy_bytes: 65536,
            outbuf_overflow: 1_050_000,
            inbuf_overflow: 525_000,
            connection_limit: 100,
            cleanup_interval: Duration::from_secs(300),
            channel_timeout: Duration::from_secs(900),
            log_socket_errors: true,
            socket_options: Vec::new(),
        }
    }
}
