pub mod chunking;
pub mod parser;
pub mod receiver;
pub mod server;
pub mod task;

pub use parser::{BodyStream, HttpRequestParser};
pub use server::{
    AppError, Application, HttpChannel, HttpServer, Responder, ResponseError, WsgiEnviron,
};
pub use task::HttpTask;

/// Position just past the first double newline (`\r\n\r\n` or the more
/// lenient `\n\n`), or `None` when the block is still incomplete.
pub fn find_double_newline(s: &[u8]) -> Option<usize> {
    let crlf = find(s, b"\n\r\n").map(|p| p + 3);
    let lf = find(s, b"\n\n").map(|p| p + 2);
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
