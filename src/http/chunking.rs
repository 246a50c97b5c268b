use crate::buffers::OverflowBuffer;
use crate::http::find_double_newline;

/// Decoder for `Transfer-Encoding: chunked` request bodies.
///
/// Grammar (followed loosely, for robustness):
///
/// ```text
/// chunk        = size [';' extension] CRLF data CRLF
/// last-chunk   = "0" CRLF
/// trailer      = *(header CRLF) CRLF
/// ```
///
/// States move only forward: reading chunks alternates with reading
/// control lines until the zero chunk, then the trailer runs to the
/// double-newline terminator.
pub struct ChunkedReceiver {
    buf: OverflowBuffer,
    chunk_remainder: usize,
    control_line: Vec<u8>,
    all_chunks_received: bool,
    trailer: Vec<u8>,
    pub completed: bool,
}

impl ChunkedReceiver {
    pub fn new(buf: OverflowBuffer) -> Self {
        ChunkedReceiver {
            buf,
            chunk_remainder: 0,
            control_line: Vec::new(),
            all_chunks_received: false,
            trailer: Vec::new(),
            completed: false,
        }
    }

    /// Returns the number of bytes consumed; bytes past the trailer
    /// terminator belong to the next request.
    pub fn received(&mut self, data: &[u8]) -> usize {
        if self.completed {
            return 0;
        }
        let orig_size = data.len();
        let mut s = data;
        while !s.is_empty() {
            let rm = self.chunk_remainder;
            if rm > 0 {
                // Receive the remainder of a chunk.
                let take = rm.min(s.len());
                let _ = self.buf.append(&s[..take]);
                s = &s[take..];
                self.chunk_remainder -= take;
            } else if !self.all_chunks_received {
                // Receive a control line.
                match s.iter().position(|&b| b == b'\n') {
                    None => {
                        self.control_line.extend_from_slice(s);
                        s = &[];
                    }
                    Some(pos) => {
                        self.control_line.extend_from_slice(&s[..pos]);
                        s = &s[pos + 1..];
                        let line = std::mem::take(&mut self.control_line);
                        let line = trim_ascii(&line);
                        if !line.is_empty() {
                            // Drop any ";ext" part, parse the hex size.
                            let size_part = match line.iter().position(|&b| b == b';') {
                                Some(semi) => trim_ascii(&line[..semi]),
                                None => line,
                            };
                            let sz =
                                usize::from_str_radix(&String::from_utf8_lossy(size_part), 16)
                                    .unwrap_or(0);
                            if sz > 0 {
                                self.chunk_remainder = sz;
                            } else {
                                self.all_chunks_received = true;
                            }
                        }
                        // else: blank control line, keep looking.
                    }
                }
            } else {
                // Receive the trailer.
                let consumed_before = orig_size - s.len();
                let carried = self.trailer.len();
                self.trailer.extend_from_slice(s);
                s = &[];
                let end = if self.trailer.starts_with(b"\r\n") {
                    // No trailer at all.
                    Some(2)
                } else if self.trailer.starts_with(b"\n") {
                    Some(1)
                } else {
                    find_double_newline(&self.trailer)
                };
                match end {
                    Some(end) => {
                        self.completed = true;
                        self.trailer.truncate(end);
                        return consumed_before + end.saturating_sub(carried);
                    }
                    None => {
                        // Trailer not finished yet.
                    }
                }
            }
        }
        orig_size
    }

    pub fn into_buffer(self) -> OverflowBuffer {
        self.buf
    }

    /// The raw trailer block, terminator included.
    pub fn trailer_bytes(&self) -> &[u8] {
        &self.trailer
    }
}

fn trim_ascii(s: &[u8]) -> &[u8] {
    match s.iter().position(|b| !b.is_ascii_whitespace()) {
        None => &[],
        Some(start) => {
            let end = s.iter().rposition(|b| !b.is_ascii_whitespace()).unwrap() + 1;
            &s[start..end]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn receiver() -> ChunkedReceiver {
        ChunkedReceiver::new(OverflowBuffer::new(4096))
    }

    #[test]
    fn decodes_a_simple_body() {
        let mut r = receiver();
        let data = b"5\r\nHello\r\n7\r\n World!\r\n0\r\n\r\n";
        let n = r.received(data);
        assert_eq!(n, data.len());
        assert!(r.completed);
        assert_eq!(r.into_buffer().get_all().unwrap(), b"Hello World!");
    }

    #[test]
    fn extensions_on_the_size_line_are_dropped() {
        let mut r = receiver();
        let body: Vec<u8> = (0..32u8).collect();
        let mut data = b"20;ext=1\r\n".to_vec();
        data.extend_from_slice(&body);
        data.extend_from_slice(b"\r\n0\r\n\r\n");
        let n = r.received(&data);
        assert_eq!(n, data.len());
        assert!(r.completed);
        assert_eq!(r.into_buffer().get_all().unwrap(), body);
    }

    #[test]
    fn handles_arbitrary_fragmentation() {
        let data = b"5\r\nHello\r\n7\r\n World!\r\n0\r\n\r\n";
        for split in 1..data.len() - 1 {
            let mut r = receiver();
            let n1 = r.received(&data[..split]);
            assert_eq!(n1, split, "split at {}", split);
            let n2 = r.received(&data[split..]);
            assert!(r.completed, "split at {}", split);
            assert_eq!(n1 + n2, data.len(), "split at {}", split);
            assert_eq!(r.into_buffer().get_all().unwrap(), b"Hello World!");
        }
    }

    #[test]
    fn reports_excess_bytes_as_unconsumed() {
        let mut r = receiver();
        let data = b"3\r\nabc\r\n0\r\n\r\nGET / HTTP/1.0";
        let n = r.received(data);
        assert!(r.completed);
        assert_eq!(&data[n..], b"GET / HTTP/1.0");
        assert_eq!(r.into_buffer().get_all().unwrap(), b"abc");
    }

    #[test]
    fn trailer_headers_run_to_the_double_newline() {
        let mut r = receiver();
        let data = b"3\r\nabc\r\n0\r\nX-Checksum: 1\r\n\r\ntail";
        let n = r.received(data);
        assert!(r.completed);
        assert_eq!(&data[n..], b"tail");
        assert_eq!(r.trailer_bytes(), b"X-Checksum: 1\r\n\r\n");
    }

    #[test]
    fn split_terminator_across_calls() {
        let mut r = receiver();
        let n1 = r.received(b"3\r\nabc\r\n0\r\n");
        assert_eq!(n1, 11);
        assert!(!r.completed);
        let n2 = r.received(b"\r\nnext");
        assert!(r.completed);
        assert_eq!(n2, 2);
        assert_eq!(r.into_buffer().get_all().unwrap(), b"abc");
    }

    #[test]
    fn consumes_nothing_once_complete() {
        let mut r = receiver();
        r.received(b"0\r\n\r\n");
        assert!(r.completed);
        assert_eq!(r.received(b"more"), 0);
    }
}
