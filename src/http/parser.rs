use std::collections::HashMap;
use std::io::{self, Read};
use std::sync::Arc;

use crate::adjustments::Adjustments;
use crate::buffers::OverflowBuffer;
use crate::http::chunking::ChunkedReceiver;
use crate::http::find_double_newline;
use crate::http::receiver::FixedStreamReceiver;
use crate::serverbase::StreamConsumer;

enum BodyReceiver {
    Fixed(FixedStreamReceiver),
    Chunked(ChunkedReceiver),
}

impl BodyReceiver {
    fn received(&mut self, data: &[u8]) -> usize {
        match self {
            BodyReceiver::Fixed(r) => r.received(data),
            BodyReceiver::Chunked(r) => r.received(data),
        }
    }

    fn completed(&self) -> bool {
        match self {
            BodyReceiver::Fixed(r) => r.completed,
            BodyReceiver::Chunked(r) => r.completed,
        }
    }

    fn into_buffer(self) -> OverflowBuffer {
        match self {
            BodyReceiver::Fixed(r) => r.into_buffer(),
            BodyReceiver::Chunked(r) => r.into_buffer(),
        }
    }
}

/// Read adapter over the buffered request body, handed to the application
/// as its input stream.
pub struct BodyStream {
    buf: OverflowBuffer,
}

impl BodyStream {
    pub fn empty() -> Self {
        BodyStream {
            buf: OverflowBuffer::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

impl Read for BodyStream {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        self.buf
            .read_into(out)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// Collects one HTTP request incrementally: the request line plus headers
/// up to the first double newline, then the body via a fixed-length or
/// chunked receiver. Once `completed`, the instance consumes no further
/// bytes and is handed to the task constructor.
pub struct HttpRequestParser {
    adj: Arc<Adjustments>,
    pub completed: bool,
    pub empty: bool,
    header_plus: Vec<u8>,

    pub first_line: String,
    /// Header keys are uppercased with dashes turned into underscores;
    /// duplicates concatenate with `, `.
    pub headers: HashMap<String, String>,
    pub command: String,
    pub uri: String,
    pub version: Option<String>,
    pub proxy_scheme: Option<String>,
    pub proxy_netloc: Option<String>,
    pub path: String,
    pub query: Option<String>,
    pub fragment: Option<String>,

    pub chunked: bool,
    pub content_length: usize,
    body_rcv: Option<BodyReceiver>,
}

impl HttpRequestParser {
    pub fn new(adj: Arc<Adjustments>) -> Self {
        HttpRequestParser {
            adj,
            completed: false,
            empty: false,
            header_plus: Vec::new(),
            first_line: String::new(),
            headers: HashMap::new(),
            command: String::new(),
            uri: String::new(),
            version: None,
            proxy_scheme: None,
            proxy_netloc: None,
            path: String::new(),
            query: None,
            fragment: None,
            chunked: false,
            content_length: 0,
            body_rcv: None,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|s| s.as_str())
    }

    /// Takes the buffered body out of the parser.
    pub fn body_stream(&mut self) -> BodyStream {
        match self.body_rcv.take() {
            Some(rcv) => BodyStream {
                buf: rcv.into_buffer(),
            },
            None => BodyStream::empty(),
        }
    }

    fn parse_header(&mut self, header_plus: &[u8]) {
        let (first_line, header) = match header_plus.iter().position(|&b| b == b'\n') {
            Some(index) => (&header_plus[..index], &header_plus[index + 1..]),
            None => (header_plus, &[][..]),
        };
        self.first_line = String::from_utf8_lossy(first_line).trim_end().to_string();

        for line in fold_header_lines(header) {
            let Some(index) = line.find(':') else {
                // Garbage in the headers; skip the line.
                continue;
            };
            if index == 0 {
                continue;
            }
            let key = line[..index].to_uppercase().replace('-', "_");
            let value = line[index + 1..].trim().to_string();
            // Duplicate headers concatenate with a comma, the same way an
            // upstream front end would have joined them.
            self.headers
                .entry(key)
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(&value);
                })
                .or_insert(value);
        }

        self.crack_first_line();
        self.split_uri();

        if self.version.as_deref() == Some("1.1")
            && self.header("TRANSFER_ENCODING") == Some("chunked")
        {
            self.chunked = true;
            let buf = OverflowBuffer::new(self.adj.inbuf_overflow);
            self.body_rcv = Some(BodyReceiver::Chunked(ChunkedReceiver::new(buf)));
        }
        if !self.chunked {
            let cl = self
                .header("CONTENT_LENGTH")
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            self.content_length = cl;
            if cl > 0 {
                let buf = OverflowBuffer::new(self.adj.inbuf_overflow);
                self.body_rcv = Some(BodyReceiver::Fixed(FixedStreamReceiver::new(cl, buf)));
            }
        }
    }

    /// `METHOD URI [HTTP/VERSION]`; an unparsable line leaves everything
    /// empty and the request proceeds as an error case downstream.
    fn crack_first_line(&mut self) {
        let mut parts = self.first_line.splitn(3, ' ').filter(|p| !p.is_empty());
        if let Some(command) = parts.next() {
            self.command = command.to_uppercase();
        }
        if let Some(uri) = parts.next() {
            self.uri = uri.to_string();
        }
        if let Some(rest) = parts.next() {
            if let Some(version) = rest.trim().strip_prefix("HTTP/") {
                self.version = Some(version.to_string());
            }
        }
    }

    /// Splits the URI into path/query/fragment; absolute-form URIs (proxy
    /// requests) keep scheme and netloc separately. Percent-escapes are
    /// decoded in the path only, never the query.
    fn split_uri(&mut self) {
        let uri = self.uri.clone();
        let mut rest = uri.as_str();
        if looks_absolute(rest) {
            if let Ok(parsed) = url::Url::parse(rest) {
                self.proxy_scheme = Some(parsed.scheme().to_string());
                let netloc = match (parsed.host_str(), parsed.port()) {
                    (Some(host), Some(port)) => format!("{}:{}", host, port),
                    (Some(host), None) => host.to_string(),
                    _ => String::new(),
                };
                self.proxy_netloc = Some(netloc);
                self.path = unquote(parsed.path());
                self.query = parsed.query().map(|q| q.to_string());
                self.fragment = parsed.fragment().map(|f| f.to_string());
                return;
            }
        }
        if let Some((before, fragment)) = rest.split_once('#') {
            self.fragment = Some(fragment.to_string());
            rest = before;
        }
        let path = match rest.split_once('?') {
            Some((path, query)) => {
                if !query.is_empty() {
                    self.query = Some(query.to_string());
                }
                path
            }
            None => rest,
        };
        self.path = unquote(path);
    }
}

impl StreamConsumer for HttpRequestParser {
    /// Receives the HTTP stream for one request and returns the number of
    /// bytes consumed, so the caller can re-feed the tail to a fresh
    /// parser.
    fn received(&mut self, data: &[u8]) -> usize {
        if self.completed {
            return 0;
        }
        match self.body_rcv.as_mut() {
            None => {
                // In header.
                let mut s = std::mem::take(&mut self.header_plus);
                s.extend_from_slice(data);
                match find_double_newline(&s) {
                    Some(index) => {
                        let consumed = data.len() - (s.len() - index);
                        let header_block = &s[..index];
                        // Tolerate blank lines before the request line.
                        let trimmed = trim_leading_whitespace(header_block);
                        if trimmed.is_empty() {
                            self.empty = true;
                            self.completed = true;
                        } else {
                            let block = trimmed.to_vec();
                            self.parse_header(&block);
                            if self.body_rcv.is_none() {
                                self.completed = true;
                            }
                        }
                        consumed
                    }
                    None => {
                        // Header not finished yet.
                        self.header_plus = s;
                        data.len()
                    }
                }
            }
            Some(receiver) => {
                let consumed = receiver.received(data);
                if receiver.completed() {
                    self.completed = true;
                }
                consumed
            }
        }
    }

    fn completed(&self) -> bool {
        self.completed
    }

    fn is_empty(&self) -> bool {
        self.empty
    }
}

fn looks_absolute(uri: &str) -> bool {
    match uri.find("://") {
        Some(pos) => {
            pos > 0
                && uri[..pos]
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.')
                && uri[..1].chars().all(|c| c.is_ascii_alphabetic())
        }
        None => false,
    }
}

fn unquote(path: &str) -> String {
    if path.contains('%') {
        String::from_utf8_lossy(&urlencoding::decode_binary(path.as_bytes())).into_owned()
    } else {
        path.to_string()
    }
}

fn trim_leading_whitespace(s: &[u8]) -> &[u8] {
    match s.iter().position(|b| !b.is_ascii_whitespace()) {
        Some(start) => &s[start..],
        None => &[],
    }
}

/// Splits the header block into lines, joining continuation lines (those
/// starting with space or tab) onto their predecessor.
fn fold_header_lines(header: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(header);
    let mut lines: Vec<String> = Vec::new();
    for raw in text.split('\n') {
        let raw = raw.strip_suffix('\r').unwrap_or(raw);
        if raw.is_empty() {
            continue;
        }
        if (raw.starts_with(' ') || raw.starts_with('\t')) && !lines.is_empty() {
            let last = lines.last_mut().unwrap();
            last.push_str(&raw[1..]);
        } else {
            lines.push(raw.to_string());
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> HttpRequestParser {
        HttpRequestParser::new(Arc::new(Adjustments::default()))
    }

    #[test]
    fn parses_a_simple_get() {
        let mut p = parser();
        let data = b"GET /info?txt=10 HTTP/1.0\r\nHost: example.com\r\n\r\n";
        let n = p.received(data);
        assert_eq!(n, data.len());
        assert!(p.completed);
        assert_eq!(p.command, "GET");
        assert_eq!(p.path, "/info");
        assert_eq!(p.query.as_deref(), Some("txt=10"));
        assert_eq!(p.version.as_deref(), Some("1.0"));
        assert_eq!(p.header("HOST"), Some("example.com"));
    }

    #[test]
    fn consumes_exactly_one_message() {
        let mut p = parser();
        let data = b"GET / HTTP/1.0\r\nContent-Length: 5\r\n\r\nhelloGET /next HTTP/1.0\r\n\r\n";
        let mut consumed = 0;
        while !p.completed {
            consumed += p.received(&data[consumed..]);
        }
        assert_eq!(&data[consumed..], b"GET /next HTTP/1.0\r\n\r\n");
        let mut body = Vec::new();
        p.body_stream().read_to_end(&mut body).unwrap();
        assert_eq!(body, b"hello");
        // A fresh parser picks up the pipelined tail.
        let mut p2 = parser();
        let n2 = p2.received(&data[consumed..]);
        assert_eq!(n2, data.len() - consumed);
        assert!(p2.completed);
        assert_eq!(p2.path, "/next");
    }

    #[test]
    fn feeds_arrive_byte_by_byte() {
        let mut p = parser();
        let data = b"POST /x HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc";
        for b in data.iter() {
            assert!(!p.completed);
            assert_eq!(p.received(std::slice::from_ref(b)), 1);
        }
        assert!(p.completed);
        assert_eq!(p.body_stream().len(), 3);
    }

    #[test]
    fn folds_continuation_lines() {
        let mut p = parser();
        p.received(b"GET / HTTP/1.0\r\nX-Note: one\r\n two\r\n\r\n");
        assert_eq!(p.header("X_NOTE"), Some("onetwo"));
    }

    #[test]
    fn duplicate_headers_concatenate() {
        let mut p = parser();
        p.received(b"GET / HTTP/1.0\r\nX-Id: a\r\nX-Id: b\r\n\r\n");
        assert_eq!(p.header("X_ID"), Some("a, b"));
    }

    #[test]
    fn keys_are_canonicalized() {
        let mut p = parser();
        p.received(b"GET / HTTP/1.0\r\ncontent-type: text/plain\r\n\r\n");
        assert_eq!(p.header("CONTENT_TYPE"), Some("text/plain"));
    }

    #[test]
    fn absolute_uri_captures_scheme_and_netloc() {
        let mut p = parser();
        p.received(b"GET http://example.com:8080/foo/bar?q=1 HTTP/1.1\r\n\r\n");
        assert_eq!(p.proxy_scheme.as_deref(), Some("http"));
        assert_eq!(p.proxy_netloc.as_deref(), Some("example.com:8080"));
        assert_eq!(p.path, "/foo/bar");
        assert_eq!(p.query.as_deref(), Some("q=1"));
    }

    #[test]
    fn percent_escapes_decode_in_path_only() {
        let mut p = parser();
        p.received(b"GET /a%20b?x=%20 HTTP/1.0\r\n\r\n");
        assert_eq!(p.path, "/a b");
        assert_eq!(p.query.as_deref(), Some("x=%20"));
    }

    #[test]
    fn chunked_body_only_for_http_11() {
        let mut p = parser();
        let data = b"GET / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\n";
        let mut consumed = 0;
        while !p.completed {
            consumed += p.received(&data[consumed..]);
        }
        assert_eq!(consumed, data.len());
        assert!(p.chunked);
        let mut body = Vec::new();
        p.body_stream().read_to_end(&mut body).unwrap();
        assert_eq!(body, b"abc");
    }

    #[test]
    fn chunked_header_is_ignored_for_http_10() {
        let mut p = parser();
        let data = b"GET / HTTP/1.0\r\nTransfer-Encoding: chunked\r\n\r\n";
        p.received(data);
        assert!(p.completed);
        assert!(!p.chunked);
    }

    #[test]
    fn unparsable_content_length_means_no_body() {
        let mut p = parser();
        p.received(b"GET / HTTP/1.0\r\nContent-Length: abc\r\n\r\n");
        assert!(p.completed);
        assert_eq!(p.content_length, 0);
    }

    #[test]
    fn blank_input_is_an_empty_request() {
        let mut p = parser();
        p.received(b"\r\n\r\n");
        assert!(p.completed);
        assert!(p.is_empty());
    }

    #[test]
    fn lenient_about_bare_lf_terminators() {
        let mut p = parser();
        let data = b"GET /path HTTP/1.0\nHost: h\n\n";
        let n = p.received(data);
        assert_eq!(n, data.len());
        assert!(p.completed);
        assert_eq!(p.path, "/path");
        assert_eq!(p.header("HOST"), Some("h"));
    }
}
