//! Blocking HTTPS request/response helper used by the bootstrap exchange.
//!
//! Supports `GET`, `POST` and `CONNECT`, optionally tunneled through an HTTP
//! proxy. The response is read into a [`RingBuf`] and advanced through a
//! three-state parser (status line, headers, body). Every phase checks a
//! wall-clock deadline derived from the caller-supplied timeout.
//!
//! This helper is intentionally blocking; the lifecycle drives it from
//! `spawn_blocking` so the bootstrap never stalls the async runtime.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, trace};
use url::Url;

use super::proxy::ProxyConfig;
use super::ringbuf::RingBuf;
use super::b64_encode;

const USER_AGENT: &str = concat!("cloudlink/", env!("CARGO_PKG_VERSION"));
const RECV_BUF_SIZE: usize = 16 * 1024;
const POLL_SLICE: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum HttpsError {
    #[error("TCP connect failed: {0}")]
    ConnectFailed(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    #[error("Malformed HTTP response: {0}")]
    HeaderMalformed(String),

    #[error("Response body exceeds the allowed maximum")]
    BodyTooLarge,

    #[error("Request deadline exceeded")]
    Timeout,

    #[error("Proxy refused CONNECT with status {0}")]
    ProxyRejected(u16),

    #[error("Configured proxy type cannot tunnel HTTPS (only HTTP proxies are supported)")]
    UnsupportedProxy,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// One outgoing request. `headers` are emitted verbatim after the standard
/// `Host` and `User-Agent` lines.
pub struct HttpsRequest<'a> {
    pub method: Method,
    pub url: &'a Url,
    pub headers: Vec<(String, String)>,
    pub payload: Option<&'a [u8]>,
    pub timeout: Duration,
    pub proxy: Option<&'a ProxyConfig>,
    /// Hard cap on the response body.
    pub max_response: usize,
}

#[derive(Debug)]
pub struct HttpsResponse {
    pub code: u16,
    headers: HashMap<String, String>,
    pub payload: Vec<u8>,
}

impl HttpsResponse {
    /// Case-folded header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|s| s.as_str())
    }

    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ParseResult {
    NeedMoreData,
    Done,
}

#[derive(Debug, PartialEq, Eq)]
enum ParsePhase {
    StatusLine,
    Headers,
    Body,
}

/// Incremental HTTP/1.1 response parser fed from a ring buffer.
///
/// `head_only` responses (CONNECT) complete at the end of the header block;
/// otherwise a `content-length` header arms the body reader and the parse is
/// complete once that many bytes are buffered.
pub struct ResponseParser {
    phase: ParsePhase,
    head_only: bool,
    max_body: usize,
    code: u16,
    headers: HashMap<String, String>,
    content_length: Option<usize>,
    body: Vec<u8>,
}

impl ResponseParser {
    pub fn new(head_only: bool, max_body: usize) -> Self {
        Self {
            phase: ParsePhase::StatusLine,
            head_only,
            max_body,
            code: 0,
            headers: HashMap::new(),
            content_length: None,
            body: Vec::new(),
        }
    }

    pub fn parse(&mut self, rb: &mut RingBuf) -> Result<ParseResult, HttpsError> {
        loop {
            match self.phase {
                ParsePhase::StatusLine => {
                    let Some(line) = take_line(rb) else {
                        return Ok(ParseResult::NeedMoreData);
                    };
                    self.code = parse_status_line(&line)?;
                    self.phase = ParsePhase::Headers;
                }
                ParsePhase::Headers => {
                    let Some(line) = take_line(rb) else {
                        return Ok(ParseResult::NeedMoreData);
                    };
                    if line.is_empty() {
                        if self.head_only {
                            return Ok(ParseResult::Done);
                        }
                        match self.content_length {
                            None | Some(0) => return Ok(ParseResult::Done),
                            Some(n) if n > self.max_body => {
                                return Err(HttpsError::BodyTooLarge)
                            }
                            Some(n) => {
                                self.body.reserve(n);
                                self.phase = ParsePhase::Body;
                            }
                        }
                        continue;
                    }
                    let (key, value) = split_header(&line)?;
                    if key == "content-length" {
                        let len = value.parse::<usize>().map_err(|_| {
                            HttpsError::HeaderMalformed(format!(
                                "bad content-length '{value}'"
                            ))
                        })?;
                        self.content_length = Some(len);
                    }
                    self.headers.insert(key, value);
                }
                ParsePhase::Body => {
                    let want = self.content_length.unwrap_or(0) - self.body.len();
                    if want == 0 {
                        return Ok(ParseResult::Done);
                    }
                    if rb.is_empty() {
                        return Ok(ParseResult::NeedMoreData);
                    }
                    let chunk = rb.peek_linear_read();
                    let n = chunk.len().min(want);
                    self.body.extend_from_slice(&chunk[..n]);
                    rb.bump_head(n);
                }
            }
        }
    }

    fn into_response(self) -> HttpsResponse {
        HttpsResponse {
            code: self.code,
            headers: self.headers,
            payload: self.body,
        }
    }
}

/// Extracts one CRLF-terminated line, consuming it from the buffer.
fn take_line(rb: &mut RingBuf) -> Option<String> {
    let at = rb.find(b"\r\n")?;
    let raw = rb.peek_copy(at);
    rb.bump_head(at + 2);
    Some(String::from_utf8_lossy(&raw).into_owned())
}

fn parse_status_line(line: &str) -> Result<u16, HttpsError> {
    let malformed = || HttpsError::HeaderMalformed(format!("bad status line '{line}'"));
    let rest = line.strip_prefix("HTTP/1.1 ").ok_or_else(malformed)?;
    let digits = rest.get(..3).ok_or_else(malformed)?;
    let code: u16 = digits.parse().map_err(|_| malformed())?;
    if !(100..=599).contains(&code) {
        return Err(malformed());
    }
    Ok(code)
}

fn split_header(line: &str) -> Result<(String, String), HttpsError> {
    let idx = line
        .find(':')
        .ok_or_else(|| HttpsError::HeaderMalformed(format!("bad header line '{line}'")))?;
    Ok((
        line[..idx].trim().to_ascii_lowercase(),
        line[idx + 1..].trim().to_string(),
    ))
}

/// Performs one blocking request, tunneling through the proxy when one is
/// configured.
pub fn https_request(req: &HttpsRequest<'_>) -> Result<HttpsResponse, HttpsError> {
    let deadline = Instant::now() + req.timeout;

    let target_host = req
        .url
        .host_str()
        .ok_or_else(|| HttpsError::ConnectFailed("URL has no host".into()))?
        .to_string();
    let target_port = req.url.port().unwrap_or(443);

    let (connect_host, connect_port) = match req.proxy {
        Some(p) if p.is_http() => (p.host.clone(), p.port),
        Some(_) => return Err(HttpsError::UnsupportedProxy),
        None => (target_host.clone(), target_port),
    };

    let mut tcp = tcp_connect(&connect_host, connect_port, deadline)?;

    if let Some(proxy) = req.proxy {
        connect_tunnel(&mut tcp, proxy, &target_host, target_port, deadline)?;
    }

    let connector = tls_connector()?;
    let mut stream = tls_handshake(&connector, &target_host, tcp, deadline)?;

    send_request(&mut stream, req, &target_host)?;

    let parser = ResponseParser::new(false, req.max_response);
    read_response(&mut stream, parser, deadline)
}

fn tcp_connect(host: &str, port: u16, deadline: Instant) -> Result<TcpStream, HttpsError> {
    let addrs: Vec<_> = (host, port)
        .to_socket_addrs()
        .map_err(|e| HttpsError::ConnectFailed(format!("resolve {host}: {e}")))?
        .collect();
    let addr = addrs
        .first()
        .ok_or_else(|| HttpsError::ConnectFailed(format!("no address for {host}")))?;
    let remaining = remaining_or_timeout(deadline)?;
    let stream = TcpStream::connect_timeout(addr, remaining)
        .map_err(|e| HttpsError::ConnectFailed(format!("{addr}: {e}")))?;
    stream.set_nodelay(true).ok();
    // short slices so every read loop can observe the wall-clock deadline
    stream.set_read_timeout(Some(POLL_SLICE))?;
    stream.set_write_timeout(Some(POLL_SLICE))?;
    debug!("Connected TCP to {addr}");
    Ok(stream)
}

/// Issues `CONNECT target:port` on a fresh proxy connection and requires a
/// `200` response before TLS starts.
fn connect_tunnel(
    tcp: &mut TcpStream,
    proxy: &ProxyConfig,
    target_host: &str,
    target_port: u16,
    deadline: Instant,
) -> Result<(), HttpsError> {
    let mut request = format!(
        "CONNECT {target_host}:{target_port} HTTP/1.1\r\n\
         Host: {target_host}\r\n\
         User-Agent: {USER_AGENT}\r\n"
    );
    if let Some((user, pass)) = &proxy.credentials {
        let token = b64_encode(format!("{user}:{pass}").as_bytes());
        request.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
    }
    request.push_str("\r\n");
    tcp.write_all(request.as_bytes())?;

    let parser = ResponseParser::new(true, 0);
    let response = read_response(tcp, parser, deadline)?;
    if response.code != 200 {
        return Err(HttpsError::ProxyRejected(response.code));
    }
    trace!("CONNECT tunnel to {target_host}:{target_port} established");
    Ok(())
}

fn tls_connector() -> Result<native_tls::TlsConnector, HttpsError> {
    let mut builder = native_tls::TlsConnector::builder();
    #[cfg(feature = "allow-self-signed")]
    builder.danger_accept_invalid_certs(true);
    builder
        .build()
        .map_err(|e| HttpsError::TlsHandshake(e.to_string()))
}

fn tls_handshake(
    connector: &native_tls::TlsConnector,
    host: &str,
    tcp: TcpStream,
    deadline: Instant,
) -> Result<native_tls::TlsStream<TcpStream>, HttpsError> {
    tcp.set_read_timeout(Some(POLL_SLICE))?;
    tcp.set_write_timeout(Some(POLL_SLICE))?;
    let mut pending = match connector.connect(host, tcp) {
        Ok(stream) => return Ok(stream),
        Err(native_tls::HandshakeError::WouldBlock(mid)) => mid,
        Err(native_tls::HandshakeError::Failure(e)) => {
            return Err(HttpsError::TlsHandshake(e.to_string()))
        }
    };
    loop {
        remaining_or_timeout(deadline)?;
        match pending.handshake() {
            Ok(stream) => return Ok(stream),
            Err(native_tls::HandshakeError::WouldBlock(mid)) => pending = mid,
            Err(native_tls::HandshakeError::Failure(e)) => {
                return Err(HttpsError::TlsHandshake(e.to_string()))
            }
        }
    }
}

fn send_request<S: Write>(
    stream: &mut S,
    req: &HttpsRequest<'_>,
    host: &str,
) -> Result<(), HttpsError> {
    let verb = match req.method {
        Method::Get => "GET",
        Method::Post => "POST",
    };
    let mut path = req.url.path().to_string();
    if let Some(q) = req.url.query() {
        path.push('?');
        path.push_str(q);
    }
    let mut head = format!(
        "{verb} {path} HTTP/1.1\r\nHost: {host}\r\nUser-Agent: {USER_AGENT}\r\n"
    );
    for (name, value) in &req.headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    if let Some(payload) = req.payload {
        head.push_str(&format!("Content-Length: {}\r\n", payload.len()));
    }
    head.push_str("\r\n");
    stream.write_all(head.as_bytes())?;
    if let Some(payload) = req.payload {
        stream.write_all(payload)?;
    }
    stream.flush()?;
    Ok(())
}

/// Reads from `stream` into a ring buffer until the parser completes or the
/// deadline passes. Short read timeouts keep the deadline check live.
fn read_response<S: Read>(
    stream: &mut S,
    mut parser: ResponseParser,
    deadline: Instant,
) -> Result<HttpsResponse, HttpsError> {
    let mut rb = RingBuf::new(RECV_BUF_SIZE);
    loop {
        match parser.parse(&mut rb)? {
            ParseResult::Done => return Ok(parser.into_response()),
            ParseResult::NeedMoreData => {}
        }
        remaining_or_timeout(deadline)?;

        let span = rb.peek_linear_write();
        if span.is_empty() {
            // parser is lagging behind a full buffer; should not happen with
            // bodies drained eagerly
            return Err(HttpsError::HeaderMalformed("response buffer overflow".into()));
        }
        match stream.read(span) {
            Ok(0) => {
                return Err(HttpsError::HeaderMalformed(
                    "connection closed mid-response".into(),
                ))
            }
            Ok(n) => {
                rb.bump_tail(n);
            }
            Err(e)
                if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn remaining_or_timeout(deadline: Instant) -> Result<Duration, HttpsError> {
    let now = Instant::now();
    if now >= deadline {
        return Err(HttpsError::Timeout);
    }
    Ok(deadline - now)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(parser: &mut ResponseParser, bytes: &[u8]) -> Result<ParseResult, HttpsError> {
        let mut rb = RingBuf::new(4096);
        rb.push(bytes);
        parser.parse(&mut rb)
    }

    #[test]
    fn parses_well_formed_response() {
        let mut parser = ResponseParser::new(false, 1024);
        let result = feed(
            &mut parser,
            b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nhello",
        )
        .unwrap();
        assert_eq!(result, ParseResult::Done);
        let response = parser.into_response();
        assert_eq!(response.code, 200);
        assert_eq!(response.header("content-type"), Some("text/plain"));
        assert_eq!(response.header("Content-Type"), Some("text/plain"));
        assert_eq!(response.payload, b"hello");
    }

    #[test]
    fn short_body_needs_more_data() {
        let mut parser = ResponseParser::new(false, 1024);
        let result = feed(
            &mut parser,
            b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nhel",
        )
        .unwrap();
        assert_eq!(result, ParseResult::NeedMoreData);
    }

    #[test]
    fn incremental_delivery_completes() {
        let mut parser = ResponseParser::new(false, 1024);
        let mut rb = RingBuf::new(4096);
        rb.push(b"HTTP/1.1 201 Created\r\nConte");
        assert_eq!(parser.parse(&mut rb).unwrap(), ParseResult::NeedMoreData);
        rb.push(b"nt-Length: 4\r\n\r\nbo");
        assert_eq!(parser.parse(&mut rb).unwrap(), ParseResult::NeedMoreData);
        rb.push(b"dy");
        assert_eq!(parser.parse(&mut rb).unwrap(), ParseResult::Done);
        assert_eq!(parser.into_response().payload, b"body");
    }

    #[test]
    fn malformed_status_line_is_an_error() {
        for bad in [
            "NOTHTTP 200 OK\r\n\r\n",
            "HTTP/1.1 abc\r\n\r\n",
            "HTTP/1.1 99 Low\r\n\r\n",
            "HTTP/1.1 600 High\r\n\r\n",
        ] {
            let mut parser = ResponseParser::new(false, 1024);
            assert!(
                matches!(
                    feed(&mut parser, bad.as_bytes()),
                    Err(HttpsError::HeaderMalformed(_))
                ),
                "expected parse error for {bad:?}"
            );
        }
    }

    #[test]
    fn connect_response_has_no_body() {
        let mut parser = ResponseParser::new(true, 0);
        let result = feed(&mut parser, b"HTTP/1.1 200 Connection established\r\n\r\n").unwrap();
        assert_eq!(result, ParseResult::Done);
        assert_eq!(parser.into_response().code, 200);
    }

    #[test]
    fn oversize_declared_body_rejected() {
        let mut parser = ResponseParser::new(false, 8);
        assert!(matches!(
            feed(&mut parser, b"HTTP/1.1 200 OK\r\nContent-Length: 9\r\n\r\n"),
            Err(HttpsError::BodyTooLarge)
        ));
    }
}
