use std::collections::hash_map::DefaultHasher;
use std::fs::File;
use std::hash::{Hash, Hasher};
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use log::info;

use crate::http::request::Request;
use crate::http::status::{ext_to_mime, status_str};
use crate::reactor;
use crate::socket::{self, Outgoing, SockId};

/// Formats a unix timestamp as an RFC 7231 HTTP date.
pub fn format_date(secs: u64) -> String {
    httpdate::fmt_http_date(UNIX_EPOCH + Duration::from_secs(secs))
}

/// Parses an RFC 7231 (or legacy RFC 850 / asctime) HTTP date.
pub fn parse_date(s: &str) -> Option<u64> {
    httpdate::parse_http_date(s)
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
}

// The Date header is cached against the reactor tick; rendering it is
// worth skipping at high request rates.
fn cached_date() -> String {
    static CACHE: OnceLock<Mutex<(u64, String)>> = OnceLock::new();
    let cache = CACHE.get_or_init(|| Mutex::new((0, String::new())));
    let tick = reactor::last_tick();
    let mut cache = cache.lock().unwrap();
    if cache.0 != tick {
        *cache = (tick, format_date(tick));
    }
    cache.1.clone()
}

fn invalid_cookie_char(c: u8) -> bool {
    !(b'!'..=b'~').contains(&c) || matches!(c, b'=' | b',' | b';')
}

/// A `Set-Cookie` value under construction.
#[derive(Debug, Clone, Default)]
pub struct Cookie<'a> {
    /// Cookie name; no control characters, `=`, `,`, `;` or spaces.
    pub name: &'a str,
    /// Cookie value, same character rules. Empty deletes the cookie.
    pub value: &'a str,
    /// Optional `Path` attribute.
    pub path: Option<&'a str>,
    /// Optional `Domain` attribute.
    pub domain: Option<&'a str>,
    /// Optional `Max-Age`, in seconds. Negative deletes the cookie.
    pub max_age: Option<i64>,
    /// Adds the `Secure` attribute.
    pub secure: bool,
    /// Adds the `HttpOnly` attribute.
    pub http_only: bool,
}

impl<'a> Cookie<'a> {
    pub fn new(name: &'a str, value: &'a str) -> Cookie<'a> {
        Cookie {
            name,
            value,
            ..Cookie::default()
        }
    }
}

enum Body {
    Empty,
    Bytes(Vec<u8>),
    File { file: File, offset: u64, len: u64 },
}

impl Body {
    fn len(&self) -> u64 {
        match self {
            Body::Empty => 0,
            Body::Bytes(bytes) => bytes.len() as u64,
            Body::File { len, .. } => *len,
        }
    }
}

struct LogData {
    started: Instant,
    peer: Option<SocketAddr>,
    method: String,
    path: String,
    version: String,
}

/// An HTTP/1.1 response under construction.
///
/// Headers accumulate into a single buffer; [`Response::finish`] renders
/// the status line, fills in the automatic headers (`Date`,
/// `Content-Length`, `Connection`) unless they were written explicitly,
/// and hands everything to the socket layer.
pub struct Response {
    id: SockId,
    status: u16,
    headers: Vec<u8>,
    date_written: bool,
    content_length_written: bool,
    connection_written: bool,
    should_close: bool,
    last_modified: Option<u64>,
    body: Body,
    log: Option<LogData>,
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("id", &self.id)
            .field("status", &self.status)
            .finish()
    }
}

impl Response {
    pub fn new(id: SockId) -> Response {
        Response {
            id,
            status: 200,
            headers: Vec::with_capacity(256),
            date_written: false,
            content_length_written: false,
            connection_written: false,
            should_close: false,
            last_modified: None,
            body: Body::Empty,
            log: None,
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    /// Sets the `Last-Modified` header from a unix timestamp.
    pub fn set_last_modified(&mut self, secs: u64) {
        self.last_modified = Some(secs);
    }

    /// Writes one header. Writing `Date`, `Last-Modified`,
    /// `Content-Length` or `Connection` suppresses the matching automatic
    /// header; `Connection: close` also flags the connection for closing.
    pub fn header(&mut self, name: &str, value: &str) -> io::Result<()> {
        if name.is_empty() || name.bytes().any(|b| b == b':' || b.is_ascii_whitespace()) {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }
        if name.eq_ignore_ascii_case("date") || name.eq_ignore_ascii_case("last-modified") {
            self.date_written = true;
        } else if name.eq_ignore_ascii_case("content-length") {
            self.content_length_written = true;
        } else if name.eq_ignore_ascii_case("connection") {
            self.connection_written = true;
            if value.eq_ignore_ascii_case("close") {
                self.should_close = true;
            }
        }
        self.headers.extend_from_slice(name.as_bytes());
        self.headers.extend_from_slice(b": ");
        self.headers.extend_from_slice(value.as_bytes());
        self.headers.extend_from_slice(b"\r\n");
        Ok(())
    }

    /// Validates and writes a `Set-Cookie` header.
    pub fn set_cookie(&mut self, cookie: Cookie<'_>) -> io::Result<()> {
        if cookie.name.is_empty()
            || cookie.name.bytes().any(invalid_cookie_char)
            || cookie.value.bytes().any(invalid_cookie_char)
        {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }
        let mut line = format!("Set-Cookie: {}={}", cookie.name, cookie.value);
        if let Some(path) = cookie.path {
            line.push_str("; Path=");
            line.push_str(path);
        }
        if let Some(domain) = cookie.domain {
            line.push_str("; Domain=");
            line.push_str(domain);
        }
        if let Some(max_age) = cookie.max_age {
            line.push_str(&format!("; Max-Age={}", max_age));
        }
        if cookie.secure {
            line.push_str("; Secure");
        }
        if cookie.http_only {
            line.push_str("; HttpOnly");
        }
        line.push_str("\r\n");
        self.headers.extend_from_slice(line.as_bytes());
        Ok(())
    }

    /// Appends body bytes (copied into the response).
    pub fn write_body(&mut self, data: &[u8]) {
        match &mut self.body {
            Body::Bytes(bytes) => bytes.extend_from_slice(data),
            _ => self.body = Body::Bytes(data.to_vec()),
        }
    }

    /// Streams `len` bytes of `file` from `offset` as the body, using the
    /// socket layer's file fast path.
    pub fn send_file(&mut self, file: File, offset: u64, len: u64) {
        self.body = Body::File { file, offset, len };
    }

    /// Starts the access-log clock for this response.
    pub fn start_log(&mut self, request: &Request) {
        self.log = Some(LogData {
            started: Instant::now(),
            peer: socket::peer_addr(self.id),
            method: request.method.clone(),
            path: request.path.clone(),
            version: request.version.clone(),
        });
    }

    fn body_allowed(&self) -> bool {
        !(self.status < 200 || self.status == 204 || self.status == 304)
    }

    /// Renders and sends the response. The connection stays open unless
    /// `Connection: close` was written.
    pub fn finish(self) -> io::Result<()> {
        let reason = status_str(self.status).unwrap_or("Unknown");
        let length = if self.body_allowed() { self.body.len() } else { 0 };

        let mut head = Vec::with_capacity(self.headers.len() + 128);
        head.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", self.status, reason).as_bytes());
        if !self.date_written {
            head.extend_from_slice(b"Date: ");
            head.extend_from_slice(cached_date().as_bytes());
            head.extend_from_slice(b"\r\n");
            if let Some(last_modified) = self.last_modified {
                head.extend_from_slice(b"Last-Modified: ");
                head.extend_from_slice(format_date(last_modified).as_bytes());
                head.extend_from_slice(b"\r\n");
            }
        }
        head.extend_from_slice(&self.headers);
        if !self.content_length_written && self.body_allowed() {
            head.extend_from_slice(format!("Content-Length: {}\r\n", length).as_bytes());
        }
        if !self.connection_written {
            head.extend_from_slice(b"Connection: keep-alive\r\n");
        }
        head.extend_from_slice(b"\r\n");

        socket::write_spec(self.id, Outgoing::owned(head))?;
        let result = if self.body_allowed() {
            match self.body {
                Body::Empty => Ok(()),
                Body::Bytes(bytes) => socket::write_spec(self.id, Outgoing::owned(bytes)),
                Body::File { file, offset, len } => {
                    socket::write_spec(self.id, Outgoing::file(file, offset, len))
                }
            }
        } else {
            Ok(())
        };

        if let Some(log) = self.log {
            log_finish(&log, self.status, length);
        }
        if self.should_close {
            socket::close(self.id);
        }
        result
    }
}

fn clipped(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_owned();
    }
    let mut end = max - 3;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

fn log_finish(log: &LogData, status: u16, bytes: u64) {
    let ip = log
        .peer
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "[unknown]".to_owned());
    let sent = if bytes > 0 {
        bytes.to_string()
    } else {
        "--".to_owned()
    };
    info!(
        target: "http::access",
        "{} - - [{}] \"{} {} {}\" {} {} {}ms",
        ip,
        cached_date(),
        clipped(&log.method, 10),
        clipped(&log.path, 24),
        clipped(&log.version, 10),
        status,
        sent,
        log.started.elapsed().as_millis(),
    );
}

/* *****************************************************************************
 * Static file responses
 **************************************************************************** */

/// Percent-decodes one path component stream. Rejects embedded NUL.
fn decode_path(path: &str) -> Option<String> {
    let bytes = path.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hi = hex_val(*bytes.get(i + 1)?)?;
            let lo = hex_val(*bytes.get(i + 2)?)?;
            let byte = (hi << 4) | lo;
            if byte == 0 {
                return None;
            }
            out.push(byte);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

fn hex_val(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

/// A 12-character entity tag derived from the file's size and mtime.
fn compute_etag(size: u64, mtime: u64) -> String {
    let mut hasher = DefaultHasher::new();
    (size, mtime).hash(&mut hasher);
    BASE64.encode(hasher.finish().to_le_bytes())
}

/// Parses `bytes=a-b` (the first range only). Returns `(start, end)` with
/// `end` clamped into the file; `None` means serve the whole file.
fn parse_range(value: &str, size: u64) -> Option<(u64, u64)> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start: u64 = start.parse().ok()?;
    if start >= size {
        return None;
    }
    let end: u64 = match end.split(',').next().unwrap_or("").trim() {
        "" => size - 1,
        digits => digits.parse().ok()?,
    };
    let end = end.min(size - 1);
    if end < start {
        return None;
    }
    Some((start, end))
}

/// Serves a file from under `root` for `request`, honoring conditional
/// and range headers:
///
/// * `If-None-Match` matching the computed `ETag` short-circuits to `304`.
/// * A valid `Range: bytes=a-b` yields `206` with `Content-Range`;
///   invalid ranges fall back to the full file.
/// * `HEAD` sends the headers only.
///
/// Returns `Err(response)` — untouched — when there's nothing at that
/// path, so the caller can render its own 404.
pub fn send_file_for(
    response: Response,
    request: &Request,
    root: &Path,
) -> Result<io::Result<()>, Response> {
    let mut response = response;
    let decoded = match decode_path(&request.path) {
        Some(decoded) => decoded,
        None => return Err(response),
    };
    // Refuse traversal before the path ever reaches the filesystem.
    if decoded.split('/').any(|seg| seg == "..") {
        return Err(response);
    }
    let mut target = PathBuf::from(root);
    target.push(decoded.trim_start_matches('/'));
    if decoded.ends_with('/') || decoded.is_empty() {
        target.push("index.html");
    }

    let meta = match std::fs::metadata(&target) {
        Ok(meta) if meta.is_file() => meta,
        _ => return Err(response),
    };
    let size = meta.len();
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);

    if let Some(ext) = target.extension().and_then(|e| e.to_str()) {
        if let Some(mime) = ext_to_mime(ext) {
            let _ = response.header("Content-Type", mime);
        }
    }

    let etag = compute_etag(size, mtime);
    let _ = response.header("ETag", &etag);
    let _ = response.header("Cache-Control", "max-age=3600");
    response.set_last_modified(mtime);

    if request.header("if-none-match") == Some(etag.as_str()) {
        response.set_status(304);
        return Ok(response.finish());
    }

    let file = match File::open(&target) {
        Ok(file) => file,
        Err(_) => {
            response.set_status(503);
            let body = status_str(503).unwrap_or("Service Unavailable");
            response.write_body(body.as_bytes());
            return Ok(response.finish());
        }
    };

    let head_only = request.method.eq_ignore_ascii_case("HEAD");
    if let Some((start, end)) = request
        .header("range")
        .and_then(|value| parse_range(value, size))
    {
        response.set_status(206);
        let _ = response.header(
            "Content-Range",
            &format!("bytes {}-{}/{}", start, end, size),
        );
        let _ = response.header("Accept-Ranges", "bytes");
        if head_only {
            let _ = response.header("Content-Length", &(end - start + 1).to_string());
        } else {
            response.send_file(file, start, end - start + 1);
        }
        return Ok(response.finish());
    }

    let _ = response.header("Accept-Ranges", "none");
    if head_only {
        let _ = response.header("Content-Length", &size.to_string());
    } else {
        response.send_file(file, 0, size);
    }
    Ok(response.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_parsing() {
        assert_eq!(parse_range("bytes=100-199", 1000), Some((100, 199)));
        assert_eq!(parse_range("bytes=100-", 1000), Some((100, 999)));
        assert_eq!(parse_range("bytes=100-5000", 1000), Some((100, 999)));
        assert_eq!(parse_range("bytes=1000-1001", 1000), None);
        assert_eq!(parse_range("bytes=9-5", 1000), None);
        assert_eq!(parse_range("lines=1-2", 1000), None);
    }

    #[test]
    fn dates_round_trip() {
        for t in [0u64, 784_111_777, 1_700_000_000] {
            assert_eq!(parse_date(&format_date(t)), Some(t));
        }
    }

    #[test]
    fn etag_is_short_and_stable() {
        let a = compute_etag(1000, 1_700_000_000);
        let b = compute_etag(1000, 1_700_000_000);
        assert_eq!(a, b);
        assert_eq!(a.len(), 12);
        assert_ne!(a, compute_etag(1001, 1_700_000_000));
    }

    #[test]
    fn cookie_validation() {
        let mut pair = [0; 2];
        assert_eq!(
            unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, pair.as_mut_ptr()) },
            0
        );
        let id = crate::socket::open(pair[0]).unwrap();
        unsafe { libc::close(pair[1]) };
        let mut response = Response::new(id);
        assert!(response.set_cookie(Cookie::new("session", "abc123")).is_ok());
        assert!(response.set_cookie(Cookie::new("bad name", "x")).is_err());
        assert!(response.set_cookie(Cookie::new("bad", "a;b")).is_err());
        assert!(response.set_cookie(Cookie::new("bad", "a=b")).is_err());
        crate::socket::force_close(id);
    }
}
