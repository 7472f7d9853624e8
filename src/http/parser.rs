//! Byte-driven, restartable HTTP/1.1 parser.
//!
//! [`Parser::consume`] eats as many whole protocol elements as the buffer
//! holds and reports how much it took; the caller moves the unconsumed
//! tail to the front of the buffer and tries again once more bytes arrive.
//! Feeding a stream in arbitrary splits produces the exact same callback
//! sequence as feeding it whole.
//!
//! The buffer is taken mutably: header names are lowercased in place, so
//! [`Callbacks::on_header`] always observes lowercase names regardless of
//! what was on the wire.

/// Callback rejection; the parser reports `on_error` and resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejected;

/// Receiver half of the parser. Return `Err(Rejected)` from any callback
/// to abort the current message.
#[allow(unused_variables)]
pub trait Callbacks {
    /// Request method, e.g. `GET`.
    fn on_method(&mut self, method: &[u8]) -> Result<(), Rejected> {
        Ok(())
    }

    /// Response status code plus the reason phrase.
    fn on_status(&mut self, status: u16, reason: &[u8]) -> Result<(), Rejected> {
        Ok(())
    }

    /// Request path, percent-encoded as received, query excluded.
    fn on_path(&mut self, path: &[u8]) -> Result<(), Rejected> {
        Ok(())
    }

    /// Query string (without `?`), only when non-empty.
    fn on_query(&mut self, query: &[u8]) -> Result<(), Rejected> {
        Ok(())
    }

    /// The `HTTP/x.y` token.
    fn on_http_version(&mut self, version: &[u8]) -> Result<(), Rejected> {
        Ok(())
    }

    /// One header; `name` is lowercase. Called for trailers too.
    fn on_header(&mut self, name: &[u8], value: &[u8]) -> Result<(), Rejected> {
        Ok(())
    }

    /// A slice of body data, in order.
    fn on_body_chunk(&mut self, data: &[u8]) -> Result<(), Rejected> {
        Ok(())
    }

    /// A request parsed to completion.
    fn on_request(&mut self) -> Result<(), Rejected> {
        Ok(())
    }

    /// A response parsed to completion.
    fn on_response(&mut self) -> Result<(), Rejected> {
        Ok(())
    }

    /// Parse failure or callback rejection. The parser has already reset.
    fn on_error(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Line,
    Headers,
    Body,
    Trailers,
}

/// Chunk sizes beyond this are treated as hostile.
const MAX_CHUNK: u64 = 1 << 60;

/// A restartable HTTP/1.1 message parser. One instance per connection;
/// pipelined messages reuse it back to back.
#[derive(Debug)]
pub struct Parser {
    state: State,
    is_response: bool,
    chunked: bool,
    expect_trailer: bool,
    content_length: Option<u64>,
    chunk_remaining: u64,
    read: u64,
    last_body: u64,
}

impl Default for Parser {
    fn default() -> Parser {
        Parser::new()
    }
}

impl Parser {
    pub fn new() -> Parser {
        Parser {
            state: State::Line,
            is_response: false,
            chunked: false,
            expect_trailer: false,
            content_length: None,
            chunk_remaining: 0,
            read: 0,
            last_body: 0,
        }
    }

    /// Total body length of the most recently completed message. For
    /// chunked messages this is the assembled length.
    pub fn last_body_length(&self) -> u64 {
        self.last_body
    }

    fn reset(&mut self) {
        let last_body = self.last_body;
        *self = Parser::new();
        self.last_body = last_body;
    }

    /// Consumes as much of `buf` as possible, invoking callbacks along the
    /// way, and returns the number of bytes accepted. The caller must slide
    /// the remainder (`buf[n..]`) to the front before the next call.
    pub fn consume(&mut self, cb: &mut impl Callbacks, buf: &mut [u8]) -> usize {
        match self.consume_inner(cb, buf) {
            Ok(consumed) => consumed,
            Err(Rejected) => {
                self.reset();
                cb.on_error();
                buf.len()
            }
        }
    }

    fn consume_inner(&mut self, cb: &mut impl Callbacks, buf: &mut [u8]) -> Result<usize, Rejected> {
        let mut pos = 0;

        if self.state == State::Line {
            // Leading noise (stray CRLF from a previous message) is legal.
            while pos < buf.len() && matches!(buf[pos], b'\r' | b'\n' | b' ' | 0) {
                pos += 1;
            }
            let (line_end, next) = match seek_eol(buf, pos) {
                Some(found) => found,
                None => return Ok(if pos == buf.len() { pos } else { 0 }),
            };
            if buf[pos..].starts_with(b"HTTP") {
                self.is_response = true;
                self.consume_response_line(cb, &buf[pos..line_end])?;
            } else if buf.get(pos).map_or(false, u8::is_ascii_alphabetic) {
                self.consume_request_line(cb, buf, pos, line_end)?;
            } else {
                return Err(Rejected);
            }
            pos = next;
            self.state = State::Headers;
        }

        if self.state == State::Headers || self.state == State::Trailers {
            pos = self.consume_headers(cb, buf, pos)?;
            if self.state == State::Headers || self.state == State::Trailers {
                // Ran out of buffered header lines.
                return Ok(pos);
            }
        }

        if self.state == State::Body {
            pos = if self.chunked {
                self.consume_chunked(cb, buf, pos)?
            } else {
                self.consume_sized(cb, buf, pos)?
            };
            if self.state == State::Trailers {
                pos = self.consume_headers(cb, buf, pos)?;
                if self.state == State::Trailers {
                    return Ok(pos);
                }
            }
            if self.state != State::Line {
                return Ok(pos);
            }
        }

        // Completed: State::Line again after a finish() below.
        Ok(pos)
    }

    fn finish(&mut self, cb: &mut impl Callbacks) -> Result<(), Rejected> {
        self.last_body = self.read;
        let is_response = self.is_response;
        self.reset();
        if is_response {
            cb.on_response()
        } else {
            cb.on_request()
        }
    }

    fn consume_response_line(
        &mut self,
        cb: &mut impl Callbacks,
        line: &[u8],
    ) -> Result<(), Rejected> {
        let sp1 = find(line, b' ').ok_or(Rejected)?;
        cb.on_http_version(&line[..sp1])?;
        let rest = &line[sp1 + 1..];
        let sp2 = find(rest, b' ').unwrap_or(rest.len());
        let status = dec_u64(&rest[..sp2]).ok_or(Rejected)?;
        if status > 999 {
            return Err(Rejected);
        }
        let reason = if sp2 < rest.len() {
            &rest[sp2 + 1..]
        } else {
            &[]
        };
        cb.on_status(status as u16, reason)
    }

    fn consume_request_line(
        &mut self,
        cb: &mut impl Callbacks,
        buf: &mut [u8],
        start: usize,
        line_end: usize,
    ) -> Result<(), Rejected> {
        let sp1 = find(&buf[start..line_end], b' ').ok_or(Rejected)? + start;
        cb.on_method(&buf[start..sp1])?;
        let mut target = sp1 + 1;
        let mut host: Option<(usize, usize)> = None;

        // Absolute-form target: emulate a Host header and fall back to the
        // path component.
        let rest = &buf[target..line_end];
        let authority = if rest.starts_with(b"http://") {
            Some(target + 7)
        } else if rest.starts_with(b"https://") {
            Some(target + 8)
        } else {
            None
        };
        if let Some(auth_start) = authority {
            let uri_end = find(&buf[auth_start..line_end], b' ')
                .map(|i| auth_start + i)
                .unwrap_or(line_end);
            match find(&buf[auth_start..uri_end], b'/') {
                Some(slash) => {
                    host = Some((auth_start, auth_start + slash));
                    target = auth_start + slash;
                }
                None => {
                    // No path at all; serve the root.
                    host = Some((auth_start, uri_end));
                    cb.on_path(b"/")?;
                    let version = &buf[(uri_end + 1).min(line_end)..line_end];
                    if version.len() < 5 {
                        return Err(Rejected);
                    }
                    cb.on_http_version(version)?;
                    let (host_start, host_end) = host.unwrap();
                    let host = buf[host_start..host_end].to_vec();
                    return cb.on_header(b"host", &host);
                }
            }
        }

        let uri_end = find(&buf[target..line_end], b' ')
            .map(|i| target + i)
            .ok_or(Rejected)?;
        match find(&buf[target..uri_end], b'?') {
            Some(q) => {
                cb.on_path(&buf[target..target + q])?;
                if uri_end - (target + q + 1) > 0 {
                    let query = (target + q + 1, uri_end);
                    cb.on_query(&buf[query.0..query.1])?;
                }
            }
            None => cb.on_path(&buf[target..uri_end])?,
        }
        let version = &buf[uri_end + 1..line_end];
        if version.len() < 5 {
            return Err(Rejected);
        }
        cb.on_http_version(version)?;
        if let Some((host_start, host_end)) = host {
            let host = buf[host_start..host_end].to_vec();
            cb.on_header(b"host", &host)?;
        }
        Ok(())
    }

    fn consume_headers(
        &mut self,
        cb: &mut impl Callbacks,
        buf: &mut [u8],
        mut pos: usize,
    ) -> Result<usize, Rejected> {
        loop {
            if pos >= buf.len() {
                return Ok(pos);
            }
            if buf[pos] == b'\r' || buf[pos] == b'\n' {
                // Empty line: end of the header (or trailer) section.
                if buf[pos] == b'\n' {
                    pos += 1;
                } else if pos + 1 >= buf.len() {
                    // A lone CR at the buffer edge; wait for its LF.
                    return Ok(pos);
                } else if buf[pos + 1] == b'\n' {
                    pos += 2;
                } else {
                    return Err(Rejected);
                }
                if self.state == State::Trailers {
                    self.state = State::Line;
                    self.finish(cb)?;
                } else {
                    self.state = State::Body;
                    let done = if self.chunked {
                        false
                    } else {
                        match self.content_length {
                            Some(len) => len == 0,
                            None => true,
                        }
                    };
                    if done {
                        self.state = State::Line;
                        self.finish(cb)?;
                    }
                }
                return Ok(pos);
            }
            let (line_end, next) = match seek_eol(buf, pos) {
                Some(found) => found,
                None => return Ok(pos),
            };
            self.consume_header(cb, buf, pos, line_end)?;
            pos = next;
        }
    }

    fn consume_header(
        &mut self,
        cb: &mut impl Callbacks,
        buf: &mut [u8],
        start: usize,
        line_end: usize,
    ) -> Result<(), Rejected> {
        let colon = find(&buf[start..line_end], b':').ok_or(Rejected)? + start;
        buf[start..colon].make_ascii_lowercase();
        let mut value_start = colon + 1;
        if buf.get(value_start) == Some(&b' ') {
            value_start += 1;
        }

        let name_range = start..colon;
        let value_range = value_start..line_end.max(value_start);

        match &buf[name_range.clone()] {
            b"content-length" => {
                self.content_length = Some(dec_u64_saturating(&buf[value_range.clone()]));
            }
            b"transfer-encoding" => {
                if let Some(stripped) = strip_chunked_token(&buf[value_range.clone()]) {
                    self.chunked = true;
                    if stripped.is_empty() {
                        return Ok(());
                    }
                    let name = buf[name_range].to_vec();
                    return cb.on_header(&name, &stripped);
                }
            }
            b"trailer" => {
                self.chunked = true;
                self.expect_trailer = true;
            }
            _ => {}
        }

        let (head, tail) = buf.split_at_mut(value_range.start);
        cb.on_header(
            &head[name_range],
            &tail[..value_range.end - value_range.start],
        )
    }

    fn consume_sized(
        &mut self,
        cb: &mut impl Callbacks,
        buf: &mut [u8],
        pos: usize,
    ) -> Result<usize, Rejected> {
        let total = self.content_length.unwrap_or(0);
        let want = (total - self.read).min((buf.len() - pos) as u64) as usize;
        if want > 0 {
            cb.on_body_chunk(&buf[pos..pos + want])?;
            self.read += want as u64;
        }
        let pos = pos + want;
        if self.read >= total {
            self.state = State::Line;
            self.finish(cb)?;
        }
        Ok(pos)
    }

    fn consume_chunked(
        &mut self,
        cb: &mut impl Callbacks,
        buf: &mut [u8],
        mut pos: usize,
    ) -> Result<usize, Rejected> {
        loop {
            if self.chunk_remaining == 0 {
                // Between chunks: [CRLF] hex-size CRLF.
                let mut cursor = pos;
                if buf[cursor..].starts_with(b"\r\n") {
                    cursor += 2;
                }
                let (size, digits) = match hex_u64(&buf[cursor..]) {
                    Some(parsed) => parsed,
                    None => {
                        // No digit yet: either the size hasn't arrived (an
                        // empty tail, or a CR waiting for its LF) or the
                        // stream is broken.
                        let rest = &buf[cursor..];
                        return if rest.is_empty() || rest == b"\r" {
                            Ok(pos)
                        } else {
                            Err(Rejected)
                        };
                    }
                };
                if size > MAX_CHUNK {
                    return Err(Rejected);
                }
                let after_digits = cursor + digits;
                if after_digits + 2 > buf.len() {
                    // The CRLF terminating the size isn't here yet.
                    return Ok(pos);
                }
                if &buf[after_digits..after_digits + 2] != b"\r\n" {
                    return Err(Rejected);
                }
                pos = after_digits + 2;
                if size == 0 {
                    self.content_length = Some(self.read);
                    if self.expect_trailer {
                        self.state = State::Trailers;
                        return Ok(pos);
                    }
                    // The terminating CRLF may lag behind; the next
                    // message's line state skips it if so.
                    if buf[pos..].starts_with(b"\r\n") {
                        pos += 2;
                    }
                    self.state = State::Line;
                    self.finish(cb)?;
                    return Ok(pos);
                }
                self.chunk_remaining = size;
            }
            let avail = (buf.len() - pos).min(self.chunk_remaining as usize);
            if avail == 0 {
                return Ok(pos);
            }
            cb.on_body_chunk(&buf[pos..pos + avail])?;
            self.read += avail as u64;
            self.chunk_remaining -= avail as u64;
            pos += avail;
        }
    }
}

/* *****************************************************************************
 * Scanning helpers
 **************************************************************************** */

fn find(haystack: &[u8], needle: u8) -> Option<usize> {
    haystack.iter().position(|b| *b == needle)
}

/// Finds the end of a line. Returns `(content_end, next_line_start)`;
/// both LF and CRLF terminate lines.
fn seek_eol(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    let lf = find(&buf[from..], b'\n')? + from;
    let content_end = if lf > from && buf[lf - 1] == b'\r' {
        lf - 1
    } else {
        lf
    };
    Some((content_end, lf + 1))
}

fn dec_u64(digits: &[u8]) -> Option<u64> {
    if digits.is_empty() {
        return None;
    }
    let mut value: u64 = 0;
    for digit in digits {
        if !digit.is_ascii_digit() {
            return None;
        }
        value = value.checked_mul(10)?.checked_add((digit - b'0') as u64)?;
    }
    Some(value)
}

/// Decimal parse with leading-blank tolerance and overflow saturation.
fn dec_u64_saturating(bytes: &[u8]) -> u64 {
    let mut value: u64 = 0;
    for byte in bytes.iter().skip_while(|b| matches!(**b, b' ' | b'\t')) {
        if !byte.is_ascii_digit() {
            break;
        }
        value = value
            .saturating_mul(10)
            .saturating_add((byte - b'0') as u64);
    }
    value
}

/// Parses leading hex digits. Returns `(value, digit_count)`; `None` when
/// no digit is present yet.
fn hex_u64(bytes: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    let mut count = 0;
    for byte in bytes {
        let digit = match byte {
            b'0'..=b'9' => byte - b'0',
            b'a'..=b'f' => byte - b'a' + 10,
            b'A'..=b'F' => byte - b'A' + 10,
            _ => break,
        };
        value = (value << 4) | digit as u64;
        count += 1;
        if count > 16 {
            return Some((u64::MAX, count));
        }
    }
    if count == 0 {
        None
    } else {
        Some((value, count))
    }
}

/// Removes a `chunked` token from a transfer-encoding value. Returns the
/// remaining value when the token was present.
fn strip_chunked_token(value: &[u8]) -> Option<Vec<u8>> {
    let mut found = false;
    let mut kept: Vec<&[u8]> = Vec::new();
    for token in value.split(|b| *b == b',') {
        let trimmed = trim(token);
        if trimmed.eq_ignore_ascii_case(b"chunked") {
            found = true;
        } else if !trimmed.is_empty() {
            kept.push(trimmed);
        }
    }
    if !found {
        return None;
    }
    let mut out = Vec::new();
    for (i, token) in kept.iter().enumerate() {
        if i > 0 {
            out.extend_from_slice(b", ");
        }
        out.extend_from_slice(token);
    }
    Some(out)
}

fn trim(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| *b != b' ').unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|b| *b != b' ').map_or(0, |i| i + 1);
    &bytes[start.min(end)..end]
}
