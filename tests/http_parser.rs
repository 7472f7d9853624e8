use moor::http::{Callbacks, Parser, Rejected, RequestBuilder};

use rand::Rng;

mod util;

/// Records every callback as a comparable event stream.
#[derive(Debug, Default, PartialEq, Clone)]
struct Recorder {
    events: Vec<String>,
    errors: usize,
}

impl Recorder {
    fn push(&mut self, kind: &str, data: &[u8]) {
        self.events
            .push(format!("{}:{}", kind, String::from_utf8_lossy(data)));
    }
}

impl Callbacks for Recorder {
    fn on_method(&mut self, method: &[u8]) -> Result<(), Rejected> {
        self.push("method", method);
        Ok(())
    }

    fn on_status(&mut self, status: u16, reason: &[u8]) -> Result<(), Rejected> {
        self.push(&format!("status({})", status), reason);
        Ok(())
    }

    fn on_path(&mut self, path: &[u8]) -> Result<(), Rejected> {
        self.push("path", path);
        Ok(())
    }

    fn on_query(&mut self, query: &[u8]) -> Result<(), Rejected> {
        self.push("query", query);
        Ok(())
    }

    fn on_http_version(&mut self, version: &[u8]) -> Result<(), Rejected> {
        self.push("version", version);
        Ok(())
    }

    fn on_header(&mut self, name: &[u8], value: &[u8]) -> Result<(), Rejected> {
        self.events.push(format!(
            "header:{}={}",
            String::from_utf8_lossy(name),
            String::from_utf8_lossy(value)
        ));
        Ok(())
    }

    fn on_body_chunk(&mut self, data: &[u8]) -> Result<(), Rejected> {
        self.push("body", data);
        Ok(())
    }

    fn on_request(&mut self) -> Result<(), Rejected> {
        self.events.push("request".to_owned());
        Ok(())
    }

    fn on_response(&mut self) -> Result<(), Rejected> {
        self.events.push("response".to_owned());
        Ok(())
    }

    fn on_error(&mut self) {
        self.errors += 1;
    }
}

/// Feeds the whole stream in one call.
fn feed_whole(stream: &[u8]) -> (Recorder, Parser) {
    let mut parser = Parser::new();
    let mut recorder = Recorder::default();
    let mut buf = stream.to_vec();
    let mut start = 0;
    loop {
        let n = parser.consume(&mut recorder, &mut buf[start..]);
        if n == 0 {
            break;
        }
        start += n;
        if start >= buf.len() {
            break;
        }
    }
    (recorder, parser)
}

/// Feeds the stream in pieces of `step` bytes, sliding leftovers forward
/// the way a socket reader would.
fn feed_in_steps(stream: &[u8], step: usize) -> (Recorder, Parser) {
    let mut parser = Parser::new();
    let mut recorder = Recorder::default();
    let mut pending: Vec<u8> = Vec::new();
    for piece in stream.chunks(step) {
        pending.extend_from_slice(piece);
        loop {
            let n = parser.consume(&mut recorder, &mut pending);
            assert!(n <= pending.len());
            pending.drain(..n);
            if n == 0 || pending.is_empty() {
                break;
            }
        }
    }
    (recorder, parser)
}

#[test]
fn plain_get() {
    util::init();
    let (rec, _) = feed_whole(b"GET /hello?who=world HTTP/1.1\r\nHost: example.com\r\n\r\n");
    assert_eq!(
        rec.events,
        vec![
            "method:GET",
            "path:/hello",
            "query:who=world",
            "version:HTTP/1.1",
            "header:host=example.com",
            "request",
        ]
    );
    assert_eq!(rec.errors, 0);
}

#[test]
fn header_names_are_lowercased() {
    let (rec, _) = feed_whole(b"GET / HTTP/1.1\r\nHoSt: x\r\nX-CuStOm-ID: AbC\r\n\r\n");
    assert!(rec.events.contains(&"header:host=x".to_owned()));
    // Values keep their case.
    assert!(rec.events.contains(&"header:x-custom-id=AbC".to_owned()));
}

#[test]
fn absolute_uri_synthesizes_host() {
    let (rec, _) = feed_whole(b"GET http://example.com:8080/a/b?q=1 HTTP/1.1\r\n\r\n");
    assert_eq!(
        rec.events,
        vec![
            "method:GET",
            "path:/a/b",
            "query:q=1",
            "version:HTTP/1.1",
            "header:host=example.com:8080",
            "request",
        ]
    );

    let (rec, _) = feed_whole(b"GET https://example.com HTTP/1.1\r\n\r\n");
    assert_eq!(
        rec.events,
        vec![
            "method:GET",
            "path:/",
            "version:HTTP/1.1",
            "header:host=example.com",
            "request",
        ]
    );
}

#[test]
fn sized_body_streams_to_completion() {
    let (rec, parser) =
        feed_whole(b"POST /u HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello");
    assert!(rec.events.contains(&"body:hello".to_owned()));
    assert_eq!(rec.events.last().unwrap(), "request");
    assert_eq!(parser.last_body_length(), 5);
}

#[test]
fn chunked_request_reassembles() {
    let stream =
        b"POST /u HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
    let (rec, parser) = feed_whole(stream);
    let bodies: Vec<&String> = rec
        .events
        .iter()
        .filter(|e| e.starts_with("body:"))
        .collect();
    assert_eq!(bodies, ["body:hello", "body: world"]);
    assert_eq!(rec.events.last().unwrap(), "request");
    assert_eq!(parser.last_body_length(), 11);
    // The chunked token never reaches the header callback.
    assert!(rec
        .events
        .iter()
        .all(|e| !e.starts_with("header:transfer-encoding")));
}

#[test]
fn chunked_token_is_stripped_from_value_lists() {
    let (rec, _) = feed_whole(
        b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: gzip, chunked\r\n\r\n0\r\n\r\n",
    );
    assert!(rec
        .events
        .contains(&"header:transfer-encoding=gzip".to_owned()));
}

#[test]
fn trailers_are_consumed_after_the_last_chunk() {
    let stream = b"POST / HTTP/1.1\r\nHost: x\r\nTrailer: X-Sum\r\n\r\n3\r\nabc\r\n0\r\nX-Sum: 99\r\n\r\n";
    let (rec, parser) = feed_whole(stream);
    assert!(rec.events.contains(&"header:x-sum=99".to_owned()));
    assert_eq!(rec.events.last().unwrap(), "request");
    assert_eq!(parser.last_body_length(), 3);
    assert_eq!(rec.errors, 0);
}

#[test]
fn responses_are_parsed_too() {
    let (rec, _) =
        feed_whole(b"HTTP/1.1 404 Not Found\r\nContent-Length: 3\r\n\r\noops");
    assert!(rec.events.contains(&"version:HTTP/1.1".to_owned()));
    assert!(rec.events.contains(&"status(404):Not Found".to_owned()));
    assert!(rec.events.contains(&"body:oop".to_owned()) || rec.events.contains(&"body:oops".to_owned()));
    assert!(rec.events.contains(&"response".to_owned()));
}

#[test]
fn restart_equivalence_byte_by_byte() {
    let stream: &[u8] =
        b"POST /a?b=c HTTP/1.1\r\nHost: h\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nwxyz\r\n0\r\n\r\nGET /next HTTP/1.1\r\nHost: h\r\n\r\n";
    let (whole, _) = feed_whole(stream);
    for step in [1, 2, 3, 7, 16] {
        let (stepped, _) = feed_in_steps(stream, step);
        // Bodies may arrive in different slice granularity; compare with
        // bodies concatenated.
        assert_eq!(normalize(&whole), normalize(&stepped), "step {}", step);
    }
}

/// Collapses consecutive body events so slicing differences don't matter.
fn normalize(rec: &Recorder) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for event in &rec.events {
        if let Some(body) = event.strip_prefix("body:") {
            if let Some(last) = out.last_mut() {
                if last.starts_with("body:") {
                    last.push_str(body);
                    continue;
                }
            }
            out.push(event.clone());
        } else {
            out.push(event.clone());
        }
    }
    out
}

#[test]
fn chunked_round_trip_with_random_bodies() {
    let mut rng = rand::rng();
    for _ in 0..32 {
        let len = rng.random_range(0..4096);
        let body: Vec<u8> = (0..len).map(|_| rng.random::<u8>()).collect();

        let mut stream = b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
        let mut rest = &body[..];
        while !rest.is_empty() {
            let take = rng.random_range(1..=rest.len());
            stream.extend_from_slice(format!("{:x}\r\n", take).as_bytes());
            stream.extend_from_slice(&rest[..take]);
            stream.extend_from_slice(b"\r\n");
            rest = &rest[take..];
        }
        stream.extend_from_slice(b"0\r\n\r\n");

        let mut parser = Parser::new();
        let mut builder = RequestBuilder::new();
        let mut buf = stream.clone();
        let mut start = 0;
        loop {
            let n = parser.consume(&mut builder, &mut buf[start..]);
            start += n;
            if n == 0 || start >= buf.len() {
                break;
            }
        }
        let request = builder.next_request().expect("request completes");
        assert_eq!(request.body, body);
        assert_eq!(parser.last_body_length(), body.len() as u64);
    }
}

#[test]
fn pipelined_requests_parse_back_to_back() {
    let stream: &[u8] = b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\n\r\n";
    let mut parser = Parser::new();
    let mut builder = RequestBuilder::new();
    let mut buf = stream.to_vec();
    let mut start = 0;
    loop {
        let n = parser.consume(&mut builder, &mut buf[start..]);
        start += n;
        if n == 0 || start >= buf.len() {
            break;
        }
    }
    let first = builder.next_request().unwrap();
    let second = builder.next_request().unwrap();
    assert_eq!(first.path, "/a");
    assert_eq!(second.path, "/b");
    assert!(first.keep_alive());
}

#[test]
fn malformed_chunk_sizes_error_out() {
    let (rec, _) = feed_whole(
        b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\nhello\r\n0\r\n\r\n",
    );
    assert_eq!(rec.errors, 1);
}

#[test]
fn callback_rejection_reports_on_error() {
    struct Reject;
    impl Callbacks for Reject {
        fn on_method(&mut self, _method: &[u8]) -> Result<(), Rejected> {
            Err(Rejected)
        }
        fn on_error(&mut self) {}
    }
    let mut parser = Parser::new();
    let mut cb = Reject;
    let mut buf = b"GET / HTTP/1.1\r\n\r\n".to_vec();
    let consumed = parser.consume(&mut cb, &mut buf);
    // Errors consume the whole buffer so the connection can be dropped.
    assert_eq!(consumed, buf.len());
}
