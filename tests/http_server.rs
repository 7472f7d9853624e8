use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use moor::http::{send_file_for, Parser, Request, RequestBuilder, Response};
use moor::{listen, run, stop, ListenOpts, Protocol, RunOpts, SockId};
use moor::socket;

mod util;

fn doc_root() -> &'static PathBuf {
    static ROOT: OnceLock<PathBuf> = OnceLock::new();
    ROOT.get_or_init(|| {
        let dir = std::env::temp_dir().join(format!("moor-http-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let body: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(dir.join("f"), body).unwrap();
        dir
    })
}

struct HttpConn {
    state: Mutex<(Parser, RequestBuilder, Vec<u8>)>,
}

impl HttpConn {
    fn new() -> HttpConn {
        HttpConn {
            state: Mutex::new((Parser::new(), RequestBuilder::new(), Vec::new())),
        }
    }

    fn respond(&self, id: SockId, request: Request) {
        let mut response = Response::new(id);
        response.start_log(&request);
        if request.path == "/" {
            response.header("Content-Type", "text/plain").unwrap();
            response.write_body(b"Hello World!");
            response.finish().unwrap();
            return;
        }
        match send_file_for(response, &request, doc_root()) {
            Ok(sent) => sent.unwrap(),
            Err(mut response) => {
                response.set_status(404);
                response.write_body(b"Not Found");
                response.finish().unwrap();
            }
        }
    }
}

impl Protocol for HttpConn {
    fn on_data(&self, id: SockId) {
        let mut chunk = [0u8; 4096];
        loop {
            let n = match socket::read(id, &mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(_) => return,
            };
            let ready = {
                let mut state = self.state.lock().unwrap();
                let (parser, builder, buffer) = &mut *state;
                buffer.extend_from_slice(&chunk[..n]);
                loop {
                    let consumed = parser.consume(builder, buffer);
                    buffer.drain(..consumed);
                    if consumed == 0 || buffer.is_empty() {
                        break;
                    }
                }
                let mut ready = Vec::new();
                while let Some(request) = builder.next_request() {
                    ready.push(request);
                }
                ready
            };
            for request in ready {
                self.respond(id, request);
            }
        }
    }
}

fn connect_with_retries(port: u16) -> TcpStream {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match TcpStream::connect(("127.0.0.1", port)) {
            Ok(stream) => {
                stream
                    .set_read_timeout(Some(Duration::from_secs(5)))
                    .unwrap();
                return stream;
            }
            Err(err) if Instant::now() < deadline => {
                let _ = err;
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(err) => panic!("server never came up: {}", err),
        }
    }
}

/// Reads one response off the stream: status, headers, body.
fn read_response(stream: &mut TcpStream) -> (u16, HashMap<String, String>, Vec<u8>) {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).expect("response head");
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap();
    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap();
    let status: u16 = status_line.split(' ').nth(1).unwrap().parse().unwrap();
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(": ") {
            headers.insert(name.to_ascii_lowercase(), value.to_owned());
        }
    }
    let length: usize = headers
        .get("content-length")
        .map(|v| v.parse().unwrap())
        .unwrap_or(0);
    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).expect("response body");
    (status, headers, body)
}

// One test per binary: the reactor loop runs once per process.
#[test]
fn serves_requests_files_and_ranges() {
    util::init();
    let port = util::free_port();
    listen(ListenOpts::tcp(Some("127.0.0.1"), &port.to_string()), |_id| {
        Some(Arc::new(HttpConn::new()) as Arc<dyn Protocol>)
    })
    .unwrap();

    let server = std::thread::spawn(|| {
        run(RunOpts {
            threads: 2,
            workers: 1,
            ..RunOpts::default()
        })
    });

    let mut stream = connect_with_retries(port);

    // Plain GET, keep-alive by default.
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let (status, headers, body) = read_response(&mut stream);
    assert_eq!(status, 200);
    assert_eq!(headers.get("content-length").unwrap(), "12");
    assert_eq!(headers.get("content-type").unwrap(), "text/plain");
    assert_eq!(headers.get("connection").unwrap(), "keep-alive");
    assert!(headers.contains_key("date"));
    assert_eq!(body, b"Hello World!");

    // The connection stayed open: same request again on the same stream.
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let (status, _, body) = read_response(&mut stream);
    assert_eq!(status, 200);
    assert_eq!(body, b"Hello World!");

    // Full file: 200 with an entity tag.
    stream
        .write_all(b"GET /f HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let (status, headers, body) = read_response(&mut stream);
    assert_eq!(status, 200);
    assert_eq!(body.len(), 1000);
    let etag = headers.get("etag").unwrap().clone();

    // Conditional revalidation: 304, no body.
    stream
        .write_all(
            format!("GET /f HTTP/1.1\r\nHost: x\r\nIf-None-Match: {}\r\n\r\n", etag).as_bytes(),
        )
        .unwrap();
    let (status, headers, body) = read_response(&mut stream);
    assert_eq!(status, 304);
    assert!(body.is_empty());
    assert!(!headers.contains_key("content-length"));

    // Range request: an exact 100-byte slice.
    stream
        .write_all(b"GET /f HTTP/1.1\r\nHost: x\r\nRange: bytes=100-199\r\n\r\n")
        .unwrap();
    let (status, headers, body) = read_response(&mut stream);
    assert_eq!(status, 206);
    assert_eq!(headers.get("content-range").unwrap(), "bytes 100-199/1000");
    assert_eq!(headers.get("accept-ranges").unwrap(), "bytes");
    assert_eq!(headers.get("content-length").unwrap(), "100");
    let expect: Vec<u8> = (100..200u32).map(|i| (i % 251) as u8).collect();
    assert_eq!(body, expect);

    // Nothing at that path: the handler's own 404.
    stream
        .write_all(b"GET /missing HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let (status, _, body) = read_response(&mut stream);
    assert_eq!(status, 404);
    assert_eq!(body, b"Not Found");

    stop();
    server.join().unwrap();
    let _ = std::fs::remove_dir_all(doc_root());
}
