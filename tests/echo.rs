use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use moor::{listen, run, stop, ListenOpts, Protocol, RunOpts, SockId};
use moor::{reactor, socket};

mod util;

struct Echo;

impl Protocol for Echo {
    fn on_data(&self, id: SockId) {
        let mut buf = [0u8; 1024];
        loop {
            match socket::read(id, &mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let _ = socket::write(id, &buf[..n]);
                    if buf[..n].windows(3).any(|w| w == b"bye") {
                        socket::close(id);
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    }
}

fn connect_with_retries(port: u16) -> TcpStream {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match TcpStream::connect(("127.0.0.1", port)) {
            Ok(stream) => return stream,
            Err(err) if Instant::now() < deadline => {
                let _ = err;
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(err) => panic!("server never came up: {}", err),
        }
    }
}

static TICKS: AtomicUsize = AtomicUsize::new(0);

// One test per binary: the reactor loop runs once per process.
#[test]
fn echo_roundtrip_with_timer() {
    util::init();
    let port = util::free_port();
    listen(ListenOpts::tcp(Some("127.0.0.1"), &port.to_string()), |_id| {
        Some(Arc::new(Echo) as Arc<dyn Protocol>)
    })
    .unwrap();
    reactor::run_every(50, 0, || {
        TICKS.fetch_add(1, Ordering::SeqCst);
    }, None)
    .unwrap();

    let server = std::thread::spawn(|| {
        run(RunOpts {
            threads: 2,
            workers: 1,
            ..RunOpts::default()
        })
    });

    let mut stream = connect_with_retries(port);
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    stream.write_all(b"hi").unwrap();
    let mut buf = [0u8; 16];
    let mut got = 0;
    while got < 2 {
        got += stream.read(&mut buf[got..]).unwrap();
    }
    assert_eq!(&buf[..2], b"hi");

    stream.write_all(b"bye").unwrap();
    let mut got = 0;
    while got < 3 {
        got += stream.read(&mut buf[got..]).unwrap();
    }
    assert_eq!(&buf[..3], b"bye");

    // After echoing "bye" the server closes; the next read is EOF.
    assert_eq!(stream.read(&mut buf).unwrap(), 0);

    // The interval timer kept firing the whole time.
    std::thread::sleep(Duration::from_millis(300));
    assert!(TICKS.load(Ordering::SeqCst) >= 2);

    stop();
    server.join().unwrap();
}
