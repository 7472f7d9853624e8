use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::FromRawFd;

use moor::defer::perform_all;
use moor::socket::{self, Outgoing, SockId};

mod util;

/// A connected non-blocking pair: (managed handle, plain std stream).
fn managed_pair() -> (SockId, std::os::unix::net::UnixStream) {
    let mut pair = [0; 2];
    assert_eq!(
        unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, pair.as_mut_ptr()) },
        0
    );
    for fd in pair {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        assert!(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } >= 0);
    }
    let id = socket::open(pair[0]).unwrap();
    let peer = unsafe { std::os::unix::net::UnixStream::from_raw_fd(pair[1]) };
    peer.set_nonblocking(false).unwrap();
    (id, peer)
}

fn read_exact(peer: &mut std::os::unix::net::UnixStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    peer.read_exact(&mut buf).unwrap();
    buf
}

#[test]
fn write_flush_read_round_trip() {
    util::init();
    let (id, mut peer) = managed_pair();

    socket::write(id, b"hello through the queue").unwrap();
    assert!(socket::has_pending(id));
    socket::flush_strong(id);
    assert!(!socket::has_pending(id));
    assert_eq!(read_exact(&mut peer, 23), b"hello through the queue");

    // The other direction goes through the managed read path.
    peer.write_all(b"reply").unwrap();
    let mut buf = [0u8; 64];
    let mut got = 0;
    while got < 5 {
        got += socket::read(id, &mut buf[got..]).unwrap();
    }
    assert_eq!(&buf[..5], b"reply");

    socket::force_close(id);
}

#[test]
fn packets_drain_in_fifo_order() {
    util::init();
    let (id, mut peer) = managed_pair();

    socket::write(id, b"first ").unwrap();
    socket::write(id, b"second ").unwrap();
    socket::write(id, b"third").unwrap();
    socket::flush_strong(id);
    assert_eq!(read_exact(&mut peer, 18), b"first second third");

    socket::force_close(id);
}

#[test]
fn urgent_packets_jump_the_queue() {
    util::init();
    let (id, mut peer) = managed_pair();

    // Nothing in flight yet, so the urgent packet lands at the very front.
    socket::write(id, b"BBB").unwrap();
    socket::write_spec(id, Outgoing::copy(b"AAA").urgent()).unwrap();
    socket::flush_strong(id);
    assert_eq!(read_exact(&mut peer, 6), b"AAABBB");

    socket::force_close(id);
}

#[test]
fn large_copies_promote_to_owned_memory() {
    util::init();
    let (id, mut peer) = managed_pair();

    // Larger than a pooled packet buffer.
    let big: Vec<u8> = (0..100_000u32).map(|i| i as u8).collect();
    socket::write(id, &big).unwrap();

    // Drain concurrently: the kernel buffer is smaller than the payload.
    let writer = std::thread::spawn(move || {
        socket::flush_strong(id);
        id
    });
    let got = read_exact(&mut peer, big.len());
    let id = writer.join().unwrap();
    assert_eq!(got, big);

    socket::force_close(id);
}

#[test]
fn file_packets_stream_file_contents() {
    util::init();
    let (id, mut peer) = managed_pair();

    let mut tmp: File = tempfile();
    let payload: Vec<u8> = (0..50_000u32).map(|i| (i / 7) as u8).collect();
    tmp.write_all(&payload).unwrap();
    tmp.seek(SeekFrom::Start(0)).unwrap();

    socket::write_spec(id, Outgoing::file(tmp, 1_000, 2_000)).unwrap();
    let writer = std::thread::spawn(move || {
        socket::flush_strong(id);
        id
    });
    let got = read_exact(&mut peer, 2_000);
    let id = writer.join().unwrap();
    assert_eq!(got, &payload[1_000..3_000]);

    socket::force_close(id);
}

#[test]
fn closed_handles_release_resources_and_reject_writes() {
    util::init();
    let (id, peer) = managed_pair();
    drop(peer);

    socket::force_close(id);
    let err = socket::write_spec(id, Outgoing::owned(vec![1, 2, 3])).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EBADF));
    // Deferred flush tasks for dead sockets must be harmless.
    perform_all();
}

#[test]
fn graceful_close_sends_queued_data_first() {
    util::init();
    let (id, mut peer) = managed_pair();

    socket::write(id, b"last words").unwrap();
    socket::close(id);
    // Drain until the close lands.
    while socket::is_valid(id) {
        let _ = socket::flush(id);
        std::thread::yield_now();
    }
    assert_eq!(read_exact(&mut peer, 10), b"last words");
    // Peer then observes EOF.
    let mut rest = Vec::new();
    peer.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());
}

fn tempfile() -> File {
    tempfile_in(std::env::temp_dir())
}

fn tempfile_in(dir: std::path::PathBuf) -> File {
    let path = dir.join(format!(
        "moor-sock-test-{}-{:x}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    ));
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(&path)
        .unwrap();
    std::fs::remove_file(&path).unwrap();
    file
}
