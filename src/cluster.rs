//! Inter-process message bus.
//!
//! The root process owns a Unix-domain listening socket; every worker
//! connects to it right after the fork. Messages are length-prefixed
//! frames:
//!
//! ```text
//! | channel_len: u32 | data_len: u32 | kind: u32 | filter: i32 |
//! | channel bytes    | data bytes                              |
//! ```
//!
//! All four header fields are big-endian. The root fans every inbound
//! frame out to the other workers and delivers it locally; workers only
//! ever talk to the root. Delivery to registered [`Handler`]s is
//! best-effort and runs as deferred tasks.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once, OnceLock};

use log::{debug, error, info};

use crate::defer;
use crate::pubsub;
use crate::reactor::{self, ConnectOpts, Phase, Protocol};
use crate::socket::{self, Outgoing, SockId};

/// Channel names may not exceed 16 MiB on the wire.
pub const CHANNEL_LIMIT: usize = 16 * 1024 * 1024;
/// Message payloads may not exceed 64 MiB on the wire.
pub const DATA_LIMIT: usize = 64 * 1024 * 1024;

const HEADER_LEN: usize = 16;
const READ_CHUNK: usize = 16 * 1024;

/// What a frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Raw channel and payload bytes.
    Forward = 0,
    /// JSON-encoded payload (see [`send_value`]).
    Json = 1,
    /// The root is going away; workers must exit gracefully.
    Shutdown = 2,
    /// Reserved.
    Error = 3,
    /// Keep-alive.
    Ping = 4,
}

impl FrameKind {
    fn from_u32(value: u32) -> Option<FrameKind> {
        match value {
            0 => Some(FrameKind::Forward),
            1 => Some(FrameKind::Json),
            2 => Some(FrameKind::Shutdown),
            3 => Some(FrameKind::Error),
            4 => Some(FrameKind::Ping),
            _ => None,
        }
    }
}

/// A bus message handler. Registered per filter; receives the filter it
/// was registered under plus the raw channel name and payload.
pub type Handler = fn(filter: i32, channel: &[u8], data: &[u8]);

/* *****************************************************************************
 * Framing
 **************************************************************************** */

/// Encodes one frame.
pub(crate) fn wrap_frame(kind: FrameKind, filter: i32, channel: &[u8], data: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + channel.len() + data.len());
    frame.extend_from_slice(&(channel.len() as u32).to_be_bytes());
    frame.extend_from_slice(&(data.len() as u32).to_be_bytes());
    frame.extend_from_slice(&(kind as u32).to_be_bytes());
    frame.extend_from_slice(&filter.to_be_bytes());
    frame.extend_from_slice(channel);
    frame.extend_from_slice(data);
    frame
}

/// A decoded frame.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Frame {
    pub(crate) kind: FrameKind,
    pub(crate) filter: i32,
    pub(crate) channel: Vec<u8>,
    pub(crate) data: Vec<u8>,
}

/// Incremental frame decoder. Feed it bytes, take complete frames out.
#[derive(Debug, Default)]
pub(crate) struct FrameParser {
    pending: Vec<u8>,
}

impl FrameParser {
    pub(crate) fn new() -> FrameParser {
        FrameParser::default()
    }

    /// Appends `bytes` and returns every frame completed by them.
    ///
    /// Frames exceeding the wire limits poison the stream; the caller must
    /// treat that as fatal for the process.
    pub(crate) fn feed(&mut self, bytes: &[u8]) -> io::Result<Vec<Frame>> {
        self.pending.extend_from_slice(bytes);
        let mut frames = Vec::new();
        let mut consumed = 0;
        loop {
            let rest = &self.pending[consumed..];
            if rest.len() < HEADER_LEN {
                break;
            }
            let channel_len = u32::from_be_bytes(rest[0..4].try_into().unwrap()) as usize;
            let data_len = u32::from_be_bytes(rest[4..8].try_into().unwrap()) as usize;
            let kind = u32::from_be_bytes(rest[8..12].try_into().unwrap());
            let filter = i32::from_be_bytes(rest[12..16].try_into().unwrap());
            if channel_len >= CHANNEL_LIMIT {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("bus channel name too long ({} bytes)", channel_len),
                ));
            }
            if data_len >= DATA_LIMIT {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("bus message data too long ({} bytes)", data_len),
                ));
            }
            let total = HEADER_LEN + channel_len + data_len;
            if rest.len() < total {
                break;
            }
            let kind = FrameKind::from_u32(kind).ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidData, "unknown bus frame kind")
            })?;
            frames.push(Frame {
                kind,
                filter,
                channel: rest[HEADER_LEN..HEADER_LEN + channel_len].to_vec(),
                data: rest[HEADER_LEN + channel_len..total].to_vec(),
            });
            consumed += total;
        }
        self.pending.drain(..consumed);
        Ok(frames)
    }
}

/* *****************************************************************************
 * Handler registry
 **************************************************************************** */

fn handlers() -> &'static Mutex<HashMap<i32, Handler>> {
    static HANDLERS: OnceLock<Mutex<HashMap<i32, Handler>>> = OnceLock::new();
    HANDLERS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Registers (or replaces) the handler for `filter`.
pub fn set_handler(filter: i32, handler: Handler) {
    handlers().lock().unwrap().insert(filter, handler);
}

struct Dispatch {
    handler: Handler,
    filter: i32,
    channel: Vec<u8>,
    data: Vec<u8>,
}

fn dispatch_task(dispatch_raw: usize, _unused: usize) {
    let dispatch = unsafe { Box::from_raw(dispatch_raw as *mut Dispatch) };
    (dispatch.handler)(dispatch.filter, &dispatch.channel, &dispatch.data);
}

// The registry is checked under its own lock; the handler itself runs as a
// deferred task with its own copy of the payload.
fn deliver_local(filter: i32, channel: &[u8], data: &[u8]) {
    let handler = handlers().lock().unwrap().get(&filter).copied();
    if let Some(handler) = handler {
        let dispatch = Box::new(Dispatch {
            handler,
            filter,
            channel: channel.to_vec(),
            data: data.to_vec(),
        });
        defer::defer(dispatch_task, Box::into_raw(dispatch) as usize, 0);
    }
}

/* *****************************************************************************
 * Bus state
 **************************************************************************** */

struct BusState {
    listener: Option<SockId>,
    client: Option<SockId>,
    peers: Vec<SockId>,
    path: Option<String>,
}

fn state() -> &'static Mutex<BusState> {
    static STATE: OnceLock<Mutex<BusState>> = OnceLock::new();
    STATE.get_or_init(|| {
        Mutex::new(BusState {
            listener: None,
            client: None,
            peers: Vec::new(),
            path: None,
        })
    })
}

/// The Unix socket path used by this process tree's bus.
fn socket_path(pid: libc::pid_t) -> String {
    let tmp = std::env::var("TMPDIR")
        .ok()
        .filter(|t| !t.is_empty() && t.len() <= 100)
        .unwrap_or_else(|| "/tmp/".to_owned());
    let sep = if tmp.ends_with('/') { "" } else { "/" };
    format!("{}{}moor-sock-{:o}", tmp, sep, pid)
}

fn is_root() -> bool {
    (unsafe { libc::getpid() }) == reactor::parent_pid()
}

/* *****************************************************************************
 * Bus connection protocol
 **************************************************************************** */

#[derive(Clone, Copy, PartialEq)]
enum Role {
    /// Root-side connection to one worker.
    RootSide,
    /// A worker's connection to the root.
    WorkerSide,
}

struct BusConn {
    role: Role,
    parser: Mutex<FrameParser>,
    saw_shutdown: AtomicBool,
}

impl BusConn {
    fn new(role: Role) -> BusConn {
        BusConn {
            role,
            parser: Mutex::new(FrameParser::new()),
            saw_shutdown: AtomicBool::new(false),
        }
    }

    fn handle(&self, origin: SockId, frame: Frame) {
        match frame.kind {
            FrameKind::Ping => {}
            FrameKind::Shutdown => {
                self.saw_shutdown.store(true, Ordering::Release);
                if self.role == Role::WorkerSide {
                    debug!("bus shutdown received, winding worker down");
                    reactor::stop();
                }
            }
            FrameKind::Forward | FrameKind::Json | FrameKind::Error => match self.role {
                Role::RootSide => {
                    // Fan out to every other worker, then deliver here.
                    broadcast(
                        wrap_frame(frame.kind, frame.filter, &frame.channel, &frame.data),
                        Some(origin),
                    );
                    deliver_local(frame.filter, &frame.channel, &frame.data);
                }
                Role::WorkerSide => {
                    deliver_local(frame.filter, &frame.channel, &frame.data);
                }
            },
        }
    }
}

impl Protocol for BusConn {
    fn on_data(&self, id: SockId) {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            let n = match socket::read(id, &mut buf) {
                Ok(0) => return,
                Ok(n) => n,
                Err(_) => return,
            };
            let frames = match self.parser.lock().unwrap().feed(&buf[..n]) {
                Ok(frames) => frames,
                Err(err) => crate::fatal(err),
            };
            for frame in frames {
                self.handle(id, frame);
            }
        }
    }

    fn ping(&self, id: SockId) {
        let _ = socket::write_spec(
            id,
            Outgoing::owned(wrap_frame(FrameKind::Ping, 0, &[], &[])),
        );
    }

    fn on_shutdown(&self, id: SockId) {
        // Tell the other side we're going away before the FIN does.
        let _ = socket::write_spec(
            id,
            Outgoing::owned(wrap_frame(FrameKind::Shutdown, 0, &[], &[])),
        );
    }

    fn on_close(&self, id: SockId) {
        match self.role {
            Role::RootSide => {
                let mut state = state().lock().unwrap();
                state.peers.retain(|peer| *peer != id);
                if reactor::is_running() {
                    info!("bus worker connection lost");
                }
            }
            Role::WorkerSide => {
                let mut state = state().lock().unwrap();
                if state.client == Some(id) {
                    state.client = None;
                }
                drop(state);
                if !self.saw_shutdown.load(Ordering::Acquire) && reactor::is_running() {
                    error!("root process lost without a shutdown frame");
                    reactor::stop();
                }
            }
        }
    }
}

/* *****************************************************************************
 * Root listener protocol
 **************************************************************************** */

struct BusListener;

impl Protocol for BusListener {
    fn on_data(&self, id: SockId) {
        // Accept greedily; bus connections are few and precious.
        while let Ok(peer) = socket::accept(id) {
            if reactor::attach(peer, Arc::new(BusConn::new(Role::RootSide))).is_ok() {
                state().lock().unwrap().peers.push(peer);
                debug!("bus accepted worker connection");
            }
        }
    }

    fn ping(&self, id: SockId) {
        socket::touch(id);
    }

    fn on_close(&self, _id: SockId) {
        let was_listening = {
            let mut state = state().lock().unwrap();
            state.listener.take().is_some()
        };
        if was_listening && is_root() && reactor::is_running() {
            // Losing the bus listener while serving is unrecoverable.
            error!("bus listener dropped while running");
            reactor::stop();
        }
    }
}

/* *****************************************************************************
 * Sending
 **************************************************************************** */

fn broadcast(frame: Vec<u8>, skip: Option<SockId>) {
    let peers: Vec<SockId> = state().lock().unwrap().peers.clone();
    for peer in peers {
        if Some(peer) == skip {
            continue;
        }
        let _ = socket::write_spec(peer, Outgoing::copy(&frame));
    }
}

fn transmit(kind: FrameKind, filter: i32, channel: &[u8], data: &[u8]) -> io::Result<()> {
    if !reactor::is_running() {
        return Err(io::Error::new(
            io::ErrorKind::NotConnected,
            "bus inactive, can't send message",
        ));
    }
    let frame = wrap_frame(kind, filter, channel, data);
    let client = state().lock().unwrap().client;
    match client {
        Some(client) => socket::write_spec(client, Outgoing::owned(frame)),
        None => {
            // Root: no uplink, fan out directly.
            broadcast(frame, None);
            Ok(())
        }
    }
}

/// Sends raw bytes to every other process in the cluster. Delivery to this
/// process's own handlers is the caller's concern.
pub fn send(filter: i32, channel: &[u8], data: &[u8]) -> io::Result<()> {
    transmit(FrameKind::Forward, filter, channel, data)
}

/// Sends a JSON-encoded value. Received by handlers as the serialized
/// bytes, flagged as [`FrameKind::Json`] on the wire.
pub fn send_value<T: serde::Serialize>(filter: i32, channel: &[u8], value: &T) -> io::Result<()> {
    let data = serde_json::to_vec(value)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
    transmit(FrameKind::Json, filter, channel, &data)
}

/// Asks every worker process to shut down.
pub fn signal_children() {
    if !is_root() {
        reactor::stop();
        return;
    }
    broadcast(wrap_frame(FrameKind::Shutdown, 0, &[], &[]), None);
}

/* *****************************************************************************
 * Lifecycle
 **************************************************************************** */

/// Wires the bus into the reactor lifecycle. Idempotent; called by
/// [`reactor::run`].
pub(crate) fn install() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        reactor::on_phase(Phase::PreStart, pre_start);
        reactor::on_phase(Phase::AfterFork, after_fork);
        reactor::on_phase(Phase::OnFinish, tear_down);
        pubsub::cluster_init();
    });
}

fn pre_start() {
    if reactor::run_workers() < 2 {
        return;
    }
    let path = socket_path(unsafe { libc::getpid() });
    unsafe {
        let c_path = std::ffi::CString::new(path.as_str()).unwrap();
        libc::unlink(c_path.as_ptr());
    }
    let listener = match socket::listen(Some(&path), None) {
        Ok(listener) => listener,
        Err(err) => {
            error!("couldn't open the bus socket at {}: {}", path, err);
            crate::fatal(err);
        }
    };
    if let Err(err) = reactor::attach(listener, Arc::new(BusListener)) {
        crate::fatal(err);
    }
    let mut state = state().lock().unwrap();
    state.listener = Some(listener);
    state.path = Some(path);
}

fn after_fork() {
    let (listener, path) = {
        let state = state().lock().unwrap();
        (state.listener, state.path.clone())
    };
    let path = match path {
        Some(path) => path,
        None => return,
    };
    if is_root() {
        // Flush any early backlog the edge-triggered selector missed.
        if let Some(listener) = listener {
            reactor::force_event(listener, reactor::Event::Data);
        }
        return;
    }
    // Workers drop the inherited listener and dial the root.
    if let Some(listener) = listener {
        state().lock().unwrap().listener = None;
        socket::force_close(listener);
    }
    let opts = ConnectOpts::unix(&path).on_fail(|_| {
        error!("couldn't reach the cluster bus");
        crate::fatal(io::Error::from(io::ErrorKind::ConnectionRefused));
    });
    match reactor::connect(opts, |_id| {
        Some(Arc::new(BusConn::new(Role::WorkerSide)) as Arc<dyn Protocol>)
    }) {
        Ok(id) => state().lock().unwrap().client = Some(id),
        Err(err) => {
            error!("couldn't dial the cluster bus: {}", err);
            crate::fatal(err);
        }
    }
}

fn tear_down() {
    let mut state = state().lock().unwrap();
    if let Some(path) = state.path.take() {
        if is_root() {
            unsafe {
                if let Ok(c_path) = std::ffi::CString::new(path) {
                    libc::unlink(c_path.as_ptr());
                }
            }
        }
    }
    let listener = state.listener.take();
    let client = state.client.take();
    let peers = std::mem::take(&mut state.peers);
    drop(state);
    if let Some(listener) = listener {
        socket::close(listener);
    }
    if let Some(client) = client {
        socket::close(client);
    }
    for peer in peers {
        socket::close(peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let frame = wrap_frame(FrameKind::Forward, -3, b"chat", b"hello");
        let mut parser = FrameParser::new();
        let frames = parser.feed(&frame).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind, FrameKind::Forward);
        assert_eq!(frames[0].filter, -3);
        assert_eq!(frames[0].channel, b"chat");
        assert_eq!(frames[0].data, b"hello");
    }

    #[test]
    fn parser_handles_fragmentation_and_pipelining() {
        let mut wire = wrap_frame(FrameKind::Forward, 1, b"a", b"first");
        wire.extend(wrap_frame(FrameKind::Json, 2, b"bb", b"second"));
        wire.extend(wrap_frame(FrameKind::Ping, 0, b"", b""));

        let mut parser = FrameParser::new();
        let mut collected = Vec::new();
        for byte in wire {
            collected.extend(parser.feed(&[byte]).unwrap());
        }
        assert_eq!(collected.len(), 3);
        assert_eq!(collected[0].data, b"first");
        assert_eq!(collected[1].kind, FrameKind::Json);
        assert_eq!(collected[1].filter, 2);
        assert_eq!(collected[2].kind, FrameKind::Ping);
    }

    #[test]
    fn root_fans_out_and_delivers() {
        use std::sync::atomic::AtomicUsize;

        static SEEN: AtomicUsize = AtomicUsize::new(0);

        fn record(filter: i32, channel: &[u8], data: &[u8]) {
            assert_eq!(filter, 77);
            assert_eq!(channel, b"room");
            assert_eq!(data, b"payload");
            SEEN.fetch_add(1, Ordering::SeqCst);
        }

        fn socketpair() -> (libc::c_int, libc::c_int) {
            let mut pair = [0; 2];
            assert_eq!(
                unsafe {
                    libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, pair.as_mut_ptr())
                },
                0
            );
            for fd in pair {
                crate::sys::unix::set_nonblock(fd).unwrap();
            }
            (pair[0], pair[1])
        }

        // Two "workers" hooked straight to the root over socket pairs; no
        // forking needed to exercise fan-out and local dispatch.
        let (root_a, worker_a) = socketpair();
        let (root_b, worker_b) = socketpair();
        let ra = socket::open(root_a).unwrap();
        let rb = socket::open(root_b).unwrap();
        {
            let mut state = state().lock().unwrap();
            state.peers.clear();
            state.peers.push(ra);
            state.peers.push(rb);
        }
        set_handler(77, record);

        let frame = wrap_frame(FrameKind::Forward, 77, b"room", b"payload");
        assert_eq!(
            unsafe {
                libc::write(
                    worker_a,
                    frame.as_ptr() as *const libc::c_void,
                    frame.len(),
                )
            },
            frame.len() as isize
        );

        let conn = BusConn::new(Role::RootSide);
        conn.on_data(ra);
        defer::perform_all();
        assert_eq!(SEEN.load(Ordering::SeqCst), 1);

        // The other worker received the frame; the origin did not.
        let mut buf = [0u8; 1024];
        let n = unsafe {
            libc::read(worker_b, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
        };
        assert_eq!(n, frame.len() as isize);
        let mut parser = FrameParser::new();
        let frames = parser.feed(&buf[..n as usize]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].filter, 77);
        assert_eq!(frames[0].data, b"payload");
        let n = unsafe {
            libc::read(worker_a, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
        };
        assert!(n < 0, "origin worker must not get its own frame back");

        state().lock().unwrap().peers.clear();
        socket::force_close(ra);
        socket::force_close(rb);
        unsafe {
            libc::close(worker_a);
            libc::close(worker_b);
        }
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let mut header = Vec::new();
        header.extend_from_slice(&(CHANNEL_LIMIT as u32).to_be_bytes());
        header.extend_from_slice(&0u32.to_be_bytes());
        header.extend_from_slice(&0u32.to_be_bytes());
        header.extend_from_slice(&0i32.to_be_bytes());
        let mut parser = FrameParser::new();
        assert!(parser.feed(&header).is_err());
    }
}
