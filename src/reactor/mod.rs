//! The reactor: protocol attachment, per-connection lane locks, the cycle
//! loop and the worker lifecycle.
//!
//! A [`Protocol`] is a vtable of connection callbacks. The reactor owns one
//! attachment slot per descriptor; events reported by the OS selector are
//! turned into deferred tasks which acquire the right *lane* before
//! invoking a callback:
//!
//! * `Task` — mutating callbacks: `on_data` and protected user tasks.
//! * `Write` — non-mutating, write-only callbacks: `on_ready`, `ping`.
//! * `State` — very short identity checks.
//!
//! Lanes are independent: `on_data` and `on_ready` may run concurrently for
//! the same connection, but two `on_data` calls never do. Lock contention
//! never blocks — the losing task re-schedules itself.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, error, info};

use crate::defer::{self, ForkRole};
use crate::socket::{self, SockId};
use crate::sys;

mod connector;
mod listener;
mod timer;

pub use self::connector::{connect, ConnectOpts};
pub use self::listener::{listen, ListenOpts};
pub use self::timer::run_every;

/// Connection event callbacks.
///
/// All callbacks receive the connection handle; per-connection state lives
/// in the implementing type. Callbacks must not block — yield by deferring
/// (see [`crate::defer`]) instead.
pub trait Protocol: Send + Sync {
    /// There is incoming data. Serialized per connection (Task lane).
    fn on_data(&self, id: SockId) {
        let _ = id;
    }

    /// The outbound queue drained and the socket is writable (Write lane).
    fn on_ready(&self, id: SockId) {
        let _ = id;
    }

    /// The server is shutting down; the connection is closed right after.
    fn on_shutdown(&self, id: SockId) {
        let _ = id;
    }

    /// The connection was closed or the protocol was replaced. Runs after
    /// every other callback has finished.
    fn on_close(&self, id: SockId) {
        let _ = id;
    }

    /// The connection outlived its timeout. The default gives up on it.
    fn ping(&self, id: SockId) {
        socket::force_close(id);
    }

    /// The reactor started monitoring the connection.
    fn on_start(&self, id: SockId) {
        let _ = id;
    }
}

/// The three per-connection lock lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    /// Mutating callbacks: `on_data`, protected user tasks.
    Task = 0,
    /// Write-only callbacks: `on_ready`, `ping`.
    Write = 1,
    /// Short protocol-identity queries.
    State = 2,
}

/// How a connection entered the reactor; drives start-up registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnKind {
    Listener,
    Timer { milliseconds: u64 },
    Conn,
}

pub(crate) struct Attached {
    pub(crate) protocol: Arc<dyn Protocol>,
    pub(crate) kind: ConnKind,
    lanes: [AtomicBool; 3],
}

impl Attached {
    fn new(protocol: Arc<dyn Protocol>, kind: ConnKind) -> Arc<Attached> {
        Arc::new(Attached {
            protocol,
            kind,
            lanes: [
                AtomicBool::new(false),
                AtomicBool::new(false),
                AtomicBool::new(false),
            ],
        })
    }

    fn try_lane(&self, lane: Lane) -> bool {
        !self.lanes[lane as usize].swap(true, Ordering::Acquire)
    }

    fn unlock_lane(&self, lane: Lane) {
        self.lanes[lane as usize].store(false, Ordering::Release);
    }

    fn any_locked(&self) -> bool {
        self.lanes.iter().any(|l| l.load(Ordering::Acquire))
    }
}

struct Conn {
    active: AtomicU64,
    timeout: AtomicU8,
    attached: Mutex<Option<Arc<Attached>>>,
}

struct Context {
    conns: Box<[Conn]>,
    selector: Mutex<Option<Arc<sys::Selector>>>,
    last_cycle: AtomicU64,
    need_review: AtomicBool,
    idle: AtomicBool,
    parent: libc::pid_t,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn ctx() -> &'static Context {
    static CTX: OnceLock<Context> = OnceLock::new();
    CTX.get_or_init(|| {
        let capacity = socket::capacity();
        socket::set_upper(socket::Upper {
            on_close: upper_on_close,
            touch: upper_touch,
            remove: upper_remove,
        });
        let conns = (0..capacity)
            .map(|_| Conn {
                active: AtomicU64::new(0),
                timeout: AtomicU8::new(0),
                attached: Mutex::new(None),
            })
            .collect::<Vec<_>>();
        Context {
            conns: conns.into_boxed_slice(),
            selector: Mutex::new(None),
            last_cycle: AtomicU64::new(unix_now()),
            need_review: AtomicBool::new(false),
            idle: AtomicBool::new(false),
            parent: unsafe { libc::getpid() },
        }
    })
}

fn conn_of(id: SockId) -> Option<&'static Conn> {
    ctx().conns.get(id.fd() as usize)
}

fn selector() -> Option<Arc<sys::Selector>> {
    ctx().selector.lock().unwrap().clone()
}

pub(crate) fn with_selector<R>(f: impl FnOnce(&sys::Selector) -> R) -> Option<R> {
    selector().map(|selector| f(&selector))
}

/// The second the event loop last went around. Cheap; cached per cycle.
pub fn last_tick() -> u64 {
    let tick = ctx().last_cycle.load(Ordering::Relaxed);
    if tick == 0 {
        unix_now()
    } else {
        tick
    }
}

/// Whether the reactor loop is running in this process.
pub fn is_running() -> bool {
    defer::fork_is_active()
}

/// The pid of the root (pre-fork) process.
pub fn parent_pid() -> libc::pid_t {
    ctx().parent
}

/// Asks the reactor to wind down, as if SIGINT had been received.
pub fn stop() {
    defer::request_stop();
}

/* *****************************************************************************
 * Socket layer notifications
 **************************************************************************** */

fn upper_touch(id: SockId) {
    if let Some(conn) = conn_of(id) {
        conn.active.store(last_tick(), Ordering::Relaxed);
    }
}

fn upper_remove(id: SockId) {
    if let Some(selector) = selector() {
        let _ = selector.remove(id.fd());
    }
}

fn upper_on_close(id: SockId) {
    let conn = match conn_of(id) {
        Some(conn) => conn,
        None => return,
    };
    let old = {
        let mut attached = conn.attached.lock().unwrap();
        conn.timeout.store(0, Ordering::Relaxed);
        conn.active.store(last_tick(), Ordering::Relaxed);
        attached.take()
    };
    if let Some(old) = old {
        defer_on_close(id, old);
    }
}

fn defer_on_close(id: SockId, att: Arc<Attached>) {
    let raw = Arc::into_raw(att) as usize;
    defer::defer(deferred_on_close, id.raw() as usize, raw);
}

/* *****************************************************************************
 * Deferred event handlers
 **************************************************************************** */

fn deferred_on_close(id_raw: usize, att_raw: usize) {
    let att = unsafe { Arc::from_raw(att_raw as *const Attached) };
    if att.any_locked() {
        // Somebody is still inside a callback; try again later.
        defer_on_close(SockId::from_raw(id_raw as u64), att);
        return;
    }
    att.protocol.on_close(SockId::from_raw(id_raw as u64));
}

fn locked_attachment(id: SockId, lane: Lane) -> io::Result<Arc<Attached>> {
    let conn = conn_of(id).ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))?;
    let guard = conn
        .attached
        .try_lock()
        .map_err(|_| io::Error::from(io::ErrorKind::WouldBlock))?;
    let att = guard
        .as_ref()
        .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))?
        .clone();
    if !att.try_lane(lane) {
        return Err(io::Error::from(io::ErrorKind::WouldBlock));
    }
    Ok(att)
}

/// A locked protocol reference. The lane is released on drop.
pub struct ProtocolLock {
    att: Arc<Attached>,
    lane: Lane,
}

impl std::ops::Deref for ProtocolLock {
    type Target = dyn Protocol;

    fn deref(&self) -> &Self::Target {
        &*self.att.protocol
    }
}

impl Drop for ProtocolLock {
    fn drop(&mut self) {
        self.att.unlock_lane(self.lane);
    }
}

impl std::fmt::Debug for ProtocolLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolLock")
            .field("lane", &self.lane)
            .finish()
    }
}

/// Attempts to lock a connection's protocol for out-of-task access.
///
/// Errors: `EBADF` when nothing is attached (no callback can be running),
/// `WouldBlock` on lane contention — re-defer and try again.
pub fn try_lock(id: SockId, lane: Lane) -> io::Result<ProtocolLock> {
    if !socket::is_valid(id) {
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    }
    locked_attachment(id, lane).map(|att| ProtocolLock { att, lane })
}

macro_rules! deferred_handler {
    ($name: ident, $lane: expr, |$id: ident, $att: ident| $body: block) => {
        fn $name(id_raw: usize, _unused: usize) {
            let $id = SockId::from_raw(id_raw as u64);
            let $att = match locked_attachment($id, $lane) {
                Ok(att) => att,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    defer::defer($name, id_raw, 0);
                    return;
                }
                Err(_) => return,
            };
            $body
            $att.unlock_lane($lane);
        }
    };
}

deferred_handler!(deferred_on_data, Lane::Task, |id, att| {
    att.protocol.on_data(id);
});

deferred_handler!(deferred_on_ready, Lane::Write, |id, att| {
    att.protocol.on_ready(id);
});

fn deferred_on_shutdown(id_raw: usize, _unused: usize) {
    let id = SockId::from_raw(id_raw as u64);
    match locked_attachment(id, Lane::Write) {
        Ok(att) => {
            att.protocol.on_shutdown(id);
            att.unlock_lane(Lane::Write);
            socket::close(id);
        }
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
            defer::defer(deferred_on_shutdown, id_raw, 0);
        }
        Err(_) => {}
    }
}

fn deferred_ping(id_raw: usize, _unused: usize) {
    let id = SockId::from_raw(id_raw as u64);
    let conn = match conn_of(id) {
        Some(conn) => conn,
        None => return,
    };
    let timeout = conn.timeout.load(Ordering::Relaxed) as u64;
    if timeout > 0 && last_tick().saturating_sub(conn.active.load(Ordering::Relaxed)) < timeout {
        // Activity happened while the ping was queued.
        return;
    }
    match locked_attachment(id, Lane::Write) {
        Ok(att) => {
            att.protocol.ping(id);
            att.unlock_lane(Lane::Write);
        }
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
            defer::defer(deferred_ping, id_raw, 0);
        }
        Err(_) => {}
    }
}

fn flush_task(id_raw: usize, _unused: usize) {
    let _ = socket::flush(SockId::from_raw(id_raw as u64));
}

/// An I/O event that can be forced on a connection, bypassing the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Acts as if the connection received data.
    Data,
    /// Acts as if the connection turned writable.
    Ready,
    /// Acts as if the connection's timeout expired.
    Timeout,
}

/// Schedules an event for a connection as if the OS had reported it.
pub fn force_event(id: SockId, event: Event) {
    match event {
        Event::Data => defer::defer(deferred_on_data, id.raw() as usize, 0),
        Event::Ready => {
            defer::defer(flush_task, id.raw() as usize, 0);
            defer::defer(deferred_on_ready, id.raw() as usize, 0);
        }
        Event::Timeout => defer::defer(deferred_ping, id.raw() as usize, 0),
    }
}

/* *****************************************************************************
 * Attaching protocols
 **************************************************************************** */

/// Attaches (or replaces) a protocol on a connection. The previous
/// protocol, if any, gets its `on_close`.
pub fn attach(id: SockId, protocol: Arc<dyn Protocol>) -> io::Result<()> {
    attach_kind(id, protocol, ConnKind::Conn)
}

pub(crate) fn attach_kind(
    id: SockId,
    protocol: Arc<dyn Protocol>,
    kind: ConnKind,
) -> io::Result<()> {
    let conn = conn_of(id).ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))?;
    let att = Attached::new(protocol, kind);
    let old = {
        let mut attached = conn.attached.lock().unwrap();
        if !socket::is_valid(id) {
            drop(attached);
            defer_on_close(id, att);
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        conn.active.store(last_tick(), Ordering::Relaxed);
        attached.replace(att)
    };
    if let Some(old) = old {
        defer_on_close(id, old);
    }
    if let Some(selector) = selector() {
        register_with_selector(&selector, id, kind);
    }
    Ok(())
}

fn register_with_selector(selector: &sys::Selector, id: SockId, kind: ConnKind) {
    let result = match kind {
        ConnKind::Timer { milliseconds } => selector.add_timer(id.fd(), id.raw(), milliseconds),
        _ => selector.add(id.fd(), id.raw()),
    };
    if let Err(err) = result {
        if err.raw_os_error() != Some(libc::EEXIST) {
            error!("couldn't monitor descriptor {}: {}", id.fd(), err);
        }
    }
}

/// Sets a connection's inactivity timeout in seconds. 0 disables it.
pub fn set_timeout(id: SockId, seconds: u8) {
    if let Some(conn) = conn_of(id) {
        if socket::is_valid(id) {
            conn.active.store(last_tick(), Ordering::Relaxed);
            conn.timeout.store(seconds, Ordering::Relaxed);
        }
    }
}

/// Reads back a connection's timeout. 0 when disabled or the handle is
/// dead.
pub fn timeout(id: SockId) -> u8 {
    match conn_of(id) {
        Some(conn) if socket::is_valid(id) => conn.timeout.load(Ordering::Relaxed),
        _ => 0,
    }
}

/* *****************************************************************************
 * Protected user tasks
 **************************************************************************** */

struct IoTask {
    id: SockId,
    lane: Lane,
    task: Box<dyn FnOnce(SockId, &dyn Protocol) + Send>,
    fallback: Option<Box<dyn FnOnce(SockId) + Send>>,
}

fn perform_io_task(task_raw: usize, _unused: usize) {
    let task = unsafe { Box::from_raw(task_raw as *mut IoTask) };
    match try_lock(task.id, task.lane) {
        Ok(guard) => {
            let IoTask { id, task, .. } = *task;
            task(id, &*guard);
        }
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
            defer::defer(perform_io_task, Box::into_raw(task) as usize, 0);
        }
        Err(_) => {
            let IoTask { id, fallback, .. } = *task;
            if let Some(fallback) = fallback {
                fallback(id);
            }
        }
    }
}

/// Schedules `task` to run while holding `lane` on the connection. If the
/// connection dies first, `fallback` runs instead (for cleanup).
pub fn defer_io_task(
    id: SockId,
    lane: Lane,
    task: impl FnOnce(SockId, &dyn Protocol) + Send + 'static,
    fallback: Option<Box<dyn FnOnce(SockId) + Send>>,
) {
    let boxed = Box::new(IoTask {
        id,
        lane,
        task: Box::new(task),
        fallback,
    });
    defer::defer(perform_io_task, Box::into_raw(boxed) as usize, 0);
}

/* *****************************************************************************
 * Lifecycle phases
 **************************************************************************** */

/// Process lifecycle points that subsystems can hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// In the root, before any worker is forked.
    PreStart,
    /// In every process, right after the fork.
    AfterFork,
    /// In every process, once the event loop is about to run.
    OnStart,
    /// In every process, while shutting down.
    OnFinish,
}

fn phase_callbacks() -> &'static Mutex<Vec<(Phase, fn())>> {
    static CALLBACKS: OnceLock<Mutex<Vec<(Phase, fn())>>> = OnceLock::new();
    CALLBACKS.get_or_init(|| Mutex::new(Vec::new()))
}

pub(crate) fn on_phase(phase: Phase, callback: fn()) {
    phase_callbacks().lock().unwrap().push((phase, callback));
}

fn emit_phase(phase: Phase) {
    let callbacks: Vec<fn()> = phase_callbacks()
        .lock()
        .unwrap()
        .iter()
        .filter(|(p, _)| *p == phase)
        .map(|(_, f)| *f)
        .collect();
    for callback in callbacks {
        callback();
    }
}

/* *****************************************************************************
 * The cycle
 **************************************************************************** */

/// Poll timeout while the deferred queue is otherwise idle.
const CYCLE_BLOCK_MS: i32 = 512;

/// Descriptors examined per timeout-sweep task.
const REVIEW_CHUNK: usize = 256;

thread_local! {
    static EVENTS: std::cell::RefCell<sys::Events> =
        std::cell::RefCell::new(Vec::with_capacity(sys::EVENTS_CAPACITY));
}

fn dispatch_events(selector: &sys::Selector, timeout_ms: i32) -> io::Result<usize> {
    EVENTS.with(|events| {
        let mut events = events.borrow_mut();
        let n = selector.select(&mut events, timeout_ms)?;
        for event in events.iter() {
            let id = SockId::from_raw(sys::event::token(event));
            if sys::event::is_error(event) {
                socket::force_close(id);
                continue;
            }
            if sys::event::is_readable(event) {
                defer::defer(deferred_on_data, id.raw() as usize, 0);
            }
            if sys::event::is_writable(event) {
                defer::defer(flush_task, id.raw() as usize, 0);
                defer::defer(deferred_on_ready, id.raw() as usize, 0);
            }
        }
        Ok(n)
    })
}

fn cycle_task(_: usize, _: usize) {
    let ctx = ctx();
    ctx.last_cycle.store(unix_now(), Ordering::Relaxed);
    let selector = match selector() {
        Some(selector) => selector,
        None => return,
    };
    let events = if defer::has_queue() {
        dispatch_events(&selector, 0)
    } else {
        let events = dispatch_events(&selector, CYCLE_BLOCK_MS);
        if let Ok(0) = events {
            if ctx.idle.swap(false, Ordering::Relaxed) {
                if let Some(on_idle) = run_state().on_idle {
                    on_idle();
                }
            }
        }
        events
    };
    match events {
        Ok(n) if n > 0 => ctx.idle.store(true, Ordering::Relaxed),
        Ok(_) => {}
        Err(err) => {
            debug!("event poll failed: {}", err);
            return;
        }
    }
    if !defer::fork_is_active() {
        return;
    }
    if ctx.need_review.swap(false, Ordering::Relaxed) {
        defer::defer(review_timeouts, 0, 0);
    }
    defer::defer(cycle_task, 0, 0);
}

// Walks a bounded descriptor range looking for expired timeouts, then
// reschedules itself for the next range.
fn review_timeouts(fd_start: usize, _unused: usize) {
    let ctx = ctx();
    let now = last_tick();
    let end = (fd_start + REVIEW_CHUNK).min(ctx.conns.len());
    for fd in fd_start..end {
        let conn = &ctx.conns[fd];
        let timeout = conn.timeout.load(Ordering::Relaxed) as u64;
        if timeout == 0 {
            continue;
        }
        let active = conn.active.load(Ordering::Relaxed);
        if active.saturating_add(timeout) > now {
            continue;
        }
        let id = match socket::fd_to_id(fd as i32) {
            Some(id) => id,
            None => continue,
        };
        let has_protocol = match conn.attached.try_lock() {
            Ok(attached) => attached.is_some(),
            // Contended means busy means alive; skip this round.
            Err(_) => false,
        };
        if has_protocol {
            defer::defer(deferred_ping, id.raw() as usize, 0);
        }
    }
    if end >= ctx.conns.len() {
        ctx.need_review.store(true, Ordering::Relaxed);
    } else {
        defer::defer(review_timeouts, end, 0);
    }
}

/* *****************************************************************************
 * Running the reactor
 **************************************************************************** */

/// Options for [`run`].
#[derive(Default, Clone, Copy)]
pub struct RunOpts {
    /// Worker threads per process. 0 picks the CPU count.
    pub threads: u32,
    /// Worker processes. 0 picks the CPU count; 1 disables forking.
    pub workers: u32,
    /// Called when the event loop has been idle for a while.
    pub on_idle: Option<fn()>,
    /// Called in every process while shutting down.
    pub on_finish: Option<fn()>,
}

impl std::fmt::Debug for RunOpts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunOpts")
            .field("threads", &self.threads)
            .field("workers", &self.workers)
            .finish()
    }
}

fn run_opts_cell() -> &'static Mutex<RunOpts> {
    static STATE: OnceLock<Mutex<RunOpts>> = OnceLock::new();
    STATE.get_or_init(|| Mutex::new(RunOpts::default()))
}

fn run_state() -> RunOpts {
    *run_opts_cell().lock().unwrap()
}

pub(crate) fn run_workers() -> u32 {
    run_state().workers
}

fn init_task(_: usize, _: usize) {
    let ctx = ctx();
    let selector = match sys::Selector::new() {
        Ok(selector) => Arc::new(selector),
        Err(err) => {
            error!("couldn't create the event selector: {}", err);
            crate::fatal(err);
        }
    };
    *ctx.selector.lock().unwrap() = Some(Arc::clone(&selector));
    ctx.last_cycle.store(unix_now(), Ordering::Relaxed);

    emit_phase(Phase::AfterFork);

    for fd in 0..ctx.conns.len() {
        let att = ctx.conns[fd].attached.lock().unwrap().clone();
        if let Some(att) = att {
            let id = match socket::fd_to_id(fd as i32) {
                Some(id) => id,
                None => continue,
            };
            register_with_selector(&selector, id, att.kind);
            ctx.conns[fd].active.store(last_tick(), Ordering::Relaxed);
            att.protocol.on_start(id);
        }
    }

    emit_phase(Phase::OnStart);
    ctx.need_review.store(true, Ordering::Relaxed);
    defer::defer(cycle_task, 0, 0);
}

fn cleanup() {
    let ctx = ctx();
    for fd in 0..ctx.conns.len() {
        if ctx.conns[fd].attached.lock().unwrap().is_some() {
            if let Some(id) = socket::fd_to_id(fd as i32) {
                defer::defer(deferred_on_shutdown, id.raw() as usize, 0);
            }
        }
    }
    cycle_task(0, 0);
    defer::perform_all();
    cycle_task(0, 0);
    emit_phase(Phase::OnFinish);
    if let Some(on_finish) = run_state().on_finish {
        on_finish();
    }
    defer::perform_all();
    *ctx.selector.lock().unwrap() = None;
}

/// Runs the reactor until it is stopped by a signal or [`stop`].
///
/// With `workers > 1` the process forks; worker processes exit inside this
/// call and only the root returns. Every process runs `threads` pool
/// threads over the shared deferred queue.
pub fn run(opts: RunOpts) {
    let mut opts = opts;
    ctx();
    crate::cluster::install();
    let cpus = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    let cpus = if cpus > 0 { cpus as u32 } else { 1 };
    if opts.threads == 0 && opts.workers == 0 {
        opts.threads = cpus;
        opts.workers = cpus;
    }
    if opts.workers == 0 {
        opts.workers = 1;
    }
    if opts.threads == 0 {
        opts.threads = 1;
    }
    store_run_opts(opts);

    info!(
        "server is running {} worker(s) X {} thread(s), press ^C to stop",
        opts.workers, opts.threads
    );
    emit_phase(Phase::PreStart);
    defer::defer(init_task, 0, 0);
    let role = defer::perform_in_fork(opts.workers, opts.threads);
    cleanup();
    match role {
        Err(err) => error!("couldn't spawn workers: {}", err),
        Ok(ForkRole::Worker(_)) => std::process::exit(0),
        Ok(ForkRole::Root) => {
            info!("--- completed shutdown ---");
        }
    }
}

fn store_run_opts(opts: RunOpts) {
    *run_opts_cell().lock().unwrap() = opts;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Quiet;

    impl Protocol for Quiet {}

    fn open_pair_end() -> SockId {
        let mut pair = [0; 2];
        assert_eq!(
            unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, pair.as_mut_ptr()) },
            0
        );
        unsafe { libc::close(pair[1]) };
        socket::open(pair[0]).unwrap()
    }

    #[test]
    fn lanes_lock_independently() {
        let id = open_pair_end();
        attach(id, Arc::new(Quiet)).unwrap();

        let task = try_lock(id, Lane::Task).unwrap();
        let contended = try_lock(id, Lane::Task);
        assert_eq!(
            contended.err().map(|e| e.kind()),
            Some(io::ErrorKind::WouldBlock)
        );
        // A different lane is still free.
        let write = try_lock(id, Lane::Write).unwrap();
        drop(task);
        let task_again = try_lock(id, Lane::Task).unwrap();
        drop(task_again);
        drop(write);

        socket::force_close(id);
        assert_eq!(
            try_lock(id, Lane::Task).err().and_then(|e| e.raw_os_error()),
            Some(libc::EBADF)
        );
        defer::perform_all();
    }

    #[test]
    fn timeouts_are_per_connection() {
        let id = open_pair_end();
        attach(id, Arc::new(Quiet)).unwrap();
        assert_eq!(timeout(id), 0);
        set_timeout(id, 40);
        assert_eq!(timeout(id), 40);
        socket::force_close(id);
        assert_eq!(timeout(id), 0);
        defer::perform_all();
    }
}
