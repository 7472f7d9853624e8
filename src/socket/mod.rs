//! Connection registry, generation-counted socket handles and the
//! user-space outbound write queue.
//!
//! Every descriptor managed by the crate is addressed through a [`SockId`]:
//! the descriptor number plus an 8-bit generation counter that is bumped
//! each time the slot is recycled. A stale handle — one that survived a
//! close/accept race — fails every call with `EBADF` instead of touching
//! somebody else's connection.
//!
//! Handles are predictable and only meaningful inside the local process
//! tree; never hand them to a remote system.
//!
//! Outbound data never blocks: [`write`] and [`write_spec`] enqueue packets
//! on the connection and schedule a deferred [`flush`]. Packets drain in
//! FIFO order, except for urgent packets which jump the queue (but never
//! preempt a partially written packet).

use std::collections::VecDeque;
use std::ffi::CString;
use std::fs::File;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, OnceLock};

use log::debug;

use crate::defer;
use crate::sys;

pub(crate) mod hooks;
pub(crate) mod packet;

pub use self::hooks::RwHooks;

use self::packet::{Packet, PacketSource, PACKET_BUF};

/// A generation-counted connection handle: `(fd << 8) | generation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SockId(u64);

impl SockId {
    /// Reconstructs a handle from its raw value (see [`SockId::raw`]).
    pub fn from_raw(raw: u64) -> SockId {
        SockId(raw)
    }

    /// The raw transportable value of this handle.
    pub fn raw(self) -> u64 {
        self.0
    }

    pub(crate) fn fd(self) -> RawFd {
        (self.0 >> 8) as RawFd
    }

    pub(crate) fn generation(self) -> u8 {
        self.0 as u8
    }

    fn compose(fd: RawFd, generation: u8) -> SockId {
        SockId(((fd as u64) << 8) | generation as u64)
    }
}

/* *****************************************************************************
 * Registry
 **************************************************************************** */

struct SlotInner {
    close_pending: bool,
    sent: usize,
    queue: VecDeque<Packet>,
    hooks: Option<Arc<dyn RwHooks>>,
    peer: Option<(libc::sockaddr_storage, libc::socklen_t)>,
}

struct Slot {
    generation: std::sync::atomic::AtomicU8,
    open: std::sync::atomic::AtomicBool,
    inner: Mutex<SlotInner>,
}

use std::sync::atomic::Ordering;

impl Slot {
    fn new() -> Slot {
        Slot {
            generation: std::sync::atomic::AtomicU8::new(0),
            open: std::sync::atomic::AtomicBool::new(false),
            inner: Mutex::new(SlotInner {
                close_pending: false,
                sent: 0,
                queue: VecDeque::new(),
                hooks: None,
                peer: None,
            }),
        }
    }
}

struct Registry {
    slots: Box<[Slot]>,
}

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let capacity = raise_fd_limit();
        debug!("socket registry sized for {} descriptors", capacity);
        let slots = (0..capacity).map(|_| Slot::new()).collect::<Vec<_>>();
        Registry {
            slots: slots.into_boxed_slice(),
        }
    })
}

/// Raises the soft `RLIMIT_NOFILE` to the hard limit and returns the
/// resulting descriptor capacity.
fn raise_fd_limit() -> usize {
    let mut cap = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    unsafe {
        let mut rlim = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        if libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) == 0 {
            #[cfg(any(target_os = "macos", target_os = "ios"))]
            {
                rlim.rlim_cur = rlim.rlim_max.min(libc::OPEN_MAX as libc::rlim_t);
            }
            #[cfg(not(any(target_os = "macos", target_os = "ios")))]
            {
                rlim.rlim_cur = rlim.rlim_max;
            }
            libc::setrlimit(libc::RLIMIT_NOFILE, &rlim);
            if libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) == 0
                && (rlim.rlim_cur as i64) > cap as i64
            {
                cap = rlim.rlim_cur as libc::c_long;
            }
        }
    }
    cap.max(256) as usize
}

/// The number of descriptor slots this process can track.
pub fn capacity() -> usize {
    registry().slots.len()
}

/* *****************************************************************************
 * Upper-layer notification seam
 **************************************************************************** */

/// Callbacks installed by the reactor so slot recycling and activity are
/// reflected in the connection table without a circular dependency.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Upper {
    pub(crate) on_close: fn(SockId),
    pub(crate) touch: fn(SockId),
    pub(crate) remove: fn(SockId),
}

fn noop_upper(_: SockId) {}

static UPPER: OnceLock<Upper> = OnceLock::new();

pub(crate) fn set_upper(upper: Upper) {
    let _ = UPPER.set(upper);
}

fn upper() -> Upper {
    *UPPER.get().unwrap_or(&Upper {
        on_close: noop_upper,
        touch: noop_upper,
        remove: noop_upper,
    })
}

/* *****************************************************************************
 * Slot lifecycle
 **************************************************************************** */

fn ebadf() -> io::Error {
    io::Error::from_raw_os_error(libc::EBADF)
}

fn validate(id: SockId) -> io::Result<&'static Slot> {
    let fd = id.fd();
    if fd < 0 {
        return Err(ebadf());
    }
    let slot = registry().slots.get(fd as usize).ok_or_else(ebadf)?;
    if slot.generation.load(Ordering::Acquire) != id.generation() {
        return Err(ebadf());
    }
    Ok(slot)
}

fn validate_open(id: SockId) -> io::Result<&'static Slot> {
    let slot = validate(id)?;
    if !slot.open.load(Ordering::Acquire) {
        return Err(ebadf());
    }
    Ok(slot)
}

/// Recycles a slot for (re)use, releasing whatever the previous occupant
/// left behind and notifying the upper layer if the slot was live.
fn clear_slot(fd: RawFd, open_after: bool) -> SockId {
    let slot = &registry().slots[fd as usize];
    let old_queue;
    let old_hooks;
    let old_id;
    let was_open;
    {
        let mut inner = slot.inner.lock().unwrap();
        old_id = SockId::compose(fd, slot.generation.load(Ordering::Acquire));
        slot.generation.fetch_add(1, Ordering::AcqRel);
        was_open = slot.open.swap(open_after, Ordering::AcqRel);
        old_hooks = inner.hooks.take();
        old_queue = mem::take(&mut inner.queue);
        inner.sent = 0;
        inner.close_pending = false;
        inner.peer = None;
    }
    drop(old_queue);
    if let Some(hooks) = &old_hooks {
        hooks.on_close(old_id);
    }
    if was_open || old_hooks.is_some() {
        (upper().on_close)(old_id);
        (upper().remove)(old_id);
    }
    SockId::compose(fd, slot.generation.load(Ordering::Acquire))
}

/* *****************************************************************************
 * Opening sockets
 **************************************************************************** */

struct AddrInfo {
    head: *mut libc::addrinfo,
}

impl AddrInfo {
    fn resolve(address: Option<&str>, port: &str, passive: bool) -> io::Result<AddrInfo> {
        let address = match address {
            Some(a) => Some(CString::new(a).map_err(|_| io::ErrorKind::InvalidInput)?),
            None => None,
        };
        let port = CString::new(port).map_err(|_| io::ErrorKind::InvalidInput)?;
        let mut hints: libc::addrinfo = unsafe { mem::zeroed() };
        hints.ai_family = libc::AF_UNSPEC;
        hints.ai_socktype = libc::SOCK_STREAM;
        if passive {
            hints.ai_flags = libc::AI_PASSIVE;
        }
        let mut head: *mut libc::addrinfo = std::ptr::null_mut();
        let res = unsafe {
            libc::getaddrinfo(
                address.as_ref().map_or(std::ptr::null(), |a| a.as_ptr()),
                port.as_ptr(),
                &hints,
                &mut head,
            )
        };
        if res != 0 {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "address resolution failed",
            ));
        }
        Ok(AddrInfo { head })
    }

    fn iter(&self) -> impl Iterator<Item = &libc::addrinfo> {
        let mut next = self.head;
        std::iter::from_fn(move || {
            if next.is_null() {
                None
            } else {
                let cur = unsafe { &*next };
                next = cur.ai_next;
                Some(cur)
            }
        })
    }
}

impl Drop for AddrInfo {
    fn drop(&mut self) {
        unsafe { libc::freeaddrinfo(self.head) };
    }
}

fn unix_sockaddr(path: &str) -> io::Result<(libc::sockaddr_un, libc::socklen_t)> {
    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let bytes = path.as_bytes();
    if bytes.len() >= addr.sun_path.len() {
        return Err(io::Error::from(io::ErrorKind::InvalidInput));
    }
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }
    let len = mem::size_of::<libc::sa_family_t>() + bytes.len() + 1;
    Ok((addr, len as libc::socklen_t))
}

fn set_nodelay(fd: RawFd) {
    let one: libc::c_int = 1;
    unsafe {
        // Best effort; fails harmlessly on non-TCP descriptors.
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &one as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

/// Opens a listening non-blocking socket and returns its handle.
///
/// With a `port`, `address` is resolved and bound as a TCP listener. With
/// `port == None`, `address` is a Unix-domain socket path.
pub fn listen(address: Option<&str>, port: Option<&str>) -> io::Result<SockId> {
    let fd = match port {
        Some(port) => {
            let info = AddrInfo::resolve(address, port, true)?;
            let mut fd = -1;
            for ai in info.iter() {
                fd = match syscall!(socket(ai.ai_family, ai.ai_socktype, ai.ai_protocol)) {
                    Ok(fd) => fd,
                    Err(_) => continue,
                };
                let one: libc::c_int = 1;
                unsafe {
                    libc::setsockopt(
                        fd,
                        libc::SOL_SOCKET,
                        libc::SO_REUSEADDR,
                        &one as *const _ as *const libc::c_void,
                        mem::size_of::<libc::c_int>() as libc::socklen_t,
                    );
                }
                if syscall!(bind(fd, ai.ai_addr, ai.ai_addrlen)).is_ok() {
                    break;
                }
                let _ = syscall!(close(fd));
                fd = -1;
            }
            if fd < 0 {
                return Err(io::Error::new(io::ErrorKind::AddrInUse, "couldn't bind"));
            }
            fd
        }
        None => {
            let path = address.ok_or(io::ErrorKind::InvalidInput)?;
            let (addr, len) = unix_sockaddr(path)?;
            let fd = syscall!(socket(libc::AF_UNIX, libc::SOCK_STREAM, 0))?;
            if let Err(err) = syscall!(bind(fd, &addr as *const _ as *const libc::sockaddr, len)) {
                let _ = syscall!(close(fd));
                return Err(err);
            }
            fd
        }
    };
    sys::unix::set_nonblock(fd)?;
    if let Err(err) = syscall!(listen(fd, libc::SOMAXCONN)) {
        let _ = syscall!(close(fd));
        return Err(err);
    }
    Ok(clear_slot(fd, true))
}

/// Accepts a connection from a listening handle. Returns `WouldBlock` when
/// the backlog is empty.
pub fn accept(listener: SockId) -> io::Result<SockId> {
    validate_open(listener)?;
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    #[cfg(any(target_os = "linux", target_os = "android"))]
    let fd = syscall!(accept4(
        listener.fd(),
        &mut storage as *mut _ as *mut libc::sockaddr,
        &mut len,
        libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
    ))?;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let fd = {
        let fd = syscall!(accept(
            listener.fd(),
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        ))?;
        sys::unix::set_nonblock(fd)?;
        sys::unix::set_cloexec(fd)?;
        fd
    };
    set_nodelay(fd);
    let id = clear_slot(fd, true);
    let slot = &registry().slots[fd as usize];
    slot.inner.lock().unwrap().peer = Some((storage, len));
    Ok(id)
}

/// Initiates a non-blocking client connection. The connection is usually
/// still in progress when this returns; wait for a writable event.
///
/// With `port == None`, `address` is a Unix-domain socket path.
pub fn connect(address: &str, port: Option<&str>) -> io::Result<SockId> {
    let (fd, peer) = match port {
        Some(port) => {
            let info = AddrInfo::resolve(Some(address), port, false)?;
            let ai = info.iter().next().ok_or(io::ErrorKind::NotFound)?;
            let fd = syscall!(socket(ai.ai_family, ai.ai_socktype, ai.ai_protocol))?;
            sys::unix::set_nonblock(fd)?;
            match syscall!(connect(fd, ai.ai_addr, ai.ai_addrlen)) {
                Ok(_) => {}
                Err(ref err) if err.raw_os_error() == Some(libc::EINPROGRESS) => {}
                Err(err) => {
                    let _ = syscall!(close(fd));
                    return Err(err);
                }
            }
            let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
            let len = ai
                .ai_addrlen
                .min(mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t);
            unsafe {
                std::ptr::copy_nonoverlapping(
                    ai.ai_addr as *const u8,
                    &mut storage as *mut _ as *mut u8,
                    len as usize,
                );
            }
            (fd, Some((storage, len)))
        }
        None => {
            let (addr, len) = unix_sockaddr(address)?;
            let fd = syscall!(socket(libc::AF_UNIX, libc::SOCK_STREAM, 0))?;
            sys::unix::set_nonblock(fd)?;
            match syscall!(connect(fd, &addr as *const _ as *const libc::sockaddr, len)) {
                Ok(_) => {}
                Err(ref err)
                    if matches!(
                        err.raw_os_error(),
                        Some(libc::EINPROGRESS) | Some(libc::EAGAIN)
                    ) => {}
                Err(err) => {
                    let _ = syscall!(close(fd));
                    return Err(err);
                }
            }
            (fd, None)
        }
    };
    set_nodelay(fd);
    let id = clear_slot(fd, true);
    if let Some(peer) = peer {
        registry().slots[fd as usize].inner.lock().unwrap().peer = Some(peer);
    }
    Ok(id)
}

/// Adopts an existing descriptor, clearing any previous slot state and
/// returning a fresh handle for it.
pub fn open(fd: RawFd) -> io::Result<SockId> {
    if fd < 0 || fd as usize >= capacity() {
        return Err(ebadf());
    }
    Ok(clear_slot(fd, true))
}

/* *****************************************************************************
 * Reading and status
 **************************************************************************** */

fn is_transient(errno: Option<i32>) -> bool {
    matches!(
        errno,
        Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) | Some(libc::EINTR) | Some(libc::ENOTCONN)
    )
}

/// Reads decoded data into `buf`.
///
/// `Ok(0)` means no data is available right now — which, behind a transport
/// hook, is not the same as the kernel buffer being empty. EOF and hard
/// errors force-close the connection and return the error.
pub fn read(id: SockId, buf: &mut [u8]) -> io::Result<usize> {
    let slot = validate_open(id)?;
    let hooks = slot.inner.lock().unwrap().hooks.clone();
    let result = match &hooks {
        Some(hooks) => hooks.read(id, buf),
        None => hooks::raw_read(id, buf),
    };
    match result {
        Ok(0) if buf.is_empty() => Ok(0),
        Ok(0) => {
            force_close(id);
            Err(io::Error::from(io::ErrorKind::UnexpectedEof))
        }
        Ok(n) => {
            (upper().touch)(id);
            Ok(n)
        }
        Err(err) if is_transient(err.raw_os_error()) || err.kind() == io::ErrorKind::WouldBlock => {
            Ok(0)
        }
        Err(err) => {
            force_close(id);
            Err(err)
        }
    }
}

/// Returns `true` when the handle refers to a live, open socket.
pub fn is_valid(id: SockId) -> bool {
    validate_open(id).is_ok()
}

/// Returns the active handle for a descriptor, if the slot is open.
pub fn fd_to_id(fd: RawFd) -> Option<SockId> {
    if fd < 0 || fd as usize >= capacity() {
        return None;
    }
    let slot = &registry().slots[fd as usize];
    if slot.open.load(Ordering::Acquire) {
        Some(SockId::compose(
            fd,
            slot.generation.load(Ordering::Acquire),
        ))
    } else {
        None
    }
}

/// Marks the connection as active "now" for timeout accounting.
pub fn touch(id: SockId) {
    (upper().touch)(id);
}

/// Returns `true` when the outbound queue holds undelivered data.
pub fn has_pending(id: SockId) -> bool {
    match validate_open(id) {
        Ok(slot) => !slot.inner.lock().unwrap().queue.is_empty(),
        Err(_) => false,
    }
}

/// A snapshot of the peer address taken at accept/connect time. `None` for
/// Unix-domain and adopted descriptors.
pub fn peer_addr(id: SockId) -> Option<SocketAddr> {
    let slot = validate_open(id).ok()?;
    let (storage, _len) = slot.inner.lock().unwrap().peer?;
    // The storage was written by the kernel as `sockaddr_in(6)`.
    unsafe {
        match storage.ss_family as libc::c_int {
            libc::AF_INET => {
                let addr = *(&storage as *const _ as *const libc::sockaddr_in);
                let ip = std::net::Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
                Some(SocketAddr::new(ip.into(), u16::from_be(addr.sin_port)))
            }
            libc::AF_INET6 => {
                let addr = *(&storage as *const _ as *const libc::sockaddr_in6);
                let ip = std::net::Ipv6Addr::from(addr.sin6_addr.s6_addr);
                Some(SocketAddr::new(ip.into(), u16::from_be(addr.sin6_port)))
            }
            _ => None,
        }
    }
}

/// Installs transport hooks on a connection.
pub fn set_hooks(id: SockId, hooks: Arc<dyn RwHooks>) -> io::Result<()> {
    let slot = validate_open(id)?;
    slot.inner.lock().unwrap().hooks = Some(hooks);
    Ok(())
}

/// Removes installed hooks, restoring direct descriptor I/O.
pub fn clear_hooks(id: SockId) -> io::Result<()> {
    let slot = validate_open(id)?;
    slot.inner.lock().unwrap().hooks = None;
    Ok(())
}

/* *****************************************************************************
 * Writing
 **************************************************************************** */

enum Source<'a> {
    Copy(&'a [u8]),
    Owned(Box<[u8]>, usize),
    File(File, u64, u64),
    SharedFile(Arc<File>, u64, u64),
}

/// A description of outbound data handed to [`write_spec`].
pub struct Outgoing<'a> {
    source: Source<'a>,
    urgent: bool,
}

impl std::fmt::Debug for Outgoing<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.source {
            Source::Copy(data) => format!("copy[{}]", data.len()),
            Source::Owned(bytes, offset) => format!("owned[{}+{}]", bytes.len(), offset),
            Source::File(_, offset, len) => format!("file[{}..+{}]", offset, len),
            Source::SharedFile(_, offset, len) => format!("shared-file[{}..+{}]", offset, len),
        };
        f.debug_struct("Outgoing")
            .field("source", &kind)
            .field("urgent", &self.urgent)
            .finish()
    }
}

impl<'a> Outgoing<'a> {
    /// Copies `data` (into a pooled buffer when it fits).
    pub fn copy(data: &'a [u8]) -> Outgoing<'a> {
        Outgoing {
            source: Source::Copy(data),
            urgent: false,
        }
    }

    /// Takes ownership of `bytes`; the allocation is released once sent.
    pub fn owned(bytes: Vec<u8>) -> Outgoing<'static> {
        Outgoing {
            source: Source::Owned(bytes.into_boxed_slice(), 0),
            urgent: false,
        }
    }

    /// As [`Outgoing::owned`], sending from `offset` onwards.
    pub fn owned_from(bytes: Vec<u8>, offset: usize) -> Outgoing<'static> {
        Outgoing {
            source: Source::Owned(bytes.into_boxed_slice(), offset),
            urgent: false,
        }
    }

    /// Sends `len` bytes of `file` starting at `offset`. The file is closed
    /// when the packet completes (or is discarded).
    pub fn file(file: File, offset: u64, len: u64) -> Outgoing<'static> {
        Outgoing {
            source: Source::File(file, offset, len),
            urgent: false,
        }
    }

    /// As [`Outgoing::file`] for a shared descriptor; the underlying file
    /// closes with its last reference.
    pub fn shared_file(file: Arc<File>, offset: u64, len: u64) -> Outgoing<'static> {
        Outgoing {
            source: Source::SharedFile(file, offset, len),
            urgent: false,
        }
    }

    /// Queue-jump: the packet is placed at the head of the queue, though
    /// never ahead of a partially sent packet.
    pub fn urgent(mut self) -> Self {
        self.urgent = true;
        self
    }
}

fn flush_task(arg1: usize, _arg2: usize) {
    let _ = flush(SockId::from_raw(arg1 as u64));
}

/// Copies `data` to the connection's outbound queue and schedules a flush.
pub fn write(id: SockId, data: &[u8]) -> io::Result<()> {
    write_spec(id, Outgoing::copy(data))
}

/// Enqueues an outbound packet described by `spec`.
///
/// On a stale or closed handle the packet's resources are released here and
/// now — exactly once — and `EBADF` is returned.
pub fn write_spec(id: SockId, spec: Outgoing<'_>) -> io::Result<()> {
    // Dropping `spec` releases its source exactly once.
    validate_open(id)?;

    let slab = packet::grab();
    let packet = match spec.source {
        Source::Copy(data) if data.len() <= PACKET_BUF => Packet::inline(slab, data),
        Source::Copy(data) => Packet::new(
            slab,
            PacketSource::Owned {
                bytes: data.to_vec().into_boxed_slice(),
                offset: 0,
            },
        ),
        Source::Owned(bytes, offset) => {
            if offset > bytes.len() {
                return Err(io::Error::from_raw_os_error(libc::ERANGE));
            }
            Packet::new(slab, PacketSource::Owned { bytes, offset })
        }
        Source::File(file, offset, len) => Packet::new(slab, PacketSource::File { file, offset, len }),
        Source::SharedFile(file, offset, len) => {
            Packet::new(slab, PacketSource::SharedFile { file, offset, len })
        }
    };

    {
        let slot = validate_open(id)?;
        let mut inner = slot.inner.lock().unwrap();
        if spec.urgent {
            let at = if inner.sent > 0 && !inner.queue.is_empty() {
                1
            } else {
                0
            };
            inner.queue.insert(at, packet);
        } else {
            inner.queue.push_back(packet);
        }
    }
    (upper().touch)(id);
    defer::defer(flush_task, id.raw() as usize, 0);
    Ok(())
}

/// Pushes queued packets into the descriptor (through the hooks) until the
/// queue empties or the kernel pushes back. Hard errors, and a drained
/// queue on a connection marked for closing, force-close.
pub fn flush(id: SockId) -> io::Result<()> {
    let slot = validate_open(id)?;
    let mut made_progress = false;
    let mut fatal = false;
    {
        let mut inner = slot.inner.lock().unwrap();
        let SlotInner {
            close_pending,
            sent,
            queue,
            hooks,
            ..
        } = &mut *inner;

        // Drain anything buffered inside the transport hook first; a busy
        // transport defers the packet queue to the next writable event.
        let mut blocked = false;
        if let Some(h) = hooks.as_ref() {
            loop {
                match h.flush(id) {
                    Ok(0) => break,
                    Ok(_) => made_progress = true,
                    Err(err) if err.raw_os_error() == Some(libc::EINTR) => continue,
                    Err(err)
                        if is_transient(err.raw_os_error())
                            || err.raw_os_error() == Some(libc::ENOSPC)
                            || err.kind() == io::ErrorKind::WouldBlock =>
                    {
                        blocked = true;
                        break;
                    }
                    Err(_) => {
                        fatal = true;
                        break;
                    }
                }
            }
        }

        while !fatal && !blocked {
            let head = match queue.front_mut() {
                Some(head) => head,
                None => break,
            };
            match head.write_chunk(id, hooks.as_ref(), sent) {
                Ok(n) => {
                    if head.is_complete(*sent) {
                        queue.pop_front();
                        *sent = 0;
                        made_progress = true;
                    } else if n == 0 {
                        break;
                    }
                    if n > 0 {
                        made_progress = true;
                    }
                }
                Err(err) if err.raw_os_error() == Some(libc::EINTR) => continue,
                Err(err)
                    if is_transient(err.raw_os_error())
                        || err.raw_os_error() == Some(libc::ENOSPC)
                        || err.kind() == io::ErrorKind::WouldBlock =>
                {
                    break
                }
                Err(_) => fatal = true,
            }
        }

        if *close_pending && queue.is_empty() {
            fatal = true;
        }
    }
    if made_progress {
        (upper().touch)(id);
    }
    if fatal {
        force_close(id);
        return Err(io::Error::from(io::ErrorKind::ConnectionAborted));
    }
    Ok(())
}

/// Busy-flushes until the queue is empty or the connection dies.
pub fn flush_strong(id: SockId) {
    while is_valid(id) && has_pending(id) {
        if flush(id).is_err() {
            return;
        }
        std::thread::yield_now();
    }
    let _ = flush(id);
}

/// Runs one flush pass over every open connection with queued data.
pub fn flush_all() {
    let registry = registry();
    for fd in 0..registry.slots.len() {
        let slot = &registry.slots[fd];
        if !slot.open.load(Ordering::Acquire) {
            continue;
        }
        let has_packets = !slot.inner.lock().unwrap().queue.is_empty();
        if has_packets {
            let _ = flush(SockId::compose(
                fd as RawFd,
                slot.generation.load(Ordering::Acquire),
            ));
        }
    }
}

/// Marks the connection for closing once the outbound queue drains, then
/// kicks a flush.
pub fn close(id: SockId) {
    let slot = match validate_open(id) {
        Ok(slot) => slot,
        Err(_) => return,
    };
    slot.inner.lock().unwrap().close_pending = true;
    let _ = flush(id);
}

/// Closes the connection immediately, discarding queued data. The slot's
/// generation is bumped so the handle (and any copies of it) go stale.
pub fn force_close(id: SockId) {
    if validate(id).is_err() {
        return;
    }
    unsafe {
        libc::shutdown(id.fd(), libc::SHUT_RDWR);
        libc::close(id.fd());
    }
    clear_slot(id.fd(), false);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_encoding() {
        let id = SockId::compose(42, 7);
        assert_eq!(id.fd(), 42);
        assert_eq!(id.generation(), 7);
        assert_eq!(SockId::from_raw(id.raw()), id);
    }

    #[test]
    fn stale_generation_is_rejected() {
        let mut pair = [0; 2];
        assert_eq!(
            unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, pair.as_mut_ptr()) },
            0
        );
        unsafe { libc::close(pair[1]) };
        let id = open(pair[0]).unwrap();
        assert!(is_valid(id));
        force_close(id);
        assert!(!is_valid(id));
        assert_eq!(
            read(id, &mut [0u8; 8]).unwrap_err().raw_os_error(),
            Some(libc::EBADF)
        );
        assert_eq!(
            write(id, b"x").unwrap_err().raw_os_error(),
            Some(libc::EBADF)
        );
    }
}
