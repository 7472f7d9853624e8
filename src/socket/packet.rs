use std::fs::File;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex, OnceLock};

use crate::socket::hooks::{raw_write, RwHooks};
use crate::socket::SockId;

/// Size of a pooled packet buffer. Inline writes up to this size are copied
/// straight into the slab; larger copies are promoted to owned memory.
pub(crate) const PACKET_BUF: usize = 16 * 1024;

/// How much file data is read per `pread(2)` round when a hook forces the
/// copy-through path.
const FILE_READ_CHUNK: usize = PACKET_BUF - 64;

/// Upper bound on packets in flight across the whole process. Exhaustion
/// triggers a full flush round before retrying.
const POOL_PACKETS: usize = 256;

type SlabBuf = Box<[u8; PACKET_BUF]>;

struct PoolState {
    free: Vec<SlabBuf>,
    allocated: usize,
}

fn pool() -> &'static Mutex<PoolState> {
    static POOL: OnceLock<Mutex<PoolState>> = OnceLock::new();
    POOL.get_or_init(|| {
        Mutex::new(PoolState {
            free: Vec::new(),
            allocated: 0,
        })
    })
}

/// A pool ticket carrying the slab buffer. Dropping it returns the buffer.
pub(crate) struct Slab {
    buf: Option<SlabBuf>,
}

impl Slab {
    fn buf(&mut self) -> &mut [u8; PACKET_BUF] {
        self.buf.as_mut().unwrap()
    }

    fn buf_ref(&self) -> &[u8; PACKET_BUF] {
        self.buf.as_ref().unwrap()
    }
}

impl Drop for Slab {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            pool().lock().unwrap().free.push(buf);
        }
    }
}

fn try_grab() -> Option<Slab> {
    let mut pool = pool().lock().unwrap();
    if let Some(buf) = pool.free.pop() {
        return Some(Slab { buf: Some(buf) });
    }
    if pool.allocated < POOL_PACKETS {
        pool.allocated += 1;
        return Some(Slab {
            buf: Some(Box::new([0u8; PACKET_BUF])),
        });
    }
    None
}

/// Grabs a packet slot, draining every socket's queue while the pool is
/// exhausted. The caller ends up holding a slot eventually.
pub(crate) fn grab() -> Slab {
    loop {
        if let Some(slab) = try_grab() {
            return slab;
        }
        crate::socket::flush_all();
    }
}

/// Where a packet's bytes come from.
pub(crate) enum PacketSource {
    /// Up to [`PACKET_BUF`] bytes copied into the slab.
    Inline { len: usize },
    /// Caller-owned memory, sent from `offset`. Dropped (and thereby
    /// deallocated) when the packet completes.
    Owned { bytes: Box<[u8]>, offset: usize },
    /// A file region. The descriptor is closed when the packet drops.
    File { file: File, offset: u64, len: u64 },
    /// A shared file region; the descriptor closes with its last reference.
    SharedFile {
        file: Arc<File>,
        offset: u64,
        len: u64,
    },
}

/// One entry in a connection's outbound queue.
pub(crate) struct Packet {
    pub(crate) source: PacketSource,
    slab: Slab,
}

impl Packet {
    pub(crate) fn inline(slab: Slab, data: &[u8]) -> Packet {
        let mut slab = slab;
        slab.buf()[..data.len()].copy_from_slice(data);
        Packet {
            source: PacketSource::Inline { len: data.len() },
            slab,
        }
    }

    pub(crate) fn new(slab: Slab, source: PacketSource) -> Packet {
        Packet { source, slab }
    }

    /// Writes the next chunk through `hooks` (or straight syscalls when
    /// `hooks` is `None`). `sent` is the per-connection progress marker for
    /// the packet at the head of the queue.
    ///
    /// Returns the number of bytes moved this round; completion is reported
    /// by [`Packet::is_complete`].
    pub(crate) fn write_chunk(
        &mut self,
        id: SockId,
        hooks: Option<&Arc<dyn RwHooks>>,
        sent: &mut usize,
    ) -> io::Result<usize> {
        match &mut self.source {
            PacketSource::Inline { len } => {
                let chunk = &self.slab.buf_ref()[*sent..*len];
                let n = write_through(id, hooks, chunk)?;
                *sent += n;
                Ok(n)
            }
            PacketSource::Owned { bytes, offset } => {
                let chunk = &bytes[*offset + *sent..];
                let n = write_through(id, hooks, chunk)?;
                *sent += n;
                Ok(n)
            }
            PacketSource::File { file, offset, len } => {
                let fd = file.as_raw_fd();
                write_file_chunk(id, hooks, self.slab.buf(), fd, offset, len)
            }
            PacketSource::SharedFile { file, offset, len } => {
                let fd = file.as_raw_fd();
                write_file_chunk(id, hooks, self.slab.buf(), fd, offset, len)
            }
        }
    }

    pub(crate) fn is_complete(&self, sent: usize) -> bool {
        match &self.source {
            PacketSource::Inline { len } => sent >= *len,
            PacketSource::Owned { bytes, offset } => *offset + sent >= bytes.len(),
            PacketSource::File { len, .. } | PacketSource::SharedFile { len, .. } => *len == 0,
        }
    }
}

fn write_through(id: SockId, hooks: Option<&Arc<dyn RwHooks>>, buf: &[u8]) -> io::Result<usize> {
    match hooks {
        Some(hooks) => hooks.write(id, buf),
        None => raw_write(id, buf),
    }
}

fn write_file_chunk(
    id: SockId,
    hooks: Option<&Arc<dyn RwHooks>>,
    scratch: &mut [u8; PACKET_BUF],
    file_fd: RawFd,
    offset: &mut u64,
    len: &mut u64,
) -> io::Result<usize> {
    if hooks.is_none() {
        return sendfile(id, file_fd, offset, len);
    }
    // Copy-through fallback: a hook owns the wire format, so the file is
    // read into the scratch buffer and pushed through the hook's write.
    let want = (*len).min(FILE_READ_CHUNK as u64) as usize;
    let got = syscall!(pread(
        file_fd,
        scratch.as_mut_ptr() as *mut libc::c_void,
        want,
        *offset as libc::off_t,
    ))? as usize;
    if got == 0 {
        // Source file is shorter than promised; finish the packet.
        *len = 0;
        return Ok(0);
    }
    let n = write_through(id, hooks, &scratch[..got])?;
    *offset += n as u64;
    *len -= n as u64;
    Ok(n)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn sendfile(id: SockId, file_fd: RawFd, offset: &mut u64, len: &mut u64) -> io::Result<usize> {
    let mut off = *offset as libc::off64_t;
    let sent = syscall!(sendfile64(id.fd(), file_fd, &mut off, *len as usize))?;
    *offset = off as u64;
    *len -= sent as u64;
    Ok(sent as usize)
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
fn sendfile(id: SockId, file_fd: RawFd, offset: &mut u64, len: &mut u64) -> io::Result<usize> {
    let mut count = *len as libc::off_t;
    let ret = unsafe {
        libc::sendfile(
            file_fd,
            id.fd(),
            *offset as libc::off_t,
            &mut count,
            std::ptr::null_mut(),
            0,
        )
    };
    // Apple reports partial progress through `count` even on EAGAIN.
    *offset += count as u64;
    *len -= count as u64;
    if ret == -1 && count == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(count as usize)
}

#[cfg(any(
    target_os = "freebsd",
    target_os = "dragonfly",
    target_os = "netbsd",
    target_os = "openbsd"
))]
fn sendfile(id: SockId, file_fd: RawFd, offset: &mut u64, len: &mut u64) -> io::Result<usize> {
    // No portable sendfile across the rest of the BSDs in scope; use the
    // copy-through path with direct writes.
    let mut scratch = [0u8; FILE_READ_CHUNK];
    let want = (*len).min(FILE_READ_CHUNK as u64) as usize;
    let got = syscall!(pread(
        file_fd,
        scratch.as_mut_ptr() as *mut libc::c_void,
        want,
        *offset as libc::off_t,
    ))? as usize;
    if got == 0 {
        *len = 0;
        return Ok(0);
    }
    let n = raw_write(id, &scratch[..got])?;
    *offset += n as u64;
    *len -= n as u64;
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_is_bounded() {
        let mut held = Vec::new();
        for _ in 0..POOL_PACKETS {
            match try_grab() {
                Some(slab) => held.push(slab),
                None => break,
            }
        }
        // The pool may have been partially consumed by other tests, but it
        // must refuse to hand out more than its capacity.
        assert!(held.len() <= POOL_PACKETS);
        assert!(try_grab().is_none() || held.len() < POOL_PACKETS);
        drop(held);
        assert!(try_grab().is_some());
    }
}
