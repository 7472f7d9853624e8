use std::io;

use crate::socket::SockId;

/// Read/write hooks intercepting a connection at the transport boundary.
///
/// Installing hooks (see [`set_hooks`]) is how TLS layers, compression
/// layers and test shims slot in underneath a protocol without the protocol
/// knowing. The default behavior, when no hooks are installed, is a direct
/// `read(2)`/`write(2)` on the connection's descriptor.
///
/// Hooks MUST NOT call back into the socket layer for the same connection;
/// the per-connection lock is held while they run.
///
/// [`set_hooks`]: crate::socket::set_hooks
pub trait RwHooks: Send + Sync {
    /// Reads up to `buf.len()` bytes of *decoded* data.
    fn read(&self, id: SockId, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes `buf`, encoding as required. Returns the number of plaintext
    /// bytes consumed.
    fn write(&self, id: SockId, buf: &[u8]) -> io::Result<usize>;

    /// Flushes any data buffered inside the hook itself. Returns the number
    /// of bytes still buffered (0 when fully drained).
    fn flush(&self, id: SockId) -> io::Result<usize> {
        let _ = id;
        Ok(0)
    }

    /// Called exactly once when the connection's slot is cleared.
    fn on_close(&self, id: SockId) {
        let _ = id;
    }
}

pub(crate) fn raw_read(id: SockId, buf: &mut [u8]) -> io::Result<usize> {
    syscall!(read(
        id.fd(),
        buf.as_mut_ptr() as *mut libc::c_void,
        buf.len()
    ))
    .map(|n| n as usize)
}

pub(crate) fn raw_write(id: SockId, buf: &[u8]) -> io::Result<usize> {
    syscall!(write(
        id.fd(),
        buf.as_ptr() as *const libc::c_void,
        buf.len()
    ))
    .map(|n| n as usize)
}
