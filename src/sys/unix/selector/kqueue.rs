use std::io;
use std::os::unix::io::RawFd;
use std::ptr;

// Type of the `filter` field in the `kevent` structure.
#[cfg(any(target_os = "freebsd", target_os = "openbsd", target_os = "dragonfly"))]
type Filter = libc::c_short;
#[cfg(any(target_os = "macos", target_os = "ios"))]
type Filter = i16;
#[cfg(target_os = "netbsd")]
type Filter = u32;

// Type of the `udata` field in the `kevent` structure.
#[cfg(not(target_os = "netbsd"))]
type UData = *mut libc::c_void;
#[cfg(target_os = "netbsd")]
type UData = libc::intptr_t;

macro_rules! kevent {
    ($id: expr, $filter: expr, $flags: expr, $data: expr, $udata: expr) => {
        libc::kevent {
            ident: $id as libc::uintptr_t,
            filter: $filter as Filter,
            flags: $flags,
            fflags: 0,
            data: $data,
            udata: $udata as UData,
        }
    };
}

#[derive(Debug)]
pub(crate) struct Selector {
    kq: RawFd,
}

impl Selector {
    pub(crate) fn new() -> io::Result<Selector> {
        let kq = syscall!(kqueue())?;
        syscall!(fcntl(kq, libc::F_SETFD, libc::FD_CLOEXEC))?;
        Ok(Selector { kq })
    }

    /// Waits for events for up to `timeout_ms` milliseconds. A zero timeout
    /// polls, a negative timeout blocks indefinitely.
    pub(crate) fn select(&self, events: &mut Events, timeout_ms: i32) -> io::Result<usize> {
        let timeout = libc::timespec {
            tv_sec: (timeout_ms / 1000) as libc::time_t,
            tv_nsec: ((timeout_ms % 1000) as libc::c_long) * 1_000_000,
        };
        let timeout = if timeout_ms < 0 {
            ptr::null()
        } else {
            &timeout as *const _
        };

        events.clear();
        syscall!(kevent(
            self.kq,
            ptr::null(),
            0,
            events.as_mut_ptr(),
            events.capacity() as libc::c_int,
            timeout,
        ))
        .map(|n_events| {
            // This is safe because `kevent` ensures that `n_events` are
            // assigned.
            unsafe { events.set_len(n_events as usize) };
            n_events as usize
        })
    }

    /// Monitors `fd` for read/write readiness, edge triggered. `token` is
    /// returned verbatim with every event.
    pub(crate) fn add(&self, fd: RawFd, token: u64) -> io::Result<()> {
        let flags = libc::EV_ADD | libc::EV_CLEAR;
        let changes: [libc::kevent; 2] = [
            kevent!(fd, libc::EVFILT_READ, flags, 0, token),
            kevent!(fd, libc::EVFILT_WRITE, flags, 0, token),
        ];
        syscall!(kevent(
            self.kq,
            changes.as_ptr(),
            changes.len() as libc::c_int,
            ptr::null_mut(),
            0,
            ptr::null(),
        ))
        .map(|_| ())
    }

    pub(crate) fn remove(&self, fd: RawFd) -> io::Result<()> {
        let flags = libc::EV_DELETE;
        let changes: [libc::kevent; 2] = [
            kevent!(fd, libc::EVFILT_READ, flags, 0, 0),
            kevent!(fd, libc::EVFILT_WRITE, flags, 0, 0),
        ];
        // ENOENT means the filter wasn't registered, which is fine here.
        match syscall!(kevent(
            self.kq,
            changes.as_ptr(),
            changes.len() as libc::c_int,
            ptr::null_mut(),
            0,
            ptr::null(),
        )) {
            Ok(_) => Ok(()),
            Err(ref err) if err.raw_os_error() == Some(libc::ENOENT) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Arms a periodic timer identified by `fd`.
    pub(crate) fn add_timer(&self, fd: RawFd, token: u64, milliseconds: u64) -> io::Result<()> {
        let change = kevent!(
            fd,
            libc::EVFILT_TIMER,
            libc::EV_ADD | libc::EV_ENABLE,
            milliseconds as _,
            token
        );
        syscall!(kevent(self.kq, &change, 1, ptr::null_mut(), 0, ptr::null())).map(|_| ())
    }
}

/// Opens a placeholder descriptor used as the kqueue timer identity.
pub(crate) fn open_timer() -> io::Result<RawFd> {
    syscall!(open(b"/dev/null\0".as_ptr() as *const _, libc::O_RDONLY))
}

/// Periodic kqueue timers re-arm themselves.
pub(crate) fn reset_timer(_fd: RawFd) -> io::Result<()> {
    Ok(())
}

impl Drop for Selector {
    fn drop(&mut self) {
        if let Err(err) = syscall!(close(self.kq)) {
            log::error!("error closing kqueue: {}", err);
        }
    }
}

pub(crate) type Event = libc::kevent;
pub(crate) type Events = Vec<Event>;

pub(crate) mod event {
    use super::*;

    pub(crate) fn token(event: &Event) -> u64 {
        event.udata as u64
    }

    pub(crate) fn is_readable(event: &Event) -> bool {
        event.filter == libc::EVFILT_READ as Filter
            || event.filter == libc::EVFILT_TIMER as Filter
    }

    pub(crate) fn is_writable(event: &Event) -> bool {
        event.filter == libc::EVFILT_WRITE as Filter
    }

    pub(crate) fn is_error(event: &Event) -> bool {
        (event.flags & libc::EV_ERROR) != 0
    }
}
