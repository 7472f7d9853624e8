use std::io;
use std::os::unix::io::RawFd;
use std::ptr;

use libc::{EPOLLERR, EPOLLET, EPOLLHUP, EPOLLIN, EPOLLOUT};

#[derive(Debug)]
pub(crate) struct Selector {
    ep: RawFd,
}

impl Selector {
    pub(crate) fn new() -> io::Result<Selector> {
        syscall!(epoll_create1(libc::EPOLL_CLOEXEC)).map(|ep| Selector { ep })
    }

    /// Waits for events for up to `timeout_ms` milliseconds. A zero timeout
    /// polls, a negative timeout blocks indefinitely.
    pub(crate) fn select(&self, events: &mut Events, timeout_ms: i32) -> io::Result<usize> {
        events.clear();
        syscall!(epoll_wait(
            self.ep,
            events.as_mut_ptr(),
            events.capacity() as i32,
            timeout_ms,
        ))
        .map(|n_events| {
            // This is safe because `epoll_wait` ensures that `n_events` are
            // assigned.
            unsafe { events.set_len(n_events as usize) };
            n_events as usize
        })
    }

    /// Monitors `fd` for read/write readiness, edge triggered. `token` is
    /// returned verbatim with every event.
    pub(crate) fn add(&self, fd: RawFd, token: u64) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: (EPOLLIN | EPOLLOUT | EPOLLET) as u32,
            u64: token,
        };
        syscall!(epoll_ctl(self.ep, libc::EPOLL_CTL_ADD, fd, &mut event)).map(|_| ())
    }

    pub(crate) fn remove(&self, fd: RawFd) -> io::Result<()> {
        syscall!(epoll_ctl(self.ep, libc::EPOLL_CTL_DEL, fd, ptr::null_mut())).map(|_| ())
    }

    /// Arms a timer fd to fire every `milliseconds` and monitors it.
    pub(crate) fn add_timer(&self, fd: RawFd, token: u64, milliseconds: u64) -> io::Result<()> {
        let interval = libc::timespec {
            tv_sec: (milliseconds / 1000) as libc::time_t,
            tv_nsec: ((milliseconds % 1000) * 1_000_000) as libc::c_long,
        };
        let spec = libc::itimerspec {
            it_interval: interval,
            it_value: interval,
        };
        syscall!(timerfd_settime(fd, 0, &spec, ptr::null_mut()))?;
        let mut event = libc::epoll_event {
            events: (EPOLLIN | EPOLLET) as u32,
            u64: token,
        };
        syscall!(epoll_ctl(self.ep, libc::EPOLL_CTL_ADD, fd, &mut event)).map(|_| ())
    }
}

/// Opens a timer file descriptor, initially disarmed.
pub(crate) fn open_timer() -> io::Result<RawFd> {
    syscall!(timerfd_create(
        libc::CLOCK_MONOTONIC,
        libc::TFD_NONBLOCK | libc::TFD_CLOEXEC
    ))
}

/// Clears a fired timer so the next interval can be delivered.
pub(crate) fn reset_timer(fd: RawFd) -> io::Result<()> {
    let mut expirations = [0u8; 8];
    syscall!(read(fd, expirations.as_mut_ptr() as *mut libc::c_void, 8)).map(|_| ())
}

impl Drop for Selector {
    fn drop(&mut self) {
        if let Err(err) = syscall!(close(self.ep)) {
            log::error!("error closing epoll: {}", err);
        }
    }
}

pub(crate) type Event = libc::epoll_event;
pub(crate) type Events = Vec<Event>;

pub(crate) mod event {
    use super::*;

    pub(crate) fn token(event: &Event) -> u64 {
        event.u64
    }

    pub(crate) fn is_readable(event: &Event) -> bool {
        (event.events as libc::c_int & EPOLLIN) != 0
    }

    pub(crate) fn is_writable(event: &Event) -> bool {
        (event.events as libc::c_int & EPOLLOUT) != 0
    }

    pub(crate) fn is_error(event: &Event) -> bool {
        (event.events as libc::c_int & (EPOLLERR | EPOLLHUP)) != 0
    }
}
