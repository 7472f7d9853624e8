mod selector;

pub(crate) use self::selector::{
    event, open_timer, reset_timer, Event, Events, Selector, EVENTS_CAPACITY,
};

/// Sets a file descriptor to non-blocking mode.
pub(crate) fn set_nonblock(fd: libc::c_int) -> std::io::Result<()> {
    let flags = syscall!(fcntl(fd, libc::F_GETFL, 0)).unwrap_or(0);
    syscall!(fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK)).map(|_| ())
}

/// Sets the close-on-exec flag. Linux sets it in `accept4` directly.
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) fn set_cloexec(fd: libc::c_int) -> std::io::Result<()> {
    syscall!(fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC)).map(|_| ())
}
