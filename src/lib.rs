//! Moor is an evented, protocol-agnostic server framework for TCP and
//! Unix-domain sockets.
//!
//! The crate is organised around a small set of cooperating layers:
//!
//! * [`defer`] — a deferred-task queue with an optional thread pool and a
//!   fork-based worker-process supervisor. Everything above it yields by
//!   scheduling small `(fn, arg, arg)` tasks instead of blocking.
//! * [`socket`] — a file-descriptor registry handing out generation-counted
//!   [`SockId`] handles, with a user-space outbound packet queue and
//!   pluggable read/write hooks at the transport boundary.
//! * [`reactor`] — attaches [`Protocol`] implementations to sockets, drives
//!   the event loop and delivers `on_data`/`on_ready`/`ping` callbacks under
//!   per-connection lane locks.
//! * [`cluster`] — a length-prefixed message bus between worker processes,
//!   carried over a Unix-domain socket owned by the root process.
//! * [`pubsub`] — channel and pattern subscriptions with pluggable delivery
//!   engines, built on top of the cluster bus.
//! * [`http`] — an HTTP/1.1 parser and response writer.
//!
//! # Getting started
//!
//! ```no_run
//! use std::sync::Arc;
//! use moor::{socket, Protocol, SockId};
//!
//! struct Echo;
//!
//! impl Protocol for Echo {
//!     fn on_data(&self, id: SockId) {
//!         let mut buf = [0u8; 1024];
//!         while let Ok(n) = socket::read(id, &mut buf) {
//!             if n == 0 {
//!                 break;
//!             }
//!             let _ = socket::write(id, &buf[..n]);
//!         }
//!     }
//! }
//!
//! moor::listen(moor::ListenOpts::tcp(None, "3000"), |_id| {
//!     Some(Arc::new(Echo) as Arc<dyn moor::Protocol>)
//! })?;
//! moor::run(moor::RunOpts::default());
//! # Ok::<(), std::io::Error>(())
//! ```
#![cfg(unix)]
#![deny(missing_debug_implementations)]

#[macro_use]
mod macros;

pub mod cluster;
pub mod defer;
pub mod http;
pub mod pubsub;
pub mod reactor;
pub mod socket;
pub(crate) mod sys;

pub use crate::reactor::{
    connect, listen, run, stop, Lane, ListenOpts, Protocol, RunOpts,
};
pub use crate::socket::SockId;

/// Failures that could corrupt shared state take the whole process group
/// down; the system is designed to be supervised by the OS.
pub(crate) fn fatal(err: std::io::Error) -> ! {
    log::error!("fatal: {}", err);
    unsafe {
        libc::kill(0, libc::SIGINT);
    }
    std::process::exit(err.raw_os_error().unwrap_or(1));
}
