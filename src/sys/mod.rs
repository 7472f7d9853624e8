//! OS event notification bindings.
//!
//! One backend per platform: `epoll` on Linux/Android/illumos and `kqueue`
//! on the BSD family and macOS. Both expose the same [`Selector`] shape to
//! the reactor; nothing above this module touches the raw event structures.

pub(crate) mod unix;

pub(crate) use self::unix::{
    event, open_timer, reset_timer, Event, Events, Selector, EVENTS_CAPACITY,
};
