use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::reactor::{self, Event, Protocol};
use crate::socket::{self, RwHooks, SockId};

type OnConnect = Box<dyn FnOnce(SockId) -> Option<Arc<dyn Protocol>> + Send>;
type OnFail = Box<dyn FnOnce(SockId) + Send>;
type HookFactory = Box<dyn Fn(SockId) -> Option<Arc<dyn RwHooks>> + Send + Sync>;

/// Options for [`connect`].
pub struct ConnectOpts {
    address: String,
    port: Option<String>,
    on_fail: Option<OnFail>,
    hooks: Option<HookFactory>,
}

impl std::fmt::Debug for ConnectOpts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectOpts")
            .field("address", &self.address)
            .field("port", &self.port)
            .finish()
    }
}

impl ConnectOpts {
    /// A TCP client connection.
    pub fn tcp(address: &str, port: &str) -> ConnectOpts {
        ConnectOpts {
            address: address.to_owned(),
            port: Some(port.to_owned()),
            on_fail: None,
            hooks: None,
        }
    }

    /// A Unix-domain client connection to `path`.
    pub fn unix(path: &str) -> ConnectOpts {
        ConnectOpts {
            address: path.to_owned(),
            port: None,
            on_fail: None,
            hooks: None,
        }
    }

    /// Called if the connection can't be established.
    pub fn on_fail(mut self, f: impl FnOnce(SockId) + Send + 'static) -> Self {
        self.on_fail = Some(Box::new(f));
        self
    }

    /// Produces transport hooks, installed once the connection opens.
    pub fn hooks(
        mut self,
        f: impl Fn(SockId) -> Option<Arc<dyn RwHooks>> + Send + Sync + 'static,
    ) -> Self {
        self.hooks = Some(Box::new(f));
        self
    }
}

// The stand-in protocol between `connect` and the socket turning writable.
struct Connector {
    opened: AtomicBool,
    on_connect: Mutex<Option<OnConnect>>,
    on_fail: Mutex<Option<OnFail>>,
    hooks: Option<HookFactory>,
}

impl Protocol for Connector {
    // The first writable event means the connection is established.
    fn on_ready(&self, id: SockId) {
        if self.opened.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(factory) = &self.hooks {
            if let Some(hooks) = factory(id) {
                let _ = socket::set_hooks(id, hooks);
            }
        }
        socket::touch(id);
        let on_connect = self.on_connect.lock().unwrap().take();
        match on_connect.and_then(|f| f(id)) {
            Some(protocol) => {
                if reactor::attach(id, Arc::clone(&protocol)).is_ok() {
                    protocol.on_ready(id);
                } else {
                    socket::close(id);
                }
            }
            None => socket::close(id),
        }
    }

    // Data before the user protocol is attached stays queued in the kernel.
    fn on_data(&self, id: SockId) {
        reactor::force_event(id, Event::Data);
    }

    fn on_close(&self, id: SockId) {
        if !self.opened.load(Ordering::Acquire) {
            if let Some(on_fail) = self.on_fail.lock().unwrap().take() {
                on_fail(id);
            }
        }
    }
}

/// Initiates a client connection; `on_connect` is called once it is
/// established and returns the protocol to attach (or `None` to abort).
///
/// Connecting is non-blocking: a handle is returned immediately and the
/// outcome is reported through `on_connect` / `ConnectOpts::on_fail`.
pub fn connect(
    opts: ConnectOpts,
    on_connect: impl FnOnce(SockId) -> Option<Arc<dyn Protocol>> + Send + 'static,
) -> io::Result<SockId> {
    let connector = Arc::new(Connector {
        opened: AtomicBool::new(false),
        on_connect: Mutex::new(Some(Box::new(on_connect))),
        on_fail: Mutex::new(opts.on_fail),
        hooks: opts.hooks,
    });
    let id = match socket::connect(&opts.address, opts.port.as_deref()) {
        Ok(id) => id,
        Err(err) => {
            if let Some(on_fail) = connector.on_fail.lock().unwrap().take() {
                on_fail(SockId::from_raw(u64::MAX));
            }
            return Err(err);
        }
    };
    reactor::attach(id, connector)?;
    Ok(id)
}
