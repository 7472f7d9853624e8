use std::io;
use std::sync::Arc;

use log::{error, info};

use crate::defer;
use crate::reactor::{self, attach_kind, ConnKind, Event, Lane, Protocol};
use crate::socket::{self, RwHooks, SockId};

type OnOpen = Box<dyn Fn(SockId) -> Option<Arc<dyn Protocol>> + Send + Sync>;
type ConnHook = Box<dyn Fn(SockId) + Send + Sync>;
type HookFactory = Box<dyn Fn(SockId) -> Option<Arc<dyn RwHooks>> + Send + Sync>;

/// Options for [`listen`].
pub struct ListenOpts {
    address: Option<String>,
    port: Option<String>,
    on_start: Option<ConnHook>,
    on_finish: Option<ConnHook>,
    hooks: Option<HookFactory>,
}

impl std::fmt::Debug for ListenOpts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenOpts")
            .field("address", &self.address)
            .field("port", &self.port)
            .finish()
    }
}

impl ListenOpts {
    /// A TCP listener. `address == None` binds every interface.
    pub fn tcp(address: Option<&str>, port: &str) -> ListenOpts {
        ListenOpts {
            address: address.map(str::to_owned),
            port: Some(port.to_owned()),
            on_start: None,
            on_finish: None,
            hooks: None,
        }
    }

    /// A Unix-domain listener bound to `path`.
    pub fn unix(path: &str) -> ListenOpts {
        ListenOpts {
            address: Some(path.to_owned()),
            port: None,
            on_start: None,
            on_finish: None,
            hooks: None,
        }
    }

    /// Called once the reactor starts accepting on the listener.
    pub fn on_start(mut self, f: impl Fn(SockId) + Send + Sync + 'static) -> Self {
        self.on_start = Some(Box::new(f));
        self
    }

    /// Called when the listener shuts down.
    pub fn on_finish(mut self, f: impl Fn(SockId) + Send + Sync + 'static) -> Self {
        self.on_finish = Some(Box::new(f));
        self
    }

    /// Produces transport hooks for each accepted connection, installed
    /// before the connection's protocol is asked for.
    pub fn hooks(
        mut self,
        f: impl Fn(SockId) -> Option<Arc<dyn RwHooks>> + Send + Sync + 'static,
    ) -> Self {
        self.hooks = Some(Box::new(f));
        self
    }
}

struct ListenerShared {
    on_open: OnOpen,
    on_start: Option<ConnHook>,
    on_finish: Option<ConnHook>,
    hooks: Option<HookFactory>,
    label: String,
}

struct Listener {
    shared: Arc<ListenerShared>,
}

impl Protocol for Listener {
    fn on_data(&self, id: SockId) {
        match socket::accept(id) {
            Ok(client) => {
                let task = Box::new(OpenTask {
                    client,
                    listener: id,
                    shared: Arc::clone(&self.shared),
                });
                defer::defer(deferred_on_open, Box::into_raw(task) as usize, 0);
                // Drain the backlog one connection per task so accepting
                // interleaves with serving.
                reactor::force_event(id, Event::Data);
            }
            Err(err)
                if matches!(
                    err.raw_os_error(),
                    Some(libc::ECONNABORTED) | Some(libc::ECONNRESET)
                ) =>
            {
                reactor::force_event(id, Event::Data);
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => error!("listener accept error: {}", err),
        }
    }

    fn ping(&self, id: SockId) {
        // Listeners don't time out.
        socket::touch(id);
    }

    fn on_start(&self, id: SockId) {
        if let Some(on_start) = &self.shared.on_start {
            on_start(id);
        }
    }

    fn on_close(&self, id: SockId) {
        if let Some(on_finish) = &self.shared.on_finish {
            on_finish(id);
        }
        info!("stopped listening on {}", self.shared.label);
    }
}

struct OpenTask {
    client: SockId,
    listener: SockId,
    shared: Arc<ListenerShared>,
}

// Runs under the listener's Write lane so `on_open` calls are serialized.
fn deferred_on_open(task_raw: usize, _unused: usize) {
    let task = unsafe { Box::from_raw(task_raw as *mut OpenTask) };
    let guard = match reactor::try_lock(task.listener, Lane::Write) {
        Ok(guard) => guard,
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
            if socket::is_valid(task.client) && socket::is_valid(task.listener) {
                defer::defer(deferred_on_open, Box::into_raw(task) as usize, 0);
            } else {
                socket::close(task.client);
            }
            return;
        }
        Err(_) => {
            socket::close(task.client);
            return;
        }
    };
    if let Some(factory) = &task.shared.hooks {
        if let Some(hooks) = factory(task.client) {
            let _ = socket::set_hooks(task.client, hooks);
        }
    }
    let protocol = (task.shared.on_open)(task.client);
    drop(guard);
    match protocol {
        Some(protocol) => {
            let _ = reactor::attach(task.client, protocol);
        }
        None => socket::close(task.client),
    }
}

/// Opens a listening socket and attaches an accept protocol to it. Each
/// accepted connection is handed to `on_open`, which returns the protocol
/// to attach (or `None` to refuse the connection).
pub fn listen(
    opts: ListenOpts,
    on_open: impl Fn(SockId) -> Option<Arc<dyn Protocol>> + Send + Sync + 'static,
) -> io::Result<SockId> {
    let label = match (&opts.address, &opts.port) {
        (_, Some(port)) => format!("port {}", port),
        (Some(path), None) => path.clone(),
        (None, None) => return Err(io::Error::from(io::ErrorKind::InvalidInput)),
    };
    let id = socket::listen(opts.address.as_deref(), opts.port.as_deref())?;
    let listener = Listener {
        shared: Arc::new(ListenerShared {
            on_open: Box::new(on_open),
            on_start: opts.on_start,
            on_finish: opts.on_finish,
            hooks: opts.hooks,
            label: label.clone(),
        }),
    };
    attach_kind(id, Arc::new(listener), ConnKind::Listener)?;
    info!("listening on {}", label);
    Ok(id)
}
