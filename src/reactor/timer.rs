use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::reactor::{self, attach_kind, ConnKind, Protocol};
use crate::socket::{self, SockId};
use crate::sys;

struct Timer {
    repetitions: AtomicUsize,
    task: Mutex<Box<dyn FnMut() + Send>>,
    on_finish: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Protocol for Timer {
    fn on_data(&self, id: SockId) {
        (self.task.lock().unwrap())();
        let _ = sys::reset_timer(id.fd());
        let remaining = self.repetitions.load(Ordering::Acquire);
        if remaining == 0 {
            // 0 repeats forever.
            return;
        }
        if self.repetitions.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _ = reactor::with_selector(|selector| selector.remove(id.fd()));
            socket::force_close(id);
        }
    }

    fn ping(&self, id: SockId) {
        socket::touch(id);
    }

    fn on_close(&self, _id: SockId) {
        if let Some(on_finish) = self.on_finish.lock().unwrap().take() {
            on_finish();
        }
    }
}

/// Runs `task` every `milliseconds`, `repetitions` times (0 = forever), at
/// the cost of one file descriptor.
///
/// `on_finish` always runs when the timer winds down — including on setup
/// errors, so resource cleanup can live there.
pub fn run_every(
    milliseconds: u64,
    repetitions: usize,
    task: impl FnMut() + Send + 'static,
    on_finish: Option<Box<dyn FnOnce() + Send>>,
) -> io::Result<()> {
    let mut on_finish = on_finish;
    let result = (|| {
        let fd = sys::open_timer()?;
        let id = match socket::open(fd) {
            Ok(id) => id,
            Err(err) => {
                let _ = syscall!(close(fd));
                return Err(err);
            }
        };
        let timer = Timer {
            repetitions: AtomicUsize::new(repetitions),
            task: Mutex::new(Box::new(task)),
            on_finish: Mutex::new(on_finish.take()),
        };
        attach_kind(id, Arc::new(timer), ConnKind::Timer { milliseconds })
    })();
    if result.is_err() {
        if let Some(on_finish) = on_finish.take() {
            on_finish();
        }
    }
    result
}
