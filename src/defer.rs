//! Deferred task queue, worker thread pool and fork supervisor.
//!
//! A task is a plain `(fn, arg, arg)` triple. Arguments are machine words so
//! a queue block is a flat `Copy` array; anything larger travels behind a
//! raw pointer owned by the scheduling side. Tasks run FIFO, and a running
//! task may enqueue more tasks — [`perform_all`] keeps going until the queue
//! is empty.
//!
//! The queue is process global. Worker processes forked by
//! [`perform_in_fork`] each inherit a copy of the queue as it was at fork
//! time and drain it independently.

use std::collections::VecDeque;
use std::io;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

use log::error;

/// A deferred function. Interpretation of the two arguments is up to the
/// scheduling site.
pub type TaskFn = fn(usize, usize);

/// Worker threads sleep `threads × DEFER_THROTTLE` microseconds between
/// queue sweeps, capped at [`DEFER_THROTTLE_LIMIT`].
const DEFER_THROTTLE: u64 = 524_287;
const DEFER_THROTTLE_LIMIT: u64 = 1_572_864;

/// Tasks per queue block. Close to a page of memory on 64 bit machines.
const BLOCK_TASKS: usize = 168;

#[derive(Clone, Copy)]
struct Task {
    func: TaskFn,
    arg1: usize,
    arg2: usize,
}

fn noop(_: usize, _: usize) {}

const EMPTY_TASK: Task = Task {
    func: noop,
    arg1: 0,
    arg2: 0,
};

/// A fixed-capacity ring of tasks. `wrapped` marks a write index that
/// cycled past the end and is now chasing the read index.
struct Block {
    tasks: [Task; BLOCK_TASKS],
    write: usize,
    read: usize,
    wrapped: bool,
}

impl Block {
    fn new() -> Box<Block> {
        Box::new(Block {
            tasks: [EMPTY_TASK; BLOCK_TASKS],
            write: 0,
            read: 0,
            wrapped: false,
        })
    }

    fn reset(&mut self) {
        self.write = 0;
        self.read = 0;
        self.wrapped = false;
    }

    fn is_empty(&self) -> bool {
        self.read == self.write && !self.wrapped
    }

    fn is_full(&self) -> bool {
        self.wrapped && self.write == self.read
    }

    fn push(&mut self, task: Task) {
        self.tasks[self.write] = task;
        self.write += 1;
        if self.write == BLOCK_TASKS {
            self.write = 0;
            self.wrapped = true;
        }
    }

    fn pop(&mut self) -> Task {
        let task = self.tasks[self.read];
        self.read += 1;
        if self.read == BLOCK_TASKS {
            self.read = 0;
            self.wrapped = false;
        }
        task
    }
}

/// Queue state: the front block is popped from, the back block is pushed
/// to. One drained block is retained in `spare` and reused in preference to
/// allocating.
struct Queue {
    blocks: VecDeque<Box<Block>>,
    spare: Option<Box<Block>>,
}

fn queue() -> &'static Mutex<Queue> {
    static QUEUE: OnceLock<Mutex<Queue>> = OnceLock::new();
    QUEUE.get_or_init(|| {
        let mut blocks = VecDeque::with_capacity(4);
        blocks.push_back(Block::new());
        Mutex::new(Queue {
            blocks,
            spare: None,
        })
    })
}

fn push_task(task: Task) {
    let mut q = queue().lock().unwrap();
    if q.blocks.back().unwrap().is_full() {
        let block = q.spare.take().unwrap_or_else(Block::new);
        q.blocks.push_back(block);
    }
    q.blocks.back_mut().unwrap().push(task);
}

fn pop_task() -> Option<Task> {
    let mut q = queue().lock().unwrap();
    if q.blocks.front().unwrap().is_empty() {
        return None;
    }
    let task = q.blocks.front_mut().unwrap().pop();
    if q.blocks.front().unwrap().is_empty() {
        if q.blocks.len() > 1 {
            let mut drained = q.blocks.pop_front().unwrap();
            if q.spare.is_none() {
                drained.reset();
                q.spare = Some(drained);
            }
        } else {
            q.blocks.front_mut().unwrap().reset();
        }
    }
    Some(task)
}

/// Defers the execution of `func(arg1, arg2)` to a later queue sweep.
pub fn defer(func: TaskFn, arg1: usize, arg2: usize) {
    push_task(Task { func, arg1, arg2 });
}

/// Performs all deferred tasks, in order, until the queue is empty. Tasks
/// enqueued while performing are executed before this returns.
pub fn perform_all() {
    while let Some(task) = pop_task() {
        (task.func)(task.arg1, task.arg2);
    }
}

/// Returns `true` if there are tasks waiting. The answer may be stale by
/// the time it is observed.
pub fn has_queue() -> bool {
    let q = queue().lock().unwrap();
    !q.blocks.front().unwrap().is_empty()
}

/// Drops every pending task without executing it.
pub fn clear_queue() {
    let mut q = queue().lock().unwrap();
    q.blocks.clear();
    q.blocks.push_back(Block::new());
    q.spare = None;
}

/* *****************************************************************************
 * Thread pool
 **************************************************************************** */

/// Strategy function used to start pool threads, an injection seam for
/// embedders that need custom stacks or instrumentation.
pub type ThreadSpawner =
    fn(Box<dyn FnOnce() + Send>) -> io::Result<thread::JoinHandle<()>>;

fn spawn_thread(f: Box<dyn FnOnce() + Send>) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new().name("moor-worker".into()).spawn(f)
}

struct PoolShared {
    flag: AtomicBool,
    threads: u32,
    forked: bool,
}

impl PoolShared {
    fn throttle(&self) -> Duration {
        let micros = (self.threads as u64 * DEFER_THROTTLE).min(DEFER_THROTTLE_LIMIT);
        Duration::from_micros(micros.max(DEFER_THROTTLE))
    }

    fn should_run(&self) -> bool {
        self.flag.load(Ordering::Acquire) && !(self.forked && FORK_STOP.load(Ordering::Relaxed))
    }
}

/// A pool of worker threads performing deferred tasks.
#[derive(Debug)]
pub struct Pool {
    shared: Arc<PoolShared>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl std::fmt::Debug for PoolShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolShared")
            .field("threads", &self.threads)
            .field("active", &self.flag.load(Ordering::Relaxed))
            .finish()
    }
}

fn worker_cycle(shared: Arc<PoolShared>) {
    let throttle = shared.throttle();
    perform_all();
    // The throttle nap replaces a condition variable; the queue is polled a
    // couple of times a second while idle and continuously while busy.
    loop {
        thread::sleep(throttle);
        perform_all();
        if !shared.should_run() {
            break;
        }
    }
}

impl Pool {
    /// Starts `threads` worker threads performing deferred tasks in the
    /// background.
    pub fn start(threads: u32) -> io::Result<Pool> {
        Pool::start_with(threads, spawn_thread, false)
    }

    /// As [`Pool::start`], with a custom thread-spawn strategy.
    pub fn start_with_spawner(threads: u32, spawner: ThreadSpawner) -> io::Result<Pool> {
        Pool::start_with(threads, spawner, false)
    }

    fn start_with(threads: u32, spawner: ThreadSpawner, forked: bool) -> io::Result<Pool> {
        if threads == 0 {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }
        let shared = Arc::new(PoolShared {
            flag: AtomicBool::new(true),
            threads,
            forked,
        });
        let mut handles = Vec::with_capacity(threads as usize);
        for _ in 0..threads {
            let shared_clone = Arc::clone(&shared);
            match spawner(Box::new(move || worker_cycle(shared_clone))) {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    let pool = Pool { shared, handles };
                    pool.stop();
                    return Err(err);
                }
            }
        }
        Ok(Pool { shared, handles })
    }

    /// Signals the pool to stop. Returns immediately.
    pub fn stop(&self) {
        self.shared.flag.store(false, Ordering::Release);
    }

    /// Returns `true` while the pool hasn't been signaled to finish up.
    pub fn is_active(&self) -> bool {
        self.shared.flag.load(Ordering::Acquire)
    }

    /// Waits for the pool, joining threads and finishing all tasks.
    pub fn wait(mut self) {
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

/* *****************************************************************************
 * Worker process supervisor
 **************************************************************************** */

/// Strategy function wrapping `fork(2)`, an injection seam for embedders
/// that need pre/post fork hooks.
pub type ForkStrategy = fn() -> io::Result<libc::pid_t>;

fn fork_child() -> io::Result<libc::pid_t> {
    syscall!(fork())
}

/// Which process this is, as reported by [`perform_in_fork`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkRole {
    /// The supervising (root) process. Index 0.
    Root,
    /// A forked worker, carrying its 1-based index.
    Worker(u32),
}

static FORK_ACTIVE: AtomicBool = AtomicBool::new(false);
static FORK_STOP: AtomicBool = AtomicBool::new(false);
static FORK_PID: AtomicU32 = AtomicU32::new(0);

/// Returns `true` while the forked pool hasn't been signaled to finish up.
pub fn fork_is_active() -> bool {
    FORK_ACTIVE.load(Ordering::Acquire) && !FORK_STOP.load(Ordering::Relaxed)
}

/// The worker index of the current process. 0 is the root.
pub fn fork_pid() -> u32 {
    FORK_PID.load(Ordering::Relaxed)
}

/// Signals the current process's forked pool to wind down. Equivalent to
/// receiving SIGINT.
pub fn request_stop() {
    FORK_STOP.store(true, Ordering::Relaxed);
}

extern "C" fn stop_handler(sig: libc::c_int) {
    if sig == libc::SIGINT || sig == libc::SIGTERM {
        FORK_STOP.store(true, Ordering::Relaxed);
    }
}

// Reaps zombies without blocking. Keeps errno intact for the interrupted
// code path.
extern "C" fn reap_handler(_sig: libc::c_int) {
    let saved = io::Error::last_os_error().raw_os_error();
    unsafe {
        while libc::waitpid(-1, ptr::null_mut(), libc::WNOHANG) > 0 {}
        if let Some(errno) = saved {
            set_errno(errno);
        }
    }
}

unsafe fn set_errno(errno: libc::c_int) {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        *libc::__errno_location() = errno;
    }
    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "dragonfly"
    ))]
    {
        *libc::__error() = errno;
    }
    #[cfg(any(target_os = "netbsd", target_os = "openbsd"))]
    {
        *libc::__errno() = errno;
    }
}

fn install_handler(sig: libc::c_int, handler: usize) -> io::Result<libc::sigaction> {
    unsafe {
        let mut act: libc::sigaction = mem::zeroed();
        let mut old: libc::sigaction = mem::zeroed();
        act.sa_sigaction = handler;
        act.sa_flags = libc::SA_RESTART | libc::SA_NOCLDSTOP;
        libc::sigemptyset(&mut act.sa_mask);
        if libc::sigaction(sig, &act, &mut old) == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(old)
    }
}

fn restore_handler(sig: libc::c_int, old: &libc::sigaction) {
    unsafe {
        libc::sigaction(sig, old, ptr::null_mut());
    }
}

/// Forks `processes − 1` child processes, starts a thread pool in every
/// process and waits for all tasks to finish. Tasks queued before the fork
/// run in all processes.
///
/// SIGINT/SIGTERM stop the pools, SIGCHLD is reaped non-blockingly and
/// SIGPIPE is ignored for the duration. On return the root has already
/// signaled each child with SIGINT and waited for it.
pub fn perform_in_fork(processes: u32, threads: u32) -> io::Result<ForkRole> {
    perform_in_fork_with(processes, threads, fork_child)
}

pub(crate) fn perform_in_fork_with(
    processes: u32,
    threads: u32,
    fork: ForkStrategy,
) -> io::Result<ForkRole> {
    if FORK_ACTIVE.load(Ordering::Acquire) {
        return Err(io::Error::from(io::ErrorKind::AlreadyExists));
    }
    FORK_STOP.store(false, Ordering::Relaxed);

    let old_int = install_handler(libc::SIGINT, stop_handler as usize)?;
    let old_term = install_handler(libc::SIGTERM, stop_handler as usize)?;
    let old_pipe = install_handler(libc::SIGPIPE, libc::SIG_IGN)?;
    let old_chld = install_handler(libc::SIGCHLD, reap_handler as usize)?;

    let children = processes.max(1) - 1;
    let threads = threads.max(1);
    let mut pids: Vec<libc::pid_t> = Vec::with_capacity(children as usize);
    let mut result = Ok(ForkRole::Root);

    for i in 0..children {
        match fork() {
            Ok(0) => {
                // Child: run a pool to completion, then report the role.
                // Always reaches the `Worker` return — the caller exits the
                // process on it, and a child that fell through here would
                // keep running as a second copy of the host application.
                FORK_PID.store(i + 1, Ordering::Relaxed);
                FORK_ACTIVE.store(true, Ordering::Release);
                match Pool::start_with(threads, spawn_thread, true) {
                    Ok(pool) => pool.wait(),
                    Err(err) => {
                        error!("worker {} couldn't start its thread pool: {}", i + 1, err)
                    }
                }
                FORK_ACTIVE.store(false, Ordering::Release);
                perform_all();
                perform_all();
                restore_handler(libc::SIGINT, &old_int);
                restore_handler(libc::SIGTERM, &old_term);
                restore_handler(libc::SIGPIPE, &old_pipe);
                restore_handler(libc::SIGCHLD, &old_chld);
                return Ok(ForkRole::Worker(i + 1));
            }
            Ok(pid) => pids.push(pid),
            Err(err) => {
                error!("couldn't spawn worker process: {}", err);
                result = Err(err);
                break;
            }
        }
    }

    if result.is_ok() {
        FORK_ACTIVE.store(true, Ordering::Release);
        match Pool::start_with(threads, spawn_thread, true) {
            Ok(pool) => {
                pool.wait();
                FORK_ACTIVE.store(false, Ordering::Release);
                perform_all();
            }
            Err(err) => {
                FORK_ACTIVE.store(false, Ordering::Release);
                result = Err(err);
            }
        }
    }

    for &pid in &pids {
        unsafe {
            libc::kill(pid, libc::SIGINT);
        }
    }
    for &pid in &pids {
        unsafe {
            libc::waitpid(pid, ptr::null_mut(), 0);
        }
    }

    restore_handler(libc::SIGINT, &old_int);
    restore_handler(libc::SIGTERM, &old_term);
    restore_handler(libc::SIGPIPE, &old_pipe);
    restore_handler(libc::SIGCHLD, &old_chld);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_cycles() {
        let mut block = Block::new();
        for round in 0..3 {
            for i in 0..BLOCK_TASKS {
                assert!(!block.is_full(), "round {} push {}", round, i);
                block.push(Task {
                    func: noop,
                    arg1: i,
                    arg2: 0,
                });
            }
            assert!(block.is_full());
            for i in 0..BLOCK_TASKS {
                assert!(!block.is_empty());
                assert_eq!(block.pop().arg1, i);
            }
            assert!(block.is_empty());
        }
    }
}
