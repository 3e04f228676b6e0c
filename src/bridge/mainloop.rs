// ABOUTME: Event-loop abstraction and an in-process threaded implementation
// ABOUTME: Provides lock/unlock/wait/signal/start/stop around a background callback thread

use crate::error::Error;
use crate::Result;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

/// The primitives a foreign event loop must expose to the bridge
///
/// Callbacks are invoked on the loop thread with the loop lock held. Caller
/// threads take the same lock before touching any foreign state.
pub trait Mainloop: Send + Sync {
    /// Acquire the loop lock (recursive for the owning thread)
    fn lock(&self);
    /// Release one level of the loop lock
    fn unlock(&self);
    /// Release the lock, sleep until signalled, then re-acquire it atomically
    fn wait(&self);
    /// Wake every thread parked in [`Mainloop::wait`]
    fn signal(&self);
    /// Start the loop thread
    fn start(&self) -> Result<()>;
    /// Stop the loop thread and wait for it to exit
    fn stop(&self);
    /// Whether the calling thread is the loop thread
    fn in_loop_thread(&self) -> bool;
}

/// A unit of work executed on the loop thread
pub type Job = Box<dyn FnOnce() + Send + 'static>;

enum Command {
    Run(Job),
    Schedule(Instant, Job),
    Stop,
}

#[derive(Debug, Default)]
struct LockState {
    owner: Option<ThreadId>,
    depth: usize,
    generation: u64,
}

#[derive(Debug, Default)]
struct LoopLock {
    state: Mutex<LockState>,
    released: Condvar,
    signalled: Condvar,
}

impl LoopLock {
    fn lock(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.owner == Some(me) {
            state.depth += 1;
            return;
        }
        while state.owner.is_some() {
            self.released.wait(&mut state);
        }
        state.owner = Some(me);
        state.depth = 1;
    }

    fn unlock(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.owner != Some(me) {
            log::error!("Mainloop unlock from a thread that does not hold the lock");
            return;
        }
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            self.released.notify_all();
        }
    }

    fn wait(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.owner != Some(me) {
            log::error!("Mainloop wait from a thread that does not hold the lock");
            return;
        }

        let depth = state.depth;
        let generation = state.generation;
        state.owner = None;
        state.depth = 0;
        self.released.notify_all();

        while state.generation == generation {
            self.signalled.wait(&mut state);
        }
        while state.owner.is_some() {
            self.released.wait(&mut state);
        }
        state.owner = Some(me);
        state.depth = depth;
    }

    fn signal(&self) {
        let mut state = self.state.lock();
        state.generation = state.generation.wrapping_add(1);
        self.signalled.notify_all();
    }

    fn held_by_current_thread(&self) -> bool {
        self.state.lock().owner == Some(thread::current().id())
    }
}

/// In-process event loop: one background thread draining a job queue
///
/// Every job runs with the loop lock held, which is how the foreign side
/// delivers callbacks. Jobs may be queued for immediate execution with
/// [`ThreadedMainloop::defer`] or after a delay with [`ThreadedMainloop::schedule`].
pub struct ThreadedMainloop {
    lock: std::sync::Arc<LoopLock>,
    tx: Sender<Command>,
    rx: Receiver<Command>,
    thread: Mutex<Option<JoinHandle<()>>>,
    loop_thread: Mutex<Option<ThreadId>>,
}

impl ThreadedMainloop {
    /// Create a stopped loop
    pub fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        Self {
            lock: std::sync::Arc::new(LoopLock::default()),
            tx,
            rx,
            thread: Mutex::new(None),
            loop_thread: Mutex::new(None),
        }
    }

    /// Queue a job to run on the loop thread as soon as possible
    pub fn defer(&self, job: impl FnOnce() + Send + 'static) {
        if self.tx.send(Command::Run(Box::new(job))).is_err() {
            log::debug!("Mainloop queue closed, job dropped");
        }
    }

    /// Queue a job to run on the loop thread once `delay` has elapsed
    pub fn schedule(&self, delay: Duration, job: impl FnOnce() + Send + 'static) {
        let at = Instant::now() + delay;
        if self.tx.send(Command::Schedule(at, Box::new(job))).is_err() {
            log::debug!("Mainloop queue closed, timer dropped");
        }
    }

    /// Whether the loop thread is running
    pub fn is_running(&self) -> bool {
        self.thread.lock().is_some()
    }

    fn run(lock: std::sync::Arc<LoopLock>, rx: Receiver<Command>) {
        let mut timers: Vec<(Instant, Job)> = Vec::new();

        loop {
            let next = timers.iter().map(|(at, _)| *at).min();
            let received = match next {
                Some(deadline) => rx.recv_deadline(deadline),
                None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };

            match received {
                Ok(Command::Run(job)) => Self::execute(&lock, job),
                Ok(Command::Schedule(at, job)) => timers.push((at, job)),
                Ok(Command::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }

            let now = Instant::now();
            while let Some(pos) = timers.iter().position(|(at, _)| *at <= now) {
                let (_, job) = timers.swap_remove(pos);
                Self::execute(&lock, job);
            }
        }

        // Pending work holds references to foreign-side state; drop it here
        let dropped = timers.len() + rx.try_iter().count();
        if dropped > 0 {
            log::debug!("Mainloop stopped with {} pending jobs discarded", dropped);
        }
    }

    fn execute(lock: &LoopLock, job: Job) {
        lock.lock();
        job();
        lock.unlock();
    }
}

impl Default for ThreadedMainloop {
    fn default() -> Self {
        Self::new()
    }
}

impl Mainloop for ThreadedMainloop {
    fn lock(&self) {
        self.lock.lock();
    }

    fn unlock(&self) {
        self.lock.unlock();
    }

    fn wait(&self) {
        self.lock.wait();
    }

    fn signal(&self) {
        self.lock.signal();
    }

    fn start(&self) -> Result<()> {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return Err(Error::Setup("mainloop is already running".to_string()));
        }

        let lock = std::sync::Arc::clone(&self.lock);
        let rx = self.rx.clone();
        let handle = thread::Builder::new()
            .name("pulsebridge-mainloop".to_string())
            .spawn(move || Self::run(lock, rx))
            .map_err(|e| Error::Setup(format!("failed to spawn mainloop thread: {}", e)))?;

        *self.loop_thread.lock() = Some(handle.thread().id());
        *thread = Some(handle);
        log::debug!("Mainloop started");
        Ok(())
    }

    fn stop(&self) {
        if self.in_loop_thread() {
            log::error!("Mainloop cannot be stopped from its own thread");
            return;
        }
        if self.lock.held_by_current_thread() {
            log::warn!("Stopping mainloop while holding its lock");
        }

        let Some(handle) = self.thread.lock().take() else {
            return;
        };
        let _ = self.tx.send(Command::Stop);
        if handle.join().is_err() {
            log::error!("Mainloop thread panicked");
        }
        *self.loop_thread.lock() = None;
        log::debug!("Mainloop stopped");
    }

    fn in_loop_thread(&self) -> bool {
        *self.loop_thread.lock() == Some(thread::current().id())
    }
}

impl Drop for ThreadedMainloop {
    fn drop(&mut self) {
        if self.thread.get_mut().is_some() && !self.in_loop_thread() {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_jobs_run_with_lock_held() {
        let mainloop = Arc::new(ThreadedMainloop::new());
        mainloop.start().unwrap();

        let held = Arc::new(AtomicBool::new(false));
        let observed = Arc::clone(&held);
        let inner = Arc::clone(&mainloop);

        mainloop.lock();
        mainloop.defer(move || {
            observed.store(inner.lock.held_by_current_thread(), Ordering::SeqCst);
            inner.signal();
        });
        mainloop.wait();
        mainloop.unlock();

        assert!(held.load(Ordering::SeqCst));
        mainloop.stop();
    }

    #[test]
    fn test_lock_is_recursive_for_owner() {
        let mainloop = ThreadedMainloop::new();
        mainloop.lock();
        mainloop.lock();
        mainloop.unlock();
        assert!(mainloop.lock.held_by_current_thread());
        mainloop.unlock();
        assert!(!mainloop.lock.held_by_current_thread());
    }

    #[test]
    fn test_wait_restores_lock_depth() {
        let mainloop = Arc::new(ThreadedMainloop::new());
        mainloop.start().unwrap();

        mainloop.lock();
        mainloop.lock();
        let signaller = Arc::clone(&mainloop);
        mainloop.defer(move || signaller.signal());
        mainloop.wait();

        mainloop.unlock();
        assert!(mainloop.lock.held_by_current_thread());
        mainloop.unlock();
        mainloop.stop();
    }

    #[test]
    fn test_scheduled_jobs_fire_in_order() {
        let mainloop = Arc::new(ThreadedMainloop::new());
        mainloop.start().unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let (first, second) = (Arc::clone(&order), Arc::clone(&order));
        let signaller = Arc::clone(&mainloop);

        mainloop.lock();
        mainloop.schedule(Duration::from_millis(30), move || {
            second.lock().push(2);
            signaller.signal();
        });
        mainloop.schedule(Duration::from_millis(5), move || first.lock().push(1));
        while order.lock().len() < 2 {
            mainloop.wait();
        }
        mainloop.unlock();

        assert_eq!(*order.lock(), vec![1, 2]);
        mainloop.stop();
    }

    #[test]
    fn test_start_twice_is_an_error() {
        let mainloop = ThreadedMainloop::new();
        mainloop.start().unwrap();
        assert!(matches!(mainloop.start(), Err(Error::Setup(_))));
        mainloop.stop();
        assert!(!mainloop.is_running());
    }

    #[test]
    fn test_stop_discards_pending_timers() {
        let mainloop = ThreadedMainloop::new();
        mainloop.start().unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        mainloop.schedule(Duration::from_secs(60), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        mainloop.stop();

        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
