// ABOUTME: Connection to the audio server: owns the event loop and the session state machine
// ABOUTME: Exposes per-thread lock tracking, wait/signal, and ordered teardown

use crate::bridge::context::{Backend, Context, ContextState};
use crate::bridge::handle::{self, Handle, Registered};
use crate::bridge::mainloop::Mainloop;
use crate::bridge::operation::Operation;
use crate::config::ClientConfig;
use crate::error::Error;
use crate::subscription::EventType;
use crate::Result;
use crossbeam::channel::Sender;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

pub(crate) struct ConnectionInner {
    pub(crate) handle: Handle,
    pub(crate) config: ClientConfig,
    pub(crate) mainloop: Arc<dyn Mainloop>,
    pub(crate) context: Arc<dyn Context>,
    /// Threads that logically hold the loop lock, including ones parked in `wait`
    holders: Mutex<HashSet<ThreadId>>,
    observed: Mutex<Option<ContextState>>,
    subscriber: Mutex<Option<Sender<EventType>>>,
}

impl ConnectionInner {
    /// Record a state change reported by the foreign side
    pub(crate) fn state_changed(&self) {
        let raw = self.context.state();
        let state = ContextState::from_raw(raw);
        let previous = std::mem::replace(&mut *self.observed.lock(), state);
        if previous != state {
            match state {
                Some(state) => log::debug!("Connection '{}' is now {}", self.config.name, state),
                None => log::warn!("Connection '{}' reported unknown state {}", self.config.name, raw),
            }
        }
    }

    pub(crate) fn publish(&self, event: EventType) {
        let mut subscriber = self.subscriber.lock();
        if let Some(tx) = subscriber.as_ref() {
            if tx.try_send(event).is_err() {
                log::debug!("Subscriber for '{}' went away, dropping subscription", self.config.name);
                *subscriber = None;
            }
        }
    }

    pub(crate) fn signal_all(&self) {
        self.mainloop.signal();
    }
}

/// A logical session with the audio server
///
/// Cloning is cheap and yields another reference to the same session. The
/// session lives until [`Connection::disconnect`] is called.
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Connect to the server reachable through `backend`
    ///
    /// Holds the loop lock for the whole setup sequence except while parked in
    /// [`Connection::wait`], so no state change can slip past unobserved.
    pub fn connect(backend: &dyn Backend, config: ClientConfig) -> Result<Connection> {
        let session = backend.session(&config.name)?;
        let conn = Connection {
            inner: Arc::new(ConnectionInner {
                handle: Handle::new(),
                config,
                mainloop: session.mainloop,
                context: session.context,
                holders: Mutex::new(HashSet::new()),
                observed: Mutex::new(None),
                subscriber: Mutex::new(None),
            }),
        };

        handle::register(&conn.inner.handle, Registered::Connection(Arc::clone(&conn.inner)));
        conn.lock();

        if let Err(e) = conn.inner.mainloop.start() {
            conn.teardown();
            return Err(e);
        }

        let server = conn.inner.config.server.clone();
        if !conn.inner.context.connect(server.as_deref(), &conn.inner.handle) {
            let reason = conn
                .last_error()
                .unwrap_or_else(|| "connection refused".to_string());
            conn.teardown();
            return Err(Error::Connect(reason));
        }

        if let Err(e) = conn.await_ready() {
            log::debug!("Connection '{}' setup failed: {}", conn.name(), e);
            conn.teardown();
            return Err(e);
        }

        conn.unlock()?;
        log::info!("Connected to audio server as '{}'", conn.name());
        Ok(conn)
    }

    fn await_ready(&self) -> Result<()> {
        loop {
            let raw = self.inner.context.state();
            match ContextState::from_raw(raw) {
                Some(
                    ContextState::Unconnected
                    | ContextState::Connecting
                    | ContextState::Authorizing
                    | ContextState::SettingName,
                ) => self.wait()?,
                Some(ContextState::Ready) => return Ok(()),
                Some(ContextState::Failed) => {
                    return Err(Error::Connect(
                        self.last_error()
                            .unwrap_or_else(|| "connection failed".to_string()),
                    ))
                }
                Some(ContextState::Terminated) => return Err(Error::Terminated),
                None => return Err(Error::UnknownState(raw)),
            }
        }
    }

    /// The handle foreign callbacks use to reach this connection
    pub fn handle(&self) -> &Handle {
        &self.inner.handle
    }

    /// Client name
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Configuration the connection was created with
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Default timeout for operations on this connection
    pub fn operation_timeout(&self) -> Duration {
        self.inner.config.operation_timeout
    }

    /// Current session state
    pub fn state(&self) -> Option<ContextState> {
        self.lock_func(|| Ok(ContextState::from_raw(self.inner.context.state())))
            .ok()
            .flatten()
    }

    /// Text of the foreign side's most recent error
    pub fn last_error(&self) -> Option<String> {
        self.inner.context.last_error().filter(|msg| !msg.is_empty())
    }

    /// Acquire the loop lock for the calling thread
    ///
    /// Returns false without doing anything if this thread already holds it.
    pub fn lock(&self) -> bool {
        let me = thread::current().id();
        if self.inner.holders.lock().contains(&me) {
            return false;
        }
        self.inner.mainloop.lock();
        self.inner.holders.lock().insert(me);
        true
    }

    /// Release the loop lock held by the calling thread
    pub fn unlock(&self) -> Result<()> {
        let me = thread::current().id();
        if !self.inner.holders.lock().remove(&me) {
            log::warn!("Unlock of connection '{}' without holding its lock", self.name());
            return Err(Error::Lock(format!(
                "connection '{}' is not locked by this thread",
                self.name()
            )));
        }
        self.inner.mainloop.unlock();
        Ok(())
    }

    /// Whether the calling thread holds the loop lock
    pub fn is_locked(&self) -> bool {
        self.inner.holders.lock().contains(&thread::current().id())
    }

    /// Run `f` with the loop lock held, releasing it afterwards if it was taken here
    pub fn lock_func<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let acquired = self.lock();
        let result = f();
        if acquired {
            self.unlock()?;
        }
        result
    }

    /// Park until a callback signals the loop
    ///
    /// The calling thread must hold the loop lock; it is released while parked
    /// and re-acquired before returning.
    pub fn wait(&self) -> Result<()> {
        if !self.is_locked() {
            return Err(Error::Lock(format!(
                "wait on connection '{}' requires holding its lock",
                self.name()
            )));
        }
        self.inner.mainloop.wait();
        Ok(())
    }

    /// Wake every thread parked in [`Connection::wait`]
    pub fn signal_all(&self) {
        self.inner.signal_all();
    }

    /// Run `f` with the loop lock temporarily released if this thread holds it
    pub(crate) fn release_while<R>(&self, f: impl FnOnce() -> R) -> R {
        if self.is_locked() {
            self.inner.mainloop.unlock();
            let result = f();
            self.inner.mainloop.lock();
            result
        } else {
            f()
        }
    }

    pub(crate) fn set_subscriber(&self, tx: Option<Sender<EventType>>) {
        *self.inner.subscriber.lock() = tx;
    }

    /// Create an operation against this connection
    pub fn new_operation(&self) -> Operation {
        Operation::new(self)
    }

    /// Close the session, stop the loop and release the handle
    pub fn disconnect(self) {
        self.lock();
        self.teardown();
        log::info!("Disconnected '{}'", self.name());
    }

    fn teardown(&self) {
        self.inner.context.disconnect();
        self.stop();
        self.destroy();
    }

    fn stop(&self) {
        if self.is_locked() {
            let _ = self.unlock();
        }
        self.inner.mainloop.stop();
    }

    fn destroy(&self) {
        self.set_subscriber(None);
        handle::unregister(&self.inner.handle);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("handle", &self.inner.handle)
            .field("name", &self.inner.config.name)
            .finish()
    }
}
