// ABOUTME: One in-flight request against a connection and its accumulated payloads
// ABOUTME: Turns the callback-driven completion into a blocking wait with a timeout race

use crate::bridge::connection::{Connection, ConnectionInner};
use crate::bridge::context::{Request, RequestToken};
use crate::bridge::handle::{self, Handle, Registered};
use crate::bridge::payload::{prune_trailing_empty, Payload};
use crate::error::Error;
use crate::Result;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

/// Default operation timeout in milliseconds
pub const DEFAULT_OPERATION_TIMEOUT_MSEC: u64 = 5000;

/// Terminal outcome of an operation
#[derive(Debug, Clone, PartialEq)]
enum Outcome {
    Succeeded,
    Failed(String),
    TimedOut,
}

#[derive(Debug, Default)]
struct OperationState {
    payloads: Vec<Payload>,
    /// Index of the payload receiving property writes; `None` until the first one starts
    current: Option<usize>,
    token: Option<RequestToken>,
    outcome: Option<Outcome>,
}

impl OperationState {
    fn current_payload(&mut self) -> &mut Payload {
        let index = match self.current {
            Some(index) => index,
            None => {
                self.payloads.push(Payload::new());
                self.current = Some(0);
                0
            }
        };
        &mut self.payloads[index]
    }
}

pub(crate) struct OperationInner {
    pub(crate) handle: Handle,
    pub(crate) connection: Arc<ConnectionInner>,
    state: Mutex<OperationState>,
    done_tx: Sender<()>,
    done_rx: Receiver<()>,
}

impl OperationInner {
    /// Start a new payload; it becomes the target of subsequent property writes
    pub(crate) fn begin_payload(&self) -> Option<usize> {
        let mut state = self.state.lock();
        if state.outcome.is_some() {
            return None;
        }
        state.payloads.push(Payload::new());
        let index = state.payloads.len() - 1;
        state.current = Some(index);
        Some(index)
    }

    pub(crate) fn set_property(&self, key: &str, raw: &str, hint: Option<&str>) -> bool {
        let mut state = self.state.lock();
        if state.outcome.is_some() {
            return false;
        }
        state.current_payload().set_property(key, raw, hint);
        true
    }

    pub(crate) fn append_data(&self, data: &[u8]) -> bool {
        let mut state = self.state.lock();
        if state.outcome.is_some() {
            return false;
        }
        state.current_payload().append_data(data);
        true
    }

    /// Record the terminal outcome exactly once and wake the waiter
    ///
    /// Returns false when the operation had already finished (or timed out).
    pub(crate) fn finish(&self, error: Option<String>) -> bool {
        let token = {
            let mut state = self.state.lock();
            if state.outcome.is_some() {
                return false;
            }
            let pruned = prune_trailing_empty(&mut state.payloads);
            if pruned > 0 {
                log::trace!("Operation {} pruned {} empty trailing payloads", self.handle, pruned);
            }
            state.outcome = Some(match error {
                None => Outcome::Succeeded,
                Some(message) => Outcome::Failed(message),
            });
            state.token.take()
        };

        if let Some(token) = token {
            self.connection.context.release(token);
        }
        // Capacity 1 and exactly one finisher: this never blocks the loop thread
        let _ = self.done_tx.try_send(());
        self.connection.signal_all();
        true
    }

    fn outcome(&self) -> Option<Outcome> {
        self.state.lock().outcome.clone()
    }

    fn mark_timed_out(&self) {
        let mut state = self.state.lock();
        if state.outcome.is_none() {
            state.outcome = Some(Outcome::TimedOut);
        }
    }

    fn payloads(&self) -> Vec<Payload> {
        self.state.lock().payloads.clone()
    }
}

/// One outstanding request against a [`Connection`]
///
/// Creating an operation acquires the connection's loop lock (unless the
/// calling thread already holds it) and keeps it until the operation is
/// destroyed; waiting releases it only while parked. Dropping the operation
/// destroys it.
///
/// The loop lock belongs to the thread that created the operation, so an
/// operation cannot be sent to another thread:
///
/// ```compile_fail
/// fn assert_send<T: Send>() {}
/// assert_send::<pulsebridge::Operation>();
/// ```
pub struct Operation {
    inner: Arc<OperationInner>,
    conn: Connection,
    timeout: Option<Duration>,
    owns_lock: bool,
    destroyed: bool,
    _not_send: PhantomData<*const ()>,
}

impl Operation {
    /// Allocate an operation, register its handle and take the connection lock
    pub fn new(conn: &Connection) -> Operation {
        let (done_tx, done_rx) = channel::bounded(1);
        let inner = Arc::new(OperationInner {
            handle: Handle::new(),
            connection: Arc::clone(&conn.inner),
            state: Mutex::new(OperationState::default()),
            done_tx,
            done_rx,
        });

        handle::register(&inner.handle, Registered::Operation(Arc::clone(&inner)));
        let owns_lock = conn.lock();

        Operation {
            inner,
            conn: conn.clone(),
            timeout: Some(conn.operation_timeout()),
            owns_lock,
            destroyed: false,
            _not_send: PhantomData,
        }
    }

    /// Handle identifying this operation to the foreign side
    pub fn handle(&self) -> &Handle {
        &self.inner.handle
    }

    /// Connection this operation runs against
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Effective timeout, `None` when unbounded
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Override the timeout for this operation
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Wait without a deadline (for long-running requests such as drain)
    pub fn unbounded(mut self) -> Self {
        self.timeout = None;
        self
    }

    /// Issue `request` with this operation as its callback context
    pub fn submit(&mut self, request: Request) -> Result<()> {
        log::trace!("Operation {} submitting {:?}", self.inner.handle, request);
        match self.conn.inner.context.submit(request, &self.inner.handle) {
            Some(token) => {
                self.inner.state.lock().token = Some(token);
                Ok(())
            }
            None => {
                let reason = self
                    .conn
                    .last_error()
                    .unwrap_or_else(|| "request rejected".to_string());
                self.inner.finish(Some(reason.clone()));
                Err(Error::Operation(reason))
            }
        }
    }

    /// Append an empty payload and make it current; returns its index
    ///
    /// Returns `None` once the operation has finished.
    pub fn add_payload(&self) -> Option<usize> {
        self.inner.begin_payload()
    }

    /// Set a property on the current payload, creating payload 0 if none exists
    pub fn set_property(&self, key: &str, raw: &str, hint: Option<&str>) -> bool {
        self.inner.set_property(key, raw, hint)
    }

    /// Record a terminal error for this operation
    pub fn set_error(&self, message: impl Into<String>) -> bool {
        self.inner.finish(Some(message.into()))
    }

    /// Number of payloads accumulated so far
    pub fn payload_count(&self) -> usize {
        self.inner.state.lock().payloads.len()
    }

    /// Block until the operation finishes or its timeout elapses
    ///
    /// On success `on_success` receives the payloads in arrival order; on
    /// failure or timeout `on_error` receives the error and no payloads are
    /// exposed. A timeout does not cancel the foreign request. Waiting again
    /// reports the same outcome and the same payloads.
    pub fn wait_func<T>(
        &mut self,
        on_success: impl FnOnce(Vec<Payload>) -> Result<T>,
        on_error: impl FnOnce(Error) -> Result<T>,
    ) -> Result<T> {
        if self.conn.inner.mainloop.in_loop_thread() {
            return on_error(Error::Lock(
                "operations cannot be waited on from the event loop thread".to_string(),
            ));
        }

        let outcome = match self.inner.outcome() {
            Some(outcome) => outcome,
            None => {
                let done = &self.inner.done_rx;
                let timer = match self.timeout {
                    Some(timeout) => channel::after(timeout),
                    None => channel::never(),
                };
                let completed = self.conn.release_while(|| {
                    crossbeam::select! {
                        recv(done) -> _ => true,
                        recv(timer) -> _ => false,
                    }
                });

                if completed {
                    self.inner.outcome().unwrap_or(Outcome::TimedOut)
                } else {
                    self.inner.mark_timed_out();
                    Outcome::TimedOut
                }
            }
        };

        match outcome {
            Outcome::Succeeded => on_success(self.inner.payloads()),
            Outcome::Failed(message) => on_error(Error::Operation(message)),
            Outcome::TimedOut => {
                let timeout = self.timeout.unwrap_or(Duration::MAX);
                log::debug!("Operation {} timed out after {:?}", self.inner.handle, timeout);
                on_error(Error::Timeout(timeout))
            }
        }
    }

    /// Wait, mapping success to `Ok(())` and passing errors through
    pub fn wait(&mut self) -> Result<()> {
        self.wait_func(|_| Ok(()), Err)
    }

    /// Wait and transform the payloads on success
    pub fn wait_success<T>(&mut self, on_success: impl FnOnce(Vec<Payload>) -> Result<T>) -> Result<T> {
        self.wait_func(on_success, Err)
    }

    /// Wait and handle the error case; success yields `Ok(())`
    pub fn wait_error(&mut self, on_error: impl FnOnce(Error) -> Result<()>) -> Result<()> {
        self.wait_func(|_| Ok(()), on_error)
    }

    /// Unregister the handle and release the connection lock
    pub fn destroy(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;

        // Unregister while still holding the lock so no callback is mid-flight
        handle::unregister(&self.inner.handle);
        if self.owns_lock {
            if let Err(e) = self.conn.unlock() {
                log::warn!("Operation {} could not release its lock: {}", self.inner.handle, e);
            }
        }
    }
}

impl Drop for Operation {
    fn drop(&mut self) {
        self.release();
    }
}

/// Require at least one payload and return the first
pub fn first_payload(payloads: Vec<Payload>, call: &'static str) -> Result<Payload> {
    payloads.into_iter().next().ok_or(Error::NoData(call))
}

/// Require exactly one payload
pub fn single_payload(payloads: Vec<Payload>) -> Result<Payload> {
    let got = payloads.len();
    let mut payloads = payloads.into_iter();
    match (payloads.next(), got) {
        (Some(payload), 1) => Ok(payload),
        _ => Err(Error::PayloadCount { expected: 1, got }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::dispatch;
    use crate::config::ClientConfig;
    use crate::loopback::LoopbackServer;
    use crate::bridge::payload::Value;

    fn connect(server: &LoopbackServer) -> Connection {
        Connection::connect(server, ClientConfig::new("operation-test")).unwrap()
    }

    #[test]
    fn test_property_without_payload_creates_first() {
        let conn = connect(&LoopbackServer::new());
        let mut op = conn.new_operation();

        assert!(op.set_property("count", "54", Some("int")));
        assert_eq!(op.payload_count(), 1);
        assert!(op.inner.finish(None));

        let payload = op
            .wait_success(|payloads| first_payload(payloads, "test"))
            .unwrap();
        assert_eq!(payload.get("count"), Some(&Value::Int(54)));

        op.destroy();
        conn.disconnect();
    }

    #[test]
    fn test_payload_order_and_trailing_prune() {
        let conn = connect(&LoopbackServer::new());
        let mut op = conn.new_operation();

        for i in 0..3 {
            op.add_payload();
            op.set_property("index", &i.to_string(), Some("int"));
        }
        op.add_payload();
        assert_eq!(op.payload_count(), 4);
        op.inner.finish(None);

        let indices = op
            .wait_success(|payloads| {
                payloads
                    .iter()
                    .map(|p| p.field::<u32>("index"))
                    .collect::<Result<Vec<_>>>()
            })
            .unwrap();
        assert_eq!(indices, vec![0, 1, 2]);
        conn.disconnect();
    }

    #[test]
    fn test_finish_is_exactly_once() {
        let conn = connect(&LoopbackServer::new());
        let mut op = conn.new_operation();

        assert!(op.inner.finish(Some("first".to_string())));
        assert!(!op.inner.finish(None));
        assert!(op.add_payload().is_none());
        assert!(!op.set_property("late", "1", None));

        match op.wait() {
            Err(Error::Operation(msg)) => assert_eq!(msg, "first"),
            other => panic!("expected operation error, got {:?}", other),
        }
        drop(op);
        conn.disconnect();
    }

    #[test]
    fn test_timeout_then_late_completion_is_dropped() {
        let server = LoopbackServer::new().stalled();
        let conn = connect(&server);
        let mut op = conn.new_operation().with_timeout(Duration::from_millis(50));
        op.submit(Request::ServerInfo).unwrap();

        assert!(matches!(op.wait(), Err(Error::Timeout(t)) if t == Duration::from_millis(50)));

        // The handle is still registered; a late completion is a harmless no-op
        dispatch::operation_completed(op.handle().as_str());
        assert!(matches!(op.wait(), Err(Error::Timeout(_))));

        op.destroy();
        assert!(!conn.is_locked());
        conn.disconnect();
    }

    #[test]
    fn test_destroy_releases_lock_and_handle() {
        let conn = connect(&LoopbackServer::new());
        let op = conn.new_operation();
        let id = op.handle().clone();
        assert!(conn.is_locked());

        op.destroy();
        assert!(!conn.is_locked());
        assert!(handle::get(id.as_str()).is_none());
        conn.disconnect();
    }

    #[test]
    fn test_nested_operation_keeps_outer_lock() {
        let conn = connect(&LoopbackServer::new());
        conn.lock();
        let op = conn.new_operation();
        op.destroy();
        assert!(conn.is_locked());
        conn.unlock().unwrap();
        conn.disconnect();
    }

    #[test]
    fn test_second_wait_sees_same_payloads() {
        let conn = connect(&LoopbackServer::new());
        let mut op = conn.new_operation();
        op.submit(Request::SinkInfoList).unwrap();

        let first = op.wait_success(Ok).unwrap();
        let second = op.wait_success(Ok).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first, second);

        op.destroy();
        conn.disconnect();
    }

    #[test]
    fn test_operations_on_worker_threads_release_lock() {
        let conn = connect(&LoopbackServer::new());

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let conn = conn.clone();
                std::thread::spawn(move || {
                    let mut op = conn.new_operation();
                    op.submit(Request::ServerInfo).unwrap();
                    let payloads = op.wait_success(Ok).unwrap();
                    op.destroy();
                    assert!(!conn.is_locked());
                    payloads.len()
                })
            })
            .collect();
        for worker in workers {
            assert_eq!(worker.join().unwrap(), 1);
        }

        let mut op = conn.new_operation().with_timeout(Duration::from_secs(2));
        op.submit(Request::ModuleInfoList).unwrap();
        assert_eq!(op.wait_success(Ok).unwrap().len(), 3);
        op.destroy();
        conn.disconnect();
    }

    #[test]
    fn test_payload_cardinality_helpers() {
        assert!(matches!(first_payload(Vec::new(), "server_info"), Err(Error::NoData("server_info"))));
        assert!(matches!(
            single_payload(vec![Payload::new(), Payload::new()]),
            Err(Error::PayloadCount { expected: 1, got: 2 })
        ));
        assert!(single_payload(vec![Payload::new()]).is_ok());
    }
}
