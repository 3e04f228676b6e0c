// ABOUTME: In-process audio server backend driving the bridge through its dispatch entry points
// ABOUTME: Each session owns a ThreadedMainloop; replies and state changes are delivered as loop jobs

//! Loopback backend.
//!
//! [`LoopbackServer`] stands in for a real audio daemon. Every session it
//! hands out runs its own [`ThreadedMainloop`], and everything the server
//! "says" arrives the way a foreign library would deliver it: as a job on the
//! loop thread, with the loop lock held, calling into
//! [`crate::bridge::dispatch`]. The builder knobs make the failure paths of
//! the bridge reachable from tests.

mod model;

pub use model::VOLUME_NORM;

use crate::bridge::{
    dispatch, Backend, Context, ContextState, Handle, Request, RequestToken, Session,
    ThreadedMainloop,
};
use crate::stream::{SampleSpec, StreamFlags, StreamState};
use crate::Result;
use model::{Model, Record, Reply};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Address reported as the server string when none was requested
pub const LOOPBACK_SERVER: &str = "loopback";

/// Bytes requested from a playback stream per write callback
const WRITE_CHUNK: usize = 4096;

#[derive(Debug, Clone, PartialEq)]
enum ConnectBehavior {
    Ready,
    Refuse(String),
    Fail(String),
    Terminate,
    Unknown(i32),
}

#[derive(Debug, Clone)]
struct Behavior {
    connect: ConnectBehavior,
    reply_delay: Duration,
    stalled: bool,
    failing: HashMap<&'static str, String>,
    stream_failure: Option<String>,
    empty_server_info: bool,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            connect: ConnectBehavior::Ready,
            reply_delay: Duration::ZERO,
            stalled: false,
            failing: HashMap::new(),
            stream_failure: None,
            empty_server_info: false,
        }
    }
}

/// An audio server living inside the current process
///
/// Clones share the same server state, so several connections made through
/// one server see each other's changes.
#[derive(Clone, Default)]
pub struct LoopbackServer {
    model: Arc<Mutex<Model>>,
    behavior: Behavior,
}

impl LoopbackServer {
    /// A server with the default fixture: one sound card, a null sink, one music player
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every reply and state change by `delay`
    pub fn with_reply_delay(mut self, delay: Duration) -> Self {
        self.behavior.reply_delay = delay;
        self
    }

    /// Accept requests but never answer them
    pub fn stalled(mut self) -> Self {
        self.behavior.stalled = true;
        self
    }

    /// Refuse to even start connecting
    pub fn refuse_connections(mut self, reason: impl Into<String>) -> Self {
        self.behavior.connect = ConnectBehavior::Refuse(reason.into());
        self
    }

    /// Move every new session to the failed state
    pub fn fail_connections(mut self, reason: impl Into<String>) -> Self {
        self.behavior.connect = ConnectBehavior::Fail(reason.into());
        self
    }

    /// Terminate every new session during setup
    pub fn terminate_connections(mut self) -> Self {
        self.behavior.connect = ConnectBehavior::Terminate;
        self
    }

    /// Report a state value outside the known set during setup
    pub fn report_unknown_state(mut self, raw: i32) -> Self {
        self.behavior.connect = ConnectBehavior::Unknown(raw);
        self
    }

    /// Fail every request of the given kind (see [`Request::kind`]) with `message`
    pub fn fail_requests(mut self, kind: &'static str, message: impl Into<String>) -> Self {
        self.behavior.failing.insert(kind, message.into());
        self
    }

    /// Fail every playback stream during creation
    pub fn fail_streams(mut self, message: impl Into<String>) -> Self {
        self.behavior.stream_failure = Some(message.into());
        self
    }

    /// Complete server-info requests without any record
    pub fn empty_server_info(mut self) -> Self {
        self.behavior.empty_server_info = true;
        self
    }

    /// Total bytes played so far on streams called `stream`
    pub fn played_bytes(&self, stream: &str) -> usize {
        self.model.lock().played.get(stream).copied().unwrap_or(0)
    }

    /// Name of the current default sink
    pub fn default_sink(&self) -> String {
        self.model.lock().default_sink.clone()
    }

    /// Number of clients currently known to the server
    pub fn client_count(&self) -> usize {
        self.model.lock().clients.len()
    }
}

impl Backend for LoopbackServer {
    fn session(&self, name: &str) -> Result<Session> {
        let mainloop = Arc::new(ThreadedMainloop::new());
        let shared = Arc::new(Shared {
            name: name.to_string(),
            model: Arc::clone(&self.model),
            behavior: self.behavior.clone(),
            state: Mutex::new(SessionState::default()),
        });
        let context = LoopbackContext {
            mainloop: Arc::clone(&mainloop),
            shared,
        };
        log::debug!("Loopback session allocated for '{}'", name);
        Ok(Session {
            mainloop,
            context: Arc::new(context),
        })
    }
}

#[derive(Debug)]
struct StreamSlot {
    name: String,
    corked: bool,
    ready: bool,
    sink_input: Option<u32>,
}

#[derive(Debug)]
struct SessionState {
    raw: i32,
    last_error: Option<String>,
    server: String,
    connection: Option<Handle>,
    client: Option<u32>,
    subscription: u32,
    next_token: RequestToken,
    pending: HashSet<RequestToken>,
    streams: HashMap<Handle, StreamSlot>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            raw: ContextState::Unconnected.as_raw(),
            last_error: None,
            server: LOOPBACK_SERVER.to_string(),
            connection: None,
            client: None,
            subscription: 0,
            next_token: 1,
            pending: HashSet::new(),
            streams: HashMap::new(),
        }
    }
}

/// Session state reachable from loop jobs
///
/// Jobs never hold `state` or the model lock while calling into dispatch:
/// dispatch may call straight back into the context.
struct Shared {
    name: String,
    model: Arc<Mutex<Model>>,
    behavior: Behavior,
    state: Mutex<SessionState>,
}

impl Shared {
    fn set_state(&self, state: i32) -> Option<Handle> {
        let mut session = self.state.lock();
        session.raw = state;
        if state == ContextState::Ready.as_raw() && session.client.is_none() {
            session.client = Some(self.model.lock().add_client(&self.name));
        }
        session.connection.clone()
    }

    fn fail(&self, message: &str) {
        self.state.lock().last_error = Some(message.to_string());
    }

    fn is_ready(&self) -> bool {
        self.state.lock().raw == ContextState::Ready.as_raw()
    }

    /// Deliver records then completion for one operation, followed by any subscribed events
    fn deliver(&self, operation: &Handle, outcome: std::result::Result<Reply, String>) {
        let id = operation.as_str();
        match outcome {
            Ok(reply) => {
                for Record(properties) in &reply.records {
                    dispatch::operation_payload_began(id);
                    for p in properties {
                        dispatch::operation_property_set(id, &p.key, &p.value, p.hint);
                    }
                }
                dispatch::operation_completed(id);
                self.publish(&reply.events);
            }
            Err(message) => {
                self.fail(&message);
                dispatch::operation_failed(id, Some(&message));
            }
        }
    }

    fn publish(&self, events: &[(u32, u32)]) {
        let (mask, connection) = {
            let session = self.state.lock();
            (session.subscription, session.connection.clone())
        };
        let Some(connection) = connection else {
            return;
        };
        for (facility, index) in events {
            if mask & facility != 0 {
                dispatch::subscription_event(connection.as_str(), *facility, *index);
            }
        }
    }

    fn answer(&self, request: Request, operation: &Handle) {
        let name = request.kind();
        if let Some(message) = self.behavior.failing.get(name) {
            self.deliver(operation, Err(message.clone()));
            return;
        }

        let outcome = match request {
            Request::Subscribe(mask) => {
                self.state.lock().subscription = mask;
                Ok(Reply::default())
            }
            Request::StreamCork { stream, cork } => self.cork(&stream, cork),
            Request::StreamDrain { stream } => self.drain(&stream),
            Request::ServerInfo if self.behavior.empty_server_info => Ok(Reply::default()),
            other => {
                let (client, server) = {
                    let session = self.state.lock();
                    (session.client.unwrap_or(u32::MAX), session.server.clone())
                };
                self.model.lock().apply(&other, client, &server)
            }
        };
        self.deliver(operation, outcome);
    }

    fn cork(&self, stream: &Handle, cork: bool) -> std::result::Result<Reply, String> {
        let mut session = self.state.lock();
        let slot = session.streams.get_mut(stream).ok_or("Bad state")?;
        slot.corked = cork;
        Ok(Reply::default())
    }

    /// Pull from the stream until its source runs dry
    fn drain(&self, stream: &Handle) -> std::result::Result<Reply, String> {
        let name = {
            let session = self.state.lock();
            let slot = session.streams.get(stream).ok_or("Bad state")?;
            if slot.corked {
                return Err("Stream is corked".to_string());
            }
            slot.name.clone()
        };

        loop {
            let before = self.model.lock().played.get(&name).copied().unwrap_or(0);
            dispatch::stream_write_requested(stream.as_str(), WRITE_CHUNK);
            let after = self.model.lock().played.get(&name).copied().unwrap_or(0);
            if after == before {
                break;
            }
        }
        log::trace!("Loopback drained stream '{}'", name);
        Ok(Reply::default())
    }

    fn open_stream(&self, stream: &Handle) {
        let id = stream.as_str();
        dispatch::stream_state_changed(id, StreamState::Creating.as_raw(), None);

        if let Some(message) = &self.behavior.stream_failure {
            self.state.lock().streams.remove(stream);
            dispatch::stream_state_changed(id, StreamState::Failed.as_raw(), Some(message));
            return;
        }

        let event = {
            let mut session = self.state.lock();
            let client = session.client.unwrap_or(u32::MAX);
            match session.streams.get_mut(stream) {
                Some(slot) => {
                    let index = self.model.lock().add_sink_input(&slot.name, client);
                    slot.sink_input = Some(index);
                    slot.ready = true;
                    Some((crate::subscription::EventType::SinkInput.mask(), index))
                }
                None => None,
            }
        };
        dispatch::stream_state_changed(id, StreamState::Ready.as_raw(), None);
        if let Some(event) = event {
            self.publish(&[event]);
        }
    }
}

/// The session API of one loopback session
struct LoopbackContext {
    mainloop: Arc<ThreadedMainloop>,
    shared: Arc<Shared>,
}

impl LoopbackContext {
    /// Run `job` on the loop thread after the configured reply delay
    fn later(&self, job: impl FnOnce(&Shared) + Send + 'static) {
        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        let run = move || {
            if let Some(shared) = shared.upgrade() {
                job(&shared);
            }
        };
        let delay = self.shared.behavior.reply_delay;
        if delay.is_zero() {
            self.mainloop.defer(run);
        } else {
            self.mainloop.schedule(delay, run);
        }
    }
}

impl Context for LoopbackContext {
    fn connect(&self, server: Option<&str>, connection: &Handle) -> bool {
        if let ConnectBehavior::Refuse(reason) = &self.shared.behavior.connect {
            self.shared.fail(reason);
            return false;
        }

        {
            let mut session = self.shared.state.lock();
            session.connection = Some(connection.clone());
            if let Some(server) = server {
                session.server = server.to_string();
            }
        }

        let steps: Vec<i32> = match &self.shared.behavior.connect {
            ConnectBehavior::Fail(reason) => {
                self.shared.fail(reason);
                vec![ContextState::Connecting.as_raw(), ContextState::Failed.as_raw()]
            }
            ConnectBehavior::Terminate => vec![
                ContextState::Connecting.as_raw(),
                ContextState::Authorizing.as_raw(),
                ContextState::Terminated.as_raw(),
            ],
            ConnectBehavior::Unknown(raw) => vec![ContextState::Connecting.as_raw(), *raw],
            ConnectBehavior::Ready | ConnectBehavior::Refuse(_) => vec![
                ContextState::Connecting.as_raw(),
                ContextState::Authorizing.as_raw(),
                ContextState::SettingName.as_raw(),
                ContextState::Ready.as_raw(),
            ],
        };

        self.later(move |shared| {
            for state in steps {
                if let Some(connection) = shared.set_state(state) {
                    dispatch::connection_state_changed(connection.as_str());
                }
            }
        });
        true
    }

    fn disconnect(&self) {
        let (client, streams) = {
            let mut session = self.shared.state.lock();
            session.raw = ContextState::Terminated.as_raw();
            session.connection = None;
            session.pending.clear();
            let streams: Vec<_> = session.streams.drain().filter_map(|(_, s)| s.sink_input).collect();
            (session.client.take(), streams)
        };

        let mut model = self.shared.model.lock();
        for index in streams {
            model.remove_sink_input(index);
        }
        if let Some(client) = client {
            model.remove_client(client);
        }
        log::debug!("Loopback session '{}' disconnected", self.shared.name);
    }

    fn state(&self) -> i32 {
        self.shared.state.lock().raw
    }

    fn last_error(&self) -> Option<String> {
        self.shared.state.lock().last_error.clone()
    }

    fn submit(&self, request: Request, operation: &Handle) -> Option<RequestToken> {
        if !self.shared.is_ready() {
            self.shared.fail("Bad state");
            return None;
        }

        let token = {
            let mut session = self.shared.state.lock();
            let token = session.next_token;
            session.next_token += 1;
            session.pending.insert(token);
            token
        };

        if self.shared.behavior.stalled {
            log::trace!("Loopback stalling {} request", request.kind());
            return Some(token);
        }

        let operation = operation.clone();
        self.later(move |shared| shared.answer(request, &operation));
        Some(token)
    }

    fn release(&self, token: RequestToken) {
        self.shared.state.lock().pending.remove(&token);
    }

    fn stream_connect_playback(
        &self,
        stream: &Handle,
        name: &str,
        spec: &SampleSpec,
        flags: StreamFlags,
    ) -> bool {
        if !self.shared.is_ready() {
            self.shared.fail("Bad state");
            return false;
        }

        log::debug!(
            "Loopback playback stream '{}' ({} bytes/s)",
            name,
            spec.bytes_per_second()
        );
        self.shared.state.lock().streams.insert(
            stream.clone(),
            StreamSlot {
                name: name.to_string(),
                corked: flags.contains(StreamFlags::START_CORKED),
                ready: false,
                sink_input: None,
            },
        );

        let stream = stream.clone();
        self.later(move |shared| shared.open_stream(&stream));
        true
    }

    fn stream_write(&self, stream: &Handle, data: &[u8]) -> bool {
        let name = {
            let session = self.shared.state.lock();
            session
                .streams
                .get(stream)
                .filter(|slot| slot.ready)
                .map(|slot| slot.name.clone())
        };
        match name {
            Some(name) => {
                self.shared.model.lock().record_played(&name, data.len());
                true
            }
            None => {
                self.shared.fail("Bad state");
                false
            }
        }
    }

    fn stream_is_corked(&self, stream: &Handle) -> bool {
        self.shared
            .state
            .lock()
            .streams
            .get(stream)
            .is_some_and(|slot| slot.corked)
    }

    fn stream_disconnect(&self, stream: &Handle) {
        let removed = self.shared.state.lock().streams.remove(stream);
        if let Some(index) = removed.and_then(|slot| slot.sink_input) {
            self.shared.model.lock().remove_sink_input(index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::Connection;
    use crate::config::ClientConfig;
    use crate::error::Error;

    #[test]
    fn test_session_registers_and_removes_client() {
        let server = LoopbackServer::new();
        let before = server.client_count();

        let conn = Connection::connect(&server, ClientConfig::new("loopback-test")).unwrap();
        assert_eq!(server.client_count(), before + 1);
        conn.disconnect();
        assert_eq!(server.client_count(), before);
    }

    #[test]
    fn test_reply_delay_still_completes() {
        let server = LoopbackServer::new().with_reply_delay(Duration::from_millis(20));
        let conn = Connection::connect(&server, ClientConfig::new("loopback-test")).unwrap();

        let mut op = conn.new_operation();
        op.submit(Request::SinkInfoList).unwrap();
        let count = op.wait_success(|payloads| Ok(payloads.len())).unwrap();
        assert_eq!(count, 2);
        op.destroy();
        conn.disconnect();
    }

    #[test]
    fn test_failing_request_kind() {
        let server = LoopbackServer::new().fail_requests("module-info-list", "Access denied");
        let conn = Connection::connect(&server, ClientConfig::new("loopback-test")).unwrap();

        let mut op = conn.new_operation();
        op.submit(Request::ModuleInfoList).unwrap();
        match op.wait() {
            Err(Error::Operation(msg)) => assert_eq!(msg, "Access denied"),
            other => panic!("expected operation error, got {:?}", other),
        }
        op.destroy();
        conn.disconnect();
    }
}
