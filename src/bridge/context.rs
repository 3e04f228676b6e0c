// ABOUTME: Narrow interface to the foreign session API consumed by the bridge
// ABOUTME: Connection states, request descriptions, and the backend that allocates loop + context pairs

use crate::bridge::handle::Handle;
use crate::bridge::mainloop::Mainloop;
use crate::stream::{SampleSpec, StreamFlags};
use crate::Result;
use std::fmt;
use std::sync::Arc;

/// Connection state as reported by the foreign session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextState {
    /// Not connected yet
    Unconnected,
    /// A connection is being established
    Connecting,
    /// The client is authorizing itself to the daemon
    Authorizing,
    /// The client is passing its application name to the daemon
    SettingName,
    /// Connection established, requests may be issued
    Ready,
    /// The connection failed or was disconnected
    Failed,
    /// The connection was terminated cleanly
    Terminated,
}

impl ContextState {
    /// Decode the foreign side's raw state value
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(ContextState::Unconnected),
            1 => Some(ContextState::Connecting),
            2 => Some(ContextState::Authorizing),
            3 => Some(ContextState::SettingName),
            4 => Some(ContextState::Ready),
            5 => Some(ContextState::Failed),
            6 => Some(ContextState::Terminated),
            _ => None,
        }
    }

    /// Raw value as used by the foreign side
    pub fn as_raw(self) -> i32 {
        match self {
            ContextState::Unconnected => 0,
            ContextState::Connecting => 1,
            ContextState::Authorizing => 2,
            ContextState::SettingName => 3,
            ContextState::Ready => 4,
            ContextState::Failed => 5,
            ContextState::Terminated => 6,
        }
    }

    /// Whether no further transitions can happen
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ContextState::Ready | ContextState::Failed | ContextState::Terminated
        )
    }
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContextState::Unconnected => "unconnected",
            ContextState::Connecting => "connecting",
            ContextState::Authorizing => "authorizing",
            ContextState::SettingName => "setting-name",
            ContextState::Ready => "ready",
            ContextState::Failed => "failed",
            ContextState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Identifier of an in-flight foreign request, released once it completes
pub type RequestToken = u64;

/// Every asynchronous request the bridge knows how to issue
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Change the client name shown by the server
    SetName(String),
    /// Fetch the single server-info record
    ServerInfo,
    /// List all sinks
    SinkInfoList,
    /// Fetch one sink by index
    SinkInfo(u32),
    /// List all sources
    SourceInfoList,
    /// Fetch one source by index
    SourceInfo(u32),
    /// List all sink inputs
    SinkInputInfoList,
    /// Fetch one sink input by index
    SinkInputInfo(u32),
    /// List all loaded modules
    ModuleInfoList,
    /// Fetch one module by index
    ModuleInfo(u32),
    /// List all connected clients
    ClientInfoList,
    /// Set the default sink by name
    SetDefaultSink(String),
    /// Set the default source by name
    SetDefaultSource(String),
    /// Load a module; replies with one payload carrying its index
    LoadModule {
        /// Module name
        name: String,
        /// Module argument string
        argument: String,
    },
    /// Unload a module by index
    UnloadModule(u32),
    /// Set all channels of a sink to one volume step
    SetSinkVolume {
        /// Sink index
        index: u32,
        /// Channel count
        channels: u8,
        /// Volume step
        volume: u32,
    },
    /// Mute or unmute a sink
    SetSinkMute {
        /// Sink index
        index: u32,
        /// Desired mute state
        mute: bool,
    },
    /// Set all channels of a source to one volume step
    SetSourceVolume {
        /// Source index
        index: u32,
        /// Channel count
        channels: u8,
        /// Volume step
        volume: u32,
    },
    /// Mute or unmute a source
    SetSourceMute {
        /// Source index
        index: u32,
        /// Desired mute state
        mute: bool,
    },
    /// Move a sink input to another sink
    MoveSinkInput {
        /// Sink input index
        index: u32,
        /// Destination sink index
        sink: u32,
    },
    /// Subscribe to the server events in the given facility mask
    Subscribe(u32),
    /// Cork (pause) or uncork a stream
    StreamCork {
        /// Stream handle
        stream: Handle,
        /// True to cork, false to uncork
        cork: bool,
    },
    /// Complete once the stream's buffered audio has played
    StreamDrain {
        /// Stream handle
        stream: Handle,
    },
}

impl Request {
    /// Short kebab-case name of the request kind
    pub fn kind(&self) -> &'static str {
        match self {
            Request::SetName(_) => "set-name",
            Request::ServerInfo => "server-info",
            Request::SinkInfoList => "sink-info-list",
            Request::SinkInfo(_) => "sink-info",
            Request::SourceInfoList => "source-info-list",
            Request::SourceInfo(_) => "source-info",
            Request::SinkInputInfoList => "sink-input-info-list",
            Request::SinkInputInfo(_) => "sink-input-info",
            Request::ModuleInfoList => "module-info-list",
            Request::ModuleInfo(_) => "module-info",
            Request::ClientInfoList => "client-info-list",
            Request::SetDefaultSink(_) => "set-default-sink",
            Request::SetDefaultSource(_) => "set-default-source",
            Request::LoadModule { .. } => "load-module",
            Request::UnloadModule(_) => "unload-module",
            Request::SetSinkVolume { .. } => "set-sink-volume",
            Request::SetSinkMute { .. } => "set-sink-mute",
            Request::SetSourceVolume { .. } => "set-source-volume",
            Request::SetSourceMute { .. } => "set-source-mute",
            Request::MoveSinkInput { .. } => "move-sink-input",
            Request::Subscribe(_) => "subscribe",
            Request::StreamCork { .. } => "stream-cork",
            Request::StreamDrain { .. } => "stream-drain",
        }
    }
}

/// The foreign session API
///
/// State changes and request results are not returned from these calls; they
/// arrive later through [`crate::bridge::dispatch`] on the loop thread. All
/// methods must be called with the owning mainloop's lock held.
pub trait Context: Send + Sync {
    /// Start connecting; state changes are reported against `connection`
    ///
    /// Returns false if the attempt could not be started; [`Context::last_error`]
    /// then describes why.
    fn connect(&self, server: Option<&str>, connection: &Handle) -> bool;

    /// Close the session
    fn disconnect(&self);

    /// Query the raw connection state
    fn state(&self) -> i32;

    /// Text of the most recent failure, if any
    fn last_error(&self) -> Option<String>;

    /// Issue a request whose results are reported against `operation`
    ///
    /// Returns `None` if the request was rejected outright.
    fn submit(&self, request: Request, operation: &Handle) -> Option<RequestToken>;

    /// Release the foreign resources held for a finished request
    fn release(&self, token: RequestToken);

    /// Create and connect a playback stream reported against `stream`
    fn stream_connect_playback(
        &self,
        stream: &Handle,
        name: &str,
        spec: &SampleSpec,
        flags: StreamFlags,
    ) -> bool;

    /// Hand audio bytes to a playback stream
    fn stream_write(&self, stream: &Handle, data: &[u8]) -> bool;

    /// Whether a stream is currently corked
    fn stream_is_corked(&self, stream: &Handle) -> bool;

    /// Disconnect a stream
    fn stream_disconnect(&self, stream: &Handle);
}

/// A freshly allocated event loop and session pair
pub struct Session {
    /// The event loop owning the callback thread
    pub mainloop: Arc<dyn Mainloop>,
    /// The session driven by that loop
    pub context: Arc<dyn Context>,
}

/// Allocates sessions against one audio server
pub trait Backend: Send + Sync {
    /// Allocate a loop and session for a client called `name`
    fn session(&self, name: &str) -> Result<Session>;
}
