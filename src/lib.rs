// ABOUTME: Main library entry point for pulsebridge
// ABOUTME: Exports the callback bridge, sound-server entities, streams and the loopback server

//! # pulsebridge
//!
//! Blocking, thread-safe client calls on top of an asynchronous, callback-driven
//! sound-server session API.
//!
//! The foreign side runs its own event loop and reports results through
//! callbacks carrying opaque string handles. The [`bridge`] module turns those
//! callbacks into synchronous [`Result`]-returning calls; [`entities`] maps the
//! returned records onto typed values.
//!
//! ## Features
//!
//! - **Bridge**: handle registry, connection lock, operations with timeouts
//! - **Entities**: server info, sinks, sources, sink inputs, modules, clients
//! - **Streams**: playback streams fed from any `Read` source
//! - **Loopback**: an in-process server for tests and the CLI
//!
//! ## Example: Listing sinks
//!
//! ```no_run
//! use pulsebridge::{ClientConfig, Connection, Filter, LoopbackServer};
//!
//! fn main() -> pulsebridge::Result<()> {
//!     let server = LoopbackServer::new();
//!     let conn = Connection::connect(&server, ClientConfig::new("lister"))?;
//!
//!     for sink in conn.sinks(&Filter::default())? {
//!         println!("{} ({})", sink.info.name, sink.state);
//!     }
//!
//!     conn.disconnect();
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

/// Callback bridge between the foreign event loop and blocking callers
pub mod bridge;
/// Command-line argument handling for the `pulse` binary
pub mod cli;
/// Client configuration
pub mod config;
/// Typed server objects
pub mod entities;
/// Field filters over serialized entities
pub mod filter;
/// In-process sound server
pub mod loopback;
/// Playback streams
pub mod stream;
/// Server event subscriptions
pub mod subscription;

pub use bridge::{Connection, Operation, Payload, Request, Value};
pub use config::ClientConfig;
pub use entities::{ClientInfo, Module, ServerInfo, Sink, SinkInput, Source, VolumeControl};
pub use filter::Filter;
pub use loopback::LoopbackServer;
pub use stream::{play, SampleFormat, SampleSpec, Stream, StreamFlags};
pub use subscription::EventType;

/// Result type for pulsebridge operations
pub type Result<T> = std::result::Result<T, error::Error>;

/// Error types for pulsebridge
pub mod error {
    use std::time::Duration;
    use thiserror::Error;

    /// Error types for pulsebridge operations
    #[derive(Error, Debug)]
    pub enum Error {
        /// The event loop or session could not be set up
        #[error("Setup error: {0}")]
        Setup(String),

        /// The server reported a failure while connecting
        #[error("Connection failed: {0}")]
        Connect(String),

        /// The session ended before it became ready
        #[error("connection was terminated during setup")]
        Terminated,

        /// The session reported a state outside the known set
        #[error("unknown connection state {0} during setup")]
        UnknownState(i32),

        /// The server signaled failure for a request
        #[error("Operation failed: {0}")]
        Operation(String),

        /// No completion arrived within the configured duration
        #[error("operation timed out after {0:?}")]
        Timeout(Duration),

        /// A call that needs a record received none
        #[error("{0} completed without retrieving any data")]
        NoData(&'static str),

        /// A call received the wrong number of records
        #[error("expected {expected} payload(s), got {got}")]
        PayloadCount {
            /// Number of payloads the call needs
            expected: usize,
            /// Number of payloads received
            got: usize,
        },

        /// A record field had the wrong type
        #[error("invalid field '{key}': {reason}")]
        Field {
            /// Property key
            key: String,
            /// What was wrong with it
            reason: String,
        },

        /// The connection lock was misused
        #[error("Lock error: {0}")]
        Lock(String),

        /// Stream setup or transport failure
        #[error("Stream error: {0}")]
        Stream(String),

        /// I/O error
        #[error("IO error: {0}")]
        Io(#[from] std::io::Error),
    }
}
