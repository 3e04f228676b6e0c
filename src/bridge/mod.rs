// ABOUTME: Asynchronous-to-synchronous bridge over a callback-driven event loop
// ABOUTME: Handle registry, connection, operation/payload protocol, and callback dispatch

mod connection;
mod context;
pub mod dispatch;
mod handle;
mod mainloop;
mod operation;
mod payload;

pub use connection::Connection;
pub use context::{Backend, Context, ContextState, Request, RequestToken, Session};
pub use handle::{live_handles, Handle, Registry};
pub use mainloop::{Job, Mainloop, ThreadedMainloop};
pub use operation::{first_payload, single_payload, Operation, DEFAULT_OPERATION_TIMEOUT_MSEC};
pub use payload::{FromValue, Payload, PropertyType, Value};

pub(crate) use connection::ConnectionInner;
pub(crate) use handle::{register, unregister, Registered};
