// ABOUTME: Entry points invoked by the foreign event loop when results arrive
// ABOUTME: Each resolves a handle, mutates the matching object, and signals the owning connection

//! Callback dispatch.
//!
//! Every function here runs synchronously on the event-loop thread with the
//! loop lock held. A handle that no longer resolves is silently ignored: the
//! caller may already have released the object while the foreign side still
//! had the callback in flight. A handle that resolves to the wrong kind of
//! object can only come from an internal bug and panics.

use crate::bridge::connection::ConnectionInner;
use crate::bridge::handle::{self, Registered};
use crate::bridge::operation::OperationInner;
use crate::stream::StreamInner;
use crate::subscription::extract_events;
use std::sync::Arc;

fn resolve(handle: &str, entry: &str) -> Option<Registered> {
    let object = handle::get(handle);
    if object.is_none() {
        log::trace!("{}: handle {} is no longer registered, ignoring", entry, handle);
    }
    object
}

fn connection(handle: &str, entry: &str) -> Option<Arc<ConnectionInner>> {
    match resolve(handle, entry)? {
        Registered::Connection(conn) => Some(conn),
        other => panic!(
            "{}: handle {} resolved to a {} where a connection was expected",
            entry,
            handle,
            other.kind()
        ),
    }
}

fn operation(handle: &str, entry: &str) -> Option<Arc<OperationInner>> {
    match resolve(handle, entry)? {
        Registered::Operation(op) => Some(op),
        other => panic!(
            "{}: handle {} resolved to a {} where an operation was expected",
            entry,
            handle,
            other.kind()
        ),
    }
}

fn stream(handle: &str, entry: &str) -> Option<Arc<StreamInner>> {
    match resolve(handle, entry)? {
        Registered::Stream(stream) => Some(stream),
        other => panic!(
            "{}: handle {} resolved to a {} where a stream was expected",
            entry,
            handle,
            other.kind()
        ),
    }
}

/// The connection's session state changed
pub fn connection_state_changed(handle: &str) {
    if let Some(conn) = connection(handle, "connection_state_changed") {
        conn.state_changed();
        conn.signal_all();
    }
}

/// The foreign side started emitting a new record for an operation
pub fn operation_payload_began(handle: &str) {
    if let Some(op) = operation(handle, "operation_payload_began") {
        if op.begin_payload().is_none() {
            log::trace!("Operation {} already finished, payload dropped", handle);
        }
    }
}

/// One key/value pair for the operation's current record
///
/// `hint` names the target type (`bool`, `int`, `float`, `time`); values that
/// do not parse are kept as strings.
pub fn operation_property_set(handle: &str, key: &str, value: &str, hint: Option<&str>) {
    if let Some(op) = operation(handle, "operation_property_set") {
        if !op.set_property(key, value, hint) {
            log::trace!("Operation {} already finished, property '{}' dropped", handle, key);
        }
    }
}

/// Raw bytes for the operation's current record
pub fn operation_data_appended(handle: &str, data: &[u8]) {
    if let Some(op) = operation(handle, "operation_data_appended") {
        if !op.append_data(data) {
            log::trace!("Operation {} already finished, {} bytes dropped", handle, data.len());
        }
    }
}

/// The operation finished successfully
pub fn operation_completed(handle: &str) {
    if let Some(op) = operation(handle, "operation_completed") {
        if !op.finish(None) {
            log::debug!("Operation {} completed after it had already finished", handle);
        }
    }
}

/// The operation failed; a missing or empty message becomes "unknown error"
pub fn operation_failed(handle: &str, message: Option<&str>) {
    if let Some(op) = operation(handle, "operation_failed") {
        let message = match message {
            Some(msg) if !msg.is_empty() => msg.to_string(),
            _ => "unknown error".to_string(),
        };
        if !op.finish(Some(message)) {
            log::debug!("Operation {} failed after it had already finished", handle);
        }
    }
}

/// A stream's state changed; `message` carries failure text if any
pub fn stream_state_changed(handle: &str, state: i32, message: Option<&str>) {
    if let Some(stream) = stream(handle, "stream_state_changed") {
        stream.state_changed(state, message);
        stream.connection.signal_all();
    }
}

/// The server wants up to `length` more bytes for a playback stream
///
/// Reads once from the stream's source and hands whatever it got to the
/// foreign side before returning.
pub fn stream_write_requested(handle: &str, length: usize) {
    if let Some(stream) = stream(handle, "stream_write_requested") {
        stream.fill(length);
    }
}

/// A subscribed server event occurred
pub fn subscription_event(handle: &str, facility_mask: u32, index: u32) {
    if let Some(conn) = connection(handle, "subscription_event") {
        for event in extract_events(facility_mask) {
            log::trace!("Event {} on object {}", event, index);
            conn.publish(event);
        }
        conn.signal_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::connection::Connection;
    use crate::config::ClientConfig;
    use crate::loopback::LoopbackServer;

    #[test]
    fn test_unknown_handles_are_ignored() {
        let stray = crate::bridge::handle::Handle::new();
        let id = stray.as_str();

        connection_state_changed(id);
        operation_payload_began(id);
        operation_property_set(id, "k", "v", None);
        operation_data_appended(id, b"xyz");
        operation_completed(id);
        operation_failed(id, None);
        stream_state_changed(id, 2, None);
        stream_write_requested(id, 1024);
        subscription_event(id, 0x1, 0);
    }

    #[test]
    #[should_panic(expected = "where an operation was expected")]
    fn test_wrong_kind_panics() {
        let conn = Connection::connect(&LoopbackServer::new(), ClientConfig::new("dispatch-test")).unwrap();
        operation_completed(conn.handle().as_str());
    }

    #[test]
    fn test_failed_without_message_defaults() {
        let conn = Connection::connect(&LoopbackServer::new(), ClientConfig::new("dispatch-test")).unwrap();
        let mut op = conn.new_operation();
        operation_failed(op.handle().as_str(), Some(""));

        match op.wait() {
            Err(crate::error::Error::Operation(msg)) => assert_eq!(msg, "unknown error"),
            other => panic!("expected operation error, got {:?}", other),
        }
        op.destroy();
        conn.disconnect();
    }
}
