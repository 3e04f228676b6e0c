// ABOUTME: Server event subscriptions
// ABOUTME: Event facility masks and delivery of events to a per-connection channel

use crate::bridge::{Connection, Request};
use crate::Result;
use crossbeam::channel::{self, Receiver};
use serde::Serialize;
use std::fmt;

/// Kind of server object an event refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    /// Sink events
    Sink,
    /// Source events
    Source,
    /// Sink input events
    SinkInput,
    /// Source output events
    SourceOutput,
    /// Module events
    Module,
    /// Client events
    Client,
    /// Sample cache events
    SampleCache,
    /// Other global server changes
    Server,
    /// Card events
    Card,
}

/// Mask selecting every event facility
pub const ALL_EVENTS: u32 = 0x02ff;

const EVENT_TYPES: [EventType; 9] = [
    EventType::Sink,
    EventType::Source,
    EventType::SinkInput,
    EventType::SourceOutput,
    EventType::Module,
    EventType::Client,
    EventType::SampleCache,
    EventType::Server,
    EventType::Card,
];

impl EventType {
    /// Bit of this facility in a subscription mask
    pub fn mask(self) -> u32 {
        match self {
            EventType::Sink => 0x0001,
            EventType::Source => 0x0002,
            EventType::SinkInput => 0x0004,
            EventType::SourceOutput => 0x0008,
            EventType::Module => 0x0010,
            EventType::Client => 0x0020,
            EventType::SampleCache => 0x0040,
            EventType::Server => 0x0080,
            EventType::Card => 0x0200,
        }
    }

    /// Combine several facilities into one mask; an empty list means all of them
    pub fn combine(types: &[EventType]) -> u32 {
        if types.is_empty() {
            ALL_EVENTS
        } else {
            types.iter().fold(0, |mask, t| mask | t.mask())
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventType::Sink => "sink",
            EventType::Source => "source",
            EventType::SinkInput => "sink-input",
            EventType::SourceOutput => "source-output",
            EventType::Module => "module",
            EventType::Client => "client",
            EventType::SampleCache => "sample-cache",
            EventType::Server => "server",
            EventType::Card => "card",
        };
        f.write_str(name)
    }
}

/// Every facility whose bit is set in `mask`
pub fn extract_events(mask: u32) -> Vec<EventType> {
    EVENT_TYPES
        .iter()
        .copied()
        .filter(|t| mask & t.mask() == t.mask())
        .collect()
}

impl Connection {
    /// Subscribe to server events of the given kinds (all kinds if empty)
    ///
    /// Replaces any earlier subscription on this connection. Events are
    /// delivered on the returned channel from the event-loop thread.
    pub fn subscribe(&self, types: &[EventType]) -> Result<Receiver<EventType>> {
        let (tx, rx) = channel::unbounded();
        self.set_subscriber(Some(tx));

        let mut operation = self.new_operation();
        let result = operation
            .submit(Request::Subscribe(EventType::combine(types)))
            .and_then(|_| operation.wait());
        operation.destroy();

        match result {
            Ok(()) => Ok(rx),
            Err(e) => {
                self.set_subscriber(None);
                Err(e)
            }
        }
    }
}
