// ABOUTME: Sink inputs, the server-side ends of client playback streams

use super::FromPayload;
use crate::bridge::{single_payload, Connection, Payload, Request};
use crate::Result;
use serde::Serialize;

/// A client stream connected to one of the sinks
#[derive(Debug, Clone, Serialize)]
pub struct SinkInput {
    /// Server-side index
    pub index: u32,
    /// Stream name
    pub name: String,
    /// Sink the stream plays on
    pub sink_index: u32,
    /// Owning module, if any
    pub module_index: Option<u32>,
    /// Owning client, if any
    pub client_index: Option<u32>,
    /// Whether the stream is muted
    pub muted: bool,
    #[serde(skip)]
    conn: Connection,
}

impl FromPayload for SinkInput {
    fn from_payload(payload: &Payload, conn: &Connection) -> Result<Self> {
        Ok(SinkInput {
            index: payload.field("index")?,
            name: payload.field("name")?,
            sink_index: payload.field("sink-index")?,
            module_index: payload.optional_field("module-index")?,
            client_index: payload.optional_field("client-index")?,
            muted: payload.field("muted")?,
            conn: conn.clone(),
        })
    }
}

impl SinkInput {
    /// Re-fetch this sink input from the server
    pub fn refresh(&mut self) -> Result<()> {
        let payload = single_payload(self.conn.request(Request::SinkInputInfo(self.index))?)?;
        *self = SinkInput::from_payload(&payload, &self.conn)?;
        Ok(())
    }

    /// Move the stream to another sink
    pub fn move_to_sink(&mut self, sink_index: u32) -> Result<()> {
        self.conn.request(Request::MoveSinkInput {
            index: self.index,
            sink: sink_index,
        })?;
        self.refresh()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::error::Error;
    use crate::filter::Filter;
    use crate::loopback::LoopbackServer;

    #[test]
    fn test_move_to_sink() {
        let conn = Connection::connect(&LoopbackServer::new(), ClientConfig::new("input-test")).unwrap();
        let mut input = conn.sink_inputs(&Filter::default()).unwrap().remove(0);
        assert_eq!(input.name, "Music Player");
        assert_eq!(input.sink_index, 0);

        input.move_to_sink(1).unwrap();
        assert_eq!(input.sink_index, 1);

        assert!(matches!(input.move_to_sink(42), Err(Error::Operation(_))));
        assert_eq!(input.sink_index, 1);
        conn.disconnect();
    }
}
