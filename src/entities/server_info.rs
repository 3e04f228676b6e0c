// ABOUTME: Server information record

use super::FromPayload;
use crate::bridge::{Connection, Payload};
use crate::Result;
use serde::Serialize;

/// Facts about the connected server
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServerInfo {
    /// Default channel count
    pub channels: u8,
    /// Random cookie identifying the server instance
    pub cookie: i64,
    /// Host the daemon runs on
    pub daemon_hostname: String,
    /// User the daemon runs as
    pub daemon_user: String,
    /// Name of the default sink
    pub default_sink_name: String,
    /// Name of the default source
    pub default_source_name: String,
    /// Protocol version of the client library
    pub library_protocol_version: u32,
    /// Server package name
    pub name: String,
    /// Protocol version of the server
    pub protocol_version: u32,
    /// Default sample format
    pub sample_format: String,
    /// Default sample rate
    pub sample_rate: u32,
    /// Address the connection was made to
    pub server_string: String,
    /// Server package version
    pub version: String,
}

impl FromPayload for ServerInfo {
    fn from_payload(payload: &Payload, _conn: &Connection) -> Result<Self> {
        Ok(ServerInfo {
            channels: payload.field("channels")?,
            cookie: payload.field("cookie")?,
            daemon_hostname: payload.field("daemon-hostname")?,
            daemon_user: payload.field("daemon-user")?,
            default_sink_name: payload.field("default-sink-name")?,
            default_source_name: payload.field("default-source-name")?,
            library_protocol_version: payload.field("library-protocol-version")?,
            name: payload.field("server-name")?,
            protocol_version: payload.field("server-protocol-version")?,
            sample_format: payload.field("sample-format")?,
            sample_rate: payload.field("sample-rate")?,
            server_string: payload.field("server-string")?,
            version: payload.field("server-version")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::error::Error;
    use crate::loopback::LoopbackServer;

    #[test]
    fn test_wrong_type_is_field_error() {
        let conn = Connection::connect(&LoopbackServer::new(), ClientConfig::new("info-test")).unwrap();

        let mut payload = Payload::new();
        payload.set_property("server-name", "pulseaudio", None);
        payload.set_property("channels", "stereo", Some("int"));

        match ServerInfo::from_payload(&payload, &conn) {
            Err(Error::Field { key, .. }) => assert_eq!(key, "channels"),
            other => panic!("expected field error, got {:?}", other),
        }
        conn.disconnect();
    }
}
