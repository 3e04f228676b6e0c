// ABOUTME: Clients connected to the server

use super::{extra_properties, FromPayload};
use crate::bridge::{Connection, Payload, Value};
use crate::Result;
use serde::Serialize;
use std::collections::BTreeMap;

/// A program connected to the server
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientInfo {
    /// Server-side index
    pub index: u32,
    /// Client name
    pub name: String,
    /// Protocol driver the client came in through
    pub driver_name: String,
    /// Owning module, if any
    pub module_index: Option<u32>,
    /// Free-form client properties
    pub properties: BTreeMap<String, Value>,
}

impl FromPayload for ClientInfo {
    fn from_payload(payload: &Payload, _conn: &Connection) -> Result<Self> {
        Ok(ClientInfo {
            index: payload.field("index")?,
            name: payload.field("name")?,
            driver_name: payload.field("driver-name")?,
            module_index: payload.optional_field("module-index")?,
            properties: extra_properties(payload),
        })
    }
}
