// ABOUTME: Typed server objects built from operation payloads
// ABOUTME: Server info, sinks, sources, sink inputs, modules and clients, plus the connection-level calls returning them

mod client;
mod device;
mod module;
mod server_info;
mod sink_input;

pub use client::ClientInfo;
pub use device::{DeviceInfo, Sink, SinkState, Source, SourceState, VolumeControl};
pub use module::Module;
pub use server_info::ServerInfo;
pub use sink_input::SinkInput;

use crate::bridge::{first_payload, Connection, Payload, Request, Value};
use crate::error::Error;
use crate::filter::Filter;
use crate::Result;
use serde::Serialize;
use std::collections::BTreeMap;

/// Build a value from one payload record
///
/// Implementations reject values of the wrong type with [`Error::Field`];
/// missing keys fall back to defaults.
pub trait FromPayload: Sized {
    /// Map the payload's properties onto the type
    fn from_payload(payload: &Payload, conn: &Connection) -> Result<Self>;
}

/// Extra `properties.*` entries of a record, keyed without the prefix
pub(crate) fn extra_properties(payload: &Payload) -> BTreeMap<String, Value> {
    payload
        .prefixed("properties.")
        .into_iter()
        .map(|(k, v)| (k, v.clone()))
        .collect()
}

fn list<T>(conn: &Connection, request: Request, filter: &Filter) -> Result<Vec<T>>
where
    T: FromPayload + Serialize,
{
    let kind = request.kind();
    let items = conn
        .request(request)?
        .iter()
        .map(|payload| T::from_payload(payload, conn))
        .collect::<Result<Vec<T>>>()?;

    let total = items.len();
    let matched: Vec<T> = items.into_iter().filter(|item| filter.is_match(item)).collect();
    if !filter.is_empty() {
        log::debug!("{}: {} of {} records matched '{}'", kind, matched.len(), total, filter);
    }
    Ok(matched)
}

impl Connection {
    /// Issue `request` as one operation and wait for its payloads
    pub fn request(&self, request: Request) -> Result<Vec<Payload>> {
        let mut operation = self.new_operation();
        operation.submit(request)?;
        let payloads = operation.wait_success(Ok);
        operation.destroy();
        payloads
    }

    /// Change the client name the server shows for this connection
    pub fn set_name(&self, name: &str) -> Result<()> {
        self.request(Request::SetName(name.to_string()))?;
        Ok(())
    }

    /// Information about the connected server
    pub fn server_info(&self) -> Result<ServerInfo> {
        let payload = first_payload(self.request(Request::ServerInfo)?, "server_info")?;
        ServerInfo::from_payload(&payload, self)
    }

    /// All sinks matching `filter`
    pub fn sinks(&self, filter: &Filter) -> Result<Vec<Sink>> {
        list(self, Request::SinkInfoList, filter)
    }

    /// All sources matching `filter`
    pub fn sources(&self, filter: &Filter) -> Result<Vec<Source>> {
        list(self, Request::SourceInfoList, filter)
    }

    /// All sink inputs matching `filter`
    pub fn sink_inputs(&self, filter: &Filter) -> Result<Vec<SinkInput>> {
        list(self, Request::SinkInputInfoList, filter)
    }

    /// All loaded modules matching `filter`
    pub fn modules(&self, filter: &Filter) -> Result<Vec<Module>> {
        list(self, Request::ModuleInfoList, filter)
    }

    /// All connected clients matching `filter`
    pub fn clients(&self, filter: &Filter) -> Result<Vec<ClientInfo>> {
        list(self, Request::ClientInfoList, filter)
    }

    /// Load a module by name
    ///
    /// A module that reports "initialization failed" (typically because it is
    /// already loaded) is not treated as an error.
    pub fn load_module(&self, name: &str, argument: &str) -> Result<()> {
        let mut module = Module::new(self, name, argument);
        match module.load() {
            Ok(()) => Ok(()),
            Err(Error::Operation(msg)) if msg.contains("initialization failed") => {
                log::debug!("Module '{}' did not initialize: {}", name, msg);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Make the named sink the server default
    pub fn set_default_sink(&self, name: &str) -> Result<()> {
        self.request(Request::SetDefaultSink(name.to_string()))?;
        Ok(())
    }

    /// Make the named source the server default
    pub fn set_default_source(&self, name: &str) -> Result<()> {
        self.request(Request::SetDefaultSource(name.to_string()))?;
        Ok(())
    }
}
