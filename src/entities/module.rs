// ABOUTME: Server modules: drivers, protocols and other loadable functionality

use super::FromPayload;
use crate::bridge::{first_payload, single_payload, Connection, Payload, Request};
use crate::error::Error;
use crate::Result;
use serde::Serialize;

/// A server module, loaded or not
#[derive(Debug, Clone, Serialize)]
pub struct Module {
    /// Server-side index; `None` while the module is not loaded
    pub index: Option<u32>,
    /// Module name, e.g. `module-null-sink`
    pub name: String,
    /// Argument string passed at load time
    pub argument: String,
    #[serde(skip)]
    conn: Connection,
}

impl FromPayload for Module {
    fn from_payload(payload: &Payload, conn: &Connection) -> Result<Self> {
        Ok(Module {
            index: payload.optional_field("index")?,
            name: payload.field("name")?,
            argument: payload.field("argument")?,
            conn: conn.clone(),
        })
    }
}

impl Module {
    /// Describe a module that has not been loaded yet
    pub fn new(conn: &Connection, name: &str, argument: &str) -> Self {
        Module {
            index: None,
            name: name.to_string(),
            argument: argument.to_string(),
            conn: conn.clone(),
        }
    }

    /// Whether the module is currently loaded
    pub fn is_loaded(&self) -> bool {
        self.index.is_some()
    }

    /// Re-fetch this module from the server
    pub fn refresh(&mut self) -> Result<()> {
        let index = self.loaded_index()?;
        let payload = single_payload(self.conn.request(Request::ModuleInfo(index))?)?;
        *self = Module::from_payload(&payload, &self.conn)?;
        Ok(())
    }

    /// Load the module with its argument string
    pub fn load(&mut self) -> Result<()> {
        let payload = first_payload(
            self.conn.request(Request::LoadModule {
                name: self.name.clone(),
                argument: self.argument.clone(),
            })?,
            "load_module",
        )?;
        let index: u32 = payload.field("index")?;
        log::info!("Loaded module '{}' as #{}", self.name, index);
        self.index = Some(index);
        Ok(())
    }

    /// Unload the module; fails if it is not loaded
    pub fn unload(&mut self) -> Result<()> {
        let index = self.loaded_index()?;
        self.conn.request(Request::UnloadModule(index))?;
        self.index = None;
        Ok(())
    }

    fn loaded_index(&self) -> Result<u32> {
        self.index
            .ok_or_else(|| Error::Operation(format!("the '{}' module is already unloaded", self.name)))
    }
}
