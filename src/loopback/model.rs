// ABOUTME: In-memory server state for the loopback backend
// ABOUTME: Sinks, sources, sink inputs, modules and clients, rendered as property records

use crate::bridge::Request;
use crate::subscription::EventType;
use std::collections::HashMap;

/// Volume step representing 100%
pub const VOLUME_NORM: u32 = 0x10000;

const NO_SUCH_ENTITY: &str = "No such entity";
const INIT_FAILED: &str = "Module initialization failed";

/// One property as the server reports it: key, raw text, optional type hint
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Property {
    pub key: String,
    pub value: String,
    pub hint: Option<&'static str>,
}

/// One record of properties
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Record(pub Vec<Property>);

impl Record {
    fn text(mut self, key: &str, value: impl Into<String>) -> Self {
        self.0.push(Property {
            key: key.to_string(),
            value: value.into(),
            hint: None,
        });
        self
    }

    fn typed(mut self, key: &str, value: impl ToString, hint: &'static str) -> Self {
        self.0.push(Property {
            key: key.to_string(),
            value: value.to_string(),
            hint: Some(hint),
        });
        self
    }

    fn int(self, key: &str, value: impl ToString) -> Self {
        self.typed(key, value, "int")
    }

    fn flag(self, key: &str, value: bool) -> Self {
        self.typed(key, value, "bool")
    }

    fn extras(mut self, properties: &[(String, String)]) -> Self {
        for (k, v) in properties {
            self = self.text(&format!("properties.{}", k), v.clone());
        }
        self
    }
}

/// Result of applying a request to the model
#[derive(Debug, Default)]
pub(crate) struct Reply {
    pub records: Vec<Record>,
    /// (facility mask, object index) pairs describing what changed
    pub events: Vec<(u32, u32)>,
}

impl Reply {
    fn records(records: Vec<Record>) -> Self {
        Reply {
            records,
            events: Vec::new(),
        }
    }

    fn event(event: EventType, index: u32) -> Self {
        Reply {
            records: Vec::new(),
            events: vec![(event.mask(), index)],
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Device {
    pub index: u32,
    pub name: String,
    pub description: String,
    pub driver: String,
    pub module_index: u32,
    pub card_index: Option<u32>,
    pub channels: u8,
    pub volume: u32,
    pub muted: bool,
    pub state: i32,
    /// For sinks the monitor source, for sources the sink being monitored
    pub monitor: Option<(u32, String)>,
    pub properties: Vec<(String, String)>,
}

impl Device {
    fn record(&self, monitor_prefix: &str) -> Record {
        let mut record = Record::default()
            .int("index", self.index)
            .text("name", &self.name)
            .text("description", &self.description)
            .text("driver-name", &self.driver)
            .int("module-index", self.module_index)
            .int("channels", self.channels)
            .int("num-volume-steps", VOLUME_NORM)
            .int("base-volume-step", VOLUME_NORM)
            .int("current-volume-step", self.volume)
            .typed("volume-factor", self.volume as f64 / VOLUME_NORM as f64, "float")
            .flag("muted", self.muted)
            .int("state", self.state)
            .int("num-ports", 1);
        if let Some(card) = self.card_index {
            record = record.int("card-index", card);
        }
        if let Some((index, name)) = &self.monitor {
            record = record
                .int(&format!("{}-index", monitor_prefix), index)
                .text(&format!("{}-name", monitor_prefix), name.clone());
        }
        record.extras(&self.properties)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct SinkInputEntry {
    pub index: u32,
    pub name: String,
    pub sink: u32,
    pub module_index: Option<u32>,
    pub client: u32,
    pub muted: bool,
}

impl SinkInputEntry {
    fn record(&self) -> Record {
        let mut record = Record::default()
            .int("index", self.index)
            .text("name", &self.name)
            .int("sink-index", self.sink)
            .int("client-index", self.client)
            .flag("muted", self.muted);
        if let Some(module) = self.module_index {
            record = record.int("module-index", module);
        }
        record
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ModuleEntry {
    pub index: u32,
    pub name: String,
    pub argument: String,
}

impl ModuleEntry {
    fn record(&self) -> Record {
        Record::default()
            .int("index", self.index)
            .text("name", &self.name)
            .text("argument", &self.argument)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ClientEntry {
    pub index: u32,
    pub name: String,
    pub driver: String,
    pub module_index: u32,
    pub properties: Vec<(String, String)>,
}

impl ClientEntry {
    fn record(&self) -> Record {
        Record::default()
            .int("index", self.index)
            .text("name", &self.name)
            .text("driver-name", &self.driver)
            .int("module-index", self.module_index)
            .extras(&self.properties)
    }
}

/// The whole simulated server
#[derive(Debug)]
pub(crate) struct Model {
    pub server_name: String,
    pub version: String,
    pub user: String,
    pub hostname: String,
    pub cookie: u32,
    pub default_sink: String,
    pub default_source: String,
    pub sinks: Vec<Device>,
    pub sources: Vec<Device>,
    pub sink_inputs: Vec<SinkInputEntry>,
    pub modules: Vec<ModuleEntry>,
    pub clients: Vec<ClientEntry>,
    /// Bytes received per playback stream name
    pub played: HashMap<String, usize>,
    next_module: u32,
    next_sink_input: u32,
    next_client: u32,
}

fn props(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

impl Default for Model {
    fn default() -> Self {
        Model::fixture()
    }
}

impl Model {
    /// A small machine: one sound card, a null sink and a music player
    pub fn fixture() -> Self {
        let analog = "alsa_output.pci-0000_00_1f.3.analog-stereo";
        let mic = "alsa_input.pci-0000_00_1f.3.analog-stereo";

        Model {
            server_name: "pulseaudio".to_string(),
            version: "16.1".to_string(),
            user: "pulse".to_string(),
            hostname: "loopback".to_string(),
            cookie: 0x5eed_cafe,
            default_sink: analog.to_string(),
            default_source: mic.to_string(),
            sinks: vec![
                Device {
                    index: 0,
                    name: analog.to_string(),
                    description: "Built-in Audio Analog Stereo".to_string(),
                    driver: "module-alsa-card.c".to_string(),
                    module_index: 0,
                    card_index: Some(0),
                    channels: 2,
                    volume: 39322,
                    muted: false,
                    state: 1,
                    monitor: Some((0, format!("{}.monitor", analog))),
                    properties: props(&[("device.class", "sound"), ("device.bus", "pci")]),
                },
                Device {
                    index: 1,
                    name: "null".to_string(),
                    description: "Null Output".to_string(),
                    driver: "module-null-sink.c".to_string(),
                    module_index: 2,
                    card_index: None,
                    channels: 2,
                    volume: VOLUME_NORM,
                    muted: false,
                    state: 2,
                    monitor: Some((2, "null.monitor".to_string())),
                    properties: props(&[("device.class", "abstract")]),
                },
            ],
            sources: vec![
                Device {
                    index: 0,
                    name: format!("{}.monitor", analog),
                    description: "Monitor of Built-in Audio Analog Stereo".to_string(),
                    driver: "module-alsa-card.c".to_string(),
                    module_index: 0,
                    card_index: Some(0),
                    channels: 2,
                    volume: VOLUME_NORM,
                    muted: false,
                    state: 1,
                    monitor: Some((0, analog.to_string())),
                    properties: props(&[("device.class", "monitor")]),
                },
                Device {
                    index: 1,
                    name: mic.to_string(),
                    description: "Built-in Audio Analog Stereo".to_string(),
                    driver: "module-alsa-card.c".to_string(),
                    module_index: 0,
                    card_index: Some(0),
                    channels: 2,
                    volume: 52429,
                    muted: true,
                    state: 2,
                    monitor: None,
                    properties: props(&[("device.class", "sound"), ("device.bus", "pci")]),
                },
                Device {
                    index: 2,
                    name: "null.monitor".to_string(),
                    description: "Monitor of Null Output".to_string(),
                    driver: "module-null-sink.c".to_string(),
                    module_index: 2,
                    card_index: None,
                    channels: 2,
                    volume: VOLUME_NORM,
                    muted: false,
                    state: 2,
                    monitor: Some((1, "null".to_string())),
                    properties: props(&[("device.class", "monitor")]),
                },
            ],
            sink_inputs: vec![SinkInputEntry {
                index: 0,
                name: "Music Player".to_string(),
                sink: 0,
                module_index: None,
                client: 0,
                muted: false,
            }],
            modules: vec![
                ModuleEntry {
                    index: 0,
                    name: "module-alsa-card".to_string(),
                    argument: "device_id=\"0\"".to_string(),
                },
                ModuleEntry {
                    index: 1,
                    name: "module-native-protocol-unix".to_string(),
                    argument: String::new(),
                },
                ModuleEntry {
                    index: 2,
                    name: "module-null-sink".to_string(),
                    argument: "sink_name=null".to_string(),
                },
            ],
            clients: vec![ClientEntry {
                index: 0,
                name: "music-player".to_string(),
                driver: "protocol-native.c".to_string(),
                module_index: 1,
                properties: props(&[("application.name", "music-player"), ("application.process.id", "4242")]),
            }],
            played: HashMap::new(),
            next_module: 3,
            next_sink_input: 1,
            next_client: 1,
        }
    }

    fn server_info(&self, server: &str) -> Record {
        Record::default()
            .text("server-string", server)
            .text("daemon-user", &self.user)
            .text("daemon-hostname", &self.hostname)
            .text("server-version", &self.version)
            .text("server-name", &self.server_name)
            .text("default-sink-name", &self.default_sink)
            .text("default-source-name", &self.default_source)
            .text("sample-format", "s16le")
            .int("server-protocol-version", 35)
            .int("library-protocol-version", 35)
            .int("cookie", self.cookie)
            .int("sample-rate", 44100)
            .int("channels", 2)
    }

    pub fn add_client(&mut self, name: &str) -> u32 {
        let index = self.next_client;
        self.next_client += 1;
        self.clients.push(ClientEntry {
            index,
            name: name.to_string(),
            driver: "protocol-native.c".to_string(),
            module_index: 1,
            properties: props(&[("application.name", name)]),
        });
        index
    }

    pub fn remove_client(&mut self, index: u32) {
        self.clients.retain(|c| c.index != index);
        self.sink_inputs.retain(|s| s.client != index);
    }

    pub fn add_sink_input(&mut self, name: &str, client: u32) -> u32 {
        let index = self.next_sink_input;
        self.next_sink_input += 1;
        let sink = self
            .sinks
            .iter()
            .find(|s| s.name == self.default_sink)
            .map_or(0, |s| s.index);
        self.sink_inputs.push(SinkInputEntry {
            index,
            name: name.to_string(),
            sink,
            module_index: Some(1),
            client,
            muted: false,
        });
        index
    }

    pub fn remove_sink_input(&mut self, index: u32) {
        self.sink_inputs.retain(|s| s.index != index);
    }

    pub fn record_played(&mut self, stream: &str, bytes: usize) {
        *self.played.entry(stream.to_string()).or_insert(0) += bytes;
    }

    /// Apply one request on behalf of `client`, returning records or an error text
    ///
    /// Stream and subscription requests are session-level and not handled here.
    pub fn apply(&mut self, request: &Request, client: u32, server: &str) -> Result<Reply, String> {
        let missing = || NO_SUCH_ENTITY.to_string();
        match request {
            Request::SetName(name) => {
                let entry = self.clients.iter_mut().find(|c| c.index == client).ok_or_else(missing)?;
                entry.name = name.clone();
                Ok(Reply::event(EventType::Client, client))
            }
            Request::ServerInfo => Ok(Reply::records(vec![self.server_info(server)])),
            Request::SinkInfoList => Ok(Reply::records(
                self.sinks.iter().map(|s| s.record("monitor-source")).collect(),
            )),
            Request::SinkInfo(index) => {
                let sink = self.sinks.iter().find(|s| s.index == *index).ok_or_else(missing)?;
                Ok(Reply::records(vec![sink.record("monitor-source")]))
            }
            Request::SourceInfoList => Ok(Reply::records(
                self.sources.iter().map(|s| s.record("monitor-of-sink")).collect(),
            )),
            Request::SourceInfo(index) => {
                let source = self.sources.iter().find(|s| s.index == *index).ok_or_else(missing)?;
                Ok(Reply::records(vec![source.record("monitor-of-sink")]))
            }
            Request::SinkInputInfoList => Ok(Reply::records(
                self.sink_inputs.iter().map(SinkInputEntry::record).collect(),
            )),
            Request::SinkInputInfo(index) => {
                let input = self.sink_inputs.iter().find(|s| s.index == *index).ok_or_else(missing)?;
                Ok(Reply::records(vec![input.record()]))
            }
            Request::ModuleInfoList => Ok(Reply::records(
                self.modules.iter().map(ModuleEntry::record).collect(),
            )),
            Request::ModuleInfo(index) => {
                let module = self.modules.iter().find(|m| m.index == *index).ok_or_else(missing)?;
                Ok(Reply::records(vec![module.record()]))
            }
            Request::ClientInfoList => Ok(Reply::records(
                self.clients.iter().map(ClientEntry::record).collect(),
            )),
            Request::SetDefaultSink(name) => {
                if !self.sinks.iter().any(|s| &s.name == name) {
                    return Err(missing());
                }
                self.default_sink = name.clone();
                Ok(Reply::event(EventType::Server, u32::MAX))
            }
            Request::SetDefaultSource(name) => {
                if !self.sources.iter().any(|s| &s.name == name) {
                    return Err(missing());
                }
                self.default_source = name.clone();
                Ok(Reply::event(EventType::Server, u32::MAX))
            }
            Request::LoadModule { name, argument } => {
                if !name.starts_with("module-") {
                    return Err(missing());
                }
                if self.modules.iter().any(|m| &m.name == name) {
                    return Err(INIT_FAILED.to_string());
                }
                let index = self.next_module;
                self.next_module += 1;
                self.modules.push(ModuleEntry {
                    index,
                    name: name.clone(),
                    argument: argument.clone(),
                });
                let mut reply = Reply::event(EventType::Module, index);
                reply.records.push(Record::default().int("index", index));
                Ok(reply)
            }
            Request::UnloadModule(index) => {
                let before = self.modules.len();
                self.modules.retain(|m| m.index != *index);
                if self.modules.len() == before {
                    return Err(missing());
                }
                Ok(Reply::event(EventType::Module, *index))
            }
            Request::SetSinkVolume { index, channels, volume } => {
                let sink = self.sinks.iter_mut().find(|s| s.index == *index).ok_or_else(missing)?;
                if *channels != sink.channels {
                    return Err("Invalid argument".to_string());
                }
                sink.volume = *volume;
                Ok(Reply::event(EventType::Sink, *index))
            }
            Request::SetSinkMute { index, mute } => {
                let sink = self.sinks.iter_mut().find(|s| s.index == *index).ok_or_else(missing)?;
                sink.muted = *mute;
                Ok(Reply::event(EventType::Sink, *index))
            }
            Request::SetSourceVolume { index, channels, volume } => {
                let source = self.sources.iter_mut().find(|s| s.index == *index).ok_or_else(missing)?;
                if *channels != source.channels {
                    return Err("Invalid argument".to_string());
                }
                source.volume = *volume;
                Ok(Reply::event(EventType::Source, *index))
            }
            Request::SetSourceMute { index, mute } => {
                let source = self.sources.iter_mut().find(|s| s.index == *index).ok_or_else(missing)?;
                source.muted = *mute;
                Ok(Reply::event(EventType::Source, *index))
            }
            Request::MoveSinkInput { index, sink } => {
                if !self.sinks.iter().any(|s| s.index == *sink) {
                    return Err(missing());
                }
                let input = self.sink_inputs.iter_mut().find(|s| s.index == *index).ok_or_else(missing)?;
                input.sink = *sink;
                Ok(Reply::event(EventType::SinkInput, *index))
            }
            Request::Subscribe(_) | Request::StreamCork { .. } | Request::StreamDrain { .. } => {
                Err(format!("{} is not a server request", request.kind()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value<'a>(record: &'a Record, key: &str) -> Option<&'a str> {
        record.0.iter().find(|p| p.key == key).map(|p| p.value.as_str())
    }

    #[test]
    fn test_fixture_lists() {
        let mut model = Model::fixture();
        let reply = model.apply(&Request::SinkInfoList, 0, "loopback").unwrap();
        assert_eq!(reply.records.len(), 2);
        assert_eq!(value(&reply.records[1], "name"), Some("null"));
        assert_eq!(value(&reply.records[0], "properties.device.bus"), Some("pci"));
        assert!(reply.events.is_empty());
    }

    #[test]
    fn test_load_module_twice_fails_initialization() {
        let mut model = Model::fixture();
        let load = Request::LoadModule {
            name: "module-echo-cancel".into(),
            argument: String::new(),
        };
        let reply = model.apply(&load, 0, "loopback").unwrap();
        assert_eq!(value(&reply.records[0], "index"), Some("3"));
        assert_eq!(reply.events, vec![(EventType::Module.mask(), 3)]);
        assert_eq!(model.apply(&load, 0, "loopback").unwrap_err(), INIT_FAILED);
    }

    #[test]
    fn test_missing_entities() {
        let mut model = Model::fixture();
        assert_eq!(model.apply(&Request::SinkInfo(9), 0, "x").unwrap_err(), NO_SUCH_ENTITY);
        assert_eq!(
            model
                .apply(&Request::MoveSinkInput { index: 0, sink: 7 }, 0, "x")
                .unwrap_err(),
            NO_SUCH_ENTITY
        );
        assert!(model.apply(&Request::UnloadModule(2), 0, "x").is_ok());
        assert!(model.apply(&Request::UnloadModule(2), 0, "x").is_err());
    }

    #[test]
    fn test_client_removal_drops_its_inputs() {
        let mut model = Model::fixture();
        let client = model.add_client("tester");
        model.add_sink_input("tone", client);
        assert_eq!(model.sink_inputs.len(), 2);
        model.remove_client(client);
        assert_eq!(model.sink_inputs.len(), 1);
    }
}
