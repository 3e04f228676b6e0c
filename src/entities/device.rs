// ABOUTME: Sinks and sources, the server's audio devices
// ABOUTME: Shared device fields plus volume and mute control through the bridge

use super::{extra_properties, FromPayload};
use crate::bridge::{single_payload, Connection, Payload, Request, Value};
use crate::error::Error;
use crate::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Fields common to sinks and sources
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceInfo {
    /// Server-side index
    pub index: u32,
    /// Unique name
    pub name: String,
    /// Human-readable description
    pub description: String,
    /// Driver that owns the device
    pub driver_name: String,
    /// Owning module
    pub module_index: u32,
    /// Owning card, if any
    pub card_index: Option<u32>,
    /// Channel count
    pub channels: u8,
    /// Volume steps between silence and 100%
    pub num_volume_steps: u32,
    /// Hardware base volume
    pub base_volume_step: u32,
    /// Current volume in steps
    pub current_volume_step: u32,
    /// Current volume as a fraction of 100%
    pub volume_factor: f64,
    /// Whether the device is muted
    pub muted: bool,
    /// Number of ports
    pub num_ports: u32,
    /// Free-form server properties
    pub properties: BTreeMap<String, Value>,
}

impl DeviceInfo {
    fn from_payload(payload: &Payload) -> Result<Self> {
        Ok(DeviceInfo {
            index: payload.field("index")?,
            name: payload.field("name")?,
            description: payload.field("description")?,
            driver_name: payload.field("driver-name")?,
            module_index: payload.field("module-index")?,
            card_index: payload.optional_field("card-index")?,
            channels: payload.field("channels")?,
            num_volume_steps: payload.field("num-volume-steps")?,
            base_volume_step: payload.field("base-volume-step")?,
            current_volume_step: payload.field("current-volume-step")?,
            volume_factor: payload.field("volume-factor")?,
            muted: payload.field("muted")?,
            num_ports: payload.field("num-ports")?,
            properties: extra_properties(payload),
        })
    }

    /// Volume step for a fraction of 100%, never below silence
    pub fn volume_step(&self, factor: f64) -> u32 {
        (self.num_volume_steps as f64 * factor.max(0.0)).round() as u32
    }
}

/// Volume and mute control shared by sinks and sources
///
/// Every mutating call waits for the server to acknowledge, then refreshes
/// the local copy.
pub trait VolumeControl {
    /// Current device fields
    fn device(&self) -> &DeviceInfo;

    /// Connection the device was fetched through
    fn connection(&self) -> &Connection;

    /// Re-fetch this device from the server
    fn refresh(&mut self) -> Result<()>;

    /// Request setting every channel to `volume` steps
    fn volume_request(&self, volume: u32) -> Request;

    /// Request changing the mute state
    fn mute_request(&self, mute: bool) -> Request;

    /// Set all channels to `factor` of 100%
    ///
    /// Factors above 1.0 are accepted but may clip.
    fn set_volume(&mut self, factor: f64) -> Result<()> {
        let device = self.device();
        if device.channels == 0 {
            return Err(Error::Operation(format!(
                "cannot set volume on device {}, no channels defined",
                device.index
            )));
        }
        let request = self.volume_request(device.volume_step(factor));
        self.connection().request(request)?;
        self.refresh()
    }

    /// Raise the volume by `factor`
    fn increase_volume(&mut self, factor: f64) -> Result<()> {
        self.refresh()?;
        let target = self.device().volume_factor + factor;
        self.set_volume(target)
    }

    /// Lower the volume by `factor`, stopping at silence
    fn decrease_volume(&mut self, factor: f64) -> Result<()> {
        self.refresh()?;
        let target = (self.device().volume_factor - factor).max(0.0);
        self.set_volume(target)
    }

    /// Set the mute state explicitly
    fn set_mute(&mut self, mute: bool) -> Result<()> {
        let request = self.mute_request(mute);
        self.connection().request(request)?;
        self.refresh()
    }

    /// Mute the device
    fn mute(&mut self) -> Result<()> {
        self.set_mute(true)
    }

    /// Unmute the device
    fn unmute(&mut self) -> Result<()> {
        self.set_mute(false)
    }

    /// Flip the mute state based on the server's current value
    fn toggle_mute(&mut self) -> Result<()> {
        self.refresh()?;
        let muted = self.device().muted;
        self.set_mute(!muted)
    }
}

/// Run state of a sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SinkState {
    /// Playing
    Running,
    /// Open but idle
    Idle,
    /// Suspended
    Suspended,
    /// Unknown state value
    #[default]
    Invalid,
}

impl SinkState {
    fn from_raw(raw: i64) -> Self {
        match raw {
            0 => SinkState::Running,
            1 => SinkState::Idle,
            2 => SinkState::Suspended,
            _ => SinkState::Invalid,
        }
    }
}

impl fmt::Display for SinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SinkState::Running => "RUNNING",
            SinkState::Idle => "IDLE",
            SinkState::Suspended => "SUSPENDED",
            SinkState::Invalid => "INVALID",
        };
        f.write_str(name)
    }
}

/// Run state of a source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceState {
    /// Recording
    Running,
    /// Open but idle
    Idle,
    /// Suspended
    Suspended,
    /// Unknown state value
    #[default]
    Invalid,
}

impl SourceState {
    fn from_raw(raw: i64) -> Self {
        match raw {
            0 => SourceState::Running,
            1 => SourceState::Idle,
            2 => SourceState::Suspended,
            _ => SourceState::Invalid,
        }
    }
}

impl fmt::Display for SourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SourceState::Running => "RUNNING",
            SourceState::Idle => "IDLE",
            SourceState::Suspended => "SUSPENDED",
            SourceState::Invalid => "INVALID",
        };
        f.write_str(name)
    }
}

fn raw_state(payload: &Payload) -> Result<i64> {
    Ok(payload.optional_field("state")?.unwrap_or(-1))
}

/// An audio output device
#[derive(Debug, Clone, Serialize)]
pub struct Sink {
    /// Device fields
    #[serde(flatten)]
    pub info: DeviceInfo,
    /// Run state
    pub state: SinkState,
    /// Index of the source monitoring this sink
    pub monitor_source_index: Option<u32>,
    /// Name of the source monitoring this sink
    pub monitor_source_name: Option<String>,
    #[serde(skip)]
    conn: Connection,
}

impl FromPayload for Sink {
    fn from_payload(payload: &Payload, conn: &Connection) -> Result<Self> {
        Ok(Sink {
            info: DeviceInfo::from_payload(payload)?,
            state: SinkState::from_raw(raw_state(payload)?),
            monitor_source_index: payload.optional_field("monitor-source-index")?,
            monitor_source_name: payload.optional_field("monitor-source-name")?,
            conn: conn.clone(),
        })
    }
}

impl VolumeControl for Sink {
    fn device(&self) -> &DeviceInfo {
        &self.info
    }

    fn connection(&self) -> &Connection {
        &self.conn
    }

    fn refresh(&mut self) -> Result<()> {
        let payload = single_payload(self.conn.request(Request::SinkInfo(self.info.index))?)?;
        *self = Sink::from_payload(&payload, &self.conn)?;
        Ok(())
    }

    fn volume_request(&self, volume: u32) -> Request {
        Request::SetSinkVolume {
            index: self.info.index,
            channels: self.info.channels,
            volume,
        }
    }

    fn mute_request(&self, mute: bool) -> Request {
        Request::SetSinkMute {
            index: self.info.index,
            mute,
        }
    }
}

/// An audio input device (including monitors of sinks)
#[derive(Debug, Clone, Serialize)]
pub struct Source {
    /// Device fields
    #[serde(flatten)]
    pub info: DeviceInfo,
    /// Run state
    pub state: SourceState,
    /// Index of the sink this source monitors, if it is a monitor
    pub monitor_of_sink_index: Option<u32>,
    /// Name of the sink this source monitors, if it is a monitor
    pub monitor_of_sink_name: Option<String>,
    #[serde(skip)]
    conn: Connection,
}

impl Source {
    /// Whether this source is the monitor of a sink
    pub fn is_monitor(&self) -> bool {
        self.monitor_of_sink_index.is_some()
    }
}

impl FromPayload for Source {
    fn from_payload(payload: &Payload, conn: &Connection) -> Result<Self> {
        Ok(Source {
            info: DeviceInfo::from_payload(payload)?,
            state: SourceState::from_raw(raw_state(payload)?),
            monitor_of_sink_index: payload.optional_field("monitor-of-sink-index")?,
            monitor_of_sink_name: payload.optional_field("monitor-of-sink-name")?,
            conn: conn.clone(),
        })
    }
}

impl VolumeControl for Source {
    fn device(&self) -> &DeviceInfo {
        &self.info
    }

    fn connection(&self) -> &Connection {
        &self.conn
    }

    fn refresh(&mut self) -> Result<()> {
        let payload = single_payload(self.conn.request(Request::SourceInfo(self.info.index))?)?;
        *self = Source::from_payload(&payload, &self.conn)?;
        Ok(())
    }

    fn volume_request(&self, volume: u32) -> Request {
        Request::SetSourceVolume {
            index: self.info.index,
            channels: self.info.channels,
            volume,
        }
    }

    fn mute_request(&self, mute: bool) -> Request {
        Request::SetSourceMute {
            index: self.info.index,
            mute,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::filter::Filter;
    use crate::loopback::{LoopbackServer, VOLUME_NORM};

    fn connect() -> Connection {
        Connection::connect(&LoopbackServer::new(), ClientConfig::new("device-test")).unwrap()
    }

    #[test]
    fn test_sinks_map_fields() {
        let conn = connect();
        let sinks = conn.sinks(&Filter::default()).unwrap();
        assert_eq!(sinks.len(), 2);

        let analog = &sinks[0];
        assert_eq!(analog.info.channels, 2);
        assert_eq!(analog.info.num_volume_steps, VOLUME_NORM);
        assert_eq!(analog.state, SinkState::Idle);
        assert_eq!(analog.monitor_source_index, Some(0));
        assert_eq!(
            analog.info.properties.get("device.bus"),
            Some(&Value::String("pci".to_string()))
        );
        assert_eq!(sinks[1].info.card_index, None);
        conn.disconnect();
    }

    #[test]
    fn test_volume_round_trip_and_floor() {
        let conn = connect();
        let mut sink = conn.sinks(&Filter::new(["name/null"])).unwrap().remove(0);

        sink.set_volume(0.5).unwrap();
        assert_eq!(sink.info.current_volume_step, VOLUME_NORM / 2);

        sink.increase_volume(0.25).unwrap();
        assert!((sink.info.volume_factor - 0.75).abs() < 1e-4);

        sink.decrease_volume(5.0).unwrap();
        assert_eq!(sink.info.current_volume_step, 0);
        conn.disconnect();
    }

    #[test]
    fn test_source_mute_toggle() {
        let conn = connect();
        let mut mic = conn
            .sources(&Filter::new(["name/contains:alsa_input"]))
            .unwrap()
            .remove(0);
        assert!(!mic.is_monitor());
        assert_eq!(mic.state, SourceState::Suspended);
        assert!(mic.info.muted);

        mic.toggle_mute().unwrap();
        assert!(!mic.info.muted);
        mic.mute().unwrap();
        assert!(mic.info.muted);
        conn.disconnect();
    }

    #[test]
    fn test_refresh_of_vanished_device_fails() {
        let conn = connect();
        let mut sink = conn.sinks(&Filter::default()).unwrap().remove(0);
        sink.info.index = 77;
        assert!(matches!(sink.refresh(), Err(Error::Operation(_))));
        conn.disconnect();
    }

    #[test]
    fn test_volume_step_rounding() {
        let info = DeviceInfo {
            num_volume_steps: 100,
            ..Default::default()
        };
        assert_eq!(info.volume_step(0.333), 33);
        assert_eq!(info.volume_step(-1.0), 0);
    }
}
