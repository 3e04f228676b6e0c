// ABOUTME: Client configuration
// ABOUTME: Client name, server address, operation timeout and stream defaults

use crate::bridge::DEFAULT_OPERATION_TIMEOUT_MSEC;
use crate::stream::SampleSpec;
use std::env;
use std::time::Duration;

/// Environment variable naming the server to connect to
pub const SERVER_ENV: &str = "PULSE_SERVER";
/// Environment variable overriding the operation timeout in milliseconds
pub const TIMEOUT_ENV: &str = "PULSE_OPERATION_TIMEOUT_MS";

/// Default size of a playback stream's internal write buffer
pub const DEFAULT_BUFFER_SIZE: usize = 32768;

/// Client configuration
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Application name announced to the server
    pub name: String,
    /// Server to connect to; `None` uses the server's default
    pub server: Option<String>,
    /// Default timeout for every operation on the connection
    pub operation_timeout: Duration,
    /// Capacity hint for a stream's internal write buffer
    pub buffer_size: usize,
    /// Sample spec used when a stream is opened without one
    pub sample_spec: SampleSpec,
}

impl ClientConfig {
    /// Create a configuration for the given client name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the server address
    pub fn server(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }

    /// Set the default operation timeout
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Set the stream buffer size
    pub fn buffer_size(mut self, bytes: usize) -> Self {
        self.buffer_size = bytes;
        self
    }

    /// Set the default sample spec
    pub fn sample_spec(mut self, spec: SampleSpec) -> Self {
        self.sample_spec = spec;
        self
    }

    /// Overlay `PULSE_SERVER` and `PULSE_OPERATION_TIMEOUT_MS`
    ///
    /// Unset, empty or unparseable values leave the current setting alone.
    pub fn from_env(self) -> Self {
        self.overlay(env::var(SERVER_ENV).ok(), env::var(TIMEOUT_ENV).ok())
    }

    fn overlay(mut self, server: Option<String>, timeout_ms: Option<String>) -> Self {
        if let Some(server) = server.filter(|s| !s.trim().is_empty()) {
            self.server = Some(server.trim().to_string());
        }
        if let Some(raw) = timeout_ms {
            match raw.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => self.operation_timeout = Duration::from_millis(ms),
                _ => log::warn!("Ignoring invalid {}: {:?}", TIMEOUT_ENV, raw),
            }
        }
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            server: None,
            operation_timeout: Duration::from_millis(DEFAULT_OPERATION_TIMEOUT_MSEC),
            buffer_size: DEFAULT_BUFFER_SIZE,
            sample_spec: SampleSpec::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::new("tester");
        assert_eq!(config.name, "tester");
        assert_eq!(config.server, None);
        assert_eq!(config.operation_timeout, Duration::from_millis(5000));
        assert_eq!(config.buffer_size, 32768);
    }

    #[test]
    fn test_builder_chain() {
        let config = ClientConfig::new("tester")
            .server("unix:/run/pulse/native")
            .operation_timeout(Duration::from_millis(250))
            .buffer_size(4096);
        assert_eq!(config.server.as_deref(), Some("unix:/run/pulse/native"));
        assert_eq!(config.operation_timeout, Duration::from_millis(250));
        assert_eq!(config.buffer_size, 4096);
    }

    #[test]
    fn test_overlay_ignores_bad_values() {
        let config = ClientConfig::new("tester").overlay(Some("  ".into()), Some("soon".into()));
        assert_eq!(config.server, None);
        assert_eq!(config.operation_timeout, Duration::from_millis(5000));

        let config = ClientConfig::new("tester").overlay(Some("tcp:host".into()), Some("750".into()));
        assert_eq!(config.server.as_deref(), Some("tcp:host"));
        assert_eq!(config.operation_timeout, Duration::from_millis(750));
    }
}
