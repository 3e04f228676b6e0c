// ABOUTME: Shared CLI argument parsing and output rendering for the pulse binary
// ABOUTME: Maps command-line options onto ClientConfig and sets up tracing

use crate::config::ClientConfig;
use crate::Result;
use clap::{Args, ValueEnum};
use serde::Serialize;
use std::fmt::Debug;
use std::io;
use std::time::Duration;

/// How records are printed
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Indented JSON
    #[default]
    Json,
    /// One debug line per record
    Text,
}

impl OutputFormat {
    /// Render a list of records
    pub fn render_list<T: Serialize + Debug>(&self, items: &[T]) -> Result<String> {
        match self {
            OutputFormat::Json => Ok(serde_json::to_string_pretty(items).map_err(io::Error::from)?),
            OutputFormat::Text => Ok(items
                .iter()
                .map(|item| format!("{:?}", item))
                .collect::<Vec<_>>()
                .join("\n")),
        }
    }

    /// Render a single record
    pub fn render_one<T: Serialize + Debug>(&self, item: &T) -> Result<String> {
        match self {
            OutputFormat::Json => Ok(serde_json::to_string_pretty(item).map_err(io::Error::from)?),
            OutputFormat::Text => Ok(format!("{:?}", item)),
        }
    }
}

/// Connection and output arguments shared by every subcommand
///
/// Use with `#[command(flatten)]` in the binary's Parser struct.
#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Json, global = true)]
    pub format: OutputFormat,

    /// Client name announced to the server
    #[arg(short, long, default_value = "pulse", global = true)]
    pub name: String,

    /// Operation timeout in milliseconds (overrides PULSE_OPERATION_TIMEOUT_MS)
    #[arg(long, global = true)]
    pub timeout_ms: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

impl ClientArgs {
    /// Initialize tracing based on verbosity flag
    pub fn init_tracing(&self) {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

        let filter = if self.verbose {
            "pulsebridge=debug,pulse=debug"
        } else {
            "pulsebridge=info,pulse=info"
        };

        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| filter.into()),
            )
            .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
            .init();
    }

    /// Build ClientConfig from these args and the environment
    pub fn build_config(&self) -> ClientConfig {
        let config = ClientConfig::new(&self.name).from_env();
        match self.timeout_ms {
            Some(ms) if ms > 0 => config.operation_timeout(Duration::from_millis(ms)),
            _ => config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize)]
    struct Row {
        index: u32,
        name: &'static str,
    }

    fn args(timeout_ms: Option<u64>) -> ClientArgs {
        ClientArgs {
            format: OutputFormat::Json,
            name: "cli-test".to_string(),
            timeout_ms,
            verbose: false,
        }
    }

    #[test]
    fn test_build_config() {
        let config = args(Some(1500)).build_config();
        assert_eq!(config.name, "cli-test");
        assert_eq!(config.operation_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn test_zero_timeout_is_ignored() {
        let config = args(Some(0)).build_config();
        assert!(config.operation_timeout > Duration::ZERO);
    }

    #[test]
    fn test_render_formats() {
        let rows = [Row { index: 0, name: "a" }, Row { index: 1, name: "b" }];

        let json = OutputFormat::Json.render_list(&rows).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed[1]["name"], "b");

        let text = OutputFormat::Text.render_list(&rows).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.starts_with("Row { index: 0"));

        assert_eq!(OutputFormat::Text.render_one(&rows[0]).unwrap(), "Row { index: 0, name: \"a\" }");
    }
}
