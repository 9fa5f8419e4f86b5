use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs;

// ------------------------------------------------------------
// Root configuration
// ------------------------------------------------------------
//
// Top-level structure loaded from the JSON config file.
//
// It defines:
// - Where messages come from
// - Where they go
// - An optional transformer in between
// - Optional debug settings
//
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub source: ConnectorConfig,

    pub destination: ConnectorConfig,

    #[serde(default)]
    pub transformer: Option<TransformerConfig>,

    #[serde(default)]
    pub debug: Option<DebugConfig>,
}

// ------------------------------------------------------------
// Connector configuration
// ------------------------------------------------------------
//
// Shared shape for sources and destinations. Connector-specific
// options live in the string-keyed `args` map, e.g.
//
//   "args": { "reconnect_every": "60000000000" }
//
#[derive(Debug, Deserialize, Clone)]
pub struct ConnectorConfig {
    /// Connector identifier ("websocket", "stdio", "stdout")
    pub kind: String,

    /// Endpoint, for connectors that have one
    #[serde(default)]
    pub url: Option<String>,

    /// Extra handshake headers
    #[serde(default)]
    pub headers: HashMap<String, String>,

    #[serde(default)]
    pub args: HashMap<String, String>,
}

// ------------------------------------------------------------
// Transformer configuration
// ------------------------------------------------------------
#[derive(Debug, Deserialize, Clone)]
pub struct TransformerConfig {
    /// Transformer identifier ("json")
    pub kind: String,

    /// Fields injected into every message
    #[serde(default)]
    pub append: Map<String, Value>,

    /// If set, a field with this name receives the current Unix time in
    /// milliseconds for every message
    #[serde(default)]
    pub timestamp_field: Option<String>,
}

// ------------------------------------------------------------
// Debug configuration
// ------------------------------------------------------------
#[derive(Debug, Deserialize, Clone, Default)]
pub struct DebugConfig {
    /// Period of the pipeline stats report; absent disables it
    #[serde(default)]
    pub stats_every_secs: Option<u64>,
}

impl Config {
    /// Reads and deserializes a JSON config file.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let data = fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read config '{}': {}", path, e))?;
        Self::parse(&data)
    }

    pub fn parse(data: &str) -> anyhow::Result<Self> {
        let cfg = serde_json::from_str(data)?;
        Ok(cfg)
    }

    pub fn stats_every_secs(&self) -> Option<u64> {
        self.debug.as_ref().and_then(|d| d.stats_every_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let cfg = Config::parse(
            r#"{
                "source": {
                    "kind": "websocket",
                    "url": "wss://example.com/feed",
                    "headers": { "x-api-key": "k" },
                    "args": { "reconnect_every": "60000000000" }
                },
                "destination": { "kind": "stdout" },
                "transformer": {
                    "kind": "json",
                    "append": { "k": "v", "n": 2 },
                    "timestamp_field": "received_at"
                },
                "debug": { "stats_every_secs": 10 }
            }"#,
        )
        .unwrap();

        assert_eq!(cfg.source.kind, "websocket");
        assert_eq!(cfg.source.url.as_deref(), Some("wss://example.com/feed"));
        assert_eq!(cfg.source.headers["x-api-key"], "k");
        assert_eq!(cfg.source.args["reconnect_every"], "60000000000");
        assert_eq!(cfg.destination.kind, "stdout");
        assert!(cfg.destination.url.is_none());

        let transformer = cfg.transformer.as_ref().unwrap();
        assert_eq!(transformer.append["n"], 2);
        assert_eq!(transformer.timestamp_field.as_deref(), Some("received_at"));
        assert_eq!(cfg.stats_every_secs(), Some(10));
    }

    #[test]
    fn optional_sections_default() {
        let cfg = Config::parse(
            r#"{ "source": { "kind": "stdio" }, "destination": { "kind": "stdio" } }"#,
        )
        .unwrap();

        assert!(cfg.transformer.is_none());
        assert!(cfg.source.args.is_empty());
        assert_eq!(cfg.stats_every_secs(), None);
    }

    #[test]
    fn missing_destination_is_rejected() {
        assert!(Config::parse(r#"{ "source": { "kind": "stdio" } }"#).is_err());
    }
}
