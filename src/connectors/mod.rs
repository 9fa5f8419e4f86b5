//! Connector contract, concrete connectors and the connector registry.
//!
//! All connector-specific logic lives in the connector modules. The
//! pipeline only talks to the `Source` / `Destination` traits.

pub mod connector;
pub mod stdio;
pub mod websocket;

use anyhow::{anyhow, bail};
use std::sync::Arc;

use crate::config::ConnectorConfig;
pub use connector::{Connector, ConnectorState, Destination, Message, MessageStream, Source};
pub use stdio::Stdio;
pub use websocket::WebSocket;

/// Builds the source named by `cfg.kind`.
///
/// CONTRACT:
/// - `kind` must be one of "websocket", "stdio"
/// - connectors are wrapped in `Arc` and shared between pipeline tasks
///
pub fn source_from_config(cfg: &ConnectorConfig) -> anyhow::Result<Arc<dyn Source>> {
    match cfg.kind.as_str() {
        "websocket" => Ok(Arc::new(websocket_from_config(cfg)?)),
        "stdio" => Ok(Arc::new(Stdio::new())),
        other => bail!("source '{}' is not supported", other),
    }
}

/// Builds the destination named by `cfg.kind`.
///
/// `kind` must be one of "websocket", "stdio", "stdout".
pub fn destination_from_config(cfg: &ConnectorConfig) -> anyhow::Result<Arc<dyn Destination>> {
    match cfg.kind.as_str() {
        "websocket" => Ok(Arc::new(websocket_from_config(cfg)?)),
        "stdio" | "stdout" => Ok(Arc::new(Stdio::new())),
        other => bail!("destination '{}' is not supported", other),
    }
}

fn websocket_from_config(cfg: &ConnectorConfig) -> anyhow::Result<WebSocket> {
    let url = cfg
        .url
        .as_deref()
        .ok_or_else(|| anyhow!("websocket connector requires `url`"))?;
    Ok(WebSocket::from_options(url, &cfg.headers, &cfg.args))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn cfg(kind: &str, url: Option<&str>) -> ConnectorConfig {
        ConnectorConfig {
            kind: kind.to_string(),
            url: url.map(str::to_string),
            headers: HashMap::new(),
            args: HashMap::new(),
        }
    }

    #[test]
    fn resolves_known_kinds() {
        let src = source_from_config(&cfg("websocket", Some("ws://localhost:9"))).unwrap();
        assert_eq!(src.name(), "websocket");

        let src = source_from_config(&cfg("stdio", None)).unwrap();
        assert_eq!(src.name(), "stdio");

        let dest = destination_from_config(&cfg("stdout", None)).unwrap();
        assert_eq!(dest.name(), "stdio");
    }

    #[test]
    fn rejects_unknown_kinds() {
        assert!(source_from_config(&cfg("stdout", None)).is_err());
        assert!(source_from_config(&cfg("kinesis", None)).is_err());
        assert!(destination_from_config(&cfg("s3", None)).is_err());
    }

    #[test]
    fn websocket_requires_url() {
        assert!(source_from_config(&cfg("websocket", None)).is_err());
    }
}
