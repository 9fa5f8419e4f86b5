//! Optional message rewriting between source and destination.

pub mod json;

use anyhow::bail;
use std::sync::Arc;

use crate::config::TransformerConfig;
use crate::connectors::Message;
use crate::error::TransformError;
pub use json::JsonAppend;

/// Rewrites one message.
///
/// The pipeline keeps the original: if `transform` fails, the untouched
/// message is delivered instead.
pub trait Transformer: Send + Sync {
    fn name(&self) -> &'static str;

    fn transform(&self, message: &str) -> Result<Message, TransformError>;

    /// Logs transformer diagnostics.
    fn info(&self);
}

/// Builds the transformer named by `cfg.kind` ("json").
pub fn transformer_from_config(cfg: &TransformerConfig) -> anyhow::Result<Arc<dyn Transformer>> {
    match cfg.kind.as_str() {
        "json" => Ok(Arc::new(JsonAppend::from_config(cfg))),
        other => bail!("transformer '{}' is not supported", other),
    }
}
