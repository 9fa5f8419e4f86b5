use tokio::sync::mpsc;

use crate::error::{ConnectionError, WriteError};

/// Opaque text payload moved through the pipeline.
///
/// Encoding is the concern of whoever produces or transforms it.
pub type Message = String;

/// Lazy, unbounded sequence of messages produced by a `Source`.
///
/// The sequence ends when the producing connector stops (disconnect, EOF).
/// Transport errors are handled inside the connector and never appear here.
pub type MessageStream = mpsc::UnboundedReceiver<Message>;

/// Lifecycle of a connector's transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Disconnected,
    Connected,

    /// A replacement transport is being established; the old one is still
    /// open and reads are suspended.
    Swapping,
}

/// Operations every Source and Destination shares.
///
/// THREAD SAFETY:
/// - Must be Send + Sync
/// - One instance is shared between the delivery task and the shutdown path,
///   so all methods take `&self`
///
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    /// Stable, human readable connector name used in diagnostics.
    ///
    /// EXAMPLES:
    /// - "websocket"
    /// - "stdio"
    ///
    fn name(&self) -> &'static str;

    /// Establishes the transport.
    ///
    /// A single attempt; the pipeline owns retrying.
    async fn connect(&self) -> Result<(), ConnectionError>;

    /// Tears the transport down and stops every background task the
    /// connector started.
    ///
    /// Idempotent. Errors are reported but callers treat them as best effort.
    async fn disconnect(&self) -> anyhow::Result<()>;

    /// Logs connector diagnostics. Has no effect on behavior.
    fn info(&self);
}

/// A connector that produces messages.
#[async_trait::async_trait]
pub trait Source: Connector {
    /// Starts producing messages.
    ///
    /// Only setup failures are returned here. The returned stream can not
    /// be restarted; a new one requires `disconnect()` + `connect()`.
    async fn read(&self) -> Result<MessageStream, ConnectionError>;
}

/// A connector that consumes messages.
#[async_trait::async_trait]
pub trait Destination: Connector {
    /// Sends one message. Exactly one attempt, no internal retry.
    async fn write(&self, message: Message) -> Result<(), WriteError>;
}
