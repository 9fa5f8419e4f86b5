/// Pipeline module
///
/// This module groups all logic responsible for:
/// - Connecting a source and a destination with fail-fast retry
/// - Running the delivery loop between them
/// - Shutting both ends down on interrupt
///
/// Design notes:
/// - Connector-specific logic MUST NOT live here
/// - Per-message failures are logged, never retried
pub mod flow;
pub mod retry;

pub use flow::Flow;
