// ------------------------------------------------------------
// Module declarations
// ------------------------------------------------------------
//
// - config:     Configuration structs loaded from JSON
// - connectors: Source / Destination contract and connectors
// - error:      Connection, write and transform errors
// - pipeline:   Flow orchestration and connect retry
// - shutdown:   Process-wide interrupt token
// - stats:      Delivery counters
// - transform:  Optional message rewriting
// - util:       Small shared helpers
//
pub mod config;
pub mod connectors;
pub mod error;
pub mod pipeline;
pub mod shutdown;
pub mod stats;
pub mod transform;
pub mod util;

pub use connectors::{Connector, Destination, Message, MessageStream, Source};
pub use error::{ConnectionError, TransformError, WriteError};
pub use pipeline::Flow;
pub use transform::Transformer;
