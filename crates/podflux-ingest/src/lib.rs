//! Live Kubernetes log ingestion for podflux
//!
//! Watches pods matching a namespace/label/name filter, maintains exactly
//! one log streamer per eligible container, and emits enriched records on a
//! bounded output channel.

mod enrich;
mod error;
mod source;
mod streamer;
mod watcher;

pub use enrich::{enrich_line, strip_timestamp};
pub use error::{IngestError, IngestResult};
pub use source::{LogIngestionSource, SourceConfig};
pub use streamer::ContainerStreamer;
pub use watcher::{PodEvent, WatchFilter, WorkloadWatcher};

// Re-export types used in our public API
pub use podflux_types::{Attribute, AttributeValue, OutputRecord, StreamKey, WorkloadIdentity};
