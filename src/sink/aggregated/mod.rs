//! Per-application aggregation and manifest flushing.

pub mod aggregate;
pub mod exporter;
pub mod flush;
pub mod store;

pub use exporter::{ExportError, FileExporter, ManifestFormat};
pub use flush::{FlushHandle, FlushReport, FlushScheduler, FlushTrigger};
pub use store::{AggregationStore, AppSnapshot, MergeOutcome};
