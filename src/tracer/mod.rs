pub mod event;
pub mod parse;
pub mod stats;
pub mod transport;

use anyhow::Result;

/// Transport delivers raw instrumentation records to the ingestion loop.
///
/// The producer side (probe attachment and the kernel ring buffer) lives
/// outside this crate; implementations only adapt whatever queue carries the
/// bytes.
pub trait Transport: Send {
    /// Wait for the next raw record.
    ///
    /// Returns `Ok(None)` once the producer has shut down and no records
    /// remain. Transports polled by the ingestion loop must be cancel-safe:
    /// dropping the future before it resolves must not lose a dequeued record.
    fn next_record(
        &mut self,
    ) -> impl std::future::Future<Output = Result<Option<Vec<u8>>>> + Send;
}
