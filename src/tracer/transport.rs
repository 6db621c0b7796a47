//! Transport adapters: a bounded in-process record queue and a framed reader
//! for byte streams (FIFOs, files, stdin) written by the probe loader.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::parse::RECORD_SIZE;
use super::Transport;

/// Creates a bounded record queue.
///
/// The returned [`ChannelTransport`] reports closure once every
/// [`RecordSender`] clone has been dropped and the queue is drained.
pub fn channel(capacity: usize) -> (RecordSender, ChannelTransport) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (RecordSender { tx }, ChannelTransport { rx })
}

/// Producer handle for a [`ChannelTransport`].
#[derive(Clone)]
pub struct RecordSender {
    tx: mpsc::Sender<Vec<u8>>,
}

impl RecordSender {
    /// Enqueue a record, waiting while the queue is full.
    pub async fn send(&self, record: Vec<u8>) -> Result<()> {
        self.tx
            .send(record)
            .await
            .map_err(|_| anyhow!("record queue closed"))
    }

    /// Enqueue without waiting. Returns `false` if the queue is full or closed,
    /// in which case the record is dropped.
    pub fn try_send(&self, record: Vec<u8>) -> bool {
        self.tx.try_send(record).is_ok()
    }
}

/// Consumer side of the bounded record queue.
pub struct ChannelTransport {
    rx: mpsc::Receiver<Vec<u8>>,
}

impl ChannelTransport {
    /// Number of records currently queued.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl Transport for ChannelTransport {
    async fn next_record(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.rx.recv().await)
    }
}

/// Splits a byte stream into fixed-width records.
///
/// A clean end of stream on a record boundary reports closure. A stream that
/// ends mid-record yields the partial bytes once, so the decoder can reject
/// them, and then reports closure.
///
/// Reads are not cancel-safe; drive this from [`spawn_pump`] rather than
/// polling it directly inside a `select!`.
pub struct FramedReader<R> {
    reader: R,
    eof: bool,
}

impl<R> FramedReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(reader: R) -> Self {
        Self { reader, eof: false }
    }
}

impl<R> Transport for FramedReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn next_record(&mut self) -> Result<Option<Vec<u8>>> {
        if self.eof {
            return Ok(None);
        }

        let mut buf = vec![0u8; RECORD_SIZE];
        let mut filled = 0;

        while filled < RECORD_SIZE {
            let n = self
                .reader
                .read(&mut buf[filled..])
                .await
                .context("reading record stream")?;

            if n == 0 {
                self.eof = true;
                if filled == 0 {
                    return Ok(None);
                }
                debug!(bytes = filled, "record stream ended mid-record");
                buf.truncate(filled);
                return Ok(Some(buf));
            }

            filled += n;
        }

        Ok(Some(buf))
    }
}

/// Boxed reader type used for configured sources.
pub type SourceReader = Box<dyn AsyncRead + Unpin + Send>;

/// Opens the configured record source. `-` selects stdin.
pub async fn open_source(path: &str) -> Result<FramedReader<SourceReader>> {
    let reader: SourceReader = if path == "-" {
        Box::new(tokio::io::stdin())
    } else {
        let file = tokio::fs::File::open(Path::new(path))
            .await
            .with_context(|| format!("opening record source {path}"))?;
        Box::new(file)
    };

    Ok(FramedReader::new(reader))
}

/// Moves records from `source` into the bounded queue until the source closes,
/// the queue's consumer goes away, or `cancel` fires. Returns the number of
/// records forwarded.
pub fn spawn_pump<T>(
    mut source: T,
    sender: RecordSender,
    cancel: CancellationToken,
) -> JoinHandle<u64>
where
    T: Transport + 'static,
{
    tokio::spawn(async move {
        let mut forwarded: u64 = 0;

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = source.next_record() => next,
            };

            match next {
                Ok(Some(record)) => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        sent = sender.send(record) => {
                            if sent.is_err() {
                                debug!("record queue consumer gone, stopping pump");
                                break;
                            }
                        }
                    }
                    forwarded += 1;
                }
                Ok(None) => {
                    info!(forwarded, "record source closed");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "record source failed, treating as closed");
                    break;
                }
            }
        }

        forwarded
    })
}
