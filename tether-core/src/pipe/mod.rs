//! Flow-controlled byte pipes between peers.
//!
//! A [`RemotePipeWriter`] on one side feeds a [`PipeSink`] exported on
//! the other. Writers split their buffers into `Chunk` commands under
//! the budget of a [`PipeWindow`]; the receive side executes chunk
//! delivery on the channel's single-lane pipe queue and returns budget
//! with `Ack` when throttling is negotiated.

pub mod queue;
pub mod window;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::channel::Channel;
use crate::command::Command;
use crate::error::TetherError;

pub use window::{DEFAULT_WINDOW_MAX, PipeWindow};

/// Receive side of a pipe: where delivered bytes go.
///
/// Implementations must be internally synchronized; the single-lane
/// queue guarantees call ordering, not exclusive access.
#[async_trait]
pub trait PipeSink: Send + Sync {
    /// Append a chunk of bytes.
    async fn deliver(&self, bytes: Bytes) -> Result<(), TetherError>;

    /// Flush buffered bytes downstream.
    async fn flush(&self) -> Result<(), TetherError>;

    /// No more bytes will arrive; `error` carries the producer's
    /// failure when it did not end cleanly.
    async fn close(&self, error: Option<String>) -> Result<(), TetherError>;
}

// ── Reader-backed sink ───────────────────────────────────────────

#[derive(Debug)]
enum SinkEvent {
    Data(Bytes),
    Eof(Option<String>),
}

/// Consumer half of a locally exported pipe.
///
/// Backed by a bounded queue: when the consumer stops reading, chunk
/// delivery blocks on the pipe lane, acks stop, and the remote writer
/// throttles. That is the flow-control path, not a fault.
pub struct PipeReader {
    rx: mpsc::Receiver<SinkEvent>,
    done: bool,
}

impl PipeReader {
    /// Next chunk of bytes, `None` on clean end-of-stream.
    pub async fn read_chunk(&mut self) -> Result<Option<Bytes>, TetherError> {
        if self.done {
            return Ok(None);
        }
        match self.rx.recv().await {
            Some(SinkEvent::Data(bytes)) => Ok(Some(bytes)),
            Some(SinkEvent::Eof(None)) => {
                self.done = true;
                Ok(None)
            }
            Some(SinkEvent::Eof(Some(error))) => {
                self.done = true;
                Err(TetherError::PipeBroken(error))
            }
            // Sink dropped without an EOF: the channel went down.
            None => {
                self.done = true;
                Err(TetherError::PipeBroken(
                    "pipe abandoned before end-of-stream".into(),
                ))
            }
        }
    }

    /// Drain the pipe to a single buffer. Fails on a dirty EOF.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>, TetherError> {
        let mut out = Vec::new();
        while let Some(chunk) = self.read_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }
}

pub(crate) struct ReaderSink {
    tx: mpsc::Sender<SinkEvent>,
}

/// Create a queue-backed sink/reader pair. `depth` bounds how many
/// undelivered chunks may sit between the pipe lane and the consumer.
pub(crate) fn reader_sink(depth: usize) -> (ReaderSink, PipeReader) {
    let (tx, rx) = mpsc::channel(depth.max(1));
    (ReaderSink { tx }, PipeReader { rx, done: false })
}

#[async_trait]
impl PipeSink for ReaderSink {
    async fn deliver(&self, bytes: Bytes) -> Result<(), TetherError> {
        self.tx
            .send(SinkEvent::Data(bytes))
            .await
            .map_err(|_| TetherError::PipeBroken("pipe reader dropped".into()))
    }

    async fn flush(&self) -> Result<(), TetherError> {
        Ok(())
    }

    async fn close(&self, error: Option<String>) -> Result<(), TetherError> {
        // The reader may already be gone; a close after that is fine.
        let _ = self.tx.send(SinkEvent::Eof(error)).await;
        Ok(())
    }
}

// ── Window registry ──────────────────────────────────────────────

/// Weak-keyed map from remote sink OID to the writer's window.
///
/// The writer holds the only strong reference, so a window disappears
/// with its writer and a late `Ack` simply finds nothing.
pub(crate) struct PipeRegistry {
    windows: Mutex<HashMap<u32, Weak<PipeWindow>>>,
}

impl PipeRegistry {
    pub(crate) fn new() -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn register(&self, oid: u32, window: &Arc<PipeWindow>) {
        let mut map = self.windows.lock().unwrap();
        map.retain(|_, w| w.strong_count() > 0);
        map.insert(oid, Arc::downgrade(window));
    }

    pub(crate) fn increase(&self, oid: u32, size: usize) {
        let window = self.windows.lock().unwrap().get(&oid).and_then(Weak::upgrade);
        match window {
            Some(window) => window.increase(size),
            None => log::debug!("ack for unknown pipe oid {oid} ignored"),
        }
    }

    pub(crate) fn dead(&self, oid: u32, cause: Arc<TetherError>) {
        let window = self.windows.lock().unwrap().get(&oid).and_then(Weak::upgrade);
        match window {
            Some(window) => window.dead(cause),
            None => log::debug!("notify-dead for unknown pipe oid {oid} ignored"),
        }
    }

    /// Poison every live window. Called during channel termination.
    pub(crate) fn abort_all(&self, cause: Arc<TetherError>) {
        let windows: Vec<Arc<PipeWindow>> = {
            let map = self.windows.lock().unwrap();
            map.values().filter_map(Weak::upgrade).collect()
        };
        for window in windows {
            window.dead(cause.clone());
        }
    }
}

// ── Writer ───────────────────────────────────────────────────────

/// Producer half of a pipe whose consumer lives on the peer.
///
/// Obtained from [`Channel::open_pipe`]. Writes are split into `Chunk`
/// commands under the window budget; `close` sends `Eof` followed by
/// `Unexport` and must be called exactly once when done.
///
/// [`Channel::open_pipe`]: crate::channel::Channel::open_pipe
pub struct RemotePipeWriter {
    channel: Channel,
    oid: u32,
    window: Arc<PipeWindow>,
    closed: AtomicBool,
}

impl RemotePipeWriter {
    pub(crate) fn new(channel: Channel, oid: u32, window: Arc<PipeWindow>) -> Self {
        Self {
            channel,
            oid,
            window,
            closed: AtomicBool::new(false),
        }
    }

    /// OID of the remote sink this writer feeds.
    pub fn oid(&self) -> u32 {
        self.oid
    }

    /// The window backing this writer. Diagnostic only.
    pub fn window(&self) -> &PipeWindow {
        &self.window
    }

    /// Send `buf` to the remote sink, in order, splitting into chunks
    /// as window budget allows.
    ///
    /// The per-iteration floor of `max/10` keeps a nearly-full window
    /// from degenerating into byte-sized chunks; a write no larger
    /// than the free window goes out as a single chunk.
    pub async fn write(&self, buf: &[u8]) -> Result<(), TetherError> {
        self.ensure_open()?;
        let floor = (self.window.max() / 10).max(1);
        let mut rest = buf;
        while !rest.is_empty() {
            let usable = self.window.get(floor.min(rest.len())).await?;
            let n = usable.min(rest.len()).min(self.window.max());
            let chunk = Command::Chunk {
                oid: self.oid,
                io_id: self.channel.next_io_id(),
                bytes: Bytes::copy_from_slice(&rest[..n]),
            };
            self.channel.send(&chunk, false).await?;
            self.window.decrease(n);
            rest = &rest[n..];
        }
        Ok(())
    }

    /// Ask the remote sink to flush.
    pub async fn flush(&self) -> Result<(), TetherError> {
        self.ensure_open()?;
        let cmd = Command::Flush {
            oid: self.oid,
            io_id: self.channel.next_io_id(),
        };
        self.channel.send(&cmd, false).await
    }

    /// Close the stream cleanly.
    pub async fn close(&self) -> Result<(), TetherError> {
        self.finish(None).await
    }

    /// Close the stream, propagating a producer failure to the
    /// consumer.
    pub async fn fail(&self, error: impl Into<String>) -> Result<(), TetherError> {
        self.finish(Some(error.into())).await
    }

    async fn finish(&self, error: Option<String>) -> Result<(), TetherError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let eof = Command::Eof {
            oid: self.oid,
            io_id: self.channel.next_io_id(),
            error,
        };
        self.channel.send(&eof, false).await?;
        let unexport = Command::Unexport {
            oid: self.oid,
            io_id: self.channel.next_io_id(),
        };
        self.channel.send(&unexport, false).await
    }

    fn ensure_open(&self) -> Result<(), TetherError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TetherError::PipeBroken("writer already closed".into()));
        }
        Ok(())
    }
}

impl Drop for RemotePipeWriter {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            log::debug!(
                "pipe writer for oid {} dropped without close; remote sink stays open until the channel ends",
                self.oid
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reader_sink_delivers_in_order() {
        let (sink, mut reader) = reader_sink(8);
        sink.deliver(Bytes::from_static(b"one")).await.unwrap();
        sink.deliver(Bytes::from_static(b"two")).await.unwrap();
        sink.close(None).await.unwrap();

        assert_eq!(&reader.read_chunk().await.unwrap().unwrap()[..], b"one");
        assert_eq!(&reader.read_chunk().await.unwrap().unwrap()[..], b"two");
        assert!(reader.read_chunk().await.unwrap().is_none());
        // Reads past EOF stay at EOF.
        assert!(reader.read_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dirty_eof_surfaces_as_error() {
        let (sink, mut reader) = reader_sink(8);
        sink.deliver(Bytes::from_static(b"partial")).await.unwrap();
        sink.close(Some("disk full".into())).await.unwrap();

        assert!(reader.read_chunk().await.unwrap().is_some());
        let err = reader.read_chunk().await.unwrap_err();
        assert!(matches!(err, TetherError::PipeBroken(ref m) if m.contains("disk full")));
    }

    #[tokio::test]
    async fn abandoned_sink_breaks_reader() {
        let (sink, mut reader) = reader_sink(8);
        drop(sink);
        assert!(matches!(
            reader.read_chunk().await,
            Err(TetherError::PipeBroken(_))
        ));
    }

    #[tokio::test]
    async fn deliver_to_dropped_reader_fails() {
        let (sink, reader) = reader_sink(1);
        drop(reader);
        assert!(sink.deliver(Bytes::from_static(b"x")).await.is_err());
        // close() after the reader is gone is tolerated.
        sink.close(None).await.unwrap();
    }

    #[tokio::test]
    async fn registry_weak_keyed() {
        let registry = PipeRegistry::new();
        let window = Arc::new(PipeWindow::bounded(100));
        registry.register(7, &window);

        window.decrease(40);
        registry.increase(7, 40);
        assert_eq!(window.available(), 100);

        drop(window);
        // Ack after the writer is gone is ignored, not an error.
        registry.increase(7, 10);
    }

    #[tokio::test]
    async fn registry_abort_poisons_live_windows() {
        let registry = PipeRegistry::new();
        let a = Arc::new(PipeWindow::bounded(10));
        let b = Arc::new(PipeWindow::bounded(10));
        registry.register(1, &a);
        registry.register(2, &b);

        registry.abort_all(Arc::new(TetherError::OrderlyShutdown));
        assert!(a.is_dead());
        assert!(b.is_dead());
    }
}
