//! Single-lane FIFO executor for receive-side pipe I/O.
//!
//! Command execution may spread across runtime threads, but `Chunk`,
//! `Flush`, and `Eof` must reach each sink in arrival order. They are
//! therefore submitted here and drained by one worker task per
//! channel. Every submission gets a monotone io-id; a watch channel
//! publishes the last completed id so responses can wait for pipe I/O
//! that arrived before them ([`sync`]).
//!
//! [`sync`]: PipeQueue::sync

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::channel::Channel;
use crate::command::Command;
use crate::error::TetherError;

/// A receive-side pipe side effect, executed on the single lane.
#[derive(Debug)]
pub(crate) enum PipeJob {
    Chunk { oid: u32, bytes: Bytes },
    Flush { oid: u32 },
    Eof { oid: u32, error: Option<String> },
    Unexport { oid: u32 },
}

/// Submission handle; lives inside the channel.
pub(crate) struct PipeQueue {
    tx: mpsc::UnboundedSender<PipeJob>,
    submitted: AtomicU64,
    completed: watch::Receiver<u64>,
}

/// Worker-side state, consumed by [`spawn_pipe_worker`].
pub(crate) struct PipeQueueBackend {
    rx: mpsc::UnboundedReceiver<PipeJob>,
    completed_tx: watch::Sender<u64>,
}

impl PipeQueue {
    pub(crate) fn new() -> (Self, PipeQueueBackend) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (completed_tx, completed) = watch::channel(0u64);
        (
            Self {
                tx,
                submitted: AtomicU64::new(0),
                completed,
            },
            PipeQueueBackend { rx, completed_tx },
        )
    }

    /// Enqueue a job; returns its io-id.
    pub(crate) fn submit(&self, job: PipeJob) -> Result<u64, TetherError> {
        // Reserve the id before sending so ids match FIFO positions;
        // submissions only happen from the read loop, one at a time.
        let id = self.submitted.fetch_add(1, Ordering::SeqCst) + 1;
        self.tx
            .send(job)
            .map_err(|_| TetherError::closed(None))?;
        Ok(id)
    }

    /// io-id of the most recent submission.
    pub(crate) fn watermark(&self) -> u64 {
        self.submitted.load(Ordering::SeqCst)
    }

    /// Wait until every job up to `id` has executed (or the worker is
    /// gone, which counts as drained — the channel is terminating).
    pub(crate) async fn sync(&self, id: u64) {
        let mut rx = self.completed.clone();
        loop {
            if *rx.borrow() >= id {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Spawn the single-lane worker for `channel`.
pub(crate) fn spawn_pipe_worker(channel: Channel, backend: PipeQueueBackend) -> JoinHandle<()> {
    let PipeQueueBackend {
        mut rx,
        completed_tx,
    } = backend;

    tokio::spawn(async move {
        let mut done: u64 = 0;
        loop {
            let job = tokio::select! {
                _ = channel.terminated() => break,
                job = rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };
            run_job(&channel, job).await;
            done += 1;
            let _ = completed_tx.send(done);
        }
        // Unblock every sync() waiter; pending jobs are moot once the
        // channel is coming down.
        let _ = completed_tx.send(u64::MAX);
    })
}

async fn run_job(channel: &Channel, job: PipeJob) {
    match job {
        PipeJob::Chunk { oid, bytes } => {
            let size = bytes.len() as u64;
            let sink = match channel.exports().get_pipe(oid) {
                Ok(sink) => sink,
                Err(TetherError::NoSuchObject(_)) => {
                    log::warn!("chunk for unknown pipe oid {oid} dropped ({size} bytes)");
                    return;
                }
                Err(e) => {
                    log::warn!("chunk for oid {oid} dropped: {e}");
                    return;
                }
            };
            match sink.deliver(bytes).await {
                Ok(()) => {
                    if channel.pipe_throttling() {
                        if let Err(e) = channel.send(&Command::Ack { oid, size }, false).await {
                            log::debug!("ack for pipe {oid} not sent: {e}");
                        }
                    }
                }
                Err(e) => {
                    log::warn!("pipe sink {oid} rejected chunk: {e}");
                    if channel.pipe_throttling() {
                        let dead = Command::NotifyDead {
                            oid,
                            cause: e.to_string(),
                        };
                        if let Err(e) = channel.send(&dead, false).await {
                            log::debug!("notify-dead for pipe {oid} not sent: {e}");
                        }
                    }
                }
            }
        }
        PipeJob::Flush { oid } => match channel.exports().get_pipe(oid) {
            Ok(sink) => {
                if let Err(e) = sink.flush().await {
                    log::warn!("pipe sink {oid} flush failed: {e}");
                }
            }
            Err(_) => log::debug!("flush for unknown pipe oid {oid} dropped"),
        },
        PipeJob::Eof { oid, error } => match channel.exports().get_pipe(oid) {
            Ok(sink) => {
                if let Err(e) = sink.close(error).await {
                    log::warn!("pipe sink {oid} close failed: {e}");
                }
            }
            Err(_) => log::debug!("eof for unknown pipe oid {oid} dropped"),
        },
        PipeJob::Unexport { oid } => {
            if let Err(e) = channel.exports().unexport_by_oid(oid, Some("peer unexport"), false) {
                log::warn!("unexport of oid {oid} failed: {e}");
            }
        }
    }
}
