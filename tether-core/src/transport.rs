//! Command transport — couples the frame codec to a byte stream and
//! drives the channel's read side.
//!
//! The write path lives on the channel (one async lock around a
//! `FramedWrite`); this module owns the read loop: one task per
//! channel that decodes logical payloads, deserializes them into
//! commands under the current-channel scope, and executes them in
//! arrival order. Any decode failure produces a stream-corruption
//! diagnostic (flight recorder + bounded read-ahead) and terminates
//! the channel.

use std::time::Duration;

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::channel::Channel;
use crate::codec::{FrameDecoder, FrameEncoder};
use crate::error::TetherError;
use crate::marshal;

pub(crate) type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Read half after framing.
pub(crate) type CommandReader = FramedRead<BoxedReader, FrameDecoder>;
/// Write half after framing.
pub(crate) type CommandWriter = FramedWrite<BoxedWriter, FrameEncoder>;

/// How long the corruption path may spend collecting read-ahead.
const READ_AHEAD_WINDOW: Duration = Duration::from_secs(1);

/// Spawn the channel's read loop.
pub(crate) fn spawn_read_loop(channel: Channel, mut framed: CommandReader) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                _ = channel.terminated() => return,
                next = framed.next() => next,
            };

            match next {
                Some(Ok(payload)) => {
                    channel.note_received();
                    let decoded =
                        marshal::with_channel(&channel, || channel.wire().decode(&payload));
                    let cmd = match decoded {
                        Ok(cmd) => cmd,
                        Err(e) => {
                            let corruption = corruption_diagnostic(&mut framed, e).await;
                            channel.terminate(corruption).await;
                            return;
                        }
                    };

                    log::trace!("[{}] received {}", channel.name(), cmd.name());
                    channel.notify_read(&cmd, payload.len());
                    if let Err(e) = cmd.execute(&channel).await {
                        // Execution errors are local; the wire is fine.
                        log::warn!("[{}] command execution failed: {e}", channel.name());
                    }
                    if channel.is_terminated() {
                        return;
                    }
                }
                Some(Err(TetherError::ConnectionLost(io))) => {
                    channel.terminate(TetherError::ConnectionLost(io)).await;
                    return;
                }
                Some(Err(e)) => {
                    // Framing-level failure: treat like corruption so the
                    // diagnostic carries the wire history.
                    let corruption = corruption_diagnostic(&mut framed, e).await;
                    channel.terminate(corruption).await;
                    return;
                }
                None => {
                    let eof = std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "transport closed by peer",
                    );
                    channel.terminate(TetherError::ConnectionLost(eof)).await;
                    return;
                }
            }
        }
    })
}

/// Build the `StreamCorruption` diagnostic: recorder snapshot plus up
/// to one second of best-effort read-ahead, bounded by the recorder
/// capacity.
async fn corruption_diagnostic(framed: &mut CommandReader, error: TetherError) -> TetherError {
    let detail = error.to_string();
    let recorded = framed.decoder().recorder().snapshot();
    let cap = framed.decoder().recorder().capacity();

    // Whatever the decoder had already buffered counts as read-ahead.
    let mut read_ahead = framed.read_buffer().to_vec();
    let deadline = tokio::time::Instant::now() + READ_AHEAD_WINDOW;
    let mut buf = [0u8; 4096];
    while read_ahead.len() < cap {
        match tokio::time::timeout_at(deadline, framed.get_mut().read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => read_ahead.extend_from_slice(&buf[..n]),
            Ok(Err(_)) | Err(_) => break,
        }
    }
    read_ahead.truncate(cap);

    TetherError::StreamCorruption {
        detail,
        recorded,
        read_ahead,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{DEFAULT_MAX_COMMAND, Framing};
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn read_ahead_is_bounded_and_timely() {
        let (client, server) = tokio::io::duplex(4096);
        let reader: BoxedReader = Box::new(client);
        let decoder = FrameDecoder::new(Framing::Chunked, DEFAULT_MAX_COMMAND, 64);
        let mut framed = FramedRead::new(reader, decoder);

        let (_half, mut write) = tokio::io::split(server);
        write.write_all(&[0xAA; 32]).await.unwrap();
        write.flush().await.unwrap();

        let started = std::time::Instant::now();
        let diag = corruption_diagnostic(
            &mut framed,
            TetherError::ProtocolViolation("synthetic decode failure"),
        )
        .await;

        // The writer never closes, so the deadline must cut us off.
        assert!(started.elapsed() < Duration::from_secs(5));
        match diag {
            TetherError::StreamCorruption {
                detail, read_ahead, ..
            } => {
                assert!(detail.contains("synthetic"));
                assert_eq!(read_ahead.len(), 32);
            }
            other => panic!("expected corruption, got {other}"),
        }
    }
}
