//! The command catalog — every message that crosses the wire.
//!
//! A `Command` is serialized by the channel's [`WireFormat`] and framed
//! by the codec. Execution always happens on the receiving channel, in
//! arrival order; pipe-bound commands hop onto the single-lane pipe
//! queue so per-stream byte ordering survives a multi-threaded runtime.
//!
//! [`WireFormat`]: crate::marshal::WireFormat

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::channel::Channel;
use crate::error::TetherError;
use crate::pipe::queue::PipeJob;

/// One unit of wire traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    /// Invoke an operation on an exported object of the receiver.
    ///
    /// `payload` is an encoded [`CallPayload`].
    ///
    /// [`CallPayload`]: crate::proxy::CallPayload
    UserRequest { id: u64, payload: Bytes },

    /// Answer to a `UserRequest` with the same `id`. `ok` selects
    /// whether `body` is the encoded return value or an error rendering.
    Response { id: u64, ok: bool, body: Bytes },

    /// Orderly shutdown. Must be the final command ever sent on a
    /// channel.
    Close { cause: Option<String> },

    /// Reclamation prod for peers that batch unexports. The receiver
    /// treats it as a no-op.
    Gc,

    /// Drop one reference from the receiver's export entry for `oid`.
    ///
    /// Ordered through the pipe lane: an unexport that trails a pipe's
    /// `Eof` must not overtake it.
    Unexport { oid: u32, io_id: u64 },

    /// Append `bytes` to the pipe sink exported as `oid`.
    Chunk { oid: u32, io_id: u64, bytes: Bytes },

    /// Flush the pipe sink exported as `oid`.
    Flush { oid: u32, io_id: u64 },

    /// Close the pipe sink exported as `oid`, propagating `error` when
    /// the producer failed.
    Eof {
        oid: u32,
        io_id: u64,
        error: Option<String>,
    },

    /// Flow control: return `size` bytes of window budget to the
    /// writer of the pipe addressed by `oid`.
    Ack { oid: u32, size: u64 },

    /// The consumer of the pipe addressed by `oid` is gone; poison the
    /// writer's window.
    NotifyDead { oid: u32, cause: String },
}

impl Command {
    /// Short name for logs and listener callbacks.
    pub fn name(&self) -> &'static str {
        match self {
            Command::UserRequest { .. } => "UserRequest",
            Command::Response { .. } => "Response",
            Command::Close { .. } => "Close",
            Command::Gc => "Gc",
            Command::Unexport { .. } => "Unexport",
            Command::Chunk { .. } => "Chunk",
            Command::Flush { .. } => "Flush",
            Command::Eof { .. } => "Eof",
            Command::Ack { .. } => "Ack",
            Command::NotifyDead { .. } => "NotifyDead",
        }
    }

    /// Execute this command against the receiving channel.
    ///
    /// Runs on the read loop; anything long-running (user requests,
    /// pipe side effects) is handed to the appropriate executor and
    /// only the hand-off happens here, keeping command intake in
    /// arrival order.
    pub(crate) async fn execute(self, channel: &Channel) -> Result<(), TetherError> {
        match self {
            Command::UserRequest { id, payload } => channel.accept_user_request(id, payload),
            Command::Response { id, ok, body } => channel.accept_response(id, ok, body),
            Command::Close { cause } => channel.accept_close(cause).await,
            Command::Gc => {
                log::trace!("gc prod received; refcounting reclaims eagerly");
                Ok(())
            }
            Command::Unexport { oid, io_id } => {
                channel.submit_pipe_job(PipeJob::Unexport { oid }, io_id)
            }
            Command::Chunk { oid, io_id, bytes } => {
                channel.submit_pipe_job(PipeJob::Chunk { oid, bytes }, io_id)
            }
            Command::Flush { oid, io_id } => channel.submit_pipe_job(PipeJob::Flush { oid }, io_id),
            Command::Eof { oid, io_id, error } => {
                channel.submit_pipe_job(PipeJob::Eof { oid, error }, io_id)
            }
            Command::Ack { oid, size } => channel.accept_ack(oid, size),
            Command::NotifyDead { oid, cause } => channel.accept_notify_dead(oid, cause),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marshal::{BincodeWire, WireFormat};

    /// Serialize-then-deserialize is identity on payload fields for
    /// every variant.
    #[test]
    fn wire_roundtrip_is_identity() {
        let wire = BincodeWire;
        let samples = vec![
            Command::UserRequest {
                id: 7,
                payload: Bytes::from_static(b"call"),
            },
            Command::Response {
                id: 7,
                ok: true,
                body: Bytes::from_static(b"value"),
            },
            Command::Close {
                cause: Some("going away".into()),
            },
            Command::Gc,
            Command::Unexport { oid: 12, io_id: 98 },
            Command::Chunk {
                oid: 3,
                io_id: 99,
                bytes: Bytes::from_static(b"stream data"),
            },
            Command::Flush { oid: 3, io_id: 100 },
            Command::Eof {
                oid: 3,
                io_id: 101,
                error: None,
            },
            Command::Ack { oid: 3, size: 4096 },
            Command::NotifyDead {
                oid: 3,
                cause: "reader dropped".into(),
            },
        ];

        for cmd in samples {
            let encoded = wire.encode(&cmd).unwrap();
            let decoded = wire.decode(&encoded).unwrap();
            match (&cmd, &decoded) {
                (
                    Command::UserRequest { id: a, payload: pa },
                    Command::UserRequest { id: b, payload: pb },
                ) => {
                    assert_eq!(a, b);
                    assert_eq!(pa, pb);
                }
                (
                    Command::Chunk {
                        oid: a,
                        io_id: ia,
                        bytes: ba,
                    },
                    Command::Chunk {
                        oid: b,
                        io_id: ib,
                        bytes: bb,
                    },
                ) => {
                    assert_eq!(a, b);
                    assert_eq!(ia, ib);
                    assert_eq!(ba, bb);
                }
                _ => assert_eq!(cmd.name(), decoded.name()),
            }
        }
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        let wire = BincodeWire;
        assert!(wire.decode(&[0xFF; 40]).is_err());
    }
}
