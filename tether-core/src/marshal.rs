//! Serialization contract and the "current channel" scope.
//!
//! The command serializer is injectable: anything implementing
//! [`WireFormat`] can carry the channel's traffic. [`BincodeWire`] is
//! the default. User payloads (selector arguments, return values,
//! handle references) use the [`encode_value`]/[`decode_value`] helpers
//! so both sides agree on one encoding.
//!
//! During every outbound encode, inbound decode, and user-request
//! execution the owning channel is installed in a scoped slot; payload
//! code can recover it with [`current_channel`] to reach the right
//! export table (e.g. when resolving a [`RemoteRef`]).
//!
//! [`RemoteRef`]: crate::proxy::RemoteRef

use std::cell::RefCell;

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::channel::Channel;
use crate::command::Command;
use crate::error::TetherError;

/// Byte-oriented command serializer.
///
/// Implementations must produce self-delimiting, position-independent
/// byte slices: the codec hands `decode` exactly the bytes `encode`
/// produced for one command.
pub trait WireFormat: Send + Sync {
    fn encode(&self, cmd: &Command) -> Result<Bytes, TetherError>;
    fn decode(&self, bytes: &[u8]) -> Result<Command, TetherError>;
}

/// The default wire format: bincode over serde.
#[derive(Debug, Default, Clone, Copy)]
pub struct BincodeWire;

impl WireFormat for BincodeWire {
    fn encode(&self, cmd: &Command) -> Result<Bytes, TetherError> {
        Ok(Bytes::from(bincode::serialize(cmd)?))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Command, TetherError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

// ── User payload helpers ─────────────────────────────────────────

/// Encode a user payload value (selector args, return values, refs).
pub fn encode_value<T: Serialize>(value: &T) -> Result<Bytes, TetherError> {
    Ok(Bytes::from(bincode::serialize(value)?))
}

/// Decode a user payload value.
pub fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, TetherError> {
    Ok(bincode::deserialize(bytes)?)
}

// ── Current-channel scope ────────────────────────────────────────

thread_local! {
    static CURRENT_SYNC: RefCell<Vec<Channel>> = const { RefCell::new(Vec::new()) };
}

tokio::task_local! {
    static CURRENT_TASK: Channel;
}

/// Run `f` with `channel` installed as the current channel.
///
/// The slot is popped on every exit path, including panics. Scopes
/// nest; the innermost wins.
pub fn with_channel<R>(channel: &Channel, f: impl FnOnce() -> R) -> R {
    struct PopGuard;
    impl Drop for PopGuard {
        fn drop(&mut self) {
            CURRENT_SYNC.with(|s| {
                s.borrow_mut().pop();
            });
        }
    }

    CURRENT_SYNC.with(|s| s.borrow_mut().push(channel.clone()));
    let _guard = PopGuard;
    f()
}

/// Run a future with `channel` installed as the current channel for
/// the whole task (survives await points). Used around user-request
/// execution.
pub async fn with_channel_async<F>(channel: Channel, fut: F) -> F::Output
where
    F: Future,
{
    CURRENT_TASK.scope(channel, fut).await
}

/// The channel whose traffic is being (de)serialized or executed on
/// this task, if any.
pub fn current_channel() -> Option<Channel> {
    if let Some(ch) = CURRENT_SYNC.with(|s| s.borrow().last().cloned()) {
        return Some(ch);
    }
    CURRENT_TASK.try_with(|c| c.clone()).ok()
}
