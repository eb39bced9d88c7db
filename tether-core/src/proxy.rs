//! Remote proxies — local handles that turn method invocations into
//! `UserRequest`s.
//!
//! Dispatch is by tagged selector, not reflection: an exported object
//! declares a static set of interface names, and a selector
//! `"iface.method"` is legal only when `iface` is declared. Both the
//! proxy (before sending) and the receiving channel (before invoking)
//! enforce this.
//!
//! A handle serializes as a [`RemoteRef`] carrying the exporting
//! channel's token. When a ref travels back to the channel that
//! exported its target, resolution yields the original object rather
//! than a proxy-to-a-proxy.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::channel::Channel;
use crate::dispatch::PendingCall;
use crate::error::TetherError;
use crate::marshal;

/// An object invocable from the other side of a channel.
#[async_trait]
pub trait RemoteObject: Send + Sync {
    /// Interface names remote callers may dispatch through.
    fn interfaces(&self) -> &'static [&'static str];

    /// Execute `selector` with encoded `args`, returning the encoded
    /// result. `channel` is the channel the request arrived on.
    async fn invoke(
        &self,
        channel: &Channel,
        selector: &str,
        args: Bytes,
    ) -> Result<Bytes, TetherError>;
}

/// The wire body of a `UserRequest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallPayload {
    pub oid: u32,
    pub selector: String,
    pub args: Bytes,
}

/// Serialized form of a remote handle: `(origin channel token, oid,
/// declared interfaces)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRef {
    pub token: u64,
    pub oid: u32,
    pub interfaces: Vec<String>,
}

impl RemoteRef {
    /// Resolve against the current channel (set around command
    /// execution and payload (de)serialization).
    pub fn resolve_current(&self) -> Result<Resolved, TetherError> {
        let channel = marshal::current_channel().ok_or(TetherError::ProtocolViolation(
            "no current channel to resolve a remote ref against",
        ))?;
        channel.resolve_ref(self)
    }
}

/// Outcome of resolving a [`RemoteRef`].
pub enum Resolved {
    /// The ref came home: the original exported object.
    Local(Arc<dyn RemoteObject>),
    /// The ref names a peer object: a dispatching handle.
    Proxy(RemoteHandle),
}

/// Whether `selector` is covered by the declared interface set.
pub(crate) fn selector_allowed(interfaces: &[String], selector: &str) -> bool {
    interfaces.iter().any(|iface| {
        selector
            .strip_prefix(iface.as_str())
            .is_some_and(|rest| rest.starts_with('.'))
    })
}

/// Local stand-in for an object exported by the peer.
#[derive(Clone)]
pub struct RemoteHandle {
    channel: Channel,
    origin_token: u64,
    oid: u32,
    interfaces: Arc<[String]>,
}

impl RemoteHandle {
    pub(crate) fn new(
        channel: Channel,
        origin_token: u64,
        oid: u32,
        interfaces: Arc<[String]>,
    ) -> Self {
        Self {
            channel,
            origin_token,
            oid,
            interfaces,
        }
    }

    /// OID of the target within its exporting channel.
    pub fn oid(&self) -> u32 {
        self.oid
    }

    /// The declared interfaces of the target.
    pub fn interfaces(&self) -> &[String] {
        &self.interfaces
    }

    /// Whether the target declares `iface`.
    pub fn supports(&self, iface: &str) -> bool {
        self.interfaces.iter().any(|i| i == iface)
    }

    /// The serialized form of this handle.
    pub fn to_ref(&self) -> RemoteRef {
        RemoteRef {
            token: self.origin_token,
            oid: self.oid,
            interfaces: self.interfaces.to_vec(),
        }
    }

    fn payload(&self, selector: &str, args: Bytes) -> Result<Bytes, TetherError> {
        if !selector_allowed(&self.interfaces, selector) {
            return Err(TetherError::BadSelector {
                selector: selector.to_string(),
            });
        }
        marshal::encode_value(&CallPayload {
            oid: self.oid,
            selector: selector.to_string(),
            args,
        })
    }

    /// Invoke `selector` and wait for the result.
    pub async fn call(&self, selector: &str, args: Bytes) -> Result<Bytes, TetherError> {
        let payload = self.payload(selector, args)?;
        self.channel.issue_request(selector, payload).await
    }

    /// Invoke `selector`, returning a handle to await later. The call
    /// is on the wire when this returns.
    pub async fn call_deferred(
        &self,
        selector: &str,
        args: Bytes,
    ) -> Result<PendingCall, TetherError> {
        let payload = self.payload(selector, args)?;
        self.channel.issue_request_deferred(selector, payload).await
    }

    /// Drop this side's reference on the remote export.
    pub async fn release(self) -> Result<(), TetherError> {
        let cmd = crate::command::Command::Unexport {
            oid: self.oid,
            io_id: self.channel.next_io_id(),
        };
        self.channel.send(&cmd, false).await
    }

    /// Invoke a typed selector: arguments and result encoded with the
    /// standard payload encoding.
    pub async fn call_typed<A, R>(&self, selector: &str, args: &A) -> Result<R, TetherError>
    where
        A: Serialize + Sync,
        R: serde::de::DeserializeOwned,
    {
        let body = self.call(selector, marshal::encode_value(args)?).await?;
        marshal::decode_value(&body)
    }
}

impl std::fmt::Debug for RemoteHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteHandle")
            .field("oid", &self.oid)
            .field("origin_token", &self.origin_token)
            .field("interfaces", &self.interfaces)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ifaces(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn selector_legality() {
        let declared = ifaces(&["build.Executor", "build.Log"]);
        assert!(selector_allowed(&declared, "build.Executor.run"));
        assert!(selector_allowed(&declared, "build.Log.tail"));
        assert!(!selector_allowed(&declared, "build.Executor"));
        assert!(!selector_allowed(&declared, "build.ExecutorX.run"));
        assert!(!selector_allowed(&declared, "admin.Shell.exec"));
    }

    #[test]
    fn call_payload_roundtrip() {
        let payload = CallPayload {
            oid: 9,
            selector: "build.Executor.run".into(),
            args: Bytes::from_static(b"\x01\x02"),
        };
        let bytes = marshal::encode_value(&payload).unwrap();
        let back: CallPayload = marshal::decode_value(&bytes).unwrap();
        assert_eq!(back.oid, 9);
        assert_eq!(back.selector, "build.Executor.run");
        assert_eq!(back.args, payload.args);
    }

    #[test]
    fn remote_ref_roundtrip() {
        let r = RemoteRef {
            token: 0xDEAD_BEEF,
            oid: 4,
            interfaces: ifaces(&["build.Executor"]),
        };
        let bytes = marshal::encode_value(&r).unwrap();
        let back: RemoteRef = marshal::decode_value(&bytes).unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn resolve_current_without_channel_fails() {
        let r = RemoteRef {
            token: 1,
            oid: 2,
            interfaces: vec![],
        };
        assert!(r.resolve_current().is_err());
    }
}
