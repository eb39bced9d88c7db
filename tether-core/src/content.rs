//! Content-addressed storage used by resource loading layered on top
//! of the channel.
//!
//! The core does not implement any loading policy; it only defines the
//! store contract (blake3-keyed, write-once) and ships an in-memory
//! reference implementation.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::TetherError;

/// Blake3 hash naming one immutable blob.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentKey([u8; 32]);

impl ContentKey {
    /// The key of `bytes`.
    pub fn of(bytes: &[u8]) -> Self {
        Self(*blake3::hash(bytes).as_bytes())
    }

    /// The raw 32-byte digest.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse the hex rendering produced by `Display`.
    pub fn from_hex(hex: &str) -> Result<Self, TetherError> {
        if hex.len() != 64 || !hex.is_ascii() {
            return Err(TetherError::ProtocolViolation(
                "content key must be 64 hex digits",
            ));
        }
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[2 * i..2 * i + 2], 16)
                .map_err(|_| TetherError::ProtocolViolation("content key is not hex"))?;
        }
        Ok(Self(out))
    }
}

impl std::fmt::Display for ContentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ContentKey({self})")
    }
}

/// Content-addressed blob store.
///
/// `write` derives the key from the content, so a blob can never be
/// stored under a wrong name and repeated writes are idempotent.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Fetch a blob, `None` when absent.
    async fn read(&self, key: &ContentKey) -> Result<Option<Bytes>, TetherError>;

    /// Store a blob, returning its key.
    async fn write(&self, content: Bytes) -> Result<ContentKey, TetherError>;

    /// Whether a blob is present without fetching it.
    async fn contains(&self, key: &ContentKey) -> Result<bool, TetherError> {
        Ok(self.read(key).await?.is_some())
    }
}

/// Reference in-memory store.
#[derive(Default)]
pub struct MemoryContentStore {
    blobs: Mutex<HashMap<ContentKey, Bytes>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs.
    pub fn len(&self) -> usize {
        self.blobs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn read(&self, key: &ContentKey) -> Result<Option<Bytes>, TetherError> {
        Ok(self.blobs.lock().unwrap().get(key).cloned())
    }

    async fn write(&self, content: Bytes) -> Result<ContentKey, TetherError> {
        let key = ContentKey::of(&content);
        self.blobs.lock().unwrap().insert(key, content);
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read() {
        let store = MemoryContentStore::new();
        let key = store.write(Bytes::from_static(b"artifact")).await.unwrap();
        assert_eq!(key, ContentKey::of(b"artifact"));
        assert_eq!(
            &store.read(&key).await.unwrap().unwrap()[..],
            b"artifact"
        );
        assert!(store.contains(&key).await.unwrap());
    }

    #[tokio::test]
    async fn missing_blob_is_none() {
        let store = MemoryContentStore::new();
        let key = ContentKey::of(b"never stored");
        assert!(store.read(&key).await.unwrap().is_none());
        assert!(!store.contains(&key).await.unwrap());
    }

    #[tokio::test]
    async fn repeated_writes_are_idempotent() {
        let store = MemoryContentStore::new();
        let a = store.write(Bytes::from_static(b"same")).await.unwrap();
        let b = store.write(Bytes::from_static(b"same")).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn key_hex_roundtrip() {
        let key = ContentKey::of(b"some bytes");
        let hex = key.to_string();
        assert_eq!(hex.len(), 64);
        assert_eq!(ContentKey::from_hex(&hex).unwrap(), key);
        assert!(ContentKey::from_hex("xyz").is_err());
    }
}
