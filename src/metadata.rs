//! Opaque retrieval metadata carried inside advertisements.

use bytes::Bytes;

/// The unsigned-varint encoding of the bitswap transport protocol id
/// (`0x0900`), the minimal valid metadata.
const DEFAULT_METADATA: [u8; 2] = [0x80, 0x12];

/// Domain-specific retrieval hints attached to an advertisement.
///
/// The engine never interprets the payload; it only compares it for the
/// idempotence check and requires it to be non-empty. Removal
/// advertisements carry [`Metadata::default`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata(Bytes);

impl Metadata {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for Metadata {
    fn default() -> Self {
        Self(Bytes::from_static(&DEFAULT_METADATA))
    }
}

impl From<Bytes> for Metadata {
    fn from(bytes: Bytes) -> Self {
        Self(bytes)
    }
}

impl From<Vec<u8>> for Metadata {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let md = Metadata::default();
        assert!(!md.is_empty());
        assert_eq!(md.as_bytes(), &DEFAULT_METADATA);
    }

    #[test]
    fn test_equality() {
        assert_eq!(Metadata::new(vec![1, 2]), Metadata::new(vec![1, 2]));
        assert_ne!(Metadata::new(vec![1, 2]), Metadata::default());
    }
}
