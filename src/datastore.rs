//! Key-value datastore seam.
//!
//! The engine does not own a storage backend. It is handed a [`Datastore`]
//! at construction time and segregates its state under reserved key
//! prefixes. [`MemDatastore`] is provided for tests and light embedding;
//! persistent backends live with the embedder.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

/// A flat binary key-value store.
///
/// All operations are atomic per key. Keys are opaque byte strings; the
/// engine composes them from reserved prefixes.
#[async_trait]
pub trait Datastore: Send + Sync + fmt::Debug + 'static {
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>>;

    async fn put(&self, key: &[u8], value: Bytes) -> Result<()>;

    async fn delete(&self, key: &[u8]) -> Result<()>;

    /// Returns every key that starts with `prefix`.
    async fn list(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>>;
}

/// In-memory [`Datastore`] backed by a [`BTreeMap`].
#[derive(Debug, Default, Clone)]
pub struct MemDatastore {
    inner: Arc<RwLock<BTreeMap<Vec<u8>, Bytes>>>,
}

impl MemDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[async_trait]
impl Datastore for MemDatastore {
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        Ok(self.inner.read().get(key).cloned())
    }

    async fn put(&self, key: &[u8], value: Bytes) -> Result<()> {
        self.inner.write().insert(key.to_vec(), value);
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> Result<()> {
        self.inner.write().remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>> {
        let map = self.inner.read();
        Ok(map
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

/// Datastore view that prepends a fixed prefix to every key.
///
/// Keys returned by [`Datastore::list`] are relative to the namespace.
#[derive(Debug, Clone)]
pub struct Namespaced {
    inner: Arc<dyn Datastore>,
    prefix: Vec<u8>,
}

impl Namespaced {
    pub fn new(inner: Arc<dyn Datastore>, prefix: impl AsRef<[u8]>) -> Self {
        Self {
            inner,
            prefix: prefix.as_ref().to_vec(),
        }
    }

    fn full_key(&self, key: &[u8]) -> Vec<u8> {
        let mut k = self.prefix.clone();
        k.extend_from_slice(key);
        k
    }
}

#[async_trait]
impl Datastore for Namespaced {
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        self.inner.get(&self.full_key(key)).await
    }

    async fn put(&self, key: &[u8], value: Bytes) -> Result<()> {
        self.inner.put(&self.full_key(key), value).await
    }

    async fn delete(&self, key: &[u8]) -> Result<()> {
        self.inner.delete(&self.full_key(key)).await
    }

    async fn list(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>> {
        let keys = self.inner.list(&self.full_key(prefix)).await?;
        Ok(keys
            .into_iter()
            .map(|k| k[self.prefix.len()..].to_vec())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mem_roundtrip() {
        let ds = MemDatastore::new();
        ds.put(b"a/1", Bytes::from_static(b"one")).await.unwrap();
        ds.put(b"a/2", Bytes::from_static(b"two")).await.unwrap();
        ds.put(b"b/1", Bytes::from_static(b"three")).await.unwrap();

        assert_eq!(ds.get(b"a/1").await.unwrap().unwrap(), "one");
        assert!(ds.get(b"missing").await.unwrap().is_none());

        let keys = ds.list(b"a/").await.unwrap();
        assert_eq!(keys, vec![b"a/1".to_vec(), b"a/2".to_vec()]);

        ds.delete(b"a/1").await.unwrap();
        assert!(ds.get(b"a/1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_namespaced_isolation() {
        let ds = Arc::new(MemDatastore::new());
        let ns = Namespaced::new(ds.clone(), "/cache/");
        ns.put(b"k", Bytes::from_static(b"v")).await.unwrap();

        assert!(ds.get(b"k").await.unwrap().is_none());
        assert_eq!(ds.get(b"/cache/k").await.unwrap().unwrap(), "v");

        let keys = ns.list(b"").await.unwrap();
        assert_eq!(keys, vec![b"k".to_vec()]);
    }
}
