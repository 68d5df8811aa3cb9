//! Advertisement engine for publishing content multihashes to a network of
//! indexers.
//!
//! The [`Engine`] builds a persistent chained log of signed
//! [`Advertisement`]s in a content-addressed DAG, chunks multihash lists
//! into linked entry blocks with a persisted LRU cache, publishes the
//! latest head over gossip and direct HTTP announcements, and serves pulls
//! of the DAG back to indexers.
//!
//! Writing is driven by [`Engine::notify_put`] and
//! [`Engine::notify_remove`]; the multihashes for a context ID are looked
//! up on demand through a registered [`MultihashLister`]. The read side is
//! [`client::ProviderClient`], which fetches a published chain and drains
//! its entries with a bounded recursion.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use ipni_provider::{Engine, MemDatastore};
//! # async fn example() -> anyhow::Result<()> {
//! let engine = Engine::builder()
//!     .datastore(Arc::new(MemDatastore::new()))
//!     .retrieval_addrs(vec!["/ip4/127.0.0.1/tcp/9999".parse()?])
//!     .build()?;
//! engine.start().await?;
//! # Ok(())
//! # }
//! ```

use std::fmt;

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use bytes::Bytes;
use cid::multihash::Multihash;
use cid::Cid;
use futures::stream::BoxStream;
use libp2p_identity::PeerId;
use multiaddr::Multiaddr;

pub mod announce;
pub mod client;
pub mod datastore;
pub mod engine;
pub mod error;
pub mod host;
pub mod metadata;
pub mod schema;
pub mod util;

pub use crate::datastore::{Datastore, MemDatastore, Namespaced};
pub use crate::engine::policy::SyncPolicy;
pub use crate::engine::{Builder, Engine, PublisherKind};
pub use crate::error::{Error, Result};
pub use crate::host::Host;
pub use crate::metadata::Metadata;
pub use crate::schema::{Advertisement, EntryChunk, SignedHead, NO_ENTRIES};

/// A single-pass, possibly long stream of multihashes.
pub type MultihashStream = BoxStream<'static, AnyResult<Multihash>>;

/// Looks up the multihashes advertised under a (provider, context ID)
/// pair.
///
/// The engine calls the lister whenever it needs to (re)produce the entry
/// chain for a context: on the first put for a context ID, and lazily when
/// a remote puller asks for an entries block that is no longer cached.
/// Exactly one lister is registered at a time.
#[async_trait]
pub trait MultihashLister: Send + Sync + 'static {
    async fn multihashes(&self, provider: PeerId, context_id: &[u8]) -> AnyResult<MultihashStream>;
}

/// A provider identity together with the addresses its content is
/// retrievable at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrInfo {
    pub peer_id: PeerId,
    pub addrs: Vec<Multiaddr>,
}

impl fmt::Display for AddrInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.peer_id)?;
        for addr in &self.addrs {
            write!(f, " {addr}")?;
        }
        Ok(())
    }
}

/// The programmatic surface of an index provider.
///
/// [`Engine`] is the canonical implementation; the trait exists so
/// embedders can wrap or fake it.
#[async_trait]
pub trait Interface: Send + Sync {
    /// Registers the lister used to look up multihashes by context ID.
    /// A later registration replaces the earlier one.
    fn register_multihash_lister(&self, lister: std::sync::Arc<dyn MultihashLister>);

    /// Publishes an advertisement that the multihashes under `context_id`
    /// are retrievable from `provider` (the default provider when `None`).
    async fn notify_put(
        &self,
        provider: Option<AddrInfo>,
        context_id: Bytes,
        metadata: Metadata,
    ) -> Result<Cid>;

    /// Publishes an advertisement that the multihashes under `context_id`
    /// are no longer retrievable from `provider`.
    async fn notify_remove(&self, provider: Option<PeerId>, context_id: Bytes) -> Result<Cid>;

    /// Returns the advertisement stored under `cid`.
    async fn get_adv(&self, cid: Cid) -> Result<Advertisement>;

    /// Returns the latest advertisement and its CID, if any was published.
    async fn get_latest_adv(&self) -> Result<Option<(Cid, Advertisement)>>;

    /// Shuts the provider down. It is no longer usable afterwards.
    async fn shutdown(&self) -> Result<()>;
}
