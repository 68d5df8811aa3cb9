//! Engine construction options.

use std::sync::Arc;

use bytes::Bytes;
use libp2p_identity::Keypair;
use multiaddr::Multiaddr;
use url::Url;

use crate::datastore::Datastore;
use crate::engine::policy::SyncPolicy;
use crate::engine::Engine;
use crate::error::Error;
use crate::host::Host;
use crate::AddrInfo;

/// Default gossip topic advertisements are announced on.
pub const DEFAULT_TOPIC: &str = "/indexer/ingest/mainnet";
/// Default maximum number of multihashes per entry chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;
/// Default maximum number of chunk chains kept in the cache.
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

/// The transport the engine publishes its head over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PublisherKind {
    /// Advertisements are only stored locally and never announced.
    #[default]
    None,
    /// Publish over the dag-sync stream protocol; requires a host.
    DagSync,
    /// Publish over HTTP; requires a listen address.
    Http,
}

/// Builder for [`Engine`].
#[derive(Debug, Default)]
pub struct Builder {
    key: Option<Keypair>,
    provider: Option<AddrInfo>,
    retrieval_addrs: Vec<Multiaddr>,
    datastore: Option<Arc<dyn Datastore>>,
    host: Option<Arc<dyn Host>>,
    publisher_kind: PublisherKind,
    http_listen_addr: Option<Multiaddr>,
    http_announce_addrs: Vec<Multiaddr>,
    topic: Option<String>,
    announce_urls: Vec<Url>,
    chunk_size: Option<usize>,
    cache_capacity: Option<usize>,
    purge_cache: bool,
    sync_policy: Option<SyncPolicy>,
    extra_gossip_data: Option<Bytes>,
}

impl Builder {
    /// Identity used to sign advertisements; also the default provider
    /// peer id. A fresh ed25519 key is generated when unset.
    pub fn key(mut self, key: Keypair) -> Self {
        self.key = Some(key);
        self
    }

    /// Overrides the default provider identity and addresses.
    pub fn provider(mut self, provider: AddrInfo) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Addresses embedded in advertisements when the caller provides no
    /// override. Falls back to the host's addresses when unset.
    pub fn retrieval_addrs(mut self, addrs: Vec<Multiaddr>) -> Self {
        self.retrieval_addrs = addrs;
        self
    }

    /// Backing key-value store. Required.
    pub fn datastore(mut self, ds: Arc<dyn Datastore>) -> Self {
        self.datastore = Some(ds);
        self
    }

    /// Libp2p host handle, required for gossip announcements and the
    /// dag-sync publisher.
    pub fn host(mut self, host: Arc<dyn Host>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn publisher_kind(mut self, kind: PublisherKind) -> Self {
        self.publisher_kind = kind;
        self
    }

    /// Listen address of the HTTP publisher. Required when the publisher
    /// kind is [`PublisherKind::Http`].
    pub fn http_listen_addr(mut self, addr: Multiaddr) -> Self {
        self.http_listen_addr = Some(addr);
        self
    }

    /// Addresses that replace the publisher's own in HTTP announcements.
    pub fn http_announce_addrs(mut self, addrs: Vec<Multiaddr>) -> Self {
        self.http_announce_addrs = addrs;
        self
    }

    /// Gossip topic announcements are published on.
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// HTTP endpoints that receive head-change notifications.
    pub fn announce_urls(mut self, urls: Vec<Url>) -> Self {
        self.announce_urls = urls;
        self
    }

    /// Maximum number of multihashes per entry chunk.
    pub fn entries_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = Some(size);
        self
    }

    /// Maximum number of chunk chains retained by the chunker cache.
    pub fn chunk_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = Some(capacity);
        self
    }

    /// Clears the chunker cache on start.
    pub fn purge_chunk_cache(mut self, purge: bool) -> Self {
        self.purge_cache = purge;
        self
    }

    /// Filter for inbound dag-sync pulls.
    pub fn sync_policy(mut self, policy: SyncPolicy) -> Self {
        self.sync_policy = Some(policy);
        self
    }

    /// Opaque payload carried on gossip announcements.
    pub fn extra_gossip_data(mut self, data: Bytes) -> Self {
        self.extra_gossip_data = Some(data);
        self
    }

    pub fn build(self) -> Result<Engine, Error> {
        let ds = self
            .datastore
            .ok_or_else(|| Error::Config("a datastore is required".into()))?;
        if self.publisher_kind == PublisherKind::Http && self.http_listen_addr.is_none() {
            return Err(Error::Config(
                "the http publisher requires a listen address".into(),
            ));
        }
        if self.publisher_kind == PublisherKind::DagSync && self.host.is_none() {
            return Err(Error::Config(
                "the dag-sync publisher requires a libp2p host".into(),
            ));
        }
        let key = self.key.unwrap_or_else(Keypair::generate_ed25519);
        let provider = match self.provider {
            Some(provider) => provider,
            None => {
                let mut addrs = self.retrieval_addrs;
                if addrs.is_empty() {
                    if let Some(host) = &self.host {
                        addrs = host.addrs();
                    }
                }
                AddrInfo {
                    peer_id: key.public().to_peer_id(),
                    addrs,
                }
            }
        };
        Ok(Engine::from_options(Options {
            key,
            provider,
            ds,
            host: self.host,
            publisher_kind: self.publisher_kind,
            http_listen_addr: self.http_listen_addr,
            http_announce_addrs: self.http_announce_addrs,
            topic: self.topic.unwrap_or_else(|| DEFAULT_TOPIC.to_string()),
            announce_urls: self.announce_urls,
            chunk_size: self.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE),
            cache_capacity: self.cache_capacity.unwrap_or(DEFAULT_CACHE_CAPACITY),
            purge_cache: self.purge_cache,
            sync_policy: self.sync_policy.unwrap_or_default(),
            extra_gossip_data: self.extra_gossip_data,
        }))
    }
}

/// Resolved engine configuration.
#[derive(Debug)]
pub(crate) struct Options {
    pub key: Keypair,
    pub provider: AddrInfo,
    pub ds: Arc<dyn Datastore>,
    pub host: Option<Arc<dyn Host>>,
    pub publisher_kind: PublisherKind,
    pub http_listen_addr: Option<Multiaddr>,
    pub http_announce_addrs: Vec<Multiaddr>,
    pub topic: String,
    pub announce_urls: Vec<Url>,
    pub chunk_size: usize,
    pub cache_capacity: usize,
    pub purge_cache: bool,
    pub sync_policy: SyncPolicy,
    pub extra_gossip_data: Option<Bytes>,
}
