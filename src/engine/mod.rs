//! The advertisement engine: chained log construction, index maintenance,
//! and head publication.

use std::fmt;
use std::sync::Arc;

use anyhow::{anyhow, Context as _};
use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;
use libp2p_identity::PeerId;
use multiaddr::Multiaddr;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OnceCell, RwLock};
use tracing::{debug, info, warn};
use url::Url;

pub mod chunker;
pub mod linksystem;
mod options;
pub mod policy;
pub mod publisher;

pub use self::options::{Builder, PublisherKind, DEFAULT_CACHE_CAPACITY, DEFAULT_CHUNK_SIZE,
    DEFAULT_TOPIC};

use self::chunker::CachedEntriesChunker;
use self::linksystem::{BlockSource, LinkSystem};
use self::options::Options;
use self::publisher::{DagSyncPublisher, HttpPublisher, Publisher};
use crate::announce::{GossipSender, HttpSender, Message, Sender};
use crate::datastore::Namespaced;
use crate::error::{Error, Result};
use crate::metadata::Metadata;
use crate::schema::{Advertisement, NO_ENTRIES};
use crate::{AddrInfo, Interface, MultihashLister};

const KEY_TO_CID_PREFIX: &[u8] = b"map/keyCid/";
const CID_TO_KEY_PREFIX: &[u8] = b"map/cidKey/";
const CID_TO_PROVIDER_AND_KEY_PREFIX: &[u8] = b"map/cidProvAndKey/";
const KEY_TO_METADATA_PREFIX: &[u8] = b"map/keyMD/";
const LATEST_ADV_KEY: &[u8] = b"sync/adv/";
const LINKS_CACHE_PATH: &str = "/cache/links";
const DAGSYNC_PUB_PATH: &str = "/dagsync/dtsync/pub";

/// The advertisement engine.
///
/// Create with [`Engine::builder`], start with [`Engine::start`] and
/// discard with [`Engine::shutdown`]. All public methods are safe to
/// invoke concurrently; the write path is serialised internally so head
/// advances are linearizable.
#[derive(Debug)]
pub struct Engine {
    inner: Arc<Inner>,
    publisher: RwLock<Option<Publisher>>,
    publish_lock: Mutex<()>,
}

struct Inner {
    opts: Options,
    lsys: LinkSystem,
    lister: parking_lot::RwLock<Option<Arc<dyn MultihashLister>>>,
    chunker: OnceCell<Arc<CachedEntriesChunker>>,
}

impl fmt::Debug for Inner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inner")
            .field("opts", &self.opts)
            .field("lsys", &self.lsys)
            .field("chunker", &self.chunker)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn builder() -> Builder {
        Builder::default()
    }

    pub(crate) fn from_options(opts: Options) -> Self {
        let lsys = LinkSystem::new(opts.ds.clone());
        Self {
            inner: Arc::new(Inner {
                opts,
                lsys,
                lister: parking_lot::RwLock::new(None),
                chunker: OnceCell::new(),
            }),
            publisher: RwLock::new(None),
            publish_lock: Mutex::new(()),
        }
    }

    /// The default provider identity and addresses.
    pub fn provider(&self) -> &AddrInfo {
        &self.inner.opts.provider
    }

    /// The peer id advertisements are signed with.
    pub fn peer_id(&self) -> PeerId {
        self.inner.opts.key.public().to_peer_id()
    }

    /// Handle to the vanilla content-addressed store the engine keeps
    /// advertisement data in.
    pub fn link_system(&self) -> LinkSystem {
        self.inner.lsys.clone()
    }

    /// Starts the engine: opens the entries chunker cache, instantiates
    /// the configured publisher and initializes it with the latest
    /// advertisement so a fresh process does not regress the head.
    ///
    /// A failed (or cancelled) start leaves the engine not started;
    /// calling `start` again is safe.
    pub async fn start(&self) -> Result<()> {
        let opts = &self.inner.opts;
        let cache_ds = Arc::new(Namespaced::new(opts.ds.clone(), LINKS_CACHE_PATH));
        let chunker = Arc::new(
            CachedEntriesChunker::new(
                cache_ds,
                opts.chunk_size,
                opts.cache_capacity,
                opts.purge_cache,
            )
            .await
            .map_err(Error::storage)?,
        );

        let publisher = self.new_publisher().await?;
        if let Some(head) = self.inner.get_latest_ad_cid().await.map_err(Error::storage)? {
            publisher.set_root(head).await.map_err(Error::transport)?;
        }

        // Keep the already-open chunker on a repeated start.
        let _ = self.inner.chunker.set(chunker);
        *self.publisher.write().await = Some(publisher);
        Ok(())
    }

    async fn new_publisher(&self) -> Result<Publisher> {
        let opts = &self.inner.opts;
        match opts.publisher_kind {
            PublisherKind::None => {
                info!("remote announcements are disabled; advertisements will only be stored locally");
                return Ok(Publisher::None);
            }
            PublisherKind::DagSync | PublisherKind::Http => {}
        }

        let mut senders: Vec<Box<dyn Sender>> = Vec::new();
        if !opts.announce_urls.is_empty() {
            let sender = HttpSender::new(opts.announce_urls.clone(), self.peer_id())
                .map_err(Error::transport)?;
            senders.push(Box::new(sender));
        }
        if let Some(host) = &opts.host {
            senders.push(Box::new(GossipSender::new(host.clone(), opts.topic.clone())));
        }

        let source: Arc<dyn BlockSource> = self.inner.clone();
        match opts.publisher_kind {
            PublisherKind::Http => {
                let listen = opts
                    .http_listen_addr
                    .as_ref()
                    .ok_or_else(|| Error::Config("the http publisher requires a listen address".into()))?;
                let publisher = HttpPublisher::new(
                    listen,
                    opts.key.clone(),
                    source,
                    senders,
                    opts.extra_gossip_data.clone(),
                )
                .await
                .map_err(Error::transport)?;
                Ok(Publisher::Http(publisher))
            }
            PublisherKind::DagSync => {
                let host = opts
                    .host
                    .clone()
                    .ok_or_else(|| Error::Config("the dag-sync publisher requires a libp2p host".into()))?;
                let pub_ds = Arc::new(Namespaced::new(opts.ds.clone(), DAGSYNC_PUB_PATH));
                let publisher = DagSyncPublisher::new(
                    host,
                    pub_ds,
                    source,
                    opts.sync_policy.clone(),
                    senders,
                    opts.extra_gossip_data.clone(),
                )
                .await
                .map_err(Error::storage)?;
                Ok(Publisher::DagSync(publisher))
            }
            PublisherKind::None => unreachable!(),
        }
    }

    /// Shuts the engine down, closing the publisher and the entries
    /// chunker in order and aggregating errors from both. The engine is
    /// no longer usable afterwards.
    pub async fn shutdown(&self) -> Result<()> {
        let mut errs = Vec::new();
        if let Some(publisher) = self.publisher.write().await.take() {
            if let Err(err) = publisher.close().await {
                errs.push(format!("error closing publisher: {err:#}"));
            }
        }
        if let Some(chunker) = self.inner.chunker.get() {
            if let Err(err) = chunker.close() {
                errs.push(format!("error closing entries chunker: {err:#}"));
            }
        }
        if errs.is_empty() {
            Ok(())
        } else {
            Err(Error::Other(anyhow!("{}", errs.join("; "))))
        }
    }

    /// Registers the lister used to reproduce multihash lists on demand.
    /// A later registration replaces the earlier one.
    pub fn register_multihash_lister(&self, lister: Arc<dyn MultihashLister>) {
        debug!("registering multihash lister in engine");
        *self.inner.lister.write() = Some(lister);
    }

    /// Publishes an advertisement that the multihashes under `context_id`
    /// are retrievable from `provider`, with `metadata` as the retrieval
    /// hint. The default provider is used when `provider` is `None`.
    ///
    /// Returns [`Error::AlreadyAdvertised`] when neither the entries nor
    /// the metadata changed since the last put for this context.
    pub async fn notify_put(
        &self,
        provider: Option<AddrInfo>,
        context_id: Bytes,
        metadata: Metadata,
    ) -> Result<Cid> {
        let (peer, addrs) = match provider {
            Some(info) => (info.peer_id, info.addrs),
            None => (
                self.inner.opts.provider.peer_id,
                self.inner.opts.provider.addrs.clone(),
            ),
        };
        self.publish_adv_for_index(peer, addrs, context_id, metadata, false)
            .await
    }

    /// Publishes a removal advertisement for `context_id`, erasing the
    /// index rows created by the corresponding put.
    pub async fn notify_remove(&self, provider: Option<PeerId>, context_id: Bytes) -> Result<Cid> {
        let peer = provider.unwrap_or(self.inner.opts.provider.peer_id);
        self.publish_adv_for_index(peer, Vec::new(), context_id, Metadata::default(), true)
            .await
    }

    /// Stores a pre-built advertisement, marks it as the latest, and
    /// announces it through the configured publisher.
    pub async fn publish(&self, adv: Advertisement) -> Result<Cid> {
        let _guard = self.publish_lock.lock().await;
        self.publish_with_lock_held(adv).await
    }

    /// Stores a pre-built advertisement and marks it as the latest
    /// without announcing it.
    pub async fn publish_local(&self, adv: Advertisement) -> Result<Cid> {
        let _guard = self.publish_lock.lock().await;
        self.publish_local_with_lock_held(adv).await
    }

    /// Re-announces the latest existing advertisement through the
    /// configured publisher. Returns `None` when there is nothing to
    /// announce.
    pub async fn publish_latest(&self) -> Result<Option<Cid>> {
        let Some(head) = self.latest_ad_to_publish().await? else {
            return Ok(None);
        };
        info!(cid = %head, "publishing latest advertisement");
        let guard = self.publisher.read().await;
        if let Some(publisher) = guard.as_ref() {
            publisher.update_root(head).await.map_err(Error::transport)?;
        }
        Ok(Some(head))
    }

    /// Announces the latest existing advertisement to the given indexer
    /// URLs only, with transport-appropriate addresses.
    pub async fn publish_latest_http(&self, urls: Vec<Url>) -> Result<Option<Cid>> {
        let Some(head) = self.latest_ad_to_publish().await? else {
            return Ok(None);
        };
        self.http_announce(head, urls).await?;
        Ok(Some(head))
    }

    /// Returns the advertisement stored under `cid`.
    pub async fn get_adv(&self, cid: Cid) -> Result<Advertisement> {
        let bytes = self
            .inner
            .lsys
            .load_bytes(&cid)
            .await
            .map_err(Error::storage)?
            .ok_or(Error::NotFound(cid))?;
        Advertisement::decode(&bytes).map_err(|e| Error::Validation(e.to_string()))
    }

    /// Returns the latest advertisement and its CID, or `None` when
    /// nothing was published yet.
    pub async fn get_latest_adv(&self) -> Result<Option<(Cid, Advertisement)>> {
        let Some(head) = self.inner.get_latest_ad_cid().await.map_err(Error::storage)? else {
            return Ok(None);
        };
        let adv = self.get_adv(head).await?;
        Ok(Some((head, adv)))
    }

    /// The addresses the configured publisher announces by default.
    /// Empty before the engine is started and when publishing is
    /// disabled.
    pub async fn publisher_addrs(&self) -> Vec<Multiaddr> {
        match self.publisher.read().await.as_ref() {
            Some(publisher) => publisher.addrs(),
            None => Vec::new(),
        }
    }

    /// Serving handle of the dag-sync publisher, for the external stream
    /// transport. `None` unless the engine runs with
    /// [`PublisherKind::DagSync`].
    pub async fn dagsync_handle(&self) -> Option<publisher::DagSyncHandle> {
        match self.publisher.read().await.as_ref() {
            Some(Publisher::DagSync(publisher)) => Some(publisher.handle()),
            _ => None,
        }
    }

    /// The single write path behind `notify_put` and `notify_remove`:
    /// chooses the entries link, mutates the index, chains, signs, stores
    /// and announces.
    async fn publish_adv_for_index(
        &self,
        provider: PeerId,
        addrs: Vec<Multiaddr>,
        context_id: Bytes,
        metadata: Metadata,
        is_rm: bool,
    ) -> Result<Cid> {
        let _guard = self.publish_lock.lock().await;
        let inner = &self.inner;
        let ctx_log = data_encoding::BASE64.encode(&context_id);

        let existing = inner
            .get_key_cid_map(&provider, &context_id)
            .await
            .map_err(Error::storage)?;

        let entries_cid;
        let mut metadata = metadata;
        if !is_rm {
            info!(provider = %provider, context_id = %ctx_log, "creating advertisement");
            match existing {
                None => {
                    debug!("generating entries linked list for advertisement");
                    let lister = inner
                        .lister
                        .read()
                        .clone()
                        .ok_or(Error::NoMultihashLister)?;
                    let chunker = inner.chunker()?;
                    let mhs = lister
                        .multihashes(provider, &context_id)
                        .await
                        .map_err(Error::Other)?;
                    let link = chunker.chunk(mhs).await.map_err(Error::storage)?;
                    let entries = match link {
                        Some(cid) => cid,
                        None => {
                            warn!(context_id = %ctx_log, "chunking for context ID resulted in no link");
                            *NO_ENTRIES
                        }
                    };
                    inner
                        .put_key_cid_map(&provider, &context_id, &entries)
                        .await
                        .map_err(Error::storage)?;
                    entries_cid = entries;
                }
                Some(cid) => {
                    let previous = inner
                        .get_key_metadata_map(&provider, &context_id)
                        .await
                        .map_err(Error::storage)?;
                    match previous {
                        Some(previous) if previous == metadata => {
                            // No change, no new advertisement.
                            return Err(Error::AlreadyAdvertised);
                        }
                        None => {
                            warn!("no metadata for existing provider and context ID, generating new advertisement");
                        }
                        _ => {}
                    }
                    // Same entries link, new metadata.
                    entries_cid = cid;
                }
            }
            inner
                .put_key_metadata_map(&provider, &context_id, &metadata)
                .await
                .map_err(Error::storage)?;
        } else {
            info!(provider = %provider, context_id = %ctx_log, "creating removal advertisement");
            let entries = existing.ok_or(Error::ContextIdNotFound)?;
            inner
                .delete_key_cid_map(&provider, &context_id)
                .await
                .map_err(Error::storage)?;
            inner
                .delete_cid_key_map(&entries)
                .await
                .map_err(Error::storage)?;
            inner
                .delete_key_metadata_map(&provider, &context_id)
                .await
                .map_err(Error::storage)?;
            entries_cid = *NO_ENTRIES;
            // Removal still requires a valid metadata value.
            metadata = Metadata::default();
        }

        let previous_id = inner.get_latest_ad_cid().await.map_err(Error::storage)?;
        if previous_id.is_none() {
            info!("no previous advertisement, this is the genesis");
        }
        let mut adv = Advertisement {
            provider: provider.to_base58(),
            addresses: addrs.iter().map(|a| a.to_string()).collect(),
            entries: entries_cid,
            context_id,
            metadata: metadata.into_bytes(),
            is_rm,
            previous_id,
            signature: Bytes::new(),
        };
        adv.sign(&inner.opts.key)?;
        self.publish_with_lock_held(adv).await
    }

    async fn publish_with_lock_held(&self, adv: Advertisement) -> Result<Cid> {
        let head = self.publish_local_with_lock_held(adv).await?;

        let guard = self.publisher.read().await;
        let Some(publisher) = guard.as_ref() else {
            return Ok(head);
        };
        if matches!(publisher, Publisher::None) {
            return Ok(head);
        }

        if self.inner.opts.announce_urls.is_empty() {
            info!(cid = %head, "announcing advertisement in pubsub channel");
        } else {
            info!(cid = %head, "announcing advertisement in pubsub channel and via http");
        }
        // The address override applies to the HTTP publisher only; the
        // dag-sync publisher always announces the host's own addresses.
        let announced = if !self.inner.opts.http_announce_addrs.is_empty()
            && self.inner.opts.publisher_kind == PublisherKind::Http
        {
            publisher
                .update_root_with_addrs(head, self.inner.opts.http_announce_addrs.clone())
                .await
        } else {
            publisher.update_root(head).await
        };
        if let Err(err) = announced {
            // Publishing locally worked; the head stays authoritative and
            // the announcement is recoverable via publish_latest.
            warn!(cid = %head, "failed to announce advertisement: {err:#}");
        }
        Ok(head)
    }

    async fn publish_local_with_lock_held(&self, adv: Advertisement) -> Result<Cid> {
        adv.validate()?;
        let head = self
            .inner
            .lsys
            .store_node(&adv.to_node())
            .await
            .map_err(Error::storage)?;
        debug!(cid = %head, "stored advertisement in local link system");
        self.inner
            .put_latest_adv(&head)
            .await
            .context("failed to update reference to latest advertisement")
            .map_err(Error::storage)?;
        Ok(head)
    }

    async fn latest_ad_to_publish(&self) -> Result<Option<Cid>> {
        match self.publisher.read().await.as_ref() {
            None => return Err(Error::Config("engine is not started".into())),
            Some(Publisher::None) => {
                info!("skipped announcing the latest: remote announcements are disabled");
                return Ok(None);
            }
            Some(_) => {}
        }
        let head = self.inner.get_latest_ad_cid().await.map_err(Error::storage)?;
        if head.is_none() {
            info!("skipped announcing the latest: no previously published advertisements");
        }
        Ok(head)
    }

    async fn http_announce(&self, head: Cid, urls: Vec<Url>) -> Result<()> {
        if urls.is_empty() {
            return Ok(());
        }
        let opts = &self.inner.opts;
        let addrs = match opts.publisher_kind {
            PublisherKind::None => {
                info!("remote announcements are disabled");
                return Ok(());
            }
            PublisherKind::DagSync => opts.host.as_ref().map(|h| h.addrs()).unwrap_or_default(),
            PublisherKind::Http => {
                if !opts.http_announce_addrs.is_empty() {
                    opts.http_announce_addrs.clone()
                } else {
                    let guard = self.publisher.read().await;
                    guard.as_ref().map(|p| p.addrs()).unwrap_or_default()
                }
            }
        };
        let sender = HttpSender::new(urls, self.peer_id()).map_err(Error::transport)?;
        info!(cid = %head, "announcing advertisement over http");
        sender
            .send(&Message::new(head, addrs))
            .await
            .map_err(Error::transport)
    }
}

#[async_trait]
impl Interface for Engine {
    fn register_multihash_lister(&self, lister: Arc<dyn MultihashLister>) {
        Engine::register_multihash_lister(self, lister)
    }

    async fn notify_put(
        &self,
        provider: Option<AddrInfo>,
        context_id: Bytes,
        metadata: Metadata,
    ) -> Result<Cid> {
        Engine::notify_put(self, provider, context_id, metadata).await
    }

    async fn notify_remove(&self, provider: Option<PeerId>, context_id: Bytes) -> Result<Cid> {
        Engine::notify_remove(self, provider, context_id).await
    }

    async fn get_adv(&self, cid: Cid) -> Result<Advertisement> {
        Engine::get_adv(self, cid).await
    }

    async fn get_latest_adv(&self) -> Result<Option<(Cid, Advertisement)>> {
        Engine::get_latest_adv(self).await
    }

    async fn shutdown(&self) -> Result<()> {
        Engine::shutdown(self).await
    }
}

/// Reverse-index payload mapping an entries head back to its provider and
/// context. An empty provider denotes the engine's default provider.
#[derive(Debug, Serialize, Deserialize)]
struct ProviderAndContext {
    #[serde(rename = "p", default)]
    provider: Vec<u8>,
    #[serde(rename = "c", default)]
    context_id: Vec<u8>,
}

impl Inner {
    fn chunker(&self) -> Result<&Arc<CachedEntriesChunker>> {
        self.chunker
            .get()
            .ok_or_else(|| Error::Config("engine is not started".into()))
    }

    /// Key of the forward index row. The provider segment is omitted for
    /// the default provider, preserving the legacy single-provider
    /// layout.
    fn key_to_cid_key(&self, provider: &PeerId, context_id: &[u8]) -> Vec<u8> {
        keyed(KEY_TO_CID_PREFIX, self.provider_segment(provider), context_id)
    }

    fn key_to_metadata_key(&self, provider: &PeerId, context_id: &[u8]) -> Vec<u8> {
        keyed(
            KEY_TO_METADATA_PREFIX,
            self.provider_segment(provider),
            context_id,
        )
    }

    fn provider_segment(&self, provider: &PeerId) -> Option<String> {
        if *provider == self.opts.provider.peer_id {
            None
        } else {
            Some(provider.to_base58())
        }
    }

    async fn put_key_cid_map(
        &self,
        provider: &PeerId,
        context_id: &[u8],
        entries: &Cid,
    ) -> anyhow::Result<()> {
        // Forward: what entries link to embed when this context is
        // advertised or removed again.
        self.opts
            .ds
            .put(
                &self.key_to_cid_key(provider, context_id),
                Bytes::from(entries.to_bytes()),
            )
            .await?;
        // Reverse: which provider and context an entries head belongs to,
        // for serving chunks lazily to pullers.
        let payload = serde_json::to_vec(&ProviderAndContext {
            provider: provider.to_bytes(),
            context_id: context_id.to_vec(),
        })?;
        self.opts
            .ds
            .put(&cid_to_provider_and_key_key(entries), payload.into())
            .await
    }

    async fn get_key_cid_map(
        &self,
        provider: &PeerId,
        context_id: &[u8],
    ) -> anyhow::Result<Option<Cid>> {
        match self
            .opts
            .ds
            .get(&self.key_to_cid_key(provider, context_id))
            .await?
        {
            Some(bytes) => Ok(Some(Cid::try_from(bytes.as_ref())?)),
            None => Ok(None),
        }
    }

    async fn delete_key_cid_map(&self, provider: &PeerId, context_id: &[u8]) -> anyhow::Result<()> {
        self.opts
            .ds
            .delete(&self.key_to_cid_key(provider, context_id))
            .await
    }

    /// Deletes the reverse rows, both the multi-provider form and the
    /// legacy one.
    async fn delete_cid_key_map(&self, entries: &Cid) -> anyhow::Result<()> {
        self.opts
            .ds
            .delete(&cid_to_provider_and_key_key(entries))
            .await?;
        self.opts.ds.delete(&cid_to_key_key(entries)).await
    }

    /// Reverse lookup of an entries head. The legacy single-provider
    /// index is probed first; on a hit the default provider identity is
    /// assumed. New rows are only ever written in the multi-provider
    /// form.
    async fn get_cid_key_map(&self, entries: &Cid) -> anyhow::Result<Option<(PeerId, Vec<u8>)>> {
        if let Some(context_id) = self.opts.ds.get(&cid_to_key_key(entries)).await? {
            return Ok(Some((self.opts.provider.peer_id, context_id.to_vec())));
        }
        let Some(raw) = self
            .opts
            .ds
            .get(&cid_to_provider_and_key_key(entries))
            .await?
        else {
            return Ok(None);
        };
        let payload: ProviderAndContext =
            serde_json::from_slice(&raw).context("decoding reverse index payload")?;
        let provider = if payload.provider.is_empty() {
            self.opts.provider.peer_id
        } else {
            PeerId::from_bytes(&payload.provider).context("decoding reverse index provider")?
        };
        Ok(Some((provider, payload.context_id)))
    }

    async fn put_key_metadata_map(
        &self,
        provider: &PeerId,
        context_id: &[u8],
        metadata: &Metadata,
    ) -> anyhow::Result<()> {
        self.opts
            .ds
            .put(
                &self.key_to_metadata_key(provider, context_id),
                Bytes::copy_from_slice(metadata.as_bytes()),
            )
            .await
    }

    async fn get_key_metadata_map(
        &self,
        provider: &PeerId,
        context_id: &[u8],
    ) -> anyhow::Result<Option<Metadata>> {
        Ok(self
            .opts
            .ds
            .get(&self.key_to_metadata_key(provider, context_id))
            .await?
            .map(Metadata::from))
    }

    async fn delete_key_metadata_map(
        &self,
        provider: &PeerId,
        context_id: &[u8],
    ) -> anyhow::Result<()> {
        self.opts
            .ds
            .delete(&self.key_to_metadata_key(provider, context_id))
            .await
    }

    async fn put_latest_adv(&self, head: &Cid) -> anyhow::Result<()> {
        self.opts
            .ds
            .put(LATEST_ADV_KEY, Bytes::from(head.to_bytes()))
            .await
    }

    async fn get_latest_ad_cid(&self) -> anyhow::Result<Option<Cid>> {
        match self.opts.ds.get(LATEST_ADV_KEY).await? {
            Some(bytes) => Ok(Some(Cid::try_from(bytes.as_ref())?)),
            None => Ok(None),
        }
    }
}

/// The instrumented loader used when serving advertisement data to remote
/// pullers: entry chunks of cached chains come straight from the chunker
/// cache, known entries heads are lazily re-chunked through the
/// registered lister, and everything else reads vanilla.
#[async_trait]
impl BlockSource for Inner {
    async fn block(&self, cid: &Cid) -> anyhow::Result<Option<Bytes>> {
        if *cid == *NO_ENTRIES {
            return Ok(None);
        }
        if let Some(chunker) = self.chunker.get() {
            if let Some(bytes) = chunker.get_cached_block(cid).await? {
                return Ok(Some(bytes));
            }
            if let Some((provider, context_id)) = self.get_cid_key_map(cid).await? {
                let lister = self
                    .lister
                    .read()
                    .clone()
                    .ok_or_else(|| anyhow!("no multihash lister is registered"))?;
                debug!(%cid, provider = %provider, "regenerating entries chain for serving");
                let mhs = lister.multihashes(provider, &context_id).await?;
                chunker.chunk(mhs).await?;
                if let Some(bytes) = chunker.get_cached_block(cid).await? {
                    return Ok(Some(bytes));
                }
                warn!(%cid, "regenerated entries chain no longer contains the requested block");
            }
        }
        self.lsys.load_bytes(cid).await
    }
}

fn keyed(prefix: &[u8], provider: Option<String>, context_id: &[u8]) -> Vec<u8> {
    let mut key = prefix.to_vec();
    if let Some(provider) = provider {
        key.extend_from_slice(provider.as_bytes());
        key.push(b'/');
    }
    key.extend_from_slice(context_id);
    key
}

fn cid_to_key_key(cid: &Cid) -> Vec<u8> {
    let mut key = CID_TO_KEY_PREFIX.to_vec();
    key.extend_from_slice(cid.to_string().as_bytes());
    key
}

fn cid_to_provider_and_key_key(cid: &Cid) -> Vec<u8> {
    let mut key = CID_TO_PROVIDER_AND_KEY_PREFIX.to_vec();
    key.extend_from_slice(cid.to_string().as_bytes());
    key
}
