//! Read-side client: fetch a published advertisement chain and drain its
//! entries with a bounded recursion.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use bytes::Bytes;
use cid::multihash::Multihash;
use cid::Cid;
use libp2p_identity::PeerId;
use multiaddr::Multiaddr;
use tracing::debug;
use url::Url;

use crate::error::{Error, Result};
use crate::schema::{Advertisement, EntryChunk, SignedHead, NO_ENTRIES};
use crate::util::{is_http_multiaddr, multiaddr_to_url};
use crate::AddrInfo;

/// Transport a [`ProviderClient`] pulls advertisement data through.
///
/// [`HttpFetcher`] talks to the HTTP publisher; a dag-sync wire adapter
/// implements the same trait on top of its stream protocol.
#[async_trait]
pub trait AdFetcher: Send + Sync + fmt::Debug + 'static {
    /// The provider's current head, or `None` when nothing was published.
    async fn head(&self) -> AnyResult<Option<Cid>>;

    /// Raw block bytes for `cid`, or `None` when the provider does not
    /// have it.
    async fn block(&self, cid: &Cid) -> AnyResult<Option<Bytes>>;
}

/// Fetcher speaking to the HTTP publisher: `GET /head` for the signed
/// head, `GET /<cid>` for blocks.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    base: Url,
}

impl HttpFetcher {
    pub fn new(base: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            base,
        }
    }
}

#[async_trait]
impl AdFetcher for HttpFetcher {
    async fn head(&self) -> AnyResult<Option<Cid>> {
        let res = self
            .client
            .get(self.base.join("head")?)
            .send()
            .await?
            .error_for_status()?;
        if res.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let signed = SignedHead::from_json(&res.bytes().await?)?;
        let (signer, head) = signed.open()?;
        debug!(%head, %signer, "fetched signed head");
        Ok(Some(head))
    }

    async fn block(&self, cid: &Cid) -> AnyResult<Option<Bytes>> {
        let res = self.client.get(self.base.join(&cid.to_string())?).send().await?;
        if res.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(res.error_for_status()?.bytes().await?))
    }
}

/// An advertisement as seen by the read side, with its entries exposed as
/// a lazily drained sequence.
#[derive(Debug)]
pub struct ClientAdvertisement {
    pub id: Cid,
    pub previous_id: Option<Cid>,
    pub provider_id: PeerId,
    /// The peer that signed the advertisement.
    pub signer: PeerId,
    pub addresses: Vec<Multiaddr>,
    pub context_id: Bytes,
    pub metadata: Bytes,
    pub is_rm: bool,
    pub entries: Entries,
}

/// Detached client for inspecting a provider's advertisement chain.
#[derive(Debug)]
pub struct ProviderClient {
    fetcher: Arc<dyn AdFetcher>,
    entries_recursion_limit: usize,
    strict_entries: bool,
}

impl ProviderClient {
    /// Creates a client for the given provider endpoint, detecting the
    /// transport from the multiaddrs: an HTTP or HTTPS component selects
    /// the HTTP transport. For dag-sync endpoints the wire adapter must
    /// be supplied through [`ProviderClient::with_fetcher`].
    ///
    /// `entries_recursion_limit` bounds how many chunks of an entries
    /// chain are traversed; `0` means unbounded.
    pub fn new(provider: &AddrInfo, entries_recursion_limit: usize) -> Result<Self> {
        for addr in &provider.addrs {
            if is_http_multiaddr(addr) {
                let base = multiaddr_to_url(addr).map_err(Error::transport)?;
                return Ok(Self::with_fetcher(
                    Arc::new(HttpFetcher::new(base)),
                    entries_recursion_limit,
                ));
            }
        }
        Err(Error::Config(
            "provider endpoint is not an http multiaddr; supply a dag-sync fetcher".into(),
        ))
    }

    pub fn with_fetcher(fetcher: Arc<dyn AdFetcher>, entries_recursion_limit: usize) -> Self {
        Self {
            fetcher,
            entries_recursion_limit,
            strict_entries: false,
        }
    }

    /// Makes [`Entries::drain`] fail with [`Error::EntriesTruncated`] when
    /// a chain continues past the recursion limit, instead of returning
    /// the partial result with the [`Entries::truncated`] flag set.
    pub fn strict_entries(mut self, strict: bool) -> Self {
        self.strict_entries = strict;
        self
    }

    /// Fetches the advertisement stored under `cid`, or the provider's
    /// current head when `cid` is `None`. The signature is verified
    /// before the advertisement is returned.
    pub async fn get_advertisement(&self, cid: Option<Cid>) -> Result<ClientAdvertisement> {
        let id = match cid {
            Some(cid) => cid,
            None => self
                .fetcher
                .head()
                .await
                .map_err(Error::transport)?
                .ok_or_else(|| {
                    Error::Other(anyhow::anyhow!(
                        "provider has not published any advertisements"
                    ))
                })?,
        };
        let bytes = self
            .fetcher
            .block(&id)
            .await
            .map_err(Error::transport)?
            .ok_or(Error::NotFound(id))?;
        let adv = Advertisement::decode(&bytes).map_err(|e| Error::Validation(e.to_string()))?;
        let signer = adv.signer()?;
        let provider_id = PeerId::from_str(&adv.provider)
            .map_err(|e| Error::Validation(format!("invalid provider id: {e}")))?;
        let addresses = adv
            .addresses
            .iter()
            .map(|a| {
                a.parse()
                    .map_err(|e| Error::Validation(format!("invalid address {a}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        let entries = Entries::new(
            self.fetcher.clone(),
            adv.entries,
            self.entries_recursion_limit,
            self.strict_entries,
        );
        Ok(ClientAdvertisement {
            id,
            previous_id: adv.previous_id,
            provider_id,
            signer,
            addresses,
            context_id: adv.context_id,
            metadata: adv.metadata,
            is_rm: adv.is_rm,
            entries,
        })
    }
}

/// Lazily drained entries of one advertisement.
#[derive(Debug)]
pub struct Entries {
    fetcher: Arc<dyn AdFetcher>,
    next: Option<Cid>,
    remaining: Option<usize>,
    strict: bool,
    chunk_count: u64,
    truncated: bool,
}

impl Entries {
    fn new(fetcher: Arc<dyn AdFetcher>, head: Cid, recursion_limit: usize, strict: bool) -> Self {
        let next = if head == *NO_ENTRIES { None } else { Some(head) };
        Self {
            fetcher,
            next,
            remaining: (recursion_limit > 0).then_some(recursion_limit),
            strict,
            chunk_count: 0,
            truncated: false,
        }
    }

    /// Returns every multihash reachable within the recursion limit, in
    /// chain order. When the chain continues past the limit,
    /// [`Entries::truncated`] is set and the multihashes read so far are
    /// still returned; [`Entries::chunk_count`] reports how many chunks
    /// were traversed. Under [`ProviderClient::strict_entries`] the
    /// truncation is an [`Error::EntriesTruncated`] error instead.
    pub async fn drain(&mut self) -> Result<Vec<Multihash>> {
        let mut mhs = Vec::new();
        while let Some(cid) = self.next {
            if self.remaining == Some(0) {
                debug!(%cid, "stopping entries traversal at the recursion limit");
                self.truncated = true;
                if self.strict {
                    return Err(Error::EntriesTruncated);
                }
                break;
            }
            let bytes = self
                .fetcher
                .block(&cid)
                .await
                .map_err(Error::transport)?
                .ok_or(Error::NotFound(cid))?;
            let chunk = EntryChunk::decode(&bytes).map_err(|e| Error::Validation(e.to_string()))?;
            mhs.extend(chunk.entries);
            self.chunk_count += 1;
            if let Some(remaining) = &mut self.remaining {
                *remaining -= 1;
            }
            self.next = chunk.next;
        }
        Ok(mhs)
    }

    /// Number of chunks traversed so far.
    pub fn chunk_count(&self) -> u64 {
        self.chunk_count
    }

    /// Whether the chain continued beyond the recursion limit.
    pub fn truncated(&self) -> bool {
        self.truncated
    }
}
