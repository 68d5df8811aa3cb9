//! Chunking of multihash lists into chains of entry blocks, memoised by a
//! persisted LRU cache.
//!
//! The chunker consumes a single-pass multihash stream, splits it into
//! fixed-size [`EntryChunk`] blocks linked head-to-tail, and remembers the
//! resulting chain under a fingerprint of the sequence. Re-chunking the
//! same sequence returns the cached head link without rewriting blocks.
//! Cache state lives in a namespaced datastore section so a restart does
//! not force rechunking of still-relevant advertisements.

use std::num::NonZeroUsize;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use cid::Cid;
use data_encoding::HEXLOWER;
use futures::StreamExt;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use sha2::{Digest, Sha256};

use crate::datastore::Datastore;
use crate::schema::{dag_cbor_cid, EntryChunk};
use crate::MultihashStream;

const CHAIN_KEY_PREFIX: &[u8] = b"chain/";
const BLOCK_KEY_PREFIX: &[u8] = b"block/";

type Fingerprint = [u8; 32];

/// One cached chain: its head link and every block belonging to it.
/// Blocks never belong to two chains.
#[derive(Debug, Clone)]
struct CachedChain {
    head: Cid,
    blocks: Vec<Cid>,
}

/// Persisted form of a cached chain. `seq` is the recency stamp used to
/// rebuild the LRU order on restart.
#[derive(Debug, Serialize, Deserialize)]
struct ChainRecord {
    head: String,
    blocks: Vec<String>,
    seq: u64,
}

#[derive(Debug)]
struct CacheState {
    cache: LruCache<Fingerprint, CachedChain>,
    seq: u64,
}

/// Turns multihash streams into chains of entry blocks, keeping up to
/// `capacity` whole chains cached in a datastore namespace.
#[derive(Debug)]
pub struct CachedEntriesChunker {
    ds: Arc<dyn Datastore>,
    chunk_size: usize,
    state: Mutex<CacheState>,
}

impl CachedEntriesChunker {
    /// Opens the chunker over `ds`, restoring the persisted cache unless
    /// `purge` is set, in which case the namespace is cleared first.
    pub async fn new(
        ds: Arc<dyn Datastore>,
        chunk_size: usize,
        capacity: usize,
        purge: bool,
    ) -> Result<Self> {
        if chunk_size == 0 {
            return Err(anyhow!("entry chunk size must be larger than 0"));
        }
        let capacity =
            NonZeroUsize::new(capacity).ok_or_else(|| anyhow!("cache capacity must be larger than 0"))?;
        let chunker = Self {
            ds,
            chunk_size,
            state: Mutex::new(CacheState {
                cache: LruCache::new(capacity),
                seq: 0,
            }),
        };
        if purge {
            chunker.purge().await?;
        } else {
            chunker.restore().await?;
        }
        Ok(chunker)
    }

    /// Chunks `mhs` into a chain and returns its head link, or `None` when
    /// the stream yields nothing. The head chunk holds the first
    /// multihashes of the stream.
    pub async fn chunk(&self, mut mhs: MultihashStream) -> Result<Option<Cid>> {
        let mut hasher = Sha256::new();
        let mut chunks = Vec::new();
        let mut current = Vec::with_capacity(self.chunk_size);
        while let Some(mh) = mhs.next().await {
            let mh = mh.context("reading multihash stream")?;
            hasher.update(mh.to_bytes());
            current.push(mh);
            if current.len() == self.chunk_size {
                chunks.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            chunks.push(current);
        }
        if chunks.is_empty() {
            return Ok(None);
        }
        let fingerprint: Fingerprint = hasher.finalize().into();

        // Hit: bump recency and return the cached head.
        let hit = {
            let mut state = self.state.lock();
            state.cache.get(&fingerprint).cloned().map(|chain| {
                state.seq += 1;
                (chain, state.seq)
            })
        };
        if let Some((chain, seq)) = hit {
            self.put_chain_record(&fingerprint, &chain, seq).await?;
            debug!(head = %chain.head, "cache hit for entries chain");
            return Ok(Some(chain.head));
        }

        // Miss: encode blocks tail-first so each block links to its
        // successor, then commit them head-first.
        let mut blocks: Vec<(Cid, Vec<u8>)> = Vec::with_capacity(chunks.len());
        let mut next = None;
        for entries in chunks.into_iter().rev() {
            let chunk = EntryChunk::new(entries, next);
            let bytes = chunk.encode()?;
            let cid = dag_cbor_cid(&bytes);
            blocks.push((cid, bytes));
            next = Some(cid);
        }
        blocks.reverse();
        let head = blocks[0].0;

        for (i, (cid, bytes)) in blocks.iter().enumerate() {
            if let Err(err) = self
                .ds
                .put(&block_key(cid), Bytes::from(bytes.clone()))
                .await
            {
                // Leave no partial chain behind.
                for (cid, _) in &blocks[..i] {
                    let _ = self.ds.delete(&block_key(cid)).await;
                }
                return Err(err).context("writing entry chunk block");
            }
        }

        let chain = CachedChain {
            head,
            blocks: blocks.iter().map(|(cid, _)| *cid).collect(),
        };
        let seq = {
            let mut state = self.state.lock();
            state.seq += 1;
            state.seq
        };
        if let Err(err) = self.put_chain_record(&fingerprint, &chain, seq).await {
            for (cid, _) in &blocks {
                let _ = self.ds.delete(&block_key(cid)).await;
            }
            return Err(err);
        }

        let evicted = {
            let mut state = self.state.lock();
            state.cache.push(fingerprint, chain)
        };
        if let Some((evicted_fp, evicted_chain)) = evicted {
            if evicted_fp != fingerprint {
                debug!(head = %evicted_chain.head, "evicting least recently used entries chain");
                self.delete_chain(&evicted_fp, &evicted_chain).await?;
            }
        }

        debug!(head = %head, "cached new entries chain");
        Ok(Some(head))
    }

    /// Raw bytes of a block belonging to any cached chain.
    pub async fn get_cached_block(&self, cid: &Cid) -> Result<Option<Bytes>> {
        self.ds.get(&block_key(cid)).await
    }

    /// Number of cached chains.
    pub fn len(&self) -> usize {
        self.state.lock().cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn restore(&self) -> Result<()> {
        let keys = self.ds.list(CHAIN_KEY_PREFIX).await?;
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(value) = self.ds.get(&key).await? else {
                continue;
            };
            let hex = &key[CHAIN_KEY_PREFIX.len()..];
            let raw = HEXLOWER
                .decode(hex)
                .context("decoding cached chain fingerprint")?;
            let fingerprint: Fingerprint = raw
                .try_into()
                .map_err(|_| anyhow!("cached chain fingerprint has wrong length"))?;
            let record: ChainRecord =
                serde_json::from_slice(&value).context("decoding cached chain record")?;
            let chain = CachedChain {
                head: Cid::try_from(record.head.as_str())?,
                blocks: record
                    .blocks
                    .iter()
                    .map(|b| Cid::try_from(b.as_str()).map_err(Into::into))
                    .collect::<Result<Vec<_>>>()?,
            };
            records.push((record.seq, fingerprint, chain));
        }
        records.sort_by_key(|(seq, _, _)| *seq);

        let mut overflow = Vec::new();
        {
            let mut state = self.state.lock();
            for (seq, fingerprint, chain) in records {
                state.seq = state.seq.max(seq);
                if let Some(evicted) = state.cache.push(fingerprint, chain) {
                    overflow.push(evicted);
                }
            }
        }
        // A capacity reduction across restarts sheds the oldest chains.
        for (fingerprint, chain) in overflow {
            self.delete_chain(&fingerprint, &chain).await?;
        }

        let restored = self.len();
        if restored > 0 {
            debug!(chains = restored, "restored entries chain cache");
        }
        Ok(())
    }

    async fn purge(&self) -> Result<()> {
        let keys = self.ds.list(b"").await?;
        let purged = keys.len();
        for key in keys {
            self.ds.delete(&key).await?;
        }
        if purged > 0 {
            warn!(entries = purged, "purged entries chain cache");
        }
        Ok(())
    }

    async fn put_chain_record(
        &self,
        fingerprint: &Fingerprint,
        chain: &CachedChain,
        seq: u64,
    ) -> Result<()> {
        let record = ChainRecord {
            head: chain.head.to_string(),
            blocks: chain.blocks.iter().map(|c| c.to_string()).collect(),
            seq,
        };
        self.ds
            .put(&chain_key(fingerprint), serde_json::to_vec(&record)?.into())
            .await
            .context("writing cached chain record")
    }

    /// Removes an evicted chain as a whole: its index record and every one
    /// of its blocks.
    async fn delete_chain(&self, fingerprint: &Fingerprint, chain: &CachedChain) -> Result<()> {
        self.ds.delete(&chain_key(fingerprint)).await?;
        for cid in &chain.blocks {
            self.ds.delete(&block_key(cid)).await?;
        }
        Ok(())
    }
}

fn chain_key(fingerprint: &Fingerprint) -> Vec<u8> {
    let mut key = CHAIN_KEY_PREFIX.to_vec();
    key.extend_from_slice(HEXLOWER.encode(fingerprint).as_bytes());
    key
}

fn block_key(cid: &Cid) -> Vec<u8> {
    let mut key = BLOCK_KEY_PREFIX.to_vec();
    key.extend_from_slice(cid.to_string().as_bytes());
    key
}
