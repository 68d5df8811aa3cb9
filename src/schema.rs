//! Wire schema of the advertisement chain.
//!
//! Advertisements and entry chunks are dag-cbor nodes addressed by
//! CIDv1/sha2-256. The advertisement signature is a self-describing
//! envelope: a dag-cbor map of the signer's protobuf-encoded public key and
//! the raw signature over a domain-separated digest of every other field,
//! so a recipient can recover the signing peer from the node alone.

use std::collections::BTreeMap;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use cid::multihash::{Code, Multihash, MultihashDigest};
use cid::Cid;
use libipld::cbor::DagCborCodec;
use libipld::prelude::Codec;
use libipld::Ipld;
use libp2p_identity::{Keypair, PeerId, PublicKey};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Error;

pub const DAG_CBOR_CODEC: u64 = 0x71;
pub const RAW_CODEC: u64 = 0x55;

const AD_SIGNATURE_CODEC: &str = "/indexer/ingest/adSignature";
const HEAD_SIGNATURE_CODEC: &str = "/indexer/ingest/headSignature";

const MAX_CONTEXT_ID_LEN: usize = 64;
const MAX_METADATA_LEN: usize = 1024;

/// Sentinel entries link of removal advertisements and empty multihash
/// lists. The sentinel addresses no stored block.
pub static NO_ENTRIES: Lazy<Cid> =
    Lazy::new(|| Cid::new_v1(RAW_CODEC, Code::Sha2_256.digest(b"NoEntries")));

/// The CID a dag-cbor block is stored under.
pub fn dag_cbor_cid(bytes: &[u8]) -> Cid {
    Cid::new_v1(DAG_CBOR_CODEC, Code::Sha2_256.digest(bytes))
}

/// A signed, chainable statement that a provider holds the multihashes
/// reachable through `entries` under `context_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Peer identity of the provider, in base58 string form.
    pub provider: String,
    /// Addresses the advertised content is retrievable at.
    pub addresses: Vec<String>,
    /// Link to the head of the entry-chunk chain, or [`NO_ENTRIES`].
    pub entries: Cid,
    /// Opaque grouping key, unique per provider.
    pub context_id: Bytes,
    /// Opaque retrieval metadata.
    pub metadata: Bytes,
    /// Whether this advertisement removes the context from the index.
    pub is_rm: bool,
    /// Link to the previous advertisement, absent for the first.
    pub previous_id: Option<Cid>,
    /// Signature envelope over all other fields.
    pub signature: Bytes,
}

impl Advertisement {
    pub fn to_node(&self) -> Ipld {
        let mut map = BTreeMap::new();
        map.insert("Provider".to_string(), Ipld::String(self.provider.clone()));
        map.insert(
            "Addresses".to_string(),
            Ipld::List(
                self.addresses
                    .iter()
                    .map(|a| Ipld::String(a.clone()))
                    .collect(),
            ),
        );
        map.insert("Entries".to_string(), Ipld::Link(self.entries));
        map.insert(
            "ContextID".to_string(),
            Ipld::Bytes(self.context_id.to_vec()),
        );
        map.insert("Metadata".to_string(), Ipld::Bytes(self.metadata.to_vec()));
        map.insert("IsRm".to_string(), Ipld::Bool(self.is_rm));
        if let Some(prev) = self.previous_id {
            map.insert("PreviousID".to_string(), Ipld::Link(prev));
        }
        map.insert("Signature".to_string(), Ipld::Bytes(self.signature.to_vec()));
        Ipld::Map(map)
    }

    pub fn from_node(node: &Ipld) -> Result<Self> {
        let map = as_map(node)?;
        let addresses = as_list(map_get(map, "Addresses")?)?
            .iter()
            .map(|a| Ok(as_str(a)?.to_string()))
            .collect::<Result<Vec<_>>>()?;
        let previous_id = match map.get("PreviousID") {
            Some(node) => Some(as_link(node)?),
            None => None,
        };
        Ok(Self {
            provider: as_str(map_get(map, "Provider")?)?.to_string(),
            addresses,
            entries: as_link(map_get(map, "Entries")?)?,
            context_id: Bytes::from(as_bytes(map_get(map, "ContextID")?)?.to_vec()),
            metadata: Bytes::from(as_bytes(map_get(map, "Metadata")?)?.to_vec()),
            is_rm: as_bool(map_get(map, "IsRm")?)?,
            previous_id,
            signature: Bytes::from(as_bytes(map_get(map, "Signature")?)?.to_vec()),
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        DagCborCodec
            .encode(&self.to_node())
            .context("encoding advertisement")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let node: Ipld = DagCborCodec.decode(bytes).context("decoding advertisement")?;
        Self::from_node(&node)
    }

    /// Domain-separated message the signature covers.
    fn sig_payload(&self) -> Vec<u8> {
        let mut hasher = Sha256::new();
        if let Some(prev) = &self.previous_id {
            hasher.update(prev.to_bytes());
        }
        hasher.update(self.entries.to_bytes());
        hasher.update(self.provider.as_bytes());
        for addr in &self.addresses {
            hasher.update(addr.as_bytes());
        }
        hasher.update(&self.metadata);
        hasher.update([u8::from(self.is_rm)]);
        let digest = hasher.finalize();

        let mut payload = AD_SIGNATURE_CODEC.as_bytes().to_vec();
        payload.extend_from_slice(&digest);
        payload
    }

    /// Signs every other field with `key`, filling `signature`.
    pub fn sign(&mut self, key: &Keypair) -> Result<(), Error> {
        let sig = key
            .sign(&self.sig_payload())
            .map_err(|e| Error::Signature(e.to_string()))?;
        self.signature = encode_envelope(&key.public(), &sig)
            .map_err(|e| Error::Signature(e.to_string()))?
            .into();
        Ok(())
    }

    /// Verifies the signature and returns the signing peer.
    pub fn signer(&self) -> Result<PeerId, Error> {
        let (pubkey, sig) =
            decode_envelope(&self.signature).map_err(|e| Error::Signature(e.to_string()))?;
        if !pubkey.verify(&self.sig_payload(), &sig) {
            return Err(Error::Signature(
                "advertisement signature does not verify".into(),
            ));
        }
        Ok(pubkey.to_peer_id())
    }

    /// Structural validation performed before an advertisement is stored.
    pub fn validate(&self) -> Result<(), Error> {
        PeerId::from_str(&self.provider)
            .map_err(|e| Error::Validation(format!("invalid provider id: {e}")))?;
        if self.context_id.is_empty() {
            return Err(Error::Validation("context ID must not be empty".into()));
        }
        if self.context_id.len() > MAX_CONTEXT_ID_LEN {
            return Err(Error::Validation(format!(
                "context ID longer than {MAX_CONTEXT_ID_LEN} bytes"
            )));
        }
        if self.metadata.is_empty() {
            return Err(Error::Validation("metadata must not be empty".into()));
        }
        if self.metadata.len() > MAX_METADATA_LEN {
            return Err(Error::Validation(format!(
                "metadata longer than {MAX_METADATA_LEN} bytes"
            )));
        }
        if !self.is_rm && self.addresses.is_empty() {
            return Err(Error::Validation(
                "advertisement must carry at least one address".into(),
            ));
        }
        if self.signature.is_empty() {
            return Err(Error::Validation("advertisement is not signed".into()));
        }
        Ok(())
    }
}

/// One block of an entries chain: a bounded multihash list plus an optional
/// link to the next block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryChunk {
    pub entries: Vec<Multihash>,
    pub next: Option<Cid>,
}

impl EntryChunk {
    pub fn new(entries: Vec<Multihash>, next: Option<Cid>) -> Self {
        Self { entries, next }
    }

    pub fn to_node(&self) -> Ipld {
        let mut map = BTreeMap::new();
        map.insert(
            "Entries".to_string(),
            Ipld::List(
                self.entries
                    .iter()
                    .map(|mh| Ipld::Bytes(mh.to_bytes()))
                    .collect(),
            ),
        );
        if let Some(next) = self.next {
            map.insert("Next".to_string(), Ipld::Link(next));
        }
        Ipld::Map(map)
    }

    pub fn from_node(node: &Ipld) -> Result<Self> {
        let map = as_map(node)?;
        let entries = as_list(map_get(map, "Entries")?)?
            .iter()
            .map(|e| Ok(Multihash::from_bytes(as_bytes(e)?)?))
            .collect::<Result<Vec<_>>>()?;
        let next = match map.get("Next") {
            Some(node) => Some(as_link(node)?),
            None => None,
        };
        Ok(Self { entries, next })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        DagCborCodec
            .encode(&self.to_node())
            .context("encoding entry chunk")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let node: Ipld = DagCborCodec.decode(bytes).context("decoding entry chunk")?;
        Self::from_node(&node)
    }
}

/// Head advertisement CID signed by the publisher, served to pullers so
/// they can authenticate the root before walking the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHead {
    head: Cid,
    pubkey: Vec<u8>,
    sig: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct SignedHeadWire {
    head: String,
    pubkey: String,
    sig: String,
}

impl SignedHead {
    pub fn sign(key: &Keypair, head: Cid) -> Result<Self, Error> {
        let sig = key
            .sign(&head_payload(&head))
            .map_err(|e| Error::Signature(e.to_string()))?;
        Ok(Self {
            head,
            pubkey: key.public().encode_protobuf(),
            sig,
        })
    }

    /// Verifies the signature and returns the signer and the head CID.
    pub fn open(&self) -> Result<(PeerId, Cid), Error> {
        let pubkey = PublicKey::try_decode_protobuf(&self.pubkey)
            .map_err(|e| Error::Signature(e.to_string()))?;
        if !pubkey.verify(&head_payload(&self.head), &self.sig) {
            return Err(Error::Signature("head signature does not verify".into()));
        }
        Ok((pubkey.to_peer_id(), self.head))
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        let wire = SignedHeadWire {
            head: self.head.to_string(),
            pubkey: data_encoding::HEXLOWER.encode(&self.pubkey),
            sig: data_encoding::HEXLOWER.encode(&self.sig),
        };
        Ok(serde_json::to_vec(&wire)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let wire: SignedHeadWire = serde_json::from_slice(bytes)?;
        Ok(Self {
            head: Cid::try_from(wire.head.as_str())?,
            pubkey: data_encoding::HEXLOWER.decode(wire.pubkey.as_bytes())?,
            sig: data_encoding::HEXLOWER.decode(wire.sig.as_bytes())?,
        })
    }
}

fn head_payload(head: &Cid) -> Vec<u8> {
    let mut payload = HEAD_SIGNATURE_CODEC.as_bytes().to_vec();
    payload.extend_from_slice(&head.to_bytes());
    payload
}

fn encode_envelope(pubkey: &PublicKey, sig: &[u8]) -> Result<Vec<u8>> {
    let mut map = BTreeMap::new();
    map.insert("PubKey".to_string(), Ipld::Bytes(pubkey.encode_protobuf()));
    map.insert("Sig".to_string(), Ipld::Bytes(sig.to_vec()));
    DagCborCodec
        .encode(&Ipld::Map(map))
        .context("encoding signature envelope")
}

fn decode_envelope(bytes: &[u8]) -> Result<(PublicKey, Vec<u8>)> {
    let node: Ipld = DagCborCodec
        .decode(bytes)
        .context("decoding signature envelope")?;
    let map = as_map(&node)?;
    let pubkey = PublicKey::try_decode_protobuf(as_bytes(map_get(map, "PubKey")?)?)
        .context("decoding envelope public key")?;
    let sig = as_bytes(map_get(map, "Sig")?)?.to_vec();
    Ok((pubkey, sig))
}

fn as_map(node: &Ipld) -> Result<&BTreeMap<String, Ipld>> {
    match node {
        Ipld::Map(map) => Ok(map),
        other => Err(anyhow!("expected map, got {:?}", other)),
    }
}

fn map_get<'a>(map: &'a BTreeMap<String, Ipld>, key: &str) -> Result<&'a Ipld> {
    map.get(key).ok_or_else(|| anyhow!("missing field {key}"))
}

fn as_str(node: &Ipld) -> Result<&str> {
    match node {
        Ipld::String(s) => Ok(s),
        other => Err(anyhow!("expected string, got {:?}", other)),
    }
}

fn as_bytes(node: &Ipld) -> Result<&[u8]> {
    match node {
        Ipld::Bytes(b) => Ok(b),
        other => Err(anyhow!("expected bytes, got {:?}", other)),
    }
}

fn as_bool(node: &Ipld) -> Result<bool> {
    match node {
        Ipld::Bool(b) => Ok(*b),
        other => Err(anyhow!("expected bool, got {:?}", other)),
    }
}

fn as_link(node: &Ipld) -> Result<Cid> {
    match node {
        Ipld::Link(cid) => Ok(*cid),
        other => Err(anyhow!("expected link, got {:?}", other)),
    }
}

fn as_list(node: &Ipld) -> Result<&[Ipld]> {
    match node {
        Ipld::List(list) => Ok(list),
        other => Err(anyhow!("expected list, got {:?}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ad(key: &Keypair, previous_id: Option<Cid>) -> Advertisement {
        Advertisement {
            provider: key.public().to_peer_id().to_base58(),
            addresses: vec!["/ip4/127.0.0.1/tcp/9999".to_string()],
            entries: *NO_ENTRIES,
            context_id: Bytes::from_static(b"test-context"),
            metadata: Bytes::from_static(&[0x80, 0x12]),
            is_rm: false,
            previous_id,
            signature: Bytes::new(),
        }
    }

    #[test]
    fn test_sign_and_recover_signer() {
        let key = Keypair::generate_ed25519();
        let mut ad = test_ad(&key, None);
        ad.sign(&key).unwrap();
        assert_eq!(ad.signer().unwrap(), key.public().to_peer_id());
    }

    #[test]
    fn test_tampering_breaks_signature() {
        let key = Keypair::generate_ed25519();
        let mut ad = test_ad(&key, None);
        ad.sign(&key).unwrap();
        ad.is_rm = true;
        assert!(ad.signer().is_err());
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let key = Keypair::generate_ed25519();
        let prev = dag_cbor_cid(b"previous");
        for previous_id in [None, Some(prev)] {
            let mut ad = test_ad(&key, previous_id);
            ad.sign(&key).unwrap();
            let bytes = ad.encode().unwrap();
            let decoded = Advertisement::decode(&bytes).unwrap();
            assert_eq!(decoded, ad);
            assert_eq!(decoded.previous_id, previous_id);
        }
    }

    #[test]
    fn test_entry_chunk_roundtrip() {
        let entries = vec![
            Code::Sha2_256.digest(b"aa"),
            Code::Sha2_256.digest(b"bb"),
        ];
        let chunk = EntryChunk::new(entries, Some(dag_cbor_cid(b"next")));
        let decoded = EntryChunk::decode(&chunk.encode().unwrap()).unwrap();
        assert_eq!(decoded, chunk);

        let tail = EntryChunk::new(vec![Code::Sha2_256.digest(b"cc")], None);
        let decoded = EntryChunk::decode(&tail.encode().unwrap()).unwrap();
        assert_eq!(decoded, tail);
        assert!(decoded.next.is_none());
    }

    #[test]
    fn test_validate() {
        let key = Keypair::generate_ed25519();
        let mut ad = test_ad(&key, None);
        ad.sign(&key).unwrap();
        ad.validate().unwrap();

        let mut bad = ad.clone();
        bad.context_id = Bytes::new();
        assert!(matches!(bad.validate(), Err(Error::Validation(_))));

        let mut bad = ad.clone();
        bad.addresses.clear();
        assert!(matches!(bad.validate(), Err(Error::Validation(_))));

        let mut bad = ad.clone();
        bad.provider = "not-a-peer-id".to_string();
        assert!(matches!(bad.validate(), Err(Error::Validation(_))));

        let mut bad = ad;
        bad.signature = Bytes::new();
        assert!(matches!(bad.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_signed_head_roundtrip() {
        let key = Keypair::generate_ed25519();
        let head = dag_cbor_cid(b"head");
        let signed = SignedHead::sign(&key, head).unwrap();
        let decoded = SignedHead::from_json(&signed.to_json().unwrap()).unwrap();
        let (signer, got) = decoded.open().unwrap();
        assert_eq!(signer, key.public().to_peer_id());
        assert_eq!(got, head);
    }

    #[test]
    fn test_no_entries_is_stable() {
        assert_eq!(*NO_ENTRIES, *NO_ENTRIES);
        assert_eq!(NO_ENTRIES.codec(), RAW_CODEC);
    }
}
