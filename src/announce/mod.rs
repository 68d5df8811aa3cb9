//! Fan-out of head-change notifications.
//!
//! An announce is a lightweight message carrying the new head CID and the
//! addresses it can be pulled from. It is broadcast on a gossip topic
//! (binary dag-cbor encoding) and posted to configured indexer URLs (JSON
//! encoding). A missed announcement is recoverable: the stored head stays
//! authoritative and can be re-announced at any time.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;
use libipld::cbor::DagCborCodec;
use libipld::prelude::Codec;
use libipld::Ipld;
use multiaddr::Multiaddr;
use serde::{Deserialize, Serialize};
use tracing::warn;

mod gossip;
mod http;

pub use self::gossip::GossipSender;
pub use self::http::HttpSender;

/// A head-change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// The new head advertisement CID.
    pub cid: Cid,
    /// Addresses the advertisement chain is retrievable at.
    pub addrs: Vec<Multiaddr>,
    /// Opaque extra payload carried on the gossip encoding only.
    pub extra_data: Option<Bytes>,
}

#[derive(Serialize, Deserialize)]
struct MessageWire {
    cid: String,
    addrs: Vec<String>,
}

impl Message {
    pub fn new(cid: Cid, addrs: Vec<Multiaddr>) -> Self {
        Self {
            cid,
            addrs,
            extra_data: None,
        }
    }

    pub fn with_extra_data(mut self, data: Bytes) -> Self {
        self.extra_data = Some(data);
        self
    }

    /// Binary encoding used on the gossip channel.
    pub fn to_cbor(&self) -> Result<Vec<u8>> {
        let mut map = BTreeMap::new();
        map.insert("Cid".to_string(), Ipld::Link(self.cid));
        map.insert(
            "Addrs".to_string(),
            Ipld::List(self.addrs.iter().map(|a| Ipld::Bytes(a.to_vec())).collect()),
        );
        if let Some(extra) = &self.extra_data {
            map.insert("ExtraData".to_string(), Ipld::Bytes(extra.to_vec()));
        }
        DagCborCodec
            .encode(&Ipld::Map(map))
            .context("encoding announce message")
    }

    pub fn from_cbor(bytes: &[u8]) -> Result<Self> {
        let node: Ipld = DagCborCodec
            .decode(bytes)
            .context("decoding announce message")?;
        let map = match &node {
            Ipld::Map(map) => map,
            other => return Err(anyhow!("expected map, got {:?}", other)),
        };
        let cid = match map.get("Cid") {
            Some(Ipld::Link(cid)) => *cid,
            _ => return Err(anyhow!("announce message has no Cid link")),
        };
        let addrs = match map.get("Addrs") {
            Some(Ipld::List(list)) => list
                .iter()
                .map(|a| match a {
                    Ipld::Bytes(b) => Multiaddr::try_from(b.clone()).map_err(Into::into),
                    other => Err(anyhow!("expected multiaddr bytes, got {:?}", other)),
                })
                .collect::<Result<Vec<_>>>()?,
            _ => return Err(anyhow!("announce message has no Addrs list")),
        };
        let extra_data = match map.get("ExtraData") {
            Some(Ipld::Bytes(b)) => Some(Bytes::from(b.clone())),
            _ => None,
        };
        Ok(Self {
            cid,
            addrs,
            extra_data,
        })
    }

    /// JSON encoding used for direct HTTP announcements.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        let wire = MessageWire {
            cid: self.cid.to_string(),
            addrs: self.addrs.iter().map(|a| a.to_string()).collect(),
        };
        Ok(serde_json::to_vec(&wire)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let wire: MessageWire = serde_json::from_slice(bytes)?;
        let addrs = wire
            .addrs
            .iter()
            .map(|a| a.parse().map_err(anyhow::Error::from))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            cid: Cid::try_from(wire.cid.as_str())?,
            addrs,
            extra_data: None,
        })
    }
}

/// One way of delivering announce messages to indexers.
#[async_trait]
pub trait Sender: Send + Sync + fmt::Debug + 'static {
    async fn send(&self, msg: &Message) -> Result<()>;
}

/// Delivers `msg` through every sender. Each failure is logged and does
/// not stop delivery through the remaining senders; the aggregated error
/// is returned so callers that retry out-of-band can observe it.
pub(crate) async fn send_all(senders: &[Box<dyn Sender>], msg: &Message) -> Result<()> {
    let mut errs = Vec::new();
    for sender in senders {
        if let Err(err) = sender.send(msg).await {
            warn!(cid = %msg.cid, ?sender, "failed to send announcement: {err:#}");
            errs.push(format!("{err:#}"));
        }
    }
    if errs.is_empty() {
        Ok(())
    } else {
        Err(anyhow!("{}", errs.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::dag_cbor_cid;

    fn test_message() -> Message {
        Message::new(
            dag_cbor_cid(b"head"),
            vec!["/ip4/127.0.0.1/tcp/3104".parse().unwrap()],
        )
    }

    #[test]
    fn test_cbor_roundtrip() {
        let msg = test_message().with_extra_data(Bytes::from_static(b"extra"));
        let decoded = Message::from_cbor(&msg.to_cbor().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_json_roundtrip() {
        let msg = test_message();
        let decoded = Message::from_json(&msg.to_json().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_json_drops_extra_data() {
        let msg = test_message().with_extra_data(Bytes::from_static(b"extra"));
        let decoded = Message::from_json(&msg.to_json().unwrap()).unwrap();
        assert!(decoded.extra_data.is_none());
    }
}
