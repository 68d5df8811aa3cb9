//! Gossip pubsub announcements.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;

use super::{Message, Sender};
use crate::host::Host;

/// Broadcasts announce messages on a named gossip topic through the
/// configured host.
#[derive(Debug)]
pub struct GossipSender {
    host: Arc<dyn Host>,
    topic: String,
}

impl GossipSender {
    pub fn new(host: Arc<dyn Host>, topic: impl Into<String>) -> Self {
        Self {
            host,
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl Sender for GossipSender {
    async fn send(&self, msg: &Message) -> Result<()> {
        let data = Bytes::from(msg.to_cbor()?);
        self.host
            .gossip_publish(&self.topic, data)
            .await
            .with_context(|| format!("publishing announce on topic {}", self.topic))
    }
}

#[cfg(test)]
mod tests {
    use libp2p_identity::{Keypair, PeerId};
    use multiaddr::Multiaddr;
    use parking_lot::Mutex;

    use super::*;
    use crate::schema::dag_cbor_cid;

    #[derive(Debug)]
    struct MemHost {
        peer_id: PeerId,
        published: Mutex<Vec<(String, Bytes)>>,
    }

    #[async_trait]
    impl Host for MemHost {
        fn peer_id(&self) -> PeerId {
            self.peer_id
        }

        fn addrs(&self) -> Vec<Multiaddr> {
            vec!["/ip4/127.0.0.1/tcp/4001".parse().unwrap()]
        }

        async fn gossip_publish(&self, topic: &str, data: Bytes) -> Result<()> {
            self.published.lock().push((topic.to_string(), data));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_send_publishes_cbor_on_topic() {
        let host = Arc::new(MemHost {
            peer_id: Keypair::generate_ed25519().public().to_peer_id(),
            published: Mutex::new(Vec::new()),
        });
        let sender = GossipSender::new(host.clone(), "/indexer/ingest/mainnet");

        let msg = Message::new(dag_cbor_cid(b"head"), host.addrs())
            .with_extra_data(Bytes::from_static(b"xd"));
        sender.send(&msg).await.unwrap();

        let published = host.published.lock();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "/indexer/ingest/mainnet");
        assert_eq!(Message::from_cbor(&published[0].1).unwrap(), msg);
    }
}
