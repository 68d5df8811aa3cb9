//! Seam to the libp2p host.
//!
//! The host itself (swarm, transports, gossipsub behaviour) is an external
//! collaborator. The engine only needs the narrow surface below: the local
//! peer identity, the listen addresses to advertise, and the ability to
//! publish bytes on a gossip topic.

use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use libp2p_identity::PeerId;
use multiaddr::Multiaddr;

/// Handle to the libp2p host shared by the gossip announce sender and the
/// dag-sync publisher.
#[async_trait]
pub trait Host: Send + Sync + fmt::Debug + 'static {
    /// The local peer id.
    fn peer_id(&self) -> PeerId;

    /// The addresses the host is reachable at.
    fn addrs(&self) -> Vec<Multiaddr>;

    /// Publish `data` on the gossip topic `topic`.
    async fn gossip_publish(&self, topic: &str, data: Bytes) -> Result<()>;
}
