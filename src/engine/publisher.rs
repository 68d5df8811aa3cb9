//! Transport-abstracted publication of the advertisement head.
//!
//! The publisher owns the current root CID and fans head changes out to
//! the configured announce senders. Three variants exist: a null object
//! for local-only operation, a dag-sync variant that hands the external
//! stream transport a policy-checked serving handle, and an HTTP variant
//! that serves the signed head and raw blocks over a listen address.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use cid::Cid;
use libp2p_identity::{Keypair, PeerId};
use multiaddr::{Multiaddr, Protocol};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::announce::{send_all, Message, Sender};
use crate::datastore::Datastore;
use crate::engine::linksystem::BlockSource;
use crate::engine::policy::SyncPolicy;
use crate::host::Host;
use crate::schema::SignedHead;
use crate::util::{multiaddr_to_socketaddr, socketaddr_to_multiaddr};

const ROOT_KEY: &[u8] = b"root";

/// Head publication over one of the supported transports.
#[derive(Debug)]
pub enum Publisher {
    /// Local-only: advertisements are stored and chained but never
    /// announced.
    None,
    DagSync(DagSyncPublisher),
    Http(HttpPublisher),
}

impl Publisher {
    /// Sets the root without announcing it, so a fresh process does not
    /// regress the advertised head.
    pub async fn set_root(&self, cid: Cid) -> Result<()> {
        match self {
            Publisher::None => Ok(()),
            Publisher::DagSync(p) => p.set_root(cid).await,
            Publisher::Http(p) => {
                p.set_root(cid);
                Ok(())
            }
        }
    }

    /// Sets the root and announces it with the publisher's own addresses.
    pub async fn update_root(&self, cid: Cid) -> Result<()> {
        let addrs = self.addrs();
        self.update_root_with_addrs(cid, addrs).await
    }

    /// Sets the root and announces it with the given addresses.
    pub async fn update_root_with_addrs(&self, cid: Cid, addrs: Vec<Multiaddr>) -> Result<()> {
        match self {
            Publisher::None => Ok(()),
            Publisher::DagSync(p) => p.update_root_with_addrs(cid, addrs).await,
            Publisher::Http(p) => p.update_root_with_addrs(cid, addrs).await,
        }
    }

    /// The addresses announces carry by default.
    pub fn addrs(&self) -> Vec<Multiaddr> {
        match self {
            Publisher::None => Vec::new(),
            Publisher::DagSync(p) => p.host.addrs(),
            Publisher::Http(p) => vec![p.listen_multiaddr.clone()],
        }
    }

    pub async fn close(&self) -> Result<()> {
        match self {
            Publisher::None | Publisher::DagSync(_) => Ok(()),
            Publisher::Http(p) => p.close().await,
        }
    }
}

/// Publisher over the dag-sync stream protocol.
///
/// The wire transport is external; it drives [`DagSyncPublisher::handle`]
/// to answer inbound pulls, filtered through the allow-policy.
#[derive(Debug)]
pub struct DagSyncPublisher {
    host: Arc<dyn Host>,
    ds: Arc<dyn Datastore>,
    root: Arc<RwLock<Option<Cid>>>,
    policy: SyncPolicy,
    source: Arc<dyn BlockSource>,
    senders: Vec<Box<dyn Sender>>,
    extra_data: Option<Bytes>,
}

impl DagSyncPublisher {
    pub async fn new(
        host: Arc<dyn Host>,
        ds: Arc<dyn Datastore>,
        source: Arc<dyn BlockSource>,
        policy: SyncPolicy,
        senders: Vec<Box<dyn Sender>>,
        extra_data: Option<Bytes>,
    ) -> Result<Self> {
        // Restore the previously published root, if any.
        let root = match ds.get(ROOT_KEY).await? {
            Some(bytes) => Some(Cid::try_from(bytes.as_ref()).context("decoding persisted root")?),
            None => None,
        };
        Ok(Self {
            host,
            ds,
            root: Arc::new(RwLock::new(root)),
            policy,
            source,
            senders,
            extra_data,
        })
    }

    async fn set_root(&self, cid: Cid) -> Result<()> {
        *self.root.write() = Some(cid);
        self.ds
            .put(ROOT_KEY, Bytes::from(cid.to_bytes()))
            .await
            .context("persisting root")
    }

    async fn update_root_with_addrs(&self, cid: Cid, addrs: Vec<Multiaddr>) -> Result<()> {
        self.set_root(cid).await?;
        let mut msg = Message::new(cid, addrs);
        if let Some(extra) = &self.extra_data {
            msg = msg.with_extra_data(extra.clone());
        }
        send_all(&self.senders, &msg).await
    }

    /// Serving handle for the external stream transport.
    pub fn handle(&self) -> DagSyncHandle {
        DagSyncHandle {
            root: self.root.clone(),
            policy: self.policy.clone(),
            source: self.source.clone(),
        }
    }
}

/// Answers pulls of the advertisement DAG on behalf of a
/// [`DagSyncPublisher`].
#[derive(Debug, Clone)]
pub struct DagSyncHandle {
    root: Arc<RwLock<Option<Cid>>>,
    policy: SyncPolicy,
    source: Arc<dyn BlockSource>,
}

impl DagSyncHandle {
    /// The current root, or `None` when nothing was published yet.
    pub fn head(&self, peer: &PeerId) -> Result<Option<Cid>> {
        if !self.policy.allowed(peer) {
            return Err(anyhow!("peer {peer} is not allowed to sync"));
        }
        Ok(*self.root.read())
    }

    /// Block bytes for `cid`, or `None` when unknown.
    pub async fn fetch_block(&self, peer: &PeerId, cid: &Cid) -> Result<Option<Bytes>> {
        if !self.policy.allowed(peer) {
            return Err(anyhow!("peer {peer} is not allowed to sync"));
        }
        self.source.block(cid).await
    }
}

/// Publisher over HTTP: serves `GET /head` (signed head) and `GET /:cid`
/// (raw block bytes) on the configured listen address.
#[derive(Debug)]
pub struct HttpPublisher {
    listen_multiaddr: Multiaddr,
    root: Arc<RwLock<Option<Cid>>>,
    senders: Vec<Box<dyn Sender>>,
    extra_data: Option<Bytes>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug, Clone)]
struct ServerState {
    key: Keypair,
    root: Arc<RwLock<Option<Cid>>>,
    source: Arc<dyn BlockSource>,
}

impl HttpPublisher {
    pub async fn new(
        listen_addr: &Multiaddr,
        key: Keypair,
        source: Arc<dyn BlockSource>,
        senders: Vec<Box<dyn Sender>>,
        extra_data: Option<Bytes>,
    ) -> Result<Self> {
        let addr = multiaddr_to_socketaddr(listen_addr)
            .context("http publisher listen address must be a tcp ip multiaddr")?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding http publisher to {addr}"))?;
        let local_addr = listener.local_addr()?;
        let mut listen_multiaddr = socketaddr_to_multiaddr(local_addr);
        listen_multiaddr.push(Protocol::Http);

        let root = Arc::new(RwLock::new(None));
        let state = ServerState {
            key,
            root: root.clone(),
            source,
        };
        let app = Router::new()
            .route("/head", get(serve_head))
            .route("/:cid", get(serve_block))
            .with_state(state);

        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        let task = tokio::spawn(async move {
            let res = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(err) = res {
                error!("http publisher server failed: {err:#}");
            }
        });
        info!(addr = %local_addr, "http publisher listening");

        Ok(Self {
            listen_multiaddr,
            root,
            senders,
            extra_data,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    fn set_root(&self, cid: Cid) {
        *self.root.write() = Some(cid);
    }

    async fn update_root_with_addrs(&self, cid: Cid, addrs: Vec<Multiaddr>) -> Result<()> {
        self.set_root(cid);
        let mut msg = Message::new(cid, addrs);
        if let Some(extra) = &self.extra_data {
            msg = msg.with_extra_data(extra.clone());
        }
        send_all(&self.senders, &msg).await
    }

    async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.await.context("joining http publisher server task")?;
        }
        debug!("http publisher closed");
        Ok(())
    }
}

async fn serve_head(State(state): State<ServerState>) -> Response {
    let root = *state.root.read();
    let Some(root) = root else {
        return StatusCode::NO_CONTENT.into_response();
    };
    let signed = match SignedHead::sign(&state.key, root) {
        Ok(signed) => signed,
        Err(err) => {
            error!("failed to sign head: {err:#}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    match signed.to_json() {
        Ok(body) => ([(header::CONTENT_TYPE, "application/json")], body).into_response(),
        Err(err) => {
            error!("failed to encode signed head: {err:#}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn serve_block(State(state): State<ServerState>, Path(cid): Path<String>) -> Response {
    let Ok(cid) = Cid::try_from(cid.as_str()) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    match state.source.block(&cid).await {
        Ok(Some(bytes)) => (
            [(header::CONTENT_TYPE, "application/octet-stream")],
            bytes.to_vec(),
        )
            .into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => {
            error!(%cid, "failed to serve block: {err:#}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;

    use super::*;
    use crate::datastore::MemDatastore;
    use crate::schema::dag_cbor_cid;
    use crate::util::multiaddr_to_url;

    #[derive(Debug, Default)]
    struct MemSource {
        blocks: HashMap<Cid, Bytes>,
    }

    #[async_trait]
    impl BlockSource for MemSource {
        async fn block(&self, cid: &Cid) -> Result<Option<Bytes>> {
            Ok(self.blocks.get(cid).cloned())
        }
    }

    #[derive(Debug, Default)]
    struct RecordingSender {
        sent: Mutex<Vec<Message>>,
    }

    #[async_trait]
    impl Sender for RecordingSender {
        async fn send(&self, msg: &Message) -> Result<()> {
            self.sent.lock().push(msg.clone());
            Ok(())
        }
    }

    async fn http_publisher(source: MemSource) -> (HttpPublisher, Keypair) {
        let key = Keypair::generate_ed25519();
        let listen: Multiaddr = "/ip4/127.0.0.1/tcp/0".parse().unwrap();
        let publisher = HttpPublisher::new(&listen, key.clone(), Arc::new(source), Vec::new(), None)
            .await
            .unwrap();
        (publisher, key)
    }

    #[tokio::test]
    async fn test_http_serves_signed_head_and_blocks() {
        let cid = dag_cbor_cid(b"block");
        let mut source = MemSource::default();
        source.blocks.insert(cid, Bytes::from_static(b"block"));
        let (publisher, key) = http_publisher(source).await;

        let base = multiaddr_to_url(&publisher.listen_multiaddr).unwrap();
        let client = reqwest::Client::new();

        // No head published yet.
        let res = client.get(base.join("head").unwrap()).send().await.unwrap();
        assert_eq!(res.status(), reqwest::StatusCode::NO_CONTENT);

        publisher.set_root(cid);
        let res = client.get(base.join("head").unwrap()).send().await.unwrap();
        let signed = SignedHead::from_json(&res.bytes().await.unwrap()).unwrap();
        let (signer, head) = signed.open().unwrap();
        assert_eq!(signer, key.public().to_peer_id());
        assert_eq!(head, cid);

        let res = client
            .get(base.join(&cid.to_string()).unwrap())
            .send()
            .await
            .unwrap();
        assert_eq!(res.bytes().await.unwrap().as_ref(), b"block");

        let missing = dag_cbor_cid(b"missing");
        let res = client
            .get(base.join(&missing.to_string()).unwrap())
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), reqwest::StatusCode::NOT_FOUND);

        publisher.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_http_update_root_announces() {
        let key = Keypair::generate_ed25519();
        let listen: Multiaddr = "/ip4/127.0.0.1/tcp/0".parse().unwrap();
        let sender = Arc::new(RecordingSender::default());
        let relay = sender.clone();

        #[derive(Debug)]
        struct Relay(Arc<RecordingSender>);
        #[async_trait]
        impl Sender for Relay {
            async fn send(&self, msg: &Message) -> Result<()> {
                self.0.send(msg).await
            }
        }

        let publisher = HttpPublisher::new(
            &listen,
            key,
            Arc::new(MemSource::default()),
            vec![Box::new(Relay(relay))],
            None,
        )
        .await
        .unwrap();

        let cid = dag_cbor_cid(b"head");
        let override_addrs: Vec<Multiaddr> = vec!["/dns4/pub.example/tcp/443/https".parse().unwrap()];
        publisher
            .update_root_with_addrs(cid, override_addrs.clone())
            .await
            .unwrap();

        let sent = sender.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].cid, cid);
        assert_eq!(sent[0].addrs, override_addrs);
        drop(sent);
        publisher.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_dagsync_handle_enforces_policy() {
        #[derive(Debug)]
        struct NullHost(PeerId);
        #[async_trait]
        impl Host for NullHost {
            fn peer_id(&self) -> PeerId {
                self.0
            }
            fn addrs(&self) -> Vec<Multiaddr> {
                vec!["/ip4/127.0.0.1/tcp/4001".parse().unwrap()]
            }
            async fn gossip_publish(&self, _topic: &str, _data: Bytes) -> Result<()> {
                Ok(())
            }
        }

        let allowed = Keypair::generate_ed25519().public().to_peer_id();
        let banned = Keypair::generate_ed25519().public().to_peer_id();
        let host = Arc::new(NullHost(allowed));

        let cid = dag_cbor_cid(b"block");
        let mut source = MemSource::default();
        source.blocks.insert(cid, Bytes::from_static(b"block"));

        let publisher = DagSyncPublisher::new(
            host,
            Arc::new(MemDatastore::new()),
            Arc::new(source),
            SyncPolicy::allow_all_except(vec![banned]),
            Vec::new(),
            None,
        )
        .await
        .unwrap();
        publisher.set_root(cid).await.unwrap();

        let handle = publisher.handle();
        assert_eq!(handle.head(&allowed).unwrap(), Some(cid));
        assert!(handle.head(&banned).is_err());
        assert!(handle.fetch_block(&allowed, &cid).await.unwrap().is_some());
        assert!(handle.fetch_block(&banned, &cid).await.is_err());
    }

    #[tokio::test]
    async fn test_dagsync_persists_root() {
        #[derive(Debug)]
        struct NullHost(PeerId);
        #[async_trait]
        impl Host for NullHost {
            fn peer_id(&self) -> PeerId {
                self.0
            }
            fn addrs(&self) -> Vec<Multiaddr> {
                Vec::new()
            }
            async fn gossip_publish(&self, _topic: &str, _data: Bytes) -> Result<()> {
                Ok(())
            }
        }
        let peer = Keypair::generate_ed25519().public().to_peer_id();
        let ds: Arc<dyn Datastore> = Arc::new(MemDatastore::new());
        let cid = dag_cbor_cid(b"root");

        let publisher = DagSyncPublisher::new(
            Arc::new(NullHost(peer)),
            ds.clone(),
            Arc::new(MemSource::default()),
            SyncPolicy::default(),
            Vec::new(),
            None,
        )
        .await
        .unwrap();
        publisher.set_root(cid).await.unwrap();
        drop(publisher);

        let publisher = DagSyncPublisher::new(
            Arc::new(NullHost(peer)),
            ds,
            Arc::new(MemSource::default()),
            SyncPolicy::default(),
            Vec::new(),
            None,
        )
        .await
        .unwrap();
        assert_eq!(publisher.handle().head(&peer).unwrap(), Some(cid));
    }
}
