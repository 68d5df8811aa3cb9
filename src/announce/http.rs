//! Direct HTTP announcements.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use libp2p_identity::PeerId;
use url::Url;

use super::{Message, Sender};

/// Posts announce messages to a fixed set of indexer URLs, identified by
/// the engine's peer id.
#[derive(Debug)]
pub struct HttpSender {
    client: reqwest::Client,
    urls: Vec<Url>,
    peer_id: PeerId,
}

impl HttpSender {
    pub fn new(urls: Vec<Url>, peer_id: PeerId) -> Result<Self> {
        if urls.is_empty() {
            return Err(anyhow!("at least one announce URL is required"));
        }
        let client = reqwest::Client::builder()
            .user_agent(format!("ipni-provider/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .context("creating http announce client")?;
        Ok(Self {
            client,
            urls,
            peer_id,
        })
    }
}

#[async_trait]
impl Sender for HttpSender {
    async fn send(&self, msg: &Message) -> Result<()> {
        let body = msg.to_json()?;
        let mut errs = Vec::new();
        for url in &self.urls {
            let res = self
                .client
                .post(url.clone())
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .header("X-Peer-Id", self.peer_id.to_base58())
                .body(body.clone())
                .send()
                .await
                .and_then(|res| res.error_for_status());
            if let Err(err) = res {
                errs.push(format!("{url}: {err}"));
            }
        }
        if errs.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("announce failed for: {}", errs.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::extract::State;
    use axum::routing::post;
    use axum::Router;
    use libp2p_identity::Keypair;
    use parking_lot::Mutex;

    use super::*;
    use crate::schema::dag_cbor_cid;

    #[tokio::test]
    async fn test_send_posts_to_every_url() {
        let received: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route(
                "/announce",
                post(
                    |State(received): State<Arc<Mutex<Vec<Vec<u8>>>>>, body: axum::body::Bytes| async move {
                        received.lock().push(body.to_vec());
                        axum::http::StatusCode::NO_CONTENT
                    },
                ),
            )
            .with_state(received.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move { axum::serve(listener, app).await });

        let url: Url = format!("http://{addr}/announce").parse().unwrap();
        let peer_id = Keypair::generate_ed25519().public().to_peer_id();
        let sender = HttpSender::new(vec![url], peer_id).unwrap();

        let msg = Message::new(
            dag_cbor_cid(b"head"),
            vec!["/ip4/127.0.0.1/tcp/3104".parse().unwrap()],
        );
        sender.send(&msg).await.unwrap();

        let bodies = received.lock();
        assert_eq!(bodies.len(), 1);
        let decoded = Message::from_json(&bodies[0]).unwrap();
        assert_eq!(decoded, msg);
        server.abort();
    }

    #[tokio::test]
    async fn test_send_reports_unreachable_url() {
        let url: Url = "http://127.0.0.1:1/announce".parse().unwrap();
        let peer_id = Keypair::generate_ed25519().public().to_peer_id();
        let sender = HttpSender::new(vec![url], peer_id).unwrap();
        let msg = Message::new(dag_cbor_cid(b"head"), Vec::new());
        assert!(sender.send(&msg).await.is_err());
    }
}
