//! Operator event streams over WebSocket.
//!
//! Bridges store pub/sub channels to connected operator clients:
//! `/ws/metrics` (periodic fleet snapshot), `/ws/doctor`, `/ws/alerts`, and
//! `/ws/logs/{node_id}`. Clients may send the text `ping` and get a
//! `{"type":"pong"}` back. Delivery is best-effort; a slow or dead client is
//! dropped and reconciles via queries when it reconnects.

use futures_util::{SinkExt, StreamExt};
use muster_registry::NodeRegistry;
use muster_store::{StateStore, Subscription, keys};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tracing::{debug, info, warn};

const METRICS_PUSH_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct WsBridge {
    store: Arc<dyn StateStore>,
    registry: NodeRegistry,
}

impl WsBridge {
    pub fn new(store: Arc<dyn StateStore>, registry: NodeRegistry) -> Self {
        Self { store, registry }
    }

    /// Accept operator connections until shutdown.
    pub async fn serve(
        self,
        bind: &str,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let listener = TcpListener::bind(bind).await?;
        info!(bind, "websocket bridge listening");

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    debug!(%peer, "operator connected");
                    let bridge = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = bridge.handle(stream).await {
                            debug!(%peer, error = %e, "operator connection ended");
                        }
                    });
                }
            }
        }
        info!("websocket bridge stopped");
        Ok(())
    }

    async fn handle(&self, stream: TcpStream) -> anyhow::Result<()> {
        let mut path = String::new();
        let ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
            path = req.uri().path().to_string();
            Ok(resp)
        })
        .await?;

        match path.as_str() {
            "/ws/metrics" => self.stream_metrics(ws).await,
            "/ws/doctor" => {
                self.bridge_channel(ws, self.store.subscribe(keys::CH_DOCTOR_EVENTS), true)
                    .await
            }
            "/ws/alerts" => {
                self.bridge_channel(ws, self.store.subscribe(keys::CH_ALERTS), false)
                    .await
            }
            _ => {
                if let Some(node_id) = path.strip_prefix("/ws/logs/") {
                    let sub = self.store.subscribe(&keys::ch_logs(node_id));
                    return self.bridge_logs(ws, sub, node_id).await;
                }
                warn!(path, "unknown websocket path");
                Ok(())
            }
        }
    }

    /// Periodic full-fleet snapshot, the dashboard's main feed.
    async fn stream_metrics(&self, ws: WebSocketStream<TcpStream>) -> anyhow::Result<()> {
        let (mut sink, mut stream) = ws.split();
        let mut ticker = tokio::time::interval(METRICS_PUSH_INTERVAL);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let nodes = self.registry.list(None, None).await.unwrap_or_default();
                    let update = serde_json::json!({
                        "type": "nodes_update",
                        "data": nodes,
                        "timestamp": chrono::Utc::now(),
                    });
                    sink.send(Message::Text(update.to_string())).await?;
                }
                incoming = stream.next() => {
                    if !handle_client_message(&mut sink, incoming).await? {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Forward a pub/sub channel verbatim.
    async fn bridge_channel(
        &self,
        ws: WebSocketStream<TcpStream>,
        mut sub: Subscription,
        send_hello: bool,
    ) -> anyhow::Result<()> {
        let (mut sink, mut stream) = ws.split();
        if send_hello {
            sink.send(Message::Text(
                serde_json::json!({"type": "connected"}).to_string(),
            ))
            .await?;
        }

        loop {
            tokio::select! {
                maybe = sub.recv() => match maybe {
                    Some(msg) => sink.send(Message::Text(msg.payload)).await?,
                    None => break,
                },
                incoming = stream.next() => {
                    if !handle_client_message(&mut sink, incoming).await? {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Forward a node's log channel, wrapped so clients can distinguish log
    /// lines from control frames.
    async fn bridge_logs(
        &self,
        ws: WebSocketStream<TcpStream>,
        mut sub: Subscription,
        node_id: &str,
    ) -> anyhow::Result<()> {
        let (mut sink, mut stream) = ws.split();
        sink.send(Message::Text(
            serde_json::json!({"type": "connected", "node_id": node_id}).to_string(),
        ))
        .await?;

        loop {
            tokio::select! {
                maybe = sub.recv() => match maybe {
                    Some(msg) => {
                        let frame = serde_json::json!({"type": "log", "data": msg.payload});
                        sink.send(Message::Text(frame.to_string())).await?;
                    }
                    None => break,
                },
                incoming = stream.next() => {
                    if !handle_client_message(&mut sink, incoming).await? {
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Returns `false` once the client is gone.
async fn handle_client_message<S>(
    sink: &mut S,
    incoming: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
) -> anyhow::Result<bool>
where
    S: SinkExt<Message> + Unpin,
    <S as futures_util::Sink<Message>>::Error: std::error::Error + Send + Sync + 'static,
{
    match incoming {
        Some(Ok(Message::Text(text))) => {
            if text == "ping" {
                sink.send(Message::Text(
                    serde_json::json!({"type": "pong"}).to_string(),
                ))
                .await?;
            }
            Ok(true)
        }
        Some(Ok(Message::Close(_))) | None => Ok(false),
        Some(Ok(_)) => Ok(true),
        Some(Err(e)) => {
            debug!(error = %e, "websocket receive error");
            Ok(false)
        }
    }
}
