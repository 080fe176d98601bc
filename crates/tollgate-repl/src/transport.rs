//! Peer transports: in-process loopback and TCP.

use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ReplError, Result};
use crate::protocol::{read_message, write_message, Message, PullRequest, PulledEvents, PushAck, PushBatch, ResolveNotice};
use crate::registry::PeerRecord;

/// Serves replication requests arriving from peers.
#[async_trait]
pub trait PeerHandler: Send + Sync {
    /// Answer one request.
    async fn handle(&self, message: Message) -> Message;
}

/// Carries requests to a peer and returns its reply.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Send one request and wait for the reply.
    async fn request(&self, peer: &PeerRecord, message: Message) -> Result<Message>;

    /// Push events; the peer answers with an ack.
    async fn push(&self, peer: &PeerRecord, batch: PushBatch) -> Result<PushAck> {
        match self.request(peer, Message::Push(batch)).await? {
            Message::Ack(ack) => Ok(ack),
            other => Err(unexpected(peer, other)),
        }
    }

    /// Pull the peer's events.
    async fn pull(&self, peer: &PeerRecord, request: PullRequest) -> Result<PulledEvents> {
        match self.request(peer, Message::Pull(request)).await? {
            Message::Events(events) => Ok(events),
            other => Err(unexpected(peer, other)),
        }
    }

    /// Announce a resolved score.
    async fn resolve(&self, peer: &PeerRecord, notice: ResolveNotice) -> Result<()> {
        match self.request(peer, Message::Resolve(notice)).await? {
            Message::Ack(_) => Ok(()),
            other => Err(unexpected(peer, other)),
        }
    }
}

fn unexpected(peer: &PeerRecord, reply: Message) -> ReplError {
    match reply {
        Message::Error { msg } => ReplError::SyncUnreachable {
            node_id: peer.node_id.clone(),
            msg,
        },
        other => ReplError::Protocol {
            msg: format!("unexpected {} reply from {}", other.kind(), peer.node_id),
        },
    }
}

/// In-process transport connecting replicators in one address space.
#[derive(Default)]
pub struct LoopbackTransport {
    handlers: RwLock<HashMap<String, Weak<dyn PeerHandler>>>,
    down: RwLock<HashSet<String>>,
}

impl LoopbackTransport {
    /// Create an empty loopback network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a handler under `endpoint`.
    pub fn attach(&self, endpoint: impl Into<String>, handler: &Arc<dyn PeerHandler>) {
        self.handlers.write().insert(endpoint.into(), Arc::downgrade(handler));
    }

    /// Simulate a network partition (or heal it) for `endpoint`.
    pub fn set_reachable(&self, endpoint: &str, reachable: bool) {
        if reachable {
            self.down.write().remove(endpoint);
        } else {
            self.down.write().insert(endpoint.to_string());
        }
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn request(&self, peer: &PeerRecord, message: Message) -> Result<Message> {
        if self.down.read().contains(&peer.endpoint) {
            return Err(ReplError::SyncUnreachable {
                node_id: peer.node_id.clone(),
                msg: "endpoint unreachable".to_string(),
            });
        }
        let handler = self
            .handlers
            .read()
            .get(&peer.endpoint)
            .and_then(Weak::upgrade)
            .ok_or_else(|| ReplError::SyncUnreachable {
                node_id: peer.node_id.clone(),
                msg: format!("nothing listening on {}", peer.endpoint),
            })?;
        Ok(handler.handle(message).await)
    }
}

/// TCP transport configuration.
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// Connection timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Whether to enable TCP_NODELAY.
    pub nodelay: bool,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            nodelay: true,
        }
    }
}

/// Transport that opens one TCP connection per request.
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    config: TcpTransportConfig,
}

impl TcpTransport {
    /// Creates a new TCP transport with the given configuration.
    pub fn new(config: TcpTransportConfig) -> Self {
        Self { config }
    }

    async fn connect(&self, peer: &PeerRecord) -> Result<TcpStream> {
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&peer.endpoint))
            .await
            .map_err(|_| ReplError::Timeout {
                node_id: peer.node_id.clone(),
                timeout_ms: self.config.connect_timeout_ms,
            })?
            .map_err(|e| ReplError::SyncUnreachable {
                node_id: peer.node_id.clone(),
                msg: e.to_string(),
            })?;
        if self.config.nodelay {
            stream.set_nodelay(true)?;
        }
        debug!(addr = %peer.endpoint, "TCP connected");
        Ok(stream)
    }
}

#[async_trait]
impl PeerTransport for TcpTransport {
    async fn request(&self, peer: &PeerRecord, message: Message) -> Result<Message> {
        let mut stream = self.connect(peer).await?;
        write_message(&mut stream, &message).await?;
        read_message(&mut stream).await
    }
}

/// Accept peer connections on `listener` until `cancel` fires.
///
/// Each connection may carry any number of request/reply exchanges.
pub async fn serve(listener: TcpListener, handler: Arc<dyn PeerHandler>, cancel: CancellationToken) -> Result<()> {
    let local = listener.local_addr()?;
    info!(addr = %local, "replication listener started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let handler = handler.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(stream, handler, cancel).await {
                        debug!(peer_addr = %addr, error = %e, "replication connection closed with error");
                    }
                });
            }
        }
    }
    info!(addr = %local, "replication listener stopped");
    Ok(())
}

async fn serve_connection(mut stream: TcpStream, handler: Arc<dyn PeerHandler>, cancel: CancellationToken) -> Result<()> {
    stream.set_nodelay(true)?;
    loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            request = read_message(&mut stream) => request,
        };
        let request = match request {
            Ok(m) => m,
            Err(ReplError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };
        let reply = handler.handle(request).await;
        write_message(&mut stream, &reply).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Echo {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PeerHandler for Echo {
        async fn handle(&self, message: Message) -> Message {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match message {
                Message::Push(batch) => Message::Ack(PushAck {
                    applied: batch.events.len() as u32,
                    ..PushAck::default()
                }),
                Message::Pull(req) => Message::Events(PulledEvents {
                    last_id: req.after_id + 1,
                    ..PulledEvents::default()
                }),
                Message::Resolve(_) => Message::Ack(PushAck::default()),
                _ => Message::Error { msg: "bad request".into() },
            }
        }
    }

    fn peer(endpoint: &str) -> PeerRecord {
        PeerRecord::new("b", endpoint, 0)
    }

    fn empty_push() -> PushBatch {
        PushBatch {
            from: "a".into(),
            events: vec![],
            views: vec![],
        }
    }

    mod loopback {
        use super::*;

        #[tokio::test]
        async fn test_routes_to_attached_handler() {
            let net = LoopbackTransport::new();
            let echo: Arc<dyn PeerHandler> = Arc::new(Echo::default());
            net.attach("b", &echo);
            let pulled = net
                .pull(
                    &peer("b"),
                    PullRequest {
                        from: "a".into(),
                        after_id: 4,
                        limit: 10,
                    },
                )
                .await
                .unwrap();
            assert_eq!(pulled.last_id, 5);
        }

        #[tokio::test]
        async fn test_partition() {
            let net = LoopbackTransport::new();
            let echo: Arc<dyn PeerHandler> = Arc::new(Echo::default());
            net.attach("b", &echo);
            net.set_reachable("b", false);
            assert!(matches!(
                net.push(&peer("b"), empty_push()).await,
                Err(ReplError::SyncUnreachable { .. })
            ));
            net.set_reachable("b", true);
            assert!(net.push(&peer("b"), empty_push()).await.is_ok());
        }

        #[tokio::test]
        async fn test_dropped_handler_is_unreachable() {
            let net = LoopbackTransport::new();
            {
                let echo: Arc<dyn PeerHandler> = Arc::new(Echo::default());
                net.attach("b", &echo);
            }
            assert!(net.push(&peer("b"), empty_push()).await.is_err());
        }

        #[tokio::test]
        async fn test_error_reply_maps_to_unreachable() {
            let net = LoopbackTransport::new();
            let echo: Arc<dyn PeerHandler> = Arc::new(Echo::default());
            net.attach("b", &echo);
            let reply = net.request(&peer("b"), Message::Ack(PushAck::default())).await.unwrap();
            assert_eq!(reply.kind(), "error");
            let err = unexpected(&peer("b"), reply);
            assert!(matches!(err, ReplError::SyncUnreachable { .. }));
        }
    }

    mod tcp {
        use super::*;

        #[tokio::test]
        async fn test_request_over_tcp() {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap().to_string();
            let echo = Arc::new(Echo::default());
            let cancel = CancellationToken::new();
            let server = tokio::spawn(serve(listener, echo.clone(), cancel.clone()));

            let transport = TcpTransport::default();
            let ack = transport.push(&peer(&addr), empty_push()).await.unwrap();
            assert_eq!(ack.applied, 0);
            transport
                .resolve(
                    &peer(&addr),
                    ResolveNotice {
                        from: "a".into(),
                        user_id: "u".into(),
                        score: 50.0,
                        authority: None,
                        timestamp_ms: 1,
                    },
                )
                .await
                .unwrap();
            assert_eq!(echo.calls.load(Ordering::SeqCst), 2);

            cancel.cancel();
            server.await.unwrap().unwrap();
        }

        #[tokio::test]
        async fn test_connect_refused() {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap().to_string();
            drop(listener);
            let transport = TcpTransport::new(TcpTransportConfig {
                connect_timeout_ms: 500,
                nodelay: true,
            });
            assert!(transport.push(&peer(&addr), empty_push()).await.is_err());
        }
    }
}
