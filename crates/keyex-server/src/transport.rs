//! WebSocket transport for the federation service.
//!
//! Each connection carries one call at a time. While a `GetKeys` call is
//! streaming, the only frames the server reads are `Ack`s for that call; any
//! other call frame is refused with a `CALL_IN_PROGRESS` error.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Router,
};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use keyex_federation::{
    FederationError, FederationService, Frame, Method, SignedSubResponse, StreamSink,
};
use tracing::{debug, info, warn};

pub const FEDERATION_PATH: &str = "/_keyex/federation/v1";

/// Build the federation WebSocket router.
pub fn build_router(service: Arc<FederationService>) -> Router {
    Router::new()
        .route(FEDERATION_PATH, get(ws_handler))
        .with_state(service)
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(service): State<Arc<FederationService>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, service))
}

/// Handle a single federation peer connection.
async fn handle_connection(socket: WebSocket, service: Arc<FederationService>) {
    let (mut sender, mut receiver) = socket.split();
    let connection_id = uuid::Uuid::new_v4();
    info!(connection = %connection_id, "Federation peer connected");

    while let Some(Ok(msg)) = receiver.next().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let frame = match Frame::from_text(text.as_str()) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(connection = %connection_id, "Dropping malformed frame: {}", e);
                continue;
            }
        };
        let Some(method) = frame.method() else {
            debug!(connection = %connection_id, "Ignoring {:?} outside a call", frame);
            continue;
        };

        let call_id = frame.call_id();
        info!(
            connection = %connection_id,
            call_id,
            method = method.name(),
            method_id = %format!("{:#018x}", method.id()),
            "Federation call"
        );

        let reply = match method {
            Method::GetVersion => Frame::Version { call_id, version: service.get_version() },
            Method::GetKeys => {
                let mut sink = WsSink::new(call_id, &mut sender, &mut receiver);
                match service.get_keys(&mut sink).await {
                    Ok(_) => Frame::Return { call_id },
                    Err(e) => Frame::error(call_id, &e),
                }
            }
            Method::SendTransactions => match service.send_transactions().await {
                Ok(()) => Frame::Return { call_id },
                Err(e) => Frame::error(call_id, &e),
            },
            Method::Backfill => match service.backfill().await {
                Ok(()) => Frame::Return { call_id },
                Err(e) => Frame::error(call_id, &e),
            },
        };

        if let Err(e) = send_frame(&mut sender, &reply).await {
            warn!(connection = %connection_id, "Failed to reply to call {}: {}", call_id, e);
            break;
        }
    }

    info!(connection = %connection_id, "Federation peer disconnected");
}

async fn send_frame(
    sender: &mut SplitSink<WebSocket, Message>,
    frame: &Frame,
) -> Result<(), FederationError> {
    let text = frame.to_text()?;
    sender
        .send(Message::Text(text.into()))
        .await
        .map_err(|e| FederationError::StreamAborted(e.to_string()))
}

// ─── WebSocket sink ──────────────────────────────────────────────────────────

/// Forwards a `GetKeys` stream to the peer.
///
/// Each write is held until the peer acks its sequence number, so the flow
/// credit behind it is only released once the peer has taken it.
struct WsSink<'a> {
    call_id: u64,
    seq: u64,
    sender: &'a mut SplitSink<WebSocket, Message>,
    receiver: &'a mut SplitStream<WebSocket>,
}

impl<'a> WsSink<'a> {
    fn new(
        call_id: u64,
        sender: &'a mut SplitSink<WebSocket, Message>,
        receiver: &'a mut SplitStream<WebSocket>,
    ) -> Self {
        Self { call_id, seq: 0, sender, receiver }
    }

    async fn await_ack(&mut self, expected: u64) -> Result<(), FederationError> {
        loop {
            let msg = match self.receiver.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => return Err(FederationError::StreamAborted(e.to_string())),
                None => return Err(FederationError::StreamAborted("peer disconnected".into())),
            };
            let text = match msg {
                Message::Text(text) => text,
                Message::Close(_) => {
                    return Err(FederationError::StreamAborted("peer closed the connection".into()));
                }
                _ => continue,
            };

            let frame = match Frame::from_text(text.as_str()) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Dropping malformed frame during call {}: {}", self.call_id, e);
                    continue;
                }
            };
            match frame {
                Frame::Ack { call_id, seq } if call_id == self.call_id => {
                    if seq != expected {
                        return Err(FederationError::StreamAborted(format!(
                            "expected ack {expected}, got {seq}"
                        )));
                    }
                    return Ok(());
                }
                other if other.method().is_some() => {
                    let refusal = Frame::Error {
                        call_id: other.call_id(),
                        kind: "CALL_IN_PROGRESS".into(),
                        message: format!("call {} is still streaming", self.call_id),
                    };
                    send_frame(self.sender, &refusal).await?;
                }
                other => debug!("Ignoring {:?} during call {}", other, self.call_id),
            }
        }
    }
}

#[async_trait]
impl StreamSink for WsSink<'_> {
    async fn on_sub_response(&mut self, response: &SignedSubResponse) -> Result<(), FederationError> {
        let seq = self.seq;
        let frame = Frame::Write { call_id: self.call_id, seq, value: response.clone() };
        send_frame(self.sender, &frame).await?;
        self.await_ack(seq).await?;
        self.seq += 1;
        Ok(())
    }

    async fn on_complete(&mut self) -> Result<(), FederationError> {
        send_frame(self.sender, &Frame::Done { call_id: self.call_id }).await?;
        self.await_ack(self.seq).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::{SinkExt, StreamExt};
    use keyex_federation::{KeyRing, ServerKeyPair};
    use tokio::net::TcpStream;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite};

    use super::*;

    type Peer = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn connect() -> Peer {
        let ring = Arc::new(KeyRing::new(
            "example.org",
            Arc::new(ServerKeyPair::generate()),
            Duration::from_secs(86_400),
        ));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = build_router(Arc::new(FederationService::new(ring)));
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let (peer, _) = connect_async(format!("ws://{addr}{FEDERATION_PATH}")).await.unwrap();
        peer
    }

    async fn send(peer: &mut Peer, frame: Frame) {
        peer.send(tungstenite::Message::Text(frame.to_text().unwrap().into())).await.unwrap();
    }

    async fn recv(peer: &mut Peer) -> Frame {
        loop {
            match peer.next().await.unwrap().unwrap() {
                tungstenite::Message::Text(text) => return Frame::from_text(text.as_str()).unwrap(),
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn get_version_and_stubs() {
        let mut peer = connect().await;

        send(&mut peer, Frame::GetVersion { call_id: 1 }).await;
        match recv(&mut peer).await {
            Frame::Version { call_id, version } => {
                assert_eq!(call_id, 1);
                assert_eq!(version.version, env!("CARGO_PKG_VERSION"));
            }
            other => panic!("unexpected {other:?}"),
        }

        send(&mut peer, Frame::SendTransactions { call_id: 2 }).await;
        assert_eq!(recv(&mut peer).await, Frame::Return { call_id: 2 });
        send(&mut peer, Frame::Backfill { call_id: 3 }).await;
        assert_eq!(recv(&mut peer).await, Frame::Return { call_id: 3 });
    }

    #[tokio::test]
    async fn writes_wait_for_acks_and_refuse_overlapping_calls() {
        let mut peer = connect().await;
        send(&mut peer, Frame::GetKeys { call_id: 1 }).await;

        let Frame::Write { seq: 0, value, .. } = recv(&mut peer).await else {
            panic!("expected the first write");
        };
        assert_eq!(value.payload().kind(), "metadata");

        // Nothing more arrives until the write is acked; a second call is refused.
        send(&mut peer, Frame::GetVersion { call_id: 2 }).await;
        match recv(&mut peer).await {
            Frame::Error { call_id, kind, .. } => {
                assert_eq!(call_id, 2);
                assert_eq!(kind, "CALL_IN_PROGRESS");
            }
            other => panic!("unexpected {other:?}"),
        }

        send(&mut peer, Frame::Ack { call_id: 1, seq: 0 }).await;
        let Frame::Write { seq: 1, value, .. } = recv(&mut peer).await else {
            panic!("expected the second write");
        };
        assert_eq!(value.payload().kind(), "verify_keys");
        send(&mut peer, Frame::Ack { call_id: 1, seq: 1 }).await;

        assert_eq!(recv(&mut peer).await, Frame::Done { call_id: 1 });
        send(&mut peer, Frame::Ack { call_id: 1, seq: 2 }).await;
        assert_eq!(recv(&mut peer).await, Frame::Return { call_id: 1 });
    }

    #[tokio::test]
    async fn malformed_frame_mid_stream_is_dropped() {
        let mut peer = connect().await;
        send(&mut peer, Frame::GetKeys { call_id: 4 }).await;
        assert!(matches!(recv(&mut peer).await, Frame::Write { seq: 0, .. }));

        peer.send(tungstenite::Message::Text("not a frame".to_owned().into())).await.unwrap();
        send(&mut peer, Frame::Ack { call_id: 4, seq: 0 }).await;
        assert!(matches!(recv(&mut peer).await, Frame::Write { seq: 1, .. }));
        send(&mut peer, Frame::Ack { call_id: 4, seq: 1 }).await;
        assert_eq!(recv(&mut peer).await, Frame::Done { call_id: 4 });
        send(&mut peer, Frame::Ack { call_id: 4, seq: 2 }).await;
        assert_eq!(recv(&mut peer).await, Frame::Return { call_id: 4 });
    }

    #[tokio::test]
    async fn out_of_order_ack_aborts_the_call() {
        let mut peer = connect().await;
        send(&mut peer, Frame::GetKeys { call_id: 9 }).await;
        assert!(matches!(recv(&mut peer).await, Frame::Write { seq: 0, .. }));

        send(&mut peer, Frame::Ack { call_id: 9, seq: 5 }).await;
        match recv(&mut peer).await {
            Frame::Error { call_id, kind, .. } => {
                assert_eq!(call_id, 9);
                assert_eq!(kind, "STREAM_ABORTED");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
