//! NIP-01 WebSocket server.

use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::{
    message::RelayMessage,
    relay::Relay,
    session::{Flow, Session},
};

/// Start a WebSocket server speaking the relay protocol.
pub async fn serve_ws(
    addr: SocketAddr,
    relay: Arc<Relay>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "websocket listening");
    axum::serve(
        listener,
        router(relay).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    Ok(())
}

fn router(relay: Arc<Relay>) -> Router {
    Router::new().route("/", get(handler)).with_state(relay)
}

/// Handle the HTTP upgrade and spawn the connection processor.
async fn handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(relay): State<Arc<Relay>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| process(socket, relay, peer))
}

/// Drive one connection: frames in through the session, replies out through a
/// writer task so slow clients never stall the read loop.
async fn process(socket: WebSocket, relay: Arc<Relay>, peer: SocketAddr) {
    info!(%peer, "connection opened");
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<RelayMessage>(relay.outbound_buffer);
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(Message::Text(msg.to_json())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut session = Session::new(relay, tx);
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                if session.dispatch(&text).await == Flow::Close {
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(%peer, error = %e, "read failed");
                break;
            }
        }
    }
    session.shutdown().await;
    let _ = writer.await;
    info!(%peer, "connection closed");
}
